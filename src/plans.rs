//! Motion plans addressed to a single leg.
//!
//! A plan is immutable once built. Packing flattens it into the scalar list
//! the firmware plan command expects; body frame plans are rewritten into
//! the target leg's frame during packing so the firmware only ever sees
//! sensor, joint or leg frames.

use nalgebra::{Matrix3, Matrix3x4, Point3, Rotation3, Unit, Vector3};

use crate::error::{StriderError, StriderResult};
use crate::hexapod::LegId;

pub const STOP_MODE: u8 = 0;
pub const VELOCITY_MODE: u8 = 1;
pub const ARC_MODE: u8 = 2;
pub const TARGET_MODE: u8 = 3;
pub const MATRIX_MODE: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Frame {
    Sensor = 0,
    Joint = 1,
    Leg = 2,
    Body = 3,
}

impl Frame {
    pub fn from_byte(byte: u8) -> Option<Frame> {
        match byte {
            0 => Some(Frame::Sensor),
            1 => Some(Frame::Joint),
            2 => Some(Frame::Leg),
            3 => Some(Frame::Body),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    Stop {
        frame: Frame,
        speed: f32,
    },
    Velocity {
        frame: Frame,
        linear: Vector3<f32>,
        speed: f32,
    },
    Arc {
        frame: Frame,
        linear: Vector3<f32>,
        angular: Vector3<f32>,
        speed: f32,
    },
    Target {
        frame: Frame,
        linear: Vector3<f32>,
        speed: f32,
    },
    Matrix {
        frame: Frame,
        matrix: Matrix3x4<f32>,
        speed: f32,
    },
}

impl Plan {
    pub fn stop() -> Plan {
        Plan::Stop {
            frame: Frame::Leg,
            speed: 0.0,
        }
    }

    pub fn mode(&self) -> u8 {
        match self {
            Plan::Stop { .. } => STOP_MODE,
            Plan::Velocity { .. } => VELOCITY_MODE,
            Plan::Arc { .. } => ARC_MODE,
            Plan::Target { .. } => TARGET_MODE,
            Plan::Matrix { .. } => MATRIX_MODE,
        }
    }

    pub fn frame(&self) -> Frame {
        match self {
            Plan::Stop { frame, .. }
            | Plan::Velocity { frame, .. }
            | Plan::Arc { frame, .. }
            | Plan::Target { frame, .. }
            | Plan::Matrix { frame, .. } => *frame,
        }
    }

    pub fn speed(&self) -> f32 {
        match self {
            Plan::Stop { speed, .. }
            | Plan::Velocity { speed, .. }
            | Plan::Arc { speed, .. }
            | Plan::Target { speed, .. }
            | Plan::Matrix { speed, .. } => *speed,
        }
    }

    /// Rewrite a body frame plan into the given leg's frame. Plans in any
    /// other frame are returned unchanged.
    pub fn in_leg_frame(&self, leg: LegId) -> Plan {
        if self.frame() != Frame::Body {
            return self.clone();
        }
        let rotation = body_to_leg_rotation(leg);
        match self {
            Plan::Stop { speed, .. } => Plan::Stop {
                frame: Frame::Leg,
                speed: *speed,
            },
            Plan::Velocity { linear, speed, .. } => Plan::Velocity {
                frame: Frame::Leg,
                linear: rotation * linear,
                speed: *speed,
            },
            Plan::Target { linear, speed, .. } => Plan::Target {
                frame: Frame::Leg,
                linear: rotation * linear,
                speed: *speed,
            },
            Plan::Arc {
                linear,
                angular,
                speed,
                ..
            } => Plan::Arc {
                frame: Frame::Leg,
                linear: rotation * linear,
                angular: rotation * angular,
                speed: *speed,
            },
            Plan::Matrix { matrix, speed, .. } => {
                let rot: Matrix3<f32> = rotation.into_inner();
                let affine = matrix.fixed_slice::<3, 3>(0, 0).into_owned();
                let translation: Vector3<f32> = matrix.column(3).into_owned();
                let affine = rot * affine * rot.transpose();
                let translation = rot * translation;
                Plan::Matrix {
                    frame: Frame::Leg,
                    matrix: Matrix3x4::from_columns(&[
                        affine.column(0).into_owned(),
                        affine.column(1).into_owned(),
                        affine.column(2).into_owned(),
                        translation,
                    ]),
                    speed: *speed,
                }
            }
        }
    }

    /// Flatten into the scalar list sent over the wire, rewriting body
    /// frame plans into the leg frame first.
    pub fn pack(&self, leg: LegId) -> PackedPlan {
        let plan = self.in_leg_frame(leg);
        let mut values = vec![plan.mode() as f32, plan.frame().as_byte() as f32];
        match &plan {
            Plan::Stop { .. } => {}
            Plan::Velocity { linear, .. } | Plan::Target { linear, .. } => {
                values.extend_from_slice(&[linear.x, linear.y, linear.z]);
            }
            Plan::Arc {
                linear, angular, ..
            } => {
                values.extend_from_slice(&[linear.x, linear.y, linear.z]);
                values.extend_from_slice(&[angular.x, angular.y, angular.z]);
            }
            Plan::Matrix { matrix, .. } => {
                for row in 0..3 {
                    for column in 0..4 {
                        values.push(matrix[(row, column)]);
                    }
                }
            }
        }
        values.push(plan.speed());
        PackedPlan { values }
    }
}

/// Plan flattened into the scalar list of the firmware plan command.
#[derive(Debug, Clone, PartialEq)]
pub struct PackedPlan {
    pub values: Vec<f32>,
}

impl PackedPlan {
    pub fn unpack(&self) -> StriderResult<Plan> {
        let values = &self.values;
        if values.len() < 3 {
            return Err(StriderError::MalformedMessage(format!(
                "packed plan too short: {} values",
                values.len()
            )));
        }
        let mode = values[0] as u8;
        let frame = Frame::from_byte(values[1] as u8).ok_or_else(|| {
            StriderError::MalformedMessage(format!("bad plan frame {}", values[1]))
        })?;
        let expected = match mode {
            STOP_MODE => 3,
            VELOCITY_MODE | TARGET_MODE => 6,
            ARC_MODE => 9,
            MATRIX_MODE => 15,
            other => {
                return Err(StriderError::MalformedMessage(format!(
                    "bad plan mode {other}"
                )))
            }
        };
        if values.len() != expected {
            return Err(StriderError::MalformedMessage(format!(
                "plan mode {} wants {} values, got {}",
                mode,
                expected,
                values.len()
            )));
        }
        let speed = values[expected - 1];
        let plan = match mode {
            STOP_MODE => Plan::Stop { frame, speed },
            VELOCITY_MODE => Plan::Velocity {
                frame,
                linear: Vector3::new(values[2], values[3], values[4]),
                speed,
            },
            TARGET_MODE => Plan::Target {
                frame,
                linear: Vector3::new(values[2], values[3], values[4]),
                speed,
            },
            ARC_MODE => Plan::Arc {
                frame,
                linear: Vector3::new(values[2], values[3], values[4]),
                angular: Vector3::new(values[5], values[6], values[7]),
                speed,
            },
            _ => Plan::Matrix {
                frame,
                matrix: Matrix3x4::from_row_slice(&values[2..14]),
                speed,
            },
        };
        Ok(plan)
    }
}

/// Rotation taking body frame vectors into the given leg's frame.
pub fn body_to_leg_rotation(leg: LegId) -> Rotation3<f32> {
    Rotation3::from_axis_angle(&Vector3::z_axis(), -leg.mount_angle())
}

/// Advance a foot position one step along a leg frame plan.
///
/// Matrix plans apply their transform exactly once per call; pacing them to
/// the firmware plan tick is the caller's job (see [`TickAccumulator`]).
pub fn follow(xyz: Point3<f32>, plan: &Plan, dt: f32) -> Point3<f32> {
    match plan {
        Plan::Stop { .. } => xyz,
        Plan::Velocity { linear, speed, .. } => xyz + linear * (speed * dt),
        Plan::Target { linear, speed, .. } => {
            let target = Point3::from(*linear);
            let delta = target - xyz;
            let distance = delta.norm();
            let step = speed.abs() * dt;
            if distance <= step || distance == 0.0 {
                target
            } else {
                xyz + delta * (step / distance)
            }
        }
        Plan::Arc {
            linear,
            angular,
            speed,
            ..
        } => {
            let rotated = match Unit::try_new(*angular, 1e-9) {
                Some(axis) => Rotation3::from_axis_angle(&axis, speed * dt) * xyz,
                None => xyz,
            };
            rotated + linear * (speed * dt)
        }
        Plan::Matrix { matrix, .. } => {
            let affine = matrix.fixed_slice::<3, 3>(0, 0);
            let translation: Vector3<f32> = matrix.column(3).into_owned();
            Point3::from(affine * xyz.coords + translation)
        }
    }
}

/// Accumulates wall time and releases it in whole firmware plan ticks,
/// carrying the remainder.
#[derive(Debug, Default, Clone, Copy)]
pub struct TickAccumulator {
    residual: f32,
}

impl TickAccumulator {
    pub fn new() -> Self {
        TickAccumulator::default()
    }

    pub fn advance(&mut self, dt: f32, tick: f32) -> u32 {
        if tick <= 0.0 {
            return 0;
        }
        self.residual += dt;
        let ticks = (self.residual / tick).floor();
        self.residual -= ticks * tick;
        ticks as u32
    }

    pub fn residual(&self) -> f32 {
        self.residual
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use std::f32::consts::FRAC_PI_2;

    use super::*;

    #[test]
    fn stop_never_moves() {
        let xyz = Point3::new(40.0, 1.5, -40.0);
        for dt in [0.0, 0.025, 0.1, 3.0] {
            assert_eq!(follow(xyz, &Plan::stop(), dt), xyz);
        }
    }

    #[test]
    fn velocity_integrates_linearly() {
        let plan = Plan::Velocity {
            frame: Frame::Leg,
            linear: Vector3::new(1.0, 0.0, 0.0),
            speed: 2.0,
        };
        let moved = follow(Point3::new(40.0, 0.0, -40.0), &plan, 0.5);
        assert_relative_eq!(moved.x, 41.0);
        assert_relative_eq!(moved.y, 0.0);
        assert_relative_eq!(moved.z, -40.0);
    }

    #[test]
    fn target_does_not_overshoot() {
        let plan = Plan::Target {
            frame: Frame::Leg,
            linear: Vector3::new(41.0, 0.0, -40.0),
            speed: 10.0,
        };
        let start = Point3::new(40.0, 0.0, -40.0);
        let part_way = follow(start, &plan, 0.05);
        assert_relative_eq!(part_way.x, 40.5);
        let arrived = follow(start, &plan, 10.0);
        assert_relative_eq!(arrived.x, 41.0);
        // staying put once there
        let still = follow(arrived, &plan, 1.0);
        assert_relative_eq!(still.x, 41.0);
    }

    #[test]
    fn arc_rotates_about_axis_then_translates() {
        let plan = Plan::Arc {
            frame: Frame::Leg,
            linear: Vector3::new(0.0, 0.0, 1.0),
            angular: Vector3::new(0.0, 0.0, 1.0),
            speed: FRAC_PI_2,
        };
        let moved = follow(Point3::new(1.0, 0.0, 0.0), &plan, 1.0);
        assert_relative_eq!(moved.x, 0.0, epsilon = 1e-6);
        assert_relative_eq!(moved.y, 1.0, epsilon = 1e-6);
        assert_relative_eq!(moved.z, FRAC_PI_2, epsilon = 1e-6);
    }

    #[test]
    fn packed_plans_round_trip() {
        let plans = [
            Plan::stop(),
            Plan::Velocity {
                frame: Frame::Leg,
                linear: Vector3::new(0.1, -0.2, 0.3),
                speed: 1.25,
            },
            Plan::Target {
                frame: Frame::Leg,
                linear: Vector3::new(40.0, 2.0, -40.0),
                speed: 8.0,
            },
            Plan::Arc {
                frame: Frame::Leg,
                linear: Vector3::new(1.0, 0.0, 0.0),
                angular: Vector3::new(0.0, 0.0, -1.0),
                speed: 0.5,
            },
            Plan::Matrix {
                frame: Frame::Leg,
                matrix: Matrix3x4::from_row_slice(&[
                    1.0, 0.0, 0.0, 0.5, 0.0, 1.0, 0.0, -0.25, 0.0, 0.0, 1.0, 0.125,
                ]),
                speed: 1.0,
            },
        ];
        for plan in plans {
            let unpacked = plan.pack(LegId::FrontLeft).unpack().unwrap();
            assert_eq!(plan, unpacked);
        }
    }

    #[test]
    fn body_frame_packs_into_leg_frame() {
        let plan = Plan::Velocity {
            frame: Frame::Body,
            linear: Vector3::new(1.0, 0.0, 0.0),
            speed: 1.0,
        };
        let unpacked = plan.pack(LegId::MiddleLeft).unpack().unwrap();
        match unpacked {
            Plan::Velocity { frame, linear, .. } => {
                assert_eq!(frame, Frame::Leg);
                // middle left leg points along body +y, so body +x is leg -y
                assert_relative_eq!(linear.x, 0.0, epsilon = 1e-6);
                assert_relative_eq!(linear.y, -1.0, epsilon = 1e-6);
                assert_relative_eq!(linear.z, 0.0, epsilon = 1e-6);
            }
            other => panic!("expected velocity plan, got {other:?}"),
        }
    }

    #[test]
    fn matrix_rewrite_preserves_vertical_translation() {
        let plan = Plan::Matrix {
            frame: Frame::Body,
            matrix: Matrix3x4::from_row_slice(&[
                1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, -2.0,
            ]),
            speed: 1.0,
        };
        let rewritten = plan.in_leg_frame(LegId::RearRight);
        match rewritten {
            Plan::Matrix { frame, matrix, .. } => {
                assert_eq!(frame, Frame::Leg);
                // pure z translation is invariant under the yaw rewrite
                assert_relative_eq!(matrix[(2, 3)], -2.0, epsilon = 1e-6);
                assert_relative_eq!(matrix[(0, 3)], 0.0, epsilon = 1e-6);
            }
            other => panic!("expected matrix plan, got {other:?}"),
        }
    }

    #[test]
    fn tick_accumulator_quantizes_and_carries_remainder() {
        let mut accumulator = TickAccumulator::new();
        let ticks = accumulator.advance(0.06, 0.025);
        assert_eq!(ticks, 2);
        assert_relative_eq!(accumulator.residual(), 0.010, epsilon = 1e-6);
        // the carried remainder counts towards the next advance
        let ticks = accumulator.advance(0.02, 0.025);
        assert_eq!(ticks, 1);
        assert_relative_eq!(accumulator.residual(), 0.005, epsilon = 1e-6);
    }
}
