//! Plan following kinematic simulation of one leg.
//!
//! Stands in for a controller board when running without hardware: follows
//! the active plan, enforces joint limits (raising a hold e-stop on
//! violation) and emits synthetic telemetry at a fixed cadence.

use std::time::{Duration, Instant};

use nalgebra::Point3;
use rand::Rng;
use tracing::debug;

use super::{
    ConfigStep, JointAngles, JointPidConfig, LegController, LegCore, LegEvent, LegEventKind,
    Stamped, Telemetry,
};
use crate::error::{StriderError, StriderResult};
use crate::hexapod::{EstopSeverity, JointId, LegId};
use crate::kinematics::LegGeometry;
use crate::plans::{follow, Frame, PackedPlan, Plan, TickAccumulator, STOP_MODE};
use crate::signals::Signals;

/// Minimum wall time between simulated ticks.
const SIM_TICK: Duration = Duration::from_millis(100);
/// Fake ground reaction, pounds per inch of penetration.
const GROUND_SPRING: f32 = 300.0;

pub struct SimLeg {
    core: LegCore,
    active: Option<Plan>,
    plan_tick: f32,
    matrix_ticks: TickAccumulator,
    last_update: Instant,
    position: Point3<f32>,
    angles: (f32, f32, f32),
    calf_load: f32,
    /// Height of the fake ground plane under this foot.
    ground_z: f32,
    /// Per axis position noise amplitude in inches, zero disables it.
    pub position_noise: f32,
}

impl SimLeg {
    pub fn new(leg: LegId, plan_tick: Duration, now: Instant) -> SimLeg {
        SimLeg::with_geometry(LegGeometry::for_leg(leg), plan_tick, now)
    }

    /// Simulate a leg with measured geometry instead of the defaults.
    pub fn with_geometry(geometry: LegGeometry, plan_tick: Duration, now: Instant) -> SimLeg {
        let mut core = LegCore::new(geometry, now);
        let position = core.geometry.rest_point();
        let angles = core.geometry.rest_angles();
        core.telemetry.xyz = Stamped::new(position, now);
        core.telemetry.angles = Stamped::new(
            JointAngles {
                hip: angles.0,
                thigh: angles.1,
                knee: angles.2,
                calf_load: 0.0,
                valid: true,
            },
            now,
        );
        core.set_estop(EstopSeverity::default());
        SimLeg {
            core,
            active: None,
            plan_tick: plan_tick.as_secs_f32(),
            matrix_ticks: TickAccumulator::new(),
            last_update: now,
            position,
            angles,
            calf_load: 0.0,
            ground_z: position.z,
            position_noise: 0.0,
        }
    }

    /// Place the foot somewhere specific, recomputing joint angles.
    pub fn set_position(&mut self, position: Point3<f32>) {
        self.position = position;
        self.angles = self.core.geometry.point_to_angles(&position);
        self.core.telemetry.xyz.value = position;
        let angles = &mut self.core.telemetry.angles.value;
        angles.hip = self.angles.0;
        angles.thigh = self.angles.1;
        angles.knee = self.angles.2;
    }

    pub fn position(&self) -> Point3<f32> {
        self.position
    }

    fn accept_plan(&mut self, packed: &PackedPlan) -> StriderResult<()> {
        let plan = packed.unpack()?;
        if plan.mode() != STOP_MODE && plan.frame() != Frame::Leg {
            return Err(StriderError::UnsupportedPlanFrame(plan.frame()));
        }
        self.active = Some(plan);
        Ok(())
    }

    fn advance(&mut self, dt: f32) {
        if !self.core.estop_severity().motion_allowed() {
            return;
        }
        let Some(plan) = self.active.clone() else {
            return;
        };
        let mut position = self.position;
        if let Plan::Matrix { .. } = plan {
            // firmware applies the transform once per plan tick, so only
            // whole ticks advance and the remainder carries over
            let ticks = self.matrix_ticks.advance(dt, self.plan_tick);
            for _ in 0..ticks {
                position = follow(position, &plan, self.plan_tick);
            }
        } else {
            position = follow(position, &plan, dt);
        }
        if self.position_noise != 0.0 {
            let mut rng = rand::thread_rng();
            for axis in 0..3 {
                position[axis] += rng.gen_range(-self.position_noise..self.position_noise);
            }
        }
        let angles = self.core.geometry.point_to_angles(&position);
        let (clamped, limited) = self.core.geometry.clamp_angles(angles);
        if limited {
            position = self
                .core
                .geometry
                .angles_to_point(clamped.0, clamped.1, clamped.2);
            self.core.set_estop(EstopSeverity::Hold);
            self.active = None;
        }
        self.calf_load = (self.ground_z - position.z).max(0.0) * GROUND_SPRING;
        self.position = position;
        self.angles = clamped;
    }
}

impl LegController for SimLeg {
    fn leg(&self) -> LegId {
        self.core.leg
    }

    fn geometry(&self) -> LegGeometry {
        self.core.geometry
    }

    fn signals(&self) -> Signals<LegEventKind, LegEvent> {
        self.core.signals.clone()
    }

    fn telemetry(&self) -> Telemetry {
        self.core.telemetry.clone()
    }

    fn estop(&self) -> EstopSeverity {
        self.core.estop_severity()
    }

    fn set_estop(&mut self, severity: EstopSeverity) -> StriderResult<()> {
        if self.core.set_estop(severity) && severity.latching() {
            self.active = None;
        }
        Ok(())
    }

    fn send_plan(&mut self, plan: &Plan) -> StriderResult<()> {
        let packed = self.core.record_plan(plan);
        self.accept_plan(&packed)
    }

    fn set_pwm(&mut self, hip: f32, thigh: f32, knee: f32) -> StriderResult<()> {
        if self.estop().motion_allowed() {
            return Err(StriderError::PwmOverrideUnsafe);
        }
        self.core.emit(LegEvent::SetPwm([hip, thigh, knee]));
        Ok(())
    }

    fn enable_pid(&mut self, enabled: bool) -> StriderResult<()> {
        debug!("sim leg {} enable_pid {}", self.core.leg.number(), enabled);
        Ok(())
    }

    fn configure(&mut self, steps: &[ConfigStep]) -> StriderResult<()> {
        debug!("sim leg {} configure {:?}", self.core.leg.number(), steps);
        Ok(())
    }

    fn pid_joint_config(&mut self, _joint: JointId) -> StriderResult<JointPidConfig> {
        Ok(JointPidConfig::default())
    }

    fn poll(&mut self, now: Instant) -> StriderResult<Vec<LegEvent>> {
        let dt = now.duration_since(self.last_update).as_secs_f32();
        if dt >= SIM_TICK.as_secs_f32() {
            self.advance(dt);
            self.last_update = now;

            let telemetry = &mut self.core.telemetry;
            telemetry.adc.at = now;
            telemetry.pwm.at = now;
            telemetry.pid.at = now;
            telemetry.angles = Stamped::new(
                JointAngles {
                    hip: self.angles.0,
                    thigh: self.angles.1,
                    knee: self.angles.2,
                    calf_load: self.calf_load,
                    valid: true,
                },
                now,
            );
            telemetry.xyz = Stamped::new(self.position, now);

            let adc = telemetry.adc;
            let pwm = telemetry.pwm;
            let pid = telemetry.pid;
            let angles = telemetry.angles;
            let xyz = telemetry.xyz;
            self.core.emit(LegEvent::Adc(adc));
            self.core.emit(LegEvent::Pwm(pwm));
            self.core.emit(LegEvent::Pid(pid));
            self.core.emit(LegEvent::Angles(angles));
            self.core.emit(LegEvent::Xyz(xyz));
        }
        Ok(self.core.drain())
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::Vector3;
    use std::time::Duration;

    use super::*;
    use crate::plans::Frame;

    fn estop_events(events: &[LegEvent]) -> Vec<EstopSeverity> {
        events
            .iter()
            .filter_map(|event| match event {
                LegEvent::Estop(severity) => Some(*severity),
                _ => None,
            })
            .collect()
    }

    fn sim_at_start() -> (SimLeg, Instant) {
        let start = Instant::now();
        let mut sim = SimLeg::new(LegId::FrontLeft, Duration::from_millis(25), start);
        sim.set_position(Point3::new(40.0, 0.0, -40.0));
        (sim, start)
    }

    #[test]
    fn default_estop_is_hard() {
        let (mut sim, start) = sim_at_start();
        assert_eq!(sim.estop(), EstopSeverity::Hard);
        let events = sim.poll(start + Duration::from_millis(1)).unwrap();
        assert_eq!(estop_events(&events), vec![EstopSeverity::Hard]);
    }

    #[test]
    fn set_estop_is_idempotent() {
        let (mut sim, start) = sim_at_start();
        sim.poll(start + Duration::from_millis(1)).unwrap();
        sim.set_estop(EstopSeverity::Soft).unwrap();
        sim.set_estop(EstopSeverity::Soft).unwrap();
        let events = sim.poll(start + Duration::from_millis(2)).unwrap();
        assert_eq!(estop_events(&events), vec![EstopSeverity::Soft]);
    }

    #[test]
    fn velocity_plan_moves_the_foot() {
        let (mut sim, start) = sim_at_start();
        sim.set_estop(EstopSeverity::Off).unwrap();
        sim.send_plan(&Plan::Velocity {
            frame: Frame::Leg,
            linear: Vector3::new(1.0, 0.0, 0.0),
            speed: 1.0,
        })
        .unwrap();
        let mut now = start;
        for _ in 0..10 {
            now += Duration::from_millis(100);
            sim.poll(now).unwrap();
        }
        let xyz = sim.telemetry().xyz.value;
        assert!((xyz.x - 41.0).abs() < 0.05, "x = {}", xyz.x);
        assert!((xyz.y).abs() < 0.01);
        assert!((xyz.z + 40.0).abs() < 0.01);
        assert_eq!(sim.estop(), EstopSeverity::Off);
    }

    #[test]
    fn joint_limit_clamp_raises_one_hold_and_freezes() {
        let (mut sim, start) = sim_at_start();
        sim.set_estop(EstopSeverity::Off).unwrap();
        sim.send_plan(&Plan::Velocity {
            frame: Frame::Leg,
            linear: Vector3::new(10.0, 0.0, 0.0),
            speed: 1.0,
        })
        .unwrap();

        let mut now = start;
        let mut holds = 0;
        let mut frozen_at = None;
        for _ in 0..100 {
            now += Duration::from_millis(100);
            let events = sim.poll(now).unwrap();
            holds += estop_events(&events)
                .iter()
                .filter(|severity| **severity == EstopSeverity::Hold)
                .count();
            if sim.estop() == EstopSeverity::Hold && frozen_at.is_none() {
                frozen_at = Some(sim.telemetry().xyz.value);
            }
        }
        assert_eq!(sim.estop(), EstopSeverity::Hold);
        // exactly one hold per clamp event, not one per tick
        assert_eq!(holds, 1);
        let frozen = frozen_at.unwrap();
        let fin = sim.telemetry().xyz.value;
        assert_eq!(frozen, fin);
    }

    #[test]
    fn matrix_plans_advance_in_whole_ticks() {
        let start = Instant::now();
        let mut sim = SimLeg::new(LegId::FrontLeft, Duration::from_millis(100), start);
        sim.set_position(Point3::new(40.0, 0.0, -40.0));
        sim.set_estop(EstopSeverity::Off).unwrap();
        // identity rotation with a small x step each tick
        sim.send_plan(&Plan::Matrix {
            frame: Frame::Leg,
            matrix: nalgebra::Matrix3x4::from_row_slice(&[
                1.0, 0.0, 0.0, 0.1, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0,
            ]),
            speed: 1.0,
        })
        .unwrap();

        // 0.15s of wall time with a 0.1s tick applies the transform once,
        // carrying 0.05s
        sim.poll(start + Duration::from_millis(150)).unwrap();
        let xyz = sim.telemetry().xyz.value;
        assert!((xyz.x - 40.1).abs() < 1e-3, "x = {}", xyz.x);
        // another 0.15s plus the carried remainder is exactly two ticks
        sim.poll(start + Duration::from_millis(300)).unwrap();
        let xyz = sim.telemetry().xyz.value;
        assert!((xyz.x - 40.3).abs() < 1e-3, "x = {}", xyz.x);
    }

    #[test]
    fn non_leg_frames_are_rejected() {
        let (mut sim, _) = sim_at_start();
        sim.set_estop(EstopSeverity::Off).unwrap();
        let result = sim.send_plan(&Plan::Velocity {
            frame: Frame::Joint,
            linear: Vector3::new(1.0, 0.0, 0.0),
            speed: 1.0,
        });
        assert!(matches!(
            result,
            Err(StriderError::UnsupportedPlanFrame(Frame::Joint))
        ));
        // body frame plans are fine, packing rewrites them into leg frame
        sim.send_plan(&Plan::Velocity {
            frame: Frame::Body,
            linear: Vector3::new(1.0, 0.0, 0.0),
            speed: 1.0,
        })
        .unwrap();
    }

    #[test]
    fn estopped_leg_does_not_move() {
        let (mut sim, start) = sim_at_start();
        sim.set_estop(EstopSeverity::Off).unwrap();
        sim.send_plan(&Plan::Velocity {
            frame: Frame::Leg,
            linear: Vector3::new(1.0, 0.0, 0.0),
            speed: 1.0,
        })
        .unwrap();
        sim.set_estop(EstopSeverity::Soft).unwrap();
        sim.poll(start + Duration::from_millis(200)).unwrap();
        let xyz = sim.telemetry().xyz.value;
        assert!((xyz.x - 40.0).abs() < 1e-6);
    }
}
