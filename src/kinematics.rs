//! Leg geometry and the angle/point conversions built on it.
//!
//! Angles use the firmware convention: the hip rotates about the body
//! vertical, the thigh angle is measured down from horizontal and the knee
//! angle is the downward bend relative to the thigh. The leg frame has x
//! pointing out of the body through the hip pivot and z up.

use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f32::consts::FRAC_PI_2;
use std::fs;
use std::path::Path;

use crate::error::StriderResult;
use crate::hexapod::{JointId, LegId};

/// Measured geometry overrides keyed by leg number, loaded from the files
/// named in the settings.
pub type GeometryTable = BTreeMap<u8, LegGeometry>;

/// Firmware register index for each joint geometry parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GeometryField {
    CylinderMin = 0,
    CylinderMax = 1,
    TriangleA = 2,
    TriangleB = 3,
    ZeroAngle = 4,
    RestAngle = 5,
    Length = 6,
    MinAngle = 7,
    MaxAngle = 8,
}

impl GeometryField {
    pub const ALL: [GeometryField; 9] = [
        GeometryField::CylinderMin,
        GeometryField::CylinderMax,
        GeometryField::TriangleA,
        GeometryField::TriangleB,
        GeometryField::ZeroAngle,
        GeometryField::RestAngle,
        GeometryField::Length,
        GeometryField::MinAngle,
        GeometryField::MaxAngle,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Geometry of one hydraulic joint, uploaded to the firmware at session
/// start and invariant afterwards. Lengths are in inches, angles in radians.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JointGeometry {
    pub cylinder_min: f32,
    pub cylinder_max: f32,
    pub triangle_a: f32,
    pub triangle_b: f32,
    pub zero_angle: f32,
    pub rest_angle: f32,
    pub length: f32,
    pub min_angle: f32,
    pub max_angle: f32,
}

impl JointGeometry {
    pub fn field(&self, field: GeometryField) -> f32 {
        match field {
            GeometryField::CylinderMin => self.cylinder_min,
            GeometryField::CylinderMax => self.cylinder_max,
            GeometryField::TriangleA => self.triangle_a,
            GeometryField::TriangleB => self.triangle_b,
            GeometryField::ZeroAngle => self.zero_angle,
            GeometryField::RestAngle => self.rest_angle,
            GeometryField::Length => self.length,
            GeometryField::MinAngle => self.min_angle,
            GeometryField::MaxAngle => self.max_angle,
        }
    }

    pub fn midpoint(&self) -> f32 {
        (self.min_angle + self.max_angle) / 2.0
    }

    pub fn half_range(&self) -> f32 {
        (self.max_angle - self.min_angle) / 2.0
    }

    /// Returns the clamped angle and whether clamping was needed.
    pub fn clamp(&self, angle: f32) -> (f32, bool) {
        if angle < self.min_angle {
            (self.min_angle, true)
        } else if angle > self.max_angle {
            (self.max_angle, true)
        } else {
            (angle, false)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LegGeometry {
    pub leg: LegId,
    pub hip: JointGeometry,
    pub thigh: JointGeometry,
    pub knee: JointGeometry,
    /// Closest the foot may come to the hip pivot, measured horizontally.
    pub min_hip_distance: f32,
}

impl LegGeometry {
    pub fn for_leg(leg: LegId) -> Self {
        LegGeometry {
            leg,
            hip: JointGeometry {
                cylinder_min: 16.0,
                cylinder_max: 24.0,
                triangle_a: 10.4,
                triangle_b: 19.9,
                zero_angle: 0.32,
                rest_angle: 0.0,
                length: 11.0,
                min_angle: -0.7,
                max_angle: 0.7,
            },
            thigh: JointGeometry {
                cylinder_min: 24.0,
                cylinder_max: 38.1,
                triangle_a: 13.8,
                triangle_b: 27.8,
                zero_angle: 0.54,
                rest_angle: 0.0,
                length: 29.0,
                min_angle: -1.0,
                max_angle: 1.3,
            },
            knee: JointGeometry {
                cylinder_min: 20.0,
                cylinder_max: 30.5,
                triangle_a: 7.2,
                triangle_b: 25.6,
                zero_angle: 2.62,
                rest_angle: 1.545,
                length: 40.0,
                min_angle: 0.2,
                max_angle: 2.6,
            },
            min_hip_distance: 16.0,
        }
    }

    /// Load a measured geometry override from a toml file.
    pub fn load(path: &Path) -> StriderResult<LegGeometry> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn joint(&self, joint: JointId) -> &JointGeometry {
        match joint {
            JointId::Hip => &self.hip,
            JointId::Thigh => &self.thigh,
            JointId::Knee => &self.knee,
        }
    }

    pub fn rest_angles(&self) -> (f32, f32, f32) {
        (
            self.hip.rest_angle,
            self.thigh.rest_angle,
            self.knee.rest_angle,
        )
    }

    pub fn rest_point(&self) -> Point3<f32> {
        let (hip, thigh, knee) = self.rest_angles();
        self.angles_to_point(hip, thigh, knee)
    }

    /// Leg frame center the restriction engine steers the foot towards.
    pub fn center(&self) -> Point2<f32> {
        let rest = self.rest_point();
        Point2::new(rest.x, rest.y)
    }

    /// Forward kinematics: joint angles to the foot point in the leg frame.
    pub fn angles_to_point(&self, hip: f32, thigh: f32, knee: f32) -> Point3<f32> {
        let reach = self.thigh.length * thigh.cos() + self.knee.length * (thigh + knee).cos();
        let horizontal = self.hip.length + reach;
        let z = -self.thigh.length * thigh.sin() - self.knee.length * (thigh + knee).sin();
        Point3::new(horizontal * hip.cos(), horizontal * hip.sin(), z)
    }

    /// Inverse kinematics: foot point in the leg frame to joint angles.
    ///
    /// Out of reach points produce the closest straightened pose; the joint
    /// limit check downstream is responsible for flagging those.
    pub fn point_to_angles(&self, point: &Point3<f32>) -> (f32, f32, f32) {
        let hip = point.y.atan2(point.x);
        let horizontal = (point.x * point.x + point.y * point.y).sqrt() - self.hip.length;
        let distance = (horizontal * horizontal + point.z * point.z).sqrt();
        let knee_interior = cosine_angle(distance, self.thigh.length, self.knee.length);
        let knee = std::f32::consts::PI - knee_interior;
        let below_horizontal = (-point.z).atan2(horizontal);
        let thigh_offset = cosine_angle(self.knee.length, self.thigh.length, distance);
        let thigh = below_horizontal - thigh_offset;
        (hip, thigh, knee)
    }

    /// Clamp all three joints, returning the clamped angles and whether any
    /// joint had to be limited.
    pub fn clamp_angles(&self, angles: (f32, f32, f32)) -> ((f32, f32, f32), bool) {
        let (hip, hip_clamped) = self.hip.clamp(angles.0);
        let (thigh, thigh_clamped) = self.thigh.clamp(angles.1);
        let (knee, knee_clamped) = self.knee.clamp(angles.2);
        (
            (hip, thigh, knee),
            hip_clamped || thigh_clamped || knee_clamped,
        )
    }

    /// Angle of the calf link away from vertical, in radians.
    pub fn calf_vertical_angle(&self, thigh: f32, knee: f32) -> f32 {
        (FRAC_PI_2 - (thigh + knee)).abs()
    }
}

// law of cosines for the angle opposite side a, clamped against round off
// and out of reach targets
fn cosine_angle(a: f32, b: f32, c: f32) -> f32 {
    let upper = b * b + c * c - a * a;
    let bottom = 2.0 * b * c;
    (upper / bottom).clamp(-1.0, 1.0).acos()
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn geometry() -> LegGeometry {
        LegGeometry::for_leg(LegId::FrontLeft)
    }

    #[test]
    fn forward_and_inverse_agree() {
        let geometry = geometry();
        for point in [
            Point3::new(40.0, 0.0, -40.0),
            Point3::new(41.0, 0.0, -40.0),
            Point3::new(48.0, -4.5, -28.0),
            Point3::new(30.0, 8.0, -35.0),
        ] {
            let (hip, thigh, knee) = geometry.point_to_angles(&point);
            let round_trip = geometry.angles_to_point(hip, thigh, knee);
            assert_relative_eq!(point.x, round_trip.x, epsilon = 1e-3);
            assert_relative_eq!(point.y, round_trip.y, epsilon = 1e-3);
            assert_relative_eq!(point.z, round_trip.z, epsilon = 1e-3);
        }
    }

    #[test]
    fn working_pose_is_inside_limits() {
        let geometry = geometry();
        let angles = geometry.point_to_angles(&Point3::new(40.0, 0.0, -40.0));
        let (_, clamped) = geometry.clamp_angles(angles);
        assert!(!clamped);
    }

    #[test]
    fn out_of_reach_point_straightens_and_clamps() {
        let geometry = geometry();
        let angles = geometry.point_to_angles(&Point3::new(100.0, 0.0, -40.0));
        // knee straightens past its minimum bend
        assert!(angles.2 < geometry.knee.min_angle);
        let (clamped_angles, clamped) = geometry.clamp_angles(angles);
        assert!(clamped);
        assert_relative_eq!(clamped_angles.2, geometry.knee.min_angle);
    }

    #[test]
    fn calf_is_near_vertical_at_rest() {
        let geometry = geometry();
        let (_, thigh, knee) = geometry.rest_angles();
        let angle = geometry.calf_vertical_angle(thigh, knee);
        assert!(angle.to_degrees() < 2.0);
    }

    #[test]
    fn geometry_loads_from_a_measured_file() {
        let geometry = geometry();
        let path = std::env::temp_dir().join("strider_leg_geometry_test.toml");
        std::fs::write(&path, toml::to_string(&geometry).unwrap()).unwrap();
        let loaded = LegGeometry::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(geometry, loaded);
    }

    #[test]
    fn rest_point_is_in_the_working_area() {
        let rest = geometry().rest_point();
        assert!(rest.x > 35.0 && rest.x < 45.0);
        assert_relative_eq!(rest.y, 0.0, epsilon = 1e-5);
        assert!(rest.z < -35.0 && rest.z > -45.0);
    }
}
