//! Restriction based gait: per foot workspace restriction, the foot state
//! machine and the body level coordinator that arbitrates lifts.
//!
//! A foot's restriction `r` is a scalar in [0, 1] summarizing how close it
//! is to a workspace boundary; `nr` is the same value evaluated one plan
//! tick ahead under the foot's current plan. The body lifts feet that grow
//! restricted and halts when one is pinned against a boundary.

pub mod body;
pub mod foot;
pub mod odometer;

use nalgebra::{Point2, Point3};

use crate::kinematics::LegGeometry;
use crate::param::{ParamStore, ParamValue};

/// Defaults for every `res.*` parameter, installed by the body coordinator.
pub const DEFAULT_PARAMETERS: &[(&str, ParamValue)] = &[
    // slow the stance plan down proportional to the most restricted leg
    ("speed_by_restriction", ParamValue::Bool(false)),
    // restriction at which a leg could be lifted
    ("r_thresh", ParamValue::Float(0.4)),
    // restriction at which lateral movement halts
    ("r_max", ParamValue::Float(0.8)),
    ("max_feet_up", ParamValue::Float(1.0)),
    // slop between actual and target body height, inches
    ("height_slop", ParamValue::Float(3.0)),
    // joint limit field shape
    ("fields.joint_angle.eps", ParamValue::Float(0.3)),
    ("fields.joint_angle.range", ParamValue::Float(0.9)),
    ("fields.joint_angle.inflection", ParamValue::Float(0.4)),
    // calf angle field shape
    ("fields.calf_angle.eps", ParamValue::Float(0.3)),
    ("fields.calf_angle.inflection", ParamValue::Float(0.4)),
    ("fields.calf_angle.max", ParamValue::Float(30.0)),
    // minimum foot to hip distance field shape
    ("fields.min_hip.eps", ParamValue::Float(0.15)),
    ("fields.min_hip.buffer", ParamValue::Float(10.0)),
    // distance from the leg center field shape
    ("fields.center.eps", ParamValue::Float(0.1)),
    ("fields.center.inflection", ParamValue::Float(5.0)),
    ("fields.center.radius", ParamValue::Float(30.0)),
    // calf angle from vertical when the foot stands at its center, degrees
    ("target_calf_angle", ParamValue::Float(10.0)),
    // swing apex clearance above the ground, inches
    ("lift_height", ParamValue::Float(12.0)),
    // target hip to ground height, inches
    ("lower_height", ParamValue::Float(-40.0)),
    ("min_lower_height", ParamValue::Float(-70.0)),
    ("max_lower_height", ParamValue::Float(-40.0)),
    // below this load a lifted leg is off the ground, pounds
    ("unloaded_weight", ParamValue::Float(600.0)),
    // above this load a lowering leg has touched down, pounds
    ("loaded_weight", ParamValue::Float(400.0)),
    // swing is done within this distance of its target, inches
    ("swing_slop", ParamValue::Float(5.0)),
    // ratio of the actual step to the maximum step
    ("step_ratio", ParamValue::Float(0.6)),
    // do not lift if relocating moves the foot less than this, inches
    ("min_step_size", ParamValue::Float(6.0)),
    // gait vertical rates, inches per second
    ("lift_velocity", ParamValue::Float(4.0)),
    ("lower_velocity", ParamValue::Float(4.0)),
    ("swing_velocity", ParamValue::Float(8.0)),
];

/// The four field functions making up a foot's restriction.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FieldValues {
    pub joint_angle: f64,
    pub calf_angle: f64,
    pub min_hip: f64,
    pub center: f64,
}

impl FieldValues {
    pub fn max(&self) -> f64 {
        self.joint_angle
            .max(self.calf_angle)
            .max(self.min_hip)
            .max(self.center)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Restriction {
    /// Max of the field values, clamped to [0, 1].
    pub r: f64,
    /// Restriction at the position one plan tick ahead.
    pub nr: f64,
    pub fields: FieldValues,
}

/// Where the body is going: a rotation about a ground point or a straight
/// translation, at a speed, with a vertical rate. Equality is structural.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BodyTarget {
    pub rotation_center: RotationCenter,
    pub speed: f32,
    pub dz: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RotationCenter {
    Translate,
    Point(Point2<f32>),
}

impl BodyTarget {
    pub fn translate(speed: f32, dz: f32) -> BodyTarget {
        BodyTarget {
            rotation_center: RotationCenter::Translate,
            speed,
            dz,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.speed == 0.0 && self.dz == 0.0
    }
}

// logistic shaping shared by all fields: ~0 well below the inflection,
// 0.5 at it, ~1 above
fn shaped(proximity: f64, inflection: f64, eps: f64) -> f64 {
    if eps <= 0.0 {
        return if proximity >= inflection { 1.0 } else { 0.0 };
    }
    1.0 / (1.0 + (-(proximity - inflection) / eps).exp())
}

/// Evaluate the four field functions for a foot at `xyz` with the given
/// joint angles. `center` is the leg frame point the foot is steered
/// towards, already including any body offset.
pub fn compute_fields(
    geometry: &LegGeometry,
    params: &ParamStore,
    center: Point2<f32>,
    xyz: Point3<f32>,
    angles: (f32, f32, f32),
) -> FieldValues {
    // joint angles against their limits, worst joint wins
    let range = params.float("res.fields.joint_angle.range");
    let mut joint_proximity: f64 = 0.0;
    for (angle, joint) in [
        (angles.0, &geometry.hip),
        (angles.1, &geometry.thigh),
        (angles.2, &geometry.knee),
    ] {
        let half = f64::from(joint.half_range()) * range;
        if half > 0.0 {
            let proximity = f64::from((angle - joint.midpoint()).abs()) / half;
            joint_proximity = joint_proximity.max(proximity);
        }
    }
    let joint_angle = shaped(
        joint_proximity,
        params.float("res.fields.joint_angle.inflection"),
        params.float("res.fields.joint_angle.eps"),
    );

    // calf deviation from vertical
    let calf_degrees = f64::from(geometry.calf_vertical_angle(angles.1, angles.2).to_degrees());
    let calf_max = params.float("res.fields.calf_angle.max").max(1e-6);
    let calf_angle = shaped(
        calf_degrees / calf_max,
        params.float("res.fields.calf_angle.inflection"),
        params.float("res.fields.calf_angle.eps"),
    );

    // horizontal distance from the hip pivot
    let buffer = params.float("res.fields.min_hip.buffer").max(1e-6);
    let hip_distance = f64::from((xyz.x * xyz.x + xyz.y * xyz.y).sqrt());
    let min_hip_proximity =
        (f64::from(geometry.min_hip_distance) + buffer - hip_distance) / buffer;
    let min_hip = shaped(
        min_hip_proximity,
        0.5,
        params.float("res.fields.min_hip.eps"),
    );

    // distance from the steering center
    let radius = params.float("res.fields.center.radius");
    let scale = params.float("res.fields.center.inflection").max(1e-6);
    let center_distance = f64::from(nalgebra::distance(&Point2::new(xyz.x, xyz.y), &center));
    let center_field = shaped(
        (center_distance - radius) / scale,
        1.0,
        params.float("res.fields.center.eps"),
    );

    FieldValues {
        joint_angle,
        calf_angle,
        min_hip,
        center: center_field,
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use nalgebra::Point3;

    use super::*;
    use crate::hexapod::LegId;

    fn setup() -> (LegGeometry, ParamStore) {
        let params = ParamStore::new();
        params.set_defaults("res", DEFAULT_PARAMETERS);
        (LegGeometry::for_leg(LegId::FrontLeft), params)
    }

    fn fields_at(geometry: &LegGeometry, params: &ParamStore, xyz: Point3<f32>) -> FieldValues {
        let angles = geometry.point_to_angles(&xyz);
        compute_fields(geometry, params, geometry.center(), xyz, angles)
    }

    #[test]
    fn restriction_is_bounded_and_equals_field_max() {
        let (geometry, params) = setup();
        for xyz in [
            Point3::new(40.0, 0.0, -40.0),
            Point3::new(20.0, 0.0, -40.0),
            Point3::new(60.0, 10.0, -35.0),
            Point3::new(66.0, 0.0, -40.0),
        ] {
            let fields = fields_at(&geometry, &params, xyz);
            let r = fields.max().clamp(0.0, 1.0);
            assert!((0.0..=1.0).contains(&r));
            assert!(r <= fields.max());
            for component in [
                fields.joint_angle,
                fields.calf_angle,
                fields.min_hip,
                fields.center,
            ] {
                assert!(component <= fields.max());
            }
        }
    }

    #[test]
    fn foot_at_rest_is_unrestricted() {
        let (geometry, params) = setup();
        let fields = fields_at(&geometry, &params, geometry.rest_point());
        assert!(fields.max() < 0.4, "rest restriction {:?}", fields);
        // the center field in particular is flat at the center
        assert!(fields.center < 0.01);
        assert!(fields.min_hip < 0.1);
    }

    #[test]
    fn fields_grow_towards_the_hip_exclusion_zone() {
        let (geometry, params) = setup();
        let far = fields_at(&geometry, &params, Point3::new(40.0, 0.0, -40.0));
        let near = fields_at(&geometry, &params, Point3::new(22.0, 0.0, -40.0));
        let inside = fields_at(&geometry, &params, Point3::new(16.0, 0.0, -40.0));
        assert!(near.min_hip > far.min_hip);
        assert!(inside.min_hip > 0.9);
    }

    #[test]
    fn joint_field_saturates_at_the_workspace_edge() {
        let (geometry, params) = setup();
        let mid = fields_at(&geometry, &params, Point3::new(40.0, 0.0, -40.0));
        let edge = fields_at(&geometry, &params, Point3::new(66.5, 0.0, -40.0));
        assert!(edge.joint_angle > mid.joint_angle);
        assert!(edge.joint_angle > 0.8);
    }

    #[test]
    fn shaping_is_monotonic() {
        let mut last = 0.0;
        for step in 0..20 {
            let value = shaped(step as f64 / 10.0, 0.4, 0.3);
            assert!(value >= last);
            last = value;
        }
        assert_relative_eq!(shaped(0.4, 0.4, 0.3), 0.5);
    }
}
