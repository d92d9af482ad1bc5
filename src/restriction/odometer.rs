//! Dead reckoning of the body pose from the commanded target.
//!
//! Integrates the active [`BodyTarget`] over enabled time. This is an
//! estimate of where the body was told to go, not a measurement; it is
//! paused while the body is halted.

use std::time::Instant;

use nalgebra::{Point2, Rotation2, Vector2};

use super::{BodyTarget, RotationCenter};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct OdometerPose {
    pub position: Point2<f64>,
    pub heading: f64,
    pub z: f64,
}

#[derive(Debug)]
pub struct Odometer {
    enabled: bool,
    target: Option<BodyTarget>,
    last: Option<Instant>,
    pose: OdometerPose,
}

impl Odometer {
    pub fn new() -> Self {
        Odometer {
            enabled: false,
            target: None,
            last: None,
            pose: OdometerPose::default(),
        }
    }

    pub fn pose(&self) -> OdometerPose {
        self.pose
    }

    pub fn reset(&mut self) {
        self.pose = OdometerPose::default();
        self.last = None;
    }

    pub fn set_enabled(&mut self, enabled: bool, now: Instant) {
        if enabled == self.enabled {
            return;
        }
        if enabled {
            self.last = Some(now);
        } else {
            // bank the distance travelled up to the disable
            self.update(now);
        }
        self.enabled = enabled;
    }

    pub fn set_target(&mut self, target: BodyTarget, now: Instant) {
        self.update(now);
        self.target = Some(target);
    }

    pub fn update(&mut self, now: Instant) {
        if !self.enabled {
            return;
        }
        let Some(last) = self.last else {
            self.last = Some(now);
            return;
        };
        let dt = now.duration_since(last).as_secs_f64();
        self.last = Some(now);
        let Some(target) = self.target else {
            return;
        };
        let speed = f64::from(target.speed);
        match target.rotation_center {
            RotationCenter::Translate => {
                let step = Rotation2::new(self.pose.heading) * Vector2::new(speed * dt, 0.0);
                self.pose.position += step;
            }
            RotationCenter::Point(center) => {
                let turn = speed * dt;
                let center = Vector2::new(f64::from(center.x), f64::from(center.y));
                // rotating about a ground point both turns the body and
                // sweeps it along an arc around that point
                let swept = center - Rotation2::new(turn) * center;
                self.pose.position += Rotation2::new(self.pose.heading) * swept;
                self.pose.heading += turn;
            }
        }
        self.pose.z += f64::from(target.dz) * dt;
    }
}

impl Default for Odometer {
    fn default() -> Self {
        Odometer::new()
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use std::time::Duration;

    use super::*;

    #[test]
    fn translation_integrates_over_enabled_time() {
        let start = Instant::now();
        let mut odometer = Odometer::new();
        odometer.set_enabled(true, start);
        odometer.set_target(BodyTarget::translate(1.0, 0.0), start);
        odometer.update(start + Duration::from_secs(2));
        assert_relative_eq!(odometer.pose().position.x, 2.0, epsilon = 1e-9);
        assert_relative_eq!(odometer.pose().position.y, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn disabled_time_does_not_count() {
        let start = Instant::now();
        let mut odometer = Odometer::new();
        odometer.set_enabled(true, start);
        odometer.set_target(BodyTarget::translate(1.0, 0.0), start);
        odometer.set_enabled(false, start + Duration::from_secs(1));
        // a halt lasting three seconds
        odometer.set_enabled(true, start + Duration::from_secs(4));
        odometer.update(start + Duration::from_secs(5));
        assert_relative_eq!(odometer.pose().position.x, 2.0, epsilon = 1e-9);
    }

    #[test]
    fn rotation_turns_and_sweeps() {
        let start = Instant::now();
        let mut odometer = Odometer::new();
        odometer.set_enabled(true, start);
        odometer.set_target(
            BodyTarget {
                rotation_center: RotationCenter::Point(nalgebra::Point2::new(0.0, -10.0)),
                speed: std::f32::consts::FRAC_PI_2,
                dz: 0.0,
            },
            start,
        );
        odometer.update(start + Duration::from_secs(1));
        let pose = odometer.pose();
        assert_relative_eq!(pose.heading, std::f64::consts::FRAC_PI_2, epsilon = 1e-6);
        assert_relative_eq!(pose.position.x, -10.0, epsilon = 1e-6);
        assert_relative_eq!(pose.position.y, -10.0, epsilon = 1e-6);
    }

    #[test]
    fn vertical_rate_accumulates_and_reset_zeroes() {
        let start = Instant::now();
        let mut odometer = Odometer::new();
        odometer.set_enabled(true, start);
        odometer.set_target(BodyTarget::translate(0.0, -0.5), start);
        odometer.update(start + Duration::from_secs(4));
        assert_relative_eq!(odometer.pose().z, -2.0, epsilon = 1e-9);
        odometer.reset();
        assert_eq!(odometer.pose(), OdometerPose::default());
    }
}
