use serde::{Deserialize, Serialize};

use crate::error::{StriderError, StriderResult};

/// Leg numbering fixed by the leg firmware.
///
/// Legs are counted counter clockwise around the body starting at the
/// front left. [`LegId::Fake`] marks a simulated leg that is not attached
/// to any controller board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum LegId {
    FrontLeft = 1,
    MiddleLeft = 2,
    RearLeft = 3,
    RearRight = 4,
    MiddleRight = 5,
    FrontRight = 6,
    Fake = 7,
}

impl LegId {
    pub const REAL: [LegId; 6] = [
        LegId::FrontLeft,
        LegId::MiddleLeft,
        LegId::RearLeft,
        LegId::RearRight,
        LegId::MiddleRight,
        LegId::FrontRight,
    ];

    pub fn from_number(number: u8) -> StriderResult<LegId> {
        match number {
            1 => Ok(LegId::FrontLeft),
            2 => Ok(LegId::MiddleLeft),
            3 => Ok(LegId::RearLeft),
            4 => Ok(LegId::RearRight),
            5 => Ok(LegId::MiddleRight),
            6 => Ok(LegId::FrontRight),
            7 => Ok(LegId::Fake),
            other => Err(StriderError::InvalidLegNumber(other)),
        }
    }

    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            LegId::FrontLeft => "front-left",
            LegId::MiddleLeft => "middle-left",
            LegId::RearLeft => "rear-left",
            LegId::RearRight => "rear-right",
            LegId::MiddleRight => "middle-right",
            LegId::FrontRight => "front-right",
            LegId::Fake => "fake",
        }
    }

    /// Angle from the body x axis to the leg frame x axis.
    ///
    /// Leg frames point out of the body at the hip, so vectors expressed in
    /// body coordinates have to be rotated by the negative of this angle
    /// before a leg can follow them.
    pub fn mount_angle(self) -> f32 {
        match self {
            LegId::FrontLeft => 30_f32.to_radians(),
            LegId::MiddleLeft => 90_f32.to_radians(),
            LegId::RearLeft => 150_f32.to_radians(),
            LegId::RearRight => (-150_f32).to_radians(),
            LegId::MiddleRight => (-90_f32).to_radians(),
            LegId::FrontRight => (-30_f32).to_radians(),
            LegId::Fake => 0.0,
        }
    }
}

/// Joint indices shared with the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum JointId {
    Hip = 0,
    Thigh = 1,
    Knee = 2,
}

impl JointId {
    pub const ALL: [JointId; 3] = [JointId::Hip, JointId::Thigh, JointId::Knee];

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            JointId::Hip => "hip",
            JointId::Thigh => "thigh",
            JointId::Knee => "knee",
        }
    }
}

/// E-stop severity reported by and sent to the leg firmware.
///
/// Anything other than `Off` disables actuator output. `Hold` and above
/// latch until explicitly cleared by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EstopSeverity {
    Off = 0,
    Soft = 1,
    Hard = 2,
    Hold = 3,
    SensorLimit = 4,
    FollowingError = 5,
    Heartbeat = 6,
}

impl EstopSeverity {
    pub fn from_byte(byte: u8) -> Option<EstopSeverity> {
        match byte {
            0 => Some(EstopSeverity::Off),
            1 => Some(EstopSeverity::Soft),
            2 => Some(EstopSeverity::Hard),
            3 => Some(EstopSeverity::Hold),
            4 => Some(EstopSeverity::SensorLimit),
            5 => Some(EstopSeverity::FollowingError),
            6 => Some(EstopSeverity::Heartbeat),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn motion_allowed(self) -> bool {
        self == EstopSeverity::Off
    }

    /// Severities that cancel the active plan and require an explicit clear.
    pub fn latching(self) -> bool {
        self >= EstopSeverity::Hold
    }
}

impl Default for EstopSeverity {
    fn default() -> Self {
        EstopSeverity::Hard
    }
}
