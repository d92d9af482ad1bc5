use std::result::Result;
use std::time::Duration;
use thiserror::Error;

use crate::plans::Frame;

pub type StriderResult<T> = Result<T, StriderError>;

#[derive(Error, Debug)]
pub enum StriderError {
    #[error("IO error")]
    IoError(#[from] std::io::Error),
    #[error("Serial port error")]
    SerialPortError(#[from] serialport::Error),
    #[error("Toml serde error")]
    TomlError(#[from] toml::de::Error),

    #[error("failed to open serial port {0}")]
    PortOpenTimeout(String),
    #[error("no response to {command} within {timeout:?}")]
    CommandTimeout {
        command: &'static str,
        timeout: Duration,
    },
    #[error("unknown command {0}")]
    UnknownCommand(String),
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("leg {leg} reports pid seed time {seed}s but the plan tick is {tick}s")]
    SeedTimeMismatch { leg: u8, seed: f64, tick: f64 },
    #[error("more than one leg claims number {0}")]
    DuplicateLegNumber(u8),
    #[error("{0} is not a valid leg number")]
    InvalidLegNumber(u8),
    #[error("simulated legs can only follow leg frame plans, got {0:?}")]
    UnsupportedPlanFrame(Frame),
    #[error("pwm override requires an active e-stop")]
    PwmOverrideUnsafe,
}
