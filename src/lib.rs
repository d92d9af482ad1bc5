#![doc = include_str!("../README.md")]

pub mod app_config;
pub mod codec;
pub mod error;
pub mod hexapod;
pub mod kinematics;
pub mod leg;
pub mod logging;
pub mod param;
pub mod plans;
pub mod restriction;
pub mod runtime;
pub mod signals;
pub mod utilities;
