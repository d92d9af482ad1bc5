use config::Config;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::kinematics::{GeometryTable, LegGeometry};
use crate::leg::{CalibrationTable, ConfigStep};

/// Use default config if no path is provided
pub fn get_configuration(config: Option<PathBuf>) -> Result<AppConfig, anyhow::Error> {
    let settings = if let Some(config) = config {
        info!("Using configuration from {:?}", config);
        Config::builder()
            .add_source(config::Environment::with_prefix("APP"))
            .add_source(config::File::with_name(
                config
                    .to_str()
                    .ok_or_else(|| anyhow::anyhow!("Failed to convert path"))?,
            ))
            .build()?
    } else {
        info!("Using default configuration");
        Config::builder()
            .add_source(config::Environment::with_prefix("APP"))
            .add_source(config::File::with_name("config/settings").required(false))
            .build()?
    };

    Ok(settings.try_deserialize()?)
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub legs: LegsConfig,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct LegsConfig {
    /// Serial ports with leg controller boards; empty runs the simulation.
    #[serde(default)]
    pub ports: Vec<String>,
    /// Calibration steps replayed per leg number at session start. Keys
    /// are leg numbers, kept as strings for the settings format.
    #[serde(default)]
    pub calibration: BTreeMap<String, Vec<ConfigStep>>,
    /// Measured geometry override files per leg number, replacing the
    /// built-in geometry for that leg.
    #[serde(default)]
    pub geometry: BTreeMap<String, String>,
}

impl LegsConfig {
    pub fn calibration_table(&self) -> Result<CalibrationTable, anyhow::Error> {
        let mut table = CalibrationTable::new();
        for (key, steps) in &self.calibration {
            let number: u8 = key
                .parse()
                .map_err(|_| anyhow::anyhow!("bad leg number {:?} in calibration", key))?;
            table.insert(number, steps.clone());
        }
        Ok(table)
    }

    pub fn geometry_table(&self) -> Result<GeometryTable, anyhow::Error> {
        let mut table = GeometryTable::new();
        for (key, path) in &self.geometry {
            let number: u8 = key
                .parse()
                .map_err(|_| anyhow::anyhow!("bad leg number {:?} in geometry overrides", key))?;
            let geometry = LegGeometry::load(Path::new(path))?;
            if geometry.leg.number() != number {
                anyhow::bail!(
                    "geometry file {} is for leg {}, listed under leg {}",
                    path,
                    geometry.leg.number(),
                    number
                );
            }
            table.insert(number, geometry);
        }
        Ok(table)
    }
}
