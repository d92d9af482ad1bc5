//! The single threaded cooperative loop driving every leg session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{info, warn};

use crate::app_config::AppConfig;
use crate::hexapod::EstopSeverity;
use crate::leg::{connect_all, serial, LegController};
use crate::param::ParamStore;
use crate::restriction::body::Body;

const CYCLE_SLEEP: Duration = Duration::from_millis(5);

/// Connect legs, build the body coordinator and run the control loop until
/// interrupted. Legs come up e-stopped and stay that way until operator
/// side code clears them.
pub fn run_backend(config: &AppConfig) -> Result<()> {
    let calibration = config.legs.calibration_table()?;
    let geometry = config.legs.geometry_table()?;
    let (legs, plan_tick) = connect_all(&config.legs.ports, &calibration, &geometry, Instant::now())?;
    info!("connected {} legs, plan tick {:?}", legs.len(), plan_tick);

    // the body consumes the map, keep handles for the shutdown e-stop
    let leg_handles: Vec<_> = legs.values().cloned().collect();
    let mut body = Body::new(legs, plan_tick, ParamStore::new());

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        ctrlc::set_handler(move || interrupted.store(true, Ordering::SeqCst))?;
    }

    info!("control loop running");
    while !interrupted.load(Ordering::SeqCst) {
        body.run_cycle(Instant::now())?;
        thread::sleep(CYCLE_SLEEP);
    }

    info!("interrupted, raising hard e-stop on all legs");
    body.disable(Instant::now());
    for leg in leg_handles {
        if let Err(error) = leg.borrow_mut().set_estop(EstopSeverity::Hard) {
            warn!("failed to e-stop a leg during shutdown: {}", error);
        }
    }
    Ok(())
}

/// Toggle RTS on every configured port to reset the attached boards.
pub fn reset_legs(config: &AppConfig) -> Result<()> {
    if config.legs.ports.is_empty() {
        anyhow::bail!("no leg ports configured");
    }
    for port in &config.legs.ports {
        info!("resetting board on {}", port);
        serial::reset_port(port)?;
    }
    Ok(())
}
