//! Leg controllers: one session per leg microcontroller.
//!
//! [`LegController`] is the common contract; [`serial::SerialLeg`] talks to
//! a real controller board over a serial port and [`sim::SimLeg`] is the
//! plan following kinematic stand-in used without hardware.

pub mod serial;
pub mod sim;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use nalgebra::Point3;
use serde::Deserialize;
use tracing::info;

use crate::error::{StriderError, StriderResult};
use crate::hexapod::{EstopSeverity, JointId, LegId};
use crate::kinematics::{GeometryTable, LegGeometry};
use crate::plans::{PackedPlan, Plan};
use crate::signals::Signals;

/// Firmware e-stops on a missed heartbeat after this long.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(1);
/// Heartbeats are sent twice per timeout window.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_millis(500);
/// Plan tick used for simulated legs when no firmware seeds one.
pub const DEFAULT_PLAN_TICK: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdcReading {
    pub hip: u32,
    pub thigh: u32,
    pub knee: u32,
    pub calf: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JointAngles {
    pub hip: f32,
    pub thigh: f32,
    pub knee: f32,
    /// Load on the calf in pounds, derived from the strain gauge.
    pub calf_load: f32,
    pub valid: bool,
}

impl Default for JointAngles {
    fn default() -> Self {
        JointAngles {
            hip: 0.0,
            thigh: 0.0,
            knee: 0.0,
            calf_load: 0.0,
            valid: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PwmReading {
    pub hip: i32,
    pub thigh: i32,
    pub knee: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct JointTriple {
    pub hip: f32,
    pub thigh: f32,
    pub knee: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PidReading {
    pub output: JointTriple,
    pub set_point: JointTriple,
    pub error: JointTriple,
}

/// Value plus the host timestamp of its last update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stamped<T> {
    pub value: T,
    pub at: Instant,
}

impl<T> Stamped<T> {
    pub fn new(value: T, at: Instant) -> Self {
        Stamped { value, at }
    }
}

/// Latest telemetry from one leg. Fields update independently, each
/// carrying its own timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Telemetry {
    pub adc: Stamped<AdcReading>,
    pub angles: Stamped<JointAngles>,
    pub xyz: Stamped<Point3<f32>>,
    pub pid: Stamped<PidReading>,
    pub pwm: Stamped<PwmReading>,
    pub loop_time: Stamped<u32>,
}

impl Telemetry {
    pub fn at(now: Instant) -> Self {
        Telemetry {
            adc: Stamped::new(AdcReading::default(), now),
            angles: Stamped::new(JointAngles::default(), now),
            xyz: Stamped::new(Point3::origin(), now),
            pid: Stamped::new(PidReading::default(), now),
            pwm: Stamped::new(PwmReading::default(), now),
            loop_time: Stamped::new(0, now),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LegEvent {
    Estop(EstopSeverity),
    Plan(PackedPlan),
    SetPwm([f32; 3]),
    Adc(Stamped<AdcReading>),
    Pid(Stamped<PidReading>),
    Pwm(Stamped<PwmReading>),
    Angles(Stamped<JointAngles>),
    Xyz(Stamped<Point3<f32>>),
    LoopTime(Stamped<u32>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LegEventKind {
    Estop,
    Plan,
    SetPwm,
    Adc,
    Pid,
    Pwm,
    Angles,
    Xyz,
    LoopTime,
}

impl LegEvent {
    pub fn kind(&self) -> LegEventKind {
        match self {
            LegEvent::Estop(_) => LegEventKind::Estop,
            LegEvent::Plan(_) => LegEventKind::Plan,
            LegEvent::SetPwm(_) => LegEventKind::SetPwm,
            LegEvent::Adc(_) => LegEventKind::Adc,
            LegEvent::Pid(_) => LegEventKind::Pid,
            LegEvent::Pwm(_) => LegEventKind::Pwm,
            LegEvent::Angles(_) => LegEventKind::Angles,
            LegEvent::Xyz(_) => LegEventKind::Xyz,
            LegEvent::LoopTime(_) => LegEventKind::LoopTime,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PidGains {
    pub p: f32,
    pub i: f32,
    pub d: f32,
    pub min: f32,
    pub max: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PwmLimits {
    pub extend_min: i32,
    pub extend_max: i32,
    pub retract_min: i32,
    pub retract_max: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AdcLimits {
    pub min: f32,
    pub max: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DitherConfig {
    pub time: u32,
    pub amp: i32,
}

/// Aggregate of every per joint tuning value the firmware exposes.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct JointPidConfig {
    pub pid: PidGains,
    pub following_error_threshold: f32,
    pub pwm: PwmLimits,
    pub adc: AdcLimits,
    pub dither: DitherConfig,
}

/// One replayable configuration command, as written in the settings file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConfigStep {
    pub command: String,
    #[serde(default)]
    pub args: Vec<f64>,
}

/// Calibration steps to replay per leg number at session start.
pub type CalibrationTable = BTreeMap<u8, Vec<ConfigStep>>;

pub trait LegController {
    fn leg(&self) -> LegId;
    fn geometry(&self) -> LegGeometry;
    fn signals(&self) -> Signals<LegEventKind, LegEvent>;
    fn telemetry(&self) -> Telemetry;
    fn estop(&self) -> EstopSeverity;

    /// Idempotent: emits an `Estop` event only on change, always forwards
    /// to the firmware.
    fn set_estop(&mut self, severity: EstopSeverity) -> StriderResult<()>;
    fn send_plan(&mut self, plan: &Plan) -> StriderResult<()>;
    fn stop(&mut self) -> StriderResult<()> {
        self.send_plan(&Plan::stop())
    }
    /// Direct actuator override, only legal while an e-stop is active.
    fn set_pwm(&mut self, hip: f32, thigh: f32, knee: f32) -> StriderResult<()>;
    fn enable_pid(&mut self, enabled: bool) -> StriderResult<()>;
    /// Replay a batch of raw configuration commands.
    fn configure(&mut self, steps: &[ConfigStep]) -> StriderResult<()>;
    /// Blocking aggregate query of one joint's firmware tuning.
    fn pid_joint_config(&mut self, joint: JointId) -> StriderResult<JointPidConfig>;

    /// Drive the session forward one step: process pending bytes, send a
    /// heartbeat if due, and return the events produced since the last
    /// poll, in order.
    fn poll(&mut self, now: Instant) -> StriderResult<Vec<LegEvent>>;
}

/// State every leg controller keeps regardless of transport.
pub(crate) struct LegCore {
    pub leg: LegId,
    pub geometry: LegGeometry,
    pub estop: Option<EstopSeverity>,
    pub plan: Option<Plan>,
    pub telemetry: Telemetry,
    pub signals: Signals<LegEventKind, LegEvent>,
    outbox: Vec<LegEvent>,
}

impl LegCore {
    pub fn new(geometry: LegGeometry, now: Instant) -> Self {
        LegCore {
            leg: geometry.leg,
            geometry,
            estop: None,
            plan: None,
            telemetry: Telemetry::at(now),
            signals: Signals::new(),
            outbox: Vec::new(),
        }
    }

    pub fn estop_severity(&self) -> EstopSeverity {
        self.estop.unwrap_or_default()
    }

    /// Returns true when the severity actually changed.
    pub fn set_estop(&mut self, severity: EstopSeverity) -> bool {
        if self.estop == Some(severity) {
            return false;
        }
        self.estop = Some(severity);
        if severity.latching() {
            self.plan = None;
        }
        info!("leg {} estop {:?}", self.leg.number(), severity);
        self.emit(LegEvent::Estop(severity));
        true
    }

    pub fn record_plan(&mut self, plan: &Plan) -> PackedPlan {
        let packed = plan.pack(self.leg);
        self.plan = Some(plan.clone());
        self.emit(LegEvent::Plan(packed.clone()));
        packed
    }

    pub fn emit(&mut self, event: LegEvent) {
        self.outbox.push(event);
    }

    pub fn drain(&mut self) -> Vec<LegEvent> {
        std::mem::take(&mut self.outbox)
    }
}

/// Open every leg on the given ports, or fall back to six simulated legs
/// when no ports are configured. Legs listed in `geometry` use their
/// measured geometry instead of the built-in one. Returns the legs keyed
/// by number together with the plan tick latched during bring-up.
pub fn connect_all(
    ports: &[String],
    calibration: &CalibrationTable,
    geometry: &GeometryTable,
    now: Instant,
) -> StriderResult<(BTreeMap<u8, Rc<RefCell<dyn LegController>>>, Duration)> {
    let mut legs: BTreeMap<u8, Rc<RefCell<dyn LegController>>> = BTreeMap::new();
    if ports.is_empty() {
        info!("no leg ports configured, starting six simulated legs");
        for leg in LegId::REAL {
            let leg_geometry = geometry
                .get(&leg.number())
                .copied()
                .unwrap_or_else(|| LegGeometry::for_leg(leg));
            let sim = sim::SimLeg::with_geometry(leg_geometry, DEFAULT_PLAN_TICK, now);
            legs.insert(leg.number(), Rc::new(RefCell::new(sim)));
        }
        return Ok((legs, DEFAULT_PLAN_TICK));
    }
    let mut plan_tick: Option<f64> = None;
    for port in ports {
        let leg = serial::SerialLeg::connect(port, calibration, geometry, &mut plan_tick)?;
        let number = leg.leg().number();
        if legs.insert(number, Rc::new(RefCell::new(leg))).is_some() {
            return Err(StriderError::DuplicateLegNumber(number));
        }
    }
    // connect only returns once a seed time was read from the first leg
    let tick = plan_tick.map(Duration::from_secs_f64).unwrap_or(DEFAULT_PLAN_TICK);
    Ok((legs, tick))
}
