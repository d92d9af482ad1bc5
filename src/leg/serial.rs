//! Serial session with one leg controller board.

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use nalgebra::Point3;
use serialport::{ClearBuffer, SerialPort};
use tracing::{debug, info, warn};

use super::{
    AdcReading, AdcLimits, CalibrationTable, ConfigStep, DitherConfig, JointAngles,
    JointPidConfig, JointTriple, LegController, LegCore, LegEvent, LegEventKind, PidGains,
    PidReading, PwmLimits, PwmReading, Stamped, Telemetry, HEARTBEAT_PERIOD,
};
use crate::codec::command::{command_by_name, CommandSession, Value};
use crate::error::{StriderError, StriderResult};
use crate::hexapod::{EstopSeverity, JointId, LegId};
use crate::kinematics::{GeometryField, GeometryTable, LegGeometry};
use crate::plans::Plan;
use crate::signals::Signals;
use crate::utilities::StatsMonitor;

pub const BAUD_RATE: u32 = 9600;
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(1);
/// Read timeout while polling; short so poll never stalls the loop.
const READ_TIMEOUT: Duration = Duration::from_millis(2);

/// Open a port with a retry loop before declaring an IO failure. Boards
/// re-enumerate slowly after a reset, so a few attempts are normal.
pub fn open_port(path: &str) -> StriderResult<Box<dyn SerialPort>> {
    let deadline = Instant::now() + OPEN_TIMEOUT;
    loop {
        match serialport::new(path, BAUD_RATE)
            .timeout(READ_TIMEOUT)
            .open()
        {
            Ok(port) => return Ok(port),
            Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
            Err(error) => {
                warn!("giving up on port {}: {}", path, error);
                return Err(StriderError::PortOpenTimeout(path.to_owned()));
            }
        }
    }
}

/// Toggle RTS low then high to reset the controller board on a port.
pub fn reset_port(path: &str) -> StriderResult<()> {
    let mut port = open_port(path)?;
    port.write_request_to_send(false)?;
    thread::sleep(Duration::from_millis(10));
    port.write_request_to_send(true)?;
    Ok(())
}

// newtype so the codec session gets plain io stream impls for the port
struct PortStream(Box<dyn SerialPort>);

impl Read for PortStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for PortStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

pub struct SerialLeg {
    core: Rc<RefCell<LegCore>>,
    session: CommandSession<PortStream>,
    last_heartbeat: Instant,
    loop_time_stats: Rc<RefCell<StatsMonitor>>,
}

impl SerialLeg {
    /// Bring up a session on the given port: reset the board, learn its leg
    /// number, replay calibration, upload geometry, apply the default
    /// e-stop, verify the pid seed time and send the first heartbeat.
    ///
    /// Legs listed in `geometry` use their measured geometry. The first
    /// connected leg latches `plan_tick` (seed time rounded to the nearest
    /// millisecond); later legs must match it.
    pub fn connect(
        path: &str,
        calibration: &CalibrationTable,
        geometry: &GeometryTable,
        plan_tick: &mut Option<f64>,
    ) -> StriderResult<SerialLeg> {
        info!("connecting to leg on port {}", path);
        let mut port = open_port(path)?;
        port.write_request_to_send(false)?;
        port.clear(ClearBuffer::All)?;
        port.write_request_to_send(true)?;

        let mut session = CommandSession::new(PortStream(port));

        let number = session.blocking_trigger("leg_number", &[], COMMAND_TIMEOUT)?[0].as_u8();
        let leg = LegId::from_number(number)?;
        info!("port {} is leg {} ({})", path, number, leg.name());
        let leg_geometry = geometry
            .get(&number)
            .copied()
            .unwrap_or_else(|| LegGeometry::for_leg(leg));
        let core = Rc::new(RefCell::new(LegCore::new(leg_geometry, Instant::now())));

        session.on_text(move |line| debug!("leg {} firmware: {}", number, line));

        // replay calibration recorded for this leg
        let mut this = SerialLeg {
            core: Rc::clone(&core),
            session,
            last_heartbeat: Instant::now(),
            loop_time_stats: Rc::new(RefCell::new(StatsMonitor::new())),
        };
        if let Some(steps) = calibration.get(&number) {
            this.configure(steps)?;
        }

        // upload the per joint geometry the firmware plans against
        let geometry = this.geometry();
        for joint in JointId::ALL {
            let joint_geometry = geometry.joint(joint);
            for field in GeometryField::ALL {
                this.session.trigger(
                    "set_geometry",
                    &[
                        Value::U8(joint.index()),
                        Value::U8(field.code()),
                        Value::F32(joint_geometry.field(field)),
                    ],
                )?;
            }
        }

        // firmware raised e-stops are adopted locally, never echoed back
        {
            let core = Rc::clone(&core);
            this.session.on(
                command_by_name("estop").expect("estop in command table").id,
                move |values| {
                    if let Some(severity) = EstopSeverity::from_byte(values[0].as_u8()) {
                        core.borrow_mut().set_estop(severity);
                    }
                },
            );
        }

        this.set_estop(EstopSeverity::default())?;

        let seed = f64::from(
            this.session
                .blocking_trigger("pid_seed_time", &[], COMMAND_TIMEOUT)?[0]
                .as_f32(),
        );
        if plan_tick.is_none() {
            // first leg seeds the system wide plan tick, rounded to a ms
            *plan_tick = Some((seed * 1000.0).round() / 1000.0);
        }
        let tick = plan_tick.expect("plan tick latched above");
        if (seed - tick).abs() > 1e-9 {
            return Err(StriderError::SeedTimeMismatch {
                leg: number,
                seed,
                tick,
            });
        }

        this.send_heartbeat()?;
        this.register_report_handlers();
        Ok(this)
    }

    fn register_report_handlers(&mut self) {
        let reports: [(&str, fn(&mut LegCore, &[Value], Instant)); 5] = [
            ("report_adc", |core, values, now| {
                let reading = Stamped::new(
                    AdcReading {
                        hip: values[0].as_u32(),
                        thigh: values[1].as_u32(),
                        knee: values[2].as_u32(),
                        calf: values[3].as_u32(),
                    },
                    now,
                );
                core.telemetry.adc = reading;
                core.emit(LegEvent::Adc(reading));
            }),
            ("report_pid", |core, values, now| {
                let reading = Stamped::new(
                    PidReading {
                        output: JointTriple {
                            hip: values[0].as_f32(),
                            thigh: values[1].as_f32(),
                            knee: values[2].as_f32(),
                        },
                        set_point: JointTriple {
                            hip: values[3].as_f32(),
                            thigh: values[4].as_f32(),
                            knee: values[5].as_f32(),
                        },
                        error: JointTriple {
                            hip: values[6].as_f32(),
                            thigh: values[7].as_f32(),
                            knee: values[8].as_f32(),
                        },
                    },
                    now,
                );
                core.telemetry.pid = reading;
                core.emit(LegEvent::Pid(reading));
            }),
            ("report_pwm", |core, values, now| {
                let reading = Stamped::new(
                    PwmReading {
                        hip: values[0].as_i32(),
                        thigh: values[1].as_i32(),
                        knee: values[2].as_i32(),
                    },
                    now,
                );
                core.telemetry.pwm = reading;
                core.emit(LegEvent::Pwm(reading));
            }),
            ("report_xyz", |core, values, now| {
                let reading = Stamped::new(
                    Point3::new(
                        values[0].as_f32(),
                        values[1].as_f32(),
                        values[2].as_f32(),
                    ),
                    now,
                );
                core.telemetry.xyz = reading;
                core.emit(LegEvent::Xyz(reading));
            }),
            ("report_angles", |core, values, now| {
                let reading = Stamped::new(
                    JointAngles {
                        hip: values[0].as_f32(),
                        thigh: values[1].as_f32(),
                        knee: values[2].as_f32(),
                        calf_load: values[3].as_f32(),
                        valid: values[4].as_bool(),
                    },
                    now,
                );
                core.telemetry.angles = reading;
                core.emit(LegEvent::Angles(reading));
            }),
        ];
        for (name, update) in reports {
            let id = command_by_name(name).expect("report in command table").id;
            let core = Rc::clone(&self.core);
            self.session.on(id, move |values| {
                update(&mut core.borrow_mut(), values, Instant::now());
            });
        }

        let id = command_by_name("report_loop_time")
            .expect("report in command table")
            .id;
        let core = Rc::clone(&self.core);
        let stats = Rc::clone(&self.loop_time_stats);
        self.session.on(id, move |values| {
            let reading = Stamped::new(values[0].as_u32(), Instant::now());
            stats.borrow_mut().update(f64::from(reading.value));
            let mut core = core.borrow_mut();
            core.telemetry.loop_time = reading;
            core.emit(LegEvent::LoopTime(reading));
        });
    }

    pub fn loop_time_stats(&self) -> StatsMonitor {
        *self.loop_time_stats.borrow()
    }

    fn send_heartbeat(&mut self) -> StriderResult<()> {
        self.session.trigger("heartbeat", &[])?;
        self.last_heartbeat = Instant::now();
        Ok(())
    }
}

impl LegController for SerialLeg {
    fn leg(&self) -> LegId {
        self.core.borrow().leg
    }

    fn geometry(&self) -> LegGeometry {
        self.core.borrow().geometry
    }

    fn signals(&self) -> Signals<LegEventKind, LegEvent> {
        self.core.borrow().signals.clone()
    }

    fn telemetry(&self) -> Telemetry {
        self.core.borrow().telemetry.clone()
    }

    fn estop(&self) -> EstopSeverity {
        self.core.borrow().estop_severity()
    }

    fn set_estop(&mut self, severity: EstopSeverity) -> StriderResult<()> {
        self.session
            .trigger("estop", &[Value::U8(severity.as_byte())])?;
        self.core.borrow_mut().set_estop(severity);
        Ok(())
    }

    fn send_plan(&mut self, plan: &Plan) -> StriderResult<()> {
        let packed = self.core.borrow_mut().record_plan(plan);
        let mut args = vec![
            Value::U8(packed.values[0] as u8),
            Value::U8(packed.values[1] as u8),
        ];
        args.extend(packed.values[2..].iter().map(|value| Value::F32(*value)));
        // firmware signature is fixed width, pad unused plan fields
        while args.len() < 19 {
            args.push(Value::F32(0.0));
        }
        self.session.trigger("plan", &args)
    }

    fn set_pwm(&mut self, hip: f32, thigh: f32, knee: f32) -> StriderResult<()> {
        if self.estop().motion_allowed() {
            return Err(StriderError::PwmOverrideUnsafe);
        }
        self.session.trigger(
            "pwm",
            &[Value::F32(hip), Value::F32(thigh), Value::F32(knee)],
        )?;
        self.core
            .borrow_mut()
            .emit(LegEvent::SetPwm([hip, thigh, knee]));
        Ok(())
    }

    fn enable_pid(&mut self, enabled: bool) -> StriderResult<()> {
        self.session.trigger("enable_pid", &[Value::Bool(enabled)])
    }

    fn configure(&mut self, steps: &[ConfigStep]) -> StriderResult<()> {
        for step in steps {
            let spec = command_by_name(&step.command)
                .ok_or_else(|| StriderError::UnknownCommand(step.command.clone()))?;
            let args: Vec<Value> = spec
                .args
                .iter()
                .zip(&step.args)
                .map(|(kind, value)| Value::coerce(*kind, *value))
                .collect();
            debug!("leg {} configure {} {:?}", self.leg().number(), step.command, step.args);
            self.session.trigger(spec.name, &args)?;
        }
        Ok(())
    }

    fn pid_joint_config(&mut self, joint: JointId) -> StriderResult<JointPidConfig> {
        let index = Value::U8(joint.index());
        let pid = self
            .session
            .blocking_trigger("pid_config", &[index], COMMAND_TIMEOUT)?;
        let following = self.session.blocking_trigger(
            "following_error_threshold",
            &[index],
            COMMAND_TIMEOUT,
        )?;
        let pwm = self
            .session
            .blocking_trigger("pwm_limits", &[index], COMMAND_TIMEOUT)?;
        let adc = self
            .session
            .blocking_trigger("adc_limits", &[index], COMMAND_TIMEOUT)?;
        let dither = self
            .session
            .blocking_trigger("dither", &[], COMMAND_TIMEOUT)?;
        Ok(JointPidConfig {
            pid: PidGains {
                p: pid[1].as_f32(),
                i: pid[2].as_f32(),
                d: pid[3].as_f32(),
                min: pid[4].as_f32(),
                max: pid[5].as_f32(),
            },
            following_error_threshold: following[1].as_f32(),
            pwm: PwmLimits {
                extend_min: pwm[1].as_i32(),
                extend_max: pwm[2].as_i32(),
                retract_min: pwm[3].as_i32(),
                retract_max: pwm[4].as_i32(),
            },
            adc: AdcLimits {
                min: adc[1].as_f32(),
                max: adc[2].as_f32(),
            },
            dither: DitherConfig {
                time: dither[0].as_u32(),
                amp: dither[1].as_i32(),
            },
        })
    }

    fn poll(&mut self, now: Instant) -> StriderResult<Vec<LegEvent>> {
        self.session.pump()?;
        if now.duration_since(self.last_heartbeat) >= HEARTBEAT_PERIOD {
            self.send_heartbeat()?;
        }
        Ok(self.core.borrow_mut().drain())
    }
}
