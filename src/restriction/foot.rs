//! Per leg foot: restriction tracking and the gait phase state machine.
//!
//! A foot subscribes to its leg's telemetry. Every position update refreshes
//! the restriction (and its one-tick-ahead value) and drives the load and
//! distance based phase transitions; the body coordinator commands the
//! transitions that need global arbitration (lift, halt).

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use nalgebra::{Point2, Point3, Vector2, Vector3};
use tracing::warn;

use super::{compute_fields, BodyTarget, Restriction, RotationCenter};
use crate::hexapod::LegId;
use crate::kinematics::LegGeometry;
use crate::leg::{JointAngles, LegController, LegEvent, LegEventKind, Stamped};
use crate::param::ParamStore;
use crate::plans::{follow, Frame, Plan};
use crate::signals::Signals;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FootState {
    Stance,
    Wait,
    Lift,
    Swing,
    Lower,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FootEvent {
    Restriction(Restriction),
    State(Option<FootState>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FootEventKind {
    Restriction,
    State,
}

impl FootEvent {
    pub fn kind(&self) -> FootEventKind {
        match self {
            FootEvent::Restriction(_) => FootEventKind::Restriction,
            FootEvent::State(_) => FootEventKind::State,
        }
    }
}

pub struct Foot {
    core: Rc<RefCell<FootCore>>,
}

struct FootCore {
    leg: Rc<RefCell<dyn LegController>>,
    leg_id: LegId,
    geometry: LegGeometry,
    params: ParamStore,
    plan_tick: f32,
    signals: Signals<FootEventKind, FootEvent>,
    state: Option<FootState>,
    last_lift_time: Option<Instant>,
    restriction: Option<Restriction>,
    center_offset: Vector2<f32>,
    target: Option<BodyTarget>,
    speed_scale: f32,
    halted: bool,
    position: Point3<f32>,
    angles: (f32, f32, f32),
    angles_valid: bool,
    load: f32,
    /// Leg frame version of the last plan sent, used for the one tick
    /// lookahead.
    leg_plan: Option<Plan>,
    swing_target: Option<Point2<f32>>,
    outbox: Vec<FootEvent>,
}

impl Foot {
    pub fn new(
        leg: Rc<RefCell<dyn LegController>>,
        params: ParamStore,
        plan_tick: Duration,
    ) -> Foot {
        let (leg_id, geometry, telemetry, hub) = {
            let leg = leg.borrow();
            (leg.leg(), leg.geometry(), leg.telemetry(), leg.signals())
        };
        let core = Rc::new(RefCell::new(FootCore {
            leg,
            leg_id,
            geometry,
            params,
            plan_tick: plan_tick.as_secs_f32(),
            signals: Signals::new(),
            state: None,
            last_lift_time: None,
            restriction: None,
            center_offset: Vector2::zeros(),
            target: None,
            speed_scale: 1.0,
            halted: false,
            position: telemetry.xyz.value,
            angles: (
                telemetry.angles.value.hip,
                telemetry.angles.value.thigh,
                telemetry.angles.value.knee,
            ),
            angles_valid: telemetry.angles.value.valid,
            load: telemetry.angles.value.calf_load,
            leg_plan: None,
            swing_target: None,
            outbox: Vec::new(),
        }));

        {
            let core = Rc::clone(&core);
            hub.on(LegEventKind::Xyz, move |event| {
                if let LegEvent::Xyz(stamped) = event {
                    Foot::dispatch(&core, |foot| foot.handle_xyz(*stamped));
                }
            });
        }
        {
            let core = Rc::clone(&core);
            hub.on(LegEventKind::Angles, move |event| {
                if let LegEvent::Angles(stamped) = event {
                    Foot::dispatch(&core, |foot| foot.handle_angles(*stamped));
                }
            });
        }
        Foot { core }
    }

    // run a mutation against the core, then flush the events it queued
    fn dispatch(core: &Rc<RefCell<FootCore>>, operation: impl FnOnce(&mut FootCore)) {
        let (events, hub) = {
            let mut core = core.borrow_mut();
            operation(&mut core);
            (std::mem::take(&mut core.outbox), core.signals.clone())
        };
        for event in events {
            hub.trigger(&event.kind(), &event);
        }
    }

    fn with(&self, operation: impl FnOnce(&mut FootCore)) {
        Foot::dispatch(&self.core, operation);
    }

    pub fn signals(&self) -> Signals<FootEventKind, FootEvent> {
        self.core.borrow().signals.clone()
    }

    pub fn state(&self) -> Option<FootState> {
        self.core.borrow().state
    }

    pub fn restriction(&self) -> Option<Restriction> {
        self.core.borrow().restriction
    }

    pub fn last_lift_time(&self) -> Option<Instant> {
        self.core.borrow().last_lift_time
    }

    pub fn position(&self) -> Point3<f32> {
        self.core.borrow().position
    }

    pub fn angles_valid(&self) -> bool {
        self.core.borrow().angles_valid
    }

    pub fn set_center_offset(&self, offset: Vector2<f32>) {
        self.core.borrow_mut().center_offset = offset;
    }

    pub fn center_offset(&self) -> Vector2<f32> {
        self.core.borrow().center_offset
    }

    /// Whether relocating the foot is worth a lift at all.
    pub fn should_lift(&self) -> bool {
        let core = self.core.borrow();
        let Some(swing_target) = core.swing_target else {
            return false;
        };
        let here = Point2::new(core.position.x, core.position.y);
        f64::from(nalgebra::distance(&here, &swing_target))
            >= core.params.float("res.min_step_size")
    }

    pub fn set_target(&self, target: BodyTarget, speed_scale: f32) {
        self.with(|core| core.set_target(target, speed_scale));
    }

    pub fn set_halt(&self, halted: bool, now: Instant) {
        self.with(|core| core.set_halt(halted, now));
    }

    pub fn set_state(&self, state: Option<FootState>, now: Instant) {
        self.with(|core| core.transition(state, now));
    }

    /// Body granted this foot permission to leave the ground.
    pub fn command_lift(&self, now: Instant) {
        self.with(|core| core.transition(Some(FootState::Lift), now));
    }

    pub fn reset(&self, now: Instant) {
        self.with(|core| {
            core.last_lift_time = None;
            core.restriction = None;
            core.halted = false;
            core.transition(Some(FootState::Stance), now);
        });
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: Option<FootState>) {
        self.core.borrow_mut().state = state;
    }

    #[cfg(test)]
    pub(crate) fn inject_restriction(&self, restriction: Restriction) {
        self.core.borrow_mut().restriction = Some(restriction);
    }

    #[cfg(test)]
    pub(crate) fn set_last_lift_time(&self, at: Option<Instant>) {
        self.core.borrow_mut().last_lift_time = at;
    }
}

impl FootCore {
    fn emit(&mut self, event: FootEvent) {
        self.outbox.push(event);
    }

    fn center(&self) -> Point2<f32> {
        self.geometry.center() + self.center_offset
    }

    fn handle_xyz(&mut self, stamped: Stamped<Point3<f32>>) {
        self.position = stamped.value;
        if !self.angles_valid {
            // frozen: no transitions and no arbitration input
            return;
        }
        match self.state {
            Some(FootState::Lift) => {
                let ground = self.params.float("res.lower_height") as f32;
                let lift_height = self.params.float("res.lift_height") as f32;
                let unloaded = self.params.float("res.unloaded_weight") as f32;
                if self.position.z - ground >= lift_height && self.load < unloaded {
                    self.transition(Some(FootState::Swing), stamped.at);
                }
            }
            Some(FootState::Swing) => {
                if let Some(swing_target) = self.swing_target {
                    let here = Point2::new(self.position.x, self.position.y);
                    let slop = self.params.float("res.swing_slop") as f32;
                    if nalgebra::distance(&here, &swing_target) <= slop {
                        self.transition(Some(FootState::Lower), stamped.at);
                    }
                }
            }
            _ => {}
        }
        let restriction = self.compute_restriction();
        self.restriction = Some(restriction);
        self.emit(FootEvent::Restriction(restriction));
    }

    fn handle_angles(&mut self, stamped: Stamped<JointAngles>) {
        let angles = stamped.value;
        self.angles = (angles.hip, angles.thigh, angles.knee);
        self.angles_valid = angles.valid;
        self.load = angles.calf_load;
        if !self.angles_valid {
            return;
        }
        if self.state == Some(FootState::Lower)
            && f64::from(self.load) >= self.params.float("res.loaded_weight")
        {
            // a foot landing while the body is halted parks instead of
            // resuming stance motion
            let landed = if self.halted {
                FootState::Wait
            } else {
                FootState::Stance
            };
            self.transition(Some(landed), stamped.at);
        }
    }

    fn compute_restriction(&self) -> Restriction {
        let fields = compute_fields(
            &self.geometry,
            &self.params,
            self.center(),
            self.position,
            self.angles,
        );
        let r = fields.max().clamp(0.0, 1.0);
        let nr = match &self.leg_plan {
            Some(plan) => {
                let ahead = follow(self.position, plan, self.plan_tick);
                let ahead_angles = self.geometry.point_to_angles(&ahead);
                compute_fields(
                    &self.geometry,
                    &self.params,
                    self.center(),
                    ahead,
                    ahead_angles,
                )
                .max()
                .clamp(0.0, 1.0)
            }
            None => r,
        };
        Restriction { r, nr, fields }
    }

    fn transition(&mut self, state: Option<FootState>, now: Instant) {
        if self.state == state {
            return;
        }
        self.state = state;
        if state == Some(FootState::Lift) {
            self.last_lift_time = Some(now);
        }
        let plan = self.plan_for_state(state);
        self.send_plan(plan);
        self.emit(FootEvent::State(state));
    }

    fn set_halt(&mut self, halted: bool, now: Instant) {
        self.halted = halted;
        if halted {
            if self.state == Some(FootState::Stance) {
                self.transition(Some(FootState::Wait), now);
            }
        } else if self.state == Some(FootState::Wait)
            && self.target.map_or(false, |target| !target.is_zero())
        {
            self.transition(Some(FootState::Stance), now);
        }
    }

    fn set_target(&mut self, target: BodyTarget, speed_scale: f32) {
        self.target = Some(target);
        self.speed_scale = speed_scale;
        self.swing_target = self.compute_swing_target();
        // refresh the plan the leg is following under the new target
        if self.state.is_some() {
            let plan = self.plan_for_state(self.state);
            self.send_plan(plan);
        }
    }

    fn compute_swing_target(&self) -> Option<Point2<f32>> {
        let center = self.center();
        let stance = self.motion_plan(0.0).in_leg_frame(self.leg_id);
        let direction = match &stance {
            Plan::Velocity { linear, .. } | Plan::Arc { linear, .. } => {
                let horizontal = Vector2::new(linear.x, linear.y);
                let length = horizontal.norm();
                if length > 1e-6 {
                    // recover opposite the stance drift
                    Some(-horizontal / length)
                } else {
                    None
                }
            }
            _ => None,
        };
        let step = (self.params.float("res.step_ratio")
            * self.params.float("res.fields.center.radius")) as f32;
        match direction {
            Some(direction) => Some(center + direction * (step / 2.0)),
            None => Some(center),
        }
    }

    fn plan_for_state(&self, state: Option<FootState>) -> Plan {
        match state {
            None | Some(FootState::Wait) => Plan::stop(),
            Some(FootState::Stance) => {
                let Some(target) = self.target else {
                    return Plan::stop();
                };
                self.motion_plan(target.dz)
            }
            Some(FootState::Lift) => {
                self.motion_plan(self.params.float("res.lift_velocity") as f32)
            }
            Some(FootState::Lower) => {
                self.motion_plan(-(self.params.float("res.lower_velocity") as f32))
            }
            Some(FootState::Swing) => {
                let target = self.swing_target.unwrap_or_else(|| self.center());
                let apex = (self.params.float("res.lower_height")
                    + self.params.float("res.lift_height")) as f32;
                Plan::Target {
                    frame: Frame::Leg,
                    linear: Vector3::new(target.x, target.y, apex),
                    speed: self.params.float("res.swing_velocity") as f32 * self.speed_scale,
                }
            }
        }
    }

    /// Body frame plan that keeps a grounded foot tracking the body target,
    /// with the given vertical rate folded in.
    fn motion_plan(&self, vertical: f32) -> Plan {
        let Some(target) = self.target else {
            return Plan::stop();
        };
        match target.rotation_center {
            RotationCenter::Translate => {
                let raw = Vector3::new(-target.speed, 0.0, vertical);
                let magnitude = raw.norm();
                if magnitude < 1e-6 {
                    return Plan::stop();
                }
                Plan::Velocity {
                    frame: Frame::Body,
                    linear: raw / magnitude,
                    speed: magnitude * self.speed_scale,
                }
            }
            RotationCenter::Point(center) => {
                let omega = target.speed;
                if omega.abs() < 1e-9 {
                    if vertical.abs() < 1e-6 {
                        return Plan::stop();
                    }
                    return Plan::Velocity {
                        frame: Frame::Body,
                        linear: Vector3::new(0.0, 0.0, vertical.signum()),
                        speed: vertical.abs() * self.speed_scale,
                    };
                }
                let center = Vector3::new(center.x, center.y, 0.0);
                // grounded feet sweep opposite the body rotation about the
                // center; the tangent makes the per tick rotation about the
                // origin come out as a rotation about the center
                let tangent = Vector3::z().cross(&center) * omega.signum();
                let linear = tangent + Vector3::new(0.0, 0.0, vertical / omega.abs());
                Plan::Arc {
                    frame: Frame::Body,
                    linear,
                    angular: Vector3::new(0.0, 0.0, -omega.signum()),
                    speed: omega.abs() * self.speed_scale,
                }
            }
        }
    }

    fn send_plan(&mut self, plan: Plan) {
        self.leg_plan = Some(plan.in_leg_frame(self.leg_id));
        if let Err(error) = self.leg.borrow_mut().send_plan(&plan) {
            warn!(
                "leg {} rejected {:?} plan: {}",
                self.leg_id.number(),
                self.state,
                error
            );
        }
    }
}
