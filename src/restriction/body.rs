//! Body level gait coordination.
//!
//! Watches every foot's restriction stream and decides, per telemetry
//! update, which foot may leave the ground. At most `res.max_feet_up` feet
//! are airborne at once, cyclically adjacent legs never are, and a foot
//! pinned against a workspace boundary halts lateral motion until the
//! situation relaxes.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::rc::Rc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::foot::{Foot, FootEvent, FootEventKind, FootState};
use super::odometer::Odometer;
use super::{BodyTarget, Restriction, DEFAULT_PARAMETERS};
use crate::error::StriderResult;
use crate::hexapod::EstopSeverity;
use crate::leg::{LegController, LegEvent, LegEventKind};
use crate::param::ParamStore;
use crate::signals::Signals;

#[derive(Debug, Clone, PartialEq)]
pub enum BodyEvent {
    Halt(bool),
    Enabled(bool),
    Target(BodyTarget),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BodyEventKind {
    Halt,
    Enabled,
    Target,
}

impl BodyEvent {
    pub fn kind(&self) -> BodyEventKind {
        match self {
            BodyEvent::Halt(_) => BodyEventKind::Halt,
            BodyEvent::Enabled(_) => BodyEventKind::Enabled,
            BodyEvent::Target(_) => BodyEventKind::Target,
        }
    }
}

// notes queued by event handlers, drained by update()
enum BodyNote {
    Restriction(u8, Restriction),
    Estop(u8, EstopSeverity),
}

pub struct Body {
    legs: BTreeMap<u8, Rc<RefCell<dyn LegController>>>,
    feet: BTreeMap<u8, Foot>,
    neighbors: BTreeMap<u8, Vec<u8>>,
    pending: Rc<RefCell<VecDeque<BodyNote>>>,
    odometer: Odometer,
    params: ParamStore,
    signals: Signals<BodyEventKind, BodyEvent>,
    halted: bool,
    enabled: bool,
    target: Option<BodyTarget>,
    offline: BTreeSet<u8>,
}

impl Body {
    pub fn new(
        legs: BTreeMap<u8, Rc<RefCell<dyn LegController>>>,
        plan_tick: std::time::Duration,
        params: ParamStore,
    ) -> Body {
        params.set_defaults("res", DEFAULT_PARAMETERS);

        let numbers: Vec<u8> = legs.keys().copied().collect();
        let mut neighbors = BTreeMap::new();
        if numbers.len() > 1 {
            for (index, number) in numbers.iter().enumerate() {
                let previous = if index == 0 {
                    numbers[numbers.len() - 1]
                } else {
                    numbers[index - 1]
                };
                let next = if index == numbers.len() - 1 {
                    numbers[0]
                } else {
                    numbers[index + 1]
                };
                neighbors.insert(*number, vec![previous, next]);
            }
        }

        let pending: Rc<RefCell<VecDeque<BodyNote>>> = Rc::new(RefCell::new(VecDeque::new()));
        let mut feet = BTreeMap::new();
        for (number, leg) in &legs {
            let foot = Foot::new(Rc::clone(leg), params.clone(), plan_tick);
            {
                let pending = Rc::clone(&pending);
                let number = *number;
                foot.signals().on(FootEventKind::Restriction, move |event| {
                    if let FootEvent::Restriction(restriction) = event {
                        pending
                            .borrow_mut()
                            .push_back(BodyNote::Restriction(number, *restriction));
                    }
                });
            }
            {
                let pending = Rc::clone(&pending);
                let number = *number;
                leg.borrow().signals().on(LegEventKind::Estop, move |event| {
                    if let LegEvent::Estop(severity) = event {
                        pending
                            .borrow_mut()
                            .push_back(BodyNote::Estop(number, *severity));
                    }
                });
            }
            feet.insert(*number, foot);
        }

        let mut body = Body {
            legs,
            feet,
            neighbors,
            pending,
            odometer: Odometer::new(),
            params,
            signals: Signals::new(),
            halted: false,
            enabled: false,
            target: None,
            offline: BTreeSet::new(),
        };
        body.disable(Instant::now());
        body
    }

    pub fn signals(&self) -> Signals<BodyEventKind, BodyEvent> {
        self.signals.clone()
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn odometer(&self) -> &Odometer {
        &self.odometer
    }

    pub fn target(&self) -> Option<BodyTarget> {
        self.target
    }

    pub fn foot_state(&self, leg_number: u8) -> Option<FootState> {
        self.feet.get(&leg_number).and_then(Foot::state)
    }

    pub fn enable(&mut self, now: Instant) {
        debug!("body enable");
        self.enabled = true;
        self.set_halt(false, now);
        self.odometer.reset();
        self.odometer.set_enabled(true, now);
        for foot in self.feet.values() {
            foot.reset(now);
        }
        self.signals
            .trigger(&BodyEventKind::Enabled, &BodyEvent::Enabled(true));
    }

    pub fn disable(&mut self, now: Instant) {
        debug!("body disable");
        self.enabled = false;
        for foot in self.feet.values() {
            foot.set_state(None, now);
        }
        self.signals
            .trigger(&BodyEventKind::Enabled, &BodyEvent::Enabled(false));
    }

    pub fn set_halt(&mut self, halted: bool, now: Instant) {
        if self.halted == halted {
            return;
        }
        info!("body halt {}", halted);
        self.halted = halted;
        for foot in self.feet.values() {
            foot.set_halt(halted, now);
        }
        self.odometer.set_enabled(!halted && self.enabled, now);
        self.signals
            .trigger(&BodyEventKind::Halt, &BodyEvent::Halt(halted));
    }

    pub fn set_target(&mut self, target: BodyTarget, now: Instant) {
        let scale = if self.params.flag("res.speed_by_restriction") {
            self.speed_by_restriction()
        } else {
            1.0
        };
        self.target = Some(target);
        self.odometer.set_target(target, now);
        for foot in self.feet.values() {
            foot.set_target(target, scale);
        }
        self.signals
            .trigger(&BodyEventKind::Target, &BodyEvent::Target(target));
    }

    /// Stance speed factor from the most restricted grounded foot.
    fn speed_by_restriction(&self) -> f32 {
        let worst = self
            .feet
            .values()
            .filter(|foot| {
                !matches!(foot.state(), Some(FootState::Swing) | Some(FootState::Lower))
            })
            .filter_map(Foot::restriction)
            .map(|restriction| restriction.r)
            .fold(0.0_f64, f64::max);
        (1.0 - worst).clamp(0.0, 1.0) as f32
    }

    /// Offset every foot's steering center by a body frame (dx, dy).
    pub fn offset_foot_centers(&mut self, dx: f32, dy: f32) {
        for (number, foot) in &self.feet {
            let leg = crate::hexapod::LegId::from_number(*number);
            let Ok(leg) = leg else { continue };
            let rotated = crate::plans::body_to_leg_rotation(leg)
                * nalgebra::Vector3::new(dx, dy, 0.0);
            foot.set_center_offset(nalgebra::Vector2::new(rotated.x, rotated.y));
        }
    }

    /// Poll every leg, fan its events out through the hubs, then run the
    /// arbitration over whatever restriction updates arrived.
    pub fn run_cycle(&mut self, now: Instant) -> StriderResult<()> {
        let numbers: Vec<u8> = self.legs.keys().copied().collect();
        for number in numbers {
            if self.offline.contains(&number) {
                continue;
            }
            let polled = self.legs[&number].borrow_mut().poll(now);
            match polled {
                Ok(events) => {
                    let hub = self.legs[&number].borrow().signals();
                    for event in events {
                        hub.trigger(&event.kind(), &event);
                    }
                }
                Err(fault) => {
                    error!("leg {} transport fault: {}", number, fault);
                    self.mark_offline(number, now);
                }
            }
        }
        self.update(now);
        Ok(())
    }

    fn mark_offline(&mut self, leg_number: u8, now: Instant) {
        self.offline.insert(leg_number);
        if let Some(foot) = self.feet.get(&leg_number) {
            foot.set_state(None, now);
        }
        self.set_halt(true, now);
    }

    /// Drain queued foot events and arbitrate.
    pub fn update(&mut self, now: Instant) {
        loop {
            let note = self.pending.borrow_mut().pop_front();
            let Some(note) = note else { break };
            match note {
                BodyNote::Restriction(leg_number, restriction) => {
                    self.on_restriction(leg_number, restriction, now);
                }
                BodyNote::Estop(leg_number, severity) => {
                    if severity.latching() {
                        warn!(
                            "leg {} raised {:?}, halting the body",
                            leg_number, severity
                        );
                        self.set_halt(true, now);
                    }
                }
            }
        }
    }

    fn on_restriction(&mut self, leg_number: u8, restriction: Restriction, now: Instant) {
        if !self.enabled {
            return;
        }
        self.odometer.update(now);
        let r_max = self.params.float("res.r_max");
        let r_thresh = self.params.float("res.r_thresh");
        let state = self.foot_state(leg_number);

        if self.halted {
            // unhalt only when every grounded moving foot is either under
            // the ceiling or heading towards a less restricted spot
            let mut maxed = false;
            for (number, foot) in &self.feet {
                if matches!(
                    foot.state(),
                    None | Some(FootState::Swing) | Some(FootState::Lower) | Some(FootState::Wait)
                ) {
                    continue;
                }
                let current = if *number == leg_number {
                    Some(restriction)
                } else {
                    foot.restriction()
                };
                let Some(current) = current else { continue };
                if current.nr < current.r {
                    continue;
                }
                if current.r > r_max {
                    maxed = true;
                    break;
                }
            }
            if !maxed {
                debug!("unhalt granted by leg {}", leg_number);
                self.set_halt(false, now);
            }
            return;
        }

        if restriction.r > r_max
            && state == Some(FootState::Stance)
            && restriction.nr >= restriction.r
        {
            debug!(
                "leg {} pinned at r {:.3} nr {:.3}, halting",
                leg_number, restriction.r, restriction.nr
            );
            self.set_halt(true, now);
            return;
        }

        if restriction.r > r_thresh && state == Some(FootState::Stance) {
            self.arbitrate_lift(leg_number, now);
        }
    }

    fn arbitrate_lift(&mut self, leg_number: u8, now: Instant) {
        let states: BTreeMap<u8, Option<FootState>> = self
            .feet
            .iter()
            .map(|(number, foot)| (*number, foot.state()))
            .collect();
        let grounded =
            |state: &Option<FootState>| matches!(state, Some(FootState::Stance | FootState::Wait));
        let feet_up = states.values().filter(|state| !grounded(state)).count();

        let Some(neighbor_numbers) = self.neighbors.get(&leg_number) else {
            return;
        };
        let neighbors_up = neighbor_numbers
            .iter()
            .filter(|number| !grounded(&states[*number]))
            .count();
        let max_feet_up = self.params.float("res.max_feet_up") as usize;
        if neighbors_up > 0 || feet_up >= max_feet_up {
            return;
        }
        let can_lift = max_feet_up - feet_up;

        // this foot competes with every other grounded foot that is also
        // restricted; least recently lifted wins, lower leg number breaks
        // ties
        let r_thresh = self.params.float("res.r_thresh");
        let mut candidates: Vec<(Option<Instant>, u8)> = vec![(
            self.feet[&leg_number].last_lift_time(),
            leg_number,
        )];
        for (number, foot) in &self.feet {
            if *number == leg_number || !grounded(&states[number]) {
                continue;
            }
            if foot
                .restriction()
                .map_or(false, |restriction| restriction.r > r_thresh)
            {
                candidates.push((foot.last_lift_time(), *number));
            }
        }
        candidates.sort();
        let allowed = &candidates[..can_lift.min(candidates.len())];
        if allowed.iter().any(|(_, number)| *number == leg_number)
            && self.feet[&leg_number].should_lift()
        {
            debug!("lift granted to leg {}", leg_number);
            self.feet[&leg_number].command_lift(now);
        }
    }

    #[cfg(test)]
    pub(crate) fn foot(&self, leg_number: u8) -> &Foot {
        &self.feet[&leg_number]
    }

    #[cfg(test)]
    pub(crate) fn inject_restriction(&mut self, leg_number: u8, r: f64, nr: f64, now: Instant) {
        let restriction = Restriction {
            r,
            nr,
            fields: super::FieldValues {
                joint_angle: r,
                ..Default::default()
            },
        };
        self.feet[&leg_number].inject_restriction(restriction);
        self.on_restriction(leg_number, restriction, now);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::hexapod::{EstopSeverity, LegId};
    use crate::leg::sim::SimLeg;
    use crate::leg::DEFAULT_PLAN_TICK;

    fn six_legged_body() -> (Body, Instant) {
        let start = Instant::now();
        let mut legs: BTreeMap<u8, Rc<RefCell<dyn LegController>>> = BTreeMap::new();
        for leg in LegId::REAL {
            let mut sim = SimLeg::new(leg, DEFAULT_PLAN_TICK, start);
            sim.set_estop(EstopSeverity::Off).unwrap();
            legs.insert(leg.number(), Rc::new(RefCell::new(sim)));
        }
        let mut body = Body::new(legs, DEFAULT_PLAN_TICK, ParamStore::new());
        body.enable(start);
        body.set_target(BodyTarget::translate(2.0, 0.0), start);
        (body, start)
    }

    #[test]
    fn neighbors_wrap_around_the_body() {
        let (body, _) = six_legged_body();
        assert_eq!(body.neighbors[&1], vec![6, 2]);
        assert_eq!(body.neighbors[&4], vec![3, 5]);
        assert_eq!(body.neighbors[&6], vec![5, 1]);
    }

    #[test]
    fn equal_lift_times_prefer_the_lower_leg_number() {
        let (mut body, start) = six_legged_body();
        // feet 1 and 2 both report heavy restriction with equal (never)
        // lift times; only leg 1 may lift
        body.foot(2).inject_restriction(Restriction {
            r: 0.9,
            nr: 0.5,
            fields: Default::default(),
        });
        body.inject_restriction(1, 0.9, 0.5, start);
        assert_eq!(body.foot_state(1), Some(FootState::Lift));
        assert_eq!(body.foot_state(2), Some(FootState::Stance));

        // leg 2 now asks and is denied: its neighbor is up
        body.inject_restriction(2, 0.9, 0.5, start + Duration::from_millis(100));
        assert_eq!(body.foot_state(2), Some(FootState::Stance));
    }

    #[test]
    fn least_recently_lifted_foot_wins() {
        let (mut body, start) = six_legged_body();
        // leg 1 lifted recently, leg 4 never did
        body.foot(1).set_last_lift_time(Some(start));
        body.foot(4).inject_restriction(Restriction {
            r: 0.9,
            nr: 0.5,
            fields: Default::default(),
        });
        body.inject_restriction(1, 0.9, 0.5, start + Duration::from_secs(1));
        assert_eq!(body.foot_state(1), Some(FootState::Stance));

        body.inject_restriction(4, 0.9, 0.5, start + Duration::from_secs(1));
        assert_eq!(body.foot_state(4), Some(FootState::Lift));
    }

    #[test]
    fn neighbor_exclusion_blocks_adjacent_lifts() {
        let (mut body, start) = six_legged_body();
        body.foot(1).force_state(Some(FootState::Swing));
        body.inject_restriction(2, 0.9, 0.5, start);
        assert_eq!(body.foot_state(2), Some(FootState::Stance));

        // once leg 1 is back in stance leg 2 is free to go
        body.foot(1).force_state(Some(FootState::Stance));
        body.inject_restriction(2, 0.9, 0.5, start + Duration::from_millis(100));
        assert_eq!(body.foot_state(2), Some(FootState::Lift));
    }

    #[test]
    fn max_feet_up_is_enforced() {
        let (mut body, start) = six_legged_body();
        // a non neighbor is already up
        body.foot(4).force_state(Some(FootState::Swing));
        body.inject_restriction(1, 0.9, 0.5, start);
        assert_eq!(body.foot_state(1), Some(FootState::Stance));
    }

    #[test]
    fn pinned_foot_halts_and_relief_unhalts() {
        let (mut body, start) = six_legged_body();
        assert!(!body.halted());

        // restricted and getting worse: halt
        body.inject_restriction(1, 0.85, 0.9, start);
        assert!(body.halted());
        assert_eq!(body.foot_state(2), Some(FootState::Wait));

        // same leg relaxes: unhalt, feet resume stance
        body.inject_restriction(1, 0.7, 0.5, start + Duration::from_millis(100));
        assert!(!body.halted());
        assert_eq!(body.foot_state(1), Some(FootState::Stance));
        assert_eq!(body.foot_state(2), Some(FootState::Stance));
    }

    #[test]
    fn improving_foot_does_not_halt() {
        let (mut body, start) = six_legged_body();
        // heavily restricted but moving towards a better spot
        body.inject_restriction(1, 0.85, 0.7, start);
        assert!(!body.halted());
    }

    #[test]
    fn stuck_neighbor_keeps_the_body_halted() {
        let (mut body, start) = six_legged_body();
        body.inject_restriction(1, 0.85, 0.9, start);
        assert!(body.halted());

        // leg 1 is parked in wait; leg 2 stays restricted in stance, so
        // force it there to model a foot that cannot be parked
        body.foot(2).force_state(Some(FootState::Stance));
        body.foot(2).inject_restriction(Restriction {
            r: 0.9,
            nr: 0.9,
            fields: Default::default(),
        });
        body.inject_restriction(3, 0.1, 0.1, start + Duration::from_millis(100));
        assert!(body.halted());
    }

    #[test]
    fn center_offsets_rotate_into_each_leg_frame() {
        let (mut body, _) = six_legged_body();
        body.offset_foot_centers(4.0, 0.0);
        // middle left leg points along body +y, so a body +x offset lands
        // on leg -y
        let offset = body.foot(2).center_offset();
        assert!((offset.x - 0.0).abs() < 1e-5, "offset {offset:?}");
        assert!((offset.y + 4.0).abs() < 1e-5, "offset {offset:?}");
    }

    #[test]
    fn disabled_body_ignores_restriction_events() {
        let (mut body, start) = six_legged_body();
        body.disable(start);
        body.inject_restriction(1, 0.95, 0.95, start);
        assert!(!body.halted());
        assert_eq!(body.foot_state(1), None);
    }

    #[test]
    fn latched_leg_estop_halts_the_body() {
        let (mut body, start) = six_legged_body();
        body.pending
            .borrow_mut()
            .push_back(BodyNote::Estop(3, EstopSeverity::Hold));
        body.update(start);
        assert!(body.halted());
    }

    /// End to end: six simulated legs walking a translation target. The
    /// quantified gait invariants must hold on every cycle.
    #[test]
    fn walking_respects_gait_invariants() {
        let (mut body, start) = six_legged_body();
        let airborne = |state: Option<FootState>| {
            matches!(
                state,
                Some(FootState::Lift) | Some(FootState::Swing) | Some(FootState::Lower)
            )
        };

        let mut now = start;
        let mut lifts_seen = 0;
        let mut previous: BTreeMap<u8, Option<FootState>> = BTreeMap::new();
        for _ in 0..400 {
            now += Duration::from_millis(110);
            body.run_cycle(now).unwrap();

            let states: BTreeMap<u8, Option<FootState>> = (1..=6)
                .map(|number| (number, body.foot_state(number)))
                .collect();
            // at most one foot airborne
            let up = states.values().filter(|state| airborne(**state)).count();
            assert!(up <= 1, "too many feet up: {states:?}");
            // no two neighbors airborne together
            for (number, neighbors) in &body.neighbors {
                if airborne(states[number]) {
                    for neighbor in neighbors {
                        assert!(
                            !airborne(states[neighbor]),
                            "neighbors {number} and {neighbor} both up: {states:?}"
                        );
                    }
                }
            }
            for (number, state) in &states {
                if *state == Some(FootState::Lift) && previous.get(number) != Some(state) {
                    lifts_seen += 1;
                }
            }
            previous = states;
        }
        // the walk actually cycles feet
        assert!(lifts_seen > 0, "no foot ever lifted");
    }
}
