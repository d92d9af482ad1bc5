//! Hot reloadable parameter store.
//!
//! Parameters live under dotted names (`res.fields.center.radius`).
//! Writes come from operator side code, reads from the gait coordinator;
//! a change fires a notification keyed by the full parameter name.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::signals::{Signals, Token};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamValue {
    Float(f64),
    Bool(bool),
}

impl ParamValue {
    pub fn as_f64(self) -> f64 {
        match self {
            ParamValue::Float(value) => value,
            ParamValue::Bool(value) => value as u8 as f64,
        }
    }

    pub fn as_bool(self) -> bool {
        match self {
            ParamValue::Float(value) => value != 0.0,
            ParamValue::Bool(value) => value,
        }
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Float(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

pub struct ParamStore {
    values: Rc<RefCell<BTreeMap<String, ParamValue>>>,
    signals: Signals<String, ParamValue>,
}

impl Clone for ParamStore {
    fn clone(&self) -> Self {
        ParamStore {
            values: Rc::clone(&self.values),
            signals: self.signals.clone(),
        }
    }
}

impl ParamStore {
    pub fn new() -> Self {
        ParamStore {
            values: Rc::new(RefCell::new(BTreeMap::new())),
            signals: Signals::new(),
        }
    }

    /// Set a parameter, notifying subscribers only on an actual change.
    pub fn set(&self, name: &str, value: impl Into<ParamValue>) {
        let value = value.into();
        let previous = self.values.borrow_mut().insert(name.to_owned(), value);
        if previous != Some(value) {
            self.signals.trigger(&name.to_owned(), &value);
        }
    }

    /// Install defaults under a namespace without clobbering existing values.
    pub fn set_defaults(&self, namespace: &str, entries: &[(&str, ParamValue)]) {
        for (key, value) in entries {
            let name = format!("{namespace}.{key}");
            if !self.values.borrow().contains_key(&name) {
                self.set(&name, *value);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<ParamValue> {
        self.values.borrow().get(name).copied()
    }

    pub fn float(&self, name: &str) -> f64 {
        match self.get(name) {
            Some(value) => value.as_f64(),
            None => {
                tracing::warn!("missing parameter {}", name);
                0.0
            }
        }
    }

    pub fn flag(&self, name: &str) -> bool {
        self.get(name).map(ParamValue::as_bool).unwrap_or(false)
    }

    pub fn on_change(&self, name: &str, callback: impl FnMut(&ParamValue) + 'static) -> Token {
        self.signals.on(name.to_owned(), callback)
    }

    pub fn unsubscribe(&self, token: Token) {
        self.signals.off(token);
    }

    pub fn list(&self, namespace: Option<&str>) -> Vec<String> {
        self.values
            .borrow()
            .keys()
            .filter(|name| namespace.map_or(true, |ns| name.starts_with(ns)))
            .cloned()
            .collect()
    }
}

impl Default for ParamStore {
    fn default() -> Self {
        ParamStore::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get() {
        let params = ParamStore::new();
        params.set("res.r_thresh", 0.4);
        assert_eq!(params.float("res.r_thresh"), 0.4);
        params.set("res.speed_by_restriction", true);
        assert!(params.flag("res.speed_by_restriction"));
    }

    #[test]
    fn change_notification_fires_once_per_change() {
        let params = ParamStore::new();
        let count = Rc::new(RefCell::new(0));
        let handle = Rc::clone(&count);
        params.on_change("res.r_max", move |_| *handle.borrow_mut() += 1);

        params.set("res.r_max", 0.8);
        params.set("res.r_max", 0.8);
        assert_eq!(*count.borrow(), 1);
        params.set("res.r_max", 0.9);
        assert_eq!(*count.borrow(), 2);
    }

    #[test]
    fn defaults_do_not_clobber() {
        let params = ParamStore::new();
        params.set("res.max_feet_up", 2.0);
        params.set_defaults(
            "res",
            &[
                ("max_feet_up", ParamValue::Float(1.0)),
                ("r_thresh", ParamValue::Float(0.4)),
            ],
        );
        assert_eq!(params.float("res.max_feet_up"), 2.0);
        assert_eq!(params.float("res.r_thresh"), 0.4);
    }

    #[test]
    fn list_filters_by_namespace() {
        let params = ParamStore::new();
        params.set("res.r_thresh", 0.4);
        params.set("speed.foot", 1.0);
        let names = params.list(Some("res."));
        assert_eq!(names, vec!["res.r_thresh".to_owned()]);
    }
}
