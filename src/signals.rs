//! Keyed synchronous event hub.
//!
//! Handlers fire in registration order. A handler may unsubscribe itself or
//! a sibling during dispatch without skipping the remaining handlers.

use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token(u64);

struct Entry<K, E> {
    id: u64,
    key: K,
    // taken out of the slot while the handler is executing
    callback: Option<Box<dyn FnMut(&E)>>,
    removed: bool,
}

struct Registry<K, E> {
    next_id: u64,
    entries: Vec<Entry<K, E>>,
}

pub struct Signals<K, E> {
    inner: Rc<RefCell<Registry<K, E>>>,
}

impl<K, E> Clone for Signals<K, E> {
    fn clone(&self) -> Self {
        Signals {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<K: PartialEq + Clone, E> Signals<K, E> {
    pub fn new() -> Self {
        Signals {
            inner: Rc::new(RefCell::new(Registry {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    pub fn on(&self, key: K, callback: impl FnMut(&E) + 'static) -> Token {
        let mut registry = self.inner.borrow_mut();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.entries.push(Entry {
            id,
            key,
            callback: Some(Box::new(callback)),
            removed: false,
        });
        Token(id)
    }

    pub fn off(&self, token: Token) {
        let mut registry = self.inner.borrow_mut();
        if let Some(index) = registry.entries.iter().position(|e| e.id == token.0) {
            if registry.entries[index].callback.is_some() {
                registry.entries.remove(index);
            } else {
                // currently dispatching, drop it once the handler returns
                registry.entries[index].removed = true;
            }
        }
    }

    pub fn trigger(&self, key: &K, event: &E) {
        let ids: Vec<u64> = self
            .inner
            .borrow()
            .entries
            .iter()
            .filter(|e| &e.key == key && !e.removed)
            .map(|e| e.id)
            .collect();
        for id in ids {
            let callback = {
                let mut registry = self.inner.borrow_mut();
                match registry.entries.iter_mut().find(|e| e.id == id) {
                    Some(entry) if !entry.removed => entry.callback.take(),
                    _ => None,
                }
            };
            let Some(mut callback) = callback else {
                continue;
            };
            callback(event);
            let mut registry = self.inner.borrow_mut();
            if let Some(index) = registry.entries.iter().position(|e| e.id == id) {
                if registry.entries[index].removed {
                    registry.entries.remove(index);
                } else {
                    registry.entries[index].callback = Some(callback);
                }
            }
        }
    }
}

impl<K: PartialEq + Clone, E> Default for Signals<K, E> {
    fn default() -> Self {
        Signals::new()
    }
}
