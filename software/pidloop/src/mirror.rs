//! Mirroring of tunable parameters to an external key-value table.
//!
//! A controller attached to a [`ParameterTable`] publishes its gains, setpoint
//! and enabled state whenever they change, and subscribes to externally pushed
//! changes so that the values can be tuned live.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

/// Keys mirrored by a controller.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Parameter {
    P,
    I,
    D,
    F,
    Setpoint,
    Enabled,
}

impl Parameter {
    pub const ALL: [Parameter; 6] = [
        Parameter::P,
        Parameter::I,
        Parameter::D,
        Parameter::F,
        Parameter::Setpoint,
        Parameter::Enabled,
    ];

    /// Table entry name.
    pub fn key(&self) -> &'static str {
        match self {
            Parameter::P => "p",
            Parameter::I => "i",
            Parameter::D => "d",
            Parameter::F => "f",
            Parameter::Setpoint => "setpoint",
            Parameter::Enabled => "enabled",
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// A mirrored value.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub enum ParamValue {
    Number(f64),
    Flag(bool),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            ParamValue::Number(x) => Some(x),
            ParamValue::Flag(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            ParamValue::Flag(b) => Some(b),
            ParamValue::Number(_) => None,
        }
    }
}

/// Callback run when a mirrored value is changed from outside.
pub type ChangeHook = Arc<dyn Fn(ParamValue) + Send + Sync>;

/// Identifies one subscription so that it can be removed.
pub type ListenerId = u64;

/// An external table that mirrors controller state.
///
/// Implementations must call hooks without holding any lock that
/// `publish`, `subscribe` or `unsubscribe` also take, since hooks call back
/// into the controller, which may publish again.
pub trait ParameterTable: Send + Sync {
    /// Store a value set by the controller.
    /// This is a local change and must not trigger subscribed hooks.
    fn publish(&self, key: Parameter, value: ParamValue);

    /// Register a hook for changes pushed to `key` from outside.
    fn subscribe(&self, key: Parameter, hook: ChangeHook) -> ListenerId;

    /// Remove a hook. Unknown ids are ignored.
    fn unsubscribe(&self, id: ListenerId);
}

#[derive(Default)]
struct MemoryTableInner {
    values: BTreeMap<Parameter, ParamValue>,
    listeners: BTreeMap<ListenerId, (Parameter, ChangeHook)>,
    next_id: ListenerId,
}

/// In-process [`ParameterTable`].
///
/// Stands in for a remote dashboard table: [`MemoryTable::put_remote`]
/// plays the role of an operator editing a value.
#[derive(Default)]
pub struct MemoryTable {
    inner: Mutex<MemoryTableInner>,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest value for a key, whichever side wrote it.
    pub fn get(&self, key: Parameter) -> Option<ParamValue> {
        self.lock().values.get(&key).copied()
    }

    /// Apply an externally pushed change, notifying subscribers of `key`
    /// if the value differs from what is stored.
    pub fn put_remote(&self, key: Parameter, value: ParamValue) {
        let hooks: Vec<ChangeHook> = {
            let mut inner = self.lock();
            if inner.values.get(&key) == Some(&value) {
                return;
            }
            inner.values.insert(key, value);
            inner
                .listeners
                .values()
                .filter(|(k, _)| *k == key)
                .map(|(_, hook)| hook.clone())
                .collect()
        };

        for hook in hooks {
            hook(value);
        }
    }

    /// Number of active subscriptions.
    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryTableInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ParameterTable for MemoryTable {
    fn publish(&self, key: Parameter, value: ParamValue) {
        self.lock().values.insert(key, value);
    }

    fn subscribe(&self, key: Parameter, hook: ChangeHook) -> ListenerId {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.listeners.insert(id, (key, hook));
        id
    }

    fn unsubscribe(&self, id: ListenerId) {
        self.lock().listeners.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn publish_does_not_notify() {
        let table = MemoryTable::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        table.subscribe(
            Parameter::P,
            Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );

        table.publish(Parameter::P, ParamValue::Number(1.0));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(table.get(Parameter::P), Some(ParamValue::Number(1.0)));
    }

    #[test]
    fn remote_change_notifies_matching_key_once() {
        let table = MemoryTable::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        table.subscribe(
            Parameter::Setpoint,
            Arc::new(move |v| s.lock().unwrap().push(v)),
        );
        let other = Arc::new(AtomicUsize::new(0));
        let o = other.clone();
        table.subscribe(
            Parameter::D,
            Arc::new(move |_| {
                o.fetch_add(1, Ordering::SeqCst);
            }),
        );

        table.put_remote(Parameter::Setpoint, ParamValue::Number(4.0));
        // Same value again is not a change
        table.put_remote(Parameter::Setpoint, ParamValue::Number(4.0));

        assert_eq!(*seen.lock().unwrap(), vec![ParamValue::Number(4.0)]);
        assert_eq!(other.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unsubscribed_hooks_are_not_called() {
        let table = MemoryTable::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let id = table.subscribe(
            Parameter::Enabled,
            Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(table.listener_count(), 1);

        table.unsubscribe(id);
        table.put_remote(Parameter::Enabled, ParamValue::Flag(true));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(table.listener_count(), 0);
    }

    #[test]
    fn param_value_accessors() {
        assert_eq!(ParamValue::Number(2.0).as_f64(), Some(2.0));
        assert_eq!(ParamValue::Number(2.0).as_bool(), None);
        assert_eq!(ParamValue::Flag(true).as_bool(), Some(true));
        assert_eq!(Parameter::Setpoint.to_string(), "setpoint");
    }
}
