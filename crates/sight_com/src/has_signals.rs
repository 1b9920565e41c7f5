//! String-keyed signal maps

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::{Signal, SignalBase};

/// Signals of an object, indexed by key
#[derive(Default)]
pub struct Signals {
    map: RwLock<HashMap<String, Arc<dyn SignalBase>>>,
}

impl Signals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a signal and register it under `key`
    pub fn new_signal<A: Clone + Send + 'static>(&self, key: impl Into<String>) -> Signal<A> {
        let signal = Signal::new();
        self.insert(key, &signal);
        signal
    }

    /// Register a signal, returning the one previously under `key`
    pub fn insert<A: Clone + Send + 'static>(
        &self,
        key: impl Into<String>,
        signal: &Signal<A>,
    ) -> Option<Arc<dyn SignalBase>> {
        self.insert_base(key, signal.as_base())
    }

    pub fn insert_base(
        &self,
        key: impl Into<String>,
        signal: Arc<dyn SignalBase>,
    ) -> Option<Arc<dyn SignalBase>> {
        self.map.write().insert(key.into(), signal)
    }

    /// Typed lookup. `None` if missing or if the argument type differs.
    pub fn get<A: Clone + Send + 'static>(&self, key: &str) -> Option<Signal<A>> {
        self.get_base(key).and_then(Signal::from_base)
    }

    pub fn get_base(&self, key: &str) -> Option<Arc<dyn SignalBase>> {
        self.map.read().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.read().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.map.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl std::fmt::Debug for Signals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signals").field("keys", &self.keys()).finish()
    }
}

/// Anything exposing a signal map
pub trait HasSignals {
    fn signals(&self) -> &Signals;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_lookup() {
        let signals = Signals::new();
        let created = signals.new_signal::<(i32, String)>("changed");

        let found = signals.get::<(i32, String)>("changed").unwrap();
        assert_eq!(found.id(), created.id());

        assert!(signals.get::<i32>("changed").is_none());
        assert!(signals.get::<(i32, String)>("missing").is_none());
        assert_eq!(signals.keys(), vec!["changed".to_string()]);
    }
}
