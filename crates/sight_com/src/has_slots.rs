//! String-keyed slot maps

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::{Slot, SlotBase};

/// Slots of an object, indexed by key
#[derive(Default)]
pub struct Slots {
    map: RwLock<HashMap<String, Arc<dyn SlotBase>>>,
}

impl Slots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a slot, returning the one previously under `key`
    pub fn insert<A, R>(&self, key: impl Into<String>, slot: &Slot<A, R>) -> Option<Arc<dyn SlotBase>>
    where
        A: Send + 'static,
        R: Send + 'static,
    {
        self.insert_base(key, slot.as_base())
    }

    pub fn insert_base(
        &self,
        key: impl Into<String>,
        slot: Arc<dyn SlotBase>,
    ) -> Option<Arc<dyn SlotBase>> {
        self.map.write().insert(key.into(), slot)
    }

    /// Typed lookup. `None` if missing or if the signature differs.
    pub fn get<A, R>(&self, key: &str) -> Option<Slot<A, R>>
    where
        A: Send + 'static,
        R: Send + 'static,
    {
        self.get_base(key).and_then(Slot::from_base)
    }

    pub fn get_base(&self, key: &str) -> Option<Arc<dyn SlotBase>> {
        self.map.read().get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<Arc<dyn SlotBase>> {
        self.map.write().remove(key)
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

impl std::fmt::Debug for Slots {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slots").field("keys", &self.keys()).finish()
    }
}

/// Anything exposing a slot map
pub trait HasSlots {
    fn slots(&self) -> &Slots;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Worker;

    #[test]
    fn test_typed_lookup_keeps_worker() {
        let worker = Worker::spawn("slots-test").unwrap();
        let slots = Slots::new();
        let slot: Slot<i32, i32> = Slot::with_worker(worker.clone(), |x| x * 10);
        slots.insert("scale", &slot);

        let found = slots.get::<i32, i32>("scale").unwrap();
        assert_eq!(found.call(2), Ok(20));
        assert!(slots.get::<i32, ()>("scale").is_none());

        assert_eq!(found.id(), slot.id());
        assert_eq!(found.async_call(3).wait(), Ok(30));
        worker.stop();
    }
}
