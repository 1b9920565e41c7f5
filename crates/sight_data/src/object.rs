//! Data objects
//!
//! An object pairs a uid with a payload and a `modified` signal. The payload
//! sits behind a per-object read/write lock: take `write()` before mutating,
//! release it, then call `notify_modified()`.

use std::sync::Arc;

use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use sight_com::{HasSignals, Signal, Signals};

use crate::{Data, DataError, DataResult};

/// Shared handle on an object
pub type ObjectRef = Arc<Object>;

pub struct Object {
    uid: String,
    class: &'static str,
    data: RwLock<Box<dyn Data>>,
    signals: Signals,
    modified: Signal<()>,
}

impl Object {
    /// Key of the signal emitted after the payload changed
    pub const MODIFIED_SIG: &'static str = "modified";

    pub fn new(uid: impl Into<String>, data: impl Data) -> ObjectRef {
        Self::from_boxed(uid, Box::new(data))
    }

    pub fn from_boxed(uid: impl Into<String>, data: Box<dyn Data>) -> ObjectRef {
        let signals = Signals::new();
        let modified = signals.new_signal::<()>(Self::MODIFIED_SIG);

        Arc::new(Self {
            uid: uid.into(),
            class: data.type_name(),
            data: RwLock::new(data),
            signals,
            modified,
        })
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Type name of the payload
    pub fn class(&self) -> &'static str {
        self.class
    }

    pub fn is<T: Data>(&self) -> bool {
        self.data.read().as_any().is::<T>()
    }

    /// Shared access to the payload, `None` if it is not a `T`
    pub fn read<T: Data>(&self) -> Option<MappedRwLockReadGuard<'_, T>> {
        RwLockReadGuard::try_map(self.data.read(), |data| data.as_any().downcast_ref::<T>()).ok()
    }

    /// Exclusive access to the payload, `None` if it is not a `T`
    pub fn write<T: Data>(&self) -> Option<MappedRwLockWriteGuard<'_, T>> {
        RwLockWriteGuard::try_map(self.data.write(), |data| {
            data.as_any_mut().downcast_mut::<T>()
        })
        .ok()
    }

    /// Like `write()` but reports the mismatching type
    pub fn try_write<T: Data>(&self) -> DataResult<MappedRwLockWriteGuard<'_, T>> {
        let found = self.class;
        self.write::<T>().ok_or(DataError::TypeMismatch {
            expected: std::any::type_name::<T>(),
            found,
        })
    }

    /// Replace the payload with another value of the same type
    pub fn replace(&self, data: Box<dyn Data>) -> DataResult<()> {
        if data.type_name() != self.class {
            return Err(DataError::TypeMismatch {
                expected: self.class,
                found: data.type_name(),
            });
        }
        *self.data.write() = data;
        Ok(())
    }

    pub fn modified_signal(&self) -> Signal<()> {
        self.modified.clone()
    }

    /// Asynchronously emit `modified`
    pub fn notify_modified(&self) {
        tracing::trace!(object = %self.uid, "modified");
        self.modified.async_emit(());
    }

    /// JSON view of the payload
    pub fn snapshot(&self) -> serde_json::Value {
        self.data.read().to_value()
    }
}

impl HasSignals for Object {
    fn signals(&self) -> &Signals {
        &self.signals
    }
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Object")
            .field("uid", &self.uid)
            .field("class", &self.class)
            .finish()
    }
}
