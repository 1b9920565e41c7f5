//! Service context
//!
//! What a service sees of itself and of the application from inside its
//! hooks: identity, worker, configuration, bound objects and notifications.

use std::collections::HashMap;

use parking_lot::RwLock;
use sight_com::{Blocker, HasSignals, Signal, Signals, Slots, Worker};
use sight_data::{Object, ObjectRef};

use super::signals as signal_keys;
use crate::{
    Access, ApplicationContext, ConfigTree, ServiceConfig, ServiceError, ServiceResult,
    WeakApplicationContext,
};

pub struct ServiceContext {
    uid: String,
    type_name: String,
    worker: Worker,
    signals: Signals,
    slots: Slots,
    config: RwLock<ServiceConfig>,
    objects: RwLock<HashMap<String, ObjectRef>>,
    app: WeakApplicationContext,
    pub(crate) started: Signal<()>,
    pub(crate) updated: Signal<()>,
    pub(crate) swapped: Signal<()>,
    pub(crate) stopped: Signal<()>,
    info_notified: Signal<String>,
    success_notified: Signal<String>,
    failure_notified: Signal<String>,
}

impl ServiceContext {
    pub(crate) fn new(
        uid: String,
        type_name: String,
        worker: Worker,
        app: WeakApplicationContext,
    ) -> Self {
        let signals = Signals::new();
        let started = signals.new_signal(signal_keys::STARTED);
        let updated = signals.new_signal(signal_keys::UPDATED);
        let swapped = signals.new_signal(signal_keys::SWAPPED);
        let stopped = signals.new_signal(signal_keys::STOPPED);
        let info_notified = signals.new_signal(signal_keys::INFO_NOTIFIED);
        let success_notified = signals.new_signal(signal_keys::SUCCESS_NOTIFIED);
        let failure_notified = signals.new_signal(signal_keys::FAILURE_NOTIFIED);

        Self {
            uid,
            type_name,
            worker,
            signals,
            slots: Slots::new(),
            config: RwLock::new(ServiceConfig::default()),
            objects: RwLock::new(HashMap::new()),
            app,
            started,
            updated,
            swapped,
            stopped,
            info_notified,
            success_notified,
            failure_notified,
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    pub fn signals(&self) -> &Signals {
        &self.signals
    }

    pub fn slots(&self) -> &Slots {
        &self.slots
    }

    /// Typed lookup of one of this service's signals
    pub fn signal<A: Clone + Send + 'static>(&self, key: &str) -> Option<Signal<A>> {
        self.signals.get(key)
    }

    /// The application this service belongs to, if still alive
    pub fn app(&self) -> Option<ApplicationContext> {
        self.app.upgrade()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Configuration
    // ─────────────────────────────────────────────────────────────────────────

    pub fn config(&self) -> ConfigTree {
        self.config.read().tree.clone()
    }

    pub fn service_config(&self) -> ServiceConfig {
        self.config.read().clone()
    }

    pub(crate) fn set_config(&self, config: ServiceConfig) {
        *self.config.write() = config;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Objects
    // ─────────────────────────────────────────────────────────────────────────

    /// Object bound under `key`, whatever its access
    pub fn object(&self, key: &str) -> Option<ObjectRef> {
        self.objects.read().get(key).cloned()
    }

    pub fn input(&self, key: &str) -> Option<ObjectRef> {
        self.object_with(key, Access::In)
    }

    pub fn inout(&self, key: &str) -> Option<ObjectRef> {
        self.object_with(key, Access::InOut)
    }

    pub fn output(&self, key: &str) -> Option<ObjectRef> {
        self.object_with(key, Access::Out)
    }

    /// Object bound under `key`, or a precondition error
    pub fn required(&self, key: &str) -> ServiceResult<ObjectRef> {
        self.object(key).ok_or_else(|| {
            ServiceError::Precondition(format!("service '{}' has no object '{key}'", self.uid))
        })
    }

    /// Keys currently bound to an object
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.objects.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn object_with(&self, key: &str, access: Access) -> Option<ObjectRef> {
        let declared = self.config.read().object(key).map(|o| o.access);
        match declared {
            Some(declared) if declared != access => None,
            _ => self.object(key),
        }
    }

    pub(crate) fn bind(&self, key: &str, object: Option<ObjectRef>) {
        let mut objects = self.objects.write();
        match object {
            Some(object) => {
                objects.insert(key.to_string(), object);
            }
            None => {
                objects.remove(key);
            }
        }
    }

    /// Publish or withdraw an output.
    ///
    /// The object is bound locally under `key`. When the configuration maps
    /// the key to an application uid, the output is also registered so that
    /// services waiting for it can be created.
    pub fn set_output(&self, key: &str, object: Option<ObjectRef>) -> ServiceResult<()> {
        let binding = self.config.read().object(key).cloned();
        if let Some(binding) = &binding {
            if binding.access != Access::Out {
                return Err(ServiceError::Precondition(format!(
                    "key '{key}' of service '{}' is not an output",
                    self.uid
                )));
            }
        }

        self.bind(key, object.clone());

        let (Some(binding), Some(app)) = (binding, self.app()) else {
            tracing::debug!(service = %self.uid, key, "Output set locally");
            return Ok(());
        };

        match object {
            Some(object) => app.registry().register_output(&binding.uid, object, &self.uid),
            None => {
                app.registry().unregister_output(&binding.uid);
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Notifications
    // ─────────────────────────────────────────────────────────────────────────

    pub fn notify_info(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(service = %self.uid, "{message}");
        self.info_notified.async_emit(message);
    }

    pub fn notify_success(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(service = %self.uid, "{message}");
        self.success_notified.async_emit(message);
    }

    pub fn notify_failure(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(service = %self.uid, "{message}");
        self.failure_notified.async_emit(message);
    }

    /// Block the connection from `signal_key` of `object` to this service's
    /// `slot_key` until the guard is dropped. `None` if they are not
    /// connected.
    pub fn blocker(&self, object: &Object, signal_key: &str, slot_key: &str) -> Option<Blocker> {
        let signal = object.signals().get_base(signal_key)?;
        let slot = self.slots.get_base(slot_key)?;
        signal.connection_to(slot.id()).map(|connection| connection.blocker())
    }
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("uid", &self.uid)
            .field("type", &self.type_name)
            .field("worker", &self.worker.name())
            .field("objects", &self.keys())
            .finish()
    }
}
