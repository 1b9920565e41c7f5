//! Application-configuration manager
//!
//! Turns an `AppConfig` into running objects, services and channels, and
//! tears them down again.
//!
//! # Deferred objects
//!
//! An object declared `deferred` is not created by the manager: it appears
//! when a service publishes it as an output. Services that need a missing
//! deferred object are postponed. Once the object is registered the manager
//! creates them, connects their channels and starts / updates them if that
//! was requested. When the object disappears, the services depending on it
//! are stopped and destroyed; services for which it is optional only lose
//! the binding. These reactions run on the manager's own worker.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use sight_com::{Connections, HasSignals, HasSlots, SignalBase, Slot, SlotBase, Slots, Worker};
use sight_data::ObjectRef;

use crate::app_config::{ObjectRefDecl, Parameters, ServiceDecl};
use crate::{
    Access, AppConfig, ApplicationContext, ProxyConnections, ServiceError, ServiceObject,
    ServiceRef, ServiceResult, REGISTERED_OBJECT_SIG, UNREGISTERED_OBJECT_SIG, signals, slots,
    wait_all,
};

pub const ADD_OBJECTS_SLOT: &str = "addObjects";
pub const REMOVE_OBJECTS_SLOT: &str = "removeObjects";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AppState {
    #[default]
    Destroyed,
    Created,
    Started,
    Stopped,
}

#[derive(Default)]
struct DeferredObject {
    object: Option<ObjectRef>,
    /// Services using this object, in declaration order
    services: Vec<String>,
    /// Channel endpoints owned by this object
    proxies: Vec<ProxyConnections>,
    connected: bool,
}

#[derive(Default)]
struct ManagerState {
    state: AppState,
    created_objects: HashMap<String, ObjectRef>,
    object_proxies: Vec<ProxyConnections>,
    object_proxies_connected: bool,
    deferred_objects: HashMap<String, DeferredObject>,
    deferred_services: HashSet<String>,
    service_proxies: HashMap<String, Vec<ProxyConnections>>,
    created_services: Vec<ServiceRef>,
    started_services: Vec<ServiceRef>,
    deferred_start: Vec<String>,
    deferred_update: Vec<String>,
    created_workers: Vec<String>,
    registry_connections: Connections,
    tracking_slots: Vec<Slot<()>>,
    tracking_connections: Connections,
}

impl ManagerState {
    fn find_object(&self, uid: &str) -> Option<ObjectRef> {
        self.created_objects.get(uid).cloned().or_else(|| {
            self.deferred_objects
                .get(uid)
                .and_then(|deferred| deferred.object.clone())
        })
    }

    fn created_service(&self, uid: &str) -> Option<ServiceRef> {
        self.created_services
            .iter()
            .find(|service| service.uid() == uid)
            .cloned()
    }
}

fn proxy_entry<'a>(list: &'a mut Vec<ProxyConnections>, channel: &str) -> &'a mut ProxyConnections {
    let index = list
        .iter()
        .position(|p| p.channel == channel)
        .unwrap_or_else(|| {
            list.push(ProxyConnections::new(channel));
            list.len() - 1
        });
    &mut list[index]
}

/// Outputs are always optional for the service producing them
fn is_optional(object: &ObjectRefDecl, access: Access) -> bool {
    object.optional || access == Access::Out
}

fn precondition(what: &str, state: AppState) -> ServiceError {
    ServiceError::Precondition(format!("cannot {what} the application while it is {state:?}"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────────────────────────

pub struct AppConfigManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    this: Weak<ManagerInner>,
    app: ApplicationContext,
    config: AppConfig,
    worker: Worker,
    slots: Slots,
    state: Mutex<ManagerState>,
    reactions: AtomicU64,
}

impl AppConfigManager {
    pub fn new(app: &ApplicationContext, config: AppConfig) -> ServiceResult<Self> {
        let worker = Worker::spawn(format!("{}-manager", config.id))?;

        let inner = Arc::new_cyclic(|this: &Weak<ManagerInner>| {
            let slots = Slots::new();
            let added = Slot::from_weak(
                this.clone(),
                Some(worker.clone()),
                |inner: &ManagerInner, (object, uid): (ObjectRef, String)| {
                    inner.on_object_added(object, &uid);
                    inner.reactions.fetch_add(1, Ordering::SeqCst);
                },
            );
            let removed = Slot::from_weak(
                this.clone(),
                Some(worker.clone()),
                |inner: &ManagerInner, (object, uid): (ObjectRef, String)| {
                    inner.on_object_removed(object, &uid);
                    inner.reactions.fetch_add(1, Ordering::SeqCst);
                },
            );
            slots.insert(ADD_OBJECTS_SLOT, &added);
            slots.insert(REMOVE_OBJECTS_SLOT, &removed);

            ManagerInner {
                this: this.clone(),
                app: app.clone(),
                config,
                worker,
                slots,
                state: Mutex::new(ManagerState::default()),
                reactions: AtomicU64::new(0),
            }
        });

        Ok(Self { inner })
    }

    /// Load a document from disk and wrap it in a manager
    pub fn load(
        app: &ApplicationContext,
        path: impl AsRef<std::path::Path>,
        params: &Parameters,
    ) -> ServiceResult<Self> {
        Self::new(app, AppConfig::load(path, params)?)
    }

    pub fn id(&self) -> &str {
        &self.inner.config.id
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn state(&self) -> AppState {
        self.inner.state.lock().state
    }

    /// Object created by this application, or deferred object once available
    pub fn object(&self, uid: &str) -> Option<ObjectRef> {
        self.inner.state.lock().find_object(uid)
    }

    /// Service created by this application
    pub fn service(&self, uid: &str) -> Option<ServiceRef> {
        self.inner.state.lock().created_service(uid)
    }

    /// Provide a deferred object that already exists. Only before `create()`.
    pub fn add_existing_deferred_object(&self, object: ObjectRef, uid: &str) -> ServiceResult<()> {
        let mut st = self.inner.state.lock();
        if st.state != AppState::Destroyed {
            return Err(precondition("add a deferred object to", st.state));
        }
        st.deferred_objects.insert(
            uid.to_string(),
            DeferredObject {
                object: Some(object),
                ..Default::default()
            },
        );
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Create objects, channels and every service whose objects are available
    pub fn create(&self) -> ServiceResult<()> {
        let inner = &self.inner;
        let mut st = inner.state.lock();
        if st.state != AppState::Destroyed {
            return Err(precondition("create", st.state));
        }

        let result = inner
            .create_objects(&mut st)
            .and_then(|()| inner.create_connections(&mut st))
            .and_then(|()| inner.create_services(&mut st));

        if let Err(e) = result {
            tracing::error!(app = %inner.config.id, error = %e, "Failed to create application");
            inner.teardown(&mut st);
            return Err(e);
        }

        st.state = AppState::Created;
        tracing::info!(
            app = %inner.config.id,
            objects = st.created_objects.len(),
            services = st.created_services.len(),
            postponed = st.deferred_services.len(),
            "Application created"
        );
        Ok(())
    }

    /// Start the services of the `start` list, in order, and wait for them.
    ///
    /// Every listed service is started even if one fails; the first failure
    /// is returned and the application is started anyway.
    pub fn start(&self) -> ServiceResult<()> {
        let inner = &self.inner;
        let mut st = inner.state.lock();
        if !matches!(st.state, AppState::Created | AppState::Stopped) {
            return Err(precondition("start", st.state));
        }

        inner.connect_registry(&mut st)?;
        inner.connect_object_proxies(&mut st);

        let mut futures = Vec::new();
        for uid in &inner.config.start {
            if let Some(service) = st.created_service(uid) {
                futures.push(service.start());
                st.started_services.push(service);
            } else if st.deferred_services.contains(uid) {
                tracing::debug!(app = %inner.config.id, service = %uid, "Start deferred until its objects are available");
                if !st.deferred_start.contains(uid) {
                    st.deferred_start.push(uid.clone());
                }
            } else {
                tracing::warn!(app = %inner.config.id, service = %uid, "Start requested for a service that does not exist");
            }
        }

        let result = wait_all(futures);
        st.state = AppState::Started;
        tracing::info!(app = %inner.config.id, "Application started");
        result
    }

    /// Update the services of the `update` list, in order
    pub fn update(&self) -> ServiceResult<()> {
        let inner = &self.inner;
        let mut st = inner.state.lock();
        if st.state != AppState::Started {
            return Err(precondition("update", st.state));
        }

        let mut futures = Vec::new();
        for uid in &inner.config.update {
            if let Some(service) = st.created_service(uid) {
                futures.push(service.update());
            } else if st.deferred_services.contains(uid) {
                tracing::debug!(app = %inner.config.id, service = %uid, "Update deferred until its objects are available");
                if !st.deferred_update.contains(uid) {
                    st.deferred_update.push(uid.clone());
                }
            }
        }
        wait_all(futures)
    }

    /// Disconnect the object channels and stop started services, last
    /// started first
    pub fn stop(&self) -> ServiceResult<()> {
        let inner = &self.inner;
        let mut st = inner.state.lock();
        if st.state != AppState::Started {
            return Err(precondition("stop", st.state));
        }

        st.registry_connections.disconnect();
        inner.disconnect_object_proxies(&mut st);

        let started = std::mem::take(&mut st.started_services);
        let mut futures = Vec::new();
        for service in started.iter().rev() {
            if service.is_stopped() {
                tracing::warn!(app = %inner.config.id, service = %service.uid(), "Service already stopped");
            } else {
                futures.push(service.stop());
            }
        }

        st.state = AppState::Stopped;
        let result = wait_all(futures);
        tracing::info!(app = %inner.config.id, "Application stopped");
        result
    }

    /// Unregister every created service and remove the workers created for
    /// them
    pub fn destroy(&self) -> ServiceResult<()> {
        let inner = &self.inner;
        let mut st = inner.state.lock();
        if !matches!(st.state, AppState::Created | AppState::Stopped) {
            return Err(precondition("destroy", st.state));
        }

        inner.teardown(&mut st);
        tracing::debug!(registry = %inner.app.registry().registry_information(), "Registry after destroy");
        tracing::info!(app = %inner.config.id, "Application destroyed");
        Ok(())
    }

    /// `create`, `start` then `update`
    pub fn launch(&self) -> ServiceResult<()> {
        self.create()?;
        let started = self.start();
        let updated = self.update();
        started.and(updated)
    }

    pub fn stop_and_destroy(&self) -> ServiceResult<()> {
        let stopped = if self.state() == AppState::Started {
            self.stop()
        } else {
            Ok(())
        };
        let destroyed = self.destroy();
        stopped.and(destroyed)
    }

    /// Wait until the reactions to registered and unregistered outputs have
    /// been processed
    pub fn flush(&self) -> ServiceResult<()> {
        if self.inner.worker.is_current() {
            return Err(ServiceError::Precondition(
                "flush() cannot be called from the manager's worker".into(),
            ));
        }

        loop {
            let before = self.inner.reactions.load(Ordering::SeqCst);
            self.inner.worker.post_task(|| ())?.wait()?;
            if self.inner.reactions.load(Ordering::SeqCst) == before {
                return Ok(());
            }
        }
    }
}

impl HasSlots for AppConfigManager {
    fn slots(&self) -> &Slots {
        &self.inner.slots
    }
}

impl std::fmt::Debug for AppConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfigManager")
            .field("id", &self.inner.config.id)
            .field("state", &self.state())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Creation and teardown
// ─────────────────────────────────────────────────────────────────────────────

impl ManagerInner {
    fn create_objects(&self, st: &mut ManagerState) -> ServiceResult<()> {
        for decl in &self.config.objects {
            if decl.deferred {
                let deferred = st.deferred_objects.entry(decl.uid.clone()).or_default();
                if deferred.object.is_none() {
                    deferred.object = self.app.registry().output(&decl.uid);
                }
                continue;
            }

            let object = self
                .app
                .data_factory()
                .create(&decl.type_name, decl.uid.as_str(), decl.value.as_ref())?;
            tracing::debug!(app = %self.config.id, object = %decl.uid, data_type = %decl.type_name, "Created object");
            st.created_objects.insert(decl.uid.clone(), object);
        }
        Ok(())
    }

    /// Split every channel by endpoint owner. Created objects are connected
    /// right away, deferred objects when they appear and services when they
    /// start.
    fn create_connections(&self, st: &mut ManagerState) -> ServiceResult<()> {
        for (index, decl) in self.config.connections.iter().enumerate() {
            let connections = decl.to_connections(format!("Proxy_{}_{index}", self.config.id))?;
            let channel = connections.channel.clone();
            let mut objects = ProxyConnections::new(channel.as_str());

            for (uid, key) in &connections.signals {
                if let Some(deferred) = st.deferred_objects.get_mut(uid) {
                    proxy_entry(&mut deferred.proxies, &channel).add_signal(uid, key);
                } else if st.created_objects.contains_key(uid) {
                    objects.add_signal(uid, key);
                } else {
                    proxy_entry(st.service_proxies.entry(uid.clone()).or_default(), &channel)
                        .add_signal(uid, key);
                }
            }

            for (uid, key) in &connections.slots {
                if let Some(deferred) = st.deferred_objects.get_mut(uid) {
                    proxy_entry(&mut deferred.proxies, &channel).add_slot(uid, key);
                } else if st.created_objects.contains_key(uid) {
                    objects.add_slot(uid, key);
                } else {
                    proxy_entry(st.service_proxies.entry(uid.clone()).or_default(), &channel)
                        .add_slot(uid, key);
                }
            }

            if !objects.is_empty() {
                st.object_proxies.push(objects);
            }
        }

        self.connect_object_proxies(st);
        Ok(())
    }

    fn create_services(&self, st: &mut ManagerState) -> ServiceResult<()> {
        for decl in &self.config.services {
            let mut missing = Vec::new();

            for (object, access) in decl.object_refs() {
                let Some(deferred) = st.deferred_objects.get_mut(&object.uid) else {
                    continue;
                };
                if !deferred.services.contains(&decl.uid) {
                    deferred.services.push(decl.uid.clone());
                }
                st.deferred_services.insert(decl.uid.clone());

                if deferred.object.is_none() && !is_optional(object, access) {
                    missing.push(object.uid.as_str());
                }
            }

            if missing.is_empty() {
                self.create_service(st, decl)?;
            } else {
                tracing::debug!(
                    app = %self.config.id,
                    service = %decl.uid,
                    missing = ?missing,
                    "Service postponed until its objects are available"
                );
            }
        }
        Ok(())
    }

    fn create_service(&self, st: &mut ManagerState, decl: &ServiceDecl) -> ServiceResult<ServiceRef> {
        let worker = match &decl.worker {
            Some(name) => {
                let (worker, spawned) = self.app.workers().get_or_spawn(name)?;
                if spawned {
                    st.created_workers.push(name.clone());
                }
                worker
            }
            None => self.app.default_worker(),
        };

        let service = self.app.service_factory().create(
            &decl.type_name,
            &decl.uid,
            worker,
            self.app.downgrade(),
        )?;
        self.app.registry().register_service(service.clone())?;
        st.created_services.push(service.clone());

        service.set_configuration(decl.service_config())?;
        for (object, access) in decl.object_refs() {
            if access == Access::Out {
                continue;
            }
            match st.find_object(&object.uid) {
                Some(found) => {
                    service.set_object(object.key(), Some(found.clone()));
                    self.app.registry().register_service_for(&found, service.clone())?;
                }
                None if object.optional => {}
                None => {
                    return Err(ServiceError::Precondition(format!(
                        "object '{}' required by service '{}' is not available",
                        object.uid, decl.uid
                    )));
                }
            }
        }

        let proxies = st.service_proxies.get(&decl.uid).cloned().unwrap_or_default();
        for connections in proxies {
            self.track_lifecycle(st, &service, &connections);
            service.add_proxy(connections);
        }

        service.configure()?;
        tracing::debug!(app = %self.config.id, service = %decl.uid, service_type = %decl.type_name, "Created service");
        Ok(service)
    }

    /// Services started or stopped through a channel are followed so that
    /// `stop()` stops exactly what is running
    fn track_lifecycle(&self, st: &mut ManagerState, service: &ServiceRef, connections: &ProxyConnections) {
        let uid = service.uid();
        let owns = |key: &str| connections.slots.iter().any(|(owner, k)| owner == uid && k == key);

        for (slot_key, signal_key, started) in [
            (slots::START, signals::STARTED, true),
            (slots::STOP, signals::STOPPED, false),
        ] {
            if !owns(slot_key) {
                continue;
            }
            let Some(signal) = service.signals().get::<()>(signal_key) else {
                continue;
            };

            let weak_service = Arc::downgrade(service);
            let slot = Slot::from_weak(
                self.this.clone(),
                Some(self.worker.clone()),
                move |inner: &ManagerInner, ()| {
                    let Some(service) = weak_service.upgrade() else {
                        return;
                    };
                    let mut st = inner.state.lock();
                    let known = st.started_services.iter().any(|s| Arc::ptr_eq(s, &service));
                    if started && !known {
                        st.started_services.push(service);
                    } else if !started {
                        st.started_services.retain(|s| !Arc::ptr_eq(s, &service));
                    }
                },
            );

            match signal.connect(&slot) {
                Ok(connection) => {
                    st.tracking_connections.add(connection);
                    st.tracking_slots.push(slot);
                }
                Err(e) => tracing::warn!(service = %uid, signal = signal_key, error = %e, "Cannot follow service lifecycle"),
            }
        }
    }

    /// Stop and unregister created services, remove created workers and
    /// forget everything
    fn teardown(&self, st: &mut ManagerState) {
        st.registry_connections.disconnect();
        st.tracking_connections.disconnect();
        self.disconnect_object_proxies(st);

        for service in st.created_services.iter().rev() {
            if !service.is_stopped() {
                tracing::warn!(app = %self.config.id, service = %service.uid(), "Service still running, stopping it");
                if let Err(e) = service.stop().wait() {
                    tracing::error!(service = %service.uid(), error = %e, "Error while stopping service");
                }
            }
            if let Err(e) = self.app.registry().unregister_service(service.uid()) {
                tracing::error!(service = %service.uid(), error = %e, "Cannot unregister service");
            }
        }

        for name in &st.created_workers {
            self.app.workers().remove(name);
        }

        *st = ManagerState::default();
    }

    fn connect_registry(&self, st: &mut ManagerState) -> ServiceResult<()> {
        if !st.registry_connections.is_empty() {
            return Ok(());
        }
        let registry = self.app.registry();
        st.registry_connections.connect(
            registry.signals(),
            REGISTERED_OBJECT_SIG,
            &self.slots,
            ADD_OBJECTS_SLOT,
        )?;
        st.registry_connections.connect(
            registry.signals(),
            UNREGISTERED_OBJECT_SIG,
            &self.slots,
            REMOVE_OBJECTS_SLOT,
        )?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Channels
    // ─────────────────────────────────────────────────────────────────────────

    fn signal_of(&self, st: &ManagerState, uid: &str, key: &str) -> Option<Arc<dyn SignalBase>> {
        match st.find_object(uid) {
            Some(object) => object.signals().get_base(key),
            None => self
                .app
                .registry()
                .get(uid)
                .and_then(|service| service.signals().get_base(key)),
        }
    }

    fn slot_of(&self, uid: &str, key: &str) -> Option<Arc<dyn SlotBase>> {
        self.app
            .registry()
            .get(uid)
            .and_then(|service| service.slots().get_base(key))
    }

    fn connect_proxy(&self, st: &ManagerState, connections: &ProxyConnections) {
        let proxy = self.app.proxy();
        let channel = &connections.channel;

        for (uid, key) in &connections.signals {
            match self.signal_of(st, uid, key) {
                Some(signal) => proxy.connect_signal(channel, signal),
                None => tracing::error!(app = %self.config.id, channel = %channel, source = %uid, signal = %key, "Signal not found"),
            }
        }
        for (uid, key) in &connections.slots {
            match self.slot_of(uid, key) {
                Some(slot) => proxy.connect_slot(channel, slot),
                None => tracing::error!(app = %self.config.id, channel = %channel, destination = %uid, slot = %key, "Slot not found"),
            }
        }
    }

    fn disconnect_proxy(&self, st: &ManagerState, connections: &ProxyConnections, hint: Option<&ObjectRef>) {
        let proxy = self.app.proxy();
        let channel = &connections.channel;

        for (uid, key) in connections.slots.iter().rev() {
            if let Some(slot) = self.slot_of(uid, key) {
                proxy.disconnect_slot(channel, slot.id());
            }
        }
        for (uid, key) in connections.signals.iter().rev() {
            let signal = match hint {
                Some(object) => object.signals().get_base(key),
                None => self.signal_of(st, uid, key),
            };
            if let Some(signal) = signal {
                proxy.disconnect_signal(channel, signal.id());
            }
        }
    }

    fn connect_object_proxies(&self, st: &mut ManagerState) {
        if !st.object_proxies_connected {
            for connections in &st.object_proxies {
                self.connect_proxy(st, connections);
            }
            st.object_proxies_connected = true;
        }

        let available: Vec<_> = st
            .deferred_objects
            .iter()
            .filter(|(_, deferred)| !deferred.connected && deferred.object.is_some())
            .map(|(uid, _)| uid.clone())
            .collect();
        for uid in available {
            let proxies = st.deferred_objects.get(&uid).map(|d| d.proxies.clone()).unwrap_or_default();
            for connections in &proxies {
                self.connect_proxy(st, connections);
            }
            if let Some(deferred) = st.deferred_objects.get_mut(&uid) {
                deferred.connected = true;
            }
        }
    }

    fn disconnect_object_proxies(&self, st: &mut ManagerState) {
        let connected: Vec<_> = st
            .deferred_objects
            .iter()
            .filter(|(_, deferred)| deferred.connected)
            .map(|(uid, deferred)| (uid.clone(), deferred.object.clone(), deferred.proxies.clone()))
            .collect();
        for (uid, object, proxies) in connected {
            for connections in proxies.iter().rev() {
                self.disconnect_proxy(st, connections, object.as_ref());
            }
            if let Some(deferred) = st.deferred_objects.get_mut(&uid) {
                deferred.connected = false;
            }
        }

        if st.object_proxies_connected {
            for connections in st.object_proxies.iter().rev() {
                self.disconnect_proxy(st, connections, None);
            }
            st.object_proxies_connected = false;
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Deferred objects
    // ─────────────────────────────────────────────────────────────────────────

    /// Bind or unbind an optional key of an existing service, swapping it if
    /// the service runs
    fn rebind(&self, service: &ServiceRef, key: &str, object: Option<ObjectRef>) {
        let current = service.context().object(key);
        let unchanged = match (&current, &object) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return;
        }

        if let Some(object) = &object {
            if let Err(e) = self.app.registry().register_service_for(object, service.clone()) {
                tracing::warn!(service = %service.uid(), error = %e, "Cannot register service for object");
            }
        }

        if service.is_started() {
            if let Err(e) = service.swap_key(key, object).wait() {
                tracing::error!(service = %service.uid(), key, error = %e, "Error while swapping object");
            }
        } else {
            service.set_object(key, object);
        }
    }

    fn on_object_added(&self, object: ObjectRef, uid: &str) {
        let mut st = self.state.lock();
        if st.state != AppState::Started {
            tracing::debug!(app = %self.config.id, object = %uid, "Ignoring new object, application is not running");
            return;
        }
        let Some(deferred) = st.deferred_objects.get_mut(uid) else {
            return;
        };

        let previous = deferred.object.replace(object.clone());
        let was_connected = std::mem::replace(&mut deferred.connected, true);
        let services = deferred.services.clone();
        let proxies = deferred.proxies.clone();

        if let (true, Some(previous)) = (was_connected, &previous) {
            if Arc::ptr_eq(previous, &object) {
                return;
            }
            for connections in proxies.iter().rev() {
                self.disconnect_proxy(&st, connections, Some(previous));
            }
        }
        for connections in &proxies {
            self.connect_proxy(&st, connections);
        }
        tracing::debug!(app = %self.config.id, object = %uid, "Deferred object available");

        let mut created = HashMap::new();
        for service_uid in &services {
            let Some(decl) = self.config.service(service_uid) else {
                continue;
            };

            if let Some(service) = st.created_service(service_uid) {
                for (object, access) in decl.object_refs() {
                    if access == Access::Out || !object.optional {
                        continue;
                    }
                    if let Some(available) = st.deferred_objects.get(&object.uid).and_then(|d| d.object.clone()) {
                        self.rebind(&service, object.key(), Some(available));
                    }
                }
                continue;
            }

            let missing: Vec<_> = decl
                .object_refs()
                .filter(|(object, access)| !is_optional(object, *access) && st.find_object(&object.uid).is_none())
                .map(|(object, _)| object.uid.as_str())
                .collect();
            if !missing.is_empty() {
                tracing::info!(app = %self.config.id, service = %service_uid, missing = ?missing, "Service still waiting for objects");
                continue;
            }

            match self.create_service(&mut st, decl) {
                Ok(service) => {
                    tracing::info!(app = %self.config.id, service = %service_uid, "Service created, its objects are all available");
                    created.insert(service_uid.clone(), service);
                }
                Err(e) => {
                    tracing::error!(app = %self.config.id, service = %service_uid, error = %e, "Cannot create deferred service");
                }
            }
        }

        let mut futures = Vec::new();
        for uid in st.deferred_start.clone() {
            if let Some(service) = created.get(&uid) {
                futures.push(service.start());
                st.started_services.push(service.clone());
                tracing::info!(app = %self.config.id, service = %uid, "Deferred service started");
            }
        }
        if let Err(e) = wait_all(futures) {
            tracing::error!(app = %self.config.id, error = %e, "Error while starting deferred services");
        }

        let futures: Vec<_> = st
            .deferred_update
            .iter()
            .filter_map(|uid| created.get(uid))
            .map(|service| service.update())
            .collect();
        if let Err(e) = wait_all(futures) {
            tracing::error!(app = %self.config.id, error = %e, "Error while updating deferred services");
        }
    }

    fn on_object_removed(&self, object: ObjectRef, uid: &str) {
        let mut st = self.state.lock();
        if st.state != AppState::Started {
            tracing::debug!(app = %self.config.id, object = %uid, "Ignoring removed object, application is not running");
            return;
        }
        let Some(deferred) = st.deferred_objects.get_mut(uid) else {
            return;
        };

        let held = deferred.object.take().unwrap_or(object);
        let was_connected = std::mem::replace(&mut deferred.connected, false);
        let services = deferred.services.clone();
        let proxies = deferred.proxies.clone();

        if was_connected {
            for connections in proxies.iter().rev() {
                self.disconnect_proxy(&st, connections, Some(&held));
            }
        }
        tracing::debug!(app = %self.config.id, object = %uid, "Deferred object withdrawn");

        for service_uid in &services {
            let (Some(service), Some(decl)) = (st.created_service(service_uid), self.config.service(service_uid)) else {
                continue;
            };

            let mut optional = true;
            for (object, access) in decl.object_refs().filter(|(object, _)| object.uid == uid) {
                optional &= is_optional(object, access);
                if access != Access::Out && object.optional {
                    self.rebind(&service, object.key(), None);
                }
            }
            if optional {
                continue;
            }

            st.started_services.retain(|s| !Arc::ptr_eq(s, &service));
            if let Err(e) = service.stop().wait() {
                tracing::error!(service = %service_uid, error = %e, "Error while stopping service");
            }
            if let Err(e) = self.app.registry().unregister_service(service_uid) {
                tracing::error!(service = %service_uid, error = %e, "Cannot unregister service");
            }
            st.created_services.retain(|s| !Arc::ptr_eq(s, &service));
            tracing::info!(app = %self.config.id, service = %service_uid, object = %uid, "Service destroyed, its object is no longer available");
        }
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().state;
        if state != AppState::Destroyed {
            tracing::warn!(app = %self.config.id, state = ?state, "Application manager dropped without being destroyed");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Service, ServiceContext};
    use sight_data::{Integer, Object};

    #[derive(Default)]
    struct Incrementer;

    impl Service for Incrementer {
        fn starting(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
            Ok(())
        }

        fn updating(&mut self, ctx: &ServiceContext) -> ServiceResult<()> {
            let object = ctx.required("value")?;
            object.try_write::<Integer>()?.0 += 1;
            Ok(())
        }

        fn stopping(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
            Ok(())
        }
    }

    const DOCUMENT: &str = r#"
        id = "unit"
        start = ["inc"]
        update = ["inc", "inc"]

        [[object]]
        uid = "count"
        type = "Integer"
        value = 10

        [[service]]
        uid = "inc"
        type = "test::Incrementer"
        worker = "unit-worker"
        inout = [{ key = "value", uid = "count" }]
    "#;

    fn app() -> ApplicationContext {
        let app = ApplicationContext::new().unwrap();
        app.service_factory().register_default::<Incrementer>("test::Incrementer");
        app
    }

    #[test]
    fn test_lifecycle_order_is_enforced() {
        let app = app();
        let config = AppConfig::from_str(DOCUMENT, &Parameters::new()).unwrap();
        let manager = AppConfigManager::new(&app, config).unwrap();

        assert!(matches!(manager.start(), Err(ServiceError::Precondition(_))));
        assert!(matches!(manager.stop(), Err(ServiceError::Precondition(_))));

        manager.create().unwrap();
        assert!(matches!(manager.create(), Err(ServiceError::Precondition(_))));
        assert!(matches!(manager.update(), Err(ServiceError::Precondition(_))));
        assert!(matches!(
            manager.add_existing_deferred_object(Object::new("x", Integer(0)), "x"),
            Err(ServiceError::Precondition(_))
        ));

        manager.destroy().unwrap();
        assert_eq!(manager.state(), AppState::Destroyed);
        app.workers().stop_all();
    }

    #[test]
    fn test_launch_runs_start_and_update_lists() {
        let app = app();
        let config = AppConfig::from_str(DOCUMENT, &Parameters::new()).unwrap();
        let manager = AppConfigManager::new(&app, config).unwrap();

        manager.launch().unwrap();
        assert_eq!(manager.state(), AppState::Started);

        let count = manager.object("count").unwrap();
        assert_eq!(*count.read::<Integer>().unwrap(), Integer(12));

        let service = manager.service("inc").unwrap();
        assert!(service.is_started());
        assert_eq!(service.context().worker().name(), "unit-worker");

        manager.stop_and_destroy().unwrap();
        assert!(service.is_stopped());
        assert!(app.registry().is_empty());
        assert!(app.workers().get("unit-worker").is_none());
        app.workers().stop_all();
    }

    #[test]
    fn test_unknown_service_type_fails_create() {
        let app = ApplicationContext::new().unwrap();
        let config = AppConfig::from_str(DOCUMENT, &Parameters::new()).unwrap();
        let manager = AppConfigManager::new(&app, config).unwrap();

        assert_eq!(
            manager.create(),
            Err(ServiceError::UnknownType("test::Incrementer".into()))
        );
        assert_eq!(manager.state(), AppState::Destroyed);
        assert!(app.registry().is_empty());
        app.workers().stop_all();
    }
}
