//! Service cell
//!
//! Hosts a `Service` value and drives it through the lifecycle state
//! machine. The service value is only touched from hooks, under a reentrant
//! lock, so slots and lifecycle calls never run two hooks at once.

use std::any::Any;
use std::cell::RefCell;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};
use sight_com::{ComError, Connections, HasSignals, HasSlots, Signals, Slot, Slots, Worker};
use sight_data::ObjectRef;

use super::slots as slot_keys;
use crate::{
    ConfigurationStatus, Declarations, GlobalStatus, ProxyConnections, Service, ServiceConfig,
    ServiceContext, ServiceError, ServiceFuture, ServiceObject, ServiceResult, UpdatingStatus,
    WeakApplicationContext,
};

#[derive(Debug)]
struct Status {
    global: GlobalStatus,
    configuration: ConfigurationStatus,
    updating: UpdatingStatus,
    last_error: Option<ServiceError>,
}

type LifecycleSlot<A> = Slot<A, ServiceResult<()>>;

pub struct ServiceCell<S: Service> {
    ctx: ServiceContext,
    service: ReentrantMutex<RefCell<S>>,
    status: Mutex<Status>,
    auto_connections: Mutex<Connections>,
    proxies: Mutex<Vec<ProxyConnections>>,
    start_slot: LifecycleSlot<()>,
    stop_slot: LifecycleSlot<()>,
    update_slot: LifecycleSlot<()>,
    swap_slot: LifecycleSlot<(String, Option<ObjectRef>)>,
}

fn lifecycle_slot<S, A>(
    cell: &Weak<ServiceCell<S>>,
    worker: &Worker,
    f: fn(&ServiceCell<S>, A) -> ServiceResult<()>,
) -> LifecycleSlot<A>
where
    S: Service,
    A: Send + 'static,
{
    let cell = cell.clone();
    Slot::fallible(Some(worker.clone()), move |args| {
        let cell = cell.upgrade().ok_or(ComError::OwnerDropped)?;
        Ok(f(&cell, args))
    })
}

impl<S: Service> ServiceCell<S> {
    /// Wrap a service. It starts stopped and unconfigured.
    pub fn new(
        uid: impl Into<String>,
        type_name: impl Into<String>,
        service: S,
        worker: Worker,
        app: WeakApplicationContext,
    ) -> Arc<Self> {
        let uid = uid.into();
        let type_name = type_name.into();

        Arc::new_cyclic(|weak: &Weak<Self>| {
            let ctx = ServiceContext::new(uid, type_name, worker.clone(), app);

            let start_slot = lifecycle_slot(weak, &worker, |cell, ()| cell.start_inline());
            let stop_slot = lifecycle_slot(weak, &worker, |cell, ()| cell.stop_inline());
            let update_slot = lifecycle_slot(weak, &worker, |cell, ()| cell.update_inline());
            let swap_slot = lifecycle_slot(weak, &worker, |cell, (key, object): (String, Option<ObjectRef>)| {
                cell.swap_inline(&key, object)
            });

            ctx.slots().insert(slot_keys::START, &start_slot);
            ctx.slots().insert(slot_keys::STOP, &stop_slot);
            ctx.slots().insert(slot_keys::UPDATE, &update_slot);
            ctx.slots().insert(slot_keys::SWAP_KEY, &swap_slot);

            let mut service = service;
            service.declare(&mut Declarations::new(weak.clone(), &ctx));

            Self {
                ctx,
                service: ReentrantMutex::new(RefCell::new(service)),
                status: Mutex::new(Status {
                    global: GlobalStatus::Stopped,
                    configuration: ConfigurationStatus::Unconfigured,
                    updating: UpdatingStatus::NotUpdating,
                    last_error: None,
                }),
                auto_connections: Mutex::new(Connections::new()),
                proxies: Mutex::new(Vec::new()),
                start_slot,
                stop_slot,
                update_slot,
                swap_slot,
            }
        })
    }

    /// Read access to the service value.
    ///
    /// Blocks while a hook runs on another thread; fails if called from
    /// inside one of this service's own hooks.
    pub fn with<R>(&self, f: impl FnOnce(&S) -> R) -> ServiceResult<R> {
        let guard = self.service.lock();
        let service = guard.try_borrow().map_err(|_| self.busy())?;
        Ok(f(&service))
    }

    pub(crate) fn with_service<R>(
        &self,
        f: impl FnOnce(&mut S, &ServiceContext) -> ServiceResult<R>,
    ) -> ServiceResult<R> {
        let guard = self.service.lock();
        let mut service = guard.try_borrow_mut().map_err(|_| self.busy())?;
        f(&mut service, &self.ctx)
    }

    fn busy(&self) -> ServiceError {
        ServiceError::Precondition(format!(
            "service '{}' is already running a hook",
            self.ctx.uid()
        ))
    }

    fn record(&self, error: &ServiceError) {
        self.status.lock().last_error = Some(error.clone());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transitions, always on the worker
    // ─────────────────────────────────────────────────────────────────────────

    fn start_inline(&self) -> ServiceResult<()> {
        let uid = self.ctx.uid();
        {
            let mut status = self.status.lock();
            if status.global != GlobalStatus::Stopped {
                return Err(ServiceError::Precondition(format!(
                    "cannot start '{uid}': service is {}",
                    status.global
                )));
            }
            if status.configuration != ConfigurationStatus::Configured {
                return Err(ServiceError::Precondition(format!(
                    "cannot start '{uid}': service is not configured"
                )));
            }
            status.global = GlobalStatus::Starting;
        }

        tracing::debug!(service = %uid, "Starting");
        self.connect_proxies();

        if let Err(e) = self.with_service(|service, ctx| service.starting(ctx)) {
            tracing::error!(service = %uid, error = %e, "Error while starting, service stays stopped");
            if let Err(cleanup) = self.with_service(|service, ctx| service.stopping(ctx)) {
                tracing::debug!(service = %uid, error = %cleanup, "Cleanup after failed start also failed");
            }
            self.disconnect_proxies();

            let mut status = self.status.lock();
            status.global = GlobalStatus::Stopped;
            status.last_error = Some(e.clone());
            return Err(e);
        }

        self.auto_connect();
        self.status.lock().global = GlobalStatus::Started;
        tracing::info!(service = %uid, "Service started");
        self.ctx.started.async_emit(());
        Ok(())
    }

    fn stop_inline(&self) -> ServiceResult<()> {
        let uid = self.ctx.uid();
        {
            let mut status = self.status.lock();
            match status.global {
                GlobalStatus::Stopped => {
                    tracing::debug!(service = %uid, "Already stopped");
                    return Ok(());
                }
                GlobalStatus::Started => status.global = GlobalStatus::Stopping,
                other => {
                    return Err(ServiceError::Precondition(format!(
                        "cannot stop '{uid}': service is {other}"
                    )));
                }
            }
        }

        tracing::debug!(service = %uid, "Stopping");
        self.auto_connections.lock().disconnect();
        let result = self.with_service(|service, ctx| service.stopping(ctx));

        {
            let mut status = self.status.lock();
            status.global = GlobalStatus::Stopped;
            if let Err(e) = &result {
                status.last_error = Some(e.clone());
            }
        }

        match &result {
            Ok(()) => tracing::info!(service = %uid, "Service stopped"),
            Err(e) => tracing::error!(service = %uid, error = %e, "Error while stopping"),
        }

        self.ctx.stopped.async_emit(());
        self.disconnect_proxies();
        result
    }

    fn update_inline(&self) -> ServiceResult<()> {
        let uid = self.ctx.uid();
        {
            let mut status = self.status.lock();
            if status.global != GlobalStatus::Started {
                tracing::warn!(service = %uid, status = %status.global, "Update discarded, service is not started");
                return Ok(());
            }
            if status.updating == UpdatingStatus::Updating {
                return Err(ServiceError::Precondition(format!(
                    "service '{uid}' is already updating"
                )));
            }
            status.updating = UpdatingStatus::Updating;
        }

        let result = self.with_service(|service, ctx| service.updating(ctx));
        self.status.lock().updating = UpdatingStatus::NotUpdating;

        match &result {
            Ok(()) => self.ctx.updated.async_emit(()),
            Err(e) => {
                tracing::error!(service = %uid, error = %e, "Error while updating");
                self.record(e);
            }
        }
        result
    }

    fn swap_inline(&self, key: &str, object: Option<ObjectRef>) -> ServiceResult<()> {
        let uid = self.ctx.uid();
        {
            let mut status = self.status.lock();
            if status.global != GlobalStatus::Started {
                return Err(ServiceError::Precondition(format!(
                    "cannot swap '{key}' of '{uid}': service is {}",
                    status.global
                )));
            }
            status.global = GlobalStatus::Swapping;
        }

        tracing::debug!(service = %uid, key, "Swapping");
        self.auto_connections.lock().disconnect();
        self.ctx.bind(key, object);
        let result = self.with_service(|service, ctx| service.swapping(ctx, key));
        self.auto_connect();
        self.status.lock().global = GlobalStatus::Started;

        match &result {
            Ok(()) => self.ctx.swapped.async_emit(()),
            Err(e) => {
                tracing::error!(service = %uid, key, error = %e, "Error while swapping");
                self.record(e);
            }
        }
        result
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Connections
    // ─────────────────────────────────────────────────────────────────────────

    fn auto_connect(&self) {
        let config = self.ctx.service_config();
        let declared = match self.with_service(|service, _| Ok(service.auto_connections())) {
            Ok(declared) => declared,
            Err(e) => {
                tracing::warn!(service = %self.ctx.uid(), error = %e, "Cannot read auto connections");
                return;
            }
        };

        let mut connections = self.auto_connections.lock();
        for binding in &config.objects {
            if !(binding.auto_connect || config.auto_connect) {
                continue;
            }
            let Some(object) = self.ctx.object(&binding.key) else {
                continue;
            };

            let pairs = declared.for_key(&binding.key);
            if pairs.is_empty() && binding.auto_connect {
                tracing::warn!(service = %self.ctx.uid(), key = %binding.key, "Auto connect requested but no connection declared");
            }

            for (signal, slot) in pairs {
                if let Err(e) = connections.connect(object.signals(), signal, self.ctx.slots(), slot) {
                    tracing::warn!(
                        service = %self.ctx.uid(),
                        object = %object.uid(),
                        signal = %signal,
                        slot = %slot,
                        error = %e,
                        "Auto connection failed"
                    );
                }
            }
        }
    }

    fn connect_proxies(&self) {
        let Some(app) = self.ctx.app() else {
            return;
        };
        let uid = self.ctx.uid();

        for connections in self.proxies.lock().iter() {
            for (_, key) in connections.signals.iter().filter(|(owner, _)| owner == uid) {
                match self.ctx.signals().get_base(key) {
                    Some(signal) => app.proxy().connect_signal(&connections.channel, signal),
                    None => tracing::warn!(service = %uid, channel = %connections.channel, signal = %key, "No such signal"),
                }
            }
            for (_, key) in connections.slots.iter().filter(|(owner, _)| owner == uid) {
                match self.ctx.slots().get_base(key) {
                    Some(slot) => app.proxy().connect_slot(&connections.channel, slot),
                    None => tracing::warn!(service = %uid, channel = %connections.channel, slot = %key, "No such slot"),
                }
            }
        }
    }

    fn disconnect_proxies(&self) {
        let Some(app) = self.ctx.app() else {
            return;
        };
        let uid = self.ctx.uid();

        for connections in self.proxies.lock().iter().rev() {
            for (_, key) in connections.slots.iter().rev().filter(|(owner, _)| owner == uid) {
                if let Some(slot) = self.ctx.slots().get_base(key) {
                    app.proxy().disconnect_slot(&connections.channel, slot.id());
                }
            }
            for (_, key) in connections.signals.iter().rev().filter(|(owner, _)| owner == uid) {
                if let Some(signal) = self.ctx.signals().get_base(key) {
                    app.proxy().disconnect_signal(&connections.channel, signal.id());
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ServiceObject
// ─────────────────────────────────────────────────────────────────────────────

impl<S: Service> ServiceObject for ServiceCell<S> {
    fn context(&self) -> &ServiceContext {
        &self.ctx
    }

    fn set_configuration(&self, config: ServiceConfig) -> ServiceResult<()> {
        let mut status = self.status.lock();
        if status.global != GlobalStatus::Stopped {
            return Err(ServiceError::Precondition(format!(
                "cannot set the configuration of '{}': service is {}",
                self.ctx.uid(),
                status.global
            )));
        }
        self.ctx.set_config(config);
        status.configuration = ConfigurationStatus::Unconfigured;
        Ok(())
    }

    fn set_object(&self, key: &str, object: Option<ObjectRef>) {
        self.ctx.bind(key, object);
    }

    fn add_proxy(&self, connections: ProxyConnections) {
        self.proxies.lock().push(connections);
    }

    fn configure(&self) -> ServiceResult<()> {
        let uid = self.ctx.uid();
        {
            let mut status = self.status.lock();
            if status.configuration != ConfigurationStatus::Unconfigured {
                return Err(ServiceError::Precondition(format!(
                    "service '{uid}' is already configured"
                )));
            }
            status.configuration = ConfigurationStatus::Configuring;
        }

        let result = self.with_service(|service, ctx| service.configuring(ctx));

        let mut status = self.status.lock();
        match result {
            Ok(()) => {
                status.configuration = ConfigurationStatus::Configured;
                tracing::debug!(service = %uid, "Configured");
                Ok(())
            }
            Err(e) => {
                status.configuration = ConfigurationStatus::Unconfigured;
                let e = match e {
                    ServiceError::Configuration(_) => e,
                    other => ServiceError::Configuration(other.to_string()),
                };
                tracing::error!(service = %uid, error = %e, "Error while configuring");
                status.last_error = Some(e.clone());
                Err(e)
            }
        }
    }

    fn start(&self) -> ServiceFuture {
        if self.ctx.worker().is_current() {
            ServiceFuture::ready(self.start_inline())
        } else {
            ServiceFuture::from_slot(self.start_slot.async_call(()))
        }
    }

    fn stop(&self) -> ServiceFuture {
        if self.ctx.worker().is_current() {
            ServiceFuture::ready(self.stop_inline())
        } else {
            ServiceFuture::from_slot(self.stop_slot.async_call(()))
        }
    }

    fn update(&self) -> ServiceFuture {
        if self.ctx.worker().is_current() {
            ServiceFuture::ready(self.update_inline())
        } else {
            ServiceFuture::from_slot(self.update_slot.async_call(()))
        }
    }

    fn swap_key(&self, key: &str, object: Option<ObjectRef>) -> ServiceFuture {
        if self.ctx.worker().is_current() {
            ServiceFuture::ready(self.swap_inline(key, object))
        } else {
            ServiceFuture::from_slot(self.swap_slot.async_call((key.to_string(), object)))
        }
    }

    fn global_status(&self) -> GlobalStatus {
        self.status.lock().global
    }

    fn configuration_status(&self) -> ConfigurationStatus {
        self.status.lock().configuration
    }

    fn updating_status(&self) -> UpdatingStatus {
        self.status.lock().updating
    }

    fn last_error(&self) -> Option<ServiceError> {
        self.status.lock().last_error.clone()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl<S: Service> HasSignals for ServiceCell<S> {
    fn signals(&self) -> &Signals {
        self.ctx.signals()
    }
}

impl<S: Service> HasSlots for ServiceCell<S> {
    fn slots(&self) -> &Slots {
        self.ctx.slots()
    }
}

impl<S: Service> std::fmt::Debug for ServiceCell<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceCell")
            .field("uid", &self.ctx.uid())
            .field("type", &self.ctx.type_name())
            .field("status", &*self.status.lock())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
