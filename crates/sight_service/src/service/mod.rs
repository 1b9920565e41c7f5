//! Service Lifecycle
//!
//! A service is a user type implementing `Service`, hosted in a
//! `ServiceCell` that owns its state machine, its signals and slots and its
//! object bindings.
//!
//! # Lifecycle
//!
//! - `configuring`: read the configuration tree, once per configuration
//! - `starting`: acquire resources
//! - `updating`: do the work, any number of times while started
//! - `swapping`: an object bound to a key was replaced
//! - `stopping`: release what `starting` acquired
//!
//! `start`, `stop`, `update` and `swap_key` always run on the service's
//! worker. Called from another thread they are posted through the service's
//! own slots and return a future.

mod cell;
mod context;

pub use cell::*;
pub use context::*;

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use sight_com::{HasSignals, HasSlots, Signal, Slot, SlotFuture};
use sight_data::ObjectRef;

use crate::config::group_of;
use crate::{ProxyConnections, ServiceConfig, ServiceError, ServiceResult};

/// Built-in signal keys
pub mod signals {
    pub const STARTED: &str = "started";
    pub const UPDATED: &str = "updated";
    pub const SWAPPED: &str = "swapped";
    pub const STOPPED: &str = "stopped";
    pub const INFO_NOTIFIED: &str = "infoNotified";
    pub const SUCCESS_NOTIFIED: &str = "successNotified";
    pub const FAILURE_NOTIFIED: &str = "failureNotified";
}

/// Built-in slot keys
pub mod slots {
    pub const START: &str = "start";
    pub const STOP: &str = "stop";
    pub const UPDATE: &str = "update";
    pub const SWAP_KEY: &str = "swapKey";
}

// ─────────────────────────────────────────────────────────────────────────────
// Status
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalStatus {
    Stopped,
    Starting,
    Started,
    Swapping,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationStatus {
    Unconfigured,
    Configuring,
    Configured,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatingStatus {
    NotUpdating,
    Updating,
}

impl std::fmt::Display for GlobalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            GlobalStatus::Stopped => "stopped",
            GlobalStatus::Starting => "starting",
            GlobalStatus::Started => "started",
            GlobalStatus::Swapping => "swapping",
            GlobalStatus::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Auto connections
// ─────────────────────────────────────────────────────────────────────────────

/// Signal/slot pairs to connect for each object key
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AutoConnections {
    by_key: HashMap<String, Vec<(String, String)>>,
}

impl AutoConnections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect signal `signal` of the object under `key` to slot `slot`
    pub fn with(mut self, key: &str, signal: &str, slot: &str) -> Self {
        self.push(key, signal, slot);
        self
    }

    pub fn push(&mut self, key: &str, signal: &str, slot: &str) {
        self.by_key
            .entry(key.to_string())
            .or_default()
            .push((signal.to_string(), slot.to_string()));
    }

    /// Pairs for a key, falling back to the group for `group#N` keys
    pub fn for_key(&self, key: &str) -> &[(String, String)] {
        self.by_key
            .get(key)
            .or_else(|| self.by_key.get(group_of(key)))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service trait
// ─────────────────────────────────────────────────────────────────────────────

/// Behaviour of a service. Every hook runs on the service's worker, one at a
/// time.
pub trait Service: Send + 'static {
    /// Declare extra signals and slots. Called once, before anything else.
    fn declare(&mut self, _decl: &mut Declarations<'_, Self>)
    where
        Self: Sized,
    {
    }

    fn configuring(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        Ok(())
    }

    fn starting(&mut self, ctx: &ServiceContext) -> ServiceResult<()>;

    fn updating(&mut self, ctx: &ServiceContext) -> ServiceResult<()>;

    fn stopping(&mut self, ctx: &ServiceContext) -> ServiceResult<()>;

    /// Called after the object under `key` was replaced
    fn swapping(&mut self, ctx: &ServiceContext, _key: &str) -> ServiceResult<()> {
        self.stopping(ctx)?;
        self.starting(ctx)
    }

    /// Connections made at start for auto-connected objects
    fn auto_connections(&self) -> AutoConnections {
        AutoConnections::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service object
// ─────────────────────────────────────────────────────────────────────────────

/// Type-erased service, as stored by registries and managers
pub trait ServiceObject: HasSignals + HasSlots + Send + Sync + 'static {
    fn context(&self) -> &ServiceContext;

    fn uid(&self) -> &str {
        self.context().uid()
    }

    fn type_name(&self) -> &str {
        self.context().type_name()
    }

    /// Replace the configuration. Only while stopped; the service must be
    /// configured again afterwards.
    fn set_configuration(&self, config: ServiceConfig) -> ServiceResult<()>;

    /// Bind or unbind the object under a key
    fn set_object(&self, key: &str, object: Option<ObjectRef>);

    /// Channel endpoints connected at start and disconnected at stop
    fn add_proxy(&self, connections: ProxyConnections);

    /// Run `configuring` on the calling thread
    fn configure(&self) -> ServiceResult<()>;

    fn start(&self) -> ServiceFuture;

    fn stop(&self) -> ServiceFuture;

    fn update(&self) -> ServiceFuture;

    fn swap_key(&self, key: &str, object: Option<ObjectRef>) -> ServiceFuture;

    fn global_status(&self) -> GlobalStatus;

    fn configuration_status(&self) -> ConfigurationStatus;

    fn updating_status(&self) -> UpdatingStatus;

    fn is_started(&self) -> bool {
        self.global_status() == GlobalStatus::Started
    }

    fn is_stopped(&self) -> bool {
        self.global_status() == GlobalStatus::Stopped
    }

    /// Last failure recorded by a lifecycle transition
    fn last_error(&self) -> Option<ServiceError>;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Shared handle on a service
pub type ServiceRef = Arc<dyn ServiceObject>;

// ─────────────────────────────────────────────────────────────────────────────
// Service future
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of a lifecycle transition
#[derive(Debug)]
pub struct ServiceFuture(SlotFuture<ServiceResult<()>>);

impl ServiceFuture {
    pub fn ready(result: ServiceResult<()>) -> Self {
        Self(SlotFuture::ready(Ok(result)))
    }

    pub(crate) fn from_slot(future: SlotFuture<ServiceResult<()>>) -> Self {
        Self(future)
    }

    /// Block until the transition completed
    pub fn wait(self) -> ServiceResult<()> {
        self.0.wait().map_err(ServiceError::from).and_then(|result| result)
    }
}

impl Future for ServiceFuture {
    type Output = ServiceResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().0)
            .poll(cx)
            .map(|result| result.map_err(ServiceError::from).and_then(|inner| inner))
    }
}

/// Wait for several transitions, returning the first failure
pub fn wait_all(futures: impl IntoIterator<Item = ServiceFuture>) -> ServiceResult<()> {
    let mut first_error = None;
    for future in futures {
        if let Err(e) = future.wait() {
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

// ─────────────────────────────────────────────────────────────────────────────
// Declarations
// ─────────────────────────────────────────────────────────────────────────────

/// Handed to `Service::declare` to add signals and slots
pub struct Declarations<'a, S: Service> {
    cell: std::sync::Weak<ServiceCell<S>>,
    ctx: &'a ServiceContext,
}

impl<'a, S: Service> Declarations<'a, S> {
    pub(crate) fn new(cell: std::sync::Weak<ServiceCell<S>>, ctx: &'a ServiceContext) -> Self {
        Self { cell, ctx }
    }

    /// Create a signal under `key`. Keep the handle to emit it.
    pub fn signal<A: Clone + Send + 'static>(&mut self, key: &str) -> Signal<A> {
        self.ctx.signals().new_signal(key)
    }

    /// Create a slot under `key` running `f` on the service's worker.
    ///
    /// Failures of `f` are logged, the slot itself always succeeds.
    pub fn slot<A, F>(&mut self, key: &str, f: F) -> Slot<A>
    where
        A: Send + 'static,
        F: Fn(&mut S, &ServiceContext, A) -> ServiceResult<()> + Send + Sync + 'static,
    {
        let cell = self.cell.clone();
        let slot_key = key.to_string();
        let slot = Slot::fallible(Some(self.ctx.worker().clone()), move |args: A| {
            let cell = cell.upgrade().ok_or(sight_com::ComError::OwnerDropped)?;
            if let Err(e) = cell.with_service(|service, ctx| f(service, ctx, args)) {
                tracing::warn!(service = %cell.context().uid(), slot = %slot_key, error = %e, "Slot failed");
            }
            Ok(())
        });
        self.ctx.slots().insert(key, &slot);
        slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_connections_group_fallback() {
        let connections = AutoConnections::new()
            .with("images", "modified", "update")
            .with("matrix", "modified", "update")
            .with("matrix", "modified", "refresh");

        assert_eq!(connections.for_key("images#3").len(), 1);
        assert_eq!(connections.for_key("matrix").len(), 2);
        assert!(connections.for_key("other").is_empty());
    }

    #[test]
    fn test_wait_all_reports_first_error() {
        let futures = vec![
            ServiceFuture::ready(Ok(())),
            ServiceFuture::ready(Err(ServiceError::Runtime("first".into()))),
            ServiceFuture::ready(Err(ServiceError::Runtime("second".into()))),
        ];
        assert_eq!(wait_all(futures), Err(ServiceError::Runtime("first".into())));
    }
}
