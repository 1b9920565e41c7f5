//! Application context
//!
//! Everything an application shares: workers, the object-service registry,
//! the proxy and the factories. Cloning the context is cheap; services keep
//! a `WeakApplicationContext` so they never keep the application alive.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use sight_com::{Worker, WorkerRegistry};
use sight_data::DataFactory;

use crate::{
    ObjectServiceRegistry, Proxy, Service, ServiceCell, ServiceFactory, ServiceObject, ServiceRef,
    ServiceResult,
};

pub const DEFAULT_WORKER: &str = "default";

struct AppInner {
    workers: WorkerRegistry,
    registry: ObjectServiceRegistry,
    proxy: Proxy,
    services: ServiceFactory,
    data: DataFactory,
    counter: AtomicU64,
}

#[derive(Clone)]
pub struct ApplicationContext {
    inner: Arc<AppInner>,
}

/// Non-owning handle on an application
#[derive(Clone, Default)]
pub struct WeakApplicationContext(Weak<AppInner>);

impl WeakApplicationContext {
    pub fn upgrade(&self) -> Option<ApplicationContext> {
        self.0.upgrade().map(|inner| ApplicationContext { inner })
    }
}

impl std::fmt::Debug for WeakApplicationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("WeakApplicationContext")
            .field(&(self.0.strong_count() > 0))
            .finish()
    }
}

impl ApplicationContext {
    /// New application with its default worker and the built-in data types
    pub fn new() -> ServiceResult<Self> {
        Ok(Self {
            inner: Arc::new(AppInner {
                workers: WorkerRegistry::new(DEFAULT_WORKER)?,
                registry: ObjectServiceRegistry::new(),
                proxy: Proxy::new(),
                services: ServiceFactory::new(),
                data: DataFactory::with_builtins(),
                counter: AtomicU64::new(0),
            }),
        })
    }

    pub fn workers(&self) -> &WorkerRegistry {
        &self.inner.workers
    }

    pub fn default_worker(&self) -> Worker {
        self.inner.workers.default_worker()
    }

    pub fn registry(&self) -> &ObjectServiceRegistry {
        &self.inner.registry
    }

    pub fn proxy(&self) -> &Proxy {
        &self.inner.proxy
    }

    pub fn service_factory(&self) -> &ServiceFactory {
        &self.inner.services
    }

    pub fn data_factory(&self) -> &DataFactory {
        &self.inner.data
    }

    pub fn downgrade(&self) -> WeakApplicationContext {
        WeakApplicationContext(Arc::downgrade(&self.inner))
    }

    /// Fresh uid of the form `prefix-N`
    pub fn generate_uid(&self, prefix: &str) -> String {
        let n = self.inner.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{prefix}-{n}")
    }

    /// Host a service on the default worker and register it
    pub fn add_service<S: Service>(&self, uid: &str, service: S) -> ServiceResult<Arc<ServiceCell<S>>> {
        self.add_service_on(uid, service, self.default_worker())
    }

    /// Host a service on a given worker and register it
    pub fn add_service_on<S: Service>(
        &self,
        uid: &str,
        service: S,
        worker: Worker,
    ) -> ServiceResult<Arc<ServiceCell<S>>> {
        let cell = ServiceCell::new(uid, std::any::type_name::<S>(), service, worker, self.downgrade());
        self.registry().register_service(cell.clone())?;
        Ok(cell)
    }

    /// Create a registered service type through the factory.
    ///
    /// Without a uid one is generated from the type name. The worker is
    /// looked up by name and spawned if needed; `None` means the default
    /// worker.
    pub fn create_service(
        &self,
        type_name: &str,
        uid: Option<&str>,
        worker: Option<&str>,
    ) -> ServiceResult<ServiceRef> {
        let uid = match uid {
            Some(uid) => uid.to_string(),
            None => self.generate_uid(type_name),
        };
        let worker = match worker {
            Some(name) => self.workers().get_or_spawn(name)?.0,
            None => self.default_worker(),
        };

        let service = self.service_factory().create(type_name, &uid, worker, self.downgrade())?;
        self.registry().register_service(service.clone())?;
        Ok(service)
    }

    /// Stop and unregister every service, then stop the workers
    pub fn shutdown(&self) {
        let services = self.registry().all();
        tracing::info!(services = services.len(), "Shutting down application");

        for service in services.iter().rev() {
            if let Err(e) = service.stop().wait() {
                tracing::error!(service = %service.uid(), error = %e, "Error while stopping service");
            }
        }
        for service in services.iter().rev() {
            if let Err(e) = self.registry().unregister_service(service.uid()) {
                tracing::warn!(service = %service.uid(), error = %e, "Cannot unregister service");
            }
        }

        self.workers().stop_all();
    }
}

impl std::fmt::Debug for ApplicationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplicationContext")
            .field("workers", &self.inner.workers)
            .field("registry", &self.inner.registry)
            .field("proxy", &self.inner.proxy)
            .finish()
    }
}
