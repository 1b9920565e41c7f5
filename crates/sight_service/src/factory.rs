//! Service factory
//!
//! Service types are registered by name, explicitly, before an application
//! configuration refers to them.

use std::sync::Arc;

use dashmap::DashMap;
use sight_com::Worker;

use crate::{Service, ServiceCell, ServiceError, ServiceRef, ServiceResult, WeakApplicationContext};

type ServiceCtor = Arc<dyn Fn(&str, Worker, WeakApplicationContext) -> ServiceRef + Send + Sync>;

#[derive(Default)]
pub struct ServiceFactory {
    ctors: DashMap<String, ServiceCtor>,
}

impl ServiceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor. A later registration under the same name
    /// replaces the previous one.
    pub fn register<F>(&self, type_name: impl Into<String>, ctor: F)
    where
        F: Fn(&str, Worker, WeakApplicationContext) -> ServiceRef + Send + Sync + 'static,
    {
        let type_name = type_name.into();
        if self.ctors.insert(type_name.clone(), Arc::new(ctor)).is_some() {
            tracing::warn!(service_type = %type_name, "Service type registered twice, keeping the last one");
        } else {
            tracing::debug!(service_type = %type_name, "Registered service type");
        }
    }

    /// Register a service type built with `Default`
    pub fn register_default<S: Service + Default>(&self, type_name: &str) {
        let name = type_name.to_string();
        self.register(type_name, move |uid, worker, app| {
            ServiceCell::new(uid, name.clone(), S::default(), worker, app) as ServiceRef
        });
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.ctors.contains_key(type_name)
    }

    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.ctors.iter().map(|entry| entry.key().clone()).collect();
        types.sort();
        types
    }

    pub fn create(
        &self,
        type_name: &str,
        uid: &str,
        worker: Worker,
        app: WeakApplicationContext,
    ) -> ServiceResult<ServiceRef> {
        let ctor = self
            .ctors
            .get(type_name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ServiceError::UnknownType(type_name.to_string()))?;

        tracing::debug!(service = %uid, service_type = %type_name, worker = %worker.name(), "Creating service");
        Ok(ctor(uid, worker, app))
    }
}

impl std::fmt::Debug for ServiceFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceFactory").field("types", &self.types()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ServiceContext, ServiceObject};

    #[derive(Default)]
    struct Noop;

    impl Service for Noop {
        fn starting(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
            Ok(())
        }
        fn updating(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
            Ok(())
        }
        fn stopping(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_create_registered_type() {
        let worker = Worker::spawn("factory-test").unwrap();
        let factory = ServiceFactory::new();
        factory.register_default::<Noop>("test::Noop");

        let service = factory
            .create("test::Noop", "noop", worker.clone(), WeakApplicationContext::default())
            .unwrap();
        assert_eq!(service.uid(), "noop");
        assert_eq!(service.type_name(), "test::Noop");
        assert!(service.is_stopped());
        assert_eq!(factory.types(), vec!["test::Noop".to_string()]);
        worker.stop();
    }

    #[test]
    fn test_unknown_type() {
        let worker = Worker::spawn("factory-test").unwrap();
        let factory = ServiceFactory::new();

        assert_eq!(
            factory
                .create("test::Missing", "x", worker.clone(), WeakApplicationContext::default())
                .err(),
            Some(ServiceError::UnknownType("test::Missing".into()))
        );
        worker.stop();
    }
}
