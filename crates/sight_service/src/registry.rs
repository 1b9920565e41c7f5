//! Object-Service Registry
//!
//! Keeps track of every service of an application, of the objects they are
//! bound to and of the outputs they publish. The whole state sits behind a
//! single lock; signals are emitted once it is released.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::RwLock;
use sight_com::{HasSignals, Signal, Signals};
use sight_data::ObjectRef;
use wildmatch::WildMatch;

use crate::{ServiceCell, ServiceError, ServiceObject, ServiceRef, ServiceResult, Service};

pub const REGISTERED_SERVICE_SIG: &str = "registeredService";
pub const UNREGISTERED_SERVICE_SIG: &str = "unregisteredService";
pub const REGISTERED_OBJECT_SIG: &str = "registeredObject";
pub const UNREGISTERED_OBJECT_SIG: &str = "unregisteredObject";

struct ObjectEntry {
    object: ObjectRef,
    services: Vec<String>,
}

struct Output {
    object: ObjectRef,
    owner: String,
}

#[derive(Default)]
struct RegistryState {
    services: BTreeMap<String, ServiceRef>,
    by_object: Vec<ObjectEntry>,
    outputs: HashMap<String, Output>,
}

pub struct ObjectServiceRegistry {
    state: RwLock<RegistryState>,
    signals: Signals,
    registered_service: Signal<String>,
    unregistered_service: Signal<String>,
    registered_object: Signal<(ObjectRef, String)>,
    unregistered_object: Signal<(ObjectRef, String)>,
}

impl Default for ObjectServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectServiceRegistry {
    pub fn new() -> Self {
        let signals = Signals::new();
        let registered_service = signals.new_signal(REGISTERED_SERVICE_SIG);
        let unregistered_service = signals.new_signal(UNREGISTERED_SERVICE_SIG);
        let registered_object = signals.new_signal(REGISTERED_OBJECT_SIG);
        let unregistered_object = signals.new_signal(UNREGISTERED_OBJECT_SIG);

        Self {
            state: RwLock::new(RegistryState::default()),
            signals,
            registered_service,
            unregistered_service,
            registered_object,
            unregistered_object,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Services
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a service that is not bound to any object.
    ///
    /// Registering the same service again is a no-op; another service with
    /// the same uid is refused.
    pub fn register_service(&self, service: ServiceRef) -> ServiceResult<()> {
        let uid = service.uid().to_string();
        {
            let mut state = self.state.write();
            if let Some(existing) = state.services.get(&uid) {
                if Arc::ptr_eq(existing, &service) {
                    return Ok(());
                }
                return Err(ServiceError::Precondition(format!(
                    "a service '{uid}' is already registered"
                )));
            }
            state.services.insert(uid.clone(), service);
        }

        tracing::debug!(service = %uid, "Registered service");
        self.registered_service.async_emit(uid);
        Ok(())
    }

    /// Register a service and bind it to an object. A service is listed at
    /// most once per object.
    pub fn register_service_for(&self, object: &ObjectRef, service: ServiceRef) -> ServiceResult<()> {
        let uid = service.uid().to_string();
        let newly_registered = {
            let mut state = self.state.write();
            let newly_registered = match state.services.get(&uid) {
                Some(existing) if Arc::ptr_eq(existing, &service) => false,
                Some(_) => {
                    return Err(ServiceError::Precondition(format!(
                        "a service '{uid}' is already registered"
                    )));
                }
                None => {
                    state.services.insert(uid.clone(), service);
                    true
                }
            };

            // Objects nobody else holds any more cannot be looked up again
            state.by_object.retain(|entry| Arc::strong_count(&entry.object) > 1);
            let existing = state
                .by_object
                .iter()
                .position(|entry| Arc::ptr_eq(&entry.object, object));
            let index = match existing {
                Some(index) => index,
                None => {
                    state.by_object.push(ObjectEntry {
                        object: object.clone(),
                        services: Vec::new(),
                    });
                    state.by_object.len() - 1
                }
            };
            let entry = &mut state.by_object[index];
            if !entry.services.contains(&uid) {
                entry.services.push(uid.clone());
            }
            newly_registered
        };

        tracing::debug!(service = %uid, object = %object.uid(), "Registered service for object");
        if newly_registered {
            self.registered_service.async_emit(uid);
        }
        Ok(())
    }

    /// Remove a stopped service, its object bindings and its outputs
    pub fn unregister_service(&self, uid: &str) -> ServiceResult<()> {
        let dropped_outputs = {
            let mut state = self.state.write();
            let Some(service) = state.services.get(uid) else {
                return Err(ServiceError::Precondition(format!(
                    "no service '{uid}' is registered"
                )));
            };
            if !service.is_stopped() {
                return Err(ServiceError::Precondition(format!(
                    "service '{uid}' must be stopped before being unregistered (it is {})",
                    service.global_status()
                )));
            }

            state.services.remove(uid);
            state.by_object.retain_mut(|entry| {
                entry.services.retain(|s| s != uid);
                !entry.services.is_empty()
            });

            let owned: Vec<String> = state
                .outputs
                .iter()
                .filter(|(_, output)| output.owner == uid)
                .map(|(key, _)| key.clone())
                .collect();
            owned
                .into_iter()
                .filter_map(|key| state.outputs.remove(&key).map(|output| (key, output.object)))
                .collect::<Vec<_>>()
        };

        tracing::debug!(service = %uid, "Unregistered service");
        for (key, object) in dropped_outputs {
            tracing::debug!(output = %key, owner = %uid, "Dropped output of unregistered service");
            self.unregistered_object.async_emit((object, key));
        }
        self.unregistered_service.async_emit(uid.to_string());
        Ok(())
    }

    pub fn get(&self, uid: &str) -> Option<ServiceRef> {
        self.state.read().services.get(uid).cloned()
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.state.read().services.contains_key(uid)
    }

    /// Services bound to this very object, in registration order. Another
    /// object sharing its uid has its own list.
    pub fn services_for(&self, object: &ObjectRef) -> Vec<ServiceRef> {
        let state = self.state.read();
        state
            .by_object
            .iter()
            .find(|entry| Arc::ptr_eq(&entry.object, object))
            .map(|entry| {
                entry
                    .services
                    .iter()
                    .filter_map(|uid| state.services.get(uid).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Services of type `S` bound to an object
    pub fn get_services<S: Service>(&self, object: &ObjectRef) -> Vec<Arc<ServiceCell<S>>> {
        self.services_for(object)
            .into_iter()
            .filter_map(|service| service.into_any().downcast::<ServiceCell<S>>().ok())
            .collect()
    }

    /// Every registered service of type `S`
    pub fn services_of_type<S: Service>(&self) -> Vec<Arc<ServiceCell<S>>> {
        self.all()
            .into_iter()
            .filter_map(|service| service.into_any().downcast::<ServiceCell<S>>().ok())
            .collect()
    }

    /// Services whose type name matches a wildcard pattern such as `"sight::*"`
    pub fn services_matching(&self, pattern: &str) -> Vec<ServiceRef> {
        let pattern = WildMatch::new(pattern);
        self.state
            .read()
            .services
            .values()
            .filter(|service| pattern.matches(service.type_name()))
            .cloned()
            .collect()
    }

    /// Every registered service, ordered by uid
    pub fn all(&self) -> Vec<ServiceRef> {
        self.state.read().services.values().cloned().collect()
    }

    pub fn uids(&self) -> Vec<String> {
        self.state.read().services.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().services.is_empty()
    }

    /// Human readable dump of the registry
    pub fn registry_information(&self) -> String {
        let state = self.state.read();
        let mut info = String::new();

        let _ = writeln!(info, "{} service(s)", state.services.len());
        for (uid, service) in &state.services {
            let _ = writeln!(
                info,
                "  {uid} [{}] {}",
                service.type_name(),
                service.global_status()
            );
        }

        let mut objects: Vec<_> = state.by_object.iter().collect();
        objects.sort_by(|a, b| a.object.uid().cmp(b.object.uid()));
        for entry in objects {
            let _ = writeln!(
                info,
                "  object {} ({}) -> {}",
                entry.object.uid(),
                entry.object.class(),
                entry.services.join(", ")
            );
        }

        let mut outputs: Vec<_> = state.outputs.iter().collect();
        outputs.sort_by(|a, b| a.0.cmp(b.0));
        for (uid, output) in outputs {
            let _ = writeln!(info, "  output {uid} <- {}", output.owner);
        }
        info
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Outputs
    // ─────────────────────────────────────────────────────────────────────────

    /// Publish an object under an application uid
    pub fn register_output(&self, uid: &str, object: ObjectRef, owner: &str) {
        let previous = self.state.write().outputs.insert(
            uid.to_string(),
            Output {
                object: object.clone(),
                owner: owner.to_string(),
            },
        );

        if let Some(previous) = previous {
            tracing::debug!(output = %uid, "Replacing output");
            self.unregistered_object.async_emit((previous.object, uid.to_string()));
        }
        tracing::debug!(output = %uid, owner = %owner, "Registered output");
        self.registered_object.async_emit((object, uid.to_string()));
    }

    /// Withdraw a published object
    pub fn unregister_output(&self, uid: &str) -> Option<ObjectRef> {
        let output = self.state.write().outputs.remove(uid)?;
        tracing::debug!(output = %uid, owner = %output.owner, "Unregistered output");
        self.unregistered_object
            .async_emit((output.object.clone(), uid.to_string()));
        Some(output.object)
    }

    pub fn output(&self, uid: &str) -> Option<ObjectRef> {
        self.state.read().outputs.get(uid).map(|o| o.object.clone())
    }
}

impl HasSignals for ObjectServiceRegistry {
    fn signals(&self) -> &Signals {
        &self.signals
    }
}

impl std::fmt::Debug for ObjectServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectServiceRegistry")
            .field("services", &self.uids())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ServiceContext, WeakApplicationContext};
    use sight_com::{Slot, Worker};
    use sight_data::{Integer, Object};

    struct Idle;

    impl Service for Idle {
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

    struct Other;

    impl Service for Other {
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

    fn idle(uid: &str, worker: &Worker) -> Arc<ServiceCell<Idle>> {
        ServiceCell::new(uid, "test::Idle", Idle, worker.clone(), WeakApplicationContext::default())
    }

    #[test]
    fn test_register_twice_for_same_object() {
        let worker = Worker::spawn("osr-test").unwrap();
        let registry = ObjectServiceRegistry::new();
        let object = Object::new("value", Integer(1));
        let service = idle("srv", &worker);

        registry.register_service_for(&object, service.clone()).unwrap();
        registry.register_service_for(&object, service.clone()).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.services_for(&object).len(), 1);
        assert_eq!(registry.get_services::<Idle>(&object).len(), 1);
        assert!(registry.get_services::<Other>(&object).is_empty());
        worker.stop();
    }

    #[test]
    fn test_objects_sharing_a_uid_keep_separate_lists() {
        let worker = Worker::spawn("osr-test").unwrap();
        let registry = ObjectServiceRegistry::new();
        let first = Object::new("value", Integer(1));
        let second = Object::new("value", Integer(2));
        let a = idle("a", &worker);
        let b = idle("b", &worker);

        registry.register_service_for(&first, a.clone()).unwrap();
        registry.register_service_for(&second, b.clone()).unwrap();

        let uids = |object: &ObjectRef| -> Vec<String> {
            registry
                .services_for(object)
                .iter()
                .map(|service| service.uid().to_string())
                .collect()
        };
        assert_eq!(uids(&first), vec!["a".to_string()]);
        assert_eq!(uids(&second), vec!["b".to_string()]);
        worker.stop();
    }

    #[test]
    fn test_duplicate_uid_refused() {
        let worker = Worker::spawn("osr-test").unwrap();
        let registry = ObjectServiceRegistry::new();

        registry.register_service(idle("srv", &worker)).unwrap();
        assert!(matches!(
            registry.register_service(idle("srv", &worker)),
            Err(ServiceError::Precondition(_))
        ));
        worker.stop();
    }

    #[test]
    fn test_unregister_requires_stopped() {
        let worker = Worker::spawn("osr-test").unwrap();
        let registry = ObjectServiceRegistry::new();
        let object = Object::new("value", Integer(1));
        let service = idle("srv", &worker);

        registry.register_service_for(&object, service.clone()).unwrap();
        service.configure().unwrap();
        service.start().wait().unwrap();

        assert!(matches!(
            registry.unregister_service("srv"),
            Err(ServiceError::Precondition(_))
        ));

        service.stop().wait().unwrap();
        registry.register_output("produced", Object::new("produced", Integer(2)), "srv");
        registry.unregister_service("srv").unwrap();

        assert!(registry.is_empty());
        assert!(registry.services_for(&object).is_empty());
        assert!(registry.output("produced").is_none());
        worker.stop();
    }

    #[test]
    fn test_type_queries() {
        let worker = Worker::spawn("osr-test").unwrap();
        let registry = ObjectServiceRegistry::new();

        registry.register_service(idle("a", &worker)).unwrap();
        registry.register_service(idle("b", &worker)).unwrap();
        registry
            .register_service(ServiceCell::new(
                "c",
                "other::Other",
                Other,
                worker.clone(),
                WeakApplicationContext::default(),
            ))
            .unwrap();

        assert_eq!(registry.services_of_type::<Idle>().len(), 2);
        assert_eq!(registry.services_matching("test::*").len(), 2);
        assert_eq!(registry.services_matching("*Other").len(), 1);
        assert!(registry.registry_information().contains("3 service(s)"));
        worker.stop();
    }

    #[test]
    fn test_output_signals() {
        let worker = Worker::spawn("osr-test").unwrap();
        let registry = ObjectServiceRegistry::new();
        let (tx, rx) = std::sync::mpsc::channel::<String>();
        let tx = parking_lot::Mutex::new(tx);

        let slot = Slot::with_worker(worker.clone(), move |(_, uid): (ObjectRef, String)| {
            let _ = tx.lock().send(uid);
        });
        registry
            .signals()
            .get::<(ObjectRef, String)>(REGISTERED_OBJECT_SIG)
            .unwrap()
            .connect(&slot)
            .unwrap();

        let object = Object::new("image", Integer(0));
        registry.register_output("image", object.clone(), "reader");

        assert_eq!(
            rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap(),
            "image"
        );
        assert!(Arc::ptr_eq(&registry.output("image").unwrap(), &object));
        assert!(Arc::ptr_eq(&registry.unregister_output("image").unwrap(), &object));
        assert!(registry.output("image").is_none());
        worker.stop();
    }
}
