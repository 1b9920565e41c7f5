//! Service lifecycle inside an application context

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use sight_com::{HasSlots, Worker};
use sight_data::{Integer, Object};
use sight_service::{
    Access, ApplicationContext, AutoConnections, ObjectServiceConfig, Service, ServiceConfig,
    ServiceContext, ServiceError, ServiceObject, ServiceResult, slots,
};

/// Increments its value on every update and notifies the change without
/// triggering itself again
struct Echo {
    runs: Arc<AtomicUsize>,
}

impl Service for Echo {
    fn starting(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        Ok(())
    }

    fn updating(&mut self, ctx: &ServiceContext) -> ServiceResult<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);

        let value = ctx.required("value")?;
        value.try_write::<Integer>()?.0 += 1;

        let _blocker = ctx.blocker(&value, Object::MODIFIED_SIG, slots::UPDATE);
        value.notify_modified();
        Ok(())
    }

    fn stopping(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        Ok(())
    }

    fn auto_connections(&self) -> AutoConnections {
        AutoConnections::new().with("value", Object::MODIFIED_SIG, slots::UPDATE)
    }
}

/// Wait until everything queued on the worker so far has run
fn drain(worker: &Worker) {
    for _ in 0..3 {
        worker.post_task(|| ()).unwrap().wait().unwrap();
    }
}

#[test]
fn test_blocked_echo_updates_once() {
    let app = ApplicationContext::new().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let value = Object::new("value", Integer(0));

    let echo = app
        .add_service("echo", Echo { runs: Arc::clone(&runs) })
        .unwrap();
    echo.set_configuration(
        ServiceConfig::default()
            .with_object(ObjectServiceConfig::new("value", "value", Access::InOut).auto_connect(true)),
    )
    .unwrap();
    echo.set_object("value", Some(value.clone()));
    echo.configure().unwrap();
    echo.start().wait().unwrap();

    value.notify_modified();
    drain(echo.context().worker());

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(*value.read::<Integer>().unwrap(), Integer(1));

    // The connection is usable again once the blocker is gone
    value.notify_modified();
    drain(echo.context().worker());
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    app.shutdown();
}

#[test]
fn test_stop_twice_is_a_no_op() {
    let app = ApplicationContext::new().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let echo = app.add_service("echo", Echo { runs }).unwrap();

    echo.configure().unwrap();
    echo.start().wait().unwrap();
    assert!(matches!(echo.start().wait(), Err(ServiceError::Precondition(_))));

    echo.stop().wait().unwrap();
    echo.stop().wait().unwrap();
    assert!(echo.is_stopped());
    assert!(echo.last_error().is_none());

    app.shutdown();
}

#[test]
fn test_register_twice_for_object_keeps_one_entry() {
    let app = ApplicationContext::new().unwrap();
    let value = Object::new("value", Integer(0));
    let echo = app
        .add_service("echo", Echo { runs: Arc::new(AtomicUsize::new(0)) })
        .unwrap();

    app.registry().register_service_for(&value, echo.clone()).unwrap();
    app.registry().register_service_for(&value, echo.clone()).unwrap();

    assert_eq!(app.registry().services_for(&value).len(), 1);
    assert_eq!(app.registry().get_services::<Echo>(&value).len(), 1);
    assert_eq!(app.registry().len(), 1);

    app.shutdown();
}

#[test]
fn test_update_before_start_is_discarded() {
    let app = ApplicationContext::new().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let echo = app
        .add_service("echo", Echo { runs: Arc::clone(&runs) })
        .unwrap();

    echo.configure().unwrap();
    echo.update().wait().unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    app.shutdown();
}

#[test]
fn test_lifecycle_through_slots() {
    let app = ApplicationContext::new().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let value = Object::new("value", Integer(0));
    let echo = app
        .add_service("echo", Echo { runs: Arc::clone(&runs) })
        .unwrap();

    echo.set_object("value", Some(value));
    echo.configure().unwrap();

    let start = echo.slots().get::<(), ServiceResult<()>>(slots::START).unwrap();
    start.async_call(()).wait().unwrap().unwrap();
    assert!(echo.is_started());

    let update = echo.slots().get::<(), ServiceResult<()>>(slots::UPDATE).unwrap();
    update.async_call(()).wait().unwrap().unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let stop = echo.slots().get::<(), ServiceResult<()>>(slots::STOP).unwrap();
    stop.async_call(()).wait().unwrap().unwrap();
    assert!(echo.is_stopped());

    app.shutdown();
}

#[test]
fn test_transitions_can_be_awaited() {
    let app = ApplicationContext::new().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let value = Object::new("value", Integer(0));
    let echo = app
        .add_service("echo", Echo { runs: Arc::clone(&runs) })
        .unwrap();
    echo.set_object("value", Some(value));
    echo.configure().unwrap();

    tokio_test::block_on(async {
        echo.start().await.unwrap();
        echo.update().await.unwrap();
        echo.stop().await.unwrap();
    });

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(echo.is_stopped());
    app.shutdown();
}
