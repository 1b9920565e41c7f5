//! Slots
//!
//! A slot wraps a callable taking one argument value (use a tuple for several
//! arguments, `()` for none). It can be run inline on the calling thread or
//! posted on the worker it is bound to.

use std::any::{self, Any, TypeId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::{ComError, ComResult, SlotFuture, Worker};

static NEXT_SLOT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique slot identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(u64);

impl SlotId {
    fn next() -> Self {
        Self(NEXT_SLOT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Type-erased slot
// ─────────────────────────────────────────────────────────────────────────────

/// Type-erased view of a slot, used by signals and slot maps
pub trait SlotBase: Send + Sync + 'static {
    fn id(&self) -> SlotId;

    /// `TypeId` of the argument value
    fn arg_type(&self) -> TypeId;

    /// Human readable argument type
    fn signature(&self) -> &'static str;

    /// Worker fixed at construction, if any
    fn worker(&self) -> Option<Worker>;

    /// Run inline with a boxed argument. The result value is discarded.
    fn run_any(&self, args: Box<dyn Any + Send>) -> ComResult<()>;

    /// Post on the slot's worker with a boxed argument.
    ///
    /// Only queueing failures are reported here; failures of the slot body
    /// are logged on the worker.
    fn async_run_any(self: Arc<Self>, args: Box<dyn Any + Send>) -> ComResult<()>;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

fn downcast_args<A: 'static>(args: Box<dyn Any + Send>) -> ComResult<A> {
    args.downcast::<A>()
        .map(|boxed| *boxed)
        .map_err(|_| ComError::BadRun {
            expected: any::type_name::<A>(),
        })
}

// ─────────────────────────────────────────────────────────────────────────────
// Slot
// ─────────────────────────────────────────────────────────────────────────────

type SlotFn<A, R> = Box<dyn Fn(A) -> ComResult<R> + Send + Sync>;

/// Typed slot handle. Clones share the same identity.
pub struct Slot<A, R = ()> {
    inner: Arc<SlotInner<A, R>>,
}

pub struct SlotInner<A, R> {
    id: SlotId,
    worker: Option<Worker>,
    func: SlotFn<A, R>,
}

impl<A, R> Clone for Slot<A, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, R> Slot<A, R>
where
    A: Send + 'static,
    R: Send + 'static,
{
    /// Slot with no worker. It can only be run inline.
    pub fn new(f: impl Fn(A) -> R + Send + Sync + 'static) -> Self {
        Self::fallible(None, move |args| Ok(f(args)))
    }

    /// Slot bound to a worker
    pub fn with_worker(worker: Worker, f: impl Fn(A) -> R + Send + Sync + 'static) -> Self {
        Self::fallible(Some(worker), move |args| Ok(f(args)))
    }

    /// Slot whose callable can itself fail with a `ComError`
    pub fn fallible(
        worker: Option<Worker>,
        f: impl Fn(A) -> ComResult<R> + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(SlotInner {
                id: SlotId::next(),
                worker,
                func: Box::new(f),
            }),
        }
    }

    /// Slot calling a method on a shared owner.
    ///
    /// Only a weak reference is kept: once the owner is dropped, running the
    /// slot fails with `ComError::OwnerDropped`.
    pub fn from_method<T>(
        owner: &Arc<T>,
        worker: Option<Worker>,
        f: impl Fn(&T, A) -> R + Send + Sync + 'static,
    ) -> Self
    where
        T: Send + Sync + 'static,
    {
        Self::from_weak(Arc::downgrade(owner), worker, f)
    }

    /// Same as `from_method` from an existing weak reference
    pub fn from_weak<T>(
        owner: Weak<T>,
        worker: Option<Worker>,
        f: impl Fn(&T, A) -> R + Send + Sync + 'static,
    ) -> Self
    where
        T: Send + Sync + 'static,
    {
        Self::fallible(worker, move |args| {
            let owner = owner.upgrade().ok_or(ComError::OwnerDropped)?;
            Ok(f(&owner, args))
        })
    }

    /// Recover a typed slot from its erased form
    pub fn from_base(base: Arc<dyn SlotBase>) -> Option<Self> {
        base.into_any()
            .downcast::<SlotInner<A, R>>()
            .ok()
            .map(|inner| Self { inner })
    }

    pub fn id(&self) -> SlotId {
        self.inner.id
    }

    pub fn worker(&self) -> Option<Worker> {
        self.inner.worker.clone()
    }

    /// Run inline on the calling thread, discarding the result
    pub fn run(&self, args: A) -> ComResult<()> {
        (self.inner.func)(args).map(|_| ())
    }

    /// Run inline on the calling thread
    pub fn call(&self, args: A) -> ComResult<R> {
        (self.inner.func)(args)
    }

    /// Post on the worker, discarding the result
    pub fn async_run(&self, args: A) -> SlotFuture<()> {
        let Some(worker) = self.worker() else {
            return SlotFuture::ready(Err(ComError::NoWorker));
        };

        let inner = Arc::clone(&self.inner);
        match worker.post_task(move || (inner.func)(args).map(|_| ())) {
            Ok(task) => SlotFuture::from_task(task),
            Err(e) => SlotFuture::ready(Err(e)),
        }
    }

    /// Post on the worker and get a future on the result
    pub fn async_call(&self, args: A) -> SlotFuture<R> {
        let Some(worker) = self.worker() else {
            return SlotFuture::ready(Err(ComError::NoWorker));
        };

        let inner = Arc::clone(&self.inner);
        match worker.post_task(move || (inner.func)(args)) {
            Ok(task) => SlotFuture::from_task(task),
            Err(e) => SlotFuture::ready(Err(e)),
        }
    }

    /// Erased handle sharing this slot's identity
    pub fn as_base(&self) -> Arc<dyn SlotBase> {
        self.inner.clone()
    }
}

impl<A, R> SlotBase for SlotInner<A, R>
where
    A: Send + 'static,
    R: Send + 'static,
{
    fn id(&self) -> SlotId {
        self.id
    }

    fn arg_type(&self) -> TypeId {
        TypeId::of::<A>()
    }

    fn signature(&self) -> &'static str {
        any::type_name::<A>()
    }

    fn worker(&self) -> Option<Worker> {
        self.worker.clone()
    }

    fn run_any(&self, args: Box<dyn Any + Send>) -> ComResult<()> {
        let args = downcast_args::<A>(args)?;
        (self.func)(args).map(|_| ())
    }

    fn async_run_any(self: Arc<Self>, args: Box<dyn Any + Send>) -> ComResult<()> {
        let args = downcast_args::<A>(args)?;
        let worker = self.worker.clone().ok_or(ComError::NoWorker)?;

        worker.post(move || {
            if let Err(e) = (self.func)(args) {
                tracing::warn!(slot = %self.id, error = %e, "Asynchronous slot call failed");
            }
        })
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl<A, R> std::fmt::Debug for Slot<A, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("id", &self.inner.id)
            .field("args", &any::type_name::<A>())
            .field("worker", &self.inner.worker.as_ref().map(|w| w.name().to_string()))
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;
    use std::thread;

    struct Accumulator {
        total: AtomicI64,
    }

    impl Accumulator {
        fn add(&self, value: i64) -> i64 {
            self.total.fetch_add(value, Ordering::SeqCst) + value
        }
    }

    #[test]
    fn test_run_and_call_inline() {
        let slot = Slot::new(|(a, b): (i32, i32)| a + b);

        assert_eq!(slot.call((2, 3)), Ok(5));
        assert_eq!(slot.run((2, 3)), Ok(()));
        assert!(slot.worker().is_none());
    }

    #[test]
    fn test_async_without_worker_fails() {
        let slot = Slot::new(|x: i32| x * 2);
        assert_eq!(slot.async_call(4).wait(), Err(ComError::NoWorker));
    }

    #[test]
    fn test_async_call_runs_on_worker() {
        let worker = Worker::spawn("slot-worker").unwrap();
        let slot = Slot::with_worker(worker.clone(), |_: ()| thread::current().id());

        assert_eq!(slot.async_call(()).wait(), Ok(worker.thread_id()));
        assert_ne!(slot.call(()), Ok(worker.thread_id()));
        worker.stop();
    }

    #[test]
    fn test_method_slot_fails_once_owner_dropped() {
        let owner = Arc::new(Accumulator {
            total: AtomicI64::new(0),
        });
        let slot = Slot::from_method(&owner, None, Accumulator::add);

        assert_eq!(slot.call(3), Ok(3));
        assert_eq!(slot.call(4), Ok(7));

        drop(owner);
        assert_eq!(slot.call(1), Err(ComError::OwnerDropped));
    }

    #[test]
    fn test_erased_run_checks_argument_type() {
        let slot = Slot::new(|x: u8| x);
        let base = slot.as_base();

        assert_eq!(base.id(), slot.id());
        assert_eq!(base.arg_type(), TypeId::of::<u8>());
        assert!(base.run_any(Box::new(1u8)).is_ok());
        assert!(matches!(
            base.run_any(Box::new("wrong")),
            Err(ComError::BadRun { .. })
        ));
    }

    #[test]
    fn test_from_base_recovers_typed_slot() {
        let slot: Slot<i32, i32> = Slot::new(|x| x + 1);
        let base = slot.as_base();

        let typed = Slot::<i32, i32>::from_base(base.clone()).unwrap();
        assert_eq!(typed.id(), slot.id());
        assert_eq!(typed.call(1), Ok(2));

        assert!(Slot::<i32, ()>::from_base(base).is_none());
    }
}
