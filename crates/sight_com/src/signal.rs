//! Signals
//!
//! A signal keeps an ordered list of connections to slots. Slots are held
//! weakly: dropping the last handle on a slot disconnects it. A slot taking
//! `()` can be connected to any signal, the emitted value is then dropped.

use std::any::{self, Any, TypeId};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::{ComError, ComResult, Connection, Slot, SlotBase, SlotId};

static NEXT_SIGNAL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique signal identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignalId(u64);

impl SignalId {
    fn next() -> Self {
        Self(NEXT_SIGNAL_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SignalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "signal#{}", self.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Slot connection record
// ─────────────────────────────────────────────────────────────────────────────

/// One signal → slot link, shared between the signal and `Connection` handles
pub(crate) struct SlotConnection {
    slot_id: SlotId,
    slot: Weak<dyn SlotBase>,
    discard_args: bool,
    blocked: AtomicUsize,
    connected: AtomicBool,
}

impl SlotConnection {
    pub(crate) fn slot_id(&self) -> SlotId {
        self.slot_id
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && self.slot.strong_count() > 0
    }

    pub(crate) fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
    }

    pub(crate) fn block(&self) {
        self.blocked.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unblock(&self) {
        let _ = self
            .blocked
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub(crate) fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire) > 0
    }

    fn payload<A: Clone + Send + 'static>(&self, args: &A) -> Box<dyn Any + Send> {
        if self.discard_args {
            Box::new(())
        } else {
            Box::new(args.clone())
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Type-erased signal
// ─────────────────────────────────────────────────────────────────────────────

/// Type-erased view of a signal, used by signal maps, proxies and `Connection`
pub trait SignalBase: Send + Sync + 'static {
    fn id(&self) -> SignalId;

    /// `TypeId` of the emitted value
    fn arg_type(&self) -> TypeId;

    fn signature(&self) -> &'static str;

    fn connect_base(self: Arc<Self>, slot: &Arc<dyn SlotBase>) -> ComResult<Connection>;

    fn disconnect_base(&self, slot: &dyn SlotBase) -> ComResult<()>;

    /// Handle on an existing connection to the given slot
    fn connection_to(self: Arc<Self>, slot: SlotId) -> Option<Connection>;

    fn num_connections(&self) -> usize;

    fn disconnect_all(&self);

    /// Drop every link already marked disconnected. Live links are kept,
    /// even a newer one to the same slot.
    fn prune_disconnected(&self);

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Signal
// ─────────────────────────────────────────────────────────────────────────────

/// Typed signal handle. Clones share the same connection list.
pub struct Signal<A> {
    inner: Arc<SignalInner<A>>,
}

pub struct SignalInner<A> {
    id: SignalId,
    connections: RwLock<Vec<Arc<SlotConnection>>>,
    _marker: PhantomData<fn(A)>,
}

impl<A> Clone for Signal<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: Clone + Send + 'static> Default for Signal<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Clone + Send + 'static> Signal<A> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                id: SignalId::next(),
                connections: RwLock::new(Vec::new()),
                _marker: PhantomData,
            }),
        }
    }

    /// Recover a typed signal from its erased form
    pub fn from_base(base: Arc<dyn SignalBase>) -> Option<Self> {
        base.into_any()
            .downcast::<SignalInner<A>>()
            .ok()
            .map(|inner| Self { inner })
    }

    pub fn id(&self) -> SignalId {
        self.inner.id
    }

    /// Erased handle sharing this signal's connections
    pub fn as_base(&self) -> Arc<dyn SignalBase> {
        self.inner.clone()
    }

    /// Connect a slot.
    ///
    /// The slot must take the emitted type or `()`. Connecting the same slot
    /// twice fails with `ComError::AlreadyConnected`.
    pub fn connect<B, R>(&self, slot: &Slot<B, R>) -> ComResult<Connection>
    where
        B: Send + 'static,
        R: Send + 'static,
    {
        self.inner.connect_slot(&slot.as_base())
    }

    /// Disconnect a slot. Fails with `ComError::BadSlot` if it is not connected.
    pub fn disconnect<B, R>(&self, slot: &Slot<B, R>) -> ComResult<()>
    where
        B: Send + 'static,
        R: Send + 'static,
    {
        self.inner.remove(slot.id())
    }

    pub fn disconnect_all(&self) {
        self.inner.disconnect_all();
    }

    /// Number of connections whose slot is still alive
    pub fn num_connections(&self) -> usize {
        self.inner.num_connections()
    }

    /// Handle on the connection to a slot, if connected
    pub fn connection<B, R>(&self, slot: &Slot<B, R>) -> Option<Connection>
    where
        B: Send + 'static,
        R: Send + 'static,
    {
        self.inner.clone().connection_to(slot.id())
    }

    /// Run every connected, unblocked slot inline, in connection order.
    ///
    /// Slot failures are logged and do not stop the emission.
    pub fn emit(&self, args: A) {
        let mut pruned = false;

        for link in self.inner.snapshot() {
            if !link.connected.load(Ordering::Acquire) || link.is_blocked() {
                continue;
            }
            let Some(slot) = link.slot.upgrade() else {
                pruned = true;
                continue;
            };

            if let Err(e) = slot.run_any(link.payload(&args)) {
                tracing::warn!(signal = %self.inner.id, slot = %link.slot_id, error = %e, "Slot failed during emit");
            }
        }

        if pruned {
            self.inner.prune();
        }
    }

    /// Post every connected, unblocked slot on its own worker and return
    /// without waiting. Slots without a worker are skipped with a warning.
    pub fn async_emit(&self, args: A) {
        let mut pruned = false;

        for link in self.inner.snapshot() {
            if !link.connected.load(Ordering::Acquire) || link.is_blocked() {
                continue;
            }
            let Some(slot) = link.slot.upgrade() else {
                pruned = true;
                continue;
            };

            if let Err(e) = slot.async_run_any(link.payload(&args)) {
                tracing::warn!(signal = %self.inner.id, slot = %link.slot_id, error = %e, "Slot skipped during async emit");
            }
        }

        if pruned {
            self.inner.prune();
        }
    }
}

impl<A: Clone + Send + 'static> SignalInner<A> {
    fn snapshot(&self) -> Vec<Arc<SlotConnection>> {
        self.connections.read().clone()
    }

    fn prune(&self) {
        self.connections.write().retain(|link| link.is_connected());
    }

    fn connect_slot(self: &Arc<Self>, slot: &Arc<dyn SlotBase>) -> ComResult<Connection> {
        let discard_args = if slot.arg_type() == TypeId::of::<A>() {
            false
        } else if slot.arg_type() == TypeId::of::<()>() {
            true
        } else {
            return Err(ComError::BadSlot(format!(
                "signal emits {}, slot expects {}",
                any::type_name::<A>(),
                slot.signature()
            )));
        };

        let mut connections = self.connections.write();
        connections.retain(|link| link.is_connected());
        if connections.iter().any(|link| link.slot_id == slot.id()) {
            return Err(ComError::AlreadyConnected);
        }

        let link = Arc::new(SlotConnection {
            slot_id: slot.id(),
            slot: Arc::downgrade(slot),
            discard_args,
            blocked: AtomicUsize::new(0),
            connected: AtomicBool::new(true),
        });
        connections.push(Arc::clone(&link));
        drop(connections);

        tracing::trace!(signal = %self.id, slot = %slot.id(), "Connected");
        let signal: Weak<dyn SignalBase> = Arc::downgrade(self) as Weak<dyn SignalBase>;
        Ok(Connection::new(link, signal))
    }

    fn remove(&self, slot: SlotId) -> ComResult<()> {
        let mut connections = self.connections.write();
        let index = connections
            .iter()
            .position(|link| link.slot_id == slot && link.is_connected())
            .ok_or_else(|| ComError::BadSlot(format!("{slot} is not connected")))?;
        let link = connections.remove(index);
        link.mark_disconnected();
        Ok(())
    }
}

impl<A: Clone + Send + 'static> SignalBase for SignalInner<A> {
    fn id(&self) -> SignalId {
        self.id
    }

    fn arg_type(&self) -> TypeId {
        TypeId::of::<A>()
    }

    fn signature(&self) -> &'static str {
        any::type_name::<A>()
    }

    fn connect_base(self: Arc<Self>, slot: &Arc<dyn SlotBase>) -> ComResult<Connection> {
        self.connect_slot(slot)
    }

    fn disconnect_base(&self, slot: &dyn SlotBase) -> ComResult<()> {
        self.remove(slot.id())
    }

    fn connection_to(self: Arc<Self>, slot: SlotId) -> Option<Connection> {
        let link = self
            .connections
            .read()
            .iter()
            .find(|link| link.slot_id == slot && link.is_connected())
            .cloned()?;
        let signal: Weak<dyn SignalBase> = Arc::downgrade(&self) as Weak<dyn SignalBase>;
        Some(Connection::new(link, signal))
    }

    fn num_connections(&self) -> usize {
        self.connections
            .read()
            .iter()
            .filter(|link| link.is_connected())
            .count()
    }

    fn disconnect_all(&self) {
        for link in self.connections.write().drain(..) {
            link.mark_disconnected();
        }
    }

    fn prune_disconnected(&self) {
        self.connections.write().retain(|link| link.is_connected());
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl<A> std::fmt::Debug for Signal<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.inner.id)
            .field("args", &any::type_name::<A>())
            .field("connections", &self.inner.connections.read().len())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Worker;
    use parking_lot::Mutex;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_emit_runs_slots_in_connection_order() {
        let signal = Signal::<i32>::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let order = Arc::clone(&order);
            Slot::new(move |x: i32| order.lock().push(("first", x)))
        };
        let second = {
            let order = Arc::clone(&order);
            Slot::new(move |x: i32| order.lock().push(("second", x)))
        };

        signal.connect(&first).unwrap();
        signal.connect(&second).unwrap();
        signal.emit(3);

        assert_eq!(*order.lock(), vec![("first", 3), ("second", 3)]);
    }

    #[test]
    fn test_unit_slot_accepts_any_signal() {
        let signal = Signal::<(String, f64)>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let slot = {
            let hits = Arc::clone(&hits);
            Slot::new(move |_: ()| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };

        signal.connect(&slot).unwrap();
        signal.emit(("x".to_string(), 1.0));
        signal.emit(("y".to_string(), 2.0));

        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_incompatible_slot_is_rejected() {
        let signal = Signal::<i32>::new();
        let slot = Slot::new(|_: String| ());

        assert!(matches!(signal.connect(&slot), Err(ComError::BadSlot(_))));
        assert_eq!(signal.num_connections(), 0);
    }

    #[test]
    fn test_double_connect_is_rejected() {
        let signal = Signal::<i32>::new();
        let slot = Slot::new(|_: i32| ());

        signal.connect(&slot).unwrap();
        assert_eq!(signal.connect(&slot).err(), Some(ComError::AlreadyConnected));
        assert_eq!(signal.num_connections(), 1);
    }

    #[test]
    fn test_disconnect_unknown_slot_is_bad_slot() {
        let signal = Signal::<i32>::new();
        let slot = Slot::new(|_: i32| ());

        assert!(matches!(signal.disconnect(&slot), Err(ComError::BadSlot(_))));

        signal.connect(&slot).unwrap();
        signal.disconnect(&slot).unwrap();
        assert_eq!(signal.num_connections(), 0);
    }

    #[test]
    fn test_dropped_slot_is_disconnected() {
        let signal = Signal::<i32>::new();
        let kept = Slot::new(|_: i32| ());
        let dropped = Slot::new(|_: i32| ());

        signal.connect(&kept).unwrap();
        let connection = signal.connect(&dropped).unwrap();
        assert_eq!(signal.num_connections(), 2);

        drop(dropped);
        assert_eq!(signal.num_connections(), 1);
        assert!(!connection.is_connected());

        // Emitting after the drop is safe and prunes the dead link
        signal.emit(1);
        assert_eq!(signal.num_connections(), 1);
    }

    #[test]
    fn test_async_emit_returns_before_slot_runs() {
        let worker = Worker::spawn("signal-async").unwrap();
        let signal = Signal::<u32>::new();

        let (started_tx, started_rx) = mpsc::channel();
        let started_tx = Mutex::new(started_tx);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let (done_tx, done_rx) = mpsc::channel();
        let done_tx = Mutex::new(done_tx);

        let slot = Slot::with_worker(worker.clone(), move |value: u32| {
            let _ = started_tx.lock().send(());
            let _ = release_rx.lock().recv();
            let _ = done_tx.lock().send((value, thread::current().id()));
        });
        signal.connect(&slot).unwrap();

        signal.async_emit(9);
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(done_rx.try_recv().is_err());

        release_tx.send(()).unwrap();
        let (value, thread_id) = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(value, 9);
        assert_eq!(thread_id, worker.thread_id());

        drop(slot);
        worker.stop();
    }

    #[test]
    fn test_async_emit_skips_slot_without_worker() {
        let signal = Signal::<u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let slot = {
            let hits = Arc::clone(&hits);
            Slot::new(move |_: u32| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };

        signal.connect(&slot).unwrap();
        signal.async_emit(1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_erased_connect_round_trip() {
        let signal = Signal::<i32>::new();
        let slot = Slot::new(|_: i32| ());

        let base = signal.as_base();
        base.clone().connect_base(&slot.as_base()).unwrap();
        assert_eq!(base.num_connections(), 1);

        let typed = Signal::<i32>::from_base(base).unwrap();
        assert_eq!(typed.id(), signal.id());
        assert!(typed.connection(&slot).is_some());
    }
}
