//! Connection handles
//!
//! A `Connection` outlives neither the signal nor the slot: once either side
//! is gone it simply reports itself as disconnected.

use std::sync::{Arc, Weak};

use crate::{ComError, ComResult, SignalBase, SignalId, SlotId, Slots, Signals};
use crate::signal::SlotConnection;

// ─────────────────────────────────────────────────────────────────────────────
// Connection
// ─────────────────────────────────────────────────────────────────────────────

/// Handle on one signal → slot link. The default value is an empty handle.
#[derive(Clone, Default)]
pub struct Connection {
    link: Option<Arc<SlotConnection>>,
    signal: Option<Weak<dyn SignalBase>>,
}

impl Connection {
    pub(crate) fn new(link: Arc<SlotConnection>, signal: Weak<dyn SignalBase>) -> Self {
        Self {
            link: Some(link),
            signal: Some(signal),
        }
    }

    /// Remove the link from its signal. Calling it again is a no-op, even
    /// once the same slot has been connected anew.
    pub fn disconnect(&self) {
        let Some(link) = &self.link else {
            return;
        };
        if !link.is_connected() {
            return;
        }
        link.mark_disconnected();

        if let Some(signal) = self.signal.as_ref().and_then(Weak::upgrade) {
            signal.prune_disconnected();
        }
    }

    /// Whether the link is live: not disconnected, signal and slot alive
    pub fn is_connected(&self) -> bool {
        let signal_alive = self
            .signal
            .as_ref()
            .is_some_and(|signal| signal.strong_count() > 0);

        signal_alive && self.link.as_ref().is_some_and(|link| link.is_connected())
    }

    /// Suspend delivery. Blocks nest: each `block()` needs an `unblock()`.
    pub fn block(&self) {
        if let Some(link) = &self.link {
            link.block();
        }
    }

    pub fn unblock(&self) {
        if let Some(link) = &self.link {
            link.unblock();
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.link.as_ref().is_some_and(|link| link.is_blocked())
    }

    /// Block until the returned guard is dropped or reset
    pub fn blocker(&self) -> Blocker {
        Blocker::new(self)
    }

    pub fn slot_id(&self) -> Option<SlotId> {
        self.link.as_ref().map(|link| link.slot_id())
    }

    pub fn signal_id(&self) -> Option<SignalId> {
        self.signal
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|signal| signal.id())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("slot", &self.slot_id())
            .field("signal", &self.signal_id())
            .field("connected", &self.is_connected())
            .field("blocked", &self.is_blocked())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Blocker
// ─────────────────────────────────────────────────────────────────────────────

/// Scoped block on a connection
#[derive(Debug)]
pub struct Blocker {
    connection: Option<Connection>,
}

impl Blocker {
    pub fn new(connection: &Connection) -> Self {
        connection.block();
        Self {
            connection: Some(connection.clone()),
        }
    }

    /// Release the block early. Dropping afterwards does nothing.
    pub fn reset(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.unblock();
        }
    }

    pub fn is_active(&self) -> bool {
        self.connection.is_some()
    }
}

impl Drop for Blocker {
    fn drop(&mut self) {
        self.reset();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connections
// ─────────────────────────────────────────────────────────────────────────────

/// Set of connections disconnected together, in reverse creation order
#[derive(Debug, Default)]
pub struct Connections {
    connections: Vec<Connection>,
}

impl Connections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect `signals[signal_key]` to `slots[slot_key]` and keep the handle
    pub fn connect(
        &mut self,
        signals: &Signals,
        signal_key: &str,
        slots: &Slots,
        slot_key: &str,
    ) -> ComResult<()> {
        let signal = signals
            .get_base(signal_key)
            .ok_or_else(|| ComError::BadSlot(format!("no signal '{signal_key}'")))?;
        let slot = slots
            .get_base(slot_key)
            .ok_or_else(|| ComError::BadSlot(format!("no slot '{slot_key}'")))?;

        let connection = signal.connect_base(&slot)?;
        self.connections.push(connection);
        Ok(())
    }

    pub fn add(&mut self, connection: Connection) {
        self.connections.push(connection);
    }

    pub fn disconnect(&mut self) {
        while let Some(connection) = self.connections.pop() {
            connection.disconnect();
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
