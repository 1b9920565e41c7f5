//! Proxy channels
//!
//! A channel is a named group of signals and slots: every signal of the
//! channel is connected to every slot of the channel. Endpoints can join or
//! leave at any time, which lets services connect to each other by name
//! without holding references to one another.
//!
//! Two channels may link the same signal to the same slot. They then share
//! one connection, released when the last channel lets go of it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use sight_com::{ComError, Connection, SignalBase, SignalId, SlotBase, SlotId};

use crate::{ServiceError, ServiceResult};

type LinkKey = (SignalId, SlotId);

#[derive(Default)]
struct Channel {
    signals: Vec<Arc<dyn SignalBase>>,
    slots: Vec<Arc<dyn SlotBase>>,
    /// Links owned by this channel, in creation order
    links: Vec<LinkKey>,
}

struct Link {
    connection: Connection,
    refs: usize,
}

#[derive(Default)]
struct ProxyState {
    channels: HashMap<String, Channel>,
    links: HashMap<LinkKey, Link>,
}

impl ProxyState {
    /// Connect `signal` to `slot` on behalf of `channel`. Returns whether the
    /// channel now holds a reference on the link.
    fn link(&mut self, channel: &str, signal: &Arc<dyn SignalBase>, slot: &Arc<dyn SlotBase>) -> bool {
        let key = (signal.id(), slot.id());
        if let Some(link) = self.links.get_mut(&key) {
            link.refs += 1;
            tracing::debug!(channel, signal = %key.0, slot = %key.1, refs = link.refs, "Sharing proxy link");
            return true;
        }

        match Arc::clone(signal).connect_base(slot) {
            Ok(connection) => {
                tracing::debug!(channel, signal = %key.0, slot = %key.1, "Proxy link connected");
                self.links.insert(key, Link { connection, refs: 1 });
                true
            }
            Err(e @ (ComError::BadSlot(_) | ComError::AlreadyConnected)) => {
                tracing::warn!(
                    channel,
                    signal = %key.0,
                    slot = %key.1,
                    signal_type = signal.signature(),
                    slot_type = slot.signature(),
                    error = %e,
                    "Cannot connect proxy endpoints"
                );
                false
            }
            Err(e) => {
                tracing::error!(channel, signal = %key.0, slot = %key.1, error = %e, "Proxy connection failed");
                false
            }
        }
    }

    fn release(&mut self, key: LinkKey) {
        let Some(link) = self.links.get_mut(&key) else {
            return;
        };
        link.refs -= 1;
        if link.refs == 0 {
            if let Some(link) = self.links.remove(&key) {
                link.connection.disconnect();
                tracing::debug!(signal = %key.0, slot = %key.1, "Proxy link disconnected");
            }
        }
    }
}

#[derive(Default)]
pub struct Proxy {
    state: Mutex<ProxyState>,
}

impl Proxy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a signal to a channel and connect it to the channel's slots
    pub fn connect_signal(&self, channel: &str, signal: Arc<dyn SignalBase>) {
        let mut state = self.state.lock();
        let mut entry = state.channels.remove(channel).unwrap_or_default();

        if entry.signals.iter().any(|s| s.id() == signal.id()) {
            tracing::warn!(channel, signal = %signal.id(), "Signal already in channel");
        } else {
            for slot in &entry.slots {
                if state.link(channel, &signal, slot) {
                    entry.links.push((signal.id(), slot.id()));
                }
            }
            entry.signals.push(signal);
        }

        state.channels.insert(channel.to_string(), entry);
    }

    /// Add a slot to a channel and connect the channel's signals to it
    pub fn connect_slot(&self, channel: &str, slot: Arc<dyn SlotBase>) {
        let mut state = self.state.lock();
        let mut entry = state.channels.remove(channel).unwrap_or_default();

        if entry.slots.iter().any(|s| s.id() == slot.id()) {
            tracing::warn!(channel, slot = %slot.id(), "Slot already in channel");
        } else {
            for signal in &entry.signals {
                if state.link(channel, signal, &slot) {
                    entry.links.push((signal.id(), slot.id()));
                }
            }
            entry.slots.push(slot);
        }

        state.channels.insert(channel.to_string(), entry);
    }

    pub fn disconnect_signal(&self, channel: &str, signal: SignalId) {
        self.disconnect_where(channel, |(sig, _)| *sig == signal);

        let mut state = self.state.lock();
        if let Some(entry) = state.channels.get_mut(channel) {
            entry.signals.retain(|s| s.id() != signal);
        }
        Self::drop_if_empty(&mut state, channel);
    }

    pub fn disconnect_slot(&self, channel: &str, slot: SlotId) {
        self.disconnect_where(channel, |(_, s)| *s == slot);

        let mut state = self.state.lock();
        if let Some(entry) = state.channels.get_mut(channel) {
            entry.slots.retain(|s| s.id() != slot);
        }
        Self::drop_if_empty(&mut state, channel);
    }

    /// Release every link of a channel, last created first, and forget it
    pub fn disconnect_channel(&self, channel: &str) {
        let mut state = self.state.lock();
        let Some(entry) = state.channels.remove(channel) else {
            return;
        };
        for key in entry.links.into_iter().rev() {
            state.release(key);
        }
        tracing::debug!(channel, "Proxy channel disconnected");
    }

    fn disconnect_where(&self, channel: &str, matches: impl Fn(&LinkKey) -> bool) {
        let mut state = self.state.lock();
        let Some(entry) = state.channels.get_mut(channel) else {
            return;
        };

        let (released, kept): (Vec<_>, Vec<_>) = entry.links.drain(..).partition(|key| matches(key));
        entry.links = kept;
        for key in released.into_iter().rev() {
            state.release(key);
        }
    }

    fn drop_if_empty(state: &mut ProxyState, channel: &str) {
        let empty = state
            .channels
            .get(channel)
            .is_some_and(|entry| entry.signals.is_empty() && entry.slots.is_empty());
        if empty {
            state.channels.remove(channel);
        }
    }

    /// Names of the live channels, sorted
    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.lock().channels.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of distinct signal/slot links held by all channels
    pub fn num_links(&self) -> usize {
        self.state.lock().links.len()
    }

    /// Number of links held by one channel
    pub fn num_channel_links(&self, channel: &str) -> usize {
        self.state
            .lock()
            .channels
            .get(channel)
            .map_or(0, |entry| entry.links.len())
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("channels", &self.channels())
            .field("links", &self.num_links())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Proxy connections
// ─────────────────────────────────────────────────────────────────────────────

/// Endpoints of one channel, referenced by `(owner uid, key)`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyConnections {
    pub channel: String,
    pub signals: Vec<(String, String)>,
    pub slots: Vec<(String, String)>,
}

impl ProxyConnections {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            ..Default::default()
        }
    }

    /// Connections on a freshly named channel
    pub fn anonymous() -> Self {
        Self::new(format!("channel-{}", uuid::Uuid::new_v4()))
    }

    pub fn add_signal(&mut self, uid: impl Into<String>, key: impl Into<String>) {
        self.signals.push((uid.into(), key.into()));
    }

    pub fn add_slot(&mut self, uid: impl Into<String>, key: impl Into<String>) {
        self.slots.push((uid.into(), key.into()));
    }

    /// Split `"uid/key"`
    pub fn parse_endpoint(endpoint: &str) -> ServiceResult<(String, String)> {
        match endpoint.split_once('/') {
            Some((uid, key)) if !uid.is_empty() && !key.is_empty() && !key.contains('/') => {
                Ok((uid.to_string(), key.to_string()))
            }
            _ => Err(ServiceError::Configuration(format!(
                "endpoint '{endpoint}' must read 'uid/key'"
            ))),
        }
    }

    /// Build from `"uid/key"` endpoint strings
    pub fn from_strings<S: AsRef<str>>(
        channel: impl Into<String>,
        signals: &[S],
        slots: &[S],
    ) -> ServiceResult<Self> {
        let mut connections = Self::new(channel);
        for endpoint in signals {
            let (uid, key) = Self::parse_endpoint(endpoint.as_ref())?;
            connections.add_signal(uid, key);
        }
        for endpoint in slots {
            let (uid, key) = Self::parse_endpoint(endpoint.as_ref())?;
            connections.add_slot(uid, key);
        }
        Ok(connections)
    }

    /// Only the endpoints owned by `uid`, on the same channel
    pub fn filter(&self, uid: &str) -> Self {
        Self {
            channel: self.channel.clone(),
            signals: self.signals.iter().filter(|(owner, _)| owner == uid).cloned().collect(),
            slots: self.slots.iter().filter(|(owner, _)| owner == uid).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty() && self.slots.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use sight_com::{Signal, Slot};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_slot(hits: &Arc<AtomicUsize>) -> Slot<u32> {
        let hits = Arc::clone(hits);
        Slot::new(move |_: u32| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_channel_connects_both_ways() {
        let proxy = Proxy::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let signal = Signal::<u32>::new();
        let slot = counting_slot(&hits);

        proxy.connect_slot("channel", slot.as_base());
        proxy.connect_signal("channel", signal.as_base());
        signal.emit(1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        proxy.disconnect_signal("channel", signal.id());
        signal.emit(2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(proxy.num_links(), 0);
    }

    #[test]
    fn test_shared_link_released_by_last_channel() {
        let proxy = Proxy::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let signal = Signal::<u32>::new();
        let slot = counting_slot(&hits);

        for channel in ["a", "b"] {
            proxy.connect_signal(channel, signal.as_base());
            proxy.connect_slot(channel, slot.as_base());
        }
        assert_eq!(proxy.num_links(), 1);
        assert_eq!(signal.num_connections(), 1);

        proxy.disconnect_channel("a");
        signal.emit(1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        proxy.disconnect_channel("b");
        assert_eq!(signal.num_connections(), 0);
        assert!(proxy.channels().is_empty());
    }

    #[test]
    fn test_mismatched_endpoints_are_skipped() {
        let proxy = Proxy::new();
        let signal = Signal::<String>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let slot = counting_slot(&hits);

        proxy.connect_signal("channel", signal.as_base());
        proxy.connect_slot("channel", slot.as_base());

        assert_eq!(proxy.num_channel_links("channel"), 0);
        assert_eq!(signal.num_connections(), 0);
    }

    #[test]
    fn test_parse_connections() {
        let connections = ProxyConnections::from_strings(
            "channel",
            &["reader/modified"],
            &["viewer/update", "printer/print"],
        )
        .unwrap();

        assert_eq!(connections.signals, vec![("reader".into(), "modified".into())]);
        assert_eq!(connections.filter("viewer").slots.len(), 1);
        assert!(connections.filter("nobody").is_empty());

        assert!(ProxyConnections::parse_endpoint("no-key").is_err());
        assert!(ProxyConnections::parse_endpoint("/key").is_err());
        assert!(ProxyConnections::anonymous().channel.starts_with("channel-"));
    }
}
