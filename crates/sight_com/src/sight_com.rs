//! Sight Com - Signal/slot communication layer
//!
//! This crate contains the communication primitives shared by data objects
//! and services:
//! - `Worker`: a named single-threaded task queue used for thread affinity
//! - `Slot`: a typed callable, optionally bound to a worker
//! - `Signal`: a typed emitter notifying connected slots
//! - `Connection` / `Blocker`: handles on a signal/slot pairing
//! - `Signals` / `Slots`: string-keyed maps used by `HasSignals` / `HasSlots`

mod connection;
mod error;
mod future;
mod has_signals;
mod has_slots;
mod signal;
mod slot;
mod worker;

pub use connection::*;
pub use error::*;
pub use future::*;
pub use has_signals::*;
pub use has_slots::*;
pub use signal::*;
pub use slot::*;
pub use worker::*;
