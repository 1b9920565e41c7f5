//! Sight - Signal/slot service runtime
//!
//! This crate provides the `sight` launcher and a set of demonstration
//! services:
//! - Built-in services and their registration via `modules`
//! - Host settings (logging) via `settings`
//!
//! The runtime itself lives in `sight_com`, `sight_data` and `sight_service`.

// Re-export core crates
pub use sight_com;
pub use sight_data;
pub use sight_service;

// Built-in services
pub mod modules;

// Host settings
pub mod settings;
