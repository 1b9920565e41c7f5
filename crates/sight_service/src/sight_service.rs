//! Sight Service - Service lifecycle and application runtime
//!
//! This crate hosts services and wires them together:
//! - `Service` / `ServiceCell`: user hooks wrapped in the lifecycle state machine
//! - `ObjectServiceRegistry`: which services are bound to which objects
//! - `Proxy`: named channels connecting signals to slots by reference
//! - `AppConfig` / `AppConfigManager`: TOML application documents and their runtime
//! - `ApplicationContext`: the shared registries, factories and workers

mod app_config;
mod app_context;
mod app_manager;
mod config;
mod error;
mod factory;
mod proxy;
mod registry;
mod service;

pub use app_config::*;
pub use app_context::*;
pub use app_manager::*;
pub use config::*;
pub use error::*;
pub use factory::*;
pub use proxy::*;
pub use registry::*;
pub use service::*;
