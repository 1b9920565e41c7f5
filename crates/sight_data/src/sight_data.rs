//! Sight Data - Data objects shared between services
//!
//! - `Object`: a uid, a typed payload behind a read/write lock and a
//!   `modified` signal
//! - `Data`: the payload trait, with a few built-in payload types
//! - `DataFactory`: creates objects from a type name and a config value

mod error;
mod factory;
mod object;
mod types;

pub use error::*;
pub use factory::*;
pub use object::*;
pub use types::*;
