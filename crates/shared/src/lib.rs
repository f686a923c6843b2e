//! Shared types for beacon clients and any server speaking the same frames.

pub mod error;
pub mod models;
pub mod protocol;

pub use error::*;
pub use models::*;
pub use protocol::*;
