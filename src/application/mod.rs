//! Application layer: services and use cases
//!
//! This layer owns locking and orchestrates the domain rules into transactional writes.

pub mod error;
pub mod hash;
pub mod services;

pub use error::{ApplicationError, ApplicationResult};
