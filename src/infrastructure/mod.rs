//! Infrastructure layer: logging and DI container
//!
//! This layer wires services together for embedding hosts.

pub mod di;
pub mod error;
pub mod logging;

pub use di::ServiceContainer;
pub use error::{InfraError, InfraResult};
pub use logging::init_logging;
