//! Application services
//!
//! Concrete service implementations that orchestrate domain logic.
//! Services are concrete structs shared behind `Arc`, not traits.

mod reconciler;
mod store;

pub use reconciler::{BatchReport, IngestionReconciler, Reconciled, Skipped};
pub use store::{ExternalParent, ExternalUpsert, PrefixStore, UpsertAction};
