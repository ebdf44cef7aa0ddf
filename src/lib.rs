//! Hierarchical prefix allocation and containment engine.
//!
//! IP prefixes live in isolated routing domains (VRFs) and form a strict
//! containment tree per domain. Writes are validated and applied under a per-domain
//! lock; externally discovered subnets are reconciled idempotently against
//! engineer-reserved allocations; flat snapshots are materialized into forests.
//!
//! Layers:
//! - [`domain`]: address arithmetic, entities, containment index, validator, trees
//! - [`application`]: the concurrent [`PrefixStore`] and [`IngestionReconciler`]
//! - [`infrastructure`]: logging and service wiring
//! - [`config`]: layered [`Settings`]

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod util;

pub use application::services::{IngestionReconciler, PrefixStore};
pub use application::{ApplicationError, ApplicationResult};
pub use config::Settings;
pub use domain::{Cidr, DomainError, Forest, Prefix, RoutingDomain, TreeBuilder};
pub use infrastructure::ServiceContainer;
