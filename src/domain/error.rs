//! Domain-level errors (no external dependencies)

use thiserror::Error;

/// Domain errors represent violations of the prefix hierarchy rules.
/// These are independent of locking and configuration concerns.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("parent prefix not found in domain {domain_id}: {parent_id}")]
    ParentNotFound { domain_id: String, parent_id: String },

    #[error("{cidr} is not contained in parent {parent_cidr}")]
    NotContained { cidr: String, parent_cidr: String },

    #[error("{cidr} already exists in domain {domain_id}")]
    DuplicateCidr { domain_id: String, cidr: String },

    #[error("{cidr} overlaps existing prefix {existing_cidr} ({existing_id})")]
    OverlapWithSibling {
        cidr: String,
        existing_id: String,
        existing_cidr: String,
    },

    #[error("routable prefix {cidr} cannot be placed under non-routable parent {parent_id}")]
    RoutableUnderNonRoutable { cidr: String, parent_id: String },

    #[error("cycle detected: {parent_id} is a descendant of {prefix_id}")]
    CycleDetected { prefix_id: String, parent_id: String },

    #[error("prefix {prefix_id} still has {count} children")]
    HasChildren { prefix_id: String, count: usize },

    #[error("no external allocation of {resource_id} covers {cidr}")]
    NoAllocationFound { resource_id: String, cidr: String },

    #[error("inconsistent origin for {prefix_id}: {message}")]
    InconsistentOrigin { prefix_id: String, message: String },

    #[error("prefix not found: {0}")]
    PrefixNotFound(String),

    #[error("prefix id already in use: {0}")]
    DuplicatePrefixId(String),

    #[error("routing domain not found: {0}")]
    DomainNotFound(String),

    #[error("routing domain already exists: {0}")]
    DomainExists(String),

    #[error("routing domain {domain_id} still holds {count} prefixes")]
    DomainInUse { domain_id: String, count: usize },

    #[error("default domain conflict: {message}")]
    DefaultDomainConflict { message: String },

    #[error("allocation {reserved_cidr} already reserved for {resource_id}")]
    DuplicateAllocation {
        resource_id: String,
        reserved_cidr: String,
    },

    #[error("allocation {reserved_cidr} not found for {resource_id}")]
    AllocationNotFound {
        resource_id: String,
        reserved_cidr: String,
    },

    #[error("prefix {prefix_id} is the parent of {count} external allocations")]
    AllocationInUse { prefix_id: String, count: usize },

    #[error("invalid CIDR {input}: {reason}")]
    InvalidCidr { input: String, reason: String },

    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("index inconsistency: {0}")]
    Inconsistent(String),
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
