//! Domain entities: routing domains, prefixes and external allocations

use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::address::Cidr;
use crate::domain::error::{DomainError, DomainResult};

/// Prefix identifiers are plain strings (engineer-chosen, UUIDs or derived hashes).
pub type PrefixId = String;

/// Free-form key/value labels.
pub type Tags = BTreeMap<String, String>;

/// Isolated address-space namespace (VRF).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDomain {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub tags: Tags,
    pub routable: bool,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RoutingDomain {
    pub fn new(id: impl Into<String>, description: impl Into<String>, routable: bool) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            description: description.into(),
            tags: Tags::new(),
            routable,
            is_default: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_default(mut self, is_default: bool) -> Self {
        self.is_default = is_default;
        self
    }

    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }
}

/// Where a prefix came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Origin {
    /// Engineered by hand.
    Manual,
    /// Discovered in an external inventory (e.g. a cloud VPC).
    External { resource_id: String },
}

impl Origin {
    pub fn is_external(&self) -> bool {
        matches!(self, Origin::External { .. })
    }

    pub fn resource_id(&self) -> Option<&str> {
        match self {
            Origin::Manual => None,
            Origin::External { resource_id } => Some(resource_id),
        }
    }
}

/// A single CIDR allocation node in the hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prefix {
    pub id: PrefixId,
    pub domain_id: String,
    pub cidr: Cidr,
    #[serde(default)]
    pub tags: Tags,
    pub depth: u32,
    pub parent_id: Option<PrefixId>,
    pub origin: Origin,
    pub routable: bool,
    /// Immediate children are externally sourced subnets.
    pub child_scope: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Prefix {
    /// Set iff the origin is external.
    pub fn external_resource_id(&self) -> Option<&str> {
        self.origin.resource_id()
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Request to create a prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPrefix {
    /// Engineer-chosen id; a UUID is generated when absent.
    pub id: Option<PrefixId>,
    pub domain_id: String,
    pub cidr: Cidr,
    pub parent_id: Option<PrefixId>,
    pub routable: bool,
    pub origin: Origin,
    pub tags: Tags,
}

impl NewPrefix {
    /// Manual, routable prefix without tags.
    pub fn manual(domain_id: impl Into<String>, cidr: Cidr) -> Self {
        Self {
            id: None,
            domain_id: domain_id.into(),
            cidr,
            parent_id: None,
            routable: true,
            origin: Origin::Manual,
            tags: Tags::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_routable(mut self, routable: bool) -> Self {
        self.routable = routable;
        self
    }

    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }
}

/// Partial update of prefix metadata. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefixPatch {
    pub tags: Option<Tags>,
    pub routable: Option<bool>,
}

/// Partial update of routing domain metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainPatch {
    pub description: Option<String>,
    pub tags: Option<Tags>,
    pub routable: Option<bool>,
}

/// Umbrella CIDR reserved by an engineer for later subnet ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalAllocation {
    pub resource_id: String,
    pub reserved_cidr: Cidr,
    pub routable: bool,
    pub parent_prefix_id: PrefixId,
}

/// One subnet reported by the discovery feed. CIDR stays textual until ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredSubnet {
    pub resource_id: String,
    pub cidr: String,
    #[serde(default)]
    pub tags: Tags,
}

fn identifier_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:/-]*$").expect("valid identifier regex"))
}

/// Check that an id is usable as a domain, prefix or resource identifier.
pub fn validate_identifier(id: &str) -> DomainResult<()> {
    if identifier_regex().is_match(id) {
        Ok(())
    } else {
        Err(DomainError::InvalidIdentifier(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn given_valid_ids_when_validating_then_accepts() {
        for id in ["prod", "vpc-0a1b", "10.0.0.0/8", "ext-abc", "a:b"] {
            assert!(validate_identifier(id).is_ok(), "{id}");
        }
    }

    #[test]
    fn given_invalid_ids_when_validating_then_rejects() {
        for id in ["", "-lead", " space", "semi;colon"] {
            assert!(validate_identifier(id).is_err(), "{id}");
        }
    }

    #[test]
    fn given_external_origin_when_serializing_then_tagged() {
        let origin = Origin::External {
            resource_id: "vpc-1".into(),
        };
        let json = serde_json::to_value(&origin).unwrap();
        assert_eq!(json["kind"], "external");
        assert_eq!(json["resource_id"], "vpc-1");
        assert_eq!(origin.resource_id(), Some("vpc-1"));
        assert_eq!(Origin::Manual.resource_id(), None);
    }
}
