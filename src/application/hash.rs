//! Deterministic identifiers for externally sourced prefixes
//!
//! Repeated ingestion of the same subnet must always address the same row, so the
//! id is a pure function of the resource id and the canonical CIDR text.

use sha2::{Digest, Sha256};

use crate::domain::Cidr;

/// Prefix put in front of every derived id.
pub const EXTERNAL_ID_PREFIX: &str = "ext-";

/// Compute 32-character hex hash of content (first 128 bits of SHA-256).
pub fn content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let result = hasher.finalize();
    hex::encode(&result[..16])
}

/// Id of the prefix created for `cidr` discovered in `resource_id`.
///
/// # Examples
/// ```
/// use vrf_ipam::application::hash::external_prefix_id;
///
/// let cidr = "10.0.1.0/24".parse().unwrap();
/// let id = external_prefix_id("vpc-1", &cidr);
/// assert!(id.starts_with("ext-"));
/// assert_eq!(id, external_prefix_id("vpc-1", &cidr));
/// ```
pub fn external_prefix_id(resource_id: &str, cidr: &Cidr) -> String {
    let mut content = Vec::with_capacity(resource_id.len() + 20);
    content.extend_from_slice(resource_id.as_bytes());
    // separator keeps ("ab", "c...") and ("a", "bc...") apart
    content.push(0);
    content.extend_from_slice(cidr.to_string().as_bytes());
    format!("{EXTERNAL_ID_PREFIX}{}", content_hash(&content))
}
