//! Cross-entity invariant checks for inserts and reparents.

use std::collections::HashMap;

use tracing::debug;

use crate::domain::address::Cidr;
use crate::domain::entities::{Origin, Prefix, PrefixId};
use crate::domain::error::{DomainError, DomainResult};
use crate::domain::index::HierarchyIndex;

/// Proposed placement of a prefix inside one routing domain.
#[derive(Debug, Clone, Copy)]
pub struct PrefixCandidate<'a> {
    pub domain_id: &'a str,
    pub cidr: Cidr,
    pub parent_id: Option<&'a str>,
    pub routable: bool,
    pub origin: &'a Origin,
    /// Id of the existing prefix when this is a reparent.
    pub reparenting: Option<&'a str>,
}

/// Validates candidates against one domain's entity table and index.
///
/// Checks run in a fixed order and stop at the first failure:
/// parent exists, containment, uniqueness, overlap, routability, origin scope,
/// cycles (reparent only). On success the candidate's depth is returned.
pub struct ContainmentValidator<'a> {
    prefixes: &'a HashMap<PrefixId, Prefix>,
    index: &'a HierarchyIndex,
}

impl<'a> ContainmentValidator<'a> {
    pub fn new(prefixes: &'a HashMap<PrefixId, Prefix>, index: &'a HierarchyIndex) -> Self {
        Self { prefixes, index }
    }

    pub fn validate(&self, candidate: &PrefixCandidate<'_>) -> DomainResult<u32> {
        let cidr = candidate.cidr;

        let parent = match candidate.parent_id {
            Some(pid) => Some(self.prefixes.get(pid).ok_or_else(|| DomainError::ParentNotFound {
                domain_id: candidate.domain_id.to_string(),
                parent_id: pid.to_string(),
            })?),
            None => None,
        };

        if let Some(p) = parent {
            if !p.cidr.contains(&cidr) {
                return Err(DomainError::NotContained {
                    cidr: cidr.to_string(),
                    parent_cidr: p.cidr.to_string(),
                });
            }
        }

        if let Some(existing) = self.index.lookup(&cidr) {
            if candidate.reparenting != Some(existing.as_str()) {
                return Err(DomainError::DuplicateCidr {
                    domain_id: candidate.domain_id.to_string(),
                    cidr: cidr.to_string(),
                });
            }
        }

        self.check_overlap(candidate)?;

        if let Some(p) = parent {
            if !p.routable && candidate.routable {
                return Err(DomainError::RoutableUnderNonRoutable {
                    cidr: cidr.to_string(),
                    parent_id: p.id.clone(),
                });
            }
            if p.child_scope && !candidate.origin.is_external() {
                return Err(DomainError::InconsistentOrigin {
                    prefix_id: p.id.clone(),
                    message: "children of an external-scope prefix must be externally sourced"
                        .to_string(),
                });
            }
        }

        if let (Some(me), Some(pid)) = (candidate.reparenting, candidate.parent_id) {
            if self.index.is_in_subtree(pid, me) {
                return Err(DomainError::CycleDetected {
                    prefix_id: me.to_string(),
                    parent_id: pid.to_string(),
                });
            }
        }

        let depth = parent.map_or(0, |p| p.depth + 1);
        debug!(%cidr, depth, "candidate accepted");
        Ok(depth)
    }

    /// Reject partial overlaps anywhere in the domain and any overlap with a
    /// would-be sibling. A moving prefix never conflicts with its own subtree.
    fn check_overlap(&self, candidate: &PrefixCandidate<'_>) -> DomainResult<()> {
        let cidr = candidate.cidr;
        let me = candidate.reparenting;

        let conflict = self
            .index
            .first_partial_overlap(&cidr, me)
            .or_else(|| {
                self.index.overlapping_sibling(candidate.parent_id, &cidr, |id| {
                    me.is_some_and(|m| self.index.is_in_subtree(id, m))
                })
            });

        match conflict {
            Some(existing_id) => {
                let existing_cidr = self
                    .index
                    .cidr_of(existing_id)
                    .map(|c| c.to_string())
                    .unwrap_or_default();
                Err(DomainError::OverlapWithSibling {
                    cidr: cidr.to_string(),
                    existing_id: existing_id.clone(),
                    existing_cidr,
                })
            }
            None => Ok(()),
        }
    }
}
