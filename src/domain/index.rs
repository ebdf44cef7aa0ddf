//! Per-domain containment index.
//!
//! Entries are ordered by `(family, start asc, end desc)`, so a supernet always sorts
//! before the prefixes it contains. Together with the parent links kept per entry this
//! answers longest-prefix-match in O(log n + W), where W is the address width: a
//! predecessor lookup followed by a walk up the parent chain, whose length is bounded
//! by the number of distinct mask lengths.
//!
//! The index trusts its caller (the validator) to keep the stored set a proper tree:
//! every two entries are either nested or disjoint, and the containers of an entry are
//! exactly its ancestors.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound::{Excluded, Unbounded};

use tracing::{error, instrument, trace};

use crate::domain::address::{Cidr, Family};
use crate::domain::entities::PrefixId;
use crate::domain::error::{DomainError, DomainResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct RangeKey {
    family: Family,
    start: u128,
    end: u128,
}

impl RangeKey {
    /// Key of the single-address range `[addr, addr]`: sorts after every range
    /// starting at `addr`.
    fn point(family: Family, addr: u128) -> Self {
        Self {
            family,
            start: addr,
            end: addr,
        }
    }
}

impl From<&Cidr> for RangeKey {
    fn from(c: &Cidr) -> Self {
        Self {
            family: c.family(),
            start: c.start(),
            end: c.end(),
        }
    }
}

impl Ord for RangeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.family
            .cmp(&other.family)
            .then(self.start.cmp(&other.start))
            .then(other.end.cmp(&self.end))
    }
}

impl PartialOrd for RangeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
struct IndexEntry {
    cidr: Cidr,
    parent: Option<PrefixId>,
    children: BTreeMap<RangeKey, PrefixId>,
}

/// Containment index for one routing domain.
#[derive(Debug, Clone, Default)]
pub struct HierarchyIndex {
    ordered: BTreeMap<RangeKey, PrefixId>,
    entries: HashMap<PrefixId, IndexEntry>,
    roots: BTreeMap<RangeKey, PrefixId>,
}

impl HierarchyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Exact lookup of a stored range.
    pub fn lookup(&self, cidr: &Cidr) -> Option<&PrefixId> {
        self.ordered.get(&RangeKey::from(cidr))
    }

    pub fn cidr_of(&self, id: &str) -> Option<Cidr> {
        self.entries.get(id).map(|e| e.cidr)
    }

    pub fn parent_of(&self, id: &str) -> Option<&PrefixId> {
        self.entries.get(id).and_then(|e| e.parent.as_ref())
    }

    /// Add an already validated entry.
    #[instrument(level = "trace", skip(self))]
    pub fn insert(&mut self, id: &str, cidr: Cidr, parent: Option<&str>) -> DomainResult<()> {
        let key = RangeKey::from(&cidr);
        if let Some(existing) = self.ordered.get(&key) {
            error!(%cidr, existing = %existing, "equal ranges in one domain");
            return Err(DomainError::Inconsistent(format!(
                "{cidr} already indexed as {existing}"
            )));
        }
        if self.entries.contains_key(id) {
            return Err(DomainError::Inconsistent(format!("{id} already indexed")));
        }
        match parent {
            Some(pid) => {
                let parent_entry = self.entries.get_mut(pid).ok_or_else(|| {
                    DomainError::Inconsistent(format!("parent {pid} of {id} not indexed"))
                })?;
                parent_entry.children.insert(key, id.to_string());
            }
            None => {
                self.roots.insert(key, id.to_string());
            }
        }
        self.ordered.insert(key, id.to_string());
        self.entries.insert(
            id.to_string(),
            IndexEntry {
                cidr,
                parent: parent.map(str::to_string),
                children: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// Remove a leaf entry.
    #[instrument(level = "trace", skip(self))]
    pub fn remove(&mut self, id: &str) -> DomainResult<Cidr> {
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| DomainError::PrefixNotFound(id.to_string()))?;
        if !entry.children.is_empty() {
            return Err(DomainError::HasChildren {
                prefix_id: id.to_string(),
                count: entry.children.len(),
            });
        }
        let key = RangeKey::from(&entry.cidr);
        let parent = entry.parent.clone();
        let cidr = entry.cidr;
        self.detach(&key, parent.as_deref());
        self.ordered.remove(&key);
        self.entries.remove(id);
        Ok(cidr)
    }

    /// Move an entry (with its subtree) under a new parent.
    #[instrument(level = "trace", skip(self))]
    pub fn set_parent(&mut self, id: &str, new_parent: Option<&str>) -> DomainResult<()> {
        if let Some(pid) = new_parent {
            if !self.entries.contains_key(pid) {
                return Err(DomainError::Inconsistent(format!("parent {pid} not indexed")));
            }
        }
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| DomainError::PrefixNotFound(id.to_string()))?;
        let key = RangeKey::from(&entry.cidr);
        let old_parent = std::mem::replace(&mut entry.parent, new_parent.map(str::to_string));
        self.detach(&key, old_parent.as_deref());
        match new_parent {
            Some(pid) => {
                if let Some(p) = self.entries.get_mut(pid) {
                    p.children.insert(key, id.to_string());
                }
            }
            None => {
                self.roots.insert(key, id.to_string());
            }
        }
        Ok(())
    }

    fn detach(&mut self, key: &RangeKey, parent: Option<&str>) {
        match parent {
            Some(pid) => {
                if let Some(p) = self.entries.get_mut(pid) {
                    p.children.remove(key);
                }
            }
            None => {
                self.roots.remove(key);
            }
        }
    }

    /// Direct children, ordered by cidr ascending.
    pub fn children<'a>(&'a self, id: &str) -> impl Iterator<Item = &'a PrefixId> + 'a {
        self.entries
            .get(id)
            .into_iter()
            .flat_map(|e| e.children.values())
    }

    pub fn child_count(&self, id: &str) -> usize {
        self.entries.get(id).map(|e| e.children.len()).unwrap_or(0)
    }

    /// Root entries, ordered by cidr ascending.
    pub fn roots(&self) -> impl Iterator<Item = &PrefixId> {
        self.roots.values()
    }

    /// Ancestors of `id`, nearest first.
    pub fn ancestors<'a>(&'a self, id: &str) -> impl Iterator<Item = &'a PrefixId> + 'a {
        let mut current = self.parent_of(id);
        std::iter::from_fn(move || {
            let next = current?;
            current = self.parent_of(next);
            Some(next)
        })
    }

    /// Is `node` equal to `root` or somewhere below it?
    pub fn is_in_subtree(&self, node: &str, root: &str) -> bool {
        node == root || self.ancestors(node).any(|a| a == root)
    }

    /// All descendants of `id` in pre-order (not including `id`).
    pub fn descendants(&self, id: &str) -> Vec<PrefixId> {
        let mut out = Vec::new();
        let mut stack: Vec<&PrefixId> = self.children(id).collect();
        stack.reverse();
        while let Some(current) = stack.pop() {
            out.push(current.clone());
            let mut kids: Vec<&PrefixId> = self.children(current).collect();
            kids.reverse();
            stack.extend(kids);
        }
        out
    }

    /// Most specific stored prefix containing `cidr` (an exact match counts).
    #[instrument(level = "trace", skip(self))]
    pub fn longest_match(&self, cidr: &Cidr) -> Option<&PrefixId> {
        let key = RangeKey::from(cidr);
        let pred = self.ordered.range(..=key).next_back().map(|(_, id)| id);
        self.first_container(pred, cidr)
    }

    /// Most specific stored prefix strictly containing `cidr`.
    pub fn strict_container(&self, cidr: &Cidr) -> Option<&PrefixId> {
        let key = RangeKey::from(cidr);
        let pred = self.ordered.range(..key).next_back().map(|(_, id)| id);
        self.first_container(pred, cidr)
    }

    /// Walk up from the predecessor entry until an entry contains `target`.
    fn first_container<'a>(&'a self, start: Option<&'a PrefixId>, target: &Cidr) -> Option<&'a PrefixId> {
        let mut current = start;
        while let Some(id) = current {
            let entry = self.entries.get(id)?;
            if entry.cidr.contains(target) {
                trace!(%target, matched = %entry.cidr, "container found");
                return Some(id);
            }
            current = entry.parent.as_ref();
        }
        None
    }

    /// Stored entries containing the single address `addr`, most specific first.
    fn point_containers(&self, family: Family, addr: u128) -> Vec<(&PrefixId, Cidr)> {
        let key = RangeKey::point(family, addr);
        let mut out = Vec::new();
        let mut current = self.ordered.range(..=key).next_back().map(|(_, id)| id);
        while let Some(id) = current {
            let Some(entry) = self.entries.get(id) else {
                break;
            };
            if entry.cidr.family() == family && entry.cidr.start() <= addr && addr <= entry.cidr.end() {
                out.push((id, entry.cidr));
            }
            current = entry.parent.as_ref();
        }
        out
    }

    /// Does `cidr` partially overlap (overlap without containment either way) any
    /// stored prefix other than `excluding`?
    pub fn overlaps_any(&self, cidr: &Cidr, excluding: Option<&str>) -> bool {
        self.first_partial_overlap(cidr, excluding).is_some()
    }

    /// First stored prefix that partially overlaps `cidr`.
    pub fn first_partial_overlap(&self, cidr: &Cidr, excluding: Option<&str>) -> Option<&PrefixId> {
        let family = cidr.family();
        let skip = |id: &PrefixId| excluding.is_some_and(|x| x == id);

        // Entries holding the left edge but ending inside the range.
        for (id, c) in self.point_containers(family, cidr.start()) {
            if c.end() >= cidr.end() {
                break;
            }
            if c.start() < cidr.start() && !skip(id) {
                return Some(id);
            }
        }
        // Entries holding the right edge but starting inside the range.
        for (id, c) in self.point_containers(family, cidr.end()) {
            if c.start() <= cidr.start() {
                break;
            }
            if c.end() > cidr.end() && !skip(id) {
                return Some(id);
            }
        }
        None
    }

    /// First prefix among the children of `parent` (roots when `None`) that overlaps
    /// `cidr`, ignoring ids for which `skip` returns true.
    ///
    /// Siblings are pairwise disjoint, so only the nearest neighbour on each side
    /// needs checking.
    pub fn overlapping_sibling<F>(&self, parent: Option<&str>, cidr: &Cidr, skip: F) -> Option<&PrefixId>
    where
        F: Fn(&PrefixId) -> bool,
    {
        let siblings = match parent {
            Some(pid) => &self.entries.get(pid)?.children,
            None => &self.roots,
        };
        let key = RangeKey::from(cidr);

        let before = siblings.range(..=key).rev().find(|(_, id)| !skip(id));
        if let Some((k, id)) = before {
            if k.family == key.family && k.end >= key.start {
                return Some(id);
            }
        }
        let after = siblings
            .range((Excluded(key), Unbounded))
            .find(|(_, id)| !skip(id));
        if let Some((k, id)) = after {
            if k.family == key.family && k.start <= key.end {
                return Some(id);
            }
        }
        None
    }
}
