//! Authoritative prefix table with a per-domain transactional write path
//!
//! Every routing domain owns one `RwLock` guarding its entity table together with its
//! [`HierarchyIndex`]. Writers validate and apply while holding that lock, so other
//! writers of the same domain are serialized and readers only ever observe complete
//! writes. A write that fails leaves both the table and the index untouched.
//!
//! Lock order: domain registry, domain shards (ascending id), prefix locator,
//! allocation table.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::application::{ApplicationError, ApplicationResult};
use crate::config::Settings;
use crate::domain::{
    validate_identifier, Cidr, ContainmentValidator, DomainError, DomainPatch, DomainResult,
    ExternalAllocation, HierarchyIndex, NewPrefix, Origin, Prefix, PrefixCandidate, PrefixId,
    PrefixPatch, RoutingDomain, Tags,
};

/// Outcome of an idempotent external upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertAction {
    Created,
    Updated,
    Unchanged,
}

/// Where an externally sourced prefix hangs in its target domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalParent {
    /// Fixed parent, typically the parent of the matching allocation
    Prefix(PrefixId),
    /// Root of the target domain
    Root,
}

/// Request to create or refresh an externally sourced prefix.
#[derive(Debug, Clone)]
pub struct ExternalUpsert {
    pub id: PrefixId,
    pub resource_id: String,
    pub cidr: Cidr,
    pub domain_id: String,
    pub parent: ExternalParent,
    pub routable: bool,
    pub tags: Tags,
}

impl ExternalUpsert {
    fn parent_id(&self) -> Option<PrefixId> {
        match &self.parent {
            ExternalParent::Prefix(pid) => Some(pid.clone()),
            ExternalParent::Root => None,
        }
    }
}

#[derive(Debug, Default)]
struct DomainState {
    prefixes: HashMap<PrefixId, Prefix>,
    index: HierarchyIndex,
    /// Set when the domain was deleted while a writer waited for the lock
    retired: bool,
}

impl DomainState {
    fn validate(&self, candidate: &PrefixCandidate<'_>) -> DomainResult<u32> {
        ContainmentValidator::new(&self.prefixes, &self.index).validate(candidate)
    }

    fn get(&self, id: &str) -> DomainResult<&Prefix> {
        self.prefixes
            .get(id)
            .ok_or_else(|| DomainError::PrefixNotFound(id.to_string()))
    }

    /// Index first: if it refuses, the table is not touched.
    fn attach(&mut self, prefix: Prefix) -> DomainResult<()> {
        self.index
            .insert(&prefix.id, prefix.cidr, prefix.parent_id.as_deref())?;
        self.prefixes.insert(prefix.id.clone(), prefix);
        Ok(())
    }

    fn detach(&mut self, id: &str) -> DomainResult<Prefix> {
        self.index.remove(id)?;
        self.prefixes
            .remove(id)
            .ok_or_else(|| DomainError::Inconsistent(format!("{id} indexed but not stored")))
    }

    /// Roll back an attach. Returns false if `id` could not be removed again.
    fn undo_attach(&mut self, id: &str, domain_id: &str) -> bool {
        match self.detach(id) {
            Ok(_) => true,
            Err(rollback) => {
                error!(id, domain_id, %rollback, "rollback of attach failed, shard left inconsistent");
                false
            }
        }
    }

    /// Recompute depths below `id` after a move. Pre-order visits parents first.
    fn refresh_depths(&mut self, id: &str) {
        for d in self.index.descendants(id) {
            let parent_depth = self
                .index
                .parent_of(&d)
                .and_then(|p| self.prefixes.get(p))
                .map(|p| p.depth);
            if let (Some(depth), Some(node)) = (parent_depth, self.prefixes.get_mut(&d)) {
                node.depth = depth + 1;
            }
        }
    }

    /// Mark every descendant of `id` non-routable. Returns how many changed.
    fn cascade_non_routable(&mut self, id: &str) -> usize {
        let now = Utc::now();
        let mut changed = 0;
        for d in self.index.descendants(id) {
            if let Some(node) = self.prefixes.get_mut(&d) {
                if node.routable {
                    node.routable = false;
                    node.updated_at = now;
                    changed += 1;
                }
            }
        }
        changed
    }

    fn sorted(&self) -> Vec<Prefix> {
        let mut out: Vec<Prefix> = self.prefixes.values().cloned().collect();
        out.sort_by(|a, b| a.cidr.cmp(&b.cidr));
        out
    }
}

#[derive(Debug)]
struct DomainSlot {
    meta: RoutingDomain,
    shard: Arc<RwLock<DomainState>>,
}

/// Concurrent store of routing domains, prefixes and external allocations.
#[derive(Debug)]
pub struct PrefixStore {
    settings: Arc<Settings>,
    domains: RwLock<BTreeMap<String, DomainSlot>>,
    /// prefix id -> domain id
    locator: RwLock<HashMap<PrefixId, String>>,
    /// resource id -> reserved umbrella ranges
    allocations: RwLock<BTreeMap<String, Vec<ExternalAllocation>>>,
}

impl PrefixStore {
    /// Create a store holding only the configured default domain.
    pub fn new(settings: Arc<Settings>) -> Self {
        let default = RoutingDomain::new(
            settings.default_domain.id.clone(),
            settings.default_domain.description.clone(),
            true,
        )
        .with_default(true);
        let mut domains = BTreeMap::new();
        domains.insert(
            default.id.clone(),
            DomainSlot {
                meta: default,
                shard: Arc::new(RwLock::new(DomainState::default())),
            },
        );
        debug!(default_domain = %settings.default_domain.id, "prefix store bootstrapped");
        Self {
            settings,
            domains: RwLock::new(domains),
            locator: RwLock::new(HashMap::new()),
            allocations: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn shard(&self, domain_id: &str) -> ApplicationResult<Arc<RwLock<DomainState>>> {
        self.domains
            .read()
            .get(domain_id)
            .map(|slot| Arc::clone(&slot.shard))
            .ok_or_else(|| DomainError::DomainNotFound(domain_id.to_string()).into())
    }

    fn write_shard<'a>(
        &self,
        domain_id: &str,
        shard: &'a RwLock<DomainState>,
    ) -> ApplicationResult<RwLockWriteGuard<'a, DomainState>> {
        let guard = shard
            .try_write_for(self.settings.lock_timeout())
            .ok_or_else(|| {
                warn!(domain_id, "timed out waiting for domain write lock");
                ApplicationError::Contention {
                    domain_id: domain_id.to_string(),
                }
            })?;
        if guard.retired {
            return Err(DomainError::DomainNotFound(domain_id.to_string()).into());
        }
        Ok(guard)
    }

    fn read_shard<'a>(
        &self,
        domain_id: &str,
        shard: &'a RwLock<DomainState>,
    ) -> ApplicationResult<RwLockReadGuard<'a, DomainState>> {
        let guard = shard
            .try_read_for(self.settings.lock_timeout())
            .ok_or_else(|| {
                warn!(domain_id, "timed out waiting for domain read lock");
                ApplicationError::Contention {
                    domain_id: domain_id.to_string(),
                }
            })?;
        if guard.retired {
            return Err(DomainError::DomainNotFound(domain_id.to_string()).into());
        }
        Ok(guard)
    }

    /// Domain currently holding prefix `id`.
    pub fn domain_of(&self, id: &str) -> ApplicationResult<String> {
        self.locator
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| DomainError::PrefixNotFound(id.to_string()).into())
    }

    /// Run `f` against a consistent view of one domain while holding its read lock.
    pub fn read_domain<R>(
        &self,
        domain_id: &str,
        f: impl FnOnce(&HierarchyIndex, &HashMap<PrefixId, Prefix>) -> R,
    ) -> ApplicationResult<R> {
        let shard = self.shard(domain_id)?;
        let state = self.read_shard(domain_id, &shard)?;
        Ok(f(&state.index, &state.prefixes))
    }

    /// Validate and persist a new prefix.
    #[instrument(level = "debug", skip(self, new), fields(domain = %new.domain_id, cidr = %new.cidr))]
    pub fn insert(&self, new: NewPrefix) -> ApplicationResult<Prefix> {
        if let Some(id) = &new.id {
            validate_identifier(id)?;
        }
        if let Origin::External { resource_id } = &new.origin {
            validate_identifier(resource_id)?;
        }
        let id = new.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());

        let shard = self.shard(&new.domain_id)?;
        let mut state = self.write_shard(&new.domain_id, &shard)?;
        let prefix = self.create_locked(&mut state, id, new)?;
        info!(id = %prefix.id, depth = prefix.depth, "prefix inserted");
        Ok(prefix)
    }

    /// Validation and persistence of a new prefix; caller holds the domain write lock.
    fn create_locked(
        &self,
        state: &mut DomainState,
        id: PrefixId,
        new: NewPrefix,
    ) -> ApplicationResult<Prefix> {
        let depth = state.validate(&PrefixCandidate {
            domain_id: &new.domain_id,
            cidr: new.cidr,
            parent_id: new.parent_id.as_deref(),
            routable: new.routable,
            origin: &new.origin,
            reparenting: None,
        })?;

        let mut locator = self.locator.write();
        if locator.contains_key(&id) {
            return Err(DomainError::DuplicatePrefixId(id).into());
        }

        let now = Utc::now();
        let prefix = Prefix {
            id: id.clone(),
            domain_id: new.domain_id,
            cidr: new.cidr,
            tags: new.tags,
            depth,
            parent_id: new.parent_id,
            origin: new.origin,
            routable: new.routable,
            child_scope: false,
            created_at: now,
            updated_at: now,
        };
        state.attach(prefix.clone())?;
        locator.insert(id, prefix.domain_id.clone());
        Ok(prefix)
    }

    /// Move a prefix (with its subtree) under `new_parent` in the same domain.
    #[instrument(level = "debug", skip(self))]
    pub fn reparent(&self, id: &str, new_parent: Option<&str>) -> ApplicationResult<Prefix> {
        let domain_id = self.domain_of(id)?;
        let shard = self.shard(&domain_id)?;
        let mut state = self.write_shard(&domain_id, &shard)?;

        let current = state.get(id)?.clone();
        let depth = state.validate(&PrefixCandidate {
            domain_id: &domain_id,
            cidr: current.cidr,
            parent_id: new_parent,
            routable: current.routable,
            origin: &current.origin,
            reparenting: Some(id),
        })?;

        if current.parent_id.as_deref() == new_parent {
            debug!(id, "parent unchanged");
            return Ok(current);
        }

        state.index.set_parent(id, new_parent)?;
        let updated = {
            let node = state
                .prefixes
                .get_mut(id)
                .ok_or_else(|| DomainError::PrefixNotFound(id.to_string()))?;
            node.parent_id = new_parent.map(str::to_string);
            node.depth = depth;
            node.updated_at = Utc::now();
            node.clone()
        };
        state.refresh_depths(id);
        info!(id, parent = ?new_parent, depth, "prefix reparented");
        Ok(updated)
    }

    /// Remove a leaf prefix. Returns the removed entity.
    #[instrument(level = "debug", skip(self))]
    pub fn delete(&self, id: &str) -> ApplicationResult<Prefix> {
        let domain_id = self.domain_of(id)?;
        let shard = self.shard(&domain_id)?;
        let mut state = self.write_shard(&domain_id, &shard)?;

        state.get(id)?;
        let count = state.index.child_count(id);
        if count > 0 {
            return Err(DomainError::HasChildren {
                prefix_id: id.to_string(),
                count,
            }
            .into());
        }

        let mut locator = self.locator.write();
        {
            let allocations = self.allocations.read();
            let count = allocations
                .values()
                .flatten()
                .filter(|a| a.parent_prefix_id == id)
                .count();
            if count > 0 {
                return Err(DomainError::AllocationInUse {
                    prefix_id: id.to_string(),
                    count,
                }
                .into());
            }
        }

        let removed = state.detach(id)?;
        locator.remove(id);
        info!(id, cidr = %removed.cidr, "prefix deleted");
        Ok(removed)
    }

    /// Replace tags and/or change routability. Turning a prefix non-routable
    /// cascades to its whole subtree.
    #[instrument(level = "debug", skip(self, patch))]
    pub fn update(&self, id: &str, patch: PrefixPatch) -> ApplicationResult<Prefix> {
        let domain_id = self.domain_of(id)?;
        let shard = self.shard(&domain_id)?;
        let mut state = self.write_shard(&domain_id, &shard)?;

        let current = state.get(id)?.clone();
        if patch.routable == Some(true) && !current.routable {
            if let Some(parent) = current.parent_id.as_deref().map(|p| state.get(p)).transpose()? {
                if !parent.routable {
                    return Err(DomainError::RoutableUnderNonRoutable {
                        cidr: current.cidr.to_string(),
                        parent_id: parent.id.clone(),
                    }
                    .into());
                }
            }
        }

        let updated = {
            let node = state
                .prefixes
                .get_mut(id)
                .ok_or_else(|| DomainError::PrefixNotFound(id.to_string()))?;
            if let Some(tags) = patch.tags {
                node.tags = tags;
            }
            if let Some(routable) = patch.routable {
                node.routable = routable;
            }
            node.updated_at = Utc::now();
            node.clone()
        };
        if patch.routable == Some(false) {
            let cascaded = state.cascade_non_routable(id);
            debug!(id, cascaded, "routability cascaded");
        }
        info!(id, routable = updated.routable, "prefix updated");
        Ok(updated)
    }

    pub fn get(&self, id: &str) -> ApplicationResult<Prefix> {
        // A concurrent cross-domain move can invalidate the located domain between
        // the two lookups; retry with the fresh location.
        for _ in 0..3 {
            let domain_id = self.domain_of(id)?;
            let shard = self.shard(&domain_id)?;
            let state = self.read_shard(&domain_id, &shard)?;
            if let Some(prefix) = state.prefixes.get(id) {
                return Ok(prefix.clone());
            }
        }
        Err(DomainError::PrefixNotFound(id.to_string()).into())
    }

    /// All prefixes of a domain, ordered by cidr.
    pub fn list_by_domain(&self, domain_id: &str) -> ApplicationResult<Vec<Prefix>> {
        let shard = self.shard(domain_id)?;
        let state = self.read_shard(domain_id, &shard)?;
        Ok(state.sorted())
    }

    /// Direct children ordered by cidr.
    pub fn children(&self, id: &str) -> ApplicationResult<Vec<Prefix>> {
        let domain_id = self.domain_of(id)?;
        let shard = self.shard(&domain_id)?;
        let state = self.read_shard(&domain_id, &shard)?;
        state.get(id)?;
        Ok(state
            .index
            .children(id)
            .filter_map(|c| state.prefixes.get(c))
            .cloned()
            .collect())
    }

    /// Most specific prefix of `domain_id` containing `cidr` (exact match included).
    pub fn longest_match(&self, domain_id: &str, cidr: &Cidr) -> ApplicationResult<Option<Prefix>> {
        let shard = self.shard(domain_id)?;
        let state = self.read_shard(domain_id, &shard)?;
        Ok(state
            .index
            .longest_match(cidr)
            .and_then(|id| state.prefixes.get(id))
            .cloned())
    }

    #[instrument(level = "debug", skip(self, domain), fields(id = %domain.id))]
    pub fn create_domain(&self, domain: RoutingDomain) -> ApplicationResult<RoutingDomain> {
        validate_identifier(&domain.id)?;
        let mut domains = self.domains.write();
        if domains.contains_key(&domain.id) {
            return Err(DomainError::DomainExists(domain.id).into());
        }
        if domain.is_default {
            if let Some(current) = domains.values().find(|s| s.meta.is_default) {
                return Err(DomainError::DefaultDomainConflict {
                    message: format!("{} is already the default domain", current.meta.id),
                }
                .into());
            }
        }
        let now = Utc::now();
        let domain = RoutingDomain {
            created_at: now,
            updated_at: now,
            ..domain
        };
        domains.insert(
            domain.id.clone(),
            DomainSlot {
                meta: domain.clone(),
                shard: Arc::new(RwLock::new(DomainState::default())),
            },
        );
        info!(id = %domain.id, routable = domain.routable, "routing domain created");
        Ok(domain)
    }

    #[instrument(level = "debug", skip(self, patch))]
    pub fn update_domain(&self, id: &str, patch: DomainPatch) -> ApplicationResult<RoutingDomain> {
        let mut domains = self.domains.write();
        let slot = domains
            .get_mut(id)
            .ok_or_else(|| DomainError::DomainNotFound(id.to_string()))?;
        if let Some(description) = patch.description {
            slot.meta.description = description;
        }
        if let Some(tags) = patch.tags {
            slot.meta.tags = tags;
        }
        if let Some(routable) = patch.routable {
            slot.meta.routable = routable;
        }
        slot.meta.updated_at = Utc::now();
        info!(id, "routing domain updated");
        Ok(slot.meta.clone())
    }

    /// Move the default flag to `id` in one step.
    #[instrument(level = "debug", skip(self))]
    pub fn set_default_domain(&self, id: &str) -> ApplicationResult<RoutingDomain> {
        let mut domains = self.domains.write();
        if !domains.contains_key(id) {
            return Err(DomainError::DomainNotFound(id.to_string()).into());
        }
        let now = Utc::now();
        let mut promoted = None;
        for slot in domains.values_mut() {
            let is_target = slot.meta.id == id;
            if slot.meta.is_default != is_target {
                slot.meta.is_default = is_target;
                slot.meta.updated_at = now;
            }
            if is_target {
                promoted = Some(slot.meta.clone());
            }
        }
        info!(id, "default routing domain changed");
        promoted.ok_or_else(|| DomainError::DomainNotFound(id.to_string()).into())
    }

    /// Delete an empty, non-default domain.
    #[instrument(level = "debug", skip(self))]
    pub fn delete_domain(&self, id: &str) -> ApplicationResult<RoutingDomain> {
        let mut domains = self.domains.write();
        let slot = domains
            .get(id)
            .ok_or_else(|| DomainError::DomainNotFound(id.to_string()))?;
        if slot.meta.is_default {
            return Err(DomainError::DefaultDomainConflict {
                message: format!("{id} is the default domain and cannot be deleted"),
            }
            .into());
        }
        let shard = Arc::clone(&slot.shard);
        {
            let mut state = self.write_shard(id, &shard)?;
            if !state.prefixes.is_empty() {
                return Err(DomainError::DomainInUse {
                    domain_id: id.to_string(),
                    count: state.prefixes.len(),
                }
                .into());
            }
            state.retired = true;
        }
        let removed = domains
            .remove(id)
            .map(|s| s.meta)
            .ok_or_else(|| DomainError::DomainNotFound(id.to_string()))?;
        info!(id, "routing domain deleted");
        Ok(removed)
    }

    pub fn get_domain(&self, id: &str) -> ApplicationResult<RoutingDomain> {
        self.domains
            .read()
            .get(id)
            .map(|s| s.meta.clone())
            .ok_or_else(|| DomainError::DomainNotFound(id.to_string()).into())
    }

    /// All domains ordered by id.
    pub fn list_domains(&self) -> Vec<RoutingDomain> {
        self.domains.read().values().map(|s| s.meta.clone()).collect()
    }

    pub fn default_domain(&self) -> Option<RoutingDomain> {
        self.domains
            .read()
            .values()
            .find(|s| s.meta.is_default)
            .map(|s| s.meta.clone())
    }

    /// Get or create the non-routable domain dedicated to `resource_id`.
    #[instrument(level = "debug", skip(self))]
    pub fn ensure_isolated_domain(&self, resource_id: &str) -> ApplicationResult<RoutingDomain> {
        let id = self.settings.isolated_domain_id(resource_id);
        validate_identifier(&id)?;
        let mut domains = self.domains.write();
        if let Some(slot) = domains.get(&id) {
            return Ok(slot.meta.clone());
        }
        let mut tags = Tags::new();
        tags.insert("resource_id".into(), resource_id.to_string());
        let domain = RoutingDomain::new(id.clone(), format!("Isolated domain for {resource_id}"), false)
            .with_tags(tags);
        domains.insert(
            id,
            DomainSlot {
                meta: domain.clone(),
                shard: Arc::new(RwLock::new(DomainState::default())),
            },
        );
        info!(id = %domain.id, resource_id, "isolated routing domain created");
        Ok(domain)
    }

    /// Reserve an umbrella range under `parent_prefix_id` for later ingestion.
    /// The parent becomes an external-scope prefix.
    #[instrument(level = "debug", skip(self, allocation), fields(resource = %allocation.resource_id, cidr = %allocation.reserved_cidr))]
    pub fn reserve_allocation(
        &self,
        allocation: ExternalAllocation,
    ) -> ApplicationResult<ExternalAllocation> {
        validate_identifier(&allocation.resource_id)?;
        let domain_id = self.domain_of(&allocation.parent_prefix_id)?;
        let shard = self.shard(&domain_id)?;
        let mut state = self.write_shard(&domain_id, &shard)?;

        let parent = state.get(&allocation.parent_prefix_id)?;
        if !parent.cidr.contains(&allocation.reserved_cidr) {
            return Err(DomainError::NotContained {
                cidr: allocation.reserved_cidr.to_string(),
                parent_cidr: parent.cidr.to_string(),
            }
            .into());
        }
        if allocation.routable && !parent.routable {
            return Err(DomainError::RoutableUnderNonRoutable {
                cidr: allocation.reserved_cidr.to_string(),
                parent_id: parent.id.clone(),
            }
            .into());
        }
        let manual_child = state
            .index
            .children(&parent.id)
            .filter_map(|c| state.prefixes.get(c))
            .find(|c| !c.origin.is_external());
        if let Some(child) = manual_child {
            return Err(DomainError::InconsistentOrigin {
                prefix_id: parent.id.clone(),
                message: format!("already holds manual child {}", child.id),
            }
            .into());
        }

        {
            let mut allocations = self.allocations.write();
            let rows = allocations.entry(allocation.resource_id.clone()).or_default();
            if rows.iter().any(|a| a.reserved_cidr == allocation.reserved_cidr) {
                return Err(DomainError::DuplicateAllocation {
                    resource_id: allocation.resource_id.clone(),
                    reserved_cidr: allocation.reserved_cidr.to_string(),
                }
                .into());
            }
            rows.push(allocation.clone());
        }

        if let Some(node) = state.prefixes.get_mut(&allocation.parent_prefix_id) {
            if !node.child_scope {
                node.child_scope = true;
                node.updated_at = Utc::now();
            }
        }
        info!(parent = %allocation.parent_prefix_id, "external allocation reserved");
        Ok(allocation)
    }

    /// Drop a reservation. The parent leaves external scope once it has neither
    /// reservations nor children left.
    #[instrument(level = "debug", skip(self))]
    pub fn release_allocation(
        &self,
        resource_id: &str,
        reserved_cidr: &Cidr,
    ) -> ApplicationResult<ExternalAllocation> {
        let not_found = || DomainError::AllocationNotFound {
            resource_id: resource_id.to_string(),
            reserved_cidr: reserved_cidr.to_string(),
        };
        let parent_id = self
            .allocations
            .read()
            .get(resource_id)
            .and_then(|rows| rows.iter().find(|a| a.reserved_cidr == *reserved_cidr))
            .map(|a| a.parent_prefix_id.clone())
            .ok_or_else(not_found)?;

        let domain_id = self.domain_of(&parent_id)?;
        let shard = self.shard(&domain_id)?;
        let mut state = self.write_shard(&domain_id, &shard)?;

        let (released, still_referenced) = {
            let mut allocations = self.allocations.write();
            let rows = allocations.get_mut(resource_id).ok_or_else(not_found)?;
            let pos = rows
                .iter()
                .position(|a| a.reserved_cidr == *reserved_cidr)
                .ok_or_else(not_found)?;
            let released = rows.remove(pos);
            if rows.is_empty() {
                allocations.remove(resource_id);
            }
            let still_referenced = allocations
                .values()
                .flatten()
                .any(|a| a.parent_prefix_id == released.parent_prefix_id);
            (released, still_referenced)
        };

        if !still_referenced && state.index.child_count(&parent_id) == 0 {
            if let Some(node) = state.prefixes.get_mut(&parent_id) {
                node.child_scope = false;
                node.updated_at = Utc::now();
            }
        }
        info!(resource_id, cidr = %reserved_cidr, "external allocation released");
        Ok(released)
    }

    /// Reservations, optionally restricted to one resource.
    pub fn list_allocations(&self, resource_id: Option<&str>) -> Vec<ExternalAllocation> {
        let allocations = self.allocations.read();
        match resource_id {
            Some(r) => allocations.get(r).cloned().unwrap_or_default(),
            None => allocations.values().flatten().cloned().collect(),
        }
    }

    /// Most specific reservation of `resource_id` covering `cidr`.
    pub fn best_allocation(
        &self,
        resource_id: &str,
        cidr: &Cidr,
    ) -> ApplicationResult<ExternalAllocation> {
        self.allocations
            .read()
            .get(resource_id)
            .and_then(|rows| {
                rows.iter()
                    .filter(|a| a.reserved_cidr.contains(cidr))
                    .max_by_key(|a| a.reserved_cidr.mask_len())
            })
            .cloned()
            .ok_or_else(|| {
                DomainError::NoAllocationFound {
                    resource_id: resource_id.to_string(),
                    cidr: cidr.to_string(),
                }
                .into()
            })
    }

    /// Create the prefix addressed by `req.id`, or bring the existing row in line
    /// with the request. Moves it across domains when the target domain changed.
    #[instrument(level = "debug", skip(self, req), fields(id = %req.id, domain = %req.domain_id))]
    pub fn upsert_external(&self, req: &ExternalUpsert) -> ApplicationResult<(Prefix, UpsertAction)> {
        validate_identifier(&req.id)?;
        validate_identifier(&req.resource_id)?;
        let located = self.locator.read().get(&req.id).cloned();
        match located {
            None => {
                let shard = self.shard(&req.domain_id)?;
                let mut state = self.write_shard(&req.domain_id, &shard)?;
                let parent_id = req.parent_id();
                let new = NewPrefix {
                    id: Some(req.id.clone()),
                    domain_id: req.domain_id.clone(),
                    cidr: req.cidr,
                    parent_id,
                    routable: req.routable,
                    origin: Origin::External {
                        resource_id: req.resource_id.clone(),
                    },
                    tags: req.tags.clone(),
                };
                let prefix = self.create_locked(&mut state, req.id.clone(), new)?;
                Ok((prefix, UpsertAction::Created))
            }
            Some(current) if current == req.domain_id => {
                let shard = self.shard(&current)?;
                let mut state = self.write_shard(&current, &shard)?;
                refresh_external(&mut state, req)
            }
            Some(current) => self.move_external(&current, req),
        }
    }

    /// Move an external leaf prefix to another domain, both shards locked in id order.
    fn move_external(&self, from: &str, req: &ExternalUpsert) -> ApplicationResult<(Prefix, UpsertAction)> {
        let to = req.domain_id.as_str();
        let from_shard = self.shard(from)?;
        let to_shard = self.shard(to)?;
        let (mut src, mut dst) = if from < to {
            let src = self.write_shard(from, &from_shard)?;
            let dst = self.write_shard(to, &to_shard)?;
            (src, dst)
        } else {
            let dst = self.write_shard(to, &to_shard)?;
            let src = self.write_shard(from, &from_shard)?;
            (src, dst)
        };

        let existing = src.get(&req.id)?.clone();
        check_external_identity(&existing, req)?;
        let count = src.index.child_count(&req.id);
        if count > 0 {
            return Err(DomainError::HasChildren {
                prefix_id: req.id.clone(),
                count,
            }
            .into());
        }

        let parent_id = req.parent_id();
        let depth = dst.validate(&PrefixCandidate {
            domain_id: to,
            cidr: req.cidr,
            parent_id: parent_id.as_deref(),
            routable: req.routable,
            origin: &existing.origin,
            reparenting: None,
        })?;

        let mut locator = self.locator.write();
        let moved = Prefix {
            domain_id: to.to_string(),
            parent_id,
            depth,
            routable: req.routable,
            tags: req.tags.clone(),
            child_scope: false,
            updated_at: Utc::now(),
            ..existing
        };
        dst.attach(moved.clone())?;
        if let Err(e) = src.detach(&req.id) {
            dst.undo_attach(&req.id, to);
            return Err(e.into());
        }
        locator.insert(req.id.clone(), to.to_string());
        info!(id = %req.id, from, to, "external prefix moved across domains");
        Ok((moved, UpsertAction::Updated))
    }
}

fn check_external_identity(existing: &Prefix, req: &ExternalUpsert) -> DomainResult<()> {
    if existing.external_resource_id() != Some(req.resource_id.as_str()) {
        return Err(DomainError::InconsistentOrigin {
            prefix_id: existing.id.clone(),
            message: format!(
                "expected external origin {}, found {:?}",
                req.resource_id, existing.origin
            ),
        });
    }
    if existing.cidr != req.cidr {
        return Err(DomainError::InconsistentOrigin {
            prefix_id: existing.id.clone(),
            message: format!("stored as {}, reported as {}", existing.cidr, req.cidr),
        });
    }
    Ok(())
}

/// Same-domain refresh of an existing external prefix; caller holds the write lock.
fn refresh_external(state: &mut DomainState, req: &ExternalUpsert) -> ApplicationResult<(Prefix, UpsertAction)> {
    let existing = state.get(&req.id)?.clone();
    check_external_identity(&existing, req)?;
    let parent_id = req.parent_id();

    let moves = existing.parent_id != parent_id;
    let routable_changed = existing.routable != req.routable;
    let tags_changed = existing.tags != req.tags;
    if !moves && !routable_changed && !tags_changed {
        return Ok((existing, UpsertAction::Unchanged));
    }

    let depth = if moves || routable_changed {
        state.validate(&PrefixCandidate {
            domain_id: &req.domain_id,
            cidr: req.cidr,
            parent_id: parent_id.as_deref(),
            routable: req.routable,
            origin: &existing.origin,
            reparenting: Some(&req.id),
        })?
    } else {
        existing.depth
    };

    if moves {
        state.index.set_parent(&req.id, parent_id.as_deref())?;
    }
    let updated = {
        let node = state
            .prefixes
            .get_mut(&req.id)
            .ok_or_else(|| DomainError::PrefixNotFound(req.id.clone()))?;
        node.parent_id = parent_id;
        node.depth = depth;
        node.routable = req.routable;
        node.tags = req.tags.clone();
        node.updated_at = Utc::now();
        node.clone()
    };
    if moves {
        state.refresh_depths(&req.id);
    }
    if routable_changed && !req.routable {
        state.cascade_non_routable(&req.id);
    }
    debug!(id = %req.id, moves, routable_changed, tags_changed, "external prefix refreshed");
    Ok((updated, UpsertAction::Updated))
}
