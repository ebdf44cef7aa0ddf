//! Idempotent ingestion of externally discovered subnets
//!
//! A subnet is accepted only when an engineer reserved an umbrella allocation for
//! its resource beforehand. The resulting prefix id is derived from the resource id
//! and the subnet, so replaying the same discovery never creates a second row.

use std::collections::HashMap;
use std::sync::Arc;

use itertools::Itertools;
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::application::hash::external_prefix_id;
use crate::application::services::store::{ExternalParent, ExternalUpsert, PrefixStore, UpsertAction};
use crate::application::{ApplicationError, ApplicationResult};
use crate::config::Settings;
use crate::domain::{validate_identifier, Cidr, DiscoveredSubnet, DomainError, PrefixId, Tags};

/// Result of reconciling one subnet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reconciled {
    pub prefix_id: PrefixId,
    pub domain_id: String,
    pub action: UpsertAction,
}

/// A subnet the batch could not apply.
#[derive(Debug)]
pub struct Skipped {
    pub subnet: DiscoveredSubnet,
    pub error: ApplicationError,
}

/// Partial-failure report of a batch run. Entries keep input order per resource.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub applied: Vec<Reconciled>,
    pub skipped: Vec<Skipped>,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty()
    }

    pub fn count(&self, action: UpsertAction) -> usize {
        self.applied.iter().filter(|r| r.action == action).count()
    }
}

pub struct IngestionReconciler {
    store: Arc<PrefixStore>,
    settings: Arc<Settings>,
    /// One mutex per resource id serializes reconciles of the same resource
    resource_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    pool: rayon::ThreadPool,
}

impl IngestionReconciler {
    pub fn new(store: Arc<PrefixStore>, settings: Arc<Settings>) -> ApplicationResult<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(settings.ingest_threads)
            .thread_name(|i| format!("ipam-ingest-{i}"))
            .build()
            .map_err(|e| ApplicationError::Config {
                message: format!("ingest thread pool: {e}"),
            })?;
        Ok(Self {
            store,
            settings,
            resource_locks: Mutex::new(HashMap::new()),
            pool,
        })
    }

    fn resource_lock(&self, resource_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.resource_locks.lock();
        Arc::clone(locks.entry(resource_id.to_string()).or_default())
    }

    /// Forget the lock of `resource_id` once no other caller holds a handle to it.
    /// Handles are only cloned under the map lock, so the count is exact here.
    fn release_resource_lock(&self, resource_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.resource_locks.lock();
        if Arc::strong_count(&lock) == 2 {
            locks.remove(resource_id);
        }
    }

    /// Upsert one discovered subnet of `resource_id`.
    #[instrument(level = "debug", skip(self, tags))]
    pub fn reconcile(
        &self,
        resource_id: &str,
        cidr: &Cidr,
        tags: Tags,
    ) -> ApplicationResult<Reconciled> {
        validate_identifier(resource_id)?;

        let lock = self.resource_lock(resource_id);
        let result = match lock.try_lock_for(self.settings.lock_timeout()) {
            Some(_serialized) => self.reconcile_locked(resource_id, cidr, tags),
            None => {
                warn!(resource_id, "timed out waiting for resource lock");
                Err(ApplicationError::Contention {
                    domain_id: self.settings.isolated_domain_id(resource_id),
                })
            }
        };
        self.release_resource_lock(resource_id, lock);
        result
    }

    /// Body of [`Self::reconcile`]; caller holds the resource lock.
    fn reconcile_locked(
        &self,
        resource_id: &str,
        cidr: &Cidr,
        tags: Tags,
    ) -> ApplicationResult<Reconciled> {
        let allocation = self.store.best_allocation(resource_id, cidr)?;
        debug!(reserved = %allocation.reserved_cidr, routable = allocation.routable, "allocation matched");

        let (domain_id, parent) = if allocation.routable {
            (
                self.store.domain_of(&allocation.parent_prefix_id)?,
                ExternalParent::Prefix(allocation.parent_prefix_id.clone()),
            )
        } else {
            (
                self.store.ensure_isolated_domain(resource_id)?.id,
                ExternalParent::Root,
            )
        };

        let req = ExternalUpsert {
            id: external_prefix_id(resource_id, cidr),
            resource_id: resource_id.to_string(),
            cidr: *cidr,
            domain_id,
            parent,
            routable: allocation.routable,
            tags,
        };
        let (prefix, action) = self.store.upsert_external(&req)?;
        match action {
            UpsertAction::Unchanged => debug!(id = %prefix.id, "subnet already up to date"),
            _ => info!(id = %prefix.id, domain = %prefix.domain_id, ?action, "subnet reconciled"),
        }
        Ok(Reconciled {
            prefix_id: prefix.id,
            domain_id: prefix.domain_id,
            action,
        })
    }

    /// Parse and reconcile a raw discovery record.
    pub fn reconcile_discovered(&self, subnet: &DiscoveredSubnet) -> ApplicationResult<Reconciled> {
        let cidr: Cidr = subnet.cidr.parse()?;
        self.reconcile(&subnet.resource_id, &cidr, subnet.tags.clone())
    }

    /// Reconcile a discovery batch. Resources are processed in parallel, subnets of
    /// one resource serially; failures are recorded and the batch continues.
    #[instrument(level = "debug", skip(self, subnets), fields(n = subnets.len()))]
    pub fn reconcile_batch(&self, subnets: Vec<DiscoveredSubnet>) -> BatchReport {
        let groups: Vec<(String, Vec<DiscoveredSubnet>)> = subnets
            .into_iter()
            .into_group_map_by(|s| s.resource_id.clone())
            .into_iter()
            .sorted_by(|a, b| a.0.cmp(&b.0))
            .collect();
        debug!(resources = groups.len(), "batch grouped by resource");

        let outcomes: Vec<Vec<(DiscoveredSubnet, ApplicationResult<Reconciled>)>> =
            self.pool.install(|| {
                groups
                    .into_par_iter()
                    .map(|(_, items)| {
                        items
                            .into_iter()
                            .map(|s| {
                                let result = self.reconcile_discovered(&s);
                                (s, result)
                            })
                            .collect()
                    })
                    .collect()
            });

        let mut report = BatchReport::default();
        for (subnet, result) in outcomes.into_iter().flatten() {
            match result {
                Ok(done) => report.applied.push(done),
                Err(e) => {
                    match &e {
                        ApplicationError::Domain(DomainError::NoAllocationFound { .. }) => {
                            warn!(resource = %subnet.resource_id, cidr = %subnet.cidr, "skipping subnet: {e}")
                        }
                        _ => {
                            error!(resource = %subnet.resource_id, cidr = %subnet.cidr, "failed to reconcile subnet: {e}")
                        }
                    }
                    report.skipped.push(Skipped { subnet, error: e });
                }
            }
        }
        info!(
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            "batch reconciled"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExternalAllocation, NewPrefix};

    fn cidr(s: &str) -> Cidr {
        s.parse().unwrap()
    }

    fn reconciler() -> IngestionReconciler {
        let settings = Arc::new(Settings::default());
        let store = Arc::new(PrefixStore::new(Arc::clone(&settings)));
        store
            .insert(NewPrefix::manual("default", cidr("10.0.0.0/16")).with_id("vpcs"))
            .unwrap();
        store
            .reserve_allocation(ExternalAllocation {
                resource_id: "vpc-1".into(),
                reserved_cidr: cidr("10.0.0.0/16"),
                routable: true,
                parent_prefix_id: "vpcs".into(),
            })
            .unwrap();
        IngestionReconciler::new(store, settings).unwrap()
    }

    #[test]
    fn given_finished_reconciles_when_done_then_resource_locks_released() {
        let r = reconciler();

        r.reconcile("vpc-1", &cidr("10.0.1.0/24"), Tags::new()).unwrap();
        assert!(r.reconcile("vpc-2", &cidr("10.0.2.0/24"), Tags::new()).is_err());

        assert!(r.resource_locks.lock().is_empty());
    }

    #[test]
    fn given_parallel_batch_when_done_then_resource_locks_released() {
        let r = reconciler();
        let batch = (0..32)
            .map(|i| DiscoveredSubnet {
                resource_id: format!("vpc-{}", i % 4),
                cidr: format!("10.0.{i}.0/24"),
                tags: Tags::new(),
            })
            .collect();

        let report = r.reconcile_batch(batch);

        assert_eq!(report.applied.len(), 8);
        assert!(r.resource_locks.lock().is_empty());
    }
}
