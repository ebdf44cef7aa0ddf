//! Service container for dependency injection
//!
//! Wires up all services with their dependencies.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::application::services::{IngestionReconciler, PrefixStore};
use crate::config::Settings;
use crate::domain::{CancelToken, Forest, Prefix, TreeBuilder};
use crate::infrastructure::InfraResult;

/// Container holding all application services.
pub struct ServiceContainer {
    /// Application settings
    pub settings: Arc<Settings>,

    /// Prefix and domain store shared by all callers
    pub store: Arc<PrefixStore>,

    /// Ingestion entry point for the discovery feed
    pub reconciler: Arc<IngestionReconciler>,
}

impl ServiceContainer {
    /// Create a container with a fresh store bootstrapped from `settings`.
    pub fn new(settings: Settings) -> InfraResult<Self> {
        settings.validate()?;
        let settings = Arc::new(settings);
        let store = Arc::new(PrefixStore::new(Arc::clone(&settings)));
        let reconciler = Arc::new(IngestionReconciler::new(
            Arc::clone(&store),
            Arc::clone(&settings),
        )?);
        Ok(Self {
            settings,
            store,
            reconciler,
        })
    }

    /// Load layered settings (optionally with an explicit local file) and wire up.
    pub fn load(local: Option<&Path>) -> InfraResult<Self> {
        Self::new(Settings::load(local)?)
    }

    /// Materialize one domain as a forest.
    pub fn domain_tree(&self, domain_id: &str, cancel: CancelToken) -> InfraResult<Forest> {
        self.domain_tree_excluding(domain_id, |_| false, cancel)
    }

    /// Materialize one domain, hiding prefixes matched by `exclude`.
    #[instrument(level = "debug", skip(self, exclude, cancel))]
    pub fn domain_tree_excluding<F>(
        &self,
        domain_id: &str,
        exclude: F,
        cancel: CancelToken,
    ) -> InfraResult<Forest>
    where
        F: Fn(&Prefix) -> bool + Send + Sync,
    {
        let snapshot = self.store.list_by_domain(domain_id)?;
        debug!(prefixes = snapshot.len(), "snapshot taken");
        let forest = TreeBuilder::new()
            .exclude(exclude)
            .with_cancel(cancel)
            .with_check_interval(self.settings.tree_cancel_check_interval)
            .build(&snapshot)?;
        Ok(forest)
    }
}
