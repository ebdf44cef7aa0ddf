//! Tree builder for materializing flat prefix lists into nested forests.

use std::collections::{HashMap, HashSet};

use tracing::{debug, instrument};

use crate::domain::arena::Forest;
use crate::domain::cancel::CancelToken;
use crate::domain::entities::{Prefix, PrefixId};
use crate::domain::error::{DomainError, DomainResult};

/// Cancellation is polled once per this many processed nodes by default.
pub const DEFAULT_CHECK_INTERVAL: usize = 1024;

type ExcludeFn<'a> = Box<dyn Fn(&Prefix) -> bool + Send + Sync + 'a>;

/// Constructs cidr-ordered forests from a snapshot of prefixes.
///
/// Runs in O(n log n): one pass to filter and group by parent id, a sort per sibling
/// group, and an iterative depth-first assembly. The exclusion predicate is applied
/// before assembly; children of an excluded prefix are not re-parented and are
/// reported through [`Forest::detached`].
pub struct TreeBuilder<'a> {
    exclude: Option<ExcludeFn<'a>>,
    cancel: CancelToken,
    check_interval: usize,
}

impl Default for TreeBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> TreeBuilder<'a> {
    pub fn new() -> Self {
        Self {
            exclude: None,
            cancel: CancelToken::new(),
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }

    /// Drop prefixes for which `predicate` returns true.
    pub fn exclude<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Prefix) -> bool + Send + Sync + 'a,
    {
        self.exclude = Some(Box::new(predicate));
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_check_interval(mut self, interval: usize) -> Self {
        self.check_interval = interval.max(1);
        self
    }

    /// Build the forest. Returns `Cancelled` if the token fires mid-build; nothing
    /// partial is handed out.
    #[instrument(level = "debug", skip(self, flat), fields(n = flat.len()))]
    pub fn build(&self, flat: &[Prefix]) -> DomainResult<Forest> {
        let mut processed = 0usize;
        self.checkpoint(&mut processed, true)?;

        // Filter first, then group by parent id
        let mut roots: Vec<&Prefix> = Vec::new();
        let mut children: HashMap<&str, Vec<&Prefix>> = HashMap::new();
        let mut kept: Vec<&Prefix> = Vec::with_capacity(flat.len());
        for prefix in flat {
            self.checkpoint(&mut processed, false)?;
            if self.exclude.as_ref().is_some_and(|f| f(prefix)) {
                continue;
            }
            kept.push(prefix);
            match prefix.parent_id.as_deref() {
                None => roots.push(prefix),
                Some(pid) => children.entry(pid).or_default().push(prefix),
            }
        }

        roots.sort_by(|a, b| a.cidr.cmp(&b.cidr));
        for group in children.values_mut() {
            group.sort_by(|a, b| a.cidr.cmp(&b.cidr));
        }

        let mut forest = Forest::new();
        let mut attached: HashSet<&str> = HashSet::with_capacity(kept.len());
        let mut stack: Vec<(&Prefix, Option<generational_arena::Index>)> =
            roots.iter().rev().map(|&p| (p, None)).collect();

        while let Some((prefix, parent_idx)) = stack.pop() {
            self.checkpoint(&mut processed, false)?;
            if !attached.insert(prefix.id.as_str()) {
                continue;
            }
            let idx = forest.insert_node(prefix.clone(), parent_idx);
            if let Some(group) = children.get(prefix.id.as_str()) {
                for &child in group.iter().rev() {
                    stack.push((child, Some(idx)));
                }
            }
        }

        let detached: Vec<PrefixId> = kept
            .iter()
            .filter(|p| !attached.contains(p.id.as_str()))
            .map(|p| p.id.clone())
            .collect();
        if !detached.is_empty() {
            debug!(count = detached.len(), "prefixes without an attached parent");
        }
        forest.set_detached(detached);

        debug!(nodes = forest.len(), roots = forest.roots().len(), "forest built");
        Ok(forest)
    }

    fn checkpoint(&self, processed: &mut usize, force: bool) -> DomainResult<()> {
        *processed += 1;
        if (force || *processed % self.check_interval == 0) && self.cancel.is_cancelled() {
            debug!(processed = *processed, "tree build cancelled");
            return Err(DomainError::Cancelled);
        }
        Ok(())
    }
}
