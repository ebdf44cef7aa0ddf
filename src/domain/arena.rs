use std::collections::HashMap;

use generational_arena::{Arena, Index};
use serde::Serialize;
use tracing::instrument;

use crate::domain::entities::{Prefix, PrefixId};

/// Tree node in the arena-based forest.
#[derive(Debug, Clone)]
pub struct TreeNode {
    /// Snapshot of the prefix at build time
    pub prefix: Prefix,
    /// Index of parent node in the arena, None for root nodes
    pub parent: Option<Index>,
    /// Indices of child nodes in the arena, ordered by cidr
    pub children: Vec<Index>,
}

/// Nested, owned view of a subtree for export.
#[derive(Debug, Clone, Serialize)]
pub struct NestedNode {
    #[serde(flatten)]
    pub prefix: Prefix,
    pub children: Vec<NestedNode>,
}

/// Arena-based forest materialized from a flat prefix list.
///
/// Uses generational arena for memory-safe node references and O(1) lookups.
/// Roots are kept in cidr order.
#[derive(Debug, Default)]
pub struct Forest {
    arena: Arena<TreeNode>,
    roots: Vec<Index>,
    /// Kept prefixes that could not be attached because their parent was
    /// excluded or absent from the input
    detached: Vec<PrefixId>,
}

impl Forest {
    pub fn new() -> Self {
        Self::default()
    }

    #[instrument(level = "trace", skip(self, prefix), fields(id = %prefix.id))]
    pub(crate) fn insert_node(&mut self, prefix: Prefix, parent: Option<Index>) -> Index {
        let node = TreeNode {
            prefix,
            parent,
            children: Vec::new(),
        };
        let node_idx = self.arena.insert(node);

        if let Some(parent_idx) = parent {
            if let Some(parent) = self.arena.get_mut(parent_idx) {
                parent.children.push(node_idx);
            }
        } else {
            self.roots.push(node_idx);
        }

        node_idx
    }

    pub(crate) fn set_detached(&mut self, detached: Vec<PrefixId>) {
        self.detached = detached;
    }

    pub fn get_node(&self, idx: Index) -> Option<&TreeNode> {
        self.arena.get(idx)
    }

    pub fn roots(&self) -> &[Index] {
        &self.roots
    }

    pub fn detached(&self) -> &[PrefixId] {
        &self.detached
    }

    /// Number of attached nodes.
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Locate a node by prefix id.
    pub fn find(&self, id: &str) -> Option<Index> {
        self.arena
            .iter()
            .find(|(_, node)| node.prefix.id == id)
            .map(|(idx, _)| idx)
    }

    pub fn iter(&self) -> TreeIterator<'_> {
        TreeIterator::new(self)
    }

    pub fn iter_postorder(&self) -> PostOrderIterator<'_> {
        PostOrderIterator::new(self)
    }

    /// Number of levels in the deepest tree (0 for an empty forest).
    #[instrument(level = "debug", skip(self))]
    pub fn depth(&self) -> usize {
        let mut max = 0;
        let mut stack: Vec<(Index, usize)> = self.roots.iter().map(|&r| (r, 1)).collect();
        while let Some((idx, level)) = stack.pop() {
            max = max.max(level);
            if let Some(node) = self.get_node(idx) {
                stack.extend(node.children.iter().map(|&c| (c, level + 1)));
            }
        }
        max
    }

    /// Ids of all attached nodes without children, in pre-order.
    #[instrument(level = "debug", skip(self))]
    pub fn leaf_nodes(&self) -> Vec<PrefixId> {
        self.iter()
            .filter(|(_, node)| node.children.is_empty())
            .map(|(_, node)| node.prefix.id.clone())
            .collect()
    }

    /// Owned nested copy of the forest, built bottom-up without recursion.
    pub fn to_nested(&self) -> Vec<NestedNode> {
        let mut built: HashMap<Index, NestedNode> = HashMap::new();
        for (idx, node) in self.iter_postorder() {
            let children = node
                .children
                .iter()
                .filter_map(|c| built.remove(c))
                .collect();
            built.insert(
                idx,
                NestedNode {
                    prefix: node.prefix.clone(),
                    children,
                },
            );
        }
        self.roots.iter().filter_map(|r| built.remove(r)).collect()
    }
}

/// Pre-order traversal over all trees, roots in cidr order.
pub struct TreeIterator<'a> {
    forest: &'a Forest,
    stack: Vec<Index>,
}

impl<'a> TreeIterator<'a> {
    fn new(forest: &'a Forest) -> Self {
        let stack = forest.roots.iter().rev().copied().collect();
        Self { forest, stack }
    }
}

impl<'a> Iterator for TreeIterator<'a> {
    type Item = (Index, &'a TreeNode);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(current_idx) = self.stack.pop() {
            if let Some(node) = self.forest.get_node(current_idx) {
                // Push children in reverse order for left-to-right traversal
                for &child in node.children.iter().rev() {
                    self.stack.push(child);
                }
                return Some((current_idx, node));
            }
        }
        None
    }
}

/// Post-order traversal over all trees.
pub struct PostOrderIterator<'a> {
    forest: &'a Forest,
    stack: Vec<(Index, bool)>,
}

impl<'a> PostOrderIterator<'a> {
    fn new(forest: &'a Forest) -> Self {
        let stack = forest.roots.iter().rev().map(|&r| (r, false)).collect();
        Self { forest, stack }
    }
}

impl<'a> Iterator for PostOrderIterator<'a> {
    type Item = (Index, &'a TreeNode);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some((current_idx, visited)) = self.stack.pop() {
            if let Some(node) = self.forest.get_node(current_idx) {
                if !visited {
                    self.stack.push((current_idx, true));
                    for &child in node.children.iter().rev() {
                        self.stack.push((child, false));
                    }
                } else {
                    return Some((current_idx, node));
                }
            }
        }
        None
    }
}
