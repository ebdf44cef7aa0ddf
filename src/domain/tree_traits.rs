/*
Rendering lives in a trait so the arena types stay free of display concerns
and hosts can provide their own label format.
 */
use generational_arena::Index;
use termtree::Tree;
use tracing::instrument;

use crate::domain::arena::{Forest, TreeNode};

pub trait TreeNodeConvert {
    fn to_tree_string(&self) -> Vec<Tree<String>>;
}

fn label(node: &TreeNode) -> String {
    let p = &node.prefix;
    let mut label = format!("{} [{}]", p.cidr, p.id);
    if !p.routable {
        label.push_str(" (non-routable)");
    }
    if let Some(resource) = p.external_resource_id() {
        label.push_str(&format!(" <{resource}>"));
    }
    label
}

impl TreeNodeConvert for Forest {
    /// One `termtree` per root, children in cidr order.
    #[instrument(level = "debug", skip(self))]
    fn to_tree_string(&self) -> Vec<Tree<String>> {
        fn build_tree(forest: &Forest, node_idx: Index, parent_tree: &mut Tree<String>) {
            if let Some(node) = forest.get_node(node_idx) {
                for &child_idx in &node.children {
                    if let Some(child) = forest.get_node(child_idx) {
                        let mut child_tree = Tree::new(label(child));
                        build_tree(forest, child_idx, &mut child_tree);
                        parent_tree.push(child_tree);
                    }
                }
            }
        }

        self.roots()
            .iter()
            .filter_map(|&root_idx| {
                let root = self.get_node(root_idx)?;
                let mut tree = Tree::new(label(root));
                build_tree(self, root_idx, &mut tree);
                Some(tree)
            })
            .collect()
    }
}
