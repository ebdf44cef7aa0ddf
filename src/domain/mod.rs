//! Domain layer: address arithmetic, entities, containment index and tree building
//!
//! This layer is independent of external concerns (no locking, no config loading).

pub mod address;
pub mod arena;
pub mod builder;
pub mod cancel;
pub mod entities;
pub mod error;
pub mod index;
pub mod tree_traits;
pub mod validator;

pub use address::{Cidr, Family};
pub use arena::{Forest, NestedNode, TreeNode};
pub use builder::TreeBuilder;
pub use cancel::CancelToken;
pub use entities::*;
pub use error::{DomainError, DomainResult};
pub use index::HierarchyIndex;
pub use tree_traits::TreeNodeConvert;
pub use validator::{ContainmentValidator, PrefixCandidate};
