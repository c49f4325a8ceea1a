//! Markup tree model and the reduction engine built on it.

pub mod reduce;
pub mod tree;

pub use reduce::{DomReducer, MAX_ATTR_LEN, TRUNCATION_MARKER};
pub use tree::{AttrValue, DomNode, DomTree, Mark, NodeData, NodeId};
