//! Arena-backed markup tree.
//!
//! The reduction engine needs to delete subtrees and walk parent links
//! freely, so the parsed document is converted into an index-based
//! arena: nodes own their children by id, the parent link is a plain
//! back-index. `scraper` types do not leak past [`DomTree::parse`].

use std::collections::HashMap;

use scraper::{Html, Node as ScraperNode};

/// Index of a node inside its [`DomTree`] arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

/// Attribute value: single string or space-separated token list
/// (class-like attributes keep their tokens).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttrValue {
    One(String),
    Many(Vec<String>),
}

impl AttrValue {
    /// Flatten to a single string (token lists joined by spaces).
    pub fn joined(&self) -> String {
        match self {
            AttrValue::One(value) => value.clone(),
            AttrValue::Many(tokens) => tokens.join(" "),
        }
    }

    /// Character length of the flattened value.
    pub fn char_len(&self) -> usize {
        self.joined().chars().count()
    }
}

/// Node payload.
#[derive(Clone, Debug)]
pub enum NodeData {
    /// Synthetic document root (never serialized as a tag).
    Document,
    Element {
        tag: String,
        attrs: Vec<(String, AttrValue)>,
    },
    Text(String),
    Comment,
}

/// Transient reduction mark. `Seed` is terminal: it is never
/// downgraded to `Ancestor` or `Descendant`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mark {
    Seed,
    Ancestor,
    Descendant,
}

/// One arena slot.
#[derive(Clone, Debug)]
pub struct DomNode {
    pub data: NodeData,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub mark: Option<Mark>,
}

impl DomNode {
    /// Tag name for element nodes, lowercased at parse time.
    pub fn tag(&self) -> Option<&str> {
        match &self.data {
            NodeData::Element { tag, .. } => Some(tag.as_str()),
            _ => None,
        }
    }

    /// Attribute lookup by (lowercase) name.
    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        match &self.data {
            NodeData::Element { attrs, .. } => attrs
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value),
            _ => None,
        }
    }
}

/// Elements serialized without a closing tag.
const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

/// Attributes whose values are token lists rather than plain strings.
const TOKEN_LIST_ATTRS: &[&str] = &["class", "rel"];

/// An in-memory markup document.
///
/// Nodes live in a flat arena; detaching a subtree only unlinks it
/// from its parent, the slots themselves are abandoned until the tree
/// is dropped. No node survives past one reduction call.
#[derive(Clone, Debug)]
pub struct DomTree {
    nodes: Vec<DomNode>,
    root: NodeId,
}

impl DomTree {
    /// Parse an HTML string into an arena tree.
    ///
    /// An empty or whitespace-only input yields a tree whose document
    /// root has no children.
    pub fn parse(html: &str) -> Self {
        let mut tree = Self {
            nodes: Vec::new(),
            root: NodeId(0),
        };
        tree.nodes.push(DomNode {
            data: NodeData::Document,
            parent: None,
            children: Vec::new(),
            mark: None,
        });

        if html.trim().is_empty() {
            return tree;
        }

        let parsed = Html::parse_document(html);
        let root = tree.root;

        // Walk the parsed tree with an explicit stack of
        // (source node, target parent) pairs.
        let mut work: Vec<_> = parsed
            .tree
            .root()
            .children()
            .rev()
            .map(|child| (child, root))
            .collect();

        while let Some((source, parent)) = work.pop() {
            let data = match source.value() {
                ScraperNode::Element(element) => {
                    let tag = element.name().to_ascii_lowercase();
                    let mut attrs: Vec<(String, AttrValue)> = element
                        .attrs()
                        .map(|(name, value)| {
                            let name = name.to_ascii_lowercase();
                            let value = if TOKEN_LIST_ATTRS.contains(&name.as_str()) {
                                AttrValue::Many(
                                    value.split_whitespace().map(str::to_string).collect(),
                                )
                            } else {
                                AttrValue::One(value.to_string())
                            };
                            (name, value)
                        })
                        .collect();
                    // The parser hands attributes back in hash order;
                    // sort so serialization is stable across runs.
                    attrs.sort_by(|a, b| a.0.cmp(&b.0));
                    NodeData::Element { tag, attrs }
                }
                ScraperNode::Text(text) => NodeData::Text(text.to_string()),
                ScraperNode::Comment(_) => NodeData::Comment,
                // Doctype, processing instructions and nested document
                // markers carry no content worth keeping.
                _ => {
                    for child in source.children().rev() {
                        work.push((child, parent));
                    }
                    continue;
                }
            };

            let id = tree.push(data, Some(parent));
            for child in source.children().rev() {
                work.push((child, id));
            }
        }

        tree
    }

    /// Append a node under `parent` (or as a root child when `None`).
    pub fn push(&mut self, data: NodeData, parent: Option<NodeId>) -> NodeId {
        let parent = parent.unwrap_or(self.root);
        let id = NodeId(self.nodes.len());
        self.nodes.push(DomNode {
            data,
            parent: Some(parent),
            children: Vec::new(),
            mark: None,
        });
        self.nodes[parent.0].children.push(id);
        id
    }

    /// Document root id.
    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &DomNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut DomNode {
        &mut self.nodes[id.0]
    }

    /// Unlink `id` from its parent, abandoning the whole subtree.
    pub fn detach(&mut self, id: NodeId) {
        if let Some(parent) = self.nodes[id.0].parent {
            self.nodes[parent.0].children.retain(|child| *child != id);
        }
        self.nodes[id.0].parent = None;
    }

    /// Ids of all nodes reachable from the root, in document order.
    pub fn reachable(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut work = vec![self.root];
        while let Some(id) = work.pop() {
            out.push(id);
            for child in self.node(id).children.iter().rev() {
                work.push(*child);
            }
        }
        out
    }

    /// Ids of the subtree rooted at `id` (inclusive), document order.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut work = vec![id];
        while let Some(current) = work.pop() {
            out.push(current);
            for child in self.node(current).children.iter().rev() {
                work.push(*child);
            }
        }
        out
    }

    /// Find the first reachable element with the given tag name.
    pub fn find_tag(&self, tag: &str) -> Option<NodeId> {
        self.reachable()
            .into_iter()
            .find(|id| self.node(*id).tag() == Some(tag))
    }

    /// Serialize the subtree rooted at `id`.
    pub fn serialize(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.write_node(id, &mut out);
        out
    }

    fn write_node(&self, id: NodeId, out: &mut String) {
        let node = self.node(id);
        match &node.data {
            NodeData::Document => {
                for child in &node.children {
                    self.write_node(*child, out);
                }
            }
            NodeData::Text(text) => out.push_str(&escape_text(text)),
            NodeData::Comment => {}
            NodeData::Element { tag, attrs } => {
                out.push('<');
                out.push_str(tag);
                for (name, value) in attrs {
                    out.push(' ');
                    out.push_str(name);
                    out.push_str("=\"");
                    out.push_str(&escape_attr(&value.joined()));
                    out.push('"');
                }
                out.push('>');
                if VOID_TAGS.contains(&tag.as_str()) {
                    return;
                }
                for child in &node.children {
                    self.write_node(*child, out);
                }
                out.push_str("</");
                out.push_str(tag);
                out.push('>');
            }
        }
    }
}

fn escape_text(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn escape_attr(text: &str) -> String {
    escape_text(text).replace('"', "&quot;")
}

/// Convenience map view of a node's attributes (tests, debugging).
pub fn attr_map(node: &DomNode) -> HashMap<String, String> {
    match &node.data {
        NodeData::Element { attrs, .. } => attrs
            .iter()
            .map(|(name, value)| (name.clone(), value.joined()))
            .collect(),
        _ => HashMap::new(),
    }
}
