//! DOM reduction engine.
//!
//! Compresses a parsed document down to the elements an automation
//! oracle can act on: interactive controls, their context, and the
//! structure needed to reach them. The algorithm is a fixed sequence
//! of marking passes over the arena tree followed by a prune and an
//! attribute scrub; given the same input and rule tables the output is
//! byte-for-byte deterministic.

use std::collections::{HashSet, VecDeque};

use tracing::debug;

use super::tree::{AttrValue, DomTree, Mark, NodeData, NodeId};

/// Tags removed with their whole subtree before any marking runs.
pub const STRIP_TAGS: &[&str] = &["script", "style", "link", "meta", "noscript", "head", "svg"];

/// Tags treated as interactive seeds by name alone.
const INTERACTIVE_TAGS: &[&str] = &["a", "button", "input", "select", "textarea", "label", "option"];

/// Structural context kept alongside interactive elements.
const CONTEXT_TAGS: &[&str] = &["form", "h1", "h2", "h3", "h4", "h5", "h6"];

/// `role` attribute values that mark a node as a seed.
const INTERACTIVE_ROLES: &[&str] = &[
    "button",
    "link",
    "checkbox",
    "radio",
    "menuitem",
    "tab",
    "slider",
    "spinbutton",
    "switch",
    "textbox",
    "listbox",
    "combobox",
    "searchbox",
];

/// `type` attribute values that make any element input-like.
const INPUT_TYPE_VALUES: &[&str] = &[
    "text", "search", "email", "password", "url", "tel", "number", "checkbox", "radio", "submit",
    "reset", "button",
];

/// Generic containers whose `placeholder` attribute is decorative.
const GENERIC_CONTAINER_TAGS: &[&str] = &["div", "span"];

/// Attributes preserved on surviving nodes. `data-*` and `aria-*`
/// prefixed names are always preserved in addition to this list.
const ALLOWED_ATTRIBUTES: &[&str] = &[
    "id",
    "class",
    "name",
    "role",
    "href",
    "src",
    "alt",
    "placeholder",
    "value",
    "type",
    "for",
    "title",
    "disabled",
    "checked",
    "selected",
];

/// Retained attribute values longer than this are cut and suffixed
/// with [`TRUNCATION_MARKER`].
pub const MAX_ATTR_LEN: usize = 150;

/// Suffix appended to truncated attribute values.
pub const TRUNCATION_MARKER: &str = "...[truncated]";

/// Tags whose whitespace-only text children are significant.
const VERBATIM_TEXT_TAGS: &[&str] = &["pre", "textarea"];

/// Tree-filtering engine. Construct once, call [`DomReducer::reduce`]
/// per page snapshot.
#[derive(Clone, Debug, Default)]
pub struct DomReducer {
    /// Site-specific custom element names treated as interactive seeds
    /// (web components the fixed tag table cannot know about).
    custom_interactive_tags: Vec<String>,
}

impl DomReducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extend the interactive-tag table with custom element names.
    pub fn with_custom_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.custom_interactive_tags
            .extend(tags.into_iter().map(|tag| tag.to_ascii_lowercase()));
        self
    }

    /// Reduce raw markup to its interaction-relevant subset.
    ///
    /// Empty input yields an empty string; no error paths exist.
    pub fn reduce(&self, html: &str) -> String {
        if html.trim().is_empty() {
            return String::new();
        }
        let mut tree = DomTree::parse(html);
        self.reduce_tree(&mut tree);

        let root = tree.find_tag("body").unwrap_or_else(|| tree.root());
        let out = tree.serialize(root);
        debug!(input_len = html.len(), output_len = out.len(), "dom reduced");
        out
    }

    /// Run all passes over an already-parsed tree, in place.
    pub fn reduce_tree(&self, tree: &mut DomTree) {
        self.strip_noncontent(tree);
        let seeds = self.mark_seeds(tree);
        self.mark_ancestors(tree, seeds);
        self.mark_descendants(tree);
        self.prune_unmarked(tree);
        self.sanitize_attributes(tree);
        self.drop_blank_text(tree);
    }

    /// Pass 1: drop non-content subtrees and comments so no later
    /// heuristic ever sees them.
    fn strip_noncontent(&self, tree: &mut DomTree) {
        for id in tree.reachable() {
            let node = tree.node(id);
            let doomed = match &node.data {
                NodeData::Comment => true,
                NodeData::Element { tag, .. } => STRIP_TAGS.contains(&tag.as_str()),
                _ => false,
            };
            if doomed {
                tree.detach(id);
            }
        }
    }

    /// Pass 2: mark interactive and contextual elements as seeds.
    /// Each node is judged independently; re-marking a seed is a no-op
    /// so check order cannot change the outcome.
    fn mark_seeds(&self, tree: &mut DomTree) -> Vec<NodeId> {
        let mut seeds = Vec::new();
        for id in tree.reachable() {
            if self.is_seed(tree, id) {
                tree.node_mut(id).mark = Some(Mark::Seed);
                seeds.push(id);
            }
        }
        seeds
    }

    fn is_seed(&self, tree: &DomTree, id: NodeId) -> bool {
        let node = tree.node(id);
        let Some(tag) = node.tag() else {
            return false;
        };

        if INTERACTIVE_TAGS.contains(&tag)
            || CONTEXT_TAGS.contains(&tag)
            || self.custom_interactive_tags.iter().any(|t| t == tag)
        {
            return true;
        }

        if let Some(role) = node.attr("role") {
            if INTERACTIVE_ROLES.contains(&role.joined().to_ascii_lowercase().as_str()) {
                return true;
            }
        }

        if let Some(type_attr) = node.attr("type") {
            if INPUT_TYPE_VALUES.contains(&type_attr.joined().as_str()) {
                return true;
            }
        }

        if let Some(placeholder) = node.attr("placeholder") {
            if !placeholder.joined().is_empty() && !GENERIC_CONTAINER_TAGS.contains(&tag) {
                return true;
            }
        }

        tag == "label" && node.attr("for").is_some()
    }

    /// Pass 3: walk upward from every seed, marking unmarked parents
    /// as ancestors. The visited set is an efficiency guard; the tree
    /// is acyclic so correctness does not depend on it.
    fn mark_ancestors(&self, tree: &mut DomTree, seeds: Vec<NodeId>) {
        let mut visited: HashSet<NodeId> = seeds.iter().copied().collect();
        let mut queue: VecDeque<NodeId> = seeds.into();

        while let Some(id) = queue.pop_front() {
            let Some(parent) = tree.node(id).parent else {
                continue; // document root
            };
            if !visited.insert(parent) {
                continue;
            }
            let parent_node = tree.node_mut(parent);
            if matches!(parent_node.data, NodeData::Document) {
                continue;
            }
            // A parent that is itself a seed keeps its seed mark.
            if parent_node.mark != Some(Mark::Seed) {
                parent_node.mark = Some(Mark::Ancestor);
            }
            queue.push_back(parent);
        }
    }

    /// Pass 4: everything inside a seed survives. Ancestor-marked
    /// nodes are connective tissue only, so their other children do
    /// not ride along. Nodes of a stripped type are skipped here as a
    /// safety net, though pass 1 should have removed them all.
    fn mark_descendants(&self, tree: &mut DomTree) {
        let marked_roots: Vec<NodeId> = tree
            .reachable()
            .into_iter()
            .filter(|id| tree.node(*id).mark == Some(Mark::Seed))
            .collect();

        for root in marked_roots {
            if self.is_stripped(tree, root) {
                continue;
            }
            for id in tree.descendants(root) {
                if self.is_stripped(tree, id) {
                    continue;
                }
                let node = tree.node_mut(id);
                if node.mark.is_none() {
                    node.mark = Some(Mark::Descendant);
                }
            }
        }
    }

    fn is_stripped(&self, tree: &DomTree, id: NodeId) -> bool {
        tree.node(id)
            .tag()
            .map(|tag| STRIP_TAGS.contains(&tag))
            .unwrap_or(false)
    }

    /// Pass 5: delete every element still unmarked. Text and comment
    /// nodes ride along with their parents; stray stripped-type
    /// survivors are removed regardless of mark.
    fn prune_unmarked(&self, tree: &mut DomTree) {
        for id in tree.reachable() {
            let doomed = {
                let node = tree.node(id);
                matches!(node.data, NodeData::Element { .. })
                    && (node.mark.is_none() || self.is_stripped(tree, id))
            };
            if doomed {
                tree.detach(id);
            }
        }
    }

    /// Pass 6: keep only allow-listed attributes, truncating long
    /// values. Marks live outside the attribute map in this
    /// representation, so nothing transient needs deleting here.
    fn sanitize_attributes(&self, tree: &mut DomTree) {
        for id in tree.reachable() {
            let node = tree.node_mut(id);
            if let NodeData::Element { attrs, .. } = &mut node.data {
                attrs.retain(|(name, _)| attribute_allowed(name));
                for (_, value) in attrs.iter_mut() {
                    if value.char_len() > MAX_ATTR_LEN {
                        let cut: String = value.joined().chars().take(MAX_ATTR_LEN).collect();
                        *value = AttrValue::One(format!("{cut}{TRUNCATION_MARKER}"));
                    }
                }
            }
        }
    }

    /// Pass 7: drop whitespace-only text nodes, except inside tags
    /// whose text content is verbatim.
    fn drop_blank_text(&self, tree: &mut DomTree) {
        for id in tree.reachable() {
            let node = tree.node(id);
            let NodeData::Text(text) = &node.data else {
                continue;
            };
            if !text.trim().is_empty() {
                continue;
            }
            let parent_verbatim = node
                .parent
                .and_then(|parent| tree.node(parent).tag().map(str::to_string))
                .map(|tag| VERBATIM_TEXT_TAGS.contains(&tag.as_str()))
                .unwrap_or(false);
            if !parent_verbatim {
                tree.detach(id);
            }
        }
    }
}

/// True when an attribute name survives sanitation.
pub fn attribute_allowed(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    ALLOWED_ATTRIBUTES.contains(&name.as_str())
        || name.starts_with("data-")
        || name.starts_with("aria-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::tree::attr_map;

    fn reduce(html: &str) -> String {
        DomReducer::new().reduce(html)
    }

    #[test]
    fn test_button_survives_stray_p_dropped() {
        let html = "<html><head><script>x</script></head><body><div><button id=\"go\">Go</button><p>hi</p></div></body></html>";
        let out = reduce(html);
        assert!(out.contains("<button id=\"go\">Go</button>"));
        assert!(out.contains("<div>"));
        assert!(!out.contains("script"));
        assert!(!out.contains("<head"));
        assert!(!out.contains("<p>"));
    }

    #[test]
    fn test_empty_input_yields_empty_string() {
        assert_eq!(reduce(""), "");
        assert_eq!(reduce("   \n"), "");
    }

    #[test]
    fn test_role_attribute_seeds_div() {
        let out = reduce("<html><body><div role=\"BUTTON\">ok</div><div>bye</div></body></html>");
        assert!(out.contains("role=\"BUTTON\""));
        assert!(!out.contains(">bye<"));
    }

    #[test]
    fn test_placeholder_ignored_on_generic_containers() {
        let out = reduce(
            "<html><body><div placeholder=\"x\">a</div><custom-box placeholder=\"y\">b</custom-box></body></html>",
        );
        assert!(!out.contains(">a</div>"));
        assert!(out.contains("custom-box"));
    }

    #[test]
    fn test_custom_interactive_tag() {
        let reducer = DomReducer::new().with_custom_tags(["Faceplate-Search-Input".to_string()]);
        let out = reducer
            .reduce("<html><body><faceplate-search-input></faceplate-search-input></body></html>");
        assert!(out.contains("faceplate-search-input"));
    }

    #[test]
    fn test_label_for_is_seed() {
        let out = reduce("<html><body><span><label for=\"q\">Query</label></span></body></html>");
        assert!(out.contains("<label for=\"q\">Query</label>"));
        assert!(out.contains("<span>"));
    }

    #[test]
    fn test_ancestor_children_do_not_ride_along() {
        // The div is connective tissue for the button; its unmarked
        // span sibling must not survive through it.
        let out =
            reduce("<html><body><div><button>go</button><span>noise</span></div></body></html>");
        assert!(out.contains("<button>go</button>"));
        assert!(!out.contains("noise"));
    }

    #[test]
    fn test_descendants_of_context_survive() {
        let out = reduce("<html><body><form><p>note</p></form></body></html>");
        assert!(out.contains("<form>"));
        assert!(out.contains("<p>note</p>"));
    }

    #[test]
    fn test_attribute_allow_list_and_truncation() {
        let long = "z".repeat(200);
        let html = format!(
            "<html><body><button id=\"b\" onclick=\"evil()\" data-testid=\"t\" aria-label=\"L\" title=\"{long}\">x</button></body></html>"
        );
        let out = reduce(&html);
        assert!(out.contains("id=\"b\""));
        assert!(out.contains("data-testid=\"t\""));
        assert!(out.contains("aria-label=\"L\""));
        assert!(!out.contains("onclick"));
        let expected = format!("{}{}", "z".repeat(MAX_ATTR_LEN), TRUNCATION_MARKER);
        assert!(out.contains(&expected));
    }

    #[test]
    fn test_idempotent_on_own_output() {
        let html = "<html><head><style>s</style></head><body><div><a href=\"/x\">link</a></div><section><span>junk</span></section></body></html>";
        let once = reduce(html);
        let twice = reduce(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_whitespace_text_kept_in_pre() {
        let out = reduce(
            "<html><body><form><pre>  </pre><div>  </div></form></body></html>",
        );
        assert!(out.contains("<pre>  </pre>"));
        assert!(!out.contains("<div>  </div>"));
    }

    #[test]
    fn test_seed_mark_never_downgraded() {
        // A form containing a button: both seeds, ancestor walk must
        // not overwrite the form's seed mark.
        let mut tree = DomTree::parse(
            "<html><body><form><button>go</button></form></body></html>",
        );
        let reducer = DomReducer::new();
        reducer.strip_noncontent(&mut tree);
        let seeds = reducer.mark_seeds(&mut tree);
        reducer.mark_ancestors(&mut tree, seeds);
        let form = tree.find_tag("form").unwrap();
        assert_eq!(tree.node(form).mark, Some(Mark::Seed));
    }

    #[test]
    fn test_attr_map_helper() {
        let tree = DomTree::parse("<html><body><a href=\"/h\" id=\"l\">x</a></body></html>");
        let a = tree.find_tag("a").unwrap();
        let map = attr_map(tree.node(a));
        assert_eq!(map.get("href").map(String::as_str), Some("/h"));
        assert_eq!(map.get("id").map(String::as_str), Some("l"));
    }
}
