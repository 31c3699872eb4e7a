use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

use super::{
    Document, MutationBatch, MutationKind, MutationObserver, MutationRecord, NodeId,
    ObserveOptions, ObserverSink,
};
use crate::{Error, Result};

const TRANSPARENT: &str = "rgba(0, 0, 0, 0)";

#[derive(Debug)]
enum NodeData {
    Element {
        tag: String,
        attributes: BTreeMap<String, String>,
    },
    Text(String),
}

#[derive(Debug)]
struct Node {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    data: NodeData,
}

#[derive(Debug)]
struct Tree {
    nodes: HashMap<NodeId, Node>,
    next_id: u64,
    root: NodeId,
    body: NodeId,
}

struct Registration {
    target: NodeId,
    options: ObserveOptions,
    sink: ObserverSink,
}

/// In-memory page tree.
///
/// Starts as `<html><body></body></html>`. Removed nodes keep their ids and
/// can be queried or re-inserted, like detached DOM nodes. Every mutation is
/// delivered to matching observers as its own batch.
pub struct MemoryDocument {
    tree: RwLock<Tree>,
    observers: Mutex<Vec<Registration>>,
}

impl Default for MemoryDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocument {
    pub fn new() -> Self {
        let mut tree = Tree {
            nodes: HashMap::new(),
            next_id: 1,
            root: NodeId(0),
            body: NodeId(0),
        };
        let root = tree.insert(NodeData::element("html", &[]));
        let body = tree.insert(NodeData::element("body", &[]));
        tree.attach(root, body);
        tree.root = root;
        tree.body = body;

        Self {
            tree: RwLock::new(tree),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// The body element
    pub fn body_node(&self) -> NodeId {
        self.tree.read().body
    }

    /// Creates a detached element
    pub fn create_element(&self, tag: &str, attributes: &[(&str, &str)]) -> NodeId {
        self.tree.write().insert(NodeData::element(tag, attributes))
    }

    /// Creates a detached text node
    pub fn create_text(&self, text: &str) -> NodeId {
        self.tree.write().insert(NodeData::Text(text.to_string()))
    }

    /// Creates an element and appends it to `parent`
    pub fn append_element(&self, parent: NodeId, tag: &str, attributes: &[(&str, &str)]) -> NodeId {
        let node = self.create_element(tag, attributes);
        self.append_child(parent, node);
        node
    }

    /// Creates a text node and appends it to `parent`
    pub fn append_text(&self, parent: NodeId, text: &str) -> NodeId {
        let node = self.create_text(text);
        self.append_child(parent, node);
        node
    }

    /// Moves `child` to the end of `parent`'s children
    pub fn append_child(&self, parent: NodeId, child: NodeId) {
        let mut records = Vec::new();
        {
            let mut tree = self.tree.write();
            if let Some(old) = tree.detach(child) {
                records.push(MutationRecord::child_list(old));
            }
            tree.attach(parent, child);
        }
        records.push(MutationRecord::child_list(parent));
        self.dispatch(records);
    }

    /// Detaches a node from its parent
    pub fn remove(&self, node: NodeId) {
        let old = self.tree.write().detach(node);
        if let Some(parent) = old {
            self.dispatch(vec![MutationRecord::child_list(parent)]);
        }
    }

    /// Puts `replacement` where `old` was; `old` becomes detached
    pub fn replace_with(&self, old: NodeId, replacement: NodeId) {
        let parent = {
            let mut tree = self.tree.write();
            let Some(parent) = tree.nodes.get(&old).and_then(|n| n.parent) else {
                return;
            };
            tree.detach(replacement);
            let index = tree.nodes[&parent]
                .children
                .iter()
                .position(|c| *c == old)
                .unwrap_or(0);
            tree.detach(old);
            if let Some(p) = tree.nodes.get_mut(&parent) {
                p.children.insert(index, replacement);
            }
            if let Some(n) = tree.nodes.get_mut(&replacement) {
                n.parent = Some(parent);
            }
            parent
        };
        self.dispatch(vec![MutationRecord::child_list(parent)]);
    }

    pub fn set_attribute(&self, node: NodeId, name: &str, value: &str) {
        let changed = {
            let mut tree = self.tree.write();
            match tree.nodes.get_mut(&node).map(|n| &mut n.data) {
                Some(NodeData::Element { attributes, .. }) => {
                    attributes.insert(name.to_string(), value.to_string());
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.dispatch(vec![MutationRecord {
                target: node,
                kind: MutationKind::Attributes(name.to_string()),
            }]);
        }
    }

    pub fn remove_attribute(&self, node: NodeId, name: &str) {
        let changed = {
            let mut tree = self.tree.write();
            match tree.nodes.get_mut(&node).map(|n| &mut n.data) {
                Some(NodeData::Element { attributes, .. }) => attributes.remove(name).is_some(),
                _ => false,
            }
        };
        if changed {
            self.dispatch(vec![MutationRecord {
                target: node,
                kind: MutationKind::Attributes(name.to_string()),
            }]);
        }
    }

    /// `textContent` assignment.
    ///
    /// On an element this replaces all children with one text node; on a
    /// text node it rewrites the data in place.
    pub fn set_text(&self, node: NodeId, text: &str) {
        let record = {
            let mut tree = self.tree.write();
            let is_text = match tree.nodes.get_mut(&node).map(|n| &mut n.data) {
                Some(NodeData::Text(data)) => {
                    *data = text.to_string();
                    true
                }
                Some(NodeData::Element { .. }) => false,
                None => return,
            };
            if is_text {
                MutationRecord {
                    target: node,
                    kind: MutationKind::CharacterData,
                }
            } else {
                let children = tree
                    .nodes
                    .get_mut(&node)
                    .map(|n| std::mem::take(&mut n.children))
                    .unwrap_or_default();
                for child in children {
                    if let Some(c) = tree.nodes.get_mut(&child) {
                        c.parent = None;
                    }
                }
                if !text.is_empty() {
                    let child = tree.insert(NodeData::Text(text.to_string()));
                    tree.attach(node, child);
                }
                MutationRecord::child_list(node)
            }
        };
        self.dispatch(vec![record]);
    }

    fn dispatch(&self, records: MutationBatch) {
        let tree = self.tree.read();
        let mut observers = self.observers.lock();
        observers.retain(|registration| {
            if !registration.sink.is_active() {
                return false;
            }
            let batch: MutationBatch = records
                .iter()
                .filter(|r| {
                    registration.options.accepts(&r.kind)
                        && (r.target == registration.target
                            || (registration.options.subtree
                                && tree.is_ancestor(registration.target, r.target)))
                })
                .cloned()
                .collect();
            if batch.is_empty() {
                return true;
            }
            trace!(
                "Delivering {} mutation(s) to observer on {}",
                batch.len(),
                registration.target
            );
            registration.sink.deliver(batch)
        });
    }
}

impl NodeData {
    fn element(tag: &str, attributes: &[(&str, &str)]) -> Self {
        NodeData::Element {
            tag: tag.to_ascii_lowercase(),
            attributes: attributes
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

impl MutationRecord {
    fn child_list(target: NodeId) -> Self {
        Self {
            target,
            kind: MutationKind::ChildList,
        }
    }
}

impl Tree {
    fn insert(&mut self, data: NodeData) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(
            id,
            Node {
                parent: None,
                children: Vec::new(),
                data,
            },
        );
        id
    }

    fn attach(&mut self, parent: NodeId, child: NodeId) {
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.push(child);
        }
        if let Some(c) = self.nodes.get_mut(&child) {
            c.parent = Some(parent);
        }
    }

    /// Unlinks a node, returning its former parent
    fn detach(&mut self, node: NodeId) -> Option<NodeId> {
        let parent = self.nodes.get_mut(&node)?.parent.take()?;
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.retain(|c| *c != node);
        }
        Some(parent)
    }

    fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = self.nodes.get(&node).and_then(|n| n.parent);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.nodes.get(&id).and_then(|n| n.parent);
        }
        false
    }

    fn is_connected(&self, node: NodeId) -> bool {
        node == self.root || self.is_ancestor(self.root, node)
    }

    /// Pre-order walk starting at `start`
    fn walk(&self, start: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            order.push(id);
            stack.extend(node.children.iter().rev());
        }
        order
    }

    fn elements(&self) -> Vec<NodeId> {
        self.walk(self.root)
            .into_iter()
            .filter(|id| matches!(self.nodes[id].data, NodeData::Element { .. }))
            .collect()
    }

    fn attribute(&self, node: NodeId, name: &str) -> Option<&str> {
        match &self.nodes.get(&node)?.data {
            NodeData::Element { attributes, .. } => attributes.get(name).map(String::as_str),
            NodeData::Text(_) => None,
        }
    }

    fn text_content(&self, node: NodeId) -> String {
        self.walk(node)
            .into_iter()
            .filter_map(|id| match &self.nodes[&id].data {
                NodeData::Text(text) => Some(text.as_str()),
                NodeData::Element { .. } => None,
            })
            .collect()
    }
}

impl Document for MemoryDocument {
    fn body(&self) -> Option<NodeId> {
        Some(self.tree.read().body)
    }

    fn element_by_id(&self, id: &str) -> Option<NodeId> {
        let tree = self.tree.read();
        tree.elements()
            .into_iter()
            .find(|node| tree.attribute(*node, "id") == Some(id))
    }

    fn query_selector_all(&self, selector: &str) -> Result<Vec<NodeId>> {
        let compound = parse_selector(selector)?;
        let tree = self.tree.read();
        Ok(tree
            .elements()
            .into_iter()
            .filter(|node| compound.iter().all(|simple| simple.matches(&tree, *node)))
            .collect())
    }

    fn all_elements(&self) -> Vec<NodeId> {
        self.tree.read().elements()
    }

    fn text_nodes(&self) -> Vec<NodeId> {
        let tree = self.tree.read();
        tree.walk(tree.body)
            .into_iter()
            .filter(|id| matches!(tree.nodes[id].data, NodeData::Text(_)))
            .collect()
    }

    fn text_content(&self, node: NodeId) -> Option<String> {
        let tree = self.tree.read();
        tree.nodes.contains_key(&node).then(|| tree.text_content(node))
    }

    fn own_text(&self, node: NodeId) -> String {
        let tree = self.tree.read();
        let Some(n) = tree.nodes.get(&node) else {
            return String::new();
        };
        n.children
            .iter()
            .filter_map(|c| match &tree.nodes[c].data {
                NodeData::Text(text) => Some(text.as_str()),
                NodeData::Element { .. } => None,
            })
            .collect()
    }

    fn element_id(&self, node: NodeId) -> Option<String> {
        self.tree.read().attribute(node, "id").map(str::to_string)
    }

    fn parent_element(&self, node: NodeId) -> Option<NodeId> {
        self.tree.read().nodes.get(&node)?.parent
    }

    fn is_connected(&self, node: NodeId) -> bool {
        self.tree.read().is_connected(node)
    }

    fn computed_background(&self, node: NodeId) -> Option<String> {
        let tree = self.tree.read();
        if !tree.is_connected(node) {
            return None;
        }
        match &tree.nodes.get(&node)?.data {
            NodeData::Element { attributes, .. } => Some(
                attributes
                    .get("style")
                    .and_then(|style| background_from_style(style))
                    .unwrap_or_else(|| TRANSPARENT.to_string()),
            ),
            NodeData::Text(_) => None,
        }
    }

    fn observe(&self, target: NodeId, options: ObserveOptions) -> MutationObserver {
        let (sink, observer) = MutationObserver::channel();
        self.observers.lock().push(Registration {
            target,
            options,
            sink,
        });
        observer
    }
}

/// Pulls the color out of an inline `background`/`background-color` declaration
fn background_from_style(style: &str) -> Option<String> {
    let mut color = None;
    for declaration in style.split(';') {
        let Some((property, value)) = declaration.split_once(':') else {
            continue;
        };
        let property = property.trim().to_ascii_lowercase();
        if property != "background" && property != "background-color" {
            continue;
        }
        let value = value.trim().to_ascii_lowercase();
        // Later declarations win, like the cascade within one style attribute
        color = Some(if let Some(start) = value.find("rgb") {
            let end = value[start..].find(')').map(|e| start + e + 1).unwrap_or(value.len());
            value[start..end].to_string()
        } else {
            match value.split_whitespace().next() {
                None | Some("none") | Some("transparent") => TRANSPARENT.to_string(),
                Some(token) => token.to_string(),
            }
        });
    }
    color
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttrOp {
    Exists,
    Equals,
    Contains,
    Prefix,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SimpleSelector {
    Tag(String),
    Id(String),
    Class(String),
    Attribute {
        name: String,
        op: AttrOp,
        value: String,
    },
}

impl SimpleSelector {
    fn matches(&self, tree: &Tree, node: NodeId) -> bool {
        let Some(NodeData::Element { tag, attributes }) = tree.nodes.get(&node).map(|n| &n.data)
        else {
            return false;
        };
        match self {
            SimpleSelector::Tag(name) => tag == name,
            SimpleSelector::Id(id) => attributes.get("id") == Some(id),
            SimpleSelector::Class(class) => attributes
                .get("class")
                .is_some_and(|c| c.split_whitespace().any(|c| c == class)),
            SimpleSelector::Attribute { name, op, value } => match attributes.get(name) {
                None => false,
                Some(actual) => match op {
                    AttrOp::Exists => true,
                    AttrOp::Equals => actual == value,
                    AttrOp::Contains => !value.is_empty() && actual.contains(value.as_str()),
                    AttrOp::Prefix => !value.is_empty() && actual.starts_with(value.as_str()),
                },
            },
        }
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// Parses one compound selector: `tag`, `#id`, `.class` and `[attr]` forms
fn parse_selector(selector: &str) -> Result<Vec<SimpleSelector>> {
    let invalid = || Error::InvalidSelector(selector.to_string());
    let mut chars = selector.trim().chars().peekable();
    let mut parts = Vec::new();

    let ident = |chars: &mut std::iter::Peekable<std::str::Chars<'_>>| {
        let mut out = String::new();
        while let Some(&c) = chars.peek() {
            if !is_ident_char(c) {
                break;
            }
            out.push(c);
            chars.next();
        }
        out
    };

    while let Some(&c) = chars.peek() {
        match c {
            '#' | '.' => {
                chars.next();
                let name = ident(&mut chars);
                if name.is_empty() {
                    return Err(invalid());
                }
                parts.push(if c == '#' {
                    SimpleSelector::Id(name)
                } else {
                    SimpleSelector::Class(name)
                });
            }
            '[' => {
                chars.next();
                let name = ident(&mut chars);
                if name.is_empty() {
                    return Err(invalid());
                }
                let op = match chars.next() {
                    Some(']') => {
                        parts.push(SimpleSelector::Attribute {
                            name,
                            op: AttrOp::Exists,
                            value: String::new(),
                        });
                        continue;
                    }
                    Some('=') => AttrOp::Equals,
                    Some('*') if chars.next() == Some('=') => AttrOp::Contains,
                    Some('^') if chars.next() == Some('=') => AttrOp::Prefix,
                    _ => return Err(invalid()),
                };
                let value = match chars.peek() {
                    Some(&quote) if quote == '"' || quote == '\'' => {
                        chars.next();
                        let mut value = String::new();
                        loop {
                            match chars.next() {
                                Some(c) if c == quote => break,
                                Some(c) => value.push(c),
                                None => return Err(invalid()),
                            }
                        }
                        value
                    }
                    _ => ident(&mut chars),
                };
                if chars.next() != Some(']') {
                    return Err(invalid());
                }
                parts.push(SimpleSelector::Attribute { name, op, value });
            }
            c if is_ident_char(c) && parts.is_empty() => {
                parts.push(SimpleSelector::Tag(ident(&mut chars).to_ascii_lowercase()));
            }
            _ => return Err(invalid()),
        }
    }

    if parts.is_empty() {
        return Err(invalid());
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> (MemoryDocument, NodeId, NodeId) {
        let doc = MemoryDocument::new();
        let grid = doc.append_element(doc.body_node(), "div", &[("id", "timergrid")]);
        let time = doc.append_element(grid, "div", &[("id", "timeDiv"), ("class", "big timer")]);
        doc.set_text(time, "01:07");
        (doc, grid, time)
    }

    #[test]
    fn test_lookup_and_text() {
        let (doc, grid, time) = page();
        assert_eq!(doc.element_by_id("timeDiv"), Some(time));
        assert_eq!(doc.text_content(grid).as_deref(), Some("01:07"));
        assert_eq!(doc.own_text(grid), "");
        assert_eq!(doc.own_text(time), "01:07");
        assert_eq!(doc.parent_element(time), Some(grid));
        assert_eq!(doc.text_nodes().len(), 1);
    }

    #[test]
    fn test_selectors() {
        let (doc, grid, time) = page();
        assert_eq!(doc.query_selector_all("[class*=\"timer\"]").unwrap(), vec![time]);
        assert_eq!(doc.query_selector_all("[id*='timer']").unwrap(), vec![grid]);
        assert_eq!(doc.query_selector_all(".timer").unwrap(), vec![time]);
        assert_eq!(doc.query_selector_all("div#timeDiv.big").unwrap(), vec![time]);
        assert_eq!(doc.query_selector_all("div").unwrap(), vec![grid, time]);
        assert!(doc.query_selector_all(".countdown").unwrap().is_empty());
        assert!(matches!(
            doc.query_selector_all("div > span"),
            Err(Error::InvalidSelector(_))
        ));
        assert!(doc.query_selector_all("[class*=").is_err());
        assert!(doc.query_selector_all("").is_err());
    }

    #[test]
    fn test_detached_nodes() {
        let (doc, grid, time) = page();
        doc.remove(grid);
        assert!(!doc.is_connected(time));
        assert_eq!(doc.element_by_id("timeDiv"), None);
        assert_eq!(doc.computed_background(time), None);

        doc.append_child(doc.body_node(), grid);
        assert!(doc.is_connected(time));
    }

    #[test]
    fn test_inline_background() {
        let (doc, grid, time) = page();
        assert_eq!(doc.computed_background(time).as_deref(), Some(TRANSPARENT));
        doc.set_attribute(grid, "style", "color: white; background: rgb(0, 128, 0) no-repeat");
        assert_eq!(doc.computed_background(grid).as_deref(), Some("rgb(0, 128, 0)"));
        doc.set_attribute(grid, "style", "background-color: transparent");
        assert_eq!(doc.computed_background(grid).as_deref(), Some(TRANSPARENT));
        doc.set_attribute(grid, "style", "background-color: red");
        assert_eq!(doc.computed_background(grid).as_deref(), Some("red"));
    }

    #[tokio::test]
    async fn test_observer_scoping() {
        let (doc, grid, time) = page();
        let mut content = doc.observe(time, ObserveOptions::content());
        let mut attrs = doc.observe(grid, ObserveOptions::attributes(&["style"]));

        doc.set_text(time, "01:06");
        let batch = content.next_batch().await.unwrap();
        assert_eq!(batch[0].kind, MutationKind::ChildList);

        doc.set_attribute(grid, "title", "ignored");
        doc.set_attribute(grid, "style", "background: rgb(1, 2, 3)");
        let batch = attrs.next_batch().await.unwrap();
        assert_eq!(batch[0].kind, MutationKind::Attributes("style".into()));

        let text = doc.text_nodes()[0];
        doc.set_text(text, "01:05");
        let batch = content.next_batch().await.unwrap();
        assert_eq!(batch[0].target, text);
        assert_eq!(batch[0].kind, MutationKind::CharacterData);
    }

    #[test]
    fn test_replace_with_keeps_position() {
        let (doc, grid, time) = page();
        let sibling = doc.append_element(grid, "span", &[]);
        let fresh = doc.create_element("div", &[("id", "timeDiv")]);
        doc.replace_with(time, fresh);
        assert!(!doc.is_connected(time));
        assert_eq!(doc.element_by_id("timeDiv"), Some(fresh));
        assert_eq!(doc.all_elements(), vec![NodeId(1), NodeId(2), grid, fresh, sibling]);
    }
}
