//! Element registry and in-memory document
//!
//! The trigger only needs a handful of host capabilities: find an element by
//! id, create a hidden frame, point a frame at a URL and remove every frame.
//! [`ElementRegistry`] captures exactly that, and [`Document`] implements it
//! over a small node arena so the trigger can run without a rendering host.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, Result};

/// Tag name of frame elements
pub const FRAME_TAG: &str = "iframe";

/// Status record produced by a frame load handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    pub status: String,
    pub mensagem: String,
}

/// Callback run when a frame finishes loading
pub type LoadHandler = fn() -> LoadReport;

/// Host capability used to issue and clean up frame navigations
pub trait ElementRegistry {
    /// Opaque reference to an element owned by the registry
    type Handle: Copy + PartialEq + std::fmt::Debug;

    /// Look up an attached element by its id
    fn find_by_id(&self, id: &str) -> Option<Self::Handle>;

    /// Create a non-visible frame with `id`, attach `on_load` and insert it
    fn create_hidden_frame(&mut self, id: &str, on_load: LoadHandler) -> Self::Handle;

    /// Set the frame's navigation target
    fn navigate(&mut self, frame: Self::Handle, url: &str);

    /// Remove every frame element, returning how many were removed
    fn remove_all_frames(&mut self) -> usize;

    /// Reuse the element registered under `id`, or create the hidden frame.
    /// The flag reports whether a frame was created.
    fn get_or_create_frame(&mut self, id: &str, on_load: LoadHandler) -> (Self::Handle, bool) {
        match self.find_by_id(id) {
            Some(existing) => (existing, false),
            None => (self.create_hidden_frame(id, on_load), true),
        }
    }
}

/// Index of a node in a [`Document`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone)]
struct Node {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    element: Option<Element>,
}

#[derive(Debug, Clone)]
struct Element {
    tag_name: String,
    attrs: HashMap<String, String>,
    style: HashMap<String, String>,
    on_load: Option<LoadHandler>,
}

/// A navigation the host would perform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Navigation {
    pub frame: NodeId,
    pub url: String,
}

/// Minimal document: a root, a body and the elements hanging from it
#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<Node>,
    root: NodeId,
    body: NodeId,
    navigations: Vec<Navigation>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        let mut document = Self {
            nodes: vec![Node {
                parent: None,
                children: Vec::new(),
                element: None,
            }],
            root: NodeId(0),
            body: NodeId(0),
            navigations: Vec::new(),
        };
        let body = document.create_element("body");
        document.nodes[body.0].parent = Some(document.root);
        document.nodes[document.root.0].children.push(body);
        document.body = body;
        document
    }

    pub fn body(&self) -> NodeId {
        self.body
    }

    /// Create a detached element
    pub fn create_element(&mut self, tag_name: &str) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            parent: None,
            children: Vec::new(),
            element: Some(Element {
                tag_name: tag_name.to_ascii_lowercase(),
                attrs: HashMap::new(),
                style: HashMap::new(),
                on_load: None,
            }),
        });
        id
    }

    pub fn tag_name(&self, node: NodeId) -> Option<&str> {
        self.element(node).map(|e| e.tag_name.as_str())
    }

    pub fn attribute(&self, node: NodeId, name: &str) -> Option<&str> {
        self.element(node)
            .and_then(|e| e.attrs.get(name))
            .map(String::as_str)
    }

    pub fn set_attribute(&mut self, node: NodeId, name: &str, value: &str) -> Result<()> {
        let element = self.element_mut(node)?;
        element.attrs.insert(name.to_string(), value.to_string());
        Ok(())
    }

    pub fn style(&self, node: NodeId, property: &str) -> Option<&str> {
        self.element(node)
            .and_then(|e| e.style.get(property))
            .map(String::as_str)
    }

    pub fn set_style(&mut self, node: NodeId, property: &str, value: &str) -> Result<()> {
        let element = self.element_mut(node)?;
        element.style.insert(property.to_string(), value.to_string());
        Ok(())
    }

    pub fn set_on_load(&mut self, node: NodeId, handler: LoadHandler) -> Result<()> {
        self.element_mut(node)?.on_load = Some(handler);
        Ok(())
    }

    /// Append `child` under `parent`, detaching it from any previous parent
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        self.check(parent)?;
        self.check(child)?;
        if child == self.root || child == parent || self.is_descendant_of(parent, child) {
            return Err(Error::InvalidInput(
                "appendChild would create a cycle".to_string(),
            ));
        }
        self.detach(child);
        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].children.push(child);
        Ok(())
    }

    /// Remove `node` from its parent; detached nodes are left as they are
    pub fn remove_node(&mut self, node: NodeId) -> Result<()> {
        self.check(node)?;
        if node == self.root {
            return Err(Error::InvalidInput("cannot remove document root".to_string()));
        }
        self.detach(node);
        Ok(())
    }

    /// Whether `node` is reachable from the document root
    pub fn is_attached(&self, node: NodeId) -> bool {
        node == self.root || self.is_descendant_of(node, self.root)
    }

    /// First attached element whose `id` attribute matches, in document order
    pub fn get_element_by_id(&self, id: &str) -> Option<NodeId> {
        self.walk()
            .into_iter()
            .find(|node| self.attribute(*node, "id") == Some(id))
    }

    /// Attached elements with the given tag, in document order
    pub fn query_selector_all(&self, tag_name: &str) -> Vec<NodeId> {
        self.walk()
            .into_iter()
            .filter(|node| {
                self.tag_name(*node)
                    .is_some_and(|tag| tag.eq_ignore_ascii_case(tag_name))
            })
            .collect()
    }

    /// Attached frame elements
    pub fn frames(&self) -> Vec<NodeId> {
        self.query_selector_all(FRAME_TAG)
    }

    /// Fire the load event of `node`, attached or not, and return what its
    /// handler produced
    pub fn dispatch_load(&self, node: NodeId) -> Option<LoadReport> {
        self.element(node)
            .and_then(|e| e.on_load)
            .map(|handler| handler())
    }

    /// Navigations requested so far, oldest first
    pub fn navigations(&self) -> &[Navigation] {
        &self.navigations
    }

    /// Drain the navigations the host has not processed yet
    pub fn take_navigations(&mut self) -> Vec<Navigation> {
        std::mem::take(&mut self.navigations)
    }

    fn element(&self, node: NodeId) -> Option<&Element> {
        self.nodes.get(node.0).and_then(|n| n.element.as_ref())
    }

    fn element_mut(&mut self, node: NodeId) -> Result<&mut Element> {
        self.nodes
            .get_mut(node.0)
            .and_then(|n| n.element.as_mut())
            .ok_or_else(|| Error::InvalidInput(format!("node {} is not an element", node.0)))
    }

    fn check(&self, node: NodeId) -> Result<()> {
        if node.0 < self.nodes.len() {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!("unknown node {}", node.0)))
        }
    }

    fn detach(&mut self, node: NodeId) {
        if let Some(parent) = self.nodes[node.0].parent.take() {
            self.nodes[parent.0].children.retain(|id| *id != node);
        }
    }

    fn is_descendant_of(&self, node: NodeId, ancestor: NodeId) -> bool {
        let mut cursor = self.nodes.get(node.0).and_then(|n| n.parent);
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            cursor = self.nodes[current.0].parent;
        }
        false
    }

    /// Pre-order traversal of attached nodes, root excluded
    fn walk(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.nodes[self.root.0].children.iter().rev().copied().collect();
        while let Some(node) = stack.pop() {
            out.push(node);
            stack.extend(self.nodes[node.0].children.iter().rev().copied());
        }
        out
    }
}

impl ElementRegistry for Document {
    type Handle = NodeId;

    fn find_by_id(&self, id: &str) -> Option<NodeId> {
        self.get_element_by_id(id)
    }

    fn create_hidden_frame(&mut self, id: &str, on_load: LoadHandler) -> NodeId {
        let frame = NodeId(self.nodes.len());
        self.nodes.push(Node {
            parent: Some(self.body),
            children: Vec::new(),
            element: Some(Element {
                tag_name: FRAME_TAG.to_string(),
                attrs: HashMap::from([("id".to_string(), id.to_string())]),
                style: HashMap::from([("display".to_string(), "none".to_string())]),
                on_load: Some(on_load),
            }),
        });
        self.nodes[self.body.0].children.push(frame);
        frame
    }

    fn navigate(&mut self, frame: NodeId, url: &str) {
        if let Some(Some(element)) = self.nodes.get_mut(frame.0).map(|n| n.element.as_mut()) {
            element.attrs.insert("src".to_string(), url.to_string());
            self.navigations.push(Navigation {
                frame,
                url: url.to_string(),
            });
        }
    }

    fn remove_all_frames(&mut self) -> usize {
        let frames = self.frames();
        for frame in &frames {
            self.detach(*frame);
        }
        frames.len()
    }
}
