//! Capability interface over the host page.
//!
//! The pipeline never touches a real DOM. A host bridge (or the in-memory
//! tree in `testing`) implements [`Document`] and [`DomNode`]; everything
//! else is written against these traits.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

/// Identity of a live node, stable for as long as the host keeps the node.
/// A re-rendered post is a new node with a new key.
pub type NodeKey = u64;

pub type NodeRef = Arc<dyn DomNode>;

/// The handful of selector shapes the feed layout needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query<'a> {
    /// `[data-testid="…"]`
    TestId(&'a str),
    /// `[attr]`
    HasAttr(&'a str),
    /// `[attr="value"]`
    AttrEquals(&'a str, &'a str),
    /// `a[href*="…"]`
    LinkContaining(&'a str),
}

impl Query<'_> {
    /// CSS form, for bridges backed by `querySelectorAll`.
    pub fn to_css(&self) -> String {
        match self {
            Query::TestId(id) => format!("[data-testid=\"{id}\"]"),
            Query::HasAttr(attr) => format!("[{attr}]"),
            Query::AttrEquals(attr, value) => format!("[{attr}=\"{value}\"]"),
            Query::LinkContaining(fragment) => format!("a[href*=\"{fragment}\"]"),
        }
    }
}

impl fmt::Display for Query<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_css())
    }
}

/// One element of the host tree. Not owned by the pipeline.
pub trait DomNode: Send + Sync + fmt::Debug {
    fn key(&self) -> NodeKey;

    /// Whether this node itself matches `query`.
    fn matches(&self, query: &Query<'_>) -> bool;

    /// Matching descendants in document order (not including `self`).
    fn select_all(&self, query: &Query<'_>) -> Vec<NodeRef>;

    fn select(&self, query: &Query<'_>) -> Option<NodeRef> {
        self.select_all(query).into_iter().next()
    }

    /// Concatenated text of all descendants (`textContent`).
    fn text(&self) -> String;

    /// Text of each text-bearing leaf, in document order.
    fn text_leaves(&self) -> Vec<String>;

    fn attr(&self, name: &str) -> Option<String>;
    fn set_attr(&self, name: &str, value: &str);
    fn remove_attr(&self, name: &str);

    /// Rendered inner content (`innerHTML`).
    fn markup(&self) -> String;
    fn set_markup(&self, markup: &str);

    /// False once the host has dropped the node from the tree.
    fn is_connected(&self) -> bool;
}

/// A coalescable change notification from the host.
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Subtrees inserted into the document.
    Added(Vec<NodeRef>),
    /// Client-side navigation: URL changed without a reload.
    Navigated { url: String },
}

pub type MutationStream = mpsc::UnboundedReceiver<Mutation>;

/// The live document.
pub trait Document: Send + Sync {
    fn query_all(&self, query: &Query<'_>) -> Vec<NodeRef>;

    fn location(&self) -> String;

    /// Start receiving mutations. Dropping the stream unsubscribes.
    fn subscribe(&self) -> MutationStream;
}
