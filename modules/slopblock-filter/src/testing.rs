// Test doubles for the filter pipeline.
//
// Three fakes matching the three collaborator seams:
// - FakeDocument / FakeNode (Document, DomNode): in-memory element tree
// - MockClassifier (RemoteClassifier): scripted verdicts, records calls
// - FailingStore (KeyValueStore): every call errors, like a torn-down host
//
// Plus `post()` for building feed-shaped nodes and `wait_until()` for
// asserting on the background watch loop.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use ai_client::AiError;
use slopblock_common::RemoteVerdict;

use crate::dispatcher::{ClassifyError, ClassifyRequest, RemoteClassifier};
use crate::dom::{Document, DomNode, Mutation, MutationStream, NodeKey, NodeRef, Query};
use crate::store::{KeyValueStore, StoreArea};

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// FakeNode
// ---------------------------------------------------------------------------

/// In-memory element or text leaf.
///
/// `set_markup` understands markup this node previously produced (restoring
/// the original children); anything else becomes a single raw leaf.
pub struct FakeNode {
    key: NodeKey,
    tag: String,
    text: Option<String>,
    attrs: Mutex<BTreeMap<String, String>>,
    children: Mutex<Vec<Arc<FakeNode>>>,
    rendered: Mutex<HashMap<String, Vec<Arc<FakeNode>>>>,
    connected: AtomicBool,
    panics: bool,
}

impl std::fmt::Debug for FakeNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeNode")
            .field("key", &self.key)
            .field("tag", &self.tag)
            .finish()
    }
}

impl FakeNode {
    fn build(tag: &str, text: Option<String>) -> Self {
        Self {
            key: NEXT_KEY.fetch_add(1, Ordering::Relaxed),
            tag: tag.to_string(),
            text,
            attrs: Mutex::new(BTreeMap::new()),
            children: Mutex::new(Vec::new()),
            rendered: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
            panics: false,
        }
    }

    pub fn el(tag: &str) -> Self {
        Self::build(tag, None)
    }

    pub fn text(content: &str) -> Self {
        Self::build("#text", Some(content.to_string()))
    }

    fn raw(markup: &str) -> Self {
        Self::build("#raw", Some(markup.to_string()))
    }

    pub fn with_attr(self, name: &str, value: &str) -> Self {
        lock(&self.attrs).insert(name.to_string(), value.to_string());
        self
    }

    pub fn test_id(self, id: &str) -> Self {
        self.with_attr("data-testid", id)
    }

    pub fn child(self, child: FakeNode) -> Self {
        lock(&self.children).push(Arc::new(child));
        self
    }

    /// Panic on any content read, like a host node torn down mid-scan.
    pub fn panicking(mut self) -> Self {
        self.panics = true;
        self
    }

    fn check_readable(&self) {
        if self.panics {
            panic!("node {} is unreadable", self.key);
        }
    }

    pub fn into_ref(self) -> Arc<FakeNode> {
        Arc::new(self)
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Relaxed);
        for child in lock(&self.children).iter() {
            child.disconnect();
        }
    }

    fn is_leaf(&self) -> bool {
        self.text.is_some()
    }

    fn leaf_text(&self) -> String {
        match (self.tag.as_str(), &self.text) {
            ("#raw", Some(markup)) => strip_tags(markup),
            (_, Some(text)) => text.clone(),
            _ => String::new(),
        }
    }

    fn outer_markup(&self) -> String {
        match (self.tag.as_str(), &self.text) {
            ("#raw", Some(markup)) => markup.clone(),
            (_, Some(text)) => escape(text),
            _ => {
                let attrs: String = lock(&self.attrs)
                    .iter()
                    .map(|(k, v)| format!(" {k}=\"{}\"", escape(v)))
                    .collect();
                format!("<{}{attrs}>{}</{}>", self.tag, self.inner_markup(), self.tag)
            }
        }
    }

    fn inner_markup(&self) -> String {
        lock(&self.children)
            .iter()
            .map(|c| c.outer_markup())
            .collect()
    }

    fn collect(&self, query: &Query<'_>, out: &mut Vec<NodeRef>) {
        for child in lock(&self.children).iter() {
            if child.matches(query) {
                out.push(child.clone() as NodeRef);
            }
            child.collect(query, out);
        }
    }

    fn collect_leaves(&self, out: &mut Vec<String>) {
        if self.is_leaf() {
            out.push(self.leaf_text());
            return;
        }
        for child in lock(&self.children).iter() {
            child.collect_leaves(out);
        }
    }
}

impl DomNode for FakeNode {
    fn key(&self) -> NodeKey {
        self.key
    }

    fn matches(&self, query: &Query<'_>) -> bool {
        if self.is_leaf() {
            return false;
        }
        let attrs = lock(&self.attrs);
        match query {
            Query::TestId(id) => attrs.get("data-testid").map(String::as_str) == Some(*id),
            Query::HasAttr(name) => attrs.contains_key(*name),
            Query::AttrEquals(name, value) => attrs.get(*name).map(String::as_str) == Some(*value),
            Query::LinkContaining(fragment) => {
                self.tag == "a" && attrs.get("href").is_some_and(|h| h.contains(fragment))
            }
        }
    }

    fn select_all(&self, query: &Query<'_>) -> Vec<NodeRef> {
        self.check_readable();
        let mut out = Vec::new();
        self.collect(query, &mut out);
        out
    }

    fn text(&self) -> String {
        self.text_leaves().concat()
    }

    fn text_leaves(&self) -> Vec<String> {
        self.check_readable();
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn attr(&self, name: &str) -> Option<String> {
        lock(&self.attrs).get(name).cloned()
    }

    fn set_attr(&self, name: &str, value: &str) {
        lock(&self.attrs).insert(name.to_string(), value.to_string());
    }

    fn remove_attr(&self, name: &str) {
        lock(&self.attrs).remove(name);
    }

    fn markup(&self) -> String {
        let markup = self.inner_markup();
        let children = lock(&self.children).clone();
        lock(&self.rendered).insert(markup.clone(), children);
        markup
    }

    fn set_markup(&self, markup: &str) {
        let known = lock(&self.rendered).get(markup).cloned();
        let mut children = lock(&self.children);
        *children = match known {
            Some(previous) => previous,
            None => vec![Arc::new(FakeNode::raw(markup))],
        };
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn strip_tags(markup: &str) -> String {
    let mut out = String::new();
    let mut in_tag = false;
    for ch in markup.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

/// A feed post shaped like the target layout: author block, body text,
/// optional permalink, action bar with counts.
pub fn post(author: &str, text: &str, status_id: Option<&str>) -> FakeNode {
    let mut header = FakeNode::el("div").test_id("User-Name").child(
        FakeNode::el("a")
            .with_attr("href", &format!("/{author}"))
            .child(FakeNode::text(&format!("@{author}"))),
    );
    if let Some(id) = status_id {
        header = header.child(
            FakeNode::el("a")
                .with_attr("href", &format!("/{author}/status/{id}"))
                .child(FakeNode::el("time").child(FakeNode::text("3h"))),
        );
    }

    FakeNode::el("article")
        .test_id("tweet")
        .child(header)
        .child(
            FakeNode::el("div")
                .test_id("tweetText")
                .with_attr("lang", "en")
                .child(FakeNode::text(text)),
        )
        .child(
            FakeNode::el("div")
                .with_attr("role", "group")
                .child(FakeNode::el("button").test_id("reply").child(FakeNode::text("0")))
                .child(FakeNode::el("button").test_id("retweet").child(FakeNode::text("0")))
                .child(FakeNode::el("button").test_id("like").child(FakeNode::text("0"))),
        )
}

// ---------------------------------------------------------------------------
// FakeDocument
// ---------------------------------------------------------------------------

/// In-memory document. `append` and `navigate` emit mutations to every
/// live subscriber.
pub struct FakeDocument {
    root: Arc<FakeNode>,
    location: Mutex<String>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Mutation>>>,
}

impl FakeDocument {
    pub fn new(url: &str) -> Arc<Self> {
        Arc::new(Self {
            root: FakeNode::el("body").into_ref(),
            location: Mutex::new(url.to_string()),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Insert without notifying, like content present before the observer
    /// was attached.
    pub fn seed(&self, node: FakeNode) -> Arc<FakeNode> {
        let node = Arc::new(node);
        lock(&self.root.children).push(node.clone());
        node
    }

    /// Insert and notify subscribers.
    pub fn append(&self, node: FakeNode) -> Arc<FakeNode> {
        let node = self.seed(node);
        self.emit(Mutation::Added(vec![node.clone() as NodeRef]));
        node
    }

    /// Replace the whole tree and notify a navigation.
    pub fn navigate(&self, url: &str, nodes: Vec<FakeNode>) -> Vec<Arc<FakeNode>> {
        {
            let mut children = lock(&self.root.children);
            for old in children.iter() {
                old.disconnect();
            }
            children.clear();
        }
        *lock(&self.location) = url.to_string();
        self.emit(Mutation::Navigated {
            url: url.to_string(),
        });
        nodes.into_iter().map(|n| self.seed(n)).collect()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers)
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    fn emit(&self, mutation: Mutation) {
        lock(&self.subscribers).retain(|tx| tx.send(mutation.clone()).is_ok());
    }
}

impl Document for FakeDocument {
    fn query_all(&self, query: &Query<'_>) -> Vec<NodeRef> {
        self.root.select_all(query)
    }

    fn location(&self) -> String {
        lock(&self.location).clone()
    }

    fn subscribe(&self) -> MutationStream {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers).push(tx);
        rx
    }
}

// ---------------------------------------------------------------------------
// MockClassifier
// ---------------------------------------------------------------------------

type FlagFn = dyn Fn(&str) -> bool + Send + Sync;

enum Behavior {
    Flag(Box<FlagFn>),
    Status(u16),
    Malformed,
}

/// Scripted remote classifier. Records every request it receives.
pub struct MockClassifier {
    behavior: Behavior,
    gate: Option<Arc<Notify>>,
    calls: Mutex<Vec<ClassifyRequest>>,
}

impl MockClassifier {
    /// Flag every text for which `f` returns true.
    pub fn flagging(f: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self {
            behavior: Behavior::Flag(Box::new(f)),
            gate: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Fail every call as if the endpoint answered with `status`.
    pub fn failing_with_status(status: u16) -> Self {
        Self {
            behavior: Behavior::Status(status),
            gate: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Answer every call with a payload missing `results`.
    pub fn malformed() -> Self {
        Self {
            behavior: Behavior::Malformed,
            gate: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Hold each response until `gate` is notified.
    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> Vec<ClassifyRequest> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }
}

#[async_trait]
impl RemoteClassifier for MockClassifier {
    async fn classify(
        &self,
        request: &ClassifyRequest,
    ) -> std::result::Result<Vec<RemoteVerdict>, ClassifyError> {
        lock(&self.calls).push(request.clone());

        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        match &self.behavior {
            Behavior::Flag(f) => Ok(request
                .texts
                .iter()
                .enumerate()
                .map(|(id, text)| RemoteVerdict {
                    id,
                    is_slop: f(text),
                    confidence: 0.9,
                })
                .collect()),
            Behavior::Status(status) => Err(ClassifyError::Transport(AiError::from_status(
                *status,
                "mock failure".to_string(),
            ))),
            Behavior::Malformed => Err(ClassifyError::Malformed(
                "missing results array".to_string(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// FailingStore
// ---------------------------------------------------------------------------

/// Store whose host context is gone: every call fails.
pub struct FailingStore;

#[async_trait]
impl KeyValueStore for FailingStore {
    async fn get(&self, _area: StoreArea, key: &str) -> Result<Option<serde_json::Value>> {
        bail!("Extension context invalidated (get {key})")
    }

    async fn set(&self, _area: StoreArea, key: &str, _value: serde_json::Value) -> Result<()> {
        bail!("Extension context invalidated (set {key})")
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Poll `cond` every few milliseconds until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
