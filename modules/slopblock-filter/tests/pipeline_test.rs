//! End-to-end pipeline tests against the in-memory document.
//!
//! Each test seeds a FakeDocument, loads a SlopFilter over a MemoryStore
//! (or FailingStore) and a MockClassifier, and asserts on node state,
//! history and stats. No network, no real DOM.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Notify;

use slopblock_common::{FilterConfig, VerdictSource};
use slopblock_filter::presenter::Presenter;
use slopblock_filter::store::keys;
use slopblock_filter::testing::{
    post, wait_until, FailingStore, FakeDocument, FakeNode, MockClassifier,
};
use slopblock_filter::{
    ControlMessage, Disposition, FilterDeps, FilterEvent, ItemOutcome, KeyValueStore,
    MemoryStore, NodeRef, RemoteClassifier, SlopFilter, StoreArea,
};

const WAIT: Duration = Duration::from_secs(2);

fn config(batch_size: usize) -> FilterConfig {
    FilterConfig {
        batch_size,
        coalesce_window_ms: 5,
        navigation_settle_ms: 10,
        ..FilterConfig::default()
    }
}

struct Harness {
    doc: Arc<FakeDocument>,
    store: Arc<MemoryStore>,
    classifier: Option<Arc<MockClassifier>>,
    config: FilterConfig,
}

impl Harness {
    fn new(config: FilterConfig) -> Self {
        Self {
            doc: FakeDocument::new("https://x.com/home"),
            store: Arc::new(MemoryStore::new()),
            classifier: None,
            config,
        }
    }

    async fn with_remote(mut self, classifier: MockClassifier) -> Self {
        self.store
            .set(StoreArea::Synced, keys::REMOTE_ENABLED, json!(true))
            .await
            .unwrap();
        self.classifier = Some(Arc::new(classifier));
        self
    }

    async fn with_setting(self, key: &str, value: serde_json::Value) -> Self {
        self.store.set(StoreArea::Synced, key, value).await.unwrap();
        self
    }

    fn deps(&self) -> FilterDeps {
        FilterDeps {
            document: self.doc.clone(),
            store: self.store.clone(),
            classifier: self
                .classifier
                .clone()
                .map(|c| c as Arc<dyn RemoteClassifier>),
        }
    }

    async fn filter(&self) -> SlopFilter {
        SlopFilter::load(self.deps(), self.config.clone()).await.unwrap()
    }

    fn calls(&self) -> usize {
        self.classifier.as_ref().map_or(0, |c| c.call_count())
    }
}

fn clean(n: usize) -> String {
    format!("ordinary post number {n} about the weather today")
}

fn slop_text() -> String {
    let mut text = "as an AI, I believe mindset is everything 🚀🚀🚀🚀".to_string();
    while text.chars().count() <= 200 {
        text.push_str(" and that is all there is to say");
    }
    text
}

fn as_node(node: Arc<FakeNode>) -> NodeRef {
    node
}

async fn eventually(cond: impl Fn() -> bool) -> bool {
    wait_until(WAIT, || {
        let ready = cond();
        async move { ready }
    })
    .await
}

// ---------------------------------------------------------------------------
// Dedup and identity
// ---------------------------------------------------------------------------

#[tokio::test]
async fn identical_text_without_permalink_is_evaluated_once() {
    let h = Harness::new(config(10));
    h.doc.seed(post("alice", "same words here", None));
    h.doc.seed(post("bob", "same words here", None));
    let filter = h.filter().await;

    filter.enable().await;

    assert_eq!(filter.history().seen_len(), 1);
    assert_eq!(filter.stats().duplicates, 1);
    assert_eq!(filter.stats().items_processed, 1);
}

#[tokio::test]
async fn identical_text_with_distinct_permalinks_is_evaluated_twice() {
    let h = Harness::new(config(10));
    h.doc.seed(post("alice", "same words here", Some("100")));
    h.doc.seed(post("alice", "same words here", Some("200")));
    let filter = h.filter().await;

    filter.enable().await;

    assert_eq!(filter.stats().items_processed, 2);
    assert_eq!(filter.stats().duplicates, 0);
    assert!(filter.history().is_seen("100"));
    assert!(filter.history().is_seen("200"));
}

#[tokio::test]
async fn rediscovered_identifier_never_reenters_queue() {
    let h = Harness::new(config(10))
        .with_remote(MockClassifier::flagging(|_| false))
        .await;
    let filter = h.filter().await;
    filter.enable().await;

    let first = as_node(h.doc.seed(post("alice", &clean(1), Some("1"))));
    let second = as_node(h.doc.seed(post("alice", &clean(1), Some("1"))));

    assert_eq!(
        filter.process_node(&first).await,
        ItemOutcome::Processed(Disposition::Queued)
    );
    assert_eq!(
        filter.process_node(&second).await,
        ItemOutcome::Processed(Disposition::Duplicate)
    );
    assert_eq!(filter.queue_len(), 1);
}

#[tokio::test]
async fn empty_node_is_retried_not_marked_seen() {
    let h = Harness::new(config(10));
    let filter = h.filter().await;
    filter.enable().await;

    let empty = as_node(h.doc.seed(FakeNode::el("article").test_id("tweet")));
    assert!(matches!(
        filter.process_node(&empty).await,
        ItemOutcome::SkipRetry(_)
    ));
    assert_eq!(filter.history().seen_len(), 0);

    // Still pending for the next scan.
    let outcomes = filter.scan_document().await;
    assert_eq!(outcomes.len(), 1);
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[tokio::test]
async fn history_stays_bounded() {
    let h = Harness::new(FilterConfig {
        max_history_items: 5,
        history_drop_count: 2,
        ..config(10)
    });
    for n in 1..=8 {
        h.doc.seed(post("alice", &clean(n), Some(&n.to_string())));
    }
    let filter = h.filter().await;
    filter.enable().await;

    let history = filter.history();
    assert!(history.seen_len() <= 5);
    assert!(!history.is_seen("1"));
    assert!(!history.is_seen("2"));
    assert!(history.is_seen("8"));

    let persisted = h.store.peek(StoreArea::Local, keys::SEEN_IDS).unwrap();
    assert_eq!(persisted, json!(["5", "6", "7", "8"]));
}

#[tokio::test]
async fn collapsed_history_reapplies_after_reload() {
    let h = Harness::new(config(10));
    h.doc.seed(post("bob", &slop_text(), Some("7")));
    let first = h.filter().await;
    first.enable().await;
    first.disable();
    drop(first);

    let reloaded = Harness {
        doc: FakeDocument::new("https://x.com/home"),
        ..h
    };
    let node = as_node(reloaded.doc.seed(post("bob", &slop_text(), Some("7"))));
    let filter = reloaded.filter().await;
    filter.enable().await;

    assert!(Presenter::is_collapsed(&node));
    assert_eq!(filter.stats().reapplied, 1);
    assert_eq!(filter.stats().heuristic_flags, 0);
}

#[tokio::test]
async fn failing_store_degrades_to_memory_only() {
    let doc = FakeDocument::new("https://x.com/home");
    let node = as_node(doc.seed(post("bob", &slop_text(), Some("7"))));
    let filter = SlopFilter::load(
        FilterDeps {
            document: doc.clone(),
            store: Arc::new(FailingStore),
            classifier: None,
        },
        config(10),
    )
    .await
    .unwrap();

    filter.enable().await;

    assert!(Presenter::is_collapsed(&node));
    assert!(filter.history().is_seen("7"));
    assert!(filter.stats().persistence_degraded);
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ai_self_identification_is_collapsed_locally() {
    let h = Harness::new(config(10));
    let node = as_node(h.doc.seed(post("bob", &slop_text(), Some("1"))));
    let original = node.markup();
    let filter = h.filter().await;

    filter.enable().await;

    assert!(Presenter::is_collapsed(&node));
    assert!(node.text().contains("AI self-identification"));
    assert!(node.text().contains("4 emoji"));
    assert!(filter.history().is_collapsed("1"));
    assert_eq!(h.store.peek(StoreArea::Synced, keys::DETECTION_COUNT), Some(json!(1)));

    filter.disable();
    assert_eq!(node.markup(), original);
}

#[tokio::test]
async fn allow_listed_author_is_never_flagged() {
    let h = Harness::new(config(10))
        .with_setting(keys::ALLOW_LIST, json!(["@Alice"]))
        .await;
    let trusted = as_node(h.doc.seed(post("alice", &slop_text(), Some("1"))));
    let stranger = as_node(h.doc.seed(post("bob", &slop_text(), Some("2"))));
    let filter = h.filter().await;

    filter.enable().await;

    assert!(!Presenter::is_collapsed(&trusted));
    assert!(Presenter::is_collapsed(&stranger));
    assert_eq!(filter.stats().allow_listed, 1);
}

#[tokio::test]
async fn two_full_batches_flush_exactly_twice_in_order() {
    let h = Harness::new(config(3))
        .with_remote(MockClassifier::flagging(|_| false))
        .await;
    for n in 0..6 {
        h.doc.seed(post("alice", &clean(n), Some(&format!("{n}"))));
    }
    let filter = h.filter().await;
    filter.enable().await;

    assert!(eventually(|| h.calls() == 2).await);
    let calls = h.classifier.as_ref().unwrap().calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].texts, vec![clean(0), clean(1), clean(2)]);
    assert_eq!(calls[1].texts, vec![clean(3), clean(4), clean(5)]);
    assert_eq!(filter.queue_len(), 0);
}

#[tokio::test]
async fn residual_tail_stays_unflushed() {
    let h = Harness::new(config(3))
        .with_remote(MockClassifier::flagging(|_| false))
        .await;
    for n in 0..4 {
        h.doc.seed(post("alice", &clean(n), Some(&format!("{n}"))));
    }
    let filter = h.filter().await;
    filter.enable().await;

    assert!(eventually(|| h.calls() == 1).await);
    assert_eq!(filter.queue_len(), 1);
}

#[tokio::test]
async fn remote_verdict_collapses_item() {
    let h = Harness::new(config(2))
        .with_remote(MockClassifier::flagging(|text| text.contains("course")))
        .await;
    let course = as_node(h.doc.seed(post("carol", "join my course tonight", Some("1"))));
    let plain = as_node(h.doc.seed(post("dave", &clean(2), Some("2"))));
    let filter = h.filter().await;
    let mut events = filter.subscribe_events();

    filter.enable().await;

    assert!(eventually(|| Presenter::is_collapsed(&course)).await);
    assert!(!Presenter::is_collapsed(&plain));
    assert!(filter.history().is_collapsed("1"));

    let event = events.recv().await.unwrap();
    let FilterEvent::SlopDetected { identifier, source, .. } = event;
    assert_eq!(identifier, "1");
    assert_eq!(source, VerdictSource::Remote);
}

#[tokio::test]
async fn heuristic_flagged_items_skip_the_remote_queue() {
    let h = Harness::new(config(10))
        .with_remote(MockClassifier::flagging(|_| true))
        .await;
    h.doc.seed(post("bob", &slop_text(), Some("1")));
    h.doc.seed(post("carol", &clean(2), Some("2")));
    let filter = h.filter().await;

    filter.enable().await;

    assert_eq!(filter.queue_len(), 1);
}

#[tokio::test]
async fn unauthorized_batch_collapses_nothing_remotely() {
    let h = Harness::new(config(2))
        .with_remote(MockClassifier::failing_with_status(401))
        .await;
    let slop = as_node(h.doc.seed(post("bob", &slop_text(), Some("1"))));
    let a = as_node(h.doc.seed(post("carol", &clean(2), Some("2"))));
    let b = as_node(h.doc.seed(post("dave", &clean(3), Some("3"))));
    let filter = h.filter().await;

    filter.enable().await;

    assert!(eventually(|| filter.stats().batches_failed == 1).await);
    assert!(Presenter::is_collapsed(&slop));
    assert!(!Presenter::is_collapsed(&a));
    assert!(!Presenter::is_collapsed(&b));
    assert_eq!(filter.stats().remote_flags, 0);
    // Failed items stay seen: no retry on the next scan.
    assert!(filter.history().is_seen("2"));
    assert!(filter.history().is_seen("3"));
}

#[tokio::test]
async fn malformed_batch_is_dropped() {
    let h = Harness::new(config(1))
        .with_remote(MockClassifier::malformed())
        .await;
    let node = as_node(h.doc.seed(post("carol", &clean(1), Some("1"))));
    let filter = h.filter().await;

    filter.enable().await;

    assert!(eventually(|| filter.stats().batches_failed == 1).await);
    assert!(!Presenter::is_collapsed(&node));
}

#[tokio::test]
async fn disable_ignores_late_remote_results() {
    let gate = Arc::new(Notify::new());
    let h = Harness::new(config(1))
        .with_remote(MockClassifier::flagging(|_| true).gated(gate.clone()))
        .await;
    let node = as_node(h.doc.seed(post("carol", &clean(1), Some("1"))));
    let filter = h.filter().await;

    filter.enable().await;
    assert!(eventually(|| h.calls() == 1).await);

    filter.disable();
    gate.notify_one();

    assert!(eventually(|| filter.stats().late_results_dropped == 1).await);
    assert!(!Presenter::is_collapsed(&node));
    assert!(!filter.history().is_collapsed("1"));
}

#[tokio::test]
async fn late_verdict_for_newly_allow_listed_author_is_dropped() {
    let gate = Arc::new(Notify::new());
    let h = Harness::new(config(1))
        .with_remote(MockClassifier::flagging(|_| true).gated(gate.clone()))
        .await;
    let node = as_node(h.doc.seed(post("bob", &clean(1), Some("1"))));
    let filter = h.filter().await;

    filter.enable().await;
    assert!(eventually(|| h.calls() == 1).await);

    filter
        .handle(ControlMessage::SetAllowList(vec!["bob".into()]))
        .await;
    gate.notify_one();

    assert!(eventually(|| filter.stats().late_results_dropped == 1).await);
    assert!(!Presenter::is_collapsed(&node));
    assert!(!filter.history().is_collapsed("1"));
    assert_eq!(filter.stats().remote_flags, 0);
}

#[tokio::test]
async fn shrinking_batch_size_flushes_what_is_ready() {
    let h = Harness::new(config(5))
        .with_remote(MockClassifier::flagging(|_| false))
        .await;
    for n in 0..3 {
        h.doc.seed(post("alice", &clean(n), Some(&format!("{n}"))));
    }
    let filter = h.filter().await;
    filter.enable().await;
    assert_eq!(filter.queue_len(), 3);
    assert_eq!(h.calls(), 0);

    filter.handle(ControlMessage::SetBatchSize(2)).await;

    assert_eq!(filter.queue_len(), 1);
    assert!(eventually(|| h.calls() == 1).await);
    let calls = h.classifier.as_ref().unwrap().calls();
    assert_eq!(calls[0].texts, vec![clean(0), clean(1)]);
    assert_eq!(h.store.peek(StoreArea::Synced, keys::BATCH_SIZE), Some(json!(2)));
}

// ---------------------------------------------------------------------------
// Fault isolation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn panicking_node_does_not_abort_the_scan() {
    let h = Harness::new(config(10));
    let before = as_node(h.doc.seed(post("bob", &slop_text(), Some("1"))));
    let broken = as_node(h.doc.seed(post("carol", &slop_text(), Some("2")).panicking()));
    let after = as_node(h.doc.seed(post("dave", &slop_text(), Some("3"))));
    let filter = h.filter().await;

    filter.enable().await;

    assert!(Presenter::is_collapsed(&before));
    assert!(Presenter::is_collapsed(&after));
    assert!(!Presenter::is_collapsed(&broken));
    assert_eq!(filter.stats().item_errors, 1);
    assert!(!filter.history().is_seen("2"));
    assert_eq!(filter.state(), slopblock_filter::ControllerState::Watching);

    // Retried on the next scan, contained again.
    assert!(matches!(
        filter.process_node(&broken).await,
        ItemOutcome::SkipRetry(_)
    ));
    assert_eq!(filter.stats().item_errors, 2);
}
