// Scan & watch controller.
//
// SlopFilter owns one filter session at a time. enable() subscribes to the
// document, spawns the watch loop and scans everything already on the page;
// disable() aborts the loop, restores every collapsed node and drops
// in-memory state. Persisted history is never cleared here.
//
// Runtime state sits behind a std Mutex that is only held between await
// points. Every async continuation (watch loop, batch flush, navigation
// rescan) carries the session number it was started under and does nothing
// once that session is over.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use anyhow::Result;
use futures::FutureExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use slopblock_common::{FilterConfig, FilterMode, Item, VerdictSource, UNKNOWN_AUTHOR};

use crate::dispatcher::{self, BatchQueue, DispatchOutcome, QueuedItem, RemoteClassifier};
use crate::dom::{Document, Mutation, MutationStream, NodeKey, NodeRef};
use crate::extractor::{Extraction, Extractor, ITEM_QUERY};
use crate::heuristics::{ContentPolicy, HeuristicClassifier};
use crate::history::HistoryStore;
use crate::presenter::{Presenter, Transition, ID_ATTR};
use crate::stats::FilterStats;
use crate::store::{keys, FilterSettings, KeyValueStore, Settings, StoreArea};

const REAPPLIED_REASON: &str = "previously flagged";
const USER_REASON: &str = "collapsed by you";

/// Collaborators injected by the host.
#[derive(Clone)]
pub struct FilterDeps {
    pub document: Arc<dyn Document>,
    pub store: Arc<dyn KeyValueStore>,
    /// Absent when no remote classifier is configured.
    pub classifier: Option<Arc<dyn RemoteClassifier>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Scanning,
    Watching,
}

/// Inbound messages from the settings surface.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    SetEnabled(bool),
    SetFilteringMode(FilterMode),
    SetAllowList(Vec<String>),
    SetBlockedKeywords(Vec<String>),
    SetRemoteEnabled(bool),
    SetBatchSize(usize),
}

/// Outbound notifications for presentation chrome (badges, counters).
#[derive(Debug, Clone, PartialEq)]
pub enum FilterEvent {
    SlopDetected {
        identifier: String,
        source: VerdictSource,
        /// Running total across sessions.
        total: u64,
    },
}

/// What happened to an item that made it through extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Flagged now and collapsed.
    Collapsed(VerdictSource),
    /// Flagged in an earlier session or render; collapsed again.
    Reapplied,
    /// Flagged before but the user restored it this session.
    UserRestored,
    AllowListed,
    /// Identifier already evaluated.
    Duplicate,
    /// Waiting for a remote verdict.
    Queued,
    /// Clean and no remote classification.
    Passed,
    /// The node is already showing its collapsed form.
    AlreadyCollapsed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Processed(Disposition),
    /// Not handled; a later scan will try the node again.
    SkipRetry(String),
    /// Never handled (policy exclusion).
    SkipPermanent(String),
}

/// Why a node is currently collapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlagOrigin {
    Verdict(VerdictSource),
    /// Collapsed identifier from history; the original reasons are gone.
    History,
    User,
}

/// A node collapsed by this session, kept for policy re-evaluation.
struct Flagged {
    node: NodeRef,
    item: Item,
    origin: FlagOrigin,
}

struct Runtime {
    phase: ControllerState,
    session: u64,
    watch_task: Option<JoinHandle<()>>,
    policy: ContentPolicy,
    remote_enabled: bool,
    system_prompt: String,
    /// Nodes already handled this session; rescans skip them.
    processed_nodes: HashSet<NodeKey>,
    /// Identifiers the user expanded by hand this session.
    user_restored: HashSet<String>,
    flagged: HashMap<NodeKey, Flagged>,
    queue: BatchQueue,
    presenter: Presenter,
    stats: FilterStats,
    detections: u64,
}

struct Inner {
    document: Arc<dyn Document>,
    settings: Settings,
    classifier: Option<Arc<dyn RemoteClassifier>>,
    history: Arc<HistoryStore>,
    extractor: Extractor,
    heuristics: HeuristicClassifier,
    config: FilterConfig,
    events: broadcast::Sender<FilterEvent>,
    state: Mutex<Runtime>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let rt = self.state.get_mut().unwrap_or_else(|p| p.into_inner());
        if let Some(task) = rt.watch_task.take() {
            task.abort();
        }
    }
}

#[derive(Clone)]
pub struct SlopFilter {
    inner: Arc<Inner>,
}

impl SlopFilter {
    /// Build a filter from persisted settings and history. Does not start
    /// watching.
    pub async fn load(deps: FilterDeps, config: FilterConfig) -> Result<Self> {
        Ok(Self::load_with_settings(deps, config).await?.0)
    }

    /// Build a filter and start watching if the persisted setting says so.
    pub async fn boot(deps: FilterDeps, config: FilterConfig) -> Result<Self> {
        let (filter, settings) = Self::load_with_settings(deps, config).await?;
        if settings.enabled {
            filter.enable().await;
        }
        Ok(filter)
    }

    async fn load_with_settings(
        deps: FilterDeps,
        config: FilterConfig,
    ) -> Result<(Self, FilterSettings)> {
        config.validate()?;

        let settings = Settings::new(deps.store);
        let stored = settings.load_filter_settings(config.batch_size).await;
        let history = HistoryStore::load(settings.clone(), &config).await;
        let (events, _) = broadcast::channel(64);

        info!(
            enabled = stored.enabled,
            mode = ?stored.mode,
            remote = stored.remote_enabled,
            classifier = deps.classifier.is_some(),
            batch_size = stored.batch_size,
            "Slop filter loaded"
        );

        let runtime = Runtime {
            phase: ControllerState::Idle,
            session: 0,
            watch_task: None,
            policy: ContentPolicy {
                allow_list: stored.allow_list.clone(),
                blocked_keywords: stored.blocked_keywords.clone(),
            },
            remote_enabled: stored.remote_enabled,
            system_prompt: stored.system_prompt.clone(),
            processed_nodes: HashSet::new(),
            user_restored: HashSet::new(),
            flagged: HashMap::new(),
            queue: BatchQueue::new(stored.batch_size),
            presenter: Presenter::new(stored.mode),
            stats: FilterStats::default(),
            detections: stored.detection_count,
        };

        let filter = Self {
            inner: Arc::new(Inner {
                document: deps.document,
                settings,
                classifier: deps.classifier,
                history,
                extractor: Extractor::new(&config),
                heuristics: HeuristicClassifier::new(config.heuristics.clone()),
                config,
                events,
                state: Mutex::new(runtime),
            }),
        };
        Ok((filter, stored))
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// `Idle → Watching`, then scan the whole document.
    pub async fn enable(&self) {
        let session = {
            let mut rt = self.lock();
            if rt.phase != ControllerState::Idle {
                return;
            }
            rt.session += 1;
            rt.phase = ControllerState::Scanning;
            let stream = self.inner.document.subscribe();
            rt.watch_task = Some(self.spawn_watch(stream, rt.session));
            rt.session
        };
        info!(session, location = %self.inner.document.location(), "Filter enabled");
        self.scan_document().await;
    }

    /// `Watching → Idle`. Restores collapsed nodes and drops in-memory state.
    pub fn disable(&self) {
        let mut rt = self.lock();
        if rt.phase == ControllerState::Idle {
            return;
        }
        if let Some(task) = rt.watch_task.take() {
            task.abort();
        }
        rt.session += 1;
        rt.phase = ControllerState::Idle;
        let restored = rt.presenter.restore_all();
        rt.processed_nodes.clear();
        rt.user_restored.clear();
        rt.flagged.clear();
        let dropped = rt.queue.len();
        rt.queue.clear();
        info!(restored, dropped_queue = dropped, "Filter disabled");
    }

    pub fn state(&self) -> ControllerState {
        self.lock().phase
    }

    // -----------------------------------------------------------------------
    // Scanning
    // -----------------------------------------------------------------------

    /// Process every item node in the document not yet handled this session.
    pub async fn scan_document(&self) -> Vec<ItemOutcome> {
        let session = {
            let mut rt = self.lock();
            if rt.phase == ControllerState::Idle {
                return Vec::new();
            }
            rt.phase = ControllerState::Scanning;
            rt.session
        };

        let nodes = self.inner.document.query_all(&ITEM_QUERY);
        let pending: Vec<NodeRef> = {
            let rt = self.lock();
            nodes
                .into_iter()
                .filter(|n| !rt.processed_nodes.contains(&n.key()))
                .collect()
        };

        let outcomes = self.process_nodes(&pending).await;

        {
            let mut rt = self.lock();
            rt.stats.nodes_scanned += pending.len() as u32;
            if rt.session == session && rt.phase == ControllerState::Scanning {
                rt.phase = ControllerState::Watching;
            }
        }

        let retry = outcomes
            .iter()
            .filter(|o| matches!(o, ItemOutcome::SkipRetry(_)))
            .count();
        info!(session, nodes = pending.len(), retry, "Scan complete");
        outcomes
    }

    async fn process_nodes(&self, nodes: &[NodeRef]) -> Vec<ItemOutcome> {
        let mut outcomes = Vec::with_capacity(nodes.len());
        for node in nodes {
            let outcome = self.process_node(node).await;
            debug!(key = node.key(), ?outcome, "Item processed");
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Run one item node through extraction, dedup, classification and
    /// presentation. A panic anywhere in that path is contained to this node.
    pub async fn process_node(&self, node: &NodeRef) -> ItemOutcome {
        match AssertUnwindSafe(self.process_item(node)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(key = node.key(), "Item processing panicked, skipping node");
                self.lock().stats.item_errors += 1;
                ItemOutcome::SkipRetry("item processing failed".to_string())
            }
        }
    }

    async fn process_item(&self, node: &NodeRef) -> ItemOutcome {
        let (session, policy, remote) = {
            let rt = self.lock();
            if rt.phase == ControllerState::Idle {
                return ItemOutcome::SkipRetry("filter disabled".to_string());
            }
            (
                rt.session,
                rt.policy.clone(),
                rt.remote_enabled && self.inner.classifier.is_some(),
            )
        };

        if Presenter::is_collapsed(node) {
            self.lock().processed_nodes.insert(node.key());
            return ItemOutcome::Processed(Disposition::AlreadyCollapsed);
        }

        let item = match self.inner.extractor.extract(node) {
            Extraction::Ok(item) => item,
            Extraction::SkipRetry(reason) => {
                self.lock().stats.skipped_retry += 1;
                return ItemOutcome::SkipRetry(reason);
            }
            Extraction::SkipPermanent(reason) => {
                let mut rt = self.lock();
                rt.stats.skipped_permanent += 1;
                rt.processed_nodes.insert(node.key());
                return ItemOutcome::SkipPermanent(reason);
            }
        };

        let id = item.identifier.clone();
        let allow_listed = policy.is_allow_listed(&item.author);

        if self.inner.history.is_collapsed(&id) {
            let mut rt = self.lock();
            rt.processed_nodes.insert(node.key());
            let disposition = if allow_listed {
                rt.stats.allow_listed += 1;
                Disposition::AllowListed
            } else if rt.user_restored.contains(&id) {
                Disposition::UserRestored
            } else {
                if rt.presenter.collapse(node, &id, &[REAPPLIED_REASON.to_string()])
                    == Transition::Applied
                {
                    rt.stats.reapplied += 1;
                }
                rt.flagged.insert(
                    node.key(),
                    Flagged {
                        node: node.clone(),
                        item: item.clone(),
                        origin: FlagOrigin::History,
                    },
                );
                Disposition::Reapplied
            };
            return ItemOutcome::Processed(disposition);
        }

        if allow_listed {
            let mut rt = self.lock();
            rt.stats.allow_listed += 1;
            rt.processed_nodes.insert(node.key());
            return ItemOutcome::Processed(Disposition::AllowListed);
        }

        // Duplicates are not cached per node: if the identifier is collapsed
        // later, the next scan re-collapses this copy too.
        if self.inner.history.is_seen(&id) || !self.inner.history.mark_seen(&id).await {
            self.lock().stats.duplicates += 1;
            return ItemOutcome::Processed(Disposition::Duplicate);
        }

        if !self.is_current(session) {
            return ItemOutcome::SkipRetry("filter disabled".to_string());
        }

        let verdict = self.inner.heuristics.classify_item(&item, &policy);
        self.lock().stats.items_processed += 1;

        if verdict.is_slop {
            info!(
                identifier = %id,
                confidence = verdict.confidence,
                reasons = ?verdict.reason_labels(),
                "Heuristic flagged item"
            );
            self.apply_collapse(node, &item, verdict.reason_labels(), VerdictSource::Heuristic)
                .await;
            return ItemOutcome::Processed(Disposition::Collapsed(VerdictSource::Heuristic));
        }

        if !remote {
            self.lock().processed_nodes.insert(node.key());
            return ItemOutcome::Processed(Disposition::Passed);
        }

        let ready = {
            let mut rt = self.lock();
            rt.processed_nodes.insert(node.key());
            rt.queue.enqueue(QueuedItem {
                identifier: id,
                author: item.author,
                text: item.text,
                node: node.clone(),
            })
        };
        if let Some(batch) = ready {
            self.spawn_flush(batch, session);
        }
        ItemOutcome::Processed(Disposition::Queued)
    }

    async fn apply_collapse(
        &self,
        node: &NodeRef,
        item: &Item,
        reasons: Vec<String>,
        source: VerdictSource,
    ) {
        let identifier = item.identifier.as_str();
        {
            let mut rt = self.lock();
            rt.processed_nodes.insert(node.key());
            rt.presenter.collapse(node, identifier, &reasons);
            rt.flagged.insert(
                node.key(),
                Flagged {
                    node: node.clone(),
                    item: item.clone(),
                    origin: FlagOrigin::Verdict(source),
                },
            );
            match source {
                VerdictSource::Heuristic => rt.stats.heuristic_flags += 1,
                VerdictSource::Remote => rt.stats.remote_flags += 1,
            }
        }
        self.inner.history.mark_collapsed(identifier).await;
        self.record_detection(identifier, source).await;
    }

    async fn record_detection(&self, identifier: &str, source: VerdictSource) {
        let total = {
            let mut rt = self.lock();
            rt.detections += 1;
            rt.detections
        };
        self.inner
            .settings
            .set(StoreArea::Synced, keys::DETECTION_COUNT, &total)
            .await;
        // No subscribers is fine.
        let _ = self.inner.events.send(FilterEvent::SlopDetected {
            identifier: identifier.to_string(),
            source,
            total,
        });
    }

    // -----------------------------------------------------------------------
    // Remote batches
    // -----------------------------------------------------------------------

    fn spawn_flush(&self, batch: Vec<QueuedItem>, session: u64) {
        let filter = self.clone();
        tokio::spawn(async move {
            filter.flush(batch, session).await;
        });
    }

    async fn flush(&self, batch: Vec<QueuedItem>, session: u64) {
        let Some(classifier) = self.inner.classifier.clone() else {
            return;
        };
        let prompt = {
            let mut rt = self.lock();
            rt.stats.batches_flushed += 1;
            rt.system_prompt.clone()
        };
        let size = batch.len();
        info!(session, size, "Flushing batch to remote classifier");

        let pairs = match dispatcher::dispatch(batch, &prompt, classifier.as_ref()).await {
            DispatchOutcome::Classified(pairs) => pairs,
            DispatchOutcome::Unavailable(reason) => {
                self.lock().stats.batches_failed += 1;
                warn!(session, size, reason = %reason, "Batch dropped without verdicts");
                return;
            }
        };

        for (item, verdict) in pairs {
            if !verdict.is_slop {
                continue;
            }
            if !self.is_current(session) || !self.inner.history.is_seen(&item.identifier) {
                self.lock().stats.late_results_dropped += 1;
                continue;
            }
            if self.lock().policy.is_allow_listed(&item.author) {
                debug!(identifier = %item.identifier, "Author allow-listed since queueing, verdict dropped");
                self.lock().stats.late_results_dropped += 1;
                continue;
            }
            if !item.node.is_connected() {
                // Re-rendered copies pick this up on the next scan.
                self.inner.history.mark_collapsed(&item.identifier).await;
                continue;
            }
            let reasons = vec![format!(
                "remote classifier, {:.0}% confidence",
                verdict.confidence * 100.0
            )];
            let node = item.node.clone();
            let item = Item::new(item.identifier, item.text).with_author(item.author);
            self.apply_collapse(&node, &item, reasons, VerdictSource::Remote)
                .await;
        }
    }

    // -----------------------------------------------------------------------
    // Watching
    // -----------------------------------------------------------------------

    fn spawn_watch(&self, mut stream: MutationStream, session: u64) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let window = self.inner.config.coalesce_window();
        tokio::spawn(async move {
            while let Some(first) = stream.recv().await {
                tokio::time::sleep(window).await;
                let mut pending = vec![first];
                while let Ok(more) = stream.try_recv() {
                    pending.push(more);
                }

                let Some(filter) = upgrade(&weak) else {
                    break;
                };
                if !filter.is_current(session) {
                    break;
                }
                filter.apply_mutations(pending, session).await;
            }
            debug!(session, "Watch loop ended");
        })
    }

    async fn apply_mutations(&self, mutations: Vec<Mutation>, session: u64) {
        let mut added: Vec<NodeRef> = Vec::new();
        let mut seen_keys: HashSet<NodeKey> = HashSet::new();
        let mut navigated = None;

        for mutation in mutations {
            match mutation {
                Mutation::Added(roots) => {
                    for root in roots {
                        let mut candidates = Vec::new();
                        if root.matches(&ITEM_QUERY) {
                            candidates.push(root.clone());
                        }
                        match std::panic::catch_unwind(AssertUnwindSafe(|| {
                            root.select_all(&ITEM_QUERY)
                        })) {
                            Ok(found) => candidates.extend(found),
                            Err(_) => warn!(key = root.key(), "Added subtree unreadable, skipping"),
                        }
                        for node in candidates {
                            if seen_keys.insert(node.key()) {
                                added.push(node);
                            }
                        }
                    }
                }
                Mutation::Navigated { url } => navigated = Some(url),
            }
        }

        if let Some(url) = navigated {
            self.on_navigation(&url, session);
        }

        let pending: Vec<NodeRef> = {
            let rt = self.lock();
            added
                .into_iter()
                .filter(|n| !rt.processed_nodes.contains(&n.key()))
                .collect()
        };
        if pending.is_empty() {
            return;
        }
        {
            let mut rt = self.lock();
            rt.stats.nodes_scanned += pending.len() as u32;
            rt.stats.mutation_batches += 1;
        }
        let outcomes = self.process_nodes(&pending).await;
        debug!(session, nodes = outcomes.len(), "Mutation batch processed");
    }

    /// Drop caches tied to the old view and rescan once it has settled.
    fn on_navigation(&self, url: &str, session: u64) {
        let pruned = {
            let mut rt = self.lock();
            rt.processed_nodes.clear();
            rt.flagged.retain(|_, f| f.node.is_connected());
            rt.presenter.prune_detached()
        };
        info!(url, pruned, "Navigation detected, scheduling rescan");

        let weak = Arc::downgrade(&self.inner);
        let delay = self.inner.config.navigation_settle();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(filter) = upgrade(&weak) {
                if filter.is_current(session) {
                    filter.scan_document().await;
                }
            }
        });
    }

    // -----------------------------------------------------------------------
    // User affordances
    // -----------------------------------------------------------------------

    /// The user expanded a collapsed item. Durable: the identifier leaves
    /// the collapsed history.
    pub async fn user_restore(&self, node: &NodeRef) -> Transition {
        let identifier = node.attr(ID_ATTR);
        let transition = {
            let mut rt = self.lock();
            let transition = rt.presenter.restore(node);
            if transition == Transition::Applied {
                rt.flagged.remove(&node.key());
                if let Some(id) = &identifier {
                    rt.user_restored.insert(id.clone());
                }
            }
            transition
        };
        if let (Transition::Applied, Some(id)) = (transition, identifier) {
            self.inner.history.unmark_collapsed(&id).await;
            info!(identifier = %id, "User restored item");
        }
        transition
    }

    /// The user collapsed an item by hand. `None` when the node cannot be
    /// identified.
    pub async fn user_collapse(&self, node: &NodeRef) -> Option<Transition> {
        let item = if Presenter::is_collapsed(node) {
            // The summary markup hides the post; use what was recorded.
            let id = node.attr(ID_ATTR)?;
            let recorded = self.lock().flagged.get(&node.key()).map(|f| f.item.clone());
            recorded.unwrap_or_else(|| Item::new(id, String::new()).with_author(UNKNOWN_AUTHOR))
        } else {
            match self.inner.extractor.extract(node) {
                Extraction::Ok(item) => item,
                _ => return None,
            }
        };
        let identifier = item.identifier.clone();

        let transition = {
            let mut rt = self.lock();
            rt.user_restored.remove(&identifier);
            rt.processed_nodes.insert(node.key());
            let transition = rt.presenter.collapse(node, &identifier, &[USER_REASON.to_string()]);
            rt.flagged.insert(
                node.key(),
                Flagged {
                    node: node.clone(),
                    item,
                    origin: FlagOrigin::User,
                },
            );
            transition
        };
        self.inner.history.mark_seen(&identifier).await;
        self.inner.history.mark_collapsed(&identifier).await;
        Some(transition)
    }

    // -----------------------------------------------------------------------
    // Control messages
    // -----------------------------------------------------------------------

    pub async fn handle(&self, message: ControlMessage) {
        let settings = &self.inner.settings;
        match message {
            ControlMessage::SetEnabled(enabled) => {
                settings.set(StoreArea::Synced, keys::ENABLED, &enabled).await;
                if enabled {
                    self.enable().await;
                } else {
                    self.disable();
                }
            }
            ControlMessage::SetFilteringMode(mode) => {
                settings.set(StoreArea::Synced, keys::FILTER_MODE, &mode).await;
                let switched = self.lock().presenter.switch_mode(mode);
                info!(?mode, switched, "Filtering mode changed");
            }
            ControlMessage::SetAllowList(list) => {
                settings.set(StoreArea::Synced, keys::ALLOW_LIST, &list).await;
                self.lock().policy.allow_list = list;
                self.reevaluate_visible().await;
            }
            ControlMessage::SetBlockedKeywords(keywords) => {
                settings
                    .set(StoreArea::Synced, keys::BLOCKED_KEYWORDS, &keywords)
                    .await;
                self.lock().policy.blocked_keywords = keywords;
                self.reevaluate_visible().await;
            }
            ControlMessage::SetRemoteEnabled(enabled) => {
                settings
                    .set(StoreArea::Synced, keys::REMOTE_ENABLED, &enabled)
                    .await;
                let mut rt = self.lock();
                rt.remote_enabled = enabled;
                if !enabled {
                    rt.queue.clear();
                }
            }
            ControlMessage::SetBatchSize(size) => {
                let size = size.max(1);
                settings.set(StoreArea::Synced, keys::BATCH_SIZE, &size).await;
                let (ready, session) = {
                    let mut rt = self.lock();
                    let ready = rt.queue.set_batch_size(size);
                    (ready, rt.session)
                };
                info!(size, flushed = ready.is_some(), "Batch size changed");
                if let Some(batch) = ready {
                    if self.is_current(session) {
                        self.spawn_flush(batch, session);
                    }
                }
            }
        }
    }

    /// Apply the current policy to what is on screen: restore collapsed
    /// items whose author is now allow-listed or whose heuristic verdict no
    /// longer holds, collapse visible items the heuristic now flags, then
    /// pick up anything not yet processed.
    pub async fn reevaluate_visible(&self) -> usize {
        let (policy, restored, cleared) = {
            let mut guard = self.lock();
            let rt = &mut *guard;
            if rt.phase == ControllerState::Idle {
                return 0;
            }
            let policy = rt.policy.clone();
            let heuristics = &self.inner.heuristics;
            let stale: Vec<(NodeKey, bool)> = rt
                .flagged
                .iter()
                .filter_map(|(key, f)| {
                    if policy.is_allow_listed(&f.item.author) {
                        return Some((*key, false));
                    }
                    let cleared = f.origin == FlagOrigin::Verdict(VerdictSource::Heuristic)
                        && !heuristics.classify_item(&f.item, &policy).is_slop;
                    cleared.then_some((*key, true))
                })
                .collect();

            let mut restored = 0;
            let mut cleared = Vec::new();
            for (key, verdict_cleared) in stale {
                let Some(flagged) = rt.flagged.remove(&key) else {
                    continue;
                };
                if rt.presenter.restore(&flagged.node) == Transition::Applied {
                    restored += 1;
                }
                if verdict_cleared {
                    cleared.push(flagged.item.identifier);
                }
            }
            (policy, restored, cleared)
        };

        // No longer slop under the new policy: later sessions must not
        // reapply the collapse.
        for identifier in &cleared {
            self.inner.history.unmark_collapsed(identifier).await;
        }

        let mut collapsed = 0;
        for node in self.inner.document.query_all(&ITEM_QUERY) {
            if Presenter::is_collapsed(&node) {
                continue;
            }
            let Extraction::Ok(item) = self.inner.extractor.extract(&node) else {
                continue;
            };
            let skip = self.lock().user_restored.contains(&item.identifier);
            if skip || !self.inner.history.is_seen(&item.identifier) {
                continue;
            }
            let verdict = self.inner.heuristics.classify_item(&item, &policy);
            if verdict.is_slop {
                self.apply_collapse(&node, &item, verdict.reason_labels(), VerdictSource::Heuristic)
                    .await;
                collapsed += 1;
            }
        }

        self.lock().processed_nodes.clear();
        self.scan_document().await;
        info!(restored, collapsed, "Visible items re-evaluated");
        restored + collapsed
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn subscribe_events(&self) -> broadcast::Receiver<FilterEvent> {
        self.inner.events.subscribe()
    }

    pub fn stats(&self) -> FilterStats {
        let mut stats = self.lock().stats.clone();
        stats.persistence_degraded = self.inner.history.is_degraded();
        stats
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.inner.history
    }

    pub fn mode(&self) -> FilterMode {
        self.lock().presenter.mode()
    }

    pub fn queue_len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn detection_count(&self) -> u64 {
        self.lock().detections
    }

    fn is_current(&self, session: u64) -> bool {
        let rt = self.lock();
        rt.session == session && rt.phase != ControllerState::Idle
    }

    fn lock(&self) -> MutexGuard<'_, Runtime> {
        self.inner.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn upgrade(weak: &Weak<Inner>) -> Option<SlopFilter> {
    weak.upgrade().map(|inner| SlopFilter { inner })
}
