//! Bounded, persisted memory of seen and collapsed identifiers.
//!
//! Both sets are FIFO-bounded: inserting into a full set first drops the
//! oldest `drop_count` entries in one go. Every mutation is written through
//! to the local store area; the first failed write flips the store into
//! memory-only mode for the rest of the session.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{info, warn};

use slopblock_common::FilterConfig;

use crate::store::{keys, Settings, StoreArea};

/// Insertion-ordered id set with batch FIFO eviction.
#[derive(Debug, Clone)]
pub struct BoundedIdSet {
    order: VecDeque<String>,
    members: HashSet<String>,
    cap: usize,
    drop_count: usize,
}

impl BoundedIdSet {
    pub fn new(cap: usize, drop_count: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            cap: cap.max(1),
            drop_count: drop_count.clamp(1, cap.max(1)),
        }
    }

    /// Restore from a persisted list, keeping only the newest `cap` ids.
    pub fn from_vec(ids: Vec<String>, cap: usize, drop_count: usize) -> Self {
        let mut set = Self::new(cap, drop_count);
        let skip = ids.len().saturating_sub(set.cap);
        for id in ids.into_iter().skip(skip) {
            set.insert(id);
        }
        set
    }

    /// Returns false if `id` was already present.
    pub fn insert(&mut self, id: String) -> bool {
        if self.members.contains(&id) {
            return false;
        }
        if self.order.len() >= self.cap {
            for _ in 0..self.drop_count {
                if let Some(evicted) = self.order.pop_front() {
                    self.members.remove(&evicted);
                }
            }
        }
        self.members.insert(id.clone());
        self.order.push_back(id);
        true
    }

    pub fn remove(&mut self, id: &str) -> bool {
        if !self.members.remove(id) {
            return false;
        }
        self.order.retain(|existing| existing != id);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.order.iter().cloned().collect()
    }
}

#[derive(Debug)]
struct Sets {
    seen: BoundedIdSet,
    collapsed: BoundedIdSet,
}

pub struct HistoryStore {
    sets: Mutex<Sets>,
    settings: Settings,
    degraded: AtomicBool,
}

impl HistoryStore {
    /// Load both sets from the local area. Unreadable history starts empty.
    pub async fn load(settings: Settings, config: &FilterConfig) -> Arc<Self> {
        let cap = config.max_history_items;
        let drop_count = config.history_drop_count;

        let seen: Vec<String> = settings
            .get_or(StoreArea::Local, keys::SEEN_IDS, Vec::new())
            .await;
        let collapsed: Vec<String> = settings
            .get_or(StoreArea::Local, keys::COLLAPSED_IDS, Vec::new())
            .await;

        info!(
            seen = seen.len(),
            collapsed = collapsed.len(),
            "History loaded"
        );

        Arc::new(Self {
            sets: Mutex::new(Sets {
                seen: BoundedIdSet::from_vec(seen, cap, drop_count),
                collapsed: BoundedIdSet::from_vec(collapsed, cap, drop_count),
            }),
            settings,
            degraded: AtomicBool::new(false),
        })
    }

    pub fn is_seen(&self, id: &str) -> bool {
        self.lock().seen.contains(id)
    }

    pub fn is_collapsed(&self, id: &str) -> bool {
        self.lock().collapsed.contains(id)
    }

    /// Claim `id` for evaluation. Returns false if it was already seen, so
    /// concurrent discoveries of one identifier are evaluated once.
    pub async fn mark_seen(&self, id: &str) -> bool {
        let snapshot = {
            let mut sets = self.lock();
            if !sets.seen.insert(id.to_string()) {
                return false;
            }
            sets.seen.to_vec()
        };
        self.persist(keys::SEEN_IDS, snapshot).await;
        true
    }

    pub async fn mark_collapsed(&self, id: &str) {
        let snapshot = {
            let mut sets = self.lock();
            if !sets.collapsed.insert(id.to_string()) {
                return;
            }
            sets.collapsed.to_vec()
        };
        self.persist(keys::COLLAPSED_IDS, snapshot).await;
    }

    pub async fn unmark_collapsed(&self, id: &str) {
        let snapshot = {
            let mut sets = self.lock();
            if !sets.collapsed.remove(id) {
                return;
            }
            sets.collapsed.to_vec()
        };
        self.persist(keys::COLLAPSED_IDS, snapshot).await;
    }

    pub fn seen_len(&self) -> usize {
        self.lock().seen.len()
    }

    pub fn collapsed_len(&self) -> usize {
        self.lock().collapsed.len()
    }

    /// True once a write has failed and history is memory-only.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    async fn persist(&self, key: &str, ids: Vec<String>) {
        if self.is_degraded() {
            return;
        }
        if !self.settings.set(StoreArea::Local, key, &ids).await {
            self.degraded.store(true, Ordering::Relaxed);
            warn!(key, "History persistence failed, keeping history in memory only");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Sets> {
        self.sets.lock().unwrap_or_else(|p| p.into_inner())
    }
}
