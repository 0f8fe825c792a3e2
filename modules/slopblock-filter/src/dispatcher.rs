//! Batch dispatcher: size-triggered queue and the remote classifier seam.

use std::collections::VecDeque;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use ai_client::AiError;
use slopblock_common::{Item, RemoteVerdict};

use crate::dom::NodeRef;

/// One remote classification call.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifyRequest {
    /// Post texts in batch order; verdict `id` indexes into this.
    pub texts: Vec<String>,
    /// Instructions for the remote model.
    pub prompt_context: String,
}

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error(transparent)]
    Transport(#[from] AiError),

    #[error("Malformed classifier response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait RemoteClassifier: Send + Sync {
    async fn classify(&self, request: &ClassifyRequest)
        -> Result<Vec<RemoteVerdict>, ClassifyError>;
}

/// An item waiting for a remote verdict.
#[derive(Debug, Clone)]
pub struct QueuedItem {
    pub identifier: String,
    pub author: String,
    pub text: String,
    pub node: NodeRef,
}

/// Anything that can ride in a batch.
pub trait BatchEntry {
    fn text(&self) -> &str;
}

impl BatchEntry for QueuedItem {
    fn text(&self) -> &str {
        &self.text
    }
}

impl BatchEntry for Item {
    fn text(&self) -> &str {
        &self.text
    }
}

#[derive(Debug)]
pub enum DispatchOutcome<T = QueuedItem> {
    /// Verdicts paired with the entry they refer to, in batch order.
    Classified(Vec<(T, RemoteVerdict)>),
    /// The whole batch got no verdict.
    Unavailable(String),
}

/// FIFO queue that releases exactly `batch_size` items at a time.
#[derive(Debug)]
pub struct BatchQueue {
    items: VecDeque<QueuedItem>,
    batch_size: usize,
}

impl BatchQueue {
    pub fn new(batch_size: usize) -> Self {
        Self {
            items: VecDeque::new(),
            batch_size: batch_size.max(1),
        }
    }

    /// Append `item`; returns the oldest `batch_size` items once enough
    /// have accumulated.
    pub fn enqueue(&mut self, item: QueuedItem) -> Option<Vec<QueuedItem>> {
        self.items.push_back(item);
        self.take_ready()
    }

    fn take_ready(&mut self) -> Option<Vec<QueuedItem>> {
        if self.items.len() < self.batch_size {
            return None;
        }
        Some(self.items.drain(..self.batch_size).collect())
    }

    pub fn set_batch_size(&mut self, batch_size: usize) -> Option<Vec<QueuedItem>> {
        self.batch_size = batch_size.max(1);
        self.take_ready()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// Send one batch and map verdicts back to their items by position.
///
/// Out-of-range and repeated ids are ignored. Any failure makes the whole
/// batch unavailable; there is no retry.
pub async fn dispatch<T: BatchEntry>(
    batch: Vec<T>,
    prompt_context: &str,
    classifier: &dyn RemoteClassifier,
) -> DispatchOutcome<T> {
    let request = ClassifyRequest {
        texts: batch.iter().map(|entry| entry.text().to_string()).collect(),
        prompt_context: prompt_context.to_string(),
    };

    let verdicts = match classifier.classify(&request).await {
        Ok(verdicts) => verdicts,
        Err(e) => {
            warn!(batch = batch.len(), error = %e, "Remote classification unavailable");
            return DispatchOutcome::Unavailable(e.to_string());
        }
    };

    let size = batch.len();
    let mut slots: Vec<Option<T>> = batch.into_iter().map(Some).collect();
    let mut classified = Vec::with_capacity(verdicts.len());
    for verdict in verdicts {
        match slots.get_mut(verdict.id).and_then(Option::take) {
            Some(entry) => classified.push((entry, verdict)),
            None => debug!(id = verdict.id, size, "Ignoring verdict with unknown or repeated id"),
        }
    }
    DispatchOutcome::Classified(classified)
}
