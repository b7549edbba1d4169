//! Bounded record of recently seen inbound message identities.

use std::collections::{HashSet, VecDeque};

use tokio::time::Instant;
use tracing::debug;

use crate::common::MessageId;
use crate::config::DedupConfig;

/// A message identity and when it was first observed.
#[derive(Debug, Clone)]
struct SeenRecord {
    id: MessageId,
    seen_at: Instant,
}

/// Insertion-ordered set of message ids with high/low watermark eviction.
///
/// When an insert pushes the size above `high_watermark` the oldest entries
/// are dropped until `low_watermark` remain.
#[derive(Debug)]
pub struct DedupCache {
    order: VecDeque<SeenRecord>,
    ids: HashSet<MessageId>,
    high_watermark: usize,
    low_watermark: usize,
}

impl DedupCache {
    pub fn new(config: &DedupConfig) -> Self {
        Self::with_watermarks(config.high_watermark, config.low_watermark)
    }

    pub fn with_watermarks(high_watermark: usize, low_watermark: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(high_watermark + 1),
            ids: HashSet::with_capacity(high_watermark + 1),
            high_watermark,
            low_watermark: low_watermark.min(high_watermark),
        }
    }

    pub fn seen(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    /// Record an id. Recording a known id is a no-op.
    pub fn record(&mut self, id: MessageId) {
        if !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(SeenRecord {
            id,
            seen_at: Instant::now(),
        });

        if self.order.len() > self.high_watermark {
            self.trim();
        }
    }

    /// Record `id` and report whether it is new.
    pub fn check_and_record(&mut self, id: MessageId) -> bool {
        if self.seen(&id) {
            return false;
        }
        self.record(id);
        true
    }

    /// Drop an id again, e.g. when its message could not be delivered.
    pub fn forget(&mut self, id: &MessageId) -> bool {
        if !self.ids.remove(id) {
            return false;
        }
        if let Some(pos) = self.order.iter().rposition(|record| &record.id == id) {
            self.order.remove(pos);
        }
        true
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    fn trim(&mut self) {
        let excess = self.order.len().saturating_sub(self.low_watermark);
        for record in self.order.drain(..excess) {
            self.ids.remove(&record.id);
        }
        if let Some(oldest) = self.order.front() {
            debug!(
                "Trimmed {} dedup entries, oldest kept was seen {:?} ago",
                excess,
                oldest.seen_at.elapsed()
            );
        }
    }
}
