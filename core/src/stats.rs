//! Delivery statistics.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Monotonic counters updated by the hub. Nothing here ever decreases.
#[derive(Debug, Clone, Default)]
pub struct StatsCollector {
    total_accepted: u64,
    total_delivered: u64,
    total_failed: u64,
    total_discarded: u64,
    per_conversation: HashMap<String, u64>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accepted(&mut self) {
        self.total_accepted += 1;
    }

    /// Records the finalized delivery outcome of one dispatched message.
    pub fn record_outcome(&mut self, conversation_id: &str, delivered: bool) {
        if delivered {
            self.total_delivered += 1;
        } else {
            self.total_failed += 1;
        }
        *self
            .per_conversation
            .entry(conversation_id.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_discarded(&mut self, count: usize) {
        self.total_discarded += count as u64;
    }

    pub fn total_accepted(&self) -> u64 {
        self.total_accepted
    }

    pub fn total_delivered(&self) -> u64 {
        self.total_delivered
    }

    pub fn total_failed(&self) -> u64 {
        self.total_failed
    }

    pub fn conversation_count(&self, conversation_id: &str) -> u64 {
        self.per_conversation
            .get(conversation_id)
            .copied()
            .unwrap_or(0)
    }
}

/// Hub statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HubStats {
    pub total_accepted: u64,
    pub total_delivered: u64,
    pub total_failed: u64,
    pub total_discarded: u64,
    pub per_conversation: HashMap<String, u64>,
    pub total_archived: usize,
    pub active_conversations: usize,
    pub active_negotiations: usize,
    pub pending_requests: usize,
    pub queue_size: usize,
    pub subscriber_count: usize,
    pub monitor_count: usize,
    pub uptime_secs: f64,
}

impl HubStats {
    /// Accepted messages whose delivery outcome is not final yet.
    pub fn in_flight(&self) -> u64 {
        self.total_accepted
            .saturating_sub(self.total_delivered + self.total_failed + self.total_discarded)
    }
}

impl From<&StatsCollector> for HubStats {
    fn from(c: &StatsCollector) -> Self {
        Self {
            total_accepted: c.total_accepted,
            total_delivered: c.total_delivered,
            total_failed: c.total_failed,
            total_discarded: c.total_discarded,
            per_conversation: c.per_conversation.clone(),
            ..Default::default()
        }
    }
}
