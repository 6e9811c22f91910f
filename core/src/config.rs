//! Hub configuration.

use serde::{Deserialize, Serialize};
use tokio::time::Duration;

/// Runtime knobs for a [`CommunicationHub`](crate::CommunicationHub).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Capacity of inboxes created by `subscribe_inbox`
    pub inbox_capacity: usize,
    /// Default timeout for `send_request`
    pub request_timeout_ms: u64,
    /// Deadline of a negotiation session, measured from its start
    pub negotiation_timeout_ms: u64,
    /// Default window of `get_context`
    pub context_limit: usize,
    /// Default window of `get_conversation_history`
    pub history_limit: usize,
    /// How often the dispatch worker evicts expired requests and negotiations
    pub sweep_interval_ms: u64,
    /// Deliver what is still queued on `stop()` instead of discarding it
    pub drain_on_stop: bool,
    /// Resolved request ids remembered for duplicate-response detection
    pub resolved_memory: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 1024,
            request_timeout_ms: 30_000,
            negotiation_timeout_ms: 300_000,
            context_limit: 10,
            history_limit: 50,
            sweep_interval_ms: 1_000,
            drain_on_stop: true,
            resolved_memory: 1024,
        }
    }
}

impl HubConfig {
    /// Defaults overridden by `COMMHUB_*` environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            inbox_capacity: env_parse("COMMHUB_INBOX_CAPACITY").unwrap_or(d.inbox_capacity),
            request_timeout_ms: env_parse("COMMHUB_REQUEST_TIMEOUT_MS")
                .unwrap_or(d.request_timeout_ms),
            negotiation_timeout_ms: env_parse("COMMHUB_NEGOTIATION_TIMEOUT_MS")
                .unwrap_or(d.negotiation_timeout_ms),
            context_limit: env_parse("COMMHUB_CONTEXT_LIMIT").unwrap_or(d.context_limit),
            history_limit: env_parse("COMMHUB_HISTORY_LIMIT").unwrap_or(d.history_limit),
            sweep_interval_ms: env_parse("COMMHUB_SWEEP_INTERVAL_MS")
                .unwrap_or(d.sweep_interval_ms),
            drain_on_stop: env_parse("COMMHUB_DRAIN_ON_STOP").unwrap_or(d.drain_on_stop),
            resolved_memory: env_parse("COMMHUB_RESOLVED_MEMORY").unwrap_or(d.resolved_memory),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        // A zero interval would spin the worker
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key)
        .ok()
        .filter(|s| !s.is_empty())
        .and_then(|v| v.parse().ok())
}
