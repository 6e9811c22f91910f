use std::fs;
use std::path::Path;

use commhub_core::HubConfig;

/// Configuration for the hub demo
#[derive(Clone, Debug)]
pub struct DemoConfig {
    pub hub: HubConfig,
    /// Task the PM hands to the developer
    pub feature: String,
    /// Subject of the PM/dev negotiation
    pub negotiation_topic: String,
    /// How long the PM waits for the developer's answer
    pub request_timeout_ms: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            // Env-driven hub defaults
            hub: HubConfig::from_env(),
            feature: std::env::var("HUB_DEMO_FEATURE")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "Implement login API endpoint".to_string()),
            negotiation_topic: std::env::var("HUB_DEMO_TOPIC")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "Release date for the login feature".to_string()),
            request_timeout_ms: std::env::var("HUB_DEMO_REQUEST_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(5_000),
        }
    }
}

impl DemoConfig {
    /// Load configuration from a TOML file (path via HUB_DEMO_CONFIG or ./hub_demo.toml),
    /// overlaying values onto env-driven defaults.
    pub fn load() -> Self {
        let default = Self::default();
        let path = std::env::var("HUB_DEMO_CONFIG").unwrap_or_else(|_| "hub_demo.toml".into());
        let p = Path::new(&path);
        if !p.exists() {
            tracing::info!(
                target = "hub_demo",
                path = %path,
                "No TOML config found; using defaults/env"
            );
            return default;
        }
        match fs::read_to_string(p) {
            Ok(s) => match toml::from_str::<DemoToml>(&s) {
                Ok(t) => t.overlay(default),
                Err(e) => {
                    tracing::warn!(
                        target = "hub_demo",
                        error = %e,
                        "Failed to parse TOML; using defaults"
                    );
                    default
                }
            },
            Err(e) => {
                tracing::warn!(
                    target = "hub_demo",
                    error = %e,
                    "Failed to read TOML; using defaults"
                );
                default
            }
        }
    }
}

// =========================
// TOML overlay definitions
// =========================

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct DemoToml {
    pub feature: Option<String>,
    pub negotiation_topic: Option<String>,
    pub request_timeout_ms: Option<u64>,
    pub hub: Option<HubToml>,
}

impl DemoToml {
    fn overlay(self, mut base: DemoConfig) -> DemoConfig {
        if let Some(v) = self.feature {
            base.feature = v;
        }
        if let Some(v) = self.negotiation_topic {
            base.negotiation_topic = v;
        }
        if let Some(v) = self.request_timeout_ms {
            base.request_timeout_ms = v;
        }
        if let Some(h) = self.hub {
            h.apply(&mut base.hub);
        }
        base
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct HubToml {
    pub inbox_capacity: Option<usize>,
    pub request_timeout_ms: Option<u64>,
    pub negotiation_timeout_ms: Option<u64>,
    pub context_limit: Option<usize>,
    pub history_limit: Option<usize>,
    pub sweep_interval_ms: Option<u64>,
    pub drain_on_stop: Option<bool>,
    pub resolved_memory: Option<usize>,
}
impl HubToml {
    fn apply(self, h: &mut HubConfig) {
        if let Some(v) = self.inbox_capacity {
            h.inbox_capacity = v.max(1);
        }
        if let Some(v) = self.request_timeout_ms {
            h.request_timeout_ms = v;
        }
        if let Some(v) = self.negotiation_timeout_ms {
            h.negotiation_timeout_ms = v;
        }
        if let Some(v) = self.context_limit {
            h.context_limit = v;
        }
        if let Some(v) = self.history_limit {
            h.history_limit = v;
        }
        if let Some(v) = self.sweep_interval_ms {
            h.sweep_interval_ms = v;
        }
        if let Some(v) = self.drain_on_stop {
            h.drain_on_stop = v;
        }
        if let Some(v) = self.resolved_memory {
            h.resolved_memory = v;
        }
    }
}
