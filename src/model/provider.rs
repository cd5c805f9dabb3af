use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Element role -> selector string.
pub type SelectorMap = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub name: String,
    pub enabled: bool,
    #[serde(default)]
    pub selectors: SelectorMap,
    pub rate_limit_per_minute: u32,
    pub timeout_seconds: u64,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub selector_update_reason: Option<String>,
}

impl ProviderProfile {
    pub fn new(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            selectors: SelectorMap::new(),
            rate_limit_per_minute: 10,
            timeout_seconds: 30,
            updated_at: now,
            selector_update_reason: None,
        }
    }

    pub fn with_selector(mut self, role: impl Into<String>, selector: impl Into<String>) -> Self {
        self.selectors.insert(role.into(), selector.into());
        self
    }

    pub fn with_rate_limit(mut self, per_minute: u32) -> Self {
        self.rate_limit_per_minute = per_minute;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// One entry of the append-only selector change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorAudit {
    pub provider: String,
    pub selectors: SelectorMap,
    pub reason: String,
    pub at: DateTime<Utc>,
}
