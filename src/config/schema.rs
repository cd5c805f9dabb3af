use crate::governor::GovernorConfig;
use crate::model::{ProviderProfile, SelectorMap};
use crate::scheduler::SchedulerConfig;
use crate::worker::WorkerSettings;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ServiceConfig {
    #[serde(default = "default_database_path")]
    #[validate(length(min = 1))]
    pub database_path: String,

    #[serde(default)]
    #[validate]
    pub automation: AutomationConfig,

    #[serde(default = "default_max_retries")]
    #[validate(range(max = 10))]
    pub max_retries: u32,

    #[serde(default = "default_true")]
    pub auto_retry_enabled: bool,

    #[serde(default = "default_poll_timeout")]
    #[validate(range(min = 10))]
    pub poll_timeout_ms: u64,

    #[serde(default = "default_requeue_delay")]
    #[validate(range(min = 1))]
    pub min_requeue_delay_ms: u64,

    #[serde(default = "default_selector_ttl")]
    pub selector_cache_ttl_secs: u64,

    #[serde(default)]
    pub governor: GovernorConfig,

    #[serde(default)]
    #[validate]
    pub scheduler: SchedulerConfig,

    #[serde(default = "default_providers")]
    #[validate]
    pub providers: Vec<ProviderSeed>,

    /// Submitted by `genqueue run` at startup.
    #[serde(default)]
    #[validate]
    pub batch: Option<BatchConfig>,

    /// Optional path to a parent configuration file to inherit from
    #[serde(default)]
    pub extends: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            automation: AutomationConfig::default(),
            max_retries: default_max_retries(),
            auto_retry_enabled: true,
            poll_timeout_ms: default_poll_timeout(),
            min_requeue_delay_ms: default_requeue_delay(),
            selector_cache_ttl_secs: default_selector_ttl(),
            governor: GovernorConfig::default(),
            scheduler: SchedulerConfig::default(),
            providers: default_providers(),
            batch: None,
            extends: None,
        }
    }
}

impl ServiceConfig {
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            max_retries: self.max_retries,
            auto_retry_enabled: self.auto_retry_enabled,
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            min_requeue_delay: Duration::from_millis(self.min_requeue_delay_ms),
        }
    }

    pub fn selector_ttl(&self) -> Duration {
        Duration::from_secs(self.selector_cache_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AutomationConfig {
    /// Base URL of the automation runner; jobs are posted to `{endpoint}/generate`.
    #[serde(default = "default_endpoint")]
    #[validate(url)]
    pub endpoint: String,

    #[serde(default = "default_request_timeout")]
    #[validate(range(min = 1))]
    pub request_timeout_secs: u64,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ProviderSeed {
    #[validate(length(min = 1))]
    pub name: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub selectors: SelectorMap,

    #[serde(default = "default_rate_limit")]
    #[validate(range(min = 1))]
    pub rate_limit_per_minute: u32,

    #[serde(default = "default_provider_timeout")]
    #[validate(range(min = 1))]
    pub timeout_seconds: u64,
}

impl ProviderSeed {
    pub fn into_profile(self, now: DateTime<Utc>) -> ProviderProfile {
        let mut profile = ProviderProfile::new(self.name, now)
            .with_rate_limit(self.rate_limit_per_minute)
            .with_timeout(self.timeout_seconds);
        profile.selectors = self.selectors;
        if !self.enabled {
            profile = profile.disabled();
        }
        profile
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BatchConfig {
    #[validate(length(min = 1))]
    pub name: String,

    #[validate(length(min = 1))]
    pub prompts: Vec<String>,

    #[validate(length(min = 1))]
    pub providers: Vec<String>,
}

fn default_database_path() -> String {
    "genqueue.db".to_string()
}

fn default_endpoint() -> String {
    "http://127.0.0.1:8710".to_string()
}

fn default_request_timeout() -> u64 {
    180
}

fn default_max_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_poll_timeout() -> u64 {
    1000
}

fn default_requeue_delay() -> u64 {
    1000
}

fn default_selector_ttl() -> u64 {
    300
}

fn default_rate_limit() -> u32 {
    10
}

fn default_provider_timeout() -> u64 {
    30
}

fn seed(
    name: &str,
    enabled: bool,
    rate_limit_per_minute: u32,
    timeout_seconds: u64,
    selectors: [(&str, &str); 3],
) -> ProviderSeed {
    ProviderSeed {
        name: name.to_string(),
        enabled,
        selectors: selectors
            .into_iter()
            .map(|(role, css)| (role.to_string(), css.to_string()))
            .collect(),
        rate_limit_per_minute,
        timeout_seconds,
    }
}

/// The providers known out of the box.
pub fn default_providers() -> Vec<ProviderSeed> {
    vec![
        seed(
            "OpenAI DALL-E",
            true,
            50,
            60,
            [
                ("prompt_input", "textarea[placeholder*='prompt']"),
                ("generate_button", "button[data-testid='generate']"),
                ("result_images", "img[alt*='generated']"),
            ],
        ),
        seed(
            "Midjourney",
            false,
            20,
            120,
            [
                ("prompt_input", "div[data-slate-editor='true']"),
                ("generate_button", "button[aria-label='Send Message']"),
                ("result_images", "img[class*='imageWrapper']"),
            ],
        ),
        seed(
            "ImageFX",
            true,
            30,
            90,
            [
                ("prompt_input", "div[data-slate-editor='true'][contenteditable='true']"),
                ("generate_button", "button:has-text('criar')"),
                ("result_images", "img[src*='lh3.googleusercontent.com']"),
            ],
        ),
    ]
}
