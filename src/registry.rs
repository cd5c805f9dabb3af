use crate::clock::Clock;
use crate::error::Result;
use crate::model::{SelectorAudit, SelectorMap};
use crate::selector::{self, CssSelector};
use crate::store::Store;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

struct CachedSelectors {
    selectors: SelectorMap,
    loaded_at: DateTime<Utc>,
}

/// Read-through cache over each provider's selector map.
///
/// Reads are served from memory for at most `ttl`. Writes go straight to the
/// store and drop the cached entry, so the next read sees them immediately.
pub struct SelectorRegistry {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    cache: RwLock<HashMap<String, CachedSelectors>>,
}

impl SelectorRegistry {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, ttl: std::time::Duration) -> Self {
        Self {
            store,
            clock,
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::seconds(300)),
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn cached(&self, provider: &str, now: DateTime<Utc>) -> Option<SelectorMap> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        cache
            .get(provider)
            .filter(|entry| now - entry.loaded_at < self.ttl)
            .map(|entry| entry.selectors.clone())
    }

    /// Current selectors for `provider`; empty if the provider is unknown.
    pub async fn get(&self, provider: &str) -> Result<SelectorMap> {
        let now = self.clock.now();
        if let Some(selectors) = self.cached(provider, now) {
            return Ok(selectors);
        }

        let Some(profile) = self.store.get_provider(provider).await? else {
            return Ok(SelectorMap::new());
        };

        log::info!(
            "Loaded selectors for {}: {:?}",
            provider,
            profile.selectors.keys().collect::<Vec<_>>()
        );
        self.cache.write().unwrap_or_else(|e| e.into_inner()).insert(
            provider.to_string(),
            CachedSelectors {
                selectors: profile.selectors.clone(),
                loaded_at: now,
            },
        );
        Ok(profile.selectors)
    }

    /// Replaces the provider's selectors and records why. Returns `false` when
    /// the provider is unknown or the write fails.
    pub async fn update(&self, provider: &str, selectors: SelectorMap, reason: &str) -> bool {
        let audit = SelectorAudit {
            provider: provider.to_string(),
            selectors,
            reason: reason.to_string(),
            at: self.clock.now(),
        };

        match self.store.update_selectors(&audit).await {
            Ok(true) => {
                self.invalidate(provider);
                log::info!("Updated selectors for {}: {}", provider, reason);
                true
            }
            Ok(false) => {
                log::warn!("Failed to update selectors for {}: provider not found", provider);
                false
            }
            Err(e) => {
                log::error!("Error updating selectors for {}: {}", provider, e);
                false
            }
        }
    }

    pub fn invalidate(&self, provider: &str) {
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(provider);
    }

    /// Best-guess replacement for a missing element: the top-ranked candidate
    /// for its role. Empty for roles without candidates.
    pub fn suggest(&self, provider: &str, missing_element: &str) -> SelectorMap {
        let suggestion = selector::candidates(missing_element)
            .and_then(|list| list.into_iter().next());
        Self::single(provider, missing_element, suggestion)
    }

    /// Like [`suggest`](Self::suggest), but prefers the first candidate that
    /// actually matches an element in the captured page.
    pub fn suggest_for_snapshot(
        &self,
        provider: &str,
        missing_element: &str,
        page_snapshot: &str,
    ) -> SelectorMap {
        match selector::first_match(missing_element, page_snapshot) {
            Some(found) => Self::single(provider, missing_element, Some(found)),
            None => self.suggest(provider, missing_element),
        }
    }

    fn single(provider: &str, role: &str, suggestion: Option<CssSelector>) -> SelectorMap {
        let mut map = SelectorMap::new();
        if let Some(suggestion) = suggestion {
            let css = suggestion.to_css_string();
            log::debug!("Suggesting {} for {}.{}", css, provider, role);
            map.insert(role.to_string(), css);
        }
        map
    }

    pub async fn history(&self, provider: &str) -> Result<Vec<SelectorAudit>> {
        self.store.selector_history(provider).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::ProviderProfile;
    use crate::store::MemoryStore;

    async fn registry() -> (SelectorRegistry, Arc<MemoryStore>, ManualClock) {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::default();
        let profile = ProviderProfile::new("ImageFX", clock.now())
            .with_selector("prompt_input", "div[contenteditable='true']");
        store.seed_provider(&profile).await.unwrap();
        let registry = SelectorRegistry::new(
            store.clone(),
            Arc::new(clock.clone()),
            std::time::Duration::from_secs(300),
        );
        (registry, store, clock)
    }

    fn edited(store_selectors: &str) -> SelectorAudit {
        let mut selectors = SelectorMap::new();
        selectors.insert("prompt_input".into(), store_selectors.into());
        SelectorAudit {
            provider: "ImageFX".into(),
            selectors,
            reason: "edited behind the cache".into(),
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn cached_reads_are_bounded_by_ttl() {
        let (registry, store, clock) = registry().await;
        assert_eq!(registry.get("ImageFX").await.unwrap()["prompt_input"], "div[contenteditable='true']");

        // Bypass the registry so only the TTL can reveal the change.
        store.update_selectors(&edited("#direct")).await.unwrap();
        clock.advance_secs(299.0);
        assert_eq!(registry.get("ImageFX").await.unwrap()["prompt_input"], "div[contenteditable='true']");

        clock.advance_secs(1.0);
        assert_eq!(registry.get("ImageFX").await.unwrap()["prompt_input"], "#direct");
    }

    #[tokio::test]
    async fn update_invalidates_immediately_and_audits() {
        let (registry, _store, _clock) = registry().await;
        registry.get("ImageFX").await.unwrap();

        let mut selectors = SelectorMap::new();
        selectors.insert("prompt_input".into(), "#prompt".into());
        assert!(registry.update("ImageFX", selectors, "layout change").await);

        assert_eq!(registry.get("ImageFX").await.unwrap()["prompt_input"], "#prompt");
        let history = registry.history("ImageFX").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reason, "layout change");
    }

    #[tokio::test]
    async fn unknown_provider_reads_empty_and_rejects_updates() {
        let (registry, _store, _clock) = registry().await;
        assert!(registry.get("Nope").await.unwrap().is_empty());
        assert!(!registry.update("Nope", SelectorMap::new(), "x").await);
    }

    #[tokio::test]
    async fn suggestions_use_the_ranked_table() {
        let (registry, _store, _clock) = registry().await;
        assert_eq!(
            registry.suggest("ImageFX", "generate_button")["generate_button"],
            "button[data-testid*='generate']"
        );
        assert!(registry.suggest("ImageFX", "mystery").is_empty());

        let page = r#"<form><input type="text" id="prompt"></form>"#;
        assert_eq!(
            registry.suggest_for_snapshot("ImageFX", "prompt_input", page)["prompt_input"],
            "#prompt"
        );
        assert_eq!(
            registry.suggest_for_snapshot("ImageFX", "prompt_input", "<p>nothing</p>")["prompt_input"],
            "textarea[name*='prompt']"
        );
    }
}
