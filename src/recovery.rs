use crate::clock::Clock;
use crate::error::Result;
use crate::model::{ErrorKind, FailureDetails, FailureRecord, ManualEntry, ManualStatus};
use crate::registry::SelectorRegistry;
use crate::store::Store;
use async_trait::async_trait;
use std::sync::Arc;

/// What a strategy gets to look at.
#[derive(Debug, Clone)]
pub struct RecoveryContext {
    pub provider: String,
    pub job_id: String,
    pub error_kind: ErrorKind,
    pub details: FailureDetails,
}

#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(true)` means the failure is handled and the chain stops.
    async fn attempt(&self, ctx: &RecoveryContext) -> Result<bool>;

    /// Whether success means a human has to step in.
    fn escalates(&self) -> bool {
        false
    }
}

/// Rewrites the missing selector with the best candidate for its role.
pub struct SelectorSelfHeal {
    registry: Arc<SelectorRegistry>,
}

impl SelectorSelfHeal {
    pub fn new(registry: Arc<SelectorRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl RecoveryStrategy for SelectorSelfHeal {
    fn name(&self) -> &'static str {
        "selector_self_heal"
    }

    async fn attempt(&self, ctx: &RecoveryContext) -> Result<bool> {
        if ctx.error_kind != ErrorKind::ElementNotFound {
            return Ok(false);
        }
        let Some(missing) = ctx.details.missing_element.as_deref() else {
            return Ok(false);
        };

        let suggestion = match ctx.details.page_snapshot.as_deref() {
            Some(html) => self
                .registry
                .suggest_for_snapshot(&ctx.provider, missing, html),
            None => self.registry.suggest(&ctx.provider, missing),
        };
        if suggestion.is_empty() {
            return Ok(false);
        }

        let current = self.registry.get(&ctx.provider).await?;
        let mut selectors = current.clone();
        selectors.extend(suggestion);
        if selectors == current {
            log::debug!(
                "Suggested selector for {}.{} is already in place",
                ctx.provider,
                missing
            );
            return Ok(false);
        }
        let reason = format!("Auto-recovery for missing element: {}", missing);
        Ok(self.registry.update(&ctx.provider, selectors, &reason).await)
    }
}

/// Hook for provider-specific selector fallbacks. Declines for now.
pub struct AlternativeSelectors;

#[async_trait]
impl RecoveryStrategy for AlternativeSelectors {
    fn name(&self) -> &'static str {
        "alternative_selectors"
    }

    async fn attempt(&self, ctx: &RecoveryContext) -> Result<bool> {
        log::debug!("No alternative selector strategy for {}", ctx.provider);
        Ok(false)
    }
}

/// Hook for a different automation route (API instead of UI, etc.). Declines for now.
pub struct AlternativeApproach;

#[async_trait]
impl RecoveryStrategy for AlternativeApproach {
    fn name(&self) -> &'static str {
        "alternative_approach"
    }

    async fn attempt(&self, ctx: &RecoveryContext) -> Result<bool> {
        log::debug!("No alternative automation approach for {}", ctx.provider);
        Ok(false)
    }
}

/// Last resort: park the job in the manual queue.
pub struct ManualEscalation {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl ManualEscalation {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }
}

#[async_trait]
impl RecoveryStrategy for ManualEscalation {
    fn name(&self) -> &'static str {
        "manual_escalation"
    }

    fn escalates(&self) -> bool {
        true
    }

    async fn attempt(&self, ctx: &RecoveryContext) -> Result<bool> {
        let entry = ManualEntry {
            job_id: ctx.job_id.clone(),
            provider: ctx.provider.clone(),
            error_kind: ctx.error_kind,
            details: ctx.details.clone(),
            queued_at: self.clock.now(),
            status: ManualStatus::PendingManual,
        };
        self.store.insert_manual(&entry).await?;
        log::warn!("Job {} queued for manual intervention", ctx.job_id);
        Ok(true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryOutcome {
    pub recovered: bool,
    pub strategy: Option<&'static str>,
    pub escalated: bool,
}

impl RecoveryOutcome {
    fn unresolved() -> Self {
        Self {
            recovered: false,
            strategy: None,
            escalated: false,
        }
    }
}

pub struct RecoveryChain {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    strategies: Vec<Box<dyn RecoveryStrategy>>,
}

impl RecoveryChain {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        strategies: Vec<Box<dyn RecoveryStrategy>>,
    ) -> Self {
        Self {
            store,
            clock,
            strategies,
        }
    }

    /// Self-heal, the two declining hooks, then manual escalation.
    pub fn standard(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        registry: Arc<SelectorRegistry>,
    ) -> Self {
        let strategies: Vec<Box<dyn RecoveryStrategy>> = vec![
            Box::new(SelectorSelfHeal::new(registry)),
            Box::new(AlternativeSelectors),
            Box::new(AlternativeApproach),
            Box::new(ManualEscalation::new(store.clone(), clock.clone())),
        ];
        Self::new(store, clock, strategies)
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub async fn recover(
        &self,
        provider: &str,
        job_id: &str,
        error_kind: ErrorKind,
        details: FailureDetails,
    ) -> bool {
        self.recover_with_outcome(provider, job_id, error_kind, details)
            .await
            .recovered
    }

    pub async fn recover_with_outcome(
        &self,
        provider: &str,
        job_id: &str,
        error_kind: ErrorKind,
        details: FailureDetails,
    ) -> RecoveryOutcome {
        let record = FailureRecord {
            at: self.clock.now(),
            job_id: job_id.to_string(),
            provider: provider.to_string(),
            error_kind,
            details: details.clone(),
        };
        if let Err(e) = self.store.append_failure(&record).await {
            log::error!("Failed to record failure for job {}: {}", job_id, e);
        }

        let ctx = RecoveryContext {
            provider: provider.to_string(),
            job_id: job_id.to_string(),
            error_kind,
            details,
        };

        for strategy in &self.strategies {
            match strategy.attempt(&ctx).await {
                Ok(true) => {
                    log::info!(
                        "Recovery strategy {} resolved {} on {}",
                        strategy.name(),
                        error_kind,
                        provider
                    );
                    return RecoveryOutcome {
                        recovered: true,
                        strategy: Some(strategy.name()),
                        escalated: strategy.escalates(),
                    };
                }
                Ok(false) => {}
                Err(e) => {
                    log::error!("Recovery strategy {} failed: {}", strategy.name(), e);
                }
            }
        }

        log::error!("All recovery strategies failed for job {}", job_id);
        RecoveryOutcome::unresolved()
    }
}
