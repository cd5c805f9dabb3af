//! Per-provider adaptive rate limiting.
//!
//! Each provider gets a sliding window of request samples and an adaptive
//! requests-per-minute limit. The limit moves in steps as outcomes are
//! recorded. Failures carrying an error kind start a hard cooldown. Admission
//! never sleeps: a denial comes back with the number of seconds the caller
//! should wait before asking again.

use crate::clock::{Clock, seconds_between};
use crate::model::ErrorKind;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CooldownTable {
    pub rate_limit_secs: u64,
    pub server_error_secs: u64,
    pub timeout_secs: u64,
    pub maintenance_secs: u64,
    pub quota_exceeded_secs: u64,
    pub default_secs: u64,
}

impl Default for CooldownTable {
    fn default() -> Self {
        Self {
            rate_limit_secs: 300,
            server_error_secs: 60,
            timeout_secs: 30,
            maintenance_secs: 900,
            quota_exceeded_secs: 3600,
            default_secs: 60,
        }
    }
}

impl CooldownTable {
    pub fn for_kind(&self, kind: ErrorKind) -> u64 {
        match kind {
            ErrorKind::RateLimit => self.rate_limit_secs,
            ErrorKind::ServerError => self.server_error_secs,
            ErrorKind::Timeout => self.timeout_secs,
            ErrorKind::Maintenance => self.maintenance_secs,
            ErrorKind::QuotaExceeded => self.quota_exceeded_secs,
            _ => self.default_secs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub window_secs: u64,
    pub default_limit: u32,
    pub min_limit: u32,
    pub max_limit: u32,
    pub step: u32,
    pub min_samples: usize,
    pub evaluation_samples: usize,
    pub increase_above_success_rate: f64,
    pub increase_below_latency_secs: f64,
    pub decrease_below_success_rate: f64,
    pub decrease_above_latency_secs: f64,
    pub cooldowns: CooldownTable,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            default_limit: 10,
            min_limit: 3,
            max_limit: 60,
            step: 2,
            min_samples: 5,
            evaluation_samples: 10,
            increase_above_success_rate: 0.95,
            increase_below_latency_secs: 2.0,
            decrease_below_success_rate: 0.8,
            decrease_above_latency_secs: 10.0,
            cooldowns: CooldownTable::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admission {
    pub allowed: bool,
    pub wait_seconds: f64,
}

impl Admission {
    fn allow() -> Self {
        Self {
            allowed: true,
            wait_seconds: 0.0,
        }
    }

    fn deny(wait_seconds: f64) -> Self {
        Self {
            allowed: false,
            wait_seconds: wait_seconds.max(0.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adaptation {
    Unchanged,
    Increased { from: u32, to: u32 },
    Decreased { from: u32, to: u32 },
}

#[derive(Debug, Clone, Copy)]
struct Outcome {
    success: bool,
    latency_secs: f64,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: DateTime<Utc>,
    outcome: Option<Outcome>,
}

#[derive(Debug)]
struct RateState {
    samples: VecDeque<Sample>,
    limit: u32,
    cooldown_until: Option<DateTime<Utc>>,
}

impl RateState {
    fn new(limit: u32) -> Self {
        Self {
            samples: VecDeque::new(),
            limit,
            cooldown_until: None,
        }
    }

    fn evict(&mut self, now: DateTime<Utc>, window: Duration) {
        let cutoff = now - window;
        while self.samples.front().is_some_and(|s| s.at < cutoff) {
            self.samples.pop_front();
        }
    }
}

/// Rate state of one provider, for health reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderRate {
    pub provider: String,
    pub limit: u32,
    pub in_window: usize,
    pub cooldown_remaining_secs: f64,
}

pub struct RateGovernor {
    config: GovernorConfig,
    clock: Arc<dyn Clock>,
    states: Mutex<HashMap<String, RateState>>,
}

impl RateGovernor {
    pub fn new(config: GovernorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RateState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn clamp(&self, limit: u32) -> u32 {
        limit.clamp(self.config.min_limit, self.config.max_limit)
    }

    fn window(&self) -> Duration {
        Duration::seconds(self.config.window_secs as i64)
    }

    /// Seeds a provider's starting limit from its configured base rate. Has no
    /// effect once the provider has state.
    pub fn register(&self, provider: &str, base_limit: u32) {
        let limit = self.clamp(base_limit);
        self.lock()
            .entry(provider.to_string())
            .or_insert_with(|| RateState::new(limit));
    }

    pub fn admit(&self, provider: &str) -> Admission {
        let now = self.clock.now();
        let window = self.window();
        let default_limit = self.clamp(self.config.default_limit);
        let mut states = self.lock();
        let state = states
            .entry(provider.to_string())
            .or_insert_with(|| RateState::new(default_limit));

        if let Some(until) = state.cooldown_until {
            if now < until {
                return Admission::deny(seconds_between(now, until));
            }
        }

        state.evict(now, window);
        if state.samples.len() < state.limit as usize {
            state.samples.push_back(Sample { at: now, outcome: None });
            return Admission::allow();
        }

        match state.samples.front() {
            Some(oldest) => {
                let age = seconds_between(oldest.at, now);
                Admission::deny(self.config.window_secs as f64 - age)
            }
            None => Admission::allow(),
        }
    }

    /// Records the outcome of a request, adapts the provider's limit and, for
    /// failures with a kind, starts a cooldown that replaces any running one.
    pub fn record(
        &self,
        provider: &str,
        success: bool,
        latency_secs: f64,
        error_kind: Option<ErrorKind>,
    ) -> Adaptation {
        let now = self.clock.now();
        let window = self.window();
        let default_limit = self.clamp(self.config.default_limit);
        let mut states = self.lock();
        let state = states
            .entry(provider.to_string())
            .or_insert_with(|| RateState::new(default_limit));

        state.evict(now, window);
        let outcome = Outcome {
            success,
            latency_secs,
        };
        match state.samples.iter_mut().find(|s| s.outcome.is_none()) {
            Some(pending) => pending.outcome = Some(outcome),
            None => state.samples.push_back(Sample {
                at: now,
                outcome: Some(outcome),
            }),
        }

        let adaptation = self.adapt(provider, state);

        if !success {
            if let Some(kind) = error_kind {
                let secs = self.config.cooldowns.for_kind(kind);
                state.cooldown_until = Some(now + Duration::seconds(secs as i64));
                log::warn!("Applied {}s cooldown to {} due to {}", secs, provider, kind);
            }
        }

        adaptation
    }

    fn adapt(&self, provider: &str, state: &mut RateState) -> Adaptation {
        let recorded: Vec<Outcome> = state.samples.iter().filter_map(|s| s.outcome).collect();
        if recorded.len() < self.config.min_samples {
            return Adaptation::Unchanged;
        }

        let recent = &recorded[recorded.len().saturating_sub(self.config.evaluation_samples)..];
        let successes = recent.iter().filter(|o| o.success).count();
        let success_rate = successes as f64 / recent.len() as f64;
        let latencies: Vec<f64> = recent
            .iter()
            .map(|o| o.latency_secs)
            .filter(|l| *l > 0.0)
            .collect();
        let mean_latency = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<f64>() / latencies.len() as f64
        };

        let current = state.limit;
        if success_rate > self.config.increase_above_success_rate
            && mean_latency < self.config.increase_below_latency_secs
            && current < self.config.max_limit
        {
            let next = (current + self.config.step).min(self.config.max_limit);
            state.limit = next;
            log::info!(
                "Increased rate limit for {} to {} req/min (success: {:.0}%)",
                provider,
                next,
                success_rate * 100.0
            );
            Adaptation::Increased { from: current, to: next }
        } else if success_rate < self.config.decrease_below_success_rate
            || mean_latency > self.config.decrease_above_latency_secs
        {
            let next = current
                .saturating_sub(self.config.step)
                .max(self.config.min_limit);
            state.limit = next;
            if next == current {
                return Adaptation::Unchanged;
            }
            log::warn!(
                "Decreased rate limit for {} to {} req/min (success: {:.0}%, avg_time: {:.1}s)",
                provider,
                next,
                success_rate * 100.0,
                mean_latency
            );
            Adaptation::Decreased { from: current, to: next }
        } else {
            Adaptation::Unchanged
        }
    }

    pub fn limit(&self, provider: &str) -> u32 {
        self.lock()
            .get(provider)
            .map(|s| s.limit)
            .unwrap_or_else(|| self.clamp(self.config.default_limit))
    }

    /// Seconds left on the provider's cooldown, if one is running.
    pub fn cooldown_remaining(&self, provider: &str) -> Option<f64> {
        let now = self.clock.now();
        self.lock()
            .get(provider)
            .and_then(|s| s.cooldown_until)
            .filter(|until| now < *until)
            .map(|until| seconds_between(now, until))
    }

    pub fn snapshot(&self) -> Vec<ProviderRate> {
        let now = self.clock.now();
        let window = self.window();
        let mut states = self.lock();
        let mut rates: Vec<ProviderRate> = states
            .iter_mut()
            .map(|(provider, state)| {
                state.evict(now, window);
                ProviderRate {
                    provider: provider.clone(),
                    limit: state.limit,
                    in_window: state.samples.len(),
                    cooldown_remaining_secs: state
                        .cooldown_until
                        .filter(|until| now < *until)
                        .map(|until| seconds_between(now, until))
                        .unwrap_or(0.0),
                }
            })
            .collect();
        rates.sort_by(|a, b| a.provider.cmp(&b.provider));
        rates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn governor() -> (RateGovernor, ManualClock) {
        let clock = ManualClock::default();
        let governor = RateGovernor::new(GovernorConfig::default(), Arc::new(clock.clone()));
        (governor, clock)
    }

    #[test]
    fn full_window_denies_until_oldest_expires() {
        let (gov, clock) = governor();
        gov.register("ImageFX", 10);
        for _ in 0..10 {
            assert!(gov.admit("ImageFX").allowed);
            clock.advance_secs(1.0);
        }

        // Ten requests at t=0..9, now t=10: the oldest leaves the window at t=60.
        let denied = gov.admit("ImageFX");
        assert!(!denied.allowed);
        assert!((denied.wait_seconds - 50.0).abs() < 1e-6);

        clock.advance_secs(50.0);
        assert!(gov.admit("ImageFX").allowed);
    }

    #[test]
    fn cooldown_blocks_until_it_ends() {
        let (gov, clock) = governor();
        assert!(gov.admit("Midjourney").allowed);
        gov.record("Midjourney", false, 0.4, Some(ErrorKind::RateLimit));

        let mut elapsed = 0.0;
        for step in [1.0, 149.0, 149.0, 0.5] {
            let admission = gov.admit("Midjourney");
            assert!(!admission.allowed, "admitted {}s into cooldown", elapsed);
            assert!((admission.wait_seconds - (300.0 - elapsed)).abs() < 1e-6);
            clock.advance_secs(step);
            elapsed += step;
        }

        clock.advance_secs(300.0 - elapsed);
        assert!(gov.admit("Midjourney").allowed);
    }

    #[test]
    fn later_cooldown_replaces_earlier_one() {
        let (gov, _clock) = governor();
        gov.record("p", false, 0.0, Some(ErrorKind::QuotaExceeded));
        gov.record("p", false, 0.0, Some(ErrorKind::Timeout));
        let remaining = gov.cooldown_remaining("p").unwrap();
        assert!((remaining - 30.0).abs() < 1e-6);
    }

    #[test]
    fn unknown_kinds_use_default_cooldown() {
        let (gov, _clock) = governor();
        gov.record("p", false, 0.0, Some(ErrorKind::ElementNotFound));
        assert!((gov.cooldown_remaining("p").unwrap() - 60.0).abs() < 1e-6);
        gov.record("q", false, 0.0, None);
        assert!(gov.cooldown_remaining("q").is_none());
    }

    #[test]
    fn fast_successes_raise_the_limit_after_five_samples() {
        let (gov, _clock) = governor();
        for i in 0..4 {
            assert_eq!(gov.record("p", true, 0.5, None), Adaptation::Unchanged, "sample {}", i);
        }
        assert_eq!(
            gov.record("p", true, 0.5, None),
            Adaptation::Increased { from: 10, to: 12 }
        );
        assert_eq!(gov.limit("p"), 12);
    }

    #[test]
    fn failures_lower_the_limit_to_the_floor() {
        let (gov, _clock) = governor();
        for _ in 0..20 {
            gov.record("p", false, 0.5, None);
        }
        assert_eq!(gov.limit("p"), 3);
    }

    #[test]
    fn slow_responses_lower_the_limit() {
        let (gov, _clock) = governor();
        for _ in 0..5 {
            gov.record("p", true, 12.0, None);
        }
        assert_eq!(gov.limit("p"), 8);
    }

    #[test]
    fn limit_stays_in_bounds_and_moves_by_at_most_one_step() {
        let (gov, clock) = governor();
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut previous = gov.limit("p");
        for _ in 0..2_000 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let success = seed % 10 < 7;
            let latency = (seed % 130) as f64 / 10.0;
            gov.record("p", success, latency, None);
            clock.advance_secs(0.5);

            let limit = gov.limit("p");
            assert!((3..=60).contains(&limit));
            assert!(limit.abs_diff(previous) <= 2);
            previous = limit;
        }
    }

    #[test]
    fn replaying_the_same_history_gives_the_same_decisions() {
        let run = || {
            let clock = ManualClock::new(DateTime::from_timestamp(1_700_000_000, 0).unwrap());
            let gov = RateGovernor::new(GovernorConfig::default(), Arc::new(clock.clone()));
            gov.register("p", 4);
            let mut decisions = Vec::new();
            for step in 0..40 {
                let admission = gov.admit("p");
                decisions.push((admission.allowed, (admission.wait_seconds * 1000.0) as i64));
                if admission.allowed && step % 3 == 0 {
                    gov.record("p", step % 2 == 0, 0.3, None);
                }
                clock.advance_secs(7.5);
            }
            decisions
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn base_limit_is_clamped() {
        let (gov, _clock) = governor();
        gov.register("fast", 500);
        gov.register("slow", 1);
        assert_eq!(gov.limit("fast"), 60);
        assert_eq!(gov.limit("slow"), 3);
    }
}
