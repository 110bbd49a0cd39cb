//! Engine tuning. Everything has a default; `from_env` reads `STRATA_*`
//! overrides and `validate` rejects inconsistent combinations.

use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::consolidate::ConsolidationPolicy;
use crate::error::MemoryError;
use crate::tiers::TierPolicy;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, "ignoring unparseable setting");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

/// Weight of each retrieval signal in the final score. Must sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SignalWeights {
    pub semantic: f64,
    pub recency: f64,
    pub importance: f64,
    pub continuity: f64,
    pub relationship: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            semantic: 0.40,
            recency: 0.20,
            importance: 0.20,
            continuity: 0.10,
            relationship: 0.10,
        }
    }
}

impl SignalWeights {
    pub fn sum(&self) -> f64 {
        self.semantic + self.recency + self.importance + self.continuity + self.relationship
    }

    pub fn validate(&self) -> Result<(), MemoryError> {
        let all = [self.semantic, self.recency, self.importance, self.continuity, self.relationship];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(MemoryError::Validation("signal weights must be non-negative".into()));
        }
        if (self.sum() - 1.0).abs() > 1e-6 {
            return Err(MemoryError::Validation(format!(
                "signal weights sum to {:.4}, expected 1.0",
                self.sum()
            )));
        }
        Ok(())
    }
}

/// Row limit of each signal query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SignalLimits {
    pub semantic: usize,
    pub recency: usize,
    pub importance: usize,
    pub continuity: usize,
    pub relationship: usize,
}

impl Default for SignalLimits {
    fn default() -> Self {
        Self { semantic: 50, recency: 30, importance: 30, continuity: 20, relationship: 20 }
    }
}

/// Token pools carved out of every budget before the general pool.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BudgetReservations {
    pub identity: usize,
    pub pinned: usize,
    pub user_profile: usize,
}

impl Default for BudgetReservations {
    fn default() -> Self {
        Self { identity: 200, pinned: 300, user_profile: 200 }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineConfig {
    pub weights: SignalWeights,
    pub limits: SignalLimits,
    /// Decay rate per hour since last access.
    pub recency_lambda: f64,
    #[serde(skip)]
    pub signal_timeout: Duration,
    pub reservations: BudgetReservations,
    pub tiers: TierPolicy,
    pub duplicate_threshold: f64,
    pub conflict_threshold: f64,
    pub embed_cache_capacity: usize,
    pub result_cache_capacity: usize,
    #[serde(skip)]
    pub result_cache_ttl: Duration,
    pub access_queue_capacity: usize,
    pub compaction_enabled: bool,
    pub consolidation: ConsolidationPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            weights: SignalWeights::default(),
            limits: SignalLimits::default(),
            recency_lambda: 0.01,
            signal_timeout: Duration::from_secs(2),
            reservations: BudgetReservations::default(),
            tiers: TierPolicy::default(),
            duplicate_threshold: crate::thresholds::DUPLICATE_SIM,
            conflict_threshold: crate::thresholds::CONFLICT_SIM,
            embed_cache_capacity: 4096,
            result_cache_capacity: 1024,
            result_cache_ttl: Duration::from_secs(30),
            access_queue_capacity: 1024,
            compaction_enabled: true,
            consolidation: ConsolidationPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `STRATA_*` variables. Unparseable values are
    /// logged and ignored; call `validate` on the result.
    pub fn from_env() -> Self {
        let d = Self::default();
        let weights = SignalWeights {
            semantic: env_or("STRATA_WEIGHT_SEMANTIC", d.weights.semantic),
            recency: env_or("STRATA_WEIGHT_RECENCY", d.weights.recency),
            importance: env_or("STRATA_WEIGHT_IMPORTANCE", d.weights.importance),
            continuity: env_or("STRATA_WEIGHT_CONTINUITY", d.weights.continuity),
            relationship: env_or("STRATA_WEIGHT_RELATIONSHIP", d.weights.relationship),
        };
        let limits = SignalLimits {
            semantic: env_or("STRATA_LIMIT_SEMANTIC", d.limits.semantic),
            recency: env_or("STRATA_LIMIT_RECENCY", d.limits.recency),
            importance: env_or("STRATA_LIMIT_IMPORTANCE", d.limits.importance),
            continuity: env_or("STRATA_LIMIT_CONTINUITY", d.limits.continuity),
            relationship: env_or("STRATA_LIMIT_RELATIONSHIP", d.limits.relationship),
        };
        let reservations = BudgetReservations {
            identity: env_or("STRATA_RESERVE_IDENTITY", d.reservations.identity),
            pinned: env_or("STRATA_RESERVE_PINNED", d.reservations.pinned),
            user_profile: env_or("STRATA_RESERVE_PROFILE", d.reservations.user_profile),
        };
        let tiers = TierPolicy {
            hot_access_count: env_or("STRATA_HOT_ACCESS_COUNT", d.tiers.hot_access_count),
            hot_window_days: env_or("STRATA_HOT_WINDOW_DAYS", d.tiers.hot_window_days),
            hot_idle_days: env_or("STRATA_HOT_IDLE_DAYS", d.tiers.hot_idle_days),
            cold_age_days: env_or("STRATA_COLD_AGE_DAYS", d.tiers.cold_age_days),
            ..d.tiers
        };
        let consolidation = ConsolidationPolicy {
            interval_mins: env_or("STRATA_CONSOLIDATE_MINS", d.consolidation.interval_mins),
            summarize: env_flag("STRATA_SUMMARIZE", d.consolidation.summarize),
            ..d.consolidation
        };
        Self {
            weights,
            limits,
            recency_lambda: env_or("STRATA_RECENCY_LAMBDA", d.recency_lambda),
            signal_timeout: Duration::from_millis(env_or(
                "STRATA_SIGNAL_TIMEOUT_MS",
                d.signal_timeout.as_millis() as u64,
            )),
            reservations,
            tiers,
            duplicate_threshold: env_or("STRATA_DUPLICATE_SIM", d.duplicate_threshold),
            conflict_threshold: env_or("STRATA_CONFLICT_SIM", d.conflict_threshold),
            embed_cache_capacity: env_or("STRATA_EMBED_CACHE", d.embed_cache_capacity),
            result_cache_capacity: env_or("STRATA_RESULT_CACHE", d.result_cache_capacity),
            result_cache_ttl: Duration::from_secs(env_or(
                "STRATA_RESULT_CACHE_TTL_SECS",
                d.result_cache_ttl.as_secs(),
            )),
            access_queue_capacity: env_or("STRATA_ACCESS_QUEUE", d.access_queue_capacity),
            compaction_enabled: env_flag("STRATA_COMPACTION", d.compaction_enabled),
            consolidation,
        }
    }

    pub fn validate(&self) -> Result<(), MemoryError> {
        self.weights.validate()?;
        if !(self.recency_lambda.is_finite() && self.recency_lambda > 0.0) {
            return Err(MemoryError::Validation("recency_lambda must be positive".into()));
        }
        for (name, v) in [
            ("duplicate_threshold", self.duplicate_threshold),
            ("conflict_threshold", self.conflict_threshold),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(MemoryError::Validation(format!("{name} {v} out of range 0-1")));
            }
        }
        if self.conflict_threshold >= self.duplicate_threshold {
            return Err(MemoryError::Validation(
                "conflict_threshold must be below duplicate_threshold".into(),
            ));
        }
        if self.access_queue_capacity == 0 {
            return Err(MemoryError::Validation("access_queue_capacity must be > 0".into()));
        }
        if self.signal_timeout.is_zero() {
            return Err(MemoryError::Validation("signal_timeout must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = EngineConfig::default();
        cfg.validate().unwrap();
        assert!((cfg.weights.sum() - 1.0).abs() < 1e-9);
        assert_eq!(cfg.limits.semantic, 50);
        assert_eq!(cfg.reservations.pinned, 300);
    }

    #[test]
    fn weights_must_sum_to_one() {
        let mut cfg = EngineConfig::default();
        cfg.weights.semantic = 0.5;
        assert!(cfg.validate().is_err());
        cfg.weights.recency = 0.10;
        cfg.validate().unwrap();
    }

    #[test]
    fn negative_weight_rejected() {
        let w = SignalWeights { semantic: 1.2, recency: -0.2, importance: 0.0, continuity: 0.0, relationship: 0.0 };
        assert!(w.validate().is_err());
    }

    #[test]
    fn thresholds_must_be_ordered() {
        let cfg = EngineConfig { conflict_threshold: 0.96, ..Default::default() };
        assert!(cfg.validate().is_err());
    }
}
