use cache::CacheConfig;
use resilience::ResilienceConfig;
use serde::{Deserialize, Serialize};

use crate::batch::PredictiveConfig;
use crate::error::EngineError;
use crate::scheduler::SchedulerConfig;
use crate::slo::SloDefinition;

/// Everything an [`Engine`](crate::Engine) needs besides its collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Width of every vector; cache and backends must agree.
    pub dimension: usize,
    /// Per-text limit, in chars.
    pub max_text_length: usize,
    /// Per-request limit on the number of texts.
    pub max_batch_texts: usize,
    pub memory_budget_mb: f64,
    pub cache: CacheConfig,
    pub scheduler: SchedulerConfig,
    /// Breaker and retry policy applied to every device.
    pub resilience: ResilienceConfig,
    pub batching: PredictiveConfig,
    pub slos: Vec<SloDefinition>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dimension: 384,
            max_text_length: 8192,
            max_batch_texts: 1024,
            memory_budget_mb: 512.0,
            cache: CacheConfig::default(),
            scheduler: SchedulerConfig::default(),
            resilience: ResilienceConfig::default(),
            batching: PredictiveConfig::default(),
            slos: SloDefinition::defaults(),
        }
    }
}

impl EngineConfig {
    /// Sets the engine and cache dimension together.
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self.cache.dimension = dimension;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_resilience(mut self, resilience: ResilienceConfig) -> Self {
        self.resilience = resilience;
        self
    }

    pub fn with_memory_budget_mb(mut self, budget: f64) -> Self {
        self.memory_budget_mb = budget;
        self
    }

    pub fn with_limits(mut self, max_text_length: usize, max_batch_texts: usize) -> Self {
        self.max_text_length = max_text_length;
        self.max_batch_texts = max_batch_texts;
        self
    }

    pub fn with_batching(mut self, batching: PredictiveConfig) -> Self {
        self.batching = batching;
        self
    }

    pub fn with_slos(mut self, slos: Vec<SloDefinition>) -> Self {
        self.slos = slos;
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let fail = |message: String| Err(EngineError::Config(message));

        if self.dimension == 0 {
            return fail("dimension must be positive".into());
        }
        if self.cache.dimension != self.dimension {
            return fail(format!(
                "cache dimension {} does not match engine dimension {}",
                self.cache.dimension, self.dimension
            ));
        }
        if self.max_text_length == 0 || self.max_batch_texts == 0 {
            return fail("text limits must be positive".into());
        }
        if !(self.memory_budget_mb.is_finite() && self.memory_budget_mb > 0.0) {
            return fail(format!("memory budget {} MB is not positive", self.memory_budget_mb));
        }
        if self.cache.max_cache_size == 0 {
            return fail("max cache size must be positive".into());
        }
        if !(0.0..=1.0).contains(&self.cache.semantic_threshold) {
            return fail(format!(
                "semantic threshold {} is outside [0, 1]",
                self.cache.semantic_threshold
            ));
        }
        if self.cache.ttl.is_some_and(|ttl| ttl.is_zero()) {
            return fail("cache TTL must be positive when set".into());
        }
        if !(self.scheduler.ema_alpha > 0.0 && self.scheduler.ema_alpha <= 1.0) {
            return fail(format!("EMA alpha {} is outside (0, 1]", self.scheduler.ema_alpha));
        }
        if self.resilience.circuit_breaker.failure_threshold == 0 {
            return fail("circuit failure threshold must be positive".into());
        }
        if self.batching.candidates.is_empty() {
            return fail("batch size candidates must not be empty".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = EngineConfig::default();
        assert_eq!(config.dimension, 384);
        assert_eq!(config.max_text_length, 8192);
        assert_eq!(config.max_batch_texts, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let mut config = EngineConfig::default();
        config.cache.dimension = 768;
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
        assert!(config.with_dimension(768).validate().is_ok());
    }

    #[test]
    fn bad_threshold_and_budget_are_rejected() {
        let mut config = EngineConfig::default();
        config.cache.semantic_threshold = 1.5;
        assert!(config.validate().is_err());

        let config = EngineConfig::default().with_memory_budget_mb(0.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "dimension": 8, "cache": { "dimension": 8 } }"#).unwrap();
        assert_eq!(config.dimension, 8);
        assert_eq!(config.max_batch_texts, 1024);
        assert!(config.validate().is_ok());
    }
}
