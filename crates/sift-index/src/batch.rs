//! Adaptive sizing of embedding batches.
//!
//! The optimizer starts conservative and grows multiplicatively while
//! observed latency and memory stay under their ceilings. A provider rejection
//! shrinks the size below the batch that was rejected. State lives only for
//! one run.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// How an embedding attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutcome {
    Success,
    RateLimited,
    PayloadTooLarge,
    Transient,
    Timeout,
}

impl BatchOutcome {
    /// The provider refused the batch because of its size or rate.
    pub fn is_rejection(self) -> bool {
        matches!(self, Self::RateLimited | Self::PayloadTooLarge)
    }
}

/// Observation of one embedding attempt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchMetrics {
    pub batch_size: usize,
    pub observed_latency: Duration,
    /// Estimated request plus response bytes
    pub memory_delta: u64,
    pub outcome: BatchOutcome,
}

impl BatchMetrics {
    /// Estimate memory for `texts` embedded into `dimensions`-wide f32 vectors.
    pub fn estimate_memory(texts: &[String], dimensions: usize) -> u64 {
        let request: usize = texts.iter().map(String::len).sum();
        let response = texts.len() * dimensions * std::mem::size_of::<f32>();
        (request + response) as u64
    }
}

/// Tuning knobs for the optimizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOptimizerConfig {
    pub initial_size: usize,
    pub min_size: usize,
    pub growth_factor: f64,
    pub shrink_factor: f64,
    pub latency_ceiling: Duration,
    pub memory_ceiling: u64,
}

impl Default for BatchOptimizerConfig {
    fn default() -> Self {
        Self {
            initial_size: 8,
            min_size: 1,
            growth_factor: 2.0,
            shrink_factor: 0.5,
            latency_ceiling: Duration::from_secs(10),
            memory_ceiling: 64 * 1024 * 1024,
        }
    }
}

/// Adaptive batch size, bounded by the provider's hard limit.
#[derive(Debug, Clone)]
pub struct BatchOptimizer {
    config: BatchOptimizerConfig,
    hard_limit: usize,
    current: usize,
    history: Vec<BatchMetrics>,
}

impl BatchOptimizer {
    pub fn new(config: BatchOptimizerConfig, hard_limit: usize) -> Self {
        let hard_limit = hard_limit.max(1);
        let min = config.min_size.clamp(1, hard_limit);
        let current = config.initial_size.clamp(min, hard_limit);
        Self {
            config: BatchOptimizerConfig {
                min_size: min,
                ..config
            },
            hard_limit,
            current,
            history: Vec::new(),
        }
    }

    /// Size of the next batch.
    pub fn current_size(&self) -> usize {
        self.current
    }

    pub fn hard_limit(&self) -> usize {
        self.hard_limit
    }

    pub fn min_size(&self) -> usize {
        self.config.min_size
    }

    /// Every attempt observed so far in this run.
    pub fn history(&self) -> &[BatchMetrics] {
        &self.history
    }

    /// Feed an attempt back into the optimizer and return the next size.
    pub fn record(&mut self, metrics: BatchMetrics) -> usize {
        self.history.push(metrics);
        let before = self.current;

        match metrics.outcome {
            BatchOutcome::Success => {
                let over_latency = metrics.observed_latency > self.config.latency_ceiling;
                let over_memory = metrics.memory_delta > self.config.memory_ceiling;
                if over_latency || over_memory {
                    self.current = self.shrunk(self.current);
                } else if metrics.batch_size >= self.current {
                    // Only a full batch says anything about the next size up.
                    self.current = self.grown(self.current);
                }
            }
            outcome if outcome.is_rejection() => {
                self.current = self.shrunk(self.current.min(metrics.batch_size));
            }
            _ => {}
        }

        if self.current != before {
            debug!(
                "Batch size {} -> {} after {:?} (size {}, {:?})",
                before, self.current, metrics.outcome, metrics.batch_size, metrics.observed_latency
            );
        }
        self.current
    }

    /// Whether a rejected batch of `size` can be retried smaller.
    pub fn can_shrink_below(&self, size: usize) -> bool {
        size > self.config.min_size
    }

    fn grown(&self, size: usize) -> usize {
        let next = (size as f64 * self.config.growth_factor).ceil() as usize;
        next.max(size + 1).min(self.hard_limit)
    }

    fn shrunk(&self, size: usize) -> usize {
        let next = (size as f64 * self.config.shrink_factor).floor() as usize;
        let next = if next >= size { size.saturating_sub(1) } else { next };
        next.max(self.config.min_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(size: usize, outcome: BatchOutcome) -> BatchMetrics {
        BatchMetrics {
            batch_size: size,
            observed_latency: Duration::from_millis(50),
            memory_delta: 1024,
            outcome,
        }
    }

    #[test]
    fn test_initial_size_is_clamped() {
        let opt = BatchOptimizer::new(BatchOptimizerConfig::default(), 4);
        assert_eq!(opt.current_size(), 4);

        let opt = BatchOptimizer::new(
            BatchOptimizerConfig {
                initial_size: 0,
                ..Default::default()
            },
            32,
        );
        assert_eq!(opt.current_size(), 1);
    }

    #[test]
    fn test_grows_on_full_successful_batches() {
        let mut opt = BatchOptimizer::new(BatchOptimizerConfig::default(), 32);
        assert_eq!(opt.record(metrics(8, BatchOutcome::Success)), 16);
        assert_eq!(opt.record(metrics(16, BatchOutcome::Success)), 32);
        // Never past the hard limit
        assert_eq!(opt.record(metrics(32, BatchOutcome::Success)), 32);
    }

    #[test]
    fn test_partial_batch_does_not_grow() {
        let mut opt = BatchOptimizer::new(BatchOptimizerConfig::default(), 32);
        assert_eq!(opt.record(metrics(3, BatchOutcome::Success)), 8);
    }

    #[test]
    fn test_shrinks_strictly_on_rejection() {
        let mut opt = BatchOptimizer::new(BatchOptimizerConfig::default(), 32);
        assert_eq!(opt.record(metrics(8, BatchOutcome::PayloadTooLarge)), 4);
        assert_eq!(opt.record(metrics(4, BatchOutcome::RateLimited)), 2);
        assert_eq!(opt.record(metrics(2, BatchOutcome::PayloadTooLarge)), 1);
        // Floor
        assert_eq!(opt.record(metrics(1, BatchOutcome::PayloadTooLarge)), 1);
        assert!(!opt.can_shrink_below(1));
    }

    #[test]
    fn test_rejection_shrinks_below_attempted_size() {
        let mut opt = BatchOptimizer::new(BatchOptimizerConfig::default(), 32);
        // A short tail batch of 3 was rejected while the current size is 8
        assert_eq!(opt.record(metrics(3, BatchOutcome::PayloadTooLarge)), 1);
    }

    #[test]
    fn test_shrink_is_strict_with_gentle_factor() {
        let config = BatchOptimizerConfig {
            initial_size: 3,
            shrink_factor: 0.9,
            ..Default::default()
        };
        let mut opt = BatchOptimizer::new(config, 32);
        assert_eq!(opt.record(metrics(3, BatchOutcome::RateLimited)), 2);
    }

    #[test]
    fn test_transient_and_timeout_hold_size() {
        let mut opt = BatchOptimizer::new(BatchOptimizerConfig::default(), 32);
        assert_eq!(opt.record(metrics(8, BatchOutcome::Transient)), 8);
        assert_eq!(opt.record(metrics(8, BatchOutcome::Timeout)), 8);
        assert_eq!(opt.history().len(), 2);
    }

    #[test]
    fn test_ceilings_shrink_successful_batches() {
        let mut opt = BatchOptimizer::new(BatchOptimizerConfig::default(), 32);
        let slow = BatchMetrics {
            observed_latency: Duration::from_secs(30),
            ..metrics(8, BatchOutcome::Success)
        };
        assert_eq!(opt.record(slow), 4);

        let heavy = BatchMetrics {
            memory_delta: 512 * 1024 * 1024,
            ..metrics(4, BatchOutcome::Success)
        };
        assert_eq!(opt.record(heavy), 2);
    }

    #[test]
    fn test_estimate_memory() {
        let texts = vec!["abcd".to_string(), "ef".to_string()];
        assert_eq!(BatchMetrics::estimate_memory(&texts, 10), 6 + 2 * 10 * 4);
    }
}
