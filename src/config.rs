//! Runtime configuration for the queues, the batch coalescer, and the GenAI
//! driver. Each config has a serde-deserializable patch type backing the
//! partial reconfiguration messages; a patch only touches the fields it
//! carries and applies to work submitted after it lands.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the token-bucket scheduler and request queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Tokens regenerated per second.
    pub rate: f64,
    /// Maximum burst of tokens the bucket can hold.
    pub capacity: u32,
    /// Wall-clock deadline per attempt after admission, in milliseconds.
    pub timeout_ms: u64,
    /// Additional attempts after the first failure.
    pub max_retries: u32,
    /// Base retry delay; attempt `n` waits `base · 2^n`, clamped.
    pub base_retry_delay_ms: u64,
    /// Clamp for the exponential retry delay.
    pub max_retry_delay_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            rate: 5.0,
            capacity: 5,
            timeout_ms: 30_000,
            max_retries: 2,
            base_retry_delay_ms: 1_000,
            max_retry_delay_ms: 30_000,
        }
    }
}

impl QueueConfig {
    /// Retry delay for a given attempt: `base · 2^attempt`, clamped.
    /// Integer arithmetic with saturation so large attempts can't overflow.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.min(32));
        let delay = self
            .base_retry_delay_ms
            .saturating_mul(factor)
            .min(self.max_retry_delay_ms);
        Duration::from_millis(delay)
    }

    pub fn apply(&mut self, patch: &QueueConfigPatch) {
        if let Some(rate) = patch.rate {
            self.rate = rate;
        }
        if let Some(capacity) = patch.capacity {
            self.capacity = capacity;
        }
        if let Some(timeout_ms) = patch.timeout_ms {
            self.timeout_ms = timeout_ms;
        }
        if let Some(max_retries) = patch.max_retries {
            self.max_retries = max_retries;
        }
        if let Some(base) = patch.base_retry_delay_ms {
            self.base_retry_delay_ms = base;
        }
        if let Some(max) = patch.max_retry_delay_ms {
            self.max_retry_delay_ms = max;
        }
    }
}

/// Partial update for [`QueueConfig`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueConfigPatch {
    pub rate: Option<f64>,
    pub capacity: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub base_retry_delay_ms: Option<u64>,
    pub max_retry_delay_ms: Option<u64>,
}

/// Configuration for the batch queue and the caller-side aggregator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Global character budget per batch. A single oversized task still
    /// ships alone.
    pub max_characters_per_batch: usize,
    /// Item budget per batch.
    pub max_items_per_batch: usize,
    /// How long an open batch waits for more tasks before flushing.
    pub batch_delay_ms: u64,
    /// Whether a batch that exhausts its retries is retried task-by-task.
    pub fallback_to_individual: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_characters_per_batch: 4_000,
            max_items_per_batch: 10,
            batch_delay_ms: 50,
            fallback_to_individual: true,
        }
    }
}

impl BatchConfig {
    pub fn apply(&mut self, patch: &BatchConfigPatch) {
        if let Some(chars) = patch.max_characters_per_batch {
            self.max_characters_per_batch = chars;
        }
        if let Some(items) = patch.max_items_per_batch {
            self.max_items_per_batch = items;
        }
    }
}

/// Partial update for [`BatchConfig`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchConfigPatch {
    pub max_characters_per_batch: Option<usize>,
    pub max_items_per_batch: Option<usize>,
}

/// Configuration for the chat pool and GenAI driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenAiConfig {
    /// Maximum live conversation slots per (provider, purpose, base URL).
    pub max_slots_per_key: usize,
    /// Slots idle longer than this are evicted on acquire.
    pub idle_ttl_ms: u64,
    /// Outer bound on chat resets per call.
    pub max_recovery_attempts: u32,
    /// Base interval between message-content polls.
    pub poll_base_interval_ms: u64,
    /// Poll interval multiplier is `min(attempt, this)`.
    pub poll_max_backoff_multiplier: u32,
    /// Total budget for polling one message's content.
    pub poll_timeout_ms: u64,
    /// Per-request deadline for the REST endpoints.
    pub request_timeout_ms: u64,
    /// Deadline for reading the assistant SSE stream.
    pub stream_timeout_ms: u64,
}

impl Default for GenAiConfig {
    fn default() -> Self {
        Self {
            max_slots_per_key: 3,
            idle_ttl_ms: 10 * 60 * 1_000,
            max_recovery_attempts: 3,
            poll_base_interval_ms: 500,
            poll_max_backoff_multiplier: 6,
            poll_timeout_ms: 30_000,
            request_timeout_ms: 15_000,
            stream_timeout_ms: 60_000,
        }
    }
}

impl GenAiConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_millis(self.idle_ttl_ms)
    }

    /// Poll delay before attempt `i`: `base · min(i, max_multiplier)`,
    /// with attempt 0 polling immediately after the base interval.
    pub fn poll_delay(&self, attempt: u32) -> Duration {
        let multiplier = attempt.max(1).min(self.poll_max_backoff_multiplier) as u64;
        Duration::from_millis(self.poll_base_interval_ms.saturating_mul(multiplier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_and_clamps() {
        let config = QueueConfig {
            base_retry_delay_ms: 1_000,
            max_retry_delay_ms: 5_000,
            ..QueueConfig::default()
        };

        assert_eq!(config.retry_delay(0).as_millis(), 1_000);
        assert_eq!(config.retry_delay(1).as_millis(), 2_000);
        assert_eq!(config.retry_delay(2).as_millis(), 4_000);
        // Clamped from 8000
        assert_eq!(config.retry_delay(3).as_millis(), 5_000);
        // Huge attempt counts must not overflow
        assert_eq!(config.retry_delay(63).as_millis(), 5_000);
    }

    #[test]
    fn poll_delay_multiplier_is_bounded() {
        let config = GenAiConfig {
            poll_base_interval_ms: 100,
            poll_max_backoff_multiplier: 4,
            ..GenAiConfig::default()
        };

        assert_eq!(config.poll_delay(0).as_millis(), 100);
        assert_eq!(config.poll_delay(1).as_millis(), 100);
        assert_eq!(config.poll_delay(3).as_millis(), 300);
        assert_eq!(config.poll_delay(4).as_millis(), 400);
        assert_eq!(config.poll_delay(50).as_millis(), 400);
    }

    #[test]
    fn queue_patch_only_touches_present_fields() {
        let mut config = QueueConfig::default();
        let patch = QueueConfigPatch {
            rate: Some(10.0),
            timeout_ms: Some(5_000),
            ..QueueConfigPatch::default()
        };
        config.apply(&patch);

        assert_eq!(config.rate, 10.0);
        assert_eq!(config.timeout_ms, 5_000);
        assert_eq!(config.capacity, QueueConfig::default().capacity);
        assert_eq!(config.max_retries, QueueConfig::default().max_retries);
        assert_eq!(
            config.max_retry_delay_ms,
            QueueConfig::default().max_retry_delay_ms
        );
    }

    #[test]
    fn queue_patch_raises_the_retry_delay_clamp() {
        let mut config = QueueConfig {
            base_retry_delay_ms: 1_000,
            max_retry_delay_ms: 5_000,
            ..QueueConfig::default()
        };
        // Attempt 3 would be 8000ms but the old ceiling caps it.
        assert_eq!(config.retry_delay(3).as_millis(), 5_000);

        config.apply(&QueueConfigPatch {
            max_retry_delay_ms: Some(60_000),
            ..QueueConfigPatch::default()
        });
        assert_eq!(config.max_retry_delay_ms, 60_000);
        assert_eq!(config.retry_delay(3).as_millis(), 8_000);
    }

    #[test]
    fn batch_patch_round_trips_from_json() {
        let patch: BatchConfigPatch =
            serde_json::from_str(r#"{"max_items_per_batch": 3}"#).unwrap();
        let mut config = BatchConfig::default();
        config.apply(&patch);

        assert_eq!(config.max_items_per_batch, 3);
        assert_eq!(
            config.max_characters_per_batch,
            BatchConfig::default().max_characters_per_batch
        );
    }
}
