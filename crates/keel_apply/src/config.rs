//! Runtime configuration for the apply pipeline.

use std::time::Duration;
use std::{env, str::FromStr};

use serde::Deserialize;

const SPLIT_SIZE_BYTES: u64 = 64 * 1024 * 1024;
const MERGE_SIZE_BYTES: u64 = 8 * 1024 * 1024;
const SPLIT_QUEUE_INTERVAL_MS: u64 = 1_000;
const MERGE_QUEUE_INTERVAL_MS: u64 = 5_000;

/// Thresholds and throttles consulted after each batch commit.
///
/// These only gate advisory queue hints; nothing in the pipeline's
/// correctness depends on them.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct ApplyConfig {
    /// Suggest a split once a range's stats exceed this many bytes.
    pub split_size_bytes: u64,
    /// Suggest a merge once a range's stats fall below this many bytes.
    pub merge_size_bytes: u64,
    /// Minimum spacing between split hints for the same range, in ms.
    pub split_queue_interval_ms: u64,
    /// Minimum spacing between merge hints for the same range, in ms.
    pub merge_queue_interval_ms: u64,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            split_size_bytes: SPLIT_SIZE_BYTES,
            merge_size_bytes: MERGE_SIZE_BYTES,
            split_queue_interval_ms: SPLIT_QUEUE_INTERVAL_MS,
            merge_queue_interval_ms: MERGE_QUEUE_INTERVAL_MS,
        }
    }
}

impl ApplyConfig {
    /// Defaults with `KEEL_`-prefixed environment overrides applied.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            split_size_bytes: read_env_u64("KEEL_SPLIT_SIZE_BYTES", defaults.split_size_bytes),
            merge_size_bytes: read_env_u64("KEEL_MERGE_SIZE_BYTES", defaults.merge_size_bytes),
            split_queue_interval_ms: read_env_u64(
                "KEEL_SPLIT_QUEUE_INTERVAL_MS",
                defaults.split_queue_interval_ms,
            ),
            merge_queue_interval_ms: read_env_u64(
                "KEEL_MERGE_QUEUE_INTERVAL_MS",
                defaults.merge_queue_interval_ms,
            ),
        }
    }

    pub fn split_queue_interval(&self) -> Duration {
        Duration::from_millis(self.split_queue_interval_ms)
    }

    pub fn merge_queue_interval(&self) -> Duration {
        Duration::from_millis(self.merge_queue_interval_ms)
    }
}

fn read_env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| u64::from_str(&v).ok())
        .unwrap_or(default)
}
