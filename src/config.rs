//! Engine and per-task configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 256 KiB lower bound for a chunk
pub const MIN_CHUNK_SIZE: u64 = 256 * 1024;
/// 10 MiB upper bound for a chunk
pub const MAX_CHUNK_SIZE: u64 = 10 * 1024 * 1024;
/// 1 MiB starting chunk size
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Engine-wide configuration, stored as JSON by hosts that persist it.
///
/// All fields default individually so older configs load unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of tasks uploading at the same time
    pub max_concurrent_tasks: usize,
    /// Nominal chunk size requested at session creation
    pub default_chunk_size: u64,
    /// Lower bound for the dynamic chunk size
    pub min_chunk_size: u64,
    /// Upper bound for the dynamic chunk size
    pub max_chunk_size: u64,
    /// Per-task chunk upload parallelism
    pub default_concurrency: usize,
    /// Retry attempts per chunk before the task fails
    pub retry_count: u32,
    /// Base delay between retries (exponential backoff)
    #[serde(with = "duration_millis")]
    pub retry_delay: Duration,
    /// Target wall time per chunk fed to the chunk-size controller
    pub target_upload_ms_per_chunk: u64,
    /// Window over which per-chunk dedup probes are coalesced
    #[serde(with = "duration_millis")]
    pub verify_batch_window: Duration,
    /// Per-request timeout; elapsed requests count as transient failures
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,
    /// Recreate placeholders for unfinished uploads on `init`
    pub auto_resume_unfinished: bool,
    /// Start tasks as soon as they are created
    pub auto_start: bool,
    /// Reject files larger than this at task creation. None = unlimited
    pub max_file_size: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 3,
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            min_chunk_size: MIN_CHUNK_SIZE,
            max_chunk_size: MAX_CHUNK_SIZE,
            default_concurrency: 3,
            retry_count: 3,
            retry_delay: Duration::from_millis(1000),
            target_upload_ms_per_chunk: 3000,
            verify_batch_window: Duration::from_millis(50),
            request_timeout: Duration::from_secs(30),
            auto_resume_unfinished: true,
            auto_start: true,
            max_file_size: None,
        }
    }
}

impl EngineConfig {
    /// Clamp out-of-range values instead of failing
    pub fn sanitized(mut self) -> Self {
        self.max_concurrent_tasks = self.max_concurrent_tasks.max(1);
        self.default_concurrency = self.default_concurrency.max(1);
        self.min_chunk_size = self.min_chunk_size.max(1);
        self.max_chunk_size = self.max_chunk_size.max(self.min_chunk_size);
        self.default_chunk_size = self
            .default_chunk_size
            .clamp(self.min_chunk_size, self.max_chunk_size);
        self
    }
}

/// Per-task overrides applied on top of [`EngineConfig`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskOptions {
    /// Preferred chunk size requested at session creation
    pub chunk_size: Option<u64>,
    /// Chunk upload parallelism for this task
    pub concurrency: Option<usize>,
    /// Retry attempts per chunk
    pub retry_count: Option<u32>,
    /// Base retry delay in milliseconds
    pub retry_delay_ms: Option<u64>,
    /// Start the task as soon as it is created
    pub auto_start: Option<bool>,
    /// Whole-file digest known ahead of time, enables the instant-upload
    /// check before any chunk is transferred
    pub precomputed_file_hash: Option<String>,
}

/// Effective per-task settings after merging config and options
#[derive(Debug, Clone)]
pub(crate) struct TaskSettings {
    pub preferred_chunk_size: u64,
    pub min_chunk_size: u64,
    pub max_chunk_size: u64,
    pub concurrency: usize,
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub target_upload_ms: u64,
    pub verify_batch_window: Duration,
    pub request_timeout: Duration,
}

impl TaskSettings {
    pub fn resolve(config: &EngineConfig, options: &TaskOptions) -> Self {
        let preferred = options
            .chunk_size
            .unwrap_or(config.default_chunk_size)
            .clamp(config.min_chunk_size, config.max_chunk_size);
        Self {
            preferred_chunk_size: preferred,
            min_chunk_size: config.min_chunk_size,
            max_chunk_size: config.max_chunk_size,
            concurrency: options.concurrency.unwrap_or(config.default_concurrency).max(1),
            retry_count: options.retry_count.unwrap_or(config.retry_count),
            retry_delay: options
                .retry_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(config.retry_delay),
            target_upload_ms: config.target_upload_ms_per_chunk,
            verify_batch_window: config.verify_batch_window,
            request_timeout: config.request_timeout,
        }
    }
}

mod duration_millis {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_tasks, 3);
        assert_eq!(config.default_chunk_size, 1024 * 1024);
        assert_eq!(config.min_chunk_size, 256 * 1024);
        assert_eq!(config.max_chunk_size, 10 * 1024 * 1024);
        assert_eq!(config.retry_count, 3);
        assert_eq!(config.retry_delay, Duration::from_millis(1000));
        assert_eq!(config.verify_batch_window, Duration::from_millis(50));
        assert!(config.auto_start);
    }

    #[test]
    fn sanitize_clamps_degenerate_values() {
        let config = EngineConfig {
            max_concurrent_tasks: 0,
            default_concurrency: 0,
            min_chunk_size: 0,
            max_chunk_size: 0,
            default_chunk_size: 0,
            ..Default::default()
        }
        .sanitized();
        assert_eq!(config.max_concurrent_tasks, 1);
        assert_eq!(config.default_concurrency, 1);
        assert!(config.min_chunk_size >= 1);
        assert!(config.max_chunk_size >= config.min_chunk_size);
        assert!(config.default_chunk_size >= config.min_chunk_size);
    }

    #[test]
    fn missing_fields_use_defaults() {
        // Older persisted configs only know a subset of the fields
        let config: EngineConfig = serde_json::from_str(r#"{"max_concurrent_tasks": 5}"#).unwrap();
        assert_eq!(config.max_concurrent_tasks, 5);
        assert_eq!(config.default_chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(config.auto_resume_unfinished);
    }

    #[test]
    fn task_settings_respect_overrides() {
        let config = EngineConfig::default();
        let options = TaskOptions {
            chunk_size: Some(100 * 1024 * 1024),
            concurrency: Some(8),
            retry_count: Some(1),
            ..Default::default()
        };
        let settings = TaskSettings::resolve(&config, &options);
        // Preferred size is clamped into the configured bounds
        assert_eq!(settings.preferred_chunk_size, config.max_chunk_size);
        assert_eq!(settings.concurrency, 8);
        assert_eq!(settings.retry_count, 1);
    }
}
