//! Configuration types for the talkhead serving core

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main serving configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServeConfig {
    /// Directory holding cached feature bundles
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Accelerator ordinals to initialize at startup
    #[serde(default = "default_accelerators")]
    pub accelerators: Vec<usize>,

    /// Frame rate used when a request does not name one
    #[serde(default = "default_fps")]
    pub default_fps: u32,

    /// Fixed batch size; derived from free accelerator memory when unset
    #[serde(default)]
    pub batch_size: Option<usize>,

    /// Upper bound for any derived batch size
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Free-memory tiers used to derive the batch size
    #[serde(default = "default_memory_tiers")]
    pub memory_tiers: Vec<MemoryTier>,

    /// Out-of-memory retries per batch before its items are failed
    #[serde(default = "default_oom_retry_limit")]
    pub oom_retry_limit: usize,

    /// In-flight batches allowed per accelerator
    #[serde(default = "default_inflight_per_accelerator")]
    pub inflight_per_accelerator: usize,

    /// How long a batch waits for its accelerator before failing
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Validated bundles kept warm in memory
    #[serde(default = "default_memory_cache_entries")]
    pub memory_cache_entries: usize,

    /// Streaming segment settings
    #[serde(default)]
    pub segment: SegmentConfig,
}

/// Batch size used when the smallest free memory across accelerators is at
/// least `min_free_bytes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryTier {
    pub min_free_bytes: u64,
    pub batch_size: usize,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            accelerators: default_accelerators(),
            default_fps: default_fps(),
            batch_size: None,
            max_batch_size: default_max_batch_size(),
            memory_tiers: default_memory_tiers(),
            oom_retry_limit: default_oom_retry_limit(),
            inflight_per_accelerator: default_inflight_per_accelerator(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            memory_cache_entries: default_memory_cache_entries(),
            segment: SegmentConfig::default(),
        }
    }
}

impl ServeConfig {
    /// Pick the batch size for a given amount of free memory.
    pub fn batch_size_for_free_memory(&self, free_bytes: u64) -> usize {
        batch_size_for_free_memory(&self.memory_tiers, self.max_batch_size, free_bytes)
    }
}

/// Largest tier batch size whose threshold `free_bytes` reaches, clamped to
/// `1..=max_batch_size`. More free memory never yields a smaller batch.
pub fn batch_size_for_free_memory(tiers: &[MemoryTier], max_batch_size: usize, free_bytes: u64) -> usize {
    tiers
        .iter()
        .filter(|tier| free_bytes >= tier.min_free_bytes)
        .map(|tier| tier.batch_size)
        .max()
        .unwrap_or(1)
        .clamp(1, max_batch_size.max(1))
}

fn default_cache_dir() -> PathBuf {
    if let Ok(from_env) = std::env::var("TALKHEAD_CACHE_DIR") {
        let trimmed = from_env.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("talkhead")
        .join("cache")
}

fn default_accelerators() -> Vec<usize> {
    vec![0]
}

fn default_fps() -> u32 {
    25
}

fn default_max_batch_size() -> usize {
    32
}

const GIB: u64 = 1024 * 1024 * 1024;

fn default_memory_tiers() -> Vec<MemoryTier> {
    vec![
        MemoryTier {
            min_free_bytes: 0,
            batch_size: 2,
        },
        MemoryTier {
            min_free_bytes: 4 * GIB,
            batch_size: 4,
        },
        MemoryTier {
            min_free_bytes: 8 * GIB,
            batch_size: 8,
        },
        MemoryTier {
            min_free_bytes: 16 * GIB,
            batch_size: 16,
        },
        MemoryTier {
            min_free_bytes: 32 * GIB,
            batch_size: 32,
        },
    ]
}

fn default_oom_retry_limit() -> usize {
    3
}

fn default_inflight_per_accelerator() -> usize {
    2
}

fn default_acquire_timeout_ms() -> u64 {
    30_000
}

fn default_memory_cache_entries() -> usize {
    16
}

/// How a streaming job chooses its segment boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CutMode {
    /// Cut every `target_secs`
    #[default]
    Fixed,
    /// Cut at the quietest point between `min_secs` and `max_secs`
    Activity,
}

/// How skipped frames are reconstructed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InterpolationMode {
    #[default]
    Linear,
}

/// Streaming segment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentConfig {
    #[serde(default = "default_target_secs")]
    pub target_secs: f32,

    #[serde(default = "default_min_secs")]
    pub min_secs: f32,

    #[serde(default = "default_max_secs")]
    pub max_secs: f32,

    /// Segments at or below this duration render every frame
    #[serde(default = "default_short_segment_secs")]
    pub short_segment_secs: f32,

    /// Batch size used for short segments
    #[serde(default = "default_short_batch_size")]
    pub short_batch_size: usize,

    /// Render every Nth frame of longer segments
    #[serde(default = "default_skip_factor")]
    pub skip_factor: usize,

    #[serde(default)]
    pub cut_mode: CutMode,

    #[serde(default)]
    pub interpolation: InterpolationMode,

    /// Stop the job at the first failed segment
    #[serde(default)]
    pub abort_on_failure: bool,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            target_secs: default_target_secs(),
            min_secs: default_min_secs(),
            max_secs: default_max_secs(),
            short_segment_secs: default_short_segment_secs(),
            short_batch_size: default_short_batch_size(),
            skip_factor: default_skip_factor(),
            cut_mode: CutMode::default(),
            interpolation: InterpolationMode::default(),
            abort_on_failure: false,
        }
    }
}

fn default_target_secs() -> f32 {
    1.0
}
fn default_min_secs() -> f32 {
    0.3
}
fn default_max_secs() -> f32 {
    1.5
}
fn default_short_segment_secs() -> f32 {
    0.5
}
fn default_short_batch_size() -> usize {
    4
}
fn default_skip_factor() -> usize {
    2
}

/// Session server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Longest request line accepted before it is rejected as malformed
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8765
}

fn default_max_line_bytes() -> usize {
    1024 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_size_is_monotonic_in_free_memory() {
        let config = ServeConfig::default();
        let mut last = 0;
        for gib in [0u64, 1, 4, 6, 8, 12, 16, 24, 32, 80] {
            let size = config.batch_size_for_free_memory(gib * GIB);
            assert!(size >= last, "batch size shrank at {gib} GiB");
            last = size;
        }
        assert_eq!(config.batch_size_for_free_memory(0), 2);
        assert_eq!(config.batch_size_for_free_memory(9 * GIB), 8);
    }

    #[test]
    fn test_batch_size_respects_cap() {
        let config = ServeConfig {
            max_batch_size: 6,
            ..Default::default()
        };
        assert_eq!(config.batch_size_for_free_memory(64 * GIB), 6);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ServeConfig =
            serde_json::from_str(r#"{"accelerators":[0,1],"segment":{"skip_factor":3}}"#).unwrap();
        assert_eq!(config.accelerators, vec![0, 1]);
        assert_eq!(config.oom_retry_limit, 3);
        assert_eq!(config.segment.skip_factor, 3);
        assert_eq!(config.segment.target_secs, 1.0);
    }
}
