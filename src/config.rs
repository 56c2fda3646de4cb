//! Ambient configuration (SPEC_FULL §2/§6): every tunable named by the spec gathered into one
//! `serde`-deserializable struct, with defaults matching the spec's stated defaults.

use serde::{Deserialize, Serialize};
use crate::util::{DEFAULT_MAX_ACTIVE, DELIVERY_RING_SIZE, MB};

/// Eviction policy selector (§4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionBehavior {
    /// No automatic eviction; callers must `evict`/`drop` explicitly.
    Manual,
    /// Evict the least-recently-requested image's most-recently-used frame first.
    ImageLruFrameMru,
}

impl Default for EvictionBehavior {
    fn default() -> Self {
        EvictionBehavior::ImageLruFrameMru
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// AIO driver: number of concurrent overlapped slots. Must be a power of two (§6).
    pub aio_max_active: usize,
    /// PIO driver: per-stream interval-delivery ring capacity (§6).
    pub delivery_ring_size: usize,
    /// I/O buffer pool: total reservation size, in bytes.
    pub buffer_pool_total_bytes: usize,
    /// I/O buffer pool: size of each fixed buffer, in bytes.
    pub buffer_pool_alloc_bytes: usize,
    /// Image cache: soft byte budget that triggers the eviction policy (§4.10).
    pub cache_bytes_limit: u64,
    /// Image cache: eviction policy.
    pub eviction_behavior: EvictionBehavior,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            aio_max_active: DEFAULT_MAX_ACTIVE,
            delivery_ring_size: DELIVERY_RING_SIZE,
            buffer_pool_total_bytes: 256 * MB,
            buffer_pool_alloc_bytes: MB,
            cache_bytes_limit: 512 * MB as u64,
            eviction_behavior: EvictionBehavior::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.aio_max_active, 128);
        assert_eq!(cfg.delivery_ring_size, 4);
    }

    #[test]
    fn partial_json_overrides_fall_back_to_defaults() {
        let cfg = PipelineConfig::from_json(r#"{"cache_bytes_limit": 1024}"#).unwrap();
        assert_eq!(cfg.cache_bytes_limit, 1024);
        assert_eq!(cfg.aio_max_active, 128);
    }
}
