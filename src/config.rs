//! Core configuration: thread budget, memory ceiling, cache policy.
//!
//! Everything here is a tunable. The cache thresholds in particular are empirical and
//! untuned, so they live in [`CachePolicy`] rather than in the cache code.
//!
//! Configuration can be built in code or loaded from JSON:
//!
//! ```json
//! { "threads": 8, "max_cache_bytes": 2147483648, "cache": { "grow_step": 4 } }
//! ```

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::Path;
use sysinfo::System;

/// Default memory ceiling on 64-bit targets when nothing better is known (4 GiB).
pub const DEFAULT_MAX_CACHE_BYTES: usize = 4 * (1 << 30);

/// Sizing policy shared by every node cache.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    /// Live slots a fresh cache starts with.
    pub initial_max_live: usize,
    /// Ghost slots a fresh cache starts with.
    pub initial_max_ghost: usize,
    /// Accesses needed before a resize is recommended.
    pub min_accesses: u64,
    /// Near-miss fraction above which growing pays off.
    pub grow_near_miss: f64,
    /// Far-miss fraction above which the cache is probably watching a linear scan.
    pub shrink_far_miss: f64,
    /// Live slots added on Grow.
    pub grow_step: usize,
    /// Live slots removed on Shrink.
    pub shrink_step: usize,
    /// Live slots removed on Shrink while memory is over the ceiling.
    pub pressure_shrink_step: usize,
    /// Live slot floor.
    pub min_live: usize,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            initial_max_live: 20,
            initial_max_ghost: 20,
            min_accesses: 30,
            grow_near_miss: 0.2,
            shrink_far_miss: 0.9,
            grow_step: 2,
            shrink_step: 1,
            pressure_shrink_step: 2,
            min_live: 1,
        }
    }
}

/// Top-level core configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Maximum worker threads (0 = number of logical CPUs).
    pub threads: usize,
    /// Global memory ceiling for frame buffers in bytes (0 = derive from system memory).
    pub max_cache_bytes: usize,
    /// Fraction of available memory used when deriving the ceiling.
    pub mem_fraction: f64,
    /// Memory kept back for the system when deriving the ceiling (GB).
    pub reserve_gb: f64,
    /// External requests between two cache re-evaluation broadcasts.
    pub cache_tick_interval: u64,
    /// Node cache sizing policy.
    pub cache: CachePolicy,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            max_cache_bytes: 0,
            mem_fraction: 0.5,
            reserve_gb: 2.0,
            cache_tick_interval: 100,
            cache: CachePolicy::default(),
        }
    }
}

impl CoreConfig {
    /// Load configuration from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg: Self = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        info!("Loaded core config from {}", path.display());
        Ok(cfg)
    }

    /// Thread budget with auto-detection applied.
    pub fn resolved_threads(&self) -> usize {
        if self.threads == 0 {
            num_cpus::get().max(1)
        } else {
            self.threads
        }
    }

    /// Memory ceiling with auto-detection applied.
    ///
    /// Auto mode takes `mem_fraction` of available memory after `reserve_gb`, never more
    /// than [`DEFAULT_MAX_CACHE_BYTES`]. If the system reports nothing usable the default
    /// ceiling is used as is.
    pub fn resolved_max_cache_bytes(&self) -> usize {
        if self.max_cache_bytes > 0 {
            return self.max_cache_bytes;
        }

        let mut sys = System::new();
        sys.refresh_memory();

        let available = sys.available_memory() as usize;
        let reserve = (self.reserve_gb * 1024.0 * 1024.0 * 1024.0) as usize;
        let usable = available.saturating_sub(reserve);
        let derived = (usable as f64 * self.mem_fraction.clamp(0.0, 1.0)) as usize;

        if derived == 0 {
            DEFAULT_MAX_CACHE_BYTES
        } else {
            derived.min(DEFAULT_MAX_CACHE_BYTES)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_policy_constants() {
        let p = CachePolicy::default();
        assert_eq!(p.min_accesses, 30);
        assert_eq!(p.grow_near_miss, 0.2);
        assert_eq!(p.shrink_far_miss, 0.9);
        assert_eq!(p.min_live, 1);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: CoreConfig =
            serde_json::from_str(r#"{ "threads": 3, "cache": { "grow_step": 5 } }"#).unwrap();
        assert_eq!(cfg.threads, 3);
        assert_eq!(cfg.cache.grow_step, 5);
        assert_eq!(cfg.cache.shrink_step, 1);
        assert_eq!(cfg.cache_tick_interval, 100);
    }

    #[test]
    fn explicit_values_win() {
        let cfg = CoreConfig {
            threads: 7,
            max_cache_bytes: 1234,
            ..Default::default()
        };
        assert_eq!(cfg.resolved_threads(), 7);
        assert_eq!(cfg.resolved_max_cache_bytes(), 1234);
    }

    #[test]
    fn auto_values_are_positive() {
        let cfg = CoreConfig::default();
        assert!(cfg.resolved_threads() >= 1);
        let bytes = cfg.resolved_max_cache_bytes();
        assert!(bytes > 0 && bytes <= DEFAULT_MAX_CACHE_BYTES);
    }
}
