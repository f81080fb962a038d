//! Global frame-buffer memory accounting.
//!
//! **Why**: Node caches are sized independently, but they all draw from one budget. Every
//! plane buffer charges its size here on allocation and refunds it on release; the
//! scheduler checks [`CacheManager::over_limit`] after each job and broadcasts a shrink to
//! all caches when the ceiling is crossed. Allocation itself is never blocked.
//!
//! **Used by**: frame buffers (charge/refund), scheduler (pressure checks), `Core`
//! (ceiling get/set).

use log::{debug, info};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Atomic usage counter with a configurable ceiling.
#[derive(Debug)]
pub struct CacheManager {
    /// Bytes currently held by live frame buffers
    memory_usage: AtomicUsize,
    /// Ceiling in bytes - atomic for lock-free updates
    max_memory_bytes: AtomicUsize,
}

impl CacheManager {
    /// Create a manager with the given ceiling in bytes.
    pub fn new(max_memory_bytes: usize) -> Self {
        info!(
            "CacheManager init: limit={} MB",
            max_memory_bytes / 1024 / 1024
        );

        Self {
            memory_usage: AtomicUsize::new(0),
            max_memory_bytes: AtomicUsize::new(max_memory_bytes),
        }
    }

    /// True while usage is above the ceiling.
    pub fn over_limit(&self) -> bool {
        self.memory_usage.load(Ordering::Relaxed) > self.max_memory_bytes.load(Ordering::Relaxed)
    }

    /// Memory statistics (usage, limit)
    pub fn mem(&self) -> (usize, usize) {
        let usage = self.memory_usage.load(Ordering::Relaxed);
        let limit = self.max_memory_bytes.load(Ordering::Relaxed);
        (usage, limit)
    }

    pub fn used(&self) -> usize {
        self.memory_usage.load(Ordering::Relaxed)
    }

    pub fn limit(&self) -> usize {
        self.max_memory_bytes.load(Ordering::Relaxed)
    }

    /// Usage as a fraction of the ceiling (0.0 when the ceiling is zero).
    pub fn mem_usage_fraction(&self) -> f64 {
        let (usage, limit) = self.mem();
        if limit == 0 {
            0.0
        } else {
            usage as f64 / limit as f64
        }
    }

    /// Charge bytes for a new buffer.
    pub fn add_memory(&self, bytes: usize) {
        let new_usage = self.memory_usage.fetch_add(bytes, Ordering::Relaxed) + bytes;
        let limit = self.max_memory_bytes.load(Ordering::Relaxed);
        if new_usage > limit && new_usage - bytes <= limit {
            debug!(
                "Memory ceiling crossed: {} MB / {} MB",
                new_usage / 1024 / 1024,
                limit / 1024 / 1024
            );
        }
    }

    /// Refund bytes of a released buffer (saturating, never underflows)
    pub fn free_memory(&self, bytes: usize) {
        let _ = self
            .memory_usage
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    /// Replace the ceiling. Returns the new value.
    pub fn set_limit(&self, bytes: usize) -> usize {
        self.max_memory_bytes.store(bytes, Ordering::Relaxed);
        info!("Memory limit updated: {} MB", bytes / 1024 / 1024);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_tracking() {
        let manager = CacheManager::new(4 * 1024 * 1024);

        manager.add_memory(1024 * 1024); // 1 MB
        assert_eq!(manager.used(), 1024 * 1024);

        manager.free_memory(512 * 1024);
        assert_eq!(manager.used(), 512 * 1024);
    }

    #[test]
    fn test_free_saturates() {
        let manager = CacheManager::new(1024);
        manager.add_memory(10);
        manager.free_memory(100);
        assert_eq!(manager.used(), 0);
    }

    #[test]
    fn test_over_limit() {
        let manager = CacheManager::new(1000);
        manager.add_memory(1000);
        assert!(!manager.over_limit());
        manager.add_memory(1);
        assert!(manager.over_limit());
        assert_eq!(manager.set_limit(5000), 5000);
        assert!(!manager.over_limit());
        assert!((manager.mem_usage_fraction() - 0.2002).abs() < 1e-9);
    }
}
