//! Scheduler core - caches, request graph, worker pool
//!
//! These modules turn a graph of nodes into concurrently executed compute calls.

pub mod cache;
pub mod cache_man;
pub mod context;
pub mod engine;
pub mod request;
pub(crate) mod scheduler;
pub(crate) mod workers;

// Re-exports for convenience
pub use cache::{CacheAction, CacheStats, FrameCache};
pub use cache_man::CacheManager;
pub use context::FrameContext;
pub use engine::{Core, CoreInfo, VERSION};
pub use request::{FrameCallback, RequestKey};
