//! framepull - pull-based frame computation scheduler
//!
//! A graph of filter nodes is evaluated on demand: asking a node for a frame asks its
//! upstream nodes for whatever that frame needs, runs every ready compute step on a worker
//! pool while honoring each node's concurrency mode, and caches results per node.

// Scheduler core (caches, request graph, workers)
pub mod core;

pub mod cli;
pub mod config;
pub mod entities;
pub mod error;
pub mod filters;

// Re-export commonly used types
pub use config::{CachePolicy, CoreConfig};
pub use core::{CacheManager, Core, CoreInfo, FrameContext};
pub use entities::{
    ActivationReason, Filter, FilterMode, Frame, NodeBuilder, NodeFlags, NodeInfo, NodeRef,
    RequestPattern, VideoFormat, VideoInfo,
};
pub use error::{FrameError, FrameResult};
