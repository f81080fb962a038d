//! Node - one filter instance in the graph.
//!
//! A node owns its [`Filter`], declares one [`NodeInfo`] per output, lists the upstream
//! nodes it reads from and carries one [`FrameCache`] per output.
//!
//! Nodes are shared as [`NodeRef`] (`Arc<Node>`): user handles, downstream consumers and
//! pending requests all hold one. The scheduler registry only keeps `Weak` references, so a
//! node (and its filter) is dropped exactly once, as soon as nothing can ask it for frames.
//!
//! ## Concurrency contract
//!
//! | mode               | Initial      | AllFramesReady | frames in flight |
//! |--------------------|--------------|----------------|------------------|
//! | `Parallel`         | concurrent   | concurrent     | any              |
//! | `ParallelRequests` | concurrent   | serialized     | any              |
//! | `Unordered`        | serialized   | serialized     | any              |
//! | `FrameState`       | serialized   | serialized     | one index        |
//!
//! Serialization uses a try-lock ([`Node::try_serial`]) taken by the scheduler; it never
//! blocks a worker.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::format::{AudioInfo, NodeInfo, VideoInfo};
use super::frame::Frame;
use super::traits::Filter;
use crate::config::CachePolicy;
use crate::core::cache::{CacheStats, FrameCache};
use crate::fatal;

/// Shared handle to a node.
pub type NodeRef = Arc<Node>;

/// How many compute calls a node tolerates at once. See module docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum FilterMode {
    #[default]
    Parallel,
    ParallelRequests,
    Unordered,
    FrameState,
}

/// How a consumer indexes into an upstream node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum RequestPattern {
    /// Any index, possibly several per output frame
    #[default]
    General,
    /// Only ever the index being produced
    StrictSpatial,
}

/// Whether a node's caches are used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CacheMode {
    /// Decided from flags and consumers
    #[default]
    Auto,
    ForceEnable,
    ForceDisable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeFlags {
    /// Never cache this node's output
    pub no_cache: bool,
    /// This node is itself a cache; caching it again is pointless
    pub is_cache: bool,
    /// Frames are cheapest when produced in increasing order
    pub make_linear: bool,
}

/// Upstream edge.
#[derive(Clone)]
pub struct Dependency {
    pub node: NodeRef,
    pub pattern: RequestPattern,
}

impl std::fmt::Debug for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dependency")
            .field("node", &self.node.name())
            .field("pattern", &self.pattern)
            .finish()
    }
}

/// Everything needed to create a node except the filter itself.
#[derive(Debug, Clone)]
pub struct NodeBuilder {
    name: String,
    mode: FilterMode,
    flags: NodeFlags,
    outputs: Vec<NodeInfo>,
    deps: Vec<Dependency>,
}

impl NodeBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: FilterMode::default(),
            flags: NodeFlags::default(),
            outputs: Vec::new(),
            deps: Vec::new(),
        }
    }

    pub fn mode(mut self, mode: FilterMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn flags(mut self, flags: NodeFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Append a video output.
    pub fn video(mut self, info: VideoInfo) -> Self {
        self.outputs.push(NodeInfo::Video(info));
        self
    }

    /// Append an audio output.
    pub fn audio(mut self, info: AudioInfo) -> Self {
        self.outputs.push(NodeInfo::Audio(info));
        self
    }

    pub fn output(mut self, info: NodeInfo) -> Self {
        self.outputs.push(info);
        self
    }

    /// Declare an upstream node this filter requests frames from.
    pub fn dependency(mut self, node: &NodeRef, pattern: RequestPattern) -> Self {
        self.deps.push(Dependency {
            node: Arc::clone(node),
            pattern,
        });
        self
    }

    /// Validate and assemble the node. Zero outputs or an output declaring no frames is a
    /// fatal defect.
    pub(crate) fn build(self, filter: Box<dyn Filter>, policy: CachePolicy) -> Node {
        if self.outputs.is_empty() {
            fatal!("Node '{}' declares no outputs", self.name);
        }
        for (i, info) in self.outputs.iter().enumerate() {
            if info.num_frames() <= 0 {
                fatal!(
                    "Node '{}' output {} declares {} frames",
                    self.name,
                    i,
                    info.num_frames()
                );
            }
        }

        let caches = self
            .outputs
            .iter()
            .map(|_| Mutex::new(FrameCache::from_policy(policy)))
            .collect();
        let last_requested = self.outputs.iter().map(|_| AtomicI64::new(-1)).collect();

        Node {
            id: Uuid::new_v4(),
            name: self.name,
            mode: self.mode,
            flags: self.flags,
            outputs: self.outputs,
            deps: self.deps,
            filter,
            busy: AtomicBool::new(false),
            serial_frame: AtomicI64::new(-1),
            caches,
            cache_mode: Mutex::new(CacheMode::Auto),
            cache_enabled: AtomicBool::new(false),
            consumers: AtomicUsize::new(0),
            general_consumers: AtomicUsize::new(0),
            last_requested,
            computes: AtomicU64::new(0),
        }
    }
}

/// Held while a serialized node is inside `compute`.
pub struct SerialGuard {
    node: NodeRef,
}

impl Drop for SerialGuard {
    fn drop(&mut self) {
        self.node.busy.store(false, Ordering::Release);
    }
}

pub struct Node {
    id: Uuid,
    name: String,
    mode: FilterMode,
    flags: NodeFlags,
    outputs: Vec<NodeInfo>,
    deps: Vec<Dependency>,
    filter: Box<dyn Filter>,

    /// Serial lock
    busy: AtomicBool,
    /// FrameState: index currently in flight, -1 when none. Written under the pool lock.
    serial_frame: AtomicI64,

    caches: Vec<Mutex<FrameCache>>,
    cache_mode: Mutex<CacheMode>,
    cache_enabled: AtomicBool,
    consumers: AtomicUsize,
    general_consumers: AtomicUsize,

    /// Highest index requested per output (make_linear bookkeeping)
    last_requested: Vec<AtomicI64>,
    computes: AtomicU64,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("outputs", &self.outputs)
            .finish()
    }
}

impl Node {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    pub fn flags(&self) -> NodeFlags {
        self.flags
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Declared info of `output`.
    pub fn info(&self, output: usize) -> Option<&NodeInfo> {
        self.outputs.get(output)
    }

    pub fn num_frames(&self, output: usize) -> i32 {
        self.outputs.get(output).map_or(0, NodeInfo::num_frames)
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.deps
    }

    pub(crate) fn filter(&self) -> &dyn Filter {
        self.filter.as_ref()
    }

    /// Number of `compute` invocations so far.
    pub fn compute_count(&self) -> u64 {
        self.computes.load(Ordering::Relaxed)
    }

    pub(crate) fn count_compute(&self) {
        self.computes.fetch_add(1, Ordering::Relaxed);
    }

    // ========== Serialization ==========

    /// Take the serial lock if it is free.
    pub(crate) fn try_serial(self: &Arc<Self>) -> Option<SerialGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SerialGuard {
                node: Arc::clone(self),
            })
    }

    /// FrameState index in flight (-1 = none).
    pub fn serial_frame(&self) -> i64 {
        self.serial_frame.load(Ordering::Acquire)
    }

    pub(crate) fn set_serial_frame(&self, n: i64) {
        self.serial_frame.store(n, Ordering::Release);
    }

    // ========== Consumers & linear access ==========

    pub(crate) fn add_consumer(&self, pattern: RequestPattern) {
        self.consumers.fetch_add(1, Ordering::Relaxed);
        if pattern == RequestPattern::General {
            self.general_consumers.fetch_add(1, Ordering::Relaxed);
        }
        self.refresh_cache_enabled();
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.load(Ordering::Relaxed)
    }

    pub(crate) fn last_requested(&self, output: usize) -> i64 {
        self.last_requested[output].load(Ordering::Relaxed)
    }

    pub(crate) fn note_requested(&self, output: usize, n: i32) {
        self.last_requested[output].fetch_max(n as i64, Ordering::Relaxed);
    }

    // ========== Cache ==========

    pub fn cache_mode(&self) -> CacheMode {
        *self.cache_mode.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_cache_mode(&self, mode: CacheMode) {
        *self.cache_mode.lock().unwrap_or_else(|e| e.into_inner()) = mode;
        self.refresh_cache_enabled();
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache_enabled.load(Ordering::Acquire)
    }

    /// Auto rule: enabled unless flagged no_cache/is_cache, and only when the output is
    /// likely to be re-read (no consumer, several consumers, a General consumer, or linear
    /// access).
    fn auto_cache(&self) -> bool {
        if self.flags.no_cache || self.flags.is_cache {
            return false;
        }
        let consumers = self.consumers.load(Ordering::Relaxed);
        self.flags.make_linear
            || consumers != 1
            || self.general_consumers.load(Ordering::Relaxed) > 0
    }

    pub(crate) fn refresh_cache_enabled(&self) {
        let enabled = match self.cache_mode() {
            CacheMode::Auto => self.auto_cache(),
            CacheMode::ForceEnable => true,
            CacheMode::ForceDisable => false,
        };
        let was = self.cache_enabled.swap(enabled, Ordering::AcqRel);
        if was && !enabled {
            for cache in &self.caches {
                lock(cache).clear();
            }
        }
        if was != enabled {
            debug!("Node '{}' cache {}", self.name, if enabled { "enabled" } else { "disabled" });
        }
    }

    /// Set bounds and fixed-size flag on every output cache. `None` keeps a value.
    pub fn set_cache_options(
        &self,
        fixed_size: Option<bool>,
        max_live: Option<usize>,
        max_ghost: Option<usize>,
    ) {
        for cache in &self.caches {
            let mut c = lock(cache);
            if let Some(fixed) = fixed_size {
                c.set_fixed_size(fixed);
            }
            if let Some(live) = max_live {
                c.set_max_live(live);
            }
            if let Some(ghost) = max_ghost {
                c.set_max_ghost(ghost);
            }
        }
    }

    pub(crate) fn cache_lookup(&self, output: usize, n: i32) -> Option<Frame> {
        if !self.cache_enabled() {
            return None;
        }
        lock(&self.caches[output]).lookup(n)
    }

    /// Presence check that does not touch access counters.
    pub(crate) fn cache_contains(&self, output: usize, n: i32) -> bool {
        self.cache_enabled() && lock(&self.caches[output]).contains(n)
    }

    pub(crate) fn cache_insert(&self, output: usize, n: i32, frame: &Frame) {
        if self.cache_enabled() {
            lock(&self.caches[output]).insert(n, frame.clone());
        }
    }

    pub(crate) fn cache_max_live(&self, output: usize) -> usize {
        lock(&self.caches[output]).max_live()
    }

    /// Re-evaluate every output cache (periodic tick or memory pressure).
    pub fn adjust_caches(&self, need_memory: bool) {
        if !self.cache_enabled() {
            return;
        }
        for cache in &self.caches {
            lock(cache).adjust(need_memory);
        }
    }

    pub fn cache_stats(&self, output: usize) -> Option<CacheStats> {
        self.caches.get(output).map(|c| lock(c).stats())
    }

    pub fn clear_cache(&self) {
        for cache in &self.caches {
            lock(cache).clear();
        }
    }
}

fn lock(cache: &Mutex<FrameCache>) -> MutexGuard<'_, FrameCache> {
    cache.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::format::{VideoFormat, VideoInfo};
    use crate::entities::traits::from_fn;

    fn node(name: &str, flags: NodeFlags) -> NodeRef {
        let info = VideoInfo::new(VideoFormat::GRAY8, 8, 8, 10);
        Arc::new(
            NodeBuilder::new(name)
                .flags(flags)
                .video(info)
                .build(Box::new(from_fn(|_, _, _, _| Ok(None))), CachePolicy::default()),
        )
    }

    #[test]
    fn auto_cache_follows_consumers() {
        let n = node("src", NodeFlags::default());
        n.refresh_cache_enabled();
        // no consumers: terminal node is cached
        assert!(n.cache_enabled());

        n.add_consumer(RequestPattern::StrictSpatial);
        assert!(!n.cache_enabled());

        n.add_consumer(RequestPattern::StrictSpatial);
        assert!(n.cache_enabled());
    }

    #[test]
    fn general_consumer_enables_cache() {
        let n = node("src", NodeFlags::default());
        n.add_consumer(RequestPattern::General);
        assert!(n.cache_enabled());
    }

    #[test]
    fn flags_and_modes_override() {
        let n = node(
            "nc",
            NodeFlags {
                no_cache: true,
                ..Default::default()
            },
        );
        n.refresh_cache_enabled();
        assert!(!n.cache_enabled());
        n.set_cache_mode(CacheMode::ForceEnable);
        assert!(n.cache_enabled());
        n.set_cache_mode(CacheMode::ForceDisable);
        assert!(!n.cache_enabled());
    }

    #[test]
    fn serial_lock_is_exclusive() {
        let n = node("s", NodeFlags::default());
        let g = n.try_serial().expect("free");
        assert!(n.try_serial().is_none());
        drop(g);
        assert!(n.try_serial().is_some());
    }

    #[test]
    fn cache_options_apply_to_all_outputs() {
        let n = node("s", NodeFlags::default());
        n.set_cache_options(Some(true), Some(3), Some(0));
        let stats = n.cache_stats(0).unwrap();
        assert_eq!(stats.max_live, 3);
        assert_eq!(stats.max_ghost, 0);
        assert!(n.cache_stats(1).is_none());
    }
}
