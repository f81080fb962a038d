//! `Core` - caller-facing handle to the scheduler.
//!
//! Owns the worker pool and the memory accounting. Nodes are created through it so they
//! are registered for cache maintenance and their upstream consumer counts are known.
//! Dropping the last `Core` clone shuts the pool down: pending requests drain, then the
//! workers are joined.
//!
//! ```ignore
//! let core = Core::new(CoreConfig::default());
//! let src = core.create_node(NodeBuilder::new("Blank").video(info), BlankSource::new(..));
//! let frame = core.get_frame(&src, 0)?;
//! ```

use std::sync::Arc;

use crossbeam_channel::bounded;
use log::{debug, info};
use serde::Serialize;

use super::cache_man::CacheManager;
use super::request::Completion;
use super::scheduler::Pool;
use super::workers;
use crate::config::CoreConfig;
use crate::entities::{AudioFormat, Filter, Frame, NodeBuilder, NodeRef, VideoFormat};
use crate::error::{FrameError, FrameResult};

/// Crate version reported by [`Core::core_info`].
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Snapshot of scheduler and memory state.
#[derive(Debug, Clone, Serialize)]
pub struct CoreInfo {
    pub version: String,
    /// Thread budget
    pub max_threads: usize,
    pub spawned_threads: usize,
    pub idle_threads: usize,
    /// Bytes held by frame buffers
    pub used_memory: usize,
    pub max_memory: usize,
    /// Requests in the ready queue
    pub queued_requests: usize,
    /// Requests not yet completed (queued, running or waiting on inputs)
    pub pending_requests: usize,
    pub live_nodes: usize,
}

struct CoreInner {
    pool: Arc<Pool>,
    mem: Arc<CacheManager>,
    config: CoreConfig,
}

impl Drop for CoreInner {
    fn drop(&mut self) {
        self.pool.shutdown();
    }
}

/// Cheap to clone; every clone drives the same pool.
#[derive(Clone)]
pub struct Core {
    inner: Arc<CoreInner>,
}

impl Default for Core {
    fn default() -> Self {
        Self::new(CoreConfig::default())
    }
}

impl Core {
    pub fn new(config: CoreConfig) -> Self {
        let mem = Arc::new(CacheManager::new(config.resolved_max_cache_bytes()));
        let pool = Pool::new(&config, Arc::clone(&mem));
        info!("Core {} ready", VERSION);
        Self {
            inner: Arc::new(CoreInner { pool, mem, config }),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.inner.config
    }

    /// Create a node owning `filter`.
    ///
    /// Upstream nodes learn about the new consumer (which may toggle their auto cache).
    /// Zero outputs or zero frames on an output is fatal.
    pub fn create_node<F: Filter + 'static>(&self, builder: NodeBuilder, filter: F) -> NodeRef {
        let node = Arc::new(builder.build(Box::new(filter), self.inner.config.cache));
        for dep in node.dependencies() {
            dep.node.add_consumer(dep.pattern);
        }
        node.refresh_cache_enabled();
        self.inner.pool.register_node(&node);
        debug!(
            "Node '{}' created: {:?}, {} outputs, {} deps",
            node.name(),
            node.mode(),
            node.num_outputs(),
            node.dependencies().len()
        );
        node
    }

    // ========== Frame requests ==========

    /// Blocking request for frame `n` of output 0.
    pub fn get_frame(&self, node: &NodeRef, n: i32) -> FrameResult<Frame> {
        self.get_frame_output(node, n, 0)
    }

    /// Blocking request for frame `n` of `output`.
    ///
    /// Safe to call from inside a filter or a frame callback: the calling worker's thread
    /// slot is lent to a replacement while it waits.
    pub fn get_frame_output(&self, node: &NodeRef, n: i32, output: usize) -> FrameResult<Frame> {
        let (tx, rx) = bounded(1);
        let on_worker = workers::is_worker_thread();
        if on_worker {
            self.inner.pool.release_thread();
        }

        self.inner
            .pool
            .submit(node, n, output, Completion::Sync(tx));
        let result = rx.recv().unwrap_or(Err(FrameError::Shutdown));

        if on_worker {
            self.inner.pool.reserve_thread();
        }
        result
    }

    /// Request frame `n` of output 0; `callback` runs exactly once with the result.
    ///
    /// Callbacks never run concurrently with each other and always run on a worker thread,
    /// even when the result is known immediately (cache hit, invalid index). Requesting
    /// more frames from inside a callback is fine.
    pub fn get_frame_async<F>(&self, node: &NodeRef, n: i32, callback: F)
    where
        F: FnOnce(FrameResult<Frame>) + Send + 'static,
    {
        self.get_frame_async_output(node, n, 0, callback);
    }

    pub fn get_frame_async_output<F>(&self, node: &NodeRef, n: i32, output: usize, callback: F)
    where
        F: FnOnce(FrameResult<Frame>) + Send + 'static,
    {
        self.inner
            .pool
            .submit(node, n, output, Completion::Async(Box::new(callback)));
    }

    // ========== Threads ==========

    /// Set the worker thread budget (0 = number of logical CPUs). Returns the new budget.
    pub fn set_thread_count(&self, threads: usize) -> usize {
        let threads = if threads == 0 {
            num_cpus::get().max(1)
        } else {
            threads
        };
        self.inner.pool.set_max_threads(threads)
    }

    pub fn thread_count(&self) -> usize {
        self.inner.pool.max_threads()
    }

    // ========== Memory ==========

    /// Set the frame-buffer memory ceiling in bytes. Returns the new ceiling.
    pub fn set_max_cache_size(&self, bytes: usize) -> usize {
        let bytes = self.inner.mem.set_limit(bytes);
        if self.inner.mem.over_limit() {
            self.inner.pool.broadcast_adjust(true);
        }
        bytes
    }

    pub fn max_cache_size(&self) -> usize {
        self.inner.mem.limit()
    }

    pub fn used_memory(&self) -> usize {
        self.inner.mem.used()
    }

    pub fn mem(&self) -> &Arc<CacheManager> {
        &self.inner.mem
    }

    pub fn core_info(&self) -> CoreInfo {
        let counts = self.inner.pool.counts();
        let (used, limit) = self.inner.mem.mem();
        CoreInfo {
            version: VERSION.to_string(),
            max_threads: counts.max_threads,
            spawned_threads: counts.spawned,
            idle_threads: counts.idle,
            used_memory: used,
            max_memory: limit,
            queued_requests: counts.queued,
            pending_requests: counts.pending,
            live_nodes: counts.nodes,
        }
    }

    // ========== Allocation ==========

    pub fn new_video_frame(
        &self,
        format: VideoFormat,
        width: usize,
        height: usize,
        prop_src: Option<&Frame>,
    ) -> Frame {
        Frame::new_video(format, width, height, prop_src, &self.inner.mem)
    }

    pub fn new_audio_frame(
        &self,
        format: AudioFormat,
        samples: usize,
        prop_src: Option<&Frame>,
    ) -> Frame {
        Frame::new_audio(format, samples, prop_src, &self.inner.mem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{ActivationReason, VideoInfo, from_fn};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn core(threads: usize) -> Core {
        Core::new(CoreConfig {
            threads,
            max_cache_bytes: 256 * 1024 * 1024,
            ..Default::default()
        })
    }

    fn const_source(core: &Core, frames: i32, calls: Arc<AtomicUsize>) -> NodeRef {
        core.create_node(
            NodeBuilder::new("Const").video(VideoInfo::new(VideoFormat::GRAY8, 8, 8, frames)),
            from_fn(move |n, _, _, ctx| {
                calls.fetch_add(1, Ordering::SeqCst);
                let mut f = ctx.new_video_frame(VideoFormat::GRAY8, 8, 8, None);
                f.props_mut().set_int("_Index", n as i64);
                Ok(Some(f))
            }),
        )
    }

    #[test]
    fn sync_request_returns_frame() {
        let core = core(2);
        let calls = Arc::new(AtomicUsize::new(0));
        let src = const_source(&core, 4, Arc::clone(&calls));
        let f = core.get_frame(&src, 3).unwrap();
        assert_eq!(f.props().get_int("_Index"), Some(3));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn terminal_node_is_cached() {
        let core = core(2);
        let calls = Arc::new(AtomicUsize::new(0));
        let src = const_source(&core, 4, Arc::clone(&calls));
        let a = core.get_frame(&src, 1).unwrap();
        let b = core.get_frame(&src, 1).unwrap();
        assert!(Frame::ptr_eq(&a, &b));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalid_requests_fail_without_compute() {
        let core = core(1);
        let calls = Arc::new(AtomicUsize::new(0));
        let src = const_source(&core, 4, Arc::clone(&calls));

        assert!(matches!(
            core.get_frame(&src, 4),
            Err(FrameError::OutOfRange { n: 4, num_frames: 4, .. })
        ));
        assert!(matches!(core.get_frame(&src, -1), Err(FrameError::OutOfRange { .. })));
        assert!(matches!(
            core.get_frame_output(&src, 0, 1),
            Err(FrameError::NoOutput { output: 1, num_outputs: 1, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn async_callback_fires_once() {
        let core = core(2);
        let calls = Arc::new(AtomicUsize::new(0));
        let src = const_source(&core, 4, calls);
        let (tx, rx) = crossbeam_channel::unbounded();
        for n in 0..4 {
            let tx = tx.clone();
            core.get_frame_async(&src, n, move |r| {
                tx.send(r.map(|f| f.props().get_int("_Index"))).unwrap();
            });
        }
        let mut got: Vec<i64> = (0..4)
            .map(|_| rx.recv().unwrap().unwrap().unwrap())
            .collect();
        got.sort();
        assert_eq!(got, vec![0, 1, 2, 3]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn thread_budget_and_info() {
        let core = core(3);
        assert_eq!(core.thread_count(), 3);
        assert_eq!(core.set_thread_count(5), 5);
        assert!(core.set_thread_count(0) >= 1);
        let info = core.core_info();
        assert_eq!(info.version, VERSION);
        assert_eq!(info.max_memory, 256 * 1024 * 1024);
        assert_eq!(info.pending_requests, 0);
    }

    #[test]
    fn nested_sync_request_from_compute() {
        // a filter that blocks on another node from inside compute must not starve the
        // single-thread pool
        let core = core(1);
        let calls = Arc::new(AtomicUsize::new(0));
        let src = const_source(&core, 4, calls);
        let inner_core = core.clone();
        let inner_src = Arc::clone(&src);
        let outer = core.create_node(
            NodeBuilder::new("Nested").video(VideoInfo::new(VideoFormat::GRAY8, 8, 8, 4)),
            from_fn(move |n, _, reason, _ctx| {
                assert_eq!(reason, ActivationReason::Initial);
                let f = inner_core.get_frame(&inner_src, n)?;
                Ok(Some(f))
            }),
        );
        let f = core.get_frame(&outer, 2).unwrap();
        assert_eq!(f.props().get_int("_Index"), Some(2));
        assert_eq!(core.thread_count(), 1);
    }
}
