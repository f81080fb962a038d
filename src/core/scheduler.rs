//! Request graph scheduler.
//!
//! One mutex ([`Pool::lock`]) guards the whole pending-work graph:
//!
//! ```text
//! requests:  RequestId -> FrameRequest      (arena)
//! in_flight: RequestKey -> RequestId        (dedup: one request per node/frame/output)
//! ready:     BTreeSet<(order, n, id)>       (runnable, oldest submission first)
//! deferred:  VecDeque<(callback, result)>   (async results known at submit time)
//! nodes:     Vec<Weak<Node>>                (cache broadcasts)
//! ```
//!
//! A request is created by an external caller or by a filter's Initial activation. When
//! its Initial call declares inputs it waits (not queued) until every input resolved, then
//! runs again as AllFramesReady. Completion walks the dependent lists and feeds the result
//! (or the first error) to every waiter.
//!
//! Lock order: pool lock, then a node cache lock. Nothing runs user code while the pool lock
//! is held: compute, frame drops of scratch data and completion callbacks all happen after
//! it is released.
//!
//! Async callbacks only ever run on workers. A callback may itself call `get_frame_async`;
//! if that result is already known (cache hit, bad index) it is deferred to a worker rather
//! than delivered on the thread that still holds the callback lock.

use std::any::Any;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};

use log::{debug, info, trace, warn};

use super::cache_man::CacheManager;
use super::context::FrameContext;
use super::request::{Completion, FrameRequest, Phase, RequestId, RequestKey};
use super::workers;
use crate::config::CoreConfig;
use crate::entities::{ActivationReason, FilterMode, Frame, Node, NodeRef, SerialGuard};
use crate::error::{FrameError, FrameResult};
use crate::fatal;

pub(crate) type Delivery = (Completion, FrameResult<Frame>);

/// Side effects of completing requests, carried out after the pool lock is released.
#[derive(Default)]
struct Settled {
    deliveries: Vec<Delivery>,
    /// Node handles of finished requests; the last one may drop a filter
    released: Vec<NodeRef>,
}

/// Everything guarded by the pool lock.
pub(crate) struct PoolState {
    requests: HashMap<RequestId, FrameRequest>,
    in_flight: HashMap<RequestKey, RequestId>,
    ready: BTreeSet<(u64, i32, RequestId)>,
    deferred: VecDeque<Delivery>,
    nodes: Vec<Weak<Node>>,

    next_id: RequestId,
    next_order: u64,
    ticks: u64,

    pub(crate) max_threads: usize,
    pub(crate) spawned: usize,
    pub(crate) idle: usize,
    pub(crate) next_worker: usize,
    pub(crate) stopping: bool,
    pub(crate) handles: Vec<JoinHandle<()>>,
}

/// One picked unit of work, carried out of the lock.
pub(crate) struct Task {
    id: RequestId,
    node: NodeRef,
    key: RequestKey,
    reason: ActivationReason,
    available: HashMap<RequestKey, Frame>,
    frame_data: Option<Box<dyn Any + Send>>,
    serial: Option<SerialGuard>,
}

impl PoolState {
    fn new(max_threads: usize) -> Self {
        Self {
            requests: HashMap::new(),
            in_flight: HashMap::new(),
            ready: BTreeSet::new(),
            deferred: VecDeque::new(),
            nodes: Vec::new(),
            next_id: 0,
            next_order: 0,
            ticks: 0,
            max_threads,
            spawned: 0,
            idle: 0,
            next_worker: 0,
            stopping: false,
            handles: Vec::new(),
        }
    }

    pub(crate) fn has_ready(&self) -> bool {
        self.backlog() > 0
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.requests.is_empty() && self.deferred.is_empty()
    }

    /// Queued computes plus deferred callbacks.
    fn backlog(&self) -> usize {
        self.ready.len() + self.deferred.len()
    }

    pub(crate) fn take_deferred(&mut self) -> Option<Delivery> {
        self.deferred.pop_front()
    }

    fn enqueue(&mut self, id: RequestId) {
        if let Some(req) = self.requests.get_mut(&id)
            && !req.queued
        {
            req.queued = true;
            self.ready.insert(req.queue_key(id));
        }
    }

    fn lower_order(&mut self, id: RequestId, order: u64) {
        let Some(req) = self.requests.get_mut(&id) else {
            return;
        };
        if order >= req.order {
            return;
        }
        if req.queued {
            self.ready.remove(&req.queue_key(id));
        }
        req.order = order;
        if req.queued {
            self.ready.insert(req.queue_key(id));
        }
    }

    fn insert_request(&mut self, node: NodeRef, key: RequestKey, order: u64) -> RequestId {
        let id = self.next_id;
        self.next_id += 1;
        trace!("request #{} '{}' frame {} output {}", id, node.name(), key.n, key.output);
        self.in_flight.insert(key, id);
        self.requests.insert(id, FrameRequest::new(node, key, order));
        id
    }

    /// New request for `key`. For make_linear nodes the gap since the last requested index
    /// is queued first so the node sees increasing indices.
    fn create_request(&mut self, node: NodeRef, key: RequestKey, order: u64) -> RequestId {
        if node.flags().make_linear {
            self.prefetch_linear(&node, key, order);
        }
        node.note_requested(key.output, key.n);
        self.insert_request(node, key, order)
    }

    fn prefetch_linear(&mut self, node: &NodeRef, key: RequestKey, order: u64) {
        let last = node.last_requested(key.output);
        let n = key.n as i64;
        if n <= last + 1 || (n - last) as usize > node.cache_max_live(key.output) {
            return;
        }
        for i in (last + 1)..n {
            let gap = RequestKey { n: i as i32, ..key };
            if self.in_flight.contains_key(&gap) || node.cache_contains(key.output, gap.n) {
                continue;
            }
            let id = self.insert_request(Arc::clone(node), gap, order);
            self.enqueue(id);
        }
        trace!("'{}' linear prefetch {}..{}", node.name(), last + 1, n);
    }

    /// First runnable entry in queue order that the node's mode admits right now.
    pub(crate) fn pick(&mut self) -> Option<Task> {
        let mut chosen = None;
        for &entry in &self.ready {
            let (_, n, id) = entry;
            let Some(req) = self.requests.get(&id) else {
                continue;
            };
            let node = &req.node;
            let mode = node.mode();

            if mode == FilterMode::FrameState {
                let current = node.serial_frame();
                if current != -1 && current != n as i64 {
                    continue;
                }
            }

            let needs_serial = match mode {
                FilterMode::Parallel => false,
                FilterMode::ParallelRequests => req.phase == Phase::AllUpstreamReady,
                FilterMode::Unordered | FilterMode::FrameState => true,
            };
            let serial = if needs_serial {
                match node.try_serial() {
                    Some(guard) => Some(guard),
                    None => continue,
                }
            } else {
                None
            };

            chosen = Some((entry, serial));
            break;
        }

        let (entry, serial) = chosen?;
        self.ready.remove(&entry);
        let id = entry.2;
        let req = self.requests.get_mut(&id)?;
        req.queued = false;

        if req.node.mode() == FilterMode::FrameState && req.node.serial_frame() == -1 {
            req.node.set_serial_frame(req.key.n as i64);
            req.holds_serial = true;
        }

        let reason = match req.phase {
            Phase::Initial => ActivationReason::Initial,
            Phase::AllUpstreamReady => ActivationReason::AllFramesReady,
            Phase::Error => fatal!("Errored request #{} found in the ready queue", id),
        };

        Some(Task {
            id,
            node: Arc::clone(&req.node),
            key: req.key,
            reason,
            available: mem::take(&mut req.available),
            frame_data: req.frame_data.take(),
            serial,
        })
    }

    /// Initial returned with inputs declared: attach to in-flight work, take cache hits,
    /// create the rest.
    fn resolve_requests(
        &mut self,
        id: RequestId,
        requested: Vec<(NodeRef, RequestKey)>,
        frame_data: Option<Box<dyn Any + Send>>,
    ) {
        let Some(order) = self.requests.get(&id).map(|r| r.order) else {
            return;
        };

        let mut outstanding = 0;
        let mut resolved = HashMap::new();
        for (node, key) in requested {
            if let Some(&up) = self.in_flight.get(&key) {
                self.lower_order(up, order);
                if let Some(r) = self.requests.get_mut(&up) {
                    r.dependents.push(id);
                }
                outstanding += 1;
            } else if let Some(frame) = node.cache_lookup(key.output, key.n) {
                resolved.insert(key, frame);
            } else {
                let up = self.create_request(node, key, order);
                if let Some(r) = self.requests.get_mut(&up) {
                    r.dependents.push(id);
                }
                self.enqueue(up);
                outstanding += 1;
            }
        }

        let Some(req) = self.requests.get_mut(&id) else {
            return;
        };
        req.available = resolved;
        req.frame_data = frame_data;
        req.outstanding = outstanding;
        if outstanding == 0 {
            req.phase = Phase::AllUpstreamReady;
            self.enqueue(id);
        }
    }

    /// Finish `id` and everything its result settles. Errors reach every transitive
    /// dependent without running it again. Callbacks are collected into `out` for delivery
    /// outside the lock.
    fn complete(&mut self, id: RequestId, result: FrameResult<Frame>, out: &mut Settled) {
        let mut stack = vec![(id, result)];

        while let Some((id, result)) = stack.pop() {
            let Some(req) = self.requests.remove(&id) else {
                continue;
            };
            if self.in_flight.get(&req.key) == Some(&id) {
                self.in_flight.remove(&req.key);
            }
            if req.queued {
                self.ready.remove(&req.queue_key(id));
            }
            if req.holds_serial && req.node.serial_frame() == req.key.n as i64 {
                req.node.set_serial_frame(-1);
            }

            if let Err(e) = &result {
                if req.dependents.is_empty() && req.completions.is_empty() {
                    warn!(
                        "Unobserved failure of '{}' frame {}: {}",
                        req.node.name(),
                        req.key.n,
                        e
                    );
                } else {
                    debug!("'{}' frame {} failed: {}", req.node.name(), req.key.n, e);
                }
            }

            for completion in req.completions {
                out.deliveries.push((completion, result.clone()));
            }

            for dep in req.dependents {
                let Some(d) = self.requests.get_mut(&dep) else {
                    continue;
                };
                match &result {
                    Ok(frame) => {
                        d.available.insert(req.key, frame.clone());
                        d.outstanding = d.outstanding.saturating_sub(1);
                        if d.outstanding == 0 && d.phase == Phase::Initial {
                            d.phase = Phase::AllUpstreamReady;
                            self.enqueue(dep);
                        }
                    }
                    Err(e) => {
                        if d.phase != Phase::Error {
                            d.phase = Phase::Error;
                            d.error = Some(e.message());
                            stack.push((dep, Err(e.clone())));
                        }
                    }
                }
            }
            out.released.push(req.node);
        }
    }

    /// Live registered nodes; dead entries are pruned.
    fn live_nodes(&mut self) -> Vec<NodeRef> {
        self.nodes.retain(|w| w.strong_count() > 0);
        self.nodes.iter().filter_map(Weak::upgrade).collect()
    }
}

/// Counters for [`CoreInfo`](super::engine::CoreInfo).
#[derive(Debug, Clone, Copy)]
pub(crate) struct PoolCounts {
    pub max_threads: usize,
    pub spawned: usize,
    pub idle: usize,
    pub queued: usize,
    pub pending: usize,
    pub nodes: usize,
}

pub(crate) struct Pool {
    state: Mutex<PoolState>,
    cond: Condvar,
    /// Serializes async completion callbacks
    callback_lock: Mutex<()>,
    mem: Arc<CacheManager>,
    tick_interval: u64,
    /// A memory-pressure broadcast is running
    relieving: AtomicBool,
}

impl Pool {
    pub(crate) fn new(config: &CoreConfig, mem: Arc<CacheManager>) -> Arc<Self> {
        let threads = config.resolved_threads();
        info!("Scheduler init: {} threads max", threads);
        Arc::new(Self {
            state: Mutex::new(PoolState::new(threads)),
            cond: Condvar::new(),
            callback_lock: Mutex::new(()),
            mem,
            tick_interval: config.cache_tick_interval,
            relieving: AtomicBool::new(false),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn wait<'a>(&self, st: MutexGuard<'a, PoolState>) -> MutexGuard<'a, PoolState> {
        self.cond.wait(st).unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn register_node(&self, node: &NodeRef) {
        let mut st = self.lock();
        st.nodes.retain(|w| w.strong_count() > 0);
        st.nodes.push(Arc::downgrade(node));
    }

    pub(crate) fn counts(&self) -> PoolCounts {
        let mut st = self.lock();
        let nodes = st.live_nodes().len();
        PoolCounts {
            max_threads: st.max_threads,
            spawned: st.spawned,
            idle: st.idle,
            queued: st.ready.len(),
            pending: st.requests.len(),
            nodes,
        }
    }

    // ========== Submission ==========

    /// External request for frame `n` of `output` of `node`.
    pub(crate) fn submit(self: &Arc<Self>, node: &NodeRef, n: i32, output: usize, completion: Completion) {
        let Some(info) = node.info(output) else {
            self.finish_early(
                completion,
                Err(FrameError::NoOutput {
                    node: node.name().to_string(),
                    output,
                    num_outputs: node.num_outputs(),
                }),
            );
            return;
        };
        let num_frames = info.num_frames();
        if n < 0 || n >= num_frames {
            self.finish_early(
                completion,
                Err(FrameError::OutOfRange {
                    node: node.name().to_string(),
                    n,
                    num_frames,
                }),
            );
            return;
        }

        let key = RequestKey::new(node, n, output);
        let mut st = self.lock();

        if st.stopping {
            drop(st);
            self.finish_early(completion, Err(FrameError::Shutdown));
            return;
        }

        st.ticks += 1;
        let tick_due = self.tick_interval > 0 && st.ticks % self.tick_interval == 0;

        if let Some(&id) = st.in_flight.get(&key) {
            trace!("'{}' frame {} joins request #{}", node.name(), n, id);
            if let Some(req) = st.requests.get_mut(&id) {
                req.completions.push(completion);
            }
        } else if let Some(frame) = node.cache_lookup(output, n) {
            drop(st);
            self.finish_early(completion, Ok(frame));
            if tick_due {
                self.broadcast_adjust(false);
            }
            return;
        } else {
            let order = st.next_order;
            st.next_order += 1;
            let id = st.create_request(Arc::clone(node), key, order);
            if let Some(req) = st.requests.get_mut(&id) {
                req.completions.push(completion);
            }
            st.enqueue(id);
        }

        self.wake(&mut st);
        drop(st);

        if tick_due {
            self.broadcast_adjust(false);
        }
    }

    /// Result known without computing. Sync callers get it right away; async callbacks are
    /// queued for a worker so they never run on the submitting thread.
    fn finish_early(self: &Arc<Self>, completion: Completion, result: FrameResult<Frame>) {
        if completion.is_sync() {
            completion.deliver(result);
            return;
        }
        let mut st = self.lock();
        st.deferred.push_back((completion, result));
        self.wake(&mut st);
    }

    // ========== Execution ==========

    /// Run one task. The pool lock is released for the duration of compute and callback
    /// delivery; the returned guard is a fresh acquisition.
    pub(crate) fn run_task<'a>(
        self: &'a Arc<Self>,
        st: MutexGuard<'a, PoolState>,
        task: Task,
    ) -> MutexGuard<'a, PoolState> {
        drop(st);

        let Task {
            id,
            node,
            key,
            reason,
            available,
            frame_data,
            serial,
        } = task;
        trace!("compute '{}' frame {} ({:?})", node.name(), key.n, reason);

        let mut ctx = FrameContext::new(
            Arc::clone(&node),
            key.n,
            key.output,
            reason,
            available,
            frame_data,
            Arc::clone(&self.mem),
        );
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            node.filter().compute(key.n, key.output, reason, &mut ctx)
        }));
        drop(serial);
        node.count_compute();

        let result = match result {
            Ok(r) => r,
            Err(_) => fatal!("Filter '{}' panicked computing frame {}", node.name(), key.n),
        };
        let (requested, frame_data) = ctx.into_parts();

        let mut out = Settled::default();
        match result {
            Ok(Some(frame)) => {
                drop(frame_data);
                if !requested.is_empty() {
                    fatal!(
                        "Filter '{}' returned frame {} and requested {} more frames",
                        node.name(),
                        key.n,
                        requested.len()
                    );
                }
                let accepted = node
                    .info(key.output)
                    .is_some_and(|info| info.accepts(key.n, frame.format()));
                if !accepted {
                    fatal!(
                        "Filter '{}' returned frame {} as {:?}, declared {:?}",
                        node.name(),
                        key.n,
                        frame.format(),
                        node.info(key.output)
                    );
                }
                node.cache_insert(key.output, key.n, &frame);
                self.lock().complete(id, Ok(frame), &mut out);
            }
            Ok(None) => {
                if reason == ActivationReason::AllFramesReady {
                    fatal!(
                        "Filter '{}' returned no frame {} after all inputs were ready",
                        node.name(),
                        key.n
                    );
                }
                if requested.is_empty() {
                    fatal!(
                        "Filter '{}' returned neither frame {} nor requests",
                        node.name(),
                        key.n
                    );
                }
                self.lock().resolve_requests(id, requested, frame_data);
            }
            Err(e) => {
                drop(frame_data);
                let msg = format!("{:#}", e);
                self.lock()
                    .complete(id, Err(FrameError::Filter(msg)), &mut out);
            }
        }

        drop(node);
        drop(out.released);
        self.deliver(out.deliveries);
        self.relieve_memory_pressure();

        let mut st = self.lock();
        self.wake(&mut st);
        st
    }

    /// Deliver one deferred callback outside the lock.
    pub(crate) fn run_deferred<'a>(
        self: &'a Arc<Self>,
        st: MutexGuard<'a, PoolState>,
        delivery: Delivery,
    ) -> MutexGuard<'a, PoolState> {
        drop(st);
        self.deliver(vec![delivery]);
        self.lock()
    }

    /// Hand results to external callers. Must be called without the pool lock.
    fn deliver(&self, out: Vec<Delivery>) {
        for (completion, result) in out {
            if completion.is_sync() {
                completion.deliver(result);
                continue;
            }
            let _guard = self.callback_lock.lock().unwrap_or_else(|e| e.into_inner());
            if panic::catch_unwind(AssertUnwindSafe(|| completion.deliver(result))).is_err() {
                log::error!("Frame callback panicked");
            }
        }
    }

    // ========== Workers ==========

    /// Make sure queued work gets a thread: wake idle workers, spawn one more if the
    /// backlog exceeds them and the budget allows.
    pub(crate) fn wake(self: &Arc<Self>, st: &mut PoolState) {
        if st.stopping {
            self.cond.notify_all();
        }
        let backlog = st.backlog();
        if backlog == 0 {
            return;
        }
        if st.idle > 0 {
            self.cond.notify_all();
        }
        if backlog > st.idle && st.spawned < st.max_threads {
            workers::spawn_worker(self, st);
        }
    }

    /// Current thread is about to block on a frame: lend its slot to a new worker.
    pub(crate) fn release_thread(self: &Arc<Self>) {
        let mut st = self.lock();
        st.max_threads += 1;
        trace!("thread released, budget {}", st.max_threads);
        self.wake(&mut st);
    }

    /// Take the lent slot back. Excess workers retire on their next loop.
    pub(crate) fn reserve_thread(&self) {
        let mut st = self.lock();
        st.max_threads = st.max_threads.saturating_sub(1).max(1);
        trace!("thread reserved, budget {}", st.max_threads);
    }

    pub(crate) fn set_max_threads(self: &Arc<Self>, threads: usize) -> usize {
        let mut st = self.lock();
        st.max_threads = threads.max(1);
        info!("Scheduler thread budget: {}", st.max_threads);
        self.cond.notify_all();
        self.wake(&mut st);
        st.max_threads
    }

    pub(crate) fn max_threads(&self) -> usize {
        self.lock().max_threads
    }

    // ========== Cache maintenance ==========

    /// Ask every live node to re-evaluate its caches. Runs without the pool lock.
    pub(crate) fn broadcast_adjust(&self, need_memory: bool) {
        let nodes = self.lock().live_nodes();
        debug!(
            "Cache {} for {} nodes",
            if need_memory { "shrink" } else { "tick" },
            nodes.len()
        );
        for node in nodes {
            node.adjust_caches(need_memory);
        }
    }

    fn relieve_memory_pressure(&self) {
        if !self.mem.over_limit() {
            return;
        }
        if self.relieving.swap(true, Ordering::AcqRel) {
            return;
        }
        let (used, limit) = self.mem.mem();
        debug!(
            "Memory over ceiling ({} / {} MB), shrinking caches",
            used / 1024 / 1024,
            limit / 1024 / 1024
        );
        self.broadcast_adjust(true);
        self.relieving.store(false, Ordering::Release);
    }

    // ========== Shutdown ==========

    /// Stop accepting work, let in-flight requests drain and join every worker.
    pub(crate) fn shutdown(&self) {
        {
            let mut st = self.lock();
            st.stopping = true;
            info!(
                "Scheduler shutting down ({} workers, {} pending requests)",
                st.spawned,
                st.requests.len()
            );
        }
        self.cond.notify_all();

        let me = thread::current().id();
        loop {
            let handles = mem::take(&mut self.lock().handles);
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if handle.thread().id() == me {
                    continue;
                }
                let _ = handle.join();
            }
        }

        let st = self.lock();
        if !st.requests.is_empty() || !st.deferred.is_empty() {
            warn!(
                "{} requests and {} callbacks still pending at shutdown",
                st.requests.len(),
                st.deferred.len()
            );
        }
        if !workers::is_worker_thread() {
            debug_assert!(st.ready.is_empty(), "ready queue not empty after shutdown");
        }
        trace!("Scheduler stopped");
    }
}
