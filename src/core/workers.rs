//! Worker threads for the scheduler pool.
//!
//! Workers are spawned lazily by [`Pool::wake`](super::scheduler::Pool) when queued work has
//! no idle thread to run it, up to the pool's thread budget. Each worker loops:
//!
//! 1. retire if the pool has more threads than its budget
//! 2. deliver a deferred callback, if any
//! 3. pick the first runnable task and run it
//! 4. exit if the pool is stopping and no request is pending
//! 5. otherwise sleep on the pool condvar as an idle worker
//!
//! A thread-local marks worker threads so a blocking `get_frame` issued from inside a
//! compute call or callback can lend its slot to a replacement worker.

use std::cell::Cell;
use std::sync::Arc;
use std::thread;

use log::trace;

use super::scheduler::{Pool, PoolState};
use crate::fatal;

thread_local! {
    static IN_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// True on scheduler worker threads.
pub(crate) fn is_worker_thread() -> bool {
    IN_WORKER.with(Cell::get)
}

/// Start one worker. Called with the pool lock held.
pub(crate) fn spawn_worker(pool: &Arc<Pool>, st: &mut PoolState) {
    // forget handles of retired workers
    st.handles.retain(|h| !h.is_finished());

    let worker_id = st.next_worker;
    st.next_worker += 1;
    st.spawned += 1;

    let pool = Arc::clone(pool);
    let spawned = thread::Builder::new()
        .name(format!("framepull-worker-{}", worker_id))
        .spawn(move || worker_loop(pool, worker_id));

    match spawned {
        Ok(handle) => st.handles.push(handle),
        Err(e) => fatal!("Failed to spawn worker thread: {}", e),
    }
}

fn worker_loop(pool: Arc<Pool>, worker_id: usize) {
    IN_WORKER.with(|w| w.set(true));
    trace!("Worker {} started", worker_id);

    let mut st = pool.lock();
    loop {
        if st.spawned > st.max_threads {
            trace!("Worker {} retiring (budget {})", worker_id, st.max_threads);
            break;
        }

        if let Some(delivery) = st.take_deferred() {
            st = pool.run_deferred(st, delivery);
            continue;
        }

        if let Some(task) = st.pick() {
            st = pool.run_task(st, task);
            continue;
        }

        if st.stopping && st.is_drained() {
            break;
        }

        st.idle += 1;
        st = pool.wait(st);
        st.idle -= 1;
    }

    st.spawned -= 1;
    if st.has_ready() {
        pool.wake(&mut st);
    }
    drop(st);

    trace!("Worker {} stopped", worker_id);
}
