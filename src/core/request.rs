//! Pending-work records kept in the scheduler's request arena.

use std::any::Any;
use std::collections::HashMap;

use crossbeam_channel::Sender;
use uuid::Uuid;

use crate::entities::{Frame, NodeRef};
use crate::error::FrameResult;

/// Arena id of a [`FrameRequest`].
pub(crate) type RequestId = u64;

/// Identity of one computation: at most one request per key exists at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey {
    pub node: Uuid,
    pub n: i32,
    pub output: usize,
}

impl RequestKey {
    pub fn new(node: &NodeRef, n: i32, output: usize) -> Self {
        Self {
            node: node.id(),
            n,
            output,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Initial,
    AllUpstreamReady,
    Error,
}

/// Callback for asynchronous frame requests. Invoked exactly once, from a worker thread or
/// from the requesting thread when the result is known immediately.
pub type FrameCallback = Box<dyn FnOnce(FrameResult<Frame>) + Send + 'static>;

/// How an external caller is told about a result.
pub(crate) enum Completion {
    /// Serialized with every other async callback
    Async(FrameCallback),
    /// Blocking `get_frame`; delivered without the callback lock
    Sync(Sender<FrameResult<Frame>>),
}

impl Completion {
    pub(crate) fn is_sync(&self) -> bool {
        matches!(self, Completion::Sync(_))
    }

    /// Hand the result over. Caller is responsible for holding the callback lock for
    /// async completions.
    pub(crate) fn deliver(self, result: FrameResult<Frame>) {
        match self {
            Completion::Async(cb) => cb(result),
            Completion::Sync(tx) => {
                // receiver gone means the caller stopped waiting
                let _ = tx.send(result);
            }
        }
    }
}

pub(crate) struct FrameRequest {
    pub key: RequestKey,
    pub node: NodeRef,
    pub phase: Phase,
    /// Submission order inherited from the external request that caused it
    pub order: u64,
    pub outstanding: usize,
    pub available: HashMap<RequestKey, Frame>,
    pub dependents: Vec<RequestId>,
    pub completions: Vec<Completion>,
    pub error: Option<String>,
    pub frame_data: Option<Box<dyn Any + Send>>,
    /// In the ready queue
    pub queued: bool,
    /// Owns the node's FrameState marker
    pub holds_serial: bool,
}

impl FrameRequest {
    pub fn new(node: NodeRef, key: RequestKey, order: u64) -> Self {
        Self {
            key,
            node,
            phase: Phase::Initial,
            order,
            outstanding: 0,
            available: HashMap::new(),
            dependents: Vec::new(),
            completions: Vec::new(),
            error: None,
            frame_data: None,
            queued: false,
            holds_serial: false,
        }
    }

    /// Ready-queue sort key.
    pub fn queue_key(&self, id: RequestId) -> (u64, i32, RequestId) {
        (self.order, self.key.n, id)
    }
}
