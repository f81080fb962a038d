//! Filter interface implemented by every node's owned state.
//!
//! The scheduler is the only caller of [`Filter::compute`]. A filter is driven in up to two
//! activations per requested frame:
//!
//! 1. [`ActivationReason::Initial`]: declare inputs with `ctx.request_frame(..)` and return
//!    `Ok(None)`, or produce the frame right away (sources) and return `Ok(Some(frame))`.
//! 2. [`ActivationReason::AllFramesReady`]: every declared input is available through
//!    `ctx.frame(..)`; return `Ok(Some(frame))`.
//!
//! Returning `Err` at either point fails this request and, transitively, everything that
//! waits on it. Dropping the filter is its destructor; it runs exactly once, when the last
//! handle to the owning node goes away.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::frame::Frame;
use crate::core::context::FrameContext;

/// Why `compute` is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivationReason {
    /// First call for this request; inputs may be requested
    Initial,
    /// Every requested input is resolved
    AllFramesReady,
}

/// Computation owned by a node.
///
/// `&self` is shared across worker threads. Filters whose mode does not serialize calls
/// must synchronize their own mutable state.
pub trait Filter: Send + Sync {
    /// Produce frame `n` of `output`, or declare what is needed to produce it.
    fn compute(
        &self,
        n: i32,
        output: usize,
        reason: ActivationReason,
        ctx: &mut FrameContext,
    ) -> anyhow::Result<Option<Frame>>;
}

/// Blanket impl: Arc<T> implements Filter if T does
impl<T: Filter + ?Sized> Filter for Arc<T> {
    fn compute(
        &self,
        n: i32,
        output: usize,
        reason: ActivationReason,
        ctx: &mut FrameContext,
    ) -> anyhow::Result<Option<Frame>> {
        (**self).compute(n, output, reason, ctx)
    }
}

impl<T: Filter + ?Sized> Filter for Box<T> {
    fn compute(
        &self,
        n: i32,
        output: usize,
        reason: ActivationReason,
        ctx: &mut FrameContext,
    ) -> anyhow::Result<Option<Frame>> {
        (**self).compute(n, output, reason, ctx)
    }
}

/// Closure-backed filter. Build with [`from_fn`].
pub struct FnFilter<F>(F);

impl<F> Filter for FnFilter<F>
where
    F: Fn(i32, usize, ActivationReason, &mut FrameContext) -> anyhow::Result<Option<Frame>>
        + Send
        + Sync,
{
    fn compute(
        &self,
        n: i32,
        output: usize,
        reason: ActivationReason,
        ctx: &mut FrameContext,
    ) -> anyhow::Result<Option<Frame>> {
        (self.0)(n, output, reason, ctx)
    }
}

/// Wrap a closure as a [`Filter`].
///
/// ```ignore
/// let src = core.create_node(
///     NodeBuilder::new("Const").video(info),
///     from_fn(move |_n, _out, _reason, ctx| Ok(Some(ctx.new_video_frame(fmt, 8, 8, None)))),
/// );
/// ```
pub fn from_fn<F>(f: F) -> FnFilter<F>
where
    F: Fn(i32, usize, ActivationReason, &mut FrameContext) -> anyhow::Result<Option<Frame>>
        + Send
        + Sync,
{
    FnFilter(f)
}
