//! Per-call view handed to [`Filter::compute`](crate::entities::Filter::compute).
//!
//! **Why**: A filter must not touch scheduler state directly. The context collects the
//! requests it issues during Initial, exposes the resolved inputs during AllFramesReady and
//! carries the request's private scratch value between the two calls.
//!
//! **Used by**: scheduler (builds one per compute call, reads it back afterwards), filters.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::cache_man::CacheManager;
use crate::core::request::RequestKey;
use crate::entities::{
    ActivationReason, AudioFormat, Frame, NodeInfo, NodeRef, VideoFormat,
};
use crate::fatal;

pub struct FrameContext {
    node: NodeRef,
    n: i32,
    output: usize,
    reason: ActivationReason,
    requested: Vec<(NodeRef, RequestKey)>,
    available: HashMap<RequestKey, Frame>,
    frame_data: Option<Box<dyn Any + Send>>,
    mem: Arc<CacheManager>,
}

impl FrameContext {
    pub(crate) fn new(
        node: NodeRef,
        n: i32,
        output: usize,
        reason: ActivationReason,
        available: HashMap<RequestKey, Frame>,
        frame_data: Option<Box<dyn Any + Send>>,
        mem: Arc<CacheManager>,
    ) -> Self {
        Self {
            node,
            n,
            output,
            reason,
            requested: Vec::new(),
            available,
            frame_data,
            mem,
        }
    }

    /// Requests issued and the scratch value, for the scheduler.
    pub(crate) fn into_parts(self) -> (Vec<(NodeRef, RequestKey)>, Option<Box<dyn Any + Send>>) {
        (self.requested, self.frame_data)
    }

    pub fn n(&self) -> i32 {
        self.n
    }

    pub fn output(&self) -> usize {
        self.output
    }

    pub fn reason(&self) -> ActivationReason {
        self.reason
    }

    /// The node being computed.
    pub fn node(&self) -> &NodeRef {
        &self.node
    }

    /// Declared info of the output being computed.
    pub fn info(&self) -> &NodeInfo {
        match self.node.info(self.output) {
            Some(info) => info,
            None => fatal!("Node '{}' has no output {}", self.node.name(), self.output),
        }
    }

    // ========== Requests (Initial only) ==========

    /// Ask for frame `n` of output 0 of `node`.
    pub fn request_frame(&mut self, n: i32, node: &NodeRef) {
        self.request_frame_output(n, node, 0);
    }

    /// Ask for frame `n` of `output` of `node`. `n` is clamped into the node's frame range;
    /// repeated requests for the same frame collapse into one.
    pub fn request_frame_output(&mut self, n: i32, node: &NodeRef, output: usize) {
        if self.reason != ActivationReason::Initial {
            fatal!(
                "Node '{}' requested frame {} of '{}' outside the Initial activation",
                self.node.name(),
                n,
                node.name()
            );
        }
        let key = clamped_key(node, n, output);
        if !self.requested.iter().any(|(_, k)| *k == key) {
            self.requested.push((Arc::clone(node), key));
        }
    }

    /// Number of distinct frames requested so far in this call.
    pub fn requested_count(&self) -> usize {
        self.requested.len()
    }

    // ========== Resolved inputs (AllFramesReady) ==========

    /// Resolved input frame `n` of output 0 of `node`. Same clamping as `request_frame`.
    pub fn frame(&self, n: i32, node: &NodeRef) -> Option<Frame> {
        self.frame_output(n, node, 0)
    }

    pub fn frame_output(&self, n: i32, node: &NodeRef, output: usize) -> Option<Frame> {
        self.available.get(&clamped_key(node, n, output)).cloned()
    }

    /// Drop this call's reference to an input before returning.
    pub fn release_frame_early(&mut self, n: i32, node: &NodeRef) {
        self.release_frame_early_output(n, node, 0);
    }

    pub fn release_frame_early_output(&mut self, n: i32, node: &NodeRef, output: usize) {
        self.available.remove(&clamped_key(node, n, output));
    }

    // ========== Per-request scratch ==========

    /// Store a value that survives until the AllFramesReady call of this request.
    pub fn set_frame_data<T: Any + Send>(&mut self, value: T) {
        self.frame_data = Some(Box::new(value));
    }

    pub fn frame_data<T: Any + Send>(&self) -> Option<&T> {
        self.frame_data.as_ref()?.downcast_ref::<T>()
    }

    pub fn frame_data_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.frame_data.as_mut()?.downcast_mut::<T>()
    }

    pub fn take_frame_data<T: Any + Send>(&mut self) -> Option<T> {
        let boxed = self.frame_data.take()?;
        match boxed.downcast::<T>() {
            Ok(v) => Some(*v),
            Err(other) => {
                self.frame_data = Some(other);
                None
            }
        }
    }

    // ========== Allocation ==========

    pub fn mem(&self) -> &Arc<CacheManager> {
        &self.mem
    }

    pub fn new_video_frame(
        &self,
        format: VideoFormat,
        width: usize,
        height: usize,
        prop_src: Option<&Frame>,
    ) -> Frame {
        Frame::new_video(format, width, height, prop_src, &self.mem)
    }

    pub fn new_video_frame_from_planes(
        &self,
        format: VideoFormat,
        width: usize,
        height: usize,
        sources: &[Option<(&Frame, usize)>],
        prop_src: Option<&Frame>,
    ) -> Frame {
        Frame::new_video_from_planes(format, width, height, sources, prop_src, &self.mem)
    }

    pub fn new_audio_frame(
        &self,
        format: AudioFormat,
        samples: usize,
        prop_src: Option<&Frame>,
    ) -> Frame {
        Frame::new_audio(format, samples, prop_src, &self.mem)
    }

    pub fn copy_frame(&self, frame: &Frame) -> Frame {
        frame.copy_frame()
    }
}

fn clamped_key(node: &NodeRef, n: i32, output: usize) -> RequestKey {
    let frames = node.num_frames(output);
    if frames <= 0 {
        fatal!("Frame requested from output {} of '{}', which does not exist", output, node.name());
    }
    RequestKey::new(node, n.clamp(0, frames - 1), output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CachePolicy;
    use crate::entities::{NodeBuilder, VideoInfo, from_fn};

    fn node(frames: i32) -> NodeRef {
        Arc::new(
            NodeBuilder::new("n")
                .video(VideoInfo::new(VideoFormat::GRAY8, 4, 4, frames))
                .build(Box::new(from_fn(|_, _, _, _| Ok(None))), CachePolicy::default()),
        )
    }

    fn ctx(node: &NodeRef, reason: ActivationReason) -> FrameContext {
        FrameContext::new(
            Arc::clone(node),
            0,
            0,
            reason,
            HashMap::new(),
            None,
            Arc::new(CacheManager::new(usize::MAX)),
        )
    }

    #[test]
    fn requests_are_clamped_and_deduplicated() {
        let up = node(5);
        let me = node(5);
        let mut c = ctx(&me, ActivationReason::Initial);
        c.request_frame(-1, &up);
        c.request_frame(0, &up);
        c.request_frame(4, &up);
        c.request_frame(9, &up);
        let (reqs, _) = c.into_parts();
        let ns: Vec<i32> = reqs.iter().map(|(_, k)| k.n).collect();
        assert_eq!(ns, vec![0, 4]);
    }

    #[test]
    fn frame_data_round_trips_by_type() {
        let me = node(1);
        let mut c = ctx(&me, ActivationReason::Initial);
        c.set_frame_data(vec![1u32, 2, 3]);
        assert!(c.frame_data::<String>().is_none());
        c.frame_data_mut::<Vec<u32>>().unwrap().push(4);
        assert_eq!(c.take_frame_data::<String>(), None);
        assert_eq!(c.take_frame_data::<Vec<u32>>(), Some(vec![1, 2, 3, 4]));
        assert!(c.frame_data::<Vec<u32>>().is_none());
    }

    #[test]
    fn release_early_drops_input() {
        let up = node(3);
        let me = node(3);
        let mem = Arc::new(CacheManager::new(usize::MAX));
        let f = Frame::new_video(VideoFormat::GRAY8, 4, 4, None, &mem);
        let mut available = HashMap::new();
        available.insert(RequestKey::new(&up, 2, 0), f.clone());
        let mut c = FrameContext::new(
            Arc::clone(&me),
            0,
            0,
            ActivationReason::AllFramesReady,
            available,
            None,
            mem,
        );
        assert!(c.frame(7, &up).is_some());
        assert_eq!(f.ref_count(), 2);
        c.release_frame_early(2, &up);
        assert!(c.frame(2, &up).is_none());
        assert_eq!(f.ref_count(), 1);
    }

    #[test]
    fn release_early_targets_one_output() {
        let info = VideoInfo::new(VideoFormat::GRAY8, 4, 4, 3);
        let up: NodeRef = Arc::new(
            NodeBuilder::new("two")
                .video(info)
                .video(info)
                .build(Box::new(from_fn(|_, _, _, _| Ok(None))), CachePolicy::default()),
        );
        let me = node(3);
        let mem = Arc::new(CacheManager::new(usize::MAX));
        let main = Frame::new_video(VideoFormat::GRAY8, 4, 4, None, &mem);
        let side = Frame::new_video(VideoFormat::GRAY8, 4, 4, None, &mem);
        let mut available = HashMap::new();
        available.insert(RequestKey::new(&up, 1, 0), main);
        available.insert(RequestKey::new(&up, 1, 1), side.clone());
        let mut c = FrameContext::new(
            Arc::clone(&me),
            1,
            0,
            ActivationReason::AllFramesReady,
            available,
            None,
            mem,
        );

        c.release_frame_early_output(1, &up, 1);
        assert!(c.frame_output(1, &up, 1).is_none());
        assert!(c.frame(1, &up).is_some());
        assert_eq!(side.ref_count(), 1);
    }
}
