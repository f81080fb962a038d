//! 8-bit invert.

use anyhow::{Result, bail};

use crate::core::{Core, FrameContext};
use crate::entities::{
    ActivationReason, FilterMode, Filter, Frame, NodeBuilder, NodeRef, RequestPattern,
    SampleType,
};

/// `255 - x` on every sample of an 8-bit integer clip. Stateless, so fully parallel.
pub struct Invert {
    src: NodeRef,
}

impl Invert {
    pub fn create(core: &Core, src: &NodeRef) -> NodeRef {
        let mut builder = NodeBuilder::new("Invert")
            .mode(FilterMode::Parallel)
            .dependency(src, RequestPattern::StrictSpatial);
        if let Some(info) = src.info(0) {
            builder = builder.output(*info);
        }
        core.create_node(builder, Self { src: src.clone() })
    }
}

impl Filter for Invert {
    fn compute(
        &self,
        n: i32,
        _output: usize,
        reason: ActivationReason,
        ctx: &mut FrameContext,
    ) -> Result<Option<Frame>> {
        if reason == ActivationReason::Initial {
            ctx.request_frame(n, &self.src);
            return Ok(None);
        }

        let Some(mut frame) = ctx.frame(n, &self.src) else {
            bail!("Invert: input frame {} missing", n);
        };
        // drop our context's handle so the edit below can reuse the buffer when nobody
        // else holds it
        ctx.release_frame_early(n, &self.src);

        match frame.video_format() {
            Some(f) if f.sample_type == SampleType::Integer && f.bits_per_sample == 8 => {}
            other => bail!("Invert: only 8-bit integer video is supported, got {:?}", other),
        }

        for plane in 0..frame.num_planes() {
            for v in frame.plane_mut(plane) {
                *v = 255 - *v;
            }
        }
        Ok(Some(frame))
    }
}
