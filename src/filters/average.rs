//! Three-frame temporal average.

use std::sync::Mutex;

use anyhow::{Result, bail};

use crate::core::{Core, FrameContext};
use crate::entities::{
    ActivationReason, FilterMode, Filter, Frame, NodeBuilder, NodeRef, RequestPattern,
    SampleType,
};

/// Mean of frames `n-1`, `n`, `n+1` (clamped at the clip ends) for 8-bit integer video.
///
/// Requests fan out in parallel; the averaging step is serialized by the scheduler, which
/// lets every call share one accumulator buffer.
pub struct TemporalAverage {
    src: NodeRef,
    radius: i32,
    scratch: Mutex<Vec<u32>>,
}

impl TemporalAverage {
    pub fn create(core: &Core, src: &NodeRef) -> NodeRef {
        Self::create_with_radius(core, src, 1)
    }

    pub fn create_with_radius(core: &Core, src: &NodeRef, radius: i32) -> NodeRef {
        let mut builder = NodeBuilder::new("TemporalAverage")
            .mode(FilterMode::ParallelRequests)
            .dependency(src, RequestPattern::General);
        if let Some(info) = src.info(0) {
            builder = builder.output(*info);
        }
        core.create_node(
            builder,
            Self {
                src: src.clone(),
                radius: radius.max(0),
                scratch: Mutex::new(Vec::new()),
            },
        )
    }
}

impl Filter for TemporalAverage {
    fn compute(
        &self,
        n: i32,
        _output: usize,
        reason: ActivationReason,
        ctx: &mut FrameContext,
    ) -> Result<Option<Frame>> {
        if reason == ActivationReason::Initial {
            for i in (n - self.radius)..=(n + self.radius) {
                ctx.request_frame(i, &self.src);
            }
            return Ok(None);
        }

        let inputs: Vec<Frame> = ((n - self.radius)..=(n + self.radius))
            .filter_map(|i| ctx.frame(i, &self.src))
            .collect();
        let Some(center) = ctx.frame(n, &self.src) else {
            bail!("TemporalAverage: input frame {} missing", n);
        };
        let Some(&format) = center.video_format() else {
            bail!("TemporalAverage: audio input is not supported");
        };
        if format.sample_type != SampleType::Integer || format.bits_per_sample != 8 {
            bail!("TemporalAverage: only 8-bit integer video is supported");
        }

        let mut out = ctx.new_video_frame(format, center.width(0), center.height(0), Some(&center));
        let count = inputs.len() as u32;
        let mut acc = self.scratch.lock().unwrap_or_else(|e| e.into_inner());

        for plane in 0..out.num_planes() {
            let len = center.plane(plane).len();
            acc.clear();
            acc.resize(len, 0);
            for input in &inputs {
                for (a, &v) in acc.iter_mut().zip(input.plane(plane)) {
                    *a += v as u32;
                }
            }
            for (dst, &a) in out.plane_mut(plane).iter_mut().zip(acc.iter()) {
                *dst = ((a + count / 2) / count) as u8;
            }
        }
        Ok(Some(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::entities::{VideoFormat, VideoInfo, from_fn};

    #[test]
    fn averages_neighbours_and_clamps_edges() {
        let core = Core::new(CoreConfig {
            threads: 2,
            max_cache_bytes: 64 * 1024 * 1024,
            ..Default::default()
        });
        let info = VideoInfo::new(VideoFormat::GRAY8, 4, 2, 5);
        // frame n is filled with 10 * n
        let ramp = core.create_node(
            NodeBuilder::new("Ramp").video(info),
            from_fn(|n, _, _, ctx| {
                let mut f = ctx.new_video_frame(VideoFormat::GRAY8, 4, 2, None);
                f.plane_mut(0).fill((10 * n) as u8);
                Ok(Some(f))
            }),
        );
        let avg = TemporalAverage::create(&core, &ramp);

        let mid = core.get_frame(&avg, 2).unwrap();
        assert_eq!(mid.row(0, 0), &[20, 20, 20, 20]);

        // n=0 reads frames 0, 0, 1
        let first = core.get_frame(&avg, 0).unwrap();
        assert_eq!(first.row(0, 1)[0], 3);
    }
}
