//! Constant-colour video source.

use anyhow::Result;

use super::PROP_INDEX;
use crate::core::{Core, FrameContext};
use crate::entities::{
    ActivationReason, FilterMode, Filter, Frame, NodeBuilder, NodeRef, VideoInfo,
};

/// Produces frames filled with one value per plane.
///
/// Runs as FrameState, the way a decoder-backed source would. The node's compute count
/// reports how many frames it produced.
pub struct BlankSource {
    info: VideoInfo,
    values: Vec<u8>,
}

impl BlankSource {
    pub fn new(info: VideoInfo, values: Vec<u8>) -> Self {
        Self { info, values }
    }

    /// Create the node on `core`.
    pub fn create(core: &Core, info: VideoInfo, values: Vec<u8>) -> NodeRef {
        core.create_node(
            NodeBuilder::new("BlankSource")
                .mode(FilterMode::FrameState)
                .video(info),
            Self::new(info, values),
        )
    }
}

impl Filter for BlankSource {
    fn compute(
        &self,
        n: i32,
        _output: usize,
        _reason: ActivationReason,
        ctx: &mut FrameContext,
    ) -> Result<Option<Frame>> {
        let Some(format) = self.info.format else {
            anyhow::bail!("BlankSource: output format must be constant");
        };

        let mut frame = ctx.new_video_frame(format, self.info.width, self.info.height, None);
        for plane in 0..frame.num_planes() {
            let value = self.values.get(plane).or(self.values.last()).copied().unwrap_or(0);
            if value != 0 {
                frame.plane_mut(plane).fill(value);
            }
        }
        frame.props_mut().set_int(PROP_INDEX, n as i64);
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::entities::VideoFormat;

    #[test]
    fn node_counts_produced_frames() {
        let core = Core::new(CoreConfig {
            threads: 2,
            max_cache_bytes: 64 * 1024 * 1024,
            ..Default::default()
        });
        let info = VideoInfo::new(VideoFormat::YUV420P8, 8, 4, 6);
        let src = BlankSource::create(&core, info, vec![16, 128]);

        for n in 0..3 {
            let f = core.get_frame(&src, n).unwrap();
            assert_eq!(f.props().get_int(PROP_INDEX), Some(n as i64));
            assert!(f.plane(0).iter().all(|&v| v == 16));
            // missing plane values repeat the last one
            assert!(f.plane(2).iter().all(|&v| v == 128));
        }
        // cached terminal node: repeats are free
        core.get_frame(&src, 1).unwrap();
        assert_eq!(src.compute_count(), 3);
    }
}
