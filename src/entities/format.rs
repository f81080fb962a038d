//! Media formats and declared node output info.

use serde::{Deserialize, Serialize};

/// Samples per audio frame. The last frame of a clip may be shorter.
pub const AUDIO_FRAME_SAMPLES: i64 = 3072;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColorFamily {
    Gray,
    Rgb,
    Yuv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleType {
    Integer,
    Float,
}

/// Pixel layout of a video frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VideoFormat {
    pub color_family: ColorFamily,
    pub sample_type: SampleType,
    pub bits_per_sample: u32,
    /// log2 horizontal chroma subsampling
    pub sub_sampling_w: u32,
    /// log2 vertical chroma subsampling
    pub sub_sampling_h: u32,
}

impl VideoFormat {
    pub const GRAY8: VideoFormat = VideoFormat::new(ColorFamily::Gray, SampleType::Integer, 8, 0, 0);
    pub const GRAY16: VideoFormat = VideoFormat::new(ColorFamily::Gray, SampleType::Integer, 16, 0, 0);
    pub const GRAYS: VideoFormat = VideoFormat::new(ColorFamily::Gray, SampleType::Float, 32, 0, 0);
    pub const YUV420P8: VideoFormat = VideoFormat::new(ColorFamily::Yuv, SampleType::Integer, 8, 1, 1);
    pub const YUV444P8: VideoFormat = VideoFormat::new(ColorFamily::Yuv, SampleType::Integer, 8, 0, 0);
    pub const RGB24: VideoFormat = VideoFormat::new(ColorFamily::Rgb, SampleType::Integer, 8, 0, 0);
    pub const RGBS: VideoFormat = VideoFormat::new(ColorFamily::Rgb, SampleType::Float, 32, 0, 0);

    pub const fn new(
        color_family: ColorFamily,
        sample_type: SampleType,
        bits_per_sample: u32,
        sub_sampling_w: u32,
        sub_sampling_h: u32,
    ) -> Self {
        Self {
            color_family,
            sample_type,
            bits_per_sample,
            sub_sampling_w,
            sub_sampling_h,
        }
    }

    pub fn bytes_per_sample(&self) -> usize {
        (self.bits_per_sample as usize).div_ceil(8)
    }

    pub fn num_planes(&self) -> usize {
        match self.color_family {
            ColorFamily::Gray => 1,
            ColorFamily::Rgb | ColorFamily::Yuv => 3,
        }
    }

    /// Well-formedness check used before allocating frames.
    pub fn is_valid(&self) -> bool {
        let bits_ok = match self.sample_type {
            SampleType::Integer => (8..=16).contains(&self.bits_per_sample),
            SampleType::Float => self.bits_per_sample == 16 || self.bits_per_sample == 32,
        };
        let subsampling_ok = match self.color_family {
            ColorFamily::Yuv => self.sub_sampling_w <= 4 && self.sub_sampling_h <= 4,
            _ => self.sub_sampling_w == 0 && self.sub_sampling_h == 0,
        };
        bits_ok && subsampling_ok
    }

    /// Plane dimensions for a frame of the given luma size.
    pub fn plane_dims(&self, plane: usize, width: usize, height: usize) -> (usize, usize) {
        if plane == 0 {
            (width, height)
        } else {
            (width >> self.sub_sampling_w, height >> self.sub_sampling_h)
        }
    }
}

/// Sample layout of an audio frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_type: SampleType,
    pub bits_per_sample: u32,
    /// Bit mask of present channels
    pub channel_layout: u64,
}

impl AudioFormat {
    pub const STEREO_S16: AudioFormat = AudioFormat {
        sample_type: SampleType::Integer,
        bits_per_sample: 16,
        channel_layout: 0b11,
    };
    pub const STEREO_F32: AudioFormat = AudioFormat {
        sample_type: SampleType::Float,
        bits_per_sample: 32,
        channel_layout: 0b11,
    };

    pub fn num_channels(&self) -> usize {
        self.channel_layout.count_ones() as usize
    }

    pub fn bytes_per_sample(&self) -> usize {
        (self.bits_per_sample as usize).div_ceil(8)
    }

    pub fn is_valid(&self) -> bool {
        let bits_ok = match self.sample_type {
            SampleType::Integer => (16..=32).contains(&self.bits_per_sample),
            SampleType::Float => self.bits_per_sample == 32,
        };
        bits_ok && self.channel_layout != 0
    }
}

/// Format of one frame: video with its geometry, or audio with its sample count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaFormat {
    Video {
        format: VideoFormat,
        width: usize,
        height: usize,
    },
    Audio {
        format: AudioFormat,
        samples: usize,
    },
}

/// Declared output of a video node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    /// None when frames may vary in format
    pub format: Option<VideoFormat>,
    pub fps_num: i64,
    pub fps_den: i64,
    /// 0 when frames may vary in size
    pub width: usize,
    pub height: usize,
    pub num_frames: i32,
}

impl VideoInfo {
    pub fn new(format: VideoFormat, width: usize, height: usize, num_frames: i32) -> Self {
        Self {
            format: Some(format),
            fps_num: 24,
            fps_den: 1,
            width,
            height,
            num_frames,
        }
    }

    pub fn with_fps(mut self, num: i64, den: i64) -> Self {
        self.fps_num = num;
        self.fps_den = den;
        self
    }

    /// Whether `format`/`width`/`height` of a produced frame satisfy this declaration.
    pub fn accepts(&self, format: &VideoFormat, width: usize, height: usize) -> bool {
        let fmt_ok = self.format.is_none_or(|f| &f == format);
        let dim_ok = (self.width == 0 && self.height == 0)
            || (self.width == width && self.height == height);
        fmt_ok && dim_ok
    }
}

/// Declared output of an audio node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AudioInfo {
    pub format: AudioFormat,
    pub sample_rate: u32,
    pub num_samples: i64,
}

impl AudioInfo {
    pub fn new(format: AudioFormat, sample_rate: u32, num_samples: i64) -> Self {
        Self {
            format,
            sample_rate,
            num_samples,
        }
    }

    /// Number of frames needed to carry `num_samples`.
    pub fn num_frames(&self) -> i32 {
        let frames = (self.num_samples + AUDIO_FRAME_SAMPLES - 1) / AUDIO_FRAME_SAMPLES;
        frames.min(i32::MAX as i64) as i32
    }

    /// Samples carried by frame `n`.
    pub fn samples_in_frame(&self, n: i32) -> usize {
        let start = n as i64 * AUDIO_FRAME_SAMPLES;
        (self.num_samples - start).clamp(0, AUDIO_FRAME_SAMPLES) as usize
    }
}

/// Declared output info of one node output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum NodeInfo {
    Video(VideoInfo),
    Audio(AudioInfo),
}

impl NodeInfo {
    pub fn num_frames(&self) -> i32 {
        match self {
            NodeInfo::Video(vi) => vi.num_frames,
            NodeInfo::Audio(ai) => ai.num_frames(),
        }
    }

    pub fn video(&self) -> Option<&VideoInfo> {
        match self {
            NodeInfo::Video(vi) => Some(vi),
            NodeInfo::Audio(_) => None,
        }
    }

    pub fn audio(&self) -> Option<&AudioInfo> {
        match self {
            NodeInfo::Audio(ai) => Some(ai),
            NodeInfo::Video(_) => None,
        }
    }

    /// Whether a produced frame `n` with `format` matches this declaration.
    pub fn accepts(&self, n: i32, format: &MediaFormat) -> bool {
        match (self, format) {
            (NodeInfo::Video(vi), MediaFormat::Video { format, width, height }) => {
                vi.accepts(format, *width, *height)
            }
            (NodeInfo::Audio(ai), MediaFormat::Audio { format, samples }) => {
                ai.format == *format && ai.samples_in_frame(n) == *samples
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_valid() {
        for f in [
            VideoFormat::GRAY8,
            VideoFormat::GRAY16,
            VideoFormat::GRAYS,
            VideoFormat::YUV420P8,
            VideoFormat::RGB24,
            VideoFormat::RGBS,
        ] {
            assert!(f.is_valid(), "{f:?}");
        }
        assert!(!VideoFormat::new(ColorFamily::Rgb, SampleType::Integer, 8, 1, 0).is_valid());
        assert!(AudioFormat::STEREO_S16.is_valid());
        assert_eq!(AudioFormat::STEREO_F32.num_channels(), 2);
    }

    #[test]
    fn subsampled_plane_dims() {
        let f = VideoFormat::YUV420P8;
        assert_eq!(f.plane_dims(0, 64, 48), (64, 48));
        assert_eq!(f.plane_dims(1, 64, 48), (32, 24));
        assert_eq!(f.num_planes(), 3);
    }

    #[test]
    fn audio_frame_split() {
        let ai = AudioInfo::new(AudioFormat::STEREO_S16, 48000, AUDIO_FRAME_SAMPLES * 2 + 10);
        assert_eq!(ai.num_frames(), 3);
        assert_eq!(ai.samples_in_frame(0), AUDIO_FRAME_SAMPLES as usize);
        assert_eq!(ai.samples_in_frame(2), 10);
    }

    #[test]
    fn variable_video_accepts_anything_of_kind() {
        let vi = VideoInfo {
            format: None,
            fps_num: 0,
            fps_den: 0,
            width: 0,
            height: 0,
            num_frames: 5,
        };
        assert!(vi.accepts(&VideoFormat::RGB24, 10, 10));
        let fixed = VideoInfo::new(VideoFormat::GRAY8, 8, 8, 5);
        assert!(fixed.accepts(&VideoFormat::GRAY8, 8, 8));
        assert!(!fixed.accepts(&VideoFormat::GRAY8, 8, 9));
        assert!(!fixed.accepts(&VideoFormat::GRAY16, 8, 8));
    }
}
