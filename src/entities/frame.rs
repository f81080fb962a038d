//! Immutable, reference-counted frames with copy-on-write plane buffers.
//!
//! **Why**: A frame is handed to caches, dependents and callers at the same time. Cloning a
//! [`Frame`] only bumps a refcount; nobody can observe a change made by somebody else.
//!
//! # Ownership
//!
//! ```text
//! Frame ──Arc──▶ FrameData { format, props, planes: [Plane] }
//!                                        Plane ──Arc──▶ PlaneBuffer { bytes }
//! ```
//!
//! - `plane()` borrows bytes read-only.
//! - `plane_mut()` / `props_mut()` go through `Arc::make_mut` at both levels: a shared
//!   `FrameData` is shallow-cloned (planes are Arcs), then a shared buffer is deep-cloned.
//!   The returned `&mut` is therefore exclusive for as long as it lives.
//! - Planes may alias planes of other frames (`new_video_from_planes`), which is how
//!   pass-through filters avoid copies.
//!
//! # Memory accounting
//!
//! Every `PlaneBuffer` charges its byte size to the shared [`CacheManager`] when created or
//! deep-cloned and refunds it on drop.

use std::sync::Arc;

use crate::core::cache_man::CacheManager;
use crate::fatal;

use super::attrs::Attrs;
use super::format::{AudioFormat, MediaFormat, VideoFormat};

/// Row alignment of video planes in bytes.
pub const ALIGNMENT: usize = 32;

struct PlaneBuffer {
    data: Vec<u8>,
    mem: Arc<CacheManager>,
}

impl PlaneBuffer {
    fn zeroed(len: usize, mem: &Arc<CacheManager>) -> Self {
        mem.add_memory(len);
        Self {
            data: vec![0u8; len],
            mem: Arc::clone(mem),
        }
    }
}

impl Clone for PlaneBuffer {
    fn clone(&self) -> Self {
        self.mem.add_memory(self.data.len());
        Self {
            data: self.data.clone(),
            mem: Arc::clone(&self.mem),
        }
    }
}

impl Drop for PlaneBuffer {
    fn drop(&mut self) {
        self.mem.free_memory(self.data.len());
    }
}

impl std::fmt::Debug for PlaneBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaneBuffer").field("len", &self.data.len()).finish()
    }
}

#[derive(Debug, Clone)]
struct Plane {
    buf: Arc<PlaneBuffer>,
    /// Samples per row
    width: usize,
    height: usize,
    /// Bytes per row
    stride: usize,
}

#[derive(Debug, Clone)]
struct FrameData {
    format: MediaFormat,
    planes: Vec<Plane>,
    props: Attrs,
}

/// One unit of media flowing between nodes.
#[derive(Debug, Clone)]
pub struct Frame {
    data: Arc<FrameData>,
}

fn aligned_stride(row_bytes: usize) -> usize {
    row_bytes.div_ceil(ALIGNMENT) * ALIGNMENT
}

fn video_planes(format: &VideoFormat, width: usize, height: usize) -> Vec<(usize, usize, usize)> {
    (0..format.num_planes())
        .map(|p| {
            let (w, h) = format.plane_dims(p, width, height);
            (w, h, aligned_stride(w * format.bytes_per_sample()))
        })
        .collect()
}

fn check_video(format: &VideoFormat, width: usize, height: usize) {
    if !format.is_valid() {
        fatal!("Invalid video format requested: {:?}", format);
    }
    if width == 0 || height == 0 {
        fatal!("Non-positive frame dimensions requested: {}x{}", width, height);
    }
    let mask_w = (1usize << format.sub_sampling_w) - 1;
    let mask_h = (1usize << format.sub_sampling_h) - 1;
    if width & mask_w != 0 || height & mask_h != 0 {
        fatal!(
            "Frame dimensions {}x{} not divisible by subsampling of {:?}",
            width,
            height,
            format
        );
    }
}

impl Frame {
    /// Allocate a zero-filled video frame.
    ///
    /// Properties are copied from `prop_src` when given.
    pub fn new_video(
        format: VideoFormat,
        width: usize,
        height: usize,
        prop_src: Option<&Frame>,
        mem: &Arc<CacheManager>,
    ) -> Frame {
        check_video(&format, width, height);

        let planes = video_planes(&format, width, height)
            .into_iter()
            .map(|(w, h, stride)| Plane {
                buf: Arc::new(PlaneBuffer::zeroed(stride * h, mem)),
                width: w,
                height: h,
                stride,
            })
            .collect();

        Frame {
            data: Arc::new(FrameData {
                format: MediaFormat::Video { format, width, height },
                planes,
                props: prop_src.map(|f| f.props().clone()).unwrap_or_default(),
            }),
        }
    }

    /// Allocate a video frame whose planes alias planes of existing frames.
    ///
    /// `sources[i]` = `Some((frame, plane))` reuses that buffer for plane `i` without
    /// copying; `None` allocates a fresh zeroed plane. Aliased planes must have the
    /// dimensions plane `i` has in the new format.
    pub fn new_video_from_planes(
        format: VideoFormat,
        width: usize,
        height: usize,
        sources: &[Option<(&Frame, usize)>],
        prop_src: Option<&Frame>,
        mem: &Arc<CacheManager>,
    ) -> Frame {
        check_video(&format, width, height);
        let layout = video_planes(&format, width, height);
        if sources.len() != layout.len() {
            fatal!(
                "Plane source list has {} entries, format {:?} has {} planes",
                sources.len(),
                format,
                layout.len()
            );
        }

        let planes = layout
            .into_iter()
            .zip(sources)
            .map(|((w, h, stride), src)| match src {
                Some((frame, p)) => {
                    let plane = frame.plane_ref(*p);
                    if plane.width * frame.sample_bytes() != w * format.bytes_per_sample()
                        || plane.height != h
                    {
                        fatal!(
                            "Aliased plane {} is {}x{}, expected {}x{}",
                            p,
                            plane.width,
                            plane.height,
                            w,
                            h
                        );
                    }
                    Plane {
                        buf: Arc::clone(&plane.buf),
                        width: w,
                        height: h,
                        stride: plane.stride,
                    }
                }
                None => Plane {
                    buf: Arc::new(PlaneBuffer::zeroed(stride * h, mem)),
                    width: w,
                    height: h,
                    stride,
                },
            })
            .collect();

        Frame {
            data: Arc::new(FrameData {
                format: MediaFormat::Video { format, width, height },
                planes,
                props: prop_src.map(|f| f.props().clone()).unwrap_or_default(),
            }),
        }
    }

    /// Allocate a zero-filled audio frame; one plane per channel.
    pub fn new_audio(
        format: AudioFormat,
        samples: usize,
        prop_src: Option<&Frame>,
        mem: &Arc<CacheManager>,
    ) -> Frame {
        if !format.is_valid() {
            fatal!("Invalid audio format requested: {:?}", format);
        }
        if samples == 0 {
            fatal!("Non-positive audio sample count requested");
        }

        let stride = samples * format.bytes_per_sample();
        let planes = (0..format.num_channels())
            .map(|_| Plane {
                buf: Arc::new(PlaneBuffer::zeroed(stride, mem)),
                width: samples,
                height: 1,
                stride,
            })
            .collect();

        Frame {
            data: Arc::new(FrameData {
                format: MediaFormat::Audio { format, samples },
                planes,
                props: prop_src.map(|f| f.props().clone()).unwrap_or_default(),
            }),
        }
    }

    /// Deep clone: new buffers with the same contents and properties.
    pub fn copy_frame(&self) -> Frame {
        let planes = self
            .data
            .planes
            .iter()
            .map(|p| Plane {
                buf: Arc::new(PlaneBuffer::clone(&p.buf)),
                ..p.clone()
            })
            .collect();

        Frame {
            data: Arc::new(FrameData {
                format: self.data.format,
                planes,
                props: self.data.props.clone(),
            }),
        }
    }

    /// Replace this frame's properties with a copy of `src`'s.
    pub fn copy_props_from(&mut self, src: &Frame) {
        *self.props_mut() = src.props().clone();
    }

    fn plane_ref(&self, plane: usize) -> &Plane {
        match self.data.planes.get(plane) {
            Some(p) => p,
            None => fatal!(
                "Plane {} requested, frame has {}",
                plane,
                self.data.planes.len()
            ),
        }
    }

    fn sample_bytes(&self) -> usize {
        match &self.data.format {
            MediaFormat::Video { format, .. } => format.bytes_per_sample(),
            MediaFormat::Audio { format, .. } => format.bytes_per_sample(),
        }
    }

    pub fn format(&self) -> &MediaFormat {
        &self.data.format
    }

    pub fn video_format(&self) -> Option<&VideoFormat> {
        match &self.data.format {
            MediaFormat::Video { format, .. } => Some(format),
            MediaFormat::Audio { .. } => None,
        }
    }

    pub fn is_audio(&self) -> bool {
        matches!(self.data.format, MediaFormat::Audio { .. })
    }

    pub fn num_planes(&self) -> usize {
        self.data.planes.len()
    }

    /// Plane width in samples.
    pub fn width(&self, plane: usize) -> usize {
        self.plane_ref(plane).width
    }

    pub fn height(&self, plane: usize) -> usize {
        self.plane_ref(plane).height
    }

    /// Bytes between rows of `plane`.
    pub fn stride(&self, plane: usize) -> usize {
        self.plane_ref(plane).stride
    }

    /// Read-only plane bytes (stride * height).
    pub fn plane(&self, plane: usize) -> &[u8] {
        &self.plane_ref(plane).buf.data
    }

    /// One row of a plane, without the stride padding.
    pub fn row(&self, plane: usize, y: usize) -> &[u8] {
        let p = self.plane_ref(plane);
        let start = y * p.stride;
        &p.buf.data[start..start + p.width * self.sample_bytes()]
    }

    /// Writable plane bytes. Copies the buffer first if anybody else shares it.
    pub fn plane_mut(&mut self, plane: usize) -> &mut [u8] {
        let count = self.data.planes.len();
        if plane >= count {
            fatal!("Plane {} requested for writing, frame has {}", plane, count);
        }
        let data = Arc::make_mut(&mut self.data);
        let buf = Arc::make_mut(&mut data.planes[plane].buf);
        &mut buf.data
    }

    pub fn props(&self) -> &Attrs {
        &self.data.props
    }

    /// Writable properties. Shallow-copies the frame header if shared; plane buffers stay
    /// shared.
    pub fn props_mut(&mut self) -> &mut Attrs {
        &mut Arc::make_mut(&mut self.data).props
    }

    /// Number of handles to this frame.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.data)
    }

    /// Same frame object (not merely equal contents).
    pub fn ptr_eq(a: &Frame, b: &Frame) -> bool {
        Arc::ptr_eq(&a.data, &b.data)
    }

    /// Whether plane `p` of `self` and plane `q` of `other` are the same buffer.
    pub fn shares_plane(&self, p: usize, other: &Frame, q: usize) -> bool {
        Arc::ptr_eq(&self.plane_ref(p).buf, &other.plane_ref(q).buf)
    }

    /// Bytes held by this frame's planes (shared planes counted in full).
    pub fn mem_bytes(&self) -> usize {
        self.data.planes.iter().map(|p| p.buf.data.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::format::AudioFormat;

    fn mem() -> Arc<CacheManager> {
        Arc::new(CacheManager::new(usize::MAX))
    }

    #[test]
    fn video_layout_and_accounting() {
        let mem = mem();
        let f = Frame::new_video(VideoFormat::YUV420P8, 40, 20, None, &mem);
        assert_eq!(f.num_planes(), 3);
        assert_eq!(f.width(1), 20);
        assert_eq!(f.height(1), 10);
        assert_eq!(f.stride(0) % ALIGNMENT, 0);
        assert_eq!(f.row(0, 3).len(), 40);
        assert_eq!(mem.used(), f.mem_bytes());

        drop(f);
        assert_eq!(mem.used(), 0);
    }

    #[test]
    fn write_after_clone_copies() {
        let mem = mem();
        let mut a = Frame::new_video(VideoFormat::GRAY8, 8, 8, None, &mem);
        let b = a.clone();
        assert_eq!(a.ref_count(), 2);
        let before = mem.used();

        a.plane_mut(0)[0] = 200;

        assert_eq!(a.plane(0)[0], 200);
        assert_eq!(b.plane(0)[0], 0);
        assert!(!a.shares_plane(0, &b, 0));
        assert_eq!(mem.used(), before * 2);
    }

    #[test]
    fn unique_write_does_not_copy() {
        let mem = mem();
        let mut a = Frame::new_video(VideoFormat::GRAY8, 8, 8, None, &mem);
        let before = mem.used();
        a.plane_mut(0)[5] = 1;
        assert_eq!(mem.used(), before);
    }

    #[test]
    fn aliased_planes_share_buffers() {
        let mem = mem();
        let mut src = Frame::new_video(VideoFormat::YUV444P8, 16, 16, None, &mem);
        src.plane_mut(2)[0] = 9;
        src.props_mut().set_int("_Index", 4);

        let out = Frame::new_video_from_planes(
            VideoFormat::YUV444P8,
            16,
            16,
            &[None, Some((&src, 1)), Some((&src, 2))],
            Some(&src),
            &mem,
        );
        assert!(out.shares_plane(1, &src, 1));
        assert!(out.shares_plane(2, &src, 2));
        assert!(!out.shares_plane(0, &src, 0));
        assert_eq!(out.plane(2)[0], 9);
        assert_eq!(out.props().get_int("_Index"), Some(4));
    }

    #[test]
    fn props_mut_keeps_planes_shared() {
        let mem = mem();
        let a = Frame::new_video(VideoFormat::GRAY8, 4, 4, None, &mem);
        let mut b = a.clone();
        b.props_mut().set_int("x", 1);
        assert!(a.props().is_empty());
        assert!(b.shares_plane(0, &a, 0));
        assert!(!Frame::ptr_eq(&a, &b));
    }

    #[test]
    fn deep_copy_is_independent() {
        let mem = mem();
        let mut a = Frame::new_audio(AudioFormat::STEREO_S16, 100, None, &mem);
        a.plane_mut(1)[3] = 7;
        let b = a.copy_frame();
        assert!(!b.shares_plane(1, &a, 1));
        assert_eq!(b.plane(1)[3], 7);
        assert_eq!(b.num_planes(), 2);
        assert!(b.is_audio());
        assert_eq!(mem.used(), a.mem_bytes() + b.mem_bytes());
    }
}
