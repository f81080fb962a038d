//! Entities module - media values and graph nodes
//!
//! - `Frame`: immutable media value with copy-on-write planes
//! - `Node`: filter instance with its declared outputs, dependencies and caches
//! - `Filter`: the compute interface a node owns

pub mod attrs;
pub mod format;
pub mod frame;
pub mod node;
pub mod traits;

pub use attrs::{AttrValue, Attrs};
pub use format::{
    AUDIO_FRAME_SAMPLES, AudioFormat, AudioInfo, ColorFamily, MediaFormat, NodeInfo, SampleType,
    VideoFormat, VideoInfo,
};
pub use frame::Frame;
pub use node::{
    CacheMode, Dependency, FilterMode, Node, NodeBuilder, NodeFlags, NodeRef, RequestPattern,
    SerialGuard,
};
pub use traits::{ActivationReason, Filter, FnFilter, from_fn};
