//! Small built-in filters used by the CLI demo graph and the tests.
//!
//! One per concurrency style:
//! - [`BlankSource`]: FrameState source
//! - [`Invert`]: Parallel, copy-on-write edit of its input
//! - [`TemporalAverage`]: ParallelRequests, reads neighbouring frames

pub mod average;
pub mod blank;
pub mod invert;

pub use average::TemporalAverage;
pub use blank::BlankSource;
pub use invert::Invert;

/// Frame property carrying the index a frame was produced for.
pub const PROP_INDEX: &str = "_Index";
