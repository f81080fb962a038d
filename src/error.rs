//! Error taxonomy.
//!
//! Three kinds of failure exist in the scheduler:
//! - filter-reported errors travel as data through the request graph and reach callers as
//!   [`FrameError::Filter`];
//! - contract violations by a filter (bad return shape, wrong format, zero-length clips);
//! - resource exhaustion.
//!
//! The last two never travel as data: they go through [`fatal!`](crate::fatal), which logs
//! and aborts the process.

/// Result type for caller-facing frame operations.
pub type FrameResult<T> = Result<T, FrameError>;

/// Errors a caller can observe when asking for a frame.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// A compute step (here or upstream) reported failure. The message is passed through
    /// unchanged from the filter that failed first.
    #[error("{0}")]
    Filter(String),

    /// External request for an index outside the node's frame range.
    #[error("frame {n} out of range for '{node}' ({num_frames} frames)")]
    OutOfRange { node: String, n: i32, num_frames: i32 },

    /// External request for an output the node does not have.
    #[error("output {output} does not exist on '{node}' ({num_outputs} outputs)")]
    NoOutput { node: String, output: usize, num_outputs: usize },

    /// The core shut down before the request could be delivered.
    #[error("core is shutting down")]
    Shutdown,
}

impl FrameError {
    /// Build a [`FrameError::Filter`] value.
    pub fn filter(msg: impl Into<String>) -> Self {
        Self::Filter(msg.into())
    }

    /// Message as a filter would have reported it.
    pub fn message(&self) -> String {
        self.to_string()
    }
}

/// Log a contract violation or resource exhaustion and end the process.
///
/// Continuing after one of these risks delivering corrupted frames, so there is no
/// recovery path.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        eprintln!("framepull fatal: {}", format!($($arg)*));
        std::process::abort()
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_message_passes_through() {
        let e = FrameError::filter("decoder exploded");
        assert_eq!(e.to_string(), "decoder exploded");
        assert_eq!(e.message(), "decoder exploded");
    }

    #[test]
    fn out_of_range_display() {
        let e = FrameError::OutOfRange {
            node: "Blank".into(),
            n: 12,
            num_frames: 10,
        };
        assert_eq!(e.to_string(), "frame 12 out of range for 'Blank' (10 frames)");
    }
}
