//! Raw-frame relay between two ffmpeg processes.
//!
//! An ffmpeg decoder writes packed frames to a pipe, the bridge reslices them
//! into exact frames and optionally transforms them, and an ffmpeg encoder
//! reads them from a second pipe. [`pipeline::Pipeline`] ties the three
//! together and reports one result.

pub mod bridge;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod metadata;
pub mod pipeline;
pub mod process;
pub mod transform;

/// Registers libav components. Only needed before using [`metadata::LibavProbe`].
#[cfg(feature = "libav")]
pub fn init() -> Result<(), error::PipelineError> {
    ffmpeg_next::init().map_err(|e| error::PipelineError::LibavInit {
        reason: e.to_string(),
    })
}
