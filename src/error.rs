//! Error types for the decode pipeline (thiserror-based).

use thiserror::Error;

/// Errors reported by a codec device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("cannot create codec device {name}: {reason}")]
    Create { name: String, reason: String },

    #[error("codec configure failed: {0}")]
    Configure(String),

    #[error("codec call made in wrong state: {0}")]
    IllegalState(String),

    #[error("invalid buffer index {0}")]
    InvalidIndex(usize),

    #[error("input buffer too small: need {needed} bytes, capacity {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },

    #[error("codec device already released")]
    Released,
}

/// Fatal stream conditions recorded by the output thread and surfaced
/// on the next `release()`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error(
        "unexpected size change: configured {configured_width}x{configured_height}, \
         new {new_width}x{new_height}"
    )]
    UnexpectedResize {
        configured_width: u32,
        configured_height: u32,
        new_width: u32,
        new_height: u32,
    },

    #[error("unsupported color format: {0:#x}")]
    UnsupportedColorFormat(u32),

    #[error("output buffer arrived with no pending frame metadata")]
    CorrelationUnderflow,

    #[error("codec teardown failed: {0}")]
    Teardown(#[source] DeviceError),
}

/// Pixel conversion failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConvertError {
    #[error("insufficient output buffer size: {size} bytes for {width}x{height}")]
    BufferTooSmall { size: usize, width: u32, height: u32 },

    #[error("source plane out of bounds: need {needed} bytes, have {available}")]
    SourceOutOfBounds { needed: usize, available: usize },

    #[error("planar stride is not divisible by two: {0}")]
    OddStride(usize),

    #[error("invalid frame dimensions: {width}x{height}")]
    ZeroDimensions { width: u32, height: u32 },
}

/// Configuration loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}
