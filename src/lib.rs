pub mod codec;
pub mod error;
pub mod pipeline;
pub mod render;
pub mod utils;

use std::path::Path;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::codec::{ColorFormat, VideoCodecType};
use crate::error::ConfigError;

pub use codec::{
    CodecDevice, CodecDeviceFactory, CodecStatus, CodedFrame, DecodeInfo, DecodedFrame,
    DecoderSettings, FrameBuffer, FrameType, HardwareDecoderFactory, I420Buffer, Rotation,
};
pub use pipeline::{DecoderCallback, HardwareVideoDecoder, SessionState};
pub use render::RenderContext;

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub decoder: DecoderConfig,
    pub pipeline: PipelineConfig,
    pub loopback: LoopbackConfig,
}

impl Config {
    /// Layer `path` (if it exists) and `HWDEC__*` environment variables over
    /// the defaults, e.g. `HWDEC__PIPELINE__RELEASE_TIMEOUT_MS=2000`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(config::Environment::with_prefix("HWDEC").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

/// Which decoder to run and at what size
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Device to use; `None` lets the factory pick
    pub codec_name: Option<String>,
    pub codec_type: VideoCodecType,
    pub color_format: ColorFormat,
    pub width: u32,
    pub height: u32,
    pub use_texture: bool,
    pub texture_id: u32,
    pub fps: u32,
    /// Frames the demo feeds before releasing; 0 runs until Ctrl-C
    pub frame_count: u64,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            codec_name: None,
            codec_type: VideoCodecType::Vp8,
            color_format: ColorFormat::Yuv420SemiPlanar,
            width: 640,
            height: 480,
            use_texture: false,
            texture_id: 1,
            fps: 30,
            frame_count: 90,
        }
    }
}

/// Bounded waits and correlation policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub dequeue_input_timeout_ms: u64,
    pub dequeue_output_timeout_ms: u64,
    pub release_timeout_ms: u64,
    /// Treat output with no pending frame metadata as fatal
    pub strict_correlation: bool,
}

impl PipelineConfig {
    pub fn dequeue_input_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_input_timeout_ms)
    }

    pub fn dequeue_output_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_output_timeout_ms)
    }

    pub fn release_timeout(&self) -> Duration {
        Duration::from_millis(self.release_timeout_ms)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dequeue_input_timeout_ms: 500,
            dequeue_output_timeout_ms: 100,
            release_timeout_ms: 5000,
            strict_correlation: false,
        }
    }
}

/// Output geometry and timing of the software loopback device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopbackConfig {
    /// Extra bytes at the end of every row
    pub stride_padding: u32,
    /// Extra rows below every plane
    pub slice_padding: u32,
    /// Report padded width/height plus a crop rectangle
    pub report_crop: bool,
    pub input_buffers: usize,
    pub input_capacity: usize,
    /// Delay between queueing input and its output becoming available
    pub decode_latency_ms: u64,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            stride_padding: 0,
            slice_padding: 0,
            report_crop: false,
            input_buffers: 4,
            input_capacity: 1 << 20,
            decode_latency_ms: 0,
        }
    }
}
