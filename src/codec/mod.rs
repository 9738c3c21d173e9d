//! Codec device interface.
//!
//! The hardware codec is an opaque, stateful device that only exposes
//! polling dequeue/enqueue primitives. It is injected through
//! [`CodecDeviceFactory`] so sessions never depend on a process-wide
//! singleton and tests can substitute the [`loopback`] device.
//!
//! Implementations must be internally synchronised: the caller thread feeds
//! input buffers while the session's output thread drains output buffers.

pub mod factory;
pub mod frame;
pub mod loopback;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::DeviceError;
use crate::render::SharedTexture;

pub use factory::{DeviceInfo, HardwareDecoderFactory, VideoCodecInfo};
pub use frame::{
    CodedFrame, DecodeInfo, DecodedFrame, DecoderSettings, FrameBuffer, FrameType, I420Buffer,
    Rotation, TextureBuffer,
};

/// Status returned across the pipeline-facing interface.
///
/// Numeric codes match the host framework's video codec status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecStatus {
    Ok,
    Error,
    /// Device unusable at this configuration; pick another implementation.
    FallbackSoftware,
    /// Waiting for a key frame. Not an error.
    NoOutput,
    ErrParameter,
    Uninitialized,
    /// Output thread did not finish within the release timeout.
    Timeout,
}

impl CodecStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::NoOutput => 1,
            Self::Error => -1,
            Self::ErrParameter => -4,
            Self::Timeout => -6,
            Self::Uninitialized => -7,
            Self::FallbackSoftware => -13,
        }
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

/// Codec families a decoder can be created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoCodecType {
    Vp8,
    Vp9,
    H264,
}

impl VideoCodecType {
    pub const ALL: [VideoCodecType; 3] = [Self::Vp8, Self::Vp9, Self::H264];

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Vp8 => "video/x-vnd.on2.vp8",
            Self::Vp9 => "video/x-vnd.on2.vp9",
            Self::H264 => "video/avc",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Vp8 => "VP8",
            Self::Vp9 => "VP9",
            Self::H264 => "H264",
        }
    }
}

/// How chroma is laid out in a device output buffer.
///
/// Resolved once from the colour format at configure/renegotiation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlaneLayout {
    /// Separate Y, U and V regions in one buffer.
    Planar,
    /// Y region followed by one interleaved UV region.
    SemiPlanar,
}

/// Device colour formats this pipeline knows how to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColorFormat {
    Yuv420Planar,
    Yuv420SemiPlanar,
    QcomYuv420SemiPlanar,
    QcomYvu420PackedSemiPlanar32m4ka,
    QcomYvu420PackedSemiPlanar16m4ka,
    QcomYvu420PackedSemiPlanar64x32Tile2m8ka,
    QcomYuv420PackedSemiPlanar32m,
}

impl ColorFormat {
    /// Formats accepted from a decoder, in order of preference.
    pub const DECODER_FORMATS: [ColorFormat; 7] = [
        Self::Yuv420Planar,
        Self::Yuv420SemiPlanar,
        Self::QcomYuv420SemiPlanar,
        Self::QcomYvu420PackedSemiPlanar32m4ka,
        Self::QcomYvu420PackedSemiPlanar16m4ka,
        Self::QcomYvu420PackedSemiPlanar64x32Tile2m8ka,
        Self::QcomYuv420PackedSemiPlanar32m,
    ];

    pub fn tag(self) -> u32 {
        match self {
            Self::Yuv420Planar => 19,
            Self::Yuv420SemiPlanar => 21,
            Self::QcomYuv420SemiPlanar => 0x7FA3_0C00,
            Self::QcomYvu420PackedSemiPlanar32m4ka => 0x7FA3_0C01,
            Self::QcomYvu420PackedSemiPlanar16m4ka => 0x7FA3_0C02,
            Self::QcomYvu420PackedSemiPlanar64x32Tile2m8ka => 0x7FA3_0C03,
            Self::QcomYuv420PackedSemiPlanar32m => 0x7FA3_0C04,
        }
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        Self::DECODER_FORMATS.into_iter().find(|f| f.tag() == tag)
    }

    pub fn layout(self) -> PlaneLayout {
        match self {
            Self::Yuv420Planar => PlaneLayout::Planar,
            _ => PlaneLayout::SemiPlanar,
        }
    }
}

/// Parameters passed to [`CodecDevice::configure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFormat {
    pub mime_type: &'static str,
    pub width: u32,
    pub height: u32,
    /// Requested output colour format. Absent on the texture path.
    pub color_format: Option<ColorFormat>,
}

/// Output format as reported by the device after a format change.
///
/// Every key is optional, the way devices report them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputFormat {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub stride: Option<u32>,
    pub slice_height: Option<u32>,
    pub crop_left: Option<u32>,
    pub crop_right: Option<u32>,
    pub crop_top: Option<u32>,
    pub crop_bottom: Option<u32>,
    /// Raw colour format tag.
    pub color_format: Option<u32>,
}

/// Where the device writes decoded pictures.
#[derive(Clone)]
pub enum OutputTarget {
    /// CPU-visible output buffers read through [`CodecDevice::output_buffer`].
    ByteBuffer,
    /// Render directly into a texture shared with the render-consumer thread.
    Texture(SharedTexture),
}

impl fmt::Debug for OutputTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ByteBuffer => f.write_str("ByteBuffer"),
            Self::Texture(texture) => write!(f, "Texture({})", texture.texture_id()),
        }
    }
}

/// A filled output buffer handed out by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputBufferInfo {
    pub index: usize,
    pub offset: usize,
    pub size: usize,
    pub presentation_time_us: u64,
}

/// Result of polling the device for output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DequeueOutput {
    Buffer(OutputBufferInfo),
    /// The output format changed; read it with [`CodecDevice::output_format`].
    FormatChanged,
    /// Nothing available within the timeout.
    TryAgainLater,
}

/// An opaque hardware codec.
pub trait CodecDevice: Send + Sync {
    /// Name the device was created with.
    fn name(&self) -> &str;

    fn configure(&self, format: &MediaFormat, target: OutputTarget) -> Result<(), DeviceError>;

    fn start(&self) -> Result<(), DeviceError>;

    /// Wait up to `timeout` for a free input buffer.
    fn dequeue_input_buffer(&self, timeout: Duration) -> Result<Option<usize>, DeviceError>;

    /// Copy `data` into the input buffer at `index`.
    ///
    /// Fails with [`DeviceError::BufferTooSmall`] if the buffer cannot hold it.
    fn fill_input_buffer(&self, index: usize, data: &[u8]) -> Result<(), DeviceError>;

    fn queue_input_buffer(
        &self,
        index: usize,
        size: usize,
        presentation_time_us: u64,
    ) -> Result<(), DeviceError>;

    /// Wait up to `timeout` for output.
    fn dequeue_output_buffer(&self, timeout: Duration) -> Result<DequeueOutput, DeviceError>;

    fn output_format(&self) -> Result<OutputFormat, DeviceError>;

    /// Contents of the output buffer at `index`.
    fn output_buffer(&self, index: usize) -> Result<Bytes, DeviceError>;

    /// Return an output buffer to the device, optionally rendering it to the
    /// configured texture first.
    fn release_output_buffer(&self, index: usize, render: bool) -> Result<(), DeviceError>;

    fn stop(&self) -> Result<(), DeviceError>;

    fn release(&self) -> Result<(), DeviceError>;
}

/// Creates codec devices by name and lists what is available.
pub trait CodecDeviceFactory: Send + Sync {
    fn create(&self, name: &str) -> Result<Arc<dyn CodecDevice>, DeviceError>;

    fn enumerate(&self) -> Vec<DeviceInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_format_tags_round_trip() {
        for format in ColorFormat::DECODER_FORMATS {
            assert_eq!(ColorFormat::from_tag(format.tag()), Some(format));
        }
        assert_eq!(ColorFormat::from_tag(0x7F00_0789), None);
    }

    #[test]
    fn only_yuv420_planar_is_planar() {
        assert_eq!(ColorFormat::Yuv420Planar.layout(), PlaneLayout::Planar);
        assert_eq!(ColorFormat::Yuv420SemiPlanar.layout(), PlaneLayout::SemiPlanar);
        assert_eq!(
            ColorFormat::QcomYuv420PackedSemiPlanar32m.layout(),
            PlaneLayout::SemiPlanar
        );
    }

    #[test]
    fn status_codes() {
        assert_eq!(CodecStatus::Ok.code(), 0);
        assert_eq!(CodecStatus::NoOutput.code(), 1);
        assert_eq!(CodecStatus::FallbackSoftware.code(), -13);
        assert!(!CodecStatus::Timeout.is_ok());
    }
}
