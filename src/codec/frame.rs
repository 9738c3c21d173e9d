use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Kind of coded frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameType {
    Empty,
    Key,
    Delta,
}

/// Clockwise rotation to apply when displaying a frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    R0,
    R90,
    R180,
    R270,
}

impl Rotation {
    pub fn degrees(self) -> u32 {
        match self {
            Self::R0 => 0,
            Self::R90 => 90,
            Self::R180 => 180,
            Self::R270 => 270,
        }
    }

    /// Rotation for a multiple of 90 degrees
    pub fn from_degrees(degrees: u32) -> Option<Self> {
        match degrees % 360 {
            0 => Some(Self::R0),
            90 => Some(Self::R90),
            180 => Some(Self::R180),
            270 => Some(Self::R270),
            _ => None,
        }
    }
}

/// Compressed frame submitted for decoding.
///
/// Caller-owned; the pipeline only reads it.
#[derive(Debug, Clone)]
pub struct CodedFrame {
    /// Bitstream bytes - shared, never copied until handed to the device
    pub data: Bytes,

    /// Encoded dimensions, 0 when unknown
    pub encoded_width: u32,
    pub encoded_height: u32,

    pub capture_time_ns: u64,
    pub frame_type: FrameType,
    pub complete_frame: bool,
    pub rotation: Rotation,
    pub qp: Option<u32>,
}

impl CodedFrame {
    /// A complete key frame with unknown dimensions
    pub fn key(data: impl Into<Bytes>, capture_time_ns: u64) -> Self {
        Self {
            data: data.into(),
            encoded_width: 0,
            encoded_height: 0,
            capture_time_ns,
            frame_type: FrameType::Key,
            complete_frame: true,
            rotation: Rotation::R0,
            qp: None,
        }
    }

    /// A complete delta frame with unknown dimensions
    pub fn delta(data: impl Into<Bytes>, capture_time_ns: u64) -> Self {
        Self {
            frame_type: FrameType::Delta,
            ..Self::key(data, capture_time_ns)
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.encoded_width = width;
        self.encoded_height = height;
        self
    }

    pub fn with_rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_complete(mut self, complete: bool) -> Self {
        self.complete_frame = complete;
        self
    }

    pub fn is_key_frame(&self) -> bool {
        self.frame_type == FrameType::Key
    }
}

/// Initial session parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderSettings {
    pub width: u32,
    pub height: u32,
    pub number_of_cores: u32,
}

impl DecoderSettings {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            number_of_cores: 1,
        }
    }
}

/// Per-call decode hints from the caller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeInfo {
    pub is_missing_frames: bool,
    pub render_time_ms: i64,
}

/// Tightly packed I420 picture.
///
/// `stride_y == width`, `stride_u == stride_v == ceil(width / 2)` and each
/// chroma plane has `ceil(height / 2)` rows. Cloning shares the pixel data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct I420Buffer {
    width: u32,
    height: u32,
    data: Bytes,
}

impl I420Buffer {
    /// Wrap packed I420 bytes, or `None` if the length does not match.
    pub fn from_packed(width: u32, height: u32, data: Bytes) -> Option<Self> {
        if data.len() != Self::packed_len(width, height) {
            return None;
        }
        Some(Self {
            width,
            height,
            data,
        })
    }

    /// Caller guarantees `data.len() == packed_len(width, height)`
    pub(crate) fn from_packed_unchecked(width: u32, height: u32, data: Bytes) -> Self {
        debug_assert_eq!(data.len(), Self::packed_len(width, height));
        Self {
            width,
            height,
            data,
        }
    }

    /// Bytes needed for a packed picture of this size
    pub fn packed_len(width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        w * h + 2 * cw * ch
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride_y(&self) -> usize {
        self.width as usize
    }

    pub fn stride_uv(&self) -> usize {
        (self.width as usize).div_ceil(2)
    }

    pub fn chroma_height(&self) -> usize {
        (self.height as usize).div_ceil(2)
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn data_y(&self) -> &[u8] {
        &self.data[..self.u_offset()]
    }

    pub fn data_u(&self) -> &[u8] {
        &self.data[self.u_offset()..self.v_offset()]
    }

    pub fn data_v(&self) -> &[u8] {
        &self.data[self.v_offset()..]
    }

    fn u_offset(&self) -> usize {
        self.stride_y() * self.height as usize
    }

    fn v_offset(&self) -> usize {
        self.u_offset() + self.stride_uv() * self.chroma_height()
    }
}

/// Picture the device rendered into the shared texture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureBuffer {
    pub texture_id: u32,
    pub width: u32,
    pub height: u32,
}

/// Pixel storage of a decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBuffer {
    I420(I420Buffer),
    Texture(TextureBuffer),
}

impl FrameBuffer {
    pub fn width(&self) -> u32 {
        match self {
            Self::I420(buffer) => buffer.width(),
            Self::Texture(texture) => texture.width,
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            Self::I420(buffer) => buffer.height(),
            Self::Texture(texture) => texture.height,
        }
    }
}

/// Frame delivered to the decoder callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub buffer: FrameBuffer,
    pub rotation: Rotation,
    pub timestamp_ns: u64,
}

impl DecodedFrame {
    /// Width after applying rotation
    pub fn rotated_width(&self) -> u32 {
        match self.rotation {
            Rotation::R0 | Rotation::R180 => self.buffer.width(),
            Rotation::R90 | Rotation::R270 => self.buffer.height(),
        }
    }

    /// Height after applying rotation
    pub fn rotated_height(&self) -> u32 {
        match self.rotation {
            Rotation::R0 | Rotation::R180 => self.buffer.height(),
            Rotation::R90 | Rotation::R270 => self.buffer.width(),
        }
    }
}
