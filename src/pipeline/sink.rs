//! Delivery of decoded output to the consumer.
//!
//! The buffer path converts on the output thread and calls back
//! synchronously. The texture path renders into the shared texture and lets
//! the render thread call back; a one-slot mailbox limits it to one frame in
//! flight.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{error, trace, warn};

use super::convert::convert_to_i420;
use super::correlation::FrameMetadata;
use super::decoder::DecoderCallback;
use super::format::FormatState;
use crate::codec::{
    CodecDevice, DecodedFrame, FrameBuffer, OutputBufferInfo, TextureBuffer,
};
use crate::error::DeviceError;
use crate::render::{SharedTexture, TextureFrame};

/// Timing of the frame currently being rendered into the texture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderedTexture {
    pub presentation_timestamp_us: u64,
    pub decode_time_ms: Option<u32>,
}

/// Holds at most one [`RenderedTexture`]
#[derive(Debug, Default)]
pub struct PendingTextureSlot {
    slot: Mutex<Option<RenderedTexture>>,
}

impl PendingTextureSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for `metadata` and run `render` while holding it.
    ///
    /// Returns `None` without running `render` if a frame is already in
    /// flight. If `render` fails the slot is freed again.
    pub fn claim_with<E>(
        &self,
        metadata: RenderedTexture,
        render: impl FnOnce() -> Result<(), E>,
    ) -> Option<Result<(), E>> {
        let mut slot = self.lock();
        if slot.is_some() {
            return None;
        }
        *slot = Some(metadata);
        let result = render();
        if result.is_err() {
            *slot = None;
        }
        Some(result)
    }

    pub fn take(&self) -> Option<RenderedTexture> {
        self.lock().take()
    }

    pub fn is_occupied(&self) -> bool {
        self.lock().is_some()
    }

    pub fn clear(&self) {
        self.lock().take();
    }

    fn lock(&self) -> MutexGuard<'_, Option<RenderedTexture>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Where the output thread sends each decoded buffer, chosen at init
pub enum OutputSink {
    Buffer {
        callback: Arc<dyn DecoderCallback>,
    },
    Texture {
        texture: SharedTexture,
        slot: Arc<PendingTextureSlot>,
    },
}

impl OutputSink {
    /// Hand one output buffer to the consumer and return it to the device.
    ///
    /// Device errors are returned; conversion failures drop the frame.
    pub fn deliver(
        &self,
        device: &dyn CodecDevice,
        info: OutputBufferInfo,
        metadata: FrameMetadata,
        format: &FormatState,
    ) -> Result<(), DeviceError> {
        match self {
            Self::Buffer { callback } => {
                deliver_buffer(device, callback.as_ref(), info, metadata, format)
            }
            Self::Texture { texture, slot } => {
                deliver_texture(device, texture, slot, info, metadata, format)
            }
        }
    }
}

fn deliver_buffer(
    device: &dyn CodecDevice,
    callback: &dyn DecoderCallback,
    info: OutputBufferInfo,
    metadata: FrameMetadata,
    format: &FormatState,
) -> Result<(), DeviceError> {
    let buffer = device.output_buffer(info.index)?;
    let converted = match buffer.get(info.offset..info.offset.saturating_add(info.size)) {
        Some(payload) => convert_to_i420(payload, format.geometry(), format.layout),
        None => {
            error!(
                index = info.index,
                offset = info.offset,
                size = info.size,
                capacity = buffer.len(),
                "Output buffer range exceeds buffer"
            );
            return device.release_output_buffer(info.index, false);
        }
    };
    device.release_output_buffer(info.index, false)?;

    let i420 = match converted {
        Ok(i420) => i420,
        Err(e) => {
            error!(error = %e, index = info.index, "Dropping undecodable output buffer");
            metrics::counter!("hwdec_frames_dropped").increment(1);
            return Ok(());
        }
    };

    let decode_time_ms = metadata.decode_time_ms();
    let frame = DecodedFrame {
        buffer: FrameBuffer::I420(i420),
        rotation: metadata.rotation,
        timestamp_ns: info.presentation_time_us * 1000,
    };
    record_delivery(decode_time_ms);
    callback.on_decoded_frame(&frame, decode_time_ms, None);
    Ok(())
}

fn deliver_texture(
    device: &dyn CodecDevice,
    texture: &SharedTexture,
    slot: &PendingTextureSlot,
    info: OutputBufferInfo,
    metadata: FrameMetadata,
    format: &FormatState,
) -> Result<(), DeviceError> {
    let rendered = RenderedTexture {
        presentation_timestamp_us: info.presentation_time_us,
        decode_time_ms: metadata.decode_time_ms(),
    };
    let claimed = slot.claim_with(rendered, || {
        texture.set_texture_size(format.width, format.height);
        texture.set_frame_rotation(metadata.rotation);
        device.release_output_buffer(info.index, true)
    });

    match claimed {
        Some(result) => result,
        None => {
            trace!(index = info.index, "Texture busy, dropping frame");
            metrics::counter!("hwdec_frames_dropped").increment(1);
            device.release_output_buffer(info.index, false)
        }
    }
}

/// Render-thread side of the texture path: pair the rendered frame with the
/// slot's timing and call back.
pub fn on_texture_frame(
    slot: &PendingTextureSlot,
    callback: &dyn DecoderCallback,
    frame: TextureFrame,
) {
    let Some(rendered) = slot.take() else {
        warn!(texture_id = frame.texture_id, "Rendered texture without pending metadata");
        return;
    };
    let decoded = DecodedFrame {
        buffer: FrameBuffer::Texture(TextureBuffer {
            texture_id: frame.texture_id,
            width: frame.width,
            height: frame.height,
        }),
        rotation: frame.rotation,
        timestamp_ns: rendered.presentation_timestamp_us * 1000,
    };
    record_delivery(rendered.decode_time_ms);
    callback.on_decoded_frame(&decoded, rendered.decode_time_ms, None);
}

fn record_delivery(decode_time_ms: Option<u32>) {
    metrics::counter!("hwdec_frames_decoded").increment(1);
    if let Some(ms) = decode_time_ms {
        metrics::histogram!("hwdec_decode_time_ms").record(ms as f64);
    }
}
