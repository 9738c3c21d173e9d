//! Decoder session controller.
//!
//! Owns the device handle and the output-poll thread. The caller thread
//! drives [`HardwareVideoDecoder::init_decode`], [`HardwareVideoDecoder::decode`]
//! and [`HardwareVideoDecoder::release`]; once started, only the output
//! thread makes output-side device calls and tears the device down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use flume::RecvTimeoutError;
use tracing::{debug, error, info, instrument, trace, warn};

use super::correlation::{CorrelationQueue, CorrelationStats, FrameMetadata};
use super::format::{FormatNegotiator, FormatState};
use super::sink::{on_texture_frame, OutputSink, PendingTextureSlot};
use crate::codec::{
    CodecDevice, CodecDeviceFactory, CodecStatus, CodedFrame, ColorFormat, DecodeInfo,
    DecodedFrame, DecoderSettings, DequeueOutput, MediaFormat, OutputBufferInfo, OutputTarget,
    VideoCodecType,
};
use crate::error::StreamError;
use crate::render::{RenderContext, TextureRenderer};
use crate::utils::ThreadChecker;
use crate::{PipelineConfig, CONFIG};

/// Receives decoded frames.
///
/// Called on the output thread (buffer output) or the render thread
/// (texture output), never on the caller thread. The frame is only valid
/// for the duration of the call; clone it to keep it.
pub trait DecoderCallback: Send + Sync {
    fn on_decoded_frame(&self, frame: &DecodedFrame, decode_time_ms: Option<u32>, qp: Option<u32>);
}

impl<F> DecoderCallback for F
where
    F: Fn(&DecodedFrame, Option<u32>, Option<u32>) + Send + Sync,
{
    fn on_decoded_frame(&self, frame: &DecodedFrame, decode_time_ms: Option<u32>, qp: Option<u32>) {
        self(frame, decode_time_ms, qp)
    }
}

/// Lifecycle of a decoder session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Running,
    /// The output thread hit a fatal condition; surfaced by `release()`.
    Failed,
    Released,
}

/// State shared with the output thread for the decoder's lifetime
struct Shared {
    correlation: CorrelationQueue,
    format: FormatNegotiator,
}

/// Signals for one output thread. A fresh set per session, so a thread
/// abandoned by a timed-out release never sees a later session's flag.
#[derive(Default)]
struct SessionSignals {
    running: AtomicBool,
    failure: Mutex<Option<StreamError>>,
}

impl SessionSignals {
    /// Keeps the first recorded condition.
    fn record(&self, err: StreamError) {
        let mut failure = self.failure();
        match &*failure {
            None => *failure = Some(err),
            Some(first) => debug!(error = %err, first = %first, "Dropping later error"),
        }
    }

    fn take_failure(&self) -> Option<StreamError> {
        self.failure().take()
    }

    fn has_failed(&self) -> bool {
        self.failure().is_some()
    }

    fn failure(&self) -> MutexGuard<'_, Option<StreamError>> {
        self.failure.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct OutputThread {
    handle: JoinHandle<()>,
    done: flume::Receiver<()>,
    signals: Arc<SessionSignals>,
}

/// Decoder driving one hardware codec device
pub struct HardwareVideoDecoder {
    devices: Arc<dyn CodecDeviceFactory>,
    codec_name: String,
    codec_type: VideoCodecType,
    color_format: ColorFormat,
    render_context: Option<RenderContext>,
    config: PipelineConfig,

    shared: Arc<Shared>,
    device: Option<Arc<dyn CodecDevice>>,
    output_thread: Option<OutputThread>,
    callback: Option<Arc<dyn DecoderCallback>>,
    renderer: Option<TextureRenderer>,
    texture_slot: Arc<PendingTextureSlot>,
    lifecycle: SessionState,
    key_frame_required: bool,
    thread_checker: ThreadChecker,
}

impl HardwareVideoDecoder {
    /// Decoder for the device named `codec_name`. With a render context the
    /// device renders into a shared texture instead of byte buffers.
    pub fn new(
        devices: Arc<dyn CodecDeviceFactory>,
        codec_name: impl Into<String>,
        codec_type: VideoCodecType,
        color_format: ColorFormat,
        render_context: Option<RenderContext>,
    ) -> Self {
        let codec_name = codec_name.into();
        debug!(
            codec = %codec_name,
            codec_type = codec_type.name(),
            ?color_format,
            ?render_context,
            "Creating decoder"
        );
        let initial = FormatState::new(
            0,
            0,
            render_context.is_none().then_some(color_format),
        );
        Self {
            devices,
            codec_name,
            codec_type,
            color_format,
            render_context,
            config: CONFIG.load().pipeline.clone(),
            shared: Arc::new(Shared {
                correlation: CorrelationQueue::new(),
                format: FormatNegotiator::new(initial, render_context.is_some()),
            }),
            device: None,
            output_thread: None,
            callback: None,
            renderer: None,
            texture_slot: Arc::new(PendingTextureSlot::new()),
            lifecycle: SessionState::Uninitialized,
            key_frame_required: true,
            thread_checker: ThreadChecker::new("decoder"),
        }
    }

    /// Override the timeouts taken from the global config.
    pub fn with_pipeline_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn implementation_name(&self) -> &str {
        &self.codec_name
    }

    pub fn codec_type(&self) -> VideoCodecType {
        self.codec_type
    }

    pub fn prefers_late_decoding(&self) -> bool {
        true
    }

    pub fn state(&self) -> SessionState {
        match &self.output_thread {
            Some(thread) if thread.signals.has_failed() => SessionState::Failed,
            Some(_) => SessionState::Running,
            None => self.lifecycle,
        }
    }

    /// Frames submitted but not yet matched to output
    pub fn pending_frames(&self) -> usize {
        self.shared.correlation.len()
    }

    pub fn correlation_stats(&self) -> CorrelationStats {
        self.shared.correlation.stats()
    }

    /// Create, configure and start the device and its output thread.
    #[instrument(skip(self, callback), fields(codec = %self.codec_name))]
    pub fn init_decode(
        &mut self,
        settings: DecoderSettings,
        callback: Arc<dyn DecoderCallback>,
    ) -> CodecStatus {
        self.thread_checker = ThreadChecker::new("decoder");
        if self.output_thread.is_some() {
            error!("init_decode called while the codec is already running");
            return CodecStatus::FallbackSoftware;
        }

        self.callback = Some(callback.clone());
        if let Some(context) = self.render_context.filter(|_| self.renderer.is_none()) {
            let slot = self.texture_slot.clone();
            let spawned = TextureRenderer::spawn(context, move |frame| {
                on_texture_frame(&slot, callback.as_ref(), frame)
            });
            match spawned {
                Ok(renderer) => self.renderer = Some(renderer),
                Err(e) => {
                    error!(error = %e, "Cannot start render thread");
                    self.release();
                    return CodecStatus::FallbackSoftware;
                }
            }
        }

        self.init_internal(settings.width, settings.height)
    }

    fn init_internal(&mut self, width: u32, height: u32) -> CodecStatus {
        self.thread_checker.check("init");
        info!(width, height, codec_type = self.codec_type.name(), "Initializing decoder");
        if self.output_thread.is_some() {
            error!("Codec already running");
            return CodecStatus::FallbackSoftware;
        }
        let Some(callback) = self.callback.clone() else {
            return CodecStatus::Uninitialized;
        };

        self.shared.format.reset(width, height);
        self.key_frame_required = true;

        let device = match self.devices.create(&self.codec_name) {
            Ok(device) => device,
            Err(e) => {
                error!(error = %e, "Cannot create media decoder");
                return CodecStatus::FallbackSoftware;
            }
        };

        let (target, sink) = match &self.renderer {
            Some(renderer) => (
                OutputTarget::Texture(renderer.texture()),
                OutputSink::Texture {
                    texture: renderer.texture(),
                    slot: self.texture_slot.clone(),
                },
            ),
            None => (OutputTarget::ByteBuffer, OutputSink::Buffer { callback }),
        };
        let format = MediaFormat {
            mime_type: self.codec_type.mime_type(),
            width,
            height,
            color_format: self.renderer.is_none().then_some(self.color_format),
        };

        if let Err(e) = device.configure(&format, target).and_then(|()| device.start()) {
            error!(error = %e, "init_decode failed");
            if let Err(e) = device.release() {
                warn!(error = %e, "Releasing unconfigured device failed");
            }
            self.release();
            return CodecStatus::FallbackSoftware;
        }

        let signals = Arc::new(SessionSignals::default());
        signals.running.store(true, Ordering::Release);
        let worker = OutputWorker {
            device: device.clone(),
            shared: self.shared.clone(),
            signals: signals.clone(),
            sink,
            config: self.config.clone(),
        };
        let (done_tx, done_rx) = flume::bounded(1);
        let spawned = thread::Builder::new()
            .name("hwdec-output".into())
            .spawn(move || {
                worker.run();
                let _ = done_tx.send(());
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, "Cannot start output thread");
                if let Err(e) = device.stop() {
                    warn!(error = %e, "Stopping device after spawn failure failed");
                }
                if let Err(e) = device.release() {
                    warn!(error = %e, "Releasing device after spawn failure failed");
                }
                return CodecStatus::FallbackSoftware;
            }
        };

        self.device = Some(device);
        self.output_thread = Some(OutputThread {
            handle,
            done: done_rx,
            signals,
        });
        self.lifecycle = SessionState::Running;
        debug!("init_decode done");
        CodecStatus::Ok
    }

    /// Submit one coded frame.
    pub fn decode(&mut self, frame: &CodedFrame, _info: &DecodeInfo) -> CodecStatus {
        self.thread_checker.check("decode");
        if self.device.is_none() || self.callback.is_none() {
            debug!(
                device = self.device.is_some(),
                callback = self.callback.is_some(),
                "decode uninitialized"
            );
            return CodecStatus::Uninitialized;
        }
        if let Some(thread) = &self.output_thread {
            // The output thread has already torn the device down
            if thread.signals.has_failed() || !thread.signals.running.load(Ordering::Acquire) {
                error!("decode() - output thread stopped; release the decoder");
                return CodecStatus::Error;
            }
        }
        if frame.data.is_empty() {
            error!("decode() - input buffer empty");
            return CodecStatus::ErrParameter;
        }

        let (width, height) = self.shared.format.dimensions();
        let (new_width, new_height) = (frame.encoded_width, frame.encoded_height);
        if new_width as u64 * new_height as u64 > 0 && (new_width, new_height) != (width, height)
        {
            let status = self.reinit(new_width, new_height);
            if !status.is_ok() {
                return status;
            }
        }
        // Reinit may have replaced the device
        let Some(device) = self.device.clone() else {
            return CodecStatus::Uninitialized;
        };

        if self.key_frame_required {
            if !frame.is_key_frame() {
                debug!("decode() - key frame required first");
                return CodecStatus::NoOutput;
            }
            if !frame.complete_frame {
                debug!("decode() - complete frame required first");
                return CodecStatus::NoOutput;
            }
        }

        let index = match device.dequeue_input_buffer(self.config.dequeue_input_timeout()) {
            Ok(Some(index)) => index,
            Ok(None) => {
                error!("decode() - no HW buffers available; decoder falling behind");
                return CodecStatus::Error;
            }
            Err(e) => {
                error!(error = %e, "dequeue_input_buffer failed");
                return CodecStatus::Error;
            }
        };
        let pts_us = frame.capture_time_ns / 1000;
        if let Err(e) = device.fill_input_buffer(index, &frame.data) {
            error!(error = %e, "decode() - cannot fill HW buffer");
            // Hand the buffer back empty so the pool does not shrink
            if let Err(e) = device.queue_input_buffer(index, 0, pts_us) {
                warn!(error = %e, index, "Cannot return unfilled input buffer");
            }
            return CodecStatus::Error;
        }

        self.shared
            .correlation
            .push(FrameMetadata::new(frame.rotation));
        if let Err(e) = device.queue_input_buffer(index, frame.data.len(), pts_us) {
            error!(error = %e, "queue_input_buffer failed");
            self.shared.correlation.pop_back();
            return CodecStatus::Error;
        }
        trace!(index, pts_us, size = frame.data.len(), "Queued input");

        self.key_frame_required = false;
        CodecStatus::Ok
    }

    /// Stop the session and free the device.
    ///
    /// Waits for the output thread for at most the release timeout. A
    /// second call returns `Ok` without touching the device.
    pub fn release(&mut self) -> CodecStatus {
        debug!(codec = %self.codec_name, "release");
        let status = self.release_internal();

        if let Some(mut renderer) = self.renderer.take() {
            renderer.stop();
        }
        self.texture_slot.clear();
        self.callback = None;
        self.shared.correlation.clear();
        if self.lifecycle != SessionState::Uninitialized {
            self.lifecycle = SessionState::Released;
        }
        status
    }

    fn release_internal(&mut self) -> CodecStatus {
        let Some(thread) = self.output_thread.take() else {
            debug!("release: decoder is not running");
            self.device = None;
            return CodecStatus::Ok;
        };

        thread.signals.running.store(false, Ordering::Release);
        let status = match thread.done.recv_timeout(self.config.release_timeout()) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if thread.handle.join().is_err() {
                    error!("Output thread panicked");
                    CodecStatus::Error
                } else if let Some(e) = thread.signals.take_failure() {
                    error!(error = %e, "Media decoder release error");
                    CodecStatus::Error
                } else {
                    CodecStatus::Ok
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                // The thread keeps its own device handle and finishes
                // teardown whenever the device call returns.
                error!(
                    timeout_ms = self.config.release_timeout_ms,
                    "Media decoder release timeout"
                );
                CodecStatus::Timeout
            }
        };

        self.device = None;
        self.lifecycle = SessionState::Released;
        status
    }

    #[instrument(skip(self))]
    fn reinit(&mut self, width: u32, height: u32) -> CodecStatus {
        self.thread_checker.check("reinit");
        let status = self.release_internal();
        if !status.is_ok() {
            return status;
        }
        // Output for frames still in the old device is gone with it.
        self.shared.correlation.clear();
        self.init_internal(width, height)
    }
}

impl Drop for HardwareVideoDecoder {
    fn drop(&mut self) {
        if self.output_thread.is_some() || self.renderer.is_some() {
            debug!("Decoder dropped while running; releasing");
            self.release();
        }
    }
}

/// Runs on the output thread
struct OutputWorker {
    device: Arc<dyn CodecDevice>,
    shared: Arc<Shared>,
    signals: Arc<SessionSignals>,
    sink: OutputSink,
    config: PipelineConfig,
}

impl OutputWorker {
    fn run(self) {
        let checker = ThreadChecker::new("output");
        info!(device = self.device.name(), "Output thread started");

        while self.signals.running.load(Ordering::Acquire) {
            checker.check("poll");
            if let Err(e) = self.poll_once() {
                error!(error = %e, "Stopping output thread");
                self.signals.record(e);
                self.signals.running.store(false, Ordering::Release);
            }
        }

        self.release_device();
    }

    fn poll_once(&self) -> Result<(), StreamError> {
        let timeout = self.config.dequeue_output_timeout();
        match self.device.dequeue_output_buffer(timeout) {
            Ok(DequeueOutput::TryAgainLater) => Ok(()),
            Ok(DequeueOutput::FormatChanged) => match self.device.output_format() {
                Ok(format) => self.shared.format.apply(&format).map(|_| ()),
                Err(e) => {
                    warn!(error = %e, "Cannot read output format");
                    Ok(())
                }
            },
            Ok(DequeueOutput::Buffer(info)) => self.deliver(info),
            Err(e) => {
                warn!(error = %e, "dequeue_output_buffer failed");
                Ok(())
            }
        }
    }

    fn deliver(&self, info: OutputBufferInfo) -> Result<(), StreamError> {
        let metadata = match self.shared.correlation.pop() {
            Some(metadata) => metadata,
            None => {
                metrics::counter!("hwdec_correlation_underflow").increment(1);
                if self.config.strict_correlation {
                    if let Err(e) = self.device.release_output_buffer(info.index, false) {
                        warn!(error = %e, index = info.index, "Cannot return uncorrelated output");
                    }
                    return Err(StreamError::CorrelationUnderflow);
                }
                warn!(index = info.index, "Output without pending frame metadata");
                FrameMetadata::default()
            }
        };

        let format = self.shared.format.first_frame_decoded();
        if let Err(e) = self.sink.deliver(self.device.as_ref(), info, metadata, &format) {
            warn!(error = %e, index = info.index, "Failed to deliver decoded frame");
        }
        Ok(())
    }

    fn release_device(&self) {
        info!("Releasing codec on output thread");
        if let Err(e) = self.device.stop() {
            error!(error = %e, "Media decoder stop failed");
            self.signals.record(StreamError::Teardown(e));
        }
        if let Err(e) = self.device.release() {
            error!(error = %e, "Media decoder release failed");
            self.signals.record(StreamError::Teardown(e));
        }
        info!("Codec released on output thread");
    }
}
