//! Shared helpers for decoder integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use flume::Receiver;
use hwdec::codec::loopback::{LoopbackFactory, LoopbackProbe, LOOPBACK_DEVICE_NAME};
use hwdec::codec::{ColorFormat, VideoCodecType};
use hwdec::{
    DecodedFrame, DecoderCallback, HardwareVideoDecoder, LoopbackConfig, PipelineConfig,
    RenderContext,
};

pub const FRAME_TIMEOUT: Duration = Duration::from_secs(2);

/// Initialise a tracing subscriber for tests. Safe to call more than once.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hwdec=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Short timeouts so tests do not sit in device waits
pub fn fast_pipeline() -> PipelineConfig {
    PipelineConfig {
        dequeue_input_timeout_ms: 100,
        dequeue_output_timeout_ms: 10,
        release_timeout_ms: 2000,
        strict_correlation: false,
    }
}

pub struct Harness {
    pub decoder: HardwareVideoDecoder,
    pub probe: LoopbackProbe,
}

pub fn harness(
    loopback: LoopbackConfig,
    color_format: ColorFormat,
    render_context: Option<RenderContext>,
) -> Harness {
    harness_with(loopback, color_format, render_context, fast_pipeline())
}

pub fn harness_with(
    loopback: LoopbackConfig,
    color_format: ColorFormat,
    render_context: Option<RenderContext>,
    pipeline: PipelineConfig,
) -> Harness {
    let factory = LoopbackFactory::new(loopback);
    let probe = factory.probe();
    let decoder = HardwareVideoDecoder::new(
        Arc::new(factory),
        LOOPBACK_DEVICE_NAME,
        VideoCodecType::Vp8,
        color_format,
        render_context,
    )
    .with_pipeline_config(pipeline);
    Harness { decoder, probe }
}

/// A frame as seen by the callback
#[derive(Debug, Clone)]
pub struct Collected {
    pub frame: DecodedFrame,
    pub decode_time_ms: Option<u32>,
}

/// Callback that forwards every frame to the returned receiver
pub fn collector() -> (Arc<dyn DecoderCallback>, Receiver<Collected>) {
    let (tx, rx) = flume::unbounded();
    let callback = move |frame: &DecodedFrame, decode_time_ms: Option<u32>, _qp: Option<u32>| {
        let _ = tx.send(Collected {
            frame: frame.clone(),
            decode_time_ms,
        });
    };
    (Arc::new(callback), rx)
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}
