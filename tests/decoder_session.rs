//! Session lifecycle: init, decode gating, reinit, release and failure paths.

mod common;

use std::time::Duration;

use common::{collector, harness, harness_with, init_test_tracing, wait_until, FRAME_TIMEOUT};
use hwdec::codec::loopback::FailurePoint;
use hwdec::codec::{ColorFormat, OutputFormat};
use hwdec::{
    CodecStatus, CodedFrame, DecodeInfo, DecoderSettings, LoopbackConfig, PipelineConfig,
    SessionState,
};

fn info() -> DecodeInfo {
    DecodeInfo::default()
}

#[test]
fn decode_before_init_is_uninitialized() {
    init_test_tracing();
    let mut h = harness(LoopbackConfig::default(), ColorFormat::Yuv420SemiPlanar, None);

    let status = h.decoder.decode(&CodedFrame::key(vec![1, 2, 3], 0), &info());
    assert_eq!(status, CodecStatus::Uninitialized);
    assert_eq!(h.decoder.state(), SessionState::Uninitialized);
    assert_eq!(h.probe.devices_created(), 0);
}

#[test]
fn empty_input_is_a_parameter_error() {
    init_test_tracing();
    let mut h = harness(LoopbackConfig::default(), ColorFormat::Yuv420SemiPlanar, None);
    let (callback, _rx) = collector();
    assert_eq!(
        h.decoder.init_decode(DecoderSettings::new(64, 48), callback),
        CodecStatus::Ok
    );

    let status = h.decoder.decode(&CodedFrame::key(Vec::new(), 0), &info());
    assert_eq!(status, CodecStatus::ErrParameter);
    assert_eq!(h.probe.inputs_queued(), 0);
    assert_eq!(h.decoder.release(), CodecStatus::Ok);
}

#[test]
fn release_is_idempotent() {
    init_test_tracing();
    let mut h = harness(LoopbackConfig::default(), ColorFormat::Yuv420SemiPlanar, None);

    // Never initialized
    assert_eq!(h.decoder.release(), CodecStatus::Ok);

    let (callback, _rx) = collector();
    assert_eq!(
        h.decoder.init_decode(DecoderSettings::new(64, 48), callback),
        CodecStatus::Ok
    );
    assert_eq!(h.decoder.state(), SessionState::Running);

    assert_eq!(h.decoder.release(), CodecStatus::Ok);
    assert_eq!(h.decoder.release(), CodecStatus::Ok);
    assert_eq!(h.decoder.state(), SessionState::Released);
    assert_eq!(h.probe.stops(), 1);
    assert_eq!(h.probe.releases(), 1);
    assert_eq!(h.probe.post_release_calls(), 0);

    let status = h.decoder.decode(&CodedFrame::key(vec![1], 0), &info());
    assert_eq!(status, CodecStatus::Uninitialized);
}

#[test]
fn init_while_running_requests_fallback() {
    init_test_tracing();
    let mut h = harness(LoopbackConfig::default(), ColorFormat::Yuv420SemiPlanar, None);
    let (callback, _rx) = collector();
    let settings = DecoderSettings::new(64, 48);

    assert_eq!(h.decoder.init_decode(settings, callback.clone()), CodecStatus::Ok);
    assert_eq!(
        h.decoder.init_decode(settings, callback),
        CodecStatus::FallbackSoftware
    );
    assert_eq!(h.probe.devices_created(), 1);
    assert_eq!(h.decoder.release(), CodecStatus::Ok);
}

#[test]
fn device_failures_during_init_request_fallback() {
    init_test_tracing();
    for point in [FailurePoint::Create, FailurePoint::Configure, FailurePoint::Start] {
        let mut h = harness(LoopbackConfig::default(), ColorFormat::Yuv420SemiPlanar, None);
        h.probe.fail(point);
        let (callback, _rx) = collector();

        let status = h.decoder.init_decode(DecoderSettings::new(64, 48), callback);
        assert_eq!(status, CodecStatus::FallbackSoftware, "{point:?}");

        let status = h.decoder.decode(&CodedFrame::key(vec![1], 0), &info());
        assert_eq!(status, CodecStatus::Uninitialized, "{point:?}");
        assert_eq!(h.decoder.release(), CodecStatus::Ok, "{point:?}");
    }
}

#[test]
fn key_frame_gating_across_resolution_change() {
    init_test_tracing();
    let mut h = harness(LoopbackConfig::default(), ColorFormat::Yuv420SemiPlanar, None);
    let (callback, rx) = collector();
    assert_eq!(
        h.decoder.init_decode(DecoderSettings::new(320, 240), callback),
        CodecStatus::Ok
    );

    // Nothing decodes before a complete key frame
    let delta = CodedFrame::delta(vec![1, 2], 1_000).with_size(320, 240);
    assert_eq!(h.decoder.decode(&delta, &info()), CodecStatus::NoOutput);
    let partial = CodedFrame::key(vec![1, 2], 2_000)
        .with_size(320, 240)
        .with_complete(false);
    assert_eq!(h.decoder.decode(&partial, &info()), CodecStatus::NoOutput);
    assert_eq!(h.probe.inputs_queued(), 0);

    let key = CodedFrame::key(vec![3, 4], 3_000).with_size(320, 240);
    assert_eq!(h.decoder.decode(&key, &info()), CodecStatus::Ok);
    let delta = CodedFrame::delta(vec![5], 4_000).with_size(320, 240);
    assert_eq!(h.decoder.decode(&delta, &info()), CodecStatus::Ok);

    // A new size rebuilds the device and requires a key frame again
    let resized_delta = CodedFrame::delta(vec![6], 5_000).with_size(640, 480);
    assert_eq!(h.decoder.decode(&resized_delta, &info()), CodecStatus::NoOutput);
    assert_eq!(h.probe.devices_created(), 2);
    assert_eq!(h.probe.releases(), 1);

    let resized_key = CodedFrame::key(vec![7], 6_000).with_size(640, 480);
    assert_eq!(h.decoder.decode(&resized_key, &info()), CodecStatus::Ok);

    let resized = loop {
        let collected = rx.recv_timeout(FRAME_TIMEOUT).unwrap();
        if collected.frame.buffer.width() == 640 {
            break collected;
        }
    };
    assert_eq!(resized.frame.buffer.height(), 480);
    assert_eq!(resized.frame.timestamp_ns, 6_000);

    assert_eq!(h.decoder.release(), CodecStatus::Ok);
    assert_eq!(h.probe.post_release_calls(), 0);
}

#[test]
fn failed_queue_rolls_back_metadata() {
    init_test_tracing();
    let mut h = harness(LoopbackConfig::default(), ColorFormat::Yuv420SemiPlanar, None);
    let (callback, rx) = collector();
    assert_eq!(
        h.decoder.init_decode(DecoderSettings::new(32, 16), callback),
        CodecStatus::Ok
    );

    h.probe.fail(FailurePoint::Queue);
    let key = CodedFrame::key(vec![1, 2, 3], 1_000);
    assert_eq!(h.decoder.decode(&key, &info()), CodecStatus::Error);
    assert_eq!(h.decoder.pending_frames(), 0);
    assert_eq!(h.decoder.correlation_stats().rolled_back, 1);

    // Still waiting for a key frame after the failure
    h.probe.clear_failure(FailurePoint::Queue);
    let delta = CodedFrame::delta(vec![4], 2_000);
    assert_eq!(h.decoder.decode(&delta, &info()), CodecStatus::NoOutput);
    assert_eq!(h.decoder.decode(&key, &info()), CodecStatus::Ok);

    let collected = rx.recv_timeout(FRAME_TIMEOUT).unwrap();
    assert_eq!(collected.frame.timestamp_ns, 1_000);
    assert_eq!(h.decoder.release(), CodecStatus::Ok);
}

#[test]
fn oversized_input_is_an_error() {
    init_test_tracing();
    // A single input buffer: losing it would stall every later decode
    let loopback = LoopbackConfig {
        input_buffers: 1,
        input_capacity: 4,
        ..Default::default()
    };
    let mut h = harness(loopback, ColorFormat::Yuv420SemiPlanar, None);
    let (callback, rx) = collector();
    assert_eq!(
        h.decoder.init_decode(DecoderSettings::new(32, 16), callback),
        CodecStatus::Ok
    );

    let oversized = CodedFrame::key(vec![0; 8], 0);
    assert_eq!(h.decoder.decode(&oversized, &info()), CodecStatus::Error);
    assert_eq!(h.decoder.pending_frames(), 0);

    let key = CodedFrame::key(vec![7], 5_000);
    assert_eq!(h.decoder.decode(&key, &info()), CodecStatus::Ok);
    let collected = rx.recv_timeout(FRAME_TIMEOUT).unwrap();
    assert_eq!(collected.frame.timestamp_ns, 5_000);
    assert_eq!(h.decoder.correlation_stats().underflows, 0);
    assert_eq!(h.decoder.release(), CodecStatus::Ok);
}

#[test]
fn exhausted_input_buffers_report_error() {
    init_test_tracing();
    let loopback = LoopbackConfig {
        input_buffers: 0,
        ..Default::default()
    };
    let mut h = harness(loopback, ColorFormat::Yuv420SemiPlanar, None);
    let (callback, _rx) = collector();
    assert_eq!(
        h.decoder.init_decode(DecoderSettings::new(32, 16), callback),
        CodecStatus::Ok
    );

    let key = CodedFrame::key(vec![1], 0);
    assert_eq!(h.decoder.decode(&key, &info()), CodecStatus::Error);
    assert_eq!(h.decoder.release(), CodecStatus::Ok);
}

#[test]
fn stuck_device_times_out_without_touching_device() {
    init_test_tracing();
    let pipeline = PipelineConfig {
        release_timeout_ms: 200,
        ..common::fast_pipeline()
    };
    let mut h = harness_with(
        LoopbackConfig::default(),
        ColorFormat::Yuv420SemiPlanar,
        None,
        pipeline,
    );
    let (callback, _rx) = collector();
    assert_eq!(
        h.decoder.init_decode(DecoderSettings::new(32, 16), callback),
        CodecStatus::Ok
    );

    h.probe.set_stuck(true);
    std::thread::sleep(Duration::from_millis(50));

    let started = std::time::Instant::now();
    assert_eq!(h.decoder.release(), CodecStatus::Timeout);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(h.probe.releases(), 0);

    let status = h.decoder.decode(&CodedFrame::key(vec![1], 0), &info());
    assert_eq!(status, CodecStatus::Uninitialized);
    assert_eq!(h.decoder.release(), CodecStatus::Ok);

    // Once unstuck the abandoned thread finishes teardown by itself
    h.probe.set_stuck(false);
    assert!(wait_until(FRAME_TIMEOUT, || h.probe.releases() == 1));
    assert_eq!(h.probe.post_release_calls(), 0);
}

#[test]
fn resize_after_first_frame_fails_the_session() {
    init_test_tracing();
    let mut h = harness(LoopbackConfig::default(), ColorFormat::Yuv420SemiPlanar, None);
    let (callback, rx) = collector();
    assert_eq!(
        h.decoder.init_decode(DecoderSettings::new(320, 240), callback),
        CodecStatus::Ok
    );
    let key = CodedFrame::key(vec![1], 0).with_size(320, 240);
    assert_eq!(h.decoder.decode(&key, &info()), CodecStatus::Ok);
    rx.recv_timeout(FRAME_TIMEOUT).unwrap();

    h.probe.push_format_change(OutputFormat {
        width: Some(640),
        height: Some(480),
        ..Default::default()
    });
    assert!(wait_until(FRAME_TIMEOUT, || {
        h.decoder.state() == SessionState::Failed
    }));

    // The output thread tore the device down on its own
    assert!(wait_until(FRAME_TIMEOUT, || h.probe.releases() == 1));
    let delta = CodedFrame::delta(vec![2], 1_000);
    assert_eq!(h.decoder.decode(&delta, &info()), CodecStatus::Error);
    assert_eq!(h.probe.post_release_calls(), 0);
    assert_eq!(h.decoder.pending_frames(), 0);

    assert_eq!(h.decoder.release(), CodecStatus::Error);
    assert_eq!(h.decoder.release(), CodecStatus::Ok);
    assert_eq!(h.probe.post_release_calls(), 0);
}

#[test]
fn teardown_failure_is_reported_once() {
    init_test_tracing();
    let mut h = harness(LoopbackConfig::default(), ColorFormat::Yuv420SemiPlanar, None);
    let (callback, _rx) = collector();
    assert_eq!(
        h.decoder.init_decode(DecoderSettings::new(32, 16), callback),
        CodecStatus::Ok
    );

    h.probe.fail(FailurePoint::Stop);
    assert_eq!(h.decoder.release(), CodecStatus::Error);
    assert_eq!(h.decoder.release(), CodecStatus::Ok);
    assert_eq!(h.probe.releases(), 1);
}

#[test]
fn underflow_falls_back_to_default_metadata() {
    init_test_tracing();
    let mut h = harness(LoopbackConfig::default(), ColorFormat::Yuv420SemiPlanar, None);
    let (callback, rx) = collector();
    assert_eq!(
        h.decoder.init_decode(DecoderSettings::new(16, 16), callback),
        CodecStatus::Ok
    );

    h.probe.emit_spurious_output();
    let collected = rx.recv_timeout(FRAME_TIMEOUT).unwrap();
    assert_eq!(collected.decode_time_ms, None);
    assert_eq!(collected.frame.rotation, hwdec::Rotation::R0);
    assert_eq!(h.decoder.correlation_stats().underflows, 1);
    assert_eq!(h.decoder.state(), SessionState::Running);
    assert_eq!(h.decoder.release(), CodecStatus::Ok);
}

#[test]
fn strict_correlation_makes_underflow_fatal() {
    init_test_tracing();
    let pipeline = PipelineConfig {
        strict_correlation: true,
        ..common::fast_pipeline()
    };
    let mut h = harness_with(
        LoopbackConfig::default(),
        ColorFormat::Yuv420SemiPlanar,
        None,
        pipeline,
    );
    let (callback, rx) = collector();
    assert_eq!(
        h.decoder.init_decode(DecoderSettings::new(16, 16), callback),
        CodecStatus::Ok
    );

    h.probe.emit_spurious_output();
    assert!(wait_until(FRAME_TIMEOUT, || {
        h.decoder.state() == SessionState::Failed
    }));
    assert!(rx.try_recv().is_err());
    // The stray buffer still goes back to the device
    assert_eq!(h.probe.unrendered_releases(), 1);
    assert_eq!(h.decoder.release(), CodecStatus::Error);
}

#[test]
fn reports_implementation_details() {
    let h = harness(LoopbackConfig::default(), ColorFormat::Yuv420SemiPlanar, None);
    assert_eq!(
        h.decoder.implementation_name(),
        hwdec::codec::loopback::LOOPBACK_DEVICE_NAME
    );
    assert!(h.decoder.prefers_late_decoding());
}
