//! Software stand-in for a hardware codec.
//!
//! [`LoopbackDevice`] "decodes" every queued input into one output buffer
//! filled with a test pattern seeded from the payload, laid out with the
//! configured stride and slice-height padding. A shared [`LoopbackProbe`]
//! injects failures and format changes and records how the pipeline used
//! the device.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace};

use super::factory::DeviceInfo;
use super::{
    CodecDevice, CodecDeviceFactory, DequeueOutput, MediaFormat, OutputBufferInfo, OutputFormat,
    OutputTarget, PlaneLayout, VideoCodecType,
};
use crate::error::DeviceError;
use crate::LoopbackConfig;

pub const LOOPBACK_DEVICE_NAME: &str = "OMX.hwdec.loopback.decoder";

/// Device calls that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    Create,
    Configure,
    Start,
    Queue,
    Stop,
    Release,
}

/// Seed of the pattern a payload decodes to
pub fn pattern_seed(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

pub fn pattern_y(seed: u8, x: usize, y: usize) -> u8 {
    seed.wrapping_add((x + 3 * y) as u8)
}

pub fn pattern_u(seed: u8, x: usize, y: usize) -> u8 {
    seed.wrapping_add(0x40).wrapping_add((2 * x + y) as u8)
}

pub fn pattern_v(seed: u8, x: usize, y: usize) -> u8 {
    seed.wrapping_add(0x80).wrapping_add((x + 2 * y) as u8)
}

/// Packed I420 picture the pipeline should produce for `payload`
pub fn expected_i420(payload: &[u8], width: usize, height: usize) -> Vec<u8> {
    let seed = pattern_seed(payload);
    let (cw, ch) = (width.div_ceil(2), height.div_ceil(2));
    let mut out = Vec::with_capacity(width * height + 2 * cw * ch);
    for y in 0..height {
        out.extend((0..width).map(|x| pattern_y(seed, x, y)));
    }
    for y in 0..ch {
        out.extend((0..cw).map(|x| pattern_u(seed, x, y)));
    }
    for y in 0..ch {
        out.extend((0..cw).map(|x| pattern_v(seed, x, y)));
    }
    out
}

#[derive(Default)]
struct ProbeState {
    failures: Mutex<HashSet<FailurePoint>>,
    stuck: AtomicBool,
    format_changes: Mutex<VecDeque<OutputFormat>>,
    spurious_outputs: AtomicUsize,

    created: AtomicUsize,
    queued: AtomicUsize,
    renders: AtomicUsize,
    unrendered: AtomicUsize,
    stops: AtomicUsize,
    releases: AtomicUsize,
    post_release_calls: AtomicUsize,
}

/// Control and observation handle shared by a factory and its devices
#[derive(Clone, Default)]
pub struct LoopbackProbe {
    inner: Arc<ProbeState>,
}

impl LoopbackProbe {
    pub fn fail(&self, point: FailurePoint) {
        self.failures().insert(point);
    }

    pub fn clear_failure(&self, point: FailurePoint) {
        self.failures().remove(&point);
    }

    /// While stuck, output dequeues block regardless of their timeout
    pub fn set_stuck(&self, stuck: bool) {
        self.inner.stuck.store(stuck, Ordering::SeqCst);
    }

    /// Report `format` on the next output dequeue
    pub fn push_format_change(&self, format: OutputFormat) {
        self.inner
            .format_changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(format);
    }

    /// Emit one output buffer no input was queued for
    pub fn emit_spurious_output(&self) {
        self.inner.spurious_outputs.fetch_add(1, Ordering::SeqCst);
    }

    pub fn devices_created(&self) -> usize {
        self.inner.created.load(Ordering::SeqCst)
    }

    pub fn inputs_queued(&self) -> usize {
        self.inner.queued.load(Ordering::SeqCst)
    }

    /// Output buffers released with `render = true`
    pub fn renders(&self) -> usize {
        self.inner.renders.load(Ordering::SeqCst)
    }

    /// Output buffers released with `render = false`
    pub fn unrendered_releases(&self) -> usize {
        self.inner.unrendered.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.inner.stops.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.inner.releases.load(Ordering::SeqCst)
    }

    /// Calls made on a device after it was released
    pub fn post_release_calls(&self) -> usize {
        self.inner.post_release_calls.load(Ordering::SeqCst)
    }

    fn should_fail(&self, point: FailurePoint) -> bool {
        self.failures().contains(&point)
    }

    fn is_stuck(&self) -> bool {
        self.inner.stuck.load(Ordering::SeqCst)
    }

    fn next_format_change(&self) -> Option<OutputFormat> {
        self.inner
            .format_changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn take_spurious_output(&self) -> bool {
        self.inner
            .spurious_outputs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn failures(&self) -> MutexGuard<'_, HashSet<FailurePoint>> {
        self.inner
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Creates [`LoopbackDevice`]s for every enumerated name
pub struct LoopbackFactory {
    devices: Vec<DeviceInfo>,
    config: LoopbackConfig,
    probe: LoopbackProbe,
}

impl LoopbackFactory {
    /// One decoder for every codec type, offering planar and semi-planar
    /// output.
    pub fn new(config: LoopbackConfig) -> Self {
        Self {
            devices: vec![DeviceInfo {
                name: LOOPBACK_DEVICE_NAME.into(),
                is_encoder: false,
                supported_types: VideoCodecType::ALL.to_vec(),
                color_formats: vec![21, 19],
            }],
            config,
            probe: LoopbackProbe::default(),
        }
    }

    pub fn with_devices(devices: Vec<DeviceInfo>) -> Self {
        Self {
            devices,
            ..Self::new(LoopbackConfig::default())
        }
    }

    pub fn probe(&self) -> LoopbackProbe {
        self.probe.clone()
    }
}

impl CodecDeviceFactory for LoopbackFactory {
    fn create(&self, name: &str) -> Result<Arc<dyn CodecDevice>, DeviceError> {
        if self.probe.should_fail(FailurePoint::Create) {
            return Err(DeviceError::Create {
                name: name.into(),
                reason: "injected failure".into(),
            });
        }
        if !self.devices.iter().any(|d| d.name == name) {
            return Err(DeviceError::Create {
                name: name.into(),
                reason: "no such device".into(),
            });
        }
        self.probe.inner.created.fetch_add(1, Ordering::SeqCst);
        debug!(name, "Created loopback device");
        Ok(Arc::new(LoopbackDevice::new(
            name,
            self.config.clone(),
            self.probe.clone(),
        )))
    }

    fn enumerate(&self) -> Vec<DeviceInfo> {
        self.devices.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Configured,
    Started,
    Stopped,
    Released,
}

enum Pending {
    FormatChanged,
    Output {
        data: Bytes,
        pts_us: u64,
        ready_at: Instant,
    },
}

/// Output geometry derived from the configured size and padding
#[derive(Debug, Clone, Copy)]
struct Layout {
    width: usize,
    height: usize,
    stride: usize,
    slice_height: usize,
    planes: PlaneLayout,
}

struct DeviceState {
    phase: Phase,
    layout: Option<Layout>,
    target: Option<OutputTarget>,
    reported: OutputFormat,
    free_inputs: VecDeque<usize>,
    inputs: HashMap<usize, Bytes>,
    dequeued_inputs: HashSet<usize>,
    pending: VecDeque<Pending>,
    outputs: HashMap<usize, Bytes>,
    next_output: usize,
}

pub struct LoopbackDevice {
    name: String,
    config: LoopbackConfig,
    probe: LoopbackProbe,
    state: Mutex<DeviceState>,
    input_freed: Condvar,
    output_queued: Condvar,
}

impl LoopbackDevice {
    pub fn new(name: &str, config: LoopbackConfig, probe: LoopbackProbe) -> Self {
        Self {
            name: name.into(),
            config,
            probe,
            state: Mutex::new(DeviceState {
                phase: Phase::Created,
                layout: None,
                target: None,
                reported: OutputFormat::default(),
                free_inputs: VecDeque::new(),
                inputs: HashMap::new(),
                dequeued_inputs: HashSet::new(),
                pending: VecDeque::new(),
                outputs: HashMap::new(),
                next_output: 0,
            }),
            input_freed: Condvar::new(),
            output_queued: Condvar::new(),
        }
    }

    /// Lock the state, failing if the device was released
    fn live(&self) -> Result<MutexGuard<'_, DeviceState>, DeviceError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.phase == Phase::Released {
            self.probe
                .inner
                .post_release_calls
                .fetch_add(1, Ordering::SeqCst);
            return Err(DeviceError::Released);
        }
        Ok(state)
    }

    fn started(&self) -> Result<MutexGuard<'_, DeviceState>, DeviceError> {
        let state = self.live()?;
        if state.phase != Phase::Started {
            return Err(DeviceError::IllegalState(format!(
                "device is {:?}",
                state.phase
            )));
        }
        Ok(state)
    }

    fn output_layout(&self, format: &MediaFormat) -> Layout {
        let (width, height) = (format.width as usize, format.height as usize);
        let stride = (width + self.config.stride_padding as usize).next_multiple_of(2);
        let slice_height = height + self.config.slice_padding as usize;
        let planes = format
            .color_format
            .map_or(PlaneLayout::SemiPlanar, |c| c.layout());
        Layout {
            width,
            height,
            stride,
            slice_height,
            planes,
        }
    }

    fn reported_format(&self, layout: &Layout, format: &MediaFormat) -> OutputFormat {
        let (w, h) = (layout.width as u32, layout.height as u32);
        let mut reported = OutputFormat {
            width: Some(w),
            height: Some(h),
            stride: Some(layout.stride as u32),
            slice_height: Some(layout.slice_height as u32),
            color_format: format.color_format.map(|c| c.tag()),
            ..Default::default()
        };
        if self.config.report_crop {
            reported.width = Some(layout.stride as u32);
            reported.height = Some(layout.slice_height as u32);
            reported.crop_left = Some(0);
            reported.crop_right = Some(w.saturating_sub(1));
            reported.crop_top = Some(0);
            reported.crop_bottom = Some(h.saturating_sub(1));
        }
        reported
    }
}

/// Render the test pattern for `seed` in the device's native layout
fn render_pattern(layout: &Layout, seed: u8) -> Vec<u8> {
    let Layout {
        width: w,
        height: h,
        stride,
        slice_height: slice,
        planes,
    } = *layout;
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));

    let mut buf = match planes {
        PlaneLayout::Planar => {
            let plane = (stride / 2) * slice / 2;
            vec![0u8; (stride * slice + 2 * plane).max((stride * slice * 3).div_ceil(2))]
        }
        PlaneLayout::SemiPlanar => vec![0u8; stride * (slice + slice.div_ceil(2))],
    };

    for y in 0..h {
        for x in 0..w {
            buf[y * stride + x] = pattern_y(seed, x, y);
        }
    }

    match planes {
        PlaneLayout::Planar => {
            let uv_stride = stride / 2;
            let u_pos = stride * slice;
            let plane = uv_stride * slice / 2;
            let v_pos = u_pos + plane;
            for y in 0..ch {
                for x in 0..cw {
                    let offset = y * uv_stride + x;
                    if offset < plane {
                        buf[u_pos + offset] = pattern_u(seed, x, y);
                        buf[v_pos + offset] = pattern_v(seed, x, y);
                    }
                }
            }
        }
        PlaneLayout::SemiPlanar => {
            let uv_pos = stride * slice;
            for y in 0..ch {
                for x in 0..cw {
                    buf[uv_pos + y * stride + 2 * x] = pattern_u(seed, x, y);
                    buf[uv_pos + y * stride + 2 * x + 1] = pattern_v(seed, x, y);
                }
            }
        }
    }
    buf
}

impl CodecDevice for LoopbackDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&self, format: &MediaFormat, target: OutputTarget) -> Result<(), DeviceError> {
        let mut state = self.live()?;
        if self.probe.should_fail(FailurePoint::Configure) {
            return Err(DeviceError::Configure("injected failure".into()));
        }
        if state.phase != Phase::Created {
            return Err(DeviceError::IllegalState("already configured".into()));
        }
        let layout = self.output_layout(format);
        state.reported = self.reported_format(&layout, format);
        state.layout = Some(layout);
        state.target = Some(target);
        state.phase = Phase::Configured;
        debug!(device = %self.name, ?format, "Configured");
        Ok(())
    }

    fn start(&self) -> Result<(), DeviceError> {
        let mut state = self.live()?;
        if self.probe.should_fail(FailurePoint::Start) {
            return Err(DeviceError::IllegalState("injected start failure".into()));
        }
        if state.phase != Phase::Configured {
            return Err(DeviceError::IllegalState("start before configure".into()));
        }
        state.free_inputs = (0..self.config.input_buffers).collect();
        state.pending.push_back(Pending::FormatChanged);
        state.phase = Phase::Started;
        Ok(())
    }

    fn dequeue_input_buffer(&self, timeout: Duration) -> Result<Option<usize>, DeviceError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.started()?;
        loop {
            if let Some(index) = state.free_inputs.pop_front() {
                state.dequeued_inputs.insert(index);
                return Ok(Some(index));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            state = self
                .input_freed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn fill_input_buffer(&self, index: usize, data: &[u8]) -> Result<(), DeviceError> {
        let mut state = self.started()?;
        if !state.dequeued_inputs.contains(&index) {
            return Err(DeviceError::InvalidIndex(index));
        }
        if data.len() > self.config.input_capacity {
            return Err(DeviceError::BufferTooSmall {
                needed: data.len(),
                capacity: self.config.input_capacity,
            });
        }
        state.inputs.insert(index, Bytes::copy_from_slice(data));
        Ok(())
    }

    fn queue_input_buffer(
        &self,
        index: usize,
        size: usize,
        presentation_time_us: u64,
    ) -> Result<(), DeviceError> {
        let mut state = self.started()?;
        if !state.dequeued_inputs.remove(&index) {
            return Err(DeviceError::InvalidIndex(index));
        }
        let data = state.inputs.remove(&index).unwrap_or_default();
        state.free_inputs.push_back(index);
        self.input_freed.notify_one();

        if self.probe.should_fail(FailurePoint::Queue) {
            return Err(DeviceError::IllegalState("injected queue failure".into()));
        }
        if size == 0 {
            trace!(index, "Empty input returned");
            return Ok(());
        }
        let layout = state
            .layout
            .ok_or_else(|| DeviceError::IllegalState("no layout".into()))?;

        let payload = data.slice(..size.min(data.len()));
        let pattern = render_pattern(&layout, pattern_seed(&payload));
        state.pending.push_back(Pending::Output {
            data: Bytes::from(pattern),
            pts_us: presentation_time_us,
            ready_at: Instant::now() + Duration::from_millis(self.config.decode_latency_ms),
        });
        self.probe.inner.queued.fetch_add(1, Ordering::SeqCst);
        self.output_queued.notify_all();
        trace!(index, presentation_time_us, "Input queued");
        Ok(())
    }

    fn dequeue_output_buffer(&self, timeout: Duration) -> Result<DequeueOutput, DeviceError> {
        while self.probe.is_stuck() {
            thread::sleep(Duration::from_millis(5));
        }

        let deadline = Instant::now() + timeout;
        let mut state = self.started()?;

        if let Some(format) = self.probe.next_format_change() {
            state.reported = format;
            return Ok(DequeueOutput::FormatChanged);
        }
        if self.probe.take_spurious_output() {
            let layout = state
                .layout
                .ok_or_else(|| DeviceError::IllegalState("no layout".into()))?;
            let data = Bytes::from(render_pattern(&layout, 0));
            return Ok(DequeueOutput::Buffer(hand_out(&mut state, data, 0)));
        }

        loop {
            let now = Instant::now();
            let wait_until = match state.pending.front() {
                Some(Pending::Output { ready_at, .. }) if *ready_at > now => *ready_at,
                Some(_) => break,
                None => deadline,
            };
            if now >= deadline {
                return Ok(DequeueOutput::TryAgainLater);
            }
            state = self
                .output_queued
                .wait_timeout(state, wait_until.min(deadline) - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        match state.pending.pop_front() {
            Some(Pending::Output { data, pts_us, .. }) => {
                Ok(DequeueOutput::Buffer(hand_out(&mut state, data, pts_us)))
            }
            Some(Pending::FormatChanged) => Ok(DequeueOutput::FormatChanged),
            None => Ok(DequeueOutput::TryAgainLater),
        }
    }

    fn output_format(&self) -> Result<OutputFormat, DeviceError> {
        Ok(self.live()?.reported.clone())
    }

    fn output_buffer(&self, index: usize) -> Result<Bytes, DeviceError> {
        self.live()?
            .outputs
            .get(&index)
            .cloned()
            .ok_or(DeviceError::InvalidIndex(index))
    }

    fn release_output_buffer(&self, index: usize, render: bool) -> Result<(), DeviceError> {
        let mut state = self.live()?;
        if state.outputs.remove(&index).is_none() {
            return Err(DeviceError::InvalidIndex(index));
        }
        if !render {
            self.probe.inner.unrendered.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }
        self.probe.inner.renders.fetch_add(1, Ordering::SeqCst);
        if let Some(OutputTarget::Texture(texture)) = &state.target {
            texture.frame_available();
        }
        Ok(())
    }

    fn stop(&self) -> Result<(), DeviceError> {
        let mut state = self.live()?;
        state.phase = Phase::Stopped;
        state.pending.clear();
        state.outputs.clear();
        self.probe.inner.stops.fetch_add(1, Ordering::SeqCst);
        if self.probe.should_fail(FailurePoint::Stop) {
            return Err(DeviceError::IllegalState("injected stop failure".into()));
        }
        Ok(())
    }

    fn release(&self) -> Result<(), DeviceError> {
        let mut state = self.live()?;
        state.phase = Phase::Released;
        state.target = None;
        self.probe.inner.releases.fetch_add(1, Ordering::SeqCst);
        debug!(device = %self.name, "Released");
        if self.probe.should_fail(FailurePoint::Release) {
            return Err(DeviceError::IllegalState("injected release failure".into()));
        }
        Ok(())
    }
}

fn hand_out(state: &mut DeviceState, data: Bytes, pts_us: u64) -> OutputBufferInfo {
    let index = state.next_output;
    state.next_output += 1;
    let size = data.len();
    state.outputs.insert(index, data);
    OutputBufferInfo {
        index,
        offset: 0,
        size,
        presentation_time_us: pts_us,
    }
}
