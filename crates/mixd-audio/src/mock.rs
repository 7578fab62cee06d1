//! Mock hardware device for running the engine without audio hardware.
//!
//! The mock keeps an mmap-style buffer, derives its hardware position from
//! the monotonic clock since start, and records what the endpoint renders so
//! tests can inspect it. Failures can be injected per operation.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use mixd_core::types::format::NANOS_PER_SECOND;
use mixd_core::{DeviceInfo, Error, Result, SampleFormat, StreamInfo};

use crate::buffer::{BufferHolder, SharedAudioBuffer, SharedBuffer, SharedBufferDescriptor};
use crate::clock;
use crate::device::{DeviceAttr, DeviceFactory, HandlePosition, HardwareDevice};
use crate::mix;

/// Rendered spans kept for inspection.
const RENDER_HISTORY: usize = 64;

/// Generates an interleaved sine wave in any sample format.
#[derive(Debug, Clone)]
pub struct SineGenerator {
    info: StreamInfo,
    frequency: f64,
    amplitude: f64,
    frame: u64,
}

impl SineGenerator {
    pub fn new(info: StreamInfo, frequency: f64, amplitude: f64) -> Self {
        Self {
            info,
            frequency,
            amplitude: amplitude.clamp(0.0, 1.0),
            frame: 0,
        }
    }

    /// Fill `out` with the next frames of the wave.
    pub fn fill(&mut self, out: &mut [u8]) {
        let width = self.info.format.bytes_per_sample() as usize;
        let frame_bytes = self.info.bytes_per_frame() as usize;
        let rate = f64::from(self.info.sample_rate);

        for frame in out.chunks_exact_mut(frame_bytes) {
            let t = self.frame as f64 / rate;
            let value = self.amplitude * (2.0 * std::f64::consts::PI * self.frequency * t).sin();
            for sample in frame.chunks_exact_mut(width) {
                encode_sample(self.info.format, value, sample);
            }
            self.frame += 1;
        }
    }

    /// Next `frames` frames as a fresh buffer.
    pub fn generate(&mut self, frames: usize) -> Vec<u8> {
        let mut out = vec![0u8; frames * self.info.bytes_per_frame() as usize];
        self.fill(&mut out);
        out
    }
}

/// Encode a normalized sample in [-1.0, 1.0].
fn encode_sample(format: SampleFormat, value: f64, out: &mut [u8]) {
    let value = value.clamp(-1.0, 1.0);
    match format {
        SampleFormat::U8 => out[0] = (value * 127.0 + 128.0) as u8,
        SampleFormat::S16Le => out.copy_from_slice(&((value * 32767.0) as i16).to_le_bytes()),
        SampleFormat::S24Le => {
            let scaled = (value * 8_388_607.0) as i32;
            out.copy_from_slice(&scaled.to_le_bytes()[..3]);
        }
        SampleFormat::S32Le => {
            out.copy_from_slice(&((value * f64::from(i32::MAX)) as i32).to_le_bytes());
        }
        SampleFormat::F32Le => out.copy_from_slice(&(value as f32).to_le_bytes()),
    }
}

/// Geometry of the mock's mmap buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockDeviceConfig {
    pub span_frames: u32,
    pub span_count: u32,
}

impl Default for MockDeviceConfig {
    fn default() -> Self {
        // 20ms spans at 48kHz, four of them.
        Self {
            span_frames: 960,
            span_count: 4,
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    attr: Option<DeviceAttr>,
    buffer: Option<SharedBuffer>,
    running: bool,
    paused: bool,
    /// Frames accumulated before the current run segment.
    base_frames: u64,
    /// Clock time the current run segment started.
    segment_start_ns: i64,
    rendered: VecDeque<Vec<u8>>,
    capture: Option<SineGenerator>,
}

impl MockState {
    fn position_at(&self, now_ns: i64) -> u64 {
        let Some(attr) = &self.attr else {
            return 0;
        };
        if !self.running || self.paused {
            return self.base_frames;
        }
        let elapsed = (now_ns - self.segment_start_ns).max(0) as u128;
        let frames = elapsed * u128::from(attr.stream_info.sample_rate) / NANOS_PER_SECOND as u128;
        self.base_frames + frames as u64
    }

    fn freeze(&mut self) {
        self.base_frames = self.position_at(clock::now_ns());
    }
}

/// A software stand-in for a hardware sink or source.
#[derive(Debug, Default)]
pub struct MockDevice {
    config: MockDeviceConfig,
    state: Mutex<MockState>,
    rendered_spans: AtomicU64,
    non_silent_spans: AtomicU64,
    captured_spans: AtomicU64,
    fail_start: AtomicBool,
    fail_render: AtomicBool,
    fail_position: AtomicBool,
}

impl MockDevice {
    pub fn new(config: MockDeviceConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Captured spans will carry a sine wave instead of silence.
    pub fn set_capture_tone(&self, frequency: f64, amplitude: f64) {
        let mut state = self.state.lock();
        state.capture = state
            .attr
            .as_ref()
            .map(|attr| SineGenerator::new(attr.stream_info, frequency, amplitude));
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_render(&self, fail: bool) {
        self.fail_render.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_position(&self, fail: bool) {
        self.fail_position.store(fail, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        let state = self.state.lock();
        state.running && !state.paused
    }

    pub fn rendered_spans(&self) -> u64 {
        self.rendered_spans.load(Ordering::Relaxed)
    }

    pub fn non_silent_spans(&self) -> u64 {
        self.non_silent_spans.load(Ordering::Relaxed)
    }

    pub fn captured_spans(&self) -> u64 {
        self.captured_spans.load(Ordering::Relaxed)
    }

    /// The most recent rendered spans, oldest first.
    pub fn rendered_history(&self) -> Vec<Vec<u8>> {
        self.state.lock().rendered.iter().cloned().collect()
    }

    fn format(&self) -> SampleFormat {
        self.state
            .lock()
            .attr
            .as_ref()
            .map_or(SampleFormat::default(), |attr| attr.stream_info.format)
    }
}

impl HardwareDevice for MockDevice {
    fn init(&self, attr: &DeviceAttr) -> Result<()> {
        attr.stream_info.validate()?;
        let mut state = self.state.lock();
        if state.attr.is_some() {
            return Ok(());
        }
        let buffer = SharedAudioBuffer::create_local(
            self.config.span_frames * self.config.span_count,
            self.config.span_frames,
            attr.stream_info.bytes_per_frame(),
            BufferHolder::ServerOnly,
        )?;
        state.attr = Some(attr.clone());
        state.buffer = Some(buffer);
        Ok(())
    }

    fn is_inited(&self) -> bool {
        self.state.lock().attr.is_some()
    }

    fn deinit(&self) {
        let mut state = self.state.lock();
        *state = MockState::default();
    }

    fn start(&self) -> Result<()> {
        if self.fail_start.load(Ordering::Relaxed) {
            return Err(Error::operation_failed("mock device refused to start"));
        }
        let mut state = self.state.lock();
        if state.attr.is_none() {
            return Err(Error::illegal_state("mock device not inited"));
        }
        if !state.running {
            state.running = true;
            state.paused = false;
            state.segment_start_ns = clock::now_ns();
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.freeze();
        state.running = false;
        state.paused = false;
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.running {
            return Err(Error::illegal_state("mock device not running"));
        }
        state.freeze();
        state.paused = true;
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.running || !state.paused {
            return Err(Error::illegal_state("mock device not paused"));
        }
        state.paused = false;
        state.segment_start_ns = clock::now_ns();
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.state.lock().rendered.clear();
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.base_frames = 0;
        state.segment_start_ns = clock::now_ns();
        state.rendered.clear();
        if let Some(buffer) = &state.buffer {
            buffer.clear();
        }
        Ok(())
    }

    fn render_frame(&self, data: &[u8]) -> Result<usize> {
        if self.fail_render.load(Ordering::Relaxed) {
            return Err(Error::operation_failed("mock render failed"));
        }
        let format = self.format();
        let mut state = self.state.lock();
        if !state.running {
            return Err(Error::illegal_state("render on a stopped mock device"));
        }
        if state.rendered.len() == RENDER_HISTORY {
            state.rendered.pop_front();
        }
        state.rendered.push_back(data.to_vec());
        drop(state);

        self.rendered_spans.fetch_add(1, Ordering::Relaxed);
        if !mix::is_silent(data, format) {
            self.non_silent_spans.fetch_add(1, Ordering::Relaxed);
        }
        Ok(data.len())
    }

    fn capture_frame(&self, data: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock();
        if !state.running {
            return Err(Error::illegal_state("capture on a stopped mock device"));
        }
        let format = state
            .attr
            .as_ref()
            .map_or(SampleFormat::default(), |attr| attr.stream_info.format);
        match state.capture.as_mut() {
            Some(tone) => tone.fill(data),
            None => mix::fill_silence(data, format),
        }
        drop(state);

        self.captured_spans.fetch_add(1, Ordering::Relaxed);
        Ok(data.len())
    }

    fn latency_us(&self) -> Result<u64> {
        let state = self.state.lock();
        let attr = state
            .attr
            .as_ref()
            .ok_or_else(|| Error::illegal_state("mock device not inited"))?;
        let frames = u64::from(self.config.span_frames * self.config.span_count);
        Ok(frames * 1_000_000 / u64::from(attr.stream_info.sample_rate))
    }

    fn mmap_buffer_info(&self) -> Result<SharedBufferDescriptor> {
        self.state
            .lock()
            .buffer
            .as_ref()
            .map(|buffer| buffer.descriptor())
            .ok_or_else(|| Error::illegal_state("mock device has no mmap buffer"))
    }

    fn mmap_handle_position(&self) -> Result<HandlePosition> {
        if self.fail_position.load(Ordering::Relaxed) {
            return Err(Error::operation_failed("mock position query failed"));
        }
        let now = clock::now_ns();
        let frames = self.state.lock().position_at(now);
        Ok(HandlePosition {
            frames,
            sec: now / NANOS_PER_SECOND,
            nsec: now % NANOS_PER_SECOND,
        })
    }
}

/// Opens a [`MockDevice`] per device and keeps them for inspection.
#[derive(Debug, Default)]
pub struct MockDeviceFactory {
    config: MockDeviceConfig,
    opened: Mutex<Vec<(DeviceInfo, Arc<MockDevice>)>>,
}

impl MockDeviceFactory {
    pub fn new(config: MockDeviceConfig) -> Self {
        Self {
            config,
            opened: Mutex::new(Vec::new()),
        }
    }

    /// Most recently opened device with this name.
    pub fn device(&self, name: &str) -> Option<Arc<MockDevice>> {
        self.opened
            .lock()
            .iter()
            .rev()
            .find(|(info, _)| info.name == name)
            .map(|(_, dev)| Arc::clone(dev))
    }

    pub fn opened_count(&self) -> usize {
        self.opened.lock().len()
    }
}

impl DeviceFactory for MockDeviceFactory {
    fn open(&self, info: &DeviceInfo) -> Result<Arc<dyn HardwareDevice>> {
        let device = Arc::new(MockDevice::new(self.config));
        self.opened.lock().push((info.clone(), Arc::clone(&device)));
        Ok(device)
    }
}
