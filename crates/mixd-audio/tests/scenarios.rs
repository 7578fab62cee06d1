//! End-to-end scenarios over mock devices.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::sync::Arc;
use std::time::{Duration, Instant};

use mixd_audio::mock::{MockDeviceConfig, MockDeviceFactory, SineGenerator};
use mixd_audio::{AudioService, DeviceFactory, ProcessStream, StreamEvent};
use mixd_core::{
    DeviceInfo, DeviceRole, DeviceType, EndpointStatus, EngineConfig, ProcessConfig, StreamInfo,
    StreamStatus,
};

const GRACE_MS: u64 = 150;
/// 960 frames at 48kHz.
const SPAN_MS: u64 = 20;

fn spk0() -> DeviceInfo {
    DeviceInfo::local(
        0,
        DeviceType::Speaker,
        DeviceRole::Output,
        "spk0",
        StreamInfo::new(48000, 2, mixd_core::SampleFormat::S16Le),
    )
}

fn mic0() -> DeviceInfo {
    DeviceInfo::local(
        1,
        DeviceType::Microphone,
        DeviceRole::Input,
        "mic0",
        StreamInfo::default(),
    )
}

fn service_with(devices: &[DeviceInfo]) -> (Arc<AudioService>, Arc<MockDeviceFactory>) {
    let factory = Arc::new(MockDeviceFactory::new(MockDeviceConfig {
        span_frames: 960,
        span_count: 4,
    }));
    let config = EngineConfig {
        release_grace_period_ms: GRACE_MS,
        ..EngineConfig::default()
    };
    let service = AudioService::new(config, Arc::clone(&factory) as Arc<dyn DeviceFactory>);
    for device in devices {
        service.register_device(device.clone()).unwrap();
    }
    (service, factory)
}

fn poll_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    check()
}

fn start(stream: &ProcessStream) {
    stream.request_start().unwrap();
    stream.start().unwrap();
    assert_eq!(stream.status(), StreamStatus::Running);
}

/// Keep the stream's buffer full with spans from `next_span`.
fn feed(
    stream: &ProcessStream,
    mut next_span: impl FnMut() -> Vec<u8>,
    pending: &mut Option<Vec<u8>>,
) {
    let buffer = stream.resolve_buffer().unwrap();
    loop {
        let span = pending.take().unwrap_or_else(&mut next_span);
        if !buffer.write_span(&span).unwrap() {
            *pending = Some(span);
            return;
        }
    }
}

#[test]
fn running_stream_reaches_device_then_endpoint_is_collected() {
    let (service, factory) = service_with(&[spk0()]);
    let key = spk0().key();

    let a = service
        .acquire_stream(&ProcessConfig::playback(spk0().stream_info))
        .unwrap();
    start(&a);
    let endpoint = service.endpoint(&key).unwrap();
    assert_eq!(endpoint.status(), EndpointStatus::Running);

    let device = factory.device("spk0").unwrap();
    let mut tone = SineGenerator::new(spk0().stream_info, 440.0, 0.5);
    let mut pending = None;
    feed(&a, || tone.generate(960), &mut pending);
    // Audible within two spans of the first write, plus scheduling slack.
    let rendered = poll_until(Duration::from_millis(2 * SPAN_MS + 60), || {
        feed(&a, || tone.generate(960), &mut pending);
        device.non_silent_spans() > 0
    });
    assert!(rendered, "{}", service.dump());
    assert!(endpoint.stats().loops > 0);

    a.release().unwrap();
    assert!(service.is_release_pending(&key));
    // Not collected before the grace period ends.
    assert!(service.endpoint(&key).is_some());

    let collected = poll_until(Duration::from_millis(GRACE_MS * 10), || {
        service.endpoint(&key).is_none() && endpoint.status() == EndpointStatus::Unlinked
    });
    assert!(collected, "{}", endpoint.dump());
    assert_eq!(endpoint.status(), EndpointStatus::Unlinked);
    assert!(!endpoint.is_released());
    assert!(!device.is_running());
}

#[test]
fn silence_plus_waveform_is_the_waveform() {
    let (service, factory) = service_with(&[spk0()]);
    let config = ProcessConfig::playback(spk0().stream_info);
    let quiet = service.acquire_stream(&config).unwrap();
    let loud = service.acquire_stream(&config).unwrap();
    start(&quiet);
    start(&loud);

    let device = factory.device("spk0").unwrap();
    let mut tone = SineGenerator::new(spk0().stream_info, 1000.0, 0.25);
    let mut written = Vec::new();
    let (mut quiet_pending, mut loud_pending) = (None, None);

    let matched = poll_until(Duration::from_secs(3), || {
        feed(&quiet, || vec![0u8; 960 * 4], &mut quiet_pending);
        feed(
            &loud,
            || {
                let span = tone.generate(960);
                written.push(span.clone());
                span
            },
            &mut loud_pending,
        );
        device
            .rendered_history()
            .iter()
            .any(|span| !span.iter().all(|&b| b == 0) && written.contains(span))
    });
    assert!(matched, "{}", service.dump());
}

#[test]
fn linking_state_transitions() {
    let (service, _factory) = service_with(&[spk0()]);
    let config = ProcessConfig::playback(spk0().stream_info);

    let a = service.acquire_stream(&config).unwrap();
    let endpoint = service.endpoint(&spk0().key()).unwrap();
    assert_eq!(endpoint.status(), EndpointStatus::Idle);

    start(&a);
    assert_eq!(endpoint.status(), EndpointStatus::Running);

    a.pause().unwrap();
    assert_eq!(endpoint.status(), EndpointStatus::Idle);

    a.resume().unwrap();
    assert_eq!(endpoint.status(), EndpointStatus::Running);

    a.stop().unwrap();
    assert_eq!(endpoint.status(), EndpointStatus::Idle);
    assert_eq!(endpoint.linked_count(), 1);
}

#[test]
fn double_release_is_a_no_op() {
    let (service, _factory) = service_with(&[spk0()]);
    let a = service
        .acquire_stream(&ProcessConfig::playback(spk0().stream_info))
        .unwrap();
    let events = a.events();

    a.release().unwrap();
    a.release().unwrap();
    a.notify_client_died();

    assert_eq!(service.stream_count(), 0);
    let released = events
        .try_iter()
        .filter(|e| *e == StreamEvent::Released)
        .count();
    assert_eq!(released, 1);
    assert!(a.start().unwrap_err().is_illegal_state());
}

#[test]
fn capture_fans_out_to_every_running_stream() {
    let (service, factory) = service_with(&[mic0()]);
    let config = ProcessConfig::capture(mic0().stream_info);
    let a = service.acquire_stream(&config).unwrap();
    let b = service.acquire_stream(&config).unwrap();

    let device = factory.device("mic0").unwrap();
    device.set_capture_tone(440.0, 0.5);
    start(&a);
    start(&b);

    let mut span = vec![0u8; 960 * 4];
    let mut heard = [false, false];
    let done = poll_until(Duration::from_secs(3), || {
        for (i, stream) in [&a, &b].into_iter().enumerate() {
            let buffer = stream.resolve_buffer().unwrap();
            while buffer.read_span(&mut span).unwrap() {
                if span.iter().any(|&s| s != 0) {
                    heard[i] = true;
                }
            }
        }
        heard == [true, true]
    });
    assert!(done, "{}", service.dump());
    assert!(device.captured_spans() > 0);
}

#[test]
fn slow_capture_client_overflows() {
    let (service, _factory) = service_with(&[mic0()]);
    let a = service
        .acquire_stream(&ProcessConfig::capture(mic0().stream_info))
        .unwrap();
    start(&a);

    let endpoint = service.endpoint(&mic0().key()).unwrap();
    // Nobody drains the stream, so it fills up after four spans.
    let overflowed = poll_until(Duration::from_secs(3), || endpoint.stats().overflows > 0);
    assert!(overflowed);
    assert_eq!(a.resolve_buffer().unwrap().available_frames(), 3840);
}

#[test]
fn device_failure_reports_endpoint_lost() {
    let (service, factory) = service_with(&[spk0()]);
    let a = service
        .acquire_stream(&ProcessConfig::playback(spk0().stream_info))
        .unwrap();
    let events = a.events();
    start(&a);

    let endpoint = service.endpoint(&spk0().key()).unwrap();
    factory.device("spk0").unwrap().set_fail_render(true);

    let stopped = poll_until(Duration::from_secs(2), || {
        endpoint.status() == EndpointStatus::Stopped
    });
    assert!(stopped);
    assert!(events.try_iter().any(|e| e == StreamEvent::EndpointLost));
}

#[test]
fn independent_stream_writes_the_device_buffer() {
    let mut spk1 = spk0();
    spk1.name = "spk1".into();
    spk1.independent_capable = true;
    let (service, factory) = service_with(&[spk1.clone()]);

    let a = service
        .acquire_stream(&ProcessConfig::playback(spk1.stream_info))
        .unwrap();
    assert_eq!(service.endpoint_count(), 1);
    assert!(service.endpoint(&spk1.key()).is_none());
    start(&a);

    let device = factory.device("spk1").unwrap();
    let mut tone = SineGenerator::new(spk1.stream_info, 440.0, 0.5);
    let mut pending = None;
    let rendered = poll_until(Duration::from_secs(2), || {
        feed(&a, || tone.generate(960), &mut pending);
        device.non_silent_spans() > 0
    });
    assert!(rendered, "{}", service.dump());

    // A second stream gets its own endpoint and device.
    let b = service
        .acquire_stream(&ProcessConfig::playback(spk1.stream_info))
        .unwrap();
    assert_eq!(service.endpoint_count(), 2);
    assert_eq!(factory.opened_count(), 2);
    b.release().unwrap();
}
