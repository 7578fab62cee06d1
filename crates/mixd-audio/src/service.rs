//! Audio service: routes client streams to endpoints and owns their lifetime.
//!
//! Shared endpoints are keyed by device and reused by every stream routed to
//! the same device. When the last stream of an endpoint goes away the endpoint
//! is kept for a grace period so short-lived clients don't thrash the
//! hardware; a new link within that period cancels the release. Once it
//! expires the device is stopped and the endpoint leaves the registry.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, warn};

use mixd_core::{
    DeviceInfo, EndpointType, EngineConfig, Error, ProcessConfig, Result, StreamDirection,
};

use crate::device::DeviceFactory;
use crate::endpoint::AudioEndpoint;
use crate::process::{ProcessReleaseCallback, ProcessStream};
use crate::stream_manager::{NormalStreamHandle, StreamManager};

type StreamPair = (Arc<ProcessStream>, Arc<AudioEndpoint>);

/// Endpoint keys waiting out their grace period.
#[derive(Default)]
struct PendingReleases {
    keys: Mutex<HashSet<String>>,
    cv: Condvar,
}

impl PendingReleases {
    fn cancel(&self, key: &str) -> bool {
        let cancelled = self.keys.lock().remove(key);
        if cancelled {
            self.cv.notify_all();
        }
        cancelled
    }

    fn contains(&self, key: &str) -> bool {
        self.keys.lock().contains(key)
    }
}

pub struct AudioService {
    self_weak: Weak<AudioService>,
    config: EngineConfig,
    factory: Arc<dyn DeviceFactory>,
    stream_manager: Option<Arc<dyn StreamManager>>,
    devices: RwLock<Vec<DeviceInfo>>,
    endpoints: Mutex<HashMap<String, Arc<AudioEndpoint>>>,
    streams: Mutex<HashMap<u32, StreamPair>>,
    normal_streams: Mutex<HashMap<u32, NormalStreamHandle>>,
    pending: Arc<PendingReleases>,
    release_threads: Mutex<Vec<JoinHandle<()>>>,
    next_session: AtomicU32,
    independent_seq: AtomicU32,
    shutting_down: AtomicBool,
}

impl AudioService {
    pub fn new(config: EngineConfig, factory: Arc<dyn DeviceFactory>) -> Arc<Self> {
        Self::build(config, factory, None)
    }

    pub fn with_stream_manager(
        config: EngineConfig,
        factory: Arc<dyn DeviceFactory>,
        stream_manager: Arc<dyn StreamManager>,
    ) -> Arc<Self> {
        Self::build(config, factory, Some(stream_manager))
    }

    fn build(
        config: EngineConfig,
        factory: Arc<dyn DeviceFactory>,
        stream_manager: Option<Arc<dyn StreamManager>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            self_weak: self_weak.clone(),
            config,
            factory,
            stream_manager,
            devices: RwLock::new(Vec::new()),
            endpoints: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            normal_streams: Mutex::new(HashMap::new()),
            pending: Arc::new(PendingReleases::default()),
            release_threads: Mutex::new(Vec::new()),
            next_session: AtomicU32::new(0),
            independent_seq: AtomicU32::new(0),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Make a device available for routing. A device with the same key is replaced.
    pub fn register_device(&self, info: DeviceInfo) -> Result<()> {
        info.stream_info.validate()?;
        let key = info.key();
        let mut devices = self.devices.write();
        devices.retain(|d| d.key() != key);
        info!("Registered device {key} ({})", info.stream_info);
        devices.push(info);
        Ok(())
    }

    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.devices.read().clone()
    }

    /// First registered device serving the stream's direction.
    pub fn resolve_device(&self, config: &ProcessConfig) -> Result<DeviceInfo> {
        let role = config.direction.device_role();
        self.devices
            .read()
            .iter()
            .find(|d| d.role == role)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound(format!("no {role:?} device registered")))
    }

    /// Shared devices reuse the endpoint registered under their key; devices
    /// that hand out one endpoint per stream always get a fresh one.
    pub fn get_or_create_endpoint(&self, device: &DeviceInfo) -> Result<Arc<AudioEndpoint>> {
        let endpoint_type = device.preferred_endpoint_type();
        let mut endpoints = self.endpoints.lock();

        let key = match endpoint_type {
            EndpointType::Shared => {
                let key = device.key();
                if let Some(endpoint) = endpoints.get(&key) {
                    if self.pending.cancel(&key) {
                        info!("Endpoint {key} reused, pending release cancelled");
                    }
                    return Ok(Arc::clone(endpoint));
                }
                key
            }
            EndpointType::Independent => {
                let seq = self.independent_seq.fetch_add(1, Ordering::Relaxed) + 1;
                format!("{}_{seq}", device.key())
            }
        };

        let hardware = self.factory.open(device)?;
        let endpoint = AudioEndpoint::create(
            endpoint_type,
            key.clone(),
            device.clone(),
            hardware,
            self.config.clone(),
        )?;
        endpoints.insert(key, Arc::clone(&endpoint));
        Ok(endpoint)
    }

    /// Route a low-latency stream to its device and link it.
    pub fn acquire_stream(&self, config: &ProcessConfig) -> Result<Arc<ProcessStream>> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::illegal_state("service is shutting down"));
        }
        config.stream_info.validate()?;
        let device = self.resolve_device(config)?;
        let endpoint = self.get_or_create_endpoint(&device)?;

        let session_id = self.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        let stream = ProcessStream::new(session_id, config.clone());
        let prefer = endpoint.prefer_buffer_info();
        let external = (endpoint.endpoint_type() == EndpointType::Independent)
            .then(|| endpoint.device_buffer_descriptor());

        let linked = stream
            .configure_buffer(prefer.total_frames, prefer.span_frames, external.as_ref())
            .and_then(|_| endpoint.link_stream(&stream));
        if let Err(e) = linked {
            warn!(
                "Stream {session_id} could not link to {}: {e}",
                endpoint.key()
            );
            if endpoint.linked_count() == 0 {
                self.schedule_delayed_release(endpoint.key());
            }
            return Err(e);
        }

        self.streams
            .lock()
            .insert(session_id, (Arc::clone(&stream), Arc::clone(&endpoint)));
        let callback: Weak<dyn ProcessReleaseCallback> = self.self_weak.clone();
        stream.set_release_callback(callback);
        info!(
            "Stream {session_id} (pid {}) acquired on {}",
            config.client_pid,
            endpoint.key()
        );
        Ok(stream)
    }

    /// Unlink a released stream; an endpoint left without streams is stopped
    /// and dropped from the registry after the grace period.
    pub fn on_stream_released(&self, session_id: u32) {
        let Some((stream, endpoint)) = self.streams.lock().remove(&session_id) else {
            debug!("Stream {session_id} has no endpoint pair");
            return;
        };
        if let Err(e) = endpoint.unlink_stream(&stream) {
            warn!("Unlink of stream {session_id} failed: {e}");
        }
        if endpoint.linked_count() == 0 && !endpoint.is_released() {
            self.schedule_delayed_release(endpoint.key());
        }
    }

    fn schedule_delayed_release(&self, key: &str) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        if !self.pending.keys.lock().insert(key.to_string()) {
            debug!("Endpoint {key} release already pending");
            return;
        }

        let grace = self.config.release_grace_period();
        info!("Endpoint {key} unused, releasing in {}ms", grace.as_millis());
        let pending = Arc::clone(&self.pending);
        let service = self.self_weak.clone();
        let thread_key = key.to_string();

        let spawned = std::thread::Builder::new()
            .name("mixd-release".to_string())
            .spawn(move || {
                let deadline = Instant::now() + grace;
                {
                    let mut keys = pending.keys.lock();
                    while keys.contains(&thread_key) {
                        if pending.cv.wait_until(&mut keys, deadline).timed_out() {
                            break;
                        }
                    }
                    if !keys.contains(&thread_key) {
                        debug!("Delayed release of {thread_key} cancelled");
                        return;
                    }
                }
                if let Some(service) = service.upgrade() {
                    service.finish_delayed_release(&thread_key);
                }
            });

        match spawned {
            Ok(handle) => {
                let mut threads = self.release_threads.lock();
                threads.retain(|t| !t.is_finished());
                threads.push(handle);
            }
            Err(e) => {
                warn!("Could not spawn release thread for {key}: {e}");
                self.pending.cancel(key);
            }
        }
    }

    fn finish_delayed_release(&self, key: &str) {
        let endpoint = {
            let mut endpoints = self.endpoints.lock();
            if !self.pending.keys.lock().remove(key) {
                return;
            }
            match endpoints.get(key) {
                Some(endpoint) if endpoint.linked_count() == 0 => endpoints.remove(key),
                Some(_) => {
                    debug!("Endpoint {key} linked again, kept");
                    None
                }
                None => None,
            }
        };
        if let Some(endpoint) = endpoint {
            info!("Endpoint {key} grace period over, stopping");
            match endpoint.stop_unlinked() {
                Ok(true) => {}
                Ok(false) => debug!("Endpoint {key} was linked again while leaving the registry"),
                Err(e) => warn!("Endpoint {key} stop after grace period: {e}"),
            }
        }
    }

    pub fn is_release_pending(&self, key: &str) -> bool {
        self.pending.contains(key)
    }

    pub fn endpoint(&self, key: &str) -> Option<Arc<AudioEndpoint>> {
        self.endpoints.lock().get(key).cloned()
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.lock().len()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.lock().len()
    }

    /// Hand a stream that doesn't need the mmap path to the stream manager.
    pub fn create_normal_stream(&self, config: &ProcessConfig) -> Result<NormalStreamHandle> {
        let manager = self
            .stream_manager
            .as_ref()
            .ok_or_else(|| Error::operation_failed("no stream manager configured"))?;
        let handle = match config.direction {
            StreamDirection::Playback => manager.create_renderer(config)?,
            StreamDirection::Capture => manager.create_capturer(config)?,
        };
        self.normal_streams.lock().insert(handle.id, handle.clone());
        Ok(handle)
    }

    pub fn release_normal_stream(&self, handle: &NormalStreamHandle) -> Result<()> {
        let manager = self
            .stream_manager
            .as_ref()
            .ok_or_else(|| Error::operation_failed("no stream manager configured"))?;
        self.normal_streams.lock().remove(&handle.id);
        manager.release(handle)
    }

    /// Cancel pending releases and release every endpoint. Idempotent.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Audio service shutting down");

        {
            let mut keys = self.pending.keys.lock();
            keys.clear();
            self.pending.cv.notify_all();
        }
        let threads = std::mem::take(&mut *self.release_threads.lock());
        let current = std::thread::current().id();
        for handle in threads {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("Release thread panicked");
            }
        }

        self.streams.lock().clear();
        let endpoints: Vec<_> = self.endpoints.lock().drain().map(|(_, ep)| ep).collect();
        for endpoint in endpoints {
            endpoint.release();
        }

        let normal: Vec<_> = self.normal_streams.lock().drain().map(|(_, h)| h).collect();
        if let Some(manager) = &self.stream_manager {
            for handle in normal {
                if let Err(e) = manager.release(&handle) {
                    warn!("Release of normal stream {} failed: {e}", handle.id);
                }
            }
        }
        info!("Audio service stopped");
    }

    /// Diagnostic text for every endpoint and stream.
    pub fn dump(&self) -> String {
        let mut endpoints: Vec<_> = self.endpoints.lock().values().cloned().collect();
        endpoints.sort_by(|a, b| a.key().cmp(b.key()));
        let mut pairs: Vec<_> = self
            .streams
            .lock()
            .iter()
            .map(|(id, (stream, endpoint))| (*id, stream.status(), endpoint.key().to_string()))
            .collect();
        pairs.sort_by_key(|(id, _, _)| *id);

        let mut out = String::new();
        let _ = writeln!(
            out,
            "Audio service: {} endpoint(s), {} stream(s), {} pending release(s)",
            endpoints.len(),
            pairs.len(),
            self.pending.keys.lock().len()
        );
        for endpoint in &endpoints {
            out.push_str(&endpoint.dump());
        }
        for (id, status, key) in pairs {
            let _ = writeln!(out, "Stream {id} [{status}] -> {key}");
        }
        let normal = self.normal_streams.lock().len();
        if normal > 0 {
            let _ = writeln!(out, "{normal} normal stream(s)");
        }
        out
    }
}

impl ProcessReleaseCallback for AudioService {
    fn on_process_release(&self, stream: &ProcessStream) {
        self.on_stream_released(stream.session_id());
    }
}

impl Drop for AudioService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

    use super::*;
    use crate::mock::{MockDeviceConfig, MockDeviceFactory};
    use crate::stream_manager::InMemoryStreamManager;
    use mixd_core::{DeviceRole, DeviceType, EndpointStatus, StreamInfo};
    use std::time::Duration;

    fn service(grace_ms: u64) -> (Arc<AudioService>, Arc<MockDeviceFactory>) {
        let factory = Arc::new(MockDeviceFactory::new(MockDeviceConfig::default()));
        let config = EngineConfig {
            release_grace_period_ms: grace_ms,
            ..EngineConfig::default()
        };
        let service = AudioService::new(config, Arc::clone(&factory) as Arc<dyn DeviceFactory>);
        service
            .register_device(DeviceInfo::local(
                0,
                DeviceType::Speaker,
                DeviceRole::Output,
                "spk0",
                StreamInfo::default(),
            ))
            .unwrap();
        (service, factory)
    }

    fn playback() -> ProcessConfig {
        ProcessConfig::playback(StreamInfo::default())
    }

    #[test]
    fn test_shared_endpoint_is_reused() {
        let (service, factory) = service(30_000);
        let a = service.acquire_stream(&playback()).unwrap();
        let b = service.acquire_stream(&playback()).unwrap();

        assert_ne!(a.session_id(), b.session_id());
        assert_eq!(service.endpoint_count(), 1);
        assert_eq!(service.stream_count(), 2);
        assert_eq!(factory.opened_count(), 1);

        let key = service.devices()[0].key();
        let endpoint = service.endpoint(&key).unwrap();
        assert_eq!(endpoint.linked_count(), 2);
        assert_eq!(endpoint.status(), EndpointStatus::Idle);
    }

    #[test]
    fn test_missing_device() {
        let (service, _factory) = service(30_000);
        let err = service
            .acquire_stream(&ProcessConfig::capture(StreamInfo::default()))
            .unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound(_)));
    }

    #[test]
    fn test_independent_endpoints_get_unique_keys() {
        let (service, factory) = service(30_000);
        let mut mic = DeviceInfo::local(
            1,
            DeviceType::Microphone,
            DeviceRole::Input,
            "mic0",
            StreamInfo::default(),
        );
        mic.independent_capable = true;
        service.register_device(mic).unwrap();

        let capture = ProcessConfig::capture(StreamInfo::default());
        let a = service.acquire_stream(&capture).unwrap();
        let b = service.acquire_stream(&capture).unwrap();
        assert_eq!(service.endpoint_count(), 2);
        assert_eq!(factory.opened_count(), 2);
        assert!(!a
            .resolve_buffer()
            .unwrap()
            .same_region(&b.resolve_buffer().unwrap()));
    }

    #[test]
    fn test_release_is_delayed_and_cancellable() {
        let (service, _factory) = service(200);
        let key = service.devices()[0].key();

        let a = service.acquire_stream(&playback()).unwrap();
        a.release().unwrap();
        assert!(service.is_release_pending(&key));
        assert_eq!(service.endpoint_count(), 1);

        // A new stream inside the grace period keeps the endpoint.
        let b = service.acquire_stream(&playback()).unwrap();
        assert!(!service.is_release_pending(&key));
        std::thread::sleep(Duration::from_millis(350));
        assert_eq!(service.endpoint_count(), 1);
        assert_eq!(service.endpoint(&key).unwrap().linked_count(), 1);

        b.release().unwrap();
        std::thread::sleep(Duration::from_millis(500));
        assert_eq!(service.endpoint_count(), 0);
        assert!(!service.is_release_pending(&key));
    }

    #[test]
    fn test_client_death_releases_stream() {
        let (service, _factory) = service(30_000);
        let a = service.acquire_stream(&playback()).unwrap();
        a.notify_client_died();
        a.notify_client_died();
        assert!(a.is_released());
        assert_eq!(service.stream_count(), 0);
    }

    #[test]
    fn test_normal_streams() {
        let (service, _factory) = service(30_000);
        assert!(service.create_normal_stream(&playback()).is_err());

        let manager = Arc::new(InMemoryStreamManager::new());
        let factory = Arc::new(MockDeviceFactory::default());
        let service = AudioService::with_stream_manager(
            EngineConfig::default(),
            factory,
            Arc::clone(&manager) as Arc<dyn StreamManager>,
        );
        let handle = service.create_normal_stream(&playback()).unwrap();
        assert_eq!(manager.active_count(), 1);
        service.release_normal_stream(&handle).unwrap();
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let (service, _factory) = service(30_000);
        let a = service.acquire_stream(&playback()).unwrap();
        let key = service.devices()[0].key();
        let endpoint = service.endpoint(&key).unwrap();

        service.shutdown();
        service.shutdown();
        assert_eq!(service.endpoint_count(), 0);
        assert!(endpoint.is_released());
        assert_eq!(endpoint.status(), EndpointStatus::Invalid);
        assert!(service.acquire_stream(&playback()).unwrap_err().is_illegal_state());

        // Releasing after shutdown is still a no-op for the service.
        a.release().unwrap();
    }

    #[test]
    fn test_dump() {
        let (service, _factory) = service(30_000);
        let a = service.acquire_stream(&playback()).unwrap();
        let dump = service.dump();
        assert!(dump.contains("1 endpoint(s), 1 stream(s)"));
        assert!(dump.contains(&format!("Stream {}", a.session_id())));
    }
}
