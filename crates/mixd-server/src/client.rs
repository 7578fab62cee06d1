//! Synthetic clients driving the stream protocol from the client side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;
use mixd_audio::mock::SineGenerator;
use mixd_audio::{mix, ProcessStream, StreamEvent};
use mixd_core::StreamInfo;
use tracing::{debug, warn};

#[derive(Debug, Default, Clone, Copy)]
pub struct ClientReport {
    pub played: u64,
    pub underruns: u64,
    pub recorded: u64,
    pub recorded_non_silent: u64,
}

pub struct SyntheticClients {
    stop: Arc<AtomicBool>,
    player: JoinHandle<u64>,
    recorder: JoinHandle<(u64, u64)>,
    player_stream: Arc<ProcessStream>,
}

impl SyntheticClients {
    /// Start both streams and run a writer and a reader thread.
    pub fn spawn(
        player: &Arc<ProcessStream>,
        recorder: &Arc<ProcessStream>,
        info: StreamInfo,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        for stream in [player, recorder] {
            stream.request_start()?;
            stream.start()?;
        }

        let play_buffer = player.resolve_buffer()?;
        let span_frames = play_buffer.span_frames() as usize;
        let poll = Duration::from_nanos(info.frames_to_nanos(span_frames as u64) as u64 / 4);

        let player_handle = {
            let stop = Arc::clone(&stop);
            let events = player.events();
            std::thread::Builder::new()
                .name("mixd-client-play".into())
                .spawn(move || {
                    let mut tone = SineGenerator::new(info, 440.0, 0.5);
                    let mut next = tone.generate(span_frames);
                    let mut played = 0;
                    while !stop.load(Ordering::Acquire) {
                        match play_buffer.write_span(&next) {
                            Ok(true) => {
                                played += 1;
                                next = tone.generate(span_frames);
                            }
                            Ok(false) => std::thread::sleep(poll),
                            Err(e) => {
                                warn!("Playback client: {e}");
                                break;
                            }
                        }
                        for event in events.try_iter() {
                            debug!("Playback client event: {event:?}");
                            if event == StreamEvent::EndpointLost {
                                return played;
                            }
                        }
                    }
                    played
                })?
        };

        let record_buffer = recorder.resolve_buffer()?;
        let recorder_handle = {
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("mixd-client-rec".into())
                .spawn(move || {
                    let mut span = vec![0u8; record_buffer.size_params().span_bytes()];
                    let (mut recorded, mut non_silent) = (0, 0);
                    while !stop.load(Ordering::Acquire) {
                        match record_buffer.read_span(&mut span) {
                            Ok(true) => {
                                recorded += 1;
                                if !mix::is_silent(&span, info.format) {
                                    non_silent += 1;
                                }
                            }
                            Ok(false) => std::thread::sleep(poll),
                            Err(e) => {
                                warn!("Capture client: {e}");
                                break;
                            }
                        }
                    }
                    (recorded, non_silent)
                })?
        };

        Ok(Self {
            stop,
            player: player_handle,
            recorder: recorder_handle,
            player_stream: Arc::clone(player),
        })
    }

    /// Stop both threads and collect their counts.
    pub fn finish(self) -> ClientReport {
        self.stop.store(true, Ordering::Release);
        let played = self.player.join().unwrap_or_else(|_| {
            warn!("Playback client panicked");
            0
        });
        let (recorded, recorded_non_silent) = self.recorder.join().unwrap_or_else(|_| {
            warn!("Capture client panicked");
            (0, 0)
        });
        ClientReport {
            played,
            underruns: self.player_stream.underrun_count(),
            recorded,
            recorded_non_silent,
        }
    }
}
