//! Gapless scheduling and playback of the inbound response stream.
//!
//! Response chunks arrive with network jitter but must play in order, with
//! no overlap and no avoidable gaps. The scheduler chains each chunk onto a
//! virtual clock: `start_at = max(next_start_time, now)`, then advances
//! `next_start_time` by the chunk's duration. A remote interruption
//! (barge-in) stops every active source and resets the clock to zero so the
//! next chunk starts a fresh utterance instead of continuing the stale
//! timeline.
//!
//! The scheduling core is pure (the clock is a parameter) so the jitter
//! behavior is testable without a device; [`PlaybackSink`] wires it to a
//! CPAL output stream whose rendered-sample counter defines "now".

use super::resample::resample;
use crate::log_debug;
use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Outcome of scheduling one chunk; start/duration are seconds on the
/// virtual playback clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scheduled {
    pub id: u64,
    pub start_at: f64,
    pub duration: f64,
}

struct ActiveSource {
    start_sample: u64,
    cursor: usize,
    samples: Vec<f32>,
}

/// Virtual-clock scheduler owning the set of currently playing sources.
pub struct PlaybackScheduler {
    sample_rate: u32,
    next_start_time: f64,
    next_id: u64,
    active: Vec<ActiveSource>,
    completed: u64,
}

impl PlaybackScheduler {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            next_start_time: 0.0,
            next_id: 0,
            active: Vec::new(),
            completed: 0,
        }
    }

    /// Schedule `samples` to begin at `max(next_start_time, now)` and chain
    /// the clock past it. `now` is the current playback clock in seconds.
    pub fn schedule(&mut self, samples: Vec<f32>, now: f64) -> Scheduled {
        let duration = samples.len() as f64 / self.sample_rate as f64;
        let start_at = if self.next_start_time > now {
            self.next_start_time
        } else {
            now
        };
        self.next_start_time = start_at + duration;

        let id = self.next_id;
        self.next_id += 1;
        self.active.push(ActiveSource {
            start_sample: (start_at * self.sample_rate as f64).round() as u64,
            cursor: 0,
            samples,
        });

        Scheduled {
            id,
            start_at,
            duration,
        }
    }

    /// Barge-in: stop everything and treat the next chunk as a fresh
    /// utterance at clock zero.
    pub fn interrupt(&mut self) {
        self.active.clear();
        self.next_start_time = 0.0;
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn active_sources(&self) -> usize {
        self.active.len()
    }

    pub fn completed_sources(&self) -> u64 {
        self.completed
    }

    /// Fill `out` with the window starting at absolute sample
    /// `window_start`, advancing cursors and retiring finished sources.
    pub(crate) fn render(&mut self, window_start: u64, out: &mut [f32]) {
        out.fill(0.0);
        let window_end = window_start + out.len() as u64;
        let mut finished = 0u64;
        self.active.retain_mut(|src| {
            if src.start_sample >= window_end {
                return true;
            }
            let mut pos = src.start_sample + src.cursor as u64;
            if pos < window_start {
                // Late relative to the clock; skip ahead to stay time-aligned.
                let skip = (window_start - pos) as usize;
                src.cursor = (src.cursor + skip).min(src.samples.len());
                pos = src.start_sample + src.cursor as u64;
            }
            while pos < window_end && src.cursor < src.samples.len() {
                out[(pos - window_start) as usize] += src.samples[src.cursor];
                src.cursor += 1;
                pos += 1;
            }
            if src.cursor >= src.samples.len() {
                finished += 1;
                false
            } else {
                true
            }
        });
        self.completed += finished;
    }
}

struct PlaybackShared {
    scheduler: Mutex<PlaybackScheduler>,
    clock_samples: AtomicU64,
    contended: AtomicUsize,
}

/// CPAL output sink rendering the scheduled stream.
///
/// Decoded frames arrive at the remote's rate (24 kHz) and are resampled to
/// the device rate at enqueue time; durations on the virtual clock are the
/// same either way. The output callback advances the clock even while it
/// renders silence, mirroring how a wall-clock audio context behaves.
pub struct PlaybackSink {
    stream: Option<cpal::Stream>,
    shared: Arc<PlaybackShared>,
    source_rate: u32,
    device_rate: u32,
}

impl PlaybackSink {
    /// Open the default output device for frames produced at `source_rate`.
    pub fn open(source_rate: u32) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| anyhow!("no default output device available"))?;
        let default_config = device
            .default_output_config()
            .context("no usable output config")?;
        let format = default_config.sample_format();
        let device_config: StreamConfig = default_config.into();
        let device_rate = device_config.sample_rate.0;
        let channels = usize::from(device_config.channels.max(1));

        log_debug(&format!(
            "playback config: format={format:?} sample_rate={device_rate}Hz channels={channels}"
        ));

        let shared = Arc::new(PlaybackShared {
            scheduler: Mutex::new(PlaybackScheduler::new(device_rate)),
            clock_samples: AtomicU64::new(0),
            contended: AtomicUsize::new(0),
        });

        let err_fn = |err| log_debug(&format!("playback_stream_error: {err}"));
        let stream = match format {
            SampleFormat::F32 => {
                let shared = shared.clone();
                let mut mono: Vec<f32> = Vec::new();
                device.build_output_stream(
                    &device_config,
                    move |data: &mut [f32], _| {
                        render_window(&shared, data.len() / channels, &mut mono);
                        for (frame, &sample) in data.chunks_mut(channels).zip(&mono) {
                            frame.fill(sample);
                        }
                    },
                    err_fn,
                    None,
                )
            }
            SampleFormat::I16 => {
                let shared = shared.clone();
                let mut mono: Vec<f32> = Vec::new();
                device.build_output_stream(
                    &device_config,
                    move |data: &mut [i16], _| {
                        render_window(&shared, data.len() / channels, &mut mono);
                        for (frame, &sample) in data.chunks_mut(channels).zip(&mono) {
                            frame.fill((sample.clamp(-1.0, 1.0) * 32_767.0) as i16);
                        }
                    },
                    err_fn,
                    None,
                )
            }
            SampleFormat::U16 => {
                let shared = shared.clone();
                let mut mono: Vec<f32> = Vec::new();
                device.build_output_stream(
                    &device_config,
                    move |data: &mut [u16], _| {
                        render_window(&shared, data.len() / channels, &mut mono);
                        for (frame, &sample) in data.chunks_mut(channels).zip(&mono) {
                            let scaled = (sample.clamp(-1.0, 1.0) + 1.0) * 32_767.5;
                            frame.fill(scaled as u16);
                        }
                    },
                    err_fn,
                    None,
                )
            }
            other => return Err(anyhow!("unsupported output sample format: {other:?}")),
        }
        .context("failed to open playback stream")?;

        stream.play().context("failed to start playback stream")?;

        Ok(Self {
            stream: Some(stream),
            shared,
            source_rate: source_rate.max(1),
            device_rate,
        })
    }

    /// Current playback clock in seconds.
    pub fn now_seconds(&self) -> f64 {
        self.shared.clock_samples.load(Ordering::Acquire) as f64 / self.device_rate as f64
    }

    /// Schedule a decoded frame for gapless playback.
    pub fn enqueue(&self, frame: Vec<f32>) -> Scheduled {
        let samples = if self.source_rate == self.device_rate {
            frame
        } else {
            resample(&frame, self.source_rate, self.device_rate)
        };
        let now = self.now_seconds();
        let mut scheduler = self
            .shared
            .scheduler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        scheduler.schedule(samples, now)
    }

    /// Flush every pending source and reset the virtual clock.
    pub fn interrupt(&self) {
        let mut scheduler = self
            .shared
            .scheduler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        scheduler.interrupt();
    }

    pub fn active_sources(&self) -> usize {
        self.shared
            .scheduler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .active_sources()
    }

    pub fn completed_sources(&self) -> u64 {
        self.shared
            .scheduler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .completed_sources()
    }

    pub fn contended_callbacks(&self) -> usize {
        self.shared.contended.load(Ordering::Relaxed)
    }

    /// Stop and release the output device. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(err) = stream.pause() {
                log_debug(&format!("failed to pause playback stream: {err}"));
            }
            drop(stream);
        }
    }
}

impl Drop for PlaybackSink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Advance the clock by one callback window and render it; on lock
/// contention the window plays silence but the clock still moves.
fn render_window(shared: &PlaybackShared, frames: usize, mono: &mut Vec<f32>) {
    mono.clear();
    mono.resize(frames, 0.0);
    let start = shared
        .clock_samples
        .fetch_add(frames as u64, Ordering::AcqRel);
    if let Ok(mut scheduler) = shared.scheduler.try_lock() {
        scheduler.render(start, mono);
    } else {
        shared.contended.fetch_add(1, Ordering::Relaxed);
    }
}
