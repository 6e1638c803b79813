//! System microphone capture via CPAL.
//!
//! Handles device enumeration and format normalization. Whatever the
//! hardware delivers (F32/I16/U16, any channel count, any rate) leaves this
//! module as fixed-size mono f32 blocks at the device rate, pushed over a
//! bounded channel to the session loop; the loop resamples to the 16 kHz
//! capture rate. The stream handle releases the device on close or drop.

use super::dispatch::FrameDispatcher;
use crate::log_debug;
use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Audio input device wrapper.
pub struct CaptureSource {
    device: cpal::Device,
}

impl CaptureSource {
    /// List microphone names so the CLI can expose a human-friendly selector.
    pub fn list_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices().context("no input devices available")?;
        let mut names = Vec::new();
        for device in devices {
            if let Ok(name) = device.name() {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// Create a capture source, optionally forcing a specific device so users
    /// can pick the right microphone when a machine exposes multiple inputs.
    pub fn new(preferred_device: Option<&str>) -> Result<Self> {
        let host = cpal::default_host();
        let device = match preferred_device {
            Some(name) => {
                let mut devices = host.input_devices().context("no input devices available")?;
                devices
                    .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                    .ok_or_else(|| anyhow!("input device '{name}' not found"))?
            }
            None => host.default_input_device().ok_or_else(|| {
                anyhow!(
                    "no default input device available. {}",
                    mic_permission_hint()
                )
            })?,
        };
        Ok(Self { device })
    }

    /// Get the name of the active capture device.
    pub fn device_name(&self) -> String {
        self.device
            .name()
            .unwrap_or_else(|_| "Unknown Device".to_string())
    }

    /// Open a continuous capture stream delivering mono blocks sized so that,
    /// once resampled to `target_rate`, each block is `block_samples` long.
    ///
    /// The stream runs until the returned handle is closed or dropped. Blocks
    /// that the consumer cannot keep up with are dropped and counted in
    /// `dropped`, never queued.
    pub fn open_stream(
        &self,
        block_samples: usize,
        target_rate: u32,
        sender: Sender<Vec<f32>>,
        dropped: Arc<AtomicUsize>,
    ) -> Result<CaptureStream> {
        let default_config = self
            .device
            .default_input_config()
            .with_context(|| format!("no usable input config. {}", mic_permission_hint()))?;
        let format = default_config.sample_format();
        let device_config: StreamConfig = default_config.into();
        let device_rate = device_config.sample_rate.0;
        let channels = usize::from(device_config.channels.max(1));
        let device_block_samples =
            ((block_samples as u64 * u64::from(device_rate)) / u64::from(target_rate.max(1)))
                .max(1) as usize;

        log_debug(&format!(
            "capture config: format={format:?} sample_rate={device_rate}Hz channels={channels} block={device_block_samples}"
        ));

        let dispatcher = Arc::new(Mutex::new(FrameDispatcher::new(
            device_block_samples,
            sender,
            dropped.clone(),
        )));

        // The callback runs on a realtime thread; keep its error path quiet
        // and mirror issues into the log.
        let err_fn = |err| log_debug(&format!("capture_stream_error: {err}"));
        let stream = match format {
            SampleFormat::F32 => {
                let dispatcher = dispatcher.clone();
                let dropped = dropped.clone();
                self.device.build_input_stream(
                    &device_config,
                    move |data: &[f32], _| {
                        if let Ok(mut pump) = dispatcher.try_lock() {
                            pump.push(data, channels, |sample| sample);
                        } else {
                            dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    },
                    err_fn,
                    None,
                )
            }
            SampleFormat::I16 => {
                let dispatcher = dispatcher.clone();
                let dropped = dropped.clone();
                self.device.build_input_stream(
                    &device_config,
                    move |data: &[i16], _| {
                        if let Ok(mut pump) = dispatcher.try_lock() {
                            pump.push(data, channels, |sample| sample as f32 / 32_768.0);
                        } else {
                            dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    },
                    err_fn,
                    None,
                )
            }
            SampleFormat::U16 => {
                let dispatcher = dispatcher.clone();
                let dropped = dropped.clone();
                self.device.build_input_stream(
                    &device_config,
                    move |data: &[u16], _| {
                        if let Ok(mut pump) = dispatcher.try_lock() {
                            pump.push(data, channels, |sample| {
                                (sample as f32 - 32_768.0) / 32_768.0
                            });
                        } else {
                            dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    },
                    err_fn,
                    None,
                )
            }
            other => return Err(anyhow!("unsupported sample format: {other:?}")),
        }
        .with_context(|| format!("failed to open capture stream. {}", mic_permission_hint()))?;

        stream
            .play()
            .with_context(|| format!("failed to start capture stream. {}", mic_permission_hint()))?;

        Ok(CaptureStream {
            stream: Some(stream),
            device_rate,
        })
    }
}

/// Live handle to an open microphone stream; closing releases the device.
pub struct CaptureStream {
    stream: Option<cpal::Stream>,
    device_rate: u32,
}

impl CaptureStream {
    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }

    /// Stop and release the device. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(err) = stream.pause() {
                log_debug(&format!("failed to pause capture stream: {err}"));
            }
            drop(stream);
        }
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        self.close();
    }
}

fn mic_permission_hint() -> &'static str {
    #[cfg(target_os = "macos")]
    {
        "macOS: System Settings > Privacy & Security > Microphone (enable your terminal)."
    }
    #[cfg(target_os = "linux")]
    {
        "Linux: check PipeWire/PulseAudio permissions and ensure the device is not muted."
    }
    #[cfg(target_os = "windows")]
    {
        "Windows: Settings > Privacy & Security > Microphone (allow access for your terminal)."
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        "Check OS microphone permissions."
    }
}
