//! Microphone capture pipeline.
//!
//! Runs on a dedicated thread since cpal streams are `!Send`. The thread
//! owns the capture device for as long as the pipeline is running and
//! releases it on every exit path, including acquisition failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use log::{error, info};
use tokio::sync::mpsc;

use crate::audio::pcm::encode_pcm16;
use crate::audio::volume::VolumeMeter;
use crate::error::LiveError;

/// Sample rate of outbound chunks (what the service accepts).
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Chunk size in samples: 128 ms at 16 kHz.
pub const CHUNK_SAMPLES: usize = 2048;

/// Emitted by the capture thread, one pair per full chunk.
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    /// Base64-encoded PCM16 mono chunk at 16 kHz.
    Chunk(String),
    /// Smoothed volume of the chunk that was just encoded.
    Volume(f32),
}

/// Handle to a running capture pipeline. `stop()` (or drop) signals the
/// thread, joins it and releases the device.
pub struct AudioCapture {
    stop_signal: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    meter: Arc<Mutex<VolumeMeter>>,
}

impl AudioCapture {
    /// Acquires the default input device and starts producing chunks.
    /// Device acquisition happens on the capture thread; its outcome is
    /// reported back before this function returns, so a failure surfaces
    /// here with nothing left running.
    pub fn start() -> Result<(Self, mpsc::UnboundedReceiver<CaptureEvent>), LiveError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), String>>();
        let stop_signal = Arc::new(AtomicBool::new(false));
        let meter = Arc::new(Mutex::new(VolumeMeter::new()));

        let stop_signal_clone = stop_signal.clone();
        let meter_clone = meter.clone();
        let thread = std::thread::spawn(move || {
            run_capture(tx, stop_signal_clone, meter_clone, ready_tx);
        });

        match ready_rx.recv() {
            Ok(Ok(())) => Ok((
                Self {
                    stop_signal,
                    thread: Some(thread),
                    meter,
                },
                rx,
            )),
            Ok(Err(message)) => {
                let _ = thread.join();
                Err(LiveError::Device(message))
            }
            Err(_) => {
                let _ = thread.join();
                Err(LiveError::Device("capture thread exited early".to_string()))
            }
        }
    }

    /// Stops capture and releases the device. No-op when already stopped.
    pub fn stop(&mut self) {
        self.stop_signal.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Meter fed by the capture thread; usable with a volume ticker.
    pub fn meter(&self) -> Arc<Mutex<VolumeMeter>> {
        self.meter.clone()
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_capture(
    tx: mpsc::UnboundedSender<CaptureEvent>,
    stop_signal: Arc<AtomicBool>,
    meter: Arc<Mutex<VolumeMeter>>,
    ready_tx: std::sync::mpsc::Sender<Result<(), String>>,
) {
    let setup = match open_input_stream() {
        Ok(setup) => setup,
        Err(message) => {
            let _ = ready_tx.send(Err(message));
            return;
        }
    };
    let (stream, sample_buffer, capture_rate) = setup;
    let _ = ready_tx.send(Ok(()));

    // Samples needed at the device rate to produce one 16 kHz chunk
    let ratio = capture_rate as f32 / CAPTURE_SAMPLE_RATE as f32;
    let input_needed = if capture_rate == CAPTURE_SAMPLE_RATE {
        CHUNK_SAMPLES
    } else {
        (CHUNK_SAMPLES as f32 * ratio).ceil() as usize
    };

    while !stop_signal.load(Ordering::Relaxed) {
        let raw_chunk: Option<Vec<f32>> = {
            let mut buffer = sample_buffer.lock().unwrap();
            if buffer.len() >= input_needed {
                Some(buffer.drain(..input_needed).collect())
            } else {
                None
            }
        };

        if let Some(raw) = raw_chunk {
            let samples = if capture_rate == CAPTURE_SAMPLE_RATE {
                raw
            } else {
                resample_nearest(&raw, CHUNK_SAMPLES)
            };

            let volume = meter.lock().unwrap().process(&samples);
            if tx.send(CaptureEvent::Volume(volume)).is_err() {
                break;
            }

            let encoded = BASE64.encode(encode_pcm16(&samples));
            if tx.send(CaptureEvent::Chunk(encoded)).is_err() {
                break;
            }
        } else {
            // 1ms sleep keeps chunk latency low without burning CPU
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    drop(stream);
    info!("Audio capture stopped");
}

type InputSetup = (cpal::Stream, Arc<Mutex<Vec<f32>>>, u32);

fn open_input_stream() -> Result<InputSetup, String> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| "No audio input device found".to_string())?;

    info!("Capture input device: {}", device.name().unwrap_or_default());

    let supported = device
        .supported_input_configs()
        .map_err(|e| format!("Audio device error: {e}"))?;

    // Prefer mono at the target rate; accept stereo (downmixed) or the
    // nearest rate the hardware offers.
    let mut best_config = None;
    for cfg in supported {
        if cfg.channels() > 2 {
            continue;
        }
        let rate_ok = cfg.min_sample_rate().0 <= CAPTURE_SAMPLE_RATE
            && cfg.max_sample_rate().0 >= CAPTURE_SAMPLE_RATE;
        if rate_ok {
            if cfg.channels() == 1 || best_config.is_none() {
                let is_mono = cfg.channels() == 1;
                best_config = Some(cfg.with_sample_rate(SampleRate(CAPTURE_SAMPLE_RATE)));
                if is_mono {
                    break;
                }
            }
        } else if best_config.is_none() {
            best_config = Some(cfg.with_max_sample_rate());
        }
    }

    let config: StreamConfig = best_config
        .ok_or_else(|| "No supported audio configuration found".to_string())?
        .into();
    let capture_rate = config.sample_rate.0;
    let channels = config.channels as usize;

    info!(
        "Capture config: {} Hz, {} channel(s)",
        capture_rate, config.channels
    );

    let sample_buffer = Arc::new(Mutex::new(Vec::with_capacity(CHUNK_SAMPLES * 2)));
    let sample_buffer_clone = sample_buffer.clone();

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let Ok(mut buffer) = sample_buffer_clone.lock() else {
                    return;
                };
                if channels == 1 {
                    buffer.extend_from_slice(data);
                } else {
                    // Downmix stereo to mono
                    for frame in data.chunks(channels) {
                        let mono: f32 = frame.iter().sum::<f32>() / channels as f32;
                        buffer.push(mono);
                    }
                }
            },
            move |err| {
                error!("Audio input stream error: {err}");
            },
            None,
        )
        .map_err(|e| format!("Audio stream error: {e}"))?;

    stream.play().map_err(|e| format!("Audio stream error: {e}"))?;

    info!("Audio capture started");
    Ok((stream, sample_buffer, capture_rate))
}

fn resample_nearest(input: &[f32], output_len: usize) -> Vec<f32> {
    if input.is_empty() || output_len == 0 {
        return Vec::new();
    }
    let ratio = input.len() as f32 / output_len as f32;
    let mut output = Vec::with_capacity(output_len);
    for i in 0..output_len {
        let src_idx = ((i as f32 * ratio) as usize).min(input.len() - 1);
        output.push(input[src_idx]);
    }
    output
}
