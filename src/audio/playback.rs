//! Scheduled playback of received PCM16 audio.
//!
//! [`PlaybackQueue`] is the pure scheduling core: it owns the ordered buffer
//! queue and the single next-start marker, and is driven sample-by-sample by
//! whoever pulls output. [`AudioPlayback`] wraps it with a cpal output
//! stream on a dedicated thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use log::{error, info};

use crate::audio::pcm::decode_pcm16;
use crate::audio::volume::VolumeMeter;
use crate::error::LiveError;

/// Sample rate of audio the service streams back.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

struct ScheduledBuffer {
    start: u64,
    pos: usize,
    samples: Vec<f32>,
}

/// Ordered queue of decoded buffers with back-to-back scheduling.
///
/// Each enqueued buffer is scheduled to begin exactly when the previous one
/// ends; if the queue drains, the clock keeps running and the next buffer
/// starts at the current clock instead. `flush()` is the barge-in path: it
/// discards queued buffers and the in-flight one.
pub struct PlaybackQueue {
    buffers: VecDeque<ScheduledBuffer>,
    /// Samples emitted since creation; the queue's notion of "now".
    clock: u64,
    /// Sample index at which the next enqueued buffer will begin.
    next_start: u64,
    sample_rate: u32,
    halted: bool,
}

impl PlaybackQueue {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            buffers: VecDeque::new(),
            clock: 0,
            next_start: 0,
            sample_rate,
            halted: false,
        }
    }

    /// Appends a decoded buffer and returns its scheduled start (in samples
    /// since creation).
    pub fn enqueue(&mut self, samples: Vec<f32>) -> u64 {
        let start = self.next_start.max(self.clock);
        self.next_start = start + samples.len() as u64;
        self.buffers.push_back(ScheduledBuffer {
            start,
            pos: 0,
            samples,
        });
        start
    }

    /// Pulls the next `out.len()` output samples, writing silence wherever
    /// no buffer is scheduled. The clock advances by `out.len()` unless the
    /// queue is halted.
    pub fn fill(&mut self, out: &mut [f32]) {
        out.fill(0.0);
        if self.halted {
            return;
        }

        let mut i = 0;
        while i < out.len() {
            match self.buffers.front_mut() {
                Some(buffer) if buffer.start <= self.clock => {
                    out[i] = buffer.samples[buffer.pos];
                    buffer.pos += 1;
                    self.clock += 1;
                    i += 1;
                    if buffer.pos == buffer.samples.len() {
                        self.buffers.pop_front();
                    }
                }
                Some(buffer) => {
                    // Silence until the scheduled start
                    let gap = (buffer.start - self.clock).min((out.len() - i) as u64);
                    self.clock += gap;
                    i += gap as usize;
                }
                None => {
                    self.clock += (out.len() - i) as u64;
                    break;
                }
            }
        }
    }

    /// Hard cancellation: discards every queued buffer, including the one
    /// currently playing. Nothing enqueued before this call will be heard.
    pub fn flush(&mut self) {
        self.buffers.clear();
        self.next_start = self.clock;
    }

    /// Freezes output without touching queued state.
    pub fn halt(&mut self) {
        self.halted = true;
    }

    /// Restarts the scheduler from idle; queued buffers resume where they
    /// left off.
    pub fn resume(&mut self) {
        self.halted = false;
    }

    pub fn is_idle(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn queued_samples(&self) -> usize {
        self.buffers
            .iter()
            .map(|b| b.samples.len() - b.pos)
            .sum()
    }

    /// Scheduled start of every queued buffer, oldest first.
    pub fn scheduled_starts(&self) -> Vec<u64> {
        self.buffers.iter().map(|b| b.start).collect()
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Speaker pipeline: decodes inbound PCM16 chunks into the queue and plays
/// them through the default output device.
pub struct AudioPlayback {
    queue: Arc<Mutex<PlaybackQueue>>,
    meter: Arc<Mutex<VolumeMeter>>,
    stop_signal: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl AudioPlayback {
    /// Acquires the default output device at 24 kHz. Acquisition runs on
    /// the playback thread and its outcome is reported back before this
    /// returns; a failure leaves nothing running.
    pub fn start() -> Result<Self, LiveError> {
        let queue = Arc::new(Mutex::new(PlaybackQueue::new(PLAYBACK_SAMPLE_RATE)));
        let meter = Arc::new(Mutex::new(VolumeMeter::new()));
        let stop_signal = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), String>>();

        let queue_clone = queue.clone();
        let stop_clone = stop_signal.clone();
        let thread = std::thread::spawn(move || {
            run_playback(queue_clone, stop_clone, ready_tx);
        });

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                queue,
                meter,
                stop_signal,
                thread: Some(thread),
            }),
            Ok(Err(message)) => {
                let _ = thread.join();
                Err(LiveError::Device(message))
            }
            Err(_) => {
                let _ = thread.join();
                Err(LiveError::Device(
                    "playback thread exited early".to_string(),
                ))
            }
        }
    }

    /// Decodes a raw PCM16 chunk and appends it to the queue. The decoded
    /// buffer also feeds the meter, so playback loudness is observable the
    /// same way capture loudness is.
    pub fn enqueue(&self, pcm: &[u8]) {
        let samples = decode_pcm16(pcm);
        if samples.is_empty() {
            return;
        }
        self.meter.lock().unwrap().process(&samples);
        self.queue.lock().unwrap().enqueue(samples);
    }

    /// Barge-in: discards queued and in-flight audio immediately.
    pub fn interrupt(&self) {
        self.queue.lock().unwrap().flush();
    }

    /// Freezes output, preserving the queue.
    pub fn pause(&self) {
        self.queue.lock().unwrap().halt();
    }

    /// Restarts output from idle without altering queued state.
    pub fn resume(&self) {
        self.queue.lock().unwrap().resume();
    }

    pub fn queued_samples(&self) -> usize {
        self.queue.lock().unwrap().queued_samples()
    }

    pub fn meter(&self) -> Arc<Mutex<VolumeMeter>> {
        self.meter.clone()
    }

    fn shutdown(&mut self) {
        self.stop_signal.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.queue.lock().unwrap().flush();
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_playback(
    queue: Arc<Mutex<PlaybackQueue>>,
    stop_signal: Arc<AtomicBool>,
    ready_tx: std::sync::mpsc::Sender<Result<(), String>>,
) {
    let stream = match open_output_stream(queue) {
        Ok(stream) => stream,
        Err(message) => {
            let _ = ready_tx.send(Err(message));
            return;
        }
    };
    let _ = ready_tx.send(Ok(()));

    while !stop_signal.load(Ordering::Relaxed) {
        std::thread::sleep(std::time::Duration::from_millis(10));
    }

    drop(stream);
    info!("Audio playback stopped");
}

fn open_output_stream(queue: Arc<Mutex<PlaybackQueue>>) -> Result<cpal::Stream, String> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| "No audio output device found".to_string())?;

    info!(
        "Playback output device: {}",
        device.name().unwrap_or_default()
    );

    let supported = device
        .supported_output_configs()
        .map_err(|e| format!("Audio device error: {e}"))?;

    let mut best_config = None;
    for cfg in supported {
        if cfg.min_sample_rate().0 <= PLAYBACK_SAMPLE_RATE
            && cfg.max_sample_rate().0 >= PLAYBACK_SAMPLE_RATE
        {
            best_config = Some(cfg.with_sample_rate(SampleRate(PLAYBACK_SAMPLE_RATE)));
            break;
        }
    }

    let config: StreamConfig = best_config
        .ok_or_else(|| "No supported audio configuration found".to_string())?
        .into();
    let output_channels = config.channels as usize;

    info!(
        "Playback config: {} Hz, {} channel(s)",
        config.sample_rate.0, output_channels
    );

    let mut scratch: Vec<f32> = Vec::new();
    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / output_channels;
                if scratch.len() < frames {
                    scratch.resize(frames, 0.0);
                }
                if let Ok(mut queue) = queue.lock() {
                    queue.fill(&mut scratch[..frames]);
                }
                for (i, sample) in data.iter_mut().enumerate() {
                    *sample = scratch[i / output_channels];
                }
            },
            move |err| {
                error!("Audio output error: {err}");
            },
            None,
        )
        .map_err(|e| format!("Audio stream error: {e}"))?;

    stream
        .play()
        .map_err(|e| format!("Audio stream error: {e}"))?;

    info!("Audio playback started");
    Ok(stream)
}
