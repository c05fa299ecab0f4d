//! Audio pipelines for the live session
//!
//! This module provides:
//! - Microphone capture, chunking and PCM16 encoding at 16 kHz
//! - Gapless scheduled playback of received PCM16 audio
//! - RMS volume metering with decay smoothing
//!
//! Capture and playback each run on a dedicated thread because cpal streams
//! are `!Send`; communication happens via channels and shared queues.

mod capture;
mod pcm;
mod playback;
mod volume;

pub use capture::{AudioCapture, CAPTURE_SAMPLE_RATE, CHUNK_SAMPLES, CaptureEvent};
pub use pcm::{decode_pcm16, encode_pcm16};
pub use playback::{AudioPlayback, PLAYBACK_SAMPLE_RATE, PlaybackQueue};
pub use volume::{DEFAULT_DECAY, VolumeMeter, spawn_volume_ticker};
