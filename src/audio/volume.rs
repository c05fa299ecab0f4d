//! RMS volume metering with decay smoothing.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

/// Decay factor applied to the previous volume between blocks. The meter
/// rises instantly on sound onset but falls gradually between words, so a
/// subscriber rendering it does not flicker.
pub const DEFAULT_DECAY: f32 = 0.7;

#[derive(Debug, Clone)]
pub struct VolumeMeter {
    volume: f32,
    decay: f32,
}

impl VolumeMeter {
    pub fn new() -> Self {
        Self::with_decay(DEFAULT_DECAY)
    }

    /// `decay` must be below 1.0 or the meter would never fall.
    pub fn with_decay(decay: f32) -> Self {
        debug_assert!(decay < 1.0);
        Self { volume: 0.0, decay }
    }

    /// Folds one block of samples into the meter and returns the new
    /// smoothed volume: `max(rms, previous * decay)`.
    pub fn process(&mut self, samples: &[f32]) -> f32 {
        let rms = if samples.is_empty() {
            0.0
        } else {
            let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
            (sum_squares / samples.len() as f32).sqrt()
        };
        self.volume = rms.max(self.volume * self.decay);
        self.volume
    }

    pub fn value(&self) -> f32 {
        self.volume
    }

    pub fn reset(&mut self) {
        self.volume = 0.0;
    }
}

impl Default for VolumeMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Publishes the meter's current value on a fixed wall-clock tick,
/// decoupling the sampling rate from the subscriber's refresh rate.
/// The task ends when every receiver has been dropped.
pub fn spawn_volume_ticker(
    meter: Arc<Mutex<VolumeMeter>>,
    period: Duration,
) -> watch::Receiver<f32> {
    let (tx, rx) = watch::channel(0.0f32);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if tx.is_closed() {
                break;
            }
            let value = meter.lock().map(|m| m.value()).unwrap_or(0.0);
            let _ = tx.send(value);
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: f32, expected: f32) {
        assert!(
            (actual - expected).abs() < 1e-6,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn constant_block_yields_its_rms() {
        let mut meter = VolumeMeter::new();
        let block = vec![0.5f32; 1024];
        assert_close(meter.process(&block), 0.5);
    }

    #[test]
    fn volume_decays_between_silent_blocks() {
        let mut meter = VolumeMeter::with_decay(0.7);
        let loud = vec![1.0f32; 256];
        let silence = vec![0.0f32; 256];

        assert_close(meter.process(&loud), 1.0);
        assert_close(meter.process(&silence), 0.7);
        assert_close(meter.process(&silence), 0.49);
        assert_close(meter.process(&silence), 0.343);
    }

    #[test]
    fn onset_overrides_decayed_value() {
        let mut meter = VolumeMeter::with_decay(0.7);
        meter.process(&[0.2f32; 64]);
        let value = meter.process(&[1.0f32; 64]);
        assert_close(value, 1.0);
    }

    #[test]
    fn empty_block_still_decays() {
        let mut meter = VolumeMeter::with_decay(0.7);
        meter.process(&[1.0f32; 64]);
        assert_close(meter.process(&[]), 0.7);
    }
}
