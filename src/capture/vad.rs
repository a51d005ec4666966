//! Amplitude-threshold silence detection
//!
//! Not true voice-activity detection: a tick whose RMS level exceeds the
//! threshold counts as voice, and capture ends once no tick has done so for
//! the silence limit. Misfires near the threshold are accepted.

use std::time::Duration;

use tokio::time::Instant;

/// Tracks the last moment input energy exceeded the voice threshold
#[derive(Debug, Clone)]
pub struct SilenceMonitor {
    energy_threshold: f32,
    silence_limit: Duration,
    last_voice: Instant,
}

impl SilenceMonitor {
    /// Start monitoring; the silence span is measured from `now`
    #[must_use]
    pub const fn new(energy_threshold: f32, silence_limit: Duration, now: Instant) -> Self {
        Self {
            energy_threshold,
            silence_limit,
            last_voice: now,
        }
    }

    /// Record one energy sample
    ///
    /// Returns true once the silence since the last voiced sample exceeds the
    /// limit.
    pub fn observe(&mut self, energy: f32, now: Instant) -> bool {
        if energy > self.energy_threshold {
            self.last_voice = now;
            return false;
        }

        let silent_for = now.saturating_duration_since(self.last_voice);
        if silent_for > self.silence_limit {
            tracing::debug!(
                silent_ms = silent_for.as_millis(),
                limit_ms = self.silence_limit.as_millis(),
                "silence detected"
            );
            return true;
        }
        false
    }

    /// When voice was last heard
    #[must_use]
    pub const fn last_voice(&self) -> Instant {
        self.last_voice
    }
}

/// Calculate RMS energy of audio samples
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}
