//! Playback scheduler for agent speech episodes
//!
//! One episode runs at a time. An episode ends on the first of: the audio
//! finishing or failing, the unlock timer (text-only episodes), or the
//! fallback timer (audio episodes whose asset never signals). Starting an
//! episode cancels everything belonging to the previous one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::Result;
use crate::protocol::{SessionConfig, SpeechTask};

/// Shortest time any episode keeps the controls locked, in seconds
pub const MIN_UNLOCK_SECS: f64 = 1.5;

/// Extra slack after a hinted duration before the fallback fires
const FALLBACK_SLACK_SECS: f64 = 0.5;

/// Fallback floor for audio episodes without a duration hint
const FALLBACK_FLOOR_SECS: f64 = 10.0;

/// Plays a speech audio asset
#[async_trait]
pub trait SpeechOutput: Send + Sync {
    /// Play the asset to completion
    ///
    /// # Errors
    ///
    /// Returns error if the asset cannot be fetched, decoded or played
    async fn play(&self, url: &str) -> Result<()>;

    /// Cut off whatever is playing
    fn stop(&self);
}

/// Completion reported by an episode task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// Audio ended naturally or failed
    AudioEnded { episode: u64 },
    /// Unlock or fallback timer elapsed
    UnlockDue { episode: u64 },
}

/// How long a text-only episode keeps the controls locked
#[must_use]
pub fn unlock_delay(task: &SpeechTask, config: &SessionConfig) -> Duration {
    let secs = task
        .positive_duration()
        .unwrap_or_else(|| reading_time(&task.text_display, config));
    Duration::from_secs_f64(secs.max(MIN_UNLOCK_SECS))
}

/// When an audio episode gives up waiting for its asset
#[must_use]
pub fn fallback_delay(task: &SpeechTask, config: &SessionConfig) -> Duration {
    let secs = task.positive_duration().map_or_else(
        || unlock_delay(task, config).as_secs_f64().max(FALLBACK_FLOOR_SECS),
        |duration| duration + FALLBACK_SLACK_SECS,
    );
    Duration::from_secs_f64(secs)
}

#[allow(clippy::cast_precision_loss)]
fn reading_time(text: &str, config: &SessionConfig) -> f64 {
    let chars = text.chars().count() as f64;
    let secs = config.base_display_time + chars * config.text_read_speed;
    if secs.is_finite() { secs } else { MIN_UNLOCK_SECS }
}

/// Drives speech episodes
pub struct PlaybackScheduler {
    output: Arc<dyn SpeechOutput>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    episode: u64,
    in_flight: bool,
    unlock_timer: Option<JoinHandle<()>>,
    audio_task: Option<JoinHandle<()>>,
}

impl PlaybackScheduler {
    /// Create an idle scheduler and the receiver its tasks report into
    #[must_use]
    pub fn new(output: Arc<dyn SpeechOutput>) -> (Self, mpsc::UnboundedReceiver<PlaybackEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            output,
            events,
            episode: 0,
            in_flight: false,
            unlock_timer: None,
            audio_task: None,
        };
        (scheduler, rx)
    }

    /// Whether an episode is in flight
    #[must_use]
    pub const fn is_playing(&self) -> bool {
        self.in_flight
    }

    /// Start an episode, superseding any in flight
    ///
    /// Returns the episode number.
    pub fn play_episode(&mut self, task: &SpeechTask, config: &SessionConfig) -> u64 {
        self.cancel();
        self.episode += 1;
        self.in_flight = true;
        let episode = self.episode;

        let delay = match &task.audio_url {
            Some(url) => {
                let output = Arc::clone(&self.output);
                let events = self.events.clone();
                let url = url.clone();
                self.audio_task = Some(tokio::spawn(async move {
                    if let Err(e) = output.play(&url).await {
                        tracing::warn!(error = %e, url = %url, "speech audio failed");
                    }
                    let _ = events.send(PlaybackEvent::AudioEnded { episode });
                }));
                fallback_delay(task, config)
            }
            None => unlock_delay(task, config),
        };

        let events = self.events.clone();
        self.unlock_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(PlaybackEvent::UnlockDue { episode });
        }));

        tracing::debug!(
            episode,
            audio = task.audio_url.is_some(),
            delay_ms = delay.as_millis(),
            "speech episode started"
        );
        episode
    }

    /// Apply a task completion
    ///
    /// Returns true when it finishes the current episode.
    pub fn handle(&mut self, event: PlaybackEvent) -> bool {
        let (PlaybackEvent::AudioEnded { episode } | PlaybackEvent::UnlockDue { episode }) = event;
        if !self.in_flight || episode != self.episode {
            tracing::trace!(episode, current = self.episode, "stale playback event");
            return false;
        }

        if matches!(event, PlaybackEvent::UnlockDue { .. }) && self.audio_task.is_some() {
            tracing::warn!(episode, "speech audio never finished, unlocking");
        }

        self.cancel();
        tracing::debug!(episode, "speech episode finished");
        true
    }

    fn cancel(&mut self) {
        if let Some(timer) = self.unlock_timer.take() {
            timer.abort();
        }
        if let Some(audio) = self.audio_task.take() {
            audio.abort();
            self.output.stop();
        }
        self.in_flight = false;
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}
