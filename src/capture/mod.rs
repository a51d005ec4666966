//! Microphone capture pipeline
//!
//! Owns one utterance at a time: acquire the input device, buffer chunks while
//! a silence monitor and a hard timeout run, then finalize after a short
//! debounce and upload the result. Device acquisition, timers and the upload
//! run as spawned tasks that report back through [`CaptureEvent`]s; the owner
//! feeds each event to [`CapturePipeline::handle`]. Every task is tagged with
//! the capture generation so a late event from a superseded capture is dropped.

pub mod upload;
pub mod vad;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

pub use upload::{HttpUploader, Uploader};
pub use vad::{SilenceMonitor, rms_energy};

use crate::config::CaptureConfig;
use crate::protocol::SessionConfig;
use crate::state::StateStore;
use crate::voice::samples_to_wav;
use crate::{Error, Result};

/// Reason given when an utterance finishes before any handshake
const NO_SESSION_REASON: &str = "session not established";

/// Acquires the audio input device
#[async_trait]
pub trait MicrophoneSource: Send + Sync {
    /// Open the device and start streaming
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceUnavailable`] if permission is denied or no
    /// input device exists
    async fn open(&self) -> Result<Box<dyn InputStream>>;
}

/// A running input stream, exclusively owned by one capture
pub trait InputStream: Send {
    fn sample_rate(&self) -> u32;

    /// Take every sample buffered since the last call
    fn drain(&mut self) -> Vec<f32>;

    /// Halt the stream and release the device
    fn stop(&mut self);
}

/// Opened input stream carried back from the acquisition task
pub struct DeviceHandle(Box<dyn InputStream>);

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("sample_rate", &self.0.sample_rate())
            .finish_non_exhaustive()
    }
}

/// Where the pipeline is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapturePhase {
    #[default]
    Idle,
    /// Waiting for the device
    Initializing,
    Recording,
    /// Stream halted; waiting out the debounce
    Finalizing,
    /// Utterance handed to the uploader
    Uploading,
}

/// Why a capture stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    User,
    MaxDuration,
    Silence,
}

/// Per-capture limits, taken from the peer's session config when known
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureLimits {
    pub max_duration: Duration,
    pub silence_threshold: Duration,
}

impl CaptureLimits {
    /// Local defaults used before a handshake
    #[must_use]
    pub const fn from_capture_config(config: &CaptureConfig) -> Self {
        Self {
            max_duration: config.max_duration,
            silence_threshold: config.silence_threshold,
        }
    }

    /// Limits pushed by the peer
    #[must_use]
    pub fn from_session_config(config: &SessionConfig) -> Self {
        Self {
            max_duration: config.max_capture(),
            silence_threshold: config.silence_threshold(),
        }
    }
}

/// Completion reported by a pipeline task
#[derive(Debug)]
pub enum CaptureEvent {
    Opened {
        generation: u64,
        result: Result<DeviceHandle>,
    },
    MonitorTick {
        generation: u64,
    },
    HardTimeout {
        generation: u64,
    },
    FinalizeDue {
        generation: u64,
    },
    UploadFinished {
        generation: u64,
        result: Result<()>,
    },
}

/// Observable result of handling a [`CaptureEvent`]
#[derive(Debug)]
pub enum CaptureOutcome {
    /// Device acquired; recording
    Started,
    /// Device could not be acquired; the pipeline is idle again
    DeviceUnavailable(Error),
    /// Recording ended on its own and is being finalized
    Stopped(StopReason),
    /// Nothing was buffered; no upload attempted
    NoAudio,
    Uploaded,
    UploadFailed(Error),
}

struct ActiveCapture {
    stream: Box<dyn InputStream>,
    monitor: SilenceMonitor,
    hard_timeout: JoinHandle<()>,
    ticker: JoinHandle<()>,
}

/// Single-utterance capture pipeline
pub struct CapturePipeline {
    source: Arc<dyn MicrophoneSource>,
    uploader: Arc<dyn Uploader>,
    config: CaptureConfig,
    store: StateStore,
    events: mpsc::UnboundedSender<CaptureEvent>,
    phase: CapturePhase,
    generation: u64,
    limits: CaptureLimits,
    active: Option<ActiveCapture>,
    chunks: Vec<Vec<f32>>,
    sample_rate: u32,
    open_task: Option<JoinHandle<()>>,
    finalize_timer: Option<JoinHandle<()>>,
    upload_task: Option<JoinHandle<()>>,
}

impl CapturePipeline {
    /// Create an idle pipeline and the receiver its tasks report into
    #[must_use]
    pub fn new(
        source: Arc<dyn MicrophoneSource>,
        uploader: Arc<dyn Uploader>,
        config: CaptureConfig,
        store: StateStore,
    ) -> (Self, mpsc::UnboundedReceiver<CaptureEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let limits = CaptureLimits::from_capture_config(&config);
        let pipeline = Self {
            source,
            uploader,
            config,
            store,
            events,
            phase: CapturePhase::Idle,
            generation: 0,
            limits,
            active: None,
            chunks: Vec::new(),
            sample_rate: crate::voice::SAMPLE_RATE,
            open_task: None,
            finalize_timer: None,
            upload_task: None,
        };
        (pipeline, rx)
    }

    #[must_use]
    pub const fn phase(&self) -> CapturePhase {
        self.phase
    }

    /// Whether the device is streaming
    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.phase == CapturePhase::Recording
    }

    /// Begin acquiring the device
    ///
    /// A no-op returning false unless the pipeline is idle, so a second
    /// start while recording or initializing never opens another stream.
    pub fn start(&mut self, limits: CaptureLimits) -> bool {
        if self.phase != CapturePhase::Idle {
            tracing::debug!(phase = ?self.phase, "capture start ignored");
            return false;
        }

        self.generation += 1;
        self.phase = CapturePhase::Initializing;
        self.limits = limits;
        self.chunks.clear();

        let generation = self.generation;
        let source = Arc::clone(&self.source);
        let events = self.events.clone();
        self.open_task = Some(tokio::spawn(async move {
            let result = source.open().await.map(DeviceHandle);
            let _ = events.send(CaptureEvent::Opened { generation, result });
        }));

        tracing::debug!(generation, "acquiring microphone");
        true
    }

    /// Stop recording and hand off to finalize
    ///
    /// A no-op returning false unless recording.
    pub fn stop(&mut self, reason: StopReason) -> bool {
        if self.phase != CapturePhase::Recording {
            tracing::debug!(phase = ?self.phase, "capture stop ignored");
            return false;
        }
        let Some(mut active) = self.active.take() else {
            self.phase = CapturePhase::Idle;
            return false;
        };

        active.hard_timeout.abort();
        active.ticker.abort();

        let tail = active.stream.drain();
        if !tail.is_empty() {
            self.chunks.push(tail);
        }
        active.stream.stop();

        tracing::info!(
            reason = ?reason,
            chunks = self.chunks.len(),
            "capture stopped"
        );

        self.phase = CapturePhase::Finalizing;
        let generation = self.generation;
        let delay = self.config.finalize_delay;
        let events = self.events.clone();
        self.finalize_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(CaptureEvent::FinalizeDue { generation });
        }));
        true
    }

    /// Apply a task completion
    pub fn handle(&mut self, event: CaptureEvent) -> Option<CaptureOutcome> {
        match event {
            CaptureEvent::Opened { generation, result } => self.on_opened(generation, result),
            CaptureEvent::MonitorTick { generation } => self.on_tick(generation),
            CaptureEvent::HardTimeout { generation } => {
                if !self.is_current(generation, CapturePhase::Recording) {
                    return None;
                }
                tracing::info!(
                    max_secs = self.limits.max_duration.as_secs_f64(),
                    "capture hit max duration"
                );
                self.stop(StopReason::MaxDuration)
                    .then_some(CaptureOutcome::Stopped(StopReason::MaxDuration))
            }
            CaptureEvent::FinalizeDue { generation } => {
                if !self.is_current(generation, CapturePhase::Finalizing) {
                    return None;
                }
                self.finalize_timer = None;
                self.finalize()
            }
            CaptureEvent::UploadFinished { generation, result } => {
                if !self.is_current(generation, CapturePhase::Uploading) {
                    return None;
                }
                self.upload_task = None;
                self.phase = CapturePhase::Idle;
                Some(match result {
                    Ok(()) => CaptureOutcome::Uploaded,
                    Err(e) => CaptureOutcome::UploadFailed(e),
                })
            }
        }
    }

    fn is_current(&self, generation: u64, phase: CapturePhase) -> bool {
        generation == self.generation && self.phase == phase
    }

    fn on_opened(
        &mut self,
        generation: u64,
        result: Result<DeviceHandle>,
    ) -> Option<CaptureOutcome> {
        if !self.is_current(generation, CapturePhase::Initializing) {
            if let Ok(DeviceHandle(mut stream)) = result {
                stream.stop();
            }
            return None;
        }
        self.open_task = None;

        let mut stream = match result {
            Ok(DeviceHandle(stream)) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "microphone unavailable");
                self.phase = CapturePhase::Idle;
                return Some(CaptureOutcome::DeviceUnavailable(e));
            }
        };

        // Anything buffered while opening belongs to this utterance
        let head = stream.drain();
        if !head.is_empty() {
            self.chunks.push(head);
        }
        self.sample_rate = stream.sample_rate();

        let now = Instant::now();
        let monitor = SilenceMonitor::new(
            self.config.energy_threshold,
            self.limits.silence_threshold,
            now,
        );

        let events = self.events.clone();
        let max_duration = self.limits.max_duration;
        let hard_timeout = tokio::spawn(async move {
            tokio::time::sleep(max_duration).await;
            let _ = events.send(CaptureEvent::HardTimeout { generation });
        });

        let events = self.events.clone();
        let period = self.config.monitor_interval;
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(now + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if events.send(CaptureEvent::MonitorTick { generation }).is_err() {
                    break;
                }
            }
        });

        self.active = Some(ActiveCapture {
            stream,
            monitor,
            hard_timeout,
            ticker,
        });
        self.phase = CapturePhase::Recording;

        tracing::info!(
            generation,
            sample_rate = self.sample_rate,
            max_secs = self.limits.max_duration.as_secs_f64(),
            silence_secs = self.limits.silence_threshold.as_secs_f64(),
            "capture started"
        );
        Some(CaptureOutcome::Started)
    }

    fn on_tick(&mut self, generation: u64) -> Option<CaptureOutcome> {
        if !self.is_current(generation, CapturePhase::Recording) {
            return None;
        }
        let active = self.active.as_mut()?;

        let samples = active.stream.drain();
        let energy = rms_energy(&samples);
        if !samples.is_empty() {
            self.chunks.push(samples);
        }

        if active.monitor.observe(energy, Instant::now()) {
            return self
                .stop(StopReason::Silence)
                .then_some(CaptureOutcome::Stopped(StopReason::Silence));
        }
        None
    }

    fn finalize(&mut self) -> Option<CaptureOutcome> {
        let chunks = std::mem::take(&mut self.chunks);
        if chunks.is_empty() {
            tracing::warn!("no audio data captured");
            self.phase = CapturePhase::Idle;
            return Some(CaptureOutcome::NoAudio);
        }

        let samples: Vec<f32> = chunks.into_iter().flatten().collect();
        let wav = match samples_to_wav(&samples, self.sample_rate) {
            Ok(wav) => wav,
            Err(e) => {
                self.phase = CapturePhase::Idle;
                return Some(CaptureOutcome::UploadFailed(Error::UploadFailed {
                    reason: e.to_string(),
                }));
            }
        };

        let Some(session_id) = self.store.session_id() else {
            tracing::warn!("utterance finished before a session was established");
            self.phase = CapturePhase::Idle;
            return Some(CaptureOutcome::UploadFailed(Error::UploadFailed {
                reason: NO_SESSION_REASON.to_string(),
            }));
        };

        tracing::debug!(
            samples = samples.len(),
            wav_bytes = wav.len(),
            "finalizing utterance"
        );

        self.phase = CapturePhase::Uploading;
        let generation = self.generation;
        let uploader = Arc::clone(&self.uploader);
        let events = self.events.clone();
        self.upload_task = Some(tokio::spawn(async move {
            let result = uploader.upload(wav, &session_id).await;
            let _ = events.send(CaptureEvent::UploadFinished { generation, result });
        }));
        None
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.hard_timeout.abort();
            active.ticker.abort();
            active.stream.stop();
        }
        for task in [
            self.open_task.take(),
            self.finalize_timer.take(),
            self.upload_task.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}
