//! Session event loop
//!
//! The single writer of session state. Peer messages, capture and playback
//! completions, fired timers and user intents all arrive on channels and are
//! handled one at a time, to completion, in [`Session::step`]. Components
//! never touch the turn machine themselves; they report outcomes and the
//! session translates them into [`TurnEvent`]s.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};

use crate::Error;
use crate::capture::{
    CaptureEvent, CaptureLimits, CaptureOutcome, CapturePipeline, HttpUploader,
    MicrophoneSource, StopReason, Uploader,
};
use crate::channel::{ChannelEvent, PeerSink, SessionChannel};
use crate::config::{CaptureConfig, ClientConfig};
use crate::deferred::DeferredRegistry;
use crate::playback::{PlaybackEvent, PlaybackScheduler, SpeechOutput};
use crate::protocol::{
    ClientMessage, DeferredTask, ServerMessage, SessionConfig, SettingsPatch, SpeechTask,
};
use crate::state::StateStore;
use crate::turn::{TurnEvent, TurnMachine};
use crate::view::{Catalog, ViewPublisher, ViewState};
use crate::voice::{CpalMicrophone, SpeakerOutput};

/// Requests from the user-facing collaborator
#[derive(Debug, Clone, PartialEq)]
pub enum UserIntent {
    /// Start capture, or stop the one running
    ToggleMic,
    SubmitText(String),
    RequestOutfits,
    SelectOutfit(String),
    SelectPack(String),
    /// Forward arbitrary settings to the peer
    UpdateSettings(serde_json::Map<String, serde_json::Value>),
}

/// Collaborators a session is assembled from
pub struct SessionParts {
    pub sink: Arc<dyn PeerSink>,
    pub channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    pub microphone: Arc<dyn MicrophoneSource>,
    pub uploader: Arc<dyn Uploader>,
    pub speech: Arc<dyn SpeechOutput>,
    pub store: StateStore,
    pub capture: CaptureConfig,
}

/// The collaborator's side of a running session
#[derive(Debug)]
pub struct SessionHandle {
    intents: mpsc::UnboundedSender<UserIntent>,
    /// Latest view snapshot
    pub view: watch::Receiver<ViewState>,
    /// One-off alerts
    pub alerts: mpsc::UnboundedReceiver<String>,
}

impl SessionHandle {
    /// Submit an intent; returns false once the session has stopped
    pub fn send(&self, intent: UserIntent) -> bool {
        self.intents.send(intent).is_ok()
    }
}

/// Owned session state and the components it drives
pub struct Session {
    machine: TurnMachine,
    config: SessionConfig,
    limits: CaptureLimits,
    catalog: Catalog,
    sink: Arc<dyn PeerSink>,
    store: StateStore,
    capture: CapturePipeline,
    playback: PlaybackScheduler,
    deferred: DeferredRegistry,
    view: ViewPublisher,
    channel_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    capture_rx: mpsc::UnboundedReceiver<CaptureEvent>,
    playback_rx: mpsc::UnboundedReceiver<PlaybackEvent>,
    deferred_rx: mpsc::UnboundedReceiver<String>,
    intents_rx: mpsc::UnboundedReceiver<UserIntent>,
}

impl Session {
    /// Assemble a session from its collaborators
    #[must_use]
    pub fn new(parts: SessionParts) -> (Self, SessionHandle) {
        let limits = CaptureLimits::from_capture_config(&parts.capture);
        let (capture, capture_rx) = CapturePipeline::new(
            parts.microphone,
            parts.uploader,
            parts.capture,
            parts.store.clone(),
        );
        let (playback, playback_rx) = PlaybackScheduler::new(parts.speech);
        let (deferred, deferred_rx) = DeferredRegistry::new();
        let (view, view_rx, alerts_rx) = ViewPublisher::new();
        let (intents, intents_rx) = mpsc::unbounded_channel();

        let session = Self {
            machine: TurnMachine::new(),
            config: SessionConfig::default(),
            limits,
            catalog: Catalog::default(),
            sink: parts.sink,
            store: parts.store,
            capture,
            playback,
            deferred,
            view,
            channel_rx: parts.channel_events,
            capture_rx,
            playback_rx,
            deferred_rx,
            intents_rx,
        };
        let handle = SessionHandle {
            intents,
            view: view_rx,
            alerts: alerts_rx,
        };
        (session, handle)
    }

    /// Wire a session to the real transport, audio devices and upload endpoint
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the speech output cannot be created
    pub fn connect(
        config: &ClientConfig,
        store: StateStore,
    ) -> crate::Result<(Self, SessionHandle)> {
        let (channel, channel_events) =
            SessionChannel::spawn(config.channel.clone(), store.clone());
        let speech = SpeakerOutput::new(config.server_url.clone())?;

        Ok(Self::new(SessionParts {
            sink: Arc::new(channel),
            channel_events,
            microphone: Arc::new(CpalMicrophone::new()),
            uploader: Arc::new(HttpUploader::new(config.capture.upload_url.clone())),
            speech: Arc::new(speech),
            store,
            capture: config.capture.clone(),
        }))
    }

    /// Run until the handle is dropped
    pub async fn run(mut self) {
        while self.step().await {}
        tracing::debug!("session stopped");
    }

    /// Wait for and handle exactly one event
    ///
    /// Returns false once the handle has been dropped.
    pub async fn step(&mut self) -> bool {
        tokio::select! {
            Some(event) = self.channel_rx.recv() => self.on_channel(event),
            Some(event) = self.capture_rx.recv() => {
                if let Some(outcome) = self.capture.handle(event) {
                    self.on_capture(outcome);
                }
            }
            Some(event) = self.playback_rx.recv() => {
                if self.playback.handle(event) {
                    self.machine.apply(TurnEvent::PlaybackFinished);
                }
            }
            Some(id) = self.deferred_rx.recv() => {
                if let Some(task) = self.deferred.fire(&id) {
                    self.start_episode(&task);
                }
            }
            intent = self.intents_rx.recv() => match intent {
                Some(intent) => self.on_intent(intent),
                None => return false,
            },
        }

        self.view.publish(ViewState::new(&self.machine, &self.catalog));
        true
    }

    #[must_use]
    pub const fn machine(&self) -> &TurnMachine {
        &self.machine
    }

    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[must_use]
    pub const fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    #[must_use]
    pub const fn deferred(&self) -> &DeferredRegistry {
        &self.deferred
    }

    #[must_use]
    pub const fn capture(&self) -> &CapturePipeline {
        &self.capture
    }

    fn on_channel(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected => {
                self.machine.apply(TurnEvent::Connectivity { connected: true });
            }
            ChannelEvent::Disconnected => {
                self.machine.apply(TurnEvent::Connectivity { connected: false });
            }
            ChannelEvent::Message(message) => self.on_message(message),
        }
    }

    fn on_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::HandshakeAck { session_id, config } => {
                self.on_handshake_ack(&session_id, config);
            }
            ServerMessage::OutfitsList {
                outfits,
                current_outfit,
                ..
            } => {
                tracing::debug!(count = outfits.len(), "outfit catalog received");
                self.catalog.outfits = outfits;
                self.catalog.current_outfit = current_outfit;
            }
            ServerMessage::OutfitChanged {
                outfit_id,
                image_url,
            } => {
                tracing::info!(outfit = %outfit_id, "outfit changed");
                self.catalog.current_outfit = Some(outfit_id);
                self.machine.apply(TurnEvent::OutfitChanged { image_url });
            }
            ServerMessage::Status {
                state,
                text,
                image_url,
            } => {
                self.machine.apply(TurnEvent::Status {
                    state,
                    text,
                    image_url,
                });
            }
            ServerMessage::Speak {
                text,
                image_url,
                audio_url,
                duration,
            } => {
                let task = SpeechTask::from_speak(text, image_url, audio_url, duration);
                self.start_episode(&task);
            }
            ServerMessage::Transcription { text } => {
                self.machine.apply(TurnEvent::Transcription { text });
            }
            ServerMessage::TimerEvent { task, trigger_at } => {
                let now = Utc::now();
                let task = DeferredTask::from_timer_event(task, trigger_at, now);
                self.deferred.schedule(task, now);
            }
            ServerMessage::Error { message } => {
                tracing::warn!(message = %message, "peer reported error");
                self.machine.apply(TurnEvent::PeerError { message });
            }
            ServerMessage::Pong | ServerMessage::Unknown => {}
        }
    }

    fn on_handshake_ack(&mut self, session_id: &str, config: SessionConfig) {
        tracing::info!(
            session_id,
            pack = ?config.active_pack,
            character = ?config.character_name,
            "session ready"
        );

        if let Some(pack) = &config.active_pack {
            self.store.set_pack_id(pack);
        }
        self.limits = CaptureLimits::from_session_config(&config);
        self.catalog.apply_config(&config);
        let image_url = config.initial_image();
        self.config = config;

        self.machine.apply(TurnEvent::SessionReady { image_url });
        self.sink.send(ClientMessage::GetOutfits);
    }

    fn start_episode(&mut self, task: &SpeechTask) {
        self.machine.apply(TurnEvent::SpeakStarted {
            text: task.text_display.clone(),
            image_url: task.image_url.clone(),
        });
        self.playback.play_episode(task, &self.config);
    }

    fn on_capture(&mut self, outcome: CaptureOutcome) {
        match outcome {
            CaptureOutcome::Started => {
                self.machine.apply(TurnEvent::CaptureStarted);
                if self.sink.is_open() {
                    self.sink.send(ClientMessage::StartRecording);
                } else {
                    tracing::debug!("channel closed, start_recording not sent");
                }
            }
            CaptureOutcome::DeviceUnavailable(e) => {
                self.machine.apply(TurnEvent::MicUnavailable);
                self.view.alert(e.user_message());
            }
            CaptureOutcome::Stopped(_) => {
                self.machine.apply(TurnEvent::CaptureStopped);
            }
            CaptureOutcome::NoAudio => {
                self.machine.apply(TurnEvent::CaptureFailed {
                    message: Error::NoAudioCaptured.user_message(),
                });
            }
            CaptureOutcome::Uploaded => {
                tracing::debug!("utterance delivered, waiting for peer");
            }
            CaptureOutcome::UploadFailed(e) => {
                self.machine.apply(TurnEvent::CaptureFailed {
                    message: e.user_message(),
                });
            }
        }
    }

    fn on_intent(&mut self, intent: UserIntent) {
        match intent {
            UserIntent::ToggleMic => self.toggle_mic(),
            UserIntent::SubmitText(text) => self.submit_text(&text),
            UserIntent::RequestOutfits => {
                self.sink.send(ClientMessage::GetOutfits);
            }
            UserIntent::SelectOutfit(outfit_id) => {
                self.sink.send(ClientMessage::SetOutfit { outfit_id });
            }
            UserIntent::SelectPack(pack_id) => self.select_pack(pack_id),
            UserIntent::UpdateSettings(extra) => {
                self.sink.send(ClientMessage::SettingsUpdate {
                    settings: SettingsPatch {
                        active_pack: None,
                        extra,
                    },
                });
            }
        }
    }

    fn toggle_mic(&mut self) {
        if self.capture.is_capturing() {
            if self.capture.stop(StopReason::User) {
                self.machine.apply(TurnEvent::CaptureStopped);
            }
            return;
        }
        if !self.machine.affordances().mic() {
            tracing::debug!(turn = ?self.machine.turn(), "microphone disabled");
            return;
        }
        if self.capture.start(self.limits) {
            self.machine.apply(TurnEvent::MicInitializing);
        }
    }

    fn submit_text(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if !self.machine.affordances().text_input() {
            tracing::debug!(turn = ?self.machine.turn(), "text input disabled");
            return;
        }
        if self.sink.send(ClientMessage::TextInput {
            text: text.to_string(),
        }) {
            self.machine.apply(TurnEvent::TextSubmitted);
        }
    }

    fn select_pack(&mut self, pack_id: String) {
        if self.config.active_pack.as_deref() == Some(pack_id.as_str()) {
            tracing::debug!(pack = %pack_id, "pack already active");
            return;
        }

        tracing::info!(pack = %pack_id, "switching pack");
        let sent = self.sink.send(ClientMessage::SettingsUpdate {
            settings: SettingsPatch {
                active_pack: Some(pack_id.clone()),
                extra: serde_json::Map::new(),
            },
        });
        self.store.set_pack_id(&pack_id);
        if sent {
            self.machine.apply(TurnEvent::PackSwitchRequested);
        }
    }
}
