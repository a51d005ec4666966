//! Shared test utilities

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use companion_session::capture::{InputStream, MicrophoneSource, Uploader};
use companion_session::channel::{ChannelEvent, PeerSink};
use companion_session::config::CaptureConfig;
use companion_session::playback::SpeechOutput;
use companion_session::protocol::{ClientMessage, PeerState, ServerMessage, SessionConfig};
use companion_session::state::{SessionIdentity, StateStore};
use companion_session::{Error, Result, Session, SessionHandle, SessionParts};
use tokio::sync::mpsc;

/// Records outbound messages; drops them while closed
pub struct FakeSink {
    open: AtomicBool,
    sent: Mutex<Vec<ClientMessage>>,
}

impl FakeSink {
    pub fn new(open: bool) -> Self {
        Self {
            open: AtomicBool::new(open),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().unwrap().clone()
    }
}

impl PeerSink for FakeSink {
    fn send(&self, message: ClientMessage) -> bool {
        if !self.is_open() {
            return false;
        }
        self.sent.lock().unwrap().push(message);
        true
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Microphone that yields scripted sample batches, then silence
pub struct FakeMic {
    batches: Arc<Mutex<VecDeque<Vec<f32>>>>,
    unavailable: bool,
    pub opens: AtomicUsize,
}

impl FakeMic {
    pub fn new(batches: Vec<Vec<f32>>) -> Self {
        Self {
            batches: Arc::new(Mutex::new(batches.into())),
            unavailable: false,
            opens: AtomicUsize::new(0),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::new(Vec::new())
        }
    }
}

struct FakeStream {
    batches: Arc<Mutex<VecDeque<Vec<f32>>>>,
}

#[async_trait]
impl MicrophoneSource for FakeMic {
    async fn open(&self) -> Result<Box<dyn InputStream>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.unavailable {
            return Err(Error::DeviceUnavailable("permission denied".to_string()));
        }
        Ok(Box::new(FakeStream {
            batches: Arc::clone(&self.batches),
        }))
    }
}

impl InputStream for FakeStream {
    fn sample_rate(&self) -> u32 {
        16_000
    }

    fn drain(&mut self) -> Vec<f32> {
        self.batches.lock().unwrap().pop_front().unwrap_or_default()
    }

    fn stop(&mut self) {}
}

/// Records uploads and answers with a fixed result
#[derive(Default)]
pub struct FakeUploader {
    uploads: Mutex<Vec<(usize, String)>>,
    pub failure: Option<String>,
}

impl FakeUploader {
    pub fn failing(reason: &str) -> Self {
        Self {
            failure: Some(reason.to_string()),
            ..Self::default()
        }
    }

    pub fn uploads(&self) -> Vec<(usize, String)> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl Uploader for FakeUploader {
    async fn upload(&self, wav: Vec<u8>, session_id: &str) -> Result<()> {
        self.uploads
            .lock()
            .unwrap()
            .push((wav.len(), session_id.to_string()));
        match &self.failure {
            Some(reason) => Err(Error::UploadFailed {
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Speech audio that plays for a fixed span
pub struct FakeSpeech {
    span: Duration,
    played: Mutex<Vec<String>>,
    pub stops: AtomicUsize,
}

impl FakeSpeech {
    pub fn new(span: Duration) -> Self {
        Self {
            span,
            played: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
        }
    }

    pub fn played(&self) -> Vec<String> {
        self.played.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechOutput for FakeSpeech {
    async fn play(&self, url: &str) -> Result<()> {
        self.played.lock().unwrap().push(url.to_string());
        tokio::time::sleep(self.span).await;
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// A session wired to fakes, driven one event at a time
pub struct Harness {
    pub session: Session,
    pub handle: SessionHandle,
    pub events: mpsc::UnboundedSender<ChannelEvent>,
    pub sink: Arc<FakeSink>,
    pub mic: Arc<FakeMic>,
    pub uploader: Arc<FakeUploader>,
    pub speech: Arc<FakeSpeech>,
    pub store: StateStore,
}

/// Builds a [`Harness`]
pub struct HarnessBuilder {
    open: bool,
    session_id: Option<String>,
    mic: FakeMic,
    uploader: FakeUploader,
    speech_span: Duration,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            open: true,
            session_id: Some("sess-1".to_string()),
            mic: FakeMic::new(Vec::new()),
            uploader: FakeUploader::default(),
            speech_span: Duration::from_secs(3),
        }
    }
}

impl HarnessBuilder {
    pub fn closed(mut self) -> Self {
        self.open = false;
        self
    }

    pub fn without_session(mut self) -> Self {
        self.session_id = None;
        self
    }

    pub fn mic(mut self, mic: FakeMic) -> Self {
        self.mic = mic;
        self
    }

    pub fn uploader(mut self, uploader: FakeUploader) -> Self {
        self.uploader = uploader;
        self
    }

    pub fn build(self) -> Harness {
        let sink = Arc::new(FakeSink::new(self.open));
        let mic = Arc::new(self.mic);
        let uploader = Arc::new(self.uploader);
        let speech = Arc::new(FakeSpeech::new(self.speech_span));
        let store = StateStore::in_memory(SessionIdentity {
            session_id: self.session_id,
            pack_id: "default".to_string(),
        });
        let (events, channel_events) = mpsc::unbounded_channel();

        let sink_dyn: Arc<dyn PeerSink> = sink.clone();
        let mic_dyn: Arc<dyn MicrophoneSource> = mic.clone();
        let uploader_dyn: Arc<dyn Uploader> = uploader.clone();
        let speech_dyn: Arc<dyn SpeechOutput> = speech.clone();

        let (session, handle) = Session::new(SessionParts {
            sink: sink_dyn,
            channel_events,
            microphone: mic_dyn,
            uploader: uploader_dyn,
            speech: speech_dyn,
            store: store.clone(),
            capture: CaptureConfig::new(
                "http://127.0.0.1:8000/api/upload_audio".parse().unwrap(),
            ),
        });

        Harness {
            session,
            handle,
            events,
            sink,
            mic,
            uploader,
            speech,
            store,
        }
    }
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    /// Deliver a channel event and handle it
    pub async fn channel(&mut self, event: ChannelEvent) {
        self.events.send(event).unwrap();
        assert!(self.session.step().await);
    }

    /// Deliver a peer message and handle it
    pub async fn deliver(&mut self, message: ServerMessage) {
        self.channel(ChannelEvent::Message(message)).await;
    }

    /// Submit an intent and handle it
    pub async fn intent(&mut self, intent: companion_session::UserIntent) {
        assert!(self.handle.send(intent));
        assert!(self.session.step().await);
    }

    /// Handle the next event, whatever produces it
    pub async fn step(&mut self) {
        assert!(self.session.step().await);
    }

    /// Connected and handshaken with default config
    pub async fn ready(&mut self) {
        self.channel(ChannelEvent::Connected).await;
        self.deliver(ServerMessage::HandshakeAck {
            session_id: "sess-1".to_string(),
            config: SessionConfig::default(),
        })
        .await;
    }

    /// True when no event arrives within `span` of virtual time
    pub async fn quiet_for(&mut self, span: Duration) -> bool {
        tokio::time::timeout(span, self.session.step()).await.is_err()
    }
}

pub fn status(state: PeerState) -> ServerMessage {
    ServerMessage::Status {
        state,
        text: None,
        image_url: None,
    }
}

pub fn speak(text: &str) -> ServerMessage {
    ServerMessage::Speak {
        text: text.to_string(),
        image_url: None,
        audio_url: None,
        duration: None,
    }
}

/// Samples loud enough to count as voice
pub fn voice(len: usize) -> Vec<f32> {
    (0..len).map(|i| if i % 2 == 0 { 0.3 } else { -0.3 }).collect()
}
