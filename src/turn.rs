//! Turn-taking state machine
//!
//! Single source of truth for whose turn it is, which input affordances are
//! enabled, and what the character display shows. All session flags live in
//! [`TurnMachine`] and change only through [`TurnMachine::apply`].

use crate::Error;
use crate::protocol::PeerState;

const THINKING_TEXT: &str = "Thinking...";
const LISTENING_TEXT: &str = "Listening...";
const PROCESSING_TEXT: &str = "Processing...";
const DISCONNECTED_REASON: &str = "connection to server lost";

/// Whose turn it is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnState {
    #[default]
    Idle,
    Listening,
    Thinking,
    Speaking,
    Busy,
    Error,
}

/// Connectivity / activity indicator shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Indicator {
    Connected,
    #[default]
    Disconnected,
    Thinking,
    Busy,
    Recording,
}

impl Indicator {
    /// Short label for the indicator
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Thinking => "thinking",
            Self::Busy => "busy",
            Self::Recording => "recording",
        }
    }
}

/// Enabled input controls
///
/// Text input and the send button are coupled; the microphone has its own rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Affordances {
    keyboard: bool,
    mic: bool,
}

impl Affordances {
    /// Everything enabled
    pub const UNLOCKED: Self = Self {
        keyboard: true,
        mic: true,
    };

    /// Everything disabled
    pub const LOCKED: Self = Self {
        keyboard: false,
        mic: false,
    };

    #[must_use]
    pub const fn text_input(self) -> bool {
        self.keyboard
    }

    #[must_use]
    pub const fn send(self) -> bool {
        self.keyboard
    }

    #[must_use]
    pub const fn mic(self) -> bool {
        self.mic
    }

    /// True when no control is enabled
    #[must_use]
    pub const fn is_locked(self) -> bool {
        !self.keyboard && !self.mic
    }

    /// True when every control is enabled
    #[must_use]
    pub const fn is_unlocked(self) -> bool {
        self.keyboard && self.mic
    }
}

impl Default for Affordances {
    fn default() -> Self {
        Self::UNLOCKED
    }
}

/// What the character area shows
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Display {
    /// Transient text (prompt, speech, transcription, error)
    pub text: String,

    /// Character image currently shown
    pub image_url: Option<String>,
}

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    /// `status` message from the peer
    Status {
        state: PeerState,
        text: Option<String>,
        image_url: Option<String>,
    },
    /// A playback episode began (immediate speech or a fired timer)
    SpeakStarted {
        text: String,
        image_url: Option<String>,
    },
    /// The in-flight playback episode completed
    PlaybackFinished,
    /// `error` message from the peer
    PeerError { message: String },
    /// Transport opened or closed
    Connectivity { connected: bool },
    /// Handshake acknowledged
    SessionReady { image_url: Option<String> },
    /// Outfit switch confirmed
    OutfitChanged { image_url: Option<String> },
    /// Recognized text arrived
    Transcription { text: String },
    /// User sent typed text
    TextSubmitted,
    /// User asked for a pack switch
    PackSwitchRequested,
    /// Microphone acquisition in progress
    MicInitializing,
    /// Microphone acquisition failed; nothing else changes
    MicUnavailable,
    /// Capture is running
    CaptureStarted,
    /// Capture stopped; utterance is being finalized
    CaptureStopped,
    /// Capture ended without a delivered utterance
    CaptureFailed { message: String },
}

/// Owned session state, mutated only by [`TurnMachine::apply`]
#[derive(Debug, Clone, Default)]
pub struct TurnMachine {
    turn: TurnState,
    affordances: Affordances,
    indicator: Indicator,
    display: Display,
    connected: bool,
    speaking: bool,
    recording: bool,
    /// Image to restore when speech ends; updated only by idle status
    last_idle_image: Option<String>,
}

impl TurnMachine {
    /// Create a machine in the idle, disconnected state
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event
    pub fn apply(&mut self, event: TurnEvent) {
        let from = self.turn;

        match event {
            TurnEvent::Status {
                state,
                text,
                image_url,
            } => self.on_status(state, text, image_url),
            TurnEvent::SpeakStarted { text, image_url } => {
                self.speaking = true;
                self.turn = TurnState::Speaking;
                self.affordances = Affordances::LOCKED;
                self.display.text = text;
                if image_url.is_some() {
                    self.display.image_url = image_url;
                }
            }
            TurnEvent::PlaybackFinished => {
                if !self.speaking {
                    return;
                }
                self.speaking = false;
                self.turn = TurnState::Idle;
                self.affordances = Affordances::UNLOCKED;
                self.display.text.clear();
                if self.last_idle_image.is_some() {
                    self.display.image_url.clone_from(&self.last_idle_image);
                }
            }
            TurnEvent::PeerError { message } => {
                self.turn = TurnState::Error;
                self.display.text = Error::Protocol { message }.user_message();
                self.indicator = self.live_indicator();
                self.affordances = Affordances::UNLOCKED;
            }
            TurnEvent::Connectivity { connected } => {
                self.connected = connected;
                self.indicator = self.live_indicator();
                if !connected {
                    self.on_disconnect();
                }
            }
            TurnEvent::SessionReady { image_url } => {
                self.indicator = self.live_indicator();
                if image_url.is_some() {
                    self.display.image_url = image_url;
                }
            }
            TurnEvent::OutfitChanged { image_url } => {
                if image_url.is_some() {
                    self.display.image_url = image_url;
                }
            }
            TurnEvent::Transcription { text } => {
                self.display.text = text;
            }
            TurnEvent::TextSubmitted => {
                self.affordances = Affordances::LOCKED;
            }
            TurnEvent::PackSwitchRequested => {
                self.indicator = Indicator::Busy;
            }
            TurnEvent::MicInitializing => {
                self.affordances.mic = false;
            }
            TurnEvent::MicUnavailable => {
                if self.mic_allowed() {
                    self.affordances.mic = true;
                }
            }
            TurnEvent::CaptureStarted => {
                self.recording = true;
                self.indicator = Indicator::Recording;
                self.display.text = LISTENING_TEXT.to_string();
                self.affordances = Affordances {
                    keyboard: false,
                    mic: true,
                };
            }
            TurnEvent::CaptureStopped => {
                self.recording = false;
                self.display.text = PROCESSING_TEXT.to_string();
            }
            TurnEvent::CaptureFailed { message } => {
                self.recording = false;
                self.display.text = message;
                self.indicator = self.live_indicator();
                self.affordances = Affordances::UNLOCKED;
            }
        }

        if from != self.turn {
            tracing::debug!(from = ?from, to = ?self.turn, "turn transition");
        }
    }

    fn on_status(&mut self, state: PeerState, text: Option<String>, image_url: Option<String>) {
        match state {
            PeerState::Thinking => {
                self.turn = TurnState::Thinking;
                self.display.text = text.unwrap_or_else(|| THINKING_TEXT.to_string());
                self.affordances = Affordances::LOCKED;
                self.indicator = Indicator::Thinking;
                if image_url.is_some() {
                    self.display.image_url = image_url;
                }
            }
            PeerState::Listening => {
                self.turn = TurnState::Listening;
                self.indicator = if self.recording {
                    Indicator::Recording
                } else {
                    Indicator::Busy
                };
                if let Some(text) = text {
                    self.display.text = text;
                }
                self.affordances = Affordances {
                    keyboard: false,
                    mic: true,
                };
                if image_url.is_some() {
                    self.display.image_url = image_url;
                }
            }
            PeerState::Busy => {
                self.turn = TurnState::Busy;
                self.indicator = Indicator::Busy;
                self.affordances = Affordances::LOCKED;
            }
            PeerState::Idle => {
                self.indicator = Indicator::Connected;
                if let Some(image) = image_url {
                    if !self.speaking {
                        self.display.image_url = Some(image.clone());
                    }
                    self.last_idle_image = Some(image);
                }
                // Speech in flight keeps the lock until its own completion
                if !self.speaking {
                    self.turn = TurnState::Idle;
                    self.affordances = Affordances::UNLOCKED;
                }
            }
        }
    }

    /// Nothing answers a turn the peer was holding once the transport is gone
    fn on_disconnect(&mut self) {
        if self.speaking {
            return;
        }
        if matches!(
            self.turn,
            TurnState::Thinking | TurnState::Busy | TurnState::Listening
        ) {
            self.turn = TurnState::Idle;
        }
        if self.recording {
            self.affordances = Affordances {
                keyboard: false,
                mic: true,
            };
            return;
        }
        self.display.text = Error::TransportDropped(DISCONNECTED_REASON.to_string()).user_message();
        self.affordances = Affordances::UNLOCKED;
    }

    /// Whether the current turn lets the user open the microphone
    const fn mic_allowed(&self) -> bool {
        !self.speaking
            && matches!(
                self.turn,
                TurnState::Idle | TurnState::Listening | TurnState::Error
            )
    }

    const fn live_indicator(&self) -> Indicator {
        if self.connected {
            Indicator::Connected
        } else {
            Indicator::Disconnected
        }
    }

    #[must_use]
    pub const fn turn(&self) -> TurnState {
        self.turn
    }

    #[must_use]
    pub const fn affordances(&self) -> Affordances {
        self.affordances
    }

    #[must_use]
    pub const fn indicator(&self) -> Indicator {
        self.indicator
    }

    #[must_use]
    pub const fn display(&self) -> &Display {
        &self.display
    }

    /// Whether a playback episode is in flight
    #[must_use]
    pub const fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Whether the microphone is capturing
    #[must_use]
    pub const fn is_recording(&self) -> bool {
        self.recording
    }

    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.connected
    }

    #[must_use]
    pub fn last_idle_image(&self) -> Option<&str> {
        self.last_idle_image.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(state: PeerState) -> TurnEvent {
        TurnEvent::Status {
            state,
            text: None,
            image_url: None,
        }
    }

    fn connected_machine() -> TurnMachine {
        let mut machine = TurnMachine::new();
        machine.apply(TurnEvent::Connectivity { connected: true });
        machine
    }

    #[test]
    fn test_starts_idle_and_unlocked() {
        let machine = TurnMachine::new();
        assert_eq!(machine.turn(), TurnState::Idle);
        assert!(machine.affordances().is_unlocked());
        assert_eq!(machine.indicator(), Indicator::Disconnected);
    }

    #[test]
    fn test_thinking_locks_everything_and_shows_prompt() {
        let mut machine = connected_machine();
        machine.apply(status(PeerState::Thinking));

        assert_eq!(machine.turn(), TurnState::Thinking);
        assert!(machine.affordances().is_locked());
        assert_eq!(machine.display().text, "Thinking...");
        assert_eq!(machine.indicator(), Indicator::Thinking);

        machine.apply(TurnEvent::Status {
            state: PeerState::Thinking,
            text: Some("Hmm...".to_string()),
            image_url: Some("/think.png".to_string()),
        });
        assert_eq!(machine.display().text, "Hmm...");
        assert_eq!(machine.display().image_url.as_deref(), Some("/think.png"));
    }

    #[test]
    fn test_listening_keeps_mic_only() {
        let mut machine = connected_machine();
        machine.apply(status(PeerState::Listening));

        let affordances = machine.affordances();
        assert_eq!(machine.turn(), TurnState::Listening);
        assert!(!affordances.text_input());
        assert!(!affordances.send());
        assert!(affordances.mic());
        assert_eq!(machine.indicator(), Indicator::Busy);
    }

    #[test]
    fn test_listening_indicator_while_recording() {
        let mut machine = connected_machine();
        machine.apply(TurnEvent::CaptureStarted);
        machine.apply(status(PeerState::Listening));
        assert_eq!(machine.indicator(), Indicator::Recording);
    }

    #[test]
    fn test_busy_then_idle() {
        let mut machine = connected_machine();
        machine.apply(status(PeerState::Busy));
        assert_eq!(machine.turn(), TurnState::Busy);
        assert!(machine.affordances().is_locked());

        machine.apply(status(PeerState::Idle));
        assert_eq!(machine.turn(), TurnState::Idle);
        assert!(machine.affordances().is_unlocked());
        assert_eq!(machine.indicator(), Indicator::Connected);
    }

    #[test]
    fn test_idle_does_not_unlock_while_speaking() {
        let mut machine = connected_machine();
        machine.apply(TurnEvent::SpeakStarted {
            text: "Hello there".to_string(),
            image_url: Some("/talk.png".to_string()),
        });
        assert_eq!(machine.turn(), TurnState::Speaking);
        assert!(machine.affordances().is_locked());

        machine.apply(TurnEvent::Status {
            state: PeerState::Idle,
            text: None,
            image_url: Some("/idle.png".to_string()),
        });
        assert_eq!(machine.turn(), TurnState::Speaking);
        assert!(machine.affordances().is_locked());
        assert_eq!(machine.display().image_url.as_deref(), Some("/talk.png"));
        assert_eq!(machine.last_idle_image(), Some("/idle.png"));

        machine.apply(TurnEvent::PlaybackFinished);
        assert_eq!(machine.turn(), TurnState::Idle);
        assert!(machine.affordances().is_unlocked());
        assert!(machine.display().text.is_empty());
        assert_eq!(machine.display().image_url.as_deref(), Some("/idle.png"));
    }

    #[test]
    fn test_playback_finished_without_episode_is_ignored() {
        let mut machine = connected_machine();
        machine.apply(status(PeerState::Busy));
        machine.apply(TurnEvent::PlaybackFinished);
        assert_eq!(machine.turn(), TurnState::Busy);
        assert!(machine.affordances().is_locked());
    }

    #[test]
    fn test_speak_locks_regardless_of_prior_state() {
        let mut machine = connected_machine();
        machine.apply(status(PeerState::Listening));
        machine.apply(TurnEvent::SpeakStarted {
            text: "Hi".to_string(),
            image_url: None,
        });
        assert!(machine.affordances().is_locked());
        assert_eq!(machine.display().text, "Hi");
    }

    #[test]
    fn test_peer_error_unlocks_and_reflects_connectivity() {
        let mut machine = connected_machine();
        machine.apply(status(PeerState::Busy));
        machine.apply(TurnEvent::PeerError {
            message: "model offline".to_string(),
        });
        assert_eq!(machine.turn(), TurnState::Error);
        assert!(machine.affordances().is_unlocked());
        assert_eq!(machine.display().text, "Error: model offline");
        assert_eq!(machine.indicator(), Indicator::Connected);

        machine.apply(TurnEvent::Connectivity { connected: false });
        machine.apply(TurnEvent::PeerError {
            message: "again".to_string(),
        });
        assert_eq!(machine.indicator(), Indicator::Disconnected);
    }

    #[test]
    fn test_capture_lifecycle_display() {
        let mut machine = connected_machine();
        machine.apply(TurnEvent::MicInitializing);
        assert!(!machine.affordances().mic());
        assert!(machine.affordances().text_input());

        machine.apply(TurnEvent::CaptureStarted);
        assert!(machine.is_recording());
        assert_eq!(machine.display().text, "Listening...");
        assert!(machine.affordances().mic());
        assert!(!machine.affordances().send());

        machine.apply(TurnEvent::CaptureStopped);
        assert!(!machine.is_recording());
        assert_eq!(machine.display().text, "Processing...");

        machine.apply(TurnEvent::CaptureFailed {
            message: "Error: No audio data captured".to_string(),
        });
        assert!(machine.affordances().is_unlocked());
        assert_eq!(machine.display().text, "Error: No audio data captured");
        assert_eq!(machine.turn(), TurnState::Idle);
    }

    #[test]
    fn test_mic_unavailable_restores_mic_only() {
        let mut machine = connected_machine();
        machine.apply(TurnEvent::MicInitializing);
        machine.apply(TurnEvent::MicUnavailable);
        assert!(machine.affordances().is_unlocked());
        assert_eq!(machine.turn(), TurnState::Idle);
        assert!(machine.display().text.is_empty());
    }

    #[test]
    fn test_mic_unavailable_during_speech_keeps_mic_disabled() {
        let mut machine = connected_machine();
        machine.apply(TurnEvent::MicInitializing);
        machine.apply(TurnEvent::SpeakStarted {
            text: "Hold on".to_string(),
            image_url: None,
        });
        machine.apply(TurnEvent::MicUnavailable);
        assert_eq!(machine.turn(), TurnState::Speaking);
        assert!(!machine.affordances().mic());

        let mut machine = connected_machine();
        machine.apply(TurnEvent::MicInitializing);
        machine.apply(status(PeerState::Thinking));
        machine.apply(TurnEvent::MicUnavailable);
        assert!(!machine.affordances().mic());
    }

    #[test]
    fn test_disconnect_releases_locked_turn() {
        let mut machine = connected_machine();
        machine.apply(TurnEvent::SessionReady { image_url: None });
        machine.apply(status(PeerState::Thinking));

        machine.apply(TurnEvent::Connectivity { connected: false });
        assert_eq!(machine.turn(), TurnState::Idle);
        assert!(machine.affordances().is_unlocked());
        assert_eq!(
            machine.display().text,
            "Disconnected from server, reconnecting..."
        );
        assert_eq!(machine.indicator(), Indicator::Disconnected);

        machine.apply(TurnEvent::Connectivity { connected: true });
        machine.apply(TurnEvent::SessionReady { image_url: None });
        assert!(machine.affordances().is_unlocked());
    }

    #[test]
    fn test_disconnect_leaves_speech_locked() {
        let mut machine = connected_machine();
        machine.apply(TurnEvent::SpeakStarted {
            text: "Still talking".to_string(),
            image_url: None,
        });
        machine.apply(TurnEvent::Connectivity { connected: false });
        assert!(machine.is_speaking());
        assert_eq!(machine.turn(), TurnState::Speaking);
        assert!(machine.affordances().is_locked());
        assert_eq!(machine.display().text, "Still talking");

        machine.apply(TurnEvent::PlaybackFinished);
        assert!(machine.affordances().is_unlocked());
    }

    #[test]
    fn test_disconnect_after_text_submit_unlocks() {
        let mut machine = connected_machine();
        machine.apply(TurnEvent::TextSubmitted);
        machine.apply(TurnEvent::Connectivity { connected: false });
        assert!(machine.affordances().is_unlocked());
    }

    #[test]
    fn test_text_submit_locks_all() {
        let mut machine = connected_machine();
        machine.apply(TurnEvent::TextSubmitted);
        assert!(machine.affordances().is_locked());
    }
}
