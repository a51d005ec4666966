//! Message protocol spoken with the session peer
//!
//! Every frame is one JSON object with a `type` discriminator. Inbound frames
//! with an unrecognized `type` decode to [`ServerMessage::Unknown`] so peer
//! additions never break an older client.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Default seconds a speech text stays on screen before per-char time is added
pub const DEFAULT_BASE_DISPLAY_TIME: f64 = 2.0;

/// Default reading time per character, in seconds
pub const DEFAULT_TEXT_READ_SPEED: f64 = 0.2;

/// Default hard limit on a single capture, in seconds
pub const DEFAULT_STT_MAX_DURATION: f64 = 60.0;

/// Default silence span that ends a capture, in seconds
pub const DEFAULT_STT_SILENCE_THRESHOLD: f64 = 1.0;

/// Display text used when a timer task carries none
const DEFAULT_TIMER_TEXT: &str = "Time's up!";

/// Messages sent from the client to the peer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Open or resume a session
    Handshake {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        pack_id: String,
    },
    /// Change server-side settings (pack switch and pass-through keys)
    SettingsUpdate { settings: SettingsPatch },
    /// Switch the character outfit
    SetOutfit { outfit_id: String },
    /// Request the outfit catalog for the active pack
    GetOutfits,
    /// Tell the peer the user started speaking
    StartRecording,
    /// Typed user input
    TextInput { text: String },
    /// Keep-alive
    Ping,
}

/// Settings carried by a `settings_update`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SettingsPatch {
    /// Pack to switch to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_pack: Option<String>,

    /// Any other settings, forwarded unchanged
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Messages received from the peer
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Session established; carries the assigned id and configuration
    HandshakeAck {
        session_id: String,
        #[serde(default)]
        config: SessionConfig,
    },
    /// Outfit catalog for the active pack
    OutfitsList {
        #[serde(default)]
        pack_id: Option<String>,
        #[serde(default)]
        outfits: Vec<Outfit>,
        #[serde(default)]
        current_outfit: Option<String>,
    },
    /// Outfit switch confirmed
    OutfitChanged {
        outfit_id: String,
        #[serde(default)]
        image_url: Option<String>,
    },
    /// Peer-side turn status
    Status {
        state: PeerState,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        image_url: Option<String>,
    },
    /// Agent speech to present now
    Speak {
        text: String,
        #[serde(default)]
        image_url: Option<String>,
        #[serde(default)]
        audio_url: Option<String>,
        #[serde(default)]
        duration: Option<f64>,
    },
    /// Recognized text of the last upload
    Transcription { text: String },
    /// Agent speech to present at a future moment
    TimerEvent {
        #[serde(default)]
        task: TimerTask,
        #[serde(default)]
        trigger_at: Option<f64>,
    },
    /// Peer-reported error
    Error { message: String },
    /// Keep-alive reply
    Pong,
    /// Any message type this client does not know
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// Decode a text frame
    ///
    /// # Errors
    ///
    /// Returns error if the frame is not a JSON object or a known `type`
    /// carries malformed fields
    pub fn parse(text: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Wire name of the message, for logging
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::HandshakeAck { .. } => "handshake_ack",
            Self::OutfitsList { .. } => "outfits_list",
            Self::OutfitChanged { .. } => "outfit_changed",
            Self::Status { .. } => "status",
            Self::Speak { .. } => "speak",
            Self::Transcription { .. } => "transcription",
            Self::TimerEvent { .. } => "timer_event",
            Self::Error { .. } => "error",
            Self::Pong => "pong",
            Self::Unknown => "unknown",
        }
    }
}

/// `state` field of a `status` message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum PeerState {
    Thinking,
    Listening,
    Busy,
    /// `idle` and every state this client does not know
    Idle,
}

impl From<String> for PeerState {
    fn from(value: String) -> Self {
        match value.as_str() {
            "thinking" => Self::Thinking,
            "listening" => Self::Listening,
            "busy" => Self::Busy,
            _ => Self::Idle,
        }
    }
}

/// Session configuration pushed by the peer
///
/// Replaced wholesale on every handshake acknowledgement.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(alias = "basedisplaytime")]
    pub base_display_time: f64,

    /// Seconds per character
    #[serde(alias = "textreadspeed")]
    pub text_read_speed: f64,

    #[serde(alias = "sttmaxduration")]
    pub stt_max_duration: f64,

    #[serde(alias = "sttsilencethreshold")]
    pub stt_silence_threshold: f64,

    #[serde(alias = "activepack")]
    pub active_pack: Option<String>,

    #[serde(alias = "availablepacks")]
    pub available_packs: Vec<PackInfo>,

    #[serde(alias = "defaultoutfit")]
    pub default_outfit: Option<String>,

    #[serde(alias = "characterName")]
    pub character_name: Option<String>,

    pub initial_image_url: Option<String>,

    pub pack_metadata: Option<PackMetadata>,

    pub sovits_enabled: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_display_time: DEFAULT_BASE_DISPLAY_TIME,
            text_read_speed: DEFAULT_TEXT_READ_SPEED,
            stt_max_duration: DEFAULT_STT_MAX_DURATION,
            stt_silence_threshold: DEFAULT_STT_SILENCE_THRESHOLD,
            active_pack: None,
            available_packs: Vec::new(),
            default_outfit: None,
            character_name: None,
            initial_image_url: None,
            pack_metadata: None,
            sovits_enabled: false,
        }
    }
}

impl SessionConfig {
    /// Hard capture limit, falling back to the default for non-positive values
    #[must_use]
    pub fn max_capture(&self) -> Duration {
        positive_secs(self.stt_max_duration, DEFAULT_STT_MAX_DURATION)
    }

    /// Silence span that ends a capture
    #[must_use]
    pub fn silence_threshold(&self) -> Duration {
        positive_secs(self.stt_silence_threshold, DEFAULT_STT_SILENCE_THRESHOLD)
    }

    /// Image to show right after a handshake
    ///
    /// Uses the peer-resolved image when present, otherwise the first sprite
    /// of the default outfit.
    #[must_use]
    pub fn initial_image(&self) -> Option<String> {
        if let Some(url) = &self.initial_image_url {
            return Some(url.clone());
        }
        match (&self.active_pack, &self.default_outfit) {
            (Some(pack), Some(outfit)) => {
                Some(format!("/packs/{pack}/assets/sprites/{outfit}/000.png"))
            }
            _ => None,
        }
    }
}

fn positive_secs(value: f64, fallback: f64) -> Duration {
    let secs = if value.is_finite() && value > 0.0 {
        value
    } else {
        fallback
    };
    Duration::from_secs_f64(secs)
}

/// Entry of `available_packs`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PackInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl PackInfo {
    /// Display label, falling back to the id
    #[must_use]
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Descriptive metadata of the active pack
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PackMetadata {
    pub name: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub version: Option<String>,
}

/// Entry of `outfits_list`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Outfit {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub path: Option<String>,
}

impl Outfit {
    /// Display label, falling back to the id
    #[must_use]
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Task carried by a `timer_event`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TimerTask {
    pub id: Option<String>,
    pub text_display: Option<String>,
    pub text_tts: Option<String>,
    pub image_url: Option<String>,
    pub audio_url: Option<String>,
    pub duration: Option<f64>,
    /// Unix seconds
    pub due_at: Option<f64>,
    pub emotion: Option<String>,
}

/// One agent speech episode: text plus optional audio, image and timing hint
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechTask {
    pub text_display: String,
    pub text_audio_cue: Option<String>,
    /// Seconds, as hinted by the peer
    pub duration_hint: Option<f64>,
    pub audio_url: Option<String>,
    pub image_url: Option<String>,
}

impl SpeechTask {
    /// Build the task for an immediate `speak` message
    #[must_use]
    pub fn from_speak(
        text: String,
        image_url: Option<String>,
        audio_url: Option<String>,
        duration: Option<f64>,
    ) -> Self {
        Self {
            text_display: text,
            text_audio_cue: None,
            duration_hint: duration,
            audio_url,
            image_url,
        }
    }

    /// Positive duration hint, if the peer supplied one
    #[must_use]
    pub fn positive_duration(&self) -> Option<f64> {
        self.duration_hint
            .filter(|d| d.is_finite() && *d > 0.0)
    }
}

/// A speech task to fire at a wall-clock moment
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredTask {
    pub id: String,
    pub trigger_at: DateTime<Utc>,
    pub payload: SpeechTask,
}

impl DeferredTask {
    /// Build from a `timer_event`
    ///
    /// The trigger is `trigger_at`, else the task's `due_at`, else `now`. A task
    /// without an id is identified by its trigger and text, so a replayed
    /// notification maps to the same identity.
    #[must_use]
    pub fn from_timer_event(task: TimerTask, trigger_at: Option<f64>, now: DateTime<Utc>) -> Self {
        let trigger_secs = trigger_at.or(task.due_at);
        let cue_text = task
            .text_display
            .clone()
            .filter(|t| !t.is_empty())
            .or_else(|| task.text_tts.clone().filter(|t| !t.is_empty()));

        let id = task.id.clone().filter(|id| !id.is_empty()).unwrap_or_else(|| {
            let trigger = trigger_secs.map(|t| t.to_string()).unwrap_or_default();
            format!("{trigger}-{}", cue_text.as_deref().unwrap_or_default())
        });

        let trigger_at = trigger_secs.and_then(unix_secs_to_utc).unwrap_or(now);

        Self {
            id,
            trigger_at,
            payload: SpeechTask {
                text_display: cue_text.unwrap_or_else(|| DEFAULT_TIMER_TEXT.to_string()),
                text_audio_cue: task.text_tts,
                duration_hint: task.duration,
                audio_url: task.audio_url,
                image_url: task.image_url,
            },
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn unix_secs_to_utc(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    let millis = (secs * 1000.0).round() as i64;
    Utc.timestamp_millis_opt(millis).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_serialization() {
        let fresh = ClientMessage::Handshake {
            session_id: None,
            pack_id: "default".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&fresh).unwrap(),
            serde_json::json!({"type": "handshake", "pack_id": "default"})
        );

        let resumed = ClientMessage::Handshake {
            session_id: Some("abc".to_string()),
            pack_id: "luna".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&resumed).unwrap(),
            serde_json::json!({"type": "handshake", "session_id": "abc", "pack_id": "luna"})
        );
    }

    #[test]
    fn test_unit_messages_serialize_with_type_only() {
        assert_eq!(
            serde_json::to_string(&ClientMessage::GetOutfits).unwrap(),
            r#"{"type":"get_outfits"}"#
        );
        assert_eq!(
            serde_json::to_string(&ClientMessage::StartRecording).unwrap(),
            r#"{"type":"start_recording"}"#
        );
    }

    #[test]
    fn test_settings_patch_flattens_extra_keys() {
        let mut extra = serde_json::Map::new();
        extra.insert("volume".to_string(), serde_json::json!(0.5));
        let msg = ClientMessage::SettingsUpdate {
            settings: SettingsPatch {
                active_pack: Some("luna".to_string()),
                extra,
            },
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            serde_json::json!({
                "type": "settings_update",
                "settings": {"active_pack": "luna", "volume": 0.5}
            })
        );
    }

    #[test]
    fn test_handshake_ack_parsing() {
        let msg = ServerMessage::parse(
            r#"{"type":"handshake_ack","session_id":"abc","config":{
                "active_pack":"default",
                "available_packs":[{"id":"default","name":"Default"}],
                "text_read_speed":0.1
            }}"#,
        )
        .unwrap();

        let ServerMessage::HandshakeAck { session_id, config } = msg else {
            panic!("expected handshake_ack");
        };
        assert_eq!(session_id, "abc");
        assert_eq!(config.active_pack.as_deref(), Some("default"));
        assert_eq!(config.available_packs[0].label(), "Default");
        assert!((config.text_read_speed - 0.1).abs() < f64::EPSILON);
        assert!((config.base_display_time - DEFAULT_BASE_DISPLAY_TIME).abs() < f64::EPSILON);
    }

    #[test]
    fn test_handshake_ack_with_null_pack_metadata_fields() {
        let msg = ServerMessage::parse(
            r#"{"type":"handshake_ack","session_id":"abc","config":{
                "active_pack":"luna",
                "pack_metadata":{"name":"Luna","description":null,"author":null}
            }}"#,
        )
        .unwrap();

        let ServerMessage::HandshakeAck { session_id, config } = msg else {
            panic!("expected handshake_ack");
        };
        assert_eq!(session_id, "abc");
        let metadata = config.pack_metadata.unwrap();
        assert_eq!(metadata.name.as_deref(), Some("Luna"));
        assert_eq!(metadata.description, None);
        assert_eq!(metadata.version, None);
    }

    #[test]
    fn test_config_accepts_compressed_aliases() {
        let config: SessionConfig = serde_json::from_str(
            r#"{"basedisplaytime":3.0,"sttsilencethreshold":2.5,"characterName":"Luna"}"#,
        )
        .unwrap();
        assert!((config.base_display_time - 3.0).abs() < f64::EPSILON);
        assert_eq!(config.silence_threshold(), Duration::from_millis(2500));
        assert_eq!(config.character_name.as_deref(), Some("Luna"));
    }

    #[test]
    fn test_non_positive_capture_limits_fall_back() {
        let config = SessionConfig {
            stt_max_duration: 0.0,
            stt_silence_threshold: -1.0,
            ..SessionConfig::default()
        };
        assert_eq!(config.max_capture(), Duration::from_secs(60));
        assert_eq!(config.silence_threshold(), Duration::from_secs(1));
    }

    #[test]
    fn test_initial_image() {
        let mut config = SessionConfig {
            active_pack: Some("luna".to_string()),
            default_outfit: Some("casual".to_string()),
            ..SessionConfig::default()
        };
        assert_eq!(
            config.initial_image().as_deref(),
            Some("/packs/luna/assets/sprites/casual/000.png")
        );

        config.initial_image_url = Some("/packs/luna/smile.png".to_string());
        assert_eq!(config.initial_image().as_deref(), Some("/packs/luna/smile.png"));

        assert_eq!(SessionConfig::default().initial_image(), None);
    }

    #[test]
    fn test_unknown_type_is_tolerated() {
        let msg = ServerMessage::parse(r#"{"type":"confetti","amount":3}"#).unwrap();
        assert_eq!(msg, ServerMessage::Unknown);
    }

    #[test]
    fn test_unknown_status_state_maps_to_idle() {
        let msg = ServerMessage::parse(r#"{"type":"status","state":"dozing"}"#).unwrap();
        assert!(matches!(msg, ServerMessage::Status { state: PeerState::Idle, .. }));
    }

    #[test]
    fn test_malformed_known_type_is_an_error() {
        assert!(ServerMessage::parse(r#"{"type":"speak"}"#).is_err());
        assert!(ServerMessage::parse("not json").is_err());
    }

    #[test]
    fn test_timer_task_identity_and_defaults() {
        let now = Utc::now();

        let explicit = DeferredTask::from_timer_event(
            TimerTask {
                id: Some("timer_1".to_string()),
                text_tts: Some("okiro".to_string()),
                due_at: Some(1_700_000_000.0),
                ..TimerTask::default()
            },
            None,
            now,
        );
        assert_eq!(explicit.id, "timer_1");
        assert_eq!(explicit.payload.text_display, "okiro");
        assert_eq!(explicit.trigger_at.timestamp(), 1_700_000_000);

        let derived = DeferredTask::from_timer_event(
            TimerTask {
                text_display: Some("Wake up".to_string()),
                ..TimerTask::default()
            },
            Some(1_700_000_010.5),
            now,
        );
        assert_eq!(derived.id, "1700000010.5-Wake up");
        assert_eq!(derived.trigger_at.timestamp_millis(), 1_700_000_010_500);

        let bare = DeferredTask::from_timer_event(TimerTask::default(), None, now);
        assert_eq!(bare.payload.text_display, "Time's up!");
        assert_eq!(bare.trigger_at, now);
        assert_eq!(bare.id, "-");
    }

    #[test]
    fn test_speech_task_positive_duration() {
        let mut task = SpeechTask::from_speak("Hi".to_string(), None, None, Some(0.0));
        assert_eq!(task.positive_duration(), None);
        task.duration_hint = Some(5.0);
        assert_eq!(task.positive_duration(), Some(5.0));
    }
}
