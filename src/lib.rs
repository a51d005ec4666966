//! Companion Session - client-side session core for a voice and text companion
//!
//! This library keeps one conversation session with a remote agent and
//! arbitrates turn-taking between:
//! - User speech capture (microphone, silence detection, upload)
//! - Typed user input
//! - Agent speech playback (text, optional audio, timed unlock)
//! - Agent-initiated timers that interrupt the idle state
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │            UI collaborator (renders ViewState)       │
//! └──────────────┬───────────────────────▲──────────────┘
//!        intents │                       │ view / alerts
//! ┌──────────────▼───────────────────────┴──────────────┐
//! │                 Session (single writer)              │
//! │   TurnMachine │ Capture │ Playback │ Deferred timers │
//! └──────────────┬──────────────────────────────────────┘
//!                │
//! ┌──────────────▼──────────────────────────────────────┐
//! │   Session channel (WebSocket)  │  Upload (HTTP)      │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod capture;
pub mod channel;
pub mod config;
pub mod deferred;
pub mod error;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod state;
pub mod turn;
pub mod view;
pub mod voice;

pub use capture::{CapturePipeline, InputStream, MicrophoneSource, Uploader};
pub use channel::{ChannelEvent, ChannelHandle, PeerSink, SessionChannel};
pub use config::ClientConfig;
pub use deferred::DeferredRegistry;
pub use error::{Error, Result};
pub use playback::{PlaybackScheduler, SpeechOutput};
pub use protocol::{ClientMessage, ServerMessage, SessionConfig, SpeechTask};
pub use session::{Session, SessionHandle, SessionParts, UserIntent};
pub use state::{SessionIdentity, StateStore};
pub use turn::{Affordances, Indicator, TurnEvent, TurnMachine, TurnState};
pub use view::{Catalog, ViewState};
