//! Configuration management for the companion client

pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use self::file::CompanionConfigFile;
use crate::{Error, Result};

/// Server contacted when nothing else is configured
pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8000";

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the companion server
    pub server_url: Url,

    /// Pack requested explicitly (CLI, env or file); overrides the persisted pack
    pub pack_id: Option<String>,

    /// Directory holding `state.json`
    pub data_dir: PathBuf,

    /// Transport configuration
    pub channel: ChannelConfig,

    /// Capture configuration
    pub capture: CaptureConfig,
}

/// Session channel configuration
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// WebSocket endpoint
    pub url: Url,

    /// Fixed delay before each reconnect attempt
    pub reconnect_delay: Duration,

    /// Keep-alive cadence while open
    pub ping_interval: Duration,
}

/// Capture pipeline configuration
///
/// `max_duration` and `silence_threshold` are pre-handshake defaults; the
/// peer's session config takes over once it arrives.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Upload endpoint for finished utterances
    pub upload_url: Url,

    pub max_duration: Duration,
    pub silence_threshold: Duration,

    /// RMS level above which input counts as voice
    pub energy_threshold: f32,

    /// Voice-activity sampling cadence
    pub monitor_interval: Duration,

    /// Debounce before an utterance is finalized
    pub finalize_delay: Duration,
}

/// Values supplied on the command line
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub server_url: Option<String>,
    pub pack_id: Option<String>,
}

impl ChannelConfig {
    /// Default reconnect delay
    pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

    /// Default keep-alive cadence
    pub const PING_INTERVAL: Duration = Duration::from_secs(30);

    /// Defaults for a WebSocket endpoint
    #[must_use]
    pub const fn new(url: Url) -> Self {
        Self {
            url,
            reconnect_delay: Self::RECONNECT_DELAY,
            ping_interval: Self::PING_INTERVAL,
        }
    }
}

impl CaptureConfig {
    /// Default RMS voice threshold
    pub const ENERGY_THRESHOLD: f32 = 0.01;

    /// Default voice-activity sampling cadence
    pub const MONITOR_INTERVAL: Duration = Duration::from_millis(100);

    /// Default finalize debounce
    pub const FINALIZE_DELAY: Duration = Duration::from_millis(100);

    /// Defaults for an upload endpoint
    #[must_use]
    pub const fn new(upload_url: Url) -> Self {
        Self {
            upload_url,
            max_duration: Duration::from_secs(60),
            silence_threshold: Duration::from_secs(1),
            energy_threshold: Self::ENERGY_THRESHOLD,
            monitor_interval: Self::MONITOR_INTERVAL,
            finalize_delay: Self::FINALIZE_DELAY,
        }
    }
}

impl ClientConfig {
    /// Load configuration
    ///
    /// Priority: CLI flag → environment variable → config file → default.
    ///
    /// # Errors
    ///
    /// Returns error if the server URL is invalid
    pub fn load(cli: CliOverrides) -> Result<Self> {
        Self::load_with_file(cli, file::load_config_file())
    }

    /// Load configuration on top of an already-parsed config file
    ///
    /// # Errors
    ///
    /// Returns error if the server URL is invalid
    pub fn load_with_file(cli: CliOverrides, file: CompanionConfigFile) -> Result<Self> {
        let server = cli
            .server_url
            .or_else(|| std::env::var("COMPANION_SERVER_URL").ok())
            .or(file.server.url)
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());
        let server_url = Url::parse(&server)
            .map_err(|e| Error::Config(format!("invalid server url {server:?}: {e}")))?;

        let pack_id = cli
            .pack_id
            .or_else(|| std::env::var("COMPANION_PACK_ID").ok())
            .or(file.session.pack_id)
            .filter(|p| !p.is_empty());

        let data_dir = std::env::var("COMPANION_DATA_DIR")
            .ok()
            .or(file.session.data_dir)
            .map_or_else(default_data_dir, PathBuf::from);

        let mut channel = ChannelConfig::new(websocket_url(&server_url)?);
        if let Some(delay) = positive_duration(file.channel.reconnect_delay_secs) {
            channel.reconnect_delay = delay;
        }
        if let Some(interval) = positive_duration(file.channel.ping_interval_secs) {
            channel.ping_interval = interval;
        }

        let mut capture = CaptureConfig::new(server_url.join("/upload_audio")?);
        if let Some(max) = positive_duration(file.capture.max_duration_secs) {
            capture.max_duration = max;
        }
        if let Some(silence) = positive_duration(file.capture.silence_threshold_secs) {
            capture.silence_threshold = silence;
        }
        if let Some(threshold) = file.capture.energy_threshold.filter(|t| *t > 0.0) {
            capture.energy_threshold = threshold;
        }

        Ok(Self {
            server_url,
            pack_id,
            data_dir,
            channel,
            capture,
        })
    }
}

/// Derive the WebSocket endpoint (`/ws`) from the server base URL
///
/// # Errors
///
/// Returns error if the scheme is not http(s) or ws(s)
pub fn websocket_url(server_url: &Url) -> Result<Url> {
    let scheme = match server_url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(Error::Config(format!("unsupported server scheme: {other}")));
        }
    };

    let mut url = server_url.join("/ws")?;
    url.set_scheme(scheme)
        .map_err(|()| Error::Config(format!("cannot use scheme {scheme} for {server_url}")))?;
    Ok(url)
}

/// Return the data directory for client state
///
/// Uses `~/.local/share/omni/companion/` on Linux
#[must_use]
pub fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("dev", "omni", "omni")
        .map_or_else(|| PathBuf::from(".companion"), |d| d.data_dir().join("companion"))
}

fn positive_duration(secs: Option<f64>) -> Option<Duration> {
    secs.filter(|s| s.is_finite() && *s > 0.0)
        .map(Duration::from_secs_f64)
}
