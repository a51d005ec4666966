//! Error types for the companion session core

use thiserror::Error;

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the session core
///
/// None of these are fatal: the session loop surfaces each one to the user
/// and returns to an interactive state.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Microphone permission denied or no input device present
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Capture finished without a single buffered chunk
    #[error("no audio data captured")]
    NoAudioCaptured,

    /// Captured utterance could not be delivered to the upload endpoint
    #[error("upload failed: {reason}")]
    UploadFailed { reason: String },

    /// Error reported by the session peer
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Transport to the session peer closed
    #[error("transport dropped: {0}")]
    TransportDropped(String),

    /// Audio device or decoding error
    #[error("audio error: {0}")]
    Audio(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WebSocket error
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    /// URL parsing error
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(e))
    }
}

impl Error {
    /// Text shown on the user-visible surface for this error
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::DeviceUnavailable(_) => "Could not access microphone".to_string(),
            Self::NoAudioCaptured => "Error: No audio data captured".to_string(),
            Self::UploadFailed { reason } => format!("Error uploading audio: {reason}"),
            Self::Protocol { message } => format!("Error: {message}"),
            Self::TransportDropped(_) => "Disconnected from server, reconnecting...".to_string(),
            other => format!("Error: {other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_messages() {
        assert_eq!(
            Error::NoAudioCaptured.user_message(),
            "Error: No audio data captured"
        );
        assert_eq!(
            Error::UploadFailed {
                reason: "Invalid session".to_string()
            }
            .user_message(),
            "Error uploading audio: Invalid session"
        );
        assert_eq!(
            Error::Protocol {
                message: "pack missing".to_string()
            }
            .user_message(),
            "Error: pack missing"
        );
        assert_eq!(
            Error::DeviceUnavailable("denied".to_string()).user_message(),
            "Could not access microphone"
        );
        assert_eq!(
            Error::TransportDropped("closed by peer".to_string()).user_message(),
            "Disconnected from server, reconnecting..."
        );
    }
}
