//! TOML configuration file loading
//!
//! Supports `~/.config/omni/companion/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct CompanionConfigFile {
    /// Session peer location
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Session defaults
    #[serde(default)]
    pub session: SessionFileConfig,

    /// Microphone capture tuning
    #[serde(default)]
    pub capture: CaptureFileConfig,

    /// Transport tuning
    #[serde(default)]
    pub channel: ChannelFileConfig,
}

/// Server configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// Base URL of the companion server (e.g. "http://127.0.0.1:8000")
    pub url: Option<String>,
}

/// Session defaults
#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    /// Pack to request on handshake
    pub pack_id: Option<String>,

    /// Override for the state directory
    pub data_dir: Option<String>,
}

/// Capture defaults, used until the peer sends its own limits
#[derive(Debug, Default, Deserialize)]
pub struct CaptureFileConfig {
    pub max_duration_secs: Option<f64>,
    pub silence_threshold_secs: Option<f64>,

    /// RMS level above which input counts as voice
    pub energy_threshold: Option<f32>,
}

/// Transport configuration
#[derive(Debug, Default, Deserialize)]
pub struct ChannelFileConfig {
    pub reconnect_delay_secs: Option<f64>,
    pub ping_interval_secs: Option<f64>,
}

/// Path of the config file, if a config directory can be determined
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "omni", "omni")
        .map(|d| d.config_dir().join("companion").join("config.toml"))
}

/// Load the config file from its default location
///
/// A missing file yields an empty overlay; a file that fails to parse is
/// logged and ignored.
#[must_use]
pub fn load_config_file() -> CompanionConfigFile {
    let Some(path) = config_file_path() else {
        return CompanionConfigFile::default();
    };
    if !path.exists() {
        return CompanionConfigFile::default();
    }

    match read_config_file(&path) {
        Ok(file) => {
            tracing::info!(path = %path.display(), "loaded config file");
            file
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to load config file");
            CompanionConfigFile::default()
        }
    }
}

/// Parse a config file at an explicit path
///
/// # Errors
///
/// Returns error if the file cannot be read or is not valid TOML
pub fn read_config_file(path: &Path) -> Result<CompanionConfigFile> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[server]\nurl = \"http://pet.local:9000\"\n\n[capture]\nsilence_threshold_secs = 1.5\n",
        )
        .unwrap();

        let file = read_config_file(&path).unwrap();
        assert_eq!(file.server.url.as_deref(), Some("http://pet.local:9000"));
        assert_eq!(file.capture.silence_threshold_secs, Some(1.5));
        assert!(file.capture.max_duration_secs.is_none());
        assert!(file.session.pack_id.is_none());
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server\nurl = ").unwrap();
        assert!(read_config_file(&path).is_err());
    }
}
