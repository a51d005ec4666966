//! Persisted client state
//!
//! Keeps the peer-assigned `session_id` and the selected `pack_id` in
//! `state.json` so a session resumes across reconnects and restarts.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::Result;

/// Pack used when nothing has been selected yet
pub const DEFAULT_PACK_ID: &str = "default";

const STATE_FILE: &str = "state.json";

/// Identity presented in every handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    /// Assigned by the peer on handshake acknowledgement
    pub session_id: Option<String>,
    pub pack_id: String,
}

impl Default for SessionIdentity {
    fn default() -> Self {
        Self {
            session_id: None,
            pack_id: DEFAULT_PACK_ID.to_string(),
        }
    }
}

/// Shared handle to the persisted identity
///
/// Cloning yields another handle to the same state. Every mutation is written
/// through to disk when a path is configured; write failures are logged and
/// the in-memory value stays authoritative.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: Option<PathBuf>,
    identity: Arc<Mutex<SessionIdentity>>,
}

impl StateStore {
    /// Open the store in `data_dir`, loading any existing state
    ///
    /// A missing or corrupt file yields defaults.
    #[must_use]
    pub fn open(data_dir: &Path) -> Self {
        let path = data_dir.join(STATE_FILE);
        let identity = load(&path);

        tracing::debug!(
            path = %path.display(),
            session_id = ?identity.session_id,
            pack_id = %identity.pack_id,
            "loaded client state"
        );

        Self {
            path: Some(path),
            identity: Arc::new(Mutex::new(identity)),
        }
    }

    /// In-memory store that never touches disk
    #[must_use]
    pub fn in_memory(identity: SessionIdentity) -> Self {
        Self {
            path: None,
            identity: Arc::new(Mutex::new(identity)),
        }
    }

    /// Current identity snapshot
    #[must_use]
    pub fn identity(&self) -> SessionIdentity {
        self.lock().clone()
    }

    /// Current session id, if one has been assigned
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.lock().session_id.clone()
    }

    /// Current pack id
    #[must_use]
    pub fn pack_id(&self) -> String {
        self.lock().pack_id.clone()
    }

    /// Record the session id assigned by the peer
    pub fn set_session_id(&self, session_id: &str) {
        self.update(|identity| identity.session_id = Some(session_id.to_string()));
    }

    /// Record the selected pack
    pub fn set_pack_id(&self, pack_id: &str) {
        self.update(|identity| identity.pack_id = pack_id.to_string());
    }

    /// Drop the session id so the next handshake starts a fresh session
    pub fn forget_session(&self) {
        self.update(|identity| identity.session_id = None);
    }

    fn update(&self, mutate: impl FnOnce(&mut SessionIdentity)) {
        let snapshot = {
            let mut identity = self.lock();
            let before = identity.clone();
            mutate(&mut identity);
            if *identity == before {
                return;
            }
            identity.clone()
        };

        if let Some(path) = &self.path {
            if let Err(e) = save(path, &snapshot) {
                tracing::warn!(path = %path.display(), error = %e, "failed to persist client state");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionIdentity> {
        match self.identity.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn load(path: &Path) -> SessionIdentity {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return SessionIdentity::default(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read client state");
            return SessionIdentity::default();
        }
    };

    match serde_json::from_str(&content) {
        Ok(identity) => identity,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring corrupt client state");
            SessionIdentity::default()
        }
    }
}

fn save(path: &Path, identity: &SessionIdentity) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(identity)?;
    std::fs::write(path, json)?;
    Ok(())
}
