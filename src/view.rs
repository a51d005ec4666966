//! Snapshot handed to the user-facing collaborator
//!
//! The session publishes a fresh [`ViewState`] after every event it handles;
//! renderers only read it. One-off alerts (a microphone that could not be
//! opened) travel separately so they are shown once rather than re-rendered.

use tokio::sync::{mpsc, watch};

use crate::protocol::{Outfit, PackInfo, SessionConfig};
use crate::turn::{Affordances, Indicator, TurnMachine, TurnState};

/// Pack and outfit catalog reported by the peer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    pub character_name: Option<String>,
    pub packs: Vec<PackInfo>,
    pub active_pack: Option<String>,
    pub outfits: Vec<Outfit>,
    pub current_outfit: Option<String>,
}

impl Catalog {
    /// Adopt the pack catalog of a new session config
    pub fn apply_config(&mut self, config: &SessionConfig) {
        self.character_name.clone_from(&config.character_name);
        self.packs.clone_from(&config.available_packs);
        self.active_pack.clone_from(&config.active_pack);
    }
}

/// Everything a renderer needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewState {
    pub turn: TurnState,
    pub affordances: Affordances,
    pub indicator: Indicator,
    pub text: String,
    pub image_url: Option<String>,
    pub catalog: Catalog,
}

impl Default for ViewState {
    fn default() -> Self {
        Self::new(&TurnMachine::new(), &Catalog::default())
    }
}

impl ViewState {
    #[must_use]
    pub fn new(machine: &TurnMachine, catalog: &Catalog) -> Self {
        Self {
            turn: machine.turn(),
            affordances: machine.affordances(),
            indicator: machine.indicator(),
            text: machine.display().text.clone(),
            image_url: machine.display().image_url.clone(),
            catalog: catalog.clone(),
        }
    }
}

/// Publishing side, owned by the session
#[derive(Debug)]
pub struct ViewPublisher {
    state: watch::Sender<ViewState>,
    alerts: mpsc::UnboundedSender<String>,
}

impl ViewPublisher {
    /// Create a publisher with its state and alert receivers
    #[must_use]
    pub fn new() -> (
        Self,
        watch::Receiver<ViewState>,
        mpsc::UnboundedReceiver<String>,
    ) {
        let (state, state_rx) = watch::channel(ViewState::default());
        let (alerts, alerts_rx) = mpsc::unbounded_channel();
        (Self { state, alerts }, state_rx, alerts_rx)
    }

    /// Replace the snapshot, waking renderers only when something changed
    pub fn publish(&self, next: ViewState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    /// Raise a one-off alert
    pub fn alert(&self, message: String) {
        tracing::debug!(alert = %message, "raising alert");
        let _ = self.alerts.send(message);
    }
}
