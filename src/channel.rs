//! Session channel: WebSocket transport to the session peer
//!
//! A background task owns the socket. It connects, sends a handshake carrying
//! the persisted identity, forwards decoded peer messages, and after any drop
//! waits a fixed delay and connects again, forever. Sends never queue across
//! a disconnect: while closed they are dropped, and anything still sitting in
//! the outbound pipe when a connection dies is discarded before the next
//! handshake.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::config::ChannelConfig;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::state::StateStore;
use crate::{Error, Result};

/// What the channel reports to the session
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Transport open and handshake sent
    Connected,
    /// Transport closed; a reconnect is pending
    Disconnected,
    /// A peer message, in arrival order
    Message(ServerMessage),
}

/// Outbound side of the session channel
pub trait PeerSink: Send + Sync {
    /// Send a message if the channel is open
    ///
    /// Returns false, dropping the message, when it is not.
    fn send(&self, message: ClientMessage) -> bool;

    fn is_open(&self) -> bool;
}

/// Spawns the connection task
pub struct SessionChannel;

impl SessionChannel {
    /// Start connecting in the background
    ///
    /// The task runs until the returned event receiver is dropped or the
    /// handle is closed.
    #[must_use]
    pub fn spawn(
        config: ChannelConfig,
        store: StateStore,
    ) -> (ChannelHandle, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (open_tx, open_rx) = watch::channel(false);

        let task = tokio::spawn(connection_loop(
            config,
            store,
            outbound_rx,
            events_tx,
            open_tx,
        ));

        let handle = ChannelHandle {
            outbound: outbound_tx,
            open: open_rx,
            task: Arc::new(task),
        };
        (handle, events_rx)
    }
}

/// Cloneable handle for sending to the peer
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    outbound: mpsc::UnboundedSender<String>,
    open: watch::Receiver<bool>,
    task: Arc<JoinHandle<()>>,
}

impl ChannelHandle {
    /// Stop the connection task
    pub fn close(&self) {
        self.task.abort();
    }
}

impl PeerSink for ChannelHandle {
    fn send(&self, message: ClientMessage) -> bool {
        if !*self.open.borrow() {
            tracing::debug!(message = ?message, "channel not open, dropping message");
            return false;
        }

        let json = match serde_json::to_string(&message) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode message");
                return false;
            }
        };
        self.outbound.send(json).is_ok()
    }

    fn is_open(&self) -> bool {
        *self.open.borrow()
    }
}

async fn connection_loop(
    config: ChannelConfig,
    store: StateStore,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    open: watch::Sender<bool>,
) {
    let mut attempt: u64 = 0;

    loop {
        attempt += 1;
        tracing::debug!(url = %config.url, attempt, "connecting to session peer");

        match try_connect(&config, &store, &mut outbound_rx, &events, &open).await {
            Ok(()) => break,
            Err(e) => {
                tracing::warn!(error = %e, attempt, "session channel dropped");
            }
        }

        if open.send_replace(false) {
            attempt = 0;
            if events.send(ChannelEvent::Disconnected).is_err() {
                break;
            }
        }
        if events.is_closed() {
            break;
        }

        tokio::time::sleep(config.reconnect_delay).await;
    }

    open.send_replace(false);
    tracing::debug!("session channel stopped");
}

/// Run one connection
///
/// Returns `Ok(())` once the session side has gone away, and an error when
/// the transport fails or the peer closes it.
async fn try_connect(
    config: &ChannelConfig,
    store: &StateStore,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    events: &mpsc::UnboundedSender<ChannelEvent>,
    open: &watch::Sender<bool>,
) -> Result<()> {
    let (ws_stream, _) = connect_async(config.url.as_str()).await?;
    let (mut write, mut read) = ws_stream.split();

    // Nothing sent before this connection existed may reach the peer
    let mut stale = 0usize;
    while outbound_rx.try_recv().is_ok() {
        stale += 1;
    }
    if stale > 0 {
        tracing::debug!(count = stale, "discarded messages queued before reconnect");
    }

    let identity = store.identity();
    let handshake = ClientMessage::Handshake {
        session_id: identity.session_id.clone(),
        pack_id: identity.pack_id.clone(),
    };
    write
        .send(Message::Text(serde_json::to_string(&handshake)?.into()))
        .await?;

    tracing::info!(
        url = %config.url,
        session_id = ?identity.session_id,
        pack_id = %identity.pack_id,
        "session channel open"
    );

    open.send_replace(true);
    if events.send(ChannelEvent::Connected).is_err() {
        return Ok(());
    }

    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + config.ping_interval,
        config.ping_interval,
    );

    loop {
        tokio::select! {
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(message) = decode(&text, store)
                            && events.send(ChannelEvent::Message(message)).is_err()
                        {
                            return Ok(());
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(Error::TransportDropped("closed by peer".to_string()));
                    }
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(_)) => {}
                }
            }
            Some(json) = outbound_rx.recv() => {
                write.send(Message::Text(json.into())).await?;
            }
            _ = ping.tick() => {
                let json = serde_json::to_string(&ClientMessage::Ping)?;
                write.send(Message::Text(json.into())).await?;
            }
        }
    }
}

/// Decode one text frame
///
/// Records a newly assigned session id before the message is forwarded, so
/// the next handshake resumes it. Malformed frames, unknown types and pongs
/// are consumed here.
fn decode(text: &str, store: &StateStore) -> Option<ServerMessage> {
    let message = match ServerMessage::parse(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(error = %e, "ignoring malformed peer message");
            return None;
        }
    };

    match &message {
        ServerMessage::Unknown => {
            tracing::debug!(frame = %text, "ignoring unknown peer message");
            return None;
        }
        ServerMessage::Pong => {
            tracing::trace!("pong");
            return None;
        }
        ServerMessage::HandshakeAck { session_id, .. } => {
            tracing::info!(session_id = %session_id, "handshake acknowledged");
            store.set_session_id(session_id);
        }
        other => {
            tracing::debug!(kind = other.kind(), "peer message");
        }
    }
    Some(message)
}
