//! Bus Client
//!
//! [`Sporket`] composes a [`Socket`] and layers the handshake state machine
//! on top of it: the server assigns the session identity, the client answers
//! with the challenge digest, and application traffic flows once the server
//! confirms. The session identity never survives a reconnect — every fresh
//! transport runs a fresh handshake.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::auth;
use crate::protocol::{Message, MessageType, Payload, SessionKey, Status};
use crate::socket::{Socket, SocketConfig, SocketEvent, WeakSocket};

/// Event buffer for the client channel.
const EVENT_BUFFER: usize = 64;

/// Client configuration.
#[derive(Debug, Clone, Default)]
pub struct SporketConfig {
    /// Reconnect behavior of the underlying socket.
    pub socket: SocketConfig,
    /// Pinned shared secret; `None` reads `SPORKET_PASSWORD` per challenge.
    pub password: Option<String>,
}

/// Events surfaced to the application.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The transport opened; the handshake is about to run.
    Connect,
    /// The handshake completed; data may flow.
    Authenticated,
    /// A verified payload arrived.
    Message(Payload),
    /// The client gave up the link (explicit, remote shutdown, or attempts
    /// exhausted).
    Disconnect,
    /// The transport closed.
    Close,
}

/// Handshake state. Everything resets when the transport goes away.
#[derive(Default)]
struct HandshakeState {
    uuid: Option<String>,
    key: Option<SessionKey>,
    authenticated: bool,
}

impl HandshakeState {
    fn reset(&mut self) {
        self.uuid = None;
        self.key = None;
        self.authenticated = false;
    }
}

/// Client-side endpoint of the bus.
pub struct Sporket {
    socket: Socket,
    state: Arc<RwLock<HandshakeState>>,
    event_tx: broadcast::Sender<ClientEvent>,
}

impl Sporket {
    /// Create a client for `url` with default configuration. Call
    /// [`connect`](Self::connect) to dial.
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_config(url, SporketConfig::default())
    }

    /// Create a client with explicit configuration.
    pub fn with_config(url: impl Into<String>, config: SporketConfig) -> Self {
        let (socket, socket_rx) = Socket::new(url.into(), config.socket);
        let state = Arc::new(RwLock::new(HandshakeState::default()));
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

        // The pump holds only a weak socket handle, so dropping the Sporket
        // shuts the whole stack down.
        tokio::spawn(run_client(
            socket.downgrade(),
            socket_rx,
            state.clone(),
            event_tx.clone(),
            config.password,
        ));

        Self {
            socket,
            state,
            event_tx,
        }
    }

    /// Subscribe to client events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.event_tx.subscribe()
    }

    /// Open the transport and start the handshake.
    pub fn connect(&self) {
        self.socket.connect();
    }

    /// Drop the link and stop reconnecting until the next
    /// [`connect`](Self::connect).
    pub fn disconnect(&self) {
        self.socket.disconnect();
    }

    /// Whether the transport is open.
    pub fn is_open(&self) -> bool {
        self.socket.is_open()
    }

    /// Whether the handshake has completed on the current transport.
    pub async fn is_authenticated(&self) -> bool {
        self.state.read().await.authenticated
    }

    /// The server-assigned session uuid, once identified.
    pub async fn uuid(&self) -> Option<String> {
        self.state.read().await.uuid.clone()
    }

    /// Send an application payload as `DATA/200`.
    pub async fn send(&self, payload: Payload) -> bool {
        self.send_as(payload, MessageType::Data, Status::Ok).await
    }

    /// Send an empty `PING/200` envelope.
    pub async fn ping(&self) -> bool {
        self.send_as(Payload::new(), MessageType::Ping, Status::Ok)
            .await
    }

    /// Send a payload with an explicit kind and status.
    ///
    /// Refuses (returns `false`) when the transport is closed, when no key
    /// has been derived yet, or when the kind is not AUTH and the handshake
    /// has not completed.
    pub async fn send_as(&self, payload: Payload, kind: MessageType, status: Status) -> bool {
        if !self.socket.is_open() {
            return false;
        }
        let state = self.state.read().await;
        if kind != MessageType::Auth && !state.authenticated {
            return false;
        }
        let Some(key) = state.key.as_ref() else {
            return false;
        };
        let message = Message::new(&payload, kind, status).sign(key);
        self.socket.send_json(&message)
    }
}

/// Pump socket events through the handshake state machine.
async fn run_client(
    socket: WeakSocket,
    mut events: mpsc::UnboundedReceiver<SocketEvent>,
    state: Arc<RwLock<HandshakeState>>,
    event_tx: broadcast::Sender<ClientEvent>,
    password: Option<String>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SocketEvent::Connect => {
                let _ = event_tx.send(ClientEvent::Connect);
            }
            SocketEvent::Frame(text) => {
                handle_frame(&socket, &state, &event_tx, password.as_deref(), &text).await;
            }
            SocketEvent::Close => {
                state.write().await.reset();
                let _ = event_tx.send(ClientEvent::Close);
            }
            SocketEvent::Disconnect => {
                state.write().await.reset();
                let _ = event_tx.send(ClientEvent::Disconnect);
            }
        }
    }
}

async fn handle_frame(
    socket: &WeakSocket,
    state: &Arc<RwLock<HandshakeState>>,
    event_tx: &broadcast::Sender<ClientEvent>,
    password: Option<&str>,
    text: &str,
) {
    let Ok(message) = Message::from_json(text) else {
        debug!("malformed frame from server");
        socket.disconnect();
        return;
    };
    let payload = message.decode_payload();

    // The server's identity AUTH carries the session uuid; everything about
    // this session keys off it.
    if message.kind == MessageType::Auth {
        if let Some(uuid) = payload.get("uuid").and_then(Value::as_str) {
            handle_identity(socket, state, password, &message, uuid).await;
            return;
        }
    }

    // Every later frame must verify against the derived session key.
    let key = state.read().await.key.clone();
    if !message.verify(key.as_ref()) {
        warn!("dropping link: bad signature from server");
        socket.disconnect();
        return;
    }

    match message.kind {
        MessageType::Auth => {
            if payload.get("success").and_then(Value::as_bool) == Some(true) {
                state.write().await.authenticated = true;
                let _ = event_tx.send(ClientEvent::Authenticated);
            } else {
                socket.disconnect();
            }
        }
        MessageType::Error => {
            let authenticated = state.read().await.authenticated;
            if message.status == Status::Teapot {
                info!("server is shutting down");
                socket.disconnect();
            } else if !authenticated {
                // The server rejected the handshake.
                warn!(status = ?message.status, "authentication rejected");
                socket.disconnect();
            } else {
                debug!(status = ?message.status, "error frame ignored");
            }
        }
        _ => {
            let _ = event_tx.send(ClientEvent::Message(payload));
        }
    }
}

/// Client half of the handshake: derive the key from the announced uuid,
/// verify the announcement, and answer with the signed challenge digest.
async fn handle_identity(
    socket: &WeakSocket,
    state: &Arc<RwLock<HandshakeState>>,
    password: Option<&str>,
    message: &Message,
    uuid: &str,
) {
    let key = SessionKey::derive(uuid);
    if !message.verify(Some(&key)) {
        warn!("dropping link: identity announcement failed verification");
        socket.disconnect();
        return;
    }

    let secret = match password {
        Some(password) => password.to_string(),
        None => match auth::shared_secret() {
            Ok(secret) => secret,
            Err(error) => {
                warn!(%error, "cannot answer challenge");
                socket.disconnect();
                return;
            }
        },
    };
    let challenge = auth::compute_challenge(&secret, uuid);

    {
        let mut session = state.write().await;
        session.uuid = Some(uuid.to_string());
        session.key = Some(key.clone());
        session.authenticated = false;
    }

    let mut reply = Payload::new();
    reply.insert("challenge".into(), Value::String(challenge));
    let answer = Message::new(&reply, MessageType::Auth, Status::Ok).sign(&key);
    if !socket.send_json(&answer) {
        socket.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn send_refuses_while_disconnected() {
        let client = Sporket::new("ws://127.0.0.1:1/");
        let payload = json!({"hello": "world"}).as_object().cloned().unwrap();
        assert!(!client.send(payload).await);
        assert!(!client.ping().await);
        assert!(!client.is_authenticated().await);
        assert!(client.uuid().await.is_none());
    }

    #[test]
    fn default_config_has_no_pinned_password() {
        let config = SporketConfig::default();
        assert!(config.password.is_none());
        assert!(config.socket.auto_connect);
    }
}
