//! Server-Side Sessions
//!
//! One [`ServerClient`] per accepted WebSocket. The session generates its
//! uuid, derives the signing key, announces its identity, and then gates
//! every inbound frame: parse, verify, dispatch. Application payloads are
//! surfaced only after the challenge handshake has completed.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{tungstenite::Message as WsMessage, WebSocketStream};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth;
use crate::protocol::{Message, MessageType, Payload, SessionKey, Status};

/// Outbound queue depth per session.
const OUTBOUND_BUFFER: usize = 64;

/// Event buffer per session.
const EVENT_BUFFER: usize = 64;

/// Events a session surfaces to its owner.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The challenge handshake completed.
    Authenticated,
    /// A verified application payload arrived.
    Message(Payload),
    /// The session ended. Emitted exactly once.
    Disconnect,
}

/// Server-side half of one bus connection.
pub struct ServerClient {
    uuid: Uuid,
    key: SessionKey,
    /// Pinned shared secret; `None` reads the environment per challenge.
    secret: Option<String>,
    authenticated: AtomicBool,
    connected: AtomicBool,
    outbound: mpsc::Sender<Message>,
    event_tx: broadcast::Sender<SessionEvent>,
    /// One signal detaches every transport task for this session.
    closer: broadcast::Sender<()>,
}

impl ServerClient {
    /// Adopt an accepted WebSocket: generate the session identity, start the
    /// transport tasks, and send the identity AUTH. The returned receiver is
    /// subscribed before any task runs, so no event can be missed.
    pub(crate) fn accept(
        stream: WebSocketStream<TcpStream>,
        secret: Option<String>,
        auth_deadline: Option<Duration>,
    ) -> (Arc<Self>, broadcast::Receiver<SessionEvent>) {
        let uuid = Uuid::new_v4();
        let key = SessionKey::derive(&uuid.to_string());
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (event_tx, event_rx) = broadcast::channel(EVENT_BUFFER);
        let (closer, _) = broadcast::channel(1);

        let client = Arc::new(Self {
            uuid,
            key,
            secret,
            authenticated: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            outbound,
            event_tx,
            closer,
        });

        let (sink, source) = stream.split();
        Self::spawn_writer(&client, sink, outbound_rx);
        Self::spawn_reader(&client, source);
        if let Some(deadline) = auth_deadline {
            Self::spawn_auth_deadline(&client, deadline);
        }

        (client, event_rx)
    }

    /// The session identifier.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Whether the challenge handshake has completed.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Whether the transport is still attached.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Build, sign, and transmit an envelope. Returns `false` once the
    /// session is disconnected.
    pub async fn send(&self, kind: MessageType, status: Status, payload: Payload) -> bool {
        if !self.is_connected() {
            return false;
        }
        let message = Message::new(&payload, kind, status).sign(&self.key);
        self.outbound.send(message).await.is_ok()
    }

    /// End the session. Idempotent: the first call detaches the transport
    /// tasks, clears the authenticated flag, and emits
    /// [`SessionEvent::Disconnect`]; later calls do nothing.
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.authenticated.store(false, Ordering::SeqCst);
            let _ = self.closer.send(());
            let _ = self.event_tx.send(SessionEvent::Disconnect);
            debug!(uuid = %self.uuid, "session disconnected");
        }
    }

    fn spawn_writer(
        client: &Arc<Self>,
        mut sink: futures_util::stream::SplitSink<WebSocketStream<TcpStream>, WsMessage>,
        mut outbound_rx: mpsc::Receiver<Message>,
    ) {
        let client = client.clone();
        let mut shutdown_rx = client.closer.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = outbound_rx.recv() => match message {
                        Some(message) => {
                            let text = match message.to_json() {
                                Ok(text) => text,
                                Err(error) => {
                                    warn!(uuid = %client.uuid, %error, "failed to serialize envelope");
                                    continue;
                                }
                            };
                            if sink.send(WsMessage::Text(text)).await.is_err() {
                                debug!(uuid = %client.uuid, "write failed");
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = shutdown_rx.recv() => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        break;
                    }
                }
            }
            // A failed write means a dead transport; tear the session down
            // so the registry entry cannot outlive the connection.
            client.disconnect();
        });
    }

    fn spawn_reader(
        client: &Arc<Self>,
        mut source: futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
    ) {
        let client = client.clone();
        let mut shutdown_rx = client.closer.subscribe();
        tokio::spawn(async move {
            // Handshake step one: hand the client its session identity.
            if !client.send_identity().await {
                client.disconnect();
                return;
            }

            loop {
                tokio::select! {
                    frame = source.next() => match frame {
                        Some(Ok(WsMessage::Text(text))) => client.handle_frame(&text).await,
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(error)) => {
                            debug!(uuid = %client.uuid, %error, "websocket error");
                            break;
                        }
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
            client.disconnect();
        });
    }

    fn spawn_auth_deadline(client: &Arc<Self>, deadline: Duration) {
        let client = client.clone();
        let mut shutdown_rx = client.closer.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(deadline) => {
                    if !client.is_authenticated() {
                        warn!(uuid = %client.uuid, "handshake deadline expired");
                        client.disconnect();
                    }
                }
                _ = shutdown_rx.recv() => {}
            }
        });
    }

    /// The server's first AUTH: `id` equals the session uuid, and the
    /// payload repeats it so the peer can derive the signing key.
    async fn send_identity(&self) -> bool {
        let mut payload = Payload::new();
        payload.insert("uuid".into(), Value::String(self.uuid.to_string()));
        let message = Message::with_id(
            self.uuid.to_string(),
            &payload,
            MessageType::Auth,
            Status::Ok,
        )
        .sign(&self.key);
        self.outbound.send(message).await.is_ok()
    }

    /// Per-frame gate: parse, verify, dispatch.
    ///
    /// Peer-caused failures get a signed ERROR reply and keep the connection
    /// open, so the peer can tell a signature problem from an auth problem.
    async fn handle_frame(&self, text: &str) {
        let message = match Message::from_json(text) {
            Ok(message) => message,
            Err(error) => {
                debug!(uuid = %self.uuid, %error, "malformed frame");
                self.send(
                    MessageType::Error,
                    Status::BadRequest,
                    error_payload("Bad Request (malformed message)"),
                )
                .await;
                return;
            }
        };

        if !message.verify(Some(&self.key)) {
            self.send(
                MessageType::Error,
                Status::BadRequest,
                error_payload("Bad Request (invalid signature)"),
            )
            .await;
            return;
        }

        match message.kind {
            MessageType::Auth => self.handle_challenge(&message).await,
            _ if self.is_authenticated() => {
                let _ = self
                    .event_tx
                    .send(SessionEvent::Message(message.decode_payload()));
            }
            _ => {
                self.send(
                    MessageType::Error,
                    Status::Unauthorized,
                    error_payload("Unauthorized (respond to challenge)"),
                )
                .await;
            }
        }
    }

    /// Handshake step two: check the peer's challenge digest against our own
    /// recomputation from the shared secret.
    async fn handle_challenge(&self, message: &Message) {
        let expected = match self.secret() {
            Ok(password) => auth::compute_challenge(&password, &self.uuid.to_string()),
            Err(error) => {
                warn!(uuid = %self.uuid, %error, "cannot verify challenge");
                self.send(
                    MessageType::Error,
                    Status::Unauthorized,
                    error_payload("Unauthorized (authentication failed)"),
                )
                .await;
                return;
            }
        };

        let payload = message.decode_payload();
        match payload.get("challenge").and_then(Value::as_str) {
            Some(challenge) if challenge == expected => {
                self.authenticated.store(true, Ordering::SeqCst);
                let _ = self.event_tx.send(SessionEvent::Authenticated);
                let mut success = Payload::new();
                success.insert("success".into(), Value::Bool(true));
                self.send(MessageType::Auth, Status::Ok, success).await;
                debug!(uuid = %self.uuid, "session authenticated");
            }
            _ => {
                self.send(
                    MessageType::Error,
                    Status::Unauthorized,
                    error_payload("Unauthorized (authentication failed)"),
                )
                .await;
            }
        }
    }

    fn secret(&self) -> Result<String, auth::AuthError> {
        match &self.secret {
            Some(password) => Ok(password.clone()),
            None => auth::shared_secret(),
        }
    }
}

/// `{message: <text>}` payload for ERROR envelopes.
pub(crate) fn error_payload(text: &str) -> Payload {
    let mut payload = Payload::new();
    payload.insert("message".into(), Value::String(text.into()));
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_payload_carries_message() {
        let payload = error_payload("Bad Request (invalid signature)");
        assert_eq!(
            payload.get("message").and_then(Value::as_str),
            Some("Bad Request (invalid signature)")
        );
    }

    #[test]
    fn session_key_binds_to_uuid() {
        let uuid = Uuid::new_v4();
        let key = SessionKey::derive(&uuid.to_string());
        let message = Message::new(&Payload::new(), MessageType::Data, Status::Ok).sign(&key);
        assert!(message.verify(Some(&SessionKey::derive(&uuid.to_string()))));
        assert!(!message.verify(Some(&SessionKey::derive(&Uuid::new_v4().to_string()))));
    }
}
