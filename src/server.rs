//! Bus Server
//!
//! Accepts WebSocket upgrades on one path, owns the registry of live
//! sessions, and fans session events out to the hosting application.
//! Broadcast and targeted sends go to authenticated sessions only.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::protocol::{MessageType, Payload, Status};
use crate::session::{error_payload, ServerClient, SessionEvent};

/// Event buffer for the bus-level channel.
const EVENT_BUFFER: usize = 256;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to bind.
    pub hostname: String,
    /// Port to bind.
    pub port: u16,
    /// Upgrade path; requests elsewhere receive 404.
    pub path: String,
    /// Pinned shared secret; `None` reads `SPORKET_PASSWORD` per challenge.
    pub password: Option<String>,
    /// Disconnect sessions still unauthenticated after this long.
    /// `None` leaves pending handshakes unbounded.
    pub auth_deadline: Option<Duration>,
    /// Pause between the shutdown notice and session teardown, so in-flight
    /// frames can flush.
    pub shutdown_flush: Duration,
    /// Pause between session teardown and stopping the acceptor.
    pub shutdown_linger: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            port: 9000,
            path: "/".to_string(),
            password: None,
            auth_deadline: Some(Duration::from_secs(10)),
            shutdown_flush: Duration::from_millis(1000),
            shutdown_linger: Duration::from_millis(500),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables, falling back to defaults:
    /// `SPORKET_HOST`, `SPORKET_PORT`, `SPORKET_PATH`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(hostname) = std::env::var("SPORKET_HOST") {
            config.hostname = hostname;
        }
        if let Some(port) = std::env::var("SPORKET_PORT")
            .ok()
            .and_then(|port| port.parse().ok())
        {
            config.port = port;
        }
        if let Ok(path) = std::env::var("SPORKET_PATH") {
            config.path = path;
        }
        config
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind the listener.
    #[error("failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// `listen` was called twice.
    #[error("server is already listening")]
    AlreadyListening,
}

/// Events surfaced to the hosting application.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A verified payload from an authenticated session.
    Message {
        /// Sender session.
        uuid: Uuid,
        /// Decoded application payload.
        payload: Payload,
    },
    /// A session completed the handshake.
    ClientConnect {
        /// The new session.
        uuid: Uuid,
    },
    /// A session ended; its registry entry is already gone.
    ClientDisconnect {
        /// The closed session.
        uuid: Uuid,
    },
}

/// The session registry: uuid to live session.
type Registry = Arc<RwLock<BTreeMap<Uuid, Arc<ServerClient>>>>;

/// The bus server.
pub struct Server {
    config: ServerConfig,
    registry: Registry,
    event_tx: broadcast::Sender<ServerEvent>,
    shutdown_tx: broadcast::Sender<()>,
    listening: AtomicBool,
}

impl Server {
    /// Create a server. Nothing binds until [`listen`](Self::listen).
    pub fn new(config: ServerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER);
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            registry: Arc::new(RwLock::new(BTreeMap::new())),
            event_tx,
            shutdown_tx,
            listening: AtomicBool::new(false),
        }
    }

    /// Subscribe to bus events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.event_tx.subscribe()
    }

    /// Bind the acceptor and start serving upgrades. Returns the bound
    /// address (useful with port 0). Calling this twice is an error.
    pub async fn listen(&self) -> Result<SocketAddr, ServerError> {
        if self.listening.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyListening);
        }

        let listener =
            TcpListener::bind((self.config.hostname.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        info!("listening on ws://{}:{}{}", self.config.hostname, addr.port(), self.config.path);

        let registry = self.registry.clone();
        let event_tx = self.event_tx.clone();
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "inbound connection");
                            tokio::spawn(handle_connection(
                                stream,
                                config.clone(),
                                registry.clone(),
                                event_tx.clone(),
                            ));
                        }
                        Err(error) => error!(%error, "accept error"),
                    },
                    _ = shutdown_rx.recv() => {
                        info!("acceptor stopped");
                        break;
                    }
                }
            }
        });

        Ok(addr)
    }

    /// Broadcast a DATA payload to every authenticated session, as of this
    /// call's registry snapshot.
    pub async fn send(&self, payload: &Payload) {
        for client in self.authenticated_sessions().await {
            client
                .send(MessageType::Data, Status::Ok, payload.clone())
                .await;
        }
    }

    /// Send a DATA payload to one session. Returns `false` when the uuid is
    /// unknown or the session has not authenticated.
    pub async fn send_to(&self, uuid: Uuid, payload: &Payload) -> bool {
        let client = self.registry.read().await.get(&uuid).cloned();
        match client {
            Some(client) if client.is_authenticated() => {
                client
                    .send(MessageType::Data, Status::Ok, payload.clone())
                    .await
            }
            _ => false,
        }
    }

    /// Graceful shutdown: notify authenticated sessions with a signed
    /// `ERROR/418`, wait for the flush window, disconnect every session,
    /// wait for the linger window, then stop the acceptor.
    pub async fn close(&self) {
        for client in self.authenticated_sessions().await {
            client
                .send(
                    MessageType::Error,
                    Status::Teapot,
                    error_payload("Server shutting down"),
                )
                .await;
        }
        tokio::time::sleep(self.config.shutdown_flush).await;

        let sessions: Vec<Arc<ServerClient>> = {
            let registry = self.registry.read().await;
            registry.values().cloned().collect()
        };
        for client in sessions {
            client.disconnect();
        }
        tokio::time::sleep(self.config.shutdown_linger).await;

        let _ = self.shutdown_tx.send(());
        info!("server closed");
    }

    /// Number of live sessions, authenticated or not.
    pub async fn connection_count(&self) -> usize {
        self.registry.read().await.len()
    }

    async fn authenticated_sessions(&self) -> Vec<Arc<ServerClient>> {
        let registry = self.registry.read().await;
        registry
            .values()
            .filter(|client| client.is_authenticated())
            .cloned()
            .collect()
    }
}

/// Upgrade one inbound connection and run its session to completion.
async fn handle_connection(
    stream: TcpStream,
    config: ServerConfig,
    registry: Registry,
    event_tx: broadcast::Sender<ServerEvent>,
) {
    let path = config.path.clone();
    let callback = move |request: &Request, response: Response| {
        if path_matches(&path, request.uri().path()) {
            Ok(response)
        } else {
            let mut rejection = ErrorResponse::new(Some("Not Found".to_string()));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            Err(rejection)
        }
    };

    let websocket = match accept_hdr_async(stream, callback).await {
        Ok(websocket) => websocket,
        Err(error) => {
            debug!(%error, "websocket handshake failed");
            return;
        }
    };

    let (client, mut events) = ServerClient::accept(websocket, config.password, config.auth_deadline);
    let uuid = client.uuid();

    // Register before draining events, so the disconnect path always finds
    // (and removes) the entry. Session events queue in `events` meanwhile.
    registry.write().await.insert(uuid, client);

    // Bridge session events onto the bus channel. The registry entry is
    // removed before the disconnect event surfaces.
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Authenticated) => {
                    let _ = event_tx.send(ServerEvent::ClientConnect { uuid });
                }
                Ok(SessionEvent::Message(payload)) => {
                    let _ = event_tx.send(ServerEvent::Message { uuid, payload });
                }
                Ok(SessionEvent::Disconnect) => {
                    registry.write().await.remove(&uuid);
                    let _ = event_tx.send(ServerEvent::ClientDisconnect { uuid });
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(%uuid, skipped, "session events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Whether a request path matches the configured upgrade path, with an
/// optional trailing slash.
fn path_matches(configured: &str, requested: &str) -> bool {
    let base = configured.trim_end_matches('/');
    requested == base || requested == format!("{}/", base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.hostname, "localhost");
        assert_eq!(config.port, 9000);
        assert_eq!(config.path, "/");
        assert_eq!(config.shutdown_flush, Duration::from_millis(1000));
        assert_eq!(config.shutdown_linger, Duration::from_millis(500));
    }

    #[test]
    fn path_matching_allows_one_trailing_slash() {
        assert!(path_matches("/", "/"));
        assert!(path_matches("/bus", "/bus"));
        assert!(path_matches("/bus", "/bus/"));
        assert!(path_matches("/bus/", "/bus"));
        assert!(!path_matches("/bus", "/bus/extra"));
        assert!(!path_matches("/bus", "/other"));
        assert!(!path_matches("/", "/bus"));
    }

    #[tokio::test]
    async fn listen_twice_is_an_error() {
        let server = Server::new(ServerConfig {
            hostname: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        });
        server.listen().await.unwrap();
        assert!(matches!(
            server.listen().await,
            Err(ServerError::AlreadyListening)
        ));
    }

    #[tokio::test]
    async fn registry_starts_empty() {
        let server = Server::new(ServerConfig::default());
        assert_eq!(server.connection_count().await, 0);
    }
}
