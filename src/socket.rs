//! Socket Base
//!
//! Maintains a single outbound WebSocket with bounded auto-reconnect.
//! The controller owns the connection in a background task; callers talk to
//! it through a command channel and observe it through an event channel.
//! Protocol logic lives in the consumer of [`SocketEvent`]s — this layer
//! only moves text frames and manages the connection lifecycle.

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// Reconnect configuration.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Reconnect automatically after a lost transport.
    pub auto_connect: bool,
    /// Maximum scheduled reconnect attempts; 0 means unlimited.
    pub max_attempts: u32,
    /// Wait floor, applied after each successful open.
    pub min_wait: Duration,
    /// Wait ceiling.
    pub max_wait: Duration,
    /// Linear growth added after each scheduled attempt.
    pub wait_extend: Duration,
    /// Wait used before the first successful open.
    pub initial_wait: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            auto_connect: true,
            max_attempts: 10,
            min_wait: Duration::from_millis(2000),
            max_wait: Duration::from_millis(10000),
            wait_extend: Duration::from_millis(1000),
            initial_wait: Duration::from_millis(1000),
        }
    }
}

/// Lifecycle and traffic events surfaced by the controller.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// The transport opened.
    Connect,
    /// An inbound text frame.
    Frame(String),
    /// The transport closed (lost, refused, or deliberately shut).
    Close,
    /// The controller gave up: explicit disconnect or attempts exhausted.
    Disconnect,
}

enum Command {
    Connect,
    Disconnect,
    Send(String),
}

/// Handle to a reconnecting WebSocket.
///
/// Cheap to clone; all clones drive the same connection. Dropping every
/// clone shuts the background task down.
#[derive(Clone)]
pub struct Socket {
    commands: mpsc::UnboundedSender<Command>,
    open: Arc<AtomicBool>,
}

impl Socket {
    /// Create the controller for `url`. The socket stays idle until
    /// [`connect`](Self::connect) is called; `config.auto_connect` governs
    /// reconnection after a loss, not the first dial.
    pub fn new(url: String, config: SocketConfig) -> (Self, mpsc::UnboundedReceiver<SocketEvent>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));

        tokio::spawn(run_socket(url, config, command_rx, event_tx, open.clone()));

        (Self { commands, open }, event_rx)
    }

    /// Open the transport. Cancels a pending reconnect timer and tears down
    /// an existing connection first.
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Close the transport and stop reconnecting until the next
    /// [`connect`](Self::connect).
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    /// Whether the transport is currently open.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Serialize `value` and send it as one text frame. Silently drops the
    /// frame and returns `false` when the transport is not open.
    pub fn send_json<T: Serialize>(&self, value: &T) -> bool {
        if !self.is_open() {
            return false;
        }
        match serde_json::to_string(value) {
            Ok(text) => self.commands.send(Command::Send(text)).is_ok(),
            Err(_) => false,
        }
    }

    /// A weak handle for internal pumps: it can drive the socket but does
    /// not keep the controller alive once every [`Socket`] is dropped.
    pub fn downgrade(&self) -> WeakSocket {
        WeakSocket {
            commands: self.commands.downgrade(),
            open: self.open.clone(),
        }
    }
}

/// Weak counterpart of [`Socket`].
#[derive(Clone)]
pub struct WeakSocket {
    commands: mpsc::WeakUnboundedSender<Command>,
    open: Arc<AtomicBool>,
}

impl WeakSocket {
    /// Close the transport and stop reconnecting.
    pub fn disconnect(&self) {
        if let Some(commands) = self.commands.upgrade() {
            let _ = commands.send(Command::Disconnect);
        }
    }

    /// Whether the transport is currently open.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Serialize `value` and send it while the transport is open.
    pub fn send_json<T: Serialize>(&self, value: &T) -> bool {
        if !self.is_open() {
            return false;
        }
        let Some(commands) = self.commands.upgrade() else {
            return false;
        };
        match serde_json::to_string(value) {
            Ok(text) => commands.send(Command::Send(text)).is_ok(),
            Err(_) => false,
        }
    }
}

/// Next backoff wait: linear growth clamped at the ceiling.
fn grow_wait(wait: Duration, config: &SocketConfig) -> Duration {
    (wait + config.wait_extend).min(config.max_wait)
}

enum Outcome {
    /// Transport lost (remote close, read/write error).
    Lost,
    /// Caller asked for a fresh connection.
    Reconnect,
    /// Caller asked to stop.
    Disconnected,
    /// Every handle was dropped.
    Shutdown,
}

enum Timer {
    Elapsed,
    Connect,
    Disconnect,
    Shutdown,
}

async fn run_socket(
    url: String,
    config: SocketConfig,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<SocketEvent>,
    open: Arc<AtomicBool>,
) {
    let mut wait = config.initial_wait;
    let mut attempts: u32 = 0;

    if !await_connect(&mut commands, &events).await {
        return;
    }

    loop {
        match connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                open.store(true, Ordering::SeqCst);
                wait = config.min_wait;
                attempts = 0;
                let _ = events.send(SocketEvent::Connect);

                let outcome = drive(stream, &mut commands, &events).await;

                open.store(false, Ordering::SeqCst);
                let _ = events.send(SocketEvent::Close);

                match outcome {
                    Outcome::Lost => {}
                    Outcome::Reconnect => continue,
                    Outcome::Disconnected => {
                        let _ = events.send(SocketEvent::Disconnect);
                        if !await_connect(&mut commands, &events).await {
                            return;
                        }
                        continue;
                    }
                    Outcome::Shutdown => return,
                }
            }
            Err(error) => {
                debug!(%error, url = %url, "connect failed");
                let _ = events.send(SocketEvent::Close);
            }
        }

        // The transport is gone; decide whether another attempt is allowed.
        if config.max_attempts > 0 && attempts >= config.max_attempts {
            debug!(attempts, "reconnect attempts exhausted");
            let _ = events.send(SocketEvent::Disconnect);
            if !await_connect(&mut commands, &events).await {
                return;
            }
            continue;
        }
        if !config.auto_connect {
            if !await_connect(&mut commands, &events).await {
                return;
            }
            continue;
        }

        match backoff(&mut commands, wait).await {
            Timer::Elapsed => {
                attempts += 1;
                wait = grow_wait(wait, &config);
            }
            // Manual connect() cancels the timer and dials immediately
            // without consuming an attempt.
            Timer::Connect => {}
            Timer::Disconnect => {
                let _ = events.send(SocketEvent::Disconnect);
                if !await_connect(&mut commands, &events).await {
                    return;
                }
            }
            Timer::Shutdown => return,
        }
    }
}

/// Pump one open connection until it is lost or a command ends it.
async fn drive(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    events: &mpsc::UnboundedSender<SocketEvent>,
) -> Outcome {
    let (mut sink, mut source) = stream.split();

    loop {
        tokio::select! {
            frame = source.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    let _ = events.send(SocketEvent::Frame(text));
                }
                Some(Ok(WsMessage::Close(_))) | None => return Outcome::Lost,
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    debug!(%error, "websocket error");
                    return Outcome::Lost;
                }
            },
            command = commands.recv() => match command {
                Some(Command::Send(text)) => {
                    if sink.send(WsMessage::Text(text)).await.is_err() {
                        return Outcome::Lost;
                    }
                }
                Some(Command::Disconnect) => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return Outcome::Disconnected;
                }
                Some(Command::Connect) => {
                    let _ = sink.close().await;
                    return Outcome::Reconnect;
                }
                None => {
                    let _ = sink.close().await;
                    return Outcome::Shutdown;
                }
            },
        }
    }
}

/// Sleep for `wait`, unless a command cuts the timer short.
async fn backoff(commands: &mut mpsc::UnboundedReceiver<Command>, wait: Duration) -> Timer {
    let sleep = tokio::time::sleep(wait);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return Timer::Elapsed,
            command = commands.recv() => match command {
                Some(Command::Connect) => return Timer::Connect,
                Some(Command::Disconnect) => return Timer::Disconnect,
                Some(Command::Send(_)) => {} // not open; dropped
                None => return Timer::Shutdown,
            },
        }
    }
}

/// Idle until the caller asks for a connection. Returns `false` when every
/// handle is gone.
async fn await_connect(
    commands: &mut mpsc::UnboundedReceiver<Command>,
    events: &mpsc::UnboundedSender<SocketEvent>,
) -> bool {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Connect => return true,
            Command::Disconnect => {
                let _ = events.send(SocketEvent::Disconnect);
            }
            Command::Send(_) => {}
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn defaults_match_contract() {
        let config = SocketConfig::default();
        assert!(config.auto_connect);
        assert_eq!(config.max_attempts, 10);
        assert_eq!(config.min_wait, ms(2000));
        assert_eq!(config.max_wait, ms(10000));
        assert_eq!(config.wait_extend, ms(1000));
        assert_eq!(config.initial_wait, ms(1000));
    }

    #[test]
    fn wait_grows_linearly_and_clamps() {
        let config = SocketConfig {
            min_wait: ms(100),
            max_wait: ms(200),
            wait_extend: ms(50),
            ..Default::default()
        };

        let mut wait = config.min_wait;
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(wait);
            wait = grow_wait(wait, &config);
        }
        assert_eq!(seen, vec![ms(100), ms(150), ms(200), ms(200)]);
    }

    #[test]
    fn wait_never_exceeds_ceiling_from_any_start() {
        let config = SocketConfig::default();
        let mut wait = config.initial_wait;
        for _ in 0..32 {
            wait = grow_wait(wait, &config);
            assert!(wait <= config.max_wait);
        }
        assert_eq!(wait, config.max_wait);
    }

    #[tokio::test]
    async fn refused_connection_exhausts_attempts() {
        // Bind then drop, so the port refuses connections.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = SocketConfig {
            max_attempts: 2,
            min_wait: ms(10),
            max_wait: ms(40),
            wait_extend: ms(10),
            initial_wait: ms(10),
            ..Default::default()
        };
        let (socket, mut events) = Socket::new(format!("ws://{}/", addr), config);
        socket.connect();

        let mut closes = 0;
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("socket went silent")
                .expect("socket task died");
            match event {
                SocketEvent::Close => closes += 1,
                SocketEvent::Disconnect => break,
                other => panic!("unexpected event: {:?}", other),
            }
        }
        // Initial dial plus two scheduled retries.
        assert_eq!(closes, 3);
        assert!(!socket.is_open());
    }

    #[tokio::test]
    async fn send_is_dropped_while_closed() {
        let (socket, _events) = Socket::new("ws://127.0.0.1:1/".into(), SocketConfig::default());
        assert!(!socket.send_json(&serde_json::json!({"x": 1})));
    }
}
