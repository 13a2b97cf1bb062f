//! # Sporket
//!
//! Lightweight authenticated message bus over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          SPORKET                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  protocol.rs - Signed JSON envelope codec (HMAC-SHA-256)    │
//! │  auth.rs     - Shared secret + challenge digest             │
//! │  socket.rs   - Outbound WebSocket with bounded reconnect    │
//! │  client.rs   - Sporket: client handshake + application send │
//! │  session.rs  - ServerClient: per-connection server session  │
//! │  server.rs   - Acceptor, session registry, broadcast        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Protocol
//!
//! Every frame is one JSON envelope whose payload travels base64-encoded and
//! whose signature is HMAC-SHA-256 over `id || now || payload`, keyed by the
//! session uuid the server assigns at accept time. The client proves
//! knowledge of the deployment password (`SPORKET_PASSWORD`) by answering
//! with `base64(SHA-256(password || uuid))`; only then does either side
//! surface application payloads.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod auth;
pub mod client;
pub mod protocol;
pub mod server;
pub mod session;
pub mod socket;

pub use auth::{compute_challenge, shared_secret, AuthError, PASSWORD_ENV};
pub use client::{ClientEvent, Sporket, SporketConfig};
pub use protocol::{Message, MessageType, Payload, ProtocolError, SessionKey, Status};
pub use server::{Server, ServerConfig, ServerError, ServerEvent};
pub use session::{ServerClient, SessionEvent};
pub use socket::{Socket, SocketConfig, SocketEvent, WeakSocket};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
