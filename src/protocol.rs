//! Wire Protocol
//!
//! Envelope format for bus traffic over WebSocket text frames.
//! Every frame is one JSON `Message`; the application payload travels as a
//! base64 string and every transmitted envelope carries an HMAC-SHA-256
//! signature over the canonical string `id || now || payload`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Application payload: a JSON object keyed by strings.
pub type Payload = serde_json::Map<String, Value>;

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    /// Status code outside the closed set.
    #[error("unknown status code: {0}")]
    UnknownStatus(u16),
}

/// Envelope kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    /// Handshake traffic (identity, challenge, success marker).
    Auth,
    /// Liveness probe; surfaced to the application like data.
    Ping,
    /// Application data.
    Data,
    /// Protocol-level failure report.
    Error,
}

/// Envelope status code. Serialized as the bare integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum Status {
    /// Success.
    Ok,
    /// Malformed frame or invalid signature.
    BadRequest,
    /// Authentication failure or premature data.
    Unauthorized,
    /// Graceful server shutdown signal.
    Teapot,
    /// Internal failure. Defined but unused.
    ServerError,
}

impl From<Status> for u16 {
    fn from(status: Status) -> u16 {
        match status {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::Unauthorized => 401,
            Status::Teapot => 418,
            Status::ServerError => 500,
        }
    }
}

impl TryFrom<u16> for Status {
    type Error = ProtocolError;

    fn try_from(code: u16) -> Result<Self, ProtocolError> {
        match code {
            200 => Ok(Status::Ok),
            400 => Ok(Status::BadRequest),
            401 => Ok(Status::Unauthorized),
            418 => Ok(Status::Teapot),
            500 => Ok(Status::ServerError),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }
}

/// Per-session HMAC-SHA-256 key.
///
/// Both endpoints derive the same key from the session uuid string, so the
/// key itself never crosses the wire. Knowing the uuid is not enough to
/// authenticate: the challenge proves possession of the shared secret.
#[derive(Debug, Clone)]
pub struct SessionKey {
    material: Vec<u8>,
}

impl SessionKey {
    /// Derive the key from a session uuid. The key material is the UTF-8
    /// bytes of the uuid string itself.
    pub fn derive(uuid: &str) -> Self {
        Self {
            material: uuid.as_bytes().to_vec(),
        }
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC-SHA-256 accepts keys of any length.
        HmacSha256::new_from_slice(&self.material).expect("hmac accepts any key length")
    }

    /// Compute the base64 tag over `data`.
    pub fn sign(&self, data: &[u8]) -> String {
        let mut mac = self.mac();
        mac.update(data);
        BASE64.encode(mac.finalize().into_bytes())
    }

    /// Constant-time check of `tag` against the tag for `data`.
    pub fn verify(&self, data: &[u8], tag: &[u8]) -> bool {
        let mut mac = self.mac();
        mac.update(data);
        mac.verify_slice(tag).is_ok()
    }
}

/// One wire frame.
///
/// Field names are part of the protocol and must not change. `payload` is
/// always the base64 form on the wire, never a raw object; `signature` is
/// empty only on a pre-sign draft, which is never transmitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Envelope identifier. A fresh random uuid, except for the server's
    /// first AUTH where it equals the session uuid.
    pub id: String,
    /// Milliseconds since the Unix epoch at send time.
    pub now: u64,
    /// Envelope kind.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Status code.
    pub status: Status,
    /// base64 of the UTF-8 JSON of the payload object.
    pub payload: String,
    /// base64 HMAC-SHA-256 tag over the canonical string.
    pub signature: String,
}

impl Message {
    /// Build an unsigned envelope with a fresh uuid identifier.
    pub fn new(payload: &Payload, kind: MessageType, status: Status) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), payload, kind, status)
    }

    /// Build an unsigned envelope with an explicit identifier. Used by the
    /// server's identity AUTH, whose id is the session uuid.
    pub(crate) fn with_id(
        id: String,
        payload: &Payload,
        kind: MessageType,
        status: Status,
    ) -> Self {
        Self {
            id,
            now: epoch_millis(),
            kind,
            status,
            payload: encode_payload(payload),
            signature: String::new(),
        }
    }

    /// The HMAC input: `id || decimal(now) || payload_wire`, no separators.
    ///
    /// The base64 payload string is signed as-is; signing the decoded object
    /// would break interoperability.
    fn canonical(&self) -> String {
        format!("{}{}{}", self.id, self.now, self.payload)
    }

    /// Attach the signature for `key` and return the envelope.
    pub fn sign(mut self, key: &SessionKey) -> Self {
        self.signature = key.sign(self.canonical().as_bytes());
        self
    }

    /// Check the signature against `key`.
    ///
    /// Fails closed: an absent key, an undecodable signature, or a tag
    /// mismatch all yield `false`. Never panics, never propagates.
    pub fn verify(&self, key: Option<&SessionKey>) -> bool {
        let Some(key) = key else {
            return false;
        };
        let Ok(tag) = BASE64.decode(&self.signature) else {
            return false;
        };
        key.verify(self.canonical().as_bytes(), &tag)
    }

    /// Decode the payload into application space.
    ///
    /// Any failure (bad base64, bad UTF-8, bad JSON, non-object JSON) yields
    /// an empty object, so handshake code can probe absent and malformed
    /// fields uniformly.
    pub fn decode_payload(&self) -> Payload {
        let Ok(raw) = BASE64.decode(&self.payload) else {
            return Payload::new();
        };
        let Ok(value) = serde_json::from_slice::<Value>(&raw) else {
            return Payload::new();
        };
        match value {
            Value::Object(map) => map,
            _ => Payload::new(),
        }
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from a JSON text frame.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// base64 of the UTF-8 JSON encoding of `payload`.
fn encode_payload(payload: &Payload) -> String {
    BASE64.encode(Value::Object(payload.clone()).to_string())
}

/// Milliseconds since the Unix epoch.
pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn key() -> SessionKey {
        SessionKey::derive("a8098c1a-f86e-11da-bd1a-00112444be1e")
    }

    #[test]
    fn sign_verify_roundtrip() {
        let msg = Message::new(
            &payload(json!({"hello": "world"})),
            MessageType::Data,
            Status::Ok,
        )
        .sign(&key());

        assert!(msg.verify(Some(&key())));
    }

    #[test]
    fn verify_rejects_mutations() {
        let signed = Message::new(
            &payload(json!({"n": 1})),
            MessageType::Data,
            Status::Ok,
        )
        .sign(&key());

        let mut tampered = signed.clone();
        tampered.id = Uuid::new_v4().to_string();
        assert!(!tampered.verify(Some(&key())));

        let mut tampered = signed.clone();
        tampered.now += 1;
        assert!(!tampered.verify(Some(&key())));

        let mut tampered = signed.clone();
        tampered.payload = BASE64.encode(r#"{"n":2}"#);
        assert!(!tampered.verify(Some(&key())));

        assert!(signed.verify(Some(&key())));
    }

    #[test]
    fn verify_fails_closed() {
        let signed = Message::new(&Payload::new(), MessageType::Data, Status::Ok).sign(&key());

        // No key yet (pre-handshake).
        assert!(!signed.verify(None));

        // Wrong key.
        let other = SessionKey::derive("00000000-0000-0000-0000-000000000000");
        assert!(!signed.verify(Some(&other)));

        // Signature that is not base64 at all.
        let mut garbled = signed.clone();
        garbled.signature = "!!not base64!!".into();
        assert!(!garbled.verify(Some(&key())));

        // Draft with no signature.
        let draft = Message::new(&Payload::new(), MessageType::Data, Status::Ok);
        assert!(!draft.verify(Some(&key())));
    }

    #[test]
    fn canonical_string_matches_manual_hmac() {
        let msg = Message::new(
            &payload(json!({"k": "v"})),
            MessageType::Data,
            Status::Ok,
        )
        .sign(&key());

        let input = format!("{}{}{}", msg.id, msg.now, msg.payload);
        let mut mac = HmacSha256::new_from_slice(b"a8098c1a-f86e-11da-bd1a-00112444be1e").unwrap();
        mac.update(input.as_bytes());
        let expected = BASE64.encode(mac.finalize().into_bytes());

        assert_eq!(msg.signature, expected);
    }

    #[test]
    fn payload_roundtrip() {
        let original = payload(json!({
            "text": "hi",
            "count": 3,
            "flag": true,
            "nothing": null,
            "list": [1, 2, 3],
            "nested": {"deep": "value"}
        }));
        let msg = Message::new(&original, MessageType::Data, Status::Ok);
        assert_eq!(msg.decode_payload(), original);
    }

    #[test]
    fn decode_payload_falls_back_to_empty() {
        let mut msg = Message::new(&Payload::new(), MessageType::Data, Status::Ok);

        msg.payload = "%%%".into();
        assert!(msg.decode_payload().is_empty());

        msg.payload = BASE64.encode("not json");
        assert!(msg.decode_payload().is_empty());

        msg.payload = BASE64.encode("[1,2,3]");
        assert!(msg.decode_payload().is_empty());
    }

    #[test]
    fn wire_format_is_stable() {
        let msg = Message::new(&payload(json!({"a": 1})), MessageType::Auth, Status::Ok)
            .sign(&key());
        let json = msg.to_json().unwrap();

        assert!(json.contains(r#""type":"AUTH""#));
        assert!(json.contains(r#""status":200"#));
        assert!(json.contains(r#""id":"#));
        assert!(json.contains(r#""now":"#));
        assert!(json.contains(r#""payload":"#));
        assert!(json.contains(r#""signature":"#));

        let parsed = Message::from_json(&json).unwrap();
        assert_eq!(parsed.kind, MessageType::Auth);
        assert_eq!(parsed.status, Status::Ok);
        assert!(parsed.verify(Some(&key())));
    }

    #[test]
    fn status_codes_are_the_closed_set() {
        assert_eq!(u16::from(Status::Ok), 200);
        assert_eq!(u16::from(Status::BadRequest), 400);
        assert_eq!(u16::from(Status::Unauthorized), 401);
        assert_eq!(u16::from(Status::Teapot), 418);
        assert_eq!(u16::from(Status::ServerError), 500);
        assert!(Status::try_from(302).is_err());
    }

    #[test]
    fn fresh_messages_get_unique_ids() {
        let a = Message::new(&Payload::new(), MessageType::Data, Status::Ok);
        let b = Message::new(&Payload::new(), MessageType::Data, Status::Ok);
        assert_ne!(a.id, b.id);
    }
}
