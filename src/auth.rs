//! Shared-Secret Authentication
//!
//! The bus authenticates with a single out-of-band deployment password.
//! The client proves possession of it by sending the challenge digest
//! `base64(SHA-256(password || uuid))`; the server recomputes the digest
//! and compares. The password itself never crosses the wire.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Environment variable holding the shared secret.
pub const PASSWORD_ENV: &str = "SPORKET_PASSWORD";

/// Authentication errors.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    /// The shared secret is not configured.
    #[error("shared secret not configured (set SPORKET_PASSWORD)")]
    MissingSecret,
}

/// Read the shared secret from the environment.
///
/// Read at each challenge computation, not cached: rotating the secret
/// mid-process affects the next handshake while leaving established
/// sessions untouched.
pub fn shared_secret() -> Result<String, AuthError> {
    std::env::var(PASSWORD_ENV).map_err(|_| AuthError::MissingSecret)
}

/// The challenge digest for a session: `base64(SHA-256(password || uuid))`.
pub fn compute_challenge(password: &str, uuid: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(uuid.as_bytes());
    BASE64.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_is_deterministic() {
        let a = compute_challenge("hunter2", "uuid-1");
        let b = compute_challenge("hunter2", "uuid-1");
        assert_eq!(a, b);
    }

    #[test]
    fn challenge_binds_password_and_uuid() {
        let base = compute_challenge("hunter2", "uuid-1");
        assert_ne!(base, compute_challenge("hunter3", "uuid-1"));
        assert_ne!(base, compute_challenge("hunter2", "uuid-2"));
    }

    #[test]
    fn challenge_matches_manual_digest() {
        let mut hasher = Sha256::new();
        hasher.update(b"hunter2uuid-1");
        let expected = BASE64.encode(hasher.finalize());
        assert_eq!(compute_challenge("hunter2", "uuid-1"), expected);
    }
}
