//! Cryptographic device identity.
//!
//! A device is identified by the SHA-256 digest of its raw Ed25519 public
//! key, so the identifier cannot be forged without the matching private key.
//! The signing payload format is normative: signing and verifying sides must
//! agree byte-for-byte.

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Expected size of a raw Ed25519 public key.
const ED25519_PUBLIC_KEY_SIZE: usize = 32;

/// Fields covered by the device signature.
#[derive(Debug, Clone, Default)]
pub struct AuthPayloadParams {
    pub device_id: String,
    pub client_id: String,
    pub client_mode: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub signed_at_ms: i64,
    /// Gateway auth token (empty when no shared secret is configured).
    pub token: String,
    /// Server-issued challenge nonce.
    pub nonce: String,
}

/// SHA-256 hex digest of the raw 32-byte public key, or `None` if the
/// base64url encoding or key length is invalid.
pub fn derive_device_id(public_key_b64url: &str) -> Option<String> {
    let raw = decode_public_key(public_key_b64url)?;
    Some(hex::encode(Sha256::digest(raw)))
}

/// Re-encode a base64url public key to canonical unpadded form. Idempotent;
/// `None` if invalid.
pub fn normalize_public_key(public_key_b64url: &str) -> Option<String> {
    let raw = decode_public_key(public_key_b64url)?;
    Some(URL_SAFE_NO_PAD.encode(raw))
}

/// Construct the pipe-delimited signing payload:
/// `v2|deviceId|clientId|clientMode|role|scopes|signedAtMs|token|nonce`
/// where `scopes` is comma-joined in the given order.
pub fn build_auth_payload(p: &AuthPayloadParams) -> String {
    let scopes = p.scopes.join(",");
    format!(
        "v2|{}|{}|{}|{}|{}|{}|{}|{}",
        p.device_id, p.client_id, p.client_mode, p.role, scopes, p.signed_at_ms, p.token, p.nonce
    )
}

/// Verify an Ed25519 signature over `payload`. Returns false on any decode
/// error, wrong key or signature length, or cryptographic failure.
pub fn verify_signature(public_key_b64url: &str, payload: &str, signature_b64url: &str) -> bool {
    let Some(raw) = decode_public_key(public_key_b64url) else {
        return false;
    };
    let Ok(key_bytes) = <[u8; 32]>::try_from(raw.as_slice()) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig_raw) = URL_SAFE_NO_PAD
        .decode(signature_b64url)
        .or_else(|_| URL_SAFE.decode(signature_b64url))
    else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&sig_raw) else {
        return false;
    };
    key.verify(payload.as_bytes(), &signature).is_ok()
}

/// Random UUIDv4 string for the connect challenge.
pub fn generate_nonce() -> String {
    Uuid::new_v4().to_string()
}

/// Decode a base64url public key (unpadded or padded) and validate length.
fn decode_public_key(public_key_b64url: &str) -> Option<Vec<u8>> {
    if public_key_b64url.is_empty() {
        return None;
    }
    let raw = URL_SAFE_NO_PAD
        .decode(public_key_b64url)
        .or_else(|_| URL_SAFE.decode(public_key_b64url))
        .ok()?;
    if raw.len() != ED25519_PUBLIC_KEY_SIZE {
        return None;
    }
    Some(raw)
}
