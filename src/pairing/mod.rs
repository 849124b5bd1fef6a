//! Device pairing: identity derivation, challenge/response verification,
//! persistent pending/approved state, and token issuance.

mod identity;
mod service;
mod store;
mod token;

pub use identity::{
    build_auth_payload, derive_device_id, generate_nonce, normalize_public_key, verify_signature,
    AuthPayloadParams,
};
pub use service::{
    CheckPairingParams, PairingAction, PairingRequestInput, PairingStatus, Service, VerifyFailure,
    VerifyTokenParams, VerifyTokenResult,
};
pub use store::{
    DeviceAuthToken, DeviceMetadataPatch, PairedDevice, PendingRequest, Store, PENDING_TTL_MS,
};
pub use token::{generate_token, verify_token};

use std::time::{SystemTime, UNIX_EPOCH};

/// Errors surfaced by the pairing store and service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("random source unavailable: {0}")]
    Rng(#[from] getrandom::Error),
    #[error("device {0:?} not found")]
    DeviceNotFound(String),
    #[error("deviceId is required")]
    DeviceIdRequired,
}

/// Current time in milliseconds since epoch.
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
