//! Opaque pairing token generation and verification.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

/// Generate a 32-byte cryptographically random token encoded as unpadded
/// base64url.
pub fn generate_token() -> Result<String, getrandom::Error> {
    let mut buf = [0u8; 32];
    getrandom::fill(&mut buf)?;
    Ok(URL_SAFE_NO_PAD.encode(buf))
}

/// Constant-time token comparison over byte length. Any length difference or
/// byte difference yields false. Two empty strings compare equal (vacuously
/// true; callers never compare empty expected tokens).
pub fn verify_token(provided: &str, expected: &str) -> bool {
    if provided.len() != expected.len() {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in provided.bytes().zip(expected.bytes()) {
        diff |= a ^ b;
    }
    diff == 0
}
