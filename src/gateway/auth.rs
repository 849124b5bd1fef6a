//! Legacy shared-secret authentication for the connect handshake.

use crate::protocol::ConnectAuth;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    #[default]
    None,
    Token,
}

/// Server-side authentication settings.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub mode: AuthMode,
    /// Required when mode is [`AuthMode::Token`].
    pub token: String,
}

impl AuthConfig {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn token(token: impl Into<String>) -> Self {
        Self {
            mode: AuthMode::Token,
            token: token.into(),
        }
    }
}

/// Outcome of an authentication attempt.
#[derive(Debug, Clone)]
pub struct AuthResult {
    pub ok: bool,
    pub method: &'static str,
    /// Failure reason, empty on success.
    pub reason: &'static str,
}

/// Check the provided credentials against the server config.
pub fn authenticate(cfg: &AuthConfig, provided: Option<&ConnectAuth>) -> AuthResult {
    match cfg.mode {
        AuthMode::None => AuthResult {
            ok: true,
            method: "none",
            reason: "",
        },
        AuthMode::Token => {
            let token = provided.map(|auth| auth.token.as_str()).unwrap_or_default();
            if token.is_empty() {
                return AuthResult {
                    ok: false,
                    method: "token",
                    reason: "token_missing",
                };
            }
            if !timing_safe_eq(&cfg.token, token) {
                return AuthResult {
                    ok: false,
                    method: "token",
                    reason: "token_mismatch",
                };
            }
            AuthResult {
                ok: true,
                method: "token",
                reason: "",
            }
        }
    }
}

/// Timing-safe string equality.
pub(crate) fn timing_safe_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut out = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        out |= x ^ y;
    }
    out == 0
}
