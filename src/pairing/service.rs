//! Pairing policy: request / approve / reject / revoke / verify, plus the
//! handshake-time pairing check with loopback auto-approval.

use std::sync::Arc;

use super::store::{DeviceAuthToken, PairedDevice, PendingRequest, Store};
use super::{generate_nonce, generate_token, now_ms, verify_token, Error};

/// Input to [`Service::request_pairing`].
#[derive(Debug, Clone, Default)]
pub struct PairingRequestInput {
    pub device_id: String,
    pub public_key: String,
    pub display_name: String,
    pub platform: String,
    pub client_id: String,
    pub client_mode: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub remote_ip: String,
    /// True → silent auto-approve flow.
    pub is_local: bool,
}

/// Input to [`Service::verify_device_token`].
#[derive(Debug, Clone, Default)]
pub struct VerifyTokenParams {
    pub device_id: String,
    pub token: String,
    pub role: String,
    pub scopes: Vec<String>,
}

/// Why a token verification failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyFailure {
    DeviceNotPaired,
    TokenMissing,
    TokenRevoked,
    TokenMismatch,
    ScopeMismatch,
}

impl VerifyFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DeviceNotPaired => "device-not-paired",
            Self::TokenMissing => "token-missing",
            Self::TokenRevoked => "token-revoked",
            Self::TokenMismatch => "token-mismatch",
            Self::ScopeMismatch => "scope-mismatch",
        }
    }
}

/// Outcome of a token verification.
#[derive(Debug, Clone)]
pub struct VerifyTokenResult {
    pub ok: bool,
    pub reason: Option<VerifyFailure>,
}

/// Input to [`Service::check_pairing_status`].
#[derive(Debug, Clone, Default)]
pub struct CheckPairingParams {
    pub device_id: String,
    pub public_key: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub is_local: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingStatus {
    Paired,
    AutoApproved,
    PairingRequired,
}

/// Result of a handshake-time pairing check.
#[derive(Debug, Clone)]
pub struct PairingAction {
    pub status: PairingStatus,
    /// Set when status is `PairingRequired`.
    pub request_id: Option<String>,
    pub device: Option<PairedDevice>,
}

/// Orchestrates pairing over the persistent [`Store`].
#[derive(Debug, Clone)]
pub struct Service {
    store: Arc<Store>,
}

impl Service {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Underlying store, for operator tooling.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Create a pending request for an unpaired device.
    ///
    /// Returns `None` when the device is already paired with an identical
    /// public key (no action needed). An existing pending request for the
    /// device is returned as-is instead of creating a duplicate.
    pub fn request_pairing(
        &self,
        input: PairingRequestInput,
    ) -> Result<Option<PendingRequest>, Error> {
        if input.device_id.is_empty() {
            return Err(Error::DeviceIdRequired);
        }

        self.store.prune_expired_pending(now_ms())?;

        let existing = self.store.get_paired(&input.device_id);
        if let Some(paired) = &existing {
            if paired.public_key == input.public_key {
                return Ok(None);
            }
        }

        if let Some(pending) = self
            .store
            .list_pending()
            .into_iter()
            .find(|p| p.device_id == input.device_id)
        {
            return Ok(Some(pending));
        }

        // A paired device presenting a different key is a repair request.
        let is_repair = existing.is_some();
        let pending = PendingRequest {
            request_id: generate_nonce(),
            device_id: input.device_id,
            public_key: input.public_key,
            display_name: input.display_name,
            platform: input.platform,
            client_id: input.client_id,
            client_mode: input.client_mode,
            role: input.role,
            scopes: input.scopes,
            remote_ip: input.remote_ip,
            silent: input.is_local,
            is_repair,
            timestamp: now_ms(),
        };
        self.store.add_pending(pending.clone())?;
        Ok(Some(pending))
    }

    /// Approve a pending request: move the device from pending to paired and
    /// mint a token for the requested role. Returns `None` if the request id
    /// is unknown.
    pub fn approve(&self, request_id: &str) -> Result<Option<PairedDevice>, Error> {
        let Some(removed) = self.store.remove_pending(request_id)? else {
            return Ok(None);
        };

        let now = now_ms();
        let device = match self.store.get_paired(&removed.device_id) {
            Some(mut existing) => {
                // Merge: refresh the key and any metadata the request carried.
                existing.public_key = removed.public_key.clone();
                if !removed.display_name.is_empty() {
                    existing.display_name = removed.display_name.clone();
                }
                if !removed.platform.is_empty() {
                    existing.platform = removed.platform.clone();
                }
                if !removed.client_id.is_empty() {
                    existing.client_id = removed.client_id.clone();
                }
                if !removed.client_mode.is_empty() {
                    existing.client_mode = removed.client_mode.clone();
                }
                if !removed.remote_ip.is_empty() {
                    existing.remote_ip = removed.remote_ip.clone();
                }
                existing.approved_at_ms = now;
                existing
            }
            None => PairedDevice {
                device_id: removed.device_id.clone(),
                public_key: removed.public_key.clone(),
                display_name: removed.display_name.clone(),
                platform: removed.platform.clone(),
                client_id: removed.client_id.clone(),
                client_mode: removed.client_mode.clone(),
                role: removed.role.clone(),
                scopes: removed.scopes.clone(),
                remote_ip: removed.remote_ip.clone(),
                tokens: Default::default(),
                created_at_ms: now,
                approved_at_ms: now,
            },
        };
        self.store.set_paired(device)?;

        if !removed.role.is_empty() {
            let token = DeviceAuthToken {
                token: generate_token()?,
                role: removed.role.clone(),
                scopes: removed.scopes.clone(),
                created_at_ms: now,
                ..Default::default()
            };
            self.store
                .set_device_token(&removed.device_id, &removed.role, token)?;
        }

        Ok(self.store.get_paired(&removed.device_id))
    }

    /// Remove a pending request without approving. Returns the removed
    /// request, or `None` if not found.
    pub fn reject(&self, request_id: &str) -> Result<Option<PendingRequest>, Error> {
        self.store.remove_pending(request_id)
    }

    /// Validate a device token for a role and scope set. Updates
    /// `lastUsedAtMs` on success.
    pub fn verify_device_token(&self, params: &VerifyTokenParams) -> VerifyTokenResult {
        let Some(device) = self.store.get_paired(&params.device_id) else {
            return fail(VerifyFailure::DeviceNotPaired);
        };
        let Some(tok) = device.tokens.get(&params.role) else {
            return fail(VerifyFailure::TokenMissing);
        };
        if tok.revoked_at_ms.is_some() {
            return fail(VerifyFailure::TokenRevoked);
        }
        if !verify_token(&params.token, &tok.token) {
            return fail(VerifyFailure::TokenMismatch);
        }
        if !scopes_contain_all(&tok.scopes, &params.scopes) {
            return fail(VerifyFailure::ScopeMismatch);
        }

        let mut used = tok.clone();
        used.last_used_at_ms = Some(now_ms());
        if let Err(err) = self
            .store
            .set_device_token(&params.device_id, &params.role, used)
        {
            tracing::warn!(error = %err, device_id = %params.device_id, "failed to record token use");
        }
        VerifyTokenResult {
            ok: true,
            reason: None,
        }
    }

    /// Return (or mint) a token for a paired device and role. An existing
    /// non-revoked token whose scopes cover the request is returned
    /// unchanged; otherwise a new one is minted, marked rotated when it
    /// replaces a prior token. `None` when the device is not paired.
    pub fn ensure_device_token(
        &self,
        device_id: &str,
        role: &str,
        scopes: &[String],
    ) -> Result<Option<DeviceAuthToken>, Error> {
        let Some(device) = self.store.get_paired(device_id) else {
            return Ok(None);
        };

        let existing = device.tokens.get(role);
        if let Some(tok) = existing {
            if tok.revoked_at_ms.is_none() && scopes_contain_all(&tok.scopes, scopes) {
                return Ok(Some(tok.clone()));
            }
        }

        let now = now_ms();
        let token = DeviceAuthToken {
            token: generate_token()?,
            role: role.to_string(),
            scopes: scopes.to_vec(),
            created_at_ms: now,
            rotated_at_ms: existing.is_some().then_some(now),
            ..Default::default()
        };
        self.store.set_device_token(device_id, role, token.clone())?;
        Ok(Some(token))
    }

    /// Mark a device's token for a role as revoked. Returns the revoked
    /// token, or `None` when device or token is absent.
    pub fn revoke_device_token(
        &self,
        device_id: &str,
        role: &str,
    ) -> Result<Option<DeviceAuthToken>, Error> {
        let Some(device) = self.store.get_paired(device_id) else {
            return Ok(None);
        };
        let Some(tok) = device.tokens.get(role) else {
            return Ok(None);
        };
        let mut revoked = tok.clone();
        revoked.revoked_at_ms = Some(now_ms());
        self.store
            .set_device_token(device_id, role, revoked.clone())?;
        Ok(Some(revoked))
    }

    /// Determine what action the handshake needs for this device. Called by
    /// the session after signature verification succeeds.
    pub fn check_pairing_status(&self, params: &CheckPairingParams) -> Result<PairingAction, Error> {
        // Best-effort reload in case an operator tool updated the store.
        if let Err(err) = self.store.reload() {
            tracing::warn!(error = %err, "pairing store reload failed");
        }

        if let Some(device) = self.store.get_paired(&params.device_id) {
            if device.public_key == params.public_key {
                return Ok(PairingAction {
                    status: PairingStatus::Paired,
                    request_id: None,
                    device: Some(device),
                });
            }
        }

        let input = PairingRequestInput {
            device_id: params.device_id.clone(),
            public_key: params.public_key.clone(),
            role: params.role.clone(),
            scopes: params.scopes.clone(),
            is_local: params.is_local,
            ..Default::default()
        };

        if params.is_local {
            let Some(pending) = self.request_pairing(input)? else {
                // Raced: another connection paired the device meanwhile.
                return Ok(PairingAction {
                    status: PairingStatus::Paired,
                    request_id: None,
                    device: self.store.get_paired(&params.device_id),
                });
            };
            let request_id = pending.request_id.clone();
            return match self.approve(&request_id) {
                Ok(Some(device)) => Ok(PairingAction {
                    status: PairingStatus::AutoApproved,
                    request_id: None,
                    device: Some(device),
                }),
                // Approval fell through: degrade to operator-mediated pairing.
                Ok(None) => Ok(pairing_required(request_id)),
                Err(err) => {
                    tracing::warn!(error = %err, "silent auto-approve failed");
                    Ok(pairing_required(request_id))
                }
            };
        }

        let pending = self.request_pairing(input)?;
        Ok(pairing_required(
            pending.map(|p| p.request_id).unwrap_or_default(),
        ))
    }
}

fn pairing_required(request_id: String) -> PairingAction {
    PairingAction {
        status: PairingStatus::PairingRequired,
        request_id: Some(request_id),
        device: None,
    }
}

fn fail(reason: VerifyFailure) -> VerifyTokenResult {
    VerifyTokenResult {
        ok: false,
        reason: Some(reason),
    }
}

/// True when `have` contains every scope in `need`.
fn scopes_contain_all(have: &[String], need: &[String]) -> bool {
    need.iter().all(|scope| have.contains(scope))
}
