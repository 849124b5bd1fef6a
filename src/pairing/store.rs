//! Durable custody of pending pairing requests and paired devices.
//!
//! State lives in two JSON maps under the state directory: `pending.json`
//! (request-id → pending request) and `paired.json` (device-id → paired
//! device). The files double as the contract with external operator tooling,
//! which may edit them while the gateway runs; `reload` re-reads them on
//! demand. Every write lands in a temp file and is renamed over the target,
//! so an interrupted write leaves the previous state intact.

use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{now_ms, Error};

/// Pending requests older than this are unreachable and prunable.
pub const PENDING_TTL_MS: i64 = 5 * 60 * 1000;

const PENDING_FILE: &str = "pending.json";
const PAIRED_FILE: &str = "paired.json";

/// A device waiting for operator approval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequest {
    pub request_id: String,
    pub device_id: String,
    /// base64url public key.
    pub public_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub platform: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_mode: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty", rename = "remoteIP")]
    pub remote_ip: String,
    /// True for the loopback auto-approve flow.
    #[serde(default)]
    pub silent: bool,
    /// True when re-pairing an already-paired device with a new key.
    #[serde(default)]
    pub is_repair: bool,
    /// Unix ms.
    #[serde(rename = "ts")]
    pub timestamp: i64,
}

/// Per-role token issued after pairing approval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAuthToken {
    pub token: String,
    pub role: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub created_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotated_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at_ms: Option<i64>,
}

/// A fully paired device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairedDevice {
    pub device_id: String,
    pub public_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub platform: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_mode: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty", rename = "remoteIP")]
    pub remote_ip: String,
    /// Tokens keyed by role name.
    #[serde(default)]
    pub tokens: HashMap<String, DeviceAuthToken>,
    pub created_at_ms: i64,
    pub approved_at_ms: i64,
}

/// Optional fields for updating paired-device metadata. Only `Some` fields
/// are applied.
#[derive(Debug, Clone, Default)]
pub struct DeviceMetadataPatch {
    pub display_name: Option<String>,
    pub platform: Option<String>,
    pub client_id: Option<String>,
    pub client_mode: Option<String>,
    pub role: Option<String>,
    pub scopes: Option<Vec<String>>,
    pub remote_ip: Option<String>,
}

#[derive(Debug, Default)]
struct PairingState {
    pending_by_id: HashMap<String, PendingRequest>,
    paired_by_device: HashMap<String, PairedDevice>,
}

/// Persistent pairing state. A single mutex serializes every operation; all
/// mutating operations persist before returning.
pub struct Store {
    state: Mutex<PairingState>,
    state_dir: PathBuf,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("state_dir", &self.state_dir)
            .finish()
    }
}

impl Store {
    /// Load existing state from disk or initialize empty state. Creates the
    /// state directory with owner-only permissions.
    pub fn new(state_dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let state_dir = state_dir.into();
        create_private_dir(&state_dir)?;

        let state = PairingState {
            pending_by_id: load_json(&state_dir.join(PENDING_FILE))?,
            paired_by_device: load_json(&state_dir.join(PAIRED_FILE))?,
        };
        Ok(Self {
            state: Mutex::new(state),
            state_dir,
        })
    }

    /// Re-read both state files from disk, replacing in-memory state.
    /// External tools (operator CLI) are expected to edit the files while
    /// the gateway is running.
    pub fn reload(&self) -> Result<(), Error> {
        let pending = load_json(&self.state_dir.join(PENDING_FILE))?;
        let paired = load_json(&self.state_dir.join(PAIRED_FILE))?;
        let mut state = self.state.lock();
        state.pending_by_id = pending;
        state.paired_by_device = paired;
        Ok(())
    }

    // --- Read operations ---

    /// Pending request by id. Expired entries read as absent.
    pub fn get_pending(&self, request_id: &str) -> Option<PendingRequest> {
        let state = self.state.lock();
        state
            .pending_by_id
            .get(request_id)
            .filter(|req| !is_expired(req, now_ms()))
            .cloned()
    }

    /// Paired device by id.
    pub fn get_paired(&self, device_id: &str) -> Option<PairedDevice> {
        self.state.lock().paired_by_device.get(device_id).cloned()
    }

    /// All live pending requests, newest first.
    pub fn list_pending(&self) -> Vec<PendingRequest> {
        let now = now_ms();
        let state = self.state.lock();
        let mut result: Vec<_> = state
            .pending_by_id
            .values()
            .filter(|req| !is_expired(req, now))
            .cloned()
            .collect();
        result.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        result
    }

    /// All paired devices, most recently approved first.
    pub fn list_paired(&self) -> Vec<PairedDevice> {
        let state = self.state.lock();
        let mut result: Vec<_> = state.paired_by_device.values().cloned().collect();
        result.sort_by(|a, b| b.approved_at_ms.cmp(&a.approved_at_ms));
        result
    }

    // --- Write operations ---

    /// Add or overwrite a pending request.
    pub fn add_pending(&self, req: PendingRequest) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.pending_by_id.insert(req.request_id.clone(), req);
        self.save_pending(&state)
    }

    /// Remove a pending request by id, returning it. Expired entries are
    /// deleted but read as absent.
    pub fn remove_pending(&self, request_id: &str) -> Result<Option<PendingRequest>, Error> {
        let mut state = self.state.lock();
        let Some(req) = state.pending_by_id.remove(request_id) else {
            return Ok(None);
        };
        self.save_pending(&state)?;
        if is_expired(&req, now_ms()) {
            return Ok(None);
        }
        Ok(Some(req))
    }

    /// Add or update a paired device.
    pub fn set_paired(&self, device: PairedDevice) -> Result<(), Error> {
        let mut state = self.state.lock();
        state
            .paired_by_device
            .insert(device.device_id.clone(), device);
        self.save_paired(&state)
    }

    /// Set a device's token for a role. Errors if the device is absent.
    pub fn set_device_token(
        &self,
        device_id: &str,
        role: &str,
        token: DeviceAuthToken,
    ) -> Result<(), Error> {
        let mut state = self.state.lock();
        let device = state
            .paired_by_device
            .get_mut(device_id)
            .ok_or_else(|| Error::DeviceNotFound(device_id.to_string()))?;
        device.tokens.insert(role.to_string(), token);
        self.save_paired(&state)
    }

    /// Apply a metadata patch to a paired device. Only `Some` fields apply.
    pub fn update_device_metadata(
        &self,
        device_id: &str,
        patch: DeviceMetadataPatch,
    ) -> Result<(), Error> {
        let mut state = self.state.lock();
        let device = state
            .paired_by_device
            .get_mut(device_id)
            .ok_or_else(|| Error::DeviceNotFound(device_id.to_string()))?;

        if let Some(display_name) = patch.display_name {
            device.display_name = display_name;
        }
        if let Some(platform) = patch.platform {
            device.platform = platform;
        }
        if let Some(client_id) = patch.client_id {
            device.client_id = client_id;
        }
        if let Some(client_mode) = patch.client_mode {
            device.client_mode = client_mode;
        }
        if let Some(role) = patch.role {
            device.role = role;
        }
        if let Some(scopes) = patch.scopes {
            device.scopes = scopes;
        }
        if let Some(remote_ip) = patch.remote_ip {
            device.remote_ip = remote_ip;
        }
        self.save_paired(&state)
    }

    /// Remove pending entries older than the TTL. Boundary age (exactly the
    /// TTL) is kept. Returns the number of entries pruned.
    pub fn prune_expired_pending(&self, now: i64) -> Result<usize, Error> {
        let mut state = self.state.lock();
        let before = state.pending_by_id.len();
        state.pending_by_id.retain(|_, req| !is_expired(req, now));
        let pruned = before - state.pending_by_id.len();
        if pruned > 0 {
            self.save_pending(&state)?;
        }
        Ok(pruned)
    }

    // --- Persistence helpers ---

    fn save_pending(&self, state: &PairingState) -> Result<(), Error> {
        save_json(&self.state_dir.join(PENDING_FILE), &state.pending_by_id)
    }

    fn save_paired(&self, state: &PairingState) -> Result<(), Error> {
        save_json(&self.state_dir.join(PAIRED_FILE), &state.paired_by_device)
    }
}

fn is_expired(req: &PendingRequest, now: i64) -> bool {
    now - req.timestamp > PENDING_TTL_MS
}

fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt as _;
        fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(dir)
    }
}

/// Write `data` as JSON using an atomic tmp-then-rename with owner-only
/// permissions.
fn save_json<T: Serialize>(target: &Path, data: &T) -> Result<(), Error> {
    let tmp = target.with_extension("json.tmp");
    let content = serde_json::to_vec_pretty(data)?;

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt as _;
        options.mode(0o600);
    }
    let mut file = options.open(&tmp)?;
    file.write_all(&content)?;
    file.sync_all()?;
    drop(file);

    if let Err(err) = fs::rename(&tmp, target) {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    Ok(())
}

/// Load a JSON map from a file. A missing file is empty state.
fn load_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, Error> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(err) => return Err(err.into()),
    };
    Ok(serde_json::from_slice(&data)?)
}
