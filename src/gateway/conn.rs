//! Per-connection session state machine.
//!
//! Drives a single upgraded transport through challenge → connect →
//! authenticated read loop. The transport and the lifecycle callbacks are
//! traits so the state machine can be exercised without a real socket.

use std::io;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::nodes::EventSink;
use crate::pairing::{
    self, build_auth_payload, derive_device_id, generate_nonce, verify_signature,
    AuthPayloadParams, CheckPairingParams, PairingStatus,
};
use crate::protocol::{
    marshal_event, marshal_response, parse_frame, validate_connect, ConnectParams,
    DeviceConnectPayload, ErrorShape, Frame, HelloAuthInfo, RequestFrame, ERROR_INVALID_JSON,
    ERROR_INVALID_METHOD, ERROR_INVALID_NONCE, ERROR_INVALID_SIGNATURE, ERROR_NOT_PAIRED,
    ERROR_PAIRING_ERROR, ERROR_UNAUTHORIZED, ERROR_INVALID_DEVICE_ID,
};

use super::auth::{authenticate, AuthConfig, AuthMode};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Authenticated,
    Closed,
}

/// Message-oriented, ordered, full-duplex transport carrying one encoded
/// frame per message. Writes are serialized by the implementation.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Next inbound message, `None` when the peer closed.
    async fn recv(&self) -> Option<io::Result<String>>;
    async fn send(&self, text: &str) -> io::Result<()>;
    async fn close(&self);
}

/// Lifecycle callbacks wired in by the composition root.
#[async_trait]
pub trait ConnHandler: Send + Sync {
    async fn on_authenticated(&self, conn: &Arc<Conn>);
    async fn on_request(&self, conn: &Arc<Conn>, req: RequestFrame);
    async fn on_disconnected(&self, conn: &Arc<Conn>);
}

/// A single gateway connection.
pub struct Conn {
    transport: Arc<dyn Transport>,
    auth: AuthConfig,
    handler: Arc<dyn ConnHandler>,
    conn_id: String,
    state: Mutex<ConnState>,
    connect_params: Mutex<Option<ConnectParams>>,

    // Device pairing context; pairing is disabled when no service is attached.
    pairing: Option<Arc<pairing::Service>>,
    remote_addr: String,
    is_local: bool,
    challenge_nonce: Mutex<String>,

    // Set after successful device verification.
    device_id: Mutex<String>,
    device_token: Mutex<String>,
}

impl Conn {
    /// Create a connection in the connecting state.
    pub fn new(
        transport: Arc<dyn Transport>,
        auth: AuthConfig,
        handler: Arc<dyn ConnHandler>,
    ) -> Self {
        Self {
            transport,
            auth,
            handler,
            conn_id: Uuid::new_v4().simple().to_string(),
            state: Mutex::new(ConnState::Connecting),
            connect_params: Mutex::new(None),
            pairing: None,
            remote_addr: String::new(),
            is_local: false,
            challenge_nonce: Mutex::new(String::new()),
            device_id: Mutex::new(String::new()),
            device_token: Mutex::new(String::new()),
        }
    }

    /// Attach a pairing service and connection origin metadata.
    pub fn with_pairing(
        mut self,
        svc: Arc<pairing::Service>,
        remote_addr: impl Into<String>,
        is_local: bool,
    ) -> Self {
        self.pairing = Some(svc);
        self.remote_addr = remote_addr.into();
        self.is_local = is_local;
        self
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock()
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn is_local(&self) -> bool {
        self.is_local
    }

    /// Connect params, available once the handshake completed.
    pub fn connect_params(&self) -> Option<ConnectParams> {
        self.connect_params.lock().clone()
    }

    /// Verified device id, if the client presented a device identity.
    pub fn device_id(&self) -> Option<String> {
        let id = self.device_id.lock();
        (!id.is_empty()).then(|| id.clone())
    }

    /// Token issued to the device during this handshake, if any.
    pub fn device_token(&self) -> Option<String> {
        let token = self.device_token.lock();
        (!token.is_empty()).then(|| token.clone())
    }

    /// Send an event frame to this connection.
    pub async fn send_event(&self, event: &str, payload: Option<Value>) -> io::Result<()> {
        let data = marshal_event(event, payload).map_err(io::Error::other)?;
        self.transport.send(&data).await
    }

    async fn send_response(
        &self,
        id: &str,
        ok: bool,
        payload: Option<Value>,
        error: Option<ErrorShape>,
    ) -> io::Result<()> {
        let data = marshal_response(id, ok, payload, error).map_err(io::Error::other)?;
        self.transport.send(&data).await
    }

    async fn send_error(&self, id: &str, code: &str, message: &str) {
        let _ = self
            .send_response(id, false, None, Some(ErrorShape::new(code, message)))
            .await;
    }

    /// Drive the connection lifecycle: challenge → connect → read loop.
    /// Blocks until the connection closes or `ctx` is cancelled.
    pub async fn run(self: &Arc<Self>, ctx: CancellationToken) {
        // Close the transport on shutdown to unblock the read loop.
        let watcher = tokio::spawn({
            let transport = self.transport.clone();
            let ctx = ctx.clone();
            async move {
                ctx.cancelled().await;
                transport.close().await;
            }
        });

        self.drive().await;

        watcher.abort();
        self.finish().await;
    }

    async fn drive(self: &Arc<Self>) {
        if self.send_challenge().await.is_err() {
            return;
        }

        let first = match self.transport.recv().await {
            Some(Ok(data)) => data,
            _ => return,
        };
        if self.process_connect(&first).await.is_err() {
            return;
        }

        loop {
            match self.transport.recv().await {
                Some(Ok(data)) => self.process_request(&data).await,
                _ => return,
            }
        }
    }

    async fn finish(self: &Arc<Self>) {
        let was_authenticated = {
            let mut state = self.state.lock();
            let was = *state == ConnState::Authenticated;
            *state = ConnState::Closed;
            was
        };
        self.transport.close().await;
        if was_authenticated {
            self.handler.on_disconnected(self).await;
        }
    }

    async fn send_challenge(&self) -> io::Result<()> {
        let nonce = generate_nonce();
        *self.challenge_nonce.lock() = nonce.clone();
        self.send_event(
            "connect.challenge",
            Some(json!({ "nonce": nonce, "ts": now_unix_secs() })),
        )
        .await
    }

    async fn process_connect(self: &Arc<Self>, data: &str) -> Result<(), ()> {
        let frame = parse_frame(data).map_err(|err| {
            tracing::debug!(target: "gateway", error = %err, "invalid handshake frame");
        })?;
        let Frame::Request(req) = frame else {
            return Err(());
        };

        if req.method != "connect" {
            self.send_error(&req.id, ERROR_INVALID_METHOD, "first request must be connect")
                .await;
            return Err(());
        }

        let params: ConnectParams = match req.params {
            Some(value) => match serde_json::from_value(value) {
                Ok(params) => params,
                Err(err) => {
                    self.send_error(
                        &req.id,
                        ERROR_INVALID_JSON,
                        &format!("invalid connect params: {err}"),
                    )
                    .await;
                    return Err(());
                }
            },
            None => ConnectParams::default(),
        };

        if let Err(err) = validate_connect(&params) {
            self.send_error(&req.id, err.code, &err.message).await;
            return Err(());
        }

        let result = authenticate(&self.auth, params.auth.as_ref());
        if !result.ok {
            self.send_error(&req.id, ERROR_UNAUTHORIZED, result.reason).await;
            return Err(());
        }

        let mut device_token = String::new();
        if let (Some(svc), Some(device)) = (self.pairing.clone(), params.device.clone()) {
            device_token = self.verify_device(&req.id, &svc, &device, &params).await?;
        }

        *self.connect_params.lock() = Some(params);
        if !device_token.is_empty() {
            *self.device_token.lock() = device_token.clone();
        }

        let payload = (!device_token.is_empty())
            .then(|| json!({ "auth": HelloAuthInfo { device_token } }));
        self.send_response(&req.id, true, payload, None)
            .await
            .map_err(|_| ())?;

        *self.state.lock() = ConnState::Authenticated;
        self.handler.on_authenticated(self).await;
        Ok(())
    }

    /// Device identity verification and pairing check. On success returns
    /// the device auth token (possibly empty); on failure the error has
    /// already been sent to the client.
    async fn verify_device(
        &self,
        req_id: &str,
        svc: &Arc<pairing::Service>,
        device: &DeviceConnectPayload,
        params: &ConnectParams,
    ) -> Result<String, ()> {
        let role = if params.role.is_empty() {
            "node".to_string()
        } else {
            params.role.clone()
        };
        let auth_token = match self.auth.mode {
            AuthMode::Token => self.auth.token.clone(),
            AuthMode::None => String::new(),
        };

        let payload = build_auth_payload(&AuthPayloadParams {
            device_id: device.id.clone(),
            client_id: params.client.id.clone(),
            client_mode: params.client.mode.clone(),
            role: role.clone(),
            scopes: params.caps.clone(),
            signed_at_ms: device.signed_at,
            token: auth_token,
            nonce: device.nonce.clone(),
        });
        if !verify_signature(&device.public_key, &payload, &device.signature) {
            self.send_error(
                req_id,
                ERROR_INVALID_SIGNATURE,
                "device signature verification failed",
            )
            .await;
            return Err(());
        }

        let challenge = self.challenge_nonce.lock().clone();
        if device.nonce != challenge {
            self.send_error(req_id, ERROR_INVALID_NONCE, "nonce does not match challenge")
                .await;
            return Err(());
        }

        let derived = match derive_device_id(&device.public_key) {
            Some(id) if id == device.id => id,
            _ => {
                self.send_error(
                    req_id,
                    ERROR_INVALID_DEVICE_ID,
                    "device ID does not match public key",
                )
                .await;
                return Err(());
            }
        };
        *self.device_id.lock() = derived.clone();

        let action = match svc.check_pairing_status(&CheckPairingParams {
            device_id: derived.clone(),
            public_key: device.public_key.clone(),
            role: role.clone(),
            scopes: params.caps.clone(),
            is_local: self.is_local,
        }) {
            Ok(action) => action,
            Err(err) => {
                tracing::warn!(target: "gateway", error = %err, device_id = %derived, "pairing check failed");
                self.send_error(req_id, ERROR_PAIRING_ERROR, "pairing check failed")
                    .await;
                return Err(());
            }
        };

        match action.status {
            PairingStatus::Paired | PairingStatus::AutoApproved => {
                match svc.ensure_device_token(&derived, &role, &params.caps) {
                    Ok(Some(token)) => Ok(token.token),
                    // Paired but no token available; still allow the connection.
                    Ok(None) => Ok(String::new()),
                    Err(err) => {
                        tracing::warn!(target: "gateway", error = %err, device_id = %derived, "device token issuance failed");
                        Ok(String::new())
                    }
                }
            }
            PairingStatus::PairingRequired => {
                let message =
                    json!({ "requestId": action.request_id.unwrap_or_default() }).to_string();
                self.send_error(req_id, ERROR_NOT_PAIRED, &message).await;
                Err(())
            }
        }
    }

    async fn process_request(self: &Arc<Self>, data: &str) {
        match parse_frame(data) {
            Ok(Frame::Request(req)) => self.handler.on_request(self, req).await,
            // Inbound responses and events have no route on the server side.
            Ok(_) => {}
            Err(err) => {
                if let Some(id) = recover_request_id(data) {
                    self.send_error(&id, err.code, &err.message).await;
                } else {
                    tracing::debug!(target: "gateway", error = %err, "dropping malformed frame");
                }
            }
        }
    }
}

#[async_trait]
impl EventSink for Conn {
    async fn send_event(&self, event: &str, payload: Value) -> io::Result<()> {
        Conn::send_event(self, event, Some(payload)).await
    }
}

/// Pull a usable request id out of a malformed frame so the peer can
/// correlate the error response. `None` means log-and-drop.
fn recover_request_id(data: &str) -> Option<String> {
    let value: Value = serde_json::from_str(data).ok()?;
    if value.get("type")?.as_str()? != "req" {
        return None;
    }
    let id = value.get("id")?.as_str()?;
    (!id.is_empty()).then(|| id.to_string())
}

fn now_unix_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
