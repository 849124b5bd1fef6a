//! `connect` handshake and node invocation payload types.

use serde::{Deserialize, Serialize};

use super::{ErrorShape, FrameError, ERROR_PROTOCOL_MISMATCH};

/// Protocol version this server speaks.
pub const SERVER_PROTOCOL: u32 = 3;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    #[serde(default)]
    pub min_protocol: u32,
    #[serde(default)]
    pub max_protocol: u32,
    #[serde(default)]
    pub client: ClientInfo,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub caps: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<ConnectAuth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceConnectPayload>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub mode: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectAuth {
    #[serde(default)]
    pub token: String,
}

/// Cryptographic device identity carried in the connect request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConnectPayload {
    pub id: String,
    /// base64url-encoded raw 32-byte Ed25519 public key.
    pub public_key: String,
    /// base64url-encoded Ed25519 signature over the canonical auth payload.
    pub signature: String,
    /// Milliseconds since epoch.
    pub signed_at: i64,
    /// Server-issued challenge nonce.
    #[serde(default)]
    pub nonce: String,
}

/// Auth info returned in the successful connect response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloAuthInfo {
    pub device_token: String,
}

/// Checks that the server protocol version falls within the client's
/// advertised `[minProtocol, maxProtocol]` range.
pub fn validate_connect(params: &ConnectParams) -> Result<(), FrameError> {
    if SERVER_PROTOCOL < params.min_protocol || SERVER_PROTOCOL > params.max_protocol {
        return Err(FrameError {
            code: ERROR_PROTOCOL_MISMATCH,
            field: None,
            message: format!(
                "server protocol {} not in client range [{}, {}]",
                SERVER_PROTOCOL, params.min_protocol, params.max_protocol
            ),
        });
    }
    Ok(())
}

/// Payload of the outbound `node.invoke.request` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInvokeRequest {
    pub id: String,
    pub node_id: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "paramsJSON")]
    pub params_json: Option<String>,
}

/// Params of the inbound `node.invoke.result` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInvokeResult {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "payloadJSON")]
    pub payload_json: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}
