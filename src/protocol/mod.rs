//! Wire protocol shared by the gateway and its clients.
//!
//! One JSON-encoded frame per transport message. The envelope is a tagged
//! union of request / response / event frames; `connect` handshake and node
//! invocation payloads ride inside those frames.

mod connect;
mod frames;

pub use connect::{
    validate_connect, ClientInfo, ConnectAuth, ConnectParams, DeviceConnectPayload, HelloAuthInfo,
    NodeInvokeRequest, NodeInvokeResult, SERVER_PROTOCOL,
};
pub use frames::{
    marshal_event, marshal_request, marshal_response, parse_frame, ErrorShape, EventFrame, Frame,
    FrameError, RequestFrame, ResponseFrame,
};

// Framing error codes.
pub const ERROR_INVALID_JSON: &str = "INVALID_JSON";
pub const ERROR_MISSING_FIELD: &str = "MISSING_FIELD";
pub const ERROR_UNKNOWN_TYPE: &str = "UNKNOWN_TYPE";

// Handshake error codes. All of these are fatal to the connection.
pub const ERROR_PROTOCOL_MISMATCH: &str = "PROTOCOL_MISMATCH";
pub const ERROR_INVALID_METHOD: &str = "INVALID_METHOD";
pub const ERROR_UNAUTHORIZED: &str = "UNAUTHORIZED";
pub const ERROR_INVALID_SIGNATURE: &str = "INVALID_SIGNATURE";
pub const ERROR_INVALID_NONCE: &str = "INVALID_NONCE";
pub const ERROR_INVALID_DEVICE_ID: &str = "INVALID_DEVICE_ID";
pub const ERROR_NOT_PAIRED: &str = "NOT_PAIRED";
pub const ERROR_PAIRING_ERROR: &str = "PAIRING_ERROR";
