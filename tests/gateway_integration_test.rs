//! End-to-end gateway tests over real WebSocket connections.
//!
//! Each test binds a gateway on an ephemeral loopback port, drives it with a
//! tokio-tungstenite client speaking the frame protocol, and shuts it down
//! cleanly.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{Signer, SigningKey};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use clawgate::config::BindMode;
use clawgate::gateway::{Gateway, GatewayConfig, GatewayHandle};
use clawgate::nodes::InvokeRequest;
use clawgate::pairing::{build_auth_payload, derive_device_id, AuthPayloadParams, Service, Store};

type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

struct TestGateway {
    handle: GatewayHandle,
    state_dir: TempDir,
}

async fn start_gateway(auth_token: Option<&str>) -> TestGateway {
    let state_dir = TempDir::new().unwrap();
    let store = Arc::new(Store::new(state_dir.path().join("pairing")).unwrap());
    let pairing = Arc::new(Service::new(store));

    let gateway = Gateway::new(GatewayConfig {
        port: 0,
        bind: BindMode::Loopback,
        auth_token: auth_token.map(str::to_string),
        tick_interval: Duration::ZERO,
        pairing: Some(pairing),
    });
    let handle = gateway.serve(CancellationToken::new()).await.unwrap();
    TestGateway { handle, state_dir }
}

impl TestGateway {
    fn gateway(&self) -> &Arc<Gateway> {
        self.handle.gateway()
    }

    async fn client(&self) -> WsClient {
        let url = format!("ws://{}/ws", self.handle.local_addr());
        let (client, _) = connect_async(url.as_str()).await.expect("ws connect failed");
        client
    }
}

async fn read_frame(client: &mut WsClient) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .expect("timeout waiting for frame")
            .expect("connection closed")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Close(_) => panic!("connection closed by server"),
            _ => continue,
        }
    }
}

async fn send_frame(client: &mut WsClient, frame: Value) {
    client
        .send(Message::Text(frame.to_string().into()))
        .await
        .unwrap();
}

async fn read_challenge_nonce(client: &mut WsClient) -> String {
    let frame = read_frame(client).await;
    assert_eq!(frame["type"], "event");
    assert_eq!(frame["event"], "connect.challenge");
    frame["payload"]["nonce"].as_str().unwrap().to_string()
}

fn connect_params(client_id: &str) -> Value {
    json!({
        "minProtocol": 3,
        "maxProtocol": 3,
        "client": {"id": client_id, "version": "1.0", "platform": "ios", "mode": "node"},
    })
}

fn keypair() -> (SigningKey, String) {
    let mut seed = [0u8; 32];
    getrandom::fill(&mut seed).unwrap();
    let signing = SigningKey::from_bytes(&seed);
    let public_b64 = URL_SAFE_NO_PAD.encode(signing.verifying_key().as_bytes());
    (signing, public_b64)
}

/// Sign a device identity the way the mobile client does.
fn device_payload(signing: &SigningKey, public_b64: &str, client_id: &str, nonce: &str) -> Value {
    let device_id = derive_device_id(public_b64).unwrap();
    let signed_at = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64;
    let payload = build_auth_payload(&AuthPayloadParams {
        device_id: device_id.clone(),
        client_id: client_id.to_string(),
        client_mode: "node".to_string(),
        role: "node".to_string(),
        scopes: vec![],
        signed_at_ms: signed_at,
        token: String::new(),
        nonce: nonce.to_string(),
    });
    let signature = URL_SAFE_NO_PAD.encode(signing.sign(payload.as_bytes()).to_bytes());
    json!({
        "id": device_id,
        "publicKey": public_b64,
        "signature": signature,
        "signedAt": signed_at,
        "nonce": nonce,
    })
}

async fn handshake(client: &mut WsClient, client_id: &str) {
    let _ = read_challenge_nonce(client).await;
    send_frame(
        client,
        json!({"type": "req", "id": "req-1", "method": "connect", "params": connect_params(client_id)}),
    )
    .await;
    let res = read_frame(client).await;
    assert_eq!(res["type"], "res");
    assert_eq!(res["ok"], true, "handshake failed: {res}");
}

/// The connect response is written before the node session registers, so
/// tests poll the registry for the session to land.
async fn wait_for_node(gateway: &Arc<Gateway>, node_id: &str, conn_not: Option<&str>) -> String {
    for _ in 0..100 {
        if let Some(session) = gateway.registry().get(node_id) {
            if conn_not != Some(session.conn_id.as_str()) {
                return session.conn_id;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("node {node_id} never registered");
}

// ---------------------------------------------------------------------------
// 1. Loopback device auto-approve issues a token and persists the pairing
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_loopback_auto_approve() {
    let tg = start_gateway(None).await;
    let mut client = tg.client().await;

    let nonce = read_challenge_nonce(&mut client).await;
    let (signing, public_b64) = keypair();
    let mut params = connect_params("iphone-1");
    params["device"] = device_payload(&signing, &public_b64, "iphone-1", &nonce);
    send_frame(
        &mut client,
        json!({"type": "req", "id": "req-1", "method": "connect", "params": params}),
    )
    .await;

    let res = read_frame(&mut client).await;
    assert_eq!(res["ok"], true, "expected ok response: {res}");
    let token = res["payload"]["auth"]["deviceToken"].as_str().unwrap();
    assert!(!token.is_empty());

    // The pairing landed on disk with the token registered for role node.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let device_id = derive_device_id(&public_b64).unwrap();
    let paired: Value = serde_json::from_slice(
        &std::fs::read(tg.state_dir.path().join("pairing/paired.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(paired[&device_id]["tokens"]["node"]["token"], token);

    drop(client);
    tg.handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 2. Invalid signature is fatal and leaves no pairing state
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_signature_rejected() {
    let tg = start_gateway(None).await;
    let mut client = tg.client().await;

    let nonce = read_challenge_nonce(&mut client).await;
    let (_, public_b64) = keypair();
    let (wrong_signing, _) = keypair();
    let mut params = connect_params("iphone-1");
    params["device"] = device_payload(&wrong_signing, &public_b64, "iphone-1", &nonce);
    send_frame(
        &mut client,
        json!({"type": "req", "id": "req-1", "method": "connect", "params": params}),
    )
    .await;

    let res = read_frame(&mut client).await;
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"]["code"], "INVALID_SIGNATURE");

    let svc = tg.gateway().pairing().unwrap();
    assert!(svc.store().list_pending().is_empty());
    assert!(svc.store().list_paired().is_empty());

    tg.handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 3. Signing over the wrong nonce is fatal
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_nonce_mismatch_rejected() {
    let tg = start_gateway(None).await;
    let mut client = tg.client().await;

    let _ = read_challenge_nonce(&mut client).await;
    let (signing, public_b64) = keypair();
    let mut params = connect_params("iphone-1");
    params["device"] = device_payload(&signing, &public_b64, "iphone-1", "not-the-challenge");
    send_frame(
        &mut client,
        json!({"type": "req", "id": "req-1", "method": "connect", "params": params}),
    )
    .await;

    let res = read_frame(&mut client).await;
    assert_eq!(res["ok"], false);
    let code = res["error"]["code"].as_str().unwrap();
    assert!(
        code == "INVALID_SIGNATURE" || code == "INVALID_NONCE",
        "unexpected code {code}"
    );

    tg.handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 4. Invoke round-trip and timeout
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invoke_round_trip_and_timeout() {
    let tg = start_gateway(None).await;
    let mut node = tg.client().await;
    handshake(&mut node, "iphone-test").await;
    wait_for_node(tg.gateway(), "iphone-test", None).await;

    let invoker = tg.gateway().invoker().clone();
    let ctx = CancellationToken::new();

    let invoke = {
        let invoker = invoker.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            invoker
                .invoke(
                    &ctx,
                    InvokeRequest {
                        node_id: "iphone-test".to_string(),
                        command: "location.get".to_string(),
                        timeout_ms: 5000,
                        params_json: None,
                    },
                )
                .await
        })
    };

    // The node receives the invoke request event and answers it.
    let event = read_frame(&mut node).await;
    assert_eq!(event["event"], "node.invoke.request");
    let invoke_id = event["payload"]["id"].as_str().unwrap();
    assert_eq!(event["payload"]["command"], "location.get");
    send_frame(
        &mut node,
        json!({
            "type": "req",
            "id": "req-2",
            "method": "node.invoke.result",
            "params": {
                "id": invoke_id,
                "nodeId": "iphone-test",
                "ok": true,
                "payloadJSON": "{\"lat\":40.7128}",
            },
        }),
    )
    .await;

    let outcome = invoke.await.unwrap().unwrap();
    assert!(outcome.ok);
    assert_eq!(outcome.payload_json.as_deref(), Some("{\"lat\":40.7128}"));

    // A node that never answers trips the invoke timeout.
    let err = invoker
        .invoke(
            &ctx,
            InvokeRequest {
                node_id: "iphone-test".to_string(),
                command: "location.get".to_string(),
                timeout_ms: 100,
                params_json: None,
            },
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("timeout"));

    drop(node);
    tg.handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 5. Reconnect replaces the prior node session
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconnect_replaces_session() {
    let tg = start_gateway(None).await;

    let mut first = tg.client().await;
    handshake(&mut first, "iphone-1").await;
    let first_conn = wait_for_node(tg.gateway(), "iphone-1", None).await;

    drop(first);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut second = tg.client().await;
    handshake(&mut second, "iphone-1").await;
    wait_for_node(tg.gateway(), "iphone-1", Some(&first_conn)).await;

    let sessions = tg.gateway().registry().list();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].node_id, "iphone-1");
    assert_ne!(sessions[0].conn_id, first_conn);

    drop(second);
    tg.handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 6. Node disconnect cancels in-flight invocations
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_cancels_pending_invoke() {
    let tg = start_gateway(None).await;
    let mut node = tg.client().await;
    handshake(&mut node, "iphone-1").await;
    wait_for_node(tg.gateway(), "iphone-1", None).await;

    let invoker = tg.gateway().invoker().clone();
    let ctx = CancellationToken::new();
    let invoke = tokio::spawn(async move {
        invoker
            .invoke(
                &ctx,
                InvokeRequest {
                    node_id: "iphone-1".to_string(),
                    command: "location.get".to_string(),
                    timeout_ms: 10_000,
                    params_json: None,
                },
            )
            .await
    });

    // Wait until the request event reached the node, then drop the socket.
    let event = read_frame(&mut node).await;
    assert_eq!(event["event"], "node.invoke.request");
    drop(node);

    let err = invoke.await.unwrap().unwrap_err();
    assert!(err.to_string().contains("disconnected"));
    assert!(tg.gateway().registry().list().is_empty());

    tg.handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 7. Legacy token auth gates the handshake
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_token_auth_over_socket() {
    let tg = start_gateway(Some("secret")).await;

    let mut rejected = tg.client().await;
    let _ = read_challenge_nonce(&mut rejected).await;
    send_frame(
        &mut rejected,
        json!({"type": "req", "id": "req-1", "method": "connect", "params": connect_params("iphone-1")}),
    )
    .await;
    let res = read_frame(&mut rejected).await;
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"]["code"], "UNAUTHORIZED");

    let mut accepted = tg.client().await;
    let _ = read_challenge_nonce(&mut accepted).await;
    let mut params = connect_params("iphone-1");
    params["auth"] = json!({"token": "secret"});
    send_frame(
        &mut accepted,
        json!({"type": "req", "id": "req-1", "method": "connect", "params": params}),
    )
    .await;
    let res = read_frame(&mut accepted).await;
    assert_eq!(res["ok"], true, "expected ok response: {res}");

    drop(accepted);
    tg.handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 8. Health endpoint and shutdown broadcast
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_health_and_shutdown_broadcast() {
    let tg = start_gateway(None).await;

    let url = format!("http://{}/health", tg.handle.local_addr());
    let resp = reqwest::get(&url).await.expect("GET /health failed");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    let mut client = tg.client().await;
    handshake(&mut client, "iphone-1").await;

    tg.handle.shutdown().await;

    let frame = read_frame(&mut client).await;
    assert_eq!(frame["type"], "event");
    assert_eq!(frame["event"], "shutdown");
}
