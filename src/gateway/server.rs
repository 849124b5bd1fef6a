//! WebSocket listener.
//!
//! Accepts upgrades on `/ws`, wraps each socket in a [`Transport`], and runs
//! a [`Conn`] to completion under a supervisor set used for broadcast and
//! forced shutdown. `/health` is a non-upgrade side channel for operational
//! probes.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::BindMode;
use crate::pairing;

use super::auth::AuthConfig;
use super::conn::{Conn, ConnHandler, Transport};

/// Listener configuration.
#[derive(Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: BindMode,
    pub auth: AuthConfig,
    /// Device pairing is disabled when absent.
    pub pairing: Option<Arc<pairing::Service>>,
}

/// Accepts transport upgrades and supervises connection lifecycles.
pub struct Server {
    config: ServerConfig,
    conns: Mutex<HashMap<String, Arc<Conn>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

#[derive(Clone)]
struct AppState {
    server: Arc<Server>,
    handler: Arc<dyn ConnHandler>,
    ctx: CancellationToken,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            conns: Mutex::new(HashMap::new()),
            local_addr: Mutex::new(None),
        }
    }

    /// Address the listener bound to, once [`Server::bind`] succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Bind the TCP listener for the configured port and bind mode.
    pub async fn bind(&self) -> io::Result<tokio::net::TcpListener> {
        let ip: IpAddr = match self.config.bind {
            BindMode::Loopback => Ipv4Addr::LOCALHOST.into(),
            BindMode::Lan => Ipv4Addr::UNSPECIFIED.into(),
        };
        let listener = tokio::net::TcpListener::bind((ip, self.config.port)).await?;
        *self.local_addr.lock() = Some(listener.local_addr()?);
        Ok(listener)
    }

    /// Serve upgrades until `ctx` is cancelled. Each accepted connection is
    /// tracked for the duration of its session.
    pub async fn serve(
        self: &Arc<Self>,
        listener: tokio::net::TcpListener,
        ctx: CancellationToken,
        handler: Arc<dyn ConnHandler>,
    ) -> io::Result<()> {
        let state = AppState {
            server: self.clone(),
            handler,
            ctx: ctx.clone(),
        };
        let app = Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .with_state(state);

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { ctx.cancelled().await })
        .await
    }

    /// Emit an event to every supervised connection.
    pub async fn broadcast(&self, event: &str, payload: Option<Value>) {
        let conns: Vec<Arc<Conn>> = self.conns.lock().values().cloned().collect();
        for conn in conns {
            if let Err(err) = conn.send_event(event, payload.clone()).await {
                tracing::debug!(target: "gateway", conn_id = %conn.conn_id(), error = %err, "broadcast send failed");
            }
        }
    }

    fn track(&self, conn: Arc<Conn>) {
        self.conns.lock().insert(conn.conn_id().to_string(), conn);
    }

    fn untrack(&self, conn_id: &str) {
        self.conns.lock().remove(conn_id);
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: AppState, remote_addr: SocketAddr) {
    let transport = Arc::new(WsTransport::new(socket));
    let remote = remote_addr.to_string();
    let is_local = is_loopback(&remote);

    let mut conn = Conn::new(
        transport,
        state.server.config.auth.clone(),
        state.handler.clone(),
    );
    if let Some(svc) = state.server.config.pairing.clone() {
        conn = conn.with_pairing(svc, remote, is_local);
    }
    let conn = Arc::new(conn);

    state.server.track(conn.clone());
    conn.run(state.ctx).await;
    state.server.untrack(conn.conn_id());
}

async fn health_handler() -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        r#"{"status":"ok"}"#,
    )
}

/// WebSocket-backed [`Transport`]. The writer mutex serializes every
/// outbound frame across the handshake, keepalive, invoke and broadcast
/// paths.
struct WsTransport {
    reader: tokio::sync::Mutex<SplitStream<WebSocket>>,
    writer: tokio::sync::Mutex<SplitSink<WebSocket, Message>>,
}

impl WsTransport {
    fn new(socket: WebSocket) -> Self {
        let (writer, reader) = socket.split();
        Self {
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn recv(&self) -> Option<io::Result<String>> {
        let mut reader = self.reader.lock().await;
        loop {
            match reader.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text.to_string())),
                Some(Ok(Message::Close(_))) => return None,
                // Binary frames and ping/pong control traffic are not part
                // of the text-framed protocol.
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Some(Err(io::Error::other(err))),
                None => return None,
            }
        }
    }

    async fn send(&self, text: &str) -> io::Result<()> {
        self.writer
            .lock()
            .await
            .send(Message::Text(text.to_string().into()))
            .await
            .map_err(io::Error::other)
    }

    async fn close(&self) {
        let _ = self.writer.lock().await.send(Message::Close(None)).await;
    }
}

/// Whether the remote address resolves to a loopback origin: IPv4/IPv6
/// loopback, IPv4-mapped-IPv6 loopback, or the literal `localhost`.
pub(crate) fn is_loopback(addr: &str) -> bool {
    if let Ok(sock) = addr.parse::<SocketAddr>() {
        return sock.ip().to_canonical().is_loopback();
    }
    let host = addr.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.to_canonical().is_loopback();
    }
    let host = addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr);
    host.trim_start_matches('[').trim_end_matches(']') == "localhost"
}
