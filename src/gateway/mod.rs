//! Gateway orchestration.
//!
//! Ties the WebSocket listener, node registry, invoker and pairing service
//! together: accepted connections become [`Conn`] sessions, authenticated
//! node sessions land in the [`Registry`], and inbound `node.invoke.result`
//! requests are routed into the [`Invoker`].

mod auth;
mod conn;
mod server;

pub use auth::{authenticate, AuthConfig, AuthMode, AuthResult};
pub use conn::{Conn, ConnHandler, ConnState, Transport};
pub use server::{Server, ServerConfig};

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::BindMode;
use crate::nodes::{EventSink, Invoker, NodeSession, Registry};
use crate::pairing;
use crate::protocol::{NodeInvokeResult, RequestFrame};

/// Top-level gateway configuration.
#[derive(Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub bind: BindMode,
    /// Legacy shared secret; empty/absent selects auth mode `none`.
    pub auth_token: Option<String>,
    /// Keepalive period; zero disables the tick emitter.
    pub tick_interval: Duration,
    /// Device pairing is disabled when absent.
    pub pairing: Option<Arc<pairing::Service>>,
}

/// Orchestrator owning the listener, node registry and invoke system.
pub struct Gateway {
    config: GatewayConfig,
    server: Arc<Server>,
    registry: Arc<Registry>,
    invoker: Arc<Invoker>,
}

impl Gateway {
    /// Create and wire up a gateway.
    pub fn new(config: GatewayConfig) -> Arc<Self> {
        let registry = Arc::new(Registry::new());
        let invoker = Arc::new(Invoker::new(registry.clone()));

        let auth = match config.auth_token.as_deref() {
            Some(token) if !token.is_empty() => AuthConfig::token(token),
            _ => AuthConfig::none(),
        };
        let server = Arc::new(Server::new(ServerConfig {
            port: config.port,
            bind: config.bind,
            auth,
            pairing: config.pairing.clone(),
        }));

        Arc::new(Self {
            config,
            server,
            registry,
            invoker,
        })
    }

    /// Node registry, for the operator surface.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Invoker, for the operator surface.
    pub fn invoker(&self) -> &Arc<Invoker> {
        &self.invoker
    }

    /// Pairing service, if configured.
    pub fn pairing(&self) -> Option<&Arc<pairing::Service>> {
        self.config.pairing.as_ref()
    }

    /// Address the listener bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr()
    }

    /// Bind and serve until `ctx` is cancelled.
    pub async fn run(self: &Arc<Self>, ctx: CancellationToken) -> io::Result<()> {
        let listener = self.server.bind().await?;
        self.serve_on(listener, ctx).await
    }

    /// Bind first, then serve on a background task. Lets callers (tests,
    /// the CLI) learn the bound address before any client connects.
    pub async fn serve(self: &Arc<Self>, ctx: CancellationToken) -> io::Result<GatewayHandle> {
        let listener = self.server.bind().await?;
        let local_addr = listener.local_addr()?;
        let task = tokio::spawn({
            let gateway = self.clone();
            let ctx = ctx.clone();
            async move { gateway.serve_on(listener, ctx).await }
        });
        Ok(GatewayHandle {
            gateway: self.clone(),
            local_addr,
            ctx,
            task,
        })
    }

    async fn serve_on(
        self: &Arc<Self>,
        listener: tokio::net::TcpListener,
        ctx: CancellationToken,
    ) -> io::Result<()> {
        if !self.config.tick_interval.is_zero() {
            tokio::spawn(tick_loop(self.clone(), ctx.clone()));
        }
        let handler = self.clone() as Arc<dyn ConnHandler>;
        self.server.serve(listener, ctx, handler).await
    }

    /// Announce shutdown to every connected client. The caller cancels the
    /// serving context afterwards, which closes the transports.
    pub async fn shutdown(&self) {
        self.server.broadcast("shutdown", None).await;
    }
}

/// Handle to a gateway serving in the background.
pub struct GatewayHandle {
    gateway: Arc<Gateway>,
    local_addr: SocketAddr,
    ctx: CancellationToken,
    task: tokio::task::JoinHandle<io::Result<()>>,
}

impl GatewayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Broadcast the shutdown event, stop serving, and wait for the server
    /// task to wind down.
    pub async fn shutdown(self) {
        self.gateway.shutdown().await;
        self.ctx.cancel();
        match tokio::time::timeout(Duration::from_secs(5), self.task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => error!(target: "gateway", error = %err, "server task failed"),
            Ok(Err(err)) => error!(target: "gateway", error = %err, "server task panicked"),
            Err(_) => warn!(target: "gateway", "server task did not stop within 5s"),
        }
    }
}

#[async_trait]
impl ConnHandler for Gateway {
    async fn on_authenticated(&self, conn: &Arc<Conn>) {
        let Some(params) = conn.connect_params() else {
            return;
        };
        let role = if params.role.is_empty() {
            "node"
        } else {
            params.role.as_str()
        };
        // Operator sessions stay attached but are never routed node traffic.
        if role != "node" {
            return;
        }

        let session = NodeSession::new(
            params.client.id.clone(),
            conn.conn_id().to_string(),
            params.client.display_name.clone(),
            params.client.platform.clone(),
            params.client.version.clone(),
            params.commands.clone(),
            conn.clone() as Arc<dyn EventSink>,
        );
        info!(target: "gateway", node_id = %session.node_id, conn_id = %session.conn_id, "node connected");
        self.registry.register(session);
    }

    async fn on_request(&self, _conn: &Arc<Conn>, req: RequestFrame) {
        if req.method == "node.invoke.result" {
            let result: NodeInvokeResult = req
                .params
                .and_then(|value| serde_json::from_value(value).ok())
                .unwrap_or_default();
            self.invoker.handle_result(result);
        }
    }

    async fn on_disconnected(&self, conn: &Arc<Conn>) {
        if let Some(node_id) = self.registry.unregister(conn.conn_id()) {
            self.invoker.cancel_pending_for_node(&node_id);
            info!(target: "gateway", node_id = %node_id, conn_id = %conn.conn_id(), "node disconnected");
        }
    }
}

async fn tick_loop(gateway: Arc<Gateway>, ctx: CancellationToken) {
    let mut ticker = tokio::time::interval(gateway.config.tick_interval);
    // The first tick completes immediately; consume it so ticks start one
    // full period after startup.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ctx.cancelled() => return,
            _ = ticker.tick() => {
                gateway
                    .server
                    .broadcast("tick", Some(json!({ "ts": now_unix_secs() })))
                    .await;
            }
        }
    }
}

fn now_unix_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invoke_result_requests_route_to_invoker() {
        let gateway = Gateway::new(GatewayConfig {
            port: 0,
            bind: BindMode::Loopback,
            auth_token: None,
            tick_interval: Duration::ZERO,
            pairing: None,
        });

        // No pending invocation: the result is discarded without panicking.
        let handler: Arc<dyn ConnHandler> = gateway.clone();
        let socket_conn = Arc::new(Conn::new(
            Arc::new(ClosedTransport),
            AuthConfig::none(),
            handler.clone(),
        ));
        handler
            .on_request(
                &socket_conn,
                RequestFrame {
                    id: "r1".to_string(),
                    method: "node.invoke.result".to_string(),
                    params: Some(json!({"id": "unknown", "nodeId": "n1", "ok": true})),
                },
            )
            .await;
    }

    struct ClosedTransport;

    #[async_trait]
    impl Transport for ClosedTransport {
        async fn recv(&self) -> Option<io::Result<String>> {
            None
        }

        async fn send(&self, _text: &str) -> io::Result<()> {
            Err(io::Error::other("closed"))
        }

        async fn close(&self) {}
    }
}
