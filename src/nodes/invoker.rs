//! Request/response correlation for node invocations.
//!
//! Each in-flight invocation is a single-shot rendezvous: a capacity-1
//! result channel plus an independent cancel signal, registered under a
//! freshly minted invoke id. Result delivery must never block the session
//! read loop, so the delivery path uses a non-blocking send.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::{ErrorShape, NodeInvokeRequest, NodeInvokeResult};

use super::Registry;

/// Invoke ids carry 128 bits of randomness, hex-encoded.
const INVOKE_ID_BYTES: usize = 16;

fn generate_invoke_id() -> Result<String, getrandom::Error> {
    let mut bytes = [0u8; INVOKE_ID_BYTES];
    getrandom::fill(&mut bytes)?;
    Ok(hex::encode(bytes))
}

/// Input to [`Invoker::invoke`].
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub node_id: String,
    pub command: String,
    pub timeout_ms: u64,
    pub params_json: Option<String>,
}

/// Outcome of a completed invocation. Peer-reported failures arrive as
/// `ok: false` with an error object and are returned intact.
#[derive(Debug, Clone)]
pub struct InvokeOutcome {
    pub ok: bool,
    pub payload_json: Option<String>,
    pub error: Option<ErrorShape>,
}

/// Operational failures of the invoke path itself.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("node {0:?} not connected")]
    NotConnected(String),
    #[error("send failed: {0}")]
    Send(#[from] std::io::Error),
    #[error("node disconnected")]
    Disconnected,
    #[error("invoke timeout after {0}ms")]
    Timeout(u64),
    #[error("invoke cancelled")]
    Cancelled,
    #[error("random source unavailable: {0}")]
    Rng(#[from] getrandom::Error),
}

struct PendingInvoke {
    node_id: String,
    result_tx: mpsc::Sender<NodeInvokeResult>,
    cancel: CancellationToken,
}

/// Manages the request/response lifecycle for node invocations.
pub struct Invoker {
    registry: Arc<Registry>,
    pending: Mutex<HashMap<String, PendingInvoke>>,
}

impl Invoker {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Send a command to a node and wait for the correlated result, the
    /// node disconnecting, the timeout elapsing, or `ctx` being cancelled —
    /// whichever comes first.
    pub async fn invoke(
        &self,
        ctx: &CancellationToken,
        req: InvokeRequest,
    ) -> Result<InvokeOutcome, InvokeError> {
        let session = self
            .registry
            .get(&req.node_id)
            .ok_or_else(|| InvokeError::NotConnected(req.node_id.clone()))?;

        let invoke_id = generate_invoke_id()?;
        let (result_tx, mut result_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        self.pending.lock().insert(
            invoke_id.clone(),
            PendingInvoke {
                node_id: req.node_id.clone(),
                result_tx,
                cancel: cancel.clone(),
            },
        );

        let event = NodeInvokeRequest {
            id: invoke_id.clone(),
            node_id: req.node_id.clone(),
            command: req.command.clone(),
            params_json: req.params_json.clone(),
        };
        let payload = match serde_json::to_value(&event) {
            Ok(payload) => payload,
            Err(err) => {
                self.pending.lock().remove(&invoke_id);
                return Err(InvokeError::Send(std::io::Error::other(err)));
            }
        };
        if let Err(err) = session.send("node.invoke.request", payload).await {
            self.pending.lock().remove(&invoke_id);
            return Err(InvokeError::Send(err));
        }

        let outcome = tokio::select! {
            result = result_rx.recv() => match result {
                Some(result) => Ok(InvokeOutcome {
                    ok: result.ok,
                    payload_json: result.payload_json,
                    error: result.error,
                }),
                None => Err(InvokeError::Disconnected),
            },
            _ = cancel.cancelled() => Err(InvokeError::Disconnected),
            _ = tokio::time::sleep(Duration::from_millis(req.timeout_ms)) => {
                Err(InvokeError::Timeout(req.timeout_ms))
            }
            _ = ctx.cancelled() => Err(InvokeError::Cancelled),
        };

        self.pending.lock().remove(&invoke_id);
        outcome
    }

    /// Deliver a result from a node to the waiting invoke call. Returns true
    /// when a matching pending invocation was found; late or unknown results
    /// are discarded. Never blocks.
    pub fn handle_result(&self, result: NodeInvokeResult) -> bool {
        let pending = self.pending.lock();
        let Some(entry) = pending.get(&result.id) else {
            return false;
        };
        let tx = entry.result_tx.clone();
        drop(pending);

        let _ = tx.try_send(result);
        true
    }

    /// Cancel every pending invocation targeting the given node. Called on
    /// node disconnect.
    pub fn cancel_pending_for_node(&self, node_id: &str) {
        let to_cancel: Vec<CancellationToken> = {
            let pending = self.pending.lock();
            pending
                .values()
                .filter(|p| p.node_id == node_id)
                .map(|p| p.cancel.clone())
                .collect()
        };
        for cancel in to_cancel {
            cancel.cancel();
        }
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}
