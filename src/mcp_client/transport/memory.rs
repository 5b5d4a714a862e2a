//! In-memory transport and scripted peer for tests.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use super::{StateCell, Transport, TransportState};
use crate::mcp_client::errors::McpError;

/// Transport whose peer is a pair of channels held by the test.
#[derive(Debug)]
pub(crate) struct MemoryTransport {
    state: StateCell,
    to_peer: mpsc::UnboundedSender<String>,
    from_peer: Mutex<mpsc::UnboundedReceiver<String>>,
}

/// The test's side of a [`MemoryTransport`].
pub(crate) struct PeerEnd {
    /// Frames the client sent.
    pub incoming: mpsc::UnboundedReceiver<String>,
    /// Push frames to the client.
    pub outgoing: mpsc::UnboundedSender<String>,
}

pub(crate) fn memory_pair() -> (MemoryTransport, PeerEnd) {
    let (to_peer, incoming) = mpsc::unbounded_channel();
    let (outgoing, from_peer) = mpsc::unbounded_channel();
    (
        MemoryTransport {
            state: StateCell::new(),
            to_peer,
            from_peer: Mutex::new(from_peer),
        },
        PeerEnd { incoming, outgoing },
    )
}

#[async_trait]
impl Transport for MemoryTransport {
    fn endpoint(&self) -> String {
        "memory".into()
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }

    fn subscribe(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }

    async fn init(&self) -> Result<(), McpError> {
        self.state
            .transition(TransportState::Constructed, TransportState::Initialized)
    }

    async fn start(&self) -> Result<(), McpError> {
        self.state
            .transition(TransportState::Initialized, TransportState::Started)
    }

    async fn send(&self, message: &str) -> Result<(), McpError> {
        self.state.require(TransportState::Started)?;
        self.to_peer
            .send(message.to_string())
            .map_err(|_| McpError::TransportError {
                endpoint: "memory".into(),
                reason: "peer gone".into(),
            })
    }

    async fn receive(&self) -> Result<String, McpError> {
        self.state.require(TransportState::Started)?;
        self.from_peer
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| McpError::TransportError {
                endpoint: "memory".into(),
                reason: "peer closed".into(),
            })
    }

    async fn stop(&self) -> Result<(), McpError> {
        self.state.stop();
        Ok(())
    }
}

/// Reply produced by a scripted peer for one request.
pub(crate) enum Reply {
    Result(Value),
    Error(i32, &'static str),
    /// Never answer.
    Silence,
}

/// Run a fake MCP server on `peer`.
///
/// Every frame the client sends is recorded (parsed) into the returned
/// channel. Requests are answered by `handler(method, params)`.
pub(crate) fn spawn_scripted_peer<F>(
    mut peer: PeerEnd,
    handler: F,
) -> (JoinHandle<()>, mpsc::UnboundedReceiver<Value>, mpsc::UnboundedSender<String>)
where
    F: Fn(&str, &Value) -> Reply + Send + Sync + 'static,
{
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    let push = peer.outgoing.clone();
    let handler = Arc::new(handler);
    let task = tokio::spawn(async move {
        while let Some(line) = peer.incoming.recv().await {
            let Ok(frame) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            let _ = seen_tx.send(frame.clone());

            let (Some(id), Some(method)) = (frame.get("id"), frame.get("method").and_then(Value::as_str))
            else {
                continue;
            };
            let params = frame.get("params").cloned().unwrap_or(Value::Null);
            let reply = match handler(method, &params) {
                Reply::Result(result) => {
                    serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result})
                }
                Reply::Error(code, message) => serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": code, "message": message}
                }),
                Reply::Silence => continue,
            };
            if peer.outgoing.send(reply.to_string()).is_err() {
                break;
            }
        }
    });
    (task, seen_rx, push)
}

/// Standard `initialize` result used by scripted peers.
pub(crate) fn initialize_result(name: &str) -> Value {
    serde_json::json!({
        "protocolVersion": "2024-11-05",
        "capabilities": {"tools": {"listChanged": true}},
        "serverInfo": {"name": name, "version": "1.0.0"}
    })
}
