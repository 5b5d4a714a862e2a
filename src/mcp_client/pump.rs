//! Message pump: one reader loop and one writer loop per session.
//!
//! Both loops are gated on the transport state and exit on their own once
//! it leaves `started`; nobody cancels them explicitly.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::correlation::RequestMap;
use super::errors::McpError;
use super::transport::{left_started, Transport, TransportState};
use super::types::JsonRpcMessage;

/// Drain the transport into `inbound`.
///
/// Frames that fail to parse are logged and dropped. The loop ends when the
/// transport stops, when `receive` fails (stream closed, child exited), or
/// when nobody listens on `inbound` anymore. Dropping `inbound` on exit is
/// how the dispatcher learns the stream is gone.
pub fn spawn_reader(
    name: String,
    transport: Arc<dyn Transport>,
    inbound: mpsc::UnboundedSender<JsonRpcMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut state = transport.subscribe();
        while transport.state() == TransportState::Started {
            let frame = tokio::select! {
                received = transport.receive() => received,
                _ = left_started(&mut state) => break,
            };

            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    if transport.state() == TransportState::Started {
                        tracing::warn!(server = %name, error = %e, "inbound stream ended");
                    }
                    break;
                }
            };

            if frame.trim().is_empty() {
                continue;
            }
            tracing::trace!(server = %name, frame = frame.trim_end(), "received");

            match JsonRpcMessage::parse(&frame) {
                Ok(message) => {
                    if inbound.send(message).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "dropping unparseable frame");
                }
            }
        }
        tracing::debug!(server = %name, "reader loop exited");
    })
}

/// Drain `outbound` into the transport, in queue order.
///
/// If writing a request fails, its pending slot is resolved with the error so
/// the caller is not left waiting on a frame that never left.
pub fn spawn_writer(
    name: String,
    transport: Arc<dyn Transport>,
    mut outbound: mpsc::UnboundedReceiver<JsonRpcMessage>,
    requests: Arc<RequestMap>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut state = transport.subscribe();
        while transport.state() == TransportState::Started {
            let message = tokio::select! {
                next = outbound.recv() => match next {
                    Some(message) => message,
                    None => break,
                },
                _ = left_started(&mut state) => break,
            };

            let line = match message.to_line() {
                Ok(line) => line,
                Err(e) => {
                    fail_request(&requests, &message, e);
                    continue;
                }
            };

            tracing::trace!(server = %name, frame = %line, "sending");
            if let Err(e) = transport.send(&line).await {
                tracing::warn!(server = %name, kind = message.kind(), error = %e, "write failed");
                fail_request(&requests, &message, e);
            }
        }
        tracing::debug!(server = %name, "writer loop exited");
    })
}

fn fail_request(requests: &RequestMap, message: &JsonRpcMessage, error: McpError) {
    if let JsonRpcMessage::Request(request) = message {
        requests.resolve(&request.id, Err(error));
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mcp_client::transport::memory::memory_pair;

    async fn started_pair() -> (
        Arc<dyn Transport>,
        crate::mcp_client::transport::memory::PeerEnd,
    ) {
        let (transport, peer) = memory_pair();
        transport.init().await.unwrap();
        transport.start().await.unwrap();
        (Arc::new(transport), peer)
    }

    #[tokio::test]
    async fn test_reader_skips_garbage_and_keeps_going() {
        let (transport, peer) = started_pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reader = spawn_reader("t".into(), Arc::clone(&transport), tx);

        peer.outgoing.send("not json at all".into()).unwrap();
        peer.outgoing.send("".into()).unwrap();
        peer.outgoing
            .send(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#.into())
            .unwrap();

        let message = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.kind(), "response");

        transport.stop().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("reader should exit after stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_reader_exits_when_stream_closes() {
        let (transport, peer) = started_pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reader = spawn_reader("t".into(), Arc::clone(&transport), tx);

        drop(peer);
        tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        // Sender dropped with the loop.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_writer_sends_in_order_and_exits_on_stop() {
        let (transport, mut peer) = started_pair().await;
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let requests = Arc::new(RequestMap::new("t", out_tx.clone()));
        let writer = spawn_writer("t".into(), Arc::clone(&transport), out_rx, requests);

        for method in ["a", "b", "c"] {
            out_tx
                .send(crate::mcp_client::types::JsonRpcNotification::new(method, None).into())
                .unwrap();
        }
        for method in ["a", "b", "c"] {
            let line = peer.incoming.recv().await.unwrap();
            let value: serde_json::Value = serde_json::from_str(&line).unwrap();
            assert_eq!(value["method"], method);
        }

        transport.stop().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), writer)
            .await
            .expect("writer should exit after stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_write_failure_resolves_pending_request() {
        let (transport, peer) = started_pair().await;
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let requests = Arc::new(RequestMap::new("t", out_tx));
        let _writer = spawn_writer("t".into(), Arc::clone(&transport), out_rx, Arc::clone(&requests));

        // Peer gone: every send fails.
        drop(peer);
        let pending = requests.send_request("tools/list", None).unwrap();
        let err = tokio::time::timeout(Duration::from_secs(1), pending.wait())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, McpError::TransportError { .. }));
    }
}
