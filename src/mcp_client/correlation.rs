//! Request correlation table.
//!
//! Maps each outstanding request id to a single-assignment reply slot. The
//! caller's submit path and the session's dispatch loop both touch the table,
//! so every access goes through one mutex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use super::errors::McpError;
use super::types::{JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, RequestId};

type ReplySlot = oneshot::Sender<Result<Value, McpError>>;

#[derive(Debug, Default)]
struct Slots {
    pending: HashMap<RequestId, ReplySlot>,
    closed: bool,
}

/// Pending-request table plus the outbound queue requests are written to.
#[derive(Debug)]
pub struct RequestMap {
    name: String,
    next_id: AtomicI64,
    slots: Mutex<Slots>,
    outgoing: mpsc::UnboundedSender<JsonRpcMessage>,
}

/// Handle to one outstanding request.
#[derive(Debug)]
pub struct PendingRequest {
    id: RequestId,
    name: String,
    reply: oneshot::Receiver<Result<Value, McpError>>,
}

impl PendingRequest {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Wait for the matching response. Suspends until the peer answers or
    /// the session closes.
    pub async fn wait(self) -> Result<Value, McpError> {
        match self.reply.await {
            Ok(outcome) => outcome,
            Err(_) => Err(McpError::SessionClosed { name: self.name }),
        }
    }
}

impl RequestMap {
    /// `name` labels log lines and `SessionClosed` errors.
    pub fn new(name: impl Into<String>, outgoing: mpsc::UnboundedSender<JsonRpcMessage>) -> Self {
        Self {
            name: name.into(),
            next_id: AtomicI64::new(1),
            slots: Mutex::new(Slots::default()),
            outgoing,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn closed_error(&self) -> McpError {
        McpError::SessionClosed {
            name: self.name.clone(),
        }
    }

    /// Allocate a fresh id, register its slot and enqueue the request.
    pub fn send_request(&self, method: &str, params: Option<Value>) -> Result<PendingRequest, McpError> {
        let id = {
            let slots = self.lock();
            if slots.closed {
                return Err(self.closed_error());
            }
            // Ids still pending from a caller-chosen submit are skipped.
            loop {
                let candidate = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
                if !slots.pending.contains_key(&candidate) {
                    break candidate;
                }
            }
        };
        self.submit(JsonRpcRequest::new(id, method, params))
    }

    /// Register and enqueue a request whose id the caller chose.
    pub fn submit(&self, request: JsonRpcRequest) -> Result<PendingRequest, McpError> {
        let id = request.id.clone();
        let (tx, rx) = oneshot::channel();
        {
            let mut slots = self.lock();
            if slots.closed {
                return Err(self.closed_error());
            }
            if slots.pending.contains_key(&id) {
                return Err(McpError::DuplicateRequestId { id: id.to_string() });
            }
            slots.pending.insert(id.clone(), tx);

            // Enqueue under the lock so queue order matches id registration.
            if self.outgoing.send(request.into()).is_err() {
                slots.pending.remove(&id);
                return Err(self.closed_error());
            }
        }

        tracing::trace!(server = %self.name, id = %id, "request registered");
        Ok(PendingRequest {
            id,
            name: self.name.clone(),
            reply: rx,
        })
    }

    /// Assign `outcome` to the slot for `id` and remove it.
    ///
    /// Returns `false` (and logs) if no request with that id is pending:
    /// duplicate, late, or foreign responses are discarded.
    pub fn resolve(&self, id: &RequestId, outcome: Result<Value, McpError>) -> bool {
        let slot = self.lock().pending.remove(id);
        match slot {
            Some(tx) => {
                // The caller may have stopped waiting; that is not an error.
                let _ = tx.send(outcome);
                true
            }
            None => {
                tracing::warn!(server = %self.name, id = %id, "discarding response for unknown request id");
                false
            }
        }
    }

    /// Enqueue a fire-and-forget notification.
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        self.enqueue(JsonRpcNotification::new(method, params).into())
    }

    /// Enqueue a reply to a server-initiated request.
    pub fn respond(&self, message: JsonRpcMessage) -> Result<(), McpError> {
        self.enqueue(message)
    }

    fn enqueue(&self, message: JsonRpcMessage) -> Result<(), McpError> {
        if self.lock().closed {
            return Err(self.closed_error());
        }
        self.outgoing.send(message).map_err(|_| self.closed_error())
    }

    /// Refuse new requests and fail every pending one with `make_err()`.
    /// Returns how many were failed.
    pub fn close(&self, make_err: impl Fn() -> McpError) -> usize {
        let drained: Vec<ReplySlot> = {
            let mut slots = self.lock();
            slots.closed = true;
            slots.pending.drain().map(|(_, tx)| tx).collect()
        };
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(make_err()));
        }
        if count > 0 {
            tracing::debug!(server = %self.name, count, "failed pending requests");
        }
        count
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    fn table() -> (Arc<RequestMap>, mpsc::UnboundedReceiver<JsonRpcMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(RequestMap::new("test", tx)), rx)
    }

    #[tokio::test]
    async fn test_send_request_enqueues_and_resolves() {
        let (map, mut queue) = table();
        let pending = map.send_request("tools/list", None).unwrap();
        assert_eq!(pending.id(), &RequestId::Number(1));

        match queue.recv().await.unwrap() {
            JsonRpcMessage::Request(req) => {
                assert_eq!(req.id, RequestId::Number(1));
                assert_eq!(req.method, "tools/list");
            }
            other => panic!("expected request, got {other:?}"),
        }

        assert!(map.resolve(&RequestId::Number(1), Ok(serde_json::json!({"tools": []}))));
        assert_eq!(pending.wait().await.unwrap(), serde_json::json!({"tools": []}));
        assert_eq!(map.pending_count(), 0);
    }

    #[test]
    fn test_resolve_unknown_id_is_noop() {
        let (map, _queue) = table();
        assert!(!map.resolve(&RequestId::Number(42), Ok(Value::Null)));
        assert!(!map.resolve(&RequestId::String("nope".into()), Ok(Value::Null)));
    }

    #[tokio::test]
    async fn test_resolve_only_once() {
        let (map, _queue) = table();
        let pending = map.send_request("ping", None).unwrap();
        let id = pending.id().clone();
        assert!(map.resolve(&id, Ok(serde_json::json!(1))));
        assert!(!map.resolve(&id, Ok(serde_json::json!(2))));
        assert_eq!(pending.wait().await.unwrap(), serde_json::json!(1));
    }

    #[test]
    fn test_submit_rejects_pending_id() {
        let (map, _queue) = table();
        let _first = map
            .submit(JsonRpcRequest::new("abc", "ping", None))
            .unwrap();
        let err = map
            .submit(JsonRpcRequest::new("abc", "ping", None))
            .unwrap_err();
        assert!(matches!(err, McpError::DuplicateRequestId { .. }));
        assert_eq!(map.pending_count(), 1);
    }

    #[test]
    fn test_allocation_skips_ids_still_pending() {
        let (map, _queue) = table();
        let _manual = map.submit(JsonRpcRequest::new(2, "ping", None)).unwrap();
        let a = map.send_request("ping", None).unwrap();
        let b = map.send_request("ping", None).unwrap();
        assert_eq!(a.id(), &RequestId::Number(1));
        assert_eq!(b.id(), &RequestId::Number(3));
    }

    #[tokio::test]
    async fn test_concurrent_callers_get_distinct_ids() {
        let (map, _queue) = table();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let map = Arc::clone(&map);
            handles.push(tokio::spawn(async move {
                (0..25)
                    .map(|_| map.send_request("ping", None).unwrap().id().clone())
                    .collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "id allocated twice");
            }
        }
        assert_eq!(seen.len(), 400);
    }

    #[tokio::test]
    async fn test_peer_error_resolves_with_server_error() {
        let (map, _queue) = table();
        let pending = map.send_request("tools/call", None).unwrap();
        map.resolve(
            pending.id(),
            Err(McpError::ServerError {
                code: -32602,
                message: "bad args".into(),
                data: None,
            }),
        );
        assert!(matches!(
            pending.wait().await.unwrap_err(),
            McpError::ServerError { code: -32602, .. }
        ));
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_refuses_new() {
        let (map, _queue) = table();
        let a = map.send_request("tools/list", None).unwrap();
        let b = map.send_request("prompts/list", None).unwrap();

        let failed = map.close(|| McpError::SessionClosed { name: "test".into() });
        assert_eq!(failed, 2);
        assert!(map.is_closed());
        assert!(matches!(a.wait().await.unwrap_err(), McpError::SessionClosed { .. }));
        assert!(matches!(b.wait().await.unwrap_err(), McpError::SessionClosed { .. }));

        assert!(matches!(
            map.send_request("ping", None).unwrap_err(),
            McpError::SessionClosed { .. }
        ));
        assert!(map.notify("notifications/initialized", None).is_err());
    }

    #[tokio::test]
    async fn test_send_fails_when_writer_gone() {
        let (map, queue) = table();
        drop(queue);
        assert!(matches!(
            map.send_request("ping", None).unwrap_err(),
            McpError::SessionClosed { .. }
        ));
        assert_eq!(map.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_queue_preserves_submission_order() {
        let (map, mut queue) = table();
        map.send_request("a", None).unwrap();
        map.notify("b", None).unwrap();
        map.send_request("c", None).unwrap();

        let mut methods = Vec::new();
        for _ in 0..3 {
            methods.push(match queue.recv().await.unwrap() {
                JsonRpcMessage::Request(r) => r.method,
                JsonRpcMessage::Notification(n) => n.method,
                other => panic!("unexpected {other:?}"),
            });
        }
        assert_eq!(methods, vec!["a", "b", "c"]);
    }
}
