//! One logical connection to an MCP server.
//!
//! A [`ClientSession`] owns a transport, the two pump loops, a correlation
//! table and a dispatch loop that routes inbound messages by kind. On top of
//! that it runs the `initialize` handshake and exposes the typed
//! list/call/read operations.
//!
//! ```text
//! constructed → initialized → handshaking → ready → stopped
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::callbacks::{ChangedCallback, RootsCallback, SamplingCallback, SessionCallbacks};
use super::correlation::RequestMap;
use super::errors::McpError;
use super::pump;
use super::transport::Transport;
use super::types::{
    error_codes, methods, CallToolResult, ClientCapabilities, CreateMessageParams,
    GetPromptResult, Implementation, InitializeParams, InitializeResult, JsonRpcErrorResponse,
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListPromptsResult,
    ListResourcesResult, ListToolsResult, ReadResourceResult, RequestId, RootsCapability,
    DEFAULT_PROTOCOL_VERSION,
};

/// Default bound on the `initialize` exchange. Servers that import large
/// frameworks at startup can take tens of seconds.
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

// ─── Session Contract ────────────────────────────────────────────────────────

/// What the manager needs from a session, whatever backs it.
#[async_trait]
pub trait McpSession: Send + Sync {
    /// Prepare the session without contacting the server.
    async fn init(&self) -> Result<(), McpError>;

    /// Connect and run the handshake. Returns the server's handshake result.
    async fn start(&self) -> Result<InitializeResult, McpError>;

    /// Disconnect. Idempotent.
    async fn stop(&self) -> Result<(), McpError>;

    async fn list_tools(&self) -> Result<ListToolsResult, McpError>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, McpError>;

    async fn list_resources(&self) -> Result<ListResourcesResult, McpError>;

    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, McpError>;

    async fn list_prompts(&self) -> Result<ListPromptsResult, McpError>;

    async fn read_prompt(&self, name: &str, arguments: Value) -> Result<GetPromptResult, McpError>;

    /// Registering before `start` makes the handshake advertise `roots`.
    fn register_roots_callback(&self, callback: RootsCallback);

    /// Registering before `start` makes the handshake advertise `sampling`.
    fn register_sampling_callback(&self, callback: SamplingCallback);

    fn register_tools_changed_callback(&self, callback: ChangedCallback);

    fn register_prompts_changed_callback(&self, callback: ChangedCallback);

    fn register_resources_changed_callback(&self, callback: ChangedCallback);
}

// ─── Options & State ─────────────────────────────────────────────────────────

/// Per-session handshake settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    /// Identity sent as `clientInfo`.
    pub client_info: Implementation,
    pub protocol_version: String,
    /// Bound on the `initialize` exchange; `None` waits forever.
    /// Regular operations are never timed out by the session.
    pub handshake_timeout: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            client_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
            handshake_timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
        }
    }
}

/// Lifecycle state of a [`ClientSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Constructed,
    Initialized,
    Handshaking,
    Ready,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Constructed => "constructed",
            Self::Initialized => "initialized",
            Self::Handshaking => "handshaking",
            Self::Ready => "ready",
            Self::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

// ─── ClientSession ───────────────────────────────────────────────────────────

/// JSON-RPC session over any [`Transport`].
pub struct ClientSession {
    name: String,
    transport: Arc<dyn Transport>,
    options: SessionOptions,
    callbacks: Arc<RwLock<SessionCallbacks>>,
    state: Mutex<SessionState>,
    requests: Mutex<Option<Arc<RequestMap>>>,
    outbound: Mutex<Option<mpsc::UnboundedReceiver<JsonRpcMessage>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    server_info: Mutex<Option<InitializeResult>>,
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("name", &self.name)
            .field("endpoint", &self.transport.endpoint())
            .field("state", &self.state())
            .finish()
    }
}

impl ClientSession {
    /// `name` labels logs and errors; it need not match the registry name.
    pub fn new(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        options: SessionOptions,
        callbacks: SessionCallbacks,
    ) -> Self {
        Self {
            name: name.into(),
            transport,
            options,
            callbacks: Arc::new(RwLock::new(callbacks)),
            state: Mutex::new(SessionState::Constructed),
            requests: Mutex::new(None),
            outbound: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            server_info: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handshake result, once the session is ready.
    pub fn server_info(&self) -> Option<InitializeResult> {
        self.server_info
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn require_state(&self, expected: SessionState) -> Result<(), McpError> {
        let actual = self.state();
        if actual == expected {
            Ok(())
        } else {
            Err(McpError::invalid_state(expected, actual))
        }
    }

    /// Move `from → to`; fails if someone else moved the state first.
    fn advance(&self, from: SessionState, to: SessionState) -> Result<(), McpError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != from {
            return Err(McpError::invalid_state(from, *state));
        }
        *state = to;
        Ok(())
    }

    fn request_map(&self) -> Option<Arc<RequestMap>> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn capabilities(&self) -> ClientCapabilities {
        let callbacks = self.callbacks.read().unwrap_or_else(PoisonError::into_inner);
        ClientCapabilities {
            roots: callbacks
                .roots
                .as_ref()
                .map(|_| RootsCapability { list_changed: true }),
            sampling: callbacks
                .sampling
                .as_ref()
                .map(|_| Value::Object(serde_json::Map::new())),
        }
    }

    /// Send one request and decode its result. Only valid while ready.
    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, McpError> {
        self.require_state(SessionState::Ready)?;
        let requests = self
            .request_map()
            .ok_or_else(|| McpError::invalid_state(SessionState::Ready, self.state()))?;

        let value = requests.send_request(method, params)?.wait().await?;
        serde_json::from_value(value).map_err(|e| McpError::ProtocolError {
            reason: format!("unexpected '{method}' result: {e}"),
        })
    }

    async fn handshake(&self, requests: &RequestMap) -> Result<InitializeResult, McpError> {
        let params = InitializeParams {
            protocol_version: self.options.protocol_version.clone(),
            capabilities: self.capabilities(),
            client_info: self.options.client_info.clone(),
        };
        let params = serde_json::to_value(params).map_err(|e| McpError::ProtocolError {
            reason: format!("failed to encode initialize params: {e}"),
        })?;

        let pending = requests.send_request(methods::INITIALIZE, Some(params))?;
        let value = match self.options.handshake_timeout {
            Some(limit) => tokio::time::timeout(limit, pending.wait())
                .await
                .map_err(|_| McpError::InitFailed {
                    name: self.name.clone(),
                    reason: format!("no initialize response within {}s", limit.as_secs()),
                })??,
            None => pending.wait().await?,
        };

        let result: InitializeResult =
            serde_json::from_value(value).map_err(|e| McpError::ProtocolError {
                reason: format!("malformed initialize result: {e}"),
            })?;

        // Fire-and-forget: nothing waits for the server to acknowledge.
        if let Err(e) = requests.notify(methods::INITIALIZED, None) {
            tracing::warn!(server = %self.name, error = %e, "failed to queue initialized notification");
        }
        Ok(result)
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        // Pump tasks hold the transport; releasing them lets it be dropped
        // (and a child process be killed) even without an explicit stop.
        for task in self
            .tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}

#[async_trait]
impl McpSession for ClientSession {
    async fn init(&self) -> Result<(), McpError> {
        self.require_state(SessionState::Constructed)?;
        self.transport.init().await?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        *self.requests.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Arc::new(RequestMap::new(self.name.clone(), outbound_tx)));
        *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = Some(outbound_rx);

        self.advance(SessionState::Constructed, SessionState::Initialized)?;
        tracing::debug!(server = %self.name, endpoint = %self.transport.endpoint(), "session initialized");
        Ok(())
    }

    async fn start(&self) -> Result<InitializeResult, McpError> {
        self.require_state(SessionState::Initialized)?;
        self.transport.start().await?;
        self.advance(SessionState::Initialized, SessionState::Handshaking)?;

        let requests = self
            .request_map()
            .ok_or_else(|| McpError::invalid_state(SessionState::Initialized, self.state()))?;
        let outbound = self
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| McpError::invalid_state(SessionState::Initialized, self.state()))?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let tasks = vec![
            pump::spawn_reader(self.name.clone(), Arc::clone(&self.transport), inbound_tx),
            pump::spawn_writer(
                self.name.clone(),
                Arc::clone(&self.transport),
                outbound,
                Arc::clone(&requests),
            ),
            tokio::spawn(dispatch_loop(
                self.name.clone(),
                inbound_rx,
                Arc::clone(&requests),
                Arc::clone(&self.callbacks),
            )),
        ];
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);

        let result = match self.handshake(&requests).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(server = %self.name, error = %e, "handshake failed");
                if let Err(stop_err) = self.stop().await {
                    tracing::debug!(server = %self.name, error = %stop_err, "stop after failed handshake");
                }
                return Err(match e {
                    McpError::InitFailed { .. } => e,
                    other => McpError::InitFailed {
                        name: self.name.clone(),
                        reason: other.to_string(),
                    },
                });
            }
        };

        *self.server_info.lock().unwrap_or_else(PoisonError::into_inner) = Some(result.clone());
        // A concurrent stop() wins over a late handshake.
        self.advance(SessionState::Handshaking, SessionState::Ready)
            .map_err(|_| McpError::SessionClosed {
                name: self.name.clone(),
            })?;

        tracing::info!(
            server = %self.name,
            protocol_version = %result.protocol_version,
            peer = result.server_info.as_ref().map(|i| i.name.as_str()).unwrap_or("unknown"),
            "session ready"
        );
        Ok(result)
    }

    async fn stop(&self) -> Result<(), McpError> {
        let previous = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *state, SessionState::Stopped)
        };
        if previous == SessionState::Stopped {
            return Ok(());
        }

        let result = self.transport.stop().await;
        if let Some(requests) = self.request_map() {
            let name = self.name.clone();
            requests.close(|| McpError::SessionClosed { name: name.clone() });
        }
        tracing::info!(server = %self.name, "session stopped");
        result
    }

    async fn list_tools(&self) -> Result<ListToolsResult, McpError> {
        self.request(methods::TOOLS_LIST, None).await
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, McpError> {
        self.request(methods::TOOLS_CALL, Some(named_params("name", name, arguments)))
            .await
    }

    async fn list_resources(&self) -> Result<ListResourcesResult, McpError> {
        self.request(methods::RESOURCES_LIST, None).await
    }

    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, McpError> {
        self.request(methods::RESOURCES_READ, Some(serde_json::json!({ "uri": uri })))
            .await
    }

    async fn list_prompts(&self) -> Result<ListPromptsResult, McpError> {
        self.request(methods::PROMPTS_LIST, None).await
    }

    async fn read_prompt(&self, name: &str, arguments: Value) -> Result<GetPromptResult, McpError> {
        self.request(methods::PROMPTS_GET, Some(named_params("name", name, arguments)))
            .await
    }

    fn register_roots_callback(&self, callback: RootsCallback) {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .roots = Some(callback);
    }

    fn register_sampling_callback(&self, callback: SamplingCallback) {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .sampling = Some(callback);
    }

    fn register_tools_changed_callback(&self, callback: ChangedCallback) {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .tools_changed = Some(callback);
    }

    fn register_prompts_changed_callback(&self, callback: ChangedCallback) {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .prompts_changed = Some(callback);
    }

    fn register_resources_changed_callback(&self, callback: ChangedCallback) {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .resources_changed = Some(callback);
    }
}

/// `{"<key>": value, "arguments": arguments}`, omitting null arguments.
fn named_params(key: &str, value: &str, arguments: Value) -> Value {
    let mut params = serde_json::Map::new();
    params.insert(key.to_string(), Value::String(value.to_string()));
    if !arguments.is_null() {
        params.insert("arguments".to_string(), arguments);
    }
    Value::Object(params)
}

// ─── Inbound Dispatch ────────────────────────────────────────────────────────

/// Route inbound messages by kind until the reader loop goes away, then fail
/// whatever is still pending.
async fn dispatch_loop(
    name: String,
    mut inbound: mpsc::UnboundedReceiver<JsonRpcMessage>,
    requests: Arc<RequestMap>,
    callbacks: Arc<RwLock<SessionCallbacks>>,
) {
    while let Some(message) = inbound.recv().await {
        match message {
            JsonRpcMessage::Response(response) => {
                requests.resolve(&response.id, Ok(response.result));
            }
            JsonRpcMessage::Error(error) => {
                tracing::warn!(
                    server = %name,
                    id = ?error.id,
                    code = error.error.code,
                    message = %error.error.message,
                    "peer reported error"
                );
                if let Some(id) = error.id {
                    requests.resolve(&id, Err(error.error.into()));
                }
            }
            JsonRpcMessage::Notification(notification) => {
                handle_notification(&name, &notification, &callbacks);
            }
            JsonRpcMessage::Request(request) => {
                handle_request(&name, request, &requests, &callbacks);
            }
        }
    }

    let failed = requests.close(|| McpError::SessionClosed { name: name.clone() });
    tracing::debug!(server = %name, failed, "dispatch loop exited");
}

fn handle_notification(
    name: &str,
    notification: &JsonRpcNotification,
    callbacks: &RwLock<SessionCallbacks>,
) {
    let hook = {
        let callbacks = callbacks.read().unwrap_or_else(PoisonError::into_inner);
        match notification.method.as_str() {
            methods::TOOLS_LIST_CHANGED => callbacks.tools_changed.clone(),
            methods::PROMPTS_LIST_CHANGED => callbacks.prompts_changed.clone(),
            methods::RESOURCES_LIST_CHANGED => callbacks.resources_changed.clone(),
            other => {
                tracing::debug!(server = %name, method = other, "ignoring notification");
                return;
            }
        }
    };

    match hook {
        // Hooks run detached so a slow one cannot stall dispatch.
        Some(hook) => {
            tokio::spawn(hook());
        }
        None => {
            tracing::debug!(server = %name, method = %notification.method, "no hook registered");
        }
    }
}

fn handle_request(
    name: &str,
    request: JsonRpcRequest,
    requests: &Arc<RequestMap>,
    callbacks: &RwLock<SessionCallbacks>,
) {
    let (roots, sampling) = {
        let callbacks = callbacks.read().unwrap_or_else(PoisonError::into_inner);
        (callbacks.roots.clone(), callbacks.sampling.clone())
    };

    let id = request.id;
    let reply: BoxFuture<'static, JsonRpcMessage> = match (request.method.as_str(), roots, sampling) {
        (methods::PING, _, _) => {
            async move {
                JsonRpcMessage::from(JsonRpcResponse::new(id, Value::Object(serde_json::Map::new())))
            }
            .boxed()
        }
        (methods::ROOTS_LIST, Some(roots), _) => async move { encode_reply(id, roots().await) }.boxed(),
        (methods::SAMPLING_CREATE_MESSAGE, _, Some(sampling)) => {
            match serde_json::from_value::<CreateMessageParams>(request.params.unwrap_or(Value::Null)) {
                Ok(params) => async move { encode_reply(id, sampling(params).await) }.boxed(),
                Err(e) => {
                    let message = format!("invalid sampling params: {e}");
                    async move {
                        JsonRpcMessage::from(JsonRpcErrorResponse::new(
                            id,
                            error_codes::INVALID_PARAMS,
                            message,
                        ))
                    }
                    .boxed()
                }
            }
        }
        (other, _, _) => {
            tracing::debug!(server = %name, method = other, id = %id, "ignoring server request");
            return;
        }
    };

    let requests = Arc::clone(requests);
    let name = name.to_string();
    tokio::spawn(async move {
        if let Err(e) = requests.respond(reply.await) {
            tracing::debug!(server = %name, error = %e, "could not answer server request");
        }
    });
}

fn encode_reply<T: serde::Serialize>(
    id: RequestId,
    outcome: Result<T, McpError>,
) -> JsonRpcMessage {
    let encoded = outcome.and_then(|value| {
        serde_json::to_value(value).map_err(|e| McpError::ProtocolError {
            reason: e.to_string(),
        })
    });
    match encoded {
        Ok(result) => JsonRpcResponse::new(id, result).into(),
        Err(McpError::ServerError { code, message, .. }) => {
            JsonRpcErrorResponse::new(id, code, message).into()
        }
        Err(e) => JsonRpcErrorResponse::new(id, error_codes::INTERNAL_ERROR, e.to_string()).into(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

    use super::*;
    use crate::mcp_client::transport::memory::{
        initialize_result, memory_pair, spawn_scripted_peer, Reply,
    };
    use crate::mcp_client::types::{CreateMessageResult, ListRootsResult, Root};

    const WAIT: Duration = Duration::from_secs(2);

    struct Harness {
        session: ClientSession,
        seen: UnboundedReceiver<Value>,
        push: UnboundedSender<String>,
        peer: JoinHandle<()>,
    }

    impl Harness {
        /// Next frame the client sent, skipping the handshake frames.
        async fn next_frame(&mut self) -> Value {
            loop {
                let frame = tokio::time::timeout(WAIT, self.seen.recv())
                    .await
                    .expect("frame expected")
                    .expect("peer alive");
                let method = frame.get("method").and_then(Value::as_str);
                if method != Some(methods::INITIALIZE) && method != Some(methods::INITIALIZED) {
                    return frame;
                }
            }
        }
    }

    fn default_handler(method: &str, params: &Value) -> Reply {
        match method {
            "initialize" => Reply::Result(initialize_result("fake")),
            "tools/list" => Reply::Result(serde_json::json!({
                "tools": [{"name": "get-current-time", "inputSchema": {"type": "object"}}]
            })),
            "tools/call" => match params["name"].as_str() {
                Some("get-current-time") => Reply::Result(serde_json::json!({
                    "content": [{"type": "text", "text": "12:00"}]
                })),
                _ => Reply::Error(error_codes::INVALID_PARAMS, "unknown tool"),
            },
            "resources/read" => Reply::Result(serde_json::json!({
                "contents": [{"uri": params["uri"], "text": "now"}]
            })),
            "prompts/get" => Reply::Result(serde_json::json!({
                "messages": [{"role": "user", "content": {"type": "text", "text": params["name"]}}]
            })),
            "prompts/list" => Reply::Silence,
            _ => Reply::Error(error_codes::METHOD_NOT_FOUND, "method not found"),
        }
    }

    fn harness_with(callbacks: SessionCallbacks) -> Harness {
        let (transport, peer) = memory_pair();
        let (peer, seen, push) = spawn_scripted_peer(peer, default_handler);
        let session = ClientSession::new(
            "fake",
            Arc::new(transport),
            SessionOptions::default(),
            callbacks,
        );
        Harness {
            session,
            seen,
            push,
            peer,
        }
    }

    async fn ready_harness(callbacks: SessionCallbacks) -> Harness {
        let harness = harness_with(callbacks);
        harness.session.init().await.unwrap();
        harness.session.start().await.unwrap();
        harness
    }

    fn roots_callback() -> RootsCallback {
        Arc::new(|| {
            async {
                Ok::<_, McpError>(ListRootsResult {
                    roots: vec![Root {
                        uri: "file:///workspace".into(),
                        name: Some("workspace".into()),
                    }],
                })
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_handshake_without_callbacks_advertises_nothing() {
        let mut harness = harness_with(SessionCallbacks::default());
        harness.session.init().await.unwrap();
        let result = harness.session.start().await.unwrap();
        assert_eq!(result.server_info.unwrap().name, "fake");
        assert_eq!(harness.session.state(), SessionState::Ready);

        let init = harness.seen.recv().await.unwrap();
        assert_eq!(init["method"], "initialize");
        assert_eq!(init["params"]["capabilities"], serde_json::json!({}));
        assert_eq!(init["params"]["protocolVersion"], DEFAULT_PROTOCOL_VERSION);
        assert_eq!(init["params"]["clientInfo"]["name"], env!("CARGO_PKG_NAME"));

        let initialized = harness.seen.recv().await.unwrap();
        assert_eq!(initialized["method"], "notifications/initialized");
        assert!(initialized.get("id").is_none());
        assert!(initialized.get("params").is_none());
    }

    #[tokio::test]
    async fn test_handshake_advertises_registered_callbacks() {
        let sampling: SamplingCallback = Arc::new(|_params: CreateMessageParams| {
            async { Err::<CreateMessageResult, _>(McpError::ProtocolError { reason: "unused".into() }) }.boxed()
        });
        let mut harness = harness_with(SessionCallbacks::default().with_roots(roots_callback()));
        harness.session.register_sampling_callback(sampling);
        harness.session.init().await.unwrap();
        harness.session.start().await.unwrap();

        let init = harness.seen.recv().await.unwrap();
        assert_eq!(
            init["params"]["capabilities"],
            serde_json::json!({"roots": {"listChanged": true}, "sampling": {}})
        );
    }

    #[tokio::test]
    async fn test_operations_require_ready() {
        let harness = harness_with(SessionCallbacks::default());
        assert!(matches!(
            harness.session.list_tools().await.unwrap_err(),
            McpError::InvalidState { .. }
        ));
        harness.session.init().await.unwrap();
        assert!(matches!(
            harness.session.call_tool("x", Value::Null).await.unwrap_err(),
            McpError::InvalidState { .. }
        ));
        // init twice is rejected
        assert!(harness.session.init().await.is_err());
    }

    #[tokio::test]
    async fn test_typed_operations_round_trip() {
        let mut harness = ready_harness(SessionCallbacks::default()).await;

        let tools = harness.session.list_tools().await.unwrap();
        assert_eq!(tools.tools[0].name, "get-current-time");

        let result = harness
            .session
            .call_tool("get-current-time", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(result.content[0]["text"], "12:00");

        let read = harness
            .session
            .read_resource("datetime://Africa/Algiers/now")
            .await
            .unwrap();
        assert_eq!(read.contents[0]["uri"], "datetime://Africa/Algiers/now");

        let prompt = harness
            .session
            .read_prompt("greeting", Value::Null)
            .await
            .unwrap();
        assert_eq!(prompt.messages.len(), 1);

        // Skip list_tools, call_tool, read_resource frames; check prompts/get shape.
        for _ in 0..3 {
            harness.next_frame().await;
        }
        let frame = harness.next_frame().await;
        assert_eq!(frame["method"], "prompts/get");
        assert_eq!(frame["params"], serde_json::json!({"name": "greeting"}));
    }

    #[tokio::test]
    async fn test_server_error_reaches_caller() {
        let harness = ready_harness(SessionCallbacks::default()).await;
        let err = harness
            .session
            .call_tool("no-such-tool", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ServerError { code: -32602, .. }));

        // Session still usable afterwards.
        assert!(harness.session.list_tools().await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_response_id_is_discarded() {
        let harness = ready_harness(SessionCallbacks::default()).await;
        harness
            .push
            .send(r#"{"jsonrpc":"2.0","id":999,"result":{}}"#.into())
            .unwrap();
        harness
            .push
            .send(r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"Parse error"}}"#.into())
            .unwrap();
        assert!(harness.session.list_tools().await.is_ok());
    }

    #[tokio::test]
    async fn test_stop_fails_pending_requests() {
        let harness = ready_harness(SessionCallbacks::default()).await;
        let session = Arc::new(harness.session);

        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.list_prompts().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        session.stop().await.unwrap();
        let err = tokio::time::timeout(WAIT, waiter).await.unwrap().unwrap().unwrap_err();
        assert!(matches!(err, McpError::SessionClosed { .. }));

        assert_eq!(session.state(), SessionState::Stopped);
        session.stop().await.unwrap();
        assert!(matches!(
            session.list_tools().await.unwrap_err(),
            McpError::InvalidState { .. }
        ));
    }

    #[tokio::test]
    async fn test_transport_loss_fails_pending_requests() {
        let harness = ready_harness(SessionCallbacks::default()).await;
        let session = Arc::new(harness.session);

        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.list_prompts().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Kill the peer: the inbound stream ends.
        harness.peer.abort();
        drop(harness.push);

        let err = tokio::time::timeout(WAIT, waiter).await.unwrap().unwrap().unwrap_err();
        assert!(matches!(err, McpError::SessionClosed { .. }));
    }

    #[tokio::test]
    async fn test_handshake_error_fails_start() {
        let (transport, peer) = memory_pair();
        let (_peer, _seen, _push) = spawn_scripted_peer(peer, |method, _| match method {
            "initialize" => Reply::Error(error_codes::INVALID_REQUEST, "unsupported version"),
            _ => Reply::Silence,
        });
        let session = ClientSession::new(
            "broken",
            Arc::new(transport),
            SessionOptions::default(),
            SessionCallbacks::default(),
        );
        session.init().await.unwrap();
        let err = session.start().await.unwrap_err();
        assert!(matches!(err, McpError::InitFailed { .. }));
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(session.server_info().is_none());
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (transport, peer) = memory_pair();
        let (_peer, _seen, _push) = spawn_scripted_peer(peer, |_, _| Reply::Silence);
        let options = SessionOptions {
            handshake_timeout: Some(Duration::from_millis(100)),
            ..SessionOptions::default()
        };
        let session = ClientSession::new(
            "silent",
            Arc::new(transport),
            options,
            SessionCallbacks::default(),
        );
        session.init().await.unwrap();
        let err = session.start().await.unwrap_err();
        assert!(matches!(err, McpError::InitFailed { .. }));
    }

    #[tokio::test]
    async fn test_answers_roots_and_ping_requests() {
        let mut harness = ready_harness(SessionCallbacks::default().with_roots(roots_callback())).await;

        harness
            .push
            .send(r#"{"jsonrpc":"2.0","id":"srv-1","method":"roots/list"}"#.into())
            .unwrap();
        let reply = harness.next_frame().await;
        assert_eq!(reply["id"], "srv-1");
        assert_eq!(reply["result"]["roots"][0]["uri"], "file:///workspace");

        harness
            .push
            .send(r#"{"jsonrpc":"2.0","id":5,"method":"ping"}"#.into())
            .unwrap();
        let reply = harness.next_frame().await;
        assert_eq!(reply["id"], 5);
        assert_eq!(reply["result"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_sampling_request_with_bad_params_gets_error() {
        let sampling: SamplingCallback = Arc::new(|params: CreateMessageParams| {
            async move {
                Ok::<_, McpError>(CreateMessageResult {
                    role: "assistant".into(),
                    content: serde_json::json!({"type": "text", "text": params.messages.len().to_string()}),
                    model: "test-model".into(),
                    stop_reason: None,
                })
            }
            .boxed()
        });
        let mut harness =
            ready_harness(SessionCallbacks::default().with_sampling(sampling)).await;

        harness
            .push
            .send(r#"{"jsonrpc":"2.0","id":1,"method":"sampling/createMessage","params":{"nope":true}}"#.into())
            .unwrap();
        let reply = harness.next_frame().await;
        assert_eq!(reply["error"]["code"], error_codes::INVALID_PARAMS);

        harness
            .push
            .send(
                r#"{"jsonrpc":"2.0","id":2,"method":"sampling/createMessage","params":{"messages":[{"role":"user","content":{"type":"text","text":"hi"}}],"maxTokens":10}}"#
                    .into(),
            )
            .unwrap();
        let reply = harness.next_frame().await;
        assert_eq!(reply["result"]["model"], "test-model");
        assert_eq!(reply["result"]["content"]["text"], "1");
    }

    #[tokio::test]
    async fn test_unhandled_server_request_is_ignored() {
        let harness = ready_harness(SessionCallbacks::default()).await;
        // No roots callback: the request is ignored and the session keeps working.
        harness
            .push
            .send(r#"{"jsonrpc":"2.0","id":"srv-9","method":"roots/list"}"#.into())
            .unwrap();
        assert!(harness.session.list_tools().await.is_ok());
    }

    #[tokio::test]
    async fn test_list_changed_hook_registered_after_start_fires() {
        let harness = ready_harness(SessionCallbacks::default()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        harness
            .session
            .register_tools_changed_callback(Arc::new(move || {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(());
                }
                .boxed()
            }));

        harness
            .push
            .send(r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#.into())
            .unwrap();
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("hook should fire")
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdio_session_against_shell_server() {
        use crate::mcp_client::transport::{StdioServerParameters, StdioTransport};

        let script = r#"
read line
echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"sh","version":"0"}}}'
read line
read line
echo '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo"}]}}'
cat > /dev/null
"#;
        let params = StdioServerParameters::new("sh")
            .with_args(["-c", script])
            .with_log_stderr(false);
        let session = ClientSession::new(
            "sh",
            Arc::new(StdioTransport::new(params)),
            SessionOptions::default(),
            SessionCallbacks::default(),
        );
        session.init().await.unwrap();
        let info = session.start().await.unwrap();
        assert_eq!(info.server_info.unwrap().name, "sh");

        let tools = session.list_tools().await.unwrap();
        assert_eq!(tools.tools[0].name, "echo");

        session.stop().await.unwrap();
    }
}
