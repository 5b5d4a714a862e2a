//! Sessions backed by an in-process server object.
//!
//! The server object is handed in by the caller; nothing is loaded by name.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use super::callbacks::{ChangedCallback, RootsCallback, SamplingCallback, SessionCallbacks};
use super::errors::McpError;
use super::session::McpSession;
use super::types::{
    error_codes, CallToolResult, GetPromptResult, Implementation, InitializeResult,
    ListPromptsResult, ListResourcesResult, ListToolsResult, ReadResourceResult,
    DEFAULT_PROTOCOL_VERSION,
};

/// An MCP server living in the same process.
///
/// Only tools are mandatory; servers without resources or prompts report
/// empty lists.
#[async_trait]
pub trait InProcessServer: Send + Sync {
    fn server_info(&self) -> Implementation;

    async fn list_tools(&self) -> Result<ListToolsResult, McpError>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, McpError>;

    async fn list_resources(&self) -> Result<ListResourcesResult, McpError> {
        Ok(ListResourcesResult::default())
    }

    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, McpError> {
        Err(McpError::ServerError {
            code: error_codes::INVALID_PARAMS,
            message: format!("unknown resource: {uri}"),
            data: None,
        })
    }

    async fn list_prompts(&self) -> Result<ListPromptsResult, McpError> {
        Ok(ListPromptsResult::default())
    }

    async fn get_prompt(&self, name: &str, _arguments: Value) -> Result<GetPromptResult, McpError> {
        Err(McpError::ServerError {
            code: error_codes::INVALID_PARAMS,
            message: format!("unknown prompt: {name}"),
            data: None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdapterState {
    Constructed,
    Initialized,
    Ready,
    Stopped,
}

/// [`McpSession`] over an [`InProcessServer`]. No transport, no wire format.
pub struct InProcessSession {
    server: Arc<dyn InProcessServer>,
    state: Mutex<AdapterState>,
    // Held so registrations behave like on any other session; an in-process
    // server never calls back.
    callbacks: Mutex<SessionCallbacks>,
}

impl InProcessSession {
    pub fn new(server: Arc<dyn InProcessServer>, callbacks: SessionCallbacks) -> Self {
        Self {
            server,
            state: Mutex::new(AdapterState::Constructed),
            callbacks: Mutex::new(callbacks),
        }
    }

    fn state(&self) -> AdapterState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn advance(&self, from: AdapterState, to: AdapterState) -> Result<(), McpError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != from {
            return Err(McpError::invalid_state(
                format!("{from:?}").to_lowercase(),
                format!("{:?}", *state).to_lowercase(),
            ));
        }
        *state = to;
        Ok(())
    }

    fn require_ready(&self) -> Result<(), McpError> {
        match self.state() {
            AdapterState::Ready => Ok(()),
            other => Err(McpError::invalid_state("ready", format!("{other:?}").to_lowercase())),
        }
    }

    fn update_callbacks(&self, apply: impl FnOnce(&mut SessionCallbacks)) {
        apply(&mut self.callbacks.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

#[async_trait]
impl McpSession for InProcessSession {
    async fn init(&self) -> Result<(), McpError> {
        self.advance(AdapterState::Constructed, AdapterState::Initialized)
    }

    async fn start(&self) -> Result<InitializeResult, McpError> {
        self.advance(AdapterState::Initialized, AdapterState::Ready)?;
        let info = self.server.server_info();
        tracing::debug!(server = %info.name, "in-process session ready");
        Ok(InitializeResult {
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
            capabilities: serde_json::json!({ "tools": {}, "resources": {}, "prompts": {} }),
            server_info: Some(info),
            instructions: None,
        })
    }

    async fn stop(&self) -> Result<(), McpError> {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = AdapterState::Stopped;
        Ok(())
    }

    async fn list_tools(&self) -> Result<ListToolsResult, McpError> {
        self.require_ready()?;
        self.server.list_tools().await
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, McpError> {
        self.require_ready()?;
        self.server.call_tool(name, arguments).await
    }

    async fn list_resources(&self) -> Result<ListResourcesResult, McpError> {
        self.require_ready()?;
        self.server.list_resources().await
    }

    async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, McpError> {
        self.require_ready()?;
        self.server.read_resource(uri).await
    }

    async fn list_prompts(&self) -> Result<ListPromptsResult, McpError> {
        self.require_ready()?;
        self.server.list_prompts().await
    }

    async fn read_prompt(&self, name: &str, arguments: Value) -> Result<GetPromptResult, McpError> {
        self.require_ready()?;
        self.server.get_prompt(name, arguments).await
    }

    fn register_roots_callback(&self, callback: RootsCallback) {
        self.update_callbacks(|c| c.roots = Some(callback));
    }

    fn register_sampling_callback(&self, callback: SamplingCallback) {
        self.update_callbacks(|c| c.sampling = Some(callback));
    }

    fn register_tools_changed_callback(&self, callback: ChangedCallback) {
        self.update_callbacks(|c| c.tools_changed = Some(callback));
    }

    fn register_prompts_changed_callback(&self, callback: ChangedCallback) {
        self.update_callbacks(|c| c.prompts_changed = Some(callback));
    }

    fn register_resources_changed_callback(&self, callback: ChangedCallback) {
        self.update_callbacks(|c| c.resources_changed = Some(callback));
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::types::Tool;

    struct Echo;

    #[async_trait]
    impl InProcessServer for Echo {
        fn server_info(&self) -> Implementation {
            Implementation {
                name: "echo".into(),
                version: "0.1.0".into(),
            }
        }

        async fn list_tools(&self) -> Result<ListToolsResult, McpError> {
            Ok(ListToolsResult {
                tools: vec![Tool {
                    name: "echo".into(),
                    description: None,
                    input_schema: serde_json::json!({"type": "object"}),
                }],
                next_cursor: None,
            })
        }

        async fn call_tool(&self, _name: &str, arguments: Value) -> Result<CallToolResult, McpError> {
            Ok(CallToolResult {
                content: vec![arguments],
                is_error: false,
            })
        }
    }

    #[tokio::test]
    async fn test_in_process_session_lifecycle() {
        let session = InProcessSession::new(Arc::new(Echo), SessionCallbacks::default());
        assert!(matches!(
            session.list_tools().await.unwrap_err(),
            McpError::InvalidState { .. }
        ));

        session.init().await.unwrap();
        let info = session.start().await.unwrap();
        assert_eq!(info.server_info.unwrap().name, "echo");

        let result = session
            .call_tool("echo", serde_json::json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(result.content[0]["x"], 1);

        session.stop().await.unwrap();
        session.stop().await.unwrap();
        assert!(session.list_tools().await.is_err());
    }

    #[tokio::test]
    async fn test_default_resources_and_prompts() {
        let session = InProcessSession::new(Arc::new(Echo), SessionCallbacks::default());
        session.init().await.unwrap();
        session.start().await.unwrap();

        assert!(session.list_resources().await.unwrap().resources.is_empty());
        assert!(session.list_prompts().await.unwrap().prompts.is_empty());
        assert!(matches!(
            session.read_resource("file:///x").await.unwrap_err(),
            McpError::ServerError { .. }
        ));
        assert!(matches!(
            session.read_prompt("p", Value::Null).await.unwrap_err(),
            McpError::ServerError { .. }
        ));
    }

    #[tokio::test]
    async fn test_start_requires_init() {
        let session = InProcessSession::new(Arc::new(Echo), SessionCallbacks::default());
        assert!(session.start().await.is_err());
    }
}
