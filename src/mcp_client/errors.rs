//! MCP Client error types.

use thiserror::Error;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// A server name is empty or contains characters that cannot appear in
    /// a qualified identifier.
    #[error("invalid server name '{name}': {reason}")]
    InvalidServerName {
        name: String,
        reason: String,
    },

    /// A server with the same normalized name is already registered.
    #[error("server '{name}' is already registered")]
    DuplicateServer {
        name: String,
    },

    /// No server is registered under this name.
    #[error("unknown server: '{name}'")]
    UnknownServer {
        name: String,
    },

    /// A qualified tool/prompt name or resource URI could not be split.
    #[error("malformed qualified identifier '{identifier}': {reason}")]
    InvalidQualifiedName {
        identifier: String,
        reason: String,
    },

    /// Transport or session construction parameters are invalid.
    #[error("invalid parameters: {reason}")]
    InvalidParameters {
        reason: String,
    },

    /// Configuration error (missing or malformed config file).
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },

    /// A server process (or container, or stream) failed to start.
    #[error("failed to spawn '{command}': {reason}")]
    SpawnFailed {
        command: String,
        reason: String,
    },

    /// I/O failure on an established transport (write failed, stream closed).
    #[error("transport error for '{endpoint}': {reason}")]
    TransportError {
        endpoint: String,
        reason: String,
    },

    /// An operation was attempted in the wrong lifecycle state.
    #[error("invalid state: expected {expected}, found {actual}")]
    InvalidState {
        expected: String,
        actual: String,
    },

    /// The initialization handshake failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed {
        name: String,
        reason: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A frame could not be parsed or a payload had an unexpected shape.
    #[error("protocol error: {reason}")]
    ProtocolError {
        reason: String,
    },

    /// A caller-supplied request id is already pending.
    #[error("request id {id} is already pending")]
    DuplicateRequestId {
        id: String,
    },

    /// The session stopped (or its transport died) before a reply arrived.
    #[error("session '{name}' closed")]
    SessionClosed {
        name: String,
    },

    /// One or more servers failed to start during a batch start.
    #[error("{} server(s) failed to start: {}", failures.len(), summarize(failures))]
    StartupFailed {
        failures: Vec<(String, McpError)>,
    },
}

impl McpError {
    /// Whether this error belongs to the configuration class: raised
    /// synchronously, registry left untouched.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            McpError::InvalidServerName { .. }
                | McpError::DuplicateServer { .. }
                | McpError::UnknownServer { .. }
                | McpError::InvalidQualifiedName { .. }
                | McpError::InvalidParameters { .. }
                | McpError::ConfigError { .. }
        )
    }

    pub(crate) fn invalid_state(expected: impl ToString, actual: impl ToString) -> Self {
        McpError::InvalidState {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

fn summarize(failures: &[(String, McpError)]) -> String {
    failures
        .iter()
        .map(|(name, err)| format!("{name}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}
