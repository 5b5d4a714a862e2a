//! MCP Client: JSON-RPC sessions to many MCP servers behind one namespace.
//!
//! This module handles:
//! - Transports to a single server (stdio subprocess, HTTP event stream, container)
//! - The per-session message pump, request correlation and handshake
//! - Server-initiated requests (roots, sampling, ping) and change notifications
//! - Aggregating many sessions with qualified tool, prompt and resource names

pub mod adapter;
pub mod callbacks;
pub mod correlation;
pub mod errors;
pub mod lifecycle;
pub mod manager;
pub mod naming;
pub mod pump;
pub mod registry;
pub mod session;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use adapter::{InProcessServer, InProcessSession};
pub use callbacks::{ChangedCallback, RootsCallback, SamplingCallback, SessionCallbacks};
pub use errors::McpError;
pub use lifecycle::ServerParameters;
pub use manager::{ClientManager, ManagerOptions};
pub use session::{ClientSession, McpSession, SessionOptions, SessionState};
pub use transport::{
    ContainerServerParameters, SseServerParameters, StdioServerParameters, Transport,
    TransportState,
};
