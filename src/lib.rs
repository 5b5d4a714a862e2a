//! Client-side engine for the Model Context Protocol.
//!
//! Connects one controller to many MCP servers, each reached over its own
//! transport, and presents their tools, prompts and resources under a single
//! collision-free namespace.
//!
//! ```no_run
//! use mcp_switchboard::config;
//! use mcp_switchboard::mcp_client::ClientManager;
//!
//! # async fn run() -> Result<(), mcp_switchboard::McpError> {
//! let path = config::find_config_path(&std::env::current_dir().unwrap_or_default())?;
//! let cfg = config::load_config(&path)?;
//!
//! let manager = ClientManager::new(cfg.manager_options());
//! manager.init(cfg.server_table()).await?;
//! for tool in manager.list_tools().await {
//!     println!("{}", tool.name);
//! }
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod logging;
pub mod mcp_client;

pub use mcp_client::{ClientManager, McpError, McpSession, ServerParameters};
