//! Server-table configuration file.
//!
//! Reads `mcp-servers.yaml` (JSON is accepted too, being valid YAML) into a
//! [`SwitchboardConfig`], interpolating `${VAR}` / `${VAR:-default}` first.
//! The manager itself never touches files; this module only produces the
//! values it is constructed with.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::mcp_client::errors::McpError;
use crate::mcp_client::lifecycle::ServerParameters;
use crate::mcp_client::manager::ManagerOptions;
use crate::mcp_client::session::SessionOptions;
use crate::mcp_client::transport::{
    ContainerServerParameters, SseServerParameters, StdioServerParameters,
};
use crate::mcp_client::types::Implementation;

/// File name searched for by [`find_config_path`].
pub const CONFIG_FILE_NAME: &str = "mcp-servers.yaml";

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "MCP_SWITCHBOARD_CONFIG";

// ─── Types ───────────────────────────────────────────────────────────────────

/// Top-level config file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SwitchboardConfig {
    #[serde(default)]
    pub client: ClientSection,
    /// Servers in registration order.
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
}

/// Client identity and handshake settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientSection {
    pub name: Option<String>,
    pub version: Option<String>,
    pub protocol_version: Option<String>,
    /// `0` disables the handshake timeout.
    pub handshake_timeout_secs: Option<u64>,
}

fn default_enabled() -> bool {
    true
}

/// One server in the table.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerEntry {
    pub name: String,
    /// Disabled entries stay in the file but are not started.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub transport: TransportConfig,
}

/// Transport kind, selected by the `transport:` key.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum TransportConfig {
    Stdio(StdioServerParameters),
    Sse(SseServerParameters),
    Container(ContainerServerParameters),
}

impl From<TransportConfig> for ServerParameters {
    fn from(config: TransportConfig) -> Self {
        match config {
            TransportConfig::Stdio(p) => ServerParameters::Stdio(p),
            TransportConfig::Sse(p) => ServerParameters::Sse(p),
            TransportConfig::Container(p) => ServerParameters::Container(p),
        }
    }
}

impl SwitchboardConfig {
    /// Session settings for a [`ClientManager`](crate::mcp_client::ClientManager).
    /// Callbacks are code, not config, and start out empty.
    pub fn manager_options(&self) -> ManagerOptions {
        let defaults = SessionOptions::default();
        let client = &self.client;

        let handshake_timeout = match client.handshake_timeout_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.handshake_timeout,
        };

        ManagerOptions {
            session: SessionOptions {
                client_info: Implementation {
                    name: client.name.clone().unwrap_or(defaults.client_info.name),
                    version: client.version.clone().unwrap_or(defaults.client_info.version),
                },
                protocol_version: client
                    .protocol_version
                    .clone()
                    .unwrap_or(defaults.protocol_version),
                handshake_timeout,
            },
            callbacks: Default::default(),
        }
    }

    /// Enabled servers as `(name, parameters)`, in file order.
    pub fn server_table(&self) -> Vec<(String, ServerParameters)> {
        self.servers
            .iter()
            .filter(|entry| {
                if !entry.enabled {
                    tracing::debug!(server = %entry.name, "server disabled in config");
                }
                entry.enabled
            })
            .map(|entry| (entry.name.clone(), entry.transport.clone().into()))
            .collect()
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// `MCP_SWITCHBOARD_CONFIG` wins if it names an existing file; otherwise
/// searches upward from `start` for `mcp-servers.yaml`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, McpError> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&explicit));
        if candidate.is_file() {
            return Ok(candidate);
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_ENV_VAR} does not name a file");
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(McpError::ConfigError {
        reason: format!("could not find {CONFIG_FILE_NAME}"),
    })
}

/// Load and parse a config file.
///
/// Relative stdio working directories are resolved against the file's
/// directory.
pub fn load_config(path: &Path) -> Result<SwitchboardConfig, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let mut config = parse_config(&raw)?;

    if let Some(base) = path.parent() {
        for entry in &mut config.servers {
            if let TransportConfig::Stdio(params) = &mut entry.transport {
                if let Some(cwd) = &params.cwd {
                    if cwd.is_relative() {
                        params.cwd = Some(base.join(cwd));
                    }
                }
            }
        }
    }

    tracing::debug!(
        path = %path.display(),
        servers = config.servers.len(),
        "loaded server config"
    );
    Ok(config)
}

/// Parse config text after env-var interpolation.
pub fn parse_config(raw: &str) -> Result<SwitchboardConfig, McpError> {
    let interpolated = interpolate_env_vars(raw);
    serde_yaml::from_str(&interpolated).map_err(|e| McpError::ConfigError {
        reason: format!("failed to parse config: {e}"),
    })
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`. Unset without default yields "".
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => {
            std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
        }
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
