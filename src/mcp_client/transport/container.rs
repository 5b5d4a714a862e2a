//! Containerized stdio transport.
//!
//! Runs the server image through the container runtime CLI
//! (`docker run -i --rm ...`, or any CLI-compatible runtime such as podman)
//! and speaks the exact same line protocol as [`StdioTransport`] over the
//! attached stdin/stdout.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::stdio::{StdioServerParameters, StdioTransport};
use super::{Transport, TransportState};
use crate::mcp_client::errors::McpError;

/// Grace period handed to `<runtime> stop` during cleanup.
const CONTAINER_STOP_GRACE_SECS: u64 = 5;

fn default_runtime() -> String {
    "docker".to_string()
}

fn default_log_stderr() -> bool {
    true
}

/// How to launch a containerized MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerServerParameters {
    /// Image reference, e.g. `mcp/time` or `ghcr.io/org/server:1.2`.
    pub image: String,
    /// Container runtime CLI.
    #[serde(default = "default_runtime")]
    pub runtime: String,
    /// Arguments passed to the image entrypoint.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment set inside the container.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory inside the container.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Extra `run` options placed before the image (volumes, network, ...).
    #[serde(default)]
    pub run_options: Vec<String>,
    #[serde(default = "default_log_stderr")]
    pub log_stderr: bool,
}

impl ContainerServerParameters {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            runtime: default_runtime(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            run_options: Vec::new(),
            log_stderr: true,
        }
    }

    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = runtime.into();
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Stdio transport to a server running inside a container.
#[derive(Debug)]
pub struct ContainerTransport {
    params: ContainerServerParameters,
    container_name: String,
    inner: StdioTransport,
}

impl ContainerTransport {
    pub fn new(params: ContainerServerParameters) -> Self {
        let container_name = format!("mcp-{}", uuid::Uuid::new_v4().simple());
        let inner = StdioTransport::new(runtime_invocation(&params, &container_name));
        Self {
            params,
            container_name,
            inner,
        }
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    /// Best-effort removal of the container once the attached client is gone.
    async fn remove_container(&self) {
        let grace = CONTAINER_STOP_GRACE_SECS.to_string();
        let result = tokio::time::timeout(
            Duration::from_secs(CONTAINER_STOP_GRACE_SECS * 2),
            tokio::process::Command::new(&self.params.runtime)
                .args(["stop", "--time", grace.as_str(), self.container_name.as_str()])
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .status(),
        )
        .await;

        match result {
            Ok(Ok(status)) => {
                tracing::debug!(container = %self.container_name, %status, "container stop issued");
            }
            Ok(Err(e)) => {
                tracing::debug!(container = %self.container_name, error = %e, "container stop failed");
            }
            Err(_) => {
                tracing::warn!(container = %self.container_name, "container stop timed out");
            }
        }
    }
}

/// Build the runtime command line for `params`.
///
/// Environment values are passed by name only (`-e KEY`) and supplied through
/// the runtime process's own environment, so they never appear in `argv`.
fn runtime_invocation(params: &ContainerServerParameters, container_name: &str) -> StdioServerParameters {
    let mut args = vec![
        "run".to_string(),
        "-i".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        container_name.to_string(),
    ];

    let mut keys: Vec<&String> = params.env.keys().collect();
    keys.sort();
    for key in keys {
        args.push("-e".to_string());
        args.push(key.clone());
    }

    if let Some(dir) = &params.cwd {
        args.push("-w".to_string());
        args.push(dir.clone());
    }

    args.extend(params.run_options.iter().cloned());
    args.push(params.image.clone());
    args.extend(params.args.iter().cloned());

    StdioServerParameters {
        command: params.runtime.clone(),
        args,
        env: params.env.clone(),
        cwd: None,
        log_stderr: params.log_stderr,
    }
}

/// Check that `image` looks like an image reference and cannot be mistaken
/// for a runtime flag.
pub fn validate_image_reference(image: &str) -> Result<(), McpError> {
    let invalid = |reason: &str| McpError::InvalidParameters {
        reason: format!("invalid image reference '{image}': {reason}"),
    };

    if image.is_empty() {
        return Err(invalid("empty"));
    }
    if image.starts_with('-') {
        return Err(invalid("must not start with '-'"));
    }
    if let Some(bad) = image
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/' | ':' | '@')))
    {
        return Err(invalid(&format!("unexpected character '{bad}'")));
    }
    if image.ends_with(':') || image.ends_with('@') || image.ends_with('/') {
        return Err(invalid("truncated tag or digest"));
    }
    Ok(())
}

#[async_trait]
impl Transport for ContainerTransport {
    fn endpoint(&self) -> String {
        format!("{}:{}", self.params.runtime, self.params.image)
    }

    fn state(&self) -> TransportState {
        self.inner.state()
    }

    fn subscribe(&self) -> watch::Receiver<TransportState> {
        self.inner.subscribe()
    }

    async fn init(&self) -> Result<(), McpError> {
        validate_image_reference(&self.params.image)?;
        if self.params.runtime.trim().is_empty() {
            return Err(McpError::InvalidParameters {
                reason: "container runtime must not be empty".into(),
            });
        }
        self.inner.init().await
    }

    async fn start(&self) -> Result<(), McpError> {
        tracing::info!(
            image = %self.params.image,
            container = %self.container_name,
            "starting container server"
        );
        self.inner.start().await
    }

    async fn send(&self, message: &str) -> Result<(), McpError> {
        self.inner.send(message).await
    }

    async fn receive(&self) -> Result<String, McpError> {
        self.inner.receive().await
    }

    async fn stop(&self) -> Result<(), McpError> {
        let was_started = self.inner.state() == TransportState::Started;
        self.inner.stop().await?;
        if was_started {
            self.remove_container().await;
        }
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
