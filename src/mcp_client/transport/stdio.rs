//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with an MCP server child process:
//! - Writing frames to stdin (one JSON object per line)
//! - Reading frames from stdout
//! - Passing stderr through to the host's stderr untouched
//! - Graceful termination with a bounded wait, then force-kill

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use super::{left_started, StateCell, Transport, TransportState};
use crate::mcp_client::errors::McpError;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for graceful shutdown before force-killing.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Parameters ──────────────────────────────────────────────────────────────

fn default_log_stderr() -> bool {
    true
}

/// How to launch a stdio MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StdioServerParameters {
    /// Executable name or path. Bare names are resolved against `PATH`.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment overlay, merged onto the host environment (overlay wins).
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the child. Defaults to the host's.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Forward the child's stderr to the host's stderr.
    #[serde(default = "default_log_stderr")]
    pub log_stderr: bool,
}

impl StdioServerParameters {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            log_stderr: true,
        }
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

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_log_stderr(mut self, log_stderr: bool) -> Self {
        self.log_stderr = log_stderr;
        self
    }
}

/// Launch plan produced by `init()`.
#[derive(Debug, Clone)]
struct ResolvedCommand {
    program: PathBuf,
    env: HashMap<String, String>,
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional line transport over a child process's stdio.
#[derive(Debug)]
pub struct StdioTransport {
    params: StdioServerParameters,
    shutdown_timeout: Duration,
    state: StateCell,
    resolved: StdMutex<Option<ResolvedCommand>>,
    child: Mutex<Option<Child>>,
    writer: Mutex<Option<ChildStdin>>,
    reader: Mutex<Option<BufReader<ChildStdout>>>,
    stderr_task: StdMutex<Option<JoinHandle<()>>>,
}

impl StdioTransport {
    pub fn new(params: StdioServerParameters) -> Self {
        Self {
            params,
            shutdown_timeout: SHUTDOWN_TIMEOUT,
            state: StateCell::new(),
            resolved: StdMutex::new(None),
            child: Mutex::new(None),
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            stderr_task: StdMutex::new(None),
        }
    }

    /// Override how long `stop()` waits before force-killing.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn params(&self) -> &StdioServerParameters {
        &self.params
    }

    fn transport_error(&self, reason: String) -> McpError {
        McpError::TransportError {
            endpoint: self.params.command.clone(),
            reason,
        }
    }

    fn spawn_failed(&self, reason: String) -> McpError {
        McpError::SpawnFailed {
            command: self.params.command.clone(),
            reason,
        }
    }

    async fn write_frame(&self, message: &str) -> Result<(), McpError> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| self.transport_error("stdin is not open".into()))?;

        tracing::trace!(command = %self.params.command, frame = message, "sending frame");

        writer
            .write_all(message.as_bytes())
            .await
            .map_err(|e| self.transport_error(format!("failed to write to stdin: {e}")))?;
        if !message.ends_with('\n') {
            writer
                .write_all(b"\n")
                .await
                .map_err(|e| self.transport_error(format!("failed to write to stdin: {e}")))?;
        }
        writer
            .flush()
            .await
            .map_err(|e| self.transport_error(format!("failed to flush stdin: {e}")))?;

        Ok(())
    }

    /// Ask the child to exit. On unix this is SIGTERM; elsewhere there is no
    /// graceful signal, so the child is killed outright.
    fn request_termination(child: &mut Child) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = child.id() {
                if let Ok(raw) = i32::try_from(pid) {
                    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
                        tracing::debug!(pid, error = %e, "SIGTERM not delivered");
                    }
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn endpoint(&self) -> String {
        self.params.command.clone()
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }

    fn subscribe(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }

    async fn init(&self) -> Result<(), McpError> {
        self.state.require(TransportState::Constructed)?;

        // Inherit the host environment; the overlay wins on conflict.
        let mut env: HashMap<String, String> = std::env::vars().collect();
        env.extend(self.params.env.clone());

        let program = resolve_executable(&self.params.command, env.get("PATH").map(String::as_str));

        tracing::debug!(
            command = %self.params.command,
            program = %program.display(),
            "resolved stdio server command"
        );

        *self
            .resolved
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(ResolvedCommand { program, env });

        self.state
            .transition(TransportState::Constructed, TransportState::Initialized)
    }

    async fn start(&self) -> Result<(), McpError> {
        self.state.require(TransportState::Initialized)?;

        let resolved = self
            .resolved
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
            .ok_or_else(|| McpError::invalid_state(TransportState::Initialized, self.state.get()))?;

        let mut cmd = Command::new(&resolved.program);
        cmd.args(&self.params.args);
        cmd.env_clear();
        cmd.envs(&resolved.env);
        if let Some(dir) = &self.params.cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(if self.params.log_stderr {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| self.spawn_failed(format!("{e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.spawn_failed("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.spawn_failed("failed to capture stdout".into()))?;

        if let Some(mut stderr) = child.stderr.take() {
            let handle = tokio::spawn(async move {
                let mut host = tokio::io::stderr();
                let _ = tokio::io::copy(&mut stderr, &mut host).await;
            });
            *self
                .stderr_task
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handle);
        }

        tracing::info!(
            command = %self.params.command,
            pid = child.id(),
            "spawned stdio server"
        );

        *self.writer.lock().await = Some(stdin);
        *self.reader.lock().await = Some(BufReader::new(stdout));
        *self.child.lock().await = Some(child);

        self.state
            .transition(TransportState::Initialized, TransportState::Started)
    }

    async fn send(&self, message: &str) -> Result<(), McpError> {
        self.state.require(TransportState::Started)?;

        // A child that stopped reading can block the write forever; stop()
        // must still be able to take stdin and reap it.
        let mut state = self.state.subscribe();
        tokio::select! {
            written = self.write_frame(message) => written,
            _ = left_started(&mut state) => {
                Err(self.transport_error("transport stopped during write".into()))
            }
        }
    }

    async fn receive(&self) -> Result<String, McpError> {
        self.state.require(TransportState::Started)?;

        let mut guard = self.reader.lock().await;
        let reader = guard
            .as_mut()
            .ok_or_else(|| self.transport_error("stdout is not open".into()))?;

        let mut line = String::new();
        let bytes_read = reader
            .read_line(&mut line)
            .await
            .map_err(|e| self.transport_error(format!("failed to read from stdout: {e}")))?;

        if bytes_read == 0 {
            return Err(self.transport_error(
                "server stdout closed (process may have exited)".into(),
            ));
        }

        tracing::trace!(command = %self.params.command, frame = %line.trim_end(), "received frame");
        Ok(line)
    }

    async fn stop(&self) -> Result<(), McpError> {
        if !self.state.stop() {
            return Ok(());
        }

        // Closing stdin is the first hint most servers get.
        self.writer.lock().await.take();

        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        Self::request_termination(&mut child);

        match tokio::time::timeout(self.shutdown_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(command = %self.params.command, %status, "stdio server exited");
            }
            Ok(Err(e)) => {
                tracing::debug!(command = %self.params.command, error = %e, "wait on stdio server failed");
            }
            Err(_) => {
                tracing::warn!(
                    command = %self.params.command,
                    timeout_ms = self.shutdown_timeout.as_millis() as u64,
                    "stdio server ignored termination, killing"
                );
                // An already-exited process is not an error.
                let _ = child.kill().await;
            }
        }

        Ok(())
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        if let Some(handle) = self
            .stderr_task
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

// ─── Executable Resolution ───────────────────────────────────────────────────

/// Resolve a bare command name against `path_var`, like `which`.
///
/// Names containing a path separator are returned unchanged; unresolved names
/// are returned unchanged so the spawn error names what the user typed.
pub fn resolve_executable(command: &str, path_var: Option<&str>) -> PathBuf {
    let as_path = Path::new(command);
    if as_path.components().count() > 1 || command.is_empty() {
        return as_path.to_path_buf();
    }

    let Some(path_var) = path_var else {
        return as_path.to_path_buf();
    };

    for dir in std::env::split_paths(path_var) {
        let candidate = dir.join(command);
        if is_executable(&candidate) {
            return candidate;
        }
        #[cfg(windows)]
        for ext in ["exe", "cmd", "bat"] {
            let candidate = dir.join(format!("{command}.{ext}"));
            if candidate.is_file() {
                return candidate;
            }
        }
    }

    as_path.to_path_buf()
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
