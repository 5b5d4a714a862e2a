//! Session construction, startup and shutdown.
//!
//! Maps each kind of server parameters onto the session that drives it and
//! runs the init → start sequence, for one server or many in parallel.

use std::fmt;
use std::sync::Arc;

use futures::future::join_all;

use super::adapter::{InProcessServer, InProcessSession};
use super::callbacks::SessionCallbacks;
use super::errors::McpError;
use super::session::{ClientSession, McpSession, SessionOptions};
use super::transport::{
    ContainerServerParameters, ContainerTransport, SseServerParameters, SseTransport,
    StdioServerParameters, StdioTransport, Transport,
};
use super::types::InitializeResult;

// ─── ServerParameters ────────────────────────────────────────────────────────

/// How to reach one server. The variant picks the session and transport.
#[derive(Clone)]
pub enum ServerParameters {
    /// Local subprocess speaking line-delimited JSON-RPC on stdio.
    Stdio(StdioServerParameters),
    /// Remote server over an HTTP event stream.
    Sse(SseServerParameters),
    /// Subprocess inside a container.
    Container(ContainerServerParameters),
    /// Server object in this process.
    InProcess(Arc<dyn InProcessServer>),
    /// Any caller-provided session.
    Session(Arc<dyn McpSession>),
}

impl fmt::Debug for ServerParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdio(p) => f.debug_tuple("Stdio").field(p).finish(),
            Self::Sse(p) => f.debug_tuple("Sse").field(p).finish(),
            Self::Container(p) => f.debug_tuple("Container").field(p).finish(),
            Self::InProcess(server) => f
                .debug_tuple("InProcess")
                .field(&server.server_info().name)
                .finish(),
            Self::Session(_) => f.write_str("Session(..)"),
        }
    }
}

impl From<StdioServerParameters> for ServerParameters {
    fn from(params: StdioServerParameters) -> Self {
        Self::Stdio(params)
    }
}

impl From<SseServerParameters> for ServerParameters {
    fn from(params: SseServerParameters) -> Self {
        Self::Sse(params)
    }
}

impl From<ContainerServerParameters> for ServerParameters {
    fn from(params: ContainerServerParameters) -> Self {
        Self::Container(params)
    }
}

// ─── Construction ────────────────────────────────────────────────────────────

/// Build (but do not start) the session for `params`.
pub fn make_session(
    name: &str,
    params: ServerParameters,
    options: &SessionOptions,
    callbacks: &SessionCallbacks,
) -> Arc<dyn McpSession> {
    let over = |transport: Arc<dyn Transport>| -> Arc<dyn McpSession> {
        Arc::new(ClientSession::new(
            name,
            transport,
            options.clone(),
            callbacks.clone(),
        ))
    };

    match params {
        ServerParameters::Stdio(p) => over(Arc::new(StdioTransport::new(p))),
        ServerParameters::Sse(p) => over(Arc::new(SseTransport::new(p))),
        ServerParameters::Container(p) => over(Arc::new(ContainerTransport::new(p))),
        ServerParameters::InProcess(server) => {
            Arc::new(InProcessSession::new(server, callbacks.clone()))
        }
        ServerParameters::Session(session) => {
            apply_callbacks(session.as_ref(), callbacks);
            session
        }
    }
}

/// Register every hook present in `callbacks` on `session`.
pub fn apply_callbacks(session: &dyn McpSession, callbacks: &SessionCallbacks) {
    if let Some(cb) = &callbacks.roots {
        session.register_roots_callback(Arc::clone(cb));
    }
    if let Some(cb) = &callbacks.sampling {
        session.register_sampling_callback(Arc::clone(cb));
    }
    if let Some(cb) = &callbacks.tools_changed {
        session.register_tools_changed_callback(Arc::clone(cb));
    }
    if let Some(cb) = &callbacks.prompts_changed {
        session.register_prompts_changed_callback(Arc::clone(cb));
    }
    if let Some(cb) = &callbacks.resources_changed {
        session.register_resources_changed_callback(Arc::clone(cb));
    }
}

// ─── Startup ─────────────────────────────────────────────────────────────────

/// `init` then `start` one session. On failure the session is stopped so
/// nothing it acquired is left running.
pub async fn start_session(
    name: &str,
    session: &dyn McpSession,
) -> Result<InitializeResult, McpError> {
    let started = async {
        session.init().await?;
        session.start().await
    }
    .await;

    match started {
        Ok(result) => {
            tracing::info!(
                server = %name,
                peer = result.server_info.as_ref().map(|i| i.name.as_str()).unwrap_or("unknown"),
                "server started"
            );
            Ok(result)
        }
        Err(e) => {
            tracing::warn!(server = %name, error = %e, "server failed to start");
            if let Err(stop_err) = session.stop().await {
                tracing::debug!(server = %name, error = %stop_err, "cleanup after failed start");
            }
            Err(e)
        }
    }
}

/// Start sessions concurrently.
///
/// Returns the started sessions in input order plus the failures. Partial
/// startup is acceptable; the caller decides what to do with failures.
pub async fn start_all(
    sessions: Vec<(String, Arc<dyn McpSession>)>,
) -> (Vec<(String, Arc<dyn McpSession>)>, Vec<(String, McpError)>) {
    let handles: Vec<_> = sessions
        .into_iter()
        .map(|(name, session)| {
            let task_name = name.clone();
            let task_session = Arc::clone(&session);
            let handle = tokio::spawn(async move {
                start_session(&task_name, task_session.as_ref()).await
            });
            (name, session, handle)
        })
        .collect();

    let mut started = Vec::new();
    let mut errors = Vec::new();
    for (name, session, handle) in handles {
        match handle.await {
            Ok(Ok(_)) => started.push((name, session)),
            Ok(Err(e)) => errors.push((name, e)),
            Err(e) => {
                errors.push((
                    name.clone(),
                    McpError::InitFailed {
                        name,
                        reason: format!("join error: {e}"),
                    },
                ));
            }
        }
    }

    (started, errors)
}

/// Stop sessions concurrently. Errors are logged, never returned.
pub async fn shutdown_all(sessions: Vec<(String, Arc<dyn McpSession>)>) {
    let stops = sessions.iter().map(|(name, session)| async move {
        if let Err(e) = session.stop().await {
            tracing::warn!(server = %name, error = %e, "error while stopping server");
        }
    });
    join_all(stops).await;
}

// ─── Tests ───────────────────────────────────────────────────────────────────
