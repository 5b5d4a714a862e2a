//! Byte-level transports to a single MCP server.
//!
//! Every transport kind (stdio subprocess, HTTP event stream, container)
//! exposes the same `init/start/send/receive/stop` contract and the same
//! monotonic state machine:
//!
//! ```text
//! constructed → initialized → started → stopped
//! ```
//!
//! `send`/`receive` are valid only while `started`. `stop` may be called from
//! any state and is idempotent.

pub mod container;
pub mod sse;
pub mod stdio;

#[cfg(test)]
pub(crate) mod memory;

use std::fmt;

use async_trait::async_trait;
use tokio::sync::watch;

use super::errors::McpError;

pub use container::{ContainerServerParameters, ContainerTransport};
pub use sse::{SseServerParameters, SseTransport};
pub use stdio::{StdioServerParameters, StdioTransport};

// ─── State ───────────────────────────────────────────────────────────────────

/// Lifecycle state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportState {
    Constructed,
    Initialized,
    Started,
    Stopped,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constructed => write!(f, "constructed"),
            Self::Initialized => write!(f, "initialized"),
            Self::Started => write!(f, "started"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Watched, forward-only transport state shared between a transport and the
/// pump loops observing it.
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<TransportState>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(TransportState::Constructed);
        Self { tx }
    }

    /// Current state.
    pub fn get(&self) -> TransportState {
        *self.tx.borrow()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<TransportState> {
        self.tx.subscribe()
    }

    /// Atomically move `from → to`. Fails without changing anything if the
    /// current state is not `from`.
    pub fn transition(&self, from: TransportState, to: TransportState) -> Result<(), McpError> {
        let mut actual = from;
        let changed = self.tx.send_if_modified(|current| {
            if *current == from && to > from {
                *current = to;
                true
            } else {
                actual = *current;
                false
            }
        });
        if changed {
            Ok(())
        } else {
            Err(McpError::invalid_state(from, actual))
        }
    }

    /// Fail unless the current state is `expected`.
    pub fn require(&self, expected: TransportState) -> Result<(), McpError> {
        let actual = self.get();
        if actual == expected {
            Ok(())
        } else {
            Err(McpError::invalid_state(expected, actual))
        }
    }

    /// Move to `stopped` from any state. Returns `false` if already stopped.
    pub fn stop(&self) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == TransportState::Stopped {
                false
            } else {
                *current = TransportState::Stopped;
                true
            }
        })
    }
}

/// Resolve once `rx` observes any state other than `started`.
pub async fn left_started(rx: &mut watch::Receiver<TransportState>) {
    // A dropped sender means the transport itself is gone.
    let _ = rx.wait_for(|state| *state != TransportState::Started).await;
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Byte-level connection to one server.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Human-readable endpoint label (command, URL, image) for logs and errors.
    fn endpoint(&self) -> String;

    /// Current lifecycle state.
    fn state(&self) -> TransportState;

    /// Watch lifecycle state changes.
    fn subscribe(&self) -> watch::Receiver<TransportState>;

    /// Prepare without acquiring resources (resolve paths, merge env,
    /// validate references). `constructed → initialized`.
    async fn init(&self) -> Result<(), McpError>;

    /// Acquire resources (spawn, connect). `initialized → started`.
    async fn start(&self) -> Result<(), McpError>;

    /// Write one framed unit.
    async fn send(&self, message: &str) -> Result<(), McpError>;

    /// Wait for the next framed unit.
    async fn receive(&self) -> Result<String, McpError>;

    /// Release resources. Idempotent.
    async fn stop(&self) -> Result<(), McpError>;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_cell_forward_transitions() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), TransportState::Constructed);
        cell.transition(TransportState::Constructed, TransportState::Initialized)
            .unwrap();
        cell.transition(TransportState::Initialized, TransportState::Started)
            .unwrap();
        assert_eq!(cell.get(), TransportState::Started);
    }

    #[test]
    fn test_state_cell_rejects_skipped_or_backward_transition() {
        let cell = StateCell::new();
        let err = cell
            .transition(TransportState::Initialized, TransportState::Started)
            .unwrap_err();
        match err {
            McpError::InvalidState { expected, actual } => {
                assert_eq!(expected, "initialized");
                assert_eq!(actual, "constructed");
            }
            other => panic!("expected InvalidState, got {other:?}"),
        }

        cell.stop();
        assert!(cell
            .transition(TransportState::Stopped, TransportState::Started)
            .is_err());
        assert_eq!(cell.get(), TransportState::Stopped);
    }

    #[test]
    fn test_state_cell_stop_is_idempotent() {
        let cell = StateCell::new();
        assert!(cell.stop());
        assert!(!cell.stop());
        assert_eq!(cell.get(), TransportState::Stopped);
    }

    #[tokio::test]
    async fn test_left_started_wakes_on_stop() {
        let cell = StateCell::new();
        cell.transition(TransportState::Constructed, TransportState::Initialized)
            .unwrap();
        cell.transition(TransportState::Initialized, TransportState::Started)
            .unwrap();

        let mut rx = cell.subscribe();
        let waiter = tokio::spawn(async move { left_started(&mut rx).await });
        cell.stop();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }
}
