//! Server registry: canonical server name → session, in insertion order.

use std::sync::Arc;

use super::errors::McpError;
use super::session::McpSession;

/// Named collection of running sessions.
///
/// Iteration order is insertion order; aggregated listings follow it.
#[derive(Default)]
pub struct ServerRegistry {
    entries: Vec<(String, Arc<dyn McpSession>)>,
}

impl std::fmt::Debug for ServerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRegistry")
            .field("servers", &self.names())
            .finish()
    }
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session. Fails without modifying the registry if `name` is taken.
    pub fn insert(&mut self, name: &str, session: Arc<dyn McpSession>) -> Result<(), McpError> {
        if self.contains(name) {
            return Err(McpError::DuplicateServer {
                name: name.to_string(),
            });
        }
        self.entries.push((name.to_string(), session));
        Ok(())
    }

    /// Remove and return the session registered under `name`.
    pub fn remove(&mut self, name: &str) -> Option<Arc<dyn McpSession>> {
        let index = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(index).1)
    }

    /// Remove `name` only if it still maps to `session`. Returns whether an
    /// entry was removed.
    pub fn remove_if(&mut self, name: &str, session: &Arc<dyn McpSession>) -> bool {
        let Some(index) = self
            .entries
            .iter()
            .position(|(n, s)| n == name && Arc::ptr_eq(s, session))
        else {
            return false;
        };
        self.entries.remove(index);
        true
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn McpSession>> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, session)| Arc::clone(session))
    }

    /// Like [`get`](Self::get), but an absent name is an `UnknownServer` error.
    pub fn require(&self, name: &str) -> Result<Arc<dyn McpSession>, McpError> {
        self.get(name).ok_or_else(|| McpError::UnknownServer {
            name: name.to_string(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    /// Registered names, in insertion order.
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(n, _)| n.clone()).collect()
    }

    /// Cheap copy of every entry, so callers can await without holding a lock.
    pub fn snapshot(&self) -> Vec<(String, Arc<dyn McpSession>)> {
        self.entries
            .iter()
            .map(|(n, s)| (n.clone(), Arc::clone(s)))
            .collect()
    }

    /// Remove every entry, returning them in insertion order.
    pub fn drain(&mut self) -> Vec<(String, Arc<dyn McpSession>)> {
        std::mem::take(&mut self.entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::adapter::{InProcessServer, InProcessSession};
    use crate::mcp_client::callbacks::SessionCallbacks;
    use crate::mcp_client::types::{CallToolResult, Implementation, ListToolsResult};

    struct Nothing;

    #[async_trait::async_trait]
    impl InProcessServer for Nothing {
        fn server_info(&self) -> Implementation {
            Implementation {
                name: "nothing".into(),
                version: "0".into(),
            }
        }

        async fn list_tools(&self) -> Result<ListToolsResult, McpError> {
            Ok(ListToolsResult::default())
        }

        async fn call_tool(
            &self,
            _name: &str,
            _arguments: serde_json::Value,
        ) -> Result<CallToolResult, McpError> {
            Ok(CallToolResult::default())
        }
    }

    fn session() -> Arc<dyn McpSession> {
        Arc::new(InProcessSession::new(Arc::new(Nothing), SessionCallbacks::default()))
    }

    #[test]
    fn test_insert_preserves_order() {
        let mut registry = ServerRegistry::new();
        registry.insert("searxng", session()).unwrap();
        registry.insert("timeserver", session()).unwrap();
        registry.insert("alpha", session()).unwrap();
        assert_eq!(registry.names(), vec!["searxng", "timeserver", "alpha"]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_duplicate_insert_keeps_first() {
        let mut registry = ServerRegistry::new();
        let first = session();
        registry.insert("timeserver", Arc::clone(&first)).unwrap();
        let err = registry.insert("timeserver", session()).unwrap_err();
        assert!(matches!(err, McpError::DuplicateServer { .. }));
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get("timeserver").unwrap(), &first));
    }

    #[test]
    fn test_remove_and_require() {
        let mut registry = ServerRegistry::new();
        registry.insert("a", session()).unwrap();
        registry.insert("b", session()).unwrap();

        assert!(registry.remove("a").is_some());
        assert!(registry.remove("a").is_none());
        assert!(matches!(
            registry.require("a"),
            Err(McpError::UnknownServer { .. })
        ));
        assert!(registry.require("b").is_ok());
        assert_eq!(registry.names(), vec!["b"]);

        let drained = registry.drain();
        assert_eq!(drained.len(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_if_ignores_replaced_entry() {
        let mut registry = ServerRegistry::new();
        let old = session();
        let new = session();
        registry.insert("x", Arc::clone(&new)).unwrap();

        assert!(!registry.remove_if("x", &old));
        assert!(Arc::ptr_eq(&registry.get("x").unwrap(), &new));

        assert!(registry.remove_if("x", &new));
        assert!(registry.is_empty());
    }
}
