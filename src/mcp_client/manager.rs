//! Multi-server manager.
//!
//! Owns every session under a canonical server name and exposes their tools,
//! prompts and resources as one namespace:
//!
//! - tools/prompts: `<server>.<name>`
//! - resources: `mcp-<server>+<original-uri>` (web URLs pass through)
//!
//! Calls addressed with a qualified identifier are routed back to the owning
//! session with the original name or URI.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures::future::join_all;
use serde_json::Value;

use super::callbacks::{ChangedCallback, RootsCallback, SamplingCallback, SessionCallbacks};
use super::errors::McpError;
use super::lifecycle::{self, ServerParameters};
use super::naming;
use super::registry::ServerRegistry;
use super::session::{McpSession, SessionOptions};
use super::types::{CallToolResult, GetPromptResult, Prompt, ReadResourceResult, Resource, Tool};

/// Construction-time configuration for a [`ClientManager`].
#[derive(Debug, Clone, Default)]
pub struct ManagerOptions {
    /// Handshake settings shared by every session.
    pub session: SessionOptions,
    /// Hooks installed on every session the manager creates.
    pub callbacks: SessionCallbacks,
}

/// Aggregates many MCP sessions behind one qualified namespace.
pub struct ClientManager {
    options: SessionOptions,
    /// Hooks for sessions created from now on.
    defaults: Mutex<SessionCallbacks>,
    registry: RwLock<ServerRegistry>,
}

impl std::fmt::Debug for ClientManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientManager")
            .field("servers", &self.list_servers())
            .finish()
    }
}

impl Default for ClientManager {
    fn default() -> Self {
        Self::new(ManagerOptions::default())
    }
}

impl ClientManager {
    pub fn new(options: ManagerOptions) -> Self {
        Self {
            options: options.session,
            defaults: Mutex::new(options.callbacks),
            registry: RwLock::new(ServerRegistry::new()),
        }
    }

    // ─── Registry Access ─────────────────────────────────────────────────

    fn read_registry(&self) -> std::sync::RwLockReadGuard<'_, ServerRegistry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_registry(&self) -> std::sync::RwLockWriteGuard<'_, ServerRegistry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn default_callbacks(&self) -> SessionCallbacks {
        self.defaults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn session(&self, server: &str) -> Result<Arc<dyn McpSession>, McpError> {
        self.read_registry().require(server)
    }

    /// Registered server names in insertion order.
    pub fn list_servers(&self) -> Vec<String> {
        self.read_registry().names()
    }

    /// Session registered under `name` (any spelling that normalizes to it).
    pub fn get_session(&self, name: &str) -> Option<Arc<dyn McpSession>> {
        self.read_registry().get(&naming::format_server_name(name))
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Start every server in `servers` in parallel and register the ones
    /// that come up.
    ///
    /// Name problems (invalid, duplicated within the table, or already
    /// registered) are reported before anything is started. If some servers
    /// fail to start the rest stay registered and the failures are returned
    /// together as [`McpError::StartupFailed`].
    pub async fn init(&self, servers: Vec<(String, ServerParameters)>) -> Result<(), McpError> {
        let mut seen = HashSet::new();
        let mut normalized = Vec::with_capacity(servers.len());
        {
            let registry = self.read_registry();
            for (raw, params) in servers {
                let name = naming::normalize_server_name(&raw)?;
                if registry.contains(&name) || !seen.insert(name.clone()) {
                    return Err(McpError::DuplicateServer { name });
                }
                normalized.push((name, params));
            }
        }

        let callbacks = self.default_callbacks();
        let sessions: Vec<_> = normalized
            .into_iter()
            .map(|(name, params)| {
                let session = lifecycle::make_session(&name, params, &self.options, &callbacks);
                (name, session)
            })
            .collect();

        tracing::info!(count = sessions.len(), "starting servers");
        let (started, mut failures) = lifecycle::start_all(sessions).await;

        let mut orphans = Vec::new();
        {
            let mut registry = self.write_registry();
            for (name, session) in started {
                // A concurrent add_server may have claimed the name meanwhile.
                if let Err(e) = registry.insert(&name, Arc::clone(&session)) {
                    orphans.push((name.clone(), session));
                    failures.push((name, e));
                }
            }
        }
        lifecycle::shutdown_all(orphans).await;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(McpError::StartupFailed { failures })
        }
    }

    /// Start one more server and register it under `name`.
    pub async fn add_server(&self, name: &str, params: ServerParameters) -> Result<(), McpError> {
        let name = naming::normalize_server_name(name)?;
        if self.read_registry().contains(&name) {
            return Err(McpError::DuplicateServer { name });
        }

        let session =
            lifecycle::make_session(&name, params, &self.options, &self.default_callbacks());
        lifecycle::start_session(&name, session.as_ref()).await?;

        let inserted = self.write_registry().insert(&name, Arc::clone(&session));
        if let Err(e) = inserted {
            if let Err(stop_err) = session.stop().await {
                tracing::debug!(server = %name, error = %stop_err, "stopping rejected duplicate");
            }
            return Err(e);
        }
        tracing::info!(server = %name, "server added");
        Ok(())
    }

    /// Stop the server registered under `name`, then unregister it.
    pub async fn remove_server(&self, name: &str) -> Result<(), McpError> {
        let name = naming::format_server_name(name);
        let session = self.session(&name)?;

        if let Err(e) = session.stop().await {
            tracing::warn!(server = %name, error = %e, "error while stopping server");
        }
        // The name may have been removed and re-added while stop() ran.
        if self.write_registry().remove_if(&name, &session) {
            tracing::info!(server = %name, "server removed");
        } else {
            tracing::debug!(server = %name, "server already replaced or removed");
        }
        Ok(())
    }

    /// Stop every server and empty the registry.
    pub async fn shutdown(&self) {
        let sessions = self.write_registry().drain();
        tracing::info!(count = sessions.len(), "shutting down servers");
        lifecycle::shutdown_all(sessions).await;
    }

    // ─── Aggregated Listings ─────────────────────────────────────────────

    /// Every server's tools, names qualified, in registry order.
    ///
    /// Servers that fail to answer are logged and skipped.
    pub async fn list_tools(&self) -> Vec<Tool> {
        let sessions = self.read_registry().snapshot();
        let results = join_all(sessions.iter().map(|(_, s)| s.list_tools())).await;

        let mut tools = Vec::new();
        for ((server, _), result) in sessions.iter().zip(results) {
            match result {
                Ok(list) => tools.extend(list.tools.into_iter().map(|mut tool| {
                    tool.name = naming::qualify_name(server, &tool.name);
                    tool
                })),
                Err(e) => tracing::warn!(server = %server, error = %e, "list_tools failed"),
            }
        }
        tools
    }

    /// Every server's prompts, names qualified, in registry order.
    pub async fn list_prompts(&self) -> Vec<Prompt> {
        let sessions = self.read_registry().snapshot();
        let results = join_all(sessions.iter().map(|(_, s)| s.list_prompts())).await;

        let mut prompts = Vec::new();
        for ((server, _), result) in sessions.iter().zip(results) {
            match result {
                Ok(list) => prompts.extend(list.prompts.into_iter().map(|mut prompt| {
                    prompt.name = naming::qualify_name(server, &prompt.name);
                    prompt
                })),
                Err(e) => tracing::warn!(server = %server, error = %e, "list_prompts failed"),
            }
        }
        prompts
    }

    /// Every server's resources, URIs qualified, in registry order.
    pub async fn list_resources(&self) -> Vec<Resource> {
        let sessions = self.read_registry().snapshot();
        let results = join_all(sessions.iter().map(|(_, s)| s.list_resources())).await;

        let mut resources = Vec::new();
        for ((server, _), result) in sessions.iter().zip(results) {
            let list = match result {
                Ok(list) => list,
                Err(e) => {
                    tracing::warn!(server = %server, error = %e, "list_resources failed");
                    continue;
                }
            };
            for mut resource in list.resources {
                match naming::qualify_uri(server, &resource.uri) {
                    Ok(uri) => {
                        resource.uri = uri;
                        resources.push(resource);
                    }
                    Err(e) => {
                        tracing::warn!(server = %server, error = %e, "skipping resource");
                    }
                }
            }
        }
        resources
    }

    // ─── Routed Calls ────────────────────────────────────────────────────

    /// Call `<server>.<tool>`.
    pub async fn call_tool(
        &self,
        qualified_name: &str,
        arguments: Value,
    ) -> Result<CallToolResult, McpError> {
        let (server, tool) = naming::split_qualified_name(qualified_name)?;
        let server = naming::format_server_name(server);
        let session = self.session(&server)?;
        tracing::debug!(server = %server, tool = %tool, "routing tool call");
        session.call_tool(tool, arguments).await
    }

    /// Fetch `<server>.<prompt>`.
    pub async fn read_prompt(
        &self,
        qualified_name: &str,
        arguments: Value,
    ) -> Result<GetPromptResult, McpError> {
        let (server, prompt) = naming::split_qualified_name(qualified_name)?;
        let session = self.session(&naming::format_server_name(server))?;
        session.read_prompt(prompt, arguments).await
    }

    /// Read `mcp-<server>+<original-uri>` from its server.
    pub async fn read_resource(&self, qualified_uri: &str) -> Result<ReadResourceResult, McpError> {
        let (server, uri) = naming::unqualify_uri(qualified_uri)?;
        let session = self.session(&server)?;
        tracing::debug!(server = %server, uri = %uri, "routing resource read");
        session.read_resource(&uri).await
    }

    // ─── Callback Broadcast ──────────────────────────────────────────────

    fn broadcast(
        &self,
        update_default: impl FnOnce(&mut SessionCallbacks),
        register: impl Fn(&dyn McpSession),
    ) {
        update_default(&mut self.defaults.lock().unwrap_or_else(PoisonError::into_inner));
        let sessions = self.read_registry().snapshot();
        for (_, session) in sessions {
            register(session.as_ref());
        }
    }

    pub fn register_roots_callback(&self, callback: RootsCallback) {
        let for_default = Arc::clone(&callback);
        self.broadcast(
            |d| d.roots = Some(for_default),
            |s| s.register_roots_callback(Arc::clone(&callback)),
        );
    }

    pub fn register_sampling_callback(&self, callback: SamplingCallback) {
        let for_default = Arc::clone(&callback);
        self.broadcast(
            |d| d.sampling = Some(for_default),
            |s| s.register_sampling_callback(Arc::clone(&callback)),
        );
    }

    pub fn register_tools_changed_callback(&self, callback: ChangedCallback) {
        let for_default = Arc::clone(&callback);
        self.broadcast(
            |d| d.tools_changed = Some(for_default),
            |s| s.register_tools_changed_callback(Arc::clone(&callback)),
        );
    }

    pub fn register_prompts_changed_callback(&self, callback: ChangedCallback) {
        let for_default = Arc::clone(&callback);
        self.broadcast(
            |d| d.prompts_changed = Some(for_default),
            |s| s.register_prompts_changed_callback(Arc::clone(&callback)),
        );
    }

    pub fn register_resources_changed_callback(&self, callback: ChangedCallback) {
        let for_default = Arc::clone(&callback);
        self.broadcast(
            |d| d.resources_changed = Some(for_default),
            |s| s.register_resources_changed_callback(Arc::clone(&callback)),
        );
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
