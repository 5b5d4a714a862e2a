//! Client-side callback hooks a server can trigger.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use super::errors::McpError;
use super::types::{CreateMessageParams, CreateMessageResult, ListRootsResult};

/// Answers a server's `roots/list` request.
pub type RootsCallback =
    Arc<dyn Fn() -> BoxFuture<'static, Result<ListRootsResult, McpError>> + Send + Sync>;

/// Answers a server's `sampling/createMessage` request.
pub type SamplingCallback = Arc<
    dyn Fn(CreateMessageParams) -> BoxFuture<'static, Result<CreateMessageResult, McpError>>
        + Send
        + Sync,
>;

/// Invoked when a server announces its tool/prompt/resource list changed.
pub type ChangedCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// The full set of hooks for one session.
///
/// Passed explicitly to each session at construction; the manager keeps one
/// as the default for servers added later.
#[derive(Clone, Default)]
pub struct SessionCallbacks {
    pub roots: Option<RootsCallback>,
    pub sampling: Option<SamplingCallback>,
    pub tools_changed: Option<ChangedCallback>,
    pub prompts_changed: Option<ChangedCallback>,
    pub resources_changed: Option<ChangedCallback>,
}

impl SessionCallbacks {
    pub fn with_roots(mut self, callback: RootsCallback) -> Self {
        self.roots = Some(callback);
        self
    }

    pub fn with_sampling(mut self, callback: SamplingCallback) -> Self {
        self.sampling = Some(callback);
        self
    }

    pub fn with_tools_changed(mut self, callback: ChangedCallback) -> Self {
        self.tools_changed = Some(callback);
        self
    }

    pub fn with_prompts_changed(mut self, callback: ChangedCallback) -> Self {
        self.prompts_changed = Some(callback);
        self
    }

    pub fn with_resources_changed(mut self, callback: ChangedCallback) -> Self {
        self.resources_changed = Some(callback);
        self
    }
}

impl fmt::Debug for SessionCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCallbacks")
            .field("roots", &self.roots.is_some())
            .field("sampling", &self.sampling.is_some())
            .field("tools_changed", &self.tools_changed.is_some())
            .field("prompts_changed", &self.prompts_changed.is_some())
            .field("resources_changed", &self.resources_changed.is_some())
            .finish()
    }
}
