//! The reference remote.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{HandlerContext, RequestHandler};
use std::sync::Arc;
use studysync_protocol::{
    ApplyRequest, ApplyResponse, ChangeId, EntityKey, Payload, RemoteEntity, Timestamp, Version,
};
use tracing::debug;

/// In-memory remote implementing the reconciliation contract.
///
/// Entities carry a version that every write bumps, plus a bounded history
/// of which fields each version wrote, so fetches can report what changed
/// since a client's base version. Replays are deduplicated by change id.
///
/// Cloning is cheap and every clone shares the same state, which lets a
/// test drive the remote directly (as another device) while the engine
/// talks to it through a client.
///
/// # Example
///
/// ```
/// use studysync_protocol::{ApplyRequest, Change, EntityKey, Payload};
/// use studysync_server::{ReferenceRemote, ServerConfig};
///
/// let remote = ReferenceRemote::new(ServerConfig::default());
/// let change = Change::create(EntityKey::new("note", "n1"), Payload::new(), "user-1");
///
/// let response = remote.handle_apply(ApplyRequest::from(&change)).unwrap();
/// assert!(response.is_applied());
/// ```
#[derive(Debug, Clone)]
pub struct ReferenceRemote {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
}

impl ReferenceRemote {
    /// Creates an empty remote.
    pub fn new(config: ServerConfig) -> Self {
        let context = Arc::new(HandlerContext::new(config));
        let handler = RequestHandler::new(Arc::clone(&context));

        Self { handler, context }
    }

    /// Applies one change.
    pub fn handle_apply(&self, request: ApplyRequest) -> ServerResult<ApplyResponse> {
        self.handler.handle_apply(request)
    }

    /// Returns the current copy of an entity.
    pub fn handle_fetch(
        &self,
        key: &EntityKey,
        since: Option<Version>,
    ) -> ServerResult<RemoteEntity> {
        self.handler.handle_fetch(key, since)
    }

    /// Writes fields as another device would, creating the entity if needed.
    pub fn remote_edit(&self, key: &EntityKey, patch: Payload) -> Version {
        let mut state = self.context.state.write();
        let now = Timestamp::now();
        let version = match state.entities.update(key, patch.clone(), now) {
            Some(version) => version,
            None => state.entities.create(key, patch, now),
        };
        debug!(entity = %key, version = version.0, "remote edit");
        version
    }

    /// Deletes an entity as another device would.
    pub fn remote_delete(&self, key: &EntityKey) -> ServerResult<Version> {
        let mut state = self.context.state.write();
        let version = state
            .entities
            .delete(key, Timestamp::now())
            .ok_or_else(|| ServerError::NotFound(key.clone()))?;
        debug!(entity = %key, version = version.0, "remote delete");
        Ok(version)
    }

    /// Returns the current copy of an entity, or `None` if it never existed.
    pub fn entity(&self, key: &EntityKey) -> Option<RemoteEntity> {
        self.context.state.read().entities.view(key, None)
    }

    /// Returns the number of live entities.
    pub fn entity_count(&self) -> usize {
        self.context.state.read().entities.live_count()
    }

    /// Returns the ids of changes written to `key`, in write order.
    pub fn applied_changes(&self, key: &EntityKey) -> Vec<ChangeId> {
        self.context.applied_changes(key)
    }

    /// Returns how many apply calls were answered from the outcome cache.
    pub fn replay_count(&self) -> u64 {
        self.context.replay_count()
    }

    /// Returns the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.context.config
    }
}

impl Default for ReferenceRemote {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}
