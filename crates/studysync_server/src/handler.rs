//! Request handlers for the remote contract.

use crate::config::ServerConfig;
use crate::entities::EntityTable;
use crate::error::{ServerError, ServerResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use studysync_protocol::{
    ApplyRequest, ApplyResponse, ChangeId, ChangeKind, EntityKey, Payload, RemoteEntity,
    Timestamp, Version,
};
use tracing::{debug, info};

/// Mutable server state, guarded by one lock so the dedupe check and the
/// write it protects happen atomically.
#[derive(Debug)]
pub(crate) struct ServerState {
    pub(crate) entities: EntityTable,
    /// Terminal outcomes by change id. Conflicts are not cached: a change
    /// is resent under the same id after it has been rebased.
    outcomes: HashMap<ChangeId, ApplyResponse>,
    /// Ids of changes that wrote to each entity, in write order.
    applied: HashMap<EntityKey, Vec<ChangeId>>,
    /// Apply calls served from the outcome cache.
    replays: u64,
}

/// Context for request handling.
#[derive(Debug)]
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    pub(crate) state: RwLock<ServerState>,
}

impl HandlerContext {
    /// Creates a new handler context.
    pub fn new(config: ServerConfig) -> Self {
        let state = ServerState {
            entities: EntityTable::new(config.history_limit),
            outcomes: HashMap::new(),
            applied: HashMap::new(),
            replays: 0,
        };
        Self {
            config,
            state: RwLock::new(state),
        }
    }

    /// Returns the ids of changes written to `key`, in write order.
    pub fn applied_changes(&self, key: &EntityKey) -> Vec<ChangeId> {
        self.state
            .read()
            .applied
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns how many apply calls were answered from the outcome cache.
    pub fn replay_count(&self) -> u64 {
        self.state.read().replays
    }
}

/// Handler for remote requests.
#[derive(Debug, Clone)]
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Handles an apply request.
    ///
    /// Replays of a change id that already reached a terminal outcome
    /// return that outcome without touching the entity.
    pub fn handle_apply(&self, request: ApplyRequest) -> ServerResult<ApplyResponse> {
        validate(&request)?;

        let mut state = self.context.state.write();
        if let Some(outcome) = state.outcomes.get(&request.id).cloned() {
            state.replays += 1;
            info!(change_id = %request.id, entity = %request.key, "replayed change");
            return Ok(outcome);
        }

        let response = match self.refusal(&request) {
            Some(reason) => ApplyResponse::rejected(reason),
            None => apply(&mut state, &request),
        };

        match &response {
            ApplyResponse::Applied { new_version } => {
                debug!(
                    change_id = %request.id,
                    entity = %request.key,
                    version = new_version.0,
                    "change applied"
                );
                state.outcomes.insert(request.id, response.clone());
            }
            ApplyResponse::Rejected { reason } => {
                info!(change_id = %request.id, entity = %request.key, %reason, "change rejected");
                state.outcomes.insert(request.id, response.clone());
            }
            ApplyResponse::Conflict { remote_version, .. } => {
                debug!(
                    change_id = %request.id,
                    entity = %request.key,
                    base = ?request.base_version,
                    remote = remote_version.0,
                    "version conflict"
                );
            }
        }

        Ok(response)
    }

    /// Handles a fetch of the current remote copy.
    ///
    /// An entity the remote has never seen is reported as a deleted
    /// entity at version 0.
    pub fn handle_fetch(
        &self,
        key: &EntityKey,
        since: Option<Version>,
    ) -> ServerResult<RemoteEntity> {
        let state = self.context.state.read();
        Ok(state
            .entities
            .view(key, since)
            .unwrap_or_else(|| RemoteEntity {
                key: key.clone(),
                version: Version(0),
                payload: Payload::new(),
                updated_at: None,
                deleted: true,
                changed_since: None,
            }))
    }

    fn refusal(&self, request: &ApplyRequest) -> Option<String> {
        let config = &self.context.config;
        if config.is_read_only(&request.key.entity_type) {
            return Some(format!(
                "entity type '{}' is read-only",
                request.key.entity_type
            ));
        }
        if request.payload.len() > config.max_payload_fields {
            return Some(format!(
                "payload writes {} fields, limit is {}",
                request.payload.len(),
                config.max_payload_fields
            ));
        }
        None
    }
}

fn validate(request: &ApplyRequest) -> ServerResult<()> {
    if request.key.entity_type.is_empty() || request.key.entity_id.is_empty() {
        return Err(ServerError::InvalidRequest(
            "entity type and id must not be empty".into(),
        ));
    }
    let base_ok = match request.kind {
        ChangeKind::Create => request.base_version.is_none(),
        ChangeKind::Update | ChangeKind::Delete => request.base_version.is_some(),
    };
    if !base_ok {
        return Err(ServerError::InvalidBaseVersion {
            kind: request.kind,
            key: request.key.clone(),
        });
    }
    if request.kind == ChangeKind::Delete && !request.payload.is_empty() {
        return Err(ServerError::InvalidRequest(format!(
            "delete of {} carries a payload",
            request.key
        )));
    }
    Ok(())
}

fn apply(state: &mut ServerState, request: &ApplyRequest) -> ApplyResponse {
    let now = Timestamp::now();
    let current = state
        .entities
        .get(&request.key)
        .map(|r| (r.version, r.payload.clone(), r.deleted));

    let conflict = |version: Version, payload: Payload| ApplyResponse::Conflict {
        remote_version: version,
        remote_payload: payload,
    };

    let response = match (request.kind, current) {
        // The id already exists remotely; creating it again would clobber
        // someone else's entity.
        (ChangeKind::Create, Some((version, payload, false))) => conflict(version, payload),
        (ChangeKind::Create, _) => {
            let version = state
                .entities
                .create(&request.key, request.payload.clone(), now);
            ApplyResponse::applied(version)
        }

        (ChangeKind::Update, None) => {
            ApplyResponse::rejected(format!("{} does not exist", request.key))
        }
        (ChangeKind::Update, Some((version, payload, deleted)))
            if deleted || request.base_version != Some(version) =>
        {
            conflict(version, payload)
        }
        (ChangeKind::Update, Some((version, payload, _))) => {
            match state
                .entities
                .update(&request.key, request.payload.clone(), now)
            {
                Some(version) => ApplyResponse::applied(version),
                None => conflict(version, payload),
            }
        }

        // Deleting something that is already gone is a no-op success.
        (ChangeKind::Delete, None) => ApplyResponse::applied(Version(0)),
        (ChangeKind::Delete, Some((version, _, true))) => ApplyResponse::applied(version),
        (ChangeKind::Delete, Some((version, payload, false)))
            if request.base_version != Some(version) =>
        {
            conflict(version, payload)
        }
        (ChangeKind::Delete, Some((version, payload, false))) => {
            match state.entities.delete(&request.key, now) {
                Some(version) => ApplyResponse::applied(version),
                None => conflict(version, payload),
            }
        }
    };

    if response.is_applied() {
        state
            .applied
            .entry(request.key.clone())
            .or_default()
            .push(request.id);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use studysync_protocol::Change;

    fn create_handler(config: ServerConfig) -> (RequestHandler, Arc<HandlerContext>) {
        let context = Arc::new(HandlerContext::new(config));
        (RequestHandler::new(Arc::clone(&context)), context)
    }

    fn note() -> EntityKey {
        EntityKey::new("note", "n1")
    }

    fn title(value: &str) -> Payload {
        Payload::from_fields([("title", json!(value))])
    }

    fn send(handler: &RequestHandler, change: &Change) -> ApplyResponse {
        handler.handle_apply(ApplyRequest::from(change)).unwrap()
    }

    #[test]
    fn create_then_update() {
        let (handler, _) = create_handler(ServerConfig::default());

        let created = send(&handler, &Change::create(note(), title("a"), "u1"));
        assert_eq!(created, ApplyResponse::applied(Version(1)));

        let updated = send(
            &handler,
            &Change::update(note(), Payload::from_fields([("body", json!("b"))]), Version(1), "u1"),
        );
        assert_eq!(updated, ApplyResponse::applied(Version(2)));

        let entity = handler.handle_fetch(&note(), None).unwrap();
        assert_eq!(entity.payload.get("title"), Some(&json!("a")));
        assert_eq!(entity.payload.get("body"), Some(&json!("b")));
    }

    #[test]
    fn replay_returns_cached_outcome() {
        let (handler, context) = create_handler(ServerConfig::default());
        let change = Change::create(note(), title("a"), "u1");

        let first = send(&handler, &change);
        let second = send(&handler, &change);

        assert_eq!(first, second);
        assert_eq!(context.replay_count(), 1);
        assert_eq!(context.applied_changes(&note()), vec![change.id]);
        assert_eq!(handler.handle_fetch(&note(), None).unwrap().version, Version(1));
    }

    #[test]
    fn stale_base_is_a_conflict() {
        let (handler, _) = create_handler(ServerConfig::default());
        send(&handler, &Change::create(note(), title("a"), "u1"));
        send(&handler, &Change::update(note(), title("b"), Version(1), "u2"));

        let stale = Change::update(note(), title("c"), Version(1), "u1");
        let response = send(&handler, &stale);
        assert_eq!(
            response,
            ApplyResponse::Conflict {
                remote_version: Version(2),
                remote_payload: title("b"),
            }
        );

        // Conflicts are not cached; the rebased change goes through under
        // the same id.
        let mut rebased = stale.clone();
        rebased.base_version = Some(Version(2));
        assert_eq!(send(&handler, &rebased), ApplyResponse::applied(Version(3)));
    }

    #[test]
    fn create_over_live_entity_conflicts() {
        let (handler, _) = create_handler(ServerConfig::default());
        send(&handler, &Change::create(note(), title("a"), "u1"));

        let response = send(&handler, &Change::create(note(), title("b"), "u2"));
        assert!(matches!(response, ApplyResponse::Conflict { .. }));
    }

    #[test]
    fn delete_semantics() {
        let (handler, _) = create_handler(ServerConfig::default());

        let unknown = send(&handler, &Change::delete(note(), Version(3), "u1"));
        assert_eq!(unknown, ApplyResponse::applied(Version(0)));

        send(&handler, &Change::create(note(), title("a"), "u1"));
        let deleted = send(&handler, &Change::delete(note(), Version(1), "u1"));
        assert_eq!(deleted, ApplyResponse::applied(Version(2)));

        let again = send(&handler, &Change::delete(note(), Version(1), "u1"));
        assert_eq!(again, ApplyResponse::applied(Version(2)));

        let entity = handler.handle_fetch(&note(), Some(Version(1))).unwrap();
        assert!(entity.deleted);

        let revived = send(&handler, &Change::create(note(), title("b"), "u1"));
        assert_eq!(revived, ApplyResponse::applied(Version(3)));
    }

    #[test]
    fn update_of_deleted_entity_conflicts() {
        let (handler, _) = create_handler(ServerConfig::default());
        send(&handler, &Change::create(note(), title("a"), "u1"));
        send(&handler, &Change::delete(note(), Version(1), "u2"));

        let response = send(&handler, &Change::update(note(), title("b"), Version(1), "u1"));
        assert_eq!(
            response,
            ApplyResponse::Conflict {
                remote_version: Version(2),
                remote_payload: Payload::new(),
            }
        );
    }

    #[test]
    fn update_of_unknown_entity_is_rejected() {
        let (handler, _) = create_handler(ServerConfig::default());
        let response = send(&handler, &Change::update(note(), title("b"), Version(1), "u1"));
        assert!(matches!(response, ApplyResponse::Rejected { .. }));
    }

    #[test]
    fn read_only_type_is_rejected_and_cached() {
        let (handler, context) =
            create_handler(ServerConfig::default().with_read_only_type("note"));
        let change = Change::create(note(), title("a"), "u1");

        let response = send(&handler, &change);
        assert_eq!(response, ApplyResponse::rejected("entity type 'note' is read-only"));
        assert_eq!(send(&handler, &change), response);
        assert_eq!(context.replay_count(), 1);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let (handler, _) = create_handler(ServerConfig::default().with_max_payload_fields(1));
        let payload = Payload::from_fields([("a", json!(1)), ("b", json!(2))]);

        let response = send(&handler, &Change::create(note(), payload, "u1"));
        assert!(matches!(response, ApplyResponse::Rejected { .. }));
    }

    #[test]
    fn malformed_requests_are_errors() {
        let (handler, _) = create_handler(ServerConfig::default());

        let mut create = ApplyRequest::from(&Change::create(note(), title("a"), "u1"));
        create.base_version = Some(Version(1));
        assert!(matches!(
            handler.handle_apply(create),
            Err(ServerError::InvalidBaseVersion { .. })
        ));

        let mut delete = ApplyRequest::from(&Change::delete(note(), Version(1), "u1"));
        delete.payload = title("x");
        assert!(matches!(
            handler.handle_apply(delete),
            Err(ServerError::InvalidRequest(_))
        ));

        let empty = ApplyRequest::from(&Change::create(EntityKey::new("", "x"), title("a"), "u1"));
        assert!(handler.handle_apply(empty).unwrap_err().is_client_error());
    }

    #[test]
    fn fetch_reports_changed_fields() {
        let (handler, _) = create_handler(ServerConfig::default());
        send(&handler, &Change::create(note(), title("a"), "u1"));
        send(
            &handler,
            &Change::update(note(), Payload::from_fields([("body", json!("b"))]), Version(1), "u2"),
        );

        let entity = handler.handle_fetch(&note(), Some(Version(1))).unwrap();
        assert_eq!(entity.version, Version(2));
        assert_eq!(
            entity.changed_since,
            Some(["body".to_string()].into_iter().collect())
        );

        let missing = handler
            .handle_fetch(&EntityKey::new("note", "nope"), Some(Version(1)))
            .unwrap();
        assert!(missing.deleted);
        assert_eq!(missing.version, Version(0));
    }
}
