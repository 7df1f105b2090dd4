//! Server configuration.

use std::collections::BTreeSet;

/// Configuration for the reference remote.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Versions of changed-field history kept per entity.
    ///
    /// A fetch asking for changes since an older version gets no field
    /// list back and must assume every field changed.
    pub history_limit: usize,
    /// Maximum number of fields a single change may write.
    pub max_payload_fields: usize,
    /// Entity types the remote refuses to modify.
    pub read_only_types: BTreeSet<String>,
}

impl ServerConfig {
    /// Creates a configuration with default limits.
    pub fn new() -> Self {
        Self {
            history_limit: 64,
            max_payload_fields: 256,
            read_only_types: BTreeSet::new(),
        }
    }

    /// Sets the per-entity history limit.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Sets the maximum fields per change.
    pub fn with_max_payload_fields(mut self, max: usize) -> Self {
        self.max_payload_fields = max;
        self
    }

    /// Marks an entity type as read-only; changes to it are rejected.
    pub fn with_read_only_type(mut self, entity_type: impl Into<String>) -> Self {
        self.read_only_types.insert(entity_type.into());
        self
    }

    /// Returns true if changes to `entity_type` are refused.
    pub fn is_read_only(&self, entity_type: &str) -> bool {
        self.read_only_types.contains(entity_type)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}
