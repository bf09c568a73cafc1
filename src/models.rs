//! Core value and context types shared across the pipeline.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use strum_macros::{Display, EnumString};
use tokio_util::sync::CancellationToken;

use crate::session::Session;

/// A materialised row. Keys are column names, values arbitrary JSON.
pub type Record = serde_json::Map<String, Value>;

/// The operations a caller can perform against a resource. Scope functions
/// are resolved per operation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Operation {
    Read,
    Create,
    Update,
    Delete,
    Subscribe,
}

/// The authenticated caller, as produced by an [`crate::auth::AuthAdapter`].
/// The core never inspects credentials; it only consumes this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UserContext {
    pub id: String,
    #[serde(default)]
    pub roles: HashSet<String>,
    /// Free-form claims forwarded from the adapter (tenant id, email, ...).
    #[serde(default)]
    pub claims: Record,
}

impl UserContext {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_owned(), roles: HashSet::new(), claims: Record::new() }
    }

    pub fn with_role(mut self, role: &str) -> Self {
        self.roles.insert(role.to_owned());
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

/// Per-request state threaded explicitly through the pipeline. Never stored
/// in a request-global.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub user: Option<UserContext>,
    pub session: Option<Session>,
    pub cancellation: CancellationToken,
}

impl RequestContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn for_user(user: UserContext) -> Self {
        Self { user: Some(user), session: None, cancellation: CancellationToken::new() }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.id.as_str())
    }

    /// Idempotency scope component: the user id, or the anonymous marker.
    pub fn scope_principal(&self) -> &str {
        self.user_id().unwrap_or("anonymous")
    }
}

/// Serialise a primary-key value to the stable string form used in URL
/// paths, cursors and idempotency scopes.
pub fn id_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Compare two id values loosely: the path segment always arrives as a
/// string, while the stored key may be numeric.
pub fn id_matches(stored: &Value, requested: &str) -> bool {
    id_to_string(stored) == requested
}

/// Canonical JSON rendering: object keys sorted recursively, no
/// whitespace. Hash inputs (ETags, idempotency fingerprints) go through
/// this so key order never changes a digest.
pub fn canonical_json(value: &Value) -> String {
    fn canonicalize(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: std::collections::BTreeMap<_, _> =
                    map.iter().map(|(k, v)| (k.clone(), canonicalize(v))).collect();
                Value::Object(sorted.into_iter().collect())
            }
            Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
            other => other.clone(),
        }
    }
    canonicalize(value).to_string()
}
