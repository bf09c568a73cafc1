//! Extension operator registry.
//!
//! The parser accepts any `=name=` token; names that are not builtins
//! dispatch through this registry at compile time. Unknown names fail the
//! compile, so a filter that parsed successfully can always be evaluated.

use serde_json::Value;
use std::{collections::HashMap, sync::Arc};

use super::ast::FilterValue;
use super::sql::SqlFragment;
use super::FilterError;

/// A domain predicate plugged in by the resource author. Both sides of the
/// dual evaluation must be supplied and must agree on truth values.
pub trait CustomOperator: Send + Sync {
    /// Lowers `column <op> value` into the fragment. The column identifier
    /// has already been validated against the table.
    fn to_sql(
        &self,
        column: &str,
        value: &FilterValue,
        sql: &mut SqlFragment,
    ) -> Result<(), FilterError>;

    /// Evaluates the predicate against a single field value. `None` means
    /// the record has no such column.
    fn evaluate(&self, field: Option<&Value>, value: &FilterValue) -> bool;
}

#[derive(Clone, Default)]
pub struct OperatorRegistry {
    ops: HashMap<String, Arc<dyn CustomOperator>>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, op: Arc<dyn CustomOperator>) {
        self.ops.insert(name.to_owned(), op);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn CustomOperator>> {
        self.ops.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl std::fmt::Debug for OperatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorRegistry")
            .field("ops", &self.ops.keys().collect::<Vec<_>>())
            .finish()
    }
}
