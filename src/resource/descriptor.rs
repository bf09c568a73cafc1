//! Per-resource configuration.
//!
//! A [`ResourceDescriptor`] is everything the pipeline needs to synthesise
//! the REST surface for one table: capability flags, pagination and batch
//! limits, the ETag policy, scope config, lifecycle hooks, relations and
//! extension operators. Built through [`DescriptorBuilder`], which enforces
//! the configuration invariants up front.

use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::filter::OperatorRegistry;
use crate::models::RequestContext;
use crate::scope::ScopeConfig;
use crate::storage::TableHandle;

/// Hard ceiling on `max_limit` per the pagination invariant.
pub const LIMIT_CEILING: usize = 1000;

pub const DEFAULT_MUTATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Before-hooks may rewrite the incoming payload; they run in registration
/// order, each receiving its predecessor's output.
pub type BeforeHook = Arc<
    dyn Fn(RequestContext, Value) -> BoxFuture<'static, Result<Value, crate::error::ApiError>>
        + Send
        + Sync,
>;

/// After-hooks observe the stored row (or the batch outcome); they cannot
/// mutate it.
pub type AfterHook = Arc<
    dyn Fn(RequestContext, Value) -> BoxFuture<'static, Result<(), crate::error::ApiError>>
        + Send
        + Sync,
>;

#[derive(Clone, Default)]
pub struct Hooks {
    pub before_create: Vec<BeforeHook>,
    pub after_create: Vec<AfterHook>,
    pub before_update: Vec<BeforeHook>,
    pub after_update: Vec<AfterHook>,
    pub before_delete: Vec<BeforeHook>,
    pub after_delete: Vec<AfterHook>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    BelongsTo,
    HasOne,
    HasMany,
    ManyToMany,
}

/// Join-table leg of a many-to-many relation.
#[derive(Debug, Clone, PartialEq)]
pub struct ThroughDef {
    pub table: TableHandle,
    /// Column on the join table referencing the parent.
    pub source_key: String,
    /// Column on the join table referencing the target.
    pub target_key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationDef {
    pub kind: RelationKind,
    pub target: TableHandle,
    /// belongsTo: column on the parent; hasOne/hasMany: column on the
    /// target. Unused for manyToMany.
    pub foreign_key: String,
    /// The column the foreign key points at (parent side for has*,
    /// target side for belongsTo).
    pub references: String,
    pub through: Option<ThroughDef>,
    /// Relations reachable from the target, for nested includes
    /// (`author.posts.comments`).
    pub relations: std::collections::HashMap<String, RelationDef>,
}

impl RelationDef {
    pub fn belongs_to(target: TableHandle, foreign_key: &str, references: &str) -> Self {
        Self {
            kind: RelationKind::BelongsTo,
            target,
            foreign_key: foreign_key.to_owned(),
            references: references.to_owned(),
            through: None,
            relations: std::collections::HashMap::new(),
        }
    }

    pub fn has_one(target: TableHandle, foreign_key: &str, references: &str) -> Self {
        Self { kind: RelationKind::HasOne, ..Self::belongs_to(target, foreign_key, references) }
    }

    pub fn has_many(target: TableHandle, foreign_key: &str, references: &str) -> Self {
        Self { kind: RelationKind::HasMany, ..Self::belongs_to(target, foreign_key, references) }
    }

    /// `parent_key` is the parent column the join table's `source_key`
    /// refers to (usually the primary key); `references` its target-side
    /// counterpart.
    pub fn many_to_many(
        target: TableHandle,
        parent_key: &str,
        references: &str,
        through: ThroughDef,
    ) -> Self {
        Self {
            kind: RelationKind::ManyToMany,
            target,
            foreign_key: parent_key.to_owned(),
            references: references.to_owned(),
            through: Some(through),
            relations: std::collections::HashMap::new(),
        }
    }

    pub fn with_relation(mut self, name: &str, def: RelationDef) -> Self {
        self.relations.insert(name.to_owned(), def);
        self
    }
}

#[derive(Clone)]
pub struct ResourceDescriptor {
    pub table: TableHandle,
    pub enable_create: bool,
    pub enable_update: bool,
    pub enable_replace: bool,
    pub enable_delete: bool,
    pub enable_subscriptions: bool,
    pub enable_aggregations: bool,
    pub enable_search: bool,
    pub default_limit: usize,
    pub max_limit: usize,
    pub max_create: usize,
    pub max_update: usize,
    pub max_delete: usize,
    /// Monotonic integer column for strong-ish ETags (`W/"<id>:<version>"`).
    pub version_field: Option<String>,
    /// Column holding a precomputed digest; takes precedence over
    /// `version_field` and hash ETags.
    pub etag_field: Option<String>,
    pub scope: ScopeConfig,
    pub hooks: Hooks,
    pub relations: HashMap<String, RelationDef>,
    pub operators: OperatorRegistry,
    pub max_include_depth: usize,
    pub mutation_timeout: Duration,
    pub heartbeat: Duration,
}

impl ResourceDescriptor {
    pub fn builder(table: TableHandle) -> DescriptorBuilder {
        DescriptorBuilder::new(table)
    }

    /// The changelog resource identifier.
    pub fn resource_name(&self) -> &str {
        self.table.name()
    }
}

impl std::fmt::Debug for ResourceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceDescriptor")
            .field("table", &self.table.name())
            .field("default_limit", &self.default_limit)
            .field("max_limit", &self.max_limit)
            .field("relations", &self.relations.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub struct DescriptorBuilder {
    descriptor: ResourceDescriptor,
}

impl DescriptorBuilder {
    fn new(table: TableHandle) -> Self {
        Self {
            descriptor: ResourceDescriptor {
                table,
                enable_create: true,
                enable_update: true,
                enable_replace: true,
                enable_delete: true,
                enable_subscriptions: true,
                enable_aggregations: true,
                enable_search: false,
                default_limit: 50,
                max_limit: 500,
                max_create: 100,
                max_update: 100,
                max_delete: 100,
                version_field: None,
                etag_field: None,
                scope: ScopeConfig::public(),
                hooks: Hooks::default(),
                relations: HashMap::new(),
                operators: OperatorRegistry::new(),
                max_include_depth: 3,
                mutation_timeout: DEFAULT_MUTATION_TIMEOUT,
                heartbeat: crate::subscription::DEFAULT_HEARTBEAT,
            },
        }
    }

    pub fn enable_create(mut self, val: bool) -> Self {
        self.descriptor.enable_create = val;
        self
    }

    pub fn enable_update(mut self, val: bool) -> Self {
        self.descriptor.enable_update = val;
        self
    }

    pub fn enable_replace(mut self, val: bool) -> Self {
        self.descriptor.enable_replace = val;
        self
    }

    pub fn enable_delete(mut self, val: bool) -> Self {
        self.descriptor.enable_delete = val;
        self
    }

    pub fn enable_subscriptions(mut self, val: bool) -> Self {
        self.descriptor.enable_subscriptions = val;
        self
    }

    pub fn enable_aggregations(mut self, val: bool) -> Self {
        self.descriptor.enable_aggregations = val;
        self
    }

    pub fn enable_search(mut self, val: bool) -> Self {
        self.descriptor.enable_search = val;
        self
    }

    pub fn limits(mut self, default_limit: usize, max_limit: usize) -> Self {
        self.descriptor.default_limit = default_limit;
        self.descriptor.max_limit = max_limit;
        self
    }

    pub fn batch_limits(mut self, create: usize, update: usize, delete: usize) -> Self {
        self.descriptor.max_create = create;
        self.descriptor.max_update = update;
        self.descriptor.max_delete = delete;
        self
    }

    pub fn version_field(mut self, field: &str) -> Self {
        self.descriptor.version_field = Some(field.to_owned());
        self
    }

    pub fn etag_field(mut self, field: &str) -> Self {
        self.descriptor.etag_field = Some(field.to_owned());
        self
    }

    pub fn scope(mut self, scope: ScopeConfig) -> Self {
        self.descriptor.scope = scope;
        self
    }

    pub fn on_before_create(mut self, hook: BeforeHook) -> Self {
        self.descriptor.hooks.before_create.push(hook);
        self
    }

    pub fn on_after_create(mut self, hook: AfterHook) -> Self {
        self.descriptor.hooks.after_create.push(hook);
        self
    }

    pub fn on_before_update(mut self, hook: BeforeHook) -> Self {
        self.descriptor.hooks.before_update.push(hook);
        self
    }

    pub fn on_after_update(mut self, hook: AfterHook) -> Self {
        self.descriptor.hooks.after_update.push(hook);
        self
    }

    pub fn on_before_delete(mut self, hook: BeforeHook) -> Self {
        self.descriptor.hooks.before_delete.push(hook);
        self
    }

    pub fn on_after_delete(mut self, hook: AfterHook) -> Self {
        self.descriptor.hooks.after_delete.push(hook);
        self
    }

    pub fn relation(mut self, name: &str, def: RelationDef) -> Self {
        self.descriptor.relations.insert(name.to_owned(), def);
        self
    }

    pub fn operator(
        mut self,
        name: &str,
        op: Arc<dyn crate::filter::CustomOperator>,
    ) -> Self {
        self.descriptor.operators.register(name, op);
        self
    }

    pub fn mutation_timeout(mut self, timeout: Duration) -> Self {
        self.descriptor.mutation_timeout = timeout;
        self
    }

    pub fn heartbeat(mut self, interval: Duration) -> Self {
        self.descriptor.heartbeat = interval;
        self
    }

    /// Validates the configuration invariants and produces the descriptor.
    pub fn build(self) -> Result<ResourceDescriptor, String> {
        let d = &self.descriptor;
        if !d.table.has_column(d.table.primary_key()) {
            return Err(format!(
                "primary key `{}` is not a declared column of `{}`",
                d.table.primary_key(),
                d.table.name()
            ));
        }
        if d.default_limit < 1 || d.default_limit > d.max_limit || d.max_limit > LIMIT_CEILING {
            return Err(format!(
                "pagination limits must satisfy 1 <= default ({}) <= max ({}) <= {LIMIT_CEILING}",
                d.default_limit, d.max_limit
            ));
        }
        if d.max_create < 1 || d.max_update < 1 || d.max_delete < 1 {
            return Err("batch limits must be >= 1".to_owned());
        }
        for field in [&d.version_field, &d.etag_field].into_iter().flatten() {
            if !d.table.has_column(field) {
                return Err(format!(
                    "`{field}` is not a declared column of `{}`",
                    d.table.name()
                ));
            }
        }
        for (name, relation) in &d.relations {
            if relation.kind == RelationKind::ManyToMany && relation.through.is_none() {
                return Err(format!("manyToMany relation `{name}` needs a through table"));
            }
        }
        Ok(self.descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ColumnType;

    fn users() -> TableHandle {
        TableHandle::new("users", "id")
            .column("id", ColumnType::Text)
            .column("name", ColumnType::Text)
    }

    #[test]
    fn builder_validates_pagination_invariant() {
        assert!(ResourceDescriptor::builder(users()).limits(10, 100).build().is_ok());
        assert!(ResourceDescriptor::builder(users()).limits(0, 100).build().is_err());
        assert!(ResourceDescriptor::builder(users()).limits(200, 100).build().is_err());
        assert!(ResourceDescriptor::builder(users()).limits(10, 1001).build().is_err());
    }

    #[test]
    fn builder_validates_declared_columns() {
        assert!(ResourceDescriptor::builder(users()).version_field("rev").build().is_err());
        let err = ResourceDescriptor::builder(TableHandle::new("users", "id"))
            .build()
            .unwrap_err();
        assert!(err.contains("primary key"));
    }

    #[test]
    fn batch_limits_must_be_positive() {
        assert!(ResourceDescriptor::builder(users()).batch_limits(0, 1, 1).build().is_err());
    }
}
