//! The request pipeline.
//!
//! HTTP-agnostic core behind the route handlers: authorization (scope
//! resolution → additional filter), lifecycle hooks, storage calls,
//! changelog publication and response shaping all happen here, so the
//! whole surface is exercisable without an HTTP server.
//!
//! Mutation flow: resolve scope → run before-hooks (a pipeline over the
//! payload, registration order) → transactional driver write (mutation +
//! row read-back + changelog append) → publish the committed entry to the
//! broker → run after-hooks → shape the response. A failure after the
//! commit is reported to the client, but the changelog entry stands.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::cursor::{self, Cursor};
use super::descriptor::{AfterHook, BeforeHook, ResourceDescriptor};
use super::etag::{self, IfMatch};
use super::relations;
use crate::changelog::{ChangelogBroker, ChangelogEntry};
use crate::error::ApiError;
use crate::filter::{CompiledFilter, FilterCache};
use crate::models::{Operation, Record, RequestContext};
use crate::scope;
use crate::search::SearchAdapter;
use crate::storage::{
    keyset, AggregateGroup, AggregateSpec, OrderKey, SelectQuery, StorageDriver, WriteContext,
};
use crate::subscription::{self, SubscriptionRequest};

#[derive(Debug, Clone, Default)]
pub struct ListParams {
    pub filter: Option<String>,
    pub order_by: Vec<OrderKey>,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
    pub select: Option<Vec<String>>,
    pub total_count: bool,
    pub include: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    pub items: Vec<Record>,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_count: Option<u64>,
}

/// Outcome of a single-row mutation.
#[derive(Debug, Clone)]
pub struct Mutated {
    pub record: Option<Record>,
    pub etag: Option<String>,
    pub seq: u64,
}

pub struct ResourcePipeline {
    pub descriptor: Arc<ResourceDescriptor>,
    driver: Arc<dyn StorageDriver>,
    broker: Arc<ChangelogBroker>,
    filters: FilterCache,
}

impl ResourcePipeline {
    pub fn new(
        descriptor: Arc<ResourceDescriptor>,
        driver: Arc<dyn StorageDriver>,
        broker: Arc<ChangelogBroker>,
    ) -> Self {
        Self { descriptor, driver, broker, filters: FilterCache::default() }
    }

    pub fn broker(&self) -> &Arc<ChangelogBroker> {
        &self.broker
    }

    /// Empty expression = tautology. Compiles through the shared LRU cache
    /// unless the resource carries extension operators (registry identity
    /// is per-resource).
    fn compile_filter(&self, raw: Option<&str>) -> Result<Option<Arc<CompiledFilter>>, ApiError> {
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(None);
        };
        let compiled = if self.descriptor.operators.is_empty() {
            self.filters.get_or_compile(raw)?
        } else {
            Arc::new(CompiledFilter::compile_with(raw, &self.descriptor.operators)?)
        };
        Ok(Some(compiled))
    }

    /// Scope ∧ caller filter for the operation. The caller filter must be
    /// fully local; surfaces that can afford a semi-join use
    /// [`Self::effective_filter_resolved`] instead.
    fn effective_filter(
        &self,
        op: Operation,
        ctx: &RequestContext,
        raw: Option<&str>,
    ) -> Result<Option<Arc<CompiledFilter>>, ApiError> {
        let scope_filter = self.descriptor.scope.resolve(op, ctx)?;
        let caller = self.compile_filter(raw)?;
        Ok(scope::compose(scope_filter, caller))
    }

    /// Scope ∧ caller filter, with top-level relation-path predicates
    /// (`author.name=="X"`) peeled out and replaced by membership
    /// predicates over the parent join column (a batched semi-join against
    /// the relation target). The result is fully local, so both the SQL
    /// lowering and the record evaluator see only parent columns.
    async fn effective_filter_resolved(
        &self,
        op: Operation,
        ctx: &RequestContext,
        raw: Option<&str>,
    ) -> Result<Option<Arc<CompiledFilter>>, ApiError> {
        let scope_filter = self.descriptor.scope.resolve(op, ctx)?;
        let caller = match self.compile_filter(raw)? {
            Some(compiled) if !self.descriptor.relations.is_empty() => {
                let resolved = relations::resolve_filters(
                    &self.driver,
                    &self.descriptor.relations,
                    compiled.root().clone(),
                    self.descriptor.max_include_depth,
                )
                .await?;
                match resolved {
                    Some(root) => Some(Arc::new(compiled.rebuild(root)?)),
                    None => None,
                }
            }
            other => other,
        };
        Ok(scope::compose(scope_filter, caller))
    }

    /// Requested order keys plus the primary-key tiebreak, validated
    /// against the table.
    fn order_with_tiebreak(&self, requested: &[OrderKey]) -> Result<Vec<OrderKey>, ApiError> {
        let table = &self.descriptor.table;
        let mut order = Vec::with_capacity(requested.len() + 1);
        for key in requested {
            if !table.has_column(&key.field) {
                return Err(ApiError::Validation(format!(
                    "unknown orderBy column `{}`",
                    key.field
                )));
            }
            order.push(key.clone());
        }
        let pk = table.primary_key();
        if !order.iter().any(|k| k.field == pk) {
            order.push(OrderKey::asc(pk));
        }
        Ok(order)
    }

    #[instrument(skip_all, fields(resource = self.descriptor.resource_name()))]
    pub async fn list(
        &self,
        ctx: &RequestContext,
        params: &ListParams,
    ) -> Result<ListResponse, ApiError> {
        let filter = self
            .effective_filter_resolved(Operation::Read, ctx, params.filter.as_deref())
            .await?;
        let order = self.order_with_tiebreak(&params.order_by)?;

        let limit = params
            .limit
            .unwrap_or(self.descriptor.default_limit)
            .clamp(1, self.descriptor.max_limit);

        let after = match &params.cursor {
            None => None,
            Some(raw) => {
                let decoded = cursor::decode(raw)?;
                if decoded.order != order {
                    return Err(ApiError::Validation(
                        "cursor does not match the requested orderBy".to_owned(),
                    ));
                }
                Some(decoded.bound())
            }
        };

        let query = SelectQuery {
            filter: filter.clone(),
            order: order.clone(),
            // One extra row decides hasMore without a second query.
            limit: Some(limit + 1),
            after,
        };
        let mut items = self.driver.select(&self.descriptor.table, &query).await?;
        let has_more = items.len() > limit;
        items.truncate(limit);

        let next_cursor = if has_more {
            items.last().map(|last| {
                cursor::encode(&Cursor {
                    order: order.clone(),
                    last_values: keyset::bound_from_row(last, &order).values,
                })
            })
        } else {
            None
        };

        let total_count = if params.total_count {
            Some(self.driver.count(&self.descriptor.table, filter.as_deref()).await?)
        } else {
            None
        };

        self.load_includes(&mut items, params.include.as_deref()).await?;
        let items = self.project_all(items, params.select.as_deref());

        Ok(ListResponse { items, has_more, next_cursor, total_count })
    }

    #[instrument(skip_all, fields(resource = self.descriptor.resource_name(), id = id))]
    pub async fn get(
        &self,
        ctx: &RequestContext,
        id: &str,
        select: Option<&[String]>,
        include: Option<&str>,
        if_none_match: Option<&str>,
    ) -> Result<(Record, String), ApiError> {
        let row = self.fetch_in_scope(ctx, Operation::Read, id).await?;
        let etag = etag::resolve(&self.descriptor, &row);

        if let Some(header) = if_none_match {
            let condition = etag::parse_precondition(header)?;
            if etag::precondition_matches(&condition, &etag) {
                return Err(ApiError::NotModified);
            }
        }

        let mut rows = vec![row];
        self.load_includes(&mut rows, include).await?;
        let row = self
            .project_all(rows, select)
            .pop()
            .expect("projection preserves arity");
        Ok((row, etag))
    }

    pub async fn count(
        &self,
        ctx: &RequestContext,
        raw_filter: Option<&str>,
    ) -> Result<u64, ApiError> {
        let filter = self
            .effective_filter_resolved(Operation::Read, ctx, raw_filter)
            .await?;
        Ok(self.driver.count(&self.descriptor.table, filter.as_deref()).await?)
    }

    pub async fn aggregate(
        &self,
        ctx: &RequestContext,
        raw_filter: Option<&str>,
        spec: &AggregateSpec,
    ) -> Result<Vec<AggregateGroup>, ApiError> {
        if !self.descriptor.enable_aggregations {
            return Err(ApiError::NotFound);
        }
        if spec.is_empty() {
            return Err(ApiError::Validation(
                "aggregate needs at least one accumulator".to_owned(),
            ));
        }
        for column in spec.referenced_columns() {
            if !self.descriptor.table.has_column(column) {
                return Err(ApiError::Validation(format!("unknown column `{column}`")));
            }
        }
        let filter = self
            .effective_filter_resolved(Operation::Read, ctx, raw_filter)
            .await?;
        Ok(self
            .driver
            .aggregate(&self.descriptor.table, filter.as_deref(), spec)
            .await?)
    }

    #[instrument(skip_all, fields(resource = self.descriptor.resource_name()))]
    pub async fn create(&self, ctx: &RequestContext, payload: Value) -> Result<Mutated, ApiError> {
        if !self.descriptor.enable_create {
            return Err(ApiError::NotFound);
        }
        let scope_filter = self.descriptor.scope.resolve(Operation::Create, ctx)?;
        let payload = run_before(&self.descriptor.hooks.before_create, ctx, payload).await?;
        let row = self.prepare_new_row(payload)?;

        if let Some(filter) = &scope_filter {
            // A row the caller could not read back is a row they may not
            // create.
            if !filter.matches(&row) {
                return Err(ApiError::Forbidden);
            }
        }

        let entry = self
            .driver
            .insert(&self.descriptor.table, row, &self.write_context(ctx))
            .await?;
        let mutated = self.commit(ctx, entry, &self.descriptor.hooks.after_create).await?;
        Ok(mutated)
    }

    #[instrument(skip_all, fields(resource = self.descriptor.resource_name(), id = id))]
    pub async fn update(
        &self,
        ctx: &RequestContext,
        id: &str,
        patch: Value,
        if_match: Option<&str>,
    ) -> Result<Mutated, ApiError> {
        if !self.descriptor.enable_update {
            return Err(ApiError::NotFound);
        }
        let current = self.fetch_in_scope(ctx, Operation::Update, id).await?;
        let expected = self.check_if_match(&current, if_match)?;

        let patch = run_before(&self.descriptor.hooks.before_update, ctx, patch).await?;
        let patch = self.sanitize_payload(patch)?;

        let entry = self
            .driver
            .update(
                &self.descriptor.table,
                id,
                patch,
                expected.as_ref(),
                &self.write_context(ctx),
            )
            .await
            .map_err(|err| self.map_precondition(err))?;
        self.commit(ctx, entry, &self.descriptor.hooks.after_update).await
    }

    #[instrument(skip_all, fields(resource = self.descriptor.resource_name(), id = id))]
    pub async fn replace(
        &self,
        ctx: &RequestContext,
        id: &str,
        payload: Value,
        if_match: Option<&str>,
    ) -> Result<Mutated, ApiError> {
        if !self.descriptor.enable_replace {
            return Err(ApiError::NotFound);
        }
        let current = self.fetch_in_scope(ctx, Operation::Update, id).await?;
        let expected = self.check_if_match(&current, if_match)?;

        let payload = run_before(&self.descriptor.hooks.before_update, ctx, payload).await?;
        let row = self.sanitize_payload(payload)?;

        let entry = self
            .driver
            .replace(
                &self.descriptor.table,
                id,
                row,
                expected.as_ref(),
                &self.write_context(ctx),
            )
            .await
            .map_err(|err| self.map_precondition(err))?;
        self.commit(ctx, entry, &self.descriptor.hooks.after_update).await
    }

    #[instrument(skip_all, fields(resource = self.descriptor.resource_name(), id = id))]
    pub async fn delete(
        &self,
        ctx: &RequestContext,
        id: &str,
        if_match: Option<&str>,
    ) -> Result<Mutated, ApiError> {
        if !self.descriptor.enable_delete {
            return Err(ApiError::NotFound);
        }
        let current = self.fetch_in_scope(ctx, Operation::Delete, id).await?;
        let expected = self.check_if_match(&current, if_match)?;

        let _ = run_before(
            &self.descriptor.hooks.before_delete,
            ctx,
            Value::Object(current.clone()),
        )
        .await?;

        let entry = self
            .driver
            .delete(
                &self.descriptor.table,
                id,
                expected.as_ref(),
                &self.write_context(ctx),
            )
            .await
            .map_err(|err| self.map_precondition(err))?;

        let seq = entry.seq;
        let before = entry.before.clone();
        self.broker.publish(Arc::new(entry)).await;
        run_after(
            &self.descriptor.hooks.after_delete,
            ctx,
            before.map(Value::Object).unwrap_or(Value::Null),
        )
        .await?;
        Ok(Mutated { record: None, etag: None, seq })
    }

    /// All-or-nothing batch create: `{ items: [...] }`.
    #[instrument(skip_all, fields(resource = self.descriptor.resource_name(), count = items.len()))]
    pub async fn batch_create(
        &self,
        ctx: &RequestContext,
        items: Vec<Value>,
    ) -> Result<Vec<Mutated>, ApiError> {
        if !self.descriptor.enable_create {
            return Err(ApiError::NotFound);
        }
        if items.len() > self.descriptor.max_create {
            return Err(ApiError::TooLarge(format!(
                "batch of {} exceeds maxCreate {}",
                items.len(),
                self.descriptor.max_create
            )));
        }
        let scope_filter = self.descriptor.scope.resolve(Operation::Create, ctx)?;

        // Hooks fire once per request; the batch is the payload.
        let payload =
            run_before(&self.descriptor.hooks.before_create, ctx, Value::Array(items)).await?;
        let Value::Array(items) = payload else {
            return Err(ApiError::Internal(
                "before-create hook replaced the batch with a non-array".to_owned(),
            ));
        };

        let mut rows = Vec::with_capacity(items.len());
        for item in items {
            let row = self.prepare_new_row(item)?;
            if let Some(filter) = &scope_filter {
                if !filter.matches(&row) {
                    return Err(ApiError::Forbidden);
                }
            }
            rows.push(row);
        }

        let entries = self
            .driver
            .insert_many(&self.descriptor.table, rows, &self.write_context(ctx))
            .await?;

        let mut results = Vec::with_capacity(entries.len());
        let mut created = Vec::with_capacity(entries.len());
        for entry in entries {
            let seq = entry.seq;
            let record = entry.after.clone();
            self.broker.publish(Arc::new(entry)).await;
            let etag = record.as_ref().map(|r| etag::resolve(&self.descriptor, r));
            if let Some(record) = &record {
                created.push(Value::Object(record.clone()));
            }
            results.push(Mutated { record, etag, seq });
        }
        run_after(&self.descriptor.hooks.after_create, ctx, Value::Array(created)).await?;
        Ok(results)
    }

    /// Bulk update by filter; returns the affected-row count.
    #[instrument(skip_all, fields(resource = self.descriptor.resource_name()))]
    pub async fn update_batch(
        &self,
        ctx: &RequestContext,
        raw_filter: Option<&str>,
        patch: Value,
    ) -> Result<u64, ApiError> {
        if !self.descriptor.enable_update {
            return Err(ApiError::NotFound);
        }
        let filter = self
            .effective_filter_resolved(Operation::Update, ctx, raw_filter)
            .await?;

        let affected = self.driver.count(&self.descriptor.table, filter.as_deref()).await?;
        if affected as usize > self.descriptor.max_update {
            return Err(ApiError::TooLarge(format!(
                "bulk update would touch {affected} rows; maxUpdate is {}",
                self.descriptor.max_update
            )));
        }

        let patch = run_before(&self.descriptor.hooks.before_update, ctx, patch).await?;
        let patch = self.sanitize_payload(patch)?;

        let entries = self
            .driver
            .update_where(
                &self.descriptor.table,
                filter.as_deref(),
                patch,
                &self.write_context(ctx),
            )
            .await?;
        let count = entries.len() as u64;
        for entry in entries {
            self.broker.publish(Arc::new(entry)).await;
        }
        run_after(
            &self.descriptor.hooks.after_update,
            ctx,
            serde_json::json!({ "count": count }),
        )
        .await?;
        Ok(count)
    }

    #[instrument(skip_all, fields(resource = self.descriptor.resource_name()))]
    pub async fn delete_batch(
        &self,
        ctx: &RequestContext,
        raw_filter: Option<&str>,
    ) -> Result<u64, ApiError> {
        if !self.descriptor.enable_delete {
            return Err(ApiError::NotFound);
        }
        let filter = self
            .effective_filter_resolved(Operation::Delete, ctx, raw_filter)
            .await?;

        let affected = self.driver.count(&self.descriptor.table, filter.as_deref()).await?;
        if affected as usize > self.descriptor.max_delete {
            return Err(ApiError::TooLarge(format!(
                "bulk delete would touch {affected} rows; maxDelete is {}",
                self.descriptor.max_delete
            )));
        }

        let _ = run_before(&self.descriptor.hooks.before_delete, ctx, Value::Null).await?;
        let entries = self
            .driver
            .delete_where(&self.descriptor.table, filter.as_deref(), &self.write_context(ctx))
            .await?;
        let count = entries.len() as u64;
        for entry in entries {
            self.broker.publish(Arc::new(entry)).await;
        }
        run_after(
            &self.descriptor.hooks.after_delete,
            ctx,
            serde_json::json!({ "count": count }),
        )
        .await?;
        Ok(count)
    }

    /// Opens the SSE pump for this resource. The receiver yields wire-ready
    /// frames.
    pub async fn subscribe(
        &self,
        ctx: &RequestContext,
        raw_filter: Option<&str>,
    ) -> Result<tokio::sync::mpsc::Receiver<String>, ApiError> {
        if !self.descriptor.enable_subscriptions {
            return Err(ApiError::NotFound);
        }
        let filter = self.effective_filter(Operation::Subscribe, ctx, raw_filter)?;
        if let Some(filter) = &filter {
            // The tail evaluates per record; a semi-join membership set
            // taken at connect time would go stale mid-stream.
            if relations::ensure_local(filter.root(), &self.descriptor.relations).is_err() {
                return Err(ApiError::Validation(
                    "relation filters are not supported on subscriptions".to_owned(),
                ));
            }
        }
        subscription::open(
            self.driver.clone(),
            self.broker.clone(),
            SubscriptionRequest {
                resource: self.descriptor.resource_name().to_owned(),
                table: self.descriptor.table.clone(),
                filter,
                session_id: ctx.session.as_ref().map(|s| s.id.clone()),
                cancellation: ctx.cancellation.clone(),
                heartbeat: self.descriptor.heartbeat,
            },
        )
        .await
    }

    /// Delegates to an external search adapter, scope applied. The caller
    /// (the service layer) owns adapter configuration; an unconfigured
    /// adapter never reaches this method.
    pub async fn search(
        &self,
        adapter: &dyn SearchAdapter,
        ctx: &RequestContext,
        q: &str,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<Record>, ApiError> {
        if !self.descriptor.enable_search {
            return Err(ApiError::NotFound);
        }
        let filter = self.effective_filter(Operation::Read, ctx, None)?;
        let options = crate::search::QueryOptions {
            filter,
            limit: limit.unwrap_or(self.descriptor.default_limit).min(self.descriptor.max_limit),
            offset: offset.unwrap_or(0),
        };
        adapter
            .query(self.descriptor.resource_name(), q, &options)
            .await
    }

    // ---- internals -------------------------------------------------------

    fn write_context(&self, ctx: &RequestContext) -> WriteContext {
        WriteContext {
            resource: self.descriptor.resource_name().to_owned(),
            user_id: ctx.user_id().map(str::to_owned),
            version_field: self.descriptor.version_field.clone(),
        }
    }

    /// Fetches a row by id, applying the operation scope. Out-of-scope and
    /// missing are indistinguishable to the caller.
    async fn fetch_in_scope(
        &self,
        ctx: &RequestContext,
        op: Operation,
        id: &str,
    ) -> Result<Record, ApiError> {
        let scope_filter = self.descriptor.scope.resolve(op, ctx)?;
        let row = self
            .driver
            .get_by_id(&self.descriptor.table, id)
            .await?
            .ok_or(ApiError::NotFound)?;
        if let Some(filter) = scope_filter {
            if !filter.matches(&row) {
                debug!(id, "Row exists but is out of scope");
                return Err(ApiError::NotFound);
            }
        }
        Ok(row)
    }

    /// Applies an `If-Match` header against the current row. Returns the
    /// snapshot to pass as the driver's precondition when a check is
    /// active.
    fn check_if_match(
        &self,
        current: &Record,
        if_match: Option<&str>,
    ) -> Result<Option<Record>, ApiError> {
        let Some(header) = if_match else {
            return Ok(None);
        };
        let condition = etag::parse_precondition(header)?;
        let current_etag = etag::resolve(&self.descriptor, current);
        if !etag::precondition_matches(&condition, &current_etag) {
            return Err(ApiError::PreconditionFailed { current_etag });
        }
        match condition {
            // `*` only asserts existence, which fetch_in_scope proved.
            IfMatch::Any => Ok(None),
            IfMatch::Exact(_) => Ok(Some(current.clone())),
        }
    }

    /// Remaps a driver-level precondition failure (the losing writer of a
    /// race) onto the winner's ETag.
    fn map_precondition(&self, err: crate::storage::StorageError) -> ApiError {
        match err {
            crate::storage::StorageError::PreconditionFailed { current, .. } => {
                warn!("Concurrent write lost the optimistic concurrency race");
                ApiError::PreconditionFailed {
                    current_etag: etag::resolve(&self.descriptor, &current),
                }
            }
            other => other.into(),
        }
    }

    fn sanitize_payload(&self, payload: Value) -> Result<Record, ApiError> {
        let Value::Object(mut record) = payload else {
            return Err(ApiError::Validation("request body must be a JSON object".to_owned()));
        };
        // The version counter belongs to the write transaction, not the
        // client.
        if let Some(version_field) = &self.descriptor.version_field {
            record.remove(version_field);
        }
        Ok(record)
    }

    fn prepare_new_row(&self, payload: Value) -> Result<Record, ApiError> {
        let mut row = self.sanitize_payload(payload)?;
        let pk = self.descriptor.table.primary_key();
        let missing = row.get(pk).map(Value::is_null).unwrap_or(true);
        if missing {
            row.insert(pk.to_owned(), Value::String(Uuid::new_v4().to_string()));
        }
        Ok(row)
    }

    async fn commit(
        &self,
        ctx: &RequestContext,
        entry: ChangelogEntry,
        after_hooks: &[AfterHook],
    ) -> Result<Mutated, ApiError> {
        let seq = entry.seq;
        let record = entry.after.clone();
        self.broker.publish(Arc::new(entry)).await;
        run_after(
            after_hooks,
            ctx,
            record.clone().map(Value::Object).unwrap_or(Value::Null),
        )
        .await?;
        let etag = record.as_ref().map(|r| etag::resolve(&self.descriptor, r));
        Ok(Mutated { record, etag, seq })
    }

    async fn load_includes(
        &self,
        rows: &mut Vec<Record>,
        include: Option<&str>,
    ) -> Result<(), ApiError> {
        let Some(raw) = include.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(());
        };
        let specs = relations::parse_include(raw, self.descriptor.max_include_depth)?;
        relations::load(&self.driver, &self.descriptor.relations, rows, &specs).await
    }

    /// `select=` projection. Unknown names are ignored, the primary key is
    /// always retained.
    fn project_all(&self, rows: Vec<Record>, select: Option<&[String]>) -> Vec<Record> {
        let Some(select) = select.filter(|s| !s.is_empty()) else {
            return rows;
        };
        let pk = self.descriptor.table.primary_key();
        rows.into_iter()
            .map(|row| {
                let mut out = Record::new();
                for (key, value) in row {
                    if key == pk || select.iter().any(|s| s == &key) {
                        out.insert(key, value);
                    }
                }
                out
            })
            .collect()
    }
}

async fn run_before(
    hooks: &[BeforeHook],
    ctx: &RequestContext,
    mut payload: Value,
) -> Result<Value, ApiError> {
    for hook in hooks {
        payload = hook(ctx.clone(), payload).await?;
    }
    Ok(payload)
}

async fn run_after(hooks: &[AfterHook], ctx: &RequestContext, value: Value) -> Result<(), ApiError> {
    for hook in hooks {
        hook(ctx.clone(), value.clone()).await?;
    }
    Ok(())
}
