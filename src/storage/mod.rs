//! # Storage traits
//!
//! This module encapsulates the interface between the resource pipeline and
//! the concrete storage backend. The pipeline never issues SQL itself: reads
//! take a [`SelectQuery`] carrying a compiled filter (which a SQL-backed
//! driver lowers via [`crate::filter::CompiledFilter::to_sql`] and the
//! in-memory driver evaluates directly), and writes go through operations
//! that the driver must execute transactionally.
//!
//! ## Transactional discipline
//!
//! Every write operation commits, in one transaction: (a) the mutation,
//! (b) the read-back of the affected row, and (c) a changelog entry with a
//! sequence generated inside the transaction. Drivers return the committed
//! [`ChangelogEntry`]; the pipeline publishes it to the in-process broker
//! after the call returns. Replicas tailing the persisted log therefore see
//! a total order consistent with commit order.
//!
//! ## Optimistic preconditions
//!
//! Conditional writes pass the previously observed row as `expected`. The
//! driver compares it with the current row inside the transaction and fails
//! with [`StorageError::PreconditionFailed`] carrying the current state, so
//! the pipeline can attach the winner's ETag to the 412.

pub mod keyset;
mod memory;

pub use memory::MemoryDriver;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::changelog::ChangelogEntry;
use crate::filter::CompiledFilter;
use crate::models::Record;

/// Column types, used for schema validation and driver-side coercions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Float,
    Text,
    Boolean,
    Timestamp,
    Json,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ColumnType,
}

/// Opaque table handle understood by the storage driver: the table name,
/// its column handles and the primary key column.
#[derive(Debug, Clone, PartialEq)]
pub struct TableHandle {
    name: String,
    primary_key: String,
    columns: Vec<ColumnDef>,
}

impl TableHandle {
    pub fn new(name: &str, primary_key: &str) -> Self {
        Self { name: name.to_owned(), primary_key: primary_key.to_owned(), columns: Vec::new() }
    }

    /// Declares a column. Builder-style, used at configuration time.
    pub fn column(mut self, name: &str, ty: ColumnType) -> Self {
        self.columns.push(ColumnDef { name: name.to_owned(), ty });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn column_def(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_def(name).is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderKey {
    pub field: String,
    pub direction: Direction,
}

impl OrderKey {
    pub fn asc(field: &str) -> Self {
        Self { field: field.to_owned(), direction: Direction::Asc }
    }

    pub fn desc(field: &str) -> Self {
        Self { field: field.to_owned(), direction: Direction::Desc }
    }
}

/// The keyset boundary: one value per order key (the primary key is always
/// the final key). A row qualifies when it sorts strictly after the bound.
#[derive(Debug, Clone, PartialEq)]
pub struct KeysetBound {
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct SelectQuery {
    pub filter: Option<Arc<CompiledFilter>>,
    /// Order keys; the pipeline guarantees the primary key is the last one.
    pub order: Vec<OrderKey>,
    pub limit: Option<usize>,
    pub after: Option<KeysetBound>,
}

/// Aggregation request: `group_by` columns plus the accumulators to compute
/// per group. An empty `group_by` folds the whole selection into one group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateSpec {
    pub group_by: Vec<String>,
    pub count: bool,
    pub sum: Vec<String>,
    pub avg: Vec<String>,
    pub min: Vec<String>,
    pub max: Vec<String>,
}

impl AggregateSpec {
    pub fn is_empty(&self) -> bool {
        !self.count
            && self.sum.is_empty()
            && self.avg.is_empty()
            && self.min.is_empty()
            && self.max.is_empty()
    }

    /// Every column the spec touches, for schema validation.
    pub fn referenced_columns(&self) -> impl Iterator<Item = &str> {
        self.group_by
            .iter()
            .chain(&self.sum)
            .chain(&self.avg)
            .chain(&self.min)
            .chain(&self.max)
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AggregateGroup {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<Record>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(skip_serializing_if = "Record::is_empty", default)]
    pub sum: Record,
    #[serde(skip_serializing_if = "Record::is_empty", default)]
    pub avg: Record,
    #[serde(skip_serializing_if = "Record::is_empty", default)]
    pub min: Record,
    #[serde(skip_serializing_if = "Record::is_empty", default)]
    pub max: Record,
}

/// Write metadata the driver persists with the changelog entry.
#[derive(Debug, Clone, Default)]
pub struct WriteContext {
    pub resource: String,
    pub user_id: Option<String>,
    /// When configured, the driver increments this column in the same
    /// transaction as the write (the strong-ETag version counter).
    pub version_field: Option<String>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("Could not find {0} with id `{1}`!")]
    NotFound(String, String),
    #[error("The entity {0} with id {1} was already present!")]
    DuplicateEntry(String, String),
    #[error("Concurrent modification of {entity} detected")]
    PreconditionFailed { entity: String, current: Box<Record> },
    #[error("Unknown column `{0}`")]
    UnknownColumn(String),
    #[error("Currently unsupported operation: {0}")]
    Unsupported(String),
    #[error("Unexpected storage error: {0}")]
    Unexpected(String),
}

/// The storage backend contract.
///
/// All operations receive the table handle; drivers are not confined to a
/// single table and a single driver instance backs every resource sharing
/// the database. Reads are plain; writes follow the transactional
/// discipline documented at module level.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    async fn select(
        &self,
        table: &TableHandle,
        query: &SelectQuery,
    ) -> Result<Vec<Record>, StorageError>;

    async fn get_by_id(
        &self,
        table: &TableHandle,
        id: &str,
    ) -> Result<Option<Record>, StorageError>;

    async fn count(
        &self,
        table: &TableHandle,
        filter: Option<&CompiledFilter>,
    ) -> Result<u64, StorageError>;

    async fn aggregate(
        &self,
        table: &TableHandle,
        filter: Option<&CompiledFilter>,
        spec: &AggregateSpec,
    ) -> Result<Vec<AggregateGroup>, StorageError>;

    async fn insert(
        &self,
        table: &TableHandle,
        row: Record,
        ctx: &WriteContext,
    ) -> Result<ChangelogEntry, StorageError>;

    /// All-or-nothing batch insert: one transaction, one changelog entry
    /// per row, contiguous sequences.
    async fn insert_many(
        &self,
        table: &TableHandle,
        rows: Vec<Record>,
        ctx: &WriteContext,
    ) -> Result<Vec<ChangelogEntry>, StorageError>;

    async fn update(
        &self,
        table: &TableHandle,
        id: &str,
        patch: Record,
        expected: Option<&Record>,
        ctx: &WriteContext,
    ) -> Result<ChangelogEntry, StorageError>;

    /// Full-row replacement. Columns absent from `row` are cleared.
    async fn replace(
        &self,
        table: &TableHandle,
        id: &str,
        row: Record,
        expected: Option<&Record>,
        ctx: &WriteContext,
    ) -> Result<ChangelogEntry, StorageError>;

    async fn delete(
        &self,
        table: &TableHandle,
        id: &str,
        expected: Option<&Record>,
        ctx: &WriteContext,
    ) -> Result<ChangelogEntry, StorageError>;

    /// Bulk update of every row matching the filter (`None` matches all).
    /// One transaction, one changelog entry per affected row.
    async fn update_where(
        &self,
        table: &TableHandle,
        filter: Option<&CompiledFilter>,
        patch: Record,
        ctx: &WriteContext,
    ) -> Result<Vec<ChangelogEntry>, StorageError>;

    async fn delete_where(
        &self,
        table: &TableHandle,
        filter: Option<&CompiledFilter>,
        ctx: &WriteContext,
    ) -> Result<Vec<ChangelogEntry>, StorageError>;

    /// The changelog high-water mark, read under the same serialisation as
    /// writes so a subsequent select observes at least this sequence.
    async fn current_seq(&self, table: &TableHandle) -> Result<u64, StorageError>;

    /// Subscription snapshot: matching rows plus the high-water mark they
    /// are consistent with. The default reads the mark first and selects
    /// afterwards (read-committed: a write landing in between appears in
    /// both the snapshot and the tail, which the tail consumer de-dupes by
    /// sequence); drivers that can take both under one view should.
    async fn snapshot(
        &self,
        table: &TableHandle,
        query: &SelectQuery,
    ) -> Result<(Vec<Record>, u64), StorageError> {
        let seq = self.current_seq(table).await?;
        let rows = self.select(table, query).await?;
        Ok((rows, seq))
    }
}
