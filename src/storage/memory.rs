//! In-memory reference driver.
//!
//! Tables, the changelog sequence and the persisted log all live behind one
//! async mutex, which is the whole transactional story: every write op runs
//! its mutation, the row read-back and the changelog append inside a single
//! critical section, so sequences are monotone in commit order and batch
//! writes are all-or-nothing.
//!
//! Filters evaluate through the record evaluator; this driver never sees
//! SQL. It is the backend the test-suite (and any single-process deployment
//! without a database) runs against.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::instrument;

use super::keyset;
use super::{
    AggregateGroup, AggregateSpec, SelectQuery, StorageDriver, StorageError, TableHandle,
    WriteContext,
};
use crate::changelog::{ChangeOp, ChangelogEntry};
use crate::filter::{to_number, CompiledFilter};
use crate::models::{id_matches, id_to_string, Record};

#[derive(Default)]
struct MemoryInner {
    tables: HashMap<String, Vec<Record>>,
    log: Vec<ChangelogEntry>,
    seq: u64,
}

#[derive(Default)]
pub struct MemoryDriver {
    inner: Mutex<MemoryInner>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// The persisted log from `from_seq`, for tests and replication probes.
    pub async fn log_from(&self, from_seq: u64) -> Vec<ChangelogEntry> {
        self.inner
            .lock()
            .await
            .log
            .iter()
            .filter(|e| e.seq >= from_seq)
            .cloned()
            .collect()
    }
}

impl MemoryInner {
    fn rows(&self, table: &TableHandle) -> &[Record] {
        self.tables
            .get(table.name())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn rows_mut(&mut self, table: &TableHandle) -> &mut Vec<Record> {
        self.tables.entry(table.name().to_owned()).or_default()
    }

    fn position(&self, table: &TableHandle, id: &str) -> Option<usize> {
        let pk = table.primary_key();
        self.rows(table)
            .iter()
            .position(|row| row.get(pk).map(|v| id_matches(v, id)).unwrap_or(false))
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn append(
        &mut self,
        op: ChangeOp,
        record_id: String,
        before: Option<Record>,
        after: Option<Record>,
        ctx: &WriteContext,
    ) -> ChangelogEntry {
        let entry = ChangelogEntry {
            seq: self.next_seq(),
            resource: ctx.resource.clone(),
            record_id,
            op,
            before,
            after,
            user_id: ctx.user_id.clone(),
            ts: Utc::now(),
        };
        self.log.push(entry.clone());
        entry
    }

    fn check_precondition(
        &self,
        table: &TableHandle,
        current: &Record,
        expected: Option<&Record>,
    ) -> Result<(), StorageError> {
        if let Some(expected) = expected {
            if current != expected {
                return Err(StorageError::PreconditionFailed {
                    entity: table.name().to_owned(),
                    current: Box::new(current.clone()),
                });
            }
        }
        Ok(())
    }

    fn insert_row(
        &mut self,
        table: &TableHandle,
        mut row: Record,
        ctx: &WriteContext,
    ) -> Result<ChangelogEntry, StorageError> {
        let pk = table.primary_key();
        let id = match row.get(pk) {
            Some(v) if !v.is_null() => id_to_string(v),
            _ => {
                return Err(StorageError::Unsupported(format!(
                    "insert into {} without a `{pk}` value",
                    table.name()
                )))
            }
        };
        if self.position(table, &id).is_some() {
            return Err(StorageError::DuplicateEntry(table.name().to_owned(), id));
        }
        if let Some(version_field) = &ctx.version_field {
            row.entry(version_field.clone()).or_insert(Value::from(1));
        }
        self.rows_mut(table).push(row.clone());
        Ok(self.append(ChangeOp::Create, id, None, Some(row), ctx))
    }

    fn bump_version(row: &mut Record, ctx: &WriteContext) {
        if let Some(version_field) = &ctx.version_field {
            let next = row
                .get(version_field)
                .and_then(Value::as_i64)
                .unwrap_or(0)
                + 1;
            row.insert(version_field.clone(), Value::from(next));
        }
    }

    fn run_select(&self, table: &TableHandle, query: &SelectQuery) -> Vec<Record> {
        let mut rows: Vec<Record> = self
            .rows(table)
            .iter()
            .filter(|row| {
                query
                    .filter
                    .as_ref()
                    .map(|f| f.matches(row))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();

        if !query.order.is_empty() {
            rows.sort_by(|a, b| keyset::row_cmp(a, b, &query.order));
        }
        if let (Some(bound), false) = (&query.after, query.order.is_empty()) {
            rows.retain(|row| {
                keyset::row_vs_bound(row, bound, &query.order) == Ordering::Greater
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        rows
    }

    fn update_row(
        &mut self,
        table: &TableHandle,
        idx: usize,
        patch: &Record,
        ctx: &WriteContext,
    ) -> ChangelogEntry {
        let rows = self.rows_mut(table);
        let before = rows[idx].clone();
        let mut after = before.clone();
        for (key, value) in patch {
            after.insert(key.clone(), value.clone());
        }
        Self::bump_version(&mut after, ctx);
        rows[idx] = after.clone();
        let id = id_to_string(after.get(table.primary_key()).unwrap_or(&Value::Null));
        self.append(ChangeOp::Update, id, Some(before), Some(after), ctx)
    }
}

#[async_trait]
impl StorageDriver for MemoryDriver {
    #[instrument(skip_all, fields(table = table.name()))]
    async fn select(
        &self,
        table: &TableHandle,
        query: &SelectQuery,
    ) -> Result<Vec<Record>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner.run_select(table, query))
    }

    async fn get_by_id(
        &self,
        table: &TableHandle,
        id: &str,
    ) -> Result<Option<Record>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner.position(table, id).map(|idx| inner.rows(table)[idx].clone()))
    }

    async fn count(
        &self,
        table: &TableHandle,
        filter: Option<&CompiledFilter>,
    ) -> Result<u64, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rows(table)
            .iter()
            .filter(|row| filter.map(|f| f.matches(row)).unwrap_or(true))
            .count() as u64)
    }

    async fn aggregate(
        &self,
        table: &TableHandle,
        filter: Option<&CompiledFilter>,
        spec: &AggregateSpec,
    ) -> Result<Vec<AggregateGroup>, StorageError> {
        let inner = self.inner.lock().await;
        let rows: Vec<&Record> = inner
            .rows(table)
            .iter()
            .filter(|row| filter.map(|f| f.matches(row)).unwrap_or(true))
            .collect();

        let mut groups: Vec<(Option<Record>, Vec<&Record>)> = Vec::new();
        if spec.group_by.is_empty() {
            groups.push((None, rows));
        } else {
            for row in rows {
                let mut key = Record::new();
                for col in &spec.group_by {
                    key.insert(col.clone(), row.get(col).cloned().unwrap_or(Value::Null));
                }
                match groups.iter_mut().find(|(k, _)| k.as_ref() == Some(&key)) {
                    Some((_, members)) => members.push(row),
                    None => groups.push((Some(key), vec![row])),
                }
            }
        }

        Ok(groups
            .into_iter()
            .map(|(key, members)| fold_group(key, &members, spec))
            .collect())
    }

    #[instrument(skip_all, fields(table = table.name()))]
    async fn insert(
        &self,
        table: &TableHandle,
        row: Record,
        ctx: &WriteContext,
    ) -> Result<ChangelogEntry, StorageError> {
        let mut inner = self.inner.lock().await;
        inner.insert_row(table, row, ctx)
    }

    async fn insert_many(
        &self,
        table: &TableHandle,
        rows: Vec<Record>,
        ctx: &WriteContext,
    ) -> Result<Vec<ChangelogEntry>, StorageError> {
        let mut inner = self.inner.lock().await;
        // Dry-run the uniqueness checks first so the batch stays atomic.
        let pk = table.primary_key();
        let mut seen: Vec<String> = Vec::with_capacity(rows.len());
        for row in &rows {
            let id = row
                .get(pk)
                .filter(|v| !v.is_null())
                .map(id_to_string)
                .ok_or_else(|| {
                    StorageError::Unsupported(format!(
                        "insert into {} without a `{pk}` value",
                        table.name()
                    ))
                })?;
            if seen.contains(&id) || inner.position(table, &id).is_some() {
                return Err(StorageError::DuplicateEntry(table.name().to_owned(), id));
            }
            seen.push(id);
        }
        rows.into_iter()
            .map(|row| inner.insert_row(table, row, ctx))
            .collect()
    }

    #[instrument(skip_all, fields(table = table.name(), id = id))]
    async fn update(
        &self,
        table: &TableHandle,
        id: &str,
        patch: Record,
        expected: Option<&Record>,
        ctx: &WriteContext,
    ) -> Result<ChangelogEntry, StorageError> {
        let mut inner = self.inner.lock().await;
        let idx = inner
            .position(table, id)
            .ok_or_else(|| StorageError::NotFound(table.name().to_owned(), id.to_owned()))?;
        inner.check_precondition(table, &inner.rows(table)[idx].clone(), expected)?;
        Ok(inner.update_row(table, idx, &patch, ctx))
    }

    async fn replace(
        &self,
        table: &TableHandle,
        id: &str,
        mut row: Record,
        expected: Option<&Record>,
        ctx: &WriteContext,
    ) -> Result<ChangelogEntry, StorageError> {
        let mut inner = self.inner.lock().await;
        let idx = inner
            .position(table, id)
            .ok_or_else(|| StorageError::NotFound(table.name().to_owned(), id.to_owned()))?;
        let before = inner.rows(table)[idx].clone();
        inner.check_precondition(table, &before, expected)?;

        let pk = table.primary_key();
        row.insert(pk.to_owned(), before.get(pk).cloned().unwrap_or(Value::Null));
        if let Some(version_field) = &ctx.version_field {
            // Replacement keeps the version counter: it lives beside the
            // row, not inside the caller's payload.
            row.insert(
                version_field.clone(),
                before.get(version_field).cloned().unwrap_or(Value::from(0)),
            );
        }
        MemoryInner::bump_version(&mut row, ctx);
        inner.rows_mut(table)[idx] = row.clone();
        Ok(inner.append(ChangeOp::Update, id.to_owned(), Some(before), Some(row), ctx))
    }

    #[instrument(skip_all, fields(table = table.name(), id = id))]
    async fn delete(
        &self,
        table: &TableHandle,
        id: &str,
        expected: Option<&Record>,
        ctx: &WriteContext,
    ) -> Result<ChangelogEntry, StorageError> {
        let mut inner = self.inner.lock().await;
        let idx = inner
            .position(table, id)
            .ok_or_else(|| StorageError::NotFound(table.name().to_owned(), id.to_owned()))?;
        inner.check_precondition(table, &inner.rows(table)[idx].clone(), expected)?;
        let before = inner.rows_mut(table).remove(idx);
        Ok(inner.append(ChangeOp::Delete, id.to_owned(), Some(before), None, ctx))
    }

    async fn update_where(
        &self,
        table: &TableHandle,
        filter: Option<&CompiledFilter>,
        patch: Record,
        ctx: &WriteContext,
    ) -> Result<Vec<ChangelogEntry>, StorageError> {
        let mut inner = self.inner.lock().await;
        let matching: Vec<usize> = inner
            .rows(table)
            .iter()
            .enumerate()
            .filter(|(_, row)| filter.map(|f| f.matches(row)).unwrap_or(true))
            .map(|(idx, _)| idx)
            .collect();
        Ok(matching
            .into_iter()
            .map(|idx| inner.update_row(table, idx, &patch, ctx))
            .collect())
    }

    async fn delete_where(
        &self,
        table: &TableHandle,
        filter: Option<&CompiledFilter>,
        ctx: &WriteContext,
    ) -> Result<Vec<ChangelogEntry>, StorageError> {
        let mut inner = self.inner.lock().await;
        let pk = table.primary_key();
        let matches = |row: &Record| filter.map(|f| f.matches(row)).unwrap_or(true);
        let doomed: Vec<Record> = inner
            .rows(table)
            .iter()
            .filter(|row| matches(row))
            .cloned()
            .collect();
        inner.rows_mut(table).retain(|row| !matches(row));
        Ok(doomed
            .into_iter()
            .map(|before| {
                let id = id_to_string(before.get(pk).unwrap_or(&Value::Null));
                inner.append(ChangeOp::Delete, id, Some(before), None, ctx)
            })
            .collect())
    }

    async fn current_seq(&self, _table: &TableHandle) -> Result<u64, StorageError> {
        Ok(self.inner.lock().await.seq)
    }

    async fn snapshot(
        &self,
        table: &TableHandle,
        query: &SelectQuery,
    ) -> Result<(Vec<Record>, u64), StorageError> {
        // One critical section: rows and mark cannot diverge.
        let inner = self.inner.lock().await;
        Ok((inner.run_select(table, query), inner.seq))
    }
}

fn fold_group(key: Option<Record>, members: &[&Record], spec: &AggregateSpec) -> AggregateGroup {
    let mut group = AggregateGroup { key, ..Default::default() };
    if spec.count {
        group.count = Some(members.len() as u64);
    }
    for col in &spec.sum {
        group.sum.insert(col.clone(), Value::from(numeric_values(members, col).sum::<f64>()));
    }
    for col in &spec.avg {
        let values: Vec<f64> = numeric_values(members, col).collect();
        let avg = if values.is_empty() {
            Value::Null
        } else {
            Value::from(values.iter().sum::<f64>() / values.len() as f64)
        };
        group.avg.insert(col.clone(), avg);
    }
    for col in &spec.min {
        group.min.insert(col.clone(), extremum(members, col, Ordering::Less));
    }
    for col in &spec.max {
        group.max.insert(col.clone(), extremum(members, col, Ordering::Greater));
    }
    group
}

fn numeric_values<'a>(members: &'a [&Record], col: &'a str) -> impl Iterator<Item = f64> + 'a {
    members.iter().filter_map(move |row| row.get(col).and_then(to_number))
}

fn extremum(members: &[&Record], col: &str, want: Ordering) -> Value {
    members
        .iter()
        .filter_map(|row| row.get(col))
        .filter(|v| !v.is_null())
        .fold(None::<&Value>, |best, v| match best {
            None => Some(v),
            Some(current) => {
                if keyset::value_cmp(Some(v), Some(current)) == want {
                    Some(v)
                } else {
                    Some(current)
                }
            }
        })
        .cloned()
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ColumnType, Direction, KeysetBound, OrderKey};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn users() -> TableHandle {
        TableHandle::new("users", "id")
            .column("id", ColumnType::Text)
            .column("name", ColumnType::Text)
            .column("age", ColumnType::Integer)
            .column("role", ColumnType::Text)
    }

    fn ctx() -> WriteContext {
        WriteContext { resource: "users".to_owned(), user_id: None, version_field: None }
    }

    fn row(id: &str, name: &str, age: i64, role: &str) -> Record {
        json!({"id": id, "name": name, "age": age, "role": role})
            .as_object()
            .unwrap()
            .clone()
    }

    async fn seeded() -> MemoryDriver {
        let driver = MemoryDriver::new();
        let table = users();
        driver.insert(&table, row("u1", "Alice", 30, "admin"), &ctx()).await.unwrap();
        driver.insert(&table, row("u2", "Bob", 25, "user"), &ctx()).await.unwrap();
        driver.insert(&table, row("u3", "Charlie", 35, "user"), &ctx()).await.unwrap();
        driver
    }

    #[tokio::test]
    async fn filtered_select_and_count() {
        let driver = seeded().await;
        let filter = Arc::new(CompiledFilter::compile("age>=30").unwrap());
        let query = SelectQuery { filter: Some(filter.clone()), ..Default::default() };
        let rows = driver.select(&users(), &query).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(driver.count(&users(), Some(&filter)).await.unwrap(), 2);
        assert_eq!(driver.count(&users(), None).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn keyset_pagination_is_disjoint_and_ordered() {
        let driver = seeded().await;
        let order = vec![OrderKey::asc("age"), OrderKey::asc("id")];
        let query = SelectQuery { order: order.clone(), limit: Some(2), ..Default::default() };
        let page1 = driver.select(&users(), &query).await.unwrap();
        assert_eq!(page1[0]["name"], "Bob");
        assert_eq!(page1[1]["name"], "Alice");

        let bound = keyset::bound_from_row(&page1[1], &order);
        let query = SelectQuery {
            order: order.clone(),
            limit: Some(2),
            after: Some(bound),
            ..Default::default()
        };
        let page2 = driver.select(&users(), &query).await.unwrap();
        assert_eq!(page2.len(), 1);
        assert_eq!(page2[0]["name"], "Charlie");
    }

    #[tokio::test]
    async fn desc_order_with_bound() {
        let driver = seeded().await;
        let order = vec![OrderKey::desc("age"), OrderKey::asc("id")];
        let bound = KeysetBound { values: vec![json!(35), json!("u3")] };
        let query =
            SelectQuery { order: order.clone(), after: Some(bound), ..Default::default() };
        let rows = driver.select(&users(), &query).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["age"], 30);
        assert_eq!(rows[0]["age"]
            .as_i64()
            .unwrap()
            .cmp(&rows[1]["age"].as_i64().unwrap()), Ordering::Greater);
        assert_eq!(order[0].direction, Direction::Desc);
    }

    #[tokio::test]
    async fn sequences_are_monotonic_and_logged() {
        let driver = seeded().await;
        let entry = driver
            .update(&users(), "u2", row("u2", "Bob", 26, "user"), None, &ctx())
            .await
            .unwrap();
        assert_eq!(entry.seq, 4);
        assert_eq!(entry.op, ChangeOp::Update);
        assert_eq!(entry.before.as_ref().unwrap()["age"], 25);
        assert_eq!(entry.after.as_ref().unwrap()["age"], 26);

        let log = driver.log_from(1).await;
        assert_eq!(log.len(), 4);
        assert!(log.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[tokio::test]
    async fn precondition_mismatch_carries_current_row() {
        let driver = seeded().await;
        let stale = row("u1", "Alice", 29, "admin");
        let err = driver
            .update(&users(), "u1", row("u1", "Alicia", 30, "admin"), Some(&stale), &ctx())
            .await
            .unwrap_err();
        match err {
            StorageError::PreconditionFailed { current, .. } => {
                assert_eq!(current["age"], 30);
            }
            other => panic!("expected precondition failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn version_field_increments_in_the_same_write() {
        let driver = MemoryDriver::new();
        let table = users();
        let ctx = WriteContext {
            resource: "users".to_owned(),
            user_id: None,
            version_field: Some("rev".to_owned()),
        };
        driver.insert(&table, row("u1", "Alice", 30, "admin"), &ctx).await.unwrap();
        let stored = driver.get_by_id(&table, "u1").await.unwrap().unwrap();
        assert_eq!(stored["rev"], 1);

        let entry = driver
            .update(&table, "u1", json!({"age": 31}).as_object().unwrap().clone(), None, &ctx)
            .await
            .unwrap();
        assert_eq!(entry.after.as_ref().unwrap()["rev"], 2);
    }

    #[tokio::test]
    async fn replace_clears_unlisted_columns_and_keeps_pk() {
        let driver = seeded().await;
        let replacement = json!({"name": "Al", "age": 31}).as_object().unwrap().clone();
        driver.replace(&users(), "u1", replacement, None, &ctx()).await.unwrap();
        let stored = driver.get_by_id(&users(), "u1").await.unwrap().unwrap();
        assert_eq!(stored["id"], "u1");
        assert_eq!(stored["name"], "Al");
        assert_eq!(stored.get("role"), None);
    }

    #[tokio::test]
    async fn batch_insert_is_atomic() {
        let driver = seeded().await;
        let err = driver
            .insert_many(
                &users(),
                vec![row("u9", "New", 1, "user"), row("u1", "Dup", 2, "user")],
                &ctx(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::DuplicateEntry(_, _)));
        assert_eq!(driver.get_by_id(&users(), "u9").await.unwrap(), None);
        assert_eq!(driver.count(&users(), None).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn bulk_update_and_delete() {
        let driver = seeded().await;
        let filter = CompiledFilter::compile("role==\"user\"").unwrap();
        let patch = json!({"role": "member"}).as_object().unwrap().clone();
        let entries =
            driver.update_where(&users(), Some(&filter), patch, &ctx()).await.unwrap();
        assert_eq!(entries.len(), 2);

        let filter = CompiledFilter::compile("role==\"member\"").unwrap();
        let entries = driver.delete_where(&users(), Some(&filter), &ctx()).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(driver.count(&users(), None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn aggregation_folds_groups() {
        let driver = seeded().await;
        let spec = AggregateSpec {
            group_by: vec!["role".to_owned()],
            count: true,
            avg: vec!["age".to_owned()],
            max: vec!["age".to_owned()],
            ..Default::default()
        };
        let mut groups = driver.aggregate(&users(), None, &spec).await.unwrap();
        groups.sort_by_key(|g| {
            g.key.as_ref().and_then(|k| k["role"].as_str().map(str::to_owned))
        });
        assert_eq!(groups.len(), 2);
        let admins = &groups[0];
        assert_eq!(admins.count, Some(1));
        assert_eq!(admins.avg["age"], 30.0);
        let members = &groups[1];
        assert_eq!(members.count, Some(2));
        assert_eq!(members.avg["age"], 30.0);
        assert_eq!(members.max["age"], 35);
    }

    #[tokio::test]
    async fn current_seq_tracks_writes() {
        let driver = seeded().await;
        assert_eq!(driver.current_seq(&users()).await.unwrap(), 3);
    }
}
