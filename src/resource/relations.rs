//! Relation loading.
//!
//! Parses `include=` specs and stitches related rows onto parents with one
//! batched query per relation (two for manyToMany): no per-parent queries,
//! whatever the parent count. Options inside an include segment:
//! `select:a,b`, `limit:n`, `filter:expr` — the filter compiles against the
//! target table, not the parent.
//!
//! ```text
//! include=author,posts(limit:5;filter:published==true;select:id,title)
//! include=author.posts.comments          -- nested, capped by max depth
//! ```

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::descriptor::{RelationDef, RelationKind};
use crate::error::ApiError;
use crate::filter::{Comparison, CompiledFilter, FilterNode, FilterValue, Op};
use crate::models::{id_to_string, Record};
use crate::scope::builder;
use crate::storage::{SelectQuery, StorageDriver};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct IncludeSpec {
    pub name: String,
    pub select: Option<Vec<String>>,
    pub limit: Option<usize>,
    pub filter: Option<String>,
    pub children: Vec<IncludeSpec>,
}

/// Splits on `sep` at paren depth zero.
fn split_top_level(input: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in input.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            c if c == sep && depth == 0 => {
                parts.push(std::mem::take(&mut current));
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

/// Parses a full `include=` parameter into merged specs.
pub fn parse_include(raw: &str, max_depth: usize) -> Result<Vec<IncludeSpec>, ApiError> {
    let mut specs: Vec<IncludeSpec> = Vec::new();
    for item in split_top_level(raw, ',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let path = split_top_level(item, '.');
        if path.len() > max_depth {
            return Err(ApiError::Validation(format!(
                "include `{item}` exceeds the maximum relation depth of {max_depth}"
            )));
        }
        merge_path(&mut specs, &path)?;
    }
    Ok(specs)
}

fn merge_path(specs: &mut Vec<IncludeSpec>, path: &[String]) -> Result<(), ApiError> {
    let Some((head, rest)) = path.split_first() else {
        return Ok(());
    };
    let parsed = parse_segment(head)?;
    let entry = match specs.iter_mut().find(|s| s.name == parsed.name) {
        Some(existing) => {
            // Later segments may carry the options (`a,a.b(limit:2)`).
            if parsed.select.is_some() {
                existing.select = parsed.select;
            }
            if parsed.limit.is_some() {
                existing.limit = parsed.limit;
            }
            if parsed.filter.is_some() {
                existing.filter = parsed.filter;
            }
            existing
        }
        None => {
            specs.push(parsed);
            specs.last_mut().expect("just pushed")
        }
    };
    merge_path(&mut entry.children, rest)
}

fn parse_segment(segment: &str) -> Result<IncludeSpec, ApiError> {
    let segment = segment.trim();
    let (name, options) = match segment.split_once('(') {
        Some((name, rest)) => {
            let options = rest
                .strip_suffix(')')
                .ok_or_else(|| ApiError::Validation(format!("unbalanced include `{segment}`")))?;
            (name.trim(), Some(options))
        }
        None => (segment, None),
    };
    if name.is_empty() {
        return Err(ApiError::Validation(format!("empty relation name in `{segment}`")));
    }

    let mut spec = IncludeSpec { name: name.to_owned(), ..Default::default() };
    if let Some(options) = options {
        for option in split_top_level(options, ';') {
            let Some((key, value)) = option.split_once(':') else {
                return Err(ApiError::Validation(format!("malformed include option `{option}`")));
            };
            match key.trim() {
                "select" => {
                    spec.select = Some(
                        value.split(',').map(|s| s.trim().to_owned()).collect(),
                    );
                }
                "limit" => {
                    let limit = value.trim().parse::<usize>().map_err(|_| {
                        ApiError::Validation(format!("include limit `{value}` is not a number"))
                    })?;
                    spec.limit = Some(limit);
                }
                "filter" => spec.filter = Some(value.trim().to_owned()),
                other => {
                    return Err(ApiError::Validation(format!(
                        "unknown include option `{other}`"
                    )))
                }
            }
        }
    }
    Ok(spec)
}

fn split_relation_path(field: &str, relations: &HashMap<String, RelationDef>) -> Option<(String, String)> {
    let (head, rest) = field.split_once('.')?;
    relations
        .contains_key(head)
        .then(|| (head.to_owned(), rest.to_owned()))
}

/// Rejects relation paths anywhere in the node. Used for the non-conjunct
/// positions of [`peel`] and for surfaces that evaluate per record (the
/// subscription tail), where a membership snapshot would go stale.
pub fn ensure_local(
    node: &FilterNode,
    relations: &HashMap<String, RelationDef>,
) -> Result<(), ApiError> {
    let mut offender: Option<String> = None;
    node.for_each_leaf(&mut |cmp: &Comparison| {
        if offender.is_none() && split_relation_path(&cmp.field, relations).is_some() {
            offender = Some(cmp.field.clone());
        }
    });
    match offender {
        Some(field) => Err(ApiError::Validation(format!(
            "relation filter `{field}` is only supported as a top-level conjunct"
        ))),
        None => Ok(()),
    }
}

/// Separates a filter into its local predicate and the relation-path
/// predicates (`author.name=="X"`) found among the top-level conjuncts.
/// The path head is stripped, so the peeled predicate reads against the
/// target table. A relation path under a disjunction has no single-table
/// rendering and is rejected.
pub fn peel(
    node: FilterNode,
    relations: &HashMap<String, RelationDef>,
) -> Result<(Option<FilterNode>, Vec<(String, FilterNode)>), ApiError> {
    let mut local = Vec::new();
    let mut peeled = Vec::new();
    collect_conjuncts(node, relations, &mut local, &mut peeled)?;
    let local = match local.len() {
        0 => None,
        1 => local.pop(),
        _ => Some(FilterNode::And(local)),
    };
    Ok((local, peeled))
}

fn collect_conjuncts(
    node: FilterNode,
    relations: &HashMap<String, RelationDef>,
    local: &mut Vec<FilterNode>,
    peeled: &mut Vec<(String, FilterNode)>,
) -> Result<(), ApiError> {
    match node {
        FilterNode::And(children) => {
            for child in children {
                collect_conjuncts(child, relations, local, peeled)?;
            }
        }
        FilterNode::Leaf(cmp) => match split_relation_path(&cmp.field, relations) {
            Some((head, rest)) => {
                peeled.push((head, FilterNode::Leaf(Comparison { field: rest, ..cmp })));
            }
            None => local.push(FilterNode::Leaf(cmp)),
        },
        other => {
            ensure_local(&other, relations)?;
            local.push(other);
        }
    }
    Ok(())
}

/// Resolves relation-path predicates into local membership predicates:
/// the matching target rows are fetched once per relation (a batched
/// semi-join) and reduced to an `IN` set over the parent's join column.
/// Returns a fully-local filter both evaluators understand. Nested paths
/// (`author.posts.title`) recurse through the target's own relations,
/// bounded by `depth`.
pub fn resolve_filters<'a>(
    driver: &'a Arc<dyn StorageDriver>,
    relations: &'a HashMap<String, RelationDef>,
    node: FilterNode,
    depth: usize,
) -> BoxFuture<'a, Result<Option<FilterNode>, ApiError>> {
    async move {
        let (mut local, peeled) = peel(node, relations)?;
        if peeled.is_empty() {
            return Ok(local);
        }
        if depth == 0 {
            return Err(ApiError::Validation(
                "relation filter exceeds the maximum relation depth".to_owned(),
            ));
        }

        // Several predicates on the same relation share one semi-join.
        let mut grouped: Vec<(String, FilterNode)> = Vec::new();
        for (name, predicate) in peeled {
            match grouped.iter_mut().find(|(existing, _)| *existing == name) {
                Some((_, existing)) => {
                    let prior = std::mem::replace(existing, FilterNode::And(Vec::new()));
                    *existing = prior.and(predicate);
                }
                None => grouped.push((name, predicate)),
            }
        }

        for (name, predicate) in grouped {
            let def = relations
                .get(&name)
                .expect("peel only yields configured relations");
            let membership = semi_join(driver, def, predicate, depth).await?;
            local = Some(match local {
                Some(node) => node.and(membership),
                None => membership,
            });
        }
        Ok(local)
    }
    .boxed()
}

async fn semi_join(
    driver: &Arc<dyn StorageDriver>,
    def: &RelationDef,
    predicate: FilterNode,
    depth: usize,
) -> Result<FilterNode, ApiError> {
    let resolved = resolve_filters(driver, &def.relations, predicate, depth - 1).await?;
    let filter = match resolved {
        Some(node) => Some(Arc::new(CompiledFilter::from_node(node)?)),
        None => None,
    };
    let query = SelectQuery { filter, ..Default::default() };

    match def.kind {
        RelationKind::BelongsTo => {
            let targets = driver.select(&def.target, &query).await?;
            Ok(membership(&def.foreign_key, &gather_keys(&targets, &def.references)))
        }
        RelationKind::HasOne | RelationKind::HasMany => {
            let targets = driver.select(&def.target, &query).await?;
            Ok(membership(&def.references, &gather_keys(&targets, &def.foreign_key)))
        }
        RelationKind::ManyToMany => {
            let through = def
                .through
                .as_ref()
                .ok_or_else(|| ApiError::Internal("manyToMany without through".to_owned()))?;
            let targets = driver.select(&def.target, &query).await?;
            let target_keys = gather_keys(&targets, &def.references);
            if target_keys.is_empty() {
                return Ok(membership(&def.foreign_key, &[]));
            }
            let join_filter = in_filter(&through.target_key, &target_keys)?;
            let join_query =
                SelectQuery { filter: Some(Arc::new(join_filter)), ..Default::default() };
            let join_rows = driver.select(&through.table, &join_query).await?;
            Ok(membership(&def.foreign_key, &gather_keys(&join_rows, &through.source_key)))
        }
    }
}

/// `column IN (keys…)`. An empty key set stays an empty tuple, which both
/// lowerings treat as never-true.
fn membership(column: &str, keys: &[Value]) -> FilterNode {
    let members = keys.iter().filter_map(value_to_filter).collect();
    FilterNode::Leaf(Comparison::new(column, Op::In, FilterValue::Tuple(members)))
}

fn value_to_filter(value: &Value) -> Option<FilterValue> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(FilterValue::Bool(*b)),
        Value::Number(n) => n.as_f64().map(FilterValue::Number),
        Value::String(s) => Some(FilterValue::Str(s.clone())),
        other => Some(FilterValue::Str(other.to_string())),
    }
}

/// Distinct non-null values of `column` across `rows`.
fn gather_keys(rows: &[Record], column: &str) -> Vec<Value> {
    let mut keys: Vec<Value> = Vec::new();
    for row in rows {
        if let Some(value) = row.get(column) {
            if !value.is_null() && !keys.contains(value) {
                keys.push(value.clone());
            }
        }
    }
    keys
}

fn in_filter(column: &str, keys: &[Value]) -> Result<CompiledFilter, ApiError> {
    let members: Vec<FilterValue> = keys.iter().filter_map(value_to_filter).collect();
    builder::is_in(column, members)
        .compile()
        .map_err(|err| ApiError::Internal(format!("relation key filter: {err}")))
}

async fn fetch_targets(
    driver: &Arc<dyn StorageDriver>,
    def: &RelationDef,
    key_column: &str,
    keys: &[Value],
    spec: &IncludeSpec,
) -> Result<Vec<Record>, ApiError> {
    if keys.is_empty() {
        return Ok(Vec::new());
    }
    let mut filter = in_filter(key_column, keys)?;
    if let Some(raw) = &spec.filter {
        let user_filter = CompiledFilter::compile(raw)?;
        filter = filter.and(&user_filter);
    }
    let query = SelectQuery { filter: Some(Arc::new(filter)), ..Default::default() };
    Ok(driver.select(&def.target, &query).await?)
}

/// Loads `specs` onto `parents`, recursing into nested includes.
pub fn load<'a>(
    driver: &'a Arc<dyn StorageDriver>,
    relations: &'a HashMap<String, RelationDef>,
    parents: &'a mut Vec<Record>,
    specs: &'a [IncludeSpec],
) -> BoxFuture<'a, Result<(), ApiError>> {
    async move {
        if parents.is_empty() {
            return Ok(());
        }
        for spec in specs {
            let def = relations.get(&spec.name).ok_or_else(|| {
                ApiError::Validation(format!("unknown relation `{}`", spec.name))
            })?;
            load_one(driver, def, parents, spec).await?;
        }
        Ok(())
    }
    .boxed()
}

async fn load_one(
    driver: &Arc<dyn StorageDriver>,
    def: &RelationDef,
    parents: &mut Vec<Record>,
    spec: &IncludeSpec,
) -> Result<(), ApiError> {
    match def.kind {
        RelationKind::BelongsTo => {
            let keys = gather_keys(parents, &def.foreign_key);
            let mut children = fetch_targets(driver, def, &def.references, &keys, spec).await?;
            load(driver, &def.relations, &mut children, &spec.children).await?;

            let by_key: HashMap<String, Record> = children
                .into_iter()
                .filter_map(|child| {
                    child.get(&def.references).map(|k| (id_to_string(k), child.clone()))
                })
                .collect();
            for parent in parents.iter_mut() {
                let child = parent
                    .get(&def.foreign_key)
                    .filter(|v| !v.is_null())
                    .and_then(|k| by_key.get(&id_to_string(k)))
                    .map(|child| Value::Object(project(child, spec.select.as_deref())));
                parent.insert(spec.name.clone(), child.unwrap_or(Value::Null));
            }
        }
        RelationKind::HasOne | RelationKind::HasMany => {
            let keys = gather_keys(parents, &def.references);
            let mut children = fetch_targets(driver, def, &def.foreign_key, &keys, spec).await?;
            load(driver, &def.relations, &mut children, &spec.children).await?;

            let mut grouped: HashMap<String, Vec<Record>> = HashMap::new();
            for child in children {
                if let Some(key) = child.get(&def.foreign_key) {
                    grouped.entry(id_to_string(key)).or_default().push(child);
                }
            }
            for parent in parents.iter_mut() {
                let group = parent
                    .get(&def.references)
                    .filter(|v| !v.is_null())
                    .and_then(|k| grouped.get(&id_to_string(k)))
                    .cloned()
                    .unwrap_or_default();
                stitch_group(parent, spec, def.kind, group);
            }
        }
        RelationKind::ManyToMany => {
            let through = def
                .through
                .as_ref()
                .ok_or_else(|| ApiError::Internal("manyToMany without through".to_owned()))?;
            let parent_keys = gather_keys(parents, &def.foreign_key);

            // First batch: join rows for all parents.
            let join_filter = in_filter(&through.source_key, &parent_keys)?;
            let join_query =
                SelectQuery { filter: Some(Arc::new(join_filter)), ..Default::default() };
            let join_rows = driver.select(&through.table, &join_query).await?;

            // Second batch: the referenced targets.
            let target_keys = gather_keys(&join_rows, &through.target_key);
            let mut children =
                fetch_targets(driver, def, &def.references, &target_keys, spec).await?;
            load(driver, &def.relations, &mut children, &spec.children).await?;

            let by_key: HashMap<String, Record> = children
                .into_iter()
                .filter_map(|child| {
                    child.get(&def.references).map(|k| (id_to_string(k), child.clone()))
                })
                .collect();
            let mut grouped: HashMap<String, Vec<Record>> = HashMap::new();
            for join_row in &join_rows {
                let (Some(source), Some(target)) = (
                    join_row.get(&through.source_key),
                    join_row.get(&through.target_key),
                ) else {
                    continue;
                };
                if let Some(child) = by_key.get(&id_to_string(target)) {
                    grouped
                        .entry(id_to_string(source))
                        .or_default()
                        .push(child.clone());
                }
            }
            for parent in parents.iter_mut() {
                let group = parent
                    .get(&def.foreign_key)
                    .filter(|v| !v.is_null())
                    .and_then(|k| grouped.get(&id_to_string(k)))
                    .cloned()
                    .unwrap_or_default();
                stitch_group(parent, spec, RelationKind::HasMany, group);
            }
        }
    }
    Ok(())
}

fn stitch_group(parent: &mut Record, spec: &IncludeSpec, kind: RelationKind, group: Vec<Record>) {
    let mut group = group;
    if let Some(limit) = spec.limit {
        group.truncate(limit);
    }
    let value = match kind {
        RelationKind::HasOne => group
            .into_iter()
            .next()
            .map(|child| Value::Object(project(&child, spec.select.as_deref())))
            .unwrap_or(Value::Null),
        _ => Value::Array(
            group
                .into_iter()
                .map(|child| Value::Object(project(&child, spec.select.as_deref())))
                .collect(),
        ),
    };
    parent.insert(spec.name.clone(), value);
}

/// Projection for related rows. Unknown names are ignored; `None` keeps
/// everything.
fn project(record: &Record, select: Option<&[String]>) -> Record {
    match select {
        None => record.clone(),
        Some(columns) => {
            let mut out = Record::new();
            for column in columns {
                if let Some(value) = record.get(column) {
                    out.insert(column.clone(), value.clone());
                }
            }
            out
        }
    }
}
