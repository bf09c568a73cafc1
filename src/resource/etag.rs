//! ETag policy.
//!
//! Resolution per row: a configured `etag_field` wins (strong ETag), then a
//! `version_field` (`W/"<id>:<version>"`, incremented by the driver in the
//! write transaction), then the fallback weak ETag — an md5 over the
//! canonicalised row, recomputed on read.

use md5::{Digest, Md5};
use serde_json::Value;

use super::descriptor::ResourceDescriptor;
use crate::error::ApiError;
use crate::models::{canonical_json, id_to_string, Record};

/// Renders the ETag for a stored row under the descriptor's policy.
pub fn resolve(descriptor: &ResourceDescriptor, row: &Record) -> String {
    if let Some(field) = &descriptor.etag_field {
        if let Some(value) = row.get(field).filter(|v| !v.is_null()) {
            return format!("\"{}\"", id_to_string(value));
        }
    }
    if let Some(field) = &descriptor.version_field {
        if let Some(version) = row.get(field).filter(|v| !v.is_null()) {
            let id = row
                .get(descriptor.table.primary_key())
                .map(id_to_string)
                .unwrap_or_default();
            return format!("W/\"{}:{}\"", id, id_to_string(version));
        }
    }
    hash_etag(row)
}

fn hash_etag(row: &Record) -> String {
    let mut hasher = Md5::new();
    hasher.update(canonical_json(&Value::Object(row.clone())).as_bytes());
    format!("W/\"{}\"", hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone, PartialEq)]
pub enum IfMatch {
    /// `If-Match: *` — any existing record.
    Any,
    Exact(String),
}

/// Parses an `If-Match` / `If-None-Match` header value. Exact comparison on
/// the full rendered tag, weak prefix included.
pub fn parse_precondition(header: &str) -> Result<IfMatch, ApiError> {
    let trimmed = header.trim();
    if trimmed == "*" {
        return Ok(IfMatch::Any);
    }
    if trimmed.is_empty() {
        return Err(ApiError::Validation("empty precondition header".to_owned()));
    }
    Ok(IfMatch::Exact(trimmed.to_owned()))
}

pub fn precondition_matches(condition: &IfMatch, current: &str) -> bool {
    match condition {
        IfMatch::Any => true,
        IfMatch::Exact(expected) => expected == current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ColumnType, TableHandle};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn rec(v: serde_json::Value) -> Record {
        v.as_object().unwrap().clone()
    }

    fn base_table() -> TableHandle {
        TableHandle::new("docs", "id")
            .column("id", ColumnType::Text)
            .column("body", ColumnType::Text)
            .column("rev", ColumnType::Integer)
            .column("digest", ColumnType::Text)
    }

    fn descriptor() -> ResourceDescriptor {
        ResourceDescriptor::builder(base_table()).build().unwrap()
    }

    #[test]
    fn hash_etag_is_stable_under_key_order() {
        let d = descriptor();
        let a = rec(json!({"id": "1", "body": "x"}));
        let mut b = Record::new();
        b.insert("body".into(), json!("x"));
        b.insert("id".into(), json!("1"));
        assert_eq!(resolve(&d, &a), resolve(&d, &b));
        assert!(resolve(&d, &a).starts_with("W/\""));
    }

    #[test]
    fn hash_etag_changes_with_content() {
        let d = descriptor();
        let a = rec(json!({"id": "1", "body": "x"}));
        let b = rec(json!({"id": "1", "body": "y"}));
        assert_ne!(resolve(&d, &a), resolve(&d, &b));
    }

    #[test]
    fn version_field_etag() {
        let d = ResourceDescriptor::builder(base_table())
            .version_field("rev")
            .build()
            .unwrap();
        let row = rec(json!({"id": "doc-1", "rev": 3, "body": "x"}));
        assert_eq!(resolve(&d, &row), "W/\"doc-1:3\"");
    }

    #[test]
    fn etag_field_takes_precedence() {
        let d = ResourceDescriptor::builder(base_table())
            .version_field("rev")
            .etag_field("digest")
            .build()
            .unwrap();
        let row = rec(json!({"id": "1", "rev": 3, "digest": "abc123"}));
        assert_eq!(resolve(&d, &row), "\"abc123\"");

        // Falls through when the digest column is null.
        let row = rec(json!({"id": "1", "rev": 3, "digest": null}));
        assert_eq!(resolve(&d, &row), "W/\"1:3\"");
    }

    #[test]
    fn precondition_parsing() {
        assert_eq!(parse_precondition("*").unwrap(), IfMatch::Any);
        assert_eq!(
            parse_precondition("W/\"abc\"").unwrap(),
            IfMatch::Exact("W/\"abc\"".to_owned())
        );
        assert!(parse_precondition("  ").is_err());

        assert!(precondition_matches(&IfMatch::Any, "W/\"x\""));
        assert!(precondition_matches(&IfMatch::Exact("W/\"x\"".into()), "W/\"x\""));
        assert!(!precondition_matches(&IfMatch::Exact("W/\"x\"".into()), "W/\"y\""));
    }
}
