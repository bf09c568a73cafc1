//! Search adapter contract.
//!
//! Full-text search is an external collaborator: the core only routes
//! `GET /search?q=…` through the resource scope and hands the composed
//! filter to the adapter. Unconfigured search is a 404, not an error.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::ApiError;
use crate::filter::CompiledFilter;
use crate::models::Record;

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Scope ∧ caller filter; the adapter applies it to candidate rows.
    pub filter: Option<Arc<CompiledFilter>>,
    pub limit: usize,
    pub offset: usize,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SearchAdapter: Send + Sync {
    /// Indexes (or reindexes) one document.
    async fn index(&self, index: &str, id: &str, document: &Record) -> Result<(), ApiError>;

    async fn delete(&self, index: &str, id: &str) -> Result<(), ApiError>;

    async fn query(
        &self,
        index: &str,
        q: &str,
        options: &QueryOptions,
    ) -> Result<Vec<Record>, ApiError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn mock_adapter_applies_filter() {
        let mut adapter = MockSearchAdapter::new();
        adapter.expect_query().returning(|_, q, options| {
            let rows = vec![
                json!({"id": "1", "title": "rust book", "tenant": "t1"}),
                json!({"id": "2", "title": "rust blog", "tenant": "t2"}),
            ];
            let q = q.to_owned();
            let hits = rows
                .into_iter()
                .map(|v| v.as_object().unwrap().clone())
                .filter(|r| r["title"].as_str().unwrap().contains(&q))
                .filter(|r| {
                    options
                        .filter
                        .as_ref()
                        .map(|f| f.matches(r))
                        .unwrap_or(true)
                })
                .collect();
            Ok(hits)
        });

        let filter = Arc::new(CompiledFilter::compile("tenant==\"t1\"").unwrap());
        let options = QueryOptions { filter: Some(filter), limit: 10, offset: 0 };
        let hits = adapter.query("posts", "rust", &options).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["id"], "1");
    }
}
