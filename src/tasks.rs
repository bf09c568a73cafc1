//! Background-task scheduler surface.
//!
//! Only the coordination contract lives here: enqueue, cancel and query.
//! The worker loop that actually executes tasks is an external
//! collaborator polling the same KV. Schedules are plain records, so
//! `get_tasks` runs caller filters through the normal filter engine and a
//! per-user scope exactly like a resource read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use strum_macros::{Display, EnumString};
use tracing::debug;
use uuid::Uuid;

use crate::error::ApiError;
use crate::filter::CompiledFilter;
use crate::kv::KVAdapter;
use crate::models::{Record, RequestContext};
use crate::scope::builder;

const TASK_PREFIX: &str = "task:";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub name: String,
    pub payload: Value,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub run_at: DateTime<Utc>,
    /// Seconds between recurrences; one-shot when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl ScheduledTask {
    pub fn new(name: &str, payload: Value, run_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_owned(),
            payload,
            status: TaskStatus::Pending,
            user_id: None,
            run_at,
            interval_secs: None,
            created_at: Utc::now(),
        }
    }

    pub fn recurring(mut self, interval_secs: u64) -> Self {
        self.interval_secs = Some(interval_secs);
        self
    }

    /// Record view, for filter evaluation.
    fn to_record(&self) -> Record {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Record::new(),
        }
    }
}

pub struct TaskScheduler {
    kv: Arc<dyn KVAdapter>,
}

impl TaskScheduler {
    pub fn new(kv: Arc<dyn KVAdapter>) -> Self {
        Self { kv }
    }

    fn key(id: &str) -> String {
        format!("{TASK_PREFIX}{id}")
    }

    /// Persists the schedule and returns the task id.
    pub async fn enqueue(
        &self,
        ctx: &RequestContext,
        mut task: ScheduledTask,
    ) -> Result<String, ApiError> {
        task.user_id = ctx.user_id().map(str::to_owned);
        let raw = serde_json::to_string(&task)
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        self.kv.set(&Self::key(&task.id), &raw, None).await?;
        debug!(task_id = %task.id, name = %task.name, "Task enqueued");
        Ok(task.id)
    }

    /// Cancels a pending or running task the caller owns.
    pub async fn cancel(&self, ctx: &RequestContext, id: &str) -> Result<(), ApiError> {
        let mut task = self.load(id).await?.ok_or(ApiError::NotFound)?;
        if !self.owner_scope(ctx).matches(&task.to_record()) {
            // Out of scope reads as missing, same as resources.
            return Err(ApiError::NotFound);
        }
        if matches!(task.status, TaskStatus::Done | TaskStatus::Failed) {
            return Err(ApiError::Conflict(format!(
                "task `{id}` already finished with status {}",
                task.status
            )));
        }
        task.status = TaskStatus::Cancelled;
        let raw = serde_json::to_string(&task)
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        self.kv.set(&Self::key(id), &raw, None).await?;
        Ok(())
    }

    /// The caller's tasks, optionally narrowed by a filter expression over
    /// the schedule fields (`status=="pending";name=startswith="report"`).
    pub async fn get_tasks(
        &self,
        ctx: &RequestContext,
        raw_filter: Option<&str>,
    ) -> Result<Vec<ScheduledTask>, ApiError> {
        let scope = self.owner_scope(ctx);
        let filter = match raw_filter.map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => Some(CompiledFilter::compile(raw)?),
            None => None,
        };

        let keys = self.kv.keys(&format!("{TASK_PREFIX}*")).await?;
        let mut tasks = Vec::new();
        for key in keys {
            let id = key.trim_start_matches(TASK_PREFIX);
            if let Some(task) = self.load(id).await? {
                let record = task.to_record();
                if scope.matches(&record)
                    && filter.as_ref().map(|f| f.matches(&record)).unwrap_or(true)
                {
                    tasks.push(task);
                }
            }
        }
        tasks.sort_by(|a, b| a.run_at.cmp(&b.run_at));
        Ok(tasks)
    }

    async fn load(&self, id: &str) -> Result<Option<ScheduledTask>, ApiError> {
        let Some(raw) = self.kv.get(&Self::key(id)).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| ApiError::Internal(format!("undecodable task record: {err}")))
    }

    /// Anonymous callers see only anonymous tasks; users see their own.
    fn owner_scope(&self, ctx: &RequestContext) -> CompiledFilter {
        let expr = match ctx.user_id() {
            Some(user_id) => builder::eq("user_id", user_id),
            None => builder::is_empty("user_id", true),
        };
        expr.compile().expect("builder expressions always compile")
    }
}
