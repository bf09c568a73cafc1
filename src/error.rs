//! HTTP-facing error taxonomy.
//!
//! Every error the framework reports to a client is one of the kinds below.
//! Responses follow the problem-details convention: a JSON body of
//! `{ type, title, status, detail, currentETag? }` where `type` is a
//! URL-like tag under `/__concave/problems/`.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Failed to parse filter near `{0}`")]
    FilterParse(String),

    #[error("Authentication required")]
    Unauthenticated,

    #[error("Access denied")]
    Forbidden,

    #[error("Resource not found")]
    NotFound,

    #[error("Precondition failed")]
    PreconditionFailed { current_etag: String },

    #[error("Not modified")]
    NotModified,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Request exceeds the configured limit: {0}")]
    TooLarge(String),

    #[error("Storage temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("Request timed out")]
    GatewayTimeout,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn slug(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation",
            ApiError::FilterParse(_) => "filter-parse",
            ApiError::Unauthenticated => "unauthenticated",
            ApiError::Forbidden => "forbidden",
            ApiError::NotFound => "not-found",
            ApiError::PreconditionFailed { .. } => "precondition-failed",
            ApiError::NotModified => "not-modified",
            ApiError::Conflict(_) => "conflict",
            ApiError::TooLarge(_) => "too-large",
            ApiError::Unavailable(_) => "unavailable",
            ApiError::GatewayTimeout => "gateway-timeout",
            ApiError::Internal(_) => "internal",
        }
    }

    fn title(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "Validation failed",
            ApiError::FilterParse(_) => "Malformed filter expression",
            ApiError::Unauthenticated => "Authentication required",
            ApiError::Forbidden => "Access denied",
            ApiError::NotFound => "Resource not found",
            ApiError::PreconditionFailed { .. } => "Precondition failed",
            ApiError::NotModified => "Not modified",
            ApiError::Conflict(_) => "Conflict",
            ApiError::TooLarge(_) => "Request too large",
            ApiError::Unavailable(_) => "Service unavailable",
            ApiError::GatewayTimeout => "Gateway timeout",
            ApiError::Internal(_) => "Internal server error",
        }
    }
}

#[derive(Serialize)]
struct ProblemBody<'a> {
    #[serde(rename = "type")]
    type_tag: String,
    title: &'a str,
    status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
    #[serde(rename = "currentETag", skip_serializing_if = "Option::is_none")]
    current_etag: Option<&'a str>,
}

impl ApiError {
    /// The problem-details document for this error. Shared between the
    /// HTTP rendering and the idempotency write-through (4xx responses are
    /// cached too).
    pub fn problem_json(&self) -> serde_json::Value {
        let detail = match self {
            ApiError::Validation(d)
            | ApiError::Conflict(d)
            | ApiError::TooLarge(d)
            | ApiError::Unavailable(d) => Some(d.clone()),
            ApiError::FilterParse(snippet) => Some(format!("near `{snippet}`")),
            // Programmer errors keep their detail out of the response body.
            _ => None,
        };
        let current_etag = match self {
            ApiError::PreconditionFailed { current_etag } => Some(current_etag.as_str()),
            _ => None,
        };
        let body = ProblemBody {
            type_tag: format!("/__concave/problems/{}", self.slug()),
            title: self.title(),
            status: self.status_code().as_u16(),
            detail,
            current_etag,
        };
        serde_json::to_value(body).unwrap_or_else(|_| serde_json::json!({}))
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::FilterParse(_) | ApiError::TooLarge(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::PreconditionFailed { .. } => StatusCode::PRECONDITION_FAILED,
            ApiError::NotModified => StatusCode::NOT_MODIFIED,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if matches!(self, ApiError::NotModified) {
            return HttpResponse::NotModified().finish();
        }
        HttpResponse::build(self.status_code()).json(self.problem_json())
    }
}

impl From<StorageError> for ApiError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::NotFound(_, _) => ApiError::NotFound,
            StorageError::DuplicateEntry(entity, id) => {
                ApiError::Conflict(format!("{entity} with id `{id}` already exists"))
            }
            // The pipeline intercepts this variant to attach the winner's
            // ETag; the bare mapping is the fallback.
            StorageError::PreconditionFailed { .. } => {
                ApiError::PreconditionFailed { current_etag: String::new() }
            }
            StorageError::UnknownColumn(col) => {
                ApiError::FilterParse(format!("unknown column `{col}`"))
            }
            StorageError::Unsupported(msg) => ApiError::Validation(msg),
            StorageError::Unexpected(msg) => ApiError::Unavailable(msg),
        }
    }
}
