//! actix-web route handlers.
//!
//! [`ResourceService`] bundles the pipeline with the idempotency store and
//! registers the synthesised routes under a caller-chosen scope:
//!
//! | Route | Behaviour |
//! |---|---|
//! | `GET /` | list (filter, orderBy, limit, cursor, select, totalCount, include) |
//! | `GET /count` | `{ count }` under scope ∧ filter |
//! | `GET /aggregate` | groupBy/count/sum/avg/min/max |
//! | `GET /subscribe` | SSE live query |
//! | `GET /search` | external search adapter |
//! | `POST /` | create (Idempotency-Key honoured) |
//! | `POST /batch` | all-or-nothing batch create |
//! | `PATCH /batch` | bulk update by filter |
//! | `DELETE /batch` | bulk delete by filter |
//! | `GET /{id}` | single record (ETag, If-None-Match) |
//! | `PATCH /{id}` | partial update (If-Match) |
//! | `PUT /{id}` | replace (If-Match) |
//! | `DELETE /{id}` | delete (If-Match) |

use actix_web::http::header;
use actix_web::{web, HttpMessage, HttpRequest, HttpResponse};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::error;

use super::descriptor::ResourceDescriptor;
use super::pipeline::{ListParams, Mutated, ResourcePipeline};
use crate::changelog::ChangelogBroker;
use crate::error::ApiError;
use crate::idempotency::{self, Begin, IdempotencyStore, StoredResponse};
use crate::kv::{KVAdapter, MemoryKv};
use crate::models::{RequestContext, UserContext};
use crate::session::Session;
use crate::storage::{AggregateSpec, Direction, OrderKey, StorageDriver};

/// One configured resource, cheap to clone into the actix app factory.
#[derive(Clone)]
pub struct ResourceService {
    pipeline: Arc<ResourcePipeline>,
    idempotency: Arc<IdempotencyStore>,
    search: Option<Arc<dyn crate::search::SearchAdapter>>,
}

impl ResourceService {
    /// Standalone wiring: a private broker and an in-memory idempotency
    /// store. Fine for a single resource; share the collaborators via
    /// [`ResourceService::with_parts`] when running several.
    pub fn new(descriptor: ResourceDescriptor, driver: Arc<dyn StorageDriver>) -> Self {
        Self::with_parts(
            descriptor,
            driver,
            Arc::new(ChangelogBroker::default()),
            Arc::new(MemoryKv::new()),
        )
    }

    pub fn with_parts(
        descriptor: ResourceDescriptor,
        driver: Arc<dyn StorageDriver>,
        broker: Arc<ChangelogBroker>,
        kv: Arc<dyn KVAdapter>,
    ) -> Self {
        let pipeline = ResourcePipeline::new(Arc::new(descriptor), driver, broker);
        Self {
            pipeline: Arc::new(pipeline),
            idempotency: Arc::new(IdempotencyStore::new(kv)),
            search: None,
        }
    }

    pub fn with_search(mut self, adapter: Arc<dyn crate::search::SearchAdapter>) -> Self {
        self.search = Some(adapter);
        self
    }

    pub fn pipeline(&self) -> &Arc<ResourcePipeline> {
        &self.pipeline
    }

    fn descriptor(&self) -> &ResourceDescriptor {
        &self.pipeline.descriptor
    }

    /// Registers the routes on a `web::scope`. Capability flags decide
    /// which mutation routes exist at all.
    pub fn configure(&self, cfg: &mut web::ServiceConfig) {
        let d = self.descriptor();
        cfg.app_data(web::Data::new(self.clone()));
        cfg.route("", web::get().to(list));
        cfg.route("/count", web::get().to(count));
        if d.enable_aggregations {
            cfg.route("/aggregate", web::get().to(aggregate));
        }
        if d.enable_subscriptions {
            cfg.route("/subscribe", web::get().to(subscribe));
        }
        if d.enable_search {
            cfg.route("/search", web::get().to(search));
        }
        if d.enable_create {
            cfg.route("", web::post().to(create));
            cfg.route("/batch", web::post().to(batch_create));
        }
        if d.enable_update {
            cfg.route("/batch", web::patch().to(bulk_update));
        }
        if d.enable_delete {
            cfg.route("/batch", web::delete().to(bulk_delete));
        }
        cfg.route("/{id}", web::get().to(get_one));
        if d.enable_update {
            cfg.route("/{id}", web::patch().to(patch_one));
        }
        if d.enable_replace {
            cfg.route("/{id}", web::put().to(put_one));
        }
        if d.enable_delete {
            cfg.route("/{id}", web::delete().to(delete_one));
        }
    }
}

fn request_context(req: &HttpRequest) -> RequestContext {
    let extensions = req.extensions();
    RequestContext {
        user: extensions.get::<UserContext>().cloned(),
        session: extensions.get::<Session>().cloned(),
        cancellation: tokio_util::sync::CancellationToken::new(),
    }
}

fn query_pairs(req: &HttpRequest) -> Result<Vec<(String, String)>, ApiError> {
    serde_urlencoded::from_str::<Vec<(String, String)>>(req.query_string())
        .map_err(|err| ApiError::Validation(format!("malformed query string: {err}")))
}

fn single<'a>(pairs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

fn repeated<'a>(pairs: &'a [(String, String)], name: &str) -> Vec<&'a str> {
    pairs
        .iter()
        .filter(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
        .collect()
}

fn parse_order_by(pairs: &[(String, String)]) -> Result<Vec<OrderKey>, ApiError> {
    let mut order = Vec::new();
    for raw in repeated(pairs, "orderBy") {
        for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (field, direction) = match part.split_once(':') {
                None => (part, Direction::Asc),
                Some((field, "asc")) => (field, Direction::Asc),
                Some((field, "desc")) => (field, Direction::Desc),
                Some((_, other)) => {
                    return Err(ApiError::Validation(format!(
                        "orderBy direction must be asc or desc, got `{other}`"
                    )))
                }
            };
            order.push(OrderKey { field: field.to_owned(), direction });
        }
    }
    Ok(order)
}

fn parse_list_params(pairs: &[(String, String)]) -> Result<ListParams, ApiError> {
    let limit = match single(pairs, "limit") {
        None => None,
        Some(raw) => Some(
            raw.parse::<usize>()
                .map_err(|_| ApiError::Validation(format!("limit `{raw}` is not a number")))?,
        ),
    };
    Ok(ListParams {
        filter: single(pairs, "filter").map(str::to_owned),
        order_by: parse_order_by(pairs)?,
        limit,
        cursor: single(pairs, "cursor").map(str::to_owned),
        select: single(pairs, "select")
            .map(|s| s.split(',').map(|c| c.trim().to_owned()).collect()),
        total_count: single(pairs, "totalCount") == Some("true"),
        include: single(pairs, "include").map(str::to_owned),
    })
}

fn header_value<'a>(req: &'a HttpRequest, name: header::HeaderName) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

const RESOURCE_VERSION_HEADER: &str = "X-Resource-Version";

fn build_response(stored: &StoredResponse) -> HttpResponse {
    let mut builder = HttpResponse::build(
        actix_web::http::StatusCode::from_u16(stored.status)
            .unwrap_or(actix_web::http::StatusCode::OK),
    );
    builder.insert_header((header::CACHE_CONTROL, "no-store"));
    if let Some(etag) = &stored.etag {
        builder.insert_header((header::ETAG, etag.as_str()));
    }
    if let Some(version) = stored.resource_version {
        builder.insert_header((RESOURCE_VERSION_HEADER, version.to_string()));
    }
    if stored.status == 204 {
        builder.finish()
    } else {
        builder.json(&stored.body)
    }
}

/// Runs a mutation under the Idempotency-Key protocol and the configured
/// mutation timeout. `execute` yields the response-shaped outcome.
async fn run_mutation<F, Fut>(
    service: &ResourceService,
    req: &HttpRequest,
    body_for_fingerprint: Option<Value>,
    ctx: RequestContext,
    execute: F,
) -> Result<HttpResponse, ApiError>
where
    F: FnOnce(Arc<ResourcePipeline>, RequestContext) -> Fut,
    Fut: Future<Output = Result<StoredResponse, ApiError>>,
{
    let idem = match header_value(req, header::HeaderName::from_static("idempotency-key")) {
        None => None,
        Some(key) => {
            if !idempotency::validate_key(key) {
                return Err(ApiError::Validation(
                    "Idempotency-Key must match ^[A-Za-z0-9_-]{8,256}$".to_owned(),
                ));
            }
            let scope = IdempotencyStore::scope(
                ctx.scope_principal(),
                req.method().as_str(),
                req.path(),
                key,
            );
            let fingerprint = idempotency::fingerprint(
                req.method().as_str(),
                req.path(),
                body_for_fingerprint.as_ref(),
            );
            match service.idempotency.begin(&scope, &fingerprint).await? {
                Begin::Replay(stored) => return Ok(build_response(&stored)),
                Begin::Execute(guard) => Some((guard, fingerprint)),
            }
        }
    };

    let timeout = service.descriptor().mutation_timeout;
    let outcome = match tokio::time::timeout(timeout, execute(service.pipeline.clone(), ctx)).await
    {
        Ok(outcome) => outcome,
        Err(_) => Err(ApiError::GatewayTimeout),
    };

    match outcome {
        Ok(stored) => {
            if let Some((guard, fingerprint)) = idem {
                service
                    .idempotency
                    .complete(guard, &fingerprint, stored.clone())
                    .await?;
            }
            Ok(build_response(&stored))
        }
        Err(err) => {
            if let Some((guard, fingerprint)) = idem {
                let status = actix_web::ResponseError::status_code(&err).as_u16();
                let stored = StoredResponse {
                    status,
                    body: err.problem_json(),
                    etag: None,
                    resource_version: None,
                };
                if let Err(cache_err) =
                    service.idempotency.complete(guard, &fingerprint, stored).await
                {
                    error!(error = %cache_err, "Failed to record idempotent error response");
                }
            }
            Err(err)
        }
    }
}

fn record_response(status: u16, mutated: Mutated) -> StoredResponse {
    StoredResponse {
        status,
        body: mutated.record.map(Value::Object).unwrap_or(Value::Null),
        etag: mutated.etag,
        resource_version: Some(mutated.seq),
    }
}

#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Page of records with pagination metadata"),
    ),
)]
async fn list(
    req: HttpRequest,
    service: web::Data<ResourceService>,
) -> Result<HttpResponse, ApiError> {
    let ctx = request_context(&req);
    let pairs = query_pairs(&req)?;
    let params = parse_list_params(&pairs)?;
    let response = service.pipeline.list(&ctx, &params).await?;
    Ok(HttpResponse::Ok().json(response))
}

#[utoipa::path(
    get,
    path = "/{id}",
    responses(
        (status = 200, description = "Single record with ETag"),
        (status = 304, description = "If-None-Match matched"),
        (status = 404, description = "Missing or out of scope"),
    ),
)]
async fn get_one(
    req: HttpRequest,
    path: web::Path<String>,
    service: web::Data<ResourceService>,
) -> Result<HttpResponse, ApiError> {
    let ctx = request_context(&req);
    let pairs = query_pairs(&req)?;
    let select: Option<Vec<String>> = single(&pairs, "select")
        .map(|s| s.split(',').map(|c| c.trim().to_owned()).collect());
    let include = single(&pairs, "include");
    let if_none_match = header_value(&req, header::IF_NONE_MATCH);

    let (record, etag) = service
        .pipeline
        .get(&ctx, &path, select.as_deref(), include, if_none_match)
        .await?;
    Ok(HttpResponse::Ok()
        .insert_header((header::ETAG, etag))
        .json(record))
}

async fn count(
    req: HttpRequest,
    service: web::Data<ResourceService>,
) -> Result<HttpResponse, ApiError> {
    let ctx = request_context(&req);
    let pairs = query_pairs(&req)?;
    let count = service.pipeline.count(&ctx, single(&pairs, "filter")).await?;
    Ok(HttpResponse::Ok().json(json!({ "count": count })))
}

async fn aggregate(
    req: HttpRequest,
    service: web::Data<ResourceService>,
) -> Result<HttpResponse, ApiError> {
    let ctx = request_context(&req);
    let pairs = query_pairs(&req)?;
    let spec = AggregateSpec {
        group_by: repeated(&pairs, "groupBy")
            .iter()
            .flat_map(|raw| raw.split(','))
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect(),
        count: single(&pairs, "count") == Some("true"),
        sum: repeated(&pairs, "sum").iter().map(|s| s.to_string()).collect(),
        avg: repeated(&pairs, "avg").iter().map(|s| s.to_string()).collect(),
        min: repeated(&pairs, "min").iter().map(|s| s.to_string()).collect(),
        max: repeated(&pairs, "max").iter().map(|s| s.to_string()).collect(),
    };
    let groups = service
        .pipeline
        .aggregate(&ctx, single(&pairs, "filter"), &spec)
        .await?;
    Ok(HttpResponse::Ok().json(json!({ "groups": groups })))
}

#[utoipa::path(
    get,
    path = "/subscribe",
    responses(
        (status = 200, description = "SSE stream: existing/added/changed/removed/invalidate"),
    ),
)]
async fn subscribe(
    req: HttpRequest,
    service: web::Data<ResourceService>,
) -> Result<HttpResponse, ApiError> {
    let ctx = request_context(&req);
    let pairs = query_pairs(&req)?;
    let rx = service
        .pipeline
        .subscribe(&ctx, single(&pairs, "filter"))
        .await?;

    let stream = ReceiverStream::new(rx)
        .map(|frame| Ok::<_, actix_web::Error>(web::Bytes::from(frame)));
    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .streaming(stream))
}

async fn search(
    req: HttpRequest,
    service: web::Data<ResourceService>,
) -> Result<HttpResponse, ApiError> {
    let ctx = request_context(&req);
    let pairs = query_pairs(&req)?;
    let q = single(&pairs, "q")
        .ok_or_else(|| ApiError::Validation("missing `q` parameter".to_owned()))?;
    let limit = single(&pairs, "limit").and_then(|raw| raw.parse().ok());
    let offset = single(&pairs, "offset").and_then(|raw| raw.parse().ok());
    // A resource without a configured adapter has no search surface.
    let adapter = service.search.as_ref().ok_or(ApiError::NotFound)?;
    let items = service
        .pipeline
        .search(adapter.as_ref(), &ctx, q, limit, offset)
        .await?;
    Ok(HttpResponse::Ok().json(json!({ "items": items })))
}

#[utoipa::path(
    post,
    path = "/",
    responses(
        (status = 201, description = "Created; ETag and X-Resource-Version set"),
        (status = 409, description = "Duplicate or idempotency conflict"),
    ),
)]
async fn create(
    req: HttpRequest,
    body: web::Json<Value>,
    service: web::Data<ResourceService>,
) -> Result<HttpResponse, ApiError> {
    let ctx = request_context(&req);
    let payload = body.into_inner();
    let fingerprint_body = payload.clone();
    run_mutation(&service, &req, Some(fingerprint_body), ctx, |pipeline, ctx| async move {
        let mutated = pipeline.create(&ctx, payload).await?;
        Ok(record_response(201, mutated))
    })
    .await
}

async fn patch_one(
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Json<Value>,
    service: web::Data<ResourceService>,
) -> Result<HttpResponse, ApiError> {
    let ctx = request_context(&req);
    let payload = body.into_inner();
    let fingerprint_body = payload.clone();
    let id = path.into_inner();
    let if_match = header_value(&req, header::IF_MATCH).map(str::to_owned);
    run_mutation(&service, &req, Some(fingerprint_body), ctx, |pipeline, ctx| async move {
        let mutated = pipeline.update(&ctx, &id, payload, if_match.as_deref()).await?;
        Ok(record_response(200, mutated))
    })
    .await
}

async fn put_one(
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Json<Value>,
    service: web::Data<ResourceService>,
) -> Result<HttpResponse, ApiError> {
    let ctx = request_context(&req);
    let payload = body.into_inner();
    let fingerprint_body = payload.clone();
    let id = path.into_inner();
    let if_match = header_value(&req, header::IF_MATCH).map(str::to_owned);
    run_mutation(&service, &req, Some(fingerprint_body), ctx, |pipeline, ctx| async move {
        let mutated = pipeline.replace(&ctx, &id, payload, if_match.as_deref()).await?;
        Ok(record_response(200, mutated))
    })
    .await
}

async fn delete_one(
    req: HttpRequest,
    path: web::Path<String>,
    service: web::Data<ResourceService>,
) -> Result<HttpResponse, ApiError> {
    let ctx = request_context(&req);
    let id = path.into_inner();
    let if_match = header_value(&req, header::IF_MATCH).map(str::to_owned);
    run_mutation(&service, &req, None, ctx, |pipeline, ctx| async move {
        let mutated = pipeline.delete(&ctx, &id, if_match.as_deref()).await?;
        Ok(StoredResponse {
            status: 204,
            body: Value::Null,
            etag: None,
            resource_version: Some(mutated.seq),
        })
    })
    .await
}

async fn batch_create(
    req: HttpRequest,
    body: web::Json<Value>,
    service: web::Data<ResourceService>,
) -> Result<HttpResponse, ApiError> {
    let ctx = request_context(&req);
    let payload = body.into_inner();
    let fingerprint_body = payload.clone();
    run_mutation(&service, &req, Some(fingerprint_body), ctx, |pipeline, ctx| async move {
        let items = payload
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| {
                ApiError::Validation("body must be `{ \"items\": [...] }`".to_owned())
            })?;
        let results = pipeline.batch_create(&ctx, items).await?;
        let last_seq = results.last().map(|m| m.seq);
        let items: Vec<Value> = results
            .into_iter()
            .map(|m| m.record.map(Value::Object).unwrap_or(Value::Null))
            .collect();
        Ok(StoredResponse {
            status: 201,
            body: json!({ "items": items }),
            etag: None,
            resource_version: last_seq,
        })
    })
    .await
}

async fn bulk_update(
    req: HttpRequest,
    body: web::Json<Value>,
    service: web::Data<ResourceService>,
) -> Result<HttpResponse, ApiError> {
    let ctx = request_context(&req);
    let payload = body.into_inner();
    let fingerprint_body = payload.clone();
    let pairs = query_pairs(&req)?;
    let filter = single(&pairs, "filter").map(str::to_owned);
    run_mutation(&service, &req, Some(fingerprint_body), ctx, |pipeline, ctx| async move {
        let count = pipeline.update_batch(&ctx, filter.as_deref(), payload).await?;
        Ok(StoredResponse {
            status: 200,
            body: json!({ "count": count }),
            etag: None,
            resource_version: None,
        })
    })
    .await
}

async fn bulk_delete(
    req: HttpRequest,
    service: web::Data<ResourceService>,
) -> Result<HttpResponse, ApiError> {
    let ctx = request_context(&req);
    let pairs = query_pairs(&req)?;
    let filter = single(&pairs, "filter").map(str::to_owned);
    run_mutation(&service, &req, None, ctx, |pipeline, ctx| async move {
        let count = pipeline.delete_batch(&ctx, filter.as_deref()).await?;
        Ok(StoredResponse {
            status: 200,
            body: json!({ "count": count }),
            etag: None,
            resource_version: None,
        })
    })
    .await
}
