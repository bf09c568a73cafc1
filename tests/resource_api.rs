//! End-to-end scenarios over the HTTP surface, driven through actix's
//! test harness against the in-memory driver.

use actix_web::http::header;
use actix_web::{test, web, App, HttpRequest};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::rc::Rc;
use std::sync::Arc;

use concave::auth::{AuthAdapter, AuthMiddleware};
use concave::error::ApiError;
use concave::resource::{RelationDef, ResourceDescriptor, ResourceService};
use concave::session::Session;
use concave::storage::{ColumnType, MemoryDriver, StorageDriver, TableHandle, WriteContext};
use concave::UserContext;

/// Accepts `Bearer test-token` as the user `tester`.
struct StaticAuth;

#[async_trait(?Send)]
impl AuthAdapter for StaticAuth {
    fn extract_credentials(&self, req: &HttpRequest) -> Option<String> {
        req.headers()
            .get(header::AUTHORIZATION)?
            .to_str()
            .ok()?
            .strip_prefix("Bearer ")
            .map(str::to_owned)
    }

    async fn validate_credentials(
        &self,
        credentials: &str,
    ) -> Result<Option<UserContext>, ApiError> {
        Ok((credentials == "test-token").then(|| UserContext::new("tester")))
    }

    async fn get_session(&self, _credentials: &str) -> Result<Option<Session>, ApiError> {
        Ok(None)
    }

    async fn invalidate_session(&self, _credentials: &str) -> Result<(), ApiError> {
        Ok(())
    }
}

fn users_table() -> TableHandle {
    TableHandle::new("users", "id")
        .column("id", ColumnType::Text)
        .column("name", ColumnType::Text)
        .column("age", ColumnType::Integer)
        .column("role", ColumnType::Text)
        .column("status", ColumnType::Text)
}

fn users_service() -> ResourceService {
    let descriptor = ResourceDescriptor::builder(users_table())
        .batch_limits(3, 100, 100)
        .build()
        .expect("valid descriptor");
    ResourceService::new(descriptor, Arc::new(MemoryDriver::new()))
}

macro_rules! make_app {
    ($service:expr) => {{
        let service = $service;
        test::init_service(
            App::new()
                .wrap(AuthMiddleware::new(Rc::new(StaticAuth)))
                .service(web::scope("/users").configure(|cfg| service.configure(cfg))),
        )
        .await
    }};
}

fn authed(req: test::TestRequest) -> test::TestRequest {
    req.insert_header((header::AUTHORIZATION, "Bearer test-token"))
}

async fn seed_user<S, B>(app: &S, body: Value) -> Value
where
    S: actix_web::dev::Service<
        actix_http::Request,
        Response = actix_web::dev::ServiceResponse<B>,
        Error = actix_web::Error,
    >,
    B: actix_web::body::MessageBody,
    B::Error: std::fmt::Debug,
{
    let req = authed(test::TestRequest::post().uri("/users").set_json(&body)).to_request();
    let resp = test::call_service(app, req).await;
    assert_eq!(resp.status(), 201, "seed insert failed");
    test::read_body_json(resp).await
}

#[actix_web::test]
async fn create_list_filter() {
    let app = make_app!(users_service());
    for (name, age, role, status) in [
        ("Alice", 30, "admin", "active"),
        ("Bob", 25, "user", "active"),
        ("Charlie", 35, "user", "inactive"),
    ] {
        seed_user(&app, json!({"name": name, "age": age, "role": role, "status": status}))
            .await;
    }

    let req = test::TestRequest::get()
        .uri("/users?filter=age%3E%3D30")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    let names: Vec<&str> = body["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item["name"].as_str().unwrap())
        .collect();
    assert_eq!(names.len(), 2);
    assert!(names.contains(&"Alice") && names.contains(&"Charlie"));

    // role=="user";status=="active"
    let req = test::TestRequest::get()
        .uri("/users?filter=role%3D%3D%22user%22%3Bstatus%3D%3D%22active%22")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["name"], "Bob");
}

#[actix_web::test]
async fn single_record_etag_and_not_modified() {
    let app = make_app!(users_service());
    let created =
        seed_user(&app, json!({"name": "Dave", "age": 40, "role": "user", "status": "active"}))
            .await;
    let id = created["id"].as_str().unwrap();

    let req = test::TestRequest::get().uri(&format!("/users/{id}")).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let etag = resp
        .headers()
        .get(header::ETAG)
        .unwrap()
        .to_str()
        .unwrap()
        .to_owned();
    assert!(etag.starts_with("W/\""));

    let req = test::TestRequest::get()
        .uri(&format!("/users/{id}"))
        .insert_header((header::IF_NONE_MATCH, etag))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 304);

    let req = test::TestRequest::get().uri("/users/nope").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}

#[actix_web::test]
async fn optimistic_concurrency() {
    let app = make_app!(users_service());
    let created =
        seed_user(&app, json!({"name": "Dave", "age": 40, "role": "user", "status": "active"}))
            .await;
    let id = created["id"].as_str().unwrap();

    let req = test::TestRequest::get().uri(&format!("/users/{id}")).to_request();
    let resp = test::call_service(&app, req).await;
    let etag0 = resp
        .headers()
        .get(header::ETAG)
        .unwrap()
        .to_str()
        .unwrap()
        .to_owned();

    // First conditional update wins and moves the ETag.
    let req = authed(
        test::TestRequest::patch()
            .uri(&format!("/users/{id}"))
            .insert_header((header::IF_MATCH, etag0.clone()))
            .set_json(json!({"age": 41})),
    )
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let etag1 = resp
        .headers()
        .get(header::ETAG)
        .unwrap()
        .to_str()
        .unwrap()
        .to_owned();
    assert_ne!(etag0, etag1);

    // Second writer still holds the old ETag and must lose.
    let req = authed(
        test::TestRequest::patch()
            .uri(&format!("/users/{id}"))
            .insert_header((header::IF_MATCH, etag0))
            .set_json(json!({"age": 42})),
    )
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 412);
    let problem: Value = test::read_body_json(resp).await;
    assert_eq!(problem["currentETag"], etag1);
    assert_eq!(problem["type"], "/__concave/problems/precondition-failed");
}

#[actix_web::test]
async fn if_match_star_asserts_existence_only() {
    let app = make_app!(users_service());
    let created =
        seed_user(&app, json!({"name": "Erin", "age": 20, "role": "user", "status": "active"}))
            .await;
    let id = created["id"].as_str().unwrap();

    let req = authed(
        test::TestRequest::patch()
            .uri(&format!("/users/{id}"))
            .insert_header((header::IF_MATCH, "*"))
            .set_json(json!({"age": 21})),
    )
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    // Still a 404 on a missing row.
    let req = authed(
        test::TestRequest::patch()
            .uri("/users/missing")
            .insert_header((header::IF_MATCH, "*"))
            .set_json(json!({"age": 21})),
    )
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}

#[actix_web::test]
async fn idempotency_replay_and_conflict() {
    let app = make_app!(users_service());
    let body = json!({"name": "Widget buyer", "age": 28, "role": "user", "status": "active"});

    let send = |body: Value| {
        authed(
            test::TestRequest::post()
                .uri("/users")
                .insert_header(("Idempotency-Key", "create-order-12345678"))
                .set_json(body),
        )
        .to_request()
    };

    let resp = test::call_service(&app, send(body.clone())).await;
    assert_eq!(resp.status(), 201);
    let first: Value = test::read_body_json(resp).await;
    let id = first["id"].as_str().unwrap().to_owned();

    // Same key, same body: replayed, not re-executed.
    let resp = test::call_service(&app, send(body.clone())).await;
    assert_eq!(resp.status(), 201);
    let second: Value = test::read_body_json(resp).await;
    assert_eq!(second["id"], id.as_str());

    let req = test::TestRequest::get().uri("/users?totalCount=true").to_request();
    let listed: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(listed["totalCount"], 1);

    // Same key, different body: conflict.
    let resp =
        test::call_service(&app, send(json!({"name": "Someone else", "age": 1}))).await;
    assert_eq!(resp.status(), 409);

    // Malformed key: validation error.
    let req = authed(
        test::TestRequest::post()
            .uri("/users")
            .insert_header(("Idempotency-Key", "short"))
            .set_json(json!({"name": "x"})),
    )
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_web::test]
async fn cursor_pagination_with_totals() {
    let app = make_app!(users_service());
    for i in 0..28 {
        seed_user(
            &app,
            json!({
                "id": format!("u{i:02}"),
                "name": format!("User {i:02}"),
                "age": 20 + i,
                "role": "user",
                "status": "active"
            }),
        )
        .await;
    }

    let mut seen: Vec<String> = Vec::new();
    let mut uri = "/users?limit=10&totalCount=true&orderBy=age:asc".to_owned();
    let mut pages = 0;
    loop {
        let req = test::TestRequest::get().uri(&uri).to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        let items = body["items"].as_array().unwrap();
        for item in items {
            let id = item["id"].as_str().unwrap().to_owned();
            assert!(!seen.contains(&id), "duplicate row {id} across pages");
            seen.push(id);
        }
        pages += 1;
        match (body["hasMore"].as_bool().unwrap(), body["nextCursor"].as_str()) {
            (true, Some(cursor)) => {
                assert_eq!(items.len(), 10);
                assert_eq!(body["totalCount"], 28);
                uri = format!("/users?limit=10&orderBy=age:asc&cursor={cursor}");
            }
            (false, _) => break,
            (true, None) => panic!("hasMore without a cursor"),
        }
    }
    assert_eq!(pages, 3);
    assert_eq!(seen.len(), 28);
    // Ages are ascending across the whole traversal.
    let ages: Vec<i64> = seen
        .iter()
        .map(|id| 20 + id[1..].parse::<i64>().unwrap())
        .collect();
    let mut sorted = ages.clone();
    sorted.sort();
    assert_eq!(ages, sorted);
}

#[actix_web::test]
async fn cursor_orderby_mismatch_is_rejected() {
    let app = make_app!(users_service());
    for i in 0..3 {
        seed_user(&app, json!({"name": format!("U{i}"), "age": i, "role": "user"})).await;
    }
    let req = test::TestRequest::get()
        .uri("/users?limit=2&orderBy=age:asc")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    let cursor = body["nextCursor"].as_str().unwrap();

    let req = test::TestRequest::get()
        .uri(&format!("/users?limit=2&orderBy=name:asc&cursor={cursor}"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_web::test]
async fn limit_clamps_to_max() {
    let service = {
        let descriptor = ResourceDescriptor::builder(users_table())
            .limits(2, 5)
            .build()
            .unwrap();
        ResourceService::new(descriptor, Arc::new(MemoryDriver::new()))
    };
    let app = make_app!(service);
    for i in 0..8 {
        seed_user(&app, json!({"name": format!("U{i}"), "age": i, "role": "user"})).await;
    }

    // Over the max: clamped, never errored.
    let req = test::TestRequest::get().uri("/users?limit=100").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["items"].as_array().unwrap().len(), 5);

    // Unspecified: the default.
    let req = test::TestRequest::get().uri("/users").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["items"].as_array().unwrap().len(), 2);
}

#[actix_web::test]
async fn batch_create_at_and_over_the_limit() {
    // maxCreate is 3 in the fixture.
    let app = make_app!(users_service());
    let items: Vec<Value> = (0..3)
        .map(|i| json!({"name": format!("B{i}"), "age": i, "role": "user"}))
        .collect();
    let req = authed(
        test::TestRequest::post()
            .uri("/users/batch")
            .set_json(json!({ "items": items })),
    )
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);

    let items: Vec<Value> = (0..4)
        .map(|i| json!({"name": format!("C{i}"), "age": i, "role": "user"}))
        .collect();
    let req = authed(
        test::TestRequest::post()
            .uri("/users/batch")
            .set_json(json!({ "items": items })),
    )
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    let req = test::TestRequest::get().uri("/users/count").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["count"], 3);
}

#[actix_web::test]
async fn bulk_update_and_delete_by_filter() {
    let app = make_app!(users_service());
    for (name, role) in [("A", "user"), ("B", "user"), ("C", "admin")] {
        seed_user(&app, json!({"name": name, "age": 30, "role": role, "status": "active"}))
            .await;
    }

    let req = authed(
        test::TestRequest::patch()
            .uri("/users/batch?filter=role%3D%3D%22user%22")
            .set_json(json!({"status": "suspended"})),
    )
    .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["count"], 2);

    let req = authed(
        test::TestRequest::delete().uri("/users/batch?filter=status%3D%3D%22suspended%22"),
    )
    .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["count"], 2);

    let req = test::TestRequest::get().uri("/users/count").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["count"], 1);
}

#[actix_web::test]
async fn aggregate_groups() {
    let app = make_app!(users_service());
    for (name, age, role) in [("A", 30, "admin"), ("B", 25, "user"), ("C", 35, "user")] {
        seed_user(&app, json!({"name": name, "age": age, "role": role, "status": "active"}))
            .await;
    }

    let req = test::TestRequest::get()
        .uri("/users/aggregate?groupBy=role&count=true&avg=age&max=age")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    let groups = body["groups"].as_array().unwrap();
    assert_eq!(groups.len(), 2);
    let users_group = groups
        .iter()
        .find(|g| g["key"]["role"] == "user")
        .expect("users group present");
    assert_eq!(users_group["count"], 2);
    assert_eq!(users_group["avg"]["age"], 30.0);
    assert_eq!(users_group["max"]["age"], 35);
}

#[actix_web::test]
async fn select_projection_keeps_primary_key() {
    let app = make_app!(users_service());
    seed_user(&app, json!({"name": "A", "age": 30, "role": "admin", "status": "active"})).await;

    let req = test::TestRequest::get()
        .uri("/users?select=name,ghost")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    let item = &body["items"][0];
    assert!(item.get("id").is_some());
    assert!(item.get("name").is_some());
    assert!(item.get("age").is_none());
    assert!(item.get("ghost").is_none());
}

#[actix_web::test]
async fn mutations_require_authentication() {
    let app = make_app!(users_service());
    // No Authorization header at all.
    let req = test::TestRequest::post()
        .uri("/users")
        .set_json(json!({"name": "X"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);

    // Invalid token degrades to anonymous.
    let req = test::TestRequest::post()
        .uri("/users")
        .insert_header((header::AUTHORIZATION, "Bearer wrong"))
        .set_json(json!({"name": "X"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);
}

#[actix_web::test]
async fn relation_path_filter_semi_joins() {
    let driver = Arc::new(MemoryDriver::new());
    let authors = TableHandle::new("authors", "id")
        .column("id", ColumnType::Text)
        .column("name", ColumnType::Text);
    let wc = WriteContext { resource: "authors".to_owned(), user_id: None, version_field: None };
    for (id, name) in [("a1", "Ada"), ("a2", "Brian")] {
        driver
            .insert(
                &authors,
                json!({"id": id, "name": name}).as_object().unwrap().clone(),
                &wc,
            )
            .await
            .unwrap();
    }

    let posts = TableHandle::new("posts", "id")
        .column("id", ColumnType::Text)
        .column("title", ColumnType::Text)
        .column("author_id", ColumnType::Text);
    let descriptor = ResourceDescriptor::builder(posts)
        .relation("author", RelationDef::belongs_to(authors, "author_id", "id"))
        .build()
        .unwrap();
    let service = ResourceService::new(descriptor, driver.clone());
    let app = test::init_service(
        App::new()
            .wrap(AuthMiddleware::new(Rc::new(StaticAuth)))
            .service(web::scope("/posts").configure(|cfg| service.configure(cfg))),
    )
    .await;

    for (id, title, author) in [("p1", "Intro", "a1"), ("p2", "Guide", "a2"), ("p3", "Draft", "a1")]
    {
        let req = authed(
            test::TestRequest::post()
                .uri("/posts")
                .set_json(json!({"id": id, "title": title, "author_id": author})),
        )
        .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 201);
    }

    // filter=author.name=="Ada" peels into a semi-join on author_id.
    let req = test::TestRequest::get()
        .uri("/posts?filter=author.name%3D%3D%22Ada%22&orderBy=id:asc")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    let ids: Vec<&str> = body["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["p1", "p3"]);

    // Count sees the same membership.
    let req = test::TestRequest::get()
        .uri("/posts/count?filter=author.name%3D%3D%22Ada%22")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["count"], 2);

    // Composes with local predicates.
    let req = test::TestRequest::get()
        .uri("/posts?filter=author.name%3D%3D%22Ada%22%3Btitle%3D%3D%22Intro%22")
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["items"].as_array().unwrap().len(), 1);

    // A relation path under a disjunction has no single-table rendering.
    let req = test::TestRequest::get()
        .uri("/posts?filter=author.name%3D%3D%22Ada%22%2Ctitle%3D%3D%22Guide%22")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
}

#[actix_web::test]
async fn delete_returns_no_content_and_version_header() {
    let app = make_app!(users_service());
    let created = seed_user(&app, json!({"name": "Gone", "age": 1, "role": "user"})).await;
    let id = created["id"].as_str().unwrap();

    let req = authed(test::TestRequest::delete().uri(&format!("/users/{id}"))).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 204);
    assert!(resp.headers().get("X-Resource-Version").is_some());

    let req = test::TestRequest::get().uri(&format!("/users/{id}")).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}
