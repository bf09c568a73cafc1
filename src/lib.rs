//! # Concave
//!
//! A declarative resource-oriented HTTP framework. Given a relational table
//! (schema + primary key) it synthesises a full REST surface: filtering,
//! keyset pagination, ordering, batch operations, aggregations, optimistic
//! concurrency via ETags, idempotent mutation, scoped authorization, live
//! subscriptions over server-sent events and a per-resource changelog.
//!
//! The crate is storage-agnostic. All reads and writes go through the
//! [`storage::StorageDriver`] trait; the bundled [`storage::MemoryDriver`]
//! is the reference implementation and the one the test-suite runs against.
//! Filters compile once into both a SQL predicate (for SQL-backed drivers)
//! and an in-memory record predicate; the two agree on truth values with
//! SQL's null semantics.
//!
//! ## Wiring
//!
//! ```no_run
//! use std::sync::Arc;
//! use actix_web::{App, HttpServer, web};
//! use concave::{
//!     resource::{ResourceDescriptor, ResourceService},
//!     storage::{ColumnType, MemoryDriver, TableHandle},
//! };
//!
//! #[actix_web::main]
//! async fn main() -> std::io::Result<()> {
//!     let table = TableHandle::new("users", "id")
//!         .column("id", ColumnType::Text)
//!         .column("name", ColumnType::Text)
//!         .column("age", ColumnType::Integer);
//!     let descriptor = ResourceDescriptor::builder(table)
//!         .build()
//!         .expect("valid descriptor");
//!     let driver = Arc::new(MemoryDriver::new());
//!     let service = ResourceService::new(descriptor, driver);
//!     HttpServer::new(move || {
//!         let service = service.clone();
//!         App::new().service(web::scope("/users").configure(move |cfg| service.configure(cfg)))
//!     })
//!     .bind(("127.0.0.1", 8080))?
//!     .run()
//!     .await
//! }
//! ```

pub mod auth;
pub mod changelog;
pub mod error;
pub mod filter;
pub mod idempotency;
pub mod kv;
pub mod models;
pub mod resource;
pub mod scope;
pub mod search;
pub mod session;
pub mod storage;
pub mod subscription;
pub mod tasks;

pub use error::ApiError;
pub use models::{Record, RequestContext, UserContext};
