//! # Resource pipeline
//!
//! Everything between the HTTP surface and the storage driver for one
//! resource: the descriptor (configuration), the pipeline (authorization,
//! hooks, storage, changelog, response shaping), the route handlers, and
//! the supporting codecs (cursor, ETag) plus the relation loader.

pub mod cursor;
mod descriptor;
pub mod etag;
mod handlers;
mod pipeline;
pub mod relations;

pub use descriptor::{
    AfterHook, BeforeHook, DescriptorBuilder, Hooks, RelationDef, RelationKind,
    ResourceDescriptor, ThroughDef, DEFAULT_MUTATION_TIMEOUT, LIMIT_CEILING,
};
pub use handlers::ResourceService;
pub use pipeline::{ListParams, ListResponse, Mutated, ResourcePipeline};
