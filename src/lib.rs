//! mishard — sharding middleware for vector-search clusters.
//!
//! Sits in front of a fleet of vector-search backend nodes and presents the
//! same request/response contract as a single node. For each search it
//! resolves the logical table into a routing plan (which backend holds which
//! file shards), fans the sub-queries out in parallel over pooled
//! connections, and merges the partial top-K answers into one
//! globally-correct result honoring the table's distance metric.
//!
//! Module map, bottom up: [`meta`] (table metadata and the metadata-store
//! seam), [`pool`] (backend connection pool), [`router`] (routing plans),
//! [`dispatch`] (parallel fan-out), [`merge`] (partial-result merging),
//! [`handler`] (request orchestration), [`service`] (the gRPC surface).

pub mod pb {
    tonic::include_proto!("mishard.grpc");
}

pub mod backend;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod merge;
pub mod meta;
pub mod pool;
pub mod router;
pub mod service;
pub mod testing;

pub use crate::error::{ShardError, ShardResult};

/// Version string reported by `Cmd("version")`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
