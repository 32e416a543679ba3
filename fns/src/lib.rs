//! Function-as-a-service runtime substrate.
//!
//! A process hosts named services, each exposing named functions invoked by
//! JSON-bodied requests. This crate provides the request-execution core:
//! the endpoint dispatcher, the bounded worker pool, the single-flight
//! barrier, the cluster membership mirror, the shared store/lockers/caches
//! substrate, the per-request span tree and the signed internal envelope
//! used between peers. The HTTP surface lives in the `fns-httpd` crate.
#![allow(clippy::type_complexity)]

pub mod argument;
pub mod barrier;
pub mod cluster;
pub mod config;
pub mod context;
pub mod errors;
pub mod future;
pub mod header;
#[cfg(feature = "logger")]
pub mod logger;
pub mod runtime;
pub mod services;
pub mod shared;
pub mod signature;
pub mod tracer;
pub mod versions;
pub mod workers;

pub use argument::Argument;
pub use barrier::{Barrier, ClusterBarrier, LocalBarrier};
pub use cluster::{Cluster, Node};
pub use config::Config;
pub use context::Context;
pub use errors::CodeError;
pub use future::{future, Future, Promise};
pub use runtime::Runtime;
pub use services::{
    Document, Endpoint, Endpoints, FnDocument, Registrations, Request, Service, User,
};
pub use shared::{Scope, Shared};
pub use signature::Signer;
pub use tracer::{Span, SpanTree, Tracer};
pub use versions::{AcceptedVersions, Version, VersionRange};
pub use workers::{Task, Workers};
