//! # hvctl – ESXi Inventory & Control
//!
//! Connection-pooled, retrying client façade over ESXi / vCenter management
//! endpoints, with a short-TTL inventory cache and uniform status
//! translation.
//!
//! ## Modules
//!
//! - **types**: Shared data structures (endpoints, references, snapshots, host/datastore/VM values)
//! - **error**: Crate-specific error types
//! - **config**: Service configuration (cache TTL, timeouts, retry policy, VM limits)
//! - **status**: Remote status enumerations and the translator
//! - **api**: `ManagementApi`, the remote capability contract
//! - **xml**: Small XML tree used by the SOAP transport
//! - **vim**: vim25 SOAP implementation of `ManagementApi`
//! - **session**: Per-endpoint session lifecycle, login retry with backoff
//! - **cache**: Inventory cache with single-flight misses
//! - **host**: Host resolution and host snapshots
//! - **storage**: Datastore listing
//! - **vm**: VM create validation and creation
//! - **service**: Aggregate façade

pub mod types;
pub mod error;
pub mod config;
pub mod status;
pub mod api;
pub mod xml;
pub mod vim;
pub mod session;
pub mod cache;
pub mod host;
pub mod storage;
pub mod vm;
pub mod service;

pub use api::ManagementApi;
pub use cache::CachePolicy;
pub use config::ServiceConfig;
pub use error::{EsxiError, EsxiErrorKind, EsxiResult};
pub use service::{CallOptions, InventoryService};
