//! Widget persistence on top of a sharded key-value store.
//!
//! - [`store`]: the backend trait, pipelines/transactions, the scoped
//!   [`Store`](store::Store) handle, and the embedded [`MemoryStore`](store::MemoryStore).
//! - [`keys`]: the key schema and hash-slot computation.
//! - [`models`]: records, stats, submissions, and request DTOs.
//! - [`repositories`]: record store, index maintenance, filter queries,
//!   batch loading, counters, submissions, and index rebuilds.
//! - [`service`]: the [`WidgetService`](service::WidgetService) facade used by
//!   handlers and background jobs.

pub mod error;
pub mod keys;
pub mod models;
pub mod repositories;
pub mod service;
pub mod store;

pub use error::{ServiceError, ServiceResult, StoreError};
pub use service::WidgetService;
pub use store::{MemoryStore, RequestContext, Store, StoreConfig};
