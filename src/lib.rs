// ABOUTME: Library root for pg-mirror
// ABOUTME: Exposes the mirroring engine, connection helpers, filters and metrics

pub mod error;
pub mod filters;
pub mod metrics;
pub mod mirror;
pub mod postgres;
pub mod utils;

pub use error::{SchemaIssue, SyncError};
