//! Storage contracts for the persistence boundary.
//!
//! The core composes against these traits; concrete engines (SQL-backed
//! or otherwise) are external collaborators. [`memory`] provides the
//! in-process backends used for single-process deployments and tests,
//! [`retry`] the mandatory retry policy for durable backends.
//!
//! All operations are async (via `async-trait`); in-memory
//! implementations return immediately-ready futures.

pub mod memory;
pub mod retry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::DataPoint;

/// Latest-value-per-topic store. Exactly one row per topic,
/// last-write-wins; `store` is idempotent under retry.
#[async_trait]
pub trait RealtimeStore: Send + Sync {
    async fn store(&self, point: &DataPoint) -> Result<()>;

    async fn latest(&self, topic: &str) -> Result<Option<DataPoint>>;

    /// Latest values for every topic whose NSPath starts with
    /// `path_prefix`.
    async fn latest_by_path(&self, path_prefix: &str) -> Result<Vec<DataPoint>>;

    async fn topics(&self) -> Result<Vec<String>>;

    async fn delete(&self, topic: &str) -> Result<()>;
}

/// Append-only time-series store with retention.
#[async_trait]
pub trait HistoricalStore: Send + Sync {
    async fn store(&self, point: &DataPoint) -> Result<()>;

    /// Append a batch. The default implementation falls back to per-item
    /// calls so backends without native batch support degrade gracefully;
    /// batch-capable backends override it and chunk internally to bound
    /// memory and lock duration.
    async fn store_bulk(&self, points: &[DataPoint]) -> Result<()> {
        for point in points {
            self.store(point).await?;
        }
        Ok(())
    }

    async fn history(
        &self,
        topic: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DataPoint>>;

    async fn history_by_path(
        &self,
        path_prefix: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DataPoint>>;

    /// Rows that `archive(before)` would remove, without removing them
    /// (the retention dry-run).
    async fn cleanup_count(&self, before: DateTime<Utc>) -> Result<u64>;

    /// Remove rows older than `before`; returns the count removed.
    async fn archive(&self, before: DateTime<Utc>) -> Result<u64>;
}

/// Whether a stored point's serialized path falls under `prefix`.
/// An empty prefix matches every mapped point.
pub(crate) fn path_matches(point: &DataPoint, prefix: &str) -> bool {
    match &point.path {
        Some(path) => {
            let ns = path.to_ns_path();
            ns == prefix
                || ns.starts_with(prefix) && ns.as_bytes().get(prefix.len()) == Some(&b'/')
                || prefix.is_empty()
        }
        None => false,
    }
}
