//! In-memory storage backends.
//!
//! `HashMap`s behind `std::sync::RwLock`; locks are never held across an
//! await. The historical store honors the configured per-topic value cap
//! (oldest rows dropped first) and chunks bulk appends to bound lock
//! duration.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{path_matches, HistoricalStore, RealtimeStore};
use crate::error::Result;
use crate::models::DataPoint;

/// Rows appended per lock acquisition during bulk store.
const BULK_CHUNK: usize = 1_000;

/// Last-value-per-topic store.
#[derive(Default)]
pub struct InMemoryRealtimeStore {
    latest: RwLock<HashMap<String, DataPoint>>,
}

impl InMemoryRealtimeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RealtimeStore for InMemoryRealtimeStore {
    async fn store(&self, point: &DataPoint) -> Result<()> {
        self.latest
            .write()
            .unwrap()
            .insert(point.topic.clone(), point.clone());
        Ok(())
    }

    async fn latest(&self, topic: &str) -> Result<Option<DataPoint>> {
        Ok(self.latest.read().unwrap().get(topic).cloned())
    }

    async fn latest_by_path(&self, path_prefix: &str) -> Result<Vec<DataPoint>> {
        Ok(self
            .latest
            .read()
            .unwrap()
            .values()
            .filter(|p| path_matches(p, path_prefix))
            .cloned()
            .collect())
    }

    async fn topics(&self) -> Result<Vec<String>> {
        Ok(self.latest.read().unwrap().keys().cloned().collect())
    }

    async fn delete(&self, topic: &str) -> Result<()> {
        self.latest.write().unwrap().remove(topic);
        Ok(())
    }
}

/// Append-only time-series store with a per-topic cap.
pub struct InMemoryHistoricalStore {
    rows: RwLock<HashMap<String, Vec<DataPoint>>>,
    max_values_per_topic: usize,
}

impl InMemoryHistoricalStore {
    pub fn new(max_values_per_topic: usize) -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            max_values_per_topic,
        }
    }

    fn append_locked(rows: &mut HashMap<String, Vec<DataPoint>>, point: &DataPoint, cap: usize) {
        let series = rows.entry(point.topic.clone()).or_default();
        series.push(point.clone());
        if series.len() > cap {
            let excess = series.len() - cap;
            series.drain(..excess);
        }
    }
}

#[async_trait]
impl HistoricalStore for InMemoryHistoricalStore {
    async fn store(&self, point: &DataPoint) -> Result<()> {
        let mut rows = self.rows.write().unwrap();
        Self::append_locked(&mut rows, point, self.max_values_per_topic);
        Ok(())
    }

    async fn store_bulk(&self, points: &[DataPoint]) -> Result<()> {
        // One lock acquisition per chunk, so a huge batch cannot pin the
        // write lock for its whole duration.
        for chunk in points.chunks(BULK_CHUNK) {
            let mut rows = self.rows.write().unwrap();
            for point in chunk {
                Self::append_locked(&mut rows, point, self.max_values_per_topic);
            }
        }
        Ok(())
    }

    async fn history(
        &self,
        topic: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DataPoint>> {
        Ok(self
            .rows
            .read()
            .unwrap()
            .get(topic)
            .map(|series| {
                series
                    .iter()
                    .filter(|p| p.timestamp >= from && p.timestamp <= to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn history_by_path(
        &self,
        path_prefix: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DataPoint>> {
        let rows = self.rows.read().unwrap();
        let mut out: Vec<DataPoint> = rows
            .values()
            .flat_map(|series| series.iter())
            .filter(|p| p.timestamp >= from && p.timestamp <= to && path_matches(p, path_prefix))
            .cloned()
            .collect();
        out.sort_by_key(|p| p.timestamp);
        Ok(out)
    }

    async fn cleanup_count(&self, before: DateTime<Utc>) -> Result<u64> {
        Ok(self
            .rows
            .read()
            .unwrap()
            .values()
            .flat_map(|series| series.iter())
            .filter(|p| p.timestamp < before)
            .count() as u64)
    }

    async fn archive(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut rows = self.rows.write().unwrap();
        let mut removed = 0u64;
        for series in rows.values_mut() {
            let len_before = series.len();
            series.retain(|p| p.timestamp >= before);
            removed += (len_before - series.len()) as u64;
        }
        rows.retain(|_, series| !series.is_empty());
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HierarchicalPath;
    use chrono::Duration;
    use std::sync::Arc;

    fn point(topic: &str, value: i64) -> DataPoint {
        DataPoint::new(topic, serde_json::json!(value), "test")
    }

    fn mapped_point(topic: &str, value: i64, ns: &[&str]) -> DataPoint {
        let levels: Vec<String> = vec!["Enterprise".into(), "Site".into(), "Area".into()];
        let segs: Vec<String> = ns.iter().map(|s| s.to_string()).collect();
        point(topic, value).with_path(HierarchicalPath::from_segments(&levels, &segs).unwrap())
    }

    #[tokio::test]
    async fn test_realtime_last_write_wins() {
        let store = InMemoryRealtimeStore::new();
        store.store(&point("t", 1)).await.unwrap();
        store.store(&point("t", 2)).await.unwrap();
        let latest = store.latest("t").await.unwrap().unwrap();
        assert_eq!(latest.value, serde_json::json!(2));
        assert_eq!(store.topics().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_realtime_store_idempotent_under_retry() {
        let store = InMemoryRealtimeStore::new();
        let p = point("t", 7);
        store.store(&p).await.unwrap();
        store.store(&p).await.unwrap();
        assert_eq!(store.topics().await.unwrap().len(), 1);
        assert_eq!(store.latest("t").await.unwrap().unwrap().id, p.id);
    }

    #[tokio::test]
    async fn test_latest_by_path_prefix() {
        let store = InMemoryRealtimeStore::new();
        store
            .store(&mapped_point("a", 1, &["Acme", "Dallas", "Press"]))
            .await
            .unwrap();
        store
            .store(&mapped_point("b", 2, &["Acme", "Dallas", "Paint"]))
            .await
            .unwrap();
        store
            .store(&mapped_point("c", 3, &["Acme", "Austin", "Press"]))
            .await
            .unwrap();
        store.store(&point("unmapped", 4)).await.unwrap();

        assert_eq!(store.latest_by_path("Acme/Dallas").await.unwrap().len(), 2);
        assert_eq!(store.latest_by_path("Acme").await.unwrap().len(), 3);
        // "Acme/Dal" is not a level boundary and must not match.
        assert!(store.latest_by_path("Acme/Dal").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_historical_value_cap_drops_oldest() {
        let store = InMemoryHistoricalStore::new(3);
        for i in 0..5 {
            let p = point("t", i).with_timestamp(Utc::now() + Duration::seconds(i));
            store.store(&p).await.unwrap();
        }
        let all = store
            .history("t", Utc::now() - Duration::hours(1), Utc::now() + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].value, serde_json::json!(2));
    }

    #[tokio::test]
    async fn test_bulk_store_persists_all_chunks() {
        let store = InMemoryHistoricalStore::new(10_000);
        let points: Vec<DataPoint> = (0..2_500).map(|i| point(&format!("t{}", i % 7), i)).collect();
        store.store_bulk(&points).await.unwrap();

        let from = Utc::now() - Duration::hours(1);
        let to = Utc::now() + Duration::hours(1);
        let mut total = 0;
        for i in 0..7 {
            total += store.history(&format!("t{i}"), from, to).await.unwrap().len();
        }
        assert_eq!(total, 2_500);
    }

    #[tokio::test]
    async fn test_concurrent_bulk_stores_lose_nothing() {
        let store = Arc::new(InMemoryHistoricalStore::new(100_000));
        let mut handles = Vec::new();
        for task in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let points: Vec<DataPoint> =
                    (0..500).map(|i| point(&format!("t{task}"), i)).collect();
                store.store_bulk(&points).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let from = Utc::now() - Duration::hours(1);
        let to = Utc::now() + Duration::hours(1);
        for task in 0..8 {
            let rows = store.history(&format!("t{task}"), from, to).await.unwrap();
            assert_eq!(rows.len(), 500);
        }
    }

    #[tokio::test]
    async fn test_retention_dry_run_matches_removed_count() {
        let store = InMemoryHistoricalStore::new(10_000);
        let now = Utc::now();
        for days_ago in [1, 10, 31, 45] {
            let p = point("t", days_ago).with_timestamp(now - Duration::days(days_ago));
            store.store(&p).await.unwrap();
        }

        let cutoff = now - Duration::days(30);
        let would_remove = store.cleanup_count(cutoff).await.unwrap();
        assert_eq!(would_remove, 2);

        let removed = store.archive(cutoff).await.unwrap();
        assert_eq!(removed, would_remove);

        let remaining = store
            .history("t", now - Duration::days(365), now)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|p| p.timestamp >= cutoff));
    }
}
