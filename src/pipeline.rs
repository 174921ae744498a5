//! Ingestion pipeline: received data -> discovery -> mapping -> storage.
//!
//! One ingest loop consumes the manager's data stream. Every point gets
//! its topic sighted in the repository, first sightings publish
//! `TopicDiscovered`, unmapped topics are offered to the auto-mapper,
//! and a successful mapping publishes `TopicAutoMapped`. The visible
//! NSPath is assigned only by the assignment consumer when that event
//! arrives — the mapper itself never writes to the repository.
//!
//! Storage: the realtime store is written per point, the historical
//! store through a size/time bounded batch. Both go through the retry
//! policy; a point that still fails is logged and dropped rather than
//! stalling ingestion.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, UnsEvent};
use crate::cache::NamespaceCache;
use crate::config::Config;
use crate::error::Result;
use crate::manager::{ConnectionManager, ReceivedData};
use crate::mapping::AutoTopicMapper;
use crate::models::{DataPoint, HierarchicalPath, TopicChangeKind};
use crate::namespace::NamespaceIndex;
use crate::storage::retry::RetryPolicy;
use crate::storage::{HistoricalStore, RealtimeStore};
use crate::topics::TopicRepository;

const RETENTION_SWEEP_SECS: u64 = 3_600;

struct Inner {
    manager: ConnectionManager,
    bus: EventBus,
    repo: Arc<dyn TopicRepository>,
    cache: Arc<NamespaceCache>,
    mapper: AutoTopicMapper,
    realtime: Arc<dyn RealtimeStore>,
    historical: Arc<dyn HistoricalStore>,
    retry: RetryPolicy,
    batch: Mutex<Vec<DataPoint>>,
    levels: Vec<String>,
    batch_size: usize,
    flush_interval: std::time::Duration,
    reconcile_interval: std::time::Duration,
    retention_days: u32,
    auto_cleanup: bool,
    cancel: CancellationToken,
}

/// The assembled ingestion pipeline. Cheap to clone; `start` spawns the
/// background loops, `shutdown` drains and stops them.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    pub fn new(
        config: &Config,
        manager: ConnectionManager,
        bus: EventBus,
        repo: Arc<dyn TopicRepository>,
        realtime: Arc<dyn RealtimeStore>,
        historical: Arc<dyn HistoricalStore>,
    ) -> Result<Self> {
        let namespaces = NamespaceIndex::from_config(config)?;
        let mapper = AutoTopicMapper::new(config, namespaces)?;
        let cache = Arc::new(NamespaceCache::new(Arc::clone(&repo)));
        Ok(Self {
            inner: Arc::new(Inner {
                manager,
                bus,
                repo,
                cache,
                mapper,
                realtime,
                historical,
                retry: RetryPolicy::default(),
                batch: Mutex::new(Vec::new()),
                levels: config.hierarchy.levels.clone(),
                batch_size: config.historical.batch_size,
                flush_interval: std::time::Duration::from_millis(
                    config.historical.flush_interval_ms,
                ),
                reconcile_interval: std::time::Duration::from_secs(
                    config.cache.reconcile_interval_secs,
                ),
                retention_days: config.historical.retention_days,
                auto_cleanup: config.historical.auto_cleanup,
                cancel: CancellationToken::new(),
            }),
        })
    }

    /// Spawn the ingest, assignment, cache and retention loops.
    pub fn start(&self, data_rx: mpsc::Receiver<ReceivedData>) {
        let ingest = self.clone();
        tokio::spawn(async move { ingest.run_ingest(data_rx).await });

        let assign = self.clone();
        tokio::spawn(async move { assign.run_assignment().await });

        let cache = self.clone();
        tokio::spawn(async move {
            let bus = cache.inner.bus.clone();
            let interval = cache.inner.reconcile_interval;
            let cancel = cache.inner.cancel.clone();
            cache.inner.cache.run(bus, interval, cancel).await;
        });

        let retention = self.clone();
        tokio::spawn(async move { retention.run_retention().await });
        info!("pipeline started");
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.inner.manager
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn cache(&self) -> &NamespaceCache {
        &self.inner.cache
    }

    /// Swap in an updated namespace tree. Drops the mapper's resolution
    /// cache so every topic re-resolves against the new tree.
    pub fn apply_namespace_update(&self, config: &Config) -> Result<()> {
        let namespaces = NamespaceIndex::from_config(config)?;
        self.inner.mapper.update_namespaces(namespaces);
        info!("namespace tree updated, mapping cache invalidated");
        Ok(())
    }

    /// Drain the historical batch buffer now.
    pub async fn flush(&self) {
        self.flush_batch().await;
    }

    /// Stop everything: background loops, buffered writes, connections.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.flush_batch().await;
        self.inner.manager.shutdown().await;
        info!("pipeline stopped");
    }

    async fn run_ingest(&self, mut data_rx: mpsc::Receiver<ReceivedData>) {
        let mut flush_tick = tokio::time::interval(self.inner.flush_interval);
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => {
                    self.flush_batch().await;
                    return;
                }
                _ = flush_tick.tick() => self.flush_batch().await,
                item = data_rx.recv() => match item {
                    Some(received) => self.ingest_one(received).await,
                    None => {
                        self.flush_batch().await;
                        return;
                    }
                },
            }
        }
    }

    async fn ingest_one(&self, received: ReceivedData) {
        let ReceivedData {
            connection_id,
            connection_type,
            mut point,
        } = received;

        let (info, created) = match self
            .inner
            .repo
            .record_sighting(&point.topic, &connection_type)
            .await
        {
            Ok(pair) => pair,
            Err(err) => {
                error!(topic = %point.topic, %err, "topic sighting failed, dropping point");
                return;
            }
        };
        if created {
            debug!(topic = %point.topic, connection_id, "new topic discovered");
            self.inner.bus.publish(UnsEvent::TopicDiscovered {
                topic: point.topic.clone(),
                source_type: connection_type,
            });
        }

        match &info.ns_path {
            Some(ns_path) => {
                if let Some(path) = self.parse_ns_path(ns_path) {
                    point.path = Some(path);
                }
            }
            None => {
                // Re-offered on every sighting: a namespace update can
                // make a previously unmappable topic resolve.
                if let Some(path) = self.inner.mapper.try_map_topic(&point.topic) {
                    self.inner.bus.publish(UnsEvent::TopicAutoMapped {
                        topic: point.topic.clone(),
                        path,
                    });
                }
            }
        }

        let realtime = Arc::clone(&self.inner.realtime);
        let stored = self
            .inner
            .retry
            .run("realtime store", || {
                let realtime = Arc::clone(&realtime);
                let point = point.clone();
                async move { realtime.store(&point).await }
            })
            .await;
        if let Err(err) = stored {
            error!(topic = %point.topic, %err, "realtime store failed, value lost");
        }

        let flush_now = {
            let mut batch = self.inner.batch.lock().await;
            batch.push(point);
            batch.len() >= self.inner.batch_size
        };
        if flush_now {
            self.flush_batch().await;
        }
    }

    async fn flush_batch(&self) {
        let points = {
            let mut batch = self.inner.batch.lock().await;
            if batch.is_empty() {
                return;
            }
            std::mem::take(&mut *batch)
        };
        let count = points.len();
        let historical = Arc::clone(&self.inner.historical);
        let result = self
            .inner
            .retry
            .run("historical bulk store", || {
                let historical = Arc::clone(&historical);
                let points = points.clone();
                async move { historical.store_bulk(&points).await }
            })
            .await;
        match result {
            Ok(()) => debug!(count, "historical batch flushed"),
            Err(err) => error!(count, %err, "historical batch lost"),
        }
    }

    fn parse_ns_path(&self, ns_path: &str) -> Option<HierarchicalPath> {
        let segments: Vec<String> = ns_path.split('/').map(str::to_string).collect();
        match HierarchicalPath::from_segments(&self.inner.levels, &segments) {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(ns_path, %err, "stored path does not fit the hierarchy");
                None
            }
        }
    }

    /// Consumes `TopicAutoMapped` and performs the actual assignment.
    /// Kept separate from mapping so a crash between the two leaves the
    /// topic merely unmapped, never half-assigned.
    async fn run_assignment(&self) {
        let mut events = self.inner.bus.subscribe();
        loop {
            let event = tokio::select! {
                _ = self.inner.cancel.cancelled() => return,
                event = events.recv() => event,
            };
            match event {
                Ok(UnsEvent::TopicAutoMapped { topic, path }) => {
                    let ns_path = path.to_ns_path();
                    match self.inner.repo.assign_namespace(&topic, &ns_path).await {
                        Ok(()) => {
                            info!(topic, ns_path, "topic assigned to namespace");
                            self.inner.bus.publish(UnsEvent::TopicConfigurationChanged {
                                topic,
                                change: TopicChangeKind::NamespaceAssignmentChanged,
                            });
                        }
                        Err(err) => {
                            warn!(topic, ns_path, %err, "namespace assignment failed");
                        }
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "assignment consumer lagged, mappings re-offered on next sighting");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// Periodic retention sweep: dry-run count first, then archive, and
    /// the two must agree.
    async fn run_retention(&self) {
        if !self.inner.auto_cleanup {
            return;
        }
        let mut tick =
            tokio::time::interval(std::time::Duration::from_secs(RETENTION_SWEEP_SECS));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick fires immediately; skip it so startup is quiet.
        tick.tick().await;
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return,
                _ = tick.tick() => {}
            }
            let cutoff = Utc::now() - chrono::Duration::days(self.inner.retention_days as i64);
            let pending = match self.inner.historical.cleanup_count(cutoff).await {
                Ok(n) => n,
                Err(err) => {
                    warn!(%err, "retention dry-run failed");
                    continue;
                }
            };
            if pending == 0 {
                continue;
            }
            match self.inner.historical.archive(cutoff).await {
                Ok(removed) => {
                    if removed != pending {
                        warn!(pending, removed, "retention sweep removed a different count than the dry-run reported");
                    } else {
                        info!(removed, %cutoff, "retention sweep complete");
                    }
                }
                Err(err) => warn!(%err, "retention sweep failed"),
            }
        }
    }
}
