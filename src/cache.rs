//! In-memory cache of topic configuration keyed by topic and by NSPath.
//!
//! Readers (the pipeline's path resolution, hierarchy queries) hit this
//! cache instead of the repository. Freshness comes from two sources:
//! bus events applied incrementally, and a periodic full reconciliation
//! against the repository that also covers the case where the event
//! subscription lagged and dropped events.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{EventBus, UnsEvent};
use crate::error::Result;
use crate::models::{TopicChangeKind, TopicInfo};
use crate::topics::TopicRepository;

#[derive(Default)]
struct State {
    by_topic: HashMap<String, TopicInfo>,
    /// NSPath -> topics assigned there. BTreeMap so prefix queries are
    /// ordered range scans.
    by_path: BTreeMap<String, HashSet<String>>,
}

impl State {
    fn insert(&mut self, info: TopicInfo) {
        self.remove(&info.topic);
        if let Some(ns_path) = &info.ns_path {
            self.by_path
                .entry(ns_path.clone())
                .or_default()
                .insert(info.topic.clone());
        }
        self.by_topic.insert(info.topic.clone(), info);
    }

    fn remove(&mut self, topic: &str) {
        if let Some(old) = self.by_topic.remove(topic) {
            if let Some(ns_path) = &old.ns_path {
                if let Some(set) = self.by_path.get_mut(ns_path) {
                    set.remove(topic);
                    if set.is_empty() {
                        self.by_path.remove(ns_path);
                    }
                }
            }
        }
    }
}

/// Topic-configuration cache. All read methods are lock-cheap and
/// synchronous; refresh paths are async repository calls.
pub struct NamespaceCache {
    repo: std::sync::Arc<dyn TopicRepository>,
    state: RwLock<State>,
}

impl NamespaceCache {
    pub fn new(repo: std::sync::Arc<dyn TopicRepository>) -> Self {
        Self {
            repo,
            state: RwLock::new(State::default()),
        }
    }

    pub fn get(&self, topic: &str) -> Option<TopicInfo> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_topic
            .get(topic)
            .cloned()
    }

    /// All cached topics assigned at or under `path_prefix`. An empty
    /// prefix returns every topic with an NSPath.
    pub fn topics_under(&self, path_prefix: &str) -> Vec<TopicInfo> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .by_path
            .range(path_prefix.to_string()..)
            .take_while(|(path, _)| path.starts_with(path_prefix))
            .filter(|(path, _)| {
                path_prefix.is_empty()
                    || path.as_str() == path_prefix
                    || path[path_prefix.len()..].starts_with('/')
            })
            .flat_map(|(_, topics)| topics.iter())
            .filter_map(|topic| state.by_topic.get(topic).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_topic
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all cached entries; the next reconciliation repopulates.
    pub fn invalidate(&self) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = State::default();
    }

    /// Rebuild the whole cache from the repository.
    pub async fn reconcile(&self) -> Result<()> {
        let topics = self.repo.list().await?;
        let mut state = State::default();
        for info in topics {
            state.insert(info);
        }
        let count = state.by_topic.len();
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = state;
        debug!(topics = count, "cache reconciled");
        Ok(())
    }

    async fn refresh_topic(&self, topic: &str) -> Result<()> {
        let mut state_update = self.repo.get(topic).await?;
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        match state_update.take() {
            Some(info) => state.insert(info),
            None => state.remove(topic),
        }
        Ok(())
    }

    fn apply(&self, event: &UnsEvent) -> Option<String> {
        match event {
            UnsEvent::TopicDiscovered { topic, .. } => Some(topic.clone()),
            // The NSPath lands in the repository when this event is
            // consumed by the assignment task; refreshing here pre-warms
            // the entry and catches up if that write already happened.
            UnsEvent::TopicAutoMapped { topic, .. } => Some(topic.clone()),
            UnsEvent::TopicConfigurationChanged { topic, change } => {
                if *change == TopicChangeKind::Deleted {
                    self.state
                        .write()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(topic);
                    None
                } else {
                    Some(topic.clone())
                }
            }
            _ => None,
        }
    }

    /// Event + timer maintenance loop. Runs until `cancel` fires.
    pub async fn run(&self, bus: EventBus, reconcile_interval: Duration, cancel: CancellationToken) {
        let mut events = bus.subscribe();
        let mut tick = tokio::time::interval(reconcile_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        if let Err(err) = self.reconcile().await {
            warn!(%err, "initial cache reconciliation failed");
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => {
                    if let Err(err) = self.reconcile().await {
                        warn!(%err, "periodic cache reconciliation failed");
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        if let Some(topic) = self.apply(&event) {
                            if let Err(err) = self.refresh_topic(&topic).await {
                                warn!(topic, %err, "cache refresh failed");
                            }
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        // Dropped events mean unknown staleness; rebuild.
                        warn!(missed, "cache event stream lagged, reconciling");
                        if let Err(err) = self.reconcile().await {
                            warn!(%err, "post-lag cache reconciliation failed");
                        }
                    }
                    Err(RecvError::Closed) => return,
                },
            }
        }
    }
}
