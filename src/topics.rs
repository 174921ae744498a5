//! Durable topic-configuration store contract.
//!
//! The pipeline records every sighted topic here. Namespace assignment
//! goes through [`TopicRepository::assign_namespace`] only, driven by a
//! consumed `TopicAutoMapped` event — never inline in the mapper.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{Result, UnshubError};
use crate::models::TopicInfo;

/// Abstract store for per-topic configuration records.
#[async_trait]
pub trait TopicRepository: Send + Sync {
    /// Record a sighting of `topic`. Creates the record on first sight;
    /// returns the record and whether it was newly created.
    async fn record_sighting(&self, topic: &str, source_type: &str) -> Result<(TopicInfo, bool)>;

    async fn get(&self, topic: &str) -> Result<Option<TopicInfo>>;

    async fn list(&self) -> Result<Vec<TopicInfo>>;

    /// Set the NSPath on an existing record.
    async fn assign_namespace(&self, topic: &str, ns_path: &str) -> Result<()>;

    /// Change the UNS display name.
    async fn rename(&self, topic: &str, uns_name: &str) -> Result<()>;

    async fn remove(&self, topic: &str) -> Result<()>;
}

/// In-memory repository; the durable backend for single-process use and
/// the reference implementation for tests.
#[derive(Default)]
pub struct InMemoryTopicRepository {
    topics: RwLock<HashMap<String, TopicInfo>>,
}

impl InMemoryTopicRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TopicRepository for InMemoryTopicRepository {
    async fn record_sighting(&self, topic: &str, source_type: &str) -> Result<(TopicInfo, bool)> {
        let mut topics = self.topics.write().unwrap();
        if let Some(info) = topics.get(topic) {
            return Ok((info.clone(), false));
        }
        let info = TopicInfo::discovered(topic, source_type);
        topics.insert(topic.to_string(), info.clone());
        Ok((info, true))
    }

    async fn get(&self, topic: &str) -> Result<Option<TopicInfo>> {
        Ok(self.topics.read().unwrap().get(topic).cloned())
    }

    async fn list(&self) -> Result<Vec<TopicInfo>> {
        Ok(self.topics.read().unwrap().values().cloned().collect())
    }

    async fn assign_namespace(&self, topic: &str, ns_path: &str) -> Result<()> {
        let mut topics = self.topics.write().unwrap();
        let info = topics
            .get_mut(topic)
            .ok_or_else(|| UnshubError::NotFound(format!("topic '{topic}'")))?;
        info.ns_path = Some(ns_path.to_string());
        info.modified_at = chrono::Utc::now();
        Ok(())
    }

    async fn rename(&self, topic: &str, uns_name: &str) -> Result<()> {
        let mut topics = self.topics.write().unwrap();
        let info = topics
            .get_mut(topic)
            .ok_or_else(|| UnshubError::NotFound(format!("topic '{topic}'")))?;
        info.uns_name = uns_name.to_string();
        info.modified_at = chrono::Utc::now();
        Ok(())
    }

    async fn remove(&self, topic: &str) -> Result<()> {
        self.topics
            .write()
            .unwrap()
            .remove(topic)
            .map(|_| ())
            .ok_or_else(|| UnshubError::NotFound(format!("topic '{topic}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_sighting_creates_record() {
        let repo = InMemoryTopicRepository::new();
        let (info, created) = repo.record_sighting("plant/press/temp", "sim").await.unwrap();
        assert!(created);
        assert_eq!(info.uns_name, "temp");
        assert!(info.ns_path.is_none());

        let (again, created) = repo.record_sighting("plant/press/temp", "sim").await.unwrap();
        assert!(!created);
        assert_eq!(again.topic, info.topic);
    }

    #[tokio::test]
    async fn test_assignment_only_touches_existing_records() {
        let repo = InMemoryTopicRepository::new();
        let err = repo.assign_namespace("ghost", "Acme/Dallas").await.unwrap_err();
        assert!(matches!(err, UnshubError::NotFound(_)));

        repo.record_sighting("plant/press/temp", "sim").await.unwrap();
        repo.assign_namespace("plant/press/temp", "Acme/Dallas/Press")
            .await
            .unwrap();
        let info = repo.get("plant/press/temp").await.unwrap().unwrap();
        assert_eq!(info.ns_path.as_deref(), Some("Acme/Dallas/Press"));
    }

    #[tokio::test]
    async fn test_remove_unknown_topic_is_not_found() {
        let repo = InMemoryTopicRepository::new();
        assert!(matches!(
            repo.remove("ghost").await.unwrap_err(),
            UnshubError::NotFound(_)
        ));
    }
}
