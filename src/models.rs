//! Core data models flowing through the ingestion pipeline.
//!
//! A [`DataPoint`] is produced by a connection, tagged with a
//! [`HierarchicalPath`] once its topic is mapped, and consumed by every
//! downstream stage. [`TopicInfo`] is the durable per-topic record; its
//! `ns_path` is only ever set by consuming a `TopicAutoMapped` event,
//! never inferred inline.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, UnshubError};

/// Quality indicator attached to every incoming value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quality {
    Good,
    Uncertain,
    Bad,
}

/// A single normalized telemetry value.
///
/// Immutable once constructed. Does not own its storage location; the
/// pipeline attaches the resolved path when one is known.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPoint {
    pub id: Uuid,
    pub topic: String,
    pub path: Option<HierarchicalPath>,
    pub value: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    /// Tag identifying the producing system (connection name or id).
    pub source: String,
    pub quality: Quality,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl DataPoint {
    pub fn new(
        topic: impl Into<String>,
        value: serde_json::Value,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            path: None,
            value,
            timestamp: Utc::now(),
            source: source.into(),
            quality: Quality::Good,
            metadata: HashMap::new(),
        }
    }

    pub fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_path(mut self, path: HierarchicalPath) -> Self {
        self.path = Some(path);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// An ordered list of named hierarchy levels, e.g.
/// `Enterprise="Acme" / Site="Dallas" / Area="Press"`.
///
/// Level names always come from the active hierarchy configuration; a
/// path cannot reference an undefined level. Two paths are equal iff all
/// populated levels match, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchicalPath {
    levels: Vec<(String, String)>,
}

impl HierarchicalPath {
    /// Build a path by zipping level names with captured segment values.
    ///
    /// Fails if more segments are supplied than the hierarchy defines.
    pub fn from_segments(level_names: &[String], segments: &[String]) -> Result<Self> {
        if segments.len() > level_names.len() {
            return Err(UnshubError::Validation(format!(
                "path has {} segments but hierarchy defines only {} levels",
                segments.len(),
                level_names.len()
            )));
        }
        let levels = level_names
            .iter()
            .zip(segments.iter())
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        Ok(Self { levels })
    }

    /// The populated `(level name, value)` pairs, in hierarchy order.
    pub fn levels(&self) -> &[(String, String)] {
        &self.levels
    }

    /// Value at a named level, if populated.
    pub fn level(&self, name: &str) -> Option<&str> {
        self.levels
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Serialized form: level values joined by `/` (the NSPath).
    pub fn to_ns_path(&self) -> String {
        self.levels
            .iter()
            .map(|(_, v)| v.as_str())
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl std::fmt::Display for HierarchicalPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_ns_path())
    }
}

/// Durable per-topic record, created on first sighting.
///
/// `ns_path` stays `None` until a successful auto-mapping event is
/// consumed; an unmapped topic is still visible to operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicInfo {
    pub topic: String,
    /// Display name in the unified namespace (defaults to the last
    /// topic segment).
    pub uns_name: String,
    pub ns_path: Option<String>,
    pub source_type: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl TopicInfo {
    pub fn discovered(topic: impl Into<String>, source_type: impl Into<String>) -> Self {
        let topic = topic.into();
        let uns_name = topic.rsplit('/').next().unwrap_or(&topic).to_string();
        let now = Utc::now();
        Self {
            topic,
            uns_name,
            ns_path: None,
            source_type: source_type.into(),
            active: true,
            created_at: now,
            modified_at: now,
        }
    }
}

/// What changed about a topic configuration record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopicChangeKind {
    Created,
    Updated,
    Deleted,
    NamespaceAssignmentChanged,
    UnsNameChanged,
}

/// Connection status state machine.
///
/// Transitions: Disabled → Connecting → Connected | Error;
/// Connected → Disconnected → Connecting (retry) or Stopping;
/// Stopping → Disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ServiceStatus {
    Disabled,
    Connecting,
    Connected,
    Disconnected,
    Error,
    Stopping,
    #[default]
    Unknown,
}

impl ServiceStatus {
    /// Whether the state machine permits moving to `next`.
    pub fn can_transition_to(self, next: ServiceStatus) -> bool {
        use ServiceStatus::*;
        match (self, next) {
            // Re-entering the same status carries updated diagnostics only.
            (a, b) if a == b => true,
            (Unknown, _) => true,
            (Disabled, Connecting) => true,
            (Connecting, Connected | Error | Stopping) => true,
            (Connected, Disconnected | Stopping | Error) => true,
            (Disconnected, Connecting | Stopping) => true,
            (Error, Connecting | Stopping) => true,
            (Stopping, Disabled) => true,
            _ => false,
        }
    }

    /// Active means the connection holds or is acquiring resources.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ServiceStatus::Connecting | ServiceStatus::Connected | ServiceStatus::Disconnected
        )
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceStatus::Disabled => "disabled",
            ServiceStatus::Connecting => "connecting",
            ServiceStatus::Connected => "connected",
            ServiceStatus::Disconnected => "disconnected",
            ServiceStatus::Error => "error",
            ServiceStatus::Stopping => "stopping",
            ServiceStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn levels() -> Vec<String> {
        vec!["Enterprise".into(), "Site".into(), "Area".into()]
    }

    #[test]
    fn test_path_from_segments() {
        let path = HierarchicalPath::from_segments(
            &levels(),
            &["Acme".to_string(), "Dallas".to_string(), "Press".to_string()],
        )
        .unwrap();
        assert_eq!(path.level("Site"), Some("Dallas"));
        assert_eq!(path.to_ns_path(), "Acme/Dallas/Press");
        assert_eq!(path.depth(), 3);
    }

    #[test]
    fn test_partial_path_allowed() {
        let path = HierarchicalPath::from_segments(&levels(), &["Acme".to_string()]).unwrap();
        assert_eq!(path.depth(), 1);
        assert_eq!(path.level("Area"), None);
    }

    #[test]
    fn test_too_many_segments_rejected() {
        let segs: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        assert!(HierarchicalPath::from_segments(&levels(), &segs).is_err());
    }

    #[test]
    fn test_path_equality() {
        let a =
            HierarchicalPath::from_segments(&levels(), &["Acme".into(), "Dallas".into()]).unwrap();
        let b =
            HierarchicalPath::from_segments(&levels(), &["Acme".into(), "Dallas".into()]).unwrap();
        let c =
            HierarchicalPath::from_segments(&levels(), &["Acme".into(), "Austin".into()]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_status_transitions() {
        use ServiceStatus::*;
        assert!(Disabled.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connecting.can_transition_to(Error));
        assert!(Connected.can_transition_to(Disconnected));
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Stopping.can_transition_to(Disabled));
        assert!(!Disabled.can_transition_to(Connected));
        assert!(!Stopping.can_transition_to(Connected));
        // Idempotent re-entry is allowed.
        assert!(Connected.can_transition_to(Connected));
    }

    #[test]
    fn test_discovered_topic_defaults() {
        let info = TopicInfo::discovered("plant/line1/temp", "mqtt");
        assert_eq!(info.uns_name, "temp");
        assert!(info.ns_path.is_none());
        assert!(info.active);
    }
}
