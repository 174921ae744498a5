use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::connector::ConnectionConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub hierarchy: HierarchyConfig,
    #[serde(default)]
    pub namespaces: Vec<NamespaceNodeConfig>,
    #[serde(default)]
    pub mapping: MappingConfig,
    #[serde(default)]
    pub historical: HistoricalStorageConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

/// Ordered level definitions for the ISA-95-style hierarchy,
/// e.g. `["Enterprise", "Site", "Area", "Line", "Unit", "Property"]`.
#[derive(Debug, Deserialize, Clone)]
pub struct HierarchyConfig {
    pub levels: Vec<String>,
}

/// A named namespace node anchored at a hierarchy path.
#[derive(Debug, Deserialize, Clone)]
pub struct NamespaceNodeConfig {
    pub name: String,
    #[serde(default)]
    pub kind: NamespaceKind,
    /// Slash-joined level values, e.g. `"Acme/Dallas/Press"`.
    pub path: String,
    /// Name of the parent namespace node, resolved by lookup (no direct
    /// back-pointers).
    #[serde(default)]
    pub parent: Option<String>,
    /// Whether raw topics may be auto-assigned under this node.
    #[serde(default)]
    pub allow_topics: bool,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum NamespaceKind {
    #[default]
    Functional,
    Informative,
    Definitional,
    AdHoc,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MappingConfig {
    /// Token templates evaluated in order, e.g.
    /// `"{Prefix}/{Enterprise}/{Site}/{Area}"`.
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub policy: MatchPolicy,
    /// Protocol prefixes stripped before tokenization (e.g. `"spBv1.0"`,
    /// `"virtualfactory/update"`).
    #[serde(default)]
    pub strip_prefixes: Vec<String>,
}

/// Tie-break policy when several patterns match a topic.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MatchPolicy {
    /// First matching pattern in configuration order wins.
    #[default]
    ConfigOrder,
    /// Pattern with the most fixed (non-placeholder) tokens wins; ties
    /// fall back to configuration order.
    MostSpecific,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HistoricalStorageConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_true")]
    pub auto_cleanup: bool,
    /// WAL toggle, forwarded to SQL-backed providers.
    #[serde(default = "default_true")]
    pub wal: bool,
    /// Per-topic value cap for the in-memory provider; oldest rows are
    /// dropped first.
    #[serde(default = "default_max_values")]
    pub max_values_per_topic: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl Default for HistoricalStorageConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            retention_days: default_retention_days(),
            auto_cleanup: true,
            wal: true,
            max_values_per_topic: default_max_values(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

fn default_provider() -> String {
    "memory".to_string()
}
fn default_retention_days() -> u32 {
    30
}
fn default_true() -> bool {
    true
}
fn default_max_values() -> usize {
    10_000
}
fn default_batch_size() -> usize {
    1_000
}
fn default_flush_interval_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_reconcile_secs")]
    pub reconcile_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_reconcile_secs(),
        }
    }
}

fn default_reconcile_secs() -> u64 {
    30
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.hierarchy.levels.is_empty() {
        anyhow::bail!("hierarchy.levels must not be empty");
    }

    let mut seen = std::collections::HashSet::new();
    for level in &config.hierarchy.levels {
        if !seen.insert(level.as_str()) {
            anyhow::bail!("hierarchy.levels contains duplicate level '{}'", level);
        }
    }

    for ns in &config.namespaces {
        let depth = ns.path.split('/').filter(|s| !s.is_empty()).count();
        if depth == 0 {
            anyhow::bail!("namespace '{}' has an empty path", ns.name);
        }
        if depth > config.hierarchy.levels.len() {
            anyhow::bail!(
                "namespace '{}' path has {} segments but hierarchy defines only {} levels",
                ns.name,
                depth,
                config.hierarchy.levels.len()
            );
        }
    }

    match config.historical.provider.as_str() {
        "memory" | "external" => {}
        other => anyhow::bail!(
            "Unknown historical provider: '{}'. Must be memory or external.",
            other
        ),
    }
    if config.historical.batch_size == 0 {
        anyhow::bail!("historical.batch_size must be > 0");
    }
    if config.historical.max_values_per_topic == 0 {
        anyhow::bail!("historical.max_values_per_topic must be > 0");
    }
    if config.cache.reconcile_interval_secs == 0 {
        anyhow::bail!("cache.reconcile_interval_secs must be > 0");
    }

    let mut ids = std::collections::HashSet::new();
    for conn in &config.connections {
        if conn.id.is_empty() {
            anyhow::bail!("connection '{}' has an empty id", conn.name);
        }
        if !ids.insert(conn.id.as_str()) {
            anyhow::bail!("duplicate connection id '{}'", conn.id);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_minimal_config() {
        let f = write_config(
            r#"
[hierarchy]
levels = ["Enterprise", "Site", "Area"]
"#,
        );
        let config = load_config(f.path()).unwrap();
        assert_eq!(config.hierarchy.levels.len(), 3);
        assert_eq!(config.historical.retention_days, 30);
        assert_eq!(config.mapping.policy, MatchPolicy::ConfigOrder);
        assert!(config.namespaces.is_empty());
    }

    #[test]
    fn test_full_config() {
        let f = write_config(
            r#"
[hierarchy]
levels = ["Enterprise", "Site", "Area"]

[[namespaces]]
name = "press-shop"
path = "Acme/Dallas/Press"
allow_topics = true
kind = "functional"

[mapping]
patterns = ["{Enterprise}/{Site}/{Area}"]
policy = "most-specific"
strip_prefixes = ["spBv1.0"]

[historical]
retention_days = 7
auto_cleanup = false
max_values_per_topic = 100

[cache]
reconcile_interval_secs = 5

[[connections]]
id = "press-mqtt"
name = "Press MQTT"
connection_type = "sim"
auto_start = true
"#,
        );
        let config = load_config(f.path()).unwrap();
        assert_eq!(config.mapping.policy, MatchPolicy::MostSpecific);
        assert_eq!(config.historical.retention_days, 7);
        assert_eq!(config.connections.len(), 1);
        assert!(config.connections[0].auto_start);
        assert_eq!(config.namespaces[0].kind, NamespaceKind::Functional);
    }

    #[test]
    fn test_empty_hierarchy_rejected() {
        let f = write_config("[hierarchy]\nlevels = []\n");
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn test_namespace_deeper_than_hierarchy_rejected() {
        let f = write_config(
            r#"
[hierarchy]
levels = ["Enterprise"]

[[namespaces]]
name = "too-deep"
path = "Acme/Dallas"
"#,
        );
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn test_duplicate_connection_id_rejected() {
        let f = write_config(
            r#"
[hierarchy]
levels = ["Enterprise"]

[[connections]]
id = "a"
name = "one"
connection_type = "sim"

[[connections]]
id = "a"
name = "two"
connection_type = "sim"
"#,
        );
        assert!(load_config(f.path()).is_err());
    }
}
