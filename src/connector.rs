//! Connection contract and connector-type registry.
//!
//! A [`Connection`] is the polymorphic unit the core consumes: identity,
//! lifecycle, outbound sends, and two event streams (data received,
//! status changed) pushed through the channel handed over at creation.
//! Concrete protocol clients (MQTT, SocketIO, OPC UA, ...) live outside
//! the core; they plug in through a [`ConnectorFactory`] registered by
//! connection-type string — an explicit registration table, no runtime
//! type discovery.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, UnshubError};
use crate::models::{DataPoint, ServiceStatus};

/// One input or output port on a connection.
///
/// `params` is connector-specific, like `ConnectionConfig::params`:
/// an MQTT output would carry its publish topic here, a SocketIO input
/// its event name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoPortConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Configuration for one connection instance.
///
/// `params` is the connector-specific section; each factory deserializes
/// it into its own strongly-typed struct during validation, so the tag
/// (`connection_type`) plus `params` form a tagged variant dispatched
/// through the registry. `inputs`/`outputs` are applied to the live
/// connection at start and individually reconfigurable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub id: String,
    pub name: String,
    pub connection_type: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub inputs: Vec<IoPortConfig>,
    #[serde(default)]
    pub outputs: Vec<IoPortConfig>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

impl PartialEq for ConnectionConfig {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.connection_type == other.connection_type
            && self.enabled == other.enabled
            && self.auto_start == other.auto_start
            && self.params == other.params
            && self.inputs == other.inputs
            && self.outputs == other.outputs
            && self.tags == other.tags
    }
}

/// Events a connection pushes to the manager's fan-in channel.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A value arrived from the remote system.
    Data {
        connection_id: String,
        point: DataPoint,
    },
    /// The connection observed a runtime status change on its own
    /// (e.g. the remote side dropped). Lifecycle transitions driven by
    /// the manager are not reported here.
    Status {
        connection_id: String,
        status: ServiceStatus,
        message: Option<String>,
    },
}

/// Result of validating a connector-specific configuration.
#[derive(Debug, Clone, Default)]
pub struct ValidationOutcome {
    pub errors: Vec<String>,
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A live connection instance. The manager serializes all lifecycle
/// calls per connection, so `&mut self` here never races.
#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> &str;

    /// Prepare resources; called once before the first `start`.
    async fn initialize(&mut self) -> Result<()>;

    /// Begin producing events. Must return promptly (spawn internal
    /// tasks); honors `cancel` for shutdown of everything it spawned.
    async fn start(&mut self, cancel: CancellationToken) -> Result<()>;

    /// Release all connector resources. Safe to call when not started.
    async fn stop(&mut self) -> Result<()>;

    /// Attach or replace an input port. Connectors without configurable
    /// inputs keep the default rejection.
    async fn configure_input(&mut self, config: IoPortConfig) -> Result<()> {
        let _ = config;
        Err(UnshubError::Validation(format!(
            "connection '{}' does not support configurable inputs",
            self.id()
        )))
    }

    async fn remove_input(&mut self, input_id: &str) -> Result<()> {
        let _ = input_id;
        Err(UnshubError::Validation(format!(
            "connection '{}' does not support configurable inputs",
            self.id()
        )))
    }

    /// Attach or replace an output port.
    async fn configure_output(&mut self, config: IoPortConfig) -> Result<()> {
        let _ = config;
        Err(UnshubError::Validation(format!(
            "connection '{}' does not support configurable outputs",
            self.id()
        )))
    }

    async fn remove_output(&mut self, output_id: &str) -> Result<()> {
        let _ = output_id;
        Err(UnshubError::Validation(format!(
            "connection '{}' does not support configurable outputs",
            self.id()
        )))
    }

    /// Route an outbound value to the remote system, optionally through
    /// a configured output port.
    async fn send_data(&mut self, point: DataPoint, output_id: Option<&str>) -> Result<()>;
}

/// Factory + validator for one connection type.
pub trait ConnectorFactory: Send + Sync {
    /// Type identifier matched against `ConnectionConfig::connection_type`.
    fn type_id(&self) -> &str;

    /// Validate the connector-specific `params` without side effects.
    fn validate(&self, config: &ConnectionConfig) -> ValidationOutcome;

    /// Build a connection that reports through `events`.
    fn create(
        &self,
        config: &ConnectionConfig,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Result<Box<dyn Connection>>;
}

/// Registration table mapping connection-type strings to factories.
pub struct ConnectorRegistry {
    factories: HashMap<String, Arc<dyn ConnectorFactory>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry pre-loaded with the built-in simulated connector.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::connector_sim::SimConnectorFactory));
        registry
    }

    pub fn register(&mut self, factory: Arc<dyn ConnectorFactory>) {
        self.factories.insert(factory.type_id().to_string(), factory);
    }

    pub fn get(&self, type_id: &str) -> Option<&Arc<dyn ConnectorFactory>> {
        self.factories.get(type_id)
    }

    pub fn supports(&self, type_id: &str) -> bool {
        self.factories.contains_key(type_id)
    }

    pub fn type_ids(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Full validation of a connection config: type support plus the
    /// factory's own parameter checks.
    pub fn validate(&self, config: &ConnectionConfig) -> Result<()> {
        if config.id.is_empty() {
            return Err(UnshubError::Validation("connection id is empty".into()));
        }
        for (what, ports) in [("input", &config.inputs), ("output", &config.outputs)] {
            let mut seen = std::collections::HashSet::new();
            for port in ports.iter() {
                if port.id.is_empty() {
                    return Err(UnshubError::Validation(format!(
                        "connection '{}' has an {what} with an empty id",
                        config.id
                    )));
                }
                if !seen.insert(port.id.as_str()) {
                    return Err(UnshubError::Validation(format!(
                        "connection '{}' has duplicate {what} id '{}'",
                        config.id, port.id
                    )));
                }
            }
        }
        let factory = self.get(&config.connection_type).ok_or_else(|| {
            UnshubError::Validation(format!(
                "unsupported connection type '{}'",
                config.connection_type
            ))
        })?;
        let outcome = factory.validate(config);
        if !outcome.is_valid() {
            return Err(UnshubError::Validation(format!(
                "connection '{}': {}",
                config.id,
                outcome.errors.join("; ")
            )));
        }
        Ok(())
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_supports_sim() {
        let registry = ConnectorRegistry::with_builtins();
        assert!(registry.supports("sim"));
        assert!(!registry.supports("mqtt"));
    }

    #[test]
    fn test_unsupported_type_fails_validation() {
        let registry = ConnectorRegistry::with_builtins();
        let config = ConnectionConfig {
            id: "c1".into(),
            name: "c1".into(),
            connection_type: "mqtt".into(),
            enabled: true,
            auto_start: false,
            params: serde_json::Value::Null,
            inputs: vec![],
            outputs: vec![],
            tags: vec![],
        };
        assert!(matches!(
            registry.validate(&config).unwrap_err(),
            UnshubError::Validation(_)
        ));
    }

    #[test]
    fn test_duplicate_output_id_fails_validation() {
        let registry = ConnectorRegistry::with_builtins();
        let port = IoPortConfig {
            id: "out1".into(),
            name: String::new(),
            params: serde_json::Value::Null,
        };
        let config = ConnectionConfig {
            id: "c1".into(),
            name: "c1".into(),
            connection_type: "sim".into(),
            enabled: true,
            auto_start: false,
            params: serde_json::json!({ "topics": ["t"] }),
            inputs: vec![],
            outputs: vec![port.clone(), port],
            tags: vec![],
        };
        assert!(matches!(
            registry.validate(&config).unwrap_err(),
            UnshubError::Validation(_)
        ));
    }
}
