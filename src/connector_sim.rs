//! Built-in simulated connection.
//!
//! Emits a configurable stream of topic/value pairs on a timer — the
//! stand-in source for development and tests, and the reference for how
//! a protocol connector plugs into the registry. Outbound sends are
//! looped back as received data so round-trips are observable without a
//! remote system.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use std::collections::HashMap;

use crate::connector::{
    Connection, ConnectionConfig, ConnectionEvent, ConnectorFactory, IoPortConfig,
    ValidationOutcome,
};
use crate::error::{Result, UnshubError};
use crate::models::DataPoint;

pub const SIM_TYPE: &str = "sim";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimParams {
    /// Topics emitted round-robin, one per tick.
    pub topics: Vec<String>,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Total number of emissions, unlimited when absent.
    #[serde(default)]
    pub count: Option<u64>,
}

fn default_interval_ms() -> u64 {
    100
}

pub struct SimConnection {
    id: String,
    name: String,
    params: SimParams,
    events: mpsc::Sender<ConnectionEvent>,
    outputs: HashMap<String, IoPortConfig>,
    task: Option<JoinHandle<()>>,
}

impl SimConnection {
    fn new(config: &ConnectionConfig, params: SimParams, events: mpsc::Sender<ConnectionEvent>) -> Self {
        Self {
            id: config.id.clone(),
            name: config.name.clone(),
            params,
            events,
            outputs: HashMap::new(),
            task: None,
        }
    }
}

#[async_trait]
impl Connection for SimConnection {
    fn id(&self) -> &str {
        &self.id
    }

    async fn initialize(&mut self) -> Result<()> {
        if self.params.topics.is_empty() {
            return Err(UnshubError::Validation(format!(
                "sim connection '{}' has no topics",
                self.id
            )));
        }
        Ok(())
    }

    async fn start(&mut self, cancel: CancellationToken) -> Result<()> {
        let params = self.params.clone();
        let events = self.events.clone();
        let connection_id = self.id.clone();
        let source = self.name.clone();

        self.task = Some(tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_millis(params.interval_ms.max(1)));
            let mut emitted = 0u64;
            loop {
                if params.count.is_some_and(|max| emitted >= max) {
                    debug!(connection_id, emitted, "sim emission budget reached");
                    return;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = interval.tick() => {}
                }
                let topic = &params.topics[(emitted as usize) % params.topics.len()];
                let point =
                    DataPoint::new(topic.clone(), serde_json::json!(emitted), source.clone());
                emitted += 1;
                if events
                    .send(ConnectionEvent::Data {
                        connection_id: connection_id.clone(),
                        point,
                    })
                    .await
                    .is_err()
                {
                    // Manager side is gone; nothing left to emit to.
                    return;
                }
            }
        }));
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        Ok(())
    }

    async fn send_data(&mut self, point: DataPoint, output_id: Option<&str>) -> Result<()> {
        if let Some(output_id) = output_id {
            if !self.outputs.contains_key(output_id) {
                return Err(UnshubError::NotFound(format!(
                    "output '{output_id}' on connection '{}'",
                    self.id
                )));
            }
        }
        debug!(connection_id = %self.id, topic = %point.topic, ?output_id, "sim loopback send");
        self.events
            .send(ConnectionEvent::Data {
                connection_id: self.id.clone(),
                point,
            })
            .await
            .map_err(|_| UnshubError::NotConnected(self.id.clone()))
    }

    async fn configure_output(&mut self, port: IoPortConfig) -> Result<()> {
        debug!(connection_id = %self.id, output_id = %port.id, "sim output configured");
        self.outputs.insert(port.id.clone(), port);
        Ok(())
    }

    async fn remove_output(&mut self, output_id: &str) -> Result<()> {
        if self.outputs.remove(output_id).is_none() {
            return Err(UnshubError::NotFound(format!(
                "output '{output_id}' on connection '{}'",
                self.id
            )));
        }
        Ok(())
    }
}

pub struct SimConnectorFactory;

impl ConnectorFactory for SimConnectorFactory {
    fn type_id(&self) -> &str {
        SIM_TYPE
    }

    fn validate(&self, config: &ConnectionConfig) -> ValidationOutcome {
        let mut outcome = ValidationOutcome::default();
        match serde_json::from_value::<SimParams>(config.params.clone()) {
            Ok(params) => {
                if params.topics.is_empty() {
                    outcome.errors.push("topics must not be empty".into());
                }
                if params.interval_ms == 0 {
                    outcome.errors.push("interval_ms must be > 0".into());
                }
            }
            Err(err) => outcome.errors.push(format!("invalid sim params: {err}")),
        }
        outcome
    }

    fn create(
        &self,
        config: &ConnectionConfig,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Result<Box<dyn Connection>> {
        let params: SimParams = serde_json::from_value(config.params.clone())
            .map_err(|err| UnshubError::Validation(format!("invalid sim params: {err}")))?;
        Ok(Box::new(SimConnection::new(config, params, events)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(params: serde_json::Value) -> ConnectionConfig {
        ConnectionConfig {
            id: "sim1".into(),
            name: "Sim One".into(),
            connection_type: SIM_TYPE.into(),
            enabled: true,
            auto_start: false,
            params,
            inputs: vec![],
            outputs: vec![],
            tags: vec![],
        }
    }

    #[test]
    fn test_validate_rejects_empty_topics() {
        let factory = SimConnectorFactory;
        let outcome = factory.validate(&config(serde_json::json!({ "topics": [] })));
        assert!(!outcome.is_valid());
    }

    #[tokio::test]
    async fn test_emits_points_until_cancelled() {
        let (tx, mut rx) = mpsc::channel(64);
        let factory = SimConnectorFactory;
        let cfg = config(serde_json::json!({
            "topics": ["plant/press/temp"],
            "interval_ms": 1,
            "count": 3
        }));
        let mut conn = factory.create(&cfg, tx).unwrap();
        conn.initialize().await.unwrap();

        let cancel = CancellationToken::new();
        conn.start(cancel.clone()).await.unwrap();

        let mut received = 0;
        while received < 3 {
            match rx.recv().await.unwrap() {
                ConnectionEvent::Data { connection_id, point } => {
                    assert_eq!(connection_id, "sim1");
                    assert_eq!(point.topic, "plant/press/temp");
                    assert_eq!(point.source, "Sim One");
                    received += 1;
                }
                ConnectionEvent::Status { .. } => {}
            }
        }

        cancel.cancel();
        conn.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_data_loops_back() {
        let (tx, mut rx) = mpsc::channel(8);
        let factory = SimConnectorFactory;
        let cfg = config(serde_json::json!({ "topics": ["t"] }));
        let mut conn = factory.create(&cfg, tx).unwrap();

        let outbound = || DataPoint::new("cmd/press/setpoint", serde_json::json!(42), "ui");

        // Routing to an output that was never configured is an error.
        assert!(matches!(
            conn.send_data(outbound(), Some("out1")).await.unwrap_err(),
            UnshubError::NotFound(_)
        ));

        conn.configure_output(IoPortConfig {
            id: "out1".into(),
            name: String::new(),
            params: serde_json::Value::Null,
        })
        .await
        .unwrap();
        conn.send_data(outbound(), Some("out1")).await.unwrap();

        match rx.recv().await.unwrap() {
            ConnectionEvent::Data { point, .. } => {
                assert_eq!(point.topic, "cmd/press/setpoint");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        conn.remove_output("out1").await.unwrap();
        assert!(matches!(
            conn.send_data(outbound(), Some("out1")).await.unwrap_err(),
            UnshubError::NotFound(_)
        ));
    }
}
