//! Connection lifecycle management.
//!
//! The [`ConnectionManager`] owns every configured connection: it
//! validates configs through the registry, drives the status state
//! machine, serializes lifecycle calls per connection, and fans all
//! connector events into a single stream. Connector failures during
//! start are contained — the connection lands in `Error` status and the
//! call still returns `Ok` — so one bad endpoint never takes down the
//! pipeline.
//!
//! Locking: the entry map holds `Arc<Entry>` values that are cloned out
//! before any await, so no map guard is ever held across an await. The
//! per-entry `tokio::sync::Mutex` is what serializes start/stop/update
//! for one connection without blocking the others.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, UnsEvent};
use crate::connector::{
    Connection, ConnectionConfig, ConnectionEvent, ConnectorRegistry, IoPortConfig,
};
use crate::error::{Result, UnshubError};
use crate::models::ServiceStatus;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const DATA_CHANNEL_CAPACITY: usize = 256;

/// Point-in-time status of one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusInfo {
    pub status: ServiceStatus,
    pub message: Option<String>,
    pub changed_at: DateTime<Utc>,
}

impl StatusInfo {
    fn initial() -> Self {
        Self {
            status: ServiceStatus::Unknown,
            message: None,
            changed_at: Utc::now(),
        }
    }
}

/// One received value, tagged with its producing connection.
#[derive(Debug)]
pub struct ReceivedData {
    pub connection_id: String,
    pub connection_type: String,
    pub point: crate::models::DataPoint,
}

struct Slot {
    connection: Option<Box<dyn Connection>>,
    cancel: Option<CancellationToken>,
}

struct Entry {
    config: std::sync::RwLock<ConnectionConfig>,
    slot: Mutex<Slot>,
    status_tx: watch::Sender<StatusInfo>,
}

impl Entry {
    fn new(config: ConnectionConfig) -> Self {
        let (status_tx, _rx) = watch::channel(StatusInfo::initial());
        Self {
            config: std::sync::RwLock::new(config),
            slot: Mutex::new(Slot {
                connection: None,
                cancel: None,
            }),
            status_tx,
        }
    }

    fn config(&self) -> ConnectionConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn status(&self) -> StatusInfo {
        self.status_tx.borrow().clone()
    }

    /// Apply a status transition, enforcing the state machine and
    /// publishing the change on the bus. An invalid transition is
    /// dropped (logged), never applied.
    fn transition(&self, id: &str, bus: &EventBus, next: ServiceStatus, message: Option<String>) {
        let old = self.status_tx.borrow().status;
        if !old.can_transition_to(next) {
            warn!(connection_id = id, %old, %next, "invalid status transition dropped");
            return;
        }
        if old == next && message.is_none() {
            return;
        }
        // send_replace, not send: the status must stick even while
        // nobody holds a watch subscription.
        self.status_tx.send_replace(StatusInfo {
            status: next,
            message,
            changed_at: Utc::now(),
        });
        if old != next {
            debug!(connection_id = id, %old, %next, "connection status changed");
            bus.publish(UnsEvent::ConnectionStatusChanged {
                connection_id: id.to_string(),
                old,
                new: next,
            });
        }
    }
}

/// Resets a connection left in `Connecting` to `Error` if the start
/// call is dropped before it settles (a caller-side timeout drops the
/// future mid-await). Disarmed on every path that reaches a stable
/// status.
struct StartGuard<'a> {
    entry: &'a Entry,
    id: &'a str,
    bus: &'a EventBus,
    armed: bool,
}

impl StartGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.entry.transition(
                self.id,
                self.bus,
                ServiceStatus::Error,
                Some("start cancelled".into()),
            );
        }
    }
}

struct Inner {
    registry: ConnectorRegistry,
    bus: EventBus,
    entries: DashMap<String, Arc<Entry>>,
    events_tx: mpsc::Sender<ConnectionEvent>,
}

impl Inner {
    fn entry(&self, id: &str) -> Result<Arc<Entry>> {
        self.entries
            .get(id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| UnshubError::NotFound(format!("connection '{id}'")))
    }
}

/// Lifecycle manager for all configured connections. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Build the manager and the stream of received data. The returned
    /// receiver carries every `Data` event from every connection;
    /// runtime `Status` events are consumed internally.
    pub fn new(registry: ConnectorRegistry, bus: EventBus) -> (Self, mpsc::Receiver<ReceivedData>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (data_tx, data_rx) = mpsc::channel(DATA_CHANNEL_CAPACITY);
        let inner = Arc::new(Inner {
            registry,
            bus,
            entries: DashMap::new(),
            events_tx,
        });
        tokio::spawn(forward_events(Arc::downgrade(&inner), events_rx, data_tx));
        (Self { inner }, data_rx)
    }

    /// Register a connection. Validates the config, rejects duplicate
    /// ids, and auto-starts when the config asks for it.
    pub async fn create(&self, config: ConnectionConfig) -> Result<()> {
        self.inner.registry.validate(&config)?;
        let id = config.id.clone();
        let auto_start = config.enabled && config.auto_start;
        let entry = Arc::new(Entry::new(config));
        use dashmap::mapref::entry::Entry as MapEntry;
        match self.inner.entries.entry(id.clone()) {
            MapEntry::Occupied(_) => {
                return Err(UnshubError::Validation(format!(
                    "connection '{id}' already exists"
                )));
            }
            MapEntry::Vacant(slot) => {
                entry.transition(&id, &self.inner.bus, ServiceStatus::Disabled, None);
                slot.insert(entry);
            }
        }
        info!(connection_id = %id, "connection created");
        if auto_start {
            self.start(&id).await?;
        }
        Ok(())
    }

    /// Start a connection. Idempotent: starting an already-active
    /// connection is a no-op. Connector failures are contained — the
    /// connection transitions to `Error` and the call returns `Ok`.
    pub async fn start(&self, id: &str) -> Result<()> {
        let entry = self.inner.entry(id)?;
        let config = entry.config();
        if !config.enabled {
            return Err(UnshubError::Validation(format!(
                "connection '{id}' is disabled"
            )));
        }
        let mut slot = entry.slot.lock().await;
        // Disconnected is deliberately startable (the retry path);
        // only an already-running connection is a no-op.
        if matches!(
            entry.status().status,
            ServiceStatus::Connected | ServiceStatus::Connecting
        ) {
            debug!(connection_id = id, "start ignored, already active");
            return Ok(());
        }
        entry.transition(id, &self.inner.bus, ServiceStatus::Connecting, None);
        let guard = StartGuard {
            entry: &entry,
            id,
            bus: &self.inner.bus,
            armed: true,
        };

        if slot.connection.is_none() {
            let factory = match self.inner.registry.get(&config.connection_type) {
                Some(f) => Arc::clone(f),
                None => {
                    // Registry changed since create; surface as Error status.
                    entry.transition(
                        id,
                        &self.inner.bus,
                        ServiceStatus::Error,
                        Some(format!(
                            "connection type '{}' no longer registered",
                            config.connection_type
                        )),
                    );
                    guard.disarm();
                    return Ok(());
                }
            };
            let mut connection = match factory.create(&config, self.inner.events_tx.clone()) {
                Ok(c) => c,
                Err(err) => {
                    error!(connection_id = id, %err, "connector creation failed");
                    entry.transition(
                        id,
                        &self.inner.bus,
                        ServiceStatus::Error,
                        Some(err.to_string()),
                    );
                    guard.disarm();
                    return Ok(());
                }
            };
            if let Err(err) = connection.initialize().await {
                error!(connection_id = id, %err, "connector initialization failed");
                entry.transition(
                    id,
                    &self.inner.bus,
                    ServiceStatus::Error,
                    Some(err.to_string()),
                );
                guard.disarm();
                return Ok(());
            }
            if let Err(err) = apply_ports(connection.as_mut(), &config).await {
                error!(connection_id = id, %err, "port configuration failed");
                entry.transition(
                    id,
                    &self.inner.bus,
                    ServiceStatus::Error,
                    Some(err.to_string()),
                );
                guard.disarm();
                return Ok(());
            }
            slot.connection = Some(connection);
        }

        // A restart from Disconnected reuses the instance; retire the
        // previous run's token so its tasks wind down.
        if let Some(old) = slot.cancel.take() {
            old.cancel();
        }
        let cancel = CancellationToken::new();
        let started = match slot.connection.as_mut() {
            Some(connection) => connection.start(cancel.clone()).await,
            None => Ok(()),
        };
        match started {
            Ok(()) => {
                slot.cancel = Some(cancel);
                entry.transition(id, &self.inner.bus, ServiceStatus::Connected, None);
                info!(connection_id = id, "connection started");
            }
            Err(err) => {
                error!(connection_id = id, %err, "connector start failed");
                cancel.cancel();
                slot.connection = None;
                entry.transition(
                    id,
                    &self.inner.bus,
                    ServiceStatus::Error,
                    Some(err.to_string()),
                );
            }
        }
        guard.disarm();
        Ok(())
    }

    /// Stop a connection and release its resources. Idempotent:
    /// stopping an already-stopped connection is a no-op.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let entry = self.inner.entry(id)?;
        let mut slot = entry.slot.lock().await;
        self.stop_locked(id, &entry, &mut slot).await;
        Ok(())
    }

    async fn stop_locked(&self, id: &str, entry: &Entry, slot: &mut Slot) {
        let current = entry.status().status;
        if current == ServiceStatus::Disabled || current == ServiceStatus::Unknown {
            debug!(connection_id = id, "stop ignored, not running");
            return;
        }
        entry.transition(id, &self.inner.bus, ServiceStatus::Stopping, None);
        if let Some(cancel) = slot.cancel.take() {
            cancel.cancel();
        }
        if let Some(mut connection) = slot.connection.take() {
            if let Err(err) = connection.stop().await {
                warn!(connection_id = id, %err, "connector stop reported an error");
            }
        }
        entry.transition(id, &self.inner.bus, ServiceStatus::Disabled, None);
        info!(connection_id = id, "connection stopped");
    }

    /// Replace a connection's configuration: drain the running instance
    /// first, then swap the config, then restart when the old instance
    /// was active or the new config auto-starts.
    pub async fn update(&self, id: &str, config: ConnectionConfig) -> Result<()> {
        if config.id != id {
            return Err(UnshubError::Validation(format!(
                "config id '{}' does not match connection '{id}'",
                config.id
            )));
        }
        self.inner.registry.validate(&config)?;
        let entry = self.inner.entry(id)?;
        let was_active = {
            let mut slot = entry.slot.lock().await;
            let was_active = entry.status().status.is_active();
            self.stop_locked(id, &entry, &mut slot).await;
            *entry.config.write().unwrap_or_else(|e| e.into_inner()) = config.clone();
            was_active
        };
        info!(connection_id = id, "connection configuration updated");
        if config.enabled && (was_active || config.auto_start) {
            self.start(id).await?;
        }
        Ok(())
    }

    /// Stop and unregister a connection.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let entry = self.inner.entry(id)?;
        {
            let mut slot = entry.slot.lock().await;
            self.stop_locked(id, &entry, &mut slot).await;
        }
        self.inner.entries.remove(id);
        info!(connection_id = id, "connection removed");
        Ok(())
    }

    /// Route an outbound value through a connection. Fails with
    /// [`UnshubError::NotConnected`] unless the connection is Connected.
    pub async fn send_data(
        &self,
        id: &str,
        point: crate::models::DataPoint,
        output_id: Option<&str>,
    ) -> Result<()> {
        let entry = self.inner.entry(id)?;
        if entry.status().status != ServiceStatus::Connected {
            return Err(UnshubError::NotConnected(id.to_string()));
        }
        let mut slot = entry.slot.lock().await;
        match slot.connection.as_mut() {
            Some(connection) => connection.send_data(point, output_id).await,
            None => Err(UnshubError::NotConnected(id.to_string())),
        }
    }

    /// Attach or replace an input port on a connection, updating the
    /// stored configuration and the live instance when one is running.
    pub async fn configure_input(&self, id: &str, port: IoPortConfig) -> Result<()> {
        let entry = self.inner.entry(id)?;
        let mut slot = entry.slot.lock().await;
        if let Some(connection) = slot.connection.as_mut() {
            connection.configure_input(port.clone()).await?;
        }
        upsert_port(&entry, port, PortKind::Input);
        Ok(())
    }

    /// Attach or replace an output port; `send_data` can then route to
    /// it by id.
    pub async fn configure_output(&self, id: &str, port: IoPortConfig) -> Result<()> {
        let entry = self.inner.entry(id)?;
        let mut slot = entry.slot.lock().await;
        if let Some(connection) = slot.connection.as_mut() {
            connection.configure_output(port.clone()).await?;
        }
        upsert_port(&entry, port, PortKind::Output);
        Ok(())
    }

    pub async fn remove_input(&self, id: &str, input_id: &str) -> Result<()> {
        let entry = self.inner.entry(id)?;
        let mut slot = entry.slot.lock().await;
        remove_port(&entry, id, input_id, PortKind::Input)?;
        if let Some(connection) = slot.connection.as_mut() {
            connection.remove_input(input_id).await?;
        }
        Ok(())
    }

    pub async fn remove_output(&self, id: &str, output_id: &str) -> Result<()> {
        let entry = self.inner.entry(id)?;
        let mut slot = entry.slot.lock().await;
        remove_port(&entry, id, output_id, PortKind::Output)?;
        if let Some(connection) = slot.connection.as_mut() {
            connection.remove_output(output_id).await?;
        }
        Ok(())
    }

    pub fn config(&self, id: &str) -> Result<ConnectionConfig> {
        Ok(self.inner.entry(id)?.config())
    }

    pub fn status(&self, id: &str) -> Result<StatusInfo> {
        Ok(self.inner.entry(id)?.status())
    }

    /// Watch a connection's status changes.
    pub fn watch_status(&self, id: &str) -> Result<watch::Receiver<StatusInfo>> {
        Ok(self.inner.entry(id)?.status_tx.subscribe())
    }

    /// All connections with their current status.
    pub fn list(&self) -> Vec<(ConnectionConfig, StatusInfo)> {
        self.inner
            .entries
            .iter()
            .map(|e| (e.value().config(), e.value().status()))
            .collect()
    }

    /// Stop every connection. Used at process shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.inner.entries.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Err(err) = self.stop(&id).await {
                warn!(connection_id = %id, %err, "stop during shutdown failed");
            }
        }
    }
}

#[derive(Clone, Copy)]
enum PortKind {
    Input,
    Output,
}

fn upsert_port(entry: &Entry, port: IoPortConfig, kind: PortKind) {
    let mut config = entry.config.write().unwrap_or_else(|e| e.into_inner());
    let ports = match kind {
        PortKind::Input => &mut config.inputs,
        PortKind::Output => &mut config.outputs,
    };
    match ports.iter_mut().find(|p| p.id == port.id) {
        Some(existing) => *existing = port,
        None => ports.push(port),
    }
}

fn remove_port(entry: &Entry, id: &str, port_id: &str, kind: PortKind) -> Result<()> {
    let mut config = entry.config.write().unwrap_or_else(|e| e.into_inner());
    let (what, ports) = match kind {
        PortKind::Input => ("input", &mut config.inputs),
        PortKind::Output => ("output", &mut config.outputs),
    };
    let before = ports.len();
    ports.retain(|p| p.id != port_id);
    if ports.len() == before {
        return Err(UnshubError::NotFound(format!(
            "{what} '{port_id}' on connection '{id}'"
        )));
    }
    Ok(())
}

/// Apply a connection's configured ports to a freshly built instance.
async fn apply_ports(connection: &mut dyn Connection, config: &ConnectionConfig) -> Result<()> {
    for input in &config.inputs {
        connection.configure_input(input.clone()).await?;
    }
    for output in &config.outputs {
        connection.configure_output(output.clone()).await?;
    }
    Ok(())
}

/// Fan-in loop: splits connector events into the data stream and
/// runtime status transitions. Holds the registry weakly so dropping
/// the last manager handle lets everything unwind; runs until every
/// event sender is dropped.
async fn forward_events(
    inner: Weak<Inner>,
    mut events_rx: mpsc::Receiver<ConnectionEvent>,
    data_tx: mpsc::Sender<ReceivedData>,
) {
    while let Some(event) = events_rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match event {
            ConnectionEvent::Data {
                connection_id,
                point,
            } => {
                let connection_type = match inner.entries.get(&connection_id) {
                    Some(entry) => entry.value().config().connection_type,
                    // Data raced with removal; drop it.
                    None => continue,
                };
                if data_tx
                    .send(ReceivedData {
                        connection_id,
                        connection_type,
                        point,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            ConnectionEvent::Status {
                connection_id,
                status,
                message,
            } => {
                if let Some(entry) = inner
                    .entries
                    .get(&connection_id)
                    .map(|e| Arc::clone(e.value()))
                {
                    entry.transition(&connection_id, &inner.bus, status, message);
                }
            }
        }
    }
}
