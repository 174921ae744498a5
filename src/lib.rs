//! # unshub
//!
//! An ingestion core for a Unified Namespace (UNS): connection lifecycle
//! management for industrial data sources, automatic topic-to-hierarchy
//! mapping, an in-process event bus, a topic-configuration cache, and
//! retry-hardened storage contracts for realtime and historical values.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌───────────────┐
//! │ Connections │──▶│  Pipeline   │──▶│    Storage    │
//! │ sim/MQTT/.. │   │ sight + map │   │ realtime+hist │
//! └──────┬──────┘   └──────┬──────┘   └───────────────┘
//!        │                 │
//!        │            ┌────▼─────┐       ┌──────────┐
//!        └───────────▶│ EventBus │──────▶│  Cache   │
//!          (status)   │broadcast │       │ by topic │
//!                     └──────────┘       │ by path  │
//!                                        └──────────┘
//! ```
//!
//! Protocol connectors plug in through [`connector::ConnectorFactory`];
//! the crate ships only the simulated connector. Persistence engines
//! plug in through the [`storage`] traits; the crate ships in-memory
//! backends.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types |
//! | [`bus`] | In-process broadcast event bus |
//! | [`connector`] | Connection contract and connector registry |
//! | [`connector_sim`] | Built-in simulated connection |
//! | [`manager`] | Connection lifecycle management |
//! | [`namespace`] | Namespace tree index |
//! | [`mapping`] | Automatic topic-to-hierarchy mapping |
//! | [`topics`] | Durable topic-configuration store |
//! | [`cache`] | Topic cache keyed by topic and NSPath |
//! | [`storage`] | Realtime/historical storage contracts |
//! | [`pipeline`] | Ingestion pipeline wiring it all together |

pub mod bus;
pub mod cache;
pub mod config;
pub mod connector;
pub mod connector_sim;
pub mod error;
pub mod manager;
pub mod mapping;
pub mod models;
pub mod namespace;
pub mod pipeline;
pub mod storage;
pub mod topics;
