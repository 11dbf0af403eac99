//! coldtrack - Telemetry engine for cold-chain device fleets.
//!
//! # Overview
//!
//! Refrigerated containers and trucks report temperature, humidity, oxygen
//! level, position and a coarse health status. coldtrack keeps the latest
//! state of every device in memory, persists an append-only history, and
//! answers the questions the dashboards ask: a downsampled chart series, a
//! statistics report over a window, and map clusters of nearby devices.
//!
//! # Data flow
//!
//! 1. Raw readings are normalized at the boundary ([`normalize`]); unit
//!    strings such as `"4.2°C"` become `f64`.
//! 2. The [`registry`] holds the current [`model::DeviceState`] per device
//!    and broadcasts every change.
//! 3. The [`sync`] module periodically writes changed states as
//!    [`model::HistoryRecord`]s through [`storage::DurableStore`].
//! 4. Read-path analytics ([`downsample`], [`aggregation`], [`cluster`]) are
//!    pure functions over records or registry snapshots.
//!
//! # Modules
//!
//! - [`model`]: Data types for device state, history and API payloads
//! - [`error`]: Error taxonomy
//! - [`normalize`]: Unit-suffix parsing and reading normalization
//! - [`registry`]: Concurrent in-memory device registry
//! - [`storage`]: Durable store trait and SQLite implementation
//! - [`sync`]: History synchronizer with retry
//! - [`downsample`]: Trend-preserving downsampling
//! - [`aggregation`]: Statistics and report generation
//! - [`cluster`]: Geospatial clustering
//! - [`service`]: Telemetry service tying the pieces together
//! - [`config`]: Environment configuration
//! - [`api`]: HTTP API handlers

pub mod aggregation;
pub mod api;
pub mod cluster;
pub mod config;
pub mod downsample;
pub mod error;
pub mod model;
pub mod normalize;
pub mod registry;
pub mod service;
pub mod storage;
pub mod sync;
