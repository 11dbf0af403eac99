//! History synchronizer.
//!
//! Turns device states into immutable [`HistoryRecord`]s and writes them to
//! the durable store as a single atomic batch. A failed batch is retried once;
//! if the retry fails too, the batch is handed back inside a
//! [`PersistError`] so the caller can reschedule it.
//!
//! Per-device watermarks hold the registry sequence number of the last
//! flushed state, so the periodic trigger writes exactly the entries upserted
//! since the previous flush. Sensor timestamps play no part: a late reading
//! with an older timestamp is still written. Watermarks move only after a
//! successful write.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Notify, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::{CoreError, PersistError, StoreError};
use crate::model::{DeviceState, HistoryRecord};
use crate::registry::{DeviceRegistry, RegistryEntry};
use crate::storage::DurableStore;

/// Outcome of a successful flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PersistReport {
    pub records_written: usize,
    /// Store calls used for the history batch: 0 (nothing to do), 1 or 2.
    pub attempts: u32,
}

/// Outcome of [`HistorySynchronizer::retire`].
#[derive(Debug, Clone, PartialEq)]
pub struct Retired {
    /// The live state that left the registry, if the device was registered.
    pub removed: Option<Arc<DeviceState>>,
    pub purged_records: u64,
}

pub struct HistorySynchronizer {
    store: Arc<dyn DurableStore>,
    watermarks: Mutex<HashMap<String, u64>>,
    // Serializes flushes so a device's records are written in trigger order.
    flush_lock: tokio::sync::Mutex<()>,
    flush_requested: Notify,
}

impl HistorySynchronizer {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self {
            store,
            watermarks: Mutex::new(HashMap::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            flush_requested: Notify::new(),
        }
    }

    /// Persist one history record per state, in the order given.
    ///
    /// Watermarks are untouched: these states need not come from the registry.
    pub async fn flush(&self, states: &[DeviceState]) -> Result<PersistReport, PersistError> {
        let _guard = self.flush_lock.lock().await;
        self.persist(states).await
    }

    /// Persist every registry entry upserted since its device's last
    /// successful flush.
    pub async fn flush_changed(
        &self,
        registry: &DeviceRegistry,
    ) -> Result<PersistReport, PersistError> {
        let _guard = self.flush_lock.lock().await;

        // Collect before taking the watermark lock; eviction nests them the
        // other way round.
        let entries = registry.entries();
        let changed: Vec<RegistryEntry> = {
            let watermarks = self.watermarks.lock().unwrap_or_else(PoisonError::into_inner);
            entries
                .into_iter()
                .filter(|entry| {
                    watermarks
                        .get(&entry.state.id)
                        .is_none_or(|flushed| entry.seq > *flushed)
                })
                .collect()
        };

        self.persist_entries(&changed).await
    }

    /// Ask the background loop for a flush without waiting for it. Requests
    /// made while a flush is running coalesce into one follow-up flush.
    pub fn request_flush(&self) {
        self.flush_requested.notify_one();
    }

    /// Record the registry entry `seq` of `device_id` as persisted, e.g. a
    /// state restored from the store at startup.
    pub fn mark_flushed(&self, device_id: &str, seq: u64) {
        let mut watermarks = self.watermarks.lock().unwrap_or_else(PoisonError::into_inner);
        let flushed = watermarks.entry(device_id.to_string()).or_insert(seq);
        if seq > *flushed {
            *flushed = seq;
        }
    }

    /// Whether this exact registry entry (or a later one) has been written.
    pub fn is_persisted(&self, entry: &RegistryEntry) -> bool {
        self.watermarks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&entry.state.id)
            .is_some_and(|flushed| *flushed >= entry.seq)
    }

    /// Drop the watermark of a removed device.
    pub fn forget(&self, device_id: &str) {
        self.watermarks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(device_id);
    }

    /// Retention purge of history older than `cutoff`.
    pub async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let purged = self.store.purge_history_before(cutoff).await?;
        info!(purged, cutoff = %cutoff, "History purged");
        Ok(purged)
    }

    /// Take a device out of the live registry.
    ///
    /// Without `purge`, any state not yet written is flushed first and the
    /// device is removed only once its current entry is persisted; a failed
    /// flush leaves it registered. With `purge`, persisted history and the
    /// device row are deleted first, and a failed purge leaves the device
    /// registered. Both run under the flush lock, so the periodic flush
    /// cannot interleave.
    pub async fn retire(
        &self,
        registry: &DeviceRegistry,
        device_id: &str,
        purge: bool,
    ) -> Result<Retired, CoreError> {
        let _guard = self.flush_lock.lock().await;

        if purge {
            let purged_records = self.store.purge_device(device_id).await?;
            let removed = registry.remove(device_id);
            self.forget(device_id);
            info!(device_id = %device_id, purged_records, "Device purged");
            return Ok(Retired {
                removed,
                purged_records,
            });
        }

        loop {
            let entry = registry
                .entry(device_id)
                .ok_or_else(|| CoreError::NotFound(device_id.to_string()))?;

            if !self.is_persisted(&entry) {
                self.persist_entries(std::slice::from_ref(&entry)).await?;
            }

            // A reading that landed during the flush replaced the entry; go
            // round again so it is written too.
            if let Some(removed) = registry.remove_if_current(device_id, entry.seq) {
                self.forget(device_id);
                return Ok(Retired {
                    removed: Some(removed),
                    purged_records: 0,
                });
            }
        }
    }

    /// Periodic flush loop. Also flushes on [`request_flush`](Self::request_flush).
    /// Flush failures are logged and retried on the next trigger; a final
    /// flush runs when `shutdown` flips to `true`.
    pub async fn run(
        self: Arc<Self>,
        registry: Arc<DeviceRegistry>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(period_secs = period.as_secs_f64(), "History synchronizer started");

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush_and_log(&registry).await;
                }
                _ = self.flush_requested.notified() => {
                    self.flush_and_log(&registry).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("History synchronizer shutting down");
                        self.flush_and_log(&registry).await;
                        break;
                    }
                }
            }
        }
    }

    async fn flush_and_log(&self, registry: &DeviceRegistry) {
        match self.flush_changed(registry).await {
            Ok(report) if report.records_written > 0 => {
                info!(
                    records = report.records_written,
                    attempts = report.attempts,
                    "History flushed"
                );
            }
            Ok(_) => debug!("No device changes to flush"),
            Err(e) => {
                // The registry still holds the latest states and the
                // watermarks did not move, so the next trigger picks them up.
                warn!(
                    records = e.batch.len(),
                    error = %e,
                    "History flush failed, will retry"
                );
            }
        }
    }

    async fn persist_entries(
        &self,
        entries: &[RegistryEntry],
    ) -> Result<PersistReport, PersistError> {
        let states: Vec<DeviceState> = entries
            .iter()
            .map(|entry| DeviceState::clone(&entry.state))
            .collect();
        let report = self.persist(&states).await?;

        for entry in entries {
            self.mark_flushed(&entry.state.id, entry.seq);
        }
        Ok(report)
    }

    async fn persist(&self, states: &[DeviceState]) -> Result<PersistReport, PersistError> {
        if states.is_empty() {
            return Ok(PersistReport::default());
        }

        let batch: Vec<HistoryRecord> = states.iter().map(HistoryRecord::from_state).collect();
        let attempts = self.write_with_retry(batch).await?;

        if let Err(e) = self.store.upsert_devices(states).await {
            // History is committed; the device table only mirrors the latest state.
            warn!(devices = states.len(), error = %e, "Failed to update device rows");
        }

        Ok(PersistReport {
            records_written: states.len(),
            attempts,
        })
    }

    async fn write_with_retry(&self, batch: Vec<HistoryRecord>) -> Result<u32, PersistError> {
        let first = match self.store.insert_history_batch(&batch).await {
            Ok(()) => return Ok(1),
            Err(e) => e,
        };

        warn!(
            records = batch.len(),
            error = %first,
            "History batch write failed, retrying once"
        );

        match self.store.insert_history_batch(&batch).await {
            Ok(()) => Ok(2),
            Err(source) => {
                error!(
                    records = batch.len(),
                    error = %source,
                    "History batch write failed twice"
                );
                Err(PersistError {
                    batch,
                    attempts: 2,
                    source,
                })
            }
        }
    }
}
