//! Telemetry service: the owner of the registry, the store and the
//! synchronizer, and the single entry point used by the HTTP layer.
//!
//! Ingestion only touches the in-memory registry; with flush-on-ingest it also
//! wakes the background flush without waiting for it. Read-path queries load history from the store and run the CPU-bound
//! analytics on the blocking pool.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::aggregation::{DeviceReport, Thresholds, abnormal_share, build_report, track_summary};
use crate::cluster::cluster;
use crate::config::ServiceSettings;
use crate::downsample::{MIN_POINTS, downsample_records};
use crate::error::CoreError;
use crate::model::{
    ChartPoint, ChartQuery, ChartResponse, ClusterResponse, DeviceState, DeviceStatus,
    FleetSummary, HistoryRecord, IngestResponse, RawTelemetry, TrackSummary,
};
use crate::normalize::normalize_reading;
use crate::registry::DeviceRegistry;
use crate::storage::DurableStore;
use crate::sync::{HistorySynchronizer, PersistReport, Retired};

/// Window used when a query gives no `start`.
pub const DEFAULT_WINDOW_HOURS: i64 = 24;

pub struct TelemetryService {
    registry: Arc<DeviceRegistry>,
    store: Arc<dyn DurableStore>,
    synchronizer: Arc<HistorySynchronizer>,
    settings: ServiceSettings,
    thresholds: Thresholds,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<JoinSet<()>>,
}

impl TelemetryService {
    pub fn new(store: Arc<dyn DurableStore>, settings: ServiceSettings) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            registry: Arc::new(DeviceRegistry::new(settings.event_capacity)),
            synchronizer: Arc::new(HistorySynchronizer::new(store.clone())),
            store,
            settings,
            thresholds: Thresholds::default(),
            shutdown,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    /// Load persisted device rows into the registry. Devices already present
    /// (ingested since startup) are left alone.
    pub async fn restore(&self) -> Result<usize, CoreError> {
        let devices = self.store.query_all_devices().await?;
        let mut restored = 0;
        for device in devices {
            let id = device.id.clone();
            // Restored rows are already persisted.
            if let Some(seq) = self.registry.insert_if_absent(device) {
                self.synchronizer.mark_flushed(&id, seq);
                restored += 1;
            }
        }

        info!(devices = restored, "Registry restored from store");
        Ok(restored)
    }

    /// Spawn the periodic flush loop and, when a device TTL is configured,
    /// the eviction loop.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;

        // Periodic and on-demand history flush
        tasks.spawn(self.synchronizer.clone().run(
            self.registry.clone(),
            self.settings.flush_interval,
            self.shutdown.subscribe(),
        ));

        // Stale-device eviction
        if let Some(ttl) = self.settings.device_ttl {
            tasks.spawn(eviction_loop(
                self.registry.clone(),
                self.synchronizer.clone(),
                ttl,
                self.shutdown.subscribe(),
            ));
        }

        info!(tasks = tasks.len(), "Background tasks started");
    }

    /// Signal background tasks to stop and wait up to `timeout` for each.
    /// The flush loop writes any pending changes before it exits.
    pub async fn shutdown(&self, timeout: Duration) {
        self.shutdown.send_replace(true);

        // Join each task, giving up on stragglers after the timeout
        let mut tasks = self.tasks.lock().await;
        loop {
            match tokio::time::timeout(timeout, tasks.join_next()).await {
                Ok(Some(Ok(()))) => {}
                Ok(Some(Err(e))) => error!(error = %e, "Background task failed during shutdown"),
                Ok(None) => break,
                Err(_) => {
                    warn!(remaining = tasks.len(), "Shutdown timeout, aborting background tasks");
                    tasks.abort_all();
                    break;
                }
            }
        }
        info!("Telemetry service stopped");
    }

    /// Normalize one raw reading and make it the device's current state.
    ///
    /// Never fails and never waits on the store: unparsable fields become
    /// warnings, and with flush-on-ingest the background flush loop is woken
    /// to write the new state. The flush itself runs only once
    /// [`start`](Self::start) has been called.
    pub fn ingest(&self, raw: RawTelemetry) -> IngestResponse {
        let (state, warnings) = normalize_reading(raw, Utc::now());
        let device_id = state.id.clone();

        debug!(device_id = %device_id, status = ?state.status, "Telemetry ingested");
        self.registry.upsert(state);

        let flush_queued = self.settings.flush_on_ingest;
        if flush_queued {
            self.synchronizer.request_flush();
        }

        IngestResponse {
            device_id,
            warnings,
            flush_queued,
        }
    }

    pub fn device(&self, id: &str) -> Result<Arc<DeviceState>, CoreError> {
        self.registry
            .get(id)
            .ok_or_else(|| CoreError::NotFound(id.to_string()))
    }

    /// Live devices ordered by id, optionally only those in `status`.
    pub fn devices(&self, status: Option<DeviceStatus>) -> Vec<DeviceState> {
        let mut devices = self.registry.snapshot();
        if let Some(status) = status {
            devices.retain(|d| d.status == status);
        }
        devices
    }

    /// Live device counts by status, with the WARNING/ERROR share.
    pub fn fleet_summary(&self) -> FleetSummary {
        let status_counts = self.registry.status_counts();
        let (abnormal_count, abnormal_rate) = abnormal_share(&status_counts);
        FleetSummary {
            total: status_counts.values().sum(),
            status_counts,
            abnormal_count,
            abnormal_rate,
        }
    }

    /// Administrative removal from the live registry.
    ///
    /// Unflushed state is written before the device goes, so history stays
    /// complete. With `purge`, persisted history and the device row are
    /// deleted first; a device that is no longer live can still be purged.
    pub async fn remove_device(&self, id: &str, purge: bool) -> Result<Retired, CoreError> {
        let retired = self.synchronizer.retire(&self.registry, id, purge).await?;
        info!(
            device_id = %id,
            live = retired.removed.is_some(),
            purged_records = retired.purged_records,
            "Device removed"
        );
        Ok(retired)
    }

    pub async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, CoreError> {
        Ok(self.synchronizer.purge_before(cutoff).await?)
    }

    /// Flush every device that changed since its last flush.
    pub async fn sync_now(&self) -> Result<PersistReport, CoreError> {
        Ok(self.synchronizer.flush_changed(&self.registry).await?)
    }

    /// Persisted history for one device, ascending by timestamp.
    pub async fn history(
        &self,
        device_id: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<HistoryRecord>, CoreError> {
        let (start, end) = resolve_window(start, end, Utc::now())?;
        Ok(self.store.query_range(device_id, start, end).await?)
    }

    pub async fn chart(&self, device_id: &str, query: ChartQuery) -> Result<ChartResponse, CoreError> {
        let max_points = query.max_points.unwrap_or(self.settings.chart_max_points);
        if max_points < MIN_POINTS {
            return Err(CoreError::invalid(format!(
                "max_points must be at least {MIN_POINTS}, got {max_points}"
            )));
        }

        let metric = query.metric;
        let records = self.history(device_id, query.start, query.end).await?;
        let source_points = records.len();

        let points = tokio::task::spawn_blocking(move || {
            downsample_records(&records, metric, max_points).map(|sampled| {
                sampled
                    .iter()
                    .map(|r| ChartPoint {
                        timestamp: r.timestamp,
                        value: metric.of(r),
                    })
                    .collect::<Vec<_>>()
            })
        })
        .await??;

        Ok(ChartResponse {
            device_id: device_id.to_string(),
            metric,
            source_points,
            points,
        })
    }

    pub async fn report(
        &self,
        device_id: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<DeviceReport, CoreError> {
        let records = self.history(device_id, start, end).await?;
        let id = device_id.to_string();
        let thresholds = self.thresholds;

        let report =
            tokio::task::spawn_blocking(move || build_report(&id, &records, &thresholds)).await?;
        Ok(report)
    }

    pub async fn track(
        &self,
        device_id: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<TrackSummary, CoreError> {
        let records = self.history(device_id, start, end).await?;
        Ok(track_summary(device_id, &records))
    }

    /// Cluster the live snapshot. `radius_m` defaults to the configured radius.
    pub fn clusters(&self, radius_m: Option<f64>) -> Result<ClusterResponse, CoreError> {
        let radius_m = radius_m.unwrap_or(self.settings.cluster_radius_m);
        let devices = self.registry.snapshot();
        let located_devices = devices.iter().filter(|d| d.location.is_some()).count();
        let clusters = cluster(&devices, radius_m)?;

        Ok(ClusterResponse {
            radius_m,
            located_devices,
            clusters,
        })
    }
}

/// Fill in a query window: `end` defaults to `now`, `start` to
/// [`DEFAULT_WINDOW_HOURS`] before `end`.
pub fn resolve_window(
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), CoreError> {
    let end = end.unwrap_or(now);
    let start = start.unwrap_or_else(|| end - chrono::Duration::hours(DEFAULT_WINDOW_HOURS));
    if start > end {
        return Err(CoreError::invalid(format!(
            "start {start} is after end {end}"
        )));
    }
    Ok((start, end))
}

async fn eviction_loop(
    registry: Arc<DeviceRegistry>,
    synchronizer: Arc<HistorySynchronizer>,
    ttl: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let max_age = match chrono::Duration::from_std(ttl) {
        Ok(max_age) => max_age,
        Err(e) => {
            warn!(error = %e, "Device TTL out of range, eviction disabled");
            return;
        }
    };

    let period = (ttl / 4).max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(ttl_secs = ttl.as_secs(), "Stale-device eviction enabled");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // Write pending state first; only persisted entries may go.
                if let Err(e) = synchronizer.flush_changed(&registry).await {
                    warn!(error = %e, "Flush before eviction failed, keeping unflushed devices");
                }
                let evicted = registry.evict_stale(max_age, Utc::now(), |entry| {
                    synchronizer.is_persisted(entry)
                });
                for id in evicted {
                    synchronizer.forget(&id);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::model::{GeoPoint, Metric, Reading};
    use crate::storage::SqliteStore;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn raw(id: &str, status: DeviceStatus, secs: i64) -> RawTelemetry {
        RawTelemetry {
            id: id.to_string(),
            name: None,
            status,
            temperature: Reading::Text("4.5°C".to_string()),
            humidity: Reading::Number(52.0),
            oxygen_level: Reading::Text("20.9%".to_string()),
            location: Some(GeoPoint::new(31.23, 121.47)),
            speed: None,
            timestamp: Some(at(secs)),
        }
    }

    async fn service_with(settings: ServiceSettings) -> (TelemetryService, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::new("sqlite::memory:").await.unwrap());
        (TelemetryService::new(store.clone(), settings), store)
    }

    async fn service() -> (TelemetryService, Arc<SqliteStore>) {
        service_with(ServiceSettings::default()).await
    }

    #[tokio::test]
    async fn test_ingest_updates_registry() {
        let (service, _) = service().await;

        let response = service.ingest(raw("truck-1", DeviceStatus::Normal, 0));

        assert_eq!(response.device_id, "truck-1");
        assert!(response.warnings.is_empty());
        assert!(!response.flush_queued);
        let device = service.device("truck-1").unwrap();
        assert_eq!(device.temperature, 4.5);
        assert_eq!(device.oxygen_level, 20.9);
        assert_eq!(device.name, "truck-1");
    }

    #[tokio::test]
    async fn test_ingest_reports_unparsable_fields() {
        let (service, _) = service().await;
        let mut reading = raw("truck-1", DeviceStatus::Normal, 0);
        reading.humidity = Reading::Text("n/a".to_string());

        let response = service.ingest(reading);

        assert_eq!(response.warnings.len(), 1);
        assert_eq!(response.warnings[0].field, "humidity");
        assert_eq!(service.device("truck-1").unwrap().humidity, 0.0);
    }

    async fn wait_for_history(store: &dyn DurableStore, id: &str, expected: usize) -> bool {
        for _ in 0..200 {
            let records = store.query_range(id, at(-86_400), at(86_400)).await.unwrap();
            if records.len() == expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_flush_on_ingest_queues_background_flush() {
        let settings = ServiceSettings {
            flush_on_ingest: true,
            flush_interval: Duration::from_secs(3600),
            ..ServiceSettings::default()
        };
        let (service, store) = service_with(settings).await;
        service.start().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let response = service.ingest(raw("truck-1", DeviceStatus::Normal, 0));

        assert!(response.flush_queued);
        assert!(wait_for_history(store.as_ref(), "truck-1", 1).await);
        // Already flushed, so nothing is pending.
        assert_eq!(service.sync_now().await.unwrap().records_written, 0);
        service.shutdown(Duration::from_secs(5)).await;
    }

    /// Store whose history writes hang for a long time.
    struct StalledStore {
        inner: SqliteStore,
    }

    #[async_trait::async_trait]
    impl DurableStore for StalledStore {
        async fn insert_history_batch(&self, records: &[HistoryRecord]) -> Result<(), StoreError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            self.inner.insert_history_batch(records).await
        }

        async fn query_range(
            &self,
            device_id: &str,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<Vec<HistoryRecord>, StoreError> {
            self.inner.query_range(device_id, start, end).await
        }

        async fn upsert_device(&self, state: &DeviceState) -> Result<(), StoreError> {
            self.inner.upsert_device(state).await
        }

        async fn query_all_devices(&self) -> Result<Vec<DeviceState>, StoreError> {
            self.inner.query_all_devices().await
        }

        async fn purge_history_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
            self.inner.purge_history_before(cutoff).await
        }

        async fn purge_device(&self, device_id: &str) -> Result<u64, StoreError> {
            self.inner.purge_device(device_id).await
        }
    }

    #[tokio::test]
    async fn test_ingest_does_not_wait_on_slow_store() {
        let store = StalledStore {
            inner: SqliteStore::new("sqlite::memory:").await.unwrap(),
        };
        let settings = ServiceSettings {
            flush_on_ingest: true,
            flush_interval: Duration::from_secs(3600),
            ..ServiceSettings::default()
        };
        let service = TelemetryService::new(Arc::new(store), settings);
        service.start().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The first flush is now stuck in the store.
        service.ingest(raw("truck-1", DeviceStatus::Normal, 0));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        let response = service.ingest(raw("truck-1", DeviceStatus::Error, 60));

        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(response.flush_queued);
        assert_eq!(service.device("truck-1").unwrap().status, DeviceStatus::Error);
        service.shutdown(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_status_distribution_end_to_end() {
        let (service, _) = service().await;
        service.ingest(raw("truck-1", DeviceStatus::Normal, 0));
        service.sync_now().await.unwrap();
        service.ingest(raw("truck-1", DeviceStatus::Warning, 60));
        service.sync_now().await.unwrap();
        service.ingest(raw("truck-1", DeviceStatus::Error, 120));
        service.sync_now().await.unwrap();

        let report = service
            .report("truck-1", Some(at(-10)), Some(at(200)))
            .await
            .unwrap();

        assert_eq!(report.record_count, 3);
        assert_eq!(report.status_distribution[&DeviceStatus::Normal], 1);
        assert_eq!(report.status_distribution[&DeviceStatus::Warning], 1);
        assert_eq!(report.status_distribution[&DeviceStatus::Error], 1);
    }

    #[tokio::test]
    async fn test_chart_downsamples_history() {
        let (service, store) = service().await;
        let records: Vec<HistoryRecord> = (0..1_000)
            .map(|i| HistoryRecord {
                device_id: "truck-1".to_string(),
                timestamp: at(i),
                status: DeviceStatus::Normal,
                temperature: if i % 2 == 0 { 0.0 } else { 100.0 },
                humidity: 50.0,
                oxygen_level: 20.9,
                latitude: None,
                longitude: None,
            })
            .collect();
        store.insert_history_batch(&records).await.unwrap();

        let chart = service
            .chart(
                "truck-1",
                ChartQuery {
                    metric: Metric::Temperature,
                    start: Some(at(0)),
                    end: Some(at(1_000)),
                    max_points: Some(50),
                },
            )
            .await
            .unwrap();

        assert_eq!(chart.source_points, 1_000);
        assert!(chart.points.len() <= 50);
        assert_eq!(chart.points.first().unwrap().timestamp, at(0));
        assert_eq!(chart.points.last().unwrap().timestamp, at(999));
    }

    #[tokio::test]
    async fn test_chart_rejects_bad_arguments() {
        let (service, _) = service().await;

        let tiny = service
            .chart(
                "truck-1",
                ChartQuery {
                    max_points: Some(1),
                    ..ChartQuery::default()
                },
            )
            .await;
        assert!(matches!(tiny, Err(CoreError::InvalidArgument(_))));

        let inverted = service.history("truck-1", Some(at(100)), Some(at(0))).await;
        assert!(matches!(inverted, Err(CoreError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_clusters_use_configured_radius() {
        let (service, _) = service().await;
        service.ingest(raw("a", DeviceStatus::Normal, 0));
        service.ingest(raw("b", DeviceStatus::Error, 0));
        let mut unlocated = raw("c", DeviceStatus::Normal, 0);
        unlocated.location = None;
        service.ingest(unlocated);

        let response = service.clusters(None).unwrap();

        assert_eq!(response.radius_m, 500.0);
        assert_eq!(response.located_devices, 2);
        assert_eq!(response.clusters.len(), 1);
        assert_eq!(response.clusters[0].error_count, 1);
        assert!(service.clusters(Some(-1.0)).is_err());
    }

    #[tokio::test]
    async fn test_remove_device_persists_pending_state() {
        let (service, store) = service().await;
        service.ingest(raw("truck-1", DeviceStatus::Normal, 0));

        let retired = service.remove_device("truck-1", false).await.unwrap();

        assert_eq!(retired.removed.unwrap().id, "truck-1");
        assert!(matches!(service.device("truck-1"), Err(CoreError::NotFound(_))));
        assert_eq!(store.history_count().await.unwrap(), 1);
        assert!(matches!(
            service.remove_device("truck-1", false).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_device_with_purge() {
        let (service, store) = service().await;
        service.ingest(raw("truck-1", DeviceStatus::Normal, 0));
        service.sync_now().await.unwrap();

        let retired = service.remove_device("truck-1", true).await.unwrap();

        assert_eq!(retired.purged_records, 1);
        assert!(service.device("truck-1").is_err());
        assert_eq!(store.history_count().await.unwrap(), 0);
        assert!(store.query_all_devices().await.unwrap().is_empty());

        // Nothing live and nothing stored is still a successful purge.
        let again = service.remove_device("truck-1", true).await.unwrap();
        assert!(again.removed.is_none());
        assert_eq!(again.purged_records, 0);
    }

    #[tokio::test]
    async fn test_late_reading_with_older_timestamp_is_persisted() {
        let (service, store) = service().await;
        service.ingest(raw("truck-1", DeviceStatus::Normal, 100));
        assert_eq!(service.sync_now().await.unwrap().records_written, 1);

        service.ingest(raw("truck-1", DeviceStatus::Error, 50));

        assert_eq!(service.sync_now().await.unwrap().records_written, 1);
        let history = service
            .history("truck-1", Some(at(0)), Some(at(200)))
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, DeviceStatus::Error);
        assert_eq!(store.history_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_eviction_keeps_backfilled_reading_and_persists_it() {
        let settings = ServiceSettings {
            flush_interval: Duration::from_secs(3600),
            device_ttl: Some(Duration::from_secs(4)),
            ..ServiceSettings::default()
        };
        let (service, store) = service_with(settings).await;
        service.start().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Stamped an hour ago by the sensor, received just now.
        let mut reading = raw("truck-1", DeviceStatus::Warning, 0);
        reading.timestamp = Some(Utc::now() - chrono::Duration::hours(1));
        service.ingest(reading);
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        assert!(service.device("truck-1").is_ok());
        service.shutdown(Duration::from_secs(5)).await;
        assert_eq!(store.history_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_devices_filter_and_fleet_summary() {
        let (service, _) = service().await;
        service.ingest(raw("a", DeviceStatus::Normal, 0));
        service.ingest(raw("b", DeviceStatus::Warning, 0));
        service.ingest(raw("c", DeviceStatus::Error, 0));
        service.ingest(raw("d", DeviceStatus::Normal, 0));

        let warning: Vec<String> = service
            .devices(Some(DeviceStatus::Warning))
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(warning, vec!["b"]);
        assert_eq!(service.devices(None).len(), 4);

        let summary = service.fleet_summary();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.status_counts[&DeviceStatus::Normal], 2);
        assert_eq!(summary.abnormal_count, 2);
        assert_eq!(summary.abnormal_rate, 0.5);
    }

    #[tokio::test]
    async fn test_fleet_summary_empty() {
        let (service, _) = service().await;

        let summary = service.fleet_summary();

        assert_eq!(summary.total, 0);
        assert_eq!(summary.status_counts.len(), 3);
        assert_eq!(summary.abnormal_rate, 0.0);
    }

    #[tokio::test]
    async fn test_restore_skips_already_persisted() {
        let (first, store) = service().await;
        first.ingest(raw("truck-1", DeviceStatus::Warning, 0));
        first.sync_now().await.unwrap();

        let second = TelemetryService::new(store.clone(), ServiceSettings::default());
        assert_eq!(second.restore().await.unwrap(), 1);
        assert_eq!(second.device("truck-1").unwrap().status, DeviceStatus::Warning);
        assert_eq!(second.sync_now().await.unwrap().records_written, 0);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending_changes() {
        let settings = ServiceSettings {
            flush_interval: Duration::from_secs(3600),
            device_ttl: Some(Duration::from_secs(3600)),
            ..ServiceSettings::default()
        };
        let (service, store) = service_with(settings).await;
        service.start().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut reading = raw("truck-1", DeviceStatus::Normal, 0);
        reading.timestamp = None;
        service.ingest(reading);
        service.shutdown(Duration::from_secs(5)).await;

        assert_eq!(store.history_count().await.unwrap(), 1);
    }

    #[test]
    fn test_resolve_window_defaults() {
        let now = at(0);

        let (start, end) = resolve_window(None, None, now).unwrap();
        assert_eq!(end, now);
        assert_eq!(end - start, chrono::Duration::hours(DEFAULT_WINDOW_HOURS));

        let (start, _) = resolve_window(None, Some(at(-60)), now).unwrap();
        assert_eq!(start, at(-60) - chrono::Duration::hours(DEFAULT_WINDOW_HOURS));

        assert!(resolve_window(Some(at(1)), Some(at(0)), now).is_err());
    }
}
