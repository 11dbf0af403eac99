//! Data models for coldtrack.
//!
//! Two families of types live here:
//!
//! - **Live state**: [`DeviceState`] is the latest known telemetry for one
//!   device. It is replaced whole on every update and never mutated in place.
//! - **History**: [`HistoryRecord`] is an immutable, append-only snapshot
//!   persisted by the synchronizer. Records are only ever removed by an
//!   explicit retention purge.
//!
//! The remaining types are derived values (clusters, statistics, tracks) and
//! the request/response shapes of the HTTP API.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DataQualityWarning;

/// Mean Earth radius in meters, used for great-circle distances.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Operating status reported by a device.
///
/// Ordering follows severity so that status maps iterate NORMAL, WARNING, ERROR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceStatus {
    /// All readings within their expected range.
    Normal,
    /// At least one reading is drifting out of range.
    Warning,
    /// At least one reading is out of range.
    Error,
}

impl DeviceStatus {
    /// Every status, in severity order.
    pub const ALL: [DeviceStatus; 3] = [
        DeviceStatus::Normal,
        DeviceStatus::Warning,
        DeviceStatus::Error,
    ];

    /// Stable integer code used in the database.
    pub fn code(self) -> i64 {
        match self {
            DeviceStatus::Normal => 0,
            DeviceStatus::Warning => 1,
            DeviceStatus::Error => 2,
        }
    }

    /// Inverse of [`DeviceStatus::code`].
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(DeviceStatus::Normal),
            1 => Some(DeviceStatus::Warning),
            2 => Some(DeviceStatus::Error),
            _ => None,
        }
    }
}

/// A geographic point in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude in degrees (-90 to 90).
    pub lat: f64,
    /// Longitude in degrees (-180 to 180).
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Great-circle distance to another point in meters (haversine formula).
    pub fn distance_to(&self, other: &GeoPoint) -> f64 {
        let lat1_rad = self.lat.to_radians();
        let lat2_rad = other.lat.to_radians();
        let delta_lat = (other.lat - self.lat).to_radians();
        let delta_lng = (other.lng - self.lng).to_radians();

        let a = (delta_lat / 2.0).sin().powi(2)
            + lat1_rad.cos() * lat2_rad.cos() * (delta_lng / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().asin();

        EARTH_RADIUS_METERS * c
    }
}

/// A numeric telemetry channel that charts and statistics can be computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Degrees Celsius.
    #[default]
    Temperature,
    /// Relative humidity in percent.
    Humidity,
    /// Oxygen concentration in percent.
    OxygenLevel,
}

impl Metric {
    pub const ALL: [Metric; 3] = [Metric::Temperature, Metric::Humidity, Metric::OxygenLevel];

    /// Read this metric from a history record.
    pub fn of(&self, record: &HistoryRecord) -> f64 {
        match self {
            Metric::Temperature => record.temperature,
            Metric::Humidity => record.humidity,
            Metric::OxygenLevel => record.oxygen_level,
        }
    }
}

/// Latest known telemetry for one device.
///
/// Registry entries are replaced with a fully-formed new value on every
/// update, so a reader always sees a complete record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    /// Unique device identifier; the registry key.
    pub id: String,

    /// Display name.
    pub name: String,

    pub status: DeviceStatus,

    /// Degrees Celsius.
    pub temperature: f64,

    /// Relative humidity in percent.
    pub humidity: f64,

    /// Oxygen concentration in percent.
    pub oxygen_level: f64,

    /// Last reported position, if the device has a GPS fix.
    pub location: Option<GeoPoint>,

    /// Ground speed in km/h, if reported.
    pub speed: Option<f64>,

    /// Timestamp of the reading (sensor time, UTC).
    pub last_update: DateTime<Utc>,
}

/// An immutable, persisted telemetry sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: DeviceStatus,
    pub temperature: f64,
    pub humidity: f64,
    pub oxygen_level: f64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl HistoryRecord {
    /// Snapshot a device state as a history record.
    pub fn from_state(state: &DeviceState) -> Self {
        Self {
            device_id: state.id.clone(),
            timestamp: state.last_update,
            status: state.status,
            temperature: state.temperature,
            humidity: state.humidity,
            oxygen_level: state.oxygen_level,
            latitude: state.location.map(|p| p.lat),
            longitude: state.location.map(|p| p.lng),
        }
    }

    /// The recorded position, when both coordinates are present.
    pub fn location(&self) -> Option<GeoPoint> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lng)) => Some(GeoPoint::new(lat, lng)),
            _ => None,
        }
    }
}

/// Summary statistics over a finite numeric series.
///
/// An empty series yields all zeros with `count == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StatisticsResult {
    pub average: f64,
    pub max: f64,
    pub min: f64,
    pub sum: f64,
    pub count: usize,
}

/// The time span covered by a set of records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Acceptable bounds for a reading. Either side may be open.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Threshold {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Threshold {
    pub fn new(min: Option<f64>, max: Option<f64>) -> Self {
        Self { min, max }
    }

    /// `true` when `value` lies strictly outside the bounds.
    pub fn violated_by(&self, value: f64) -> bool {
        self.min.is_some_and(|min| value < min) || self.max.is_some_and(|max| value > max)
    }
}

/// A group of spatially-proximate devices rendered as one map marker.
///
/// Clusters are ephemeral and recomputed on every clustering call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cluster {
    /// Coordinate of the device that opened the cluster. Membership is
    /// decided against this point.
    pub seed: GeoPoint,

    /// Arithmetic mean of all member coordinates. Used for rendering only.
    pub centroid: GeoPoint,

    /// Member device ids, in join order.
    pub device_ids: Vec<String>,

    pub device_count: usize,
    pub normal_count: usize,
    pub warning_count: usize,
    pub error_count: usize,
}

/// One located sample on a device's track.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrackPoint {
    pub location: GeoPoint,
    pub timestamp: DateTime<Utc>,
    pub status: DeviceStatus,
}

/// A device's movement over a window, derived from located history records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackSummary {
    pub device_id: String,
    pub points: Vec<TrackPoint>,
    /// Sum of consecutive great-circle distances, in meters.
    pub total_distance_m: f64,
    /// Total distance over elapsed time, in km/h. Zero when no time elapsed.
    pub avg_speed_kmh: f64,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// Change notification published by the device registry.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    /// A device entry was created or replaced.
    Upserted(std::sync::Arc<DeviceState>),
    /// A device entry was removed (administratively or by eviction).
    Removed(String),
}

/// A numeric reading as it arrives from the decoder: either already numeric
/// or a unit-bearing string such as `"2.5°C"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reading {
    Number(f64),
    Text(String),
}

impl From<f64> for Reading {
    fn from(value: f64) -> Self {
        Reading::Number(value)
    }
}

/// Request body for POST /telemetry.
#[derive(Debug, Clone, Deserialize)]
pub struct RawTelemetry {
    pub id: String,

    /// Defaults to the id when absent.
    pub name: Option<String>,

    pub status: DeviceStatus,
    pub temperature: Reading,
    pub humidity: Reading,
    pub oxygen_level: Reading,

    #[serde(default)]
    pub location: Option<GeoPoint>,

    #[serde(default)]
    pub speed: Option<Reading>,

    /// Sensor timestamp. The server receive time is used when absent.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Response for POST /telemetry.
#[derive(Debug, Clone, Serialize)]
pub struct IngestResponse {
    pub device_id: String,
    pub warnings: Vec<DataQualityWarning>,
    /// A background flush was requested for this reading. The write itself
    /// is not awaited.
    pub flush_queued: bool,
}

/// Query parameters for GET /devices.
#[derive(Debug, Default, Deserialize)]
pub struct DeviceListQuery {
    /// Only devices currently in this status.
    pub status: Option<DeviceStatus>,
}

/// Response for GET /fleet/summary: live device counts by status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetSummary {
    pub total: usize,
    /// Every status is present, with zero counts included.
    pub status_counts: BTreeMap<DeviceStatus, usize>,
    /// WARNING plus ERROR devices.
    pub abnormal_count: usize,
    /// `abnormal_count / total`, or 0 for an empty fleet.
    pub abnormal_rate: f64,
}

/// Query parameters for time-windowed endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct WindowQuery {
    /// Window start (RFC 3339). Defaults to 24 hours before `end`.
    pub start: Option<DateTime<Utc>>,
    /// Window end (RFC 3339). Defaults to now.
    pub end: Option<DateTime<Utc>>,
}

/// Query parameters for GET /devices/:id/chart.
#[derive(Debug, Default, Deserialize)]
pub struct ChartQuery {
    #[serde(default)]
    pub metric: Metric,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Defaults to the configured chart size.
    pub max_points: Option<usize>,
}

/// A single plotted chart sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChartPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Response for GET /devices/:id/chart.
#[derive(Debug, Clone, Serialize)]
pub struct ChartResponse {
    pub device_id: String,
    pub metric: Metric,
    /// Number of samples in the window before downsampling.
    pub source_points: usize,
    pub points: Vec<ChartPoint>,
}

/// Query parameters for GET /map/clusters.
#[derive(Debug, Default, Deserialize)]
pub struct ClusterQuery {
    /// Defaults to the configured radius.
    pub radius_m: Option<f64>,
}

/// Response for GET /map/clusters.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterResponse {
    pub radius_m: f64,
    /// Devices with a location that took part in clustering.
    pub located_devices: usize,
    pub clusters: Vec<Cluster>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_round_trip() {
        for status in DeviceStatus::ALL {
            assert_eq!(DeviceStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(DeviceStatus::from_code(7), None);
    }

    #[test]
    fn test_distance_along_meridian() {
        let a = GeoPoint::new(31.0, 121.0);
        let b = GeoPoint::new(32.0, 121.0);

        let expected = EARTH_RADIUS_METERS * 1.0_f64.to_radians();
        assert!((a.distance_to(&b) - expected).abs() < 1e-6);
        assert_eq!(a.distance_to(&a), 0.0);
    }

    #[test]
    fn test_threshold_bounds_are_exclusive() {
        let threshold = Threshold::new(Some(2.0), Some(8.0));

        assert!(!threshold.violated_by(2.0));
        assert!(!threshold.violated_by(8.0));
        assert!(threshold.violated_by(1.9));
        assert!(threshold.violated_by(8.1));
        assert!(!Threshold::default().violated_by(-1000.0));
    }

    #[test]
    fn test_reading_accepts_number_or_text() {
        let number: Reading = serde_json::from_str("4.5").unwrap();
        let text: Reading = serde_json::from_str("\"4.5°C\"").unwrap();

        assert_eq!(number, Reading::Number(4.5));
        assert_eq!(text, Reading::Text("4.5°C".to_string()));
    }

    #[test]
    fn test_status_serializes_uppercase() {
        let json = serde_json::to_string(&DeviceStatus::Warning).unwrap();
        assert_eq!(json, "\"WARNING\"");
    }
}
