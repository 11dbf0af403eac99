//! Statistics over telemetry history.
//!
//! Every function here is pure and deterministic: no I/O, no shared state.
//! The reductions are partition-friendly: `sum`, `count`, `min` and `max`
//! combine across partitions with [`StatisticsResult::merge`] and the
//! average is re-derived afterwards, so large ranges can be split and
//! reduced in parallel.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::model::{
    DeviceStatus, HistoryRecord, Metric, StatisticsResult, Threshold, TimeRange, TrackPoint,
    TrackSummary,
};

/// Compute average, max, min, sum and count.
///
/// Empty input yields all zeros and `count == 0`.
pub fn basic_statistics(values: &[f64]) -> StatisticsResult {
    if values.is_empty() {
        return StatisticsResult::default();
    }

    let sum: f64 = values.iter().sum();
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let count = values.len();

    StatisticsResult {
        // Clamp so rounding in the sum cannot push the mean outside [min, max].
        average: (sum / count as f64).clamp(min, max),
        max,
        min,
        sum,
        count,
    }
}

/// Statistics of one metric over a set of records.
pub fn metric_statistics(records: &[HistoryRecord], metric: Metric) -> StatisticsResult {
    let values: Vec<f64> = records.iter().map(|r| metric.of(r)).collect();
    basic_statistics(&values)
}

impl StatisticsResult {
    /// Combine the statistics of two disjoint partitions.
    pub fn merge(self, other: StatisticsResult) -> StatisticsResult {
        if self.count == 0 {
            return other;
        }
        if other.count == 0 {
            return self;
        }

        let sum = self.sum + other.sum;
        let count = self.count + other.count;
        let max = self.max.max(other.max);
        let min = self.min.min(other.min);

        StatisticsResult {
            average: (sum / count as f64).clamp(min, max),
            max,
            min,
            sum,
            count,
        }
    }
}

/// Number of records per status.
pub fn status_distribution(records: &[HistoryRecord]) -> BTreeMap<DeviceStatus, usize> {
    let mut distribution = BTreeMap::new();
    for record in records {
        *distribution.entry(record.status).or_insert(0) += 1;
    }
    distribution
}

/// WARNING plus ERROR count and its share of the total. The share is 0 for
/// an empty distribution.
pub fn abnormal_share(distribution: &BTreeMap<DeviceStatus, usize>) -> (usize, f64) {
    let total: usize = distribution.values().sum();
    let abnormal: usize = distribution
        .iter()
        .filter(|(status, _)| **status != DeviceStatus::Normal)
        .map(|(_, count)| count)
        .sum();
    if total == 0 {
        return (0, 0.0);
    }
    (abnormal, abnormal as f64 / total as f64)
}

/// Time spent in each status.
///
/// Records are ordered by timestamp; each gap between consecutive records is
/// attributed to the earlier record's status. The final record has no
/// successor and contributes nothing, so fewer than two records yield an
/// empty map. The durations always sum to `last - first`.
pub fn status_durations(records: &[HistoryRecord]) -> BTreeMap<DeviceStatus, Duration> {
    let mut durations = BTreeMap::new();
    if records.len() < 2 {
        return durations;
    }

    let mut sorted: Vec<&HistoryRecord> = records.iter().collect();
    sorted.sort_by_key(|r| r.timestamp);

    for pair in sorted.windows(2) {
        let (current, next) = (pair[0], pair[1]);
        *durations.entry(current.status).or_insert_with(Duration::zero) +=
            next.timestamp - current.timestamp;
    }

    durations
}

/// Count records matching a violation predicate.
pub fn exception_count<P>(records: &[HistoryRecord], predicate: P) -> usize
where
    P: Fn(&HistoryRecord) -> bool,
{
    records.iter().filter(|r| predicate(r)).count()
}

/// Count records whose `metric` lies outside `threshold`.
pub fn metric_exceptions(records: &[HistoryRecord], metric: Metric, threshold: &Threshold) -> usize {
    exception_count(records, |r| threshold.violated_by(metric.of(r)))
}

/// Group records into fixed-width time buckets keyed by bucket start.
///
/// Bucket keys are `ts - (ts mod interval)` in Unix milliseconds, so buckets
/// align to the epoch rather than to the first record.
pub fn aggregate_by_time(
    records: &[HistoryRecord],
    interval: Duration,
) -> BTreeMap<DateTime<Utc>, Vec<&HistoryRecord>> {
    let mut buckets: BTreeMap<DateTime<Utc>, Vec<&HistoryRecord>> = BTreeMap::new();
    let interval_ms = interval.num_milliseconds();
    if interval_ms <= 0 {
        return buckets;
    }

    for record in records {
        let ts = record.timestamp.timestamp_millis();
        let key_ms = ts - ts.rem_euclid(interval_ms);
        if let Some(key) = DateTime::from_timestamp_millis(key_ms) {
            buckets.entry(key).or_default().push(record);
        }
    }
    buckets
}

/// Average of `metric` in each time bucket.
pub fn average_by_time(
    buckets: &BTreeMap<DateTime<Utc>, Vec<&HistoryRecord>>,
    metric: Metric,
) -> BTreeMap<DateTime<Utc>, f64> {
    buckets
        .iter()
        .map(|(key, records)| {
            let values: Vec<f64> = records.iter().map(|r| metric.of(r)).collect();
            (*key, basic_statistics(&values).average)
        })
        .collect()
}

/// Earliest and latest timestamps. Empty input yields the Unix epoch twice.
pub fn time_range(records: &[HistoryRecord]) -> TimeRange {
    let start = records.iter().map(|r| r.timestamp).min();
    let end = records.iter().map(|r| r.timestamp).max();

    match start.zip(end) {
        Some((start, end)) => TimeRange { start, end },
        None => TimeRange {
            start: DateTime::UNIX_EPOCH,
            end: DateTime::UNIX_EPOCH,
        },
    }
}

/// Build a device's track from its located records.
pub fn track_summary(device_id: &str, records: &[HistoryRecord]) -> TrackSummary {
    let mut points: Vec<TrackPoint> = records
        .iter()
        .filter_map(|r| {
            r.location().map(|location| TrackPoint {
                location,
                timestamp: r.timestamp,
                status: r.status,
            })
        })
        .collect();
    points.sort_by_key(|p| p.timestamp);

    let total_distance_m: f64 = points
        .windows(2)
        .map(|pair| pair[0].location.distance_to(&pair[1].location))
        .sum();

    let start = points.first().map(|p| p.timestamp);
    let end = points.last().map(|p| p.timestamp);
    let elapsed_hours = match start.zip(end) {
        Some((start, end)) => (end - start).num_milliseconds() as f64 / 3_600_000.0,
        None => 0.0,
    };
    let avg_speed_kmh = if elapsed_hours > 0.0 {
        (total_distance_m / 1000.0) / elapsed_hours
    } else {
        0.0
    };

    TrackSummary {
        device_id: device_id.to_string(),
        points,
        total_distance_m,
        avg_speed_kmh,
        start,
        end,
    }
}

/// Render a duration for humans: "2d 3h", "4h 5m", "6m 7s" or "8s".
pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.num_seconds().max(0);
    let minutes = seconds / 60;
    let hours = minutes / 60;
    let days = hours / 24;

    if days > 0 {
        format!("{}d {}h", days, hours % 24)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes % 60)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds % 60)
    } else {
        format!("{}s", seconds)
    }
}

/// Acceptable ranges used when counting exceptions in a report.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Thresholds {
    pub temperature: Threshold,
    pub humidity: Threshold,
    pub oxygen_level: Threshold,
}

impl Thresholds {
    pub fn for_metric(&self, metric: Metric) -> &Threshold {
        match metric {
            Metric::Temperature => &self.temperature,
            Metric::Humidity => &self.humidity,
            Metric::OxygenLevel => &self.oxygen_level,
        }
    }
}

impl Default for Thresholds {
    /// Cold-chain defaults: 2-8 °C, 35-75 % humidity, at least 19.5 % oxygen.
    fn default() -> Self {
        Self {
            temperature: Threshold::new(Some(2.0), Some(8.0)),
            humidity: Threshold::new(Some(35.0), Some(75.0)),
            oxygen_level: Threshold::new(Some(19.5), None),
        }
    }
}

/// Time spent in one status, raw and formatted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusDuration {
    pub milliseconds: i64,
    pub display: String,
}

/// Per-metric slice of a [`DeviceReport`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricReport {
    pub metric: Metric,
    pub statistics: StatisticsResult,
    pub threshold: Threshold,
    pub exceptions: usize,
}

/// Everything the reporting consumer shows for one device and window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceReport {
    pub device_id: String,
    pub record_count: usize,
    /// Span actually covered by records, not the requested window.
    pub time_range: TimeRange,
    pub metrics: Vec<MetricReport>,
    pub status_distribution: BTreeMap<DeviceStatus, usize>,
    /// Records in WARNING or ERROR.
    pub abnormal_count: usize,
    pub abnormal_rate: f64,
    pub status_durations: BTreeMap<DeviceStatus, StatusDuration>,
}

/// Compute a full report over `records`. An empty record set gives an empty
/// report ("no data"), not an error.
pub fn build_report(device_id: &str, records: &[HistoryRecord], thresholds: &Thresholds) -> DeviceReport {
    let metrics = Metric::ALL
        .iter()
        .map(|&metric| {
            let threshold = *thresholds.for_metric(metric);
            MetricReport {
                metric,
                statistics: metric_statistics(records, metric),
                threshold,
                exceptions: metric_exceptions(records, metric, &threshold),
            }
        })
        .collect();

    let status_durations = status_durations(records)
        .into_iter()
        .map(|(status, duration)| {
            (
                status,
                StatusDuration {
                    milliseconds: duration.num_milliseconds(),
                    display: format_duration(duration),
                },
            )
        })
        .collect();

    let status_distribution = status_distribution(records);
    let (abnormal_count, abnormal_rate) = abnormal_share(&status_distribution);

    DeviceReport {
        device_id: device_id.to_string(),
        record_count: records.len(),
        time_range: time_range(records),
        metrics,
        status_distribution,
        abnormal_count,
        abnormal_rate,
        status_durations,
    }
}
