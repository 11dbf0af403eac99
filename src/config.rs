//! Runtime configuration, read from `COLDTRACK_*` environment variables.
//!
//! Unset or unparsable values fall back to the defaults below.

use std::env;
use std::time::Duration;

use crate::registry::DEFAULT_EVENT_CAPACITY;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_DB_URL: &str = "sqlite:coldtrack.db?mode=rwc";
pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_CLUSTER_RADIUS_M: f64 = 500.0;
pub const DEFAULT_CHART_MAX_POINTS: usize = 500;

/// Settings the telemetry service needs at runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSettings {
    pub flush_interval: Duration,
    /// Wake the flush loop on every ingest instead of waiting for the tick.
    pub flush_on_ingest: bool,
    /// When set, devices not heard from for longer than this (by receive
    /// time) are evicted once their state is persisted.
    pub device_ttl: Option<Duration>,
    pub cluster_radius_m: f64,
    pub chart_max_points: usize,
    pub event_capacity: usize,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS),
            flush_on_ingest: false,
            device_ttl: None,
            cluster_radius_m: DEFAULT_CLUSTER_RADIUS_M,
            chart_max_points: DEFAULT_CHART_MAX_POINTS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub service: ServiceSettings,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        let port = lookup("COLDTRACK_PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let database_url =
            lookup("COLDTRACK_DATABASE_URL").unwrap_or_else(|| DEFAULT_DB_URL.to_string());

        let flush_interval = parsed("COLDTRACK_FLUSH_INTERVAL_SECS")
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS));

        let flush_on_ingest = lookup("COLDTRACK_FLUSH_ON_INGEST")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let device_ttl = parsed("COLDTRACK_DEVICE_TTL_SECS")
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let cluster_radius_m = lookup("COLDTRACK_CLUSTER_RADIUS_M")
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|r| r.is_finite() && *r >= 0.0)
            .unwrap_or(DEFAULT_CLUSTER_RADIUS_M);

        let chart_max_points = lookup("COLDTRACK_CHART_MAX_POINTS")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|n| *n >= crate::downsample::MIN_POINTS)
            .unwrap_or(DEFAULT_CHART_MAX_POINTS);

        let event_capacity = lookup("COLDTRACK_EVENT_CAPACITY")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_EVENT_CAPACITY);

        Self {
            port,
            database_url,
            service: ServiceSettings {
                flush_interval,
                flush_on_ingest,
                device_ttl,
                cluster_radius_m,
                chart_max_points,
                event_capacity,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]);

        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.database_url, DEFAULT_DB_URL);
        assert_eq!(config.service, ServiceSettings::default());
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("COLDTRACK_PORT", "8080"),
            ("COLDTRACK_DATABASE_URL", "sqlite::memory:"),
            ("COLDTRACK_FLUSH_INTERVAL_SECS", "5"),
            ("COLDTRACK_FLUSH_ON_INGEST", "true"),
            ("COLDTRACK_DEVICE_TTL_SECS", "600"),
            ("COLDTRACK_CLUSTER_RADIUS_M", "250.5"),
            ("COLDTRACK_CHART_MAX_POINTS", "120"),
        ]);

        assert_eq!(config.port, 8080);
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.service.flush_interval, Duration::from_secs(5));
        assert!(config.service.flush_on_ingest);
        assert_eq!(config.service.device_ttl, Some(Duration::from_secs(600)));
        assert_eq!(config.service.cluster_radius_m, 250.5);
        assert_eq!(config.service.chart_max_points, 120);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = config_from(&[
            ("COLDTRACK_PORT", "not-a-port"),
            ("COLDTRACK_FLUSH_INTERVAL_SECS", "0"),
            ("COLDTRACK_DEVICE_TTL_SECS", "soon"),
            ("COLDTRACK_CLUSTER_RADIUS_M", "-3"),
            ("COLDTRACK_CHART_MAX_POINTS", "1"),
            ("COLDTRACK_EVENT_CAPACITY", "0"),
        ]);

        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.service, ServiceSettings::default());
    }

    #[test]
    fn test_event_capacity_matches_default_registry() {
        let settings = ServiceSettings::default();
        let registry = crate::registry::DeviceRegistry::new(settings.event_capacity);

        assert_eq!(settings.event_capacity, DEFAULT_EVENT_CAPACITY);
        assert_eq!(
            config_from(&[("COLDTRACK_EVENT_CAPACITY", "64")]).service.event_capacity,
            64
        );
        assert!(registry.is_empty());
    }
}
