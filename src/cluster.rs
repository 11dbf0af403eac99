//! Geospatial clustering of devices for map display.
//!
//! A single greedy pass in input order. Each device not yet placed opens a
//! cluster at its own coordinate (the seed), and every later unplaced device
//! within `radius_m` of that seed joins it. Membership is always tested
//! against the fixed seed, never the moving centroid; the centroid is
//! recomputed after each join purely for rendering. Worst case O(n²), fine
//! for fleets in the low hundreds.
//!
//! The engine does not know about zoom levels. Deciding when to show clusters
//! instead of individual markers is the map layer's job.

use crate::error::CoreError;
use crate::model::{Cluster, DeviceState, DeviceStatus, GeoPoint};

/// Group located devices into clusters of radius `radius_m` meters.
///
/// Devices without a location are skipped. Every located device ends up in
/// exactly one cluster.
pub fn cluster<'a, I>(devices: I, radius_m: f64) -> Result<Vec<Cluster>, CoreError>
where
    I: IntoIterator<Item = &'a DeviceState>,
{
    if !radius_m.is_finite() || radius_m < 0.0 {
        return Err(CoreError::invalid(format!(
            "radius_m must be a non-negative number, got {radius_m}"
        )));
    }

    let located: Vec<(&DeviceState, GeoPoint)> = devices
        .into_iter()
        .filter_map(|device| device.location.map(|point| (device, point)))
        .collect();

    let mut placed = vec![false; located.len()];
    let mut clusters = Vec::new();

    for seed_index in 0..located.len() {
        if placed[seed_index] {
            continue;
        }
        placed[seed_index] = true;

        let (seed_device, seed) = located[seed_index];
        let mut builder = ClusterBuilder::new(seed);
        builder.add(seed_device, seed);

        for candidate in (seed_index + 1)..located.len() {
            if placed[candidate] {
                continue;
            }
            let (device, point) = located[candidate];
            if seed.distance_to(&point) <= radius_m {
                placed[candidate] = true;
                builder.add(device, point);
            }
        }

        clusters.push(builder.finish());
    }

    Ok(clusters)
}

struct ClusterBuilder {
    lat_sum: f64,
    lng_sum: f64,
    cluster: Cluster,
}

impl ClusterBuilder {
    fn new(seed: GeoPoint) -> Self {
        Self {
            lat_sum: 0.0,
            lng_sum: 0.0,
            cluster: Cluster {
                seed,
                centroid: seed,
                device_ids: Vec::new(),
                device_count: 0,
                normal_count: 0,
                warning_count: 0,
                error_count: 0,
            },
        }
    }

    fn add(&mut self, device: &DeviceState, point: GeoPoint) {
        let cluster = &mut self.cluster;
        cluster.device_ids.push(device.id.clone());
        cluster.device_count += 1;
        match device.status {
            DeviceStatus::Normal => cluster.normal_count += 1,
            DeviceStatus::Warning => cluster.warning_count += 1,
            DeviceStatus::Error => cluster.error_count += 1,
        }

        self.lat_sum += point.lat;
        self.lng_sum += point.lng;
        let n = cluster.device_count as f64;
        cluster.centroid = GeoPoint::new(self.lat_sum / n, self.lng_sum / n);
    }

    fn finish(self) -> Cluster {
        self.cluster
    }
}
