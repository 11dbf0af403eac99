//! Concurrent registry of the latest known state per device.
//!
//! The registry is the only long-lived shared mutable structure in the
//! engine. Entries are `Arc<DeviceState>` values that are swapped whole on
//! upsert, never edited field by field, so a reader can never observe a
//! half-updated device. Locking is per shard: writers to unrelated devices do
//! not contend, and [`DeviceRegistry::snapshot`] only holds one shard's read
//! lock at a time.
//!
//! Changes are also published on a broadcast channel so consumers can react
//! to updates without polling.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::model::{DeviceState, DeviceStatus, RegistryEvent};

/// Default capacity of the change channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// One registry slot: the current state plus the bookkeeping the registry
/// assigns when it accepts it.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEntry {
    pub state: Arc<DeviceState>,
    /// Registry-wide upsert counter. Every upsert gets a larger value than
    /// any before it, whatever the sensor timestamp says.
    pub seq: u64,
    /// Server time at which the state was accepted.
    pub received_at: DateTime<Utc>,
}

pub struct DeviceRegistry {
    devices: DashMap<String, RegistryEntry>,
    next_seq: AtomicU64,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl DeviceRegistry {
    /// Create an empty registry whose change channel buffers up to
    /// `event_capacity` events per subscriber.
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            devices: DashMap::new(),
            next_seq: AtomicU64::new(0),
            events,
        }
    }

    /// Insert or replace the entry for `state.id`. Last writer wins.
    ///
    /// The sequence number is taken and the change event published while the
    /// entry is locked, so both follow the order in which same-device updates
    /// were applied. Returns the new entry's sequence number.
    pub fn upsert(&self, state: DeviceState) -> u64 {
        let state = Arc::new(state);

        match self.devices.entry(state.id.clone()) {
            Entry::Occupied(mut occupied) => {
                let seq = self.next_seq();
                occupied.insert(RegistryEntry {
                    state: Arc::clone(&state),
                    seq,
                    received_at: Utc::now(),
                });
                self.publish(RegistryEvent::Upserted(state));
                seq
            }
            Entry::Vacant(vacant) => {
                let seq = self.next_seq();
                let _slot = vacant.insert(RegistryEntry {
                    state: Arc::clone(&state),
                    seq,
                    received_at: Utc::now(),
                });
                debug!(device_id = %state.id, "Device registered");
                self.publish(RegistryEvent::Upserted(state));
                seq
            }
        }
    }

    /// Insert `state` only if its device is not registered yet. Returns the
    /// sequence number when inserted.
    pub fn insert_if_absent(&self, state: DeviceState) -> Option<u64> {
        match self.devices.entry(state.id.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                let seq = self.next_seq();
                let state = Arc::new(state);
                let _slot = vacant.insert(RegistryEntry {
                    state: Arc::clone(&state),
                    seq,
                    received_at: Utc::now(),
                });
                self.publish(RegistryEvent::Upserted(state));
                Some(seq)
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<DeviceState>> {
        self.devices.get(id).map(|entry| Arc::clone(&entry.state))
    }

    pub fn entry(&self, id: &str) -> Option<RegistryEntry> {
        self.devices.get(id).map(|entry| entry.value().clone())
    }

    /// Copy every state, ordered by device id.
    pub fn snapshot(&self) -> Vec<DeviceState> {
        self.entries()
            .into_iter()
            .map(|entry| DeviceState::clone(&entry.state))
            .collect()
    }

    /// Copy every entry with its bookkeeping, ordered by device id.
    pub fn entries(&self) -> Vec<RegistryEntry> {
        let mut entries: Vec<RegistryEntry> =
            self.devices.iter().map(|entry| entry.value().clone()).collect();
        entries.sort_by(|a, b| a.state.id.cmp(&b.state.id));
        entries
    }

    /// Remove a device. Returns the removed state, if it existed.
    pub fn remove(&self, id: &str) -> Option<Arc<DeviceState>> {
        let (id, entry) = self.devices.remove(id)?;
        info!(device_id = %id, "Device removed");
        self.publish(RegistryEvent::Removed(id));
        Some(entry.state)
    }

    /// Remove a device only if its entry is still the one with sequence
    /// number `seq`.
    pub fn remove_if_current(&self, id: &str, seq: u64) -> Option<Arc<DeviceState>> {
        let (id, entry) = self.devices.remove_if(id, |_, entry| entry.seq == seq)?;
        info!(device_id = %id, "Device removed");
        self.publish(RegistryEvent::Removed(id));
        Some(entry.state)
    }

    /// Remove every device the registry has not heard from for `max_age` at
    /// `now`, as long as `evictable` agrees.
    ///
    /// Age is measured from [`RegistryEntry::received_at`], not the sensor
    /// timestamp, so backfilled readings are not evicted on arrival. The
    /// predicate and the age check run under the entry lock: a device
    /// refreshed between the scan and the removal is kept.
    pub fn evict_stale<F>(&self, max_age: Duration, now: DateTime<Utc>, evictable: F) -> Vec<String>
    where
        F: Fn(&RegistryEntry) -> bool,
    {
        let Some(cutoff) = now.checked_sub_signed(max_age) else {
            return Vec::new();
        };

        let candidates: Vec<String> = self
            .devices
            .iter()
            .filter(|entry| entry.received_at < cutoff)
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = Vec::with_capacity(candidates.len());
        for id in candidates {
            if let Some((id, _)) = self
                .devices
                .remove_if(&id, |_, entry| entry.received_at < cutoff && evictable(entry))
            {
                self.publish(RegistryEvent::Removed(id.clone()));
                evicted.push(id);
            }
        }

        if !evicted.is_empty() {
            info!(count = evicted.len(), cutoff = %cutoff, "Evicted stale devices");
        }
        evicted
    }

    /// Subscribe to registry changes. Slow subscribers lag rather than block
    /// writers.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Number of devices currently registered.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Live device count per status. Every status is present, possibly zero.
    pub fn status_counts(&self) -> BTreeMap<DeviceStatus, usize> {
        let mut counts: BTreeMap<DeviceStatus, usize> =
            DeviceStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for entry in self.devices.iter() {
            *counts.entry(entry.state.status).or_default() += 1;
        }
        counts
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn publish(&self, event: RegistryEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }
}
