//! # Zone Store
//!
//! Durable, ordered collection of captured zones.
//!
//! The whole collection is re-serialized to the `zones` key after every
//! mutation. If a write fails the in-memory collection stays authoritative
//! and the store is marked dirty; the next successful write carries every
//! change made in between.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::ZONES_KEY;
use crate::geometry::{distinct_vertex_count, is_closed, polygon_area};
use crate::storage::KeyValueStore;
use crate::{LocationSample, Result};

/// A closed polygon captured during one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Zone {
    /// Derived from the creation time in milliseconds
    pub id: String,
    /// Closed ring: first and last point are identical
    pub coords: Vec<LocationSample>,
    /// Enclosed area in square meters
    pub area: f64,
    pub created_at: DateTime<Utc>,
    /// True once the remote store has accepted this zone
    pub synced: bool,
}

impl Zone {
    /// Build an unsynced zone from a closed ring, computing its area.
    pub fn new(coords: Vec<LocationSample>, created_at: DateTime<Utc>) -> Self {
        let area = polygon_area(&coords);
        Self {
            id: created_at.timestamp_millis().to_string(),
            coords,
            area,
            created_at,
            synced: false,
        }
    }

    /// Check the ring invariants: closed, at least 4 points, 3 distinct vertices.
    pub fn is_well_formed(&self) -> bool {
        self.coords.len() >= 4
            && is_closed(&self.coords)
            && distinct_vertex_count(&self.coords) >= 3
            && self.coords.iter().all(|p| p.is_valid())
            && self.area.is_finite()
            && self.area >= 0.0
    }
}

/// Persisted zone shape, tolerant of older blobs (no id, `date` field,
/// missing `synced`).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredZone {
    #[serde(default)]
    id: Option<String>,
    coords: Vec<LocationSample>,
    #[serde(default)]
    area: Option<f64>,
    #[serde(alias = "date")]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    synced: bool,
}

impl StoredZone {
    fn into_zone(self) -> Option<Zone> {
        let created_at = self
            .created_at
            .or_else(|| {
                self.coords
                    .first()
                    .and_then(|p| Utc.timestamp_millis_opt(p.timestamp).single())
            })?;

        let area = polygon_area(&self.coords);
        if let Some(stored) = self.area {
            if (stored - area).abs() > 1.0 {
                debug!(
                    "[ZoneStore] Recomputed area {:.1} m² (stored {:.1} m²)",
                    area, stored
                );
            }
        }

        let zone = Zone {
            id: self
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| created_at.timestamp_millis().to_string()),
            coords: self.coords,
            area,
            created_at,
            synced: self.synced,
        };
        zone.is_well_formed().then_some(zone)
    }
}

/// Ordered zone collection with derived total area.
pub struct ZoneStore {
    storage: Arc<dyn KeyValueStore>,
    zones: Vec<Zone>,
    dirty: bool,
}

impl ZoneStore {
    /// Restore zones from storage.
    ///
    /// Missing or unreadable data yields an empty store. Individual malformed
    /// entries are dropped and the rest kept.
    pub fn load(storage: Arc<dyn KeyValueStore>) -> Self {
        let zones = match storage.get(ZONES_KEY) {
            Ok(Some(raw)) => parse_zones(&raw),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("[ZoneStore] Failed to read zones, starting empty: {}", e);
                Vec::new()
            }
        };

        info!(
            "[ZoneStore] Loaded {} zones ({} unsynced)",
            zones.len(),
            zones.iter().filter(|z| !z.synced).count()
        );

        Self {
            storage,
            zones,
            dirty: false,
        }
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Zone> {
        self.zones.iter().find(|z| z.id == id)
    }

    /// Sum of all zone areas in square meters.
    pub fn total_area(&self) -> f64 {
        self.zones.iter().map(|z| z.area).sum()
    }

    /// Copy of every zone not yet accepted by the remote store.
    pub fn unsynced(&self) -> Vec<Zone> {
        self.zones.iter().filter(|z| !z.synced).cloned().collect()
    }

    /// True when the last write failed and memory is ahead of storage.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Append a zone and persist. Returns the id it was stored under
    /// (suffixed if another zone already used the same id).
    pub fn append(&mut self, mut zone: Zone) -> String {
        zone.id = unique_id(&self.zones, &zone.id);
        let id = zone.id.clone();
        info!(
            "[ZoneStore] Appending zone {} ({:.0} m², {} points)",
            id,
            zone.area,
            zone.coords.len()
        );
        self.zones.push(zone);
        self.flush();
        id
    }

    /// Mark zones as synced and persist. Unknown ids are ignored.
    /// Returns the number of zones that flipped to synced.
    pub fn mark_synced(&mut self, ids: &[String]) -> usize {
        let mut changed = 0;
        for zone in self.zones.iter_mut() {
            if !zone.synced && ids.contains(&zone.id) {
                zone.synced = true;
                changed += 1;
            }
        }
        if changed > 0 {
            debug!("[ZoneStore] Marked {} zones synced", changed);
            self.flush();
        }
        changed
    }

    /// Remove every zone.
    pub fn clear(&mut self) {
        self.zones.clear();
        match self.storage.remove(ZONES_KEY) {
            Ok(()) => self.dirty = false,
            Err(e) => {
                warn!("[ZoneStore] Failed to remove persisted zones: {}", e);
                self.dirty = true;
            }
        }
        info!("[ZoneStore] Cleared");
    }

    /// Serialize the whole collection to storage.
    pub fn save(&mut self) -> Result<()> {
        let json = serde_json::to_string(&self.zones)?;
        match self.storage.set(ZONES_KEY, &json) {
            Ok(()) => {
                self.dirty = false;
                Ok(())
            }
            Err(e) => {
                self.dirty = true;
                Err(e)
            }
        }
    }

    fn flush(&mut self) {
        if let Err(e) = self.save() {
            warn!(
                "[ZoneStore] Failed to persist {} zones, keeping in memory: {}",
                self.zones.len(),
                e
            );
        }
    }
}

fn parse_zones(raw: &str) -> Vec<Zone> {
    let entries: Vec<serde_json::Value> = match serde_json::from_str(raw) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("[ZoneStore] Persisted zones are not a JSON array, ignoring: {}", e);
            return Vec::new();
        }
    };

    let total = entries.len();
    let mut zones: Vec<Zone> = Vec::with_capacity(total);
    for entry in entries {
        let Some(mut zone) = serde_json::from_value::<StoredZone>(entry)
            .ok()
            .and_then(StoredZone::into_zone)
        else {
            continue;
        };
        let id = unique_id(&zones, &zone.id);
        if id != zone.id {
            warn!("[ZoneStore] Duplicate zone id {} renamed to {}", zone.id, id);
            zone.id = id;
        }
        zones.push(zone);
    }

    if zones.len() < total {
        warn!(
            "[ZoneStore] Dropped {} malformed zone entries",
            total - zones.len()
        );
    }
    zones
}

/// `base` if no zone uses it yet, otherwise `base-n` for the smallest free `n`.
fn unique_id(zones: &[Zone], base: &str) -> String {
    let taken = |id: &str| zones.iter().any(|z| z.id == id);
    if !taken(base) {
        return base.to_string();
    }
    (1..)
        .map(|n| format!("{}-{}", base, n))
        .find(|id| !taken(id))
        .unwrap_or_else(|| base.to_string())
}
