//! Checkpoints: fixed reward points supplied by the remote store.
//!
//! The set is always replaced wholesale on refresh. An R-tree over the
//! checkpoint positions narrows proximity and nearby queries to candidates
//! inside a bounding box before the exact haversine check.

use log::{debug, warn};
use rstar::{RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};

use crate::geometry::{haversine_distance, meters_to_degrees};
use crate::LocationSample;

/// A fixed point granting a one-time XP bonus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(rename = "bonusXP", default)]
    pub bonus_xp: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partner_id: Option<String>,
}

impl Checkpoint {
    pub fn position(&self) -> LocationSample {
        LocationSample::new(self.latitude, self.longitude, 0)
    }

    pub fn is_partner(&self) -> bool {
        self.partner_id.is_some()
    }
}

/// Which checkpoints a nearby listing should include.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartnerFilter {
    #[default]
    All,
    /// Only checkpoints sponsored by a partner
    Partner,
    /// Only checkpoints without a partner
    Regular,
}

impl PartnerFilter {
    fn accepts(&self, checkpoint: &Checkpoint) -> bool {
        match self {
            PartnerFilter::All => true,
            PartnerFilter::Partner => checkpoint.is_partner(),
            PartnerFilter::Regular => !checkpoint.is_partner(),
        }
    }
}

/// A checkpoint together with its distance from a query position.
#[derive(Debug, Clone, PartialEq)]
pub struct NearbyCheckpoint {
    pub checkpoint: Checkpoint,
    pub distance_m: f64,
}

/// R-tree entry pointing back into the checkpoint list.
#[derive(Debug, Clone)]
struct CheckpointEntry {
    index: usize,
    lng: f64,
    lat: f64,
}

impl RTreeObject for CheckpointEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.lng, self.lat])
    }
}

/// The current checkpoint list with its spatial index.
pub struct CheckpointSet {
    checkpoints: Vec<Checkpoint>,
    index: RTree<CheckpointEntry>,
}

impl CheckpointSet {
    pub fn new() -> Self {
        Self {
            checkpoints: Vec::new(),
            index: RTree::new(),
        }
    }

    pub fn from_list(list: Vec<Checkpoint>) -> Self {
        let mut set = Self::new();
        set.replace(list);
        set
    }

    /// Replace the whole list. Entries with invalid coordinates or an empty id
    /// are dropped.
    pub fn replace(&mut self, list: Vec<Checkpoint>) {
        let total = list.len();
        self.checkpoints = list
            .into_iter()
            .filter(|c| !c.id.is_empty() && c.position().is_valid())
            .collect();
        if self.checkpoints.len() < total {
            warn!(
                "[Checkpoints] Dropped {} invalid checkpoints",
                total - self.checkpoints.len()
            );
        }

        let entries: Vec<CheckpointEntry> = self
            .checkpoints
            .iter()
            .enumerate()
            .map(|(index, c)| CheckpointEntry {
                index,
                lng: c.longitude,
                lat: c.latitude,
            })
            .collect();
        self.index = RTree::bulk_load(entries);
        debug!("[Checkpoints] Indexed {} checkpoints", self.checkpoints.len());
    }

    pub fn all(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Checkpoint> {
        self.checkpoints.iter().find(|c| c.id == id)
    }

    /// Checkpoints within `radius_m` of `position`, in list order.
    pub fn within_radius(&self, position: &LocationSample, radius_m: f64) -> Vec<&Checkpoint> {
        let mut indices: Vec<usize> = search_boxes(position, radius_m)
            .iter()
            .flat_map(|envelope| self.index.locate_in_envelope(envelope))
            .map(|e| e.index)
            .collect();
        indices.sort_unstable();
        indices.dedup();

        indices
            .into_iter()
            .map(|i| &self.checkpoints[i])
            .filter(|c| haversine_distance(position, &c.position()) <= radius_m)
            .collect()
    }

    /// Every checkpoint accepted by `filter`, nearest first.
    pub fn nearby(&self, position: &LocationSample, filter: PartnerFilter) -> Vec<NearbyCheckpoint> {
        let mut result: Vec<NearbyCheckpoint> = self
            .checkpoints
            .iter()
            .filter(|c| filter.accepts(c))
            .map(|c| NearbyCheckpoint {
                distance_m: haversine_distance(position, &c.position()),
                checkpoint: c.clone(),
            })
            .collect();
        result.sort_by(|a, b| a.distance_m.total_cmp(&b.distance_m));
        result
    }
}

impl Default for CheckpointSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounding boxes in degrees that together contain every point within
/// `radius_m`. A box crossing the antimeridian is split into two.
fn search_boxes(position: &LocationSample, radius_m: f64) -> Vec<AABB<[f64; 2]>> {
    // Pad slightly so points exactly on the radius are not clipped
    let dlat = meters_to_degrees(radius_m) * 1.01;
    let cos_lat = position.latitude.to_radians().cos();
    let dlng = if cos_lat > 1e-6 {
        (dlat / cos_lat).min(180.0)
    } else {
        180.0
    };

    let (min_lat, max_lat) = (position.latitude - dlat, position.latitude + dlat);
    let (west, east) = (position.longitude - dlng, position.longitude + dlng);
    let band = |lo: f64, hi: f64| AABB::from_corners([lo, min_lat], [hi, max_lat]);

    if dlng >= 180.0 {
        return vec![band(-180.0, 180.0)];
    }
    let mut boxes = vec![band(west.max(-180.0), east.min(180.0))];
    if west < -180.0 {
        boxes.push(band(west + 360.0, 180.0));
    }
    if east > 180.0 {
        boxes.push(band(-180.0, east - 360.0));
    }
    boxes
}
