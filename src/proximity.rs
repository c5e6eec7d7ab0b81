//! # Proximity Detector
//!
//! Awards a checkpoint's bonus the first time the user comes within the
//! configured radius. Membership in the local visited set is the only
//! de-duplication: once an id is in the set it can never award again.
//!
//! At most one checkpoint awards per evaluated sample. When two unvisited
//! checkpoints are in range at once, the first in list order wins and the
//! other awards on the next sample that is still in range.

use log::info;

use crate::checkpoints::CheckpointSet;
use crate::progress::LocalProgress;
use crate::LocationSample;

/// Emitted once per checkpoint when it is first reached.
#[derive(Debug, Clone, PartialEq)]
pub struct AwardEvent {
    pub checkpoint_id: String,
    pub name: String,
    pub bonus_xp: u32,
    pub partner_id: Option<String>,
    /// Where the user was when the award fired
    pub position: LocationSample,
    /// Local XP after this award
    pub total_xp: u64,
}

#[derive(Debug, Clone)]
pub struct ProximityDetector {
    radius_m: f64,
}

impl ProximityDetector {
    pub fn new(radius_m: f64) -> Self {
        Self { radius_m }
    }

    pub fn radius_m(&self) -> f64 {
        self.radius_m
    }

    /// Check one position against every unvisited checkpoint.
    ///
    /// On a match the id is added to `progress` (which persists itself) and
    /// the award event is returned.
    pub fn evaluate(
        &self,
        position: &LocationSample,
        checkpoints: &CheckpointSet,
        progress: &mut LocalProgress,
    ) -> Option<AwardEvent> {
        if !position.is_valid() {
            return None;
        }

        let hit = checkpoints
            .within_radius(position, self.radius_m)
            .into_iter()
            .find(|c| !progress.is_visited(&c.id))?;

        if !progress.record_award(&hit.id, hit.bonus_xp) {
            return None;
        }

        info!(
            "[Proximity] Checkpoint {} ({}) reached: +{} XP",
            hit.id, hit.name, hit.bonus_xp
        );

        Some(AwardEvent {
            checkpoint_id: hit.id.clone(),
            name: hit.name.clone(),
            bonus_xp: hit.bonus_xp,
            partner_id: hit.partner_id.clone(),
            position: *position,
            total_xp: progress.xp(),
        })
    }
}

impl Default for ProximityDetector {
    fn default() -> Self {
        Self::new(50.0)
    }
}
