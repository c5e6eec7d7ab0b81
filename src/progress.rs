//! User progress: XP and the visited-checkpoint set.
//!
//! The visited set only ever grows and XP only ever increases, both locally
//! and in the merged remote document. Merging unions the visited ids and
//! credits the remote XP with the bonus of every locally awarded checkpoint
//! the remote has not seen yet. Once merged those ids are in the remote set,
//! so applying the same merge twice changes nothing.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::{PROGRESS_KEY, VISITED_KEY};
use crate::storage::KeyValueStore;
use crate::Result;

/// Progress document shared with the remote store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProgress {
    #[serde(default)]
    pub xp: u64,
    #[serde(default)]
    pub total_area: f64,
    #[serde(default, alias = "visitedCheckpoints")]
    pub visited_checkpoint_ids: BTreeSet<String>,
}

impl UserProgress {
    /// Combine two progress records without double counting.
    ///
    /// `local` is authoritative for area and the visited ids are unioned.
    /// Remote XP gains the `pending` bonus of each local id it does not list
    /// yet; the result never drops below local XP.
    pub fn merge(
        local: &UserProgress,
        remote: &UserProgress,
        pending: &BTreeMap<String, u32>,
    ) -> UserProgress {
        let unseen: u64 = local
            .visited_checkpoint_ids
            .difference(&remote.visited_checkpoint_ids)
            .map(|id| u64::from(pending.get(id).copied().unwrap_or(0)))
            .sum();

        UserProgress {
            xp: local.xp.max(remote.xp + unseen),
            total_area: local.total_area,
            visited_checkpoint_ids: local
                .visited_checkpoint_ids
                .union(&remote.visited_checkpoint_ids)
                .cloned()
                .collect(),
        }
    }
}

/// Local progress as handed to a sync pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressSnapshot {
    pub progress: UserProgress,
    /// Bonus per checkpoint awarded on this device and not yet merged remotely
    pub pending: BTreeMap<String, u32>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredXp {
    #[serde(default)]
    xp: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pending: BTreeMap<String, u32>,
}

/// Device-local visited set and XP, persisted under their own keys.
pub struct LocalProgress {
    storage: Arc<dyn KeyValueStore>,
    visited: BTreeSet<String>,
    xp: u64,
    pending: BTreeMap<String, u32>,
    dirty: bool,
}

impl LocalProgress {
    /// Restore from storage; anything missing or malformed starts empty.
    pub fn load(storage: Arc<dyn KeyValueStore>) -> Self {
        let visited = match storage.get(VISITED_KEY) {
            Ok(Some(raw)) => parse_visited(&raw),
            Ok(None) => BTreeSet::new(),
            Err(e) => {
                warn!("[Progress] Failed to read visited checkpoints: {}", e);
                BTreeSet::new()
            }
        };

        let stored = match storage.get(PROGRESS_KEY) {
            Ok(Some(raw)) => serde_json::from_str::<StoredXp>(&raw).unwrap_or_else(|e| {
                warn!("[Progress] Ignoring malformed progress blob: {}", e);
                StoredXp::default()
            }),
            Ok(None) => StoredXp::default(),
            Err(e) => {
                warn!("[Progress] Failed to read progress: {}", e);
                StoredXp::default()
            }
        };
        let xp = stored.xp;
        // A ledger entry only counts for an id that is still visited
        let pending = stored
            .pending
            .into_iter()
            .filter(|(id, _)| visited.contains(id))
            .collect();

        info!(
            "[Progress] Loaded {} visited checkpoints, {} XP",
            visited.len(),
            xp
        );

        Self {
            storage,
            visited,
            xp,
            pending,
            dirty: false,
        }
    }

    pub fn xp(&self) -> u64 {
        self.xp
    }

    pub fn visited(&self) -> &BTreeSet<String> {
        &self.visited
    }

    pub fn is_visited(&self, checkpoint_id: &str) -> bool {
        self.visited.contains(checkpoint_id)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Record an award. Returns `false` (and changes nothing) if the
    /// checkpoint was already visited.
    pub fn record_award(&mut self, checkpoint_id: &str, bonus_xp: u32) -> bool {
        if !self.visited.insert(checkpoint_id.to_string()) {
            return false;
        }
        self.xp += u64::from(bonus_xp);
        self.pending.insert(checkpoint_id.to_string(), bonus_xp);
        self.flush();
        true
    }

    /// Awards not yet reflected in a merged remote document.
    pub fn pending(&self) -> &BTreeMap<String, u32> {
        &self.pending
    }

    /// Adopt a merged progress record. Never removes visited ids or lowers XP.
    ///
    /// Ledger entries for ids the merged record lists are settled and dropped.
    pub fn absorb(&mut self, merged: &UserProgress) {
        let before = (self.visited.len(), self.xp, self.pending.len());
        self.visited
            .extend(merged.visited_checkpoint_ids.iter().cloned());
        self.xp = self.xp.max(merged.xp);
        self.pending
            .retain(|id, _| !merged.visited_checkpoint_ids.contains(id));
        if (self.visited.len(), self.xp, self.pending.len()) != before {
            debug!(
                "[Progress] Absorbed remote progress: {} visited, {} XP",
                self.visited.len(),
                self.xp
            );
            self.flush();
        }
    }

    /// The local view as a progress document plus the unsettled awards.
    pub fn snapshot(&self, total_area: f64) -> ProgressSnapshot {
        ProgressSnapshot {
            progress: UserProgress {
                xp: self.xp,
                total_area,
                visited_checkpoint_ids: self.visited.clone(),
            },
            pending: self.pending.clone(),
        }
    }

    /// Write both keys. The visited set goes first: losing XP on a partial
    /// write is recoverable, re-awarding a checkpoint is not.
    pub fn save(&mut self) -> Result<()> {
        let visited: Vec<&String> = self.visited.iter().collect();
        let result = self
            .storage
            .set(VISITED_KEY, &serde_json::to_string(&visited)?)
            .and_then(|_| {
                let xp = serde_json::to_string(&StoredXp {
                    xp: self.xp,
                    pending: self.pending.clone(),
                })?;
                self.storage.set(PROGRESS_KEY, &xp)
            });
        self.dirty = result.is_err();
        result
    }

    fn flush(&mut self) {
        if let Err(e) = self.save() {
            warn!("[Progress] Failed to persist progress, keeping in memory: {}", e);
        }
    }
}

fn parse_visited(raw: &str) -> BTreeSet<String> {
    match serde_json::from_str::<Vec<serde_json::Value>>(raw) {
        Ok(entries) => entries
            .into_iter()
            .filter_map(|v| match v {
                serde_json::Value::String(s) if !s.is_empty() => Some(s),
                other => {
                    warn!("[Progress] Dropping malformed visited id {}", other);
                    None
                }
            })
            .collect(),
        Err(e) => {
            warn!("[Progress] Visited checkpoints are not a JSON array: {}", e);
            BTreeSet::new()
        }
    }
}
