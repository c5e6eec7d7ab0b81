//! Remote document store collaborator.
//!
//! Three collections matter to the engine: `zones` (create only),
//! `checkpoints` (full-list read) and one progress document per user
//! (read and merge-write).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checkpoints::Checkpoint;
use crate::progress::UserProgress;
use crate::{LocationSample, Result, TerritoryError, Zone};

/// User id recorded on zones captured while signed out.
pub const OFFLINE_USER: &str = "offline";

/// Remote copy of a zone. Derived from the local [`Zone`], never written back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteZone {
    /// Local zone id; creating the same id twice is a no-op remotely
    pub zone_id: String,
    pub user_id: String,
    pub coords: Vec<LocationSample>,
    pub area: f64,
    pub created_at: DateTime<Utc>,
}

impl RemoteZone {
    pub fn from_zone(zone: &Zone, user_id: Option<&str>) -> Self {
        Self {
            zone_id: zone.id.clone(),
            user_id: user_id.unwrap_or(OFFLINE_USER).to_string(),
            coords: zone.coords.clone(),
            area: zone.area,
            created_at: zone.created_at,
        }
    }
}

/// Remote document store.
pub trait RemoteStore: Send + Sync + 'static {
    /// Create a zone document keyed by `zone.zone_id`.
    fn create_zone(&self, zone: &RemoteZone) -> impl Future<Output = Result<()>> + Send;

    /// Read the full checkpoint list.
    fn list_checkpoints(&self) -> impl Future<Output = Result<Vec<Checkpoint>>> + Send;

    /// Read a user's progress document, `None` if it does not exist yet.
    fn read_progress(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<Option<UserProgress>>> + Send;

    /// Merge-write `xp`, `totalArea` and `visitedCheckpointIds` into the
    /// user's document, creating it if needed.
    fn merge_progress(
        &self,
        user_id: &str,
        progress: &UserProgress,
    ) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Default)]
struct RemoteState {
    zones: BTreeMap<String, RemoteZone>,
    checkpoints: Vec<Checkpoint>,
    progress: HashMap<String, UserProgress>,
    failing_zones: HashSet<String>,
    offline: bool,
    create_calls: usize,
    progress_writes: usize,
}

/// In-process remote store with failure injection, for tests and demos.
#[derive(Debug, Default)]
pub struct InMemoryRemote {
    state: Mutex<RemoteState>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails.
    pub fn set_offline(&self, offline: bool) {
        self.with_state(|s| s.offline = offline);
    }

    /// Make creates for one zone id fail until cleared.
    pub fn fail_zone(&self, zone_id: &str, fail: bool) {
        self.with_state(|s| {
            if fail {
                s.failing_zones.insert(zone_id.to_string());
            } else {
                s.failing_zones.remove(zone_id);
            }
        });
    }

    pub fn set_checkpoints(&self, checkpoints: Vec<Checkpoint>) {
        self.with_state(|s| s.checkpoints = checkpoints);
    }

    pub fn set_progress(&self, user_id: &str, progress: UserProgress) {
        self.with_state(|s| {
            s.progress.insert(user_id.to_string(), progress);
        });
    }

    pub fn zones(&self) -> Vec<RemoteZone> {
        self.with_state(|s| s.zones.values().cloned().collect())
    }

    pub fn progress(&self, user_id: &str) -> Option<UserProgress> {
        self.with_state(|s| s.progress.get(user_id).cloned())
    }

    /// Number of `create_zone` calls received, including failed ones.
    pub fn create_calls(&self) -> usize {
        self.with_state(|s| s.create_calls)
    }

    pub fn progress_writes(&self) -> usize {
        self.with_state(|s| s.progress_writes)
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut RemoteState) -> T) -> T {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }

    fn check_online(state: &RemoteState) -> Result<()> {
        if state.offline {
            return Err(TerritoryError::remote("network unavailable"));
        }
        Ok(())
    }
}

impl RemoteStore for InMemoryRemote {
    async fn create_zone(&self, zone: &RemoteZone) -> Result<()> {
        self.with_state(|s| {
            s.create_calls += 1;
            Self::check_online(s)?;
            if s.failing_zones.contains(&zone.zone_id) {
                return Err(TerritoryError::Remote {
                    message: format!("create rejected for zone {}", zone.zone_id),
                    status_code: Some(500),
                });
            }
            s.zones
                .entry(zone.zone_id.clone())
                .or_insert_with(|| zone.clone());
            Ok(())
        })
    }

    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        self.with_state(|s| {
            Self::check_online(s)?;
            Ok(s.checkpoints.clone())
        })
    }

    async fn read_progress(&self, user_id: &str) -> Result<Option<UserProgress>> {
        self.with_state(|s| {
            Self::check_online(s)?;
            Ok(s.progress.get(user_id).cloned())
        })
    }

    async fn merge_progress(&self, user_id: &str, progress: &UserProgress) -> Result<()> {
        self.with_state(|s| {
            Self::check_online(s)?;
            s.progress_writes += 1;
            let doc = s.progress.entry(user_id.to_string()).or_default();
            doc.xp = progress.xp;
            doc.total_area = progress.total_area;
            doc.visited_checkpoint_ids = progress.visited_checkpoint_ids.clone();
            Ok(())
        })
    }
}
