//! # Sync Reconciler
//!
//! Pushes locally captured zones and user progress to the remote store.
//!
//! Zones: every unsynced zone is created remotely; each success is reported
//! back so the caller can mark it synced, each failure leaves that zone for
//! the next trigger without blocking the others.
//!
//! Progress: the remote document is read, merged with the local totals
//! (union of visited ids, remote XP credited with awards it has not seen) and
//! written back as absolute values, so retrying a sync can never double count.
//!
//! The reconciler runs only when triggered (connectivity regained or an
//! explicit call). It never retries on its own.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use log::{debug, info, warn};

use crate::checkpoints::Checkpoint;
use crate::progress::{LocalProgress, ProgressSnapshot, UserProgress};
use crate::remote::{RemoteStore, RemoteZone};
use crate::{Result, Zone, ZoneStore};

/// Outcome of one zone push pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZoneSyncReport {
    pub attempted: usize,
    /// Zones the remote accepted, in no particular order
    pub synced_ids: Vec<String>,
    /// `(zone id, error message)` for zones left unsynced
    pub failed: Vec<(String, String)>,
}

impl ZoneSyncReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Outcome of one progress merge.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressSyncReport {
    /// No signed-in user
    Skipped,
    /// Remote now holds these totals
    Merged(UserProgress),
    /// Read or write failed; retry on the next trigger
    Failed(String),
}

pub struct SyncReconciler<R: RemoteStore> {
    remote: Arc<R>,
    user_id: Option<String>,
    concurrency: usize,
}

impl<R: RemoteStore> Clone for SyncReconciler<R> {
    fn clone(&self) -> Self {
        Self {
            remote: Arc::clone(&self.remote),
            user_id: self.user_id.clone(),
            concurrency: self.concurrency,
        }
    }
}

impl<R: RemoteStore> SyncReconciler<R> {
    pub fn new(remote: Arc<R>, user_id: Option<String>) -> Self {
        Self {
            remote,
            user_id,
            concurrency: 4,
        }
    }

    /// Cap on zone creates in flight at once.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    /// Create a remote record for each zone in `zones`.
    ///
    /// Works on a snapshot; the caller applies `synced_ids` to its store.
    pub async fn push_zones(&self, zones: Vec<Zone>) -> ZoneSyncReport {
        let attempted = zones.len();
        if attempted == 0 {
            debug!("[Sync] No unsynced zones");
            return ZoneSyncReport::default();
        }

        info!("[Sync] Pushing {} unsynced zones", attempted);
        let results: Vec<(String, Result<()>)> = stream::iter(zones)
            .map(|zone| {
                let remote = Arc::clone(&self.remote);
                let doc = RemoteZone::from_zone(&zone, self.user_id.as_deref());
                async move {
                    let result = remote.create_zone(&doc).await;
                    (doc.zone_id, result)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = ZoneSyncReport {
            attempted,
            ..Default::default()
        };
        for (id, result) in results {
            match result {
                Ok(()) => report.synced_ids.push(id),
                Err(e) => {
                    warn!("[Sync] Zone {} left unsynced: {}", id, e);
                    report.failed.push((id, e.to_string()));
                }
            }
        }

        info!(
            "[Sync] Zones: {}/{} synced",
            report.synced_ids.len(),
            report.attempted
        );
        report
    }

    /// Push every unsynced zone in `store` and mark the accepted ones.
    pub async fn sync_zones(&self, store: &mut ZoneStore) -> ZoneSyncReport {
        let report = self.push_zones(store.unsynced()).await;
        store.mark_synced(&report.synced_ids);
        report
    }

    /// Merge `local` into the remote progress document.
    pub async fn push_progress(&self, local: ProgressSnapshot) -> ProgressSyncReport {
        let Some(user_id) = self.user_id.as_deref() else {
            debug!("[Sync] No signed-in user, progress stays local");
            return ProgressSyncReport::Skipped;
        };

        let remote = match self.remote.read_progress(user_id).await {
            Ok(remote) => remote,
            Err(e) => {
                warn!("[Sync] Failed to read progress for {}: {}", user_id, e);
                return ProgressSyncReport::Failed(e.to_string());
            }
        };

        let merged = match &remote {
            Some(remote) => UserProgress::merge(&local.progress, remote, &local.pending),
            None => local.progress,
        };

        if remote.as_ref() == Some(&merged) {
            debug!("[Sync] Remote progress already up to date");
            return ProgressSyncReport::Merged(merged);
        }

        match self.remote.merge_progress(user_id, &merged).await {
            Ok(()) => {
                info!(
                    "[Sync] Progress merged: {} XP, {} visited",
                    merged.xp,
                    merged.visited_checkpoint_ids.len()
                );
                ProgressSyncReport::Merged(merged)
            }
            Err(e) => {
                warn!("[Sync] Failed to write progress for {}: {}", user_id, e);
                ProgressSyncReport::Failed(e.to_string())
            }
        }
    }

    /// Merge local progress with the remote and adopt the merged totals locally.
    pub async fn sync_progress(
        &self,
        progress: &mut LocalProgress,
        total_area: f64,
    ) -> ProgressSyncReport {
        let report = self.push_progress(progress.snapshot(total_area)).await;
        if let ProgressSyncReport::Merged(merged) = &report {
            progress.absorb(merged);
        }
        report
    }

    /// Fetch the current checkpoint list.
    pub async fn fetch_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        let list = self.remote.list_checkpoints().await?;
        debug!("[Sync] Fetched {} checkpoints", list.len());
        Ok(list)
    }
}
