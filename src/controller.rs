//! # Controller
//!
//! Single-writer event loop owning every engine component.
//!
//! Location samples, connectivity changes, replay ticks, caller commands and
//! the results of background work all arrive as [`Event`]s on one channel and
//! are handled one at a time. Handlers never await: permission requests,
//! checkpoint fetches and sync passes run as spawned tasks that post their
//! results back as events, so sample processing is never held up by I/O.
//!
//! Sync tasks work on snapshots taken when the pass starts. A zone captured
//! while a pass is in flight is simply picked up by the next pass.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::checkpoints::{Checkpoint, CheckpointSet, NearbyCheckpoint, PartnerFilter};
use crate::location::{LocationProvider, LocationSubscription, PermissionStatus, SampleSink};
use crate::progress::LocalProgress;
use crate::proximity::{AwardEvent, ProximityDetector};
use crate::remote::RemoteStore;
use crate::replay::{ReplayFrame, ReplayPlayer};
use crate::storage::KeyValueStore;
use crate::sync::{ProgressSyncReport, SyncReconciler, ZoneSyncReport};
use crate::tracker::{CaptureOutcome, GeoTracker};
use crate::{EngineConfig, LocationSample, OptionExt, Result, TerritoryError, Zone, ZoneStore};

const NOTIFICATION_CAPACITY: usize = 256;

/// Caller requests, each answered over a oneshot channel.
pub enum Command {
    StartCapture {
        reply: oneshot::Sender<Result<u64>>,
    },
    StopCapture {
        reply: oneshot::Sender<Result<CaptureOutcome>>,
    },
    StartReplay {
        zone_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    StopReplay {
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<EngineSnapshot>,
    },
    Nearby {
        position: LocationSample,
        filter: PartnerFilter,
        reply: oneshot::Sender<Vec<NearbyCheckpoint>>,
    },
    ClearZones {
        reply: oneshot::Sender<()>,
    },
    SyncNow,
    RefreshCheckpoints,
    LocateNow,
    Shutdown,
}

/// Everything the controller reacts to.
pub enum Event {
    /// Sample from the capture subscription identified by `token`
    Sample { token: u64, sample: LocationSample },
    /// Position outside a capture (one-shot fix); checked for proximity only
    Position(LocationSample),
    Connectivity(bool),
    Command(Command),
    PermissionResolved {
        status: PermissionStatus,
        reply: oneshot::Sender<Result<u64>>,
    },
    CheckpointsLoaded(Result<Vec<Checkpoint>>),
    ZonesSynced(ZoneSyncReport),
    ProgressSynced(ProgressSyncReport),
}

/// Outbound notifications for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    CaptureStarted { token: u64 },
    /// A capture sample was accepted
    Tracked { point: LocationSample, distance_m: f64 },
    PositionUpdated(LocationSample),
    ZoneCaptured(Zone),
    CaptureDiscarded { distance_m: f64 },
    TotalAreaChanged(f64),
    CheckpointAwarded(AwardEvent),
    CheckpointsUpdated { count: usize },
    ReplayFrame(ReplayFrame),
    ReplayFinished { zone_id: String },
    ZonesSynced(ZoneSyncReport),
    ProgressSynced(ProgressSyncReport),
    ConnectivityChanged(bool),
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    pub zones: Vec<Zone>,
    pub total_area: f64,
    pub xp: u64,
    pub visited_checkpoint_ids: Vec<String>,
    pub checkpoint_count: usize,
    pub tracking: bool,
    pub capture_distance_m: f64,
    pub capture_points: usize,
    pub replaying: bool,
    pub replay_path: Vec<LocationSample>,
    pub online: bool,
}

/// The engine's event loop.
pub struct Controller<P: LocationProvider, R: RemoteStore> {
    config: EngineConfig,
    provider: Arc<P>,
    reconciler: SyncReconciler<R>,

    zones: ZoneStore,
    progress: LocalProgress,
    checkpoints: CheckpointSet,
    tracker: GeoTracker,
    detector: ProximityDetector,
    player: ReplayPlayer,

    subscription: Option<Box<dyn LocationSubscription>>,
    replay_ticker: Option<Interval>,

    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    notify: broadcast::Sender<Notification>,

    online: bool,
    start_pending: bool,
    sync_in_flight: bool,
    sync_again: bool,
}

impl<P: LocationProvider, R: RemoteStore> Controller<P, R> {
    /// Build a controller, restoring zones and progress from `storage`.
    pub fn new(
        config: EngineConfig,
        storage: Arc<dyn KeyValueStore>,
        provider: Arc<P>,
        remote: Arc<R>,
    ) -> (Self, ControllerHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notify, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        let reconciler = SyncReconciler::new(remote, config.user_id.clone())
            .with_concurrency(config.sync_concurrency);

        let controller = Self {
            zones: ZoneStore::load(Arc::clone(&storage)),
            progress: LocalProgress::load(storage),
            checkpoints: CheckpointSet::new(),
            tracker: GeoTracker::with_min_points(config.min_capture_points),
            detector: ProximityDetector::new(config.proximity_radius_m),
            player: ReplayPlayer::new(),
            subscription: None,
            replay_ticker: None,
            events_tx: events_tx.clone(),
            events_rx,
            notify: notify.clone(),
            online: false,
            start_pending: false,
            sync_in_flight: false,
            sync_again: false,
            provider,
            reconciler,
            config,
        };

        let handle = ControllerHandle {
            tx: events_tx,
            notify,
        };
        (controller, handle)
    }

    /// Run the loop on a new tokio task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Process events until shutdown.
    pub async fn run(mut self) {
        info!(
            "[Controller] Running ({} zones, {:.0} m² total)",
            self.zones.len(),
            self.zones.total_area()
        );
        self.refresh_checkpoints();

        loop {
            let event = tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = next_tick(&mut self.replay_ticker) => {
                    self.on_replay_tick();
                    continue;
                }
            };

            if let Event::Command(Command::Shutdown) = event {
                break;
            }
            self.handle_event(event);
        }

        self.remove_subscription();
        self.player.stop();
        info!("[Controller] Stopped");
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Sample { token, sample } => self.on_sample(token, sample),
            Event::Position(sample) => {
                self.emit(Notification::PositionUpdated(sample));
                self.check_proximity(&sample);
            }
            Event::Connectivity(connected) => self.on_connectivity(connected),
            Event::Command(command) => self.on_command(command),
            Event::PermissionResolved { status, reply } => {
                let _ = reply.send(self.begin_capture(status));
            }
            Event::CheckpointsLoaded(result) => match result {
                Ok(list) => {
                    self.checkpoints.replace(list);
                    info!("[Controller] Loaded {} checkpoints", self.checkpoints.len());
                    self.emit(Notification::CheckpointsUpdated {
                        count: self.checkpoints.len(),
                    });
                }
                Err(e) => warn!(
                    "[Controller] Checkpoint refresh failed, keeping {}: {}",
                    self.checkpoints.len(),
                    e
                ),
            },
            Event::ZonesSynced(report) => {
                self.zones.mark_synced(&report.synced_ids);
                self.emit(Notification::ZonesSynced(report));
            }
            Event::ProgressSynced(report) => {
                if let ProgressSyncReport::Merged(merged) = &report {
                    self.progress.absorb(merged);
                }
                self.emit(Notification::ProgressSynced(report));
                self.sync_in_flight = false;
                if self.sync_again {
                    self.sync_again = false;
                    self.start_sync_pass();
                }
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::StartCapture { reply } => self.request_capture(reply),
            Command::StopCapture { reply } => {
                let _ = reply.send(self.stop_capture());
            }
            Command::StartReplay { zone_id, reply } => {
                let _ = reply.send(self.start_replay(&zone_id));
            }
            Command::StopReplay { reply } => {
                self.replay_ticker = None;
                self.player.stop();
                let _ = reply.send(());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Nearby {
                position,
                filter,
                reply,
            } => {
                let _ = reply.send(self.checkpoints.nearby(&position, filter));
            }
            Command::ClearZones { reply } => {
                self.zones.clear();
                self.emit(Notification::TotalAreaChanged(self.zones.total_area()));
                let _ = reply.send(());
            }
            Command::SyncNow => self.start_sync_pass(),
            Command::RefreshCheckpoints => self.refresh_checkpoints(),
            Command::LocateNow => self.locate_now(),
            Command::Shutdown => {}
        }
    }

    // ========================================================================
    // Capture
    // ========================================================================

    fn request_capture(&mut self, reply: oneshot::Sender<Result<u64>>) {
        if self.tracker.is_tracking() || self.start_pending {
            let _ = reply.send(Err(TerritoryError::InvalidState {
                operation: "start capture",
                state: "tracking",
            }));
            return;
        }

        self.start_pending = true;
        let provider = Arc::clone(&self.provider);
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let status = provider.request_permission().await;
            let _ = tx.send(Event::PermissionResolved { status, reply });
        });
    }

    fn begin_capture(&mut self, status: PermissionStatus) -> Result<u64> {
        self.start_pending = false;
        if status != PermissionStatus::Granted {
            warn!("[Controller] Location permission denied");
            return Err(TerritoryError::PermissionDenied);
        }

        let token = self.tracker.start(now_ms())?;
        let sink = SampleSink::new(token, self.events_tx.clone());
        match self.provider.watch_position(&self.config.location, sink) {
            Ok(subscription) => {
                self.subscription = Some(subscription);
                self.emit(Notification::CaptureStarted { token });
                Ok(token)
            }
            Err(e) => {
                self.tracker.cancel();
                Err(e)
            }
        }
    }

    fn stop_capture(&mut self) -> Result<CaptureOutcome> {
        if !self.tracker.is_tracking() {
            return Err(TerritoryError::InvalidState {
                operation: "stop capture",
                state: "idle",
            });
        }

        // Unsubscribe before the session ends so no sample can follow it
        self.remove_subscription();
        let outcome = self.tracker.stop(&mut self.zones, now_ms())?;

        match &outcome.zone {
            Some(zone) => {
                self.emit(Notification::ZoneCaptured(zone.clone()));
                self.emit(Notification::TotalAreaChanged(outcome.total_area));
            }
            None => self.emit(Notification::CaptureDiscarded {
                distance_m: outcome.distance_m,
            }),
        }
        Ok(outcome)
    }

    fn on_sample(&mut self, token: u64, sample: LocationSample) {
        if self.tracker.active_token() != Some(token) {
            debug!("[Controller] Dropping sample for stale session {}", token);
            return;
        }

        if let Some(distance_m) = self.tracker.push_sample(sample) {
            self.emit(Notification::Tracked {
                point: sample,
                distance_m,
            });
            self.check_proximity(&sample);
        }
    }

    fn remove_subscription(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.remove();
            debug!("[Controller] Location subscription removed");
        }
    }

    fn locate_now(&self) {
        let provider = Arc::clone(&self.provider);
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            match provider.current_position().await {
                Ok(sample) => {
                    let _ = tx.send(Event::Position(sample));
                }
                Err(e) => warn!("[Controller] Current position unavailable: {}", e),
            }
        });
    }

    // ========================================================================
    // Checkpoints
    // ========================================================================

    fn check_proximity(&mut self, position: &LocationSample) {
        let award = self
            .detector
            .evaluate(position, &self.checkpoints, &mut self.progress);

        if let Some(award) = award {
            self.emit(Notification::CheckpointAwarded(award));
            if self.online {
                self.start_sync_pass();
            }
        }
    }

    fn refresh_checkpoints(&self) {
        let reconciler = self.reconciler.clone();
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = reconciler.fetch_checkpoints().await;
            let _ = tx.send(Event::CheckpointsLoaded(result));
        });
    }

    // ========================================================================
    // Sync
    // ========================================================================

    fn on_connectivity(&mut self, connected: bool) {
        let regained = connected && !self.online;
        self.online = connected;
        self.emit(Notification::ConnectivityChanged(connected));

        if regained {
            info!("[Controller] Connectivity regained");
            self.start_sync_pass();
            self.refresh_checkpoints();
        }
    }

    fn start_sync_pass(&mut self) {
        if self.sync_in_flight {
            self.sync_again = true;
            return;
        }
        self.sync_in_flight = true;

        let zones = self.zones.unsynced();
        let progress = self.progress.snapshot(self.zones.total_area());
        let reconciler = self.reconciler.clone();
        let tx = self.events_tx.clone();

        tokio::spawn(async move {
            let zone_report = reconciler.push_zones(zones).await;
            let _ = tx.send(Event::ZonesSynced(zone_report));
            let progress_report = reconciler.push_progress(progress).await;
            let _ = tx.send(Event::ProgressSynced(progress_report));
        });
    }

    // ========================================================================
    // Replay
    // ========================================================================

    fn start_replay(&mut self, zone_id: &str) -> Result<()> {
        let zone = self
            .zones
            .get(zone_id)
            .ok_or_invalid_state("start replay", "zone not found")?;
        self.player.start(zone)?;

        let period = Duration::from_millis(self.config.replay_interval_ms);
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.replay_ticker = Some(ticker);
        Ok(())
    }

    fn on_replay_tick(&mut self) {
        let Some(frame) = self.player.tick() else {
            self.replay_ticker = None;
            return;
        };

        let finished = frame.is_last;
        let zone_id = frame.zone_id.clone();
        self.emit(Notification::ReplayFrame(frame));
        if finished {
            self.replay_ticker = None;
            self.emit(Notification::ReplayFinished { zone_id });
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn snapshot(&self) -> EngineSnapshot {
        let session = self.tracker.session();
        EngineSnapshot {
            zones: self.zones.zones().to_vec(),
            total_area: self.zones.total_area(),
            xp: self.progress.xp(),
            visited_checkpoint_ids: self.progress.visited().iter().cloned().collect(),
            checkpoint_count: self.checkpoints.len(),
            tracking: session.is_some(),
            capture_distance_m: session.map(|s| s.distance_m).unwrap_or(0.0),
            capture_points: session.map(|s| s.points.len()).unwrap_or(0),
            replaying: self.player.is_playing(),
            replay_path: self.player.emitted().to_vec(),
            online: self.online,
        }
    }

    fn emit(&self, notification: Notification) {
        // No receivers is fine; the UI may not be listening yet
        let _ = self.notify.send(notification);
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable handle for talking to a running [`Controller`].
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::UnboundedSender<Event>,
    notify: broadcast::Sender<Notification>,
}

impl ControllerHandle {
    /// Receive notifications emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notify.subscribe()
    }

    /// Request permission and start a capture. Fails with
    /// [`TerritoryError::PermissionDenied`] if location is unavailable.
    pub async fn start_capture(&self) -> Result<u64> {
        self.request(|reply| Command::StartCapture { reply }).await?
    }

    /// Stop the capture; the zone (if any) is stored before this returns.
    pub async fn stop_capture(&self) -> Result<CaptureOutcome> {
        self.request(|reply| Command::StopCapture { reply }).await?
    }

    pub async fn start_replay(&self, zone_id: &str) -> Result<()> {
        let zone_id = zone_id.to_string();
        self.request(|reply| Command::StartReplay { zone_id, reply })
            .await?
    }

    pub async fn stop_replay(&self) -> Result<()> {
        self.request(|reply| Command::StopReplay { reply }).await
    }

    pub async fn snapshot(&self) -> Result<EngineSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Checkpoints matching `filter`, nearest to `position` first.
    pub async fn nearby_checkpoints(
        &self,
        position: LocationSample,
        filter: PartnerFilter,
    ) -> Result<Vec<NearbyCheckpoint>> {
        self.request(|reply| Command::Nearby {
            position,
            filter,
            reply,
        })
        .await
    }

    /// Delete every stored zone.
    pub async fn clear_zones(&self) -> Result<()> {
        self.request(|reply| Command::ClearZones { reply }).await
    }

    /// Report a connectivity change from the platform.
    pub fn connectivity_changed(&self, connected: bool) -> Result<()> {
        self.send(Event::Connectivity(connected))
    }

    /// Feed a position outside a capture (checked for checkpoints only).
    pub fn update_position(&self, sample: LocationSample) -> Result<()> {
        self.send(Event::Position(sample))
    }

    /// Trigger a sync pass now.
    pub fn sync_now(&self) -> Result<()> {
        self.send(Event::Command(Command::SyncNow))
    }

    pub fn refresh_checkpoints(&self) -> Result<()> {
        self.send(Event::Command(Command::RefreshCheckpoints))
    }

    /// Ask the provider for a one-shot fix and check it for checkpoints.
    pub fn locate_now(&self) -> Result<()> {
        self.send(Event::Command(Command::LocateNow))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(Event::Command(Command::Shutdown))
    }

    fn send(&self, event: Event) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| TerritoryError::ControllerClosed)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Command(make(reply)))?;
        rx.await.map_err(|_| TerritoryError::ControllerClosed)
    }
}
