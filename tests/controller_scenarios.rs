//! End-to-end scenarios driving the controller with in-memory collaborators.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

use territory_engine::{
    Checkpoint, Controller, ControllerHandle, EngineConfig, InMemoryRemote, KeyValueStore,
    LocationProvider, LocationRequest, LocationSample, LocationSubscription, MemoryStore,
    Notification, PartnerFilter, PermissionStatus, ProgressSyncReport, RemoteStore, RemoteZone,
    Result, SampleSink, TerritoryError, UserProgress,
};

// ============================================================================
// Test doubles
// ============================================================================

struct ManualProvider {
    permission: PermissionStatus,
    fix: LocationSample,
    sink: Mutex<Option<SampleSink>>,
    removed: Arc<AtomicUsize>,
}

impl ManualProvider {
    fn granted() -> Self {
        Self::with_permission(PermissionStatus::Granted)
    }

    fn with_permission(permission: PermissionStatus) -> Self {
        Self {
            permission,
            fix: LocationSample::new(0.0, 0.0, 0),
            sink: Mutex::new(None),
            removed: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn sink(&self) -> SampleSink {
        self.sink
            .lock()
            .unwrap()
            .clone()
            .expect("no active subscription")
    }

    fn removed(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }
}

struct ManualSubscription {
    removed: Arc<AtomicUsize>,
}

impl LocationSubscription for ManualSubscription {
    fn remove(&mut self) {
        self.removed.fetch_add(1, Ordering::SeqCst);
    }
}

impl LocationProvider for ManualProvider {
    async fn request_permission(&self) -> PermissionStatus {
        self.permission
    }

    async fn current_position(&self) -> Result<LocationSample> {
        Ok(self.fix)
    }

    fn watch_position(
        &self,
        _request: &LocationRequest,
        sink: SampleSink,
    ) -> Result<Box<dyn LocationSubscription>> {
        *self.sink.lock().unwrap() = Some(sink);
        Ok(Box::new(ManualSubscription {
            removed: Arc::clone(&self.removed),
        }))
    }
}

/// Remote whose `create_zone` blocks until [`GatedRemote::release`].
struct GatedRemote {
    inner: InMemoryRemote,
    gate: Semaphore,
    parked: Notify,
}

impl GatedRemote {
    fn new() -> Self {
        Self {
            inner: InMemoryRemote::new(),
            gate: Semaphore::new(0),
            parked: Notify::new(),
        }
    }

    /// Let parked and future creates through.
    fn release(&self) {
        self.gate.close();
    }
}

impl RemoteStore for GatedRemote {
    async fn create_zone(&self, zone: &RemoteZone) -> Result<()> {
        self.parked.notify_one();
        // Closed semaphore: acquire returns immediately
        let _ = self.gate.acquire().await;
        self.inner.create_zone(zone).await
    }

    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        self.inner.list_checkpoints().await
    }

    async fn read_progress(&self, user_id: &str) -> Result<Option<UserProgress>> {
        self.inner.read_progress(user_id).await
    }

    async fn merge_progress(&self, user_id: &str, progress: &UserProgress) -> Result<()> {
        self.inner.merge_progress(user_id, progress).await
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness<R = InMemoryRemote> {
    handle: ControllerHandle,
    provider: Arc<ManualProvider>,
    remote: Arc<R>,
    notifications: broadcast::Receiver<Notification>,
    task: JoinHandle<()>,
}

fn launch<R: RemoteStore>(
    config: EngineConfig,
    storage: Arc<dyn KeyValueStore>,
    provider: ManualProvider,
    remote: Arc<R>,
) -> Harness<R> {
    let _ = env_logger::builder().is_test(true).try_init();

    let provider = Arc::new(provider);
    let (controller, handle) =
        Controller::new(config, storage, Arc::clone(&provider), Arc::clone(&remote));
    let notifications = handle.subscribe();
    let task = controller.spawn();

    Harness {
        handle,
        provider,
        remote,
        notifications,
        task,
    }
}

fn default_harness() -> Harness {
    launch(
        EngineConfig::default(),
        Arc::new(MemoryStore::new()),
        ManualProvider::granted(),
        Arc::new(InMemoryRemote::new()),
    )
}

fn signed_in() -> EngineConfig {
    EngineConfig {
        user_id: Some("runner".to_string()),
        ..Default::default()
    }
}

async fn wait_for(
    rx: &mut broadcast::Receiver<Notification>,
    mut matches: impl FnMut(&Notification) -> bool,
) -> Notification {
    timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(n) if matches(&n) => return n,
                Ok(_) => continue,
                Err(e) => panic!("notification stream failed: {}", e),
            }
        }
    })
    .await
    .expect("timed out waiting for notification")
}

/// ~55 m square starting at the origin.
fn square() -> Vec<LocationSample> {
    vec![
        LocationSample::new(0.0, 0.0, 1_000),
        LocationSample::new(0.0, 0.0005, 2_000),
        LocationSample::new(0.0005, 0.0005, 3_000),
        LocationSample::new(0.0005, 0.0, 4_000),
    ]
}

async fn capture_square<R>(h: &Harness<R>) -> territory_engine::Zone {
    h.handle.start_capture().await.unwrap();
    let sink = h.provider.sink();
    for sample in square() {
        assert!(sink.deliver(sample));
    }
    h.handle
        .stop_capture()
        .await
        .unwrap()
        .zone
        .expect("square encloses a zone")
}

fn checkpoint(id: &str, lat: f64, lng: f64, bonus_xp: u32) -> Checkpoint {
    Checkpoint {
        id: id.to_string(),
        latitude: lat,
        longitude: lng,
        bonus_xp,
        name: format!("Checkpoint {}", id),
        partner_id: None,
    }
}

// ============================================================================
// Capture
// ============================================================================

#[tokio::test]
async fn test_square_capture_stores_zone() {
    let mut h = default_harness();

    let zone = capture_square(&h).await;
    assert_eq!(zone.coords.len(), 5);
    assert!(zone.coords[0].same_position(&zone.coords[4]));
    assert!((zone.area - 3091.0).abs() / 3091.0 < 0.10);
    assert!(!zone.synced);

    let captured = wait_for(&mut h.notifications, |n| {
        matches!(n, Notification::ZoneCaptured(_))
    })
    .await;
    assert_eq!(captured, Notification::ZoneCaptured(zone.clone()));

    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.zones.len(), 1);
    assert_eq!(snapshot.total_area, zone.area);
    assert!(!snapshot.tracking);
    assert_eq!(h.provider.removed(), 1);
}

#[tokio::test]
async fn test_short_capture_is_discarded() {
    let mut h = default_harness();
    h.handle.start_capture().await.unwrap();
    let sink = h.provider.sink();
    sink.deliver(square()[0]);
    sink.deliver(square()[1]);

    let outcome = h.handle.stop_capture().await.unwrap();
    assert!(outcome.zone.is_none());
    wait_for(&mut h.notifications, |n| {
        matches!(n, Notification::CaptureDiscarded { .. })
    })
    .await;

    let snapshot = h.handle.snapshot().await.unwrap();
    assert!(snapshot.zones.is_empty());
    assert_eq!(snapshot.total_area, 0.0);
}

#[tokio::test]
async fn test_permission_denied_stays_idle() {
    let h = launch(
        EngineConfig::default(),
        Arc::new(MemoryStore::new()),
        ManualProvider::with_permission(PermissionStatus::Denied),
        Arc::new(InMemoryRemote::new()),
    );

    let result = h.handle.start_capture().await;
    assert!(matches!(result, Err(TerritoryError::PermissionDenied)));

    let snapshot = h.handle.snapshot().await.unwrap();
    assert!(!snapshot.tracking);
    assert!(h.provider.sink.lock().unwrap().is_none());
}

#[tokio::test]
async fn test_start_while_tracking_rejected() {
    let h = default_harness();
    h.handle.start_capture().await.unwrap();
    let second = h.handle.start_capture().await;
    assert!(matches!(second, Err(TerritoryError::InvalidState { .. })));

    // Stop without a capture running is also rejected
    h.handle.stop_capture().await.unwrap();
    assert!(h.handle.stop_capture().await.is_err());
}

#[tokio::test]
async fn test_samples_after_stop_are_ignored() {
    let h = default_harness();
    h.handle.start_capture().await.unwrap();
    let stale = h.provider.sink();
    h.handle.stop_capture().await.unwrap();

    // Late delivery from the old subscription
    stale.deliver(LocationSample::new(0.001, 0.001, 9_000));
    let snapshot = h.handle.snapshot().await.unwrap();
    assert!(!snapshot.tracking);
    assert_eq!(snapshot.capture_points, 0);

    // ...and it cannot leak into the next session either
    h.handle.start_capture().await.unwrap();
    stale.deliver(LocationSample::new(0.001, 0.001, 9_500));
    let snapshot = h.handle.snapshot().await.unwrap();
    assert!(snapshot.tracking);
    assert_eq!(snapshot.capture_points, 0);

    h.provider.sink().deliver(LocationSample::new(0.0, 0.0, 10_000));
    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.capture_points, 1);
}

// ============================================================================
// Checkpoints
// ============================================================================

#[tokio::test]
async fn test_checkpoint_awards_once() {
    let remote = Arc::new(InMemoryRemote::new());
    // ~15.7 m from the origin
    remote.set_checkpoints(vec![checkpoint("cp-1", 0.0001, 0.0001, 50)]);
    let mut h = launch(
        EngineConfig::default(),
        Arc::new(MemoryStore::new()),
        ManualProvider::granted(),
        remote,
    );
    wait_for(&mut h.notifications, |n| {
        matches!(n, Notification::CheckpointsUpdated { count: 1 })
    })
    .await;

    h.handle.start_capture().await.unwrap();
    let sink = h.provider.sink();
    sink.deliver(LocationSample::new(0.0, 0.0, 1_000));
    sink.deliver(LocationSample::new(0.0, 0.00001, 2_000));
    sink.deliver(LocationSample::new(0.0, 0.00002, 3_000));

    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.xp, 50);
    assert_eq!(snapshot.visited_checkpoint_ids, vec!["cp-1".to_string()]);

    let mut awards = 0;
    while let Ok(n) = h.notifications.try_recv() {
        if let Notification::CheckpointAwarded(award) = n {
            assert_eq!(award.checkpoint_id, "cp-1");
            assert_eq!(award.total_xp, 50);
            awards += 1;
        }
    }
    assert_eq!(awards, 1);
}

#[tokio::test]
async fn test_two_checkpoints_in_range_award_on_consecutive_samples() {
    let remote = Arc::new(InMemoryRemote::new());
    remote.set_checkpoints(vec![
        checkpoint("a", 0.0001, 0.0, 10),
        checkpoint("b", 0.0, 0.0001, 20),
    ]);
    let mut h = launch(
        EngineConfig::default(),
        Arc::new(MemoryStore::new()),
        ManualProvider::granted(),
        remote,
    );
    wait_for(&mut h.notifications, |n| {
        matches!(n, Notification::CheckpointsUpdated { count: 2 })
    })
    .await;

    h.handle
        .update_position(LocationSample::new(0.0, 0.0, 0))
        .unwrap();
    assert_eq!(h.handle.snapshot().await.unwrap().xp, 10);

    h.handle
        .update_position(LocationSample::new(0.0, 0.0, 1))
        .unwrap();
    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.xp, 30);
    assert_eq!(snapshot.visited_checkpoint_ids.len(), 2);
}

#[tokio::test]
async fn test_locate_now_checks_proximity() {
    let remote = Arc::new(InMemoryRemote::new());
    remote.set_checkpoints(vec![checkpoint("home", 0.0, 0.0002, 5)]);
    let mut h = launch(
        EngineConfig::default(),
        Arc::new(MemoryStore::new()),
        ManualProvider::granted(),
        remote,
    );
    wait_for(&mut h.notifications, |n| {
        matches!(n, Notification::CheckpointsUpdated { .. })
    })
    .await;

    h.handle.locate_now().unwrap();
    let award = wait_for(&mut h.notifications, |n| {
        matches!(n, Notification::CheckpointAwarded(_))
    })
    .await;
    match award {
        Notification::CheckpointAwarded(event) => assert_eq!(event.bonus_xp, 5),
        other => panic!("unexpected notification {:?}", other),
    }
}

#[tokio::test]
async fn test_nearby_checkpoints_sorted() {
    let remote = Arc::new(InMemoryRemote::new());
    let mut partner = checkpoint("partner", 0.01, 0.0, 30);
    partner.partner_id = Some("cafe".to_string());
    remote.set_checkpoints(vec![
        checkpoint("far", 0.02, 0.0, 10),
        partner,
        checkpoint("near", 0.001, 0.0, 10),
    ]);
    let mut h = launch(
        EngineConfig::default(),
        Arc::new(MemoryStore::new()),
        ManualProvider::granted(),
        remote,
    );
    wait_for(&mut h.notifications, |n| {
        matches!(n, Notification::CheckpointsUpdated { count: 3 })
    })
    .await;

    let origin = LocationSample::new(0.0, 0.0, 0);
    let all = h
        .handle
        .nearby_checkpoints(origin, PartnerFilter::All)
        .await
        .unwrap();
    let ids: Vec<&str> = all.iter().map(|n| n.checkpoint.id.as_str()).collect();
    assert_eq!(ids, vec!["near", "partner", "far"]);

    let partners = h
        .handle
        .nearby_checkpoints(origin, PartnerFilter::Partner)
        .await
        .unwrap();
    assert_eq!(partners.len(), 1);
    assert_eq!(partners[0].checkpoint.id, "partner");
}

// ============================================================================
// Sync
// ============================================================================

#[tokio::test]
async fn test_offline_capture_syncs_on_reconnect() {
    let remote = Arc::new(InMemoryRemote::new());
    remote.set_offline(true);
    let mut h = launch(
        signed_in(),
        Arc::new(MemoryStore::new()),
        ManualProvider::granted(),
        remote,
    );

    let zone = capture_square(&h).await;
    assert!(h.remote.zones().is_empty());

    h.remote.set_offline(false);
    h.handle.connectivity_changed(true).unwrap();
    let report = wait_for(&mut h.notifications, |n| {
        matches!(n, Notification::ProgressSynced(_))
    })
    .await;
    assert!(matches!(
        report,
        Notification::ProgressSynced(ProgressSyncReport::Merged(_))
    ));

    let snapshot = h.handle.snapshot().await.unwrap();
    assert!(snapshot.zones.iter().all(|z| z.synced));
    let remote_zones = h.remote.zones();
    assert_eq!(remote_zones.len(), 1);
    assert_eq!(remote_zones[0].zone_id, zone.id);
    assert_eq!(remote_zones[0].user_id, "runner");

    let progress = h.remote.progress("runner").unwrap();
    assert_eq!(progress.total_area, zone.area);
}

#[tokio::test]
async fn test_failed_sync_keeps_zone_unsynced() {
    let mut h = launch(
        signed_in(),
        Arc::new(MemoryStore::new()),
        ManualProvider::granted(),
        Arc::new(InMemoryRemote::new()),
    );
    let zone = capture_square(&h).await;
    h.remote.fail_zone(&zone.id, true);

    h.handle.connectivity_changed(true).unwrap();
    let report = wait_for(&mut h.notifications, |n| {
        matches!(n, Notification::ZonesSynced(_))
    })
    .await;
    match report {
        Notification::ZonesSynced(report) => assert_eq!(report.failed.len(), 1),
        other => panic!("unexpected notification {:?}", other),
    }
    wait_for(&mut h.notifications, |n| {
        matches!(n, Notification::ProgressSynced(_))
    })
    .await;
    assert!(!h.handle.snapshot().await.unwrap().zones[0].synced);

    // Next trigger picks it up
    h.remote.fail_zone(&zone.id, false);
    h.handle.sync_now().unwrap();
    wait_for(&mut h.notifications, |n| {
        matches!(n, Notification::ProgressSynced(_))
    })
    .await;
    assert!(h.handle.snapshot().await.unwrap().zones[0].synced);
}

#[tokio::test]
async fn test_repeated_connectivity_does_not_resync() {
    let mut h = launch(
        signed_in(),
        Arc::new(MemoryStore::new()),
        ManualProvider::granted(),
        Arc::new(InMemoryRemote::new()),
    );
    capture_square(&h).await;

    h.handle.connectivity_changed(true).unwrap();
    wait_for(&mut h.notifications, |n| {
        matches!(n, Notification::ProgressSynced(_))
    })
    .await;

    // Already online: no transition, no pass
    h.handle.connectivity_changed(true).unwrap();
    h.handle.snapshot().await.unwrap();
    assert_eq!(h.remote.create_calls(), 1);
    assert_eq!(h.remote.progress_writes(), 1);
}

#[tokio::test]
async fn test_sync_requests_during_pass_collapse_into_one_follow_up() {
    let mut h = launch(
        signed_in(),
        Arc::new(MemoryStore::new()),
        ManualProvider::granted(),
        Arc::new(GatedRemote::new()),
    );
    let first = capture_square(&h).await;

    h.handle.connectivity_changed(true).unwrap();
    timeout(Duration::from_secs(5), h.remote.parked.notified())
        .await
        .expect("first pass never reached create_zone");

    // Captured while the first pass is still pushing
    let second = capture_square(&h).await;
    h.handle.sync_now().unwrap();
    h.handle.sync_now().unwrap();
    h.handle.snapshot().await.unwrap();
    h.remote.release();

    for _ in 0..2 {
        wait_for(&mut h.notifications, |n| {
            matches!(n, Notification::ProgressSynced(_))
        })
        .await;
    }
    let third = timeout(
        Duration::from_millis(200),
        wait_for(&mut h.notifications, |n| {
            matches!(n, Notification::ProgressSynced(_))
        }),
    )
    .await;
    assert!(third.is_err(), "expected exactly one follow-up pass");

    assert_eq!(h.remote.inner.create_calls(), 2);
    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.zones.len(), 2);
    assert!(snapshot.zones.iter().all(|z| z.synced));

    let mut remote_ids: Vec<String> = h
        .remote
        .inner
        .zones()
        .into_iter()
        .map(|z| z.zone_id)
        .collect();
    remote_ids.sort();
    let mut local_ids = vec![first.id.clone(), second.id.clone()];
    local_ids.sort();
    assert_eq!(remote_ids, local_ids);

    let progress = h.remote.inner.progress("runner").unwrap();
    assert!((progress.total_area - (first.area + second.area)).abs() < 1e-6);
}

// ============================================================================
// Replay
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_replay_emits_every_point_at_cadence() {
    let mut h = default_harness();
    let zone = capture_square(&h).await;

    let started = Instant::now();
    h.handle.start_replay(&zone.id).await.unwrap();

    let mut frames = Vec::new();
    loop {
        match wait_for(&mut h.notifications, |n| {
            matches!(
                n,
                Notification::ReplayFrame(_) | Notification::ReplayFinished { .. }
            )
        })
        .await
        {
            Notification::ReplayFrame(frame) => frames.push(frame),
            Notification::ReplayFinished { zone_id } => {
                assert_eq!(zone_id, zone.id);
                break;
            }
            _ => unreachable!(),
        }
    }

    let elapsed = started.elapsed();
    assert_eq!(frames.len(), zone.coords.len());
    assert!(frames.last().unwrap().is_last);
    assert!(elapsed >= Duration::from_millis(250 * zone.coords.len() as u64));
    assert!(elapsed < Duration::from_millis(250 * (zone.coords.len() as u64 + 1)));

    let snapshot = h.handle.snapshot().await.unwrap();
    assert!(!snapshot.replaying);
    assert_eq!(snapshot.replay_path, zone.coords);
}

#[tokio::test(start_paused = true)]
async fn test_stop_replay_halts_frames() {
    let mut h = default_harness();
    let zone = capture_square(&h).await;

    h.handle.start_replay(&zone.id).await.unwrap();
    wait_for(&mut h.notifications, |n| {
        matches!(n, Notification::ReplayFrame(_))
    })
    .await;
    h.handle.stop_replay().await.unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    let snapshot = h.handle.snapshot().await.unwrap();
    assert!(!snapshot.replaying);
    assert!(snapshot.replay_path.is_empty());
    while let Ok(n) = h.notifications.try_recv() {
        assert!(!matches!(n, Notification::ReplayFrame(_)));
    }
}

#[tokio::test]
async fn test_replay_unknown_zone_fails() {
    let h = default_harness();
    assert!(matches!(
        h.handle.start_replay("missing").await,
        Err(TerritoryError::InvalidState {
            state: "zone not found",
            ..
        })
    ));
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_clear_zones_resets_total() {
    let h = default_harness();
    capture_square(&h).await;
    h.handle.clear_zones().await.unwrap();
    let snapshot = h.handle.snapshot().await.unwrap();
    assert!(snapshot.zones.is_empty());
    assert_eq!(snapshot.total_area, 0.0);
}

#[tokio::test]
async fn test_shutdown_closes_handle() {
    let h = default_harness();
    h.handle.shutdown().unwrap();
    h.task.await.unwrap();
    assert!(matches!(
        h.handle.snapshot().await,
        Err(TerritoryError::ControllerClosed)
    ));
}

#[tokio::test]
async fn test_zones_and_awards_survive_restart() {
    let storage: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let remote = Arc::new(InMemoryRemote::new());
    remote.set_checkpoints(vec![checkpoint("cp", 0.0, 0.0, 25)]);

    let mut first = launch(
        EngineConfig::default(),
        Arc::clone(&storage),
        ManualProvider::granted(),
        Arc::clone(&remote),
    );
    wait_for(&mut first.notifications, |n| {
        matches!(n, Notification::CheckpointsUpdated { .. })
    })
    .await;
    let zone = capture_square(&first).await;
    first.handle.shutdown().unwrap();
    first.task.await.unwrap();

    let mut second = launch(
        EngineConfig::default(),
        storage,
        ManualProvider::granted(),
        remote,
    );
    wait_for(&mut second.notifications, |n| {
        matches!(n, Notification::CheckpointsUpdated { .. })
    })
    .await;
    // Standing on the checkpoint again does not re-award
    second
        .handle
        .update_position(LocationSample::new(0.0, 0.0, 0))
        .unwrap();

    let snapshot = second.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.zones, vec![zone]);
    assert_eq!(snapshot.xp, 25);
}
