//! # Territory Engine
//!
//! Offline-first GPS territory capture. A user claims ground by tracing a closed
//! path; this library turns the stream of location samples into a persisted,
//! area-valued zone, keeps zones durable while offline, reconciles them with a
//! remote document store once connectivity returns, and awards one-time XP
//! bonuses when the user passes near fixed checkpoints.
//!
//! This library provides:
//! - Spherical geometry (haversine distance, polygon area)
//! - Capture session state machine ([`GeoTracker`])
//! - Durable zone collection ([`ZoneStore`])
//! - Checkpoint proximity awards ([`ProximityDetector`])
//! - Idempotent remote reconciliation ([`SyncReconciler`])
//! - Zone replay at a fixed cadence ([`ReplayPlayer`])
//! - A single-writer [`Controller`] loop tying them together
//!
//! ## Features
//!
//! - **`persistence`** (default) - SQLite-backed key/value store
//! - **`http`** - REST client for the remote document store
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use territory_engine::{GeoTracker, LocationSample, ZoneStore, MemoryStore};
//! use std::sync::Arc;
//!
//! let mut store = ZoneStore::load(Arc::new(MemoryStore::new()));
//! let mut tracker = GeoTracker::new();
//!
//! tracker.start(0).unwrap();
//! for (i, (lat, lon)) in [(0.0, 0.0), (0.0, 0.0005), (0.0005, 0.0005), (0.0005, 0.0)]
//!     .into_iter()
//!     .enumerate()
//! {
//!     tracker.push_sample(LocationSample::new(lat, lon, i as i64 * 1000));
//! }
//!
//! let outcome = tracker.stop(&mut store, 4000).unwrap();
//! assert!(outcome.zone.is_some());
//! assert!(store.total_area() > 3000.0);
//! ```

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{OptionExt, Result, TerritoryError};

// Engine configuration
pub mod config;
pub use config::{EngineConfig, LocationAccuracy, LocationRequest};

// Distance, area and display formatting
pub mod geometry;

// Local key/value persistence
pub mod storage;
#[cfg(feature = "persistence")]
pub use storage::SqliteStore;
pub use storage::{KeyValueStore, MemoryStore};

// Durable zone collection
pub mod zone_store;
pub use zone_store::{Zone, ZoneStore};

// Capture session state machine
pub mod tracker;
pub use tracker::{CaptureOutcome, CaptureSession, GeoTracker};

// Checkpoints and user progress
pub mod checkpoints;
pub use checkpoints::{Checkpoint, CheckpointSet, NearbyCheckpoint, PartnerFilter};

pub mod progress;
pub use progress::{LocalProgress, ProgressSnapshot, UserProgress};

// Proximity awards
pub mod proximity;
pub use proximity::{AwardEvent, ProximityDetector};

// Remote document store
pub mod remote;
pub use remote::{InMemoryRemote, RemoteStore, RemoteZone};

#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "http")]
pub use http::HttpRemoteStore;

// Reconciliation with the remote store
pub mod sync;
pub use sync::{ProgressSyncReport, SyncReconciler, ZoneSyncReport};

// Zone replay
pub mod replay;
pub use replay::{ReplayFrame, ReplayPlayer};

// Location collaborator
pub mod location;
pub use location::{LocationProvider, LocationSubscription, PermissionStatus, SampleSink};

// Single-writer controller loop
pub mod controller;
pub use controller::{Controller, ControllerHandle, EngineSnapshot, Notification};

/// Initialize logging for Android hosts.
#[cfg(target_os = "android")]
pub fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("TerritoryEngine"),
    );
}

#[cfg(not(target_os = "android"))]
pub fn init_logging() {
    // Host installs its own logger on other platforms
}

// ============================================================================
// Core Types
// ============================================================================

/// A single location fix from the device.
///
/// `timestamp` is milliseconds since the Unix epoch. Older persisted zones do
/// not carry per-point timestamps; those deserialize with `timestamp = 0`.
///
/// # Example
/// ```
/// use territory_engine::LocationSample;
/// let sample = LocationSample::new(-23.5505, -46.6333, 1_700_000_000_000);
/// assert!(sample.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub timestamp: i64,
}

impl LocationSample {
    /// Create a new sample.
    pub fn new(latitude: f64, longitude: f64, timestamp: i64) -> Self {
        Self {
            latitude,
            longitude,
            timestamp,
        }
    }

    /// Check if the sample has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }

    /// Whether two samples are at the same coordinate, ignoring time.
    pub fn same_position(&self, other: &LocationSample) -> bool {
        self.latitude == other.latitude && self.longitude == other.longitude
    }
}

// ============================================================================
// Tests
// ============================================================================
