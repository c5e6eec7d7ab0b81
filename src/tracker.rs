//! # Geo Tracker
//!
//! Owns the active capture session. Samples are accumulated into a polyline
//! with a running distance; stopping closes the ring and hands the resulting
//! zone to the [`ZoneStore`].
//!
//! The tracker itself does not talk to the location provider. The controller
//! subscribes and unsubscribes, and feeds samples through [`GeoTracker::push_sample`].

use chrono::{TimeZone, Utc};
use log::{debug, info};

use crate::geometry::{close_ring, distinct_vertex_count, haversine_distance};
use crate::{LocationSample, OptionExt, Result, TerritoryError, Zone, ZoneStore};

/// State of one capture run.
#[derive(Debug, Clone)]
pub struct CaptureSession {
    /// Identifies the location subscription feeding this session
    pub token: u64,
    /// Unix millis at `start()`
    pub started_at_ms: i64,
    pub points: Vec<LocationSample>,
    /// Accumulated path length in meters
    pub distance_m: f64,
}

impl CaptureSession {
    /// Seconds elapsed since the session started.
    pub fn elapsed_secs(&self, now_ms: i64) -> u64 {
        ((now_ms - self.started_at_ms).max(0) / 1000) as u64
    }
}

/// Result of stopping a capture.
#[derive(Debug, Clone)]
pub struct CaptureOutcome {
    /// The stored zone, or `None` if the run was too short to enclose anything
    pub zone: Option<Zone>,
    pub distance_m: f64,
    pub elapsed_secs: u64,
    /// Store total after this capture
    pub total_area: f64,
}

/// Capture state machine: `Idle` ⇄ `Tracking`.
#[derive(Debug)]
pub struct GeoTracker {
    session: Option<CaptureSession>,
    min_points: usize,
    next_token: u64,
}

impl GeoTracker {
    pub fn new() -> Self {
        Self::with_min_points(3)
    }

    /// Tracker that needs `min_points` distinct samples to produce a zone.
    pub fn with_min_points(min_points: usize) -> Self {
        Self {
            session: None,
            min_points: min_points.max(3),
            next_token: 1,
        }
    }

    pub fn is_tracking(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&CaptureSession> {
        self.session.as_ref()
    }

    /// Token of the running session, if any.
    pub fn active_token(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.token)
    }

    /// Begin a new capture. Only valid while idle.
    pub fn start(&mut self, now_ms: i64) -> Result<u64> {
        if self.session.is_some() {
            return Err(TerritoryError::InvalidState {
                operation: "start capture",
                state: "tracking",
            });
        }

        let token = self.next_token;
        self.next_token += 1;
        self.session = Some(CaptureSession {
            token,
            started_at_ms: now_ms,
            points: Vec::new(),
            distance_m: 0.0,
        });
        info!("[GeoTracker] Capture {} started", token);
        Ok(token)
    }

    /// Append a sample to the running session.
    ///
    /// Returns the accumulated distance, or `None` if no session is running
    /// or the sample has invalid coordinates.
    pub fn push_sample(&mut self, sample: LocationSample) -> Option<f64> {
        let session = self.session.as_mut()?;
        if !sample.is_valid() {
            debug!("[GeoTracker] Ignoring invalid sample {:?}", sample);
            return None;
        }

        if let Some(last) = session.points.last() {
            session.distance_m += haversine_distance(last, &sample);
        }
        session.points.push(sample);
        Some(session.distance_m)
    }

    /// Drop the running session without producing a zone.
    pub fn cancel(&mut self) {
        if let Some(session) = self.session.take() {
            info!("[GeoTracker] Capture {} cancelled", session.token);
        }
    }

    /// Finish the capture.
    ///
    /// Fewer than the minimum distinct samples discards the run silently.
    /// Otherwise the ring is closed, its area computed, and the zone appended
    /// to (and persisted by) `store`.
    pub fn stop(&mut self, store: &mut ZoneStore, now_ms: i64) -> Result<CaptureOutcome> {
        let session = self
            .session
            .take()
            .ok_or_invalid_state("stop capture", "idle")?;
        let elapsed_secs = session.elapsed_secs(now_ms);

        if distinct_vertex_count(&session.points) < self.min_points {
            info!(
                "[GeoTracker] Capture {} discarded ({} points)",
                session.token,
                session.points.len()
            );
            return Ok(CaptureOutcome {
                zone: None,
                distance_m: session.distance_m,
                elapsed_secs,
                total_area: store.total_area(),
            });
        }

        let created_at = Utc
            .timestamp_millis_opt(now_ms)
            .single()
            .unwrap_or_else(Utc::now);
        let mut zone = Zone::new(close_ring(&session.points), created_at);
        zone.id = store.append(zone.clone());

        info!(
            "[GeoTracker] Capture {} stored as zone {} ({:.0} m², {:.0} m walked)",
            session.token, zone.id, zone.area, session.distance_m
        );

        Ok(CaptureOutcome {
            zone: Some(zone),
            distance_m: session.distance_m,
            elapsed_secs,
            total_area: store.total_area(),
        })
    }
}

impl Default for GeoTracker {
    fn default() -> Self {
        Self::new()
    }
}
