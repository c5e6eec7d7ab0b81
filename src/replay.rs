//! # Replay Player
//!
//! Replays a stored zone's points one per tick. The player is a plain state
//! machine; the controller owns the timer and calls [`ReplayPlayer::tick`]
//! at the configured cadence (250 ms by default).

use log::info;

use crate::{LocationSample, Result, TerritoryError, Zone};

/// One replayed point.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayFrame {
    pub zone_id: String,
    pub index: usize,
    pub total: usize,
    pub point: LocationSample,
    /// True for the final point; the player is idle again after emitting it
    pub is_last: bool,
}

#[derive(Debug, Clone)]
struct ReplaySession {
    zone_id: String,
    coords: Vec<LocationSample>,
    cursor: usize,
}

/// Replay state machine: `Idle` ⇄ `Playing`.
#[derive(Debug, Default)]
pub struct ReplayPlayer {
    session: Option<ReplaySession>,
    /// Points emitted so far; kept after completion, cleared by `stop`
    emitted: Vec<LocationSample>,
}

impl ReplayPlayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_playing(&self) -> bool {
        self.session.is_some()
    }

    /// Id of the zone being replayed.
    pub fn zone_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.zone_id.as_str())
    }

    /// The path drawn so far.
    pub fn emitted(&self) -> &[LocationSample] {
        &self.emitted
    }

    /// Begin replaying `zone`. Only valid while idle.
    pub fn start(&mut self, zone: &Zone) -> Result<()> {
        if self.session.is_some() {
            return Err(TerritoryError::InvalidState {
                operation: "start replay",
                state: "playing",
            });
        }

        self.emitted.clear();
        if zone.coords.is_empty() {
            return Ok(());
        }

        info!(
            "[Replay] Playing zone {} ({} points)",
            zone.id,
            zone.coords.len()
        );
        self.session = Some(ReplaySession {
            zone_id: zone.id.clone(),
            coords: zone.coords.clone(),
            cursor: 0,
        });
        Ok(())
    }

    /// Emit the next point. Returns `None` when idle.
    pub fn tick(&mut self) -> Option<ReplayFrame> {
        let session = self.session.as_mut()?;
        let point = *session.coords.get(session.cursor)?;
        let index = session.cursor;
        session.cursor += 1;

        let total = session.coords.len();
        let is_last = session.cursor >= total;
        let frame = ReplayFrame {
            zone_id: session.zone_id.clone(),
            index,
            total,
            point,
            is_last,
        };

        self.emitted.push(point);
        if is_last {
            info!("[Replay] Zone {} finished", frame.zone_id);
            self.session = None;
        }
        Some(frame)
    }

    /// Cancel playback, discarding the remaining points and the drawn path.
    pub fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            info!(
                "[Replay] Zone {} stopped at {}/{}",
                session.zone_id,
                session.cursor,
                session.coords.len()
            );
        }
        self.emitted.clear();
    }
}
