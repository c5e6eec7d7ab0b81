//! Engine configuration.

use serde::{Deserialize, Serialize};

use crate::{Result, TerritoryError};

/// Storage key for the persisted zone array.
pub const ZONES_KEY: &str = "zones";

/// Storage key for the persisted visited-checkpoint id array.
pub const VISITED_KEY: &str = "visited_checkpoints";

/// Storage key for local XP and area totals.
pub const PROGRESS_KEY: &str = "user_progress";

/// Requested accuracy for the location subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LocationAccuracy {
    Balanced,
    High,
}

/// Parameters handed to the location collaborator when a capture starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationRequest {
    pub accuracy: LocationAccuracy,
    /// Minimum time between samples. Default: 1000 ms
    pub min_interval_ms: u64,
    /// Minimum displacement between samples. Default: 2 m
    pub min_distance_m: f64,
}

impl Default for LocationRequest {
    fn default() -> Self {
        Self {
            accuracy: LocationAccuracy::High,
            min_interval_ms: 1000,
            min_distance_m: 2.0,
        }
    }
}

/// Configuration for the engine and its controller loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Radius around a checkpoint that counts as a visit.
    /// Default: 50.0 meters
    pub proximity_radius_m: f64,

    /// Delay between replayed points.
    /// Default: 250 ms
    pub replay_interval_ms: u64,

    /// Location subscription parameters used while capturing.
    pub location: LocationRequest,

    /// Minimum distinct samples for a capture to become a zone.
    /// Default: 3
    pub min_capture_points: usize,

    /// Signed-in user; progress sync is skipped when `None`.
    pub user_id: Option<String>,

    /// Maximum zone creates in flight during one sync pass.
    /// Default: 4
    pub sync_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            proximity_radius_m: 50.0,
            replay_interval_ms: 250,
            location: LocationRequest::default(),
            min_capture_points: 3,
            user_id: None,
            sync_concurrency: 4,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_json::from_str(json).map_err(|e| TerritoryError::Config {
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(self.proximity_radius_m.is_finite() && self.proximity_radius_m > 0.0) {
            return Err(TerritoryError::Config {
                message: format!("proximityRadiusM must be positive, got {}", self.proximity_radius_m),
            });
        }
        if self.replay_interval_ms == 0 {
            return Err(TerritoryError::Config {
                message: "replayIntervalMs must be non-zero".to_string(),
            });
        }
        if self.min_capture_points < 3 {
            return Err(TerritoryError::Config {
                message: "minCapturePoints must be at least 3".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.proximity_radius_m, 50.0);
        assert_eq!(config.replay_interval_ms, 250);
        assert_eq!(config.location.min_interval_ms, 1000);
        assert_eq!(config.location.min_distance_m, 2.0);
        assert_eq!(config.location.accuracy, LocationAccuracy::High);
    }

    #[test]
    fn test_from_json_partial() {
        let config =
            EngineConfig::from_json(r#"{"userId": "u-1", "proximityRadiusM": 30.0}"#).unwrap();
        assert_eq!(config.user_id.as_deref(), Some("u-1"));
        assert_eq!(config.proximity_radius_m, 30.0);
        assert_eq!(config.replay_interval_ms, 250);
    }

    #[test]
    fn test_from_json_rejects_bad_values() {
        assert!(EngineConfig::from_json(r#"{"replayIntervalMs": 0}"#).is_err());
        assert!(EngineConfig::from_json(r#"{"minCapturePoints": 2}"#).is_err());
        assert!(EngineConfig::from_json("not json").is_err());
    }
}
