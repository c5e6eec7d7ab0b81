//! Unified error handling for the territory engine.
//!
//! Most failures in this crate are soft: storage and remote errors are logged
//! and the in-memory state stays authoritative. The variants here are what is
//! surfaced to callers when an operation genuinely cannot proceed.

use thiserror::Error;

/// Unified error type for territory engine operations.
#[derive(Debug, Error)]
pub enum TerritoryError {
    /// Location permission was refused; capture cannot start.
    #[error("Location permission unavailable")]
    PermissionDenied,

    /// Operation is not valid in the component's current state
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    /// Local key/value storage failed
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// JSON encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Remote document store rejected or failed a call
    #[error("{}", remote_message(.message, .status_code))]
    Remote {
        message: String,
        status_code: Option<u16>,
    },

    /// Location collaborator failed
    #[error("Location error: {message}")]
    Location { message: String },

    /// The controller loop has shut down
    #[error("Controller is no longer running")]
    ControllerClosed,

    /// Configuration could not be parsed
    #[error("Configuration error: {message}")]
    Config { message: String },
}

fn remote_message(message: &str, status_code: &Option<u16>) -> String {
    match status_code {
        Some(code) => format!("Remote error ({}): {}", code, message),
        None => format!("Remote error: {}", message),
    }
}

impl TerritoryError {
    pub fn storage(message: impl Into<String>) -> Self {
        TerritoryError::Storage {
            message: message.into(),
        }
    }

    pub fn remote(message: impl Into<String>) -> Self {
        TerritoryError::Remote {
            message: message.into(),
            status_code: None,
        }
    }
}

#[cfg(feature = "persistence")]
impl From<rusqlite::Error> for TerritoryError {
    fn from(e: rusqlite::Error) -> Self {
        TerritoryError::storage(e.to_string())
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for TerritoryError {
    fn from(e: reqwest::Error) -> Self {
        TerritoryError::Remote {
            message: e.to_string(),
            status_code: e.status().map(|s| s.as_u16()),
        }
    }
}

/// Result type alias for territory engine operations.
pub type Result<T> = std::result::Result<T, TerritoryError>;

/// Extension trait for converting Option to TerritoryError.
pub trait OptionExt<T> {
    /// Convert Option to Result with an invalid-state error.
    fn ok_or_invalid_state(self, operation: &'static str, state: &'static str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_invalid_state(self, operation: &'static str, state: &'static str) -> Result<T> {
        self.ok_or(TerritoryError::InvalidState { operation, state })
    }
}
