//! Location collaborator.
//!
//! Platform location services sit behind [`LocationProvider`]. Samples are
//! pushed into the controller through a [`SampleSink`], which tags each
//! sample with the capture session it belongs to. Samples tagged with a
//! stale session are dropped by the controller, so once a capture stops no
//! late sample can reach it.

use std::future::Future;

use tokio::sync::mpsc;

use crate::config::LocationRequest;
use crate::controller::Event;
use crate::{LocationSample, Result};

/// Outcome of a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied,
}

/// Handle to a running location subscription.
pub trait LocationSubscription: Send {
    /// Stop delivery. Must not return while a sample can still be delivered.
    fn remove(&mut self);
}

/// Delivers samples for one capture session into the controller.
#[derive(Clone)]
pub struct SampleSink {
    token: u64,
    tx: mpsc::UnboundedSender<Event>,
}

impl SampleSink {
    pub(crate) fn new(token: u64, tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { token, tx }
    }

    /// Session this sink feeds.
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Hand a sample to the controller. Returns `false` once the controller
    /// has shut down.
    pub fn deliver(&self, sample: LocationSample) -> bool {
        self.tx
            .send(Event::Sample {
                token: self.token,
                sample,
            })
            .is_ok()
    }
}

/// Platform location services.
pub trait LocationProvider: Send + Sync + 'static {
    /// Ask the user for foreground location permission.
    fn request_permission(&self) -> impl Future<Output = PermissionStatus> + Send;

    /// One-shot current position.
    fn current_position(&self) -> impl Future<Output = Result<LocationSample>> + Send;

    /// Start a continuous subscription delivering into `sink`.
    fn watch_position(
        &self,
        request: &LocationRequest,
        sink: SampleSink,
    ) -> Result<Box<dyn LocationSubscription>>;
}
