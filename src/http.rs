//! HTTP transport for the remote document store.
//!
//! Maps the three remote collections onto a small REST surface:
//!
//! | Operation | Request |
//! |---|---|
//! | create zone | `PUT {base}/zones/{zoneId}` |
//! | list checkpoints | `GET {base}/checkpoints` |
//! | read progress | `GET {base}/users/{userId}/progress` (404 means no document) |
//! | merge progress | `PATCH {base}/users/{userId}/progress` |
//!
//! Zones are written with `PUT` keyed by the local zone id, so repeating a
//! create after a lost response is harmless.
//!
//! A request answered with 429 is retried up to 3 times with exponential
//! backoff (1s, 2s, 4s). Every other failure is returned to the caller; the
//! sync reconciler leaves the item for its next trigger.

use std::time::Duration;

use base64::Engine;
use log::{debug, warn};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};

use crate::checkpoints::Checkpoint;
use crate::progress::UserProgress;
use crate::remote::{RemoteStore, RemoteZone};
use crate::{Result, TerritoryError};

const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF_MS: u64 = 1000;
const REQUEST_TIMEOUT_SECS: u64 = 30;
const MAX_IDLE_PER_HOST: usize = 8;

/// REST client implementing [`RemoteStore`].
pub struct HttpRemoteStore {
    client: Client,
    base_url: Url,
    auth_header: String,
}

impl HttpRemoteStore {
    /// Create a client for `base_url`, authenticating with `api_key` (HTTP Basic).
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| TerritoryError::remote(format!("Failed to create HTTP client: {}", e)))?;

        let base_url = Url::parse(base_url).map_err(|e| TerritoryError::Config {
            message: format!("Invalid remote base URL {}: {}", base_url, e),
        })?;
        if base_url.cannot_be_a_base() {
            return Err(TerritoryError::Config {
                message: format!("Remote base URL {} cannot hold a path", base_url),
            });
        }

        Ok(Self {
            client,
            base_url,
            auth_header: basic_auth(api_key),
        })
    }

    /// Base URL extended by `segments`, each percent-encoded as one path segment.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// Send a request, retrying on 429. `build` is called once per attempt.
    async fn send(&self, what: &str, build: impl Fn() -> RequestBuilder) -> Result<Response> {
        let mut retries = 0;

        loop {
            let response = build()
                .header("Authorization", &self.auth_header)
                .send()
                .await?;
            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS {
                retries += 1;
                if retries > MAX_RETRIES {
                    return Err(TerritoryError::Remote {
                        message: format!("{}: max retries exceeded", what),
                        status_code: Some(status.as_u16()),
                    });
                }
                let backoff = backoff_for(retries);
                warn!(
                    "[HttpRemote] 429 for {}, retry {} after {:?}",
                    what, retries, backoff
                );
                tokio::time::sleep(backoff).await;
                continue;
            }

            debug!("[HttpRemote] {} -> {}", what, status);
            return Ok(response);
        }
    }
}

impl RemoteStore for HttpRemoteStore {
    async fn create_zone(&self, zone: &RemoteZone) -> Result<()> {
        let url = self.url(&["zones", zone.zone_id.as_str()]);
        let response = self
            .send("create zone", || self.client.put(url.clone()).json(zone))
            .await?;
        check_status(response, "create zone").await.map(|_| ())
    }

    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        let url = self.url(&["checkpoints"]);
        let response = self
            .send("list checkpoints", || self.client.get(url.clone()))
            .await?;
        let list = check_status(response, "list checkpoints")
            .await?
            .json::<Vec<Checkpoint>>()
            .await?;
        Ok(list)
    }

    async fn read_progress(&self, user_id: &str) -> Result<Option<UserProgress>> {
        let url = self.url(&["users", user_id, "progress"]);
        let response = self
            .send("read progress", || self.client.get(url.clone()))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let progress = check_status(response, "read progress")
            .await?
            .json::<UserProgress>()
            .await?;
        Ok(Some(progress))
    }

    async fn merge_progress(&self, user_id: &str, progress: &UserProgress) -> Result<()> {
        let url = self.url(&["users", user_id, "progress"]);
        let response = self
            .send("merge progress", || self.client.patch(url.clone()).json(progress))
            .await?;
        check_status(response, "merge progress").await.map(|_| ())
    }
}

async fn check_status(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TerritoryError::Remote {
        message: format!("{} failed: {}", what, body.trim()),
        status_code: Some(status.as_u16()),
    })
}

fn basic_auth(api_key: &str) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(format!("API_KEY:{}", api_key));
    format!("Basic {}", encoded)
}

/// 1s, 2s, 4s for retries 1..=3.
fn backoff_for(retry: u32) -> Duration {
    Duration::from_millis(BASE_BACKOFF_MS << retry.saturating_sub(1).min(4))
}
