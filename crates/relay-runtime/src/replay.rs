//! Re-sending stored events to a client's target endpoint.
//!
//! Replay is read-only: the stored event is loaded, turned into a `POST`
//! with its original headers and payload, and the outcome is returned as a
//! [`ReplayResult`]. Network failures become failed results, never errors.

use std::time::{Duration, Instant};

use relay_core::error::{RelayError, Result};
use relay_core::models::{
    ClientConfig, Event, ReplayBatchReport, ReplayResult, DEFAULT_TARGET_TIMEOUT_SECS,
};
use relay_data::client_store::ClientStore;
use relay_data::event_store::EventStore;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use tracing::{debug, info, warn};

/// Content type sent when the stored headers carry none.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Headers describing the original connection rather than the request.
const SKIPPED_HEADERS: &[&str] = &["content-length", "host", "connection", "transfer-encoding"];

#[derive(Debug, Clone)]
pub struct ReplayEngine {
    events: EventStore,
    clients: ClientStore,
    http: reqwest::Client,
}

impl ReplayEngine {
    pub fn new(events: EventStore, clients: ClientStore) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| RelayError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            events,
            clients,
            http,
        })
    }

    /// Replay one event of `client_id`.
    ///
    /// Only an unknown client is an error; everything else is reported in
    /// the result.
    pub async fn replay(&self, client_id: &str, event_id: &str) -> Result<ReplayResult> {
        let client = self.clients.get(client_id)?;
        Ok(self.replay_event(&client, event_id).await)
    }

    /// Replay each id in order; one failure does not stop the rest.
    pub async fn replay_batch(
        &self,
        client_id: &str,
        event_ids: &[String],
    ) -> Result<ReplayBatchReport> {
        let client = self.clients.get(client_id)?;
        let mut report = ReplayBatchReport::default();
        for event_id in event_ids {
            report.push(self.replay_event(&client, event_id).await);
        }
        info!(
            client_id,
            total = report.total,
            successful = report.successful,
            failed = report.failed,
            "replay batch finished"
        );
        Ok(report)
    }

    /// Replay against an already-loaded client configuration.
    pub async fn replay_event(&self, client: &ClientConfig, event_id: &str) -> ReplayResult {
        let event = match self.events.get(&client.id, event_id) {
            Ok(event) => event,
            Err(e) => return ReplayResult::failed(event_id, format!("failed to get event: {e}")),
        };

        debug!(
            client_id = %client.id,
            event_id,
            payload_bytes = event.payload.len(),
            "replaying event"
        );

        let timeout = Duration::from_secs(match client.target_timeout_secs {
            0 => DEFAULT_TARGET_TIMEOUT_SECS,
            secs => secs,
        });

        let request = self
            .http
            .post(&client.target_url)
            .headers(build_headers(&event))
            .timeout(timeout)
            .body(event.payload.clone());

        let started = Instant::now();
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(client_id = %client.id, event_id, error = %e, "replay request failed");
                return ReplayResult::failed(event_id, format!("failed to send request: {e}"));
            }
        };
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let success = status.is_success();

        info!(
            client_id = %client.id,
            event_id,
            status = status.as_u16(),
            latency_ms,
            "replay response"
        );

        ReplayResult {
            event_id: event_id.to_string(),
            success,
            status_code: Some(status.as_u16()),
            latency_ms: Some(latency_ms),
            error_message: (!success).then(|| format!("HTTP {}: {}", status.as_u16(), body)),
        }
    }
}

/// Stored headers plus a default content type when none is present.
pub fn build_headers(event: &Event) -> HeaderMap {
    let mut headers = HeaderMap::new();

    let has_content_type = event
        .headers
        .keys()
        .any(|k| k.eq_ignore_ascii_case(CONTENT_TYPE.as_str()));
    if !has_content_type {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
    }

    for (key, value) in &event.headers {
        if SKIPPED_HEADERS.iter().any(|h| key.eq_ignore_ascii_case(h)) {
            continue;
        }
        match (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => debug!(header = %key, "skipping header that is not valid HTTP"),
        }
    }

    headers
}
