use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::RelayError;

// ── Client configuration ──────────────────────────────────────────────────────

/// Which replay script flavour the forwarder writes next to each event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptFormat {
    #[default]
    Curl,
    Httpie,
}

/// Persisted lifecycle status of a supervised forwarder instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    #[default]
    Stopped,
    Error,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Running => "running",
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Error => "error",
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Default target connection timeout in seconds.
pub const DEFAULT_TARGET_TIMEOUT_SECS: u64 = 60;

/// Default forwarder SSE buffer size (1 MiB).
pub const DEFAULT_BUFFER_SIZE: u64 = 1_048_576;

/// Configuration for one forwarder instance, persisted as `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// Unique client identifier.
    pub id: String,
    /// Owner (tenant) the client belongs to.
    pub owner_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Event-source URL the forwarder subscribes to.
    pub source_url: String,
    /// Endpoint events are relayed (and replayed) to.
    pub target_url: String,
    /// Target connection timeout in seconds.
    #[serde(default = "default_target_timeout")]
    pub target_timeout_secs: u64,
    #[serde(default)]
    pub script_format: ScriptFormat,
    /// Event types the forwarder should drop.
    #[serde(default)]
    pub ignore_events: Vec<String>,
    /// Save events without forwarding them.
    #[serde(default)]
    pub save_only: bool,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: u64,
    /// Last status recorded by the management layer.
    #[serde(default)]
    pub status: ProcessStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_target_timeout() -> u64 {
    DEFAULT_TARGET_TIMEOUT_SECS
}

fn default_buffer_size() -> u64 {
    DEFAULT_BUFFER_SIZE
}

impl ClientConfig {
    /// New stopped client with default timeout and buffer size.
    pub fn new(
        id: impl Into<String>,
        owner_id: impl Into<String>,
        source_url: impl Into<String>,
        target_url: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            name: String::new(),
            description: String::new(),
            source_url: source_url.into(),
            target_url: target_url.into(),
            target_timeout_secs: DEFAULT_TARGET_TIMEOUT_SECS,
            script_format: ScriptFormat::Curl,
            ignore_events: Vec::new(),
            save_only: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
            status: ProcessStatus::Stopped,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Caller-supplied fields for creating a client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub source_url: String,
    pub target_url: String,
    /// `None` or zero keeps the default.
    #[serde(default)]
    pub target_timeout_secs: Option<u64>,
    #[serde(default)]
    pub script_format: ScriptFormat,
    #[serde(default)]
    pub ignore_events: Vec<String>,
    #[serde(default)]
    pub save_only: bool,
    #[serde(default)]
    pub buffer_size: Option<u64>,
}

// ── Client listings ───────────────────────────────────────────────────────────

/// List projection of a client with its effective status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSummary {
    pub id: String,
    pub name: String,
    pub status: ProcessStatus,
    pub source_url: String,
    pub target_url: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientSortField {
    Name,
    Status,
    #[default]
    CreatedAt,
}

/// Filter, sort and page parameters for client listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientListFilter {
    /// Matched against the effective status, not the persisted one.
    pub status: Option<ProcessStatus>,
    /// Case-insensitive substring of the client name.
    pub search: Option<String>,
    pub sort_by: ClientSortField,
    pub sort_order: SortOrder,
    pub page: usize,
    pub page_size: usize,
}

impl Default for ClientListFilter {
    fn default() -> Self {
        Self {
            status: None,
            search: None,
            sort_by: ClientSortField::CreatedAt,
            sort_order: SortOrder::Desc,
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl ClientListFilter {
    pub fn matches(&self, summary: &ClientSummary) -> bool {
        if let Some(status) = self.status {
            if summary.status != status {
                return false;
            }
        }
        match self.search.as_deref().filter(|s| !s.is_empty()) {
            Some(search) => summary
                .name
                .to_lowercase()
                .contains(&search.to_lowercase()),
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientPage {
    /// Number of clients matching the filter, across all pages.
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub clients: Vec<ClientSummary>,
}

/// Per-client outcome of a batch start or stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientBatchResult {
    pub client_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientBatchReport {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<ClientBatchResult>,
}

impl ClientBatchReport {
    pub fn push(&mut self, client_id: impl Into<String>, outcome: crate::error::Result<()>) {
        self.total += 1;
        let message = match outcome {
            Ok(()) => {
                self.successful += 1;
                None
            }
            Err(e) => {
                self.failed += 1;
                Some(e.to_string())
            }
        };
        self.results.push(ClientBatchResult {
            client_id: client_id.into(),
            success: message.is_none(),
            message,
        });
    }

    /// Collapse to all-or-error semantics.
    pub fn into_result(self) -> crate::error::Result<Self> {
        if self.failed > 0 {
            Err(RelayError::PartialBatchFailure {
                failed: self.failed,
                total: self.total,
            })
        } else {
            Ok(self)
        }
    }
}

/// Event and uptime figures for one client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStats {
    pub total_events: usize,
    /// Events stamped since midnight UTC.
    pub today_events: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_time: Option<DateTime<Utc>>,
    /// Seconds since the current process started; `None` unless running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running_time_secs: Option<u64>,
    pub restart_count: u32,
}

// ── Process logs ──────────────────────────────────────────────────────────────

/// One page of a daily log file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogPage {
    /// Number of lines matching the search, across all pages.
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub lines: Vec<String>,
}

// ── Process information ───────────────────────────────────────────────────────

/// Point-in-time view of a supervised process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub client_id: String,
    /// OS process id, `None` once the process has been reaped.
    pub pid: Option<u32>,
    pub status: ProcessStatus,
    pub started_at: DateTime<Utc>,
    pub restart_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

// ── Events ────────────────────────────────────────────────────────────────────

/// Forwarding outcome recorded for a stored event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Success,
    Failed,
    NotReplayed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Success => "success",
            EventStatus::Failed => "failed",
            EventStatus::NotReplayed => "not_replayed",
        }
    }

    /// Status implied by an HTTP status code: 2xx succeeded, any other
    /// non-zero code failed, zero means nothing was forwarded.
    pub fn from_status_code(code: u16) -> Option<Self> {
        match code {
            0 => None,
            200..=299 => Some(EventStatus::Success),
            _ => Some(EventStatus::Failed),
        }
    }
}

impl FromStr for EventStatus {
    type Err = RelayError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "success" => Ok(EventStatus::Success),
            "failed" => Ok(EventStatus::Failed),
            "not_replayed" => Ok(EventStatus::NotReplayed),
            other => Err(RelayError::Config(format!("unknown event status: {other}"))),
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One received (and possibly forwarded) request, normalised from whatever
/// shape the forwarder wrote to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub client_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub source: String,
    pub status: EventStatus,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Opaque request body.
    #[serde(default)]
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Event {
    pub fn to_summary(&self) -> EventSummary {
        EventSummary {
            id: self.id.clone(),
            timestamp: self.timestamp,
            event_type: self.event_type.clone(),
            source: self.source.clone(),
            status: self.status,
            status_code: self.status_code,
            latency_ms: self.latency_ms,
        }
    }
}

/// List projection of an [`Event`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSummary {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub source: String,
    pub status: EventStatus,
    pub status_code: u16,
    pub latency_ms: u64,
}

// ── Queries ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortField {
    #[default]
    Timestamp,
    EventType,
    Status,
    Source,
    StatusCode,
    LatencyMs,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Default page size for event listings.
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// Filter, sort and page parameters for [`Event`] listings.
///
/// The timestamp range is half-open: `date_from <= t < date_to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventQueryFilter {
    pub event_type: Option<String>,
    pub status: Option<EventStatus>,
    /// Case-insensitive substring of `source`.
    pub search: Option<String>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub sort_by: SortField,
    pub sort_order: SortOrder,
    /// 1-based page number.
    pub page: usize,
    pub page_size: usize,
}

impl Default for EventQueryFilter {
    fn default() -> Self {
        Self {
            event_type: None,
            status: None,
            search: None,
            date_from: None,
            date_to: None,
            sort_by: SortField::Timestamp,
            sort_order: SortOrder::Desc,
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl EventQueryFilter {
    /// `true` when `event` passes every filter predicate.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(event_type) = self.event_type.as_deref().filter(|s| !s.is_empty()) {
            if event.event_type != event_type {
                return false;
            }
        }
        if let Some(status) = self.status {
            if event.status != status {
                return false;
            }
        }
        if let Some(search) = self.search.as_deref().filter(|s| !s.is_empty()) {
            if !event
                .source
                .to_lowercase()
                .contains(&search.to_lowercase())
            {
                return false;
            }
        }
        if let Some(from) = self.date_from {
            if event.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.date_to {
            if event.timestamp >= to {
                return false;
            }
        }
        true
    }
}

/// One page of an event listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPage {
    /// Number of events matching the filter, across all pages.
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub events: Vec<EventSummary>,
}

// ── Batch outcomes ────────────────────────────────────────────────────────────

/// Per-item outcome of a batch delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOutcome {
    pub event_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDeleteReport {
    pub total: usize,
    pub deleted: usize,
    pub failed: usize,
    pub results: Vec<DeleteOutcome>,
}

impl BatchDeleteReport {
    pub fn push(&mut self, outcome: DeleteOutcome) {
        self.total += 1;
        if outcome.success {
            self.deleted += 1;
        } else {
            self.failed += 1;
        }
        self.results.push(outcome);
    }
}

/// Outcome of replaying one stored event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayResult {
    pub event_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ReplayResult {
    pub fn failed(event_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            success: false,
            status_code: None,
            latency_ms: None,
            error_message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayBatchReport {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<ReplayResult>,
}

impl ReplayBatchReport {
    pub fn push(&mut self, result: ReplayResult) {
        self.total += 1;
        if result.success {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
        self.results.push(result);
    }
}

// ── Quota ─────────────────────────────────────────────────────────────────────

/// Usage percentage at which a storage warning is raised.
pub const STORAGE_WARNING_PERCENT: f64 = 80.0;

/// Usage percentage at which new process instances are refused.
pub const STORAGE_FULL_PERCENT: f64 = 100.0;

/// Cached storage and client-count measurement for one owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaSnapshot {
    pub owner_id: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    /// Usage percentage, `0.0` when `total_bytes` is zero.
    pub percentage: f64,
    pub clients_count: usize,
    pub max_clients: usize,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl QuotaSnapshot {
    pub fn new(
        owner_id: impl Into<String>,
        total_bytes: u64,
        max_clients: usize,
        used_bytes: u64,
        clients_count: usize,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let percentage = if total_bytes > 0 {
            used_bytes as f64 / total_bytes as f64 * 100.0
        } else {
            0.0
        };
        Self {
            owner_id: owner_id.into(),
            total_bytes,
            used_bytes,
            percentage,
            clients_count,
            max_clients,
            updated_at: Utc::now(),
            expires_at,
        }
    }

    pub fn is_storage_full(&self) -> bool {
        self.percentage >= STORAGE_FULL_PERCENT
    }

    pub fn is_storage_warning(&self) -> bool {
        self.percentage >= STORAGE_WARNING_PERCENT
    }

    pub fn is_clients_limit_reached(&self) -> bool {
        self.clients_count >= self.max_clients
    }

    pub fn can_create_client(&self) -> bool {
        !self.is_clients_limit_reached()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
