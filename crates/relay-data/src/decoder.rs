//! Decoding of stored event files into the canonical [`Event`] record.
//!
//! The forwarder has written three shapes over its lifetime:
//!
//! 1. **Structured** – canonical camelCase fields (`eventType`, `statusCode`…).
//! 2. **Legacy** – snake_case fields with response metadata nested under a
//!    `response` object.
//! 3. **Raw** – just the received JSON body, with metadata only available
//!    from the filename and the companion script.
//!
//! [`classify`] picks the shape, [`StoredRecord::into_partial`] extracts
//! whatever fields are present and [`normalize`] backfills the rest. Every
//! other component reads events through [`decode_event_file`].

use std::collections::BTreeMap;
use std::path::{Component, Path};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use relay_core::error::{RelayError, Result};
use relay_core::layout::EVENTS_DIR;
use relay_core::models::{Event, EventStatus};
use relay_core::time_utils::{parse_event_id_timestamp, parse_timestamp_value};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::script::load_script_headers;

// ── Shapes ────────────────────────────────────────────────────────────────────

/// Strict schema for the canonical on-disk shape.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StructuredRecord {
    pub id: Option<String>,
    pub client_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub event_type: Option<String>,
    pub source: Option<String>,
    pub status: Option<EventStatus>,
    pub status_code: Option<u16>,
    pub latency_ms: Option<u64>,
    pub headers: Option<BTreeMap<String, String>>,
    pub payload: Option<String>,
    pub response: Option<String>,
    pub error_message: Option<String>,
}

/// A stored event file after shape detection.
#[derive(Debug)]
pub enum StoredRecord {
    Structured(StructuredRecord),
    Legacy(Map<String, Value>),
    Raw(String),
}

/// Keys that mark an object as a forwarder record rather than a bare
/// webhook body. Generic names like `id` or `source` are deliberately absent.
const RECORD_MARKERS: &[&str] = &[
    "clientId",
    "client_id",
    "eventType",
    "event_type",
    "forward_status",
    "statusCode",
    "status_code",
    "latencyMs",
    "latency_ms",
    "headers",
    "payload",
    "response",
    "errorMessage",
    "error_message",
];

/// Detect the shape of `data`: strict schema first, then a loose object
/// carrying known record keys, otherwise raw payload.
pub fn classify(data: &[u8]) -> StoredRecord {
    if let Ok(record) = serde_json::from_slice::<StructuredRecord>(data) {
        return StoredRecord::Structured(record);
    }

    if let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(data) {
        if RECORD_MARKERS.iter().any(|k| map.contains_key(*k)) {
            return StoredRecord::Legacy(map);
        }
    }

    StoredRecord::Raw(String::from_utf8_lossy(data).trim().to_string())
}

// ── Partial record ────────────────────────────────────────────────────────────

/// Fields recovered from the file body before backfilling.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PartialEvent {
    pub id: Option<String>,
    pub client_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub event_type: Option<String>,
    pub source: Option<String>,
    pub status: Option<EventStatus>,
    pub status_code: u16,
    pub latency_ms: u64,
    pub headers: BTreeMap<String, String>,
    pub payload: Option<String>,
    pub response: Option<String>,
    pub error_message: Option<String>,
}

impl StoredRecord {
    pub fn into_partial(self) -> PartialEvent {
        match self {
            StoredRecord::Structured(r) => PartialEvent {
                id: non_empty(r.id),
                client_id: non_empty(r.client_id),
                timestamp: r.timestamp,
                event_type: non_empty(r.event_type),
                source: non_empty(r.source),
                status: r.status,
                status_code: r.status_code.unwrap_or(0),
                latency_ms: r.latency_ms.unwrap_or(0),
                headers: r.headers.unwrap_or_default(),
                payload: non_empty(r.payload.map(|p| p.trim().to_string())),
                response: non_empty(r.response),
                error_message: non_empty(r.error_message),
            },
            StoredRecord::Legacy(map) => partial_from_loose(&map),
            StoredRecord::Raw(_) => PartialEvent::default(),
        }
    }
}

fn partial_from_loose(raw: &Map<String, Value>) -> PartialEvent {
    let mut partial = PartialEvent {
        id: first_string(raw, &["id"]),
        client_id: first_string(raw, &["clientId", "client_id"]),
        event_type: first_string(raw, &["eventType", "event_type"]),
        source: first_string(raw, &["source"]),
        status: first_string(raw, &["status", "forward_status"])
            .and_then(|s| s.parse::<EventStatus>().ok()),
        timestamp: ["timestamp", "time", "created_at"]
            .iter()
            .filter_map(|k| raw.get(*k))
            .find_map(parse_timestamp_value),
        status_code: first_status_code(raw, &["statusCode", "status_code"]),
        latency_ms: first_u64(raw, &["latencyMs", "latency_ms"]),
        ..PartialEvent::default()
    };

    match raw.get("response") {
        Some(Value::Object(resp)) => {
            if partial.status_code == 0 {
                partial.status_code = first_status_code(resp, &["status_code", "statusCode"]);
            }
            if partial.latency_ms == 0 {
                partial.latency_ms = first_u64(resp, &["latency_ms", "latencyMs"]);
            }
            partial.error_message = first_string(resp, &["error"]);
            partial.response = Some(Value::Object(resp.clone()).to_string());
        }
        Some(other) => partial.response = non_empty(Some(stringify(other))),
        None => {}
    }

    if let Some(Value::Object(headers)) = raw.get("headers") {
        partial.headers = headers
            .iter()
            .map(|(k, v)| (k.clone(), stringify(v)))
            .collect();
    }

    partial.payload = raw.get("payload").map(stringify).and_then(|p| non_empty(Some(p)));

    if let Some(msg) = first_string(raw, &["errorMessage", "error_message"]) {
        partial.error_message = Some(msg);
    }

    partial
}

// ── Backfill ──────────────────────────────────────────────────────────────────

/// Build the canonical event, filling anything the body did not carry.
///
/// * id ← filename stem
/// * client id ← the directory above `events/`
/// * timestamp ← id-encoded time, else `modified`, else the Unix epoch
/// * payload ← the whole file body
/// * headers ← the companion script
/// * status ← implied by the status code, else `not_replayed`
pub fn normalize(
    mut partial: PartialEvent,
    path: &Path,
    body: &str,
    modified: Option<SystemTime>,
) -> Event {
    let id = partial
        .id
        .take()
        .or_else(|| {
            path.file_stem()
                .and_then(|s| s.to_str())
                .map(str::to_string)
        })
        .unwrap_or_default();

    let client_id = partial
        .client_id
        .take()
        .or_else(|| infer_client_id(path))
        .unwrap_or_default();

    let timestamp = partial
        .timestamp
        .or_else(|| parse_event_id_timestamp(&id))
        .or_else(|| modified.map(DateTime::<Utc>::from))
        .unwrap_or_default();

    let headers = if partial.headers.is_empty() {
        load_script_headers(path)
    } else {
        partial.headers
    };

    let status = partial
        .status
        .or_else(|| EventStatus::from_status_code(partial.status_code))
        .unwrap_or(EventStatus::NotReplayed);

    Event {
        id,
        client_id,
        timestamp,
        event_type: partial.event_type.unwrap_or_default(),
        source: partial.source.unwrap_or_default(),
        status,
        status_code: partial.status_code,
        latency_ms: partial.latency_ms,
        headers,
        payload: partial.payload.unwrap_or_else(|| body.trim().to_string()),
        response: partial.response,
        error_message: partial.error_message,
    }
}

/// Name of the directory directly above the nearest `events` ancestor.
pub fn infer_client_id(path: &Path) -> Option<String> {
    let components: Vec<&str> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .collect();
    let events_idx = components.iter().rposition(|c| *c == EVENTS_DIR)?;
    events_idx
        .checked_sub(1)
        .map(|i| components[i].to_string())
}

/// Decode an in-memory event body located at `path`.
pub fn decode_event(path: &Path, data: &[u8], modified: Option<SystemTime>) -> Event {
    let record = classify(data);
    let body = match &record {
        StoredRecord::Raw(text) => text.clone(),
        _ => String::from_utf8_lossy(data).into_owned(),
    };
    normalize(record.into_partial(), path, &body, modified)
}

/// Read and decode one event file.
///
/// Empty files are reported as errors so callers can skip records the
/// forwarder has created but not yet written.
pub fn decode_event_file(path: &Path) -> Result<Event> {
    let data = std::fs::read(path).map_err(|source| RelayError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;
    if data.iter().all(u8::is_ascii_whitespace) {
        debug!("Skipping empty event file {}", path.display());
        return Err(RelayError::FileRead {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "empty event file"),
        });
    }
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();
    Ok(decode_event(path, &data, modified))
}

// ── Value helpers ─────────────────────────────────────────────────────────────

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// Strings pass through trimmed; anything else is re-serialised as JSON.
fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

fn first_string(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| map.get(*k))
        .map(stringify)
        .find(|s| !s.is_empty())
}

fn value_to_u64(value: &Value) -> u64 {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn first_u64(map: &Map<String, Value>, keys: &[&str]) -> u64 {
    keys.iter()
        .filter_map(|k| map.get(*k))
        .map(value_to_u64)
        .find(|n| *n != 0)
        .unwrap_or(0)
}

/// HTTP status from the first candidate key; out-of-range values count as absent.
fn first_status_code(map: &Map<String, Value>, keys: &[&str]) -> u16 {
    u16::try_from(first_u64(map, keys)).unwrap_or(0)
}
