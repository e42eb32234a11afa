//! Read/query/delete view over the event files a forwarder writes.
//!
//! Events live under `<data>/users/<owner>/clients/<client>/events/`, either
//! directly (`<id>.json`) or in day partitions (`YYYY-MM-DD/<id>.json`), each
//! optionally accompanied by a `<id>.sh` replay script. The forwarder writes
//! concurrently with every read here, so unreadable or half-written files are
//! skipped rather than reported.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Days, NaiveDate, Utc};
use relay_core::error::{RelayError, Result};
use relay_core::layout::StorageLayout;
use relay_core::models::{
    BatchDeleteReport, DeleteOutcome, Event, EventPage, EventQueryFilter, EventSummary, SortField,
    SortOrder,
};
use relay_core::time_utils::parse_day_dir;
use tracing::{debug, info, warn};

use crate::decoder::decode_event_file;
use crate::script::companion_script_path;

const EVENT_EXT: &str = "json";

/// File-backed event repository.
#[derive(Debug, Clone)]
pub struct EventStore {
    layout: StorageLayout,
}

impl EventStore {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    // ── Public API ────────────────────────────────────────────────────────

    /// Filter, sort and page the events of `client_id`.
    ///
    /// A client without an events directory yields an empty page. Pages past
    /// the end (or page `0`) are empty rather than an error.
    pub fn list(&self, client_id: &str, filter: &EventQueryFilter) -> Result<EventPage> {
        let mut events: Vec<Event> = match self.events_dir(client_id) {
            Some(dir) => read_all_events(&dir),
            None => Vec::new(),
        };

        events.retain(|e| filter.matches(e));
        sort_events(&mut events, filter.sort_by, filter.sort_order);

        let total = events.len();
        let events: Vec<EventSummary> = page_bounds(total, filter.page, filter.page_size)
            .map(|(start, end)| events[start..end].iter().map(Event::to_summary).collect())
            .unwrap_or_default();

        debug!(client_id, total, page = filter.page, "listed events");

        Ok(EventPage {
            total,
            page: filter.page,
            page_size: filter.page_size,
            events,
        })
    }

    /// Load one event, checking the flat layout before day partitions.
    ///
    /// A file that exists but cannot be decoded surfaces the decoder's error.
    pub fn get(&self, client_id: &str, event_id: &str) -> Result<Event> {
        let path = self
            .find_event_path(client_id, event_id)
            .ok_or_else(|| RelayError::EventNotFound(event_id.to_string()))?;
        decode_event_file(&path).map_err(|e| {
            debug!(client_id, event_id, error = %e, "event file unreadable");
            e
        })
    }

    /// Remove an event record and its companion script.
    pub fn delete(&self, client_id: &str, event_id: &str) -> Result<()> {
        let path = self
            .find_event_path(client_id, event_id)
            .ok_or_else(|| RelayError::EventNotFound(event_id.to_string()))?;

        std::fs::remove_file(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RelayError::EventNotFound(event_id.to_string())
            } else {
                RelayError::Io(e)
            }
        })?;

        let script = companion_script_path(&path);
        if let Err(e) = std::fs::remove_file(&script) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(client_id, event_id, error = %e, "failed to remove companion script");
            }
        }

        debug!(client_id, event_id, "event deleted");
        Ok(())
    }

    /// Delete every id independently; failures are reported per item.
    pub fn delete_batch(&self, client_id: &str, event_ids: &[String]) -> BatchDeleteReport {
        let mut report = BatchDeleteReport::default();
        for event_id in event_ids {
            let outcome = match self.delete(client_id, event_id) {
                Ok(()) => DeleteOutcome {
                    event_id: event_id.clone(),
                    success: true,
                    error_message: None,
                },
                Err(e) => DeleteOutcome {
                    event_id: event_id.clone(),
                    success: false,
                    error_message: Some(e.to_string()),
                },
            };
            report.push(outcome);
        }
        if report.failed > 0 {
            info!(
                client_id,
                deleted = report.deleted,
                failed = report.failed,
                "batch delete finished with failures"
            );
        }
        report
    }

    /// Drop day partitions older than `retention_days`; `0` keeps everything.
    ///
    /// Returns the number of partitions removed.
    pub fn cleanup_old_events(&self, client_id: &str, retention_days: u32) -> Result<usize> {
        self.cleanup_old_events_at(client_id, retention_days, Utc::now().date_naive())
    }

    /// [`cleanup_old_events`](Self::cleanup_old_events) against a fixed "today".
    pub fn cleanup_old_events_at(
        &self,
        client_id: &str,
        retention_days: u32,
        today: NaiveDate,
    ) -> Result<usize> {
        if retention_days == 0 {
            return Ok(0);
        }
        let Some(events_dir) = self.events_dir(client_id) else {
            return Ok(0);
        };
        let Some(cutoff) = today.checked_sub_days(Days::new(u64::from(retention_days))) else {
            return Ok(0);
        };

        let entries = std::fs::read_dir(&events_dir).map_err(|source| RelayError::FileRead {
            path: events_dir.clone(),
            source,
        })?;

        let mut removed = 0;
        for entry in entries.filter_map(|e| e.ok()) {
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let Some(day) = entry.file_name().to_str().and_then(parse_day_dir) else {
                continue;
            };
            if day < cutoff {
                match std::fs::remove_dir_all(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(
                        client_id,
                        dir = %entry.path().display(),
                        error = %e,
                        "failed to remove expired event partition"
                    ),
                }
            }
        }

        if removed > 0 {
            info!(client_id, removed, retention_days, "expired event partitions removed");
        }
        Ok(removed)
    }

    /// Timestamp of the most recent event, without loading the full history.
    ///
    /// Entries are visited in descending name order and the first file that
    /// yields a timestamp wins.
    pub fn latest_event_timestamp(&self, client_id: &str) -> Result<Option<DateTime<Utc>>> {
        let Some(events_dir) = self.events_dir(client_id) else {
            return Ok(None);
        };

        for entry in sorted_entries_desc(&events_dir) {
            if entry.is_dir() {
                for file in sorted_entries_desc(&entry) {
                    if let Some(ts) = event_timestamp(&file) {
                        return Ok(Some(ts));
                    }
                }
            } else if let Some(ts) = event_timestamp(&entry) {
                return Ok(Some(ts));
            }
        }

        Ok(None)
    }

    // ── Internal helpers ──────────────────────────────────────────────────

    fn events_dir(&self, client_id: &str) -> Option<PathBuf> {
        let owner = self.layout.find_owner(client_id)?;
        let dir = self.layout.events_dir(&owner, client_id);
        dir.is_dir().then_some(dir)
    }

    fn find_event_path(&self, client_id: &str, event_id: &str) -> Option<PathBuf> {
        if !is_valid_event_id(event_id) {
            return None;
        }
        let events_dir = self.events_dir(client_id)?;
        let file_name = format!("{event_id}.{EVENT_EXT}");

        let flat = events_dir.join(&file_name);
        if flat.is_file() {
            return Some(flat);
        }

        let mut day_dirs: Vec<PathBuf> = std::fs::read_dir(&events_dir)
            .ok()?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| e.path())
            .collect();
        day_dirs.sort();

        day_dirs
            .into_iter()
            .map(|dir| dir.join(&file_name))
            .find(|p| p.is_file())
    }
}

/// Event ids map straight to file names, so anything that could escape the
/// events directory is rejected.
fn is_valid_event_id(event_id: &str) -> bool {
    !event_id.is_empty()
        && event_id != "."
        && event_id != ".."
        && !event_id.contains(['/', '\\', '\0'])
}

fn is_event_file(path: &Path) -> bool {
    path.extension().map(|ext| ext == EVENT_EXT).unwrap_or(false)
}

/// Decode every event file in the flat layout and one level of partitions.
fn read_all_events(events_dir: &Path) -> Vec<Event> {
    walkdir::WalkDir::new(events_dir)
        .min_depth(1)
        .max_depth(2)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file() && is_event_file(entry.path()))
        .filter_map(|entry| match decode_event_file(entry.path()) {
            Ok(event) => Some(event),
            Err(e) => {
                debug!("Skipping event file {}: {}", entry.path().display(), e);
                None
            }
        })
        .collect()
}

fn sorted_entries_desc(dir: &Path) -> Vec<PathBuf> {
    let mut entries: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
        Err(_) => return Vec::new(),
    };
    entries.sort_by(|a, b| b.file_name().cmp(&a.file_name()));
    entries
}

fn event_timestamp(path: &Path) -> Option<DateTime<Utc>> {
    if !path.is_file() || !is_event_file(path) {
        return None;
    }
    decode_event_file(path).ok().map(|event| event.timestamp)
}

fn compare_events(a: &Event, b: &Event, field: SortField) -> Ordering {
    match field {
        SortField::Timestamp => a.timestamp.cmp(&b.timestamp),
        SortField::EventType => a.event_type.cmp(&b.event_type),
        SortField::Status => a.status.as_str().cmp(b.status.as_str()),
        SortField::Source => a.source.cmp(&b.source),
        SortField::StatusCode => a.status_code.cmp(&b.status_code),
        SortField::LatencyMs => a.latency_ms.cmp(&b.latency_ms),
    }
}

/// Stable sort; equal keys keep their on-disk order in both directions.
fn sort_events(events: &mut [Event], field: SortField, order: SortOrder) {
    match order {
        SortOrder::Asc => events.sort_by(|a, b| compare_events(a, b, field)),
        SortOrder::Desc => events.sort_by(|a, b| compare_events(b, a, field)),
    }
}

/// Slice bounds for a 1-based page, `None` when the page is empty.
fn page_bounds(total: usize, page: usize, page_size: usize) -> Option<(usize, usize)> {
    if page == 0 || page_size == 0 {
        return None;
    }
    let start = (page - 1).checked_mul(page_size)?;
    if start >= total {
        return None;
    }
    Some((start, start.saturating_add(page_size).min(total)))
}
