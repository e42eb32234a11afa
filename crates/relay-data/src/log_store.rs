//! Daily capture files of forwarder output.
//!
//! Each client keeps one `logs/YYYY-MM-DD.log` per UTC day. The supervisor
//! appends through a [`DailyLogWriter`]; readers page and search whole files.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Days, NaiveDate, Utc};
use relay_core::error::{RelayError, Result};
use relay_core::layout::{StorageLayout, LOG_FILE_EXT};
use relay_core::models::LogPage;
use relay_core::time_utils::{parse_date, parse_day_dir};
use tracing::{debug, info, warn};

/// Page size used when the caller passes `0` or more than [`MAX_LOG_PAGE_SIZE`].
pub const DEFAULT_LOG_PAGE_SIZE: usize = 100;

pub const MAX_LOG_PAGE_SIZE: usize = 1000;

/// Read-side access to the per-client log directory.
#[derive(Debug, Clone)]
pub struct LogStore {
    layout: StorageLayout,
}

impl LogStore {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    // ── Public API ────────────────────────────────────────────────────────

    /// One page of the lines logged on `date` (`YYYY-MM-DD`), optionally
    /// restricted to lines containing `search` (case-insensitive).
    ///
    /// A day without a log file yields an empty page.
    pub fn read(
        &self,
        client_id: &str,
        date: &str,
        page: usize,
        page_size: usize,
        search: Option<&str>,
    ) -> Result<LogPage> {
        let path = self.log_path(client_id, date)?;
        let page = page.max(1);
        let page_size = if page_size == 0 || page_size > MAX_LOG_PAGE_SIZE {
            DEFAULT_LOG_PAGE_SIZE
        } else {
            page_size
        };

        let text = match std::fs::read(&path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LogPage {
                    total: 0,
                    page,
                    page_size,
                    lines: Vec::new(),
                })
            }
            Err(source) => return Err(RelayError::FileRead { path, source }),
        };

        let needle = search.map(str::trim).filter(|s| !s.is_empty()).map(str::to_lowercase);
        let matching: Vec<&str> = text
            .lines()
            .filter(|line| match &needle {
                Some(n) => line.to_lowercase().contains(n),
                None => true,
            })
            .collect();

        let total = matching.len();
        let lines = matching
            .into_iter()
            .skip((page - 1).saturating_mul(page_size))
            .take(page_size)
            .map(str::to_string)
            .collect();

        Ok(LogPage {
            total,
            page,
            page_size,
            lines,
        })
    }

    /// Raw bytes of one day's log file.
    pub fn download(&self, client_id: &str, date: &str) -> Result<Vec<u8>> {
        let path = self.log_path(client_id, date)?;
        std::fs::read(&path).map_err(|source| RelayError::FileRead { path, source })
    }

    /// Remove daily files older than `retention_days`; `0` keeps everything.
    pub fn cleanup_old_logs(&self, client_id: &str, retention_days: u32) -> Result<usize> {
        self.cleanup_old_logs_at(client_id, retention_days, Utc::now().date_naive())
    }

    pub fn cleanup_old_logs_at(
        &self,
        client_id: &str,
        retention_days: u32,
        today: NaiveDate,
    ) -> Result<usize> {
        if retention_days == 0 {
            return Ok(0);
        }
        let Some(owner) = self.layout.find_owner(client_id) else {
            return Ok(0);
        };
        let logs_dir = self.layout.logs_dir(&owner, client_id);
        if !logs_dir.is_dir() {
            return Ok(0);
        }
        let Some(cutoff) = today.checked_sub_days(Days::new(u64::from(retention_days))) else {
            return Ok(0);
        };

        let entries = std::fs::read_dir(&logs_dir).map_err(|source| RelayError::FileRead {
            path: logs_dir.clone(),
            source,
        })?;

        let mut removed = 0;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_file() || path.extension().map(|e| e != LOG_FILE_EXT).unwrap_or(true) {
                continue;
            }
            let Some(day) = path.file_stem().and_then(|s| s.to_str()).and_then(parse_day_dir) else {
                continue;
            };
            if day < cutoff {
                match std::fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(
                        client_id,
                        file = %path.display(),
                        error = %e,
                        "failed to remove expired log file"
                    ),
                }
            }
        }

        if removed > 0 {
            info!(client_id, removed, retention_days, "expired log files removed");
        }
        Ok(removed)
    }

    /// Appender for a client's capture files.
    pub fn writer(&self, owner_id: &str, client_id: &str) -> DailyLogWriter {
        DailyLogWriter {
            layout: self.layout.clone(),
            owner_id: owner_id.to_string(),
            client_id: client_id.to_string(),
            current: None,
        }
    }

    fn log_path(&self, client_id: &str, date: &str) -> Result<PathBuf> {
        let date = parse_date(date)?;
        let owner = self
            .layout
            .find_owner(client_id)
            .ok_or_else(|| RelayError::ClientNotFound(client_id.to_string()))?;
        Ok(self.layout.log_file(&owner, client_id, date))
    }
}

/// Appends lines to the file for the day each line was captured, rolling
/// over to a new file at UTC midnight.
#[derive(Debug)]
pub struct DailyLogWriter {
    layout: StorageLayout,
    owner_id: String,
    client_id: String,
    current: Option<(NaiveDate, File)>,
}

impl DailyLogWriter {
    pub fn write_line(&mut self, at: DateTime<Utc>, line: &str) -> Result<()> {
        let day = at.date_naive();
        let file = match &mut self.current {
            Some((open_day, file)) if *open_day == day => file,
            slot => {
                let path = self.layout.log_file(&self.owner_id, &self.client_id, day);
                let file = open_append(&path)?;
                debug!(client_id = %self.client_id, file = %path.display(), "log file opened");
                &mut slot.insert((day, file)).1
            }
        };
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}
