//! Client-level operations tying the stores, the quota estimator, the
//! supervisor and the replay engine together.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, TimeZone, Utc};
use relay_core::error::{RelayError, Result};
use relay_core::layout::StorageLayout;
use relay_core::models::{
    BatchDeleteReport, ClientBatchReport, ClientConfig, ClientListFilter, ClientPage,
    ClientRequest, ClientSortField, ClientStats, ClientSummary, Event, EventPage,
    EventQueryFilter, LogPage, ProcessInfo, ProcessStatus, ReplayBatchReport, ReplayResult,
    SortOrder, DEFAULT_BUFFER_SIZE, DEFAULT_TARGET_TIMEOUT_SECS,
};
use relay_core::settings::{Settings, SupervisorConfig};
use relay_core::time_utils::DAY_DIR_FORMAT;
use relay_data::client_store::ClientStore;
use relay_data::event_store::EventStore;
use relay_data::log_store::LogStore;
use relay_data::quota::{QuotaEstimator, QuotaLimits};
use reqwest::Url;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::log_hub::LogSubscription;
use crate::replay::ReplayEngine;
use crate::supervisor::{ProcessSupervisor, StatusListener};

/// Live status of one client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStatus {
    pub client_id: String,
    pub status: ProcessStatus,
    /// Present while the supervisor holds a handle for the client.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessInfo>,
    /// Timestamp of the newest stored event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
}

/// Entry point for everything keyed by client or owner id.
#[derive(Debug)]
pub struct ClientManager {
    clients: ClientStore,
    events: EventStore,
    logs: LogStore,
    quota: QuotaEstimator,
    supervisor: Arc<ProcessSupervisor>,
    replay: ReplayEngine,
}

impl ClientManager {
    pub fn new(
        supervisor_config: SupervisorConfig,
        limits: QuotaLimits,
        quota_cache_ttl: Duration,
    ) -> Result<Self> {
        let layout = StorageLayout::new(&supervisor_config.base_dir);
        let clients = ClientStore::new(layout.clone());
        let events = EventStore::new(layout.clone());
        let replay = ReplayEngine::new(events.clone(), clients.clone())?;

        // Crashes and automatic restarts happen without a caller; keep
        // config.json in step with them.
        let store = clients.clone();
        let listener = StatusListener::new(move |client, status| {
            record_status(&store, &client.id, status)
        });

        Ok(Self {
            logs: LogStore::new(layout.clone()),
            quota: QuotaEstimator::new(layout, limits, quota_cache_ttl),
            supervisor: ProcessSupervisor::with_status_listener(supervisor_config, listener),
            clients,
            events,
            replay,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(
            settings.supervisor_config(),
            QuotaLimits {
                max_storage_bytes: settings.max_storage_per_owner,
                max_clients: settings.max_clients_per_owner,
            },
            settings.quota_cache_ttl(),
        )
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub fn quota(&self) -> &QuotaEstimator {
        &self.quota
    }

    // ── Clients ───────────────────────────────────────────────────────────

    /// Validate, check the client-count quota and persist a new client.
    pub fn create_client(&self, owner_id: &str, request: ClientRequest) -> Result<ClientConfig> {
        validate_url("source URL", &request.source_url)?;
        validate_url("target URL", &request.target_url)?;

        self.quota.check_can_create_client(owner_id)?;

        let mut client = ClientConfig::new(
            generate_client_id(),
            owner_id,
            request.source_url.trim(),
            request.target_url.trim(),
        );
        client.name = request.name;
        client.description = request.description;
        client.target_timeout_secs = request
            .target_timeout_secs
            .filter(|t| *t > 0)
            .unwrap_or(DEFAULT_TARGET_TIMEOUT_SECS);
        client.script_format = request.script_format;
        client.ignore_events = request.ignore_events;
        client.save_only = request.save_only;
        client.buffer_size = request
            .buffer_size
            .filter(|b| *b > 0)
            .unwrap_or(DEFAULT_BUFFER_SIZE);

        self.clients.create(&client)?;
        self.quota.invalidate_cache(owner_id);
        info!(client_id = %client.id, owner_id, "client created");
        Ok(client)
    }

    pub fn get_client(&self, client_id: &str) -> Result<ClientConfig> {
        self.clients.get(client_id)
    }

    pub fn list_clients(&self, owner_id: &str) -> Vec<ClientConfig> {
        self.clients.list_for_owner(owner_id)
    }

    /// Replace the editable settings of a stopped client. The source URL
    /// is fixed at creation.
    pub fn update_client(&self, client_id: &str, request: ClientRequest) -> Result<ClientConfig> {
        let mut client = self.clients.get(client_id)?;
        if self.supervisor.is_running(client_id) {
            return Err(RelayError::ClientRunning(client_id.to_string()));
        }
        validate_url("target URL", &request.target_url)?;

        client.name = request.name;
        client.description = request.description;
        client.target_url = request.target_url.trim().to_string();
        client.target_timeout_secs = request
            .target_timeout_secs
            .filter(|t| *t > 0)
            .unwrap_or(DEFAULT_TARGET_TIMEOUT_SECS);
        client.script_format = request.script_format;
        client.ignore_events = request.ignore_events;
        client.save_only = request.save_only;
        client.buffer_size = request
            .buffer_size
            .filter(|b| *b > 0)
            .unwrap_or(DEFAULT_BUFFER_SIZE);
        client.updated_at = Utc::now();

        self.clients.update(&client)?;
        info!(client_id, "client updated");
        Ok(client)
    }

    /// Filtered, sorted and paged summaries of the owner's clients.
    ///
    /// `total` counts every match; a page past the end is empty.
    pub fn list_clients_filtered(&self, owner_id: &str, filter: &ClientListFilter) -> ClientPage {
        let mut summaries: Vec<ClientSummary> = self
            .clients
            .list_for_owner(owner_id)
            .iter()
            .map(|c| self.summarize(c))
            .filter(|s| filter.matches(s))
            .collect();

        summaries.sort_by(|a, b| {
            let ord = match filter.sort_by {
                ClientSortField::Name => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
                ClientSortField::Status => a.status.as_str().cmp(b.status.as_str()),
                ClientSortField::CreatedAt => a.created_at.cmp(&b.created_at),
            }
            // Ids are time-ordered, so ties follow creation order.
            .then_with(|| a.id.cmp(&b.id));
            match filter.sort_order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        });

        let total = summaries.len();
        let clients = if filter.page == 0 || filter.page_size == 0 {
            Vec::new()
        } else {
            summaries
                .into_iter()
                .skip((filter.page - 1).saturating_mul(filter.page_size))
                .take(filter.page_size)
                .collect()
        };

        ClientPage {
            total,
            page: filter.page,
            page_size: filter.page_size,
            clients,
        }
    }

    /// Number of the owner's clients whose effective status is `status`.
    pub fn count_clients_by_status(&self, owner_id: &str, status: ProcessStatus) -> usize {
        self.clients
            .list_for_owner(owner_id)
            .iter()
            .filter(|c| self.effective_status(c) == status)
            .count()
    }

    /// Start several clients of one owner. An empty `client_ids` means all
    /// of them.
    pub fn start_clients(&self, owner_id: &str, client_ids: &[String]) -> ClientBatchReport {
        let mut report = ClientBatchReport::default();
        for id in self.batch_targets(owner_id, client_ids) {
            let outcome = self
                .owned_client(owner_id, &id)
                .and_then(|_| self.start_client(&id).map(|_| ()));
            report.push(id, outcome);
        }
        info!(owner_id, total = report.total, failed = report.failed, "batch start finished");
        report
    }

    /// Stop several clients of one owner. An empty `client_ids` means all
    /// of them.
    pub async fn stop_clients(&self, owner_id: &str, client_ids: &[String]) -> ClientBatchReport {
        let mut report = ClientBatchReport::default();
        for id in self.batch_targets(owner_id, client_ids) {
            let outcome = match self.owned_client(owner_id, &id) {
                Ok(_) => self.stop_client(&id).await,
                Err(e) => Err(e),
            };
            report.push(id, outcome);
        }
        info!(owner_id, total = report.total, failed = report.failed, "batch stop finished");
        report
    }

    pub fn client_stats(&self, client_id: &str) -> Result<ClientStats> {
        self.clients.get(client_id)?;

        let total_events = self
            .events
            .list(client_id, &EventQueryFilter::default())?
            .total;
        let today = Utc.from_utc_datetime(&Utc::now().date_naive().and_time(chrono::NaiveTime::MIN));
        let today_events = self
            .events
            .list(
                client_id,
                &EventQueryFilter {
                    date_from: Some(today),
                    ..EventQueryFilter::default()
                },
            )?
            .total;

        let process = self.supervisor.get_process_info(client_id).ok();
        let running_time_secs = process
            .as_ref()
            .filter(|p| p.status == ProcessStatus::Running)
            .map(|p| u64::try_from((Utc::now() - p.started_at).num_seconds()).unwrap_or(0));

        Ok(ClientStats {
            total_events,
            today_events,
            last_event_time: self.events.latest_event_timestamp(client_id)?,
            running_time_secs,
            restart_count: process.map(|p| p.restart_count).unwrap_or(0),
        })
    }

    /// Start the forwarder unless the owner's storage is full.
    pub fn start_client(&self, client_id: &str) -> Result<ProcessInfo> {
        let mut client = self.clients.get(client_id)?;
        self.check_storage(&client.owner_id)?;

        let info = self.supervisor.start(&client)?;
        self.persist_status(&mut client, ProcessStatus::Running);
        Ok(info)
    }

    /// Stop the forwarder; the persisted status becomes `stopped` either way.
    pub async fn stop_client(&self, client_id: &str) -> Result<()> {
        let mut client = self.clients.get(client_id)?;
        let result = self.supervisor.stop(client_id).await;
        self.persist_status(&mut client, ProcessStatus::Stopped);
        result
    }

    pub async fn restart_client(&self, client_id: &str) -> Result<ProcessInfo> {
        let mut client = self.clients.get(client_id)?;
        self.check_storage(&client.owner_id)?;

        let info = self.supervisor.restart(&client).await?;
        self.persist_status(&mut client, ProcessStatus::Running);
        Ok(info)
    }

    /// Stop the forwarder if needed and remove all of the client's data.
    pub async fn delete_client(&self, client_id: &str) -> Result<()> {
        let client = self.clients.get(client_id)?;
        match self.supervisor.stop(client_id).await {
            Ok(()) | Err(RelayError::NotRunning(_)) => {}
            Err(e) => return Err(e),
        }
        self.clients.delete(client_id)?;
        self.quota.invalidate_cache(&client.owner_id);
        info!(client_id, owner_id = %client.owner_id, "client deleted");
        Ok(())
    }

    pub fn client_status(&self, client_id: &str) -> Result<ClientStatus> {
        self.clients.get(client_id)?;
        let process = self.supervisor.get_process_info(client_id).ok();
        let last_activity = self.events.latest_event_timestamp(client_id)?;
        Ok(ClientStatus {
            client_id: client_id.to_string(),
            status: process
                .as_ref()
                .map(|p| p.status)
                .unwrap_or(ProcessStatus::Stopped),
            process,
            last_activity,
        })
    }

    pub fn subscribe_logs(&self, client_id: &str) -> Result<(Vec<String>, LogSubscription)> {
        self.supervisor.subscribe_logs(client_id)
    }

    /// Start every client whose persisted status is `running`.
    ///
    /// Failures are logged and persisted as `error`.
    pub fn resume_clients(&self) -> ClientBatchReport {
        let mut report = ClientBatchReport::default();
        for client in self.clients.list_all() {
            if client.status != ProcessStatus::Running {
                continue;
            }
            let outcome = self.start_client(&client.id).map(|_| ());
            if let Err(e) = &outcome {
                warn!(client_id = %client.id, error = %e, "failed to resume client");
                let mut client = client.clone();
                self.persist_status(&mut client, ProcessStatus::Error);
            }
            report.push(client.id, outcome);
        }
        report
    }

    /// Stop every forwarder, leaving persisted statuses intact for resume.
    pub async fn shutdown(&self) {
        self.supervisor.stop_all().await;
    }

    // ── Events ────────────────────────────────────────────────────────────

    pub fn list_events(&self, client_id: &str, filter: &EventQueryFilter) -> Result<EventPage> {
        self.clients.get(client_id)?;
        self.events.list(client_id, filter)
    }

    pub fn get_event(&self, client_id: &str, event_id: &str) -> Result<Event> {
        self.events.get(client_id, event_id)
    }

    pub fn delete_event(&self, client_id: &str, event_id: &str) -> Result<()> {
        let client = self.clients.get(client_id)?;
        self.events.delete(client_id, event_id)?;
        self.quota.invalidate_cache(&client.owner_id);
        Ok(())
    }

    /// Best-effort batch delete with per-item results.
    pub fn delete_events(&self, client_id: &str, event_ids: &[String]) -> Result<BatchDeleteReport> {
        let client = self.clients.get(client_id)?;
        let report = self.events.delete_batch(client_id, event_ids);
        if report.deleted > 0 {
            self.quota.invalidate_cache(&client.owner_id);
        }
        Ok(report)
    }

    pub async fn replay_event(&self, client_id: &str, event_id: &str) -> Result<ReplayResult> {
        self.replay.replay(client_id, event_id).await
    }

    pub async fn replay_events(
        &self,
        client_id: &str,
        event_ids: &[String],
    ) -> Result<ReplayBatchReport> {
        self.replay.replay_batch(client_id, event_ids).await
    }

    // ── Process logs ──────────────────────────────────────────────────────

    /// One page of the client's captured output for `date` (`YYYY-MM-DD`),
    /// or for today when `date` is `None`.
    pub fn read_logs(
        &self,
        client_id: &str,
        date: Option<&str>,
        page: usize,
        page_size: usize,
        search: Option<&str>,
    ) -> Result<LogPage> {
        let date = date.map(str::to_string).unwrap_or_else(today_string);
        self.logs.read(client_id, &date, page, page_size, search)
    }

    pub fn download_log(&self, client_id: &str, date: &str) -> Result<Vec<u8>> {
        self.logs.download(client_id, date)
    }

    /// Apply the retention window to every client's event partitions and
    /// log files; returns how many of either were removed.
    pub fn sweep_retention(&self, retention_days: u32) -> usize {
        if retention_days == 0 {
            return 0;
        }
        let mut removed = 0;
        let mut touched_owners = Vec::new();
        for client in self.clients.list_all() {
            let events = self.events.cleanup_old_events(&client.id, retention_days);
            let logs = self.logs.cleanup_old_logs(&client.id, retention_days);
            for outcome in [events, logs] {
                match outcome {
                    Ok(0) => {}
                    Ok(n) => {
                        removed += n;
                        if !touched_owners.contains(&client.owner_id) {
                            touched_owners.push(client.owner_id.clone());
                        }
                    }
                    Err(e) => warn!(client_id = %client.id, error = %e, "retention sweep failed"),
                }
            }
        }
        for owner in &touched_owners {
            self.quota.invalidate_cache(owner);
        }
        debug!(removed, retention_days, "retention sweep finished");
        removed
    }

    /// Advisory message once the owner passes the warning threshold.
    pub fn storage_warning(&self, owner_id: &str) -> Option<String> {
        self.quota.storage_warning(owner_id)
    }

    // ── Internal helpers ──────────────────────────────────────────────────

    /// A persisted `error` wins over a stopped process; a live process wins
    /// over everything.
    fn effective_status(&self, client: &ClientConfig) -> ProcessStatus {
        if self.supervisor.is_running(&client.id) {
            return ProcessStatus::Running;
        }
        let crashed = self
            .supervisor
            .get_process_info(&client.id)
            .map(|p| p.status == ProcessStatus::Error)
            .unwrap_or(false);
        if crashed || client.status == ProcessStatus::Error {
            ProcessStatus::Error
        } else {
            ProcessStatus::Stopped
        }
    }

    fn summarize(&self, client: &ClientConfig) -> ClientSummary {
        ClientSummary {
            id: client.id.clone(),
            name: client.name.clone(),
            status: self.effective_status(client),
            source_url: client.source_url.clone(),
            target_url: client.target_url.clone(),
            created_at: client.created_at,
            last_activity: self
                .events
                .latest_event_timestamp(&client.id)
                .ok()
                .flatten(),
        }
    }

    /// Trimmed, de-duplicated ids; every client of the owner when none given.
    fn batch_targets(&self, owner_id: &str, client_ids: &[String]) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for id in client_ids.iter().map(|id| id.trim()).filter(|id| !id.is_empty()) {
            if !ids.iter().any(|seen| seen == id) {
                ids.push(id.to_string());
            }
        }
        if ids.is_empty() {
            ids = self
                .clients
                .list_for_owner(owner_id)
                .into_iter()
                .map(|c| c.id)
                .collect();
        }
        ids
    }

    fn owned_client(&self, owner_id: &str, client_id: &str) -> Result<ClientConfig> {
        let client = self.clients.get(client_id)?;
        if client.owner_id != owner_id {
            return Err(RelayError::NotOwner(client_id.to_string()));
        }
        Ok(client)
    }

    fn check_storage(&self, owner_id: &str) -> Result<()> {
        self.quota.check_storage_quota(owner_id)?;
        if let Some(message) = self.quota.storage_warning(owner_id) {
            warn!(owner_id, "{}", message);
        }
        Ok(())
    }

    fn persist_status(&self, client: &mut ClientConfig, status: ProcessStatus) {
        if client.status == status {
            return;
        }
        client.status = status;
        client.updated_at = Utc::now();
        if let Err(e) = self.clients.update(client) {
            warn!(client_id = %client.id, error = %e, "failed to persist client status");
        }
    }
}

/// Persist a status change reported by the supervisor. The client may
/// already be gone when a crash is reported during deletion.
fn record_status(store: &ClientStore, client_id: &str, status: ProcessStatus) {
    let mut client = match store.get(client_id) {
        Ok(client) => client,
        Err(e) => {
            debug!(client_id, error = %e, "status change for unknown client ignored");
            return;
        }
    };
    if client.status == status {
        return;
    }
    client.status = status;
    client.updated_at = Utc::now();
    match store.update(&client) {
        Ok(()) => info!(client_id, %status, "client status recorded"),
        Err(e) => warn!(client_id, error = %e, "failed to persist client status"),
    }
}

fn today_string() -> String {
    Utc::now().date_naive().format(DAY_DIR_FORMAT).to_string()
}

fn validate_url(what: &str, value: &str) -> Result<()> {
    let url = Url::parse(value.trim())
        .map_err(|e| RelayError::Config(format!("invalid {what} {value:?}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(RelayError::Config(format!(
            "invalid {what} {value:?}: unsupported scheme {other}"
        ))),
    }
}

/// Time-ordered unique client id (hex nanoseconds plus a process-wide counter).
fn generate_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed) & 0xffff;
    format!("{nanos:x}{seq:04x}")
}
