//! Per-owner storage and client-count accounting with a TTL cache.
//!
//! Walking an owner's tree is expensive, so [`QuotaEstimator::get_quota`]
//! serves a cached [`QuotaSnapshot`] until it expires. Anything that changes
//! an owner's footprint should call [`QuotaEstimator::invalidate_cache`].

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use relay_core::error::{RelayError, Result};
use relay_core::layout::StorageLayout;
use relay_core::models::QuotaSnapshot;
use tracing::debug;

/// Default snapshot lifetime.
pub const DEFAULT_QUOTA_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Static caps applied to every owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimits {
    pub max_storage_bytes: u64,
    pub max_clients: usize,
}

#[derive(Debug, Clone)]
struct CachedQuota {
    snapshot: QuotaSnapshot,
    fetched_at: Instant,
}

/// Computes and caches [`QuotaSnapshot`]s.
#[derive(Debug)]
pub struct QuotaEstimator {
    layout: StorageLayout,
    limits: QuotaLimits,
    cache_ttl: Duration,
    cache: Mutex<HashMap<String, CachedQuota>>,
}

impl QuotaEstimator {
    pub fn new(layout: StorageLayout, limits: QuotaLimits, cache_ttl: Duration) -> Self {
        Self {
            layout,
            limits,
            cache_ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn lock_cache(&self) -> MutexGuard<'_, HashMap<String, CachedQuota>> {
        // Entries are replaced whole, so a poisoned map is still consistent.
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Public API ────────────────────────────────────────────────────────

    /// Sum of file sizes under the owner's whole subtree.
    ///
    /// Files that disappear mid-walk are ignored; an absent owner uses zero.
    pub fn calculate_usage(&self, owner_id: &str) -> u64 {
        let owner_dir = self.layout.owner_dir(owner_id);
        if !owner_dir.is_dir() {
            return 0;
        }

        walkdir::WalkDir::new(&owner_dir)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(e) => Some(e),
                Err(err) => {
                    debug!(owner_id, error = %err, "skipping unreadable entry during usage walk");
                    None
                }
            })
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum()
    }

    /// Number of client directories the owner has.
    pub fn count_clients(&self, owner_id: &str) -> usize {
        match std::fs::read_dir(self.layout.clients_dir(owner_id)) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
                .count(),
            Err(_) => 0,
        }
    }

    /// Cached snapshot, recomputed once older than the TTL.
    pub fn get_quota(&self, owner_id: &str) -> QuotaSnapshot {
        if let Some(cached) = self.cached(owner_id) {
            return cached;
        }

        let used = self.calculate_usage(owner_id);
        let clients = self.count_clients(owner_id);
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.cache_ttl).unwrap_or_else(|_| chrono::Duration::days(1));
        let snapshot = QuotaSnapshot::new(
            owner_id,
            self.limits.max_storage_bytes,
            self.limits.max_clients,
            used,
            clients,
            expires_at,
        );

        debug!(
            owner_id,
            used_bytes = used,
            clients,
            percentage = snapshot.percentage,
            "quota recomputed"
        );

        self.lock_cache().insert(
            owner_id.to_string(),
            CachedQuota {
                snapshot: snapshot.clone(),
                fetched_at: Instant::now(),
            },
        );
        snapshot
    }

    /// Forget the cached snapshot for `owner_id`.
    pub fn invalidate_cache(&self, owner_id: &str) {
        if self.lock_cache().remove(owner_id).is_some() {
            debug!(owner_id, "quota cache invalidated");
        }
    }

    /// `QuotaExceeded` when the owner already has the maximum client count.
    pub fn check_can_create_client(&self, owner_id: &str) -> Result<()> {
        let quota = self.get_quota(owner_id);
        if quota.can_create_client() {
            Ok(())
        } else {
            Err(RelayError::QuotaExceeded(format!(
                "client limit reached ({}/{})",
                quota.clients_count, quota.max_clients
            )))
        }
    }

    /// `QuotaExceeded` once storage usage reaches 100 %.
    pub fn check_storage_quota(&self, owner_id: &str) -> Result<()> {
        let quota = self.get_quota(owner_id);
        if quota.is_storage_full() {
            Err(RelayError::QuotaExceeded(format!(
                "storage full ({:.1}% of {} bytes used)",
                quota.percentage, quota.total_bytes
            )))
        } else {
            Ok(())
        }
    }

    /// Advisory message once usage reaches the warning threshold.
    pub fn storage_warning(&self, owner_id: &str) -> Option<String> {
        let quota = self.get_quota(owner_id);
        quota.is_storage_warning().then(|| {
            format!(
                "storage usage at {:.1}% ({} of {} bytes)",
                quota.percentage, quota.used_bytes, quota.total_bytes
            )
        })
    }

    fn cached(&self, owner_id: &str) -> Option<QuotaSnapshot> {
        self.lock_cache()
            .get(owner_id)
            .filter(|c| c.fetched_at.elapsed() < self.cache_ttl)
            .map(|c| c.snapshot.clone())
    }
}
