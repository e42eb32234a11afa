//! On-disk layout shared by the forwarder, the event store and the quota
//! estimator.
//!
//! ```text
//! <data>/users/<owner>/clients/<client>/config.json
//!                                      /events/[YYYY-MM-DD/]<id>.json
//!                                      /logs/YYYY-MM-DD.log
//! ```

use std::path::{Path, PathBuf};

pub const USERS_DIR: &str = "users";
pub const CLIENTS_DIR: &str = "clients";
pub const EVENTS_DIR: &str = "events";
pub const LOGS_DIR: &str = "logs";
pub const CONFIG_FILE: &str = "config.json";
pub const LOG_FILE_EXT: &str = "log";

/// Path builder rooted at the data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    base_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn users_dir(&self) -> PathBuf {
        self.base_dir.join(USERS_DIR)
    }

    /// Everything an owner stores; the quota estimator sums this subtree.
    pub fn owner_dir(&self, owner_id: &str) -> PathBuf {
        self.users_dir().join(owner_id)
    }

    pub fn clients_dir(&self, owner_id: &str) -> PathBuf {
        self.owner_dir(owner_id).join(CLIENTS_DIR)
    }

    pub fn client_dir(&self, owner_id: &str, client_id: &str) -> PathBuf {
        self.clients_dir(owner_id).join(client_id)
    }

    pub fn events_dir(&self, owner_id: &str, client_id: &str) -> PathBuf {
        self.client_dir(owner_id, client_id).join(EVENTS_DIR)
    }

    pub fn logs_dir(&self, owner_id: &str, client_id: &str) -> PathBuf {
        self.client_dir(owner_id, client_id).join(LOGS_DIR)
    }

    /// Daily capture file of a client's forwarder output.
    pub fn log_file(&self, owner_id: &str, client_id: &str, date: chrono::NaiveDate) -> PathBuf {
        self.logs_dir(owner_id, client_id).join(format!(
            "{}.{}",
            date.format(crate::time_utils::DAY_DIR_FORMAT),
            LOG_FILE_EXT
        ))
    }

    pub fn config_path(&self, owner_id: &str, client_id: &str) -> PathBuf {
        self.client_dir(owner_id, client_id).join(CONFIG_FILE)
    }

    /// Owner ids with a directory under `users/`, sorted.
    pub fn owner_ids(&self) -> Vec<String> {
        let mut owners: Vec<String> = match std::fs::read_dir(self.users_dir()) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
                .filter_map(|e| e.file_name().to_str().map(str::to_string))
                .collect(),
            Err(_) => Vec::new(),
        };
        owners.sort();
        owners
    }

    /// Locate the owner of `client_id` by probing every owner directory.
    ///
    /// Client ids are unique across owners, so the first hit wins.
    pub fn find_owner(&self, client_id: &str) -> Option<String> {
        if client_id.is_empty() || client_id.contains(['/', '\\']) || client_id == ".." {
            return None;
        }
        self.owner_ids()
            .into_iter()
            .find(|owner| self.client_dir(owner, client_id).is_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_paths() {
        let layout = StorageLayout::new("/data");
        assert_eq!(
            layout.events_dir("u1", "c1"),
            PathBuf::from("/data/users/u1/clients/c1/events")
        );
        assert_eq!(
            layout.config_path("u1", "c1"),
            PathBuf::from("/data/users/u1/clients/c1/config.json")
        );
        let day = chrono::NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(
            layout.log_file("u1", "c1", day),
            PathBuf::from("/data/users/u1/clients/c1/logs/2024-03-09.log")
        );
    }

    #[test]
    fn test_find_owner() {
        let dir = TempDir::new().unwrap();
        let layout = StorageLayout::new(dir.path());
        std::fs::create_dir_all(layout.client_dir("alice", "c1")).unwrap();
        std::fs::create_dir_all(layout.client_dir("bob", "c2")).unwrap();

        assert_eq!(layout.find_owner("c2").as_deref(), Some("bob"));
        assert_eq!(layout.find_owner("missing"), None);
        assert_eq!(layout.find_owner("../etc"), None);
        assert_eq!(layout.owner_ids(), vec!["alice", "bob"]);
    }

    #[test]
    fn test_owner_ids_missing_base() {
        let layout = StorageLayout::new("/tmp/does-not-exist-relay-layout-xyz");
        assert!(layout.owner_ids().is_empty());
    }
}
