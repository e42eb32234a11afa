//! Persistence of per-client configuration as `config.json`.

use std::path::Path;

use relay_core::error::{RelayError, Result};
use relay_core::layout::{StorageLayout, CONFIG_FILE, EVENTS_DIR, LOGS_DIR};
use relay_core::models::ClientConfig;
use tracing::{debug, warn};

/// File-backed client configuration repository.
#[derive(Debug, Clone)]
pub struct ClientStore {
    layout: StorageLayout,
}

impl ClientStore {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    /// Persist a new client and create its `events/` and `logs/` directories.
    pub fn create(&self, client: &ClientConfig) -> Result<()> {
        validate_id("owner id", &client.owner_id)?;
        validate_id("client id", &client.id)?;

        let config_path = self.layout.config_path(&client.owner_id, &client.id);
        if config_path.exists() {
            return Err(RelayError::ClientExists(client.id.clone()));
        }

        let client_dir = self.layout.client_dir(&client.owner_id, &client.id);
        std::fs::create_dir_all(client_dir.join(EVENTS_DIR))?;
        std::fs::create_dir_all(client_dir.join(LOGS_DIR))?;

        write_config(&config_path, client)?;
        debug!(client_id = %client.id, owner_id = %client.owner_id, "client config created");
        Ok(())
    }

    /// Look a client up across every owner.
    pub fn get(&self, client_id: &str) -> Result<ClientConfig> {
        let owner = self
            .layout
            .find_owner(client_id)
            .ok_or_else(|| RelayError::ClientNotFound(client_id.to_string()))?;
        let path = self.layout.config_path(&owner, client_id);
        read_config(&path).map_err(|e| match e {
            RelayError::FileRead { ref source, .. }
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                RelayError::ClientNotFound(client_id.to_string())
            }
            other => other,
        })
    }

    /// All clients of one owner, oldest first. Unreadable configs are skipped.
    pub fn list_for_owner(&self, owner_id: &str) -> Vec<ClientConfig> {
        let clients_dir = self.layout.clients_dir(owner_id);
        let entries = match std::fs::read_dir(&clients_dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut clients: Vec<ClientConfig> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|e| {
                let path = e.path().join(CONFIG_FILE);
                match read_config(&path) {
                    Ok(client) => Some(client),
                    Err(err) => {
                        warn!("Skipping client config {}: {}", path.display(), err);
                        None
                    }
                }
            })
            .collect();

        clients.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        clients
    }

    /// Every client of every owner.
    pub fn list_all(&self) -> Vec<ClientConfig> {
        self.layout
            .owner_ids()
            .iter()
            .flat_map(|owner| self.list_for_owner(owner))
            .collect()
    }

    /// Overwrite an existing client's configuration.
    pub fn update(&self, client: &ClientConfig) -> Result<()> {
        validate_id("client id", &client.id)?;
        let config_path = self.layout.config_path(&client.owner_id, &client.id);
        if !config_path.is_file() {
            return Err(RelayError::ClientNotFound(client.id.clone()));
        }
        write_config(&config_path, client)
    }

    /// Remove the client directory with all its events and logs.
    pub fn delete(&self, client_id: &str) -> Result<ClientConfig> {
        let client = self.get(client_id)?;
        let client_dir = self.layout.client_dir(&client.owner_id, client_id);
        std::fs::remove_dir_all(&client_dir)?;
        debug!(client_id, "client directory removed");
        Ok(client)
    }
}

fn validate_id(what: &str, id: &str) -> Result<()> {
    if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\']) {
        return Err(RelayError::Config(format!("invalid {what}: {id:?}")));
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<ClientConfig> {
    let data = std::fs::read(path).map_err(|source| RelayError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_slice(&data)?)
}

/// Write via a temp file and rename so readers never see a torn config.
fn write_config(path: &Path, client: &ClientConfig) -> Result<()> {
    let json = serde_json::to_string_pretty(client)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
