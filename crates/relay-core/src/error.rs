use std::path::PathBuf;
use thiserror::Error;

/// All errors produced by the relay crates.
#[derive(Error, Debug)]
pub enum RelayError {
    /// No stored event with this id exists for the client.
    #[error("Event not found: {0}")]
    EventNotFound(String),

    /// No client with this id is known.
    #[error("Client not found: {0}")]
    ClientNotFound(String),

    /// A client with this id already has a stored configuration.
    #[error("Client already exists: {0}")]
    ClientExists(String),

    /// A live process is already registered for the client.
    #[error("Client already running: {0}")]
    AlreadyRunning(String),

    /// The operation needs the client's process to be stopped first.
    #[error("Client is running, stop it first: {0}")]
    ClientRunning(String),

    /// The client exists but belongs to a different owner.
    #[error("Client does not belong to current owner: {0}")]
    NotOwner(String),

    /// No live process is registered for the client.
    #[error("Client not running: {0}")]
    NotRunning(String),

    /// The owner has reached the client-count or storage cap.
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The forwarder executable could not be launched.
    #[error("Failed to spawn forwarder for client {client_id}: {source}")]
    ProcessSpawn {
        client_id: String,
        #[source]
        source: std::io::Error,
    },

    /// Some items of a batch operation failed.
    #[error("Batch partially failed: {failed} of {total} items failed")]
    PartialBatchFailure { failed: usize, total: usize },

    /// A file could not be opened or read from disk.
    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A JSON document could not be parsed.
    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// A timestamp string did not match any recognised format.
    #[error("Invalid timestamp format: {0}")]
    TimestampParse(String),

    /// A configuration value is missing or invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Pass-through for any raw I/O error that does not carry a path.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// `true` for the "absent" family: missing events and missing clients.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RelayError::EventNotFound(_) | RelayError::ClientNotFound(_)
        )
    }
}

/// Convenience alias used throughout the relay crates.
pub type Result<T> = std::result::Result<T, RelayError>;
