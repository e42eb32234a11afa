//! Filesystem layer for hookrelay.
//!
//! Reads the event files forwarders write (tolerating every historical
//! shape), measures per-owner storage, persists client configuration and
//! keeps the daily capture files of forwarder output.

pub mod client_store;
pub mod decoder;
pub mod event_store;
pub mod log_store;
pub mod quota;
pub mod script;

pub use relay_core as core;
