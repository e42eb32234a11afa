//! Runtime services for hookrelay.
//!
//! Supervises forwarder processes, fans their output out to log
//! subscribers, replays stored events and wires everything behind
//! [`manager::ClientManager`].

pub mod log_hub;
pub mod manager;
pub mod replay;
pub mod supervisor;

pub use relay_core as core;
pub use relay_data as data;
