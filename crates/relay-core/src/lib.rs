//! Shared building blocks for hookrelay.
//!
//! Domain types, the error taxonomy, runtime settings, the on-disk storage
//! layout and timestamp parsing used by every other crate.

pub mod error;
pub mod layout;
pub mod models;
pub mod settings;
pub mod time_utils;
