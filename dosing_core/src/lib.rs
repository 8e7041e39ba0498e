#![forbid(unsafe_code)]

//! Event-log storage for clinical data streams of a closed-loop dosing
//! controller.
//!
//! This crate provides:
//! - Domain events (temporary targets, carb entries) and collection identities
//! - A transactional blob store (file-backed and in-memory)
//! - The generic append-dedup-retain event log and its derived queries
//! - A non-expiring preset catalog
//! - Change broadcasting to observers
//! - The uploader-facing pending/acknowledge surface
//! - Configuration, logging and CSV export

pub mod types;
pub mod error;
pub mod config;
pub mod logging;
pub mod store;
pub mod broadcast;
pub mod query;
pub mod log;
pub mod presets;
pub mod upload;
pub mod export;
pub mod storages;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use config::Config;
pub use store::{FileStore, JsonFileStore, MemoryStore};
pub use broadcast::{Broadcaster, Observer};
pub use log::{EventLog, Retention, SyncSettings};
pub use presets::PresetCatalog;
pub use upload::UploadTracker;
pub use storages::Storages;
