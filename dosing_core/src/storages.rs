//! Composition root: wires the store, broadcaster and every event stream
//! together at process start.

use crate::broadcast::Broadcaster;
use crate::log::{EventLog, Retention};
use crate::presets::PresetCatalog;
use crate::store::{FileStore, JsonFileStore};
use crate::upload::UploadTracker;
use crate::{CarbsEntry, CollectionKind, Config, Result, TempTarget, UPLOADED_TEMP_TARGETS_KEY};
use std::path::Path;
use std::sync::Arc;

/// Every storage the application reads and writes
pub struct Storages {
    pub store: Arc<dyn FileStore>,
    pub broadcaster: Arc<Broadcaster>,
    pub temp_targets: Arc<EventLog<TempTarget>>,
    pub presets: PresetCatalog<TempTarget>,
    pub carbs: Arc<EventLog<CarbsEntry>>,
    pub uploads: UploadTracker<TempTarget>,
}

impl Storages {
    /// Open the file-backed store under `config.data.data_dir`
    pub fn open(config: &Config) -> Result<Self> {
        Self::open_in(&config.data.data_dir, config)
    }

    /// Open the file-backed store under `data_dir`, other settings from `config`
    pub fn open_in(data_dir: &Path, config: &Config) -> Result<Self> {
        let store: Arc<dyn FileStore> = Arc::new(JsonFileStore::open(data_dir)?);
        Self::with_store(store, config)
    }

    /// Build every storage on top of an existing store
    pub fn with_store(store: Arc<dyn FileStore>, config: &Config) -> Result<Self> {
        config.validate()?;
        let broadcaster = Arc::new(Broadcaster::new()?);
        let live_retention = Retention::Window(config.live_window());

        let temp_targets = Arc::new(
            EventLog::new(
                CollectionKind::TempTargets,
                Arc::clone(&store),
                Arc::clone(&broadcaster),
                live_retention,
            )
            .with_sync_settings(config.sync_settings()),
        );
        let carbs = Arc::new(
            EventLog::new(
                CollectionKind::Carbs,
                Arc::clone(&store),
                Arc::clone(&broadcaster),
                live_retention,
            )
            .with_sync_settings(config.sync_settings()),
        );
        let presets = PresetCatalog::new(
            CollectionKind::TempTargetPresets,
            Arc::clone(&store),
            Arc::clone(&broadcaster),
            Arc::clone(&temp_targets),
        );
        let uploads = UploadTracker::new(
            Arc::clone(&temp_targets),
            Arc::clone(&store),
            UPLOADED_TEMP_TARGETS_KEY,
        );

        Ok(Self {
            store,
            broadcaster,
            temp_targets,
            presets,
            carbs,
            uploads,
        })
    }
}
