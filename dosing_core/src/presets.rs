//! Named, reusable event templates.
//!
//! Presets live in their own collection with their own lock and no retention
//! window. Enacting a preset copies it into the live log with a fresh
//! timestamp; the preset itself is never touched.

use crate::broadcast::{Broadcaster, Observer};
use crate::log::{EventLog, Retention};
use crate::store::FileStore;
use crate::{CollectionKind, Event, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub struct PresetCatalog<E: Event> {
    presets: EventLog<E>,
    live: Arc<EventLog<E>>,
}

impl<E: Event> PresetCatalog<E> {
    pub fn new(
        kind: CollectionKind,
        store: Arc<dyn FileStore>,
        broadcaster: Arc<Broadcaster>,
        live: Arc<EventLog<E>>,
    ) -> Self {
        Self {
            presets: EventLog::new(kind, store, broadcaster, Retention::KeepAll),
            live,
        }
    }

    /// Replace the whole catalog with `presets`. This is not a merge: callers
    /// read, modify and resubmit the complete set.
    pub fn save(&self, presets: impl IntoIterator<Item = E>) -> Result<Vec<E>> {
        self.presets.replace_all(presets, Utc::now())
    }

    /// Presets, newest first
    pub fn load(&self) -> Vec<E> {
        self.presets.recent()
    }

    pub fn get(&self, preset_id: &str) -> Option<E> {
        self.load().into_iter().find(|preset| preset.id() == preset_id)
    }

    /// Add one preset to the current set
    pub fn add(&self, preset: E) -> Result<Vec<E>> {
        self.presets.append(vec![preset])
    }

    /// Delete the preset with `preset_id`; returns whether one existed
    pub fn remove(&self, preset_id: &str) -> Result<bool> {
        let removed = self.presets.remove_matching(|preset| preset.id() == preset_id)?;
        Ok(removed > 0)
    }

    /// Stamp the preset with the current time and append it to the live log
    pub fn enact(&self, preset_id: &str) -> Result<Option<E>> {
        self.enact_at(preset_id, Utc::now())
    }

    /// Returns `None`, leaving the live log untouched, when no preset has
    /// `preset_id`.
    pub fn enact_at(&self, preset_id: &str, now: DateTime<Utc>) -> Result<Option<E>> {
        let Some(preset) = self.get(preset_id) else {
            tracing::info!("No preset with id {}, nothing enacted", preset_id);
            return Ok(None);
        };

        let stamped = preset.restamped(now);
        self.live.append_at(vec![stamped.clone()], now)?;
        tracing::info!("Enacted preset {} into {}", preset_id, self.live.kind());
        Ok(Some(stamped))
    }

    pub fn subscribe<O: Observer<E>>(&self, observer: &Arc<O>) {
        self.presets.subscribe(observer);
    }

    pub fn log(&self) -> &EventLog<E> {
        &self.presets
    }
}
