//! Generic append-dedup-retain-notify event log.
//!
//! An `EventLog` owns one persisted collection. Every mutation runs the full
//! read → merge → sort → prune → write cycle under the log's write lock and a
//! store transaction, then queues a change notification once the lock has
//! been released. Reads take no lock and never fail.

use crate::broadcast::{Broadcaster, Observer};
use crate::store::{self, FileStore};
use crate::{query, CollectionKind, CollectionState, Event, Result, TimedEvent, MANUAL_ORIGIN};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};

/// Which events survive a write
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retention {
    /// Keep events whose `created_at + window` is still in the future
    Window(Duration),
    /// Never prune; entries leave only by explicit removal
    KeepAll,
}

impl Retention {
    pub fn retains(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self {
            // A window reaching past the representable range never expires
            Retention::Window(window) => created_at
                .checked_add_signed(*window)
                .map_or(true, |expires| expires > now),
            Retention::KeepAll => true,
        }
    }
}

/// Parameters of the upload cursor query
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncSettings {
    /// Origin tag identifying manually entered events
    pub manual_tag: String,
    /// Cursor fallback distance from now when nothing qualifies
    pub lookback: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            manual_tag: MANUAL_ORIGIN.to_string(),
            lookback: Duration::hours(24),
        }
    }
}

/// A persisted, newest-first, `created_at`-unique collection of events
pub struct EventLog<E: Event> {
    kind: CollectionKind,
    store: Arc<dyn FileStore>,
    broadcaster: Arc<Broadcaster>,
    retention: Retention,
    sync: SyncSettings,
    write_lock: Mutex<()>,
    _events: PhantomData<fn() -> E>,
}

impl<E: Event> EventLog<E> {
    pub fn new(
        kind: CollectionKind,
        store: Arc<dyn FileStore>,
        broadcaster: Arc<Broadcaster>,
        retention: Retention,
    ) -> Self {
        Self {
            kind,
            store,
            broadcaster,
            retention,
            sync: SyncSettings::default(),
            write_lock: Mutex::new(()),
            _events: PhantomData,
        }
    }

    pub fn with_sync_settings(mut self, sync: SyncSettings) -> Self {
        self.sync = sync;
        self
    }

    pub fn kind(&self) -> CollectionKind {
        self.kind
    }

    pub fn retention(&self) -> Retention {
        self.retention
    }

    pub fn sync_settings(&self) -> &SyncSettings {
        &self.sync
    }

    /// Merge `events` into the collection and return the new visible sequence
    pub fn append(&self, events: impl IntoIterator<Item = E>) -> Result<Vec<E>> {
        self.append_at(events, Utc::now())
    }

    /// `append` with retention evaluated against `now`.
    ///
    /// On a `created_at` collision the incoming event replaces the stored one;
    /// within `events`, the last one at a timestamp wins.
    pub fn append_at(&self, events: impl IntoIterator<Item = E>, now: DateTime<Utc>) -> Result<Vec<E>> {
        let visible = self.mutate(|existing| self.merge(existing, events, now))?;
        tracing::debug!("{} now holds {} events", self.kind, visible.len());
        Ok(visible)
    }

    /// Clear the collection, then append `events`, in one critical section
    pub fn replace_all(&self, events: impl IntoIterator<Item = E>, now: DateTime<Utc>) -> Result<Vec<E>> {
        let visible = self.mutate(|_| self.merge(Vec::new(), events, now))?;
        tracing::debug!("Replaced {} with {} events", self.kind, visible.len());
        Ok(visible)
    }

    /// Clear the collection. It stays initialized, reporting `Empty`.
    pub fn remove_all(&self) -> Result<()> {
        self.mutate(|_| Vec::new())?;
        tracing::debug!("Cleared {}", self.kind);
        Ok(())
    }

    /// Drop every event matching `predicate`; returns how many were removed
    pub fn remove_matching<P>(&self, predicate: P) -> Result<usize>
    where
        P: Fn(&E) -> bool,
    {
        let mut removed = 0;
        self.mutate(|existing| {
            let before = existing.len();
            let kept: Vec<E> = existing.into_iter().filter(|event| !predicate(event)).collect();
            removed = before - kept.len();
            kept
        })?;
        tracing::debug!("Removed {} events from {}", removed, self.kind);
        Ok(removed)
    }

    /// Persisted events, newest first. Missing or malformed data reads as
    /// an empty log.
    pub fn recent(&self) -> Vec<E> {
        let mut events: Vec<E> = store::retrieve(self.store.as_ref(), self.kind.key()).unwrap_or_default();
        events.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        events
    }

    pub fn state(&self) -> CollectionState {
        match self.store.get(self.kind.key()) {
            None => CollectionState::Uninitialized,
            Some(bytes) => match serde_json::from_slice::<Vec<E>>(&bytes) {
                Ok(events) if !events.is_empty() => CollectionState::Populated,
                _ => CollectionState::Empty,
            },
        }
    }

    /// Upload cursor at the current time
    pub fn sync_cursor(&self) -> DateTime<Utc> {
        self.sync_cursor_at(Utc::now())
    }

    pub fn sync_cursor_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        query::sync_cursor(&self.recent(), now, &self.sync.manual_tag, self.sync.lookback)
    }

    /// Register an observer of this collection
    pub fn subscribe<O: Observer<E>>(&self, observer: &Arc<O>) {
        self.broadcaster.register::<E, O>(self.kind, observer);
    }

    /// Run one read-modify-write cycle and queue the notification after both
    /// locks are released.
    fn mutate<F>(&self, rewrite: F) -> Result<Vec<E>>
    where
        F: FnOnce(Vec<E>) -> Vec<E>,
    {
        let visible = {
            let _queue = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
            store::with_transaction(self.store.as_ref(), self.kind.key(), |tx| {
                let existing: Vec<E> = store::retrieve(tx, self.kind.key()).unwrap_or_default();
                let updated = rewrite(existing);
                store::save(tx, self.kind.key(), &updated)?;
                Ok(updated)
            })?
        };
        self.broadcaster.notify(self.kind, visible.clone());
        Ok(visible)
    }

    fn merge(&self, existing: Vec<E>, incoming: impl IntoIterator<Item = E>, now: DateTime<Utc>) -> Vec<E> {
        let mut by_time: BTreeMap<DateTime<Utc>, E> = BTreeMap::new();
        for event in existing {
            by_time.insert(event.created_at(), event);
        }

        let mut replaced = 0usize;
        for event in incoming {
            if by_time.insert(event.created_at(), event).is_some() {
                replaced += 1;
            }
        }
        if replaced > 0 {
            tracing::debug!("{}: {} duplicate timestamps replaced by newer writes", self.kind, replaced);
        }

        let total = by_time.len();
        let merged: Vec<E> = by_time
            .into_values()
            .rev()
            .filter(|event| self.retention.retains(event.created_at(), now))
            .collect();
        if merged.len() < total {
            tracing::debug!("{}: pruned {} expired events", self.kind, total - merged.len());
        }
        merged
    }
}

impl<E: TimedEvent> EventLog<E> {
    /// The event in effect now, if any
    pub fn current(&self) -> Option<E> {
        self.current_at(Utc::now())
    }

    pub fn current_at(&self, now: DateTime<Utc>) -> Option<E> {
        query::current(&self.recent(), now).cloned()
    }
}
