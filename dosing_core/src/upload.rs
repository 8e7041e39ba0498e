//! Read surface for an external uploader.
//!
//! The uploader asks which manual events are still pending, transmits them
//! itself, then acknowledges them here. Acknowledged events are kept in a
//! shadow collection and compared by full equality, so an event re-entered
//! with a different payload counts as new.

use crate::log::EventLog;
use crate::store::{self, FileStore};
use crate::{Event, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub struct UploadTracker<E: Event> {
    live: Arc<EventLog<E>>,
    store: Arc<dyn FileStore>,
    shadow_key: String,
}

impl<E: Event + PartialEq> UploadTracker<E> {
    pub fn new(live: Arc<EventLog<E>>, store: Arc<dyn FileStore>, shadow_key: impl Into<String>) -> Self {
        Self {
            live,
            store,
            shadow_key: shadow_key.into(),
        }
    }

    /// Events already acknowledged by the uploader
    pub fn uploaded(&self) -> Vec<E> {
        store::retrieve(self.store.as_ref(), &self.shadow_key).unwrap_or_default()
    }

    /// Manual events in the live log that were never acknowledged. Order is
    /// unspecified.
    ///
    /// Only events whose origin equals the manual tag exactly qualify, unlike
    /// the substring match of the sync cursor.
    pub fn unsynced_manual_events(&self) -> Vec<E> {
        let uploaded = self.uploaded();
        let manual_tag = self.live.sync_settings().manual_tag.as_str();

        let mut pending: Vec<E> = Vec::new();
        for event in self.live.recent() {
            let entered_here = event.entered_by() == Some(manual_tag);
            if entered_here && !uploaded.contains(&event) && !pending.contains(&event) {
                pending.push(event);
            }
        }
        pending
    }

    /// Record `events` as transmitted; returns how many were new
    pub fn mark_uploaded(&self, events: impl IntoIterator<Item = E>) -> Result<usize> {
        self.mark_uploaded_at(events, Utc::now())
    }

    /// Entries older than the live log's retention window are dropped from
    /// the shadow collection, since they can no longer be pending.
    pub fn mark_uploaded_at(&self, events: impl IntoIterator<Item = E>, now: DateTime<Utc>) -> Result<usize> {
        let retention = self.live.retention();
        let added = store::with_transaction(self.store.as_ref(), &self.shadow_key, |tx| {
            let mut shadow: Vec<E> = store::retrieve(tx, &self.shadow_key).unwrap_or_default();
            let mut added = 0;
            for event in events {
                if !shadow.contains(&event) {
                    shadow.push(event);
                    added += 1;
                }
            }
            shadow.retain(|event| retention.retains(event.created_at(), now));
            store::save(tx, &self.shadow_key, &shadow)?;
            Ok(added)
        })?;

        tracing::debug!("Marked {} events of {} as uploaded", added, self.live.kind());
        Ok(added)
    }

    /// Forget every acknowledgement so all manual events are pending again
    pub fn reset(&self) -> Result<()> {
        self.store.remove(&self.shadow_key)?;
        tracing::info!("Cleared upload history for {}", self.live.kind());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Broadcaster;
    use crate::log::Retention;
    use crate::store::MemoryStore;
    use crate::{CollectionKind, TempTarget, MANUAL_ORIGIN, UPLOADED_TEMP_TARGETS_KEY};
    use chrono::Duration;

    fn tracker() -> (Arc<EventLog<TempTarget>>, UploadTracker<TempTarget>) {
        let store: Arc<dyn FileStore> = Arc::new(MemoryStore::new());
        let live = Arc::new(EventLog::new(
            CollectionKind::TempTargets,
            Arc::clone(&store),
            Arc::new(Broadcaster::new().unwrap()),
            Retention::Window(Duration::hours(24)),
        ));
        let tracker = UploadTracker::new(Arc::clone(&live), store, UPLOADED_TEMP_TARGETS_KEY);
        (live, tracker)
    }

    fn manual(minutes_ago: i64) -> TempTarget {
        TempTarget::manual(None, 100.0, 120.0, 30.0, Utc::now() - Duration::minutes(minutes_ago))
    }

    #[test]
    fn test_pending_contains_only_manual_events() {
        let (live, tracker) = tracker();
        let mine = manual(10);
        let remote = TempTarget {
            entered_by: Some("nightscout".into()),
            ..manual(20)
        };
        live.append(vec![mine.clone(), remote]).unwrap();

        assert_eq!(tracker.unsynced_manual_events(), vec![mine]);
    }

    #[test]
    fn test_pending_requires_exact_manual_origin() {
        let (live, tracker) = tracker();
        let mine = manual(10);
        let relayed = TempTarget {
            entered_by: Some(format!("{} via nightscout", MANUAL_ORIGIN)),
            ..manual(20)
        };
        live.append(vec![mine.clone(), relayed]).unwrap();

        assert_eq!(tracker.unsynced_manual_events(), vec![mine]);
    }

    #[test]
    fn test_acknowledged_events_are_not_pending() {
        let (live, tracker) = tracker();
        let first = manual(10);
        let second = manual(5);
        live.append(vec![first.clone(), second.clone()]).unwrap();

        assert_eq!(tracker.mark_uploaded(vec![first]).unwrap(), 1);
        assert_eq!(tracker.unsynced_manual_events(), vec![second.clone()]);

        assert_eq!(tracker.mark_uploaded(vec![second]).unwrap(), 1);
        assert!(tracker.unsynced_manual_events().is_empty());
    }

    #[test]
    fn test_changed_payload_is_pending_again() {
        let (live, tracker) = tracker();
        let original = manual(10);
        live.append(vec![original.clone()]).unwrap();
        tracker.mark_uploaded(vec![original.clone()]).unwrap();

        let edited = TempTarget {
            target_top: Some(180.0),
            ..original
        };
        live.append(vec![edited.clone()]).unwrap();
        assert_eq!(tracker.unsynced_manual_events(), vec![edited]);
    }

    #[test]
    fn test_mark_uploaded_is_idempotent() {
        let (live, tracker) = tracker();
        let event = manual(3);
        live.append(vec![event.clone()]).unwrap();

        assert_eq!(tracker.mark_uploaded(vec![event.clone()]).unwrap(), 1);
        assert_eq!(tracker.mark_uploaded(vec![event]).unwrap(), 0);
        assert_eq!(tracker.uploaded().len(), 1);
    }

    #[test]
    fn test_shadow_pruned_outside_window() {
        let (_live, tracker) = tracker();
        let now = Utc::now();
        let old = TempTarget::manual(None, 100.0, 120.0, 30.0, now - Duration::hours(30));
        tracker.mark_uploaded_at(vec![old], now - Duration::hours(29)).unwrap();
        assert_eq!(tracker.uploaded().len(), 1);

        tracker.mark_uploaded_at(Vec::new(), now).unwrap();
        assert!(tracker.uploaded().is_empty());
    }

    #[test]
    fn test_reset_makes_everything_pending() {
        let (live, tracker) = tracker();
        let event = manual(1);
        live.append(vec![event.clone()]).unwrap();
        tracker.mark_uploaded(vec![event.clone()]).unwrap();

        tracker.reset().unwrap();
        assert_eq!(tracker.unsynced_manual_events(), vec![event]);
    }
}
