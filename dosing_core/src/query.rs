//! Derived views over an ordered event log.
//!
//! Both queries are pure functions of a newest-first slice, as returned by
//! `EventLog::recent`. Nothing is cached.

use crate::{Event, TimedEvent};
use chrono::{DateTime, Duration, Utc};

/// The event in effect at `now`, if any.
///
/// Only the newest event is consulted. An older event never becomes active
/// again once a newer one is recorded, even if the newer one has already
/// expired, so an explicit cancel always wins.
pub fn current<E: TimedEvent>(recent: &[E], now: DateTime<Utc>) -> Option<&E> {
    let newest = recent.first()?;
    if now < newest.ends_at() {
        Some(newest)
    } else {
        None
    }
}

/// Upload cursor: `created_at` of the newest event not entered manually, or
/// `now - lookback` when there is none, clamped to the earliest representable
/// instant.
pub fn sync_cursor<E: Event>(
    recent: &[E],
    now: DateTime<Utc>,
    manual_tag: &str,
    lookback: Duration,
) -> DateTime<Utc> {
    recent
        .iter()
        .find(|event| !event.is_manual(manual_tag))
        .map(|event| event.created_at())
        .unwrap_or_else(|| {
            now.checked_sub_signed(lookback)
                .unwrap_or(DateTime::<Utc>::MIN_UTC)
        })
}
