//! Change notification fan-out for persisted collections.
//!
//! Observers register per `CollectionKind` and are held weakly: dropping the
//! last strong reference to an observer unregisters it. Notifications are
//! queued by the writer and delivered on a single dispatch thread, in
//! registration order, so an observer that re-reads or writes the same
//! collection never runs while the writer still holds its lock.

use crate::{CollectionKind, Event, Result};
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle, ThreadId};

/// Receives the new visible sequence of a collection after each write.
///
/// Implementations should enqueue and return; they run on the shared
/// dispatch thread and delay every other observer while they block.
pub trait Observer<E>: Send + Sync + 'static {
    fn on_collection_changed(&self, kind: CollectionKind, events: &[E]);
}

type Payload = Arc<dyn Any + Send + Sync>;

struct Subscriber {
    id: u64,
    is_alive: Box<dyn Fn() -> bool + Send + Sync>,
    /// Returns false once the observer has been dropped
    deliver: Box<dyn Fn(CollectionKind, &(dyn Any + Send + Sync)) -> bool + Send + Sync>,
}

type Registry = HashMap<CollectionKind, Vec<Arc<Subscriber>>>;

enum Message {
    Deliver { kind: CollectionKind, payload: Payload },
    Flush(Sender<()>),
}

/// Typed observer registry with a dedicated dispatch thread
pub struct Broadcaster {
    registry: Arc<Mutex<Registry>>,
    sender: Mutex<Option<Sender<Message>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
    next_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Broadcaster {
    /// Start the dispatch thread
    pub fn new() -> Result<Self> {
        let registry: Arc<Mutex<Registry>> = Arc::default();
        let (sender, receiver) = mpsc::channel();

        let worker_registry = Arc::clone(&registry);
        let worker = thread::Builder::new()
            .name("dosing-broadcaster".into())
            .spawn(move || dispatch_loop(worker_registry, receiver))?;

        Ok(Self {
            registry,
            sender: Mutex::new(Some(sender)),
            worker_id: worker.thread().id(),
            worker: Mutex::new(Some(worker)),
            next_id: AtomicU64::new(0),
        })
    }

    /// Register `observer` for changes to `kind`. Only a weak reference is
    /// kept; the registration ends when the observer is dropped.
    pub fn register<E, O>(&self, kind: CollectionKind, observer: &Arc<O>)
    where
        E: Event,
        O: Observer<E>,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let liveness: Weak<O> = Arc::downgrade(observer);
        let target: Weak<O> = Arc::downgrade(observer);

        let subscriber = Subscriber {
            id,
            is_alive: Box::new(move || liveness.strong_count() > 0),
            deliver: Box::new(move |kind: CollectionKind, payload: &(dyn Any + Send + Sync)| {
                let Some(observer) = target.upgrade() else {
                    return false;
                };
                match payload.downcast_ref::<Vec<E>>() {
                    Some(events) => observer.on_collection_changed(kind, events),
                    None => tracing::warn!("Observer {} of {} expects another event type", id, kind),
                }
                true
            }),
        };

        lock(&self.registry)
            .entry(kind)
            .or_default()
            .push(Arc::new(subscriber));
        tracing::debug!("Registered observer {} for {}", id, kind);
    }

    /// Queue `events` for delivery to the observers of `kind`. Never blocks
    /// on observers.
    pub fn notify<E: Event>(&self, kind: CollectionKind, events: Vec<E>) {
        let payload: Payload = Arc::new(events);
        self.send(Message::Deliver { kind, payload });
    }

    /// Block until every notification queued before this call was delivered.
    /// Returns immediately when called from an observer callback.
    pub fn flush(&self) {
        if thread::current().id() == self.worker_id {
            return;
        }
        let (done, wait) = mpsc::channel();
        if self.send(Message::Flush(done)) {
            let _ = wait.recv();
        }
    }

    /// Number of live observers registered for `kind`
    pub fn observer_count(&self, kind: CollectionKind) -> usize {
        lock(&self.registry)
            .get(&kind)
            .map(|subscribers| subscribers.iter().filter(|s| (s.is_alive)()).count())
            .unwrap_or(0)
    }

    fn send(&self, message: Message) -> bool {
        match lock(&self.sender).as_ref() {
            Some(sender) => sender.send(message).is_ok(),
            None => false,
        }
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain the queue and exit
        lock(&self.sender).take();
        if thread::current().id() == self.worker_id {
            return;
        }
        if let Some(worker) = lock(&self.worker).take() {
            if worker.join().is_err() {
                tracing::error!("Broadcaster dispatch thread panicked");
            }
        }
    }
}

fn dispatch_loop(registry: Arc<Mutex<Registry>>, receiver: Receiver<Message>) {
    for message in receiver {
        match message {
            Message::Deliver { kind, payload } => deliver(&registry, kind, payload.as_ref()),
            Message::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("Broadcaster dispatch thread stopped");
}

fn deliver(registry: &Mutex<Registry>, kind: CollectionKind, payload: &(dyn Any + Send + Sync)) {
    // Snapshot so observers may register while being notified
    let subscribers = lock(registry).get(&kind).cloned().unwrap_or_default();

    let mut dropped = Vec::new();
    for subscriber in &subscribers {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (subscriber.deliver)(kind, payload)));
        match outcome {
            Ok(true) => {}
            Ok(false) => dropped.push(subscriber.id),
            Err(_) => tracing::error!("Observer {} of {} panicked", subscriber.id, kind),
        }
    }

    if !dropped.is_empty() {
        if let Some(list) = lock(registry).get_mut(&kind) {
            list.retain(|s| !dropped.contains(&s.id));
        }
        tracing::debug!("Unregistered {} dropped observers of {}", dropped.len(), kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CarbsEntry;
    use chrono::Utc;
    use std::time::Duration;

    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<(&'static str, usize, ThreadId)>>>,
    }

    impl Observer<CarbsEntry> for Recorder {
        fn on_collection_changed(&self, _kind: CollectionKind, events: &[CarbsEntry]) {
            lock(&self.log).push((self.label, events.len(), thread::current().id()));
        }
    }

    struct Panicker;

    impl Observer<CarbsEntry> for Panicker {
        fn on_collection_changed(&self, _kind: CollectionKind, _events: &[CarbsEntry]) {
            panic!("observer failure");
        }
    }

    fn carbs(n: usize) -> Vec<CarbsEntry> {
        (0..n)
            .map(|i| CarbsEntry::manual(10.0, Utc::now() - chrono::Duration::minutes(i as i64)))
            .collect()
    }

    #[test]
    fn test_delivers_in_registration_order_off_caller_thread() {
        let broadcaster = Broadcaster::new().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::new(Recorder { label: "first", log: Arc::clone(&log) });
        let second = Arc::new(Recorder { label: "second", log: Arc::clone(&log) });

        broadcaster.register::<CarbsEntry, _>(CollectionKind::Carbs, &first);
        broadcaster.register::<CarbsEntry, _>(CollectionKind::Carbs, &second);
        broadcaster.notify(CollectionKind::Carbs, carbs(3));
        broadcaster.flush();

        let entries = lock(&log).clone();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "first");
        assert_eq!(entries[1].0, "second");
        assert_eq!(entries[0].1, 3);
        assert_ne!(entries[0].2, thread::current().id());
    }

    #[test]
    fn test_only_matching_kind_is_notified() {
        let broadcaster = Broadcaster::new().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let observer = Arc::new(Recorder { label: "carbs", log: Arc::clone(&log) });

        broadcaster.register::<CarbsEntry, _>(CollectionKind::Carbs, &observer);
        broadcaster.notify(CollectionKind::TempTargets, carbs(1));
        broadcaster.flush();

        assert!(lock(&log).is_empty());
    }

    #[test]
    fn test_dropped_observer_is_unregistered() {
        let broadcaster = Broadcaster::new().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let observer = Arc::new(Recorder { label: "gone", log: Arc::clone(&log) });

        broadcaster.register::<CarbsEntry, _>(CollectionKind::Carbs, &observer);
        assert_eq!(broadcaster.observer_count(CollectionKind::Carbs), 1);

        drop(observer);
        assert_eq!(broadcaster.observer_count(CollectionKind::Carbs), 0);

        broadcaster.notify(CollectionKind::Carbs, carbs(1));
        broadcaster.flush();
        assert!(lock(&log).is_empty());
    }

    #[test]
    fn test_panicking_observer_does_not_stop_others() {
        let broadcaster = Broadcaster::new().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let panicker = Arc::new(Panicker);
        let recorder = Arc::new(Recorder { label: "after", log: Arc::clone(&log) });

        broadcaster.register::<CarbsEntry, _>(CollectionKind::Carbs, &panicker);
        broadcaster.register::<CarbsEntry, _>(CollectionKind::Carbs, &recorder);
        broadcaster.notify(CollectionKind::Carbs, carbs(2));
        broadcaster.notify(CollectionKind::Carbs, carbs(1));
        broadcaster.flush();

        let entries = lock(&log).clone();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].1, 1);
    }

    #[test]
    fn test_drop_drains_queue() {
        let (tx, rx) = mpsc::channel();
        struct Forward(Mutex<Sender<usize>>);
        impl Observer<CarbsEntry> for Forward {
            fn on_collection_changed(&self, _kind: CollectionKind, events: &[CarbsEntry]) {
                let _ = lock(&self.0).send(events.len());
            }
        }

        let observer = Arc::new(Forward(Mutex::new(tx)));
        {
            let broadcaster = Broadcaster::new().unwrap();
            broadcaster.register::<CarbsEntry, _>(CollectionKind::Carbs, &observer);
            broadcaster.notify(CollectionKind::Carbs, carbs(4));
        }

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 4);
    }
}
