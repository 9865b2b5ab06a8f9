//! Ordered delivery of catalog events
//!
//! Batches are queued while the catalog gate is held, so queue order is
//! commit order. Delivery happens after the gate is released: the first
//! thread to call [`EventNotifier::flush`] becomes the drainer and delivers
//! every queued event, including batches committed by other threads in the
//! meantime. Other callers return immediately. A subscriber that calls back
//! into the catalog therefore never deadlocks; its own batch is delivered
//! right after the event it is currently handling.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, error};

use crate::snapshot::{CatalogEvent, ModuleSnapshot, PendingChange, ScanSummary};

/// Identifies a callback registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type LoadedFn = Arc<dyn Fn(&ModuleSnapshot) + Send + Sync>;
type ReloadedFn = Arc<dyn Fn(&ModuleSnapshot, &ModuleSnapshot) + Send + Sync>;
type UnloadedFn = Arc<dyn Fn(&ModuleSnapshot) + Send + Sync>;
type ScanCompletedFn = Arc<dyn Fn(bool, SystemTime) + Send + Sync>;

#[derive(Clone, Default)]
struct Subscribers {
    loaded: Vec<(SubscriptionId, LoadedFn)>,
    reloaded: Vec<(SubscriptionId, ReloadedFn)>,
    unloaded: Vec<(SubscriptionId, UnloadedFn)>,
    scan_completed: Vec<(SubscriptionId, ScanCompletedFn)>,
}

impl Subscribers {
    fn remove(&mut self, id: SubscriptionId) -> bool {
        let before = self.len();
        self.loaded.retain(|(sid, _)| *sid != id);
        self.reloaded.retain(|(sid, _)| *sid != id);
        self.unloaded.retain(|(sid, _)| *sid != id);
        self.scan_completed.retain(|(sid, _)| *sid != id);
        self.len() != before
    }

    fn len(&self) -> usize {
        self.loaded.len() + self.reloaded.len() + self.unloaded.len() + self.scan_completed.len()
    }
}

#[derive(Default)]
struct Outbox {
    queue: VecDeque<CatalogEvent>,
    draining: bool,
}

/// Fan-out of catalog events to callbacks and broadcast receivers
pub(crate) struct EventNotifier {
    subscribers: RwLock<Arc<Subscribers>>,
    next_id: AtomicU64,
    outbox: Mutex<Outbox>,
    broadcast_tx: broadcast::Sender<CatalogEvent>,
}

impl EventNotifier {
    pub(crate) fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            subscribers: RwLock::new(Arc::new(Subscribers::default())),
            next_id: AtomicU64::new(1),
            outbox: Mutex::new(Outbox::default()),
            broadcast_tx,
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<CatalogEvent> {
        self.broadcast_tx.subscribe()
    }

    fn register(&self, add: impl FnOnce(&mut Subscribers, SubscriptionId)) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut guard = self.subscribers.write();
        let mut updated = Subscribers::clone(&guard);
        add(&mut updated, id);
        *guard = Arc::new(updated);
        id
    }

    pub(crate) fn on_loaded<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&ModuleSnapshot) + Send + Sync + 'static,
    {
        let f: LoadedFn = Arc::new(f);
        self.register(|subs, id| subs.loaded.push((id, f)))
    }

    pub(crate) fn on_reloaded<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&ModuleSnapshot, &ModuleSnapshot) + Send + Sync + 'static,
    {
        let f: ReloadedFn = Arc::new(f);
        self.register(|subs, id| subs.reloaded.push((id, f)))
    }

    pub(crate) fn on_unloaded<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&ModuleSnapshot) + Send + Sync + 'static,
    {
        let f: UnloadedFn = Arc::new(f);
        self.register(|subs, id| subs.unloaded.push((id, f)))
    }

    pub(crate) fn on_scan_completed<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(bool, SystemTime) + Send + Sync + 'static,
    {
        let f: ScanCompletedFn = Arc::new(f);
        self.register(|subs, id| subs.scan_completed.push((id, f)))
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut guard = self.subscribers.write();
        let mut updated = Subscribers::clone(&guard);
        let removed = updated.remove(id);
        if removed {
            *guard = Arc::new(updated);
        }
        removed
    }

    /// Queue one mutation's batch. Must be called while the catalog gate is
    /// still held so that queue order matches commit order.
    pub(crate) fn enqueue(&self, changes: Vec<PendingChange>, summary: ScanSummary) {
        let mut outbox = self.outbox.lock();
        outbox
            .queue
            .extend(changes.into_iter().map(CatalogEvent::Change));
        outbox.queue.push_back(CatalogEvent::ScanCompleted(summary));
    }

    /// Queue changes that are not followed by a scan-completed signal
    pub(crate) fn enqueue_changes(&self, changes: Vec<PendingChange>) {
        let mut outbox = self.outbox.lock();
        outbox
            .queue
            .extend(changes.into_iter().map(CatalogEvent::Change));
    }

    /// Deliver queued events unless another thread is already doing so.
    /// Must be called after the catalog gate has been released.
    pub(crate) fn flush(&self) {
        {
            let mut outbox = self.outbox.lock();
            if outbox.draining {
                return;
            }
            outbox.draining = true;
        }

        loop {
            let event = {
                let mut outbox = self.outbox.lock();
                match outbox.queue.pop_front() {
                    Some(event) => event,
                    None => {
                        outbox.draining = false;
                        return;
                    }
                }
            };
            self.deliver(&event);
        }
    }

    fn deliver(&self, event: &CatalogEvent) {
        debug!(?event, "Dispatching catalog event");
        let subscribers = self.subscribers.read().clone();

        match event {
            CatalogEvent::Change(PendingChange::Loaded(current)) => {
                for (id, f) in &subscribers.loaded {
                    guarded(*id, || f(current));
                }
            }
            CatalogEvent::Change(PendingChange::Reloaded { current, previous }) => {
                for (id, f) in &subscribers.reloaded {
                    guarded(*id, || f(current, previous));
                }
            }
            CatalogEvent::Change(PendingChange::Unloaded(previous)) => {
                for (id, f) in &subscribers.unloaded {
                    guarded(*id, || f(previous));
                }
            }
            CatalogEvent::ScanCompleted(summary) => {
                for (id, f) in &subscribers.scan_completed {
                    guarded(*id, || f(summary.changed, summary.scan_time));
                }
            }
        }

        // No receivers is not an error
        let _ = self.broadcast_tx.send(event.clone());
    }
}

fn guarded(id: SubscriptionId, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(subscription = id.0, "Catalog subscriber panicked");
    }
}
