//! Host lifecycle observers.
//!
//! Observers are held weakly: a dropped observer simply stops receiving
//! events. Dispatch runs over a snapshot taken with the lock released, so a
//! callback may subscribe or unsubscribe without deadlocking.

use std::sync::{Arc, Mutex, Weak};

use crate::session::SessionId;
use crate::status::FinalStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    /// The session was swapped into a real navigation.
    Activated,
    /// The host is being destroyed with this terminal status.
    Destroyed(FinalStatus),
}

pub trait HostObserver: Send + Sync {
    fn on_host_event(&self, session: SessionId, event: HostEvent);
}

#[derive(Default)]
struct Slots {
    next_id: u64,
    entries: Vec<(u64, Weak<dyn HostObserver>)>,
}

/// Weak subscriber list shared by one host.
#[derive(Clone, Default)]
pub struct ObserverList {
    inner: Arc<Mutex<Slots>>,
}

impl std::fmt::Debug for ObserverList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverList")
            .field("len", &self.len())
            .finish()
    }
}

impl ObserverList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `observer`. Dropping the returned subscription detaches it.
    pub fn subscribe<O: HostObserver + 'static>(&self, observer: &Arc<O>) -> Subscription {
        let weak: Weak<O> = Arc::downgrade(observer);
        let weak: Weak<dyn HostObserver> = weak;
        let mut slots = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        slots.next_id += 1;
        let id = slots.next_id;
        slots.entries.push((id, weak));
        Subscription {
            list: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Live observers.
    #[must_use]
    pub fn len(&self) -> usize {
        let slots = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .entries
            .iter()
            .filter(|(_, weak)| weak.strong_count() > 0)
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every live observer, pruning dead ones.
    pub fn notify(&self, session: SessionId, event: HostEvent) {
        let snapshot: Vec<Arc<dyn HostObserver>> = {
            let mut slots = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            slots.entries.retain(|(_, weak)| weak.strong_count() > 0);
            slots
                .entries
                .iter()
                .filter_map(|(_, weak)| weak.upgrade())
                .collect()
        };
        for observer in snapshot {
            observer.on_host_event(session, event);
        }
    }
}

/// Handle keeping one observer registered.
#[must_use = "dropping a Subscription unsubscribes immediately"]
#[derive(Debug)]
pub struct Subscription {
    list: Weak<Mutex<Slots>>,
    id: u64,
}

impl Subscription {
    /// Keep the observer registered for the lifetime of the list.
    pub fn detach(self) {
        std::mem::forget(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(list) = self.list.upgrade() {
            let mut slots = list.lock().unwrap_or_else(|e| e.into_inner());
            slots.entries.retain(|(id, _)| *id != self.id);
        }
    }
}
