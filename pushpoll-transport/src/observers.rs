//! Instrumentation hooks for whoever hosts the transport.
//!
//! Observers are registered on a [`TransportObservers`] list that the host owns and hands to each
//! transport it builds.  Registration returns a guard; dropping the guard unregisters the
//! observer, so there is no process-wide state to leak between hosts or tests.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use crate::types::{ConnectionId, PersistentResponse};

/// Something the transport is about to do, reported to observers
#[derive(Debug, Clone, Copy)]
pub enum TransportEvent<'a> {
    /// A generic JSON payload is about to be written as a response body
    Sending { body: &'a str },

    /// A batch is about to be flushed to a receiving request
    SendingResponse {
        connection_id: &'a ConnectionId,
        response: &'a PersistentResponse,
    },

    /// Data sent by the client is about to be handed to the application
    Receiving {
        connection_id: &'a ConnectionId,
        data: &'a str,
    },
}

pub trait TransportObserver: Send + Sync + 'static {
    fn on_event(&self, event: TransportEvent<'_>);
}

impl<F> TransportObserver for F
where
    F: Fn(TransportEvent<'_>) + Send + Sync + 'static,
{
    fn on_event(&self, event: TransportEvent<'_>) {
        self(event)
    }
}

type ObserverList = RwLock<Vec<(u64, Arc<dyn TransportObserver>)>>;

/// A list of observers.  Cheap to clone; clones share the list.
#[derive(Clone, Default)]
pub struct TransportObservers {
    next_id: Arc<AtomicU64>,
    observers: Arc<ObserverList>,
}

impl TransportObservers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an observer.  It stays registered until the returned guard is dropped.
    pub fn register(&self, observer: impl TransportObserver) -> ObserverRegistration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, Arc::new(observer)));

        ObserverRegistration {
            id,
            observers: Arc::downgrade(&self.observers),
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn notify(&self, event: TransportEvent<'_>) {
        // Clone the list out so observers run without the lock held, and can register or drop
        // registrations of their own without deadlocking
        let observers = self
            .read()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect::<Vec<_>>();

        for observer in observers {
            observer.on_event(event);
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<(u64, Arc<dyn TransportObserver>)>> {
        self.observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Guard returned by [`TransportObservers::register`]
#[must_use = "the observer is unregistered as soon as this is dropped"]
pub struct ObserverRegistration {
    id: u64,
    observers: Weak<ObserverList>,
}

impl Drop for ObserverRegistration {
    fn drop(&mut self) {
        if let Some(observers) = self.observers.upgrade() {
            observers
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .retain(|(id, _)| *id != self.id);
        }
    }
}
