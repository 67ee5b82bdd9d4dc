//! Listener registration for lifecycle and message notifications.
//!
//! Registering returns a [`Subscription`]; calling
//! [`Subscription::unsubscribe`] removes the listener. Dropping the handle
//! leaves the listener registered.
//!
//! Lifecycle events are delivered on a dedicated notifier thread so a slow
//! listener cannot hold up a read loop or a dispatcher worker. Message
//! listeners run inline on the connection's read loop, preserving arrival
//! order.

use crate::role::NodeRole;
use crate::transport::Endpoint;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use tracing::{trace, warn};

/// Identity and roles of one connection, as reported in events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: u64,
    pub local_role: NodeRole,
    pub remote_role: NodeRole,
    /// Endpoint the connection was made through (bound or connected).
    pub endpoint: Endpoint,
    /// Transport-specific peer description, e.g. the remote socket address.
    pub peer: String,
}

/// Lifecycle notifications emitted by nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// A peer connected to one of a server node's bound endpoints.
    ClientConnected(ConnectionInfo),
    /// A peer of a server node went away.
    ClientDisconnected(ConnectionInfo),
    /// A client node's connection was torn down.
    Disconnected(ConnectionInfo),
}

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;
type ListenerList<E> = Mutex<Vec<(u64, Listener<E>)>>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Inline,
    Notifier,
}

pub(crate) struct EventHub<E> {
    listeners: Arc<ListenerList<E>>,
    next_id: AtomicU64,
    delivery: Delivery,
    notifier: Mutex<Option<Sender<E>>>,
}

impl<E: Send + 'static> EventHub<E> {
    /// Listeners run on the thread that emits.
    pub(crate) fn inline() -> Self {
        Self::with_delivery(Delivery::Inline)
    }

    /// Listeners run on a notifier thread, started on first subscription.
    pub(crate) fn notifier() -> Self {
        Self::with_delivery(Delivery::Notifier)
    }

    fn with_delivery(delivery: Delivery) -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
            delivery,
            notifier: Mutex::new(None),
        }
    }

    pub(crate) fn subscribe(&self, listener: impl Fn(&E) + Send + Sync + 'static) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.listeners).push((id, Arc::new(listener)));
        if self.delivery == Delivery::Notifier {
            self.ensure_notifier();
        }

        let listeners: Weak<ListenerList<E>> = Arc::downgrade(&self.listeners);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(listeners) = listeners.upgrade() {
                    lock(&listeners).retain(|(listener_id, _)| *listener_id != id);
                }
            })),
        }
    }

    pub(crate) fn emit(&self, event: E) {
        match self.delivery {
            Delivery::Inline => deliver(&self.listeners, &event),
            Delivery::Notifier => {
                if let Some(sender) = lock(&self.notifier).as_ref() {
                    if sender.send(event).is_err() {
                        warn!("Notifier thread gone, event dropped");
                    }
                }
            }
        }
    }

    fn ensure_notifier(&self) {
        let mut notifier = lock(&self.notifier);
        if notifier.is_some() {
            return;
        }

        let (sender, events) = channel::<E>();
        let listeners = Arc::downgrade(&self.listeners);
        let spawned = thread::Builder::new()
            .name("relaymq-notifier".to_string())
            .spawn(move || {
                // Ends when the hub, and with it the sender, is dropped.
                for event in events {
                    let Some(listeners) = listeners.upgrade() else {
                        break;
                    };
                    deliver(&listeners, &event);
                }
                trace!("Notifier thread stopped");
            });

        match spawned {
            Ok(_) => *notifier = Some(sender),
            Err(err) => warn!(?err, "Failed to start notifier thread"),
        }
    }
}

fn deliver<E>(listeners: &ListenerList<E>, event: &E) {
    // Snapshot so listeners may subscribe or unsubscribe while being called.
    let snapshot: Vec<Listener<E>> = lock(listeners)
        .iter()
        .map(|(_, listener)| listener.clone())
        .collect();
    for listener in snapshot {
        listener(event);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle returned by listener registration.
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Removes the listener. It receives no notifications afterwards, except
    /// one already being delivered.
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}
