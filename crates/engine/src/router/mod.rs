//! Event router: typed fan-out with per-listener isolation
//!
//! A [`ListenerSet`] only holds weak references. The [`Subscription`] a
//! consumer gets back owns the callback; dropping it or calling
//! [`Subscription::unsubscribe`] deactivates the listener at once, and
//! dispatch checks that flag right before every call.

use dojo_core::{EventKind, EventPayload, ServerEvent};
use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{error, trace};

type Callback<T> = Box<dyn Fn(&T) + Send + Sync>;

struct Listener<T> {
    active: AtomicBool,
    callback: Callback<T>,
}

trait Deactivate: Send + Sync {
    fn deactivate(&self);
    fn is_active(&self) -> bool;
}

impl<T: 'static> Deactivate for Listener<T> {
    fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Owner of one registered callback.
///
/// The listener lives exactly as long as this value, or until
/// [`Subscription::unsubscribe`].
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    listener: Arc<dyn Deactivate>,
}

impl Subscription {
    /// Stop receiving events. Safe to call repeatedly, and from inside a
    /// callback that is currently being dispatched.
    pub fn unsubscribe(&self) {
        self.listener.deactivate();
    }

    pub fn is_active(&self) -> bool {
        self.listener.is_active()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.listener.deactivate();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Callbacks for one value type, invoked in registration order
pub struct ListenerSet<T> {
    name: &'static str,
    listeners: Mutex<Vec<Weak<Listener<T>>>>,
}

impl<T: 'static> ListenerSet<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Weak<Listener<T>>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let listener = Arc::new(Listener {
            active: AtomicBool::new(true),
            callback: Box::new(callback),
        });

        let mut listeners = self.lock();
        listeners.retain(|weak| weak.strong_count() > 0);
        listeners.push(Arc::downgrade(&listener));

        Subscription { listener }
    }

    /// Invoke every live listener with `value`. A panicking listener is
    /// logged and skipped. Returns how many listeners ran to completion.
    pub fn dispatch(&self, value: &T) -> usize {
        // Snapshot so callbacks may subscribe or unsubscribe freely
        let snapshot: Vec<Arc<Listener<T>>> = {
            let mut listeners = self.lock();
            listeners.retain(|weak| weak.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };

        let mut delivered = 0;
        for (index, listener) in snapshot.iter().enumerate() {
            if !listener.active.load(Ordering::SeqCst) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| (listener.callback)(value))) {
                Ok(()) => delivered += 1,
                Err(payload) => error!(
                    "Listener #{} for '{}' panicked: {}",
                    index,
                    self.name,
                    panic_message(payload.as_ref())
                ),
            }
        }
        trace!("Dispatched '{}' to {} listener(s)", self.name, delivered);
        delivered
    }

    /// Listeners still subscribed
    pub fn len(&self) -> usize {
        self.lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|listener| listener.active.load(Ordering::SeqCst))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Demultiplexes inbound events by kind
pub struct EventRouter {
    sets: HashMap<EventKind, ListenerSet<ServerEvent>>,
}

impl EventRouter {
    pub fn new() -> Self {
        let sets = EventKind::ALL
            .into_iter()
            .map(|kind| (kind, ListenerSet::new(kind.as_str())))
            .collect();
        Self { sets }
    }

    fn set(&self, kind: EventKind) -> Option<&ListenerSet<ServerEvent>> {
        self.sets.get(&kind)
    }

    /// Subscribe to one payload type, e.g. `router.subscribe(|m: &ChatMessage| ...)`
    pub fn subscribe<E, F>(&self, callback: F) -> Subscription
    where
        E: EventPayload,
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.subscribe_kind(E::KIND, move |event| {
            if let Some(payload) = E::from_event(event) {
                callback(payload);
            }
        })
    }

    /// Subscribe to every event of `kind` without unpacking the payload
    pub fn subscribe_kind<F>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        match self.set(kind) {
            Some(set) => set.add(callback),
            // Every kind has a set; keep the signature total regardless
            None => ListenerSet::new(kind.as_str()).add(callback),
        }
    }

    /// Deliver `event` to its kind's listeners
    pub fn dispatch(&self, event: &ServerEvent) -> usize {
        self.set(event.kind()).map_or(0, |set| set.dispatch(event))
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.set(kind).map_or(0, ListenerSet::len)
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}
