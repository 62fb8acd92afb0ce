//! Instance actor facade
//!
//! Wraps one instance's live subscription and its send-event operation into
//! a single handle with observer-style consumption. Observers on one actor
//! share a single network subscription; fan-out happens locally. The actor
//! survives subscription errors: the underlying transport keeps reconnecting
//! and observers may keep watching.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::api::Api;
use crate::error::ClientError;
use crate::realtime::protocol::InstanceUpdate;
use crate::realtime::subscription::{
    ErrorCallback, SubscriptionHandle, SubscriptionManager, UpdateCallback,
};
use crate::state::{StateDescriptor, StateValue};

/// An immutable point-in-time view of an instance: state value, public
/// context, tags, and completion flag. A new snapshot never mutates one
/// already handed out; consumers compare against the latest from
/// [`InstanceActor::snapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSnapshot {
    pub state: StateValue,
    #[serde(default)]
    pub public_context: Option<JsonValue>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub done: bool,
}

impl InstanceSnapshot {
    /// Whether the snapshot's state is at or below `descriptor`
    pub fn matches(&self, descriptor: &StateDescriptor) -> bool {
        crate::state::matches(Some(descriptor), Some(&self.state))
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    fn from_update(update: InstanceUpdate) -> Self {
        Self {
            state: update.state,
            public_context: update.public_context,
            tags: update.tags,
            done: update.done,
        }
    }
}

/// Observer callbacks attached to an actor.
pub struct InstanceObserver {
    on_update: Arc<dyn Fn(Arc<InstanceSnapshot>) + Send + Sync>,
    on_error: Option<Arc<dyn Fn(&ClientError) + Send + Sync>>,
}

impl InstanceObserver {
    pub fn new(on_update: impl Fn(Arc<InstanceSnapshot>) + Send + Sync + 'static) -> Self {
        Self {
            on_update: Arc::new(on_update),
            on_error: None,
        }
    }

    pub fn with_error(
        mut self,
        on_error: impl Fn(&ClientError) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(on_error));
        self
    }
}

struct ObserverRecord {
    id: u64,
    cancelled: Arc<AtomicBool>,
    observer: Arc<InstanceObserver>,
}

#[derive(Default)]
struct ActorState {
    observers: Vec<ObserverRecord>,
    next_observer_id: u64,
    snapshot: Option<Arc<InstanceSnapshot>>,
    /// Events sent but not yet reflected in an update. Cleared when the next
    /// update arrives, which is not necessarily the update a given event
    /// caused; the correlation is explicitly best effort.
    in_flight: Vec<JsonValue>,
    subscription: Option<SubscriptionHandle>,
}

/// Handle to one machine instance: live state plus event sending.
#[derive(Clone)]
pub struct InstanceActor {
    inner: Arc<ActorInner>,
}

struct ActorInner {
    api: Arc<Api>,
    subscriptions: SubscriptionManager,
    machine_name: String,
    instance_name: String,
    state: Mutex<ActorState>,
}

impl InstanceActor {
    pub(crate) fn new(
        api: Arc<Api>,
        subscriptions: SubscriptionManager,
        machine_name: String,
        instance_name: String,
        initial: Option<InstanceSnapshot>,
    ) -> Self {
        let state = ActorState {
            snapshot: initial.map(Arc::new),
            ..Default::default()
        };
        Self {
            inner: Arc::new(ActorInner {
                api,
                subscriptions,
                machine_name,
                instance_name,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn machine_name(&self) -> &str {
        &self.inner.machine_name
    }

    pub fn instance_name(&self) -> &str {
        &self.inner.instance_name
    }

    /// Attach an observer. The first observer lazily opens the network
    /// subscription; the last detach closes it.
    pub fn subscribe(&self, observer: InstanceObserver) -> ObserverHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let id = {
            let mut state = self.inner.state.lock().expect("actor state poisoned");
            let id = state.next_observer_id;
            state.next_observer_id += 1;
            state.observers.push(ObserverRecord {
                id,
                cancelled: cancelled.clone(),
                observer: Arc::new(observer),
            });
            if state.subscription.is_none() {
                state.subscription = Some(self.open_subscription());
            }
            id
        };
        ObserverHandle {
            inner: self.inner.clone(),
            id,
            cancelled,
        }
    }

    fn open_subscription(&self) -> SubscriptionHandle {
        debug!(
            machine = %self.inner.machine_name,
            instance = %self.inner.instance_name,
            "first observer attached, opening subscription"
        );
        let weak = Arc::downgrade(&self.inner);
        let on_update: UpdateCallback = Arc::new(move |update| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_update(update);
            }
        });
        let weak = Arc::downgrade(&self.inner);
        let on_error: ErrorCallback = Arc::new(move |error| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_error(error);
            }
        });
        self.inner.subscriptions.subscribe(
            &self.inner.machine_name,
            &self.inner.instance_name,
            on_update,
            Some(on_error),
            None,
        )
    }

    /// Send an event to the instance.
    ///
    /// The event is recorded as in-flight immediately and the call does not
    /// gate local state. Failures surface through the observers' error
    /// channel, not as a return value.
    pub async fn send(&self, event: JsonValue) {
        {
            let mut state = self.inner.state.lock().expect("actor state poisoned");
            state.in_flight.push(event.clone());
        }
        if let Err(error) = self
            .inner
            .api
            .send_event(&self.inner.machine_name, &self.inner.instance_name, &event)
            .await
        {
            warn!(error = %error, "send-event failed");
            self.inner.handle_error(&error);
        }
    }

    /// The most recent snapshot, if any update has arrived (or an initial
    /// snapshot was supplied at construction).
    pub fn snapshot(&self) -> Option<Arc<InstanceSnapshot>> {
        self.inner
            .state
            .lock()
            .expect("actor state poisoned")
            .snapshot
            .clone()
    }

    /// Events sent but not yet reflected in a state update
    pub fn in_flight_events(&self) -> Vec<JsonValue> {
        self.inner
            .state
            .lock()
            .expect("actor state poisoned")
            .in_flight
            .clone()
    }
}

impl ActorInner {
    fn handle_update(&self, update: InstanceUpdate) {
        let snapshot = Arc::new(InstanceSnapshot::from_update(update));
        let observers = {
            let mut state = self.state.lock().expect("actor state poisoned");
            state.snapshot = Some(snapshot.clone());
            if !state.in_flight.is_empty() {
                debug!(count = state.in_flight.len(), "clearing in-flight events");
                state.in_flight.clear();
            }
            snapshot_observers(&state)
        };
        for (cancelled, observer) in observers {
            if !cancelled.load(Ordering::SeqCst) {
                (observer.on_update)(snapshot.clone());
            }
        }
    }

    fn handle_error(&self, error: &ClientError) {
        let observers = {
            let state = self.state.lock().expect("actor state poisoned");
            snapshot_observers(&state)
        };
        let mut delivered = false;
        for (cancelled, observer) in observers {
            if cancelled.load(Ordering::SeqCst) {
                continue;
            }
            if let Some(on_error) = &observer.on_error {
                on_error(error);
                delivered = true;
            }
        }
        if !delivered {
            debug!(error = %error, "actor error with no error observer");
        }
    }
}

/// Clone the registry so callbacks run outside the lock; an observer may
/// detach itself from within its own callback.
fn snapshot_observers(state: &ActorState) -> Vec<(Arc<AtomicBool>, Arc<InstanceObserver>)> {
    state
        .observers
        .iter()
        .map(|record| (record.cancelled.clone(), record.observer.clone()))
        .collect()
}

/// Handle to one attached observer. Detach with
/// [`ObserverHandle::unsubscribe`]; dropping the handle leaves the observer
/// attached.
pub struct ObserverHandle {
    inner: Arc<ActorInner>,
    id: u64,
    cancelled: Arc<AtomicBool>,
}

impl ObserverHandle {
    /// Detach this observer. Idempotent. When the last observer detaches,
    /// the actor's network subscription is closed.
    pub fn unsubscribe(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let closed = {
            let mut state = self.inner.state.lock().expect("actor state poisoned");
            state.observers.retain(|record| record.id != self.id);
            if state.observers.is_empty() {
                state.subscription.take()
            } else {
                None
            }
        };
        if let Some(subscription) = closed {
            debug!("last observer detached, closing subscription");
            subscription.unsubscribe();
        }
    }
}
