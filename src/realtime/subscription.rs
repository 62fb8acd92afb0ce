//! Logical subscriptions over the shared transport
//!
//! Translates "subscribe to an instance's state" into persistent
//! subscribe/unsubscribe frame pairs and demultiplexes inbound frames back
//! to the right caller. Updates are matched by (machine, instance) name,
//! since one update stream may serve several local subscribers to the same
//! instance; server errors are matched by correlation id so they reach only
//! the subscription that caused them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::protocol::{ClientFrame, DeliveryMode, InstanceUpdate, ServerFrame};
use super::transport::{Listener, ListenerId, PersistentHandle, Transport};
use crate::error::ClientError;

/// Callback invoked with each state update. Every update is the
/// authoritative latest snapshot, never a delta.
pub type UpdateCallback = Arc<dyn Fn(InstanceUpdate) + Send + Sync>;

/// Callback invoked with subscription errors
pub type ErrorCallback = Arc<dyn Fn(&ClientError) + Send + Sync>;

#[derive(Clone)]
pub(crate) struct SubscriptionManager {
    transport: Transport,
}

impl SubscriptionManager {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    /// Open a subscription to one instance's state.
    ///
    /// The subscribe frame is registered as persistent, so after any
    /// reconnect the server re-establishes the stream without the caller's
    /// involvement. A supplied cancellation token triggers unsubscribe
    /// exactly once.
    pub fn subscribe(
        &self,
        machine_name: &str,
        instance_name: &str,
        on_update: UpdateCallback,
        on_error: Option<ErrorCallback>,
        cancel: Option<CancellationToken>,
    ) -> SubscriptionHandle {
        let request_id = Uuid::new_v4().to_string();
        let cancelled = Arc::new(AtomicBool::new(false));
        let machine = machine_name.to_string();
        let instance = instance_name.to_string();

        let listener: Listener = {
            let cancelled = cancelled.clone();
            let request_id = request_id.clone();
            let machine = machine.clone();
            let instance = instance.clone();
            Arc::new(move |frame: &ServerFrame| {
                if cancelled.load(Ordering::SeqCst) {
                    return;
                }
                match frame {
                    ServerFrame::InstanceUpdate(update)
                        if update.machine_name == machine
                            && update.machine_instance_name == instance =>
                    {
                        on_update(update.clone());
                    }
                    ServerFrame::Error(error) if error.request_id == request_id => {
                        let error = ClientError::Subscription {
                            status: error.status,
                            code: error.code.clone(),
                        };
                        match &on_error {
                            Some(callback) => callback(&error),
                            None => {
                                warn!(error = %error, "subscription error with no handler")
                            }
                        }
                    }
                    _ => {}
                }
            })
        };

        let listener_id = self.transport.add_listener(listener);
        let persistent = self
            .transport
            .persistent_send(ClientFrame::SubscribeToInstance {
                machine_name: machine.clone(),
                machine_instance_name: instance.clone(),
                request_id: request_id.clone(),
            });

        let handle = SubscriptionHandle {
            inner: Arc::new(SubscriptionInner {
                transport: self.transport.clone(),
                listener_id,
                persistent,
                machine_name: machine,
                instance_name: instance,
                request_id,
                cancelled,
                closed: CancellationToken::new(),
            }),
        };

        if let Some(cancel) = cancel {
            let watcher = handle.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => watcher.unsubscribe(),
                    _ = watcher.inner.closed.cancelled() => {}
                }
            });
        }

        handle
    }
}

struct SubscriptionInner {
    transport: Transport,
    listener_id: ListenerId,
    persistent: PersistentHandle,
    machine_name: String,
    instance_name: String,
    request_id: String,
    cancelled: Arc<AtomicBool>,
    closed: CancellationToken,
}

/// Handle to a live subscription. Cloning does not duplicate the
/// subscription; dropping it leaves the subscription active. Call
/// [`SubscriptionHandle::unsubscribe`] (or cancel the token supplied at
/// subscribe time) to tear it down.
#[derive(Clone)]
pub struct SubscriptionHandle {
    inner: Arc<SubscriptionInner>,
}

impl SubscriptionHandle {
    /// Tear the subscription down. Idempotent: the second and later calls
    /// are no-ops. Safe to call before the transport ever connected; the
    /// pending subscribe frame is withdrawn instead of sent.
    pub fn unsubscribe(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.persistent.cancel();
        // Best effort, and only meaningful on the connection the subscribe
        // went out on; never queued for a later one.
        self.inner.transport.send_if_connected(ClientFrame::UnsubscribeFromInstance {
            machine_name: self.inner.machine_name.clone(),
            machine_instance_name: self.inner.instance_name.clone(),
            request_id: self.inner.request_id.clone(),
        });
        self.inner.transport.remove_listener(self.inner.listener_id);
        self.inner.closed.cancel();
        debug!(request_id = %self.inner.request_id, "unsubscribed from instance");
    }

    /// Correlation id of this subscription
    pub fn request_id(&self) -> &str {
        &self.inner.request_id
    }

    /// The delivery contract of this subscription
    pub fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::LatestOnly
    }
}
