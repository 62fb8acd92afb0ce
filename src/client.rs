//! Statehost client
//!
//! The owning context for everything shared across calls: the HTTP client,
//! the token cache, and the realtime transport. Nothing here is process
//! global; dropping the last clone of a `Client` releases it all. The
//! realtime connection itself opens on the first subscriber and closes on
//! the last.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use crate::actor::{InstanceActor, InstanceSnapshot};
use crate::api::Api;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::realtime::protocol::InstanceUpdate;
use crate::realtime::subscription::{
    ErrorCallback, SubscriptionHandle, SubscriptionManager, UpdateCallback,
};
use crate::realtime::transport::Transport;
use crate::token::TokenProvider;

/// Options for [`Client::subscribe_to_instance`].
pub struct SubscribeOptions {
    on_update: UpdateCallback,
    on_error: Option<ErrorCallback>,
    cancel: Option<CancellationToken>,
}

impl SubscribeOptions {
    pub fn new(on_update: impl Fn(InstanceUpdate) + Send + Sync + 'static) -> Self {
        Self {
            on_update: Arc::new(on_update),
            on_error: None,
            cancel: None,
        }
    }

    /// Receive server-reported subscription errors. Without a handler they
    /// are logged and dropped.
    pub fn with_error(mut self, on_error: impl Fn(&ClientError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(on_error));
        self
    }

    /// Unsubscribe automatically when `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Client for the Statehost machine-hosting API.
///
/// # Example
///
/// ```rust,no_run
/// use statehost_client::{Client, ClientConfig, SubscribeOptions, TokenConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = Client::new(ClientConfig::new(TokenConfig::Static(
///     std::env::var("STATEHOST_TOKEN")?,
/// )))?;
///
/// let subscription = client.subscribe_to_instance(
///     "order-flow",
///     "order-17",
///     SubscribeOptions::new(|update| println!("now in {:?}", update.state)),
/// );
///
/// // ... later
/// subscription.unsubscribe();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    api: Arc<Api>,
    subscriptions: SubscriptionManager,
}

impl Client {
    /// Create a client. Validates the configuration; performs no I/O.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let host = config.api_host.trim_end_matches('/').to_string();
        if !["http://", "https://", "ws://", "wss://"]
            .iter()
            .any(|scheme| host.starts_with(scheme))
        {
            return Err(ClientError::InvalidConfig(format!(
                "API host must carry an http(s) or ws(s) scheme: {}",
                host
            )));
        }

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ClientError::InvalidConfig(format!("HTTP client: {}", e)))?;

        let tokens = Arc::new(TokenProvider::new(config.token, http.clone(), &host));
        let api = Arc::new(Api::new(http, host.clone(), tokens.clone()));
        let transport = Transport::new(host, config.org_id, config.realtime, tokens);
        let subscriptions = SubscriptionManager::new(transport);

        Ok(Self { api, subscriptions })
    }

    /// Subscribe to an instance's state over the shared realtime connection.
    ///
    /// The subscription stays live across reconnects until the returned
    /// handle's `unsubscribe` is called or the supplied cancellation token
    /// fires.
    pub fn subscribe_to_instance(
        &self,
        machine_name: &str,
        instance_name: &str,
        options: SubscribeOptions,
    ) -> SubscriptionHandle {
        self.subscriptions.subscribe(
            machine_name,
            instance_name,
            options.on_update,
            options.on_error,
            options.cancel,
        )
    }

    /// Handle to one instance, without a known starting state.
    pub fn instance_actor(&self, machine_name: &str, instance_name: &str) -> InstanceActor {
        InstanceActor::new(
            self.api.clone(),
            self.subscriptions.clone(),
            machine_name.to_string(),
            instance_name.to_string(),
            None,
        )
    }

    /// Handle to one instance, seeded with a known snapshot (for example
    /// the response of [`Client::get_instance`]).
    pub fn instance_actor_with_snapshot(
        &self,
        machine_name: &str,
        instance_name: &str,
        snapshot: InstanceSnapshot,
    ) -> InstanceActor {
        InstanceActor::new(
            self.api.clone(),
            self.subscriptions.clone(),
            machine_name.to_string(),
            instance_name.to_string(),
            Some(snapshot),
        )
    }

    /// Fetch the current state of an instance.
    pub async fn get_instance(
        &self,
        machine_name: &str,
        instance_name: &str,
    ) -> Result<InstanceSnapshot> {
        self.api.get_instance(machine_name, instance_name).await
    }

    /// Create a new instance of a machine.
    pub async fn create_instance(
        &self,
        machine_name: &str,
        instance_name: &str,
        context: Option<&JsonValue>,
    ) -> Result<InstanceSnapshot> {
        self.api
            .create_instance(machine_name, instance_name, context)
            .await
    }

    /// Send an event to an instance, returning the resulting snapshot.
    pub async fn send_event(
        &self,
        machine_name: &str,
        instance_name: &str,
        event: &JsonValue,
    ) -> Result<InstanceSnapshot> {
        self.api.send_event(machine_name, instance_name, event).await
    }
}
