//! Rust client for the Statehost machine-hosting API
//!
//! Statehost runs state machines server side; this crate talks to it. The
//! interesting part is the realtime layer: one shared WebSocket connection
//! carries every subscription, reconnects on any failure, and replays the
//! active subscribe requests so callers never notice a drop. On top of that
//! sit instance actors with observer-style fan-out and synchronous snapshot
//! access.
//!
//! # Example
//!
//! ```rust,no_run
//! use statehost_client::{Client, ClientConfig, InstanceObserver, TokenConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new(ClientConfig::new(TokenConfig::Static(
//!     std::env::var("STATEHOST_TOKEN")?,
//! )))?;
//!
//! let actor = client.instance_actor("order-flow", "order-17");
//! let observer = actor.subscribe(InstanceObserver::new(|snapshot| {
//!     println!("state: {:?}, done: {}", snapshot.state, snapshot.done);
//! }));
//!
//! actor.send(serde_json::json!({"type": "approve"})).await;
//!
//! // Detaching the last observer closes the network subscription.
//! observer.unsubscribe();
//! # Ok(())
//! # }
//! ```

pub mod actor;
pub mod client;
pub mod config;
pub mod error;
pub mod realtime;
pub mod state;
pub mod token;

mod api;

// Re-export the main types
pub use actor::{InstanceActor, InstanceObserver, InstanceSnapshot, ObserverHandle};
pub use client::{Client, SubscribeOptions};
pub use config::{ClientConfig, RealtimeConfig, DEFAULT_API_HOST};
pub use error::{ClientError, Result};
pub use realtime::protocol::{DeliveryMode, InstanceUpdate};
pub use realtime::subscription::SubscriptionHandle;
pub use state::{matches, state_paths, StateDescriptor, StateValue};
pub use token::{ExchangeConfig, TokenConfig, TokenProvider};
