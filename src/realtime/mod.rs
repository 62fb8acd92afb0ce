//! Realtime subscription engine
//!
//! Keeps a single shared WebSocket connection alive, multiplexes many
//! logical subscriptions over it, and transparently reconnects and
//! resubscribes after failures.
//!
//! The module is organized by concern:
//!
//! | Module         | Responsibility                                      |
//! |----------------|-----------------------------------------------------|
//! | `protocol`     | JSON wire frames, delivery-mode contract            |
//! | `transport`    | One reconnecting socket, queueing, replay, fan-out  |
//! | `subscription` | Correlation ids, per-caller demultiplexing          |
//!
//! Transport disconnects never surface to application code; the transport
//! reconnects, replays every active subscribe frame, and the server resumes
//! the streams. The only errors a subscriber sees are the ones the server
//! reports against its own correlation id.

pub mod protocol;
pub mod subscription;

pub(crate) mod transport;
