//! Persistent realtime transport
//!
//! Single responsibility: present a frame-level pub/sub interface over one
//! reconnecting WebSocket, no matter how many logical subscribers are
//! attached.
//!
//! The connection is lazy and reference counted: it is established when the
//! first listener registers and torn down when the last one leaves, so an
//! idle client holds no socket. Frames sent while disconnected are queued;
//! frames registered as persistent are retransmitted after every reconnect,
//! because the server does not remember clients across connections.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{protocol::Message, Error as WsError};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{ClientFrame, ServerFrame};
use crate::config::RealtimeConfig;
use crate::token::TokenProvider;

/// Path of the realtime endpoint relative to the API host
const REALTIME_PATH: &str = "/rt";

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Handler invoked for every inbound frame
pub(crate) type Listener = Arc<dyn Fn(&ServerFrame) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ListenerId(u64);

/// Shared reconnecting transport. Cheap to clone; all clones drive the same
/// underlying connection.
#[derive(Clone)]
pub(crate) struct Transport {
    shared: Arc<Shared>,
}

struct Shared {
    api_host: String,
    org_id: Option<String>,
    config: RealtimeConfig,
    tokens: Arc<TokenProvider>,
    state: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    listeners: Vec<(ListenerId, Listener)>,
    next_listener_id: u64,
    next_persistent_id: u64,
    /// Frames accepted while disconnected, flushed FIFO on the next connect
    queue: VecDeque<ClientFrame>,
    /// Frames replayed on every connect until cancelled
    persistent: Vec<(u64, ClientFrame)>,
    /// Present while the connect loop is running
    loop_ctl: Option<LoopCtl>,
    /// Present only while a socket is open
    out_tx: Option<mpsc::UnboundedSender<ClientFrame>>,
}

struct LoopCtl {
    shutdown: CancellationToken,
}

impl Transport {
    pub fn new(
        api_host: String,
        org_id: Option<String>,
        config: RealtimeConfig,
        tokens: Arc<TokenProvider>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                api_host,
                org_id,
                config,
                tokens,
                state: Mutex::new(Inner::default()),
            }),
        }
    }

    /// Register a handler for every inbound frame. The first listener
    /// triggers connection establishment.
    pub fn add_listener(&self, listener: Listener) -> ListenerId {
        let mut inner = self.shared.state.lock().expect("transport state poisoned");
        let id = ListenerId(inner.next_listener_id);
        inner.next_listener_id += 1;
        inner.listeners.push((id, listener));

        if inner.loop_ctl.is_none() {
            debug!("first realtime listener registered, starting transport");
            let shutdown = CancellationToken::new();
            tokio::spawn(run_loop(self.shared.clone(), shutdown.clone()));
            inner.loop_ctl = Some(LoopCtl { shutdown });
        }
        id
    }

    /// Deregister a handler. When the listener set becomes empty the
    /// connection is closed and queued frames are released.
    pub fn remove_listener(&self, id: ListenerId) {
        let ctl = {
            let mut inner = self.shared.state.lock().expect("transport state poisoned");
            inner.listeners.retain(|(lid, _)| *lid != id);
            if inner.listeners.is_empty() {
                inner.queue.clear();
                inner.out_tx = None;
                inner.loop_ctl.take()
            } else {
                None
            }
        };
        if let Some(ctl) = ctl {
            info!("last realtime listener removed, closing connection");
            ctl.shutdown.cancel();
        }
    }

    /// Send a frame: immediately while connected, queued otherwise. Never
    /// fails; callers are not informed of delivery timing.
    pub fn send(&self, frame: ClientFrame) {
        let mut inner = self.shared.state.lock().expect("transport state poisoned");
        match &inner.out_tx {
            Some(tx) => {
                if tx.send(frame.clone()).is_err() {
                    inner.queue.push_back(frame);
                }
            }
            None => inner.queue.push_back(frame),
        }
    }

    /// Send a frame only if a socket is currently open; otherwise drop it.
    /// For best-effort frames that make no sense on a later connection.
    pub fn send_if_connected(&self, frame: ClientFrame) {
        let inner = self.shared.state.lock().expect("transport state poisoned");
        if let Some(tx) = &inner.out_tx {
            let _ = tx.send(frame);
        }
    }

    /// Send a frame now and replay it after every future reconnect, until
    /// the returned handle is cancelled.
    pub fn persistent_send(&self, frame: ClientFrame) -> PersistentHandle {
        let mut inner = self.shared.state.lock().expect("transport state poisoned");
        let id = inner.next_persistent_id;
        inner.next_persistent_id += 1;
        inner.persistent.push((id, frame.clone()));
        // While disconnected the persistent set itself is flushed on the
        // next connect; queueing as well would transmit the frame twice.
        if let Some(tx) = &inner.out_tx {
            let _ = tx.send(frame);
        }
        PersistentHandle {
            shared: self.shared.clone(),
            id,
        }
    }
}

/// Cancellation handle for a persistent frame.
pub(crate) struct PersistentHandle {
    shared: Arc<Shared>,
    id: u64,
}

impl PersistentHandle {
    /// Stop replaying the frame. A subscription abandoned before the first
    /// connect never hits the wire: withdrawal from the persistent set is
    /// all it takes, since pre-connect frames live nowhere else.
    pub fn cancel(&self) {
        let mut inner = self.shared.state.lock().expect("transport state poisoned");
        inner.persistent.retain(|(pid, _)| *pid != self.id);
    }
}

/// Connect URL: API host with the scheme upgraded to its WebSocket
/// equivalent, carrying the bearer token and optional org id as query
/// parameters. The WebSocket handshake cannot set custom headers from every
/// caller environment, so credentials travel in the query string.
fn realtime_url(api_host: &str, token: &str, org_id: Option<&str>) -> String {
    let host = api_host.trim_end_matches('/');
    let base = if let Some(rest) = host.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = host.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        host.to_string()
    };

    let mut query = url::form_urlencoded::Serializer::new(String::new());
    query.append_pair("token", token);
    if let Some(org_id) = org_id {
        query.append_pair("orgId", org_id);
    }
    format!("{}{}?{}", base, REALTIME_PATH, query.finish())
}

async fn run_loop(shared: Arc<Shared>, shutdown: CancellationToken) {
    let mut failed_attempts = 0u32;

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        match establish(&shared).await {
            Ok(socket) => {
                failed_attempts = 0;
                info!(host = %shared.api_host, "realtime connection established");
                run_connection(&shared, socket, &shutdown).await;
                if shutdown.is_cancelled() {
                    break;
                }
                debug!("realtime connection lost, reconnecting");
            }
            Err(error) => {
                failed_attempts += 1;
                warn!(error = %error, attempt = failed_attempts, "realtime connect failed");
                let max = shared.config.max_reconnect_attempts;
                if max > 0 && failed_attempts >= max {
                    warn!(max = max, "max reconnect attempts reached, stopping transport");
                    break;
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(shared.config.reconnect_delay) => {}
            _ = shutdown.cancelled() => break,
        }
    }

    debug!("realtime transport loop stopped");
}

async fn establish(
    shared: &Shared,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, String> {
    let token = shared
        .tokens
        .get_token()
        .await
        .map_err(|e| format!("credential unavailable: {}", e))?;
    let url = realtime_url(&shared.api_host, &token, shared.org_id.as_deref());
    let (socket, _) = connect_async(&url)
        .await
        .map_err(|e| format!("WebSocket connect failed: {}", e))?;
    Ok(socket)
}

async fn run_connection(
    shared: &Arc<Shared>,
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    shutdown: &CancellationToken,
) {
    let (mut write, mut read) = socket.split();

    // Expose the open socket to senders, then collect what is owed from
    // before the connect: persistent frames first, queued frames after,
    // each exactly once.
    let (tx, mut rx) = mpsc::unbounded_channel();
    let replay: Vec<ClientFrame> = {
        let mut inner = shared.state.lock().expect("transport state poisoned");
        inner.out_tx = Some(tx);
        let mut frames: Vec<ClientFrame> =
            inner.persistent.iter().map(|(_, frame)| frame.clone()).collect();
        frames.extend(inner.queue.drain(..));
        frames
    };
    for frame in replay {
        if send_frame(&mut write, &frame).await.is_err() {
            disconnect(shared);
            return;
        }
    }

    // One keep-alive timer per physical connection; it dies with this scope.
    let mut ping = tokio::time::interval(shared.config.ping_interval);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                // Drain frames already accepted for this socket, best effort
                while let Ok(frame) = rx.try_recv() {
                    if send_frame(&mut write, &frame).await.is_err() {
                        break;
                    }
                }
                let _ = write.close().await;
                break;
            }
            outgoing = rx.recv() => {
                match outgoing {
                    Some(frame) => {
                        if send_frame(&mut write, &frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = ping.tick() => {
                if send_frame(&mut write, &ClientFrame::Ping).await.is_err() {
                    warn!("keep-alive ping failed");
                    break;
                }
            }
            inbound = read.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => dispatch(shared, &text),
                    Some(Ok(Message::Binary(data))) => {
                        if let Ok(text) = String::from_utf8(data) {
                            dispatch(shared, &text);
                        }
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // Pong is handled automatically by tungstenite
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(frame = ?frame, "server closed realtime connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        warn!(error = %error, "realtime socket error");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    disconnect(shared);
}

fn disconnect(shared: &Shared) {
    let mut inner = shared.state.lock().expect("transport state poisoned");
    inner.out_tx = None;
}

async fn send_frame(write: &mut WsSink, frame: &ClientFrame) -> Result<(), WsError> {
    let text = match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(error) => {
            warn!(error = %error, "failed to encode outbound frame");
            return Ok(());
        }
    };
    write.send(Message::Text(text)).await.inspect_err(|error| {
        warn!(error = %error, "realtime send failed");
    })
}

/// Parse and fan an inbound frame out to every listener. Malformed frames
/// are dropped: one corrupt frame must not take down the multiplexed
/// channel.
fn dispatch(shared: &Shared, text: &str) {
    let frame: ServerFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(error) => {
            debug!(error = %error, "dropping malformed realtime frame");
            return;
        }
    };
    if matches!(frame, ServerFrame::Unknown) {
        debug!("dropping unrecognized realtime frame");
        return;
    }

    // Listeners run outside the lock so a handler may deregister itself.
    let listeners: Vec<Listener> = {
        let inner = shared.state.lock().expect("transport state poisoned");
        inner.listeners.iter().map(|(_, l)| l.clone()).collect()
    };
    for listener in listeners {
        listener(&frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_realtime_url_scheme_upgrade() {
        assert_eq!(
            realtime_url("https://api.statehost.dev", "tok", None),
            "wss://api.statehost.dev/rt?token=tok"
        );
        assert_eq!(
            realtime_url("http://localhost:8080/", "tok", Some("org_1")),
            "ws://localhost:8080/rt?token=tok&orgId=org_1"
        );
    }

    #[test]
    fn test_realtime_url_encodes_query() {
        let url = realtime_url("https://api.statehost.dev", "a+b c", None);
        assert_eq!(url, "wss://api.statehost.dev/rt?token=a%2Bb+c");
    }
}
