//! Per-node WebSocket client state machine.
//!
//! One background task per node runs the connect/receive/reconnect loop:
//!
//! - connect with identity headers, backing off on transport failures
//!   (auth failures are fatal - retrying wrong credentials is futile)
//! - flush commands queued while disconnected, in enqueue order, before
//!   enabling the live send path
//! - dispatch inbound frames strictly in arrival order
//! - on close or transport error, notify the pool for fail-over and
//!   reconnect, unless a manual closure made the state terminal
//!
//! Outbound commands are never silently dropped, only delayed: anything
//! sent while disconnected waits in the queue for the next session.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, Bytes, Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::config::{NodeConfig, PoolConfig};
use crate::error::{MaestroError, MaestroResult};
use crate::protocol::{IncomingMessage, OutgoingMessage, CLOSE_CODE_MANUAL};

use super::Node;

/// How stale the inbound side may go before a ping failure is declared.
///
/// The health check pings every interval; pongs refresh the inbound clock,
/// so three missed intervals in a row mean the transport is wedged.
const INBOUND_STALE_AFTER: Duration = Duration::from_secs(15);

/// Connection state shared between the socket task and its node.
pub(crate) struct NodeSocket {
    url: String,
    password: String,
    user_id: u64,
    client_name: String,
    resume_key: Option<String>,
    resume_timeout_secs: u64,
    max_reconnect_attempts: i32,

    connected: AtomicBool,
    session_id: Mutex<Option<String>>,
    resume_configured: AtomicBool,

    /// Outbound commands held while disconnected, flushed in enqueue order.
    queue: Mutex<VecDeque<String>>,
    /// Live send path; present only while a session is up.
    live: Mutex<Option<mpsc::UnboundedSender<Message>>>,

    /// Terminal shutdown flag; no auto-reconnect once cancelled.
    shutdown: CancellationToken,
    /// One-shot signal to tear down the current session and reconnect.
    restart: Notify,
    ready_notify: Notify,
    last_inbound: Mutex<Instant>,
}

impl NodeSocket {
    pub(crate) fn new(config: &NodeConfig, pool_config: &PoolConfig) -> Self {
        Self {
            url: config.ws_url(),
            password: config.password.clone(),
            user_id: pool_config.user_id,
            client_name: pool_config.client_name.clone(),
            resume_key: config.resume_key.clone(),
            resume_timeout_secs: config.resume_timeout_secs,
            max_reconnect_attempts: config.reconnect_attempts,
            connected: AtomicBool::new(false),
            session_id: Mutex::new(None),
            resume_configured: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
            live: Mutex::new(None),
            shutdown: CancellationToken::new(),
            restart: Notify::new(),
            ready_notify: Notify::new(),
            last_inbound: Mutex::new(Instant::now()),
        }
    }

    /// Whether the transport is up and the live send path enabled.
    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Whether the handshake completed and a session id was assigned.
    pub(crate) fn is_ready(&self) -> bool {
        self.is_connected() && self.session_id.lock().is_some()
    }

    /// Whether a manual closure made this socket terminal.
    pub(crate) fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Server-assigned session id from the last `ready` frame.
    pub(crate) fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    /// Sends a command, or queues it for the next session.
    ///
    /// Commands are never dropped: while disconnected (or on a transient
    /// live-path failure) they wait in the outbound queue and are flushed
    /// in order on reconnect.
    pub(crate) fn send(&self, message: &OutgoingMessage) {
        let raw = match serde_json::to_string(message) {
            Ok(raw) => raw,
            Err(e) => {
                // Serialization of protocol types cannot realistically fail.
                log::error!("[WS] failed to serialize outbound op: {e}");
                return;
            }
        };
        if self.is_connected() {
            if let Some(tx) = &*self.live.lock() {
                if tx.send(Message::Text(raw.clone().into())).is_ok() {
                    return;
                }
            }
        }
        log::debug!("[WS] not connected, queueing outbound op");
        self.queue.lock().push_back(raw);
    }

    /// Sends a transport-level ping to provoke pong traffic.
    ///
    /// Returns `false` when no live session exists.
    pub(crate) fn ping(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        match &*self.live.lock() {
            Some(tx) => tx.send(Message::Ping(Bytes::new())).is_ok(),
            None => false,
        }
    }

    /// Whether any inbound traffic arrived recently enough to call the
    /// transport responsive.
    pub(crate) fn is_responsive(&self) -> bool {
        self.last_inbound.lock().elapsed() < INBOUND_STALE_AFTER
    }

    /// Marks the socket terminally closed. No further auto-reconnect.
    pub(crate) fn manual_closure(&self) {
        log::info!("[WS] manual closure requested");
        self.shutdown.cancel();
    }

    /// Tears down the current session; the reconnect loop starts a fresh
    /// one. Used by health-check remediation.
    pub(crate) fn force_reconnect(&self) {
        self.restart.notify_waiters();
    }

    /// Suspends until the node is ready, or fails after `timeout`.
    pub(crate) async fn wait_until_ready(&self, timeout: Duration) -> MaestroResult<()> {
        let wait = async {
            loop {
                let notified = self.ready_notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.is_ready() {
                    return;
                }
                notified.as_mut().await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| MaestroError::Timeout("node ready"))
    }

    /// Number of commands waiting for the next session.
    #[cfg(test)]
    pub(crate) fn queued_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Puts the socket into the ready state without a transport.
    #[cfg(test)]
    pub(crate) fn force_ready(&self) {
        let (tx, rx) = mpsc::unbounded_channel();
        std::mem::forget(rx);
        self.mark_connected(tx);
        self.store_session("test-session".into());
    }

    /// Simulates a dropped transport.
    #[cfg(test)]
    pub(crate) fn force_disconnected(&self) {
        self.mark_disconnected();
    }

    fn touch_inbound(&self) {
        *self.last_inbound.lock() = Instant::now();
    }

    fn drain_queued(&self) -> Vec<String> {
        self.queue.lock().drain(..).collect()
    }

    fn requeue_front(&self, raw: Vec<String>) {
        let mut queue = self.queue.lock();
        for item in raw.into_iter().rev() {
            queue.push_front(item);
        }
    }

    fn mark_connected(&self, tx: mpsc::UnboundedSender<Message>) {
        *self.live.lock() = Some(tx);
        self.connected.store(true, Ordering::SeqCst);
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        *self.live.lock() = None;
    }

    fn store_session(&self, session_id: String) {
        *self.session_id.lock() = Some(session_id);
        self.ready_notify.notify_waiters();
    }

    /// Asks the server to retain session state across a brief reconnect.
    /// Sent once, after first becoming ready.
    fn configure_resuming(&self) {
        let Some(key) = &self.resume_key else { return };
        if self.resume_configured.swap(true, Ordering::SeqCst) {
            return;
        }
        self.send(&OutgoingMessage::ConfigureResuming {
            key: key.clone(),
            timeout: self.resume_timeout_secs,
        });
    }
}

impl std::fmt::Debug for NodeSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSocket")
            .field("url", &self.url)
            .field("connected", &self.is_connected())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection Task
// ─────────────────────────────────────────────────────────────────────────────

/// How one session ended, reported to the pool for fail-over.
struct SessionEnd {
    code: Option<u16>,
    reason: String,
}

/// Spawns the background connect/receive/reconnect task for a node.
pub(crate) fn spawn(node: &Arc<Node>) {
    let weak = Arc::downgrade(node);
    tokio::spawn(run(weak));
}

fn build_request(
    socket: &NodeSocket,
) -> MaestroResult<tokio_tungstenite::tungstenite::handshake::client::Request> {
    let invalid = |what: &str| MaestroError::InvalidConfig(format!("invalid {what} header value"));

    let mut request = socket
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| MaestroError::InvalidConfig(e.to_string()))?;
    let headers = request.headers_mut();
    headers.insert(
        "Authorization",
        HeaderValue::from_str(&socket.password).map_err(|_| invalid("Authorization"))?,
    );
    headers.insert(
        "User-Id",
        HeaderValue::from_str(&socket.user_id.to_string()).map_err(|_| invalid("User-Id"))?,
    );
    headers.insert(
        "Client-Name",
        HeaderValue::from_str(&socket.client_name).map_err(|_| invalid("Client-Name"))?,
    );
    if let Some(key) = &socket.resume_key {
        headers.insert(
            "Resume-Key",
            HeaderValue::from_str(key).map_err(|_| invalid("Resume-Key"))?,
        );
    }
    Ok(request)
}

/// A session shorter than this does not count as proof the node is
/// healthy: a flapping node that completes the handshake and then drops
/// the connection must keep paying the backoff delay.
const STABLE_SESSION: Duration = Duration::from_secs(30);

/// Connect/backoff/reconnect loop. Runs for the lifetime of the node.
async fn run(weak: Weak<Node>) {
    let mut backoff = Backoff::default();

    loop {
        let Some(node) = weak.upgrade() else { return };
        let identifier = node.identifier().to_string();
        let socket = node.socket();
        if socket.is_shut_down() {
            return;
        }

        let request = match build_request(socket) {
            Ok(request) => request,
            Err(e) => {
                log::error!("[WS] {identifier}: fatal configuration error: {e}");
                return;
            }
        };

        match connect_async(request).await {
            Ok((stream, _response)) => {
                log::info!("[WS] {identifier}: connected");

                let started = Instant::now();
                let end = run_session(&node, stream).await;
                log::warn!(
                    "[WS] {identifier}: disconnected (code: {:?}, reason: {})",
                    end.code,
                    end.reason
                );

                if let Some(pool) = node.pool() {
                    pool.node_disconnect(&node, end.code, &end.reason).await;
                }
                if socket.is_shut_down() {
                    log::info!("[WS] {identifier}: closed for a deliberate reason, not reconnecting");
                    return;
                }

                if let Some(delay) = after_session(&mut backoff, started.elapsed()) {
                    let attempts = backoff.attempts();
                    let max = socket.max_reconnect_attempts;
                    if max >= 0 && attempts > max as u32 {
                        log::error!(
                            "[WS] {identifier}: giving up after {attempts} short-lived sessions"
                        );
                        return;
                    }
                    log::warn!(
                        "[WS] {identifier}: session ended early (attempt {attempts}); reconnecting in {delay:?}"
                    );
                    tokio::select! {
                        _ = socket.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
            Err(WsError::Http(response)) if is_auth_status(response.status().as_u16()) => {
                // Credentials are wrong; retrying is futile.
                log::error!(
                    "[WS] {identifier}: handshake rejected with {}, giving up",
                    response.status()
                );
                return;
            }
            Err(e) => {
                let delay = backoff.delay();
                let attempts = backoff.attempts();
                let max = node.socket().max_reconnect_attempts;
                if max >= 0 && attempts > max as u32 {
                    log::error!(
                        "[WS] {identifier}: giving up after {attempts} failed connect attempts: {e}"
                    );
                    return;
                }
                log::warn!(
                    "[WS] {identifier}: connect failed (attempt {attempts}): {e}; retrying in {delay:?}"
                );
                let socket = node.socket();
                tokio::select! {
                    _ = socket.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

fn is_auth_status(status: u16) -> bool {
    matches!(status, 401 | 403)
}

/// Post-session backoff bookkeeping. A session that stayed up long enough
/// clears the backoff and permits an immediate reconnect; a shorter one
/// counts as a failed attempt and returns the delay to wait out first.
fn after_session(backoff: &mut Backoff, session: Duration) -> Option<Duration> {
    if session >= STABLE_SESSION {
        backoff.reset();
        None
    } else {
        Some(backoff.delay())
    }
}

/// Drives one established connection until it ends.
async fn run_session(
    node: &Arc<Node>,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
) -> SessionEnd {
    let socket = node.socket();
    let (mut sink, mut inbound) = stream.split();

    // Flush the disconnected-era queue before enabling the live path, so
    // queued commands can never reorder with fresh sends.
    let queued = socket.drain_queued();
    for (index, raw) in queued.iter().enumerate() {
        if let Err(e) = sink.send(Message::Text(raw.clone().into())).await {
            socket.requeue_front(queued[index..].to_vec());
            return SessionEnd {
                code: None,
                reason: format!("flush failed: {e}"),
            };
        }
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    socket.mark_connected(tx);
    socket.touch_inbound();

    // A command pulled off the channel but refused by the sink; preserved
    // for the next session ahead of everything still in the channel.
    let mut in_flight: Option<String> = None;

    let end = loop {
        tokio::select! {
            _ = socket.shutdown.cancelled() => {
                let frame = CloseFrame {
                    code: CloseCode::Library(CLOSE_CODE_MANUAL),
                    reason: "manual closure".into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                break SessionEnd {
                    code: Some(CLOSE_CODE_MANUAL),
                    reason: "manual closure".into(),
                };
            }
            _ = socket.restart.notified() => {
                let _ = sink.send(Message::Close(None)).await;
                break SessionEnd {
                    code: None,
                    reason: "restart requested by health check".into(),
                };
            }
            outbound = rx.recv() => {
                let Some(message) = outbound else {
                    break SessionEnd { code: None, reason: "send channel closed".into() };
                };
                let text = match &message {
                    Message::Text(text) => Some(text.as_str().to_owned()),
                    _ => None,
                };
                if let Err(e) = sink.send(message).await {
                    in_flight = text;
                    break SessionEnd { code: None, reason: format!("send failed: {e}") };
                }
            }
            frame = inbound.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    socket.touch_inbound();
                    handle_frame(node, text.as_str()).await;
                }
                Some(Ok(Message::Ping(payload))) => {
                    socket.touch_inbound();
                    let _ = sink.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Pong(_))) => socket.touch_inbound(),
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unzip();
                    break SessionEnd {
                        code,
                        reason: reason.unwrap_or_else(|| "closed by remote".into()),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break SessionEnd { code: None, reason: e.to_string() },
                None => break SessionEnd { code: None, reason: "connection closed".into() },
            }
        }
    };

    // Disable the live path, then preserve anything still in flight.
    socket.mark_disconnected();
    salvage_outbound(socket, in_flight, &mut rx);
    end
}

/// Puts unsent commands back into the disconnected-era queue: a message
/// the sink rejected goes to the front, everything still sitting in the
/// channel keeps its order behind it.
fn salvage_outbound(
    socket: &NodeSocket,
    in_flight: Option<String>,
    rx: &mut mpsc::UnboundedReceiver<Message>,
) {
    if let Some(raw) = in_flight {
        socket.requeue_front(vec![raw]);
    }
    while let Ok(message) = rx.try_recv() {
        if let Message::Text(text) = message {
            socket.queue.lock().push_back(text.as_str().to_owned());
        }
    }
}

/// Dispatches one inbound frame by its `op` field, strictly in arrival
/// order.
async fn handle_frame(node: &Arc<Node>, raw: &str) {
    let message: IncomingMessage = match serde_json::from_str(raw) {
        Ok(message) => message,
        Err(e) => {
            log::debug!(
                "[WS] {}: dropping unrecognized frame: {e}",
                node.identifier()
            );
            return;
        }
    };

    match message {
        IncomingMessage::Ready {
            session_id,
            resumed,
        } => {
            log::info!(
                "[WS] {}: ready (session: {session_id}, resumed: {resumed})",
                node.identifier()
            );
            node.socket().store_session(session_id);
            node.socket().configure_resuming();
            if let Some(pool) = node.pool() {
                pool.node_connect(node, resumed).await;
            }
        }
        IncomingMessage::Stats { stats } => node.update_stats(stats),
        IncomingMessage::PlayerUpdate { guild_id, state } => {
            let Ok(guild) = guild_id.parse::<u64>() else {
                return;
            };
            if let Some(pool) = node.pool() {
                if let Some(player) = pool.players().get(guild) {
                    player.update_state(&state);
                }
            }
        }
        IncomingMessage::Event { event } => node.handle_event(event).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_socket() -> NodeSocket {
        let node_config = NodeConfig::new("127.0.0.1", 2333, "secret");
        let pool_config = PoolConfig::new(1234);
        NodeSocket::new(&node_config, &pool_config)
    }

    fn stop_op(guild: &str) -> OutgoingMessage {
        OutgoingMessage::Stop {
            guild_id: guild.into(),
        }
    }

    #[test]
    fn sends_while_disconnected_queue_in_order() {
        let socket = test_socket();
        socket.send(&stop_op("1"));
        socket.send(&stop_op("2"));
        socket.send(&stop_op("3"));

        let drained = socket.drain_queued();
        assert_eq!(drained.len(), 3);
        assert!(drained[0].contains("\"guildId\":\"1\""));
        assert!(drained[1].contains("\"guildId\":\"2\""));
        assert!(drained[2].contains("\"guildId\":\"3\""));
    }

    #[test]
    fn flush_precedes_live_sends() {
        let socket = test_socket();
        socket.send(&stop_op("a"));
        socket.send(&stop_op("b"));

        // Simulate the session setup: drain first, then enable live path.
        let flushed = socket.drain_queued();
        let (tx, mut rx) = mpsc::unbounded_channel();
        socket.mark_connected(tx);
        socket.send(&stop_op("d"));

        assert_eq!(flushed.len(), 2);
        assert!(flushed[0].contains("\"a\""));
        let live = rx.try_recv().expect("live send should hit the channel");
        match live {
            Message::Text(text) => assert!(text.as_str().contains("\"d\"")),
            other => panic!("unexpected message: {other:?}"),
        }
        assert_eq!(socket.queued_len(), 0);
    }

    #[test]
    fn requeue_front_preserves_order() {
        let socket = test_socket();
        socket.send(&stop_op("3"));
        socket.requeue_front(vec!["one".into(), "two".into()]);
        let drained = socket.drain_queued();
        assert_eq!(drained[0], "one");
        assert_eq!(drained[1], "two");
        assert!(drained[2].contains("\"3\""));
    }

    #[test]
    fn failed_live_send_lands_ahead_of_channel_leftovers() {
        let socket = test_socket();
        let (tx, mut rx) = mpsc::unbounded_channel();

        // The sink rejected "a" mid-send; "b" and "c" never left the channel.
        for guild in ["b", "c"] {
            let raw = serde_json::to_string(&stop_op(guild)).unwrap();
            tx.send(Message::Text(raw.into())).unwrap();
        }
        let rejected = serde_json::to_string(&stop_op("a")).unwrap();
        salvage_outbound(&socket, Some(rejected), &mut rx);

        let drained = socket.drain_queued();
        assert_eq!(drained.len(), 3);
        assert!(drained[0].contains("\"guildId\":\"a\""));
        assert!(drained[1].contains("\"guildId\":\"b\""));
        assert!(drained[2].contains("\"guildId\":\"c\""));
    }

    #[test]
    fn short_sessions_keep_paying_the_backoff() {
        let mut backoff = Backoff::default();

        let first = after_session(&mut backoff, Duration::from_millis(200))
            .expect("a short session must produce a delay");
        let second = after_session(&mut backoff, Duration::from_millis(200))
            .expect("repeated flapping must keep delaying");
        assert!(second >= first, "flapping must not shrink the delay");

        // A session that stayed up clears the state again.
        assert!(after_session(&mut backoff, STABLE_SESSION).is_none());
        assert_eq!(backoff.attempts(), 0);
    }

    #[test]
    fn manual_closure_is_terminal() {
        let socket = test_socket();
        assert!(!socket.is_shut_down());
        socket.manual_closure();
        assert!(socket.is_shut_down());
        assert!(!socket.ping());
    }

    #[test]
    fn session_id_makes_socket_ready() {
        let socket = test_socket();
        let (tx, _rx) = mpsc::unbounded_channel();
        socket.mark_connected(tx);
        assert!(!socket.is_ready());
        socket.store_session("abc".into());
        assert!(socket.is_ready());
        assert_eq!(socket.session_id().as_deref(), Some("abc"));
    }

    #[test]
    fn resume_is_configured_once() {
        let node_config = NodeConfig {
            resume_key: Some("resume-me".into()),
            ..NodeConfig::new("127.0.0.1", 2333, "secret")
        };
        let socket = NodeSocket::new(&node_config, &PoolConfig::new(1));
        socket.configure_resuming();
        socket.configure_resuming();
        // Disconnected, so the frames landed in the queue: exactly one.
        assert_eq!(socket.queued_len(), 1);
        assert!(socket.drain_queued()[0].contains("configureResuming"));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_until_ready_times_out() {
        let socket = Arc::new(test_socket());
        let err = socket
            .wait_until_ready(Duration::from_millis(50))
            .await
            .expect_err("socket never becomes ready");
        assert!(matches!(err, MaestroError::Timeout(_)));
    }
}
