//! One peer of a connected WebSocket.
//!
//! An [`Endpoint`] owns exactly one reader task and one writer task for
//! its socket. Outbound messages go through a bounded queue drained by
//! the writer; application code never touches the socket. The handshake
//! phase machine gates what traffic is acceptable, and the single
//! idempotent [`Endpoint::close`] collapses every failure path - writer
//! overflow, reader I/O error, protocol violation, local shutdown - into
//! one ordered teardown that fires observers exactly once.
//!
//! ```text
//! INIT → HELLO_WAIT → HELLO_SENT → ESTABLISHED → DRAINING → CLOSED
//!                                      │
//!                                      └→ FAILED → (reconnect driver)
//! ```

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::{fmt, time::Duration};

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::error::{Error, Result};
use crate::events::Event;
use crate::protocol::types::Role;

/// Handshake phase of an endpoint.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Phase {
    /// Socket established, nothing exchanged.
    Init = 0,
    /// Server side: awaiting `client/hello`.
    HelloWait = 1,
    /// Client side: `client/hello` sent, awaiting `server/hello`.
    HelloSent = 2,
    /// Handshake complete; role-appropriate traffic allowed.
    Established = 3,
    /// Local close initiated; in-flight sends complete, no new sends.
    Draining = 4,
    /// Terminal.
    Closed = 5,
    /// Terminal on this endpoint; the reconnect driver may start a new
    /// one.
    Failed = 6,
}

impl Phase {
    fn from_u8(value: u8) -> Phase {
        match value {
            0 => Phase::Init,
            1 => Phase::HelloWait,
            2 => Phase::HelloSent,
            3 => Phase::Established,
            4 => Phase::Draining,
            6 => Phase::Failed,
            _ => Phase::Closed,
        }
    }

    /// `true` once no further traffic will flow.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Closed | Phase::Failed)
    }
}

/// Why an endpoint closed.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum CloseReason {
    /// Orderly local or remote shutdown.
    Normal,
    /// Peer violated the protocol (wrong phase, bad handshake).
    ProtocolError,
    /// Outbound queue overflowed.
    Overflow,
    /// Socket-level failure.
    TransportError,
    /// A newer endpoint presented the same `client_id`.
    DuplicateClientId,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::Normal => "normal",
            CloseReason::ProtocolError => "protocol-error",
            CloseReason::Overflow => "overflow",
            CloseReason::TransportError => "transport-error",
            CloseReason::DuplicateClientId => "duplicate-client-id",
        };
        write!(f, "{s}")
    }
}

/// Inbound traffic handed to the session logic, already phase-gated.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Inbound {
    /// A text frame.
    Text(String),
    /// A binary frame.
    Binary(Vec<u8>),
}

/// Do not parse exceedingly large messages, to prevent out-of-memory
/// conditions from a hostile peer.
const MAX_TEXT_LEN: usize = 64 * 1024;

struct Tasks {
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

/// Cleanup installed by whoever registered the endpoint elsewhere
/// (group membership, server registry). Each hook is taken and run
/// exactly once by the close routine.
type CleanupFn = Box<dyn FnOnce() + Send>;

/// One peer of a connected WebSocket; see the module docs.
pub struct Endpoint {
    /// Peer description for logs (socket address or URL).
    peer: String,
    phase: AtomicU8,
    queue_tx: mpsc::Sender<WsMessage>,
    drain_tx: watch::Sender<bool>,
    cancel_tx: watch::Sender<bool>,
    closed_tx: watch::Sender<Option<CloseReason>>,
    stream_active: AtomicBool,
    drain_deadline: Duration,
    client_id: OnceLock<String>,
    roles: OnceLock<Vec<Role>>,
    tasks: Mutex<Tasks>,
    cleanup: Mutex<Vec<CleanupFn>>,
    events: Mutex<Option<mpsc::UnboundedSender<Event>>>,
    close_started: AtomicBool,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("peer", &self.peer)
            .field("phase", &self.phase())
            .field("client_id", &self.client_id.get())
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    /// Spawns the reader and writer tasks over an accepted or connected
    /// WebSocket and returns the endpoint handle plus the inbound
    /// channel for the session logic.
    ///
    /// `initial_phase` is [`Phase::HelloWait`] on the accepting side and
    /// [`Phase::Init`] on the connecting side (which advances to
    /// [`Phase::HelloSent`] after sending its hello).
    pub fn spawn<S>(
        socket: WebSocketStream<S>,
        peer: String,
        initial_phase: Phase,
        queue_depth: usize,
        drain_deadline: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Inbound>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (queue_tx, queue_rx) = mpsc::channel(queue_depth);
        let (drain_tx, drain_rx) = watch::channel(false);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (closed_tx, _) = watch::channel(None);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let endpoint = Arc::new(Self {
            peer,
            phase: AtomicU8::new(initial_phase as u8),
            queue_tx,
            drain_tx,
            cancel_tx,
            closed_tx,
            stream_active: AtomicBool::new(false),
            drain_deadline,
            client_id: OnceLock::new(),
            roles: OnceLock::new(),
            tasks: Mutex::new(Tasks {
                reader: None,
                writer: None,
            }),
            cleanup: Mutex::new(Vec::new()),
            events: Mutex::new(None),
            close_started: AtomicBool::new(false),
        });

        let (sink, stream) = socket.split();
        let reader = tokio::spawn(Self::read_loop(
            Arc::clone(&endpoint),
            stream,
            inbound_tx,
            cancel_rx,
        ));
        let writer = tokio::spawn(Self::write_loop(
            Arc::clone(&endpoint),
            sink,
            queue_rx,
            drain_rx,
        ));
        {
            let mut tasks = endpoint.tasks.lock().expect("endpoint tasks lock");
            tasks.reader = Some(reader);
            tasks.writer = Some(writer);
        }

        (endpoint, inbound_rx)
    }

    /// Peer description used in logs.
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Current handshake phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Declared client id; set once at handshake completion.
    #[must_use]
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.get().map(String::as_str)
    }

    /// Declared role set; immutable after handshake completion.
    #[must_use]
    pub fn roles(&self) -> &[Role] {
        self.roles.get().map_or(&[], Vec::as_slice)
    }

    /// `true` if the peer declared `role`.
    #[must_use]
    pub fn has_role(&self, role: Role) -> bool {
        self.roles().contains(&role)
    }

    /// Marks a binary-capable stream as active or inactive for this
    /// endpoint; binary frames arriving while inactive are dropped.
    pub fn set_stream_active(&self, active: bool) {
        self.stream_active.store(active, Ordering::Release);
    }

    /// Installs the events channel; replaces any previous one.
    pub fn set_event_sink(&self, sink: mpsc::UnboundedSender<Event>) {
        *self.events.lock().expect("endpoint events lock") = Some(sink);
    }

    /// Adds a deregistration hook run exactly once on close.
    pub fn add_cleanup(&self, cleanup: impl FnOnce() + Send + 'static) {
        self.cleanup
            .lock()
            .expect("endpoint cleanup lock")
            .push(Box::new(cleanup));
    }

    fn event_sink(&self) -> Option<mpsc::UnboundedSender<Event>> {
        self.events.lock().expect("endpoint events lock").clone()
    }

    /// Advances the handshake machine one step.
    ///
    /// # Errors
    ///
    /// Returns `WrongPhase` when `from` is not the current phase.
    pub fn advance(&self, from: Phase, to: Phase) -> Result<()> {
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|actual| {
                Error::wrong_phase(format!(
                    "cannot move {:?} → {to:?} while {:?}",
                    from,
                    Phase::from_u8(actual)
                ))
            })?;
        Ok(())
    }

    /// Completes the handshake: pins the peer's identity and role set
    /// and enters [`Phase::Established`].
    ///
    /// # Errors
    ///
    /// Returns `WrongPhase` if called twice or out of order.
    pub fn establish(&self, client_id: String, roles: Vec<Role>) -> Result<()> {
        let from = match self.phase() {
            Phase::HelloWait => Phase::HelloWait,
            Phase::HelloSent => Phase::HelloSent,
            other => {
                return Err(Error::wrong_phase(format!(
                    "handshake completion while {other:?}"
                )))
            }
        };
        self.advance(from, Phase::Established)?;
        self.client_id.set(client_id).ok();
        self.roles.set(roles).ok();
        Ok(())
    }

    /// Enqueues a text frame.
    ///
    /// # Errors
    ///
    /// Returns `WrongPhase` when draining or closed, and `BufferOverrun`
    /// when the queue is full - in which case the endpoint is closed
    /// with retry enabled.
    pub fn send_text(self: &Arc<Self>, text: String) -> Result<()> {
        if matches!(self.phase(), Phase::Draining | Phase::Closed | Phase::Failed) {
            return Err(Error::wrong_phase("send after close"));
        }
        self.enqueue(WsMessage::text(text))
    }

    /// Enqueues a binary frame.
    ///
    /// # Errors
    ///
    /// As [`Endpoint::send_text`], plus `WrongPhase` when no stream is
    /// active for this endpoint.
    pub fn send_binary(self: &Arc<Self>, bytes: Vec<u8>) -> Result<()> {
        if self.phase() != Phase::Established {
            return Err(Error::wrong_phase("binary send outside ESTABLISHED"));
        }
        if !self.stream_active.load(Ordering::Acquire) {
            return Err(Error::wrong_phase("binary send without active stream"));
        }
        self.enqueue(WsMessage::binary(bytes))
    }

    fn enqueue(self: &Arc<Self>, message: WsMessage) -> Result<()> {
        match self.queue_tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("[{}] send queue overflow", self.peer);
                self.close(CloseReason::Overflow, true);
                Err(Error::overrun("send queue full"))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::cancelled("writer gone")),
        }
    }

    /// Initiates the idempotent close protocol.
    ///
    /// The first caller wins; every caller observes the same effect and
    /// no callback fires twice. The teardown itself runs in a detached
    /// task, so cancellation of the calling task cannot leave the
    /// endpoint in a partial state.
    pub fn close(self: &Arc<Self>, reason: CloseReason, retry: bool) {
        if self.close_started.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("[{}] closing: {reason} (retry={retry})", self.peer);
        self.phase.store(Phase::Draining as u8, Ordering::Release);

        let endpoint = Arc::clone(self);
        tokio::spawn(async move {
            endpoint.run_close(reason, retry).await;
        });
    }

    /// Waits until the endpoint reaches a terminal phase and reports the
    /// close reason.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.closed_tx.subscribe();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return CloseReason::Normal;
            }
        }
    }

    async fn run_close(self: Arc<Self>, reason: CloseReason, retry: bool) {
        // 1. Reader stops promptly.
        self.cancel_tx.send_replace(true);

        // 2. Writer drains its queue, bounded by the close deadline.
        self.drain_tx.send_replace(true);
        let (reader, writer) = {
            let mut tasks = self.tasks.lock().expect("endpoint tasks lock");
            (tasks.reader.take(), tasks.writer.take())
        };
        if let Some(mut writer) = writer {
            if tokio::time::timeout(self.drain_deadline, &mut writer)
                .await
                .is_err()
            {
                warn!("[{}] writer did not drain within deadline", self.peer);
                writer.abort();
            }
        }
        if let Some(reader) = reader {
            reader.abort();
            let _ = reader.await;
        }

        // 3./4. Deregister exactly once, then notify observers exactly
        // once. The hooks are taken out of their slot, so a concurrent
        // close cannot run them twice.
        let cleanups = std::mem::take(&mut *self.cleanup.lock().expect("endpoint cleanup lock"));
        for cleanup in cleanups {
            cleanup();
        }
        if let Some(events) = self.event_sink() {
            let _ = events.send(Event::PeerDisconnected {
                client_id: self.client_id.get().cloned(),
                reason,
            });
        }

        // 5. Terminal phase; FAILED tells the reconnect driver to run
        // its backoff loop.
        let terminal = if retry { Phase::Failed } else { Phase::Closed };
        self.phase.store(terminal as u8, Ordering::Release);
        self.closed_tx.send_replace(Some(reason));
        info!("[{}] closed: {reason}", self.peer);
    }

    async fn read_loop<S>(
        endpoint: Arc<Self>,
        mut stream: futures_util::stream::SplitStream<WebSocketStream<S>>,
        inbound: mpsc::UnboundedSender<Inbound>,
        mut cancel: watch::Receiver<bool>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        loop {
            let message = tokio::select! {
                () = async {
                    // Wait for the cancel flag to flip.
                    while !*cancel.borrow_and_update() {
                        if cancel.changed().await.is_err() {
                            break;
                        }
                    }
                } => break,
                message = stream.next() => message,
            };

            match message {
                Some(Ok(WsMessage::Text(text))) => {
                    if text.len() > MAX_TEXT_LEN {
                        warn!(
                            "[{}] ignoring oversized text message of {} bytes",
                            endpoint.peer,
                            text.len()
                        );
                        continue;
                    }
                    if inbound.send(Inbound::Text(text)).is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Binary(bytes))) => {
                    if endpoint.phase() != Phase::Established {
                        warn!("[{}] binary frame before handshake", endpoint.peer);
                        endpoint.close(CloseReason::ProtocolError, false);
                        break;
                    }
                    if !endpoint.stream_active.load(Ordering::Acquire) {
                        debug!("[{}] dropping binary frame outside active stream", endpoint.peer);
                        continue;
                    }
                    if inbound.send(Inbound::Binary(bytes)).is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    endpoint.close(CloseReason::Normal, false);
                    break;
                }
                Some(Ok(_)) => {} // ping/pong handled by tungstenite
                Some(Err(e)) => {
                    warn!("[{}] read error: {e}", endpoint.peer);
                    endpoint.close(CloseReason::TransportError, true);
                    break;
                }
            }
        }
    }

    async fn write_loop<S>(
        endpoint: Arc<Self>,
        mut sink: futures_util::stream::SplitSink<WebSocketStream<S>, WsMessage>,
        mut queue: mpsc::Receiver<WsMessage>,
        mut drain: watch::Receiver<bool>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        loop {
            let message = tokio::select! {
                message = queue.recv() => message,
                _ = drain.changed() => {
                    if *drain.borrow() {
                        // Drain whatever was queued before the close, then
                        // stop accepting.
                        while let Ok(message) = queue.try_recv() {
                            if let Err(e) = sink.send(message).await {
                                debug!("[{}] write during drain failed: {e}", endpoint.peer);
                                break;
                            }
                        }
                        break;
                    }
                    continue;
                }
            };

            let Some(message) = message else { break };
            if let Err(e) = sink.send(message).await {
                warn!("[{}] write error: {e}", endpoint.peer);
                endpoint.close(CloseReason::TransportError, true);
                break;
            }
        }
        let _ = sink.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role as WsRole;

    async fn pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (a, b) = tokio::io::duplex(16 * 1024);
        let server = WebSocketStream::from_raw_socket(a, WsRole::Server, None).await;
        let client = WebSocketStream::from_raw_socket(b, WsRole::Client, None).await;
        (server, client)
    }

    fn spawn_endpoint(
        socket: WebSocketStream<DuplexStream>,
        phase: Phase,
    ) -> (Arc<Endpoint>, mpsc::UnboundedReceiver<Inbound>) {
        Endpoint::spawn(
            socket,
            "test".to_string(),
            phase,
            8,
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn concurrent_close_fires_observers_once() {
        let (server, _client) = pair().await;
        let (endpoint, _inbound) = spawn_endpoint(server, Phase::HelloWait);

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        endpoint.set_event_sink(event_tx);
        let cleanups = Arc::new(AtomicU8::new(0));
        {
            let cleanups = Arc::clone(&cleanups);
            endpoint.add_cleanup(move || {
                cleanups.fetch_add(1, Ordering::SeqCst);
            });
        }

        // A close storm: external close, overflow-style close, and a
        // transport-style close racing within the same instant.
        let mut joins = Vec::new();
        for reason in [
            CloseReason::Normal,
            CloseReason::Overflow,
            CloseReason::TransportError,
        ] {
            let endpoint = Arc::clone(&endpoint);
            joins.push(tokio::spawn(async move {
                endpoint.close(reason, false);
            }));
        }
        for join in joins {
            join.await.unwrap();
        }
        endpoint.closed().await;

        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        let first = event_rx.recv().await;
        assert!(matches!(first, Some(Event::PeerDisconnected { .. })));
        assert!(event_rx.try_recv().is_err(), "second disconnect event");
    }

    #[tokio::test]
    async fn establish_pins_identity_and_rejects_reentry() {
        let (server, _client) = pair().await;
        let (endpoint, _inbound) = spawn_endpoint(server, Phase::HelloWait);

        endpoint
            .establish("c1".to_string(), vec![Role::Player])
            .unwrap();
        assert_eq!(endpoint.phase(), Phase::Established);
        assert_eq!(endpoint.client_id(), Some("c1"));
        assert!(endpoint.has_role(Role::Player));

        let err = endpoint
            .establish("c2".to_string(), vec![Role::Metadata])
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::WrongPhase);
        // Identity is immutable after handshake.
        assert_eq!(endpoint.client_id(), Some("c1"));
    }

    #[tokio::test]
    async fn binary_send_requires_active_stream() {
        let (server, _client) = pair().await;
        let (endpoint, _inbound) = spawn_endpoint(server, Phase::HelloWait);
        endpoint
            .establish("c1".to_string(), vec![Role::Player])
            .unwrap();

        assert!(endpoint.send_binary(vec![0; 9]).is_err());
        endpoint.set_stream_active(true);
        assert!(endpoint.send_binary(vec![0; 9]).is_ok());
    }

    #[tokio::test]
    async fn queue_overflow_closes_with_retry() {
        let (server, _client) = pair().await;
        // Depth 1 and an unread peer: once the transport backs up, the
        // queue overflows.
        let (endpoint, _inbound) = Endpoint::spawn(
            server,
            "test".to_string(),
            Phase::HelloWait,
            1,
            Duration::from_millis(50),
        );
        endpoint
            .establish("c1".to_string(), vec![Role::Player])
            .unwrap();

        // Large frames fill the 16 KiB duplex quickly, wedging the
        // writer mid-send so the bounded queue backs up.
        let big = "x".repeat(32 * 1024);
        let mut overflowed = false;
        for _ in 0..64 {
            if endpoint.send_text(big.clone()).is_err() {
                overflowed = true;
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(overflowed);
        assert_eq!(endpoint.closed().await, CloseReason::Overflow);
        assert_eq!(endpoint.phase(), Phase::Failed);
    }

    #[tokio::test]
    async fn peer_text_reaches_inbound_channel() {
        let (server, mut client) = pair().await;
        let (_endpoint, mut inbound) = spawn_endpoint(server, Phase::HelloWait);

        client
            .send(WsMessage::text(r#"{"type":"client/time","payload":{"client_transmitted":1}}"#))
            .await
            .unwrap();
        let received = inbound.recv().await.unwrap();
        assert!(matches!(received, Inbound::Text(t) if t.contains("client/time")));
    }

    #[tokio::test]
    async fn binary_before_handshake_is_protocol_error() {
        let (server, mut client) = pair().await;
        let (endpoint, _inbound) = spawn_endpoint(server, Phase::HelloWait);

        client.send(WsMessage::binary(vec![0u8; 16])).await.unwrap();
        assert_eq!(endpoint.closed().await, CloseReason::ProtocolError);
    }
}
