//! Server endpoint assembly.
//!
//! A [`Server`] owns the WebSocket listener, the per-connection session
//! loops, the [`GroupEngine`], and - for server-initiated connections to
//! advertised clients - a [`ReconnectDriver`]. The session loop is the
//! same for accepted and dialed sockets: in both flows the peer opens
//! with `client/hello` and the server answers with `server/hello`
//! before anything else reaches that peer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

use crate::clock::MonotonicClock;
use crate::config::Config;
use crate::endpoint::{CloseReason, Endpoint, Inbound, Phase};
use crate::error::{Error, Result};
use crate::events::Event;
use crate::group::{AppAdapter, GroupEngine};
use crate::protocol::messages::{ClientHello, ClientMessage, ServerHello, ServerMessage, ServerTime};
use crate::protocol::types::Role;
use crate::reconnect::ReconnectDriver;
use crate::stream::EncoderFactory;

/// Codec failures tolerated per endpoint before the connection is
/// considered hostile and closed.
const CODEC_ERROR_LIMIT: u32 = 8;

/// A Resonate server: listener, sessions, groups.
pub struct Server {
    config: Config,
    clock: MonotonicClock,
    engine: Arc<GroupEngine>,
    endpoints: Mutex<HashMap<String, Arc<Endpoint>>>,
    events_tx: mpsc::UnboundedSender<Event>,
}

impl Server {
    /// Creates a server; the returned receiver observes engine and
    /// endpoint lifecycle events.
    pub fn new(
        config: Config,
        app: Arc<dyn AppAdapter>,
        factory: Arc<dyn EncoderFactory>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let clock = MonotonicClock::new();
        let engine = GroupEngine::new(app, factory, clock);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        engine.set_event_sink(events_tx.clone());
        (
            Arc::new(Self {
                config,
                clock,
                engine,
                endpoints: Mutex::new(HashMap::new()),
                events_tx,
            }),
            events_rx,
        )
    }

    /// The group engine, for application-level control (playback,
    /// metadata, volume).
    #[must_use]
    pub fn engine(&self) -> &Arc<GroupEngine> {
        &self.engine
    }

    /// The server's reference clock.
    #[must_use]
    pub fn clock(&self) -> MonotonicClock {
        self.clock
    }

    /// Binds the configured listener and serves until the task is
    /// cancelled.
    ///
    /// # Errors
    ///
    /// Returns `Transport` when the listener cannot bind.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind((self.config.bind_addr, self.config.port)).await?;
        info!("listening on {}", self.config.local_url());
        self.serve(listener).await
    }

    /// Accept loop over an already bound listener.
    ///
    /// # Errors
    ///
    /// Returns `Transport` when accepting fails fatally.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.accept_connection(stream, peer_addr.to_string()).await {
                    debug!("[{peer_addr}] connection ended: {e}");
                }
            });
        }
    }

    /// Upgrades one TCP stream, checking the request path, and drives
    /// its session to completion.
    async fn accept_connection(
        self: Arc<Self>,
        stream: tokio::net::TcpStream,
        peer: String,
    ) -> Result<()> {
        let expected_path = self.config.path.clone();
        let check_path = move |request: &Request, response: Response| {
            if request.uri().path() == expected_path {
                Ok(response)
            } else {
                warn!("rejecting upgrade for path {}", request.uri().path());
                Err(ErrorResponse::new(Some("unknown path".to_string())))
            }
        };
        let socket = tokio_tungstenite::accept_hdr_async(stream, check_path).await?;

        let (endpoint, inbound) = Endpoint::spawn(
            socket,
            peer,
            Phase::HelloWait,
            self.config.send_queue_depth,
            self.config.drain_deadline,
        );
        endpoint.set_event_sink(self.events_tx.clone());
        self.run_session(endpoint, inbound).await;
        Ok(())
    }

    /// A reconnect driver for server-initiated connections to clients
    /// advertised over mDNS. Dialed peers still speak first, so dialed
    /// endpoints start in `HelloWait` and share this session loop.
    #[must_use]
    pub fn dialer(self: &Arc<Self>) -> Arc<ReconnectDriver> {
        let server = Arc::clone(self);
        let factory = move |endpoint: Arc<Endpoint>, inbound: mpsc::UnboundedReceiver<Inbound>| {
            let server = Arc::clone(&server);
            endpoint.set_event_sink(server.events_tx.clone());
            Box::pin(async move {
                server.run_session(endpoint, inbound).await;
            }) as BoxFuture<'static, ()>
        };
        ReconnectDriver::new(
            self.config.max_backoff,
            self.config.send_queue_depth,
            self.config.drain_deadline,
            Phase::HelloWait,
            Arc::new(factory),
        )
    }

    /// Drives one peer session from handshake to close.
    pub async fn run_session(
        self: &Arc<Self>,
        endpoint: Arc<Endpoint>,
        mut inbound: mpsc::UnboundedReceiver<Inbound>,
    ) {
        let mut codec_errors = 0u32;
        // Players are expected to open with client/state; tracked but
        // never enforced by dropping unrelated traffic.
        let mut awaiting_initial_state = false;

        while let Some(message) = inbound.recv().await {
            match message {
                Inbound::Text(text) => match endpoint.phase() {
                    Phase::HelloWait => match ClientMessage::from_json(&text) {
                        Ok(ClientMessage::Hello(hello)) => {
                            match self.handle_hello(&endpoint, hello) {
                                Ok(player) => awaiting_initial_state = player,
                                Err(e) => {
                                    warn!("[{}] handshake failed: {e}", endpoint.peer());
                                    endpoint.close(CloseReason::ProtocolError, false);
                                    return;
                                }
                            }
                        }
                        Ok(other) => {
                            warn!("[{}] {other} before client/hello", endpoint.peer());
                            endpoint.close(CloseReason::ProtocolError, false);
                            return;
                        }
                        Err(e) => {
                            warn!("[{}] garbage during handshake: {e}", endpoint.peer());
                            endpoint.close(CloseReason::ProtocolError, false);
                            return;
                        }
                    },
                    Phase::Established => match ClientMessage::from_json(&text) {
                        Ok(message) => {
                            if awaiting_initial_state {
                                if !matches!(message, ClientMessage::State(_)) {
                                    debug!(
                                        "[{}] first post-handshake message was {message}, \
                                         expected client/state",
                                        endpoint.peer()
                                    );
                                }
                                awaiting_initial_state = false;
                            }
                            self.dispatch(&endpoint, message);
                        }
                        Err(e) => {
                            codec_errors += 1;
                            warn!("[{}] dropped frame: {e}", endpoint.peer());
                            if codec_errors > CODEC_ERROR_LIMIT {
                                endpoint.close(CloseReason::ProtocolError, false);
                                return;
                            }
                        }
                    },
                    _ => {}
                },
                Inbound::Binary(_) => {
                    // No client-to-server binary messages exist in the
                    // catalogue.
                    codec_errors += 1;
                    debug!("[{}] unexpected binary frame", endpoint.peer());
                    if codec_errors > CODEC_ERROR_LIMIT {
                        endpoint.close(CloseReason::ProtocolError, false);
                        return;
                    }
                }
            }
        }
    }

    /// Completes the handshake: `server/hello` is enqueued before any
    /// side effect that could produce outbound traffic, so it is the
    /// first text frame the peer observes. Returns whether the peer
    /// reports player state.
    fn handle_hello(self: &Arc<Self>, endpoint: &Arc<Endpoint>, mut hello: ClientHello) -> Result<bool> {
        hello.validate()?;
        if hello.version < 1 {
            return Err(Error::invalid_argument(format!(
                "unsupported protocol version {}",
                hello.version
            )));
        }

        // Two live endpoints never share a client_id: the newer one
        // wins and the older is closed without retry.
        let previous = {
            let mut endpoints = self.endpoints.lock().expect("endpoint registry lock");
            endpoints.insert(hello.client_id.clone(), Arc::clone(endpoint))
        };
        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous, endpoint) {
                warn!(
                    "client id {} reconnected, closing previous endpoint",
                    hello.client_id
                );
                previous.close(CloseReason::DuplicateClientId, false);
            }
        }

        let reply = ServerMessage::Hello(ServerHello {
            server_id: self.config.id.clone(),
            name: self.config.name.clone(),
            version: crate::protocol::VERSION,
        });
        endpoint.send_text(reply.to_json()?)?;
        endpoint.establish(hello.client_id.clone(), hello.supported_roles.clone())?;
        info!(
            "[{}] {} connected with roles {:?}",
            endpoint.peer(),
            hello.client_id,
            hello.supported_roles
        );

        // Registry cleanup only removes our own registration; a newer
        // endpoint under the same id is left alone.
        {
            let server = Arc::clone(self);
            let client_id = hello.client_id.clone();
            let this = Arc::clone(endpoint);
            endpoint.add_cleanup(move || {
                let mut endpoints = server.endpoints.lock().expect("endpoint registry lock");
                if endpoints
                    .get(&client_id)
                    .is_some_and(|current| Arc::ptr_eq(current, &this))
                {
                    endpoints.remove(&client_id);
                }
            });
        }

        let _ = self.events_tx.send(Event::PeerConnected {
            client_id: hello.client_id.clone(),
        });
        let is_player = hello.supported_roles.contains(&Role::Player);
        self.engine.add_client(Arc::clone(endpoint), hello);
        Ok(is_player)
    }

    /// Routes an established-phase message.
    fn dispatch(self: &Arc<Self>, endpoint: &Arc<Endpoint>, message: ClientMessage) {
        match message {
            ClientMessage::Time(time) => {
                let received = self.clock.now_us();
                let reply = ServerMessage::Time(ServerTime {
                    client_transmitted: time.client_transmitted,
                    server_received: received,
                    server_transmitted: self.clock.now_us(),
                });
                if let Ok(json) = reply.to_json() {
                    let _ = endpoint.send_text(json);
                }
            }
            ClientMessage::State(state) => self.engine.handle_client_state(endpoint, state),
            ClientMessage::Command(command) => {
                if let Some(controller) = command.controller {
                    self.engine.handle_client_command(endpoint, controller);
                }
            }
            ClientMessage::RequestFormat(request) => {
                self.engine.handle_format_request(endpoint, request);
            }
            ClientMessage::Hello(_) => {
                // establish() already pinned identity; a second hello is
                // a protocol violation.
                warn!("[{}] repeated client/hello", endpoint.peer());
                endpoint.close(CloseReason::ProtocolError, false);
            }
        }
    }

    /// Number of registered (handshaken) endpoints.
    #[must_use]
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.lock().expect("endpoint registry lock").len()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        debug!("server {} shutting down", self.config.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::AppAdapter;
    use crate::protocol::messages::ClientState;
    use crate::protocol::types::MediaCommand;
    use crate::stream::{AudioSource, PcmEncoderFactory};

    struct NoApp;

    impl AppAdapter for NoApp {
        fn capabilities(&self) -> Vec<MediaCommand> {
            vec![MediaCommand::Play, MediaCommand::Stop]
        }
        fn open_source(&self, _group_id: &str) -> Option<Box<dyn AudioSource>> {
            None
        }
        fn media_command(&self, _group_id: &str, _command: MediaCommand) {}
    }

    fn server() -> Arc<Server> {
        let (server, _events) = Server::new(
            Config {
                id: "s1".to_string(),
                name: "Living Room Server".to_string(),
                ..Config::default()
            },
            Arc::new(NoApp),
            Arc::new(PcmEncoderFactory),
        );
        server
    }

    #[tokio::test]
    async fn duplicate_client_id_closes_the_older_endpoint() {
        use crate::protocol::player::{AudioFormat, PlayerSupport};
        use crate::protocol::types::{AudioCodec, PlayerCommand};
        use std::time::Duration;
        use tokio_tungstenite::tungstenite::protocol::Role as WsRole;
        use tokio_tungstenite::WebSocketStream;

        let server = server();
        let hello = ClientHello {
            client_id: "dup".to_string(),
            name: "Kitchen".to_string(),
            version: 1,
            supported_roles: vec![Role::Player],
            device_info: None,
            player_support: Some(PlayerSupport {
                support_formats: vec![AudioFormat {
                    codec: AudioCodec::Pcm,
                    channels: 2,
                    sample_rate: 48_000,
                    bit_depth: 16,
                }],
                buffer_capacity: 262_144,
                supported_commands: vec![PlayerCommand::Volume],
            }),
            artwork_support: None,
            visualizer_support: None,
        };

        let mut endpoints = Vec::new();
        for _ in 0..2 {
            let (near, far) = tokio::io::duplex(64 * 1024);
            let socket = WebSocketStream::from_raw_socket(near, WsRole::Server, None).await;
            let (endpoint, _inbound) = Endpoint::spawn(
                socket,
                "dup-test".to_string(),
                Phase::HelloWait,
                16,
                Duration::from_millis(100),
            );
            server.handle_hello(&endpoint, hello.clone()).unwrap();
            endpoints.push((endpoint, far));
        }

        let (older, _far_a) = &endpoints[0];
        assert_eq!(older.closed().await, CloseReason::DuplicateClientId);
        // The newer endpoint stays registered.
        assert_eq!(server.endpoint_count(), 1);

        let (newer, _far_b) = &endpoints[1];
        newer.close(CloseReason::Normal, false);
        newer.closed().await;
        assert_eq!(server.endpoint_count(), 0);
    }

    #[tokio::test]
    async fn time_requests_echo_and_stamp() {
        use crate::protocol::messages::ClientTime;
        use futures_util::StreamExt;
        use tokio_tungstenite::tungstenite::protocol::Role as WsRole;
        use tokio_tungstenite::tungstenite::Message as WsMessage;
        use tokio_tungstenite::WebSocketStream;

        let server = server();
        let (near, far) = tokio::io::duplex(64 * 1024);
        let socket = WebSocketStream::from_raw_socket(near, WsRole::Server, None).await;
        let mut client = WebSocketStream::from_raw_socket(far, WsRole::Client, None).await;
        let (endpoint, _inbound) = Endpoint::spawn(
            socket,
            "timer".to_string(),
            Phase::HelloWait,
            16,
            std::time::Duration::from_millis(100),
        );
        endpoint
            .establish("c-time".to_string(), vec![Role::Metadata])
            .unwrap();

        server.dispatch(
            &endpoint,
            ClientMessage::Time(ClientTime {
                client_transmitted: 42,
            }),
        );

        let Some(Ok(WsMessage::Text(text))) = client.next().await else {
            panic!("no server/time reply");
        };
        let ServerMessage::Time(time) = ServerMessage::from_json(&text).unwrap() else {
            panic!("expected server/time, got {text}");
        };
        assert_eq!(time.client_transmitted, 42);
        assert!(time.server_transmitted >= time.server_received);

        server
            .engine()
            .handle_client_state(&endpoint, ClientState::default());
    }
}
