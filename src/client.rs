//! Client endpoint driver.
//!
//! Drives one Resonate client connection: sends `client/hello`, awaits
//! `server/hello`, then runs clock synchronization at the filter's
//! adaptive cadence while translating server traffic into calls on a
//! [`ClientHandler`]. Audio playback, artwork display and visualization
//! live behind that handler; this driver owns the protocol obligations -
//! the initial `client/state` for players, command echoes, delta merges
//! and wire-to-local timestamp conversion.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use crate::clock::{ClockSample, MonotonicClock, SharedClock};
use crate::config::Config;
use crate::endpoint::{CloseReason, Endpoint, Inbound, Phase};
use crate::error::Result;
use crate::protocol::binary::{Frame, FrameKind};
use crate::protocol::controller::{ControllerCommand, ControllerState, GroupUpdate};
use crate::protocol::messages::{
    ClientHello, ClientMessage, ClientState, ClientTime, ServerMessage, StreamRequestFormat,
    StreamStart, StreamUpdate,
};
use crate::protocol::metadata::Metadata;
use crate::protocol::player::PlayerStatus;
use crate::protocol::types::{PlayerCommand, PlayerState, Role};
use crate::reconnect::ReconnectDriver;

/// Application-side sink for everything a client receives.
///
/// All methods default to no-ops so a controller-only client implements
/// nothing.
pub trait ClientHandler: Send + Sync + 'static {
    /// Group context changed.
    fn on_group_update(&self, _update: &GroupUpdate) {}

    /// Accumulated metadata after a delta merge.
    fn on_metadata(&self, _metadata: &Metadata) {}

    /// Controller state (supported commands, group volume).
    fn on_controller_state(&self, _state: &ControllerState) {}

    /// A stream began for this client.
    fn on_stream_start(&self, _start: &StreamStart) {}

    /// A mid-stream delta: format change or artwork channel update.
    /// Takes effect with the next binary frame.
    fn on_stream_update(&self, _update: &StreamUpdate) {}

    /// The stream ended.
    fn on_stream_end(&self) {}

    /// An audio chunk to play at `present_local_us` on the local clock.
    fn on_audio_chunk(&self, _present_local_us: i64, _payload: &[u8]) {}

    /// An artwork image (empty payload clears the channel).
    fn on_artwork(&self, _channel: u8, _present_local_us: i64, _payload: &[u8]) {}

    /// A visualizer feature frame.
    fn on_visualizer(&self, _present_local_us: i64, _payload: &[u8]) {}
}

/// A no-op handler for controller-only clients.
pub struct NullHandler;

impl ClientHandler for NullHandler {}

/// One Resonate client identity, reusable across reconnects.
pub struct Client {
    hello: ClientHello,
    handler: Arc<dyn ClientHandler>,
    local: MonotonicClock,
    volume: AtomicU8,
    muted: AtomicBool,
    metadata: Mutex<Metadata>,
    endpoint: Mutex<Option<Arc<Endpoint>>>,
}

impl Client {
    /// Creates a client that will introduce itself with `hello`.
    pub fn new(hello: ClientHello, handler: Arc<dyn ClientHandler>) -> Arc<Self> {
        Arc::new(Self {
            hello,
            handler,
            local: MonotonicClock::new(),
            volume: AtomicU8::new(100),
            muted: AtomicBool::new(false),
            metadata: Mutex::new(Metadata::default()),
            endpoint: Mutex::new(None),
        })
    }

    /// A reconnect driver whose sessions run this client.
    pub fn driver(self: &Arc<Self>, config: &Config) -> Arc<ReconnectDriver> {
        let client = Arc::clone(self);
        let factory = move |endpoint: Arc<Endpoint>, inbound: mpsc::UnboundedReceiver<Inbound>| {
            let client = Arc::clone(&client);
            Box::pin(async move {
                client.run(endpoint, inbound).await;
            }) as BoxFuture<'static, ()>
        };
        ReconnectDriver::new(
            config.max_backoff,
            config.send_queue_depth,
            config.drain_deadline,
            Phase::Init,
            Arc::new(factory),
        )
    }

    /// `true` while a connection is established.
    #[must_use]
    pub fn connected(&self) -> bool {
        self.endpoint
            .lock()
            .expect("client endpoint lock")
            .as_ref()
            .is_some_and(|endpoint| endpoint.phase() == Phase::Established)
    }

    /// Local player volume.
    #[must_use]
    pub fn volume(&self) -> u8 {
        self.volume.load(Ordering::Acquire)
    }

    /// Local mute state.
    #[must_use]
    pub fn muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    /// Sends a controller command on the live connection.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` when not connected, or the send error.
    pub fn send_command(&self, command: ControllerCommand) -> Result<()> {
        command.validate()?;
        let message = ClientMessage::Command(crate::protocol::messages::ClientCommand {
            controller: Some(command),
        });
        self.send(&message)
    }

    /// Requests a different stream format.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` when not connected, or the send error.
    pub fn request_format(&self, request: StreamRequestFormat) -> Result<()> {
        self.send(&ClientMessage::RequestFormat(request))
    }

    fn send(&self, message: &ClientMessage) -> Result<()> {
        let endpoint = self
            .endpoint
            .lock()
            .expect("client endpoint lock")
            .clone()
            .ok_or_else(|| crate::error::Error::cancelled("not connected"))?;
        endpoint.send_text(message.to_json()?)
    }

    fn player_state(&self, state: PlayerState) -> ClientMessage {
        ClientMessage::State(ClientState {
            player: Some(PlayerStatus {
                state,
                volume: self.volume(),
                muted: self.muted(),
            }),
        })
    }

    /// Drives one connection to completion. Used as the reconnect
    /// driver's session body.
    pub async fn run(
        self: Arc<Self>,
        endpoint: Arc<Endpoint>,
        mut inbound: mpsc::UnboundedReceiver<Inbound>,
    ) {
        // Handshake: client/hello is the first and only pre-established
        // text frame we produce.
        let hello = ClientMessage::Hello(self.hello.clone());
        let Ok(json) = hello.to_json() else { return };
        if endpoint.send_text(json).is_err() {
            return;
        }
        if endpoint.advance(Phase::Init, Phase::HelloSent).is_err() {
            endpoint.close(CloseReason::ProtocolError, false);
            return;
        }
        *self.endpoint.lock().expect("client endpoint lock") = Some(Arc::clone(&endpoint));

        // Fresh filter per connection; estimates never survive a
        // reconnect.
        let mut clock = SharedClock::new();
        let mut synchronized = true;
        let sync_timer = tokio::time::sleep(std::time::Duration::from_secs(0));
        tokio::pin!(sync_timer);

        loop {
            tokio::select! {
                () = &mut sync_timer, if endpoint.phase() == Phase::Established => {
                    let probe = ClientMessage::Time(ClientTime {
                        client_transmitted: self.local.now_us(),
                    });
                    if let Ok(json) = probe.to_json() {
                        let _ = endpoint.send_text(json);
                    }
                    sync_timer.as_mut().reset(tokio::time::Instant::now() + clock.poll_interval());
                }
                message = inbound.recv() => {
                    let Some(message) = message else { break };
                    match message {
                        Inbound::Text(text) => {
                            if !self.handle_text(&endpoint, &text, &mut clock, &mut synchronized) {
                                break;
                            }
                        }
                        Inbound::Binary(bytes) => self.handle_binary(&bytes, &clock),
                    }
                }
            }
        }

        self.endpoint.lock().expect("client endpoint lock").take();
    }

    /// Handles one text frame; `false` ends the session loop.
    fn handle_text(
        self: &Arc<Self>,
        endpoint: &Arc<Endpoint>,
        text: &str,
        clock: &mut SharedClock,
        synchronized: &mut bool,
    ) -> bool {
        let message = match ServerMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("[{}] dropped frame: {e}", endpoint.peer());
                return true;
            }
        };

        if endpoint.phase() == Phase::HelloSent {
            return match message {
                ServerMessage::Hello(server) => {
                    info!(
                        "[{}] connected to {} ({})",
                        endpoint.peer(),
                        server.name,
                        server.server_id
                    );
                    if endpoint
                        .establish(self.hello.client_id.clone(), self.hello.supported_roles.clone())
                        .is_err()
                    {
                        endpoint.close(CloseReason::ProtocolError, false);
                        return false;
                    }
                    // Players open with their state; this is the first
                    // post-handshake message on the wire.
                    if self.hello.supported_roles.contains(&Role::Player) {
                        if let Ok(json) = self.player_state(PlayerState::Synchronized).to_json() {
                            let _ = endpoint.send_text(json);
                        }
                    }
                    true
                }
                other => {
                    warn!("[{}] {other} before server/hello", endpoint.peer());
                    endpoint.close(CloseReason::ProtocolError, false);
                    false
                }
            };
        }

        match message {
            ServerMessage::Hello(_) => {
                warn!("[{}] repeated server/hello", endpoint.peer());
            }
            ServerMessage::Time(time) => {
                let sample = ClockSample {
                    t0: time.client_transmitted,
                    t1: time.server_received,
                    t2: time.server_transmitted,
                    t3: self.local.now_us(),
                };
                clock.update(&sample);
                let snapshot = *clock.subscribe().borrow();
                if snapshot.samples == 0 {
                    return true;
                }
                let healthy = snapshot.healthy;
                if *synchronized != healthy && self.hello.supported_roles.contains(&Role::Player) {
                    *synchronized = healthy;
                    let state = if healthy {
                        PlayerState::Synchronized
                    } else {
                        PlayerState::Error
                    };
                    if let Ok(json) = self.player_state(state).to_json() {
                        let _ = endpoint.send_text(json);
                    }
                }
            }
            ServerMessage::State(state) => {
                if let Some(update) = state.metadata {
                    let mut metadata = self.metadata.lock().expect("client metadata lock");
                    metadata.apply(update);
                    self.handler.on_metadata(&metadata);
                }
                if let Some(controller) = state.controller {
                    self.handler.on_controller_state(&controller);
                }
            }
            ServerMessage::Command(command) => {
                if let Some(player) = command.player {
                    self.apply_player_command(endpoint, player);
                }
            }
            ServerMessage::GroupUpdate(update) => {
                self.handler.on_group_update(&update);
            }
            ServerMessage::StreamStart(start) => {
                endpoint.set_stream_active(true);
                self.handler.on_stream_start(&start);
            }
            ServerMessage::StreamUpdate(update) => {
                self.handler.on_stream_update(&update);
            }
            ServerMessage::StreamEnd => {
                endpoint.set_stream_active(false);
                self.handler.on_stream_end();
            }
        }
        true
    }

    /// Applies a `server/command` and echoes the resulting state.
    fn apply_player_command(
        &self,
        endpoint: &Arc<Endpoint>,
        command: crate::protocol::player::PlayerCommandPayload,
    ) {
        if command.validate().is_err() {
            warn!("[{}] malformed server/command", endpoint.peer());
            return;
        }
        match command.command {
            PlayerCommand::Volume => {
                if let Some(volume) = command.volume {
                    self.volume.store(volume, Ordering::Release);
                }
            }
            PlayerCommand::Mute => {
                if let Some(mute) = command.mute {
                    self.muted.store(mute, Ordering::Release);
                }
            }
        }
        if let Ok(json) = self.player_state(PlayerState::Synchronized).to_json() {
            let _ = endpoint.send_text(json);
        }
    }

    /// Decodes a binary frame and hands it over with its local-clock
    /// deadline.
    fn handle_binary(&self, bytes: &[u8], clock: &SharedClock) {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("dropped binary frame: {e}");
                return;
            }
        };
        let snapshot = *clock.subscribe().borrow();
        let local_deadline = snapshot.to_local(frame.present_time);
        match frame.kind {
            FrameKind::AudioChunk => self.handler.on_audio_chunk(local_deadline, &frame.payload),
            FrameKind::ArtworkChannel(channel) => {
                self.handler.on_artwork(channel, local_deadline, &frame.payload);
            }
            FrameKind::VisualizerData => {
                self.handler.on_visualizer(local_deadline, &frame.payload);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{ServerHello, ServerTime};
    use crate::protocol::player::{AudioFormat, PlayerCommandPayload, PlayerSupport};
    use crate::protocol::types::AudioCodec;
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role as WsRole;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::WebSocketStream;

    fn player_hello() -> ClientHello {
        ClientHello {
            client_id: "c1".to_string(),
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
                supported_commands: vec![PlayerCommand::Volume, PlayerCommand::Mute],
            }),
            artwork_support: None,
            visualizer_support: None,
        }
    }

    async fn client_session() -> (Arc<Client>, WebSocketStream<DuplexStream>) {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let socket = WebSocketStream::from_raw_socket(near, WsRole::Client, None).await;
        let server_side = WebSocketStream::from_raw_socket(far, WsRole::Server, None).await;
        let (endpoint, inbound) = Endpoint::spawn(
            socket,
            "test-server".to_string(),
            Phase::Init,
            16,
            Duration::from_millis(100),
        );
        let client = Client::new(player_hello(), Arc::new(NullHandler));
        tokio::spawn({
            let client = Arc::clone(&client);
            async move {
                client.run(endpoint, inbound).await;
            }
        });
        (client, server_side)
    }

    async fn next_client_message(socket: &mut WebSocketStream<DuplexStream>) -> ClientMessage {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), socket.next())
                .await
                .expect("timed out")
                .expect("socket closed")
                .expect("socket error")
            {
                WsMessage::Text(text) => return ClientMessage::from_json(&text).unwrap(),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn hello_is_first_then_state_after_server_hello() {
        let (_client, mut server) = client_session().await;

        // First client-origin text frame is client/hello.
        let first = next_client_message(&mut server).await;
        assert!(matches!(first, ClientMessage::Hello(_)));

        let reply = ServerMessage::Hello(ServerHello {
            server_id: "s1".to_string(),
            name: "Living Room Server".to_string(),
            version: 1,
        });
        server
            .send(WsMessage::text(reply.to_json().unwrap()))
            .await
            .unwrap();

        // The first post-handshake message is the initial client/state.
        let second = next_client_message(&mut server).await;
        let ClientMessage::State(state) = second else {
            panic!("expected client/state, got {second}");
        };
        let player = state.player.unwrap();
        assert_eq!(player.state, PlayerState::Synchronized);
        assert!(player.volume <= 100);
    }

    #[tokio::test]
    async fn server_commands_are_applied_and_echoed() {
        let (client, mut server) = client_session().await;
        let _hello = next_client_message(&mut server).await;
        let reply = ServerMessage::Hello(ServerHello {
            server_id: "s1".to_string(),
            name: "S".to_string(),
            version: 1,
        });
        server
            .send(WsMessage::text(reply.to_json().unwrap()))
            .await
            .unwrap();
        let _initial_state = next_client_message(&mut server).await;

        let command = ServerMessage::Command(crate::protocol::messages::ServerCommand {
            player: Some(PlayerCommandPayload::volume(40)),
        });
        server
            .send(WsMessage::text(command.to_json().unwrap()))
            .await
            .unwrap();

        // The echoed state carries the applied volume.
        loop {
            let message = next_client_message(&mut server).await;
            if let ClientMessage::State(state) = message {
                assert_eq!(state.player.unwrap().volume, 40);
                break;
            }
        }
        assert_eq!(client.volume(), 40);
    }

    #[tokio::test]
    async fn time_replies_feed_the_filter() {
        let (_client, mut server) = client_session().await;
        let _hello = next_client_message(&mut server).await;
        server
            .send(WsMessage::text(
                ServerMessage::Hello(ServerHello {
                    server_id: "s1".to_string(),
                    name: "S".to_string(),
                    version: 1,
                })
                .to_json()
                .unwrap(),
            ))
            .await
            .unwrap();
        let _initial_state = next_client_message(&mut server).await;

        // The sync timer fires immediately after establish.
        loop {
            let message = next_client_message(&mut server).await;
            if let ClientMessage::Time(time) = message {
                let reply = ServerMessage::Time(ServerTime {
                    client_transmitted: time.client_transmitted,
                    server_received: time.client_transmitted + 500_000,
                    server_transmitted: time.client_transmitted + 500_100,
                });
                server
                    .send(WsMessage::text(reply.to_json().unwrap()))
                    .await
                    .unwrap();
                break;
            }
        }
        // No crash and no protocol error: the reply was absorbed. The
        // filter itself is covered by the clock tests.
    }
}
