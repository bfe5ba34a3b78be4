//! Per-client stream encoding and scheduling.
//!
//! A [`Stream`] is a time-bounded flow of binary frames for one group:
//! one shared presentation timeline, one [`StreamSession`] per member.
//! The scheduler pulls raw audio from an [`AudioSource`], encodes it per
//! session, stamps each frame with the server-clock microsecond at which
//! it must take effect, and releases frames to each member only when
//! they fall inside that member's lead window - derived from its
//! declared `buffer_capacity` - so the client's buffer never overflows.
//! Frames whose present time has already passed are dropped, not sent.
//!
//! Format changes are atomic with respect to frame output: the pending
//! format takes effect at a chunk boundary, a delta `stream/update`
//! precedes the first frame in the new format, and the presentation
//! cursor is carried across the switch so coverage has no gap and no
//! overlap.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::clock::MonotonicClock;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::protocol::artwork::{ArtworkFormatRequest, ChannelConfig, ChannelConfigUpdate};
use crate::protocol::binary::{Frame, FrameKind};
use crate::protocol::messages::{ClientHello, ServerMessage, StreamStart, StreamUpdate};
use crate::protocol::player::{AudioFormat, FormatRequest, StreamStartPlayer, StreamUpdatePlayer};
use crate::protocol::types::{ArtworkSource, AudioCodec, Role};
use crate::protocol::visualizer::StreamStartVisualizer;

/// Chunk cadence of the scheduler.
pub const CHUNK_MS: u32 = 20;

/// How far ahead of now the first frame of a stream is dated.
const STARTUP_LEAD_US: i64 = 500_000;

/// Frames closer to their present time than this are dropped as late.
const MIN_JITTER_US: i64 = 5_000;

/// Upper bound on any member's lead window.
const MAX_LEAD_US: i64 = 1_500_000;

/// Lead applied to artwork publishes.
const ART_LEAD_US: i64 = 50_000;

/// Raw audio pulled by the scheduler. Implemented by the application;
/// always interleaved PCM at [`AudioSource::format`].
pub trait AudioSource: Send + 'static {
    /// The fixed PCM format this source produces.
    fn format(&self) -> AudioFormat;

    /// Fills `buf` with interleaved PCM; returns the bytes written.
    /// Zero means the source is exhausted and the stream ends.
    fn read(&mut self, buf: &mut [u8]) -> usize;
}

/// One encoder instance bound to a session format.
///
/// Codec implementations are external; the crate ships only the PCM
/// pass-through. Encoders are fed source-format PCM chunks and own any
/// resampling their codec needs.
pub trait Encoder: Send {
    /// The codec this encoder produces.
    fn codec(&self) -> AudioCodec;

    /// Codec initialization header, for codecs that need one (FLAC).
    fn codec_header(&self) -> Option<Vec<u8>>;

    /// Encodes one PCM chunk into zero or one output frame.
    ///
    /// # Errors
    ///
    /// Returns `Encoder` errors, which end this session only.
    fn encode(&mut self, pcm: &[u8]) -> Result<Vec<u8>>;
}

/// Creates encoders for negotiated formats.
pub trait EncoderFactory: Send + Sync + 'static {
    /// Instantiates an encoder, or fails for unsupported formats.
    ///
    /// # Errors
    ///
    /// Returns `Encoder` when the format cannot be produced.
    fn create(&self, format: AudioFormat) -> Result<Box<dyn Encoder>>;
}

/// The in-tree pass-through encoder for PCM sessions.
pub struct PcmEncoder;

impl Encoder for PcmEncoder {
    fn codec(&self) -> AudioCodec {
        AudioCodec::Pcm
    }

    fn codec_header(&self) -> Option<Vec<u8>> {
        None
    }

    fn encode(&mut self, pcm: &[u8]) -> Result<Vec<u8>> {
        Ok(pcm.to_vec())
    }
}

/// Factory producing only [`PcmEncoder`]s.
pub struct PcmEncoderFactory;

impl EncoderFactory for PcmEncoderFactory {
    fn create(&self, format: AudioFormat) -> Result<Box<dyn Encoder>> {
        if format.codec != AudioCodec::Pcm {
            return Err(Error::encoder(format!(
                "no encoder available for {}",
                format.codec
            )));
        }
        Ok(Box::new(PcmEncoder))
    }
}

/// What the session produced for one chunk.
#[derive(Debug, Default)]
pub struct SessionOutput {
    /// Format delta to send before the next frame, if a switch happened.
    pub update: Option<StreamUpdate>,
    /// Frames now inside the member's lead window, in order.
    pub frames: Vec<Frame>,
    /// Frames dropped as late.
    pub dropped: usize,
}

/// Per-member encoder state and pacing cursor.
pub struct StreamSession {
    client_id: String,
    format: AudioFormat,
    pending: Option<AudioFormat>,
    encoder: Box<dyn Encoder>,
    /// Lead window in µs, derived from the member's buffer capacity.
    lead_us: i64,
    /// Encoded frames waiting for their lead window to open.
    backlog: VecDeque<Frame>,
}

impl StreamSession {
    fn new(
        client_id: String,
        format: AudioFormat,
        encoder: Box<dyn Encoder>,
        buffer_capacity: u64,
    ) -> Self {
        let lead_us = lead_window_us(buffer_capacity, &format);
        Self {
            client_id,
            format,
            pending: None,
            encoder,
            lead_us,
            backlog: VecDeque::new(),
        }
    }

    /// The format frames are currently encoded with.
    #[must_use]
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Records a requested format; applied at the next chunk boundary.
    /// A request that merges to the current format is suppressed.
    pub fn request_format(&mut self, request: &FormatRequest) {
        let target = request.merge_over(self.pending.unwrap_or(self.format));
        if target == self.format {
            self.pending = None;
        } else {
            self.pending = Some(target);
        }
    }

    /// Applies a pending switch, returning the delta update to emit.
    fn apply_pending(&mut self, factory: &dyn EncoderFactory) -> Option<StreamUpdate> {
        let target = self.pending.take()?;
        let encoder = match factory.create(target) {
            Ok(encoder) => encoder,
            Err(e) => {
                warn!("[{}] format switch to {target:?} failed: {e}", self.client_id);
                return None;
            }
        };
        let header = encoder
            .codec_header()
            .map(|h| base64::engine::general_purpose::STANDARD.encode(h));
        let delta = StreamUpdatePlayer::diff(self.format, target, header)?;
        self.encoder = encoder;
        self.format = target;
        Some(StreamUpdate {
            player: Some(delta),
            ..StreamUpdate::default()
        })
    }

    /// Encodes one chunk presented at `present_us` and flushes whatever
    /// is inside the lead window at `now_us`.
    fn process_chunk(
        &mut self,
        factory: &dyn EncoderFactory,
        pcm: &[u8],
        present_us: i64,
        now_us: i64,
    ) -> Result<SessionOutput> {
        let mut output = SessionOutput {
            update: self.apply_pending(factory),
            ..SessionOutput::default()
        };

        let payload = self.encoder.encode(pcm)?;
        if !payload.is_empty() {
            self.backlog
                .push_back(Frame::new(FrameKind::AudioChunk, present_us, payload)?);
        }

        while let Some(front) = self.backlog.front() {
            if front.present_time < now_us + MIN_JITTER_US {
                // Too late to be useful on the client.
                self.backlog.pop_front();
                output.dropped += 1;
                continue;
            }
            if front.present_time - now_us < self.lead_us {
                output.frames.push(self.backlog.pop_front().expect("front exists"));
                continue;
            }
            break;
        }
        Ok(output)
    }
}

/// Lead window: how far ahead of now a frame may be sent without
/// overflowing `buffer_capacity` bytes at the session's PCM byte rate.
#[expect(clippy::cast_possible_wrap)]
fn lead_window_us(buffer_capacity: u64, format: &AudioFormat) -> i64 {
    let byte_rate = format.byte_rate().max(1);
    let window = (buffer_capacity.saturating_mul(1_000_000) / byte_rate) as i64;
    window.min(MAX_LEAD_US)
}

/// Scheduler control states.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Control {
    Running,
    Paused,
    Ended,
}

/// A member wired into a stream.
#[derive(Clone)]
pub struct StreamMember {
    /// The member's endpoint.
    pub endpoint: Arc<Endpoint>,
    /// The member's hello, carrying its support blocks.
    pub hello: ClientHello,
}

struct MemberState {
    endpoint: Arc<Endpoint>,
    hello: ClientHello,
    session: Option<StreamSession>,
}

struct Shared {
    members: HashMap<String, MemberState>,
}

/// One active stream for one group.
pub struct Stream {
    id: String,
    group_id: String,
    clock: MonotonicClock,
    factory: Arc<dyn EncoderFactory>,
    shared: Arc<Mutex<Shared>>,
    control: watch::Sender<Control>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Stream {
    /// Starts a stream over `members`, sending each its `stream/start`.
    ///
    /// Members without a streaming role are skipped; the caller filters
    /// `metadata`/`controller`-only endpoints out before this point.
    pub fn start(
        group_id: String,
        members: Vec<StreamMember>,
        mut source: Box<dyn AudioSource>,
        factory: Arc<dyn EncoderFactory>,
        clock: MonotonicClock,
    ) -> Arc<Self> {
        let shared = Arc::new(Mutex::new(Shared {
            members: HashMap::new(),
        }));
        let (control, control_rx) = watch::channel(Control::Running);

        let stream = Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            group_id,
            clock,
            factory,
            shared,
            control,
            task: Mutex::new(None),
        });

        for member in members {
            stream.add_member(&member);
        }

        let task = tokio::spawn({
            let stream = Arc::clone(&stream);
            let source_format = source.format();
            let mut control_rx = control_rx;
            async move {
                stream.run(&mut *source, source_format, &mut control_rx).await;
            }
        });
        *stream.task.lock().expect("stream task lock") = Some(task);
        stream
    }

    /// Stream identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wires a member in mid-stream. The member receives `stream/start`
    /// and future-dated frames only - no catch-up of past audio.
    pub fn add_member(&self, member: &StreamMember) {
        if !member.hello.supported_roles.iter().any(|r| r.is_streaming()) {
            return;
        }
        let client_id = member.hello.client_id.clone();
        let session = self.player_session(&member.hello);
        let start = self.stream_start_message(&member.hello, session.as_ref());

        member.endpoint.set_stream_active(true);
        if let Ok(json) = ServerMessage::StreamStart(start).to_json() {
            if let Err(e) = member.endpoint.send_text(json) {
                warn!("[{}] stream/start failed: {e}", member.endpoint.peer());
            }
        }

        let mut shared = self.shared.lock().expect("stream shared lock");
        shared.members.insert(
            client_id,
            MemberState {
                endpoint: Arc::clone(&member.endpoint),
                hello: member.hello.clone(),
                session,
            },
        );
    }

    /// Detaches a member, releasing its encoder state. The endpoint is
    /// left open; only its stream participation ends.
    pub fn remove_member(&self, client_id: &str) {
        let removed = {
            let mut shared = self.shared.lock().expect("stream shared lock");
            shared.members.remove(client_id)
        };
        if let Some(member) = removed {
            member.endpoint.set_stream_active(false);
        }
    }

    /// Suspends frame production.
    pub fn pause(&self) {
        self.control.send_replace(Control::Paused);
    }

    /// Resumes frame production with a fresh wall-clock anchor.
    pub fn resume(&self) {
        self.control.send_replace(Control::Running);
    }

    /// Ends the stream: `stream/end` to every member, encoder state
    /// released. Frames already queued on endpoint writers still drain.
    pub fn stop(&self) {
        self.control.send_replace(Control::Ended);
    }

    /// Records a member's player format request; the switch happens at
    /// the next chunk boundary.
    pub fn request_format(&self, client_id: &str, request: &FormatRequest) {
        let mut shared = self.shared.lock().expect("stream shared lock");
        if let Some(member) = shared.members.get_mut(client_id) {
            if let Some(session) = member.session.as_mut() {
                session.request_format(request);
            }
        }
    }

    /// Reconfigures one artwork channel at a member's request and
    /// acknowledges with a `stream/update` carrying the channel delta.
    pub fn request_artwork_format(&self, client_id: &str, request: &ArtworkFormatRequest) {
        let shared = self.shared.lock().expect("stream shared lock");
        let Some(member) = shared.members.get(client_id) else {
            return;
        };
        let delta = ChannelConfigUpdate {
            source: request.source,
            format: request.format,
            width: request.media_width,
            height: request.media_height,
        };
        if delta.is_empty() {
            return;
        }
        // Index-aligned channel list: untouched channels are empty deltas.
        let mut channels = vec![ChannelConfigUpdate::default(); usize::from(request.channel)];
        channels.push(delta);
        let update = StreamUpdate {
            artwork: Some(crate::protocol::artwork::StreamUpdateArtwork {
                channels: Some(channels),
            }),
            ..StreamUpdate::default()
        };
        if let Ok(json) = ServerMessage::StreamUpdate(update).to_json() {
            let _ = member.endpoint.send_text(json);
        }
    }

    /// Publishes an image on an artwork channel, timestamped just ahead
    /// of now. An inert (`source: none`) member channel receives nothing.
    pub fn set_artwork(&self, channel: u8, image: Vec<u8>) {
        self.publish_artwork(channel, image);
    }

    /// Clears an artwork channel with an empty-payload frame.
    pub fn clear_artwork(&self, channel: u8) {
        self.publish_artwork(channel, Vec::new());
    }

    fn publish_artwork(&self, channel: u8, payload: Vec<u8>) {
        let present = self.clock.now_us() + ART_LEAD_US;
        let Ok(frame) = Frame::new(FrameKind::ArtworkChannel(channel), present, payload) else {
            return;
        };
        let bytes = frame.encode();
        let shared = self.shared.lock().expect("stream shared lock");
        for member in shared.members.values() {
            if !member.endpoint.has_role(Role::Artwork) {
                continue;
            }
            let inert = member
                .hello
                .artwork_support
                .as_ref()
                .and_then(|support| support.channels.get(usize::from(channel)))
                .is_none_or(|config| config.source == ArtworkSource::None);
            if inert {
                continue;
            }
            if let Err(e) = member.endpoint.send_binary(bytes.clone()) {
                debug!("[{}] artwork send failed: {e}", member.endpoint.peer());
            }
        }
    }

    /// Publishes one visualizer feature frame, produced externally.
    pub fn publish_visualizer(&self, present_us: i64, features: Vec<u8>) {
        let Ok(frame) = Frame::new(FrameKind::VisualizerData, present_us, features) else {
            return;
        };
        let bytes = frame.encode();
        let shared = self.shared.lock().expect("stream shared lock");
        for member in shared.members.values() {
            if member.endpoint.has_role(Role::Visualizer) {
                let _ = member.endpoint.send_binary(bytes.clone());
            }
        }
    }

    /// Picks the member's stream format: the first declared format the
    /// encoder factory can produce.
    fn pick_format(&self, hello: &ClientHello) -> Option<AudioFormat> {
        let support = hello.player_support.as_ref()?;
        support
            .support_formats
            .iter()
            .find(|format| self.factory.create(**format).is_ok())
            .copied()
    }

    fn player_session(&self, hello: &ClientHello) -> Option<StreamSession> {
        if !hello.supported_roles.contains(&Role::Player) {
            return None;
        }
        let support = hello.player_support.as_ref()?;
        let format = self.pick_format(hello)?;
        let encoder = self.factory.create(format).ok()?;
        Some(StreamSession::new(
            hello.client_id.clone(),
            format,
            encoder,
            support.buffer_capacity,
        ))
    }

    fn stream_start_message(
        &self,
        hello: &ClientHello,
        session: Option<&StreamSession>,
    ) -> StreamStart {
        let player = session.map(|session| {
            let format = session.format();
            StreamStartPlayer {
                codec: format.codec,
                sample_rate: format.sample_rate,
                channels: format.channels,
                bit_depth: format.bit_depth,
                codec_header: session
                    .encoder
                    .codec_header()
                    .map(|h| base64::engine::general_purpose::STANDARD.encode(h)),
            }
        });
        let artwork = hello.artwork_support.as_ref().map(|support| {
            crate::protocol::artwork::StreamStartArtwork {
                channels: support
                    .channels
                    .iter()
                    .map(|channel| ChannelConfig {
                        source: channel.source,
                        format: channel.format,
                        width: channel.media_width,
                        height: channel.media_height,
                    })
                    .collect(),
            }
        });
        let visualizer = hello
            .visualizer_support
            .map(|support| StreamStartVisualizer {
                buffer_capacity: support.buffer_capacity,
            });
        StreamStart {
            player,
            artwork,
            visualizer,
        }
    }

    async fn run(
        &self,
        source: &mut dyn AudioSource,
        source_format: AudioFormat,
        control: &mut watch::Receiver<Control>,
    ) {
        let chunk_samples = source_format.sample_rate * CHUNK_MS / 1000;
        let chunk_bytes = chunk_samples
            * u32::from(source_format.channels)
            * (u32::from(source_format.bit_depth) / 8);
        let chunk_duration_us = i64::from(CHUNK_MS) * 1000;
        let mut buf = vec![0u8; chunk_bytes as usize];
        let mut next_present = self.clock.now_us() + STARTUP_LEAD_US;

        loop {
            let current = *control.borrow_and_update();
            match current {
                Control::Ended => break,
                Control::Paused => {
                    if control.changed().await.is_err() {
                        break;
                    }
                    // Fresh anchor; the sample position continues, the
                    // wall position does not catch up.
                    next_present = self.clock.now_us() + STARTUP_LEAD_US;
                    continue;
                }
                Control::Running => {}
            }

            let n = source.read(&mut buf);
            if n == 0 {
                debug!("[{}] source exhausted", self.group_id);
                break;
            }

            let now = self.clock.now_us();
            self.pump_sessions(&buf[..n], next_present, now);
            next_present += chunk_duration_us;

            // Produce the next chunk when the furthest lead window opens.
            let wake_in = next_present - MAX_LEAD_US - now;
            if wake_in > 0 {
                #[expect(clippy::cast_sign_loss)]
                let wait = std::time::Duration::from_micros(wake_in as u64);
                tokio::select! {
                    () = tokio::time::sleep(wait) => {}
                    _ = control.changed() => {}
                }
            }
        }

        self.finish();
    }

    /// Encodes and flushes one chunk across all sessions. Holds the
    /// member lock without awaiting.
    fn pump_sessions(&self, pcm: &[u8], present_us: i64, now_us: i64) {
        let mut shared = self.shared.lock().expect("stream shared lock");
        let mut failed: Vec<String> = Vec::new();
        for (client_id, member) in &mut shared.members {
            let Some(session) = member.session.as_mut() else {
                continue;
            };
            match session.process_chunk(&*self.factory, pcm, present_us, now_us) {
                Ok(output) => {
                    if output.dropped > 0 {
                        debug!("[{client_id}] dropped {} late frames", output.dropped);
                    }
                    if let Some(update) = output.update {
                        if let Ok(json) = ServerMessage::StreamUpdate(update).to_json() {
                            let _ = member.endpoint.send_text(json);
                        }
                    }
                    for frame in output.frames {
                        if let Err(e) = member.endpoint.send_binary(frame.encode()) {
                            debug!("[{client_id}] frame send failed: {e}");
                            break;
                        }
                    }
                }
                Err(e) => {
                    // Encoder failure ends this session, not the group.
                    warn!("[{client_id}] encoder error: {e}");
                    failed.push(client_id.clone());
                }
            }
        }
        for client_id in failed {
            if let Some(member) = shared.members.get_mut(&client_id) {
                member.session = None;
                member.endpoint.set_stream_active(false);
                if let Ok(json) = ServerMessage::StreamEnd.to_json() {
                    let _ = member.endpoint.send_text(json);
                }
            }
        }
    }

    /// Fans out `stream/end` and releases all encoder state.
    fn finish(&self) {
        let mut shared = self.shared.lock().expect("stream shared lock");
        let end = ServerMessage::StreamEnd.to_json().ok();
        for member in shared.members.values_mut() {
            member.session = None;
            if let Some(json) = &end {
                let _ = member.endpoint.send_text(json.clone());
            }
            member.endpoint.set_stream_active(false);
        }
        shared.members.clear();
        info!("[{}] stream {} ended", self.group_id, self.id);
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.control.send_replace(Control::Ended);
        if let Some(task) = self.task.lock().expect("stream task lock").take() {
            task.abort();
        }
    }
}
