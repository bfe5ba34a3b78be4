//! Group membership, playback state and role-gated fan-out.
//!
//! Every endpoint with a reporting role belongs to exactly one
//! [`Group`]; a group is created when its first member joins and is
//! destroyed when its last member leaves. Groups own the active
//! [`Stream`] and drive its lifecycle from controller commands; state
//! updates fan out role-gated, so `metadata`-only members never see
//! `stream/*` traffic.
//!
//! Each group's state sits behind one group-scoped lock; command
//! handling and fan-out are serialized per group. Cross-group reads
//! (the `switch` cycle) go through lock-free playback and member-count
//! mirrors, so no path ever nests two group locks.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::clock::MonotonicClock;
use crate::endpoint::Endpoint;
use crate::events::Event;
use crate::protocol::controller::{ControllerCommand, ControllerState, GroupUpdate};
use crate::protocol::messages::{
    ClientHello, ClientState, ServerCommand, ServerMessage, ServerState, StreamRequestFormat,
};
use crate::protocol::metadata::Metadata;
use crate::protocol::player::{PlayerCommandPayload, PlayerStatus};
use crate::protocol::types::{MediaCommand, PlaybackState, PlayerCommand, Role};
use crate::stream::{AudioSource, EncoderFactory, Stream, StreamMember};

/// Application seam for the group engine.
///
/// Capabilities bound `supported_commands`; media-level commands the
/// engine cannot service itself (track skipping, repeat, shuffle) are
/// forwarded here, and playback start asks here for the audio source.
pub trait AppAdapter: Send + Sync + 'static {
    /// Commands the application can service.
    fn capabilities(&self) -> Vec<MediaCommand>;

    /// Opens the audio source for a group whose playback starts.
    fn open_source(&self, group_id: &str) -> Option<Box<dyn AudioSource>>;

    /// Notifies the application of a serviced media command.
    fn media_command(&self, group_id: &str, command: MediaCommand);
}

/// One member of a group.
struct Member {
    endpoint: Arc<Endpoint>,
    hello: ClientHello,
    /// Last player state the member reported.
    player: Option<PlayerStatus>,
    /// Last metadata snapshot sent to this member.
    last_metadata: Option<Metadata>,
}

impl Member {
    fn has_role(&self, role: Role) -> bool {
        self.hello.supported_roles.contains(&role)
    }

    fn supports_player_command(&self, command: PlayerCommand) -> bool {
        self.hello
            .player_support
            .as_ref()
            .is_some_and(|support| support.supported_commands.contains(&command))
    }
}

struct GroupState {
    name: String,
    playback: PlaybackState,
    muted: bool,
    members: Vec<Member>,
    metadata: Metadata,
    stream: Option<Arc<Stream>>,
}

/// A set of endpoints receiving the same logical playback.
pub struct Group {
    id: String,
    state: Mutex<GroupState>,
    /// Lock-free mirror of the playback state for cross-group reads.
    playback_cell: AtomicU8,
    /// Lock-free mirror of the member count for cross-group reads.
    members_cell: AtomicUsize,
}

impl Group {
    fn new(id: String, name: String) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(GroupState {
                name,
                playback: PlaybackState::Stopped,
                muted: false,
                members: Vec::new(),
                metadata: Metadata::default(),
                stream: None,
            }),
            playback_cell: AtomicU8::new(playback_to_u8(PlaybackState::Stopped)),
            members_cell: AtomicUsize::new(0),
        })
    }

    /// Group identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current playback state.
    #[must_use]
    pub fn playback(&self) -> PlaybackState {
        playback_from_u8(self.playback_cell.load(Ordering::Acquire))
    }

    /// Member count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members_cell.load(Ordering::Acquire)
    }

    /// `true` when no member remains (only momentarily true while the
    /// group is being destroyed; a live group is never empty).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Updates `playback` and its lock-free mirror together.
    fn set_playback(&self, state: &mut GroupState, playback: PlaybackState) {
        state.playback = playback;
        self.playback_cell
            .store(playback_to_u8(playback), Ordering::Release);
    }

    fn sync_member_count(&self, state: &GroupState) {
        self.members_cell.store(state.members.len(), Ordering::Release);
    }

    /// Mean of member player volumes, rounded half-up. Members that
    /// have not reported yet count at their default (100).
    fn group_volume(state: &GroupState) -> u8 {
        let volumes: Vec<u64> = state
            .members
            .iter()
            .filter(|member| member.has_role(Role::Player))
            .map(|member| u64::from(member.player.map_or(100, |p| p.volume)))
            .collect();
        if volumes.is_empty() {
            return 0;
        }
        let count = volumes.len() as u64;
        let sum: u64 = volumes.iter().sum();
        u8::try_from((sum + count / 2) / count).unwrap_or(100)
    }

    /// Sends `message` to every member matching `predicate`.
    fn fan_out(state: &GroupState, message: &ServerMessage, predicate: impl Fn(&Member) -> bool) {
        let Ok(json) = message.to_json() else {
            return;
        };
        for member in state.members.iter().filter(|m| predicate(m)) {
            if let Err(e) = member.endpoint.send_text(json.clone()) {
                debug!("[{}] fan-out of {message} failed: {e}", member.endpoint.peer());
            }
        }
    }

    fn fan_out_group_update(state: &GroupState) {
        let update = ServerMessage::GroupUpdate(GroupUpdate {
            playback_state: Some(state.playback),
            group_id: None,
            group_name: None,
        });
        Group::fan_out(state, &update, |_| true);
    }

    /// The full-context `group/update` a member receives when joining.
    fn initial_update(&self, state: &GroupState) -> GroupUpdate {
        GroupUpdate {
            playback_state: Some(state.playback),
            group_id: Some(self.id.clone()),
            group_name: Some(state.name.clone()),
        }
    }
}

fn playback_to_u8(state: PlaybackState) -> u8 {
    match state {
        PlaybackState::Playing => 0,
        PlaybackState::Paused => 1,
        PlaybackState::Stopped => 2,
    }
}

fn playback_from_u8(value: u8) -> PlaybackState {
    match value {
        0 => PlaybackState::Playing,
        1 => PlaybackState::Paused,
        _ => PlaybackState::Stopped,
    }
}

/// Scales member volumes so their mean becomes `target`, preserving
/// ratios. Volumes clamp to 0..=100; when raising, members at 0 are
/// lifted to the delta so they are not left behind by a zero ratio.
fn scale_volumes(volumes: &[u8], target: u8) -> Vec<u8> {
    if volumes.is_empty() {
        return Vec::new();
    }
    let count = volumes.len() as u64;
    let sum: u64 = volumes.iter().map(|&v| u64::from(v)).sum();
    let mean = (sum + count / 2) / count;
    if mean == 0 {
        return vec![target; volumes.len()];
    }
    let delta = i64::from(target) - i64::from(u8::try_from(mean).unwrap_or(100));
    volumes
        .iter()
        .map(|&v| {
            if v == 0 && delta > 0 {
                u8::try_from(delta).unwrap_or(100).min(100)
            } else {
                let scaled = (u64::from(v) * u64::from(target) + mean / 2) / mean;
                u8::try_from(scaled).unwrap_or(100).min(100)
            }
        })
        .collect()
}

/// Registry of groups plus the membership index.
pub struct GroupEngine {
    groups: Mutex<BTreeMap<String, Arc<Group>>>,
    membership: Mutex<HashMap<String, String>>,
    app: Arc<dyn AppAdapter>,
    factory: Arc<dyn EncoderFactory>,
    clock: MonotonicClock,
    events: Mutex<Option<mpsc::UnboundedSender<Event>>>,
}

impl GroupEngine {
    /// Creates an engine over the given application adapter and encoder
    /// factory.
    pub fn new(
        app: Arc<dyn AppAdapter>,
        factory: Arc<dyn EncoderFactory>,
        clock: MonotonicClock,
    ) -> Arc<Self> {
        Arc::new(Self {
            groups: Mutex::new(BTreeMap::new()),
            membership: Mutex::new(HashMap::new()),
            app,
            factory,
            clock,
            events: Mutex::new(None),
        })
    }

    /// Installs the events channel; replaces any previous one.
    pub fn set_event_sink(&self, sink: mpsc::UnboundedSender<Event>) {
        *self.events.lock().expect("engine events lock") = Some(sink);
    }

    fn emit(&self, event: Event) {
        let sink = self.events.lock().expect("engine events lock").clone();
        if let Some(sink) = sink {
            let _ = sink.send(event);
        }
    }

    /// Number of live groups.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.lock().expect("groups lock").len()
    }

    /// Looks up the group a client belongs to.
    #[must_use]
    pub fn group_of(&self, client_id: &str) -> Option<Arc<Group>> {
        let group_id = self
            .membership
            .lock()
            .expect("membership lock")
            .get(client_id)
            .cloned()?;
        self.groups.lock().expect("groups lock").get(&group_id).cloned()
    }

    /// Registers a freshly established endpoint into its own solo group
    /// and sends its initial context: `group/update` with state, id and
    /// name, then role-gated initial state.
    pub fn add_client(self: &Arc<Self>, endpoint: Arc<Endpoint>, hello: ClientHello) {
        let client_id = hello.client_id.clone();
        let group = Group::new(client_id.clone(), hello.name.clone());
        self.groups
            .lock()
            .expect("groups lock")
            .insert(client_id.clone(), Arc::clone(&group));
        self.membership
            .lock()
            .expect("membership lock")
            .insert(client_id.clone(), client_id.clone());

        self.attach(&group, endpoint, hello);
        self.emit(Event::GroupChanged { group_id: client_id });
    }

    /// Wires a member into `group` and sends its join-time state.
    fn attach(self: &Arc<Self>, group: &Arc<Group>, endpoint: Arc<Endpoint>, hello: ClientHello) {
        let client_id = hello.client_id.clone();
        let switch_ok = self.switch_available(group.id());
        let member = Member {
            endpoint: Arc::clone(&endpoint),
            hello,
            player: None,
            last_metadata: None,
        };

        let mut state = group.state.lock().expect("group lock");

        // Join-time context precedes any later fan-out this member sees.
        let update = ServerMessage::GroupUpdate(group.initial_update(&state));
        if let Ok(json) = update.to_json() {
            let _ = endpoint.send_text(json);
        }
        if member.has_role(Role::Metadata) {
            let snapshot = state.metadata.snapshot_update(self.clock.now_us());
            let message = ServerMessage::State(ServerState {
                metadata: Some(snapshot),
                controller: None,
            });
            if let Ok(json) = message.to_json() {
                let _ = endpoint.send_text(json);
            }
        }

        if let Some(stream) = state.stream.clone() {
            stream.add_member(&StreamMember {
                endpoint: Arc::clone(&member.endpoint),
                hello: member.hello.clone(),
            });
        }

        let metadata_snapshot = state.metadata.clone();
        let is_metadata = member.has_role(Role::Metadata);
        let is_controller = member.has_role(Role::Controller);
        state.members.push(member);
        group.sync_member_count(&state);
        if is_metadata {
            if let Some(member) = state.members.last_mut() {
                member.last_metadata = Some(metadata_snapshot);
            }
        }
        if is_controller {
            self.fan_out_controller_state(&state, switch_ok);
        }
        drop(state);

        // Deregistration runs exactly once from the endpoint's close
        // routine, no matter which side initiates the close. The hook
        // checks endpoint identity so a stale endpoint closing late
        // cannot evict a successor that reused its client id.
        let engine = Arc::clone(self);
        let this = Arc::clone(&endpoint);
        endpoint.add_cleanup(move || {
            let _ = engine.detach(&client_id, Some(&this));
        });
    }

    /// Moves a client into another group, creating it if needed.
    pub fn join_group(self: &Arc<Self>, client_id: &str, group_id: &str) {
        let Some((endpoint, hello)) = self.detach(client_id, None) else {
            return;
        };
        let group = {
            let mut groups = self.groups.lock().expect("groups lock");
            Arc::clone(
                groups
                    .entry(group_id.to_string())
                    .or_insert_with(|| Group::new(group_id.to_string(), hello.name.clone())),
            )
        };
        self.membership
            .lock()
            .expect("membership lock")
            .insert(client_id.to_string(), group_id.to_string());
        self.attach(&group, endpoint, hello);
        self.emit(Event::GroupChanged {
            group_id: group_id.to_string(),
        });
    }

    /// Removes a client from its group, destroying the group when its
    /// last member leaves. Idempotent: a second call is a no-op.
    pub fn remove_client(&self, client_id: &str) {
        let _ = self.detach(client_id, None);
    }

    /// Detaches a member from its group and returns its endpoint and
    /// hello for re-attachment. Destroys emptied groups. With
    /// `only_if`, the member is left alone unless it is that exact
    /// endpoint - the close hook of an evicted duplicate uses this.
    fn detach(
        &self,
        client_id: &str,
        only_if: Option<&Arc<Endpoint>>,
    ) -> Option<(Arc<Endpoint>, ClientHello)> {
        let group_id = self
            .membership
            .lock()
            .expect("membership lock")
            .get(client_id)
            .cloned()?;
        let group = self
            .groups
            .lock()
            .expect("groups lock")
            .get(&group_id)
            .cloned()?;

        let mut state = group.state.lock().expect("group lock");
        let index = state
            .members
            .iter()
            .position(|member| member.hello.client_id == client_id)?;
        if let Some(expected) = only_if {
            if !Arc::ptr_eq(&state.members[index].endpoint, expected) {
                return None;
            }
        }
        self.membership
            .lock()
            .expect("membership lock")
            .remove(client_id);
        let member = state.members.remove(index);
        group.sync_member_count(&state);
        if let Some(stream) = state.stream.clone() {
            stream.remove_member(client_id);
        }

        let emptied = state.members.is_empty();
        if emptied {
            if let Some(stream) = state.stream.take() {
                stream.stop();
            }
            group.set_playback(&mut state, PlaybackState::Stopped);
        } else {
            // The aggregate volume changed with the member set.
            self.fan_out_controller_state(&state, self.switch_available(&group_id));
        }
        drop(state);

        if emptied {
            self.groups.lock().expect("groups lock").remove(&group_id);
            debug!("group {group_id} destroyed");
        }
        self.emit(Event::GroupChanged { group_id });
        Some((member.endpoint, member.hello))
    }

    /// Handles a `client/state` report.
    pub fn handle_client_state(&self, endpoint: &Arc<Endpoint>, state: ClientState) {
        let Some(player) = state.player else { return };
        if !endpoint.has_role(Role::Player) {
            warn!("[{}] client/state.player from non-player", endpoint.peer());
            return;
        }
        if let Err(e) = player.validate() {
            warn!("[{}] rejected client/state: {e}", endpoint.peer());
            return;
        }
        let Some(client_id) = endpoint.client_id() else {
            return;
        };
        let Some(group) = self.group_of(client_id) else {
            return;
        };
        let switch_ok = self.switch_available(group.id());
        let mut group_state = group.state.lock().expect("group lock");
        let Some(member) = group_state
            .members
            .iter_mut()
            .find(|member| member.hello.client_id == client_id)
        else {
            return;
        };
        let changed = member.player != Some(player);
        member.player = Some(player);
        if changed {
            self.fan_out_controller_state(&group_state, switch_ok);
        }
    }

    /// Handles a `client/command` from a controller.
    pub fn handle_client_command(
        self: &Arc<Self>,
        endpoint: &Arc<Endpoint>,
        command: ControllerCommand,
    ) {
        if !endpoint.has_role(Role::Controller) {
            warn!("[{}] client/command from non-controller", endpoint.peer());
            return;
        }
        if let Err(e) = command.validate() {
            warn!("[{}] rejected client/command: {e}", endpoint.peer());
            return;
        }
        let Some(client_id) = endpoint.client_id().map(ToString::to_string) else {
            return;
        };
        let Some(group) = self.group_of(&client_id) else {
            return;
        };

        let supported = self.supported_commands(&group);
        if !supported.contains(&command.command) {
            warn!(
                "[{client_id}] unsupported command '{}' (supported: {supported:?})",
                command.command
            );
            return;
        }

        match command.command {
            MediaCommand::Play => self.play(&group),
            MediaCommand::Pause => self.pause(&group),
            MediaCommand::Stop => self.stop(&group),
            MediaCommand::Volume => {
                if let Some(volume) = command.volume {
                    self.set_group_volume(&group, volume);
                }
            }
            MediaCommand::Mute => {
                if let Some(mute) = command.mute {
                    self.set_group_mute(&group, mute);
                }
            }
            MediaCommand::Switch => self.switch(&client_id),
            forwarded => {
                self.app.media_command(group.id(), forwarded);
            }
        }
    }

    /// Handles a `stream/request-format` from a streaming member.
    pub fn handle_format_request(&self, endpoint: &Arc<Endpoint>, request: StreamRequestFormat) {
        let Some(client_id) = endpoint.client_id() else {
            return;
        };
        let Some(group) = self.group_of(client_id) else {
            return;
        };
        let stream = group.state.lock().expect("group lock").stream.clone();
        let Some(stream) = stream else {
            debug!("[{client_id}] format request without active stream");
            return;
        };

        if let Some(player) = &request.player {
            if endpoint.has_role(Role::Player) {
                stream.request_format(client_id, player);
            } else {
                warn!("[{client_id}] player format request from non-player");
            }
        }
        if let Some(artwork) = &request.artwork {
            if !endpoint.has_role(Role::Artwork) {
                warn!("[{client_id}] artwork format request from non-artwork");
            } else if let Err(e) = artwork.validate() {
                warn!("[{client_id}] rejected artwork format request: {e}");
            } else {
                stream.request_artwork_format(client_id, artwork);
            }
        }
    }

    /// Starts or resumes playback.
    pub fn play(self: &Arc<Self>, group: &Arc<Group>) {
        // The source is opened before taking the group lock: adapter
        // callbacks must never run under it. A losing racer's source is
        // simply dropped.
        let source = if group.playback() == PlaybackState::Stopped {
            self.app.open_source(group.id())
        } else {
            None
        };

        let mut state = group.state.lock().expect("group lock");
        let mut started = false;
        match state.playback {
            PlaybackState::Playing => return,
            PlaybackState::Paused => {
                if let Some(stream) = &state.stream {
                    stream.resume();
                }
            }
            PlaybackState::Stopped => {
                let Some(source) = source else {
                    debug!("no source for group {}", group.id());
                    return;
                };
                let members: Vec<StreamMember> = state
                    .members
                    .iter()
                    .filter(|member| {
                        member.hello.supported_roles.iter().any(|r| r.is_streaming())
                    })
                    .map(|member| StreamMember {
                        endpoint: Arc::clone(&member.endpoint),
                        hello: member.hello.clone(),
                    })
                    .collect();
                let stream = Stream::start(
                    group.id().to_string(),
                    members,
                    source,
                    Arc::clone(&self.factory),
                    self.clock,
                );
                state.stream = Some(stream);
                started = true;
            }
        }
        group.set_playback(&mut state, PlaybackState::Playing);
        Group::fan_out_group_update(&state);
        self.fan_out_controller_state(&state, self.switch_available(group.id()));
        drop(state);

        if started {
            self.emit(Event::StreamStarted {
                group_id: group.id().to_string(),
            });
        }
        self.app.media_command(group.id(), MediaCommand::Play);
    }

    /// Pauses playback.
    pub fn pause(self: &Arc<Self>, group: &Arc<Group>) {
        let mut state = group.state.lock().expect("group lock");
        if state.playback != PlaybackState::Playing {
            return;
        }
        if let Some(stream) = &state.stream {
            stream.pause();
        }
        group.set_playback(&mut state, PlaybackState::Paused);
        Group::fan_out_group_update(&state);
        self.fan_out_controller_state(&state, self.switch_available(group.id()));
        drop(state);
        self.app.media_command(group.id(), MediaCommand::Pause);
    }

    /// Stops playback and ends the stream.
    pub fn stop(self: &Arc<Self>, group: &Arc<Group>) {
        let mut state = group.state.lock().expect("group lock");
        if state.playback == PlaybackState::Stopped {
            return;
        }
        if let Some(stream) = state.stream.take() {
            stream.stop();
        }
        group.set_playback(&mut state, PlaybackState::Stopped);
        Group::fan_out_group_update(&state);
        self.fan_out_controller_state(&state, self.switch_available(group.id()));
        drop(state);

        self.emit(Event::StreamEnded {
            group_id: group.id().to_string(),
        });
        self.app.media_command(group.id(), MediaCommand::Stop);
    }

    /// Sets the group volume by proportionally scaling members.
    pub fn set_group_volume(self: &Arc<Self>, group: &Arc<Group>, target: u8) {
        let mut state = group.state.lock().expect("group lock");
        let player_indices: Vec<usize> = state
            .members
            .iter()
            .enumerate()
            .filter(|(_, m)| m.has_role(Role::Player))
            .map(|(i, _)| i)
            .collect();
        let volumes: Vec<u8> = player_indices
            .iter()
            .map(|&i| state.members[i].player.map_or(100, |p| p.volume))
            .collect();
        let scaled = scale_volumes(&volumes, target);
        let group_muted = state.muted;

        for (&index, &volume) in player_indices.iter().zip(scaled.iter()) {
            let member = &mut state.members[index];
            if !member.supports_player_command(PlayerCommand::Volume) {
                continue;
            }
            let command = ServerMessage::Command(ServerCommand {
                player: Some(PlayerCommandPayload::volume(volume)),
            });
            if let Ok(json) = command.to_json() {
                let _ = member.endpoint.send_text(json);
            }
            // Optimistic cache; the client's echoing client/state will
            // confirm or correct it.
            if let Some(player) = member.player.as_mut() {
                player.volume = volume;
            } else {
                member.player = Some(PlayerStatus {
                    state: crate::protocol::types::PlayerState::Synchronized,
                    volume,
                    muted: group_muted,
                });
            }
        }
        self.fan_out_controller_state(&state, self.switch_available(group.id()));
    }

    /// Sets the group mute state on every member that supports it.
    /// Member volumes are untouched, so unmuting restores them.
    pub fn set_group_mute(self: &Arc<Self>, group: &Arc<Group>, mute: bool) {
        let mut state = group.state.lock().expect("group lock");
        state.muted = mute;
        for member in &mut state.members {
            if !member.supports_player_command(PlayerCommand::Mute) {
                continue;
            }
            let command = ServerMessage::Command(ServerCommand {
                player: Some(PlayerCommandPayload::mute(mute)),
            });
            if let Ok(json) = command.to_json() {
                let _ = member.endpoint.send_text(json);
            }
            if let Some(player) = member.player.as_mut() {
                player.muted = mute;
            }
        }
        self.fan_out_controller_state(&state, self.switch_available(group.id()));
    }

    /// Publishes new media metadata for a group; metadata members get
    /// diffs against their last-sent snapshot.
    pub fn set_metadata(&self, group: &Arc<Group>, metadata: Metadata) {
        let timestamp = self.clock.now_us();
        let mut state = group.state.lock().expect("group lock");
        state.metadata = metadata.clone();
        for member in &mut state.members {
            if !member.has_role(Role::Metadata) {
                continue;
            }
            let update = metadata.diff_update(member.last_metadata.as_ref(), timestamp);
            member.last_metadata = Some(metadata.clone());
            let message = ServerMessage::State(ServerState {
                metadata: Some(update),
                controller: None,
            });
            if let Ok(json) = message.to_json() {
                let _ = member.endpoint.send_text(json);
            }
        }
    }

    /// Commands valid for `group` right now: the playback-state gate
    /// intersected with the application's capabilities, plus `switch`
    /// when the group's controllers have somewhere to go.
    #[must_use]
    pub fn supported_commands(&self, group: &Arc<Group>) -> Vec<MediaCommand> {
        let mut commands = state_gated_commands(group.playback(), &self.app.capabilities());
        if self.app.capabilities().contains(&MediaCommand::Switch)
            && self.switch_available(group.id())
        {
            commands.push(MediaCommand::Switch);
        }
        commands
    }

    fn fan_out_controller_state(&self, state: &GroupState, switch_ok: bool) {
        let mut supported = state_gated_commands(state.playback, &self.app.capabilities());
        if switch_ok && self.app.capabilities().contains(&MediaCommand::Switch) {
            supported.push(MediaCommand::Switch);
        }
        let controller = ControllerState {
            supported_commands: supported,
            volume: Group::group_volume(state),
            muted: state.muted,
        };
        let message = ServerMessage::State(ServerState {
            metadata: None,
            controller: Some(controller),
        });
        Group::fan_out(state, &message, |member| member.has_role(Role::Controller));
    }

    /// `true` when the switch cycle has more than one stop for a
    /// controller whose current group is `own_group_id`. Reads only the
    /// lock-free mirrors, so it is safe under any group lock.
    fn switch_available(&self, own_group_id: &str) -> bool {
        self.switch_candidates(own_group_id).len() > 1
    }

    /// The deterministic `switch` cycle: multi-member playing groups,
    /// then playing solo players, then the controller's own solo group;
    /// lexicographic by group id within each band.
    fn switch_candidates(&self, own_group_id: &str) -> Vec<String> {
        let groups = self.groups.lock().expect("groups lock");
        let mut multi_playing = Vec::new();
        let mut solo_playing = Vec::new();
        let mut own_solo = Vec::new();
        // BTreeMap iteration is ascending by id, which is the in-band
        // ordering the cycle requires.
        for (id, group) in groups.iter() {
            let playing = group.playback() == PlaybackState::Playing;
            let members = group.len();
            let is_own = id.as_str() == own_group_id;
            if members > 1 && playing {
                multi_playing.push(id.clone());
            } else if members == 1 && is_own {
                own_solo.push(id.clone());
            } else if members == 1 && playing {
                solo_playing.push(id.clone());
            }
        }
        multi_playing
            .into_iter()
            .chain(solo_playing)
            .chain(own_solo)
            .collect()
    }

    /// Cycles `client_id` to the next candidate group.
    pub fn switch(self: &Arc<Self>, client_id: &str) {
        let current = self
            .membership
            .lock()
            .expect("membership lock")
            .get(client_id)
            .cloned();
        let Some(current) = current else { return };

        let cycle = self.switch_candidates(&current);
        if cycle.is_empty() {
            debug!("[{client_id}] no groups to switch to");
            return;
        }
        let next = match cycle.iter().position(|id| *id == current) {
            Some(index) => cycle[(index + 1) % cycle.len()].clone(),
            None => cycle[0].clone(),
        };
        if next != current {
            info!("[{client_id}] switching to group {next}");
            self.join_group(client_id, &next);
        }
    }
}

/// Commands allowed by the playback state, intersected with `caps`.
fn state_gated_commands(playback: PlaybackState, caps: &[MediaCommand]) -> Vec<MediaCommand> {
    [
        MediaCommand::Play,
        MediaCommand::Pause,
        MediaCommand::Stop,
        MediaCommand::Next,
        MediaCommand::Previous,
        MediaCommand::Volume,
        MediaCommand::Mute,
        MediaCommand::RepeatOff,
        MediaCommand::RepeatOne,
        MediaCommand::RepeatAll,
        MediaCommand::Shuffle,
        MediaCommand::Unshuffle,
    ]
    .into_iter()
    .filter(|command| match command {
        MediaCommand::Play => playback != PlaybackState::Playing,
        MediaCommand::Pause => playback == PlaybackState::Playing,
        MediaCommand::Stop | MediaCommand::Next | MediaCommand::Previous => {
            playback != PlaybackState::Stopped
        }
        _ => true,
    })
    .filter(|command| caps.contains(command))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{Inbound, Phase};
    use crate::protocol::player::{AudioFormat, PlayerSupport};
    use crate::protocol::types::AudioCodec;
    use crate::stream::PcmEncoderFactory;
    use futures_util::StreamExt;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role as WsRole;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::WebSocketStream;

    /// A couple of chunks of silence, then end-of-source. Keeps stream
    /// tasks short-lived so unread test sockets never overflow.
    struct Silence {
        chunks_left: usize,
    }

    impl Silence {
        fn new() -> Self {
            Self { chunks_left: 2 }
        }
    }

    impl AudioSource for Silence {
        fn format(&self) -> AudioFormat {
            AudioFormat {
                codec: AudioCodec::Pcm,
                channels: 2,
                sample_rate: 48_000,
                bit_depth: 16,
            }
        }
        fn read(&mut self, buf: &mut [u8]) -> usize {
            if self.chunks_left == 0 {
                return 0;
            }
            self.chunks_left -= 1;
            buf.fill(0);
            buf.len()
        }
    }

    struct TestApp {
        forwarded: StdMutex<Vec<MediaCommand>>,
    }

    impl TestApp {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                forwarded: StdMutex::new(Vec::new()),
            })
        }
    }

    impl AppAdapter for TestApp {
        fn capabilities(&self) -> Vec<MediaCommand> {
            vec![
                MediaCommand::Play,
                MediaCommand::Pause,
                MediaCommand::Stop,
                MediaCommand::Next,
                MediaCommand::Volume,
                MediaCommand::Mute,
                MediaCommand::Switch,
            ]
        }
        fn open_source(&self, _group_id: &str) -> Option<Box<dyn AudioSource>> {
            Some(Box::new(Silence::new()))
        }
        fn media_command(&self, _group_id: &str, command: MediaCommand) {
            self.forwarded.lock().unwrap().push(command);
        }
    }

    fn engine_with_app() -> (Arc<GroupEngine>, Arc<TestApp>) {
        let app = TestApp::new();
        let engine = GroupEngine::new(
            Arc::clone(&app) as Arc<dyn AppAdapter>,
            Arc::new(PcmEncoderFactory),
            MonotonicClock::new(),
        );
        (engine, app)
    }

    fn hello(client_id: &str, roles: &[Role]) -> ClientHello {
        let player_support = roles.contains(&Role::Player).then(|| PlayerSupport {
            support_formats: vec![AudioFormat {
                codec: AudioCodec::Pcm,
                channels: 2,
                sample_rate: 48_000,
                bit_depth: 16,
            }],
            buffer_capacity: 262_144,
            supported_commands: vec![PlayerCommand::Volume, PlayerCommand::Mute],
        });
        ClientHello {
            client_id: client_id.to_string(),
            name: format!("client {client_id}"),
            version: 1,
            supported_roles: roles.to_vec(),
            device_info: None,
            player_support,
            artwork_support: None,
            visualizer_support: None,
        }
    }

    /// An established endpoint plus the far (client) side of its socket.
    async fn member(
        client_id: &str,
        roles: &[Role],
    ) -> (
        Arc<Endpoint>,
        ClientHello,
        WebSocketStream<DuplexStream>,
        tokio::sync::mpsc::UnboundedReceiver<Inbound>,
    ) {
        let (near, far) = tokio::io::duplex(256 * 1024);
        let server = WebSocketStream::from_raw_socket(near, WsRole::Server, None).await;
        let client = WebSocketStream::from_raw_socket(far, WsRole::Client, None).await;
        let (endpoint, inbound) = Endpoint::spawn(
            server,
            client_id.to_string(),
            Phase::HelloWait,
            64,
            Duration::from_millis(200),
        );
        let hello = hello(client_id, roles);
        endpoint
            .establish(client_id.to_string(), roles.to_vec())
            .unwrap();
        (endpoint, hello, client, inbound)
    }

    /// Collects server messages from the far side until `n` of the
    /// matching kind arrived or the timeout hits.
    async fn collect_matching(
        socket: &mut WebSocketStream<DuplexStream>,
        n: usize,
        predicate: impl Fn(&ServerMessage) -> bool,
    ) -> Vec<ServerMessage> {
        let mut found = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while found.len() < n {
            let message = tokio::time::timeout_at(deadline, socket.next()).await;
            let Ok(Some(Ok(WsMessage::Text(text)))) = message else {
                match message {
                    Ok(Some(Ok(_))) => continue, // binary frames etc.
                    _ => break,
                }
            };
            if let Ok(parsed) = ServerMessage::from_json(&text) {
                if predicate(&parsed) {
                    found.push(parsed);
                }
            }
        }
        found
    }

    #[test]
    fn volume_scaling_preserves_ratios_and_lifts_zeroes() {
        assert_eq!(scale_volumes(&[50, 100], 75), vec![50, 100]);
        // Halving the mean halves every member.
        assert_eq!(scale_volumes(&[40, 80], 30), vec![20, 40]);
        // Members at zero are lifted by the delta when raising.
        let scaled = scale_volumes(&[0, 60], 60);
        assert_eq!(scaled[0], 30);
        // Clamped at 100.
        assert!(scale_volumes(&[90, 10], 95).iter().all(|&v| v <= 100));
        // An all-zero group jumps straight to the target.
        assert_eq!(scale_volumes(&[0, 0], 40), vec![40, 40]);
    }

    #[test]
    fn state_gate_tracks_playback() {
        let caps = vec![
            MediaCommand::Play,
            MediaCommand::Pause,
            MediaCommand::Stop,
            MediaCommand::Volume,
        ];
        let stopped = state_gated_commands(PlaybackState::Stopped, &caps);
        assert!(stopped.contains(&MediaCommand::Play));
        assert!(!stopped.contains(&MediaCommand::Pause));
        assert!(!stopped.contains(&MediaCommand::Stop));

        let playing = state_gated_commands(PlaybackState::Playing, &caps);
        assert!(!playing.contains(&MediaCommand::Play));
        assert!(playing.contains(&MediaCommand::Pause));
        assert!(playing.contains(&MediaCommand::Stop));

        // Capabilities bound everything: no Next without the app.
        assert!(!playing.contains(&MediaCommand::Next));
    }

    #[tokio::test]
    async fn join_sends_initial_group_update() {
        let (engine, _app) = engine_with_app();
        let (endpoint, hello, mut far, _inbound) = member("c1", &[Role::Player]).await;
        engine.add_client(endpoint, hello);

        let updates =
            collect_matching(&mut far, 1, |m| matches!(m, ServerMessage::GroupUpdate(_))).await;
        let ServerMessage::GroupUpdate(update) = &updates[0] else {
            unreachable!()
        };
        assert_eq!(update.playback_state, Some(PlaybackState::Stopped));
        assert_eq!(update.group_id.as_deref(), Some("c1"));
        assert!(update.group_name.is_some());
    }

    #[tokio::test]
    async fn playback_transitions_report_all_three_states() {
        let (engine, _app) = engine_with_app();
        let (endpoint, hello, mut far, _inbound) = member("c1", &[Role::Player]).await;
        engine.add_client(Arc::clone(&endpoint), hello);
        let group = engine.group_of("c1").unwrap();

        // Drain the join-time update first.
        collect_matching(&mut far, 1, |m| matches!(m, ServerMessage::GroupUpdate(_))).await;

        engine.play(&group);
        engine.pause(&group);
        engine.play(&group);
        engine.stop(&group);

        let updates =
            collect_matching(&mut far, 4, |m| matches!(m, ServerMessage::GroupUpdate(_))).await;
        let states: Vec<_> = updates
            .iter()
            .filter_map(|m| match m {
                ServerMessage::GroupUpdate(u) => u.playback_state,
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                PlaybackState::Playing,
                PlaybackState::Paused,
                PlaybackState::Playing,
                PlaybackState::Stopped,
            ]
        );
    }

    #[tokio::test]
    async fn stream_messages_never_reach_metadata_only_members() {
        let (engine, _app) = engine_with_app();
        let (player_ep, player_hello, mut player_far, _pi) =
            member("a-player", &[Role::Player]).await;
        let (meta_ep, meta_hello, mut meta_far, _mi) = member("b-meta", &[Role::Metadata]).await;
        engine.add_client(Arc::clone(&player_ep), player_hello);
        engine.add_client(Arc::clone(&meta_ep), meta_hello);
        engine.join_group("b-meta", "a-player");
        assert_eq!(engine.group_of("b-meta").unwrap().id(), "a-player");

        let group = engine.group_of("a-player").unwrap();
        engine.play(&group);

        let started = collect_matching(&mut player_far, 1, |m| {
            matches!(m, ServerMessage::StreamStart(_))
        })
        .await;
        assert_eq!(started.len(), 1, "player did not receive stream/start");

        engine.stop(&group);

        // The metadata member saw group updates and metadata state, but
        // not one stream/* message or binary frame.
        let mut saw_stream = false;
        let deadline = tokio::time::Instant::now() + Duration::from_millis(300);
        loop {
            match tokio::time::timeout_at(deadline, meta_far.next()).await {
                Ok(Some(Ok(WsMessage::Text(text)))) => {
                    if let Ok(parsed) = ServerMessage::from_json(&text) {
                        if parsed.is_stream_message() {
                            saw_stream = true;
                        }
                    }
                }
                Ok(Some(Ok(WsMessage::Binary(_)))) => saw_stream = true,
                _ => break,
            }
        }
        assert!(!saw_stream, "metadata-only member received stream traffic");
    }

    #[tokio::test]
    async fn disconnect_decrements_membership_exactly_once() {
        let (engine, _app) = engine_with_app();
        let (endpoint, hello, _far, _inbound) = member("c1", &[Role::Player]).await;
        engine.add_client(Arc::clone(&endpoint), hello);
        assert_eq!(engine.group_count(), 1);

        endpoint.close(crate::endpoint::CloseReason::TransportError, false);
        endpoint.closed().await;
        // The cleanup hook ran once: the solo group is gone, and a
        // second removal is a no-op.
        assert_eq!(engine.group_count(), 0);
        engine.remove_client("c1");
        assert_eq!(engine.group_count(), 0);
    }

    #[tokio::test]
    async fn unsupported_commands_are_dropped() {
        let (engine, app) = engine_with_app();
        let (endpoint, hello, _far, _inbound) =
            member("c1", &[Role::Player, Role::Controller]).await;
        engine.add_client(Arc::clone(&endpoint), hello);

        // Previous is not in the app's capabilities; Pause is not valid
        // while stopped. Neither may reach the app.
        engine.handle_client_command(&endpoint, ControllerCommand::simple(MediaCommand::Previous));
        engine.handle_client_command(&endpoint, ControllerCommand::simple(MediaCommand::Pause));
        assert!(app.forwarded.lock().unwrap().is_empty());

        engine.handle_client_command(&endpoint, ControllerCommand::simple(MediaCommand::Play));
        assert_eq!(
            app.forwarded.lock().unwrap().as_slice(),
            &[MediaCommand::Play]
        );
        let group = engine.group_of("c1").unwrap();
        engine.stop(&group);
    }

    #[tokio::test]
    async fn switch_cycles_lexicographically_through_bands() {
        let (engine, _app) = engine_with_app();
        let (ep_a, hello_a, _fa, _ia) = member("alpha", &[Role::Player]).await;
        let (ep_b, hello_b, _fb, _ib) = member("beta", &[Role::Player]).await;
        let (ep_c, hello_c, _fc, _ic) = member("gamma", &[Role::Player, Role::Controller]).await;
        engine.add_client(ep_a, hello_a);
        engine.add_client(ep_b, hello_b);
        engine.add_client(ep_c, hello_c);

        // alpha and beta are solo players, both playing.
        engine.play(&engine.group_of("alpha").unwrap());
        engine.play(&engine.group_of("beta").unwrap());

        // gamma idles in its own solo group: the cycle is
        // [alpha, beta, gamma] and switching walks it in order.
        engine.switch("gamma");
        assert_eq!(engine.group_of("gamma").unwrap().id(), "alpha");
        engine.switch("gamma");
        assert_eq!(engine.group_of("gamma").unwrap().id(), "beta");

        engine.stop(&engine.group_of("alpha").unwrap());
        engine.stop(&engine.group_of("beta").unwrap());
    }
}
