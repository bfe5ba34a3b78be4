//! Typed text envelopes of the Resonate protocol.
//!
//! Every text message is JSON of the form
//! `{ "type": <string>, "payload": <object|absent> }`. The typed
//! [`ClientMessage`] and [`ServerMessage`] enums convert through the
//! untyped [`WireEnvelope`] so that serialization, deserialization and
//! validation share one code path. `stream/end` has no payload; the
//! decoder accepts an absent, `null`, or empty-object payload for it and
//! the encoder omits the key.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use super::artwork::{ArtworkFormatRequest, ArtworkSupport, StreamStartArtwork, StreamUpdateArtwork};
use super::controller::{ControllerCommand, ControllerState, GroupUpdate};
use super::metadata::MetadataUpdate;
use super::player::{
    FormatRequest, PlayerCommandPayload, PlayerStatus, PlayerSupport, StreamStartPlayer,
    StreamUpdatePlayer,
};
use super::types::Role;
use super::visualizer::{StreamStartVisualizer, StreamUpdateVisualizer, VisualizerSupport};
use crate::error::{Error, Result};

/// Optional device description in `client/hello`.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device model or product name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,
    /// Device manufacturer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    /// Software version of the client, not of the protocol.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub software_version: Option<String>,
}

/// `client/hello` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientHello {
    /// Uniquely identifies the client for groups and de-duplication.
    pub client_id: String,
    /// Friendly name of the client.
    pub name: String,
    /// Protocol version the client implements.
    pub version: u32,
    /// Roles the client supports.
    pub supported_roles: Vec<Role>,
    /// Optional device description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_info: Option<DeviceInfo>,
    /// Player support block; required iff `player` is declared.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player_support: Option<PlayerSupport>,
    /// Artwork support block; required iff `artwork` is declared.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artwork_support: Option<ArtworkSupport>,
    /// Visualizer support block; required iff `visualizer` is declared.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visualizer_support: Option<VisualizerSupport>,
}

impl ClientHello {
    /// Enforces that support blocks match the declared roles; support
    /// blocks for undeclared roles are dropped rather than rejected.
    ///
    /// # Errors
    ///
    /// Returns `PayloadRange` when a declared role lacks its support
    /// block or a block fails its own validation.
    pub fn validate(&mut self) -> Result<()> {
        for (role, missing) in [
            (Role::Player, self.player_support.is_none()),
            (Role::Artwork, self.artwork_support.is_none()),
            (Role::Visualizer, self.visualizer_support.is_none()),
        ] {
            if self.supported_roles.contains(&role) && missing {
                return Err(Error::out_of_range(format!(
                    "{role}_support must be provided when the {role} role is declared"
                )));
            }
        }
        if !self.supported_roles.contains(&Role::Player) {
            self.player_support = None;
        }
        if !self.supported_roles.contains(&Role::Artwork) {
            self.artwork_support = None;
        }
        if !self.supported_roles.contains(&Role::Visualizer) {
            self.visualizer_support = None;
        }

        if let Some(support) = &self.player_support {
            support.validate()?;
        }
        if let Some(support) = &self.artwork_support {
            support.validate()?;
        }
        if let Some(support) = &self.visualizer_support {
            support.validate()?;
        }
        Ok(())
    }
}

/// `server/hello` payload.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ServerHello {
    /// Identifier of the server.
    pub server_id: String,
    /// Friendly name of the server.
    pub name: String,
    /// Latest protocol version the server supports.
    pub version: u32,
}

/// `client/time` payload. All timestamps are microseconds.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ClientTime {
    /// Client monotonic clock at transmit.
    pub client_transmitted: i64,
}

/// `server/time` payload.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ServerTime {
    /// Echo of the client's transmit timestamp.
    pub client_transmitted: i64,
    /// Server clock when the `client/time` arrived.
    pub server_received: i64,
    /// Server clock when this reply was sent.
    pub server_transmitted: i64,
}

/// `client/state` payload.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ClientState {
    /// Player state; only for clients with the player role.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player: Option<PlayerStatus>,
}

/// `client/command` payload.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ClientCommand {
    /// Controller command; only for clients with the controller role.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controller: Option<ControllerCommand>,
}

/// `server/state` payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerState {
    /// Metadata delta; only sent to metadata-role members.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MetadataUpdate>,
    /// Controller state; only sent to controller-role members.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controller: Option<ControllerState>,
}

/// `server/command` payload.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ServerCommand {
    /// Player command; only sent to player-role members.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player: Option<PlayerCommandPayload>,
}

/// `stream/start` payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamStart {
    /// Audio configuration; only for player members.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player: Option<StreamStartPlayer>,
    /// Artwork channel configuration; only for artwork members.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artwork: Option<StreamStartArtwork>,
    /// Visualizer configuration; only for visualizer members.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visualizer: Option<StreamStartVisualizer>,
}

/// `stream/update` payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamUpdate {
    /// Audio format delta.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player: Option<StreamUpdatePlayer>,
    /// Artwork configuration delta.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artwork: Option<StreamUpdateArtwork>,
    /// Visualizer configuration delta.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visualizer: Option<StreamUpdateVisualizer>,
}

/// `stream/request-format` payload.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamRequestFormat {
    /// Player format request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player: Option<FormatRequest>,
    /// Artwork channel reconfiguration request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artwork: Option<ArtworkFormatRequest>,
}

/// Messages originated by a client.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientMessage {
    /// `client/hello`: identify and declare roles.
    Hello(ClientHello),
    /// `client/time`: clock synchronization probe.
    Time(ClientTime),
    /// `client/state`: player state report.
    State(ClientState),
    /// `client/command`: controller command.
    Command(ClientCommand),
    /// `stream/request-format`: ask for a different stream format.
    RequestFormat(StreamRequestFormat),
}

/// Messages originated by a server.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerMessage {
    /// `server/hello`: handshake reply.
    Hello(ServerHello),
    /// `server/time`: clock synchronization reply.
    Time(ServerTime),
    /// `server/state`: role-gated state fan-out.
    State(ServerState),
    /// `server/command`: player command.
    Command(ServerCommand),
    /// `group/update`: group context delta.
    GroupUpdate(GroupUpdate),
    /// `stream/start`: a stream begins for this member.
    StreamStart(StreamStart),
    /// `stream/update`: mid-stream delta.
    StreamUpdate(StreamUpdate),
    /// `stream/end`: the stream is over; no payload.
    StreamEnd,
}

/// The untyped wire form of a text message.
///
/// The typed enums convert through this; use those instead.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct WireEnvelope {
    /// Message type tag, e.g. `client/hello`.
    #[serde(rename = "type")]
    kind: String,
    /// Payload object; absent for `stream/end`.
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
}

fn envelope<T: Serialize>(kind: &str, payload: &T) -> Result<WireEnvelope> {
    Ok(WireEnvelope {
        kind: kind.to_string(),
        payload: Some(serde_json::to_value(payload)?),
    })
}

fn payload_of<T: for<'de> Deserialize<'de>>(kind: &str, payload: Option<Value>) -> Result<T> {
    let payload = payload.ok_or_else(|| Error::malformed(format!("{kind} without payload")))?;
    serde_json::from_value(payload).map_err(Into::into)
}

impl ClientMessage {
    /// The wire `type` string of this message.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Hello(_) => "client/hello",
            ClientMessage::Time(_) => "client/time",
            ClientMessage::State(_) => "client/state",
            ClientMessage::Command(_) => "client/command",
            ClientMessage::RequestFormat(_) => "stream/request-format",
        }
    }

    /// Parses a client-origin text frame.
    ///
    /// # Errors
    ///
    /// `MalformedFrame` for invalid JSON or a payload that does not match
    /// the type tag; `UnknownMessageType` for an unrecognized tag.
    pub fn from_json(text: &str) -> Result<Self> {
        let envelope: WireEnvelope = super::json(text, "client message")?;
        Self::try_from(envelope)
    }

    /// Serializes to the wire JSON.
    ///
    /// # Errors
    ///
    /// Returns `MalformedFrame` if payload serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(&WireEnvelope::try_from(self)?).map_err(Into::into)
    }
}

impl TryFrom<WireEnvelope> for ClientMessage {
    type Error = Error;

    fn try_from(wire: WireEnvelope) -> Result<Self> {
        let WireEnvelope { kind, payload } = wire;
        let message = match kind.as_str() {
            "client/hello" => ClientMessage::Hello(payload_of(&kind, payload)?),
            "client/time" => ClientMessage::Time(payload_of(&kind, payload)?),
            "client/state" => ClientMessage::State(payload_of(&kind, payload)?),
            "client/command" => ClientMessage::Command(payload_of(&kind, payload)?),
            "stream/request-format" => ClientMessage::RequestFormat(payload_of(&kind, payload)?),
            other => {
                return Err(Error::unknown_type(format!(
                    "unknown client message type {other}"
                )))
            }
        };
        Ok(message)
    }
}

impl TryFrom<&ClientMessage> for WireEnvelope {
    type Error = Error;

    fn try_from(message: &ClientMessage) -> Result<Self> {
        let kind = message.kind();
        match message {
            ClientMessage::Hello(p) => envelope(kind, p),
            ClientMessage::Time(p) => envelope(kind, p),
            ClientMessage::State(p) => envelope(kind, p),
            ClientMessage::Command(p) => envelope(kind, p),
            ClientMessage::RequestFormat(p) => envelope(kind, p),
        }
    }
}

impl ServerMessage {
    /// The wire `type` string of this message.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Hello(_) => "server/hello",
            ServerMessage::Time(_) => "server/time",
            ServerMessage::State(_) => "server/state",
            ServerMessage::Command(_) => "server/command",
            ServerMessage::GroupUpdate(_) => "group/update",
            ServerMessage::StreamStart(_) => "stream/start",
            ServerMessage::StreamUpdate(_) => "stream/update",
            ServerMessage::StreamEnd => "stream/end",
        }
    }

    /// `true` for messages only valid for streaming roles.
    #[must_use]
    pub fn is_stream_message(&self) -> bool {
        matches!(
            self,
            ServerMessage::StreamStart(_) | ServerMessage::StreamUpdate(_) | ServerMessage::StreamEnd
        )
    }

    /// Parses a server-origin text frame.
    ///
    /// # Errors
    ///
    /// `MalformedFrame` for invalid JSON or a payload that does not match
    /// the type tag; `UnknownMessageType` for an unrecognized tag.
    pub fn from_json(text: &str) -> Result<Self> {
        let envelope: WireEnvelope = super::json(text, "server message")?;
        Self::try_from(envelope)
    }

    /// Serializes to the wire JSON.
    ///
    /// # Errors
    ///
    /// Returns `MalformedFrame` if payload serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(&WireEnvelope::try_from(self)?).map_err(Into::into)
    }
}

impl TryFrom<WireEnvelope> for ServerMessage {
    type Error = Error;

    fn try_from(wire: WireEnvelope) -> Result<Self> {
        let WireEnvelope { kind, payload } = wire;
        let message = match kind.as_str() {
            "server/hello" => ServerMessage::Hello(payload_of(&kind, payload)?),
            "server/time" => ServerMessage::Time(payload_of(&kind, payload)?),
            "server/state" => ServerMessage::State(payload_of(&kind, payload)?),
            "server/command" => ServerMessage::Command(payload_of(&kind, payload)?),
            "group/update" => ServerMessage::GroupUpdate(payload_of(&kind, payload)?),
            "stream/start" => ServerMessage::StreamStart(payload_of(&kind, payload)?),
            "stream/update" => ServerMessage::StreamUpdate(payload_of(&kind, payload)?),
            // The payload is absent on encode; accept null or an empty
            // object from other implementations.
            "stream/end" => match payload {
                None | Some(Value::Null) => ServerMessage::StreamEnd,
                Some(Value::Object(map)) if map.is_empty() => ServerMessage::StreamEnd,
                Some(other) => {
                    return Err(Error::malformed(format!(
                        "stream/end carries unexpected payload {other}"
                    )))
                }
            },
            other => {
                return Err(Error::unknown_type(format!(
                    "unknown server message type {other}"
                )))
            }
        };
        Ok(message)
    }
}

impl TryFrom<&ServerMessage> for WireEnvelope {
    type Error = Error;

    fn try_from(message: &ServerMessage) -> Result<Self> {
        let kind = message.kind();
        match message {
            ServerMessage::Hello(p) => envelope(kind, p),
            ServerMessage::Time(p) => envelope(kind, p),
            ServerMessage::State(p) => envelope(kind, p),
            ServerMessage::Command(p) => envelope(kind, p),
            ServerMessage::GroupUpdate(p) => envelope(kind, p),
            ServerMessage::StreamStart(p) => envelope(kind, p),
            ServerMessage::StreamUpdate(p) => envelope(kind, p),
            ServerMessage::StreamEnd => Ok(WireEnvelope {
                kind: kind.to_string(),
                payload: None,
            }),
        }
    }
}

impl fmt::Display for ClientMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind())
    }
}

impl fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind())
    }
}

impl Serialize for ClientMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        WireEnvelope::try_from(self)
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ClientMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let wire = WireEnvelope::deserialize(deserializer)?;
        Self::try_from(wire).map_err(serde::de::Error::custom)
    }
}

impl Serialize for ServerMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        WireEnvelope::try_from(self)
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ServerMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let wire = WireEnvelope::deserialize(deserializer)?;
        Self::try_from(wire).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::protocol::player::AudioFormat;
    use crate::protocol::types::{AudioCodec, PlayerCommand};

    #[test]
    fn hello_round_trips() {
        let hello = ClientMessage::Hello(ClientHello {
            client_id: "c1".into(),
            name: "Kitchen".into(),
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
        });
        let json = hello.to_json().unwrap();
        assert!(json.starts_with(r#"{"type":"client/hello"#));
        assert_eq!(ClientMessage::from_json(&json).unwrap(), hello);
    }

    #[test]
    fn hello_requires_support_for_declared_roles() {
        let mut hello = ClientHello {
            client_id: "c1".into(),
            name: "Kitchen".into(),
            version: 1,
            supported_roles: vec![Role::Player],
            device_info: None,
            player_support: None,
            artwork_support: None,
            visualizer_support: None,
        };
        assert!(hello.validate().is_err());
    }

    #[test]
    fn hello_drops_support_for_undeclared_roles() {
        let mut hello = ClientHello {
            client_id: "c1".into(),
            name: "Panel".into(),
            version: 1,
            supported_roles: vec![Role::Metadata],
            device_info: None,
            player_support: Some(PlayerSupport {
                support_formats: vec![AudioFormat {
                    codec: AudioCodec::Pcm,
                    channels: 2,
                    sample_rate: 44_100,
                    bit_depth: 16,
                }],
                buffer_capacity: 1024,
                supported_commands: vec![],
            }),
            artwork_support: None,
            visualizer_support: None,
        };
        hello.validate().unwrap();
        assert!(hello.player_support.is_none());
    }

    #[test]
    fn stream_end_accepts_absent_null_and_empty_payload() {
        for json in [
            r#"{"type":"stream/end"}"#,
            r#"{"type":"stream/end","payload":null}"#,
            r#"{"type":"stream/end","payload":{}}"#,
        ] {
            assert_eq!(ServerMessage::from_json(json).unwrap(), ServerMessage::StreamEnd);
        }
        // Absent on encode.
        assert_eq!(
            ServerMessage::StreamEnd.to_json().unwrap(),
            r#"{"type":"stream/end"}"#
        );
    }

    #[test]
    fn unknown_types_are_distinguished_from_malformed_json() {
        let err = ClientMessage::from_json(r#"{"type":"client/goodbye","payload":{}}"#).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownMessageType);

        let err = ClientMessage::from_json("{not json").unwrap_err();
        assert_eq!(err.kind, ErrorKind::MalformedFrame);
    }

    #[test]
    fn scenario_handshake_reply_shape() {
        let reply = ServerMessage::Hello(ServerHello {
            server_id: "s1".into(),
            name: "Living Room Server".into(),
            version: 1,
        });
        assert_eq!(
            reply.to_json().unwrap(),
            r#"{"type":"server/hello","payload":{"server_id":"s1","name":"Living Room Server","version":1}}"#
        );
    }
}
