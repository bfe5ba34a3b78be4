//! String-wire enums shared across Resonate payloads.
//!
//! Everything here serializes as its lowercase wire string, following the
//! display/parse pair convention used throughout the crate: `Display`
//! produces the wire form, `FromStr` accepts it, and serde goes through
//! both via `serde_with`.

use serde_with::{DeserializeFromStr, SerializeDisplay};
use std::{fmt, str::FromStr};

use crate::error::Error;

/// Declared capability of an endpoint.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, SerializeDisplay, DeserializeFromStr, Debug, Hash)]
pub enum Role {
    /// Receives audio and plays it in sync. Has its own volume, mute
    /// state and format preferences.
    Player,

    /// Controls the group this endpoint is part of.
    Controller,

    /// Displays text metadata describing the current audio.
    Metadata,

    /// Displays artwork images on up to four channels.
    Artwork,

    /// Renders audio feature frames.
    Visualizer,
}

impl Role {
    /// Roles that receive `stream/*` messages and binary frames.
    #[must_use]
    pub fn is_streaming(self) -> bool {
        matches!(self, Role::Player | Role::Artwork | Role::Visualizer)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Player => "player",
            Role::Controller => "controller",
            Role::Metadata => "metadata",
            Role::Artwork => "artwork",
            Role::Visualizer => "visualizer",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "player" => Ok(Role::Player),
            "controller" => Ok(Role::Controller),
            "metadata" => Ok(Role::Metadata),
            "artwork" => Ok(Role::Artwork),
            "visualizer" => Ok(Role::Visualizer),
            _ => Err(Error::unknown_type(format!("unknown role {s}"))),
        }
    }
}

/// Audio codecs negotiable for a player stream.
///
/// Encoder implementations live outside this crate; the engine only
/// negotiates and schedules them.
#[derive(Copy, Clone, Default, Eq, PartialEq, SerializeDisplay, DeserializeFromStr, Debug, Hash)]
pub enum AudioCodec {
    /// Opus in Ogg-less raw packets.
    Opus,

    /// FLAC frames; requires a codec header carried in `stream/start`.
    Flac,

    /// Uncompressed interleaved PCM.
    #[default]
    Pcm,
}

impl fmt::Display for AudioCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AudioCodec::Opus => "opus",
            AudioCodec::Flac => "flac",
            AudioCodec::Pcm => "pcm",
        };
        write!(f, "{s}")
    }
}

impl FromStr for AudioCodec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "opus" => Ok(AudioCodec::Opus),
            "flac" => Ok(AudioCodec::Flac),
            "pcm" => Ok(AudioCodec::Pcm),
            _ => Err(Error::unknown_type(format!("unknown codec {s}"))),
        }
    }
}

/// State a player reports in `client/state`.
#[derive(Copy, Clone, Eq, PartialEq, SerializeDisplay, DeserializeFromStr, Debug, Hash)]
pub enum PlayerState {
    /// Clock filter healthy, playback locked to the server clock.
    Synchronized,

    /// Player cannot hold sync (for example on clock divergence).
    Error,
}

impl fmt::Display for PlayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlayerState::Synchronized => write!(f, "synchronized"),
            PlayerState::Error => write!(f, "error"),
        }
    }
}

impl FromStr for PlayerState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "synchronized" => Ok(PlayerState::Synchronized),
            "error" => Ok(PlayerState::Error),
            _ => Err(Error::unknown_type(format!("unknown player state {s}"))),
        }
    }
}

/// Playback state of a group.
///
/// All three values are wire-visible; `stopped` is never collapsed into
/// `paused` when reporting.
#[derive(Copy, Clone, Default, Eq, PartialEq, SerializeDisplay, DeserializeFromStr, Debug, Hash)]
pub enum PlaybackState {
    /// A stream is active and frames are being produced.
    Playing,

    /// A stream exists but frame production is suspended.
    Paused,

    /// No active stream.
    #[default]
    Stopped,
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
            PlaybackState::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

impl FromStr for PlaybackState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "playing" => Ok(PlaybackState::Playing),
            "paused" => Ok(PlaybackState::Paused),
            "stopped" => Ok(PlaybackState::Stopped),
            _ => Err(Error::unknown_type(format!("unknown playback state {s}"))),
        }
    }
}

/// Commands a server may issue to a player.
#[derive(Copy, Clone, Eq, PartialEq, SerializeDisplay, DeserializeFromStr, Debug, Hash)]
pub enum PlayerCommand {
    /// Set the player volume.
    Volume,

    /// Set the player mute state.
    Mute,
}

impl fmt::Display for PlayerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlayerCommand::Volume => write!(f, "volume"),
            PlayerCommand::Mute => write!(f, "mute"),
        }
    }
}

impl FromStr for PlayerCommand {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "volume" => Ok(PlayerCommand::Volume),
            "mute" => Ok(PlayerCommand::Mute),
            _ => Err(Error::unknown_type(format!("unknown player command {s}"))),
        }
    }
}

/// Commands a controller may submit via `client/command`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, SerializeDisplay, DeserializeFromStr, Debug, Hash)]
pub enum MediaCommand {
    /// Start or resume playback.
    Play,
    /// Suspend playback, keeping the stream.
    Pause,
    /// End playback and the stream.
    Stop,
    /// Skip to the next item.
    Next,
    /// Skip to the previous item.
    Previous,
    /// Set the group volume.
    Volume,
    /// Set the group mute state.
    Mute,
    /// Disable repeat.
    RepeatOff,
    /// Repeat the current item.
    RepeatOne,
    /// Repeat the whole queue.
    RepeatAll,
    /// Enable shuffle.
    Shuffle,
    /// Disable shuffle.
    Unshuffle,
    /// Cycle this controller through candidate groups.
    Switch,
}

impl fmt::Display for MediaCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MediaCommand::Play => "play",
            MediaCommand::Pause => "pause",
            MediaCommand::Stop => "stop",
            MediaCommand::Next => "next",
            MediaCommand::Previous => "previous",
            MediaCommand::Volume => "volume",
            MediaCommand::Mute => "mute",
            MediaCommand::RepeatOff => "repeat_off",
            MediaCommand::RepeatOne => "repeat_one",
            MediaCommand::RepeatAll => "repeat_all",
            MediaCommand::Shuffle => "shuffle",
            MediaCommand::Unshuffle => "unshuffle",
            MediaCommand::Switch => "switch",
        };
        write!(f, "{s}")
    }
}

impl FromStr for MediaCommand {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "play" => Ok(MediaCommand::Play),
            "pause" => Ok(MediaCommand::Pause),
            "stop" => Ok(MediaCommand::Stop),
            "next" => Ok(MediaCommand::Next),
            "previous" => Ok(MediaCommand::Previous),
            "volume" => Ok(MediaCommand::Volume),
            "mute" => Ok(MediaCommand::Mute),
            "repeat_off" => Ok(MediaCommand::RepeatOff),
            "repeat_one" => Ok(MediaCommand::RepeatOne),
            "repeat_all" => Ok(MediaCommand::RepeatAll),
            "shuffle" => Ok(MediaCommand::Shuffle),
            "unshuffle" => Ok(MediaCommand::Unshuffle),
            "switch" => Ok(MediaCommand::Switch),
            _ => Err(Error::unknown_type(format!("unknown media command {s}"))),
        }
    }
}

/// Repeat modes reported in metadata.
#[derive(Copy, Clone, Default, Eq, PartialEq, SerializeDisplay, DeserializeFromStr, Debug, Hash)]
pub enum RepeatMode {
    /// No repeat.
    #[default]
    Off,
    /// Repeat the current item.
    One,
    /// Repeat the whole queue.
    All,
}

impl fmt::Display for RepeatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RepeatMode::Off => "off",
            RepeatMode::One => "one",
            RepeatMode::All => "all",
        };
        write!(f, "{s}")
    }
}

impl FromStr for RepeatMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(RepeatMode::Off),
            "one" => Ok(RepeatMode::One),
            "all" => Ok(RepeatMode::All),
            _ => Err(Error::unknown_type(format!("unknown repeat mode {s}"))),
        }
    }
}

/// Image formats for artwork channels.
#[derive(Copy, Clone, Eq, PartialEq, SerializeDisplay, DeserializeFromStr, Debug, Hash)]
pub enum PictureFormat {
    /// JPEG.
    Jpeg,
    /// PNG.
    Png,
    /// Uncompressed BMP, for clients without an image decoder.
    Bmp,
}

impl fmt::Display for PictureFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PictureFormat::Jpeg => "jpeg",
            PictureFormat::Png => "png",
            PictureFormat::Bmp => "bmp",
        };
        write!(f, "{s}")
    }
}

impl FromStr for PictureFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "jpeg" => Ok(PictureFormat::Jpeg),
            "png" => Ok(PictureFormat::Png),
            "bmp" => Ok(PictureFormat::Bmp),
            _ => Err(Error::unknown_type(format!("unknown picture format {s}"))),
        }
    }
}

/// What an artwork channel displays.
#[derive(Copy, Clone, Default, Eq, PartialEq, SerializeDisplay, DeserializeFromStr, Debug, Hash)]
pub enum ArtworkSource {
    /// Album artwork.
    Album,
    /// Artist artwork.
    Artist,
    /// Channel disabled.
    #[default]
    None,
}

impl fmt::Display for ArtworkSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArtworkSource::Album => "album",
            ArtworkSource::Artist => "artist",
            ArtworkSource::None => "none",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ArtworkSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "album" => Ok(ArtworkSource::Album),
            "artist" => Ok(ArtworkSource::Artist),
            "none" => Ok(ArtworkSource::None),
            _ => Err(Error::unknown_type(format!("unknown artwork source {s}"))),
        }
    }
}
