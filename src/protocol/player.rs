//! Payload objects for the `player` role.
//!
//! Players receive timestamped audio, keep their own volume and mute
//! state, and may ask for a different stream format when conditions
//! change (for example a constrained client dropping from FLAC to Opus).

use serde::{Deserialize, Serialize};

use super::types::{AudioCodec, PlayerCommand, PlayerState};
use crate::error::{Error, Result};

/// One audio format a player can accept, in `client/hello` priority order.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Codec identifier.
    pub codec: AudioCodec,
    /// Channel count (1 = mono, 2 = stereo).
    pub channels: u8,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Bit depth (16 or 24).
    pub bit_depth: u8,
}

impl AudioFormat {
    /// Bytes per second of PCM at this format, used for pacing estimates.
    #[must_use]
    pub fn byte_rate(&self) -> u64 {
        u64::from(self.sample_rate)
            * u64::from(self.channels)
            * (u64::from(self.bit_depth) / 8)
    }

    /// Rejects zero-valued dimensions.
    ///
    /// # Errors
    ///
    /// Returns `PayloadRange` if any dimension is zero.
    pub fn validate(&self) -> Result<()> {
        if self.channels == 0 || self.sample_rate == 0 || self.bit_depth == 0 {
            return Err(Error::out_of_range(format!(
                "audio format has zero dimension: {self:?}"
            )));
        }
        Ok(())
    }
}

/// Player support block of `client/hello`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerSupport {
    /// Supported formats, most preferred first.
    pub support_formats: Vec<AudioFormat>,
    /// Max bytes of yet-to-be-played compressed audio the client buffers.
    pub buffer_capacity: u64,
    /// Subset of `volume`, `mute`.
    pub supported_commands: Vec<PlayerCommand>,
}

impl PlayerSupport {
    /// Validates the support block.
    ///
    /// # Errors
    ///
    /// Returns `PayloadRange` when no format is offered, any format is
    /// degenerate, or the buffer capacity is zero.
    pub fn validate(&self) -> Result<()> {
        if self.support_formats.is_empty() {
            return Err(Error::out_of_range("support_formats cannot be empty"));
        }
        for format in &self.support_formats {
            format.validate()?;
        }
        if self.buffer_capacity == 0 {
            return Err(Error::out_of_range("buffer_capacity must be positive"));
        }
        Ok(())
    }
}

/// Player object in `client/state`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PlayerStatus {
    /// Whether the player is locked to the server clock.
    pub state: PlayerState,
    /// Volume, 0..=100.
    pub volume: u8,
    /// Mute state.
    pub muted: bool,
}

impl PlayerStatus {
    /// Validates the volume range.
    ///
    /// # Errors
    ///
    /// Returns `PayloadRange` for a volume above 100.
    pub fn validate(&self) -> Result<()> {
        if self.volume > 100 {
            return Err(Error::out_of_range(format!(
                "volume must be 0..=100, got {}",
                self.volume
            )));
        }
        Ok(())
    }
}

/// Player object in `server/command`.
///
/// The server only issues commands the client declared in
/// `supported_commands`; the client echoes the result in its next
/// `client/state`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PlayerCommandPayload {
    /// `volume` or `mute`.
    pub command: PlayerCommand,
    /// Set iff `command` is `volume`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u8>,
    /// Set iff `command` is `mute`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mute: Option<bool>,
}

impl PlayerCommandPayload {
    /// Builds a volume command.
    #[must_use]
    pub fn volume(volume: u8) -> Self {
        Self {
            command: PlayerCommand::Volume,
            volume: Some(volume),
            mute: None,
        }
    }

    /// Builds a mute command.
    #[must_use]
    pub fn mute(mute: bool) -> Self {
        Self {
            command: PlayerCommand::Mute,
            volume: None,
            mute: Some(mute),
        }
    }

    /// Checks command/argument consistency.
    ///
    /// # Errors
    ///
    /// Returns `PayloadRange` when the argument for the named command is
    /// missing, out of range, or a foreign argument is present.
    pub fn validate(&self) -> Result<()> {
        match self.command {
            PlayerCommand::Volume => {
                let volume = self
                    .volume
                    .ok_or_else(|| Error::out_of_range("volume command without volume"))?;
                if volume > 100 {
                    return Err(Error::out_of_range(format!(
                        "volume must be 0..=100, got {volume}"
                    )));
                }
                if self.mute.is_some() {
                    return Err(Error::out_of_range("volume command carries mute"));
                }
            }
            PlayerCommand::Mute => {
                if self.mute.is_none() {
                    return Err(Error::out_of_range("mute command without mute"));
                }
                if self.volume.is_some() {
                    return Err(Error::out_of_range("mute command carries volume"));
                }
            }
        }
        Ok(())
    }
}

/// Player object in `stream/request-format`: every field optional, merged
/// over the session's current format.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct FormatRequest {
    /// Requested codec.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codec: Option<AudioCodec>,
    /// Requested sample rate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    /// Requested channel count.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    /// Requested bit depth.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bit_depth: Option<u8>,
}

impl FormatRequest {
    /// Merges this request over `base`, yielding the full target format.
    #[must_use]
    pub fn merge_over(&self, base: AudioFormat) -> AudioFormat {
        AudioFormat {
            codec: self.codec.unwrap_or(base.codec),
            channels: self.channels.unwrap_or(base.channels),
            sample_rate: self.sample_rate.unwrap_or(base.sample_rate),
            bit_depth: self.bit_depth.unwrap_or(base.bit_depth),
        }
    }
}

/// Player object in `stream/start`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StreamStartPlayer {
    /// Codec in effect.
    pub codec: AudioCodec,
    /// Sample rate in effect.
    pub sample_rate: u32,
    /// Channel count in effect.
    pub channels: u8,
    /// Bit depth in effect.
    pub bit_depth: u8,
    /// Base64 codec header, when the codec needs one (FLAC).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codec_header: Option<String>,
}

/// Player object in `stream/update`: the delta between the previous and
/// the next format.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct StreamUpdatePlayer {
    /// New codec, if changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codec: Option<AudioCodec>,
    /// New sample rate, if changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    /// New channel count, if changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    /// New bit depth, if changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bit_depth: Option<u8>,
    /// New codec header, if the new codec needs one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codec_header: Option<String>,
}

impl StreamUpdatePlayer {
    /// Builds the delta taking `from` to `to`; `None` when they are equal.
    #[must_use]
    pub fn diff(from: AudioFormat, to: AudioFormat, codec_header: Option<String>) -> Option<Self> {
        if from == to {
            return None;
        }
        Some(Self {
            codec: (from.codec != to.codec).then_some(to.codec),
            sample_rate: (from.sample_rate != to.sample_rate).then_some(to.sample_rate),
            channels: (from.channels != to.channels).then_some(to.channels),
            bit_depth: (from.bit_depth != to.bit_depth).then_some(to.bit_depth),
            codec_header,
        })
    }
}
