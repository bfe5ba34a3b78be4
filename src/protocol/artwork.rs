//! Payload objects for the `artwork` role.
//!
//! An artwork client declares one to four channels, each with a source
//! (album, artist, or disabled) and an image format plus maximum
//! dimensions. Image transcoding and scaling happen outside this crate;
//! the engine negotiates configurations and schedules frames.

use serde::{Deserialize, Serialize};

use super::types::{ArtworkSource, PictureFormat};
use crate::error::{Error, Result};

/// Maximum number of artwork channels per client.
pub const MAX_CHANNELS: usize = 4;

/// One channel in the `client/hello` artwork support block.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChannelSupport {
    /// What this channel displays.
    pub source: ArtworkSource,
    /// Image format the client accepts.
    pub format: PictureFormat,
    /// Maximum width in pixels.
    pub media_width: u32,
    /// Maximum height in pixels.
    pub media_height: u32,
}

/// Artwork support block of `client/hello`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ArtworkSupport {
    /// Declared channels; the array index is the channel number.
    pub channels: Vec<ChannelSupport>,
}

impl ArtworkSupport {
    /// Validates channel count and dimensions.
    ///
    /// # Errors
    ///
    /// Returns `PayloadRange` for zero or more than four channels, or for
    /// zero-sized dimensions.
    pub fn validate(&self) -> Result<()> {
        if self.channels.is_empty() || self.channels.len() > MAX_CHANNELS {
            return Err(Error::out_of_range(format!(
                "artwork channels must number 1..=4, got {}",
                self.channels.len()
            )));
        }
        for channel in &self.channels {
            if channel.media_width == 0 || channel.media_height == 0 {
                return Err(Error::out_of_range("artwork dimensions must be positive"));
            }
        }
        Ok(())
    }
}

/// One channel configuration in `stream/start`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// What this channel displays.
    pub source: ArtworkSource,
    /// Format of the encoded image.
    pub format: PictureFormat,
    /// Width in pixels of the encoded image.
    pub width: u32,
    /// Height in pixels of the encoded image.
    pub height: u32,
}

/// One channel delta in `stream/update`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfigUpdate {
    /// New source, if changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ArtworkSource>,
    /// New format, if changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<PictureFormat>,
    /// New width, if changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    /// New height, if changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

impl ChannelConfigUpdate {
    /// `true` when the delta carries no change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Artwork object in `stream/start`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StreamStartArtwork {
    /// Active channel configurations; the array index is the channel
    /// number.
    pub channels: Vec<ChannelConfig>,
}

/// Artwork object in `stream/update`.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct StreamUpdateArtwork {
    /// Per-channel deltas, index-aligned with the channel numbers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<Vec<ChannelConfigUpdate>>,
}

/// Artwork object in `stream/request-format`: a client asking to
/// reconfigure one of its channels.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ArtworkFormatRequest {
    /// Channel number, 0..=3, per the `client/hello` declaration order.
    pub channel: u8,
    /// Requested source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ArtworkSource>,
    /// Requested format.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<PictureFormat>,
    /// Requested maximum width.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_width: Option<u32>,
    /// Requested maximum height.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_height: Option<u32>,
}

impl ArtworkFormatRequest {
    /// Validates the channel index.
    ///
    /// # Errors
    ///
    /// Returns `PayloadRange` for a channel outside 0..=3.
    pub fn validate(&self) -> Result<()> {
        if usize::from(self.channel) >= MAX_CHANNELS {
            return Err(Error::out_of_range(format!(
                "artwork channel must be 0..=3, got {}",
                self.channel
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn support_bounds_channel_count() {
        let channel = ChannelSupport {
            source: ArtworkSource::Album,
            format: PictureFormat::Jpeg,
            media_width: 320,
            media_height: 320,
        };
        assert!(ArtworkSupport { channels: vec![] }.validate().is_err());
        assert!(ArtworkSupport {
            channels: vec![channel; 5]
        }
        .validate()
        .is_err());
        assert!(ArtworkSupport {
            channels: vec![channel]
        }
        .validate()
        .is_ok());
    }

    #[test]
    fn request_rejects_out_of_range_channel() {
        let request = ArtworkFormatRequest {
            channel: 4,
            source: None,
            format: None,
            media_width: None,
            media_height: None,
        };
        assert!(request.validate().is_err());
    }
}
