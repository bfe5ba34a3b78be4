//! Binary frame layout.
//!
//! One frame per WebSocket binary message:
//!
//! ```text
//! byte 0       u8   message type (role in bits 7..2, slot in bits 1..0)
//! bytes 1..9   i64  big-endian server-clock microseconds (present time)
//! bytes 9..    payload
//! ```
//!
//! The timestamp is decoded as signed even though current use is
//! non-negative; encoders refuse to produce negative values. An empty
//! payload on an artwork slot clears the channel.

use std::fmt;

use crate::error::{Error, Result};

/// Header length: type byte plus timestamp.
pub const HEADER_LEN: usize = 9;

/// Role bits (7..2) for player frames.
const ROLE_PLAYER: u8 = 0;
/// Role bits for artwork frames.
const ROLE_ARTWORK: u8 = 1;
/// Role bits for visualizer frames.
const ROLE_VISUALIZER: u8 = 2;

/// Typed view of the binary message-type byte.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum FrameKind {
    /// Encoded audio chunk (player role, slot 0).
    AudioChunk,

    /// Artwork image on one of four channels (artwork role, slots 0..=3).
    ArtworkChannel(u8),

    /// Audio feature frame (visualizer role, slot 0).
    VisualizerData,
}

impl FrameKind {
    /// The wire byte for this kind.
    #[must_use]
    pub fn type_byte(self) -> u8 {
        match self {
            FrameKind::AudioChunk => ROLE_PLAYER << 2,
            FrameKind::ArtworkChannel(channel) => (ROLE_ARTWORK << 2) | (channel & 0b11),
            FrameKind::VisualizerData => ROLE_VISUALIZER << 2,
        }
    }

    /// Parses a wire byte.
    ///
    /// # Errors
    ///
    /// Returns `UnknownMessageType` for bytes outside the catalogued
    /// role/slot combinations.
    pub fn from_type_byte(byte: u8) -> Result<Self> {
        let role = byte >> 2;
        let slot = byte & 0b11;
        match (role, slot) {
            (ROLE_PLAYER, 0) => Ok(FrameKind::AudioChunk),
            (ROLE_ARTWORK, channel) => Ok(FrameKind::ArtworkChannel(channel)),
            (ROLE_VISUALIZER, 0) => Ok(FrameKind::VisualizerData),
            _ => Err(Error::unknown_type(format!(
                "unknown binary message type {byte:#04x}"
            ))),
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameKind::AudioChunk => write!(f, "audio"),
            FrameKind::ArtworkChannel(channel) => write!(f, "artwork[{channel}]"),
            FrameKind::VisualizerData => write!(f, "visualizer"),
        }
    }
}

/// One decoded binary frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    /// Role and slot of this frame.
    pub kind: FrameKind,

    /// Server-clock microseconds at which the payload takes effect.
    pub present_time: i64,

    /// Role-specific payload. Empty on an artwork slot means "clear".
    pub payload: Vec<u8>,
}

impl Frame {
    /// Builds a frame, rejecting negative present times.
    ///
    /// # Errors
    ///
    /// Returns `PayloadRange` if `present_time` is negative.
    pub fn new(kind: FrameKind, present_time: i64, payload: Vec<u8>) -> Result<Self> {
        if present_time < 0 {
            return Err(Error::out_of_range(format!(
                "present time must be non-negative, got {present_time}"
            )));
        }
        Ok(Self {
            kind,
            present_time,
            payload,
        })
    }

    /// Encodes the frame into its wire bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.push(self.kind.type_byte());
        buf.extend_from_slice(&self.present_time.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decodes a frame from wire bytes.
    ///
    /// # Errors
    ///
    /// Returns `MalformedFrame` for frames shorter than the header and
    /// `UnknownMessageType` for an uncatalogued type byte.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::malformed(format!(
                "binary frame of {} bytes is shorter than the {HEADER_LEN}-byte header",
                bytes.len()
            )));
        }
        let kind = FrameKind::from_type_byte(bytes[0])?;
        let timestamp: [u8; 8] = bytes[1..HEADER_LEN]
            .try_into()
            .map_err(|_| Error::malformed("timestamp slice"))?;
        Ok(Self {
            kind,
            present_time: i64::from_be_bytes(timestamp),
            payload: bytes[HEADER_LEN..].to_vec(),
        })
    }

    /// `true` for an artwork frame with no payload, which clears its
    /// channel.
    #[must_use]
    pub fn clears_artwork(&self) -> bool {
        matches!(self.kind, FrameKind::ArtworkChannel(_)) && self.payload.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_layout_encodes_exactly() {
        let frame = Frame::new(FrameKind::AudioChunk, 1_234_567_890, vec![0xAA, 0xBB]).unwrap();
        assert_eq!(
            frame.encode(),
            vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x49, 0x96, 0x02, 0xD2, 0xAA, 0xBB]
        );
    }

    #[test]
    fn round_trip_is_identity() {
        for kind in [
            FrameKind::AudioChunk,
            FrameKind::ArtworkChannel(0),
            FrameKind::ArtworkChannel(3),
            FrameKind::VisualizerData,
        ] {
            let frame = Frame::new(kind, 77, vec![1, 2, 3]).unwrap();
            assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
        }
    }

    #[test]
    fn timestamp_decodes_as_signed() {
        let mut bytes = vec![0u8];
        bytes.extend_from_slice(&(-1i64).to_be_bytes());
        let frame = Frame::decode(&bytes).unwrap();
        assert_eq!(frame.present_time, -1);
    }

    #[test]
    fn negative_present_time_is_rejected_on_encode() {
        assert!(Frame::new(FrameKind::AudioChunk, -1, vec![]).is_err());
    }

    #[test]
    fn short_frames_are_malformed() {
        let err = Frame::decode(&[0; 8]).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::MalformedFrame);
    }

    #[test]
    fn unknown_type_bytes_are_rejected() {
        let mut bytes = vec![0xFF];
        bytes.extend_from_slice(&0i64.to_be_bytes());
        let err = Frame::decode(&bytes).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::UnknownMessageType);
    }

    #[test]
    fn empty_artwork_payload_clears() {
        let clear = Frame::new(FrameKind::ArtworkChannel(1), 5, vec![]).unwrap();
        assert!(clear.clears_artwork());
        let audio = Frame::new(FrameKind::AudioChunk, 5, vec![]).unwrap();
        assert!(!audio.clears_artwork());
    }
}
