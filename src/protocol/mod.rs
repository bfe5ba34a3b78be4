//! Wire types and codecs for the Resonate protocol.
//!
//! Two envelopes travel over one WebSocket:
//!
//! * **Text** - JSON `{ "type": <string>, "payload": <object|absent> }`,
//!   modelled by [`messages::ClientMessage`] and [`messages::ServerMessage`]
//!   which convert through an untyped wire envelope.
//! * **Binary** - a one-byte type (role and slot bits), an `i64` big-endian
//!   server-clock timestamp in microseconds, and the payload; see
//!   [`binary::Frame`].
//!
//! # Submodules
//!
//! * [`types`] - string-wire enums shared across payloads
//! * [`field`] - the absent/null/present field trichotomy
//! * [`messages`] - typed text envelopes
//! * [`binary`] - binary frame layout
//! * [`player`], [`artwork`], [`metadata`], [`controller`], [`visualizer`] -
//!   role-specific payload objects

pub mod artwork;
pub mod binary;
pub mod controller;
pub mod field;
pub mod messages;
pub mod metadata;
pub mod player;
pub mod types;
pub mod visualizer;

use std::fmt::Debug;

use serde::Deserialize;

use crate::error::Result;

/// Current protocol version spoken by this crate.
pub const VERSION: u32 = 1;

/// Parses and logs a JSON payload.
///
/// # Errors
///
/// Returns `MalformedFrame` if the body is not valid JSON or does not
/// match `T`. The raw text is logged at TRACE level on failure so wire
/// problems can be diagnosed without a packet capture.
pub fn json<T>(body: &str, origin: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Debug,
{
    match serde_json::from_str(body) {
        Ok(result) => {
            trace!("{origin}: {result:?}");
            Ok(result)
        }
        Err(e) => {
            warn!("{origin}: failed parsing message ({e})");
            trace!("{body}");
            Err(e.into())
        }
    }
}
