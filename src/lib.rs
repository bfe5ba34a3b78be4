//! Protocol engine for Resonate synchronized multi-room audio.
//!
//! A Resonate server renders per-client audio streams and coordinates
//! playback; clients play audio, show metadata or artwork, visualize, or
//! control their group. This crate implements the engine shared by both
//! endpoints of a connection:
//!
//! * [`endpoint`] - connection lifecycle: handshake, framed I/O, ordered
//!   shutdown, and the keyed reconnect driver in [`reconnect`]
//! * [`clock`] - the filter translating between server and client
//!   monotonic clocks
//! * [`stream`] - the per-client encoder/scheduler producing timestamped
//!   binary frames
//! * [`group`] - membership, playback state and role-gated fan-out
//! * [`protocol`] - text and binary wire codecs
//! * [`discovery`] - mDNS glue feeding the reconnect driver
//!
//! Transport is WebSocket; codec implementations, image transcoding and
//! the audio source itself are external collaborators behind traits.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]

#[macro_use]
extern crate log;

pub mod client;
pub mod clock;
pub mod config;
pub mod discovery;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod group;
pub mod protocol;
pub mod reconnect;
pub mod server;
pub mod stream;
