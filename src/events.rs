//! Events emitted by the engine towards the embedding application.

use crate::endpoint::CloseReason;

/// Lifecycle and state events observable by the application.
///
/// Delivered over an unbounded channel; each event fires exactly once
/// per occurrence, including `PeerDisconnected` under concurrent closes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// A peer completed its handshake.
    PeerConnected {
        /// The peer's declared client id.
        client_id: String,
    },

    /// A peer's endpoint reached its terminal state.
    PeerDisconnected {
        /// The peer's declared client id, if the handshake completed.
        client_id: Option<String>,
        /// Why the endpoint closed.
        reason: CloseReason,
    },

    /// A group's playback state, membership or volume changed.
    GroupChanged {
        /// Group identifier.
        group_id: String,
    },

    /// A stream started for a group.
    StreamStarted {
        /// Group identifier.
        group_id: String,
    },

    /// A stream ended for a group.
    StreamEnded {
        /// Group identifier.
        group_id: String,
    },
}
