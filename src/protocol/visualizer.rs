//! Payload objects for the `visualizer` role.
//!
//! Visualizer clients receive audio feature frames on binary slot 0 of
//! the visualizer role and pace them against a declared buffer capacity,
//! like players do for audio.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Visualizer support block of `client/hello`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct VisualizerSupport {
    /// Max bytes of yet-to-be-rendered feature frames the client buffers.
    pub buffer_capacity: u64,
}

impl VisualizerSupport {
    /// Validates the buffer capacity.
    ///
    /// # Errors
    ///
    /// Returns `PayloadRange` for a zero capacity.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_capacity == 0 {
            return Err(Error::out_of_range("buffer_capacity must be positive"));
        }
        Ok(())
    }
}

/// Visualizer object in `stream/start`: echoes the negotiated capacity.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StreamStartVisualizer {
    /// Buffer capacity the scheduler paces against.
    pub buffer_capacity: u64,
}

/// Visualizer object in `stream/update`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct StreamUpdateVisualizer {
    /// New buffer capacity, if renegotiated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffer_capacity: Option<u64>,
}
