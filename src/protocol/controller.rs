//! Payload objects for the `controller` role.

use serde::{Deserialize, Serialize};

use super::types::{MediaCommand, PlaybackState};
use crate::error::{Error, Result};

/// Controller object in `client/command`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ControllerCommand {
    /// One of the values the server listed in `supported_commands`.
    pub command: MediaCommand,
    /// Set iff `command` is `volume`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u8>,
    /// Set iff `command` is `mute`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mute: Option<bool>,
}

impl ControllerCommand {
    /// Builds an argument-less command.
    #[must_use]
    pub fn simple(command: MediaCommand) -> Self {
        Self {
            command,
            volume: None,
            mute: None,
        }
    }

    /// Builds a group volume command.
    #[must_use]
    pub fn volume(volume: u8) -> Self {
        Self {
            command: MediaCommand::Volume,
            volume: Some(volume),
            mute: None,
        }
    }

    /// Builds a group mute command.
    #[must_use]
    pub fn mute(mute: bool) -> Self {
        Self {
            command: MediaCommand::Mute,
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
        if self.command == MediaCommand::Volume {
            let volume = self
                .volume
                .ok_or_else(|| Error::out_of_range("volume command without volume"))?;
            if volume > 100 {
                return Err(Error::out_of_range(format!(
                    "volume must be 0..=100, got {volume}"
                )));
            }
        } else if self.volume.is_some() {
            return Err(Error::out_of_range(format!(
                "volume not valid for command '{}'",
                self.command
            )));
        }

        if self.command == MediaCommand::Mute {
            if self.mute.is_none() {
                return Err(Error::out_of_range("mute command without mute"));
            }
        } else if self.mute.is_some() {
            return Err(Error::out_of_range(format!(
                "mute not valid for command '{}'",
                self.command
            )));
        }
        Ok(())
    }
}

/// Controller object in `server/state`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ControllerState {
    /// Commands currently serviceable for this group.
    pub supported_commands: Vec<MediaCommand>,
    /// Group volume, 0..=100.
    pub volume: u8,
    /// Group mute state.
    pub muted: bool,
}

impl ControllerState {
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

/// `group/update` payload. All fields are optional deltas in the
/// absent-means-retain sense; the engine never sends `null` here because
/// a group always has a state, an id and a name.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct GroupUpdate {
    /// Playback state of the group.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playback_state: Option<PlaybackState>,
    /// Group identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// Friendly name of the group.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_enforces_argument_pairing() {
        assert!(ControllerCommand::simple(MediaCommand::Play).validate().is_ok());
        assert!(ControllerCommand::volume(100).validate().is_ok());
        assert!(ControllerCommand::volume(101).validate().is_err());

        let stray = ControllerCommand {
            command: MediaCommand::Play,
            volume: Some(10),
            mute: None,
        };
        assert!(stray.validate().is_err());
    }

    #[test]
    fn group_update_omits_unset_fields() {
        let update = GroupUpdate {
            playback_state: Some(PlaybackState::Paused),
            ..GroupUpdate::default()
        };
        assert_eq!(
            serde_json::to_string(&update).unwrap(),
            r#"{"playback_state":"paused"}"#
        );
    }
}
