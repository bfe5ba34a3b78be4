//! Payload objects for the `metadata` role.
//!
//! Metadata fan-out is delta-based: every `server/state.metadata` carries
//! only the fields that changed since the last update sent to that
//! endpoint, using the [`Field`] trichotomy. The `timestamp` is always
//! present so receivers can extrapolate `track_progress`.

use serde::{Deserialize, Serialize};

use super::field::Field;
use super::types::RepeatMode;

/// Metadata object in `server/state`.
///
/// Thirteen fields: the always-present `timestamp` plus twelve
/// delta-tracked fields.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataUpdate {
    /// Server clock µs at which this metadata is valid.
    pub timestamp: i64,
    /// Title of the current media.
    #[serde(default, skip_serializing_if = "Field::is_undefined")]
    pub title: Field<String>,
    /// Artist of the current media.
    #[serde(default, skip_serializing_if = "Field::is_undefined")]
    pub artist: Field<String>,
    /// Album artist of the current media.
    #[serde(default, skip_serializing_if = "Field::is_undefined")]
    pub album_artist: Field<String>,
    /// Album of the current media.
    #[serde(default, skip_serializing_if = "Field::is_undefined")]
    pub album: Field<String>,
    /// Artwork URL, for metadata clients that fetch their own images.
    #[serde(default, skip_serializing_if = "Field::is_undefined")]
    pub artwork_url: Field<String>,
    /// Release year.
    #[serde(default, skip_serializing_if = "Field::is_undefined")]
    pub year: Field<i32>,
    /// Track number.
    #[serde(default, skip_serializing_if = "Field::is_undefined")]
    pub track: Field<u32>,
    /// Progress into the track in milliseconds, valid at `timestamp`.
    #[serde(default, skip_serializing_if = "Field::is_undefined")]
    pub track_progress: Field<u64>,
    /// Track duration in milliseconds.
    #[serde(default, skip_serializing_if = "Field::is_undefined")]
    pub track_duration: Field<u64>,
    /// Playback speed multiplier × 1000 (1000 = normal).
    #[serde(default, skip_serializing_if = "Field::is_undefined")]
    pub playback_speed: Field<u32>,
    /// Repeat mode.
    #[serde(default, skip_serializing_if = "Field::is_undefined")]
    pub repeat: Field<RepeatMode>,
    /// Shuffle state.
    #[serde(default, skip_serializing_if = "Field::is_undefined")]
    pub shuffle: Field<bool>,
}

/// Server-side metadata for the current media, diffed per endpoint before
/// fan-out.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Metadata {
    /// Title of the current media.
    pub title: Option<String>,
    /// Artist of the current media.
    pub artist: Option<String>,
    /// Album artist of the current media.
    pub album_artist: Option<String>,
    /// Album of the current media.
    pub album: Option<String>,
    /// Artwork URL of the current media.
    pub artwork_url: Option<String>,
    /// Release year.
    pub year: Option<i32>,
    /// Track number.
    pub track: Option<u32>,
    /// Track progress in milliseconds at the last update.
    pub track_progress: Option<u64>,
    /// Track duration in milliseconds.
    pub track_duration: Option<u64>,
    /// Playback speed multiplier × 1000.
    pub playback_speed: Option<u32>,
    /// Current repeat mode.
    pub repeat: Option<RepeatMode>,
    /// Whether shuffle is enabled.
    pub shuffle: Option<bool>,
}

/// Diffs one field against the last-sent snapshot.
fn diff_field<T: Clone + PartialEq>(last: Option<&Option<T>>, current: &Option<T>) -> Field<T> {
    match last {
        Some(previous) if previous == current => Field::Undefined,
        _ => Field::from(current.clone()),
    }
}

impl Metadata {
    /// Builds an update containing only fields changed since `last`.
    ///
    /// `track_progress` is restamped on every update whenever it is set,
    /// because receivers extrapolate progress from `timestamp`.
    #[must_use]
    pub fn diff_update(&self, last: Option<&Metadata>, timestamp: i64) -> MetadataUpdate {
        let mut update = MetadataUpdate {
            timestamp,
            title: diff_field(last.map(|l| &l.title), &self.title),
            artist: diff_field(last.map(|l| &l.artist), &self.artist),
            album_artist: diff_field(last.map(|l| &l.album_artist), &self.album_artist),
            album: diff_field(last.map(|l| &l.album), &self.album),
            artwork_url: diff_field(last.map(|l| &l.artwork_url), &self.artwork_url),
            year: diff_field(last.map(|l| &l.year), &self.year),
            track: diff_field(last.map(|l| &l.track), &self.track),
            track_progress: Field::Undefined,
            track_duration: diff_field(last.map(|l| &l.track_duration), &self.track_duration),
            playback_speed: diff_field(last.map(|l| &l.playback_speed), &self.playback_speed),
            repeat: diff_field(last.map(|l| &l.repeat), &self.repeat),
            shuffle: diff_field(last.map(|l| &l.shuffle), &self.shuffle),
        };
        if let Some(progress) = self.track_progress {
            update.track_progress = Field::Value(progress);
        }
        update
    }

    /// Builds an update that clears every field.
    #[must_use]
    pub fn cleared_update(timestamp: i64) -> MetadataUpdate {
        MetadataUpdate {
            timestamp,
            title: Field::Null,
            artist: Field::Null,
            album_artist: Field::Null,
            album: Field::Null,
            artwork_url: Field::Null,
            year: Field::Null,
            track: Field::Null,
            track_progress: Field::Null,
            track_duration: Field::Null,
            playback_speed: Field::Null,
            repeat: Field::Null,
            shuffle: Field::Null,
        }
    }

    /// Builds an update carrying every current value, for newly joined
    /// metadata clients.
    #[must_use]
    pub fn snapshot_update(&self, timestamp: i64) -> MetadataUpdate {
        MetadataUpdate {
            timestamp,
            title: Field::from(self.title.clone()),
            artist: Field::from(self.artist.clone()),
            album_artist: Field::from(self.album_artist.clone()),
            album: Field::from(self.album.clone()),
            artwork_url: Field::from(self.artwork_url.clone()),
            year: Field::from(self.year),
            track: Field::from(self.track),
            track_progress: Field::from(self.track_progress),
            track_duration: Field::from(self.track_duration),
            playback_speed: Field::from(self.playback_speed),
            repeat: Field::from(self.repeat),
            shuffle: Field::from(self.shuffle),
        }
    }

    /// Applies a received update to accumulated state (client side).
    pub fn apply(&mut self, update: MetadataUpdate) {
        update.title.merge_into(&mut self.title);
        update.artist.merge_into(&mut self.artist);
        update.album_artist.merge_into(&mut self.album_artist);
        update.album.merge_into(&mut self.album);
        update.artwork_url.merge_into(&mut self.artwork_url);
        update.year.merge_into(&mut self.year);
        update.track.merge_into(&mut self.track);
        update.track_progress.merge_into(&mut self.track_progress);
        update.track_duration.merge_into(&mut self.track_duration);
        update.playback_speed.merge_into(&mut self.playback_speed);
        update.repeat.merge_into(&mut self.repeat);
        update.shuffle.merge_into(&mut self.shuffle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_sends_only_changes() {
        let last = Metadata {
            title: Some("Song A".into()),
            artist: Some("Band".into()),
            ..Metadata::default()
        };
        let current = Metadata {
            title: Some("Song B".into()),
            artist: Some("Band".into()),
            ..Metadata::default()
        };

        let update = current.diff_update(Some(&last), 42);
        assert_eq!(update.timestamp, 42);
        assert_eq!(update.title, Field::Value("Song B".into()));
        assert_eq!(update.artist, Field::Undefined);
    }

    #[test]
    fn progress_is_always_restamped() {
        let current = Metadata {
            track_progress: Some(12_000),
            ..Metadata::default()
        };
        let update = current.diff_update(Some(&current.clone()), 7);
        assert_eq!(update.track_progress, Field::Value(12_000));
    }

    #[test]
    fn first_update_sends_full_state() {
        let current = Metadata {
            title: Some("Song".into()),
            year: Some(2020),
            ..Metadata::default()
        };
        let update = current.diff_update(None, 0);
        assert_eq!(update.title, Field::Value("Song".into()));
        assert_eq!(update.year, Field::Value(2020));
        // Unset fields are sent as explicit clears on the first update.
        assert_eq!(update.album, Field::Null);
    }

    #[test]
    fn apply_round_trips_through_the_wire() {
        let server = Metadata {
            title: Some("Song".into()),
            shuffle: Some(true),
            ..Metadata::default()
        };
        let wire = serde_json::to_string(&server.snapshot_update(1)).unwrap();
        let update: MetadataUpdate = serde_json::from_str(&wire).unwrap();

        let mut client = Metadata {
            album: Some("stale".into()),
            ..Metadata::default()
        };
        client.apply(update);
        assert_eq!(client.title.as_deref(), Some("Song"));
        assert_eq!(client.shuffle, Some(true));
        assert_eq!(client.album, None);
    }
}
