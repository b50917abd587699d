mod audio;
mod controller;
mod silent;

use crate::recommend::Song;
use futures::future::BoxFuture;

pub use audio::{RodioAudioBackend, RodioTrack};
#[cfg(feature = "playback-device-enum")]
pub use audio::enumerate_output_device_names;
pub use controller::{PlaybackController, PlaybackState, TrackEvent};
pub use silent::{SilentAudioBackend, SilentTrack};

#[derive(thiserror::Error, Debug)]
pub enum PlaybackError {
    #[error("audio output unavailable: {details}")]
    AudioOutputUnavailable { details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("track has no source")]
    NoSource,

    #[error("failed to load {url}: {details}")]
    Load { url: String, details: String },

    #[error("failed to decode {url}: {details}")]
    Decode { url: String, details: String },
}

/// One playable audio resource, owned by the [`PlaybackController`].
pub trait AudioTrack: Send {
    /// Points the track at `url`, discarding anything loaded before.
    fn set_source(&mut self, url: &str);

    fn source(&self) -> Option<&str>;

    /// Starts or resumes playback.
    fn play(&mut self) -> BoxFuture<'_, Result<(), PlaybackError>>;

    fn pause(&mut self);

    /// Stops playback and clears the source.
    fn release(&mut self);

    /// Whether the track is audible right now.
    fn is_playing(&self) -> bool;
}

pub trait AudioBackend: Send + Sync {
    type Track: AudioTrack;

    /// Allocates a track whose source is `song.audio`.
    fn create_track(&self, song: &Song) -> Result<Self::Track, PlaybackError>;
}
