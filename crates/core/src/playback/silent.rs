use crate::playback::{AudioBackend, AudioTrack, PlaybackError};
use crate::recommend::Song;
use futures::future::BoxFuture;
use futures::FutureExt;

/// Backend that tracks play/pause state without producing sound. Used for
/// headless runs (`--mute`) and wherever no output device exists.
#[derive(Clone, Debug, Default)]
pub struct SilentAudioBackend;

impl SilentAudioBackend {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SilentTrack {
    source: Option<String>,
    playing: bool,
}

impl AudioTrack for SilentTrack {
    fn set_source(&mut self, url: &str) {
        self.playing = false;
        self.source = Some(url.to_owned());
    }

    fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    fn play(&mut self) -> BoxFuture<'_, Result<(), PlaybackError>> {
        async move {
            match self.source.as_deref() {
                Some(url) if !url.is_empty() => {
                    self.playing = true;
                    Ok(())
                }
                _ => Err(PlaybackError::NoSource),
            }
        }
        .boxed()
    }

    fn pause(&mut self) {
        self.playing = false;
    }

    fn release(&mut self) {
        self.playing = false;
        self.source = None;
    }

    fn is_playing(&self) -> bool {
        self.playing
    }
}

impl AudioBackend for SilentAudioBackend {
    type Track = SilentTrack;

    fn create_track(&self, song: &Song) -> Result<SilentTrack, PlaybackError> {
        Ok(SilentTrack {
            source: Some(song.audio.clone()),
            playing: false,
        })
    }
}
