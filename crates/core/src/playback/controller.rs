use crate::playback::{AudioBackend, AudioTrack, PlaybackError};
use crate::recommend::{Song, SongKey};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum PlaybackState {
    #[default]
    Idle,
    Playing(SongKey),
    Paused(SongKey),
}

impl PlaybackState {
    /// Key of the song that is playing or paused.
    pub fn current(&self) -> Option<&SongKey> {
        match self {
            PlaybackState::Idle => None,
            PlaybackState::Playing(key) | PlaybackState::Paused(key) => Some(key),
        }
    }

    pub fn is_playing(&self, key: &SongKey) -> bool {
        matches!(self, PlaybackState::Playing(k) if k == key)
    }
}

/// What the audio layer reports about a track on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackEvent {
    Played,
    Paused,
    Ended,
}

enum Step {
    Pause,
    Resume,
    Start { interrupted: Option<SongKey> },
}

/// Owns one audio track per song and keeps at most one of them audible.
pub struct PlaybackController<B: AudioBackend> {
    backend: B,
    tracks: HashMap<SongKey, B::Track>,
    state: PlaybackState,
}

impl<B: AudioBackend> PlaybackController<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            tracks: HashMap::new(),
            state: PlaybackState::Idle,
        }
    }

    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_audible(&self, key: &SongKey) -> bool {
        self.tracks.get(key).is_some_and(|t| t.is_playing())
    }

    pub fn audible_count(&self) -> usize {
        self.tracks.values().filter(|t| t.is_playing()).count()
    }

    /// Plays `song`, or pauses it if it is the one playing. Any other
    /// playing track is paused first. On error the previous state is kept.
    pub async fn toggle(&mut self, song: &Song) -> Result<&PlaybackState, PlaybackError> {
        let key = song.key();
        let step = match &self.state {
            PlaybackState::Playing(k) if *k == key => Step::Pause,
            PlaybackState::Paused(k) if *k == key && self.tracks.contains_key(k) => Step::Resume,
            PlaybackState::Playing(k) => Step::Start {
                interrupted: Some(k.clone()),
            },
            _ => Step::Start { interrupted: None },
        };

        match step {
            Step::Pause => {
                if let Some(track) = self.tracks.get_mut(&key) {
                    track.pause();
                }
                tracing::debug!(%key, "paused");
                self.state = PlaybackState::Paused(key);
            }
            Step::Resume => {
                if let Some(track) = self.tracks.get_mut(&key) {
                    track.play().await?;
                }
                tracing::debug!(%key, "resumed");
                self.state = PlaybackState::Playing(key);
            }
            Step::Start { interrupted } => {
                if let Some(prev) = &interrupted {
                    if let Some(track) = self.tracks.get_mut(prev) {
                        track.pause();
                    }
                }
                match self.start_track(song).await {
                    Ok(()) => {
                        tracing::info!(%key, title = %song.display_title(), "playing");
                        self.state = PlaybackState::Playing(key);
                    }
                    Err(e) => {
                        tracing::warn!(%key, error = %e, "failed to start track");
                        if let Some(prev) = interrupted {
                            self.restore(prev).await;
                        }
                        return Err(e);
                    }
                }
            }
        }
        Ok(&self.state)
    }

    async fn start_track(&mut self, song: &Song) -> Result<(), PlaybackError> {
        let track = match self.tracks.entry(song.key()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(self.backend.create_track(song)?),
        };
        if track.source() != Some(song.audio.as_str()) {
            track.set_source(&song.audio);
        }
        let result = track.play().await;
        if result.is_err() {
            track.pause();
        }
        result
    }

    /// Resumes a track that was paused to make room for one that failed.
    async fn restore(&mut self, key: SongKey) {
        let Some(track) = self.tracks.get_mut(&key) else {
            self.state = PlaybackState::Idle;
            return;
        };
        match track.play().await {
            Ok(()) => self.state = PlaybackState::Playing(key),
            Err(e) => {
                tracing::warn!(%key, error = %e, "could not resume previous track");
                self.state = PlaybackState::Paused(key);
            }
        }
    }

    /// Applies a report from the audio layer. Unknown keys are ignored.
    pub fn observe(&mut self, key: &SongKey, event: TrackEvent) {
        if !self.tracks.contains_key(key) {
            tracing::trace!(%key, ?event, "event for unknown track");
            return;
        }
        match event {
            TrackEvent::Played => {
                if let PlaybackState::Playing(current) = &self.state {
                    if current != key {
                        if let Some(track) = self.tracks.get_mut(current) {
                            track.pause();
                        }
                        tracing::debug!(paused = %current, playing = %key, "another track started");
                    }
                }
                self.state = PlaybackState::Playing(key.clone());
            }
            TrackEvent::Paused | TrackEvent::Ended => {
                if self.state.current() == Some(key) {
                    self.state = PlaybackState::Paused(key.clone());
                }
            }
        }
    }

    /// Syncs the state with what every track actually does.
    pub fn reconcile(&mut self) {
        let mut started = Vec::new();
        let mut stopped = None;
        for (key, track) in &self.tracks {
            let playing = track.is_playing();
            let tracked = self.state.is_playing(key);
            if playing && !tracked {
                started.push(key.clone());
            } else if !playing && tracked {
                stopped = Some(key.clone());
            }
        }
        if let Some(key) = stopped {
            self.observe(&key, TrackEvent::Ended);
        }
        // Stable order so the surviving track does not depend on hashing.
        started.sort();
        for key in started {
            self.observe(&key, TrackEvent::Played);
        }
    }

    /// Makes the registry match `songs`: tracks for absent keys are
    /// released, present ones reused, new ones allocated.
    pub fn replace_playlist(&mut self, songs: &[Song]) {
        let wanted: HashSet<SongKey> = songs.iter().map(Song::key).collect();

        let current = self.state.current().cloned();
        let mut released = 0usize;
        self.tracks.retain(|key, track| {
            if wanted.contains(key) {
                return true;
            }
            track.release();
            released += 1;
            false
        });
        if current.is_some_and(|key| !self.tracks.contains_key(&key)) {
            self.state = PlaybackState::Idle;
        }

        let mut allocated = 0usize;
        for song in songs {
            let key = song.key();
            match self.tracks.entry(key) {
                Entry::Occupied(mut e) => {
                    if e.get().source() != Some(song.audio.as_str()) {
                        e.get_mut().set_source(&song.audio);
                        if self.state.current() == Some(e.key()) {
                            self.state = PlaybackState::Idle;
                        }
                    }
                }
                Entry::Vacant(e) => match self.backend.create_track(song) {
                    Ok(track) => {
                        e.insert(track);
                        allocated += 1;
                    }
                    Err(err) => {
                        tracing::warn!(title = %song.display_title(), error = %err, "could not allocate track");
                    }
                },
            }
        }
        tracing::debug!(
            released,
            allocated,
            tracks = self.tracks.len(),
            "playlist installed"
        );
    }

    /// Releases every track; used on shutdown.
    pub fn release_all(&mut self) {
        for (_, mut track) in self.tracks.drain() {
            track.release();
        }
        self.state = PlaybackState::Idle;
    }
}
