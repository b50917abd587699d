mod http;

use crate::emotion::Expression;
use crate::session::SessionEvent;
use crate::util::{is_http_retryable, SingleFlight, Ticket};
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

pub use http::HttpSongSource;

/// A track as stored by the song backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Song {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub artist: String,
    /// Playable URL of the audio file.
    #[serde(default)]
    pub audio: String,
    #[serde(default)]
    pub mood: String,
}

impl Song {
    /// Backend id when present; otherwise the title, so two id-less songs
    /// sharing a title share one audio track.
    pub fn key(&self) -> SongKey {
        match &self.id {
            Some(id) if !id.is_empty() => SongKey(format!("id:{id}")),
            _ => SongKey(format!("title:{}", self.title)),
        }
    }

    pub fn display_title(&self) -> &str {
        if self.title.trim().is_empty() {
            "Unknown Title"
        } else {
            &self.title
        }
    }

    pub fn display_artist(&self) -> &str {
        if self.artist.trim().is_empty() {
            "Unknown Artist"
        } else {
            &self.artist
        }
    }
}

/// Identity of a song's audio track within the player.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SongKey(String);

impl SongKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SongKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Recommendations for one mood, replaced wholesale on every install.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Playlist {
    pub mood: Expression,
    pub generation: u64,
    pub songs: Vec<Song>,
}

/// A track to add to the backend catalogue.
#[derive(Clone, Debug)]
pub struct NewSong {
    pub title: String,
    pub artist: String,
    pub mood: Expression,
    pub file_name: String,
    pub content_type: String,
    pub audio: Bytes,
}

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("http error {0}: {1}")]
    HttpStatus(u16, String),

    #[error("invalid backend response: {0}")]
    InvalidResponse(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Http(e) => e.is_timeout() || e.is_connect(),
            FetchError::HttpStatus(status, _) => is_http_retryable(*status),
            FetchError::InvalidResponse(_) => false,
        }
    }
}

pub trait SongSource: Send + Sync {
    /// Songs tagged with `mood`. An unknown mood yields an empty list.
    fn songs_for(&self, mood: Expression) -> BoxFuture<'_, Result<Vec<Song>, FetchError>>;
}

/// Issues recommendation queries and installs only the latest one's result.
pub struct RecommendationFetcher<S> {
    source: Arc<S>,
    flight: Arc<SingleFlight>,
    playlist: Arc<watch::Sender<Option<Playlist>>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl<S> Clone for RecommendationFetcher<S> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            flight: Arc::clone(&self.flight),
            playlist: Arc::clone(&self.playlist),
            events: self.events.clone(),
        }
    }
}

impl<S> RecommendationFetcher<S> {
    /// Discards the result of every fetch issued so far.
    pub fn invalidate(&self) {
        self.flight.invalidate();
    }
}

impl<S> RecommendationFetcher<S>
where
    S: SongSource + 'static,
{
    pub fn new(
        source: Arc<S>,
        playlist: Arc<watch::Sender<Option<Playlist>>>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            source,
            flight: Arc::new(SingleFlight::new()),
            playlist,
            events,
        }
    }

    /// Starts a fetch for `mood`, superseding any fetch still in flight.
    pub fn request(&self, mood: Expression) -> Ticket {
        let ticket = self.flight.issue();
        tracing::info!(%mood, generation = ticket.generation(), "fetching recommendations");

        let this = self.clone();
        tokio::spawn(async move {
            let result = this.source.songs_for(mood).await;
            this.settle(ticket, mood, result);
        });
        ticket
    }

    fn settle(&self, ticket: Ticket, mood: Expression, result: Result<Vec<Song>, FetchError>) {
        match result {
            Ok(songs) => {
                let count = songs.len();
                let installed = self.flight.complete(ticket, || {
                    self.playlist.send_replace(Some(Playlist {
                        mood,
                        generation: ticket.generation(),
                        songs,
                    }));
                });
                if installed.is_some() {
                    tracing::info!(%mood, songs = count, "playlist replaced");
                    let _ = self
                        .events
                        .send(SessionEvent::PlaylistReplaced { mood, songs: count });
                } else {
                    tracing::debug!(
                        %mood,
                        generation = ticket.generation(),
                        "discarding superseded recommendations"
                    );
                }
            }
            Err(e) => {
                if self.flight.is_current(ticket) {
                    tracing::warn!(%mood, error = %e, "recommendation fetch failed");
                    let _ = self.events.send(SessionEvent::FetchFailed {
                        mood,
                        error: e.to_string(),
                    });
                } else {
                    tracing::debug!(%mood, error = %e, "superseded fetch failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{song, StubSongSource};
    use std::time::Duration;

    fn fetcher(
        source: StubSongSource,
    ) -> (
        RecommendationFetcher<StubSongSource>,
        watch::Receiver<Option<Playlist>>,
        mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let (playlist_tx, playlist_rx) = watch::channel(None);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            RecommendationFetcher::new(Arc::new(source), Arc::new(playlist_tx), events_tx),
            playlist_rx,
            events_rx,
        )
    }

    #[test]
    fn song_key_prefers_backend_id() {
        let mut s = song("Intro", "a.mp3");
        assert_eq!(s.key().as_str(), "title:Intro");
        s.id = Some("65f0c0ffee".to_owned());
        assert_eq!(s.key().as_str(), "id:65f0c0ffee");
    }

    #[test]
    fn display_falls_back_for_blank_fields() {
        let s = Song {
            id: None,
            title: " ".to_owned(),
            artist: String::new(),
            audio: String::new(),
            mood: String::new(),
        };
        assert_eq!(s.display_title(), "Unknown Title");
        assert_eq!(s.display_artist(), "Unknown Artist");
    }

    #[test]
    fn retryable_fetch_errors() {
        assert!(FetchError::HttpStatus(502, String::new()).is_retryable());
        assert!(!FetchError::HttpStatus(404, String::new()).is_retryable());
        assert!(!FetchError::InvalidResponse(String::new()).is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn slower_older_fetch_never_overwrites_newer() {
        let source = StubSongSource::default()
            .with_songs(
                Expression::Happy,
                Duration::from_millis(500),
                vec![song("A", "a.mp3")],
            )
            .with_songs(
                Expression::Sad,
                Duration::from_millis(100),
                vec![song("B", "b.mp3")],
            );
        let (fetcher, playlist, mut events) = fetcher(source);

        let a = fetcher.request(Expression::Happy);
        let b = fetcher.request(Expression::Sad);
        assert!(a < b);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let installed = playlist.borrow().clone().expect("installed");
        assert_eq!(installed.mood, Expression::Sad);
        assert_eq!(installed.generation, b.generation());
        assert_eq!(installed.songs, vec![song("B", "b.mp3")]);

        assert_eq!(
            events.recv().await,
            Some(SessionEvent::PlaylistReplaced {
                mood: Expression::Sad,
                songs: 1
            })
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetch_keeps_previous_playlist() {
        let source = StubSongSource::default()
            .with_songs(Expression::Happy, Duration::ZERO, vec![song("A", "a.mp3")])
            .with_status(Expression::Sad, Duration::ZERO, 500);
        let (fetcher, playlist, mut events) = fetcher(source);

        fetcher.request(Expression::Happy);
        tokio::time::sleep(Duration::from_millis(10)).await;
        fetcher.request(Expression::Sad);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let installed = playlist.borrow().clone().expect("installed");
        assert_eq!(installed.mood, Expression::Happy);

        assert!(matches!(
            events.recv().await,
            Some(SessionEvent::PlaylistReplaced { .. })
        ));
        match events.recv().await {
            Some(SessionEvent::FetchFailed { mood, error }) => {
                assert_eq!(mood, Expression::Sad);
                assert!(error.contains("500"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_drops_in_flight_results() {
        let source = StubSongSource::default().with_songs(
            Expression::Angry,
            Duration::from_millis(300),
            vec![song("A", "a.mp3")],
        );
        let (fetcher, playlist, mut events) = fetcher(source);

        fetcher.request(Expression::Angry);
        fetcher.invalidate();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(playlist.borrow().is_none());
        assert!(events.try_recv().is_err());
    }
}
