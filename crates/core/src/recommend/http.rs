use crate::config::{BackendConfig, Endpoint};
use crate::emotion::Expression;
use crate::recommend::{FetchError, NewSong, Song, SongSource};
use crate::util::{retry_with_backoff, RetryConfig};
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde::Deserialize;

/// Client for the song backend's `/songs` resource.
#[derive(Clone)]
pub struct HttpSongSource {
    client: Client,
    base_url: Endpoint,
    retry: RetryConfig,
}

#[derive(Deserialize)]
struct SongsResponse {
    #[serde(default)]
    message: String,
    #[serde(default)]
    song: Vec<Song>,
}

#[derive(Deserialize)]
struct CreatedResponse {
    #[serde(default)]
    message: String,
    song: Song,
}

impl HttpSongSource {
    pub fn new(config: &BackendConfig, retry: RetryConfig) -> Result<Self, FetchError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            retry,
        })
    }

    async fn check_status(response: Response) -> Result<Response, FetchError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(FetchError::HttpStatus(status.as_u16(), error_text))
    }

    async fn fetch_once(&self, mood: Expression) -> Result<Vec<Song>, FetchError> {
        let mut url = self.base_url.join("songs");
        url.query_pairs_mut().append_pair("mood", mood.as_str());

        tracing::debug!(%url, "querying song backend");
        let response = Self::check_status(self.client.get(url).send().await?).await?;
        let body = response.bytes().await?;
        let parsed: SongsResponse = serde_json::from_slice(&body)
            .map_err(|e| FetchError::InvalidResponse(format!("Failed to parse JSON: {e}")))?;
        tracing::debug!(message = %parsed.message, songs = parsed.song.len(), "song backend answered");
        Ok(parsed.song)
    }

    /// Stores a new track; the backend answers with the created song,
    /// including its playable URL. Not retried.
    pub async fn upload(&self, song: NewSong) -> Result<Song, FetchError> {
        let audio = Part::bytes(song.audio.to_vec())
            .file_name(song.file_name.clone())
            .mime_str(&song.content_type)?;
        let form = Form::new()
            .text("title", song.title.clone())
            .text("artist", song.artist.clone())
            .text("mood", song.mood.as_str().to_owned())
            .part("audio", audio);

        tracing::info!(title = %song.title, mood = %song.mood, bytes = song.audio.len(), "uploading song");
        let response = Self::check_status(
            self.client
                .post(self.base_url.join("songs"))
                .multipart(form)
                .send()
                .await?,
        )
        .await?;
        let body = response.bytes().await?;
        let created: CreatedResponse = serde_json::from_slice(&body)
            .map_err(|e| FetchError::InvalidResponse(format!("Failed to parse JSON: {e}")))?;
        tracing::info!(message = %created.message, "song stored");
        Ok(created.song)
    }
}

impl SongSource for HttpSongSource {
    fn songs_for(&self, mood: Expression) -> BoxFuture<'_, Result<Vec<Song>, FetchError>> {
        async move {
            retry_with_backoff(
                &self.retry,
                "fetch songs",
                || self.fetch_once(mood),
                FetchError::is_retryable,
            )
            .await
        }
        .boxed()
    }
}
