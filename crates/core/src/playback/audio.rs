use crate::playback::{AudioBackend, AudioTrack, PlaybackError};
use crate::recommend::Song;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::Client;
use rodio::cpal::traits::DeviceTrait;
use rodio::cpal::traits::HostTrait;
use rodio::{Decoder, OutputStream, OutputStreamBuilder, Sink, StreamError};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// A poison-tolerant lazy initializer for a single value.
///
/// The [`rodio::OutputStream`] has to outlive every sink attached to it, so
/// one stream is opened on first playback and shared by all tracks.
struct LazyInit<T> {
    value: Mutex<Option<T>>,
}

impl<T> LazyInit<T> {
    fn new() -> Self {
        Self {
            value: Mutex::new(None),
        }
    }

    fn get_or_try_init_with<R, E>(
        &self,
        init: impl FnOnce() -> Result<T, E>,
        f: impl FnOnce(&T) -> R,
        invariant_err: impl FnOnce() -> E,
    ) -> Result<R, E> {
        let mut guard = match self.value.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("output stream lock was poisoned; recovering");
                poisoned.into_inner()
            }
        };

        if guard.is_none() {
            *guard = Some(init()?);
        }

        match guard.as_ref() {
            Some(v) => Ok(f(v)),
            None => Err(invariant_err()),
        }
    }
}

/// Streams song URLs to the local audio output.
///
/// Clones share the HTTP client and the output stream.
#[derive(Clone)]
pub struct RodioAudioBackend {
    client: Client,
    output_device_name: Option<String>,
    // Set once no output device exists at all; later plays fail fast.
    no_device: Arc<OnceLock<String>>,
    output_stream: Arc<LazyInit<OutputStream>>,
    output_stream_open_attempts: Arc<AtomicUsize>,
}

impl RodioAudioBackend {
    pub fn new() -> Result<Self, PlaybackError> {
        let client = Client::builder().timeout(DOWNLOAD_TIMEOUT).build()?;
        Ok(Self {
            client,
            output_device_name: None,
            no_device: Arc::new(OnceLock::new()),
            output_stream: Arc::new(LazyInit::new()),
            output_stream_open_attempts: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn with_output_device_name<S: Into<String>>(mut self, name: S) -> Self {
        self.output_device_name = Some(name.into());
        self
    }

    fn open_output_stream(&self) -> Result<OutputStream, PlaybackError> {
        let attempt = self
            .output_stream_open_attempts
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        tracing::debug!(
            attempt,
            output_device = %self.output_device_name.as_deref().unwrap_or("<default>"),
            "opening audio output stream"
        );

        let Some(wanted) = self.output_device_name.as_deref() else {
            return OutputStreamBuilder::open_default_stream().map_err(|e| {
                PlaybackError::AudioOutputUnavailable {
                    details: format_stream_error_details(e, None, "open default output stream"),
                }
            });
        };

        let context = match open_named_output_stream(wanted) {
            Ok(stream) => return Ok(stream),
            Err(NamedDeviceStreamError::DeviceNotFound { available }) => {
                tracing::warn!(
                    wanted_device = %wanted,
                    available_devices = %format_device_list(&available),
                    "output device not found; using the default device"
                );
                "default device after named device not found"
            }
            Err(NamedDeviceStreamError::OpenFailed { error, available }) => {
                tracing::warn!(
                    wanted_device = %wanted,
                    error = %error,
                    available_devices = %format_device_list(&available),
                    "failed to open output device; using the default device"
                );
                "default device after named device failed to open"
            }
        };
        OutputStreamBuilder::open_default_stream().map_err(|e| {
            PlaybackError::AudioOutputUnavailable {
                details: format_stream_error_details(e, Some(wanted), context),
            }
        })
    }

    fn connect_sink(&self) -> Result<Sink, PlaybackError> {
        if let Some(details) = self.no_device.get() {
            return Err(PlaybackError::AudioOutputUnavailable {
                details: details.clone(),
            });
        }
        let result = self.output_stream.get_or_try_init_with(
            || self.open_output_stream(),
            |stream| Sink::connect_new(stream.mixer()),
            || PlaybackError::AudioOutputUnavailable {
                details: "output stream cache is empty after init".to_owned(),
            },
        );
        if let Err(PlaybackError::AudioOutputUnavailable { details }) = &result {
            if details.contains("NoDevice") {
                let _ = self.no_device.set(details.clone());
            }
        }
        result
    }

    async fn download(&self, url: &str) -> Result<Bytes, PlaybackError> {
        tracing::debug!(%url, "downloading track");
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(PlaybackError::Load {
                url: url.to_owned(),
                details: format!("http {}: {error_text}", status.as_u16()),
            });
        }
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(PlaybackError::Load {
                url: url.to_owned(),
                details: "empty body".to_owned(),
            });
        }
        Ok(bytes)
    }

    /// Starts downloading `url` in the background so a later play does not
    /// wait for the whole file. Needs a running tokio runtime.
    fn prefetch(&self, url: &str) -> Option<JoinHandle<Result<Bytes, PlaybackError>>> {
        if url.is_empty() {
            return None;
        }
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let backend = self.clone();
        let url = url.to_owned();
        Some(runtime.spawn(async move { backend.download(&url).await }))
    }
}

impl AudioBackend for RodioAudioBackend {
    type Track = RodioTrack;

    fn create_track(&self, song: &Song) -> Result<RodioTrack, PlaybackError> {
        Ok(RodioTrack {
            backend: self.clone(),
            source: Some(song.audio.clone()),
            audio: None,
            pending: self.prefetch(&song.audio),
            sink: None,
        })
    }
}

/// One song on its own rodio sink. The file starts downloading as soon as
/// the track gets a source and is kept so that replaying after the end does
/// not download it again.
pub struct RodioTrack {
    backend: RodioAudioBackend,
    source: Option<String>,
    audio: Option<Bytes>,
    pending: Option<JoinHandle<Result<Bytes, PlaybackError>>>,
    sink: Option<Sink>,
}

impl RodioTrack {
    fn stop(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.stop();
        }
    }

    fn cancel_prefetch(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
    }

    async fn load(&mut self, url: &str) -> Result<Bytes, PlaybackError> {
        if let Some(audio) = &self.audio {
            return Ok(audio.clone());
        }
        let audio = match self.pending.take() {
            Some(pending) => pending.await.map_err(|e| PlaybackError::Load {
                url: url.to_owned(),
                details: e.to_string(),
            })?,
            None => self.backend.download(url).await,
        }?;
        self.audio = Some(audio.clone());
        Ok(audio)
    }
}

impl Drop for RodioTrack {
    fn drop(&mut self) {
        self.cancel_prefetch();
    }
}

impl AudioTrack for RodioTrack {
    fn set_source(&mut self, url: &str) {
        self.stop();
        self.cancel_prefetch();
        self.audio = None;
        self.source = Some(url.to_owned());
        self.pending = self.backend.prefetch(url);
    }

    fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    fn play(&mut self) -> BoxFuture<'_, Result<(), PlaybackError>> {
        async move {
            let url = match self.source.as_deref() {
                Some(url) if !url.is_empty() => url.to_owned(),
                _ => return Err(PlaybackError::NoSource),
            };

            if let Some(sink) = self.sink.as_ref().filter(|s| !s.empty()) {
                sink.play();
                return Ok(());
            }

            let audio = self.load(&url).await?;
            let decoder = Decoder::new(Cursor::new(audio)).map_err(|e| PlaybackError::Decode {
                url: url.clone(),
                details: e.to_string(),
            })?;

            let sink = self.backend.connect_sink()?;
            sink.append(decoder);
            sink.play();
            self.stop();
            self.sink = Some(sink);
            tracing::debug!(%url, "track started");
            Ok(())
        }
        .boxed()
    }

    fn pause(&mut self) {
        if let Some(sink) = &self.sink {
            sink.pause();
        }
    }

    fn release(&mut self) {
        self.stop();
        self.cancel_prefetch();
        self.audio = None;
        self.source = None;
    }

    fn is_playing(&self) -> bool {
        self.sink
            .as_ref()
            .is_some_and(|sink| !sink.is_paused() && !sink.empty())
    }
}

#[derive(Debug)]
enum NamedDeviceStreamError {
    DeviceNotFound {
        available: Vec<String>,
    },
    OpenFailed {
        error: StreamError,
        available: Vec<String>,
    },
}

fn normalize_device_name(s: &str) -> String {
    s.trim().to_ascii_lowercase()
}

fn open_named_output_stream(wanted: &str) -> Result<OutputStream, NamedDeviceStreamError> {
    let wanted_norm = normalize_device_name(wanted);

    let host = rodio::cpal::default_host();
    let mut available: Vec<String> = Vec::new();
    let mut selected = None;

    if let Ok(devices) = host.output_devices() {
        for d in devices {
            let name = d.name().unwrap_or_else(|_| "<unnamed>".to_owned());
            if selected.is_none() && normalize_device_name(&name) == wanted_norm {
                selected = Some(d);
            }
            available.push(name);
        }
    }

    let Some(device) = selected else {
        return Err(NamedDeviceStreamError::DeviceNotFound { available });
    };

    OutputStreamBuilder::from_device(device)
        .and_then(|b| b.open_stream_or_fallback())
        .map_err(|error| NamedDeviceStreamError::OpenFailed { error, available })
}

fn format_device_list(devices: &[String]) -> String {
    if devices.is_empty() {
        return "<unknown>".to_owned();
    }
    devices.join(", ")
}

fn format_stream_error_details(err: StreamError, wanted: Option<&str>, context: &str) -> String {
    let mut s = format!("{context}: {err:?}");
    if let Some(w) = wanted {
        s.push_str(&format!(" (configured_device={w})"));
    }
    #[cfg(feature = "playback-device-enum")]
    {
        if let Ok(devices) = enumerate_output_device_names() {
            if devices.is_empty() {
                s.push_str("; available_output_devices=<none>");
            } else {
                s.push_str("; available_output_devices=");
                s.push_str(&devices.join(", "));
            }
        }
    }
    s
}

#[cfg(feature = "playback-device-enum")]
pub fn enumerate_output_device_names() -> Result<Vec<String>, PlaybackError> {
    let host = rodio::cpal::default_host();
    let devices = host
        .output_devices()
        .map_err(|e| PlaybackError::AudioOutputUnavailable {
            details: format!("failed to list output devices: {e}"),
        })?;

    Ok(devices
        .map(|d| d.name().unwrap_or_else(|_| "<unnamed>".to_owned()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::song;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn normalize_device_name_trims_and_is_case_insensitive() {
        assert_eq!(normalize_device_name("  Speakers  "), "speakers");
        assert_eq!(normalize_device_name("HeAdPhOnEs"), "headphones");
    }

    #[test]
    fn format_device_list_handles_empty() {
        assert_eq!(format_device_list(&[]), "<unknown>");
        assert_eq!(
            format_device_list(&["A".to_owned(), "B".to_owned()]),
            "A, B"
        );
    }

    #[test]
    fn lazy_init_runs_init_only_once() {
        let cell: LazyInit<u32> = LazyInit::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let init = |value: u32| {
            let calls = Arc::clone(&calls);
            move || {
                calls.fetch_add(1, Ordering::Relaxed);
                Ok::<_, ()>(value)
            }
        };
        let v1 = cell.get_or_try_init_with(init(42), |v| *v, || ()).unwrap();
        let v2 = cell.get_or_try_init_with(init(99), |v| *v, || ()).unwrap();

        assert_eq!((v1, v2), (42, 42));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn track_without_source_does_not_touch_the_device() {
        let backend = RodioAudioBackend::new().expect("backend");
        let mut track = backend.create_track(&song("A", "")).expect("track");
        assert!(matches!(track.play().await, Err(PlaybackError::NoSource)));
        assert!(!track.is_playing());
        assert_eq!(backend.output_stream_open_attempts.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn missing_file_is_a_load_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone.mp3"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such key"))
            .mount(&server)
            .await;

        let backend = RodioAudioBackend::new().expect("backend");
        let url = format!("{}/gone.mp3", server.uri());
        let mut track = backend.create_track(&song("Gone", &url)).expect("track");
        match track.play().await {
            Err(PlaybackError::Load { url: u, details }) => {
                assert_eq!(u, url);
                assert!(details.contains("404"));
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert!(!track.is_playing());
    }

    #[tokio::test]
    async fn download_starts_when_the_track_is_created() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/early.mp3"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"not audio".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let backend = RodioAudioBackend::new().expect("backend");
        let url = format!("{}/early.mp3", server.uri());
        let mut track = backend.create_track(&song("Early", &url)).expect("track");

        let mut requests = 0;
        for _ in 0..100 {
            requests = server.received_requests().await.map_or(0, |r| r.len());
            if requests > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(requests, 1, "nothing was fetched before play");

        // Play reuses the prefetched bytes.
        assert!(matches!(track.play().await, Err(PlaybackError::Decode { .. })));
    }

    #[tokio::test]
    async fn undecodable_file_is_downloaded_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/noise.mp3"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"not audio".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let backend = RodioAudioBackend::new().expect("backend");
        let url = format!("{}/noise.mp3", server.uri());
        let mut track = backend.create_track(&song("Noise", &url)).expect("track");
        assert!(matches!(track.play().await, Err(PlaybackError::Decode { .. })));
        assert!(matches!(track.play().await, Err(PlaybackError::Decode { .. })));
        assert_eq!(backend.output_stream_open_attempts.load(Ordering::Relaxed), 0);
    }
}
