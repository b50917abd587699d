use crate::capture::{Camera, CameraError, Frame, VideoStream};
use crate::config::{CameraSettings, Endpoint};
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

const DEFAULT_FRAME_CONTENT_TYPE: &str = "image/jpeg";

/// Camera backed by an HTTP snapshot endpoint, as exposed by most IP webcams
/// and by browser/phone camera bridges. Every capture fetches one image.
#[derive(Clone)]
pub struct HttpSnapshotCamera {
    client: Client,
    endpoint: Endpoint,
}

impl HttpSnapshotCamera {
    pub fn new(endpoint: Endpoint, timeout: Duration) -> Result<Self, CameraError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint })
    }
}

pub struct SnapshotStream {
    client: Client,
    endpoint: Endpoint,
    settings: CameraSettings,
    open: AtomicBool,
}

impl SnapshotStream {
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

async fn fetch_snapshot(
    client: &Client,
    endpoint: &Endpoint,
    settings: CameraSettings,
) -> Result<Option<Frame>, CameraError> {
    let response = client.get(endpoint.url().as_str()).send().await?;

    if !response.status().is_success() {
        let status = response.status();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(CameraError::HttpStatus(status.as_u16(), error_text));
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(DEFAULT_FRAME_CONTENT_TYPE)
        .to_owned();
    let bytes = response.bytes().await?;
    if bytes.is_empty() {
        return Ok(None);
    }

    Ok(Some(Frame {
        captured_at: Instant::now(),
        width: settings.width,
        height: settings.height,
        content_type,
        bytes,
    }))
}

impl VideoStream for SnapshotStream {
    fn capture(&self) -> BoxFuture<'_, Result<Option<Frame>, CameraError>> {
        async move {
            if !self.is_open() {
                return Err(CameraError::Released);
            }
            fetch_snapshot(&self.client, &self.endpoint, self.settings).await
        }
        .boxed()
    }
}

impl Camera for HttpSnapshotCamera {
    type Stream = SnapshotStream;

    fn acquire(
        &self,
        settings: CameraSettings,
    ) -> BoxFuture<'_, Result<Self::Stream, CameraError>> {
        async move {
            tracing::info!(
                endpoint = %self.endpoint,
                width = settings.width,
                height = settings.height,
                facing = ?settings.facing,
                "acquiring camera"
            );

            // One test capture so an unreachable camera fails the start instead of
            // every later sample.
            match fetch_snapshot(&self.client, &self.endpoint, settings).await {
                Ok(Some(frame)) => {
                    tracing::debug!(bytes = frame.bytes.len(), "camera answered");
                }
                Ok(None) => {
                    tracing::warn!("camera answered with an empty frame; continuing");
                }
                Err(CameraError::Http(e)) => {
                    return Err(CameraError::Unavailable(format!(
                        "{} is unreachable: {e}",
                        self.endpoint
                    )));
                }
                Err(e) => return Err(e),
            }

            Ok(SnapshotStream {
                client: self.client.clone(),
                endpoint: self.endpoint.clone(),
                settings,
                open: AtomicBool::new(true),
            })
        }
        .boxed()
    }

    fn release(&self, stream: &Self::Stream) {
        if stream.open.swap(false, Ordering::AcqRel) {
            tracing::info!(endpoint = %stream.endpoint, "camera released");
        }
    }
}
