mod snapshot;

use crate::config::CameraSettings;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::time::Instant;

pub use snapshot::{HttpSnapshotCamera, SnapshotStream};

/// One camera image. Produced by a [`VideoStream`], consumed by the
/// classifier, never stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub captured_at: Instant,
    pub width: u32,
    pub height: u32,
    pub content_type: String,
    pub bytes: Bytes,
}

#[derive(thiserror::Error, Debug)]
pub enum CameraError {
    #[error("camera unavailable: {0}")]
    Unavailable(String),

    #[error("camera stream already released")]
    Released,

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("http error {0}: {1}")]
    HttpStatus(u16, String),
}

/// A live stream handed out by [`Camera::acquire`].
pub trait VideoStream: Send + Sync {
    /// The current frame, or `Ok(None)` while the stream has nothing to show
    /// yet (for example before the first image arrives).
    fn capture(&self) -> BoxFuture<'_, Result<Option<Frame>, CameraError>>;
}

pub trait Camera: Send + Sync {
    type Stream: VideoStream + 'static;

    fn acquire(&self, settings: CameraSettings)
        -> BoxFuture<'_, Result<Self::Stream, CameraError>>;

    /// Stops the stream. Captures on a released stream fail.
    fn release(&self, stream: &Self::Stream);
}
