mod http;

use crate::capture::Frame;
use crate::emotion::Detection;
use futures::future::BoxFuture;

pub use http::HttpExpressionClassifier;

#[derive(thiserror::Error, Debug)]
pub enum ClassifyError {
    #[error("expression models unavailable: {0}")]
    ModelUnavailable(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("http error {0}: {1}")]
    HttpStatus(u16, String),

    #[error("invalid classifier response: {0}")]
    InvalidResponse(String),
}

/// Facial expression classifier. Given a frame, reports zero or more faces,
/// each with a confidence per expression label.
pub trait ExpressionClassifier: Send + Sync {
    /// Makes the models ready. Called once before the first session starts.
    fn load(&self) -> BoxFuture<'_, Result<(), ClassifyError>>;

    fn classify(&self, frame: Frame) -> BoxFuture<'_, Result<Vec<Detection>, ClassifyError>>;
}
