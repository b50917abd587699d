use crate::capture::Frame;
use crate::classify::{ClassifyError, ExpressionClassifier};
use crate::config::Endpoint;
use crate::emotion::{Detection, Expression};
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

/// Classifier served over HTTP (for example a face-api.js or ONNX sidecar).
///
/// `POST {endpoint}` with the encoded frame as body; the service answers with
/// either a bare JSON array or `{"detections": [...]}`, each detection
/// carrying an `expressions` object of label -> probability.
#[derive(Clone)]
pub struct HttpExpressionClassifier {
    client: Client,
    endpoint: Endpoint,
}

impl HttpExpressionClassifier {
    pub fn new(endpoint: Endpoint, timeout: Duration) -> Result<Self, ClassifyError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint })
    }
}

#[derive(Default)]
struct ExpressionScores(Vec<(Expression, f32)>);

impl<'de> Deserialize<'de> for ExpressionScores {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ScoresVisitor;

        impl<'de> Visitor<'de> for ScoresVisitor {
            type Value = ExpressionScores;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of expression label to confidence")
            }

            // Walk the map by hand so the classifier's label order survives;
            // it decides ties.
            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut scores = Vec::with_capacity(map.size_hint().unwrap_or(Expression::ALL.len()));
                while let Some((label, confidence)) = map.next_entry::<String, f32>()? {
                    match label.parse::<Expression>() {
                        Ok(e) => scores.push((e, confidence)),
                        Err(_) => tracing::trace!(label = %label, "ignoring unknown expression label"),
                    }
                }
                Ok(ExpressionScores(scores))
            }
        }

        deserializer.deserialize_map(ScoresVisitor)
    }
}

#[derive(Deserialize)]
struct WireDetection {
    #[serde(default)]
    expressions: ExpressionScores,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireResponse {
    Bare(Vec<WireDetection>),
    Wrapped { detections: Vec<WireDetection> },
}

fn parse_detections(body: &[u8]) -> Result<Vec<Detection>, ClassifyError> {
    let wire: WireResponse = serde_json::from_slice(body)
        .map_err(|e| ClassifyError::InvalidResponse(format!("Failed to parse JSON: {e}")))?;
    let detections = match wire {
        WireResponse::Bare(d) | WireResponse::Wrapped { detections: d } => d,
    };
    Ok(detections
        .into_iter()
        .map(|d| Detection::new(d.expressions.0))
        .collect())
}

impl ExpressionClassifier for HttpExpressionClassifier {
    fn load(&self) -> BoxFuture<'_, Result<(), ClassifyError>> {
        async move {
            // Any answer short of a server error means the service is up;
            // many classifiers reject GET on the classify route with 405.
            let response = self
                .client
                .get(self.endpoint.url().as_str())
                .send()
                .await
                .map_err(|e| {
                    ClassifyError::ModelUnavailable(format!("{} is unreachable: {e}", self.endpoint))
                })?;
            let status = response.status();
            if status.is_server_error() {
                return Err(ClassifyError::ModelUnavailable(format!(
                    "{} answered {status}",
                    self.endpoint
                )));
            }
            tracing::info!(endpoint = %self.endpoint, "expression classifier ready");
            Ok(())
        }
        .boxed()
    }

    fn classify(&self, frame: Frame) -> BoxFuture<'_, Result<Vec<Detection>, ClassifyError>> {
        async move {
            let response = self
                .client
                .post(self.endpoint.url().as_str())
                .header(CONTENT_TYPE, frame.content_type.as_str())
                .body(frame.bytes)
                .send()
                .await?;

            if !response.status().is_success() {
                let status = response.status();
                let error_text = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                return Err(ClassifyError::HttpStatus(status.as_u16(), error_text));
            }

            let body = response.bytes().await?;
            parse_detections(&body)
        }
        .boxed()
    }
}
