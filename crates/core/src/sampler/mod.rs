//! Periodic frame sampling.
//!
//! The sampler ticks on a fixed period. Each tick captures the current frame
//! and hands it to the classifier, unless a classification is still in
//! flight, in which case the tick is skipped. Results leave through a channel
//! tagged with a monotonically increasing sequence number.

use crate::capture::VideoStream;
use crate::classify::ExpressionClassifier;
use crate::emotion::Detection;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Classifier output for one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub sequence: u64,
    pub captured_at: Instant,
    pub detections: Vec<Detection>,
}

pub struct ExpressionSampler<X> {
    classifier: Arc<X>,
    interval: Duration,
}

/// Clears the busy flag when the classification finishes, however it ends.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<X> ExpressionSampler<X>
where
    X: ExpressionClassifier + 'static,
{
    pub fn new(classifier: Arc<X>, interval: Duration) -> Self {
        Self {
            classifier,
            interval,
        }
    }

    /// Starts ticking. Samples are delivered on `tx` only while `live` is set.
    pub fn start<S>(self, stream: Arc<S>, live: Arc<AtomicBool>, tx: mpsc::Sender<Sample>) -> SamplerHandle
    where
        S: VideoStream + 'static,
    {
        let dispatched = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(run_ticker(
            self.classifier,
            self.interval,
            stream,
            live,
            tx,
            Arc::clone(&dispatched),
        ));
        SamplerHandle { task, dispatched }
    }
}

async fn run_ticker<X, S>(
    classifier: Arc<X>,
    interval: Duration,
    stream: Arc<S>,
    live: Arc<AtomicBool>,
    tx: mpsc::Sender<Sample>,
    dispatched: Arc<AtomicU64>,
) where
    X: ExpressionClassifier + 'static,
    S: VideoStream + 'static,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let busy = Arc::new(AtomicBool::new(false));

    loop {
        ticker.tick().await;
        if !live.load(Ordering::Acquire) {
            break;
        }
        if busy.load(Ordering::Acquire) {
            tracing::trace!("classification in flight; skipping tick");
            continue;
        }

        let frame = match stream.capture().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::trace!("no frame available yet");
                continue;
            }
            Err(e) => {
                tracing::warn!(error = %e, "frame capture failed");
                continue;
            }
        };
        if !live.load(Ordering::Acquire) {
            break;
        }

        busy.store(true, Ordering::Release);
        let guard = InFlight(Arc::clone(&busy));
        let sequence = dispatched.fetch_add(1, Ordering::AcqRel) + 1;
        let classifier = Arc::clone(&classifier);
        let live = Arc::clone(&live);
        let tx = tx.clone();

        tokio::spawn(async move {
            let _guard = guard;
            let captured_at = frame.captured_at;
            match classifier.classify(frame).await {
                Ok(detections) => {
                    if !live.load(Ordering::Acquire) {
                        tracing::debug!(sequence, "session stopped; discarding late sample");
                        return;
                    }
                    tracing::debug!(sequence, faces = detections.len(), "frame classified");
                    let sample = Sample {
                        sequence,
                        captured_at,
                        detections,
                    };
                    if tx.send(sample).await.is_err() {
                        tracing::debug!(sequence, "sample receiver closed");
                    }
                }
                Err(e) => {
                    tracing::warn!(sequence, error = %e, "classification failed");
                }
            }
        });
    }
}

/// Owns the sampling timer of one session.
pub struct SamplerHandle {
    task: JoinHandle<()>,
    dispatched: Arc<AtomicU64>,
}

impl SamplerHandle {
    /// Number of classifications started so far.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Acquire)
    }

    /// Stops the timer and waits until the ticker task is gone, so nothing is
    /// captured or dispatched once this returns. Classifications already in
    /// flight run to completion on their own.
    pub async fn cancel(self) {
        self.task.abort();
        match self.task.await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {}
            Err(e) => tracing::error!(error = %e, "sampler task panicked"),
        }
    }

    /// Aborts the timer without waiting for it.
    pub fn abort(&self) {
        self.task.abort();
    }
}
