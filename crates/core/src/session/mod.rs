//! Start/stop lifecycle of mood detection.
//!
//! An active session owns the camera stream, the sampling timer and the
//! aggregation task. Stopping tears them down in that order and resets the
//! published mood to `none`.

use crate::capture::{Camera, CameraError};
use crate::classify::{ClassifyError, ExpressionClassifier};
use crate::config::{CameraSettings, SamplingConfig};
use crate::emotion::{Expression, Mood, MoodAggregator};
use crate::recommend::{Playlist, RecommendationFetcher, SongSource};
use crate::sampler::{ExpressionSampler, Sample, SamplerHandle};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const SAMPLE_QUEUE: usize = 16;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Stopped,
    Starting,
    Active,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Stopped => "stopped",
            SessionState::Starting => "starting",
            SessionState::Active => "active",
        })
    }
}

/// Notifications for whoever drives the UI.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    MoodChanged(Mood),
    PlaylistReplaced { mood: Expression, songs: usize },
    FetchFailed { mood: Expression, error: String },
    Error(String),
}

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("failed to load expression models: {0}")]
    Models(#[from] ClassifyError),

    #[error("failed to acquire camera: {0}")]
    Camera(#[from] CameraError),
}

/// Receiving ends handed out when a session is created.
pub struct SessionChannels {
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub mood: watch::Receiver<Mood>,
    pub playlist: watch::Receiver<Option<Playlist>>,
    pub state: watch::Receiver<SessionState>,
}

struct ActiveSession<T> {
    stream: Arc<T>,
    live: Arc<AtomicBool>,
    sampler: SamplerHandle,
    aggregation: JoinHandle<()>,
}

pub struct DetectionSession<C: Camera, X, S> {
    camera: Arc<C>,
    classifier: Arc<X>,
    fetcher: RecommendationFetcher<S>,
    settings: CameraSettings,
    sampling: SamplingConfig,
    models_loaded: bool,
    state: watch::Sender<SessionState>,
    mood: Arc<watch::Sender<Mood>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    active: Option<ActiveSession<C::Stream>>,
}

impl<C, X, S> DetectionSession<C, X, S>
where
    C: Camera + 'static,
    X: ExpressionClassifier + 'static,
    S: SongSource + 'static,
{
    pub fn new(
        camera: Arc<C>,
        classifier: Arc<X>,
        songs: Arc<S>,
        settings: CameraSettings,
        sampling: SamplingConfig,
    ) -> (Self, SessionChannels) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (mood_tx, mood_rx) = watch::channel(Mood::NoFace);
        let (playlist_tx, playlist_rx) = watch::channel(None);
        let (state_tx, state_rx) = watch::channel(SessionState::Stopped);

        let fetcher = RecommendationFetcher::new(songs, Arc::new(playlist_tx), events_tx.clone());
        let session = Self {
            camera,
            classifier,
            fetcher,
            settings,
            sampling,
            models_loaded: false,
            state: state_tx,
            mood: Arc::new(mood_tx),
            events: events_tx,
            active: None,
        };
        let channels = SessionChannels {
            events: events_rx,
            mood: mood_rx,
            playlist: playlist_rx,
            state: state_rx,
        };
        (session, channels)
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Loads the models (first time only), acquires the camera and starts
    /// sampling. Does nothing if already active.
    pub async fn start(&mut self) -> Result<(), SessionError> {
        if self.active.is_some() {
            tracing::debug!("detection already active");
            return Ok(());
        }
        self.state.send_replace(SessionState::Starting);

        if !self.models_loaded {
            if let Err(e) = self.classifier.load().await {
                return Err(self.abort_start(e.into()));
            }
            self.models_loaded = true;
            tracing::info!("expression models loaded");
        }

        let stream = match self.camera.acquire(self.settings).await {
            Ok(stream) => Arc::new(stream),
            Err(e) => return Err(self.abort_start(e.into())),
        };

        let live = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel(SAMPLE_QUEUE);
        let sampler = ExpressionSampler::new(
            Arc::clone(&self.classifier),
            self.sampling.interval.duration(),
        )
        .start(Arc::clone(&stream), Arc::clone(&live), tx);
        let aggregation = tokio::spawn(run_aggregation(
            rx,
            MoodAggregator::new(self.sampling.stable_samples),
            Arc::clone(&self.mood),
            self.events.clone(),
            self.fetcher.clone(),
        ));

        self.active = Some(ActiveSession {
            stream,
            live,
            sampler,
            aggregation,
        });
        self.state.send_replace(SessionState::Active);
        tracing::info!(
            interval_ms = self.sampling.interval.duration().as_millis() as u64,
            stable_samples = self.sampling.stable_samples.get(),
            "detection started"
        );
        Ok(())
    }

    fn abort_start(&self, error: SessionError) -> SessionError {
        tracing::warn!(error = %error, "detection failed to start");
        let _ = self.events.send(SessionEvent::Error(error.to_string()));
        self.state.send_replace(SessionState::Stopped);
        error
    }

    /// Stops sampling, drops pending results and releases the camera.
    pub async fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        active.live.store(false, Ordering::Release);
        active.sampler.cancel().await;
        active.aggregation.abort();
        if let Err(e) = active.aggregation.await {
            if !e.is_cancelled() {
                tracing::error!(error = %e, "aggregation task panicked");
            }
        }
        self.fetcher.invalidate();
        self.camera.release(&active.stream);

        let previous = self.mood.send_replace(Mood::NoFace);
        if previous != Mood::NoFace {
            let _ = self.events.send(SessionEvent::MoodChanged(Mood::NoFace));
        }
        self.state.send_replace(SessionState::Stopped);
        tracing::info!("detection stopped");
    }

    /// Starts when stopped, stops when active. Returns the new state.
    pub async fn toggle(&mut self) -> Result<SessionState, SessionError> {
        if self.is_active() {
            self.stop().await;
        } else {
            self.start().await?;
        }
        Ok(self.state())
    }
}

impl<C: Camera, X, S> Drop for DetectionSession<C, X, S> {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.live.store(false, Ordering::Release);
            active.sampler.abort();
            active.aggregation.abort();
            self.fetcher.invalidate();
            self.camera.release(&active.stream);
        }
    }
}

async fn run_aggregation<S>(
    mut samples: mpsc::Receiver<Sample>,
    mut aggregator: MoodAggregator,
    mood: Arc<watch::Sender<Mood>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    fetcher: RecommendationFetcher<S>,
) where
    S: SongSource + 'static,
{
    while let Some(sample) = samples.recv().await {
        let Some(update) = aggregator.observe(sample.sequence, &sample.detections) else {
            continue;
        };
        if update.changed {
            tracing::info!(mood = %update.current, sequence = update.sequence, "mood changed");
            mood.send_replace(update.current);
            let _ = events.send(SessionEvent::MoodChanged(update.current));
        }
        if let Some(expression) = update.fetch {
            fetcher.request(expression);
        }
    }
}
