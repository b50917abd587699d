//! Hand-written collaborators shared by the unit tests.

use crate::capture::{Camera, CameraError, Frame, VideoStream};
use crate::classify::{ClassifyError, ExpressionClassifier};
use crate::config::CameraSettings;
use crate::emotion::{Detection, Expression};
use crate::recommend::{FetchError, Song, SongSource};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub fn song(title: &str, audio: &str) -> Song {
    Song {
        id: None,
        title: title.to_owned(),
        artist: "Test Artist".to_owned(),
        audio: audio.to_owned(),
        mood: String::new(),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CameraEvent {
    Acquire,
    Capture,
    Release,
}

#[derive(Default)]
struct CameraLog {
    events: Mutex<Vec<CameraEvent>>,
    captures: AtomicUsize,
}

impl CameraLog {
    fn record(&self, event: CameraEvent) {
        self.events.lock().expect("camera log").push(event);
    }
}

#[derive(Clone, Default)]
pub struct StubCamera {
    log: Arc<CameraLog>,
    fail_acquire: bool,
    blank_captures: usize,
}

impl StubCamera {
    pub fn failing() -> Self {
        Self {
            fail_acquire: true,
            ..Self::default()
        }
    }

    /// The first `n` captures report that no frame is available yet.
    pub fn without_frames_for(mut self, n: usize) -> Self {
        self.blank_captures = n;
        self
    }

    pub fn stream(&self) -> Arc<StubStream> {
        Arc::new(self.open_stream())
    }

    fn open_stream(&self) -> StubStream {
        StubStream {
            log: Arc::clone(&self.log),
            blank_captures: self.blank_captures,
            open: AtomicBool::new(true),
        }
    }

    pub fn captures(&self) -> usize {
        self.log.captures.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<CameraEvent> {
        self.log.events.lock().expect("camera log").clone()
    }
}

pub struct StubStream {
    log: Arc<CameraLog>,
    blank_captures: usize,
    open: AtomicBool,
}

impl VideoStream for StubStream {
    fn capture(&self) -> BoxFuture<'_, Result<Option<Frame>, CameraError>> {
        async move {
            if !self.open.load(Ordering::SeqCst) {
                return Err(CameraError::Released);
            }
            let n = self.log.captures.fetch_add(1, Ordering::SeqCst) + 1;
            self.log.record(CameraEvent::Capture);
            if n <= self.blank_captures {
                return Ok(None);
            }
            Ok(Some(Frame {
                captured_at: Instant::now(),
                width: 640,
                height: 480,
                content_type: "image/jpeg".to_owned(),
                bytes: Bytes::from_static(b"frame"),
            }))
        }
        .boxed()
    }
}

impl Camera for StubCamera {
    type Stream = StubStream;

    fn acquire(&self, _settings: CameraSettings) -> BoxFuture<'_, Result<StubStream, CameraError>> {
        async move {
            self.log.record(CameraEvent::Acquire);
            if self.fail_acquire {
                return Err(CameraError::Unavailable("no webcam attached".to_owned()));
            }
            Ok(self.open_stream())
        }
        .boxed()
    }

    fn release(&self, stream: &StubStream) {
        stream.open.store(false, Ordering::SeqCst);
        self.log.record(CameraEvent::Release);
    }
}

pub struct StubClassifier {
    script: Mutex<VecDeque<Option<Vec<Detection>>>>,
    fallback: Vec<Detection>,
    latency: Duration,
    fail_load: bool,
    loads: AtomicUsize,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl StubClassifier {
    fn with_script(script: VecDeque<Option<Vec<Detection>>>, fallback: Vec<Detection>) -> Self {
        Self {
            script: Mutex::new(script),
            fallback,
            latency: Duration::ZERO,
            fail_load: false,
            loads: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn constant(detections: Vec<Detection>) -> Self {
        Self::with_script(VecDeque::new(), detections)
    }

    /// Answers with each entry in turn, then with `fallback` forever.
    pub fn scripted(script: Vec<Vec<Detection>>, fallback: Vec<Detection>) -> Self {
        Self::with_script(script.into_iter().map(Some).collect(), fallback)
    }

    /// The first `failures` calls fail, the rest return `detections`.
    pub fn failing_then(failures: usize, detections: Vec<Detection>) -> Self {
        Self::with_script((0..failures).map(|_| None).collect(), detections)
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn failing_load(mut self) -> Self {
        self.fail_load = true;
        self
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl ExpressionClassifier for StubClassifier {
    fn load(&self) -> BoxFuture<'_, Result<(), ClassifyError>> {
        async move {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail_load {
                return Err(ClassifyError::ModelUnavailable("models missing".to_owned()));
            }
            Ok(())
        }
        .boxed()
    }

    fn classify(&self, _frame: Frame) -> BoxFuture<'_, Result<Vec<Detection>, ClassifyError>> {
        async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let next = self.script.lock().expect("script").pop_front();
            match next {
                Some(Some(detections)) => Ok(detections),
                Some(None) => Err(ClassifyError::InvalidResponse("scripted failure".to_owned())),
                None => Ok(self.fallback.clone()),
            }
        }
        .boxed()
    }
}

#[derive(Clone)]
enum StubAnswer {
    Songs(Vec<Song>),
    Status(u16),
}

#[derive(Default)]
pub struct StubSongSource {
    answers: Mutex<HashMap<Expression, (Duration, StubAnswer)>>,
    requests: Mutex<Vec<Expression>>,
}

impl StubSongSource {
    pub fn with_songs(self, mood: Expression, delay: Duration, songs: Vec<Song>) -> Self {
        self.answers
            .lock()
            .expect("answers")
            .insert(mood, (delay, StubAnswer::Songs(songs)));
        self
    }

    pub fn with_status(self, mood: Expression, delay: Duration, status: u16) -> Self {
        self.answers
            .lock()
            .expect("answers")
            .insert(mood, (delay, StubAnswer::Status(status)));
        self
    }

    pub fn requests(&self) -> Vec<Expression> {
        self.requests.lock().expect("requests").clone()
    }
}

impl SongSource for StubSongSource {
    fn songs_for(&self, mood: Expression) -> BoxFuture<'_, Result<Vec<Song>, FetchError>> {
        async move {
            self.requests.lock().expect("requests").push(mood);
            let answer = self.answers.lock().expect("answers").get(&mood).cloned();
            let Some((delay, answer)) = answer else {
                return Ok(Vec::new());
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match answer {
                StubAnswer::Songs(songs) => Ok(songs),
                StubAnswer::Status(status) => {
                    Err(FetchError::HttpStatus(status, "stub failure".to_owned()))
                }
            }
        }
        .boxed()
    }
}
