#![deny(warnings)]

use anyhow::Context;
use auratunes_core::capture::{Camera, HttpSnapshotCamera};
use auratunes_core::classify::{ExpressionClassifier, HttpExpressionClassifier};
use auratunes_core::config::{
    resolve_endpoint, resolve_endpoint_with_default, resolve_optional_string, AppConfig,
    AudioConfig, BackendConfig, CameraSettings, Env, FacingMode, SampleInterval,
    SamplingConfig, StableSamples, StdEnv, DEFAULT_BACKEND_URL, DEFAULT_CAMERA_HEIGHT,
    DEFAULT_CAMERA_WIDTH, DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_SAMPLE_INTERVAL_MS,
    DEFAULT_STABLE_SAMPLES, ENV_BACKEND_URL, ENV_CAMERA_URL, ENV_CLASSIFIER_URL,
    ENV_OUTPUT_DEVICE,
};
use auratunes_core::emotion::{Expression, Mood};
use auratunes_core::playback::{
    AudioBackend, PlaybackController, PlaybackState, RodioAudioBackend, SilentAudioBackend,
};
use auratunes_core::recommend::{HttpSongSource, NewSong, Song, SongSource};
use auratunes_core::session::{DetectionSession, SessionChannels, SessionEvent};
use auratunes_core::util::RetryConfig;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

const RECONCILE_INTERVAL: Duration = Duration::from_millis(500);
const WAITING_FOR_SONGS: &str = "Waiting for song recommendations...";
const NO_SONGS_FOUND: &str = "No songs found.";

#[derive(Parser, Debug)]
#[command(name = "auratunes")]
#[command(about = "Plays songs that match the expression on your face")]
struct Cli {
    /// Song backend base URL.
    #[arg(long, global = true)]
    backend_url: Option<String>,

    #[arg(long, global = true, default_value_t = DEFAULT_REQUEST_TIMEOUT_MS)]
    timeout_ms: u64,

    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Defaults to `run` with its default options.
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Interactive session: detect mood from the camera and play matching songs.
    Run(RunArgs),

    /// Print the songs the backend recommends for a mood.
    Songs {
        #[arg(long)]
        mood: Expression,
    },

    /// Add a song to the backend catalogue.
    Upload(UploadArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Snapshot URL of the webcam (one JPEG per GET).
    #[arg(long)]
    camera_url: Option<String>,

    /// Expression classifier endpoint.
    #[arg(long)]
    classifier_url: Option<String>,

    #[arg(long, default_value_t = DEFAULT_SAMPLE_INTERVAL_MS)]
    interval_ms: u64,

    /// Identical samples required before the mood switches.
    #[arg(long, default_value_t = DEFAULT_STABLE_SAMPLES)]
    stable_samples: usize,

    #[arg(long, default_value_t = DEFAULT_CAMERA_WIDTH)]
    width: u32,

    #[arg(long, default_value_t = DEFAULT_CAMERA_HEIGHT)]
    height: u32,

    /// Ask for the rear camera where the device has one.
    #[arg(long)]
    rear_camera: bool,

    #[arg(long)]
    output_device: Option<String>,

    /// Track playback state without producing sound.
    #[arg(long)]
    mute: bool,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            camera_url: None,
            classifier_url: None,
            interval_ms: DEFAULT_SAMPLE_INTERVAL_MS,
            stable_samples: DEFAULT_STABLE_SAMPLES,
            width: DEFAULT_CAMERA_WIDTH,
            height: DEFAULT_CAMERA_HEIGHT,
            rear_camera: false,
            output_device: None,
            mute: false,
        }
    }
}

#[derive(Args, Debug)]
struct UploadArgs {
    #[arg(long)]
    file: PathBuf,

    #[arg(long)]
    title: String,

    #[arg(long, default_value = "")]
    artist: String,

    #[arg(long)]
    mood: Expression,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    let env = StdEnv;
    let backend = build_backend_config(cli.backend_url, cli.timeout_ms, &env)?;
    tracing::info!(backend = %backend.base_url, "config loaded");

    match cli.command.unwrap_or_else(|| Command::Run(RunArgs::default())) {
        Command::Run(args) => {
            let cfg = build_config(backend, args, &env)?;
            run_session(cfg).await
        }
        Command::Songs { mood } => list_songs(&backend, mood).await,
        Command::Upload(args) => upload_song(&backend, args).await,
    }
}

fn init_tracing(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(
            level
                .parse()
                .with_context(|| format!("invalid --log-level: {level}"))?,
        )
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn build_backend_config(
    backend_url: Option<String>,
    timeout_ms: u64,
    env: &impl Env,
) -> anyhow::Result<BackendConfig> {
    let base_url =
        resolve_endpoint_with_default(backend_url, ENV_BACKEND_URL, env, DEFAULT_BACKEND_URL)
            .context("invalid backend url")?;
    Ok(BackendConfig {
        base_url,
        timeout: Duration::from_millis(timeout_ms),
    })
}

fn build_config(backend: BackendConfig, args: RunArgs, env: &impl Env) -> anyhow::Result<AppConfig> {
    let camera_url =
        resolve_endpoint(args.camera_url, ENV_CAMERA_URL, env).context("invalid camera url")?;
    let classifier_url = resolve_endpoint(args.classifier_url, ENV_CLASSIFIER_URL, env)
        .context("invalid classifier url")?;

    let facing = if args.rear_camera {
        FacingMode::Environment
    } else {
        FacingMode::User
    };

    Ok(AppConfig {
        backend,
        camera_url,
        classifier_url,
        camera: CameraSettings::new(args.width, args.height, facing)?,
        sampling: SamplingConfig {
            interval: SampleInterval::new(args.interval_ms)?,
            stable_samples: StableSamples::new(args.stable_samples)?,
        },
        retry: RetryConfig::default(),
        audio: AudioConfig {
            output_device: resolve_optional_string(args.output_device, ENV_OUTPUT_DEVICE, env),
            muted: args.mute,
        },
    })
}

async fn run_session(cfg: AppConfig) -> anyhow::Result<()> {
    let camera_url = cfg
        .camera_url
        .clone()
        .with_context(|| format!("a camera is required: pass --camera-url or set {ENV_CAMERA_URL}"))?;
    let classifier_url = cfg.classifier_url.clone().with_context(|| {
        format!("a classifier is required: pass --classifier-url or set {ENV_CLASSIFIER_URL}")
    })?;

    let camera = HttpSnapshotCamera::new(camera_url, cfg.backend.timeout)?;
    let classifier = HttpExpressionClassifier::new(classifier_url, cfg.backend.timeout)?;
    let songs = HttpSongSource::new(&cfg.backend, cfg.retry.clone())?;

    let (session, channels) = DetectionSession::new(
        Arc::new(camera),
        Arc::new(classifier),
        Arc::new(songs),
        cfg.camera,
        cfg.sampling,
    );

    if cfg.audio.muted {
        tracing::info!("audio muted; playback state only");
        interact(session, channels, PlaybackController::new(SilentAudioBackend::new())).await
    } else {
        let mut backend = RodioAudioBackend::new()?;
        if let Some(name) = cfg.audio.output_device.clone() {
            backend = backend.with_output_device_name(name);
        }
        interact(session, channels, PlaybackController::new(backend)).await
    }
}

#[derive(Debug, PartialEq, Eq)]
enum UserCommand {
    Start,
    Stop,
    Toggle,
    Play(usize),
    List,
    Status,
    Help,
    Quit,
}

fn parse_command(line: &str) -> Result<Option<UserCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(word) = words.next() else {
        return Ok(None);
    };
    let command = match word.to_ascii_lowercase().as_str() {
        "start" => UserCommand::Start,
        "stop" => UserCommand::Stop,
        "toggle" => UserCommand::Toggle,
        "play" => {
            let n = words
                .next()
                .and_then(|n| n.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .ok_or_else(|| "usage: play <n>".to_owned())?;
            UserCommand::Play(n)
        }
        "list" | "ls" => UserCommand::List,
        "status" => UserCommand::Status,
        "help" | "?" => UserCommand::Help,
        "quit" | "exit" | "q" => UserCommand::Quit,
        other => return Err(format!("unknown command {other:?}; try \"help\"")),
    };
    Ok(Some(command))
}

fn print_help() {
    println!("commands: start | stop | toggle | play <n> | list | status | help | quit");
}

/// Drives the session from stdin. Tracks begin downloading when a playlist
/// arrives, so `play` only waits for whatever is still in flight.
async fn interact<C, X, S, B>(
    mut session: DetectionSession<C, X, S>,
    mut channels: SessionChannels,
    mut player: PlaybackController<B>,
) -> anyhow::Result<()>
where
    C: Camera + 'static,
    X: ExpressionClassifier + 'static,
    S: SongSource + 'static,
    B: AudioBackend,
{
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut reconcile = tokio::time::interval(RECONCILE_INTERVAL);
    // `None` until the first playlist arrives.
    let mut songs: Option<Vec<Song>> = None;
    print_help();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                let command = match parse_command(&line) {
                    Ok(Some(command)) => command,
                    Ok(None) => continue,
                    Err(message) => {
                        println!("{message}");
                        continue;
                    }
                };
                match command {
                    UserCommand::Quit => break,
                    UserCommand::Start => {
                        if let Err(e) = session.start().await {
                            println!("could not start detection: {e}");
                        }
                    }
                    UserCommand::Stop => session.stop().await,
                    UserCommand::Toggle => match session.toggle().await {
                        Ok(state) => println!("detection {state}"),
                        Err(e) => println!("could not start detection: {e}"),
                    },
                    UserCommand::Play(n) => {
                        let listed = songs.as_deref().unwrap_or_default();
                        match listed.get(n - 1) {
                            Some(song) => match player.toggle(song).await {
                                Ok(state) => println!("{}", describe_playback(state, listed)),
                                Err(e) => println!("could not play {}: {e}", song.display_title()),
                            },
                            None if songs.is_none() => println!("{WAITING_FOR_SONGS}"),
                            None => println!("no song #{n}; the playlist has {}", listed.len()),
                        }
                    }
                    UserCommand::List => print_playlist(songs.as_deref(), player.state()),
                    UserCommand::Status => {
                        print_status(&session, &channels.mood, &player, songs.as_deref())
                    }
                    UserCommand::Help => print_help(),
                }
            }
            changed = channels.playlist.changed() => {
                if changed.is_err() {
                    break;
                }
                let playlist = channels.playlist.borrow_and_update().clone();
                if let Some(playlist) = playlist {
                    player.replace_playlist(&playlist.songs);
                    println!("songs for {}:", playlist.mood);
                    print_playlist(Some(&playlist.songs), player.state());
                    songs = Some(playlist.songs);
                }
            }
            Some(event) = channels.events.recv() => print_event(&event),
            _ = reconcile.tick() => player.reconcile(),
        }
    }

    session.stop().await;
    player.release_all();
    tracing::info!("bye");
    Ok(())
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::MoodChanged(Mood::NoFace) => println!("mood: no face detected"),
        SessionEvent::MoodChanged(mood) => println!("mood: {mood}"),
        // The playlist itself is printed when the watch channel updates.
        SessionEvent::PlaylistReplaced { .. } => {}
        SessionEvent::FetchFailed { mood, error } => {
            println!("could not fetch songs for {mood}: {error}")
        }
        SessionEvent::Error(message) => println!("error: {message}"),
    }
}

fn title_of<'a>(songs: &'a [Song], state: &PlaybackState) -> Option<&'a str> {
    let key = state.current()?;
    songs
        .iter()
        .find(|s| &s.key() == key)
        .map(Song::display_title)
}

fn describe_playback(state: &PlaybackState, songs: &[Song]) -> String {
    let title = title_of(songs, state).unwrap_or("?");
    match state {
        PlaybackState::Idle => "nothing playing".to_owned(),
        PlaybackState::Playing(_) => format!("playing {title}"),
        PlaybackState::Paused(_) => format!("paused {title}"),
    }
}

/// `None` means no recommendation has arrived yet, which reads differently
/// from a mood the backend has no songs for.
fn playlist_lines(songs: Option<&[Song]>, state: &PlaybackState) -> Vec<String> {
    let Some(songs) = songs else {
        return vec![WAITING_FOR_SONGS.to_owned()];
    };
    if songs.is_empty() {
        return vec![NO_SONGS_FOUND.to_owned()];
    }
    songs
        .iter()
        .enumerate()
        .map(|(i, song)| {
            let marker = match state {
                PlaybackState::Playing(k) if *k == song.key() => ">",
                PlaybackState::Paused(k) if *k == song.key() => "=",
                _ => " ",
            };
            format!(
                "{marker} {:>2}. {} - {}",
                i + 1,
                song.display_title(),
                song.display_artist()
            )
        })
        .collect()
}

fn print_playlist(songs: Option<&[Song]>, state: &PlaybackState) {
    for line in playlist_lines(songs, state) {
        println!("{line}");
    }
}

fn print_status<C, X, S, B>(
    session: &DetectionSession<C, X, S>,
    mood: &watch::Receiver<Mood>,
    player: &PlaybackController<B>,
    songs: Option<&[Song]>,
) where
    C: Camera + 'static,
    X: ExpressionClassifier + 'static,
    S: SongSource + 'static,
    B: AudioBackend,
{
    println!("detection: {}", session.state());
    println!("mood: {}", *mood.borrow());
    match songs {
        Some(songs) => println!("playlist: {} songs", songs.len()),
        None => println!("playlist: {WAITING_FOR_SONGS}"),
    }
    println!(
        "playback: {}",
        describe_playback(player.state(), songs.unwrap_or_default())
    );
}

async fn list_songs(backend: &BackendConfig, mood: Expression) -> anyhow::Result<()> {
    let source = HttpSongSource::new(backend, RetryConfig::default())?;
    let songs = source
        .songs_for(mood)
        .await
        .with_context(|| format!("failed to fetch songs for {mood}"))?;
    println!("songs for {mood}:");
    print_playlist(Some(&songs), &PlaybackState::Idle);
    Ok(())
}

async fn upload_song(backend: &BackendConfig, args: UploadArgs) -> anyhow::Result<()> {
    let audio = std::fs::read(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let file_name = args
        .file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("audio")
        .to_owned();

    let source = HttpSongSource::new(backend, RetryConfig::disabled())?;
    let created = source
        .upload(NewSong {
            title: args.title,
            artist: args.artist,
            mood: args.mood,
            content_type: content_type_for(&args.file).to_owned(),
            file_name,
            audio: audio.into(),
        })
        .await
        .context("upload failed")?;
    println!(
        "stored {} - {} ({})",
        created.display_title(),
        created.display_artist(),
        created.audio
    );
    Ok(())
}

fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("ogg") | Some("oga") => "audio/ogg",
        Some("flac") => "audio/flac",
        Some("m4a") | Some("mp4") => "audio/mp4",
        _ => "application/octet-stream",
    }
}
