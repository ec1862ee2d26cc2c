use std::{cell::RefCell, path::PathBuf, rc::Rc};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use wavtap_core::{
    mapping::{DEFAULT_MAX_DECIBELS, DEFAULT_MIN_DECIBELS},
    timeline, AnalysisSnapshot, AppConfig, AudioSource, ManualFrameSource, OfflineBackend,
    PlaybackSession, Presentation,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> wavtap_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    match cli.command {
        Commands::Analyse {
            input,
            presentation,
            at,
            frames,
            min_level,
            max_level,
        } => {
            let levels = (min_level, max_level);
            run_analyse(&config, input, presentation, at, frames, levels).await
        }
        #[cfg(feature = "cpal-output")]
        Commands::Play {
            input,
            presentation,
        } => {
            tokio::task::LocalSet::new()
                .run_until(play::run_play(&config, input, presentation))
                .await
        }
    }
}

async fn run_analyse(
    config: &AppConfig,
    input: String,
    presentation: Presentation,
    at: f64,
    frames: usize,
    (min_level, max_level): (f32, f32),
) -> wavtap_core::Result<()> {
    tracing::info!(%input, %presentation, at, frames, "running offline analysis");

    let backend = OfflineBackend::new();
    let mut session = PlaybackSession::new(config.session.clone(), backend.clone())?;
    session.load_file(AudioSource::url(input)).await?;
    session.play()?;
    backend.advance(at)?;

    let session = Rc::new(RefCell::new(session));
    let captured: Rc<RefCell<Vec<serde_json::Value>>> = Rc::default();
    let frame_seconds = 1.0 / config.frames.refresh_hz as f64;

    let source = ManualFrameSource::new();
    let mut handle = {
        let session = session.clone();
        let captured = captured.clone();
        let backend = backend.clone();
        timeline::run(&source, move || {
            let mut session = session.borrow_mut();
            let time = session.current_time();
            let state = session.state();
            let entry = session
                .get_frequencies(presentation, min_level, max_level)
                .map(|snapshot| frame_json(time, state, &snapshot));

            match entry {
                Ok(entry) => captured.borrow_mut().push(entry),
                Err(err) => tracing::warn!(error = %err, "frequency query failed"),
            }
            if let Err(err) = backend.advance(frame_seconds) {
                tracing::warn!(error = %err, "offline render failed");
            }
        })
    };

    for _ in 0..frames.max(1) {
        source.tick();
    }
    handle.cancel();

    let output = serde_json::Value::Array(captured.take());
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn frame_json(
    time: f64,
    state: wavtap_core::TransportState,
    snapshot: &AnalysisSnapshot,
) -> serde_json::Value {
    let peak = snapshot.peak().map(|(index, value)| {
        serde_json::json!({ "label": snapshot.labels[index], "value": value })
    });

    serde_json::json!({
        "time": time,
        "state": format!("{state:?}"),
        "peak": peak,
        "snapshot": snapshot,
    })
}

#[cfg(feature = "cpal-output")]
mod play {
    use std::{cell::RefCell, rc::Rc};

    use tokio::sync::Notify;
    use wavtap_core::{
        mapping::{DEFAULT_MAX_DECIBELS, DEFAULT_MIN_DECIBELS},
        timeline, AppConfig, AudioSource, CpalBackend, IntervalFrameSource, PlaybackSession,
        Presentation, TransportState,
    };

    pub(crate) async fn run_play(
        config: &AppConfig,
        input: String,
        presentation: Presentation,
    ) -> wavtap_core::Result<()> {
        tracing::info!(%input, %presentation, "starting playback");

        let mut session = PlaybackSession::new(config.session.clone(), CpalBackend::new())?;
        session.load_file(AudioSource::url(input)).await?;
        session.play()?;

        let session = Rc::new(RefCell::new(session));
        let finished = Rc::new(Notify::new());
        let source = IntervalFrameSource::new(config.frames.refresh_hz);

        let mut handle = {
            let session = session.clone();
            let finished = finished.clone();
            timeline::run(&source, move || {
                let mut session = session.borrow_mut();
                if session.state() != TransportState::Playing {
                    finished.notify_one();
                    return;
                }

                let time = session.current_time();
                let snapshot = session.get_frequencies(
                    presentation,
                    DEFAULT_MIN_DECIBELS,
                    DEFAULT_MAX_DECIBELS,
                );
                match snapshot {
                    Ok(snapshot) => {
                        if let Some((index, value)) = snapshot.peak() {
                            tracing::info!(time, band = %snapshot.labels[index], value, "frame");
                        }
                    }
                    Err(err) => tracing::warn!(error = %err, "frequency query failed"),
                }
            })
        };

        tokio::select! {
            _ = finished.notified() => tracing::info!("playback finished"),
            _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
        }

        handle.cancel();
        session.borrow_mut().stop();
        Ok(())
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Audio playback with live frequency analysis", long_about = None)]
struct Cli {
    /// JSON configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Render an asset offline and print frequency snapshots as JSON.
    Analyse {
        /// Path or URL of the audio asset.
        input: String,
        /// Band grouping: frequency, music or voice.
        #[arg(short, long, default_value = "frequency")]
        presentation: Presentation,
        /// Playback position in seconds of the first snapshot.
        #[arg(long, default_value_t = 0.5)]
        at: f64,
        /// Number of consecutive frames to capture.
        #[arg(long, default_value_t = 1)]
        frames: usize,
        #[arg(long, default_value_t = DEFAULT_MIN_DECIBELS, allow_negative_numbers = true)]
        min_level: f32,
        #[arg(long, default_value_t = DEFAULT_MAX_DECIBELS, allow_negative_numbers = true)]
        max_level: f32,
    },
    /// Play an asset on the default output device and log the loudest band.
    #[cfg(feature = "cpal-output")]
    Play {
        /// Path or URL of the audio asset.
        input: String,
        #[arg(short, long, default_value = "music")]
        presentation: Presentation,
    },
}
