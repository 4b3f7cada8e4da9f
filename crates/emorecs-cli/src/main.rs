use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use emorecs_core::{CascadeLocator, EmotionClassifier, EmotionResult, FaceBox, FaceLocator, SessionAggregator, UserId};
use emorecs_engine::{load_label_font, FramePipeline, SessionContext, SessionSummary};
use emorecs_hw::CameraManager;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Duration;

mod config;
mod display;
mod store;

use config::Config;
use display::LogDisplay;
use store::SqliteStore;

#[derive(Parser)]
#[command(name = "emorecs", about = "EmoRecs real-time facial emotion detection")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a live camera session until Ctrl-C or the session ceiling
    Run {
        /// User id to log detections for (overrides EMORECS_USER_ID)
        #[arg(short, long)]
        user: Option<UserId>,
        /// Session ceiling in seconds (overrides EMORECS_SESSION_CEILING_SECS)
        #[arg(short, long)]
        seconds: Option<u64>,
        /// Periodically write the annotated frame to this image file
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
    /// Locate and classify faces in a still image
    Classify {
        image: PathBuf,
        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// List capture devices
    Devices,
    /// Show a user's latest session emotion and recent detections
    History {
        #[arg(short, long)]
        user: UserId,
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Run {
            user,
            seconds,
            snapshot,
        } => run_session(config, user, seconds, snapshot).await,
        Commands::Classify { image, json } => classify_image(&config, &image, json),
        Commands::Devices => {
            let devices = emorecs_hw::list_devices();
            if devices.is_empty() {
                println!("No capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
            Ok(())
        }
        Commands::History { user, limit } => show_history(&config, user, limit),
    }
}

async fn run_session(
    config: Config,
    user: Option<UserId>,
    seconds: Option<u64>,
    snapshot: Option<PathBuf>,
) -> Result<()> {
    let mut ctx = SessionContext::new(user.or(config.user_id));
    let running = ctx.running_flag();

    // Camera handles are not Send; everything is built on the blocking thread.
    let mut task = tokio::task::spawn_blocking(move || -> Result<(SessionSummary, SessionContext)> {
        let mut pipeline = build_pipeline(&config, seconds)?;
        let mut display = LogDisplay::new(snapshot);
        let summary = pipeline.run(&mut ctx, &mut display)?;
        Ok((summary, ctx))
    });

    let joined = tokio::select! {
        res = &mut task => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received; stopping session");
            running.store(false, Ordering::SeqCst);
            task.await
        }
    };
    let (summary, ctx) = joined.context("session thread panicked")??;

    println!(
        "Session {} finished after {:.1}s ({} ticks, {:?})",
        summary.session_id,
        summary.duration.as_secs_f32(),
        summary.ticks,
        summary.reason
    );
    match ctx.detected_emotion() {
        Some(emotion) => println!("Dominant emotion: {emotion}"),
        None => println!("No face detected during the session"),
    }
    Ok(())
}

fn build_pipeline(config: &Config, seconds: Option<u64>) -> Result<FramePipeline> {
    let camera = CameraManager::with_default_backends(config.capture_settings());
    let locator = load_locator(config)?;
    let classifier = EmotionClassifier::from_model_files(
        &config.neural_model_path(),
        &config.local_model_path(),
        config.heuristic_rules()?,
    );
    let store = SqliteStore::open(&config.db_path)?;
    let aggregator = SessionAggregator::new(Box::new(store), config.cooldown());

    let mut pipeline_config = config.pipeline_config();
    if let Some(secs) = seconds {
        pipeline_config.session_ceiling = Duration::from_secs(secs);
    }

    let mut pipeline = FramePipeline::new(camera, Box::new(locator), classifier, aggregator, pipeline_config);
    if let Some(path) = &config.font_path {
        let font = load_label_font(path).with_context(|| format!("loading label font {}", path.display()))?;
        pipeline = pipeline.with_label_font(font);
    }
    Ok(pipeline)
}

fn load_locator(config: &Config) -> Result<CascadeLocator> {
    CascadeLocator::load(&config.cascade_path, config.locator_params())
        .with_context(|| format!("loading face cascade {}", config.cascade_path.display()))
}

#[derive(Serialize)]
struct FaceReport {
    face: FaceBox,
    #[serde(flatten)]
    result: EmotionResult,
}

fn classify_image(config: &Config, path: &Path, json: bool) -> Result<()> {
    let image = image::open(path)
        .with_context(|| format!("reading {}", path.display()))?
        .to_rgb8();
    let mut locator = load_locator(config)?;
    let classifier = EmotionClassifier::from_model_files(
        &config.neural_model_path(),
        &config.local_model_path(),
        config.heuristic_rules()?,
    );

    let reports: Vec<FaceReport> = locator
        .locate(&image)
        .into_iter()
        .map(|face| FaceReport {
            face,
            result: classifier.classify(&face.crop(&image)),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }

    if reports.is_empty() {
        println!("No faces found");
    }
    for (i, r) in reports.iter().enumerate() {
        println!(
            "face {i} at ({}, {}) {}x{}: {} {:.0}% [{}]",
            r.face.x,
            r.face.y,
            r.face.width,
            r.face.height,
            r.result.label,
            r.result.confidence * 100.0,
            r.result.source
        );
    }
    Ok(())
}

fn show_history(config: &Config, user: UserId, limit: usize) -> Result<()> {
    let store = SqliteStore::open(&config.db_path)?;

    match store.latest_session(user)? {
        Some(session) => println!(
            "Last session: {} (ended {})",
            session.dominant_emotion,
            session.session_end.format("%Y-%m-%d %H:%M:%S")
        ),
        None => println!("No completed sessions for user {user}"),
    }

    let logs = store.recent_logs(user, limit)?;
    if !logs.is_empty() {
        println!("Recent detections:");
    }
    for log in logs {
        println!(
            "  {}  {:<8} {:.0}%",
            log.timestamp.format("%Y-%m-%d %H:%M:%S"),
            log.emotion.as_str(),
            log.confidence * 100.0
        );
    }
    Ok(())
}
