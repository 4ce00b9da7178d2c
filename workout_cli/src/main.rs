use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use workout_core::*;

#[derive(Parser)]
#[command(name = "workout-room")]
#[command(about = "Guided workout session engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Read configuration from this file instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Count repetitions in a recorded label stream (one label per line)
    Count {
        /// File with one classifier label per line; blank lines are "no label"
        #[arg(long)]
        labels: PathBuf,

        /// Pipeline as label:count pairs, e.g. squat:3,lunge:2
        #[arg(long)]
        pipeline: String,

        /// Capture frame rate (defaults to the configured rate)
        #[arg(long)]
        fps: Option<f32>,
    },

    /// Print the proof digest of a batch body
    Proof {
        /// JSON batch body (total_time, frame, exercises, frames)
        #[arg(long)]
        batch: PathBuf,

        /// Session token
        #[arg(long)]
        token: String,
    },

    /// Run a live session from recorded frames
    Replay {
        /// Session token for the room
        #[arg(long)]
        jwt: String,

        /// JSON lines of {points, label, width, height}
        #[arg(long)]
        frames: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        workout_core::logging::init_with_level("debug");
    } else {
        workout_core::logging::init();
    }

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Count {
            labels,
            pipeline,
            fps,
        } => cmd_count(&labels, &pipeline, fps, &config),
        Commands::Proof { batch, token } => cmd_proof(&batch, &token),
        Commands::Replay { jwt, frames } => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(cmd_replay(&jwt, &frames, config))
        }
    }
}

/// Parse `squat:3,lunge:2` into segments
fn parse_pipeline(spec: &str) -> Result<Vec<ExerciseSegment>> {
    spec.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (label, count) = part
                .split_once(':')
                .ok_or_else(|| Error::Config(format!("Expected label:count, got '{}'", part)))?;
            let count = count
                .trim()
                .parse::<u32>()
                .map_err(|e| Error::Config(format!("Bad count in '{}': {}", part, e)))?;
            Ok(ExerciseSegment::new(label.trim(), count))
        })
        .collect()
}

fn cmd_count(labels: &Path, pipeline: &str, fps: Option<f32>, config: &Config) -> Result<()> {
    let segments = parse_pipeline(pipeline)?;
    if segments.is_empty() {
        return Err(Error::Config("Pipeline is empty".into()));
    }
    let mut pipeline = ExercisePipeline::new(segments);

    let catalog = ExerciseCatalog::new().with_key_moments(&config.recognition.key_moments);
    let unknown = catalog.validate(pipeline.segments().iter().map(|s| s.label.as_str()));
    for label in &unknown {
        eprintln!("Warning: no key moment for '{}', it will never count", label);
    }

    let fps = fps.unwrap_or(config.recognition.fps);
    let mut counter = RepetitionCounter::new(catalog.key_moments().clone(), fps);
    println!(
        "Counting {} repetitions ({} frames per label at {:.0} fps)",
        pipeline.total(),
        counter.required_frames(),
        fps
    );

    let file = std::fs::File::open(labels)?;
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let label = line.trim();
        let label = (!label.is_empty()).then_some(label);

        let Some(pose) = counter.step(label) else {
            continue;
        };
        let Some(current) = pipeline.current_segment().map(|s| s.label.clone()) else {
            break;
        };
        if pose != current {
            tracing::debug!("Ignoring '{}' while counting '{}'", pose, current);
            continue;
        }

        pipeline.advance();
        println!(
            "Repetition {}/{}: {} (line {})",
            pipeline.completed_actions(),
            pipeline.total(),
            pose,
            index + 1
        );
        if pipeline.is_finished() {
            break;
        }
    }

    println!(
        "Progress: {:.0}% ({}/{})",
        pipeline.progress() * 100.0,
        pipeline.completed_actions(),
        pipeline.total()
    );
    match pipeline.current_segment() {
        Some(segment) => println!(
            "Current: {} ({} left)",
            segment.label,
            pipeline.actions_left_for_current()
        ),
        None => println!("Workout complete"),
    }
    Ok(())
}

fn cmd_proof(batch: &Path, token: &str) -> Result<()> {
    let contents = std::fs::read_to_string(batch)?;
    let body: BatchBody = serde_json::from_str(&contents)?;
    println!("{}", body.proof(token)?);
    Ok(())
}

/// One recorded frame
#[derive(Deserialize)]
struct RecordedFrame {
    points: Vec<PosePoint>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default = "default_width")]
    width: u32,
    #[serde(default = "default_height")]
    height: u32,
}

fn default_width() -> u32 {
    640
}

fn default_height() -> u32 {
    480
}

fn read_frames(path: &Path) -> Result<Vec<RecordedFrame>> {
    let file = std::fs::File::open(path)?;
    let mut frames = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        frames.push(serde_json::from_str(&line)?);
    }
    Ok(frames)
}

/// Recorded labels only matter when repetitions are counted locally
fn classifier_for(mode: RecognitionMode, labels: Vec<Option<String>>) -> Box<dyn FrameClassifier> {
    match mode {
        RecognitionMode::OnDevice => Box::new(ScriptedClassifier::new(labels)),
        RecognitionMode::Remote => Box::new(NullClassifier),
    }
}

async fn cmd_replay(jwt: &str, frames: &Path, config: Config) -> Result<()> {
    let frames = read_frames(frames)?;
    let labels: Vec<Option<String>> = frames.iter().map(|f| f.label.clone()).collect();
    let frame_interval = Duration::from_secs_f32(1.0 / config.recognition.fps.max(1.0));
    let settle_timeout = Duration::from_secs(config.server.request_timeout_secs)
        + config.delivery.backoff() * config.delivery.max_attempts;

    let classifier = classifier_for(config.recognition.mode, labels);
    let api = Arc::new(HttpWorkoutApi::new(&config.server, jwt)?);
    let connector = Arc::new(WsConnector::new(&config.server.ws_url));
    let mut session = SessionOrchestrator::new(
        config,
        api,
        connector,
        classifier,
        Arc::new(TracingHooks),
    );

    session.initialize().await;
    let state = session.wait_while_loading().await;
    if state == SessionState::Running {
        println!(
            "Workout {} started: {} repetitions",
            session.workout_id().unwrap_or_default(),
            session.pipeline().total()
        );

        for frame in frames {
            if session.state().is_terminal() {
                break;
            }
            let meta = FrameMeta::new(frame.width, frame.height);
            if session.process_frame(frame.points, meta).await == FrameOutcome::Repetition {
                println!(
                    "Repetition: {:.0}% done",
                    session.progress() * 100.0
                );
            }
            tokio::time::sleep(frame_interval).await;
        }

        if session.pipeline().is_finished() {
            if tokio::time::timeout(settle_timeout, session.settle())
                .await
                .is_err()
            {
                eprintln!("Timed out waiting for the final upload");
            }
        } else {
            session.pump();
        }
    }

    if let Some(detail) = session.error_detail() {
        eprintln!("{}: {}", detail.title, detail.description);
    }
    println!("{}", serde_json::to_string_pretty(&session.report())?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pipeline() {
        let segments = parse_pipeline("squat:3, lunge:2").unwrap();
        assert_eq!(
            segments,
            vec![ExerciseSegment::new("squat", 3), ExerciseSegment::new("lunge", 2)]
        );
    }

    #[test]
    fn test_parse_pipeline_rejects_garbage() {
        assert!(parse_pipeline("squat").is_err());
        assert!(parse_pipeline("squat:many").is_err());
    }

    #[tokio::test]
    async fn test_remote_replay_ignores_recorded_labels() {
        let labels = vec![Some("squat_down".to_string())];
        let frame = FrameSnapshot {
            frame_id: 1,
            points: Vec::new(),
        };

        let mut remote = classifier_for(RecognitionMode::Remote, labels.clone());
        assert_eq!(remote.classify("squat", &frame).await, None);

        let mut on_device = classifier_for(RecognitionMode::OnDevice, labels);
        assert_eq!(
            on_device.classify("squat", &frame).await.as_deref(),
            Some("squat_down")
        );
    }
}
