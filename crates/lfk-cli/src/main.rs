//! LFK CLI
//!
//! Main entry point for logging in, browsing exercises, and streaming an
//! exercise session to the analysis service.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use lfk_stream::{
    ApiClient, Config, FeedbackPayload, FileFrame, FrameSource, SessionContext, SessionEvent,
    SessionOrchestrator, SessionSummary, StaticFrame, FINGER_COUNT,
};
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

/// LFK - Hand Exercise Streaming Client
///
/// Streams frames to the LFK analysis service and shows live feedback and
/// exercise progress.
#[derive(Parser, Debug)]
#[command(name = "lfk")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (default: lfk.json in current directory)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<String>,

    /// Analysis service host, e.g. "127.0.0.1:8080" (overrides config)
    #[arg(long, value_name = "HOST", global = true)]
    host: Option<String>,

    /// Enable verbose output (sets log level to debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in and print a token
    Login {
        /// Account email
        #[arg(long)]
        email: String,

        /// Account password
        #[arg(long)]
        password: String,
    },

    /// List the exercise catalog
    Exercises {
        /// Bearer token from `lfk login`
        #[arg(long)]
        token: String,
    },

    /// Stream an exercise session
    Stream {
        /// Bearer token from `lfk login`
        #[arg(long)]
        token: String,

        /// Exercise to stream (fist, fist-index, fist-palm)
        #[arg(short, long)]
        exercise: Option<String>,

        /// Image file sent as every frame (default: a placeholder payload)
        #[arg(long, value_name = "FILE")]
        frame: Option<PathBuf>,

        /// Stop after this many seconds (default: until Ctrl+C)
        #[arg(short, long, value_name = "SECS")]
        duration: Option<u64>,

        /// Print raw JSON events instead of the progress board
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if args.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(config = ?args.config, "Config file");

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.host = host;
    }
    config.validate()?;

    match args.command {
        Command::Login { email, password } => login(&config, &email, &password).await,
        Command::Exercises { token } => list_exercises(&config, &token).await,
        Command::Stream {
            token,
            exercise,
            frame,
            duration,
            json,
        } => {
            let exercise = exercise.unwrap_or_else(|| config.default_exercise.to_string());
            let context = SessionContext::new(token, &exercise)?;
            let options = StreamOptions {
                duration: duration.map(Duration::from_secs),
                json,
            };
            let orchestrator = SessionOrchestrator::new(config);
            match frame {
                Some(path) => stream(&orchestrator, context, FileFrame::new(path), options).await,
                None => stream(&orchestrator, context, StaticFrame::dummy(), options).await,
            }
        }
    }
}

/// Loads configuration from the specified path or default location.
fn load_config(config_path: Option<&str>) -> anyhow::Result<Config> {
    match config_path {
        Some(path_str) => {
            let path = Path::new(path_str);
            if !path.exists() {
                anyhow::bail!(
                    "Config file not found: '{}'\n\nSuggestion: Check the path or remove the --config flag to use defaults",
                    path.display()
                );
            }
            Ok(Config::load_from_file(path)?)
        }
        None => Ok(Config::load()?),
    }
}

async fn login(config: &Config, email: &str, password: &str) -> anyhow::Result<()> {
    let client = ApiClient::new(&config.api_base_url);
    let response = client.login(email, password).await?;

    println!("Logged in as {} <{}>", response.user.username, response.user.email);
    println!("Token: {}", response.token);
    Ok(())
}

async fn list_exercises(config: &Config, token: &str) -> anyhow::Result<()> {
    let client = ApiClient::new(&config.api_base_url);
    let exercises = client.exercises(token).await?;

    if exercises.is_empty() {
        println!("No exercises available");
        return Ok(());
    }
    for exercise in &exercises {
        if exercise.description.is_empty() {
            println!("{}", exercise.name);
        } else {
            println!("{}  {}", exercise.name, exercise.description);
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct StreamOptions {
    duration: Option<Duration>,
    json: bool,
}

/// Streams until Ctrl+C, the duration elapses, or the channel ends.
async fn stream<S: FrameSource>(
    orchestrator: &SessionOrchestrator,
    context: SessionContext,
    source: S,
    options: StreamOptions,
) -> anyhow::Result<()> {
    let exercise = context.exercise();
    let (session, mut events) = orchestrator.start_with_channel(context, source)?;
    if !options.json {
        println!("Streaming {exercise} (Ctrl+C to stop)");
    }

    let deadline = async {
        match options.duration {
            Some(d) => sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let mut failure = None;
    loop {
        tokio::select! {
            Ok(()) = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C, stopping session");
                break;
            }
            () = &mut deadline => {
                tracing::info!("Duration elapsed, stopping session");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                print_event(&event, options.json)?;
                if let SessionEvent::Error(payload) = &event {
                    if payload.fatal {
                        failure = Some(payload.message.clone());
                        break;
                    }
                }
                if matches!(event, SessionEvent::Closed(_)) {
                    break;
                }
            }
        }
    }

    let summary = session.stop().await;
    if options.json {
        println!("{}", serde_json::to_string(&summary)?);
    } else {
        println!();
        println!("{}", render_summary(&summary));
    }

    match failure {
        Some(message) => anyhow::bail!("{message}"),
        None => Ok(()),
    }
}

fn print_event(event: &SessionEvent, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }
    match event {
        SessionEvent::Connected(payload) => println!("Connected to {}", payload.endpoint),
        SessionEvent::Feedback(payload) => {
            println!();
            println!("{}", render_feedback(payload));
        }
        SessionEvent::Error(payload) if payload.fatal => {
            tracing::error!(kind = %payload.kind, "{}", payload.message);
        }
        SessionEvent::Error(payload) => {
            tracing::warn!(kind = %payload.kind, "{}", payload.message);
        }
        SessionEvent::Closed(payload) => {
            println!("Connection closed ({}): {}", payload.code, payload.reason);
        }
    }
    Ok(())
}

/// Renders one feedback message with the progress board.
fn render_feedback(payload: &FeedbackPayload) -> String {
    let feedback = &payload.feedback;
    let progress = &payload.progress;

    let fingers: String = feedback
        .finger_states
        .iter()
        .map(|raised| if *raised { '●' } else { '○' })
        .collect();

    let mut lines = vec![
        format!(
            "hand: {} | fingers: {}/{FINGER_COUNT} {fingers}",
            if feedback.hand_detected { "yes" } else { "no" },
            feedback.raised_fingers,
        ),
        format!("message: {}", feedback.message),
    ];

    if let (Some(current), Some(total)) = (progress.current_cycle, progress.total_cycles) {
        let mut line = format!("cycle {current}/{total}");
        if let Some(countdown) = progress.countdown {
            line.push_str(&format!(" | countdown {countdown}s"));
        }
        lines.push(line);
    }

    for step in &progress.steps {
        lines.push(format!("{} {}", step.marker.glyph(), step.label));
    }

    lines.join("\n")
}

/// Renders the end-of-session summary.
fn render_summary(summary: &SessionSummary) -> String {
    let frames = &summary.frames;
    [
        "=== LFK Session Summary ===".to_string(),
        format!("Exercise: {}", summary.exercise),
        format!("Final state: {}", summary.final_state),
        format!(
            "Feedback: {} received, {} malformed",
            summary.feedback_received, summary.decode_errors
        ),
        format!(
            "Frames: {} sent, {} dropped (busy), {} skipped (not open), {} failed",
            frames.sent,
            frames.dropped_busy,
            frames.skipped_not_open,
            frames.encode_failures + frames.send_failures
        ),
    ]
    .join("\n")
}
