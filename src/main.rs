//! Guidelink CLI entry point
//!
//! Small operations tool around the guider client: query engine status,
//! start/stop guiding, dither, pause/resume, star selection, calibration
//! management and a live guide-step watcher. Intended for bench testing an
//! engine setup and for scripting; imaging hosts embed the library instead.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use guidelink::config::{self, ConfigLoader};
use guidelink::{CommandChannel, CommandEnvelope, Guider, GuiderConfig, GuiderError, Notification};

/// Response timeout for the one-shot status queries.
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Autoguiding engine client
#[derive(Parser)]
#[command(name = "glink")]
#[command(version, about = "Autoguiding engine client")]
struct Cli {
    /// Path to the profile file (defaults to the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Engine host, overriding the profile
    #[arg(long, global = true)]
    host: Option<String>,

    /// Engine port, overriding the profile
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

/// Available subcommands for the glink CLI
#[derive(Subcommand)]
enum Commands {
    /// Query the engine's current state and pixel scale
    Status,

    /// Start guiding and wait until the engine reports guiding
    Guide {
        /// Force a new calibration before guiding
        #[arg(long)]
        force_calibration: bool,
    },

    /// Stop capture and wait until the engine reports stopped
    Stop,

    /// Dither and wait for the guider to re-settle
    Dither {
        /// Dither amount in pixels (defaults to the profile value)
        #[arg(long)]
        amount: Option<f64>,

        /// Dither in right ascension only
        #[arg(long)]
        ra_only: bool,
    },

    /// Pause guiding
    Pause,

    /// Resume guiding
    Resume,

    /// Auto-select a guide star
    FindStar,

    /// Clear the engine's calibration data
    ClearCalibration,

    /// Stream guide steps until interrupted
    Watch,

    /// Manage the profile file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Actions for the `config` subcommand.
#[derive(Subcommand)]
enum ConfigAction {
    /// Create a default profile file
    Init {
        /// Overwrite an existing profile
        #[arg(long)]
        force: bool,
    },
    /// Show the profile file path
    Path,
    /// Validate the profile file
    Validate,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        // Profile management must work before a loadable profile exists.
        Commands::Config { action } => run_config(action, cli.config.as_deref()),
        command => {
            let config =
                match load_config(cli.config.as_deref(), cli.host.as_deref(), cli.port) {
                    Ok(config) => config,
                    Err(e) => {
                        eprintln!("Config error: {}", e);
                        return ExitCode::FAILURE;
                    }
                };
            run_command(command, config).await
        }
    }
}

/// Dispatches one non-config subcommand against a loaded profile.
async fn run_command(command: Commands, config: GuiderConfig) -> ExitCode {
    match command {
        Commands::Status => run_status(&config).await,
        Commands::Guide { force_calibration } => {
            run_workflow(config, Workflow::Guide { force_calibration }).await
        }
        Commands::Stop => run_workflow(config, Workflow::Stop).await,
        Commands::Dither { amount, ra_only } => {
            let amount = amount.unwrap_or(config.dither_amount);
            let ra_only = ra_only || config.dither_ra_only;
            run_workflow(config, Workflow::Dither { amount, ra_only }).await
        }
        Commands::Pause => run_workflow(config, Workflow::Pause(true)).await,
        Commands::Resume => run_workflow(config, Workflow::Pause(false)).await,
        Commands::FindStar => run_workflow(config, Workflow::FindStar).await,
        Commands::ClearCalibration => run_workflow(config, Workflow::ClearCalibration).await,
        Commands::Watch => run_watch(config).await,
        Commands::Config { .. } => unreachable!("handled before profile loading"),
    }
}

/// Loads the profile, applying CLI host/port overrides.
fn load_config(
    path: Option<&std::path::Path>,
    host: Option<&str>,
    port: Option<u16>,
) -> Result<GuiderConfig, guidelink::ConfigError> {
    let mut config = match path {
        Some(path) => ConfigLoader::load_from_path(path)?,
        None => ConfigLoader::load_default()?,
    };
    if let Some(host) = host {
        config.host = host.to_string();
    }
    if let Some(port) = port {
        config.port = port;
    }
    Ok(config)
}

/// Cancels the token on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling");
            token.cancel();
        }
    });
}

/// One-shot engine queries over the command channel; no session needed.
async fn run_status(config: &GuiderConfig) -> ExitCode {
    let channel = CommandChannel::new(&config.host, config.port);

    let state = match channel
        .send(&CommandEnvelope::get_app_state(), STATUS_TIMEOUT)
        .await
    {
        Ok(response) => response
            .result
            .as_ref()
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        Err(e) => {
            eprintln!("Engine not reachable at {}: {}", channel.endpoint(), e);
            return ExitCode::FAILURE;
        }
    };

    let scale = match channel
        .send(&CommandEnvelope::get_pixel_scale(), STATUS_TIMEOUT)
        .await
    {
        Ok(response) => response.result.as_ref().and_then(serde_json::Value::as_f64),
        Err(_) => None,
    };

    println!("Guiding Engine");
    println!("  Endpoint:    {}", channel.endpoint());
    println!("  State:       {}", state);
    match scale {
        Some(scale) => println!("  Pixel scale: {:.3}\"/px", scale),
        None => println!("  Pixel scale: unknown"),
    }
    ExitCode::SUCCESS
}

/// A workflow selected on the command line.
enum Workflow {
    Guide { force_calibration: bool },
    Stop,
    Dither { amount: f64, ra_only: bool },
    Pause(bool),
    FindStar,
    ClearCalibration,
}

/// Connects, runs one workflow with Ctrl-C cancellation, disconnects.
async fn run_workflow(config: GuiderConfig, workflow: Workflow) -> ExitCode {
    let guider = Guider::new(config);
    if let Err(e) = guider.connect().await {
        eprintln!("Connect failed: {}", e);
        return ExitCode::FAILURE;
    }

    let token = CancellationToken::new();
    cancel_on_ctrl_c(token.clone());

    let result = match workflow {
        Workflow::Guide { force_calibration } => guider
            .start_guiding(force_calibration, &token)
            .await
            .map(|()| "guiding".to_string()),
        Workflow::Stop => guider
            .stop_guiding(&token)
            .await
            .map(|()| "stopped".to_string()),
        Workflow::Dither { amount, ra_only } => guider
            .dither(amount, ra_only, &token)
            .await
            .map(|()| format!("dithered {:.1} px", amount)),
        Workflow::Pause(pause) => guider
            .pause(pause, &token)
            .await
            .map(|()| if pause { "paused" } else { "resumed" }.to_string()),
        Workflow::FindStar => guider
            .auto_select_guide_star(&token)
            .await
            .map(|found| format!("star selection {}", if found { "done" } else { "failed" })),
        Workflow::ClearCalibration => guider.clear_calibration(&token).await.map(|cleared| {
            if cleared {
                "calibration cleared".to_string()
            } else {
                "engine refused to clear calibration".to_string()
            }
        }),
    };

    guider.disconnect().await;

    match result {
        Ok(message) => {
            println!("{}", message);
            ExitCode::SUCCESS
        }
        Err(GuiderError::Cancelled) => {
            println!("cancelled");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Connects and prints guide steps until Ctrl-C.
async fn run_watch(config: GuiderConfig) -> ExitCode {
    let guider = Guider::new(config);
    if let Err(e) = guider.connect().await {
        eprintln!("Connect failed: {}", e);
        return ExitCode::FAILURE;
    }

    let mut rx = guider.subscribe();
    let token = CancellationToken::new();
    cancel_on_ctrl_c(token.clone());

    println!("watching guide steps, Ctrl-C to stop");
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            notification = rx.recv() => match notification {
                Ok(Notification::GuideStep(step)) => {
                    println!(
                        "frame {:>6}  dx {:+.2}  dy {:+.2}  ra {:+.2}  dec {:+.2}  snr {:.1}",
                        step.frame.map(|f| f.to_string()).unwrap_or_else(|| "?".to_string()),
                        step.dx,
                        step.dy,
                        step.ra_distance_raw,
                        step.dec_distance_raw,
                        step.snr,
                    );
                }
                Ok(Notification::ConnectionLost) => {
                    eprintln!("connection to engine lost");
                    return ExitCode::FAILURE;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(count)) => {
                    eprintln!("lagged, skipped {} notifications", count);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    guider.disconnect().await;
    ExitCode::SUCCESS
}

/// Handles the `config` subcommand.
fn run_config(action: ConfigAction, override_path: Option<&std::path::Path>) -> ExitCode {
    let path = override_path
        .map(std::path::Path::to_path_buf)
        .unwrap_or_else(config::config_path);

    match action {
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                eprintln!(
                    "Profile already exists at {} (use --force to overwrite)",
                    path.display()
                );
                return ExitCode::FAILURE;
            }
            if let Some(parent) = path.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    eprintln!("Failed to create {}: {}", parent.display(), e);
                    return ExitCode::FAILURE;
                }
            }
            let toml = toml::to_string_pretty(&GuiderConfig::default())
                .expect("failed to serialize default GuiderConfig");
            if let Err(e) = std::fs::write(&path, toml) {
                eprintln!("Failed to write {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
            println!("Created profile at {}", path.display());
            ExitCode::SUCCESS
        }
        ConfigAction::Path => {
            println!("{}", path.display());
            ExitCode::SUCCESS
        }
        ConfigAction::Validate => match ConfigLoader::load_from_path(&path) {
            Ok(config) => {
                println!("Profile is valid");
                println!("{:#?}", config);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Profile error: {}", e);
                ExitCode::FAILURE
            }
        },
    }
}
