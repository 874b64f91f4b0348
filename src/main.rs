use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mediaconv::client::{receive_file, upload, MediaClient};
use mediaconv::config::{AppConfig, DEFAULT_CONFIG_FILE};
use mediaconv::protocol::{Operation, DEFAULT_BITRATE};
use mediaconv::server;
use mediaconv::startup::StartupValidator;
use mediaconv::transfer::Progress;

#[derive(Parser)]
#[command(name = "mediaconv")]
#[command(about = "Encrypted media conversion server and client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true, help = "Config file path")]
    config: Option<PathBuf>,

    #[arg(long, global = true, help = "Output as JSON")]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the conversion server
    Serve {
        #[arg(long, help = "Listen address (overrides config)")]
        listen: Option<String>,
        #[arg(long, help = "Work directory (overrides config)")]
        work_dir: Option<PathBuf>,
    },
    /// Upload a file and download the converted result
    Upload {
        file: PathBuf,
        #[arg(long, help = "Server address (overrides config)")]
        server: Option<String>,
        #[arg(long, help = "Download directory (overrides config)")]
        output_dir: Option<PathBuf>,
        #[command(subcommand)]
        operation: OperationArg,
    },
    /// Validate the work directory and the ffmpeg installation
    Check,
    GenerateConfig {
        #[arg(long, default_value = DEFAULT_CONFIG_FILE, help = "Config file path")]
        output: PathBuf,
    },
}

#[derive(Subcommand)]
enum OperationArg {
    Compress {
        #[arg(long, default_value = DEFAULT_BITRATE)]
        bitrate: String,
    },
    Resize {
        #[arg(long, value_name = "W:H")]
        resolution: String,
    },
    AspectRatio {
        #[arg(long, value_name = "W/H")]
        ratio: String,
    },
    ExtractAudio,
    Gif {
        #[arg(long, help = "Start time in seconds")]
        start: f64,
        #[arg(long, help = "Clip length in seconds")]
        duration: f64,
        #[arg(long)]
        fps: Option<u32>,
    },
}

fn parse_pair(value: &str, sep: char) -> Result<(u32, u32)> {
    let (a, b) = value
        .split_once(sep)
        .with_context(|| format!("expected W{}H, got `{}`", sep, value))?;
    let a: u32 = a
        .trim()
        .parse()
        .with_context(|| format!("invalid width in `{}`", value))?;
    let b: u32 = b
        .trim()
        .parse()
        .with_context(|| format!("invalid height in `{}`", value))?;
    if a == 0 || b == 0 {
        bail!("dimensions in `{}` must be positive", value);
    }
    Ok((a, b))
}

impl OperationArg {
    fn into_operation(self) -> Result<Operation> {
        Ok(match self {
            OperationArg::Compress { bitrate } => Operation::Compress { bitrate },
            OperationArg::Resize { resolution } => {
                let (width, height) = parse_pair(&resolution, ':')?;
                Operation::Resize { width, height }
            }
            OperationArg::AspectRatio { ratio } => {
                let (width, height) = parse_pair(&ratio, '/')?;
                Operation::AspectRatio { width, height }
            }
            OperationArg::ExtractAudio => Operation::ExtractAudio,
            OperationArg::Gif { start, duration, fps } => Operation::Gif {
                start_time: start,
                duration,
                fps,
            },
        })
    }
}

fn transfer_bar(total: u64, label: &str) -> Result<ProgressBar> {
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40}] {bytes}/{total_bytes} ({eta}) {msg}")?,
    );
    bar.set_message(label.to_string());
    Ok(bar)
}

async fn run_upload(client: MediaClient, file: &Path, operation: Operation) -> Result<PathBuf> {
    let file_size = tokio::fs::metadata(file)
        .await
        .with_context(|| format!("reading {:?}", file))?
        .len();
    let mut transport = client.connect().await?;

    let up = transfer_bar(file_size, "uploading")?;
    let report_up = |done: u64, _total: u64| up.set_position(done);
    let chunk_size = client.config().chunk_size;
    upload(&mut transport, file, operation, chunk_size, Some(&report_up as Progress)).await?;
    up.finish_with_message("uploaded");

    let spinner = ProgressBar::new_spinner();
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message("Processing on server");

    let down = transfer_bar(0, "downloading")?;
    down.set_draw_target(ProgressDrawTarget::hidden());
    let report_down = |done: u64, total: u64| {
        if down.is_hidden() {
            spinner.finish_and_clear();
            down.set_draw_target(ProgressDrawTarget::stderr());
        }
        down.set_length(total);
        down.set_position(done);
    };
    let download_dir = &client.config().download_dir;
    let response_timeout = client.config().response_timeout();
    let result = receive_file(
        &mut transport,
        download_dir,
        response_timeout,
        Some(&report_down as Progress),
    )
    .await;
    spinner.finish_and_clear();
    down.finish_with_message("downloaded");
    Ok(result?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mediaconv=info")),
        )
        .init();

    let cli = Cli::parse();

    if let Commands::GenerateConfig { output } = &cli.command {
        AppConfig::default().save(output)?;
        if cli.json {
            let summary = serde_json::json!({
                "success": true,
                "config_file": output,
                "message": "Default configuration file created"
            });
            println!("{}", summary);
        } else {
            println!("⚙️  Default configuration saved to: {}", output.display());
        }
        return Ok(());
    }

    let mut config = AppConfig::load_or_create(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { listen, work_dir } => {
            if let Some(listen) = listen {
                config.server.listen_address = listen;
            }
            if let Some(work_dir) = work_dir {
                config.server.work_dir = work_dir;
            }
            config.server.ensure_directories()?;

            match StartupValidator::new(&config.server).validate().await {
                Ok(report) => info!("Using {}", report.ffmpeg_version),
                Err(e) => warn!("Startup validation failed, jobs may fail: {:#}", e),
            }
            info!("Starting mediaconv server on {}", config.server.listen_address);
            server::run(config.server).await
        }
        Commands::Upload {
            file,
            server,
            output_dir,
            operation,
        } => {
            if let Some(server) = server {
                config.client.server_address = server;
            }
            if let Some(output_dir) = output_dir {
                config.client.download_dir = output_dir;
            }
            let operation = operation.into_operation()?;
            let saved = run_upload(MediaClient::new(config.client), &file, operation).await?;
            if cli.json {
                println!("{}", serde_json::json!({"success": true, "result": saved}));
            } else {
                println!("✅ Result saved to {}", saved.display());
            }
            Ok(())
        }
        Commands::Check => {
            config.server.ensure_directories()?;
            match StartupValidator::new(&config.server).validate().await {
                Ok(report) => {
                    if cli.json {
                        let summary = serde_json::json!({
                            "status": "passed",
                            "work_dir": report.work_dir,
                            "ffmpeg": report.ffmpeg_version
                        });
                        println!("{}", summary);
                    } else {
                        println!("✅ Check passed");
                        println!("   Work directory: {}", report.work_dir.display());
                        println!("   {}", report.ffmpeg_version);
                    }
                    Ok(())
                }
                Err(e) => {
                    if cli.json {
                        println!("{}", serde_json::json!({"error": format!("{:#}", e)}));
                    } else {
                        eprintln!("❌ Check failed: {:#}", e);
                    }
                    Err(e)
                }
            }
        }
        Commands::GenerateConfig { .. } => Ok(()),
    }
}
