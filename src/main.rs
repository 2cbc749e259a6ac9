use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use statmill::api::{serve, AppState};
use statmill::capability::selftest::SelftestAnalysis;
use statmill::storage::JsonFileStore;
use statmill::types::{CapabilityDescriptor, DatasetRef, Frame};
use statmill::{AnalysisEngine, Config};

#[derive(Parser)]
#[command(name = "statmill")]
#[command(about = "Capability registry and analysis job engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP/WebSocket API server.
    Serve {
        #[arg(long, default_value_t = 8700)]
        port: u16,
        /// Persist cache entries and terminal jobs to this file.
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
    /// Submit a selftest job against an in-process engine and stream its
    /// progress to stdout.
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, snapshot } => serve_engine(port, snapshot).await?,
        Commands::Run => run_selftest().await?,
    }

    Ok(())
}

fn build_engine(snapshot: Option<PathBuf>) -> Arc<AnalysisEngine> {
    let config = Config::from_env();
    match snapshot {
        Some(path) => AnalysisEngine::with_store(config, Arc::new(JsonFileStore::new(path))),
        None => AnalysisEngine::new(config),
    }
}

async fn serve_engine(port: u16, snapshot: Option<PathBuf>) -> Result<()> {
    let engine = build_engine(snapshot);
    let recovered = engine.recover().await?;
    if recovered > 0 {
        println!("recovered {recovered} job records");
    }

    engine.install(CapabilityDescriptor::new(
        "selftest",
        "1.0.0",
        Arc::new(SelftestAnalysis::default()),
    ))?;

    serve(AppState { engine }, port).await
}

async fn run_selftest() -> Result<()> {
    let engine = build_engine(None);
    engine.install(CapabilityDescriptor::new(
        "selftest",
        "1.0.0",
        Arc::new(SelftestAnalysis::default()),
    ))?;

    let job_id = engine.submit(
        "selftest",
        serde_json::json!({ "invoked": "cli" }),
        DatasetRef::new("datasets/selftest.csv", "0000"),
        Some(Duration::from_secs(30)),
    )?;
    println!("submitted job {job_id}");

    let mut subscription = engine.subscribe(job_id, None)?;
    while let Some(frames) = subscription.next_frames().await? {
        for frame in frames {
            match frame {
                Frame::Progress {
                    percent, message, ..
                } => println!("  {percent:>3}% {message}"),
                Frame::Terminal {
                    outcome, result, ..
                } => {
                    println!("job finished: {}", outcome.as_str());
                    if let Some(result) = result {
                        println!("{}", serde_json::to_string_pretty(&result)?);
                    }
                }
                _ => {}
            }
        }
    }

    Ok(())
}
