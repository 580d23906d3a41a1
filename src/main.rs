use clap::{Parser, Subcommand};
use estate_pipeline::config::Config;
use estate_pipeline::events::EventPublisher;
use estate_pipeline::jobs::JobRegistry;
use estate_pipeline::pipeline::collaborators::default_collaborators;
use estate_pipeline::pipeline::{scheduler, Orchestrator};
use estate_pipeline::server::{start_server, AppState};
use estate_pipeline::logging;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "estate-pipeline")]
#[command(about = "Real estate scraping pipeline orchestrator")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control server and, in auto mode, the interval scheduler
    Serve {
        /// Override the configured HTTP port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run a single pipeline pass and exit
    RunOnce,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    logging::init_logging();

    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            warn!("using default configuration: {e}");
            Config::default()
        }
    };
    let config = Arc::new(config);

    let publisher = Arc::new(EventPublisher::new(Duration::from_secs(
        config.pipeline.debounce_ttl_secs,
    )));
    let registry = JobRegistry::new(config.scraping.clone(), publisher.clone());
    let collaborators = default_collaborators(&config, registry.clone())?;
    let orchestrator = Orchestrator::new(
        config.clone(),
        registry.clone(),
        publisher.clone(),
        collaborators,
    );

    match cli.command {
        Commands::Serve { port } => {
            let metrics_handle = PrometheusBuilder::new().install_recorder()?;
            scheduler::spawn(orchestrator.clone(), config.clone());

            let state = Arc::new(AppState {
                orchestrator,
                registry,
                publisher,
                metrics: Some(metrics_handle),
            });
            start_server(state, port.unwrap_or(config.server.port)).await?;
        }
        Commands::RunOnce => {
            println!("🔄 Running pipeline once...");
            let success = orchestrator.run_blocking().await;

            let snapshot = orchestrator.snapshot();
            info!("pipeline pass finished");
            println!("\n📊 Pipeline results:");
            println!("   Status: {:?}", snapshot.status);
            println!("   New ads: {}", snapshot.stats.new_ads);
            println!("   Processed ads: {}", snapshot.stats.processed_ads);
            println!("   Duplicates found: {}", snapshot.stats.duplicates_found);
            println!("   Realtors found: {}", snapshot.stats.realtors_found);
            println!("   Indexed: {}", snapshot.stats.indexed);
            for (stage, detail) in &snapshot.stage_details {
                match &detail.error {
                    Some(error) => println!("   ⚠️  {stage}: {:?} ({error})", detail.status),
                    None => println!("   {stage}: {:?}", detail.status),
                }
            }

            if !success {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
