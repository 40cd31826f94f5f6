use clap::Parser;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use precheck_server::config::Config;
use precheck_server::runtime::{ContainerRuntime, DockerCli};
use precheck_server::scheduler::orphan;
use precheck_server::server::Server;
use precheck_server::shutdown::install_shutdown_handler;
use precheck_server::PrecheckError;

#[derive(Parser, Debug)]
#[command(name = "precheck-server")]
#[command(version)]
#[command(about = "Queue and run layout prechecks in containers")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the API server and scheduler
    Serve {
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Remove containers left behind by a previous session
    Cleanup {
        #[command(flatten)]
        config: ConfigArgs,

        /// Only list what would be removed
        #[arg(long)]
        dry_run: bool,
    },

    /// Show storage, budget and container status
    Status {
        #[command(flatten)]
        config: ConfigArgs,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

#[derive(Parser, Debug)]
struct ConfigArgs {
    /// Configuration file path
    #[arg(long = "config", short = 'c', default_value = "config.toml")]
    path: PathBuf,
}

#[derive(Serialize)]
struct StatusOutput {
    storage_path: String,
    max_concurrent: usize,
    image: String,
    container_prefix: String,
    containers_total: usize,
    containers_running: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match args.command {
        Commands::Serve { config } => run_serve(&config.path).await?,
        Commands::Cleanup { config, dry_run } => run_cleanup(&config.path, dry_run).await?,
        Commands::Status { config, json } => run_status(&config.path, json).await?,
    }

    Ok(())
}

async fn run_serve(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(path)?;
    tracing::info!(
        config = %path.display(),
        storage = %config.server.storage_path.display(),
        max_concurrent = config.server.max_concurrent,
        image = %config.docker.image,
        "Starting precheck server"
    );

    let shutdown = CancellationToken::new();
    install_shutdown_handler(shutdown.clone())?;

    match Server::new(config).run(shutdown).await {
        Ok(()) => Ok(()),
        Err(PrecheckError::ConfigurationConflict(orphans)) => {
            eprintln!("Error: Found {} orphaned containers:", orphans.len());
            for name in &orphans {
                eprintln!("  - {}", name);
            }
            eprintln!();
            eprintln!("Run 'precheck-server cleanup' first");
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}

async fn run_cleanup(path: &Path, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(path)?;
    let runtime = DockerCli::new(config.docker.clone());

    let orphans: Vec<String> = orphan::find_orphans(&runtime, &Default::default())
        .await?
        .into_iter()
        .map(|c| c.name)
        .collect();
    if orphans.is_empty() {
        println!("No orphaned containers found");
        return Ok(());
    }

    println!("Found {} orphaned containers:", orphans.len());
    for name in &orphans {
        println!("  - {}", name);
    }

    if dry_run {
        println!("\nDry run - no changes made");
        return Ok(());
    }

    let removed = orphan::cleanup(&runtime, &Default::default(), config.docker.stop_timeout()).await?;
    println!("\nRemoved {} containers", removed.len());
    Ok(())
}

async fn run_status(path: &Path, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(path)?;
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerCli::new(config.docker.clone()));
    let containers = runtime.list_managed().await?;

    let output = StatusOutput {
        storage_path: config.server.storage_path.display().to_string(),
        max_concurrent: config.server.max_concurrent,
        image: config.docker.image.clone(),
        container_prefix: config.docker.container_prefix.clone(),
        containers_total: containers.len(),
        containers_running: containers.iter().filter(|c| c.is_running()).count(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("Storage path:    {}", output.storage_path);
        println!("Max concurrent:  {}", output.max_concurrent);
        println!("Image:           {}", output.image);
        println!("Prefix:          {}", output.container_prefix);
        println!(
            "Containers:      {} ({} running)",
            output.containers_total, output.containers_running
        );
    }
    Ok(())
}
