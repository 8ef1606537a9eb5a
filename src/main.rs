// src/main.rs
//! Foundry control plane - CLI entry point

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

// =============================================================================
// CLI Definitions
// =============================================================================

#[derive(Parser)]
#[command(name = "foundry")]
#[command(version)]
#[command(about = "Bare-metal provisioning control plane", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the control-plane database
    Init {
        /// Path to the database file
        #[arg(short, long, default_value = "/var/lib/foundry/foundry.db")]
        db_path: String,
    },

    /// Run the control plane: API server, run orchestrator, fact inventory,
    /// and blueprint watcher in one process
    Serve {
        /// Path to the database file
        #[arg(short, long, default_value = "/var/lib/foundry/foundry.db")]
        db_path: String,

        /// Address to bind the API server to
        #[arg(short, long, default_value = "0.0.0.0:8080")]
        bind: String,

        /// External base URL embedded in rendered boot scripts
        #[arg(long)]
        api_base: Option<String>,

        /// Blueprint/workflow tree to watch (defaults to FOUNDRY_INFRA_PATH, then ./infra)
        #[arg(long)]
        infra_path: Option<PathBuf>,

        /// Boot token lifetime in seconds
        #[arg(long, default_value_t = 300)]
        token_ttl_secs: i64,

        /// Artifact bucket (defaults to S3_BUCKET)
        #[arg(long)]
        bucket: Option<String>,
    },

    /// Bundle build and import operations
    Bundles {
        #[command(subcommand)]
        command: BundleCommands,
    },

    /// Signing key operations
    Keys {
        #[command(subcommand)]
        command: KeyCommands,
    },
}

#[derive(Subcommand)]
enum BundleCommands {
    /// Create a signed bundle from an artifacts directory
    Build {
        /// Directory containing artifacts to include
        #[arg(long)]
        artifacts_dir: PathBuf,

        /// Destination bundle file (tar.zst)
        #[arg(long)]
        output: PathBuf,

        /// Optional file listing container images to mirror
        #[arg(long)]
        images_file: Option<PathBuf>,
    },

    /// Import a signed bundle into the API and object storage
    Import {
        /// Path to the bundle tar.zst
        #[arg(long)]
        file: PathBuf,

        /// Base URL of the provisioning API (e.g. https://api.example.com)
        #[arg(long)]
        api: String,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Generate an age-format secret key and matching public key
    Generate,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Commands::Init { db_path } => commands::init(&db_path),
        Commands::Serve {
            db_path,
            bind,
            api_base,
            infra_path,
            token_ttl_secs,
            bucket,
        } => {
            commands::serve(commands::ServeArgs {
                db_path,
                bind,
                api_base,
                infra_path,
                token_ttl_secs,
                bucket,
            })
            .await
        }
        Commands::Bundles { command } => match command {
            BundleCommands::Build {
                artifacts_dir,
                output,
                images_file,
            } => commands::bundles_build(artifacts_dir, output, images_file).await,
            BundleCommands::Import { file, api } => commands::bundles_import(file, api).await,
        },
        Commands::Keys { command } => match command {
            KeyCommands::Generate => commands::keys_generate(),
        },
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "foundry=info".to_string()),
    );
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
