// src/commands.rs
//! Command implementations for the foundry CLI.

use anyhow::{Context, Result};
use foundry::bundle::{self, Signer};
use foundry::server::{self, ApiState, ServerConfig};
use foundry::{storage, Bus, Db, Ingestor, StateMachine, Watcher};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// `foundry init`
pub fn init(db_path: &str) -> Result<()> {
    if let Some(parent) = std::path::Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
    }
    Db::init(db_path).with_context(|| format!("initialize database at {db_path}"))?;
    println!("initialized database at {db_path}");
    Ok(())
}

pub struct ServeArgs {
    pub db_path: String,
    pub bind: String,
    pub api_base: Option<String>,
    pub infra_path: Option<PathBuf>,
    pub token_ttl_secs: i64,
    pub bucket: Option<String>,
}

/// `foundry serve` - the whole control plane in one process.
pub async fn serve(args: ServeArgs) -> Result<()> {
    let db = Db::init(&args.db_path)
        .with_context(|| format!("open database at {}", args.db_path))?;
    let bus = Bus::new(db.clone());

    let storage = match storage::Client::from_env() {
        Ok(client) => Some(client),
        Err(e) => {
            warn!(error = %e, "object storage disabled");
            None
        }
    };

    let api_base = args
        .api_base
        .or_else(|| std::env::var("FOUNDRY_API_BASE").ok().filter(|v| !v.is_empty()));

    let config = ServerConfig {
        bind_addr: args.bind.parse().with_context(|| format!("parse bind address {}", args.bind))?,
        api_base,
        token_ttl: chrono::Duration::seconds(args.token_ttl_secs),
        artifact_bucket: args.bucket.unwrap_or_default(),
    };

    let state = Arc::new(ApiState::new(db.clone(), bus.clone(), storage, config)?);

    let mut orchestrator = StateMachine::new(db.clone(), bus.clone());
    orchestrator.start().await?;

    let mut ingestor = Ingestor::new(db.clone(), bus.clone());
    ingestor.start().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let watcher = Watcher::new(bus.clone(), args.infra_path, None);
    let watcher_task = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { watcher.run(shutdown).await })
    };

    let server_task = {
        let state = Arc::clone(&state);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { server::run_server(state, shutdown).await })
    };

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining");

    let _ = shutdown_tx.send(true);

    // Reverse order: stop accepting requests, then drain the workers.
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "server exited with error"),
        Err(e) => warn!(error = %e, "server task join failed"),
    }
    ingestor.close().await;
    orchestrator.close().await;
    match watcher_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "watcher exited with error"),
        Err(e) => warn!(error = %e, "watcher task join failed"),
    }

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// `foundry bundles build`
pub async fn bundles_build(
    artifacts_dir: PathBuf,
    output: PathBuf,
    images_file: Option<PathBuf>,
) -> Result<()> {
    let signer = Signer::from_env()?;
    let config = bundle::BuildConfig {
        artifacts_dir,
        images_file,
        output: output.clone(),
    };

    let manifest = tokio::task::spawn_blocking(move || bundle::build(&config, &signer))
        .await
        .context("bundle build task failed")??;

    println!(
        "wrote bundle {} ({} artifacts)",
        output.display(),
        manifest.artifacts.len()
    );
    Ok(())
}

/// `foundry bundles import`
pub async fn bundles_import(file: PathBuf, api: String) -> Result<()> {
    let signer = Signer::from_env()?;
    let storage = storage::Client::from_env().context("object storage client")?;

    let manifest = bundle::import(
        &bundle::ImportConfig {
            bundle_path: file,
            api_base: api,
        },
        &signer,
        &storage,
    )
    .await?;

    println!(
        "imported bundle signed at {} ({} artifacts)",
        manifest.created_at.to_rfc3339(),
        manifest.artifacts.len()
    );
    Ok(())
}

/// `foundry keys generate`
pub fn keys_generate() -> Result<()> {
    let (secret, public) = bundle::signer::generate_key();
    println!("AGE_SECRET_KEY={secret}");
    println!("AGE_PUBLIC_KEY={public}");
    Ok(())
}
