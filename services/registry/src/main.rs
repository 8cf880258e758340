//! OCI registry server.

use std::net::SocketAddr;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use eyre::WrapErr as _;
use registry::{RegistryBuilder, RegistryConfig, UploadManager};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about = "Serve an OCI registry")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<Utf8PathBuf>,

    /// Address to listen on, overriding the configuration
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

async fn load(path: &Utf8Path) -> eyre::Result<RegistryConfig> {
    let text = tokio::fs::read_to_string(path)
        .await
        .wrap_err_with(|| format!("reading {path}"))?;
    toml_edit::de::from_str(&text).wrap_err_with(|| format!("parsing {path}"))
}

async fn purge(uploads: UploadManager, every: Duration, max_age: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if let Err(error) = uploads.purge_abandoned(max_age).await {
            tracing::warn!(%error, "purging abandoned uploads failed");
        }
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => load(path).await?,
        None => RegistryConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    let storage = config
        .storage
        .clone()
        .build()
        .await
        .wrap_err("configuring storage")?;
    let sessions = config
        .sessions
        .store
        .clone()
        .build()
        .await
        .wrap_err("configuring session store")?;

    let uploads = RegistryBuilder::new()
        .storage(storage)
        .sessions(sessions)
        .session_ttl(config.sessions.ttl())
        .into_manager();

    tokio::spawn(purge(
        uploads.clone(),
        config.sessions.purge_interval(),
        config.sessions.abandoned_after(),
    ));

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .wrap_err_with(|| format!("binding {}", config.listen))?;
    tracing::info!(addr = %config.listen, "OCI registry listening");

    axum::serve(listener, registry::router(uploads)).await?;
    Ok(())
}
