use clap::Parser;
use node_labeler::{Config, Engine};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path of the controllers engine configuration
    #[arg(short, long, default_value = "config/config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        warn!("A rustls crypto provider was already installed");
    }

    let config = Config::load(&args.config)?;
    let engine = Engine::from_config(&config).await?;

    engine.start();

    tokio::signal::ctrl_c().await?;
    info!("Got interrupt signal, shutting down the controllers gracefully...");

    engine.stop().await;
    Ok(())
}
