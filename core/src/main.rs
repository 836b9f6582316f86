/// chatsync - command line front end for the chat synchronization engine
use chatsync_core::{ChatEngine, Config};
use std::env;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn"))
        )
        .with_writer(std::io::stderr)
        .init();

    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let (mut config, rest) = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    if config.data_dir.is_none() && !args.iter().any(|a| a == "--in-memory") {
        config.data_dir = Some(".chatsync".into());
    }
    debug!("Using config {:?}", config);

    let engine = ChatEngine::open(config)
        .map_err(|e| anyhow::anyhow!("Failed to open store: {}", e))?;

    chatsync_core::cli_app::run(&engine, &rest).await
}
