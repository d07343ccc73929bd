use asura::{Config, Pipeline, Store};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = Config::from_env();
    let store = match Store::new(&cfg.database_path) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("failed to open database {}: {e}", cfg.database_path);
            std::process::exit(1);
        }
    };
    info!("database ready at {}", cfg.database_path);

    let (handle, mut events) = Pipeline::start(&cfg, store);

    // The notifier collaborator consumes this stream; until one is
    // attached, surface events in the log.
    let drain = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            info!("event {} for monitor {}", event.event_type.as_str(), event.monitor_id);
        }
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("signal wait failed: {e}");
    }
    info!("shutting down");
    handle.shutdown().await;
    drain.abort();
}
