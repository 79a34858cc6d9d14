//! Bridge entry point: load config, serve, drain on ctrl-c.

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use webssh_bridge::{BridgeConfig, BridgeServer};

// High-frequency small allocations (frames, output chunks) benefit from
// mimalloc.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => match BridgeConfig::load(&path) {
            Ok(config) => {
                info!("configuration loaded from {}", path);
                config
            }
            Err(e) => {
                error!("failed to load configuration from {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => BridgeConfig::default(),
    };

    let server = std::sync::Arc::new(BridgeServer::new(config));

    let listener = match server.bind().await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind listener: {}", e);
            std::process::exit(1);
        }
    };

    let serve_task = {
        let server = std::sync::Arc::clone(&server);
        tokio::spawn(async move { server.serve(listener).await })
    };

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received, draining sessions"),
        Err(e) => error!("failed to listen for shutdown signal: {}", e),
    }

    server.drain().await;
    let _ = serve_task.await;
    info!("bridge stopped");
}
