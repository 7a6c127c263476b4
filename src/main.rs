use deposit_monitor::{bootstrap, config::Config, server};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,deposit_monitor=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("🛑 Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env before anything reads the environment
    dotenv::dotenv().ok();
    init_tracing();

    info!("🚀 Starting deposit monitor");

    let config = Config::from_env()?;
    info!("Watching deposit address {}", config.deposit_address);

    let state = bootstrap::initialize_app_state(&config).await?;
    let monitor = state.monitor.clone();

    if config.monitor_autostart {
        monitor.start();
    } else {
        info!("MONITOR_AUTOSTART=false - start polling via POST /api/v1/monitor/start");
    }

    // Create HTTP server
    let app = server::create_app(state);

    // Run the Server
    server::run_server(app, &config.bind_address, shutdown_signal()).await?;

    monitor.stop();
    info!("👋 Deposit monitor shut down");

    Ok(())
}
