use sqlx::{postgres::PgPoolOptions, PgPool};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

use crate::{
    api::{handler::AppState, WebhookNotifier},
    clock::{Clock, SystemClock},
    config::{Config, StoreBackend},
    deposit::DepositVerificationService,
    error::AppResult,
    execution::{HttpRefundSubmitter, RefundSubmitter},
    explorer::{BlockfrostClient, LedgerQueryClient},
    ledger::{memory::InMemoryDepositStore, repository::{DepositStore, PgDepositStore}},
    monitor::DepositMonitor,
};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn initialize_app_state(config: &Config) -> AppResult<AppState> {
    info!("Initializing application components ...");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Persistence
    let store: Arc<dyn DepositStore> = match config.store_backend {
        StoreBackend::Postgres => {
            let pool = initialize_database(&config.database_url).await?;
            Arc::new(PgDepositStore::new(pool))
        }
        StoreBackend::Memory => {
            warn!("⚠️  STORE_BACKEND=memory - processed markers and checkpoint are lost on restart");
            Arc::new(InMemoryDepositStore::new())
        }
    };

    // Upstream services
    let explorer: Arc<dyn LedgerQueryClient> = Arc::new(BlockfrostClient::new(config.explorer_config())?);
    info!("✅ Ledger explorer client ready: {}", config.explorer_url);

    let submitter: Arc<dyn RefundSubmitter> =
        Arc::new(HttpRefundSubmitter::new(config.refund_service_config())?);
    info!("✅ Refund submitter ready: {}", config.refund_service_url);

    // Monitor
    let monitor = Arc::new(
        DepositMonitor::new(
            config.monitor_config(),
            explorer.clone(),
            submitter,
            store.clone(),
            clock.clone(),
        )
        .await?,
    );

    match &config.webhook_url {
        Some(url) if !url.is_empty() => {
            let notifier = WebhookNotifier::new(url.clone(), WEBHOOK_TIMEOUT)?;
            // Registered for the life of the process
            let _subscription = monitor.register_listener(notifier.into_listener());
            info!("✅ Transfer webhook registered: {}", url);
        }
        _ => info!("No WEBHOOK_URL set - transfer events are only logged"),
    }

    let verification = Arc::new(DepositVerificationService::new(
        store,
        explorer,
        monitor.verifier(),
        clock,
        monitor.config().verification_config(),
    ));

    info!("✓ Application state initialized");

    Ok(AppState {
        monitor,
        verification,
    })
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured: 10 max connections");

    // Run migrations
    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
