use mimalloc::MiMalloc;
use tracing::{info, warn};
use vod_archiver::config::AppConfig;
use vod_archiver::database;
use vod_archiver::logging::init_logging;
use vod_archiver::services::ServiceContainer;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::load()?;
    let (logging, _guard) = init_logging(&config.log_dir)?;

    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;

    let mut container = ServiceContainer::new(pool, config)?;
    logging.start_retention_cleanup(container.cancellation_token());
    container.start();
    info!("vod-archiver started");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    let report = container.shutdown().await;
    if !report.all_graceful() {
        warn!(
            crashed = report.crashed,
            forced = report.forced_terminations,
            "Some jobs did not stop cleanly"
        );
    }
    Ok(())
}
