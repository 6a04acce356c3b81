pub mod config;
pub mod models;
pub mod db;
pub mod ledger; // payment/appointment reconciliation engine
pub mod invoicing; // pending-payments summary for invoice emission

use tracing_subscriber::EnvFilter;

/// Initialize tracing for the host process.
///
/// The desktop shell calls this once at startup, before opening the
/// database. Respects RUST_LOG when set.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();

    tracing::info!("{} core v{}", config::APP_NAME, config::APP_VERSION);
}
