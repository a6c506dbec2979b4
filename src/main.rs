//! lexbridge server entry point.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use lexbridge::api::{self, AppState};
use lexbridge::config::{Config, ServiceConfig};
use lexbridge::connectors::{
    Connector, Connectors, LexofficeConnector, PaperlessConnector,
};
use lexbridge::engine::{Dispatcher, Executor, RateLimiter};
use lexbridge::storage::SqliteStorage;
use lexbridge::sync::ContactReconciler;
use lexbridge::triggers::Scheduler;
use lexbridge::workflow::ServiceKind;
use lexbridge::Result;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::var("LEXBRIDGE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("lexbridge.toml"));
    let mut config = Config::load(Some(&config_path))?;

    let storage = SqliteStorage::open(&config.storage.path())?;
    info!(path = %config.storage.path().display(), "storage opened");

    // Connector settings stored through the configuration surface take
    // precedence over the config file.
    apply_stored_connector_config(&storage, &mut config).await?;

    let retry = config.engine.retry_policy();
    let acquire_timeout = config.engine.acquire_timeout();

    let paperless: Arc<dyn Connector> = Arc::new(PaperlessConnector::new(
        &config.paperless.base_url,
        &config.paperless.api_token,
        Arc::new(RateLimiter::new(
            ServiceKind::Paperless,
            config.paperless.rate_limit(),
        )),
        retry.clone(),
        acquire_timeout,
    )?);
    let lexoffice: Arc<dyn Connector> = Arc::new(LexofficeConnector::new(
        &config.lexoffice.base_url,
        &config.lexoffice.api_token,
        Arc::new(RateLimiter::new(
            ServiceKind::Lexoffice,
            config.lexoffice.rate_limit(),
        )),
        retry,
        acquire_timeout,
    )?);
    let connectors = Connectors {
        paperless: paperless.clone(),
        lexoffice: lexoffice.clone(),
    };

    let executor = Arc::new(
        Executor::new(connectors, storage.clone())
            .with_timeout(config.engine.execution_timeout()),
    );
    let dispatcher = Dispatcher::new(storage.clone(), executor);

    let mut scheduler = Scheduler::new(storage.clone(), dispatcher.clone()).await?;
    if config.sync.enabled {
        let reconciler = Arc::new(ContactReconciler::new(
            paperless,
            lexoffice,
            storage.clone(),
        ));
        scheduler = scheduler.with_reconciliation(reconciler, &config.sync.schedule);
    }
    scheduler.start().await?;

    let state = AppState {
        dispatcher: Arc::new(dispatcher),
        storage,
    };
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "listening");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.stop().await?;
    info!("shut down cleanly");
    Ok(())
}

/// Overlay active connector configuration rows from storage onto the
/// file-based defaults.
async fn apply_stored_connector_config(
    storage: &SqliteStorage,
    config: &mut Config,
) -> Result<()> {
    for service in [ServiceKind::Paperless, ServiceKind::Lexoffice] {
        if let Some(stored) = storage.get_connector_config(service).await? {
            if !stored.active {
                continue;
            }
            let target: &mut ServiceConfig = match service {
                ServiceKind::Paperless => &mut config.paperless,
                ServiceKind::Lexoffice => &mut config.lexoffice,
            };
            target.base_url = stored.base_url;
            target.api_token = stored.api_token;
            info!(%service, "applied stored connector configuration");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
