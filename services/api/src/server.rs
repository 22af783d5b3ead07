use crate::cli::ServeArgs;
use crate::infra::{build_pipeline, AppState};
use crate::routes::with_service_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use form_dispatch::config::AppConfig;
use form_dispatch::error::AppError;
use form_dispatch::telemetry;
use form_dispatch::workflows::fulfillment::{webhook_router, BatchQueue, BatchStore, WebhookState};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, warn};

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let pipeline = Arc::new(build_pipeline(&config).await?);
    let store = BatchStore::open(&config.queue.directory)?;
    let (queue, _worker) = BatchQueue::spawn(store, pipeline)?;
    let webhook = WebhookState::new(config.webhook.api_key.clone(), queue, config.webhook.mode);

    let app = with_service_routes(webhook_router(webhook))
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(
        ?config.environment,
        %addr,
        mode = ?config.webhook.mode,
        queue = ?config.queue.directory,
        "form dispatch service ready"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("form dispatch service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "unable to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested; unfinished batches resume on next start");
}
