use form_dispatch::config::{AppConfig, ConfigError, DocumentConfig};
use form_dispatch::error::AppError;
use form_dispatch::workflows::fulfillment::{
    AirtableTracker, DocumentStamper, FulfillmentPipeline, GoogleDriveStore, HttpQrCodeSource,
    SerialFileNames, SmtpNotifier,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

pub(crate) fn build_stamper(documents: &DocumentConfig) -> Result<DocumentStamper, AppError> {
    let names =
        SerialFileNames::new(documents.file_prefix.clone()).map_err(|_| ConfigError::Invalid {
            key: "APP_DOCUMENT_PREFIX",
            value: documents.file_prefix.clone(),
        })?;
    let qr_source = HttpQrCodeSource::new(documents.qr_timeout)?;
    Ok(DocumentStamper::new(
        documents.template_path.clone(),
        names,
        Box::new(qr_source),
    ))
}

/// Wire the production integrations: Drive, Airtable and SMTP.
pub(crate) async fn build_pipeline(config: &AppConfig) -> Result<FulfillmentPipeline, AppError> {
    let stamper = build_stamper(&config.documents)?;
    let store = GoogleDriveStore::from_service_account(
        &config.drive.credentials_path,
        config.drive.folder_id.clone(),
    )
    .await?;
    let tracker = AirtableTracker::from_config(&config.tracker)?;
    let notifier = SmtpNotifier::from_config(&config.mail)?;

    info!(
        template = ?config.documents.template_path,
        folder_id = %config.drive.folder_id,
        smtp_host = %config.mail.smtp_host,
        "fulfillment integrations configured"
    );

    Ok(FulfillmentPipeline::new(
        stamper,
        Arc::new(store),
        Arc::new(tracker),
        Arc::new(notifier),
        config.documents.work_dir.clone(),
    ))
}
