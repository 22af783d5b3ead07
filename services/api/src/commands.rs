use crate::infra::{build_pipeline, build_stamper};
use clap::Args;
use form_dispatch::config::{AppConfig, DocumentConfig, TelemetryConfig};
use form_dispatch::error::AppError;
use form_dispatch::telemetry;
use form_dispatch::workflows::fulfillment::{
    idempotency_key, BatchQueue, BatchStore, QueueError, Submission, WebhookPayload,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Args, Debug)]
pub(crate) struct ProcessArgs {
    /// JSON file holding a webhook body (`{"records": [...]}`)
    #[arg(long)]
    pub(crate) payload: PathBuf,
    /// Idempotency key; defaults to a digest of the file contents
    #[arg(long)]
    pub(crate) key: Option<String>,
}

#[derive(Args, Debug)]
pub(crate) struct StampArgs {
    /// Serial number to print on the form
    #[arg(long)]
    pub(crate) serial: String,
    /// URL of the QR code image to embed
    #[arg(long)]
    pub(crate) qr_url: String,
    /// Directory the stamped PDF is written to
    #[arg(long, default_value = ".")]
    pub(crate) out_dir: PathBuf,
}

pub(crate) async fn run_process(args: ProcessArgs) -> Result<(), AppError> {
    let ProcessArgs { payload, key } = args;

    let config = AppConfig::load()?;
    telemetry::init(&config.telemetry)?;

    let body = std::fs::read(&payload)?;
    let delivery = WebhookPayload::from_slice(&body)?;
    let key = idempotency_key(key.as_deref(), &body);

    let pipeline = Arc::new(build_pipeline(&config).await?);
    let store = BatchStore::open(&config.queue.directory)?;
    let queue = BatchQueue::detached(store, pipeline);

    let record = match queue.accept(&key, delivery.records)? {
        Submission::Enqueued(batch_id) => queue.process_now(&batch_id).await?,
        Submission::Duplicate(batch_id) => {
            println!("Payload already accepted as batch {batch_id}; showing stored state.");
            queue
                .status(&batch_id)?
                .ok_or(QueueError::NotFound(batch_id))?
        }
    };

    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

pub(crate) async fn run_stamp(args: StampArgs) -> Result<(), AppError> {
    let StampArgs {
        serial,
        qr_url,
        out_dir,
    } = args;

    telemetry::init(&TelemetryConfig::from_env()?)?;
    let documents = DocumentConfig::from_env()?;
    let stamper = build_stamper(&documents)?;

    std::fs::create_dir_all(&out_dir)?;
    let document = stamper
        .stamp(Some(&serial), Some(&qr_url), &out_dir)
        .await?;

    info!(serial_number = %document.serial_number, path = ?document.path, "stamped form written");
    println!("Stamped serial {} -> {}", serial, document.path.display());
    Ok(())
}
