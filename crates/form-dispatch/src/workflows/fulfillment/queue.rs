//! File-backed batch queue.
//!
//! Every accepted delivery is written to disk before the webhook answers, so a
//! restart re-runs whatever was queued or in flight. Processing is therefore
//! at-least-once; the idempotency key only guards against repeated deliveries.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::domain::{ApplicationRecord, BatchId};
use super::pipeline::{FulfillmentPipeline, PipelineError};
use super::report::BatchReport;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue storage failed at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to encode batch {batch_id}: {source}")]
    Encode {
        batch_id: BatchId,
        #[source]
        source: serde_json::Error,
    },
    #[error("corrupt batch file {path:?}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("batch {0} not found")]
    NotFound(BatchId),
    #[error("batch worker has stopped")]
    WorkerStopped,
    #[error("batch {batch_id} task aborted: {reason}")]
    Aborted { batch_id: BatchId, reason: String },
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BatchStatus {
    Queued,
    Processing,
    Completed,
    Failed { reason: String },
}

impl BatchStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Queued | Self::Processing)
    }
}

/// Persisted state of one webhook delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub batch_id: BatchId,
    pub received_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: BatchStatus,
    pub records: Vec<ApplicationRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<BatchReport>,
}

impl BatchRecord {
    pub(crate) fn queued(batch_id: BatchId, records: Vec<ApplicationRecord>) -> Self {
        let now = Utc::now();
        Self {
            batch_id,
            received_at: now,
            updated_at: now,
            status: BatchStatus::Queued,
            records,
            report: None,
        }
    }

    pub(crate) fn transition(&mut self, status: BatchStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Outcome of handing a delivery to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    Enqueued(BatchId),
    Duplicate(BatchId),
}

impl Submission {
    pub fn batch_id(&self) -> &BatchId {
        match self {
            Self::Enqueued(id) | Self::Duplicate(id) => id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

/// Key used to detect repeated deliveries: the caller's header when present,
/// otherwise a digest of the raw body.
pub fn idempotency_key(header: Option<&str>, body: &[u8]) -> String {
    match header.map(str::trim).filter(|value| !value.is_empty()) {
        Some(value) => value.to_string(),
        None => hex::encode(Sha256::digest(body)),
    }
}

/// JSON files under `batches/` plus one marker per idempotency key under `keys/`.
#[derive(Debug, Clone)]
pub struct BatchStore {
    root: PathBuf,
}

impl BatchStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let store = Self { root: root.into() };
        for dir in [store.batches_dir(), store.keys_dir()] {
            fs::create_dir_all(&dir).map_err(|source| QueueError::Io { path: dir, source })?;
        }
        Ok(store)
    }

    fn batches_dir(&self) -> PathBuf {
        self.root.join("batches")
    }

    fn keys_dir(&self) -> PathBuf {
        self.root.join("keys")
    }

    fn batch_path(&self, batch_id: &BatchId) -> PathBuf {
        self.batches_dir().join(format!("{batch_id}.json"))
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.keys_dir().join(hex::encode(Sha256::digest(key.as_bytes())))
    }

    pub fn save(&self, record: &BatchRecord) -> Result<(), QueueError> {
        let bytes = serde_json::to_vec_pretty(record).map_err(|source| QueueError::Encode {
            batch_id: record.batch_id.clone(),
            source,
        })?;
        write_atomically(&self.batches_dir(), &self.batch_path(&record.batch_id), &bytes)
    }

    /// Remove a batch that was never acknowledged.
    pub fn discard(&self, batch_id: &BatchId) -> Result<(), QueueError> {
        let path = self.batch_path(batch_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(QueueError::Io { path, source }),
        }
    }

    pub fn load(&self, batch_id: &BatchId) -> Result<Option<BatchRecord>, QueueError> {
        read_record(&self.batch_path(batch_id))
    }

    /// Batch previously registered under `key`, if its record still exists.
    pub fn lookup_key(&self, key: &str) -> Result<Option<BatchId>, QueueError> {
        let path = self.key_path(key);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(QueueError::Io { path, source }),
        };
        let Some(batch_id) = BatchId::parse(raw.trim()) else {
            warn!(?path, "ignoring unreadable idempotency marker");
            return Ok(None);
        };
        Ok(self.batch_path(&batch_id).exists().then_some(batch_id))
    }

    pub fn register_key(&self, key: &str, batch_id: &BatchId) -> Result<(), QueueError> {
        write_atomically(
            &self.keys_dir(),
            &self.key_path(key),
            batch_id.to_string().as_bytes(),
        )
    }

    /// Queued or interrupted batches, oldest first.
    pub fn pending(&self) -> Result<Vec<BatchRecord>, QueueError> {
        let dir = self.batches_dir();
        let entries = fs::read_dir(&dir).map_err(|source| QueueError::Io {
            path: dir.clone(),
            source,
        })?;

        let mut pending = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| QueueError::Io {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match read_record(&path) {
                Ok(Some(record)) if record.status.is_pending() => pending.push(record),
                Ok(_) => {}
                Err(err) => warn!(error = %err, "skipping unreadable batch file"),
            }
        }
        pending.sort_by_key(|record| record.received_at);
        Ok(pending)
    }
}

fn read_record(path: &Path) -> Result<Option<BatchRecord>, QueueError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(QueueError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| QueueError::Decode {
            path: path.to_path_buf(),
            source,
        })
}

fn write_atomically(dir: &Path, target: &Path, bytes: &[u8]) -> Result<(), QueueError> {
    let io_error = |source| QueueError::Io {
        path: target.to_path_buf(),
        source,
    };
    let mut file = NamedTempFile::new_in(dir).map_err(io_error)?;
    file.write_all(bytes).map_err(io_error)?;
    file.as_file().sync_all().map_err(io_error)?;
    file.persist(target).map_err(|err| io_error(err.error))?;
    Ok(())
}

#[derive(Debug)]
struct BatchWorker {
    store: BatchStore,
    pipeline: Arc<FulfillmentPipeline>,
}

impl BatchWorker {
    async fn process(&self, batch_id: &BatchId) -> Result<BatchRecord, QueueError> {
        let mut record = self
            .store
            .load(batch_id)?
            .ok_or_else(|| QueueError::NotFound(batch_id.clone()))?;
        if !record.status.is_pending() {
            info!(%batch_id, "batch already settled");
            return Ok(record);
        }

        record.transition(BatchStatus::Processing);
        self.store.save(&record)?;

        // A panic inside the pipeline must settle this batch, not the worker.
        let pipeline = Arc::clone(&self.pipeline);
        let task_id = batch_id.clone();
        let records = record.records.clone();
        let run = tokio::spawn(async move { pipeline.run(&task_id, records).await });

        match run.await {
            Ok(Ok(report)) => {
                info!(
                    %batch_id,
                    delivered = report.delivered_records(),
                    notified = report.notified_applicants(),
                    failed_steps = report.failed_steps(),
                    "batch completed"
                );
                record.report = Some(report);
                record.transition(BatchStatus::Completed);
            }
            Ok(Err(err)) => {
                error!(%batch_id, error = %err, "batch failed");
                record.transition(BatchStatus::Failed {
                    reason: err.to_string(),
                });
            }
            Err(err) => {
                error!(%batch_id, error = %err, "batch task aborted");
                record.transition(BatchStatus::Failed {
                    reason: format!("batch task aborted: {err}"),
                });
            }
        }
        self.store.save(&record)?;
        Ok(record)
    }
}

/// Persist-then-acknowledge queue drained by a single background worker.
#[derive(Debug, Clone)]
pub struct BatchQueue {
    worker: Arc<BatchWorker>,
    sender: mpsc::UnboundedSender<BatchId>,
    submit_lock: Arc<Mutex<()>>,
}

impl BatchQueue {
    /// Start the worker and re-enqueue anything left pending by a previous run.
    pub fn spawn(
        store: BatchStore,
        pipeline: Arc<FulfillmentPipeline>,
    ) -> Result<(Self, JoinHandle<()>), QueueError> {
        let recovered = store.pending()?;
        let worker = Arc::new(BatchWorker { store, pipeline });
        let (sender, mut receiver) = mpsc::unbounded_channel::<BatchId>();

        for record in recovered {
            warn!(batch_id = %record.batch_id, status = ?record.status, "re-enqueueing unfinished batch");
            sender
                .send(record.batch_id)
                .map_err(|_| QueueError::WorkerStopped)?;
        }

        let task_worker = Arc::clone(&worker);
        let handle = tokio::spawn(async move {
            while let Some(batch_id) = receiver.recv().await {
                if let Err(err) = task_worker.process(&batch_id).await {
                    error!(%batch_id, error = %err, "batch worker error");
                }
            }
            info!("batch worker stopped");
        });

        Ok((
            Self {
                worker,
                sender,
                submit_lock: Arc::new(Mutex::new(())),
            },
            handle,
        ))
    }

    /// Queue without a background worker: batches run only through
    /// [`Self::process_now`] and nothing is recovered on construction.
    pub fn detached(store: BatchStore, pipeline: Arc<FulfillmentPipeline>) -> Self {
        let (sender, _) = mpsc::unbounded_channel();
        Self {
            worker: Arc::new(BatchWorker { store, pipeline }),
            sender,
            submit_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Persist the delivery and hand it to the background worker.
    pub fn submit(
        &self,
        key: &str,
        records: Vec<ApplicationRecord>,
    ) -> Result<Submission, QueueError> {
        self.admit(key, records, |batch_id| {
            self.sender
                .send(batch_id.clone())
                .map_err(|_| QueueError::WorkerStopped)
        })
    }

    /// Persist the delivery without scheduling it; pair with [`Self::process_now`].
    pub fn accept(
        &self,
        key: &str,
        records: Vec<ApplicationRecord>,
    ) -> Result<Submission, QueueError> {
        self.admit(key, records, |_| Ok(()))
    }

    /// The idempotency key is registered only once `schedule` succeeded, so a
    /// delivery that could not be scheduled is not mistaken for a duplicate.
    fn admit<F>(
        &self,
        key: &str,
        records: Vec<ApplicationRecord>,
        schedule: F,
    ) -> Result<Submission, QueueError>
    where
        F: Fn(&BatchId) -> Result<(), QueueError>,
    {
        let _guard = self
            .submit_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let store = &self.worker.store;

        if let Some(existing) = store.lookup_key(key)? {
            let Some(mut record) = store.load(&existing)? else {
                return Err(QueueError::NotFound(existing));
            };
            if !matches!(record.status, BatchStatus::Failed { .. }) {
                info!(batch_id = %existing, "duplicate delivery ignored");
                return Ok(Submission::Duplicate(existing));
            }

            warn!(batch_id = %existing, status = ?record.status, "re-queueing failed batch");
            let previous = record.clone();
            record.report = None;
            record.transition(BatchStatus::Queued);
            store.save(&record)?;
            if let Err(err) = schedule(&existing) {
                store.save(&previous)?;
                return Err(err);
            }
            return Ok(Submission::Enqueued(existing));
        }

        let record = BatchRecord::queued(BatchId::generate(), records);
        store.save(&record)?;
        if let Err(err) = schedule(&record.batch_id) {
            store.discard(&record.batch_id)?;
            return Err(err);
        }
        store.register_key(key, &record.batch_id)?;
        info!(batch_id = %record.batch_id, records = record.records.len(), "batch accepted");
        Ok(Submission::Enqueued(record.batch_id))
    }

    /// Run a batch on its own task and wait for it. Dropping the returned
    /// future does not cancel the batch.
    pub async fn process_now(&self, batch_id: &BatchId) -> Result<BatchRecord, QueueError> {
        let worker = Arc::clone(&self.worker);
        let task_id = batch_id.clone();
        tokio::spawn(async move { worker.process(&task_id).await })
            .await
            .map_err(|err| QueueError::Aborted {
                batch_id: batch_id.clone(),
                reason: err.to_string(),
            })?
    }

    pub fn status(&self, batch_id: &BatchId) -> Result<Option<BatchRecord>, QueueError> {
        self.worker.store.load(batch_id)
    }
}
