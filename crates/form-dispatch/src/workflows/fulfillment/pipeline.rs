use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use tracing::{error, info, warn};

use super::domain::{ApplicantGroup, ApplicationRecord, BatchId, StampedDocument, SummaryRow};
use super::drive::DocumentStore;
use super::grouping::group_by_email;
use super::merging::DocumentMerger;
use super::notify::{ApplicantMessage, Notifier};
use super::report::{BatchReport, GroupReport, RecordReport, StepOutcome};
use super::stamping::DocumentStamper;
use super::summary::SummaryTable;
use super::tracker::TrackerGateway;

pub const MERGED_FILE_NAME: &str = "merged_output.pdf";
pub const SUMMARY_FILE_NAME: &str = "merged_records.csv";

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("unable to prepare workspace under {path:?}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Stamp → upload → track per record, then merge → summarize → notify per applicant.
#[derive(Debug)]
pub struct FulfillmentPipeline {
    stamper: DocumentStamper,
    merger: DocumentMerger,
    store: Arc<dyn DocumentStore>,
    tracker: Arc<dyn TrackerGateway>,
    notifier: Arc<dyn Notifier>,
    work_root: PathBuf,
}

struct GroupProgress {
    documents: Vec<StampedDocument>,
    rows: Vec<SummaryRow>,
    records: Vec<RecordReport>,
}

impl FulfillmentPipeline {
    pub fn new(
        stamper: DocumentStamper,
        store: Arc<dyn DocumentStore>,
        tracker: Arc<dyn TrackerGateway>,
        notifier: Arc<dyn Notifier>,
        work_root: impl Into<PathBuf>,
    ) -> Self {
        let merger = DocumentMerger::new(stamper.names().clone());
        Self {
            stamper,
            merger,
            store,
            tracker,
            notifier,
            work_root: work_root.into(),
        }
    }

    /// Process one delivery. Files live in a temp directory removed on return.
    pub async fn run(
        &self,
        batch_id: &BatchId,
        records: Vec<ApplicationRecord>,
    ) -> Result<BatchReport, PipelineError> {
        let records_received = records.len();
        let groups = group_by_email(records);
        let grouped: usize = groups.iter().map(|group| group.records.len()).sum();
        let records_without_email = records_received - grouped;
        if records_without_email > 0 {
            warn!(%batch_id, records_without_email, "dropping records without an email");
        }

        std::fs::create_dir_all(&self.work_root).map_err(|source| PipelineError::Workspace {
            path: self.work_root.clone(),
            source,
        })?;
        let workspace = tempfile::Builder::new()
            .prefix(&format!("batch-{batch_id}-"))
            .tempdir_in(&self.work_root)
            .map_err(|source| PipelineError::Workspace {
                path: self.work_root.clone(),
                source,
            })?;

        info!(%batch_id, records_received, applicants = groups.len(), "processing batch");

        let mut reports = Vec::with_capacity(groups.len());
        for (index, group) in groups.into_iter().enumerate() {
            let dir = applicant_dir(&workspace, index)?;
            reports.push(self.process_group(batch_id, group, &dir).await);
        }

        info!(%batch_id, "batch processed");
        Ok(BatchReport {
            batch_id: batch_id.clone(),
            records_received,
            records_without_email,
            groups: reports,
        })
    }

    async fn process_group(
        &self,
        batch_id: &BatchId,
        group: ApplicantGroup,
        dir: &Path,
    ) -> GroupReport {
        let ApplicantGroup {
            email,
            phone_number,
            records,
        } = group;

        let mut progress = GroupProgress {
            documents: Vec::new(),
            rows: Vec::new(),
            records: Vec::with_capacity(records.len()),
        };
        for record in &records {
            self.process_record(&email, record, dir, &mut progress).await;
        }

        let mut report = GroupReport {
            email: email.clone(),
            phone_number: phone_number.clone(),
            records: progress.records,
            merge: StepOutcome::skipped("not reached"),
            merged_pages: 0,
            summary: StepOutcome::skipped("not reached"),
            notification: StepOutcome::skipped("not reached"),
        };

        if progress.documents.is_empty() {
            warn!(%batch_id, email = %email, "skipping applicant: no valid documents generated");
            let reason = "no valid documents generated";
            report.merge = StepOutcome::skipped(reason);
            report.summary = StepOutcome::skipped(reason);
            report.notification = StepOutcome::skipped(reason);
            return report;
        }

        let merged_path = dir.join(MERGED_FILE_NAME);
        let paths: Vec<PathBuf> = progress
            .documents
            .iter()
            .map(|document| document.path.clone())
            .collect();
        match self.merger.merge(&paths, &merged_path) {
            Ok(merged) => {
                report.merge = StepOutcome::Succeeded;
                report.merged_pages = merged.page_count;
            }
            Err(err) => {
                error!(%batch_id, email = %email, error = %err, "failed to merge documents");
                report.merge = StepOutcome::failed(&err);
                return report;
            }
        }

        let summary_path = dir.join(SUMMARY_FILE_NAME);
        let table = SummaryTable::from_rows(email.clone(), progress.rows);
        match table.write_csv(&summary_path) {
            Ok(()) => report.summary = StepOutcome::Succeeded,
            Err(err) => {
                error!(%batch_id, email = %email, error = %err, "failed to write summary table");
                report.summary = StepOutcome::failed(&err);
                return report;
            }
        }

        let message = ApplicantMessage {
            recipient: email.clone(),
            phone_number,
            merged_pdf: merged_path,
            summary_csv: summary_path,
        };
        report.notification = match self.notifier.send(message).await {
            Ok(()) => {
                info!(%batch_id, email = %email, "applicant notified");
                StepOutcome::Succeeded
            }
            Err(err) => {
                error!(%batch_id, email = %email, error = %err, "failed to notify applicant");
                StepOutcome::failed(&err)
            }
        };

        report
    }

    async fn process_record(
        &self,
        email: &str,
        record: &ApplicationRecord,
        dir: &Path,
        progress: &mut GroupProgress,
    ) {
        let serial_number = record.serial_label().to_string();
        let mut report =
            RecordReport::pending(record.serial_number.clone(), record.record_id.clone());

        let document = match self
            .stamper
            .stamp(
                record.serial_number.as_deref(),
                record.qr_code_url.as_deref(),
                dir,
            )
            .await
        {
            Ok(document) => document,
            Err(err) => {
                error!(email, serial_number, error = %err, "failed to stamp document");
                report.stamp = StepOutcome::failed(&err);
                progress.records.push(report);
                return;
            }
        };
        report.stamp = StepOutcome::Succeeded;

        let remote_name = self.stamper.names().file_name(&document.serial_number);
        let link = match self.store.publish(&document.path, &remote_name).await {
            Ok(link) => {
                report.upload = StepOutcome::Succeeded;
                Some(link)
            }
            Err(err) => {
                error!(email, serial_number, error = %err, "failed to upload document");
                report.upload = StepOutcome::failed(&err);
                None
            }
        };

        report.tracker = match (&link, record.record_id.as_deref()) {
            (None, _) => StepOutcome::skipped("no shareable link"),
            (Some(_), None) => StepOutcome::skipped("record has no tracker id"),
            (Some(link), Some(record_id)) => match self.tracker.mark_shared(record_id, link).await {
                Ok(()) => StepOutcome::Succeeded,
                Err(err) => {
                    error!(email, serial_number, record_id, error = %err, "failed to update tracker");
                    StepOutcome::failed(&err)
                }
            },
        };

        report.link = link.clone();
        progress.rows.push(SummaryRow {
            serial_number: record.serial_number.clone(),
            link,
        });
        progress.documents.push(document);
        progress.records.push(report);
    }
}

fn applicant_dir(workspace: &TempDir, index: usize) -> Result<PathBuf, PipelineError> {
    let dir = workspace.path().join(format!("applicant-{index:04}"));
    std::fs::create_dir(&dir).map_err(|source| PipelineError::Workspace {
        path: dir.clone(),
        source,
    })?;
    Ok(dir)
}
