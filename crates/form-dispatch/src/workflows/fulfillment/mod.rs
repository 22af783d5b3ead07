//! Application form fulfillment: stamp a personalised copy of the form for
//! every record, publish it, record the link in the tracker, then send each
//! applicant one merged PDF with a CSV index of their links.

pub mod domain;
pub mod drive;
pub mod grouping;
pub mod merging;
pub mod naming;
pub mod notify;
pub mod pipeline;
pub mod queue;
pub mod report;
pub mod router;
pub mod stamping;
pub mod summary;
pub mod tracker;

#[cfg(test)]
mod tests;

pub use domain::{
    ApplicantGroup, ApplicationRecord, BatchId, PayloadError, StampedDocument, SummaryRow,
    WebhookPayload, PHONE_NOT_PROVIDED,
};
pub use drive::{DocumentStore, GoogleDriveStore, StoreError};
pub use grouping::group_by_email;
pub use merging::{DocumentMerger, MergeError, MergedDocument};
pub use naming::SerialFileNames;
pub use notify::{ApplicantMessage, EmailTemplate, Notifier, NotifyError, SmtpNotifier};
pub use pipeline::{FulfillmentPipeline, PipelineError, MERGED_FILE_NAME, SUMMARY_FILE_NAME};
pub use queue::{
    idempotency_key, BatchQueue, BatchRecord, BatchStatus, BatchStore, QueueError, Submission,
};
pub use report::{BatchReport, GroupReport, RecordReport, StepOutcome};
pub use router::{webhook_router, WebhookState, IDEMPOTENCY_HEADER};
pub use stamping::{DocumentStamper, HttpQrCodeSource, QrCodeSource, StampError};
pub use summary::{SummaryError, SummaryTable};
pub use tracker::{AirtableTracker, RatePacer, RatePolicy, TrackerError, TrackerGateway};
