use serde::{Deserialize, Serialize};

use super::domain::BatchId;

/// Result of one pipeline step for a record or applicant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    Skipped { reason: String },
    Failed { reason: String },
}

impl StepOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }

    pub fn failed(reason: impl ToString) -> Self {
        Self::Failed {
            reason: reason.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordReport {
    pub serial_number: Option<String>,
    pub record_id: Option<String>,
    pub stamp: StepOutcome,
    pub upload: StepOutcome,
    pub tracker: StepOutcome,
    pub link: Option<String>,
}

impl RecordReport {
    pub(crate) fn pending(serial_number: Option<String>, record_id: Option<String>) -> Self {
        let not_reached = || StepOutcome::skipped("not reached");
        Self {
            serial_number,
            record_id,
            stamp: not_reached(),
            upload: not_reached(),
            tracker: not_reached(),
            link: None,
        }
    }

    /// A record counts as delivered when its page made it into the merge.
    pub fn delivered(&self) -> bool {
        self.stamp.is_success()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupReport {
    pub email: String,
    pub phone_number: String,
    pub records: Vec<RecordReport>,
    pub merge: StepOutcome,
    pub merged_pages: usize,
    pub summary: StepOutcome,
    pub notification: StepOutcome,
}

/// Per-batch account of what happened to every record and applicant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub batch_id: BatchId,
    pub records_received: usize,
    pub records_without_email: usize,
    pub groups: Vec<GroupReport>,
}

impl BatchReport {
    pub fn delivered_records(&self) -> usize {
        self.groups
            .iter()
            .flat_map(|group| group.records.iter())
            .filter(|record| record.delivered())
            .count()
    }

    pub fn notified_applicants(&self) -> usize {
        self.groups
            .iter()
            .filter(|group| group.notification.is_success())
            .count()
    }

    pub fn failed_steps(&self) -> usize {
        let is_failure = |outcome: &StepOutcome| matches!(outcome, StepOutcome::Failed { .. });
        self.groups
            .iter()
            .map(|group| {
                let record_failures: usize = group
                    .records
                    .iter()
                    .map(|record| {
                        [&record.stamp, &record.upload, &record.tracker]
                            .into_iter()
                            .filter(|outcome| is_failure(*outcome))
                            .count()
                    })
                    .sum();
                let group_failures = [&group.merge, &group.summary, &group.notification]
                    .into_iter()
                    .filter(|outcome| is_failure(*outcome))
                    .count();
                record_failures + group_failures
            })
            .sum()
    }
}
