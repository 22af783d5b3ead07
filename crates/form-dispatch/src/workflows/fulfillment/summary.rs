use std::path::Path;

use tracing::warn;

use super::domain::{serial_ordinal, SummaryRow};

pub const SUMMARY_HEADERS: [&str; 2] = ["Serial Number", "Google Drive Link"];
pub const MISSING_VALUE: &str = "N/A";

#[derive(Debug, thiserror::Error)]
pub enum SummaryError {
    #[error("unable to write summary table: {0}")]
    Csv(#[from] csv::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serial number / link table sent to an applicant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryTable {
    email: String,
    rows: Vec<SummaryRow>,
}

impl SummaryTable {
    /// Rows are sorted by numeric serial; ties keep their input order.
    pub fn from_rows(email: impl Into<String>, mut rows: Vec<SummaryRow>) -> Self {
        rows.sort_by_key(|row| row.serial_number.as_deref().map(serial_ordinal).unwrap_or(0));
        Self {
            email: email.into(),
            rows,
        }
    }

    /// Rendered cells, serials prefixed with `'` so spreadsheets keep them as text.
    pub fn records(&self) -> Vec<[String; 2]> {
        self.rows
            .iter()
            .map(|row| {
                if row.serial_number.is_none() || row.link.is_none() {
                    warn!(
                        email = %self.email,
                        serial_number = ?row.serial_number,
                        link = ?row.link,
                        "summary row is missing data"
                    );
                }

                let serial = row
                    .serial_number
                    .as_deref()
                    .map(|serial| format!("'{serial}"))
                    .unwrap_or_else(|| MISSING_VALUE.to_string());
                let link = row
                    .link
                    .clone()
                    .unwrap_or_else(|| MISSING_VALUE.to_string());
                [serial, link]
            })
            .collect()
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), SummaryError> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(SUMMARY_HEADERS)?;
        for record in self.records() {
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}
