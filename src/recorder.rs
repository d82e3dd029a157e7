//! Outcome recorder — append-only CSV audit trail, one row per attempted
//! recipient.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RecorderError;

/// Column order of the outcome log.
pub const HEADER: &[&str] = &["timestamp", "company", "email", "subject", "result", "error_detail"];

/// Terminal result of one recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeResult {
    Sent,
    Previewed,
    Error,
}

impl OutcomeResult {
    /// SENT and PREVIEWED count against the send cap.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Sent | Self::Previewed)
    }
}

/// One row of the outcome log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "company")]
    pub company_name: String,
    pub email: String,
    pub subject: String,
    pub result: OutcomeResult,
    pub error_detail: Option<String>,
}

impl DispatchOutcome {
    pub fn success(
        company_name: impl Into<String>,
        email: impl Into<String>,
        subject: impl Into<String>,
        result: OutcomeResult,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            company_name: company_name.into(),
            email: email.into(),
            subject: subject.into(),
            result,
            error_detail: None,
        }
    }

    pub fn error(
        company_name: impl Into<String>,
        email: impl Into<String>,
        subject: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            company_name: company_name.into(),
            email: email.into(),
            subject: subject.into(),
            result: OutcomeResult::Error,
            error_detail: Some(detail.into()),
        }
    }
}

/// Appends outcomes to a CSV file, creating it with a header on first
/// write. Existing rows are never truncated.
#[derive(Debug)]
pub struct OutcomeRecorder {
    path: PathBuf,
    appended: usize,
}

impl OutcomeRecorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            appended: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows appended by this recorder instance.
    pub fn appended(&self) -> usize {
        self.appended
    }

    /// Append one outcome and flush it to disk.
    pub fn append(&mut self, outcome: &DispatchOutcome) -> Result<(), RecorderError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| self.io_error(source))?;
        let needs_header = file
            .metadata()
            .map_err(|source| self.io_error(source))?
            .len()
            == 0;

        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if needs_header {
            writer.write_record(HEADER)?;
        }
        writer.serialize(outcome)?;
        writer.flush().map_err(|source| self.io_error(source))?;

        self.appended += 1;
        debug!(
            path = %self.path.display(),
            company = %outcome.company_name,
            result = ?outcome.result,
            "Outcome recorded"
        );
        Ok(())
    }

    /// Read every row of an outcome log.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<DispatchOutcome>, RecorderError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| RecorderError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut reader = csv::Reader::from_reader(file);
        reader
            .deserialize()
            .collect::<Result<Vec<DispatchOutcome>, _>>()
            .map_err(RecorderError::from)
    }

    fn io_error(&self, source: std::io::Error) -> RecorderError {
        RecorderError::Io {
            path: self.path.clone(),
            source,
        }
    }
}
