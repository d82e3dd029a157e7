//! Recipient source — reads the lead sheet into ordered `Recipient` records.
//!
//! Rows without a usable email, with an empty company name, or already
//! marked as handled in the status column are dropped here and never reach
//! the pipeline. Rows with the wrong number of columns are skipped.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::error::{ConfigError, SourceError};

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s.]+$").unwrap());

/// Status values that mark a row as already handled.
const HANDLED_STATUSES: &[&str] = &["sent", "done", "bounced"];

/// One row of the input dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub company_name: String,
    /// Website reference; empty when the sheet has none.
    pub website: String,
    pub email: String,
    /// Zero-based data row index within the file.
    pub row_index: usize,
    /// Opening line supplied by the sheet, bypassing generation.
    pub first_line: Option<String>,
}

/// Is this address plausible enough to attempt delivery?
pub fn is_plausible_email(email: &str) -> bool {
    EMAIL_RE.is_match(email)
}

// ── Column mapping ──────────────────────────────────────────────────

/// Positions of the columns we care about. Extra columns are ignored.
#[derive(Debug, Clone, Default)]
struct ColumnMap {
    company: usize,
    email: usize,
    website: Option<usize>,
    first_line: Option<usize>,
    status: Option<usize>,
}

impl ColumnMap {
    fn from_headers(headers: &csv::StringRecord) -> Result<Self, ConfigError> {
        let mut company = None;
        let mut email = None;
        let mut map = Self::default();

        for (idx, header) in headers.iter().enumerate() {
            match header.trim().to_lowercase().as_str() {
                "company" | "company name" | "organisation" | "organization" => {
                    company.get_or_insert(idx);
                }
                "website" | "site" | "url" | "homepage" => {
                    map.website.get_or_insert(idx);
                }
                "email" | "e-mail" | "contact" => {
                    email.get_or_insert(idx);
                }
                "first line" | "first_line" | "opener" | "custom line" => {
                    map.first_line.get_or_insert(idx);
                }
                "status" => {
                    map.status.get_or_insert(idx);
                }
                _ => {}
            }
        }

        map.company = company.ok_or_else(|| ConfigError::MissingColumn("Company".into()))?;
        map.email = email.ok_or_else(|| ConfigError::MissingColumn("Email".into()))?;
        Ok(map)
    }
}

// ── Source ──────────────────────────────────────────────────────────

/// Handle to a CSV lead sheet. Each call to [`RecipientSource::iter`]
/// restarts from the first data row.
#[derive(Debug, Clone)]
pub struct RecipientSource {
    path: PathBuf,
    columns: ColumnMap,
}

impl RecipientSource {
    /// Open the dataset and validate its header row.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let mut reader = reader_for(&path).map_err(|e| ConfigError::UnreadableDataset {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let headers = reader
            .headers()
            .map_err(|e| ConfigError::UnreadableDataset {
                path: path.clone(),
                reason: e.to_string(),
            })?
            .clone();
        let columns = ColumnMap::from_headers(&headers)?;
        debug!(path = %path.display(), ?columns, "Opened recipient dataset");
        Ok(Self { path, columns })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lazily iterate valid recipients in file order.
    pub fn iter(&self) -> Result<Recipients, SourceError> {
        let reader = reader_for(&self.path).map_err(|e| SourceError::Open {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        Ok(Recipients {
            records: reader.into_records(),
            columns: self.columns.clone(),
            next_index: 0,
        })
    }
}

fn reader_for(path: &Path) -> Result<csv::Reader<File>, csv::Error> {
    csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .trim(csv::Trim::All)
        .from_path(path)
}

/// Iterator over the valid recipients of a dataset.
pub struct Recipients {
    records: csv::StringRecordsIntoIter<File>,
    columns: ColumnMap,
    next_index: usize,
}

impl Iterator for Recipients {
    type Item = Recipient;

    fn next(&mut self) -> Option<Recipient> {
        loop {
            let record = self.records.next()?;
            let row_index = self.next_index;
            self.next_index += 1;

            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    warn!(row = row_index, error = %e, "Skipping malformed row");
                    continue;
                }
            };

            if let Some(recipient) = parse_row(&record, &self.columns, row_index) {
                return Some(recipient);
            }
        }
    }
}

fn parse_row(record: &csv::StringRecord, columns: &ColumnMap, row_index: usize) -> Option<Recipient> {
    let field = |idx: Option<usize>| {
        idx.and_then(|i| record.get(i))
            .map(str::trim)
            .unwrap_or_default()
            .to_string()
    };

    let company_name = field(Some(columns.company));
    let email = field(Some(columns.email));

    if company_name.is_empty() {
        debug!(row = row_index, "Skipping row without company name");
        return None;
    }
    if !is_plausible_email(&email) {
        debug!(row = row_index, company = %company_name, "Skipping row without usable email");
        return None;
    }

    let status = field(columns.status).to_lowercase();
    if HANDLED_STATUSES.contains(&status.as_str()) {
        debug!(row = row_index, status = %status, "Skipping already handled row");
        return None;
    }

    let first_line = Some(field(columns.first_line)).filter(|s| !s.is_empty());

    Some(Recipient {
        company_name,
        website: field(columns.website),
        email,
        row_index,
        first_line,
    })
}
