// Storage analytics log reader
// Logs live under `<analytics container>/blob/YYYY/MM/DD/HH00/nnnnnn.log`,
// one semicolon-delimited request record per line.

use crate::errors::{ListenerError, StorageError};
use crate::listener::ensure_not_cancelled;
use crate::models::{AccountIdentity, BlobIdentity, BlobProperties};
use crate::storage::BlobStore;
use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Metadata key naming the operation kinds a log file contains
pub const LOG_TYPE_METADATA_KEY: &str = "LogType";

/// Operations that create or modify a blob
pub const WRITE_OPERATIONS: &[&str] = &[
    "PutBlob",
    "PutBlockList",
    "CopyBlob",
    "CopyBlobDestination",
    "SetBlobMetadata",
    "SetBlobProperties",
];

const REQUEST_START_TIME_COLUMN: usize = 1;
const OPERATION_TYPE_COLUMN: usize = 2;
const SERVICE_TYPE_COLUMN: usize = 10;
const OBJECT_KEY_COLUMN: usize = 12;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogRowError {
    #[error("expected at least {expected} columns, found {found}")]
    TooFewColumns { expected: usize, found: usize },

    #[error("invalid request start time '{0}'")]
    InvalidStartTime(String),

    #[error("unterminated quoted field")]
    UnterminatedQuote,
}

/// One request record of an analytics log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRow {
    pub request_start: DateTime<Utc>,
    pub operation: String,
    pub service: String,
    pub object_key: String,
}

impl LogRow {
    pub fn parse(line: &str) -> Result<Self, LogRowError> {
        let columns = split_columns(line)?;
        if columns.len() <= OBJECT_KEY_COLUMN {
            return Err(LogRowError::TooFewColumns {
                expected: OBJECT_KEY_COLUMN + 1,
                found: columns.len(),
            });
        }

        let start = columns[REQUEST_START_TIME_COLUMN];
        let request_start = DateTime::parse_from_rfc3339(start.trim_matches('"'))
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| LogRowError::InvalidStartTime(start.to_string()))?;

        Ok(Self {
            request_start,
            operation: columns[OPERATION_TYPE_COLUMN].to_string(),
            service: columns[SERVICE_TYPE_COLUMN].to_string(),
            object_key: columns[OBJECT_KEY_COLUMN].to_string(),
        })
    }

    /// Blob-service operation that wrote a blob
    pub fn is_blob_write(&self) -> bool {
        self.service.eq_ignore_ascii_case("blob")
            && WRITE_OPERATIONS.contains(&self.operation.as_str())
    }

    /// `(account, container, blob)` from a `"/account/container/blob"` key
    pub fn object_path(&self) -> Option<(&str, &str, &str)> {
        let key = self.object_key.trim_matches('"').strip_prefix('/')?;
        let mut parts = key.splitn(3, '/');
        let account = parts.next().filter(|s| !s.is_empty())?;
        let container = parts.next().filter(|s| !s.is_empty())?;
        let blob = parts.next().filter(|s| !s.is_empty())?;
        Some((account, container, blob))
    }
}

/// Split on `;` outside double quotes; quotes are kept in the field
fn split_columns(line: &str) -> Result<Vec<&str>, LogRowError> {
    let mut columns = Vec::new();
    let mut start = 0;
    let mut quoted = false;

    for (index, ch) in line.char_indices() {
        match ch {
            '"' => quoted = !quoted,
            ';' if !quoted => {
                columns.push(&line[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    if quoted {
        return Err(LogRowError::UnterminatedQuote);
    }
    columns.push(&line[start..]);
    Ok(columns)
}

/// Hourly log prefixes for `now` and the `previous_hours` before it, oldest
/// first. Hours before the earliest representable time are left out.
pub fn hour_prefixes(now: DateTime<Utc>, previous_hours: u32) -> Vec<String> {
    let mut prefixes: Vec<String> = (0..=previous_hours)
        .map_while(|offset| now.checked_sub_signed(Duration::hours(i64::from(offset))))
        .map(|hour| hour.format("blob/%Y/%m/%d/%H00").to_string())
        .collect();
    prefixes.reverse();
    prefixes
}

/// Tails one account's analytics logs for blob writes
pub struct BlobLogReader {
    store: Arc<dyn BlobStore>,
    analytics_container: String,
    seen_limit: usize,
    seen_logs: Mutex<HashSet<String>>,
}

impl BlobLogReader {
    /// Create a reader, turning on write logging for the account if it is off
    #[instrument(skip(store, analytics_container), fields(account = %store.account()))]
    pub async fn create(
        store: Arc<dyn BlobStore>,
        analytics_container: impl Into<String>,
        retention_days: u32,
        seen_limit: usize,
    ) -> Result<Self, StorageError> {
        if store.enable_write_logging(retention_days).await? {
            info!(retention_days, "Enabled analytics write logging");
        }

        Ok(Self {
            store,
            analytics_container: analytics_container.into(),
            seen_limit,
            seen_logs: Mutex::new(HashSet::new()),
        })
    }

    pub fn account(&self) -> &AccountIdentity {
        self.store.account()
    }

    pub fn seen_log_count(&self) -> usize {
        self.seen_logs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn is_seen(&self, log_name: &str) -> bool {
        self.seen_logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(log_name)
    }

    /// Remember a processed log; the set is emptied once it outgrows its bound
    fn mark_seen(&self, log_name: &str) {
        let mut seen = self.seen_logs.lock().unwrap_or_else(|e| e.into_inner());
        seen.insert(log_name.to_string());
        if seen.len() > self.seen_limit {
            debug!(limit = self.seen_limit, "Clearing seen log set");
            seen.clear();
        }
    }

    /// Logs for the recent hours that record write operations
    async fn recent_write_logs(
        &self,
        now: DateTime<Utc>,
        previous_hours: u32,
    ) -> Result<Vec<BlobProperties>, StorageError> {
        let mut logs = Vec::new();
        for prefix in hour_prefixes(now, previous_hours) {
            let listed = match self
                .store
                .list_blobs(&self.analytics_container, Some(&prefix), true)
                .await
            {
                Ok(listed) => listed,
                Err(StorageError::NotFound(_)) => Vec::new(),
                Err(e) => return Err(e),
            };

            logs.extend(listed.into_iter().filter(|log| {
                log.metadata
                    .iter()
                    .find(|(key, _)| key.eq_ignore_ascii_case(LOG_TYPE_METADATA_KEY))
                    .is_some_and(|(_, value)| value.contains("write"))
            }));
        }
        Ok(logs)
    }

    /// Blobs written according to logs not read before
    ///
    /// Each blob is reported once per call, in log order.
    #[instrument(skip(self, cancel), fields(account = %self.account()))]
    pub async fn recent_writes(
        &self,
        now: DateTime<Utc>,
        previous_hours: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<BlobIdentity>, ListenerError> {
        let mut writes = Vec::new();
        let mut reported = HashSet::new();

        for log in self.recent_write_logs(now, previous_hours).await? {
            ensure_not_cancelled(cancel)?;

            let log_name = log.identity.name;
            if self.is_seen(&log_name) {
                continue;
            }

            let content = self
                .store
                .read_blob(&self.analytics_container, &log_name)
                .await?;
            self.mark_seen(&log_name);

            let text = String::from_utf8_lossy(&content);
            for (line_number, line) in text.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let row = match LogRow::parse(line) {
                    Ok(row) => row,
                    Err(e) => {
                        warn!(log = %log_name, line = line_number + 1, error = %e, "Skipping malformed log row");
                        counter!("analytics_log_rows_malformed_total").increment(1);
                        continue;
                    }
                };
                if !row.is_blob_write() {
                    continue;
                }
                let Some((account, container, blob)) = row.object_path() else {
                    warn!(log = %log_name, key = %row.object_key, "Skipping log row with unusable object key");
                    counter!("analytics_log_rows_malformed_total").increment(1);
                    continue;
                };

                let account = if self.account().name().eq_ignore_ascii_case(account) {
                    self.account().clone()
                } else {
                    AccountIdentity::new(account)
                };
                let identity = BlobIdentity::new(account, container, blob);
                if reported.insert(identity.clone()) {
                    writes.push(identity);
                }
            }
        }

        debug!(count = writes.len(), "Blob writes found in analytics logs");
        Ok(writes)
    }
}
