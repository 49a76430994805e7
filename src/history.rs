//! Prediction history: a durable append-only CSV log plus a bounded
//! in-memory window of the most recent records.
//!
//! The log is the source of truth. A record is pushed to the in-memory
//! window only after its row has been synced to the log, and both happen
//! under one lock, so the window is always a suffix of the log.

use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use csv::StringRecord;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::append_log::{self, AppendLog};
use crate::error::ServiceError;
use crate::types::{Classification, InferenceScore, PredictionRecord, RiskLabel};

pub const LOG_HEADER: [&str; 6] = [
    "timestamp",
    "input_text",
    "prediction",
    "probability",
    "message",
    "threshold",
];

#[derive(Debug, Clone)]
pub struct HistoryConfig {
    pub path: PathBuf,
    pub capacity: usize,
    /// Assumed for log rows written before the threshold column existed.
    pub default_threshold: f64,
}

struct HistoryState {
    log: AppendLog,
    recent: VecDeque<PredictionRecord>,
}

pub struct HistoryStore {
    path: PathBuf,
    capacity: usize,
    default_threshold: f64,
    state: Mutex<HistoryState>,
}

impl HistoryStore {
    /// Opens or creates the log. The in-memory window starts empty.
    pub fn open(config: HistoryConfig) -> anyhow::Result<Self> {
        let log = AppendLog::open(&config.path, &LOG_HEADER).with_context(|| {
            format!("failed to open prediction log {}", config.path.display())
        })?;
        tracing::info!(path = %config.path.display(), capacity = config.capacity, "Prediction log opened");
        Ok(Self::with_log(config, log))
    }

    pub(crate) fn with_log(config: HistoryConfig, log: AppendLog) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            path: config.path,
            capacity,
            default_threshold: config.default_threshold,
            state: Mutex::new(HistoryState {
                log,
                recent: VecDeque::with_capacity(capacity),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Makes `record` durable, then visible through [`recent`](Self::recent).
    /// On a failed write the record is not exposed at all.
    pub fn append(&self, record: PredictionRecord) -> Result<(), ServiceError> {
        let row = log_row(&record);
        let mut state = self.state.lock();

        if let Err(source) = state.log.append(&row) {
            return Err(ServiceError::StoreWrite {
                path: state.log.path().to_path_buf(),
                source,
            });
        }

        if state.recent.len() == self.capacity {
            state.recent.pop_front();
        }
        state.recent.push_back(record);
        Ok(())
    }

    /// Up to `n` most recent records, oldest first.
    pub fn recent(&self, n: usize) -> Vec<PredictionRecord> {
        let state = self.state.lock();
        let skip = state.recent.len().saturating_sub(n);
        state.recent.iter().skip(skip).cloned().collect()
    }

    /// Lazily reads every record in the durable log, oldest first. A missing
    /// log reads as empty. Only rows committed before the call are read; a
    /// row being written concurrently is never served half-done.
    pub fn all(&self) -> anyhow::Result<LogReader> {
        let committed = self.state.lock().log.committed_len();
        LogReader::open_prefix(&self.path, committed, self.default_threshold)
    }

    #[cfg(test)]
    pub(crate) fn hold_lock(&self) -> impl Sized + '_ {
        self.state.lock()
    }
}

fn log_row(record: &PredictionRecord) -> [String; 6] {
    [
        record
            .timestamp
            .to_rfc3339_opts(SecondsFormat::Micros, true),
        record.input_text.clone(),
        record.classification.label.as_flag().to_string(),
        record.score.value().to_string(),
        record.classification.message.clone(),
        record.classification.threshold_used.to_string(),
    ]
}

/// Iterator over a prediction log. Accepts logs with or without a header
/// and rows of four (`timestamp,input,prediction,probability`), five
/// (`+message`) or six (`+threshold`) fields. Malformed rows are skipped,
/// and so is a final row with no line terminator.
pub struct LogReader {
    rows: Option<csv::StringRecordsIntoIter<io::Take<File>>>,
    default_threshold: f64,
}

impl LogReader {
    #[cfg(test)]
    pub fn open(path: &Path, default_threshold: f64) -> anyhow::Result<Self> {
        Self::open_prefix(path, u64::MAX, default_threshold)
    }

    /// Reads at most the first `limit` bytes of the log.
    pub fn open_prefix(path: &Path, limit: u64, default_threshold: f64) -> anyhow::Result<Self> {
        let rows = match File::open(path) {
            Ok(file) => Some(
                complete_rows(file, limit)
                    .with_context(|| format!("failed to read prediction log {}", path.display()))?,
            ),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read prediction log {}", path.display()));
            }
        };
        Ok(Self {
            rows,
            default_threshold,
        })
    }
}

fn complete_rows(
    mut file: File,
    limit: u64,
) -> io::Result<csv::StringRecordsIntoIter<io::Take<File>>> {
    let len = file.metadata()?.len().min(limit);
    let complete = append_log::terminated_len(&mut file, len)?;
    if complete < len {
        tracing::warn!(
            dropped_bytes = len - complete,
            "Ignoring unterminated last row of prediction log"
        );
    }

    Ok(csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(file.take(complete))
        .into_records())
}

impl Iterator for LogReader {
    type Item = PredictionRecord;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let row = match self.rows.as_mut()?.next()? {
                Ok(row) => row,
                Err(e) if e.is_io_error() => {
                    tracing::warn!(error = %e, "Prediction log read aborted");
                    self.rows = None;
                    return None;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable prediction log row");
                    continue;
                }
            };

            match parse_row(&row, self.default_threshold) {
                Ok(Some(record)) => return Some(record),
                Ok(None) => continue,
                Err(reason) => {
                    let line = row.position().map(|p| p.line());
                    tracing::warn!(?line, %reason, "Skipping malformed prediction log row");
                }
            }
        }
    }
}

/// `Ok(None)` for a header row.
fn parse_row(
    row: &StringRecord,
    default_threshold: f64,
) -> Result<Option<PredictionRecord>, String> {
    if row.get(0) == Some(LOG_HEADER[0]) {
        return Ok(None);
    }
    if !(4..=6).contains(&row.len()) {
        return Err(format!("expected 4 to 6 fields, found {}", row.len()));
    }

    let timestamp = parse_timestamp(&row[0])?;
    let flag: u8 = row[2]
        .trim()
        .parse()
        .map_err(|e| format!("bad prediction `{}`: {e}", &row[2]))?;
    let label = RiskLabel::from_flag(flag).ok_or_else(|| format!("unknown prediction {flag}"))?;
    let probability: f64 = row[3]
        .trim()
        .parse()
        .map_err(|e| format!("bad probability `{}`: {e}", &row[3]))?;
    let score = InferenceScore::new(probability).map_err(|e| e.to_string())?;
    let message = match row.get(4).map(str::trim) {
        Some(message) if !message.is_empty() => message.to_string(),
        _ => label.message().to_string(),
    };
    let threshold_used = match row.get(5) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| format!("bad threshold `{raw}`: {e}"))?,
        None => default_threshold,
    };

    Ok(Some(PredictionRecord {
        timestamp,
        input_text: row[1].to_string(),
        classification: Classification {
            label,
            message,
            threshold_used,
        },
        score,
    }))
}

/// RFC 3339, or a naive ISO-8601 timestamp taken as UTC.
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    let raw = raw.trim();
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(raw) {
        return Ok(timestamp.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| format!("bad timestamp `{raw}`: {e}"))
}
