//! JSONL run logs.
//!
//! Every line is one [`LogEntry`]. Interpreter events are written directly;
//! engine lifecycle records go through [`LogEntry::from_heap_record`] so the
//! engine's trace id survives into the file.

use heapsim_core::Strategy;
use heapsim_core::malloc::{HeapLogLevel, HeapLogRecord};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<HeapLogLevel> for LogLevel {
    fn from(level: HeapLogLevel) -> Self {
        match level {
            HeapLogLevel::Trace => Self::Trace,
            HeapLogLevel::Debug => Self::Debug,
            HeapLogLevel::Info => Self::Info,
            HeapLogLevel::Warn => Self::Warn,
            HeapLogLevel::Error => Self::Error,
        }
    }
}

/// One log line. `timestamp`, `trace_id`, `level` and `event` are always present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub trace_id: String,
    pub level: LogLevel,
    pub event: String,
    /// Engine operation (`allocate`, `release`) or interpreter verb.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    /// Protocol name of the active placement strategy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogEntry {
    #[must_use]
    pub fn new(trace_id: impl Into<String>, level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            timestamp: now_utc(),
            trace_id: trace_id.into(),
            level,
            event: event.into(),
            symbol: None,
            strategy: None,
            outcome: None,
            offset: None,
            size: None,
            details: None,
        }
    }

    /// Converts an engine lifecycle record, keeping its trace id.
    #[must_use]
    pub fn from_heap_record(record: &HeapLogRecord, strategy: Strategy) -> Self {
        let mut entry = Self::new(record.trace_id.clone(), record.level.into(), record.event)
            .with_symbol(record.symbol)
            .with_strategy(strategy)
            .with_outcome(record.outcome)
            .with_details(serde_json::json!({
                "decision_id": record.decision_id,
                "unit_size": record.unit_size,
                "message": record.details,
                "top_index": record.top_index,
                "free_chunks": record.free_chunks,
                "allocated_chunks": record.allocated_chunks,
            }));
        entry.offset = record.offset;
        entry.size = record.size;
        entry
    }

    #[must_use]
    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy.protocol_name().to_string());
        self
    }

    #[must_use]
    pub fn with_outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = Some(outcome.into());
        self
    }

    #[must_use]
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    #[must_use]
    pub fn with_size(mut self, size: i64) -> Self {
        self.size = Some(size);
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// The entry as one JSON line, without the newline.
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

enum Sink {
    File(BufWriter<File>),
    Buffer(Vec<u8>),
}

impl Sink {
    fn writer(&mut self) -> &mut dyn Write {
        match self {
            Self::File(file) => file as &mut dyn Write,
            Self::Buffer(buffer) => buffer,
        }
    }
}

/// Appends entries to a file or a buffer, numbering trace ids per run.
pub struct LogEmitter {
    sink: Sink,
    seq: u64,
    run_id: String,
}

impl LogEmitter {
    pub fn to_file(path: &Path, run_id: &str) -> std::io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            sink: Sink::File(BufWriter::new(file)),
            seq: 0,
            run_id: run_id.to_string(),
        })
    }

    #[must_use]
    pub fn to_buffer(run_id: &str) -> Self {
        Self {
            sink: Sink::Buffer(Vec::new()),
            seq: 0,
            run_id: run_id.to_string(),
        }
    }

    fn next_trace_id(&mut self) -> String {
        self.seq += 1;
        format!("heapsim::{}::{:03}", self.run_id, self.seq)
    }

    /// Writes a bare entry under the next run trace id.
    pub fn emit(&mut self, level: LogLevel, event: &str) -> std::io::Result<LogEntry> {
        let trace_id = self.next_trace_id();
        let entry = LogEntry::new(trace_id, level, event);
        self.write_line(&entry)?;
        Ok(entry)
    }

    /// Writes `entry`, assigning the next run trace id when it has none.
    pub fn emit_entry(&mut self, mut entry: LogEntry) -> std::io::Result<()> {
        if entry.trace_id.is_empty() {
            entry.trace_id = self.next_trace_id();
        }
        self.write_line(&entry)
    }

    /// Emits every record in `records` as an entry tagged with `strategy`.
    pub fn emit_heap_records(
        &mut self,
        records: &[HeapLogRecord],
        strategy: Strategy,
    ) -> std::io::Result<()> {
        for record in records {
            self.write_line(&LogEntry::from_heap_record(record, strategy))?;
        }
        Ok(())
    }

    fn write_line(&mut self, entry: &LogEntry) -> std::io::Result<()> {
        let line = entry.to_jsonl().map_err(std::io::Error::other)?;
        writeln!(self.sink.writer(), "{line}")
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.sink.writer().flush()
    }

    /// Buffered output of an emitter created with [`LogEmitter::to_buffer`].
    #[must_use]
    pub fn buffered(&self) -> Option<&[u8]> {
        match &self.sink {
            Sink::Buffer(buffer) => Some(buffer),
            Sink::File(_) => None,
        }
    }
}

const REQUIRED_FIELDS: [&str; 4] = ["timestamp", "trace_id", "level", "event"];

/// A problem with one line of a JSONL log.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogIssue {
    #[error("line {line}: not a log object: {reason}")]
    Malformed { line: usize, reason: String },
    #[error("line {line}: missing `{field}`")]
    Missing { line: usize, field: &'static str },
    #[error("line {line}: `{field}` cannot be {value}")]
    BadValue {
        line: usize,
        field: &'static str,
        value: serde_json::Value,
    },
}

impl LogIssue {
    #[must_use]
    pub fn line(&self) -> usize {
        match self {
            Self::Malformed { line, .. } | Self::Missing { line, .. } | Self::BadValue { line, .. } => {
                *line
            }
        }
    }

    /// Field the issue is about; `None` when the line as a whole is unusable.
    #[must_use]
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::Malformed { .. } => None,
            Self::Missing { field, .. } | Self::BadValue { field, .. } => Some(*field),
        }
    }
}

fn field_is_valid(field: &str, value: &serde_json::Value) -> bool {
    match field {
        "level" => serde_json::from_value::<LogLevel>(value.clone()).is_ok(),
        "event" => value.as_str().is_some_and(|event| !event.trim().is_empty()),
        "trace_id" => value.as_str().is_some_and(|id| id.contains("::")),
        "strategy" => value.as_str().is_some_and(|name| {
            Strategy::ALL.iter().any(|known| known.protocol_name() == name)
        }),
        _ => true,
    }
}

/// Checks one JSONL line and returns the entry it holds.
pub fn validate_log_line(text: &str, line: usize) -> Result<LogEntry, Vec<LogIssue>> {
    let object: serde_json::Map<String, serde_json::Value> = serde_json::from_str(text)
        .map_err(|err| {
            vec![LogIssue::Malformed {
                line,
                reason: err.to_string(),
            }]
        })?;

    let mut issues: Vec<LogIssue> = REQUIRED_FIELDS
        .into_iter()
        .filter(|field| !object.contains_key(*field))
        .map(|field| LogIssue::Missing { line, field })
        .collect();
    for field in ["level", "event", "trace_id", "strategy"] {
        if let Some(value) = object.get(field)
            && !field_is_valid(field, value)
        {
            issues.push(LogIssue::BadValue {
                line,
                field,
                value: value.clone(),
            });
        }
    }
    if !issues.is_empty() {
        return Err(issues);
    }

    serde_json::from_value(serde_json::Value::Object(object)).map_err(|err| {
        vec![LogIssue::Malformed {
            line,
            reason: err.to_string(),
        }]
    })
}

/// Checks every non-blank line of a JSONL file.
///
/// Returns the number of lines checked with all issues found.
pub fn validate_log_file(path: &Path) -> std::io::Result<(usize, Vec<LogIssue>)> {
    Ok(validate_log_text(&std::fs::read_to_string(path)?))
}

#[must_use]
pub fn validate_log_text(content: &str) -> (usize, Vec<LogIssue>) {
    let mut checked = 0;
    let mut issues = Vec::new();
    for (index, text) in content.lines().enumerate() {
        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        checked += 1;
        if let Err(found) = validate_log_line(text, index + 1) {
            issues.extend(found);
        }
    }
    (checked, issues)
}

fn now_utc() -> String {
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format_utc(duration.as_secs(), duration.subsec_millis())
}

/// RFC 3339 UTC timestamp with millisecond precision.
fn format_utc(secs: u64, millis: u32) -> String {
    let days = secs / 86_400;
    let rem = secs % 86_400;
    let (year, month, day) = civil_from_days(days);
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{millis:03}Z",
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60,
    )
}

// Days since 1970-01-01 to a proleptic Gregorian date.
fn civil_from_days(days: u64) -> (u64, u64, u64) {
    let z = days + 719_468;
    let era = z / 146_097;
    let doe = z % 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + u64::from(month <= 2);
    (year, month, day)
}
