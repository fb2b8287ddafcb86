use std::path::Path;
use std::time::Instant;

use chrono::{Datelike, SecondsFormat, TimeZone, Utc};

pub use anyhow::{anyhow, bail, Context};

pub mod atomic;
pub mod hashing;
pub mod safe_path;
#[cfg(test)]
pub mod test_utils;

pub type Result<T> = anyhow::Result<T>;
pub type EmptyRes = Result<()>;

#[macro_export]
macro_rules! err {
    ($($arg:tt)*) => { Err(anyhow::anyhow!($($arg)*)) };
}

#[macro_export]
macro_rules! require {
    ($cond:expr) => { if !($cond) { anyhow::bail!("Requirement failed: {}", stringify!($cond)); } };
    ($cond:expr, $($arg:tt)*) => { if !($cond) { anyhow::bail!($($arg)*); } };
}

/// Failures the pipeline routes on (rejection vs. file drop vs. abort).
/// Everything else travels as a plain `anyhow` context chain.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("path '{path}' escapes repository root")]
    PathEscape { path: String },
    #[error("malformed XML in {file} at byte {offset}: {message}")]
    MalformedXml { file: String, offset: u64, message: String },
    #[error("invalid record: {reason}")]
    RecordInvalid { reason: String },
    #[error("malformed-attachment: {reason}")]
    AttachmentDecode { reason: String },
    #[error("attachment-write-error: {reason}")]
    AttachmentWrite { reason: String },
    #[error("unsupported repository structure version '{found}'")]
    UnsupportedVersion { found: String },
}

impl PipelineError {
    /// Reason string recorded in the rejection sink, or `None` if this error
    /// is not a per-record failure.
    pub fn rejection_reason(&self) -> Option<String> {
        match self {
            PipelineError::RecordInvalid { reason } => Some(reason.clone()),
            PipelineError::AttachmentDecode { .. } => Some("malformed-attachment".to_owned()),
            PipelineError::AttachmentWrite { .. } => Some("attachment-write-error".to_owned()),
            _ => None,
        }
    }
}

/// Looks up a `PipelineError` anywhere in an `anyhow` chain.
pub fn pipeline_error(err: &anyhow::Error) -> Option<&PipelineError> {
    err.chain().find_map(|e| e.downcast_ref::<PipelineError>())
}

pub fn error_to_string(e: &anyhow::Error) -> String {
    let mut iter = e.chain();
    let mut s = iter.next().map(|c| c.to_string()).unwrap_or_default();
    let mut depth = 0;
    for src_e in iter {
        s.push_str(&format!(" (caused by: {src_e}"));
        depth += 1;
    }
    s.push_str(&")".repeat(depth));
    s
}

//
// Path helpers
//

pub fn path_to_str(path: &Path) -> Result<&str> {
    path.to_str().with_context(|| format!("Path {path:?} is not a valid UTF-8 string"))
}

pub fn path_file_name(path: &Path) -> Result<&str> {
    path.file_name().and_then(|n| n.to_str())
        .with_context(|| format!("Path {path:?} does not have a file name"))
}

//
// Time helpers
//

/// UTC year of an epoch-milliseconds timestamp.
pub fn year_of_timestamp(ts_ms: i64) -> Result<i32> {
    Utc.timestamp_millis_opt(ts_ms).single()
        .map(|dt| dt.year())
        .with_context(|| format!("Timestamp {ts_ms} ms is out of range"))
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_rfc3339(s: &str) -> Result<chrono::DateTime<chrono::FixedOffset>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("'{s}' is not a valid RFC 3339 timestamp"))
}

//
// Other
//

pub fn measure<T, R>(block: impl FnOnce() -> T, after_call: impl FnOnce(&T, u128) -> R) -> T {
    let start_time = Instant::now();
    let result = block();
    let elapsed = start_time.elapsed().as_millis();
    after_call(&result, elapsed);
    result
}
