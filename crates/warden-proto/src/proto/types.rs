use serde::{Deserialize, Serialize};

pub type RequestId = u64;
pub type UnixMillis = u64;

/// Player identifier as the managed server prints it (its name).
pub type PlayerId = String;

/// Timestamp-derived backup identifier, e.g. `20261014T120000.123Z`.
/// Lexicographic order equals creation order.
pub type BackupId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStream {
    Stdout,
    Stderr,
    Manager,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub at_ms: UnixMillis,
    pub stream: LogStream,
    pub line: String,
}
