use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use super::{BackupId, PlayerId, UnixMillis};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl ServerProcessState {
    /// A process handle may exist in these states.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    pub fn can_start(self) -> bool {
        matches!(self, Self::Stopped | Self::Crashed)
    }
}

impl fmt::Display for ServerProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown exit"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub state: ServerProcessState,
    pub pid: Option<u32>,
    pub port: u16,
    pub port_open: bool,
    pub started_at_ms: Option<UnixMillis>,
    pub last_seen_alive_ms: Option<UnixMillis>,
    pub uptime_ms: Option<u64>,
    #[serde(default)]
    pub last_exit: Option<ExitInfo>,
    #[serde(default)]
    pub memory_bytes: Option<u64>,
    #[serde(default)]
    pub cpu_percent: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackupKind {
    Scheduled,
    Manual,
    SafetyArchive,
}

/// One entry of a snapshot manifest. Paths are relative to the snapshot root and
/// always use `/` separators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ManifestEntry {
    Dir { path: String },
    File { path: String, size: u64, sha256: String },
    /// Recorded as a link, never followed.
    Symlink { path: String, target: String },
}

impl ManifestEntry {
    pub fn path(&self) -> &str {
        match self {
            Self::Dir { path } | Self::File { path, .. } | Self::Symlink { path, .. } => path,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            Self::Dir { .. } | Self::Symlink { .. } => 0,
            Self::File { size, .. } => *size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: BackupId,
    pub kind: BackupKind,
    pub created_at_ms: UnixMillis,
    pub size_bytes: u64,
    /// Directory the snapshot was taken from.
    pub source: PathBuf,
    pub manifest: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub id: PlayerId,
    pub joined_at_ms: UnixMillis,
    pub session_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModerationList {
    Whitelist,
    Banned,
    Operators,
}

impl fmt::Display for ModerationList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Whitelist => "whitelist",
            Self::Banned => "ban list",
            Self::Operators => "operator list",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationSnapshot {
    pub whitelist: Vec<PlayerId>,
    pub banned: Vec<PlayerId>,
    pub operators: Vec<PlayerId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModRef {
    pub path: PathBuf,
    /// Checksum or version tag identifying the exact mod build.
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModLoadout {
    pub name: String,
    #[serde(default)]
    pub mods: Vec<ModRef>,
}
