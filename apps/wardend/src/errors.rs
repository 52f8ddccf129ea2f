use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use warden_proto::proto::{BackupId, ErrorCode, PlayerId, RpcError, ServerProcessState};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("server is already {0}")]
    AlreadyRunning(ServerProcessState),

    #[error("failed to launch server: {0}")]
    LaunchFailure(String),

    #[error("server did not become ready within {0:?}")]
    StartupTimeout(Duration),

    #[error("server did not exit within {0:?} after forced termination")]
    ShutdownTimeout(Duration),

    #[error("server is not running")]
    NotRunning,

    #[error("console input must be a single non-empty line")]
    InvalidConsoleLine,

    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup source is unavailable: {}", .0.display())]
    SourceUnavailable(PathBuf),

    #[error("another backup is already in progress")]
    ConcurrentBackupInProgress,

    #[error("server must be stopped (currently {0})")]
    ServerMustBeStopped(ServerProcessState),

    #[error("safety archive failed, restore aborted and no data was altered: {0}")]
    SafetyArchiveFailed(#[source] Box<BackupError>),

    #[error("backup record not found: {0}")]
    RecordNotFound(BackupId),

    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl BackupError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("server is not running")]
    ServerNotRunning,

    #[error("player is not online: {0}")]
    PlayerNotOnline(PlayerId),

    #[error("invalid player identifier: {0:?}")]
    InvalidPlayerIdentifier(String),

    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl AdminError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadoutError {
    #[error("loadout not found: {0}")]
    NotFound(String),

    #[error("loadout {0:?} is referenced by the running server")]
    InUse(String),

    #[error("invalid loadout: {0}")]
    Invalid(String),

    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl LoadoutError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Names the mutating operation currently holding the controller gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Start,
    Stop,
    Backup,
    ScheduledBackup,
    Restore,
    Prune,
    DeleteBackup,
    Console,
    Moderation,
    Loadout,
}

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("another operation is in flight ({0:?}), retry later")]
    GateBusy(Operation),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Admin(#[from] AdminError),

    #[error(transparent)]
    Loadout(#[from] LoadoutError),
}

impl OrchestrationError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::GateBusy(_))
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::GateBusy(_) => ErrorCode::GateBusy,
            Self::InvalidConfiguration(_) => ErrorCode::InvalidConfiguration,
            Self::Process(err) => match err {
                ProcessError::AlreadyRunning(_) => ErrorCode::AlreadyRunning,
                ProcessError::LaunchFailure(_) => ErrorCode::LaunchFailure,
                ProcessError::StartupTimeout(_) => ErrorCode::StartupTimeout,
                ProcessError::ShutdownTimeout(_) => ErrorCode::ShutdownTimeout,
                ProcessError::NotRunning => ErrorCode::NotRunning,
                ProcessError::InvalidConsoleLine => ErrorCode::BadRequest,
                ProcessError::Io { .. } => ErrorCode::IoFailure,
            },
            Self::Backup(err) => match err {
                BackupError::SourceUnavailable(_) => ErrorCode::SourceUnavailable,
                BackupError::ConcurrentBackupInProgress => ErrorCode::ConcurrentBackupInProgress,
                BackupError::ServerMustBeStopped(_) => ErrorCode::ServerMustBeStopped,
                BackupError::SafetyArchiveFailed(_) => ErrorCode::SafetyArchiveFailed,
                BackupError::RecordNotFound(_) => ErrorCode::RecordNotFound,
                BackupError::Io { .. } => ErrorCode::IoFailure,
            },
            Self::Admin(err) => match err {
                AdminError::ServerNotRunning => ErrorCode::ServerNotRunning,
                AdminError::PlayerNotOnline(_) => ErrorCode::PlayerNotOnline,
                AdminError::InvalidPlayerIdentifier(_) => ErrorCode::InvalidPlayerIdentifier,
                AdminError::Io { .. } => ErrorCode::IoFailure,
            },
            Self::Loadout(err) => match err {
                LoadoutError::NotFound(_) => ErrorCode::LoadoutNotFound,
                LoadoutError::InUse(_) => ErrorCode::LoadoutInUse,
                LoadoutError::Invalid(_) => ErrorCode::InvalidLoadout,
                LoadoutError::Io { .. } => ErrorCode::IoFailure,
            },
        }
    }
}

/// Map orchestration errors to stable wire errors. The kind is never reinterpreted.
impl From<&OrchestrationError> for RpcError {
    fn from(e: &OrchestrationError) -> Self {
        let mut err = RpcError::new(e.code(), e.to_string());
        if e.is_retryable() {
            err = err.with_detail("retryable", "true");
        }
        if let OrchestrationError::Backup(BackupError::SafetyArchiveFailed(_)) = e {
            err = err.with_detail("data_altered", "false");
        }
        err
    }
}
