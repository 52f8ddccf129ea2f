use serde::{Deserialize, Serialize};

use super::{
    BackupId, BackupRecord, ExitInfo, HealthSnapshot, ListAction, LogLine, ModLoadout,
    ModerationList, ModerationSnapshot, PlayerId, PlayerRecord, RequestId, RpcError,
    ServerProcessState, UnixMillis,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    Log(LogLine),
    State(StateChange),
    Backup(BackupEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChange {
    pub from: ServerProcessState,
    pub to: ServerProcessState,
    pub at_ms: UnixMillis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum BackupEvent {
    Created(BackupRecord),
    Deleted { id: BackupId },
    Pruned { ids: Vec<BackupId> },
    Restored { id: BackupId, safety_archive: BackupId },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum Outbound {
    Response(Envelope<Response>),
    Event(Event),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub id: RequestId,
    pub payload: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Request {
    Ping { client_version: String, protocol_version: u32 },
    Command(Command),
    Query(Query),
    Subscribe { topics: Vec<Topic> },
    Shutdown {},
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Topic {
    Logs,
    State,
    Backups,
}

/// Mutating operations. Every variant passes through the controller's gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Command {
    Start {},
    Stop {
        #[serde(default)]
        force: bool,
    },
    Backup {},
    Restore { id: BackupId },
    Prune {},
    DeleteBackup { id: BackupId },
    SendConsole { line: String },
    Kick {
        player: PlayerId,
        #[serde(default)]
        reason: Option<String>,
    },
    Ban {
        player: PlayerId,
        #[serde(default)]
        reason: Option<String>,
    },
    Unban { player: PlayerId },
    Whitelist { action: ListAction, player: PlayerId },
    SetOperator { player: PlayerId, enabled: bool },
    SaveLoadout(ModLoadout),
    DeleteLoadout { name: String },
    SelectLoadout { name: Option<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Query {
    Health {},
    BackupList {},
    PlayerList {},
    Moderation {},
    Loadouts {},
    Logs { lines: usize },
    /// The daemon's own log lines.
    ManagerLogs { lines: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Outcome {
    Started { pid: Option<u32>, started_at_ms: UnixMillis },
    Stopped { exit: Option<ExitInfo> },
    BackupCreated(BackupRecord),
    Restored { record: BackupRecord, safety_archive: BackupRecord },
    Pruned { removed: Vec<BackupId> },
    BackupDeleted { id: BackupId },
    ConsoleSent {},
    PlayerKicked { player: PlayerId },
    ModerationUpdated { list: ModerationList, player: PlayerId, listed: bool },
    LoadoutSaved { name: String },
    LoadoutDeleted { name: String },
    LoadoutSelected { name: Option<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Snapshot {
    Health(HealthSnapshot),
    Backups(Vec<BackupRecord>),
    Players(Vec<PlayerRecord>),
    Moderation(ModerationSnapshot),
    Loadouts { loadouts: Vec<ModLoadout>, selected: Option<String> },
    Logs { lines: Vec<LogLine> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Response {
    Pong { daemon_version: String, protocol_version: u32 },
    Outcome(Outcome),
    Snapshot(Snapshot),
    Subscribed { topics: Vec<Topic> },
    ShutdownAck {},
    Error(RpcError),
}
