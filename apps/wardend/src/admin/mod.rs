mod lists;

pub use lists::ModerationStore;
use lists::validate_player_id;

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use tracing::{info, warn};
use warden_proto::proto::{
    ListAction, ModerationList, ModerationSnapshot, PlayerId, PlayerRecord, ServerProcessState,
};

use crate::errors::{AdminError, ProcessError};
use crate::supervisor::ProcessSupervisor;
use crate::util::now_millis;

const KICK_COMMAND: &str = "/kick";

/// Moderation and live player queries. List edits work whether or not the server runs;
/// kicks need a running server.
#[derive(Clone)]
pub struct PlayerAdminGateway {
    supervisor: ProcessSupervisor,
    lists: ModerationStore,
}

impl PlayerAdminGateway {
    pub fn new(supervisor: ProcessSupervisor, lists: ModerationStore) -> Self {
        Self { supervisor, lists }
    }

    pub async fn kick(&self, player: &str, reason: Option<&str>) -> Result<PlayerId, AdminError> {
        let player = validate_player_id(player)?;
        if self.supervisor.state() != ServerProcessState::Running {
            return Err(AdminError::ServerNotRunning);
        }
        if !self.supervisor.players().is_online(&player) {
            return Err(AdminError::PlayerNotOnline(player));
        }

        let line = match reason.map(str::trim).filter(|r| !r.is_empty()) {
            Some(reason) => format!("{KICK_COMMAND} {player} {reason}"),
            None => format!("{KICK_COMMAND} {player}"),
        };
        self.supervisor
            .send_command(&line)
            .await
            .map_err(|err| match err {
                ProcessError::NotRunning => AdminError::ServerNotRunning,
                other => AdminError::io(
                    "sending kick",
                    std::io::Error::other(other.to_string()),
                ),
            })?;
        info!("kicked {player}");
        Ok(player)
    }

    /// Records the ban, then kicks the player if they are online.
    pub async fn ban(&self, player: &str, reason: Option<&str>) -> Result<PlayerId, AdminError> {
        let player = validate_player_id(player)?;
        let mut fields = Map::new();
        if let Some(reason) = reason.map(str::trim).filter(|r| !r.is_empty()) {
            fields.insert("Reason".into(), Value::String(reason.to_string()));
        }
        fields.insert(
            "BannedAt".into(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        self.lists.upsert(ModerationList::Banned, &player, fields)?;

        if self.supervisor.players().is_online(&player) {
            if let Err(err) = self.kick(&player, reason.or(Some("banned"))).await {
                warn!("ban of {player} recorded but kick failed: {err}");
            }
        }
        Ok(player)
    }

    pub fn unban(&self, player: &str) -> Result<(PlayerId, bool), AdminError> {
        let player = validate_player_id(player)?;
        let removed = self.lists.remove(ModerationList::Banned, &player)?;
        Ok((player, removed))
    }

    /// Returns whether the player is whitelisted afterwards.
    pub fn whitelist(&self, action: ListAction, player: &str) -> Result<(PlayerId, bool), AdminError> {
        let player = validate_player_id(player)?;
        match action {
            ListAction::Add => {
                self.lists.upsert(ModerationList::Whitelist, &player, Map::new())?;
                Ok((player, true))
            }
            ListAction::Remove => {
                self.lists.remove(ModerationList::Whitelist, &player)?;
                Ok((player, false))
            }
        }
    }

    pub fn set_operator(&self, player: &str, enabled: bool) -> Result<PlayerId, AdminError> {
        let player = validate_player_id(player)?;
        if enabled {
            self.lists.upsert(ModerationList::Operators, &player, Map::new())?;
        } else {
            self.lists.remove(ModerationList::Operators, &player)?;
        }
        Ok(player)
    }

    pub fn moderation(&self) -> Result<ModerationSnapshot, AdminError> {
        self.lists.snapshot()
    }

    /// Online players; empty unless the server is Running.
    pub fn live_players(&self) -> Vec<PlayerRecord> {
        if self.supervisor.state() != ServerProcessState::Running {
            return Vec::new();
        }
        self.supervisor.players().list(now_millis())
    }
}
