use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::OrchestrationError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    pub server_executable: PathBuf,
    pub data_directory: PathBuf,
    pub backup_directory: PathBuf,
    /// Back up only this subdirectory of the data directory (e.g. `Saves`).
    #[serde(default)]
    pub snapshot_subdir: Option<PathBuf>,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Launch arguments. `{data_dir}` and `{port}` are substituted.
    #[serde(default = "default_server_args")]
    pub server_args: Vec<String>,
    #[serde(default = "default_stop_command")]
    pub stop_command: String,
    /// Flag passed once per mod of the selected loadout, followed by the mod path.
    #[serde(default = "default_mod_path_arg")]
    pub mod_path_arg: String,

    #[serde(default = "default_interval_minutes")]
    pub backup_interval_minutes: u32,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_min_keep_count")]
    pub min_keep_count: u32,
    #[serde(default = "default_true")]
    pub backups_enabled: bool,

    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_graceful_stop_timeout_secs")]
    pub graceful_stop_timeout_secs: u64,
    #[serde(default = "default_scheduler_tick_secs")]
    pub scheduler_tick_secs: u64,
    /// How long a mutating command waits for the gate before failing with GateBusy.
    #[serde(default)]
    pub gate_wait_ms: u64,

    #[serde(default)]
    pub moderation: ModerationConfig,
    #[serde(default)]
    pub players: PlayerPatterns,
    #[serde(default)]
    pub loadouts_file: Option<PathBuf>,
}

/// Moderation list files, relative to the data directory unless absolute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationConfig {
    pub whitelist_file: PathBuf,
    pub banned_file: PathBuf,
    pub operators_file: PathBuf,
    /// Field of each list entry holding the player identifier.
    pub key_field: String,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            whitelist_file: PathBuf::from("Playerdata/playerswhitelisted.json"),
            banned_file: PathBuf::from("Playerdata/playersbanned.json"),
            operators_file: PathBuf::from("Playerdata/operators.json"),
            key_field: "PlayerName".to_string(),
        }
    }
}

/// Server log patterns used to track who is online. Each needs a `player` group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerPatterns {
    pub join: String,
    pub leave: String,
}

impl Default for PlayerPatterns {
    fn default() -> Self {
        Self {
            join: r"\[Server Event\] (?P<player>[A-Za-z0-9_.\-]+) \[[^\]]*\]:\d+ joins\.".to_string(),
            leave: r"\[Server Event\] Player (?P<player>[A-Za-z0-9_.\-]+) left\.".to_string(),
        }
    }
}

impl ManagerConfig {
    pub fn new(
        server_executable: impl Into<PathBuf>,
        data_directory: impl Into<PathBuf>,
        backup_directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            server_executable: server_executable.into(),
            data_directory: data_directory.into(),
            backup_directory: backup_directory.into(),
            snapshot_subdir: None,
            port: default_port(),
            server_args: default_server_args(),
            stop_command: default_stop_command(),
            mod_path_arg: default_mod_path_arg(),
            backup_interval_minutes: default_interval_minutes(),
            retention_days: default_retention_days(),
            min_keep_count: default_min_keep_count(),
            backups_enabled: true,
            startup_timeout_secs: default_startup_timeout_secs(),
            graceful_stop_timeout_secs: default_graceful_stop_timeout_secs(),
            scheduler_tick_secs: default_scheduler_tick_secs(),
            gate_wait_ms: 0,
            moderation: ModerationConfig::default(),
            players: PlayerPatterns::default(),
            loadouts_file: None,
        }
    }

    pub fn load(path: &Path) -> Result<Self, OrchestrationError> {
        let content = fs::read_to_string(path).map_err(|err| {
            invalid(format!("failed to read config {}: {err}", path.display()))
        })?;
        let config = serde_json::from_str::<Self>(&content).map_err(|err| {
            invalid(format!("failed to parse config {}: {err}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), OrchestrationError> {
        if self.server_executable.as_os_str().is_empty() {
            return Err(invalid("server_executable is empty"));
        }
        if !self.server_executable.is_file() {
            return Err(invalid(format!(
                "server executable not found: {}",
                self.server_executable.display()
            )));
        }
        if !self.data_directory.is_dir() {
            return Err(invalid(format!(
                "data directory not found: {}",
                self.data_directory.display()
            )));
        }
        if self.backup_directory.as_os_str().is_empty() {
            return Err(invalid("backup_directory is empty"));
        }

        let source = absolute(&self.snapshot_source())?;
        let backups = absolute(&self.backup_directory)?;
        if backups.starts_with(&source) || source.starts_with(&backups) {
            return Err(invalid(format!(
                "backup directory {} must not overlap the backed-up directory {}",
                backups.display(),
                source.display()
            )));
        }

        if self.port == 0 {
            return Err(invalid("port must be between 1 and 65535"));
        }
        for (name, value) in [
            ("backup_interval_minutes", u64::from(self.backup_interval_minutes)),
            ("retention_days", u64::from(self.retention_days)),
            ("min_keep_count", u64::from(self.min_keep_count)),
            ("startup_timeout_secs", self.startup_timeout_secs),
            ("graceful_stop_timeout_secs", self.graceful_stop_timeout_secs),
            ("scheduler_tick_secs", self.scheduler_tick_secs),
        ] {
            if value == 0 {
                return Err(invalid(format!("{name} must be a positive integer")));
            }
        }

        if self.stop_command.trim().is_empty() {
            return Err(invalid("stop_command is empty"));
        }
        if self.moderation.key_field.trim().is_empty() {
            return Err(invalid("moderation.key_field is empty"));
        }
        for (name, pattern) in [("players.join", &self.players.join), ("players.leave", &self.players.leave)] {
            let re = Regex::new(pattern).map_err(|err| invalid(format!("{name} is not a valid regex: {err}")))?;
            if !re.capture_names().any(|group| group == Some("player")) {
                return Err(invalid(format!("{name} needs a `player` capture group")));
            }
        }
        Ok(())
    }

    /// Directory captured by backups and replaced by restores.
    pub fn snapshot_source(&self) -> PathBuf {
        match &self.snapshot_subdir {
            Some(sub) => self.data_directory.join(sub),
            None => self.data_directory.clone(),
        }
    }

    pub fn data_path(&self, relative: &Path) -> PathBuf {
        if relative.is_absolute() {
            relative.to_path_buf()
        } else {
            self.data_directory.join(relative)
        }
    }

    pub fn loadouts_path(&self) -> PathBuf {
        self.loadouts_file
            .clone()
            .unwrap_or_else(|| self.backup_directory.join("loadouts.json"))
    }

    /// Launch arguments with placeholders filled in.
    pub fn launch_args(&self) -> Vec<String> {
        let data_dir = self.data_directory.display().to_string();
        let port = self.port.to_string();
        self.server_args
            .iter()
            .map(|arg| arg.replace("{data_dir}", &data_dir).replace("{port}", &port))
            .collect()
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn graceful_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_stop_timeout_secs)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_secs)
    }

    pub fn gate_wait(&self) -> Duration {
        Duration::from_millis(self.gate_wait_ms)
    }
}

/// Default location of the daemon config file.
pub fn default_config_path() -> Result<PathBuf, OrchestrationError> {
    if let Some(base) = dirs::config_dir() {
        return Ok(base.join("warden").join("config.json"));
    }
    if let Some(home) = dirs::home_dir() {
        return Ok(home.join(".warden").join("config.json"));
    }
    Err(invalid("unable to resolve a config directory"))
}

fn absolute(path: &Path) -> Result<PathBuf, OrchestrationError> {
    std::path::absolute(path).map_err(|err| invalid(format!("invalid path {}: {err}", path.display())))
}

fn invalid(message: impl Into<String>) -> OrchestrationError {
    OrchestrationError::InvalidConfiguration(message.into())
}

fn default_port() -> u16 {
    42420
}

fn default_server_args() -> Vec<String> {
    ["--dataPath", "{data_dir}", "--port", "{port}"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_stop_command() -> String {
    "/stop".to_string()
}

fn default_mod_path_arg() -> String {
    "--addModPath".to_string()
}

fn default_interval_minutes() -> u32 {
    60
}

fn default_retention_days() -> u32 {
    7
}

fn default_min_keep_count() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_startup_timeout_secs() -> u64 {
    120
}

fn default_graceful_stop_timeout_secs() -> u64 {
    30
}

fn default_scheduler_tick_secs() -> u64 {
    60
}
