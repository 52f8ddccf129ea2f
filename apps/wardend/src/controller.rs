use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{Notify, RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warden_proto::proto::{
    BackupId, BackupKind, Command, Event, ModerationList, Outcome, Query, Snapshot,
};

use crate::admin::{ModerationStore, PlayerAdminGateway};
use crate::backup::{
    BackupVault, FsCopier, RetentionConfig, ScheduleSettings, ScheduleTarget, ScheduledRun, Scheduler,
    retention,
};
use crate::config::ManagerConfig;
use crate::errors::{OrchestrationError, Operation};
use crate::loadout::{self, LoadoutStore};
use crate::supervisor::{LaunchSpec, LogStore, PlayerTracker, ProcessSupervisor};
use crate::util::now_millis;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub retention: RetentionConfig,
    pub schedule: ScheduleSettings,
    pub stop_grace: Duration,
    pub gate_wait: Duration,
    pub mod_path_arg: String,
}

impl ControllerSettings {
    pub fn from_config(config: &ManagerConfig) -> Self {
        let retention = RetentionConfig::from_config(config);
        Self {
            retention,
            schedule: ScheduleSettings {
                enabled: config.backups_enabled,
                interval_minutes: retention.interval_minutes,
                tick: config.scheduler_tick(),
            },
            stop_grace: config.graceful_stop_timeout(),
            gate_wait: config.gate_wait(),
            mod_path_arg: config.mod_path_arg.clone(),
        }
    }
}

/// Single command/query surface for one managed server. Every mutating command
/// holds `gate` for its whole duration; restore additionally holds `exclusive`
/// for writing so queries wait until the data directory is consistent again.
/// `gate` names its holder, so it is taken and released under one lock.
pub struct OrchestrationController {
    settings: ControllerSettings,
    supervisor: ProcessSupervisor,
    vault: BackupVault,
    admin: PlayerAdminGateway,
    loadouts: LoadoutStore,
    gate: Mutex<Option<Operation>>,
    released: Notify,
    exclusive: RwLock<()>,
    events: broadcast::Sender<Event>,
    scheduler: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

struct GateGuard<'a> {
    gate: &'a Mutex<Option<Operation>>,
    released: &'a Notify,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        *self.gate.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.released.notify_waiters();
    }
}

impl OrchestrationController {
    pub fn from_config(config: &ManagerConfig, logs: LogStore) -> Result<Self, OrchestrationError> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let players = PlayerTracker::new(&config.players)
            .map_err(|err| OrchestrationError::InvalidConfiguration(err.to_string()))?;
        let supervisor = ProcessSupervisor::new(
            LaunchSpec::from_config(config),
            logs,
            players,
            events.clone(),
        );
        let vault = BackupVault::open(
            config.backup_directory.clone(),
            config.snapshot_source(),
            Arc::new(FsCopier),
            events.clone(),
        )?;
        let admin = PlayerAdminGateway::new(supervisor.clone(), ModerationStore::from_config(config));
        let loadouts = LoadoutStore::open(config.loadouts_path())?;

        Ok(Self::from_parts(
            ControllerSettings::from_config(config),
            supervisor,
            vault,
            admin,
            loadouts,
            events,
        ))
    }

    pub fn from_parts(
        settings: ControllerSettings,
        supervisor: ProcessSupervisor,
        vault: BackupVault,
        admin: PlayerAdminGateway,
        loadouts: LoadoutStore,
        events: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            settings,
            supervisor,
            vault,
            admin,
            loadouts,
            gate: Mutex::new(None),
            released: Notify::new(),
            exclusive: RwLock::new(()),
            events,
            scheduler: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn logs(&self) -> &LogStore {
        self.supervisor.logs()
    }

    fn gate(&self) -> MutexGuard<'_, Option<Operation>> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the gate for `op`, or report the operation holding it.
    fn try_enter(&self, op: Operation) -> Result<GateGuard<'_>, Operation> {
        let mut holder = self.gate();
        match *holder {
            Some(busy_with) => Err(busy_with),
            None => {
                *holder = Some(op);
                Ok(GateGuard {
                    gate: &self.gate,
                    released: &self.released,
                })
            }
        }
    }

    /// Wait for the gate until `deadline`, or forever without one.
    async fn wait_enter(
        &self,
        op: Operation,
        deadline: Option<Instant>,
    ) -> Result<GateGuard<'_>, OrchestrationError> {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            let busy_with = match self.try_enter(op) {
                Ok(guard) => return Ok(guard),
                Err(busy_with) => busy_with,
            };
            match deadline {
                Some(deadline) => timeout_at(deadline, released)
                    .await
                    .map_err(|_| OrchestrationError::GateBusy(busy_with))?,
                None => released.await,
            }
        }
    }

    async fn enter(&self, op: Operation) -> Result<GateGuard<'_>, OrchestrationError> {
        let busy_with = match self.try_enter(op) {
            Ok(guard) => return Ok(guard),
            Err(busy_with) => busy_with,
        };
        if op == Operation::Stop && busy_with == Operation::Stop {
            debug!("coalescing stop with the stop in flight");
            self.wait_enter(op, None).await
        } else if op != Operation::ScheduledBackup && !self.settings.gate_wait.is_zero() {
            self.wait_enter(op, Some(Instant::now() + self.settings.gate_wait))
                .await
        } else {
            info!("{op:?} rejected, {busy_with:?} in flight");
            Err(OrchestrationError::GateBusy(busy_with))
        }
    }

    pub async fn command(&self, command: Command) -> Result<Outcome, OrchestrationError> {
        match command {
            Command::Start {} => {
                let _gate = self.enter(Operation::Start).await?;
                let selected = self.loadouts.selected();
                let args = selected
                    .as_ref()
                    .map(|l| loadout::launch_args(l, &self.settings.mod_path_arg))
                    .unwrap_or_default();
                self.supervisor.start(&args).await?;
                self.loadouts.pin(selected.map(|l| l.name));
                let health = self.supervisor.health();
                Ok(Outcome::Started {
                    pid: health.pid,
                    started_at_ms: health.started_at_ms.unwrap_or_else(now_millis),
                })
            }
            Command::Stop { force } => {
                let _gate = self.enter(Operation::Stop).await?;
                let exit = self.supervisor.stop(!force, self.settings.stop_grace).await?;
                Ok(Outcome::Stopped { exit })
            }
            Command::Backup {} => {
                let _gate = self.enter(Operation::Backup).await?;
                let record = self.vault.create_backup(BackupKind::Manual).await?;
                Ok(Outcome::BackupCreated(record))
            }
            Command::Restore { id } => {
                let _gate = self.enter(Operation::Restore).await?;
                let _exclusive = self.exclusive.write().await;
                let report = self.vault.restore(&id, self.supervisor.state()).await?;
                Ok(Outcome::Restored {
                    record: report.record,
                    safety_archive: report.safety_archive,
                })
            }
            Command::Prune {} => {
                let _gate = self.enter(Operation::Prune).await?;
                let removed = self.prune_selected().await?;
                Ok(Outcome::Pruned { removed })
            }
            Command::DeleteBackup { id } => {
                let _gate = self.enter(Operation::DeleteBackup).await?;
                self.vault.delete(&id).await?;
                Ok(Outcome::BackupDeleted { id })
            }
            Command::SendConsole { line } => {
                let _gate = self.enter(Operation::Console).await?;
                self.supervisor.send_command(&line).await?;
                Ok(Outcome::ConsoleSent {})
            }
            Command::Kick { player, reason } => {
                let _gate = self.enter(Operation::Moderation).await?;
                let player = self.admin.kick(&player, reason.as_deref()).await?;
                Ok(Outcome::PlayerKicked { player })
            }
            Command::Ban { player, reason } => {
                let _gate = self.enter(Operation::Moderation).await?;
                let player = self.admin.ban(&player, reason.as_deref()).await?;
                Ok(Outcome::ModerationUpdated {
                    list: ModerationList::Banned,
                    player,
                    listed: true,
                })
            }
            Command::Unban { player } => {
                let _gate = self.enter(Operation::Moderation).await?;
                let (player, _) = self.admin.unban(&player)?;
                Ok(Outcome::ModerationUpdated {
                    list: ModerationList::Banned,
                    player,
                    listed: false,
                })
            }
            Command::Whitelist { action, player } => {
                let _gate = self.enter(Operation::Moderation).await?;
                let (player, listed) = self.admin.whitelist(action, &player)?;
                Ok(Outcome::ModerationUpdated {
                    list: ModerationList::Whitelist,
                    player,
                    listed,
                })
            }
            Command::SetOperator { player, enabled } => {
                let _gate = self.enter(Operation::Moderation).await?;
                let player = self.admin.set_operator(&player, enabled)?;
                Ok(Outcome::ModerationUpdated {
                    list: ModerationList::Operators,
                    player,
                    listed: enabled,
                })
            }
            Command::SaveLoadout(loadout) => {
                let _gate = self.enter(Operation::Loadout).await?;
                let name = loadout.name.trim().to_string();
                self.loadouts.save(loadout, self.supervisor.state().is_active())?;
                Ok(Outcome::LoadoutSaved { name })
            }
            Command::DeleteLoadout { name } => {
                let _gate = self.enter(Operation::Loadout).await?;
                self.loadouts.delete(&name, self.supervisor.state().is_active())?;
                Ok(Outcome::LoadoutDeleted { name })
            }
            Command::SelectLoadout { name } => {
                let _gate = self.enter(Operation::Loadout).await?;
                self.loadouts.select(name.clone())?;
                Ok(Outcome::LoadoutSelected { name })
            }
        }
    }

    /// Read-only views. Never wait on the gate; only a restore in progress delays them.
    pub async fn query(&self, query: Query) -> Result<Snapshot, OrchestrationError> {
        let _shared = self.exclusive.read().await;
        let snapshot = match query {
            Query::Health {} => Snapshot::Health(self.supervisor.health()),
            Query::BackupList {} => Snapshot::Backups(self.vault.list()),
            Query::PlayerList {} => Snapshot::Players(self.admin.live_players()),
            Query::Moderation {} => Snapshot::Moderation(self.admin.moderation()?),
            Query::Loadouts {} => {
                let (loadouts, selected) = self.loadouts.list();
                Snapshot::Loadouts { loadouts, selected }
            }
            Query::Logs { lines } => Snapshot::Logs {
                lines: self.supervisor.logs().tail_server(lines),
            },
            Query::ManagerLogs { lines } => Snapshot::Logs {
                lines: self.supervisor.logs().tail_manager(lines),
            },
        };
        Ok(snapshot)
    }

    async fn prune_selected(&self) -> Result<Vec<BackupId>, OrchestrationError> {
        let policy = self.settings.retention;
        let selected = retention::select_for_pruning(
            &self.vault.list(),
            now_millis(),
            policy.retention_days,
            policy.min_keep_count,
        );
        if selected.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<BackupId> = selected.into_iter().collect();
        Ok(self.vault.prune(&ids).await?)
    }

    /// Start the periodic backup task. Idempotent.
    pub fn start_scheduler(self: &Arc<Self>) {
        let mut slot = self.scheduler.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let target: Arc<dyn ScheduleTarget> = self.clone();
        let handle = Scheduler::new(self.settings.schedule, target).spawn(cancel.clone());
        *slot = Some((cancel, handle));
    }

    /// Stop the scheduler, then stop the server gracefully.
    pub async fn shutdown(&self) {
        let scheduler = self
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((cancel, handle)) = scheduler {
            cancel.cancel();
            if let Err(err) = handle.await {
                warn!("scheduler task ended abnormally: {err}");
            }
        }

        let _gate = match self.wait_enter(Operation::Stop, None).await {
            Ok(guard) => guard,
            Err(err) => {
                warn!("could not take the gate for shutdown: {err}");
                return;
            }
        };
        if let Err(err) = self.supervisor.stop(true, self.settings.stop_grace).await {
            warn!("server stop during shutdown failed: {err}");
        }
        info!("orchestration shut down");
    }
}

#[async_trait]
impl ScheduleTarget for OrchestrationController {
    fn last_backup_ms(&self) -> Option<u64> {
        self.vault.last_backup_ms()
    }

    async fn scheduled_backup(&self) -> Result<ScheduledRun, OrchestrationError> {
        let _gate = self.enter(Operation::ScheduledBackup).await?;
        let record = self.vault.create_backup(BackupKind::Scheduled).await?;
        let pruned = self.prune_selected().await;
        Ok(ScheduledRun { record, pruned })
    }
}
