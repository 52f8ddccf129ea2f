use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warden_proto::proto::{BackupId, BackupRecord};

use super::retention;
use crate::errors::OrchestrationError;
use crate::util::now_millis;

/// What the scheduler drives. Implemented by the controller so every scheduled
/// action passes through its gate.
#[async_trait]
pub trait ScheduleTarget: Send + Sync {
    fn last_backup_ms(&self) -> Option<u64>;

    /// Take a scheduled backup and apply retention in one hold of the gate.
    /// An error means no backup was taken; a prune failure is carried in the run.
    async fn scheduled_backup(&self) -> Result<ScheduledRun, OrchestrationError>;
}

#[derive(Debug)]
pub struct ScheduledRun {
    pub record: BackupRecord,
    pub pruned: Result<Vec<BackupId>, OrchestrationError>,
}

#[derive(Debug, Clone, Copy)]
pub struct ScheduleSettings {
    pub enabled: bool,
    pub interval_minutes: u32,
    pub tick: Duration,
}

#[derive(Debug)]
pub enum TickOutcome {
    Disabled,
    NotDue,
    /// The gate was held by another operation; the backup is retried next tick.
    Deferred,
    BackedUp {
        record: BackupId,
        pruned: Vec<BackupId>,
    },
    Failed(OrchestrationError),
}

pub struct Scheduler {
    settings: ScheduleSettings,
    target: Arc<dyn ScheduleTarget>,
}

impl Scheduler {
    pub fn new(settings: ScheduleSettings, target: Arc<dyn ScheduleTarget>) -> Self {
        Self { settings, target }
    }

    pub async fn tick(&self, now_ms: u64) -> TickOutcome {
        if !self.settings.enabled {
            return TickOutcome::Disabled;
        }
        let last = self.target.last_backup_ms();
        if !retention::is_backup_due(last, now_ms, self.settings.interval_minutes) {
            return TickOutcome::NotDue;
        }

        let ScheduledRun { record, pruned } = match self.target.scheduled_backup().await {
            Ok(run) => run,
            Err(err) if err.is_retryable() => {
                debug!("scheduled backup deferred: {err}");
                return TickOutcome::Deferred;
            }
            Err(err) => {
                warn!("scheduled backup failed: {err}");
                return TickOutcome::Failed(err);
            }
        };

        let pruned = match pruned {
            Ok(pruned) => pruned,
            Err(err) => {
                warn!("prune after scheduled backup {} failed: {err}", record.id);
                Vec::new()
            }
        };
        TickOutcome::BackedUp {
            record: record.id,
            pruned,
        }
    }

    /// Run until `cancel` fires. The first tick happens immediately.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "backup scheduler started: enabled={} interval={}m tick={:?}",
                self.settings.enabled, self.settings.interval_minutes, self.settings.tick
            );
            let mut ticker = interval(self.settings.tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let outcome = self.tick(now_millis()).await;
                        debug!("scheduler tick: {outcome:?}");
                    }
                }
            }
            info!("backup scheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{BackupError, Operation};
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use warden_proto::proto::BackupKind;

    #[derive(Default)]
    struct FakeTarget {
        last: Mutex<Option<u64>>,
        results: Mutex<VecDeque<Result<BackupRecord, OrchestrationError>>>,
        prune_error: Mutex<Option<OrchestrationError>>,
        backups: AtomicUsize,
        prunes: AtomicUsize,
    }

    impl FakeTarget {
        fn queue(&self, result: Result<BackupRecord, OrchestrationError>) {
            self.results.lock().expect("lock").push_back(result);
        }
    }

    fn record(id: &str) -> BackupRecord {
        BackupRecord {
            id: id.to_string(),
            kind: BackupKind::Scheduled,
            created_at_ms: 0,
            size_bytes: 0,
            source: PathBuf::from("/srv/data"),
            manifest: Vec::new(),
        }
    }

    #[async_trait]
    impl ScheduleTarget for FakeTarget {
        fn last_backup_ms(&self) -> Option<u64> {
            *self.last.lock().expect("lock")
        }

        async fn scheduled_backup(&self) -> Result<ScheduledRun, OrchestrationError> {
            self.backups.fetch_add(1, Ordering::SeqCst);
            let record = self
                .results
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| Ok(record("default")))?;
            self.prunes.fetch_add(1, Ordering::SeqCst);
            let pruned = match self.prune_error.lock().expect("lock").take() {
                Some(err) => Err(err),
                None => Ok(vec!["old".to_string()]),
            };
            Ok(ScheduledRun { record, pruned })
        }
    }

    fn scheduler(target: Arc<FakeTarget>, enabled: bool) -> Scheduler {
        let settings = ScheduleSettings {
            enabled,
            interval_minutes: 60,
            tick: Duration::from_millis(20),
        };
        Scheduler::new(settings, target)
    }

    #[tokio::test]
    async fn due_tick_backs_up_then_prunes() {
        let target = Arc::new(FakeTarget::default());
        target.queue(Ok(record("a")));
        let outcome = scheduler(target.clone(), true).tick(10 * 60_000).await;

        match outcome {
            TickOutcome::BackedUp { record, pruned } => {
                assert_eq!(record, "a");
                assert_eq!(pruned, ["old"]);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(target.prunes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_prune_still_reports_the_backup() {
        let target = Arc::new(FakeTarget::default());
        target.queue(Ok(record("b")));
        *target.prune_error.lock().expect("lock") =
            Some(BackupError::RecordNotFound("old".into()).into());

        match scheduler(target.clone(), true).tick(0).await {
            TickOutcome::BackedUp { record, pruned } => {
                assert_eq!(record, "b");
                assert!(pruned.is_empty());
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn not_due_and_disabled_do_nothing() {
        let target = Arc::new(FakeTarget::default());
        *target.last.lock().expect("lock") = Some(0);
        assert!(matches!(
            scheduler(target.clone(), true).tick(59 * 60_000).await,
            TickOutcome::NotDue
        ));
        assert!(matches!(
            scheduler(target.clone(), false).tick(600 * 60_000).await,
            TickOutcome::Disabled
        ));
        assert_eq!(target.backups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn busy_gate_defers_without_pruning() {
        let target = Arc::new(FakeTarget::default());
        target.queue(Err(OrchestrationError::GateBusy(Operation::Restore)));
        assert!(matches!(
            scheduler(target.clone(), true).tick(0).await,
            TickOutcome::Deferred
        ));

        target.queue(Err(BackupError::SourceUnavailable(PathBuf::from("/srv/data")).into()));
        assert!(matches!(
            scheduler(target.clone(), true).tick(0).await,
            TickOutcome::Failed(OrchestrationError::Backup(BackupError::SourceUnavailable(_)))
        ));
        assert_eq!(target.prunes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn spawned_loop_stops_on_cancel() {
        let target = Arc::new(FakeTarget::default());
        let cancel = CancellationToken::new();
        let handle = scheduler(target.clone(), true).spawn(cancel.clone());

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler exits")
            .expect("join");
        // The fake never records a backup time, so every tick was due.
        assert!(target.backups.load(Ordering::SeqCst) >= 2);
    }
}
