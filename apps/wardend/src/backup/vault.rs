use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task;
use tracing::{debug, info, warn};
use warden_proto::proto::{
    BackupEvent, BackupId, BackupKind, BackupRecord, Event, ManifestEntry, ServerProcessState,
};

use super::manifest::{self, TreeCopier};
use crate::errors::BackupError;

const RECORD_FILE: &str = "record.json";
const DATA_DIR: &str = "data";
const PARTIAL_PREFIX: &str = ".partial-";
const LIVE_COPY_ATTEMPTS: u32 = 3;

/// Backup catalog rooted in one directory: `<root>/<id>/{record.json,data/}`.
pub struct BackupVault {
    inner: Arc<VaultPaths>,
    copier: Arc<dyn TreeCopier>,
    catalog: Mutex<Catalog>,
    busy: AtomicBool,
    events: broadcast::Sender<Event>,
}

#[derive(Debug)]
struct VaultPaths {
    root: PathBuf,
    source: PathBuf,
}

#[derive(Default)]
struct Catalog {
    records: BTreeMap<BackupId, BackupRecord>,
    last_issued_ms: u64,
}

/// Marks the single backup slot as taken until dropped.
struct BackupSlot<'a>(&'a AtomicBool);

impl Drop for BackupSlot<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub record: BackupRecord,
    pub safety_archive: BackupRecord,
}

impl BackupVault {
    /// Open the vault, sweeping partial backups and finishing an interrupted restore swap.
    pub fn open(
        root: PathBuf,
        source: PathBuf,
        copier: Arc<dyn TreeCopier>,
        events: broadcast::Sender<Event>,
    ) -> Result<Self, BackupError> {
        fs::create_dir_all(&root)
            .map_err(|err| BackupError::io(format!("creating {}", root.display()), err))?;
        recover_restore_leftovers(&source)?;

        let mut catalog = Catalog::default();
        let entries = fs::read_dir(&root)
            .map_err(|err| BackupError::io(format!("scanning {}", root.display()), err))?;
        for entry in entries {
            let entry = entry.map_err(|err| BackupError::io("scanning backups", err))?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if !path.is_dir() {
                continue;
            }
            if name.starts_with(PARTIAL_PREFIX) {
                info!("removing partial backup {}", path.display());
                if let Err(err) = fs::remove_dir_all(&path) {
                    warn!("failed to remove partial backup {}: {err}", path.display());
                }
                continue;
            }
            match read_record(&path) {
                Ok(record) if record.id == name => {
                    catalog.last_issued_ms = catalog.last_issued_ms.max(record.created_at_ms);
                    catalog.records.insert(record.id.clone(), record);
                }
                Ok(record) => warn!("skipping {}: record id {} does not match", path.display(), record.id),
                Err(err) => debug!("skipping {}: {err}", path.display()),
            }
        }
        info!("backup vault opened with {} records", catalog.records.len());

        Ok(Self {
            inner: Arc::new(VaultPaths { root, source }),
            copier,
            catalog: Mutex::new(catalog),
            busy: AtomicBool::new(false),
            events,
        })
    }

    fn catalog(&self) -> MutexGuard<'_, Catalog> {
        self.catalog.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claim(&self) -> Result<BackupSlot<'_>, BackupError> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| BackupSlot(&self.busy))
            .map_err(|_| BackupError::ConcurrentBackupInProgress)
    }

    /// Newest first.
    pub fn list(&self) -> Vec<BackupRecord> {
        self.catalog().records.values().rev().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<BackupRecord> {
        self.catalog().records.get(id).cloned()
    }

    /// Cadence reference: the newest record that is not a safety archive.
    pub fn last_backup_ms(&self) -> Option<u64> {
        self.catalog()
            .records
            .values()
            .rev()
            .find(|r| r.kind != BackupKind::SafetyArchive)
            .map(|r| r.created_at_ms)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub async fn create_backup(&self, kind: BackupKind) -> Result<BackupRecord, BackupError> {
        let _slot = self.claim()?;
        self.snapshot(kind).await
    }

    async fn snapshot(&self, kind: BackupKind) -> Result<BackupRecord, BackupError> {
        if !self.inner.source.is_dir() {
            return Err(BackupError::SourceUnavailable(self.inner.source.clone()));
        }

        let (id, created_at_ms) = self.next_id();
        let paths = self.inner.clone();
        let copier = self.copier.clone();
        let record = {
            let id = id.clone();
            task::spawn_blocking(move || write_snapshot(&paths, copier.as_ref(), id, kind, created_at_ms))
                .await
                .map_err(|err| BackupError::io("joining backup task", std::io::Error::other(err)))??
        };

        self.catalog().records.insert(record.id.clone(), record.clone());
        info!(
            "backup created: id={} kind={:?} size={} entries={}",
            record.id,
            record.kind,
            record.size_bytes,
            record.manifest.len()
        );
        let _ = self.events.send(Event::Backup(BackupEvent::Created(record.clone())));
        Ok(record)
    }

    /// Archive the live data, then swap the target record's data in.
    pub async fn restore(
        &self,
        id: &str,
        server_state: ServerProcessState,
    ) -> Result<RestoreReport, BackupError> {
        if server_state != ServerProcessState::Stopped {
            return Err(BackupError::ServerMustBeStopped(server_state));
        }
        let record = self
            .get(id)
            .ok_or_else(|| BackupError::RecordNotFound(id.to_string()))?;
        let _slot = self.claim()?;

        let safety_archive = self
            .snapshot(BackupKind::SafetyArchive)
            .await
            .map_err(|err| {
                warn!("safety archive failed, restore of {id} aborted: {err}");
                BackupError::SafetyArchiveFailed(Box::new(err))
            })?;

        let paths = self.inner.clone();
        let copier = self.copier.clone();
        let target = record.clone();
        task::spawn_blocking(move || swap_in(&paths, copier.as_ref(), &target))
            .await
            .map_err(|err| BackupError::io("joining restore task", std::io::Error::other(err)))??;

        info!(
            "restored backup {} (safety archive {})",
            record.id, safety_archive.id
        );
        let _ = self.events.send(Event::Backup(BackupEvent::Restored {
            id: record.id.clone(),
            safety_archive: safety_archive.id.clone(),
        }));
        Ok(RestoreReport {
            record,
            safety_archive,
        })
    }

    /// Remove a record regardless of retention limits.
    pub async fn delete(&self, id: &str) -> Result<(), BackupError> {
        self.remove(id).await?;
        info!("backup deleted: {id}");
        let _ = self.events.send(Event::Backup(BackupEvent::Deleted { id: id.to_string() }));
        Ok(())
    }

    /// Remove every listed record, stopping at the first failure.
    pub async fn prune(&self, ids: &[BackupId]) -> Result<Vec<BackupId>, BackupError> {
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Err(err) = self.remove(id).await {
                if !removed.is_empty() {
                    let _ = self.events.send(Event::Backup(BackupEvent::Pruned { ids: removed }));
                }
                return Err(err);
            }
            removed.push(id.clone());
        }
        if !removed.is_empty() {
            info!("pruned {} backups: {}", removed.len(), removed.join(", "));
            let _ = self.events.send(Event::Backup(BackupEvent::Pruned { ids: removed.clone() }));
        }
        Ok(removed)
    }

    async fn remove(&self, id: &str) -> Result<(), BackupError> {
        if !self.catalog().records.contains_key(id) {
            return Err(BackupError::RecordNotFound(id.to_string()));
        }
        let dir = self.inner.root.join(id);
        task::spawn_blocking(move || match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(BackupError::io(format!("removing {}", dir.display()), err)),
        })
        .await
        .map_err(|err| BackupError::io("joining delete task", std::io::Error::other(err)))??;
        self.catalog().records.remove(id);
        Ok(())
    }

    /// Timestamp ids, strictly increasing even when two land in the same millisecond.
    fn next_id(&self) -> (BackupId, u64) {
        let mut catalog = self.catalog();
        let now = Utc::now().timestamp_millis().max(0) as u64;
        let ms = now.max(catalog.last_issued_ms + 1);
        catalog.last_issued_ms = ms;
        (format_id(ms), ms)
    }
}

fn format_id(ms: u64) -> BackupId {
    let at = DateTime::<Utc>::from_timestamp_millis(ms as i64).unwrap_or_default();
    at.format("%Y%m%dT%H%M%S%.3fZ").to_string()
}

fn read_record(dir: &Path) -> Result<BackupRecord, BackupError> {
    let path = dir.join(RECORD_FILE);
    let content = fs::read_to_string(&path)
        .map_err(|err| BackupError::io(format!("reading {}", path.display()), err))?;
    serde_json::from_str(&content).map_err(|err| {
        BackupError::io(
            format!("parsing {}", path.display()),
            std::io::Error::new(std::io::ErrorKind::InvalidData, err),
        )
    })
}

/// Copy into a partial directory and check the copy against the source tree.
/// Copies taken while the server runs get a few attempts; a safety archive gets one.
fn copy_verified(
    paths: &VaultPaths,
    copier: &dyn TreeCopier,
    data: &Path,
    kind: BackupKind,
) -> Result<Vec<ManifestEntry>, BackupError> {
    let attempts = match kind {
        BackupKind::SafetyArchive => 1,
        BackupKind::Manual | BackupKind::Scheduled => LIVE_COPY_ATTEMPTS,
    };
    let mut attempt = 1;
    loop {
        if data.exists() {
            fs::remove_dir_all(data)
                .map_err(|err| BackupError::io(format!("clearing {}", data.display()), err))?;
        }
        copier
            .copy_tree(&paths.source, data)
            .map_err(|err| BackupError::io(format!("copying {}", paths.source.display()), err))?;
        let expected = manifest::build_manifest(&paths.source).map_err(|err| {
            BackupError::io(format!("building manifest of {}", paths.source.display()), err)
        })?;
        match manifest::verify(data, &expected) {
            Ok(()) => return Ok(expected),
            Err(err) if attempt < attempts => {
                warn!("backup copy differs from the source (attempt {attempt}/{attempts}): {err}");
                attempt += 1;
            }
            Err(err) => return Err(BackupError::io("verifying backup copy against the source", err)),
        }
    }
}

/// Copy and verify into a partial directory, then publish it with a rename.
fn write_snapshot(
    paths: &VaultPaths,
    copier: &dyn TreeCopier,
    id: BackupId,
    kind: BackupKind,
    created_at_ms: u64,
) -> Result<BackupRecord, BackupError> {
    let partial = paths.root.join(format!("{PARTIAL_PREFIX}{id}"));
    let result = (|| {
        let data = partial.join(DATA_DIR);
        let manifest = copy_verified(paths, copier, &data, kind)?;

        let record = BackupRecord {
            id: id.clone(),
            kind,
            created_at_ms,
            size_bytes: manifest::total_size(&manifest),
            source: paths.source.clone(),
            manifest,
        };
        let json = serde_json::to_vec_pretty(&record).map_err(|err| {
            BackupError::io("encoding backup record", std::io::Error::other(err))
        })?;
        fs::write(partial.join(RECORD_FILE), json)
            .map_err(|err| BackupError::io("writing backup record", err))?;

        let final_dir = paths.root.join(&id);
        fs::rename(&partial, &final_dir)
            .map_err(|err| BackupError::io(format!("publishing {}", final_dir.display()), err))?;
        Ok(record)
    })();

    if result.is_err() && partial.exists() {
        if let Err(err) = fs::remove_dir_all(&partial) {
            warn!("failed to clean up partial backup {}: {err}", partial.display());
        }
    }
    result
}

fn sibling(source: &Path, tag: &str, id: &str) -> PathBuf {
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "data".to_string());
    let parent = source.parent().unwrap_or_else(|| Path::new("."));
    parent.join(format!(".{name}.{tag}-{id}"))
}

/// Stage the record beside the live directory, verify it, then swap with two renames.
/// The old tree is deleted only after the new one is in place.
fn swap_in(paths: &VaultPaths, copier: &dyn TreeCopier, record: &BackupRecord) -> Result<(), BackupError> {
    let source = &paths.source;
    let data = paths.root.join(&record.id).join(DATA_DIR);
    manifest::verify(&data, &record.manifest)
        .map_err(|err| BackupError::io(format!("verifying backup {}", record.id), err))?;

    let staging = sibling(source, "restore", &record.id);
    let old = sibling(source, "old", &record.id);
    if staging.exists() {
        fs::remove_dir_all(&staging)
            .map_err(|err| BackupError::io(format!("clearing {}", staging.display()), err))?;
    }

    let staged = copier
        .copy_tree(&data, &staging)
        .map_err(|err| BackupError::io(format!("staging backup {}", record.id), err))
        .and_then(|()| {
            manifest::verify(&staging, &record.manifest)
                .map_err(|err| BackupError::io("verifying staged restore", err))
        });
    if let Err(err) = staged {
        let _ = fs::remove_dir_all(&staging);
        return Err(err);
    }

    fs::rename(source, &old).map_err(|err| {
        let _ = fs::remove_dir_all(&staging);
        BackupError::io(format!("moving aside {}", source.display()), err)
    })?;
    if let Err(err) = fs::rename(&staging, source) {
        if let Err(undo) = fs::rename(&old, source) {
            warn!("failed to put {} back: {undo}", source.display());
        }
        let _ = fs::remove_dir_all(&staging);
        return Err(BackupError::io(format!("swapping in {}", record.id), err));
    }
    debug!("restore swap complete for {}", record.id);

    if let Err(err) = fs::remove_dir_all(&old) {
        warn!("failed to remove replaced data {}: {err}", old.display());
    }
    Ok(())
}

/// Undo what a crash in the middle of `swap_in` left behind.
fn recover_restore_leftovers(source: &Path) -> Result<(), BackupError> {
    let Some(parent) = source.parent() else {
        return Ok(());
    };
    let Some(name) = source.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return Ok(());
    };
    let Ok(entries) = fs::read_dir(parent) else {
        return Ok(());
    };

    let old_prefix = format!(".{name}.old-");
    let staging_prefix = format!(".{name}.restore-");
    for entry in entries.flatten() {
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();
        if file_name.starts_with(&old_prefix) {
            if source.exists() {
                info!("removing replaced data left by an earlier restore: {}", path.display());
                let _ = fs::remove_dir_all(&path);
            } else {
                warn!("restore was interrupted, moving {} back", path.display());
                fs::rename(&path, source).map_err(|err| {
                    BackupError::io(format!("recovering {}", source.display()), err)
                })?;
            }
        } else if file_name.starts_with(&staging_prefix) {
            info!("removing staged restore {}", path.display());
            let _ = fs::remove_dir_all(&path);
        }
    }
    Ok(())
}
