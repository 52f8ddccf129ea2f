//! Pure retention decisions. No I/O, no clock reads.

use std::collections::BTreeSet;

use warden_proto::proto::{BackupId, BackupRecord};

const MINUTE_MS: u64 = 60_000;
const DAY_MS: u64 = 24 * 60 * MINUTE_MS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionConfig {
    pub interval_minutes: u32,
    pub retention_days: u32,
    pub min_keep_count: u32,
}

impl RetentionConfig {
    pub fn from_config(config: &crate::config::ManagerConfig) -> Self {
        Self {
            interval_minutes: config.backup_interval_minutes,
            retention_days: config.retention_days,
            min_keep_count: config.min_keep_count,
        }
    }
}

/// Due when nothing has been backed up yet or the interval has fully elapsed.
pub fn is_backup_due(last_backup_ms: Option<u64>, now_ms: u64, interval_minutes: u32) -> bool {
    match last_backup_ms {
        None => true,
        Some(last) => now_ms.saturating_sub(last) >= u64::from(interval_minutes) * MINUTE_MS,
    }
}

/// Records older than `retention_days`, oldest first, stopping as soon as
/// one more removal would leave fewer than `min_keep_count` records.
/// A floor of zero is treated as one so the catalog never empties.
pub fn select_for_pruning(
    catalog: &[BackupRecord],
    now_ms: u64,
    retention_days: u32,
    min_keep_count: u32,
) -> BTreeSet<BackupId> {
    let floor = min_keep_count.max(1) as usize;
    let max_age_ms = u64::from(retention_days) * DAY_MS;

    let mut oldest_first: Vec<&BackupRecord> = catalog.iter().collect();
    oldest_first.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms).then_with(|| a.id.cmp(&b.id)));

    let mut remaining = oldest_first.len();
    let mut selected = BTreeSet::new();
    for record in oldest_first {
        if remaining <= floor {
            break;
        }
        if now_ms.saturating_sub(record.created_at_ms) <= max_age_ms {
            break;
        }
        selected.insert(record.id.clone());
        remaining -= 1;
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::path::PathBuf;
    use warden_proto::proto::BackupKind;

    const NOW: u64 = 1_000 * DAY_MS;

    fn record(age_days: u64) -> BackupRecord {
        let created_at_ms = NOW - age_days * DAY_MS;
        BackupRecord {
            id: format!("backup-{created_at_ms:016}"),
            kind: BackupKind::Scheduled,
            created_at_ms,
            size_bytes: 0,
            source: PathBuf::from("/srv/data"),
            manifest: Vec::new(),
        }
    }

    #[test]
    fn first_backup_is_always_due() {
        assert!(is_backup_due(None, NOW, 60));
    }

    #[test]
    fn due_once_the_interval_elapses() {
        let last = NOW - 59 * MINUTE_MS;
        assert!(!is_backup_due(Some(last), NOW, 60));
        assert!(is_backup_due(Some(last), NOW + MINUTE_MS, 60));
        // A clock that went backwards is never due.
        assert!(!is_backup_due(Some(NOW + MINUTE_MS), NOW, 60));
    }

    #[test]
    fn floor_stops_pruning_of_expired_records() {
        let catalog: Vec<_> = [1, 8, 9, 10, 40].into_iter().map(record).collect();
        let pruned = select_for_pruning(&catalog, NOW, 7, 3);

        let expected: BTreeSet<_> = [record(40).id, record(10).id].into_iter().collect();
        assert_eq!(pruned, expected);
    }

    #[test]
    fn young_records_are_never_pruned() {
        let catalog: Vec<_> = [0, 1, 2, 3, 6].into_iter().map(record).collect();
        assert!(select_for_pruning(&catalog, NOW, 7, 1).is_empty());
    }

    #[test]
    fn zero_floor_still_keeps_one() {
        let catalog: Vec<_> = [30, 40, 50].into_iter().map(record).collect();
        let pruned = select_for_pruning(&catalog, NOW, 7, 0);
        assert_eq!(pruned.len(), 2);
        assert!(!pruned.contains(&record(30).id));
    }

    #[test]
    fn selection_ignores_catalog_order() {
        let mut catalog: Vec<_> = [40, 1, 10, 9, 8].into_iter().map(record).collect();
        let a = select_for_pruning(&catalog, NOW, 7, 3);
        catalog.reverse();
        assert_eq!(a, select_for_pruning(&catalog, NOW, 7, 3));
    }

    proptest! {
        #[test]
        fn pruning_never_breaches_the_floor(
            ages in proptest::collection::vec(0u64..60, 0..25),
            retention_days in 1u32..30,
            min_keep in 0u32..10,
        ) {
            let catalog: Vec<_> = ages
                .iter()
                .enumerate()
                .map(|(i, age)| {
                    let mut r = record(*age);
                    r.id = format!("{}-{i:02}", r.id);
                    r
                })
                .collect();
            let pruned = select_for_pruning(&catalog, NOW, retention_days, min_keep);

            let floor = (min_keep.max(1) as usize).min(catalog.len());
            prop_assert!(catalog.len() - pruned.len() >= floor);

            let max_age = u64::from(retention_days) * DAY_MS;
            for r in catalog.iter().filter(|r| pruned.contains(&r.id)) {
                prop_assert!(NOW - r.created_at_ms > max_age);
                // Anything older than a pruned record is pruned too.
                for older in catalog.iter().filter(|o| o.created_at_ms < r.created_at_ms) {
                    prop_assert!(pruned.contains(&older.id));
                }
            }
        }
    }
}
