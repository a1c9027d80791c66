//! Usage pings and crash telemetry for registered apps.

use tracing::{debug, info};

use crate::apps::AppEntry;
use crate::store::{
    ArchiveSweep, ArchivedCrash, CountLog, CountTable, CrashTable, IndividualCrash, InsertOutcome,
    StoreError, Update,
};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The app was asked for a table it never registered.
    #[error("app {app_id} has no {table} table")]
    Misconfigured {
        app_id: String,
        table: &'static str,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What happened to a reported crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashOutcome {
    Stored(InsertOutcome),
    /// Rejected by the app's crash filter.
    Filtered,
    /// Matches an archive marker and was dropped.
    Archived,
}

pub fn count_table(entry: &AppEntry) -> Result<&dyn CountTable, LedgerError> {
    entry
        .count
        .as_deref()
        .ok_or_else(|| LedgerError::Misconfigured {
            app_id: entry.app_id().to_owned(),
            table: "count",
        })
}

pub fn crash_table(entry: &AppEntry) -> Result<&dyn CrashTable, LedgerError> {
    entry
        .crash
        .as_deref()
        .ok_or_else(|| LedgerError::Misconfigured {
            app_id: entry.app_id().to_owned(),
            table: "crash",
        })
}

/// Records that an installation was active on `today` (`YYYYMMDD`).
///
/// Returns the log id the client should send with its next ping. Unknown or
/// absent ids start a new log; a known id is re-dated only when its stored
/// date is older than `today`.
pub async fn record_ping(
    table: &dyn CountTable,
    id: Option<&str>,
    platform: &str,
    today: u32,
) -> Result<String, StoreError> {
    if let Some(id) = id.filter(|id| !id.is_empty()) {
        match table.get(id).await {
            Ok(log) if log.date >= today => return Ok(log.id),
            Ok(log) => {
                table
                    .part_update(&log.id, &Update::new().set("date", today)?)
                    .await?;
                return Ok(log.id);
            }
            Err(StoreError::NotFound) => {
                debug!(id, "unknown count log id, starting a new one");
            }
            Err(e) => return Err(e),
        }
    }

    let log = CountLog {
        id: uuid::Uuid::now_v7().to_string(),
        platform: platform.to_owned(),
        date: today,
    };
    table.insert(&log).await?;
    Ok(log.id)
}

pub async fn count_for(table: &dyn CountTable, platform: &str) -> Result<usize, StoreError> {
    table.count(platform).await
}

/// Runs a crash through the app's filter and the archive gate, then stores it.
pub async fn report_crash(
    entry: &AppEntry,
    crash: IndividualCrash,
) -> Result<CrashOutcome, LedgerError> {
    let table = crash_table(entry)?;
    if let Some(filter) = &entry.crash_filter {
        if !filter.should_add_crash(&crash).await {
            debug!(app_id = entry.app_id(), version = %crash.version, "crash rejected by app filter");
            return Ok(CrashOutcome::Filtered);
        }
    }
    if table.is_archived(&crash).await? {
        debug!(app_id = entry.app_id(), error = %crash.error, "dropping archived crash");
        return Ok(CrashOutcome::Archived);
    }
    let outcome = table.insert_crash(crash).await?;
    Ok(CrashOutcome::Stored(outcome))
}

pub async fn delete_crash(entry: &AppEntry, crash_id: &str) -> Result<(), LedgerError> {
    crash_table(entry)?.remove(crash_id).await?;
    info!(app_id = entry.app_id(), crash_id, "audit: crash.delete");
    Ok(())
}

pub async fn archive_crash(
    entry: &AppEntry,
    marker: ArchivedCrash,
) -> Result<ArchiveSweep, LedgerError> {
    let table = crash_table(entry)?;
    let error = marker.error.clone();
    let sweep = table.archive(marker).await?;
    info!(
        app_id = entry.app_id(),
        %error,
        removed = sweep.removed,
        updated = sweep.updated,
        "audit: crash.archive"
    );
    Ok(sweep)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::apps::{App, CrashFilter, Registry, SimpleApp};
    use crate::store::{CountLog, RedbCrashTable, RedbTable, Store, Table};

    struct Fixture {
        _dir: tempfile::TempDir,
        counts: Arc<RedbTable<CountLog>>,
        crashes: Arc<RedbCrashTable>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("ledger.db")).unwrap();
        Fixture {
            counts: Arc::new(store.table("app_count").unwrap()),
            crashes: Arc::new(RedbCrashTable::open(&store, "app_crashes").unwrap()),
            _dir: dir,
        }
    }

    fn crash(version: &str, platform: &str) -> IndividualCrash {
        IndividualCrash {
            platform: platform.into(),
            version: version.into(),
            error: "E".into(),
            stack: "S\nframe 2".into(),
            count: 0,
        }
    }

    #[tokio::test]
    async fn same_day_ping_reuses_log() {
        let f = fixture();
        let id = record_ping(f.counts.as_ref(), None, "android", 20240301)
            .await
            .unwrap();
        let again = record_ping(f.counts.as_ref(), Some(&id), "android", 20240301)
            .await
            .unwrap();
        assert_eq!(id, again);
        assert_eq!(f.counts.count("all").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn next_day_ping_updates_in_place() {
        let f = fixture();
        let id = record_ping(f.counts.as_ref(), None, "ios", 20240301)
            .await
            .unwrap();
        let again = record_ping(f.counts.as_ref(), Some(&id), "ios", 20240302)
            .await
            .unwrap();
        assert_eq!(id, again);
        assert_eq!(f.counts.count("all").await.unwrap(), 1);
        assert_eq!(f.counts.get(&id).await.unwrap().date, 20240302);
    }

    #[tokio::test]
    async fn ping_never_moves_date_backwards() {
        let f = fixture();
        let id = record_ping(f.counts.as_ref(), None, "ios", 20240305)
            .await
            .unwrap();
        record_ping(f.counts.as_ref(), Some(&id), "ios", 20240301)
            .await
            .unwrap();
        assert_eq!(f.counts.get(&id).await.unwrap().date, 20240305);
    }

    #[tokio::test]
    async fn unknown_id_starts_new_log() {
        let f = fixture();
        let id = record_ping(f.counts.as_ref(), Some("stale-id"), "web", 20240301)
            .await
            .unwrap();
        assert_ne!(id, "stale-id");
        assert_eq!(f.counts.count("web").await.unwrap(), 1);
    }

    struct OnlyReleased {
        counts: Arc<RedbTable<CountLog>>,
        crashes: Arc<RedbCrashTable>,
    }

    struct ReleasedVersions;

    #[async_trait]
    impl CrashFilter for ReleasedVersions {
        async fn should_add_crash(&self, crash: &IndividualCrash) -> bool {
            crash.version == "1.0.0"
        }
    }

    impl App for OnlyReleased {
        fn app_id(&self) -> &str {
            "released"
        }
        fn count_table(&self) -> Option<Arc<dyn CountTable>> {
            Some(self.counts.clone())
        }
        fn crash_table(&self) -> Option<Arc<dyn CrashTable>> {
            Some(self.crashes.clone())
        }
        fn crash_filter(&self) -> Option<Arc<dyn CrashFilter>> {
            Some(Arc::new(ReleasedVersions))
        }
    }

    #[tokio::test]
    async fn filter_and_archive_gate_crashes() {
        let f = fixture();
        let registry = Registry::new(vec![Arc::new(OnlyReleased {
            counts: f.counts.clone(),
            crashes: f.crashes.clone(),
        })])
        .unwrap();
        let entry = registry.get("released").unwrap();

        assert_eq!(
            report_crash(entry, crash("0.9.0", "ios")).await.unwrap(),
            CrashOutcome::Filtered
        );
        assert_eq!(
            report_crash(entry, crash("1.0.0", "ios")).await.unwrap(),
            CrashOutcome::Stored(InsertOutcome::Created)
        );
        assert_eq!(
            report_crash(entry, crash("1.0.0", "ios")).await.unwrap(),
            CrashOutcome::Stored(InsertOutcome::Incremented)
        );

        archive_crash(
            entry,
            ArchivedCrash {
                error: "E".into(),
                stack: "S\nframe 2".into(),
                platform: "all".into(),
            },
        )
        .await
        .unwrap();
        assert_eq!(
            report_crash(entry, crash("1.0.0", "android")).await.unwrap(),
            CrashOutcome::Archived
        );
    }

    #[tokio::test]
    async fn missing_crash_table_is_misconfigured() {
        let f = fixture();
        let app = SimpleApp::new("counts-only", Some(f.counts.clone()), None);
        let registry = Registry::new(vec![Arc::new(app)]).unwrap();
        let entry = registry.get("counts-only").unwrap();
        assert!(matches!(
            report_crash(entry, crash("1.0.0", "ios")).await,
            Err(LedgerError::Misconfigured { table: "crash", .. })
        ));
        assert!(matches!(
            delete_crash(entry, "x").await,
            Err(LedgerError::Misconfigured { .. })
        ));
    }

    #[tokio::test]
    async fn deleting_unknown_crash_is_not_found() {
        let f = fixture();
        let app = SimpleApp::new("app", None, Some(f.crashes.clone()));
        let registry = Registry::new(vec![Arc::new(app)]).unwrap();
        let entry = registry.get("app").unwrap();
        assert!(matches!(
            delete_crash(entry, "missing").await,
            Err(LedgerError::Store(StoreError::NotFound))
        ));
    }
}
