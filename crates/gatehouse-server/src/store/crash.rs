use async_trait::async_trait;
use redb::{ReadableTable, TableDefinition};

use super::db::{decode, encode, RedbTable, Store};
use super::model::{ArchivedCrash, CrashReport, IndividualCrash, ALL_PLATFORMS};
use super::{ArchiveSweep, CrashTable, Filter, InsertOutcome, StoreError, Table, Update};

/// Crash reports plus their archive markers, stored as two redb tables.
///
/// Insertion and archival each run in a single write transaction, so the
/// increment/append/create fallback and the archive sweep never interleave
/// with another writer.
#[derive(Clone)]
pub struct RedbCrashTable {
    reports: RedbTable<CrashReport>,
    archive: String,
}

impl RedbCrashTable {
    pub fn open(store: &Store, name: &str) -> Result<Self, StoreError> {
        let reports = RedbTable::open(store, name)?;
        let crash_table = Self {
            archive: format!("{name}_archive"),
            reports,
        };
        let write_txn = crash_table.reports.db.begin_write()?;
        write_txn.open_table(crash_table.archive_def())?;
        write_txn.commit()?;
        Ok(crash_table)
    }

    fn archive_def(&self) -> TableDefinition<'_, &'static str, &'static [u8]> {
        TableDefinition::new(&self.archive)
    }
}

fn archive_key(error: &str, stack: &str, platform: &str) -> String {
    format!("{error}\u{1f}{stack}\u{1f}{platform}")
}

#[async_trait]
impl Table<CrashReport> for RedbCrashTable {
    async fn get(&self, id: &str) -> Result<CrashReport, StoreError> {
        self.reports.get(id).await
    }

    async fn find(&self, filter: &Filter) -> Result<Vec<CrashReport>, StoreError> {
        self.reports.find(filter).await
    }

    async fn insert(&self, record: &CrashReport) -> Result<(), StoreError> {
        self.reports.insert(record).await
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.reports.remove(id).await
    }

    async fn full_update(&self, id: &str, record: &CrashReport) -> Result<(), StoreError> {
        self.reports.full_update(id, record).await
    }

    async fn part_update(&self, id: &str, update: &Update) -> Result<(), StoreError> {
        self.reports.part_update(id, update).await
    }
}

#[async_trait]
impl CrashTable for RedbCrashTable {
    async fn archive(&self, marker: ArchivedCrash) -> Result<ArchiveSweep, StoreError> {
        let marker = marker.normalized();
        let key = archive_key(&marker.error, &marker.stack, &marker.platform);
        let marker_bytes = encode(&marker)?;

        let write_txn = self.reports.db.begin_write()?;
        {
            let mut archive = write_txn.open_table(self.archive_def())?;
            archive.insert(key.as_str(), marker_bytes.as_slice())?;
        }
        let sweep = {
            let mut table = write_txn.open_table(self.reports.def())?;
            let mut group = Vec::new();
            for item in table.iter()? {
                let (_k, v) = item?;
                let report: CrashReport = decode(v.value())?;
                if report.error == marker.error && report.first_line == marker.first_line() {
                    group.push(report);
                }
            }

            let mut sweep = ArchiveSweep::default();
            for mut report in group {
                if report.prune(&marker) == 0 {
                    continue;
                }
                if report.individual.is_empty() {
                    table.remove(report.id.as_str())?;
                    sweep.removed += 1;
                } else {
                    let bytes = encode(&report)?;
                    table.insert(report.id.as_str(), bytes.as_slice())?;
                    sweep.updated += 1;
                }
            }
            sweep
        };
        write_txn.commit()?;
        Ok(sweep)
    }

    async fn is_archived(&self, crash: &IndividualCrash) -> Result<bool, StoreError> {
        let read_txn = self.reports.db.begin_read()?;
        let archive = read_txn.open_table(self.archive_def())?;
        for platform in [crash.platform.as_str(), ALL_PLATFORMS] {
            let key = archive_key(&crash.error, &crash.stack, platform);
            if archive.get(key.as_str())?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn insert_crash(&self, mut crash: IndividualCrash) -> Result<InsertOutcome, StoreError> {
        let write_txn = self.reports.db.begin_write()?;
        let outcome = {
            let mut table = write_txn.open_table(self.reports.def())?;
            let mut group = Vec::new();
            for item in table.iter()? {
                let (_k, v) = item?;
                let report: CrashReport = decode(v.value())?;
                if report.groups(&crash) {
                    group.push(report);
                }
            }

            let existing = group.iter_mut().find_map(|report| {
                let ind = report
                    .individual
                    .iter_mut()
                    .find(|ind| ind.stack == crash.stack && ind.platform == crash.platform)?;
                ind.count += 1;
                Some(report)
            });

            let (report, outcome) = if let Some(report) = existing {
                (report.clone(), InsertOutcome::Incremented)
            } else if let Some(report) = group.first_mut() {
                crash.count = 1;
                report.individual.push(crash);
                (report.clone(), InsertOutcome::Appended)
            } else {
                crash.count = 1;
                let report = CrashReport {
                    id: uuid::Uuid::now_v7().to_string(),
                    error: crash.error.clone(),
                    first_line: crash.first_line().to_owned(),
                    individual: vec![crash],
                };
                (report, InsertOutcome::Created)
            };

            let bytes = encode(&report)?;
            table.insert(report.id.as_str(), bytes.as_slice())?;
            outcome
        };
        write_txn.commit()?;
        Ok(outcome)
    }
}
