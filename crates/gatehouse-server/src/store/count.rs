use async_trait::async_trait;
use redb::ReadableTable;

use super::db::{decode, RedbTable};
use super::model::{CountLog, ALL_PLATFORMS};
use super::{CountTable, StoreError};

#[async_trait]
impl CountTable for RedbTable<CountLog> {
    async fn remove_older_than(&self, date: u32) -> Result<usize, StoreError> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(self.def())?;
            let mut stale = Vec::new();
            for item in table.iter()? {
                let (k, v) = item?;
                let log: CountLog = decode(v.value())?;
                if log.date < date {
                    stale.push(k.value().to_owned());
                }
            }
            for id in &stale {
                table.remove(id.as_str())?;
            }
            stale.len()
        };
        write_txn.commit()?;
        Ok(removed)
    }

    async fn count(&self, platform: &str) -> Result<usize, StoreError> {
        let logs = self.scan()?;
        if platform.is_empty() || platform == ALL_PLATFORMS {
            return Ok(logs.len());
        }
        Ok(logs.iter().filter(|l| l.platform == platform).count())
    }
}
