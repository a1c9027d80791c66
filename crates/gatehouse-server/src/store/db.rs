use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{de::DeserializeOwned, Serialize};

use super::{Filter, Record, StoreError, Table, Update};

macro_rules! backend_error {
    ($($err:ty),* $(,)?) => {
        $(
            impl From<$err> for StoreError {
                fn from(e: $err) -> Self {
                    StoreError::Backend(e.into())
                }
            }
        )*
    };
}

backend_error!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

/// Handle to the redb database file. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)
            .with_context(|| format!("open database at {}", path.display()))?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Opens (creating if needed) a record table named `name`.
    pub fn table<T: Record>(&self, name: &str) -> Result<RedbTable<T>, StoreError> {
        RedbTable::open(self, name)
    }
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Codec(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| StoreError::Codec(e.to_string()))
}

/// A named redb table holding bincode-encoded records keyed by [`Record::id`].
pub struct RedbTable<T> {
    pub(crate) db: Arc<Database>,
    pub(crate) name: String,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for RedbTable<T> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            name: self.name.clone(),
            _record: PhantomData,
        }
    }
}

impl<T: Record> RedbTable<T> {
    pub fn open(store: &Store, name: &str) -> Result<Self, StoreError> {
        let table = Self {
            db: store.db.clone(),
            name: name.to_owned(),
            _record: PhantomData,
        };
        let write_txn = table.db.begin_write()?;
        write_txn.open_table(table.def())?;
        write_txn.commit()?;
        Ok(table)
    }

    pub(crate) fn def(&self) -> TableDefinition<'_, &'static str, &'static [u8]> {
        TableDefinition::new(&self.name)
    }

    /// Decodes every record in the table.
    pub(crate) fn scan(&self) -> Result<Vec<T>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(self.def())?;

        let mut out = Vec::new();
        for item in table.iter()? {
            let (_k, v) = item?;
            out.push(decode(v.value())?);
        }
        Ok(out)
    }

    fn write(&self, id: &str, record: &T, must_exist: bool) -> Result<(), StoreError> {
        let bytes = encode(record)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(self.def())?;
            let exists = table.get(id)?.is_some();
            match (must_exist, exists) {
                (true, false) => return Err(StoreError::NotFound),
                (false, true) => return Err(StoreError::Exists(id.to_owned())),
                _ => {}
            }
            table.insert(id, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

#[async_trait]
impl<T: Record> Table<T> for RedbTable<T> {
    async fn get(&self, id: &str) -> Result<T, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(self.def())?;
        let found = table.get(id)?;
        match found {
            Some(v) => decode(v.value()),
            None => Err(StoreError::NotFound),
        }
    }

    async fn find(&self, filter: &Filter) -> Result<Vec<T>, StoreError> {
        let mut out = Vec::new();
        for record in self.scan()? {
            let value =
                serde_json::to_value(&record).map_err(|e| StoreError::Codec(e.to_string()))?;
            if filter.matches(&value) {
                out.push(record);
            }
        }
        if out.is_empty() {
            return Err(StoreError::NotFound);
        }
        Ok(out)
    }

    async fn insert(&self, record: &T) -> Result<(), StoreError> {
        self.write(record.id(), record, false)
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(self.def())?;
            let existed = table.remove(id)?.is_some();
            existed
        };
        write_txn.commit()?;
        if existed {
            Ok(())
        } else {
            Err(StoreError::NotFound)
        }
    }

    async fn full_update(&self, id: &str, record: &T) -> Result<(), StoreError> {
        self.write(id, record, true)
    }

    async fn part_update(&self, id: &str, update: &Update) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(self.def())?;
            let current: T = match table.get(id)? {
                Some(v) => decode(v.value())?,
                None => return Err(StoreError::NotFound),
            };
            let mut value =
                serde_json::to_value(&current).map_err(|e| StoreError::Codec(e.to_string()))?;
            update.apply(&mut value)?;
            let updated: T =
                serde_json::from_value(value).map_err(|e| StoreError::Codec(e.to_string()))?;
            let bytes = encode(&updated)?;
            table.insert(id, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}
