//! Persistence contract shared by every table the server touches, plus the
//! bundled redb implementation.
//!
//! The core only ever talks to [`Table`], [`CountTable`] and [`CrashTable`];
//! any store that honours their semantics can back a deployment.

pub mod count;
pub mod crash;
pub mod db;
pub mod model;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};

pub use crash::RedbCrashTable;
pub use db::{RedbTable, Store};
pub use model::{ApiKey, ArchivedCrash, CountLog, CrashReport, IndividualCrash, User};

/// A persisted value with a stable string identifier.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn id(&self) -> &str;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no matching records")]
    NotFound,
    #[error("record {0} already exists")]
    Exists(String),
    #[error("storage backend: {0}")]
    Backend(#[from] redb::Error),
    #[error("record encoding: {0}")]
    Codec(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }
}

/// Field equality filter used by [`Table::find`].
///
/// A record matches when each named field equals the given value. If the
/// record's field is an array, it matches when the array contains the value.
#[derive(Debug, Clone, Default)]
pub struct Filter(Map<String, Value>);

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.0.insert(field.to_owned(), value.into());
        self
    }

    pub fn matches(&self, record: &Value) -> bool {
        self.0.iter().all(|(field, want)| match record.get(field) {
            Some(Value::Array(items)) if !want.is_array() => items.contains(want),
            Some(have) => have == want,
            None => want.is_null(),
        })
    }
}

/// A set of top-level fields to overwrite with [`Table::part_update`].
#[derive(Debug, Clone, Default)]
pub struct Update(Map<String, Value>);

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field. Fails with [`StoreError::Codec`] when the value has no
    /// JSON representation.
    pub fn set(mut self, field: &str, value: impl Serialize) -> Result<Self, StoreError> {
        let value = serde_json::to_value(value)
            .map_err(|e| StoreError::Codec(format!("field {field}: {e}")))?;
        self.0.insert(field.to_owned(), value);
        Ok(self)
    }

    /// Overwrites the matching fields of a serialized record.
    pub fn apply(&self, record: &mut Value) -> Result<(), StoreError> {
        let obj = record
            .as_object_mut()
            .ok_or_else(|| StoreError::Codec("record is not an object".into()))?;
        for (field, value) in &self.0 {
            obj.insert(field.clone(), value.clone());
        }
        Ok(())
    }
}

#[async_trait]
pub trait Table<T: Record>: Send + Sync {
    async fn get(&self, id: &str) -> Result<T, StoreError>;
    /// Returns every record matching `filter`. Zero matches is
    /// [`StoreError::NotFound`], never an empty vector.
    async fn find(&self, filter: &Filter) -> Result<Vec<T>, StoreError>;
    async fn insert(&self, record: &T) -> Result<(), StoreError>;
    async fn remove(&self, id: &str) -> Result<(), StoreError>;
    async fn full_update(&self, id: &str, record: &T) -> Result<(), StoreError>;
    async fn part_update(&self, id: &str, update: &Update) -> Result<(), StoreError>;
}

#[async_trait]
pub trait CountTable: Table<CountLog> {
    /// Removes every log whose date is strictly before `date` (`YYYYMMDD`).
    async fn remove_older_than(&self, date: u32) -> Result<usize, StoreError>;
    /// Number of logs for `platform`; empty or `"all"` counts every platform.
    async fn count(&self, platform: &str) -> Result<usize, StoreError>;
}

/// How [`CrashTable::insert_crash`] recorded a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// An identical (stack, platform) entry had its count bumped.
    Incremented,
    /// A new entry was pushed onto an existing report.
    Appended,
    /// A new report was created.
    Created,
}

/// Reports touched by an archive sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveSweep {
    /// Reports deleted because every entry was archived.
    pub removed: usize,
    /// Reports rewritten with fewer entries.
    pub updated: usize,
}

#[async_trait]
pub trait CrashTable: Table<CrashReport> {
    /// Stores an archive marker and removes every crash entry it covers.
    async fn archive(&self, marker: ArchivedCrash) -> Result<ArchiveSweep, StoreError>;
    async fn is_archived(&self, crash: &IndividualCrash) -> Result<bool, StoreError>;
    /// Adds a crash, incrementing an identical entry, appending to a matching
    /// report, or creating a new report, in that order of preference.
    async fn insert_crash(&self, crash: IndividualCrash) -> Result<InsertOutcome, StoreError>;
}
