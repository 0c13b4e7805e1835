mod csv_store;
mod sqlite_store;

pub use csv_store::CsvStore;
pub use sqlite_store::SqliteStore;

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::{Settings, StoreFormat};
use crate::error::StoreError;
use crate::identity::{IdentityRules, KeyIndex};
use crate::record::{Dataset, Record, Schema};

/// Persistent home of a dataset.
pub trait RecordStore: Send + Sync {
    /// Human-readable location, used in logs and errors.
    fn locator(&self) -> String;

    /// Fails with `StoreError::NotFound` when nothing was ever persisted.
    fn load(&self, schema: &Arc<Schema>) -> Result<Dataset, StoreError>;

    /// Replace the stored content with `dataset`. A failed call leaves the
    /// previous content intact.
    fn persist(&self, dataset: &Dataset) -> Result<(), StoreError>;
}

pub fn open_store(settings: &Settings) -> Box<dyn RecordStore> {
    match settings.store_format() {
        StoreFormat::Csv => Box::new(CsvStore::new(&settings.store_path).with_absent_marker(&settings.absent_marker)),
        StoreFormat::Sqlite => Box::new(SqliteStore::new(&settings.store_path, &settings.sqlite_table)),
    }
}

/// Load, treating a missing store as an empty baseline.
pub fn load_or_empty(store: &dyn RecordStore, schema: &Arc<Schema>) -> Result<Dataset, StoreError> {
    match store.load(schema) {
        Ok(dataset) => {
            info!("Loaded {} records from {}", dataset.len(), store.locator());
            Ok(dataset)
        }
        Err(StoreError::NotFound(locator)) => {
            info!("No store at {}, starting empty", locator);
            Ok(Dataset::new(Arc::clone(schema)))
        }
        Err(e) => Err(e),
    }
}

/// Whether `candidate` collides with any record already in `dataset`.
pub fn exists(dataset: &Dataset, candidate: &Record, rules: &IdentityRules) -> bool {
    KeyIndex::build(rules.clone(), dataset.records())
        .find(candidate)
        .is_some()
}

/// `dataset` followed by every record of `records` that collides neither with
/// `dataset` nor with an earlier record of the same batch.
pub fn append(dataset: Dataset, records: Vec<Record>, rules: &IdentityRules) -> Dataset {
    let mut index = KeyIndex::build(rules.clone(), dataset.records());
    let schema = Arc::clone(dataset.schema());
    let mut out = dataset.into_records();
    let mut skipped = 0usize;

    for record in records {
        let pos = out.len();
        match index.admit(&record, pos) {
            Ok(()) => out.push(record),
            Err(hit) => {
                skipped += 1;
                debug!("Skipping append: {} collides with row {}", hit.key, hit.pos);
            }
        }
    }

    if skipped > 0 {
        info!("Append skipped {} colliding records", skipped);
    }
    Dataset::with_records(schema, out)
}
