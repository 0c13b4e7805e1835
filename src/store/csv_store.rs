use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::NamedTempFile;
use tracing::warn;

use super::RecordStore;
use crate::error::StoreError;
use crate::record::{Dataset, Record, Schema};

/// Header row plus one line per record.
///
/// Absent values are written as `absent_marker` (empty by default) and read
/// back as absent, so with the default marker an empty string does not
/// survive a round trip.
pub struct CsvStore {
    path: PathBuf,
    absent_marker: String,
}

impl CsvStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        CsvStore {
            path: path.as_ref().to_path_buf(),
            absent_marker: String::new(),
        }
    }

    pub fn with_absent_marker(mut self, marker: &str) -> Self {
        self.absent_marker = marker.to_string();
        self
    }

    fn cell(&self, raw: &str) -> Option<String> {
        if raw == self.absent_marker {
            None
        } else {
            Some(raw.to_string())
        }
    }
}

impl RecordStore for CsvStore {
    fn locator(&self) -> String {
        self.path.display().to_string()
    }

    fn load(&self, schema: &Arc<Schema>) -> Result<Dataset, StoreError> {
        if !self.path.exists() {
            return Err(StoreError::NotFound(self.locator()));
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(&self.path)?;

        let headers = reader.headers()?.clone();
        if headers.is_empty() {
            return Err(StoreError::Schema(format!("{} has no header row", self.locator())));
        }
        for h in headers.iter() {
            if !schema.contains(h) {
                warn!("Dropping column {:?} from {}: not in schema", h, self.locator());
            }
        }

        // Schema position -> column position in the file
        let columns: Vec<Option<usize>> = schema
            .fields()
            .iter()
            .map(|f| headers.iter().position(|h| h == f))
            .collect();

        let mut dataset = Dataset::new(Arc::clone(schema));
        for row in reader.records() {
            let row = row?;
            let values = columns
                .iter()
                .map(|col| col.and_then(|i| row.get(i)).and_then(|raw| self.cell(raw)))
                .collect();
            dataset.push(Record::from_values(schema, values));
        }
        Ok(dataset)
    }

    fn persist(&self, dataset: &Dataset) -> Result<(), StoreError> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        // Sibling temp file so the final rename stays on one filesystem
        let mut tmp = NamedTempFile::new_in(&dir)?;
        {
            let mut writer = csv::Writer::from_writer(tmp.as_file_mut());
            writer.write_record(dataset.schema().fields())?;
            for record in dataset.records() {
                writer.write_record(
                    record
                        .values()
                        .iter()
                        .map(|v| v.as_deref().unwrap_or(&self.absent_marker)),
                )?;
            }
            writer.flush()?;
        }
        tmp.as_file_mut().flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{person, test_schema};

    #[test]
    fn load_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path().join("none.csv"));
        match store.load(&test_schema()) {
            Err(StoreError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn persist_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("records.csv");
        let store = CsvStore::new(&path);
        let schema = test_schema();
        let mut ds = Dataset::new(Arc::clone(&schema));
        let mut x = person(&schema, "X, Dr.", Some("123"), None);
        x.set("Address", Some("Main St \"5\"".into()));
        ds.push(x);
        ds.push(person(&schema, "Y", None, Some("456")));

        store.persist(&ds).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("Name,Address,Profession,Phone,Mobile,Website,Email,Hours"));

        let loaded = store.load(&schema).unwrap();
        assert_eq!(loaded, ds);
    }

    #[test]
    fn persist_replaces_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.csv");
        let store = CsvStore::new(&path);
        let schema = test_schema();

        let mut first = Dataset::new(Arc::clone(&schema));
        first.push(person(&schema, "Old", Some("1"), None));
        first.push(person(&schema, "Older", Some("2"), None));
        store.persist(&first).unwrap();

        let mut second = Dataset::new(Arc::clone(&schema));
        second.push(person(&schema, "New", Some("3"), None));
        store.persist(&second).unwrap();

        assert_eq!(store.load(&schema).unwrap(), second);
        // Only the target file remains; the temp file was renamed away
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn failed_rename_leaves_target_and_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.csv");
        // A directory in the target's place makes the final rename fail
        fs::create_dir(&path).unwrap();
        fs::write(path.join("keep.txt"), "untouched").unwrap();

        let schema = test_schema();
        let ds = Dataset::with_records(Arc::clone(&schema), vec![person(&schema, "New", Some("3"), None)]);
        let store = CsvStore::new(&path);
        assert!(matches!(store.persist(&ds), Err(StoreError::Io(_))));

        assert_eq!(fs::read_to_string(path.join("keep.txt")).unwrap(), "untouched");
        let left: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(left, vec![std::ffi::OsString::from("records.csv")]);
    }

    #[test]
    fn failed_persist_keeps_previous_store_loadable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.csv");
        let schema = test_schema();
        let first = Dataset::with_records(Arc::clone(&schema), vec![person(&schema, "Old", Some("1"), None)]);
        CsvStore::new(&path).persist(&first).unwrap();

        // Same store reached through a path whose parent is a file: the temp
        // file cannot even be created, so nothing near the real store moves
        let blocked = CsvStore::new(path.join("records.csv"));
        assert!(blocked.persist(&first).is_err());

        assert_eq!(CsvStore::new(&path).load(&schema).unwrap(), first);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn columns_are_matched_by_header_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.csv");
        fs::write(&path, "Phone,Name,Fax\n555,X,999\n,Y,\n").unwrap();

        let schema = test_schema();
        let ds = CsvStore::new(&path).load(&schema).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.records()[0].get("Name"), Some("X"));
        assert_eq!(ds.records()[0].get("Phone"), Some("555"));
        assert_eq!(ds.records()[0].get("Mobile"), None);
        assert_eq!(ds.records()[1].get("Phone"), None);
    }

    #[test]
    fn custom_marker_keeps_empty_strings() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path().join("r.csv")).with_absent_marker("NA");
        let schema = test_schema();
        let mut r = person(&schema, "X", None, None);
        r.set("Hours", Some(String::new()));
        let ds = Dataset::with_records(Arc::clone(&schema), vec![r]);

        store.persist(&ds).unwrap();
        let loaded = store.load(&schema).unwrap();
        assert_eq!(loaded.records()[0].get("Hours"), Some(""));
        assert_eq!(loaded.records()[0].get("Phone"), None);
    }
}
