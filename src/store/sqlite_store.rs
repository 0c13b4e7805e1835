use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use tracing::warn;

use super::RecordStore;
use crate::error::StoreError;
use crate::record::{Dataset, Record, Schema};

/// One table, one TEXT column per schema field. NULL is the absent marker.
pub struct SqliteStore {
    path: PathBuf,
    table: String,
}

impl SqliteStore {
    pub fn new(path: impl AsRef<Path>, table: &str) -> Self {
        SqliteStore {
            path: path.as_ref().to_path_buf(),
            table: table.to_string(),
        }
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Ok(conn)
    }

    fn table_columns(&self, conn: &Connection) -> Result<Option<Vec<String>>, StoreError> {
        let found: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [&self.table],
                |row| row.get(0),
            )
            .optional()?;
        if found.is_none() {
            return Ok(None);
        }

        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(&self.table)))?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(columns))
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Tables written by other tools may hold numbers; read everything as text.
fn value_to_text(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Integer(i) => Some(i.to_string()),
        Value::Real(f) => Some(f.to_string()),
        Value::Text(s) => Some(s),
        Value::Blob(b) => Some(String::from_utf8_lossy(&b).into_owned()),
    }
}

impl RecordStore for SqliteStore {
    fn locator(&self) -> String {
        format!("{}#{}", self.path.display(), self.table)
    }

    fn load(&self, schema: &Arc<Schema>) -> Result<Dataset, StoreError> {
        if !self.path.exists() {
            return Err(StoreError::NotFound(self.locator()));
        }
        let conn = self.connect()?;
        let Some(columns) = self.table_columns(&conn)? else {
            return Err(StoreError::NotFound(self.locator()));
        };

        for c in &columns {
            if !schema.contains(c) {
                warn!("Dropping column {:?} from {}: not in schema", c, self.locator());
            }
        }
        let present: Vec<&String> = schema.fields().iter().filter(|f| columns.contains(f)).collect();
        if present.is_empty() {
            return Err(StoreError::Schema(format!(
                "{} shares no columns with the schema",
                self.locator()
            )));
        }

        let select = present.iter().map(|f| quote_ident(f)).collect::<Vec<_>>().join(", ");
        let sql = format!("SELECT {} FROM {} ORDER BY rowid", select, quote_ident(&self.table));
        let mut stmt = conn.prepare(&sql)?;

        let rows = stmt
            .query_map([], |row| {
                let mut pairs = Vec::with_capacity(present.len());
                for (i, field) in present.iter().enumerate() {
                    pairs.push((field.as_str(), value_to_text(row.get::<_, Value>(i)?)));
                }
                Ok(pairs)
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let records = rows
            .iter()
            .map(|pairs| Record::from_pairs(schema, pairs.iter().map(|(f, v)| (*f, v.as_deref()))))
            .collect();
        Ok(Dataset::with_records(Arc::clone(schema), records))
    }

    fn persist(&self, dataset: &Dataset) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut conn = self.connect()?;
        let table = quote_ident(&self.table);
        let fields = dataset.schema().fields();
        let column_defs = fields
            .iter()
            .map(|f| format!("{} TEXT", quote_ident(f)))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=fields.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");

        // Drop, recreate and fill in one transaction: readers see old or new, never half
        let tx = conn.transaction()?;
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {table}; CREATE TABLE {table} ({column_defs});"
        ))?;
        {
            let mut stmt = tx.prepare(&format!("INSERT INTO {} VALUES ({})", table, placeholders))?;
            for record in dataset.records() {
                stmt.execute(params_from_iter(record.values().iter()))?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}
