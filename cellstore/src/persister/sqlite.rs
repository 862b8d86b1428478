use super::Storage;
use crate::error::{CellStoreError, Result};
use crate::transaction::Changes;
use crate::types::{Content, Scalar};
use rusqlite::{params, Connection};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// How often a watched database is checked for commits from other
/// connections.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Stores content in a SQLite database, one row per cell and per value.
pub struct SqliteStorage {
    path: Option<PathBuf>,
    conn: Connection,
    poll_interval: Duration,
    poller: Option<Poller>,
}

struct Poller {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl Poller {
    fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        if self.thread.join().is_err() {
            log::warn!("SQLite poller thread panicked");
        }
    }
}

impl SqliteStorage {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let storage = SqliteStorage {
            path: Some(path.to_path_buf()),
            conn,
            poll_interval: DEFAULT_POLL_INTERVAL,
            poller: None,
        };
        storage.initialize_tables()?;
        Ok(storage)
    }

    /// Open an in-memory database. It cannot be watched.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = SqliteStorage {
            path: None,
            conn,
            poll_interval: DEFAULT_POLL_INTERVAL,
            poller: None,
        };
        storage.initialize_tables()?;
        Ok(storage)
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn initialize_tables(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS cells (
                table_id TEXT NOT NULL,
                row_id TEXT NOT NULL,
                cell_id TEXT NOT NULL,
                cell_json TEXT NOT NULL,
                PRIMARY KEY (table_id, row_id, cell_id)
            );

            CREATE TABLE IF NOT EXISTS store_values (
                value_id TEXT PRIMARY KEY,
                value_json TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    fn load_tables(&self) -> Result<Map<String, Value>> {
        let mut stmt = self
            .conn
            .prepare("SELECT table_id, row_id, cell_id, cell_json FROM cells")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut tables = Map::new();
        for row in rows {
            let (table_id, row_id, cell_id, cell_json) = row?;
            let cell: Value = serde_json::from_str(&cell_json)?;
            let table = tables
                .entry(table_id)
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(table) = table {
                let row = table
                    .entry(row_id)
                    .or_insert_with(|| Value::Object(Map::new()));
                if let Value::Object(row) = row {
                    row.insert(cell_id, cell);
                }
            }
        }
        Ok(tables)
    }

    fn load_values(&self) -> Result<Map<String, Value>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value_id, value_json FROM store_values")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut values = Map::new();
        for row in rows {
            let (value_id, value_json) = row?;
            values.insert(value_id, serde_json::from_str(&value_json)?);
        }
        Ok(values)
    }
}

fn scalar_json(scalar: &Scalar) -> Result<String> {
    Ok(serde_json::to_string(scalar)?)
}

impl Storage for SqliteStorage {
    fn load(&mut self) -> Result<Option<(Value, Value)>> {
        let tables = self.load_tables()?;
        let values = self.load_values()?;
        if tables.is_empty() && values.is_empty() {
            return Ok(None);
        }
        Ok(Some((Value::Object(tables), Value::Object(values))))
    }

    /// Applies `changes` row by row when given, otherwise rewrites every
    /// cell and value.
    fn save(&mut self, content: &Content, changes: Option<&Changes>) -> Result<()> {
        let tx = self.conn.transaction()?;
        match changes {
            Some(changes) => {
                for (table_id, table) in &changes.tables {
                    let Some(table) = table else {
                        tx.execute("DELETE FROM cells WHERE table_id = ?1", params![table_id])?;
                        continue;
                    };
                    for (row_id, row) in table {
                        let Some(row) = row else {
                            tx.execute(
                                "DELETE FROM cells WHERE table_id = ?1 AND row_id = ?2",
                                params![table_id, row_id],
                            )?;
                            continue;
                        };
                        for (cell_id, cell) in row {
                            match cell {
                                Some(cell) => tx.execute(
                                    "INSERT OR REPLACE INTO cells (table_id, row_id, cell_id, cell_json)
                                     VALUES (?1, ?2, ?3, ?4)",
                                    params![table_id, row_id, cell_id, scalar_json(cell)?],
                                )?,
                                None => tx.execute(
                                    "DELETE FROM cells WHERE table_id = ?1 AND row_id = ?2 AND cell_id = ?3",
                                    params![table_id, row_id, cell_id],
                                )?,
                            };
                        }
                    }
                }
                for (value_id, value) in &changes.values {
                    match value {
                        Some(value) => tx.execute(
                            "INSERT OR REPLACE INTO store_values (value_id, value_json) VALUES (?1, ?2)",
                            params![value_id, scalar_json(value)?],
                        )?,
                        None => tx.execute(
                            "DELETE FROM store_values WHERE value_id = ?1",
                            params![value_id],
                        )?,
                    };
                }
            }
            None => {
                let (tables, values) = content;
                tx.execute_batch("DELETE FROM cells; DELETE FROM store_values;")?;
                for (table_id, table) in tables {
                    for (row_id, row) in table {
                        for (cell_id, cell) in row {
                            tx.execute(
                                "INSERT INTO cells (table_id, row_id, cell_id, cell_json)
                                 VALUES (?1, ?2, ?3, ?4)",
                                params![table_id, row_id, cell_id, scalar_json(cell)?],
                            )?;
                        }
                    }
                }
                for (value_id, value) in values {
                    tx.execute(
                        "INSERT INTO store_values (value_id, value_json) VALUES (?1, ?2)",
                        params![value_id, scalar_json(value)?],
                    )?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Polls `PRAGMA data_version` on a second connection, which changes
    /// whenever any other connection commits.
    fn watch(&mut self, notify: Box<dyn Fn() + Send>) -> Result<()> {
        let Some(path) = self.path.clone() else {
            return Err(CellStoreError::Other(
                "an in-memory database cannot be watched".into(),
            ));
        };
        self.unwatch()?;

        let conn = Connection::open(&path)?;
        let mut last: i64 = conn.query_row("PRAGMA data_version", [], |row| row.get(0))?;
        let stop = Arc::new(AtomicBool::new(false));
        let stopped = stop.clone();
        let poll_interval = self.poll_interval;

        let thread = std::thread::spawn(move || {
            while !stopped.load(Ordering::Relaxed) {
                std::thread::sleep(poll_interval);
                if stopped.load(Ordering::Relaxed) {
                    break;
                }
                match conn.query_row("PRAGMA data_version", [], |row| row.get::<_, i64>(0)) {
                    Ok(version) if version != last => {
                        last = version;
                        notify();
                    }
                    Ok(_) => {}
                    Err(e) => log::warn!("SQLite poll failed: {e}"),
                }
            }
        });

        self.poller = Some(Poller { stop, thread });
        Ok(())
    }

    fn unwatch(&mut self) -> Result<()> {
        if let Some(poller) = self.poller.take() {
            poller.stop();
        }
        Ok(())
    }
}

impl Drop for SqliteStorage {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use serde_json::json;
    use std::sync::mpsc;

    fn content(store: &Store) -> Content {
        store.get_content()
    }

    #[test]
    fn test_empty_database_loads_nothing() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        assert!(storage.load().unwrap().is_none());
    }

    #[test]
    fn test_full_save_then_load() {
        let store = Store::new();
        store
            .set_tables(json!({"pets": {"fido": {"legs": 4, "sold": false}}}))
            .set_value("open", "yes");
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        storage.save(&content(&store), None).unwrap();

        let (tables, values) = storage.load().unwrap().unwrap();
        assert_eq!(tables, json!({"pets": {"fido": {"legs": 4, "sold": false}}}));
        assert_eq!(values, json!({"open": "yes"}));
    }

    #[test]
    fn test_incremental_save_applies_changes() {
        let store = Store::new();
        store.set_tables(json!({
            "pets": {"fido": {"legs": 4}, "felix": {"legs": 4}},
            "toys": {"ball": {"color": "red"}}
        }));
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        storage.save(&content(&store), None).unwrap();

        let changes = store.transaction(|store| {
            store.set_cell("pets", "fido", "legs", 3);
            store.del_row("pets", "felix");
            store.del_table("toys");
            store.set_value("open", true);
            store.get_transaction_changes()
        });
        storage.save(&content(&store), Some(&changes)).unwrap();

        let (tables, values) = storage.load().unwrap().unwrap();
        assert_eq!(tables, json!({"pets": {"fido": {"legs": 3}}}));
        assert_eq!(values, json!({"open": true}));
    }

    #[test]
    fn test_in_memory_cannot_be_watched() {
        let mut storage = SqliteStorage::open_in_memory().unwrap();
        assert!(storage.watch(Box::new(|| {})).is_err());
    }

    #[test]
    fn test_watch_sees_commits_from_other_connections() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("store.db");
        let mut storage = SqliteStorage::open(&path)
            .unwrap()
            .with_poll_interval(Duration::from_millis(20));

        let (tx, rx) = mpsc::channel();
        storage
            .watch(Box::new(move || {
                let _ = tx.send(());
            }))
            .unwrap();

        let mut other = SqliteStorage::open(&path).unwrap();
        let store = Store::new();
        store.set_value("open", true);
        other.save(&content(&store), None).unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        storage.unwatch().unwrap();
    }
}
