//! SQLite storage backend

use crate::{matches_pattern, Storage, StorageError, StorageStats, StoredHistory};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tandem_core::{DocumentName, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

/// SQLite storage backend
///
/// Embedded persistence suitable for single-node deployments.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

fn ser_err(e: serde_json::Error) -> StorageError {
    StorageError::Serialization(e.to_string())
}

impl SqliteStorage {
    /// Create a new SQLite storage with the given path
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path).map_err(db_err)?;
        Self::from_connection(conn)
    }

    /// Create an in-memory SQLite database (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS documents (
                name TEXT PRIMARY KEY,
                start INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000)
            );

            CREATE TABLE IF NOT EXISTS transactions (
                doc TEXT NOT NULL,
                seq INTEGER NOT NULL,
                data TEXT NOT NULL,
                store TEXT NOT NULL,
                PRIMARY KEY (doc, seq)
            );
            "#,
        )
        .map_err(db_err)?;

        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO meta (key, value) VALUES ('server_id', ?1)",
                params![Uuid::new_v4().to_string()],
            )
            .map_err(db_err)?;
        if inserted > 0 {
            info!("Initialized new SQLite history store");
        }

        Ok(())
    }

    fn ensure_document(conn: &Connection, doc: &DocumentName) -> Result<(), StorageError> {
        conn.execute(
            "INSERT OR IGNORE INTO documents (name) VALUES (?1)",
            params![doc.as_str()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// `(start, persisted end)` of a document's log
    fn bounds(conn: &Connection, doc: &DocumentName) -> Result<(usize, usize), StorageError> {
        let start: i64 = conn
            .query_row(
                "SELECT start FROM documents WHERE name = ?1",
                params![doc.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?
            .unwrap_or(0);
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM transactions WHERE doc = ?1",
                params![doc.as_str()],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok((start as usize, (start + count) as usize))
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn load(&self, doc: &DocumentName) -> Result<StoredHistory, StorageError> {
        let conn = self.conn.lock();
        Self::ensure_document(&conn, doc)?;
        let (start, _) = Self::bounds(&conn, doc)?;

        let mut stmt = conn
            .prepare("SELECT data, store FROM transactions WHERE doc = ?1 ORDER BY seq")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![doc.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(db_err)?;

        let mut history = StoredHistory {
            start,
            ..Default::default()
        };
        for row in rows {
            let (data, store) = row.map_err(db_err)?;
            history
                .transactions
                .push(serde_json::from_str(&data).map_err(ser_err)?);
            history.stores.push(serde_json::from_str(&store).map_err(ser_err)?);
        }

        debug!(doc = %doc, start, length = history.end(), "Loaded history");
        Ok(history)
    }

    async fn append(
        &self,
        doc: &DocumentName,
        expected_offset: usize,
        transactions: &[Transaction],
        stores: &[serde_json::Value],
    ) -> Result<usize, StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        Self::ensure_document(&tx, doc)?;

        let (_, end) = Self::bounds(&tx, doc)?;
        if end != expected_offset {
            return Err(StorageError::OffsetMismatch {
                expected: expected_offset,
                actual: end,
            });
        }

        {
            let mut stmt = tx
                .prepare("INSERT INTO transactions (doc, seq, data, store) VALUES (?1, ?2, ?3, ?4)")
                .map_err(db_err)?;
            for (i, txn) in transactions.iter().enumerate() {
                let data = serde_json::to_string(txn).map_err(ser_err)?;
                let store = serde_json::to_string(&stores.get(i).cloned().unwrap_or_default())
                    .map_err(ser_err)?;
                stmt.execute(params![doc.as_str(), (end + i) as i64, data, store])
                    .map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)?;

        let length = end + transactions.len();
        debug!(doc = %doc, appended = transactions.len(), length, "Appended history");
        Ok(length)
    }

    async fn server_id(&self) -> Result<String, StorageError> {
        let conn = self.conn.lock();
        conn.query_row("SELECT value FROM meta WHERE key = 'server_id'", [], |row| row.get(0))
            .map_err(db_err)
    }

    async fn list(&self, pattern: Option<&str>) -> Result<Vec<DocumentName>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT name FROM documents ORDER BY created_at DESC")
            .map_err(db_err)?;

        let names: Vec<DocumentName> = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .filter_map(|r| r.ok())
            .filter(|name| pattern.map_or(true, |p| matches_pattern(name, p)))
            .filter_map(|name| DocumentName::new(name).ok())
            .collect();

        Ok(names)
    }

    async fn stats(&self) -> Result<StorageStats, StorageError> {
        let conn = self.conn.lock();

        let document_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))
            .map_err(db_err)?;
        let transaction_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))
            .map_err(db_err)?;

        Ok(StorageStats {
            document_count: document_count as usize,
            transaction_count: transaction_count as usize,
        })
    }
}
