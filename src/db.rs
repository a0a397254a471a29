use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use rusqlite::{Connection, OptionalExtension};

/// Single SQLite connection shared by the checkpoint store, record store and outbox.
///
/// The mutex is only held inside synchronous calls, never across an `.await`.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {:?}", dir))?;
        }
        let conn = Connection::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("database mutex poisoned"))
    }

    // ── Checkpoints ──

    pub fn last_id(&self, source_id: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT last_id FROM last_ids WHERE id = ?1",
                [source_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_last_id(&self, source_id: &str, last_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO last_ids (id, last_id, updated_at) VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(id) DO UPDATE SET last_id = excluded.last_id, updated_at = excluded.updated_at",
            rusqlite::params![source_id, last_id],
        )?;
        Ok(())
    }

    // ── Documents ──

    pub fn insert_document(&self, row: &DocumentRow) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO documents
             (id, mp, service, created_at, channel, source_uri, sender_name, sender_uri, raw_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                row.id, row.mp, row.service, row.created_at, row.channel,
                row.source_uri, row.sender_name, row.sender_uri, row.raw_message,
            ],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub fn documents_for_uri(&self, source_uri: &str) -> Result<Vec<DocumentRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, mp, service, created_at, channel, source_uri, sender_name, sender_uri, raw_message
             FROM documents WHERE source_uri = ?1 ORDER BY rowid",
        )?;
        let rows = stmt
            .query_map([source_uri], |row| {
                Ok(DocumentRow {
                    id: row.get(0)?,
                    mp: row.get(1)?,
                    service: row.get(2)?,
                    created_at: row.get(3)?,
                    channel: row.get(4)?,
                    source_uri: row.get(5)?,
                    sender_name: row.get(6)?,
                    sender_uri: row.get(7)?,
                    raw_message: row.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Outbox ──

    pub fn enqueue(&self, queue_name: &str, body: &str) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO queue_messages (queue_name, body) VALUES (?1, ?2)",
            rusqlite::params![queue_name, body],
        )?;
        Ok(conn.last_insert_rowid())
    }

    #[cfg(test)]
    pub fn queued_bodies(&self, queue_name: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT body FROM queue_messages WHERE queue_name = ?1 ORDER BY id")?;
        let rows = stmt
            .query_map([queue_name], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Stats ──

    pub fn get_stats(&self, source_id: &str, queue_name: &str) -> Result<Stats> {
        let conn = self.conn()?;
        let last_id: Option<String> = conn
            .query_row(
                "SELECT last_id FROM last_ids WHERE id = ?1",
                [source_id],
                |r| r.get(0),
            )
            .optional()?;
        let documents: usize = conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE service = ?1",
            [source_id],
            |r| r.get(0),
        )?;
        let queued: usize = conn.query_row(
            "SELECT COUNT(*) FROM queue_messages WHERE queue_name = ?1",
            [queue_name],
            |r| r.get(0),
        )?;
        let latest_created_at: Option<String> = conn.query_row(
            "SELECT MAX(created_at) FROM documents WHERE service = ?1",
            [source_id],
            |r| r.get(0),
        )?;
        Ok(Stats {
            last_id,
            documents,
            queued,
            latest_created_at,
        })
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS last_ids (
            id         TEXT PRIMARY KEY,
            last_id    TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS documents (
            id          TEXT PRIMARY KEY,
            mp          TEXT UNIQUE NOT NULL,
            service     TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            channel     TEXT NOT NULL,
            source_uri  TEXT NOT NULL,
            sender_name TEXT NOT NULL DEFAULT '',
            sender_uri  TEXT NOT NULL DEFAULT '',
            raw_message TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_documents_source_uri ON documents(source_uri);
        CREATE INDEX IF NOT EXISTS idx_documents_service ON documents(service);

        -- Local delivery queue used when no queue_url is configured
        CREATE TABLE IF NOT EXISTS queue_messages (
            id          INTEGER PRIMARY KEY,
            queue_name  TEXT NOT NULL,
            body        TEXT NOT NULL,
            enqueued_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_queue_messages_name ON queue_messages(queue_name);
        ",
    )?;
    Ok(())
}

/// Flattened document record as stored in the `documents` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRow {
    pub id: String,
    pub mp: String,
    pub service: String,
    pub created_at: String,
    pub channel: String,
    pub source_uri: String,
    pub sender_name: String,
    pub sender_uri: String,
    pub raw_message: String,
}

pub struct Stats {
    pub last_id: Option<String>,
    pub documents: usize,
    pub queued: usize,
    pub latest_created_at: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str) -> DocumentRow {
        DocumentRow {
            id: id.to_string(),
            mp: format!("bulletins_ms:{}", id),
            service: "Bulletins".into(),
            created_at: "2024-03-01T10:00:00Z".into(),
            channel: "web".into(),
            source_uri: "https://archive.example/item/7".into(),
            sender_name: String::new(),
            sender_uri: String::new(),
            raw_message: "hello".into(),
        }
    }

    #[test]
    fn last_id_upsert_is_visible_immediately() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.last_id("Bulletins").unwrap(), None);
        db.set_last_id("Bulletins", "10").unwrap();
        db.set_last_id("Bulletins", "11").unwrap();
        assert_eq!(db.last_id("Bulletins").unwrap().as_deref(), Some("11"));
    }

    #[test]
    fn duplicate_document_id_rejected() {
        let db = Database::open_in_memory().unwrap();
        db.insert_document(&row("a")).unwrap();
        assert!(db.insert_document(&row("a")).is_err());
        assert_eq!(db.documents_for_uri("https://archive.example/item/7").unwrap().len(), 1);
    }

    #[test]
    fn stats_count_per_service_and_queue() {
        let db = Database::open_in_memory().unwrap();
        db.set_last_id("Bulletins", "3").unwrap();
        db.insert_document(&row("a")).unwrap();
        db.insert_document(&row("b")).unwrap();
        db.enqueue("documents", "{}").unwrap();
        db.enqueue("other", "{}").unwrap();

        let s = db.get_stats("Bulletins", "documents").unwrap();
        assert_eq!(s.last_id.as_deref(), Some("3"));
        assert_eq!(s.documents, 2);
        assert_eq!(s.queued, 1);
        assert_eq!(s.latest_created_at.as_deref(), Some("2024-03-01T10:00:00Z"));
    }
}
