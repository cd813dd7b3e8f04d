use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::model::{MessageId, MessagesByThread, ThreadColors, ThreadId};

pub const THREADS_KEY: &str = "otkActiveThreads";
pub const MESSAGES_KEY: &str = "otkMessagesByThreadId";
pub const COLORS_KEY: &str = "otkThreadColors";
pub const SELECTED_MESSAGE_KEY: &str = "otkSelectedMessageId";
pub const VIEWER_VISIBLE_KEY: &str = "otkViewerVisible";

/// String-keyed persistence substrate holding JSON blobs.
pub trait KeyValue: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Default, Clone)]
pub struct Options {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SqliteKv {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteKv {
    pub fn open(opts: Options) -> Result<Self> {
        let path = if let Some(path) = opts.path {
            path
        } else {
            default_path().context("storage: resolve default path")?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("storage: create directory {}", parent.display()))?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("storage: open database at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("storage: set WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .context("storage: set busy timeout")?;
        migrate(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn close(self) -> Result<()> {
        let conn = Arc::try_unwrap(self.conn)
            .map_err(|_| anyhow!("storage: connection still in use"))?
            .into_inner();
        conn.close()
            .map_err(|(_, err)| err)
            .context("storage: close connection")
    }
}

impl KeyValue for SqliteKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT value FROM kv WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("storage: read {key}"))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
INSERT INTO kv (key, value, updated_at)
VALUES (?1, ?2, ?3)
ON CONFLICT(key) DO UPDATE SET
  value = excluded.value,
  updated_at = excluded.updated_at
"#,
            params![key, value, unix_now()],
        )
        .with_context(|| format!("storage: write {key}"))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
            .with_context(|| format!("storage: remove {key}"))?;
        Ok(())
    }
}

/// Process-local backend, used by tests and throwaway sessions.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValue for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// The three tracked records, read together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub active_threads: Vec<ThreadId>,
    pub messages: MessagesByThread,
    pub colors: ThreadColors,
}

/// Typed accessor over a [`KeyValue`] backend. Cheap to clone; every read
/// goes to the backend, so callers always see the latest persisted state.
#[derive(Clone)]
pub struct Store {
    kv: Arc<dyn KeyValue>,
}

impl Store {
    pub fn open(opts: Options) -> Result<Self> {
        Ok(Self::with_backend(Arc::new(SqliteKv::open(opts)?)))
    }

    pub fn in_memory() -> Self {
        Self::with_backend(Arc::new(MemoryKv::new()))
    }

    pub fn with_backend(kv: Arc<dyn KeyValue>) -> Self {
        Self { kv }
    }

    pub fn active_threads(&self) -> Result<Vec<ThreadId>> {
        self.read_json(THREADS_KEY)
    }

    pub fn set_active_threads(&self, threads: &[ThreadId]) -> Result<()> {
        self.write_json(THREADS_KEY, &threads)
    }

    pub fn messages_by_thread(&self) -> Result<MessagesByThread> {
        self.read_json(MESSAGES_KEY)
    }

    pub fn set_messages_by_thread(&self, messages: &MessagesByThread) -> Result<()> {
        self.write_json(MESSAGES_KEY, messages)
    }

    pub fn thread_colors(&self) -> Result<ThreadColors> {
        self.read_json(COLORS_KEY)
    }

    pub fn set_thread_colors(&self, colors: &ThreadColors) -> Result<()> {
        self.write_json(COLORS_KEY, colors)
    }

    pub fn selected_message(&self) -> Result<Option<MessageId>> {
        self.read_json(SELECTED_MESSAGE_KEY)
    }

    pub fn set_selected_message(&self, id: Option<MessageId>) -> Result<()> {
        match id {
            Some(id) => self.write_json(SELECTED_MESSAGE_KEY, &id),
            None => self.kv.remove(SELECTED_MESSAGE_KEY),
        }
    }

    pub fn viewer_visible(&self) -> Result<bool> {
        self.read_json(VIEWER_VISIBLE_KEY)
    }

    pub fn set_viewer_visible(&self, visible: bool) -> Result<()> {
        self.write_json(VIEWER_VISIBLE_KEY, &visible)
    }

    pub fn snapshot(&self) -> Result<Snapshot> {
        Ok(Snapshot {
            active_threads: self.active_threads()?,
            messages: self.messages_by_thread()?,
            colors: self.thread_colors()?,
        })
    }

    /// Drops the three tracked records. Selection and viewer visibility are
    /// kept.
    pub fn clear(&self) -> Result<()> {
        self.kv.remove(THREADS_KEY)?;
        self.kv.remove(MESSAGES_KEY)?;
        self.kv.remove(COLORS_KEY)?;
        Ok(())
    }

    fn read_json<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T> {
        match self.kv.get(key)? {
            Some(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("storage: decode {key}")),
            None => Ok(T::default()),
        }
    }

    fn write_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let raw =
            serde_json::to_string(value).with_context(|| format!("storage: encode {key}"))?;
        self.kv.set(key, &raw)
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs() as i64
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at INTEGER NOT NULL
)
"#,
        [],
    )?;

    let current: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    for (idx, sql) in migrations().iter().enumerate() {
        let version = (idx + 1) as i64;
        if version <= current {
            continue;
        }
        conn.execute_batch(sql)
            .with_context(|| format!("storage: apply migration {version}"))?;
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![version, unix_now()],
        )?;
    }
    Ok(())
}

fn migrations() -> Vec<&'static str> {
    vec![r#"
CREATE TABLE IF NOT EXISTS kv (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  updated_at INTEGER NOT NULL
);
"#]
}

pub fn default_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("thread-tracker").join("state.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Message;
    use tempfile::tempdir;

    fn message(id: MessageId, thread_id: ThreadId) -> Message {
        Message {
            id,
            time: id as i64,
            text: format!("post {id}"),
            title: "thread".into(),
            thread_id,
            attachment: None,
        }
    }

    #[test]
    fn sqlite_records_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.db");
        {
            let kv = SqliteKv::open(Options {
                path: Some(path.clone()),
            })
            .unwrap();
            let store = Store::with_backend(Arc::new(kv.clone()));
            let mut messages = MessagesByThread::new();
            messages.insert(101, vec![message(1, 101)]);
            store.set_messages_by_thread(&messages).unwrap();
            store.set_active_threads(&[101]).unwrap();
            drop(store);
            kv.close().unwrap();
        }
        assert!(path.exists());

        let store = Store::open(Options { path: Some(path) }).unwrap();
        assert_eq!(store.active_threads().unwrap(), vec![101]);
        assert_eq!(store.messages_by_thread().unwrap()[&101][0].id, 1);
    }

    #[test]
    fn missing_records_read_as_empty() {
        let store = Store::in_memory();
        assert!(store.active_threads().unwrap().is_empty());
        assert!(store.messages_by_thread().unwrap().is_empty());
        assert!(store.thread_colors().unwrap().is_empty());
        assert_eq!(store.selected_message().unwrap(), None);
        assert!(!store.viewer_visible().unwrap());
    }

    #[test]
    fn clear_resets_tracked_records_only() {
        let store = Store::in_memory();
        store.set_active_threads(&[1, 2]).unwrap();
        let mut colors = ThreadColors::new();
        colors.insert(1, "#e6194B".into());
        store.set_thread_colors(&colors).unwrap();
        store.set_selected_message(Some(42)).unwrap();
        store.set_viewer_visible(true).unwrap();

        store.clear().unwrap();

        assert_eq!(store.snapshot().unwrap(), Snapshot::default());
        assert_eq!(store.selected_message().unwrap(), Some(42));
        assert!(store.viewer_visible().unwrap());
    }

    #[test]
    fn corrupt_record_is_an_error() {
        let kv = Arc::new(MemoryKv::new());
        kv.set(THREADS_KEY, "{not json").unwrap();
        let store = Store::with_backend(kv);
        assert!(store.active_threads().is_err());
    }
}
