//! Durable key-value engines backing the checkpoint manager.
//!
//! The checkpoint manager treats the engine as a black box: it opens
//! a connection, gets, sets and deletes opaque byte values by string
//! key, and drops the connection. [`SqliteEngine`] is the on-disk
//! engine; [`MemEngine`] keeps everything in memory and is used for
//! tests.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::PoisonError;

use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite_migration::Migrations;
use rusqlite_migration::M;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::StateError;
use crate::errors::StateResult;

/// Something that can hand out connections to a durable K-V table.
///
/// Must be shareable so background eviction can open its own
/// connection.
pub trait KvEngine: Send + Sync + 'static {
    fn open(&self) -> StateResult<Box<dyn KvConn + '_>>;
}

/// An open connection to a [`KvEngine`].
///
/// Dropping the connection releases it; [`KvConn::close`] does the
/// same but reports errors.
pub trait KvConn {
    fn get(&mut self, key: &str) -> StateResult<Option<Vec<u8>>>;

    fn set(&mut self, key: &str, value: &[u8]) -> StateResult<()>;

    /// Write all entries or none of them.
    fn set_all(&mut self, entries: &[(&str, Vec<u8>)]) -> StateResult<()>;

    /// Deleting a missing key is not an error.
    fn delete(&mut self, key: &str) -> StateResult<()>;

    fn close(self: Box<Self>) -> StateResult<()>;
}

/// Read and decode a JSON value.
pub fn get_json<T: DeserializeOwned>(conn: &mut dyn KvConn, key: &str) -> StateResult<Option<T>> {
    conn.get(key)?
        .map(|bytes| serde_json::from_slice(&bytes).map_err(StateError::Decode))
        .transpose()
}

/// Encode a value as JSON bytes for [`KvConn::set`].
pub fn to_json<T: Serialize + ?Sized>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(StateError::Encode)
}

// The `'static` lifetime within [`Migrations`] is saying that the
// [`str`]s composing the migrations are `'static`.
static MIGRATIONS: OnceLock<Migrations<'static>> = OnceLock::new();

fn get_migrations() -> &'static Migrations<'static> {
    MIGRATIONS.get_or_init(|| {
        Migrations::new(vec![M::up(
            "CREATE TABLE kv ( \
             updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
             key TEXT NOT NULL PRIMARY KEY, \
             value BLOB NOT NULL \
             ) STRICT",
        )])
    })
}

#[test]
fn migrations_valid() -> rusqlite_migration::Result<()> {
    get_migrations().validate()
}

/// Setup our connection-level pragmas. Run this on each connection.
fn setup_conn(conn: &mut Connection) -> StateResult<()> {
    // These are recommended by Litestream.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "busy_timeout", "5000")?;
    get_migrations().to_latest(conn)?;
    Ok(())
}

/// A single SQLite file holding one K-V table.
#[derive(Debug, Clone)]
pub struct SqliteEngine {
    file: PathBuf,
}

impl SqliteEngine {
    /// The file and its parent directories are created on first
    /// open.
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self { file: file.into() }
    }

    pub fn file(&self) -> &Path {
        &self.file
    }
}

impl KvEngine for SqliteEngine {
    fn open(&self) -> StateResult<Box<dyn KvConn + '_>> {
        if let Some(dir) = self.file.parent() {
            fs::create_dir_all(dir)?;
        }
        tracing::trace!("Opening state DB at {:?}", self.file);
        let mut conn = Connection::open_with_flags(
            &self.file,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        setup_conn(&mut conn)?;
        Ok(Box::new(SqliteConn { conn }))
    }
}

struct SqliteConn {
    conn: Connection,
}

impl KvConn for SqliteConn {
    fn get(&mut self, key: &str) -> StateResult<Option<Vec<u8>>> {
        let value = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", (key,), |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set(&mut self, key: &str, value: &[u8]) -> StateResult<()> {
        self.set_all(&[(key, value.to_vec())])
    }

    fn set_all(&mut self, entries: &[(&str, Vec<u8>)]) -> StateResult<()> {
        let txn = self.conn.transaction()?;
        for (key, value) in entries {
            tracing::trace!("Writing key {key:?} ({} bytes)", value.len());
            txn.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2) \
                 ON CONFLICT (key) DO UPDATE \
                 SET value = EXCLUDED.value, updated_at = CURRENT_TIMESTAMP",
                (key, value),
            )?;
        }
        txn.commit()?;
        Ok(())
    }

    fn delete(&mut self, key: &str) -> StateResult<()> {
        self.conn.execute("DELETE FROM kv WHERE key = ?1", (key,))?;
        Ok(())
    }

    fn close(self: Box<Self>) -> StateResult<()> {
        self.conn.close().map_err(|(_conn, err)| err.into())
    }
}

/// Engine with all data in memory.
///
/// Clones share the same table, so a test can keep a handle and
/// inspect what the checkpoint manager wrote.
#[derive(Debug, Clone, Default)]
pub struct MemEngine {
    db: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// All keys currently stored, sorted.
    pub fn keys(&self) -> Vec<String> {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<_> = db.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn contains(&self, key: &str) -> bool {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        db.contains_key(key)
    }

    /// Overwrite raw bytes, bypassing the checkpoint manager.
    pub fn put_raw(&self, key: &str, value: &[u8]) {
        let mut db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        db.insert(key.to_owned(), value.to_vec());
    }

    pub fn remove_raw(&self, key: &str) {
        let mut db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        db.remove(key);
    }
}

impl KvEngine for MemEngine {
    fn open(&self) -> StateResult<Box<dyn KvConn + '_>> {
        Ok(Box::new(MemConn {
            db: self.db.clone(),
        }))
    }
}

struct MemConn {
    db: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl KvConn for MemConn {
    fn get(&mut self, key: &str) -> StateResult<Option<Vec<u8>>> {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(db.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &[u8]) -> StateResult<()> {
        let mut db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        db.insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    fn set_all(&mut self, entries: &[(&str, Vec<u8>)]) -> StateResult<()> {
        let mut db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        for (key, value) in entries {
            db.insert((*key).to_owned(), value.clone());
        }
        Ok(())
    }

    fn delete(&mut self, key: &str) -> StateResult<()> {
        let mut db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        db.remove(key);
        Ok(())
    }

    fn close(self: Box<Self>) -> StateResult<()> {
        Ok(())
    }
}

#[test]
fn sqlite_set_get_delete() -> StateResult<()> {
    let dir = tempfile::tempdir()?;
    let engine = SqliteEngine::new(dir.path().join("nested").join("state.sqlite3"));

    let mut conn = engine.open()?;
    assert_eq!(conn.get("a")?, None);
    conn.set("a", b"1")?;
    conn.set("a", b"2")?;
    conn.set_all(&[("b", b"3".to_vec()), ("c", b"4".to_vec())])?;
    conn.delete("c")?;
    conn.delete("missing")?;
    conn.close()?;

    // A fresh connection sees what the old one wrote.
    let mut conn = engine.open()?;
    assert_eq!(conn.get("a")?, Some(b"2".to_vec()));
    assert_eq!(conn.get("b")?, Some(b"3".to_vec()));
    assert_eq!(conn.get("c")?, None);
    Ok(())
}

#[test]
fn json_helpers_round_trip() -> StateResult<()> {
    let engine = MemEngine::new();
    let mut conn = engine.open()?;
    conn.set("checkpoints", &to_json(&vec![1i64, 2, 3])?)?;

    let found: Option<Vec<i64>> = get_json(conn.as_mut(), "checkpoints")?;
    assert_eq!(found, Some(vec![1, 2, 3]));

    let missing: Option<Vec<i64>> = get_json(conn.as_mut(), "nope")?;
    assert_eq!(missing, None);

    engine.put_raw("garbage", b"{not json");
    let bad: StateResult<Option<Vec<i64>>> = get_json(conn.as_mut(), "garbage");
    assert!(matches!(bad, Err(StateError::Decode(_))));
    Ok(())
}
