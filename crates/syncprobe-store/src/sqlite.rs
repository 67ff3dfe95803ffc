//! SQLite implementation of the store traits.
//!
//! This is the persistent backend used by nodes. It uses rusqlite with bundled
//! SQLite, wrapped in async via tokio::spawn_blocking. Keys are BLOB primary
//! keys, so SQLite's memcmp ordering gives the lexicographic order the paging
//! contract requires.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension};

use syncprobe_core::{Chunk, Entry, KeyPrefix};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{prefix_upper_bound, BatchOp, KvStore, PrefixedStore, WriteBatch};

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
#[derive(Clone)]
pub struct SqliteKvStore {
    /// The SQLite connection, protected by a mutex.
    conn: Arc<Mutex<Connection>>,
}

impl SqliteKvStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

/// Page through rows ordered by key, stopping at the end of `prefix`.
fn read_page(
    conn: &Connection,
    prefix: &KeyPrefix,
    start: &[u8],
    inclusive: bool,
    max_bytes: usize,
) -> Result<Chunk> {
    let upper = prefix_upper_bound(prefix.as_bytes());
    let op = if inclusive { ">=" } else { ">" };
    let sql = match upper {
        Some(_) => format!(
            "SELECT key, value FROM kv WHERE key {} ?1 AND key < ?2 ORDER BY key ASC",
            op
        ),
        None => format!("SELECT key, value FROM kv WHERE key {} ?1 ORDER BY key ASC", op),
    };

    let mut stmt = conn.prepare_cached(&sql)?;
    let mut rows = match &upper {
        Some(upper) => stmt.query(params![start, upper])?,
        None => stmt.query(params![start])?,
    };

    let mut entries = Vec::new();
    let mut total = 0usize;
    let mut is_full = false;
    while let Some(row) = rows.next()? {
        let key: Vec<u8> = row.get(0)?;
        if !prefix.matches(&key) {
            break;
        }
        if total >= max_bytes && !entries.is_empty() {
            is_full = true;
            break;
        }
        let value: Vec<u8> = row.get(1)?;
        total += key.len() + value.len();
        entries.push(Entry::new(key, value));
    }

    Ok(Chunk { entries, is_full })
}

#[async_trait]
impl PrefixedStore for SqliteKvStore {
    async fn iterate_prefix(
        &self,
        prefix: &KeyPrefix,
        start_after: Option<&[u8]>,
        max_bytes: usize,
    ) -> Result<Chunk> {
        let prefix = prefix.clone();
        let (start, inclusive) = match start_after {
            Some(key) if key >= prefix.as_bytes() => (key.to_vec(), false),
            _ => (prefix.as_bytes().to_vec(), true),
        };

        self.blocking(move |conn| read_page(conn, &prefix, &start, inclusive, max_bytes))
            .await
    }
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let key = key.to_vec();
        self.blocking(move |conn| {
            let value: Option<Vec<u8>> = conn
                .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(value.map(Bytes::from))
        })
        .await
    }

    async fn write(&self, batch: WriteBatch) -> Result<()> {
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut put = tx.prepare_cached(
                    "INSERT INTO kv (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                )?;
                let mut delete = tx.prepare_cached("DELETE FROM kv WHERE key = ?1")?;
                let mut meta = tx.prepare_cached(
                    "INSERT INTO meta (name, value) VALUES (?1, ?2)
                     ON CONFLICT(name) DO UPDATE SET value = excluded.value",
                )?;

                for op in batch.ops() {
                    match op {
                        BatchOp::Put(entry) => {
                            put.execute(params![&entry.key[..], &entry.value[..]])?;
                        }
                        BatchOp::Delete(key) => {
                            delete.execute(params![&key[..]])?;
                        }
                    }
                }
                for (name, value) in batch.meta() {
                    meta.execute(params![name, value])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_meta(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let name = name.to_string();
        self.blocking(move |conn| {
            let value = conn
                .query_row("SELECT value FROM meta WHERE name = ?1", params![name], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(value)
        })
        .await
    }

    async fn delete_prefix(&self, prefix: &KeyPrefix) -> Result<usize> {
        let start = prefix.as_bytes().to_vec();
        let upper = prefix_upper_bound(&start);
        self.blocking(move |conn| {
            let removed = match upper {
                Some(upper) => conn.execute(
                    "DELETE FROM kv WHERE key >= ?1 AND key < ?2",
                    params![start, upper],
                )?,
                None => conn.execute("DELETE FROM kv WHERE key >= ?1", params![start])?,
            };
            Ok(removed)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::StoreExt;

    async fn seeded() -> SqliteKvStore {
        let store = SqliteKvStore::open_memory().unwrap();
        let mut batch = WriteBatch::new();
        batch
            .put(vec![0x01, 0xaa], b"v1".to_vec())
            .put(vec![0x01, 0xbb], b"v2".to_vec())
            .put(vec![0x01, 0xcc], b"v3".to_vec())
            .put(vec![0x02, 0x00], b"other".to_vec())
            .put(vec![0xff, 0xff, 0x01], b"edge".to_vec());
        store.write(batch).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_sqlite_iterate_prefix() {
        let store = seeded().await;
        let chunk = store
            .iterate_prefix(&KeyPrefix::from_byte(0x01), None, 1 << 20)
            .await
            .unwrap();
        let keys: Vec<_> = chunk.entries.iter().map(Entry::key_hex).collect();
        assert_eq!(keys, vec!["01aa", "01bb", "01cc"]);
        assert!(!chunk.is_full);
    }

    #[tokio::test]
    async fn test_sqlite_paging_matches_memory_semantics() {
        let store = seeded().await;
        let prefix = KeyPrefix::from_byte(0x01);
        let first = store.iterate_prefix(&prefix, None, 8).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.is_full);

        let second = store
            .iterate_prefix(&prefix, first.last_key().map(|k| &k[..]), 8)
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert!(!second.is_full);
        assert_eq!(second.entries[0].key_hex(), "01cc");
    }

    #[tokio::test]
    async fn test_sqlite_unbounded_prefix() {
        let store = seeded().await;
        let prefix = KeyPrefix::new(vec![0xff, 0xff]).unwrap();
        let all = store.scan_prefix(&prefix, 1).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(store.delete_prefix(&prefix).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_overwrite_and_delete() {
        let store = seeded().await;
        let mut batch = WriteBatch::new();
        batch.put(vec![0x01, 0xaa], b"changed".to_vec()).delete(vec![0x01, 0xbb]);
        store.write(batch).await.unwrap();

        assert_eq!(
            store.get(&[0x01, 0xaa]).await.unwrap().unwrap().as_ref(),
            b"changed"
        );
        assert!(store.get(&[0x01, 0xbb]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chain.db");
        {
            let store = SqliteKvStore::open(&path).unwrap();
            let mut batch = WriteBatch::new();
            batch.put(vec![0x01, 0x01], b"kept".to_vec()).set_meta("height", vec![9u8]);
            store.write(batch).await.unwrap();
        }
        let store = SqliteKvStore::open(&path).unwrap();
        assert_eq!(
            store.get(&[0x01, 0x01]).await.unwrap().unwrap().as_ref(),
            b"kept"
        );
        assert_eq!(store.get_meta("height").await.unwrap(), Some(vec![9u8]));
    }
}
