//! Durable storage behind the transparency log.
//!
//! The log keeps its working state in memory and writes through to a
//! [`LogStore`]. Stores are append-only: entries and tree heads are never
//! rewritten, except that a tree head gains its anchor reference once the
//! anchoring job hears back from the external medium.

use crate::entry::LogEntry;
use crate::error::{LogError, Result};
use crate::tree_head::SignedTreeHead;
use qlafs_core::ZERO_DIGEST;

/// Everything a store holds, in append order
#[derive(Debug, Clone, Default)]
pub struct StoredLog {
    pub entries: Vec<LogEntry>,
    pub heads: Vec<SignedTreeHead>,
}

/// Write-through persistence for the log.
///
/// Only the log's writer calls these, one at a time.
pub trait LogStore: Send {
    /// Load the persisted log, checking the hash chain
    fn load(&mut self) -> Result<StoredLog>;

    fn append_entry(&mut self, entry: &LogEntry) -> Result<()>;

    fn append_tree_head(&mut self, head: &SignedTreeHead) -> Result<()>;

    /// Attach an anchor reference to the head sealed at `tree_size`
    fn record_anchor(&mut self, tree_size: u64, reference: &str) -> Result<()>;
}

/// Walk a chain of entries from genesis, checking indices are gapless and
/// every entry links to its predecessor
pub fn check_chain(entries: &[LogEntry]) -> Result<()> {
    let mut previous = ZERO_DIGEST;
    for (position, entry) in entries.iter().enumerate() {
        if entry.entry_index != position as u64 {
            return Err(LogError::ChainBroken {
                index: position as u64,
                reason: format!("expected entry index {}, found {}", position, entry.entry_index),
            });
        }
        entry.verify_link(&previous)?;
        previous = entry.entry_hash;
    }
    Ok(())
}

/// Volatile store for tests and single-process development
#[derive(Debug, Default)]
pub struct MemoryStore {
    log: StoredLog,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for MemoryStore {
    fn load(&mut self) -> Result<StoredLog> {
        check_chain(&self.log.entries)?;
        Ok(self.log.clone())
    }

    fn append_entry(&mut self, entry: &LogEntry) -> Result<()> {
        let expected = self.log.entries.len() as u64;
        if entry.entry_index != expected {
            return Err(LogError::Storage(format!(
                "append out of order: expected index {}, got {}",
                expected, entry.entry_index
            )));
        }
        self.log.entries.push(entry.clone());
        Ok(())
    }

    fn append_tree_head(&mut self, head: &SignedTreeHead) -> Result<()> {
        self.log.heads.push(head.clone());
        Ok(())
    }

    fn record_anchor(&mut self, tree_size: u64, reference: &str) -> Result<()> {
        let head = self
            .log
            .heads
            .iter_mut()
            .rev()
            .find(|h| h.tree_size == tree_size)
            .ok_or_else(|| LogError::Storage(format!("no tree head at size {}", tree_size)))?;
        head.anchor_reference = Some(reference.to_string());
        Ok(())
    }
}

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::{check_chain, LogStore, StoredLog};
    use crate::entry::{LogEntry, VerdictPayload};
    use crate::error::{LogError, Result};
    use crate::tree_head::SignedTreeHead;
    use qlafs_core::Digest;
    use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
    use std::path::{Path, PathBuf};
    use tracing::{debug, error, info};

    /// SQLite-backed store.
    ///
    /// WAL journaling, append-only tables enforced by triggers, and a
    /// continuity check of the whole hash chain on open.
    pub struct SqliteStore {
        conn: Connection,
        path: PathBuf,
    }

    impl SqliteStore {
        pub fn open(path: impl AsRef<Path>) -> Result<Self> {
            let path = path.as_ref();
            info!(path = %path.display(), "Opening transparency log store");

            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }

            let conn = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            Self::init_schema(&conn)?;

            let mut store = Self {
                conn,
                path: path.to_path_buf(),
            };
            store.startup_continuity_check()?;
            Ok(store)
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        fn init_schema(conn: &Connection) -> Result<()> {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS log_entries (
                    entry_index INTEGER PRIMARY KEY,
                    proposal_id TEXT NOT NULL UNIQUE,
                    payload TEXT NOT NULL,
                    previous_hash BLOB NOT NULL,
                    entry_hash BLOB NOT NULL UNIQUE,
                    appended_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS tree_heads (
                    tree_size INTEGER PRIMARY KEY,
                    root_hash BLOB NOT NULL,
                    timestamp INTEGER NOT NULL,
                    public_key BLOB NOT NULL,
                    signature BLOB NOT NULL,
                    anchor_reference TEXT
                );

                CREATE TRIGGER IF NOT EXISTS log_entries_no_update
                BEFORE UPDATE ON log_entries
                BEGIN SELECT RAISE(ABORT, 'log_entries is append-only'); END;

                CREATE TRIGGER IF NOT EXISTS log_entries_no_delete
                BEFORE DELETE ON log_entries
                BEGIN SELECT RAISE(ABORT, 'log_entries is append-only'); END;

                CREATE TRIGGER IF NOT EXISTS tree_heads_no_rewrite
                BEFORE UPDATE OF tree_size, root_hash, timestamp, public_key, signature
                ON tree_heads
                BEGIN SELECT RAISE(ABORT, 'tree_heads is append-only'); END;

                CREATE TRIGGER IF NOT EXISTS tree_heads_no_delete
                BEFORE DELETE ON tree_heads
                BEGIN SELECT RAISE(ABORT, 'tree_heads is append-only'); END;
                "#,
            )?;
            Ok(())
        }

        /// Re-walk the stored hash chain; refuses to open a corrupted log
        pub fn startup_continuity_check(&mut self) -> Result<()> {
            let entries = self.read_entries()?;
            match check_chain(&entries) {
                Ok(()) => {
                    info!(
                        path = %self.path.display(),
                        entries = entries.len(),
                        "Transparency log continuity check passed"
                    );
                    Ok(())
                }
                Err(e) => {
                    error!(path = %self.path.display(), error = %e, "Transparency log corrupted");
                    Err(e)
                }
            }
        }

        fn read_entries(&self) -> Result<Vec<LogEntry>> {
            let mut stmt = self.conn.prepare(
                r#"
                SELECT entry_index, payload, previous_hash, entry_hash, appended_at
                FROM log_entries
                ORDER BY entry_index ASC
                "#,
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?;

            let mut entries = Vec::new();
            for row in rows {
                let (index, payload, previous, hash, appended_at) = row?;
                let payload: VerdictPayload = serde_json::from_str(&payload)?;
                entries.push(LogEntry {
                    entry_index: index as u64,
                    payload,
                    previous_hash: digest_column(index, "previous_hash", previous)?,
                    entry_hash: digest_column(index, "entry_hash", hash)?,
                    appended_at: appended_at as u64,
                });
            }
            Ok(entries)
        }

        fn read_heads(&self) -> Result<Vec<SignedTreeHead>> {
            let mut stmt = self.conn.prepare(
                r#"
                SELECT tree_size, root_hash, timestamp, public_key, signature, anchor_reference
                FROM tree_heads
                ORDER BY tree_size ASC
                "#,
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                    row.get::<_, Vec<u8>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })?;

            let mut heads = Vec::new();
            for row in rows {
                let (size, root, timestamp, public_key, signature, anchor_reference) = row?;
                heads.push(SignedTreeHead {
                    tree_size: size as u64,
                    root_hash: digest_column(size, "root_hash", root)?,
                    timestamp: timestamp as u64,
                    anchor_reference,
                    public_key: digest_column(size, "public_key", public_key)?,
                    signature,
                });
            }
            Ok(heads)
        }

        #[cfg(test)]
        fn execute_raw(&self, sql: &str) -> Result<usize> {
            Ok(self.conn.execute(sql, [])?)
        }
    }

    fn digest_column(row: i64, column: &str, bytes: Vec<u8>) -> Result<Digest> {
        bytes.try_into().map_err(|_| {
            LogError::Storage(format!("row {}: column {} is not 32 bytes", row, column))
        })
    }

    impl LogStore for SqliteStore {
        fn load(&mut self) -> Result<StoredLog> {
            let entries = self.read_entries()?;
            check_chain(&entries)?;
            let heads = self.read_heads()?;
            Ok(StoredLog { entries, heads })
        }

        fn append_entry(&mut self, entry: &LogEntry) -> Result<()> {
            let tx = self.conn.transaction()?;

            let last: Option<(i64, Vec<u8>)> = tx
                .query_row(
                    "SELECT entry_index, entry_hash FROM log_entries
                     ORDER BY entry_index DESC LIMIT 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let (expected_index, expected_previous) = match last {
                Some((index, hash)) => ((index + 1) as u64, hash),
                None => (0, vec![0u8; 32]),
            };
            if entry.entry_index != expected_index {
                return Err(LogError::Storage(format!(
                    "append out of order: expected index {}, got {}",
                    expected_index, entry.entry_index
                )));
            }
            if entry.previous_hash[..] != expected_previous[..] {
                return Err(LogError::ChainBroken {
                    index: entry.entry_index,
                    reason: format!(
                        "expected previous hash {}, got {}",
                        hex::encode(&expected_previous),
                        hex::encode(entry.previous_hash)
                    ),
                });
            }

            tx.execute(
                r#"
                INSERT INTO log_entries (
                    entry_index, proposal_id, payload, previous_hash, entry_hash, appended_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    entry.entry_index as i64,
                    entry.payload.proposal_id,
                    serde_json::to_string(&entry.payload)?,
                    &entry.previous_hash[..],
                    &entry.entry_hash[..],
                    entry.appended_at as i64,
                ],
            )?;
            tx.commit()?;

            debug!(
                entry_index = entry.entry_index,
                proposal_id = %entry.payload.proposal_id,
                "Log entry persisted"
            );
            Ok(())
        }

        fn append_tree_head(&mut self, head: &SignedTreeHead) -> Result<()> {
            self.conn.execute(
                r#"
                INSERT INTO tree_heads (
                    tree_size, root_hash, timestamp, public_key, signature, anchor_reference
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    head.tree_size as i64,
                    &head.root_hash[..],
                    head.timestamp as i64,
                    &head.public_key[..],
                    head.signature,
                    head.anchor_reference,
                ],
            )?;
            Ok(())
        }

        fn record_anchor(&mut self, tree_size: u64, reference: &str) -> Result<()> {
            let updated = self.conn.execute(
                "UPDATE tree_heads SET anchor_reference = ?1 WHERE tree_size = ?2",
                params![reference, tree_size as i64],
            )?;
            if updated == 0 {
                return Err(LogError::Storage(format!("no tree head at size {}", tree_size)));
            }
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::entry::LogEntry;
        use crate::store::tests::payload;
        use qlafs_core::{generate_signing_key, ZERO_DIGEST};

        fn temp_db() -> PathBuf {
            std::env::temp_dir().join(format!("qlafs_log_{}.db", uuid::Uuid::new_v4()))
        }

        fn append_chain(store: &mut SqliteStore, count: u64) -> Vec<LogEntry> {
            let mut previous = ZERO_DIGEST;
            let mut entries = Vec::new();
            for i in 0..count {
                let entry = LogEntry::new(i, previous, payload(i), 1_000 + i).unwrap();
                store.append_entry(&entry).unwrap();
                previous = entry.entry_hash;
                entries.push(entry);
            }
            entries
        }

        #[test]
        fn test_reopen_restores_entries_and_heads() {
            let path = temp_db();
            let key = generate_signing_key();
            let entries = {
                let mut store = SqliteStore::open(&path).unwrap();
                let entries = append_chain(&mut store, 5);
                let head = SignedTreeHead::sign(&key, 5, [7u8; 32], 42);
                store.append_tree_head(&head).unwrap();
                store.record_anchor(5, "anchor-5").unwrap();
                entries
            };

            let mut reopened = SqliteStore::open(&path).unwrap();
            let loaded = reopened.load().unwrap();
            assert_eq!(loaded.entries, entries);
            assert_eq!(loaded.heads.len(), 1);
            assert_eq!(loaded.heads[0].anchor_reference.as_deref(), Some("anchor-5"));
            assert!(loaded.heads[0]
                .verify_with(&key.verifying_key().to_bytes())
                .is_ok());
        }

        #[test]
        fn test_append_rejects_broken_link() {
            let mut store = SqliteStore::open(temp_db()).unwrap();
            append_chain(&mut store, 2);

            let stray = LogEntry::new(2, [9u8; 32], payload(2), 0).unwrap();
            assert!(matches!(
                store.append_entry(&stray),
                Err(LogError::ChainBroken { index: 2, .. })
            ));
        }

        #[test]
        fn test_entries_are_append_only() {
            let mut store = SqliteStore::open(temp_db()).unwrap();
            append_chain(&mut store, 1);
            assert!(store.execute_raw("DELETE FROM log_entries").is_err());
            assert!(store
                .execute_raw("UPDATE log_entries SET appended_at = 0")
                .is_err());
        }

        #[test]
        fn test_continuity_check_detects_modified_record() {
            let path = temp_db();
            {
                let mut store = SqliteStore::open(&path).unwrap();
                append_chain(&mut store, 3);
                store
                    .execute_raw("DROP TRIGGER log_entries_no_update")
                    .unwrap();
                store
                    .execute_raw(
                        "UPDATE log_entries SET payload = replace(payload, 'accept', 'reject') \
                         WHERE entry_index = 1",
                    )
                    .unwrap();
            }

            assert!(matches!(
                SqliteStore::open(&path),
                Err(LogError::ChainBroken { index: 1, .. })
            ));
        }
    }
}
