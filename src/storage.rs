//! The `Storage` trait and its two implementations.
//!
//! Per spec §4.3 / §9 Design Notes, `Storage` is "the only durable
//! (process-lifetime) operator state" and is modeled as a trait with
//! `get/set/del/scan` so operators never assume the backing store is
//! in-memory. Two implementations ship:
//! - [`MemStorage`] — a `BTreeMap`-backed in-memory store, used for all
//!   operator scratch storage (operator state is memory-resident per
//!   spec §1 Non-goals) and as the default Source row store.
//! - [`SqliteStorage`] — an on-disk store backed by `rusqlite`, for the
//!   "(and on-disk SQLite-backed) row sources" clause of spec §1.
//!
//! Keys are `Vec<Vec<u8>>` path segments (mirroring the Join operator's
//! `["pKeySet", parentKeyValue, parentPrimaryKey]` composite keys from
//! spec §4.5) rather than a single opaque byte string, so `scan` can do
//! ordered prefix matching without every caller reinventing a key-packing
//! scheme.

use std::collections::BTreeMap;

use crate::error::ZqlError;

/// A storage key: an ordered tuple of opaque byte segments.
pub type StorageKey = Vec<Vec<u8>>;

/// Per-operator (or per-source) scratch key/value store with ordered
/// prefix scanning. Implementations need not be atomic across operators —
/// each operator owns a disjoint `Storage` instance.
pub trait Storage: Send {
    fn get(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, ZqlError>;
    fn set(&mut self, key: StorageKey, value: Vec<u8>) -> Result<(), ZqlError>;
    fn del(&mut self, key: &StorageKey) -> Result<(), ZqlError>;

    /// Scans all keys with the given prefix, in ascending key order,
    /// optionally starting after `start` and capped at `limit` entries.
    fn scan(
        &self,
        prefix: &[Vec<u8>],
        start: Option<&StorageKey>,
        limit: Option<usize>,
    ) -> Result<Vec<(StorageKey, Vec<u8>)>, ZqlError>;
}

/// The default in-memory backing store. Used for all operator `Storage`
/// (spec §4.3) and for sources with no persistence requirement.
#[derive(Default)]
pub struct MemStorage {
    map: BTreeMap<StorageKey, Vec<u8>>,
}

impl MemStorage {
    pub fn new() -> Self {
        MemStorage::default()
    }
}

impl Storage for MemStorage {
    fn get(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, ZqlError> {
        Ok(self.map.get(key).cloned())
    }

    fn set(&mut self, key: StorageKey, value: Vec<u8>) -> Result<(), ZqlError> {
        self.map.insert(key, value);
        Ok(())
    }

    fn del(&mut self, key: &StorageKey) -> Result<(), ZqlError> {
        self.map.remove(key);
        Ok(())
    }

    fn scan(
        &self,
        prefix: &[Vec<u8>],
        start: Option<&StorageKey>,
        limit: Option<usize>,
    ) -> Result<Vec<(StorageKey, Vec<u8>)>, ZqlError> {
        let lower = start
            .cloned()
            .unwrap_or_else(|| prefix.to_vec());
        let mut out = Vec::new();
        for (k, v) in self.map.range(lower..) {
            if !k.starts_with(prefix) {
                if k.as_slice() > prefix && !k.starts_with(prefix) {
                    break;
                }
                continue;
            }
            out.push((k.clone(), v.clone()));
            if let Some(limit) = limit {
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }
}

/// An on-disk store backed by `rusqlite`, for sources that want their
/// rows to survive a process restart. One SQLite table holds the flat
/// key/value map; keys are joined with a `\0` separator between segments
/// (segments themselves must not contain `\0`, which holds for the row
/// identifiers this engine generates).
pub struct SqliteStorage {
    conn: rusqlite::Connection,
}

impl SqliteStorage {
    pub fn open(path: &str) -> Result<Self, ZqlError> {
        let conn = rusqlite::Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS zql_kv (k BLOB PRIMARY KEY, v BLOB NOT NULL) WITHOUT ROWID;",
        )?;
        Ok(SqliteStorage { conn })
    }

    pub fn open_in_memory() -> Result<Self, ZqlError> {
        let conn = rusqlite::Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS zql_kv (k BLOB PRIMARY KEY, v BLOB NOT NULL) WITHOUT ROWID;",
        )?;
        Ok(SqliteStorage { conn })
    }

    fn pack(key: &StorageKey) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, seg) in key.iter().enumerate() {
            if i > 0 {
                out.push(0u8);
            }
            out.extend_from_slice(seg);
        }
        out
    }
}

impl Storage for SqliteStorage {
    fn get(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, ZqlError> {
        let packed = Self::pack(key);
        let mut stmt = self.conn.prepare("SELECT v FROM zql_kv WHERE k = ?1")?;
        let mut rows = stmt.query([packed])?;
        Ok(match rows.next()? {
            Some(row) => Some(row.get(0)?),
            None => None,
        })
    }

    fn set(&mut self, key: StorageKey, value: Vec<u8>) -> Result<(), ZqlError> {
        let packed = Self::pack(&key);
        self.conn.execute(
            "INSERT INTO zql_kv (k, v) VALUES (?1, ?2) ON CONFLICT(k) DO UPDATE SET v = excluded.v",
            rusqlite::params![packed, value],
        )?;
        Ok(())
    }

    fn del(&mut self, key: &StorageKey) -> Result<(), ZqlError> {
        let packed = Self::pack(key);
        self.conn
            .execute("DELETE FROM zql_kv WHERE k = ?1", [packed])?;
        Ok(())
    }

    fn scan(
        &self,
        prefix: &[Vec<u8>],
        start: Option<&StorageKey>,
        limit: Option<usize>,
    ) -> Result<Vec<(StorageKey, Vec<u8>)>, ZqlError> {
        let packed_prefix = Self::pack(&prefix.to_vec());
        let lower = start.map(Self::pack).unwrap_or_else(|| packed_prefix.clone());
        let mut stmt = self
            .conn
            .prepare("SELECT k, v FROM zql_kv WHERE k >= ?1 ORDER BY k ASC")?;
        let rows = stmt.query_map([lower], |row| {
            let k: Vec<u8> = row.get(0)?;
            let v: Vec<u8> = row.get(1)?;
            Ok((k, v))
        })?;
        let mut out = Vec::new();
        for r in rows {
            let (k, v) = r?;
            if !k.starts_with(&packed_prefix) {
                break;
            }
            // Unpacking back into segments is unnecessary for callers in
            // this crate (they only ever re-derive keys they already
            // know the shape of), so we return a single opaque segment.
            out.push((vec![k], v));
            if let Some(limit) = limit {
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(parts: &[&str]) -> StorageKey {
        parts.iter().map(|s| s.as_bytes().to_vec()).collect()
    }

    #[test]
    fn mem_storage_roundtrip() {
        let mut s = MemStorage::new();
        s.set(key(&["a", "1"]), b"hello".to_vec()).unwrap();
        assert_eq!(s.get(&key(&["a", "1"])).unwrap(), Some(b"hello".to_vec()));
        s.del(&key(&["a", "1"])).unwrap();
        assert_eq!(s.get(&key(&["a", "1"])).unwrap(), None);
    }

    #[test]
    fn mem_storage_scan_prefix() {
        let mut s = MemStorage::new();
        s.set(key(&["pKeySet", "1", "10"]), b"".to_vec()).unwrap();
        s.set(key(&["pKeySet", "1", "11"]), b"".to_vec()).unwrap();
        s.set(key(&["pKeySet", "2", "20"]), b"".to_vec()).unwrap();
        let results = s.scan(&[b"pKeySet".to_vec(), b"1".to_vec()], None, None).unwrap();
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn sqlite_storage_roundtrip() {
        let mut s = SqliteStorage::open_in_memory().unwrap();
        s.set(key(&["x"]), b"1".to_vec()).unwrap();
        assert_eq!(s.get(&key(&["x"])).unwrap(), Some(b"1".to_vec()));
        s.del(&key(&["x"])).unwrap();
        assert_eq!(s.get(&key(&["x"])).unwrap(), None);
    }
}
