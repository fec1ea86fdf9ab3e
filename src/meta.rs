//! The `meta` module remembers the MIME type of served and uploaded content.
//!
//! Entries are keyed by the short form of the content reference (see
//! [BlobRef::to_short](crate::blobref::BlobRef::to_short)) and persisted in a single
//! database file, so types sniffed once survive a restart.
//!
//! The last write for a key wins. Nothing expires; when a capacity is given, storing a new
//! key in a full cache first drops the oldest key.
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use log::{debug, error};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;

pub struct MimeCache {
    conn: Mutex<Option<Connection>>,
    capacity: usize,
}

impl MimeCache {
    /// Open or create the cache at `path`. A `capacity` of 0 means unbounded.
    pub fn open(path: &Path, capacity: usize) -> Result<MimeCache> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS mime (
                key TEXT PRIMARY KEY NOT NULL,
                mime_type TEXT NOT NULL
            );",
        )?;
        debug!("opened mime cache {:?}", path);
        Ok(MimeCache {
            conn: Mutex::new(Some(conn)),
            capacity,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        match self.conn.lock() {
            Ok(v) => v,
            Err(e) => e.into_inner(),
        }
    }

    /// The stored MIME type for `key`, or an empty string.
    pub fn get(&self, key: &str) -> String {
        let guard = self.lock();
        let conn = match guard.as_ref() {
            Some(v) => v,
            None => return String::new(),
        };
        let r = conn
            .query_row("SELECT mime_type FROM mime WHERE key = ?1", params![key], |row| {
                row.get::<_, String>(0)
            })
            .optional();
        match r {
            Ok(v) => v.unwrap_or_default(),
            Err(e) => {
                error!("mime cache get {}: {}", key, e);
                String::new()
            },
        }
    }

    pub fn set(&self, key: &str, mime_type: &str) {
        let guard = self.lock();
        let conn = match guard.as_ref() {
            Some(v) => v,
            None => return,
        };
        if let Err(e) = self.insert(conn, key, mime_type) {
            error!("mime cache set {}={}: {}", key, mime_type, e);
        }
    }

    fn insert(&self, conn: &Connection, key: &str, mime_type: &str) -> Result<()> {
        if self.capacity > 0 {
            let have: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM mime WHERE key = ?1)",
                params![key],
                |row| row.get(0),
            )?;
            if !have {
                let count: i64 = conn.query_row("SELECT COUNT(*) FROM mime", [], |row| row.get(0))?;
                let excess = count + 1 - self.capacity as i64;
                if excess > 0 {
                    conn.execute(
                        "DELETE FROM mime WHERE rowid IN (SELECT rowid FROM mime ORDER BY rowid LIMIT ?1)",
                        params![excess],
                    )?;
                    debug!("mime cache full, dropped {} entries", excess);
                }
            }
        }
        conn.execute(
            "INSERT INTO mime (key, mime_type) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET mime_type = excluded.mime_type",
            params![key, mime_type],
        )?;
        debug!("mime cache {} = {}", key, mime_type);
        Ok(())
    }

    /// Release the backing file. Later calls see an empty cache.
    pub fn close(&self) {
        let mut guard = self.lock();
        if let Some(conn) = guard.take() {
            if let Err((_, e)) = conn.close() {
                error!("mime cache close: {}", e);
            }
        }
    }
}

impl Drop for MimeCache {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use tempfile::tempdir;

    use super::MimeCache;

    #[test]
    fn test_meta_mime() {
        let d = tempdir().unwrap();
        let fp = d.path().join("mimecache.kv");
        let c = MimeCache::open(&fp, 0).unwrap();
        assert_eq!(c.get("sha1-foo"), "");
        c.set("sha1-foo", "application/zip");
        c.set("sha1-foo", "text/plain");
        assert_eq!(c.get("sha1-foo"), "text/plain");
        c.close();
        assert_eq!(c.get("sha1-foo"), "");
        drop(c);

        let c = MimeCache::open(&fp, 0).unwrap();
        assert_eq!(c.get("sha1-foo"), "text/plain");
    }

    #[test]
    fn test_meta_capacity() {
        let d = tempdir().unwrap();
        let c = MimeCache::open(&d.path().join("mimecache.kv"), 2).unwrap();
        c.set("a", "text/plain");
        c.set("b", "text/html");
        c.set("b", "text/css");
        assert_eq!(c.get("a"), "text/plain");
        c.set("c", "image/png");
        assert_eq!(c.get("a"), "");
        assert_eq!(c.get("b"), "text/css");
        assert_eq!(c.get("c"), "image/png");
    }

    #[test]
    fn test_meta_concurrent() {
        let d = tempdir().unwrap();
        let c = Arc::new(MimeCache::open(&d.path().join("mimecache.kv"), 0).unwrap());
        let mut handles = vec![];
        for i in 0..8 {
            let c = c.clone();
            handles.push(thread::spawn(move || {
                for j in 0..50 {
                    let k = format!("k{}-{}", i, j);
                    c.set(&k, "text/plain");
                    assert_eq!(c.get(&k), "text/plain");
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(c.get("k7-49"), "text/plain");
    }
}
