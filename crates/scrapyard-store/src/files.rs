//! Local content store: a keyed blob table independent of the replicated
//! catalog. Blobs never enter the CRDT; they move between peers only through
//! the file-transfer protocol.

use std::path::{Path, PathBuf};

use chrono::Utc;
use directories::ProjectDirs;
use rusqlite::{params, Connection, OptionalExtension, Row};

use scrapyard_shared::protocol::FileEntry;

use crate::error::{Result, StoreError};
use crate::models::{parse_timestamp, StoredFile};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS site_files (
    site_id      TEXT NOT NULL,
    path         TEXT NOT NULL,
    content_type TEXT NOT NULL,
    bytes        BLOB NOT NULL,
    byte_len     INTEGER NOT NULL,
    cached_at    TEXT NOT NULL,
    PRIMARY KEY (site_id, path)
);

CREATE INDEX IF NOT EXISTS idx_site_files_site ON site_files(site_id);
"#;

/// Blob store keyed by `(site_id, path)` with a secondary index by site.
pub struct FileStore {
    conn: Connection,
}

impl FileStore {
    /// Open (or create) the blob store companion to the named catalog
    /// database.
    pub fn new(db_name: &str) -> Result<Self> {
        let project_dirs =
            ProjectDirs::from("org", "scrapyard", "scrapyard").ok_or(StoreError::NoDataDir)?;
        let path = project_dirs.data_dir().join(format!("{db_name}_files.db"));
        Self::open_at(&path)
    }

    /// Open (or create) the blob store at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "opening file store");

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    /// Return the filesystem path of the open store (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }

    /// Store a blob, overwriting any previous content at the same key.
    pub fn put(&self, site_id: &str, path: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO site_files (site_id, path, content_type, bytes, byte_len, cached_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                site_id,
                path,
                content_type,
                bytes,
                bytes.len() as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;
        tracing::debug!(site = site_id, path, size = bytes.len(), "stored blob");
        Ok(())
    }

    pub fn get(&self, site_id: &str, path: &str) -> Result<Option<StoredFile>> {
        Ok(self
            .conn
            .query_row(
                "SELECT site_id, path, content_type, bytes, byte_len, cached_at
                 FROM site_files WHERE site_id = ?1 AND path = ?2",
                params![site_id, path],
                row_to_file,
            )
            .optional()?)
    }

    /// All records for a site, in stable path order.
    pub fn list(&self, site_id: &str) -> Result<Vec<StoredFile>> {
        let mut stmt = self.conn.prepare(
            "SELECT site_id, path, content_type, bytes, byte_len, cached_at
             FROM site_files WHERE site_id = ?1 ORDER BY path",
        )?;
        let rows = stmt.query_map(params![site_id], row_to_file)?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        Ok(files)
    }

    /// Path, size and content-type of every file in a site, without loading
    /// the blob contents. Stable path order.
    pub fn list_entries(&self, site_id: &str) -> Result<Vec<FileEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT path, byte_len, content_type
             FROM site_files WHERE site_id = ?1 ORDER BY path",
        )?;
        let rows = stmt.query_map(params![site_id], |row| {
            Ok(FileEntry {
                path: row.get(0)?,
                size: row.get::<_, i64>(1)? as u64,
                content_type: row.get(2)?,
            })
        })?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Remove all records for a site. Idempotent; returns the removed count.
    pub fn delete_site(&self, site_id: &str) -> Result<usize> {
        let removed = self
            .conn
            .execute("DELETE FROM site_files WHERE site_id = ?1", params![site_id])?;
        if removed > 0 {
            tracing::debug!(site = site_id, removed, "deleted site blobs");
        }
        Ok(removed)
    }

    /// Duplicate every blob of `from_id` under `to_id`, refreshing the
    /// cache timestamps. Existing blobs under `to_id` are overwritten.
    pub fn copy_site(&self, from_id: &str, to_id: &str) -> Result<usize> {
        let copied = self.conn.execute(
            "INSERT OR REPLACE INTO site_files (site_id, path, content_type, bytes, byte_len, cached_at)
             SELECT ?2, path, content_type, bytes, byte_len, ?3
             FROM site_files WHERE site_id = ?1",
            params![from_id, to_id, Utc::now().to_rfc3339()],
        )?;
        tracing::debug!(from = from_id, to = to_id, copied, "copied site blobs");
        Ok(copied)
    }

    /// Total bytes stored under one site.
    pub fn site_size(&self, site_id: &str) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COALESCE(SUM(byte_len), 0) FROM site_files WHERE site_id = ?1",
            params![site_id],
            |row| row.get(0),
        )?)
    }

    /// Number of files stored under one site.
    pub fn site_file_count(&self, site_id: &str) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM site_files WHERE site_id = ?1",
            params![site_id],
            |row| row.get(0),
        )?)
    }

    /// Total bytes across every site.
    pub fn total_size(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COALESCE(SUM(byte_len), 0) FROM site_files", [], |row| {
                row.get(0)
            })?)
    }
}

fn row_to_file(row: &Row<'_>) -> rusqlite::Result<StoredFile> {
    let cached_at: String = row.get(5)?;
    Ok(StoredFile {
        site_id: row.get(0)?,
        path: row.get(1)?,
        content_type: row.get(2)?,
        bytes: row.get(3)?,
        byte_len: row.get(4)?,
        cached_at: parse_timestamp(&cached_at),
    })
}
