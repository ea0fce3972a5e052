//! Typed queries over the replicated `sites` table.
//!
//! All writes go through the store's tracked connection so the CRDT triggers
//! version them; reads are plain SQL.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::crdt::CrdtStore;
use crate::error::Result;
use crate::models::{parse_timestamp, Site, SitePatch};

const SITE_COLUMNS: &str = "id, name, description, url, thumbnail, owner_id, content_hash,
     file_count, file_size, added_at, updated_at";

impl CrdtStore {
    pub fn insert_site(&self, site: &Site) -> Result<()> {
        self.conn().execute(
            "INSERT INTO sites (id, name, description, url, thumbnail, owner_id, content_hash,
                                file_count, file_size, added_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                site.id,
                site.name,
                site.description,
                site.url,
                site.thumbnail,
                site.owner_id,
                site.content_hash,
                site.file_count,
                site.file_size,
                site.added_at.to_rfc3339(),
                site.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_site(&self, id: &str) -> Result<Option<Site>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {SITE_COLUMNS} FROM sites WHERE id = ?1"),
                params![id],
                row_to_site,
            )
            .optional()?)
    }

    pub fn all_sites(&self) -> Result<Vec<Site>> {
        self.select_sites(&format!(
            "SELECT {SITE_COLUMNS} FROM sites ORDER BY added_at DESC, id"
        ))
    }

    /// Sites created by this replica.
    pub fn sites_owned_by(&self, owner_id: &str) -> Result<Vec<Site>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {SITE_COLUMNS} FROM sites WHERE owner_id = ?1 ORDER BY added_at DESC, id"
        ))?;
        let rows = stmt.query_map(params![owner_id], row_to_site)?;
        let mut sites = Vec::new();
        for row in rows {
            sites.push(row?);
        }
        Ok(sites)
    }

    /// Foreign sites that actually carry files.
    pub fn sites_available_to(&self, owner_id: &str) -> Result<Vec<Site>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {SITE_COLUMNS} FROM sites
             WHERE owner_id <> ?1 AND file_count > 0
             ORDER BY added_at DESC, id"
        ))?;
        let rows = stmt.query_map(params![owner_id], row_to_site)?;
        let mut sites = Vec::new();
        for row in rows {
            sites.push(row?);
        }
        Ok(sites)
    }

    /// Apply a partial update; returns false when the id is unknown.
    pub fn update_site(&self, id: &str, patch: &SitePatch, updated_at: DateTime<Utc>) -> Result<bool> {
        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<rusqlite::types::Value> = Vec::new();

        if let Some(name) = &patch.name {
            sets.push("name");
            values.push(name.clone().into());
        }
        if let Some(description) = &patch.description {
            sets.push("description");
            values.push(description.clone().into());
        }
        if let Some(url) = &patch.url {
            sets.push("url");
            values.push(url.clone().into());
        }
        if let Some(thumbnail) = &patch.thumbnail {
            sets.push("thumbnail");
            values.push(thumbnail.clone().into());
        }
        if let Some(hash) = &patch.content_hash {
            sets.push("content_hash");
            values.push(hash.clone().into());
        }
        sets.push("updated_at");
        values.push(updated_at.to_rfc3339().into());

        let assignments: Vec<String> = sets
            .iter()
            .enumerate()
            .map(|(i, col)| format!("{col} = ?{}", i + 1))
            .collect();
        values.push(id.to_string().into());
        let sql = format!(
            "UPDATE sites SET {} WHERE id = ?{}",
            assignments.join(", "),
            values.len()
        );

        let affected = self
            .conn()
            .execute(&sql, rusqlite::params_from_iter(values))?;
        Ok(affected > 0)
    }

    /// Refresh the owner's local file statistics on a row.
    pub fn set_file_stats(
        &self,
        id: &str,
        file_count: i64,
        file_size: i64,
        updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE sites SET file_count = ?2, file_size = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, file_count, file_size, updated_at.to_rfc3339()],
        )?;
        Ok(affected > 0)
    }

    /// Find a site this replica owns with the given upload fingerprint.
    pub fn find_site_by_hash(&self, owner_id: &str, hash: &str) -> Result<Option<Site>> {
        Ok(self
            .conn()
            .query_row(
                &format!(
                    "SELECT {SITE_COLUMNS} FROM sites
                     WHERE owner_id = ?1 AND content_hash = ?2
                     ORDER BY added_at DESC LIMIT 1"
                ),
                params![owner_id, hash],
                row_to_site,
            )
            .optional()?)
    }

    /// Tombstone a row. Idempotent; returns false when nothing was there.
    pub fn delete_site_row(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM sites WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    fn select_sites(&self, sql: &str) -> Result<Vec<Site>> {
        let mut stmt = self.conn().prepare(sql)?;
        let rows = stmt.query_map([], row_to_site)?;
        let mut sites = Vec::new();
        for row in rows {
            sites.push(row?);
        }
        Ok(sites)
    }
}

fn row_to_site(row: &Row<'_>) -> rusqlite::Result<Site> {
    let added_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;
    Ok(Site {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        url: row.get(3)?,
        thumbnail: row.get(4)?,
        owner_id: row.get(5)?,
        content_hash: row.get(6)?,
        file_count: row.get(7)?,
        file_size: row.get(8)?,
        added_at: parse_timestamp(&added_at),
        updated_at: parse_timestamp(&updated_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn test_store() -> (CrdtStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CrdtStore::open_at(&dir.path().join("catalog.db")).unwrap();
        store.enable_crdt("sites").unwrap();
        (store, dir)
    }

    fn sample(id: &str, owner: &str) -> Site {
        let now = Utc::now();
        Site {
            id: id.into(),
            name: format!("site {id}"),
            description: String::new(),
            url: String::new(),
            thumbnail: String::new(),
            owner_id: owner.into(),
            content_hash: Some(format!("hash-{id}")),
            file_count: 0,
            file_size: 0,
            added_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn insert_and_get_round_trip() {
        let (store, _dir) = test_store();
        let site = sample("a", "me");
        store.insert_site(&site).unwrap();

        let got = store.get_site("a").unwrap().unwrap();
        assert_eq!(got.id, "a");
        assert_eq!(got.name, "site a");
        assert_eq!(got.owner_id, "me");
        assert!(store.get_site("missing").unwrap().is_none());
    }

    #[test]
    fn ownership_filters() {
        let (store, _dir) = test_store();
        store.insert_site(&sample("mine", "me")).unwrap();
        let mut theirs = sample("theirs", "them");
        theirs.file_count = 3;
        store.insert_site(&theirs).unwrap();
        store.insert_site(&sample("empty-theirs", "them")).unwrap();

        let mine = store.sites_owned_by("me").unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, "mine");

        // Only foreign rows with files are importable.
        let available = store.sites_available_to("me").unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].id, "theirs");

        assert_eq!(store.all_sites().unwrap().len(), 3);
    }

    #[test]
    fn patch_updates_selected_fields() {
        let (store, _dir) = test_store();
        store.insert_site(&sample("a", "me")).unwrap();

        let patch = SitePatch {
            name: Some("renamed".into()),
            ..Default::default()
        };
        assert!(store.update_site("a", &patch, Utc::now()).unwrap());
        let got = store.get_site("a").unwrap().unwrap();
        assert_eq!(got.name, "renamed");
        assert_eq!(got.content_hash.as_deref(), Some("hash-a"));

        assert!(!store.update_site("missing", &patch, Utc::now()).unwrap());
    }

    #[test]
    fn file_stats_update() {
        let (store, _dir) = test_store();
        store.insert_site(&sample("a", "me")).unwrap();
        assert!(store.set_file_stats("a", 3, 130_000, Utc::now()).unwrap());

        let got = store.get_site("a").unwrap().unwrap();
        assert_eq!(got.file_count, 3);
        assert_eq!(got.file_size, 130_000);
    }

    #[test]
    fn hash_lookup_is_owner_scoped() {
        let (store, _dir) = test_store();
        store.insert_site(&sample("a", "me")).unwrap();
        store.insert_site(&sample("b", "them")).unwrap();

        let hit = store.find_site_by_hash("me", "hash-a").unwrap();
        assert_eq!(hit.unwrap().id, "a");
        assert!(store.find_site_by_hash("me", "hash-b").unwrap().is_none());
    }

    #[test]
    fn delete_is_idempotent() {
        let (store, _dir) = test_store();
        store.insert_site(&sample("a", "me")).unwrap();

        assert!(store.delete_site_row("a").unwrap());
        assert!(!store.delete_site_row("a").unwrap());
        assert!(store.get_site("a").unwrap().is_none());
    }
}
