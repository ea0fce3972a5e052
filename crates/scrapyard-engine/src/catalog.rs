//! Catalog API: typed operations over the replicated `sites` table.
//!
//! Writes go through the tracked store, so every mutation here becomes a
//! change batch on the next broadcast tick.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use scrapyard_shared::types::SiteId;
use scrapyard_store::{Site, SitePatch};

use crate::error::{EngineError, Result};
use crate::ScrapYard;

/// Fields supplied when registering a site.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewSite {
    pub name: String,
    pub description: String,
    pub url: String,
    pub thumbnail: String,
    pub content_hash: Option<String>,
    pub file_count: i64,
    pub file_size: i64,
}

/// Result of adopting a foreign site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdoptOutcome {
    pub new_id: String,
    pub original_id: String,
}

impl ScrapYard {
    /// Every catalog row, newest first.
    pub fn all_sites(&self) -> Result<Vec<Site>> {
        Ok(self.store()?.lock().expect("store lock").all_sites()?)
    }

    /// Rows this node created.
    pub fn my_sites(&self) -> Result<Vec<Site>> {
        let inner = self.inner()?;
        Ok(inner
            .store
            .lock()
            .expect("store lock")
            .sites_owned_by(&inner.node_id.to_hex())?)
    }

    /// Foreign rows that actually carry files, i.e. candidates for import.
    pub fn available_sites(&self) -> Result<Vec<Site>> {
        let inner = self.inner()?;
        Ok(inner
            .store
            .lock()
            .expect("store lock")
            .sites_available_to(&inner.node_id.to_hex())?)
    }

    pub fn get_site(&self, id: &str) -> Result<Option<Site>> {
        Ok(self.store()?.lock().expect("store lock").get_site(id)?)
    }

    /// Register a site owned by this node: assigns the id and stamps
    /// `owner_id`, `added_at`, and `updated_at`.
    pub fn add_site(&self, new: NewSite) -> Result<Site> {
        let inner = self.inner()?;
        let now = Utc::now();
        let site = Site {
            id: SiteId::new().to_string(),
            name: new.name,
            description: new.description,
            url: new.url,
            thumbnail: new.thumbnail,
            owner_id: inner.node_id.to_hex(),
            content_hash: new.content_hash,
            file_count: new.file_count,
            file_size: new.file_size,
            added_at: now,
            updated_at: now,
        };
        inner.store.lock().expect("store lock").insert_site(&site)?;
        Ok(site)
    }

    /// Patch a row's mutable fields. Unknown ids return `None` without error.
    pub fn update_site(&self, id: &str, patch: SitePatch) -> Result<Option<Site>> {
        let store = self.store()?;
        let store = store.lock().expect("store lock");
        if !store.update_site(id, &patch, Utc::now())? {
            return Ok(None);
        }
        Ok(store.get_site(id)?)
    }

    /// Tombstone a row. Idempotent.
    pub fn remove_site(&self, id: &str) -> Result<()> {
        self.store()?.lock().expect("store lock").delete_site_row(id)?;
        Ok(())
    }

    /// Refresh the owner-side file statistics after ingestion or deletion.
    pub fn update_file_stats(&self, id: &str, file_count: i64, file_size: i64) -> Result<bool> {
        Ok(self
            .store()?
            .lock()
            .expect("store lock")
            .set_file_stats(id, file_count, file_size, Utc::now())?)
    }

    /// Find a site this node owns with the given upload fingerprint.
    pub fn find_mine_by_hash(&self, hash: &str) -> Result<Option<Site>> {
        let inner = self.inner()?;
        Ok(inner
            .store
            .lock()
            .expect("store lock")
            .find_site_by_hash(&inner.node_id.to_hex(), hash)?)
    }

    /// Copy a foreign row's metadata into a new row owned by this node.
    ///
    /// Blobs are not copied here; callers move them afterwards with
    /// [`ScrapYard::copy_site_files`].
    pub fn adopt(&self, original_id: &str) -> Result<AdoptOutcome> {
        let inner = self.inner()?;
        let store = inner.store.lock().expect("store lock");
        let original = store.get_site(original_id)?.ok_or(EngineError::NotFound)?;

        let now = Utc::now();
        let adopted = Site {
            id: SiteId::new().to_string(),
            name: original.name,
            description: original.description,
            url: original.url,
            thumbnail: original.thumbnail,
            owner_id: inner.node_id.to_hex(),
            content_hash: original.content_hash,
            file_count: original.file_count,
            file_size: original.file_size,
            added_at: now,
            updated_at: now,
        };
        store.insert_site(&adopted)?;

        Ok(AdoptOutcome {
            new_id: adopted.id,
            original_id: original_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EngineConfig;

    async fn engine() -> (ScrapYard, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let yard = ScrapYard::new(config);
        yard.init().await.unwrap();
        (yard, dir)
    }

    #[tokio::test]
    async fn api_requires_init() {
        let yard = ScrapYard::new(EngineConfig::default());
        assert!(matches!(
            yard.all_sites(),
            Err(EngineError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn connect_requires_configuration() {
        let (yard, _dir) = engine().await;
        assert!(matches!(
            yard.connect().await,
            Err(EngineError::ConfigurationMissing("signaling_url"))
        ));
    }

    #[tokio::test]
    async fn add_stamps_identity_and_ownership() {
        let (yard, _dir) = engine().await;
        let site = yard
            .add_site(NewSite {
                name: "Alpha".into(),
                description: "α".into(),
                ..Default::default()
            })
            .unwrap();

        assert!(!site.id.is_empty());
        assert_eq!(site.owner_id, yard.node_id().unwrap());

        let fetched = yard.get_site(&site.id).unwrap().unwrap();
        assert_eq!(fetched.name, "Alpha");
        assert_eq!(yard.my_sites().unwrap().len(), 1);
        // Nothing foreign in the catalog yet.
        assert!(yard.available_sites().unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_returns_null_for_unknown_id() {
        let (yard, _dir) = engine().await;
        let patch = SitePatch {
            name: Some("renamed".into()),
            ..Default::default()
        };
        assert!(yard.update_site("no-such-id", patch.clone()).unwrap().is_none());

        let site = yard.add_site(NewSite::default()).unwrap();
        let updated = yard.update_site(&site.id, patch).unwrap().unwrap();
        assert_eq!(updated.name, "renamed");
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let (yard, _dir) = engine().await;
        let site = yard.add_site(NewSite::default()).unwrap();

        yard.remove_site(&site.id).unwrap();
        yard.remove_site(&site.id).unwrap();
        assert!(yard.get_site(&site.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn file_stats_and_hash_lookup() {
        let (yard, _dir) = engine().await;
        let site = yard
            .add_site(NewSite {
                content_hash: Some("abc123".into()),
                ..Default::default()
            })
            .unwrap();

        assert!(yard.update_file_stats(&site.id, 3, 130_000).unwrap());
        let fetched = yard.get_site(&site.id).unwrap().unwrap();
        assert_eq!(fetched.file_count, 3);
        assert_eq!(fetched.file_size, 130_000);

        assert_eq!(
            yard.find_mine_by_hash("abc123").unwrap().unwrap().id,
            site.id
        );
        assert!(yard.find_mine_by_hash("missing").unwrap().is_none());
    }

    #[tokio::test]
    async fn adopt_copies_metadata_under_new_identity() {
        let (yard, _dir) = engine().await;
        let original = yard
            .add_site(NewSite {
                name: "Original".into(),
                description: "desc".into(),
                url: "https://example.org".into(),
                file_count: 2,
                file_size: 99,
                ..Default::default()
            })
            .unwrap();

        let outcome = yard.adopt(&original.id).unwrap();
        assert_eq!(outcome.original_id, original.id);
        assert_ne!(outcome.new_id, original.id);

        let adopted = yard.get_site(&outcome.new_id).unwrap().unwrap();
        assert_eq!(adopted.name, "Original");
        assert_eq!(adopted.description, "desc");
        assert_eq!(adopted.url, "https://example.org");
        assert_eq!(adopted.file_count, 2);
        assert_eq!(adopted.owner_id, yard.node_id().unwrap());
    }

    #[tokio::test]
    async fn adopt_unknown_id_is_not_found() {
        let (yard, _dir) = engine().await;
        assert!(matches!(
            yard.adopt("missing"),
            Err(EngineError::NotFound)
        ));
    }

    #[tokio::test]
    async fn blob_surface_round_trips() {
        let (yard, _dir) = engine().await;
        yard.put_file("s", "index.html", b"<html/>", "text/html").unwrap();

        assert_eq!(
            yard.get_file("s", "index.html").unwrap().unwrap().bytes,
            b"<html/>"
        );
        assert_eq!(yard.list_files("s").unwrap().len(), 1);
        assert_eq!(yard.site_size("s").unwrap(), 7);

        yard.copy_site_files("s", "t").unwrap();
        assert_eq!(yard.get_file("t", "index.html").unwrap().unwrap().bytes, b"<html/>");
        assert_eq!(yard.total_size().unwrap(), 14);

        yard.delete_site_files("s").unwrap();
        assert!(yard.get_file("s", "index.html").unwrap().is_none());
    }
}
