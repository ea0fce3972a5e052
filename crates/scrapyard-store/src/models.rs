use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One replicated catalog row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Site {
    pub id: String,
    pub name: String,
    pub description: String,
    pub url: String,
    pub thumbnail: String,
    /// Hex-encoded node id of the creator; immutable after creation.
    pub owner_id: String,
    /// Fingerprint of the original upload, used to deduplicate own uploads.
    pub content_hash: Option<String>,
    pub file_count: i64,
    pub file_size: i64,
    pub added_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update of a site's mutable fields.
#[derive(Debug, Clone, Default)]
pub struct SitePatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub thumbnail: Option<String>,
    pub content_hash: Option<String>,
}

impl SitePatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.url.is_none()
            && self.thumbnail.is_none()
            && self.content_hash.is_none()
    }
}

/// One locally stored blob, keyed by `(site_id, path)`.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFile {
    pub site_id: String,
    /// Forward-slash relative path from the site root, never starting with `/`.
    pub path: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
    pub byte_len: i64,
    pub cached_at: DateTime<Utc>,
}

/// Parse a stored RFC-3339 timestamp, tolerating the empty placeholder a
/// half-merged row carries before its timestamp columns land.
pub(crate) fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
