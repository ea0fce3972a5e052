//! v001 -- Initial schema creation.
//!
//! Creates the replicated `sites` catalog table and the CRDT bookkeeping
//! tables (replica identity, version counters, per-column clocks, per-row
//! causal lengths, tracked-table registry, and the apply guard).

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
///
/// Every value column of `sites` carries a default so that a merge can
/// materialize a row from its primary key alone and fill columns in as their
/// change records land.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Sites (the replicated catalog)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS sites (
    id           TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    name         TEXT NOT NULL DEFAULT '',
    description  TEXT NOT NULL DEFAULT '',
    url          TEXT NOT NULL DEFAULT '',
    thumbnail    TEXT NOT NULL DEFAULT '',
    owner_id     TEXT NOT NULL DEFAULT '',    -- hex-encoded node id of the creator
    content_hash TEXT,
    file_count   INTEGER NOT NULL DEFAULT 0,
    file_size    INTEGER NOT NULL DEFAULT 0,
    added_at     TEXT NOT NULL DEFAULT '',    -- ISO-8601 / RFC-3339
    updated_at   TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_sites_owner ON sites(owner_id);

-- ----------------------------------------------------------------
-- CRDT bookkeeping
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS crdt_node (
    id      INTEGER PRIMARY KEY CHECK (id = 0),
    site_id BLOB NOT NULL                     -- 16 random bytes, stable per replica
);

CREATE TABLE IF NOT EXISTS crdt_version (
    id      INTEGER PRIMARY KEY CHECK (id = 0),
    version INTEGER NOT NULL,                 -- monotone per-replica db version
    seq     INTEGER NOT NULL                  -- monotone write sequence
);

CREATE TABLE IF NOT EXISTS crdt_guard (
    id       INTEGER PRIMARY KEY CHECK (id = 0),
    applying INTEGER NOT NULL                 -- 1 while folding in a remote batch
);

CREATE TABLE IF NOT EXISTS crdt_tracked (
    tbl    TEXT PRIMARY KEY NOT NULL,
    pk_col TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS crdt_row (
    tbl TEXT NOT NULL,
    pk  BLOB NOT NULL,
    cl  INTEGER NOT NULL,                     -- causal length: odd = live, even = deleted
    PRIMARY KEY (tbl, pk)
);

CREATE TABLE IF NOT EXISTS crdt_clock (
    tbl         TEXT NOT NULL,
    pk          BLOB NOT NULL,
    cid         TEXT NOT NULL,                -- column name, or '-1' for a tombstone
    col_version INTEGER NOT NULL,
    db_version  INTEGER NOT NULL,
    site_id     BLOB NOT NULL,                -- originating replica
    cl          INTEGER NOT NULL,
    seq         INTEGER NOT NULL,
    PRIMARY KEY (tbl, pk, cid)
);

CREATE INDEX IF NOT EXISTS idx_crdt_clock_version ON crdt_clock(db_version, seq);

INSERT OR IGNORE INTO crdt_node (id, site_id) VALUES (0, randomblob(16));
INSERT OR IGNORE INTO crdt_version (id, version, seq) VALUES (0, 0, 0);
INSERT OR IGNORE INTO crdt_guard (id, applying) VALUES (0, 0);
"#;

pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
