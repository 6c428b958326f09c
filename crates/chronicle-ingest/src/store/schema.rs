//! SQL schema for the archive index.
//!
//! Applied on every open; idempotent thanks to `CREATE ... IF NOT
//! EXISTS`. Foreign keys are enforced per connection, with cascading
//! deletes so removing an item or person also removes the edges and
//! memberships that reference it.

/// Full schema DDL for `index.db`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- A data source is a content provider: a photo service, a social
-- network, or an exported archive format.
CREATE TABLE IF NOT EXISTS data_sources (
    id   TEXT PRIMARY KEY,   -- stable snake_case slug
    name TEXT NOT NULL
);

-- An account holds the credentials and progress for one user of a data
-- source. checkpoint is set only while an operation is in progress or
-- suspended.
CREATE TABLE IF NOT EXISTS accounts (
    id             INTEGER PRIMARY KEY,
    data_source_id TEXT NOT NULL,
    user_id        TEXT NOT NULL,
    authorization  BLOB,
    checkpoint     BLOB,
    last_item_id   INTEGER, -- row ID of the item with the highest timestamp stored by the last clean run
    FOREIGN KEY (data_source_id) REFERENCES data_sources(id) ON DELETE CASCADE,
    FOREIGN KEY (last_item_id) REFERENCES items(id) ON DELETE SET NULL,
    UNIQUE (data_source_id, user_id)
);

CREATE TABLE IF NOT EXISTS persons (
    id   INTEGER PRIMARY KEY,
    name TEXT
);

-- Identities a person takes on across data sources.
CREATE TABLE IF NOT EXISTS person_identities (
    id             INTEGER PRIMARY KEY,
    person_id      INTEGER NOT NULL,
    data_source_id TEXT NOT NULL,
    user_id        TEXT NOT NULL,
    FOREIGN KEY (person_id) REFERENCES persons(id) ON DELETE CASCADE,
    FOREIGN KEY (data_source_id) REFERENCES data_sources(id) ON DELETE CASCADE,
    UNIQUE (person_id, data_source_id, user_id)
);

-- An item is one piece of content from a specific account.
CREATE TABLE IF NOT EXISTS items (
    id          INTEGER PRIMARY KEY,
    account_id  INTEGER NOT NULL,
    original_id TEXT NOT NULL,    -- ID assigned by the data source
    person_id   INTEGER NOT NULL,
    timestamp   INTEGER,          -- when the content originated, not when this row was written
    stored      INTEGER NOT NULL, -- when the row was created or last updated from the source
    modified    INTEGER,          -- when the item was modified locally; non-null means do not overwrite
    class       INTEGER,
    mime_type   TEXT,
    data_text   TEXT COLLATE NOCASE,
    data_file   TEXT,             -- repo-relative path of the content file, if any
    data_hash   TEXT,             -- base64 SHA-256 of the content file
    metadata    BLOB,
    latitude    REAL,
    longitude   REAL,
    FOREIGN KEY (account_id) REFERENCES accounts(id) ON DELETE CASCADE,
    FOREIGN KEY (person_id) REFERENCES persons(id) ON DELETE CASCADE,
    UNIQUE (original_id, account_id)
);

CREATE INDEX IF NOT EXISTS idx_items_timestamp ON items(timestamp);
CREATE INDEX IF NOT EXISTS idx_items_data_text ON items(data_text);
CREATE INDEX IF NOT EXISTS idx_items_data_file ON items(data_file);
CREATE INDEX IF NOT EXISTS idx_items_data_hash ON items(data_hash);

-- Labeled edges between items and/or persons.
CREATE TABLE IF NOT EXISTS relationships (
    id             INTEGER PRIMARY KEY,
    from_person_id INTEGER,
    from_item_id   INTEGER,
    to_person_id   INTEGER,
    to_item_id     INTEGER,
    directed       BOOLEAN, -- false means the edge goes both ways
    label          TEXT NOT NULL,
    FOREIGN KEY (from_item_id) REFERENCES items(id) ON DELETE CASCADE,
    FOREIGN KEY (to_item_id) REFERENCES items(id) ON DELETE CASCADE,
    FOREIGN KEY (from_person_id) REFERENCES persons(id) ON DELETE CASCADE,
    FOREIGN KEY (to_person_id) REFERENCES persons(id) ON DELETE CASCADE,
    UNIQUE (from_item_id, to_item_id, label),
    UNIQUE (from_person_id, to_person_id, label),
    UNIQUE (from_item_id, to_person_id, label),
    UNIQUE (from_person_id, to_item_id, label)
);

CREATE TABLE IF NOT EXISTS collections (
    id          INTEGER PRIMARY KEY,
    account_id  INTEGER NOT NULL,
    original_id TEXT,
    name        TEXT,
    description TEXT,
    modified    INTEGER, -- when the collection was modified locally; non-null means do not overwrite
    FOREIGN KEY (account_id) REFERENCES accounts(id) ON DELETE CASCADE,
    UNIQUE (account_id, original_id)
);

CREATE TABLE IF NOT EXISTS collection_items (
    id            INTEGER PRIMARY KEY,
    item_id       INTEGER NOT NULL,
    collection_id INTEGER NOT NULL,
    position      INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (item_id) REFERENCES items(id) ON DELETE CASCADE,
    FOREIGN KEY (collection_id) REFERENCES collections(id) ON DELETE CASCADE,
    UNIQUE (item_id, collection_id, position)
);
";
