//! SQLite schema creation and migration.
//!
//! The block index is the spine every other table keys on.

use rusqlite::Connection;

/// Current schema version.
const SCHEMA_VERSION: u32 = 2;

/// Run all migrations to bring the database up to date.
pub fn run_migrations(conn: &Connection) -> Result<(), rusqlite::Error> {
    let current_version = get_schema_version(conn);

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version < 2 {
        migrate_v2(conn)?;
    }

    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

/// Get the current schema version from the database.
fn get_schema_version(conn: &Connection) -> u32 {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .unwrap_or(0)
}

/// Set the schema version in the database.
fn set_schema_version(conn: &Connection, version: u32) -> Result<(), rusqlite::Error> {
    conn.pragma_update(None, "user_version", version)
}

/// Version 1: ledger, block features, memory nodes, slots, checkpoints.
fn migrate_v1(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        -- Hash-chained ledger
        CREATE TABLE IF NOT EXISTS blocks (
            block_index INTEGER PRIMARY KEY,
            hash TEXT NOT NULL UNIQUE,
            prev_hash TEXT NOT NULL,
            content TEXT NOT NULL,
            importance REAL NOT NULL DEFAULT 0.5,
            created_at TEXT NOT NULL,
            slot_id TEXT,
            root TEXT NOT NULL,
            before_hash TEXT,
            depth INTEGER NOT NULL DEFAULT 0,
            placement TEXT,
            metadata TEXT NOT NULL DEFAULT '{}'
        );
        CREATE INDEX IF NOT EXISTS idx_blocks_before ON blocks(before_hash);
        CREATE INDEX IF NOT EXISTS idx_blocks_created ON blocks(created_at);
        CREATE INDEX IF NOT EXISTS idx_blocks_root ON blocks(root);

        CREATE TABLE IF NOT EXISTS block_embeddings (
            block_index INTEGER PRIMARY KEY,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL
        );

        CREATE TABLE IF NOT EXISTS block_keywords (
            block_index INTEGER NOT NULL,
            keyword TEXT NOT NULL,
            PRIMARY KEY (block_index, keyword)
        );
        CREATE INDEX IF NOT EXISTS idx_block_keywords_keyword ON block_keywords(keyword);

        CREATE TABLE IF NOT EXISTS block_tags (
            block_index INTEGER NOT NULL,
            tag TEXT NOT NULL,
            PRIMARY KEY (block_index, tag)
        );
        CREATE INDEX IF NOT EXISTS idx_block_tags_tag ON block_tags(tag);

        -- Association graph vertices, 1:1 with blocks
        CREATE TABLE IF NOT EXISTS memory_nodes (
            node_id TEXT PRIMARY KEY,
            block_index INTEGER NOT NULL UNIQUE,
            created_at TEXT NOT NULL
        );

        -- Verification anchors
        CREATE TABLE IF NOT EXISTS chain_checkpoints (
            block_index INTEGER PRIMARY KEY,
            hash TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS slots (
            slot_id TEXT PRIMARY KEY,
            head_block_id INTEGER,
            topic_vector BLOB,
            pinned INTEGER NOT NULL DEFAULT 0,
            hop_budget INTEGER NOT NULL,
            last_used_at TEXT,
            updated_at TEXT NOT NULL
        );

        -- Migration tracking
        CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL,
            description TEXT
        );

        INSERT OR IGNORE INTO migrations (version, applied_at, description)
        VALUES (1, datetime('now'), 'Ledger, features, nodes, slots, checkpoints');
        ",
    )?;
    Ok(())
}

/// Version 2: association graph and consolidation bookkeeping.
fn migrate_v2(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS associations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_node TEXT NOT NULL,
            target_node TEXT NOT NULL,
            assoc_type TEXT NOT NULL,
            strength REAL NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            activation_count INTEGER NOT NULL DEFAULT 1,
            metadata TEXT NOT NULL DEFAULT '{}',
            UNIQUE (source_node, target_node)
        );
        CREATE INDEX IF NOT EXISTS idx_associations_source ON associations(source_node, strength DESC);
        CREATE INDEX IF NOT EXISTS idx_associations_target ON associations(target_node, strength DESC);

        CREATE TABLE IF NOT EXISTS consolidation_state (
            block_a INTEGER NOT NULL,
            block_b INTEGER NOT NULL,
            cosine_similarity REAL NOT NULL,
            verdict TEXT NOT NULL,
            connection_type TEXT,
            strength REAL NOT NULL,
            justification TEXT NOT NULL,
            compared_at TEXT NOT NULL,
            PRIMARY KEY (block_a, block_b),
            CHECK (block_a < block_b)
        );

        CREATE TABLE IF NOT EXISTS consolidation_queue (
            block_index INTEGER PRIMARY KEY,
            queued_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_queue_status ON consolidation_queue(status, block_index);

        INSERT OR IGNORE INTO migrations (version, applied_at, description)
        VALUES (2, datetime('now'), 'Associations and consolidation bookkeeping');
        ",
    )?;
    Ok(())
}
