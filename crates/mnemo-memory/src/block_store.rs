//! Append-only, hash-chained block ledger.
//!
//! Each block commits to its predecessor: `hash = SHA-256(index ‖ timestamp ‖
//! content ‖ prev_hash)`, with the genesis predecessor being 64 zeros. Blocks
//! are written once and never updated. Branch structure (`before`/`after`)
//! is independent of the global chain and lives in the `before_hash` column;
//! child lists are derived on read.
//!
//! Appends are serialized by a single lock that covers index allocation, the
//! chain extension, and the slot head move, so index order is globally total.

use crate::clock::Clock;
use crate::db::{lock, parse_timestamp, placeholders, storage_err, SharedConnection, IN_CHUNK};
use crate::retry::{RetryOutcome, RetryPolicy};
use crate::slot_router::SlotRouter;
use crate::vector::{embedding_from_bytes, embedding_to_bytes};
use chrono::{DateTime, Utc};
use mnemo_types::block::{
    ledger_timestamp, truncate_to_ledger_precision, AppendRequest, Block, BlockRecord,
    ChainVerification, GENESIS_HASH,
};
use mnemo_types::error::{MnemoError, MnemoResult};
use mnemo_types::slot::{Placement, SlotDecision, SlotId};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::ops::Range;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, error, info};

/// Compute a block hash from its committed fields.
pub fn compute_block_hash(index: u64, timestamp: &str, content: &str, prev_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(index.to_string().as_bytes());
    hasher.update(timestamp.as_bytes());
    hasher.update(content.as_bytes());
    hasher.update(prev_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// A lightweight row used by similarity scans.
#[derive(Debug, Clone)]
pub struct ScanRow {
    pub index: u64,
    pub content: String,
    pub keywords: Vec<String>,
    pub embedding: Vec<f32>,
}

/// A verification anchor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub block_index: u64,
    pub hash: String,
}

/// The ledger.
pub struct BlockStore {
    conn: SharedConnection,
    router: Arc<SlotRouter>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    checkpoint_interval: u64,
    append_lock: Mutex<()>,
    appended: Arc<Notify>,
}

/// What the append transaction needs once routing is settled.
struct PendingBlock<'a> {
    request: &'a AppendRequest,
    decision: SlotDecision,
    parent: Option<Block>,
    root: String,
}

impl BlockStore {
    pub fn new(
        conn: SharedConnection,
        router: Arc<SlotRouter>,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
        checkpoint_interval: u64,
    ) -> Self {
        Self {
            conn,
            router,
            retry,
            clock,
            checkpoint_interval: checkpoint_interval.max(1),
            append_lock: Mutex::new(()),
            appended: Arc::new(Notify::new()),
        }
    }

    /// Signalled once per committed append.
    pub fn append_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.appended)
    }

    /// Append a block.
    ///
    /// Routes the write to a slot (or uses `request.slot`), links it under its
    /// branch parent, extends the hash chain, enqueues it for consolidation,
    /// and moves the slot head, all under the append lock. Fails with
    /// `Integrity` if `expected_prev_hash` is set and does not match the tail,
    /// and with `WriteConflict` once storage contention outlasts the retries.
    pub fn append(&self, request: AppendRequest) -> MnemoResult<BlockRecord> {
        validate_request(&request)?;
        let _guard = self
            .append_lock
            .lock()
            .map_err(|e| MnemoError::Internal(e.to_string()))?;

        let decision = match request.slot {
            Some(slot) => self.router.decide_for(slot)?,
            None => self.router.select_slot(&request.embedding),
        };

        let parent = match &request.before {
            Some(hash) => Some(
                self.get_by_hash(hash)?
                    .ok_or_else(|| MnemoError::NotFound(format!("parent block {hash}")))?,
            ),
            None if decision.placement.extends_head() => {
                match self.router.slot(decision.slot_id).and_then(|s| s.head_block_id) {
                    Some(head) => self.get(head)?,
                    None => None,
                }
            }
            None => None,
        };
        let root = request
            .root
            .clone()
            .or_else(|| parent.as_ref().map(|p| p.root.clone()))
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let pending = PendingBlock {
            request: &request,
            decision,
            parent,
            root,
        };

        let index = match self.retry.run(
            self.clock.as_ref(),
            || self.write_block(&pending),
            MnemoError::is_transient,
        ) {
            RetryOutcome::Success { result, .. } => result,
            RetryOutcome::Exhausted {
                last_error: MnemoError::WriteConflict { reason, .. },
                attempts,
            } => return Err(MnemoError::WriteConflict { attempts, reason }),
            RetryOutcome::Exhausted { last_error, .. } => return Err(last_error),
        };

        if decision.placement == Placement::GlobalReallocation {
            self.router.evict(decision.slot_id);
        }
        self.router
            .move_head(decision.slot_id, index, &request.embedding);
        self.appended.notify_one();

        let block = self
            .get(index)?
            .ok_or_else(|| MnemoError::Internal(format!("block {index} vanished after commit")))?;
        debug!(
            index,
            slot = %decision.slot_id,
            placement = decision.placement.as_str(),
            "Appended block"
        );
        Ok(BlockRecord {
            block,
            placement: decision.placement,
            route_similarity: decision.similarity,
        })
    }

    /// One append attempt, in a single immediate transaction.
    fn write_block(&self, pending: &PendingBlock<'_>) -> MnemoResult<u64> {
        let request = pending.request;
        let mut conn = lock(&self.conn)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage_err)?;

        let tail: Option<(i64, String)> = tx
            .query_row(
                "SELECT block_index, hash FROM blocks ORDER BY block_index DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(storage_err)?;
        let (index, prev_hash) = match tail {
            Some((i, hash)) => (i as u64 + 1, hash),
            None => (0, GENESIS_HASH.to_string()),
        };
        if let Some(expected) = &request.expected_prev_hash {
            if expected != &prev_hash {
                return Err(MnemoError::Integrity(format!(
                    "ledger tail is {prev_hash}, caller expected {expected}"
                )));
            }
        }

        let created_at = truncate_to_ledger_precision(self.clock.now());
        let timestamp = ledger_timestamp(&created_at);
        let hash = compute_block_hash(index, &timestamp, &request.content, &prev_hash);
        let depth = pending.parent.as_ref().map(|p| p.depth + 1).unwrap_or(0);
        let before = pending.parent.as_ref().map(|p| p.hash.clone());
        let metadata = serde_json::to_string(&request.metadata)
            .map_err(|e| MnemoError::Serialization(e.to_string()))?;
        let idx = index as i64;

        tx.execute(
            "INSERT INTO blocks (block_index, hash, prev_hash, content, importance, created_at, slot_id, root, before_hash, depth, placement, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                idx,
                hash,
                prev_hash,
                request.content,
                request.importance as f64,
                timestamp,
                pending.decision.slot_id.to_string(),
                pending.root,
                before,
                depth,
                pending.decision.placement.as_str(),
                metadata,
            ],
        )
        .map_err(storage_err)?;
        tx.execute(
            "INSERT INTO block_embeddings (block_index, dims, embedding) VALUES (?1, ?2, ?3)",
            params![
                idx,
                request.embedding.len() as i64,
                embedding_to_bytes(&request.embedding)
            ],
        )
        .map_err(storage_err)?;
        for keyword in &request.keywords {
            tx.execute(
                "INSERT OR IGNORE INTO block_keywords (block_index, keyword) VALUES (?1, ?2)",
                params![idx, keyword.to_lowercase()],
            )
            .map_err(storage_err)?;
        }
        for tag in &request.tags {
            tx.execute(
                "INSERT OR IGNORE INTO block_tags (block_index, tag) VALUES (?1, ?2)",
                params![idx, tag.to_lowercase()],
            )
            .map_err(storage_err)?;
        }
        tx.execute(
            "INSERT INTO memory_nodes (node_id, block_index, created_at) VALUES (?1, ?2, ?3)",
            params![uuid::Uuid::new_v4().to_string(), idx, timestamp],
        )
        .map_err(storage_err)?;
        tx.execute(
            "INSERT OR IGNORE INTO consolidation_queue (block_index, queued_at, status, attempts, updated_at)
             VALUES (?1, ?2, 'pending', 0, ?2)",
            params![idx, timestamp],
        )
        .map_err(storage_err)?;
        if (index + 1) % self.checkpoint_interval == 0 {
            tx.execute(
                "INSERT OR REPLACE INTO chain_checkpoints (block_index, hash, created_at) VALUES (?1, ?2, ?3)",
                params![idx, hash, timestamp],
            )
            .map_err(storage_err)?;
            debug!(index, "Wrote chain checkpoint");
        }
        tx.commit().map_err(storage_err)?;
        Ok(index)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Block at `index`.
    pub fn get(&self, index: u64) -> MnemoResult<Option<Block>> {
        let conn = lock(&self.conn)?;
        let raw = conn
            .query_row(
                &format!("SELECT {BLOCK_COLUMNS} FROM blocks WHERE block_index = ?1"),
                params![index as i64],
                read_block_row,
            )
            .optional()
            .map_err(storage_err)?;
        match raw {
            Some(raw) => Ok(hydrate(&conn, vec![raw])?.pop()),
            None => Ok(None),
        }
    }

    /// Blocks for the given indices in ascending index order; unknown indices are skipped.
    pub fn get_many(&self, indices: &[u64]) -> MnemoResult<Vec<Block>> {
        let conn = lock(&self.conn)?;
        let mut raws = Vec::with_capacity(indices.len());
        for chunk in indices.chunks(IN_CHUNK) {
            let sql = format!(
                "SELECT {BLOCK_COLUMNS} FROM blocks WHERE block_index IN ({})",
                placeholders(chunk.len())
            );
            let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
            let rows = stmt
                .query_map(
                    rusqlite::params_from_iter(chunk.iter().map(|i| *i as i64)),
                    read_block_row,
                )
                .map_err(storage_err)?;
            for row in rows {
                raws.push(row.map_err(storage_err)?);
            }
        }
        raws.sort_by_key(|r| r.index);
        raws.dedup_by_key(|r| r.index);
        hydrate(&conn, raws)
    }

    /// Block whose hash is `hash`.
    pub fn get_by_hash(&self, hash: &str) -> MnemoResult<Option<Block>> {
        let index: Option<i64> = {
            let conn = lock(&self.conn)?;
            conn.query_row(
                "SELECT block_index FROM blocks WHERE hash = ?1",
                params![hash],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?
        };
        match index {
            Some(i) => self.get(i as u64),
            None => Ok(None),
        }
    }

    /// Direct branch children of the block with `hash`, oldest first.
    pub fn children(&self, hash: &str) -> MnemoResult<Vec<Block>> {
        let indices = self.query_indices(
            "SELECT block_index FROM blocks WHERE before_hash = ?1 ORDER BY block_index",
            params![hash],
        )?;
        self.get_many(&indices)
    }

    /// Parent and child indices of a block: its branch neighbourhood.
    pub fn branch_neighbors(&self, index: u64) -> MnemoResult<Vec<u64>> {
        self.query_indices(
            "SELECT p.block_index FROM blocks b JOIN blocks p ON p.hash = b.before_hash
             WHERE b.block_index = ?1
             UNION ALL
             SELECT c.block_index FROM blocks b JOIN blocks c ON c.before_hash = b.hash
             WHERE b.block_index = ?1",
            params![index as i64],
        )
    }

    /// The newest block.
    pub fn tail(&self) -> MnemoResult<Option<Block>> {
        Ok(self.get_recent(1)?.pop())
    }

    /// Number of blocks.
    pub fn len(&self) -> MnemoResult<u64> {
        let conn = lock(&self.conn)?;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM blocks", [], |row| row.get(0))
            .map_err(storage_err)?;
        Ok(n as u64)
    }

    pub fn is_empty(&self) -> MnemoResult<bool> {
        Ok(self.len()? == 0)
    }

    /// The `limit` newest blocks, newest first.
    pub fn get_recent(&self, limit: usize) -> MnemoResult<Vec<Block>> {
        let indices = self.query_indices(
            "SELECT block_index FROM blocks ORDER BY block_index DESC LIMIT ?1",
            params![limit as i64],
        )?;
        let mut blocks = self.get_many(&indices)?;
        blocks.reverse();
        Ok(blocks)
    }

    /// Blocks created in `[from, to)`, oldest first.
    pub fn get_by_date_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> MnemoResult<Vec<Block>> {
        let indices = self.query_indices(
            "SELECT block_index FROM blocks WHERE created_at >= ?1 AND created_at < ?2 ORDER BY block_index",
            params![ledger_timestamp(&from), ledger_timestamp(&to)],
        )?;
        self.get_many(&indices)
    }

    /// Index, content, keywords and embedding of every block.
    pub fn scan(&self) -> MnemoResult<Vec<ScanRow>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn
            .prepare(
                "SELECT b.block_index, b.content, e.embedding,
                        (SELECT group_concat(keyword, char(31)) FROM block_keywords k WHERE k.block_index = b.block_index)
                 FROM blocks b JOIN block_embeddings e ON e.block_index = b.block_index
                 ORDER BY b.block_index",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([], |row| {
                let keywords: Option<String> = row.get(3)?;
                Ok(ScanRow {
                    index: row.get::<_, i64>(0)? as u64,
                    content: row.get(1)?,
                    embedding: embedding_from_bytes(&row.get::<_, Vec<u8>>(2)?),
                    keywords: keywords
                        .map(|k| k.split('\u{1f}').map(str::to_string).collect())
                        .unwrap_or_default(),
                })
            })
            .map_err(storage_err)?;
        let scanned = rows.collect::<Result<Vec<_>, _>>().map_err(storage_err);
        scanned
    }

    fn query_indices<P: rusqlite::Params>(&self, sql: &str, params: P) -> MnemoResult<Vec<u64>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(sql).map_err(storage_err)?;
        let rows = stmt
            .query_map(params, |row| row.get::<_, i64>(0))
            .map_err(storage_err)?;
        let indices = rows
            .map(|r| r.map(|i| i as u64).map_err(storage_err))
            .collect::<MnemoResult<Vec<u64>>>();
        indices
    }

    // -----------------------------------------------------------------------
    // Verification
    // -----------------------------------------------------------------------

    /// Recompute hashes over `range` (the whole ledger when `None`) and check
    /// every prev-link. Stops at the first corrupt block.
    pub fn verify_chain(&self, range: Option<Range<u64>>) -> MnemoResult<ChainVerification> {
        let range = range.unwrap_or(0..u64::MAX);
        let conn = lock(&self.conn)?;
        let result = verify_range(&conn, range)?;
        if let Some(index) = result.first_corrupt_index {
            error!(
                index,
                reason = result.reason.as_deref().unwrap_or(""),
                "Hash chain verification failed"
            );
        }
        Ok(result)
    }

    /// Most recent verification anchor.
    pub fn latest_checkpoint(&self) -> MnemoResult<Option<Checkpoint>> {
        let conn = lock(&self.conn)?;
        latest_checkpoint_in(&conn)
    }

    /// Check the latest anchor, then walk from the anchor block to the tail.
    pub fn verify_from_checkpoint(&self) -> MnemoResult<ChainVerification> {
        let conn = lock(&self.conn)?;
        let Some(anchor) = latest_checkpoint_in(&conn)? else {
            drop(conn);
            return self.verify_chain(None);
        };
        let stored: Option<String> = conn
            .query_row(
                "SELECT hash FROM blocks WHERE block_index = ?1",
                params![anchor.block_index as i64],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?;
        if stored.as_deref() != Some(anchor.hash.as_str()) {
            error!(index = anchor.block_index, "Checkpoint anchor does not match ledger");
            return Ok(ChainVerification::corrupt(
                anchor.block_index,
                0,
                "checkpoint anchor mismatch",
            ));
        }
        let result = verify_range(&conn, anchor.block_index..u64::MAX)?;
        if let Some(index) = result.first_corrupt_index {
            error!(index, "Hash chain verification failed after checkpoint");
        } else {
            info!(
                anchor = anchor.block_index,
                checked = result.checked,
                "Verified ledger from checkpoint"
            );
        }
        Ok(result)
    }
}

fn validate_request(request: &AppendRequest) -> MnemoResult<()> {
    if request.embedding.is_empty() {
        return Err(MnemoError::InvalidInput("embedding must not be empty".into()));
    }
    if request.embedding.iter().any(|v| !v.is_finite()) {
        return Err(MnemoError::InvalidInput("embedding contains non-finite values".into()));
    }
    if !(0.0..=1.0).contains(&request.importance) {
        return Err(MnemoError::InvalidInput(format!(
            "importance must be within 0..=1, got {}",
            request.importance
        )));
    }
    Ok(())
}

fn latest_checkpoint_in(conn: &Connection) -> MnemoResult<Option<Checkpoint>> {
    conn.query_row(
        "SELECT block_index, hash FROM chain_checkpoints ORDER BY block_index DESC LIMIT 1",
        [],
        |row| {
            Ok(Checkpoint {
                block_index: row.get::<_, i64>(0)? as u64,
                hash: row.get(1)?,
            })
        },
    )
    .optional()
    .map_err(storage_err)
}

fn verify_range(conn: &Connection, range: Range<u64>) -> MnemoResult<ChainVerification> {
    if range.start >= range.end {
        return Ok(ChainVerification::ok(0));
    }
    let mut expected_prev = if range.start == 0 {
        GENESIS_HASH.to_string()
    } else {
        let prev: Option<String> = conn
            .query_row(
                "SELECT hash FROM blocks WHERE block_index = ?1",
                params![(range.start - 1) as i64],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?;
        match prev {
            Some(hash) => hash,
            None => {
                let any_from_start: bool = conn
                    .query_row(
                        "SELECT EXISTS(SELECT 1 FROM blocks WHERE block_index >= ?1)",
                        params![range.start as i64],
                        |row| row.get(0),
                    )
                    .map_err(storage_err)?;
                if !any_from_start {
                    return Ok(ChainVerification::ok(0));
                }
                return Ok(ChainVerification::corrupt(
                    range.start,
                    0,
                    format!("predecessor {} missing", range.start - 1),
                ));
            }
        }
    };

    let end = range.end.min(i64::MAX as u64) as i64;
    let mut stmt = conn
        .prepare(
            "SELECT block_index, hash, prev_hash, content, created_at FROM blocks
             WHERE block_index >= ?1 AND block_index < ?2 ORDER BY block_index",
        )
        .map_err(storage_err)?;
    let mut rows = stmt
        .query(params![range.start as i64, end])
        .map_err(storage_err)?;

    let mut expected_index = range.start;
    let mut checked = 0u64;
    while let Some(row) = rows.next().map_err(storage_err)? {
        let index = row.get::<_, i64>(0).map_err(storage_err)? as u64;
        let hash: String = row.get(1).map_err(storage_err)?;
        let prev_hash: String = row.get(2).map_err(storage_err)?;
        let content: String = row.get(3).map_err(storage_err)?;
        let created_at: String = row.get(4).map_err(storage_err)?;

        if index != expected_index {
            return Ok(ChainVerification::corrupt(
                expected_index,
                checked,
                format!("block {expected_index} missing"),
            ));
        }
        if prev_hash != expected_prev {
            return Ok(ChainVerification::corrupt(index, checked, "prev_hash link broken"));
        }
        if compute_block_hash(index, &created_at, &content, &prev_hash) != hash {
            return Ok(ChainVerification::corrupt(index, checked, "hash mismatch"));
        }
        checked += 1;
        expected_index += 1;
        expected_prev = hash;
    }
    Ok(ChainVerification::ok(checked))
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const BLOCK_COLUMNS: &str = "block_index, hash, prev_hash, content, importance, created_at, \
                             slot_id, root, before_hash, depth, metadata";

struct RawBlock {
    index: u64,
    hash: String,
    prev_hash: String,
    content: String,
    importance: f64,
    created_at: String,
    slot_id: Option<String>,
    root: String,
    before: Option<String>,
    depth: i64,
    metadata: String,
}

fn read_block_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawBlock> {
    Ok(RawBlock {
        index: row.get::<_, i64>(0)? as u64,
        hash: row.get(1)?,
        prev_hash: row.get(2)?,
        content: row.get(3)?,
        importance: row.get(4)?,
        created_at: row.get(5)?,
        slot_id: row.get(6)?,
        root: row.get(7)?,
        before: row.get(8)?,
        depth: row.get(9)?,
        metadata: row.get(10)?,
    })
}

/// Attach embeddings, keywords, tags and child hashes to raw rows, batched.
fn hydrate(conn: &Connection, raws: Vec<RawBlock>) -> MnemoResult<Vec<Block>> {
    if raws.is_empty() {
        return Ok(Vec::new());
    }
    let mut embeddings: HashMap<u64, Vec<f32>> = HashMap::new();
    let mut keywords: HashMap<u64, BTreeSet<String>> = HashMap::new();
    let mut tags: HashMap<u64, BTreeSet<String>> = HashMap::new();
    let mut children: HashMap<String, Vec<String>> = HashMap::new();

    let indices: Vec<i64> = raws.iter().map(|r| r.index as i64).collect();
    for chunk in indices.chunks(IN_CHUNK) {
        let ph = placeholders(chunk.len());

        let mut stmt = conn
            .prepare(&format!(
                "SELECT block_index, embedding FROM block_embeddings WHERE block_index IN ({ph})"
            ))
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(chunk), |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
            })
            .map_err(storage_err)?;
        for row in rows {
            let (i, bytes) = row.map_err(storage_err)?;
            embeddings.insert(i as u64, embedding_from_bytes(&bytes));
        }

        for (table, column, target) in [
            ("block_keywords", "keyword", &mut keywords),
            ("block_tags", "tag", &mut tags),
        ] {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT block_index, {column} FROM {table} WHERE block_index IN ({ph})"
                ))
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(chunk), |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(storage_err)?;
            for row in rows {
                let (i, value) = row.map_err(storage_err)?;
                target.entry(i as u64).or_default().insert(value);
            }
        }
    }

    let hashes: Vec<&str> = raws.iter().map(|r| r.hash.as_str()).collect();
    for chunk in hashes.chunks(IN_CHUNK) {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT before_hash, hash FROM blocks WHERE before_hash IN ({}) ORDER BY block_index",
                placeholders(chunk.len())
            ))
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(chunk), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(storage_err)?;
        for row in rows {
            let (parent, child) = row.map_err(storage_err)?;
            children.entry(parent).or_default().push(child);
        }
    }

    raws.into_iter()
        .map(|raw| {
            let slot_id = match raw.slot_id.as_deref() {
                Some(s) => Some(s.parse::<SlotId>().map_err(MnemoError::Serialization)?),
                None => None,
            };
            Ok(Block {
                index: raw.index,
                keywords: keywords.remove(&raw.index).unwrap_or_default(),
                tags: tags.remove(&raw.index).unwrap_or_default(),
                embedding: embeddings.remove(&raw.index).unwrap_or_default(),
                importance: raw.importance as f32,
                created_at: parse_timestamp(&raw.created_at)?,
                after: children.remove(&raw.hash).unwrap_or_default(),
                hash: raw.hash,
                prev_hash: raw.prev_hash,
                content: raw.content,
                slot_id,
                root: raw.root,
                before: raw.before,
                depth: raw.depth.max(0) as u32,
                metadata: serde_json::from_str(&raw.metadata).unwrap_or_default(),
            })
        })
        .collect()
}
