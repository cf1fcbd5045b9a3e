//! Consolidation pipeline: discovers associations between blocks.
//!
//! Every append enqueues its block. A worker claims entries oldest first,
//! compares each block with its most similar neighbours, and records every
//! verdict in `consolidation_state` so an unordered pair is classified at
//! most once. Connected pairs become association edges (or reinforce an
//! existing one). Delivery is at-least-once; reprocessing an entry only
//! produces pair-cache hits.
//!
//! A failing entry goes back to `pending` until `max_attempts`, then to
//! `dead_letter`. It never blocks other entries or ingestion.

use crate::association::{AssociationOutcome, AssociationStore};
use crate::block_store::BlockStore;
use crate::clock::Clock;
use crate::db::{lock, parse_timestamp, storage_err, SharedConnection};
use crate::vector::cosine_similarity;
use mnemo_types::classifier::PairClassifier;
use mnemo_types::config::ConsolidationConfig;
use mnemo_types::consolidation::{
    canonical_pair, ConsolidationQueueEntry, ConsolidationReport, ConsolidationState, QueueStats,
    QueueStatus, Verdict,
};
use mnemo_types::association::AssociationType;
use mnemo_types::error::{MnemoError, MnemoResult};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub struct ConsolidationPipeline {
    conn: SharedConnection,
    store: Arc<BlockStore>,
    associations: AssociationStore,
    classifier: Arc<dyn PairClassifier>,
    config: ConsolidationConfig,
    clock: Arc<dyn Clock>,
}

impl ConsolidationPipeline {
    pub fn new(
        conn: SharedConnection,
        store: Arc<BlockStore>,
        associations: AssociationStore,
        classifier: Arc<dyn PairClassifier>,
        config: ConsolidationConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            conn,
            store,
            associations,
            classifier,
            config,
            clock,
        }
    }

    pub fn config(&self) -> &ConsolidationConfig {
        &self.config
    }

    fn now(&self) -> String {
        self.clock.now().to_rfc3339()
    }

    // -----------------------------------------------------------------------
    // Queue
    // -----------------------------------------------------------------------

    /// Queue a block. Returns `false` if it was already queued.
    pub fn enqueue(&self, block_index: u64) -> MnemoResult<bool> {
        let conn = lock(&self.conn)?;
        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM blocks WHERE block_index = ?1)",
                params![block_index as i64],
                |row| row.get(0),
            )
            .map_err(storage_err)?;
        if !exists {
            return Err(MnemoError::NotFound(format!("block {block_index}")));
        }
        let now = self.now();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO consolidation_queue (block_index, queued_at, status, attempts, updated_at)
                 VALUES (?1, ?2, 'pending', 0, ?2)",
                params![block_index as i64, now],
            )
            .map_err(storage_err)?;
        Ok(inserted == 1)
    }

    /// Atomically move the oldest pending entry to `processing`.
    pub fn claim_next(&self) -> MnemoResult<Option<ConsolidationQueueEntry>> {
        let mut conn = lock(&self.conn)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage_err)?;
        let row = tx
            .query_row(
                &format!(
                    "SELECT {QUEUE_COLUMNS} FROM consolidation_queue
                     WHERE status = 'pending' ORDER BY block_index ASC LIMIT 1"
                ),
                [],
                read_queue_row,
            )
            .optional()
            .map_err(storage_err)?;
        let Some(raw) = row else {
            return Ok(None);
        };
        tx.execute(
            "UPDATE consolidation_queue SET status = 'processing', updated_at = ?1
             WHERE block_index = ?2 AND status = 'pending'",
            params![self.clock.now().to_rfc3339(), raw.block_index as i64],
        )
        .map_err(storage_err)?;
        tx.commit().map_err(storage_err)?;
        let mut entry = raw.into_entry()?;
        entry.status = QueueStatus::Processing;
        Ok(Some(entry))
    }

    /// Claim up to `n` entries.
    pub fn claim_batch(&self, n: usize) -> MnemoResult<Vec<ConsolidationQueueEntry>> {
        let mut out = Vec::new();
        while out.len() < n {
            match self.claim_next()? {
                Some(entry) => out.push(entry),
                None => break,
            }
        }
        Ok(out)
    }

    /// Reset entries left in `processing` by an interrupted worker.
    pub fn recover_stale(&self) -> MnemoResult<usize> {
        let conn = lock(&self.conn)?;
        let n = conn
            .execute(
                "UPDATE consolidation_queue SET status = 'pending', updated_at = ?1
                 WHERE status = 'processing'",
                params![self.now()],
            )
            .map_err(storage_err)?;
        if n > 0 {
            info!(entries = n, "Recovered stale consolidation entries");
        }
        Ok(n)
    }

    pub fn entry(&self, block_index: u64) -> MnemoResult<Option<ConsolidationQueueEntry>> {
        let conn = lock(&self.conn)?;
        let raw = conn
            .query_row(
                &format!("SELECT {QUEUE_COLUMNS} FROM consolidation_queue WHERE block_index = ?1"),
                params![block_index as i64],
                read_queue_row,
            )
            .optional()
            .map_err(storage_err)?;
        raw.map(RawQueueEntry::into_entry).transpose()
    }

    /// Entries that exhausted their attempts, oldest first.
    pub fn dead_letters(&self) -> MnemoResult<Vec<ConsolidationQueueEntry>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {QUEUE_COLUMNS} FROM consolidation_queue
                 WHERE status = 'dead_letter' ORDER BY block_index"
            ))
            .map_err(storage_err)?;
        let rows = stmt.query_map([], read_queue_row).map_err(storage_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(storage_err)?.into_entry()?);
        }
        Ok(out)
    }

    /// Give a dead-lettered entry a fresh set of attempts.
    pub fn requeue(&self, block_index: u64) -> MnemoResult<bool> {
        let conn = lock(&self.conn)?;
        let n = conn
            .execute(
                "UPDATE consolidation_queue
                 SET status = 'pending', attempts = 0, last_error = NULL, updated_at = ?1
                 WHERE block_index = ?2 AND status = 'dead_letter'",
                params![self.now(), block_index as i64],
            )
            .map_err(storage_err)?;
        if n > 0 {
            info!(block_index, "Requeued dead-lettered entry");
        }
        Ok(n > 0)
    }

    pub fn queue_stats(&self) -> MnemoResult<QueueStats> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM consolidation_queue GROUP BY status")
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(storage_err)?;
        let mut stats = QueueStats::default();
        for row in rows {
            let (status, n) = row.map_err(storage_err)?;
            let n = n as u64;
            match QueueStatus::parse(&status) {
                Some(QueueStatus::Pending) => stats.pending = n,
                Some(QueueStatus::Processing) => stats.processing = n,
                Some(QueueStatus::Done) => stats.done = n,
                Some(QueueStatus::DeadLetter) => stats.dead_letter = n,
                None => warn!(status = %status, "Unknown queue status"),
            }
        }
        Ok(stats)
    }

    // -----------------------------------------------------------------------
    // Pair state
    // -----------------------------------------------------------------------

    /// Recorded outcome for an unordered pair.
    pub fn state(&self, a: u64, b: u64) -> MnemoResult<Option<ConsolidationState>> {
        let (a, b) = canonical_pair(a, b);
        let conn = lock(&self.conn)?;
        let row = conn
            .query_row(
                "SELECT cosine_similarity, verdict, connection_type, strength, justification, compared_at
                 FROM consolidation_state WHERE block_a = ?1 AND block_b = ?2",
                params![a as i64, b as i64],
                |row| {
                    Ok((
                        row.get::<_, f64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()
            .map_err(storage_err)?;
        let Some((cosine, verdict, kind, strength, justification, compared_at)) = row else {
            return Ok(None);
        };
        Ok(Some(ConsolidationState {
            block_a: a,
            block_b: b,
            cosine_similarity: cosine as f32,
            verdict: Verdict::parse(&verdict)
                .ok_or_else(|| MnemoError::Serialization(format!("unknown verdict {verdict}")))?,
            connection_type: kind.as_deref().map(AssociationType::parse),
            strength: strength as f32,
            justification,
            compared_at: parse_timestamp(&compared_at)?,
        }))
    }

    pub fn state_count(&self) -> MnemoResult<u64> {
        let conn = lock(&self.conn)?;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM consolidation_state", [], |row| row.get(0))
            .map_err(storage_err)?;
        Ok(n as u64)
    }

    fn has_state(&self, a: u64, b: u64) -> MnemoResult<bool> {
        let conn = lock(&self.conn)?;
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM consolidation_state WHERE block_a = ?1 AND block_b = ?2)",
            params![a as i64, b as i64],
            |row| row.get(0),
        )
        .map_err(storage_err)
    }

    // -----------------------------------------------------------------------
    // Processing
    // -----------------------------------------------------------------------

    /// Evaluate one entry against its most similar blocks and mark it done.
    /// Safe to call again for the same entry.
    pub async fn process(&self, entry: &ConsolidationQueueEntry) -> MnemoResult<ConsolidationReport> {
        let index = entry.block_index;
        let block = self
            .store
            .get(index)?
            .ok_or_else(|| MnemoError::NotFound(format!("block {index}")))?;

        // 1. candidates
        let mut candidates: Vec<(u64, f32)> = self
            .store
            .scan()?
            .into_iter()
            .filter(|row| row.index != index)
            .map(|row| (row.index, cosine_similarity(&block.embedding, &row.embedding)))
            .filter(|(_, cos)| *cos >= self.config.min_candidate_similarity)
            .collect();
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then(b.0.cmp(&a.0)));
        candidates.truncate(self.config.candidates);

        let mut report = ConsolidationReport::default();
        for (other, cosine) in candidates {
            let (a, b) = canonical_pair(index, other);
            // 2. each unordered pair is evaluated once
            if self.has_state(a, b)? {
                report.pair_cache_hits += 1;
                continue;
            }
            let Some(other_block) = self.store.get(other)? else {
                continue;
            };
            let (first, second) = if index == a {
                (&block, &other_block)
            } else {
                (&other_block, &block)
            };
            let verdict = self.classifier.classify(first, second, cosine).await?;
            report.pairs_evaluated += 1;
            debug!(
                a,
                b,
                cosine,
                verdict = verdict.verdict.as_str(),
                kind = verdict.connection_type.as_ref().map(|k| k.as_str()).unwrap_or("-"),
                "Classified pair"
            );

            // 3 + 4. state row and edge commit together
            let mut conn = lock(&self.conn)?;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(storage_err)?;
            let inserted = tx
                .execute(
                    "INSERT OR IGNORE INTO consolidation_state
                     (block_a, block_b, cosine_similarity, verdict, connection_type, strength, justification, compared_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        a as i64,
                        b as i64,
                        cosine as f64,
                        verdict.verdict.as_str(),
                        verdict.connection_type.as_ref().map(|k| k.as_str().to_string()),
                        verdict.strength as f64,
                        verdict.justification,
                        self.now(),
                    ],
                )
                .map_err(storage_err)?;
            if inserted == 1 && verdict.verdict == Verdict::Connected {
                let kind = verdict
                    .connection_type
                    .clone()
                    .unwrap_or(AssociationType::Semantic);
                let mut metadata = HashMap::new();
                metadata.insert(
                    "justification".to_string(),
                    serde_json::Value::String(verdict.justification.clone()),
                );
                metadata.insert(
                    "classifier".to_string(),
                    serde_json::Value::String(self.classifier.name().to_string()),
                );
                match self.associations.record_in(
                    &tx,
                    a,
                    b,
                    &kind,
                    verdict.strength,
                    &metadata,
                    self.clock.now(),
                )? {
                    AssociationOutcome::Created(_) => report.associations_created += 1,
                    AssociationOutcome::Reinforced(_) => report.associations_reinforced += 1,
                }
            } else if inserted == 0 {
                report.pair_cache_hits += 1;
            }
            tx.commit().map_err(storage_err)?;
        }

        // 5. done
        {
            let conn = lock(&self.conn)?;
            conn.execute(
                "UPDATE consolidation_queue SET status = 'done', last_error = NULL, updated_at = ?1
                 WHERE block_index = ?2",
                params![self.now(), index as i64],
            )
            .map_err(storage_err)?;
        }
        report.processed = 1;
        Ok(report)
    }

    /// Record a failed attempt. Returns `true` if the entry was dead-lettered.
    pub fn fail(&self, block_index: u64, error: &MnemoError) -> MnemoResult<bool> {
        let conn = lock(&self.conn)?;
        let attempts: i64 = conn
            .query_row(
                "SELECT attempts FROM consolidation_queue WHERE block_index = ?1",
                params![block_index as i64],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?
            .ok_or_else(|| MnemoError::NotFound(format!("queue entry {block_index}")))?;
        let attempts = attempts as u32 + 1;
        let dead = attempts >= self.config.max_attempts;
        let status = if dead {
            QueueStatus::DeadLetter
        } else {
            QueueStatus::Pending
        };
        conn.execute(
            "UPDATE consolidation_queue SET status = ?1, attempts = ?2, last_error = ?3, updated_at = ?4
             WHERE block_index = ?5",
            params![
                status.as_str(),
                attempts,
                error.to_string(),
                self.now(),
                block_index as i64
            ],
        )
        .map_err(storage_err)?;
        if dead {
            warn!(block_index, attempts, error = %error, "Consolidation entry dead-lettered");
        } else {
            debug!(block_index, attempts, error = %error, "Consolidation entry will be retried");
        }
        Ok(dead)
    }

    /// Drain up to `batch` pending entries.
    pub async fn run_once(&self, batch: usize) -> MnemoResult<ConsolidationReport> {
        let started = Instant::now();
        let mut report = ConsolidationReport::default();
        for _ in 0..batch {
            let Some(entry) = self.claim_next()? else {
                break;
            };
            match self.process(&entry).await {
                Ok(step) => report.absorb(&step),
                Err(e) => {
                    report.failed += 1;
                    if self.fail(entry.block_index, &e)? {
                        report.dead_lettered += 1;
                    }
                }
            }
        }
        report.duration_ms = started.elapsed().as_millis() as u64;
        if report.processed > 0 || report.failed > 0 {
            info!(
                processed = report.processed,
                failed = report.failed,
                pairs = report.pairs_evaluated,
                created = report.associations_created,
                "Consolidation batch finished"
            );
        }
        Ok(report)
    }
}

const QUEUE_COLUMNS: &str = "block_index, queued_at, status, attempts, last_error";

struct RawQueueEntry {
    block_index: u64,
    queued_at: String,
    status: String,
    attempts: i64,
    last_error: Option<String>,
}

impl RawQueueEntry {
    fn into_entry(self) -> MnemoResult<ConsolidationQueueEntry> {
        Ok(ConsolidationQueueEntry {
            block_index: self.block_index,
            queued_at: parse_timestamp(&self.queued_at)?,
            status: QueueStatus::parse(&self.status).ok_or_else(|| {
                MnemoError::Serialization(format!("unknown queue status {}", self.status))
            })?,
            attempts: self.attempts.max(0) as u32,
            last_error: self.last_error,
        })
    }
}

fn read_queue_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawQueueEntry> {
    Ok(RawQueueEntry {
        block_index: row.get::<_, i64>(0)? as u64,
        queued_at: row.get(1)?,
        status: row.get(2)?,
        attempts: row.get(3)?,
        last_error: row.get(4)?,
    })
}
