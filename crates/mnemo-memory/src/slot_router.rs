//! Slot routing.
//!
//! A fixed, small set of slots tracks the concurrently active threads. Each
//! slot has a branch head and an EMA topic vector. Routing a write compares
//! its embedding to every topic and picks a slot and a placement:
//!
//! | best similarity                 | placement             |
//! |---------------------------------|-----------------------|
//! | `>= existing_branch_threshold`  | `existing_branch`     |
//! | `>= divergence_threshold`       | `divergence`          |
//! | lower, and an empty slot exists | `new_context`         |
//! | lower, no empty slot            | `global_reallocation` |
//!
//! Routing is total and never touches storage. Slot state is persisted on
//! every change; when persistence keeps failing the in-memory state stays
//! authoritative and the slot is flagged dirty until [`SlotRouter::reconcile`].

use crate::clock::Clock;
use crate::db::{lock, parse_timestamp, storage_err, SharedConnection};
use crate::retry::{RetryOutcome, RetryPolicy};
use crate::vector::{cosine_similarity, ema_blend, embedding_from_bytes, embedding_to_bytes, normalize};
use mnemo_types::config::RoutingConfig;
use mnemo_types::error::{MnemoError, MnemoResult};
use mnemo_types::slot::{Placement, Slot, SlotDecision, SlotId, SlotProfile};
use rusqlite::{params, OptionalExtension};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

pub struct SlotRouter {
    conn: SharedConnection,
    slots: RwLock<Vec<Slot>>,
    config: RoutingConfig,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl SlotRouter {
    /// Load persisted slots, creating any that are missing.
    pub fn load(
        conn: SharedConnection,
        config: RoutingConfig,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> MnemoResult<Self> {
        let count = config.slot_count.clamp(1, SlotId::MAX_SLOTS);
        let mut slots: Vec<Slot> = (0..count)
            .map(|n| Slot::empty(SlotId::nth(n), config.base_hop_budget))
            .collect();

        {
            let guard = lock(&conn)?;
            let mut stmt = guard
                .prepare(
                    "SELECT slot_id, head_block_id, topic_vector, pinned, hop_budget, last_used_at FROM slots",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, Option<Vec<u8>>>(2)?,
                        row.get::<_, bool>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                })
                .map_err(storage_err)?;
            for row in rows {
                let (id, head, topic, pinned, hop_budget, last_used) = row.map_err(storage_err)?;
                let Ok(id) = id.parse::<SlotId>() else {
                    warn!(slot = %id, "Ignoring unparseable persisted slot");
                    continue;
                };
                let Some(slot) = slots.get_mut(id.0 as usize) else {
                    continue;
                };
                slot.head_block_id = head.map(|h| h as u64);
                slot.topic_vector = topic.map(|b| embedding_from_bytes(&b));
                slot.pinned = pinned;
                slot.hop_budget = hop_budget.max(0) as u32;
                slot.last_used_at = match last_used {
                    Some(s) => Some(parse_timestamp(&s)?),
                    None => None,
                };
            }
        }

        let router = Self {
            conn,
            slots: RwLock::new(slots),
            config,
            retry,
            clock,
        };
        let snapshot = router.snapshot();
        for slot in &snapshot {
            router.persist(slot)?;
        }
        info!(slots = snapshot.len(), "Slot router ready");
        Ok(router)
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Slot>> {
        self.slots.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Slot>> {
        self.slots.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Decide where a write with `embedding` belongs. Pure; never fails.
    pub fn select_slot(&self, embedding: &[f32]) -> SlotDecision {
        let query = normalize(embedding);
        let slots = self.read();
        let recent = slots
            .iter()
            .filter(|s| s.last_used_at.is_some())
            .max_by_key(|s| s.last_used_at)
            .map(|s| s.id);

        // (slot, similarity with bonus, raw similarity, pinned)
        let mut scored: Vec<(SlotId, f32, f32, bool)> = Vec::new();
        for slot in slots.iter().filter(|s| !s.is_empty()) {
            let raw = slot
                .topic_vector
                .as_deref()
                .map(|t| cosine_similarity(&query, t))
                .unwrap_or(0.0);
            let bonus = if Some(slot.id) == recent {
                self.config.hysteresis
            } else {
                0.0
            };
            scored.push((slot.id, raw + bonus, raw, slot.pinned));
        }

        let mut best: Option<(SlotId, f32, f32)> = None;
        for &(id, adjusted, raw, _) in &scored {
            if best.map_or(true, |(_, b, _)| adjusted > b) {
                best = Some((id, adjusted, raw));
            }
        }

        // The bonus only ranks slots; placement bands use the raw score.
        if let Some((id, _, raw)) = best {
            if raw >= self.config.existing_branch_threshold {
                return decision(id, Placement::ExistingBranch, Some(raw));
            }
            if raw >= self.config.divergence_threshold {
                return decision(id, Placement::Divergence, Some(raw));
            }
        }
        let best_raw = best.map(|(_, _, raw)| raw);

        if let Some(empty) = slots.iter().find(|s| s.is_empty()) {
            return decision(empty.id, Placement::NewContext, best_raw);
        }

        let victim = scored
            .iter()
            .filter(|(_, _, _, pinned)| !pinned)
            .fold(None::<(SlotId, f32)>, |acc, &(id, _, raw, _)| match acc {
                Some((_, low)) if raw >= low => acc,
                _ => Some((id, raw)),
            });
        match (victim, best) {
            (Some((id, raw)), _) => decision(id, Placement::GlobalReallocation, Some(raw)),
            // Every slot is pinned: extend the closest one; the head stays frozen.
            (None, Some((id, _, raw))) => decision(id, Placement::Divergence, Some(raw)),
            (None, None) => decision(SlotId::nth(0), Placement::Divergence, None),
        }
    }

    /// Decision for a write that names its slot explicitly.
    pub fn decide_for(&self, id: SlotId) -> MnemoResult<SlotDecision> {
        let slots = self.read();
        let slot = slots
            .get(id.0 as usize)
            .ok_or_else(|| MnemoError::NotFound(format!("slot {id}")))?;
        let placement = if slot.is_empty() {
            Placement::NewContext
        } else {
            Placement::ExistingBranch
        };
        Ok(decision(id, placement, None))
    }

    /// Move a slot's head to a freshly written block. Returns `false` when the
    /// slot is pinned (or unknown) and nothing changed.
    pub fn move_head(&self, id: SlotId, block_index: u64, embedding: &[f32]) -> bool {
        let updated = {
            let mut slots = self.write();
            let Some(slot) = slots.get_mut(id.0 as usize) else {
                return false;
            };
            if slot.pinned {
                debug!(slot = %id, block_index, "Slot pinned, head not moved");
                return false;
            }
            slot.head_block_id = Some(block_index);
            slot.topic_vector = Some(match &slot.topic_vector {
                Some(old) => ema_blend(old, embedding, self.config.ema_keep),
                None => normalize(embedding),
            });
            slot.last_used_at = Some(self.clock.now());
            slot.clone()
        };
        self.persist_or_flag(updated);
        true
    }

    /// Clear a slot for reuse by a new thread.
    pub fn evict(&self, id: SlotId) {
        let updated = {
            let mut slots = self.write();
            let Some(slot) = slots.get_mut(id.0 as usize) else {
                return;
            };
            info!(slot = %id, old_head = ?slot.head_block_id, "Reallocating slot");
            slot.head_block_id = None;
            slot.topic_vector = None;
            slot.hop_budget = self.config.base_hop_budget;
            slot.clone()
        };
        self.persist_or_flag(updated);
    }

    /// Freeze a slot's head at `block_index`.
    pub fn pin(&self, id: SlotId, block_index: u64) -> MnemoResult<()> {
        let embedding: Option<Vec<u8>> = {
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
            conn.query_row(
                "SELECT embedding FROM block_embeddings WHERE block_index = ?1",
                params![block_index as i64],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?
        };
        let updated = {
            let mut slots = self.write();
            let slot = slots
                .get_mut(id.0 as usize)
                .ok_or_else(|| MnemoError::NotFound(format!("slot {id}")))?;
            slot.head_block_id = Some(block_index);
            slot.pinned = true;
            if slot.topic_vector.is_none() {
                slot.topic_vector = embedding.map(|b| normalize(&embedding_from_bytes(&b)));
            }
            slot.clone()
        };
        info!(slot = %id, block_index, "Pinned slot");
        self.persist_or_flag(updated);
        Ok(())
    }

    /// Resume automatic movement.
    pub fn unpin(&self, id: SlotId) -> MnemoResult<()> {
        let updated = {
            let mut slots = self.write();
            let slot = slots
                .get_mut(id.0 as usize)
                .ok_or_else(|| MnemoError::NotFound(format!("slot {id}")))?;
            slot.pinned = false;
            slot.clone()
        };
        info!(slot = %id, "Unpinned slot");
        self.persist_or_flag(updated);
        Ok(())
    }

    /// Search profile: hot slots (used within the hot window) search one hop
    /// deeper and explore more.
    pub fn profile(&self, id: SlotId) -> MnemoResult<SlotProfile> {
        let slots = self.read();
        let slot = slots
            .get(id.0 as usize)
            .ok_or_else(|| MnemoError::NotFound(format!("slot {id}")))?;
        let window = chrono::Duration::seconds(self.config.hot_window_secs as i64);
        let hot = slot
            .last_used_at
            .is_some_and(|at| self.clock.now() - at <= window);
        let (hop_budget, explore_eps) = if hot {
            (
                (slot.hop_budget + 1).min(self.config.max_hop_budget),
                self.config.hot_explore_eps,
            )
        } else {
            (slot.hop_budget, self.config.explore_eps)
        };
        Ok(SlotProfile {
            hop_budget,
            explore_eps,
            pinned: slot.pinned,
            hot,
        })
    }

    pub fn slot(&self, id: SlotId) -> Option<Slot> {
        self.read().get(id.0 as usize).cloned()
    }

    /// Current state of every slot.
    pub fn snapshot(&self) -> Vec<Slot> {
        self.read().clone()
    }

    /// Re-persist slots flagged dirty. Returns how many were written.
    pub fn reconcile(&self) -> MnemoResult<usize> {
        let dirty: Vec<Slot> = self.read().iter().filter(|s| s.dirty).cloned().collect();
        let mut written = 0;
        for slot in dirty {
            match self.persist(&slot) {
                Ok(()) => {
                    let mut slots = self.write();
                    if let Some(current) = slots.get_mut(slot.id.0 as usize) {
                        // A newer in-memory change may have landed meanwhile.
                        if *current == slot {
                            current.dirty = false;
                        }
                    }
                    written += 1;
                }
                Err(e) => warn!(slot = %slot.id, error = %e, "Slot still not persisted"),
            }
        }
        if written > 0 {
            info!(written, "Reconciled dirty slots");
        }
        Ok(written)
    }

    fn persist_or_flag(&self, slot: Slot) {
        let result = self.persist(&slot);
        if let Err(e) = &result {
            warn!(slot = %slot.id, error = %e, "Slot persistence failed, keeping in-memory state");
        }
        let mut slots = self.write();
        if let Some(current) = slots.get_mut(slot.id.0 as usize) {
            current.dirty = result.is_err();
        }
    }

    fn persist(&self, slot: &Slot) -> MnemoResult<()> {
        let outcome = self.retry.run(
            self.clock.as_ref(),
            || self.write_slot(slot),
            MnemoError::is_transient,
        );
        match outcome {
            RetryOutcome::Success { .. } => Ok(()),
            RetryOutcome::Exhausted { last_error, .. } => Err(last_error),
        }
    }

    fn write_slot(&self, slot: &Slot) -> MnemoResult<()> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO slots (slot_id, head_block_id, topic_vector, pinned, hop_budget, last_used_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(slot_id) DO UPDATE SET
                head_block_id = excluded.head_block_id,
                topic_vector = excluded.topic_vector,
                pinned = excluded.pinned,
                hop_budget = excluded.hop_budget,
                last_used_at = excluded.last_used_at,
                updated_at = excluded.updated_at",
            params![
                slot.id.to_string(),
                slot.head_block_id.map(|h| h as i64),
                slot.topic_vector.as_deref().map(embedding_to_bytes),
                slot.pinned,
                slot.hop_budget,
                slot.last_used_at.map(|t| t.to_rfc3339()),
                self.clock.now().to_rfc3339(),
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }
}

fn decision(slot_id: SlotId, placement: Placement, similarity: Option<f32>) -> SlotDecision {
    SlotDecision {
        slot_id,
        placement,
        similarity,
    }
}
