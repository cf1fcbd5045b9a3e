//! Association graph store.
//!
//! Edges connect memory nodes, which map 1:1 onto blocks through the
//! `memory_nodes` table. An unordered pair of blocks has at most one edge;
//! the node of the lower block index is always the source.

use crate::db::{lock, parse_timestamp, placeholders, storage_err, SharedConnection, IN_CHUNK};
use chrono::{DateTime, Utc};
use mnemo_types::association::{AssociatedBlock, Association, AssociationType};
use mnemo_types::error::{MnemoError, MnemoResult};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{HashMap, HashSet};

/// Whether `record` wrote a new edge or strengthened an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationOutcome {
    Created(i64),
    Reinforced(i64),
}

/// Reads and writes association edges.
#[derive(Clone)]
pub struct AssociationStore {
    conn: SharedConnection,
    strength_keep: f32,
}

const ASSOC_COLUMNS: &str = "a.id, a.source_node, a.target_node, a.assoc_type, a.strength, \
                             a.created_at, a.activation_count, a.metadata";

impl AssociationStore {
    /// `strength_keep` is the weight of the old strength when an edge is reinforced.
    pub fn new(conn: SharedConnection, strength_keep: f32) -> Self {
        Self {
            conn,
            strength_keep: strength_keep.clamp(0.0, 1.0),
        }
    }

    /// Memory node of a block, if the block exists.
    pub fn node_for_block(&self, block_index: u64) -> MnemoResult<Option<String>> {
        let conn = lock(&self.conn)?;
        node_for_block_in(&conn, block_index)
    }

    /// Create or reinforce the edge between two blocks.
    pub fn record(
        &self,
        block_a: u64,
        block_b: u64,
        assoc_type: &AssociationType,
        strength: f32,
        metadata: &HashMap<String, serde_json::Value>,
        now: DateTime<Utc>,
    ) -> MnemoResult<AssociationOutcome> {
        let conn = lock(&self.conn)?;
        self.record_in(&conn, block_a, block_b, assoc_type, strength, metadata, now)
    }

    /// [`record`](Self::record) on a connection the caller already holds,
    /// so it can join a surrounding transaction.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn record_in(
        &self,
        conn: &Connection,
        block_a: u64,
        block_b: u64,
        assoc_type: &AssociationType,
        strength: f32,
        metadata: &HashMap<String, serde_json::Value>,
        now: DateTime<Utc>,
    ) -> MnemoResult<AssociationOutcome> {
        if block_a == block_b {
            return Err(MnemoError::InvalidInput(format!(
                "block {block_a} cannot be associated with itself"
            )));
        }
        let (low, high) = if block_a < block_b {
            (block_a, block_b)
        } else {
            (block_b, block_a)
        };
        let source = node_for_block_in(conn, low)?
            .ok_or_else(|| MnemoError::NotFound(format!("memory node for block {low}")))?;
        let target = node_for_block_in(conn, high)?
            .ok_or_else(|| MnemoError::NotFound(format!("memory node for block {high}")))?;
        let strength = strength.clamp(0.0, 1.0) as f64;
        let now = now.to_rfc3339();

        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM associations WHERE source_node = ?1 AND target_node = ?2",
                params![source, target],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?;

        match existing {
            Some(id) => {
                let keep = self.strength_keep as f64;
                conn.execute(
                    "UPDATE associations
                     SET activation_count = activation_count + 1,
                         strength = MIN(1.0, MAX(0.0, ?1 * strength + (1.0 - ?1) * ?2)),
                         updated_at = ?3
                     WHERE id = ?4",
                    params![keep, strength, now, id],
                )
                .map_err(storage_err)?;
                Ok(AssociationOutcome::Reinforced(id))
            }
            None => {
                let meta = serde_json::to_string(metadata)
                    .map_err(|e| MnemoError::Serialization(e.to_string()))?;
                conn.execute(
                    "INSERT INTO associations
                     (source_node, target_node, assoc_type, strength, created_at, updated_at, activation_count, metadata)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5, 1, ?6)",
                    params![source, target, assoc_type.as_str(), strength, now, meta],
                )
                .map_err(storage_err)?;
                Ok(AssociationOutcome::Created(conn.last_insert_rowid()))
            }
        }
    }

    /// Strongest `limit` edges touching one block, as source or target.
    pub fn neighbors(&self, block_index: u64, limit: usize) -> MnemoResult<Vec<AssociatedBlock>> {
        let conn = lock(&self.conn)?;
        let sql = format!(
            "SELECT {ASSOC_COLUMNS}, other.block_index
             FROM memory_nodes me
             JOIN associations a ON a.source_node = me.node_id OR a.target_node = me.node_id
             JOIN memory_nodes other ON other.node_id =
                  CASE WHEN a.source_node = me.node_id THEN a.target_node ELSE a.source_node END
             WHERE me.block_index = ?1
             ORDER BY a.strength DESC, a.id ASC
             LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
        let rows = stmt
            .query_map(params![block_index as i64, limit as i64], |row| {
                Ok((read_association(row)?, row.get::<_, i64>(8)?))
            })
            .map_err(storage_err)?;
        let mut out = Vec::new();
        for row in rows {
            let (raw, neighbor) = row.map_err(storage_err)?;
            out.push(AssociatedBlock {
                from_block: block_index,
                neighbor_block: neighbor as u64,
                association: raw.into_association()?,
            });
        }
        Ok(out)
    }

    /// [`neighbors`](Self::neighbors) for many blocks in three query passes:
    /// blocks to nodes, edges touching those nodes, neighbour nodes to blocks.
    pub fn neighbors_batch(
        &self,
        block_indices: &[u64],
        limit: usize,
    ) -> MnemoResult<HashMap<u64, Vec<AssociatedBlock>>> {
        let mut out: HashMap<u64, Vec<AssociatedBlock>> = HashMap::new();
        if block_indices.is_empty() || limit == 0 {
            return Ok(out);
        }
        let conn = lock(&self.conn)?;

        // (a) block -> node
        let mut node_of: HashMap<u64, String> = HashMap::new();
        let unique: Vec<u64> = block_indices
            .iter()
            .copied()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        for chunk in unique.chunks(IN_CHUNK) {
            let sql = format!(
                "SELECT block_index, node_id FROM memory_nodes WHERE block_index IN ({})",
                placeholders(chunk.len())
            );
            let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
            let rows = stmt
                .query_map(
                    rusqlite::params_from_iter(chunk.iter().map(|i| *i as i64)),
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
                )
                .map_err(storage_err)?;
            for row in rows {
                let (index, node) = row.map_err(storage_err)?;
                node_of.insert(index as u64, node);
            }
        }
        if node_of.is_empty() {
            return Ok(out);
        }

        // (b) every edge touching those nodes
        let nodes: Vec<String> = node_of.values().cloned().collect();
        let mut edges: HashMap<i64, RawAssociation> = HashMap::new();
        for chunk in nodes.chunks(IN_CHUNK) {
            let ph = placeholders(chunk.len());
            let sql = format!(
                "SELECT {ASSOC_COLUMNS} FROM associations a
                 WHERE a.source_node IN ({ph}) OR a.target_node IN ({ph})"
            );
            let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(chunk.iter()), read_association)
                .map_err(storage_err)?;
            for row in rows {
                let raw = row.map_err(storage_err)?;
                edges.insert(raw.id, raw);
            }
        }

        // (c) neighbour node -> block
        let mut other_nodes: HashSet<&str> = HashSet::new();
        for edge in edges.values() {
            other_nodes.insert(edge.source_node.as_str());
            other_nodes.insert(edge.target_node.as_str());
        }
        let other_nodes: Vec<&str> = other_nodes.into_iter().collect();
        let mut block_of: HashMap<String, u64> = HashMap::new();
        for chunk in other_nodes.chunks(IN_CHUNK) {
            let sql = format!(
                "SELECT node_id, block_index FROM memory_nodes WHERE node_id IN ({})",
                placeholders(chunk.len())
            );
            let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(chunk.iter()), |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(storage_err)?;
            for row in rows {
                let (node, index) = row.map_err(storage_err)?;
                block_of.insert(node, index as u64);
            }
        }
        drop(conn);

        let mut edges: Vec<RawAssociation> = edges.into_values().collect();
        edges.sort_by(|a, b| b.strength.total_cmp(&a.strength).then(a.id.cmp(&b.id)));

        for (&block, node) in &node_of {
            let mut picked = Vec::new();
            for edge in &edges {
                if picked.len() >= limit {
                    break;
                }
                let other = if &edge.source_node == node {
                    &edge.target_node
                } else if &edge.target_node == node {
                    &edge.source_node
                } else {
                    continue;
                };
                let Some(&neighbor) = block_of.get(other) else {
                    continue;
                };
                picked.push(AssociatedBlock {
                    from_block: block,
                    neighbor_block: neighbor,
                    association: edge.clone().into_association()?,
                });
            }
            if !picked.is_empty() {
                out.insert(block, picked);
            }
        }
        Ok(out)
    }

    /// Number of edges.
    pub fn count(&self) -> MnemoResult<u64> {
        let conn = lock(&self.conn)?;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM associations", [], |row| row.get(0))
            .map_err(storage_err)?;
        Ok(n as u64)
    }
}

pub(crate) fn node_for_block_in(conn: &Connection, block_index: u64) -> MnemoResult<Option<String>> {
    conn.query_row(
        "SELECT node_id FROM memory_nodes WHERE block_index = ?1",
        params![block_index as i64],
        |row| row.get(0),
    )
    .optional()
    .map_err(storage_err)
}

/// Row as read from SQLite, converted after the statement is done.
#[derive(Clone)]
struct RawAssociation {
    id: i64,
    source_node: String,
    target_node: String,
    assoc_type: String,
    strength: f64,
    created_at: String,
    activation_count: i64,
    metadata: String,
}

impl RawAssociation {
    fn into_association(self) -> MnemoResult<Association> {
        let metadata = serde_json::from_str(&self.metadata).unwrap_or_default();
        Ok(Association {
            id: self.id,
            source_node: self.source_node,
            target_node: self.target_node,
            assoc_type: AssociationType::parse(&self.assoc_type),
            strength: self.strength as f32,
            created_at: parse_timestamp(&self.created_at)?,
            activation_count: self.activation_count.max(0) as u64,
            metadata,
        })
    }
}

fn read_association(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawAssociation> {
    Ok(RawAssociation {
        id: row.get(0)?,
        source_node: row.get(1)?,
        target_node: row.get(2)?,
        assoc_type: row.get(3)?,
        strength: row.get(4)?,
        created_at: row.get(5)?,
        activation_count: row.get(6)?,
        metadata: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;

    fn setup(blocks: u64) -> AssociationStore {
        let conn = open_in_memory().unwrap();
        {
            let c = conn.lock().unwrap();
            for i in 0..blocks {
                c.execute(
                    "INSERT INTO memory_nodes (node_id, block_index, created_at) VALUES (?1, ?2, ?3)",
                    params![format!("node-{i}"), i as i64, Utc::now().to_rfc3339()],
                )
                .unwrap();
            }
        }
        AssociationStore::new(conn, 0.7)
    }

    fn link(store: &AssociationStore, a: u64, b: u64, strength: f32) -> AssociationOutcome {
        store
            .record(a, b, &AssociationType::Semantic, strength, &HashMap::new(), Utc::now())
            .unwrap()
    }

    #[test]
    fn test_record_is_canonical_and_reinforces() {
        let store = setup(3);
        let first = link(&store, 2, 0, 0.5);
        assert!(matches!(first, AssociationOutcome::Created(_)));
        let second = link(&store, 0, 2, 1.0);
        assert!(matches!(second, AssociationOutcome::Reinforced(_)));
        assert_eq!(store.count().unwrap(), 1);

        let n = store.neighbors(0, 3).unwrap();
        assert_eq!(n.len(), 1);
        let edge = &n[0].association;
        assert_eq!(edge.source_node, "node-0");
        assert_eq!(edge.target_node, "node-2");
        assert_eq!(edge.activation_count, 2);
        // 0.7 * 0.5 + 0.3 * 1.0
        assert!((edge.strength - 0.65).abs() < 1e-5);
    }

    #[test]
    fn test_self_edge_rejected() {
        let store = setup(1);
        let err = store
            .record(0, 0, &AssociationType::Causal, 0.5, &HashMap::new(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, MnemoError::InvalidInput(_)));
    }

    #[test]
    fn test_neighbors_from_either_side() {
        let store = setup(4);
        link(&store, 0, 1, 0.9);
        link(&store, 1, 2, 0.4);
        link(&store, 1, 3, 0.6);
        let n = store.neighbors(1, 3).unwrap();
        let order: Vec<u64> = n.iter().map(|a| a.neighbor_block).collect();
        assert_eq!(order, vec![0, 3, 2]);
        assert_eq!(store.neighbors(1, 2).unwrap().len(), 2);
        assert!(store.neighbors(9, 3).unwrap().is_empty());
    }

    #[test]
    fn test_batch_matches_single() {
        let store = setup(6);
        link(&store, 0, 1, 0.9);
        link(&store, 0, 2, 0.5);
        link(&store, 0, 3, 0.7);
        link(&store, 0, 4, 0.2);
        link(&store, 1, 5, 0.8);
        link(&store, 2, 3, 0.5);

        let indices = [0, 1, 2, 3, 4, 5, 42];
        let batch = store.neighbors_batch(&indices, 3).unwrap();
        for i in indices {
            let single = store.neighbors(i, 3).unwrap();
            let batched = batch.get(&i).cloned().unwrap_or_default();
            assert_eq!(single, batched, "block {i}");
        }
    }
}
