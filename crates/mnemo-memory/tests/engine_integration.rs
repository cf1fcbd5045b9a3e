//! End-to-end behaviour of the assembled memory engine.

use chrono::Utc;
use mnemo_memory::association::AssociationStore;
use mnemo_memory::clock::{Clock, ManualClock};
use mnemo_memory::classifier::RuleBasedClassifier;
use mnemo_memory::db::{open_in_memory, SharedConnection};
use mnemo_memory::Components;
use mnemo_types::association::AssociationType;
use mnemo_types::block::AppendRequest;
use mnemo_types::config::MemoryConfig;
use mnemo_types::search::{SearchRequest, SearchType};
use mnemo_types::slot::{Placement, SlotId};
use std::collections::HashMap;
use std::sync::Arc;

fn engine() -> (Components, SharedConnection) {
    let conn = open_in_memory().unwrap();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
    let components = Components::assemble(
        conn.clone(),
        &MemoryConfig::default(),
        Arc::new(RuleBasedClassifier::default()),
        clock,
    )
    .unwrap();
    (components, conn)
}

#[test]
fn chain_verifies_and_pinpoints_tampering() {
    let (c, conn) = engine();
    let n = 12u64;
    for i in 0..n {
        let angle = i as f32 * 0.4;
        c.append(AppendRequest::new(format!("entry {i}"), vec![angle.cos(), angle.sin(), 0.1]))
            .unwrap();
    }
    let report = c.verify_chain(Some(0..n)).unwrap();
    assert!(report.valid);
    assert_eq!(report.checked, n);

    for target in [0u64, 5, n - 1] {
        let original: String = {
            let db = conn.lock().unwrap();
            let original = db
                .query_row(
                    "SELECT content FROM blocks WHERE block_index = ?1",
                    [target as i64],
                    |row| row.get(0),
                )
                .unwrap();
            db.execute(
                "UPDATE blocks SET content = 'rewritten history' WHERE block_index = ?1",
                [target as i64],
            )
            .unwrap();
            original
        };
        let report = c.verify_chain(Some(0..n)).unwrap();
        assert!(!report.valid);
        assert_eq!(report.first_corrupt_index, Some(target));

        conn.lock()
            .unwrap()
            .execute(
                "UPDATE blocks SET content = ?1 WHERE block_index = ?2",
                rusqlite::params![original, target as i64],
            )
            .unwrap();
        assert!(c.verify_chain(None).unwrap().valid);
    }
}

#[tokio::test]
async fn pair_is_recorded_once() {
    let (c, _) = engine();
    let a = c
        .append(AppendRequest::new("auth login bug", vec![1.0, 0.0, 0.0]).with_keywords(["auth", "login"]))
        .unwrap()
        .block
        .index;
    let b = c
        .append(AppendRequest::new("auth token refactor", vec![0.9, 0.3, 0.0]).with_keywords(["auth", "token"]))
        .unwrap()
        .block
        .index;

    let entry = c.consolidation.claim_batch(2).unwrap().pop().unwrap();
    assert_eq!(entry.block_index, b);
    c.consolidation.process(&entry).await.unwrap();
    c.consolidation.process(&entry).await.unwrap();

    assert_eq!(c.consolidation.state_count().unwrap(), 1);
    assert!(c.consolidation.state(a, b).unwrap().is_some());
}

#[test]
fn empty_slot_then_existing_branch() {
    let (c, _) = engine();
    let e1 = vec![0.2, 0.9, 0.1];
    let first = c.slot_router.select_slot(&e1);
    assert_eq!(first.placement, Placement::NewContext);
    assert!(c.slot_router.slot(first.slot_id).unwrap().is_empty());

    c.append(AppendRequest::new("seed", e1.clone())).unwrap();
    let second = c.slot_router.select_slot(&e1);
    assert_eq!(second.slot_id, first.slot_id);
    assert_eq!(second.placement, Placement::ExistingBranch);
}

#[test]
fn pinned_head_does_not_move() {
    let (c, _) = engine();
    let b = c.append(AppendRequest::new("anchor", vec![1.0, 0.0])).unwrap().block;
    let slot = b.slot_id.unwrap();
    c.pin(slot, b.index).unwrap();

    let b2 = c
        .append(AppendRequest::new("later", vec![0.8, 0.6]).in_slot(slot))
        .unwrap()
        .block;
    assert_eq!(c.slot_router.slot(slot).unwrap().head_block_id, Some(b.index));
    // The write still lands on the pinned branch.
    assert_eq!(b2.before, Some(b.hash.clone()));

    c.unpin(slot).unwrap();
    c.append(AppendRequest::new("after unpin", vec![0.8, 0.6]).in_slot(slot))
        .unwrap();
    assert_ne!(c.slot_router.slot(slot).unwrap().head_block_id, Some(b.index));
}

#[test]
fn unique_keyword_found_only_with_fallback() {
    let (c, _) = engine();
    let slot = SlotId(0);
    let rare = c
        .append(
            AppendRequest::new("notes on zephyrine alloys", vec![0.0, 0.0, 1.0, 0.0])
                .with_keywords(["zephyrine"])
                .in_slot(slot),
        )
        .unwrap()
        .block
        .index;
    for i in 0..3 {
        c.append(AppendRequest::new(format!("filler {i}"), vec![1.0, 0.0, 0.0, 0.0]).in_slot(slot))
            .unwrap();
    }

    let query = SearchRequest::new("where is zephyrine", vec![0.0, 1.0, 0.0, 0.0])
        .from_slot(slot)
        .depth(1);
    let r = c.search(&query).unwrap();
    assert_eq!(r.meta.search_type, SearchType::LtmFallback);
    assert!(r.items.iter().any(|h| h.block.index == rare));

    let r = c.search(&query.clone().fallback(false)).unwrap();
    assert!(r.items.is_empty());
    assert_eq!(r.meta.search_type, SearchType::Empty);
}

#[test]
fn batched_neighbors_match_single_lookups() {
    let (c, conn) = engine();
    for i in 0..6 {
        c.append(AppendRequest::new(format!("block {i}"), vec![1.0, i as f32 * 0.1]))
            .unwrap();
    }
    let store = AssociationStore::new(conn, 0.7);
    let edges = [
        (0, 1, 0.9),
        (0, 2, 0.4),
        (0, 3, 0.7),
        (0, 4, 0.2),
        (1, 2, 0.5),
        (3, 5, 0.6),
        (2, 5, 0.6),
    ];
    for (a, b, s) in edges {
        store
            .record(a, b, &AssociationType::Semantic, s, &HashMap::new(), Utc::now())
            .unwrap();
    }

    let indices = [0u64, 1, 2, 3, 4, 5];
    let batch = store.neighbors_batch(&indices, 3).unwrap();
    for i in indices {
        let single = store.neighbors(i, 3).unwrap();
        assert_eq!(batch.get(&i).cloned().unwrap_or_default(), single, "block {i}");
    }
    let top: Vec<u64> = batch[&0].iter().map(|n| n.neighbor_block).collect();
    assert_eq!(top, vec![1, 3, 2]);
}

#[test]
fn auth_scenario_routes_and_ranks() {
    let (c, _) = engine();
    let b0 = c
        .append(AppendRequest::new("auth login bug", vec![1.0, 0.0, 0.0, 0.0]).with_keywords(["auth", "login", "bug"]))
        .unwrap();
    let slot_a = b0.block.slot_id.unwrap();
    assert_eq!(b0.placement, Placement::NewContext);

    let b1 = c
        .append(
            AppendRequest::new("auth token refactor", vec![0.9, 0.3, 0.0, 0.0])
                .with_keywords(["auth", "token", "refactor"])
                .after_block(b0.block.hash.clone()),
        )
        .unwrap();
    assert_eq!(b1.block.slot_id, Some(slot_a));
    assert_eq!(b1.block.before, Some(b0.block.hash.clone()));
    assert_eq!(b1.block.root, b0.block.root);

    let e2 = vec![0.0, 0.0, 1.0, 0.0];
    let decision = c.slot_router.select_slot(&e2);
    assert_eq!(decision.placement, Placement::NewContext);
    assert_ne!(decision.slot_id, slot_a);
    let b2 = c
        .append(AppendRequest::new("database migration", e2).with_keywords(["database", "migration"]))
        .unwrap();
    assert_eq!(b2.block.slot_id, Some(decision.slot_id));
    assert_ne!(b2.block.root, b0.block.root);

    let r = c
        .search(&SearchRequest::new("auth bug", vec![1.0, 0.1, 0.0, 0.0]).depth(2))
        .unwrap();
    assert_eq!(r.meta.entry_slot, Some(slot_a));
    let order: Vec<u64> = r.items.iter().map(|h| h.block.index).collect();
    assert_eq!(&order[..2], &[b0.block.index, b1.block.index]);
    if let Some(pos) = order.iter().position(|i| *i == b2.block.index) {
        assert!(pos >= 2);
    }
}

#[tokio::test]
async fn consolidation_links_related_blocks_for_search() {
    let (c, _) = engine();
    c.append(AppendRequest::new("auth login bug", vec![1.0, 0.0, 0.0]).with_keywords(["auth", "login"]))
        .unwrap();
    c.append(AppendRequest::new("weekly standup", vec![0.0, 1.0, 0.0]).with_keywords(["standup"]))
        .unwrap();
    c.append(AppendRequest::new("auth session timeout", vec![0.8, 0.0, 0.6]).with_keywords(["auth", "session"]))
        .unwrap();

    let report = c.consolidation.run_once(10).await.unwrap();
    assert_eq!(report.processed, 3);
    assert_eq!(report.failed, 0);
    assert!(report.associations_created >= 1);
    assert_eq!(c.consolidation.queue_stats().unwrap().done, 3);

    // A second pass has nothing left to do.
    let again = c.consolidation.run_once(10).await.unwrap();
    assert_eq!(again.processed, 0);
}
