//! Memory engine for the Mnemo ledger.
//!
//! Provides the four cooperating subsystems over one SQLite database:
//! - **BlockStore**: append-only, hash-chained ledger of immutable blocks
//! - **SlotRouter**: a few concurrently active threads, each with a branch head and topic vector
//! - **SearchEngine**: DFS-first local search augmented by association edges, with cache and global fallback
//! - **ConsolidationPipeline**: background discovery of associations between blocks
//!
//! [`Components`] wires them together once; callers hold it by reference.

pub mod association;
pub mod block_store;
pub mod cache;
pub mod classifier;
pub mod clock;
pub mod consolidation;
pub mod db;
pub mod migration;
pub mod retry;
pub mod search;
pub mod slot_router;
pub mod vector;

mod components;
pub use components::Components;
