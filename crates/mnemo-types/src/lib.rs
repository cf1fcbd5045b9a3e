//! Core types and traits for the Mnemo memory ledger.
//!
//! This crate defines the data model shared by the block store, slot router,
//! search engine, and consolidation pipeline, together with the contracts of
//! the external collaborators (text analysis and pair classification).
//! It contains no business logic.

pub mod association;
pub mod block;
pub mod classifier;
pub mod config;
pub mod consolidation;
pub mod error;
pub mod search;
pub mod slot;
pub mod text;
