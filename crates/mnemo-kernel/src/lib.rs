//! Kernel for the Mnemo memory ledger.
//!
//! Loads configuration, installs tracing, verifies the ledger at boot, and
//! runs the background consolidation worker until shutdown.

pub mod config;
pub mod error;
pub mod kernel;
pub mod logging;
pub mod supervisor;
pub mod worker;

pub use kernel::MnemoKernel;
