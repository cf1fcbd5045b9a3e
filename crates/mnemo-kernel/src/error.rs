//! Errors raised while booting or stopping the kernel.

use mnemo_types::error::MnemoError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KernelError {
    /// Anything the memory engine reports.
    #[error(transparent)]
    Mnemo(#[from] MnemoError),

    /// Startup checks refused to bring the ledger online.
    #[error("Boot failed: {0}")]
    BootFailed(String),

    /// The consolidation worker task ended abnormally.
    #[error("Consolidation worker failed: {0}")]
    WorkerFailed(String),
}

pub type KernelResult<T> = Result<T, KernelError>;
