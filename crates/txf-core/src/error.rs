use thiserror::Error;

use crate::api::AbortOutcome;
use crate::cause::AbortRequest;
use crate::conflict::{ConflictToken, CpuId};
use crate::memory::{ArenaError, TranslationFault};

/// Reasons a storage access could not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AccessDenied {
    /// Another processor's open transaction owns the line; retry after it rolls back.
    #[error("line {token} is owned by an open transaction on {owner}")]
    Busy {
        /// Contended line.
        token: ConflictToken,
        /// Owning processor.
        owner: CpuId,
    },
    /// Address translation failed.
    #[error(transparent)]
    Translation(#[from] TranslationFault),
    /// The translated frame is unusable.
    #[error(transparent)]
    Arena(#[from] ArenaError),
    /// The open transaction must abort before the access can proceed.
    #[error("transaction must abort ({})", .0.reasons)]
    Abort(AbortRequest),
}

/// Errors surfaced by [`crate::TransactionManager`] operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxError {
    /// The operation needs an open transaction.
    #[error("no transaction is open")]
    NotInTransaction,
    /// The processor id has no slot in the shared ownership table.
    #[error("{cpu} is outside the {cpus} processors the storage was built for")]
    UnknownCpu {
        /// Rejected processor.
        cpu: CpuId,
        /// Processors the ownership table covers.
        cpus: u16,
    },
    /// TABORT operand below 256.
    #[error("abort code {0} is reserved")]
    InvalidAbortCode(u64),
    /// The transaction was aborted and rolled back.
    #[error("transaction aborted: {}", .0.code)]
    Aborted(Box<AbortOutcome>),
    /// A non-transactional access was refused.
    #[error(transparent)]
    Access(#[from] AccessDenied),
}

impl TxError {
    /// Abort outcome carried by [`TxError::Aborted`].
    #[must_use]
    pub fn outcome(&self) -> Option<&AbortOutcome> {
        match self {
            Self::Aborted(outcome) => Some(outcome),
            _ => None,
        }
    }
}
