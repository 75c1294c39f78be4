//! Software Transactional-Execution Facility for a multi-processor mainframe emulator.
//!
//! Each emulated processor owns a [`TransactionManager`]. Managers share one
//! [`SharedStorage`]: the guest frames plus the per-line ownership table that
//! detects conflicts between processors. Transactional stores go straight to
//! the live frames; a page snapshot taken before the first touch is what an
//! abort writes back.

/// Maximum transaction nesting depth.
pub const MAX_TXF_TND: u16 = 15;
/// Maximum instructions a constrained transaction may execute.
pub const MAX_TXF_CONTRAN_INSTR: u32 = 32;
/// Maximum distinct pages one transaction attempt may touch.
pub const MAX_TXF_PAGES: usize = 64;
/// Default bound on attempts to copy a page another processor is writing.
pub const MAX_CAPTURE_TRIES: u32 = 128;
/// Bytes following a TBEGINC that a constrained transaction may execute from.
pub const CONSTRAINED_REGION_BYTES: u64 = 256;

/// Guest storage geometry, page frames, and address translation.
pub mod memory;
pub use memory::{
    page_chunks, page_of, page_offset, AddressTranslator, ArenaError, IdentityTranslator,
    PageArena, PageHandle, TranslationFault, CACHE_LINE_SIZE, CACHE_LINES_PER_PAGE, PAGE_SIZE,
};

/// Abort reasons, codes, and the interruptions that cause them.
pub mod cause;
pub use cause::{
    AbortCode, AbortReason, AbortReasons, AbortRequest, ConditionCode, ExceptionClass,
    Interruption, ProgramException, PGM_TRANSACTION_CONSTRAINT, TABORT_MIN_CODE,
};

/// Page snapshots and per-line footprint of a transaction attempt.
pub mod capture;
pub use capture::{
    AccessIntent, CaptureError, LineState, LineTouch, PageCaptureStore, PageMapEntry, TouchedLine,
};

/// Cross-processor cache-line ownership and conflict detection.
pub mod conflict;
pub use conflict::{
    Claim, ClaimError, ConflictDetector, ConflictToken, CpuId, LineClaim, LineConflict, LineId,
};

/// Storage shared by every processor.
pub mod storage;
pub use storage::{real_line, SharedStorage};

/// Error taxonomy for transactional operations.
pub mod error;
pub use error::{AccessDenied, TxError};

/// Transaction diagnostic block layout and construction.
pub mod tdb;
pub use tdb::{AbortDiagnostics, DiagnosticContext, Tdb, TdbError, TDB_SIZE};

/// Per-processor nesting state and general registers.
pub mod state;
pub use state::{
    BeginParams, CpuRegisters, FrameHandle, GeneralRegister, GeneralRegisters, RegisterSaveMask,
    TransactionContext, TxFrame,
};

/// Host-facing configuration, outcomes, and trace contract.
pub mod api;
pub use api::{
    AbortAction, AbortEvent, AbortOutcome, CommitOutcome, RandomAbortConfig, TraceFlags,
    TraceSink, TxEvent, TxfConfig,
};

/// Per-processor transaction engine.
pub mod manager;
pub use manager::{InstructionClass, TransactionManager};

#[cfg(test)]
use proptest as _;
#[cfg(test)]
use rstest as _;
