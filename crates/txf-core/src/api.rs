//! Host-facing configuration, outcome types, and the trace collaborator contract.

use crate::capture::TouchedLine;
use crate::cause::{AbortCode, AbortReasons, ConditionCode, Interruption};
use crate::conflict::{ConflictToken, CpuId};
use crate::state::GeneralRegisters;
use crate::tdb::Tdb;
use crate::MAX_CAPTURE_TRIES;

/// Seeded random-abort injection for exercising abort paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct RandomAbortConfig {
    /// Seed of the per-processor generator.
    pub seed: u64,
    /// Each transactional access aborts with probability `1 / one_in`. Zero disables injection.
    pub one_in: u32,
}

/// Per-category trace enables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct TraceFlags(u16);

impl TraceFlags {
    /// Nothing traced.
    pub const NONE: Self = Self(0);
    /// Successful begins and commits.
    pub const SUCCESS: Self = Self(1 << 0);
    /// Aborts.
    pub const FAILURE: Self = Self(1 << 1);
    /// Unconstrained transactions.
    pub const UNCONSTRAINED: Self = Self(1 << 2);
    /// Constrained transactions.
    pub const CONSTRAINED: Self = Self(1 << 3);
    /// Diagnostic blocks attached to abort events.
    pub const TDB: Self = Self(1 << 4);
    /// Page mapping events.
    pub const MAP: Self = Self(1 << 5);
    /// Page list attached to abort events.
    pub const PAGES: Self = Self(1 << 6);
    /// Touched cache lines attached to abort events.
    pub const LINES: Self = Self(1 << 7);
    /// Every category.
    pub const ALL: Self = Self(0xFF);

    /// Raw flag bits.
    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Returns `true` when every flag of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two flag sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether transactions of this kind are traced at all.
    #[must_use]
    pub const fn kind(self, constrained: bool) -> bool {
        if constrained {
            self.contains(Self::CONSTRAINED)
        } else {
            self.contains(Self::UNCONSTRAINED)
        }
    }

    /// Begin/commit tracing.
    #[must_use]
    pub const fn success(self, constrained: bool) -> bool {
        self.contains(Self::SUCCESS) && self.kind(constrained)
    }

    /// Abort tracing.
    #[must_use]
    pub const fn failure(self, constrained: bool) -> bool {
        self.contains(Self::FAILURE) && self.kind(constrained)
    }

    /// Diagnostic block dumps; implies abort tracing.
    #[must_use]
    pub const fn tdb(self, constrained: bool) -> bool {
        self.contains(Self::TDB) && self.failure(constrained)
    }

    /// Page mapping tracing.
    #[must_use]
    pub const fn map(self, constrained: bool) -> bool {
        self.contains(Self::MAP) && self.kind(constrained)
    }

    /// Page list tracing.
    #[must_use]
    pub const fn pages(self, constrained: bool) -> bool {
        self.contains(Self::PAGES) && self.kind(constrained)
    }

    /// Cache line tracing.
    #[must_use]
    pub const fn lines(self, constrained: bool) -> bool {
        self.contains(Self::LINES) && self.kind(constrained)
    }
}

impl std::ops::BitOr for TraceFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// Immutable engine configuration injected at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct TxfConfig {
    /// Store diagnostic blocks for frames that request them.
    pub capture_diagnostics: bool,
    /// Random-abort injection, off when `None`.
    pub random_abort: Option<RandomAbortConfig>,
    /// Trace categories delivered to the sink.
    pub trace: TraceFlags,
    /// Bounded attempts to copy a page that is being written.
    pub capture_tries: u32,
}

impl Default for TxfConfig {
    fn default() -> Self {
        Self {
            capture_diagnostics: true,
            random_abort: None,
            trace: TraceFlags::NONE,
            capture_tries: MAX_CAPTURE_TRIES,
        }
    }
}

/// Result of a successful commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// An inner level ended; the attempt is still open.
    Nested {
        /// Remaining nesting depth.
        depth: u16,
    },
    /// The outermost level ended; all stores are final.
    Committed {
        /// Pages whose snapshots were dropped.
        pages: usize,
    },
}

/// What the dispatch loop does once an abort has rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortAction {
    /// Continue at the absorbing TBEGIN's abort path with a condition code.
    Resume {
        /// Instruction after the absorbing TBEGIN.
        address: u64,
        /// Condition code to set.
        cc: ConditionCode,
    },
    /// Deliver an interruption; its old PSW points at `address`.
    Interrupt {
        /// Address saved in the interruption old PSW.
        address: u64,
        /// Interruption to deliver.
        interruption: Interruption,
    },
    /// Re-execute the TBEGINC.
    Retry {
        /// TBEGINC address.
        address: u64,
        /// Consecutive retries of this constrained transaction, starting at 1.
        attempt: u32,
    },
    /// Raise a program interruption that ends the constrained transaction for good.
    ProgramCheck {
        /// Address of the offending instruction.
        address: u64,
        /// Program interruption code.
        code: u16,
    },
}

/// Everything the dispatch loop learns from an abort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortOutcome {
    /// Next step for the dispatch loop.
    pub action: AbortAction,
    /// Guest-visible abort code.
    pub code: AbortCode,
    /// Contributing reasons.
    pub reasons: AbortReasons,
    /// Diagnostic block; invalid unless capture was requested and enabled.
    pub tdb: Tdb,
    /// Pages restored from their snapshots.
    pub restored_pages: usize,
}

/// Structured abort record handed to the trace collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortEvent {
    /// Aborting processor.
    pub cpu: CpuId,
    /// Guest-visible abort code.
    pub code: AbortCode,
    /// Contributing reasons.
    pub reasons: AbortReasons,
    /// Whether the attempt ran constrained.
    pub constrained: bool,
    /// Address of the instruction that was executing.
    pub instruction_addr: u64,
    /// Registers at abort, before restoration.
    pub registers: GeneralRegisters,
    /// Conflicting line, for conflict aborts.
    pub conflict_token: Option<ConflictToken>,
    /// Diagnostic block, when TDB tracing is on.
    pub tdb: Option<Tdb>,
    /// Virtual pages that were mapped, when page tracing is on.
    pub pages: Vec<u64>,
    /// Touched lines, when line tracing is on.
    pub lines: Vec<TouchedLine>,
}

/// Events emitted to a [`TraceSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxEvent {
    /// A level was opened.
    Begin {
        /// Processor.
        cpu: CpuId,
        /// Depth after the begin.
        depth: u16,
        /// Whether the attempt runs constrained.
        constrained: bool,
    },
    /// A level was closed without abort.
    Commit {
        /// Processor.
        cpu: CpuId,
        /// Depth after the commit.
        depth: u16,
        /// Pages released, zero for inner levels.
        pages: usize,
    },
    /// A page entered the capture set.
    PageMapped {
        /// Processor.
        cpu: CpuId,
        /// Page-aligned virtual address.
        virtual_page: u64,
        /// Real address of the backing frame.
        real_page: u64,
    },
    /// The attempt aborted.
    Abort(Box<AbortEvent>),
}

/// Host trace hook receiving transactional events in execution order.
pub trait TraceSink: Send {
    /// Records an event in execution order.
    fn on_event(&mut self, event: TxEvent);
}
