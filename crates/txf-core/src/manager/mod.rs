//! Per-processor transaction lifecycle: begin, commit, abort, and resource limits.
//!
//! A [`TransactionManager`] is owned by exactly one emulated processor. The
//! only state it shares with other processors is the [`SharedStorage`], which
//! it reaches through an `Arc`.

mod abort;
mod access;
mod screen;

pub use screen::InstructionClass;

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use crate::api::{CommitOutcome, TraceSink, TxEvent, TxfConfig};
use crate::capture::{LineState, PageCaptureStore};
use crate::cause::{AbortReason, AbortRequest};
use crate::conflict::{CpuId, LineId, GENERATION_MASK};
use crate::error::TxError;
use crate::memory::AddressTranslator;
use crate::state::{BeginParams, CpuRegisters, FrameHandle, TransactionContext};
use crate::storage::SharedStorage;
use crate::{MAX_TXF_PAGES, MAX_TXF_TND};

/// Transactional-execution engine of one emulated processor.
pub struct TransactionManager {
    cpu: CpuId,
    storage: Arc<SharedStorage>,
    translator: Arc<dyn AddressTranslator>,
    config: TxfConfig,
    context: Option<TransactionContext>,
    pages: PageCaptureStore,
    rng: Option<StdRng>,
    next_generation: u64,
    constrained_retry: Option<(u64, u32)>,
    sink: Option<Box<dyn TraceSink>>,
}

impl TransactionManager {
    /// Creates the engine for processor `cpu`.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::UnknownCpu`] when `cpu` has no slot in the
    /// storage's ownership table.
    pub fn new(
        cpu: CpuId,
        storage: Arc<SharedStorage>,
        translator: Arc<dyn AddressTranslator>,
        config: TxfConfig,
    ) -> Result<Self, TxError> {
        let cpus = storage.detector().cpu_count();
        if cpu.raw() >= cpus {
            return Err(TxError::UnknownCpu { cpu, cpus });
        }
        let rng = config
            .random_abort
            .filter(|random| random.one_in > 0)
            .map(|random| StdRng::seed_from_u64(random.seed ^ u64::from(cpu.raw())));
        Ok(Self {
            cpu,
            storage,
            translator,
            pages: PageCaptureStore::new(MAX_TXF_PAGES, config.capture_tries),
            config,
            context: None,
            rng,
            next_generation: 0,
            constrained_retry: None,
            sink: None,
        })
    }

    /// Attaches a trace collaborator.
    #[must_use]
    pub fn with_trace_sink(mut self, sink: Box<dyn TraceSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Processor this engine belongs to.
    #[must_use]
    pub const fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// Configuration the engine was built with.
    #[must_use]
    pub const fn config(&self) -> &TxfConfig {
        &self.config
    }

    /// Shared storage this engine accesses.
    #[must_use]
    pub fn storage(&self) -> &Arc<SharedStorage> {
        &self.storage
    }

    /// Returns `true` while a transaction is open.
    #[must_use]
    pub const fn in_transaction(&self) -> bool {
        self.context.is_some()
    }

    /// Current nesting depth, `0` outside a transaction (EXTRACT TRANSACTION NESTING DEPTH).
    #[must_use]
    pub fn nesting_depth(&self) -> u16 {
        self.context.as_ref().map_or(0, TransactionContext::depth)
    }

    /// Returns `true` when the open transaction is constrained.
    #[must_use]
    pub fn constrained(&self) -> bool {
        self.context
            .as_ref()
            .is_some_and(TransactionContext::constrained)
    }

    /// Pages captured by the open attempt.
    #[must_use]
    pub fn mapped_pages(&self) -> usize {
        self.pages.len()
    }

    /// State of the line holding `virtual_addr` in the open attempt.
    #[must_use]
    pub fn line_state(&self, virtual_addr: u64) -> LineState {
        self.pages.line_state(virtual_addr)
    }

    /// Open transaction context.
    #[must_use]
    pub const fn context(&self) -> Option<&TransactionContext> {
        self.context.as_ref()
    }

    /// Opens a transaction level (TBEGIN or TBEGINC).
    ///
    /// A TBEGINC inside an unconstrained transaction opens an unconstrained
    /// level. Any begin inside a constrained transaction, and a begin that
    /// would exceed a depth of 15, aborts the attempt.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::Aborted`] with the completed abort when the begin
    /// itself aborts the transaction.
    pub fn begin(
        &mut self,
        params: BeginParams,
        registers: &mut CpuRegisters,
    ) -> Result<FrameHandle, TxError> {
        let Some(context) = self.context.as_mut() else {
            return Ok(self.begin_outermost(params, registers));
        };
        let violation = if context.depth() >= MAX_TXF_TND {
            Some(AbortRequest::new(AbortReason::Nesting))
        } else if context.constrained() {
            Some(AbortRequest::new(AbortReason::ContranInstr))
        } else {
            self.storage
                .detector()
                .take_doom(self.cpu, context.generation())
        };
        if let Some(request) = violation {
            return Err(self.abort_with(request, registers));
        }
        let handle = context.push(BeginParams {
            constrained: false,
            ..params
        });
        debug!(cpu = %self.cpu, depth = handle.depth, "nested transaction begin");
        self.emit_begin(handle.depth, false);
        Ok(handle)
    }

    fn begin_outermost(&mut self, params: BeginParams, registers: &CpuRegisters) -> FrameHandle {
        self.next_generation = self.next_generation % GENERATION_MASK + 1;
        let generation = self.next_generation;
        self.storage.detector().activate(self.cpu, generation);
        if params.constrained {
            if let Some((address, _)) = self.constrained_retry {
                if address != params.resume_addr {
                    self.constrained_retry = None;
                }
            }
        }
        let context = TransactionContext::new(generation, params, &registers.gpr);
        let handle = context.handle();
        self.context = Some(context);
        debug!(
            cpu = %self.cpu,
            generation,
            constrained = params.constrained,
            "transaction begin"
        );
        self.emit_begin(handle.depth, params.constrained);
        handle
    }

    /// Closes the innermost level (TEND).
    ///
    /// Closing the outermost level drops every snapshot and releases every
    /// line claim; the live frames already hold the transaction's stores.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::NotInTransaction`] outside a transaction, or
    /// [`TxError::Aborted`] when another processor doomed the attempt.
    pub fn commit(&mut self, registers: &mut CpuRegisters) -> Result<CommitOutcome, TxError> {
        let Some(context) = self.context.as_mut() else {
            return Err(TxError::NotInTransaction);
        };
        let generation = context.generation();
        if let Some(request) = self.storage.detector().take_doom(self.cpu, generation) {
            return Err(self.abort_with(request, registers));
        }
        if context.pop_nested().is_some() {
            let depth = context.depth();
            let constrained = context.constrained();
            self.emit(
                self.config.trace.success(constrained),
                TxEvent::Commit {
                    cpu: self.cpu,
                    depth,
                    pages: 0,
                },
            );
            return Ok(CommitOutcome::Nested { depth });
        }

        let constrained = context.constrained();
        let claimed: Vec<LineId> = self
            .pages
            .touched_lines()
            .into_iter()
            .map(|touched| LineId::new(touched.frame, touched.line))
            .collect();
        let pages = self.pages.discard_all();
        let detector = self.storage.detector();
        detector.release(self.cpu, generation, claimed);
        detector.deactivate(self.cpu);
        self.context = None;
        if constrained {
            self.constrained_retry = None;
        }
        debug!(cpu = %self.cpu, generation, pages, "transaction committed");
        self.emit(
            self.config.trace.success(constrained),
            TxEvent::Commit {
                cpu: self.cpu,
                depth: 0,
                pages,
            },
        );
        Ok(CommitOutcome::Committed { pages })
    }

    fn emit_begin(&mut self, depth: u16, constrained: bool) {
        self.emit(
            self.config.trace.success(constrained),
            TxEvent::Begin {
                cpu: self.cpu,
                depth,
                constrained,
            },
        );
    }

    fn emit(&mut self, enabled: bool, event: TxEvent) {
        if !enabled {
            return;
        }
        if let Some(sink) = self.sink.as_mut() {
            sink.on_event(event);
        }
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("cpu", &self.cpu)
            .field("depth", &self.nesting_depth())
            .field("pages", &self.pages.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::TransactionManager;
    use crate::api::{CommitOutcome, TxfConfig};
    use crate::cause::AbortCode;
    use crate::conflict::CpuId;
    use crate::error::TxError;
    use crate::memory::IdentityTranslator;
    use crate::state::{BeginParams, CpuRegisters};
    use crate::storage::SharedStorage;
    use crate::MAX_TXF_TND;

    fn manager() -> TransactionManager {
        let storage = Arc::new(SharedStorage::new(4, 1));
        TransactionManager::new(
            CpuId::new(0),
            storage,
            Arc::new(IdentityTranslator::new(4)),
            TxfConfig::default(),
        )
        .expect("processor in range")
    }

    #[test]
    fn processor_outside_the_ownership_table_is_rejected() {
        let storage = Arc::new(SharedStorage::new(4, 1));
        let error = TransactionManager::new(
            CpuId::new(1),
            storage,
            Arc::new(IdentityTranslator::new(4)),
            TxfConfig::default(),
        )
        .expect_err("only CP00 has a slot");
        assert_eq!(
            error,
            TxError::UnknownCpu {
                cpu: CpuId::new(1),
                cpus: 1
            }
        );
    }

    #[test]
    fn nested_commits_unwind_one_level_each() {
        let mut cpu = manager();
        let mut registers = CpuRegisters::default();
        for depth in 1..=3 {
            let handle = cpu
                .begin(BeginParams::unconstrained(0x100), &mut registers)
                .expect("within depth");
            assert_eq!(handle.depth, depth);
        }
        assert_eq!(
            cpu.commit(&mut registers),
            Ok(CommitOutcome::Nested { depth: 2 })
        );
        assert_eq!(
            cpu.commit(&mut registers),
            Ok(CommitOutcome::Nested { depth: 1 })
        );
        assert_eq!(
            cpu.commit(&mut registers),
            Ok(CommitOutcome::Committed { pages: 0 })
        );
        assert_eq!(cpu.commit(&mut registers), Err(TxError::NotInTransaction));
    }

    #[test]
    fn sixteenth_begin_aborts_with_nesting() {
        let mut cpu = manager();
        let mut registers = CpuRegisters::default();
        for _ in 0..MAX_TXF_TND {
            cpu.begin(BeginParams::unconstrained(0x100), &mut registers)
                .expect("within depth");
        }
        let error = cpu
            .begin(BeginParams::constrained(0x200), &mut registers)
            .expect_err("depth exceeded");
        let outcome = error.outcome().expect("aborted");
        assert_eq!(outcome.code, AbortCode::Nesting);
        assert!(!cpu.in_transaction());
    }

    #[test]
    fn tbeginc_inside_tbegin_is_unconstrained() {
        let mut cpu = manager();
        let mut registers = CpuRegisters::default();
        cpu.begin(BeginParams::unconstrained(0x100), &mut registers)
            .expect("outermost");
        let handle = cpu
            .begin(BeginParams::constrained(0x200), &mut registers)
            .expect("nested");
        assert!(!handle.constrained);
        assert!(!cpu.constrained());
    }

    #[test]
    fn begin_inside_constrained_is_a_constraint_violation() {
        let mut cpu = manager();
        let mut registers = CpuRegisters::default();
        cpu.begin(BeginParams::constrained(0x100), &mut registers)
            .expect("outermost");
        let error = cpu
            .begin(BeginParams::unconstrained(0x104), &mut registers)
            .expect_err("constrained cannot nest");
        assert_eq!(
            error.outcome().map(|outcome| outcome.code),
            Some(AbortCode::RestrictedInstruction)
        );
    }
}
