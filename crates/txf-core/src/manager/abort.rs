use tracing::{debug, warn};

use super::TransactionManager;
use crate::api::{AbortAction, AbortEvent, AbortOutcome, TxEvent};
use crate::cause::{
    AbortReason, AbortRequest, Interruption, ProgramException, PGM_TRANSACTION_CONSTRAINT,
    TABORT_MIN_CODE,
};
use crate::conflict::LineId;
use crate::error::TxError;
use crate::state::{CpuRegisters, TransactionContext, TxFrame};
use crate::tdb::{AbortDiagnostics, DiagnosticContext};

impl TransactionManager {
    /// Aborts the open transaction and rolls back every captured page.
    ///
    /// The whole nesting stack unwinds. Resource exhaustion is absorbed by the
    /// outermost level, every other cause by the innermost one; the absorbing
    /// level supplies the resume address and the diagnostic-block request.
    /// General registers named by the outermost save mask are restored.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::NotInTransaction`] outside a transaction.
    pub fn abort(
        &mut self,
        request: AbortRequest,
        registers: &mut CpuRegisters,
    ) -> Result<AbortOutcome, TxError> {
        let context = self.context.take().ok_or(TxError::NotInTransaction)?;
        Ok(self.finalize(context, request, registers))
    }

    /// Explicit abort (TABORT) with guest code `code`.
    ///
    /// Inside a constrained transaction TABORT is itself a restricted
    /// instruction and ends in a transaction-constraint program check.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::InvalidAbortCode`] for codes below 256 and
    /// [`TxError::NotInTransaction`] outside a transaction.
    pub fn tabort(
        &mut self,
        code: u64,
        registers: &mut CpuRegisters,
    ) -> Result<AbortOutcome, TxError> {
        if code < TABORT_MIN_CODE {
            return Err(TxError::InvalidAbortCode(code));
        }
        let request = if self.constrained() {
            AbortRequest::new(AbortReason::ContranInstr)
        } else {
            AbortRequest::tabort(code)
        };
        self.abort(request, registers)
    }

    /// Aborts the open transaction ahead of an asynchronous interruption.
    ///
    /// Returns `None` when no transaction is open.
    pub fn interrupt(
        &mut self,
        interruption: Interruption,
        registers: &mut CpuRegisters,
    ) -> Option<AbortOutcome> {
        self.abort(AbortRequest::interruption(interruption), registers)
            .ok()
    }

    /// Aborts the open transaction for a program exception.
    ///
    /// Exceptions whose class is filtered by the effective PIFC abort without
    /// an interruption and report `TAC_FPGM`. Returns `None` when no
    /// transaction is open.
    pub fn program_exception(
        &mut self,
        exception: ProgramException,
        registers: &mut CpuRegisters,
    ) -> Option<AbortOutcome> {
        let request = self.program_request(exception);
        self.abort(request, registers).ok()
    }

    /// Aborts the open transaction on a nested SIE exit.
    pub fn sie_exit(&mut self, registers: &mut CpuRegisters) -> Option<AbortOutcome> {
        self.abort(AbortRequest::new(AbortReason::SieExit), registers)
            .ok()
    }

    /// Completes an abort another processor posted, if any.
    pub fn check_conflict(&mut self, registers: &mut CpuRegisters) -> Option<AbortOutcome> {
        let generation = self.context.as_ref()?.generation();
        let request = self
            .storage
            .detector()
            .take_doom(self.cpu, generation)?;
        self.abort(request, registers).ok()
    }

    /// Dooms every other processor's open transaction, as COMPARE AND SWAP
    /// AND PURGE does. `wide` selects the CSPG form.
    ///
    /// Returns how many transactions were doomed.
    pub fn purge_broadcast(&self, wide: bool) -> usize {
        let reason = if wide {
            AbortReason::CspgInstr
        } else {
            AbortReason::CspInstr
        };
        self.storage
            .detector()
            .doom_all_except(self.cpu, AbortRequest::new(reason))
    }

    pub(super) fn program_request(&self, exception: ProgramException) -> AbortRequest {
        let filtered = self.context.as_ref().is_some_and(|context| {
            !context.constrained() && exception.class().filtered_by(context.effective_pifc())
        });
        AbortRequest::program(exception, filtered)
    }

    /// Runs an abort raised inside the engine and wraps it for the caller.
    pub(super) fn abort_with(
        &mut self,
        request: AbortRequest,
        registers: &mut CpuRegisters,
    ) -> TxError {
        match self.abort(request, registers) {
            Ok(outcome) => TxError::Aborted(Box::new(outcome)),
            Err(error) => error,
        }
    }

    fn finalize(
        &mut self,
        context: TransactionContext,
        mut request: AbortRequest,
        registers: &mut CpuRegisters,
    ) -> AbortOutcome {
        let generation = context.generation();
        let detector = self.storage.detector();
        if let Some(doomed) = detector.take_doom(self.cpu, generation) {
            request.merge(doomed);
        }
        let constrained = context.constrained();
        let absorbing = if request.reasons.has_resource_reason() {
            *context.outermost()
        } else {
            *context.innermost()
        };
        let code = request.abort_code();
        let tdb = AbortDiagnostics::build(
            &request,
            &registers.gpr,
            registers.instruction_addr,
            &DiagnosticContext {
                nesting_depth: context.depth(),
                constrained,
                capture_requested: self.config.capture_diagnostics
                    && absorbing.params.tdb_requested,
                breaking_event_addr: registers.breaking_event_addr,
            },
        );

        let touched = self.pages.touched_lines();
        let trace_pages: Vec<u64> = if self.config.trace.pages(constrained) {
            self.pages.entries().map(|entry| entry.virtual_page()).collect()
        } else {
            Vec::new()
        };
        let registers_at_abort = registers.gpr;
        let restored_pages = self.pages.restore_all(self.storage.arena());
        detector.release(
            self.cpu,
            generation,
            touched.iter().map(|line| LineId::new(line.frame, line.line)),
        );
        detector.deactivate(self.cpu);
        registers
            .gpr
            .restore_from(context.saved_registers(), context.save_mask());

        let action = self.abort_action(&context, &absorbing, &request, registers.instruction_addr);
        debug!(
            cpu = %self.cpu,
            generation,
            code = code.short_name(),
            reasons = %request.reasons,
            restored_pages,
            "transaction aborted"
        );

        let trace = self.config.trace;
        if trace.failure(constrained) {
            let event = AbortEvent {
                cpu: self.cpu,
                code,
                reasons: request.reasons,
                constrained,
                instruction_addr: registers.instruction_addr,
                registers: registers_at_abort,
                conflict_token: request.token.filter(|_| code.is_conflict()),
                tdb: trace.tdb(constrained).then_some(tdb),
                pages: trace_pages,
                lines: if trace.lines(constrained) {
                    touched
                } else {
                    Vec::new()
                },
            };
            self.emit(true, TxEvent::Abort(Box::new(event)));
        }

        AbortOutcome {
            action,
            code,
            reasons: request.reasons,
            tdb,
            restored_pages,
        }
    }

    fn abort_action(
        &mut self,
        context: &TransactionContext,
        absorbing: &TxFrame,
        request: &AbortRequest,
        instruction_addr: u64,
    ) -> AbortAction {
        if !context.constrained() {
            self.constrained_retry = None;
            return match request.interruption {
                Some(interruption) => AbortAction::Interrupt {
                    address: absorbing.params.resume_addr,
                    interruption,
                },
                None => AbortAction::Resume {
                    address: absorbing.params.resume_addr,
                    cc: request.abort_code().condition_code(),
                },
            };
        }

        let tbeginc = context.outermost().params.resume_addr;
        if let Some(reason) = request.reasons.iter().find(|reason| reason.violates_constraint()) {
            self.constrained_retry = None;
            warn!(
                cpu = %self.cpu,
                %reason,
                address = instruction_addr,
                "constrained transaction violated its constraints"
            );
            return AbortAction::ProgramCheck {
                address: instruction_addr,
                code: PGM_TRANSACTION_CONSTRAINT,
            };
        }
        if let Some(interruption) = request.interruption {
            return AbortAction::Interrupt {
                address: tbeginc,
                interruption,
            };
        }
        let attempt = match self.constrained_retry {
            Some((address, count)) if address == tbeginc => count.saturating_add(1),
            _ => 1,
        };
        self.constrained_retry = Some((tbeginc, attempt));
        AbortAction::Retry {
            address: tbeginc,
            attempt,
        }
    }
}
