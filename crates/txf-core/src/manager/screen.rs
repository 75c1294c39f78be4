use super::TransactionManager;
use crate::cause::{AbortReason, AbortRequest};
use crate::error::TxError;
use crate::state::CpuRegisters;
use crate::{CONSTRAINED_REGION_BYTES, MAX_TXF_CONTRAN_INSTR};

/// How an instruction is treated inside a transaction.
///
/// The dispatch loop classifies each decoded instruction and hands the class
/// to [`TransactionManager::screen`] before executing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum InstructionClass {
    /// Allowed in every transaction.
    Ordinary,
    /// Never allowed in a transaction.
    Restricted,
    /// Floating-point operation.
    FloatingPoint,
    /// Modifies an access register.
    AccessRegisterModify,
    /// Branch through a register.
    NonrelativeBranch {
        /// Branch tracing is enabled.
        traced: bool,
    },
    /// BRANCH AND SET MODE and relatives.
    BranchSetMode,
    /// SET ADDRESSING MODE.
    SetAddressingMode,
    /// Other instructions restricted while tracing or in particular modes.
    Miscellaneous,
    /// Allowed in unconstrained transactions only.
    ConstrainedRestricted,
    /// Relative branch to `target`.
    RelativeBranch {
        /// Branch target address.
        target: u64,
    },
}

impl TransactionManager {
    /// Checks whether an instruction of `class` may execute in the open transaction.
    ///
    /// A forbidden instruction aborts the attempt before it executes. Outside a
    /// transaction every class is allowed.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::Aborted`] when the instruction aborted the attempt.
    pub fn screen(
        &mut self,
        class: InstructionClass,
        registers: &mut CpuRegisters,
    ) -> Result<(), TxError> {
        let Some(context) = self.context.as_ref() else {
            return Ok(());
        };
        let constrained = context.constrained();
        let reason = match class {
            InstructionClass::Ordinary => None,
            InstructionClass::Restricted => Some(AbortReason::TranInstr),
            InstructionClass::FloatingPoint if !context.float_allowed() => {
                Some(AbortReason::TranFloatInstr)
            }
            InstructionClass::AccessRegisterModify if !context.ar_modification_allowed() => {
                Some(AbortReason::TranAccessInstr)
            }
            InstructionClass::FloatingPoint | InstructionClass::AccessRegisterModify => None,
            InstructionClass::NonrelativeBranch { .. } if constrained => {
                Some(AbortReason::ContranBranch)
            }
            InstructionClass::NonrelativeBranch { traced } => {
                traced.then_some(AbortReason::TranNonrelativeBranch)
            }
            InstructionClass::BranchSetMode => Some(AbortReason::TranBranchSetMode),
            InstructionClass::SetAddressingMode => Some(AbortReason::TranSetAddressingMode),
            InstructionClass::Miscellaneous => Some(AbortReason::TranMiscInstr),
            InstructionClass::ConstrainedRestricted => {
                constrained.then_some(AbortReason::ContranInstr)
            }
            InstructionClass::RelativeBranch { target } => {
                let start = context.outermost().params.resume_addr;
                let inside = target.wrapping_sub(start) < CONSTRAINED_REGION_BYTES;
                (constrained && !inside).then_some(AbortReason::ContranRelativeBranch)
            }
        };
        match reason {
            Some(reason) => Err(self.abort_with(AbortRequest::new(reason), registers)),
            None => Ok(()),
        }
    }

    /// Counts an instruction executed at `address` by a constrained transaction.
    ///
    /// The 33rd instruction, or one outside the 256 bytes following the
    /// TBEGINC, aborts the attempt with a transaction-constraint exception.
    /// Unconstrained transactions are not counted.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::Aborted`] when a constraint was exceeded.
    pub fn count_instruction(
        &mut self,
        address: u64,
        registers: &mut CpuRegisters,
    ) -> Result<(), TxError> {
        let Some(context) = self.context.as_mut() else {
            return Ok(());
        };
        if !context.constrained() {
            return Ok(());
        }
        let start = context.outermost().params.resume_addr;
        let count = context.count_instruction();
        let reason = if count > MAX_TXF_CONTRAN_INSTR {
            Some(AbortReason::InstrCount)
        } else if address.wrapping_sub(start) >= CONSTRAINED_REGION_BYTES {
            Some(AbortReason::InstrAddr)
        } else {
            None
        };
        match reason {
            Some(reason) => Err(self.abort_with(AbortRequest::new(reason), registers)),
            None => Ok(()),
        }
    }
}
