//! Per-processor transaction state: the nesting stack and what outermost begin saved.

/// General register file and save-mask types.
pub mod registers;

pub use registers::{
    CpuRegisters, GeneralRegister, GeneralRegisters, RegisterSaveMask, GENERAL_REGISTER_COUNT,
    REGISTER_PAIR_COUNT,
};

use crate::MAX_TXF_TND;

/// Operands of a TBEGIN or TBEGINC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct BeginParams {
    /// TBEGINC rather than TBEGIN.
    pub constrained: bool,
    /// Address execution resumes at when this frame absorbs an abort.
    ///
    /// For TBEGINC this is the TBEGINC itself, which is re-executed on retry.
    pub resume_addr: u64,
    /// Store a diagnostic block when this frame absorbs an abort.
    pub tdb_requested: bool,
    /// Register pairs restored on abort. Only the outermost mask applies.
    pub save_mask: RegisterSaveMask,
    /// Access-register modification allowed.
    pub allow_ar_modification: bool,
    /// Floating-point operations allowed.
    pub allow_float: bool,
    /// Program-interruption filtering control, `0..=2`.
    pub pifc: u8,
}

impl BeginParams {
    /// TBEGIN resuming at `resume_addr` on abort.
    #[must_use]
    pub const fn unconstrained(resume_addr: u64) -> Self {
        Self {
            constrained: false,
            resume_addr,
            tdb_requested: false,
            save_mask: RegisterSaveMask::NONE,
            allow_ar_modification: true,
            allow_float: true,
            pifc: 0,
        }
    }

    /// TBEGINC located at `tbeginc_addr`.
    #[must_use]
    pub const fn constrained(tbeginc_addr: u64) -> Self {
        Self {
            constrained: true,
            resume_addr: tbeginc_addr,
            tdb_requested: false,
            save_mask: RegisterSaveMask::NONE,
            allow_ar_modification: false,
            allow_float: false,
            pifc: 0,
        }
    }

    /// Requests a diagnostic block.
    #[must_use]
    pub const fn with_tdb(mut self) -> Self {
        self.tdb_requested = true;
        self
    }

    /// Sets the general register save mask.
    #[must_use]
    pub const fn with_save_mask(mut self, mask: RegisterSaveMask) -> Self {
        self.save_mask = mask;
        self
    }

    /// Sets the access-register and floating-point controls.
    #[must_use]
    pub const fn with_controls(mut self, allow_ar_modification: bool, allow_float: bool) -> Self {
        self.allow_ar_modification = allow_ar_modification;
        self.allow_float = allow_float;
        self
    }

    /// Sets program-interruption filtering, clamped to `2`.
    #[must_use]
    pub const fn with_pifc(mut self, pifc: u8) -> Self {
        self.pifc = if pifc > 2 { 2 } else { pifc };
        self
    }
}

/// One level of the nesting stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxFrame {
    /// Operands this level was opened with.
    pub params: BeginParams,
}

/// Identifies the level a begin opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct FrameHandle {
    /// Nesting depth after the begin, `1..=15`.
    pub depth: u16,
    /// Whether the level runs constrained.
    pub constrained: bool,
}

/// Nesting stack of one processor's open transaction attempt.
///
/// Created at outermost begin and dropped when the attempt commits or aborts.
/// Every level shares the one page capture set of the attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionContext {
    frames: Vec<TxFrame>,
    generation: u64,
    saved_registers: GeneralRegisters,
    instruction_count: u32,
}

impl TransactionContext {
    /// Opens the outermost level of attempt `generation`, saving the registers it names.
    #[must_use]
    pub fn new(generation: u64, params: BeginParams, registers: &GeneralRegisters) -> Self {
        let mut frames = Vec::with_capacity(MAX_TXF_TND as usize);
        frames.push(TxFrame { params });
        Self {
            frames,
            generation,
            saved_registers: *registers,
            instruction_count: 0,
        }
    }

    /// Attempt generation used for line claims.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Current nesting depth.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn depth(&self) -> u16 {
        self.frames.len() as u16
    }

    /// Returns `true` when the attempt runs constrained.
    #[must_use]
    pub fn constrained(&self) -> bool {
        self.outermost().params.constrained
    }

    /// Outermost level.
    #[must_use]
    pub fn outermost(&self) -> &TxFrame {
        &self.frames[0]
    }

    /// Innermost level.
    #[must_use]
    pub fn innermost(&self) -> &TxFrame {
        &self.frames[self.frames.len() - 1]
    }

    /// Level at `depth` (1-based).
    #[must_use]
    pub fn frame(&self, depth: u16) -> Option<&TxFrame> {
        self.frames.get(usize::from(depth).checked_sub(1)?)
    }

    /// Pushes a nested level. The caller enforces the depth limit.
    pub fn push(&mut self, params: BeginParams) -> FrameHandle {
        self.frames.push(TxFrame { params });
        FrameHandle {
            depth: self.depth(),
            constrained: params.constrained,
        }
    }

    /// Pops the innermost level; the outermost level is never popped here.
    pub fn pop_nested(&mut self) -> Option<TxFrame> {
        if self.frames.len() > 1 {
            self.frames.pop()
        } else {
            None
        }
    }

    /// Handle for the innermost level.
    #[must_use]
    pub fn handle(&self) -> FrameHandle {
        FrameHandle {
            depth: self.depth(),
            constrained: self.innermost().params.constrained,
        }
    }

    /// Registers saved at outermost begin.
    #[must_use]
    pub const fn saved_registers(&self) -> &GeneralRegisters {
        &self.saved_registers
    }

    /// Save mask of the outermost level.
    #[must_use]
    pub fn save_mask(&self) -> RegisterSaveMask {
        self.outermost().params.save_mask
    }

    /// Effective filtering control: the highest PIFC of any level.
    #[must_use]
    pub fn effective_pifc(&self) -> u8 {
        self.frames
            .iter()
            .map(|frame| frame.params.pifc)
            .max()
            .unwrap_or(0)
    }

    /// Floating point is allowed only if every level allows it.
    #[must_use]
    pub fn float_allowed(&self) -> bool {
        self.frames.iter().all(|frame| frame.params.allow_float)
    }

    /// AR modification is allowed only if every level allows it.
    #[must_use]
    pub fn ar_modification_allowed(&self) -> bool {
        self.frames
            .iter()
            .all(|frame| frame.params.allow_ar_modification)
    }

    /// Counts one executed instruction and returns the new total.
    pub fn count_instruction(&mut self) -> u32 {
        self.instruction_count = self.instruction_count.saturating_add(1);
        self.instruction_count
    }

    /// Instructions counted so far.
    #[must_use]
    pub const fn instruction_count(&self) -> u32 {
        self.instruction_count
    }
}
