use std::fmt;

use thiserror::Error;

use crate::capture::AccessIntent;
use crate::conflict::ConflictToken;

/// Program interruption code of the transaction-constraint exception.
pub const PGM_TRANSACTION_CONSTRAINT: u16 = 0x0218;

/// Lowest abort code a guest may pass to TABORT.
pub const TABORT_MIN_CODE: u64 = 256;

/// One internal contributing cause of an abort.
///
/// Discriminants are the stable diagnostic bit values; several may be set
/// for a single abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u32)]
pub enum AbortReason {
    /// Constrained instruction left the region following TBEGINC.
    InstrAddr = 0x8000_0000,
    /// Constrained instruction count exceeded.
    InstrCount = 0x4000_0000,
    /// Random abort injected for testing.
    RandAbort = 0x2000_0000,
    /// COMPARE AND SWAP AND PURGE executed by another processor.
    CspInstr = 0x1000_0000,
    /// COMPARE AND SWAP AND PURGE (64-bit) executed by another processor.
    CspgInstr = 0x0800_0000,
    /// Nested SIE exit.
    SieExit = 0x0400_0000,
    /// Cache line conflict with another processor.
    Conflict = 0x0200_0000,
    /// Page capture limit exceeded.
    MaxPages = 0x0100_0000,
    /// External interruption.
    ExtInt = 0x0080_0000,
    /// Unfiltered program interruption.
    UnfiltInt = 0x0040_0000,
    /// Filtered program interruption.
    FiltInt = 0x0020_0000,
    /// Restart interruption.
    RestartInt = 0x0010_0000,
    /// I/O interruption.
    IoInt = 0x0008_0000,
    /// Machine-check interruption.
    MckInt = 0x0004_0000,
    /// Abort raised by another processor and noticed later.
    DelayedAbort = 0x0002_0000,
    /// TABORT executed.
    TabortInstr = 0x0001_0000,
    /// Instruction not allowed in a constrained transaction.
    ContranInstr = 0x0000_8000,
    /// Backward or non-relative branch in a constrained transaction.
    ContranBranch = 0x0000_4000,
    /// Relative branch leaving a constrained region.
    ContranRelativeBranch = 0x0000_2000,
    /// Instruction restricted in any transaction.
    TranInstr = 0x0000_1000,
    /// Floating-point instruction while float is disallowed.
    TranFloatInstr = 0x0000_0800,
    /// Access-register instruction while AR modification is disallowed.
    TranAccessInstr = 0x0000_0400,
    /// Non-relative branch restricted in a transaction.
    TranNonrelativeBranch = 0x0000_0200,
    /// Branch-and-set-mode in a transaction.
    TranBranchSetMode = 0x0000_0100,
    /// Set-addressing-mode in a transaction.
    TranSetAddressingMode = 0x0000_0080,
    /// Miscellaneous restricted instruction.
    TranMiscInstr = 0x0000_0040,
    /// Nesting depth exceeded.
    Nesting = 0x0000_0020,
    /// Page capture could not be performed.
    CaptureFail = 0x0000_0010,
}

impl AbortReason {
    /// Every reason in descending bit order.
    pub const ALL: [Self; 28] = [
        Self::InstrAddr,
        Self::InstrCount,
        Self::RandAbort,
        Self::CspInstr,
        Self::CspgInstr,
        Self::SieExit,
        Self::Conflict,
        Self::MaxPages,
        Self::ExtInt,
        Self::UnfiltInt,
        Self::FiltInt,
        Self::RestartInt,
        Self::IoInt,
        Self::MckInt,
        Self::DelayedAbort,
        Self::TabortInstr,
        Self::ContranInstr,
        Self::ContranBranch,
        Self::ContranRelativeBranch,
        Self::TranInstr,
        Self::TranFloatInstr,
        Self::TranAccessInstr,
        Self::TranNonrelativeBranch,
        Self::TranBranchSetMode,
        Self::TranSetAddressingMode,
        Self::TranMiscInstr,
        Self::Nesting,
        Self::CaptureFail,
    ];

    /// Reasons ordered from most to least dominant.
    ///
    /// The first reason present in a set decides the abort code.
    pub const PRECEDENCE: [Self; 28] = [
        Self::Nesting,
        Self::MaxPages,
        Self::CaptureFail,
        Self::Conflict,
        Self::MckInt,
        Self::ExtInt,
        Self::IoInt,
        Self::RestartInt,
        Self::UnfiltInt,
        Self::FiltInt,
        Self::TabortInstr,
        Self::ContranInstr,
        Self::ContranBranch,
        Self::ContranRelativeBranch,
        Self::TranInstr,
        Self::TranFloatInstr,
        Self::TranAccessInstr,
        Self::TranNonrelativeBranch,
        Self::TranBranchSetMode,
        Self::TranSetAddressingMode,
        Self::TranMiscInstr,
        Self::InstrCount,
        Self::InstrAddr,
        Self::CspInstr,
        Self::CspgInstr,
        Self::SieExit,
        Self::RandAbort,
        Self::DelayedAbort,
    ];

    /// Returns the diagnostic bit for this reason.
    #[must_use]
    pub const fn bit(self) -> u32 {
        self as u32
    }

    /// Returns the short diagnostic name used in trace output.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::InstrAddr => "INSTRADDR",
            Self::InstrCount => "INSTRCOUNT",
            Self::RandAbort => "RAND_ABORT",
            Self::CspInstr => "CSP_INSTR",
            Self::CspgInstr => "CSPG_INSTR",
            Self::SieExit => "SIE_EXIT",
            Self::Conflict => "CONFLICT",
            Self::MaxPages => "MAX_PAGES",
            Self::ExtInt => "EXT_INT",
            Self::UnfiltInt => "UNFILT_INT",
            Self::FiltInt => "FILT_INT",
            Self::RestartInt => "RESTART_INT",
            Self::IoInt => "IO_INT",
            Self::MckInt => "MCK_INT",
            Self::DelayedAbort => "DELAYED_ABORT",
            Self::TabortInstr => "TABORT_INSTR",
            Self::ContranInstr => "CONTRAN_INSTR",
            Self::ContranBranch => "CONTRAN_BRANCH",
            Self::ContranRelativeBranch => "CONTRAN_RELATIVE_BRANCH",
            Self::TranInstr => "TRAN_INSTR",
            Self::TranFloatInstr => "TRAN_FLOAT_INSTR",
            Self::TranAccessInstr => "TRAN_ACCESS_INSTR",
            Self::TranNonrelativeBranch => "TRAN_NONRELATIVE_BRANCH",
            Self::TranBranchSetMode => "TRAN_BRANCH_SET_MODE",
            Self::TranSetAddressingMode => "TRAN_SET_ADDRESSING_MODE",
            Self::TranMiscInstr => "TRAN_MISC_INSTR",
            Self::Nesting => "NESTING",
            Self::CaptureFail => "CAPTURE_FAIL",
        }
    }

    /// Resource exhaustion always unwinds to the outermost frame.
    #[must_use]
    pub const fn is_resource(self) -> bool {
        matches!(self, Self::Nesting | Self::MaxPages | Self::CaptureFail)
    }

    /// Architected interruptions delivered after the abort completes.
    #[must_use]
    pub const fn is_interruption(self) -> bool {
        matches!(
            self,
            Self::ExtInt | Self::UnfiltInt | Self::RestartInt | Self::IoInt | Self::MckInt
        )
    }

    /// Restricted-instruction reasons reported as `TAC_INSTR`.
    #[must_use]
    pub const fn is_instruction_restriction(self) -> bool {
        matches!(
            self,
            Self::ContranInstr
                | Self::ContranBranch
                | Self::ContranRelativeBranch
                | Self::TranInstr
                | Self::TranFloatInstr
                | Self::TranAccessInstr
                | Self::TranNonrelativeBranch
                | Self::TranBranchSetMode
                | Self::TranSetAddressingMode
                | Self::TranMiscInstr
        )
    }

    /// Reasons a constrained transaction can never succeed past by retrying.
    #[must_use]
    pub const fn violates_constraint(self) -> bool {
        self.is_instruction_restriction()
            || matches!(
                self,
                Self::InstrCount | Self::InstrAddr | Self::Nesting | Self::MaxPages
            )
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of contributing abort reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct AbortReasons(u32);

impl AbortReasons {
    /// The empty set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Builds a set from raw diagnostic bits, dropping undefined bits.
    #[must_use]
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::defined_bits())
    }

    const fn defined_bits() -> u32 {
        let mut bits = 0;
        let mut index = 0;
        while index < AbortReason::ALL.len() {
            bits |= AbortReason::ALL[index].bit();
            index += 1;
        }
        bits
    }

    /// Raw diagnostic bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns `true` when no reason is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` when `reason` is set.
    #[must_use]
    pub const fn contains(self, reason: AbortReason) -> bool {
        self.0 & reason.bit() != 0
    }

    /// Adds `reason` to the set.
    pub fn insert(&mut self, reason: AbortReason) {
        self.0 |= reason.bit();
    }

    /// Returns the set with `reason` added.
    #[must_use]
    pub const fn with(self, reason: AbortReason) -> Self {
        Self(self.0 | reason.bit())
    }

    /// Returns the union of two sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Iterates the set in descending bit order.
    pub fn iter(self) -> impl Iterator<Item = AbortReason> {
        AbortReason::ALL
            .into_iter()
            .filter(move |reason| self.contains(*reason))
    }

    /// Returns the highest-precedence reason in the set.
    #[must_use]
    pub fn dominant(self) -> Option<AbortReason> {
        AbortReason::PRECEDENCE
            .into_iter()
            .find(|reason| self.contains(*reason))
    }

    /// Returns `true` when any reason requires unwinding to the outermost frame.
    #[must_use]
    pub fn has_resource_reason(self) -> bool {
        self.iter().any(AbortReason::is_resource)
    }
}

impl From<AbortReason> for AbortReasons {
    fn from(reason: AbortReason) -> Self {
        Self(reason.bit())
    }
}

impl FromIterator<AbortReason> for AbortReasons {
    fn from_iter<I: IntoIterator<Item = AbortReason>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), Self::with)
    }
}

impl fmt::Display for AbortReasons {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("(none)");
        }
        for (index, reason) in self.iter().enumerate() {
            if index > 0 {
                f.write_str(" ")?;
            }
            f.write_str(reason.name())?;
        }
        Ok(())
    }
}

/// Condition code set on the abort path of TBEGIN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u8)]
pub enum ConditionCode {
    /// Transaction initiated or committed.
    Success = 0,
    /// Indeterminate condition.
    Indeterminate = 1,
    /// Transient condition; retry may succeed.
    Transient = 2,
    /// Persistent condition; retry is unlikely to succeed.
    Persistent = 3,
}

impl ConditionCode {
    /// Returns the two-bit condition code value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Guest-visible transaction abort code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum AbortCode {
    /// TAC 2.
    #[error("External interruption")]
    External,
    /// TAC 4.
    #[error("PGM Interruption (Unfiltered)")]
    UnfilteredProgram,
    /// TAC 5.
    #[error("Machine-check Interruption")]
    MachineCheck,
    /// TAC 6.
    #[error("I/O Interruption")]
    Io,
    /// TAC 7.
    #[error("Fetch overflow")]
    FetchOverflow,
    /// TAC 8.
    #[error("Store overflow")]
    StoreOverflow,
    /// TAC 9.
    #[error("Fetch conflict")]
    FetchConflict,
    /// TAC 10.
    #[error("Store conflict")]
    StoreConflict,
    /// TAC 11.
    #[error("Restricted instruction")]
    RestrictedInstruction,
    /// TAC 12.
    #[error("PGM Interruption (Filtered)")]
    FilteredProgram,
    /// TAC 13.
    #[error("Nesting Depth exceeded")]
    Nesting,
    /// TAC 14.
    #[error("Cache (fetch related)")]
    FetchOther,
    /// TAC 15.
    #[error("Cache (store related)")]
    StoreOther,
    /// TAC 16.
    #[error("Cache (other)")]
    CacheOther,
    /// TAC 19.
    #[error("Guarded-Storage Event related")]
    Guarded,
    /// TAC 255.
    #[error("Miscellaneous condition")]
    Misc,
    /// TABORT operand, always 256 or above.
    #[error("TABORT instruction (code {0})")]
    Explicit(u64),
}

impl AbortCode {
    /// Returns the 64-bit value stored in the diagnostic block.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        match self {
            Self::External => 2,
            Self::UnfilteredProgram => 4,
            Self::MachineCheck => 5,
            Self::Io => 6,
            Self::FetchOverflow => 7,
            Self::StoreOverflow => 8,
            Self::FetchConflict => 9,
            Self::StoreConflict => 10,
            Self::RestrictedInstruction => 11,
            Self::FilteredProgram => 12,
            Self::Nesting => 13,
            Self::FetchOther => 14,
            Self::StoreOther => 15,
            Self::CacheOther => 16,
            Self::Guarded => 19,
            Self::Misc => 255,
            Self::Explicit(code) => code,
        }
    }

    /// Decodes a stored abort code.
    #[must_use]
    pub const fn from_u64(code: u64) -> Option<Self> {
        match code {
            2 => Some(Self::External),
            4 => Some(Self::UnfilteredProgram),
            5 => Some(Self::MachineCheck),
            6 => Some(Self::Io),
            7 => Some(Self::FetchOverflow),
            8 => Some(Self::StoreOverflow),
            9 => Some(Self::FetchConflict),
            10 => Some(Self::StoreConflict),
            11 => Some(Self::RestrictedInstruction),
            12 => Some(Self::FilteredProgram),
            13 => Some(Self::Nesting),
            14 => Some(Self::FetchOther),
            15 => Some(Self::StoreOther),
            16 => Some(Self::CacheOther),
            19 => Some(Self::Guarded),
            255 => Some(Self::Misc),
            code if code >= TABORT_MIN_CODE => Some(Self::Explicit(code)),
            _ => None,
        }
    }

    /// Symbolic name, e.g. `TAC_STORE_CNF`.
    #[must_use]
    pub const fn short_name(self) -> &'static str {
        match self {
            Self::External => "TAC_EXT",
            Self::UnfilteredProgram => "TAC_UPGM",
            Self::MachineCheck => "TAC_MCK",
            Self::Io => "TAC_IO",
            Self::FetchOverflow => "TAC_FETCH_OVF",
            Self::StoreOverflow => "TAC_STORE_OVF",
            Self::FetchConflict => "TAC_FETCH_CNF",
            Self::StoreConflict => "TAC_STORE_CNF",
            Self::RestrictedInstruction => "TAC_INSTR",
            Self::FilteredProgram => "TAC_FPGM",
            Self::Nesting => "TAC_NESTING",
            Self::FetchOther => "TAC_FETCH_OTH",
            Self::StoreOther => "TAC_STORE_OTH",
            Self::CacheOther => "TAC_CACHE_OTH",
            Self::Guarded => "TAC_GUARDED",
            Self::Misc => "TAC_MISC",
            Self::Explicit(_) => "TAC_TABORT",
        }
    }

    /// Condition code reported to the guest for this abort code.
    #[must_use]
    pub const fn condition_code(self) -> ConditionCode {
        match self {
            Self::FetchOverflow
            | Self::StoreOverflow
            | Self::RestrictedInstruction
            | Self::Nesting
            | Self::UnfilteredProgram
            | Self::FilteredProgram => ConditionCode::Persistent,
            Self::Explicit(code) if code % 2 == 1 => ConditionCode::Persistent,
            _ => ConditionCode::Transient,
        }
    }

    /// Returns `true` for fetch and store conflicts.
    #[must_use]
    pub const fn is_conflict(self) -> bool {
        matches!(self, Self::FetchConflict | Self::StoreConflict)
    }

    /// Returns `true` for program-interruption codes.
    #[must_use]
    pub const fn is_program(self) -> bool {
        matches!(self, Self::UnfilteredProgram | Self::FilteredProgram)
    }
}

/// Program-interruption filtering class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum ExceptionClass {
    /// Class 1: never filtered.
    Nonfilterable,
    /// Class 2: access exceptions, filtered at PIFC 2.
    Access,
    /// Class 3: arithmetic exceptions, filtered at PIFC 1 and 2.
    Arithmetic,
}

impl ExceptionClass {
    /// Returns `true` when program-interruption filtering control `pifc` suppresses this class.
    #[must_use]
    pub const fn filtered_by(self, pifc: u8) -> bool {
        match self {
            Self::Nonfilterable => false,
            Self::Access => pifc >= 2,
            Self::Arithmetic => pifc >= 1,
        }
    }
}

/// Program exception raised while a transaction is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct ProgramException {
    /// Program interruption code.
    pub code: u16,
    /// Exception access identifier.
    pub access_id: u8,
    /// Data-exception code.
    pub data_exception: u8,
    /// Translation-exception identifier.
    pub translation_id: u64,
}

impl ProgramException {
    /// Creates an exception with zeroed auxiliary fields.
    #[must_use]
    pub const fn new(code: u16) -> Self {
        Self {
            code,
            access_id: 0,
            data_exception: 0,
            translation_id: 0,
        }
    }

    /// Sets the translation-exception identifier.
    #[must_use]
    pub const fn with_translation_id(mut self, teid: u64) -> Self {
        self.translation_id = teid;
        self
    }

    /// Sets the exception access identifier.
    #[must_use]
    pub const fn with_access_id(mut self, eaid: u8) -> Self {
        self.access_id = eaid;
        self
    }

    /// Sets the data-exception code.
    #[must_use]
    pub const fn with_data_exception(mut self, dxc: u8) -> Self {
        self.data_exception = dxc;
        self
    }

    /// Filtering class of the interruption code.
    #[must_use]
    pub const fn class(&self) -> ExceptionClass {
        match self.code & 0x7F {
            0x04 | 0x05 | 0x10 | 0x11 | 0x38..=0x3B => ExceptionClass::Access,
            0x07..=0x0F | 0x1B => ExceptionClass::Arithmetic,
            _ => ExceptionClass::Nonfilterable,
        }
    }
}

/// Asynchronous interruption arriving while a transaction is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum Interruption {
    /// External interruption.
    External,
    /// I/O interruption.
    Io,
    /// Machine-check interruption.
    MachineCheck,
    /// Restart interruption.
    Restart,
    /// Program interruption left unfiltered.
    Program(ProgramException),
}

impl Interruption {
    /// Abort reason recorded for this interruption.
    #[must_use]
    pub const fn reason(self) -> AbortReason {
        match self {
            Self::External => AbortReason::ExtInt,
            Self::Io => AbortReason::IoInt,
            Self::MachineCheck => AbortReason::MckInt,
            Self::Restart => AbortReason::RestartInt,
            Self::Program(_) => AbortReason::UnfiltInt,
        }
    }
}

/// Everything known about why an attempt must abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct AbortRequest {
    /// Contributing reasons.
    pub reasons: AbortReasons,
    /// Access that raised an overflow or conflict.
    pub intent: Option<AccessIntent>,
    /// Identity of the conflicting cache line.
    pub token: Option<ConflictToken>,
    /// TABORT operand.
    pub tabort_code: Option<u64>,
    /// Program exception details.
    pub exception: Option<ProgramException>,
    /// Interruption to deliver once the abort completes.
    pub interruption: Option<Interruption>,
}

impl AbortRequest {
    /// Request carrying a single reason.
    #[must_use]
    pub fn new(reason: AbortReason) -> Self {
        Self {
            reasons: reason.into(),
            ..Self::default()
        }
    }

    /// Cache-line conflict raised by an access with `intent`.
    #[must_use]
    pub fn conflict(intent: AccessIntent, token: ConflictToken) -> Self {
        Self {
            intent: Some(intent),
            token: Some(token),
            ..Self::new(AbortReason::Conflict)
        }
    }

    /// Page limit exceeded by an access with `intent`.
    #[must_use]
    pub fn overflow(intent: AccessIntent) -> Self {
        Self {
            intent: Some(intent),
            ..Self::new(AbortReason::MaxPages)
        }
    }

    /// Page capture failure.
    #[must_use]
    pub fn capture_failure(intent: AccessIntent) -> Self {
        Self {
            intent: Some(intent),
            ..Self::new(AbortReason::CaptureFail)
        }
    }

    /// Explicit TABORT with operand `code`.
    #[must_use]
    pub fn tabort(code: u64) -> Self {
        Self {
            tabort_code: Some(code),
            ..Self::new(AbortReason::TabortInstr)
        }
    }

    /// Program exception, filtered or not.
    #[must_use]
    pub fn program(exception: ProgramException, filtered: bool) -> Self {
        if filtered {
            Self {
                exception: Some(exception),
                ..Self::new(AbortReason::FiltInt)
            }
        } else {
            Self {
                exception: Some(exception),
                interruption: Some(Interruption::Program(exception)),
                ..Self::new(AbortReason::UnfiltInt)
            }
        }
    }

    /// Asynchronous interruption.
    #[must_use]
    pub fn interruption(interruption: Interruption) -> Self {
        let exception = match interruption {
            Interruption::Program(exception) => Some(exception),
            _ => None,
        };
        Self {
            interruption: Some(interruption),
            exception,
            ..Self::new(interruption.reason())
        }
    }

    /// Returns the request with an extra reason.
    #[must_use]
    pub fn with_reason(mut self, reason: AbortReason) -> Self {
        self.reasons.insert(reason);
        self
    }

    /// Folds `other` into this request, keeping details already present.
    pub fn merge(&mut self, other: Self) {
        self.reasons = self.reasons.union(other.reasons);
        self.intent = self.intent.or(other.intent);
        self.token = self.token.or(other.token);
        self.tabort_code = self.tabort_code.or(other.tabort_code);
        self.exception = self.exception.or(other.exception);
        self.interruption = self.interruption.or(other.interruption);
    }

    /// Collapses the reasons into the single guest-visible abort code.
    #[must_use]
    pub fn abort_code(&self) -> AbortCode {
        let stored = matches!(self.intent, Some(AccessIntent::Store));
        let Some(dominant) = self.reasons.dominant() else {
            return AbortCode::Misc;
        };
        match dominant {
            AbortReason::Nesting => AbortCode::Nesting,
            AbortReason::MaxPages if stored => AbortCode::StoreOverflow,
            AbortReason::MaxPages => AbortCode::FetchOverflow,
            AbortReason::CaptureFail => AbortCode::CacheOther,
            AbortReason::Conflict if stored => AbortCode::StoreConflict,
            AbortReason::Conflict => AbortCode::FetchConflict,
            AbortReason::MckInt => AbortCode::MachineCheck,
            AbortReason::ExtInt => AbortCode::External,
            AbortReason::IoInt => AbortCode::Io,
            AbortReason::UnfiltInt => AbortCode::UnfilteredProgram,
            AbortReason::FiltInt => AbortCode::FilteredProgram,
            AbortReason::TabortInstr => {
                AbortCode::Explicit(self.tabort_code.unwrap_or(TABORT_MIN_CODE))
            }
            reason if reason.is_instruction_restriction() => AbortCode::RestrictedInstruction,
            _ => AbortCode::Misc,
        }
    }
}
