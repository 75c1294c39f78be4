//! Transaction diagnostic block (TDB): the 256-byte record the guest inspects after an abort.
//!
//! All multi-byte fields are big-endian, matching guest storage order.

use thiserror::Error;

use crate::cause::{AbortCode, AbortRequest};
use crate::state::GeneralRegisters;

/// Size of the diagnostic block in bytes.
pub const TDB_SIZE: usize = 256;

/// Offset of the format byte.
pub const TDB_FORMAT_OFFSET: usize = 0x00;
/// Offset of the flag byte.
pub const TDB_FLAGS_OFFSET: usize = 0x01;
/// Offset of the transaction nesting depth halfword.
pub const TDB_TND_OFFSET: usize = 0x06;
/// Offset of the transaction abort code doubleword.
pub const TDB_TAC_OFFSET: usize = 0x08;
/// Offset of the conflict token doubleword.
pub const TDB_CONFLICT_TOKEN_OFFSET: usize = 0x10;
/// Offset of the aborted-transaction instruction address.
pub const TDB_ATIA_OFFSET: usize = 0x18;
/// Offset of the exception access identifier.
pub const TDB_EAID_OFFSET: usize = 0x20;
/// Offset of the data-exception code.
pub const TDB_DXC_OFFSET: usize = 0x21;
/// Offset of the program-interruption identifier word.
pub const TDB_PIID_OFFSET: usize = 0x24;
/// Offset of the translation-exception identifier.
pub const TDB_TEID_OFFSET: usize = 0x28;
/// Offset of the breaking-event address.
pub const TDB_BEA_OFFSET: usize = 0x30;
/// Offset of general register 0; registers 1..15 follow.
pub const TDB_GPR_OFFSET: usize = 0x80;

/// Format byte of a record the guest must not trust.
pub const TDB_FORMAT_INVALID: u8 = 0;
/// Format byte of a valid record.
pub const TDB_FORMAT_VALID: u8 = 1;
/// Conflict-token validity flag.
pub const TDB_CTV: u8 = 0x80;
/// Constrained-transaction indicator flag.
pub const TDB_CTI: u8 = 0x40;

const _: () = assert_tdb_layout();

const fn assert_tdb_layout() {
    assert!(TDB_GPR_OFFSET + 16 * 8 == TDB_SIZE, "registers end the block");
    assert!(TDB_BEA_OFFSET + 8 + 9 * 8 == TDB_GPR_OFFSET, "nine reserved doublewords");
    assert!(TDB_PIID_OFFSET + 4 == TDB_TEID_OFFSET, "teid follows piid");
}

/// Errors decoding a stored diagnostic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TdbError {
    /// The buffer is not exactly one block long.
    #[error("diagnostic block must be {TDB_SIZE} bytes, got {0}")]
    WrongLength(usize),
    /// The format byte is neither valid nor invalid.
    #[error("unknown diagnostic block format {0}")]
    UnknownFormat(u8),
}

/// Decoded transaction diagnostic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct Tdb {
    /// Format byte.
    pub format: u8,
    /// Flag byte.
    pub flags: u8,
    /// Nesting depth at abort.
    pub nesting_depth: u16,
    /// Raw transaction abort code.
    pub abort_code: u64,
    /// Conflict token.
    pub conflict_token: u64,
    /// Aborted-transaction instruction address.
    pub aborted_instruction_addr: u64,
    /// Exception access identifier.
    pub access_id: u8,
    /// Data-exception code.
    pub data_exception: u8,
    /// Program-interruption identifier.
    pub program_interruption_id: u32,
    /// Translation-exception identifier.
    pub translation_id: u64,
    /// Breaking-event address.
    pub breaking_event_addr: u64,
    /// General registers at abort.
    pub gpr: [u64; 16],
}

impl Tdb {
    /// Record with format invalid and every field zero.
    #[must_use]
    pub const fn invalid() -> Self {
        Self {
            format: TDB_FORMAT_INVALID,
            flags: 0,
            nesting_depth: 0,
            abort_code: 0,
            conflict_token: 0,
            aborted_instruction_addr: 0,
            access_id: 0,
            data_exception: 0,
            program_interruption_id: 0,
            translation_id: 0,
            breaking_event_addr: 0,
            gpr: [0; 16],
        }
    }

    /// Returns `true` when the guest may trust the record.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.format == TDB_FORMAT_VALID
    }

    /// Returns `true` when the conflict token field is meaningful.
    #[must_use]
    pub const fn conflict_token_valid(&self) -> bool {
        self.flags & TDB_CTV != 0
    }

    /// Returns `true` when the abort hit a constrained transaction.
    #[must_use]
    pub const fn constrained(&self) -> bool {
        self.flags & TDB_CTI != 0
    }

    /// Decoded abort code.
    #[must_use]
    pub const fn code(&self) -> Option<AbortCode> {
        AbortCode::from_u64(self.abort_code)
    }

    /// Serializes the record in guest storage order.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; TDB_SIZE] {
        let mut out = [0; TDB_SIZE];
        out[TDB_FORMAT_OFFSET] = self.format;
        out[TDB_FLAGS_OFFSET] = self.flags;
        put(&mut out, TDB_TND_OFFSET, &self.nesting_depth.to_be_bytes());
        put(&mut out, TDB_TAC_OFFSET, &self.abort_code.to_be_bytes());
        put(
            &mut out,
            TDB_CONFLICT_TOKEN_OFFSET,
            &self.conflict_token.to_be_bytes(),
        );
        put(
            &mut out,
            TDB_ATIA_OFFSET,
            &self.aborted_instruction_addr.to_be_bytes(),
        );
        out[TDB_EAID_OFFSET] = self.access_id;
        out[TDB_DXC_OFFSET] = self.data_exception;
        put(
            &mut out,
            TDB_PIID_OFFSET,
            &self.program_interruption_id.to_be_bytes(),
        );
        put(&mut out, TDB_TEID_OFFSET, &self.translation_id.to_be_bytes());
        put(
            &mut out,
            TDB_BEA_OFFSET,
            &self.breaking_event_addr.to_be_bytes(),
        );
        for (index, value) in self.gpr.iter().enumerate() {
            put(&mut out, TDB_GPR_OFFSET + index * 8, &value.to_be_bytes());
        }
        out
    }

    /// Parses a record from guest storage.
    ///
    /// # Errors
    ///
    /// Returns [`TdbError`] for a wrong-sized buffer or unknown format byte.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TdbError> {
        let bytes: &[u8; TDB_SIZE] = bytes
            .try_into()
            .map_err(|_| TdbError::WrongLength(bytes.len()))?;
        let format = bytes[TDB_FORMAT_OFFSET];
        if format != TDB_FORMAT_VALID && format != TDB_FORMAT_INVALID {
            return Err(TdbError::UnknownFormat(format));
        }
        let mut gpr = [0; 16];
        for (index, value) in gpr.iter_mut().enumerate() {
            *value = u64::from_be_bytes(take(bytes, TDB_GPR_OFFSET + index * 8));
        }
        Ok(Self {
            format,
            flags: bytes[TDB_FLAGS_OFFSET],
            nesting_depth: u16::from_be_bytes(take(bytes, TDB_TND_OFFSET)),
            abort_code: u64::from_be_bytes(take(bytes, TDB_TAC_OFFSET)),
            conflict_token: u64::from_be_bytes(take(bytes, TDB_CONFLICT_TOKEN_OFFSET)),
            aborted_instruction_addr: u64::from_be_bytes(take(bytes, TDB_ATIA_OFFSET)),
            access_id: bytes[TDB_EAID_OFFSET],
            data_exception: bytes[TDB_DXC_OFFSET],
            program_interruption_id: u32::from_be_bytes(take(bytes, TDB_PIID_OFFSET)),
            translation_id: u64::from_be_bytes(take(bytes, TDB_TEID_OFFSET)),
            breaking_event_addr: u64::from_be_bytes(take(bytes, TDB_BEA_OFFSET)),
            gpr,
        })
    }
}

fn put(out: &mut [u8; TDB_SIZE], offset: usize, field: &[u8]) {
    out[offset..offset + field.len()].copy_from_slice(field);
}

fn take<const N: usize>(bytes: &[u8; TDB_SIZE], offset: usize) -> [u8; N] {
    let mut field = [0; N];
    field.copy_from_slice(&bytes[offset..offset + N]);
    field
}

/// Transaction facts the diagnostic block records besides the abort cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiagnosticContext {
    /// Nesting depth when the abort was raised.
    pub nesting_depth: u16,
    /// Whether the aborted transaction was constrained.
    pub constrained: bool,
    /// Whether the absorbing TBEGIN asked for a diagnostic block.
    pub capture_requested: bool,
    /// Breaking-event address register.
    pub breaking_event_addr: u64,
}

/// Builder for abort diagnostic blocks.
#[derive(Debug, Clone, Copy, Default)]
pub struct AbortDiagnostics;

impl AbortDiagnostics {
    /// Renders the diagnostic block for an abort.
    ///
    /// Exception fields are filled only for program-interruption codes. When
    /// capture was not requested the result is [`Tdb::invalid`].
    #[must_use]
    pub fn build(
        request: &AbortRequest,
        registers: &GeneralRegisters,
        instruction_addr: u64,
        context: &DiagnosticContext,
    ) -> Tdb {
        if !context.capture_requested {
            return Tdb::invalid();
        }
        let code = request.abort_code();
        let mut flags = 0;
        let mut conflict_token = 0;
        if let (true, Some(token)) = (code.is_conflict(), request.token) {
            flags |= TDB_CTV;
            conflict_token = token.raw();
        }
        if context.constrained {
            flags |= TDB_CTI;
        }
        let exception = request.exception.filter(|_| code.is_program());
        Tdb {
            format: TDB_FORMAT_VALID,
            flags,
            nesting_depth: context.nesting_depth,
            abort_code: code.as_u64(),
            conflict_token,
            aborted_instruction_addr: instruction_addr,
            access_id: exception.map_or(0, |exception| exception.access_id),
            data_exception: exception.map_or(0, |exception| exception.data_exception),
            program_interruption_id: exception.map_or(0, |exception| u32::from(exception.code)),
            translation_id: exception.map_or(0, |exception| exception.translation_id),
            breaking_event_addr: context.breaking_event_addr,
            gpr: registers.values(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        AbortDiagnostics, DiagnosticContext, Tdb, TdbError, TDB_CTI, TDB_CTV, TDB_FORMAT_VALID,
        TDB_SIZE,
    };
    use crate::capture::AccessIntent;
    use crate::cause::{AbortCode, AbortReason, AbortRequest, ProgramException};
    use crate::conflict::ConflictToken;
    use crate::state::{GeneralRegister, GeneralRegisters};

    fn context(capture_requested: bool) -> DiagnosticContext {
        DiagnosticContext {
            nesting_depth: 2,
            constrained: false,
            capture_requested,
            breaking_event_addr: 0x4000,
        }
    }

    #[test]
    fn store_conflict_block_layout() {
        let mut registers = GeneralRegisters::default();
        registers.write(GeneralRegister::R15, 0x1122_3344_5566_7788);
        let request = AbortRequest::conflict(AccessIntent::Store, ConflictToken::new(0x3100));
        let tdb = AbortDiagnostics::build(&request, &registers, 0x8000, &context(true));
        let bytes = tdb.to_bytes();
        assert_eq!(bytes.len(), TDB_SIZE);
        assert_eq!(bytes[0], TDB_FORMAT_VALID);
        assert_eq!(bytes[1], TDB_CTV);
        assert_eq!(&bytes[6..8], &[0, 2]);
        assert_eq!(&bytes[8..16], &10_u64.to_be_bytes());
        assert_eq!(&bytes[16..24], &0x3100_u64.to_be_bytes());
        assert_eq!(&bytes[24..32], &0x8000_u64.to_be_bytes());
        assert_eq!(&bytes[48..56], &0x4000_u64.to_be_bytes());
        assert_eq!(&bytes[248..256], &0x1122_3344_5566_7788_u64.to_be_bytes());
        assert_eq!(Tdb::from_bytes(&bytes), Ok(tdb));
    }

    #[test]
    fn uncaptured_block_is_invalid() {
        let request = AbortRequest::tabort(300);
        let tdb = AbortDiagnostics::build(
            &request,
            &GeneralRegisters::default(),
            0x10,
            &context(false),
        );
        assert!(!tdb.is_valid());
        assert_eq!(tdb.to_bytes(), [0; TDB_SIZE]);
    }

    #[test]
    fn exception_fields_only_for_program_codes() {
        let exception = ProgramException::new(0x0011)
            .with_translation_id(0x7000)
            .with_access_id(3);
        let program = AbortRequest::program(exception, false);
        let tdb = AbortDiagnostics::build(
            &program,
            &GeneralRegisters::default(),
            0,
            &DiagnosticContext {
                constrained: true,
                ..context(true)
            },
        );
        assert_eq!(tdb.code(), Some(AbortCode::UnfilteredProgram));
        assert_eq!(tdb.translation_id, 0x7000);
        assert_eq!(tdb.access_id, 3);
        assert_eq!(tdb.program_interruption_id, 0x11);
        assert_eq!(tdb.flags, TDB_CTI);

        let mut masked = program.with_reason(AbortReason::Nesting);
        masked.token = Some(ConflictToken::new(0x100));
        let tdb = AbortDiagnostics::build(
            &masked,
            &GeneralRegisters::default(),
            0,
            &context(true),
        );
        assert_eq!(tdb.code(), Some(AbortCode::Nesting));
        assert_eq!(tdb.translation_id, 0);
        assert_eq!(tdb.program_interruption_id, 0);
        assert!(!tdb.conflict_token_valid());
    }

    #[test]
    fn decode_rejects_bad_input() {
        assert_eq!(Tdb::from_bytes(&[0; 10]), Err(TdbError::WrongLength(10)));
        let mut bytes = [0; TDB_SIZE];
        bytes[0] = 7;
        assert_eq!(Tdb::from_bytes(&bytes), Err(TdbError::UnknownFormat(7)));
    }
}
