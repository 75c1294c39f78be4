/// Number of general-purpose registers (`R0..R15`).
pub const GENERAL_REGISTER_COUNT: usize = 16;
/// Number of even/odd register pairs named by a register save mask.
pub const REGISTER_PAIR_COUNT: usize = GENERAL_REGISTER_COUNT / 2;

/// General-purpose register identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u8)]
#[allow(missing_docs)]
pub enum GeneralRegister {
    R0 = 0,
    R1 = 1,
    R2 = 2,
    R3 = 3,
    R4 = 4,
    R5 = 5,
    R6 = 6,
    R7 = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl GeneralRegister {
    /// Ordered list of all general-purpose registers.
    pub const ALL: [Self; GENERAL_REGISTER_COUNT] = [
        Self::R0,
        Self::R1,
        Self::R2,
        Self::R3,
        Self::R4,
        Self::R5,
        Self::R6,
        Self::R7,
        Self::R8,
        Self::R9,
        Self::R10,
        Self::R11,
        Self::R12,
        Self::R13,
        Self::R14,
        Self::R15,
    ];

    /// Returns the array index for this register (`0..=15`).
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Decodes a 4-bit register field.
    #[must_use]
    pub const fn from_u4(bits: u8) -> Option<Self> {
        if bits as usize >= GENERAL_REGISTER_COUNT {
            return None;
        }
        Some(Self::ALL[bits as usize])
    }

    /// Register pair (`0..8`) holding this register.
    #[must_use]
    pub const fn pair(self) -> usize {
        self.index() / 2
    }
}

/// General register save mask from TBEGIN: bit 7 (MSB) names pair R0/R1, bit 0 names R14/R15.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct RegisterSaveMask(u8);

impl RegisterSaveMask {
    /// Saves no registers.
    pub const NONE: Self = Self(0);
    /// Saves all sixteen registers.
    pub const ALL: Self = Self(0xFF);

    /// Wraps the raw eight-bit mask.
    #[must_use]
    pub const fn new(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw mask.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Returns `true` when `register` belongs to a saved pair.
    #[must_use]
    pub const fn saves(self, register: GeneralRegister) -> bool {
        self.0 & (0x80 >> register.pair()) != 0
    }
}

/// The sixteen 64-bit general registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct GeneralRegisters([u64; GENERAL_REGISTER_COUNT]);

impl GeneralRegisters {
    /// Wraps register values in `R0..R15` order.
    #[must_use]
    pub const fn new(values: [u64; GENERAL_REGISTER_COUNT]) -> Self {
        Self(values)
    }

    /// Reads a register.
    #[must_use]
    pub const fn read(&self, register: GeneralRegister) -> u64 {
        self.0[register.index()]
    }

    /// Writes a register.
    #[allow(clippy::missing_const_for_fn)]
    pub fn write(&mut self, register: GeneralRegister, value: u64) {
        self.0[register.index()] = value;
    }

    /// Register values in `R0..R15` order.
    #[must_use]
    pub const fn values(&self) -> [u64; GENERAL_REGISTER_COUNT] {
        self.0
    }

    /// Copies the registers selected by `mask` from `saved`.
    pub fn restore_from(&mut self, saved: &Self, mask: RegisterSaveMask) {
        for register in GeneralRegister::ALL {
            if mask.saves(register) {
                self.write(register, saved.read(register));
            }
        }
    }
}

/// Processor registers the transactional facility reads and restores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct CpuRegisters {
    /// General-purpose registers.
    pub gpr: GeneralRegisters,
    /// Address of the instruction being executed.
    pub instruction_addr: u64,
    /// Breaking-event address register.
    pub breaking_event_addr: u64,
}
