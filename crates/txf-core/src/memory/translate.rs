use thiserror::Error;

use super::{page_of, PageHandle, PAGE_SIZE};
use crate::cause::ProgramException;

/// Program interruption code for an addressing exception.
pub const PGM_ADDRESSING_EXCEPTION: u16 = 0x0005;
/// Program interruption code for a page-translation exception.
pub const PGM_PAGE_TRANSLATION_EXCEPTION: u16 = 0x0011;

/// Translation failure reported by the address-translation collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[error("translation of page {virtual_page:#x} failed with program code {code:#06x}")]
pub struct TranslationFault {
    /// Page-aligned virtual address that failed to translate.
    pub virtual_page: u64,
    /// Program interruption code the access would raise.
    pub code: u16,
    /// Translation-exception identification stored with the interruption.
    pub teid: u64,
}

impl TranslationFault {
    /// Page-translation exception for `virtual_page`.
    #[must_use]
    pub const fn page_translation(virtual_page: u64) -> Self {
        let virtual_page = page_of(virtual_page);
        Self {
            virtual_page,
            code: PGM_PAGE_TRANSLATION_EXCEPTION,
            teid: virtual_page,
        }
    }

    /// Addressing exception for `virtual_page`.
    #[must_use]
    pub const fn addressing(virtual_page: u64) -> Self {
        let virtual_page = page_of(virtual_page);
        Self {
            virtual_page,
            code: PGM_ADDRESSING_EXCEPTION,
            teid: 0,
        }
    }

    /// The program exception this fault raises when it hits a transaction.
    #[must_use]
    pub const fn program_exception(&self) -> ProgramException {
        ProgramException::new(self.code).with_translation_id(self.teid)
    }
}

/// Virtual-to-real translation consumed by the transactional access paths.
pub trait AddressTranslator: Send + Sync {
    /// Translates the page containing `virtual_addr` into a live frame.
    ///
    /// # Errors
    ///
    /// Returns a [`TranslationFault`] when the page has no backing frame.
    fn translate(&self, virtual_addr: u64) -> Result<PageHandle, TranslationFault>;
}

/// Maps virtual page `n` onto frame `n` of an arena with `frames` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityTranslator {
    frames: u32,
}

impl IdentityTranslator {
    /// Creates a translator covering `frames` frames.
    #[must_use]
    pub const fn new(frames: u32) -> Self {
        Self { frames }
    }
}

impl AddressTranslator for IdentityTranslator {
    fn translate(&self, virtual_addr: u64) -> Result<PageHandle, TranslationFault> {
        let index = virtual_addr / PAGE_SIZE as u64;
        u32::try_from(index)
            .ok()
            .filter(|index| *index < self.frames)
            .map(PageHandle::new)
            .ok_or_else(|| TranslationFault::addressing(virtual_addr))
    }
}

#[cfg(test)]
mod tests {
    use super::{AddressTranslator, IdentityTranslator, TranslationFault};
    use crate::memory::PageHandle;

    #[test]
    fn identity_maps_page_number_to_frame() {
        let translator = IdentityTranslator::new(4);
        assert_eq!(translator.translate(0x3FFF), Ok(PageHandle::new(3)));
        assert_eq!(
            translator.translate(0x4000),
            Err(TranslationFault::addressing(0x4000))
        );
    }

    #[test]
    fn page_translation_fault_carries_teid() {
        let fault = TranslationFault::page_translation(0x1_2345);
        assert_eq!(fault.virtual_page, 0x1_2000);
        let exception = fault.program_exception();
        assert_eq!(exception.code, 0x0011);
        assert_eq!(exception.translation_id, 0x1_2000);
    }
}
