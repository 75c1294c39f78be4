//! The one resource shared by every emulated processor.

use crate::conflict::{ConflictDetector, CpuId, LineId};
use crate::error::AccessDenied;
use crate::memory::arena::checked_range;
use crate::memory::{
    line_of, page_chunks, page_offset, ArenaError, PageArena, PageHandle, CACHE_LINE_SHIFT,
    PAGE_SIZE,
};

/// Live storage plus the line-ownership index guarding it.
#[derive(Debug)]
pub struct SharedStorage {
    arena: PageArena,
    detector: ConflictDetector,
}

impl SharedStorage {
    /// Creates `frames` zeroed frames shared by `cpus` processors.
    #[must_use]
    pub fn new(frames: u32, cpus: u16) -> Self {
        Self {
            arena: PageArena::new(frames),
            detector: ConflictDetector::new(frames, cpus),
        }
    }

    /// Live page frames.
    #[must_use]
    pub const fn arena(&self) -> &PageArena {
        &self.arena
    }

    /// Line-ownership index.
    #[must_use]
    pub const fn detector(&self) -> &ConflictDetector {
        &self.detector
    }

    /// Reads bytes outside any transaction.
    ///
    /// # Errors
    ///
    /// Returns [`AccessDenied::Busy`] when an open transaction on another
    /// processor owns one of the lines; that transaction is doomed.
    pub fn fetch_nontransactional(
        &self,
        accessor: Option<CpuId>,
        frame: PageHandle,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<(), AccessDenied> {
        let range = checked_range(offset, buf.len())?;
        let live = self.arena.frame(frame)?.read();
        self.check_lines(accessor, frame, offset, buf.len())?;
        buf.copy_from_slice(&live[range]);
        Ok(())
    }

    /// Writes bytes outside any transaction.
    ///
    /// The ownership check and the copy both happen under the frame's write
    /// lock, so an owner that claims a line concurrently captures either the
    /// old or the new bytes, never a mix.
    ///
    /// # Errors
    ///
    /// Returns [`AccessDenied::Busy`] when an open transaction on another
    /// processor owns one of the lines; that transaction is doomed.
    pub fn store_nontransactional(
        &self,
        accessor: Option<CpuId>,
        frame: PageHandle,
        offset: usize,
        data: &[u8],
    ) -> Result<(), AccessDenied> {
        let range = checked_range(offset, data.len())?;
        let mut live = self.arena.frame(frame)?.write();
        self.check_lines(accessor, frame, offset, data.len())?;
        live[range].copy_from_slice(data);
        Ok(())
    }

    /// Reads bytes at a real address, splitting at page boundaries.
    ///
    /// # Errors
    ///
    /// See [`SharedStorage::fetch_nontransactional`].
    pub fn fetch_real(
        &self,
        accessor: Option<CpuId>,
        real_addr: u64,
        buf: &mut [u8],
    ) -> Result<(), AccessDenied> {
        for (addr, range) in page_chunks(real_addr, buf.len()) {
            self.fetch_nontransactional(
                accessor,
                real_frame(addr)?,
                page_offset(addr),
                &mut buf[range],
            )?;
        }
        Ok(())
    }

    /// Writes bytes at a real address, splitting at page boundaries.
    ///
    /// Pages before a refused page keep the bytes already written.
    ///
    /// # Errors
    ///
    /// See [`SharedStorage::store_nontransactional`].
    pub fn store_real(
        &self,
        accessor: Option<CpuId>,
        real_addr: u64,
        data: &[u8],
    ) -> Result<(), AccessDenied> {
        for (addr, range) in page_chunks(real_addr, data.len()) {
            self.store_nontransactional(
                accessor,
                real_frame(addr)?,
                page_offset(addr),
                &data[range],
            )?;
        }
        Ok(())
    }

    fn check_lines(
        &self,
        accessor: Option<CpuId>,
        frame: PageHandle,
        offset: usize,
        len: usize,
    ) -> Result<(), AccessDenied> {
        if len == 0 {
            return Ok(());
        }
        let first = offset >> CACHE_LINE_SHIFT;
        let last = (offset + len - 1) >> CACHE_LINE_SHIFT;
        for line in first..=last {
            self.detector
                .check_nontransactional(accessor, LineId::new(frame, line))
                .map_err(|conflict| AccessDenied::Busy {
                    token: conflict.token(),
                    owner: conflict.owner.owner,
                })?;
        }
        Ok(())
    }
}

fn real_frame(real_addr: u64) -> Result<PageHandle, ArenaError> {
    u32::try_from(real_addr / PAGE_SIZE as u64)
        .map(PageHandle::new)
        .map_err(|_| ArenaError::AddressOutOfRange(real_addr))
}

/// Line of a real address, for callers that track lines themselves.
///
/// Returns `None` when the frame index does not fit a [`PageHandle`].
#[must_use]
pub fn real_line(real_addr: u64) -> Option<LineId> {
    real_frame(real_addr)
        .ok()
        .map(|frame| LineId::new(frame, line_of(real_addr)))
}

#[cfg(test)]
mod tests {
    use super::{real_line, SharedStorage};
    use crate::capture::AccessIntent;
    use crate::conflict::CpuId;
    use crate::error::AccessDenied;
    use crate::memory::{ArenaError, PageHandle};

    #[test]
    fn unowned_lines_are_plain_memory() {
        let storage = SharedStorage::new(2, 2);
        storage
            .store_real(None, 0x0FFE, &[1, 2, 3, 4])
            .expect("free lines");
        let mut buf = [0; 4];
        storage.fetch_real(None, 0x0FFE, &mut buf).expect("free lines");
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn owned_line_refuses_other_processors() {
        let storage = SharedStorage::new(1, 2);
        let owner = CpuId::new(0);
        storage.detector().activate(owner, 1);
        storage
            .detector()
            .claim(
                owner,
                1,
                real_line(0x40).expect("low address"),
                AccessIntent::Fetch,
            )
            .expect("free line");
        let denied = storage
            .store_nontransactional(Some(CpuId::new(1)), PageHandle::new(0), 0x40, &[9])
            .expect_err("line is owned");
        assert!(matches!(denied, AccessDenied::Busy { owner: o, .. } if o == owner));
        assert!(storage
            .store_nontransactional(Some(owner), PageHandle::new(0), 0x40, &[9])
            .is_ok());
        assert!(storage.detector().take_doom(owner, 1).is_some());
    }

    #[test]
    fn real_addresses_past_the_frame_index_range_are_refused() {
        let storage = SharedStorage::new(2, 1);
        let high = 1_u64 << 44;
        assert_eq!(
            storage.store_real(None, high, &[0x77]),
            Err(AccessDenied::Arena(ArenaError::AddressOutOfRange(high)))
        );
        let mut buf = [0_u8];
        assert_eq!(
            storage.fetch_real(None, high, &mut buf),
            Err(AccessDenied::Arena(ArenaError::AddressOutOfRange(high)))
        );
        storage.fetch_real(None, 0, &mut buf).expect("frame 0 exists");
        assert_eq!(buf, [0]);
        assert_eq!(real_line(high), None);
    }
}
