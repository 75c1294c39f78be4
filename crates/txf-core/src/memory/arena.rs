//! Live page frames owned by the memory subsystem.
//!
//! The transactional engine never owns live storage. It borrows frames from
//! this arena through [`PageHandle`]s and only ever owns the snapshot copies
//! it takes while a transaction is open.

use std::fmt;

use parking_lot::RwLock;
use thiserror::Error;

use super::{CACHE_LINE_SHIFT, PAGE_SIZE};

/// One live 4 KiB page buffer.
pub type PageBytes = [u8; PAGE_SIZE];

/// Index of a live page frame within a [`PageArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct PageHandle(u32);

impl PageHandle {
    /// Creates a handle for frame `index`.
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the raw frame index.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Returns the frame index as a slice index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Real address of the first byte of this frame.
    #[must_use]
    pub const fn real_address(self) -> u64 {
        self.0 as u64 * PAGE_SIZE as u64
    }

    /// Real address of cache line `line` within this frame.
    #[must_use]
    pub const fn line_address(self, line: usize) -> u64 {
        self.real_address() + ((line as u64) << CACHE_LINE_SHIFT)
    }
}

impl fmt::Display for PageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame {:#x}", self.real_address())
    }
}

/// Errors raised by direct arena accesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ArenaError {
    /// The handle does not name a frame of this arena.
    #[error("{0} is not part of the arena")]
    UnknownFrame(PageHandle),
    /// The real address lies beyond any frame index.
    #[error("real address {0:#x} is beyond the addressable frames")]
    AddressOutOfRange(u64),
    /// The access would run past the end of the page.
    #[error("access of {len} bytes at page offset {offset:#x} crosses the page end")]
    OutOfBounds {
        /// Starting byte offset within the page.
        offset: usize,
        /// Access length in bytes.
        len: usize,
    },
}

/// Fixed-size arena of live page frames, each behind its own reader/writer lock.
pub struct PageArena {
    frames: Box<[RwLock<Box<PageBytes>>]>,
}

impl PageArena {
    /// Allocates `frame_count` zeroed frames.
    #[must_use]
    pub fn new(frame_count: u32) -> Self {
        let frames = (0..frame_count)
            .map(|_| RwLock::new(Box::new([0; PAGE_SIZE])))
            .collect();
        Self { frames }
    }

    /// Number of frames in the arena.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn frame_count(&self) -> u32 {
        self.frames.len() as u32
    }

    /// Returns `true` when `handle` names a frame of this arena.
    #[must_use]
    pub fn contains(&self, handle: PageHandle) -> bool {
        handle.index() < self.frames.len()
    }

    pub(crate) fn frame(&self, handle: PageHandle) -> Result<&RwLock<Box<PageBytes>>, ArenaError> {
        self.frames
            .get(handle.index())
            .ok_or(ArenaError::UnknownFrame(handle))
    }

    /// Copies bytes out of a frame without consulting conflict state.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError`] for an unknown frame or a range that leaves the page.
    pub fn read(&self, handle: PageHandle, offset: usize, buf: &mut [u8]) -> Result<(), ArenaError> {
        let range = checked_range(offset, buf.len())?;
        let live = self.frame(handle)?.read();
        buf.copy_from_slice(&live[range]);
        Ok(())
    }

    /// Copies bytes into a frame without consulting conflict state.
    ///
    /// Intended for image loading and for the owning transaction's in-place
    /// stores; other processors go through the conflict-checked paths.
    ///
    /// # Errors
    ///
    /// Returns [`ArenaError`] for an unknown frame or a range that leaves the page.
    pub fn write(&self, handle: PageHandle, offset: usize, data: &[u8]) -> Result<(), ArenaError> {
        let range = checked_range(offset, data.len())?;
        let mut live = self.frame(handle)?.write();
        live[range].copy_from_slice(data);
        Ok(())
    }

    /// Returns a copy of a whole frame.
    #[must_use]
    pub fn page_copy(&self, handle: PageHandle) -> Option<Box<PageBytes>> {
        let live = self.frame(handle).ok()?.read();
        Some(Box::new(**live))
    }
}

impl fmt::Debug for PageArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageArena")
            .field("frames", &self.frames.len())
            .finish()
    }
}

pub(crate) fn checked_range(offset: usize, len: usize) -> Result<std::ops::Range<usize>, ArenaError> {
    match offset.checked_add(len) {
        Some(end) if end <= PAGE_SIZE => Ok(offset..end),
        _ => Err(ArenaError::OutOfBounds { offset, len }),
    }
}
