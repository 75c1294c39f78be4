//! Storage geometry and the memory-subsystem collaborators the engine consumes.

/// Live page frames owned by the memory subsystem.
pub mod arena;
/// Virtual-to-real translation contract.
pub mod translate;

use std::ops::Range;

pub use arena::{ArenaError, PageArena, PageBytes, PageHandle};
pub use translate::{AddressTranslator, IdentityTranslator, TranslationFault};

/// IBM z page size in bytes.
pub const PAGE_SIZE: usize = 4096;
/// Mask selecting the byte offset within a page.
pub const PAGE_BYTE_MASK: u64 = 0x0000_0FFF;
/// Mask selecting the page-aligned part of an address.
pub const PAGE_ADDR_MASK: u64 = 0xFFFF_FFFF_FFFF_F000;
/// Cache line size in bytes, the granularity of conflict tracking.
pub const CACHE_LINE_SIZE: usize = 256;
/// Shift converting a byte offset into a cache line index.
pub const CACHE_LINE_SHIFT: u32 = 8;
/// Number of cache lines covering one page.
pub const CACHE_LINES_PER_PAGE: usize = PAGE_SIZE / CACHE_LINE_SIZE;

const _: () = assert_storage_geometry();

const fn assert_storage_geometry() {
    assert!(
        1_usize << CACHE_LINE_SHIFT == CACHE_LINE_SIZE,
        "line shift must match line size"
    );
    assert!(
        PAGE_SIZE % CACHE_LINE_SIZE == 0,
        "pages must hold a whole number of lines"
    );
    assert!(CACHE_LINES_PER_PAGE == 16, "a page covers sixteen lines");
    assert!(
        PAGE_BYTE_MASK + 1 == PAGE_SIZE as u64,
        "byte mask must cover exactly one page"
    );
    assert!(
        !PAGE_ADDR_MASK == PAGE_BYTE_MASK,
        "page and byte masks must be complementary"
    );
}

/// Returns the page-aligned address containing `addr`.
#[must_use]
pub const fn page_of(addr: u64) -> u64 {
    addr & PAGE_ADDR_MASK
}

/// Returns the byte offset of `addr` within its page.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn page_offset(addr: u64) -> usize {
    (addr & PAGE_BYTE_MASK) as usize
}

/// Returns the index (`0..16`) of the cache line holding `addr` within its page.
#[must_use]
pub const fn line_of(addr: u64) -> usize {
    page_offset(addr) >> CACHE_LINE_SHIFT
}

/// Returns the byte range a cache line occupies within its page.
#[must_use]
pub const fn line_range(line: usize) -> Range<usize> {
    let start = line * CACHE_LINE_SIZE;
    start..start + CACHE_LINE_SIZE
}

/// Yields the line-aligned address of every cache line overlapped by
/// `len` bytes starting at `addr`, in ascending order.
pub fn lines_spanned(addr: u64, len: usize) -> impl Iterator<Item = u64> {
    let first = addr >> CACHE_LINE_SHIFT;
    let last = if len == 0 {
        None
    } else {
        Some(addr.saturating_add(len as u64 - 1) >> CACHE_LINE_SHIFT)
    };
    last.into_iter()
        .flat_map(move |last| first..=last)
        .map(|line| line << CACHE_LINE_SHIFT)
}

/// Splits `len` bytes starting at `addr` at page boundaries.
///
/// Each item is the chunk's start address and the matching range within the
/// caller's buffer.
pub fn page_chunks(addr: u64, len: usize) -> impl Iterator<Item = (u64, Range<usize>)> {
    let mut done = 0_usize;
    std::iter::from_fn(move || {
        if done >= len {
            return None;
        }
        let chunk_addr = addr.wrapping_add(done as u64);
        let room = PAGE_SIZE - page_offset(chunk_addr);
        let take = room.min(len - done);
        let range = done..done + take;
        done += take;
        Some((chunk_addr, range))
    })
}
