//! Per-attempt page capture: copy-on-first-touch snapshots with line-level state.
//!
//! Live page buffers stay with the [`PageArena`]; a [`PageMapEntry`] only
//! records which frame backs a virtual page, the per-line access state, and
//! the snapshot this attempt owns. Transactional stores mutate the live frame
//! in place, so commit only drops snapshots and abort writes the STORED lines
//! back.

use thiserror::Error;
use tracing::{trace, warn};

use crate::memory::{
    line_of, line_range, ArenaError, PageArena, PageBytes, PageHandle, CACHE_LINES_PER_PAGE,
    CACHE_LINE_SIZE, PAGE_ADDR_MASK,
};

/// Kind of storage access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum AccessIntent {
    /// Storage read.
    Fetch,
    /// Storage write.
    Store,
}

/// Access state of one cache line within an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u8)]
pub enum LineState {
    /// Untouched by this attempt.
    #[default]
    Clean = 0,
    /// Read by this attempt.
    Fetched = 1,
    /// Written by this attempt.
    Stored = 2,
}

impl LineState {
    /// State after an access with `intent`. Never regresses.
    #[must_use]
    pub const fn after(self, intent: AccessIntent) -> Self {
        match (self, intent) {
            (Self::Stored, _) | (_, AccessIntent::Store) => Self::Stored,
            (Self::Clean | Self::Fetched, AccessIntent::Fetch) => Self::Fetched,
        }
    }
}

/// Failures while capturing page contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CaptureError {
    /// Mapping one more page would exceed the per-attempt page limit.
    #[error("page limit of {limit} reached")]
    PageLimit {
        /// Configured limit.
        limit: usize,
    },
    /// The live frame could not be copied within the bounded number of tries.
    #[error("could not capture {frame} after {tries} tries")]
    CaptureFailed {
        /// Frame that stayed write-locked.
        frame: PageHandle,
        /// Attempts made.
        tries: u32,
    },
    /// The frame is not part of the arena.
    #[error(transparent)]
    Arena(#[from] ArenaError),
}

/// State transition produced by a [`PageCaptureStore::touch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineTouch {
    /// Line state before the access.
    pub previous: LineState,
    /// Line state after the access.
    pub current: LineState,
}

impl LineTouch {
    /// Returns `true` when the access changed the line state.
    #[must_use]
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

/// One line touched by an attempt, reported with abort events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct TouchedLine {
    /// Page-aligned virtual address.
    pub virtual_page: u64,
    /// Backing frame.
    pub frame: PageHandle,
    /// Line index within the page.
    pub line: usize,
    /// Final state reached.
    pub state: LineState,
}

/// Capture record for one virtual page.
#[derive(Debug)]
pub struct PageMapEntry {
    virtual_page: u64,
    frame: PageHandle,
    snapshot: Option<Box<PageBytes>>,
    lines: [LineState; CACHE_LINES_PER_PAGE],
}

impl PageMapEntry {
    fn new(virtual_page: u64, frame: PageHandle) -> Self {
        Self {
            virtual_page,
            frame,
            snapshot: None,
            lines: [LineState::Clean; CACHE_LINES_PER_PAGE],
        }
    }

    /// Page-aligned virtual address.
    #[must_use]
    pub const fn virtual_page(&self) -> u64 {
        self.virtual_page
    }

    /// Live frame backing the page.
    #[must_use]
    pub const fn frame(&self) -> PageHandle {
        self.frame
    }

    /// Returns `true` once the pre-transaction snapshot exists.
    #[must_use]
    pub const fn has_snapshot(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Pre-transaction snapshot, when taken.
    #[must_use]
    pub fn snapshot(&self) -> Option<&PageBytes> {
        self.snapshot.as_deref()
    }

    /// State of line `line`.
    #[must_use]
    pub fn line_state(&self, line: usize) -> LineState {
        self.lines.get(line).copied().unwrap_or_default()
    }

    /// Lines this attempt has touched.
    pub fn touched(&self) -> impl Iterator<Item = TouchedLine> + '_ {
        self.lines
            .iter()
            .enumerate()
            .filter(|(_, state)| **state != LineState::Clean)
            .map(|(line, state)| TouchedLine {
                virtual_page: self.virtual_page,
                frame: self.frame,
                line,
                state: *state,
            })
    }
}

/// Page map of one transaction attempt, shared by every nesting level.
#[derive(Debug)]
pub struct PageCaptureStore {
    entries: Vec<PageMapEntry>,
    limit: usize,
    capture_tries: u32,
}

impl PageCaptureStore {
    /// Creates an empty store admitting at most `limit` pages.
    #[must_use]
    pub fn new(limit: usize, capture_tries: u32) -> Self {
        Self {
            entries: Vec::with_capacity(limit),
            limit,
            capture_tries: capture_tries.max(1),
        }
    }

    /// Number of mapped pages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when no page is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mapped pages in first-touch order.
    pub fn entries(&self) -> impl Iterator<Item = &PageMapEntry> {
        self.entries.iter()
    }

    /// Entry for the page containing `virtual_addr`.
    #[must_use]
    pub fn entry(&self, virtual_addr: u64) -> Option<&PageMapEntry> {
        let page = virtual_addr & PAGE_ADDR_MASK;
        self.entries.iter().find(|entry| entry.virtual_page == page)
    }

    /// Checks that `virtual_page` is mapped or can still be mapped.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::PageLimit`] when the page is new and the store is full.
    pub fn ensure_room(&self, virtual_page: u64) -> Result<(), CaptureError> {
        if self.entry(virtual_page).is_some() || self.entries.len() < self.limit {
            Ok(())
        } else {
            Err(CaptureError::PageLimit { limit: self.limit })
        }
    }

    /// Records an access to `line` of `virtual_page`.
    ///
    /// The first touch of a page snapshots the whole live frame. A line that
    /// leaves CLEAN after the snapshot was taken has its slice refreshed, so
    /// the snapshot holds each line as it was when this attempt claimed it.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError`] when the page limit is hit, `line` is not a
    /// line of the page, or the frame cannot be copied. The entry is left
    /// unchanged on failure.
    pub fn touch(
        &mut self,
        arena: &PageArena,
        virtual_page: u64,
        frame: PageHandle,
        line: usize,
        intent: AccessIntent,
    ) -> Result<LineTouch, CaptureError> {
        if line >= CACHE_LINES_PER_PAGE {
            return Err(ArenaError::OutOfBounds {
                offset: line.saturating_mul(CACHE_LINE_SIZE),
                len: CACHE_LINE_SIZE,
            }
            .into());
        }
        let virtual_page = virtual_page & PAGE_ADDR_MASK;
        let index = match self.position(virtual_page) {
            Some(index) => index,
            None => {
                self.ensure_room(virtual_page)?;
                self.entries.push(PageMapEntry::new(virtual_page, frame));
                self.entries.len() - 1
            }
        };
        let tries = self.capture_tries;
        let entry = &mut self.entries[index];
        let previous = entry.line_state(line);
        let current = previous.after(intent);
        if previous == current {
            return Ok(LineTouch { previous, current });
        }

        if entry.snapshot.is_none() {
            let copy = capture_page(arena, entry.frame, tries);
            match copy {
                Ok(copy) => entry.snapshot = Some(copy),
                Err(error) => {
                    if entry.lines.iter().all(|state| *state == LineState::Clean) {
                        self.entries.swap_remove(index);
                    }
                    return Err(error);
                }
            }
            trace!(virtual_page, frame = %entry.frame, "page captured");
        } else if previous == LineState::Clean {
            if let Some(snapshot) = entry.snapshot.as_deref_mut() {
                refresh_line(arena, entry.frame, line, snapshot, tries)?;
            }
        }

        entry.lines[line] = current;
        trace!(virtual_page, line, ?previous, ?current, "line state");
        Ok(LineTouch { previous, current })
    }

    /// Line state for `virtual_addr`, `Clean` when unmapped.
    #[must_use]
    pub fn line_state(&self, virtual_addr: u64) -> LineState {
        self.entry(virtual_addr)
            .map_or(LineState::Clean, |entry| entry.line_state(line_of(virtual_addr)))
    }

    /// Every touched line across all pages.
    #[must_use]
    pub fn touched_lines(&self) -> Vec<TouchedLine> {
        self.entries.iter().flat_map(PageMapEntry::touched).collect()
    }

    /// Writes every STORED line back from its snapshot, then drops all entries.
    ///
    /// Each page is restored under its frame's write lock, so no reader sees
    /// a partially restored page. Returns the number of pages dropped.
    pub fn restore_all(&mut self, arena: &PageArena) -> usize {
        for entry in &self.entries {
            let Some(snapshot) = entry.snapshot.as_deref() else {
                continue;
            };
            let Ok(frame) = arena.frame(entry.frame) else {
                continue;
            };
            let mut live = frame.write();
            for (line, _) in entry
                .lines
                .iter()
                .enumerate()
                .filter(|(_, state)| **state == LineState::Stored)
            {
                let range = line_range(line);
                live[range.clone()].copy_from_slice(&snapshot[range]);
            }
        }
        let restored = self.entries.len();
        self.entries.clear();
        restored
    }

    /// Drops every snapshot without restoring. Returns the number of pages dropped.
    pub fn discard_all(&mut self) -> usize {
        let discarded = self.entries.len();
        self.entries.clear();
        discarded
    }

    fn position(&self, virtual_page: u64) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.virtual_page == virtual_page)
    }
}

fn capture_page(
    arena: &PageArena,
    frame: PageHandle,
    tries: u32,
) -> Result<Box<PageBytes>, CaptureError> {
    let lock = arena.frame(frame)?;
    for _ in 0..tries {
        if let Some(live) = lock.try_read() {
            return Ok(Box::new(**live));
        }
        std::hint::spin_loop();
    }
    warn!(%frame, tries, "page capture failed");
    Err(CaptureError::CaptureFailed { frame, tries })
}

fn refresh_line(
    arena: &PageArena,
    frame: PageHandle,
    line: usize,
    snapshot: &mut PageBytes,
    tries: u32,
) -> Result<(), CaptureError> {
    let lock = arena.frame(frame)?;
    let range = line_range(line);
    for _ in 0..tries {
        if let Some(live) = lock.try_read() {
            snapshot[range.clone()].copy_from_slice(&live[range]);
            return Ok(());
        }
        std::hint::spin_loop();
    }
    warn!(%frame, line, tries, "line capture failed");
    Err(CaptureError::CaptureFailed { frame, tries })
}
