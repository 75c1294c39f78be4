//! Cross-processor cache-line ownership index.
//!
//! Every physical cache line has one atomic claim word. A processor whose
//! transaction touches a line claims it by compare-and-swap, so two
//! processors racing for a free line always resolve with exactly one winner.
//! Non-transactional accessors never claim; when they hit a claimed line they
//! doom the owner instead and are refused until the owner has rolled back.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::capture::{AccessIntent, LineState};
use crate::cause::{AbortReason, AbortRequest};
use crate::memory::{PageHandle, CACHE_LINES_PER_PAGE};

const STATE_BITS: u32 = 2;
const STATE_MASK: u64 = 0b11;
const OWNER_SHIFT: u32 = STATE_BITS;
const OWNER_MASK: u64 = 0xFFFF;
const GENERATION_SHIFT: u32 = OWNER_SHIFT + 16;
/// Attempt generations wrap within this mask.
pub const GENERATION_MASK: u64 = (1 << (64 - GENERATION_SHIFT)) - 1;

/// Emulated processor identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct CpuId(u16);

impl CpuId {
    /// Creates an identifier for processor `raw`.
    #[must_use]
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    /// Raw processor number.
    #[must_use]
    pub const fn raw(self) -> u16 {
        self.0
    }

    const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CP{:02X}", self.0)
    }
}

/// Opaque identity of a conflicting cache line: its real line address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct ConflictToken(u64);

impl ConflictToken {
    /// Wraps a raw token value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value stored in the diagnostic block.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConflictToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// One physical cache line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LineId {
    /// Frame holding the line.
    pub frame: PageHandle,
    /// Line index within the frame.
    pub line: usize,
}

impl LineId {
    /// Line `line` of `frame`.
    #[must_use]
    pub const fn new(frame: PageHandle, line: usize) -> Self {
        Self { frame, line }
    }

    /// Real address of the line.
    #[must_use]
    pub const fn address(self) -> u64 {
        self.frame.line_address(self.line)
    }

    /// Token reported when this line causes a conflict.
    #[must_use]
    pub const fn token(self) -> ConflictToken {
        ConflictToken(self.address())
    }

    const fn slot(self) -> Option<usize> {
        if self.line < CACHE_LINES_PER_PAGE {
            Some(self.frame.index() * CACHE_LINES_PER_PAGE + self.line)
        } else {
            None
        }
    }
}

/// Decoded content of a claim word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineClaim {
    /// Owning processor.
    pub owner: CpuId,
    /// Owner's attempt generation.
    pub generation: u64,
    /// Strongest access the owner made.
    pub state: LineState,
}

impl LineClaim {
    const fn encode(self) -> u64 {
        ((self.generation & GENERATION_MASK) << GENERATION_SHIFT)
            | ((self.owner.0 as u64) << OWNER_SHIFT)
            | self.state as u64
    }

    const fn decode(word: u64) -> Option<Self> {
        let state = match word & STATE_MASK {
            1 => LineState::Fetched,
            2 => LineState::Stored,
            _ => return None,
        };
        #[allow(clippy::cast_possible_truncation)]
        let owner = CpuId(((word >> OWNER_SHIFT) & OWNER_MASK) as u16);
        Some(Self {
            owner,
            generation: word >> GENERATION_SHIFT,
            state,
        })
    }

    /// Access intent a conflict on this claim is reported with.
    #[must_use]
    pub const fn intent(self) -> AccessIntent {
        match self.state {
            LineState::Stored => AccessIntent::Store,
            LineState::Clean | LineState::Fetched => AccessIntent::Fetch,
        }
    }
}

/// Successful claim outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The line was free and is now owned.
    Acquired,
    /// The line was already owned and moved from FETCHED to STORED.
    Upgraded,
    /// The line was already owned in a sufficient state.
    Held,
}

/// A line is owned by another processor's open transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineConflict {
    /// Contended line.
    pub line: LineId,
    /// Current owner.
    pub owner: LineClaim,
}

impl LineConflict {
    /// Token identifying the contended line.
    #[must_use]
    pub const fn token(&self) -> ConflictToken {
        self.line.token()
    }
}

/// Why a claim was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ClaimError {
    /// Another open attempt owns the line.
    #[error("line {} is owned by {}", .0.token(), .0.owner.owner)]
    Owned(LineConflict),
    /// The line has no claim word in this table.
    #[error("line {} of {} is outside the ownership table", .0.line, .0.frame)]
    Untracked(LineId),
}

/// Abort posted to a processor by another processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Doom {
    generation: u64,
    request: AbortRequest,
}

#[derive(Debug, Default)]
struct CpuSlot {
    active: AtomicU64,
    doom: Mutex<Option<Doom>>,
}

/// Shared line-ownership table consulted on every storage access.
pub struct ConflictDetector {
    claims: Box<[AtomicU64]>,
    cpus: Box<[CpuSlot]>,
}

impl ConflictDetector {
    /// Creates a table covering `frames` frames shared by `cpus` processors.
    #[must_use]
    pub fn new(frames: u32, cpus: u16) -> Self {
        let lines = frames as usize * CACHE_LINES_PER_PAGE;
        Self {
            claims: (0..lines).map(|_| AtomicU64::new(0)).collect(),
            cpus: (0..cpus).map(|_| CpuSlot::default()).collect(),
        }
    }

    /// Number of processors the table was sized for.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn cpu_count(&self) -> u16 {
        self.cpus.len() as u16
    }

    /// Marks `generation` as `cpu`'s open attempt.
    pub fn activate(&self, cpu: CpuId, generation: u64) {
        if let Some(slot) = self.cpus.get(cpu.index()) {
            *slot.doom.lock() = None;
            slot.active
                .store(generation & GENERATION_MASK, Ordering::Release);
        }
    }

    /// Ends `cpu`'s open attempt and drops any pending doom.
    pub fn deactivate(&self, cpu: CpuId) {
        if let Some(slot) = self.cpus.get(cpu.index()) {
            slot.active.store(0, Ordering::Release);
            *slot.doom.lock() = None;
        }
    }

    /// Returns `true` while `generation` is `cpu`'s open attempt.
    #[must_use]
    pub fn is_active(&self, cpu: CpuId, generation: u64) -> bool {
        let generation = generation & GENERATION_MASK;
        generation != 0
            && self
                .cpus
                .get(cpu.index())
                .is_some_and(|slot| slot.active.load(Ordering::Acquire) == generation)
    }

    /// Claims `line` for `cpu`'s attempt `generation`.
    ///
    /// # Errors
    ///
    /// Returns [`ClaimError::Owned`] when another open attempt owns the line,
    /// or [`ClaimError::Untracked`] for a line outside the table.
    pub fn claim(
        &self,
        cpu: CpuId,
        generation: u64,
        line: LineId,
        intent: AccessIntent,
    ) -> Result<Claim, ClaimError> {
        let Some(word) = self.word(line) else {
            return Err(ClaimError::Untracked(line));
        };
        let generation = generation & GENERATION_MASK;
        let mut current = word.load(Ordering::Acquire);
        loop {
            let (desired, outcome) = match LineClaim::decode(current) {
                Some(claim) if claim.owner == cpu && claim.generation == generation => {
                    let state = claim.state.after(intent);
                    if state == claim.state {
                        return Ok(Claim::Held);
                    }
                    (LineClaim { state, ..claim }.encode(), Claim::Upgraded)
                }
                Some(claim) if self.is_active(claim.owner, claim.generation) => {
                    return Err(ClaimError::Owned(LineConflict { line, owner: claim }));
                }
                _ => {
                    let claim = LineClaim {
                        owner: cpu,
                        generation,
                        state: LineState::Clean.after(intent),
                    };
                    (claim.encode(), Claim::Acquired)
                }
            };
            match word.compare_exchange_weak(current, desired, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(outcome),
                Err(actual) => current = actual,
            }
        }
    }

    /// Releases every listed line still owned by `cpu`'s attempt `generation`.
    pub fn release(&self, cpu: CpuId, generation: u64, lines: impl IntoIterator<Item = LineId>) {
        let generation = generation & GENERATION_MASK;
        for line in lines {
            let Some(word) = self.word(line) else {
                continue;
            };
            // A failed update means the line was already reclaimed.
            let _ = word.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                LineClaim::decode(current)
                    .filter(|claim| claim.owner == cpu && claim.generation == generation)
                    .map(|_| 0)
            });
        }
    }

    /// Live owner of `line`, if any.
    #[must_use]
    pub fn owner_of(&self, line: LineId) -> Option<LineClaim> {
        let word = self.word(line)?;
        LineClaim::decode(word.load(Ordering::Acquire))
            .filter(|claim| self.is_active(claim.owner, claim.generation))
    }

    fn word(&self, line: LineId) -> Option<&AtomicU64> {
        self.claims.get(line.slot()?)
    }

    /// Checks an access that is not part of any transaction.
    ///
    /// `accessor` is the processor performing the access, if known; its own
    /// claims never conflict. When another open attempt owns the line, that
    /// attempt is doomed with a conflict matching its line state.
    ///
    /// # Errors
    ///
    /// Returns [`LineConflict`] when the access must wait for the owner to roll back.
    pub fn check_nontransactional(
        &self,
        accessor: Option<CpuId>,
        line: LineId,
    ) -> Result<(), LineConflict> {
        match self.owner_of(line) {
            Some(owner) if Some(owner.owner) != accessor => {
                let request = AbortRequest::conflict(owner.intent(), line.token())
                    .with_reason(AbortReason::DelayedAbort);
                self.doom(owner.owner, owner.generation, request);
                Err(LineConflict { line, owner })
            }
            _ => Ok(()),
        }
    }

    /// Posts an abort to `cpu`'s attempt `generation`.
    ///
    /// Returns `false` when that attempt is no longer open.
    pub fn doom(&self, cpu: CpuId, generation: u64, request: AbortRequest) -> bool {
        let generation = generation & GENERATION_MASK;
        if !self.is_active(cpu, generation) {
            return false;
        }
        let Some(slot) = self.cpus.get(cpu.index()) else {
            return false;
        };
        let mut pending = slot.doom.lock();
        match pending.as_mut() {
            Some(doom) if doom.generation == generation => doom.request.merge(request),
            _ => *pending = Some(Doom { generation, request }),
        }
        debug!(%cpu, generation, reasons = %request.reasons, "transaction doomed");
        true
    }

    /// Dooms every open attempt except `origin`'s. Returns how many were doomed.
    pub fn doom_all_except(&self, origin: CpuId, request: AbortRequest) -> usize {
        (0..self.cpu_count())
            .map(CpuId::new)
            .filter(|cpu| *cpu != origin)
            .filter(|cpu| {
                let generation = self
                    .cpus
                    .get(cpu.index())
                    .map_or(0, |slot| slot.active.load(Ordering::Acquire));
                generation != 0 && self.doom(*cpu, generation, request)
            })
            .count()
    }

    /// Takes the abort posted to `cpu`'s attempt `generation`, if any.
    #[must_use]
    pub fn take_doom(&self, cpu: CpuId, generation: u64) -> Option<AbortRequest> {
        let generation = generation & GENERATION_MASK;
        let slot = self.cpus.get(cpu.index())?;
        let mut pending = slot.doom.lock();
        match pending.take() {
            Some(doom) if doom.generation == generation => Some(doom.request),
            _ => None,
        }
    }
}

impl fmt::Debug for ConflictDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConflictDetector")
            .field("lines", &self.claims.len())
            .field("cpus", &self.cpus.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{Claim, ClaimError, ConflictDetector, CpuId, LineClaim, LineId, GENERATION_MASK};
    use crate::capture::{AccessIntent, LineState};
    use crate::cause::{AbortCode, AbortReason};
    use crate::memory::PageHandle;

    const A: CpuId = CpuId::new(0);
    const B: CpuId = CpuId::new(1);

    fn line(frame: u32, line: usize) -> LineId {
        LineId::new(PageHandle::new(frame), line)
    }

    #[test]
    fn claim_word_roundtrip() {
        let claim = LineClaim {
            owner: CpuId::new(0x1234),
            generation: GENERATION_MASK,
            state: LineState::Stored,
        };
        assert_eq!(LineClaim::decode(claim.encode()), Some(claim));
        assert_eq!(LineClaim::decode(0), None);
    }

    #[test]
    fn owner_claims_and_upgrades() {
        let detector = ConflictDetector::new(1, 2);
        detector.activate(A, 1);
        assert_eq!(
            detector.claim(A, 1, line(0, 0), AccessIntent::Fetch),
            Ok(Claim::Acquired)
        );
        assert_eq!(
            detector.claim(A, 1, line(0, 0), AccessIntent::Fetch),
            Ok(Claim::Held)
        );
        assert_eq!(
            detector.claim(A, 1, line(0, 0), AccessIntent::Store),
            Ok(Claim::Upgraded)
        );
        assert_eq!(
            detector.owner_of(line(0, 0)).map(|claim| claim.state),
            Some(LineState::Stored)
        );
    }

    #[test]
    fn second_transaction_gets_the_conflict() {
        let detector = ConflictDetector::new(1, 2);
        detector.activate(A, 1);
        detector.activate(B, 1);
        detector
            .claim(A, 1, line(0, 3), AccessIntent::Fetch)
            .expect("free line");
        let Err(ClaimError::Owned(conflict)) = detector.claim(B, 1, line(0, 3), AccessIntent::Fetch)
        else {
            panic!("line 3 is owned by A");
        };
        assert_eq!(conflict.owner.owner, A);
        assert_eq!(conflict.token().raw(), 0x300);
    }

    #[test]
    fn lines_outside_the_table_are_refused() {
        let detector = ConflictDetector::new(2, 1);
        detector.activate(A, 1);
        assert_eq!(
            detector.claim(A, 1, line(0, 16), AccessIntent::Store),
            Err(ClaimError::Untracked(line(0, 16)))
        );
        assert_eq!(
            detector.claim(A, 1, line(2, 0), AccessIntent::Fetch),
            Err(ClaimError::Untracked(line(2, 0)))
        );
        assert!(detector.owner_of(line(1, 0)).is_none());
        assert!(detector.owner_of(line(0, 16)).is_none());
    }

    #[test]
    fn stale_claims_are_reclaimed() {
        let detector = ConflictDetector::new(1, 2);
        detector.activate(A, 1);
        detector
            .claim(A, 1, line(0, 0), AccessIntent::Store)
            .expect("free line");
        detector.deactivate(A);
        detector.activate(B, 7);
        assert_eq!(
            detector.claim(B, 7, line(0, 0), AccessIntent::Store),
            Ok(Claim::Acquired)
        );
    }

    #[test]
    fn release_clears_only_own_claims() {
        let detector = ConflictDetector::new(1, 2);
        detector.activate(A, 1);
        detector.activate(B, 1);
        detector
            .claim(A, 1, line(0, 0), AccessIntent::Store)
            .expect("free line");
        detector.release(B, 1, [line(0, 0)]);
        assert!(detector.owner_of(line(0, 0)).is_some());
        detector.release(A, 1, [line(0, 0)]);
        assert!(detector.owner_of(line(0, 0)).is_none());
    }

    #[test]
    fn nontransactional_access_dooms_the_owner() {
        let detector = ConflictDetector::new(1, 2);
        detector.activate(A, 4);
        detector
            .claim(A, 4, line(0, 0), AccessIntent::Store)
            .expect("free line");
        assert!(detector.check_nontransactional(Some(B), line(0, 0)).is_err());
        assert!(detector.check_nontransactional(Some(A), line(0, 0)).is_ok());
        let request = detector.take_doom(A, 4).expect("doom posted");
        assert!(request.reasons.contains(AbortReason::DelayedAbort));
        assert_eq!(request.abort_code(), AbortCode::StoreConflict);
        assert!(detector.take_doom(A, 4).is_none());
    }

    #[test]
    fn dooms_for_finished_attempts_are_ignored() {
        let detector = ConflictDetector::new(1, 3);
        detector.activate(A, 2);
        detector.activate(B, 5);
        let request = crate::cause::AbortRequest::new(AbortReason::CspInstr);
        assert_eq!(detector.doom_all_except(A, request), 1);
        assert!(!detector.doom(A, 1, request));
        assert!(detector.take_doom(B, 4).is_none());
    }
}
