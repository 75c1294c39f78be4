use std::ops::Range;

use rand::Rng;

use super::TransactionManager;
use crate::api::TxEvent;
use crate::capture::{AccessIntent, CaptureError};
use crate::cause::{AbortReason, AbortRequest};
use crate::conflict::{Claim, ClaimError, LineId};
use crate::error::{AccessDenied, TxError};
use crate::memory::{
    line_of, page_chunks, page_of, page_offset, ArenaError, PageHandle, CACHE_LINE_SHIFT,
};
use crate::state::CpuRegisters;

/// One page-contained piece of a translated access.
struct Chunk {
    frame: PageHandle,
    offset: usize,
    range: Range<usize>,
}

impl TransactionManager {
    /// Records a transactional fetch of `len` bytes at `virtual_addr`.
    ///
    /// Outside a transaction this only checks that no other open transaction
    /// owns the lines.
    ///
    /// # Errors
    ///
    /// Returns [`AccessDenied::Abort`] when the open transaction must abort;
    /// the caller then invokes [`TransactionManager::abort`].
    pub fn record_fetch(&mut self, virtual_addr: u64, len: usize) -> Result<(), AccessDenied> {
        self.record_checked(virtual_addr, len, AccessIntent::Fetch)
    }

    /// Records a transactional store of `len` bytes at `virtual_addr`.
    ///
    /// # Errors
    ///
    /// See [`TransactionManager::record_fetch`].
    pub fn record_store(&mut self, virtual_addr: u64, len: usize) -> Result<(), AccessDenied> {
        self.record_checked(virtual_addr, len, AccessIntent::Store)
    }

    fn record_checked(
        &mut self,
        virtual_addr: u64,
        len: usize,
        intent: AccessIntent,
    ) -> Result<(), AccessDenied> {
        let chunks = self.record(virtual_addr, len, intent)?;
        if self.in_transaction() {
            return Ok(());
        }
        let detector = self.storage.detector();
        for chunk in chunks {
            let first = chunk.offset >> CACHE_LINE_SHIFT;
            let last = (chunk.offset + chunk.range.len() - 1) >> CACHE_LINE_SHIFT;
            for line in first..=last {
                detector
                    .check_nontransactional(Some(self.cpu), LineId::new(chunk.frame, line))
                    .map_err(|conflict| AccessDenied::Busy {
                        token: conflict.token(),
                        owner: conflict.owner.owner,
                    })?;
            }
        }
        Ok(())
    }

    /// Reads guest storage, transactionally when a transaction is open.
    ///
    /// # Errors
    ///
    /// Returns [`TxError::Aborted`] when the access aborted the open
    /// transaction, or [`TxError::Access`] when a non-transactional access was
    /// refused and should be retried.
    pub fn fetch(
        &mut self,
        virtual_addr: u64,
        buf: &mut [u8],
        registers: &mut CpuRegisters,
    ) -> Result<(), TxError> {
        let chunks = self.access(virtual_addr, buf.len(), AccessIntent::Fetch, registers)?;
        let accessor = Some(self.cpu);
        let transactional = self.in_transaction();
        for chunk in chunks {
            let piece = &mut buf[chunk.range];
            if transactional {
                self.storage
                    .arena()
                    .read(chunk.frame, chunk.offset, piece)
                    .map_err(AccessDenied::from)?;
            } else {
                self.storage
                    .fetch_nontransactional(accessor, chunk.frame, chunk.offset, piece)?;
            }
        }
        Ok(())
    }

    /// Writes guest storage, transactionally when a transaction is open.
    ///
    /// Transactional stores land in the live frame; the page snapshot taken
    /// before the first touch is what an abort restores.
    ///
    /// # Errors
    ///
    /// See [`TransactionManager::fetch`].
    pub fn store(
        &mut self,
        virtual_addr: u64,
        data: &[u8],
        registers: &mut CpuRegisters,
    ) -> Result<(), TxError> {
        let chunks = self.access(virtual_addr, data.len(), AccessIntent::Store, registers)?;
        let accessor = Some(self.cpu);
        let transactional = self.in_transaction();
        for chunk in chunks {
            let piece = &data[chunk.range];
            if transactional {
                self.storage
                    .arena()
                    .write(chunk.frame, chunk.offset, piece)
                    .map_err(AccessDenied::from)?;
            } else {
                self.storage
                    .store_nontransactional(accessor, chunk.frame, chunk.offset, piece)?;
            }
        }
        Ok(())
    }

    fn access(
        &mut self,
        virtual_addr: u64,
        len: usize,
        intent: AccessIntent,
        registers: &mut CpuRegisters,
    ) -> Result<Vec<Chunk>, TxError> {
        match self.record(virtual_addr, len, intent) {
            Ok(chunks) => Ok(chunks),
            Err(AccessDenied::Abort(request)) => Err(self.abort_with(request, registers)),
            Err(denied) => Err(denied.into()),
        }
    }

    fn record(
        &mut self,
        virtual_addr: u64,
        len: usize,
        intent: AccessIntent,
    ) -> Result<Vec<Chunk>, AccessDenied> {
        let Some(generation) = self.context.as_ref().map(|context| context.generation()) else {
            return self.translate_chunks(virtual_addr, len);
        };
        if let Some(request) = self.storage.detector().take_doom(self.cpu, generation) {
            return Err(AccessDenied::Abort(request));
        }
        if self.roll_random_abort() {
            return Err(AccessDenied::Abort(AbortRequest::new(
                AbortReason::RandAbort,
            )));
        }

        let mut chunks = Vec::with_capacity(2);
        for (chunk_addr, range) in page_chunks(virtual_addr, len) {
            let frame = match self.translator.translate(chunk_addr) {
                Ok(frame) => frame,
                Err(fault) => {
                    let request = self.program_request(fault.program_exception());
                    return Err(AccessDenied::Abort(request));
                }
            };
            if !self.storage.arena().contains(frame) {
                return Err(ArenaError::UnknownFrame(frame).into());
            }
            let virtual_page = page_of(chunk_addr);
            let first = line_of(chunk_addr);
            let last = line_of(chunk_addr + (range.len() as u64 - 1));
            for line in first..=last {
                self.claim_line(generation, virtual_page, frame, line, intent)?;
            }
            chunks.push(Chunk {
                frame,
                offset: page_offset(chunk_addr),
                range,
            });
        }
        Ok(chunks)
    }

    fn claim_line(
        &mut self,
        generation: u64,
        virtual_page: u64,
        frame: PageHandle,
        line: usize,
        intent: AccessIntent,
    ) -> Result<(), AccessDenied> {
        let new_page = self.pages.entry(virtual_page).is_none();
        self.pages
            .ensure_room(virtual_page)
            .map_err(|_| AccessDenied::Abort(AbortRequest::overflow(intent)))?;
        let line_id = LineId::new(frame, line);
        let detector = self.storage.detector();
        let claim = detector
            .claim(self.cpu, generation, line_id, intent)
            .map_err(|error| match error {
                ClaimError::Owned(conflict) => {
                    AccessDenied::Abort(AbortRequest::conflict(intent, conflict.token()))
                }
                ClaimError::Untracked(_) => AccessDenied::Arena(ArenaError::UnknownFrame(frame)),
            })?;
        let touched = self
            .pages
            .touch(self.storage.arena(), virtual_page, frame, line, intent);
        if let Err(error) = touched {
            if claim == Claim::Acquired {
                detector.release(self.cpu, generation, [line_id]);
            }
            return Err(match error {
                CaptureError::PageLimit { .. } => {
                    AccessDenied::Abort(AbortRequest::overflow(intent))
                }
                CaptureError::CaptureFailed { .. } => {
                    AccessDenied::Abort(AbortRequest::capture_failure(intent))
                }
                CaptureError::Arena(error) => AccessDenied::Arena(error),
            });
        }
        if new_page {
            let constrained = self.constrained();
            self.emit(
                self.config.trace.map(constrained),
                TxEvent::PageMapped {
                    cpu: self.cpu,
                    virtual_page,
                    real_page: frame.real_address(),
                },
            );
        }
        Ok(())
    }

    fn translate_chunks(&self, virtual_addr: u64, len: usize) -> Result<Vec<Chunk>, AccessDenied> {
        page_chunks(virtual_addr, len)
            .map(|(chunk_addr, range)| -> Result<Chunk, AccessDenied> {
                Ok(Chunk {
                    frame: self.translator.translate(chunk_addr)?,
                    offset: page_offset(chunk_addr),
                    range,
                })
            })
            .collect()
    }

    fn roll_random_abort(&mut self) -> bool {
        let one_in = self
            .config
            .random_abort
            .map_or(0, |random| random.one_in);
        match self.rng.as_mut() {
            Some(rng) if one_in > 0 => rng.gen_ratio(1, one_in),
            _ => false,
        }
    }
}
