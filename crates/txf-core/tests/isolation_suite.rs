//! Cross-processor isolation, rollback, and resource-limit coverage.

#![allow(
    clippy::pedantic,
    clippy::nursery,
    clippy::cast_possible_truncation,
    clippy::too_many_lines
)]

use std::sync::Arc;

use parking_lot::Mutex;
use proptest as _;
use rand as _;
use rstest as _;
#[cfg(feature = "serde")]
use serde as _;
use thiserror as _;
use tracing as _;
use txf_core::{
    AbortAction, AbortCode, AbortReason, AccessDenied, BeginParams, CommitOutcome,
    ConditionCode, CpuId, CpuRegisters, GeneralRegister, IdentityTranslator, LineState,
    ProgramException, RandomAbortConfig, RegisterSaveMask, SharedStorage, Tdb, TraceFlags,
    TraceSink, TransactionManager, TxError, TxEvent, TxfConfig, MAX_TXF_PAGES, PAGE_SIZE,
};

const FRAMES: u32 = 80;
const X: u64 = 0x3000;

fn machine(cpus: u16, config: TxfConfig) -> (Arc<SharedStorage>, Vec<TransactionManager>) {
    let storage = Arc::new(SharedStorage::new(FRAMES, cpus));
    let translator = Arc::new(IdentityTranslator::new(FRAMES));
    let managers = (0..cpus)
        .map(|cpu| {
            TransactionManager::new(
                CpuId::new(cpu),
                Arc::clone(&storage),
                translator.clone(),
                config,
            )
            .expect("processor in range")
        })
        .collect();
    (storage, managers)
}

fn read_byte(storage: &SharedStorage, addr: u64) -> u8 {
    let mut byte = [0_u8];
    storage
        .fetch_real(None, addr, &mut byte)
        .expect("line is not owned");
    byte[0]
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<TxEvent>>>);

impl TraceSink for Recorder {
    fn on_event(&mut self, event: TxEvent) {
        self.0.lock().push(event);
    }
}

#[test]
fn nontransactional_store_dooms_owner_and_waits_for_rollback() {
    let (storage, mut cpus) = machine(2, TxfConfig::default());
    let mut a = cpus.remove(0);
    let mut b = cpus.remove(0);
    let mut regs_a = CpuRegisters {
        instruction_addr: 0x1008,
        ..CpuRegisters::default()
    };
    let mut regs_b = CpuRegisters::default();

    a.begin(BeginParams::unconstrained(0x1006).with_tdb(), &mut regs_a)
        .expect("outermost");
    a.store(X, &[0xAA], &mut regs_a).expect("claimed");
    assert_eq!(a.line_state(X), LineState::Stored);

    let refused = b.store(X, &[0xFF], &mut regs_b).expect_err("line owned by A");
    match refused {
        TxError::Access(AccessDenied::Busy { owner, .. }) => assert_eq!(owner, CpuId::new(0)),
        other => panic!("unexpected refusal {other:?}"),
    }

    let outcome = a.check_conflict(&mut regs_a).expect("A was doomed");
    assert_eq!(outcome.code, AbortCode::StoreConflict);
    assert!(outcome.reasons.contains(AbortReason::DelayedAbort));
    assert_eq!(
        outcome.action,
        AbortAction::Resume {
            address: 0x1006,
            cc: ConditionCode::Transient
        }
    );
    assert_eq!(outcome.tdb.abort_code, 10);
    assert!(outcome.tdb.conflict_token_valid());
    assert_eq!(outcome.tdb.conflict_token, X & !0xFF);
    assert_eq!(outcome.tdb.aborted_instruction_addr, 0x1008);
    assert_eq!(read_byte(&storage, X), 0x00);

    b.store(X, &[0xFF], &mut regs_b).expect("owner rolled back");
    assert_eq!(read_byte(&storage, X), 0xFF);
}

#[test]
fn nontransactional_store_to_fetched_line_reports_fetch_conflict() {
    let (storage, mut cpus) = machine(2, TxfConfig::default());
    let mut a = cpus.remove(0);
    let mut b = cpus.remove(0);
    let mut regs_a = CpuRegisters::default();
    let mut regs_b = CpuRegisters::default();

    a.begin(BeginParams::unconstrained(0x500).with_tdb(), &mut regs_a)
        .expect("outermost");
    let mut buf = [0_u8; 4];
    a.fetch(X + 0x10, &mut buf, &mut regs_a).expect("claimed");
    assert_eq!(a.line_state(X + 0x10), LineState::Fetched);

    let refused = b
        .store(X + 0x20, &[0x5C], &mut regs_b)
        .expect_err("line fetched by A");
    assert!(matches!(
        refused,
        TxError::Access(AccessDenied::Busy { owner, .. }) if owner == CpuId::new(0)
    ));

    let outcome = a.check_conflict(&mut regs_a).expect("A was doomed");
    assert_eq!(outcome.code, AbortCode::FetchConflict);
    assert_eq!(outcome.tdb.abort_code, 9);
    assert!(outcome.tdb.conflict_token_valid());
    assert_eq!(outcome.tdb.conflict_token, X);
    assert_eq!(
        outcome.action,
        AbortAction::Resume {
            address: 0x500,
            cc: ConditionCode::Transient
        }
    );

    b.store(X + 0x20, &[0x5C], &mut regs_b)
        .expect("owner rolled back");
    assert_eq!(read_byte(&storage, X + 0x20), 0x5C);
}

#[test]
fn transactional_requester_loses_and_owner_commits() {
    let (storage, mut cpus) = machine(2, TxfConfig::default());
    let mut a = cpus.remove(0);
    let mut b = cpus.remove(0);
    let mut regs_a = CpuRegisters::default();
    let mut regs_b = CpuRegisters::default();

    a.begin(BeginParams::unconstrained(0x100), &mut regs_a)
        .expect("outermost");
    let mut buf = [0_u8; 8];
    a.fetch(X, &mut buf, &mut regs_a).expect("claimed");

    b.begin(BeginParams::unconstrained(0x200).with_tdb(), &mut regs_b)
        .expect("outermost");
    let error = b.store(X + 4, &[1, 2], &mut regs_b).expect_err("A owns the line");
    let outcome = error.outcome().expect("B aborted");
    assert_eq!(outcome.code, AbortCode::StoreConflict);
    assert!(!b.in_transaction());

    a.store(X, &[7], &mut regs_a).expect("upgrade own line");
    assert_eq!(
        a.commit(&mut regs_a),
        Ok(CommitOutcome::Committed { pages: 1 })
    );
    assert_eq!(read_byte(&storage, X), 7);
    let line = txf_core::real_line(X).expect("low address");
    assert_eq!(storage.detector().owner_of(line), None);
}

#[test]
fn fetch_conflict_is_reported_for_a_fetching_requester() {
    let (_storage, mut cpus) = machine(2, TxfConfig::default());
    let mut a = cpus.remove(0);
    let mut b = cpus.remove(0);
    let mut regs = CpuRegisters::default();

    a.begin(BeginParams::unconstrained(0x100), &mut regs)
        .expect("outermost");
    a.store(X, &[1], &mut regs).expect("claimed");
    b.begin(BeginParams::unconstrained(0x200), &mut regs)
        .expect("outermost");
    let mut buf = [0_u8; 1];
    let outcome = b
        .fetch(X, &mut buf, &mut regs)
        .expect_err("A owns the line")
        .outcome()
        .cloned()
        .expect("B aborted");
    assert_eq!(outcome.code, AbortCode::FetchConflict);
    assert!(!outcome.tdb.is_valid());
}

#[test]
fn page_limit_overflow_restores_every_page() {
    let (storage, mut cpus) = machine(1, TxfConfig::default());
    let mut cpu = cpus.remove(0);
    let mut regs = CpuRegisters::default();

    cpu.begin(BeginParams::unconstrained(0x40), &mut regs)
        .expect("outermost");
    for page in 0..MAX_TXF_PAGES as u64 {
        cpu.store(page * PAGE_SIZE as u64 + 16, &[0x5A], &mut regs)
            .expect("within page limit");
    }
    assert_eq!(cpu.mapped_pages(), MAX_TXF_PAGES);

    let overflow = MAX_TXF_PAGES as u64 * PAGE_SIZE as u64;
    let outcome = cpu
        .store(overflow, &[0x5A], &mut regs)
        .expect_err("page limit exceeded")
        .outcome()
        .cloned()
        .expect("aborted");
    assert_eq!(outcome.code, AbortCode::StoreOverflow);
    assert_eq!(outcome.restored_pages, MAX_TXF_PAGES);
    assert_eq!(
        outcome.action,
        AbortAction::Resume {
            address: 0x40,
            cc: ConditionCode::Persistent
        }
    );
    for page in 0..=MAX_TXF_PAGES as u64 {
        assert_eq!(read_byte(&storage, page * PAGE_SIZE as u64 + 16), 0);
    }
    assert_eq!(cpu.mapped_pages(), 0);
}

#[test]
fn commit_keeps_stores_across_page_boundary() {
    let (storage, mut cpus) = machine(1, TxfConfig::default());
    let mut cpu = cpus.remove(0);
    let mut regs = CpuRegisters::default();
    let addr = 2 * PAGE_SIZE as u64 - 2;

    cpu.begin(BeginParams::unconstrained(0x40), &mut regs)
        .expect("outermost");
    cpu.store(addr, &[1, 2, 3, 4], &mut regs)
        .expect("two pages");
    assert_eq!(cpu.mapped_pages(), 2);
    assert_eq!(
        cpu.commit(&mut regs),
        Ok(CommitOutcome::Committed { pages: 2 })
    );

    let mut bytes = [0_u8; 4];
    storage
        .fetch_real(None, addr, &mut bytes)
        .expect("released");
    assert_eq!(bytes, [1, 2, 3, 4]);
}

#[test]
fn fetched_lines_are_not_written_back_on_abort() {
    let (storage, mut cpus) = machine(1, TxfConfig::default());
    let mut cpu = cpus.remove(0);
    let mut regs = CpuRegisters::default();

    cpu.begin(BeginParams::unconstrained(0x40), &mut regs)
        .expect("outermost");
    let mut buf = [0_u8; 4];
    cpu.fetch(X, &mut buf, &mut regs).expect("claimed");
    cpu.store(X + 0x100, &[9], &mut regs).expect("claimed");
    cpu.tabort(0x200, &mut regs).expect("open transaction");
    assert_eq!(read_byte(&storage, X + 0x100), 0);
}

#[test]
fn invalid_tdb_when_not_requested_or_disabled() {
    let config = TxfConfig {
        capture_diagnostics: false,
        ..TxfConfig::default()
    };
    let (_storage, mut cpus) = machine(1, config);
    let mut cpu = cpus.remove(0);
    let mut regs = CpuRegisters::default();

    cpu.begin(BeginParams::unconstrained(0x40).with_tdb(), &mut regs)
        .expect("outermost");
    let outcome = cpu.tabort(0x300, &mut regs).expect("open transaction");
    assert_eq!(outcome.tdb, Tdb::invalid());
    assert!(outcome.tdb.to_bytes().iter().all(|byte| *byte == 0));
}

#[test]
fn translation_fault_inside_transaction_is_unfiltered() {
    let (_storage, mut cpus) = machine(1, TxfConfig::default());
    let mut cpu = cpus.remove(0);
    let mut regs = CpuRegisters::default();

    cpu.begin(
        BeginParams::unconstrained(0x40).with_tdb().with_pifc(2),
        &mut regs,
    )
    .expect("outermost");
    let beyond = u64::from(FRAMES) * PAGE_SIZE as u64;
    let outcome = cpu
        .store(beyond, &[1], &mut regs)
        .expect_err("no frame")
        .outcome()
        .cloned()
        .expect("aborted");
    assert_eq!(outcome.code, AbortCode::FilteredProgram);
    assert_eq!(outcome.tdb.program_interruption_id, 0x0005);

    cpu.begin(BeginParams::unconstrained(0x40).with_tdb(), &mut regs)
        .expect("outermost");
    let outcome = cpu
        .program_exception(ProgramException::new(0x0005), &mut regs)
        .expect("open transaction");
    assert_eq!(outcome.code, AbortCode::UnfilteredProgram);
    assert!(matches!(outcome.action, AbortAction::Interrupt { address: 0x40, .. }));
}

#[test]
fn constrained_transaction_ends_in_program_check_after_32_instructions() {
    let (storage, mut cpus) = machine(1, TxfConfig::default());
    let mut cpu = cpus.remove(0);
    let mut regs = CpuRegisters::default();

    cpu.begin(BeginParams::constrained(0x5000), &mut regs)
        .expect("outermost");
    cpu.store(X, &[0x11], &mut regs).expect("claimed");
    for step in 0..32_u64 {
        regs.instruction_addr = 0x5006 + step * 4;
        cpu.count_instruction(regs.instruction_addr, &mut regs)
            .expect("within limit");
    }
    regs.instruction_addr = 0x5086;
    let outcome = cpu
        .count_instruction(regs.instruction_addr, &mut regs)
        .expect_err("33rd instruction")
        .outcome()
        .cloned()
        .expect("aborted");
    assert_eq!(
        outcome.action,
        AbortAction::ProgramCheck {
            address: 0x5086,
            code: 0x0218
        }
    );
    assert_eq!(read_byte(&storage, X), 0);
}

#[test]
fn abort_restores_only_masked_register_pairs() {
    let (_storage, mut cpus) = machine(1, TxfConfig::default());
    let mut cpu = cpus.remove(0);
    let mut regs = CpuRegisters::default();
    for register in GeneralRegister::ALL {
        regs.gpr.write(register, 1);
    }

    cpu.begin(
        BeginParams::unconstrained(0x40).with_save_mask(RegisterSaveMask::new(0x81)),
        &mut regs,
    )
    .expect("outermost");
    for register in GeneralRegister::ALL {
        regs.gpr.write(register, 2);
    }
    cpu.tabort(0x100, &mut regs).expect("open transaction");

    let values = regs.gpr.values();
    assert_eq!(&values[0..2], &[1, 1]);
    assert_eq!(&values[2..14], &[2; 12]);
    assert_eq!(&values[14..16], &[1, 1]);
}

#[test]
fn trace_sink_sees_events_in_order() {
    let recorder = Recorder::default();
    let config = TxfConfig {
        trace: TraceFlags::ALL,
        ..TxfConfig::default()
    };
    let (_storage, mut cpus) = machine(1, config);
    let mut cpu = cpus
        .remove(0)
        .with_trace_sink(Box::new(recorder.clone()));
    let mut regs = CpuRegisters::default();

    cpu.begin(BeginParams::unconstrained(0x40).with_tdb(), &mut regs)
        .expect("outermost");
    cpu.store(X, &[1], &mut regs).expect("claimed");
    cpu.tabort(0x100, &mut regs).expect("open transaction");

    let events = recorder.0.lock();
    assert_eq!(events.len(), 3);
    assert!(matches!(events[0], TxEvent::Begin { depth: 1, .. }));
    assert!(matches!(
        events[1],
        TxEvent::PageMapped {
            virtual_page: X,
            real_page: X,
            ..
        }
    ));
    let TxEvent::Abort(abort) = &events[2] else {
        panic!("expected abort event, got {:?}", events[2]);
    };
    assert_eq!(abort.code, AbortCode::Explicit(0x100));
    assert_eq!(abort.pages, vec![X]);
    assert_eq!(abort.lines.len(), 1);
    assert!(abort.tdb.is_some_and(|tdb| tdb.is_valid()));
}

#[test]
fn random_abort_injection_is_reproducible() {
    let config = TxfConfig {
        random_abort: Some(RandomAbortConfig { seed: 7, one_in: 4 }),
        ..TxfConfig::default()
    };
    let run = || {
        let (_storage, mut cpus) = machine(1, config);
        let mut cpu = cpus.remove(0);
        let mut regs = CpuRegisters::default();
        let mut pattern = Vec::new();
        for round in 0..32_u64 {
            cpu.begin(BeginParams::unconstrained(0x40), &mut regs)
                .expect("outermost");
            match cpu.store(X + round, &[1], &mut regs) {
                Ok(()) => {
                    cpu.commit(&mut regs).expect("commit");
                    pattern.push(false);
                }
                Err(error) => {
                    let outcome = error.outcome().expect("random abort");
                    assert!(outcome.reasons.contains(AbortReason::RandAbort));
                    pattern.push(true);
                }
            }
        }
        pattern
    };
    let first = run();
    assert_eq!(first, run());
    assert!(first.iter().any(|aborted| *aborted));
}
