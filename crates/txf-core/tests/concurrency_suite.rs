//! Multi-threaded processors running transactions against shared storage.

#![allow(clippy::pedantic, clippy::nursery, clippy::cast_possible_truncation)]

use std::sync::{Arc, Barrier};
use std::thread;

use parking_lot as _;
use proptest as _;
use rand as _;
use rstest::rstest;
#[cfg(feature = "serde")]
use serde as _;
use thiserror as _;
use tracing as _;
use txf_core::{
    AccessDenied, BeginParams, CommitOutcome, CpuId, CpuRegisters, IdentityTranslator,
    RandomAbortConfig, SharedStorage, TransactionManager, TxError, TxfConfig, PAGE_SIZE,
};

const FRAMES: u32 = 8;
const COUNTER: u64 = 0x2040;

fn add_transactionally(cpu: &mut TransactionManager, addr: u64, delta: u64) -> u32 {
    let mut regs = CpuRegisters::default();
    let mut aborts = 0;
    loop {
        let attempt = (|| -> Result<CommitOutcome, TxError> {
            cpu.begin(BeginParams::unconstrained(0x100), &mut regs)?;
            let mut bytes = [0_u8; 8];
            cpu.fetch(addr, &mut bytes, &mut regs)?;
            let value = u64::from_be_bytes(bytes).wrapping_add(delta);
            cpu.store(addr, &value.to_be_bytes(), &mut regs)?;
            cpu.commit(&mut regs)
        })();
        match attempt {
            Ok(CommitOutcome::Committed { .. }) => return aborts,
            Ok(CommitOutcome::Nested { .. }) => panic!("single level transaction"),
            Err(TxError::Aborted(_)) => {
                aborts += 1;
                thread::yield_now();
            }
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }
}

fn read_u64(storage: &SharedStorage, addr: u64) -> u64 {
    loop {
        let mut bytes = [0_u8; 8];
        match storage.fetch_real(None, addr, &mut bytes) {
            Ok(()) => return u64::from_be_bytes(bytes),
            Err(AccessDenied::Busy { .. }) => thread::yield_now(),
            Err(other) => panic!("unexpected refusal {other:?}"),
        }
    }
}

#[rstest]
#[case(2, 200, None)]
#[case(4, 100, None)]
#[case(4, 100, Some(RandomAbortConfig { seed: 0x5eed, one_in: 8 }))]
fn concurrent_increments_are_serializable(
    #[case] cpus: u16,
    #[case] rounds: u64,
    #[case] random_abort: Option<RandomAbortConfig>,
) {
    let storage = Arc::new(SharedStorage::new(FRAMES, cpus));
    let translator = Arc::new(IdentityTranslator::new(FRAMES));
    let config = TxfConfig {
        random_abort,
        ..TxfConfig::default()
    };
    let barrier = Arc::new(Barrier::new(usize::from(cpus)));

    let handles: Vec<_> = (0..cpus)
        .map(|id| {
            let mut cpu = TransactionManager::new(
                CpuId::new(id),
                Arc::clone(&storage),
                translator.clone(),
                config,
            )
            .expect("processor in range");
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                (0..rounds)
                    .map(|_| add_transactionally(&mut cpu, COUNTER, 1))
                    .sum::<u32>()
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("processor thread");
    }

    assert_eq!(read_u64(&storage, COUNTER), u64::from(cpus) * rounds);
    for id in 0..cpus {
        assert!(!storage.detector().is_active(CpuId::new(id), 1));
    }
}

#[test]
fn nontransactional_writer_never_sees_torn_transactional_state() {
    let storage = Arc::new(SharedStorage::new(FRAMES, 2));
    let translator = Arc::new(IdentityTranslator::new(FRAMES));
    let base = 3 * PAGE_SIZE as u64;
    let barrier = Arc::new(Barrier::new(2));

    let transactional = {
        let mut cpu = TransactionManager::new(
            CpuId::new(0),
            Arc::clone(&storage),
            translator,
            TxfConfig::default(),
        )
        .expect("processor in range");
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            for _ in 0..200 {
                add_transactionally(&mut cpu, base, 1);
                add_transactionally(&mut cpu, base + 8, 1);
            }
        })
    };

    let writer = {
        let storage = Arc::clone(&storage);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            let mut written = 0;
            while written < 200 {
                let target = base + 0x800;
                match storage.store_real(Some(CpuId::new(1)), target, &[written as u8]) {
                    Ok(()) => written += 1,
                    Err(AccessDenied::Busy { .. }) => thread::yield_now(),
                    Err(other) => panic!("unexpected refusal {other:?}"),
                }
            }
        })
    };

    transactional.join().expect("transactional thread");
    writer.join().expect("writer thread");
    assert_eq!(read_u64(&storage, base), 200);
    assert_eq!(read_u64(&storage, base + 8), 200);
}

#[test]
fn purge_broadcast_reaches_running_transaction() {
    let storage = Arc::new(SharedStorage::new(FRAMES, 2));
    let translator = Arc::new(IdentityTranslator::new(FRAMES));
    let mut a = TransactionManager::new(
        CpuId::new(0),
        Arc::clone(&storage),
        translator.clone(),
        TxfConfig::default(),
    )
    .expect("processor in range");
    let b = TransactionManager::new(CpuId::new(1), storage, translator, TxfConfig::default())
        .expect("processor in range");
    let mut regs = CpuRegisters::default();

    a.begin(BeginParams::unconstrained(0x100), &mut regs)
        .expect("outermost");
    a.store(COUNTER, &[1], &mut regs).expect("claimed");
    let purger = thread::spawn(move || b.purge_broadcast(true));
    assert_eq!(purger.join().expect("purger thread"), 1);

    let error = a
        .store(COUNTER, &[2], &mut regs)
        .expect_err("doomed by purge");
    assert!(error.outcome().is_some());
    assert!(!a.in_transaction());
}
