//! Contention harness for the transactional-execution facility.
//!
//! Runs several processor threads that increment counters inside
//! transactions and reports commit and abort rates.
//!
//! ## Usage
//!
//! ```sh
//! cargo run -p txf-core --example conflict_storm
//! ```
//!
//! ## Scenarios
//!
//! - `hot`: every thread increments one shared counter
//! - `spread`: each thread owns a counter on its own page
//! - `mixed`: shared counter plus a non-transactional writer on the same page

#![allow(clippy::pedantic)]

use parking_lot as _;
use proptest as _;
use rand::Rng;
use rstest as _;
#[cfg(feature = "serde")]
use serde as _;
use thiserror as _;
use tracing as _;
use txf_core::{
    AbortCode, AccessDenied, BeginParams, CommitOutcome, CpuId, CpuRegisters, IdentityTranslator,
    RandomAbortConfig, SharedStorage, TransactionManager, TxError, TxfConfig, PAGE_SIZE,
};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const FRAMES: u32 = 16;
const NUM_THREADS: u16 = 4;
const RUN_FOR: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy)]
enum Scenario {
    Hot,
    Spread,
    Mixed,
}

impl Scenario {
    const fn name(self) -> &'static str {
        match self {
            Self::Hot => "hot",
            Self::Spread => "spread",
            Self::Mixed => "mixed",
        }
    }

    fn counter(self, cpu: u16) -> u64 {
        match self {
            Self::Hot | Self::Mixed => 0x100,
            Self::Spread => u64::from(cpu + 1) * PAGE_SIZE as u64,
        }
    }
}

#[derive(Debug, Default)]
struct Tally {
    commits: u64,
    aborts: BTreeMap<&'static str, u64>,
}

impl Tally {
    fn merge(&mut self, other: Self) {
        self.commits += other.commits;
        for (code, count) in other.aborts {
            *self.aborts.entry(code).or_default() += count;
        }
    }
}

fn increment(
    cpu: &mut TransactionManager,
    addr: u64,
    regs: &mut CpuRegisters,
) -> Result<(), TxError> {
    cpu.begin(BeginParams::unconstrained(0x40), regs)?;
    let mut bytes = [0_u8; 8];
    cpu.fetch(addr, &mut bytes, regs)?;
    let next = u64::from_be_bytes(bytes) + 1;
    cpu.store(addr, &next.to_be_bytes(), regs)?;
    match cpu.commit(regs)? {
        CommitOutcome::Committed { .. } => Ok(()),
        CommitOutcome::Nested { .. } => Err(TxError::NotInTransaction),
    }
}

fn run_processor(mut cpu: TransactionManager, addr: u64, stop: &AtomicBool) -> Tally {
    let mut tally = Tally::default();
    let mut regs = CpuRegisters::default();
    while !stop.load(Ordering::Relaxed) {
        match increment(&mut cpu, addr, &mut regs) {
            Ok(()) => tally.commits += 1,
            Err(TxError::Aborted(outcome)) => {
                *tally.aborts.entry(outcome.code.short_name()).or_default() += 1;
                thread::yield_now();
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    tally
}

fn run_writer(storage: &SharedStorage, stop: &AtomicBool) -> u64 {
    let mut rng = rand::thread_rng();
    let mut refused = 0;
    while !stop.load(Ordering::Relaxed) {
        let offset = rng.gen_range(0x200..0x1000);
        match storage.store_real(Some(CpuId::new(NUM_THREADS)), offset, &[rng.gen()]) {
            Ok(()) => {}
            Err(AccessDenied::Busy { .. }) => refused += 1,
            Err(other) => panic!("unexpected refusal: {other}"),
        }
    }
    refused
}

fn run(scenario: Scenario, random_abort: Option<RandomAbortConfig>) {
    let storage = Arc::new(SharedStorage::new(FRAMES, NUM_THREADS + 1));
    let translator = Arc::new(IdentityTranslator::new(FRAMES));
    let config = TxfConfig {
        random_abort,
        ..TxfConfig::default()
    };
    let stop = Arc::new(AtomicBool::new(false));
    let started = Instant::now();

    let processors: Vec<_> = (0..NUM_THREADS)
        .map(|id| {
            let cpu = TransactionManager::new(
                CpuId::new(id),
                Arc::clone(&storage),
                translator.clone(),
                config,
            )
            .expect("processor in range");
            let stop = Arc::clone(&stop);
            let addr = scenario.counter(id);
            thread::spawn(move || run_processor(cpu, addr, &stop))
        })
        .collect();
    let writer = matches!(scenario, Scenario::Mixed).then(|| {
        let storage = Arc::clone(&storage);
        let stop = Arc::clone(&stop);
        thread::spawn(move || run_writer(&storage, &stop))
    });

    thread::sleep(RUN_FOR);
    stop.store(true, Ordering::Relaxed);

    let mut tally = Tally::default();
    for handle in processors {
        tally.merge(handle.join().expect("processor thread panicked"));
    }
    let refused = writer.map_or(0, |handle| handle.join().expect("writer thread panicked"));
    let elapsed = started.elapsed().as_secs_f64();
    let aborted: u64 = tally.aborts.values().sum();

    println!(
        "{:<8} random={:<5} commits/s={:>12.0} aborts/s={:>12.0} refused={refused}",
        scenario.name(),
        random_abort.is_some(),
        tally.commits as f64 / elapsed,
        aborted as f64 / elapsed,
    );
    for (code, count) in &tally.aborts {
        println!("         {code:<16} {count}");
    }
    if tally.aborts.contains_key(AbortCode::Misc.short_name()) {
        println!("         (TAC_MISC counts include injected random aborts)");
    }
}

fn main() {
    let random = RandomAbortConfig {
        seed: 0xC0FFEE,
        one_in: 64,
    };
    for scenario in [Scenario::Hot, Scenario::Spread, Scenario::Mixed] {
        run(scenario, None);
        run(scenario, Some(random));
    }
}
