#![no_main]

use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use txf_core::{
    BeginParams, CpuId, CpuRegisters, IdentityTranslator, InstructionClass, Interruption, LineId,
    PageHandle, SharedStorage, TransactionManager, TxfConfig, CACHE_LINES_PER_PAGE, PAGE_SIZE,
};

const FRAMES: u32 = 4;
const SPAN: u64 = (FRAMES as u64 + 1) * PAGE_SIZE as u64;

fuzz_target!(|data: &[u8]| {
    let storage = Arc::new(SharedStorage::new(FRAMES, 2));
    let translator = Arc::new(IdentityTranslator::new(FRAMES + 1));
    let mut cpus = [0, 1].map(|id| {
        TransactionManager::new(
            CpuId::new(id),
            Arc::clone(&storage),
            translator.clone(),
            TxfConfig::default(),
        )
        .expect("processor in range")
    });
    let mut regs = [CpuRegisters::default(); 2];

    for op in data.chunks_exact(4) {
        let who = usize::from(op[0] & 1);
        let cpu = &mut cpus[who];
        let regs = &mut regs[who];
        let addr = u64::from(u16::from_be_bytes([op[2], op[3]])) % SPAN;
        let _ = match op[1] % 9 {
            0 => cpu.begin(BeginParams::unconstrained(addr), regs).map(|_| ()),
            1 => cpu.begin(BeginParams::constrained(addr), regs).map(|_| ()),
            2 => cpu.commit(regs).map(|_| ()),
            3 => cpu.store(addr, &op[..usize::from(op[0] >> 6) + 1], regs),
            4 => {
                let mut buf = [0_u8; 64];
                cpu.fetch(addr, &mut buf[..usize::from(op[0] >> 2)], regs)
            }
            5 => cpu.tabort(u64::from(op[0]) << 1, regs).map(|_| ()),
            6 => cpu.count_instruction(addr, regs),
            7 => cpu.screen(InstructionClass::RelativeBranch { target: addr }, regs),
            _ => {
                let _ = cpu.interrupt(Interruption::External, regs);
                Ok(())
            }
        };
        let _ = cpu.check_conflict(regs);
    }

    for (cpu, regs) in cpus.iter_mut().zip(regs.iter_mut()) {
        while cpu.in_transaction() {
            let _ = cpu.tabort(0x100, regs);
        }
    }
    for frame in 0..FRAMES {
        for line in 0..CACHE_LINES_PER_PAGE {
            let id = LineId::new(PageHandle::new(frame), line);
            assert!(storage.detector().owner_of(id).is_none());
        }
    }
});
