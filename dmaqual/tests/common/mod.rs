//! Shared simulation rig for the integration tests.
//!
//! Mirrors a DOS-era machine from the outside: a simulated adapter and
//! clock, a cache-maintenance counter, a physical-address table, and an
//! in-memory record store, wired into one [`QualContext`].

#![allow(dead_code)]

use std::rc::Rc;
use std::sync::atomic::AtomicBool;

use dmaqual::coherency::{BusMasterStatus, CoherencyOutcome, SnoopStatus};
use dmaqual::cpu::{CacheMode, CpuFamily, CpuInfo};
use dmaqual::hal::regs;
use dmaqual::hal::sim::{MemStore, RegWrite, SimAdapter, SimCacheOps, SimClock, SimLookup};
use dmaqual::{CacheOp, CoherencyAnalysis, CoherencyTier, QualContext};

/// Simulated physical placement of [`arena`]. Sits on a 64 KiB boundary
/// so a freshly built bounce pool never straddles one.
pub const ARENA_PHYS: u32 = 0x0004_0000;

const ARENA_LEN: usize = 64 * 1024;

#[repr(align(4096))]
struct Arena([u8; ARENA_LEN]);

/// A fresh 64 KiB allocator arena, leaked for the `'static` lifetime the
/// allocator requires.
pub fn arena() -> &'static mut [u8] {
    &mut Box::leak(Box::new(Arena([0; ARENA_LEN]))).0
}

/// One simulated machine. Tests reach into the public fields to inject
/// faults before building a context.
pub struct Rig {
    pub clock: Rc<SimClock>,
    pub adapter: SimAdapter,
    pub cache_ctl: SimCacheOps,
    pub lookup: SimLookup,
    pub store: MemStore,
    pub stop: Rc<AtomicBool>,
    pub family: CpuFamily,
}

impl Rig {
    pub fn new(family: CpuFamily) -> Self {
        let clock = Rc::new(SimClock::new());
        let adapter = SimAdapter::new(Rc::clone(&clock));
        Self {
            clock,
            adapter,
            cache_ctl: SimCacheOps::new(),
            lookup: SimLookup::new(),
            store: MemStore::new(),
            stop: Rc::new(AtomicBool::new(false)),
            family,
        }
    }

    pub fn ctx(&mut self) -> QualContext<'_> {
        QualContext {
            bus: &mut self.adapter,
            clock: self.clock.as_ref(),
            cache_ctl: &self.cache_ctl,
            lookup: &self.lookup,
            store: &mut self.store,
            stop: self.stop.as_ref(),
            cpu: CpuInfo::new(self.family, "GenuineIntel", 200),
            cache_mode: CacheMode::WriteBack,
            chipset_id: 0x0000_1234,
            io_base: 0x300,
            nic_dma_capable: true,
            driver_version: 0x0042,
        }
    }
}

/// Analysis of a machine with nothing wrong with it.
pub fn permissive_analysis() -> CoherencyAnalysis {
    CoherencyAnalysis {
        cpu: CpuInfo::new(CpuFamily::Pentium, "GenuineIntel", 200),
        cache_mode: CacheMode::WriteBack,
        bus_master: BusMasterStatus::Ok,
        coherency: CoherencyOutcome::Ok,
        snooping: SnoopStatus::Full,
        tier: CoherencyTier::FullDma,
        cache_op: CacheOp::None,
        confidence: 95,
        explanation: "Hardware snooping maintains coherency",
    }
}

/// A command-register write, for write-log tail assertions.
pub fn cmd(value: u16) -> RegWrite {
    RegWrite {
        offset: regs::CMD_STATUS,
        value: u32::from(value),
        wide: false,
    }
}
