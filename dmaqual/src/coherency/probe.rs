//! Chipset probing behind the coherency analysis.
//!
//! Three stages, each driving real transfers through the adapter's DMA
//! window: raw bus-master functionality, CPU/device agreement on memory
//! contents, and chipset snoop behavior. Each stage owns a distinct
//! probe address range so a failure can be traced to the stage that hit
//! it.

use core::ptr;

use log::debug;

use crate::cpu::CacheMode;
use crate::hal::{regs, AdapterBus, CacheMaintenance, Clock};

use super::{BusMasterStatus, CoherencyOutcome, SnoopStatus};

/// Bit patterns pushed through the loopback probe. Alternating, walking,
/// all-ones/zeros, and signature words catch stuck and coupled data
/// lines.
pub const COHERENCY_PATTERNS: [u32; 12] = [
    0xAA55_55AA,
    0x55AA_AA55,
    0x1234_5678,
    0x8765_4321,
    0xDEAD_BEEF,
    0xCAFE_BABE,
    0x0000_0000,
    0xFFFF_FFFF,
    0x0F0F_0F0F,
    0xF0F0_F0F0,
    0x3333_3333,
    0xCCCC_CCCC,
];

/// Probe window for the stage-1 loopback transfers.
pub const STAGE1_WINDOW: u32 = 0x0004_0000;
/// Stage-2 dirty-line visibility probe address.
pub const STAGE2_WRITE_PROBE: u32 = 0x0005_0000;
/// Stage-2 invalidation survival probe address.
pub const STAGE2_INVALIDATE_PROBE: u32 = 0x0005_0100;
/// Base of the stage-3 snoop timing window; each size probes at
/// `STAGE3_WINDOW + size`.
pub const STAGE3_WINDOW: u32 = 0x0006_0000;

const SNOOP_SIZES: [u16; 4] = [64, 256, 1024, 2048];
/// A snooped transfer is CPU-visible within the transfer's own pacing.
const SNOOP_VISIBLE_MS: u32 = 5;

/// Program one transfer and wait for the engine to retire it. Always
/// leaves the command register cleared.
fn run_transfer(bus: &mut dyn AdapterBus, clock: &dyn Clock, addr: u32, len: u16) -> bool {
    bus.write_register32(regs::DMA_ADDRESS, addr);
    bus.write_register(regs::DMA_LENGTH, len);
    bus.write_register(regs::CMD_STATUS, regs::CMD_START_DMA);
    clock.delay_ms(1);
    let completed = bus.read_register(regs::CMD_STATUS) & regs::STATUS_DMA_BUSY == 0;
    bus.write_register(regs::CMD_STATUS, regs::CMD_CLEAR);
    completed
}

/// One pattern through one loopback leg: CPU stages the word, the
/// engine moves it, the word must read back intact.
fn loopback(bus: &mut dyn AdapterBus, clock: &dyn Clock, addr: u32, pattern: u32) -> bool {
    let mut window: u32 = 0;
    // SAFETY: window is a live, aligned local; volatile keeps the
    // exchange out of the optimizer's hands.
    unsafe { ptr::write_volatile(&mut window, pattern) };
    let completed = run_transfer(bus, clock, addr, 4);
    // SAFETY: as above.
    let echoed = unsafe { ptr::read_volatile(&window) };
    completed && echoed == pattern
}

/// Stage 1: does the DMA engine move data at all.
///
/// Every pattern runs in both directions. A single flaky leg downgrades
/// the verdict to `Partial`; losing half or more means the engine
/// cannot be trusted with real frames.
pub fn bus_master_functionality(bus: &mut dyn AdapterBus, clock: &dyn Clock) -> BusMasterStatus {
    let total = (COHERENCY_PATTERNS.len() * 2) as u32;
    let mut passed = 0u32;
    for (i, &pattern) in COHERENCY_PATTERNS.iter().enumerate() {
        for direction in 0..2u32 {
            let addr = STAGE1_WINDOW + (i as u32) * 8 + direction * 4;
            if loopback(bus, clock, addr, pattern) {
                passed += 1;
            }
        }
    }
    debug!("bus-master loopback: {passed}/{total} legs passed");
    if passed == total {
        BusMasterStatus::Ok
    } else if passed > total / 2 {
        BusMasterStatus::Partial
    } else {
        BusMasterStatus::Broken
    }
}

fn verify_window(window: &[u8], expected: impl Fn(usize) -> u8) -> bool {
    for (i, byte) in window.iter().enumerate() {
        // SAFETY: byte points into the live window slice.
        let observed = unsafe { ptr::read_volatile(byte) };
        if observed != expected(i) {
            return false;
        }
    }
    true
}

/// CPU fills a cache line's worth of data, the device reads it back out,
/// and the contents must match what the CPU wrote. Stale dirty lines
/// show up as a mismatch.
fn dirty_line_probe(
    bus: &mut dyn AdapterBus,
    clock: &dyn Clock,
    cache_ctl: &dyn CacheMaintenance,
    addr: u32,
) -> bool {
    let mut window = [0u8; 64];
    for (i, byte) in window.iter_mut().enumerate() {
        *byte = (i as u8) ^ 0xA5;
    }
    cache_ctl.barrier();
    let completed = run_transfer(bus, clock, addr, window.len() as u16);
    completed && verify_window(&window, |i| (i as u8) ^ 0xA5)
}

/// Force every line out of the cache, run a device transfer over the
/// window, and check the data still reads coherently afterwards.
fn invalidate_probe(
    bus: &mut dyn AdapterBus,
    clock: &dyn Clock,
    cache_ctl: &dyn CacheMaintenance,
    addr: u32,
) -> bool {
    let mut window = [0u8; 64];
    for (i, byte) in window.iter_mut().enumerate() {
        *byte = (i as u8).wrapping_mul(3);
    }
    cache_ctl.writeback_all();
    let completed = run_transfer(bus, clock, addr, window.len() as u16);
    completed && verify_window(&window, |i| (i as u8).wrapping_mul(3))
}

/// Stage 2: do CPU and device agree on memory contents.
///
/// Only a write-back cache can disagree with the device; anything else
/// is coherent by construction and the probe is skipped.
pub fn cache_coherency(
    bus: &mut dyn AdapterBus,
    clock: &dyn Clock,
    cache_mode: CacheMode,
    cache_ctl: &dyn CacheMaintenance,
) -> CoherencyOutcome {
    if cache_mode != CacheMode::WriteBack {
        debug!("cache mode {cache_mode:?} is coherent by construction");
        return CoherencyOutcome::Ok;
    }
    let write_visible = dirty_line_probe(bus, clock, cache_ctl, STAGE2_WRITE_PROBE);
    let survives_invalidate = invalidate_probe(bus, clock, cache_ctl, STAGE2_INVALIDATE_PROBE);
    debug!("coherency probes: write-visible {write_visible}, invalidate-safe {survives_invalidate}");
    if write_visible && survives_invalidate {
        CoherencyOutcome::Ok
    } else {
        CoherencyOutcome::Problem
    }
}

/// Stage 3: does the chipset snoop DMA traffic into the cache.
///
/// Runs one transfer per size and requires it to be CPU-visible within
/// the transfer's own pacing, with no flush in between. Meaningless
/// without a write-back cache.
pub fn snoop_behavior(
    bus: &mut dyn AdapterBus,
    clock: &dyn Clock,
    cache_mode: CacheMode,
) -> SnoopStatus {
    if cache_mode != CacheMode::WriteBack {
        return SnoopStatus::Unknown;
    }
    let mut snooped = 0u32;
    for &size in &SNOOP_SIZES {
        let addr = STAGE3_WINDOW + u32::from(size);
        let before = clock.now_ms();
        let completed = run_transfer(bus, clock, addr, size);
        let elapsed = clock.now_ms().saturating_sub(before);
        if completed && elapsed <= SNOOP_VISIBLE_MS {
            snooped += 1;
        }
    }
    debug!(
        "snoop timing: {snooped}/{} sizes visible without flush",
        SNOOP_SIZES.len()
    );
    match snooped {
        n if n == SNOOP_SIZES.len() as u32 => SnoopStatus::Full,
        0 => SnoopStatus::None,
        _ => SnoopStatus::Partial,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::{SimAdapter, SimCacheOps, SimClock};
    use alloc::rc::Rc;

    fn rig() -> (Rc<SimClock>, SimAdapter) {
        let clock = Rc::new(SimClock::new());
        let adapter = SimAdapter::new(Rc::clone(&clock));
        (clock, adapter)
    }

    #[test]
    fn healthy_adapter_passes_all_loopback_legs() {
        let (clock, mut adapter) = rig();
        let status = bus_master_functionality(&mut adapter, clock.as_ref());
        assert_eq!(status, BusMasterStatus::Ok);
        assert_eq!(adapter.starts(), 24);
    }

    #[test]
    fn stuck_engine_reads_as_broken() {
        let (clock, mut adapter) = rig();
        adapter.behavior.stuck_busy = true;
        let status = bus_master_functionality(&mut adapter, clock.as_ref());
        assert_eq!(status, BusMasterStatus::Broken);
    }

    #[test]
    fn losing_a_minority_of_legs_reads_as_partial() {
        let (clock, mut adapter) = rig();
        // Fail 8 of the 24 legs by address.
        for leg in 0..8u32 {
            adapter.behavior.fail_addresses.push(STAGE1_WINDOW + leg * 4);
        }
        let status = bus_master_functionality(&mut adapter, clock.as_ref());
        assert_eq!(status, BusMasterStatus::Partial);
    }

    #[test]
    fn non_writeback_cache_skips_the_coherency_probe() {
        let (clock, mut adapter) = rig();
        let cache_ctl = SimCacheOps::new();
        let outcome = cache_coherency(
            &mut adapter,
            clock.as_ref(),
            CacheMode::WriteThrough,
            &cache_ctl,
        );
        assert_eq!(outcome, CoherencyOutcome::Ok);
        assert_eq!(adapter.accesses(), 0);
    }

    #[test]
    fn failed_probe_transfer_reports_a_problem() {
        let (clock, mut adapter) = rig();
        adapter.behavior.fail_addresses.push(STAGE2_WRITE_PROBE);
        let cache_ctl = SimCacheOps::new();
        let outcome = cache_coherency(
            &mut adapter,
            clock.as_ref(),
            CacheMode::WriteBack,
            &cache_ctl,
        );
        assert_eq!(outcome, CoherencyOutcome::Problem);
        // The invalidation probe forces lines out through the
        // maintenance seam.
        assert!(cache_ctl.writeback_all_calls.get() >= 1);
    }

    #[test]
    fn clean_probes_report_coherent() {
        let (clock, mut adapter) = rig();
        let cache_ctl = SimCacheOps::new();
        let outcome = cache_coherency(
            &mut adapter,
            clock.as_ref(),
            CacheMode::WriteBack,
            &cache_ctl,
        );
        assert_eq!(outcome, CoherencyOutcome::Ok);
    }

    #[test]
    fn snoop_grades_by_completed_sizes() {
        let (clock, mut adapter) = rig();
        assert_eq!(
            snoop_behavior(&mut adapter, clock.as_ref(), CacheMode::WriteBack),
            SnoopStatus::Full
        );

        let (clock, mut adapter) = rig();
        adapter.behavior.fail_addresses.push(STAGE3_WINDOW + 64);
        adapter.behavior.fail_addresses.push(STAGE3_WINDOW + 256);
        assert_eq!(
            snoop_behavior(&mut adapter, clock.as_ref(), CacheMode::WriteBack),
            SnoopStatus::Partial
        );

        let (clock, mut adapter) = rig();
        for &size in &SNOOP_SIZES {
            adapter.behavior.fail_addresses.push(STAGE3_WINDOW + u32::from(size));
        }
        assert_eq!(
            snoop_behavior(&mut adapter, clock.as_ref(), CacheMode::WriteBack),
            SnoopStatus::None
        );
    }

    #[test]
    fn snoop_is_unknown_without_writeback_cache() {
        let (clock, mut adapter) = rig();
        assert_eq!(
            snoop_behavior(&mut adapter, clock.as_ref(), CacheMode::Disabled),
            SnoopStatus::Unknown
        );
        assert_eq!(adapter.accesses(), 0);
    }
}
