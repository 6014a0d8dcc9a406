//! Software doubles for the hardware seams.
//!
//! [`SimAdapter`] models the bus-master register window of a healthy
//! adapter; [`SimBehavior`] knobs degrade it into the broken hardware the
//! qualification tests must recognize. The adapter bills register-access
//! time to a shared [`SimClock`] so the timing-sensitive tests see
//! plausible durations without real sleeps.

use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::Cell;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::error::{DmaError, DmaResult};
use crate::hal::{regs, AdapterBus, CacheMaintenance, CacheStore, Clock, PhysicalLookup};

/// Deterministic time source. Never advances on its own; register
/// accesses and `delay_ms` both add to it.
pub struct SimClock {
    micros: Cell<u64>,
}

impl SimClock {
    pub fn new() -> Self {
        // Nonzero epoch so an uninitialized "0 ms" timestamp stands out.
        Self {
            micros: Cell::new(10_000),
        }
    }

    pub fn advance_us(&self, us: u64) {
        self.micros.set(self.micros.get() + us);
    }

    pub fn now_us(&self) -> u64 {
        self.micros.get()
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SimClock {
    fn now_ms(&self) -> u32 {
        (self.micros.get() / 1000) as u32
    }

    fn delay_ms(&self, ms: u32) {
        self.advance_us(u64::from(ms) * 1000);
    }
}

/// Starts begin failing once the shared clock passes `after_ms`.
#[derive(Debug, Clone, Copy)]
pub struct DegradeAfter {
    pub after_ms: u32,
    /// 1 fails every start, 2 every second start, and so on.
    pub every_nth: u32,
}

/// Fault-injection knobs for [`SimAdapter`]. Everything defaults to a
/// healthy adapter.
pub struct SimBehavior {
    /// Status reads return this fixed value; models a dead or absent
    /// adapter (0xFFFF floating bus, 0x0000 unpowered).
    pub dead_status: Option<u16>,
    /// The DMA engine never reports completion.
    pub stuck_busy: bool,
    /// Writes to the DMA address register are dropped.
    pub drop_address_writes: bool,
    /// Writes to the DMA length register are dropped.
    pub drop_length_writes: bool,
    /// The latched error bit cannot be cleared.
    pub error_latch_stuck: bool,
    /// Writes to undecoded offsets corrupt adapter state instead of
    /// being ignored.
    pub undecoded_corrupts_status: bool,
    /// Transfers programmed at these DMA addresses never complete.
    pub fail_addresses: Vec<u32>,
    /// Transfers of these lengths never complete.
    pub fail_lengths: Vec<u16>,
    /// Time-gated completion failures, for degrading long soak runs.
    pub degrade: Option<DegradeAfter>,
    /// Microseconds billed to the shared clock per register access.
    pub io_cost_us: u32,
}

impl Default for SimBehavior {
    fn default() -> Self {
        Self {
            dead_status: None,
            stuck_busy: false,
            drop_address_writes: false,
            drop_length_writes: false,
            error_latch_stuck: false,
            undecoded_corrupts_status: false,
            fail_addresses: Vec::new(),
            fail_lengths: Vec::new(),
            degrade: None,
            io_cost_us: 10,
        }
    }
}

/// One observed register write, for sequence assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegWrite {
    pub offset: u16,
    pub value: u32,
    pub wide: bool,
}

/// Register-level model of a bus-master adapter.
pub struct SimAdapter {
    clock: Rc<SimClock>,
    pub behavior: SimBehavior,
    /// Every write, in order.
    pub writes: Vec<RegWrite>,
    dma_address: u32,
    dma_length: u16,
    busy: bool,
    error: bool,
    base_status: u16,
    accesses: u32,
    starts: u32,
    trip: Option<(u32, Rc<AtomicBool>)>,
}

impl SimAdapter {
    /// A healthy adapter billing time to `clock`.
    pub fn new(clock: Rc<SimClock>) -> Self {
        Self {
            clock,
            behavior: SimBehavior::default(),
            writes: Vec::new(),
            dma_address: 0,
            dma_length: 0,
            busy: false,
            error: false,
            // Idle pattern distinct from the dead-adapter values.
            base_status: 0x0010,
            accesses: 0,
            starts: 0,
            trip: None,
        }
    }

    /// Raise `flag` once `count` register accesses have happened. Models
    /// an operator abort arriving mid-test.
    pub fn trip_stop_after(&mut self, count: u32, flag: Rc<AtomicBool>) {
        self.trip = Some((count, flag));
    }

    /// Total register accesses so far.
    pub fn accesses(&self) -> u32 {
        self.accesses
    }

    /// DMA transfers started so far.
    pub fn starts(&self) -> u32 {
        self.starts
    }

    /// True when `seq` matches the tail of the observed write log.
    pub fn writes_end_with(&self, seq: &[RegWrite]) -> bool {
        self.writes.len() >= seq.len() && self.writes[self.writes.len() - seq.len()..] == *seq
    }

    fn bill(&mut self) {
        self.accesses += 1;
        self.clock.advance_us(u64::from(self.behavior.io_cost_us));
        if let Some((count, flag)) = &self.trip {
            if self.accesses >= *count {
                flag.store(true, Ordering::Relaxed);
            }
        }
    }

    fn start_completes(&mut self) -> bool {
        self.starts += 1;
        if self.behavior.stuck_busy {
            return false;
        }
        if self.behavior.fail_addresses.contains(&self.dma_address) {
            return false;
        }
        if self.behavior.fail_lengths.contains(&self.dma_length) {
            return false;
        }
        if let Some(degrade) = self.behavior.degrade {
            if self.clock.now_ms() >= degrade.after_ms
                && degrade.every_nth > 0
                && self.starts % degrade.every_nth == 0
            {
                return false;
            }
        }
        true
    }

    fn command(&mut self, value: u16) {
        match value {
            regs::CMD_START_DMA => {
                self.busy = !self.start_completes();
            }
            regs::CMD_GLOBAL_RESET => {
                self.busy = false;
                self.dma_address = 0;
                self.dma_length = 0;
                if !self.behavior.error_latch_stuck {
                    self.error = false;
                }
            }
            regs::CMD_PIO_MODE => {
                self.error = true;
            }
            regs::CMD_CLEAR => {
                self.busy = false;
                if !self.behavior.error_latch_stuck {
                    self.error = false;
                }
            }
            // Other command patterns (register hold-time probes) have no
            // modeled effect.
            _ => {}
        }
    }

    fn status(&self) -> u16 {
        if let Some(fixed) = self.behavior.dead_status {
            return fixed;
        }
        let mut status = self.base_status;
        if self.busy || self.behavior.stuck_busy {
            status |= regs::STATUS_DMA_BUSY;
        }
        if self.error {
            status |= regs::STATUS_ERROR;
        }
        status
    }
}

impl AdapterBus for SimAdapter {
    fn read_register(&mut self, offset: u16) -> u16 {
        self.bill();
        match offset {
            regs::CMD_STATUS => self.status(),
            regs::DMA_LENGTH => self.dma_length,
            _ => 0,
        }
    }

    fn write_register(&mut self, offset: u16, value: u16) {
        self.bill();
        self.writes.push(RegWrite {
            offset,
            value: u32::from(value),
            wide: false,
        });
        match offset {
            regs::CMD_STATUS => self.command(value),
            regs::DMA_LENGTH => {
                if !self.behavior.drop_length_writes {
                    self.dma_length = value;
                }
            }
            _ => {
                if self.behavior.undecoded_corrupts_status {
                    self.base_status ^= 0x0040;
                }
            }
        }
    }

    fn read_register32(&mut self, offset: u16) -> u32 {
        self.bill();
        match offset {
            regs::DMA_ADDRESS => self.dma_address,
            _ => 0,
        }
    }

    fn write_register32(&mut self, offset: u16, value: u32) {
        self.bill();
        self.writes.push(RegWrite {
            offset,
            value,
            wide: true,
        });
        if offset == regs::DMA_ADDRESS && !self.behavior.drop_address_writes {
            self.dma_address = value;
        }
    }
}

/// Counts cache-maintenance calls instead of executing them.
#[derive(Default)]
pub struct SimCacheOps {
    pub writeback_all_calls: Cell<u32>,
    pub flush_range_calls: Cell<u32>,
    pub flushed_bytes: Cell<usize>,
    pub barrier_calls: Cell<u32>,
}

impl SimCacheOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_calls(&self) -> u32 {
        self.writeback_all_calls.get() + self.flush_range_calls.get() + self.barrier_calls.get()
    }
}

impl CacheMaintenance for SimCacheOps {
    fn writeback_all(&self) {
        self.writeback_all_calls.set(self.writeback_all_calls.get() + 1);
    }

    fn flush_range(&self, _ptr: *const u8, len: usize) {
        self.flush_range_calls.set(self.flush_range_calls.get() + 1);
        self.flushed_bytes.set(self.flushed_bytes.get() + len);
    }

    fn barrier(&self) {
        self.barrier_calls.set(self.barrier_calls.get() + 1);
    }
}

struct Region {
    start: usize,
    len: usize,
    phys: u32,
}

/// Physical-address table keyed by virtual region. Tests register each
/// buffer with whatever physical placement the scenario needs, which is
/// how boundary-crossing layouts are staged without real segment math.
#[derive(Default)]
pub struct SimLookup {
    regions: Vec<Region>,
}

impl SimLookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare that `len` bytes at `ptr` sit at physical `phys`.
    pub fn map_region(&mut self, ptr: *const u8, len: usize, phys: u32) {
        self.regions.push(Region {
            start: ptr as usize,
            len,
            phys,
        });
    }
}

impl PhysicalLookup for SimLookup {
    fn phys_of(&self, ptr: *const u8, len: usize) -> Option<u32> {
        let start = ptr as usize;
        let end = start.checked_add(len)?;
        for region in &self.regions {
            let region_end = region.start + region.len;
            if start >= region.start && end <= region_end {
                return Some(region.phys + (start - region.start) as u32);
            }
        }
        None
    }
}

/// In-memory record store with fault injection.
#[derive(Default)]
pub struct MemStore {
    record: Option<Vec<u8>>,
    pub fail_reads: bool,
    pub fail_writes: bool,
    pub fail_deletes: bool,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip one bit of the stored record, for checksum tests.
    pub fn corrupt_byte(&mut self, index: usize) {
        if let Some(record) = &mut self.record {
            if let Some(byte) = record.get_mut(index) {
                *byte ^= 0x01;
            }
        }
    }

    pub fn raw(&self) -> Option<&[u8]> {
        self.record.as_deref()
    }
}

impl CacheStore for MemStore {
    fn read(&mut self, buf: &mut [u8]) -> DmaResult<usize> {
        if self.fail_reads {
            return Err(DmaError::StoreRead {
                detail: "injected read fault",
            });
        }
        match &self.record {
            Some(record) => {
                let n = record.len().min(buf.len());
                buf[..n].copy_from_slice(&record[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    fn write(&mut self, data: &[u8]) -> DmaResult<()> {
        if self.fail_writes {
            return Err(DmaError::StoreWrite {
                detail: "injected write fault",
            });
        }
        self.record = Some(data.to_vec());
        Ok(())
    }

    fn delete(&mut self) -> DmaResult<()> {
        if self.fail_deletes {
            return Err(DmaError::StoreDelete {
                detail: "injected delete fault",
            });
        }
        self.record = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rig() -> (Rc<SimClock>, SimAdapter) {
        let clock = Rc::new(SimClock::new());
        let adapter = SimAdapter::new(Rc::clone(&clock));
        (clock, adapter)
    }

    #[test]
    fn healthy_adapter_completes_transfers() {
        let (_clock, mut adapter) = rig();
        adapter.write_register32(regs::DMA_ADDRESS, 0x0001_0000);
        adapter.write_register(regs::DMA_LENGTH, 64);
        adapter.write_register(regs::CMD_STATUS, regs::CMD_START_DMA);
        let status = adapter.read_register(regs::CMD_STATUS);
        assert_eq!(status & regs::STATUS_DMA_BUSY, 0);
        assert_eq!(adapter.read_register32(regs::DMA_ADDRESS), 0x0001_0000);
        assert_eq!(adapter.starts(), 1);
    }

    #[test]
    fn stuck_busy_never_clears() {
        let (_clock, mut adapter) = rig();
        adapter.behavior.stuck_busy = true;
        adapter.write_register(regs::CMD_STATUS, regs::CMD_START_DMA);
        adapter.write_register(regs::CMD_STATUS, regs::CMD_CLEAR);
        let status = adapter.read_register(regs::CMD_STATUS);
        assert_ne!(status & regs::STATUS_DMA_BUSY, 0);
    }

    #[test]
    fn failed_address_leaves_engine_busy_until_cleared() {
        let (_clock, mut adapter) = rig();
        adapter.behavior.fail_addresses.push(0x0002_0000);
        adapter.write_register32(regs::DMA_ADDRESS, 0x0002_0000);
        adapter.write_register(regs::CMD_STATUS, regs::CMD_START_DMA);
        assert_ne!(
            adapter.read_register(regs::CMD_STATUS) & regs::STATUS_DMA_BUSY,
            0
        );
        adapter.write_register(regs::CMD_STATUS, regs::CMD_CLEAR);
        assert_eq!(
            adapter.read_register(regs::CMD_STATUS) & regs::STATUS_DMA_BUSY,
            0
        );
    }

    #[test]
    fn io_time_is_billed_to_the_shared_clock() {
        let (clock, mut adapter) = rig();
        adapter.behavior.io_cost_us = 100;
        let before = clock.now_us();
        for _ in 0..10 {
            adapter.read_register(regs::CMD_STATUS);
        }
        assert_eq!(clock.now_us() - before, 1000);
    }

    #[test]
    fn trip_raises_stop_flag_at_threshold() {
        let (_clock, mut adapter) = rig();
        let stop = Rc::new(AtomicBool::new(false));
        adapter.trip_stop_after(3, Rc::clone(&stop));
        adapter.read_register(regs::CMD_STATUS);
        adapter.read_register(regs::CMD_STATUS);
        assert!(!stop.load(Ordering::Relaxed));
        adapter.read_register(regs::CMD_STATUS);
        assert!(stop.load(Ordering::Relaxed));
    }

    #[test]
    fn error_latch_follows_commands() {
        let (_clock, mut adapter) = rig();
        adapter.write_register(regs::CMD_STATUS, regs::CMD_PIO_MODE);
        assert_ne!(
            adapter.read_register(regs::CMD_STATUS) & regs::STATUS_ERROR,
            0
        );
        adapter.write_register(regs::CMD_STATUS, regs::CMD_CLEAR);
        assert_eq!(
            adapter.read_register(regs::CMD_STATUS) & regs::STATUS_ERROR,
            0
        );

        adapter.behavior.error_latch_stuck = true;
        adapter.write_register(regs::CMD_STATUS, regs::CMD_PIO_MODE);
        adapter.write_register(regs::CMD_STATUS, regs::CMD_CLEAR);
        assert_ne!(
            adapter.read_register(regs::CMD_STATUS) & regs::STATUS_ERROR,
            0
        );
    }

    #[test]
    fn lookup_resolves_only_registered_regions() {
        let buf = [0u8; 32];
        let mut lookup = SimLookup::new();
        lookup.map_region(buf.as_ptr(), buf.len(), 0x0008_0000);
        assert_eq!(lookup.phys_of(buf.as_ptr(), 32), Some(0x0008_0000));
        assert_eq!(lookup.phys_of(buf[8..].as_ptr(), 8), Some(0x0008_0008));
        // Overrunning the region fails.
        assert_eq!(lookup.phys_of(buf.as_ptr(), 64), None);
        let other = [0u8; 4];
        assert_eq!(lookup.phys_of(other.as_ptr(), 4), None);
    }

    #[test]
    fn store_roundtrip_and_faults() {
        let mut store = MemStore::new();
        let mut buf = [0u8; 8];
        assert_eq!(store.read(&mut buf), Ok(0));
        store.write(&[1, 2, 3, 4]).unwrap();
        assert_eq!(store.read(&mut buf), Ok(4));
        assert_eq!(&buf[..4], &[1, 2, 3, 4]);
        store.delete().unwrap();
        assert_eq!(store.read(&mut buf), Ok(0));
        // Deleting an absent record still succeeds.
        assert!(store.delete().is_ok());

        store.fail_reads = true;
        assert!(store.read(&mut buf).is_err());
    }
}
