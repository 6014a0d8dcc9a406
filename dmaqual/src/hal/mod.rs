//! Hardware access seams.
//!
//! Everything the qualification subsystem does to the outside world goes
//! through the traits in this module: adapter register I/O, time, cache
//! maintenance, physical-address resolution, and the persisted result
//! record. Production wires these to port I/O and real instructions;
//! tests wire them to the doubles in [`sim`].

use core::sync::atomic::AtomicBool;

use crate::cpu::{CacheMode, CpuInfo};
use crate::error::DmaResult;

pub mod sim;

#[cfg(target_arch = "x86_64")]
pub mod port;

/// ISA bus-master register window, as offsets from the adapter I/O base.
pub mod regs {
    /// Command (write) / status (read) register.
    pub const CMD_STATUS: u16 = 0x0E;
    /// DMA base address register, 32-bit.
    pub const DMA_ADDRESS: u16 = 0x24;
    /// DMA transfer length register.
    pub const DMA_LENGTH: u16 = 0x26;
    /// Offset outside the decoded window; error-recovery probing writes
    /// here and expects the adapter to ignore it.
    pub const UNDECODED: u16 = 0xFF;

    /// Start the programmed DMA transfer.
    pub const CMD_START_DMA: u16 = 0x8000;
    /// Full adapter reset.
    pub const CMD_GLOBAL_RESET: u16 = 0x0004;
    /// Force programmed-I/O mode. Writing this value also latches the
    /// error bit, which the recovery tests rely on.
    pub const CMD_PIO_MODE: u16 = 0x0001;
    /// Clear command and error state.
    pub const CMD_CLEAR: u16 = 0x0000;

    /// Status bit: DMA engine busy.
    pub const STATUS_DMA_BUSY: u16 = 0x8000;
    /// Status bit: latched error condition.
    pub const STATUS_ERROR: u16 = 0x0001;
}

/// Register access to the candidate adapter.
///
/// Offsets are relative to the adapter's I/O window base; implementations
/// add the base themselves. Reads take `&mut self` because adapter reads
/// can have side effects (clearing latched status, advancing FIFOs).
pub trait AdapterBus {
    /// Read a 16-bit register.
    fn read_register(&mut self, offset: u16) -> u16;

    /// Write a 16-bit register.
    fn write_register(&mut self, offset: u16, value: u16);

    /// Read a 32-bit register.
    fn read_register32(&mut self, offset: u16) -> u32;

    /// Write a 32-bit register.
    fn write_register32(&mut self, offset: u16, value: u32);
}

/// Millisecond-granularity time source.
///
/// The qualification harness paces transfers and enforces phase budgets
/// with this; granularity coarser than 1 ms (the DOS timer tick) is
/// tolerated by every caller.
pub trait Clock {
    /// Monotonic milliseconds since an arbitrary epoch.
    fn now_ms(&self) -> u32;

    /// Block for at least `ms` milliseconds.
    fn delay_ms(&self, ms: u32);
}

/// Cache maintenance primitives.
///
/// Which of these the mapping layer invokes is decided once by coherency
/// analysis; see [`crate::coherency::CacheOp`].
pub trait CacheMaintenance {
    /// Write back and invalidate the entire cache (WBINVD class).
    fn writeback_all(&self);

    /// Flush the cache lines covering `len` bytes at `ptr` (CLFLUSH class).
    fn flush_range(&self, ptr: *const u8, len: usize);

    /// Ordering barrier for write-through and uncached configurations.
    fn barrier(&self);
}

/// Resolves the bus-visible physical address of a driver buffer.
pub trait PhysicalLookup {
    /// Physical address of `len` bytes starting at `ptr`, or `None` when
    /// the region cannot be addressed by the device. Callers treat `None`
    /// as "must bounce", never as an error.
    fn phys_of(&self, ptr: *const u8, len: usize) -> Option<u32>;
}

/// Persistence backing for the qualification result record.
///
/// One record per adapter; the store does not interpret the bytes.
pub trait CacheStore {
    /// Read the record into `buf`. `Ok(n)` is the byte count actually
    /// read; `Ok(0)` means no record exists.
    fn read(&mut self, buf: &mut [u8]) -> DmaResult<usize>;

    /// Replace the record.
    fn write(&mut self, data: &[u8]) -> DmaResult<()>;

    /// Remove the record. Removing an absent record succeeds.
    fn delete(&mut self) -> DmaResult<()>;
}

/// Everything qualification needs about the machine, bundled so the
/// harness, analyzer, and policy layers share one signature.
pub struct QualContext<'a> {
    pub bus: &'a mut dyn AdapterBus,
    pub clock: &'a dyn Clock,
    pub cache_ctl: &'a dyn CacheMaintenance,
    pub lookup: &'a dyn PhysicalLookup,
    pub store: &'a mut dyn CacheStore,
    /// Raised by the keyboard/watchdog ISR to abort a running test.
    pub stop: &'a AtomicBool,
    pub cpu: CpuInfo,
    pub cache_mode: CacheMode,
    /// Chipset identity from PCI/EISA probing, part of the cache fingerprint.
    pub chipset_id: u32,
    /// Adapter I/O window base, part of the cache fingerprint.
    pub io_base: u16,
    /// Whether the detected NIC model has a bus-master DMA engine at all.
    pub nic_dma_capable: bool,
    /// Running driver version (BCD), part of the cache fingerprint.
    pub driver_version: u16,
}
