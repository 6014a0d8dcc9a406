//! Tiered DMA mapping for packet transfers.
//!
//! Once policy has settled on a coherency tier, every transfer goes
//! through a [`DmaMapper`]: the caller's buffer is used in place when
//! its physical placement suits the bus master, and staged through a
//! pre-allocated bounce slot when it does not. Cache maintenance per
//! transfer is exactly the operation the coherency analysis selected,
//! nothing more. Mapping still succeeds under
//! [`CoherencyTier::DisableBusMaster`] with every sync a strict no-op;
//! not programming the adapter at all under that tier is the caller's
//! responsibility. Map and unmap run in bounded time and never
//! allocate, so they are safe to call from the receive interrupt path.

pub mod bounce;
pub mod boundary;

use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use crate::coherency::{CacheOp, CoherencyAnalysis, CoherencyTier};
use crate::error::{DmaError, DmaResult};
use crate::hal::{CacheMaintenance, PhysicalLookup};
use crate::policy::DmaPolicy;

pub use bounce::{BouncePool, BouncePoolStats, DEFAULT_SLOTS, DEFAULT_SLOT_SIZE};
pub use boundary::{
    crosses_64k, exceeds_16m, AllocFlags, BoundaryAllocStats, BoundaryAllocator, DmaBuffer,
    MAX_ALLOC,
};

bitflags! {
    /// Per-mapping behavior overrides.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u8 {
        /// Stage through a bounce slot even if the buffer is direct-safe.
        const FORCE_BOUNCE = 0x01;
        /// Buffer lives in coherent (uncached or snooped) memory; skip
        /// per-transfer cache maintenance.
        const COHERENT = 0x02;
    }
}

/// Transfer direction relative to the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// CPU to device.
    Transmit,
    /// Device to CPU.
    Receive,
}

/// Whether in-place DMA is allowed for this placement: wholly under the
/// 16 MiB ISA ceiling, 4-byte aligned, and not crossing a 64 KiB
/// boundary.
pub fn direct_safe(phys: u32, len: usize) -> bool {
    !crosses_64k(phys, len) && !exceeds_16m(phys, len) && phys & 0x3 == 0
}

#[derive(Debug)]
enum CallerBuf<'a> {
    Tx(&'a [u8]),
    Rx(&'a mut [u8]),
}

/// A live mapping. Holds the caller's buffer borrowed for the DMA
/// lifetime; give it back through [`DmaMapper::unmap`].
#[derive(Debug)]
pub struct DmaMapping<'a> {
    caller: CallerBuf<'a>,
    device_phys: u32,
    len: usize,
    bounce: Option<u16>,
    coherent: bool,
}

impl DmaMapping<'_> {
    /// Physical address to program into the adapter.
    pub fn device_address(&self) -> u32 {
        self.device_phys
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn direction(&self) -> DmaDirection {
        match self.caller {
            CallerBuf::Tx(_) => DmaDirection::Transmit,
            CallerBuf::Rx(_) => DmaDirection::Receive,
        }
    }

    pub fn is_bounced(&self) -> bool {
        self.bounce.is_some()
    }

    pub fn is_coherent(&self) -> bool {
        self.coherent
    }
}

/// Pool sizing for a mapper.
#[derive(Debug, Clone, Copy)]
pub struct MapperConfig {
    pub tx_slots: u16,
    pub rx_slots: u16,
    pub slot_size: usize,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            tx_slots: DEFAULT_SLOTS,
            rx_slots: DEFAULT_SLOTS,
            slot_size: DEFAULT_SLOT_SIZE,
        }
    }
}

#[derive(Default)]
struct MapCounters {
    total: AtomicU64,
    active: AtomicU64,
    direct: AtomicU64,
    bounced: AtomicU64,
    bounce_copies: AtomicU64,
    cache_syncs: AtomicU64,
    errors: AtomicU64,
    tx: AtomicU64,
    rx: AtomicU64,
}

/// Snapshot of mapper counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct DmaMapStats {
    pub total_mappings: u64,
    pub active_mappings: u64,
    pub direct_mappings: u64,
    pub bounce_mappings: u64,
    pub bounce_copies: u64,
    pub cache_syncs: u64,
    pub mapping_errors: u64,
    pub tx_mappings: u64,
    pub rx_mappings: u64,
}

/// Maps caller buffers for bus-master transfers under one coherency
/// tier.
pub struct DmaMapper<'h> {
    lookup: &'h dyn PhysicalLookup,
    cache_ctl: &'h dyn CacheMaintenance,
    tier: CoherencyTier,
    cache_op: CacheOp,
    tx_pool: BouncePool,
    rx_pool: BouncePool,
    counters: MapCounters,
}

impl<'h> DmaMapper<'h> {
    /// Builds a mapper with both bounce pools drawn from `allocator`.
    pub fn new(
        allocator: &mut BoundaryAllocator,
        lookup: &'h dyn PhysicalLookup,
        cache_ctl: &'h dyn CacheMaintenance,
        tier: CoherencyTier,
        cache_op: CacheOp,
        config: MapperConfig,
    ) -> DmaResult<Self> {
        let tx_pool = BouncePool::new(allocator, "TX", config.tx_slots, config.slot_size)?;
        let rx_pool = BouncePool::new(allocator, "RX", config.rx_slots, config.slot_size)?;
        Ok(Self {
            lookup,
            cache_ctl,
            tier,
            cache_op,
            tx_pool,
            rx_pool,
            counters: MapCounters::default(),
        })
    }

    /// Mapper configured from a coherency analysis.
    pub fn for_analysis(
        allocator: &mut BoundaryAllocator,
        lookup: &'h dyn PhysicalLookup,
        cache_ctl: &'h dyn CacheMaintenance,
        analysis: &CoherencyAnalysis,
        config: MapperConfig,
    ) -> DmaResult<Self> {
        Self::new(
            allocator,
            lookup,
            cache_ctl,
            analysis.tier,
            analysis.cache_op,
            config,
        )
    }

    /// Mapper configured from a settled policy decision.
    pub fn for_policy(
        allocator: &mut BoundaryAllocator,
        lookup: &'h dyn PhysicalLookup,
        cache_ctl: &'h dyn CacheMaintenance,
        policy: &DmaPolicy,
        config: MapperConfig,
    ) -> DmaResult<Self> {
        Self::new(
            allocator,
            lookup,
            cache_ctl,
            policy.tier,
            policy.cache_op,
            config,
        )
    }

    pub fn tier(&self) -> CoherencyTier {
        self.tier
    }

    pub fn cache_op(&self) -> CacheOp {
        self.cache_op
    }

    pub fn map_for_transmit<'a>(&mut self, payload: &'a [u8]) -> DmaResult<DmaMapping<'a>> {
        self.map_for_transmit_flags(payload, MapFlags::empty())
    }

    pub fn map_for_transmit_flags<'a>(
        &mut self,
        payload: &'a [u8],
        flags: MapFlags,
    ) -> DmaResult<DmaMapping<'a>> {
        self.map(CallerBuf::Tx(payload), flags)
    }

    pub fn map_for_receive<'a>(&mut self, buf: &'a mut [u8]) -> DmaResult<DmaMapping<'a>> {
        self.map_for_receive_flags(buf, MapFlags::empty())
    }

    pub fn map_for_receive_flags<'a>(
        &mut self,
        buf: &'a mut [u8],
        flags: MapFlags,
    ) -> DmaResult<DmaMapping<'a>> {
        self.map(CallerBuf::Rx(buf), flags)
    }

    fn map<'a>(&mut self, caller: CallerBuf<'a>, flags: MapFlags) -> DmaResult<DmaMapping<'a>> {
        let (ptr, len, is_tx) = match &caller {
            CallerBuf::Tx(payload) => (payload.as_ptr(), payload.len(), true),
            CallerBuf::Rx(buf) => (buf.as_ptr(), buf.len(), false),
        };
        if len == 0 {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            return Err(DmaError::InvalidArgument {
                name: "buf",
                value: "empty",
            });
        }

        let phys = self.lookup.phys_of(ptr, len);
        let direct = !flags.contains(MapFlags::FORCE_BOUNCE)
            && matches!(phys, Some(p) if direct_safe(p, len));
        let coherent = flags.contains(MapFlags::COHERENT);

        let mapping = if direct {
            self.counters.direct.fetch_add(1, Ordering::Relaxed);
            DmaMapping {
                caller,
                // `direct` only holds when the lookup resolved
                device_phys: phys.unwrap_or(0),
                len,
                bounce: None,
                coherent,
            }
        } else {
            let pool = if is_tx {
                &mut self.tx_pool
            } else {
                &mut self.rx_pool
            };
            let index = match pool.lease(len) {
                Ok(index) => index,
                Err(error) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    return Err(error);
                }
            };
            let slot = match pool.slot_mut(index) {
                Some(slot) => slot,
                None => {
                    pool.release(index);
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    return Err(DmaError::InvalidState {
                        expected: "a leased bounce slot",
                        actual: "slot index out of range",
                    });
                }
            };
            let device_phys = slot.phys();
            if let CallerBuf::Tx(payload) = &caller {
                slot.as_mut_slice()[..len].copy_from_slice(payload);
                self.counters.bounce_copies.fetch_add(1, Ordering::Relaxed);
            }
            self.counters.bounced.fetch_add(1, Ordering::Relaxed);
            DmaMapping {
                caller,
                device_phys,
                len,
                bounce: Some(index),
                coherent,
            }
        };

        self.counters.total.fetch_add(1, Ordering::Relaxed);
        self.counters.active.fetch_add(1, Ordering::Relaxed);
        if is_tx {
            self.counters.tx.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.rx.fetch_add(1, Ordering::Relaxed);
        }

        self.sync(&mapping);

        #[cfg(feature = "map_debug")]
        log::debug!(
            "mapped {:?} len {} at 0x{:08X} bounce={}",
            mapping.direction(),
            mapping.len,
            mapping.device_phys,
            mapping.is_bounced()
        );

        Ok(mapping)
    }

    /// Makes CPU-side writes visible to the device before starting a
    /// transfer.
    pub fn sync_for_device(&mut self, mapping: &DmaMapping<'_>) {
        self.sync(mapping);
    }

    /// Makes device-side writes visible to the CPU after a transfer.
    pub fn sync_for_cpu(&mut self, mapping: &DmaMapping<'_>) {
        self.sync(mapping);
    }

    fn wants_sync(&self, mapping: &DmaMapping<'_>) -> bool {
        !mapping.coherent
            && self.cache_op != CacheOp::None
            && self.tier != CoherencyTier::DisableBusMaster
    }

    fn flush_target(&self, mapping: &DmaMapping<'_>) -> Option<(*const u8, usize)> {
        match mapping.bounce {
            Some(index) => {
                let pool = match mapping.direction() {
                    DmaDirection::Transmit => &self.tx_pool,
                    DmaDirection::Receive => &self.rx_pool,
                };
                pool.slot(index).map(|slot| (slot.as_ptr(), mapping.len))
            }
            None => {
                let ptr = match &mapping.caller {
                    CallerBuf::Tx(payload) => payload.as_ptr(),
                    CallerBuf::Rx(buf) => buf.as_ptr(),
                };
                Some((ptr, mapping.len))
            }
        }
    }

    fn sync(&mut self, mapping: &DmaMapping<'_>) {
        if !self.wants_sync(mapping) {
            return;
        }
        match self.cache_op {
            CacheOp::None => return,
            CacheOp::ClflushLines => {
                let Some((ptr, len)) = self.flush_target(mapping) else {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    return;
                };
                self.cache_ctl.flush_range(ptr, len);
            }
            CacheOp::FullWriteback => self.cache_ctl.writeback_all(),
            CacheOp::SoftwareBarrier => self.cache_ctl.barrier(),
        }
        self.counters.cache_syncs.fetch_add(1, Ordering::Relaxed);
    }

    /// Tears a mapping down. For a bounced receive this is where the
    /// device's bytes reach the caller: sync for CPU, copy the slot back
    /// into the caller's buffer, release the lease. Transmit just
    /// releases.
    pub fn unmap(&mut self, mapping: DmaMapping<'_>) {
        if matches!(mapping.caller, CallerBuf::Rx(_)) {
            self.sync(&mapping);
        }

        let DmaMapping {
            caller,
            len,
            bounce,
            ..
        } = mapping;

        match caller {
            CallerBuf::Rx(dest) => {
                if let Some(index) = bounce {
                    match self.rx_pool.slot(index) {
                        Some(slot) => {
                            dest.copy_from_slice(&slot.as_slice()[..len]);
                            self.counters.bounce_copies.fetch_add(1, Ordering::Relaxed);
                        }
                        None => {
                            log::error!("unmap of unknown RX bounce slot {}", index);
                            self.counters.errors.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    self.rx_pool.release(index);
                }
            }
            CallerBuf::Tx(_) => {
                if let Some(index) = bounce {
                    self.tx_pool.release(index);
                }
            }
        }

        let _ = self
            .counters
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    /// Device-visible view of the mapped bytes. The simulated adapter
    /// writes received frames through this in tests; a direct transmit
    /// mapping has no writable device view.
    pub fn device_buffer_mut<'m>(
        &'m mut self,
        mapping: &'m mut DmaMapping<'_>,
    ) -> Option<&'m mut [u8]> {
        let len = mapping.len;
        match mapping.bounce {
            Some(index) => {
                let pool = match mapping.direction() {
                    DmaDirection::Transmit => &mut self.tx_pool,
                    DmaDirection::Receive => &mut self.rx_pool,
                };
                pool.slot_mut(index)
                    .map(|slot| &mut slot.as_mut_slice()[..len])
            }
            None => match &mut mapping.caller {
                CallerBuf::Rx(buf) => Some(&mut buf[..]),
                CallerBuf::Tx(_) => None,
            },
        }
    }

    pub fn tx_pool_stats(&self) -> BouncePoolStats {
        self.tx_pool.stats()
    }

    pub fn rx_pool_stats(&self) -> BouncePoolStats {
        self.rx_pool.stats()
    }

    pub fn stats(&self) -> DmaMapStats {
        DmaMapStats {
            total_mappings: self.counters.total.load(Ordering::Relaxed),
            active_mappings: self.counters.active.load(Ordering::Relaxed),
            direct_mappings: self.counters.direct.load(Ordering::Relaxed),
            bounce_mappings: self.counters.bounced.load(Ordering::Relaxed),
            bounce_copies: self.counters.bounce_copies.load(Ordering::Relaxed),
            cache_syncs: self.counters.cache_syncs.load(Ordering::Relaxed),
            mapping_errors: self.counters.errors.load(Ordering::Relaxed),
            tx_mappings: self.counters.tx.load(Ordering::Relaxed),
            rx_mappings: self.counters.rx.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.stats();
        log::info!("DMA mapping statistics:");
        log::info!("  Total mappings: {}", stats.total_mappings);
        log::info!("  Active mappings: {}", stats.active_mappings);
        log::info!("  Direct mappings: {}", stats.direct_mappings);
        log::info!("  Bounce mappings: {}", stats.bounce_mappings);
        log::info!("  Bounce copies: {}", stats.bounce_copies);
        log::info!("  Cache syncs: {}", stats.cache_syncs);
        log::info!("  Mapping errors: {}", stats.mapping_errors);
        log::info!(
            "  TX mappings: {}  RX mappings: {}",
            stats.tx_mappings,
            stats.rx_mappings
        );
    }
}
