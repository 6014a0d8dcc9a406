//! Bounce slot pools for transfers the bus master cannot reach in place.
//!
//! Slots are drawn from the boundary-safe allocator once at build time
//! and leased per transfer afterwards, so the mapping hot path never
//! allocates. Transmit and receive keep separate pools: a receive burst
//! must not starve transmit of slots.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{DmaError, DmaResult};

use super::boundary::{crosses_64k, AllocFlags, BoundaryAllocator, DmaBuffer, MIN_ALIGN};

/// Default slot size: full Ethernet frame plus headers and alignment
/// slack.
pub const DEFAULT_SLOT_SIZE: usize = 2048;

/// Default slots per direction.
pub const DEFAULT_SLOTS: u16 = 8;

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct BouncePoolStats {
    pub slots: u16,
    pub free: u16,
    pub slot_size: usize,
    pub leases: u64,
    pub releases: u64,
    pub exhaustions: u64,
}

/// Fixed set of DMA-safe slots for one transfer direction.
pub struct BouncePool {
    slots: Vec<DmaBuffer>,
    in_use: Vec<bool>,
    free_list: Vec<u16>,
    slot_size: usize,
    direction: &'static str,
    leases: AtomicU64,
    releases: AtomicU64,
    exhaustions: AtomicU64,
}

impl BouncePool {
    /// Allocates `count` slots of `slot_size` bytes. Every slot is
    /// checked against the 64 KiB rule after allocation; a violating
    /// slot fails construction outright.
    pub fn new(
        allocator: &mut BoundaryAllocator,
        direction: &'static str,
        count: u16,
        slot_size: usize,
    ) -> DmaResult<Self> {
        if count == 0 {
            return Err(DmaError::InvalidArgument {
                name: "count",
                value: "zero",
            });
        }

        let mut slots = Vec::with_capacity(usize::from(count));
        let mut free_list = Vec::with_capacity(usize::from(count));
        for index in 0..count {
            let slot = allocator.alloc(
                slot_size,
                MIN_ALIGN,
                AllocFlags::NO_CROSS_64K | AllocFlags::BELOW_16M | AllocFlags::CONTIGUOUS,
            )?;
            if crosses_64k(slot.phys(), slot_size) {
                return Err(DmaError::UnsafePlacement {
                    phys: slot.phys(),
                    len: slot_size,
                });
            }
            log::debug!(
                "{} bounce slot {}: phys 0x{:08X} len {}",
                direction,
                index,
                slot.phys(),
                slot_size
            );
            slots.push(slot);
            free_list.push(index);
        }

        log::info!(
            "{} bounce pool ready: {} slots of {} bytes",
            direction,
            count,
            slot_size
        );

        Ok(Self {
            slots,
            in_use: alloc::vec![false; usize::from(count)],
            free_list,
            slot_size,
            direction,
            leases: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            exhaustions: AtomicU64::new(0),
        })
    }

    /// Leases a slot able to hold `len` bytes.
    pub fn lease(&mut self, len: usize) -> DmaResult<u16> {
        if len > self.slot_size {
            return Err(DmaError::TransferTooLarge {
                len,
                max: self.slot_size,
            });
        }
        match self.free_list.pop() {
            Some(index) => {
                self.in_use[usize::from(index)] = true;
                self.leases.fetch_add(1, Ordering::Relaxed);
                Ok(index)
            }
            None => {
                self.exhaustions.fetch_add(1, Ordering::Relaxed);
                log::warn!("{} bounce pool exhausted", self.direction);
                Err(DmaError::BouncePoolExhausted {
                    direction: self.direction,
                })
            }
        }
    }

    /// Returns a leased slot. A stale or double release is logged and
    /// ignored rather than corrupting the free list.
    pub fn release(&mut self, index: u16) {
        let Some(flag) = self.in_use.get_mut(usize::from(index)) else {
            log::error!("{} bounce release of unknown slot {}", self.direction, index);
            return;
        };
        if !*flag {
            log::error!(
                "{} bounce release of slot {} that is not leased",
                self.direction,
                index
            );
            return;
        }
        *flag = false;
        self.free_list.push(index);
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    pub fn slot(&self, index: u16) -> Option<&DmaBuffer> {
        self.slots.get(usize::from(index))
    }

    pub fn slot_mut(&mut self, index: u16) -> Option<&mut DmaBuffer> {
        self.slots.get_mut(usize::from(index))
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn free_slots(&self) -> usize {
        self.free_list.len()
    }

    pub fn stats(&self) -> BouncePoolStats {
        BouncePoolStats {
            slots: self.slots.len() as u16,
            free: self.free_list.len() as u16,
            slot_size: self.slot_size,
            leases: self.leases.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            exhaustions: self.exhaustions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARENA_LEN: usize = 64 * 1024;

    #[repr(align(4096))]
    struct Arena([u8; ARENA_LEN]);

    fn allocator() -> BoundaryAllocator {
        let arena = &mut Box::leak(Box::new(Arena([0; ARENA_LEN]))).0;
        BoundaryAllocator::new(arena, 0x0004_0000)
    }

    #[test]
    fn every_slot_is_boundary_safe() {
        let mut alloc = allocator();
        let pool = BouncePool::new(&mut alloc, "TX", 4, DEFAULT_SLOT_SIZE).unwrap();
        for index in 0..4 {
            let slot = pool.slot(index).unwrap();
            assert!(!crosses_64k(slot.phys(), slot.len()));
        }
        assert_eq!(pool.free_slots(), 4);
    }

    #[test]
    fn lease_release_cycle() {
        let mut alloc = allocator();
        let mut pool = BouncePool::new(&mut alloc, "TX", 2, 512).unwrap();

        let a = pool.lease(100).unwrap();
        let b = pool.lease(512).unwrap();
        assert_ne!(a, b);
        assert_eq!(
            pool.lease(64),
            Err(DmaError::BouncePoolExhausted { direction: "TX" })
        );

        pool.release(a);
        assert_eq!(pool.free_slots(), 1);
        assert!(pool.lease(64).is_ok());

        let stats = pool.stats();
        assert_eq!(stats.leases, 3);
        assert_eq!(stats.releases, 1);
        assert_eq!(stats.exhaustions, 1);
    }

    #[test]
    fn oversize_lease_is_rejected() {
        let mut alloc = allocator();
        let mut pool = BouncePool::new(&mut alloc, "RX", 1, 512).unwrap();
        assert_eq!(
            pool.lease(513),
            Err(DmaError::TransferTooLarge { len: 513, max: 512 })
        );
        assert_eq!(pool.free_slots(), 1);
    }

    #[test]
    fn double_release_is_ignored() {
        let mut alloc = allocator();
        let mut pool = BouncePool::new(&mut alloc, "RX", 2, 512).unwrap();
        let index = pool.lease(64).unwrap();
        pool.release(index);
        pool.release(index);
        pool.release(99);
        assert_eq!(pool.free_slots(), 2);
        assert_eq!(pool.stats().releases, 1);
    }

    #[test]
    fn straddling_arena_still_builds_a_safe_pool() {
        // Arena placed so naive first-fit slots would cross a 64 KiB
        // boundary; the allocator's retry keeps every slot clean.
        let arena = &mut Box::leak(Box::new(Arena([0; ARENA_LEN]))).0;
        let mut alloc = BoundaryAllocator::new(arena, 0x0001_0000 - 0x400);
        let pool = BouncePool::new(&mut alloc, "RX", 4, 2048).unwrap();
        for index in 0..4 {
            let slot = pool.slot(index).unwrap();
            assert!(!crosses_64k(slot.phys(), slot.len()));
        }
    }
}
