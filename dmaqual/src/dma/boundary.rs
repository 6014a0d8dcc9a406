//! Boundary-safe DMA memory allocator.
//!
//! The ISA bus-master engine addresses 24 bits and cannot carry one
//! transfer across a 64 KiB physical boundary, so placement is part of
//! correctness here. The allocator runs first-fit placement over a
//! caller-provided arena whose physical base is known, and when a
//! candidate block violates the requested constraints it parks the
//! block and retries so the next fit lands somewhere else. Parked
//! blocks go back to the heap before the call returns.

use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use linked_list_allocator::Heap;

use crate::error::{DmaError, DmaResult};

/// Largest single allocation the DMA engine can express in its length
/// register.
pub const MAX_ALLOC: usize = 65536;

/// Minimum allocation alignment handed to the heap.
pub const MIN_ALIGN: usize = 16;

/// Placement attempts before the allocator gives up on a constraint set.
pub const MAX_ATTEMPTS: u8 = 3;

bitflags! {
    /// Physical placement constraints for [`BoundaryAllocator::alloc`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u8 {
        /// Entire buffer below the 1 MiB real-mode ceiling.
        const BELOW_1M = 0x01;
        /// Entire buffer below the 16 MiB ISA addressing ceiling.
        const BELOW_16M = 0x02;
        /// Physically contiguous. The arena contract already guarantees
        /// this; the flag documents intent at call sites.
        const CONTIGUOUS = 0x04;
        /// Physical address aligned to the requested alignment, not just
        /// the virtual one.
        const ALIGNED = 0x08;
        /// No 4 KiB page boundary inside the buffer.
        const NO_CROSS_4K = 0x10;
        /// No 64 KiB boundary inside the buffer.
        const NO_CROSS_64K = 0x20;
    }
}

/// True when `len` bytes at `phys` straddle a 64 KiB physical boundary.
pub fn crosses_64k(phys: u32, len: usize) -> bool {
    (phys as u64 & 0xFFFF) + len as u64 > 0x1_0000
}

/// True when any byte of the buffer sits at or above 16 MiB.
pub fn exceeds_16m(phys: u32, len: usize) -> bool {
    phys as u64 + len as u64 > 0x100_0000
}

fn exceeds_1m(phys: u32, len: usize) -> bool {
    phys as u64 + len as u64 > 0x10_0000
}

fn crosses_boundary(phys: u32, len: usize, boundary: u32) -> bool {
    if len == 0 {
        return false;
    }
    let start = phys as u64 / boundary as u64;
    let end = (phys as u64 + len as u64 - 1) / boundary as u64;
    start != end
}

fn satisfies(phys: u32, len: usize, align: usize, flags: AllocFlags) -> bool {
    if flags.contains(AllocFlags::BELOW_1M) && exceeds_1m(phys, len) {
        return false;
    }
    if flags.contains(AllocFlags::BELOW_16M) && exceeds_16m(phys, len) {
        return false;
    }
    if flags.contains(AllocFlags::NO_CROSS_4K) && crosses_boundary(phys, len, 4096) {
        return false;
    }
    if flags.contains(AllocFlags::NO_CROSS_64K) && crosses_64k(phys, len) {
        return false;
    }
    if flags.contains(AllocFlags::ALIGNED) && phys as u64 & (align as u64 - 1) != 0 {
        return false;
    }
    true
}

/// One allocation out of the arena. Freed explicitly through
/// [`BoundaryAllocator::free`]; dropping without freeing leaks the
/// block, which is acceptable for the pools that hold their slots for
/// the driver's lifetime.
#[derive(Debug)]
pub struct DmaBuffer {
    virt: NonNull<u8>,
    phys: u32,
    len: usize,
    layout: Layout,
}

impl DmaBuffer {
    /// Bus-visible physical address.
    pub fn phys(&self) -> u32 {
        self.phys
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.virt.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `virt` points at `len` bytes carved out of the arena by
        // `allocate_first_fit` and owned by this buffer until `free`, so
        // the range is valid, initialized (zeroed at allocation), and not
        // aliased mutably while `&self` is held.
        unsafe { core::slice::from_raw_parts(self.virt.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: Same region as `as_slice`; `&mut self` guarantees the
        // exclusive access `from_raw_parts_mut` requires.
        unsafe { core::slice::from_raw_parts_mut(self.virt.as_ptr(), self.len) }
    }
}

/// Snapshot of allocator counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoundaryAllocStats {
    pub allocations: u64,
    pub deallocations: u64,
    pub placement_retries: u64,
    pub allocation_failures: u64,
}

/// First-fit allocator with physical placement constraints.
pub struct BoundaryAllocator {
    heap: Heap,
    arena_virt: usize,
    arena_len: usize,
    phys_base: u32,
    allocations: AtomicU64,
    deallocations: AtomicU64,
    placement_retries: AtomicU64,
    allocation_failures: AtomicU64,
}

impl BoundaryAllocator {
    /// Builds the allocator over `arena`, which must be physically
    /// contiguous starting at `phys_base`. The exclusive `'static`
    /// borrow hands the region over for the allocator's lifetime.
    pub fn new(arena: &'static mut [u8], phys_base: u32) -> Self {
        let arena_virt = arena.as_mut_ptr() as usize;
        let arena_len = arena.len();
        let mut heap = Heap::empty();
        // SAFETY: `arena` is an exclusive `'static` borrow surrendered to
        // the heap here, so the region stays valid and unaliased for the
        // heap's whole lifetime.
        unsafe { heap.init(arena.as_mut_ptr(), arena_len) };
        Self {
            heap,
            arena_virt,
            arena_len,
            phys_base,
            allocations: AtomicU64::new(0),
            deallocations: AtomicU64::new(0),
            placement_retries: AtomicU64::new(0),
            allocation_failures: AtomicU64::new(0),
        }
    }

    /// Arena bytes under management.
    pub fn arena_len(&self) -> usize {
        self.arena_len
    }

    fn phys_of(&self, virt: usize) -> u32 {
        self.phys_base.wrapping_add((virt - self.arena_virt) as u32)
    }

    /// Allocates `len` bytes at `align` satisfying `flags`. Successful
    /// buffers come back zeroed.
    pub fn alloc(&mut self, len: usize, align: usize, flags: AllocFlags) -> DmaResult<DmaBuffer> {
        if len == 0 {
            return Err(DmaError::InvalidArgument {
                name: "len",
                value: "zero",
            });
        }
        if len > MAX_ALLOC {
            return Err(DmaError::TransferTooLarge {
                len,
                max: MAX_ALLOC,
            });
        }
        if !align.is_power_of_two() {
            return Err(DmaError::InvalidArgument {
                name: "align",
                value: "not a power of two",
            });
        }
        let align = align.max(MIN_ALIGN);
        let layout = Layout::from_size_align(len, align).map_err(|_| DmaError::InvalidArgument {
            name: "align",
            value: "unrepresentable layout",
        })?;

        let mut parked: [Option<NonNull<u8>>; MAX_ATTEMPTS as usize] = [None; MAX_ATTEMPTS as usize];
        let mut verdict = Err(DmaError::BoundaryRetriesExhausted {
            size: len,
            attempts: MAX_ATTEMPTS,
        });

        for attempt in 0..MAX_ATTEMPTS {
            let candidate = match self.heap.allocate_first_fit(layout) {
                Ok(ptr) => ptr,
                Err(_) => {
                    verdict = Err(DmaError::OutOfMemory { requested: len });
                    break;
                }
            };
            let phys = self.phys_of(candidate.as_ptr() as usize);
            if satisfies(phys, len, align, flags) {
                // SAFETY: `candidate` was just returned by
                // `allocate_first_fit` for `layout`, so it is valid for
                // writes of `len` bytes and exclusively ours.
                unsafe { core::ptr::write_bytes(candidate.as_ptr(), 0, len) };
                self.allocations.fetch_add(1, Ordering::Relaxed);
                verdict = Ok(DmaBuffer {
                    virt: candidate,
                    phys,
                    len,
                    layout,
                });
                break;
            }
            log::debug!(
                "DMA placement 0x{:08X} violates {:?} for {} bytes, retrying",
                phys,
                flags,
                len
            );
            parked[attempt as usize] = Some(candidate);
            self.placement_retries.fetch_add(1, Ordering::Relaxed);
        }

        for block in parked.into_iter().flatten() {
            // SAFETY: Each parked block came from `allocate_first_fit`
            // with this same `layout` during this call and was never
            // handed out, so returning it to the heap is sound.
            unsafe { self.heap.deallocate(block, layout) };
        }

        if let Err(error) = &verdict {
            self.allocation_failures.fetch_add(1, Ordering::Relaxed);
            log::warn!("DMA-safe allocation of {} bytes failed: {}", len, error);
        }
        verdict
    }

    /// Returns a buffer to the arena.
    pub fn free(&mut self, buf: DmaBuffer) {
        // SAFETY: `buf.virt` was returned by `allocate_first_fit` on this
        // heap with `buf.layout`, and consuming `buf` here ends all access
        // to the block.
        unsafe { self.heap.deallocate(buf.virt, buf.layout) };
        self.deallocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> BoundaryAllocStats {
        BoundaryAllocStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            deallocations: self.deallocations.load(Ordering::Relaxed),
            placement_retries: self.placement_retries.load(Ordering::Relaxed),
            allocation_failures: self.allocation_failures.load(Ordering::Relaxed),
        }
    }
}
