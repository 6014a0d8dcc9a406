//! DMA safety qualification for legacy ISA NIC drivers.
//!
//! Bus-master DMA on DOS-era machines is only safe when the chipset,
//! CPU cache configuration, and adapter all cooperate, and the only way
//! to know is to test the machine it is running on. This crate decides,
//! per boot, whether a NIC's bus-master engine may be used and how much
//! cache maintenance each transfer needs:
//!
//! - [`coherency`] probes whether DMA writes are visible through the
//!   CPU cache and picks an operating tier.
//! - [`bmtest`] runs the scored capability battery (presence, coherency,
//!   timing, data integrity, burst, error recovery, stability) against
//!   the adapter.
//! - [`cache`] persists the verdict so later boots skip the battery
//!   while the hardware fingerprint holds.
//! - [`policy`] folds mode configuration, analysis, cached results, and
//!   CPU-family confidence floors into the final enable/disable call.
//! - [`dma`] carries that decision into per-transfer mapping: direct
//!   DMA when a buffer's physical placement allows it, bounce slots
//!   when it does not, and exactly the cache operation the tier
//!   selected.
//!
//! Hardware access runs through the traits in [`hal`]; the simulated
//! implementations there drive every test. Failures downgrade to
//! programmed I/O, never crash.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod bmtest;
pub mod cache;
pub mod coherency;
pub mod cpu;
pub mod dma;
pub mod error;
pub mod hal;
pub mod policy;

// Re-export the decision surface
pub use coherency::{CacheOp, CoherencyAnalysis, CoherencyTier};
pub use error::{DmaError, DmaResult};
pub use policy::{decide_dma_policy, BusMasterMode, DmaPolicy};
// Re-export the qualification battery for callers that drive it directly
pub use bmtest::{BusMasterTestResult, ConfidenceLevel, TestMode};
// Re-export the transfer path
pub use dma::{BoundaryAllocator, DmaMapper, DmaMapping, MapperConfig};
pub use hal::QualContext;
