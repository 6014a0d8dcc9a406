//! Coherency classification.
//!
//! One analysis per session maps CPU identity, cache write policy, and
//! probed chipset behavior onto a [`CoherencyTier`] that the mapping
//! layer and policy integrator obey for the life of the driver. Any
//! ambiguous probe outcome moves the result toward a more conservative
//! tier, never a more permissive one.

use core::fmt;

use log::{info, warn};
use spin::Once;

use crate::cpu::{CacheMode, CpuInfo};
use crate::hal::QualContext;

pub mod probe;

/// How aggressively DMA and caching may be combined, from most to least
/// permissive. The ordering is load-bearing: a greater tier is the more
/// conservative one, so clamping toward safety is `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CoherencyTier {
    /// Hardware keeps caches coherent; no per-transfer management.
    FullDma,
    /// DMA allowed with a cache flush around each transfer.
    DmaWithFlush,
    /// DMA allowed with software ordering barriers around each transfer.
    DmaWithExplicitSync,
    /// Bus mastering off; programmed I/O only.
    DisableBusMaster,
}

impl CoherencyTier {
    /// Clamp toward the more conservative of the two tiers. Runtime
    /// demotion uses this; nothing may move the other way without a
    /// fresh analysis.
    pub fn demote_to(self, other: Self) -> Self {
        self.max(other)
    }

    pub fn allows_dma(self) -> bool {
        self != CoherencyTier::DisableBusMaster
    }
}

impl fmt::Display for CoherencyTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CoherencyTier::FullDma => "full DMA",
            CoherencyTier::DmaWithFlush => "DMA with flush",
            CoherencyTier::DmaWithExplicitSync => "DMA with explicit sync",
            CoherencyTier::DisableBusMaster => "bus master disabled",
        };
        f.write_str(name)
    }
}

/// The cache-maintenance primitive a tier selection binds to each
/// transfer sync point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOp {
    /// No per-transfer maintenance required.
    None,
    /// CLFLUSH over the mapped range.
    ClflushLines,
    /// WBINVD of the whole cache.
    FullWriteback,
    /// Compiler/CPU ordering barrier only.
    SoftwareBarrier,
}

/// Stage-1 probe outcome: does the DMA engine move data at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusMasterStatus {
    Ok,
    Partial,
    Broken,
}

/// Stage-2 probe outcome: do CPU and device agree on memory contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoherencyOutcome {
    Ok,
    Problem,
    /// The probe could not produce a verdict either way.
    Unknown,
}

/// Stage-3 probe outcome: does the chipset snoop DMA traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnoopStatus {
    Full,
    Partial,
    None,
    Unknown,
}

/// Immutable result of one analysis run.
#[derive(Debug, Clone, Copy)]
pub struct CoherencyAnalysis {
    pub cpu: CpuInfo,
    pub cache_mode: CacheMode,
    pub bus_master: BusMasterStatus,
    pub coherency: CoherencyOutcome,
    pub snooping: SnoopStatus,
    pub tier: CoherencyTier,
    pub cache_op: CacheOp,
    /// 0-100.
    pub confidence: u8,
    pub explanation: &'static str,
}

impl CoherencyAnalysis {
    /// Cross-checks the probe outcomes against each other. A failure
    /// here means a probe likely misdetected something (the classic
    /// case: coherency looks fine with no snooping on a write-back
    /// cache, which points at a wrong cache-mode reading).
    pub fn is_consistent(&self) -> bool {
        if self.bus_master == BusMasterStatus::Broken
            && self.tier != CoherencyTier::DisableBusMaster
        {
            return false;
        }
        if self.coherency == CoherencyOutcome::Ok
            && self.snooping == SnoopStatus::None
            && self.cache_mode == CacheMode::WriteBack
        {
            return false;
        }
        true
    }
}

/// Human-readable tier summary for logs and reports.
pub fn describe_tier(tier: CoherencyTier, op: CacheOp) -> &'static str {
    match (tier, op) {
        (CoherencyTier::DmaWithFlush, CacheOp::ClflushLines) => {
            "Tier 1: CLFLUSH (Optimal - Pentium 4+)"
        }
        (CoherencyTier::DmaWithFlush, _) => "Tier 2: WBINVD (Effective - 486+)",
        (CoherencyTier::DmaWithExplicitSync, _) => {
            "Tier 3: Software barriers (Conservative - 386+)"
        }
        (CoherencyTier::FullDma, _) => {
            "Tier 4: No cache management (Write-through or disabled cache)"
        }
        (CoherencyTier::DisableBusMaster, _) => "Bus mastering disabled (PIO only)",
    }
}

/// Run all three probe stages against the adapter and classify the
/// machine. One call per session.
pub fn analyze(ctx: &mut QualContext<'_>) -> CoherencyAnalysis {
    info!(
        "analyzing DMA coherency on {} ({} MHz)",
        ctx.cpu.family.name(),
        ctx.cpu.speed_mhz
    );

    let bus_master = probe::bus_master_functionality(ctx.bus, ctx.clock);
    let coherency = probe::cache_coherency(ctx.bus, ctx.clock, ctx.cache_mode, ctx.cache_ctl);
    let snooping = probe::snoop_behavior(ctx.bus, ctx.clock, ctx.cache_mode);

    let analysis = select(ctx.cpu, ctx.cache_mode, bus_master, coherency, snooping);
    if !analysis.is_consistent() {
        warn!(
            "coherency findings disagree (bus master {:?}, coherency {:?}, snooping {:?})",
            analysis.bus_master, analysis.coherency, analysis.snooping
        );
    }
    info!(
        "selected {} at {}% confidence: {}",
        describe_tier(analysis.tier, analysis.cache_op),
        analysis.confidence,
        analysis.explanation
    );
    analysis
}

/// Fixed decision table over the probe outcomes.
fn select(
    cpu: CpuInfo,
    cache_mode: CacheMode,
    bus_master: BusMasterStatus,
    coherency: CoherencyOutcome,
    snooping: SnoopStatus,
) -> CoherencyAnalysis {
    let (tier, cache_op, confidence, explanation) = if bus_master != BusMasterStatus::Ok {
        (
            CoherencyTier::DisableBusMaster,
            CacheOp::None,
            100,
            "Bus mastering not functional - using PIO only",
        )
    } else if coherency == CoherencyOutcome::Problem {
        // Visible incoherency: pick the strongest maintenance the CPU has.
        if cpu.family.has_clflush() {
            (
                CoherencyTier::DmaWithFlush,
                CacheOp::ClflushLines,
                100,
                "CLFLUSH available - optimal cache management",
            )
        } else if cpu.family.has_wbinvd() {
            (
                CoherencyTier::DmaWithFlush,
                CacheOp::FullWriteback,
                100,
                "WBINVD available - effective cache management",
            )
        } else {
            (
                CoherencyTier::DmaWithExplicitSync,
                CacheOp::SoftwareBarrier,
                100,
                "Software cache barriers required",
            )
        }
    } else if coherency == CoherencyOutcome::Unknown && cache_mode == CacheMode::WriteBack {
        // Inconclusive probe on a cache that could be stale: assume the
        // worst testable configuration.
        (
            CoherencyTier::DmaWithExplicitSync,
            CacheOp::SoftwareBarrier,
            60,
            "Coherency test inconclusive - using software barriers",
        )
    } else if coherency == CoherencyOutcome::Ok && cache_mode == CacheMode::WriteBack {
        match snooping {
            SnoopStatus::Full => (
                CoherencyTier::FullDma,
                CacheOp::None,
                95,
                "Hardware snooping maintains coherency",
            ),
            SnoopStatus::Partial => (
                CoherencyTier::DmaWithFlush,
                CacheOp::FullWriteback,
                80,
                "Partial snooping - using conservative approach",
            ),
            SnoopStatus::None => (
                CoherencyTier::FullDma,
                CacheOp::None,
                90,
                "Coherency OK - likely write-through cache",
            ),
            SnoopStatus::Unknown => (
                CoherencyTier::DmaWithExplicitSync,
                CacheOp::SoftwareBarrier,
                70,
                "Unknown snooping - using conservative approach",
            ),
        }
    } else {
        (
            CoherencyTier::FullDma,
            CacheOp::None,
            95,
            "Write-through/disabled cache requires no management",
        )
    };

    CoherencyAnalysis {
        cpu,
        cache_mode,
        bus_master,
        coherency,
        snooping,
        tier,
        cache_op,
        confidence,
        explanation,
    }
}

static ACTIVE: Once<CoherencyAnalysis> = Once::new();

/// Publish the session's analysis. The first call wins; later calls
/// return the already-installed snapshot.
pub fn install(analysis: CoherencyAnalysis) -> &'static CoherencyAnalysis {
    ACTIVE.call_once(|| analysis)
}

/// The installed analysis, if [`install`] has run.
pub fn active() -> Option<&'static CoherencyAnalysis> {
    ACTIVE.get()
}
