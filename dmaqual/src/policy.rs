//! Bus-mastering policy.
//!
//! The single decision point the NIC bring-up path calls. It combines
//! the coherency analysis with the qualification evidence (replayed
//! from the persisted record when the hardware fingerprint still
//! matches, measured fresh otherwise), applies the CPU-generation
//! confidence floor, and answers with an enable/disable verdict plus
//! the tier the mapping layer must obey. Every disabled outcome
//! degrades to programmed I/O; nothing here can fail the driver load.

use log::{error, info, warn};

use crate::bmtest::{
    self, recommendation_for, BusMasterTestResult, ConfidenceLevel, TestMode,
    MAX_BURST_TRANSFER, MAX_DATA_INTEGRITY, MAX_DMA_CONTROLLER, MAX_ERROR_RECOVERY,
    MAX_MEMORY_COHERENCY, MAX_STABILITY, MAX_TIMING, MAX_TOTAL,
};
use crate::cache::{self, CachedQualification, Fingerprint};
use crate::coherency::{self, CacheOp, CoherencyAnalysis, CoherencyTier};
use crate::hal::{regs, AdapterBus, QualContext};

/// Requested bus-master setting from the driver configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusMasterMode {
    /// Never use DMA.
    Off,
    /// Use DMA if the quick qualification allows it.
    On,
    /// Decide from the exhaustive qualification.
    Auto,
}

/// The decision every transfer path consults for the rest of the
/// session.
#[derive(Debug, Clone, Copy)]
pub struct DmaPolicy {
    pub enabled: bool,
    pub tier: CoherencyTier,
    pub cache_op: CacheOp,
    pub confidence: ConfidenceLevel,
    pub total_score: u16,
    pub recommendation: &'static str,
    /// Why bus mastering is off, when it is.
    pub fallback_reason: Option<&'static str>,
    /// Verdict replayed from the persisted record rather than measured.
    pub from_cache: bool,
}

impl DmaPolicy {
    fn disabled(reason: &'static str, recommendation: &'static str) -> Self {
        Self {
            enabled: false,
            tier: CoherencyTier::DisableBusMaster,
            cache_op: CacheOp::None,
            confidence: ConfidenceLevel::Failed,
            total_score: 0,
            recommendation,
            fallback_reason: Some(reason),
            from_cache: false,
        }
    }
}

const RECOMMEND_EXHAUSTIVE: &str =
    "80286 system requires exhaustive test for bus mastering - using PIO mode";

/// Decide the DMA policy for this session, running the coherency
/// probes if no analysis has been installed yet.
pub fn decide_dma_policy(ctx: &mut QualContext<'_>, mode: BusMasterMode) -> DmaPolicy {
    decide_inner(ctx, mode, None)
}

/// Same decision with a coherency analysis the caller already ran.
pub fn decide_with_analysis(
    ctx: &mut QualContext<'_>,
    mode: BusMasterMode,
    analysis: CoherencyAnalysis,
) -> DmaPolicy {
    decide_inner(ctx, mode, Some(analysis))
}

fn decide_inner(
    ctx: &mut QualContext<'_>,
    mode: BusMasterMode,
    provided: Option<CoherencyAnalysis>,
) -> DmaPolicy {
    // These three exits never touch the adapter.
    if mode == BusMasterMode::Off {
        info!("bus mastering disabled by configuration - using programmed I/O");
        return DmaPolicy::disabled("Disabled by configuration", "");
    }
    if !ctx.nic_dma_capable {
        info!("Bus mastering not supported on this adapter - using programmed I/O");
        return DmaPolicy::disabled(
            "Adapter has no bus-master engine",
            recommendation_for(ConfidenceLevel::Failed),
        );
    }
    if !ctx.cpu.family.supports_busmaster() {
        info!("CPU does not support bus mastering - using programmed I/O");
        return DmaPolicy::disabled(
            "CPU does not support bus mastering",
            recommendation_for(ConfidenceLevel::Failed),
        );
    }

    info!("=== CPU-Aware Bus Mastering Configuration ===");
    info!("Detected: {} CPU", ctx.cpu.family.name());

    let analysis = match provided {
        Some(analysis) => analysis,
        None => match coherency::active() {
            Some(analysis) => *analysis,
            None => *coherency::install(coherency::analyze(ctx)),
        },
    };

    // The analyzer's veto is final; no score overrides a broken engine.
    if analysis.tier == CoherencyTier::DisableBusMaster {
        fallback_to_pio(ctx.bus, analysis.explanation);
        return DmaPolicy::disabled(
            analysis.explanation,
            recommendation_for(ConfidenceLevel::Failed),
        );
    }

    let fingerprint = Fingerprint::from_context(ctx);

    // Replay the persisted verdict when the hardware still matches.
    if let Some(record) = cache::load(ctx.store) {
        match record.matches(&fingerprint) {
            Ok(()) => {
                info!("Using cached bus mastering test results");
                let result = record.rehydrate();
                let policy = apply(ctx, &analysis, &result, true);
                info!(
                    "Bus mastering configured from cache: {}",
                    if policy.enabled { "ENABLED" } else { "DISABLED" }
                );
                return policy;
            }
            Err(reason) => {
                info!("Cached results invalid: {reason}");
                if let Err(err) = cache::invalidate(ctx.store, reason) {
                    warn!("could not drop stale qualification record: {err}");
                }
            }
        }
    } else {
        info!("No cached test results found");
    }

    // Fresh qualification. A requested On settles for the quick battery;
    // Auto pays for the exhaustive one.
    let run_mode = if mode == BusMasterMode::On {
        TestMode::Quick
    } else {
        TestMode::Full
    };
    if ctx.cpu.family.requires_conservative_qualification() {
        info!("80286 system detected - conservative testing required for bus mastering");
    }
    info!(
        "Running {} test...",
        match run_mode {
            TestMode::Quick => "quick 10-second",
            TestMode::Full => "comprehensive 45-second",
        }
    );

    let result = bmtest::run(ctx, run_mode);
    log_run_summary(&result);

    let policy = apply(ctx, &analysis, &result, false);

    if result.emergency_stopped {
        // An abort says nothing about the hardware; never persist it.
        info!("emergency-stopped run not cached");
    } else {
        let record = CachedQualification::from_result(fingerprint, ctx.clock.now_ms(), &result);
        match cache::save(ctx.store, &record) {
            Ok(()) => info!("Test results cached - subsequent boots will be faster"),
            Err(err) => warn!("could not persist qualification record: {err}"),
        }
    }

    info!("=== Bus Mastering Auto-Configuration Complete ===");
    info!(
        "Final Configuration: {} (Confidence: {}, Score: {}/{})",
        if policy.enabled {
            "Bus Mastering ENABLED"
        } else {
            "Programmed I/O MODE"
        },
        policy.confidence.label(),
        policy.total_score,
        MAX_TOTAL
    );
    policy
}

/// Map a qualification outcome onto an enable/disable verdict under
/// this CPU generation's confidence floor. `Low` and `Failed` verdicts
/// also force the adapter into PIO mode on the spot.
fn apply(
    ctx: &mut QualContext<'_>,
    analysis: &CoherencyAnalysis,
    result: &BusMasterTestResult,
    from_cache: bool,
) -> DmaPolicy {
    let floor = if ctx.cpu.family.requires_conservative_qualification() {
        ConfidenceLevel::High
    } else {
        ConfidenceLevel::Medium
    };

    if result.test_completed && result.confidence >= floor {
        match result.confidence {
            ConfidenceLevel::High => {
                info!("HIGH confidence - Bus mastering ENABLED");
                info!("System shows excellent compatibility for bus mastering");
            }
            _ => {
                info!("MEDIUM confidence - Bus mastering ENABLED with monitoring");
                warn!("Monitor system for stability issues");
            }
        }
        return DmaPolicy {
            enabled: true,
            tier: analysis.tier,
            cache_op: analysis.cache_op,
            confidence: result.confidence,
            total_score: result.total_score,
            recommendation: result.recommendation,
            fallback_reason: None,
            from_cache,
        };
    }

    let mut recommendation = result.recommendation;
    let (reason, write_pio) = match result.confidence {
        ConfidenceLevel::Failed => {
            error!("Test FAILED - Bus mastering DISABLED");
            error!("System not compatible with bus mastering - using programmed I/O");
            (result.failure_reason.unwrap_or("Test failed"), true)
        }
        ConfidenceLevel::Low => {
            warn!("LOW confidence - Bus mastering DISABLED");
            warn!("System compatibility questionable - using programmed I/O for safety");
            ("Low confidence score", true)
        }
        _ if result.test_completed => {
            // Medium or better under the 286 floor: only the exhaustive
            // battery may enable it. The adapter never left PIO, so no
            // reconfiguration is needed.
            info!("{RECOMMEND_EXHAUSTIVE}");
            recommendation = RECOMMEND_EXHAUSTIVE;
            ("Confidence below 80286 floor", false)
        }
        _ => {
            warn!("qualification did not complete - staying in programmed I/O");
            (result.failure_reason.unwrap_or("Test did not complete"), true)
        }
    };

    if write_pio {
        fallback_to_pio(ctx.bus, reason);
    }

    DmaPolicy {
        enabled: false,
        tier: CoherencyTier::DisableBusMaster,
        cache_op: CacheOp::None,
        confidence: result.confidence,
        total_score: result.total_score,
        recommendation,
        fallback_reason: Some(reason),
        from_cache,
    }
}

/// Force the adapter into programmed-I/O mode: clear any pending DMA
/// state, then latch the PIO command.
pub fn fallback_to_pio(bus: &mut dyn AdapterBus, reason: &str) {
    warn!("Falling back to programmed I/O mode: {reason}");
    bus.write_register(regs::CMD_STATUS, regs::CMD_CLEAR);
    bus.write_register(regs::CMD_STATUS, regs::CMD_PIO_MODE);
    info!("Successfully configured NIC for programmed I/O mode");
}

fn log_run_summary(result: &BusMasterTestResult) {
    let scores = &result.scores;
    info!("Bus mastering test completed:");
    info!("  Total Score: {}/{}", result.total_score, MAX_TOTAL);
    info!("  Confidence Level: {}", result.confidence.label());
    info!(
        "  Individual Scores: DMA={}/{}, Memory={}/{}, Timing={}/{}",
        scores.dma_controller,
        MAX_DMA_CONTROLLER,
        scores.memory_coherency,
        MAX_MEMORY_COHERENCY,
        scores.timing,
        MAX_TIMING
    );
    info!(
        "  Pattern Tests: Data={}/{}, Burst={}/{}, Recovery={}/{}",
        scores.data_integrity,
        MAX_DATA_INTEGRITY,
        scores.burst_transfer,
        MAX_BURST_TRANSFER,
        scores.error_recovery,
        MAX_ERROR_RECOVERY
    );
    if result.mode == TestMode::Full {
        info!("  Stability Test: {}/{}", scores.stability, MAX_STABILITY);
    }
}
