//! Transfer-mapping scenarios through the public surface: a policy
//! decision feeding a mapper, direct versus bounced placements, cache
//! maintenance at the sync points, and pool/allocator bookkeeping.

mod common;

use dmaqual::coherency::SnoopStatus;
use dmaqual::cpu::CpuFamily;
use dmaqual::dma::{self, AllocFlags};
use dmaqual::hal::sim::{SimCacheOps, SimLookup};
use dmaqual::policy::decide_with_analysis;
use dmaqual::{
    BoundaryAllocator, BusMasterMode, CacheOp, CoherencyAnalysis, CoherencyTier, ConfidenceLevel,
    DmaError, DmaMapper, DmaPolicy, MapperConfig,
};

use common::{arena, permissive_analysis, Rig, ARENA_PHYS};

/// A qualification verdict configures the mapper, and an unresolvable
/// frame is staged through a bounce slot with the tier's cache op.
#[test]
fn qualified_policy_drives_the_transmit_path() {
    let mut rig = Rig::new(CpuFamily::Cpu486);
    let analysis = CoherencyAnalysis {
        tier: CoherencyTier::DmaWithFlush,
        cache_op: CacheOp::FullWriteback,
        snooping: SnoopStatus::Partial,
        confidence: 80,
        explanation: "Partial snooping - using conservative approach",
        ..permissive_analysis()
    };
    let policy = decide_with_analysis(&mut rig.ctx(), BusMasterMode::On, analysis);
    assert!(policy.enabled);
    assert_eq!(policy.tier, CoherencyTier::DmaWithFlush);

    let lookup = SimLookup::new();
    let cache_ctl = SimCacheOps::new();
    let mut allocator = BoundaryAllocator::new(arena(), ARENA_PHYS);
    let mut mapper = DmaMapper::for_policy(
        &mut allocator,
        &lookup,
        &cache_ctl,
        &policy,
        MapperConfig::default(),
    )
    .unwrap();
    assert_eq!(mapper.tier(), CoherencyTier::DmaWithFlush);
    assert_eq!(mapper.cache_op(), CacheOp::FullWriteback);

    // A stack frame the lookup cannot resolve must bounce.
    let frame = [0x5Au8; 128];
    let mapping = mapper.map_for_transmit(&frame).unwrap();
    assert!(mapping.is_bounced());
    assert!(dma::direct_safe(mapping.device_address(), mapping.len()));
    assert_eq!(cache_ctl.writeback_all_calls.get(), 1);

    mapper.unmap(mapping);
    let stats = mapper.stats();
    assert_eq!(stats.total_mappings, 1);
    assert_eq!(stats.active_mappings, 0);
    assert_eq!(stats.bounce_mappings, 1);
}

#[test]
fn resolved_safe_frames_map_in_place() {
    let cache_ctl = SimCacheOps::new();
    let mut lookup = SimLookup::new();
    let frame = vec![0xA5u8; 256];
    lookup.map_region(frame.as_ptr(), frame.len(), 0x0008_0000);

    let mut allocator = BoundaryAllocator::new(arena(), ARENA_PHYS);
    let analysis = permissive_analysis();
    let mut mapper = DmaMapper::for_analysis(
        &mut allocator,
        &lookup,
        &cache_ctl,
        &analysis,
        MapperConfig::default(),
    )
    .unwrap();

    let mapping = mapper.map_for_transmit(&frame).unwrap();
    assert!(!mapping.is_bounced());
    assert_eq!(mapping.device_address(), 0x0008_0000);
    // No slot was consumed and a coherent tier does no maintenance.
    assert_eq!(mapper.tx_pool_stats().free, mapper.tx_pool_stats().slots);
    assert_eq!(cache_ctl.total_calls(), 0);

    mapper.unmap(mapping);
    let stats = mapper.stats();
    assert_eq!(stats.direct_mappings, 1);
    assert_eq!(stats.bounce_copies, 0);
}

#[test]
fn boundary_crossing_receive_bounces_and_copies_back() {
    let cache_ctl = SimCacheOps::new();
    let mut lookup = SimLookup::new();
    let mut buf = vec![0u8; 96];
    // Physically placed across a 64 KiB boundary.
    lookup.map_region(buf.as_ptr(), buf.len(), 0x0000_FFD0);

    let mut allocator = BoundaryAllocator::new(arena(), ARENA_PHYS);
    let analysis = CoherencyAnalysis {
        tier: CoherencyTier::DmaWithFlush,
        cache_op: CacheOp::ClflushLines,
        ..permissive_analysis()
    };
    let mut mapper = DmaMapper::for_analysis(
        &mut allocator,
        &lookup,
        &cache_ctl,
        &analysis,
        MapperConfig::default(),
    )
    .unwrap();

    let mut mapping = mapper.map_for_receive(&mut buf).unwrap();
    assert!(mapping.is_bounced(), "a 64 KiB straddle must bounce");
    assert!(!dma::crosses_64k(mapping.device_address(), mapping.len()));

    // The device deposits a frame into the bounce slot.
    let device = mapper.device_buffer_mut(&mut mapping).unwrap();
    assert_eq!(device.len(), 96);
    for (i, byte) in device.iter_mut().enumerate() {
        *byte = (i as u8) ^ 0x3C;
    }

    // Unmap syncs for the CPU and copies the slot back to the caller.
    mapper.unmap(mapping);
    for (i, byte) in buf.iter().enumerate() {
        assert_eq!(*byte, (i as u8) ^ 0x3C, "byte {i} lost in the copy back");
    }
    assert_eq!(cache_ctl.flush_range_calls.get(), 2);
    assert_eq!(mapper.stats().bounce_copies, 1);
}

#[test]
fn exhausted_pool_recovers_after_unmap() {
    let cache_ctl = SimCacheOps::new();
    let lookup = SimLookup::new();
    let mut allocator = BoundaryAllocator::new(arena(), ARENA_PHYS);
    let config = MapperConfig {
        tx_slots: 1,
        rx_slots: 1,
        slot_size: 256,
    };
    let analysis = permissive_analysis();
    let mut mapper =
        DmaMapper::for_analysis(&mut allocator, &lookup, &cache_ctl, &analysis, config).unwrap();

    let frame = [0u8; 64];
    let held = mapper.map_for_transmit(&frame).unwrap();
    let err = mapper.map_for_transmit(&frame).unwrap_err();
    assert_eq!(err, DmaError::BouncePoolExhausted { direction: "TX" });
    assert_eq!(mapper.stats().mapping_errors, 1);

    // Releasing the held mapping makes the slot leasable again.
    mapper.unmap(held);
    let retry = mapper.map_for_transmit(&frame).unwrap();
    assert!(retry.is_bounced());
    mapper.unmap(retry);
    assert_eq!(mapper.tx_pool_stats().exhaustions, 1);
}

#[test]
fn allocator_places_around_boundaries() {
    // Arena starts 0x400 bytes shy of a 64 KiB line, so the first fit
    // for a 2 KiB block straddles it.
    let mut allocator = BoundaryAllocator::new(arena(), 0x0001_0000 - 0x400);

    let buf = allocator
        .alloc(2048, 16, AllocFlags::NO_CROSS_64K)
        .unwrap();
    assert!(!dma::crosses_64k(buf.phys(), buf.len()));
    assert!(buf.phys() >= 0x0001_0000);
    assert!(allocator.stats().placement_retries >= 1);

    allocator.free(buf);
    assert_eq!(allocator.stats().deallocations, 1);
}

#[test]
fn disabled_policy_still_maps_but_syncs_are_inert() {
    let policy = DmaPolicy {
        enabled: false,
        tier: CoherencyTier::DisableBusMaster,
        cache_op: CacheOp::None,
        confidence: ConfidenceLevel::Failed,
        total_score: 0,
        recommendation: "Bus mastering not recommended - use programmed I/O for safety",
        fallback_reason: Some("Disabled by configuration"),
        from_cache: false,
    };

    let cache_ctl = SimCacheOps::new();
    let frame = vec![0x11u8; 64];
    let mut lookup = SimLookup::new();
    lookup.map_region(frame.as_ptr(), frame.len(), 0x0008_0000);
    let mut allocator = BoundaryAllocator::new(arena(), ARENA_PHYS);
    let mut mapper = DmaMapper::for_policy(
        &mut allocator,
        &lookup,
        &cache_ctl,
        &policy,
        MapperConfig::default(),
    )
    .unwrap();

    // Not issuing DMA under this tier is the caller's job; the mapping
    // path itself has to keep working.
    let mapping = mapper.map_for_transmit(&frame).unwrap();
    assert!(!mapping.is_bounced());
    assert_eq!(mapping.device_address(), 0x0008_0000);
    mapper.sync_for_device(&mapping);
    mapper.sync_for_cpu(&mapping);
    mapper.unmap(mapping);

    assert_eq!(cache_ctl.total_calls(), 0);
    assert_eq!(mapper.stats().mapping_errors, 0);
    assert_eq!(mapper.stats().total_mappings, 1);
}
