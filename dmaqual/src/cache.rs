//! Persisted qualification results.
//!
//! A full qualification run holds the machine for up to 45 seconds, so
//! the outcome is flattened into one small fixed-layout record and kept
//! in the driver's configuration store. On later boots the record is
//! replayed instead of re-running the battery, but only after its
//! fingerprint (driver version, CPU, chipset, adapter I/O base) still
//! matches the running system. Any mismatch, or any corruption of the
//! record itself, is a cache miss and never an error: the caller falls
//! back to a fresh run.

use log::{debug, info, warn};

use crate::bmtest::{
    recommendation_for, BusMasterTestResult, ConfidenceLevel, PhaseScores, TestMode, TestPhase,
    LOW_THRESHOLD, MAX_ERROR_RECOVERY, MAX_MEMORY_COHERENCY, MAX_STABILITY,
};
use crate::error::DmaResult;
use crate::hal::{CacheStore, QualContext};

/// On-store record size. Fixed; a record of any other length is
/// corrupt by definition.
pub const RECORD_LEN: usize = 48;

const SIGNATURE: [u8; 8] = *b"3CPKT\0\0\0";
const CHECKSUM_OFFSET: usize = 44;

const FLAG_COMPLETED: u8 = 0x01;
const FLAG_SAFE: u8 = 0x02;
const FLAG_ENABLED: u8 = 0x04;

/// Identity of the system a record was measured on. Qualification
/// results are only transferable between identical fingerprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    /// Driver version in BCD, e.g. 0x0042 for 0.42.
    pub driver_version: u16,
    pub cpu_code: u16,
    pub chipset_id: u32,
    pub io_base: u16,
}

impl Fingerprint {
    pub fn from_context(ctx: &QualContext<'_>) -> Self {
        Self {
            driver_version: ctx.driver_version,
            cpu_code: ctx.cpu.family.code(),
            chipset_id: ctx.chipset_id,
            io_base: ctx.io_base,
        }
    }
}

/// One saved qualification outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedQualification {
    pub fingerprint: Fingerprint,
    /// Clock reading at save time. Informational; never part of the
    /// validity decision.
    pub saved_at_ms: u32,
    pub mode: TestMode,
    pub scores: PhaseScores,
    pub total_score: u16,
    pub confidence: ConfidenceLevel,
    pub test_completed: bool,
    pub safe_for_production: bool,
    /// Whether the confidence band cleared the general enable bar
    /// (`Medium`) at save time. The CPU-specific floor is applied on
    /// replay, not baked in here; a record of a PIO decision is still a
    /// valid record.
    pub busmaster_enabled: bool,
}

impl CachedQualification {
    /// Snapshot a finished run for persistence.
    pub fn from_result(
        fingerprint: Fingerprint,
        saved_at_ms: u32,
        result: &BusMasterTestResult,
    ) -> Self {
        Self {
            fingerprint,
            saved_at_ms,
            mode: result.mode,
            scores: result.scores,
            total_score: result.total_score,
            confidence: result.confidence,
            test_completed: result.test_completed,
            safe_for_production: result.safe_for_production,
            busmaster_enabled: result.confidence >= ConfidenceLevel::Medium,
        }
    }

    /// Serialize to the fixed little-endian record layout.
    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut raw = [0u8; RECORD_LEN];
        raw[0..8].copy_from_slice(&SIGNATURE);
        put_u16(&mut raw, 8, self.fingerprint.driver_version);
        put_u32(&mut raw, 10, self.saved_at_ms);
        put_u16(&mut raw, 14, self.fingerprint.cpu_code);
        put_u32(&mut raw, 16, self.fingerprint.chipset_id);
        put_u16(&mut raw, 20, self.fingerprint.io_base);
        raw[22] = match self.mode {
            TestMode::Quick => 0,
            TestMode::Full => 1,
        };
        raw[23] = self.confidence as u8;
        let mut flags = 0u8;
        if self.test_completed {
            flags |= FLAG_COMPLETED;
        }
        if self.safe_for_production {
            flags |= FLAG_SAFE;
        }
        if self.busmaster_enabled {
            flags |= FLAG_ENABLED;
        }
        raw[24] = flags;
        // raw[25] reserved.
        put_u16(&mut raw, 26, self.scores.dma_controller);
        put_u16(&mut raw, 28, self.scores.memory_coherency);
        put_u16(&mut raw, 30, self.scores.timing);
        put_u16(&mut raw, 32, self.scores.data_integrity);
        put_u16(&mut raw, 34, self.scores.burst_transfer);
        put_u16(&mut raw, 36, self.scores.error_recovery);
        put_u16(&mut raw, 38, self.scores.stability);
        put_u16(&mut raw, 40, self.total_score);
        // raw[42..44] reserved.
        let sum = checksum(&raw[..CHECKSUM_OFFSET]);
        put_u32(&mut raw, 44, sum);
        raw
    }

    /// Parse a stored record. Every failure is a warned cache miss,
    /// never an error; a corrupt record must not block the driver.
    pub fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() != RECORD_LEN {
            warn!("Cache file corrupted - size mismatch");
            return None;
        }
        if raw[0..8] != SIGNATURE {
            warn!("Cache file corrupted - invalid signature");
            return None;
        }
        if get_u32(raw, 44) != checksum(&raw[..CHECKSUM_OFFSET]) {
            warn!("Cache file corrupted - checksum mismatch");
            return None;
        }

        // Checksum only proves the bytes are what was written, not that
        // they were written by this layout.
        let mode = match raw[22] {
            0 => TestMode::Quick,
            1 => TestMode::Full,
            _ => {
                warn!("Cache file corrupted - invalid field encoding");
                return None;
            }
        };
        let confidence = match raw[23] {
            0 => ConfidenceLevel::Failed,
            1 => ConfidenceLevel::Low,
            2 => ConfidenceLevel::Medium,
            3 => ConfidenceLevel::High,
            _ => {
                warn!("Cache file corrupted - invalid field encoding");
                return None;
            }
        };
        let flags = raw[24];

        Some(Self {
            fingerprint: Fingerprint {
                driver_version: get_u16(raw, 8),
                cpu_code: get_u16(raw, 14),
                chipset_id: get_u32(raw, 16),
                io_base: get_u16(raw, 20),
            },
            saved_at_ms: get_u32(raw, 10),
            mode,
            scores: PhaseScores {
                dma_controller: get_u16(raw, 26),
                memory_coherency: get_u16(raw, 28),
                timing: get_u16(raw, 30),
                data_integrity: get_u16(raw, 32),
                burst_transfer: get_u16(raw, 34),
                error_recovery: get_u16(raw, 36),
                stability: get_u16(raw, 38),
            },
            total_score: get_u16(raw, 40),
            confidence,
            test_completed: flags & FLAG_COMPLETED != 0,
            safe_for_production: flags & FLAG_SAFE != 0,
            busmaster_enabled: flags & FLAG_ENABLED != 0,
        })
    }

    /// Check the record against the running system. The first mismatch
    /// wins and names what changed.
    pub fn matches(&self, current: &Fingerprint) -> Result<(), &'static str> {
        if self.fingerprint.driver_version != current.driver_version {
            return Err("Driver version changed");
        }
        if self.fingerprint.cpu_code != current.cpu_code {
            return Err("CPU type changed");
        }
        if self.fingerprint.chipset_id != current.chipset_id {
            return Err("Chipset changed");
        }
        if self.fingerprint.io_base != current.io_base {
            return Err("NIC I/O address changed");
        }
        Ok(())
    }

    /// Rebuild a result struct from the record so policy and reporting
    /// treat cached and fresh runs uniformly. Pass/fail flags are
    /// re-derived from the scores with the harness thresholds; the
    /// record existing at all implies the CPU qualified.
    pub fn rehydrate(&self) -> BusMasterTestResult {
        let phase_reached = if !self.test_completed {
            TestPhase::Basic
        } else {
            match self.mode {
                TestMode::Quick => TestPhase::Stress,
                TestMode::Full => TestPhase::Stability,
            }
        };
        let stability_passed = match self.mode {
            TestMode::Quick => true,
            TestMode::Full => self.scores.stability >= MAX_STABILITY * 70 / 100,
        };
        BusMasterTestResult {
            mode: self.mode,
            phase_reached,
            scores: self.scores,
            total_score: self.total_score,
            confidence: self.confidence,
            test_completed: self.test_completed,
            emergency_stopped: false,
            memory_coherent: self.scores.memory_coherency == MAX_MEMORY_COHERENCY,
            timing_met: self.scores.timing >= 70,
            error_recovery_passed: self.scores.error_recovery >= MAX_ERROR_RECOVERY * 70 / 100,
            stability_passed,
            cpu_supports_busmaster: true,
            dma_controller_present: self.scores.dma_controller > 0,
            chipset_compatible: self.total_score >= LOW_THRESHOLD,
            safe_for_production: self.safe_for_production,
            requires_fallback: self.confidence == ConfidenceLevel::Failed,
            failure_reason: None,
            recommendation: recommendation_for(self.confidence),
            duration_ms: 0,
        }
    }
}

/// Read and parse the stored record. `None` covers both "no record"
/// and "corrupt record"; fingerprint validation is the caller's step.
pub fn load(store: &mut dyn CacheStore) -> Option<CachedQualification> {
    // One spare byte so an oversized record reads as a size mismatch
    // instead of silently truncating to a valid length.
    let mut raw = [0u8; RECORD_LEN + 1];
    let n = match store.read(&mut raw) {
        Ok(0) => {
            debug!("no cached qualification record");
            return None;
        }
        Ok(n) => n,
        Err(err) => {
            warn!("cached qualification record unreadable: {err}");
            return None;
        }
    };
    let record = CachedQualification::decode(&raw[..n])?;
    info!("Loaded cached bus mastering test results");
    Some(record)
}

pub fn save(store: &mut dyn CacheStore, record: &CachedQualification) -> DmaResult<()> {
    store.write(&record.encode())?;
    info!("Saved bus mastering test results to cache");
    Ok(())
}

/// Drop the record so the next boot runs a fresh qualification.
/// Removing an absent record succeeds.
pub fn invalidate(store: &mut dyn CacheStore, reason: &str) -> DmaResult<()> {
    store.delete()?;
    info!("Invalidated cache: {reason}");
    Ok(())
}

fn checksum(data: &[u8]) -> u32 {
    // hash * 33 + byte, seeded at zero.
    let mut sum = 0u32;
    for &byte in data {
        sum = sum
            .wrapping_shl(5)
            .wrapping_add(sum)
            .wrapping_add(u32::from(byte));
    }
    sum
}

fn put_u16(raw: &mut [u8], at: usize, value: u16) {
    raw[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(raw: &mut [u8], at: usize, value: u32) {
    raw[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn get_u16(raw: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([raw[at], raw[at + 1]])
}

fn get_u32(raw: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::MemStore;

    fn sample_fingerprint() -> Fingerprint {
        Fingerprint {
            driver_version: 0x0042,
            cpu_code: 0x0586,
            chipset_id: 0x0000_1234,
            io_base: 0x300,
        }
    }

    fn sample_record() -> CachedQualification {
        CachedQualification {
            fingerprint: sample_fingerprint(),
            saved_at_ms: 55_000,
            mode: TestMode::Quick,
            scores: PhaseScores {
                dma_controller: 70,
                memory_coherency: 80,
                timing: 100,
                data_integrity: 85,
                burst_transfer: 77,
                error_recovery: 85,
                stability: 0,
            },
            total_score: 497,
            confidence: ConfidenceLevel::High,
            test_completed: true,
            safe_for_production: true,
            busmaster_enabled: true,
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let record = sample_record();
        let raw = record.encode();
        assert_eq!(raw.len(), RECORD_LEN);
        assert_eq!(&raw[0..5], b"3CPKT");
        assert_eq!(CachedQualification::decode(&raw), Some(record));
    }

    #[test]
    fn from_result_derives_enable_flag() {
        let fp = sample_fingerprint();
        let mut result = sample_record().rehydrate();

        result.confidence = ConfidenceLevel::Medium;
        let record = CachedQualification::from_result(fp, 1, &result);
        assert!(record.busmaster_enabled);

        result.confidence = ConfidenceLevel::Low;
        let record = CachedQualification::from_result(fp, 1, &result);
        assert!(!record.busmaster_enabled);
    }

    #[test]
    fn fingerprint_mismatches_name_what_changed() {
        let record = sample_record();
        let current = sample_fingerprint();
        assert_eq!(record.matches(&current), Ok(()));

        let mut changed = current;
        changed.driver_version = 0x0043;
        assert_eq!(record.matches(&changed), Err("Driver version changed"));

        let mut changed = current;
        changed.cpu_code = 0x0486;
        assert_eq!(record.matches(&changed), Err("CPU type changed"));

        let mut changed = current;
        changed.chipset_id = 0x5678;
        assert_eq!(record.matches(&changed), Err("Chipset changed"));

        let mut changed = current;
        changed.io_base = 0x320;
        assert_eq!(record.matches(&changed), Err("NIC I/O address changed"));
    }

    #[test]
    fn version_mismatch_reported_before_cpu_mismatch() {
        let record = sample_record();
        let mut changed = sample_fingerprint();
        changed.driver_version = 0x0050;
        changed.cpu_code = 0x0286;
        assert_eq!(record.matches(&changed), Err("Driver version changed"));
    }

    #[test]
    fn corruption_is_a_miss() {
        let record = sample_record();

        let mut raw = record.encode();
        raw[30] ^= 0x01; // timing score byte
        assert_eq!(CachedQualification::decode(&raw), None);

        let mut raw = record.encode();
        raw[0] = b'X';
        assert_eq!(CachedQualification::decode(&raw), None);

        let raw = record.encode();
        assert_eq!(CachedQualification::decode(&raw[..20]), None);
    }

    #[test]
    fn store_roundtrip_and_corruption() {
        let mut store = MemStore::new();
        assert_eq!(load(&mut store), None);

        let record = sample_record();
        save(&mut store, &record).unwrap();
        assert_eq!(load(&mut store), Some(record));

        store.corrupt_byte(16); // chipset field, checksum no longer matches
        assert_eq!(load(&mut store), None);
    }

    #[test]
    fn load_misses_on_store_fault() {
        let mut store = MemStore::new();
        save(&mut store, &sample_record()).unwrap();
        store.fail_reads = true;
        assert_eq!(load(&mut store), None);
    }

    #[test]
    fn invalidate_is_idempotent() {
        let mut store = MemStore::new();
        save(&mut store, &sample_record()).unwrap();
        invalidate(&mut store, "test").unwrap();
        assert!(store.raw().is_none());
        invalidate(&mut store, "test").unwrap();
    }

    #[test]
    fn rehydrate_derives_flags_from_scores() {
        let record = sample_record();
        let result = record.rehydrate();
        assert_eq!(result.total_score, 497);
        assert_eq!(result.confidence, ConfidenceLevel::High);
        assert!(result.test_completed);
        assert!(result.cpu_supports_busmaster);
        assert!(result.dma_controller_present);
        assert!(result.chipset_compatible);
        assert!(result.memory_coherent);
        assert!(result.timing_met);
        assert!(result.error_recovery_passed);
        assert!(result.stability_passed);
        assert!(!result.requires_fallback);
        assert_eq!(result.phase_reached, TestPhase::Stress);

        let mut failed = record;
        failed.total_score = 100;
        failed.confidence = ConfidenceLevel::Failed;
        failed.test_completed = false;
        failed.scores.memory_coherency = 30;
        let result = failed.rehydrate();
        assert!(!result.chipset_compatible);
        assert!(!result.memory_coherent);
        assert!(result.requires_fallback);
        assert_eq!(result.phase_reached, TestPhase::Basic);
        assert_eq!(
            result.recommendation,
            "Bus mastering not recommended - use programmed I/O for safety"
        );
    }
}
