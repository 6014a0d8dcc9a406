//! CPU identity model.
//!
//! The resident driver detects the processor once at load time; this module
//! only carries the result. Family ordering matters: qualification policy
//! and cache-management selection both key off "is this generation or
//! newer" comparisons.

/// x86 processor families this subsystem distinguishes.
///
/// Ordering is chronological, so `>=` comparisons express capability
/// floors (`family >= Cpu486` means WBINVD exists, and so on).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CpuFamily {
    /// 8086/8088 class: no chipset interface for third-party bus masters.
    Cpu8086,
    /// 80286: bus mastering possible but chipset quality varies wildly.
    Cpu286,
    /// 80386: software barriers only, no cache instructions.
    Cpu386,
    /// 80486: WBINVD available.
    Cpu486,
    /// P5 Pentium.
    Pentium,
    /// Pentium 4 or newer: CLFLUSH available.
    Pentium4,
}

impl CpuFamily {
    /// Numeric code persisted in the result-cache fingerprint.
    pub fn code(self) -> u16 {
        match self {
            CpuFamily::Cpu8086 => 0x0086,
            CpuFamily::Cpu286 => 0x0286,
            CpuFamily::Cpu386 => 0x0386,
            CpuFamily::Cpu486 => 0x0486,
            CpuFamily::Pentium => 0x0586,
            CpuFamily::Pentium4 => 0x0F86,
        }
    }

    /// Reverse of [`code`](Self::code); unknown codes are treated as absent.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0086 => Some(CpuFamily::Cpu8086),
            0x0286 => Some(CpuFamily::Cpu286),
            0x0386 => Some(CpuFamily::Cpu386),
            0x0486 => Some(CpuFamily::Cpu486),
            0x0586 => Some(CpuFamily::Pentium),
            0x0F86 => Some(CpuFamily::Pentium4),
            _ => None,
        }
    }

    /// 286 and later can drive an ISA bus master at all.
    pub fn supports_busmaster(self) -> bool {
        self >= CpuFamily::Cpu286
    }

    /// WBINVD exists on 486 and later.
    pub fn has_wbinvd(self) -> bool {
        self >= CpuFamily::Cpu486
    }

    /// CLFLUSH exists on Pentium 4 and later.
    pub fn has_clflush(self) -> bool {
        self >= CpuFamily::Pentium4
    }

    /// 286 chipsets are inconsistent enough to demand the strictest
    /// qualification bar before bus mastering is trusted.
    pub fn requires_conservative_qualification(self) -> bool {
        self == CpuFamily::Cpu286
    }

    pub fn name(self) -> &'static str {
        match self {
            CpuFamily::Cpu8086 => "8086/8088",
            CpuFamily::Cpu286 => "80286",
            CpuFamily::Cpu386 => "80386",
            CpuFamily::Cpu486 => "80486",
            CpuFamily::Pentium => "Pentium",
            CpuFamily::Pentium4 => "Pentium 4+",
        }
    }
}

/// Cache write policy in effect when the driver loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Disabled,
    WriteThrough,
    WriteBack,
}

/// Snapshot of the detected processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuInfo {
    pub family: CpuFamily,
    /// Vendor string as reported by detection ("GenuineIntel", "AuthenticAMD", ...).
    pub vendor: &'static str,
    pub speed_mhz: u16,
}

impl CpuInfo {
    pub const fn new(family: CpuFamily, vendor: &'static str, speed_mhz: u16) -> Self {
        Self {
            family,
            vendor,
            speed_mhz,
        }
    }
}
