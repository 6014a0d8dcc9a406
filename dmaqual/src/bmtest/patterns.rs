//! Data-integrity test patterns.
//!
//! Each pattern targets a different failure mode of a DMA path: walking
//! bits catch stuck and shorted data lines, alternating bytes catch
//! inter-line coupling, the address tag catches transposed bursts, and
//! the pseudo-random fill catches everything that has no excuse.

/// Every integrity pattern fills this many bytes.
pub const PATTERN_LEN: usize = 256;

/// Multiplier/increment pair of the classic C-library generator; kept so
/// a logged seed reproduces the exact fill.
const LCG_MUL: u32 = 1_103_515_245;
const LCG_INC: u32 = 12_345;

/// Deterministic byte stream for the pseudo-random pattern.
pub struct Lcg {
    state: u32,
}

impl Lcg {
    pub fn new(seed: u32) -> Self {
        Self { state: seed }
    }

    pub fn next_u8(&mut self) -> u8 {
        self.state = self.state.wrapping_mul(LCG_MUL).wrapping_add(LCG_INC);
        (self.state >> 16) as u8
    }
}

/// The seven integrity patterns, in run order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPattern {
    WalkingOnes,
    WalkingZeros,
    Alternating55,
    AlternatingAa,
    PseudoRandom,
    AddressTag,
    ChecksumTagged,
}

impl TestPattern {
    pub const ALL: [TestPattern; 7] = [
        TestPattern::WalkingOnes,
        TestPattern::WalkingZeros,
        TestPattern::Alternating55,
        TestPattern::AlternatingAa,
        TestPattern::PseudoRandom,
        TestPattern::AddressTag,
        TestPattern::ChecksumTagged,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TestPattern::WalkingOnes => "walking ones",
            TestPattern::WalkingZeros => "walking zeros",
            TestPattern::Alternating55 => "alternating 0x55",
            TestPattern::AlternatingAa => "alternating 0xAA",
            TestPattern::PseudoRandom => "pseudo-random",
            TestPattern::AddressTag => "address tag",
            TestPattern::ChecksumTagged => "checksum tagged",
        }
    }

    /// Fill `buf` with this pattern. `seed` only affects the
    /// pseudo-random fill.
    pub fn fill(self, buf: &mut [u8], seed: u32) {
        match self {
            TestPattern::WalkingOnes => {
                for (i, byte) in buf.iter_mut().enumerate() {
                    *byte = 1 << (i % 8);
                }
            }
            TestPattern::WalkingZeros => {
                for (i, byte) in buf.iter_mut().enumerate() {
                    *byte = !(1 << (i % 8));
                }
            }
            TestPattern::Alternating55 => buf.fill(0x55),
            TestPattern::AlternatingAa => buf.fill(0xAA),
            TestPattern::PseudoRandom => {
                let mut lcg = Lcg::new(seed);
                for byte in buf.iter_mut() {
                    *byte = lcg.next_u8();
                }
            }
            TestPattern::AddressTag => {
                for (i, byte) in buf.iter_mut().enumerate() {
                    *byte = (i & 0xFF) as u8;
                }
            }
            TestPattern::ChecksumTagged => {
                for (i, byte) in buf.iter_mut().enumerate() {
                    *byte = ((i ^ 0x5A) & 0xFF) as u8;
                }
            }
        }
    }
}

/// Burst-transfer fill.
pub fn fill_burst(buf: &mut [u8]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte = ((i + 0x12) & 0xFF) as u8;
    }
}

/// 16-bit wrapping byte sum, the checksum the tagged pattern is checked
/// against after its transfer.
pub fn byte_sum16(data: &[u8]) -> u16 {
    let mut sum = 0u16;
    for &byte in data {
        sum = sum.wrapping_add(u16::from(byte));
    }
    sum
}
