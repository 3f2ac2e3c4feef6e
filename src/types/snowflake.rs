//! Snowflake-style 64-bit record identifiers.
//!
//! Layout, most significant bit first: 41 bits of millisecond offset from the
//! epoch, 10 bits of origin (machine) tag, 12 bits of per-millisecond sequence.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Millisecond epoch all Snowflake timestamps are offset from.
pub const SNOWFLAKE_EPOCH_MS: i64 = 1_288_834_974_657;

/// Origin tags observed issuing identifiers; enumerated by default.
pub const DEFAULT_ORIGIN_TAGS: [u16; 20] = [
    375, 382, 361, 372, 364, 381, 376, 365, 363, 362, 350, 325, 335, 333, 342, 326, 327, 336, 347,
    332,
];

pub const TIMESTAMP_SHIFT: u32 = 22;
pub const ORIGIN_SHIFT: u32 = 12;
pub const ORIGIN_MASK: u64 = 0x3FF;
pub const SEQUENCE_MASK: u64 = 0xFFF;
/// Largest representable millisecond offset (41 bits).
pub const MAX_TIMESTAMP_OFFSET: i64 = (1 << 41) - 1;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct SnowflakeId(pub u64);

impl SnowflakeId {
    /// Packs the three components. The caller guarantees
    /// `0 <= timestamp_ms - epoch_ms <= MAX_TIMESTAMP_OFFSET`.
    pub fn encode(timestamp_ms: i64, origin_tag: u16, sequence: u16, epoch_ms: i64) -> Self {
        let offset = (timestamp_ms - epoch_ms) as u64;
        Self(
            (offset << TIMESTAMP_SHIFT)
                | ((origin_tag as u64 & ORIGIN_MASK) << ORIGIN_SHIFT)
                | (sequence as u64 & SEQUENCE_MASK),
        )
    }

    /// Millisecond creation time.
    pub fn timestamp_ms(&self, epoch_ms: i64) -> i64 {
        (self.0 >> TIMESTAMP_SHIFT) as i64 + epoch_ms
    }

    pub fn origin_tag(&self) -> u16 {
        ((self.0 >> ORIGIN_SHIFT) & ORIGIN_MASK) as u16
    }

    pub fn sequence(&self) -> u16 {
        (self.0 & SEQUENCE_MASK) as u16
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for SnowflakeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for SnowflakeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
