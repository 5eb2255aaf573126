//! Step count wire record
//!
//! A step record is four bytes: the tag `0x01` followed by the count as a
//! 24-bit little-endian integer.

use serde::{Deserialize, Serialize};

use crate::errors::CodecError;

/// Tag byte leading every step record
pub const STEP_RECORD_TAG: u8 = 0x01;

/// Encoded record length
pub const STEP_RECORD_LEN: usize = 4;

/// Default upper bound for a reported step count
pub const DEFAULT_MAX_STEPS: u32 = 100_000;

/// Hard limit imposed by the 24-bit value field
pub const STEP_COUNT_LIMIT: u32 = 0x00FF_FFFF;

/// Encoded step record
pub type StepRecord = [u8; STEP_RECORD_LEN];

// ----------------------------------------------------------------------------
// Step Count
// ----------------------------------------------------------------------------

/// Validated step count
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StepCount(u32);

impl StepCount {
    pub const ZERO: Self = Self(0);

    /// Validate against the default bound
    pub fn new(value: u32) -> Result<Self, CodecError> {
        Self::with_max(value, DEFAULT_MAX_STEPS)
    }

    /// Validate against a custom bound (clamped to the 24-bit limit)
    pub fn with_max(value: u32, max: u32) -> Result<Self, CodecError> {
        let max = max.min(STEP_COUNT_LIMIT);
        if value > max {
            return Err(CodecError::OutOfRange { value, max });
        }
        Ok(Self(value))
    }

    pub fn value(self) -> u32 {
        self.0
    }

    pub fn encode(self) -> StepRecord {
        encode(self)
    }
}

impl std::fmt::Display for StepCount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Codec
// ----------------------------------------------------------------------------

/// Encode a step count into its 4-byte record
pub fn encode(count: StepCount) -> StepRecord {
    let le = count.0.to_le_bytes();
    [STEP_RECORD_TAG, le[0], le[1], le[2]]
}

/// Decode a record, validating against the default bound
pub fn decode(record: &StepRecord) -> Result<StepCount, CodecError> {
    decode_bounded(record, DEFAULT_MAX_STEPS)
}

/// Decode a record, validating against `max`
pub fn decode_bounded(record: &StepRecord, max: u32) -> Result<StepCount, CodecError> {
    if record[0] != STEP_RECORD_TAG {
        return Err(CodecError::BadTag(record[0]));
    }
    let value = u32::from_le_bytes([record[1], record[2], record[3], 0]);
    StepCount::with_max(value, max)
}

/// Decode an arbitrary byte slice, e.g. a characteristic write payload
pub fn decode_slice(bytes: &[u8], max: u32) -> Result<StepCount, CodecError> {
    let record: &StepRecord = bytes
        .try_into()
        .map_err(|_| CodecError::BadLength(bytes.len()))?;
    decode_bounded(record, max)
}
