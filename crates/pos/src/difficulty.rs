//! Compact target encoding and stake difficulty retargeting.

use primitive_types::U256;
use stakd_consensus::{ConsensusParams, Hash256};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

/// The slice of chain history the retarget looks at, oldest first.
#[derive(Clone, Copy, Debug)]
pub struct HeaderInfo {
    pub height: i32,
    pub time: u32,
    pub bits: u32,
}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    if bits & 0x0080_0000 != 0 {
        return Err(CompactError::Negative);
    }
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    let value = if size <= 3 {
        word >>= 8 * (3 - size);
        U256::from(word)
    } else {
        U256::from(word) << (8 * (size - 3))
    };
    if word != 0 && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32)) {
        return Err(CompactError::Overflow);
    }
    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }
    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact = if size <= 3 {
        value.low_u32() << (8 * (3 - size))
    } else {
        (value >> (8 * (size - 3))).low_u32()
    };
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    (size << 24) | (compact & 0x007f_ffff)
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    u256_to_compact(U256::from_little_endian(target))
}

/// Expected number of kernel attempts to hit `bits`, the unit of chain work.
pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    let one = U256::from(1u64);
    Ok((!target / (target + one)) + one)
}

/// Compact target that the block after `chain.last()` must carry.
///
/// Exponential moving retarget towards `target_spacing`:
/// `new = old * ((n - 1) * spacing + 2 * actual) / ((n + 1) * spacing)`
/// with `n = target_timespan / target_spacing`, capped at `pos_limit`.
/// Fewer than two ancestors yield the limit.
pub fn next_target_required(
    chain: &[HeaderInfo],
    params: &ConsensusParams,
) -> Result<u32, CompactError> {
    let limit = U256::from_little_endian(&params.pos_limit);
    let limit_bits = u256_to_compact(limit);
    let (prev, last) = match chain {
        [.., prev, last] => (prev, last),
        [last] if params.pos_no_retargeting => return Ok(last.bits),
        _ => return Ok(limit_bits),
    };
    if params.pos_no_retargeting {
        return Ok(last.bits);
    }

    let mut actual = i64::from(last.time) - i64::from(prev.time);
    if actual < 0 {
        actual = params.target_spacing;
    }
    let spacing = params.target_spacing.max(1);
    let interval = params.target_interval();
    let numerator = ((interval - 1) * spacing + 2 * actual).max(1) as u64;
    let denominator = ((interval + 1) * spacing) as u64;

    let previous = compact_to_u256(last.bits)?;
    let scaled = previous.saturating_mul(U256::from(numerator)) / U256::from(denominator);
    if scaled.is_zero() {
        return Ok(u256_to_compact(U256::from(1u64)));
    }
    Ok(u256_to_compact(scaled.min(limit)))
}
