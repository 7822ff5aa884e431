//! Stake kernel hashing and the weighted-by-value target check.

use primitive_types::U256;
use stakd_consensus::money::Amount;
use stakd_consensus::{ConsensusParams, Hash256};
use stakd_primitives::encoding::{Encodable, Encoder};
use stakd_primitives::hash::sha256d;
use stakd_primitives::outpoint::OutPoint;

use crate::difficulty::compact_to_u256;

/// A candidate stake: one unspent output paired with a proposed block time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StakeKernel {
    pub prevout: OutPoint,
    pub value: Amount,
    /// Creation time of the staked output (the time of its block).
    pub input_time: u32,
    pub block_time: u32,
}

impl StakeKernel {
    pub fn hash(&self) -> Hash256 {
        let mut encoder = Encoder::with_capacity(56);
        self.prevout.consensus_encode(&mut encoder);
        encoder.write_i64_le(self.value);
        encoder.write_u32_le(self.input_time);
        encoder.write_u32_le(self.block_time);
        sha256d(&encoder.into_inner())
    }
}

/// Maps the height target and the staked value to the bound the kernel hash
/// must not exceed.
pub trait TargetScaling: Send + Sync {
    fn scale(&self, target: U256, value: Amount) -> U256;
}

impl<T: TargetScaling + ?Sized> TargetScaling for &T {
    fn scale(&self, target: U256, value: Amount) -> U256 {
        (**self).scale(target, value)
    }
}

/// `target * value` in satoshis, saturating at the top of the range.
#[derive(Clone, Copy, Debug, Default)]
pub struct ValueWeighted;

impl TargetScaling for ValueWeighted {
    fn scale(&self, target: U256, value: Amount) -> U256 {
        if value <= 0 {
            return U256::zero();
        }
        target.saturating_mul(U256::from(value as u64))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelVerdict {
    Accepted,
    Misaligned,
    NotAfterInput,
    TooYoung,
    NonPositiveValue,
    BadTarget,
    AboveTarget,
}

impl KernelVerdict {
    pub fn is_accepted(self) -> bool {
        matches!(self, KernelVerdict::Accepted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KernelVerdict::Accepted => "accepted",
            KernelVerdict::Misaligned => "bad-cs-time-mask",
            KernelVerdict::NotAfterInput => "bad-cs-time-order",
            KernelVerdict::TooYoung => "bad-cs-age",
            KernelVerdict::NonPositiveValue => "bad-cs-value",
            KernelVerdict::BadTarget => "bad-cs-target",
            KernelVerdict::AboveTarget => "bad-cs-kernel",
        }
    }
}

pub struct KernelValidator<'a, S = ValueWeighted> {
    params: &'a ConsensusParams,
    scaling: S,
}

impl<'a> KernelValidator<'a, ValueWeighted> {
    pub fn new(params: &'a ConsensusParams) -> Self {
        Self {
            params,
            scaling: ValueWeighted,
        }
    }
}

impl<'a, S: TargetScaling> KernelValidator<'a, S> {
    pub fn with_scaling(params: &'a ConsensusParams, scaling: S) -> Self {
        Self { params, scaling }
    }

    /// Full decision for `kernel` at `target_height` whose compact target is
    /// `bits`. The alignment rule runs before any hashing.
    pub fn evaluate(&self, kernel: &StakeKernel, target_height: i32, bits: u32) -> KernelVerdict {
        let mask = self.params.stake_timestamp_mask(target_height);
        if kernel.block_time & mask != 0 {
            return KernelVerdict::Misaligned;
        }
        if kernel.block_time <= kernel.input_time {
            return KernelVerdict::NotAfterInput;
        }
        if kernel.block_time - kernel.input_time < self.params.stake_min_age {
            return KernelVerdict::TooYoung;
        }
        if kernel.value <= 0 {
            return KernelVerdict::NonPositiveValue;
        }
        let target = match compact_to_u256(bits) {
            Ok(target) if !target.is_zero() => target,
            _ => return KernelVerdict::BadTarget,
        };
        let bound = self.scaling.scale(target, kernel.value);
        if U256::from_little_endian(&kernel.hash()) <= bound {
            KernelVerdict::Accepted
        } else {
            KernelVerdict::AboveTarget
        }
    }

    pub fn check(&self, kernel: &StakeKernel, target_height: i32, bits: u32) -> bool {
        self.evaluate(kernel, target_height, bits).is_accepted()
    }
}

/// Default weighting shorthand for [`KernelValidator::check`].
pub fn check_kernel(
    kernel: &StakeKernel,
    target_height: i32,
    bits: u32,
    params: &ConsensusParams,
) -> bool {
    KernelValidator::new(params).check(kernel, target_height, bits)
}
