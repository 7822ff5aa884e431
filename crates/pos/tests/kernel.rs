use primitive_types::U256;
use stakd_consensus::money::{Amount, COIN};
use stakd_consensus::{consensus_params, ConsensusParams, MaskEpoch, Network};
use stakd_pos::difficulty::{target_to_compact, u256_to_compact};
use stakd_pos::{check_kernel, KernelValidator, KernelVerdict, StakeKernel, TargetScaling};
use stakd_primitives::outpoint::OutPoint;

struct Lcg {
    state: u64,
}

impl Lcg {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
        self.state
    }

    fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }
}

fn params() -> ConsensusParams {
    consensus_params(Network::Regtest)
}

fn easy_bits(params: &ConsensusParams) -> u32 {
    target_to_compact(&params.pos_limit)
}

fn kernel(block_time: u32) -> StakeKernel {
    StakeKernel {
        prevout: OutPoint::new([0x5a; 32], 3),
        value: 1_000 * COIN,
        input_time: 1_600_000_000,
        block_time,
    }
}

struct Never;

impl TargetScaling for Never {
    fn scale(&self, _target: U256, _value: Amount) -> U256 {
        U256::zero()
    }
}

struct Always;

impl TargetScaling for Always {
    fn scale(&self, _target: U256, _value: Amount) -> U256 {
        U256::MAX
    }
}

#[test]
fn misaligned_time_rejected_for_any_hash() {
    let params = params();
    let validator = KernelValidator::with_scaling(&params, Always);
    let mut rng = Lcg::new(7);
    for _ in 0..256 {
        let mut time = 1_600_000_016 + (rng.next_u32() >> 4);
        if time & 0x0f == 0 {
            time += 1;
        }
        let candidate = StakeKernel {
            prevout: OutPoint::new([rng.next_u32() as u8; 32], rng.next_u32()),
            ..kernel(time)
        };
        assert_eq!(
            validator.evaluate(&candidate, 1, easy_bits(&params)),
            KernelVerdict::Misaligned
        );
    }
}

#[test]
fn aligned_time_passes_easy_target() {
    let params = params();
    let candidate = kernel(1_600_000_000 + 16 * 60);
    assert!(check_kernel(&candidate, 1, easy_bits(&params), &params));
}

#[test]
fn mask_follows_height_schedule() {
    let mut params = params();
    params.stake_timestamp_masks = vec![
        MaskEpoch { height: 0, mask: 0x0f },
        MaskEpoch { height: 10, mask: 0x3f },
    ];
    let validator = KernelValidator::with_scaling(&params, Always);
    let time = 1_600_000_000 + 16 * 61;
    assert_ne!(time & 0x3f, 0);
    assert!(validator.check(&kernel(time), 9, easy_bits(&params)));
    assert_eq!(
        validator.evaluate(&kernel(time), 10, easy_bits(&params)),
        KernelVerdict::Misaligned
    );
}

#[test]
fn time_must_follow_input() {
    let params = params();
    let validator = KernelValidator::with_scaling(&params, Always);
    let mut candidate = kernel(1_600_000_000);
    assert_eq!(
        validator.evaluate(&candidate, 1, easy_bits(&params)),
        KernelVerdict::NotAfterInput
    );
    candidate.value = 0;
    candidate.block_time += 16;
    assert_eq!(
        validator.evaluate(&candidate, 1, easy_bits(&params)),
        KernelVerdict::NonPositiveValue
    );
}

#[test]
fn scaling_is_pluggable() {
    let params = params();
    let candidate = kernel(1_600_000_000 + 16 * 60);
    let never = KernelValidator::with_scaling(&params, Never);
    assert_eq!(
        never.evaluate(&candidate, 1, easy_bits(&params)),
        KernelVerdict::AboveTarget
    );
    let always = KernelValidator::with_scaling(&params, Always);
    assert!(always.check(&candidate, 1, u256_to_compact(U256::from(1u64))));
}

#[test]
fn larger_stake_wins_more_often() {
    let params = params();
    let bits = u256_to_compact(U256::MAX >> 20);
    let validator = KernelValidator::new(&params);
    let mut small_hits = 0;
    let mut large_hits = 0;
    for slot in 1..=2_000u32 {
        let time = 1_600_000_000 + slot * 16;
        let small = StakeKernel {
            value: 1,
            ..kernel(time)
        };
        let large = StakeKernel {
            value: 1 << 19,
            ..kernel(time)
        };
        small_hits += usize::from(validator.check(&small, 1, bits));
        large_hits += usize::from(validator.check(&large, 1, bits));
    }
    assert!(large_hits > small_hits);
}

#[test]
fn decision_is_deterministic() {
    let params = params();
    let bits = u256_to_compact(U256::MAX >> 20);
    let validator = KernelValidator::new(&params);
    for slot in 1..=64u32 {
        let candidate = kernel(1_600_000_000 + slot * 16);
        let first = validator.evaluate(&candidate, 3, bits);
        let second = validator.evaluate(&candidate.clone(), 3, bits);
        assert_eq!(first, second);
    }
}

#[test]
fn zero_target_is_rejected() {
    let params = params();
    let validator = KernelValidator::with_scaling(&params, Always);
    assert_eq!(
        validator.evaluate(&kernel(1_600_000_016), 1, 0),
        KernelVerdict::BadTarget
    );
}
