use primitive_types::U256;
use stakd_pos::difficulty::{compact_to_u256, target_to_compact, u256_to_compact, CompactError};

#[test]
fn compact_round_trip() {
    for bits in [0x1d00_ffffu32, 0x1c00_ffff, 0x207f_ffff, 0x1e0f_ffff] {
        let value = compact_to_u256(bits).expect("target");
        assert_eq!(u256_to_compact(value), bits);
    }
}

#[test]
fn compact_target_layout() {
    let target = compact_to_u256(0x207f_ffff).expect("target").to_little_endian();
    assert!(target[..29].iter().all(|b| *b == 0));
    assert_eq!(target[29], 0xff);
    assert_eq!(target[30], 0xff);
    assert_eq!(target[31], 0x7f);
    assert_eq!(target_to_compact(&target), 0x207f_ffff);
}

#[test]
fn sign_bit_and_overflow_rejected() {
    assert_eq!(compact_to_u256(0x0480_0000), Err(CompactError::Negative));
    assert_eq!(compact_to_u256(0xff00_ffff), Err(CompactError::Overflow));
    assert_eq!(u256_to_compact(U256::zero()), 0);
}
