//! Legacy signature hashing for transparent inputs.

use stakd_consensus::Hash256;
use stakd_primitives::encoding::{Encodable, Encoder};
use stakd_primitives::hash::sha256d;
use stakd_primitives::transaction::Transaction;

pub const SIGHASH_ALL: u32 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SighashError {
    InputIndexOutOfRange,
    UnsupportedHashType(u32),
}

impl std::fmt::Display for SighashError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SighashError::InputIndexOutOfRange => write!(f, "input index out of range"),
            SighashError::UnsupportedHashType(kind) => {
                write!(f, "unsupported sighash type {kind:#x}")
            }
        }
    }
}

impl std::error::Error for SighashError {}

/// Digest signed by input `input_index`: every scriptSig is cleared, the
/// signed input carries `script_code`, and the hash type is appended.
pub fn signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    hash_type: u32,
) -> Result<Hash256, SighashError> {
    if hash_type != SIGHASH_ALL {
        return Err(SighashError::UnsupportedHashType(hash_type));
    }
    if input_index >= tx.vin.len() {
        return Err(SighashError::InputIndexOutOfRange);
    }

    let mut stripped = tx.clone();
    for (index, input) in stripped.vin.iter_mut().enumerate() {
        input.script_sig = if index == input_index {
            script_code.to_vec()
        } else {
            Vec::new()
        };
    }

    let mut encoder = Encoder::new();
    Encodable::consensus_encode(&stripped, &mut encoder);
    encoder.write_u32_le(hash_type);
    Ok(sha256d(&encoder.into_inner()))
}
