//! Pay-to-pubkey spending checks and signing helpers.

use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, SecretKey};
use stakd_consensus::Hash256;
use stakd_log::log_debug;
use stakd_primitives::transaction::Transaction;

use crate::secp::{secp256k1_sign, secp256k1_verify};
use crate::sighash::{signature_hash, SighashError, SIGHASH_ALL};
use crate::standard::p2pk_pubkey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    NonStandardScript,
    MalformedScriptSig,
    InvalidPublicKey,
    InvalidSignatureEncoding,
    SignatureMismatch,
    InvalidSecretKey,
    Sighash(SighashError),
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptError::NonStandardScript => write!(f, "script is not pay-to-pubkey"),
            ScriptError::MalformedScriptSig => write!(f, "malformed scriptSig"),
            ScriptError::InvalidPublicKey => write!(f, "invalid public key"),
            ScriptError::InvalidSignatureEncoding => write!(f, "invalid DER signature"),
            ScriptError::SignatureMismatch => write!(f, "signature does not verify"),
            ScriptError::InvalidSecretKey => write!(f, "invalid secret key"),
            ScriptError::Sighash(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ScriptError {}

impl From<SighashError> for ScriptError {
    fn from(err: SighashError) -> Self {
        ScriptError::Sighash(err)
    }
}

/// DER-encoded ECDSA signature of `hash`.
pub fn sign_hash(secret: &[u8; 32], hash: &Hash256) -> Result<Vec<u8>, ScriptError> {
    let key = SecretKey::from_slice(secret).map_err(|_| ScriptError::InvalidSecretKey)?;
    let msg = Message::from_digest(*hash);
    Ok(secp256k1_sign()
        .sign_ecdsa(&msg, &key)
        .serialize_der()
        .to_vec())
}

/// Checks a DER signature of `hash` against the key locked in a P2PK script.
pub fn verify_hash_signature(
    script_pubkey: &[u8],
    signature: &[u8],
    hash: &Hash256,
) -> Result<(), ScriptError> {
    let pubkey = p2pk_pubkey(script_pubkey).ok_or(ScriptError::NonStandardScript)?;
    let pubkey = PublicKey::from_slice(pubkey).map_err(|_| ScriptError::InvalidPublicKey)?;
    let mut sig =
        Signature::from_der(signature).map_err(|_| ScriptError::InvalidSignatureEncoding)?;
    sig.normalize_s();
    let msg = Message::from_digest(*hash);
    secp256k1_verify()
        .verify_ecdsa(&msg, &sig, &pubkey)
        .map_err(|_| ScriptError::SignatureMismatch)
}

/// Verifies that input `input_index` of `tx` satisfies the P2PK `script_pubkey`.
///
/// The scriptSig is a single push of `<DER signature || hash type>`.
pub fn verify_input(
    tx: &Transaction,
    input_index: usize,
    script_pubkey: &[u8],
) -> Result<(), ScriptError> {
    let input = tx
        .vin
        .get(input_index)
        .ok_or(ScriptError::Sighash(SighashError::InputIndexOutOfRange))?;
    let (signature, hash_type) = split_push(&input.script_sig)?;
    let hash = signature_hash(tx, input_index, script_pubkey, hash_type)?;
    let result = verify_hash_signature(script_pubkey, signature, &hash);
    if let Err(err) = &result {
        log_debug!("input {} of tx rejected: {}", input_index, err);
    }
    result
}

/// Produces the scriptSig spending a P2PK output with `secret`.
pub fn sign_p2pk_input(
    tx: &Transaction,
    input_index: usize,
    script_pubkey: &[u8],
    secret: &[u8; 32],
) -> Result<Vec<u8>, ScriptError> {
    if p2pk_pubkey(script_pubkey).is_none() {
        return Err(ScriptError::NonStandardScript);
    }
    let hash = signature_hash(tx, input_index, script_pubkey, SIGHASH_ALL)?;
    let mut payload = sign_hash(secret, &hash)?;
    payload.push(SIGHASH_ALL as u8);
    let mut script_sig = Vec::with_capacity(payload.len() + 1);
    script_sig.push(payload.len() as u8);
    script_sig.extend_from_slice(&payload);
    Ok(script_sig)
}

fn split_push(script_sig: &[u8]) -> Result<(&[u8], u32), ScriptError> {
    let (&len, rest) = script_sig
        .split_first()
        .ok_or(ScriptError::MalformedScriptSig)?;
    let len = len as usize;
    if len < 2 || len > 75 || rest.len() != len {
        return Err(ScriptError::MalformedScriptSig);
    }
    let (signature, hash_type) = rest.split_at(len - 1);
    Ok((signature, u32::from(hash_type[0])))
}
