//! Standard scripts, signature hashing, and ECDSA checks for stake outputs.

mod secp;
pub mod sighash;
pub mod standard;
pub mod verify;

pub use verify::{
    sign_hash, sign_p2pk_input, verify_hash_signature, verify_input, ScriptError,
};
