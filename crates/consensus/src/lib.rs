//! Consensus constants, parameters, and the stake reward policy.

pub mod constants;
pub mod money;
pub mod params;
pub mod rewards;

pub use params::{
    chain_params, consensus_params, hash256_from_hex, hash256_to_hex, ChainParams,
    ConsensusParams, HexError, MaskEpoch, Network,
};
pub use rewards::{proof_of_stake_reward, stake_age};

pub type Hash256 = [u8; 32];
