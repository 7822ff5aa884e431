//! Consensus parameter definitions.

use crate::money::{Amount, CENT, COIN};
use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Some(Network::Mainnet),
            "testnet" | "test" => Some(Network::Testnet),
            "regtest" => Some(Network::Regtest),
            _ => None,
        }
    }
}

/// Stake timestamp granularity taking effect at `height`.
///
/// `mask` is a low-bit mask of the form `2^k - 1`: an aligned block time has
/// all of those bits cleared.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MaskEpoch {
    pub height: i32,
    pub mask: u32,
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub network: Network,
    /// Expected genesis hash. `None` accepts the genesis supplied at open and
    /// pins it in the store.
    pub hash_genesis_block: Option<Hash256>,
    pub genesis_time: u32,
    pub pos_limit: Hash256,
    pub pos_no_retargeting: bool,
    pub target_spacing: i64,
    pub target_timespan: i64,
    /// Sorted by activation height; the first entry must activate at 0.
    pub stake_timestamp_masks: Vec<MaskEpoch>,
    coin_year_reward: Amount,
    pub stake_min_depth: i32,
    pub stake_min_age: u32,
    pub stake_max_age: u32,
    pub coinstake_maturity: i32,
    pub check_block_signature: bool,
}

impl ConsensusParams {
    pub fn stake_timestamp_mask(&self, height: i32) -> u32 {
        self.stake_timestamp_masks
            .iter()
            .rev()
            .find(|epoch| epoch.height <= height)
            .map(|epoch| epoch.mask)
            .unwrap_or(0)
    }

    pub fn coin_year_reward(&self, _height: i32) -> Amount {
        self.coin_year_reward
    }

    pub fn set_coin_year_reward(&mut self, rate: Amount) {
        self.coin_year_reward = rate;
    }

    pub fn target_interval(&self) -> i64 {
        (self.target_timespan / self.target_spacing).max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "invalid hex length"),
            HexError::InvalidHex => write!(f, "invalid hex digit"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parses a big-endian display hex string into little-endian hash bytes.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut hex = input.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }
    if hex.is_empty() || hex.len() > 64 {
        return Err(HexError::InvalidLength);
    }

    let padded = format!("{hex:0>64}");
    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let start = i * 2;
        *byte_out = u8::from_str_radix(&padded[start..start + 2], 16)
            .map_err(|_| HexError::InvalidHex)?;
    }
    bytes.reverse();
    Ok(bytes)
}

pub fn hash256_to_hex(hash: &Hash256) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

pub fn consensus_params(network: Network) -> ConsensusParams {
    match network {
        Network::Mainnet => mainnet_consensus_params(),
        Network::Testnet => testnet_consensus_params(),
        Network::Regtest => regtest_consensus_params(),
    }
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub consensus: ConsensusParams,
    /// Value credited to the genesis coinbase.
    pub genesis_supply: Amount,
    /// Number of equal outputs the genesis coinbase is split into.
    pub genesis_outputs: u32,
    pub conf_file_name: &'static str,
}

pub fn chain_params(network: Network) -> ChainParams {
    let consensus = consensus_params(network);
    match network {
        Network::Mainnet => ChainParams {
            network,
            consensus,
            genesis_supply: 10_000_000 * COIN,
            genesis_outputs: 1,
            conf_file_name: "stakd.conf",
        },
        Network::Testnet => ChainParams {
            network,
            consensus,
            genesis_supply: 10_000_000 * COIN,
            genesis_outputs: 10,
            conf_file_name: "stakd.conf",
        },
        Network::Regtest => ChainParams {
            network,
            consensus,
            genesis_supply: 125_000 * COIN,
            genesis_outputs: 5,
            conf_file_name: "stakd.conf",
        },
    }
}

fn parse_limit(hex: &str) -> Hash256 {
    hash256_from_hex(hex).unwrap_or([0xff; 32])
}

fn mainnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Mainnet,
        hash_genesis_block: None,
        genesis_time: 1_700_000_000,
        pos_limit: parse_limit("00000fffffffffffffffffffffffffffffffffffffffffffffffffffffffffff"),
        pos_no_retargeting: false,
        target_spacing: 120,
        target_timespan: 24 * 60 * 60,
        stake_timestamp_masks: vec![MaskEpoch {
            height: 0,
            mask: 0x0f,
        }],
        coin_year_reward: 2 * CENT,
        stake_min_depth: 225,
        stake_min_age: 60 * 60,
        stake_max_age: 90 * 24 * 60 * 60,
        coinstake_maturity: 100,
        check_block_signature: true,
    }
}

fn testnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Testnet,
        hash_genesis_block: None,
        genesis_time: 1_700_000_000,
        pos_limit: parse_limit("000fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff"),
        pos_no_retargeting: false,
        target_spacing: 60,
        target_timespan: 60 * 60,
        stake_timestamp_masks: vec![MaskEpoch {
            height: 0,
            mask: 0x0f,
        }],
        coin_year_reward: 2 * CENT,
        stake_min_depth: 10,
        stake_min_age: 0,
        stake_max_age: 90 * 24 * 60 * 60,
        coinstake_maturity: 10,
        check_block_signature: true,
    }
}

fn regtest_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Regtest,
        hash_genesis_block: None,
        genesis_time: 1_600_000_000,
        pos_limit: parse_limit("7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff"),
        pos_no_retargeting: true,
        target_spacing: 16,
        target_timespan: 16 * 16,
        stake_timestamp_masks: vec![MaskEpoch {
            height: 0,
            mask: 0x0f,
        }],
        coin_year_reward: 2 * CENT,
        stake_min_depth: 1,
        stake_min_age: 0,
        stake_max_age: 365 * 24 * 60 * 60,
        coinstake_maturity: 2,
        check_block_signature: true,
    }
}
