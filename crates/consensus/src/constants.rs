//! Consensus-wide constants shared across validation.

/// The minimum allowed block version (network rule).
pub const MIN_BLOCK_VERSION: i32 = 1;
/// Version written by the block assembler.
pub const CURRENT_BLOCK_VERSION: i32 = 1;
/// The maximum allowed size for a serialized block, in bytes (network rule).
pub const MAX_BLOCK_SIZE: u32 = 2_000_000;
/// Bytes kept free in a template for the coinstake and block signature.
pub const COINSTAKE_RESERVED_SIZE: u32 = 1_000;
/// The maximum size of a single transaction (network rule).
pub const MAX_TX_SIZE: u32 = 1_000_000;
/// Maximum script size (consensus).
pub const MAX_SCRIPT_SIZE: usize = 10_000;
/// Seconds in a Julian year, the denominator of the coin-year reward.
pub const SECONDS_PER_YEAR: i64 = 31_557_600;
/// Block times may run ahead of the adjusted clock by at most this many seconds.
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;
/// Maximum reorg length accepted under normal conditions.
pub const MAX_REORG_LENGTH: i32 = 500;
