//! Coin-year stake reward policy.

use crate::constants::SECONDS_PER_YEAR;
use crate::money::{Amount, COIN};
use crate::params::ConsensusParams;

/// Seconds an output counted towards its reward, clamped to the configured
/// maximum stake age. Returns zero for non-positive ages.
pub fn stake_age(input_time: u32, block_time: u32, params: &ConsensusParams) -> i64 {
    let age = i64::from(block_time) - i64::from(input_time);
    if age <= 0 {
        return 0;
    }
    age.min(i64::from(params.stake_max_age))
}

/// Reward earned by staking `value` for `age_secs` seconds at `height`.
///
/// `value * coin_year_reward * age / (COIN * SECONDS_PER_YEAR)`, computed in
/// 128-bit arithmetic and truncated towards zero.
pub fn proof_of_stake_reward(
    value: Amount,
    age_secs: i64,
    height: i32,
    params: &ConsensusParams,
) -> Amount {
    if value <= 0 || age_secs <= 0 {
        return 0;
    }
    let rate = params.coin_year_reward(height);
    if rate <= 0 {
        return 0;
    }
    let numerator = i128::from(value) * i128::from(rate) * i128::from(age_secs);
    let denominator = i128::from(COIN) * i128::from(SECONDS_PER_YEAR);
    Amount::try_from(numerator / denominator).unwrap_or(Amount::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::CENT;
    use crate::params::{consensus_params, Network};

    #[test]
    fn full_year_pays_the_coin_year_rate() {
        let mut params = consensus_params(Network::Regtest);
        params.stake_max_age = u32::MAX;
        params.set_coin_year_reward(2 * CENT);
        let reward = proof_of_stake_reward(100 * COIN, SECONDS_PER_YEAR, 1, &params);
        assert_eq!(reward, 2 * COIN);
    }

    #[test]
    fn reward_scales_with_rate() {
        let mut params = consensus_params(Network::Regtest);
        params.set_coin_year_reward(2 * CENT);
        let high = proof_of_stake_reward(125_000 * COIN, 86_400, 5, &params);
        params.set_coin_year_reward(CENT);
        let low = proof_of_stake_reward(125_000 * COIN, 86_400, 5, &params);
        assert!(high > low);
        assert!(low > 0);
    }

    #[test]
    fn age_is_clamped() {
        let params = consensus_params(Network::Regtest);
        assert_eq!(stake_age(100, 50, &params), 0);
        assert_eq!(stake_age(100, 100, &params), 0);
        assert_eq!(stake_age(100, 160, &params), 60);
        assert_eq!(
            stake_age(0, u32::MAX, &params),
            i64::from(params.stake_max_age)
        );
    }
}
