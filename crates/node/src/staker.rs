//! Proof-of-stake block production.
//!
//! Each [`Staker::tick`] aligns the clock to the stake timestamp mask, looks
//! for a kernel among the wallet's stakeable outputs and, on success, turns
//! a block template into a signed block and submits it. The kernel search
//! itself runs with every node lock released.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use stakd_consensus::money::Amount;
use stakd_consensus::{hash256_to_hex, proof_of_stake_reward, stake_age, ConsensusParams, Hash256};
use stakd_pos::{KernelValidator, StakeKernel, TargetScaling};
use stakd_primitives::block::Block;
use stakd_primitives::transaction::TxIn;
use stakd_storage::KeyValueStore;
use tokio::sync::watch;

use crate::context::{NodeContext, NodeError};
use crate::miner::BlockAssembler;
use crate::wallet::WalletCoin;

pub const DEFAULT_STAKE_INTERVAL_MS: u64 = 500;

pub trait Clock: Send + Sync {
    /// Network-adjusted unix time in seconds.
    fn adjusted_time(&self) -> u32;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn adjusted_time(&self) -> u32 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u32::try_from(duration.as_secs()).unwrap_or(u32::MAX))
            .unwrap_or(0)
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn adjusted_time(&self) -> u32 {
        (**self).adjusted_time()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StakerState {
    Idle,
    Searching,
    Found,
    TimedOut,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StakeOutcome {
    /// The aligned slot was already searched.
    Debounced,
    NoKernel,
    Staked { hash: Hash256, height: i32 },
    /// Accepted, but a competing block holds the active chain.
    Orphaned { hash: Hash256, height: i32 },
    /// The chain refused the block; carries the reject code or error.
    Rejected(String),
    /// Transient: no template could be built or the tip moved.
    NoTemplate(String),
}

/// What a search needs, captured under the locks.
struct SearchJob {
    tip_hash: Hash256,
    height: i32,
    bits: u32,
    search_time: u32,
    params: ConsensusParams,
    scaling: Arc<dyn TargetScaling>,
    candidates: Vec<WalletCoin>,
}

pub struct Staker<S, C> {
    ctx: Arc<NodeContext<S>>,
    clock: C,
    state: StakerState,
}

impl<S: KeyValueStore, C: Clock> Staker<S, C> {
    pub fn new(ctx: Arc<NodeContext<S>>, clock: C) -> Self {
        Self {
            ctx,
            clock,
            state: StakerState::Idle,
        }
    }

    /// State after the last tick: `Found` or `TimedOut` when a search ran,
    /// `Idle` otherwise.
    pub fn state(&self) -> StakerState {
        self.state
    }

    pub fn tick(&mut self) -> Result<StakeOutcome, NodeError> {
        self.state = StakerState::Idle;
        let Some(job) = self.prepare()? else {
            return Ok(StakeOutcome::Debounced);
        };
        if job.candidates.is_empty() {
            self.state = StakerState::TimedOut;
            return Ok(StakeOutcome::NoKernel);
        }

        self.state = StakerState::Searching;
        let Some(found) = search(&job) else {
            self.state = StakerState::TimedOut;
            stakd_log::log_debug!(
                "no kernel in slot {} across {} outputs",
                job.search_time,
                job.candidates.len()
            );
            return Ok(StakeOutcome::NoKernel);
        };
        self.state = StakerState::Found;

        let block = match self.build_block(&job, &found)? {
            Ok(block) => block,
            Err(reason) => {
                stakd_log::log_debug!("kernel found but no template: {reason}");
                return Ok(StakeOutcome::NoTemplate(reason));
            }
        };
        let hash = block.hash();
        let state = self.ctx.submit_block(&block)?;
        if let Some(rejection) = state.rejection() {
            stakd_log::log_warn!(
                "staked block {} rejected: {}",
                hash256_to_hex(&hash),
                rejection
            );
            return Ok(StakeOutcome::Rejected(rejection.code.to_string()));
        }
        if let stakd_chainstate::ValidationState::Error(message) = state {
            return Ok(StakeOutcome::Rejected(message));
        }
        if !self
            .ctx
            .with_chain(|chain| chain.index().contains_active(&hash))?
        {
            stakd_log::log_info!(
                "staked block {} at height {} is not on the active chain",
                hash256_to_hex(&hash),
                job.height
            );
            return Ok(StakeOutcome::Orphaned {
                hash,
                height: job.height,
            });
        }
        stakd_log::log_info!(
            "staked block {} at height {} with {}",
            hash256_to_hex(&hash),
            job.height,
            found.outpoint
        );
        Ok(StakeOutcome::Staked {
            hash,
            height: job.height,
        })
    }

    /// Aligns the clock, applies the debounce and snapshots the candidates.
    /// `None` means the slot was already searched.
    fn prepare(&self) -> Result<Option<SearchJob>, NodeError> {
        let now = self.clock.adjusted_time();
        self.ctx.with_chain_mempool_wallet(
            |chain, mempool, wallet| -> Result<Option<SearchJob>, NodeError> {
                let tip = chain
                    .tip()
                    .cloned()
                    .ok_or(NodeError::Chain(stakd_chainstate::ChainStateError::MissingHeader))?;
                let height = tip.height + 1;
                let mask = chain.params().stake_timestamp_mask(height);
                let search_time = now & !mask;
                if search_time <= wallet.last_search_time() {
                    return Ok(None);
                }
                wallet.set_last_search_time(search_time);
                let mut job = SearchJob {
                    tip_hash: tip.hash,
                    height,
                    bits: 0,
                    search_time,
                    params: chain.params().clone(),
                    scaling: chain.target_scaling(),
                    candidates: Vec::new(),
                };
                if search_time <= tip.time {
                    stakd_log::log_trace!("slot {search_time} not after tip time {}", tip.time);
                    return Ok(Some(job));
                }
                job.bits = chain.expected_bits(height)?;
                job.candidates = wallet.stakeable_coins(chain, mempool, search_time)?;
                Ok(Some(job))
            },
        )?
    }

    /// Fills a fresh template with the found kernel. The inner error is a
    /// transient reason to retry on a later tick.
    fn build_block(
        &self,
        job: &SearchJob,
        found: &WalletCoin,
    ) -> Result<Result<Block, String>, NodeError> {
        self.ctx.with_chain_mempool_wallet(
            |chain, mempool, wallet| -> Result<Result<Block, String>, NodeError> {
                if chain.best_block() != Some(job.tip_hash) {
                    return Ok(Err("tip changed during search".to_string()));
                }
                let stake_script = found.coin.output.script_pubkey.clone();
                let mut template = match BlockAssembler::new(chain, mempool)
                    .with_reserved_inputs([found.outpoint])
                    .create_template(&stake_script)
                {
                    Ok(template) => template,
                    Err(err) => return Ok(Err(err.to_string())),
                };
                if template.height != job.height || template.block.header.bits != job.bits {
                    return Ok(Err("template does not match the searched slot".to_string()));
                }

                let value = found.coin.output.value;
                let age = stake_age(found.coin.time, job.search_time, &job.params);
                let reward = proof_of_stake_reward(value, age, job.height, &job.params);
                let payout: Amount = value
                    .checked_add(reward)
                    .and_then(|total| total.checked_add(template.total_fees))
                    .ok_or(NodeError::Miner(crate::miner::MinerError::NoTemplate(
                        "coinstake payout overflows".to_string(),
                    )))?;

                let coinstake = &mut template.block.transactions[0];
                coinstake.vin = vec![TxIn::new(found.outpoint)];
                coinstake.vout[1].value = payout;
                wallet.sign_input(coinstake, 0, &stake_script)?;

                template.block.header.stake_prevout = found.outpoint;
                template.block.header.time = job.search_time;
                template.refresh_merkle_root();
                wallet.sign_block(&mut template.block, &stake_script)?;
                Ok(Ok(template.block))
            },
        )?
    }
}

/// First candidate whose kernel meets the target at the searched slot.
fn search(job: &SearchJob) -> Option<WalletCoin> {
    let validator = KernelValidator::with_scaling(&job.params, job.scaling.as_ref());
    job.candidates
        .iter()
        .find(|candidate| {
            let kernel = StakeKernel {
                prevout: candidate.outpoint,
                value: candidate.coin.output.value,
                input_time: candidate.coin.time,
                block_time: job.search_time,
            };
            validator.check(&kernel, job.height, job.bits)
        })
        .cloned()
}

/// Ticks `staker` every `interval` until `shutdown` turns true.
pub async fn run_staker<S, C>(
    mut staker: Staker<S, C>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) where
    S: KeyValueStore,
    C: Clock,
{
    stakd_log::log_info!("staking enabled, tick every {}ms", interval.as_millis());
    loop {
        if *shutdown.borrow() {
            break;
        }
        match staker.tick() {
            Ok(StakeOutcome::Staked { .. })
            | Ok(StakeOutcome::Orphaned { .. })
            | Ok(StakeOutcome::Debounced)
            | Ok(StakeOutcome::NoKernel) => {}
            Ok(StakeOutcome::Rejected(reason)) => {
                stakd_log::log_warn!("stake attempt rejected: {reason}");
            }
            Ok(StakeOutcome::NoTemplate(reason)) => {
                stakd_log::log_debug!("stake attempt deferred: {reason}");
            }
            Err(err) => {
                stakd_log::log_error!("staker tick failed: {err}");
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    stakd_log::log_info!("staker stopped");
}
