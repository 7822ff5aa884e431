//! Block template assembly from the mempool.

use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use stakd_chainstate::{ChainState, CoinsDb, CoinsError, CoinsViewCache};
use stakd_consensus::constants::{COINSTAKE_RESERVED_SIZE, CURRENT_BLOCK_VERSION, MAX_BLOCK_SIZE};
use stakd_consensus::money::Amount;
use stakd_consensus::Hash256;
use stakd_primitives::block::{compute_merkle_root, Block, BlockHeader};
use stakd_primitives::outpoint::OutPoint;
use stakd_primitives::transaction::{Transaction, TxOut};
use stakd_storage::KeyValueStore;

use crate::mempool::{compare_fee_rate, Mempool, MempoolEntry};

#[derive(Debug)]
pub enum MinerError {
    NoTemplate(String),
}

impl std::fmt::Display for MinerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MinerError::NoTemplate(reason) => write!(f, "no block template: {reason}"),
        }
    }
}

impl std::error::Error for MinerError {}

#[derive(Clone, Debug)]
pub struct BlockTemplate {
    /// `transactions[0]` is a coinstake skeleton without inputs whose second
    /// output pays `total_fees` to the reward destination.
    pub block: Block,
    pub height: i32,
    pub total_fees: Amount,
    /// Fee of each selected transaction, in block order after the coinstake.
    pub tx_fees: Vec<Amount>,
}

impl BlockTemplate {
    pub fn refresh_merkle_root(&mut self) {
        self.block.header.merkle_root = self.block.compute_merkle_root();
    }
}

pub struct BlockAssembler<'a, S> {
    chain: &'a ChainState<S>,
    mempool: &'a Mempool,
    max_tx_bytes: usize,
    reserved_inputs: HashSet<OutPoint>,
}

enum Pick {
    Selected,
    Skipped,
}

impl<'a, S: KeyValueStore> BlockAssembler<'a, S> {
    pub fn new(chain: &'a ChainState<S>, mempool: &'a Mempool) -> Self {
        Self {
            chain,
            mempool,
            max_tx_bytes: (MAX_BLOCK_SIZE - COINSTAKE_RESERVED_SIZE) as usize,
            reserved_inputs: HashSet::new(),
        }
    }

    pub fn with_max_tx_bytes(mut self, bytes: usize) -> Self {
        self.max_tx_bytes = bytes;
        self
    }

    /// Inputs the block's own coinstake spends. Pool transactions touching
    /// them are left out.
    pub fn with_reserved_inputs(mut self, inputs: impl IntoIterator<Item = OutPoint>) -> Self {
        self.reserved_inputs.extend(inputs);
        self
    }

    pub fn create_template(&self, reward_destination: &[u8]) -> Result<BlockTemplate, MinerError> {
        let tip = self
            .chain
            .tip()
            .ok_or_else(|| MinerError::NoTemplate("chain tip unknown".to_string()))?;
        let height = tip.height + 1;
        let bits = self
            .chain
            .expected_bits(height)
            .map_err(|err| MinerError::NoTemplate(err.to_string()))?;

        let mut candidates: Vec<&MempoolEntry> = self.mempool.entries().collect();
        candidates.sort_by(|a, b| {
            compare_fee_rate(b.fee, b.size(), a.fee, a.size())
                .then_with(|| a.time.cmp(&b.time))
                .then_with(|| a.txid.cmp(&b.txid))
        });

        let mut view = self.chain.coins_view();
        let mut selection = Selection::default();
        for entry in candidates {
            self.pick(entry, &mut selection, &mut view)
                .map_err(|err| MinerError::NoTemplate(err.to_string()))?;
        }

        let total_fees: Amount = selection.fees.iter().sum();
        let coinstake = Transaction::new(
            Vec::new(),
            vec![
                TxOut::empty(),
                TxOut::new(total_fees, reward_destination.to_vec()),
            ],
        );
        let mut transactions = Vec::with_capacity(selection.order.len() + 1);
        transactions.push(coinstake);
        transactions.extend(selection.order.iter().cloned());

        let txids: Vec<Hash256> = transactions.iter().map(Transaction::txid).collect();
        let block = Block {
            header: BlockHeader {
                version: CURRENT_BLOCK_VERSION,
                prev_block: tip.hash,
                merkle_root: compute_merkle_root(&txids),
                time: tip.time.saturating_add(1).max(unix_now()),
                bits,
                stake_prevout: OutPoint::null(),
                block_sig: Vec::new(),
            },
            transactions,
        };
        stakd_log::log_debug!(
            "block template at height {} with {} transactions, fees {}",
            height,
            block.transactions.len() - 1,
            total_fees
        );
        Ok(BlockTemplate {
            block,
            height,
            total_fees,
            tx_fees: selection.fees,
        })
    }

    /// Adds `entry` after its in-pool ancestors. A transaction is skipped
    /// when an ancestor was skipped, an input is gone or already used in
    /// this block, or it does not fit.
    fn pick(
        &self,
        entry: &MempoolEntry,
        selection: &mut Selection,
        view: &mut CoinsViewCache<CoinsDb<S>>,
    ) -> Result<Pick, CoinsError> {
        if selection.chosen.contains(&entry.txid) {
            return Ok(Pick::Selected);
        }
        if selection.skipped.contains(&entry.txid) {
            return Ok(Pick::Skipped);
        }
        for parent in &entry.parents {
            let Some(parent_entry) = self.mempool.get(parent) else {
                continue;
            };
            if let Pick::Skipped = self.pick(parent_entry, selection, view)? {
                selection.skipped.insert(entry.txid);
                return Ok(Pick::Skipped);
            }
        }

        for input in &entry.tx.vin {
            let prevout = input.prevout;
            let available = if selection.spent.contains(&prevout)
                || self.reserved_inputs.contains(&prevout)
            {
                false
            } else if selection.chosen.contains(&prevout.hash) {
                selection
                    .outputs
                    .get(&prevout.hash)
                    .is_some_and(|count| prevout.index < *count)
            } else {
                view.is_available(&prevout)?
            };
            if !available {
                selection.skipped.insert(entry.txid);
                return Ok(Pick::Skipped);
            }
        }
        if selection.bytes + entry.size() > self.max_tx_bytes {
            selection.skipped.insert(entry.txid);
            return Ok(Pick::Skipped);
        }

        selection.bytes += entry.size();
        selection.chosen.insert(entry.txid);
        selection
            .outputs
            .insert(entry.txid, entry.tx.vout.len() as u32);
        selection
            .spent
            .extend(entry.tx.vin.iter().map(|input| input.prevout));
        selection.order.push(entry.tx.clone());
        selection.fees.push(entry.fee);
        Ok(Pick::Selected)
    }
}

#[derive(Default)]
struct Selection {
    order: Vec<Transaction>,
    fees: Vec<Amount>,
    chosen: HashSet<Hash256>,
    skipped: HashSet<Hash256>,
    spent: HashSet<OutPoint>,
    outputs: HashMap<Hash256, u32>,
    bytes: usize,
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| u32::try_from(duration.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or(0)
}
