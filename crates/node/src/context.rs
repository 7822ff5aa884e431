//! Shared node state and the lock discipline around it.
//!
//! Locks are always taken in the order chain, mempool, wallet. The
//! `with_*` helpers are the only way to reach the guarded state, so callers
//! cannot nest them in another order.

use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use stakd_chainstate::{ChainState, ChainStateError, FlushMode, TipChange, ValidationState};
use stakd_consensus::money::Amount;
use stakd_consensus::{hash256_to_hex, ChainParams, Hash256};
use stakd_primitives::block::Block;
use stakd_primitives::transaction::Transaction;
use stakd_storage::memory::MemoryStore;
use stakd_storage::KeyValueStore;

use crate::mempool::{build_mempool_entry, Mempool, MempoolError};
use crate::miner::MinerError;
use crate::wallet::{Wallet, WalletError};

#[derive(Debug)]
pub enum NodeError {
    LockPoisoned(&'static str),
    Chain(ChainStateError),
    Mempool(MempoolError),
    Wallet(WalletError),
    Miner(MinerError),
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeError::LockPoisoned(name) => write!(f, "{name} lock poisoned"),
            NodeError::Chain(err) => write!(f, "{err}"),
            NodeError::Mempool(err) => write!(f, "{err}"),
            NodeError::Wallet(err) => write!(f, "{err}"),
            NodeError::Miner(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for NodeError {}

impl From<ChainStateError> for NodeError {
    fn from(err: ChainStateError) -> Self {
        NodeError::Chain(err)
    }
}

impl From<MempoolError> for NodeError {
    fn from(err: MempoolError) -> Self {
        NodeError::Mempool(err)
    }
}

impl From<WalletError> for NodeError {
    fn from(err: WalletError) -> Self {
        NodeError::Wallet(err)
    }
}

impl From<MinerError> for NodeError {
    fn from(err: MinerError) -> Self {
        NodeError::Miner(err)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ChainInfo {
    pub network: String,
    pub height: i32,
    pub best_block: Option<String>,
    pub chainwork: String,
    pub bits: String,
    pub tip_time: u32,
    pub mempool_size: usize,
    pub mempool_bytes: usize,
}

pub struct NodeContext<S = MemoryStore> {
    params: ChainParams,
    chain: Mutex<ChainState<S>>,
    mempool: Mutex<Mempool>,
    wallet: Mutex<Wallet>,
}

fn lock<'a, T>(mutex: &'a Mutex<T>, name: &'static str) -> Result<MutexGuard<'a, T>, NodeError> {
    mutex.lock().map_err(|_| NodeError::LockPoisoned(name))
}

impl<S: KeyValueStore> NodeContext<S> {
    pub fn new(
        params: ChainParams,
        chain: ChainState<S>,
        mempool: Mempool,
        wallet: Wallet,
    ) -> Self {
        Self {
            params,
            chain: Mutex::new(chain),
            mempool: Mutex::new(mempool),
            wallet: Mutex::new(wallet),
        }
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn with_chain<R>(
        &self,
        f: impl FnOnce(&mut ChainState<S>) -> R,
    ) -> Result<R, NodeError> {
        let mut chain = lock(&self.chain, "chain")?;
        Ok(f(&mut chain))
    }

    pub fn with_chain_and_mempool<R>(
        &self,
        f: impl FnOnce(&mut ChainState<S>, &mut Mempool) -> R,
    ) -> Result<R, NodeError> {
        let mut chain = lock(&self.chain, "chain")?;
        let mut mempool = lock(&self.mempool, "mempool")?;
        Ok(f(&mut chain, &mut mempool))
    }

    pub fn with_chain_and_wallet<R>(
        &self,
        f: impl FnOnce(&mut ChainState<S>, &mut Wallet) -> R,
    ) -> Result<R, NodeError> {
        let mut chain = lock(&self.chain, "chain")?;
        let mut wallet = lock(&self.wallet, "wallet")?;
        Ok(f(&mut chain, &mut wallet))
    }

    pub fn with_chain_mempool_wallet<R>(
        &self,
        f: impl FnOnce(&mut ChainState<S>, &mut Mempool, &mut Wallet) -> R,
    ) -> Result<R, NodeError> {
        let mut chain = lock(&self.chain, "chain")?;
        let mut mempool = lock(&self.mempool, "mempool")?;
        let mut wallet = lock(&self.wallet, "wallet")?;
        Ok(f(&mut chain, &mut mempool, &mut wallet))
    }

    pub fn with_mempool<R>(&self, f: impl FnOnce(&mut Mempool) -> R) -> Result<R, NodeError> {
        let mut mempool = lock(&self.mempool, "mempool")?;
        Ok(f(&mut mempool))
    }

    pub fn with_wallet<R>(&self, f: impl FnOnce(&mut Wallet) -> R) -> Result<R, NodeError> {
        let mut wallet = lock(&self.wallet, "wallet")?;
        Ok(f(&mut wallet))
    }

    /// Validates and activates `block`, then makes the result durable before
    /// returning. The mempool follows every block the active chain gained or
    /// lost, including other blocks of a reorg.
    pub fn submit_block(&self, block: &Block) -> Result<ValidationState, NodeError> {
        self.with_chain_and_mempool(|chain, mempool| -> Result<ValidationState, NodeError> {
            let old_tip = chain.best_block();
            let state = chain.process_block(block);
            if let ValidationState::Error(message) = &state {
                stakd_log::log_error!("block submission failed: {message}");
            } else {
                chain.flush_state(FlushMode::Always)?;
            }
            if let Some(old_tip) = old_tip {
                let change = chain.tip_change_since(&old_tip)?;
                if !change.is_empty() {
                    reconcile_mempool(chain, mempool, &change)?;
                }
            }
            Ok(state)
        })?
    }

    /// Admits `tx` to the mempool after checking it against the active chain.
    pub fn submit_transaction(&self, tx: Transaction) -> Result<Hash256, NodeError> {
        self.with_chain_and_mempool(|chain, mempool| -> Result<Hash256, NodeError> {
            let mut view = chain.coins_view();
            let entry =
                build_mempool_entry(&mut view, mempool, chain.params(), tx, chain.height())?;
            let txid = entry.txid;
            let outcome = mempool.insert(entry)?;
            if outcome.evicted > 0 {
                stakd_log::log_info!(
                    "mempool evicted {} transactions ({} bytes)",
                    outcome.evicted,
                    outcome.evicted_bytes
                );
            }
            Ok(txid)
        })?
    }

    pub fn chain_info(&self) -> Result<ChainInfo, NodeError> {
        self.with_chain_and_mempool(|chain, mempool| {
            let tip = chain.tip();
            ChainInfo {
                network: self.params.network.as_str().to_string(),
                height: chain.height(),
                best_block: tip.map(|tip| hash256_to_hex(&tip.hash)),
                chainwork: tip
                    .map(|tip| format!("{:x}", tip.chainwork))
                    .unwrap_or_default(),
                bits: tip.map(|tip| format!("{:08x}", tip.bits)).unwrap_or_default(),
                tip_time: tip.map(|tip| tip.time).unwrap_or(0),
                mempool_size: mempool.size(),
                mempool_bytes: mempool.bytes(),
            }
        })
    }

    pub fn balance(&self) -> Result<Amount, NodeError> {
        self.with_chain_and_wallet(|chain, wallet| wallet.balance(chain))?
            .map_err(NodeError::from)
    }

    pub fn staked(&self) -> Result<Amount, NodeError> {
        self.with_chain_and_wallet(|chain, wallet| wallet.staked(chain))?
            .map_err(NodeError::from)
    }

    pub fn best_block(&self) -> Result<Option<Hash256>, NodeError> {
        self.with_chain(|chain| chain.best_block())
    }
}

/// Confirmed and conflicting entries leave, entries whose inputs vanished
/// leave, and transactions of disconnected blocks are offered back, oldest
/// block first.
fn reconcile_mempool<S: KeyValueStore>(
    chain: &ChainState<S>,
    mempool: &mut Mempool,
    change: &TipChange,
) -> Result<(), NodeError> {
    let mut removed = 0;
    for hash in &change.connected {
        if let Some(block) = chain.read_block(hash)? {
            removed += mempool.remove_for_block(&block);
        }
    }
    let mut view = chain.coins_view();
    removed += mempool
        .remove_unspendable(&mut view)
        .map_err(ChainStateError::from)?;

    let mut restored = 0;
    for hash in change.disconnected.iter().rev() {
        let Some(block) = chain.read_block(hash)? else {
            continue;
        };
        for tx in block.transactions {
            if tx.is_coinbase() || tx.is_coinstake() {
                continue;
            }
            let txid = tx.txid();
            let entry =
                match build_mempool_entry(&mut view, mempool, chain.params(), tx, chain.height()) {
                    Ok(entry) => entry,
                    Err(err) => {
                        stakd_log::log_debug!(
                            "not restoring {} to the mempool: {err}",
                            hash256_to_hex(&txid)
                        );
                        continue;
                    }
                };
            if mempool.insert(entry).is_ok() {
                restored += 1;
            }
        }
    }
    if removed > 0 || restored > 0 {
        stakd_log::log_debug!(
            "tip moved by -{} +{} blocks: {removed} mempool entries removed, {restored} restored",
            change.disconnected.len(),
            change.connected.len()
        );
    }
    Ok(())
}
