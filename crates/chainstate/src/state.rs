//! Chain state manager: block acceptance, connect/disconnect and best-chain
//! activation over the UTXO views and the block index.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use stakd_consensus::constants::{MAX_FUTURE_BLOCK_TIME, MAX_REORG_LENGTH};
use stakd_consensus::money::{money_range, Amount};
use stakd_consensus::{hash256_to_hex, proof_of_stake_reward, stake_age, ConsensusParams, Hash256};
use stakd_pos::difficulty::next_target_required;
use stakd_pos::{KernelValidator, KernelVerdict, StakeKernel, TargetScaling, ValueWeighted};
use stakd_primitives::block::Block;
use stakd_primitives::encoding::DecodeError;
use stakd_primitives::outpoint::OutPoint;
use stakd_script::{verify_hash_signature, verify_input};
use stakd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::coins::Coins;
use crate::index::{BlockIndex, ChainIndex, STATUS_HAVE_DATA, STATUS_HAVE_UNDO};
use crate::undo::{BlockUndo, SpentCoin};
use crate::validation::{check_block, RejectKind, Rejection, ValidationState};
use crate::view::{CoinsDb, CoinsError, CoinsView, CoinsViewCache};

pub const META_BEST_BLOCK: &[u8] = b"best_block";
pub const META_GENESIS: &[u8] = b"genesis_block";

#[derive(Debug)]
pub enum ChainStateError {
    Rejected(Rejection),
    Store(StoreError),
    Decode(DecodeError),
    Coins(CoinsError),
    MissingCoin(OutPoint),
    MissingHeader,
    ValueOutOfRange,
    CorruptIndex(&'static str),
    InvalidHeader(&'static str),
}

impl std::fmt::Display for ChainStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainStateError::Rejected(rejection) => write!(f, "{rejection}"),
            ChainStateError::Store(err) => write!(f, "{err}"),
            ChainStateError::Decode(err) => write!(f, "{err}"),
            ChainStateError::Coins(err) => write!(f, "{err}"),
            ChainStateError::MissingCoin(outpoint) => write!(f, "missing coin {outpoint}"),
            ChainStateError::MissingHeader => write!(f, "missing header"),
            ChainStateError::ValueOutOfRange => write!(f, "value out of range"),
            ChainStateError::CorruptIndex(message) => write!(f, "{message}"),
            ChainStateError::InvalidHeader(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ChainStateError {}

impl From<StoreError> for ChainStateError {
    fn from(err: StoreError) -> Self {
        ChainStateError::Store(err)
    }
}

impl From<DecodeError> for ChainStateError {
    fn from(err: DecodeError) -> Self {
        ChainStateError::Decode(err)
    }
}

impl From<CoinsError> for ChainStateError {
    fn from(err: CoinsError) -> Self {
        match err {
            CoinsError::Store(err) => ChainStateError::Store(err),
            CoinsError::Decode(err) => ChainStateError::Decode(err),
            CoinsError::MissingCoin(outpoint) => ChainStateError::MissingCoin(outpoint),
            other => ChainStateError::Coins(other),
        }
    }
}

impl From<Rejection> for ChainStateError {
    fn from(rejection: Rejection) -> Self {
        ChainStateError::Rejected(rejection)
    }
}

/// How the active chain moved away from an earlier tip.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TipChange {
    /// Blocks that left the active chain, old tip first.
    pub disconnected: Vec<Hash256>,
    /// Blocks that joined it, in connection order.
    pub connected: Vec<Hash256>,
}

impl TipChange {
    pub fn is_empty(&self) -> bool {
        self.disconnected.is_empty() && self.connected.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushMode {
    IfNeeded,
    Always,
}

/// Thresholds for [`FlushMode::IfNeeded`].
#[derive(Clone, Copy, Debug)]
pub struct FlushPolicy {
    pub max_dirty_entries: usize,
    pub max_interval: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            max_dirty_entries: 1_000,
            max_interval: Duration::from_secs(60),
        }
    }
}

pub struct ChainState<S> {
    store: Arc<S>,
    params: ConsensusParams,
    index: ChainIndex,
    scaling: Arc<dyn TargetScaling>,
    rejections: HashMap<Hash256, Rejection>,
    flush_policy: FlushPolicy,
    last_flush: Instant,
}

impl<S: KeyValueStore> ChainState<S> {
    /// Loads the flushed index and tip from `store`, or connects `genesis`
    /// into an empty store.
    pub fn open(
        store: Arc<S>,
        params: ConsensusParams,
        genesis: &Block,
    ) -> Result<Self, ChainStateError> {
        let genesis_hash = genesis.hash();
        if let Some(expected) = params.hash_genesis_block {
            if expected != genesis_hash {
                return Err(ChainStateError::InvalidHeader(
                    "genesis block does not match network parameters",
                ));
            }
        }

        let mut chain = Self {
            store,
            params,
            index: ChainIndex::new(),
            scaling: Arc::new(ValueWeighted),
            rejections: HashMap::new(),
            flush_policy: FlushPolicy::default(),
            last_flush: Instant::now(),
        };
        chain.load_index()?;
        match chain.store.get(Column::Meta, META_GENESIS)? {
            Some(stored) if stored.as_slice() != genesis_hash.as_slice() => {
                return Err(ChainStateError::CorruptIndex(
                    "store was created with a different genesis block",
                ));
            }
            Some(_) => chain.reload_tip()?,
            None => chain.connect_genesis(genesis)?,
        }

        if let Some(tip) = chain.index.tip() {
            stakd_log::log_info!(
                "chain state ready: height {} tip {}",
                tip.height,
                hash256_to_hex(&tip.hash)
            );
        }
        Ok(chain)
    }

    fn load_index(&mut self) -> Result<(), ChainStateError> {
        let mut entries = Vec::new();
        let mut decode_error = None;
        self.store
            .for_each_prefix(Column::HeaderIndex, &[], &mut |_, value| {
                match BlockIndex::decode(value) {
                    Ok(entry) => entries.push(entry),
                    Err(err) => decode_error = Some(err),
                }
                Ok(())
            })?;
        if let Some(err) = decode_error {
            return Err(err.into());
        }
        for entry in entries {
            self.index.load(entry);
        }
        Ok(())
    }

    /// Points the active chain at the durable coins best block.
    fn reload_tip(&mut self) -> Result<(), ChainStateError> {
        let best = self
            .coins_db()
            .best_block()?
            .ok_or(ChainStateError::CorruptIndex("coins best block missing"))?;
        if !self.index.contains(&best) {
            return Err(ChainStateError::CorruptIndex(
                "coins best block missing from header index",
            ));
        }
        self.index.set_tip(&best)
    }

    fn connect_genesis(&mut self, genesis: &Block) -> Result<(), ChainStateError> {
        if !self.index.is_empty() {
            return Err(ChainStateError::CorruptIndex(
                "header index present without a genesis marker",
            ));
        }
        check_block(genesis, true)?;
        let hash = self.index.insert(&genesis.header)?.hash;
        self.index.set_status(&hash, STATUS_HAVE_DATA | STATUS_HAVE_UNDO);

        let mut db = self.coins_db();
        let mut view = CoinsViewCache::new(&mut db);
        for tx in &genesis.transactions {
            view.add(tx.txid(), Coins::from_tx(tx, 0, genesis.header.time))?;
        }
        view.set_best_block(hash);
        view.flush()?;

        let entry = self
            .index
            .get(&hash)
            .cloned()
            .ok_or(ChainStateError::MissingHeader)?;
        let mut batch = WriteBatch::new();
        batch.put(Column::Block, hash, genesis.consensus_encode());
        batch.put(Column::BlockUndo, hash, BlockUndo::default().encode());
        batch.put(Column::HeaderIndex, hash, entry.encode());
        batch.put(Column::Meta, META_BEST_BLOCK, hash.to_vec());
        batch.put(Column::Meta, META_GENESIS, hash.to_vec());
        self.store.write_batch(&batch)?;

        self.update_tip(&hash)?;
        self.index.clear_dirty();
        Ok(())
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn set_coin_year_reward(&mut self, rate: Amount) {
        self.params.set_coin_year_reward(rate);
    }

    pub fn target_scaling(&self) -> Arc<dyn TargetScaling> {
        Arc::clone(&self.scaling)
    }

    pub fn set_target_scaling(&mut self, scaling: Arc<dyn TargetScaling>) {
        self.scaling = scaling;
    }

    pub fn set_flush_policy(&mut self, policy: FlushPolicy) {
        self.flush_policy = policy;
    }

    pub fn index(&self) -> &ChainIndex {
        &self.index
    }

    pub fn tip(&self) -> Option<&BlockIndex> {
        self.index.tip()
    }

    pub fn best_block(&self) -> Option<Hash256> {
        self.index.tip().map(|tip| tip.hash)
    }

    pub fn height(&self) -> i32 {
        self.index.height()
    }

    pub fn block_index(&self, hash: &Hash256) -> Option<&BlockIndex> {
        self.index.get(hash)
    }

    pub fn rejection(&self, hash: &Hash256) -> Option<&Rejection> {
        self.rejections.get(hash)
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn coins_db(&self) -> CoinsDb<S> {
        CoinsDb::new(Arc::clone(&self.store))
    }

    /// Fresh view over the durable coins. It sees every flush made before
    /// it was opened.
    pub fn coins_view(&self) -> CoinsViewCache<CoinsDb<S>> {
        CoinsViewCache::new(self.coins_db())
    }

    pub fn for_each_coins(
        &self,
        visitor: impl FnMut(Hash256, Coins),
    ) -> Result<(), ChainStateError> {
        self.coins_db().for_each(visitor)?;
        Ok(())
    }

    pub fn read_block(&self, hash: &Hash256) -> Result<Option<Block>, ChainStateError> {
        match self.store.get(Column::Block, hash)? {
            Some(bytes) => Ok(Some(Block::consensus_decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn read_undo(&self, hash: &Hash256) -> Result<Option<BlockUndo>, ChainStateError> {
        match self.store.get(Column::BlockUndo, hash)? {
            Some(bytes) => Ok(Some(BlockUndo::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn bits_after(&self, parent: &Hash256) -> Result<u32, ChainStateError> {
        let window = self.index.header_infos(parent, 2);
        if window.is_empty() {
            return Err(ChainStateError::MissingHeader);
        }
        next_target_required(&window, &self.params)
            .map_err(|_| ChainStateError::InvalidHeader("bad compact target in chain"))
    }

    /// Compact target a block at `height` on the active chain must carry.
    pub fn expected_bits(&self, height: i32) -> Result<u32, ChainStateError> {
        let parent = self
            .index
            .height_hash(height - 1)
            .ok_or(ChainStateError::MissingHeader)?;
        self.bits_after(&parent)
    }

    fn kernel_validator(&self) -> KernelValidator<'_, &dyn TargetScaling> {
        KernelValidator::with_scaling(&self.params, self.scaling.as_ref())
    }

    /// Kernel decision for a block at `target_height` extending the active
    /// chain.
    pub fn check_stake_kernel(
        &self,
        kernel: &StakeKernel,
        target_height: i32,
    ) -> Result<KernelVerdict, ChainStateError> {
        let bits = self.expected_bits(target_height)?;
        Ok(self.kernel_validator().evaluate(kernel, target_height, bits))
    }

    /// Stores `block` and indexes its header after the checks that need no
    /// UTXO state. Known blocks are returned as they are.
    pub fn accept_block(&mut self, block: &Block) -> Result<BlockIndex, ChainStateError> {
        let hash = block.hash();
        if let Some(existing) = self.index.get(&hash) {
            if existing.has_data() {
                return Ok(existing.clone());
            }
        }
        let parent = self
            .index
            .get(&block.header.prev_block)
            .cloned()
            .ok_or_else(|| {
                Rejection::resource(
                    "prev-blk-not-found",
                    hash256_to_hex(&block.header.prev_block),
                )
            })?;
        if parent.is_failed() {
            return Err(Rejection::consensus("bad-prevblk", "parent block is invalid").into());
        }
        check_block(block, false)?;

        let expected_bits = self.bits_after(&parent.hash)?;
        if block.header.bits != expected_bits {
            return Err(Rejection::consensus(
                "bad-diffbits",
                format!("got {:#010x}, expected {:#010x}", block.header.bits, expected_bits),
            )
            .into());
        }
        if block.header.time <= parent.time {
            return Err(Rejection::consensus("time-too-old", "block time not after parent").into());
        }
        if i64::from(block.header.time) > unix_now() + MAX_FUTURE_BLOCK_TIME {
            return Err(
                Rejection::consensus("time-too-new", "block time too far in the future").into(),
            );
        }

        self.index.insert(&block.header)?;
        self.index.set_status(&hash, STATUS_HAVE_DATA);
        let entry = self
            .index
            .get(&hash)
            .cloned()
            .ok_or(ChainStateError::MissingHeader)?;
        let mut batch = WriteBatch::new();
        batch.put(Column::Block, hash, block.consensus_encode());
        batch.put(Column::HeaderIndex, hash, entry.encode());
        self.store.write_batch(&batch)?;
        Ok(entry)
    }

    /// Applies `block` on top of `parent`, the active tip, through `view`.
    ///
    /// All work happens in a child cache that is flushed into `view` only
    /// when every rule passes, so a rejection leaves `view` untouched. On
    /// success the undo data is stored and the tip advances; `view` still
    /// has to be flushed for the coins to become durable.
    pub fn connect_block<V: CoinsView>(
        &mut self,
        block: &Block,
        parent: &BlockIndex,
        view: &mut V,
    ) -> ValidationState {
        let hash = block.hash();
        match self.connect_block_inner(block, parent, view) {
            Ok(()) => {
                stakd_log::log_debug!(
                    "connected block {} at height {}",
                    hash256_to_hex(&hash),
                    parent.height + 1
                );
                ValidationState::Valid
            }
            Err(ChainStateError::Rejected(rejection)) => {
                stakd_log::log_warn!(
                    "block {} rejected: {}",
                    hash256_to_hex(&hash),
                    rejection
                );
                ValidationState::Invalid(rejection)
            }
            Err(err) => {
                stakd_log::log_error!("connect of block {} failed: {}", hash256_to_hex(&hash), err);
                ValidationState::Error(err.to_string())
            }
        }
    }

    fn connect_block_inner<V: CoinsView>(
        &mut self,
        block: &Block,
        parent: &BlockIndex,
        view: &mut V,
    ) -> Result<(), ChainStateError> {
        let tip = self.index.tip().ok_or(ChainStateError::MissingHeader)?;
        if tip.hash != parent.hash {
            return Err(ChainStateError::InvalidHeader("parent is not the active tip"));
        }
        if block.header.prev_block != parent.hash {
            return Err(Rejection::structural("bad-prevblk", "block does not extend parent").into());
        }
        let index = self.accept_block(block)?;
        let hash = index.hash;
        let height = index.height;
        let header = &block.header;
        let time = header.time;

        let mut scratch = CoinsViewCache::new(&mut *view);
        let coinstake = &block.transactions[0];
        let stake_prevout = coinstake.vin[0].prevout;
        let stake_coin = scratch.coin(&stake_prevout)?.ok_or_else(|| {
            Rejection::resource("bad-cs-prevout-missingorspent", stake_prevout.to_string())
        })?;
        if height - (stake_coin.height as i32) < self.params.stake_min_depth {
            return Err(Rejection::consensus("bad-cs-depth", "stake input not deep enough").into());
        }

        let kernel = StakeKernel {
            prevout: stake_prevout,
            value: stake_coin.output.value,
            input_time: stake_coin.time,
            block_time: time,
        };
        let verdict = self.kernel_validator().evaluate(&kernel, height, header.bits);
        if !verdict.is_accepted() {
            return Err(Rejection::consensus(verdict.as_str(), "stake kernel check failed").into());
        }
        if self.params.check_block_signature
            && verify_hash_signature(&stake_coin.output.script_pubkey, &header.block_sig, &hash)
                .is_err()
        {
            return Err(Rejection::consensus("bad-block-signature", "").into());
        }

        let mut undo = BlockUndo::default();
        let mut fees: Amount = 0;
        let mut stake_in: Amount = 0;
        let mut stake_out: Amount = 0;
        for (tx_index, tx) in block.transactions.iter().enumerate() {
            let mut value_in: Amount = 0;
            for (input_index, input) in tx.vin.iter().enumerate() {
                let coin = scratch.coin(&input.prevout)?.ok_or_else(|| {
                    Rejection::resource("bad-txns-inputs-missingorspent", input.prevout.to_string())
                })?;
                if coin.is_coinstake
                    && height - (coin.height as i32) < self.params.coinstake_maturity
                {
                    return Err(Rejection::consensus(
                        "bad-txns-premature-spend-of-coinstake",
                        input.prevout.to_string(),
                    )
                    .into());
                }
                if let Err(err) = verify_input(tx, input_index, &coin.output.script_pubkey) {
                    return Err(Rejection::consensus(
                        "mandatory-script-verify-flag-failed",
                        err.to_string(),
                    )
                    .into());
                }
                value_in = value_in
                    .checked_add(coin.output.value)
                    .filter(|total| money_range(*total))
                    .ok_or_else(|| Rejection::consensus("bad-txns-inputvalues-outofrange", ""))?;
                let coin = scratch.spend(&input.prevout)?;
                undo.spent.push(SpentCoin {
                    outpoint: input.prevout,
                    coin,
                });
            }

            let value_out = tx
                .value_out()
                .ok_or_else(|| Rejection::structural("bad-txns-txouttotal-toolarge", ""))?;
            if tx_index == 0 {
                stake_in = value_in;
                stake_out = value_out;
            } else {
                if value_in < value_out {
                    return Err(Rejection::consensus(
                        "bad-txns-in-belowout",
                        format!("in {value_in} out {value_out}"),
                    )
                    .into());
                }
                fees = fees
                    .checked_add(value_in - value_out)
                    .filter(|total| money_range(*total))
                    .ok_or(ChainStateError::ValueOutOfRange)?;
            }

            match scratch.add(tx.txid(), Coins::from_tx(tx, height as u32, time)) {
                Ok(()) => {}
                Err(CoinsError::Overwrite(_)) => {
                    return Err(
                        Rejection::consensus("bad-txns-BIP30", "txid already unspent").into(),
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }

        let age = stake_age(kernel.input_time, time, &self.params);
        let reward = proof_of_stake_reward(kernel.value, age, height, &self.params);
        let expected = stake_in
            .checked_add(reward)
            .and_then(|total| total.checked_add(fees))
            .ok_or(ChainStateError::ValueOutOfRange)?;
        if stake_out != expected {
            return Err(Rejection::consensus(
                "bad-cs-amount",
                format!(
                    "coinstake pays {stake_out}, expected {expected} \
                     (reward {reward}, fees {fees})"
                ),
            )
            .into());
        }

        self.store
            .put(Column::BlockUndo, &hash, &undo.encode())?;
        scratch.set_best_block(hash);
        scratch.flush()?;
        self.index.set_status(&hash, STATUS_HAVE_UNDO);
        self.update_tip(&hash)
    }

    /// Reverses `block`, the active tip described by `index`, through `view`:
    /// created outputs are removed and every spent input restored from the
    /// block's undo data, last transaction first. The tip moves to the
    /// parent.
    pub fn disconnect_block<V: CoinsView>(
        &mut self,
        block: &Block,
        index: &BlockIndex,
        view: &mut V,
    ) -> Result<(), ChainStateError> {
        let hash = block.hash();
        if hash != index.hash {
            return Err(ChainStateError::InvalidHeader("block does not match its index entry"));
        }
        if self.best_block() != Some(hash) {
            return Err(ChainStateError::InvalidHeader("block is not the active tip"));
        }
        if index.height == 0 {
            return Err(ChainStateError::InvalidHeader("genesis cannot be disconnected"));
        }
        let mut spent = self
            .read_undo(&hash)?
            .ok_or(ChainStateError::CorruptIndex("missing block undo data"))?
            .spent;

        let mut scratch = CoinsViewCache::new(&mut *view);
        for tx in block.transactions.iter().rev() {
            let expected = Coins::from_tx(tx, index.height as u32, index.time);
            let created = scratch.remove(&tx.txid())?;
            let intact = match &created {
                Some(coins) => coins.outputs == expected.outputs,
                None => expected.is_pruned(),
            };
            if !intact {
                return Err(ChainStateError::CorruptIndex(
                    "block outputs changed while connected",
                ));
            }
            for input in tx.vin.iter().rev() {
                let record = spent.pop().ok_or(ChainStateError::CorruptIndex(
                    "undo data shorter than block inputs",
                ))?;
                if record.outpoint != input.prevout {
                    return Err(ChainStateError::CorruptIndex(
                        "undo data does not match block inputs",
                    ));
                }
                scratch.restore(&record.outpoint, record.coin)?;
            }
        }
        if !spent.is_empty() {
            return Err(ChainStateError::CorruptIndex("undo data longer than block inputs"));
        }

        scratch.set_best_block(index.prev_hash);
        scratch.flush()?;
        self.update_tip(&index.prev_hash)?;
        stakd_log::log_debug!(
            "disconnected block {} at height {}",
            hash256_to_hex(&hash),
            index.height
        );
        Ok(())
    }

    fn update_tip(&mut self, hash: &Hash256) -> Result<(), ChainStateError> {
        self.index.set_tip(hash)?;
        stakd_log::log_trace!("tip now {} at height {}", hash256_to_hex(hash), self.height());
        Ok(())
    }

    /// Moves the active chain to the best connectable candidate.
    ///
    /// Each step disconnects to the fork and connects the candidate branch
    /// through one cache that is flushed to the base view afterwards. A
    /// block that fails to connect is marked failed and the loop picks the
    /// next best candidate, so the chain always ends fully connected.
    pub fn activate_best_chain(&mut self) -> Result<(), ChainStateError> {
        loop {
            let Some(candidate) = self.index.best_candidate().cloned() else {
                return Ok(());
            };
            let tip = self.index.tip().cloned().ok_or(ChainStateError::MissingHeader)?;
            if candidate.hash == tip.hash || candidate.chainwork <= tip.chainwork {
                return Ok(());
            }
            let fork = self
                .index
                .find_fork(&candidate.hash)
                .cloned()
                .ok_or(ChainStateError::CorruptIndex("candidate does not reach the active chain"))?;
            if tip.height - fork.height > MAX_REORG_LENGTH {
                let rejection = Rejection::consensus(
                    "bad-fork-too-deep",
                    format!("reorg of {} blocks", tip.height - fork.height),
                );
                stakd_log::log_warn!(
                    "refusing branch {}: {}",
                    hash256_to_hex(&candidate.hash),
                    rejection
                );
                self.fail_branch(&fork, &candidate.hash, rejection);
                continue;
            }
            if fork.hash != tip.hash {
                stakd_log::log_info!(
                    "reorganizing from {} (height {}) to {} (height {}), fork at {}",
                    hash256_to_hex(&tip.hash),
                    tip.height,
                    hash256_to_hex(&candidate.hash),
                    candidate.height,
                    fork.height
                );
            }

            let mut db = self.coins_db();
            let mut view = CoinsViewCache::new(&mut db);
            let step = self.step_to(&fork, &candidate, &mut view);
            let flushed = view.flush();
            drop(view);
            if step.is_err() || flushed.is_err() {
                self.reload_tip()?;
            }
            flushed?;
            step?;
            self.flush_state(FlushMode::IfNeeded)?;
        }
    }

    fn step_to<V: CoinsView>(
        &mut self,
        fork: &BlockIndex,
        candidate: &BlockIndex,
        view: &mut V,
    ) -> Result<(), ChainStateError> {
        while let Some(tip) = self.index.tip().cloned() {
            if tip.hash == fork.hash {
                break;
            }
            let block = self
                .read_block(&tip.hash)?
                .ok_or(ChainStateError::CorruptIndex("active block data missing"))?;
            self.disconnect_block(&block, &tip, view)?;
        }

        for hash in self.index.branch_from(fork, &candidate.hash) {
            let parent = self.index.tip().cloned().ok_or(ChainStateError::MissingHeader)?;
            let block = self
                .read_block(&hash)?
                .ok_or(ChainStateError::CorruptIndex("candidate block data missing"))?;
            match self.connect_block(&block, &parent, view) {
                ValidationState::Valid => {}
                ValidationState::Invalid(rejection) => {
                    self.rejections.insert(hash, rejection);
                    self.index.mark_failed(&hash);
                    return Ok(());
                }
                ValidationState::Error(message) => {
                    stakd_log::log_error!("aborting chain activation: {}", message);
                    return Err(ChainStateError::CorruptIndex("block connect failed"));
                }
            }
        }
        Ok(())
    }

    fn fail_branch(&mut self, fork: &BlockIndex, hash: &Hash256, rejection: Rejection) {
        if let Some(first) = self.index.branch_from(fork, hash).first().copied() {
            self.rejections.insert(first, rejection);
            self.index.mark_failed(&first);
        }
    }

    /// Disconnected and connected blocks between `old_tip` and the current
    /// tip, walking both back to their fork on the active chain.
    pub fn tip_change_since(&self, old_tip: &Hash256) -> Result<TipChange, ChainStateError> {
        let tip = self.index.tip().ok_or(ChainStateError::MissingHeader)?;
        let fork = self
            .index
            .find_fork(old_tip)
            .ok_or(ChainStateError::CorruptIndex("old tip does not reach the active chain"))?;
        let mut disconnected = Vec::new();
        let mut cursor = self.index.get(old_tip);
        while let Some(entry) = cursor {
            if entry.hash == fork.hash {
                break;
            }
            disconnected.push(entry.hash);
            cursor = self.index.get(&entry.prev_hash);
        }
        Ok(TipChange {
            disconnected,
            connected: self.index.branch_from(fork, &tip.hash),
        })
    }

    /// Accepts `block` and activates the best chain. The returned state is
    /// the verdict on `block` itself.
    pub fn process_block(&mut self, block: &Block) -> ValidationState {
        let hash = block.hash();
        if let Some(rejection) = self.rejections.get(&hash) {
            return ValidationState::Invalid(rejection.clone());
        }
        match self.accept_block(block) {
            Ok(_) => {}
            Err(ChainStateError::Rejected(rejection)) => {
                stakd_log::log_info!("block {} not accepted: {}", hash256_to_hex(&hash), rejection);
                if rejection.kind != RejectKind::Resource {
                    self.rejections.insert(hash, rejection.clone());
                }
                return ValidationState::Invalid(rejection);
            }
            Err(err) => return ValidationState::Error(err.to_string()),
        }
        if let Err(err) = self.activate_best_chain() {
            return ValidationState::Error(err.to_string());
        }
        if let Some(rejection) = self.rejections.get(&hash) {
            return ValidationState::Invalid(rejection.clone());
        }
        match self.index.get(&hash) {
            Some(entry) if entry.is_failed() => ValidationState::Invalid(Rejection::consensus(
                "bad-prevblk",
                "block descends from an invalid block",
            )),
            _ => ValidationState::Valid,
        }
    }

    /// Persists dirty index entries and the best block. Returns whether a
    /// write happened.
    pub fn flush_state(&mut self, mode: FlushMode) -> Result<bool, ChainStateError> {
        let due = match mode {
            FlushMode::Always => true,
            FlushMode::IfNeeded => {
                self.index.dirty_len() >= self.flush_policy.max_dirty_entries
                    || self.last_flush.elapsed() >= self.flush_policy.max_interval
            }
        };
        if !due {
            return Ok(false);
        }
        let mut batch = WriteBatch::new();
        for entry in self.index.dirty_entries() {
            batch.put(Column::HeaderIndex, entry.hash, entry.encode());
        }
        if let Some(best) = self.best_block() {
            batch.put(Column::Meta, META_BEST_BLOCK, best.to_vec());
        }
        self.store.write_batch(&batch)?;
        self.index.clear_dirty();
        self.last_flush = Instant::now();
        Ok(true)
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}
