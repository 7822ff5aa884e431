use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use stakd_chainstate::validation::check_transaction;
use stakd_chainstate::{CoinsError, CoinsView, CoinsViewCache};
use stakd_consensus::money::{money_range, Amount};
use stakd_consensus::{hash256_to_hex, ConsensusParams, Hash256};
use stakd_primitives::block::Block;
use stakd_primitives::outpoint::OutPoint;
use stakd_primitives::transaction::Transaction;
use stakd_script::verify_input;

pub const DEFAULT_MAX_MEMPOOL_BYTES: usize = 300 * 1024 * 1024;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MempoolErrorKind {
    AlreadyInMempool,
    ConflictingInput,
    MissingInput,
    MempoolFull,
    InvalidTransaction,
    InvalidScript,
    Internal,
}

#[derive(Clone, Debug)]
pub struct MempoolError {
    pub kind: MempoolErrorKind,
    pub message: String,
    pub missing_inputs: Vec<OutPoint>,
}

impl MempoolError {
    pub fn new(kind: MempoolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            missing_inputs: Vec::new(),
        }
    }

    pub fn missing_inputs(missing_inputs: Vec<OutPoint>) -> Self {
        Self {
            kind: MempoolErrorKind::MissingInput,
            message: "missing inputs".to_string(),
            missing_inputs,
        }
    }
}

impl std::fmt::Display for MempoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for MempoolError {}

pub struct MempoolEntry {
    pub txid: Hash256,
    pub tx: Transaction,
    pub raw: Vec<u8>,
    pub time: u64,
    /// Chain height when the entry was accepted.
    pub height: i32,
    pub fee: Amount,
    pub value_in: Amount,
    pub spent_outpoints: Vec<OutPoint>,
    /// In-pool transactions this entry spends from.
    pub parents: Vec<Hash256>,
}

impl MempoolEntry {
    pub fn size(&self) -> usize {
        self.raw.len()
    }
}

#[derive(Default)]
pub struct Mempool {
    entries: HashMap<Hash256, MempoolEntry>,
    spent: HashMap<OutPoint, Hash256>,
    children: HashMap<Hash256, Vec<Hash256>>,
    total_bytes: usize,
    max_bytes: usize,
    revision: u64,
}

impl Mempool {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            entries: HashMap::new(),
            spent: HashMap::new(),
            children: HashMap::new(),
            total_bytes: 0,
            max_bytes,
            revision: 0,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.spent.contains_key(outpoint)
    }

    pub fn spender(&self, outpoint: &OutPoint) -> Option<Hash256> {
        self.spent.get(outpoint).copied()
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn get(&self, txid: &Hash256) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    pub fn entries(&self) -> impl Iterator<Item = &MempoolEntry> {
        self.entries.values()
    }

    pub fn insert(&mut self, entry: MempoolEntry) -> Result<MempoolInsertOutcome, MempoolError> {
        let inserted_txid = entry.txid;
        if self.max_bytes > 0 && entry.size() > self.max_bytes {
            return Err(MempoolError::new(
                MempoolErrorKind::MempoolFull,
                "transaction too large for mempool",
            ));
        }
        if self.entries.contains_key(&entry.txid) {
            return Err(MempoolError::new(
                MempoolErrorKind::AlreadyInMempool,
                "transaction already in mempool",
            ));
        }
        for outpoint in &entry.spent_outpoints {
            if let Some(conflict) = self.spent.get(outpoint) {
                return Err(MempoolError::new(
                    MempoolErrorKind::ConflictingInput,
                    format!("input {outpoint} already spent by {}", hash256_to_hex(conflict)),
                ));
            }
        }
        for outpoint in &entry.spent_outpoints {
            self.spent.insert(*outpoint, entry.txid);
        }
        for parent in &entry.parents {
            let children = self.children.entry(*parent).or_default();
            if !children.contains(&inserted_txid) {
                children.push(inserted_txid);
            }
        }
        self.total_bytes = self.total_bytes.saturating_add(entry.raw.len());
        self.entries.insert(entry.txid, entry);
        self.revision = self.revision.saturating_add(1);

        let mut outcome = MempoolInsertOutcome::default();
        if self.max_bytes > 0 && self.total_bytes > self.max_bytes {
            outcome = self.evict_to_fit();
        }
        if !self.entries.contains_key(&inserted_txid) {
            return Err(MempoolError::new(MempoolErrorKind::MempoolFull, "mempool full"));
        }
        Ok(outcome)
    }

    /// Drops one entry. Its in-pool children stay and lose the parent link.
    pub fn remove(&mut self, txid: &Hash256) -> Option<MempoolEntry> {
        let entry = self.entries.remove(txid)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.raw.len());
        for outpoint in &entry.spent_outpoints {
            if self.spent.get(outpoint) == Some(txid) {
                self.spent.remove(outpoint);
            }
        }
        for parent in &entry.parents {
            let should_remove_parent = match self.children.get_mut(parent) {
                Some(children) => {
                    children.retain(|child| child != txid);
                    children.is_empty()
                }
                None => false,
            };
            if should_remove_parent {
                self.children.remove(parent);
            }
        }
        if let Some(children) = self.children.remove(txid) {
            for child in children {
                if let Some(child_entry) = self.entries.get_mut(&child) {
                    child_entry.parents.retain(|parent| parent != txid);
                }
            }
        }
        self.revision = self.revision.saturating_add(1);
        Some(entry)
    }

    pub fn remove_with_descendants(&mut self, txid: &Hash256) -> Vec<MempoolEntry> {
        let mut visited: HashSet<Hash256> = HashSet::new();
        let mut order: Vec<Hash256> = Vec::new();

        fn visit(
            mempool: &Mempool,
            txid: Hash256,
            visited: &mut HashSet<Hash256>,
            order: &mut Vec<Hash256>,
        ) {
            if !visited.insert(txid) {
                return;
            }
            if let Some(children) = mempool.children.get(&txid) {
                for child in children {
                    visit(mempool, *child, visited, order);
                }
            }
            order.push(txid);
        }

        visit(self, *txid, &mut visited, &mut order);

        let mut removed = Vec::new();
        for txid in order {
            if let Some(entry) = self.remove(&txid) {
                removed.push(entry);
            }
        }
        removed
    }

    /// Removes the transactions `block` confirmed, then every entry that
    /// spends an input the block consumed, with its descendants. Returns
    /// the number of entries removed.
    pub fn remove_for_block(&mut self, block: &Block) -> usize {
        let mut removed = 0;
        for tx in &block.transactions {
            if self.remove(&tx.txid()).is_some() {
                removed += 1;
            }
        }
        for tx in &block.transactions {
            for input in &tx.vin {
                if let Some(conflict) = self.spender(&input.prevout) {
                    removed += self.remove_with_descendants(&conflict).len();
                }
            }
        }
        removed
    }

    /// Removes every entry, with its descendants, that spends an output
    /// neither unspent in `view` nor created by an in-pool parent.
    pub fn remove_unspendable<P: CoinsView>(
        &mut self,
        view: &mut CoinsViewCache<P>,
    ) -> Result<usize, CoinsError> {
        let mut stale = Vec::new();
        for entry in self.entries.values() {
            for outpoint in &entry.spent_outpoints {
                let from_parent = entry.parents.contains(&outpoint.hash)
                    && self.entries.contains_key(&outpoint.hash);
                if !from_parent && !view.is_available(outpoint)? {
                    stale.push(entry.txid);
                    break;
                }
            }
        }
        let mut removed = 0;
        for txid in stale {
            removed += self.remove_with_descendants(&txid).len();
        }
        Ok(removed)
    }

    fn evict_to_fit(&mut self) -> MempoolInsertOutcome {
        let max_bytes = self.max_bytes;
        let mut candidates: Vec<EvictCandidate> = self
            .entries
            .values()
            .map(|entry| EvictCandidate {
                txid: entry.txid,
                fee: entry.fee,
                size: entry.size().max(1),
                time: entry.time,
            })
            .collect();
        candidates.sort_by(|a, b| {
            compare_fee_rate(a.fee, a.size, b.fee, b.size)
                .then_with(|| a.time.cmp(&b.time))
                .then_with(|| a.txid.cmp(&b.txid))
        });

        let mut outcome = MempoolInsertOutcome::default();
        for candidate in candidates {
            if self.total_bytes <= max_bytes {
                break;
            }
            let removed = self.remove_with_descendants(&candidate.txid);
            if removed.is_empty() {
                continue;
            }
            outcome.evicted = outcome.evicted.saturating_add(removed.len() as u64);
            outcome.evicted_bytes = outcome.evicted_bytes.saturating_add(
                removed
                    .iter()
                    .map(|entry| entry.raw.len() as u64)
                    .sum::<u64>(),
            );
            outcome
                .evicted_txids
                .extend(removed.iter().map(|entry| entry.txid));
        }
        outcome
    }
}

#[derive(Clone, Debug, Default)]
pub struct MempoolInsertOutcome {
    pub evicted: u64,
    pub evicted_bytes: u64,
    pub evicted_txids: Vec<Hash256>,
}

#[derive(Clone, Debug)]
struct EvictCandidate {
    txid: Hash256,
    fee: Amount,
    size: usize,
    time: u64,
}

/// Orders `fee_a / size_a` against `fee_b / size_b` without division.
pub fn compare_fee_rate(
    fee_a: Amount,
    size_a: usize,
    fee_b: Amount,
    size_b: usize,
) -> std::cmp::Ordering {
    let left = i128::from(fee_a).saturating_mul(size_b as i128);
    let right = i128::from(fee_b).saturating_mul(size_a as i128);
    left.cmp(&right)
}

/// Validates `tx` against the chain `view` and the current pool contents and
/// builds the entry to insert. `height` is the active chain height.
pub fn build_mempool_entry<P: CoinsView>(
    view: &mut CoinsViewCache<P>,
    mempool: &Mempool,
    params: &ConsensusParams,
    tx: Transaction,
    height: i32,
) -> Result<MempoolEntry, MempoolError> {
    check_transaction(&tx).map_err(|rejection| {
        MempoolError::new(MempoolErrorKind::InvalidTransaction, rejection.to_string())
    })?;
    if tx.is_coinbase() || tx.is_coinstake() {
        return Err(MempoolError::new(
            MempoolErrorKind::InvalidTransaction,
            "coinbase and coinstake transactions are only valid in blocks",
        ));
    }
    let txid = tx.txid();
    if mempool.contains(&txid) {
        return Err(MempoolError::new(
            MempoolErrorKind::AlreadyInMempool,
            "transaction already in mempool",
        ));
    }
    if view.have_coins(&txid).map_err(internal)? {
        return Err(MempoolError::new(
            MempoolErrorKind::AlreadyInMempool,
            "transaction already confirmed",
        ));
    }

    let next_height = height + 1;
    let mut missing = Vec::new();
    let mut parents = Vec::new();
    let mut value_in: Amount = 0;
    for (input_index, input) in tx.vin.iter().enumerate() {
        let prevout = input.prevout;
        if let Some(conflict) = mempool.spender(&prevout) {
            return Err(MempoolError::new(
                MempoolErrorKind::ConflictingInput,
                format!("input {prevout} already spent by {}", hash256_to_hex(&conflict)),
            ));
        }
        let script_pubkey;
        let value;
        if let Some(parent) = mempool.get(&prevout.hash) {
            let Some(output) = parent.tx.vout.get(prevout.index as usize) else {
                missing.push(prevout);
                continue;
            };
            script_pubkey = output.script_pubkey.clone();
            value = output.value;
            if !parents.contains(&prevout.hash) {
                parents.push(prevout.hash);
            }
        } else {
            let Some(coin) = view.coin(&prevout).map_err(internal)? else {
                missing.push(prevout);
                continue;
            };
            if coin.is_coinstake && next_height - (coin.height as i32) < params.coinstake_maturity {
                return Err(MempoolError::new(
                    MempoolErrorKind::InvalidTransaction,
                    format!("premature spend of coinstake output {prevout}"),
                ));
            }
            script_pubkey = coin.output.script_pubkey;
            value = coin.output.value;
        }
        verify_input(&tx, input_index, &script_pubkey).map_err(|err| {
            MempoolError::new(
                MempoolErrorKind::InvalidScript,
                format!("input {input_index}: {err}"),
            )
        })?;
        value_in = value_in
            .checked_add(value)
            .filter(|total| money_range(*total))
            .ok_or_else(|| {
                MempoolError::new(MempoolErrorKind::InvalidTransaction, "input values out of range")
            })?;
    }
    if !missing.is_empty() {
        return Err(MempoolError::missing_inputs(missing));
    }

    let value_out = tx.value_out().ok_or_else(|| {
        MempoolError::new(MempoolErrorKind::InvalidTransaction, "output values out of range")
    })?;
    if value_in < value_out {
        return Err(MempoolError::new(
            MempoolErrorKind::InvalidTransaction,
            format!("inputs {value_in} below outputs {value_out}"),
        ));
    }

    let raw = tx.consensus_encode();
    let spent_outpoints = tx.vin.iter().map(|input| input.prevout).collect();
    Ok(MempoolEntry {
        txid,
        tx,
        raw,
        time: now_secs(),
        height,
        fee: value_in - value_out,
        value_in,
        spent_outpoints,
        parents,
    })
}

fn internal(err: impl std::fmt::Display) -> MempoolError {
    MempoolError::new(MempoolErrorKind::Internal, err.to_string())
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stakd_primitives::transaction::{TxIn, TxOut};

    fn entry(
        txid: Hash256,
        spends: Vec<OutPoint>,
        parents: Vec<Hash256>,
        fee: Amount,
    ) -> MempoolEntry {
        let tx = Transaction::new(
            spends.iter().map(|prevout| TxIn::new(*prevout)).collect(),
            vec![TxOut::new(25, vec![0x51])],
        );
        MempoolEntry {
            txid,
            tx,
            raw: vec![0u8; 10],
            time: 0,
            height: 0,
            fee,
            value_in: 0,
            spent_outpoints: spends,
            parents,
        }
    }

    #[test]
    fn remove_mined_parent_detaches_children() {
        let parent_txid: Hash256 = [1u8; 32];
        let child_txid: Hash256 = [2u8; 32];
        let parent_outpoint = OutPoint::new(parent_txid, 0);

        let mut mempool = Mempool::new(0);
        mempool
            .insert(entry(parent_txid, vec![OutPoint::new([9u8; 32], 0)], Vec::new(), 0))
            .expect("insert parent");
        mempool
            .insert(entry(child_txid, vec![parent_outpoint], vec![parent_txid], 0))
            .expect("insert child");
        assert!(mempool
            .children
            .get(&parent_txid)
            .is_some_and(|children| children.contains(&child_txid)));

        let removed = mempool.remove(&parent_txid).expect("remove parent");
        assert_eq!(removed.txid, parent_txid);
        let child = mempool.get(&child_txid).expect("child remains");
        assert!(child.parents.is_empty());
        assert!(!mempool.children.contains_key(&parent_txid));
    }

    #[test]
    fn remove_with_descendants_removes_entire_subtree() {
        let root: Hash256 = [1u8; 32];
        let child: Hash256 = [2u8; 32];
        let grandchild: Hash256 = [3u8; 32];
        let unrelated: Hash256 = [4u8; 32];

        let mut mempool = Mempool::new(0);
        mempool
            .insert(entry(root, vec![OutPoint::new([8u8; 32], 0)], Vec::new(), 0))
            .expect("root");
        mempool
            .insert(entry(child, vec![OutPoint::new(root, 0)], vec![root], 0))
            .expect("child");
        mempool
            .insert(entry(grandchild, vec![OutPoint::new(child, 0)], vec![child], 0))
            .expect("grandchild");
        mempool
            .insert(entry(unrelated, vec![OutPoint::new([7u8; 32], 0)], Vec::new(), 0))
            .expect("unrelated");

        let removed = mempool.remove_with_descendants(&root);
        let removed: HashSet<Hash256> = removed.iter().map(|entry| entry.txid).collect();
        assert_eq!(removed, HashSet::from([root, child, grandchild]));
        assert_eq!(mempool.size(), 1);
        assert!(mempool.contains(&unrelated));
        assert!(!mempool.is_spent(&OutPoint::new(root, 0)));
        assert_eq!(mempool.bytes(), 10);
    }

    #[test]
    fn conflicting_spend_is_refused() {
        let shared = OutPoint::new([5u8; 32], 1);
        let mut mempool = Mempool::new(0);
        mempool
            .insert(entry([1u8; 32], vec![shared], Vec::new(), 0))
            .expect("first spend");
        let err = mempool
            .insert(entry([2u8; 32], vec![shared], Vec::new(), 0))
            .expect_err("double spend");
        assert_eq!(err.kind, MempoolErrorKind::ConflictingInput);
        assert_eq!(mempool.spender(&shared), Some([1u8; 32]));
    }

    #[test]
    fn eviction_drops_the_lowest_fee_rate_first() {
        let mut mempool = Mempool::new(25);
        mempool
            .insert(entry([1u8; 32], vec![OutPoint::new([9u8; 32], 0)], Vec::new(), 100))
            .expect("rich");
        mempool
            .insert(entry([2u8; 32], vec![OutPoint::new([9u8; 32], 1)], Vec::new(), 1))
            .expect("cheap");
        let outcome = mempool
            .insert(entry([3u8; 32], vec![OutPoint::new([9u8; 32], 2)], Vec::new(), 50))
            .expect("middle");
        assert_eq!(outcome.evicted_txids, vec![[2u8; 32]]);
        assert!(mempool.contains(&[1u8; 32]));
        assert!(mempool.contains(&[3u8; 32]));
    }

    #[test]
    fn fee_rate_comparison_cross_multiplies() {
        use std::cmp::Ordering;
        assert_eq!(compare_fee_rate(100, 10, 1_000, 100), Ordering::Equal);
        assert_eq!(compare_fee_rate(101, 10, 1_000, 100), Ordering::Greater);
        assert_eq!(compare_fee_rate(1, 1_000, 1, 10), Ordering::Less);
    }

    #[test]
    fn remove_unspendable_keeps_in_pool_parents_and_live_coins() {
        use stakd_chainstate::{Coins, CoinsDb};
        use stakd_storage::memory::MemoryStore;
        use std::sync::Arc;

        let funding = Transaction::new(
            vec![TxIn::new(OutPoint::new([5u8; 32], 0))],
            vec![TxOut::new(50, vec![0x51])],
        );
        let live = OutPoint::new(funding.txid(), 0);
        let mut view = CoinsViewCache::new(CoinsDb::new(Arc::new(MemoryStore::new())));
        view.add(funding.txid(), Coins::from_tx(&funding, 1, 0))
            .expect("add coins");
        assert!(view.is_available(&live).expect("lookup"));

        let funded: Hash256 = [1u8; 32];
        let funded_child: Hash256 = [2u8; 32];
        let stale: Hash256 = [3u8; 32];
        let stale_child: Hash256 = [4u8; 32];
        let mut mempool = Mempool::new(0);
        mempool
            .insert(entry(funded, vec![live], Vec::new(), 0))
            .expect("funded");
        mempool
            .insert(entry(funded_child, vec![OutPoint::new(funded, 0)], vec![funded], 0))
            .expect("funded child");
        mempool
            .insert(entry(stale, vec![OutPoint::new([6u8; 32], 0)], Vec::new(), 0))
            .expect("stale");
        mempool
            .insert(entry(stale_child, vec![OutPoint::new(stale, 0)], vec![stale], 0))
            .expect("stale child");

        assert_eq!(mempool.remove_unspendable(&mut view).expect("scan"), 2);
        assert_eq!(mempool.size(), 2);
        assert!(mempool.contains(&funded));
        assert!(mempool.contains(&funded_child));
        assert!(!mempool.contains(&stale_child));
    }
}
