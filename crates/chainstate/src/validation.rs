//! Context-free block and transaction checks, and the verdict types the
//! chain state reports.

use std::collections::HashSet;

use rayon::prelude::*;
use stakd_consensus::constants::{MAX_BLOCK_SIZE, MAX_SCRIPT_SIZE, MAX_TX_SIZE, MIN_BLOCK_VERSION};
use stakd_consensus::money::money_range;
use stakd_consensus::Hash256;
use stakd_primitives::block::{compute_merkle_root, Block};
use stakd_primitives::transaction::Transaction;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectKind {
    /// The block or transaction is malformed on its own.
    Structural,
    /// Well-formed but violates a contextual rule.
    Consensus,
    /// Refers to data this node does not have (missing inputs or parent).
    Resource,
}

impl RejectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectKind::Structural => "structural",
            RejectKind::Consensus => "consensus",
            RejectKind::Resource => "resource",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rejection {
    pub kind: RejectKind,
    pub code: &'static str,
    pub detail: String,
}

impl Rejection {
    pub fn structural(code: &'static str, detail: impl Into<String>) -> Self {
        Self {
            kind: RejectKind::Structural,
            code,
            detail: detail.into(),
        }
    }

    pub fn consensus(code: &'static str, detail: impl Into<String>) -> Self {
        Self {
            kind: RejectKind::Consensus,
            code,
            detail: detail.into(),
        }
    }

    pub fn resource(code: &'static str, detail: impl Into<String>) -> Self {
        Self {
            kind: RejectKind::Resource,
            code,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{} ({})", self.code, self.kind.as_str())
        } else {
            write!(f, "{} ({}): {}", self.code, self.kind.as_str(), self.detail)
        }
    }
}

impl std::error::Error for Rejection {}

/// Outcome of connecting or processing a block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValidationState {
    Valid,
    Invalid(Rejection),
    /// The node could not finish the check (storage failure and the like).
    Error(String),
}

impl ValidationState {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationState::Valid)
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            ValidationState::Invalid(rejection) => Some(rejection),
            _ => None,
        }
    }

    pub fn reject_code(&self) -> Option<&'static str> {
        self.rejection().map(|rejection| rejection.code)
    }
}

pub fn check_transaction(tx: &Transaction) -> Result<(), Rejection> {
    if tx.vin.is_empty() {
        return Err(Rejection::structural("bad-txns-vin-empty", ""));
    }
    if tx.vout.is_empty() {
        return Err(Rejection::structural("bad-txns-vout-empty", ""));
    }
    if tx.serialized_size() > MAX_TX_SIZE as usize {
        return Err(Rejection::structural("bad-txns-oversize", ""));
    }
    for output in &tx.vout {
        if output.value < 0 {
            return Err(Rejection::structural("bad-txns-vout-negative", ""));
        }
        if !money_range(output.value) {
            return Err(Rejection::structural("bad-txns-vout-toolarge", ""));
        }
        if output.script_pubkey.len() > MAX_SCRIPT_SIZE {
            return Err(Rejection::structural("bad-txns-script-toolarge", ""));
        }
    }
    if tx.value_out().is_none() {
        return Err(Rejection::structural("bad-txns-txouttotal-toolarge", ""));
    }

    let mut seen = HashSet::with_capacity(tx.vin.len());
    for input in &tx.vin {
        if !seen.insert(input.prevout) {
            return Err(Rejection::structural("bad-txns-inputs-duplicate", ""));
        }
    }

    if tx.is_coinbase() {
        let len = tx.vin[0].script_sig.len();
        if !(2..=100).contains(&len) {
            return Err(Rejection::structural("bad-cb-length", ""));
        }
    } else if tx.vin.iter().any(|input| input.prevout.is_null()) {
        return Err(Rejection::structural("bad-txns-prevout-null", ""));
    }
    Ok(())
}

/// Structure rules that need no chain context. Returns the txids in block
/// order so callers do not hash twice.
///
/// The genesis block leads with a coinbase; every later block leads with
/// exactly one coinstake whose first input is the header's stake prevout.
pub fn check_block(block: &Block, is_genesis: bool) -> Result<Vec<Hash256>, Rejection> {
    let header = &block.header;
    if header.version < MIN_BLOCK_VERSION {
        return Err(Rejection::structural("bad-version", header.version.to_string()));
    }
    if block.transactions.is_empty() {
        return Err(Rejection::structural("bad-blk-length", "no transactions"));
    }
    if block.serialized_size() > MAX_BLOCK_SIZE as usize {
        return Err(Rejection::structural("bad-blk-length", "block too large"));
    }

    let first = &block.transactions[0];
    if is_genesis {
        if !first.is_coinbase() {
            return Err(Rejection::structural("bad-cb-missing", ""));
        }
    } else {
        if !first.is_coinstake() {
            return Err(Rejection::structural("bad-cs-missing", ""));
        }
        if first.vin[0].prevout != header.stake_prevout {
            return Err(Rejection::structural(
                "bad-cs-kernel-prevout",
                "header stake prevout differs from coinstake input",
            ));
        }
    }
    for tx in &block.transactions[1..] {
        if tx.is_coinbase() {
            return Err(Rejection::structural("bad-cb-multiple", ""));
        }
        if tx.is_coinstake() {
            return Err(Rejection::structural("bad-cs-multiple", ""));
        }
    }

    if let Some(rejection) = block
        .transactions
        .par_iter()
        .find_map_first(|tx| check_transaction(tx).err())
    {
        return Err(rejection);
    }

    let txids: Vec<Hash256> = block.transactions.par_iter().map(Transaction::txid).collect();
    if compute_merkle_root(&txids) != header.merkle_root {
        return Err(Rejection::structural("bad-txnmrklroot", ""));
    }
    let mut unique = HashSet::with_capacity(txids.len());
    if !txids.iter().all(|txid| unique.insert(*txid)) {
        return Err(Rejection::structural("bad-txns-duplicate", ""));
    }
    let mut spent = HashSet::new();
    for tx in &block.transactions {
        for input in &tx.vin {
            if !input.prevout.is_null() && !spent.insert(input.prevout) {
                return Err(Rejection::structural(
                    "bad-txns-inputs-duplicate",
                    "output spent twice in block",
                ));
            }
        }
    }
    Ok(txids)
}
