//! Layered UTXO views.
//!
//! A [`CoinsViewCache`] sits on a parent [`CoinsView`] and keeps every
//! change local until [`CoinsViewCache::flush`] hands the dirty records to
//! the parent in one batch. [`CoinsDb`] is the persistent base layer.

use std::collections::HashMap;
use std::sync::Arc;

use stakd_consensus::Hash256;
use stakd_primitives::encoding::DecodeError;
use stakd_primitives::outpoint::OutPoint;
use stakd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::coins::{Coin, Coins};

pub const META_COINS_BEST_BLOCK: &[u8] = b"coins_best_block";

/// Dirty records handed down on flush. `None` erases the record.
pub type CoinsMap = HashMap<Hash256, Option<Coins>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoinsError {
    Store(StoreError),
    Decode(DecodeError),
    MissingCoin(OutPoint),
    /// Adding a record over one that still has unspent outputs.
    Overwrite(Hash256),
    /// Restoring an output that is already unspent.
    AlreadyUnspent(OutPoint),
}

impl std::fmt::Display for CoinsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoinsError::Store(err) => write!(f, "{err}"),
            CoinsError::Decode(err) => write!(f, "coins record: {err}"),
            CoinsError::MissingCoin(outpoint) => write!(f, "missing coin {outpoint}"),
            CoinsError::Overwrite(_) => write!(f, "coins record still has unspent outputs"),
            CoinsError::AlreadyUnspent(outpoint) => write!(f, "coin {outpoint} already unspent"),
        }
    }
}

impl std::error::Error for CoinsError {}

impl From<StoreError> for CoinsError {
    fn from(err: StoreError) -> Self {
        CoinsError::Store(err)
    }
}

impl From<DecodeError> for CoinsError {
    fn from(err: DecodeError) -> Self {
        CoinsError::Decode(err)
    }
}

pub trait CoinsView {
    /// Record for `txid`, or `None` when unknown or fully spent.
    fn coins(&self, txid: &Hash256) -> Result<Option<Coins>, CoinsError>;
    fn best_block(&self) -> Result<Option<Hash256>, CoinsError>;
    /// Applies `changes` and `best_block` atomically.
    fn batch_write(
        &mut self,
        changes: CoinsMap,
        best_block: Option<Hash256>,
    ) -> Result<(), CoinsError>;
}

impl<T: CoinsView + ?Sized> CoinsView for &mut T {
    fn coins(&self, txid: &Hash256) -> Result<Option<Coins>, CoinsError> {
        (**self).coins(txid)
    }

    fn best_block(&self) -> Result<Option<Hash256>, CoinsError> {
        (**self).best_block()
    }

    fn batch_write(
        &mut self,
        changes: CoinsMap,
        best_block: Option<Hash256>,
    ) -> Result<(), CoinsError> {
        (**self).batch_write(changes, best_block)
    }
}

/// UTXO records persisted in [`Column::Utxo`], keyed by txid.
pub struct CoinsDb<S> {
    store: Arc<S>,
}

impl<S> Clone for CoinsDb<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: KeyValueStore> CoinsDb<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Visits every stored record in key order.
    pub fn for_each(
        &self,
        mut visitor: impl FnMut(Hash256, Coins),
    ) -> Result<(), CoinsError> {
        let mut decode_error = None;
        self.store
            .for_each_prefix(Column::Utxo, &[], &mut |key, value| {
                let Ok(txid) = <Hash256>::try_from(key) else {
                    decode_error = Some(DecodeError::InvalidData("utxo key length"));
                    return Ok(());
                };
                match Coins::decode(value) {
                    Ok(coins) => visitor(txid, coins),
                    Err(err) => decode_error = Some(err),
                }
                Ok(())
            })?;
        match decode_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

impl<S: KeyValueStore> CoinsView for CoinsDb<S> {
    fn coins(&self, txid: &Hash256) -> Result<Option<Coins>, CoinsError> {
        match self.store.get(Column::Utxo, txid)? {
            Some(bytes) => {
                let coins = Coins::decode(&bytes)?;
                Ok((!coins.is_pruned()).then_some(coins))
            }
            None => Ok(None),
        }
    }

    fn best_block(&self) -> Result<Option<Hash256>, CoinsError> {
        match self.store.get(Column::Meta, META_COINS_BEST_BLOCK)? {
            Some(bytes) => <Hash256>::try_from(bytes.as_slice())
                .map(Some)
                .map_err(|_| CoinsError::Decode(DecodeError::InvalidData("best block length"))),
            None => Ok(None),
        }
    }

    fn batch_write(
        &mut self,
        changes: CoinsMap,
        best_block: Option<Hash256>,
    ) -> Result<(), CoinsError> {
        let mut batch = WriteBatch::new();
        for (txid, coins) in changes {
            match coins {
                Some(coins) if !coins.is_pruned() => batch.put(Column::Utxo, txid, coins.encode()),
                _ => batch.delete(Column::Utxo, txid),
            }
        }
        if let Some(best_block) = best_block {
            batch.put(Column::Meta, META_COINS_BEST_BLOCK, best_block.to_vec());
        }
        self.store.write_batch(&batch)?;
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct CacheEntry {
    coins: Option<Coins>,
    dirty: bool,
}

/// In-memory overlay on a parent view.
///
/// The first read of a txid pins the parent's answer in the cache, so a view
/// keeps serving that snapshot even if the parent changes underneath it.
pub struct CoinsViewCache<P> {
    parent: P,
    entries: HashMap<Hash256, CacheEntry>,
    best_block: Option<Hash256>,
}

impl<P: CoinsView> CoinsViewCache<P> {
    pub fn new(parent: P) -> Self {
        Self {
            parent,
            entries: HashMap::new(),
            best_block: None,
        }
    }

    fn entry(&mut self, txid: &Hash256) -> Result<&mut CacheEntry, CoinsError> {
        if !self.entries.contains_key(txid) {
            let coins = self.parent.coins(txid)?;
            self.entries.insert(*txid, CacheEntry { coins, dirty: false });
        }
        self.entries
            .get_mut(txid)
            .ok_or(CoinsError::Decode(DecodeError::InvalidData("cache entry vanished")))
    }

    pub fn access_coins(&mut self, txid: &Hash256) -> Result<Option<&Coins>, CoinsError> {
        let entry = self.entry(txid)?;
        Ok(entry.coins.as_ref().filter(|coins| !coins.is_pruned()))
    }

    pub fn get(&mut self, txid: &Hash256) -> Result<Option<Coins>, CoinsError> {
        Ok(self.access_coins(txid)?.cloned())
    }

    pub fn have_coins(&mut self, txid: &Hash256) -> Result<bool, CoinsError> {
        Ok(self.access_coins(txid)?.is_some())
    }

    pub fn is_available(&mut self, outpoint: &OutPoint) -> Result<bool, CoinsError> {
        Ok(self
            .access_coins(&outpoint.hash)?
            .is_some_and(|coins| coins.is_available(outpoint.index)))
    }

    pub fn coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinsError> {
        Ok(self
            .access_coins(&outpoint.hash)?
            .and_then(|coins| coins.coin(outpoint.index)))
    }

    /// Marks `outpoint` spent and returns what it held.
    pub fn spend(&mut self, outpoint: &OutPoint) -> Result<Coin, CoinsError> {
        let entry = self.entry(&outpoint.hash)?;
        let coin = entry
            .coins
            .as_mut()
            .and_then(|coins| coins.spend(outpoint.index))
            .ok_or(CoinsError::MissingCoin(*outpoint))?;
        entry.dirty = true;
        Ok(coin)
    }

    /// Inserts the outputs of a newly connected transaction.
    pub fn add(&mut self, txid: Hash256, coins: Coins) -> Result<(), CoinsError> {
        let entry = self.entry(&txid)?;
        if entry.coins.as_ref().is_some_and(|existing| !existing.is_pruned()) {
            return Err(CoinsError::Overwrite(txid));
        }
        entry.coins = Some(coins);
        entry.dirty = true;
        Ok(())
    }

    /// Erases the record for `txid`, returning its previous content.
    pub fn remove(&mut self, txid: &Hash256) -> Result<Option<Coins>, CoinsError> {
        let entry = self.entry(txid)?;
        let previous = entry.coins.take().filter(|coins| !coins.is_pruned());
        entry.dirty = true;
        Ok(previous)
    }

    /// Puts a spent output back, recreating its record if it was erased.
    pub fn restore(&mut self, outpoint: &OutPoint, coin: Coin) -> Result<(), CoinsError> {
        let entry = self.entry(&outpoint.hash)?;
        let coins = entry.coins.get_or_insert_with(|| Coins::empty_like(&coin));
        if !coins.restore(outpoint.index, coin) {
            return Err(CoinsError::AlreadyUnspent(*outpoint));
        }
        entry.dirty = true;
        Ok(())
    }

    pub fn set_best_block(&mut self, hash: Hash256) {
        self.best_block = Some(hash);
    }

    pub fn dirty_count(&self) -> usize {
        self.entries.values().filter(|entry| entry.dirty).count()
    }

    /// Writes every dirty record and the best block to the parent in one
    /// batch. On error the cache keeps all of its pending changes.
    pub fn flush(&mut self) -> Result<(), CoinsError> {
        let changes: CoinsMap = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.dirty)
            .map(|(txid, entry)| (*txid, entry.coins.clone()))
            .collect();
        self.parent.batch_write(changes, self.best_block)?;
        self.entries.clear();
        self.best_block = None;
        Ok(())
    }

    pub fn parent(&self) -> &P {
        &self.parent
    }
}

impl<P: CoinsView> CoinsView for CoinsViewCache<P> {
    fn coins(&self, txid: &Hash256) -> Result<Option<Coins>, CoinsError> {
        match self.entries.get(txid) {
            Some(entry) => Ok(entry.coins.clone().filter(|coins| !coins.is_pruned())),
            None => self.parent.coins(txid),
        }
    }

    fn best_block(&self) -> Result<Option<Hash256>, CoinsError> {
        match self.best_block {
            Some(hash) => Ok(Some(hash)),
            None => self.parent.best_block(),
        }
    }

    fn batch_write(
        &mut self,
        changes: CoinsMap,
        best_block: Option<Hash256>,
    ) -> Result<(), CoinsError> {
        for (txid, coins) in changes {
            self.entries.insert(txid, CacheEntry { coins, dirty: true });
        }
        if best_block.is_some() {
            self.best_block = best_block;
        }
        Ok(())
    }
}
