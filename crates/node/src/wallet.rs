//! In-memory key wallet: P2PK keys, coin enumeration over the chain's UTXO
//! set, spending and block signing. It also keeps the staker's bookkeeping.

use std::cmp::Reverse;
use std::sync::OnceLock;

use rand::RngCore;
use secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use stakd_chainstate::{ChainState, ChainStateError, Coin};
use stakd_consensus::money::{money_range, Amount};
use stakd_consensus::Network;
use stakd_primitives::block::Block;
use stakd_primitives::outpoint::OutPoint;
use stakd_primitives::transaction::{Transaction, TxIn, TxOut};
use stakd_script::standard::p2pk_script;
use stakd_script::{sign_hash, sign_p2pk_input, ScriptError};
use stakd_storage::KeyValueStore;

use crate::mempool::Mempool;

#[derive(Debug)]
pub enum WalletError {
    InvalidSecretKey,
    NoKeys,
    UnknownScript,
    InsufficientFunds { needed: Amount, available: Amount },
    InvalidData(&'static str),
    ChainState(String),
    Script(ScriptError),
}

impl std::fmt::Display for WalletError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WalletError::InvalidSecretKey => write!(f, "invalid secret key"),
            WalletError::NoKeys => write!(f, "wallet has no keys"),
            WalletError::UnknownScript => write!(f, "script is not owned by this wallet"),
            WalletError::InsufficientFunds { needed, available } => {
                write!(f, "insufficient funds (needed {needed}, available {available})")
            }
            WalletError::InvalidData(msg) => write!(f, "{msg}"),
            WalletError::ChainState(message) => write!(f, "{message}"),
            WalletError::Script(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for WalletError {}

impl From<ScriptError> for WalletError {
    fn from(err: ScriptError) -> Self {
        WalletError::Script(err)
    }
}

impl From<ChainStateError> for WalletError {
    fn from(err: ChainStateError) -> Self {
        WalletError::ChainState(err.to_string())
    }
}

fn secp() -> &'static Secp256k1<All> {
    static SECP: OnceLock<Secp256k1<All>> = OnceLock::new();
    SECP.get_or_init(Secp256k1::new)
}

#[derive(Clone)]
struct WalletKey {
    secret: [u8; 32],
    script_pubkey: Vec<u8>,
}

impl WalletKey {
    fn from_secret(secret: [u8; 32]) -> Result<Self, WalletError> {
        let secret_key =
            SecretKey::from_slice(&secret).map_err(|_| WalletError::InvalidSecretKey)?;
        let pubkey = PublicKey::from_secret_key(secp(), &secret_key);
        Ok(Self {
            secret,
            script_pubkey: p2pk_script(&pubkey.serialize()),
        })
    }
}

/// An unspent output locked to one of the wallet's keys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalletCoin {
    pub outpoint: OutPoint,
    pub coin: Coin,
}

pub struct Wallet {
    network: Network,
    keys: Vec<WalletKey>,
    reserve_balance: Amount,
    last_search_time: u32,
    revision: u64,
}

impl Wallet {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            keys: Vec::new(),
            reserve_balance: 0,
            last_search_time: 0,
            revision: 0,
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Adds `secret` and returns the P2PK script it controls.
    pub fn import_secret(&mut self, secret: [u8; 32]) -> Result<Vec<u8>, WalletError> {
        let key = WalletKey::from_secret(secret)?;
        let script = key.script_pubkey.clone();
        if !self.owns(&script) {
            self.keys.push(key);
            self.revision = self.revision.saturating_add(1);
        }
        Ok(script)
    }

    pub fn generate_key(&mut self) -> Result<Vec<u8>, WalletError> {
        let mut rng = rand::rngs::OsRng;
        for _ in 0..16 {
            let mut secret = [0u8; 32];
            rng.fill_bytes(&mut secret);
            if SecretKey::from_slice(&secret).is_ok() {
                return self.import_secret(secret);
            }
        }
        Err(WalletError::InvalidSecretKey)
    }

    /// Script of the first key, used for change and as the default payee.
    pub fn default_script(&self) -> Result<Vec<u8>, WalletError> {
        self.keys
            .first()
            .map(|key| key.script_pubkey.clone())
            .ok_or(WalletError::NoKeys)
    }

    pub fn scripts(&self) -> impl Iterator<Item = &[u8]> {
        self.keys.iter().map(|key| key.script_pubkey.as_slice())
    }

    pub fn owns(&self, script_pubkey: &[u8]) -> bool {
        self.keys
            .iter()
            .any(|key| key.script_pubkey == script_pubkey)
    }

    fn secret_for(&self, script_pubkey: &[u8]) -> Result<&[u8; 32], WalletError> {
        self.keys
            .iter()
            .find(|key| key.script_pubkey == script_pubkey)
            .map(|key| &key.secret)
            .ok_or(WalletError::UnknownScript)
    }

    pub fn reserve_balance(&self) -> Amount {
        self.reserve_balance
    }

    pub fn set_reserve_balance(&mut self, amount: Amount) {
        self.reserve_balance = amount.max(0);
    }

    pub fn last_search_time(&self) -> u32 {
        self.last_search_time
    }

    pub fn set_last_search_time(&mut self, time: u32) {
        self.last_search_time = time;
    }

    /// Every available output the wallet owns, largest first.
    pub fn coins<S: KeyValueStore>(
        &self,
        chain: &ChainState<S>,
    ) -> Result<Vec<WalletCoin>, WalletError> {
        let mut out = Vec::new();
        chain.for_each_coins(|txid, coins| {
            for (index, output) in coins.available() {
                if !self.owns(&output.script_pubkey) {
                    continue;
                }
                if let Some(coin) = coins.coin(index) {
                    out.push(WalletCoin {
                        outpoint: OutPoint::new(txid, index),
                        coin,
                    });
                }
            }
        })?;
        out.sort_by_key(|entry| (Reverse(entry.coin.output.value), entry.outpoint));
        Ok(out)
    }

    /// Whether `coin` may be spent by a block at `next_height`.
    fn is_mature(coin: &Coin, next_height: i32, maturity: i32) -> bool {
        !coin.is_coinstake || next_height - (coin.height as i32) >= maturity
    }

    /// Outputs spendable in the next block that no pool entry already spends.
    pub fn spendable_coins<S: KeyValueStore>(
        &self,
        chain: &ChainState<S>,
        mempool: &Mempool,
    ) -> Result<Vec<WalletCoin>, WalletError> {
        let next_height = chain.height() + 1;
        let maturity = chain.params().coinstake_maturity;
        Ok(self
            .coins(chain)?
            .into_iter()
            .filter(|entry| Self::is_mature(&entry.coin, next_height, maturity))
            .filter(|entry| !mempool.is_spent(&entry.outpoint))
            .collect())
    }

    /// Mature value: outputs a block at the next height may spend.
    pub fn balance<S: KeyValueStore>(&self, chain: &ChainState<S>) -> Result<Amount, WalletError> {
        let next_height = chain.height() + 1;
        let maturity = chain.params().coinstake_maturity;
        Ok(self
            .coins(chain)?
            .iter()
            .filter(|entry| Self::is_mature(&entry.coin, next_height, maturity))
            .map(|entry| entry.coin.output.value)
            .sum())
    }

    /// Value held in coinstake outputs that have not reached maturity.
    pub fn staked<S: KeyValueStore>(&self, chain: &ChainState<S>) -> Result<Amount, WalletError> {
        let next_height = chain.height() + 1;
        let maturity = chain.params().coinstake_maturity;
        Ok(self
            .coins(chain)?
            .iter()
            .filter(|entry| !Self::is_mature(&entry.coin, next_height, maturity))
            .map(|entry| entry.coin.output.value)
            .sum())
    }

    /// Candidates for a kernel in a block at the next height with time
    /// `search_time`: mature, deep enough, created before `search_time` and
    /// not spent in the pool. Selection stops before the reserve balance
    /// would be touched.
    pub fn stakeable_coins<S: KeyValueStore>(
        &self,
        chain: &ChainState<S>,
        mempool: &Mempool,
        search_time: u32,
    ) -> Result<Vec<WalletCoin>, WalletError> {
        let params = chain.params();
        let next_height = chain.height() + 1;
        let spendable = self.spendable_coins(chain, mempool)?;
        let total: Amount = spendable.iter().map(|entry| entry.coin.output.value).sum();
        let mut budget = total - self.reserve_balance;
        if budget <= 0 {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in spendable {
            let value = entry.coin.output.value;
            if value > budget {
                continue;
            }
            if next_height - (entry.coin.height as i32) < params.stake_min_depth {
                continue;
            }
            if entry.coin.time >= search_time {
                continue;
            }
            budget -= value;
            out.push(entry);
        }
        Ok(out)
    }

    /// Signed transaction paying `amount` to `to` with `fee` left for the
    /// block, change returning to the default script.
    pub fn create_transaction<S: KeyValueStore>(
        &self,
        chain: &ChainState<S>,
        mempool: &Mempool,
        to: &[u8],
        amount: Amount,
        fee: Amount,
    ) -> Result<Transaction, WalletError> {
        if amount <= 0 || fee < 0 || !money_range(amount) || !money_range(fee) {
            return Err(WalletError::InvalidData("amount out of range"));
        }
        let needed = amount + fee;
        let mut selected = Vec::new();
        let mut value_in: Amount = 0;
        let candidates = self.spendable_coins(chain, mempool)?;
        let available: Amount = candidates.iter().map(|entry| entry.coin.output.value).sum();
        for entry in candidates {
            if value_in >= needed {
                break;
            }
            value_in += entry.coin.output.value;
            selected.push(entry);
        }
        if value_in < needed {
            return Err(WalletError::InsufficientFunds { needed, available });
        }

        let mut vout = vec![TxOut::new(amount, to.to_vec())];
        let change = value_in - needed;
        if change > 0 {
            vout.push(TxOut::new(change, self.default_script()?));
        }
        let mut tx = Transaction::new(
            selected.iter().map(|entry| TxIn::new(entry.outpoint)).collect(),
            vout,
        );
        for (index, entry) in selected.iter().enumerate() {
            let script = &entry.coin.output.script_pubkey;
            tx.vin[index].script_sig =
                sign_p2pk_input(&tx, index, script, self.secret_for(script)?)?;
        }
        Ok(tx)
    }

    /// Signs input `input_index` of `tx`, which spends an output locked to
    /// `script_pubkey`.
    pub fn sign_input(
        &self,
        tx: &mut Transaction,
        input_index: usize,
        script_pubkey: &[u8],
    ) -> Result<(), WalletError> {
        if input_index >= tx.vin.len() {
            return Err(WalletError::InvalidData("input index out of range"));
        }
        let secret = self.secret_for(script_pubkey)?;
        tx.vin[input_index].script_sig = sign_p2pk_input(tx, input_index, script_pubkey, secret)?;
        Ok(())
    }

    /// Fills `block_sig` with the signature of the key behind `stake_script`.
    pub fn sign_block(&self, block: &mut Block, stake_script: &[u8]) -> Result<(), WalletError> {
        let secret = self.secret_for(stake_script)?;
        block.header.block_sig = sign_hash(secret, &block.header.hash())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn imported_key_is_owned_once() {
        let mut wallet = Wallet::new(Network::Regtest);
        let script = wallet.import_secret([7u8; 32]).expect("import");
        let again = wallet.import_secret([7u8; 32]).expect("re-import");
        assert_eq!(script, again);
        assert!(wallet.owns(&script));
        assert_eq!(wallet.scripts().count(), 1);
        assert_eq!(wallet.default_script().expect("default"), script);
    }

    #[test]
    fn zero_secret_is_rejected() {
        let mut wallet = Wallet::new(Network::Regtest);
        assert!(matches!(
            wallet.import_secret([0u8; 32]),
            Err(WalletError::InvalidSecretKey)
        ));
        assert!(matches!(wallet.default_script(), Err(WalletError::NoKeys)));
    }

    #[test]
    fn generated_keys_are_distinct() {
        let mut wallet = Wallet::new(Network::Regtest);
        let first = wallet.generate_key().expect("first");
        let second = wallet.generate_key().expect("second");
        assert_ne!(first, second);
        assert_eq!(wallet.revision(), 2);
    }

    #[test]
    fn block_signature_verifies_against_the_stake_script() {
        let mut wallet = Wallet::new(Network::Regtest);
        let script = wallet.import_secret([3u8; 32]).expect("import");
        let mut block = Block {
            header: stakd_primitives::block::BlockHeader {
                version: 1,
                prev_block: [1u8; 32],
                merkle_root: [2u8; 32],
                time: 1_600_000_016,
                bits: 0x207f_ffff,
                stake_prevout: OutPoint::new([4u8; 32], 0),
                block_sig: Vec::new(),
            },
            transactions: Vec::new(),
        };
        wallet.sign_block(&mut block, &script).expect("sign");
        stakd_script::verify_hash_signature(&script, &block.header.block_sig, &block.header.hash())
            .expect("signature verifies");
        assert!(matches!(
            wallet.sign_block(&mut block, &[0x51]),
            Err(WalletError::UnknownScript)
        ));
    }
}
