#![allow(dead_code)]

use std::sync::Arc;

use secp256k1::{PublicKey, Secp256k1, SecretKey};
use stakd_chainstate::{build_genesis, BlockIndex, ChainState, CoinsView};
use stakd_consensus::money::{Amount, COIN};
use stakd_consensus::{chain_params, proof_of_stake_reward, stake_age, ChainParams, Network};
use stakd_primitives::block::{compute_merkle_root, Block, BlockHeader};
use stakd_primitives::outpoint::OutPoint;
use stakd_primitives::transaction::{Transaction, TxIn, TxOut};
use stakd_script::standard::p2pk_script;
use stakd_script::{sign_hash, sign_p2pk_input};
use stakd_storage::memory::MemoryStore;
use stakd_storage::KeyValueStore;

/// Stake time spacing used by the helpers, one hour in 16 second slots.
pub const STEP: u32 = 225;

pub struct Key {
    pub secret: [u8; 32],
    pub script: Vec<u8>,
}

pub fn key(tag: u8) -> Key {
    let secret = [tag; 32];
    let sk = SecretKey::from_slice(&secret).expect("secret key");
    let pubkey = PublicKey::from_secret_key(&Secp256k1::new(), &sk);
    Key {
        secret,
        script: p2pk_script(&pubkey.serialize()),
    }
}

pub struct Harness<S: KeyValueStore> {
    pub params: ChainParams,
    pub chain: ChainState<S>,
    pub genesis: Block,
    pub owner: Key,
}

pub fn regtest() -> Harness<MemoryStore> {
    regtest_with(Arc::new(MemoryStore::new()))
}

pub fn regtest_with<S: KeyValueStore>(store: Arc<S>) -> Harness<S> {
    let params = chain_params(Network::Regtest);
    let owner = key(1);
    let genesis = build_genesis(&params, &owner.script);
    let chain = ChainState::open(store, params.consensus.clone(), &genesis).expect("open chain");
    Harness {
        params,
        chain,
        genesis,
        owner,
    }
}

impl<S: KeyValueStore> Harness<S> {
    pub fn genesis_outpoint(&self, index: u32) -> OutPoint {
        OutPoint::new(self.genesis.transactions[0].txid(), index)
    }

    pub fn tip(&self) -> BlockIndex {
        self.chain.tip().cloned().expect("tip")
    }

    pub fn entry(&self, hash: &[u8; 32]) -> BlockIndex {
        self.chain.block_index(hash).cloned().expect("index entry")
    }

    pub fn is_available(&self, outpoint: &OutPoint) -> bool {
        self.chain
            .coins_view()
            .is_available(outpoint)
            .expect("coins lookup")
    }

    /// Signed transaction moving `amount` of `input` to `to`, returning the
    /// change minus `fee` to the owner.
    pub fn spend(&self, input: OutPoint, amount: Amount, fee: Amount, to: &[u8]) -> Transaction {
        let coin = self
            .chain
            .coins_view()
            .coin(&input)
            .expect("coins lookup")
            .expect("spendable input");
        let change = coin.output.value - amount - fee;
        let mut tx = Transaction::new(
            vec![TxIn::new(input)],
            vec![
                TxOut::new(amount, to.to_vec()),
                TxOut::new(change, self.owner.script.clone()),
            ],
        );
        tx.vin[0].script_sig =
            sign_p2pk_input(&tx, 0, &coin.output.script_pubkey, &self.owner.secret)
                .expect("sign input");
        tx
    }

    /// Stake block on `parent` spending `stake`, `steps` stake slots after
    /// the parent. `bonus` is added to the coinstake payout.
    pub fn stake_block(
        &self,
        parent: &BlockIndex,
        stake: OutPoint,
        steps: u32,
        txs: Vec<Transaction>,
        bonus: Amount,
    ) -> Block {
        let consensus = self.chain.params();
        let height = parent.height + 1;
        let mask = consensus.stake_timestamp_mask(height);
        let time = (parent.time & !mask) + steps * (mask + 1);

        let db = self.chain.coins_db();
        let stake_coin = db
            .coins(&stake.hash)
            .expect("coins lookup")
            .and_then(|coins| coins.coin(stake.index))
            .expect("stake coin");
        let mut fees = 0;
        for tx in &txs {
            let value_in: Amount = tx
                .vin
                .iter()
                .map(|input| {
                    db.coins(&input.prevout.hash)
                        .expect("coins lookup")
                        .and_then(|coins| coins.coin(input.prevout.index))
                        .map(|coin| coin.output.value)
                        .unwrap_or(0)
                })
                .sum();
            fees += value_in - tx.value_out().expect("value out");
        }
        let age = stake_age(stake_coin.time, time, consensus);
        let reward = proof_of_stake_reward(stake_coin.output.value, age, height, consensus);

        let mut coinstake = Transaction::new(
            vec![TxIn::new(stake)],
            vec![
                TxOut::empty(),
                TxOut::new(
                    stake_coin.output.value + reward + fees + bonus,
                    stake_coin.output.script_pubkey.clone(),
                ),
            ],
        );
        coinstake.vin[0].script_sig = sign_p2pk_input(
            &coinstake,
            0,
            &stake_coin.output.script_pubkey,
            &self.owner.secret,
        )
        .expect("sign coinstake");

        let mut transactions = vec![coinstake];
        transactions.extend(txs);
        let txids: Vec<[u8; 32]> = transactions.iter().map(Transaction::txid).collect();
        let mut block = Block {
            header: BlockHeader {
                version: 1,
                prev_block: parent.hash,
                merkle_root: compute_merkle_root(&txids),
                time,
                bits: parent.bits,
                stake_prevout: stake,
                block_sig: Vec::new(),
            },
            transactions,
        };
        block.header.block_sig =
            sign_hash(&self.owner.secret, &block.header.hash()).expect("sign block");
        block
    }
}

pub fn coin(amount: i64) -> Amount {
    amount * COIN
}
