#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use secp256k1::{PublicKey, Secp256k1, SecretKey};
use stakd::{open_node, Clock, NodeContext, StakeOutcome, Staker, Wallet, WalletCoin};
use stakd_consensus::money::Amount;
use stakd_consensus::{chain_params, Hash256, Network};
use stakd_primitives::block::Block;
use stakd_primitives::outpoint::OutPoint;
use stakd_primitives::transaction::{Transaction, TxIn, TxOut};
use stakd_script::standard::p2pk_script;
use stakd_storage::memory::MemoryStore;

/// Regtest stake slot length in seconds.
pub const SLOT: u32 = 16;

pub struct TestClock(AtomicU32);

impl TestClock {
    pub fn new(time: u32) -> Self {
        Self(AtomicU32::new(time))
    }

    pub fn set(&self, time: u32) {
        self.0.store(time, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn adjusted_time(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Node {
    pub ctx: Arc<NodeContext<MemoryStore>>,
    pub clock: Arc<TestClock>,
    pub staker: Staker<MemoryStore, Arc<TestClock>>,
    pub genesis_time: u32,
}

/// Regtest node whose wallet holds key `[1; 32]`. Every such node shares
/// the same genesis block.
pub fn node() -> Node {
    node_with_reserve(0)
}

pub fn node_with_reserve(reserve: Amount) -> Node {
    let params = chain_params(Network::Regtest);
    let genesis_time = params.consensus.genesis_time;
    let mut wallet = Wallet::new(Network::Regtest);
    wallet.import_secret([1u8; 32]).expect("import key");
    wallet.set_reserve_balance(reserve);
    let ctx = Arc::new(
        open_node(params, Arc::new(MemoryStore::new()), wallet, 0).expect("open node"),
    );
    let clock = Arc::new(TestClock::new(genesis_time));
    let staker = Staker::new(Arc::clone(&ctx), Arc::clone(&clock));
    Node {
        ctx,
        clock,
        staker,
        genesis_time,
    }
}

impl Node {
    /// Sets the clock a few seconds into slot `slot` after genesis.
    pub fn set_slot(&self, slot: u32) {
        self.clock.set(self.genesis_time + slot * SLOT + 5);
    }

    pub fn tick_at_slot(&mut self, slot: u32) -> StakeOutcome {
        self.set_slot(slot);
        self.staker.tick().expect("tick")
    }

    pub fn height(&self) -> i32 {
        self.ctx.with_chain(|chain| chain.height()).expect("chain lock")
    }

    pub fn mempool_size(&self) -> usize {
        self.ctx.chain_info().expect("chain info").mempool_size
    }

    /// Genesis output `index`, while it is still unspent.
    pub fn genesis_coin(&self, index: u32) -> WalletCoin {
        self.ctx
            .with_chain_and_wallet(|chain, wallet| wallet.coins(chain))
            .expect("locks")
            .expect("wallet coins")
            .into_iter()
            .find(|coin| coin.coin.height == 0 && coin.outpoint.index == index)
            .expect("genesis coin")
    }

    /// Signed payment of `amount` from `coin` to [`payee_script`], with the
    /// change minus `fee` back to the wallet. Not submitted.
    pub fn pay_from(&self, coin: &WalletCoin, amount: Amount, fee: Amount) -> Transaction {
        self.ctx
            .with_wallet(|wallet| {
                let change = coin.coin.output.value - amount - fee;
                let mut tx = Transaction::new(
                    vec![TxIn::new(coin.outpoint)],
                    vec![
                        TxOut::new(amount, payee_script()),
                        TxOut::new(change, wallet.default_script().expect("default script")),
                    ],
                );
                wallet
                    .sign_input(&mut tx, 0, &coin.coin.output.script_pubkey)
                    .expect("sign");
                tx
            })
            .expect("wallet lock")
    }

    /// Signed transaction spending output `index` of `parent` in full, minus
    /// `fee`, to [`payee_script`]. Not submitted.
    pub fn spend_output(&self, parent: &Transaction, index: u32, fee: Amount) -> Transaction {
        let output = &parent.vout[index as usize];
        let mut tx = Transaction::new(
            vec![TxIn::new(OutPoint::new(parent.txid(), index))],
            vec![TxOut::new(output.value - fee, payee_script())],
        );
        self.ctx
            .with_wallet(|wallet| wallet.sign_input(&mut tx, 0, &output.script_pubkey))
            .expect("wallet lock")
            .expect("sign");
        tx
    }

    pub fn block(&self, hash: &Hash256) -> Block {
        self.ctx
            .with_chain(|chain| chain.read_block(hash).expect("read").expect("block"))
            .expect("chain lock")
    }
}

pub fn payee_script() -> Vec<u8> {
    let secret = SecretKey::from_slice(&[2u8; 32]).expect("secret key");
    let pubkey = PublicKey::from_secret_key(&Secp256k1::new(), &secret);
    p2pk_script(&pubkey.serialize())
}
