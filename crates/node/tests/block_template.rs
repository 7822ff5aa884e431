use std::sync::Arc;

use secp256k1::{PublicKey, Secp256k1, SecretKey};
use stakd::mempool::MempoolEntry;
use stakd::{open_node, BlockAssembler, BlockTemplate, NodeContext, Wallet};
use stakd_consensus::money::{Amount, COIN};
use stakd_consensus::{chain_params, Hash256, Network};
use stakd_primitives::outpoint::OutPoint;
use stakd_primitives::transaction::{Transaction, TxIn, TxOut};
use stakd_script::standard::p2pk_script;
use stakd_storage::memory::MemoryStore;

fn node() -> NodeContext<MemoryStore> {
    let mut wallet = Wallet::new(Network::Regtest);
    wallet.import_secret([1u8; 32]).expect("import key");
    open_node(
        chain_params(Network::Regtest),
        Arc::new(MemoryStore::new()),
        wallet,
        0,
    )
    .expect("open node")
}

fn payee_script() -> Vec<u8> {
    let secret = SecretKey::from_slice(&[2u8; 32]).expect("secret key");
    let pubkey = PublicKey::from_secret_key(&Secp256k1::new(), &secret);
    p2pk_script(&pubkey.serialize())
}

fn pay(ctx: &NodeContext<MemoryStore>, amount: Amount, fee: Amount) -> Transaction {
    let payee = payee_script();
    let tx = ctx
        .with_chain_mempool_wallet(|chain, mempool, wallet| {
            wallet.create_transaction(chain, mempool, &payee, amount, fee)
        })
        .expect("locks")
        .expect("create transaction");
    ctx.submit_transaction(tx.clone()).expect("submit");
    tx
}

/// Spends output 1 (the change) of `parent` in full, minus `fee`.
fn spend_change(ctx: &NodeContext<MemoryStore>, parent: &Transaction, fee: Amount) -> Transaction {
    let change = &parent.vout[1];
    let mut tx = Transaction::new(
        vec![TxIn::new(OutPoint::new(parent.txid(), 1))],
        vec![TxOut::new(change.value - fee, payee_script())],
    );
    ctx.with_wallet(|wallet| wallet.sign_input(&mut tx, 0, &change.script_pubkey))
        .expect("wallet lock")
        .expect("sign");
    ctx.submit_transaction(tx.clone()).expect("submit child");
    tx
}

fn template(
    ctx: &NodeContext<MemoryStore>,
    reserved: &[OutPoint],
    max_tx_bytes: Option<usize>,
) -> BlockTemplate {
    ctx.with_chain_and_mempool(|chain, mempool| {
        let mut assembler =
            BlockAssembler::new(chain, mempool).with_reserved_inputs(reserved.iter().copied());
        if let Some(bytes) = max_tx_bytes {
            assembler = assembler.with_max_tx_bytes(bytes);
        }
        assembler.create_template(&payee_script()).expect("template")
    })
    .expect("locks")
}

fn txids(template: &BlockTemplate) -> Vec<Hash256> {
    template.block.transactions[1..]
        .iter()
        .map(Transaction::txid)
        .collect()
}

#[test]
fn ancestors_precede_descendants_and_fees_order_the_rest() {
    let ctx = node();
    let low = pay(&ctx, 100 * COIN, COIN);
    let high = pay(&ctx, 100 * COIN, 5 * COIN);
    let child = spend_change(&ctx, &low, 50 * COIN);

    let template = template(&ctx, &[], None);
    assert_eq!(template.height, 1);
    assert_eq!(
        txids(&template),
        vec![low.txid(), child.txid(), high.txid()]
    );
    assert_eq!(template.tx_fees, vec![COIN, 50 * COIN, 5 * COIN]);
    assert_eq!(template.total_fees, 56 * COIN);

    let coinstake = &template.block.transactions[0];
    assert!(coinstake.vin.is_empty());
    assert!(coinstake.vout[0].is_empty());
    assert_eq!(coinstake.vout[1].value, 56 * COIN);
    assert_eq!(
        template.block.header.merkle_root,
        template.block.compute_merkle_root()
    );
    assert!(template.block.header.stake_prevout.is_null());
}

#[test]
fn reserved_stake_input_excludes_its_spender_and_descendants() {
    let ctx = node();
    let low = pay(&ctx, 100 * COIN, COIN);
    let high = pay(&ctx, 100 * COIN, 5 * COIN);
    spend_change(&ctx, &low, 50 * COIN);

    let reserved = low.vin[0].prevout;
    let template = template(&ctx, &[reserved], None);
    assert_eq!(txids(&template), vec![high.txid()]);
    assert_eq!(template.total_fees, 5 * COIN);
}

#[test]
fn entries_with_missing_inputs_are_skipped() {
    let ctx = node();
    let paid = pay(&ctx, 100 * COIN, COIN);

    let orphan = Transaction::new(
        vec![TxIn::new(OutPoint::new([9u8; 32], 0))],
        vec![TxOut::new(COIN, payee_script())],
    );
    let raw = orphan.consensus_encode();
    ctx.with_mempool(|mempool| {
        mempool.insert(MempoolEntry {
            txid: orphan.txid(),
            spent_outpoints: vec![orphan.vin[0].prevout],
            tx: orphan.clone(),
            raw,
            time: 0,
            height: 0,
            fee: 1_000 * COIN,
            value_in: 1_001 * COIN,
            parents: Vec::new(),
        })
    })
    .expect("mempool lock")
    .expect("insert");

    let template = template(&ctx, &[], None);
    assert_eq!(txids(&template), vec![paid.txid()]);
    assert_eq!(template.total_fees, COIN);
}

#[test]
fn size_limit_leaves_only_the_coinstake() {
    let ctx = node();
    pay(&ctx, 100 * COIN, COIN);

    let template = template(&ctx, &[], Some(0));
    assert_eq!(template.block.transactions.len(), 1);
    assert_eq!(template.total_fees, 0);
    assert!(template.tx_fees.is_empty());
}
