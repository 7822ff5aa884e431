mod common;

use common::node;
use stakd::StakeOutcome;
use stakd_chainstate::ValidationState;
use stakd_consensus::money::COIN;

#[test]
fn reorg_restores_disconnected_and_drops_confirmed_transactions() {
    // Same wallet key, so both nodes start from the same genesis block.
    let mut local = node();
    let mut remote = node();
    assert_eq!(
        local.ctx.best_block().expect("best"),
        remote.ctx.best_block().expect("best")
    );

    let restored = local.pay_from(&local.genesis_coin(3), 100 * COIN, COIN);
    local
        .ctx
        .submit_transaction(restored.clone())
        .expect("submit local payment");
    let StakeOutcome::Staked { hash: a1, height: 1 } = local.tick_at_slot(1) else {
        panic!("local stake failed");
    };
    assert!(local
        .block(&a1)
        .transactions
        .iter()
        .any(|tx| tx.txid() == restored.txid()));
    assert_eq!(local.mempool_size(), 0);

    // Spends the change of a transaction only the losing branch confirms.
    let orphaned_child = local.spend_output(&restored, 1, COIN);
    local
        .ctx
        .submit_transaction(orphaned_child.clone())
        .expect("submit child");

    let confirmed = remote.pay_from(&remote.genesis_coin(4), 200 * COIN, COIN);
    remote
        .ctx
        .submit_transaction(confirmed.clone())
        .expect("submit remote payment");
    let StakeOutcome::Staked { hash: b1, height: 1 } = remote.tick_at_slot(1) else {
        panic!("remote first stake failed");
    };
    let StakeOutcome::Staked { hash: b2, height: 2 } = remote.tick_at_slot(2) else {
        panic!("remote second stake failed");
    };
    assert_ne!(a1, b1);

    local
        .ctx
        .submit_transaction(confirmed.clone())
        .expect("relay remote payment");
    assert_eq!(local.mempool_size(), 2);

    // Equal work: the local tip stays and the pool is untouched.
    assert_eq!(
        local.ctx.submit_block(&remote.block(&b1)).expect("submit b1"),
        ValidationState::Valid
    );
    assert_eq!(local.ctx.best_block().expect("best"), Some(a1));
    assert_eq!(local.mempool_size(), 2);

    assert_eq!(
        local.ctx.submit_block(&remote.block(&b2)).expect("submit b2"),
        ValidationState::Valid
    );
    assert_eq!(local.ctx.best_block().expect("best"), Some(b2));
    assert_eq!(local.height(), 2);

    local
        .ctx
        .with_mempool(|mempool| {
            assert!(mempool.contains(&restored.txid()));
            assert!(!mempool.contains(&confirmed.txid()));
            assert!(!mempool.contains(&orphaned_child.txid()));
            assert_eq!(mempool.size(), 1);
            let entry = mempool.get(&restored.txid()).expect("restored entry");
            assert_eq!(entry.fee, COIN);
            assert_eq!(entry.height, 2);
        })
        .expect("mempool lock");

    // The restored payment is mined again on the new branch.
    let StakeOutcome::Staked { hash: a3, height: 3 } = local.tick_at_slot(3) else {
        panic!("stake on the new branch failed");
    };
    assert!(local
        .block(&a3)
        .transactions
        .iter()
        .any(|tx| tx.txid() == restored.txid()));
    assert_eq!(local.mempool_size(), 0);
}
