mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use common::{node, payee_script, Node, SLOT};
use stakd::{run_staker, NodeContext};
use stakd_chainstate::CoinsView;
use stakd_consensus::money::COIN;
use stakd_consensus::Hash256;
use stakd_storage::memory::MemoryStore;
use tokio::sync::watch;

/// Txids of every transaction on the active chain, counted per occurrence.
fn active_txids(ctx: &NodeContext<MemoryStore>) -> Vec<Hash256> {
    ctx.with_chain(|chain| {
        let mut out = Vec::new();
        for height in 1..=chain.height() {
            let hash = chain.index().height_hash(height).expect("active hash");
            let block = chain.read_block(&hash).expect("read").expect("block");
            out.extend(block.transactions.iter().map(|tx| tx.txid()));
        }
        out
    })
    .expect("chain lock")
}

fn assert_tip_flushed(ctx: &NodeContext<MemoryStore>) {
    ctx.with_chain(|chain| {
        assert_eq!(
            chain.coins_view().best_block().expect("coins best block"),
            chain.best_block()
        );
    })
    .expect("chain lock");
}

#[tokio::test]
async fn staker_task_stops_on_shutdown_signal() {
    let node = node();
    node.set_slot(1);
    let Node { ctx, staker, .. } = node;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(run_staker(staker, Duration::from_millis(10), shutdown_rx));

    let staked = tokio::time::timeout(Duration::from_secs(10), async {
        while ctx.chain_info().expect("chain info").height < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(staked.is_ok(), "staker never found a block");

    shutdown_tx.send(true).expect("send shutdown");
    let joined = tokio::time::timeout(Duration::from_secs(5), handle).await;
    assert!(matches!(joined, Ok(Ok(()))));

    assert_eq!(ctx.chain_info().expect("chain info").height, 1);
    assert_tip_flushed(&ctx);
}

#[tokio::test]
async fn staker_task_stops_when_the_sender_is_dropped() {
    let node = node();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(run_staker(node.staker, Duration::from_millis(10), shutdown_rx));
    drop(shutdown_tx);
    let joined = tokio::time::timeout(Duration::from_secs(5), handle).await;
    assert!(matches!(joined, Ok(Ok(()))));
}

#[test]
fn staking_submitting_and_reading_from_separate_threads() {
    let Node {
        ctx,
        clock,
        mut staker,
        genesis_time,
    } = node();
    let done = AtomicBool::new(false);
    let payee = payee_script();

    let accepted = thread::scope(|scope| {
        let reader = scope.spawn(|| {
            let mut last_height = 0;
            let mut reads = 0usize;
            loop {
                let info = ctx.chain_info().expect("chain info");
                assert!(info.height >= last_height, "height went backwards");
                last_height = info.height;
                reads += 1;
                if done.load(Ordering::SeqCst) {
                    return reads;
                }
            }
        });

        let submitter = scope.spawn(|| {
            let mut accepted = Vec::new();
            for _ in 0..6 {
                let tx = ctx
                    .with_chain_mempool_wallet(|chain, mempool, wallet| {
                        wallet.create_transaction(chain, mempool, &payee, 10 * COIN, COIN)
                    })
                    .expect("locks");
                // The staker may spend the chosen input before submission.
                if let Ok(tx) = tx {
                    if let Ok(txid) = ctx.submit_transaction(tx) {
                        accepted.push(txid);
                    }
                }
                thread::sleep(Duration::from_millis(1));
            }
            accepted
        });

        let staker_thread = scope.spawn(|| {
            for slot in 1..=6u32 {
                clock.set(genesis_time + slot * SLOT + 5);
                staker.tick().expect("tick");
                thread::sleep(Duration::from_millis(1));
            }
        });

        staker_thread.join().expect("staker thread");
        let accepted = submitter.join().expect("submitter thread");
        done.store(true, Ordering::SeqCst);
        assert!(reader.join().expect("reader thread") > 0);
        accepted
    });

    assert!(ctx.chain_info().expect("chain info").height >= 1);
    assert_tip_flushed(&ctx);

    // Every accepted payment is either still pooled or mined exactly once.
    let mined = active_txids(&ctx);
    let unique: HashSet<_> = mined.iter().collect();
    assert_eq!(unique.len(), mined.len());
    ctx.with_mempool(|mempool| {
        for txid in &accepted {
            let confirmed = mined.contains(txid);
            assert_ne!(confirmed, mempool.contains(txid));
        }
    })
    .expect("mempool lock");
}
