use stakd_consensus::constants::CURRENT_BLOCK_VERSION;
use stakd_consensus::ChainParams;
use stakd_pos::difficulty::target_to_compact;
use stakd_primitives::block::{compute_merkle_root, Block, BlockHeader};
use stakd_primitives::outpoint::OutPoint;
use stakd_primitives::transaction::{Transaction, TxIn, TxOut};

const GENESIS_TAG: &[u8] = b"stakd genesis";

/// Genesis block paying the network's initial supply to `script_pubkey`,
/// split into `genesis_outputs` equal outputs. Any remainder from the split
/// goes to the last output.
pub fn build_genesis(params: &ChainParams, script_pubkey: &[u8]) -> Block {
    let count = params.genesis_outputs.max(1) as i64;
    let share = params.genesis_supply / count;
    let mut outputs: Vec<TxOut> = (0..count)
        .map(|_| TxOut::new(share, script_pubkey.to_vec()))
        .collect();
    if let Some(last) = outputs.last_mut() {
        last.value += params.genesis_supply - share * count;
    }

    let mut input = TxIn::new(OutPoint::null());
    input.script_sig = Vec::with_capacity(GENESIS_TAG.len() + 1);
    input.script_sig.push(GENESIS_TAG.len() as u8);
    input.script_sig.extend_from_slice(GENESIS_TAG);
    let coinbase = Transaction::new(vec![input], outputs);

    let merkle_root = compute_merkle_root(&[coinbase.txid()]);
    Block {
        header: BlockHeader {
            version: CURRENT_BLOCK_VERSION,
            prev_block: [0u8; 32],
            merkle_root,
            time: params.consensus.genesis_time,
            bits: target_to_compact(&params.consensus.pos_limit),
            stake_prevout: OutPoint::null(),
            block_sig: Vec::new(),
        },
        transactions: vec![coinbase],
    }
}
