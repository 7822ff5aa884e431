//! Per-transaction unspent output records.

use stakd_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use stakd_primitives::transaction::{Transaction, TxOut};
use stakd_script::standard::OP_RETURN;

const FLAG_COINBASE: u8 = 1 << 0;
const FLAG_COINSTAKE: u8 = 1 << 1;

/// Outputs of one transaction that are still unspent on the active chain.
///
/// `outputs[n]` is `None` once output `n` is spent or when it was never
/// spendable (coinstake marker, null data). Trailing `None` slots are
/// trimmed so a record that was spent and restored compares equal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Coins {
    pub outputs: Vec<Option<TxOut>>,
    pub height: u32,
    pub time: u32,
    pub is_coinbase: bool,
    pub is_coinstake: bool,
}

impl Coins {
    pub fn from_tx(tx: &Transaction, height: u32, time: u32) -> Self {
        let outputs = tx
            .vout
            .iter()
            .map(|out| {
                if out.is_empty() || out.script_pubkey.first() == Some(&OP_RETURN) {
                    None
                } else {
                    Some(out.clone())
                }
            })
            .collect();
        let mut coins = Self {
            outputs,
            height,
            time,
            is_coinbase: tx.is_coinbase(),
            is_coinstake: tx.is_coinstake(),
        };
        coins.cleanup();
        coins
    }

    pub fn is_available(&self, index: u32) -> bool {
        self.output(index).is_some()
    }

    pub fn output(&self, index: u32) -> Option<&TxOut> {
        self.outputs.get(index as usize).and_then(Option::as_ref)
    }

    pub fn is_pruned(&self) -> bool {
        self.outputs.iter().all(Option::is_none)
    }

    pub fn available(&self) -> impl Iterator<Item = (u32, &TxOut)> {
        self.outputs
            .iter()
            .enumerate()
            .filter_map(|(index, out)| out.as_ref().map(|out| (index as u32, out)))
    }

    /// Takes output `index`, leaving its slot spent.
    pub fn spend(&mut self, index: u32) -> Option<Coin> {
        let output = self.outputs.get_mut(index as usize)?.take()?;
        self.cleanup();
        Some(self.coin_of(output))
    }

    /// Puts `coin` back into slot `index`. Returns false if the slot is
    /// already occupied.
    pub fn restore(&mut self, index: u32, coin: Coin) -> bool {
        let slot = index as usize;
        if self.outputs.len() <= slot {
            self.outputs.resize(slot + 1, None);
        }
        if self.outputs[slot].is_some() {
            return false;
        }
        self.outputs[slot] = Some(coin.output);
        true
    }

    /// Empty record carrying `coin`'s metadata, used when a fully spent
    /// transaction gets an output restored.
    pub fn empty_like(coin: &Coin) -> Self {
        Self {
            outputs: Vec::new(),
            height: coin.height,
            time: coin.time,
            is_coinbase: coin.is_coinbase,
            is_coinstake: coin.is_coinstake,
        }
    }

    fn coin_of(&self, output: TxOut) -> Coin {
        Coin {
            output,
            height: self.height,
            time: self.time,
            is_coinbase: self.is_coinbase,
            is_coinstake: self.is_coinstake,
        }
    }

    pub fn coin(&self, index: u32) -> Option<Coin> {
        self.output(index).cloned().map(|output| self.coin_of(output))
    }

    fn cleanup(&mut self) {
        while matches!(self.outputs.last(), Some(None)) {
            self.outputs.pop();
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.consensus_encode(&mut encoder);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        stakd_primitives::encoding::decode(bytes)
    }
}

impl Encodable for Coins {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u8(flags(self.is_coinbase, self.is_coinstake));
        encoder.write_u32_le(self.height);
        encoder.write_u32_le(self.time);
        encoder.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            match output {
                Some(output) => {
                    encoder.write_bool(true);
                    output.consensus_encode(encoder);
                }
                None => encoder.write_bool(false),
            }
        }
    }
}

impl Decodable for Coins {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let flags = decoder.read_u8()?;
        let height = decoder.read_u32_le()?;
        let time = decoder.read_u32_le()?;
        let count = decoder.read_count(1)?;
        let mut outputs = Vec::with_capacity(count);
        for _ in 0..count {
            outputs.push(if decoder.read_bool()? {
                Some(TxOut::consensus_decode(decoder)?)
            } else {
                None
            });
        }
        Ok(Self {
            outputs,
            height,
            time,
            is_coinbase: flags & FLAG_COINBASE != 0,
            is_coinstake: flags & FLAG_COINSTAKE != 0,
        })
    }
}

/// A single output together with the metadata of the transaction that
/// created it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Coin {
    pub output: TxOut,
    pub height: u32,
    pub time: u32,
    pub is_coinbase: bool,
    pub is_coinstake: bool,
}

impl Encodable for Coin {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u8(flags(self.is_coinbase, self.is_coinstake));
        encoder.write_u32_le(self.height);
        encoder.write_u32_le(self.time);
        self.output.consensus_encode(encoder);
    }
}

impl Decodable for Coin {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let flags = decoder.read_u8()?;
        let height = decoder.read_u32_le()?;
        let time = decoder.read_u32_le()?;
        let output = TxOut::consensus_decode(decoder)?;
        Ok(Self {
            output,
            height,
            time,
            is_coinbase: flags & FLAG_COINBASE != 0,
            is_coinstake: flags & FLAG_COINSTAKE != 0,
        })
    }
}

fn flags(is_coinbase: bool, is_coinstake: bool) -> u8 {
    let mut flags = 0;
    if is_coinbase {
        flags |= FLAG_COINBASE;
    }
    if is_coinstake {
        flags |= FLAG_COINSTAKE;
    }
    flags
}
