//! In-memory block index and the active chain.

use std::collections::{HashMap, HashSet};

use primitive_types::U256;
use stakd_consensus::Hash256;
use stakd_pos::difficulty::{block_proof, HeaderInfo};
use stakd_primitives::block::BlockHeader;
use stakd_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};

use crate::state::ChainStateError;

pub const STATUS_HAVE_DATA: u8 = 1 << 0;
pub const STATUS_HAVE_UNDO: u8 = 1 << 1;
pub const STATUS_FAILED: u8 = 1 << 2;
pub const STATUS_FAILED_CHILD: u8 = 1 << 3;

const STATUS_FAILED_MASK: u8 = STATUS_FAILED | STATUS_FAILED_CHILD;
const ZERO_HASH: Hash256 = [0u8; 32];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockIndex {
    pub hash: Hash256,
    pub prev_hash: Hash256,
    pub height: i32,
    pub time: u32,
    pub bits: u32,
    pub chainwork: U256,
    pub status: u8,
    /// Arrival order, used to break equal-work ties in favour of the first
    /// branch seen.
    pub sequence: u64,
}

impl BlockIndex {
    pub fn has_data(&self) -> bool {
        self.status & STATUS_HAVE_DATA != 0
    }

    pub fn is_failed(&self) -> bool {
        self.status & STATUS_FAILED_MASK != 0
    }

    pub fn header_info(&self) -> HeaderInfo {
        HeaderInfo {
            height: self.height,
            time: self.time,
            bits: self.bits,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(96);
        self.consensus_encode(&mut encoder);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        stakd_primitives::encoding::decode(bytes)
    }
}

impl Encodable for BlockIndex {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_hash_le(&self.hash);
        encoder.write_hash_le(&self.prev_hash);
        encoder.write_i32_le(self.height);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_bytes(&self.chainwork.to_big_endian());
        encoder.write_u8(self.status);
        encoder.write_u64_le(self.sequence);
    }
}

impl Decodable for BlockIndex {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let hash = decoder.read_hash_le()?;
        let prev_hash = decoder.read_hash_le()?;
        let height = decoder.read_i32_le()?;
        let time = decoder.read_u32_le()?;
        let bits = decoder.read_u32_le()?;
        let chainwork = U256::from_big_endian(&decoder.read_fixed::<32>()?);
        let status = decoder.read_u8()?;
        let sequence = decoder.read_u64_le()?;
        Ok(Self {
            hash,
            prev_hash,
            height,
            time,
            bits,
            chainwork,
            status,
            sequence,
        })
    }
}

/// Every known header plus the active chain as a height-indexed vector.
#[derive(Default)]
pub struct ChainIndex {
    entries: HashMap<Hash256, BlockIndex>,
    active: Vec<Hash256>,
    dirty: HashSet<Hash256>,
    next_sequence: u64,
}

impl ChainIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, hash: &Hash256) -> Option<&BlockIndex> {
        self.entries.get(hash)
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.entries.contains_key(hash)
    }

    /// Adds `header`, chaining it to its parent. Known headers are returned
    /// unchanged. Only the first header may have a zero parent.
    pub fn insert(&mut self, header: &BlockHeader) -> Result<BlockIndex, ChainStateError> {
        let hash = header.hash();
        if let Some(existing) = self.entries.get(&hash) {
            return Ok(existing.clone());
        }
        let proof = block_proof(header.bits)
            .map_err(|_| ChainStateError::InvalidHeader("bad compact target"))?;
        let (height, chainwork, status) = if header.prev_block == ZERO_HASH {
            if !self.entries.is_empty() {
                return Err(ChainStateError::InvalidHeader("second genesis header"));
            }
            (0, proof, 0)
        } else {
            let parent = self
                .entries
                .get(&header.prev_block)
                .ok_or(ChainStateError::MissingHeader)?;
            let status = if parent.is_failed() { STATUS_FAILED_CHILD } else { 0 };
            (
                parent.height + 1,
                parent.chainwork.saturating_add(proof),
                status,
            )
        };
        let entry = BlockIndex {
            hash,
            prev_hash: header.prev_block,
            height,
            time: header.time,
            bits: header.bits,
            chainwork,
            status,
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;
        self.entries.insert(hash, entry.clone());
        self.dirty.insert(hash);
        Ok(entry)
    }

    /// Re-adds an entry read back from storage.
    pub(crate) fn load(&mut self, entry: BlockIndex) {
        self.next_sequence = self.next_sequence.max(entry.sequence + 1);
        self.entries.insert(entry.hash, entry);
    }

    pub fn tip(&self) -> Option<&BlockIndex> {
        self.active.last().and_then(|hash| self.entries.get(hash))
    }

    /// Height of the active tip, `-1` before genesis is connected.
    pub fn height(&self) -> i32 {
        self.active.len() as i32 - 1
    }

    pub fn height_hash(&self, height: i32) -> Option<Hash256> {
        usize::try_from(height)
            .ok()
            .and_then(|height| self.active.get(height))
            .copied()
    }

    pub fn contains_active(&self, hash: &Hash256) -> bool {
        self.entries
            .get(hash)
            .is_some_and(|entry| self.height_hash(entry.height) == Some(*hash))
    }

    /// Makes `hash` the active tip, rewriting the active vector back to the
    /// fork with the previous chain.
    pub(crate) fn set_tip(&mut self, hash: &Hash256) -> Result<(), ChainStateError> {
        let mut branch = Vec::new();
        let mut cursor = *hash;
        loop {
            let entry = self.entries.get(&cursor).ok_or(ChainStateError::MissingHeader)?;
            if self.height_hash(entry.height) == Some(cursor) {
                break;
            }
            branch.push(cursor);
            if entry.height == 0 {
                self.active.clear();
                break;
            }
            cursor = entry.prev_hash;
        }
        let keep = match self.entries.get(hash) {
            Some(entry) => (entry.height + 1) as usize - branch.len(),
            None => return Err(ChainStateError::MissingHeader),
        };
        self.active.truncate(keep);
        self.active.extend(branch.into_iter().rev());
        Ok(())
    }

    /// Ancestor of `hash` at `height`.
    pub fn ancestor(&self, hash: &Hash256, height: i32) -> Option<&BlockIndex> {
        let mut entry = self.entries.get(hash)?;
        if height < 0 || height > entry.height {
            return None;
        }
        if let Some(active) = self.height_hash(entry.height) {
            if active == entry.hash {
                return self.height_hash(height).and_then(|hash| self.entries.get(&hash));
            }
        }
        while entry.height > height {
            entry = self.entries.get(&entry.prev_hash)?;
        }
        Some(entry)
    }

    /// Up to `count` entries ending at `hash`, oldest first.
    pub fn walk_back(&self, hash: &Hash256, count: usize) -> Vec<&BlockIndex> {
        let mut out = Vec::with_capacity(count);
        let mut cursor = self.entries.get(hash);
        while let Some(entry) = cursor {
            if out.len() == count {
                break;
            }
            out.push(entry);
            cursor = if entry.height == 0 {
                None
            } else {
                self.entries.get(&entry.prev_hash)
            };
        }
        out.reverse();
        out
    }

    pub fn header_infos(&self, hash: &Hash256, count: usize) -> Vec<HeaderInfo> {
        self.walk_back(hash, count)
            .into_iter()
            .map(BlockIndex::header_info)
            .collect()
    }

    /// Last common ancestor of the active chain and `hash`.
    pub fn find_fork(&self, hash: &Hash256) -> Option<&BlockIndex> {
        let mut entry = self.entries.get(hash)?;
        loop {
            if self.contains_active(&entry.hash) {
                return Some(entry);
            }
            if entry.height == 0 {
                return None;
            }
            entry = self.entries.get(&entry.prev_hash)?;
        }
    }

    /// Hashes from just above `fork` up to and including `hash`.
    pub fn branch_from(&self, fork: &BlockIndex, hash: &Hash256) -> Vec<Hash256> {
        let mut branch = Vec::new();
        let mut cursor = self.entries.get(hash);
        while let Some(entry) = cursor {
            if entry.height <= fork.height {
                break;
            }
            branch.push(entry.hash);
            cursor = self.entries.get(&entry.prev_hash);
        }
        branch.reverse();
        branch
    }

    /// The connectable entry with the most work. Equal work goes to the
    /// entry that arrived first.
    pub fn best_candidate(&self) -> Option<&BlockIndex> {
        self.entries
            .values()
            .filter(|entry| entry.has_data() && !entry.is_failed())
            .filter(|entry| self.branch_connectable(entry))
            .max_by(|a, b| {
                a.chainwork
                    .cmp(&b.chainwork)
                    .then_with(|| b.sequence.cmp(&a.sequence))
            })
    }

    fn branch_connectable(&self, entry: &BlockIndex) -> bool {
        let mut cursor = entry;
        loop {
            if self.contains_active(&cursor.hash) {
                return true;
            }
            if !cursor.has_data() || cursor.is_failed() || cursor.height == 0 {
                return false;
            }
            match self.entries.get(&cursor.prev_hash) {
                Some(parent) => cursor = parent,
                None => return false,
            }
        }
    }

    pub(crate) fn set_status(&mut self, hash: &Hash256, flags: u8) {
        if let Some(entry) = self.entries.get_mut(hash) {
            if entry.status & flags != flags {
                entry.status |= flags;
                self.dirty.insert(*hash);
            }
        }
    }

    /// Flags `hash` invalid and every known descendant as a failed child.
    pub(crate) fn mark_failed(&mut self, hash: &Hash256) {
        self.set_status(hash, STATUS_FAILED);
        let Some(failed_height) = self.entries.get(hash).map(|entry| entry.height) else {
            return;
        };
        let descendants: Vec<Hash256> = self
            .entries
            .values()
            .filter(|entry| entry.height > failed_height)
            .filter(|entry| {
                self.ancestor(&entry.hash, failed_height)
                    .is_some_and(|ancestor| ancestor.hash == *hash)
            })
            .map(|entry| entry.hash)
            .collect();
        for descendant in descendants {
            self.set_status(&descendant, STATUS_FAILED_CHILD);
        }
    }

    pub(crate) fn dirty_entries(&self) -> Vec<BlockIndex> {
        self.dirty
            .iter()
            .filter_map(|hash| self.entries.get(hash).cloned())
            .collect()
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty.clear();
    }

    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stakd_primitives::outpoint::OutPoint;

    const BITS: u32 = 0x1f00_ffff;

    fn header(prev_block: Hash256, time: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block,
            merkle_root: [0u8; 32],
            time,
            bits: BITS,
            stake_prevout: OutPoint::null(),
            block_sig: Vec::new(),
        }
    }

    fn extend(index: &mut ChainIndex, from: Hash256, count: u32, salt: u32) -> Vec<Hash256> {
        let mut hashes = Vec::new();
        let mut prev = from;
        for n in 0..count {
            let entry = index.insert(&header(prev, salt + n)).expect("insert");
            index.set_status(&entry.hash, STATUS_HAVE_DATA);
            prev = entry.hash;
            hashes.push(prev);
        }
        hashes
    }

    #[test]
    fn heights_and_work_accumulate() {
        let mut index = ChainIndex::new();
        let chain = extend(&mut index, ZERO_HASH, 4, 100);
        let tip = index.get(&chain[3]).expect("tip");
        assert_eq!(tip.height, 3);
        let proof = block_proof(BITS).expect("proof");
        assert_eq!(tip.chainwork, proof * U256::from(4u64));
        assert!(matches!(
            index.insert(&header([7u8; 32], 1)),
            Err(ChainStateError::MissingHeader)
        ));
    }

    #[test]
    fn set_tip_switches_branches() {
        let mut index = ChainIndex::new();
        let main = extend(&mut index, ZERO_HASH, 3, 100);
        index.set_tip(&main[2]).expect("tip");
        let side = extend(&mut index, main[0], 3, 500);
        assert_eq!(index.find_fork(&side[2]).map(|e| e.hash), Some(main[0]));
        assert_eq!(index.branch_from(index.get(&main[0]).expect("fork"), &side[2]), side);

        index.set_tip(&side[2]).expect("switch");
        assert_eq!(index.height(), 3);
        assert_eq!(index.height_hash(1), Some(side[0]));
        assert!(!index.contains_active(&main[1]));
        assert_eq!(index.ancestor(&side[2], 0).map(|e| e.hash), Some(main[0]));
    }

    #[test]
    fn best_candidate_prefers_work_then_arrival() {
        let mut index = ChainIndex::new();
        let genesis = extend(&mut index, ZERO_HASH, 1, 100)[0];
        index.set_tip(&genesis).expect("tip");
        let first = extend(&mut index, genesis, 2, 200);
        let second = extend(&mut index, genesis, 2, 300);
        assert_eq!(index.best_candidate().map(|e| e.hash), Some(first[1]));

        let longer = extend(&mut index, second[1], 1, 400);
        assert_eq!(index.best_candidate().map(|e| e.hash), Some(longer[0]));

        index.mark_failed(&second[0]);
        assert!(index.get(&longer[0]).expect("child").is_failed());
        assert_eq!(index.best_candidate().map(|e| e.hash), Some(first[1]));
    }

    #[test]
    fn entry_encoding_round_trips_status() {
        let mut index = ChainIndex::new();
        let hash = extend(&mut index, ZERO_HASH, 1, 9)[0];
        let entry = index.get(&hash).expect("entry").clone();
        assert_eq!(BlockIndex::decode(&entry.encode()).expect("decode"), entry);
    }
}
