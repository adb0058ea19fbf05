//! Fixed-width record store.
//!
//! Cached rows live here as opaque byte records written through a typed,
//! bounds-checked accessor. Records are allocated once and patched in place;
//! deletions compact their block and, once enough bytes are freed in a block
//! behind the write position, the block joins a reuse list that hands the
//! freed ids back to later allocations.

use std::collections::HashMap;

use bytes::Bytes;

use crate::arena::Arena;
use crate::error::Result;
use crate::options::{Options, ARRAY_BIG_ID_FLOOR};

use super::block::ARRAY_HEADER;
use super::chain::{BlockChain, ChainConfig};
use super::{BigValue, StoreStats};

pub struct ArrayStore {
    chain: BlockChain,
    big: HashMap<u32, BigValue>,
    next_big_id: u32,
    reuse_blocks: Vec<usize>,
    reuse_byte_limit: usize,
}

impl ArrayStore {
    pub fn new(opts: &Options, shard: usize, arena: &mut Arena) -> Self {
        let cfg = ChainConfig {
            name: "array",
            shard,
            header_len: ARRAY_HEADER,
            capacity: opts.block_capacity,
            memory_limit: opts.array_memory_limit,
            push_limit: opts.array_push_limit,
            compression: opts.compression,
            spill_runs_per_step: opts.spill_runs_per_step,
            root_path: opts.root_path.clone(),
            map_window: opts.map_window,
        };
        Self {
            chain: BlockChain::new(cfg, arena),
            big: HashMap::new(),
            next_big_id: ARRAY_BIG_ID_FLOOR,
            reuse_blocks: Vec::new(),
            reuse_byte_limit: opts.reuse_byte_limit,
        }
    }

    /// Allocate a zeroed record of `len` bytes and return its id.
    pub fn allocate(&mut self, arena: &mut Arena, len: usize) -> Result<u32> {
        if len > self.chain.max_record_len() {
            let buf = arena.allocate(len);
            let id = self.next_big_id;
            self.next_big_id += 1;
            self.big.insert(id, BigValue { buf, len: len as u32 });
            self.chain.add_used(len as u64);
            return Ok(id);
        }

        if !self.reuse_blocks.is_empty() {
            if let Some(id) = self.allocate_in_reuse(arena, len)? {
                return Ok(id);
            }
        }

        self.chain.append(arena, len, None, ARRAY_BIG_ID_FLOOR)
    }

    /// Delete the record at `id`, compacting its block. Unknown or already
    /// deleted ids are ignored.
    pub fn recycle(&mut self, arena: &mut Arena, id: u32) -> Result<()> {
        if id >= ARRAY_BIG_ID_FLOOR {
            if let Some(big) = self.big.remove(&id) {
                self.chain.sub_used(big.len as u64);
                arena.recycle(big.buf);
            }
            return Ok(());
        }

        let Some(pos) = self.chain.locate(arena, id)? else {
            return Ok(());
        };
        let cap = self.chain.capacity();
        let write_pos = self.chain.write_pos();
        let block = self.chain.block_mut(pos);
        let first = block.first_id();
        let count = block.count() as usize;
        let j = (id - first) as usize;
        let old = block.len_at(j) as usize;
        if old == 0 {
            return Ok(());
        }

        let prefix = block.prefix_len(j);
        let used = block.used() as usize;
        block.set_len_at(j, 0);
        // Close the payload gap: slide everything behind the deleted record
        // up by its length.
        block
            .raw_mut()
            .copy_within(cap - used..cap - prefix - old, cap - used + old);
        block.set_used((used - old) as u16);

        if pos == write_pos {
            self.chain.set_data_cursor(cap - (used - old));
        } else {
            let avail = cap - ARRAY_HEADER - count * 2 - (used - old);
            if avail >= self.reuse_byte_limit && !self.reuse_blocks.contains(&pos) {
                self.reuse_blocks.push(pos);
            }
        }
        Ok(())
    }

    /// Read access to the record at `id`.
    pub fn record(&mut self, arena: &mut Arena, id: u32) -> Result<Option<RecordRef<'_>>> {
        if id >= ARRAY_BIG_ID_FLOOR {
            return Ok(self.big.get(&id).map(|v| RecordRef {
                data: &v.buf[..v.len as usize],
            }));
        }
        let Some(pos) = self.chain.locate(arena, id)? else {
            return Ok(None);
        };
        let block = self.chain.block(pos);
        debug_assert!(block.contains(id));
        let j = (id - block.first_id()) as usize;
        Ok(block.payload(j).map(|data| RecordRef { data }))
    }

    /// Write access to the record at `id`.
    pub fn record_mut(&mut self, arena: &mut Arena, id: u32) -> Result<Option<RecordMut<'_>>> {
        if id >= ARRAY_BIG_ID_FLOOR {
            return Ok(self.big.get_mut(&id).map(|v| RecordMut {
                data: &mut v.buf[..v.len as usize],
            }));
        }
        let Some(pos) = self.chain.locate(arena, id)? else {
            return Ok(None);
        };
        let block = self.chain.block_mut(pos);
        let j = (id - block.first_id()) as usize;
        Ok(block.payload_mut(j).map(|data| RecordMut { data }))
    }

    /// Hand a freed id back from a registered reuse block, if one fits.
    fn allocate_in_reuse(&mut self, arena: &mut Arena, len: usize) -> Result<Option<u32>> {
        for i in (0..self.reuse_blocks.len()).rev() {
            let pos = self.reuse_blocks[i];
            self.chain.ensure_live(arena, pos)?;
            let cap = self.chain.capacity();
            let block = self.chain.block_mut(pos);
            let count = block.count() as usize;
            let used = block.used() as usize;
            let avail = cap - ARRAY_HEADER - count * 2 - used;
            if avail < len {
                continue;
            }

            let mut slot = None;
            let mut prefix = 0usize;
            for j in 0..count {
                let l = block.len_at(j) as usize;
                if l == 0 {
                    slot = Some(j);
                    break;
                }
                prefix += l;
            }
            let Some(j) = slot else {
                // No freed entry left; the block no longer belongs here.
                self.reuse_blocks.remove(i);
                continue;
            };

            // Re-open the gap at the freed record's position.
            let raw = block.raw_mut();
            raw.copy_within(cap - used..cap - prefix, cap - used - len);
            raw[cap - prefix - len..cap - prefix].fill(0);
            block.set_len_at(j, len as u16);
            block.set_used((used + len) as u16);
            let id = block.first_id() + j as u32;

            if cap - ARRAY_HEADER - count * 2 - (used + len) < self.reuse_byte_limit {
                self.reuse_blocks.remove(i);
            }
            return Ok(Some(id));
        }
        Ok(None)
    }

    /// Run one rate-limited batch of spill work; true means re-enqueue.
    pub fn spill_step(&mut self, arena: &mut Arena) -> bool {
        self.chain.spill_step(arena)
    }

    /// Whether the overflow ladder asked for a spill task since last polled.
    pub fn take_spill_request(&mut self) -> bool {
        self.chain.take_spill_request()
    }

    pub fn stats(&self) -> StoreStats {
        self.chain.stats()
    }

    /// Drop all records and start empty.
    pub fn reset(&mut self, arena: &mut Arena) {
        for (_, big) in self.big.drain() {
            arena.recycle(big.buf);
        }
        self.next_big_id = ARRAY_BIG_ID_FLOOR;
        self.reuse_blocks.clear();
        self.chain.reset(arena);
    }
}

impl std::fmt::Debug for ArrayStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayStore")
            .field("chain", &self.chain)
            .field("big_values", &self.big.len())
            .field("reuse_blocks", &self.reuse_blocks.len())
            .finish()
    }
}

/// Bounds-checked read view over one record's bytes. All integers are
/// big-endian; offsets are relative to the record start.
pub struct RecordRef<'a> {
    data: &'a [u8],
}

impl<'a> RecordRef<'a> {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get_bit(&self, offset: usize, bit: u8) -> bool {
        self.data[offset] & (1 << bit) != 0
    }

    pub fn get_u8(&self, offset: usize) -> u8 {
        self.data[offset]
    }

    pub fn get_i8(&self, offset: usize) -> i8 {
        self.data[offset] as i8
    }

    pub fn get_u16(&self, offset: usize) -> u16 {
        u16::from_be_bytes(self.data[offset..offset + 2].try_into().expect("record bounds"))
    }

    pub fn get_i16(&self, offset: usize) -> i16 {
        self.get_u16(offset) as i16
    }

    pub fn get_u32(&self, offset: usize) -> u32 {
        u32::from_be_bytes(self.data[offset..offset + 4].try_into().expect("record bounds"))
    }

    pub fn get_i32(&self, offset: usize) -> i32 {
        self.get_u32(offset) as i32
    }

    pub fn get_u64(&self, offset: usize) -> u64 {
        u64::from_be_bytes(self.data[offset..offset + 8].try_into().expect("record bounds"))
    }

    pub fn get_i64(&self, offset: usize) -> i64 {
        self.get_u64(offset) as i64
    }

    pub fn get_f32(&self, offset: usize) -> f32 {
        f32::from_bits(self.get_u32(offset))
    }

    pub fn get_f64(&self, offset: usize) -> f64 {
        f64::from_bits(self.get_u64(offset))
    }

    pub fn get_bytes(&self, offset: usize, len: usize) -> Bytes {
        Bytes::copy_from_slice(&self.data[offset..offset + len])
    }
}

/// Bounds-checked write view over one record's bytes.
pub struct RecordMut<'a> {
    data: &'a mut [u8],
}

impl<'a> RecordMut<'a> {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_ref(&self) -> RecordRef<'_> {
        RecordRef { data: self.data }
    }

    pub fn set_bit(&mut self, offset: usize, bit: u8, value: bool) {
        if value {
            self.data[offset] |= 1 << bit;
        } else {
            self.data[offset] &= !(1 << bit);
        }
    }

    pub fn set_u8(&mut self, offset: usize, value: u8) {
        self.data[offset] = value;
    }

    pub fn set_i8(&mut self, offset: usize, value: i8) {
        self.data[offset] = value as u8;
    }

    pub fn set_u16(&mut self, offset: usize, value: u16) {
        self.data[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    }

    pub fn set_i16(&mut self, offset: usize, value: i16) {
        self.set_u16(offset, value as u16);
    }

    pub fn set_u32(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    }

    pub fn set_i32(&mut self, offset: usize, value: i32) {
        self.set_u32(offset, value as u32);
    }

    pub fn set_u64(&mut self, offset: usize, value: u64) {
        self.data[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
    }

    pub fn set_i64(&mut self, offset: usize, value: i64) {
        self.set_u64(offset, value as u64);
    }

    pub fn set_f32(&mut self, offset: usize, value: f32) {
        self.set_u32(offset, value.to_bits());
    }

    pub fn set_f64(&mut self, offset: usize, value: f64) {
        self.set_u64(offset, value.to_bits());
    }

    pub fn set_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Compression;
    use tempfile::TempDir;

    fn small_options(dir: &TempDir) -> Options {
        let mut opts = Options::default();
        opts.root_path = dir.path().to_path_buf();
        opts.block_capacity = 256;
        opts.map_window = 4096;
        opts.compression = Compression::Snappy;
        opts.reuse_byte_limit = 32;
        opts
    }

    fn store(opts: &Options, arena: &mut Arena) -> ArrayStore {
        ArrayStore::new(opts, 0, arena)
    }

    #[test]
    fn test_typed_accessor_round_trip() {
        let dir = TempDir::new().unwrap();
        let opts = small_options(&dir);
        let mut arena = Arena::new();
        let mut array = store(&opts, &mut arena);

        let id = array.allocate(&mut arena, 32).unwrap();
        {
            let mut rec = array.record_mut(&mut arena, id).unwrap().unwrap();
            rec.set_i32(0, -42);
            rec.set_u64(4, 0xDEAD_BEEF_CAFE);
            rec.set_f64(12, 1.5);
            rec.set_u16(20, 7);
            rec.set_bit(22, 3, true);
            rec.set_bytes(24, b"tail");
        }

        let rec = array.record(&mut arena, id).unwrap().unwrap();
        assert_eq!(rec.get_i32(0), -42);
        assert_eq!(rec.get_u64(4), 0xDEAD_BEEF_CAFE);
        assert_eq!(rec.get_f64(12), 1.5);
        assert_eq!(rec.get_u16(20), 7);
        assert!(rec.get_bit(22, 3));
        assert!(!rec.get_bit(22, 2));
        assert_eq!(rec.get_bytes(24, 4).as_ref(), b"tail");
    }

    #[test]
    fn test_fresh_records_are_zeroed() {
        let dir = TempDir::new().unwrap();
        let opts = small_options(&dir);
        let mut arena = Arena::new();
        let mut array = store(&opts, &mut arena);

        let id = array.allocate(&mut arena, 16).unwrap();
        let rec = array.record(&mut arena, id).unwrap().unwrap();
        assert_eq!(rec.get_u64(0), 0);
        assert_eq!(rec.get_u64(8), 0);
    }

    #[test]
    fn test_delete_compacts_and_preserves_neighbors() {
        let dir = TempDir::new().unwrap();
        let opts = small_options(&dir);
        let mut arena = Arena::new();
        let mut array = store(&opts, &mut arena);

        let ids: Vec<u32> = (0..5)
            .map(|i| {
                let id = array.allocate(&mut arena, 8).unwrap();
                let mut rec = array.record_mut(&mut arena, id).unwrap().unwrap();
                rec.set_u64(0, 100 + i);
                id
            })
            .collect();

        array.recycle(&mut arena, ids[2]).unwrap();
        assert!(array.record(&mut arena, ids[2]).unwrap().is_none());

        for (i, id) in ids.iter().enumerate() {
            if i == 2 {
                continue;
            }
            let rec = array.record(&mut arena, *id).unwrap().unwrap();
            assert_eq!(rec.get_u64(0), 100 + i as u64, "id {}", id);
        }
    }

    #[test]
    fn test_reuse_returns_freed_id() {
        let dir = TempDir::new().unwrap();
        let opts = small_options(&dir);
        let mut arena = Arena::new();
        let mut array = store(&opts, &mut arena);

        // Fill block 0 and roll into block 1.
        let mut ids = Vec::new();
        while array.stats().blocks < 2 {
            ids.push(array.allocate(&mut arena, 40).unwrap());
        }

        // Deleting a 40-byte record in a written-past block frees more than
        // the 32-byte threshold and registers the block for reuse.
        let victim = ids[1];
        array.recycle(&mut arena, victim).unwrap();

        let reused = array.allocate(&mut arena, 40).unwrap();
        assert_eq!(reused, victim);
        let rec = array.record(&mut arena, reused).unwrap().unwrap();
        assert_eq!(rec.get_u64(0), 0);

        // The next allocation mints a fresh, larger id: live ids stay
        // monotonically increasing in block order.
        let fresh = array.allocate(&mut arena, 40).unwrap();
        assert!(fresh > *ids.last().unwrap());
    }

    #[test]
    fn test_reuse_skips_too_small_gaps() {
        let dir = TempDir::new().unwrap();
        let opts = small_options(&dir);
        let mut arena = Arena::new();
        let mut array = store(&opts, &mut arena);

        let mut ids = Vec::new();
        while array.stats().blocks < 2 {
            ids.push(array.allocate(&mut arena, 40).unwrap());
        }
        array.recycle(&mut arena, ids[0]).unwrap();

        // A record bigger than the freed room must not land in the block.
        let id = array.allocate(&mut arena, 200).unwrap();
        assert!(id > *ids.last().unwrap());
    }

    #[test]
    fn test_big_records() {
        let dir = TempDir::new().unwrap();
        let opts = small_options(&dir);
        let mut arena = Arena::new();
        let mut array = store(&opts, &mut arena);

        let id = array.allocate(&mut arena, 1000).unwrap();
        assert!(id >= ARRAY_BIG_ID_FLOOR);
        {
            let mut rec = array.record_mut(&mut arena, id).unwrap().unwrap();
            rec.set_u64(992, 77);
        }
        let rec = array.record(&mut arena, id).unwrap().unwrap();
        assert_eq!(rec.len(), 1000);
        assert_eq!(rec.get_u64(992), 77);

        array.recycle(&mut arena, id).unwrap();
        assert!(array.record(&mut arena, id).unwrap().is_none());
    }

    #[test]
    fn test_unknown_id_is_not_found() {
        let dir = TempDir::new().unwrap();
        let opts = small_options(&dir);
        let mut arena = Arena::new();
        let mut array = store(&opts, &mut arena);

        array.allocate(&mut arena, 8).unwrap();
        assert!(array.record(&mut arena, 500).unwrap().is_none());
        array.recycle(&mut arena, 500).unwrap();
    }
}
