//! Variable-length value store.
//!
//! Strings and blobs live here, one u32 id per value. Values are appended
//! into blocks in id order; rewrites happen in place while the block can
//! absorb the new size and otherwise relocate under a fresh id -- callers
//! must always adopt the id returned by [`VarStore::rewrite`].

use std::collections::HashMap;

use bytes::Bytes;

use crate::arena::Arena;
use crate::error::Result;
use crate::options::{Options, VAR_BIG_ID_FLOOR};

use super::block::VAR_HEADER;
use super::chain::{BlockChain, ChainConfig};
use super::{BigValue, StoreStats};

pub struct VarStore {
    chain: BlockChain,
    big: HashMap<u32, BigValue>,
    next_big_id: u32,
}

impl VarStore {
    pub fn new(opts: &Options, shard: usize, arena: &mut Arena) -> Self {
        let cfg = ChainConfig {
            name: "var",
            shard,
            header_len: VAR_HEADER,
            capacity: opts.block_capacity,
            memory_limit: opts.var_memory_limit,
            push_limit: opts.var_push_limit,
            compression: opts.compression,
            spill_runs_per_step: opts.spill_runs_per_step,
            root_path: opts.root_path.clone(),
            map_window: opts.map_window,
        };
        Self {
            chain: BlockChain::new(cfg, arena),
            big: HashMap::new(),
            next_big_id: VAR_BIG_ID_FLOOR,
        }
    }

    /// Store a new value and return its id.
    pub fn set(&mut self, arena: &mut Arena, data: &[u8]) -> Result<u32> {
        if data.len() > self.chain.max_record_len() {
            let mut buf = arena.allocate(data.len());
            buf[..data.len()].copy_from_slice(data);
            let id = self.next_big_id;
            self.next_big_id += 1;
            self.big.insert(
                id,
                BigValue {
                    buf,
                    len: data.len() as u32,
                },
            );
            self.chain.add_used(data.len() as u64);
            return Ok(id);
        }
        self.chain.append(arena, data.len(), Some(data), VAR_BIG_ID_FLOOR)
    }

    /// Replace the value at `id`.
    ///
    /// Returns the id now holding the value, which differs from `id` when
    /// the grown value no longer fits its block; the old id then reads as
    /// not-found. `Ok(None)` means `id` is unknown.
    pub fn rewrite(&mut self, arena: &mut Arena, id: u32, data: &[u8]) -> Result<Option<u32>> {
        if id >= VAR_BIG_ID_FLOOR {
            let Some(big) = self.big.get_mut(&id) else {
                return Ok(None);
            };
            let old_len = big.len as u64;
            if big.buf.len() >= data.len() {
                big.buf[..data.len()].copy_from_slice(data);
                big.len = data.len() as u32;
            } else {
                let mut buf = arena.allocate(data.len());
                buf[..data.len()].copy_from_slice(data);
                let old = std::mem::replace(
                    big,
                    BigValue {
                        buf,
                        len: data.len() as u32,
                    },
                );
                arena.recycle(old.buf);
            }
            self.chain.sub_used(old_len);
            self.chain.add_used(data.len() as u64);
            return Ok(Some(id));
        }

        let Some(pos) = self.chain.locate(arena, id)? else {
            return Ok(None);
        };
        if data.len() <= self.chain.max_record_len() && self.write_in_block(pos, id, data) {
            return Ok(Some(id));
        }

        // The block cannot absorb the grown value: clear the old slot in
        // place and append elsewhere under a fresh id.
        self.write_in_block(pos, id, &[]);
        self.set(arena, data).map(Some)
    }

    /// Fetch the value at `id`. Cleared and relocated ids read as not-found.
    pub fn get(&mut self, arena: &mut Arena, id: u32) -> Result<Option<Bytes>> {
        if id >= VAR_BIG_ID_FLOOR {
            return Ok(self
                .big
                .get(&id)
                .map(|v| Bytes::copy_from_slice(&v.buf[..v.len as usize])));
        }
        let Some(pos) = self.chain.locate(arena, id)? else {
            return Ok(None);
        };
        let block = self.chain.block(pos);
        debug_assert!(block.contains(id));
        let j = (id - block.first_id()) as usize;
        Ok(block.payload(j).map(Bytes::copy_from_slice))
    }

    /// Drop the value at `id`. Unknown ids are ignored.
    pub fn clear(&mut self, arena: &mut Arena, id: u32) -> Result<()> {
        if id >= VAR_BIG_ID_FLOOR {
            if let Some(big) = self.big.remove(&id) {
                self.chain.sub_used(big.len as u64);
                arena.recycle(big.buf);
            }
            return Ok(());
        }
        self.rewrite(arena, id, &[])?;
        Ok(())
    }

    /// Rewrite record `id` inside its block, shifting trailing payload to
    /// keep the region gap-free. Returns false when the block cannot absorb
    /// the new size.
    fn write_in_block(&mut self, pos: usize, id: u32, data: &[u8]) -> bool {
        let cap = self.chain.capacity();
        let write_pos = self.chain.write_pos();
        let block = self.chain.block_mut(pos);
        let first = block.first_id();
        let count = block.count() as usize;
        let j = (id - first) as usize;

        let prefix = block.prefix_len(j);
        let old = block.len_at(j) as usize;
        let mut after = 0usize;
        for k in j + 1..count {
            after += block.len_at(k) as usize;
        }

        let total_new = prefix + data.len() + after;
        if total_new + count * 2 + VAR_HEADER > cap {
            return false;
        }

        // Slide the payloads of the records after `id`, then drop the new
        // bytes into the opened gap.
        let raw = block.raw_mut();
        raw.copy_within(
            cap - prefix - old - after..cap - prefix - old,
            cap - prefix - data.len() - after,
        );
        if !data.is_empty() {
            raw[cap - prefix - data.len()..cap - prefix].copy_from_slice(data);
        }
        block.set_len_at(j, data.len() as u16);

        if pos == write_pos {
            self.chain.set_data_cursor(cap - total_new);
        }
        true
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

    /// Drop all values and start empty.
    pub fn reset(&mut self, arena: &mut Arena) {
        for (_, big) in self.big.drain() {
            arena.recycle(big.buf);
        }
        self.next_big_id = VAR_BIG_ID_FLOOR;
        self.chain.reset(arena);
    }

    #[cfg(test)]
    pub(crate) fn swapped_run_count(&self) -> usize {
        self.chain.swapped_run_count()
    }
}

impl std::fmt::Debug for VarStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VarStore")
            .field("chain", &self.chain)
            .field("big_values", &self.big.len())
            .finish()
    }
}
