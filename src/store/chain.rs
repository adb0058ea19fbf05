//! Block sequence shared by the array and var stores.
//!
//! The chain owns the ordered slots, the append cursors, and the whole
//! overflow ladder: crossing the soft limit compresses cold aligned runs,
//! crossing the hard limit opens the swap file and hands the owner a spill
//! task to re-enqueue. Lookups binary-search on `first_id` and transparently
//! decompress or pull whatever state they land on.

use std::collections::HashSet;
use std::path::PathBuf;

use crate::arena::{Arena, ArenaBuf};
use crate::error::{Error, Result};
use crate::options::{Compression, COMPRESS_RANGE, INVALID_ID};
use crate::swap::SwapFile;

use super::block::Block;
use super::{compress_bytes, decompress_bytes, StoreStats};

/// Static configuration of one chain.
#[derive(Debug, Clone)]
pub(crate) struct ChainConfig {
    /// Store name, used for the swap file and log lines ("var" / "array").
    pub name: &'static str,
    pub shard: usize,
    pub header_len: usize,
    pub capacity: usize,
    pub memory_limit: u64,
    pub push_limit: u64,
    pub compression: Compression,
    pub spill_runs_per_step: usize,
    pub root_path: PathBuf,
    pub map_window: u64,
}

/// One position in the chain.
#[derive(Debug)]
pub(crate) enum Slot {
    /// A resident block.
    Live(Block),
    /// Head of a compressed run; the members behind it are `Packed`.
    Compressed(CompressedRun),
    /// Data lives in the run head's blob or in the swap file.
    Packed,
}

/// A whole run of blocks compressed into one arena allocation.
#[derive(Debug)]
pub(crate) struct CompressedRun {
    pub first_id: u32,
    pub count: u32,
    pub codec: Compression,
    pub crc: u32,
    pub blob: ArenaBuf,
    pub blob_len: usize,
}

pub(crate) struct BlockChain {
    cfg: ChainConfig,
    slots: Vec<Slot>,
    write_pos: usize,
    head_cursor: usize,
    data_cursor: usize,
    next_id: u32,
    used: u64,
    swap: Option<SwapFile>,
    swapped_runs: HashSet<usize>,
    in_spill: bool,
    spill_cursor: usize,
    spill_requested: bool,
}

impl BlockChain {
    pub fn new(cfg: ChainConfig, arena: &mut Arena) -> Self {
        let mut chain = Self {
            cfg,
            slots: Vec::new(),
            write_pos: 0,
            head_cursor: 0,
            data_cursor: 0,
            next_id: 1,
            used: 0,
            swap: None,
            swapped_runs: HashSet::new(),
            in_spill: false,
            spill_cursor: 0,
            spill_requested: false,
        };
        chain.new_block(arena);
        chain
    }

    pub fn capacity(&self) -> usize {
        self.cfg.capacity
    }

    /// Largest record that fits inside a block.
    pub fn max_record_len(&self) -> usize {
        self.cfg.capacity - self.cfg.header_len - 2
    }

    pub fn write_pos(&self) -> usize {
        self.write_pos
    }

    /// Account memory held outside the block sequence (big values).
    pub fn add_used(&mut self, bytes: u64) {
        self.used += bytes;
    }

    pub fn sub_used(&mut self, bytes: u64) {
        self.used = self.used.saturating_sub(bytes);
    }

    /// Reposition the write block's payload cursor after an in-place rewrite.
    pub fn set_data_cursor(&mut self, cursor: usize) {
        self.data_cursor = cursor;
    }

    /// The live block at `pos`. Callers must have located or ensured it.
    pub fn block(&self, pos: usize) -> &Block {
        match &self.slots[pos] {
            Slot::Live(b) => b,
            _ => panic!("block {} is not live", pos),
        }
    }

    pub fn block_mut(&mut self, pos: usize) -> &mut Block {
        match &mut self.slots[pos] {
            Slot::Live(b) => b,
            _ => panic!("block {} is not live", pos),
        }
    }

    /// Append a record with the given payload, or a zeroed one.
    ///
    /// `big_floor` is the first id of the store's big-value space; the
    /// in-block space below it is a hard capacity boundary.
    pub fn append(
        &mut self,
        arena: &mut Arena,
        len: usize,
        payload: Option<&[u8]>,
        big_floor: u32,
    ) -> Result<u32> {
        debug_assert!(len <= self.max_record_len());
        if self.next_id >= big_floor {
            return Err(Error::IdSpaceExhausted {
                next: self.next_id,
                floor: big_floor,
            });
        }

        if len + 2 > self.data_cursor - self.head_cursor {
            self.new_block(arena);
        }

        let id = self.next_id;
        self.next_id += 1;

        let data_cursor = self.data_cursor - len;
        let track_used = self.cfg.header_len == super::block::ARRAY_HEADER;
        let write_pos = self.write_pos;
        let block = self.block_mut(write_pos);
        let j = block.count() as usize;
        block.set_len_at(j, len as u16);
        block.set_count(j as u16 + 1);
        if track_used {
            let used = block.used();
            block.set_used(used + len as u16);
        }
        let slice = &mut block.raw_mut()[data_cursor..data_cursor + len];
        match payload {
            Some(p) => slice.copy_from_slice(p),
            None => slice.fill(0),
        }

        self.head_cursor += 2;
        self.data_cursor = data_cursor;
        Ok(id)
    }

    /// Find the block holding `id`, decompressing or pulling the run it
    /// lives in. Returns `None` for ids outside the known range.
    ///
    /// Panics when asked for the reserved invalid id 0: that is a
    /// programming error, not a miss.
    pub fn locate(&mut self, arena: &mut Arena, id: u32) -> Result<Option<usize>> {
        assert_ne!(id, INVALID_ID, "dereferenced the invalid record id 0");

        let mut lo: isize = 0;
        let mut hi: isize = self.write_pos as isize;
        while lo <= hi {
            let mid = ((lo + hi) / 2) as usize;
            let (pos, first, count, is_run) = self.probe(arena, mid)?;

            if first <= id && id < first + count {
                if is_run {
                    self.uncompress_run(arena, pos)?;
                    lo = pos as isize;
                    hi = (pos + COMPRESS_RANGE - 1).min(self.write_pos) as isize;
                    continue;
                }
                return Ok(Some(pos));
            }
            if first > id {
                hi = pos as isize - 1;
            } else if is_run {
                lo = (pos + COMPRESS_RANGE) as isize;
            } else {
                lo = pos as isize + 1;
            }
        }
        Ok(None)
    }

    /// Make the block at `pos` resident, decompressing or pulling its run.
    pub fn ensure_live(&mut self, arena: &mut Arena, pos: usize) -> Result<()> {
        if matches!(self.slots[pos], Slot::Live(_)) {
            return Ok(());
        }
        let head = pos & !(COMPRESS_RANGE - 1);
        match &self.slots[head] {
            Slot::Compressed(_) => self.uncompress_run(arena, head),
            Slot::Packed => self.pull_run(arena, head),
            Slot::Live(_) => Err(Error::internal("packed slot under a live run head")),
        }
    }

    /// Resolve `mid` to an inspectable position: a live block, or the head
    /// of the compressed run covering it. Swapped runs are pulled here.
    fn probe(&mut self, arena: &mut Arena, mid: usize) -> Result<(usize, u32, u32, bool)> {
        match &self.slots[mid] {
            Slot::Live(b) => return Ok((mid, b.first_id(), b.count() as u32, false)),
            Slot::Compressed(r) => return Ok((mid, r.first_id, r.count, true)),
            Slot::Packed => {}
        }

        let head = mid & !(COMPRESS_RANGE - 1);
        if let Slot::Compressed(r) = &self.slots[head] {
            return Ok((head, r.first_id, r.count, true));
        }
        self.pull_run(arena, head)?;
        match &self.slots[mid] {
            Slot::Live(b) => Ok((mid, b.first_id(), b.count() as u32, false)),
            _ => Err(Error::internal("pulled run did not become live")),
        }
    }

    fn new_block(&mut self, arena: &mut Arena) {
        let buf = arena.allocate(self.cfg.capacity);
        let block = Block::init(buf, self.cfg.header_len, self.cfg.capacity, self.next_id);
        self.slots.push(Slot::Live(block));
        self.write_pos = self.slots.len() - 1;
        self.head_cursor = self.cfg.header_len;
        self.data_cursor = self.cfg.capacity;
        self.used += self.cfg.capacity as u64;

        if self.used > self.cfg.memory_limit {
            tracing::debug!(
                store = self.cfg.name,
                shard = self.cfg.shard,
                used = self.used,
                limit = self.cfg.memory_limit,
                "memory limit crossed, compressing cold runs"
            );
            self.compress_runs(arena);
            if self.used > self.cfg.push_limit {
                self.prepare_spill();
            }
        }
    }

    /// Compress every aligned full run entirely behind the write block.
    /// The run being written to stays hot and is never touched.
    fn compress_runs(&mut self, arena: &mut Arena) {
        if !self.cfg.compression.is_enabled() {
            return;
        }
        let mut run = 0;
        while run + COMPRESS_RANGE <= self.write_pos {
            if matches!(self.slots[run], Slot::Live(_)) {
                if let Err(err) = self.compress_run(arena, run) {
                    tracing::warn!(
                        store = self.cfg.name,
                        shard = self.cfg.shard,
                        run,
                        error = %err,
                        "run compression failed"
                    );
                }
            }
            run += COMPRESS_RANGE;
        }
    }

    fn compress_run(&mut self, arena: &mut Arena, run: usize) -> Result<()> {
        let cap = self.cfg.capacity;
        let mut scratch = Vec::with_capacity(cap * COMPRESS_RANGE);
        let mut first_id = 0u32;
        let mut count = 0u32;
        for j in 0..COMPRESS_RANGE {
            let Slot::Live(block) = &self.slots[run + j] else {
                return Err(Error::internal("compressing a partially packed run"));
            };
            if j == 0 {
                first_id = block.first_id();
            }
            count += block.count() as u32;
            scratch.extend_from_slice(block.raw());
        }

        let compressed = compress_bytes(self.cfg.compression, &scratch)?;
        if compressed.len() >= scratch.len() {
            // Compression did not help; leave the run resident.
            return Ok(());
        }
        let crc = crc32fast::hash(&compressed);
        let blob_len = compressed.len();
        let mut blob = arena.allocate(blob_len);
        blob[..blob_len].copy_from_slice(&compressed);

        for j in 0..COMPRESS_RANGE {
            let slot = std::mem::replace(&mut self.slots[run + j], Slot::Packed);
            if let Slot::Live(block) = slot {
                arena.recycle(block.into_buf());
            }
        }
        self.slots[run] = Slot::Compressed(CompressedRun {
            first_id,
            count,
            codec: self.cfg.compression,
            crc,
            blob,
            blob_len,
        });
        self.used -= (cap * COMPRESS_RANGE) as u64;
        self.used += blob_len as u64;
        Ok(())
    }

    fn uncompress_run(&mut self, arena: &mut Arena, run: usize) -> Result<()> {
        let cap = self.cfg.capacity;
        let raw = {
            let Slot::Compressed(r) = &self.slots[run] else {
                return Err(Error::internal("uncompressing a run that is not compressed"));
            };
            let data = &r.blob[..r.blob_len];
            let actual = crc32fast::hash(data);
            if actual != r.crc {
                return Err(Error::CrcMismatch {
                    expected: r.crc,
                    actual,
                });
            }
            decompress_bytes(r.codec, data)?
        };
        if raw.len() != cap * COMPRESS_RANGE {
            return Err(Error::corruption(format!(
                "run {} decompressed to {} bytes, expected {}",
                run,
                raw.len(),
                cap * COMPRESS_RANGE
            )));
        }

        let Slot::Compressed(r) = std::mem::replace(&mut self.slots[run], Slot::Packed) else {
            return Err(Error::internal("compressed run vanished"));
        };
        let blob_len = r.blob_len;
        arena.recycle(r.blob);

        for j in 0..COMPRESS_RANGE {
            let mut buf = arena.allocate(cap);
            buf[..cap].copy_from_slice(&raw[j * cap..(j + 1) * cap]);
            self.slots[run + j] =
                Slot::Live(Block::from_raw(buf, self.cfg.header_len, cap));
        }
        self.used += (cap * COMPRESS_RANGE) as u64;
        self.used -= blob_len as u64;
        Ok(())
    }

    /// Open (or grow) the swap file and request a spill task. A swap-file
    /// failure is logged and leaves the store over its limit.
    fn prepare_spill(&mut self) {
        if self.in_spill || self.write_pos < COMPRESS_RANGE {
            return;
        }
        let size = (self.write_pos * self.cfg.capacity) as u64;
        let reusable = self.swap.as_ref().is_some_and(|s| s.len() >= size);
        if !reusable {
            let path = self
                .cfg
                .root_path
                .join(format!("{}{}.dat", self.cfg.name, self.cfg.shard));
            match SwapFile::create(&path, size, self.cfg.map_window) {
                Ok(swap) => {
                    self.swap = Some(swap);
                }
                Err(err) => {
                    tracing::warn!(
                        store = self.cfg.name,
                        shard = self.cfg.shard,
                        error = %err,
                        "swap file unavailable, staying over the memory limit"
                    );
                    return;
                }
            }
        }
        self.in_spill = true;
        self.spill_cursor = 0;
        self.spill_requested = true;
        tracing::info!(
            store = self.cfg.name,
            shard = self.cfg.shard,
            used = self.used,
            "spill to disk started"
        );
    }

    /// Whether the overflow ladder asked for a spill task since last polled.
    pub fn take_spill_request(&mut self) -> bool {
        std::mem::take(&mut self.spill_requested)
    }

    /// Serialize up to the configured number of runs to the swap file.
    /// Returns true when more work remains and the task should be
    /// re-enqueued.
    pub fn spill_step(&mut self, arena: &mut Arena) -> bool {
        if self.swap.is_none() {
            self.in_spill = false;
            return false;
        }
        let mut spilled = 0;
        while self.spill_cursor + COMPRESS_RANGE <= self.write_pos
            && spilled < self.cfg.spill_runs_per_step
        {
            let run = self.spill_cursor;
            self.spill_cursor += COMPRESS_RANGE;
            if self.swapped_runs.contains(&run) {
                continue;
            }
            match self.spill_run(arena, run) {
                Ok(true) => spilled += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(
                        store = self.cfg.name,
                        shard = self.cfg.shard,
                        run,
                        error = %err,
                        "spill step failed, keeping remaining runs in memory"
                    );
                    self.in_spill = false;
                    return false;
                }
            }
        }

        let more = self.spill_cursor + COMPRESS_RANGE <= self.write_pos;
        if !more {
            self.in_spill = false;
            if let Some(swap) = &self.swap {
                if let Err(err) = swap.flush() {
                    tracing::warn!(store = self.cfg.name, error = %err, "swap flush failed");
                }
            }
            tracing::info!(
                store = self.cfg.name,
                shard = self.cfg.shard,
                used = self.used,
                "spill to disk finished"
            );
        }
        more
    }

    fn spill_run(&mut self, arena: &mut Arena, run: usize) -> Result<bool> {
        let cap = self.cfg.capacity;
        match &self.slots[run] {
            Slot::Packed => Ok(false),
            Slot::Live(_) => {
                let Some(swap) = self.swap.as_mut() else {
                    return Err(Error::internal("spill without swap file"));
                };
                for j in 0..COMPRESS_RANGE {
                    let Slot::Live(block) = &self.slots[run + j] else {
                        return Err(Error::internal("spilling a partially packed run"));
                    };
                    swap.write(((run + j) * cap) as u64, block.raw())?;
                }
                for j in 0..COMPRESS_RANGE {
                    let slot = std::mem::replace(&mut self.slots[run + j], Slot::Packed);
                    if let Slot::Live(block) = slot {
                        arena.recycle(block.into_buf());
                    }
                }
                self.used -= (cap * COMPRESS_RANGE) as u64;
                self.swapped_runs.insert(run);
                Ok(true)
            }
            Slot::Compressed(r) => {
                let raw = {
                    let data = &r.blob[..r.blob_len];
                    let actual = crc32fast::hash(data);
                    if actual != r.crc {
                        tracing::warn!(
                            store = self.cfg.name,
                            run,
                            "skipping spill of a run with a damaged blob"
                        );
                        return Ok(false);
                    }
                    decompress_bytes(r.codec, data)?
                };
                if raw.len() != cap * COMPRESS_RANGE {
                    return Err(Error::corruption("compressed run has a bad raw length"));
                }
                let Some(swap) = self.swap.as_mut() else {
                    return Err(Error::internal("spill without swap file"));
                };
                swap.write((run * cap) as u64, &raw)?;
                let Slot::Compressed(r) = std::mem::replace(&mut self.slots[run], Slot::Packed)
                else {
                    return Err(Error::internal("compressed run vanished"));
                };
                self.used -= r.blob_len as u64;
                arena.recycle(r.blob);
                self.swapped_runs.insert(run);
                Ok(true)
            }
        }
    }

    /// Read a swapped run back into live blocks and drop it from the swap
    /// file's live set.
    fn pull_run(&mut self, arena: &mut Arena, run: usize) -> Result<()> {
        let cap = self.cfg.capacity;
        let Some(swap) = self.swap.as_mut() else {
            return Err(Error::internal("pull without swap file"));
        };
        let mut raw = vec![0u8; cap * COMPRESS_RANGE];
        if !swap.read((run * cap) as u64, &mut raw)? {
            return Err(Error::corruption("swapped run lies beyond the swap region"));
        }
        for j in 0..COMPRESS_RANGE {
            let mut buf = arena.allocate(cap);
            buf[..cap].copy_from_slice(&raw[j * cap..(j + 1) * cap]);
            self.slots[run + j] =
                Slot::Live(Block::from_raw(buf, self.cfg.header_len, cap));
        }
        self.used += (cap * COMPRESS_RANGE) as u64;
        self.swapped_runs.remove(&run);
        Ok(())
    }

    /// Drop everything and start empty. Used instead of cancelling in-flight
    /// overflow work.
    pub fn reset(&mut self, arena: &mut Arena) {
        for slot in self.slots.drain(..) {
            match slot {
                Slot::Live(block) => arena.recycle(block.into_buf()),
                Slot::Compressed(run) => arena.recycle(run.blob),
                Slot::Packed => {}
            }
        }
        if let Some(swap) = self.swap.take() {
            let path = swap.path().to_path_buf();
            drop(swap);
            let _ = std::fs::remove_file(path);
        }
        self.swapped_runs.clear();
        self.in_spill = false;
        self.spill_requested = false;
        self.spill_cursor = 0;
        self.next_id = 1;
        self.used = 0;
        self.new_block(arena);
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            used: self.used,
            blocks: self.slots.len(),
            compressed_runs: self
                .slots
                .iter()
                .filter(|s| matches!(s, Slot::Compressed(_)))
                .count(),
            swapped_runs: self.swapped_runs.len(),
            spill_active: self.in_spill,
        }
    }

    /// Number of runs currently resident on disk. Test hook.
    #[cfg(test)]
    pub fn swapped_run_count(&self) -> usize {
        self.swapped_runs.len()
    }
}

impl std::fmt::Debug for BlockChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockChain")
            .field("name", &self.cfg.name)
            .field("blocks", &self.slots.len())
            .field("write_pos", &self.write_pos)
            .field("next_id", &self.next_id)
            .field("used", &self.used)
            .finish()
    }
}
