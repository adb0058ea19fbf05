//! Per-shard collection of cached table instances.
//!
//! Instances are appended into an id-indexed slot sequence. On top of the
//! instances' own storage in the record stores, the container runs its own
//! memory policy: crossing the soft table-memory limit serializes and
//! compresses whole runs of instances; crossing the hard limit evicts the
//! coldest runs (by visit count) until usage halves, sparing the run that
//! holds the most recently touched instance.

use bytes::{BufMut, BytesMut};

use crate::arena::{Arena, ArenaBuf};
use crate::error::{Error, Result};
use crate::options::{Compression, Options, COMPRESS_RANGE};
use crate::store::{compress_bytes, decompress_bytes};
use crate::table::cached::CachedTable;
use crate::table::schema::TableKind;
use crate::value::Value;

/// Marker byte for a removed slot inside a serialized run.
const SLOT_REMOVED: u8 = 0xFF;

/// Marker byte for a present table inside a serialized run.
const SLOT_PRESENT: u8 = 1;

/// One instance slot.
#[derive(Debug)]
enum TableSlot {
    Live(CachedTable),
    /// Removed or evicted; the id is never reused.
    Removed,
    /// Serialized into the owning run's blob.
    Packed,
}

/// Per-run state: visit counter plus the optional compressed image.
#[derive(Debug, Default)]
struct RunInfo {
    visits: u32,
    blob: Option<RunBlob>,
}

#[derive(Debug)]
struct RunBlob {
    codec: Compression,
    crc: u32,
    data: ArenaBuf,
    len: usize,
    /// Memory the packed instances were charging when serialized.
    packed_used: u64,
}

pub struct TableContainer {
    shard: usize,
    memory_limit: u64,
    push_limit: u64,
    compression: Compression,
    slots: Vec<TableSlot>,
    runs: Vec<RunInfo>,
    last_id: u32,
    used: u64,
}

impl TableContainer {
    pub fn new(opts: &Options, shard: usize) -> Self {
        Self {
            shard,
            memory_limit: opts.table_memory_limit,
            push_limit: opts.table_push_limit,
            compression: opts.compression,
            slots: Vec::new(),
            runs: Vec::new(),
            last_id: 0,
            used: 0,
        }
    }

    /// Create a fresh instance and return its id.
    pub fn new_table(&mut self, kind: TableKind, schema_id: u32, params: Vec<Value>) -> u32 {
        let id = self.slots.len() as u32;
        self.slots
            .push(TableSlot::Live(CachedTable::new(kind, schema_id, params)));
        if id as usize % COMPRESS_RANGE == 0 {
            self.runs.push(RunInfo {
                visits: 1,
                blob: None,
            });
        }
        self.last_id = id;
        id
    }

    /// Fetch an instance, transparently decompressing its run and bumping
    /// the run's visit counter. Removed and evicted ids return `None`.
    pub fn get_table(&mut self, arena: &mut Arena, id: u32) -> Result<Option<&mut CachedTable>> {
        if id as usize >= self.slots.len() {
            return Ok(None);
        }
        self.last_id = id;
        let run = id as usize / COMPRESS_RANGE;
        self.runs[run].visits += 1;
        if self.runs[run].blob.is_some() {
            self.uncompress_run(arena, run)?;
        }
        Ok(match &mut self.slots[id as usize] {
            TableSlot::Live(table) => Some(table),
            _ => None,
        })
    }

    /// Detach an instance. The caller owns releasing its records.
    pub fn remove_table(&mut self, arena: &mut Arena, id: u32) -> Result<Option<CachedTable>> {
        if id as usize >= self.slots.len() {
            return Ok(None);
        }
        let run = id as usize / COMPRESS_RANGE;
        if self.runs[run].blob.is_some() {
            self.uncompress_run(arena, run)?;
        }
        match std::mem::replace(&mut self.slots[id as usize], TableSlot::Removed) {
            TableSlot::Live(table) => {
                self.used = self.used.saturating_sub(table.memory_used());
                Ok(Some(table))
            }
            other => {
                self.slots[id as usize] = other;
                Ok(None)
            }
        }
    }

    /// Charge (or credit) table memory and run the overflow ladder.
    pub fn add_memory_used(&mut self, arena: &mut Arena, delta: i64) {
        if delta >= 0 {
            self.used += delta as u64;
        } else {
            self.used = self.used.saturating_sub((-delta) as u64);
        }
        if self.used > self.memory_limit {
            tracing::debug!(
                shard = self.shard,
                used = self.used,
                limit = self.memory_limit,
                "table memory limit crossed, compressing cold runs"
            );
            self.compress_runs(arena);
            if self.used > self.push_limit {
                self.evict_runs(arena);
            }
        }
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    /// Total slots ever created (including removed ones).
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Drop every instance. Record storage is reclaimed by the shard-level
    /// reset that accompanies this.
    pub fn reset(&mut self, arena: &mut Arena) {
        for run in &mut self.runs {
            if let Some(blob) = run.blob.take() {
                arena.recycle(blob.data);
            }
        }
        self.slots.clear();
        self.runs.clear();
        self.last_id = 0;
        self.used = 0;
    }

    /// Serialize and compress every full run without a blob yet. The
    /// incomplete tail run stays live.
    fn compress_runs(&mut self, arena: &mut Arena) {
        if !self.compression.is_enabled() {
            return;
        }
        for run in 0..self.runs.len() {
            let start = run * COMPRESS_RANGE;
            if start + COMPRESS_RANGE > self.slots.len() {
                break;
            }
            if self.runs[run].blob.is_some() {
                continue;
            }
            if let Err(err) = self.compress_run(arena, run) {
                tracing::warn!(
                    shard = self.shard,
                    run,
                    error = %err,
                    "table run compression failed"
                );
            }
        }
    }

    fn compress_run(&mut self, arena: &mut Arena, run: usize) -> Result<()> {
        let start = run * COMPRESS_RANGE;
        let mut buf = BytesMut::new();
        let mut packed_used = 0u64;
        for i in start..start + COMPRESS_RANGE {
            match &self.slots[i] {
                TableSlot::Live(table) => {
                    buf.put_u8(SLOT_PRESENT);
                    packed_used += table.memory_used();
                    table.encode_to(&mut buf);
                }
                TableSlot::Removed => buf.put_u8(SLOT_REMOVED),
                TableSlot::Packed => {
                    return Err(Error::internal("packed slot in an uncompressed run"))
                }
            }
        }

        let compressed = compress_bytes(self.compression, &buf)?;
        let crc = crc32fast::hash(&compressed);
        let len = compressed.len();
        let mut data = arena.allocate(len);
        data[..len].copy_from_slice(&compressed);

        for i in start..start + COMPRESS_RANGE {
            self.slots[i] = TableSlot::Packed;
        }
        self.runs[run].blob = Some(RunBlob {
            codec: self.compression,
            crc,
            data,
            len,
            packed_used,
        });
        self.used = self.used.saturating_sub(packed_used);
        self.used += len as u64;
        Ok(())
    }

    fn uncompress_run(&mut self, arena: &mut Arena, run: usize) -> Result<()> {
        let start = run * COMPRESS_RANGE;
        let raw = {
            let Some(blob) = &self.runs[run].blob else {
                return Err(Error::internal("uncompressing a run without a blob"));
            };
            let data = &blob.data[..blob.len];
            let actual = crc32fast::hash(data);
            if actual != blob.crc {
                return Err(Error::CrcMismatch {
                    expected: blob.crc,
                    actual,
                });
            }
            decompress_bytes(blob.codec, data)?
        };

        let mut restored = 0u64;
        let mut slice: &[u8] = &raw;
        for i in start..start + COMPRESS_RANGE {
            if slice.is_empty() {
                return Err(Error::corruption("serialized run ended early"));
            }
            let marker = slice[0];
            slice = &slice[1..];
            self.slots[i] = match marker {
                SLOT_REMOVED => TableSlot::Removed,
                SLOT_PRESENT => {
                    let table = CachedTable::decode(&mut slice)?;
                    restored += table.memory_used();
                    TableSlot::Live(table)
                }
                other => {
                    return Err(Error::corruption(format!(
                        "unknown slot marker {} in serialized run",
                        other
                    )))
                }
            };
        }

        let blob = self.runs[run]
            .blob
            .take()
            .ok_or_else(|| Error::internal("run blob vanished"))?;
        self.used += restored;
        self.used = self.used.saturating_sub(blob.len as u64);
        arena.recycle(blob.data);
        Ok(())
    }

    /// Free whole runs in ascending visit order until usage halves. The run
    /// holding the most recently touched instance survives; all visit
    /// counters reset afterwards.
    fn evict_runs(&mut self, arena: &mut Arena) {
        let mut order: Vec<usize> = (0..self.runs.len()).collect();
        order.sort_by_key(|&run| self.runs[run].visits);

        let old_used = self.used;
        let protected = self.last_id as usize / COMPRESS_RANGE;
        for run in order {
            if run == protected {
                continue;
            }
            let start = run * COMPRESS_RANGE;
            let end = (start + COMPRESS_RANGE).min(self.slots.len());
            if let Some(blob) = self.runs[run].blob.take() {
                self.used = self.used.saturating_sub(blob.len as u64);
                arena.recycle(blob.data);
                for i in start..end {
                    self.slots[i] = TableSlot::Removed;
                }
            } else {
                for i in start..end {
                    if let TableSlot::Live(table) =
                        std::mem::replace(&mut self.slots[i], TableSlot::Removed)
                    {
                        self.used = self.used.saturating_sub(table.memory_used());
                    }
                }
            }
            if self.used <= old_used / 2 {
                break;
            }
        }

        tracing::info!(
            shard = self.shard,
            before = old_used,
            after = self.used,
            "evicted cold table runs"
        );
        for run in &mut self.runs {
            run.visits = 0;
        }
    }

    /// Number of runs currently held compressed. Test hook.
    #[cfg(test)]
    fn compressed_run_count(&self) -> usize {
        self.runs.iter().filter(|r| r.blob.is_some()).count()
    }
}

impl std::fmt::Debug for TableContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableContainer")
            .field("shard", &self.shard)
            .field("slots", &self.slots.len())
            .field("used", &self.used)
            .finish()
    }
}
