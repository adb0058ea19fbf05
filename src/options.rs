//! Configuration options for relcache.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Number of regular arena size classes (2^3 .. 2^16 bytes).
pub const ARENA_CLASS_COUNT: usize = 14;

/// Smallest arena class, as a power of two.
pub const ARENA_MIN_POWER: u32 = 3;

/// Largest regular arena allocation (64KB).
pub const ARENA_MAX_REGULAR: usize = 1 << 16;

/// Nodes added to a class free list per refill.
pub const ARENA_SLAB_NODES: usize = 256;

/// Blocks per compressed run.
pub const COMPRESS_RANGE: usize = 128;

/// Default block capacity (64KB).
pub const DEFAULT_BLOCK_CAPACITY: usize = 64 * 1024;

/// Default soft memory limit per store (1GB).
pub const DEFAULT_MEMORY_LIMIT: u64 = 1 << 30;

/// Default hard (push-to-disk) limit per store (2GB).
pub const DEFAULT_PUSH_LIMIT: u64 = 2 << 30;

/// Default freed-bytes threshold before an array block is registered for reuse.
pub const DEFAULT_REUSE_BYTE_LIMIT: usize = 4096;

/// Default number of runs serialized per spill-task invocation.
pub const DEFAULT_SPILL_RUNS_PER_STEP: usize = 8;

/// Default swap-file mapping window (1GB).
pub const DEFAULT_MAP_WINDOW: u64 = 1 << 30;

/// First id of the var store's big-value space.
pub const VAR_BIG_ID_FLOOR: u32 = 0x8000;

/// First id of the array store's big-value space.
pub const ARRAY_BIG_ID_FLOOR: u32 = 0xA000;

/// The reserved invalid record id.
pub const INVALID_ID: u32 = 0;

/// Compression codec for block runs and container runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// Store runs uncompressed.
    None,
    /// LZ4 compression (fast).
    Lz4,
    /// Snappy compression (very fast).
    #[default]
    Snappy,
}

impl Compression {
    /// Check if compression is enabled.
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Compression::None)
    }

    /// Codec tag byte used in run headers.
    pub fn to_byte(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Lz4 => 1,
            Compression::Snappy => 2,
        }
    }

    /// Decode a codec tag byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Compression::None),
            1 => Some(Compression::Lz4),
            2 => Some(Compression::Snappy),
            _ => None,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Options {
    /// Directory holding per-shard swap files.
    pub root_path: PathBuf,

    /// Number of worker shards.
    pub worker_threads: usize,

    /// Capacity of one store block in bytes.
    pub block_capacity: usize,

    /// Soft memory limit of each array store; crossing it triggers run
    /// compression.
    pub array_memory_limit: u64,

    /// Hard limit of each array store; crossing it after compression starts
    /// a background spill.
    pub array_push_limit: u64,

    /// Soft memory limit of each var store.
    pub var_memory_limit: u64,

    /// Hard limit of each var store.
    pub var_push_limit: u64,

    /// Soft memory limit of each table container.
    pub table_memory_limit: u64,

    /// Hard limit of each table container; crossing it after compression
    /// evicts cold runs.
    pub table_push_limit: u64,

    /// Freed bytes before a written-past array block joins the reuse list.
    pub reuse_byte_limit: usize,

    /// Runs serialized per spill-task invocation.
    pub spill_runs_per_step: usize,

    /// Swap-file mapping window size.
    pub map_window: u64,

    /// Codec for compressed runs.
    pub compression: Compression,

    /// Ceiling on a caller's wait for a shard task slot.
    pub submit_timeout: Duration,

    /// Pending-task count past which write routing probes the next shard.
    pub probe_threshold: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("."),
            worker_threads: 4,
            block_capacity: DEFAULT_BLOCK_CAPACITY,
            array_memory_limit: DEFAULT_MEMORY_LIMIT,
            array_push_limit: DEFAULT_PUSH_LIMIT,
            var_memory_limit: DEFAULT_MEMORY_LIMIT,
            var_push_limit: DEFAULT_PUSH_LIMIT,
            table_memory_limit: DEFAULT_MEMORY_LIMIT,
            table_push_limit: DEFAULT_PUSH_LIMIT,
            reuse_byte_limit: DEFAULT_REUSE_BYTE_LIMIT,
            spill_runs_per_step: DEFAULT_SPILL_RUNS_PER_STEP,
            map_window: DEFAULT_MAP_WINDOW,
            compression: Compression::default(),
            submit_timeout: Duration::from_secs(10),
            probe_threshold: 64,
        }
    }
}

impl Options {
    /// Create options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(Error::InvalidConfiguration(
                "worker_threads must be at least 1".into(),
            ));
        }
        if self.block_capacity < 64 {
            return Err(Error::InvalidConfiguration(
                "block_capacity must be at least 64 bytes".into(),
            ));
        }
        if self.block_capacity > ARENA_MAX_REGULAR {
            return Err(Error::InvalidConfiguration(format!(
                "block_capacity {} exceeds the largest arena class {}",
                self.block_capacity, ARENA_MAX_REGULAR
            )));
        }
        if self.array_push_limit < self.array_memory_limit
            || self.var_push_limit < self.var_memory_limit
            || self.table_push_limit < self.table_memory_limit
        {
            return Err(Error::InvalidConfiguration(
                "push limits must not be below the matching memory limits".into(),
            ));
        }
        if self.spill_runs_per_step == 0 {
            return Err(Error::InvalidConfiguration(
                "spill_runs_per_step must be at least 1".into(),
            ));
        }
        if self.map_window == 0 || self.map_window % 4096 != 0 {
            return Err(Error::InvalidConfiguration(
                "map_window must be a positive multiple of 4096".into(),
            ));
        }
        Ok(())
    }
}
