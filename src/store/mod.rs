//! Block-structured record storage.
//!
//! Two stores back every shard: [`ArrayStore`] holds fixed-width records
//! (cached rows), [`VarStore`] holds strings and blobs. Both are built on the
//! same block chain with background run compression and disk spill; they
//! differ in header layout, rewrite support and delete-space reuse.

mod block;
mod chain;

pub mod array;
pub mod var;

pub use array::{ArrayStore, RecordMut, RecordRef};
pub use var::VarStore;

use crate::error::{Error, Result};
use crate::options::Compression;

/// Snapshot of one store's memory state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    /// Bytes charged against the store's memory limits.
    pub used: u64,
    /// Block slots in the chain (live or not).
    pub blocks: usize,
    /// Runs currently held as compressed blobs.
    pub compressed_runs: usize,
    /// Runs currently resident in the swap file.
    pub swapped_runs: usize,
    /// Whether a spill task is in flight.
    pub spill_active: bool,
}

/// The storage context a shard threads through row operations: its arena
/// plus both record stores.
pub struct StoreCtx<'a> {
    pub arena: &'a mut crate::arena::Arena,
    pub array: &'a mut ArrayStore,
    pub var: &'a mut VarStore,
}

/// A value too large for block storage: one dedicated arena allocation,
/// keyed by an id from the store's big-id space.
#[derive(Debug)]
pub(crate) struct BigValue {
    pub buf: crate::arena::ArenaBuf,
    pub len: u32,
}

/// Compress a run image with the configured codec.
pub(crate) fn compress_bytes(codec: Compression, data: &[u8]) -> Result<Vec<u8>> {
    match codec {
        Compression::None => Ok(data.to_vec()),
        Compression::Snappy => snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(|e| Error::Internal(format!("snappy compression failed: {}", e))),
        Compression::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
    }
}

/// Invert [`compress_bytes`].
pub(crate) fn decompress_bytes(codec: Compression, data: &[u8]) -> Result<Vec<u8>> {
    match codec {
        Compression::None => Ok(data.to_vec()),
        Compression::Snappy => snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| Error::corruption(format!("snappy decompression failed: {}", e))),
        Compression::Lz4 => lz4_flex::decompress_size_prepended(data)
            .map_err(|e| Error::corruption(format!("lz4 decompression failed: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_round_trip() {
        let data: Vec<u8> = (0..4096).map(|i| (i % 13) as u8).collect();
        for codec in [Compression::None, Compression::Snappy, Compression::Lz4] {
            let packed = compress_bytes(codec, &data).unwrap();
            let unpacked = decompress_bytes(codec, &packed).unwrap();
            assert_eq!(unpacked, data, "codec {:?}", codec);
        }
    }

    #[test]
    fn test_corrupt_input_is_an_error() {
        let garbage = vec![0xFFu8; 64];
        assert!(decompress_bytes(Compression::Snappy, &garbage).is_err());
        assert!(decompress_bytes(Compression::Lz4, &garbage[..3]).is_err());
    }
}
