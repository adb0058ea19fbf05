//! # relcache
//!
//! Storage and invalidation engine for a transparent SQL result cache.
//!
//! relcache answers repeated SELECT shapes from an in-process cache and
//! keeps that cache correct as writes arrive, patching affected results
//! incrementally instead of flushing.
//!
//! ## Architecture
//!
//! - **Sharded, lock-free steady state**: a fixed pool of worker threads,
//!   each owning a full copy of the engine (allocator, record stores,
//!   table container, dependency graph).
//! - **Compact storage**: cached rows and variable-length values live in
//!   block-structured, id-addressed stores built on a size-class arena;
//!   cold runs of blocks compress transparently and spill to a
//!   memory-mapped swap file under pressure.
//! - **Precise invalidation**: a field-to-query dependency graph with
//!   predicate indexes maps every write to exactly the cached instances it
//!   affects, and patches them row by row.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use relcache::{Engine, Options, UpdatePayload};
//!
//! let engine = Engine::new(Options::default(), connector_factory)?;
//!
//! // Route a write, apply it upstream, then broadcast the decoded change.
//! let shard = engine.route_write(shape_key);
//! engine.broadcast(&update);
//! ```

// Public modules
pub mod connector;
pub mod error;
pub mod options;
pub mod value;

// Storage engine
pub mod arena;
pub mod store;
pub mod swap;

// Cached tables and invalidation
pub mod graph;
pub mod table;

// Shards and the worker pool
pub mod engine;
pub mod shard;

// Re-export main types for convenience
pub use connector::{Connector, NullConnector};
pub use error::{Error, Result};
pub use options::{Compression, Options};
pub use value::{DataType, Value};

pub use arena::Arena;
pub use store::{ArrayStore, StoreStats, VarStore};
pub use swap::SwapFile;

pub use graph::{CompareOp, Condition, DependencyGraph, PredicateIndex, Relations, SchemaId};
pub use table::{CachedTable, Row, RowSchema, TableContainer, TableKind, TableSchema};

pub use engine::{ConnectorFactory, Engine, UpdateBroadcast};
pub use shard::{RowChange, Shard, ShardStats, StoreKind, UpdatePayload, WriteOp};
