//! Cached query-result tables.

pub mod cached;
pub mod container;
pub mod schema;

pub use cached::{CachedTable, Row};
pub use container::TableContainer;
pub use schema::{
    AggregateField, AggregateFunction, FieldKey, FieldSchema, OrderDirection, OrderField,
    RowSchema, Shape, TableKind, TableSchema,
};
