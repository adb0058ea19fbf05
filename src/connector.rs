//! Upstream database access, as consumed by this crate.
//!
//! The real connector (wire protocol, pooling, retries) lives outside this
//! crate; the engine only needs these two calls: populating a freshly
//! missed cached table and re-running join companion lookups while
//! patching.

use crate::error::Result;
use crate::table::cached::Row;
use crate::value::Value;

pub trait Connector: Send {
    /// Run a SELECT with positional parameters, returning rows as
    /// name -> scalar maps.
    fn select(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Run a write statement, returning the affected row count.
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64>;
}

/// A connector that answers every query with no rows. Stands in where the
/// upstream is unreachable or not needed.
#[derive(Debug, Default)]
pub struct NullConnector;

impl Connector for NullConnector {
    fn select(&mut self, _sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
        Ok(Vec::new())
    }

    fn execute(&mut self, _sql: &str, _params: &[Value]) -> Result<u64> {
        Ok(0)
    }
}
