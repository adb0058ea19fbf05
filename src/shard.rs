//! One worker's independent copy of the caching engine.
//!
//! A shard owns its arena, both record stores, the table container and the
//! dependency graph; nothing in its steady-state path takes a lock. The
//! shard also hosts the invalidation driver: given a decoded write, it asks
//! the graph which shapes and instances are affected and patches each one
//! in place, falling back to whole-schema invalidation when a patch cannot
//! be derived.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::arena::Arena;
use crate::connector::Connector;
use crate::error::{Error, Result};
use crate::graph::{Condition, DependencyGraph, Relations, SchemaId};
use crate::options::Options;
use crate::store::{ArrayStore, StoreCtx, StoreStats, VarStore};
use crate::table::cached::Row;
use crate::table::schema::{FieldKey, TableSchema};
use crate::table::TableContainer;
use crate::value::Value;

/// Which record store a spill task targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Array,
    Var,
}

/// The write operation a decoded update describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WriteOp {
    Update = 0,
    Insert = 1,
    Delete = 2,
    /// Unmappable statement: every affected shape is cleared outright.
    All = 3,
}

impl WriteOp {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(WriteOp::Update),
            1 => Some(WriteOp::Insert),
            2 => Some(WriteOp::Delete),
            3 => Some(WriteOp::All),
            _ => None,
        }
    }
}

/// One changed base row: its new state, plus the pre-update values of the
/// changed columns (empty for inserts and deletes).
#[derive(Debug, Clone, Default)]
pub struct RowChange {
    pub values: Row,
    pub previous: Row,
}

impl RowChange {
    pub fn new(values: Row) -> Self {
        Self {
            values,
            previous: Row::new(),
        }
    }

    pub fn with_previous(values: Row, previous: Row) -> Self {
        Self { values, previous }
    }

    /// The row as it looked before the write.
    fn before(&self) -> Row {
        self.values.merged_with(&self.previous)
    }
}

/// A decoded write, as broadcast to every shard.
#[derive(Debug, Clone)]
pub struct UpdatePayload {
    pub op: WriteOp,
    pub table: String,
    /// Columns the write touched.
    pub changed: Vec<String>,
    pub rows: Vec<RowChange>,
}

impl UpdatePayload {
    /// Serialize for cross-shard broadcast.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(self.op as u8);
        buf.put_u16(self.table.len() as u16);
        buf.put_slice(self.table.as_bytes());
        buf.put_u16(self.changed.len() as u16);
        for column in &self.changed {
            buf.put_u16(column.len() as u16);
            buf.put_slice(column.as_bytes());
        }
        buf.put_u32(self.rows.len() as u32);
        for row in &self.rows {
            row.values.encode_to(&mut buf);
            row.previous.encode_to(&mut buf);
        }
        buf.freeze()
    }

    /// Invert [`UpdatePayload::encode`].
    pub fn decode(mut data: &[u8]) -> Result<Self> {
        let read_str = |data: &mut &[u8]| -> Result<String> {
            if data.len() < 2 {
                return Err(Error::corruption("truncated update payload"));
            }
            let len = data.get_u16() as usize;
            if data.len() < len {
                return Err(Error::corruption("truncated update payload string"));
            }
            let s = std::str::from_utf8(&data[..len])
                .map_err(|_| Error::corruption("update payload string is not utf-8"))?
                .to_string();
            data.advance(len);
            Ok(s)
        };

        if data.is_empty() {
            return Err(Error::corruption("empty update payload"));
        }
        let op = WriteOp::from_byte(data.get_u8())
            .ok_or_else(|| Error::corruption("unknown write operation"))?;
        let table = read_str(&mut data)?;
        if data.len() < 2 {
            return Err(Error::corruption("truncated update payload"));
        }
        let changed_count = data.get_u16() as usize;
        let mut changed = Vec::with_capacity(changed_count);
        for _ in 0..changed_count {
            changed.push(read_str(&mut data)?);
        }
        if data.len() < 4 {
            return Err(Error::corruption("truncated update payload"));
        }
        let row_count = data.get_u32() as usize;
        let mut rows = Vec::with_capacity(row_count);
        for _ in 0..row_count {
            let values = Row::decode(&mut data)?;
            let previous = Row::decode(&mut data)?;
            rows.push(RowChange { values, previous });
        }
        Ok(Self {
            op,
            table,
            changed,
            rows,
        })
    }
}

/// Snapshot of one shard's resource usage.
#[derive(Debug, Clone)]
pub struct ShardStats {
    pub array: StoreStats,
    pub var: StoreStats,
    pub table_memory: u64,
    pub table_slots: usize,
}

pub struct Shard {
    index: usize,
    arena: Arena,
    array: ArrayStore,
    var: VarStore,
    tables: TableContainer,
    graph: DependencyGraph,
}

impl Shard {
    pub fn new(opts: &Options, index: usize) -> Self {
        let mut arena = Arena::new();
        let array = ArrayStore::new(opts, index, &mut arena);
        let var = VarStore::new(opts, index, &mut arena);
        let tables = TableContainer::new(opts, index);
        Self {
            index,
            arena,
            array,
            var,
            tables,
            graph: DependencyGraph::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Register a cached shape: its schema vertex, its field edges and its
    /// WHERE+HAVING condition. Idempotent per shape key.
    pub fn register_schema(
        &mut self,
        schema: Arc<TableSchema>,
        fields: &[(FieldKey, Relations)],
        condition: Option<Condition>,
    ) -> SchemaId {
        let id = self.graph.add_schema_vertex(schema);
        for (key, relations) in fields {
            self.graph.add_edge(key.clone(), id, *relations);
        }
        if let Some(cond) = condition {
            self.graph.set_condition(id, Arc::new(cond));
        }
        id
    }

    /// Materialize a fresh single-table (or group-by) instance from the
    /// rows the connector returned for a miss.
    pub fn cache_instance(
        &mut self,
        schema_id: SchemaId,
        params: Vec<Value>,
        rows: &[Row],
    ) -> Result<u32> {
        let schema = self.graph.schema(schema_id).clone();
        let table_id = self
            .tables
            .new_table(schema.kind(), schema_id, params.clone());

        let delta;
        {
            let Some(table) = self.tables.get_table(&mut self.arena, table_id)? else {
                return Err(Error::internal("fresh instance not addressable"));
            };
            let mut ctx = StoreCtx {
                arena: &mut self.arena,
                array: &mut self.array,
                var: &mut self.var,
            };
            for row in rows {
                match schema.kind() {
                    crate::table::TableKind::ReadOnly => {
                        let Some(layout) = schema.row_schema_any() else {
                            return Err(Error::internal("schema without a row layout"));
                        };
                        table.append_readonly(layout, &mut ctx, row)?;
                    }
                    _ => {
                        table.insert_row(&schema, &mut ctx, row)?;
                    }
                }
            }
            delta = table.memory_used() as i64;
        }
        self.tables.add_memory_used(&mut self.arena, delta);
        self.graph.add_instance(schema_id, params, table_id);
        Ok(table_id)
    }

    /// Materialize a fresh join instance from already-paired rows.
    pub fn cache_join_instance(
        &mut self,
        schema_id: SchemaId,
        params: Vec<Value>,
        pairs: &[(Row, Row)],
    ) -> Result<u32> {
        let schema = self.graph.schema(schema_id).clone();
        let crate::table::schema::Shape::Join { left, .. } = &schema.shape else {
            return Err(Error::internal("cache_join_instance on a non-join shape"));
        };
        let left_table = left.table().to_string();
        let table_id = self
            .tables
            .new_table(schema.kind(), schema_id, params.clone());

        let delta;
        {
            let Some(table) = self.tables.get_table(&mut self.arena, table_id)? else {
                return Err(Error::internal("fresh instance not addressable"));
            };
            let mut ctx = StoreCtx {
                arena: &mut self.arena,
                array: &mut self.array,
                var: &mut self.var,
            };
            for (left_row, right_row) in pairs {
                table.insert_join(
                    &schema,
                    &mut ctx,
                    &left_table,
                    left_row,
                    std::slice::from_ref(right_row),
                )?;
            }
            delta = table.memory_used() as i64;
        }
        self.tables.add_memory_used(&mut self.arena, delta);
        self.graph.add_instance(schema_id, params, table_id);
        Ok(table_id)
    }

    /// Resolve an instance by its exact parameter binding. An instance the
    /// container evicted is forgotten here and reads as a miss.
    pub fn instance(&mut self, schema_id: SchemaId, params: &[Value]) -> Result<Option<u32>> {
        let Some(table_id) = self.graph.find_instance(schema_id, params) else {
            return Ok(None);
        };
        if self.tables.get_table(&mut self.arena, table_id)?.is_none() {
            self.graph.remove_instance(schema_id, params);
            return Ok(None);
        }
        Ok(Some(table_id))
    }

    /// Materialize one row of a cached instance.
    pub fn read_instance_row(
        &mut self,
        schema_id: SchemaId,
        params: &[Value],
        table: &str,
        pk: i64,
    ) -> Result<Option<Row>> {
        let Some(table_id) = self.instance(schema_id, params)? else {
            return Ok(None);
        };
        let schema = self.graph.schema(schema_id).clone();
        let Some(instance) = self.tables.get_table(&mut self.arena, table_id)? else {
            return Ok(None);
        };
        let mut ctx = StoreCtx {
            arena: &mut self.arena,
            array: &mut self.array,
            var: &mut self.var,
        };
        instance.read_row(&schema, &mut ctx, table, pk)
    }

    /// Drop one instance and free its rows.
    pub fn remove_instance(&mut self, schema_id: SchemaId, params: &[Value]) -> Result<()> {
        let Some(table_id) = self.graph.remove_instance(schema_id, params) else {
            return Ok(());
        };
        self.drop_table(schema_id, table_id)
    }

    /// Drop every instance of a shape. The fallback when a write cannot be
    /// patched in.
    pub fn clear_schema(&mut self, schema_id: SchemaId) -> Result<()> {
        let ids = self.graph.clear_instances(schema_id);
        for table_id in ids {
            self.drop_table(schema_id, table_id)?;
        }
        Ok(())
    }

    fn drop_table(&mut self, schema_id: SchemaId, table_id: u32) -> Result<()> {
        let schema = self.graph.schema(schema_id).clone();
        if let Some(mut table) = self.tables.remove_table(&mut self.arena, table_id)? {
            let mut ctx = StoreCtx {
                arena: &mut self.arena,
                array: &mut self.array,
                var: &mut self.var,
            };
            table.release(&schema, &mut ctx)?;
        }
        Ok(())
    }

    /// Apply a decoded write to every affected cached instance.
    pub fn apply_update(
        &mut self,
        upd: &UpdatePayload,
        connector: &mut dyn Connector,
    ) -> Result<()> {
        let changed_keys: Vec<FieldKey> = upd
            .changed
            .iter()
            .map(|column| FieldKey::new(upd.table.clone(), column.clone()))
            .collect();
        let affected = self.graph.find_affected(&changed_keys);

        for (schema_id, relations) in affected {
            let schema = self.graph.schema(schema_id).clone();

            // A patch is only derivable for shapes that key rows by an
            // integer primary key and whose aggregates are untouched.
            let unpatchable = schema.group_by
                || changed_keys
                    .iter()
                    .any(|key| schema.feeds_projected_aggregate(key))
                || schema
                    .row_schema(&upd.table)
                    .map_or(true, |rows| rows.primary_key().is_none());

            if upd.op == WriteOp::All || unpatchable {
                self.clear_schema(schema_id)?;
                continue;
            }

            match upd.op {
                WriteOp::Insert => self.insert_rows(schema_id, &schema, upd, connector)?,
                WriteOp::Delete => self.delete_rows(schema_id, &schema, upd, false)?,
                WriteOp::Update => {
                    if relations.predicate() {
                        // The row may now belong to different instances:
                        // remove it where it used to match, insert it where
                        // it matches now.
                        self.delete_rows(schema_id, &schema, upd, true)?;
                        self.insert_rows(schema_id, &schema, upd, connector)?;
                    } else {
                        self.patch_rows(schema_id, &schema, upd)?;
                    }
                }
                WriteOp::All => unreachable!("handled above"),
            }
        }
        Ok(())
    }

    fn insert_rows(
        &mut self,
        schema_id: SchemaId,
        schema: &Arc<TableSchema>,
        upd: &UpdatePayload,
        connector: &mut dyn Connector,
    ) -> Result<()> {
        let is_join = matches!(schema.shape, crate::table::schema::Shape::Join { .. });
        for change in &upd.rows {
            let row = &change.values;
            for table_id in self.graph.find_instances(schema_id, &upd.table, row) {
                let Some(params) = self.instance_params(schema_id, table_id) else {
                    continue;
                };
                let companions = if is_join {
                    companion_rows(
                        schema,
                        self.graph.condition(schema_id).cloned(),
                        &upd.table,
                        row,
                        &params,
                        connector,
                    )?
                } else {
                    Vec::new()
                };

                let Some(table) = self.tables.get_table(&mut self.arena, table_id)? else {
                    self.graph.remove_instance_by_id(schema_id, table_id);
                    continue;
                };
                let before = table.memory_used() as i64;
                let mut ctx = StoreCtx {
                    arena: &mut self.arena,
                    array: &mut self.array,
                    var: &mut self.var,
                };
                if is_join {
                    table.insert_join(schema, &mut ctx, &upd.table, row, &companions)?;
                } else {
                    table.insert_row(schema, &mut ctx, row)?;
                }
                let delta = table.memory_used() as i64 - before;
                self.tables.add_memory_used(&mut self.arena, delta);
            }
        }
        Ok(())
    }

    fn delete_rows(
        &mut self,
        schema_id: SchemaId,
        schema: &Arc<TableSchema>,
        upd: &UpdatePayload,
        use_before: bool,
    ) -> Result<()> {
        for change in &upd.rows {
            let image = if use_before {
                change.before()
            } else {
                change.values.clone()
            };
            let Some(pk) = schema
                .row_schema(&upd.table)
                .and_then(|rows| crate::table::cached::row_pk(rows, &image))
            else {
                continue;
            };
            for table_id in self.graph.find_instances(schema_id, &upd.table, &image) {
                let Some(table) = self.tables.get_table(&mut self.arena, table_id)? else {
                    self.graph.remove_instance_by_id(schema_id, table_id);
                    continue;
                };
                let before = table.memory_used() as i64;
                let mut ctx = StoreCtx {
                    arena: &mut self.arena,
                    array: &mut self.array,
                    var: &mut self.var,
                };
                table.remove_row(schema, &mut ctx, &upd.table, pk)?;
                let delta = table.memory_used() as i64 - before;
                self.tables.add_memory_used(&mut self.arena, delta);
            }
        }
        Ok(())
    }

    fn patch_rows(
        &mut self,
        schema_id: SchemaId,
        schema: &Arc<TableSchema>,
        upd: &UpdatePayload,
    ) -> Result<()> {
        for change in &upd.rows {
            let row = &change.values;
            for table_id in self.graph.find_instances(schema_id, &upd.table, row) {
                let Some(table) = self.tables.get_table(&mut self.arena, table_id)? else {
                    self.graph.remove_instance_by_id(schema_id, table_id);
                    continue;
                };
                let before = table.memory_used() as i64;
                let mut ctx = StoreCtx {
                    arena: &mut self.arena,
                    array: &mut self.array,
                    var: &mut self.var,
                };
                table.update_row(schema, &mut ctx, &upd.table, row, &upd.changed)?;
                let delta = table.memory_used() as i64 - before;
                self.tables.add_memory_used(&mut self.arena, delta);
            }
        }
        Ok(())
    }

    fn instance_params(&self, schema_id: SchemaId, table_id: u32) -> Option<Vec<Value>> {
        self.graph
            .instances(schema_id)
            .find(|(_, id)| *id == table_id)
            .map(|(params, _)| params.clone())
    }

    /// Stores that asked for a spill task since last polled.
    pub fn take_spill_requests(&mut self) -> Vec<StoreKind> {
        let mut requests = Vec::new();
        if self.array.take_spill_request() {
            requests.push(StoreKind::Array);
        }
        if self.var.take_spill_request() {
            requests.push(StoreKind::Var);
        }
        requests
    }

    /// Run one spill batch for a store; true means re-enqueue the task.
    pub fn spill_step(&mut self, kind: StoreKind) -> bool {
        match kind {
            StoreKind::Array => self.array.spill_step(&mut self.arena),
            StoreKind::Var => self.var.spill_step(&mut self.arena),
        }
    }

    /// Drop the whole shard's structures and start empty. Used instead of
    /// cancelling in-flight overflow work.
    pub fn reset(&mut self) {
        self.tables.reset(&mut self.arena);
        self.array.reset(&mut self.arena);
        self.var.reset(&mut self.arena);
        self.graph = DependencyGraph::new();
    }

    pub fn stats(&self) -> ShardStats {
        ShardStats {
            array: self.array.stats(),
            var: self.var.stats(),
            table_memory: self.tables.used(),
            table_slots: self.tables.slot_count(),
        }
    }
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("index", &self.index)
            .field("tables", &self.tables)
            .field("graph", &self.graph)
            .finish()
    }
}

/// Fetch the companion-side rows a join instance needs for an inserted
/// base row, by re-running the join condition against the source.
fn companion_rows(
    schema: &Arc<TableSchema>,
    condition: Option<Arc<Condition>>,
    table: &str,
    row: &Row,
    params: &[Value],
    connector: &mut dyn Connector,
) -> Result<Vec<Row>> {
    let Some(companion) = schema.companion_schema(table) else {
        return Ok(Vec::new());
    };

    let mut sql = String::from("SELECT ");
    for (i, field) in companion.fields().iter().enumerate() {
        if i > 0 {
            sql.push(',');
        }
        sql.push_str(&field.name);
    }
    sql.push_str(" FROM ");
    sql.push_str(companion.table());

    let mut args = Vec::new();
    if let Some(cond) = condition {
        sql.push_str(" WHERE ");
        cond.to_companion_sql(table, row, params, &mut sql, &mut args);
    }
    connector.select(&sql, &args)
}
