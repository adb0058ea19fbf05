//! Cached table instances.
//!
//! A `CachedTable` is the materialized result of one query shape bound to
//! one parameter tuple. Row data lives in the shard's record stores; the
//! instance itself only keeps id maps, so serializing an instance for
//! container compression is cheap.

use std::collections::{HashMap, HashSet};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::options::INVALID_ID;
use crate::store::StoreCtx;
use crate::value::{DataType, Value};

use super::schema::{RowSchema, TableKind, TableSchema};

/// A base-table row as a name -> scalar map, the way the connector and the
/// update decoder deliver rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    values: HashMap<String, Value>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.values.insert(column.into(), value.into());
        self
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    pub fn value_or_null(&self, column: &str) -> Value {
        self.values.get(column).cloned().unwrap_or(Value::Null)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn columns(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// This row with `overrides` applied on top, used to reconstruct the
    /// pre-update image of a changed row.
    pub fn merged_with(&self, overrides: &Row) -> Row {
        let mut merged = self.clone();
        for (column, value) in &overrides.values {
            merged.values.insert(column.clone(), value.clone());
        }
        merged
    }

    /// Serialize for the cross-shard update payload.
    pub fn encode_to(&self, buf: &mut BytesMut) {
        buf.put_u16(self.values.len() as u16);
        for (column, value) in &self.values {
            buf.put_u16(column.len() as u16);
            buf.put_slice(column.as_bytes());
            value.encode_to(buf);
        }
    }

    /// Invert [`Row::encode_to`].
    pub fn decode(data: &mut &[u8]) -> Result<Row> {
        if data.len() < 2 {
            return Err(Error::corruption("truncated row"));
        }
        let count = data.get_u16() as usize;
        let mut row = Row::new();
        for _ in 0..count {
            if data.len() < 2 {
                return Err(Error::corruption("truncated row column"));
            }
            let len = data.get_u16() as usize;
            if data.len() < len {
                return Err(Error::corruption("truncated column name"));
            }
            let column = std::str::from_utf8(&data[..len])
                .map_err(|_| Error::corruption("column name is not utf-8"))?
                .to_string();
            data.advance(len);
            let value = Value::decode(data)?;
            row.values.insert(column, value);
        }
        Ok(row)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Row {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut row = Row::new();
        for (k, v) in iter {
            row.set(k, v);
        }
        row
    }
}

/// Extract the integer primary key of `row` under `rows`' layout.
pub(crate) fn row_pk(rows: &RowSchema, row: &Row) -> Option<i64> {
    let pk = rows.primary_key()?;
    row.get(&pk.name)?.as_i64()
}

/// Write `row` as a fresh array-store record. Returns the record id and the
/// bytes charged against the table (record plus var payloads).
pub(crate) fn write_row_record(
    ctx: &mut StoreCtx<'_>,
    rows: &RowSchema,
    row: &Row,
) -> Result<(u32, u64)> {
    let mut cost = rows.record_len() as u64;

    // Var payloads first, so the record write below is one borrow.
    let mut var_ids = vec![INVALID_ID; rows.field_count()];
    for i in 0..rows.field_count() {
        let field = rows.field(i);
        if !field.data_type.is_var() {
            continue;
        }
        match row.get(&field.name) {
            Some(Value::Str(s)) => {
                var_ids[i] = ctx.var.set(ctx.arena, s.as_bytes())?;
                cost += s.len() as u64;
            }
            Some(Value::Blob(b)) => {
                var_ids[i] = ctx.var.set(ctx.arena, b)?;
                cost += b.len() as u64;
            }
            _ => {}
        }
    }

    let record_id = ctx.array.allocate(ctx.arena, rows.record_len())?;
    let mut rec = ctx
        .array
        .record_mut(ctx.arena, record_id)?
        .ok_or_else(|| Error::internal("fresh record not readable"))?;

    for i in 0..rows.field_count() {
        let field = rows.field(i);
        let offset = rows.offset(i);
        let value = row.value_or_null(&field.name);
        if value.is_null() {
            let (byte, bit) = rows.null_bit(i);
            rec.set_bit(byte, bit, true);
            continue;
        }
        match field.data_type {
            DataType::Bool => rec.set_u8(offset, value.as_i64().unwrap_or(0) as u8),
            DataType::Int8 => rec.set_i8(offset, value.as_i64().unwrap_or(0) as i8),
            DataType::Int16 => rec.set_i16(offset, value.as_i64().unwrap_or(0) as i16),
            DataType::Int32 => rec.set_i32(offset, value.as_i64().unwrap_or(0) as i32),
            DataType::Int64 => rec.set_i64(offset, value.as_i64().unwrap_or(0)),
            DataType::UInt8 => rec.set_u8(offset, value.as_i64().unwrap_or(0) as u8),
            DataType::UInt16 => rec.set_u16(offset, value.as_i64().unwrap_or(0) as u16),
            DataType::UInt32 => rec.set_u32(offset, value.as_i64().unwrap_or(0) as u32),
            DataType::UInt64 => rec.set_u64(offset, value.as_int().unwrap_or(0) as u64),
            DataType::Float32 => rec.set_f32(offset, value.as_f64().unwrap_or(0.0) as f32),
            DataType::Float64 => rec.set_f64(offset, value.as_f64().unwrap_or(0.0)),
            DataType::Str | DataType::Blob => rec.set_u32(offset, var_ids[i]),
        }
    }

    Ok((record_id, cost))
}

/// Materialize the record at `record_id` back into a [`Row`].
pub(crate) fn read_row_record(
    ctx: &mut StoreCtx<'_>,
    rows: &RowSchema,
    record_id: u32,
) -> Result<Option<Row>> {
    struct Pending {
        index: usize,
        var_id: u32,
    }

    let mut row = Row::new();
    let mut pending = Vec::new();
    {
        let Some(rec) = ctx.array.record(ctx.arena, record_id)? else {
            return Ok(None);
        };
        for i in 0..rows.field_count() {
            let field = rows.field(i);
            let offset = rows.offset(i);
            let (byte, bit) = rows.null_bit(i);
            if rec.get_bit(byte, bit) {
                row.set(field.name.clone(), Value::Null);
                continue;
            }
            let value = match field.data_type {
                DataType::Bool => Value::Bool(rec.get_u8(offset) != 0),
                DataType::Int8 => Value::I8(rec.get_i8(offset)),
                DataType::Int16 => Value::I16(rec.get_i16(offset)),
                DataType::Int32 => Value::I32(rec.get_i32(offset)),
                DataType::Int64 => Value::I64(rec.get_i64(offset)),
                DataType::UInt8 => Value::U8(rec.get_u8(offset)),
                DataType::UInt16 => Value::U16(rec.get_u16(offset)),
                DataType::UInt32 => Value::U32(rec.get_u32(offset)),
                DataType::UInt64 => Value::U64(rec.get_u64(offset)),
                DataType::Float32 => Value::F32(rec.get_f32(offset)),
                DataType::Float64 => Value::F64(rec.get_f64(offset)),
                DataType::Str | DataType::Blob => {
                    pending.push(Pending {
                        index: i,
                        var_id: rec.get_u32(offset),
                    });
                    continue;
                }
            };
            row.set(field.name.clone(), value);
        }
    }

    for p in pending {
        let field = rows.field(p.index);
        let value = if p.var_id == INVALID_ID {
            Value::Null
        } else {
            match ctx.var.get(ctx.arena, p.var_id)? {
                Some(bytes) if field.data_type == DataType::Str => Value::Str(
                    String::from_utf8(bytes.to_vec())
                        .map_err(|_| Error::corruption("cached string is not utf-8"))?,
                ),
                Some(bytes) => Value::Blob(bytes),
                None => Value::Null,
            }
        };
        row.set(field.name.clone(), value);
    }
    Ok(Some(row))
}

/// Patch the listed columns of an existing record in place. Var fields may
/// relocate; the record keeps the id returned by the var store.
pub(crate) fn update_row_record(
    ctx: &mut StoreCtx<'_>,
    rows: &RowSchema,
    record_id: u32,
    row: &Row,
    changed: &[String],
) -> Result<i64> {
    struct VarPatch {
        index: usize,
        old_id: u32,
        new_id: u32,
    }

    // Phase 1: read the old var ids of the changed var columns.
    let mut old_ids = HashMap::new();
    {
        let Some(rec) = ctx.array.record(ctx.arena, record_id)? else {
            return Ok(0);
        };
        for column in changed {
            let Some(i) = rows.field_index(column) else {
                continue;
            };
            if rows.field(i).data_type.is_var() {
                let (byte, bit) = rows.null_bit(i);
                let old = if rec.get_bit(byte, bit) {
                    INVALID_ID
                } else {
                    rec.get_u32(rows.offset(i))
                };
                old_ids.insert(i, old);
            }
        }
    }

    // Phase 2: run the var-store writes.
    let mut delta = 0i64;
    let mut patches = Vec::new();
    for (&i, &old_id) in &old_ids {
        let field = rows.field(i);
        let value = row.value_or_null(&field.name);
        let payload: Option<Bytes> = match &value {
            Value::Str(s) => Some(Bytes::copy_from_slice(s.as_bytes())),
            Value::Blob(b) => Some(b.clone()),
            _ => None,
        };
        let new_id = match payload {
            None => {
                if old_id != INVALID_ID {
                    if let Some(old) = ctx.var.get(ctx.arena, old_id)? {
                        delta -= old.len() as i64;
                    }
                    ctx.var.clear(ctx.arena, old_id)?;
                }
                INVALID_ID
            }
            Some(bytes) => {
                if old_id == INVALID_ID {
                    delta += bytes.len() as i64;
                    ctx.var.set(ctx.arena, &bytes)?
                } else {
                    if let Some(old) = ctx.var.get(ctx.arena, old_id)? {
                        delta -= old.len() as i64;
                    }
                    delta += bytes.len() as i64;
                    match ctx.var.rewrite(ctx.arena, old_id, &bytes)? {
                        Some(id) => id,
                        None => ctx.var.set(ctx.arena, &bytes)?,
                    }
                }
            }
        };
        patches.push(VarPatch {
            index: i,
            old_id,
            new_id,
        });
    }

    // Phase 3: write the fixed fields and the surviving var ids.
    let Some(mut rec) = ctx.array.record_mut(ctx.arena, record_id)? else {
        return Ok(delta);
    };
    for column in changed {
        let Some(i) = rows.field_index(column) else {
            continue;
        };
        let field = rows.field(i);
        if field.data_type.is_var() {
            continue;
        }
        let offset = rows.offset(i);
        let (byte, bit) = rows.null_bit(i);
        let value = row.value_or_null(&field.name);
        if value.is_null() {
            rec.set_bit(byte, bit, true);
            continue;
        }
        rec.set_bit(byte, bit, false);
        match field.data_type {
            DataType::Bool => rec.set_u8(offset, value.as_i64().unwrap_or(0) as u8),
            DataType::Int8 => rec.set_i8(offset, value.as_i64().unwrap_or(0) as i8),
            DataType::Int16 => rec.set_i16(offset, value.as_i64().unwrap_or(0) as i16),
            DataType::Int32 => rec.set_i32(offset, value.as_i64().unwrap_or(0) as i32),
            DataType::Int64 => rec.set_i64(offset, value.as_i64().unwrap_or(0)),
            DataType::UInt8 => rec.set_u8(offset, value.as_i64().unwrap_or(0) as u8),
            DataType::UInt16 => rec.set_u16(offset, value.as_i64().unwrap_or(0) as u16),
            DataType::UInt32 => rec.set_u32(offset, value.as_i64().unwrap_or(0) as u32),
            DataType::UInt64 => rec.set_u64(offset, value.as_int().unwrap_or(0) as u64),
            DataType::Float32 => rec.set_f32(offset, value.as_f64().unwrap_or(0.0) as f32),
            DataType::Float64 => rec.set_f64(offset, value.as_f64().unwrap_or(0.0)),
            DataType::Str | DataType::Blob => {}
        }
    }
    for patch in &patches {
        let offset = rows.offset(patch.index);
        let (byte, bit) = rows.null_bit(patch.index);
        rec.set_bit(byte, bit, patch.new_id == INVALID_ID);
        if patch.new_id != patch.old_id || patch.new_id == INVALID_ID {
            rec.set_u32(offset, patch.new_id);
        }
    }

    Ok(delta)
}

/// Free a record and the var values it references. Returns the bytes freed.
pub(crate) fn release_row_record(
    ctx: &mut StoreCtx<'_>,
    rows: &RowSchema,
    record_id: u32,
) -> Result<u64> {
    let mut var_ids = Vec::new();
    {
        let Some(rec) = ctx.array.record(ctx.arena, record_id)? else {
            return Ok(0);
        };
        for i in 0..rows.field_count() {
            if !rows.field(i).data_type.is_var() {
                continue;
            }
            let (byte, bit) = rows.null_bit(i);
            if !rec.get_bit(byte, bit) {
                let id = rec.get_u32(rows.offset(i));
                if id != INVALID_ID {
                    var_ids.push(id);
                }
            }
        }
    }

    let mut freed = rows.record_len() as u64;
    for id in var_ids {
        if let Some(bytes) = ctx.var.get(ctx.arena, id)? {
            freed += bytes.len() as u64;
        }
        ctx.var.clear(ctx.arena, id)?;
    }
    ctx.array.recycle(ctx.arena, record_id)?;
    Ok(freed)
}

/// Primary-key keyed row ids of one side of an instance.
#[derive(Debug, Default, Clone)]
struct RowSet {
    rows: HashMap<i64, u32>,
}

impl RowSet {
    fn encode_to(&self, buf: &mut BytesMut) {
        buf.put_u32(self.rows.len() as u32);
        for (pk, id) in &self.rows {
            buf.put_i64(*pk);
            buf.put_u32(*id);
        }
    }

    fn decode(data: &mut &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::corruption("truncated row set"));
        }
        let count = data.get_u32() as usize;
        let mut rows = HashMap::with_capacity(count);
        for _ in 0..count {
            if data.len() < 12 {
                return Err(Error::corruption("truncated row set entry"));
            }
            let pk = data.get_i64();
            let id = data.get_u32();
            rows.insert(pk, id);
        }
        Ok(Self { rows })
    }
}

/// Join pair bookkeeping: which left pks match which right pks.
#[derive(Debug, Default, Clone)]
struct JoinBody {
    left: RowSet,
    right: RowSet,
    left_pairs: HashMap<i64, HashSet<i64>>,
    right_pairs: HashMap<i64, HashSet<i64>>,
}

impl JoinBody {
    fn pair_count(&self) -> usize {
        self.left_pairs.values().map(|s| s.len()).sum()
    }
}

/// Body of an instance, by kind.
#[derive(Debug, Clone)]
enum TableBody {
    Normal(RowSet),
    Join(JoinBody),
    /// Group-by results: plain record ids, never patched.
    ReadOnly(Vec<u32>),
}

/// One cached query result, bound to one parameter tuple.
#[derive(Debug, Clone)]
pub struct CachedTable {
    schema_id: u32,
    params: Vec<Value>,
    body: TableBody,
    used: u64,
}

impl CachedTable {
    pub fn new(kind: TableKind, schema_id: u32, params: Vec<Value>) -> Self {
        let body = match kind {
            TableKind::Normal => TableBody::Normal(RowSet::default()),
            TableKind::Join => TableBody::Join(JoinBody::default()),
            TableKind::ReadOnly => TableBody::ReadOnly(Vec::new()),
        };
        Self {
            schema_id,
            params,
            body,
            used: 0,
        }
    }

    pub fn schema_id(&self) -> u32 {
        self.schema_id
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub fn kind(&self) -> TableKind {
        match self.body {
            TableBody::Normal(_) => TableKind::Normal,
            TableBody::Join(_) => TableKind::Join,
            TableBody::ReadOnly(_) => TableKind::ReadOnly,
        }
    }

    /// Bytes this instance charges against the container.
    pub fn memory_used(&self) -> u64 {
        self.used
    }

    pub fn row_count(&self) -> usize {
        match &self.body {
            TableBody::Normal(set) => set.rows.len(),
            TableBody::Join(join) => join.pair_count(),
            TableBody::ReadOnly(ids) => ids.len(),
        }
    }

    pub fn contains_pk(&self, table_is_left: bool, pk: i64) -> bool {
        match &self.body {
            TableBody::Normal(set) => set.rows.contains_key(&pk),
            TableBody::Join(join) => {
                if table_is_left {
                    join.left.rows.contains_key(&pk)
                } else {
                    join.right.rows.contains_key(&pk)
                }
            }
            TableBody::ReadOnly(_) => false,
        }
    }

    /// Insert (or replace) a row in a single-table instance.
    pub fn insert_row(
        &mut self,
        schema: &TableSchema,
        ctx: &mut StoreCtx<'_>,
        row: &Row,
    ) -> Result<bool> {
        let TableBody::Normal(_) = &self.body else {
            return Err(Error::internal("insert_row on a non-normal instance"));
        };
        let Some(rows) = schema.row_schema_any() else {
            return Err(Error::internal("normal schema without a row layout"));
        };
        let rows = rows.clone();
        let Some(pk) = row_pk(&rows, row) else {
            return Ok(false);
        };
        if self.contains_pk(true, pk) {
            self.remove_row(schema, ctx, rows.table(), pk)?;
        }
        let (record_id, cost) = write_row_record(ctx, &rows, row)?;
        if let TableBody::Normal(set) = &mut self.body {
            set.rows.insert(pk, record_id);
        }
        self.used += cost;
        Ok(true)
    }

    /// Append a result row to a group-by instance during population.
    pub fn append_readonly(
        &mut self,
        rows: &RowSchema,
        ctx: &mut StoreCtx<'_>,
        row: &Row,
    ) -> Result<()> {
        let TableBody::ReadOnly(_) = &self.body else {
            return Err(Error::internal("append_readonly on a writable instance"));
        };
        let (record_id, cost) = write_row_record(ctx, rows, row)?;
        if let TableBody::ReadOnly(ids) = &mut self.body {
            ids.push(record_id);
        }
        self.used += cost;
        Ok(())
    }

    /// Insert a base row plus its companion rows into a join instance.
    pub fn insert_join(
        &mut self,
        schema: &TableSchema,
        ctx: &mut StoreCtx<'_>,
        table: &str,
        row: &Row,
        companions: &[Row],
    ) -> Result<bool> {
        let Some(side_schema) = schema.row_schema(table) else {
            return Ok(false);
        };
        let side_schema = side_schema.clone();
        let Some(comp_schema) = schema.companion_schema(table).cloned() else {
            return Err(Error::internal("join schema without a companion side"));
        };
        let is_left = matches!(&schema.shape, super::schema::Shape::Join { left, .. }
            if left.table() == table);

        let Some(pk) = row_pk(&side_schema, row) else {
            return Ok(false);
        };
        if companions.is_empty() {
            return Ok(false);
        }

        let mut cost = 0u64;
        let TableBody::Join(join) = &mut self.body else {
            return Err(Error::internal("insert_join on a non-join instance"));
        };
        let (own, other, own_pairs, other_pairs) = if is_left {
            (
                &mut join.left,
                &mut join.right,
                &mut join.left_pairs,
                &mut join.right_pairs,
            )
        } else {
            (
                &mut join.right,
                &mut join.left,
                &mut join.right_pairs,
                &mut join.left_pairs,
            )
        };

        if !own.rows.contains_key(&pk) {
            let (record_id, c) = write_row_record(ctx, &side_schema, row)?;
            own.rows.insert(pk, record_id);
            cost += c;
        }
        for companion in companions {
            let Some(comp_pk) = row_pk(&comp_schema, companion) else {
                continue;
            };
            if !other.rows.contains_key(&comp_pk) {
                let (record_id, c) = write_row_record(ctx, &comp_schema, companion)?;
                other.rows.insert(comp_pk, record_id);
                cost += c;
            }
            own_pairs.entry(pk).or_default().insert(comp_pk);
            other_pairs.entry(comp_pk).or_default().insert(pk);
        }
        self.used += cost;
        Ok(true)
    }

    /// Remove the row of `table` keyed by `pk`. Join instances drop the
    /// pairs through it and any companion row left without a pair.
    pub fn remove_row(
        &mut self,
        schema: &TableSchema,
        ctx: &mut StoreCtx<'_>,
        table: &str,
        pk: i64,
    ) -> Result<bool> {
        match &mut self.body {
            TableBody::Normal(set) => {
                let Some(record_id) = set.rows.remove(&pk) else {
                    return Ok(false);
                };
                let Some(rows) = schema.row_schema(table) else {
                    return Err(Error::internal("row layout lost for cached table"));
                };
                let rows = rows.clone();
                let freed = release_row_record(ctx, &rows, record_id)?;
                self.used = self.used.saturating_sub(freed);
                Ok(true)
            }
            TableBody::Join(join) => {
                let is_left = matches!(&schema.shape, super::schema::Shape::Join { left, .. }
                    if left.table() == table);
                let (own, other, own_pairs, other_pairs) = if is_left {
                    (
                        &mut join.left,
                        &mut join.right,
                        &mut join.left_pairs,
                        &mut join.right_pairs,
                    )
                } else {
                    (
                        &mut join.right,
                        &mut join.left,
                        &mut join.right_pairs,
                        &mut join.left_pairs,
                    )
                };

                let Some(record_id) = own.rows.remove(&pk) else {
                    return Ok(false);
                };
                let mut released = vec![(table.to_string(), record_id)];
                if let Some(partners) = own_pairs.remove(&pk) {
                    for partner in partners {
                        let Some(set) = other_pairs.get_mut(&partner) else {
                            continue;
                        };
                        set.remove(&pk);
                        if set.is_empty() {
                            other_pairs.remove(&partner);
                            if let Some(orphan) = other.rows.remove(&partner) {
                                if let Some(rs) = schema.companion_schema(table) {
                                    released.push((rs.table().to_string(), orphan));
                                }
                            }
                        }
                    }
                }

                let mut freed = 0u64;
                for (tbl, record_id) in released {
                    if let Some(rows) = schema.row_schema(&tbl) {
                        let rows = rows.clone();
                        freed += release_row_record(ctx, &rows, record_id)?;
                    }
                }
                self.used = self.used.saturating_sub(freed);
                Ok(true)
            }
            TableBody::ReadOnly(_) => Ok(false),
        }
    }

    /// Patch the changed columns of the row keyed by `pk` in place.
    pub fn update_row(
        &mut self,
        schema: &TableSchema,
        ctx: &mut StoreCtx<'_>,
        table: &str,
        row: &Row,
        changed: &[String],
    ) -> Result<bool> {
        let Some(rows) = schema.row_schema(table) else {
            return Ok(false);
        };
        let rows = rows.clone();
        let Some(pk) = row_pk(&rows, row) else {
            return Ok(false);
        };
        let record_id = match &self.body {
            TableBody::Normal(set) => set.rows.get(&pk).copied(),
            TableBody::Join(join) => {
                let is_left = matches!(&schema.shape, super::schema::Shape::Join { left, .. }
                    if left.table() == table);
                if is_left {
                    join.left.rows.get(&pk).copied()
                } else {
                    join.right.rows.get(&pk).copied()
                }
            }
            TableBody::ReadOnly(_) => None,
        };
        let Some(record_id) = record_id else {
            return Ok(false);
        };
        let delta = update_row_record(ctx, &rows, record_id, row, changed)?;
        if delta >= 0 {
            self.used += delta as u64;
        } else {
            self.used = self.used.saturating_sub((-delta) as u64);
        }
        Ok(true)
    }

    /// Materialize the row of `table` keyed by `pk`, for results and tests.
    pub fn read_row(
        &self,
        schema: &TableSchema,
        ctx: &mut StoreCtx<'_>,
        table: &str,
        pk: i64,
    ) -> Result<Option<Row>> {
        let Some(rows) = schema.row_schema(table) else {
            return Ok(None);
        };
        let record_id = match &self.body {
            TableBody::Normal(set) => set.rows.get(&pk).copied(),
            TableBody::Join(join) => {
                let is_left = matches!(&schema.shape, super::schema::Shape::Join { left, .. }
                    if left.table() == table);
                if is_left {
                    join.left.rows.get(&pk).copied()
                } else {
                    join.right.rows.get(&pk).copied()
                }
            }
            TableBody::ReadOnly(_) => None,
        };
        match record_id {
            Some(id) => read_row_record(ctx, rows, id),
            None => Ok(None),
        }
    }

    /// Free every record this instance references.
    pub fn release(&mut self, schema: &TableSchema, ctx: &mut StoreCtx<'_>) -> Result<()> {
        match &mut self.body {
            TableBody::Normal(set) => {
                if let Some(rows) = schema.row_schema_any().cloned() {
                    for (_, record_id) in set.rows.drain() {
                        release_row_record(ctx, &rows, record_id)?;
                    }
                }
            }
            TableBody::Join(join) => {
                if let super::schema::Shape::Join { left, right } = &schema.shape {
                    let (left, right) = (left.clone(), right.clone());
                    for (_, record_id) in join.left.rows.drain() {
                        release_row_record(ctx, &left, record_id)?;
                    }
                    for (_, record_id) in join.right.rows.drain() {
                        release_row_record(ctx, &right, record_id)?;
                    }
                }
                join.left_pairs.clear();
                join.right_pairs.clear();
            }
            TableBody::ReadOnly(ids) => {
                if let Some(rows) = schema.row_schema_any().cloned() {
                    for record_id in ids.drain(..) {
                        release_row_record(ctx, &rows, record_id)?;
                    }
                }
            }
        }
        self.used = 0;
        Ok(())
    }

    /// Serialize for container compression.
    pub fn encode_to(&self, buf: &mut BytesMut) {
        buf.put_u32(self.schema_id);
        buf.put_u8(self.kind() as u8);
        buf.put_u64(self.used);
        buf.put_u16(self.params.len() as u16);
        for p in &self.params {
            p.encode_to(buf);
        }
        match &self.body {
            TableBody::Normal(set) => set.encode_to(buf),
            TableBody::Join(join) => {
                join.left.encode_to(buf);
                join.right.encode_to(buf);
                buf.put_u32(join.left_pairs.len() as u32);
                for (pk, partners) in &join.left_pairs {
                    buf.put_i64(*pk);
                    buf.put_u32(partners.len() as u32);
                    for partner in partners {
                        buf.put_i64(*partner);
                    }
                }
            }
            TableBody::ReadOnly(ids) => {
                buf.put_u32(ids.len() as u32);
                for id in ids {
                    buf.put_u32(*id);
                }
            }
        }
    }

    /// Invert [`CachedTable::encode_to`].
    pub fn decode(data: &mut &[u8]) -> Result<Self> {
        if data.len() < 15 {
            return Err(Error::corruption("truncated cached table"));
        }
        let schema_id = data.get_u32();
        let kind = TableKind::from_byte(data.get_u8())
            .ok_or_else(|| Error::corruption("unknown cached table kind"))?;
        let used = data.get_u64();
        let param_count = data.get_u16() as usize;
        let mut params = Vec::with_capacity(param_count);
        for _ in 0..param_count {
            params.push(Value::decode(data)?);
        }
        let body = match kind {
            TableKind::Normal => TableBody::Normal(RowSet::decode(data)?),
            TableKind::Join => {
                let left = RowSet::decode(data)?;
                let right = RowSet::decode(data)?;
                if data.len() < 4 {
                    return Err(Error::corruption("truncated join pairs"));
                }
                let count = data.get_u32() as usize;
                let mut left_pairs: HashMap<i64, HashSet<i64>> = HashMap::with_capacity(count);
                let mut right_pairs: HashMap<i64, HashSet<i64>> = HashMap::new();
                for _ in 0..count {
                    if data.len() < 12 {
                        return Err(Error::corruption("truncated join pair entry"));
                    }
                    let pk = data.get_i64();
                    let n = data.get_u32() as usize;
                    let mut partners = HashSet::with_capacity(n);
                    for _ in 0..n {
                        if data.len() < 8 {
                            return Err(Error::corruption("truncated join partner"));
                        }
                        let partner = data.get_i64();
                        partners.insert(partner);
                        right_pairs.entry(partner).or_default().insert(pk);
                    }
                    left_pairs.insert(pk, partners);
                }
                TableBody::Join(JoinBody {
                    left,
                    right,
                    left_pairs,
                    right_pairs,
                })
            }
            TableKind::ReadOnly => {
                if data.len() < 4 {
                    return Err(Error::corruption("truncated readonly table"));
                }
                let count = data.get_u32() as usize;
                let mut ids = Vec::with_capacity(count);
                for _ in 0..count {
                    if data.len() < 4 {
                        return Err(Error::corruption("truncated readonly entry"));
                    }
                    ids.push(data.get_u32());
                }
                TableBody::ReadOnly(ids)
            }
        };
        Ok(Self {
            schema_id,
            params,
            body,
            used,
        })
    }
}

impl TableSchema {
    /// The single row layout of a normal shape, or the left side of a join.
    pub fn row_schema_any(&self) -> Option<&RowSchema> {
        match &self.shape {
            super::schema::Shape::Normal(rows) => Some(rows),
            super::schema::Shape::Join { left, .. } => Some(left),
        }
    }
}
