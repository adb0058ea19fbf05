//! Schemas for cached query shapes.
//!
//! A [`TableSchema`] describes one distinct cached statement shape: which
//! base table(s) it reads, the projected columns and their record layout,
//! ORDER BY fields, and any aggregates. The parser/listener collaborator
//! produces these; the graph and the cached tables consume them.

use std::collections::HashMap;

use crate::value::DataType;

/// Identity of one base-table column, as used for graph vertices.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldKey {
    pub table: String,
    pub column: String,
}

impl FieldKey {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }
}

/// One projected column of a cached shape.
#[derive(Debug, Clone)]
pub struct FieldSchema {
    pub table: String,
    pub name: String,
    pub data_type: DataType,
    pub primary_key: bool,
}

impl FieldSchema {
    pub fn new(table: impl Into<String>, name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            table: table.into(),
            name: name.into(),
            data_type,
            primary_key: false,
        }
    }

    pub fn primary(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn key(&self) -> FieldKey {
        FieldKey::new(self.table.clone(), self.name.clone())
    }
}

/// Aggregate functions a projection or HAVING clause can apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Max,
    Min,
}

/// One aggregate in the projection or HAVING clause, with the base column
/// feeding it.
#[derive(Debug, Clone)]
pub struct AggregateField {
    pub func: AggregateFunction,
    pub input: FieldKey,
    pub name: String,
    pub projected: bool,
}

/// Sort direction of one ORDER BY entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDirection {
    Asc,
    Desc,
}

/// One ORDER BY entry.
#[derive(Debug, Clone)]
pub struct OrderField {
    pub column: String,
    pub direction: OrderDirection,
}

/// Projected row layout of one base table inside a shape.
///
/// Records are fixed-width: a null bitmap followed by each field at a
/// precomputed offset; string and blob fields hold the u32 id of their
/// var-store record.
#[derive(Debug, Clone)]
pub struct RowSchema {
    table: String,
    fields: Vec<FieldSchema>,
    offsets: Vec<usize>,
    by_name: HashMap<String, usize>,
    null_bytes: usize,
    record_len: usize,
    primary_key: Option<usize>,
}

impl RowSchema {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            fields: Vec::new(),
            offsets: Vec::new(),
            by_name: HashMap::new(),
            null_bytes: 0,
            record_len: 0,
            primary_key: None,
        }
    }

    /// Append a field. Call [`RowSchema::compile`] after the last one.
    pub fn add_field(&mut self, field: FieldSchema) -> &mut Self {
        if field.primary_key {
            self.primary_key = Some(self.fields.len());
        }
        self.by_name.insert(field.name.clone(), self.fields.len());
        self.fields.push(field);
        self
    }

    /// Freeze the layout: compute the null bitmap size and field offsets.
    pub fn compile(&mut self) -> &mut Self {
        self.null_bytes = self.fields.len().div_ceil(8);
        self.offsets.clear();
        let mut offset = self.null_bytes;
        for field in &self.fields {
            self.offsets.push(offset);
            offset += field.data_type.fixed_width();
        }
        self.record_len = offset;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn field(&self, index: usize) -> &FieldSchema {
        &self.fields[index]
    }

    pub fn fields(&self) -> &[FieldSchema] {
        &self.fields
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn offset(&self, index: usize) -> usize {
        self.offsets[index]
    }

    /// Byte length of one record under this layout.
    pub fn record_len(&self) -> usize {
        self.record_len
    }

    /// Byte and bit position of a field's null flag.
    pub fn null_bit(&self, index: usize) -> (usize, u8) {
        (index / 8, (index % 8) as u8)
    }

    pub fn primary_key(&self) -> Option<&FieldSchema> {
        self.primary_key.map(|i| &self.fields[i])
    }

    pub fn primary_key_index(&self) -> Option<usize> {
        self.primary_key
    }
}

/// The shape-specific part of a schema.
#[derive(Debug, Clone)]
pub enum Shape {
    /// Single-table SELECT.
    Normal(RowSchema),
    /// Two-table join; each side keeps its own row layout.
    Join { left: RowSchema, right: RowSchema },
}

/// Kind tag of a cached table instance, also used in serialized runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TableKind {
    Normal = 0,
    Join = 1,
    /// Materialized GROUP BY result; never patched, only cleared.
    ReadOnly = 2,
}

impl TableKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(TableKind::Normal),
            1 => Some(TableKind::Join),
            2 => Some(TableKind::ReadOnly),
            _ => None,
        }
    }
}

/// One distinct cached query shape.
#[derive(Debug, Clone)]
pub struct TableSchema {
    /// Canonical shape key (normalized statement text). Schema vertices are
    /// deduplicated on this.
    pub key: String,
    pub shape: Shape,
    pub group_by: bool,
    pub order_fields: Vec<OrderField>,
    pub aggregates: Vec<AggregateField>,
}

impl TableSchema {
    pub fn normal(key: impl Into<String>, rows: RowSchema) -> Self {
        Self {
            key: key.into(),
            shape: Shape::Normal(rows),
            group_by: false,
            order_fields: Vec::new(),
            aggregates: Vec::new(),
        }
    }

    pub fn join(key: impl Into<String>, left: RowSchema, right: RowSchema) -> Self {
        Self {
            key: key.into(),
            shape: Shape::Join { left, right },
            group_by: false,
            order_fields: Vec::new(),
            aggregates: Vec::new(),
        }
    }

    pub fn with_group_by(mut self) -> Self {
        self.group_by = true;
        self
    }

    pub fn with_order(mut self, column: impl Into<String>, direction: OrderDirection) -> Self {
        self.order_fields.push(OrderField {
            column: column.into(),
            direction,
        });
        self
    }

    pub fn with_aggregate(mut self, agg: AggregateField) -> Self {
        self.aggregates.push(agg);
        self
    }

    /// The instance kind this schema materializes as.
    pub fn kind(&self) -> TableKind {
        if self.group_by {
            TableKind::ReadOnly
        } else {
            match self.shape {
                Shape::Normal(_) => TableKind::Normal,
                Shape::Join { .. } => TableKind::Join,
            }
        }
    }

    /// The row layout reading from `table`, if this shape has one.
    pub fn row_schema(&self, table: &str) -> Option<&RowSchema> {
        match &self.shape {
            Shape::Normal(rows) => (rows.table() == table).then_some(rows),
            Shape::Join { left, right } => {
                if left.table() == table {
                    Some(left)
                } else if right.table() == table {
                    Some(right)
                } else {
                    None
                }
            }
        }
    }

    /// The join companion of `table`, for two-table shapes.
    pub fn companion_schema(&self, table: &str) -> Option<&RowSchema> {
        match &self.shape {
            Shape::Normal(_) => None,
            Shape::Join { left, right } => {
                if left.table() == table {
                    Some(right)
                } else if right.table() == table {
                    Some(left)
                } else {
                    None
                }
            }
        }
    }

    /// Whether a change to `field` feeds a projected aggregate, which makes
    /// the shape unpatchable.
    pub fn feeds_projected_aggregate(&self, field: &FieldKey) -> bool {
        self.aggregates
            .iter()
            .any(|a| a.projected && a.input == *field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn customer_rows() -> RowSchema {
        let mut rows = RowSchema::new("customers");
        rows.add_field(FieldSchema::new("customers", "id", DataType::Int64).primary());
        rows.add_field(FieldSchema::new("customers", "name", DataType::Str));
        rows.add_field(FieldSchema::new("customers", "balance", DataType::Int32));
        rows.compile();
        rows
    }

    #[test]
    fn test_layout_offsets() {
        let rows = customer_rows();
        // 3 fields -> 1 null byte, then i64, var id, i32.
        assert_eq!(rows.record_len(), 1 + 8 + 4 + 4);
        assert_eq!(rows.offset(0), 1);
        assert_eq!(rows.offset(1), 9);
        assert_eq!(rows.offset(2), 13);
        assert_eq!(rows.null_bit(2), (0, 2));
        assert_eq!(rows.field_index("balance"), Some(2));
        assert_eq!(rows.primary_key().map(|f| f.name.as_str()), Some("id"));
    }

    #[test]
    fn test_shape_kinds() {
        let schema = TableSchema::normal("SELECT * FROM customers", customer_rows());
        assert_eq!(schema.kind(), TableKind::Normal);
        assert!(schema.row_schema("customers").is_some());
        assert!(schema.row_schema("orders").is_none());

        let grouped = TableSchema::normal("SELECT ... GROUP BY", customer_rows()).with_group_by();
        assert_eq!(grouped.kind(), TableKind::ReadOnly);

        let mut orders = RowSchema::new("orders");
        orders.add_field(FieldSchema::new("orders", "id", DataType::Int64).primary());
        orders.compile();
        let join = TableSchema::join("SELECT ... JOIN", customer_rows(), orders);
        assert_eq!(join.kind(), TableKind::Join);
        assert_eq!(
            join.companion_schema("customers").map(|r| r.table()),
            Some("orders")
        );
    }

    #[test]
    fn test_aggregate_inputs() {
        let schema = TableSchema::normal("SELECT SUM(balance) ...", customer_rows())
            .with_aggregate(AggregateField {
                func: AggregateFunction::Sum,
                input: FieldKey::new("customers", "balance"),
                name: "sum_balance".into(),
                projected: true,
            });
        assert!(schema.feeds_projected_aggregate(&FieldKey::new("customers", "balance")));
        assert!(!schema.feeds_projected_aggregate(&FieldKey::new("customers", "name")));
    }
}
