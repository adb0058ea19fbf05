//! Field-to-query dependency graph.
//!
//! One graph per shard maps every base-table column referenced by any
//! cached shape to the shapes reading it, with per-edge relation bits for
//! projection, predicate and ordering roles. Each schema vertex enumerates
//! the cached instances bound to it and, when its WHERE clause leads with
//! an indexable const-comparison, keeps a [`PredicateIndex`] narrowing
//! which instances a changed row can affect.

pub mod condition;
pub mod index;

use std::collections::HashMap;
use std::sync::Arc;

use crate::table::cached::Row;
use crate::table::schema::{FieldKey, FieldSchema, TableSchema};
use crate::value::Value;

pub use condition::{CompareOp, Condition};
pub use index::PredicateIndex;

/// Identifier of a schema vertex within one shard's graph.
pub type SchemaId = u32;

/// Relation bits carried by a field -> schema edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Relations(u8);

impl Relations {
    const PROJECTED: u8 = 1 << 0;
    const PREDICATE: u8 = 1 << 1;
    const ORDER: u8 = 1 << 2;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_projected(mut self) -> Self {
        self.0 |= Self::PROJECTED;
        self
    }

    pub fn with_predicate(mut self) -> Self {
        self.0 |= Self::PREDICATE;
        self
    }

    pub fn with_order(mut self) -> Self {
        self.0 |= Self::ORDER;
        self
    }

    /// The field appears in the SELECT projection.
    pub fn projected(&self) -> bool {
        self.0 & Self::PROJECTED != 0
    }

    /// The field appears in WHERE or HAVING.
    pub fn predicate(&self) -> bool {
        self.0 & Self::PREDICATE != 0
    }

    /// The field appears in ORDER BY.
    pub fn order(&self) -> bool {
        self.0 & Self::ORDER != 0
    }

    pub fn merge(&mut self, other: Relations) {
        self.0 |= other.0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// The schema's leading indexable const-comparison.
#[derive(Debug, Clone)]
struct IndexCondition {
    field: FieldSchema,
    op: CompareOp,
    first_param: usize,
    last_param: usize,
}

struct FieldVertex {
    key: FieldKey,
    edges: Vec<(SchemaId, Relations)>,
}

struct SchemaVertex {
    schema: Arc<TableSchema>,
    condition: Option<Arc<Condition>>,
    index_cond: Option<IndexCondition>,
    index: Option<PredicateIndex>,
    /// Bound parameter tuple -> container table id.
    instances: HashMap<Vec<Value>, u32>,
    /// Reverse map, for re-checking index candidates.
    params_of: HashMap<u32, Vec<Value>>,
}

#[derive(Default)]
pub struct DependencyGraph {
    fields: Vec<FieldVertex>,
    field_ids: HashMap<FieldKey, usize>,
    schemas: Vec<SchemaVertex>,
    schema_ids: HashMap<String, SchemaId>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or find) the vertex for a base-table column. Idempotent.
    pub fn add_field_vertex(&mut self, key: FieldKey) -> usize {
        if let Some(&id) = self.field_ids.get(&key) {
            return id;
        }
        let id = self.fields.len();
        self.fields.push(FieldVertex {
            key: key.clone(),
            edges: Vec::new(),
        });
        self.field_ids.insert(key, id);
        id
    }

    /// Add (or find) the vertex for a cached shape, keyed by its canonical
    /// shape key. Idempotent.
    pub fn add_schema_vertex(&mut self, schema: Arc<TableSchema>) -> SchemaId {
        if let Some(&id) = self.schema_ids.get(&schema.key) {
            return id;
        }
        let id = self.schemas.len() as SchemaId;
        self.schema_ids.insert(schema.key.clone(), id);
        self.schemas.push(SchemaVertex {
            schema,
            condition: None,
            index_cond: None,
            index: None,
            instances: HashMap::new(),
            params_of: HashMap::new(),
        });
        id
    }

    /// Connect a field to a schema, OR-ing relation bits into an existing
    /// edge.
    pub fn add_edge(&mut self, field: FieldKey, schema: SchemaId, relations: Relations) {
        let field_id = self.add_field_vertex(field);
        let edges = &mut self.fields[field_id].edges;
        if let Some((_, existing)) = edges.iter_mut().find(|(s, _)| *s == schema) {
            existing.merge(relations);
        } else {
            edges.push((schema, relations));
        }
    }

    pub fn schema(&self, id: SchemaId) -> &Arc<TableSchema> {
        &self.schemas[id as usize].schema
    }

    pub fn condition(&self, id: SchemaId) -> Option<&Arc<Condition>> {
        self.schemas[id as usize].condition.as_ref()
    }

    /// Attach the WHERE+HAVING tree of a shape and build its predicate
    /// index from the first indexable const-comparison, preferring equality
    /// over ordered comparisons over BETWEEN.
    pub fn set_condition(&mut self, id: SchemaId, cond: Arc<Condition>) {
        let mut best: Option<IndexCondition> = None;
        pick_index_condition(&cond, &mut best);
        let vertex = &mut self.schemas[id as usize];
        vertex.index = best
            .as_ref()
            .and_then(|ic| PredicateIndex::for_op(ic.op));
        vertex.index_cond = if vertex.index.is_some() { best } else { None };
        vertex.condition = Some(cond);
    }

    /// Number of cached instances bound to a shape.
    pub fn instance_count(&self, id: SchemaId) -> usize {
        self.schemas[id as usize].instances.len()
    }

    /// Register a cached instance under its bound parameters.
    pub fn add_instance(&mut self, id: SchemaId, params: Vec<Value>, table_id: u32) {
        let vertex = &mut self.schemas[id as usize];
        if let (Some(index), Some(ic)) = (vertex.index.as_mut(), vertex.index_cond.as_ref()) {
            if ic.op == CompareOp::Between {
                let low = params.get(ic.first_param).cloned().unwrap_or(Value::Null);
                let high = params.get(ic.last_param).cloned().unwrap_or(Value::Null);
                index.add_range(low, high, table_id);
            } else {
                for i in ic.first_param..=ic.last_param {
                    let key = params.get(i).cloned().unwrap_or(Value::Null);
                    index.add(key, table_id);
                }
            }
        }
        vertex.params_of.insert(table_id, params.clone());
        vertex.instances.insert(params, table_id);
    }

    /// Drop one instance from its shape's instance set and, if indexed,
    /// from the predicate index. Returns its container id.
    pub fn remove_instance(&mut self, id: SchemaId, params: &[Value]) -> Option<u32> {
        let vertex = &mut self.schemas[id as usize];
        let table_id = vertex.instances.remove(params)?;
        vertex.params_of.remove(&table_id);
        if let (Some(index), Some(ic)) = (vertex.index.as_mut(), vertex.index_cond.as_ref()) {
            if ic.op == CompareOp::Between {
                let low = params.get(ic.first_param).cloned().unwrap_or(Value::Null);
                let high = params.get(ic.last_param).cloned().unwrap_or(Value::Null);
                index.remove_range(&low, &high, table_id);
            } else {
                for i in ic.first_param..=ic.last_param {
                    let key = params.get(i).cloned().unwrap_or(Value::Null);
                    index.remove(&key, table_id);
                }
            }
        }
        Some(table_id)
    }

    /// Drop one instance by its container id, used when the container has
    /// already freed the slot under memory pressure.
    pub fn remove_instance_by_id(&mut self, id: SchemaId, table_id: u32) -> bool {
        let Some(params) = self.schemas[id as usize].params_of.get(&table_id).cloned() else {
            return false;
        };
        self.remove_instance(id, &params).is_some()
    }

    /// Resolve one instance by its exact parameter binding (the hit path).
    pub fn find_instance(&self, id: SchemaId, params: &[Value]) -> Option<u32> {
        self.schemas[id as usize].instances.get(params).copied()
    }

    /// Drain every instance of a shape and clear its index. Used for
    /// whole-schema invalidation.
    pub fn clear_instances(&mut self, id: SchemaId) -> Vec<u32> {
        let vertex = &mut self.schemas[id as usize];
        let ids: Vec<u32> = vertex.instances.drain().map(|(_, id)| id).collect();
        vertex.params_of.clear();
        if let Some(index) = vertex.index.as_mut() {
            index.clear();
        }
        ids
    }

    /// All instances of a shape as `(params, table_id)` pairs.
    pub fn instances(&self, id: SchemaId) -> impl Iterator<Item = (&Vec<Value>, u32)> {
        self.schemas[id as usize]
            .instances
            .iter()
            .map(|(p, &t)| (p, t))
    }

    /// Union, over the changed fields, of the shapes reading them with
    /// their relation bits OR-ed together.
    pub fn find_affected(&self, changed: &[FieldKey]) -> HashMap<SchemaId, Relations> {
        let mut affected: HashMap<SchemaId, Relations> = HashMap::new();
        for key in changed {
            let Some(&field_id) = self.field_ids.get(key) else {
                continue;
            };
            for (schema, relations) in &self.fields[field_id].edges {
                affected.entry(*schema).or_default().merge(*relations);
            }
        }
        affected
    }

    /// The instances of a shape that a changed row of `table` can affect.
    ///
    /// With an index: evaluate the index key from the row, fetch the
    /// candidates and re-check the full WHERE condition against each
    /// candidate's bound parameters -- the index narrows, it does not
    /// replace exact matching. Without one: scan all instances.
    pub fn find_instances(&self, id: SchemaId, table: &str, row: &Row) -> Vec<u32> {
        let vertex = &self.schemas[id as usize];

        if let (Some(index), Some(ic)) = (vertex.index.as_ref(), vertex.index_cond.as_ref()) {
            if ic.field.table == table {
                let key = row.value_or_null(&ic.field.name);
                let mut result = Vec::new();
                for table_id in index.find(&key) {
                    let Some(params) = vertex.params_of.get(&table_id) else {
                        continue;
                    };
                    let matched = match &vertex.condition {
                        Some(cond) => cond.matches(table, row, params),
                        None => true,
                    };
                    if matched {
                        result.push(table_id);
                    }
                }
                return result;
            }
        }

        vertex
            .instances
            .iter()
            .filter(|(params, _)| match &vertex.condition {
                Some(cond) => cond.matches(table, row, params),
                None => true,
            })
            .map(|(_, &table_id)| table_id)
            .collect()
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("fields", &self.fields.len())
            .field("schemas", &self.schemas.len())
            .finish()
    }
}

/// Walk AND-connected nodes for the first indexable const-comparison.
/// `=` replaces anything, an ordered compare replaces BETWEEN, BETWEEN only
/// fills an empty slot. OR branches and aggregate conditions never index.
fn pick_index_condition(cond: &Condition, best: &mut Option<IndexCondition>) {
    match cond {
        Condition::And(l, r) => {
            pick_index_condition(l, best);
            pick_index_condition(r, best);
        }
        Condition::Const {
            field,
            op,
            first_param,
            last_param,
        } => {
            if !field.data_type.is_indexable() {
                return;
            }
            let candidate = || IndexCondition {
                field: field.clone(),
                op: *op,
                first_param: *first_param,
                last_param: *last_param,
            };
            match op {
                CompareOp::Eq => {
                    if best.as_ref().map(|b| b.op) != Some(CompareOp::Eq) {
                        *best = Some(candidate());
                    }
                }
                CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
                    if best.is_none() || best.as_ref().map(|b| b.op) == Some(CompareOp::Between) {
                        *best = Some(candidate());
                    }
                }
                CompareOp::Between => {
                    if best.is_none() {
                        *best = Some(candidate());
                    }
                }
                CompareOp::Ne | CompareOp::In => {}
            }
        }
        // OR branches cannot narrow; aggregates and field compares never
        // index.
        Condition::Or(_, _)
        | Condition::AggregateConst { .. }
        | Condition::FieldCmp { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::schema::RowSchema;
    use crate::value::DataType;

    fn field(name: &str) -> FieldSchema {
        FieldSchema::new("customers", name, DataType::Int64)
    }

    fn schema_with(key: &str) -> Arc<TableSchema> {
        let mut rows = RowSchema::new("customers");
        rows.add_field(field("id").primary());
        rows.add_field(field("balance"));
        rows.compile();
        Arc::new(TableSchema::normal(key, rows))
    }

    fn row(id: i64, balance: i64) -> Row {
        let mut r = Row::new();
        r.set("id", id).set("balance", balance);
        r
    }

    #[test]
    fn test_vertices_are_idempotent() {
        let mut graph = DependencyGraph::new();
        let f1 = graph.add_field_vertex(FieldKey::new("customers", "id"));
        let f2 = graph.add_field_vertex(FieldKey::new("customers", "id"));
        assert_eq!(f1, f2);

        let schema = schema_with("shape-a");
        let s1 = graph.add_schema_vertex(schema.clone());
        let s2 = graph.add_schema_vertex(schema);
        assert_eq!(s1, s2);
    }

    #[test]
    fn test_find_affected_exact() {
        let mut graph = DependencyGraph::new();
        let a = graph.add_schema_vertex(schema_with("shape-a"));
        let b = graph.add_schema_vertex(schema_with("shape-b"));

        graph.add_edge(
            FieldKey::new("customers", "id"),
            a,
            Relations::new().with_projected().with_predicate(),
        );
        graph.add_edge(
            FieldKey::new("customers", "balance"),
            a,
            Relations::new().with_projected(),
        );
        graph.add_edge(
            FieldKey::new("customers", "balance"),
            b,
            Relations::new().with_order(),
        );

        let affected = graph.find_affected(&[FieldKey::new("customers", "balance")]);
        assert_eq!(affected.len(), 2);
        assert!(affected[&a].projected());
        assert!(!affected[&a].predicate());
        assert!(affected[&b].order());

        let affected = graph.find_affected(&[FieldKey::new("customers", "id")]);
        assert_eq!(affected.len(), 1);
        assert!(affected[&a].predicate());

        // A column nothing reads affects nothing.
        let affected = graph.find_affected(&[FieldKey::new("customers", "ghost")]);
        assert!(affected.is_empty());
    }

    #[test]
    fn test_edge_bits_accumulate() {
        let mut graph = DependencyGraph::new();
        let a = graph.add_schema_vertex(schema_with("shape-a"));
        let key = FieldKey::new("customers", "id");
        graph.add_edge(key.clone(), a, Relations::new().with_projected());
        graph.add_edge(key.clone(), a, Relations::new().with_order());

        let affected = graph.find_affected(&[key]);
        assert!(affected[&a].projected());
        assert!(affected[&a].order());
        assert_eq!(graph.fields[0].edges.len(), 1);
    }

    #[test]
    fn test_index_preference() {
        let mut graph = DependencyGraph::new();
        let s = graph.add_schema_vertex(schema_with("shape-a"));
        // balance BETWEEN ? AND ? AND id = ?
        let cond = Condition::and(
            Condition::between(field("balance"), 0, 1),
            Condition::cmp(field("id"), CompareOp::Eq, 2),
        );
        graph.set_condition(s, Arc::new(cond));
        let ic = graph.schemas[s as usize].index_cond.as_ref().unwrap();
        assert_eq!(ic.op, CompareOp::Eq);
        assert_eq!(ic.field.name, "id");
    }

    #[test]
    fn test_or_disables_indexing() {
        let mut graph = DependencyGraph::new();
        let s = graph.add_schema_vertex(schema_with("shape-a"));
        let cond = Condition::or(
            Condition::cmp(field("id"), CompareOp::Eq, 0),
            Condition::cmp(field("balance"), CompareOp::Eq, 1),
        );
        graph.set_condition(s, Arc::new(cond));
        assert!(graph.schemas[s as usize].index.is_none());
    }

    fn set_eq_condition(graph: &mut DependencyGraph, s: SchemaId) {
        graph.set_condition(s, Arc::new(Condition::cmp(field("id"), CompareOp::Eq, 0)));
    }

    #[test]
    fn test_find_instances_by_index() {
        let mut graph = DependencyGraph::new();
        let s = graph.add_schema_vertex(schema_with("shape-a"));
        set_eq_condition(&mut graph, s);

        graph.add_instance(s, vec![Value::I64(42)], 100);
        graph.add_instance(s, vec![Value::I64(43)], 101);

        assert_eq!(graph.find_instances(s, "customers", &row(42, 5)), vec![100]);
        assert_eq!(graph.find_instances(s, "customers", &row(43, 5)), vec![101]);
        assert!(graph.find_instances(s, "customers", &row(44, 5)).is_empty());
    }

    #[test]
    fn test_index_scan_equivalence() {
        // Same shape twice: one vertex indexed, one forced to scan.
        let mut indexed = DependencyGraph::new();
        let si = indexed.add_schema_vertex(schema_with("shape"));
        indexed.set_condition(
            si,
            Arc::new(Condition::cmp(field("balance"), CompareOp::Le, 0)),
        );

        let mut scanned = DependencyGraph::new();
        let ss = scanned.add_schema_vertex(schema_with("shape"));
        scanned.set_condition(
            ss,
            Arc::new(Condition::cmp(field("balance"), CompareOp::Le, 0)),
        );
        // Disable the index to force the linear path.
        scanned.schemas[ss as usize].index = None;
        scanned.schemas[ss as usize].index_cond = None;

        for (i, bound) in [5i64, 10, 15, 20, 25].into_iter().enumerate() {
            indexed.add_instance(si, vec![Value::I64(bound)], i as u32);
            scanned.add_instance(ss, vec![Value::I64(bound)], i as u32);
        }

        for value in -3i64..30 {
            let r = row(1, value);
            let mut a = indexed.find_instances(si, "customers", &r);
            let mut b = scanned.find_instances(ss, "customers", &r);
            a.sort_unstable();
            b.sort_unstable();
            assert_eq!(a, b, "row balance {}", value);
        }
    }

    #[test]
    fn test_remove_instance_cleans_index() {
        let mut graph = DependencyGraph::new();
        let s = graph.add_schema_vertex(schema_with("shape-a"));
        set_eq_condition(&mut graph, s);

        graph.add_instance(s, vec![Value::I64(42)], 100);
        assert_eq!(graph.remove_instance(s, &[Value::I64(42)]), Some(100));
        assert!(graph.find_instances(s, "customers", &row(42, 0)).is_empty());
        assert_eq!(graph.instance_count(s), 0);
        assert_eq!(graph.remove_instance(s, &[Value::I64(42)]), None);
    }

    #[test]
    fn test_clear_instances() {
        let mut graph = DependencyGraph::new();
        let s = graph.add_schema_vertex(schema_with("shape-a"));
        set_eq_condition(&mut graph, s);
        graph.add_instance(s, vec![Value::I64(1)], 10);
        graph.add_instance(s, vec![Value::I64(2)], 11);

        let mut drained = graph.clear_instances(s);
        drained.sort_unstable();
        assert_eq!(drained, vec![10, 11]);
        assert_eq!(graph.instance_count(s), 0);
        assert!(graph.find_instances(s, "customers", &row(1, 0)).is_empty());
    }
}
