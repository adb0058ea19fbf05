//! Predicate indexes over cached instances.
//!
//! An index maps a schema's leading indexable const-comparison to the
//! instances bound to each parameter value, so a changed row narrows to a
//! candidate list instead of a full scan. Equality uses a hash map; ordered
//! comparisons use a key-sorted array located by binary search; BETWEEN
//! keeps both bound arrays and intersects their hits.
//!
//! The candidate set is a superset of the true matches for the indexed
//! comparison alone; callers re-check the full WHERE condition against each
//! candidate's bound parameters.

use std::collections::{HashMap, HashSet};

use crate::value::Value;

use super::condition::CompareOp;

/// One key of a sorted index with the instances bound to it.
#[derive(Debug, Clone)]
pub struct IndexNode {
    key: Value,
    table_ids: Vec<u32>,
}

/// Lookup structure narrowing which instances a changed row could affect.
#[derive(Debug, Clone)]
pub enum PredicateIndex {
    /// `field = ?`
    Equal(HashMap<Value, Vec<u32>>),
    /// `field op ?` for an ordered `op`, keyed by the bound parameter.
    Ordered { op: CompareOp, nodes: Vec<IndexNode> },
    /// `field BETWEEN ? AND ?`: low bounds and high bounds, intersected.
    Between {
        low: Vec<IndexNode>,
        high: Vec<IndexNode>,
    },
}

impl PredicateIndex {
    /// The index shape serving `op`, if that operator is indexable.
    pub fn for_op(op: CompareOp) -> Option<Self> {
        match op {
            CompareOp::Eq => Some(PredicateIndex::Equal(HashMap::new())),
            CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
                Some(PredicateIndex::Ordered {
                    op,
                    nodes: Vec::new(),
                })
            }
            CompareOp::Between => Some(PredicateIndex::Between {
                low: Vec::new(),
                high: Vec::new(),
            }),
            CompareOp::Ne | CompareOp::In => None,
        }
    }

    /// Register an instance under its bound key.
    pub fn add(&mut self, key: Value, table_id: u32) {
        match self {
            PredicateIndex::Equal(map) => map.entry(key).or_default().push(table_id),
            PredicateIndex::Ordered { nodes, .. } => sorted_add(nodes, key, table_id),
            PredicateIndex::Between { .. } => {}
        }
    }

    /// Register an instance under its BETWEEN bounds.
    pub fn add_range(&mut self, low_key: Value, high_key: Value, table_id: u32) {
        if let PredicateIndex::Between { low, high } = self {
            sorted_add(low, low_key, table_id);
            sorted_add(high, high_key, table_id);
        }
    }

    /// Drop an instance registered under `key`.
    pub fn remove(&mut self, key: &Value, table_id: u32) {
        match self {
            PredicateIndex::Equal(map) => {
                if let Some(ids) = map.get_mut(key) {
                    ids.retain(|&id| id != table_id);
                    if ids.is_empty() {
                        map.remove(key);
                    }
                }
            }
            PredicateIndex::Ordered { nodes, .. } => sorted_remove(nodes, key, table_id),
            PredicateIndex::Between { .. } => {}
        }
    }

    /// Drop an instance registered under its BETWEEN bounds.
    pub fn remove_range(&mut self, low_key: &Value, high_key: &Value, table_id: u32) {
        if let PredicateIndex::Between { low, high } = self {
            sorted_remove(low, low_key, table_id);
            sorted_remove(high, high_key, table_id);
        }
    }

    /// Candidate instances whose indexed comparison can hold for a row
    /// whose indexed field equals `key`.
    pub fn find(&self, key: &Value) -> Vec<u32> {
        match self {
            PredicateIndex::Equal(map) => map.get(key).cloned().unwrap_or_default(),
            PredicateIndex::Ordered { op, nodes } => {
                // The predicate is `row_value op param`; select the params
                // that satisfy it for this row value.
                let range = match op {
                    // row > param  =>  param < key
                    CompareOp::Gt => 0..lower_bound(nodes, key),
                    // row >= param  =>  param <= key
                    CompareOp::Ge => 0..upper_bound(nodes, key),
                    // row < param  =>  param > key
                    CompareOp::Lt => upper_bound(nodes, key)..nodes.len(),
                    // row <= param  =>  param >= key
                    CompareOp::Le => lower_bound(nodes, key)..nodes.len(),
                    _ => 0..0,
                };
                nodes[range]
                    .iter()
                    .flat_map(|n| n.table_ids.iter().copied())
                    .collect()
            }
            PredicateIndex::Between { low, high } => {
                // low <= key AND high >= key
                let low_hits: HashSet<u32> = low[..upper_bound(low, key)]
                    .iter()
                    .flat_map(|n| n.table_ids.iter().copied())
                    .collect();
                high[lower_bound(high, key)..]
                    .iter()
                    .flat_map(|n| n.table_ids.iter().copied())
                    .filter(|id| low_hits.contains(id))
                    .collect()
            }
        }
    }

    pub fn clear(&mut self) {
        match self {
            PredicateIndex::Equal(map) => map.clear(),
            PredicateIndex::Ordered { nodes, .. } => nodes.clear(),
            PredicateIndex::Between { low, high } => {
                low.clear();
                high.clear();
            }
        }
    }
}

/// First position whose key is not below `key`.
fn lower_bound(nodes: &[IndexNode], key: &Value) -> usize {
    nodes.partition_point(|n| n.key < *key)
}

/// First position whose key is above `key`.
fn upper_bound(nodes: &[IndexNode], key: &Value) -> usize {
    nodes.partition_point(|n| n.key <= *key)
}

fn sorted_add(nodes: &mut Vec<IndexNode>, key: Value, table_id: u32) {
    let i = lower_bound(nodes, &key);
    if i < nodes.len() && nodes[i].key == key {
        nodes[i].table_ids.push(table_id);
    } else {
        nodes.insert(
            i,
            IndexNode {
                key,
                table_ids: vec![table_id],
            },
        );
    }
}

fn sorted_remove(nodes: &mut Vec<IndexNode>, key: &Value, table_id: u32) {
    let i = lower_bound(nodes, key);
    if i < nodes.len() && nodes[i].key == *key {
        nodes[i].table_ids.retain(|&id| id != table_id);
        if nodes[i].table_ids.is_empty() {
            nodes.remove(i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(mut v: Vec<u32>) -> Vec<u32> {
        v.sort_unstable();
        v
    }

    #[test]
    fn test_equal_index() {
        let mut index = PredicateIndex::for_op(CompareOp::Eq).unwrap();
        index.add(Value::I64(42), 1);
        index.add(Value::I64(42), 2);
        index.add(Value::I64(43), 3);

        assert_eq!(ids(index.find(&Value::I64(42))), vec![1, 2]);
        assert_eq!(ids(index.find(&Value::I64(43))), vec![3]);
        assert!(index.find(&Value::I64(44)).is_empty());

        index.remove(&Value::I64(42), 1);
        assert_eq!(ids(index.find(&Value::I64(42))), vec![2]);
    }

    #[test]
    fn test_ordered_index_direction() {
        // Predicate: row_value > param.
        let mut index = PredicateIndex::for_op(CompareOp::Gt).unwrap();
        index.add(Value::I64(10), 1);
        index.add(Value::I64(20), 2);
        index.add(Value::I64(30), 3);

        // A row with value 25 satisfies `25 > param` for params 10 and 20.
        assert_eq!(ids(index.find(&Value::I64(25))), vec![1, 2]);
        // Equality does not satisfy a strict comparison.
        assert_eq!(ids(index.find(&Value::I64(20))), vec![1]);
        assert!(index.find(&Value::I64(5)).is_empty());
    }

    #[test]
    fn test_ordered_index_inclusive() {
        // Predicate: row_value <= param.
        let mut index = PredicateIndex::for_op(CompareOp::Le).unwrap();
        index.add(Value::I64(10), 1);
        index.add(Value::I64(20), 2);

        assert_eq!(ids(index.find(&Value::I64(10))), vec![1, 2]);
        assert_eq!(ids(index.find(&Value::I64(15))), vec![2]);
        assert_eq!(ids(index.find(&Value::I64(25))), Vec::<u32>::new());
    }

    #[test]
    fn test_between_index_intersects_bounds() {
        let mut index = PredicateIndex::for_op(CompareOp::Between).unwrap();
        index.add_range(Value::I64(10), Value::I64(20), 1);
        index.add_range(Value::I64(15), Value::I64(25), 2);

        assert_eq!(ids(index.find(&Value::I64(12))), vec![1]);
        assert_eq!(ids(index.find(&Value::I64(18))), vec![1, 2]);
        assert_eq!(ids(index.find(&Value::I64(22))), vec![2]);
        assert!(index.find(&Value::I64(30)).is_empty());

        index.remove_range(&Value::I64(10), &Value::I64(20), 1);
        assert!(index.find(&Value::I64(12)).is_empty());
    }

    #[test]
    fn test_string_keys() {
        let mut index = PredicateIndex::for_op(CompareOp::Eq).unwrap();
        index.add(Value::Str("alpha".into()), 9);
        assert_eq!(index.find(&Value::Str("alpha".into())), vec![9]);
        assert!(index.find(&Value::Str("beta".into())).is_empty());
    }

    #[test]
    fn test_not_indexable_ops() {
        assert!(PredicateIndex::for_op(CompareOp::Ne).is_none());
        assert!(PredicateIndex::for_op(CompareOp::In).is_none());
    }
}
