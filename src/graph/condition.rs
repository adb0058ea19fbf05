//! WHERE/HAVING condition trees.
//!
//! The parser/listener collaborator extracts, per cached shape, a tree of
//! const-comparisons, field-comparisons and AND/OR nodes. The graph uses the
//! tree twice: to test whether a changed base row can belong to an instance
//! (against that instance's bound parameters), and to rebuild a companion
//! lookup statement when patching a join instance.

use crate::table::cached::Row;
use crate::table::schema::{AggregateFunction, FieldSchema};
use crate::value::Value;

/// Comparison operators appearing in simple conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Between,
    In,
}

impl CompareOp {
    /// Parse the operator token the listener extracted.
    pub fn from_sql(op: &str) -> Option<Self> {
        match op.to_ascii_uppercase().as_str() {
            "=" => Some(CompareOp::Eq),
            "<>" | "!=" => Some(CompareOp::Ne),
            "<" => Some(CompareOp::Lt),
            "<=" => Some(CompareOp::Le),
            ">" => Some(CompareOp::Gt),
            ">=" => Some(CompareOp::Ge),
            "BETWEEN" => Some(CompareOp::Between),
            "IN" => Some(CompareOp::In),
            _ => None,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Between => "BETWEEN",
            CompareOp::In => "IN",
        }
    }

    /// Evaluate `left op params`, where `params` carries one value for the
    /// scalar operators, two bounds for BETWEEN and any number for IN.
    pub fn evaluate(&self, left: &Value, params: &[Value]) -> bool {
        match self {
            CompareOp::Eq => params.first().is_some_and(|p| left == p),
            CompareOp::Ne => params.first().is_some_and(|p| left != p),
            CompareOp::Lt => params.first().is_some_and(|p| left < p),
            CompareOp::Le => params.first().is_some_and(|p| left <= p),
            CompareOp::Gt => params.first().is_some_and(|p| left > p),
            CompareOp::Ge => params.first().is_some_and(|p| left >= p),
            CompareOp::Between => {
                params.len() == 2 && *left >= params[0] && *left <= params[1]
            }
            CompareOp::In => params.iter().any(|p| left == p),
        }
    }
}

/// One node of a condition tree. Parameter slots refer into the bound
/// parameter tuple of a cached instance.
#[derive(Debug, Clone)]
pub enum Condition {
    /// `field op ?[first..=last]`
    Const {
        field: FieldSchema,
        op: CompareOp,
        first_param: usize,
        last_param: usize,
    },
    /// `FUNC(field) op ?` in a HAVING clause.
    AggregateConst {
        func: AggregateFunction,
        field: FieldSchema,
        op: CompareOp,
        first_param: usize,
        last_param: usize,
    },
    /// `left op right` between two columns.
    FieldCmp {
        left: FieldSchema,
        right: FieldSchema,
        op: CompareOp,
    },
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
}

impl Condition {
    pub fn and(left: Condition, right: Condition) -> Condition {
        Condition::And(Box::new(left), Box::new(right))
    }

    pub fn or(left: Condition, right: Condition) -> Condition {
        Condition::Or(Box::new(left), Box::new(right))
    }

    /// Shorthand for a single-parameter const comparison.
    pub fn cmp(field: FieldSchema, op: CompareOp, param: usize) -> Condition {
        Condition::Const {
            field,
            op,
            first_param: param,
            last_param: param,
        }
    }

    /// Shorthand for `field BETWEEN ?low AND ?high`.
    pub fn between(field: FieldSchema, low_param: usize, high_param: usize) -> Condition {
        Condition::Const {
            field,
            op: CompareOp::Between,
            first_param: low_param,
            last_param: high_param,
        }
    }

    /// Test whether the row of `table` can belong to an instance bound to
    /// `params`. Comparisons touching other tables pass vacuously: only the
    /// written table's columns are known at invalidation time.
    pub fn matches(&self, table: &str, row: &Row, params: &[Value]) -> bool {
        match self {
            Condition::Const {
                field,
                op,
                first_param,
                last_param,
            }
            | Condition::AggregateConst {
                field,
                op,
                first_param,
                last_param,
                ..
            } => {
                if field.table != table {
                    return true;
                }
                let Some(bound) = params.get(*first_param..=*last_param) else {
                    return false;
                };
                op.evaluate(&row.value_or_null(&field.name), bound)
            }
            Condition::FieldCmp { left, right, op } => {
                if left.table != table || right.table != table {
                    return true;
                }
                op.evaluate(
                    &row.value_or_null(&left.name),
                    &[row.value_or_null(&right.name)],
                )
            }
            Condition::And(l, r) => l.matches(table, row, params) && r.matches(table, row, params),
            Condition::Or(l, r) => l.matches(table, row, params) || r.matches(table, row, params),
        }
    }

    /// Render the companion-lookup form of this condition: comparisons on
    /// `row_table` substitute the row's values as placeholders, everything
    /// else keeps its column names. Returns the SQL fragment in `out` and
    /// appends the positional parameters to `args`.
    pub fn to_companion_sql(
        &self,
        row_table: &str,
        row: &Row,
        bound: &[Value],
        out: &mut String,
        args: &mut Vec<Value>,
    ) {
        match self {
            Condition::Const {
                field,
                op,
                first_param,
                last_param,
            }
            | Condition::AggregateConst {
                field,
                op,
                first_param,
                last_param,
                ..
            } => {
                if field.table == row_table {
                    out.push_str("TRUE");
                    return;
                }
                out.push_str(&field.name);
                out.push(' ');
                out.push_str(op.as_sql());
                out.push(' ');
                match op {
                    CompareOp::Between => {
                        out.push_str("? AND ?");
                    }
                    CompareOp::In => {
                        out.push('(');
                        for i in *first_param..=*last_param {
                            out.push('?');
                            if i != *last_param {
                                out.push(',');
                            }
                        }
                        out.push(')');
                    }
                    _ => out.push('?'),
                }
                for i in *first_param..=*last_param {
                    args.push(bound.get(i).cloned().unwrap_or(Value::Null));
                }
            }
            Condition::FieldCmp { left, right, op } => {
                for (side, other) in [(left, false), (right, true)] {
                    if side.table == row_table {
                        out.push('?');
                        args.push(row.value_or_null(&side.name));
                    } else {
                        out.push_str(&side.name);
                    }
                    if !other {
                        out.push(' ');
                        out.push_str(op.as_sql());
                        out.push(' ');
                    }
                }
            }
            Condition::And(l, r) | Condition::Or(l, r) => {
                let word = if matches!(self, Condition::And(_, _)) {
                    " AND "
                } else {
                    " OR "
                };
                out.push('(');
                l.to_companion_sql(row_table, row, bound, out, args);
                out.push_str(word);
                r.to_companion_sql(row_table, row, bound, out, args);
                out.push(')');
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::DataType;

    fn field(name: &str) -> FieldSchema {
        FieldSchema::new("customers", name, DataType::Int64)
    }

    fn row(id: i64, balance: i64) -> Row {
        let mut r = Row::new();
        r.set("id", id).set("balance", balance);
        r
    }

    #[test]
    fn test_compare_ops() {
        let five = Value::I64(5);
        assert!(CompareOp::Eq.evaluate(&five, &[Value::I64(5)]));
        assert!(CompareOp::Ne.evaluate(&five, &[Value::I64(6)]));
        assert!(CompareOp::Lt.evaluate(&five, &[Value::I64(6)]));
        assert!(CompareOp::Ge.evaluate(&five, &[Value::I64(5)]));
        assert!(CompareOp::Between.evaluate(&five, &[Value::I64(1), Value::I64(9)]));
        assert!(!CompareOp::Between.evaluate(&five, &[Value::I64(6), Value::I64(9)]));
        assert!(CompareOp::In.evaluate(&five, &[Value::I64(1), Value::I64(5)]));
    }

    #[test]
    fn test_match_against_params() {
        let cond = Condition::cmp(field("id"), CompareOp::Eq, 0);
        assert!(cond.matches("customers", &row(42, 0), &[Value::I64(42)]));
        assert!(!cond.matches("customers", &row(43, 0), &[Value::I64(42)]));
        // A different base table passes vacuously.
        assert!(cond.matches("orders", &row(43, 0), &[Value::I64(42)]));
    }

    #[test]
    fn test_and_or() {
        let cond = Condition::and(
            Condition::cmp(field("id"), CompareOp::Eq, 0),
            Condition::cmp(field("balance"), CompareOp::Gt, 1),
        );
        let params = [Value::I64(42), Value::I64(100)];
        assert!(cond.matches("customers", &row(42, 150), &params));
        assert!(!cond.matches("customers", &row(42, 50), &params));

        let either = Condition::or(
            Condition::cmp(field("id"), CompareOp::Eq, 0),
            Condition::cmp(field("balance"), CompareOp::Gt, 1),
        );
        assert!(either.matches("customers", &row(7, 150), &params));
        assert!(!either.matches("customers", &row(7, 50), &params));
    }

    #[test]
    fn test_field_compare_same_table() {
        let cond = Condition::FieldCmp {
            left: field("balance"),
            right: field("id"),
            op: CompareOp::Gt,
        };
        assert!(cond.matches("customers", &row(10, 20), &[]));
        assert!(!cond.matches("customers", &row(20, 10), &[]));
    }

    #[test]
    fn test_companion_sql_substitutes_row_side() {
        // orders.customer_id = customers.id AND orders.total > ?
        let cond = Condition::and(
            Condition::FieldCmp {
                left: FieldSchema::new("orders", "customer_id", DataType::Int64),
                right: FieldSchema::new("customers", "id", DataType::Int64),
                op: CompareOp::Eq,
            },
            Condition::cmp(
                FieldSchema::new("orders", "total", DataType::Int64),
                CompareOp::Gt,
                0,
            ),
        );
        let mut r = Row::new();
        r.set("id", 42i64);

        let mut sql = String::new();
        let mut args = Vec::new();
        cond.to_companion_sql("customers", &r, &[Value::I64(500)], &mut sql, &mut args);
        assert_eq!(sql, "(customer_id = ? AND total > ?)");
        assert_eq!(args, vec![Value::I64(42), Value::I64(500)]);
    }
}
