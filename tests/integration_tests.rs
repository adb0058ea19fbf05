//! Integration tests for the storage and invalidation engine.

use std::sync::Arc;
use std::time::Duration;

use relcache::graph::{CompareOp, Condition};
use relcache::shard::{RowChange, UpdatePayload, WriteOp};
use relcache::table::schema::{FieldKey, FieldSchema, RowSchema, TableSchema};
use relcache::{
    Arena, Connector, ConnectorFactory, DataType, Engine, NullConnector, Options, Relations, Row,
    Shard, Value, VarStore,
};
use tempfile::TempDir;

fn small_options(dir: &TempDir) -> Options {
    let mut opts = Options::default();
    opts.root_path = dir.path().to_path_buf();
    opts.block_capacity = 1024;
    opts.map_window = 4096;
    opts
}

/// A var-store value relocates when its block cannot absorb a grown
/// rewrite, and the old id stops resolving.
#[test]
fn scenario_var_rewrite_relocates() {
    let dir = TempDir::new().unwrap();
    let mut opts = small_options(&dir);
    opts.block_capacity = 256;
    let mut arena = Arena::new();
    let mut var = VarStore::new(&opts, 0, &mut arena);

    let id = var.set(&mut arena, b"alpha").unwrap();
    assert_eq!(var.get(&mut arena, id).unwrap().unwrap().as_ref(), b"alpha");

    // Leave the block too full for the grown value.
    var.set(&mut arena, &vec![b'f'; 118]).unwrap();
    var.set(&mut arena, &vec![b'g'; 119]).unwrap();

    let new_id = var.rewrite(&mut arena, id, b"longer-value").unwrap().unwrap();
    assert_ne!(new_id, id);
    assert_eq!(
        var.get(&mut arena, new_id).unwrap().unwrap().as_ref(),
        b"longer-value"
    );
    assert_eq!(var.get(&mut arena, id).unwrap(), None);
}

fn account_schema() -> Arc<TableSchema> {
    let mut rows = RowSchema::new("accounts");
    rows.add_field(FieldSchema::new("accounts", "id", DataType::Int64).primary());
    rows.add_field(FieldSchema::new("accounts", "customerId", DataType::Int64));
    rows.add_field(FieldSchema::new("accounts", "balance", DataType::Int32));
    rows.compile();
    Arc::new(TableSchema::normal(
        "SELECT id,customerId,balance FROM accounts WHERE customerId = ?",
        rows,
    ))
}

fn register_account_shape(shard: &mut Shard) -> relcache::SchemaId {
    let fields = vec![
        (
            FieldKey::new("accounts", "id"),
            Relations::new().with_projected(),
        ),
        (
            FieldKey::new("accounts", "customerId"),
            Relations::new().with_projected().with_predicate(),
        ),
        (
            FieldKey::new("accounts", "balance"),
            Relations::new().with_projected(),
        ),
    ];
    let cond = Condition::cmp(
        FieldSchema::new("accounts", "customerId", DataType::Int64),
        CompareOp::Eq,
        0,
    );
    shard.register_schema(account_schema(), &fields, Some(cond))
}

fn account(id: i64, customer_id: i64, balance: i32) -> Row {
    let mut row = Row::new();
    row.set("id", id)
        .set("customerId", customer_id)
        .set("balance", balance);
    row
}

/// A write to a non-predicate column patches the cached row in place
/// instead of clearing the table.
#[test]
fn scenario_balance_update_patches_instance() {
    let dir = TempDir::new().unwrap();
    let mut shard = Shard::new(&small_options(&dir), 0);
    let schema_id = register_account_shape(&mut shard);
    shard
        .cache_instance(schema_id, vec![Value::I64(42)], &[account(1, 42, 100)])
        .unwrap();

    let mut previous = Row::new();
    previous.set("balance", 100);
    let upd = UpdatePayload {
        op: WriteOp::Update,
        table: "accounts".into(),
        changed: vec!["balance".into()],
        rows: vec![RowChange::with_previous(account(1, 42, 150), previous)],
    };
    shard.apply_update(&upd, &mut NullConnector).unwrap();

    let row = shard
        .read_instance_row(schema_id, &[Value::I64(42)], "accounts", 1)
        .unwrap()
        .expect("instance survives the write");
    assert_eq!(row.get("balance"), Some(&Value::I32(150)));
}

/// A write to the predicate column moves the row between instances:
/// removed where it used to match, inserted where it matches now.
#[test]
fn scenario_predicate_update_moves_row() {
    let dir = TempDir::new().unwrap();
    let mut shard = Shard::new(&small_options(&dir), 0);
    let schema_id = register_account_shape(&mut shard);
    shard
        .cache_instance(schema_id, vec![Value::I64(42)], &[account(1, 42, 100)])
        .unwrap();
    shard
        .cache_instance(schema_id, vec![Value::I64(43)], &[])
        .unwrap();

    let mut previous = Row::new();
    previous.set("customerId", 42i64);
    let upd = UpdatePayload {
        op: WriteOp::Update,
        table: "accounts".into(),
        changed: vec!["customerId".into()],
        rows: vec![RowChange::with_previous(account(1, 43, 100), previous)],
    };
    shard.apply_update(&upd, &mut NullConnector).unwrap();

    assert!(shard
        .read_instance_row(schema_id, &[Value::I64(42)], "accounts", 1)
        .unwrap()
        .is_none());
    assert!(shard
        .read_instance_row(schema_id, &[Value::I64(43)], "accounts", 1)
        .unwrap()
        .is_some());
}

/// Instances whose schema has no edge from the written columns are never
/// touched; instances with an edge are all visited.
#[test]
fn invalidation_completeness() {
    let dir = TempDir::new().unwrap();
    let mut shard = Shard::new(&small_options(&dir), 0);
    let balance_shape = register_account_shape(&mut shard);

    // A second shape that only reads account names.
    let mut rows = RowSchema::new("accounts");
    rows.add_field(FieldSchema::new("accounts", "id", DataType::Int64).primary());
    rows.add_field(FieldSchema::new("accounts", "name", DataType::Str));
    rows.compile();
    let name_schema = Arc::new(TableSchema::normal(
        "SELECT id,name FROM accounts WHERE id = ?",
        rows,
    ));
    let name_fields = vec![
        (
            FieldKey::new("accounts", "id"),
            Relations::new().with_projected().with_predicate(),
        ),
        (
            FieldKey::new("accounts", "name"),
            Relations::new().with_projected(),
        ),
    ];
    let name_cond = Condition::cmp(
        FieldSchema::new("accounts", "id", DataType::Int64),
        CompareOp::Eq,
        0,
    );
    let name_shape = shard.register_schema(name_schema, &name_fields, Some(name_cond));

    shard
        .cache_instance(balance_shape, vec![Value::I64(42)], &[account(1, 42, 100)])
        .unwrap();
    let mut name_row = Row::new();
    name_row.set("id", 1i64).set("name", "Ada");
    let name_rows = [name_row];
    shard
        .cache_instance(name_shape, vec![Value::I64(1)], &name_rows)
        .unwrap();

    // balance is read only by the first shape.
    let mut write_row = account(1, 42, 175);
    write_row.set("name", "Ada");
    let upd = UpdatePayload {
        op: WriteOp::Update,
        table: "accounts".into(),
        changed: vec!["balance".into()],
        rows: vec![RowChange::new(write_row)],
    };
    shard.apply_update(&upd, &mut NullConnector).unwrap();

    let patched = shard
        .read_instance_row(balance_shape, &[Value::I64(42)], "accounts", 1)
        .unwrap()
        .unwrap();
    assert_eq!(patched.get("balance"), Some(&Value::I32(175)));

    let untouched = shard
        .read_instance_row(name_shape, &[Value::I64(1)], "accounts", 1)
        .unwrap()
        .unwrap();
    assert_eq!(untouched.get("name"), Some(&Value::Str("Ada".into())));
}

/// With a predicate index built, `find_instances` returns exactly what a
/// full scan evaluating the same condition returns.
#[test]
fn index_and_scan_agree_through_updates() {
    let dir = TempDir::new().unwrap();
    let mut shard = Shard::new(&small_options(&dir), 0);
    let schema_id = register_account_shape(&mut shard);

    for owner in [10i64, 20, 30, 40] {
        shard
            .cache_instance(
                schema_id,
                vec![Value::I64(owner)],
                &[account(owner, owner, 1)],
            )
            .unwrap();
    }

    for probe in [5i64, 10, 25, 40, 55] {
        let row = account(99, probe, 0);
        let indexed = shard.graph().find_instances(schema_id, "accounts", &row);
        // The exact condition admits only the instance bound to `probe`.
        let expected: Vec<u32> = shard
            .graph()
            .instances(schema_id)
            .filter(|(params, _)| params[0] == Value::I64(probe))
            .map(|(_, id)| id)
            .collect();
        let mut indexed = indexed;
        let mut expected = expected;
        indexed.sort_unstable();
        expected.sort_unstable();
        assert_eq!(indexed, expected, "probe {}", probe);
    }
}

/// Connector stub that returns a scripted companion row and records the
/// lookups it served.
struct ScriptedConnector {
    rows: Vec<Row>,
    selects: Vec<String>,
}

impl Connector for ScriptedConnector {
    fn select(&mut self, sql: &str, _params: &[Value]) -> relcache::Result<Vec<Row>> {
        self.selects.push(sql.to_string());
        Ok(self.rows.clone())
    }

    fn execute(&mut self, _sql: &str, _params: &[Value]) -> relcache::Result<u64> {
        Ok(0)
    }
}

/// Inserting into one side of a cached join re-runs the companion lookup
/// and adds the joined pair.
#[test]
fn join_insert_fetches_companion_rows() {
    let dir = TempDir::new().unwrap();
    let mut shard = Shard::new(&small_options(&dir), 0);

    let mut customers = RowSchema::new("customers");
    customers.add_field(FieldSchema::new("customers", "id", DataType::Int64).primary());
    customers.add_field(FieldSchema::new("customers", "name", DataType::Str));
    customers.compile();
    let mut orders = RowSchema::new("orders");
    orders.add_field(FieldSchema::new("orders", "id", DataType::Int64).primary());
    orders.add_field(FieldSchema::new("orders", "customerId", DataType::Int64));
    orders.add_field(FieldSchema::new("orders", "total", DataType::Int32));
    orders.compile();
    let schema = Arc::new(TableSchema::join(
        "SELECT ... FROM customers JOIN orders ON orders.customerId = customers.id",
        customers,
        orders,
    ));

    let fields = vec![
        (
            FieldKey::new("customers", "id"),
            Relations::new().with_projected().with_predicate(),
        ),
        (
            FieldKey::new("orders", "customerId"),
            Relations::new().with_predicate(),
        ),
        (
            FieldKey::new("orders", "total"),
            Relations::new().with_projected(),
        ),
    ];
    let cond = Condition::FieldCmp {
        left: FieldSchema::new("orders", "customerId", DataType::Int64),
        right: FieldSchema::new("customers", "id", DataType::Int64),
        op: CompareOp::Eq,
    };
    let schema_id = shard.register_schema(schema, &fields, Some(cond));

    let mut customer = Row::new();
    customer.set("id", 7i64).set("name", "Ada");
    let mut first_order = Row::new();
    first_order
        .set("id", 100i64)
        .set("customerId", 7i64)
        .set("total", 50);
    shard
        .cache_join_instance(schema_id, vec![], &[(customer.clone(), first_order)])
        .unwrap();

    // A new order arrives for the same customer.
    let mut new_order = Row::new();
    new_order
        .set("id", 101i64)
        .set("customerId", 7i64)
        .set("total", 80);
    let upd = UpdatePayload {
        op: WriteOp::Insert,
        table: "orders".into(),
        changed: vec!["id".into(), "customerId".into(), "total".into()],
        rows: vec![RowChange::new(new_order)],
    };
    let mut connector = ScriptedConnector {
        rows: vec![customer],
        selects: Vec::new(),
    };
    shard.apply_update(&upd, &mut connector).unwrap();

    // The companion lookup went to the customers side.
    assert_eq!(connector.selects.len(), 1);
    assert!(connector.selects[0].starts_with("SELECT id,name FROM customers"));

    let inserted = shard
        .read_instance_row(schema_id, &[], "orders", 101)
        .unwrap()
        .expect("new order joined into the instance");
    assert_eq!(inserted.get("total"), Some(&Value::I32(80)));
}

/// The engine end to end: route, broadcast, and read the patched result
/// from every shard.
#[test]
fn engine_broadcast_round_trip() {
    let dir = TempDir::new().unwrap();
    let mut opts = small_options(&dir);
    opts.worker_threads = 2;
    opts.submit_timeout = Duration::from_secs(5);
    let factory: ConnectorFactory = Arc::new(|_| Box::new(NullConnector));
    let engine = Engine::new(opts, factory).unwrap();

    let mut schema_id = 0;
    for shard in 0..engine.shard_count() {
        schema_id = engine
            .submit_wait(shard, |s| register_account_shape(s))
            .unwrap();
    }
    for shard in 0..engine.shard_count() {
        engine
            .submit_wait(shard, move |s| {
                s.cache_instance(schema_id, vec![Value::I64(42)], &[account(1, 42, 100)])
                    .unwrap();
            })
            .unwrap();
    }

    let shard = engine.route_write("UPDATE accounts SET balance = ? WHERE id = ?");
    assert!(shard < engine.shard_count());

    for round in 0..50i32 {
        let mut previous = Row::new();
        previous.set("balance", 100 + round);
        let upd = UpdatePayload {
            op: WriteOp::Update,
            table: "accounts".into(),
            changed: vec!["balance".into()],
            rows: vec![RowChange::with_previous(
                account(1, 42, 101 + round),
                previous,
            )],
        };
        engine.broadcast(&upd);
    }

    for shard in 0..engine.shard_count() {
        let row = engine
            .submit_wait(shard, move |s| {
                s.read_instance_row(schema_id, &[Value::I64(42)], "accounts", 1)
                    .unwrap()
            })
            .unwrap()
            .expect("instance survives fifty patches");
        assert_eq!(row.get("balance"), Some(&Value::I32(150)));
    }
}
