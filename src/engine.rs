//! Worker pool and cross-shard coordination.
//!
//! A fixed pool of worker threads, one shard per thread. Each worker owns
//! its [`Shard`] outright and drains a per-shard task queue, so the
//! steady-state path inside a shard never takes a lock. Cross-shard work is
//! limited to routing writes, broadcasting decoded updates (shared via
//! `Arc`, decoded at most once via `OnceLock`) and replacing a worker whose
//! queue stopped draining.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, OnceLock};
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::connector::Connector;
use crate::error::{Error, Result};
use crate::options::Options;
use crate::shard::{Shard, StoreKind, UpdatePayload};

/// Builds the per-worker upstream connection.
pub type ConnectorFactory = Arc<dyn Fn(usize) -> Box<dyn Connector> + Send + Sync>;

/// A decoded-update payload shared across every shard of one broadcast.
///
/// The raw bytes are decoded by whichever shard gets there first; the value
/// itself is freed when the last shard drops its handle.
pub struct UpdateBroadcast {
    raw: Bytes,
    decoded: OnceLock<std::result::Result<UpdatePayload, Error>>,
    remaining: AtomicUsize,
}

impl UpdateBroadcast {
    fn new(raw: Bytes, consumers: usize) -> Self {
        Self {
            raw,
            decoded: OnceLock::new(),
            remaining: AtomicUsize::new(consumers),
        }
    }

    /// The decoded payload, decoding on first access.
    pub fn payload(&self) -> std::result::Result<&UpdatePayload, Error> {
        self.decoded
            .get_or_init(|| UpdatePayload::decode(&self.raw))
            .as_ref()
            .map_err(Error::clone)
    }

    /// Mark one shard done. Returns true for the last consumer.
    fn complete(&self) -> bool {
        self.remaining.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Whether every shard has consumed this broadcast.
    pub fn is_consumed(&self) -> bool {
        self.remaining.load(Ordering::Acquire) == 0
    }
}

enum Task {
    Apply(Arc<UpdateBroadcast>),
    Spill(StoreKind),
    Run(Box<dyn FnOnce(&mut Shard) + Send>),
    Reset,
    Shutdown,
}

struct ShardQueue {
    tasks: Mutex<VecDeque<Task>>,
    cond: Condvar,
    pending: AtomicUsize,
    stopped: AtomicBool,
}

impl ShardQueue {
    fn new() -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            pending: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    fn push(&self, task: Task) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }
        let mut tasks = self.tasks.lock();
        tasks.push_back(task);
        self.pending.fetch_add(1, Ordering::Release);
        self.cond.notify_one();
        true
    }

    fn pop(&self) -> Option<Task> {
        let mut tasks = self.tasks.lock();
        loop {
            if self.stopped.load(Ordering::Acquire) {
                return None;
            }
            if let Some(task) = tasks.pop_front() {
                return Some(task);
            }
            self.cond.wait(&mut tasks);
        }
    }

    fn complete_one(&self) {
        self.pending.fetch_sub(1, Ordering::Release);
    }

    fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.cond.notify_all();
    }
}

struct Worker {
    queue: Arc<ShardQueue>,
    handle: Option<JoinHandle<()>>,
}

pub struct Engine {
    opts: Options,
    connector_factory: ConnectorFactory,
    workers: Vec<Mutex<Worker>>,
}

impl Engine {
    /// Validate the options and start one worker per shard.
    pub fn new(opts: Options, connector_factory: ConnectorFactory) -> Result<Self> {
        opts.validate()?;
        let workers = (0..opts.worker_threads)
            .map(|index| Mutex::new(spawn_worker(&opts, &connector_factory, index)))
            .collect();
        Ok(Self {
            opts,
            connector_factory,
            workers,
        })
    }

    pub fn shard_count(&self) -> usize {
        self.workers.len()
    }

    /// Pending tasks on a shard's queue.
    pub fn pending(&self, shard: usize) -> usize {
        self.workers[shard].lock().queue.pending()
    }

    /// Pick the shard for a write: the shape's natural shard unless it is
    /// overloaded, in which case the next shard competes on pending work.
    pub fn route_write(&self, shape_key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        shape_key.hash(&mut hasher);
        let natural = (hasher.finish() as usize) % self.workers.len();
        let natural_pending = self.pending(natural);
        if natural_pending <= self.opts.probe_threshold {
            return natural;
        }
        let probe = (natural + 1) % self.workers.len();
        if self.pending(probe) < natural_pending {
            probe
        } else {
            natural
        }
    }

    /// Hand a decoded update to every shard. Every shard may cache shapes
    /// touching the written table.
    pub fn broadcast(&self, upd: &UpdatePayload) -> Arc<UpdateBroadcast> {
        let broadcast = Arc::new(UpdateBroadcast::new(upd.encode(), self.workers.len()));
        for worker in &self.workers {
            if !worker.lock().queue.push(Task::Apply(broadcast.clone())) {
                // A stopped shard consumes nothing.
                broadcast.complete();
            }
        }
        broadcast
    }

    /// Run a closure on a shard without waiting for it.
    pub fn submit<F>(&self, shard: usize, f: F) -> Result<()>
    where
        F: FnOnce(&mut Shard) + Send + 'static,
    {
        if !self.workers[shard].lock().queue.push(Task::Run(Box::new(f))) {
            return Err(Error::ShardStopped(shard));
        }
        Ok(())
    }

    /// Run a closure on a shard and wait for its result. A wait past the
    /// configured ceiling detaches that shard's worker and starts a
    /// replacement with a fresh, empty shard.
    pub fn submit_wait<R, F>(&self, shard: usize, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Shard) -> R + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        let task = Task::Run(Box::new(move |shard: &mut Shard| {
            let _ = tx.send(f(shard));
        }));
        if !self.workers[shard].lock().queue.push(task) {
            return Err(Error::ShardStopped(shard));
        }
        match rx.recv_timeout(self.opts.submit_timeout) {
            Ok(result) => Ok(result),
            Err(_) => {
                tracing::warn!(shard, "shard stopped draining its queue, replacing worker");
                self.replace_worker(shard);
                Err(Error::SubmitTimeout(shard))
            }
        }
    }

    /// Drop every shard's contents and start empty.
    pub fn reset_all(&self) {
        for worker in &self.workers {
            worker.lock().queue.push(Task::Reset);
        }
    }

    fn replace_worker(&self, shard: usize) {
        let mut slot = self.workers[shard].lock();
        slot.queue.stop();
        // The stuck thread is detached, not joined; it exits on its own
        // when (if) its current task finishes.
        drop(slot.handle.take());
        *slot = spawn_worker(&self.opts, &self.connector_factory, shard);
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.lock().queue.push(Task::Shutdown);
        }
        for worker in &self.workers {
            let handle = worker.lock().handle.take();
            if let Some(handle) = handle {
                let _ = handle.join();
            }
        }
    }
}

fn spawn_worker(opts: &Options, factory: &ConnectorFactory, index: usize) -> Worker {
    let queue = Arc::new(ShardQueue::new());
    let worker_queue = queue.clone();
    let opts = opts.clone();
    let factory = factory.clone();
    let handle = thread::Builder::new()
        .name(format!("relcache-shard-{}", index))
        .spawn(move || {
            let mut shard = Shard::new(&opts, index);
            let mut connector = factory(index);
            worker_loop(&worker_queue, &mut shard, connector.as_mut());
        })
        .expect("failed to spawn shard worker");
    Worker {
        queue,
        handle: Some(handle),
    }
}

fn worker_loop(queue: &ShardQueue, shard: &mut Shard, connector: &mut dyn Connector) {
    while let Some(task) = queue.pop() {
        let shutdown = matches!(task, Task::Shutdown);
        match task {
            Task::Apply(broadcast) => {
                match broadcast.payload() {
                    Ok(upd) => {
                        if let Err(err) = shard.apply_update(upd, connector) {
                            tracing::warn!(
                                shard = shard.index(),
                                error = %err,
                                "update application failed, cache may over-invalidate"
                            );
                        }
                    }
                    Err(err) => {
                        tracing::warn!(
                            shard = shard.index(),
                            error = %err,
                            "undecodable update payload dropped"
                        );
                    }
                }
                broadcast.complete();
                requeue_spills(queue, shard);
            }
            Task::Spill(kind) => {
                if shard.spill_step(kind) {
                    queue.push(Task::Spill(kind));
                }
            }
            Task::Run(f) => {
                f(shard);
                requeue_spills(queue, shard);
            }
            Task::Reset => shard.reset(),
            Task::Shutdown => {}
        }
        queue.complete_one();
        if shutdown {
            break;
        }
    }
}

/// Background overflow work never runs inline in a caller path; it rides
/// the owning shard's own queue.
fn requeue_spills(queue: &ShardQueue, shard: &mut Shard) {
    for kind in shard.take_spill_requests() {
        queue.push(Task::Spill(kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::NullConnector;
    use crate::graph::{CompareOp, Condition, Relations};
    use crate::shard::{RowChange, WriteOp};
    use crate::table::cached::Row;
    use crate::table::schema::{FieldKey, FieldSchema, RowSchema, TableSchema};
    use crate::value::{DataType, Value};
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_engine(dir: &TempDir, shards: usize) -> Engine {
        let mut opts = Options::default();
        opts.root_path = dir.path().to_path_buf();
        opts.worker_threads = shards;
        opts.block_capacity = 1024;
        opts.map_window = 4096;
        opts.submit_timeout = Duration::from_secs(5);
        let factory: ConnectorFactory = Arc::new(|_| Box::new(NullConnector));
        Engine::new(opts, factory).unwrap()
    }

    fn account_schema() -> Arc<TableSchema> {
        let mut rows = RowSchema::new("accounts");
        rows.add_field(FieldSchema::new("accounts", "id", DataType::Int64).primary());
        rows.add_field(FieldSchema::new("accounts", "owner", DataType::Int64));
        rows.add_field(FieldSchema::new("accounts", "balance", DataType::Int32));
        rows.compile();
        Arc::new(TableSchema::normal(
            "SELECT id,owner,balance FROM accounts WHERE owner = ?",
            rows,
        ))
    }

    fn register_everywhere(engine: &Engine) -> crate::graph::SchemaId {
        let mut last = 0;
        for shard in 0..engine.shard_count() {
            let schema = account_schema();
            last = engine
                .submit_wait(shard, move |s| {
                    let fields = vec![
                        (
                            FieldKey::new("accounts", "id"),
                            Relations::new().with_projected(),
                        ),
                        (
                            FieldKey::new("accounts", "owner"),
                            Relations::new().with_projected().with_predicate(),
                        ),
                        (
                            FieldKey::new("accounts", "balance"),
                            Relations::new().with_projected(),
                        ),
                    ];
                    let cond = Condition::cmp(
                        FieldSchema::new("accounts", "owner", DataType::Int64),
                        CompareOp::Eq,
                        0,
                    );
                    s.register_schema(schema, &fields, Some(cond))
                })
                .unwrap();
        }
        last
    }

    fn account(id: i64, owner: i64, balance: i32) -> Row {
        let mut row = Row::new();
        row.set("id", id).set("owner", owner).set("balance", balance);
        row
    }

    #[test]
    fn test_broadcast_reaches_every_shard() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir, 2);
        let schema_id = register_everywhere(&engine);

        // Cache the same shape with different bindings on both shards.
        for (shard, owner) in [(0usize, 42i64), (1, 42)] {
            engine
                .submit_wait(shard, move |s| {
                    s.cache_instance(schema_id, vec![Value::I64(owner)], &[account(1, owner, 100)])
                        .unwrap();
                })
                .unwrap();
        }

        let mut previous = Row::new();
        previous.set("balance", 100);
        let upd = UpdatePayload {
            op: WriteOp::Update,
            table: "accounts".into(),
            changed: vec!["balance".into()],
            rows: vec![RowChange::with_previous(account(1, 42, 150), previous)],
        };
        let broadcast = engine.broadcast(&upd);

        for shard in 0..2 {
            let row = engine
                .submit_wait(shard, move |s| {
                    s.read_instance_row(schema_id, &[Value::I64(42)], "accounts", 1)
                        .unwrap()
                })
                .unwrap()
                .expect("patched row");
            assert_eq!(row.get("balance"), Some(&Value::I32(150)));
        }
        assert!(broadcast.is_consumed());
    }

    #[test]
    fn test_routing_is_stable_and_in_range() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir, 4);
        let a = engine.route_write("UPDATE accounts SET balance = ?");
        let b = engine.route_write("UPDATE accounts SET balance = ?");
        assert_eq!(a, b);
        assert!(a < 4);
    }

    #[test]
    fn test_broadcast_payload_decodes_once() {
        let upd = UpdatePayload {
            op: WriteOp::Delete,
            table: "accounts".into(),
            changed: vec!["id".into()],
            rows: vec![RowChange::new(account(1, 42, 0))],
        };
        let broadcast = UpdateBroadcast::new(upd.encode(), 2);
        let first = broadcast.payload().unwrap() as *const UpdatePayload;
        let second = broadcast.payload().unwrap() as *const UpdatePayload;
        assert_eq!(first, second);

        assert!(!broadcast.complete());
        assert!(broadcast.complete());
        assert!(broadcast.is_consumed());

        let bad = UpdateBroadcast::new(Bytes::from_static(&[0xFF]), 1);
        assert!(bad.payload().is_err());
    }

    #[test]
    fn test_submit_timeout_replaces_worker() {
        let dir = TempDir::new().unwrap();
        let mut opts = Options::default();
        opts.root_path = dir.path().to_path_buf();
        opts.worker_threads = 1;
        opts.block_capacity = 1024;
        opts.map_window = 4096;
        opts.submit_timeout = Duration::from_millis(50);
        let factory: ConnectorFactory = Arc::new(|_| Box::new(NullConnector));
        let engine = Engine::new(opts, factory).unwrap();

        let result = engine.submit_wait(0, |_s| {
            thread::sleep(Duration::from_millis(400));
        });
        assert!(matches!(result, Err(Error::SubmitTimeout(0))));

        // The replacement worker serves new submissions.
        let index = engine.submit_wait(0, |s| s.index()).unwrap();
        assert_eq!(index, 0);
    }

    #[test]
    fn test_reset_all() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir, 1);
        let schema_id = register_everywhere(&engine);
        engine
            .submit_wait(0, move |s| {
                s.cache_instance(schema_id, vec![Value::I64(7)], &[account(1, 7, 5)])
                    .unwrap();
            })
            .unwrap();

        engine.reset_all();
        let slots = engine.submit_wait(0, |s| s.stats().table_slots).unwrap();
        assert_eq!(slots, 0);
    }
}
