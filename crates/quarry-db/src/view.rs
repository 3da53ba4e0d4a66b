use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use arc_swap::ArcSwap;
use bson::Document;
use crossbeam::channel::{Receiver, Sender, bounded, unbounded};
use quarry_store::{ChangeStreamDocument, MemoryStore, Namespace, Streamable, Writable, WriteOptions};

use crate::change_bus::{ChangeBus, ListenerId};
use crate::changeset::{ChangeSet, ensure_id};
use crate::engine::{AggregateInput, AggregationEngine};
use crate::error::DbError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    Populating,
    Steady,
    Recomputing,
    Dropped,
}

enum ViewTask {
    Recompute,
    /// Barrier: answered once every earlier task is done.
    Flush(Sender<()>),
    Stop,
}

/// A read-only collection holding the materialized result of a pipeline
/// over a source namespace.
///
/// Every change published on the source enqueues one recomputation. A
/// single worker drains the queue in order, so recomputations never
/// overlap.
pub struct View {
    materializer: Arc<Materializer>,
    queue: Sender<ViewTask>,
    listener: ListenerId,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl View {
    /// Subscribes to the source, populates the private store, then starts
    /// the worker.
    pub(crate) fn create(
        ns: Namespace,
        view_on: Namespace,
        pipeline: Vec<Document>,
        engine: Arc<AggregationEngine>,
        bus: Arc<ChangeBus>,
    ) -> Result<View, DbError> {
        let (queue, tasks) = unbounded();
        let source = view_on.clone();
        let notify = queue.clone();
        let listener = bus.listen(move |change| {
            change.ns != source || notify.send(ViewTask::Recompute).is_ok()
        });

        let materializer = Arc::new(Materializer {
            ns,
            view_on,
            pipeline,
            store: Arc::new(MemoryStore::new()),
            engine,
            bus: Arc::clone(&bus),
            status: Mutex::new(ViewStatus {
                state: ViewState::Populating,
                last_error: None,
                last_good: Vec::new(),
            }),
        });
        if let Err(e) = materializer.populate() {
            bus.unlisten(listener);
            return Err(e);
        }

        let worker = Arc::clone(&materializer);
        let handle = thread::spawn(move || worker.run(tasks));
        Ok(View {
            materializer,
            queue,
            listener,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn ns(&self) -> &Namespace {
        &self.materializer.ns
    }

    pub fn view_on(&self) -> &Namespace {
        &self.materializer.view_on
    }

    pub fn pipeline(&self) -> &[Document] {
        &self.materializer.pipeline
    }

    pub fn state(&self) -> ViewState {
        self.materializer.status().state
    }

    /// The error of the most recent failed recomputation, cleared by the
    /// next successful one.
    pub fn last_error(&self) -> Option<DbError> {
        self.materializer.status().last_error.clone()
    }

    /// Current contents in natural order.
    pub fn documents(&self) -> Vec<Document> {
        self.materializer.store.documents(&self.materializer.ns.coll)
    }

    /// Blocks until every recomputation queued before this call is done.
    pub fn flush(&self) {
        let (done, wait) = bounded(1);
        if self.queue.send(ViewTask::Flush(done)).is_ok() {
            // A stopped worker drops the barrier, which also ends the wait.
            let _ = wait.recv();
        }
    }

    pub(crate) fn store(&self) -> Arc<dyn Streamable> {
        self.materializer.store.clone()
    }

    /// Stops listening, lets the worker drain its queue, and waits for it.
    pub(crate) fn stop(&self) {
        self.materializer.bus.unlisten(self.listener);
        let _ = self.queue.send(ViewTask::Stop);
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            tracing::error!(ns = %self.ns(), "view worker panicked");
        }
        self.materializer.status().state = ViewState::Dropped;
    }
}

impl Drop for View {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ViewStatus {
    state: ViewState,
    last_error: Option<DbError>,
    last_good: Vec<Document>,
}

struct Materializer {
    ns: Namespace,
    view_on: Namespace,
    pipeline: Vec<Document>,
    store: Arc<MemoryStore>,
    engine: Arc<AggregationEngine>,
    bus: Arc<ChangeBus>,
    status: Mutex<ViewStatus>,
}

impl Materializer {
    fn status(&self) -> MutexGuard<'_, ViewStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run(&self, tasks: Receiver<ViewTask>) {
        for task in tasks.iter() {
            match task {
                ViewTask::Recompute => self.recompute(),
                ViewTask::Flush(done) => {
                    let _ = done.send(());
                }
                ViewTask::Stop => break,
            }
        }
        self.status().state = ViewState::Dropped;
    }

    fn populate(&self) -> Result<(), DbError> {
        let result = self.compute()?;
        let changes = ChangeSet::difference(Vec::new(), result.clone()).to_changes(&self.ns);
        self.apply(&changes)?;
        self.bus.publish_all(&changes);
        tracing::info!(ns = %self.ns, view_on = %self.view_on, n = result.len(), "view populated");

        let mut status = self.status();
        status.last_good = result;
        status.state = ViewState::Steady;
        Ok(())
    }

    fn recompute(&self) {
        self.status().state = ViewState::Recomputing;
        let outcome = self.try_recompute();

        let mut status = self.status();
        match outcome {
            Ok(result) => {
                status.last_good = result;
                status.last_error = None;
            }
            Err(e) => {
                tracing::error!(ns = %self.ns, error = %e, "view recomputation failed");
                self.restore(&status.last_good);
                status.last_error = Some(e);
            }
        }
        status.state = ViewState::Steady;
    }

    fn try_recompute(&self) -> Result<Vec<Document>, DbError> {
        let result = self.compute()?;
        let current = self.store.documents(&self.ns.coll);
        let changes = ChangeSet::difference(current, result.clone()).to_changes(&self.ns);
        self.apply(&changes)?;
        self.bus.publish_all(&changes);
        Ok(result)
    }

    /// Puts the store back to `last_good` after a partial write.
    fn restore(&self, last_good: &[Document]) {
        let current = self.store.documents(&self.ns.coll);
        let changes = ChangeSet::difference(current, last_good.to_vec()).to_changes(&self.ns);
        if let Err(e) = self.apply(&changes) {
            tracing::error!(ns = %self.ns, error = %e, "failed to restore view contents");
        }
    }

    fn compute(&self) -> Result<Vec<Document>, DbError> {
        let docs = self.engine.collect(
            &self.view_on,
            AggregateInput::Collection(self.view_on.coll.clone()),
            self.pipeline.clone(),
            None,
        )?;
        Ok(docs.into_iter().map(ensure_id).collect())
    }

    fn apply(&self, changes: &[ChangeStreamDocument]) -> Result<(), DbError> {
        if changes.is_empty() {
            return Ok(());
        }
        let errors = self.store.write(changes, WriteOptions { ordered: true })?;
        match errors.first() {
            Some(first) => Err(DbError::SinkWrite {
                ns: self.ns.clone(),
                errmsg: first.errmsg.clone(),
            }),
            None => Ok(()),
        }
    }
}

// ── Registry ────────────────────────────────────────────────────

/// Live views by namespace. Reads are lock-free snapshots.
#[derive(Default)]
pub(crate) struct ViewRegistry {
    views: ArcSwap<HashMap<Namespace, Arc<View>>>,
}

impl ViewRegistry {
    pub(crate) fn get(&self, ns: &Namespace) -> Option<Arc<View>> {
        self.views.load().get(ns).cloned()
    }

    pub(crate) fn contains(&self, ns: &Namespace) -> bool {
        self.views.load().contains_key(ns)
    }

    pub(crate) fn insert(&self, view: Arc<View>) {
        self.views.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(view.ns().clone(), Arc::clone(&view));
            next
        });
    }

    pub(crate) fn remove(&self, ns: &Namespace) -> Option<Arc<View>> {
        let mut removed = None;
        self.views.rcu(|current| {
            let mut next = HashMap::clone(current);
            removed = next.remove(ns);
            next
        });
        removed
    }

    /// Empties the registry, returning what it held.
    pub(crate) fn drain(&self) -> Vec<Arc<View>> {
        let old = self.views.swap(Arc::new(HashMap::new()));
        old.values().cloned().collect()
    }
}
