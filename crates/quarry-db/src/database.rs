use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bson::Document;
use crossbeam::channel::Receiver;
use quarry_store::{ChangeStreamDocument, DocumentAccess, Namespace, Storage};

use crate::aggregator::{AggregatorFactory, MemoryAggregatorFactory};
use crate::change_bus::{ChangeBus, ListenerId};
use crate::command::Command;
use crate::config::DatabaseConfig;
use crate::cursor::CursorRegistry;
use crate::engine::AggregationEngine;
use crate::error::DbError;
use crate::view::{View, ViewRegistry};

/// Command entry point over a set of backend databases.
///
/// Owns the cursor registry, the change bus and every live view. Dropping
/// the database stops the view workers.
pub struct Database {
    access: Arc<dyn DocumentAccess>,
    config: DatabaseConfig,
    cursors: Arc<CursorRegistry>,
    bus: Arc<ChangeBus>,
    views: Arc<ViewRegistry>,
    engine: Arc<AggregationEngine>,
    /// Serializes `create` and `drop`.
    admin: Mutex<()>,
}

impl Database {
    /// Opens a database evaluating pipelines in memory.
    pub fn open(access: Arc<dyn DocumentAccess>, config: DatabaseConfig) -> Self {
        Self::with_aggregator(access, config, Arc::new(MemoryAggregatorFactory))
    }

    pub fn with_aggregator(
        access: Arc<dyn DocumentAccess>,
        config: DatabaseConfig,
        factory: Arc<dyn AggregatorFactory>,
    ) -> Self {
        let cursors = Arc::new(CursorRegistry::new());
        let bus = Arc::new(ChangeBus::new());
        let views = Arc::new(ViewRegistry::default());
        let engine = Arc::new(AggregationEngine::new(
            Arc::clone(&access),
            Arc::clone(&views),
            Arc::clone(&cursors),
            factory,
            Arc::clone(&bus),
        ));
        Self {
            access,
            config,
            cursors,
            bus,
            views,
            engine,
            admin: Mutex::new(()),
        }
    }

    /// Runs one command document against `ns.db`. The first key of `cmd`
    /// names the verb.
    pub fn command(&self, ns: &Namespace, cmd: Document) -> Result<Document, DbError> {
        let command = Command::parse(&cmd)?;
        tracing::debug!(ns = %ns, command = command.name(), "dispatching command");
        command.execute(self, &ns.db)
    }

    /// A channel receiving every change applied from now on.
    pub fn subscribe(&self) -> Receiver<ChangeStreamDocument> {
        self.bus.subscribe()
    }

    pub fn listen<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ChangeStreamDocument) -> bool + Send + Sync + 'static,
    {
        self.bus.listen(listener)
    }

    pub fn unlisten(&self, id: ListenerId) -> bool {
        self.bus.unlisten(id)
    }

    pub fn view(&self, ns: &Namespace) -> Option<Arc<View>> {
        self.views.get(ns)
    }

    pub fn engine(&self) -> &Arc<AggregationEngine> {
        &self.engine
    }

    pub fn cursors(&self) -> &Arc<CursorRegistry> {
        &self.cursors
    }

    pub fn bus(&self) -> &Arc<ChangeBus> {
        &self.bus
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub(crate) fn views(&self) -> &ViewRegistry {
        &self.views
    }

    pub(crate) fn storage(&self, db: &str) -> Result<Arc<dyn Storage>, DbError> {
        Ok(self.access.storage(db)?)
    }

    /// Views are read-only to commands.
    pub(crate) fn ensure_writable(&self, ns: &Namespace) -> Result<(), DbError> {
        if self.views.contains(ns) {
            return Err(DbError::ViewReadOnly(ns.clone()));
        }
        Ok(())
    }

    pub(crate) fn admin_lock(&self) -> MutexGuard<'_, ()> {
        self.admin.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        for view in self.views.drain() {
            view.stop();
        }
    }
}
