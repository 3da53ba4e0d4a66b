use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crossbeam::channel::{Receiver, unbounded};
use quarry_store::{
    ChangeStreamDocument, StoreError, Writable, WriteError, WriteOptions,
};

/// Handle returned by [`ChangeBus::listen`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A listener returns `false` once it no longer wants changes.
type Listener = Box<dyn Fn(&ChangeStreamDocument) -> bool + Send + Sync>;

/// Fan-out of applied changes.
///
/// Publication is serialized, so every listener observes changes in
/// publication order. Listeners run on the publishing thread and must
/// not publish themselves.
pub struct ChangeBus {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeBus {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn listen<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ChangeStreamDocument) -> bool + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, Box::new(listener)));
        id
    }

    pub fn unlisten(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// A channel receiving every change published from now on. The
    /// subscription ends when the receiver is dropped.
    pub fn subscribe(&self) -> Receiver<ChangeStreamDocument> {
        let (tx, rx) = unbounded();
        self.listen(move |change| tx.send(change.clone()).is_ok());
        rx
    }

    pub fn publish(&self, change: &ChangeStreamDocument) {
        self.publish_all(std::slice::from_ref(change));
    }

    pub fn publish_all(&self, changes: &[ChangeStreamDocument]) {
        if changes.is_empty() {
            return;
        }
        let mut listeners = self.lock();
        let mut finished = HashSet::new();
        for change in changes {
            for (id, listener) in listeners.iter() {
                if !finished.contains(id) && !listener(change) {
                    finished.insert(*id);
                }
            }
        }
        if !finished.is_empty() {
            listeners.retain(|(id, _)| !finished.contains(id));
        }
    }

    pub fn listener_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(ListenerId, Listener)>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A [`Writable`] that publishes every change it applied successfully.
pub struct PublishingWritable {
    inner: Arc<dyn Writable>,
    bus: Arc<ChangeBus>,
}

impl PublishingWritable {
    pub fn new(inner: Arc<dyn Writable>, bus: Arc<ChangeBus>) -> Self {
        Self { inner, bus }
    }
}

impl Writable for PublishingWritable {
    fn write(
        &self,
        changes: &[ChangeStreamDocument],
        options: WriteOptions,
    ) -> Result<Vec<WriteError>, StoreError> {
        let errors = self.inner.write(changes, options)?;
        let failed: HashSet<usize> = errors.iter().map(|e| e.index).collect();
        // An ordered write stops at its first failure.
        let attempted = match (options.ordered, errors.first()) {
            (true, Some(first)) => first.index,
            _ => changes.len(),
        };
        let applied: Vec<ChangeStreamDocument> = changes[..attempted]
            .iter()
            .enumerate()
            .filter(|(i, _)| !failed.contains(i))
            .map(|(_, c)| c.clone())
            .collect();
        self.bus.publish_all(&applied);
        Ok(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use quarry_store::{MemoryStore, Namespace};
    use std::sync::atomic::AtomicUsize;

    fn insert(id: i32) -> ChangeStreamDocument {
        ChangeStreamDocument::insert(Namespace::new("db", "c"), doc! { "_id": id })
    }

    #[test]
    fn subscribers_see_changes_in_order() {
        let bus = ChangeBus::new();
        let rx = bus.subscribe();
        bus.publish(&insert(1));
        bus.publish_all(&[insert(2), insert(3)]);
        let keys: Vec<_> = rx.try_iter().map(|c| c.document_key.unwrap()).collect();
        assert_eq!(keys, vec![1.into(), 2.into(), 3.into()]);
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let bus = ChangeBus::new();
        drop(bus.subscribe());
        assert_eq!(bus.listener_count(), 1);
        bus.publish(&insert(1));
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn unlisten_stops_callbacks() {
        let bus = ChangeBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let id = bus.listen(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });
        bus.publish(&insert(1));
        assert!(bus.unlisten(id));
        bus.publish(&insert(2));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn publishing_writable_skips_failures() {
        let bus = Arc::new(ChangeBus::new());
        let rx = bus.subscribe();
        let writer = PublishingWritable::new(Arc::new(MemoryStore::new()), Arc::clone(&bus));

        let errors = writer
            .write(&[insert(1), insert(1), insert(2)], WriteOptions { ordered: false })
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(rx.try_iter().count(), 2);

        let errors = writer
            .write(&[insert(3), insert(1), insert(4)], WriteOptions { ordered: true })
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(rx.try_iter().count(), 1);
    }
}
