//! Work queues coupling the pipeline stages.
//!
//! Each queue is an in-memory FIFO mirrored into the state store: the
//! durable row is written before the in-memory push, and removed only when
//! the consumer acks the item. Across restarts the store is the source of
//! truth and the memory side is rehydrated from it. A file is pending at
//! most once at a time — leased items keep their reservation until acked
//! or nacked.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::database::store::{KnownFileId, QueueKind, SkipReason, StoreError};
use crate::database::writer::Store;

/// Location hint carried by convert items so the converter can resolve
/// paths without another store query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertHint {
    pub folder_path: PathBuf,
    pub file_name: String,
}

/// A convert-queue entry: the file id plus an optional location hint.
/// Items rehydrated from the store carry no hint and fall back to the
/// store (then a folder scan) for path resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertItem {
    pub id: KnownFileId,
    pub hint: Option<ConvertHint>,
}

impl ConvertItem {
    pub fn bare(id: KnownFileId) -> Self {
        Self { id, hint: None }
    }
}

/// Items a queue can carry.
pub trait QueueEntry: Send + 'static {
    fn known_file_id(&self) -> KnownFileId;
}

impl QueueEntry for KnownFileId {
    fn known_file_id(&self) -> KnownFileId {
        *self
    }
}

impl QueueEntry for ConvertItem {
    fn known_file_id(&self) -> KnownFileId {
        self.id
    }
}

struct Inner<T> {
    items: VecDeque<T>,
    /// Ids queued or leased; cleared on ack/nack. Enforces the
    /// at-most-once-pending rule without consulting the store.
    reserved: HashSet<KnownFileId>,
}

/// An in-memory FIFO with a durable mirror in the state store.
pub struct WorkQueue<T> {
    kind: QueueKind,
    store: Store,
    inner: Arc<Mutex<Inner<T>>>,
    notify: Arc<Notify>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            store: self.store.clone(),
            inner: Arc::clone(&self.inner),
            notify: Arc::clone(&self.notify),
        }
    }
}

impl<T: QueueEntry> WorkQueue<T> {
    pub fn new(kind: QueueKind, store: Store) -> Self {
        Self {
            kind,
            store,
            inner: Arc::new(Mutex::new(Inner {
                items: VecDeque::new(),
                reserved: HashSet::new(),
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Admits an item: durable row first, then the in-memory push. Returns
    /// false when the file is already pending, leased, or skip-recorded.
    pub async fn enqueue(&self, item: T) -> Result<bool, StoreError> {
        let id = item.known_file_id();
        if self.inner.lock().reserved.contains(&id) {
            return Ok(false);
        }
        if !self.store.enqueue(self.kind, id).await? {
            return Ok(false);
        }
        {
            let mut inner = self.inner.lock();
            inner.reserved.insert(id);
            inner.items.push_back(item);
        }
        self.notify.notify_one();
        Ok(true)
    }

    /// Takes the next item, waiting until one is available. The item stays
    /// leased (durable row intact) until [`ack`](Self::ack) or
    /// [`nack`](Self::nack).
    pub async fn pop(&self) -> T {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking pop used to drain every currently-ready item.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().items.pop_front()
    }

    /// Completes a lease: the durable row is removed and the file becomes
    /// eligible for re-admission.
    pub async fn ack(&self, id: KnownFileId) -> Result<(), StoreError> {
        self.store.ack(self.kind, id).await?;
        self.inner.lock().reserved.remove(&id);
        Ok(())
    }

    /// Fails a lease: the durable row stays for inspection and a skip
    /// record is written atomically, blocking re-admission.
    pub async fn nack(&self, id: KnownFileId, reason: SkipReason) -> Result<(), StoreError> {
        self.store.nack(id, reason).await?;
        self.inner.lock().reserved.remove(&id);
        Ok(())
    }

    /// Puts a leased item back at the tail for a later cycle, keeping its
    /// reservation and durable row.
    pub fn requeue(&self, item: T) {
        self.inner.lock().items.push_back(item);
        self.notify.notify_one();
    }

    /// Fills the memory side from durable rows at startup. No store writes.
    pub fn rehydrate(&self, items: Vec<T>) {
        let mut inner = self.inner.lock();
        for item in items {
            inner.reserved.insert(item.known_file_id());
            inner.items.push_back(item);
        }
        drop(inner);
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Ids currently queued in memory, FIFO order. Leased items are not
    /// included; the shutdown path requeues in-flight work before calling
    /// this.
    pub fn snapshot_ids(&self) -> Vec<KnownFileId> {
        self.inner
            .lock()
            .items
            .iter()
            .map(|item| item.known_file_id())
            .collect()
    }

    /// Ids reserved but not queued: work leased to a consumer that has not
    /// acked yet. The shutdown exporter puts these back at the head so a
    /// partially processed item is not lost.
    pub fn leased_ids(&self) -> Vec<KnownFileId> {
        let inner = self.inner.lock();
        let queued: HashSet<KnownFileId> =
            inner.items.iter().map(|item| item.known_file_id()).collect();
        inner
            .reserved
            .iter()
            .filter(|id| !queued.contains(id))
            .copied()
            .collect()
    }
}
