//! Batch-scoped context store
//!
//! A [`BatchContext`] is created fresh for every batch and dropped when the
//! batch reaches its terminal outcome. Filters keep per-batch state in it
//! under [`ContextKey`]s they generate once at construction, so two filters
//! (or two instances of the same filter type) never collide and nothing set
//! during one batch is visible to another.
//!
//! The context also carries a handle to the writer persisting the batch, so a
//! filter can reach the target alongside its own state.

use crate::message::BatchInfo;
use crate::writer::TargetWriter;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

static NEXT_KEY_ID: AtomicU64 = AtomicU64::new(1);

/// Statically typed key into a [`BatchContext`]
pub struct ContextKey<T> {
    id: u64,
    label: Arc<str>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> ContextKey<T> {
    /// Allocate a key that no other key in this process shares
    pub fn unique(label: impl Into<Arc<str>>) -> Self {
        Self {
            id: NEXT_KEY_ID.fetch_add(1, Ordering::Relaxed),
            label: label.into(),
            _marker: PhantomData,
        }
    }
}

impl<T> ContextKey<T> {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<T> Clone for ContextKey<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            label: self.label.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for ContextKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextKey({}#{})", self.label, self.id)
    }
}

type Slot = Box<dyn Any + Send + Sync>;

/// Per-batch key/value store plus the identity and writer of the active batch
pub struct BatchContext {
    info: BatchInfo,
    writer: Option<Arc<dyn TargetWriter>>,
    values: HashMap<u64, Slot>,
}

impl BatchContext {
    /// Create an empty context for a batch
    pub fn new(info: BatchInfo) -> Self {
        trace!(batch_id = info.batch_id, node_group = %info.node_group_id, "Opening batch context");
        Self {
            info,
            writer: None,
            values: HashMap::new(),
        }
    }

    /// Builder: attach the writer that persists this batch
    pub fn with_writer(mut self, writer: Arc<dyn TargetWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Writer of the active batch, when the context was opened by a processor
    pub fn writer(&self) -> Option<&Arc<dyn TargetWriter>> {
        self.writer.as_ref()
    }

    /// Identity of the batch this context belongs to
    pub fn batch(&self) -> &BatchInfo {
        &self.info
    }

    pub fn batch_id(&self) -> u64 {
        self.info.batch_id
    }

    pub fn node_group_id(&self) -> &str {
        &self.info.node_group_id
    }

    pub fn get<T: 'static>(&self, key: &ContextKey<T>) -> Option<&T> {
        self.values.get(&key.id).and_then(|slot| slot.downcast_ref())
    }

    pub fn get_mut<T: 'static>(&mut self, key: &ContextKey<T>) -> Option<&mut T> {
        self.values.get_mut(&key.id).and_then(|slot| slot.downcast_mut())
    }

    /// Store a value, returning the previous one
    pub fn put<T: Send + Sync + 'static>(&mut self, key: &ContextKey<T>, value: T) -> Option<T> {
        self.values
            .insert(key.id, Box::new(value))
            .and_then(|prev| prev.downcast().ok().map(|b| *b))
    }

    /// Remove and return a value
    pub fn remove<T: 'static>(&mut self, key: &ContextKey<T>) -> Option<T> {
        self.values
            .remove(&key.id)
            .and_then(|slot| slot.downcast().ok().map(|b| *b))
    }

    pub fn contains<T>(&self, key: &ContextKey<T>) -> bool {
        self.values.contains_key(&key.id)
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for BatchContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchContext")
            .field("info", &self.info)
            .field("writer", &self.writer.as_ref().map(|w| w.name()))
            .field("entries", &self.values.len())
            .finish()
    }
}

impl Drop for BatchContext {
    fn drop(&mut self) {
        trace!(
            batch_id = self.info.batch_id,
            discarded = self.values.len(),
            "Disposing batch context"
        );
    }
}
