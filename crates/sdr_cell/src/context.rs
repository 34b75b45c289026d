//! The explicit context shared by every component.

use std::cell::Cell as StdCell;
use std::fmt;
use std::rc::Rc;

use crate::scheduler::Scheduler;
use crate::storage::{MemoryStorage, StorageNamespace};

/// Scheduler, storage namespace and identity allocator for one client.
///
/// Built once at startup and passed by reference to whatever needs it;
/// there are no process-wide singletons.
pub struct Context {
    scheduler: Scheduler,
    storage: StorageNamespace,
    ids: IdSource,
}

impl Context {
    #[must_use]
    pub fn new(scheduler: Scheduler, storage: StorageNamespace) -> Self {
        Self {
            scheduler,
            storage,
            ids: IdSource(Rc::new(StdCell::new(1))),
        }
    }

    /// A context with a default scheduler and throwaway in-memory storage.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(
            Scheduler::default(),
            StorageNamespace::new(Rc::new(MemoryStorage::default()), ""),
        )
    }

    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    #[must_use]
    pub fn storage(&self) -> &StorageNamespace {
        &self.storage
    }

    /// Allocate an identity shared by cells and blocks.
    pub(crate) fn next_id(&self) -> u64 {
        self.ids.next()
    }

    /// A handle on the identity allocator for components that create cells
    /// after construction.
    pub(crate) fn id_source(&self) -> IdSource {
        self.ids.clone()
    }
}

/// Shared identity counter.
#[derive(Debug, Clone)]
pub(crate) struct IdSource(Rc<StdCell<u64>>);

impl IdSource {
    pub(crate) fn next(&self) -> u64 {
        let id = self.0.get();
        self.0.set(id + 1);
        id
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("scheduler", &self.scheduler)
            .field("storage", &self.storage)
            .field("next_id", &self.ids.0.get())
            .finish()
    }
}
