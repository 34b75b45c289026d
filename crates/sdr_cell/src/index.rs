//! Capability index over a block graph.
//!
//! The [`Index`] walks every block reachable from a root cell, following only
//! cells declared as [`ValueType::Block`], and keeps ordered lists of the
//! blocks that implement a capability or have a given kind. The walk records
//! visited block ids, so shared subtrees and cycles are reported once.
//!
//! The watch set is rebuilt on every recompute: the root cell plus each
//! block-typed cell met during the walk. A change to any of them schedules a
//! single recompute task; scalar cells are never watched.

use std::cell::{Cell as StdCell, RefCell};
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::block::{BlockId, BlockRef, Capability};
use crate::cell::{Cell, CellId, ListenerHandle};
use crate::context::{Context, IdSource};
use crate::scheduler::{Scheduler, Task};
use crate::value::Value;

struct IndexInner {
    root: Cell,
    task: Task,
    scheduler: Scheduler,
    ids: IdSource,
    watches: RefCell<Vec<ListenerHandle>>,
    members: RefCell<Vec<BlockRef>>,
    by_capability: RefCell<Vec<(Capability, Cell)>>,
    by_kind: RefCell<Vec<(String, Cell)>>,
    recomputations: StdCell<u64>,
}

/// Discovery service for blocks reachable from a root cell.
pub struct Index {
    inner: Rc<IndexInner>,
}

impl Index {
    /// Index everything reachable from `root`. The first walk happens now;
    /// later walks run on the scheduler after a watched cell changes.
    #[must_use]
    pub fn new(ctx: &Context, root: Cell) -> Self {
        let inner = Rc::new_cyclic(|weak: &std::rc::Weak<IndexInner>| {
            let weak = weak.clone();
            let task = ctx.scheduler().task(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.recompute();
                }
            });
            IndexInner {
                root,
                task,
                scheduler: ctx.scheduler().clone(),
                ids: ctx.id_source(),
                watches: RefCell::new(Vec::new()),
                members: RefCell::new(Vec::new()),
                by_capability: RefCell::new(Vec::new()),
                by_kind: RefCell::new(Vec::new()),
                recomputations: StdCell::new(0),
            }
        });
        inner.recompute();
        Self { inner }
    }

    /// A cell holding the list of reachable blocks that declare `tag`, in
    /// discovery order. It changes only when that list changes.
    pub fn implementing(&self, tag: impl Into<Capability>) -> Cell {
        let tag = tag.into();
        if let Some((_, view)) = self
            .inner
            .by_capability
            .borrow()
            .iter()
            .find(|(t, _)| *t == tag)
        {
            return view.clone();
        }
        let view = self.inner.new_view(self.inner.select(|b| b.implements(&tag)));
        self.inner
            .by_capability
            .borrow_mut()
            .push((tag, view.clone()));
        view
    }

    /// A cell holding the reachable blocks whose kind is `kind`.
    pub fn of_kind(&self, kind: &str) -> Cell {
        if let Some((_, view)) = self
            .inner
            .by_kind
            .borrow()
            .iter()
            .find(|(k, _)| k == kind)
        {
            return view.clone();
        }
        let view = self.inner.new_view(self.inner.select(|b| b.kind() == kind));
        self.inner
            .by_kind
            .borrow_mut()
            .push((kind.to_string(), view.clone()));
        view
    }

    /// Every reachable block, root first.
    #[must_use]
    pub fn members(&self) -> Vec<BlockRef> {
        self.inner.members.borrow().clone()
    }

    /// Snapshot of the reachable blocks declaring `tag`.
    #[must_use]
    pub fn members_implementing(&self, tag: &Capability) -> Vec<BlockRef> {
        self.inner
            .members
            .borrow()
            .iter()
            .filter(|b| b.implements(tag))
            .cloned()
            .collect()
    }

    /// How many walks have run, the initial one included.
    #[must_use]
    pub fn recomputations(&self) -> u64 {
        self.inner.recomputations.get()
    }
}

impl Drop for Index {
    fn drop(&mut self) {
        self.inner.task.cancel();
        for watch in self.inner.watches.borrow_mut().drain(..) {
            watch.cancel();
        }
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Index")
            .field("root", &self.inner.root.id())
            .field("members", &self.inner.members.borrow().len())
            .field("watches", &self.inner.watches.borrow().len())
            .field("recomputations", &self.inner.recomputations.get())
            .finish()
    }
}

impl IndexInner {
    fn recompute(&self) {
        for watch in self.watches.borrow_mut().drain(..) {
            watch.cancel();
        }

        let mut watches = vec![self.root.subscribe(&self.task)];
        let mut members = Vec::new();
        let mut visited = HashSet::new();
        if let Value::Block(block) = self.root.get() {
            self.visit(&block, &mut visited, &mut members, &mut watches);
        }

        debug!(
            members = members.len(),
            watches = watches.len(),
            "index recomputed"
        );
        *self.watches.borrow_mut() = watches;
        *self.members.borrow_mut() = members;
        self.recomputations.set(self.recomputations.get() + 1);
        self.refresh_views();
    }

    fn visit(
        &self,
        block: &BlockRef,
        visited: &mut HashSet<BlockId>,
        members: &mut Vec<BlockRef>,
        watches: &mut Vec<ListenerHandle>,
    ) {
        if !visited.insert(block.id()) {
            return;
        }
        members.push(block.clone());
        for (_, cell) in block.cells() {
            if !cell.value_type().is_composite() {
                continue;
            }
            watches.push(cell.subscribe(&self.task));
            if let Value::Block(child) = cell.get() {
                self.visit(&child, visited, members, watches);
            }
        }
    }

    fn select(&self, keep: impl Fn(&BlockRef) -> bool) -> Vec<Value> {
        self.members
            .borrow()
            .iter()
            .filter(|b| keep(b))
            .map(|b| Value::Block(b.clone()))
            .collect()
    }

    fn new_view(&self, items: Vec<Value>) -> Cell {
        Cell::view(CellId(self.ids.next()), &self.scheduler, items)
    }

    fn refresh_views(&self) {
        for (tag, view) in self.by_capability.borrow().iter() {
            let items = self.select(|b| b.implements(tag));
            if let Err(err) = view.replace(Value::List(items)) {
                warn!(capability = %tag, %err, "index view rejected update");
            }
        }
        for (kind, view) in self.by_kind.borrow().iter() {
            let items = self.select(|b| b.kind() == kind);
            if let Err(err) = view.replace(Value::List(items)) {
                warn!(kind = %kind, %err, "index view rejected update");
            }
        }
    }
}
