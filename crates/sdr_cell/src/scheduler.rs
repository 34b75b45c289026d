//! Cooperative batching scheduler.
//!
//! Cells never call their listeners directly. A change enqueues the
//! listeners' [`Task`]s and the host loop later runs [`Scheduler::flush`],
//! so any number of synchronous `set` calls collapse into one notification
//! per listener.
//!
//! A flush runs in **rounds**. Each round snapshots the pending queue, clears
//! it, and runs every snapshotted task once. Tasks enqueued while a round is
//! running land in the next round, never the current one. Rounds repeat until
//! the queue is empty or the round cap is hit, at which point the remaining
//! work is dropped and [`CellError::SchedulerStarvation`] is returned.

use std::cell::{Cell as StdCell, RefCell};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::rc::Rc;

use tokio::sync::Notify;
use tracing::{error, trace};

use crate::error::CellError;

/// Default number of rounds a single flush may run.
pub const DEFAULT_MAX_ROUNDS: usize = 100;

/// Identity of a scheduled callback. Enqueueing is idempotent per id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

/// A callback the scheduler can run. Clones share identity and the
/// cancellation flag.
#[derive(Clone)]
pub struct Task {
    id: TaskId,
    active: Rc<StdCell<bool>>,
    run: Rc<dyn Fn()>,
}

impl Task {
    /// Returns the task's identity.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Stop the task from running in any later round, including one that has
    /// already snapshotted it.
    pub fn cancel(&self) {
        self.active.set(false);
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.get()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("active", &self.active.get())
            .finish()
    }
}

/// Counters describing one completed flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Rounds executed.
    pub rounds: usize,
    /// Tasks invoked across all rounds.
    pub invoked: usize,
}

struct SchedulerInner {
    pending: RefCell<VecDeque<Task>>,
    queued: RefCell<HashSet<TaskId>>,
    flushing: StdCell<bool>,
    next_task: StdCell<u64>,
    max_rounds: usize,
    wake: Notify,
}

/// Single-threaded batching dispatcher. Cheap to clone; clones share the
/// queue.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<SchedulerInner>,
}

impl Scheduler {
    /// Create a scheduler whose flushes give up after `max_rounds` rounds.
    #[must_use]
    pub fn new(max_rounds: usize) -> Self {
        Self {
            inner: Rc::new(SchedulerInner {
                pending: RefCell::new(VecDeque::new()),
                queued: RefCell::new(HashSet::new()),
                flushing: StdCell::new(false),
                next_task: StdCell::new(0),
                max_rounds,
                wake: Notify::new(),
            }),
        }
    }

    /// Wrap a callback as a task with a fresh identity.
    pub fn task(&self, run: impl Fn() + 'static) -> Task {
        let id = self.inner.next_task.get();
        self.inner.next_task.set(id + 1);
        Task {
            id: TaskId(id),
            active: Rc::new(StdCell::new(true)),
            run: Rc::new(run),
        }
    }

    /// Queue a task for the next round. A task already pending is not queued
    /// twice; a cancelled task is ignored.
    pub fn enqueue(&self, task: &Task) {
        if !task.is_active() {
            return;
        }
        if self.inner.queued.borrow_mut().insert(task.id) {
            self.inner.pending.borrow_mut().push_back(task.clone());
            self.inner.wake.notify_one();
        }
    }

    /// Whether any task is waiting for a flush.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.inner.pending.borrow().is_empty()
    }

    /// Whether a flush is currently running.
    #[must_use]
    pub fn is_flushing(&self) -> bool {
        self.inner.flushing.get()
    }

    /// Run pending tasks until the queue is empty.
    ///
    /// Calling `flush` from inside a task is a no-op: the outer flush picks
    /// the new work up in its next round.
    ///
    /// # Errors
    ///
    /// Returns [`CellError::SchedulerStarvation`] when work is still pending
    /// after the round cap. The remaining work is discarded.
    pub fn flush(&self) -> Result<FlushStats, CellError> {
        if self.inner.flushing.get() {
            return Ok(FlushStats::default());
        }
        let _guard = FlushGuard::enter(&self.inner.flushing);
        let mut stats = FlushStats::default();

        loop {
            let batch: Vec<Task> = {
                let mut pending = self.inner.pending.borrow_mut();
                if pending.is_empty() {
                    return Ok(stats);
                }
                pending.drain(..).collect()
            };
            self.inner.queued.borrow_mut().clear();

            if stats.rounds == self.inner.max_rounds {
                error!(
                    rounds = stats.rounds,
                    dropped = batch.len(),
                    "scheduler starvation, dropping pending callbacks"
                );
                return Err(CellError::SchedulerStarvation {
                    rounds: stats.rounds,
                    pending: batch.len(),
                });
            }

            stats.rounds += 1;
            trace!(round = stats.rounds, tasks = batch.len(), "flush round");
            for task in batch {
                if task.is_active() {
                    (task.run)();
                    stats.invoked += 1;
                }
            }
        }
    }

    /// Resolve once work is pending. This is the host-idle hook: the event
    /// loop awaits it and then calls [`Scheduler::flush`].
    pub async fn wait(&self) {
        if self.has_pending() {
            return;
        }
        self.inner.wake.notified().await;
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ROUNDS)
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.inner.pending.borrow().len())
            .field("flushing", &self.inner.flushing.get())
            .field("max_rounds", &self.inner.max_rounds)
            .finish()
    }
}

/// Clears the flushing flag even if a task panics.
struct FlushGuard<'a>(&'a StdCell<bool>);

impl<'a> FlushGuard<'a> {
    fn enter(flag: &'a StdCell<bool>) -> Self {
        flag.set(true);
        Self(flag)
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter() -> (Rc<StdCell<usize>>, impl Fn() + 'static) {
        let count = Rc::new(StdCell::new(0));
        let c = count.clone();
        (count, move || c.set(c.get() + 1))
    }

    #[test]
    fn test_enqueue_twice_runs_once() {
        let scheduler = Scheduler::default();
        let (count, f) = counter();
        let task = scheduler.task(f);
        scheduler.enqueue(&task);
        scheduler.enqueue(&task);
        let stats = scheduler.flush().unwrap();
        assert_eq!(count.get(), 1);
        assert_eq!(stats.rounds, 1);
        assert_eq!(stats.invoked, 1);
    }

    #[test]
    fn test_task_enqueued_during_round_runs_next_round() {
        let scheduler = Scheduler::default();
        let (count, f) = counter();
        let second = scheduler.task(f);
        let s = scheduler.clone();
        let second_clone = second.clone();
        let first = scheduler.task(move || s.enqueue(&second_clone));
        scheduler.enqueue(&first);
        let stats = scheduler.flush().unwrap();
        assert_eq!(count.get(), 1);
        assert_eq!(stats.rounds, 2);
    }

    #[test]
    fn test_self_enqueue_is_deferred_not_recursive() {
        let scheduler = Scheduler::new(5);
        let runs = Rc::new(StdCell::new(0usize));
        let slot: Rc<RefCell<Option<Task>>> = Rc::new(RefCell::new(None));
        let (s, r, sl) = (scheduler.clone(), runs.clone(), slot.clone());
        let task = scheduler.task(move || {
            r.set(r.get() + 1);
            if let Some(me) = sl.borrow().as_ref() {
                s.enqueue(me);
            }
        });
        *slot.borrow_mut() = Some(task.clone());
        scheduler.enqueue(&task);

        let err = scheduler.flush().unwrap_err();
        assert_eq!(
            err,
            CellError::SchedulerStarvation {
                rounds: 5,
                pending: 1
            }
        );
        // One run per round, never more.
        assert_eq!(runs.get(), 5);
        assert!(!scheduler.has_pending());
        assert!(!scheduler.is_flushing());
    }

    #[test]
    fn test_cancelled_task_skipped_even_if_snapshotted() {
        let scheduler = Scheduler::default();
        let (count, f) = counter();
        let victim = scheduler.task(f);
        let victim_clone = victim.clone();
        let canceller = scheduler.task(move || victim_clone.cancel());
        scheduler.enqueue(&canceller);
        scheduler.enqueue(&victim);
        scheduler.flush().unwrap();
        assert_eq!(count.get(), 0);

        scheduler.enqueue(&victim);
        assert!(!scheduler.has_pending());
    }

    #[test]
    fn test_nested_flush_is_noop() {
        let scheduler = Scheduler::default();
        let nested = Rc::new(StdCell::new(None));
        let (s, n) = (scheduler.clone(), nested.clone());
        let task = scheduler.task(move || n.set(Some(s.flush().unwrap())));
        scheduler.enqueue(&task);
        scheduler.flush().unwrap();
        assert_eq!(nested.get(), Some(FlushStats::default()));
    }

    #[tokio::test]
    async fn test_wait_resolves_when_work_pending() {
        let scheduler = Scheduler::default();
        let (count, f) = counter();
        let task = scheduler.task(f);
        scheduler.enqueue(&task);
        scheduler.wait().await;
        scheduler.flush().unwrap();
        assert_eq!(count.get(), 1);
    }
}
