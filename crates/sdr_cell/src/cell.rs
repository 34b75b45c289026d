//! Observable, type-constrained value slots.
//!
//! Every cell kind shares one contract: [`Cell::get`] reads, [`Cell::listen`]
//! registers a callback that the [`Scheduler`] runs after the value changes.
//! The kinds differ only in who may write:
//!
//! | kind       | writer                                   |
//! |------------|------------------------------------------|
//! | `Constant` | nobody                                   |
//! | `Local`    | anyone, through [`Cell::set`]            |
//! | `Derived`  | the cell's own recompute task            |
//! | `Remote`   | the holder of the [`RemoteCell`] handle  |

use std::cell::{Cell as StdCell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::warn;

use crate::context::Context;
use crate::error::CellError;
use crate::scheduler::{Scheduler, Task};
use crate::value::{Value, ValueType};

/// Identity of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(pub u64);

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which party may change a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Constant,
    Local,
    Derived,
    /// Mirrors server state. `writable` says whether the server accepts
    /// actions targeting this cell.
    Remote { writable: bool },
}

/// When a new value counts as a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Equality {
    /// Skip notification when the new value equals the old one.
    #[default]
    Value,
    /// Skip notification only when the same block or opaque object is stored
    /// again. Scalars always notify.
    Identity,
}

struct Listener {
    id: u64,
    task: Task,
}

struct CellInner {
    id: CellId,
    kind: CellKind,
    value_type: ValueType,
    equality: StdCell<Equality>,
    value: RefCell<Value>,
    listeners: RefCell<Vec<Listener>>,
    next_listener: StdCell<u64>,
    scheduler: Scheduler,
    /// Subscriptions a derived cell holds on its dependencies.
    sources: RefCell<Vec<ListenerHandle>>,
}

/// A shared handle to an observable value slot.
#[derive(Clone)]
pub struct Cell {
    inner: Rc<CellInner>,
}

impl Cell {
    fn build(
        ctx: &Context,
        kind: CellKind,
        value_type: ValueType,
        initial: Value,
    ) -> Result<Self, CellError> {
        let initial = value_type.admit(initial)?;
        Ok(Self::assemble(
            CellId(ctx.next_id()),
            ctx.scheduler(),
            kind,
            value_type,
            initial,
        ))
    }

    fn assemble(
        id: CellId,
        scheduler: &Scheduler,
        kind: CellKind,
        value_type: ValueType,
        initial: Value,
    ) -> Self {
        Self {
            inner: Rc::new(CellInner {
                id,
                kind,
                value_type,
                equality: StdCell::new(Equality::default()),
                value: RefCell::new(initial),
                listeners: RefCell::new(Vec::new()),
                next_listener: StdCell::new(0),
                scheduler: scheduler.clone(),
                sources: RefCell::new(Vec::new()),
            }),
        }
    }

    /// A cell that never changes. Its type is inferred from the value.
    #[must_use]
    pub fn constant(ctx: &Context, value: Value) -> Self {
        let value_type = ValueType::of(&value);
        Self::assemble(
            CellId(ctx.next_id()),
            ctx.scheduler(),
            CellKind::Constant,
            value_type,
            value,
        )
    }

    /// A derived list cell written by its owner through [`Cell::replace`].
    pub(crate) fn view(id: CellId, scheduler: &Scheduler, items: Vec<Value>) -> Self {
        Self::assemble(
            id,
            scheduler,
            CellKind::Derived,
            ValueType::List,
            Value::List(items),
        )
    }

    /// A process-local mutable cell.
    ///
    /// # Errors
    ///
    /// Returns [`CellError::TypeMismatch`] if `initial` violates `value_type`.
    pub fn local(ctx: &Context, value_type: ValueType, initial: Value) -> Result<Self, CellError> {
        Self::build(ctx, CellKind::Local, value_type, initial)
    }

    /// A cell computed from other cells. `compute` runs once now and then at
    /// most once per flush round in which any dependency changed.
    ///
    /// # Errors
    ///
    /// Returns [`CellError::TypeMismatch`] if the first computed value
    /// violates `value_type`. Later violations are logged and ignored.
    pub fn derived<F>(
        ctx: &Context,
        value_type: ValueType,
        deps: &[Cell],
        compute: F,
    ) -> Result<Self, CellError>
    where
        F: Fn() -> Value + 'static,
    {
        let cell = Self::build(ctx, CellKind::Derived, value_type, compute())?;
        let weak = Rc::downgrade(&cell.inner);
        let task = ctx.scheduler().task(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let cell = Cell { inner };
            if let Err(err) = cell.replace(compute()) {
                warn!(cell = %cell.id(), %err, "derived value rejected");
            }
        });
        let handles = deps.iter().map(|dep| dep.subscribe(&task)).collect();
        *cell.inner.sources.borrow_mut() = handles;
        Ok(cell)
    }

    /// Select the equality policy used to detect changes.
    #[must_use]
    pub fn with_equality(self, equality: Equality) -> Self {
        self.inner.equality.set(equality);
        self
    }

    #[must_use]
    pub fn id(&self) -> CellId {
        self.inner.id
    }

    #[must_use]
    pub fn kind(&self) -> CellKind {
        self.inner.kind
    }

    #[must_use]
    pub fn value_type(&self) -> &ValueType {
        &self.inner.value_type
    }

    /// Whether user code may request a change: local cells directly, remote
    /// cells through an action sent to the server.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        match self.inner.kind {
            CellKind::Local => true,
            CellKind::Remote { writable } => writable,
            CellKind::Constant | CellKind::Derived => false,
        }
    }

    /// Returns the current value.
    #[must_use]
    pub fn get(&self) -> Value {
        self.inner.value.borrow().clone()
    }

    /// Store a new value in a local cell. Returns whether listeners were
    /// scheduled.
    ///
    /// # Errors
    ///
    /// - [`CellError::TypeMismatch`] if `value` violates the declared type.
    ///   The cell keeps its old value and nobody is notified.
    /// - [`CellError::NotWritable`] for constant and derived cells.
    /// - [`CellError::RemoteOwned`] for remote cells.
    pub fn set(&self, value: impl Into<Value>) -> Result<bool, CellError> {
        match self.inner.kind {
            CellKind::Local => self.replace(value.into()),
            CellKind::Remote { .. } => Err(CellError::RemoteOwned(self.id())),
            CellKind::Constant | CellKind::Derived => Err(CellError::NotWritable(self.id())),
        }
    }

    /// Admit, compare and store without the kind check.
    pub(crate) fn replace(&self, value: Value) -> Result<bool, CellError> {
        let value = self.inner.value_type.admit(value)?;
        let unchanged = {
            let current = self.inner.value.borrow();
            match self.inner.equality.get() {
                Equality::Value => *current == value,
                Equality::Identity => current.same_identity(&value),
            }
        };
        if unchanged {
            return Ok(false);
        }
        self.inner.value.replace(value);
        self.notify();
        Ok(true)
    }

    fn notify(&self) {
        for listener in self.inner.listeners.borrow().iter() {
            self.inner.scheduler.enqueue(&listener.task);
        }
    }

    /// Register `callback` to run after the value changes. The callback gets
    /// the value current at the time it runs, not at the time of the change.
    pub fn listen<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&Value) + 'static,
    {
        let weak = Rc::downgrade(&self.inner);
        let task = self.inner.scheduler.task(move || {
            if let Some(inner) = weak.upgrade() {
                let value = inner.value.borrow().clone();
                callback(&value);
            }
        });
        let mut handle = self.subscribe(&task);
        handle.owns_task = true;
        handle
    }

    /// Schedule an existing task whenever this cell changes. Several cells
    /// may share one task; the scheduler still runs it once per round.
    pub fn subscribe(&self, task: &Task) -> ListenerHandle {
        let id = self.inner.next_listener.get();
        self.inner.next_listener.set(id + 1);
        self.inner.listeners.borrow_mut().push(Listener {
            id,
            task: task.clone(),
        });
        ListenerHandle {
            cell: Rc::downgrade(&self.inner),
            id,
            task: task.clone(),
            owns_task: false,
        }
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.borrow().len()
    }

    /// Identity comparison.
    #[must_use]
    pub fn ptr_eq(&self, other: &Cell) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("type", &self.inner.value_type)
            .field("value", &self.inner.value.borrow().describe())
            .finish()
    }
}

/// Deregistration handle returned by [`Cell::listen`] and
/// [`Cell::subscribe`]. Dropping it keeps the listener registered.
#[derive(Debug)]
pub struct ListenerHandle {
    cell: Weak<CellInner>,
    id: u64,
    task: Task,
    owns_task: bool,
}

impl ListenerHandle {
    /// Remove the listener. A callback already running finishes, but it is
    /// never invoked again, even if a flush in progress had already queued it.
    pub fn cancel(&self) {
        if self.owns_task {
            self.task.cancel();
        }
        if let Some(inner) = self.cell.upgrade() {
            inner.listeners.borrow_mut().retain(|l| l.id != self.id);
        }
    }
}

/// Write handle for a cell mirroring remote state.
///
/// The handle is deliberately not `Clone`: whoever owns it (the active
/// session) is the only writer. Everyone else reads through [`RemoteCell::cell`].
#[derive(Debug)]
pub struct RemoteCell {
    cell: Cell,
}

impl RemoteCell {
    /// Create a remote-mirrored cell.
    ///
    /// # Errors
    ///
    /// Returns [`CellError::TypeMismatch`] if `initial` violates `value_type`.
    pub fn new(
        ctx: &Context,
        value_type: ValueType,
        initial: Value,
        writable: bool,
    ) -> Result<Self, CellError> {
        let cell = Cell::build(ctx, CellKind::Remote { writable }, value_type, initial)?;
        Ok(Self { cell })
    }

    /// The read-only view handed to observers.
    #[must_use]
    pub fn cell(&self) -> Cell {
        self.cell.clone()
    }

    #[must_use]
    pub fn get(&self) -> Value {
        self.cell.get()
    }

    /// Store a value received from the server.
    ///
    /// # Errors
    ///
    /// Returns [`CellError::TypeMismatch`] if `value` violates the declared
    /// type; the cell is left untouched.
    pub fn apply(&self, value: Value) -> Result<bool, CellError> {
        self.cell.replace(value)
    }
}
