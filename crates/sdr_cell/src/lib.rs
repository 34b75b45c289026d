//! # sdr_cell
//!
//! The reactive core of the radio control client: observable values, the
//! scheduler that delivers their change notifications, and the composites
//! built from them.
//!
//! This crate provides:
//!
//! - [`Value`] and [`ValueType`] — dynamic values and the constraints cells
//!   declare over them.
//! - [`Cell`] — an observable slot (constant, local, derived or remote) with
//!   batched listeners; [`RemoteCell`] is the write handle for server state.
//! - [`Scheduler`] — set-semantics task queue flushed in rounds.
//! - [`BlockRef`] — a named group of cells declaring [`Capability`] tags.
//! - [`Index`] — live lists of reachable blocks by capability or kind.
//! - [`Storage`] and [`persistent_cell`] — preferences that survive restarts.
//! - [`Context`] — the scheduler, storage and id allocator, passed explicitly.
//!
//! Everything here is single-threaded (`Rc`, `RefCell`). The host runs it on
//! one task and drives [`Scheduler::flush`] whenever [`Scheduler::wait`]
//! resolves.

pub mod block;
pub mod cell;
pub mod context;
pub mod error;
pub mod index;
pub mod scheduler;
pub mod storage;
pub mod value;

pub use block::{BlockBuilder, BlockId, BlockRef, Capability};
pub use cell::{Cell, CellId, CellKind, Equality, ListenerHandle, RemoteCell};
pub use context::Context;
pub use error::CellError;
pub use index::Index;
pub use scheduler::{DEFAULT_MAX_ROUNDS, FlushStats, Scheduler, Task, TaskId};
pub use storage::{
    JsonFileStorage, MemoryStorage, Storage, StorageError, StorageNamespace, persistent_cell,
};
pub use value::{Opaque, Value, ValueType};
