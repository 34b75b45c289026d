//! Cell-layer error types.

use crate::cell::CellId;

/// Errors raised by cells and the scheduler.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CellError {
    /// A value does not satisfy a cell's declared [`ValueType`](crate::ValueType).
    #[error("type mismatch: expected {expected}, got {found}")]
    TypeMismatch {
        /// Description of the declared constraint.
        expected: String,
        /// Description of the rejected value.
        found: String,
    },

    /// `set` was called on a constant or derived cell.
    #[error("cell {0} is not writable")]
    NotWritable(CellId),

    /// `set` was called on a cell that mirrors remote state.
    #[error("cell {0} mirrors remote state and can only change through its session")]
    RemoteOwned(CellId),

    /// A flush exceeded its round cap, which indicates a dependency cycle.
    #[error("scheduler starved: {pending} callbacks still pending after {rounds} rounds")]
    SchedulerStarvation {
        /// Number of rounds executed before giving up.
        rounds: usize,
        /// Number of callbacks that were dropped.
        pending: usize,
    },
}
