//! Client-level error types.

use sdr_cell::{CellError, StorageError};
use sdr_net::NetError;

/// Errors surfaced by the session, the mirror and the coordinator.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Cell(#[from] CellError),

    /// Transport failure. Never fatal: the session retries.
    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// No cell exists at this path in the mirrored tree.
    #[error("no cell at {0}")]
    UnknownPath(String),

    /// The action was refused locally and nothing was sent.
    #[error("invalid action on {path}: {reason}")]
    InvalidAction { path: String, reason: String },

    #[error("not connected")]
    NotConnected,
}
