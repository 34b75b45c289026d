//! # sdr_client
//!
//! Remote control client for a software-defined radio server.
//!
//! This crate provides:
//!
//! - [`ConnectionManager`] — the session state machine with backoff,
//!   attempt numbering and resynchronization.
//! - [`Mirror`] — the session-owned copy of the server's block tree.
//! - [`Coordinator`] — validated user operations (`tune`, `set_gain`, ...).
//! - [`Client`] — the event loop tying them to a [`sdr_cell::Context`].
//! - [`ClientConfig`] — configuration for a client process.

pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod mirror;
pub mod session;
pub mod status;

#[cfg(test)]
mod testing;

pub use client::{Client, LAST_FREQ_KEY, SAVE_INTERVAL, Wiring};
pub use config::ClientConfig;
pub use coordinator::{ActionRequest, Coordinator};
pub use error::ClientError;
pub use mirror::Mirror;
pub use session::{ConnectionManager, SessionChange, Wake};
pub use status::{ConnectionStatus, FailureReporting, StatusReport, StatusReporter};
