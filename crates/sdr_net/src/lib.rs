//! # sdr_net
//!
//! Wire layer of the radio control client.
//!
//! This crate provides:
//!
//! - [`messages`] — hello, snapshot, delta and action frames.
//! - [`codec`] — MessagePack serialisation/deserialisation helpers.
//! - [`subjects`] — NATS subject builders.
//! - [`transport`] — the [`Transport`] trait the session state machine drives.
//! - [`connection`] — [`NatsTransport`], the NATS implementation.
//! - [`backoff`] — retry delay policies.
//! - [`error`] — Network-layer error types.

pub mod backoff;
pub mod codec;
pub mod connection;
pub mod error;
pub mod messages;
pub mod subjects;
pub mod transport;

pub use backoff::{Backoff, BackoffPolicy};
pub use codec::{decode, encode};
pub use connection::{DEFAULT_NATS_URL, NATS_URL_ENV, NatsTransport};
pub use error::NetError;
pub use messages::{
    ActionFrame, BlockDesc, CellContent, CellDesc, Hello, PROTOCOL_VERSION, Snapshot, StateDelta,
};
pub use transport::{Transport, TransportEvent, TransportEventKind};
