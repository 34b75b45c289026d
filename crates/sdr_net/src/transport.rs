//! The boundary between the session state machine and the wire.
//!
//! A [`Transport`] opens one session per connection attempt and reports what
//! happens on it as [`TransportEvent`]s tagged with that attempt number. The
//! receiving side drops events whose attempt is not the current one, so a
//! slow socket from a previous attempt cannot disturb the state machine.

use tokio::sync::mpsc::UnboundedSender;

use crate::error::NetError;
use crate::messages::{ActionFrame, Snapshot, StateDelta};

/// What happened on a session.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEventKind {
    /// The server answered the hello. The session is live.
    Handshake(Snapshot),
    Delta(StateDelta),
    /// The attempt never reached the handshake.
    ConnectFailed(String),
    /// A live session ended.
    Closed(String),
}

/// An event from connection attempt `attempt`.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    pub attempt: u64,
    pub kind: TransportEventKind,
}

/// A way of reaching the radio server.
pub trait Transport {
    /// Start attempt `attempt`, replacing any session still open. Progress
    /// is reported on `events`; this call itself never blocks.
    fn connect(&mut self, attempt: u64, events: UnboundedSender<TransportEvent>);

    /// Queue an action on the live session.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::TransportClosed`] when no session is open.
    fn send(&mut self, frame: &ActionFrame) -> Result<(), NetError>;

    /// Tear the current session down without reporting it.
    fn close(&mut self);
}
