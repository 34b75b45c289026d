//! User-facing radio operations.
//!
//! The [`Coordinator`] checks every request against the target cell before
//! anything reaches the wire: the path must resolve, the cell must be
//! writable, and the value must satisfy the cell's declared type. A request
//! that fails any check returns [`ClientError::InvalidAction`] and produces
//! no traffic. Valid requests go to the client loop, which hands them to the
//! session.

use sdr_cell::{Cell, Value};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::mirror::path_key;
use crate::status::ConnectionStatus;

/// A validated write bound for the server.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    pub path: Vec<String>,
    pub value: Value,
}

/// Validates and queues actions against the mirrored tree.
#[derive(Debug, Clone)]
pub struct Coordinator {
    root: Cell,
    status: Cell,
    outbox: UnboundedSender<ActionRequest>,
}

impl Coordinator {
    #[must_use]
    pub fn new(root: Cell, status: Cell, outbox: UnboundedSender<ActionRequest>) -> Self {
        Self {
            root,
            status,
            outbox,
        }
    }

    /// Tune the source to `hz`.
    ///
    /// # Errors
    ///
    /// See [`Coordinator::set`].
    pub fn tune(&self, hz: f64) -> Result<(), ClientError> {
        self.set(&["source", "freq"], hz)
    }

    /// Set the source's RF gain in dB.
    ///
    /// # Errors
    ///
    /// See [`Coordinator::set`].
    pub fn set_gain(&self, db: f64) -> Result<(), ClientError> {
        self.set(&["source", "gain"], db)
    }

    /// Switch automatic gain control.
    ///
    /// # Errors
    ///
    /// See [`Coordinator::set`].
    pub fn set_agc(&self, enabled: bool) -> Result<(), ClientError> {
        self.set(&["source", "agc"], enabled)
    }

    /// Set the oscillator correction in parts per million.
    ///
    /// # Errors
    ///
    /// See [`Coordinator::set`].
    pub fn set_correction_ppm(&self, ppm: f64) -> Result<(), ClientError> {
        self.set(&["source", "correction_ppm"], ppm)
    }

    /// Request that the cell at `path` take `value`.
    ///
    /// # Errors
    ///
    /// - [`ClientError::NotConnected`] unless the session is connected.
    /// - [`ClientError::UnknownPath`] if `path` does not name a cell.
    /// - [`ClientError::InvalidAction`] if the cell is read-only or the value
    ///   violates its type.
    pub fn set<S: AsRef<str>>(&self, path: &[S], value: impl Into<Value>) -> Result<(), ClientError> {
        let key = path_key(path);
        if self.status.get().as_str() != Some(ConnectionStatus::Connected.as_str()) {
            warn!(path = %key, "dropping action while not connected");
            return Err(ClientError::NotConnected);
        }
        let cell = self.resolve(path).ok_or_else(|| ClientError::UnknownPath(key.clone()))?;
        if !cell.is_writable() {
            return Err(ClientError::InvalidAction {
                path: key,
                reason: "cell is read-only".to_string(),
            });
        }
        let value = cell
            .value_type()
            .admit(value.into())
            .map_err(|err| ClientError::InvalidAction {
                path: key.clone(),
                reason: err.to_string(),
            })?;

        debug!(path = %key, value = %value.describe(), "action queued");
        self.outbox
            .send(ActionRequest {
                path: path.iter().map(|s| s.as_ref().to_string()).collect(),
                value,
            })
            .map_err(|_| ClientError::NotConnected)
    }

    fn resolve<S: AsRef<str>>(&self, path: &[S]) -> Option<Cell> {
        self.root.get().as_block()?.resolve(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::session::ConnectionManager;
    use crate::testing::{ScriptedTransport, handshake};
    use sdr_cell::Context;
    use tokio::sync::mpsc;

    struct Fixture {
        _ctx: Context,
        _manager: ConnectionManager<ScriptedTransport>,
        coordinator: Coordinator,
        outbox: mpsc::UnboundedReceiver<ActionRequest>,
    }

    fn fixture(connected: bool) -> Fixture {
        let ctx = Context::in_memory();
        let (transport, wire) = ScriptedTransport::new();
        let mut manager =
            ConnectionManager::new(&ctx, transport, &ClientConfig::default()).unwrap();
        if connected {
            manager.connect();
            let event = wire.borrow().event(handshake(98e6));
            manager.handle_event(&ctx, event).unwrap();
        }
        let (tx, outbox) = mpsc::unbounded_channel();
        let coordinator = Coordinator::new(manager.root(), manager.status_cell(), tx);
        Fixture {
            _ctx: ctx,
            _manager: manager,
            coordinator,
            outbox,
        }
    }

    #[test]
    fn test_out_of_range_tune_is_invalid_and_silent() {
        let mut f = fixture(true);
        let err = f.coordinator.tune(5e9).unwrap_err();
        assert!(matches!(err, ClientError::InvalidAction { ref path, .. } if path == "source/freq"));
        assert!(f.outbox.try_recv().is_err());
    }

    #[test]
    fn test_valid_tune_is_queued() {
        let mut f = fixture(true);
        f.coordinator.tune(144.8e6).unwrap();
        let request = f.outbox.try_recv().unwrap();
        assert_eq!(request.path, vec!["source", "freq"]);
        assert_eq!(request.value, Value::Float(144.8e6));
    }

    #[test]
    fn test_loose_gain_range_admits_outliers() {
        let mut f = fixture(true);
        f.coordinator.set_gain(60.0).unwrap();
        assert_eq!(f.outbox.try_recv().unwrap().value, Value::Float(60.0));
    }

    #[test]
    fn test_wrong_type_is_invalid() {
        let mut f = fixture(true);
        assert!(matches!(
            f.coordinator.set(&["source", "agc"], "on"),
            Err(ClientError::InvalidAction { .. })
        ));
        f.coordinator.set_agc(true).unwrap();
        f.coordinator.set_correction_ppm(-1.5).unwrap();
        assert_eq!(f.outbox.try_recv().unwrap().value, Value::Bool(true));
        assert_eq!(f.outbox.try_recv().unwrap().value, Value::Float(-1.5));
    }

    #[test]
    fn test_read_only_cell_is_invalid() {
        let mut f = fixture(true);
        let err = f
            .coordinator
            .set(&["source", "sample_rate"], Value::Int(1_000_000))
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidAction { .. }));
        assert!(f.outbox.try_recv().is_err());
    }

    #[test]
    fn test_unknown_path() {
        let f = fixture(true);
        assert!(matches!(
            f.coordinator.set(&["source", "volume"], 1.0),
            Err(ClientError::UnknownPath(_))
        ));
    }

    #[test]
    fn test_not_connected() {
        let mut f = fixture(false);
        assert!(matches!(f.coordinator.tune(98e6), Err(ClientError::NotConnected)));
        assert!(f.outbox.try_recv().is_err());
    }

    #[test]
    fn test_enum_cell_checks_membership() {
        let mut f = fixture(true);
        assert!(f.coordinator.set(&["receivers", "a", "mode"], "SSTV").is_err());
        f.coordinator.set(&["receivers", "a", "mode"], "NFM").unwrap();
        assert_eq!(f.outbox.try_recv().unwrap().value, Value::from("NFM"));
    }
}
