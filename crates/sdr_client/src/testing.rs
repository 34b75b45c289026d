//! In-memory transport and fixtures for the session and client tests.

use std::cell::RefCell;
use std::rc::Rc;

use sdr_cell::ValueType;
use sdr_net::{
    ActionFrame, BlockDesc, NetError, Snapshot, StateDelta, Transport, TransportEvent,
    TransportEventKind,
};
use tokio::sync::mpsc::UnboundedSender;

/// What the client did to the transport, and the handle to answer it.
#[derive(Default)]
pub(crate) struct Wire {
    pub connects: Vec<u64>,
    pub sent: Vec<ActionFrame>,
    pub closes: usize,
    events: Option<UnboundedSender<TransportEvent>>,
}

impl Wire {
    /// The attempt most recently started.
    pub fn attempt(&self) -> u64 {
        self.connects.last().copied().unwrap_or(0)
    }

    /// An event for the current attempt.
    pub fn event(&self, kind: TransportEventKind) -> TransportEvent {
        TransportEvent {
            attempt: self.attempt(),
            kind,
        }
    }

    /// Push an event through the channel the client listens on.
    pub fn emit(&self, kind: TransportEventKind) {
        if let Some(events) = &self.events {
            events.send(self.event(kind)).unwrap();
        }
    }
}

pub(crate) struct ScriptedTransport {
    wire: Rc<RefCell<Wire>>,
    open: bool,
}

impl ScriptedTransport {
    pub fn new() -> (Self, Rc<RefCell<Wire>>) {
        let wire = Rc::new(RefCell::new(Wire::default()));
        (
            Self {
                wire: wire.clone(),
                open: false,
            },
            wire,
        )
    }
}

impl Transport for ScriptedTransport {
    fn connect(&mut self, attempt: u64, events: UnboundedSender<TransportEvent>) {
        let mut wire = self.wire.borrow_mut();
        wire.connects.push(attempt);
        wire.events = Some(events);
        self.open = true;
    }

    fn send(&mut self, frame: &ActionFrame) -> Result<(), NetError> {
        if !self.open {
            return Err(NetError::TransportClosed);
        }
        self.wire.borrow_mut().sent.push(frame.clone());
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
        self.wire.borrow_mut().closes += 1;
    }
}

/// A small radio: a tunable source and one receiver.
pub(crate) fn radio_snapshot(freq: f64) -> Snapshot {
    let source = BlockDesc::new("OsmoSDRSource")
        .capability("source")
        .capability("device")
        .value(
            "freq",
            ValueType::range(0.0, 4294967295.0),
            true,
            serde_json::json!(freq),
        )
        .value("correction_ppm", ValueType::Float, true, serde_json::json!(0.0))
        .value("agc", ValueType::Bool, true, serde_json::json!(false))
        .value("gain", ValueType::loose_range(0.0, 49.6), true, serde_json::json!(20.0))
        .value("sample_rate", ValueType::Int, false, serde_json::json!(2_400_000));
    let receiver = BlockDesc::new("Receiver")
        .capability("receiver")
        .value(
            "mode",
            ValueType::enumeration(["AM", "NFM", "WFM", "USB", "LSB"]),
            true,
            serde_json::json!("WFM"),
        )
        .value("rec_freq", ValueType::Float, true, serde_json::json!(freq));
    Snapshot {
        root: BlockDesc::new("Radio")
            .capability("top")
            .block("source", source)
            .block("receivers", BlockDesc::new("Receivers").block("a", receiver)),
    }
}

pub(crate) fn handshake(freq: f64) -> TransportEventKind {
    TransportEventKind::Handshake(radio_snapshot(freq))
}

pub(crate) fn value_delta(path: &[&str], value: serde_json::Value) -> TransportEventKind {
    TransportEventKind::Delta(StateDelta::Value {
        path: path.iter().map(|s| s.to_string()).collect(),
        value,
    })
}
