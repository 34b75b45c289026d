//! Connection lifecycle.
//!
//! ```text
//!  Disconnected ──connect()──▶ Connecting ──handshake──▶ Connected
//!        ▲                      │     ▲                      │
//!        │                      └fail─┘ (after backoff)      │
//!        └──────────────── transport closed ◀────────────────┘
//!
//!  any state ──shutdown()──▶ Failed (terminal)
//! ```
//!
//! The manager owns the transport, the [`Mirror`] of remote state and the
//! status indicator cell. Transport errors are never fatal: every failure
//! schedules another attempt. Each attempt has a number, and events carrying
//! any other number are dropped.

use sdr_cell::{Cell, Context, RemoteCell, Value};
use sdr_net::{
    ActionFrame, Backoff, StateDelta, Transport, TransportEvent, TransportEventKind,
};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::coordinator::ActionRequest;
use crate::error::ClientError;
use crate::mirror::{Mirror, path_key};
use crate::status::{ConnectionStatus, StatusReport, StatusReporter};

/// Buffered reports per observer before the slowest one starts lagging.
const REPORT_CAPACITY: usize = 64;

/// A change in session state the client must react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionChange {
    /// A handshake completed. `first` is true only for the first one.
    Connected { first: bool },
    Lost,
}

/// What woke the manager up.
#[derive(Debug)]
pub enum Wake {
    Event(TransportEvent),
    Retry,
}

/// An optimistic value awaiting the server's verdict.
#[derive(Debug)]
struct PendingAction {
    seq: u64,
    key: String,
    previous: Value,
}

/// Drives a [`Transport`] through connect, resync and retry.
pub struct ConnectionManager<T: Transport> {
    transport: T,
    status: ConnectionStatus,
    indicator: RemoteCell,
    reporter: StatusReporter,
    reports: broadcast::Sender<StatusReport>,
    backoff: Backoff,
    attempt: u64,
    retry_at: Option<Instant>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    mirror: Mirror,
    connections: u64,
    optimistic: bool,
    next_seq: u64,
    pending: Vec<PendingAction>,
}

impl<T: Transport> ConnectionManager<T> {
    /// A manager in `Disconnected`. Nothing happens until [`connect`].
    ///
    /// [`connect`]: ConnectionManager::connect
    ///
    /// # Errors
    ///
    /// Propagates cell errors from creating the mirror and indicator.
    pub fn new(ctx: &Context, transport: T, config: &ClientConfig) -> Result<Self, ClientError> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (reports, _) = broadcast::channel(REPORT_CAPACITY);
        Ok(Self {
            transport,
            status: ConnectionStatus::Disconnected,
            indicator: RemoteCell::new(
                ctx,
                ConnectionStatus::value_type(),
                ConnectionStatus::Disconnected.as_str().into(),
                false,
            )?,
            reporter: StatusReporter::new(config.failure_reporting),
            reports,
            backoff: Backoff::new(config.backoff),
            attempt: 0,
            retry_at: None,
            events_tx,
            events,
            mirror: Mirror::new(ctx)?,
            connections: 0,
            optimistic: config.optimistic,
            next_seq: 1,
            pending: Vec::new(),
        })
    }

    // ── Observation ─────────────────────────────────────────────────────────

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Read-only cell mirroring [`ConnectionManager::status`].
    #[must_use]
    pub fn status_cell(&self) -> Cell {
        self.indicator.cell()
    }

    /// The mirrored root cell. Null until the first handshake.
    #[must_use]
    pub fn root(&self) -> Cell {
        self.mirror.root()
    }

    #[must_use]
    pub fn mirror(&self) -> &Mirror {
        &self.mirror
    }

    /// Receive every [`StatusReport`] emitted from now on.
    pub fn subscribe_reports(&self) -> broadcast::Receiver<StatusReport> {
        self.reports.subscribe()
    }

    /// Number of the current (or last) attempt.
    #[must_use]
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Completed handshakes.
    #[must_use]
    pub fn connections(&self) -> u64 {
        self.connections
    }

    /// When the next attempt is due, if one is scheduled.
    #[must_use]
    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    #[must_use]
    pub fn reporter(&self) -> &StatusReporter {
        &self.reporter
    }

    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    // ── Transitions ─────────────────────────────────────────────────────────

    /// Start a new attempt. Ignored once shut down.
    pub fn connect(&mut self) {
        if self.status == ConnectionStatus::Failed {
            return;
        }
        self.attempt += 1;
        self.retry_at = None;
        self.set_status(ConnectionStatus::Connecting);
        if let Some(report) = self.reporter.connecting(self.attempt) {
            self.report(report);
        }
        self.transport.connect(self.attempt, self.events_tx.clone());
    }

    /// Wait for the next transport event or for the retry timer.
    pub async fn wait(&mut self) -> Wake {
        let retry_at = self.retry_at;
        tokio::select! {
            Some(event) = self.events.recv() => Wake::Event(event),
            () = sleep_until(retry_at) => Wake::Retry,
        }
    }

    /// Wait for and process one wake-up.
    ///
    /// # Errors
    ///
    /// See [`ConnectionManager::handle_event`].
    pub async fn step(&mut self, ctx: &Context) -> Result<Option<SessionChange>, ClientError> {
        match self.wait().await {
            Wake::Event(event) => self.handle_event(ctx, event),
            Wake::Retry => {
                self.connect();
                Ok(None)
            }
        }
    }

    /// Apply one transport event.
    ///
    /// # Errors
    ///
    /// Returns an error when the server sends state that does not fit the
    /// mirrored tree. The session stays up.
    pub fn handle_event(
        &mut self,
        ctx: &Context,
        event: TransportEvent,
    ) -> Result<Option<SessionChange>, ClientError> {
        if event.attempt != self.attempt || self.status == ConnectionStatus::Failed {
            debug!(
                event_attempt = event.attempt,
                attempt = self.attempt,
                "ignoring event from stale attempt"
            );
            return Ok(None);
        }

        match event.kind {
            TransportEventKind::Handshake(snapshot) => {
                if self.status != ConnectionStatus::Connecting {
                    debug!(attempt = self.attempt, "ignoring repeated handshake");
                    return Ok(None);
                }
                if let Err(err) = self.mirror.apply_snapshot(ctx, &snapshot) {
                    warn!(attempt = self.attempt, %err, "unusable snapshot, dropping connection");
                    self.transport.close();
                    if let Some(report) = self.reporter.failed_connect(self.attempt, &err.to_string()) {
                        self.report(report);
                    }
                    self.schedule_retry();
                    return Ok(None);
                }
                self.set_status(ConnectionStatus::Connected);
                self.backoff.reset();
                self.connections += 1;
                self.pending.clear();
                let report = self.reporter.connected(self.attempt);
                self.report(report);
                Ok(Some(SessionChange::Connected {
                    first: self.connections == 1,
                }))
            }
            TransportEventKind::Delta(delta) => {
                if self.status != ConnectionStatus::Connected {
                    debug!("ignoring delta before handshake");
                    return Ok(None);
                }
                self.apply_delta(ctx, delta)?;
                Ok(None)
            }
            TransportEventKind::ConnectFailed(reason) => {
                if self.status != ConnectionStatus::Connecting {
                    return Ok(None);
                }
                if let Some(report) = self.reporter.failed_connect(self.attempt, &reason) {
                    self.report(report);
                }
                self.schedule_retry();
                Ok(None)
            }
            TransportEventKind::Closed(reason) => match self.status {
                ConnectionStatus::Connected => {
                    self.set_status(ConnectionStatus::Disconnected);
                    self.pending.clear();
                    let report = self.reporter.disconnected(&reason);
                    self.report(report);
                    self.schedule_retry();
                    Ok(Some(SessionChange::Lost))
                }
                ConnectionStatus::Connecting => {
                    if let Some(report) = self.reporter.failed_connect(self.attempt, &reason) {
                        self.report(report);
                    }
                    self.schedule_retry();
                    Ok(None)
                }
                ConnectionStatus::Disconnected | ConnectionStatus::Failed => Ok(None),
            },
        }
    }

    /// Send a validated action. In optimistic mode the value is applied to
    /// the mirror at once and rolled back if the server rejects it.
    ///
    /// # Errors
    ///
    /// [`ClientError::NotConnected`] outside `Connected`, or the transport's
    /// error if the frame cannot be queued. In optimistic mode the path and
    /// value are checked against the mirror first, and a failure there sends
    /// nothing.
    pub fn send_action(&mut self, request: ActionRequest) -> Result<u64, ClientError> {
        let key = path_key(&request.path);
        if self.status != ConnectionStatus::Connected {
            warn!(path = %key, status = %self.status, "dropping action while not connected");
            return Err(ClientError::NotConnected);
        }
        let Some(json) = request.value.to_json() else {
            return Err(ClientError::InvalidAction {
                path: key,
                reason: format!("{} cannot be sent", request.value.describe()),
            });
        };

        let seq = self.next_seq;
        let optimistic = if self.optimistic {
            let previous = self
                .mirror
                .value_at(&key)
                .ok_or_else(|| ClientError::UnknownPath(key.clone()))?;
            Some((previous, self.mirror.admit(&key, request.value)?))
        } else {
            None
        };

        self.transport.send(&ActionFrame {
            seq,
            path: request.path,
            value: json,
        })?;
        self.next_seq += 1;
        debug!(seq, path = %key, "action dispatched");

        if let Some((previous, value)) = optimistic {
            self.mirror.apply_value(&key, value)?;
            self.pending.push(PendingAction { seq, key, previous });
        }
        Ok(seq)
    }

    /// Close the transport for good.
    pub fn shutdown(&mut self) {
        if self.status == ConnectionStatus::Failed {
            return;
        }
        self.transport.close();
        self.retry_at = None;
        self.pending.clear();
        self.set_status(ConnectionStatus::Failed);
        info!(attempt = self.attempt, "session shut down");
    }

    // ── Internals ───────────────────────────────────────────────────────────

    fn apply_delta(&mut self, ctx: &Context, delta: StateDelta) -> Result<(), ClientError> {
        match &delta {
            StateDelta::Rejected { seq, reason } => {
                self.roll_back(*seq, reason);
                Ok(())
            }
            StateDelta::Value { path, .. } | StateDelta::Block { path, .. } => {
                let key = path_key(path);
                self.pending.retain(|p| p.key != key);
                self.mirror.apply_delta(ctx, &delta)
            }
        }
    }

    fn roll_back(&mut self, seq: u64, reason: &str) {
        let Some(index) = self.pending.iter().position(|p| p.seq == seq) else {
            warn!(seq, reason, "action rejected");
            return;
        };
        let rejected = self.pending.remove(index);
        // A later optimistic write to the same cell stays visible; it now
        // rolls back to what preceded the rejected one.
        if let Some(later) = self.pending[index..]
            .iter_mut()
            .find(|p| p.key == rejected.key)
        {
            later.previous = rejected.previous;
            warn!(seq, reason, path = %rejected.key, "action rejected");
            return;
        }
        warn!(seq, reason, path = %rejected.key, "action rejected, rolling back");
        if let Err(err) = self.mirror.apply_value(&rejected.key, rejected.previous) {
            warn!(path = %rejected.key, %err, "rollback failed");
        }
    }

    fn schedule_retry(&mut self) {
        let delay = self.backoff.next_delay();
        self.retry_at = Some(Instant::now() + delay);
        debug!(attempt = self.attempt, delay_ms = delay.as_millis() as u64, "retry scheduled");
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        self.status = status;
        if let Err(err) = self.indicator.apply(status.as_str().into()) {
            warn!(%err, "status indicator rejected update");
        }
    }

    fn report(&self, report: StatusReport) {
        // No receivers is fine; reports are also logged.
        let _ = self.reports.send(report);
    }
}

impl<T: Transport> std::fmt::Debug for ConnectionManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("status", &self.status)
            .field("attempt", &self.attempt)
            .field("connections", &self.connections)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedTransport, Wire, handshake, radio_snapshot, value_delta};
    use sdr_net::{BackoffPolicy, CellContent};
    use std::cell::RefCell;
    use std::rc::Rc;

    type Manager = ConnectionManager<ScriptedTransport>;

    fn manager(config: ClientConfig) -> (Context, Manager, Rc<RefCell<Wire>>) {
        let ctx = Context::in_memory();
        let (transport, wire) = ScriptedTransport::new();
        let manager = ConnectionManager::new(&ctx, transport, &config).unwrap();
        (ctx, manager, wire)
    }

    fn feed(ctx: &Context, manager: &mut Manager, wire: &Rc<RefCell<Wire>>, kind: TransportEventKind) -> Option<SessionChange> {
        let event = wire.borrow().event(kind);
        manager.handle_event(ctx, event).unwrap()
    }

    fn drain(rx: &mut broadcast::Receiver<StatusReport>) -> Vec<StatusReport> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn freq(manager: &Manager) -> Option<Value> {
        manager.mirror().value_at("source/freq")
    }

    #[test]
    fn test_failed_attempt_reports_once_and_writes_after_connect() {
        let (ctx, mut manager, wire) = manager(ClientConfig::default());
        let mut reports = manager.subscribe_reports();

        manager.connect();
        feed(&ctx, &mut manager, &wire, TransportEventKind::ConnectFailed("refused".into()));
        assert!(manager.retry_at().is_some());
        assert!(manager.root().get().as_block().is_none());

        manager.connect();
        let change = feed(&ctx, &mut manager, &wire, handshake(98e6));

        assert_eq!(change, Some(SessionChange::Connected { first: true }));
        assert_eq!(
            drain(&mut reports),
            vec![
                StatusReport::Connecting,
                StatusReport::FailedConnect {
                    reason: "refused".into()
                },
                StatusReport::Connected,
            ]
        );
        assert!(manager.root().get().as_block().is_some());
        assert_eq!(wire.borrow().connects, vec![1, 2]);
    }

    #[test]
    fn test_repeated_failures_are_suppressed_but_retried() {
        let config = ClientConfig::default().with_backoff(BackoffPolicy::Fixed { delay_ms: 10 });
        let (ctx, mut manager, wire) = manager(config);
        let mut reports = manager.subscribe_reports();
        for _ in 0..3 {
            manager.connect();
            feed(&ctx, &mut manager, &wire, TransportEventKind::ConnectFailed("refused".into()));
        }
        assert_eq!(drain(&mut reports).len(), 2);
        assert_eq!(manager.reporter().suppressed(), 2);
        assert_eq!(wire.borrow().connects.len(), 3);
        assert_eq!(manager.status(), ConnectionStatus::Connecting);
    }

    #[test]
    fn test_stale_attempt_events_are_ignored() {
        let (ctx, mut manager, wire) = manager(ClientConfig::default());
        manager.connect();
        let stale = wire.borrow().event(handshake(98e6));
        manager.connect();

        assert_eq!(manager.handle_event(&ctx, stale).unwrap(), None);
        assert_eq!(manager.status(), ConnectionStatus::Connecting);
        assert!(manager.root().get().as_block().is_none());
    }

    #[test]
    fn test_unusable_handshake_counts_as_failed_connect() {
        let (ctx, mut manager, wire) = manager(ClientConfig::default());
        let mut reports = manager.subscribe_reports();
        manager.connect();

        let mut snapshot = radio_snapshot(98e6);
        snapshot.root.find_mut(&["source", "agc"]).unwrap().content =
            CellContent::Value(serde_json::json!("yes"));
        let change = feed(&ctx, &mut manager, &wire, TransportEventKind::Handshake(snapshot));

        assert_eq!(change, None);
        assert_eq!(manager.status(), ConnectionStatus::Connecting);
        assert_eq!(manager.connections(), 0);
        assert!(manager.retry_at().is_some());
        assert!(manager.root().get().as_block().is_none());
        assert_eq!(wire.borrow().closes, 1);
        let reports = drain(&mut reports);
        assert_eq!(reports[0], StatusReport::Connecting);
        assert!(matches!(reports[1], StatusReport::FailedConnect { .. }));
        assert_eq!(reports.len(), 2);

        manager.connect();
        let change = feed(&ctx, &mut manager, &wire, handshake(98e6));
        assert_eq!(change, Some(SessionChange::Connected { first: true }));
    }

    #[test]
    fn test_optimistic_ill_typed_action_is_not_sent() {
        let (ctx, mut manager, wire) = manager(ClientConfig::default().with_optimistic(true));
        manager.connect();
        feed(&ctx, &mut manager, &wire, handshake(98e6));

        let err = manager
            .send_action(ActionRequest {
                path: vec!["source".into(), "agc".into()],
                value: Value::from("on"),
            })
            .unwrap_err();
        assert!(matches!(err, ClientError::Cell(_)));
        assert!(wire.borrow().sent.is_empty());
        assert_eq!(manager.mirror().value_at("source/agc"), Some(Value::Bool(false)));

        let seq = manager
            .send_action(ActionRequest {
                path: vec!["source".into(), "agc".into()],
                value: Value::Bool(true),
            })
            .unwrap();
        assert_eq!(seq, 1);
    }

    #[test]
    fn test_delta_before_handshake_is_ignored() {
        let (ctx, mut manager, wire) = manager(ClientConfig::default());
        manager.connect();
        feed(&ctx, &mut manager, &wire, value_delta(&["source", "freq"], serde_json::json!(1e6)));
        feed(&ctx, &mut manager, &wire, handshake(98e6));
        assert_eq!(freq(&manager), Some(Value::Float(98e6)));
    }

    #[test]
    fn test_close_moves_to_disconnected_and_schedules_retry() {
        let (ctx, mut manager, wire) = manager(ClientConfig::default());
        manager.connect();
        feed(&ctx, &mut manager, &wire, handshake(98e6));
        let change = feed(&ctx, &mut manager, &wire, TransportEventKind::Closed("eof".into()));
        assert_eq!(change, Some(SessionChange::Lost));
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert!(manager.retry_at().is_some());

        manager.connect();
        let change = feed(&ctx, &mut manager, &wire, handshake(99e6));
        assert_eq!(change, Some(SessionChange::Connected { first: false }));
        assert_eq!(freq(&manager), Some(Value::Float(99e6)));
    }

    #[test]
    fn test_status_cell_follows_transitions() {
        let (ctx, mut manager, wire) = manager(ClientConfig::default());
        let status = manager.status_cell();
        assert_eq!(status.get(), Value::from("disconnected"));
        manager.connect();
        assert_eq!(status.get(), Value::from("connecting"));
        feed(&ctx, &mut manager, &wire, handshake(98e6));
        assert_eq!(status.get(), Value::from("connected"));
        manager.shutdown();
        assert_eq!(status.get(), Value::from("failed"));
        assert!(status.set("connected").is_err());
    }

    #[test]
    fn test_action_while_disconnected_is_not_sent() {
        let (_ctx, mut manager, wire) = manager(ClientConfig::default());
        let err = manager
            .send_action(ActionRequest {
                path: vec!["source".into(), "agc".into()],
                value: Value::Bool(true),
            })
            .unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
        assert!(wire.borrow().sent.is_empty());
    }

    #[test]
    fn test_optimistic_action_rolls_back_on_rejection() {
        let (ctx, mut manager, wire) = manager(ClientConfig::default().with_optimistic(true));
        manager.connect();
        feed(&ctx, &mut manager, &wire, handshake(98e6));

        let seq = manager
            .send_action(ActionRequest {
                path: vec!["source".into(), "freq".into()],
                value: Value::Float(101e6),
            })
            .unwrap();
        assert_eq!(freq(&manager), Some(Value::Float(101e6)));
        assert_eq!(wire.borrow().sent[0].seq, seq);

        feed(
            &ctx,
            &mut manager,
            &wire,
            TransportEventKind::Delta(StateDelta::Rejected {
                seq,
                reason: "tuner out of range".into(),
            }),
        );
        assert_eq!(freq(&manager), Some(Value::Float(98e6)));
    }

    #[test]
    fn test_confirmed_action_is_not_rolled_back() {
        let (ctx, mut manager, wire) = manager(ClientConfig::default().with_optimistic(true));
        manager.connect();
        feed(&ctx, &mut manager, &wire, handshake(98e6));
        let seq = manager
            .send_action(ActionRequest {
                path: vec!["source".into(), "freq".into()],
                value: Value::Float(101e6),
            })
            .unwrap();
        feed(&ctx, &mut manager, &wire, value_delta(&["source", "freq"], serde_json::json!(101e6)));
        feed(
            &ctx,
            &mut manager,
            &wire,
            TransportEventKind::Delta(StateDelta::Rejected {
                seq,
                reason: "late".into(),
            }),
        );
        assert_eq!(freq(&manager), Some(Value::Float(101e6)));
    }

    #[test]
    fn test_server_confirmed_mode_waits_for_delta() {
        let (ctx, mut manager, wire) = manager(ClientConfig::default());
        manager.connect();
        feed(&ctx, &mut manager, &wire, handshake(98e6));
        manager
            .send_action(ActionRequest {
                path: vec!["source".into(), "freq".into()],
                value: Value::Float(101e6),
            })
            .unwrap();
        assert_eq!(freq(&manager), Some(Value::Float(98e6)));
        feed(&ctx, &mut manager, &wire, value_delta(&["source", "freq"], serde_json::json!(101e6)));
        assert_eq!(freq(&manager), Some(Value::Float(101e6)));
    }

    #[test]
    fn test_shutdown_is_terminal() {
        let (ctx, mut manager, wire) = manager(ClientConfig::default());
        manager.connect();
        manager.shutdown();
        assert_eq!(wire.borrow().closes, 1);
        manager.connect();
        assert_eq!(wire.borrow().connects, vec![1]);
        assert_eq!(feed(&ctx, &mut manager, &wire, handshake(98e6)), None);
        assert_eq!(manager.status(), ConnectionStatus::Failed);
    }

    #[tokio::test]
    async fn test_step_delivers_queued_event() {
        let (ctx, mut manager, wire) = manager(ClientConfig::default());
        manager.connect();
        wire.borrow().emit(handshake(98e6));
        let change = manager.step(&ctx).await.unwrap();
        assert_eq!(change, Some(SessionChange::Connected { first: true }));
    }

    #[tokio::test]
    async fn test_step_retries_when_timer_fires() {
        let config = ClientConfig::default().with_backoff(BackoffPolicy::Fixed { delay_ms: 1 });
        let (ctx, mut manager, wire) = manager(config);
        manager.connect();
        feed(&ctx, &mut manager, &wire, TransportEventKind::ConnectFailed("refused".into()));
        assert_eq!(manager.step(&ctx).await.unwrap(), None);
        assert_eq!(wire.borrow().connects, vec![1, 2]);
    }
}
