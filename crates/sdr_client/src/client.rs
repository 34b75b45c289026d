//! The client event loop.
//!
//! One [`Client`] owns the [`Context`], the [`ConnectionManager`] and the
//! queue of validated actions. Its loop is the only place cells change:
//!
//! 1. Transport events and retry timers go to the session.
//! 2. Queued actions go to the session for dispatch.
//! 3. When the scheduler has work, it is flushed.
//! 4. Every [`SAVE_INTERVAL`] dirty preferences are written out.
//!
//! The first successful connection wires up the [`Index`] and the
//! [`Coordinator`] and re-tunes to the last frequency the user asked for,
//! which is kept in storage across restarts. Later reconnections only
//! resynchronize the tree.

use std::future::Future;
use std::time::Duration;

use sdr_cell::{Cell, Context, Index, ListenerHandle, Value, ValueType, persistent_cell};
use sdr_net::Transport;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::coordinator::{ActionRequest, Coordinator};
use crate::error::ClientError;
use crate::session::{ConnectionManager, SessionChange};
use crate::status::{ConnectionStatus, StatusReport};

/// How often buffered preferences are flushed to storage.
pub const SAVE_INTERVAL: Duration = Duration::from_millis(500);

/// Storage key of the last frequency passed to [`Coordinator::tune`].
pub const LAST_FREQ_KEY: &str = "last_freq";

const FREQ_PATH: [&str; 2] = ["source", "freq"];

/// Services built once, on the first connection.
#[derive(Debug)]
pub struct Wiring {
    pub index: Index,
    pub coordinator: Coordinator,
    devices: Cell,
    _devices_log: ListenerHandle,
}

impl Wiring {
    /// Reachable blocks declaring the `device` capability.
    #[must_use]
    pub fn devices(&self) -> &Cell {
        &self.devices
    }
}

enum Turn {
    Session(Result<Option<SessionChange>, ClientError>),
    Action(ActionRequest),
    Flush,
}

/// A radio control client over transport `T`.
pub struct Client<T: Transport> {
    ctx: Context,
    manager: ConnectionManager<T>,
    actions_tx: mpsc::UnboundedSender<ActionRequest>,
    actions: mpsc::UnboundedReceiver<ActionRequest>,
    wiring: Option<Wiring>,
    initializations: u64,
    last_freq: Cell,
}

impl<T: Transport> Client<T> {
    /// Build a client. Nothing connects until [`Client::run`] or
    /// [`Client::start`].
    ///
    /// # Errors
    ///
    /// Propagates cell errors from creating the session's cells.
    pub fn new(ctx: Context, transport: T, config: &ClientConfig) -> Result<Self, ClientError> {
        let manager = ConnectionManager::new(&ctx, transport, config)?;
        let (actions_tx, actions) = mpsc::unbounded_channel();
        let last_freq = persistent_cell(&ctx, LAST_FREQ_KEY, ValueType::Any, Value::Null)?;
        Ok(Self {
            ctx,
            manager,
            actions_tx,
            actions,
            wiring: None,
            initializations: 0,
            last_freq,
        })
    }

    #[must_use]
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    #[must_use]
    pub fn root(&self) -> Cell {
        self.manager.root()
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.manager.status()
    }

    #[must_use]
    pub fn status_cell(&self) -> Cell {
        self.manager.status_cell()
    }

    #[must_use]
    pub fn manager(&self) -> &ConnectionManager<T> {
        &self.manager
    }

    pub fn subscribe_reports(&self) -> broadcast::Receiver<StatusReport> {
        self.manager.subscribe_reports()
    }

    /// Index and coordinator, once the first connection is up.
    #[must_use]
    pub fn wiring(&self) -> Option<&Wiring> {
        self.wiring.as_ref()
    }

    #[must_use]
    pub fn coordinator(&self) -> Option<&Coordinator> {
        self.wiring.as_ref().map(|w| &w.coordinator)
    }

    /// Last frequency sent to the server, null if none was ever requested.
    #[must_use]
    pub fn last_freq(&self) -> &Cell {
        &self.last_freq
    }

    /// How many times first-connection wiring ran. Never more than one.
    #[must_use]
    pub fn initializations(&self) -> u64 {
        self.initializations
    }

    /// Begin the first connection attempt.
    pub fn start(&mut self) {
        self.manager.connect();
    }

    /// Run until `shutdown` resolves, then close the session and save.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Storage`] if the final save fails. Session and
    /// action errors are logged and never end the loop.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<(), ClientError> {
        self.start();
        let mut save = tokio::time::interval(SAVE_INTERVAL);
        save.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                () = self.turn() => {}
                _ = save.tick() => self.save(),
            }
        }

        info!("client shutting down");
        self.manager.shutdown();
        self.flush();
        self.ctx.storage().persist()?;
        Ok(())
    }

    /// Wait for one unit of work and process it.
    pub async fn turn(&mut self) {
        let turn = {
            let Self {
                ctx,
                manager,
                actions,
                ..
            } = self;
            let ctx: &Context = ctx;
            tokio::select! {
                result = manager.step(ctx) => Turn::Session(result),
                Some(request) = actions.recv() => Turn::Action(request),
                () = ctx.scheduler().wait() => Turn::Flush,
            }
        };
        match turn {
            Turn::Session(Ok(Some(change))) => self.on_session_change(change),
            Turn::Session(Ok(None)) => {}
            Turn::Session(Err(err)) => warn!(%err, "failed to apply server state"),
            Turn::Action(request) => self.dispatch(request),
            Turn::Flush => self.flush(),
        }
    }

    /// Hand a validated action to the session.
    pub fn dispatch(&mut self, request: ActionRequest) {
        let tuned = (request.path == FREQ_PATH).then(|| request.value.clone());
        match self.manager.send_action(request) {
            Ok(_) => {
                if let Some(hz) = tuned {
                    if let Err(err) = self.last_freq.set(hz) {
                        warn!(%err, "could not remember frequency");
                    }
                }
            }
            Err(err) => warn!(%err, "action dropped"),
        }
    }

    /// Run pending listeners. Starvation is logged by the scheduler and the
    /// loop carries on.
    pub fn flush(&self) {
        if let Err(err) = self.ctx.scheduler().flush() {
            warn!(%err, "flush abandoned");
        }
    }

    fn on_session_change(&mut self, change: SessionChange) {
        match change {
            SessionChange::Connected { .. } if self.wiring.is_none() => self.initialize(),
            SessionChange::Connected { .. } => {
                info!(
                    connections = self.manager.connections(),
                    "resynchronized after reconnect"
                );
            }
            SessionChange::Lost => {}
        }
    }

    fn initialize(&mut self) {
        let root = self.manager.root();
        let index = Index::new(&self.ctx, root.clone());
        let coordinator = Coordinator::new(root, self.manager.status_cell(), self.actions_tx.clone());
        let devices = index.implementing("device");
        let devices_log = devices.listen(|value| {
            let count = value.as_list().map_or(0, <[_]>::len);
            info!(devices = count, "device list changed");
        });
        info!(
            members = index.members().len(),
            devices = devices.get().as_list().map_or(0, <[_]>::len),
            "client initialized"
        );
        if let Some(hz) = self.last_freq.get().as_f64() {
            match coordinator.tune(hz) {
                Ok(()) => info!(hz, "restoring last frequency"),
                Err(err) => warn!(hz, %err, "stored frequency not restored"),
            }
        }
        self.wiring = Some(Wiring {
            index,
            coordinator,
            devices,
            _devices_log: devices_log,
        });
        self.initializations += 1;
    }

    fn save(&self) {
        if let Err(err) = self.ctx.storage().persist() {
            warn!(%err, "failed to save preferences");
        }
    }
}

impl<T: Transport> std::fmt::Debug for Client<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("manager", &self.manager)
            .field("initialized", &self.wiring.is_some())
            .finish_non_exhaustive()
    }
}
