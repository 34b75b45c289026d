//! NATS implementation of [`Transport`].
//!
//! Each connection attempt runs in its own tokio task: connect, subscribe to
//! the delta subject, send the hello request, then forward deltas and
//! outgoing actions until the link drops. The task never touches cells; it
//! only reports [`TransportEvent`]s.

use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec;
use crate::error::NetError;
use crate::messages::{ActionFrame, Hello, PROTOCOL_VERSION, Snapshot, StateDelta};
use crate::subjects;
use crate::transport::{Transport, TransportEvent, TransportEventKind};

/// Default NATS server URL.
pub const DEFAULT_NATS_URL: &str = "nats://localhost:4222";

/// The environment variable used to override the NATS URL.
pub const NATS_URL_ENV: &str = "NATS_URL";

/// How long one attempt may spend reaching the server.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

struct Session {
    task: JoinHandle<()>,
    outbound: UnboundedSender<ActionFrame>,
}

/// Reaches the radio server over NATS.
pub struct NatsTransport {
    url: String,
    prefix: String,
    client_id: String,
    session: Option<Session>,
}

impl NatsTransport {
    /// A transport for the server publishing under `prefix` at `url`.
    #[must_use]
    pub fn new(url: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            prefix: prefix.into(),
            client_id: uuid::Uuid::new_v4().to_string(),
            session: None,
        }
    }

    /// Like [`NatsTransport::new`], taking the URL from `NATS_URL` and
    /// falling back to [`DEFAULT_NATS_URL`].
    #[must_use]
    pub fn from_env(prefix: impl Into<String>) -> Self {
        let url = std::env::var(NATS_URL_ENV).unwrap_or_else(|_| DEFAULT_NATS_URL.to_string());
        Self::new(url, prefix)
    }

    /// The id sent in every hello.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for NatsTransport {
    fn connect(&mut self, attempt: u64, events: UnboundedSender<TransportEvent>) {
        self.close();
        let (outbound, actions) = mpsc::unbounded_channel();
        let link = Link {
            url: self.url.clone(),
            prefix: self.prefix.clone(),
            hello: Hello {
                client_id: self.client_id.clone(),
                protocol: PROTOCOL_VERSION,
            },
            attempt,
            events,
        };
        let task = tokio::spawn(link.run(actions));
        self.session = Some(Session { task, outbound });
    }

    fn send(&mut self, frame: &ActionFrame) -> Result<(), NetError> {
        let session = self.session.as_ref().ok_or(NetError::TransportClosed)?;
        session
            .outbound
            .send(frame.clone())
            .map_err(|_| NetError::TransportClosed)
    }

    fn close(&mut self) {
        if let Some(session) = self.session.take() {
            session.task.abort();
        }
    }
}

impl Drop for NatsTransport {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for NatsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsTransport")
            .field("url", &self.url)
            .field("prefix", &self.prefix)
            .field("client_id", &self.client_id)
            .field("open", &self.session.is_some())
            .finish()
    }
}

// ── Session task ────────────────────────────────────────────────────────────

struct Link {
    url: String,
    prefix: String,
    hello: Hello,
    attempt: u64,
    events: UnboundedSender<TransportEvent>,
}

struct Opened {
    client: async_nats::Client,
    deltas: async_nats::Subscriber,
    snapshot: Snapshot,
    lost: UnboundedReceiver<()>,
}

impl Link {
    fn emit(&self, kind: TransportEventKind) {
        // The receiver is gone only when the client is shutting down.
        let _ = self.events.send(TransportEvent {
            attempt: self.attempt,
            kind,
        });
    }

    async fn run(self, mut actions: UnboundedReceiver<ActionFrame>) {
        let Opened {
            client,
            mut deltas,
            snapshot,
            mut lost,
        } = match self.open().await {
            Ok(opened) => opened,
            Err(err) => {
                self.emit(TransportEventKind::ConnectFailed(err.to_string()));
                return;
            }
        };
        info!(attempt = self.attempt, url = %self.url, "session established");
        self.emit(TransportEventKind::Handshake(snapshot));

        let action_subject = subjects::action(&self.prefix);
        let reason = loop {
            tokio::select! {
                msg = deltas.next() => match msg {
                    Some(msg) => match codec::decode::<StateDelta>(&msg.payload) {
                        Ok(delta) => self.emit(TransportEventKind::Delta(delta)),
                        Err(err) => warn!(%err, "dropping undecodable delta"),
                    },
                    None => break "delta subscription ended".to_string(),
                },
                frame = actions.recv() => match frame {
                    Some(frame) => {
                        if let Err(err) = publish(&client, &action_subject, &frame).await {
                            break err.to_string();
                        }
                        debug!(seq = frame.seq, path = ?frame.path, "action sent");
                    }
                    None => break "transport dropped".to_string(),
                },
                Some(()) = lost.recv() => break "connection lost".to_string(),
            }
        };
        self.emit(TransportEventKind::Closed(reason));
    }

    async fn open(&self) -> Result<Opened, NetError> {
        let (lost_tx, lost) = mpsc::unbounded_channel();
        debug!(attempt = self.attempt, url = %self.url, "connecting to NATS");
        let client = async_nats::ConnectOptions::new()
            .connection_timeout(CONNECT_TIMEOUT)
            .event_callback(move |event| {
                let lost_tx = lost_tx.clone();
                async move {
                    if matches!(event, async_nats::Event::Disconnected) {
                        let _ = lost_tx.send(());
                    }
                }
            })
            .connect(self.url.as_str())
            .await?;

        // Subscribe before the hello so no delta slips between the snapshot
        // and the subscription.
        let deltas = client.subscribe(subjects::state_delta(&self.prefix)).await?;
        let reply = client
            .request(subjects::hello(&self.prefix), codec::encode(&self.hello)?.into())
            .await?;
        let snapshot: Snapshot = codec::decode(&reply.payload)?;
        Ok(Opened {
            client,
            deltas,
            snapshot,
            lost,
        })
    }
}

async fn publish(
    client: &async_nats::Client,
    subject: &str,
    frame: &ActionFrame,
) -> Result<(), NetError> {
    let payload = codec::encode(frame)?;
    client.publish(subject.to_string(), payload.into()).await?;
    Ok(())
}
