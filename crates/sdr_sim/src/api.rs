/// NATS API of the simulated radio.
///
/// Subjects (all under configurable prefix, default "radio"):
///
///   Request/Reply:
///     {prefix}.session.hello   — answered with a snapshot of the whole tree
///
///   Subscribe:
///     {prefix}.action          — one write request per message
///
///   Publish (broadcast):
///     {prefix}.state.delta     — accepted values and rejections
use async_nats::{Client, Message};
use futures::StreamExt;
use sdr_net::{ActionFrame, Hello, NetError, PROTOCOL_VERSION, StateDelta, codec, subjects};
use tracing::{debug, error, info, warn};

use crate::radio::Radio;

enum Incoming {
    Hello(Message),
    Action(Message),
}

pub struct Api {
    radio: Radio,
    client: Client,
    prefix: String,
}

impl Api {
    pub fn new(radio: Radio, client: Client, prefix: String) -> Self {
        Self {
            radio,
            client,
            prefix,
        }
    }

    pub async fn run(&mut self) -> Result<(), NetError> {
        let hello = self.client.subscribe(subjects::hello(&self.prefix)).await?;
        let actions = self.client.subscribe(subjects::action(&self.prefix)).await?;
        let mut incoming =
            futures::stream::select(hello.map(Incoming::Hello), actions.map(Incoming::Action));

        info!(prefix = %self.prefix, "radio server ready, listening for sessions");

        while let Some(msg) = incoming.next().await {
            match msg {
                Incoming::Hello(msg) => self.handle_hello(msg).await,
                Incoming::Action(msg) => self.handle_action(&msg.payload).await,
            }
        }

        Ok(())
    }

    // -- Handlers --

    async fn handle_hello(&self, msg: Message) {
        match codec::decode::<Hello>(&msg.payload) {
            Ok(hello) if hello.protocol != PROTOCOL_VERSION => {
                warn!(client = %hello.client_id, protocol = hello.protocol, "protocol mismatch, answering anyway");
            }
            Ok(hello) => info!(client = %hello.client_id, "session opened"),
            Err(e) => {
                warn!(%e, "malformed hello");
                return;
            }
        }

        let Some(reply_to) = msg.reply else {
            warn!("hello without a reply subject");
            return;
        };
        let payload = match codec::encode(&self.radio.snapshot()) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(%e, "failed to encode snapshot");
                return;
            }
        };
        if let Err(e) = self.client.publish(reply_to, payload.into()).await {
            error!(%e, "failed to publish snapshot");
        }
    }

    async fn handle_action(&mut self, payload: &[u8]) {
        let frame: ActionFrame = match codec::decode(payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%e, "malformed action");
                return;
            }
        };
        debug!(seq = frame.seq, path = %frame.path.join("/"), "action received");

        let delta = self.radio.handle(&frame);
        if let StateDelta::Rejected { seq, reason } = &delta {
            info!(seq, %reason, "action rejected");
        }
        if let Err(e) = self.broadcast(&delta).await {
            error!(%e, "failed to publish delta");
        }
    }

    async fn broadcast(&self, delta: &StateDelta) -> Result<(), NetError> {
        let payload = codec::encode(delta)?;
        self.client
            .publish(subjects::state_delta(&self.prefix), payload.into())
            .await?;
        Ok(())
    }
}
