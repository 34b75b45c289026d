//! Network-layer error types.

/// Errors raised while talking to the radio server.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Failed to encode a frame to MessagePack.
    #[error("failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Failed to decode a frame from MessagePack.
    #[error("failed to decode message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// NATS connection error.
    #[error("NATS connection error: {0}")]
    Connect(#[from] async_nats::ConnectError),

    /// NATS subscription error.
    #[error("NATS subscribe error: {0}")]
    Subscribe(#[from] async_nats::SubscribeError),

    /// NATS publish error.
    #[error("NATS publish error: {0}")]
    Publish(#[from] async_nats::PublishError),

    /// The hello request got no usable answer.
    #[error("NATS request error: {0}")]
    Request(#[from] async_nats::RequestError),

    /// No session is open, or its I/O task has ended.
    #[error("transport is closed")]
    TransportClosed,
}
