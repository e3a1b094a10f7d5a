//! Public types for the redis-pubsub-input crate.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::protocol::ProtocolError;

/// Default broker address (local Redis).
pub const DEFAULT_ADDRESS: &str = ":6379";
/// Default subscribe pattern (every channel).
pub const DEFAULT_CHANNEL: &str = "*";

/// Settings read once when the input is initialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Broker address as `host:port`. A bare `:port` means the local host.
    pub address: String,
    /// Pattern passed to `PSUBSCRIBE`.
    pub channel: String,
    /// Name of a registered decoder; empty means raw passthrough.
    pub decoder: String,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            channel: DEFAULT_CHANNEL.to_string(),
            decoder: String::new(),
        }
    }
}

/// Events observed on a subscribed connection.
#[derive(Debug)]
pub enum SubscriptionEvent {
    /// A message delivered through a pattern subscription.
    PatternMessage {
        pattern: String,
        channel: String,
        payload: Bytes,
    },
    /// Confirmation of a (un)subscribe request, with the number of
    /// subscriptions still active on the connection.
    SubscriptionAck {
        kind: String,
        channel: String,
        count: i64,
    },
    /// The connection failed or the broker replied with an error.
    ConnectionError(Error),
    /// Any other push (plain `message`, `pong`, unknown kinds).
    Unrecognized { kind: String },
}

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("connecting to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid address: {0:?}")]
    InvalidAddress(String),

    #[error("decoder not found: {0}")]
    DecoderNotFound(String),

    #[error("no channel to subscribe")]
    NoChannel,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("RESP protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Redis error: {0}")]
    Server(String),

    #[error("connection closed by server")]
    ConnectionClosed,

    #[error("input stopped")]
    Closed,

    #[error("pipeline closed")]
    PipelineClosed,
}
