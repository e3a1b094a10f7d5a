//! Connection management: open, subscribe, receive, and close.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::protocol::{RespCodec, event_from_frame, psubscribe};
use crate::types::{Error, SubscriptionEvent};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
const LOCAL_HOST: &str = "127.0.0.1";

/// Turn a configured address into something `TcpStream::connect` accepts.
///
/// `":6379"` means the local host; otherwise the address must carry a port.
pub(crate) fn resolve_address(address: &str) -> Result<String, Error> {
    let Some((host, port)) = address.rsplit_once(':') else {
        return Err(Error::InvalidAddress(address.to_string()));
    };
    if port.parse::<u16>().is_err() {
        return Err(Error::InvalidAddress(address.to_string()));
    }
    if host.is_empty() {
        Ok(format!("{LOCAL_HOST}:{port}"))
    } else {
        Ok(address.to_string())
    }
}

/// A single connection to the broker.
///
/// Owned by the subscription loop for its whole lifetime. Once closed, every
/// operation fails with [`Error::Closed`].
#[derive(Debug)]
pub struct Connection {
    address: String,
    framed: Option<Framed<TcpStream, RespCodec>>,
}

impl Connection {
    /// Connect to `address`, failing with [`Error::Connect`] if the transport
    /// cannot be established within the connect timeout.
    pub async fn open(address: &str) -> Result<Self, Error> {
        let target = resolve_address(address)?;
        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&target)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(Error::Connect {
                    address: address.to_string(),
                    source,
                });
            }
            Err(_) => {
                return Err(Error::Connect {
                    address: address.to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connect timed out",
                    ),
                });
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "failed to set TCP_NODELAY");
        }
        tracing::info!(address, %target, "connected to broker");
        Ok(Self {
            address: address.to_string(),
            framed: Some(Framed::new(stream, RespCodec)),
        })
    }

    /// The address this connection was opened with.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_closed(&self) -> bool {
        self.framed.is_none()
    }

    /// Send `PSUBSCRIBE pattern`. Does not wait for the acknowledgement; it
    /// arrives later as a [`SubscriptionEvent::SubscriptionAck`].
    pub async fn psubscribe(&mut self, pattern: &str) -> Result<(), Error> {
        let framed = self.framed.as_mut().ok_or(Error::Closed)?;
        framed.send(psubscribe(pattern)).await
    }

    /// Wait for the next event. Transport failures, undecodable frames and the
    /// end of the stream all surface as [`SubscriptionEvent::ConnectionError`].
    pub async fn receive(&mut self) -> SubscriptionEvent {
        let Some(framed) = self.framed.as_mut() else {
            return SubscriptionEvent::ConnectionError(Error::Closed);
        };
        match framed.next().await {
            Some(Ok(frame)) => event_from_frame(frame),
            Some(Err(e)) => SubscriptionEvent::ConnectionError(e),
            None => SubscriptionEvent::ConnectionError(Error::ConnectionClosed),
        }
    }

    /// Shut the connection down. Idempotent; close-time errors are logged and
    /// dropped, and the shutdown is bounded by a short timeout.
    pub async fn close(&mut self) {
        let Some(framed) = self.framed.take() else {
            return;
        };
        let mut stream = framed.into_inner();
        match tokio::time::timeout(CLOSE_TIMEOUT, stream.shutdown()).await {
            Ok(Ok(())) => tracing::debug!(address = %self.address, "connection closed"),
            Ok(Err(e)) => {
                tracing::debug!(address = %self.address, error = %e, "ignoring close error");
            }
            Err(_) => tracing::debug!(address = %self.address, "connection close timed out"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
