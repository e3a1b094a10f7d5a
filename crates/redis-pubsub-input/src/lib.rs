//! Redis pub/sub input for a host processing pipeline.
//!
//! Subscribes to a channel pattern on a single Redis connection and turns
//! every delivered message into a pipeline work buffer, optionally passing it
//! through a named decoder first.
//!
//! # Features
//! - RESP2 wire codec over a plain TCP connection
//! - Bounded pool of reusable work buffers with blocking acquire (backpressure)
//! - Decoders resolved by name from an explicit registry (`json`, `lines` built in)
//! - Cooperative stop through a [`StopHandle`]
//!
//! No reconnect logic: the loop returns the first fatal error and leaves
//! restarts to whatever supervises the process.
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), redis_pubsub_input::Error> {
//! use redis_pubsub_input::{DecoderRegistry, InputConfig, RedisPubSubInput, exchange};
//!
//! let config = InputConfig {
//!     channel: "news.*".to_string(),
//!     ..Default::default()
//! };
//! let (mut buffers, mut pipeline) = exchange(100);
//! let mut input = RedisPubSubInput::init(config, &DecoderRegistry::with_builtins()).await?;
//!
//! tokio::spawn(async move {
//!     while let Some(buffer) = pipeline.next().await {
//!         println!("{}: {}", buffer.logger, buffer.payload_lossy());
//!     }
//! });
//!
//! Err(input.run(&mut buffers).await)
//! # }
//! ```

mod connection;
mod decoder;
mod exchange;
mod input;
pub mod protocol;
mod types;

pub use connection::Connection;
pub use decoder::{DecodeError, DecodeOutput, Decoder, DecoderRegistry, JsonDecoder, LinesDecoder};
pub use exchange::{BufferExchange, Message, Pipeline, WorkBuffer, exchange};
pub use input::{
    LoopAction, MESSAGE_TYPE, MessageOutcome, RedisPubSubInput, StopHandle, SubscriptionLoop,
};
pub use types::{DEFAULT_ADDRESS, DEFAULT_CHANNEL, Error, InputConfig, SubscriptionEvent};
