//! Public entry point: [`RedisPubSubInput`] and the subscription loop.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::decoder::{DecodeOutput, Decoder, DecoderRegistry};
use crate::exchange::{BufferExchange, WorkBuffer};
use crate::types::{Error, InputConfig, SubscriptionEvent};

/// Message type stamped on every buffer this input produces.
pub const MESSAGE_TYPE: &str = "redis_pub_sub";

/// What the loop should do after handling an event.
#[derive(Debug)]
pub enum LoopAction {
    Continue,
    Stop(Error),
}

/// How a single pattern message was disposed of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// This many buffers went to the pipeline.
    Injected(usize),
    /// The decoder produced nothing and reported no error.
    Dropped,
    /// The decoder produced nothing and reported an error.
    ParseFailed,
}

/// Asks a running input to stop. Cloneable and usable from any task.
#[derive(Debug, Clone)]
pub struct StopHandle {
    token: CancellationToken,
}

impl StopHandle {
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

/// Per-event dispatch, independent of the connection it reads from.
pub struct SubscriptionLoop {
    decoder: Option<Arc<dyn Decoder>>,
    shutdown: CancellationToken,
}

impl SubscriptionLoop {
    pub fn new(decoder: Option<Arc<dyn Decoder>>) -> Self {
        Self {
            decoder,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            token: self.shutdown.clone(),
        }
    }

    pub fn decoder_name(&self) -> Option<&str> {
        self.decoder.as_deref().map(|d| d.name())
    }

    /// Handle one event. Waits for a free buffer when the event is a message.
    pub async fn handle_event(
        &self,
        event: SubscriptionEvent,
        exchange: &mut BufferExchange,
    ) -> LoopAction {
        match event {
            SubscriptionEvent::PatternMessage {
                pattern,
                channel,
                payload,
            } => {
                tracing::info!(
                    %pattern,
                    %channel,
                    payload = %String::from_utf8_lossy(&payload),
                    "pmessage"
                );
                let buffer = tokio::select! {
                    buffer = exchange.acquire() => buffer,
                    () = self.shutdown.cancelled() => return LoopAction::Stop(Error::Closed),
                };
                match self.handle_message(buffer, &channel, &payload, exchange) {
                    Ok(_) => LoopAction::Continue,
                    Err(e) => LoopAction::Stop(e),
                }
            }
            SubscriptionEvent::SubscriptionAck {
                kind,
                channel,
                count,
            } => {
                tracing::info!(%kind, %channel, count, "subscription");
                if count == 0 {
                    tracing::error!(%kind, %channel, "no channel to subscribe");
                    return LoopAction::Stop(Error::NoChannel);
                }
                LoopAction::Continue
            }
            SubscriptionEvent::ConnectionError(e) => {
                tracing::error!(error = %e, "connection error");
                LoopAction::Stop(e)
            }
            SubscriptionEvent::Unrecognized { kind } => {
                tracing::debug!(%kind, "ignoring pub/sub event");
                LoopAction::Continue
            }
        }
    }

    /// Fill `buffer` from a received message, run the decoder if any, and
    /// inject or recycle the result.
    ///
    /// Only a closed pipeline is an error; decode failures are logged and
    /// reported through the returned [`MessageOutcome`].
    pub fn handle_message(
        &self,
        mut buffer: WorkBuffer,
        channel: &str,
        payload: &[u8],
        exchange: &mut BufferExchange,
    ) -> Result<MessageOutcome, Error> {
        buffer.populate(MESSAGE_TYPE, channel, payload, now_nanos());

        let DecodeOutput { buffers, error } = match &self.decoder {
            None => DecodeOutput::single(buffer),
            Some(decoder) => decoder.decode(buffer, exchange),
        };

        // An empty result means the decoder did not keep the original buffer;
        // it went back to the supply when the decoder dropped it.
        if buffers.is_empty() {
            return Ok(match error {
                Some(e) => {
                    tracing::error!(
                        decoder = self.decoder_name().unwrap_or_default(),
                        error = %e,
                        "Couldn't parse Redis message: {}",
                        String::from_utf8_lossy(payload)
                    );
                    MessageOutcome::ParseFailed
                }
                None => {
                    tracing::debug!(%channel, "decoder dropped message");
                    MessageOutcome::Dropped
                }
            });
        }

        if let Some(e) = error {
            tracing::warn!(
                error = %e,
                produced = buffers.len(),
                "decoder reported an error alongside output"
            );
        }
        let produced = buffers.len();
        for buffer in buffers {
            exchange.inject(buffer)?;
        }
        Ok(MessageOutcome::Injected(produced))
    }
}

/// A Redis pattern subscription feeding a host pipeline.
pub struct RedisPubSubInput {
    config: InputConfig,
    conn: Connection,
    dispatch: SubscriptionLoop,
}

impl RedisPubSubInput {
    /// Resolve the configured decoder and connect to the broker.
    ///
    /// An unknown decoder name or an unreachable broker fails here, before any
    /// subscription is attempted.
    pub async fn init(config: InputConfig, registry: &DecoderRegistry) -> Result<Self, Error> {
        let decoder = registry.resolve(&config.decoder)?;
        let conn = Connection::open(&config.address).await?;
        Ok(Self {
            config,
            conn,
            dispatch: SubscriptionLoop::new(decoder),
        })
    }

    pub fn config(&self) -> &InputConfig {
        &self.config
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.dispatch.stop_handle()
    }

    /// Subscribe and process events until a fatal condition or a stop request.
    ///
    /// Never returns success: the result is always the reason the loop ended.
    /// The connection is closed before returning.
    pub async fn run(&mut self, exchange: &mut BufferExchange) -> Error {
        let reason = self.receive_loop(exchange).await;
        self.conn.close().await;
        tracing::info!(reason = %reason, "subscription loop stopped");
        reason
    }

    /// Close the connection without running. Idempotent.
    pub async fn close(&mut self) {
        self.conn.close().await;
    }

    async fn receive_loop(&mut self, exchange: &mut BufferExchange) -> Error {
        if let Err(e) = self.conn.psubscribe(&self.config.channel).await {
            return e;
        }
        tracing::info!(
            channel = %self.config.channel,
            decoder = self.dispatch.decoder_name().unwrap_or("none"),
            "psubscribe sent"
        );

        loop {
            let event = tokio::select! {
                event = self.conn.receive() => event,
                () = self.dispatch.shutdown.cancelled() => return Error::Closed,
            };
            if let LoopAction::Stop(reason) = self.dispatch.handle_event(event, exchange).await {
                return reason;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use bytes::Bytes;
    use tracing_test::traced_test;

    use super::*;
    use crate::decoder::{DecodeError, LinesDecoder};
    use crate::exchange::{Pipeline, exchange};

    /// Returns a scripted output and records how often it ran.
    struct ScriptedDecoder {
        script: fn(WorkBuffer, &mut BufferExchange) -> DecodeOutput,
        calls: Mutex<usize>,
    }

    impl ScriptedDecoder {
        fn new(script: fn(WorkBuffer, &mut BufferExchange) -> DecodeOutput) -> Arc<Self> {
            Arc::new(Self {
                script,
                calls: Mutex::new(0),
            })
        }
    }

    impl Decoder for ScriptedDecoder {
        fn name(&self) -> &str {
            "scripted"
        }

        fn decode(&self, buffer: WorkBuffer, exchange: &mut BufferExchange) -> DecodeOutput {
            *self.calls.lock().unwrap() += 1;
            (self.script)(buffer, exchange)
        }
    }

    fn pmessage(channel: &str, payload: &str) -> SubscriptionEvent {
        SubscriptionEvent::PatternMessage {
            pattern: "news.*".into(),
            channel: channel.into(),
            payload: Bytes::copy_from_slice(payload.as_bytes()),
        }
    }

    fn ack(count: i64) -> SubscriptionEvent {
        SubscriptionEvent::SubscriptionAck {
            kind: "psubscribe".into(),
            channel: "news.*".into(),
            count,
        }
    }

    fn drain(pipeline: &mut Pipeline) -> Vec<WorkBuffer> {
        std::iter::from_fn(|| pipeline.try_next()).collect()
    }

    #[tokio::test]
    async fn no_decoder_injects_populated_buffer() {
        let (mut ex, mut pipeline) = exchange(2);
        let lp = SubscriptionLoop::new(None);

        let before = now_nanos();
        let action = lp.handle_event(pmessage("news.sports", "goal!"), &mut ex).await;
        let after = now_nanos();
        assert!(matches!(action, LoopAction::Continue));

        let injected = drain(&mut pipeline);
        assert_eq!(injected.len(), 1);
        let buffer = &injected[0];
        assert_eq!(buffer.msg_type, MESSAGE_TYPE);
        assert_eq!(buffer.logger, "news.sports");
        assert_eq!(buffer.payload, b"goal!");
        assert!(buffer.timestamp >= before && buffer.timestamp <= after);
        assert!(buffer.fields.is_empty());
        // One buffer is in the pipeline, none went back to the supply.
        assert_eq!(ex.available(), 1);
    }

    #[tokio::test]
    async fn single_result_is_injected_not_recycled() {
        let (mut ex, mut pipeline) = exchange(1);
        let decoder = ScriptedDecoder::new(|buffer, _| DecodeOutput::single(buffer));
        let lp = SubscriptionLoop::new(Some(decoder.clone()));

        let buffer = ex.acquire().await;
        let outcome = lp.handle_message(buffer, "ch", b"x", &mut ex).unwrap();
        assert_eq!(outcome, MessageOutcome::Injected(1));
        assert_eq!(*decoder.calls.lock().unwrap(), 1);

        // Held by the host: nothing went back to the supply.
        let injected = drain(&mut pipeline);
        assert_eq!(injected.len(), 1);
        assert_eq!(ex.available(), 0);

        drop(injected);
        assert_eq!(ex.available(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn parse_failure_recycles_original_once() {
        let (mut ex, mut pipeline) = exchange(1);
        let decoder = ScriptedDecoder::new(|_buffer, _| {
            DecodeOutput::failed(DecodeError::Other("bad payload".into()))
        });
        let lp = SubscriptionLoop::new(Some(decoder));

        let buffer = ex.acquire().await;
        assert_eq!(ex.available(), 0);
        let outcome = lp.handle_message(buffer, "ch", b"garbage", &mut ex).unwrap();
        assert_eq!(outcome, MessageOutcome::ParseFailed);
        assert!(logs_contain("Couldn't parse Redis message: garbage"));
        assert!(logs_contain("bad payload"));
        assert!(drain(&mut pipeline).is_empty());
        assert_eq!(ex.available(), 1);

        // The recycled buffer is clean and reusable.
        let again = ex.acquire().await;
        assert!(again.payload.is_empty());
        assert!(again.logger.is_empty());
    }

    #[tokio::test]
    async fn empty_result_without_error_is_dropped() {
        let (mut ex, mut pipeline) = exchange(1);
        let decoder = ScriptedDecoder::new(|_buffer, _| DecodeOutput::dropped());
        let lp = SubscriptionLoop::new(Some(decoder));

        let buffer = ex.acquire().await;
        let outcome = lp.handle_message(buffer, "ch", b"skip me", &mut ex).unwrap();
        assert_eq!(outcome, MessageOutcome::Dropped);
        assert!(drain(&mut pipeline).is_empty());
        assert_eq!(ex.available(), 1);
    }

    #[tokio::test]
    async fn multiple_results_injected_in_order() {
        let (mut ex, mut pipeline) = exchange(4);
        let lp = SubscriptionLoop::new(Some(Arc::new(LinesDecoder)));

        let buffer = ex.acquire().await;
        let outcome = lp.handle_message(buffer, "ch", b"one\ntwo\nthree", &mut ex).unwrap();
        assert_eq!(outcome, MessageOutcome::Injected(3));

        let payloads: Vec<Vec<u8>> = drain(&mut pipeline)
            .iter()
            .map(|b| b.payload.clone())
            .collect();
        assert_eq!(payloads, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
    }

    #[tokio::test]
    async fn split_output_never_exceeds_pool_capacity() {
        let (mut ex, mut pipeline) = exchange(1);
        let lp = SubscriptionLoop::new(Some(Arc::new(LinesDecoder)));
        let payload: Vec<u8> = (0..1000)
            .map(|i| format!("line {i}"))
            .collect::<Vec<_>>()
            .join("\n")
            .into_bytes();

        let buffer = ex.acquire().await;
        let outcome = lp.handle_message(buffer, "ch", &payload, &mut ex).unwrap();
        assert_eq!(outcome, MessageOutcome::Injected(1));

        let live = drain(&mut pipeline);
        assert!(live.len() <= ex.capacity());
        assert_eq!(live[0].payload, b"line 0");
        assert_eq!(ex.available(), 0);
    }

    #[tokio::test]
    async fn partial_results_with_error_are_injected() {
        let (mut ex, mut pipeline) = exchange(2);
        let decoder = ScriptedDecoder::new(|buffer, exchange| {
            let mut second = exchange.try_fork(&buffer).unwrap();
            second.payload.extend_from_slice(b"extra");
            DecodeOutput {
                buffers: vec![buffer, second],
                error: Some(DecodeError::Other("trailing garbage".into())),
            }
        });
        let lp = SubscriptionLoop::new(Some(decoder));

        let buffer = ex.acquire().await;
        let outcome = lp.handle_message(buffer, "ch", b"main", &mut ex).unwrap();
        assert_eq!(outcome, MessageOutcome::Injected(2));

        let injected = drain(&mut pipeline);
        assert_eq!(injected.len(), 2);
        assert_eq!(injected[0].payload, b"main");
        assert_eq!(injected[1].payload, b"extra");
        assert_eq!(injected[1].logger, "ch");
    }

    #[tokio::test]
    async fn zero_count_ack_is_fatal_without_buffer_use() {
        let (mut ex, mut pipeline) = exchange(1);
        let lp = SubscriptionLoop::new(None);

        match lp.handle_event(ack(0), &mut ex).await {
            LoopAction::Stop(Error::NoChannel) => {}
            other => panic!("expected NoChannel, got {other:?}"),
        }
        assert_eq!(ex.available(), 1);
        assert!(drain(&mut pipeline).is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn positive_ack_continues() {
        let (mut ex, _pipeline) = exchange(1);
        let lp = SubscriptionLoop::new(None);
        assert!(matches!(
            lp.handle_event(ack(1), &mut ex).await,
            LoopAction::Continue
        ));
        assert!(logs_contain("subscription"));
        assert!(logs_contain("count=1"));
        assert_eq!(ex.available(), 1);
    }

    #[tokio::test]
    async fn connection_error_stops_with_that_error() {
        let (mut ex, _pipeline) = exchange(1);
        let lp = SubscriptionLoop::new(None);
        let event = SubscriptionEvent::ConnectionError(Error::Server("ERR boom".into()));
        match lp.handle_event(event, &mut ex).await {
            LoopAction::Stop(Error::Server(msg)) => assert_eq!(msg, "ERR boom"),
            other => panic!("expected Server error, got {other:?}"),
        }
        assert_eq!(ex.available(), 1);
    }

    #[tokio::test]
    async fn unrecognized_event_is_ignored() {
        let (mut ex, mut pipeline) = exchange(1);
        let lp = SubscriptionLoop::new(None);
        let event = SubscriptionEvent::Unrecognized {
            kind: "message".into(),
        };
        assert!(matches!(
            lp.handle_event(event, &mut ex).await,
            LoopAction::Continue
        ));
        assert!(drain(&mut pipeline).is_empty());
        assert_eq!(ex.available(), 1);
    }

    #[tokio::test]
    async fn exhausted_exchange_blocks_until_host_returns_a_buffer() {
        let (mut ex, mut pipeline) = exchange(1);
        let lp = SubscriptionLoop::new(None);

        lp.handle_event(pmessage("a", "first"), &mut ex).await;
        assert_eq!(ex.available(), 0);

        // Host holds the only buffer: the next message must wait.
        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            lp.handle_event(pmessage("b", "second"), &mut ex),
        )
        .await;
        assert!(blocked.is_err());

        let first = pipeline.next().await.unwrap();
        assert_eq!(first.payload, b"first");
        drop(first);

        let action = tokio::time::timeout(
            Duration::from_secs(5),
            lp.handle_event(pmessage("b", "second"), &mut ex),
        )
        .await
        .unwrap();
        assert!(matches!(action, LoopAction::Continue));

        let injected = drain(&mut pipeline);
        assert_eq!(injected.len(), 1);
        assert_eq!(injected[0].payload, b"second");
        assert_eq!(injected[0].logger, "b");
    }

    #[tokio::test]
    async fn stop_interrupts_blocked_acquire() {
        let (mut ex, _pipeline) = exchange(1);
        let held = ex.acquire().await;
        let lp = SubscriptionLoop::new(None);
        let stop = lp.stop_handle();
        stop.stop();
        assert!(stop.is_stopped());

        match lp.handle_event(pmessage("a", "x"), &mut ex).await {
            LoopAction::Stop(Error::Closed) => {}
            other => panic!("expected Closed, got {other:?}"),
        }
        drop(held);
    }

    #[tokio::test]
    async fn closed_pipeline_stops_the_loop() {
        let (mut ex, pipeline) = exchange(1);
        drop(pipeline);
        let lp = SubscriptionLoop::new(None);
        match lp.handle_event(pmessage("a", "x"), &mut ex).await {
            LoopAction::Stop(Error::PipelineClosed) => {}
            other => panic!("expected PipelineClosed, got {other:?}"),
        }
        assert_eq!(ex.available(), 1);
    }
}
