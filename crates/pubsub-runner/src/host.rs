//! Reference host pipeline: writes every injected buffer as one JSON line.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat};
use redis_pubsub_input::{Message, Pipeline};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::RunnerResult;

#[derive(Debug, Serialize)]
struct Record<'a> {
    #[serde(rename = "type")]
    msg_type: &'a str,
    logger: &'a str,
    payload: std::borrow::Cow<'a, str>,
    timestamp: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    fields: &'a BTreeMap<String, serde_json::Value>,
}

fn render(message: &Message) -> RunnerResult<Vec<u8>> {
    let record = Record {
        msg_type: &message.msg_type,
        logger: &message.logger,
        payload: message.payload_lossy(),
        timestamp: DateTime::from_timestamp_nanos(message.timestamp)
            .to_rfc3339_opts(SecondsFormat::Nanos, true),
        fields: &message.fields,
    };
    let mut line = serde_json::to_vec(&record).map_err(std::io::Error::from)?;
    line.push(b'\n');
    Ok(line)
}

/// Drain `pipeline` into `out` until the input side is gone.
///
/// Each buffer is dropped right after it is written, which hands it back to
/// the exchange. Returns the number of messages written.
pub async fn drain<W>(mut pipeline: Pipeline, mut out: W) -> RunnerResult<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0u64;
    while let Some(buffer) = pipeline.next().await {
        let line = render(&buffer)?;
        drop(buffer);
        out.write_all(&line).await?;
        out.flush().await?;
        written += 1;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis_pubsub_input::exchange;

    #[tokio::test]
    async fn writes_one_line_per_buffer_in_order() {
        let (mut buffers, pipeline) = exchange(2);
        for (channel, payload) in [("a", "1"), ("b", "2")] {
            let mut buffer = buffers.acquire().await;
            buffer.populate("redis_pub_sub", channel, payload.as_bytes(), 0);
            buffers.inject(buffer).unwrap();
        }
        // Dropping the input side lets `drain` finish once both are written.
        drop(buffers);

        let mut out = Vec::new();
        let written = drain(pipeline, &mut out).await.unwrap();
        assert_eq!(written, 2);

        let text = String::from_utf8(out).unwrap();
        let loggers: Vec<String> = text
            .lines()
            .map(|line| {
                let value: serde_json::Value = serde_json::from_str(line).unwrap();
                value["logger"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(loggers, vec!["a", "b"]);
    }

    #[test]
    fn render_formats_record() {
        let mut message = Message::default();
        message.populate("redis_pub_sub", "news.sports", b"goal!", 1_700_000_000_000_000_123);
        let line = render(&message).unwrap();
        assert_eq!(line.last(), Some(&b'\n'));

        let value: serde_json::Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(value["type"], "redis_pub_sub");
        assert_eq!(value["logger"], "news.sports");
        assert_eq!(value["payload"], "goal!");
        assert_eq!(value["timestamp"], "2023-11-14T22:13:20.000000123Z");
        assert!(value.get("fields").is_none());
    }

    #[test]
    fn render_includes_decoded_fields() {
        let mut message = Message::default();
        message.populate("redis_pub_sub", "events.login", b"{}", 0);
        message.fields.insert("user".into(), serde_json::json!("ada"));
        let value: serde_json::Value = serde_json::from_slice(&render(&message).unwrap()).unwrap();
        assert_eq!(value["fields"]["user"], "ada");
        assert_eq!(value["timestamp"], "1970-01-01T00:00:00.000000000Z");
    }

    #[test]
    fn render_replaces_invalid_utf8() {
        let mut message = Message::default();
        message.populate("redis_pub_sub", "bin", b"\xffok", 0);
        let value: serde_json::Value = serde_json::from_slice(&render(&message).unwrap()).unwrap();
        assert_eq!(value["payload"], "\u{fffd}ok");
    }
}
