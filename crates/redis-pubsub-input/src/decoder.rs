//! Decoder gateway: pluggable payload transformers resolved by name.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::exchange::{BufferExchange, WorkBuffer};
use crate::types::Error;

/// Per-message decode failure. Never fatal to the input.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("{0} line(s) were not valid UTF-8")]
    InvalidUtf8(usize),

    #[error("buffer pool exhausted, {0} unit(s) dropped")]
    PoolExhausted(usize),

    #[error("{0}")]
    Other(String),
}

/// What a decoder produced from one buffer.
///
/// | buffers | error | meaning |
/// |---------|-------|---------|
/// | empty | `None` | message intentionally dropped |
/// | empty | `Some` | parse failure |
/// | non-empty | either | inject everything produced |
#[derive(Debug, Default)]
pub struct DecodeOutput {
    pub buffers: Vec<WorkBuffer>,
    pub error: Option<DecodeError>,
}

impl DecodeOutput {
    pub fn single(buffer: WorkBuffer) -> Self {
        Self {
            buffers: vec![buffer],
            error: None,
        }
    }

    pub fn dropped() -> Self {
        Self::default()
    }

    pub fn failed(error: DecodeError) -> Self {
        Self {
            buffers: Vec::new(),
            error: Some(error),
        }
    }
}

/// Transforms one raw buffer into zero or more pipeline-ready buffers.
///
/// The decoder owns the buffer it is given. A buffer that is not part of the
/// returned output goes back to the exchange when the decoder drops it. Extra
/// output buffers must come from `exchange` (see [`BufferExchange::try_fork`]).
pub trait Decoder: Send + Sync {
    fn name(&self) -> &str;
    fn decode(&self, buffer: WorkBuffer, exchange: &mut BufferExchange) -> DecodeOutput;
}

/// Name → decoder lookup, consulted once when an input is initialized.
#[derive(Clone, Default)]
pub struct DecoderRegistry {
    decoders: HashMap<String, Arc<dyn Decoder>>,
}

impl fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoderRegistry")
            .field("decoders", &self.names())
            .finish()
    }
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-loaded with [`JsonDecoder`] and [`LinesDecoder`].
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(JsonDecoder);
        registry.register(LinesDecoder);
        registry
    }

    /// Register a decoder under its own name, replacing any previous one.
    pub fn register(&mut self, decoder: impl Decoder + 'static) -> Option<Arc<dyn Decoder>> {
        let decoder: Arc<dyn Decoder> = Arc::new(decoder);
        self.decoders.insert(decoder.name().to_string(), decoder)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Decoder>> {
        self.decoders.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.decoders.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Resolve a configured decoder name. An empty name means no decoder; an
    /// unknown name is an error.
    pub fn resolve(&self, name: &str) -> Result<Option<Arc<dyn Decoder>>, Error> {
        if name.is_empty() {
            return Ok(None);
        }
        self.get(name)
            .map(Some)
            .ok_or_else(|| Error::DecoderNotFound(name.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Built-in decoders
// ---------------------------------------------------------------------------

/// Parses the payload as a JSON object and copies its keys into `fields`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDecoder;

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

impl Decoder for JsonDecoder {
    fn name(&self) -> &str {
        "json"
    }

    fn decode(&self, mut buffer: WorkBuffer, _exchange: &mut BufferExchange) -> DecodeOutput {
        let value: serde_json::Value = match serde_json::from_slice(&buffer.payload) {
            Ok(value) => value,
            Err(e) => return DecodeOutput::failed(e.into()),
        };
        let serde_json::Value::Object(map) = value else {
            return DecodeOutput::failed(DecodeError::NotAnObject(json_kind(&value)));
        };
        buffer.fields.extend(map);
        DecodeOutput::single(buffer)
    }
}

/// Splits the payload on newlines, one buffer per non-empty line.
///
/// The first line reuses the original buffer; the others take idle buffers
/// from the exchange. Lines left over once the pool runs dry are dropped and
/// reported as [`DecodeError::PoolExhausted`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LinesDecoder;

impl Decoder for LinesDecoder {
    fn name(&self) -> &str {
        "lines"
    }

    fn decode(&self, mut buffer: WorkBuffer, exchange: &mut BufferExchange) -> DecodeOutput {
        let payload = std::mem::take(&mut buffer.payload);
        let mut invalid = 0usize;
        let lines: Vec<&[u8]> = payload
            .split(|b| *b == b'\n')
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
            .filter(|line| !line.is_empty())
            .filter(|line| {
                let valid = std::str::from_utf8(line).is_ok();
                if !valid {
                    invalid += 1;
                }
                valid
            })
            .collect();

        let Some((first, rest)) = lines.split_first() else {
            return DecodeOutput {
                buffers: Vec::new(),
                error: (invalid > 0).then_some(DecodeError::InvalidUtf8(invalid)),
            };
        };

        let mut forks = Vec::with_capacity(rest.len());
        for line in rest {
            let Some(mut fork) = exchange.try_fork(&buffer) else {
                break;
            };
            fork.payload.extend_from_slice(line);
            forks.push(fork);
        }
        let dropped = rest.len() - forks.len();

        // Exhaustion loses data; invalid lines were unusable anyway.
        let error = if dropped > 0 {
            Some(DecodeError::PoolExhausted(dropped))
        } else {
            (invalid > 0).then_some(DecodeError::InvalidUtf8(invalid))
        };

        let mut buffers = Vec::with_capacity(forks.len() + 1);
        buffer.payload.extend_from_slice(first);
        buffers.push(buffer);
        buffers.extend(forks);
        DecodeOutput { buffers, error }
    }
}
