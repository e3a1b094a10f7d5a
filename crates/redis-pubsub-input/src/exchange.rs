//! Buffer exchange: a bounded pool of reusable work buffers shared with the host.
//!
//! The pool is a bounded channel pre-filled with empty [`Message`]s. The input
//! takes one with [`BufferExchange::acquire`], fills it, and either injects it
//! into the [`Pipeline`] or recycles it. Every [`WorkBuffer`] remembers the
//! supply it came from and puts its message back when recycled or dropped, so
//! a borrowed buffer returns to the pool exactly once.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use tokio::sync::mpsc;

use crate::types::Error;

/// Data carried by one work buffer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub msg_type: String,
    /// Logical source identifier (the channel the message arrived on).
    /// Channel names that are not valid UTF-8 arrive here with the invalid
    /// sequences replaced by U+FFFD; the payload is never altered.
    pub logger: String,
    pub payload: Vec<u8>,
    /// Nanoseconds since the Unix epoch.
    pub timestamp: i64,
    /// Structured fields filled in by decoders.
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl Message {
    /// Clear all content, keeping allocated capacity for reuse.
    pub fn reset(&mut self) {
        self.msg_type.clear();
        self.logger.clear();
        self.payload.clear();
        self.timestamp = 0;
        self.fields.clear();
    }

    /// Overwrite type, source, payload and timestamp in place.
    pub fn populate(&mut self, msg_type: &str, logger: &str, payload: &[u8], timestamp: i64) {
        self.reset();
        self.msg_type.push_str(msg_type);
        self.logger.push_str(logger);
        self.payload.extend_from_slice(payload);
        self.timestamp = timestamp;
    }

    pub fn payload_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// A message borrowed from a [`BufferExchange`].
///
/// Dereferences to [`Message`]. Dropping the buffer recycles it.
#[derive(Debug)]
pub struct WorkBuffer {
    message: Message,
    home: Option<mpsc::Sender<Message>>,
}

impl WorkBuffer {
    /// A buffer that belongs to no pool; dropping it just frees it.
    pub fn detached(message: Message) -> Self {
        Self {
            message,
            home: None,
        }
    }

    /// Return the buffer to its supply immediately.
    pub fn recycle(mut self) {
        self.release();
    }

    /// Take the message out, detaching it from the pool.
    pub fn into_message(mut self) -> Message {
        self.home = None;
        std::mem::take(&mut self.message)
    }

    fn release(&mut self) {
        let Some(home) = self.home.take() else {
            return;
        };
        let mut message = std::mem::take(&mut self.message);
        message.reset();
        match home.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_) | mpsc::error::TrySendError::Closed(_)) => {
                tracing::trace!("buffer supply gone, freeing buffer");
            }
        }
    }
}

impl Deref for WorkBuffer {
    type Target = Message;

    fn deref(&self) -> &Message {
        &self.message
    }
}

impl DerefMut for WorkBuffer {
    fn deref_mut(&mut self) -> &mut Message {
        &mut self.message
    }
}

impl Drop for WorkBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

/// Input-side handle: acquire empty buffers, inject or recycle filled ones.
#[derive(Debug)]
pub struct BufferExchange {
    supply: mpsc::Receiver<Message>,
    home: mpsc::Sender<Message>,
    inject_tx: mpsc::UnboundedSender<WorkBuffer>,
}

/// Host-side handle: receives injected buffers in injection order.
///
/// Dropping a received buffer hands it back to the supply.
#[derive(Debug)]
pub struct Pipeline {
    rx: mpsc::UnboundedReceiver<WorkBuffer>,
}

/// Create an exchange holding `capacity` reusable buffers (at least one).
pub fn exchange(capacity: usize) -> (BufferExchange, Pipeline) {
    let capacity = capacity.max(1);
    let (home, supply) = mpsc::channel(capacity);
    for _ in 0..capacity {
        // Cannot fail: the channel was created with exactly this capacity.
        let _ = home.try_send(Message::default());
    }
    let (inject_tx, rx) = mpsc::unbounded_channel();
    (
        BufferExchange {
            supply,
            home,
            inject_tx,
        },
        Pipeline { rx },
    )
}

impl BufferExchange {
    /// Wait until the supply yields an empty buffer. No timeout.
    pub async fn acquire(&mut self) -> WorkBuffer {
        // `self.home` keeps the channel open, so `recv` only ever yields a value.
        let message = self.supply.recv().await.unwrap_or_default();
        WorkBuffer {
            message,
            home: Some(self.home.clone()),
        }
    }

    /// An empty buffer if one is idle right now. Never blocks.
    pub fn try_acquire(&mut self) -> Option<WorkBuffer> {
        let message = self.supply.try_recv().ok()?;
        Some(WorkBuffer {
            message,
            home: Some(self.home.clone()),
        })
    }

    /// An idle buffer carrying `template`'s type, source, timestamp and
    /// fields with an empty payload, or `None` when the supply is empty.
    ///
    /// Decoders that split one payload into several units take every extra
    /// buffer through here, so their output never exceeds the pool.
    pub fn try_fork(&mut self, template: &Message) -> Option<WorkBuffer> {
        let mut buffer = self.try_acquire()?;
        buffer.msg_type.push_str(&template.msg_type);
        buffer.logger.push_str(&template.logger);
        buffer.timestamp = template.timestamp;
        buffer.fields.clone_from(&template.fields);
        Some(buffer)
    }

    /// Hand a buffer to the pipeline without waiting for it to be processed.
    ///
    /// Fails with [`Error::PipelineClosed`] when the host has dropped its
    /// [`Pipeline`]; the buffer is recycled in that case.
    pub fn inject(&self, buffer: WorkBuffer) -> Result<(), Error> {
        self.inject_tx
            .send(buffer)
            .map_err(|_| Error::PipelineClosed)
    }

    /// Return an unused buffer to the supply. Never blocks.
    pub fn recycle(&self, buffer: WorkBuffer) {
        buffer.recycle();
    }

    /// Number of idle buffers waiting in the supply.
    pub fn available(&self) -> usize {
        self.home.max_capacity().saturating_sub(self.home.capacity())
    }

    /// Total number of pooled buffers.
    pub fn capacity(&self) -> usize {
        self.home.max_capacity()
    }
}

impl Pipeline {
    /// Next injected buffer, or `None` once the input side is gone and
    /// everything has been drained.
    pub async fn next(&mut self) -> Option<WorkBuffer> {
        self.rx.recv().await
    }

    /// Next injected buffer if one is already waiting.
    pub fn try_next(&mut self) -> Option<WorkBuffer> {
        self.rx.try_recv().ok()
    }
}
