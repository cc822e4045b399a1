//! Diagnostic messages produced while loading policies and running queries.
//!
//! Messages are never pushed to the host. They accumulate in a FIFO
//! [`MessageQueue`] owned by the engine (load-time warnings) or by a query
//! (`print` output, runtime warnings) and are drained by polling.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

// ── Message types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Output of `print(...)` in a policy.
    Print,
    /// Something suspicious that did not stop evaluation.
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub msg: String,
}

impl Message {
    pub fn print(msg: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Print,
            msg: msg.into(),
        }
    }

    pub fn warning(msg: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Warning,
            msg: msg.into(),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            MessageKind::Print => f.write_str(&self.msg),
            MessageKind::Warning => write!(f, "[warning] {}", self.msg),
        }
    }
}

// ── MessageQueue ────────────────────────────────────────────────────────

/// FIFO of pending messages, drained with [`MessageQueue::next`].
#[derive(Debug, Default)]
pub struct MessageQueue {
    messages: Mutex<VecDeque<Message>>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: Message) {
        match message.kind {
            MessageKind::Warning => tracing::warn!(msg = %message.msg, "policy warning"),
            MessageKind::Print => tracing::debug!(msg = %message.msg, "policy print"),
        }
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(message);
    }

    pub fn extend(&self, messages: impl IntoIterator<Item = Message>) {
        for m in messages {
            self.push(m);
        }
    }

    /// Pop the oldest message, if any.
    pub fn next(&self) -> Option<Message> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
