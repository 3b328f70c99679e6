//! Per-connection FIFO of outbound frames.
//!
//! Messages stay in enqueue order, always. Draining only ever attempts the
//! head frame; a blocked head stops the drain with its partial-write offset
//! recorded, so the next drain resumes the exact same frame at the exact
//! same byte. Nothing behind the head is touched until the head completes.

use crate::net::frame::{send_frame, SendStatus};
use bytes::Bytes;
use std::collections::VecDeque;
use std::io::{self, Write};

/// One queued outbound message.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub seq: u32,
    pub payload: Bytes,
    /// Frame bytes already written for this message.
    offset: usize,
}

/// What a drain pass accomplished.
#[derive(Debug, PartialEq, Eq)]
pub struct DrainOutcome {
    /// Frames fully written during this pass.
    pub sent: u64,
    /// True when the pass stopped because the socket blocked.
    pub blocked: bool,
}

#[derive(Debug, Default)]
pub struct SendQueue {
    messages: VecDeque<QueuedMessage>,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message at the tail.
    pub fn push(&mut self, seq: u32, payload: Bytes) {
        self.messages.push_back(QueuedMessage {
            seq,
            payload,
            offset: 0,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Iterate queued messages in send order (for the `#d` dump).
    pub fn iter(&self) -> impl Iterator<Item = &QueuedMessage> {
        self.messages.iter()
    }

    /// Push queued frames onto the wire until the queue empties or the
    /// socket blocks. Errors other than would-block propagate to the caller,
    /// which owns the decision to drop the connection.
    pub fn drain<W: Write>(&mut self, writer: &mut W) -> io::Result<DrainOutcome> {
        let mut sent = 0;

        while let Some(head) = self.messages.front_mut() {
            match send_frame(writer, &head.payload, head.seq, head.offset)? {
                SendStatus::Complete => {
                    self.messages.pop_front();
                    sent += 1;
                }
                SendStatus::Blocked { written } => {
                    head.offset = written;
                    return Ok(DrainOutcome { sent, blocked: true });
                }
            }
        }

        Ok(DrainOutcome {
            sent,
            blocked: false,
        })
    }
}
