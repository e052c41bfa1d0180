use crate::error::LinkError;
use crate::frame::Frame;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::debug;

/// Matches replies to outstanding requests by their 1-byte sequence number.
///
/// Sequence numbers come from a wrapping counter; a number still awaiting its reply is
/// skipped, so at most 256 requests can be in flight.
#[derive(Debug, Default)]
pub struct SequenceCorrelator {
    next: u8,
    pending: HashMap<u8, oneshot::Sender<Frame>>,
}

impl SequenceCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a free sequence number and a receiver for its reply.
    pub fn register(&mut self) -> Result<(u8, oneshot::Receiver<Frame>), LinkError> {
        let seq = self.next_seq()?;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(seq, tx);
        Ok((seq, rx))
    }

    /// Next sequence number not currently outstanding.
    pub fn next_seq(&mut self) -> Result<u8, LinkError> {
        for _ in 0..=u8::MAX {
            let candidate = self.next;
            self.next = self.next.wrapping_add(1);
            if !self.pending.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(LinkError::SeqExhausted)
    }

    /// Hand a reply to whoever is waiting on its sequence number.
    ///
    /// Returns the frame back when nobody is waiting (late or unsolicited reply).
    pub fn resolve(&mut self, frame: Frame) -> Option<Frame> {
        match self.pending.remove(&frame.seq) {
            Some(waiter) => waiter.send(frame).err(),
            None => {
                debug!(seq = frame.seq, command = frame.command, "reply without waiter");
                Some(frame)
            }
        }
    }

    /// Forget a request, e.g. after its caller timed out.
    pub fn cancel(&mut self, seq: u8) -> bool {
        self.pending.remove(&seq).is_some()
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}
