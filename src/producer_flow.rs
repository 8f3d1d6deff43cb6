//! # Producer Flow Control
//!
//! Tracks the send window the broker grants each producer. Credit arrives
//! as a chunk (a message count and a byte budget); the sender consumes one
//! unit per message and blocks once the chunk is exhausted until the read
//! channel delivers a resume-flow, or the flow is closed.
//!
//! The last message of a chunk is stamped with the consumer-flow bit so
//! the broker knows to schedule a resume-flow for this producer.

use crate::error::{MqError, MqResult};
use crate::packet::Packet;
use parking_lot::{Condvar, Mutex};

/// Position of the sender relative to the granted window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowLimit {
    UnderLimit,
    /// About to send the last message of the chunk.
    OnLimit,
    OverLimit,
}

struct State {
    chunk_bytes: i64,
    chunk_size: i32,
    sent_count: i32,
    closed: bool,
    close_reason: MqError,
    references: i32,
}

/// Send-window accounting for one broker-registered producer.
pub struct ProducerFlow {
    producer_id: u64,
    state: Mutex<State>,
    resumed: Condvar,
}

impl ProducerFlow {
    /// Creates the flow with the credit granted by the add-producer reply.
    /// Negative credit means the broker imposes no window.
    pub fn new(producer_id: u64, chunk_bytes: i64, chunk_size: i32) -> Self {
        Self {
            producer_id,
            state: Mutex::new(State {
                chunk_bytes,
                chunk_size,
                sent_count: 0,
                closed: false,
                close_reason: MqError::ProducerClosed,
                references: 0,
            }),
            resumed: Condvar::new(),
        }
    }

    pub fn producer_id(&self) -> u64 {
        self.producer_id
    }

    /// Sender-thread entry: blocks while the window is exhausted, then
    /// stamps `packet` with the producer id and, on the chunk's last
    /// message, the consumer-flow bit, and consumes one unit of credit.
    ///
    /// Fails with the close reason if the flow closes while waiting.
    pub fn check_flow_control(&self, packet: &mut Packet) -> MqResult<()> {
        let mut state = self.state.lock();

        let mut limit = check_flow_limit(&state);
        while !state.closed && limit == FlowLimit::OverLimit {
            self.resumed.wait(&mut state);
            limit = check_flow_limit(&state);
        }
        if state.closed {
            return Err(state.close_reason.clone());
        }

        packet.set_producer_id(self.producer_id);
        packet.consumer_flow = limit == FlowLimit::OnLimit;
        state.sent_count += 1;
        Ok(())
    }

    /// Replaces the window and wakes blocked senders. Called only from the
    /// read-channel thread when a resume-flow arrives.
    pub fn resume_flow(&self, chunk_bytes: i64, chunk_size: i32) {
        let mut state = self.state.lock();
        state.chunk_bytes = chunk_bytes;
        state.chunk_size = chunk_size;
        state.sent_count = 0;
        self.resumed.notify_all();
    }

    /// Closes the flow with `reason` and wakes every blocked sender.
    pub fn close(&self, reason: MqError) {
        let mut state = self.state.lock();
        state.closed = true;
        state.close_reason = reason;
        self.resumed.notify_all();
    }

    /// Takes a sender reference; fails with the close reason once closed.
    pub fn acquire_reference(&self) -> MqResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(state.close_reason.clone());
        }
        state.references += 1;
        Ok(())
    }

    /// Drops a sender reference. Returns true when the flow is closed and
    /// unreferenced, i.e. the connection may free it.
    pub fn release_reference(&self) -> bool {
        let mut state = self.state.lock();
        state.references -= 1;
        state.references == 0 && state.closed && state.close_reason == MqError::ProducerClosed
    }
}

/// Called with the monitor held.
fn check_flow_limit(state: &State) -> FlowLimit {
    if state.chunk_size < 0 {
        return FlowLimit::UnderLimit;
    }
    if state.sent_count >= state.chunk_size {
        return FlowLimit::OverLimit;
    }
    if state.sent_count == state.chunk_size - 1 {
        return FlowLimit::OnLimit;
    }
    FlowLimit::UnderLimit
}
