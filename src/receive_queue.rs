//! # Receive Queue
//!
//! FIFO of inbound packets awaiting delivery to one consumer (or, for an
//! asynchronous session, to the session dispatch thread). The queue is a
//! small state machine:
//!
//! ```text
//!             start/stop
//!   Open-Running <-----> Open-Stopped
//!        \                   /
//!         \--- close -------/----> Closed (terminal)
//! ```
//!
//! Stopping pauses delivery without dropping anything; closing is terminal
//! and wakes every blocked waiter so receivers can fail with a
//! close-specific error. The queue's capacity bound is the broker-granted
//! consumer prefetch window, so enqueue itself never blocks.
//!
//! Timed waits may wake early; the dequeue loop recomputes the remaining
//! interval from a monotonic clock and reports a timeout only once the
//! cumulative wait covers the full requested interval.

use crate::packet::Packet;
use crate::session_mutex::Wait;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Instant;

/// Observer invoked after a packet is enqueued while the queue is running.
/// Sync consumers use this to surface a message-arrival callback.
pub type EnqueueObserver = Box<dyn Fn() + Send + Sync>;

struct State {
    items: VecDeque<Packet>,
    stopped: bool,
    closed: bool,
    /// Receives handed out but not yet finished; counted so emptiness
    /// checks used by acknowledgement batching see in-flight deliveries.
    receives_in_progress: u32,
}

/// Gated FIFO of inbound packets for one delivery target.
pub struct ReceiveQueue {
    state: Mutex<State>,
    available: Condvar,
    on_enqueue: Mutex<Option<EnqueueObserver>>,
}

impl Default for ReceiveQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                stopped: false,
                closed: false,
                receives_in_progress: 0,
            }),
            available: Condvar::new(),
            on_enqueue: Mutex::new(None),
        }
    }

    /// Creates the queue already stopped, for consumers created inside a
    /// stopped session.
    pub fn new_stopped() -> Self {
        let queue = Self::new();
        queue.state.lock().stopped = true;
        queue
    }

    /// Installs the enqueue observer. Replaces any previous observer.
    pub fn set_enqueue_observer(&self, observer: EnqueueObserver) {
        *self.on_enqueue.lock() = Some(observer);
    }

    /// Appends a packet. Dropped silently if the queue is closed. While
    /// running, wakes one waiter and invokes the enqueue observer.
    pub fn enqueue(&self, packet: Packet) {
        let notify = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.items.push_back(packet);
            if !state.stopped {
                self.available.notify_one();
            }
            !state.stopped
        };
        if notify {
            // Outside the monitor: the observer may call back into user code.
            if let Some(observer) = &*self.on_enqueue.lock() {
                observer();
            }
        }
    }

    /// Removes the next packet, waiting per `wait`.
    ///
    /// Returns `None` on an empty `NoWait`, on a fully elapsed timeout, or
    /// on close; the caller distinguishes the last case via
    /// [`ReceiveQueue::is_closed`]. A successful dequeue counts as an
    /// in-flight receive until [`ReceiveQueue::receive_done`].
    pub fn dequeue_wait(&self, wait: Wait) -> Option<Packet> {
        let deadline = match wait {
            Wait::Timeout(timeout) => Some(Instant::now() + timeout),
            _ => None,
        };
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if !state.stopped {
                if let Some(packet) = state.items.pop_front() {
                    state.receives_in_progress += 1;
                    return Some(packet);
                }
            }
            match wait {
                Wait::NoWait => return None,
                Wait::Forever => {
                    self.available.wait(&mut state);
                }
                Wait::Timeout(_) => {
                    let deadline = deadline.expect("timed wait has a deadline");
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    self.available.wait_for(&mut state, deadline - now);
                }
            }
        }
    }

    /// Marks one handed-out receive as finished.
    pub fn receive_done(&self) {
        let mut state = self.state.lock();
        state.receives_in_progress = state.receives_in_progress.saturating_sub(1);
    }

    /// Pauses delivery. Queued packets are retained.
    pub fn stop(&self) {
        self.state.lock().stopped = true;
    }

    /// Resumes delivery and wakes every waiter.
    pub fn start(&self) {
        let mut state = self.state.lock();
        state.stopped = false;
        self.available.notify_all();
    }

    /// Closes the queue, optionally discarding queued packets, and wakes
    /// every waiter. Terminal and idempotent.
    pub fn close(&self, drain: bool) {
        let mut state = self.state.lock();
        state.closed = true;
        if drain {
            state.items.clear();
        }
        self.available.notify_all();
    }

    /// Flags every queued packet as redelivered; used when a recover or
    /// rollback restarts delivery of prefetched messages.
    pub fn mark_all_redelivered(&self) {
        let mut state = self.state.lock();
        for packet in state.items.iter_mut() {
            packet.redelivered = true;
        }
    }

    /// True when nothing is queued. A receive already handed out does not
    /// count; the DUPS_OK flush-on-drain rule relies on that.
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Receives handed out but not yet finished with
    /// [`ReceiveQueue::receive_done`].
    pub fn in_flight_receives(&self) -> u32 {
        self.state.lock().receives_in_progress
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }
}
