//! In-process implementation of the [`Transport`] pipe.
//!
//! [`LoopbackTransport::pair`] yields two connected endpoints; whatever one
//! side sends, the other receives. The test suite hands one endpoint to a
//! scripted broker thread and the other to a real `Connection`, exercising
//! the full session runtime without a network.

use super::Transport;
use crate::error::{MqError, MqResult};
use crate::packet::Packet;
use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// One endpoint of an in-process packet pipe.
pub struct LoopbackTransport {
    tx: Mutex<Option<Sender<Packet>>>,
    rx: Receiver<Packet>,
    closed_tx: Sender<()>,
    closed_rx: Receiver<()>,
    closed: AtomicBool,
}

impl LoopbackTransport {
    /// Creates two connected endpoints.
    pub fn pair() -> (LoopbackTransport, LoopbackTransport) {
        let (a_to_b_tx, a_to_b_rx) = unbounded();
        let (b_to_a_tx, b_to_a_rx) = unbounded();
        let (a_closed_tx, a_closed_rx) = bounded(1);
        let (b_closed_tx, b_closed_rx) = bounded(1);

        let a = LoopbackTransport {
            tx: Mutex::new(Some(a_to_b_tx)),
            rx: b_to_a_rx,
            closed_tx: a_closed_tx,
            closed_rx: a_closed_rx,
            closed: AtomicBool::new(false),
        };
        let b = LoopbackTransport {
            tx: Mutex::new(Some(b_to_a_tx)),
            rx: a_to_b_rx,
            closed_tx: b_closed_tx,
            closed_rx: b_closed_rx,
            closed: AtomicBool::new(false),
        };
        (a, b)
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, packet: &Packet) -> MqResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MqError::BrokerConnectionClosed);
        }
        match &*self.tx.lock() {
            Some(tx) => tx
                .send(packet.clone())
                .map_err(|_| MqError::BrokerConnectionClosed),
            None => Err(MqError::BrokerConnectionClosed),
        }
    }

    fn recv(&self) -> MqResult<Packet> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MqError::BrokerConnectionClosed);
        }
        crossbeam::channel::select! {
            recv(self.rx) -> packet => packet.map_err(|_| MqError::TcpConnectionClosed),
            recv(self.closed_rx) -> _ => {
                self.closed.store(true, Ordering::Release);
                Err(MqError::BrokerConnectionClosed)
            }
        }
    }

    fn shutdown(&self) -> MqResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Wake a blocked recv, then drop our sender so the peer's next
        // recv observes a dead pipe.
        let _ = self.closed_tx.try_send(());
        self.tx.lock().take();
        Ok(())
    }
}
