//! # Protocol Handler
//!
//! Synchronous request/reply over the framed transport. Each request
//! allocates a correlation id, registers a one-shot waiter keyed by that
//! id, writes the packet, and blocks until the read channel fills the
//! waiter with the matching reply, the configured timeout elapses, or the
//! handler is closed out from under it.
//!
//! Correlation reuses the packet's `consumer_id` field on control
//! packets, which is how the broker echoes it back on replies. The verbs
//! built on this plumbing cover the whole control surface: hello, auth,
//! consumer/producer registration, acknowledgement blocks, transactions,
//! client id, flow resume, and goodbye.

use crate::error::{MqError, MqResult};
use crate::packet::{
    encode_ack_block, AckEntry, Packet, PacketType, ACK_TYPE_STANDARD, JMQ_ACK_TYPE,
    JMQ_CLIENT_ID, JMQ_DEST_TYPE, JMQ_DESTINATION, JMQ_DURABLE_NAME, JMQ_NO_LOCAL, JMQ_PASSWORD,
    JMQ_PROTOCOL_LEVEL, JMQ_SELECTOR, JMQ_SHARE, JMQ_SIZE, JMQ_USER, PROTOCOL_VERSION,
};
use crate::properties::Properties;
use crate::transport::Transport;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

enum WaiterState {
    Waiting,
    Filled(Packet),
    Closed(MqError),
}

struct ReplyWaiter {
    state: Mutex<WaiterState>,
    filled: Condvar,
}

impl ReplyWaiter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(WaiterState::Waiting),
            filled: Condvar::new(),
        })
    }

    fn fill(&self, packet: Packet) {
        let mut state = self.state.lock();
        *state = WaiterState::Filled(packet);
        self.filled.notify_one();
    }

    fn close(&self, reason: MqError) {
        let mut state = self.state.lock();
        if matches!(*state, WaiterState::Waiting) {
            *state = WaiterState::Closed(reason);
        }
        self.filled.notify_one();
    }

    /// Waits for the reply, recomputing the remaining interval across
    /// spurious wakeups.
    fn wait(&self, timeout: Option<Duration>) -> MqResult<Packet> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            match std::mem::replace(&mut *state, WaiterState::Waiting) {
                WaiterState::Filled(packet) => return Ok(packet),
                WaiterState::Closed(reason) => return Err(reason),
                WaiterState::Waiting => {}
            }
            match deadline {
                None => {
                    self.filled.wait(&mut state);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(MqError::TimeoutExpired);
                    }
                    self.filled.wait_for(&mut state, deadline - now);
                }
            }
        }
    }
}

/// Parameters for registering a consumer with the broker.
pub struct ConsumerRegistration<'a> {
    pub session_id: u64,
    pub destination_name: &'a str,
    pub dest_type_bits: i32,
    pub subscription_name: Option<&'a str>,
    pub durable: bool,
    pub shared: bool,
    pub no_local: bool,
    pub selector: Option<&'a str>,
    pub prefetch_max: i32,
}

/// Blocking request/reply engine shared by a connection.
pub struct ProtocolHandler {
    transport: Arc<dyn Transport>,
    pending: Mutex<HashMap<u64, Arc<ReplyWaiter>>>,
    next_request_id: AtomicU64,
    request_timeout: Option<Duration>,
    close_reason: Mutex<Option<MqError>>,
}

impl ProtocolHandler {
    pub fn new(transport: Arc<dyn Transport>, request_timeout: Option<Duration>) -> Self {
        Self {
            transport,
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            request_timeout,
            close_reason: Mutex::new(None),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    fn check_open(&self) -> MqResult<()> {
        match &*self.close_reason.lock() {
            Some(reason) => Err(reason.clone()),
            None => Ok(()),
        }
    }

    /// Writes a packet without expecting a reply.
    pub fn write(&self, packet: &Packet) -> MqResult<()> {
        self.check_open()?;
        self.transport.send(packet).map_err(|e| match e {
            MqError::BrokerConnectionClosed => e,
            _ => MqError::ProtocolHandlerWriteError,
        })
    }

    /// One request/reply exchange: correlate, write, wait, validate the
    /// reply type. Status validation is left to the caller because some
    /// verbs map statuses specially.
    fn request(&self, mut packet: Packet, expected_reply: PacketType) -> MqResult<Packet> {
        self.check_open()?;

        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        packet.consumer_id = id;

        let waiter = ReplyWaiter::new();
        self.pending.lock().insert(id, waiter.clone());

        if let Err(e) = self.write(&packet) {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        let result = waiter.wait(self.request_timeout);
        self.pending.lock().remove(&id);

        let reply = result?;
        if reply.packet_type() != expected_reply {
            warn!(
                "expected {} reply, broker sent {}",
                expected_reply,
                reply.packet_type()
            );
            return Err(MqError::ProtocolHandlerUnexpectedReply);
        }
        Ok(reply)
    }

    /// Same as [`Self::request`] plus the common OK-status check.
    fn request_ok(&self, packet: Packet, expected_reply: PacketType) -> MqResult<Packet> {
        let reply = self.request(packet, expected_reply)?;
        MqError::check_broker_status(reply.status())?;
        Ok(reply)
    }

    /// Read-channel entry: routes a reply to its waiter by correlation id.
    pub fn complete(&self, reply: Packet) {
        let id = reply.consumer_id;
        match self.pending.lock().remove(&id) {
            Some(waiter) => waiter.fill(reply),
            None => debug!(
                "dropping uncorrelated {} reply (id {})",
                reply.packet_type(),
                id
            ),
        }
    }

    /// Fails every pending and future request with `reason`. Idempotent.
    pub fn close(&self, reason: MqError) {
        {
            let mut close_reason = self.close_reason.lock();
            if close_reason.is_some() {
                return;
            }
            *close_reason = Some(reason.clone());
        }
        for (_, waiter) in self.pending.lock().drain() {
            waiter.close(reason.clone());
        }
    }

    // --- verbs ---

    /// HELLO: protocol version exchange. Returns the broker-descriptive
    /// reply headers (product, version).
    pub fn hello(&self) -> MqResult<Properties> {
        let mut packet = Packet::new(PacketType::Hello);
        packet
            .headers
            .set_int32(JMQ_PROTOCOL_LEVEL, PROTOCOL_VERSION);
        let reply = self
            .request(packet, PacketType::HelloReply)
            .map_err(|e| match e {
                MqError::TimeoutExpired | MqError::ProtocolHandlerUnexpectedReply => {
                    MqError::ProtocolHandlerHelloFailed
                }
                other => other,
            })?;
        match reply.status() {
            200 => Ok(reply.headers),
            505 => Err(MqError::BrokerBadVersion),
            status => Err(MqError::check_broker_status(status).unwrap_err()),
        }
    }

    /// AUTHENTICATE: username/password login.
    pub fn authenticate(&self, user: &str, password: &str) -> MqResult<()> {
        let mut packet = Packet::new(PacketType::Authenticate);
        packet.headers.set_string(JMQ_USER, user);
        packet.headers.set_string(JMQ_PASSWORD, password);
        let reply = self.request(packet, PacketType::AuthenticateReply)?;
        match reply.status() {
            200 => Ok(()),
            403 => Err(MqError::BrokerInvalidLogin),
            status => Err(MqError::check_broker_status(status).unwrap_err()),
        }
    }

    /// SET_CLIENTID: claims a client identity on the broker.
    pub fn set_client_id(&self, client_id: &str) -> MqResult<()> {
        let mut packet = Packet::new(PacketType::SetClientId);
        packet.headers.set_string(JMQ_CLIENT_ID, client_id);
        self.request_ok(packet, PacketType::SetClientIdReply)
            .map_err(|e| match e {
                MqError::TimeoutExpired => MqError::ProtocolHandlerSetClientIdFailed,
                other => other,
            })?;
        Ok(())
    }

    /// CREATE_SESSION: returns the broker-assigned session id.
    pub fn create_session(&self) -> MqResult<u64> {
        let packet = Packet::new(PacketType::CreateSession);
        let reply = self.request_ok(packet, PacketType::CreateSessionReply)?;
        Ok(reply.session_id())
    }

    /// DESTROY_SESSION.
    pub fn destroy_session(&self, session_id: u64) -> MqResult<()> {
        let mut packet = Packet::new(PacketType::DestroySession);
        packet.set_session_id(session_id);
        self.request_ok(packet, PacketType::DestroySessionReply)?;
        Ok(())
    }

    /// ADD_CONSUMER: returns the broker-assigned consumer id.
    pub fn add_consumer(&self, registration: &ConsumerRegistration<'_>) -> MqResult<u64> {
        let mut packet = Packet::new(PacketType::AddConsumer);
        packet.set_session_id(registration.session_id);
        packet
            .headers
            .set_string(JMQ_DESTINATION, registration.destination_name);
        packet
            .headers
            .set_int32(JMQ_DEST_TYPE, registration.dest_type_bits);
        if let Some(name) = registration.subscription_name {
            packet.headers.set_string(JMQ_DURABLE_NAME, name);
        }
        packet
            .headers
            .set_bool(crate::packet::JMQ_DURABLE, registration.durable);
        packet.headers.set_bool(JMQ_SHARE, registration.shared);
        packet.headers.set_bool(JMQ_NO_LOCAL, registration.no_local);
        if let Some(selector) = registration.selector {
            packet.headers.set_string(JMQ_SELECTOR, selector);
        }
        packet
            .headers
            .set_int32(JMQ_SIZE, registration.prefetch_max);

        let reply = self.request_ok(packet, PacketType::AddConsumerReply)?;
        Ok(reply
            .headers
            .get_int64(crate::packet::JMQ_CONSUMER_ID)
            .map(|v| v as u64)
            .map_err(|_| MqError::InvalidPacketField)?)
    }

    /// DELETE_CONSUMER: deregisters a consumer. Given a subscription
    /// name and no live consumer id, it instead unsubscribes a durable.
    pub fn delete_consumer(
        &self,
        session_id: u64,
        consumer_id: Option<u64>,
        durable_name: Option<&str>,
        client_id: Option<&str>,
    ) -> MqResult<()> {
        let mut packet = Packet::new(PacketType::DeleteConsumer);
        packet.set_session_id(session_id);
        if let Some(id) = consumer_id {
            packet
                .headers
                .set_int64(crate::packet::JMQ_CONSUMER_ID, id as i64);
        }
        if let Some(name) = durable_name {
            packet.headers.set_string(JMQ_DURABLE_NAME, name);
        }
        if let Some(id) = client_id {
            packet.headers.set_string(JMQ_CLIENT_ID, id);
        }
        self.request_ok(packet, PacketType::DeleteConsumerReply)?;
        Ok(())
    }

    /// ADD_PRODUCER: returns `(producer_id, chunk_bytes, chunk_size)`,
    /// the id plus the initial send-window credit.
    pub fn add_producer(
        &self,
        session_id: u64,
        destination_name: &str,
        dest_type_bits: i32,
    ) -> MqResult<(u64, i64, i32)> {
        let mut packet = Packet::new(PacketType::AddProducer);
        packet.set_session_id(session_id);
        packet.headers.set_string(JMQ_DESTINATION, destination_name);
        packet.headers.set_int32(JMQ_DEST_TYPE, dest_type_bits);

        let reply = self.request_ok(packet, PacketType::AddProducerReply)?;
        let producer_id = reply.producer_id();
        let (chunk_bytes, chunk_size) = reply.flow_credit();
        Ok((producer_id, chunk_bytes, chunk_size))
    }

    /// DELETE_PRODUCER.
    pub fn delete_producer(&self, session_id: u64, producer_id: u64) -> MqResult<()> {
        let mut packet = Packet::new(PacketType::DeleteProducer);
        packet.set_session_id(session_id);
        packet.set_producer_id(producer_id);
        self.request_ok(packet, PacketType::DeleteProducerReply)?;
        Ok(())
    }

    /// CREATE_DESTINATION. The broker treats an existing destination as
    /// success.
    pub fn create_destination(&self, name: &str, dest_type_bits: i32) -> MqResult<()> {
        let mut packet = Packet::new(PacketType::CreateDestination);
        packet.headers.set_string(JMQ_DESTINATION, name);
        packet.headers.set_int32(JMQ_DEST_TYPE, dest_type_bits);
        let reply = self.request(packet, PacketType::CreateDestinationReply)?;
        match reply.status() {
            200 | 409 => Ok(()),
            status => Err(MqError::check_broker_status(status).unwrap_err()),
        }
    }

    /// DESTROY_DESTINATION, used when temporary destinations die with
    /// their connection.
    pub fn destroy_destination(&self, name: &str, dest_type_bits: i32) -> MqResult<()> {
        let mut packet = Packet::new(PacketType::DestroyDestination);
        packet.headers.set_string(JMQ_DESTINATION, name);
        packet.headers.set_int32(JMQ_DEST_TYPE, dest_type_bits);
        self.request_ok(packet, PacketType::DestroyDestinationReply)
            .map_err(|e| match e {
                MqError::TimeoutExpired => MqError::ProtocolHandlerDeleteDestinationFailed,
                other => other,
            })?;
        Ok(())
    }

    /// START: resumes delivery for the whole connection or one session.
    /// Fire-and-forget; the broker sends no reply.
    pub fn start(&self, session_id: Option<u64>) -> MqResult<()> {
        let mut packet = Packet::new(PacketType::Start);
        if let Some(id) = session_id {
            packet.set_session_id(id);
        }
        self.write(&packet).map_err(|e| match e {
            MqError::ProtocolHandlerWriteError => MqError::ProtocolHandlerStartFailed,
            other => other,
        })
    }

    /// STOP: pauses delivery for the whole connection or one session and
    /// waits for the broker to confirm.
    pub fn stop(&self, session_id: Option<u64>) -> MqResult<()> {
        let mut packet = Packet::new(PacketType::Stop);
        if let Some(id) = session_id {
            packet.set_session_id(id);
        }
        self.request_ok(packet, PacketType::StopReply)
            .map_err(|e| match e {
                MqError::TimeoutExpired => MqError::ProtocolHandlerStopFailed,
                other => other,
            })?;
        Ok(())
    }

    /// ACKNOWLEDGE: flushes an ack block. `wait` selects whether the
    /// caller needs broker confirmation (AUTO, CLIENT, transacted) or
    /// tolerates loss (DUPS_OK, expired blocks).
    pub fn acknowledge(
        &self,
        session_id: u64,
        transaction_id: u64,
        ack_type: i32,
        entries: &[AckEntry],
        wait: bool,
    ) -> MqResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut packet = Packet::new(PacketType::Acknowledge);
        packet.set_session_id(session_id);
        if transaction_id != 0 {
            packet.set_transaction_id(transaction_id);
        }
        if ack_type != ACK_TYPE_STANDARD {
            packet.headers.set_int32(JMQ_ACK_TYPE, ack_type);
        }
        packet.body = encode_ack_block(entries)?;

        if wait {
            self.request_ok(packet, PacketType::AcknowledgeReply)?;
            Ok(())
        } else {
            self.write(&packet)
        }
    }

    /// REDELIVER: asks the broker to redeliver the listed unconsumed
    /// messages, flagged redelivered. No reply.
    pub fn redeliver(
        &self,
        session_id: u64,
        set_redelivered: bool,
        entries: &[AckEntry],
    ) -> MqResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut packet = Packet::new(PacketType::Redeliver);
        packet.set_session_id(session_id);
        packet.redelivered = set_redelivered;
        packet.body = encode_ack_block(entries)?;
        self.write(&packet)
    }

    /// START_TRANSACTION: opens a broker-side transaction, returning its id.
    pub fn start_transaction(&self, session_id: u64) -> MqResult<u64> {
        let mut packet = Packet::new(PacketType::StartTransaction);
        packet.set_session_id(session_id);
        let reply = self.request_ok(packet, PacketType::StartTransactionReply)?;
        let id = reply.transaction_id();
        if id == 0 {
            return Err(MqError::InvalidTransactionId);
        }
        Ok(id)
    }

    /// COMMIT_TRANSACTION.
    pub fn commit_transaction(&self, transaction_id: u64) -> MqResult<()> {
        let mut packet = Packet::new(PacketType::CommitTransaction);
        packet.set_transaction_id(transaction_id);
        self.request_ok(packet, PacketType::CommitTransactionReply)?;
        Ok(())
    }

    /// ROLLBACK_TRANSACTION.
    pub fn rollback_transaction(&self, transaction_id: u64) -> MqResult<()> {
        let mut packet = Packet::new(PacketType::RollbackTransaction);
        packet.set_transaction_id(transaction_id);
        self.request_ok(packet, PacketType::RollbackTransactionReply)?;
        Ok(())
    }

    /// RECOVER_TRANSACTION: queries the broker for a transaction still in
    /// prepared state, for the session-level XA hooks.
    pub fn recover_transaction(&self, transaction_id: u64) -> MqResult<()> {
        let mut packet = Packet::new(PacketType::RecoverTransaction);
        packet.set_transaction_id(transaction_id);
        self.request_ok(packet, PacketType::RecoverTransactionReply)?;
        Ok(())
    }

    /// RESUME_FLOW sent client-to-broker: reopens a paused consumer flow with
    /// a fresh prefetch window. No reply.
    pub fn resume_consumer_flow(&self, prefetch_max: i32) -> MqResult<()> {
        let mut packet = Packet::new(PacketType::ResumeFlow);
        packet.headers.set_int32(JMQ_SIZE, prefetch_max);
        self.write(&packet).map_err(|e| match e {
            MqError::ProtocolHandlerWriteError => MqError::ProtocolHandlerResumeFlowFailed,
            other => other,
        })
    }

    /// PING keep-alive round trip.
    pub fn ping(&self) -> MqResult<()> {
        let packet = Packet::new(PacketType::Ping);
        self.request_ok(packet, PacketType::PingReply)?;
        Ok(())
    }

    /// Sends a JMS message. Persistent sends wait for the broker's
    /// SEND_REPLY and surface its status; non-persistent sends return as
    /// soon as the packet is written.
    pub fn write_jms_message(&self, packet: Packet) -> MqResult<()> {
        if packet.persistent {
            let reply = self.request(packet, PacketType::SendReply)?;
            match reply.status() {
                200 => Ok(()),
                404 => Err(MqError::BrokerNotFound),
                413 => Err(MqError::BrokerEntityTooLarge),
                507 => Err(MqError::BrokerResourceFull),
                status => Err(MqError::check_broker_status(status).unwrap_err()),
            }
        } else {
            self.write(&packet)
        }
    }

    /// GOODBYE: orderly shutdown notice. Best effort; a dead pipe is not
    /// an error during close.
    pub fn goodbye(&self, wait: bool) -> MqResult<()> {
        let packet = Packet::new(PacketType::Goodbye);
        if wait {
            self.request_ok(packet, PacketType::GoodbyeReply)
                .map_err(|e| match e {
                    MqError::TimeoutExpired => MqError::ProtocolHandlerGoodbyeFailed,
                    other => other,
                })?;
            Ok(())
        } else {
            self.write(&packet)
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LoopbackTransport, Transport};
    use std::thread::{self, JoinHandle};

    /// Stands in for the read channel: routes every packet the broker
    /// sends back into the handler's waiter table.
    fn spawn_reply_pump(
        handler: Arc<ProtocolHandler>,
        client: Arc<LoopbackTransport>,
    ) -> JoinHandle<()> {
        thread::spawn(move || loop {
            match client.recv() {
                Ok(reply) => handler.complete(reply),
                Err(_) => break,
            }
        })
    }

    /// Broker stand-in answering exactly one request.
    fn reply_once(
        broker: Arc<LoopbackTransport>,
        reply_type: PacketType,
        status: u32,
        prepare: impl FnOnce(&Packet, &mut Packet) + Send + 'static,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            let request = broker.recv().unwrap();
            let mut reply = Packet::new(reply_type);
            reply.consumer_id = request.consumer_id;
            reply.set_status(status);
            prepare(&request, &mut reply);
            broker.send(&reply).unwrap();
        })
    }

    struct Fixture {
        handler: Arc<ProtocolHandler>,
        client: Arc<LoopbackTransport>,
        broker: Arc<LoopbackTransport>,
        pump: JoinHandle<()>,
    }

    impl Fixture {
        fn new() -> Self {
            let (client, broker) = LoopbackTransport::pair();
            let client = Arc::new(client);
            let handler = Arc::new(ProtocolHandler::new(
                client.clone() as Arc<dyn Transport>,
                Some(Duration::from_secs(5)),
            ));
            let pump = spawn_reply_pump(handler.clone(), client.clone());
            Self {
                handler,
                client,
                broker: Arc::new(broker),
                pump,
            }
        }

        fn finish(self) {
            self.client.shutdown().unwrap();
            self.pump.join().unwrap();
        }
    }

    #[test]
    fn test_request_reply_correlation() {
        let fixture = Fixture::new();
        let responder = reply_once(
            fixture.broker.clone(),
            PacketType::CreateSessionReply,
            200,
            |_, reply| reply.set_session_id(42),
        );

        assert_eq!(fixture.handler.create_session().unwrap(), 42);
        responder.join().unwrap();
        fixture.finish();
    }

    #[test]
    fn test_broker_error_status_maps() {
        let fixture = Fixture::new();
        let responder = reply_once(
            fixture.broker.clone(),
            PacketType::AddConsumerReply,
            404,
            |_, _| {},
        );

        let registration = ConsumerRegistration {
            session_id: 1,
            destination_name: "missing",
            dest_type_bits: 1,
            subscription_name: None,
            durable: false,
            shared: false,
            no_local: false,
            selector: None,
            prefetch_max: 100,
        };
        assert_eq!(
            fixture.handler.add_consumer(&registration),
            Err(MqError::BrokerNotFound)
        );
        responder.join().unwrap();
        fixture.finish();
    }

    #[test]
    fn test_add_producer_returns_credit() {
        let fixture = Fixture::new();
        let responder = reply_once(
            fixture.broker.clone(),
            PacketType::AddProducerReply,
            200,
            |request, reply| {
                assert_eq!(
                    request.headers.get_string(JMQ_DESTINATION).unwrap(),
                    "orders"
                );
                reply.set_producer_id(77);
                reply.set_flow_credit(1 << 20, 3);
            },
        );

        let (producer_id, chunk_bytes, chunk_size) =
            fixture.handler.add_producer(5, "orders", 1).unwrap();
        assert_eq!(producer_id, 77);
        assert_eq!(chunk_bytes, 1 << 20);
        assert_eq!(chunk_size, 3);
        responder.join().unwrap();
        fixture.finish();
    }

    #[test]
    fn test_timeout_expires() {
        let (client, _broker) = LoopbackTransport::pair();
        let handler = ProtocolHandler::new(
            Arc::new(client) as Arc<dyn Transport>,
            Some(Duration::from_millis(100)),
        );
        let started = Instant::now();
        assert_eq!(handler.create_session(), Err(MqError::TimeoutExpired));
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_close_fails_pending_and_future_requests() {
        let (client, _broker) = LoopbackTransport::pair();
        let handler = Arc::new(ProtocolHandler::new(
            Arc::new(client) as Arc<dyn Transport>,
            None,
        ));

        let pending = {
            let handler = handler.clone();
            thread::spawn(move || handler.create_session())
        };
        thread::sleep(Duration::from_millis(50));
        handler.close(MqError::BrokerConnectionClosed);

        assert_eq!(
            pending.join().unwrap(),
            Err(MqError::BrokerConnectionClosed)
        );
        assert_eq!(
            handler.create_session(),
            Err(MqError::BrokerConnectionClosed)
        );
    }

    #[test]
    fn test_unexpected_reply_type() {
        let fixture = Fixture::new();
        let responder = reply_once(
            fixture.broker.clone(),
            PacketType::StopReply,
            200,
            |_, _| {},
        );

        assert_eq!(
            fixture.handler.create_session(),
            Err(MqError::ProtocolHandlerUnexpectedReply)
        );
        responder.join().unwrap();
        fixture.finish();
    }

    #[test]
    fn test_empty_ack_block_is_a_noop() {
        let (client, _broker) = LoopbackTransport::pair();
        let handler = ProtocolHandler::new(Arc::new(client) as Arc<dyn Transport>, None);
        handler
            .acknowledge(1, 0, ACK_TYPE_STANDARD, &[], true)
            .unwrap();
    }
}
