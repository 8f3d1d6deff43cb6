//! Scripted in-process broker used by the integration suites.
//!
//! `TestBroker` owns one end of a loopback transport pair and a service
//! thread that answers the client's control packets the way a real broker
//! would: handshake, session/consumer/producer registration with
//! broker-assigned ids, acknowledgement replies, and transaction ids.
//! Everything it sees is recorded for assertions, and tests drive
//! deliveries and flow-control packets explicitly so every scenario is
//! deterministic.

// Not every suite touches every helper.
#![allow(dead_code)]

use openmq_client::packet::{
    decode_ack_block, AckEntry, Packet, PacketType, SysMessageId, JMQ_CONSUMER_ID,
    JMQ_DESTINATION, JMQ_DURABLE, JMQ_DURABLE_NAME, JMQ_PRODUCT, JMQ_VERSION,
};
use openmq_client::transport::{LoopbackTransport, Transport};
use openmq_client::{Connection, ConnectionConfig, ExceptionListener};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// One consumer registration the broker has seen.
#[derive(Debug, Clone)]
pub struct RegisteredConsumer {
    pub consumer_id: u64,
    pub destination: String,
    pub durable: bool,
    pub subscription_name: Option<String>,
}

/// One recorded acknowledgement block.
#[derive(Debug, Clone)]
pub struct RecordedAck {
    pub transaction_id: u64,
    pub ack_type: i32,
    pub entries: Vec<AckEntry>,
}

#[derive(Default)]
pub struct BrokerState {
    pub sends: Mutex<Vec<Packet>>,
    pub acks: Mutex<Vec<RecordedAck>>,
    pub redelivers: Mutex<Vec<(bool, Vec<AckEntry>)>>,
    pub consumers: Mutex<Vec<RegisteredConsumer>>,
    pub deleted_consumers: Mutex<Vec<(Option<u64>, Option<String>)>>,
    pub producers: Mutex<Vec<(u64, String)>>,
    pub created_destinations: Mutex<Vec<(String, i32)>>,
    pub destroyed_destinations: Mutex<Vec<String>>,
    pub committed: Mutex<Vec<u64>>,
    pub rolled_back: Mutex<Vec<u64>>,
    pub goodbyes: AtomicU32,
    pub starts: AtomicU32,
    pub stops: AtomicU32,

    /// Send-window credit granted on the next add-producer.
    pub producer_credit: Mutex<(i64, i32)>,

    next_session_id: AtomicU64,
    next_consumer_id: AtomicU64,
    next_producer_id: AtomicU64,
    next_transaction_id: AtomicU64,
    delivery_seq: AtomicU32,
}

/// A scripted broker over a loopback pipe.
pub struct TestBroker {
    pub state: Arc<BrokerState>,
    transport: Arc<LoopbackTransport>,
    service: Option<JoinHandle<()>>,
}

impl TestBroker {
    /// Starts the broker thread and returns it with the client-side
    /// transport endpoint.
    pub fn start() -> (TestBroker, Box<LoopbackTransport>) {
        let (client_side, broker_side) = LoopbackTransport::pair();
        let transport = Arc::new(broker_side);
        let state = Arc::new(BrokerState {
            producer_credit: Mutex::new((-1, -1)),
            next_session_id: AtomicU64::new(100),
            next_consumer_id: AtomicU64::new(1000),
            next_producer_id: AtomicU64::new(5000),
            next_transaction_id: AtomicU64::new(9000),
            ..BrokerState::default()
        });

        let service = {
            let transport = transport.clone();
            let state = state.clone();
            std::thread::Builder::new()
                .name("test-broker".to_string())
                .spawn(move || serve(transport, state))
                .expect("spawn test broker")
        };

        (
            TestBroker {
                state,
                transport,
                service: Some(service),
            },
            Box::new(client_side),
        )
    }

    /// Convenience: broker + connected client connection.
    pub fn start_connected() -> (TestBroker, Arc<Connection>) {
        Self::start_connected_with(ConnectionConfig::default(), None, None)
    }

    pub fn start_connected_with(
        config: ConnectionConfig,
        client_id: Option<&str>,
        exception_listener: Option<ExceptionListener>,
    ) -> (TestBroker, Arc<Connection>) {
        let (broker, transport) = Self::start();
        let connection = Connection::open_with_transport(
            transport,
            config,
            "guest",
            "guest",
            client_id,
            exception_listener,
        )
        .expect("connect to test broker");
        (broker, connection)
    }

    /// Grants this credit on every subsequent add-producer.
    pub fn set_producer_credit(&self, chunk_bytes: i64, chunk_size: i32) {
        *self.state.producer_credit.lock().unwrap() = (chunk_bytes, chunk_size);
    }

    /// Pushes a text message to `consumer_id`, returning the stamped id.
    pub fn deliver_text(&self, consumer_id: u64, body: &str) -> SysMessageId {
        self.deliver(consumer_id, body, 0)
    }

    /// Pushes an already-expired text message to `consumer_id`.
    pub fn deliver_expired(&self, consumer_id: u64, body: &str) -> SysMessageId {
        self.deliver(consumer_id, body, 1)
    }

    fn deliver(&self, consumer_id: u64, body: &str, expiration: u64) -> SysMessageId {
        let sys_message_id = SysMessageId {
            timestamp: 1,
            host: 0x7f00_0001,
            port: 7676,
            sequence: self.state.delivery_seq.fetch_add(1, Ordering::Relaxed) + 1,
        };
        let mut packet = Packet::new(PacketType::TextMessage);
        packet.sys_message_id = sys_message_id;
        packet.consumer_id = consumer_id;
        packet.expiration = expiration;
        packet.destination = Some("test".to_string());
        packet.body = body.as_bytes().to_vec();
        self.transport.send(&packet).expect("deliver to client");
        sys_message_id
    }

    /// Grants a producer a fresh send window.
    pub fn resume_producer_flow(&self, producer_id: u64, chunk_bytes: i64, chunk_size: i32) {
        let mut packet = Packet::new(PacketType::ResumeFlow);
        packet.set_producer_id(producer_id);
        packet.set_flow_credit(chunk_bytes, chunk_size);
        self.transport.send(&packet).expect("resume flow");
    }

    /// Pauses the client's consumer-side flow.
    pub fn pause_consumer_flow(&self) {
        let packet = Packet::new(PacketType::FlowPaused);
        self.transport.send(&packet).expect("flow paused");
    }

    /// Drops the broker side of the pipe, simulating a broker crash.
    pub fn kill(&self) {
        self.transport.shutdown().expect("kill broker pipe");
    }

    /// First registered consumer id, for single-consumer tests.
    pub fn sole_consumer_id(&self) -> u64 {
        let consumers = self.state.consumers.lock().unwrap();
        assert_eq!(consumers.len(), 1, "expected exactly one consumer");
        consumers[0].consumer_id
    }

    /// First registered producer id, for single-producer tests.
    pub fn sole_producer_id(&self) -> u64 {
        let producers = self.state.producers.lock().unwrap();
        assert_eq!(producers.len(), 1, "expected exactly one producer");
        producers[0].0
    }

    /// Waits until `predicate` holds or panics after two seconds.
    pub fn wait_until(&self, what: &str, predicate: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !predicate() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        let _ = self.transport.shutdown();
        if let Some(service) = self.service.take() {
            let _ = service.join();
        }
    }
}

/// Broker service loop: answer control packets until the pipe dies.
fn serve(transport: Arc<LoopbackTransport>, state: Arc<BrokerState>) {
    loop {
        let request = match transport.recv() {
            Ok(packet) => packet,
            Err(_) => break,
        };
        let packet_type = request.packet_type();

        if packet_type.is_jms_message() {
            let persistent = request.persistent;
            let correlation = request.consumer_id;
            state.sends.lock().unwrap().push(request);
            if persistent {
                let mut reply = Packet::new(PacketType::SendReply);
                reply.consumer_id = correlation;
                reply.set_status(200);
                if transport.send(&reply).is_err() {
                    break;
                }
            }
            continue;
        }

        let mut reply = match packet_type {
            PacketType::Hello => {
                let mut reply = Packet::new(PacketType::HelloReply);
                reply.headers.set_string(JMQ_PRODUCT, "ScriptedBroker");
                reply.headers.set_string(JMQ_VERSION, "6.0.0");
                reply
            }
            PacketType::Authenticate => Packet::new(PacketType::AuthenticateReply),
            PacketType::SetClientId => Packet::new(PacketType::SetClientIdReply),
            PacketType::CreateSession => {
                let mut reply = Packet::new(PacketType::CreateSessionReply);
                reply.set_session_id(state.next_session_id.fetch_add(1, Ordering::Relaxed));
                reply
            }
            PacketType::DestroySession => Packet::new(PacketType::DestroySessionReply),
            PacketType::AddConsumer => {
                let consumer_id = state.next_consumer_id.fetch_add(1, Ordering::Relaxed);
                state.consumers.lock().unwrap().push(RegisteredConsumer {
                    consumer_id,
                    destination: request
                        .headers
                        .get_string(JMQ_DESTINATION)
                        .unwrap_or_default(),
                    durable: request.headers.get_bool(JMQ_DURABLE).unwrap_or(false),
                    subscription_name: request.headers.get_string(JMQ_DURABLE_NAME).ok(),
                });
                let mut reply = Packet::new(PacketType::AddConsumerReply);
                reply
                    .headers
                    .set_int64(JMQ_CONSUMER_ID, consumer_id as i64);
                reply
            }
            PacketType::DeleteConsumer => {
                state.deleted_consumers.lock().unwrap().push((
                    request
                        .headers
                        .get_int64(JMQ_CONSUMER_ID)
                        .ok()
                        .map(|v| v as u64),
                    request.headers.get_string(JMQ_DURABLE_NAME).ok(),
                ));
                Packet::new(PacketType::DeleteConsumerReply)
            }
            PacketType::AddProducer => {
                let producer_id = state.next_producer_id.fetch_add(1, Ordering::Relaxed);
                state.producers.lock().unwrap().push((
                    producer_id,
                    request
                        .headers
                        .get_string(JMQ_DESTINATION)
                        .unwrap_or_default(),
                ));
                let (chunk_bytes, chunk_size) = *state.producer_credit.lock().unwrap();
                let mut reply = Packet::new(PacketType::AddProducerReply);
                reply.set_producer_id(producer_id);
                reply.set_flow_credit(chunk_bytes, chunk_size);
                reply
            }
            PacketType::DeleteProducer => Packet::new(PacketType::DeleteProducerReply),
            PacketType::CreateDestination => {
                state.created_destinations.lock().unwrap().push((
                    request
                        .headers
                        .get_string(JMQ_DESTINATION)
                        .unwrap_or_default(),
                    request
                        .headers
                        .get_int32(openmq_client::packet::JMQ_DEST_TYPE)
                        .unwrap_or(0),
                ));
                Packet::new(PacketType::CreateDestinationReply)
            }
            PacketType::DestroyDestination => {
                state.destroyed_destinations.lock().unwrap().push(
                    request
                        .headers
                        .get_string(JMQ_DESTINATION)
                        .unwrap_or_default(),
                );
                Packet::new(PacketType::DestroyDestinationReply)
            }
            PacketType::Acknowledge => {
                state.acks.lock().unwrap().push(RecordedAck {
                    transaction_id: request.transaction_id(),
                    ack_type: request
                        .headers
                        .get_int32(openmq_client::packet::JMQ_ACK_TYPE)
                        .unwrap_or(0),
                    entries: decode_ack_block(&request.body).unwrap_or_default(),
                });
                Packet::new(PacketType::AcknowledgeReply)
            }
            PacketType::Redeliver => {
                state.redelivers.lock().unwrap().push((
                    request.redelivered,
                    decode_ack_block(&request.body).unwrap_or_default(),
                ));
                continue; // no reply
            }
            PacketType::StartTransaction => {
                let mut reply = Packet::new(PacketType::StartTransactionReply);
                reply.set_transaction_id(
                    state.next_transaction_id.fetch_add(1, Ordering::Relaxed),
                );
                reply
            }
            PacketType::CommitTransaction => {
                state.committed.lock().unwrap().push(request.transaction_id());
                Packet::new(PacketType::CommitTransactionReply)
            }
            PacketType::RollbackTransaction => {
                state.rolled_back.lock().unwrap().push(request.transaction_id());
                Packet::new(PacketType::RollbackTransactionReply)
            }
            PacketType::Start => {
                state.starts.fetch_add(1, Ordering::Relaxed);
                continue; // no reply
            }
            PacketType::Stop => {
                state.stops.fetch_add(1, Ordering::Relaxed);
                Packet::new(PacketType::StopReply)
            }
            PacketType::ResumeFlow => {
                // Client asking to resume its consumer flow; no reply.
                continue;
            }
            PacketType::Ping => Packet::new(PacketType::PingReply),
            PacketType::Goodbye => {
                state.goodbyes.fetch_add(1, Ordering::Relaxed);
                Packet::new(PacketType::GoodbyeReply)
            }
            other => {
                panic!("scripted broker cannot answer {}", other);
            }
        };

        reply.consumer_id = request.consumer_id;
        if !reply.headers.contains_key(openmq_client::packet::JMQ_STATUS) {
            reply.set_status(200);
        }
        if transport.send(&reply).is_err() {
            break;
        }
    }
}
