//! # Session
//!
//! The single-threaded context within a connection for producing,
//! consuming, and tracking acknowledgements and transactions. The session
//! owns its producers and consumers, the ordered queue of unacknowledged
//! message ids, and, for asynchronous sessions, the dispatch thread
//! that serializes listener invocations.
//!
//! ## Single thread of control
//!
//! Every top-level entry point acquires the session mutex without
//! blocking; a second thread calling into a busy session gets
//! [`MqError::ConcurrentAccess`] instead of queueing. The internal
//! acknowledgement path (driven by the receive call or the dispatch
//! thread) waits for the mutex instead, so deliveries serialize with user
//! operations rather than failing them.
//!
//! ## Acknowledgement modes
//!
//! | Mode | Behavior |
//! |------|----------|
//! | AUTO | each delivery acked synchronously as a one-entry block |
//! | DUPS_OK | acks batch; flushed (no reply) when the batch reaches the configured limit or the receive queue drains |
//! | CLIENT | delivered ids queue up; [`Session::acknowledge_messages`] flushes the prefix up to and including the given message |
//! | TRANSACTED | each delivery acked into the open transaction; commit rotates to a fresh transaction id, rollback redelivers |

use crate::connection::{Connection, ConnectionCore};
use crate::consumer::{ConsumerOptions, MessageConsumer, MessageListener};
use crate::destination::{Destination, DestinationKind};
use crate::error::{MqError, MqResult};
use crate::handle::{registry, Handle, Handled, Lifecycle};
use crate::message::Message;
use crate::packet::{now_millis, AckEntry, ACK_TYPE_DEAD, ACK_TYPE_STANDARD};
use crate::producer::MessageProducer;
use crate::protocol::ConsumerRegistration;
use crate::receive_queue::ReceiveQueue;
use crate::session_mutex::{SessionMutex, Wait};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Acknowledgement policy. The numeric values are broker-visible and
/// fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum AckMode {
    Transacted = 0,
    Auto = 1,
    Client = 2,
    DupsOk = 3,
}

impl AckMode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> MqResult<Self> {
        match code {
            0 => Ok(AckMode::Transacted),
            1 => Ok(AckMode::Auto),
            2 => Ok(AckMode::Client),
            3 => Ok(AckMode::DupsOk),
            _ => Err(MqError::InvalidAckMode),
        }
    }
}

/// Whether consumers on this session block in `receive` or run listeners
/// on the session dispatch thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ReceiveMode {
    Sync = 0,
    Async = 1,
}

impl ReceiveMode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> MqResult<Self> {
        match code {
            0 => Ok(ReceiveMode::Sync),
            1 => Ok(ReceiveMode::Async),
            _ => Err(MqError::InvalidReceiveMode),
        }
    }
}

/// Transaction-boundary hooks for sessions enlisted by an external
/// transaction coordinator. Invoked around every async delivery.
pub struct XaCallbacks {
    pub before: Box<dyn Fn(&Message) -> MqResult<()> + Send + Sync>,
    pub after: Box<dyn Fn(&Message, &MqResult<()>) + Send + Sync>,
}

/// A session. Created via [`Connection::create_session`], never directly.
pub struct Session {
    core: Arc<ConnectionCore>,
    connection: Weak<Connection>,
    session_id: u64,
    ack_mode: AckMode,
    receive_mode: ReceiveMode,
    xa: Option<XaCallbacks>,
    transaction_id: AtomicU64,
    dups_ok_limit: usize,

    consumers: Mutex<HashMap<u64, (Handle, Arc<MessageConsumer>)>>,
    producers: Mutex<Vec<(Handle, Arc<MessageProducer>)>>,

    /// Delivered-but-unacknowledged ids, in delivery order (CLIENT mode).
    unacked: Mutex<VecDeque<AckEntry>>,
    /// Pending DUPS_OK acknowledgement batch.
    ack_batch: Mutex<Vec<AckEntry>>,

    /// Session-wide delivery queue; async sessions only.
    session_queue: Option<Arc<ReceiveQueue>>,
    dispatch_thread: Mutex<Option<JoinHandle<()>>>,

    mutex: SessionMutex,
    closed: AtomicBool,
    stopped: AtomicBool,
}

impl Session {
    /// Builds and registers a session. Called by the connection with its
    /// own monitor held.
    pub(crate) fn create(
        connection: &Arc<Connection>,
        core: Arc<ConnectionCore>,
        transacted: bool,
        ack_mode: AckMode,
        receive_mode: ReceiveMode,
        xa: Option<XaCallbacks>,
    ) -> MqResult<(Handle, Arc<Session>)> {
        let ack_mode = if transacted || xa.is_some() {
            AckMode::Transacted
        } else if ack_mode == AckMode::Transacted {
            return Err(MqError::InvalidAckMode);
        } else {
            ack_mode
        };

        core.check_open()?;
        let session_id = core.protocol().create_session()?;

        // A locally transacted session opens its first transaction now;
        // an XA session's transactions belong to the external coordinator.
        let transaction_id = if ack_mode == AckMode::Transacted && xa.is_none() {
            match core.protocol().start_transaction(session_id) {
                Ok(id) => id,
                Err(e) => {
                    let _ = core.protocol().destroy_session(session_id);
                    return Err(e);
                }
            }
        } else {
            0
        };

        let session_queue = match receive_mode {
            ReceiveMode::Async => Some(Arc::new(ReceiveQueue::new())),
            ReceiveMode::Sync => None,
        };
        let dups_ok_limit = core.config().dups_ok_limit;
        let stopped = connection.is_stopped();

        let session = Arc::new(Session {
            core,
            connection: Arc::downgrade(connection),
            session_id,
            ack_mode,
            receive_mode,
            xa,
            transaction_id: AtomicU64::new(transaction_id),
            dups_ok_limit,
            consumers: Mutex::new(HashMap::new()),
            producers: Mutex::new(Vec::new()),
            unacked: Mutex::new(VecDeque::new()),
            ack_batch: Mutex::new(Vec::new()),
            session_queue,
            dispatch_thread: Mutex::new(None),
            mutex: SessionMutex::new(),
            closed: AtomicBool::new(false),
            stopped: AtomicBool::new(stopped),
        });

        if receive_mode == ReceiveMode::Async {
            let runner = session.clone();
            *session.dispatch_thread.lock() = Some(
                std::thread::Builder::new()
                    .name(format!("mq-session-{}-dispatch", session_id))
                    .spawn(move || run_dispatch(runner))
                    .map_err(|_| MqError::Internal)?,
            );
        }

        let handle = match registry().allocate(
            Handled::Session(session.clone()),
            true,
            Lifecycle::Internal,
        ) {
            Ok(handle) => handle,
            Err(e) => {
                if let Some(queue) = &session.session_queue {
                    queue.close(true);
                }
                if let Some(thread) = session.dispatch_thread.lock().take() {
                    let _ = thread.join();
                }
                let _ = session.core.protocol().destroy_session(session_id);
                return Err(e);
            }
        };
        Ok((handle, session))
    }

    // --- accessors ---

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    pub fn receive_mode(&self) -> ReceiveMode {
        self.receive_mode
    }

    pub fn is_transacted(&self) -> bool {
        self.ack_mode == AckMode::Transacted
    }

    pub fn is_xa(&self) -> bool {
        self.xa.is_some()
    }

    pub(crate) fn xa_callbacks(&self) -> Option<&XaCallbacks> {
        self.xa.as_ref()
    }

    pub fn transaction_id(&self) -> u64 {
        self.transaction_id.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn core(&self) -> &Arc<ConnectionCore> {
        &self.core
    }

    pub(crate) fn session_queue(&self) -> Option<&Arc<ReceiveQueue>> {
        self.session_queue.as_ref()
    }

    pub(crate) fn get_consumer(&self, consumer_id: u64) -> Option<Arc<MessageConsumer>> {
        self.consumers
            .lock()
            .get(&consumer_id)
            .map(|(_, consumer)| consumer.clone())
    }

    fn check_open(&self) -> MqResult<()> {
        if self.is_closed() {
            return Err(MqError::SessionClosed);
        }
        self.core.check_open()
    }

    // --- producers ---

    /// Creates a producer with no bound destination.
    pub fn create_producer(self: &Arc<Self>) -> MqResult<Arc<MessageProducer>> {
        let _guard = self.mutex.lock_guard(Wait::NoWait)?;
        self.check_open()?;
        self.add_producer_locked(None)
    }

    /// Creates a producer bound to `destination`, validating it with the
    /// broker immediately.
    pub fn create_producer_for(
        self: &Arc<Self>,
        destination: &Destination,
    ) -> MqResult<Arc<MessageProducer>> {
        let _guard = self.mutex.lock_guard(Wait::NoWait)?;
        self.check_open()?;

        let name = destination.name()?.to_string();
        let clone = destination
            .clone_detached()
            .ok_or(MqError::DestinationNoName)?;
        let id = self.register_producer(destination)?;
        let producer = match self.add_producer_locked(Some(clone)) {
            Ok(producer) => producer,
            Err(e) => {
                self.unregister_producer(id);
                return Err(e);
            }
        };
        producer.seed_validated(name, id);
        Ok(producer)
    }

    fn add_producer_locked(
        self: &Arc<Self>,
        destination: Option<Destination>,
    ) -> MqResult<Arc<MessageProducer>> {
        let producer = Arc::new(MessageProducer::new(Arc::downgrade(self), destination));
        let handle = registry().allocate(
            Handled::Producer(producer.clone()),
            true,
            Lifecycle::Internal,
        )?;
        self.producers.lock().push((handle, producer.clone()));
        Ok(producer)
    }

    /// Registers a producer for one destination with the broker and
    /// installs the granted flow. Returns the issued producer id.
    pub(crate) fn register_producer(&self, destination: &Destination) -> MqResult<u64> {
        self.check_open()?;
        let name = destination.name()?;
        let (producer_id, chunk_bytes, chunk_size) =
            self.core
                .protocol()
                .add_producer(self.session_id, name, destination.dest_type_bits())?;
        self.core
            .register_flow(producer_id, chunk_bytes, chunk_size);
        Ok(producer_id)
    }

    /// Best-effort teardown of one broker producer registration.
    pub(crate) fn unregister_producer(&self, producer_id: u64) {
        self.core.close_flow(producer_id, MqError::ProducerClosed);
        if self.core.check_open().is_ok() {
            if let Err(e) = self
                .core
                .protocol()
                .delete_producer(self.session_id, producer_id)
            {
                debug!("delete-producer for {} failed: {}", producer_id, e);
            }
        }
    }

    /// Closes `producer`: deregisters every destination it validated and
    /// frees its handle.
    pub fn close_producer(&self, producer: &Arc<MessageProducer>) -> MqResult<()> {
        let _guard = self.mutex.lock_guard(Wait::NoWait)?;

        let mut producers = self.producers.lock();
        let index = producers
            .iter()
            .position(|(_, p)| Arc::ptr_eq(p, producer))
            .ok_or(MqError::ProducerNotInSession)?;
        let (handle, producer) = producers.remove(index);
        drop(producers);

        producer.close_internal();
        for producer_id in producer.validated_producer_ids() {
            self.unregister_producer(producer_id);
        }
        registry().internal_delete(handle)?;
        Ok(())
    }

    /// Stamps the send-time header fields, applies producer flow control,
    /// and writes the message. Persistent sends block on the broker reply.
    pub(crate) fn write_jms_message(
        &self,
        message: &mut Message,
        destination: &Destination,
        producer_id: u64,
        time_to_live_ms: i64,
        delivery_delay_ms: i64,
    ) -> MqResult<()> {
        let _guard = self.mutex.lock_guard(Wait::NoWait)?;
        self.check_open()?;

        let name = destination.name()?;
        let now = now_millis();
        {
            let packet = message.packet_mut();
            packet.destination = Some(name.to_string());
            packet.destination_class = Some(destination.class_name().to_string());
            packet.timestamp = now;
            packet.expiration = if time_to_live_ms > 0 {
                now + time_to_live_ms as u64
            } else {
                0
            };
            packet.delivery_time = if delivery_delay_ms > 0 {
                now + delivery_delay_ms as u64
            } else {
                0
            };
        }

        let mut packet = message.packet().clone();
        packet.consumer_id = 0;
        if self.is_transacted() {
            packet.set_transaction_id(self.transaction_id());
        }

        let flow = self.core.acquire_flow(producer_id)?;
        let result = flow
            .check_flow_control(&mut packet)
            .and_then(|_| self.core.protocol().write_jms_message(packet));
        self.core.release_flow(producer_id);
        result
    }

    // --- consumers ---

    /// Creates a plain (non-durable, non-shared) consumer.
    pub fn create_consumer(
        self: &Arc<Self>,
        destination: &Destination,
        listener: Option<MessageListener>,
    ) -> MqResult<Arc<MessageConsumer>> {
        self.create_consumer_with(destination, ConsumerOptions::default(), listener)
    }

    /// Creates a durable topic consumer under `subscription_name`.
    pub fn create_durable_consumer(
        self: &Arc<Self>,
        destination: &Destination,
        subscription_name: &str,
        no_local: bool,
        listener: Option<MessageListener>,
    ) -> MqResult<Arc<MessageConsumer>> {
        self.create_consumer_with(
            destination,
            ConsumerOptions {
                durable: true,
                subscription_name: Some(subscription_name.to_string()),
                no_local,
                ..ConsumerOptions::default()
            },
            listener,
        )
    }

    /// Creates a shared consumer under `subscription_name`.
    pub fn create_shared_consumer(
        self: &Arc<Self>,
        destination: &Destination,
        subscription_name: &str,
        listener: Option<MessageListener>,
    ) -> MqResult<Arc<MessageConsumer>> {
        self.create_consumer_with(
            destination,
            ConsumerOptions {
                shared: true,
                subscription_name: Some(subscription_name.to_string()),
                ..ConsumerOptions::default()
            },
            listener,
        )
    }

    /// Creates a shared durable consumer under `subscription_name`.
    pub fn create_shared_durable_consumer(
        self: &Arc<Self>,
        destination: &Destination,
        subscription_name: &str,
        listener: Option<MessageListener>,
    ) -> MqResult<Arc<MessageConsumer>> {
        self.create_consumer_with(
            destination,
            ConsumerOptions {
                durable: true,
                shared: true,
                subscription_name: Some(subscription_name.to_string()),
                ..ConsumerOptions::default()
            },
            listener,
        )
    }

    /// Full-option consumer creation: validates the creation contract,
    /// registers with the broker, and wires delivery routing.
    pub fn create_consumer_with(
        self: &Arc<Self>,
        destination: &Destination,
        options: ConsumerOptions,
        listener: Option<MessageListener>,
    ) -> MqResult<Arc<MessageConsumer>> {
        let _guard = self.mutex.lock_guard(Wait::NoWait)?;
        self.check_open()?;

        let consumer = MessageConsumer::new(self, destination, options, listener)?;

        let registration = ConsumerRegistration {
            session_id: self.session_id,
            destination_name: consumer.destination().name()?,
            dest_type_bits: consumer.destination().dest_type_bits(),
            subscription_name: consumer.subscription_name(),
            durable: consumer.is_durable(),
            shared: consumer.is_shared(),
            no_local: consumer.no_local(),
            selector: consumer.selector(),
            prefetch_max: consumer.prefetch_max_msg_count(),
        };
        let consumer_id = self.core.protocol().add_consumer(&registration)?;

        let consumer = Arc::new(consumer);
        consumer.set_consumer_id(consumer_id);
        consumer.install_enqueue_observer();

        // Deliveries route to the consumer's own queue (sync) or to the
        // session-wide queue drained by the dispatch thread (async).
        let route = match self.receive_mode {
            ReceiveMode::Sync => consumer
                .receive_queue()
                .expect("sync consumer has a receive queue")
                .clone(),
            ReceiveMode::Async => self
                .session_queue
                .as_ref()
                .expect("async session has a session queue")
                .clone(),
        };
        self.core.register_route(consumer_id, route);

        let handle = match registry().allocate(
            Handled::Consumer(consumer.clone()),
            true,
            Lifecycle::Internal,
        ) {
            Ok(handle) => handle,
            Err(e) => {
                self.core.unregister_route(consumer_id);
                let _ = self.core.protocol().delete_consumer(
                    self.session_id,
                    Some(consumer_id),
                    None,
                    None,
                );
                return Err(e);
            }
        };
        self.consumers
            .lock()
            .insert(consumer_id, (handle, consumer.clone()));
        Ok(consumer)
    }

    /// Closes `consumer`: stops routing, wakes blocked receivers, and
    /// deregisters it from the broker. The durable subscription, if any,
    /// survives (see [`Session::unsubscribe_durable`]).
    pub fn close_consumer(&self, consumer: &Arc<MessageConsumer>) -> MqResult<()> {
        let _guard = self.mutex.lock_guard(Wait::NoWait)?;

        let consumer_id = consumer.consumer_id();
        let (handle, consumer) = self
            .consumers
            .lock()
            .remove(&consumer_id)
            .ok_or(MqError::ConsumerNotFound)?;

        self.core.unregister_route(consumer_id);
        consumer.close_internal();

        if self.core.check_open().is_ok() {
            if let Err(e) =
                self.core
                    .protocol()
                    .delete_consumer(self.session_id, Some(consumer_id), None, None)
            {
                debug!("delete-consumer for {} failed: {}", consumer_id, e);
            }
        }
        registry().internal_delete(handle)?;
        Ok(())
    }

    /// Removes the durable subscription `name` from the broker. Fails
    /// while any consumer on this connection is still attached to it.
    pub fn unsubscribe_durable(&self, name: &str) -> MqResult<()> {
        let _guard = self.mutex.lock_guard(Wait::NoWait)?;
        self.check_open()?;

        let connection = self.connection.upgrade().ok_or(MqError::ConnectionClosed)?;
        if connection.has_active_durable(name) {
            return Err(MqError::CannotUnsubscribeActiveConsumer);
        }
        let client_id = self.core.client_id();
        self.core.protocol().delete_consumer(
            self.session_id,
            None,
            Some(name),
            client_id.as_deref(),
        )
    }

    /// True while a live consumer on this session uses the durable
    /// subscription `name`.
    pub(crate) fn has_active_durable(&self, name: &str) -> bool {
        self.consumers.lock().values().any(|(_, consumer)| {
            consumer.is_durable()
                && !consumer.is_closed()
                && consumer.subscription_name() == Some(name)
        })
    }

    // --- destinations ---

    /// Creates (or attaches to) the named destination on the broker.
    pub fn create_destination(
        &self,
        name: &str,
        kind: DestinationKind,
    ) -> MqResult<Arc<Destination>> {
        let _guard = self.mutex.lock_guard(Wait::NoWait)?;
        self.check_open()?;

        let destination = Destination::new(name, kind, false);
        self.core
            .protocol()
            .create_destination(name, destination.dest_type_bits())?;
        self.track_destination(destination)
    }

    /// Creates a connection-scoped temporary destination with a unique
    /// broker-enforced name.
    pub fn create_temporary_destination(
        &self,
        kind: DestinationKind,
    ) -> MqResult<Arc<Destination>> {
        let _guard = self.mutex.lock_guard(Wait::NoWait)?;
        self.check_open()?;

        let name = self
            .core
            .next_temp_destination_name(kind == DestinationKind::Queue);
        let destination = Destination::new(&name, kind, true);
        self.core
            .protocol()
            .create_destination(&name, destination.dest_type_bits())?;

        self.core.track_temp_destination(destination.clone());
        self.track_destination(destination)
    }

    fn track_destination(&self, destination: Destination) -> MqResult<Arc<Destination>> {
        let destination = Arc::new(destination);
        let handle = registry().allocate(
            Handled::Destination(destination.clone()),
            true,
            Lifecycle::Internal,
        )?;
        self.core.track_destination(handle, destination.clone());
        Ok(destination)
    }

    // --- acknowledgement ---

    /// Delivery-path acknowledgement preprocessing, dispatched by ack
    /// mode. Waits for the session mutex (deliveries serialize with user
    /// operations instead of failing them).
    pub(crate) fn acknowledge(&self, message: &mut Message, _from_listener: bool) -> MqResult<()> {
        let _guard = self.mutex.lock_guard(Wait::Forever)?;
        self.check_open()?;

        let entry = AckEntry {
            consumer_id: message.consumer_id(),
            sys_message_id: message.sys_message_id(),
        };
        message.mark_ack_processed();

        match self.ack_mode {
            AckMode::Auto => self.core.protocol().acknowledge(
                self.session_id,
                0,
                ACK_TYPE_STANDARD,
                &[entry],
                true,
            ),
            AckMode::Transacted => self.core.protocol().acknowledge(
                self.session_id,
                self.transaction_id(),
                ACK_TYPE_STANDARD,
                &[entry],
                true,
            ),
            AckMode::Client => {
                self.unacked.lock().push_back(entry);
                Ok(())
            }
            AckMode::DupsOk => {
                let flush = {
                    let mut batch = self.ack_batch.lock();
                    batch.push(entry);
                    batch.len() >= self.dups_ok_limit
                        || self.delivery_queue_empty(message.consumer_id())
                };
                if flush {
                    self.flush_dups_ok_batch()
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Losses of up to one batch are acceptable in DUPS_OK, so the flush
    /// does not wait for a broker reply.
    fn flush_dups_ok_batch(&self) -> MqResult<()> {
        let batch: Vec<AckEntry> = std::mem::take(&mut *self.ack_batch.lock());
        if batch.is_empty() {
            return Ok(());
        }
        self.core
            .protocol()
            .acknowledge(self.session_id, 0, ACK_TYPE_STANDARD, &batch, false)
    }

    /// True when the queue feeding `consumer_id` has fully drained.
    fn delivery_queue_empty(&self, consumer_id: u64) -> bool {
        match self.receive_mode {
            ReceiveMode::Async => self
                .session_queue
                .as_ref()
                .map(|queue| queue.is_empty())
                .unwrap_or(true),
            ReceiveMode::Sync => self
                .get_consumer(consumer_id)
                .and_then(|consumer| consumer.receive_queue().map(|queue| queue.is_empty()))
                .unwrap_or(true),
        }
    }

    /// CLIENT-mode flush: acknowledges every unacknowledged message up to
    /// and including `message`, in delivery order.
    pub fn acknowledge_messages(&self, message: &Message) -> MqResult<()> {
        let _guard = self.mutex.lock_guard(Wait::NoWait)?;
        self.check_open()?;
        if self.ack_mode != AckMode::Client {
            return Err(MqError::SessionNotClientAckMode);
        }

        let target = message.sys_message_id();
        let prefix_len = {
            let unacked = self.unacked.lock();
            match unacked
                .iter()
                .position(|entry| entry.sys_message_id == target)
            {
                Some(index) => index + 1,
                None => return Err(MqError::UnexpectedAcknowledgement),
            }
        };
        let prefix: Vec<AckEntry> = self
            .unacked
            .lock()
            .iter()
            .take(prefix_len)
            .copied()
            .collect();

        self.core
            .protocol()
            .acknowledge(self.session_id, 0, ACK_TYPE_STANDARD, &prefix, true)?;

        let mut unacked = self.unacked.lock();
        for _ in 0..prefix_len {
            unacked.pop_front();
        }
        Ok(())
    }

    /// Acknowledges an expired message to the broker as dead, off the
    /// normal ack stream. Best effort, no reply.
    pub(crate) fn ack_expired(&self, message: &Message) -> MqResult<()> {
        let entry = AckEntry {
            consumer_id: message.consumer_id(),
            sys_message_id: message.sys_message_id(),
        };
        self.core
            .protocol()
            .acknowledge(self.session_id, 0, ACK_TYPE_DEAD, &[entry], false)
    }

    /// Flow-control hook: one prefetched message left the session.
    pub(crate) fn message_delivered(&self) {
        self.core.message_delivered();
    }

    /// Ids currently awaiting a CLIENT acknowledgement, oldest first.
    pub fn unacked_message_ids(&self) -> Vec<AckEntry> {
        self.unacked.lock().iter().copied().collect()
    }

    // --- recover / transactions ---

    /// Restarts delivery of every unconsumed message, flagged
    /// redelivered. Messages already handed to the application cannot be
    /// reclaimed.
    pub fn recover(&self) -> MqResult<()> {
        let _guard = self.mutex.lock_guard(Wait::NoWait)?;
        self.check_open()?;
        if self.is_transacted() {
            return Err(MqError::TransactedSession);
        }
        self.recover_locked()
    }

    fn recover_locked(&self) -> MqResult<()> {
        // Everything delivered but unacknowledged goes back to the
        // broker for redelivery: the CLIENT unacked queue plus any
        // unflushed DUPS_OK batch.
        let mut entries: Vec<AckEntry> = self.unacked.lock().drain(..).collect();
        entries.extend(self.ack_batch.lock().drain(..));
        self.core
            .protocol()
            .redeliver(self.session_id, true, &entries)?;

        // Prefetched-but-undelivered messages stay local; they are simply
        // replayed with the redelivered flag.
        for (_, consumer) in self.consumers.lock().values() {
            if let Some(queue) = consumer.receive_queue() {
                queue.mark_all_redelivered();
            }
        }
        if let Some(queue) = &self.session_queue {
            queue.mark_all_redelivered();
        }
        Ok(())
    }

    /// Commits the open transaction and rotates to a fresh one.
    pub fn commit(&self) -> MqResult<()> {
        let _guard = self.mutex.lock_guard(Wait::NoWait)?;
        self.check_open()?;
        if !self.is_transacted() {
            return Err(MqError::NotTransactedSession);
        }
        if self.is_xa() {
            // Completion of an XA transaction belongs to the coordinator.
            return Err(MqError::TransactedSession);
        }

        self.core
            .protocol()
            .commit_transaction(self.transaction_id())?;
        let next = self.core.protocol().start_transaction(self.session_id)?;
        self.transaction_id.store(next, Ordering::Release);
        Ok(())
    }

    /// Rolls the open transaction back, redelivers, and rotates to a
    /// fresh transaction.
    pub fn rollback(&self) -> MqResult<()> {
        let _guard = self.mutex.lock_guard(Wait::NoWait)?;
        self.check_open()?;
        if !self.is_transacted() {
            return Err(MqError::NotTransactedSession);
        }
        if self.is_xa() {
            return Err(MqError::TransactedSession);
        }

        self.core
            .protocol()
            .rollback_transaction(self.transaction_id())?;
        self.recover_locked()?;
        let next = self.core.protocol().start_transaction(self.session_id)?;
        self.transaction_id.store(next, Ordering::Release);
        Ok(())
    }

    // --- start / stop / close ---

    /// Resumes local delivery. Driven by the connection's start.
    pub(crate) fn start_local(&self) {
        self.stopped.store(false, Ordering::Release);
        for (_, consumer) in self.consumers.lock().values() {
            consumer.start();
        }
        if let Some(queue) = &self.session_queue {
            queue.start();
        }
    }

    /// Pauses local delivery. Driven by the connection's stop.
    pub(crate) fn stop_local(&self) {
        self.stopped.store(true, Ordering::Release);
        for (_, consumer) in self.consumers.lock().values() {
            consumer.stop();
        }
        if let Some(queue) = &self.session_queue {
            queue.stop();
        }
    }

    /// Closes the session and everything it owns, leaf first: consumers
    /// (waking blocked receivers), the dispatch thread, then producers.
    /// Idempotent; callable from any thread.
    pub fn close(&self) -> MqResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let connection_open = self.core.check_open().is_ok();

        // Consumers first: stop routing, wake receivers.
        let consumers: Vec<(Handle, Arc<MessageConsumer>)> =
            self.consumers.lock().drain().map(|(_, v)| v).collect();
        for (handle, consumer) in consumers {
            let consumer_id = consumer.consumer_id();
            self.core.unregister_route(consumer_id);
            consumer.close_internal();
            if connection_open {
                if let Err(e) = self.core.protocol().delete_consumer(
                    self.session_id,
                    Some(consumer_id),
                    None,
                    None,
                ) {
                    debug!("delete-consumer for {} failed: {}", consumer_id, e);
                }
            }
            let _ = registry().internal_delete(handle);
        }

        // Dispatch thread drains out once its queue closes.
        if let Some(queue) = &self.session_queue {
            queue.close(true);
        }
        if let Some(thread) = self.dispatch_thread.lock().take() {
            let _ = thread.join();
        }

        let producers: Vec<(Handle, Arc<MessageProducer>)> =
            std::mem::take(&mut *self.producers.lock());
        for (handle, producer) in producers {
            producer.close_internal();
            for producer_id in producer.validated_producer_ids() {
                self.unregister_producer(producer_id);
            }
            let _ = registry().internal_delete(handle);
        }

        if connection_open {
            // An open local transaction dies with the session.
            if self.is_transacted() && !self.is_xa() {
                if let Err(e) = self
                    .core
                    .protocol()
                    .rollback_transaction(self.transaction_id())
                {
                    warn!("rollback on session close failed: {}", e);
                }
            }
            if let Err(e) = self.core.protocol().destroy_session(self.session_id) {
                debug!("destroy-session {} failed: {}", self.session_id, e);
            }
        }
        Ok(())
    }
}

/// Body of the per-session dispatch thread: pulls from the session-wide
/// queue, resolves the target consumer, and runs its listener. Exits when
/// the queue closes.
fn run_dispatch(session: Arc<Session>) {
    let queue = session
        .session_queue()
        .expect("dispatch thread requires a session queue")
        .clone();
    loop {
        match queue.dequeue_wait(Wait::Forever) {
            Some(packet) => {
                let consumer_id = packet.consumer_id;
                match session.get_consumer(consumer_id) {
                    Some(consumer) => {
                        if let Err(e) = consumer.on_message(packet) {
                            warn!(
                                "async delivery to consumer {} failed: {}",
                                consumer_id, e
                            );
                        }
                    }
                    None => {
                        debug!("dropping message for unknown consumer {}", consumer_id);
                    }
                }
                session.message_delivered();
                queue.receive_done();
            }
            None => {
                if queue.is_closed() {
                    break;
                }
            }
        }
    }
}
