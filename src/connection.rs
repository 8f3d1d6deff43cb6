//! # Connection
//!
//! Owns the transport, the protocol handshake, the background read
//! channel, and the set of sessions. The read channel is the only thread
//! that reads the transport; it demultiplexes every inbound packet by
//! type family:
//!
//! ```text
//!   JMS message types ──▶ target consumer's receive queue
//!                         (or the session-wide queue, async sessions)
//!   RESUME_FLOW       ──▶ the producer flow for the carried producer id
//!   FLOW_PAUSED       ──▶ consumer-side flow bookkeeping
//!   reply types       ──▶ the pending protocol request they correlate to
//!   ERROR / GOODBYE / ──▶ connection failure: close everything, wake
//!   dead transport        every waiter, run the exception listener once
//! ```
//!
//! A transport-level failure closes the connection exactly once: pending
//! requests fail with [`MqError::BrokerConnectionClosed`], blocked
//! receivers wake with their queues closed, producer flows release their
//! senders, and the user exception listener runs on a short-lived thread
//! so the read loop never blocks on user code.

use crate::config::ConnectionConfig;
use crate::destination::Destination;
use crate::error::{MqError, MqResult};
use crate::handle::{registry, Handle, Handled, Lifecycle};
use crate::packet::{Packet, PacketType, JMQ_PRODUCT, JMQ_VERSION, PROTOCOL_VERSION};
use crate::producer_flow::ProducerFlow;
use crate::properties::Properties;
use crate::protocol::ProtocolHandler;
use crate::receive_queue::ReceiveQueue;
use crate::session::{AckMode, ReceiveMode, Session, XaCallbacks};
use crate::transport::{self, Transport};
use chrono::{DateTime, Utc};
use crossbeam::channel::{bounded, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Callback invoked (exactly once, on a dedicated thread) when the
/// connection fails underneath the application.
pub type ExceptionListener = Box<dyn Fn(&MqError) + Send + Sync>;

/// Descriptive information about an open connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetadata {
    pub library_version: String,
    pub protocol_version: i32,
    pub broker_product: Option<String>,
    pub broker_version: Option<String>,
    pub connected_at: DateTime<Utc>,
}

struct ConsumerFlowState {
    paused: bool,
    /// Messages pushed by the broker and not yet consumed.
    unconsumed: i64,
}

/// State shared between the connection, its sessions, and the read
/// channel. Sessions hold this directly so the hot paths never reach
/// back through the public `Connection`.
pub(crate) struct ConnectionCore {
    config: ConnectionConfig,
    protocol: ProtocolHandler,
    /// Per-connection uid embedded in the temporary-destination namespace.
    uid: String,
    client_id: Mutex<Option<String>>,
    close_reason: Mutex<Option<MqError>>,

    /// Maps consumer id to its delivery queue.
    routes: Mutex<HashMap<u64, Arc<ReceiveQueue>>>,
    /// Maps producer id to its send-window accounting.
    flows: Mutex<HashMap<u64, Arc<ProducerFlow>>>,
    consumer_flow: Mutex<ConsumerFlowState>,

    temp_destination_seq: AtomicU64,
    temp_destinations: Mutex<Vec<Destination>>,
    destinations: Mutex<Vec<(Handle, Arc<Destination>)>>,

    exception_listener: Mutex<Option<ExceptionListener>>,
    exception_fired: AtomicBool,
}

impl ConnectionCore {
    pub(crate) fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub(crate) fn protocol(&self) -> &ProtocolHandler {
        &self.protocol
    }

    pub(crate) fn client_id(&self) -> Option<String> {
        self.client_id.lock().clone()
    }

    pub(crate) fn check_open(&self) -> MqResult<()> {
        match &*self.close_reason.lock() {
            Some(reason) => Err(reason.clone()),
            None => Ok(()),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.close_reason.lock().is_some()
    }

    // --- temporary destination namespace ---

    fn temp_destination_prefix(&self, is_queue: bool) -> String {
        let kind = if is_queue { "queue" } else { "topic" };
        format!("temporary_destination://{}/{}/", kind, self.uid)
    }

    pub(crate) fn next_temp_destination_name(&self, is_queue: bool) -> String {
        let seq = self.temp_destination_seq.fetch_add(1, Ordering::Relaxed);
        format!("{}{}", self.temp_destination_prefix(is_queue), seq)
    }

    /// True when `name` lives in this connection's temporary namespace.
    pub(crate) fn owns_temp_destination(&self, name: &str) -> bool {
        name.starts_with(&self.temp_destination_prefix(true))
            || name.starts_with(&self.temp_destination_prefix(false))
    }

    pub(crate) fn track_temp_destination(&self, destination: Destination) {
        self.temp_destinations.lock().push(destination);
    }

    pub(crate) fn remove_temp_destination(&self, name: &str) {
        self.temp_destinations
            .lock()
            .retain(|dest| dest.name().map(|n| n != name).unwrap_or(true));
    }

    pub(crate) fn track_destination(&self, handle: Handle, destination: Arc<Destination>) {
        self.destinations.lock().push((handle, destination));
    }

    // --- delivery routing ---

    pub(crate) fn register_route(&self, consumer_id: u64, queue: Arc<ReceiveQueue>) {
        self.routes.lock().insert(consumer_id, queue);
    }

    pub(crate) fn unregister_route(&self, consumer_id: u64) {
        self.routes.lock().remove(&consumer_id);
    }

    fn deliver_message(&self, packet: Packet) {
        let consumer_id = packet.consumer_id;
        let queue = self.routes.lock().get(&consumer_id).cloned();
        match queue {
            Some(queue) => {
                {
                    let mut flow = self.consumer_flow.lock();
                    flow.unconsumed += 1;
                }
                queue.enqueue(packet);
            }
            None => {
                debug!("no consumer registered for id {}, dropping", consumer_id);
            }
        }
    }

    // --- producer flow table ---

    pub(crate) fn register_flow(&self, producer_id: u64, chunk_bytes: i64, chunk_size: i32) {
        self.flows.lock().insert(
            producer_id,
            Arc::new(ProducerFlow::new(producer_id, chunk_bytes, chunk_size)),
        );
    }

    /// Takes a sender reference on the flow for `producer_id`.
    pub(crate) fn acquire_flow(&self, producer_id: u64) -> MqResult<Arc<ProducerFlow>> {
        let flow = self
            .flows
            .lock()
            .get(&producer_id)
            .cloned()
            .ok_or(MqError::ProducerClosed)?;
        flow.acquire_reference()?;
        Ok(flow)
    }

    /// Returns a sender reference, freeing the flow once it is closed and
    /// unreferenced.
    pub(crate) fn release_flow(&self, producer_id: u64) {
        let mut flows = self.flows.lock();
        if let Some(flow) = flows.get(&producer_id) {
            if flow.release_reference() {
                flows.remove(&producer_id);
            }
        }
    }

    /// Closes the flow for `producer_id`, waking blocked senders; the
    /// entry is freed now if unreferenced, or by the last release.
    pub(crate) fn close_flow(&self, producer_id: u64, reason: MqError) {
        let flow = self.flows.lock().get(&producer_id).cloned();
        if let Some(flow) = flow {
            flow.close(reason);
        }
    }

    // --- consumer-side flow control ---

    fn pause_consumer_flow(&self) {
        self.consumer_flow.lock().paused = true;
        debug!("broker paused consumer flow");
    }

    /// One prefetched message was consumed. When the broker has paused
    /// the flow and the backlog drains below the threshold, ask it to
    /// resume with a fresh prefetch window.
    pub(crate) fn message_delivered(&self) {
        let resume = {
            let mut flow = self.consumer_flow.lock();
            if flow.unconsumed > 0 {
                flow.unconsumed -= 1;
            }
            if flow.paused && flow.unconsumed <= self.config.prefetch_resume_watermark() {
                flow.paused = false;
                true
            } else {
                false
            }
        };
        if resume {
            if let Err(e) = self
                .protocol
                .resume_consumer_flow(self.config.prefetch_max_msg_count)
            {
                warn!("resume-flow request failed: {}", e);
            }
        }
    }

    // --- failure and shutdown ---

    pub(crate) fn set_exception_listener(&self, listener: Option<ExceptionListener>) {
        *self.exception_listener.lock() = listener;
    }

    /// Tears the shared state down exactly once: pending requests fail,
    /// delivery queues close (waking blocked receivers), producer flows
    /// release their senders, and the transport dies. `failure` selects
    /// whether the exception listener fires.
    pub(crate) fn shutdown(self: &Arc<Self>, reason: MqError, failure: bool) {
        {
            let mut close_reason = self.close_reason.lock();
            if close_reason.is_some() {
                return;
            }
            *close_reason = Some(reason.clone());
        }
        self.protocol.close(reason.clone());
        let _ = self.protocol.transport().shutdown();

        for (_, queue) in self.routes.lock().drain() {
            queue.close(false);
        }
        for (_, flow) in self.flows.lock().drain() {
            flow.close(reason.clone());
        }

        if failure && !self.exception_fired.swap(true, Ordering::AcqRel) {
            // Posted to its own thread so the read loop (or whichever
            // thread noticed the failure) never blocks on user code.
            let core = self.clone();
            let spawned = thread::Builder::new()
                .name("mq-exception-listener".to_string())
                .spawn(move || {
                    if let Some(listener) = &*core.exception_listener.lock() {
                        listener(&reason);
                    }
                });
            if spawned.is_err() {
                warn!("could not spawn exception listener thread");
            }
        }
    }
}

/// An authenticated connection to the broker. Created with
/// [`Connection::open`]; delivery starts only after [`Connection::start`].
pub struct Connection {
    core: Arc<ConnectionCore>,
    sessions: Mutex<Vec<(Handle, Arc<Session>)>>,
    read_thread: Mutex<Option<JoinHandle<()>>>,
    ping_stop: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
    metadata: ConnectionMetadata,
    stopped: AtomicBool,
    closed: AtomicBool,
    handle: OnceLock<Handle>,
}

impl Connection {
    /// Opens, handshakes, and authenticates a connection using the
    /// transport selected by `config`.
    pub fn open(
        config: ConnectionConfig,
        user: &str,
        password: &str,
        client_id: Option<&str>,
        exception_listener: Option<ExceptionListener>,
    ) -> MqResult<Arc<Connection>> {
        let mut attempt = 0;
        let transport = loop {
            match transport::connect(&config) {
                Ok(transport) => break transport,
                Err(e) if attempt < config.reconnect_attempts => {
                    attempt += 1;
                    debug!(
                        "connect to {}:{} failed ({}), attempt {} of {}",
                        config.host, config.port, e, attempt, config.reconnect_attempts
                    );
                }
                Err(e) => return Err(e),
            }
        };
        Self::open_with_transport(transport, config, user, password, client_id, exception_listener)
    }

    /// Like [`Connection::open`] over an already-connected transport.
    /// This is how embedded brokers and the test suite hook in.
    pub fn open_with_transport(
        transport: Box<dyn Transport>,
        config: ConnectionConfig,
        user: &str,
        password: &str,
        client_id: Option<&str>,
        exception_listener: Option<ExceptionListener>,
    ) -> MqResult<Arc<Connection>> {
        let transport: Arc<dyn Transport> = Arc::from(transport);
        let protocol = ProtocolHandler::new(transport, config.request_timeout);

        let core = Arc::new(ConnectionCore {
            config,
            protocol,
            uid: Uuid::new_v4().simple().to_string(),
            client_id: Mutex::new(None),
            close_reason: Mutex::new(None),
            routes: Mutex::new(HashMap::new()),
            flows: Mutex::new(HashMap::new()),
            consumer_flow: Mutex::new(ConsumerFlowState {
                paused: false,
                unconsumed: 0,
            }),
            temp_destination_seq: AtomicU64::new(0),
            temp_destinations: Mutex::new(Vec::new()),
            destinations: Mutex::new(Vec::new()),
            exception_listener: Mutex::new(None),
            exception_fired: AtomicBool::new(false),
        });
        core.set_exception_listener(exception_listener);

        // The read channel must run before the handshake so replies find
        // their waiters.
        let read_thread = {
            let core = core.clone();
            thread::Builder::new()
                .name("mq-read-channel".to_string())
                .spawn(move || run_read_channel(core))
                .map_err(|_| MqError::Internal)?
        };

        let handshake: MqResult<Properties> = (|| {
            let broker_info = core.protocol().hello()?;
            core.protocol().authenticate(user, password)?;
            if let Some(id) = client_id {
                core.protocol().set_client_id(id)?;
                *core.client_id.lock() = Some(id.to_string());
            }
            Ok(broker_info)
        })();

        let broker_info = match handshake {
            Ok(info) => info,
            Err(e) => {
                core.shutdown(e.clone(), false);
                let _ = read_thread.join();
                return Err(e);
            }
        };

        let metadata = ConnectionMetadata {
            library_version: crate::VERSION.to_string(),
            protocol_version: PROTOCOL_VERSION,
            broker_product: broker_info.get_string(JMQ_PRODUCT).ok(),
            broker_version: broker_info.get_string(JMQ_VERSION).ok(),
            connected_at: Utc::now(),
        };
        info!(
            "connected to {} {} at {}:{}",
            metadata.broker_product.as_deref().unwrap_or("broker"),
            metadata.broker_version.as_deref().unwrap_or("?"),
            core.config().host,
            core.config().port
        );

        let connection = Arc::new(Connection {
            core: core.clone(),
            sessions: Mutex::new(Vec::new()),
            read_thread: Mutex::new(Some(read_thread)),
            ping_stop: Mutex::new(None),
            metadata,
            // Connections begin stopped; delivery starts with start().
            stopped: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            handle: OnceLock::new(),
        });
        let handle = registry().allocate(
            Handled::Connection(connection.clone()),
            true,
            Lifecycle::Internal,
        )?;
        let _ = connection.handle.set(handle);

        if let Some(interval) = connection.core.config().ping_interval {
            connection.spawn_ping_thread(interval);
        }
        Ok(connection)
    }

    fn spawn_ping_thread(&self, interval: std::time::Duration) {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let core = self.core.clone();
        let spawned = thread::Builder::new()
            .name("mq-ping".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Ok(()) => break,
                    Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
                    Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                        if core.check_open().is_err() {
                            break;
                        }
                        if let Err(e) = core.protocol().ping() {
                            debug!("ping failed: {}", e);
                        }
                    }
                }
            });
        match spawned {
            Ok(handle) => *self.ping_stop.lock() = Some((stop_tx, handle)),
            Err(_) => warn!("could not spawn ping thread"),
        }
    }

    // --- accessors ---

    /// This connection's registry handle.
    pub fn handle(&self) -> Handle {
        self.handle.get().copied().unwrap_or_else(Handle::invalid)
    }

    pub fn client_id(&self) -> Option<String> {
        self.core.client_id()
    }

    pub fn metadata(&self) -> &ConnectionMetadata {
        &self.metadata
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.core.is_closed()
    }

    fn check_open(&self) -> MqResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MqError::ConnectionClosed);
        }
        self.core.check_open()
    }

    // --- sessions ---

    /// Creates a session. `transacted` overrides `ack_mode` to
    /// TRANSACTED, matching the JMS precedence.
    pub fn create_session(
        self: &Arc<Self>,
        transacted: bool,
        ack_mode: AckMode,
        receive_mode: ReceiveMode,
    ) -> MqResult<Arc<Session>> {
        self.check_open()?;
        let (handle, session) = Session::create(
            self,
            self.core.clone(),
            transacted,
            ack_mode,
            receive_mode,
            None,
        )?;
        self.sessions.lock().push((handle, session.clone()));
        Ok(session)
    }

    /// Creates a session whose transactions are driven by an external
    /// coordinator through the supplied hooks.
    pub fn create_xa_session(
        self: &Arc<Self>,
        receive_mode: ReceiveMode,
        callbacks: XaCallbacks,
    ) -> MqResult<Arc<Session>> {
        self.check_open()?;
        let (handle, session) = Session::create(
            self,
            self.core.clone(),
            true,
            AckMode::Transacted,
            receive_mode,
            Some(callbacks),
        )?;
        self.sessions.lock().push((handle, session.clone()));
        Ok(session)
    }

    /// True while any session holds a live consumer on the durable
    /// subscription `name`.
    pub(crate) fn has_active_durable(&self, name: &str) -> bool {
        self.sessions
            .lock()
            .iter()
            .any(|(_, session)| session.has_active_durable(name))
    }

    /// Removes the durable subscription `name` from the broker; fails
    /// while a consumer is still attached to it.
    pub fn unsubscribe_durable(&self, name: &str) -> MqResult<()> {
        self.check_open()?;
        if self.has_active_durable(name) {
            return Err(MqError::CannotUnsubscribeActiveConsumer);
        }
        let client_id = self.core.client_id();
        self.core
            .protocol()
            .delete_consumer(0, None, Some(name), client_id.as_deref())
    }

    // --- delivery control ---

    /// Starts (or restarts) inbound delivery for the whole connection.
    pub fn start(&self) -> MqResult<()> {
        self.check_open()?;
        self.core.protocol().start(None)?;
        for (_, session) in self.sessions.lock().iter() {
            session.start_local();
        }
        self.stopped.store(false, Ordering::Release);
        Ok(())
    }

    /// Pauses inbound delivery. Queued messages are retained, blocked
    /// receivers stay blocked.
    pub fn stop(&self) -> MqResult<()> {
        self.check_open()?;
        self.core.protocol().stop(None)?;
        for (_, session) in self.sessions.lock().iter() {
            session.stop_local();
        }
        self.stopped.store(true, Ordering::Release);
        Ok(())
    }

    /// One keep-alive round trip to the broker.
    pub fn ping(&self) -> MqResult<()> {
        self.check_open()?;
        self.core.protocol().ping()
    }

    // --- temporary destinations ---

    /// Deletes a temporary destination owned by this connection from the
    /// broker.
    pub fn delete_temporary_destination(&self, destination: &Destination) -> MqResult<()> {
        self.check_open()?;
        if !destination.is_temporary() {
            return Err(MqError::DestinationNotTemporary);
        }
        let name = destination.name()?;
        if !self.core.owns_temp_destination(name) {
            return Err(MqError::TemporaryDestinationNotInConnection);
        }
        self.core
            .protocol()
            .destroy_destination(name, destination.dest_type_bits())?;
        self.core.remove_temp_destination(name);
        Ok(())
    }

    // --- close ---

    /// Closes the connection and everything under it, leaf first:
    /// sessions (consumers, dispatch threads, producers), temporary
    /// destinations, then the transport. Idempotent.
    pub fn close(&self) -> MqResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some((stop_tx, handle)) = self.ping_stop.lock().take() {
            let _ = stop_tx.send(());
            let _ = handle.join();
        }

        let sessions: Vec<(Handle, Arc<Session>)> = std::mem::take(&mut *self.sessions.lock());
        for (handle, session) in sessions {
            if let Err(e) = session.close() {
                warn!("session close failed: {}", e);
            }
            let _ = registry().internal_delete(handle);
        }

        // Temporary destinations die with their connection.
        if self.core.check_open().is_ok() {
            let temps: Vec<Destination> =
                std::mem::take(&mut *self.core.temp_destinations.lock());
            for dest in temps {
                if let (Ok(name), bits) = (dest.name(), dest.dest_type_bits()) {
                    if let Err(e) = self.core.protocol().destroy_destination(name, bits) {
                        debug!("destroy of temporary destination {} failed: {}", name, e);
                    }
                }
            }
            if let Err(e) = self.core.protocol().goodbye(false) {
                debug!("goodbye failed: {}", e);
            }
        }

        let destinations: Vec<(Handle, Arc<Destination>)> =
            std::mem::take(&mut *self.core.destinations.lock());
        for (handle, _) in destinations {
            let _ = registry().internal_delete(handle);
        }

        self.core.shutdown(MqError::ConnectionClosed, false);
        if let Some(read_thread) = self.read_thread.lock().take() {
            let _ = read_thread.join();
        }

        if let Some(handle) = self.handle.get() {
            let _ = registry().internal_delete(*handle);
        }
        Ok(())
    }
}

/// Body of the per-connection read-channel thread.
fn run_read_channel(core: Arc<ConnectionCore>) {
    loop {
        let packet = match core.protocol().transport().recv() {
            Ok(packet) => packet,
            Err(e) => {
                if !core.is_closed() {
                    warn!("broker connection lost: {}", e);
                    core.shutdown(MqError::BrokerConnectionClosed, true);
                }
                break;
            }
        };
        dispatch_packet(&core, packet);
    }
    debug!("read channel exiting");
}

fn dispatch_packet(core: &Arc<ConnectionCore>, packet: Packet) {
    let packet_type = packet.packet_type();

    if packet_type.is_jms_message() {
        core.deliver_message(packet);
        return;
    }

    match packet_type {
        PacketType::ResumeFlow => {
            let producer_id = packet.producer_id();
            let (chunk_bytes, chunk_size) = packet.flow_credit();
            let flow = core.flows.lock().get(&producer_id).cloned();
            match flow {
                Some(flow) => flow.resume_flow(chunk_bytes, chunk_size),
                None => debug!("resume-flow for unknown producer {}", producer_id),
            }
        }
        PacketType::FlowPaused => core.pause_consumer_flow(),
        PacketType::Ping => {
            // Keep-alive probe from the broker; answer in place.
            let mut reply = Packet::new(PacketType::PingReply);
            reply.consumer_id = packet.consumer_id;
            reply.set_status(200);
            let _ = core.protocol().write(&reply);
        }
        PacketType::AuthenticateRequest => {
            debug!("ignoring broker authenticate request (already authenticated)");
        }
        PacketType::Error | PacketType::Goodbye => {
            warn!("broker terminated the connection ({})", packet_type);
            core.shutdown(MqError::BrokerConnectionClosed, true);
        }
        t if t.is_reply() => core.protocol().complete(packet),
        _ => {
            warn!("read channel cannot dispatch {}", packet_type);
        }
    }
}
