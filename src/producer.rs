//! # Message Producer
//!
//! Sending endpoint on a session, optionally bound to one destination at
//! creation. An unbound producer may send to any destination; either way,
//! each destination is validated with the broker once, via the
//! add-producer exchange that also grants the send-window credit, and
//! the issued producer id is cached per destination name.

use crate::destination::Destination;
use crate::error::{MqError, MqResult};
use crate::message::{DeliveryMode, Message, MAX_PRIORITY};
use crate::session::Session;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Weak;

/// Default time-to-live: messages never expire.
pub const DEFAULT_TIME_TO_LIVE_MS: i64 = 0;
/// Default delivery delay: immediate.
pub const DEFAULT_DELIVERY_DELAY_MS: i64 = 0;

/// Per-send overrides for the `send_ext` flavors.
#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    pub delivery_mode: DeliveryMode,
    /// Validated, not clamped: an out-of-range send fails.
    pub priority: i32,
    pub time_to_live_ms: i64,
}

/// A producer endpoint. Created via the session's `create_producer`
/// methods, never directly.
pub struct MessageProducer {
    session: Weak<Session>,
    destination: Option<Destination>,

    /// Maps destination name to the broker-issued producer id.
    validated: Mutex<HashMap<String, u64>>,

    delivery_mode: Mutex<DeliveryMode>,
    priority: Mutex<u8>,
    time_to_live_ms: AtomicI64,
    delivery_delay_ms: AtomicI64,

    closed: AtomicBool,
}

impl MessageProducer {
    pub(crate) fn new(session: Weak<Session>, destination: Option<Destination>) -> Self {
        Self {
            session,
            destination,
            validated: Mutex::new(HashMap::new()),
            delivery_mode: Mutex::new(DeliveryMode::NonPersistent),
            priority: Mutex::new(crate::message::DEFAULT_PRIORITY),
            time_to_live_ms: AtomicI64::new(DEFAULT_TIME_TO_LIVE_MS),
            delivery_delay_ms: AtomicI64::new(DEFAULT_DELIVERY_DELAY_MS),
            closed: AtomicBool::new(false),
        }
    }

    // --- delivery defaults ---

    pub fn delivery_mode(&self) -> DeliveryMode {
        *self.delivery_mode.lock()
    }

    pub fn set_delivery_mode(&self, mode: DeliveryMode) {
        *self.delivery_mode.lock() = mode;
    }

    pub fn priority(&self) -> u8 {
        *self.priority.lock()
    }

    /// Sets the default priority, clamped into `0..=9`.
    pub fn set_priority(&self, priority: i32) {
        let clamped = priority.clamp(0, MAX_PRIORITY as i32) as u8;
        *self.priority.lock() = clamped;
    }

    pub fn time_to_live_ms(&self) -> i64 {
        self.time_to_live_ms.load(Ordering::Acquire)
    }

    pub fn set_time_to_live_ms(&self, millis: i64) {
        self.time_to_live_ms.store(millis, Ordering::Release);
    }

    pub fn delivery_delay_ms(&self) -> i64 {
        self.delivery_delay_ms.load(Ordering::Acquire)
    }

    pub fn set_delivery_delay_ms(&self, millis: i64) {
        self.delivery_delay_ms.store(millis, Ordering::Release);
    }

    pub fn destination(&self) -> Option<&Destination> {
        self.destination.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // --- send flavors ---

    /// Sends with the producer's delivery defaults to the bound
    /// destination.
    pub fn send(&self, message: &mut Message) -> MqResult<()> {
        let destination = self
            .destination
            .as_ref()
            .ok_or(MqError::ProducerNoDestination)?
            .clone();
        self.write(message, &destination, None)
    }

    /// Sends to an explicit destination; only valid on unbound producers.
    pub fn send_to(&self, message: &mut Message, destination: &Destination) -> MqResult<()> {
        if self.destination.is_some() {
            return Err(MqError::ProducerHasDestination);
        }
        self.write(message, destination, None)
    }

    /// Sends to the bound destination with per-send overrides.
    pub fn send_ext(&self, message: &mut Message, options: SendOptions) -> MqResult<()> {
        let destination = self
            .destination
            .as_ref()
            .ok_or(MqError::ProducerNoDestination)?
            .clone();
        self.write(message, &destination, Some(options))
    }

    /// Sends to an explicit destination with per-send overrides; only
    /// valid on unbound producers.
    pub fn send_to_ext(
        &self,
        message: &mut Message,
        destination: &Destination,
        options: SendOptions,
    ) -> MqResult<()> {
        if self.destination.is_some() {
            return Err(MqError::ProducerHasDestination);
        }
        self.write(message, destination, Some(options))
    }

    fn write(
        &self,
        message: &mut Message,
        destination: &Destination,
        options: Option<SendOptions>,
    ) -> MqResult<()> {
        if self.is_closed() {
            return Err(MqError::ProducerClosed);
        }
        let session = self.session.upgrade().ok_or(MqError::SessionClosed)?;

        // Per-send overrides are validated; producer defaults were
        // clamped when set.
        let (delivery_mode, priority, time_to_live) = match options {
            Some(options) => {
                if options.priority < 0 || options.priority > MAX_PRIORITY as i32 {
                    return Err(MqError::InvalidPriority);
                }
                (
                    options.delivery_mode,
                    options.priority as u8,
                    options.time_to_live_ms,
                )
            }
            None => (self.delivery_mode(), self.priority(), self.time_to_live_ms()),
        };

        let producer_id = self.validate_destination(&session, destination)?;

        message.set_delivery_mode(delivery_mode);
        message.set_priority(priority)?;

        session.write_jms_message(
            message,
            destination,
            producer_id,
            time_to_live,
            self.delivery_delay_ms(),
        )
    }

    /// Resolves the broker producer id for `destination`, registering it
    /// on first use and caching the id afterwards.
    fn validate_destination(
        &self,
        session: &std::sync::Arc<Session>,
        destination: &Destination,
    ) -> MqResult<u64> {
        let name = destination.name()?.to_string();
        if let Some(id) = self.validated.lock().get(&name) {
            return Ok(*id);
        }

        let id = session.register_producer(destination)?;

        let mut validated = self.validated.lock();
        if self.is_closed() {
            // Lost the race with close; undo the registration ourselves,
            // it never made it into the validated map.
            session.unregister_producer(id);
            return Err(MqError::ProducerClosed);
        }
        validated.insert(name, id);
        Ok(id)
    }

    /// Ids issued to this producer, for the session's close path.
    pub(crate) fn validated_producer_ids(&self) -> Vec<u64> {
        self.validated.lock().values().copied().collect()
    }

    /// Records a destination validated eagerly at creation time.
    pub(crate) fn seed_validated(&self, name: String, id: u64) {
        self.validated.lock().insert(name, id);
    }

    pub(crate) fn close_internal(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_priority_is_clamped_not_rejected() {
        let producer = MessageProducer::new(Weak::new(), None);
        producer.set_priority(42);
        assert_eq!(producer.priority(), 9);
        producer.set_priority(-3);
        assert_eq!(producer.priority(), 0);
        producer.set_priority(5);
        assert_eq!(producer.priority(), 5);
    }

    #[test]
    fn test_send_without_destination_is_rejected() {
        let producer = MessageProducer::new(Weak::new(), None);
        let mut message = Message::new_text();
        assert_eq!(producer.send(&mut message), Err(MqError::ProducerNoDestination));
    }

    #[test]
    fn test_bound_producer_rejects_explicit_destination() {
        use crate::destination::DestinationKind;
        let bound = Destination::new("orders", DestinationKind::Queue, false);
        let producer = MessageProducer::new(Weak::new(), Some(bound.clone()));
        let mut message = Message::new_text();
        assert_eq!(
            producer.send_to(&mut message, &bound),
            Err(MqError::ProducerHasDestination)
        );
    }

    #[test]
    fn test_delivery_defaults() {
        let producer = MessageProducer::new(Weak::new(), None);
        assert_eq!(producer.delivery_mode(), DeliveryMode::NonPersistent);
        assert_eq!(producer.time_to_live_ms(), DEFAULT_TIME_TO_LIVE_MS);
        assert_eq!(producer.delivery_delay_ms(), DEFAULT_DELIVERY_DELAY_MS);

        producer.set_delivery_mode(DeliveryMode::Persistent);
        producer.set_time_to_live_ms(30_000);
        producer.set_delivery_delay_ms(1_000);
        assert_eq!(producer.delivery_mode(), DeliveryMode::Persistent);
        assert_eq!(producer.time_to_live_ms(), 30_000);
        assert_eq!(producer.delivery_delay_ms(), 1_000);
    }
}
