mod common;

use anyhow::Result;
use common::TestBroker;
use openmq_client::packet::ACK_TYPE_DEAD;
use openmq_client::{AckMode, DestinationKind, MqError, ReceiveMode};
use std::time::{Duration, Instant};

/// One delivered message comes back through a blocking receive and is
/// auto-acknowledged.
#[test]
fn receive_and_auto_ack() -> Result<()> {
    let (broker, connection) = TestBroker::start_connected();
    let session = connection.create_session(false, AckMode::Auto, ReceiveMode::Sync)?;
    let dest = session.create_destination("orders", DestinationKind::Queue)?;
    let consumer = session.create_consumer(&dest, None)?;
    connection.start()?;

    let delivered = broker.deliver_text(consumer.consumer_id(), "hello");
    let message = consumer.receive_with_timeout(Duration::from_secs(2))?;

    assert_eq!(message.text()?, "hello");
    assert_eq!(message.sys_message_id(), delivered);
    assert_eq!(consumer.last_delivered_sys_message_id(), Some(delivered));

    // AUTO: exactly one single-entry block, flushed synchronously.
    let acks = broker.state.acks.lock().unwrap();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].entries.len(), 1);
    assert_eq!(acks[0].entries[0].sys_message_id, delivered);
    Ok(())
}

/// Messages delivered to one consumer come out in broker order.
#[test]
fn receive_preserves_fifo_order() -> Result<()> {
    let (broker, connection) = TestBroker::start_connected();
    let session = connection.create_session(false, AckMode::Auto, ReceiveMode::Sync)?;
    let dest = session.create_destination("orders", DestinationKind::Queue)?;
    let consumer = session.create_consumer(&dest, None)?;
    connection.start()?;

    let ids: Vec<_> = (0..5)
        .map(|i| broker.deliver_text(consumer.consumer_id(), &format!("m{}", i)))
        .collect();

    for (i, expected) in ids.iter().enumerate() {
        let message = consumer.receive_with_timeout(Duration::from_secs(2))?;
        assert_eq!(message.sys_message_id(), *expected);
        assert_eq!(message.text()?, format!("m{}", i));
    }
    Ok(())
}

/// A timed receive on an empty queue expires only after the full
/// interval.
#[test]
fn receive_timeout_covers_full_interval() -> Result<()> {
    let (_broker, connection) = TestBroker::start_connected();
    let session = connection.create_session(false, AckMode::Auto, ReceiveMode::Sync)?;
    let dest = session.create_destination("orders", DestinationKind::Queue)?;
    let consumer = session.create_consumer(&dest, None)?;
    connection.start()?;

    let started = Instant::now();
    let result = consumer.receive_with_timeout(Duration::from_millis(100));
    assert!(matches!(result, Err(MqError::TimeoutExpired)));
    assert!(started.elapsed() >= Duration::from_millis(100));

    assert!(matches!(
        consumer.receive_no_wait(),
        Err(MqError::NoMessage)
    ));
    Ok(())
}

/// Closing the consumer wakes a blocked receiver with ConsumerClosed
/// within a bounded delay.
#[test]
fn close_wakes_blocked_receiver() -> Result<()> {
    let (_broker, connection) = TestBroker::start_connected();
    let session = connection.create_session(false, AckMode::Auto, ReceiveMode::Sync)?;
    let dest = session.create_destination("orders", DestinationKind::Queue)?;
    let consumer = session.create_consumer(&dest, None)?;
    connection.start()?;

    let receiver = {
        let consumer = consumer.clone();
        std::thread::spawn(move || consumer.receive())
    };
    std::thread::sleep(Duration::from_millis(50));

    let closed_at = Instant::now();
    session.close_consumer(&consumer)?;
    let result = receiver.join().unwrap();

    assert!(matches!(result, Err(MqError::ConsumerClosed)));
    assert!(closed_at.elapsed() < Duration::from_secs(1));
    Ok(())
}

/// Expired messages are acknowledged as dead and never surface; the next
/// live message does.
#[test]
fn expired_messages_are_skipped_and_acked_dead() -> Result<()> {
    let (broker, connection) = TestBroker::start_connected();
    let session = connection.create_session(false, AckMode::Auto, ReceiveMode::Sync)?;
    let dest = session.create_destination("orders", DestinationKind::Queue)?;
    let consumer = session.create_consumer(&dest, None)?;
    connection.start()?;

    let expired = broker.deliver_expired(consumer.consumer_id(), "stale");
    let live = broker.deliver_text(consumer.consumer_id(), "fresh");

    let message = consumer.receive_with_timeout(Duration::from_secs(2))?;
    assert_eq!(message.sys_message_id(), live);
    assert_eq!(message.text()?, "fresh");

    broker.wait_until("dead ack", || {
        broker
            .state
            .acks
            .lock()
            .unwrap()
            .iter()
            .any(|ack| ack.ack_type == ACK_TYPE_DEAD)
    });
    let acks = broker.state.acks.lock().unwrap();
    let dead: Vec<_> = acks.iter().filter(|a| a.ack_type == ACK_TYPE_DEAD).collect();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].entries[0].sys_message_id, expired);
    Ok(())
}

/// The dead message queue consumer sees expired messages as ordinary
/// messages.
#[test]
fn dmq_consumer_receives_expired_messages() -> Result<()> {
    let (broker, connection) = TestBroker::start_connected();
    let session = connection.create_session(false, AckMode::Auto, ReceiveMode::Sync)?;
    let dest = session.create_destination("mq.sys.dmq", DestinationKind::Queue)?;
    let consumer = session.create_consumer(&dest, None)?;
    connection.start()?;

    let expired = broker.deliver_expired(consumer.consumer_id(), "stale");
    let message = consumer.receive_with_timeout(Duration::from_secs(2))?;
    assert_eq!(message.sys_message_id(), expired);
    Ok(())
}

/// The arrival observer fires when a message lands in the queue.
#[test]
fn message_arrived_callback_fires() -> Result<()> {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    let (broker, connection) = TestBroker::start_connected();
    let session = connection.create_session(false, AckMode::Auto, ReceiveMode::Sync)?;
    let dest = session.create_destination("orders", DestinationKind::Queue)?;
    let consumer = session.create_consumer(&dest, None)?;

    let arrived = Arc::new(AtomicU32::new(0));
    {
        let arrived = arrived.clone();
        consumer.set_message_arrived_callback(Box::new(move || {
            arrived.fetch_add(1, Ordering::SeqCst);
        }))?;
    }
    connection.start()?;

    broker.deliver_text(consumer.consumer_id(), "ping");
    broker.wait_until("arrival callback", || arrived.load(Ordering::SeqCst) == 1);

    consumer.receive_with_timeout(Duration::from_secs(2))?;
    Ok(())
}
