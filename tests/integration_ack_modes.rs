mod common;

use anyhow::Result;
use common::TestBroker;
use openmq_client::{AckMode, ConnectionConfig, DestinationKind, MqError, ReceiveMode};
use std::time::Duration;

/// CLIENT ack covers exactly the prefix of unacknowledged messages up to
/// and including the acknowledged one.
#[test]
fn client_ack_flushes_prefix() -> Result<()> {
    let (broker, connection) = TestBroker::start_connected();
    let session = connection.create_session(false, AckMode::Client, ReceiveMode::Sync)?;
    let dest = session.create_destination("orders", DestinationKind::Queue)?;
    let consumer = session.create_consumer(&dest, None)?;
    connection.start()?;

    let ids: Vec<_> = (0..5)
        .map(|i| broker.deliver_text(consumer.consumer_id(), &format!("m{}", i)))
        .collect();
    let mut messages = Vec::new();
    for _ in 0..5 {
        messages.push(consumer.receive_with_timeout(Duration::from_secs(2))?);
    }

    // Nothing acked yet; everything delivered is pending.
    assert!(broker.state.acks.lock().unwrap().is_empty());
    assert_eq!(session.unacked_message_ids().len(), 5);

    // Acknowledge through the third message.
    session.acknowledge_messages(&messages[2])?;

    let acks = broker.state.acks.lock().unwrap();
    assert_eq!(acks.len(), 1);
    let acked: Vec<_> = acks[0].entries.iter().map(|e| e.sys_message_id).collect();
    assert_eq!(acked, ids[..3].to_vec());
    drop(acks);

    let remaining: Vec<_> = session
        .unacked_message_ids()
        .iter()
        .map(|e| e.sys_message_id)
        .collect();
    assert_eq!(remaining, ids[3..].to_vec());

    // The same message cannot be acknowledged twice.
    assert!(matches!(
        session.acknowledge_messages(&messages[2]),
        Err(MqError::UnexpectedAcknowledgement)
    ));

    // Acknowledging the tail drains the queue.
    session.acknowledge_messages(&messages[4])?;
    assert!(session.unacked_message_ids().is_empty());
    Ok(())
}

/// acknowledge_messages is a CLIENT-mode operation.
#[test]
fn acknowledge_messages_requires_client_mode() -> Result<()> {
    let (broker, connection) = TestBroker::start_connected();
    let session = connection.create_session(false, AckMode::Auto, ReceiveMode::Sync)?;
    let dest = session.create_destination("orders", DestinationKind::Queue)?;
    let consumer = session.create_consumer(&dest, None)?;
    connection.start()?;

    broker.deliver_text(consumer.consumer_id(), "m");
    let message = consumer.receive_with_timeout(Duration::from_secs(2))?;

    assert!(matches!(
        session.acknowledge_messages(&message),
        Err(MqError::SessionNotClientAckMode)
    ));
    Ok(())
}

/// DUPS_OK batches acknowledgements: flushed at the configured limit or
/// when the receive queue drains, never waiting for a reply.
#[test]
fn dups_ok_batches_and_flushes_on_drain() -> Result<()> {
    let config = ConnectionConfig {
        dups_ok_limit: 2,
        ..ConnectionConfig::default()
    };
    let (broker, connection) = TestBroker::start_connected_with(config, None, None);
    let session = connection.create_session(false, AckMode::DupsOk, ReceiveMode::Sync)?;
    let dest = session.create_destination("orders", DestinationKind::Queue)?;
    let consumer = session.create_consumer(&dest, None)?;
    connection.start()?;

    let ids: Vec<_> = (0..3)
        .map(|i| broker.deliver_text(consumer.consumer_id(), &format!("m{}", i)))
        .collect();
    for _ in 0..3 {
        consumer.receive_with_timeout(Duration::from_secs(2))?;
    }

    // All three deliveries end up acknowledged, in batches no larger
    // than the limit.
    broker.wait_until("dups-ok flushes", || {
        broker
            .state
            .acks
            .lock()
            .unwrap()
            .iter()
            .map(|a| a.entries.len())
            .sum::<usize>()
            == 3
    });
    let acks = broker.state.acks.lock().unwrap();
    assert!(acks.iter().all(|a| a.entries.len() <= 2));
    let flat: Vec<_> = acks
        .iter()
        .flat_map(|a| a.entries.iter().map(|e| e.sys_message_id))
        .collect();
    assert_eq!(flat, ids);
    Ok(())
}

/// AUTO acknowledges each delivery as its own synchronous block.
#[test]
fn auto_acks_every_delivery() -> Result<()> {
    let (broker, connection) = TestBroker::start_connected();
    let session = connection.create_session(false, AckMode::Auto, ReceiveMode::Sync)?;
    let dest = session.create_destination("orders", DestinationKind::Queue)?;
    let consumer = session.create_consumer(&dest, None)?;
    connection.start()?;

    for i in 0..3 {
        broker.deliver_text(consumer.consumer_id(), &format!("m{}", i));
        consumer.receive_with_timeout(Duration::from_secs(2))?;
    }

    let acks = broker.state.acks.lock().unwrap();
    assert_eq!(acks.len(), 3);
    assert!(acks.iter().all(|a| a.entries.len() == 1));
    Ok(())
}

/// Recover redelivers what was delivered but never acknowledged and
/// replays prefetched messages with the redelivered flag.
#[test]
fn recover_redelivers_unacked_and_prefetched() -> Result<()> {
    let (broker, connection) = TestBroker::start_connected();
    let session = connection.create_session(false, AckMode::Client, ReceiveMode::Sync)?;
    let dest = session.create_destination("orders", DestinationKind::Queue)?;
    let consumer = session.create_consumer(&dest, None)?;
    connection.start()?;

    let handed_out = broker.deliver_text(consumer.consumer_id(), "m0");
    let prefetched = broker.deliver_text(consumer.consumer_id(), "m1");

    // Take only the first; the second stays prefetched in the queue.
    let message = consumer.receive_with_timeout(Duration::from_secs(2))?;
    assert_eq!(message.sys_message_id(), handed_out);
    // Let the read channel finish enqueueing the prefetched message.
    std::thread::sleep(Duration::from_millis(50));

    session.recover()?;

    // The unacked message went back to the broker for redelivery.
    broker.wait_until("redeliver request", || {
        !broker.state.redelivers.lock().unwrap().is_empty()
    });
    let redelivers = broker.state.redelivers.lock().unwrap();
    assert_eq!(redelivers.len(), 1);
    assert!(redelivers[0].0);
    assert_eq!(redelivers[0].1[0].sys_message_id, handed_out);
    drop(redelivers);
    assert!(session.unacked_message_ids().is_empty());

    // The prefetched message replays locally, flagged redelivered.
    let replay = consumer.receive_with_timeout(Duration::from_secs(2))?;
    assert_eq!(replay.sys_message_id(), prefetched);
    assert!(replay.redelivered());
    Ok(())
}

/// Recover is illegal on a transacted session.
#[test]
fn recover_rejected_on_transacted_session() -> Result<()> {
    let (_broker, connection) = TestBroker::start_connected();
    let session = connection.create_session(true, AckMode::Auto, ReceiveMode::Sync)?;
    assert!(matches!(session.recover(), Err(MqError::TransactedSession)));
    Ok(())
}
