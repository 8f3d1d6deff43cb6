mod common;

use anyhow::Result;
use common::TestBroker;
use openmq_client::{AckMode, DestinationKind, Message, MqError, ReceiveMode};
use std::time::Duration;

/// Sends on a transacted session carry the open transaction id; commit
/// confirms it with the broker and rotates to a fresh transaction.
#[test]
fn transacted_send_and_commit_rotates_txn() -> Result<()> {
    let (broker, connection) = TestBroker::start_connected();
    let session = connection.create_session(true, AckMode::Auto, ReceiveMode::Sync)?;
    assert!(session.is_transacted());
    let first_txn = session.transaction_id();
    assert_ne!(first_txn, 0);

    let dest = session.create_destination("orders", DestinationKind::Queue)?;
    let producer = session.create_producer_for(&dest)?;

    let mut message = Message::new_text();
    message.set_text("in-txn")?;
    producer.send(&mut message)?;

    broker.wait_until("send arrives", || {
        !broker.state.sends.lock().unwrap().is_empty()
    });
    {
        let sends = broker.state.sends.lock().unwrap();
        assert_eq!(sends[0].transaction_id(), first_txn);
    }

    session.commit()?;
    assert_eq!(*broker.state.committed.lock().unwrap(), vec![first_txn]);

    let second_txn = session.transaction_id();
    assert_ne!(second_txn, first_txn);
    assert_ne!(second_txn, 0);
    Ok(())
}

/// Deliveries on a transacted session are acknowledged into the open
/// transaction as they are received.
#[test]
fn transacted_receive_acks_into_txn() -> Result<()> {
    let (broker, connection) = TestBroker::start_connected();
    let session = connection.create_session(true, AckMode::Auto, ReceiveMode::Sync)?;
    let dest = session.create_destination("orders", DestinationKind::Queue)?;
    let consumer = session.create_consumer(&dest, None)?;
    connection.start()?;

    let txn = session.transaction_id();
    let delivered = broker.deliver_text(consumer.consumer_id(), "m");
    consumer.receive_with_timeout(Duration::from_secs(2))?;

    let acks = broker.state.acks.lock().unwrap();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].transaction_id, txn);
    assert_eq!(acks[0].entries[0].sys_message_id, delivered);
    Ok(())
}

/// Rollback aborts the transaction at the broker, replays prefetched
/// messages flagged redelivered, and rotates the transaction id.
#[test]
fn rollback_redelivers_and_rotates_txn() -> Result<()> {
    let (broker, connection) = TestBroker::start_connected();
    let session = connection.create_session(true, AckMode::Auto, ReceiveMode::Sync)?;
    let dest = session.create_destination("orders", DestinationKind::Queue)?;
    let consumer = session.create_consumer(&dest, None)?;
    connection.start()?;

    let first_txn = session.transaction_id();
    broker.deliver_text(consumer.consumer_id(), "m0");
    let prefetched = broker.deliver_text(consumer.consumer_id(), "m1");
    consumer.receive_with_timeout(Duration::from_secs(2))?;
    // Let the read channel finish enqueueing the prefetched message.
    std::thread::sleep(Duration::from_millis(50));

    session.rollback()?;
    assert_eq!(*broker.state.rolled_back.lock().unwrap(), vec![first_txn]);
    assert_ne!(session.transaction_id(), first_txn);

    // The message still sitting in the prefetch queue replays flagged
    // redelivered.
    let replay = consumer.receive_with_timeout(Duration::from_secs(2))?;
    assert_eq!(replay.sys_message_id(), prefetched);
    assert!(replay.redelivered());
    Ok(())
}

/// Transaction operations are rejected on non-transacted sessions.
#[test]
fn commit_requires_transacted_session() -> Result<()> {
    let (_broker, connection) = TestBroker::start_connected();
    let session = connection.create_session(false, AckMode::Auto, ReceiveMode::Sync)?;
    assert!(matches!(session.commit(), Err(MqError::NotTransactedSession)));
    assert!(matches!(
        session.rollback(),
        Err(MqError::NotTransactedSession)
    ));
    Ok(())
}

/// Requesting a non-transacted session with the TRANSACTED ack mode is
/// an argument error.
#[test]
fn transacted_ack_mode_requires_transacted_session() -> Result<()> {
    let (_broker, connection) = TestBroker::start_connected();
    assert!(matches!(
        connection.create_session(false, AckMode::Transacted, ReceiveMode::Sync),
        Err(MqError::InvalidAckMode)
    ));
    Ok(())
}

/// XA sessions leave transaction completion to the coordinator: local
/// commit and rollback are refused, and the delivery hooks run around
/// every async dispatch.
#[test]
fn xa_session_hooks_and_local_completion() -> Result<()> {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    let (broker, connection) = TestBroker::start_connected();

    let before = Arc::new(AtomicU32::new(0));
    let after = Arc::new(AtomicU32::new(0));
    let callbacks = openmq_client::XaCallbacks {
        before: {
            let before = before.clone();
            Box::new(move |_| {
                before.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        },
        after: {
            let after = after.clone();
            Box::new(move |_, outcome| {
                assert!(outcome.is_ok());
                after.fetch_add(1, Ordering::SeqCst);
            })
        },
    };
    let session = connection.create_xa_session(ReceiveMode::Async, callbacks)?;
    assert!(session.is_xa());
    assert!(session.is_transacted());

    assert!(matches!(session.commit(), Err(MqError::TransactedSession)));
    assert!(matches!(session.rollback(), Err(MqError::TransactedSession)));

    let dest = session.create_destination("orders", DestinationKind::Topic)?;
    let consumer = session.create_consumer(&dest, Some(Box::new(|_| Ok(()))))?;
    connection.start()?;

    broker.deliver_text(consumer.consumer_id(), "m");
    broker.wait_until("xa hooks", || {
        before.load(Ordering::SeqCst) == 1 && after.load(Ordering::SeqCst) == 1
    });
    Ok(())
}
