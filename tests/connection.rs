//! Connection behaviour against a simulated device

mod common;

use std::time::Duration;

use labnode::network::{ConnectError, ConnectionManager, ConnectionOptions, ConnectionState, ReconnectPolicy, RequestError};
use labnode::protocol::{function, CorrelationId, Framing, OperationMap};
use labnode::Value;
use tokio_test::{assert_err, assert_ok};

use common::*;

#[tokio::test]
async fn test_identify() {
    let manager = ConnectionManager::default();
    let (_transport, _links, link) = connect(&manager, Framing::Cobs).await;
    assert_eq!(manager.state().await, ConnectionState::Connected);
    assert_eq!(manager.endpoint().as_deref(), Some("simulated"));

    link.serve(|request| {
        assert!(request.contains(function::GET_DEVICE_TYPE));
        assert!(request.contains(function::GET_API_VERSION));
        Some(
            OperationMap::new()
                .with(function::GET_DEVICE_TYPE, int(2))
                .with(function::GET_API_VERSION, Value::Array(vec![int(0), int(12), int(1)])),
        )
    });

    let identity = assert_ok!(manager.identify().await);
    assert_eq!(identity.device_type, 2);
    assert_eq!(identity.api_version, (0, 12, 1));

    manager.close().await;
}

#[tokio::test]
async fn test_identify_rejects_incomplete_reply() {
    let manager = ConnectionManager::default();
    let (_transport, _links, link) = connect(&manager, Framing::Cobs).await;

    link.serve(|_| Some(OperationMap::new().with(function::GET_DEVICE_TYPE, int(2))));

    let result = manager.identify().await;
    assert!(matches!(result, Err(RequestError::InvalidReply(_))));

    manager.close().await;
}

#[tokio::test]
async fn test_concurrent_requests_out_of_order() {
    let manager = ConnectionManager::default();
    let (_transport, _links, mut link) = connect(&manager, Framing::Cobs).await;

    let callers: Vec<_> = (1..=3u8)
        .map(|id| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.send_request(query(&[id]), true, None).await })
        })
        .collect();

    let mut requests = Vec::new();
    for _ in 0..3 {
        requests.push(link.recv().await.unwrap());
    }

    let ids: std::collections::HashSet<CorrelationId> = requests.iter().map(|r| r.correlation_id).collect();
    assert_eq!(ids.len(), 3);

    // Answer in reverse order
    for request in requests.iter().rev() {
        let operations = times_ten(&request.operations).unwrap();
        link.reply(request, operations).await;
    }

    for (caller, id) in callers.into_iter().zip(1..=3u8) {
        let reply = assert_ok!(caller.await.unwrap());
        assert_eq!(reply.get(op(id)), Some(&int(id as i64 * 10)));
        assert!(!reply.contains(function::REQUEST_ID));
    }

    assert_eq!(manager.pending_requests(), 0);
    let stats = manager.stats();
    assert_eq!(stats.frames_sent, 3);
    assert_eq!(stats.frames_received, 3);

    manager.close().await;
}

#[tokio::test]
async fn test_stale_reply_is_dropped() {
    let manager = ConnectionManager::default();
    let (_transport, _links, mut link) = connect(&manager, Framing::Cobs).await;

    let caller = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.send_request(query(&[5]), true, None).await })
    };

    let request = link.recv().await.unwrap();
    let foreign = CorrelationId((request.correlation_id.0 + 7) % 24);
    link.send(&reply_to(foreign, OperationMap::new().with(op(5), int(-1)))).await;
    link.reply(&request, OperationMap::new().with(op(5), int(1))).await;

    let reply = assert_ok!(caller.await.unwrap());
    assert_eq!(reply.get(op(5)), Some(&int(1)));
    assert_eq!(manager.stats().stale_replies, 1);

    manager.close().await;
}

#[tokio::test]
async fn test_timeout_does_not_affect_other_requests() {
    let manager = ConnectionManager::default();
    let (_transport, _links, link) = connect(&manager, Framing::Cobs).await;

    // Op 1 is never answered
    link.serve(|request| {
        if request.contains(op(1)) {
            None
        } else {
            times_ten(request)
        }
    });

    let slow = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .send_request(query(&[1]), true, Some(Duration::from_millis(50)))
                .await
        })
    };
    let fast = assert_ok!(manager.send_request(query(&[2]), true, None).await);
    assert_eq!(fast.get(op(2)), Some(&int(20)));

    let result = slow.await.unwrap();
    assert!(matches!(result, Err(RequestError::Timeout { .. })));
    assert_eq!(manager.pending_requests(), 0);
    assert_eq!(manager.stats().timeouts, 1);

    // The connection is still usable
    let again = assert_ok!(manager.send_request(query(&[3]), true, None).await);
    assert_eq!(again.get(op(3)), Some(&int(30)));

    manager.close().await;
}

#[tokio::test]
async fn test_connection_loss_fails_all_pending() {
    let manager = ConnectionManager::default();
    let (_transport, _links, mut link) = connect(&manager, Framing::Cobs).await;

    let callers: Vec<_> = (0..4u8)
        .map(|id| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.send_request(query(&[id]), true, Some(Duration::from_secs(10))).await })
        })
        .collect();

    for _ in 0..4 {
        link.recv().await.unwrap();
    }
    assert_eq!(manager.pending_requests(), 4);

    drop(link);

    for caller in callers {
        assert!(matches!(caller.await.unwrap(), Err(RequestError::ConnectionLost)));
    }
    assert_eq!(manager.pending_requests(), 0);

    wait_for_state(&manager, ConnectionState::Disconnected).await;
    let result = manager.send_request(query(&[1]), true, None).await;
    assert!(matches!(result, Err(RequestError::NotConnected)));
}

#[tokio::test]
async fn test_send_without_reply() {
    let manager = ConnectionManager::default();
    let (_transport, _links, mut link) = connect(&manager, Framing::Cobs).await;

    let operations = OperationMap::new().with(op(40), Value::Bool(true));
    let reply = assert_ok!(manager.send_request(operations.clone(), false, None).await);
    assert!(reply.is_empty());
    assert_eq!(manager.pending_requests(), 0);

    let request = link.recv().await.unwrap();
    assert_eq!(request.operations, operations);

    manager.close().await;
}

#[tokio::test]
async fn test_close_resolves_pending_requests() {
    let manager = ConnectionManager::default();
    let (_transport, _links, mut link) = connect(&manager, Framing::Cobs).await;

    let caller = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.send_request(query(&[9]), true, Some(Duration::from_secs(10))).await })
    };
    link.recv().await.unwrap();

    manager.close().await;
    assert_eq!(manager.state().await, ConnectionState::Disconnected);
    assert!(matches!(caller.await.unwrap(), Err(RequestError::ConnectionLost)));
    assert_eq!(manager.pending_requests(), 0);

    // The device sees the link go away
    assert!(link.recv().await.is_none());
}

#[tokio::test]
async fn test_connect_twice_rejected() {
    let manager = ConnectionManager::default();
    let (transport, _links, _link) = connect(&manager, Framing::Cobs).await;

    let result = manager.connect_with(transport.clone(), Framing::Cobs).await;
    assert!(matches!(result, Err(ConnectError::AlreadyConnected)));
    assert_eq!(transport.opens(), 1);

    manager.close().await;

    // A closed manager can connect again
    let (_transport, _links, _link) = connect(&manager, Framing::Cobs).await;
    assert!(manager.is_connected().await);
    manager.close().await;
}

#[tokio::test]
async fn test_malformed_frames_are_skipped() {
    let manager = ConnectionManager::default();
    let (_transport, _links, mut link) = connect(&manager, Framing::Cobs).await;

    let caller = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.send_request(query(&[7]), true, None).await })
    };
    let request = link.recv().await.unwrap();

    // Truncated COBS block, then a frame that is valid COBS but not CBOR
    link.send_raw(&[0x05, 0x01, 0x00]).await;
    link.send_raw(&[0x02, 0xff, 0x00]).await;
    link.reply(&request, OperationMap::new().with(op(7), int(70))).await;

    let reply = assert_ok!(caller.await.unwrap());
    assert_eq!(reply.get(op(7)), Some(&int(70)));
    assert_eq!(manager.stats().decode_errors, 2);

    manager.close().await;
}

#[tokio::test]
async fn test_reserved_key_rejected() {
    let manager = ConnectionManager::default();
    let (_transport, _links, _link) = connect(&manager, Framing::Cobs).await;

    let operations = OperationMap::new().with(function::REQUEST_ID, int(1));
    let result = manager.send_request(operations, true, None).await;
    assert!(matches!(result, Err(RequestError::Message(_))));
    assert_eq!(manager.pending_requests(), 0);

    manager.close().await;
}

#[tokio::test]
async fn test_reconnect_after_link_loss() {
    let reconnect = ReconnectPolicy::enabled().with_delays(Duration::from_millis(10), Duration::from_millis(50));
    let manager = ConnectionManager::new(ConnectionOptions::default().with_reconnect(reconnect));
    let (transport, mut links, link) = connect(&manager, Framing::Cobs).await;

    drop(link);

    let next = tokio::time::timeout(Duration::from_secs(5), links.recv()).await;
    let link = assert_ok!(next).unwrap();
    wait_for_state(&manager, ConnectionState::Connected).await;
    assert_eq!(transport.opens(), 2);

    link.serve(times_ten);
    let reply = assert_ok!(manager.send_request(query(&[4]), true, None).await);
    assert_eq!(reply.get(op(4)), Some(&int(40)));

    manager.close().await;
    assert_eq!(manager.state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_reconnect_gives_up() {
    let reconnect = ReconnectPolicy::enabled()
        .with_max_attempts(2)
        .with_delays(Duration::from_millis(5), Duration::from_millis(10));
    let manager = ConnectionManager::new(ConnectionOptions::default().with_reconnect(reconnect));
    let (transport, _links, link) = connect(&manager, Framing::Cobs).await;

    transport.refuse(true);
    drop(link);

    wait_for_state(&manager, ConnectionState::Disconnected).await;
    assert_eq!(transport.opens(), 3);

    let result = manager.send_request(query(&[1]), true, None).await;
    assert_err!(result);
}

#[tokio::test]
async fn test_small_id_space_exhaustion() {
    let options = ConnectionOptions {
        id_space: 2,
        ..Default::default()
    };
    let manager = ConnectionManager::new(options);
    let (_transport, _links, mut link) = connect(&manager, Framing::Cobs).await;

    let callers: Vec<_> = (0..2u8)
        .map(|id| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.send_request(query(&[id]), true, None).await })
        })
        .collect();
    let first = link.recv().await.unwrap();
    let second = link.recv().await.unwrap();

    let result = manager.send_request(query(&[9]), true, None).await;
    assert!(matches!(result, Err(RequestError::Exhausted)));

    link.reply(&first, OperationMap::new()).await;
    link.reply(&second, OperationMap::new()).await;
    for caller in callers {
        assert_ok!(caller.await.unwrap());
    }

    manager.close().await;
}

#[tokio::test]
async fn test_timeout_covers_blocked_write() {
    let manager = ConnectionManager::default();
    // The device never reads, so the frame cannot be written completely
    let (_transport, _links, _link) = connect(&manager, Framing::Cobs).await;

    let send = manager.send_request(blob(10_000), true, Some(Duration::from_millis(50)));
    let result = assert_ok!(tokio::time::timeout(Duration::from_secs(1), send).await);
    assert!(matches!(result, Err(RequestError::Timeout { .. })));
    assert_eq!(manager.pending_requests(), 0);
    assert_eq!(manager.stats().timeouts, 1);

    // Half a frame is stuck on the link, which is unusable from here on
    wait_for_state(&manager, ConnectionState::Disconnected).await;
    manager.close().await;
}

#[tokio::test]
async fn test_abandoned_senders_release_ids() {
    let options = ConnectionOptions {
        id_space: 2,
        request_timeout: Duration::from_secs(1),
        ..Default::default()
    };
    let manager = ConnectionManager::new(options);
    let (_transport, _links, _link) = connect(&manager, Framing::Cobs).await;

    // One caller stuck writing, one queued behind it for the write lock
    let writing = tokio::time::timeout(Duration::from_millis(100), manager.send_request(blob(10_000), true, None));
    let queued = tokio::time::timeout(Duration::from_millis(100), manager.send_request(query(&[1]), true, None));
    let (writing, queued) = tokio::join!(writing, queued);
    assert_err!(writing);
    assert_err!(queued);

    assert_eq!(manager.pending_requests(), 0);
    assert_eq!(manager.stats().frames_sent, 0);

    manager.close().await;
    assert_eq!(manager.state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_write_failure_fails_link() {
    let manager = ConnectionManager::default();
    let transport = BrokenPipeTransport::new(2);
    assert_ok!(manager.connect_with(transport, Framing::Cobs).await);

    let waiting: Vec<_> = (0..2u8)
        .map(|id| {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .send_request(query(&[id]), true, Some(Duration::from_secs(5)))
                    .await
            })
        })
        .collect();

    let written = tokio::time::timeout(Duration::from_secs(1), async {
        while manager.stats().frames_sent < 2 || manager.pending_requests() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert_ok!(written);

    // The third write hits the broken pipe
    let result = manager.send_request(query(&[9]), true, None).await;
    assert!(matches!(result, Err(RequestError::ConnectionLost)));

    for caller in waiting {
        assert!(matches!(caller.await.unwrap(), Err(RequestError::ConnectionLost)));
    }
    wait_for_state(&manager, ConnectionState::Disconnected).await;
    assert_eq!(manager.pending_requests(), 0);
    assert_eq!(manager.stats().frames_sent, 2);

    let result = manager.send_request(query(&[1]), true, None).await;
    assert!(matches!(result, Err(RequestError::NotConnected)));
}
