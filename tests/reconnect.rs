//! Broker outages and recovery.

mod common;

use std::time::Duration;

use serde_json::json;

use common::{eventually, test_config, Harness, StubBackend};
use order_bridge::connection::ConnectionState;
use order_bridge::rpc::{Reply, ResponseCode};

#[tokio::test]
async fn test_bridge_recovers_after_outage() {
    let harness = Harness::start(test_config(), StubBackend::echo()).await;
    assert!(harness.call("check-status", json!({"n": 1})).await.is_success());

    harness.broker.set_reachable(false);
    assert_eq!(harness.broker.sever_connections(), 2);

    let client = harness.client.clone();
    assert!(
        eventually(Duration::from_secs(1), || {
            client.manager().state() != ConnectionState::Connected
        })
        .await
    );
    let reply = harness.call("check-status", json!({"n": 2})).await;
    assert_eq!(reply.response_code(), ResponseCode::BROKER_UNAVAILABLE);

    // Keeps retrying while the broker is down.
    let attempts = harness.broker.connect_attempts().len();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(harness.broker.connect_attempts().len() > attempts);

    harness.broker.set_reachable(true);
    let broker = harness.broker.clone();
    assert!(eventually(Duration::from_secs(2), || broker.open_connections() == 2).await);
    assert!(harness.wait_connected().await);

    let reply = harness.call("check-status", json!({"n": 3})).await;
    assert_eq!(reply, Reply::success(json!({"n": 3})));

    // One fresh subscription per queue, none left over from the old session.
    for queue in ["create-order", "check-inventory", "check-status"] {
        assert_eq!(harness.broker.consumer_count(queue), 1, "queue {queue}");
    }
}

#[tokio::test]
async fn test_shutdown_closes_sessions() {
    let harness = Harness::start(test_config(), StubBackend::echo()).await;
    assert_eq!(harness.broker.open_connections(), 2);

    let mut consumer_state = harness.consumer.subscribe_state();
    harness.shutdown.trigger();
    consumer_state
        .wait_for(|state| *state == ConnectionState::Disconnected)
        .await
        .unwrap();

    let broker = harness.broker.clone();
    assert!(eventually(Duration::from_secs(1), || broker.open_connections() == 0).await);
}
