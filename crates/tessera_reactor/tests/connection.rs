//! Integration tests for connection status, credentials, heartbeat and
//! network hints.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tessera_protocol::{ClientMessage, ErrorCode, ServerMessage};
use tessera_reactor::{
    ConnectionStatus, CredentialProvider, NetworkHints, NetworkListener, Reactor,
    StaticCredentials,
};
use tessera_testkit::prelude::*;

fn todos() -> tessera_codec::Value {
    query(json!({"todos": {}}))
}

fn join_tokens(transport: &RecordingTransport) -> Vec<Option<String>> {
    transport
        .sent()
        .into_iter()
        .filter_map(|m| match m {
            ClientMessage::Join { token, .. } => Some(token),
            _ => None,
        })
        .collect()
}

#[derive(Default)]
struct RotatingCredentials {
    refreshed: Mutex<Vec<String>>,
}

impl CredentialProvider for RotatingCredentials {
    fn current_token(&self) -> Option<String> {
        Some("provided".into())
    }

    fn on_refresh(&self, token: &str) {
        self.refreshed.lock().push(token.to_string());
    }
}

#[derive(Default)]
struct TestNetwork {
    hints: Mutex<Option<NetworkHints>>,
}

impl TestNetwork {
    fn set_online(&self, online: bool) {
        let hints = self.hints.lock().clone();
        if let Some(hints) = hints {
            hints.set_online(online);
        }
    }
}

impl NetworkListener for TestNetwork {
    fn watch(&self, hints: NetworkHints) {
        *self.hints.lock() = Some(hints);
    }
}

#[test]
fn status_listeners_observe_the_full_cycle() {
    let h = Harness::new();
    let statuses: Recorder<ConnectionStatus> = Recorder::new();
    let _listener = h.reactor.subscribe_connection_status(statuses.sink_owned());

    let _sub = h.reactor.subscribe_query(&todos(), |_| {}).unwrap();
    h.transport.connect_and_join();
    h.transport.drop_connection("reset");
    h.reactor.close();

    assert_eq!(
        statuses.values(),
        vec![
            ConnectionStatus::Disconnected,
            ConnectionStatus::Connecting,
            ConnectionStatus::Connected,
            ConnectionStatus::Erroring,
            ConnectionStatus::Backoff,
            ConnectionStatus::Closed,
        ]
    );
}

#[test]
fn backoff_grows_and_resets_after_join() {
    let h = Harness::new();
    let _sub = h.reactor.subscribe_query(&todos(), |_| {}).unwrap();
    let mut clock = ManualClock::new();

    h.transport.drop_connection("refused");
    let first = h.reactor.next_deadline().unwrap();
    assert_eq!(h.reactor.reconnect_attempts(), 1);
    assert!(clock.fire_next(&h.reactor));

    h.transport.drop_connection("refused");
    let second = h.reactor.next_deadline().unwrap();
    assert_eq!(h.reactor.reconnect_attempts(), 2);
    assert!(second.duration_since(first) >= Duration::from_millis(10));
    assert!(clock.fire_next(&h.reactor));

    h.transport.connect_and_join();
    assert_eq!(h.reactor.reconnect_attempts(), 0);
    assert_eq!(h.transport.connect_count(), 3);
}

#[test]
fn only_one_attempt_is_in_flight() {
    let h = Harness::new();
    let _a = h.reactor.subscribe_query(&todos(), |_| {}).unwrap();
    let _s = h.reactor.transact(vec![set_title("todos", "1", "a")]).unwrap();
    h.reactor.connect().unwrap();
    assert_eq!(h.transport.connect_count(), 1);
}

#[test]
fn late_events_from_a_replaced_session_are_ignored() {
    let h = Harness::new();
    let _sub = h.reactor.subscribe_query(&todos(), |_| {}).unwrap();
    let old = h.transport.current_session().unwrap();
    h.transport.drop_connection("reset");
    h.reactor.connect().unwrap();
    h.transport.connect_and_join();

    let stale = h.transport.events_for(old).unwrap();
    stale.frame(
        ServerMessage::Error {
            code: ErrorCode::Unauthorized,
            message: "old socket".into(),
            subscription_id: None,
        }
        .encode()
        .unwrap(),
    );
    stale.closed("late close");
    assert_eq!(h.reactor.status(), ConnectionStatus::Connected);
}

#[test]
fn send_failure_triggers_backoff() {
    let h = Harness::new();
    let _sub = h.reactor.subscribe_query(&todos(), |_| {}).unwrap();
    h.transport.connect_and_join();
    h.transport.set_fail_sends(true);
    let mut settlement = h.reactor.transact(vec![set_title("todos", "1", "a")]).unwrap();

    assert_eq!(h.reactor.status(), ConnectionStatus::Backoff);
    assert_eq!(h.reactor.pending_mutations(), 1);
    assert!(settlement.try_result().is_none());

    h.transport.set_fail_sends(false);
    let mut clock = ManualClock::new();
    assert!(clock.fire_next(&h.reactor));
    h.transport.connect_and_join();
    assert_eq!(h.transport.transacted(), vec![1]);
}

#[test]
fn unauthorized_requires_new_credential() {
    let transport = RecordingTransport::new();
    let reactor = Reactor::builder(test_config(), transport.clone())
        .with_credentials(Arc::new(StaticCredentials::new("t0")))
        .build()
        .unwrap();
    let _sub = reactor.subscribe_query(&todos(), |_| {}).unwrap();
    transport.connect_and_join();
    let _s = reactor.transact(vec![set_title("todos", "1", "a")]).unwrap();

    transport.push(&server_error(ErrorCode::Unauthorized, "token expired"));
    assert_eq!(reactor.status(), ConnectionStatus::NeedsReauth);
    assert_eq!(reactor.subscription_count(), 1);
    assert_eq!(reactor.pending_mutations(), 1);

    let mut clock = ManualClock::new();
    clock.tick(&reactor, Duration::from_secs(60));
    assert_eq!(transport.connect_count(), 1);

    reactor.set_credential(Some("t1".into())).unwrap();
    assert_eq!(transport.connect_count(), 2);
    transport.connect_and_join();
    assert_eq!(
        join_tokens(&transport),
        vec![Some("t0".to_string()), Some("t1".to_string())]
    );
    assert_eq!(reactor.status(), ConnectionStatus::Connected);
}

#[test]
fn refresh_rotates_the_stored_credential() {
    let transport = RecordingTransport::new();
    let provider = Arc::new(RotatingCredentials::default());
    let reactor = Reactor::builder(test_config(), transport.clone())
        .with_credentials(provider.clone())
        .build()
        .unwrap();
    let _sub = reactor.subscribe_query(&todos(), |_| {}).unwrap();
    transport.connect_and_join();
    transport.push(&ServerMessage::Refresh {
        token: "rotated".into(),
    });
    assert_eq!(*provider.refreshed.lock(), vec!["rotated".to_string()]);

    transport.drop_connection("reset");
    reactor.connect().unwrap();
    transport.connect_and_join();
    assert_eq!(
        join_tokens(&transport),
        vec![Some("provided".to_string()), Some("rotated".to_string())]
    );

    transport.push(&server_error(ErrorCode::Unauthorized, "revoked"));
    reactor.connect().unwrap();
    transport.open();
    assert_eq!(join_tokens(&transport).last(), Some(&Some("provided".to_string())));
}

#[test]
fn other_server_errors_keep_the_connection() {
    let h = Harness::new();
    let _sub = h.reactor.subscribe_query(&todos(), |_| {}).unwrap();
    h.transport.connect_and_join();
    h.transport.push(&server_error(ErrorCode::RateLimited, "slow down"));
    assert_eq!(h.reactor.status(), ConnectionStatus::Connected);
}

#[test]
fn missing_pong_fails_the_connection() {
    let config = test_config().with_heartbeat(Duration::from_secs(1), Duration::from_millis(500));
    let h = Harness::with_config(config);
    let mut clock = ManualClock::new();
    let _sub = h.reactor.subscribe_query(&todos(), |_| {}).unwrap();
    h.transport.connect_and_join();

    assert!(clock.fire_next(&h.reactor));
    let nonce = match h.transport.sent().last() {
        Some(ClientMessage::Ping { nonce }) => *nonce,
        other => panic!("expected ping, got {other:?}"),
    };
    h.transport.push(&ServerMessage::Pong { nonce });
    assert_eq!(h.reactor.status(), ConnectionStatus::Connected);

    assert!(clock.fire_next(&h.reactor));
    assert_eq!(h.transport.sent_kinds().last(), Some(&"ping"));
    assert!(clock.fire_next(&h.reactor));
    assert_eq!(h.reactor.status(), ConnectionStatus::Backoff);
    assert_eq!(h.reactor.reconnect_attempts(), 1);
}

#[test]
fn offline_parks_reconnects_until_online() {
    let transport = RecordingTransport::new();
    let network = Arc::new(TestNetwork::default());
    let reactor = Reactor::builder(test_config(), transport.clone())
        .with_network_listener(network.clone())
        .build()
        .unwrap();
    let _sub = reactor.subscribe_query(&todos(), |_| {}).unwrap();
    transport.connect_and_join();

    network.set_online(false);
    assert_eq!(reactor.status(), ConnectionStatus::Connected);
    transport.drop_connection("network down");
    assert_eq!(reactor.status(), ConnectionStatus::Backoff);
    assert_eq!(reactor.next_deadline(), None);

    let mut clock = ManualClock::new();
    clock.tick(&reactor, Duration::from_secs(60));
    assert_eq!(transport.connect_count(), 1);

    network.set_online(true);
    assert_eq!(transport.connect_count(), 2);
    assert_eq!(reactor.status(), ConnectionStatus::Connecting);
}

#[test]
fn starting_offline_waits_for_the_network() {
    let h = Harness::new();
    h.reactor.set_online(false);
    let _sub = h.reactor.subscribe_query(&todos(), |_| {}).unwrap();
    assert_eq!(h.reactor.status(), ConnectionStatus::Backoff);
    assert_eq!(h.transport.connect_count(), 0);

    h.reactor.set_online(true);
    assert_eq!(h.transport.connect_count(), 1);
}

#[tokio::test]
async fn status_watch_tracks_transitions() {
    let h = Harness::new();
    let mut watch = h.reactor.status_watch();
    assert_eq!(*watch.borrow(), ConnectionStatus::Disconnected);

    let _sub = h.reactor.subscribe_query(&todos(), |_| {}).unwrap();
    h.transport.connect_and_join();
    watch.changed().await.unwrap();
    assert_eq!(*watch.borrow_and_update(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn timer_driver_reconnects_after_backoff() {
    let h = Harness::new();
    let driver = h.reactor.spawn_timer_driver();
    let _sub = h.reactor.subscribe_query(&todos(), |_| {}).unwrap();
    h.transport.connect_and_join();
    h.transport.drop_connection("reset");

    for _ in 0..200 {
        if h.transport.connect_count() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.transport.connect_count(), 2);

    h.reactor.shutdown();
    tokio::time::timeout(Duration::from_secs(1), driver)
        .await
        .unwrap()
        .unwrap();
}
