//! Reconnect schedule under repeated session failures, on a paused clock


use lockbridge::bridge::ConnectionState;
use lockbridge::device::{DeviceSession, LockAction};
use lockbridge::protocol::InboundMessage;
use lockbridge::testing::{MockBus, MockSession};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{identity, supervisor, wait_for_state};

fn attempt_gaps(session: &MockSession) -> Vec<Duration> {
    session
        .connect_times()
        .windows(2)
        .map(|pair| pair[1] - pair[0])
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_authentication_failures_back_off_up_to_cap() {
    let session = Arc::new(MockSession::new());
    session.fail_authentications(true);

    let mut supervisor = supervisor(Arc::new(MockBus::new()));
    supervisor
        .start_bridge(identity("front"), Arc::clone(&session) as Arc<dyn DeviceSession>)
        .unwrap();

    let mut seen_ready = false;
    for _ in 0..160 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        seen_ready |= supervisor.connection_state("front") == Some(ConnectionState::Ready);
    }

    let gaps = attempt_gaps(&session);
    assert!(gaps.len() >= 5, "too few attempts: {gaps:?}");
    assert_eq!(gaps[0], Duration::from_millis(100));
    assert!(gaps.windows(2).all(|pair| pair[0] <= pair[1]), "{gaps:?}");
    assert!(gaps.iter().all(|gap| *gap <= Duration::from_secs(1)), "{gaps:?}");
    assert_eq!(gaps.last(), Some(&Duration::from_secs(1)));

    assert!(!seen_ready);
    assert!(session.operations().is_empty());
    assert_eq!(session.authenticate_calls(), session.connect_calls());

    supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_successful_session_resets_backoff() {
    let session = Arc::new(MockSession::new());
    session.fail_next_connects(4);

    let mut supervisor = supervisor(Arc::new(MockBus::new()));
    supervisor
        .start_bridge(identity("front"), Arc::clone(&session) as Arc<dyn DeviceSession>)
        .unwrap();
    wait_for_state(&supervisor, "front", ConnectionState::Ready).await;
    assert_eq!(
        attempt_gaps(&session),
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400),
            Duration::from_millis(800),
        ]
    );

    session.fail_next_connects(1);
    session.drop_connection("link supervision timeout");
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(
        supervisor.connection_state("front"),
        Some(ConnectionState::Ready)
    );

    let gaps = attempt_gaps(&session);
    assert_eq!(gaps[gaps.len() - 1], Duration::from_millis(200));
    assert_eq!(session.connect_calls(), 7);

    supervisor.route(&InboundMessage::new("sesame/front/set", "LOCK"));
    assert_eq!(session.wait_for_operations(1).await, vec![LockAction::Lock]);

    supervisor.shutdown().await;
}
