use std::sync::Arc;
use std::time::Duration;

use flowdock_client::model::{FlowRecord, UserRecord};
use flowdock_client::periodic::MIN_PERIOD;
use flowdock_client::test_support::{flow_json, message_frame, FakeStreamTransport};
use flowdock_client::{
    ClientError, EntityCache, FlowId, MessageKind, StreamEvent, StreamSession, TransportError,
    UserId,
};
use serde_json::json;
use tokio::sync::{broadcast, RwLock};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

fn cache_with_flows(ids: &[&str]) -> Arc<RwLock<EntityCache>> {
    let mut cache = EntityCache::new();
    for id in ids {
        let mut record: FlowRecord =
            serde_json::from_value(flow_json(id, 1, false, true)).expect("flow fixture");
        record.users = Some(vec![UserRecord::new(7, "Ada")]);
        cache.upsert_flow(&record).expect("flow cached");
    }
    Arc::new(RwLock::new(cache))
}

fn session(
    transport: &Arc<FakeStreamTransport>,
    cache: &Arc<RwLock<EntityCache>>,
) -> StreamSession {
    StreamSession::new(transport.clone(), Arc::clone(cache), RECONNECT_DELAY)
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

async fn next_event(events: &mut broadcast::Receiver<StreamEvent>) -> StreamEvent {
    tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("stream event within a second")
        .expect("stream channel open")
}

#[tokio::test(start_paused = true)]
async fn frames_resolve_sender_and_flow_through_the_cache() {
    let transport = FakeStreamTransport::new();
    let cache = cache_with_flows(&["f1"]);
    let stream = session(&transport, &cache);
    let mut events = stream.subscribe();

    let bound = stream.connect(Some(vec![FlowId::from("f1")])).await.unwrap();
    assert_eq!(bound, vec![FlowId::from("f1")]);

    let connection = transport.latest().expect("connection opened");
    assert_eq!(connection.flows, vec![FlowId::from("f1")]);
    assert!(connection.push(message_frame("f1", 7, "message", json!("hello"))));

    match next_event(&mut events).await {
        StreamEvent::Message(frame) => {
            assert_eq!(frame.kind, MessageKind::Message);
            assert_eq!(frame.message.content_text(), Some("hello"));
            assert_eq!(frame.message.user.as_ref().map(|u| u.id), Some(UserId(7)));
            assert_eq!(
                frame.message.flow.as_ref().map(|f| f.id.clone()),
                Some(FlowId::from("f1"))
            );
            assert_eq!(frame.raw["content"], "hello");
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn default_binding_is_a_snapshot_of_cached_flows() {
    let transport = FakeStreamTransport::new();
    let cache = cache_with_flows(&["f2", "f1"]);
    let stream = session(&transport, &cache);

    let bound = stream.connect(None).await.unwrap();
    assert_eq!(bound, vec![FlowId::from("f1"), FlowId::from("f2")]);

    let record: FlowRecord = serde_json::from_value(flow_json("f3", 1, true, true)).unwrap();
    cache.write().await.upsert_flow(&record).unwrap();
    assert_eq!(stream.bound_flows().len(), 2);

    stream.reconnect();
    settle().await;
    assert_eq!(transport.open_count(), 2);
    assert_eq!(stream.bound_flows().len(), 3);
    assert_eq!(transport.latest().unwrap().flows.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn kind_subscription_filters_other_events() {
    let transport = FakeStreamTransport::new();
    let cache = cache_with_flows(&["f1"]);
    let stream = session(&transport, &cache);
    let mut comments = stream.subscribe_kind(MessageKind::Comment);

    stream.connect(None).await.unwrap();
    let connection = transport.latest().unwrap();
    connection.push(message_frame("f1", 7, "message", json!("chat")));
    connection.push(message_frame("f1", 7, "comment", json!({ "text": "reply" })));

    let comment = tokio::time::timeout(Duration::from_secs(1), comments.recv())
        .await
        .expect("comment delivered")
        .expect("session alive");
    assert_eq!(comment.kind, MessageKind::Comment);
    assert_eq!(comment.message.content["text"], "reply");
}

#[tokio::test(start_paused = true)]
async fn transport_error_reconnects_with_the_same_binding() {
    let transport = FakeStreamTransport::new();
    let cache = cache_with_flows(&["f1", "f2"]);
    let stream = session(&transport, &cache);
    let mut events = stream.subscribe();

    stream.connect(Some(vec![FlowId::from("f2")])).await.unwrap();
    let first = transport.latest().unwrap();
    first.fail(TransportError::Other("connection reset".into()));

    match next_event(&mut events).await {
        StreamEvent::Error(message) => assert!(message.contains("connection reset")),
        other => panic!("unexpected event {other:?}"),
    }
    settle().await;

    assert_eq!(transport.open_count(), 2);
    assert_eq!(transport.latest().unwrap().flows, vec![FlowId::from("f2")]);
    assert!(first.is_closed());
    assert!(stream.is_connected());
}

#[tokio::test(start_paused = true)]
async fn failed_reopen_retries_after_the_delay() {
    let transport = FakeStreamTransport::new();
    let cache = cache_with_flows(&["f1"]);
    let stream = session(&transport, &cache);
    let mut events = stream.subscribe();

    stream.connect(None).await.unwrap();
    transport.fail_next_opens(2);
    transport.latest().unwrap().fail(TransportError::StreamClosed);

    assert!(matches!(next_event(&mut events).await, StreamEvent::Error(_)));
    assert!(matches!(next_event(&mut events).await, StreamEvent::Error(_)));
    assert_eq!(transport.attempt_count(), 2);
    assert!(!stream.is_connected());

    tokio::time::sleep(RECONNECT_DELAY + Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(transport.attempt_count(), 3);
    assert_eq!(transport.open_count(), 1);

    tokio::time::sleep(RECONNECT_DELAY + Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(transport.attempt_count(), 4);
    assert_eq!(transport.open_count(), 2);
    assert!(stream.is_connected());
}

#[tokio::test(start_paused = true)]
async fn zero_reconnect_delay_still_waits_between_attempts() {
    let transport = FakeStreamTransport::new();
    let cache = cache_with_flows(&["f1"]);
    let stream = StreamSession::new(transport.clone(), Arc::clone(&cache), Duration::ZERO);

    stream.connect(None).await.unwrap();
    transport.fail_next_opens(5);
    transport.latest().unwrap().fail(TransportError::StreamClosed);
    settle().await;
    assert_eq!(transport.attempt_count(), 2);

    tokio::time::sleep(MIN_PERIOD / 2).await;
    settle().await;
    assert_eq!(transport.attempt_count(), 2);

    tokio::time::sleep(MIN_PERIOD).await;
    settle().await;
    assert_eq!(transport.attempt_count(), 3);

    stream.disconnect();
}

#[tokio::test(start_paused = true)]
async fn malformed_frame_is_reported_without_reconnecting() {
    let transport = FakeStreamTransport::new();
    let cache = cache_with_flows(&["f1"]);
    let stream = session(&transport, &cache);
    let mut events = stream.subscribe();

    stream.connect(None).await.unwrap();
    transport.latest().unwrap().push(json!({ "event": 5 }));

    match next_event(&mut events).await {
        StreamEvent::Error(message) => assert!(message.contains("malformed")),
        other => panic!("unexpected event {other:?}"),
    }
    settle().await;
    assert_eq!(transport.open_count(), 1);
    assert!(stream.is_connected());
}

#[tokio::test]
async fn disconnect_without_a_connection_is_harmless() {
    let transport = FakeStreamTransport::new();
    let cache = cache_with_flows(&[]);
    let stream = session(&transport, &cache);

    stream.disconnect();
    stream.disconnect();
    assert!(!stream.is_connected());
    assert_eq!(transport.attempt_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn disconnect_closes_the_connection_and_stops_healing() {
    let transport = FakeStreamTransport::new();
    let cache = cache_with_flows(&["f1"]);
    let stream = session(&transport, &cache);

    stream.connect(None).await.unwrap();
    transport.fail_next_opens(1);
    transport.latest().unwrap().fail(TransportError::StreamClosed);
    settle().await;
    assert_eq!(transport.attempt_count(), 2);

    stream.disconnect();
    tokio::time::sleep(RECONNECT_DELAY * 3).await;
    settle().await;

    assert_eq!(transport.attempt_count(), 2);
    assert!(!stream.is_connected());
}

#[tokio::test(start_paused = true)]
async fn connect_replaces_the_previous_connection() {
    let transport = FakeStreamTransport::new();
    let cache = cache_with_flows(&["f1"]);
    let stream = session(&transport, &cache);

    stream.connect(None).await.unwrap();
    stream.connect(Some(vec![FlowId::from("f1")])).await.unwrap();
    settle().await;

    assert_eq!(transport.open_count(), 2);
    assert!(transport.connection(0).unwrap().is_closed());
    assert!(!transport.connection(1).unwrap().is_closed());

    stream.disconnect();
    settle().await;
    assert!(transport.connection(1).unwrap().is_closed());
}

#[tokio::test]
async fn connect_failure_is_returned_to_the_caller() {
    let transport = FakeStreamTransport::new();
    let cache = cache_with_flows(&["f1"]);
    let stream = session(&transport, &cache);
    transport.fail_next_opens(1);

    let error = stream.connect(None).await.unwrap_err();
    assert!(matches!(error, ClientError::Transport(_)));
    assert!(!stream.is_connected());
}
