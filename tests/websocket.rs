//! WebSocket transport against a loopback Phoenix-style server.

mod common;

use common::*;
use futures_util::{SinkExt, StreamExt};
use realtime_sync::transport::TransportFrame;
use realtime_sync::{
    ChangeFeedConsumer, ChannelSpec, FilterSpec, LifecycleState, RealtimeContext,
    RealtimeTimeouts, RealtimeTransport, SessionContext, TransportSettings, TransportStatus,
    WebSocketTransport,
};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

#[derive(Clone, Copy)]
enum JoinBehavior {
    /// Acknowledge, then push one row change
    AcceptAndPush,
    Reject,
    Ignore,
}

/// Serve one socket. Every frame the client sends is forwarded to the
/// returned receiver.
async fn spawn_server(behavior: JoinBehavior) -> (String, mpsc::UnboundedReceiver<JsonValue>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        while let Some(Ok(message)) = ws.next().await {
            let Message::Text(text) = message else {
                continue;
            };
            let frame: JsonValue = serde_json::from_str(text.as_str()).unwrap();
            let _ = seen_tx.send(frame.clone());
            if frame["event"] != "phx_join" {
                continue;
            }

            let status = match behavior {
                JoinBehavior::AcceptAndPush => "ok",
                JoinBehavior::Reject => "error",
                JoinBehavior::Ignore => continue,
            };
            let reply = json!({
                "topic": frame["topic"],
                "event": "phx_reply",
                "payload": {"status": status, "response": {"reason": "unauthorized"}},
                "ref": frame["ref"],
                "join_ref": frame["join_ref"],
            });
            ws.send(Message::text(reply.to_string())).await.unwrap();

            if let JoinBehavior::AcceptAndPush = behavior {
                let push = json!({
                    "topic": frame["topic"],
                    "event": "postgres_changes",
                    "payload": {"data": {
                        "schema": "public",
                        "table": "projects",
                        "type": "INSERT",
                        "record": {"id": "p1", "status": "active"},
                    }},
                    "ref": null,
                    "join_ref": frame["join_ref"],
                });
                ws.send(Message::text(push.to_string())).await.unwrap();
            }
        }
    });

    (format!("ws://{}/socket", addr), seen_rx)
}

fn transport_for(url: &str) -> WebSocketTransport {
    WebSocketTransport::new(TransportSettings::new(url), RealtimeTimeouts::for_testing()).unwrap()
}

fn projects_spec() -> ChannelSpec {
    ChannelSpec::new("projects", vec![FilterSpec::rows("projects")])
}

async fn next_frame(channel: &mut realtime_sync::TransportChannel) -> TransportFrame {
    tokio::time::timeout(Duration::from_secs(5), channel.recv())
        .await
        .expect("frame within 5s")
        .expect("channel open")
}

async fn next_seen(seen: &mut mpsc::UnboundedReceiver<JsonValue>) -> JsonValue {
    tokio::time::timeout(Duration::from_secs(5), seen.recv())
        .await
        .expect("client frame within 5s")
        .expect("server running")
}

#[tokio::test]
async fn test_join_ack_then_payload() {
    let (url, mut seen) = spawn_server(JoinBehavior::AcceptAndPush).await;
    let transport = transport_for(&url);

    let mut channel = transport.join(projects_spec()).await.unwrap();
    assert_eq!(
        next_frame(&mut channel).await,
        TransportFrame::Status(TransportStatus::Subscribed)
    );
    match next_frame(&mut channel).await {
        TransportFrame::Payload { event, payload } => {
            assert_eq!(event, "postgres_changes");
            assert_eq!(payload["data"]["record"]["id"], "p1");
        },
        other => panic!("unexpected frame {:?}", other),
    }
    assert!(transport.is_connected());

    let join = seen.recv().await.unwrap();
    assert_eq!(join["topic"], "realtime:projects");
    assert_eq!(join["ref"], join["join_ref"]);
    let changes = &join["payload"]["config"]["postgres_changes"];
    assert_eq!(changes[0]["table"], "projects");
    assert_eq!(changes[0]["event"], "*");
    assert_eq!(join["payload"]["config"]["broadcast"]["self"], false);

    channel
        .sender()
        .broadcast("typing_start", json!({"conversationId": "c9"}))
        .await
        .unwrap();
    let sent = tokio::time::timeout(Duration::from_secs(5), seen.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sent["event"], "broadcast");
    assert_eq!(sent["payload"]["event"], "typing_start");
    assert_eq!(sent["join_ref"], join["join_ref"]);

    channel.leave();
    let leave = tokio::time::timeout(Duration::from_secs(5), seen.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(leave["event"], "phx_leave");
}

#[tokio::test]
async fn test_rejected_join_reports_channel_error() {
    let (url, _seen) = spawn_server(JoinBehavior::Reject).await;
    let transport = transport_for(&url);

    let mut channel = transport.join(projects_spec()).await.unwrap();
    assert_eq!(
        next_frame(&mut channel).await,
        TransportFrame::Status(TransportStatus::ChannelError)
    );
}

#[tokio::test]
async fn test_unanswered_join_times_out() {
    let (url, _seen) = spawn_server(JoinBehavior::Ignore).await;
    let transport = transport_for(&url);

    let started = tokio::time::Instant::now();
    let mut channel = transport.join(projects_spec()).await.unwrap();
    assert_eq!(
        next_frame(&mut channel).await,
        TransportFrame::Status(TransportStatus::TimedOut)
    );
    assert!(started.elapsed() >= Duration::from_millis(500));
}

#[tokio::test]
async fn test_unreachable_server_fails_join() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let transport = transport_for(&format!("ws://{}/socket", addr));
    assert!(transport.join(projects_spec()).await.is_err());
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn test_change_feed_over_websocket() {
    let (url, _seen) = spawn_server(JoinBehavior::AcceptAndPush).await;
    let ctx = RealtimeContext::builder(Arc::new(transport_for(&url)))
        .session(SessionContext::signed_in(user()))
        .timeouts(RealtimeTimeouts::for_testing())
        .build();
    let (changes_tx, mut changes_rx) = mpsc::unbounded_channel();
    let feed = ChangeFeedConsumer::projects(&ctx, move |op, id| {
        let _ = changes_tx.send((op, id));
    })
    .unwrap();

    let (op, id) = tokio::time::timeout(Duration::from_secs(5), changes_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(op, realtime_sync::ChangeOp::Insert);
    assert_eq!(id, "p1");

    let mut status = feed.subscribe_status();
    tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|status| status.state == LifecycleState::Active),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(feed.status().connected);
    feed.close();
}

#[tokio::test]
async fn test_same_topic_joins_share_one_server_channel() {
    let (url, mut seen) = spawn_server(JoinBehavior::AcceptAndPush).await;
    let transport = transport_for(&url);

    let mut first = transport.join(projects_spec()).await.unwrap();
    assert_eq!(
        next_frame(&mut first).await,
        TransportFrame::Status(TransportStatus::Subscribed)
    );
    assert!(matches!(
        next_frame(&mut first).await,
        TransportFrame::Payload { .. }
    ));

    let mut second = transport.join(projects_spec()).await.unwrap();
    assert_eq!(
        next_frame(&mut second).await,
        TransportFrame::Status(TransportStatus::Subscribed)
    );

    // The first handle keeps its subscription and sees its sibling's broadcast
    second
        .sender()
        .broadcast("typing_start", json!({"userId": "u2"}))
        .await
        .unwrap();
    match next_frame(&mut first).await {
        TransportFrame::Payload { event, payload } => {
            assert_eq!(event, "broadcast");
            assert_eq!(payload["event"], "typing_start");
            assert_eq!(payload["payload"]["userId"], "u2");
        },
        other => panic!("unexpected frame {:?}", other),
    }

    assert_eq!(next_seen(&mut seen).await["event"], "phx_join");
    assert_eq!(next_seen(&mut seen).await["event"], "broadcast");

    // Leaving one handle keeps the server join alive for the other
    first.leave();
    second
        .sender()
        .broadcast("typing_stop", json!({"userId": "u2"}))
        .await
        .unwrap();
    assert_eq!(next_seen(&mut seen).await["event"], "broadcast");

    second.leave();
    assert_eq!(next_seen(&mut seen).await["event"], "phx_leave");
}

#[tokio::test]
async fn test_same_topic_with_other_filters_is_refused() {
    let (url, _seen) = spawn_server(JoinBehavior::AcceptAndPush).await;
    let transport = transport_for(&url);

    let mut first = transport.join(projects_spec()).await.unwrap();
    assert_eq!(
        next_frame(&mut first).await,
        TransportFrame::Status(TransportStatus::Subscribed)
    );

    let narrower = ChannelSpec::new(
        "projects",
        vec![FilterSpec::rows("projects").with_filter("owner_id=eq.u1")],
    );
    assert!(matches!(
        transport.join(narrower).await,
        Err(realtime_sync::RealtimeError::ConfigurationError(_))
    ));
    assert!(matches!(
        next_frame(&mut first).await,
        TransportFrame::Payload { .. }
    ));
}

#[tokio::test]
async fn test_two_feeds_on_one_topic_stay_active() {
    let (url, mut seen) = spawn_server(JoinBehavior::AcceptAndPush).await;
    let ctx = RealtimeContext::builder(Arc::new(transport_for(&url)))
        .session(SessionContext::signed_in(user()))
        .timeouts(RealtimeTimeouts::for_testing())
        .build();
    let bell = ChangeFeedConsumer::projects(&ctx, |_, _| {}).unwrap();
    let list = ChangeFeedConsumer::projects(&ctx, |_, _| {}).unwrap();

    for feed in [&bell, &list] {
        let mut status = feed.subscribe_status();
        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|status| status.state == LifecycleState::Active),
        )
        .await
        .unwrap()
        .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(bell.status().state, LifecycleState::Active);
    assert_eq!(list.status().state, LifecycleState::Active);
    assert_eq!(bell.status().reconnect_attempts, 0);

    let mut joins = 0;
    while let Ok(frame) = seen.try_recv() {
        assert_ne!(frame["event"], "phx_leave");
        if frame["event"] == "phx_join" {
            joins += 1;
        }
    }
    assert_eq!(joins, 1);

    bell.close();
    list.close();
}
