//! Presence publisher: interval touches, pauses and the heartbeat channel.

mod common;

use common::*;
use realtime_sync::{
    ActivityKind, MemoryTransport, NetworkState, PresenceOptions, PresencePublisher,
    PresenceState, RealtimeContext, RealtimeError, RealtimeTimeouts, SessionContext, Visibility,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn presence_ctx(
    transport: &MemoryTransport,
    api: &Arc<MockPresenceApi>,
    session: SessionContext,
) -> RealtimeContext {
    RealtimeContext::builder(Arc::new(transport.clone()))
        .session(session)
        .timeouts(RealtimeTimeouts::for_testing())
        .presence_api(api.clone())
        .build()
}

#[tokio::test(start_paused = true)]
async fn test_touches_on_mount_and_every_interval() {
    let transport = MemoryTransport::new();
    let api = MockPresenceApi::new();
    let ctx = presence_ctx(&transport, &api, SessionContext::signed_in(user()));
    let mounted_at = Instant::now();

    let presence = PresencePublisher::mount(&ctx, PresenceOptions::default()).unwrap();
    settle().await;
    assert_eq!(presence.state(), PresenceState::Publishing);
    assert_eq!(api.calls(), 1);

    advance(Duration::from_secs(95)).await;
    let offsets: Vec<u64> = api
        .call_times()
        .iter()
        .map(|at| (*at - mounted_at).as_secs())
        .collect();
    assert_eq!(offsets, vec![0, 30, 60, 90]);
    assert!(api.users().iter().all(|user| user == USER_ID));
}

#[tokio::test(start_paused = true)]
async fn test_hidden_pauses_and_visible_touches_immediately() {
    let transport = MemoryTransport::new();
    let api = MockPresenceApi::new();
    let ctx = presence_ctx(&transport, &api, SessionContext::signed_in(user()));
    let presence = PresencePublisher::mount(&ctx, PresenceOptions::default()).unwrap();
    settle().await;

    ctx.signals().set_visibility(Visibility::Hidden);
    settle().await;
    assert_eq!(presence.state(), PresenceState::PausedHidden);

    advance(Duration::from_secs(120)).await;
    assert_eq!(api.calls(), 1);

    ctx.signals().set_visibility(Visibility::Visible);
    settle().await;
    assert_eq!(presence.state(), PresenceState::Publishing);
    assert_eq!(api.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_visible_after_long_hidden_resumes_publishing() {
    let transport = MemoryTransport::new();
    let api = MockPresenceApi::new();
    let ctx = presence_ctx(&transport, &api, SessionContext::signed_in(user()));
    let presence = PresencePublisher::mount(&ctx, PresenceOptions::default()).unwrap();
    settle().await;

    // Hidden for longer than the 5 minute inactivity window
    ctx.signals().set_visibility(Visibility::Hidden);
    advance(Duration::from_secs(360)).await;
    assert_eq!(presence.state(), PresenceState::PausedHidden);
    assert_eq!(api.calls(), 1);

    ctx.signals().set_visibility(Visibility::Visible);
    settle().await;
    assert_eq!(presence.state(), PresenceState::Publishing);
    assert_eq!(api.calls(), 2);

    advance(Duration::from_secs(61)).await;
    assert_eq!(presence.state(), PresenceState::Publishing);
    assert_eq!(api.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_online_after_long_offline_resumes_publishing() {
    let transport = MemoryTransport::new();
    let api = MockPresenceApi::new();
    let ctx = presence_ctx(&transport, &api, SessionContext::signed_in(user()));
    let presence = PresencePublisher::mount(&ctx, PresenceOptions::default()).unwrap();
    settle().await;

    ctx.signals().set_network(NetworkState::Offline);
    advance(Duration::from_secs(360)).await;
    assert_eq!(presence.state(), PresenceState::PausedOffline);

    ctx.signals().set_network(NetworkState::Online);
    settle().await;
    assert_eq!(presence.state(), PresenceState::Publishing);
    assert_eq!(api.calls(), 2);

    // The watchdog restarts from the moment publishing resumed
    advance(Duration::from_secs(299)).await;
    assert_eq!(presence.state(), PresenceState::Publishing);
    advance(Duration::from_secs(2)).await;
    assert_eq!(presence.state(), PresenceState::PausedInactive);
}

#[tokio::test(start_paused = true)]
async fn test_visible_clears_inactivity() {
    let transport = MemoryTransport::new();
    let api = MockPresenceApi::new();
    let ctx = presence_ctx(&transport, &api, SessionContext::signed_in(user()));
    let presence = PresencePublisher::mount(&ctx, PresenceOptions::default()).unwrap();
    settle().await;

    advance(Duration::from_secs(301)).await;
    assert_eq!(presence.state(), PresenceState::PausedInactive);
    let paused_calls = api.calls();

    ctx.signals().set_visibility(Visibility::Hidden);
    advance(Duration::from_secs(30)).await;
    ctx.signals().set_visibility(Visibility::Visible);
    settle().await;
    assert_eq!(presence.state(), PresenceState::Publishing);
    assert_eq!(api.calls(), paused_calls + 1);
}

#[tokio::test(start_paused = true)]
async fn test_offline_pauses_until_online() {
    let transport = MemoryTransport::new();
    let api = MockPresenceApi::new();
    let ctx = presence_ctx(&transport, &api, SessionContext::signed_in(user()));
    let presence = PresencePublisher::mount(&ctx, PresenceOptions::default()).unwrap();
    settle().await;

    ctx.signals().set_network(NetworkState::Offline);
    advance(Duration::from_secs(90)).await;
    assert_eq!(presence.state(), PresenceState::PausedOffline);
    assert_eq!(api.calls(), 1);

    ctx.signals().set_network(NetworkState::Online);
    settle().await;
    assert_eq!(presence.state(), PresenceState::Publishing);
    assert_eq!(api.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_inactivity_pauses_and_input_resumes() {
    let transport = MemoryTransport::new();
    let api = MockPresenceApi::new();
    let ctx = presence_ctx(&transport, &api, SessionContext::signed_in(user()));
    let presence = PresencePublisher::mount(&ctx, PresenceOptions::default()).unwrap();
    settle().await;

    // Input at 4 minutes pushes the watchdog to 9 minutes
    advance(Duration::from_secs(240)).await;
    ctx.signals().record_activity(ActivityKind::Keyboard);
    advance(Duration::from_secs(200)).await;
    assert_eq!(presence.state(), PresenceState::Publishing);

    advance(Duration::from_secs(101)).await;
    assert_eq!(presence.state(), PresenceState::PausedInactive);
    let paused_calls = api.calls();

    advance(Duration::from_secs(600)).await;
    assert_eq!(api.calls(), paused_calls);

    ctx.signals().record_activity(ActivityKind::Pointer);
    settle().await;
    assert_eq!(presence.state(), PresenceState::Publishing);
    assert_eq!(api.calls(), paused_calls + 1);
}

#[tokio::test(start_paused = true)]
async fn test_unauthenticated_touch_is_silent() {
    let transport = MemoryTransport::new();
    let api = MockPresenceApi::new();
    api.push_result(Err(RealtimeError::Unauthenticated));
    let ctx = presence_ctx(&transport, &api, SessionContext::signed_in(user()));
    let presence = PresencePublisher::mount(&ctx, PresenceOptions::default()).unwrap();

    advance(Duration::from_secs(29)).await;
    assert_eq!(api.calls(), 1);
    assert_eq!(presence.state(), PresenceState::Publishing);

    advance(Duration::from_secs(1)).await;
    assert_eq!(api.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_touch_retries_with_backoff() {
    let transport = MemoryTransport::new();
    let api = MockPresenceApi::new();
    let unavailable = || RealtimeError::ServerError {
        status_code: 503,
        message: "Service Unavailable".into(),
    };
    api.push_result(Err(unavailable()));
    api.push_result(Err(unavailable()));
    let ctx = presence_ctx(&transport, &api, SessionContext::signed_in(user()));
    let _presence = PresencePublisher::mount(&ctx, PresenceOptions::default()).unwrap();

    advance(Duration::from_secs(6)).await;
    let times = api.call_times();
    assert_eq!(times.len(), 3);
    let first_gap = times[1] - times[0];
    let second_gap = times[2] - times[1];
    assert!(first_gap >= Duration::from_secs(1) && first_gap <= Duration::from_secs(2));
    assert!(second_gap >= Duration::from_secs(2) && second_gap <= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_waits_for_ready_identity() {
    let transport = MemoryTransport::new();
    let api = MockPresenceApi::new();
    let session = SessionContext::new();
    let ctx = presence_ctx(&transport, &api, session.clone());
    let presence = PresencePublisher::mount(&ctx, PresenceOptions::default()).unwrap();

    advance(Duration::from_secs(60)).await;
    assert_eq!(presence.state(), PresenceState::SignedOut);
    assert_eq!(api.calls(), 0);

    session.sign_in(user());
    settle().await;
    assert_eq!(presence.state(), PresenceState::Publishing);
    assert_eq!(api.users(), vec![USER_ID.to_string()]);

    session.sign_out();
    advance(Duration::from_secs(60)).await;
    assert_eq!(presence.state(), PresenceState::SignedOut);
    assert_eq!(api.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_mount_requires_presence_api() {
    let transport = MemoryTransport::new();
    let ctx = signed_in_ctx(&transport);
    let err = PresencePublisher::mount(&ctx, PresenceOptions::default()).unwrap_err();
    assert!(matches!(err, RealtimeError::ConfigurationError(_)));
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_channel_broadcasts_and_reports_others() {
    let transport = MemoryTransport::new();
    let api = MockPresenceApi::new();
    let ctx = presence_ctx(&transport, &api, SessionContext::signed_in(user()));
    let heard: Recorder<(String, i64)> = Recorder::new();
    let sink = heard.clone();
    let options = PresenceOptions::default()
        .channel("presence:org1")
        .on_heartbeat(move |user_id, ts| sink.push((user_id, ts)));
    let presence = PresencePublisher::mount(&ctx, options).unwrap();
    settle().await;

    advance(Duration::from_secs(30)).await;
    let heartbeats: Vec<_> = transport
        .sent_broadcasts()
        .into_iter()
        .filter(|sent| sent.topic == "presence:org1" && sent.event == "heartbeat")
        .collect();
    assert!(!heartbeats.is_empty());
    assert_eq!(heartbeats[0].payload["userId"], json!(USER_ID));

    transport.publish_broadcast(
        "presence:org1",
        "heartbeat",
        json!({"userId": USER_ID, "ts": 1}),
    );
    transport.publish_broadcast(
        "presence:org1",
        "heartbeat",
        json!({"userId": "u2", "ts": 1_700_000_000_000i64}),
    );
    settle().await;
    assert_eq!(heard.items(), vec![("u2".to_string(), 1_700_000_000_000)]);

    let coordinator = presence.heartbeat_coordinator().unwrap();
    ctx.signals().set_visibility(Visibility::Hidden);
    settle().await;
    assert_eq!(coordinator.state(), realtime_sync::LifecycleState::Idle);
    assert_eq!(transport.member_count("presence:org1"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_close_stops_everything() {
    let transport = MemoryTransport::new();
    let api = MockPresenceApi::new();
    let ctx = presence_ctx(&transport, &api, SessionContext::signed_in(user()));
    let presence =
        PresencePublisher::mount(&ctx, PresenceOptions::default().channel("presence:org1"))
            .unwrap();
    settle().await;

    presence.close();
    presence.close();
    let calls = api.calls();
    ctx.signals().record_activity(ActivityKind::Scroll);
    ctx.signals().set_visibility(Visibility::Hidden);
    ctx.signals().set_visibility(Visibility::Visible);
    advance(Duration::from_secs(120)).await;

    assert_eq!(api.calls(), calls);
    assert_eq!(presence.state(), PresenceState::Closed);
    assert_eq!(transport.member_count("presence:org1"), 0);
}
