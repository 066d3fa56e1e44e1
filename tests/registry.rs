//! Channel registry seen through several consumers sharing one transport.

mod common;

use common::*;
use realtime_sync::{
    ChangeFeedConsumer, ChangeOp, ChannelState, LifecycleState, MemoryTransport, NetworkState,
    TransportStatus, Visibility,
};
use serde_json::json;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_wake_while_subscribing_does_not_rejoin() {
    let transport = MemoryTransport::new();
    transport.set_auto_ack(false);
    let ctx = signed_in_ctx(&transport);
    let feed = ChangeFeedConsumer::projects(&ctx, |_, _| {}).unwrap();
    settle().await;
    assert_eq!(feed.status().state, LifecycleState::Subscribing);

    feed.wake();
    ctx.signals().set_visibility(Visibility::Hidden);
    ctx.signals().set_visibility(Visibility::Visible);
    ctx.signals().set_network(NetworkState::Offline);
    ctx.signals().set_network(NetworkState::Online);
    advance(Duration::from_secs(10)).await;

    assert_eq!(transport.join_count("projects"), 1);
    assert_eq!(ctx.registry().live_count(), 1);

    transport.ack("projects");
    settle().await;
    assert_eq!(feed.status().state, LifecycleState::Active);
    assert_eq!(transport.join_count("projects"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_consumers_own_separate_handles() {
    let transport = MemoryTransport::new();
    let ctx = signed_in_ctx(&transport);
    let dashboard: Recorder<String> = Recorder::new();
    let sidebar: Recorder<String> = Recorder::new();

    let sink = dashboard.clone();
    let first = ChangeFeedConsumer::projects(&ctx, move |_, id| sink.push(id)).unwrap();
    let sink = sidebar.clone();
    let second = ChangeFeedConsumer::projects(&ctx, move |_, id| sink.push(id)).unwrap();
    settle().await;

    let channels = ctx.registry().list_channels();
    assert_eq!(channels.len(), 2);
    assert!(channels.iter().all(|info| info.state == ChannelState::Active));
    assert_ne!(channels[0].consumer, channels[1].consumer);
    assert_eq!(transport.member_count("projects"), 2);

    first.close();
    settle().await;
    transport.publish_row_change(
        "projects",
        "projects",
        ChangeOp::Insert,
        row(&[("id", json!("p7"))]),
    );
    settle().await;

    assert!(dashboard.items().is_empty());
    assert_eq!(sidebar.items(), vec!["p7".to_string()]);
    assert_eq!(ctx.registry().live_count(), 1);
    assert_eq!(second.status().state, LifecycleState::Active);

    let info = &ctx.registry().list_channels()[0];
    assert_eq!(info.consumer, second.coordinator().consumer());
    assert!(info.last_event_at_ms.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_stuck_join_retries_after_transport_timeout() {
    let transport = MemoryTransport::new();
    transport.set_auto_ack(false);
    let ctx = signed_in_ctx(&transport);
    let feed = ChangeFeedConsumer::projects(&ctx, |_, _| {}).unwrap();
    settle().await;

    feed.wake();
    settle().await;
    assert_eq!(transport.join_count("projects"), 1);

    transport.push_status("projects", TransportStatus::TimedOut);
    settle().await;
    assert_eq!(feed.status().state, LifecycleState::Erroring);
    assert_eq!(feed.status().reconnect_attempts, 1);

    advance(Duration::from_secs(3)).await;
    assert_eq!(transport.join_count("projects"), 2);
    assert_eq!(feed.status().state, LifecycleState::Subscribing);
}
