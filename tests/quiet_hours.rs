//! Quiet-hours gate against a mocked settings endpoint.

mod common;

use chrono::{NaiveDate, NaiveDateTime};
use common::*;
use realtime_sync::{MemoryTransport, QuietHoursGate, RealtimeContext, RealtimeError};
use std::sync::Arc;

fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
    // 2026-10-12 is a Monday
    NaiveDate::from_ymd_opt(2026, 10, day)
        .unwrap()
        .and_hms_opt(hour, minute, 0)
        .unwrap()
}

#[tokio::test]
async fn test_overnight_window_from_server_settings() {
    let api = MockQuietHoursApi::new("22:00", "06:00", &[]);
    let gate = QuietHoursGate::new(api);
    assert!(!gate.is_quiet_local(at(12, 23, 0)));

    gate.refresh().await.unwrap();
    assert!(gate.is_quiet_local(at(12, 23, 0)));
    assert!(gate.is_quiet_local(at(13, 3, 0)));
    assert!(!gate.is_quiet_local(at(13, 6, 0)));
    assert!(!gate.is_quiet_local(at(13, 10, 0)));
    assert!(gate.should_interrupt(at(13, 10, 0)));
    assert!(!gate.should_interrupt(at(12, 23, 30)));
}

#[tokio::test]
async fn test_day_list_applies_to_window_start() {
    let api = MockQuietHoursApi::new("22:00", "06:00", &["friday"]);
    let gate = QuietHoursGate::new(api);
    gate.refresh().await.unwrap();

    // Friday 2026-10-16
    assert!(gate.is_quiet_local(at(16, 22, 30)));
    assert!(gate.is_quiet_local(at(17, 5, 59)));
    assert!(!gate.is_quiet_local(at(16, 5, 0)));
    assert!(!gate.is_quiet_local(at(14, 23, 0)));
}

#[tokio::test]
async fn test_refresh_picks_up_changed_settings() {
    let api = MockQuietHoursApi::new("22:00", "06:00", &[]);
    let gate = QuietHoursGate::new(api.clone());
    gate.refresh().await.unwrap();
    assert!(gate.is_quiet_local(at(12, 23, 0)));

    api.settings.lock().enabled = false;
    let window = gate.refresh().await.unwrap();
    assert!(!window.enabled);
    assert!(!gate.is_quiet_local(at(12, 23, 0)));

    api.settings.lock().start_time = "not a time".into();
    assert!(matches!(
        gate.refresh().await,
        Err(RealtimeError::ConfigurationError(_))
    ));
    // A bad payload keeps the last good window
    assert_eq!(gate.window(), Some(window));
}

#[tokio::test]
async fn test_suppression_prefers_server_verdict() {
    let api = MockQuietHoursApi::new("22:00", "06:00", &[]);
    let gate = QuietHoursGate::new(api.clone());
    gate.refresh().await.unwrap();

    *api.server_verdict.lock() = Some(false);
    assert!(!gate.should_suppress(at(12, 23, 0)).await);

    *api.server_verdict.lock() = Some(true);
    assert!(gate.should_suppress(at(12, 12, 0)).await);

    // Unreachable server falls back to the cached window
    *api.server_verdict.lock() = None;
    assert!(gate.should_suppress(at(12, 23, 0)).await);
    assert!(!gate.should_suppress(at(12, 12, 0)).await);
    assert!(gate.is_quiet_verified().await.is_err());
}

#[tokio::test]
async fn test_gate_from_context() {
    let transport = MemoryTransport::new();
    assert!(QuietHoursGate::from_context(&signed_in_ctx(&transport)).is_err());

    let api = MockQuietHoursApi::new("08:00", "18:00", &["mon", "tue"]);
    let ctx = RealtimeContext::builder(Arc::new(transport))
        .quiet_hours_api(api)
        .build();
    let gate = QuietHoursGate::from_context(&ctx).unwrap();
    gate.refresh().await.unwrap();
    assert!(gate.is_quiet_local(at(13, 9, 0)));
    assert!(!gate.is_quiet_local(at(14, 9, 0)));
    assert!(!gate.is_quiet_local(at(13, 18, 0)));
}
