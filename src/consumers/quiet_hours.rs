//! Quiet-hours gate: decides whether a notification may interrupt the user.
//!
//! Two checks are offered. [`QuietHoursGate::is_quiet_verified`] asks the
//! server and is authoritative. [`QuietHoursGate::is_quiet_local`] evaluates
//! the cached settings against a local clock reading, so a sound or toast can
//! be suppressed without a round trip.

use chrono::{Datelike, Duration as ChronoDuration, NaiveDateTime, NaiveTime, Weekday};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

use crate::context::RealtimeContext;
use crate::error::{RealtimeError, Result};
use crate::http::QuietHoursApi;
use crate::models::QuietHoursSettings;

/// Parsed quiet-hours window.
///
/// `start == end` is an empty window. An empty day list means every day.
/// For a window that wraps past midnight, the part after midnight belongs to
/// the previous day: with `days = [Fri]` and `22:00-06:00`, Saturday 03:00 is
/// quiet and Friday 03:00 is not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuietHoursWindow {
    pub enabled: bool,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub days: Vec<Weekday>,
}

/// `"HH:MM"` (seconds are accepted and ignored).
pub fn parse_time(value: &str) -> Result<NaiveTime> {
    let trimmed = value.trim();
    NaiveTime::parse_from_str(trimmed, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M:%S"))
        .map_err(|e| {
            RealtimeError::ConfigurationError(format!("Invalid time '{}': {}", value, e))
        })
}

/// Full or three-letter English day name, any case.
pub fn parse_day(value: &str) -> Result<Weekday> {
    let day = match value.trim().to_lowercase().as_str() {
        "mon" | "monday" => Weekday::Mon,
        "tue" | "tues" | "tuesday" => Weekday::Tue,
        "wed" | "wednesday" => Weekday::Wed,
        "thu" | "thur" | "thurs" | "thursday" => Weekday::Thu,
        "fri" | "friday" => Weekday::Fri,
        "sat" | "saturday" => Weekday::Sat,
        "sun" | "sunday" => Weekday::Sun,
        _ => {
            return Err(RealtimeError::ConfigurationError(format!(
                "Unknown day '{}'",
                value
            )))
        },
    };
    Ok(day)
}

impl QuietHoursWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            enabled: true,
            start,
            end,
            days: Vec::new(),
        }
    }

    pub fn with_days(mut self, days: Vec<Weekday>) -> Self {
        self.days = days;
        self
    }

    pub fn from_settings(settings: &QuietHoursSettings) -> Result<Self> {
        let days = settings
            .days
            .iter()
            .map(|day| parse_day(day))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            enabled: settings.enabled,
            start: parse_time(&settings.start_time)?,
            end: parse_time(&settings.end_time)?,
            days,
        })
    }

    pub fn wraps_midnight(&self) -> bool {
        self.start > self.end
    }

    /// Time-of-day test, ignoring `enabled` and days.
    pub fn contains_time(&self, time: NaiveTime) -> bool {
        if self.start > self.end {
            time >= self.start || time < self.end
        } else {
            time >= self.start && time < self.end
        }
    }

    /// Full test: enabled, time of day and the day the window started on.
    pub fn contains(&self, at: NaiveDateTime) -> bool {
        if !self.enabled || !self.contains_time(at.time()) {
            return false;
        }
        if self.days.is_empty() {
            return true;
        }
        let day = if self.wraps_midnight() && at.time() < self.end {
            (at - ChronoDuration::days(1)).weekday()
        } else {
            at.weekday()
        };
        self.days.contains(&day)
    }
}

/// Cached quiet-hours settings plus the server check.
pub struct QuietHoursGate {
    api: Arc<dyn QuietHoursApi>,
    window: RwLock<Option<QuietHoursWindow>>,
}

impl fmt::Debug for QuietHoursGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuietHoursGate")
            .field("window", &*self.window.read())
            .finish()
    }
}

impl QuietHoursGate {
    pub fn new(api: Arc<dyn QuietHoursApi>) -> Self {
        Self {
            api,
            window: RwLock::new(None),
        }
    }

    /// Gate over the context's quiet-hours API.
    pub fn from_context(ctx: &RealtimeContext) -> Result<Self> {
        ctx.quiet_hours_api().map(Self::new).ok_or_else(|| {
            RealtimeError::ConfigurationError(
                "quiet hours require an HTTP collaborator (http.base_url)".to_string(),
            )
        })
    }

    /// Reload settings from the server and cache them.
    pub async fn refresh(&self) -> Result<QuietHoursWindow> {
        let settings = self.api.fetch_settings().await?;
        let window = QuietHoursWindow::from_settings(&settings)?;
        log::debug!(
            "[realtime-sync] quiet hours {} {}-{} on {:?}",
            if window.enabled { "enabled" } else { "disabled" },
            window.start.format("%H:%M"),
            window.end.format("%H:%M"),
            window.days
        );
        *self.window.write() = Some(window.clone());
        Ok(window)
    }

    /// Cache settings obtained elsewhere.
    pub fn set_window(&self, window: Option<QuietHoursWindow>) {
        *self.window.write() = window;
    }

    pub fn window(&self) -> Option<QuietHoursWindow> {
        self.window.read().clone()
    }

    /// Local approximation. False until settings are loaded.
    pub fn is_quiet_local(&self, now: NaiveDateTime) -> bool {
        self.window
            .read()
            .as_ref()
            .is_some_and(|window| window.contains(now))
    }

    /// [`is_quiet_local`](Self::is_quiet_local) at the current local time.
    pub fn is_quiet_local_now(&self) -> bool {
        self.is_quiet_local(chrono::Local::now().naive_local())
    }

    /// Server verdict.
    pub async fn is_quiet_verified(&self) -> Result<bool> {
        self.api.is_quiet_now().await
    }

    /// Whether to suppress a dispatched notification. Uses the server verdict
    /// and falls back to the local approximation when the server is
    /// unreachable.
    pub async fn should_suppress(&self, now: NaiveDateTime) -> bool {
        match self.is_quiet_verified().await {
            Ok(quiet) => quiet,
            Err(RealtimeError::Unauthenticated) => self.is_quiet_local(now),
            Err(e) => {
                log::warn!(
                    "[realtime-sync] quiet-hours check failed, using local settings: {}",
                    e
                );
                self.is_quiet_local(now)
            },
        }
    }

    /// Whether a sound or toast may play at `now`.
    pub fn should_interrupt(&self, now: NaiveDateTime) -> bool {
        !self.is_quiet_local(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        // 2026-10-12 is a Monday
        NaiveDate::from_ymd_opt(2026, 10, day)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn window(start: &str, end: &str) -> QuietHoursWindow {
        QuietHoursWindow::new(parse_time(start).unwrap(), parse_time(end).unwrap())
    }

    #[test]
    fn test_midnight_wrap() {
        let night = window("22:00", "06:00");
        assert!(night.wraps_midnight());
        assert!(night.contains(at(12, 23, 30)));
        assert!(night.contains(at(12, 3, 0)));
        assert!(night.contains(at(12, 22, 0)));
        assert!(!night.contains(at(12, 6, 0)));
        assert!(!night.contains(at(12, 10, 0)));
    }

    #[test]
    fn test_daytime_window() {
        let office = window("08:00", "18:00");
        assert!(office.contains(at(12, 12, 0)));
        assert!(office.contains(at(12, 8, 0)));
        assert!(!office.contains(at(12, 18, 0)));
        assert!(!office.contains(at(12, 20, 0)));
    }

    #[test]
    fn test_empty_and_disabled_windows() {
        assert!(!window("09:00", "09:00").contains(at(12, 9, 0)));
        let mut disabled = window("00:00", "23:59");
        disabled.enabled = false;
        assert!(!disabled.contains(at(12, 12, 0)));
    }

    #[test]
    fn test_days_attribute_after_midnight_to_previous_day() {
        let friday_night = window("22:00", "06:00").with_days(vec![Weekday::Fri]);
        // 2026-10-16 is a Friday
        assert!(friday_night.contains(at(16, 23, 0)));
        assert!(friday_night.contains(at(17, 3, 0)));
        assert!(!friday_night.contains(at(16, 3, 0)));
        assert!(!friday_night.contains(at(17, 23, 0)));
    }

    #[test]
    fn test_parse_settings() {
        let settings = QuietHoursSettings {
            enabled: true,
            start_time: "22:00".into(),
            end_time: "06:30".into(),
            days: vec!["Monday".into(), "tue".into(), "SUN".into()],
        };
        let parsed = QuietHoursWindow::from_settings(&settings).unwrap();
        assert_eq!(parsed.days, vec![Weekday::Mon, Weekday::Tue, Weekday::Sun]);
        assert_eq!(parsed.end, NaiveTime::from_hms_opt(6, 30, 0).unwrap());

        assert!(parse_time("25:00").is_err());
        assert!(parse_time("07:15:00").is_ok());
        assert!(parse_day("someday").is_err());
    }
}
