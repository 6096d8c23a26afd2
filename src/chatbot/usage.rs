//! Per-model request budgets.
//!
//! Each model gets a rolling one-minute window and a calendar-day bucket.
//! Windows are reset lazily on every check or record, so a check never
//! sees counters from a window that has already ended.

use std::time::{Duration, Instant};

use chrono::NaiveDate;
use serde::Deserialize;

/// Length of the rolling minute window.
const MINUTE_WINDOW: Duration = Duration::from_secs(60);

/// A backend model with its request caps.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    /// Requests per rolling minute (None = unlimited).
    #[serde(default)]
    pub rpm: Option<u32>,
    /// Requests per calendar day (None = unlimited).
    #[serde(default)]
    pub rpd: Option<u32>,
}

impl ModelSpec {
    pub fn new(name: impl Into<String>, rpm: Option<u32>, rpd: Option<u32>) -> Self {
        Self {
            name: name.into(),
            rpm,
            rpd,
        }
    }

    pub fn unlimited(name: impl Into<String>) -> Self {
        Self::new(name, None, None)
    }
}

/// Usage counters for a single model.
#[derive(Debug, Clone, Default)]
pub struct UsageState {
    minute_window_start: Option<Instant>,
    minute_count: u32,
    day: Option<NaiveDate>,
    day_count: u32,
    cooldown_until: Option<Instant>,
    exhausted_until_day: Option<NaiveDate>,
}

/// Read-only copy of the counters, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub minute_count: u32,
    pub day_count: u32,
    pub exhausted: bool,
}

impl UsageState {
    pub fn new() -> Self {
        Self::default()
    }

    fn reset_windows(&mut self, now: Instant, today: NaiveDate) {
        match self.minute_window_start {
            Some(start) if now.saturating_duration_since(start) < MINUTE_WINDOW => {}
            _ => {
                self.minute_window_start = Some(now);
                self.minute_count = 0;
            }
        }

        self.reset_day(today);
    }

    fn reset_day(&mut self, today: NaiveDate) {
        if self.day != Some(today) {
            self.day = Some(today);
            self.day_count = 0;
            self.exhausted_until_day = None;
        }
    }

    /// Whether `spec` may be dispatched right now.
    pub fn can_use(&mut self, spec: &ModelSpec, now: Instant, today: NaiveDate) -> bool {
        self.reset_windows(now, today);

        if let Some(until) = self.cooldown_until
            && now < until
        {
            return false;
        }
        if self.exhausted_until_day == Some(today) {
            return false;
        }
        if let Some(rpm) = spec.rpm
            && self.minute_count >= rpm
        {
            return false;
        }
        if let Some(rpd) = spec.rpd
            && self.day_count >= rpd
        {
            return false;
        }
        true
    }

    /// Count one dispatched request against both windows.
    pub fn record_request(&mut self, now: Instant, today: NaiveDate) {
        self.reset_windows(now, today);
        self.minute_count = self.minute_count.saturating_add(1);
        self.day_count = self.day_count.saturating_add(1);
    }

    /// Block the model until the calendar day changes.
    pub fn mark_exhausted(&mut self, today: NaiveDate) {
        self.reset_day(today);
        self.exhausted_until_day = Some(today);
    }

    /// Block the model until `until` (monotonic).
    pub fn set_cooldown(&mut self, until: Instant) {
        self.cooldown_until = Some(until);
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            minute_count: self.minute_count,
            day_count: self.day_count,
            exhausted: self.exhausted_until_day.is_some() && self.exhausted_until_day == self.day,
        }
    }
}
