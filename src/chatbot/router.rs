//! Model selection under per-model budgets.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{Local, NaiveDate, Utc};
use chrono_tz::Tz;
use tracing::{debug, info};

use crate::chatbot::usage::{ModelSpec, UsageSnapshot, UsageState};

/// Time source for the router.
///
/// `now` drives the minute window and must be monotonic. `today` drives the
/// day bucket and follows the wall-clock calendar.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn today(&self) -> NaiveDate;
}

/// Process clock. Calendar days follow `tz`, or the local timezone if unset.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock {
    tz: Option<Tz>,
}

impl SystemClock {
    pub fn new(tz: Option<Tz>) -> Self {
        Self { tz }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn today(&self) -> NaiveDate {
        match self.tz {
            Some(tz) => Utc::now().with_timezone(&tz).date_naive(),
            None => Local::now().date_naive(),
        }
    }
}

/// Picks models from a priority list and tracks their usage.
///
/// Created once at startup and shared with every generation call.
pub struct ModelRouter {
    usage: Mutex<HashMap<String, UsageState>>,
    clock: Arc<dyn Clock>,
}

impl ModelRouter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            usage: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, UsageState>> {
        // Counters stay consistent even if a holder panicked mid-update.
        self.usage.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// First spec, in order, that is within budget. None if all are exhausted.
    pub fn pick_model(&self, specs: &[ModelSpec]) -> Option<ModelSpec> {
        let now = self.clock.now();
        let today = self.clock.today();
        let mut usage = self.lock();

        for spec in specs {
            let state = usage.entry(spec.name.clone()).or_default();
            if state.can_use(spec, now, today) {
                debug!("Picked model {}", spec.name);
                return Some(spec.clone());
            }
            debug!("Skipping model {} ({:?})", spec.name, state.snapshot());
        }

        info!(
            "No eligible model among [{}]",
            specs.iter().map(|s| s.name.as_str()).collect::<Vec<_>>().join(", ")
        );
        None
    }

    pub fn record_request(&self, spec: &ModelSpec) {
        let now = self.clock.now();
        let today = self.clock.today();
        self.lock()
            .entry(spec.name.clone())
            .or_default()
            .record_request(now, today);
    }

    pub fn mark_exhausted(&self, spec: &ModelSpec) {
        let today = self.clock.today();
        info!("Model {} exhausted for {}", spec.name, today);
        self.lock()
            .entry(spec.name.clone())
            .or_default()
            .mark_exhausted(today);
    }

    /// Calendar date the day budgets are counted against.
    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    pub fn usage(&self, name: &str) -> Option<UsageSnapshot> {
        self.lock().get(name).map(UsageState::snapshot)
    }
}

/// Stable reorder: specs whose name contains `needle` first.
pub fn prefer_family(specs: &[ModelSpec], needle: &str) -> Vec<ModelSpec> {
    let (mut preferred, rest): (Vec<_>, Vec<_>) = specs
        .iter()
        .cloned()
        .partition(|s| s.name.contains(needle));
    preferred.extend(rest);
    preferred
}
