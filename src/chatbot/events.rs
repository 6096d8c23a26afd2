//! Event details extracted from images.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use chrono_tz::Tz;
use serde::Deserialize;

/// Below this, the user is warned that the details may be wrong.
pub const LOW_CONFIDENCE: f64 = 0.5;

/// Structured event as returned by the model.
///
/// Every field is optional; an all-empty value means nothing was found.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EventDetails {
    #[serde(default)]
    pub title: Option<String>,
    /// `YYYY-MM-DD`
    #[serde(default)]
    pub date: Option<String>,
    /// `HH:MM`, absent for all-day events.
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub confidence: f64,
}

/// When an event starts.
#[derive(Debug, Clone, PartialEq)]
pub enum EventStart {
    AllDay(NaiveDate),
    At(DateTime<Tz>),
}

impl EventDetails {
    pub fn is_empty(&self) -> bool {
        self.title.as_deref().is_none_or(str::is_empty)
            && self.date.as_deref().is_none_or(str::is_empty)
    }

    pub fn is_low_confidence(&self) -> bool {
        self.confidence < LOW_CONFIDENCE
    }

    /// Resolve the start in `tz`. Errors name the offending value.
    pub fn start(&self, tz: Tz) -> Result<EventStart, String> {
        let date = self
            .date
            .as_deref()
            .filter(|d| !d.is_empty())
            .ok_or("No date found in the event data")?;
        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .map_err(|e| format!("Invalid date '{date}': {e}"))?;

        let Some(time) = self.time.as_deref().filter(|t| !t.is_empty()) else {
            return Ok(EventStart::AllDay(date));
        };
        let time = NaiveTime::parse_from_str(time, "%H:%M")
            .map_err(|e| format!("Invalid time '{time}': {e}"))?;

        tz.from_local_datetime(&NaiveDateTime::new(date, time))
            .earliest()
            .map(EventStart::At)
            .ok_or_else(|| format!("{date} {time} does not exist in {tz}"))
    }

    /// Human-readable reply for the chat.
    pub fn summary(&self, tz: Tz) -> Result<String, String> {
        let start = self.start(tz)?;
        let (date, time) = match start {
            EventStart::AllDay(d) => (d.format("%Y-%m-%d").to_string(), "All day event".to_string()),
            EventStart::At(dt) => (
                dt.format("%Y-%m-%d").to_string(),
                format!("Time: {} ({})", dt.format("%H:%M"), tz),
            ),
        };

        let mut lines = vec![
            "Event details:".to_string(),
            format!("Title: {}", self.title.as_deref().unwrap_or("Untitled")),
            format!("Date: {date}"),
            time,
            format!(
                "Location: {}",
                self.location.as_deref().unwrap_or("Not specified")
            ),
        ];
        if let Some(ref description) = self.description
            && !description.is_empty()
        {
            lines.push(format!("Description: {description}"));
        }
        Ok(lines.join("\n"))
    }
}

/// Remove a Markdown code fence around a JSON answer.
pub fn strip_markdown_to_json(text: &str) -> &str {
    let mut text = text.trim();
    if let Some(rest) = text.strip_prefix("```json") {
        text = rest;
    } else if let Some(rest) = text.strip_prefix("```") {
        text = rest;
    }
    if let Some(rest) = text.strip_suffix("```") {
        text = rest;
    }
    text.trim()
}
