//! Scheduling instants and the legacy date/time pair.
//!
//! Requests store a single `scheduledDateTime` instant. Older documents carry a
//! locale-formatted `scheduledDate` ("March 4, 2024") plus `scheduledTime`
//! ("09:30 AM"); those are migrated here on decode and read as UTC.

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::{HandymanError, Result};

const LEGACY_FORMAT: &str = "%B %d, %Y %I:%M %p";
const SCHEDULED_DISPLAY_FORMAT: &str = "%b %d, %Y at %I:00 %p";
const TIMESTAMP_DISPLAY_FORMAT: &str = "%b %d, %Y, %I:%M %p";

/// Combine a legacy `scheduledDate` + `scheduledTime` pair into an instant.
pub fn parse_legacy_schedule(date: &str, time: &str) -> Result<DateTime<Utc>> {
    let combined = format!("{} {}", date.trim(), time.trim().to_ascii_uppercase());
    NaiveDateTime::parse_from_str(&combined, LEGACY_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| {
            HandymanError::Validation(format!(
                "unparseable legacy schedule '{}' '{}': {}",
                date, time, e
            ))
        })
}

/// Legacy pair for an instant, the inverse of [`parse_legacy_schedule`].
pub fn to_legacy_schedule(at: DateTime<Utc>) -> (String, String) {
    (
        at.format("%B %-d, %Y").to_string(),
        at.format("%I:%M %p").to_string(),
    )
}

/// "Mar 04, 2024 at 09:00 AM". Hour granularity, as shown on request cards.
pub fn format_scheduled(at: DateTime<Utc>) -> String {
    at.format(SCHEDULED_DISPLAY_FORMAT).to_string()
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_DISPLAY_FORMAT).to_string()
}
