//! Wall-clock adapter: epoch seconds plus a restricted timestamp parser.
//!
//! Schedule timestamps arrive as `YYYY-MM-DDTHH:MM:SS`, optionally with a
//! trailing `Z` or `±HH:MM`. The suffix is accepted but ignored: the wall
//! time is always taken at one fixed device offset, matching the server
//! that produces the schedules.

use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

/// `YYYY-MM-DDTHH:MM:SS` without any offset suffix.
const WALL_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");

/// Length of the bare wall-clock part of a timestamp.
const WALL_LEN: usize = 19;

#[derive(Debug, Error)]
pub enum TimestampError {
    #[error("expected YYYY-MM-DDTHH:MM:SS, got '{0}'")]
    BadShape(String),
    #[error("unrecognized offset suffix '{0}'")]
    BadSuffix(String),
    #[error("invalid date-time '{0}': {1}")]
    BadDateTime(String, time::error::Parse),
}

// ---------------------------------------------------------------------------
// Clock trait
// ---------------------------------------------------------------------------

pub trait Clock {
    /// Current time as epoch seconds.
    fn now(&self) -> i64;

    /// The fixed offset wall-clock timestamps are interpreted at.
    fn utc_offset(&self) -> UtcOffset;

    fn parse_timestamp(&self, text: &str) -> Result<i64, TimestampError> {
        parse_wall_clock(text, self.utc_offset())
    }
}

/// Parse a restricted ISO-8601 timestamp at a fixed offset.
///
/// Any trailing `Z` or `±HH:MM` is validated for shape and then discarded.
fn parse_wall_clock(text: &str, offset: UtcOffset) -> Result<i64, TimestampError> {
    let text = text.trim();
    if text.len() < WALL_LEN {
        return Err(TimestampError::BadShape(text.to_string()));
    }
    let (wall, suffix) = text.split_at(WALL_LEN);
    if !suffix_is_valid(suffix) {
        return Err(TimestampError::BadSuffix(suffix.to_string()));
    }

    let parsed = PrimitiveDateTime::parse(wall, WALL_FORMAT)
        .map_err(|e| TimestampError::BadDateTime(wall.to_string(), e))?;
    Ok(parsed.assume_offset(offset).unix_timestamp())
}

fn suffix_is_valid(suffix: &str) -> bool {
    if suffix.is_empty() || suffix == "Z" {
        return true;
    }
    // ±HH:MM
    let b = suffix.as_bytes();
    b.len() == 6
        && (b[0] == b'+' || b[0] == b'-')
        && b[1].is_ascii_digit()
        && b[2].is_ascii_digit()
        && b[3] == b':'
        && b[4].is_ascii_digit()
        && b[5].is_ascii_digit()
}

/// Format epoch seconds as RFC 3339 UTC, for telemetry timestamps.
pub fn iso_utc(epoch: i64) -> String {
    OffsetDateTime::from_unix_timestamp(epoch)
        .ok()
        .and_then(|dt| dt.format(&Rfc3339).ok())
        .unwrap_or_else(|| epoch.to_string())
}

// ---------------------------------------------------------------------------
// Production clock
// ---------------------------------------------------------------------------

pub struct SystemClock {
    offset: UtcOffset,
}

impl SystemClock {
    pub fn new(utc_offset_hours: i8) -> anyhow::Result<Self> {
        let offset = UtcOffset::from_hms(utc_offset_hours, 0, 0)?;
        Ok(Self { offset })
    }
}

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }

    fn utc_offset(&self) -> UtcOffset {
        self.offset
    }
}

// ---------------------------------------------------------------------------
// Test clock
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) struct FixedClock {
    pub now: std::cell::Cell<i64>,
    pub offset: UtcOffset,
}

#[cfg(test)]
impl FixedClock {
    pub(crate) fn at(now: i64) -> Self {
        Self {
            now: std::cell::Cell::new(now),
            offset: UtcOffset::UTC,
        }
    }
}

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> i64 {
        self.now.get()
    }

    fn utc_offset(&self) -> UtcOffset {
        self.offset
    }
}

// ===========================================================================
// Tests
// ===========================================================================
