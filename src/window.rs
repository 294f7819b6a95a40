//! Feature windows and their day ranges.
//!
//! Every window is resolved against the last day of a dataset snapshot:
//! - `30d` / `60d` / `90d`: the trailing 30, 60 or 90 days ending on that day
//! - `1yr`: the 30 days starting 364 days before that day, aligned with a
//!   30-day label period one year later

use std::fmt;
use std::str::FromStr;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const ANNIVERSARY_LOOKBACK_DAYS: u64 = 365;
const ANNIVERSARY_SPAN_DAYS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WindowKind {
    Last30Days,
    Last60Days,
    Last90Days,
    Anniversary30Days,
}

pub const ALL_WINDOWS: [WindowKind; 4] = [
    WindowKind::Last30Days,
    WindowKind::Last60Days,
    WindowKind::Last90Days,
    WindowKind::Anniversary30Days,
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WindowError {
    #[error("unsupported window definition: {0}")]
    Unsupported(String),
    #[error("window {window} cannot be resolved against last day {max_day}")]
    OutOfRange {
        window: &'static str,
        max_day: NaiveDate,
    },
}

/// Inclusive day range covered by a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl WindowRange {
    /// Calendar days in the range, independent of observed activity.
    pub fn days_in_window(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }
}

impl WindowKind {
    pub fn token(self) -> &'static str {
        match self {
            Self::Last30Days => "30d",
            Self::Last60Days => "60d",
            Self::Last90Days => "90d",
            Self::Anniversary30Days => "1yr",
        }
    }

    /// Column-name suffix that namespaces features computed over this window.
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Last30Days => "_30d",
            Self::Last60Days => "_60d",
            Self::Last90Days => "_90d",
            Self::Anniversary30Days => "_1yr",
        }
    }

    pub fn resolve(self, max_day: NaiveDate) -> Result<WindowRange, WindowError> {
        let out_of_range = || WindowError::OutOfRange {
            window: self.token(),
            max_day,
        };

        let range = match self {
            Self::Last30Days => trailing(max_day, 30),
            Self::Last60Days => trailing(max_day, 60),
            Self::Last90Days => trailing(max_day, 90),
            Self::Anniversary30Days => max_day
                .checked_sub_days(Days::new(ANNIVERSARY_LOOKBACK_DAYS - 1))
                .and_then(|start| {
                    start
                        .checked_add_days(Days::new(ANNIVERSARY_SPAN_DAYS - 1))
                        .map(|end| WindowRange { start, end })
                }),
        };

        range.ok_or_else(out_of_range)
    }
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for WindowKind {
    type Err = WindowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_window(s)
    }
}

pub fn parse_window(input: &str) -> Result<WindowKind, WindowError> {
    match input.trim() {
        "30d" => Ok(WindowKind::Last30Days),
        "60d" => Ok(WindowKind::Last60Days),
        "90d" => Ok(WindowKind::Last90Days),
        "1yr" => Ok(WindowKind::Anniversary30Days),
        other => Err(WindowError::Unsupported(other.to_string())),
    }
}

/// Parses a comma-separated list of window tokens, skipping empty entries.
pub fn parse_window_list(input: &str) -> Result<Vec<WindowKind>, WindowError> {
    let mut out = Vec::new();
    for token in input.split(',') {
        if token.trim().is_empty() {
            continue;
        }
        let window = parse_window(token)?;
        if !out.contains(&window) {
            out.push(window);
        }
    }
    Ok(out)
}

fn trailing(max_day: NaiveDate, days: u64) -> Option<WindowRange> {
    max_day
        .checked_sub_days(Days::new(days - 1))
        .map(|start| WindowRange {
            start,
            end: max_day,
        })
}
