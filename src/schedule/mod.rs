// src/schedule/mod.rs

//! Schedule evaluation for recurring jobs.
//!
//! The supervisor only ever asks one question of a schedule: "when is the
//! next occurrence strictly after this instant?". That question is modelled
//! by the [`Schedule`] trait so jobs can be driven by a fixed clock in tests.
//!
//! - [`timespec`] provides the human-friendly schedule strings used in config
//!   files (`daily at 4:00`, `every 30m`, ...).

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::errors::Result;

pub mod timespec;

pub use timespec::Timespec;

/// "Next occurrence" function for a job.
pub trait Schedule: fmt::Debug + fmt::Display + Send + Sync {
    /// Return the first occurrence strictly after `now`.
    ///
    /// Fails with [`crate::errors::ShieldError::Schedule`] if the schedule
    /// cannot produce one.
    fn next_after(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>>;
}

/// Parse a short duration string such as `"500ms"`, `"45s"`, `"30m"`, `"2h"`.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    // Find the boundary between digits and suffix.
    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| "duration missing unit suffix".to_string())?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;
    let unit = unit_part.trim().to_lowercase();

    match unit.as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        _ => Err(format!(
            "unsupported duration unit '{}'; expected ms, s, m, or h",
            unit
        )),
    }
}
