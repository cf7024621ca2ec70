//! Time-window parsing and timestamp rendering.
//!
//! Windows are given as `yyyy/MM/dd.hh:mm:ss[-yyyy/MM/dd.hh:mm:ss]`; a single
//! timestamp is an open-ended window.  All timestamps are interpreted as UTC
//! so runs are reproducible across hosts.

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDateTime};

const TIME_FORMAT: &str = "%Y/%m/%d.%H:%M:%S";

fn parse_one(s: &str) -> Result<u32> {
    let dt = NaiveDateTime::parse_from_str(s, TIME_FORMAT)
        .map_err(|_| anyhow!("invalid time '{}', expected yyyy/MM/dd.hh:mm:ss", s))?;
    let secs = dt.and_utc().timestamp();
    u32::try_from(secs).map_err(|_| anyhow!("time '{}' out of range", s))
}

/// Parse a time window.  Returns `(start, end)` in epoch seconds; a missing
/// end means "until the end of time".
pub fn scan_time_frame(tstring: &str) -> Result<(u32, u32)> {
    match tstring.split_once('-') {
        Some((a, b)) => {
            let start = parse_one(a.trim())?;
            let end = parse_one(b.trim())?;
            if end < start {
                return Err(anyhow!("time window ends before it starts"));
            }
            Ok((start, end))
        }
        None => Ok((parse_one(tstring.trim())?, u32::MAX)),
    }
}

/// Render an epoch timestamp with millisecond precision.
pub fn format_ts(secs: u32, msec: u16) -> String {
    match DateTime::from_timestamp(secs as i64, 0) {
        Some(dt) => format!("{}.{:03}", dt.format("%Y-%m-%d %H:%M:%S"), msec),
        None => format!("{}.{:03}", secs, msec),
    }
}

/// The processed time window for the run footer.
pub fn time_string(first: u32, last: u32) -> String {
    if first == u32::MAX || last == 0 {
        return "<no records>".to_owned();
    }
    format!("{} - {}", format_ts(first, 0), format_ts(last, 0))
}
