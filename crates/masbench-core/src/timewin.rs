// Copyright (c) 2026 masbench Contributors
// SPDX-License-Identifier: Apache-2.0

//! Episode time anchors and windows.
//!
//! All time-sensitive oracle matching uses the device clock, never the host
//! clock: historical records outside `[t_start, t_end]` must not contribute
//! to a PASS. Slack tolerates emulator drift and execution latency.

use crate::device::{Deadline, DeviceControl};
use crate::error::HarnessResult;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn host_utc_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Parse epoch time from shell output into epoch milliseconds. Accepts
/// seconds (9-12 digits), milliseconds (13+ digits, coerced down) and
/// fractional seconds.
pub fn parse_epoch_time_ms(text: &str) -> Option<u64> {
    let s = text.trim();
    if s.is_empty() {
        return None;
    }
    if s.bytes().all(|b| b.is_ascii_digit()) {
        let digits = s.len();
        if digits >= 13 {
            let mut value: u64 = s.parse().ok()?;
            while value > 10u64.pow(13) {
                value /= 10;
            }
            return Some(value);
        }
        if digits >= 9 {
            let secs: u64 = s.parse().ok()?;
            return Some(secs * 1000);
        }
        return None;
    }
    if let Ok(secs) = s.parse::<f64>() {
        if secs.is_finite() && secs > 0.0 {
            return Some((secs * 1000.0) as u64);
        }
    }
    None
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeWindow {
    pub t0_ms: u64,
    pub now_ms: u64,
    pub slack_ms: u64,
    pub start_ms: u64,
    pub end_ms: u64,
}

impl TimeWindow {
    pub fn compute(t0_ms: u64, now_ms: u64, slack_ms: u64) -> Self {
        let start = t0_ms.saturating_sub(slack_ms);
        let end = now_ms.saturating_add(slack_ms);
        let (start, end) = if end < start { (end, start) } else { (start, end) };
        Self {
            t0_ms,
            now_ms,
            slack_ms,
            start_ms: start,
            end_ms: end,
        }
    }

    pub fn contains(&self, epoch_ms: u64) -> bool {
        self.start_ms <= epoch_ms && epoch_ms <= self.end_ms
    }
}

/// Episode time anchors captured at episode start.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EpisodeTime {
    pub t0_host_utc_ms: u64,
    pub t0_device_epoch_ms: Option<u64>,
    pub slack_ms: u64,
}

impl EpisodeTime {
    pub fn host_window(&self, now_host_utc_ms: u64) -> TimeWindow {
        TimeWindow::compute(self.t0_host_utc_ms, now_host_utc_ms, self.slack_ms)
    }

    /// Device-clock window. Probes the device for "now" unless supplied.
    pub fn device_window(
        &self,
        device: &mut dyn DeviceControl,
        now_device_epoch_ms: Option<u64>,
        deadline: Deadline,
    ) -> HarnessResult<Option<TimeWindow>> {
        let Some(t0) = self.t0_device_epoch_ms else {
            return Ok(None);
        };
        let now = match now_device_epoch_ms {
            Some(v) => Some(v),
            None => probe_device_epoch_time_ms(device, deadline)?,
        };
        Ok(now.map(|now| TimeWindow::compute(t0, now, self.slack_ms)))
    }
}

/// Best-effort probe of the device epoch clock: millisecond resolution
/// first, plain seconds as fallback.
pub fn probe_device_epoch_time_ms(
    device: &mut dyn DeviceControl,
    deadline: Deadline,
) -> HarnessResult<Option<u64>> {
    let out = device.run_shell("date +%s%3N", deadline.sub_deadline(1500))?;
    if out.ok() {
        if let Some(ms) = parse_epoch_time_ms(&out.stdout) {
            return Ok(Some(ms));
        }
    }
    let out = device.run_shell("date +%s", deadline.sub_deadline(1500))?;
    if out.ok() {
        return Ok(parse_epoch_time_ms(&out.stdout));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_seconds_and_millis() {
        assert_eq!(parse_epoch_time_ms("1722500000"), Some(1_722_500_000_000));
        assert_eq!(parse_epoch_time_ms("1722500000123"), Some(1_722_500_000_123));
        assert_eq!(parse_epoch_time_ms("1722500000.5"), Some(1_722_500_000_500));
        assert_eq!(parse_epoch_time_ms(""), None);
        assert_eq!(parse_epoch_time_ms("12345678"), None);
        assert_eq!(parse_epoch_time_ms("not-a-time"), None);
    }

    #[test]
    fn oversized_timestamps_coerce_to_millis() {
        let parsed = parse_epoch_time_ms("17225000001234567").expect("parsed");
        assert!(parsed <= 10u64.pow(13));
    }

    #[test]
    fn window_contains_is_inclusive() {
        let w = TimeWindow::compute(1_000, 2_000, 100);
        assert_eq!(w.start_ms, 900);
        assert_eq!(w.end_ms, 2_100);
        assert!(w.contains(900));
        assert!(w.contains(2_100));
        assert!(!w.contains(899));
        assert!(!w.contains(2_101));
    }
}
