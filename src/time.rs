//! Millisecond timestamps for presence records.

use chrono::Utc;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Wall clock that never goes backwards for one writer.
///
/// Stamps `operationTime` on locally produced records so last-write-wins
/// merging never prefers an older local sample after a clock step.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: i64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&mut self) -> i64 {
        self.observe(now_millis())
    }

    fn observe(&mut self, wall: i64) -> i64 {
        self.last = self.last.max(wall);
        self.last
    }
}

/// Human readable reading duration: `45s`, `3m 20s`, `2h 5m`.
pub fn format_duration_ms(ms: i64) -> String {
    let secs = ms.max(0) / 1000;
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m}m")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}
