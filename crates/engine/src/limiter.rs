//! Write throughput limiter.

use std::time::Duration;

/// Tracks bytes written (log records and cell frames) per time unit over a
/// sliding window.
///
/// Time comes from the record timestamps, not the wall clock, and is
/// treated as seconds. The window slides forward to the previous checkpoint
/// whenever it grows past `window` units.
#[derive(Debug, Clone)]
pub struct SpeedWatcher {
    max_bytes_per_sec: u64,
    window: u32,
    start: Option<(u64, u32)>,
    base_pos: u64,
    last: (u64, u32),
}

impl SpeedWatcher {
    /// `max_bytes_per_sec == 0` disables limiting. `written` is the byte
    /// count the watcher starts from.
    pub fn new(max_bytes_per_sec: u64, window: u32, written: u64) -> Self {
        Self {
            max_bytes_per_sec,
            window: window.max(1),
            start: None,
            base_pos: written,
            last: (written, 0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_bytes_per_sec > 0
    }

    /// Records that the byte count reached `written` at `time` and returns
    /// how long the writer should back off.
    pub fn check_limit(&mut self, written: u64, time: u32) -> Duration {
        if !self.is_enabled() {
            return Duration::ZERO;
        }

        let (mut start_pos, mut start_time) = *self.start.get_or_insert((self.base_pos, time));
        if time.saturating_sub(start_time) >= self.window {
            (start_pos, start_time) = self.last;
            self.start = Some(self.last);
        }
        self.last = (written, time);

        let elapsed = u64::from(time.saturating_sub(start_time).max(1));
        let written = written.saturating_sub(start_pos);
        let allowed = self.max_bytes_per_sec.saturating_mul(elapsed);
        if written <= allowed {
            return Duration::ZERO;
        }
        let excess = written - allowed;
        Duration::from_secs(excess.div_ceil(self.max_bytes_per_sec))
    }
}
